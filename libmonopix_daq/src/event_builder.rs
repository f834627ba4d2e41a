use ndarray::Array2;
use serde::Serialize;

use super::alignment::{build_tlu_match_table, merge_join, overflow_correct, MatchStats};
use super::config::{Config, FitFailurePolicy};
use super::constants::*;
use super::error::AlignmentError;
use super::event::{EventRecord, MonopixMatchEntry, TluMatchEntry, UNMATCHED};
use super::fit::{acceptance_window, fit_box, histogram_diffs, moments_estimate, BoxFit};
use super::hit::HitRecord;

/// External charge calibration. The library itself only knows time over
/// threshold; converting it to deposited charge is the collaborator's
/// business.
pub trait ChargeCalibration {
    fn charge(&self, col: u8, row: u16, tot: u8) -> f32;
}

/// Everything a caller needs to judge an alignment pass: per-stage match
/// accounting, the fitted offsets and whether any fit fell back to the
/// method-of-moments estimate.
#[derive(Debug, Clone, Serialize)]
pub struct AlignmentSummary {
    pub stats: Vec<MatchStats>,
    pub tlu_offset: BoxFit,
    pub le_offset: BoxFit,
    pub degraded_fit: bool,
}

impl AlignmentSummary {
    pub fn log(&self) {
        for stat in &self.stats {
            stat.log();
        }
        if self.degraded_fit {
            spdlog::warn!("offset estimation fell back to method-of-moments; run is degraded");
        }
    }
}

/// Group pixel hits into clusters by token timestamp and reconstruct each
/// hit's absolute leading-edge time.
///
/// Hits sharing a token timestamp were read out under one cluster token.
/// The hit with the smallest time over threshold anchors the cluster: its
/// trailing edge is extrapolated from the token time, and every member's
/// leading edge is placed relative to that anchor. The final cluster of
/// the stream is flushed explicitly.
pub fn reconstruct_leading_edges(pixels: &[HitRecord]) -> Vec<MonopixMatchEntry> {
    let mut entries = Vec::with_capacity(pixels.len());
    let mut start = 0;
    for i in 1..=pixels.len() {
        if i == pixels.len() || pixels[i].timestamp != pixels[start].timestamp {
            flush_cluster(&pixels[start..i], &mut entries);
            start = i;
        }
    }
    entries
}

fn flush_cluster(cluster: &[HitRecord], out: &mut Vec<MonopixMatchEntry>) {
    let token = cluster[0].timestamp;
    let anchor = cluster
        .iter()
        .min_by_key(|h| h.tot())
        .expect("clusters are never empty");
    let anchor_te = anchor.te as i64;
    let anchor_te_time = token - ((token - (anchor_te << TE_SCALE)) & TE_SUB_MASK);
    for hit in cluster {
        let le_timestamp =
            anchor_te_time - (((anchor_te - hit.le as i64) & TOT_MASK) << TE_SCALE);
        out.push(MonopixMatchEntry {
            col: hit.col,
            row: hit.row,
            le: hit.le,
            te: hit.te,
            tot: hit.tot(),
            token_timestamp: token,
            le_timestamp,
            trigger_number: UNMATCHED,
            tlu_timestamp: UNMATCHED,
            reference_timestamp: UNMATCHED,
            ambiguous: false,
        })
    }
}

/// Nearest-reference pairing used only to seed the leading-edge offset fit
fn collect_le_ref_diffs(entries: &[MonopixMatchEntry], table: &[TluMatchEntry]) -> Vec<i64> {
    let mut diffs = Vec::with_capacity(entries.len());
    if table.is_empty() {
        return diffs;
    }
    let mut cursor = 0;
    for entry in entries {
        while cursor + 1 < table.len()
            && (table[cursor + 1].reference_timestamp - entry.le_timestamp).abs()
                <= (table[cursor].reference_timestamp - entry.le_timestamp).abs()
        {
            cursor += 1;
        }
        diffs.push(entry.le_timestamp - table[cursor].reference_timestamp);
    }
    diffs
}

/// Assign each cluster hit the trigger of the TLU row whose reference time
/// falls inside the acceptance window of its leading edge.
///
/// Both sequences are monotone in time, so the table cursor only ever
/// advances. When more than one candidate sits inside the window the
/// nearest one wins and the row is flagged ambiguous, which downstream
/// becomes the event's veto flag.
pub fn assign_triggers(
    entries: &mut [MonopixMatchEntry],
    table: &[TluMatchEntry],
    window: (i64, i64),
) -> MatchStats {
    let (lo, hi) = window;
    let center = (lo + hi) / 2;
    let mut cursor = 0usize;
    let mut matched = 0usize;
    for entry in entries.iter_mut() {
        while cursor < table.len() && entry.le_timestamp - table[cursor].reference_timestamp > hi
        {
            cursor += 1;
        }
        let mut best: Option<usize> = None;
        let mut best_dist = i64::MAX;
        let mut candidates = 0usize;
        for (j, cand) in table.iter().enumerate().skip(cursor) {
            let diff = entry.le_timestamp - cand.reference_timestamp;
            if diff < lo {
                break;
            }
            candidates += 1;
            let dist = (diff - center).abs();
            if dist < best_dist {
                best_dist = dist;
                best = Some(j);
            }
        }
        if let Some(j) = best {
            entry.trigger_number = table[j].trigger_number;
            entry.tlu_timestamp = table[j].tlu_timestamp;
            entry.reference_timestamp = table[j].reference_timestamp;
            entry.ambiguous = candidates > 1;
            matched += 1;
        }
    }
    MatchStats::new("trigger assignment", matched, entries.len())
}

/// Rank the sixteen readout phases by how concentrated their time-walk
/// distribution is.
///
/// The phase is the low nibble of the reference timestamp. For each phase
/// the time-walk histogram's dominant bin is compared against its two
/// neighbors one full 40 MHz cycle away; the fraction ranks the phases,
/// 0 being the best-concentrated one.
pub fn rank_phases(entries: &[MonopixMatchEntry]) -> [u8; N_PHASES] {
    let n_bins = (DIFF_HIST_MAX - DIFF_HIST_MIN) as usize;
    let mut hists = Array2::<f64>::zeros((N_PHASES, n_bins));
    for entry in entries.iter().filter(|e| e.is_matched()) {
        let phase = (entry.reference_timestamp & PHASE_MASK) as usize;
        let d = entry.le_timestamp - entry.reference_timestamp;
        let bin = (d - DIFF_HIST_MIN).clamp(0, n_bins as i64 - 1) as usize;
        hists[[phase, bin]] += 1.0;
    }

    let mut fractions = [0.0f64; N_PHASES];
    for (phase, fraction) in fractions.iter_mut().enumerate() {
        let hist = hists.row(phase);
        let mut dominant = 0usize;
        for (bin, &h) in hist.iter().enumerate() {
            if h > hist[dominant] {
                dominant = bin;
            }
        }
        if hist[dominant] <= 0.0 {
            continue;
        }
        let mut neighborhood = hist[dominant];
        if dominant >= PHASE_NEIGHBOR_STRIDE {
            neighborhood += hist[dominant - PHASE_NEIGHBOR_STRIDE];
        }
        if dominant + PHASE_NEIGHBOR_STRIDE < n_bins {
            neighborhood += hist[dominant + PHASE_NEIGHBOR_STRIDE];
        }
        *fraction = hist[dominant] / neighborhood;
    }

    let mut order: Vec<usize> = (0..N_PHASES).collect();
    order.sort_by(|&a, &b| fractions[b].total_cmp(&fractions[a]));
    let mut quality = [0u8; N_PHASES];
    for (rank, &phase) in order.iter().enumerate() {
        quality[phase] = rank as u8;
    }
    quality
}

/// Assemble the final event rows from matched entries.
pub fn build_events(
    entries: &[MonopixMatchEntry],
    phase_quality: &[u8; N_PHASES],
    calibration: Option<&dyn ChargeCalibration>,
) -> Vec<EventRecord> {
    entries
        .iter()
        .filter(|e| e.is_matched())
        .map(|e| {
            let phase = (e.reference_timestamp & PHASE_MASK) as u8;
            let frame = (e.le_timestamp - e.reference_timestamp + FRAME_OFFSET)
                .clamp(0, u16::MAX as i64) as u16;
            let tot = e.tot as u8;
            let charge = match calibration {
                Some(cal) => cal.charge(e.col, e.row, tot),
                None => tot as f32,
            };
            EventRecord {
                event_number: e.trigger_number,
                col: e.col,
                row: e.row,
                frame,
                charge,
                tot,
                phase,
                phase_quality: phase_quality[phase as usize],
                veto_flag: e.ambiguous,
            }
        })
        .collect()
}

fn fit_with_policy(
    hist: &ndarray::Array1<f64>,
    min: i64,
    policy: FitFailurePolicy,
) -> Result<(BoxFit, bool), AlignmentError> {
    match fit_box(hist, min) {
        Ok(fit) => Ok((fit, false)),
        Err(e) => match policy {
            FitFailurePolicy::Abort => Err(AlignmentError::FitFailed(e)),
            FitFailurePolicy::Moments => {
                spdlog::warn!("box fit failed ({e}); using the method-of-moments window");
                let estimate = moments_estimate(hist, min).map_err(AlignmentError::FitFailed)?;
                Ok((estimate, true))
            }
        },
    }
}

/// Run the full alignment pipeline on a decoded hit stream.
///
/// Stages: TLU window matching, overflow correction, TLU-vs-reference
/// offset fit and cut, cluster leading-edge reconstruction, trigger
/// assignment, merge-join correlation against the TLU table and the
/// reference plane, phase ranking, event assembly. A monotonicity
/// violation aborts the pass; everything else degrades locally and is
/// accounted in the summary.
pub fn align(
    hits: &[HitRecord],
    reference_plane: &[HitRecord],
    config: &Config,
    calibration: Option<&dyn ChargeCalibration>,
) -> Result<(Vec<EventRecord>, AlignmentSummary), AlignmentError> {
    let mut stats = Vec::new();

    // Stage: window matching around every high-resolution TLU word
    let (mut table, window_stats) = build_tlu_match_table(hits, config.search_distance);
    stats.push(window_stats);
    table.retain(|e| e.is_matched());
    if table.is_empty() {
        return Err(AlignmentError::EmptyStream("tlu match table"));
    }

    // Stage: overflow correction of the wrapping counters
    let triggers: Vec<i64> = table.iter().map(|e| e.trigger_number).collect();
    let corrected = overflow_correct(&triggers, TRIGGER_WRAP_MASK, "trigger number", true)?;
    for (entry, trigger) in table.iter_mut().zip(&corrected) {
        entry.trigger_number = *trigger;
    }
    let tlu_ts: Vec<i64> = table.iter().map(|e| e.tlu_timestamp).collect();
    let corrected_ts = overflow_correct(&tlu_ts, COUNTER_TS_WRAP_MASK, "tlu timestamp", false)?;
    for (entry, ts) in table.iter_mut().zip(&corrected_ts) {
        entry.tlu_timestamp = *ts;
    }

    // Stage: robust TLU-vs-reference offset, cut rows outside the window
    let diffs: Vec<i64> = table
        .iter()
        .map(|e| e.tlu_hr_timestamp - e.reference_timestamp)
        .collect();
    let hist = histogram_diffs(&diffs, DIFF_HIST_MIN, DIFF_HIST_MAX);
    let (tlu_offset, tlu_degraded) = fit_with_policy(&hist, DIFF_HIST_MIN, config.on_fit_failure)?;
    let (lo, hi) = acceptance_window(&tlu_offset, TLU_REF_WINDOW);
    let before = table.len();
    table.retain(|e| {
        let d = e.tlu_hr_timestamp - e.reference_timestamp;
        d >= lo && d <= hi
    });
    stats.push(MatchStats::new("tlu offset window", table.len(), before));

    // Stage: cluster-token leading edge reconstruction
    let pixels: Vec<HitRecord> = hits.iter().filter(|h| h.is_pixel()).copied().collect();
    let mut entries = reconstruct_leading_edges(&pixels);

    // Stage: leading-edge-vs-reference offset and trigger assignment
    let le_diffs = collect_le_ref_diffs(&entries, &table);
    let le_hist = histogram_diffs(&le_diffs, DIFF_HIST_MIN, DIFF_HIST_MAX);
    let (le_offset, le_degraded) = fit_with_policy(&le_hist, DIFF_HIST_MIN, config.on_fit_failure)?;
    let le_window = acceptance_window(&le_offset, LE_REF_WINDOW);
    stats.push(assign_triggers(&mut entries, &table, le_window));
    entries.retain(|e| e.is_matched());

    // Stage: merge-join correlation, cursors only ever advance
    let entry_triggers: Vec<i64> = entries.iter().map(|e| e.trigger_number).collect();
    let table_triggers: Vec<i64> = table.iter().map(|e| e.trigger_number).collect();
    let pairs = merge_join(&entry_triggers, &table_triggers);
    stats.push(MatchStats::new(
        "monopix-tlu join",
        pairs.len(),
        entries.len(),
    ));
    let keep: Vec<usize> = pairs.iter().map(|&(i, _)| i).collect();
    entries = keep.iter().map(|&i| entries[i]).collect();

    if !reference_plane.is_empty() {
        let raw_keys: Vec<i64> = reference_plane.iter().map(|h| h.cnt as i64).collect();
        let ref_keys = overflow_correct(&raw_keys, TRIGGER_WRAP_MASK, "reference event number", true)?;

        let entry_triggers: Vec<i64> = entries.iter().map(|e| e.trigger_number).collect();
        let pairs = merge_join(&entry_triggers, &ref_keys);
        stats.push(MatchStats::new(
            "monopix-reference join",
            pairs.len(),
            entries.len(),
        ));
        let keep: Vec<usize> = pairs.iter().map(|&(i, _)| i).collect();
        entries = keep.iter().map(|&i| entries[i]).collect();

        let table_triggers: Vec<i64> = table.iter().map(|e| e.trigger_number).collect();
        let pairs = merge_join(&ref_keys, &table_triggers);
        stats.push(MatchStats::new(
            "reference-tlu join",
            pairs.len(),
            ref_keys.len(),
        ));
    }

    // Stage: phase quality ranking and event assembly
    let phase_quality = rank_phases(&entries);
    let events = build_events(&entries, &phase_quality, calibration);

    let summary = AlignmentSummary {
        stats,
        tlu_offset,
        le_offset,
        degraded_fit: tlu_degraded || le_degraded,
    };
    Ok((events, summary))
}

//Unit tests
#[cfg(test)]
mod tests {
    use super::*;

    fn cluster_hit(token: i64, le: u8, te: u8) -> HitRecord {
        HitRecord::pixel(10, 20, le, te, token, 0)
    }

    #[test]
    fn test_cluster_anchors_on_smallest_tot() {
        // three hits share token 1000 with ToT 4, 2, 6; the second anchors
        let hits = vec![
            cluster_hit(1000, 10, 14),
            cluster_hit(1000, 20, 22),
            cluster_hit(1000, 30, 36),
        ];
        let entries = reconstruct_leading_edges(&hits);
        assert_eq!(entries.len(), 3);

        let anchor_te = 22i64;
        let anchor_te_time = 1000 - ((1000 - (anchor_te << TE_SCALE)) & TE_SUB_MASK);
        for (entry, le) in entries.iter().zip([10i64, 20, 30]) {
            let expected = anchor_te_time - (((anchor_te - le) & TOT_MASK) << TE_SCALE);
            assert_eq!(entry.le_timestamp, expected);
            assert_eq!(entry.token_timestamp, 1000);
        }
        // the anchor's own leading edge sits one scaled ToT before its
        // extrapolated trailing edge
        assert_eq!(entries[1].le_timestamp, anchor_te_time - (2 << TE_SCALE));
    }

    #[test]
    fn test_final_cluster_is_flushed() {
        let hits = vec![
            cluster_hit(1000, 1, 2),
            cluster_hit(1000, 3, 4),
            cluster_hit(2000, 5, 6),
        ];
        let entries = reconstruct_leading_edges(&hits);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].token_timestamp, 2000);
    }

    fn table_row(trigger: i64, ts: i64) -> TluMatchEntry {
        TluMatchEntry {
            trigger_number: trigger,
            tlu_timestamp: ts,
            reference_timestamp: ts,
            tlu_hr_timestamp: ts,
        }
    }

    fn bare_entry(le_timestamp: i64) -> MonopixMatchEntry {
        MonopixMatchEntry {
            col: 0,
            row: 0,
            le: 0,
            te: 0,
            tot: 0,
            token_timestamp: le_timestamp,
            le_timestamp,
            trigger_number: UNMATCHED,
            tlu_timestamp: UNMATCHED,
            reference_timestamp: UNMATCHED,
            ambiguous: false,
        }
    }

    #[test]
    fn test_trigger_assignment_flags_ambiguity() {
        let table = vec![table_row(1, 100), table_row(2, 110), table_row(3, 500)];
        let mut entries = vec![bare_entry(105), bare_entry(505), bare_entry(5000)];
        let stats = assign_triggers(&mut entries, &table, (-20, 20));
        assert_eq!(stats.matched, 2);
        assert_eq!(stats.total, 3);
        // two candidates inside the first window
        assert!(entries[0].is_matched());
        assert!(entries[0].ambiguous);
        // exactly one candidate for the second entry
        assert_eq!(entries[1].trigger_number, 3);
        assert!(!entries[1].ambiguous);
        // nothing in reach of the last entry
        assert!(!entries[2].is_matched());
    }

    #[test]
    fn test_trigger_assignment_is_idempotent() {
        let table = vec![table_row(1, 100), table_row(2, 500)];
        let mut first = vec![bare_entry(105), bare_entry(505)];
        let mut second = first.clone();
        assign_triggers(&mut first, &table, (-20, 20));
        assign_triggers(&mut second, &table, (-20, 20));
        assert_eq!(first, second);
    }

    #[test]
    fn test_phase_ranking_prefers_dominant_peak() {
        let mut entries = Vec::new();
        // phase 3: every hit in one time-walk bin
        for j in 0..30 {
            entries.push(MonopixMatchEntry {
                col: 0,
                row: 0,
                le: 0,
                te: 0,
                tot: 0,
                token_timestamp: 0,
                le_timestamp: 16 * j + 3 + 100,
                trigger_number: 1,
                tlu_timestamp: 0,
                reference_timestamp: 16 * j + 3,
                ambiguous: false,
            });
        }
        // phase 5: hits split between two bins one cycle apart
        for j in 0..15 {
            for offset in [100i64, 116] {
                entries.push(MonopixMatchEntry {
                    col: 0,
                    row: 0,
                    le: 0,
                    te: 0,
                    tot: 0,
                    token_timestamp: 0,
                    le_timestamp: 16 * j + 5 + offset,
                    trigger_number: 1,
                    tlu_timestamp: 0,
                    reference_timestamp: 16 * j + 5,
                    ambiguous: false,
                });
            }
        }
        let quality = rank_phases(&entries);
        assert_eq!(quality[3], 0);
        assert!(quality[5] > quality[3]);
    }

    /// Synthetic run: 60 triggers, each with a scintillator reference, a
    /// high-resolution TLU word, a (wrapping) trigger word and a two-hit
    /// pixel cluster, correlated against a matching reference plane.
    #[test]
    fn test_align_pipeline_end_to_end() {
        let n_triggers = 60usize;
        let mut hits = Vec::new();
        let mut reference_plane = Vec::new();
        for k in 0..n_triggers {
            let ref_ts = 10_000 + 1_000 * k as i64;
            let hr_ts = ref_ts + 20 + (k as i64 % 5);
            let raw_trigger = ((65_530 + k) & 0xFFFF) as u32;
            hits.push(HitRecord::counter(COL_MON_LE, k as u32, ref_ts, 0));
            hits.push(HitRecord::counter(COL_TLU_HR, k as u32, hr_ts, 0));
            hits.push(HitRecord::tlu(raw_trigger, hr_ts + 1, 0));

            // two-hit cluster; the zero-ToT anchor pins the leading edge
            // exactly on the token time
            let token = ref_ts + 96 + 16 * (k as i64 % 3);
            let anchor_te = ((token >> TE_SCALE) & 0xFF) as u8;
            hits.push(HitRecord::pixel(3, 17, anchor_te, anchor_te, token, 0));
            hits.push(HitRecord::pixel(
                4,
                18,
                anchor_te,
                anchor_te.wrapping_add(5),
                token,
                0,
            ));

            reference_plane.push(HitRecord {
                col: 9,
                row: 9,
                le: 0,
                te: 0,
                cnt: raw_trigger,
                timestamp: ref_ts,
                scan_param_id: 0,
            });
        }

        let config = Config::default();
        let (events, summary) = align(&hits, &reference_plane, &config, None).unwrap();

        assert_eq!(events.len(), 2 * n_triggers);
        for (k, pair) in events.chunks(2).enumerate() {
            let ref_ts = 10_000 + 1_000 * k as i64;
            let expected_frame = (96 + 16 * (k as i64 % 3) + FRAME_OFFSET) as u16;
            for event in pair {
                assert_eq!(event.event_number, 65_530 + k as i64);
                assert_eq!(event.frame, expected_frame);
                assert_eq!(event.phase, (ref_ts & PHASE_MASK) as u8);
                assert!(!event.veto_flag);
                assert!(event.phase_quality < N_PHASES as u8);
            }
            assert_eq!(pair[0].tot, 0);
            assert_eq!(pair[1].tot, 5);
            assert_eq!(pair[1].charge, 5.0);
        }
        // every stage is accounted and nothing was dropped
        assert!(!summary.stats.is_empty());
        for stat in &summary.stats {
            assert_eq!(stat.matched, stat.total, "{} dropped rows", stat.label);
        }
    }

    #[test]
    fn test_align_aborts_on_duplicate_trigger() {
        let mut hits = Vec::new();
        for k in 0..10 {
            let ref_ts = 10_000 + 1_000 * k as i64;
            hits.push(HitRecord::counter(COL_MON_LE, k as u32, ref_ts, 0));
            hits.push(HitRecord::counter(COL_TLU_HR, k as u32, ref_ts + 20, 0));
            // the trigger counter is stuck
            hits.push(HitRecord::tlu(7, ref_ts + 21, 0));
        }
        let config = Config::default();
        let result = align(&hits, &[], &config, None);
        assert!(matches!(
            result,
            Err(AlignmentError::MonotonicityViolation { .. })
        ));
    }
}
