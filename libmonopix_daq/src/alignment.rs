use serde::Serialize;

use super::constants::*;
use super::error::AlignmentError;
use super::event::{TluMatchEntry, UNMATCHED};
use super::hit::HitRecord;

/// Match accounting for one pipeline stage. Dropped rows are never silent:
/// every stage reports how many rows survived.
#[derive(Debug, Clone, Serialize)]
pub struct MatchStats {
    pub label: String,
    pub matched: usize,
    pub total: usize,
}

impl MatchStats {
    pub fn new(label: &str, matched: usize, total: usize) -> Self {
        Self {
            label: String::from(label),
            matched,
            total,
        }
    }

    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.matched as f64 / self.total as f64 * 100.0
    }

    pub fn log(&self) {
        spdlog::info!(
            "{}: {}/{} matched ({:.1}%)",
            self.label,
            self.matched,
            self.total,
            self.percentage()
        );
    }
}

/// Replace a wrapping counter sequence by its cumulative reconstruction.
///
/// Each corrected value is the previous one plus the masked successive
/// difference, seeded by the first raw value. With `require_increase` a
/// zero corrected difference (a duplicate or genuinely non-monotonic
/// counter) is a fatal [AlignmentError::MonotonicityViolation]: once the
/// correction cannot be trusted the whole alignment run is unusable.
pub fn overflow_correct(
    values: &[i64],
    wrap_mask: i64,
    name: &'static str,
    require_increase: bool,
) -> Result<Vec<i64>, AlignmentError> {
    if values.is_empty() {
        return Ok(Vec::new());
    }
    let mut corrected = Vec::with_capacity(values.len());
    corrected.push(values[0]);
    for i in 1..values.len() {
        let diff = (values[i] - values[i - 1]) & wrap_mask;
        if require_increase && diff <= 0 {
            return Err(AlignmentError::MonotonicityViolation { name, index: i });
        }
        corrected.push(corrected[i - 1] + diff);
    }
    Ok(corrected)
}

/// Build the TLU match table from the decoded hit stream.
///
/// Every high-resolution TLU record anchors one row. The scintillator
/// reference is searched backward and the standard-resolution TLU word
/// forward, both within `search_distance` records of the anchor. Rows with
/// either partner missing keep the [UNMATCHED] sentinel and are filtered
/// by the caller. The search distance is a fixed configuration constant.
pub fn build_tlu_match_table(
    hits: &[HitRecord],
    search_distance: usize,
) -> (Vec<TluMatchEntry>, MatchStats) {
    let mut entries = Vec::new();
    for (i, hit) in hits.iter().enumerate() {
        if hit.col != COL_TLU_HR {
            continue;
        }
        let mut entry = TluMatchEntry {
            trigger_number: UNMATCHED,
            tlu_timestamp: UNMATCHED,
            reference_timestamp: UNMATCHED,
            tlu_hr_timestamp: hit.timestamp,
        };
        for j in (i.saturating_sub(search_distance)..i).rev() {
            if hits[j].col == COL_MON_LE {
                entry.reference_timestamp = hits[j].timestamp;
                break;
            }
        }
        for record in hits.iter().skip(i + 1).take(search_distance) {
            if record.col == COL_TLU {
                entry.trigger_number = record.cnt as i64;
                entry.tlu_timestamp = record.timestamp;
                break;
            }
        }
        entries.push(entry);
    }
    let matched = entries.iter().filter(|e| e.is_matched()).count();
    let stats = MatchStats::new("tlu window match", matched, entries.len());
    (entries, stats)
}

/// Correlate two monotonically keyed sequences in a single forward pass.
///
/// Both cursors only ever advance, so the total number of key comparisons
/// is bounded by `a.len() + b.len()`. Keys present on one side only are
/// simply skipped; the caller counts them as unmatched. The left side may
/// repeat a key (several hits of one trigger); each repeat pairs with the
/// same right index.
pub fn merge_join(a: &[i64], b: &[i64]) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    let mut i = 0;
    let mut j = 0;
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                pairs.push((i, j));
                i += 1;
            }
        }
    }
    pairs
}

//Unit tests
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_correction_wraps() {
        let corrected = overflow_correct(&[5, 6, 7, 0, 1], 0xFFFF, "trigger number", true).unwrap();
        assert_eq!(corrected, vec![5, 6, 7, 65536, 65537]);
        assert!(corrected.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_overflow_correction_multiple_wraps() {
        let corrected = overflow_correct(&[14, 2, 1, 3], 0xF, "trigger number", true).unwrap();
        assert_eq!(corrected, vec![14, 18, 33, 35]);
    }

    #[test]
    fn test_duplicate_counter_is_fatal() {
        let result = overflow_correct(&[5, 6, 6, 7], 0xFFFF, "trigger number", true);
        assert!(matches!(
            result,
            Err(AlignmentError::MonotonicityViolation { index: 2, .. })
        ));
    }

    #[test]
    fn test_timestamps_allow_equal_values() {
        let corrected =
            overflow_correct(&[100, 100, 105], 0xFFFF, "tlu timestamp", false).unwrap();
        assert_eq!(corrected, vec![100, 100, 105]);
    }

    fn anchor(ts: i64) -> HitRecord {
        HitRecord::counter(COL_TLU_HR, 0, ts, 0)
    }

    fn reference(ts: i64) -> HitRecord {
        HitRecord::counter(COL_MON_LE, 0, ts, 0)
    }

    #[test]
    fn test_window_match_resolves_neighbors() {
        let hits = vec![
            reference(990),
            anchor(1000),
            HitRecord::tlu(17, 1005, 0),
            reference(1990),
            anchor(2000),
            HitRecord::tlu(18, 2005, 0),
        ];
        let (entries, stats) = build_tlu_match_table(&hits, 10);
        assert_eq!(entries.len(), 2);
        assert_eq!(stats.matched, 2);
        assert_eq!(entries[0].trigger_number, 17);
        assert_eq!(entries[0].reference_timestamp, 990);
        assert_eq!(entries[0].tlu_hr_timestamp, 1000);
        assert_eq!(entries[1].trigger_number, 18);
        assert_eq!(entries[1].reference_timestamp, 1990);
    }

    #[test]
    fn test_window_match_marks_unmatched() {
        // no reference record within reach of the anchor
        let mut hits = vec![reference(10)];
        for i in 0..20 {
            hits.push(HitRecord::counter(COL_INJ, i, 50 + i as i64, 0));
        }
        hits.push(anchor(1000));
        hits.push(HitRecord::tlu(3, 1002, 0));
        let (entries, stats) = build_tlu_match_table(&hits, 5);
        assert_eq!(entries.len(), 1);
        assert_eq!(stats.matched, 0);
        assert_eq!(entries[0].reference_timestamp, UNMATCHED);
        assert!(!entries[0].is_matched());
    }

    #[test]
    fn test_window_match_is_idempotent() {
        let hits = vec![
            reference(990),
            anchor(1000),
            HitRecord::tlu(17, 1005, 0),
            anchor(2000),
        ];
        let (first, _) = build_tlu_match_table(&hits, 10);
        let (second, _) = build_tlu_match_table(&hits, 10);
        assert_eq!(first, second);
    }

    #[test]
    fn test_merge_join_interleavings() {
        let a = [1, 3, 5, 7, 8];
        let b = [2, 3, 4, 7, 9];
        let pairs = merge_join(&a, &b);
        assert_eq!(pairs, vec![(1, 1), (3, 3)]);
    }

    #[test]
    fn test_merge_join_repeated_left_keys() {
        // two hits of trigger 5 both pair with the single table row
        let pairs = merge_join(&[5, 5, 6], &[5, 6]);
        assert_eq!(pairs, vec![(0, 0), (1, 0), (2, 1)]);
    }

    #[test]
    fn test_merge_join_disjoint() {
        assert!(merge_join(&[1, 2, 3], &[4, 5, 6]).is_empty());
        assert!(merge_join(&[], &[1]).is_empty());
    }

    #[test]
    fn test_merge_join_cursors_only_advance() {
        // identical sequences match pairwise in one pass
        let keys: Vec<i64> = (0..1000).collect();
        let pairs = merge_join(&keys, &keys);
        assert_eq!(pairs.len(), keys.len());
        assert!(pairs.iter().enumerate().all(|(n, &(i, j))| n == i && i == j));
    }
}
