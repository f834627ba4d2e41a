use super::constants::*;
use super::hit::HitRecord;

/// Accumulator for the three-word pixel fragment sequence.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PixelState {
    col: u8,
    row: u16,
    le: u8,
    te: u8,
    noise: bool,
    ts_frag_a: u64,
    ts_frag_b: u64,
    seq_flag: u8,
}

/// Accumulator for one three-word timestamp channel.
///
/// `previous` holds the last completed value; for the TLU high-resolution
/// channel it is the reference against which standard TLU words are
/// extended.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CounterState {
    accumulator: u64,
    previous: u64,
    seq_flag: u8,
    event_count: u32,
}

/// Per-channel decode state carried across chunk boundaries.
///
/// Callers treat this as opaque: it is owned by the [Decoder], threaded
/// through successive `decode` calls unchanged, and only ever reset through
/// [Decoder::reset].
#[derive(Debug, Clone, Copy, Default)]
pub struct DecoderState {
    pixel: PixelState,
    ts40: CounterState,
    inj: CounterState,
    mon_le: CounterState,
    mon_te: CounterState,
    tlu_hr: CounterState,
}

/// Which of the three fragment stages a word claims to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FragStage {
    One,
    Two,
    Three,
}

/// The multi-channel raw word decoder.
///
/// Transforms raw bus words into [HitRecord]s, reassembling 2-3-word
/// fragment sequences per channel. Protocol violations are recovered
/// locally: the offending word becomes a sentinel error record, the
/// channel's sequence flag resets, and the running error counter
/// increments. Decoding never fails.
#[derive(Debug, Default)]
pub struct Decoder {
    state: DecoderState,
    mode_mask: u8,
    scan_param_id: i32,
    error_count: u64,
}

impl Decoder {
    pub fn new(mode_mask: u8) -> Self {
        Self {
            mode_mask,
            ..Default::default()
        }
    }

    pub fn set_scan_param_id(&mut self, scan_param_id: i32) {
        self.scan_param_id = scan_param_id;
    }

    /// Running count of garbage words and broken fragment sequences
    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    /// Opaque view of the carried channel state
    pub fn state(&self) -> &DecoderState {
        &self.state
    }

    /// Clear all channel state to initial values.
    ///
    /// Must be called whenever the upstream consumer detects a protocol
    /// desync, e.g. a FIFO discard. The error counter is a running total
    /// and survives the reset.
    pub fn reset(&mut self) {
        self.state = DecoderState::default();
    }

    /// Decode a chunk of raw words into `out`, which the caller has
    /// preallocated; the buffer is filled up to its capacity and never
    /// reallocated mid-decode.
    ///
    /// Returns the number of words consumed, so a caller can resume the
    /// same chunk at `start + consumed` once `out` has been drained.
    pub fn decode(&mut self, words: &[u32], out: &mut Vec<HitRecord>) -> usize {
        let mut consumed = 0;
        for &word in words {
            if out.len() == out.capacity() {
                break;
            }
            if let Some(record) = self.decode_word(word) {
                out.push(record);
            }
            consumed += 1;
        }
        consumed
    }

    fn decode_word(&mut self, word: u32) -> Option<HitRecord> {
        let scan_param_id = self.scan_param_id;
        // Most specific mask first: full-byte timestamp tags, then the
        // pixel nibble, then the TLU top bit.
        match word & TS_TAG_MASK {
            TS40_WORD_1 | TS40_WORD_2 | TS40_WORD_3 => {
                if self.mode_mask & MODE_TS40 == 0 {
                    return None;
                }
                let stage = match word & TS_TAG_MASK {
                    TS40_WORD_1 => FragStage::One,
                    TS40_WORD_2 => FragStage::Two,
                    _ => FragStage::Three,
                };
                return counter_word(
                    &mut self.state.ts40,
                    word,
                    stage,
                    COL_TS40,
                    scan_param_id,
                    &mut self.error_count,
                );
            }
            INJ_WORD_1 | INJ_WORD_2 | INJ_WORD_3 => {
                let stage = match word & TS_TAG_MASK {
                    INJ_WORD_1 => FragStage::One,
                    INJ_WORD_2 => FragStage::Two,
                    _ => FragStage::Three,
                };
                return counter_word(
                    &mut self.state.inj,
                    word,
                    stage,
                    COL_INJ,
                    scan_param_id,
                    &mut self.error_count,
                );
            }
            MON_LE_WORD_1 | MON_LE_WORD_2 | MON_LE_WORD_3 => {
                let stage = match word & TS_TAG_MASK {
                    MON_LE_WORD_1 => FragStage::One,
                    MON_LE_WORD_2 => FragStage::Two,
                    _ => FragStage::Three,
                };
                return counter_word(
                    &mut self.state.mon_le,
                    word,
                    stage,
                    COL_MON_LE,
                    scan_param_id,
                    &mut self.error_count,
                );
            }
            MON_TE_WORD_1 | MON_TE_WORD_2 | MON_TE_WORD_3 => {
                let stage = match word & TS_TAG_MASK {
                    MON_TE_WORD_1 => FragStage::One,
                    MON_TE_WORD_2 => FragStage::Two,
                    _ => FragStage::Three,
                };
                return counter_word(
                    &mut self.state.mon_te,
                    word,
                    stage,
                    COL_MON_TE,
                    scan_param_id,
                    &mut self.error_count,
                );
            }
            TLU_HR_WORD_1 | TLU_HR_WORD_2 | TLU_HR_WORD_3 => {
                let stage = match word & TS_TAG_MASK {
                    TLU_HR_WORD_1 => FragStage::One,
                    TLU_HR_WORD_2 => FragStage::Two,
                    _ => FragStage::Three,
                };
                return counter_word(
                    &mut self.state.tlu_hr,
                    word,
                    stage,
                    COL_TLU_HR,
                    scan_param_id,
                    &mut self.error_count,
                );
            }
            _ => {}
        }

        match word & PIXEL_TAG_MASK {
            PIXEL_WORD_A => return self.pixel_word_a(word),
            PIXEL_WORD_B => return self.pixel_word_b(word),
            PIXEL_WORD_C => return self.pixel_word_c(word),
            _ => {}
        }

        if word & TLU_TRIGGER_BIT != 0 {
            if self.mode_mask & MODE_TLU == 0 {
                return None;
            }
            return Some(self.tlu_word(word));
        }

        // No active channel claims this word
        self.error_count += 1;
        Some(HitRecord::protocol_error(COL_GARBAGE, 0, word, scan_param_id))
    }

    fn pixel_word_a(&mut self, word: u32) -> Option<HitRecord> {
        let px = &mut self.state.pixel;
        let error = if px.seq_flag != 0 {
            self.error_count += 1;
            Some(HitRecord::protocol_error(
                COL_PIXEL_SEQ_ERROR,
                broken_stage(px.seq_flag),
                word,
                self.scan_param_id,
            ))
        } else {
            None
        };
        // A first-stage word always opens a fresh sequence, so a single
        // duplicated fragment costs exactly one error record.
        let px = &mut self.state.pixel;
        px.col = (word & PIXEL_COL_MASK) as u8;
        px.noise = word & PIXEL_NOISE_BIT != 0;
        px.row = ((word >> PIXEL_ROW_SHIFT) & PIXEL_ROW_MASK) as u16;
        px.ts_frag_a = ((word >> PIXEL_FRAG_SHIFT) & PIXEL_FRAG_MASK) as u64;
        px.seq_flag = 1;
        error
    }

    fn pixel_word_b(&mut self, word: u32) -> Option<HitRecord> {
        let px = &mut self.state.pixel;
        if px.seq_flag != 1 {
            self.error_count += 1;
            let stage = broken_stage(px.seq_flag);
            px.seq_flag = 0;
            return Some(HitRecord::protocol_error(
                COL_PIXEL_SEQ_ERROR,
                stage,
                word,
                self.scan_param_id,
            ));
        }
        px.te = (word & PIXEL_TE_MASK) as u8;
        px.le = ((word >> PIXEL_LE_SHIFT) & PIXEL_LE_MASK) as u8;
        px.ts_frag_b = ((word >> PIXEL_FRAG_SHIFT) & PIXEL_FRAG_MASK) as u64;
        px.seq_flag = 2;
        None
    }

    fn pixel_word_c(&mut self, word: u32) -> Option<HitRecord> {
        let px = &mut self.state.pixel;
        if px.seq_flag != 2 {
            self.error_count += 1;
            let stage = broken_stage(px.seq_flag);
            px.seq_flag = 0;
            return Some(HitRecord::protocol_error(
                COL_PIXEL_SEQ_ERROR,
                stage,
                word,
                self.scan_param_id,
            ));
        }
        let timestamp = ((px.ts_frag_a << PIXEL_FRAG_A_OFFSET)
            | (px.ts_frag_b << PIXEL_FRAG_B_OFFSET)
            | (word & PIXEL_FRAG_C_MASK) as u64) as i64;
        px.seq_flag = 0;
        let mut record =
            HitRecord::pixel(px.col, px.row, px.le, px.te, timestamp, self.scan_param_id);
        record.cnt = px.noise as u32;
        Some(record)
    }

    /// Standard-resolution TLU word: a 16 bit trigger counter plus a 15 bit
    /// timestamp fragment at 16-tick granularity, extended against the last
    /// completed high-resolution TLU counter value.
    fn tlu_word(&mut self, word: u32) -> HitRecord {
        let trigger = word & TLU_TRIGGER_MASK;
        let frag = (((word >> TLU_FRAG_SHIFT) & TLU_FRAG_MASK) as i64) << TLU_FRAG_SCALE;
        let reference = self.state.tlu_hr.previous as i64;
        let mut timestamp = (reference & !TLU_LOWRES_MASK) | frag;
        if frag < (reference & TLU_LOWRES_MASK) {
            // The fragment already wrapped past the reference
            timestamp += TLU_LOWRES_WRAP;
        }
        HitRecord::tlu(trigger, timestamp, self.scan_param_id)
    }
}

/// Stage encoding for error records: 0 = the sequence broke while awaiting
/// the second fragment, 1 = while awaiting the third, 2 = a continuation
/// word arrived while the channel was idle.
fn broken_stage(seq_flag: u8) -> u16 {
    match seq_flag {
        1 => 0,
        2 => 1,
        _ => 2,
    }
}

fn counter_word(
    ch: &mut CounterState,
    word: u32,
    stage: FragStage,
    sentinel_col: u8,
    scan_param_id: i32,
    error_count: &mut u64,
) -> Option<HitRecord> {
    match stage {
        FragStage::One => {
            let error = if ch.seq_flag != 0 {
                *error_count += 1;
                Some(HitRecord::protocol_error(
                    COL_TS_SEQ_ERROR,
                    broken_stage(ch.seq_flag),
                    word,
                    scan_param_id,
                ))
            } else {
                None
            };
            ch.accumulator = (ch.accumulator & !(COUNTER_FRAG_MASK as u64))
                | (word & COUNTER_FRAG_MASK) as u64;
            ch.seq_flag = 1;
            error
        }
        FragStage::Two => {
            if ch.seq_flag != 1 {
                *error_count += 1;
                let stage = broken_stage(ch.seq_flag);
                ch.seq_flag = 0;
                return Some(HitRecord::protocol_error(
                    COL_TS_SEQ_ERROR,
                    stage,
                    word,
                    scan_param_id,
                ));
            }
            ch.accumulator = (ch.accumulator
                & !((COUNTER_FRAG_MASK as u64) << COUNTER_FRAG_2_OFFSET))
                | (((word & COUNTER_FRAG_MASK) as u64) << COUNTER_FRAG_2_OFFSET);
            ch.seq_flag = 2;
            None
        }
        FragStage::Three => {
            if ch.seq_flag != 2 {
                *error_count += 1;
                let stage = broken_stage(ch.seq_flag);
                ch.seq_flag = 0;
                return Some(HitRecord::protocol_error(
                    COL_TS_SEQ_ERROR,
                    stage,
                    word,
                    scan_param_id,
                ));
            }
            ch.accumulator = (ch.accumulator
                & !((COUNTER_FRAG_3_MASK as u64) << COUNTER_FRAG_3_OFFSET))
                | (((word & COUNTER_FRAG_3_MASK) as u64) << COUNTER_FRAG_3_OFFSET);
            ch.seq_flag = 0;
            ch.event_count = ch.event_count.wrapping_add(1);
            ch.previous = ch.accumulator;
            Some(HitRecord::counter(
                sentinel_col,
                ch.event_count,
                ch.accumulator as i64,
                scan_param_id,
            ))
        }
    }
}
