//! Bit-level constants of the raw word protocol and the record layouts.
//!
//! These values are fixed by the chip firmware and the readout FPGA and must
//! not be changed independently of them.

/// Mask selecting the pixel-channel tag nibble
pub const PIXEL_TAG_MASK: u32 = 0xF000_0000;
pub const PIXEL_WORD_A: u32 = 0x1000_0000;
pub const PIXEL_WORD_B: u32 = 0x2000_0000;
pub const PIXEL_WORD_C: u32 = 0x3000_0000;

/// Mask selecting the timestamp-channel tag byte
pub const TS_TAG_MASK: u32 = 0xFF00_0000;

// 40 MHz timestamp, three word fragments (gated by MODE_TS40)
pub const TS40_WORD_1: u32 = 0x4100_0000;
pub const TS40_WORD_2: u32 = 0x4200_0000;
pub const TS40_WORD_3: u32 = 0x4300_0000;

// Injection 640 MHz timestamp
pub const INJ_WORD_1: u32 = 0x5100_0000;
pub const INJ_WORD_2: u32 = 0x5200_0000;
pub const INJ_WORD_3: u32 = 0x5300_0000;

// Monitor 640 MHz timestamp, leading edge
pub const MON_LE_WORD_1: u32 = 0x6100_0000;
pub const MON_LE_WORD_2: u32 = 0x6200_0000;
pub const MON_LE_WORD_3: u32 = 0x6300_0000;

// Monitor 640 MHz timestamp, trailing edge
pub const MON_TE_WORD_1: u32 = 0x6500_0000;
pub const MON_TE_WORD_2: u32 = 0x6600_0000;
pub const MON_TE_WORD_3: u32 = 0x6700_0000;

// TLU 640 MHz high-resolution timestamp
pub const TLU_HR_WORD_1: u32 = 0x7100_0000;
pub const TLU_HR_WORD_2: u32 = 0x7200_0000;
pub const TLU_HR_WORD_3: u32 = 0x7300_0000;

/// TLU trigger words are the only words with the top bit set (gated by MODE_TLU)
pub const TLU_TRIGGER_BIT: u32 = 0x8000_0000;

// Pixel word fields
pub const PIXEL_COL_MASK: u32 = 0x3F;
pub const PIXEL_NOISE_BIT: u32 = 0x40;
pub const PIXEL_ROW_SHIFT: u32 = 8;
pub const PIXEL_ROW_MASK: u32 = 0xFF;
pub const PIXEL_TE_MASK: u32 = 0xFF;
pub const PIXEL_LE_SHIFT: u32 = 8;
pub const PIXEL_LE_MASK: u32 = 0xFF;
pub const PIXEL_FRAG_SHIFT: u32 = 16;
pub const PIXEL_FRAG_MASK: u32 = 0xFFF;
pub const PIXEL_FRAG_C_MASK: u32 = 0x0FFF_FFFF;

// Pixel timestamp assembly: fragment A -> bits [51:40], B -> [39:28], C -> [27:0]
pub const PIXEL_FRAG_A_OFFSET: u32 = 40;
pub const PIXEL_FRAG_B_OFFSET: u32 = 28;
pub const PIXEL_TS_BITS: u32 = 52;

// Counter channel assembly: word 1 -> bits [23:0], word 2 -> [47:24], word 3 -> [55:48]
pub const COUNTER_FRAG_MASK: u32 = 0x00FF_FFFF;
pub const COUNTER_FRAG_3_MASK: u32 = 0xFF;
pub const COUNTER_FRAG_2_OFFSET: u32 = 24;
pub const COUNTER_FRAG_3_OFFSET: u32 = 48;
pub const COUNTER_TS_BITS: u32 = 56;

// TLU trigger word fields. The 15-bit timestamp fragment sits in bits [30:16]
// and counts in units of 16 clock ticks, hence the shift by 4.
pub const TLU_TRIGGER_MASK: u32 = 0xFFFF;
pub const TLU_FRAG_SHIFT: u32 = 16;
pub const TLU_FRAG_MASK: u32 = 0x7FFF;
pub const TLU_FRAG_SCALE: u32 = 4;
/// Span of the scaled TLU fragment within the high-resolution counter
pub const TLU_LOWRES_MASK: i64 = 0x7_FFFF;
/// One wraparound period of the scaled fragment
pub const TLU_LOWRES_WRAP: i64 = 0x8_0000;

// Decoder mode mask bits. Channels not gated here are always active.
pub const MODE_TS40: u8 = 0x1;
pub const MODE_TLU: u8 = 0x2;

/// Highest column index a physical pixel can produce
pub const MAX_REAL_COL: u8 = 55;

// Sentinel columns, reserved range 0xE0-0xFF. These never collide with real
// column indices and tag synthetic records in the hit stream.
pub const COL_GARBAGE: u8 = 0xE0;
pub const COL_PIXEL_SEQ_ERROR: u8 = 0xE1;
pub const COL_TS_SEQ_ERROR: u8 = 0xE2;
pub const COL_INJ: u8 = 0xF1;
pub const COL_MON_LE: u8 = 0xF2;
pub const COL_MON_TE: u8 = 0xF3;
pub const COL_TLU_HR: u8 = 0xF4;
pub const COL_TS40: u8 = 0xF8;
pub const COL_TLU: u8 = 0xFF;

// Record layouts (little-endian, field order as declared on the structs)
pub const HIT_RECORD_SIZE: usize = 21;
pub const EVENT_RECORD_SIZE: usize = 21;

// Alignment wrap masks
pub const TRIGGER_WRAP_MASK: i64 = 0xFFFF;
pub const PIXEL_TS_WRAP_MASK: i64 = (1 << PIXEL_TS_BITS) - 1;
pub const COUNTER_TS_WRAP_MASK: i64 = (1 << COUNTER_TS_BITS) - 1;

// Cluster-token leading edge reconstruction. TE/LE counters are 8 bit wide
// and tick at a sixteenth of the token clock.
pub const TOT_MASK: i64 = 0xFF;
pub const TE_SCALE: u32 = 4;
pub const TE_SUB_MASK: i64 = 0xFF0;

/// Shift applied to frame values so they stay representable as unsigned
pub const FRAME_OFFSET: i64 = 0x800;

// Acceptance-window multipliers (k, n, m): the window spans
// [c - w/2 - k*w - m*sigma, c - w/2 + n*w + m*sigma].
pub const TLU_REF_WINDOW: (f64, f64, f64) = (1.0, 1.0, 3.0);
pub const LE_REF_WINDOW: (f64, f64, f64) = (2.0, 2.0, 3.0);

// Histogram range for timestamp-difference fits, in clock ticks
pub const DIFF_HIST_MIN: i64 = -0x800;
pub const DIFF_HIST_MAX: i64 = 0x800;

// Phase-quality ranking
pub const N_PHASES: usize = 16;
pub const PHASE_MASK: i64 = 0xF;
pub const PHASE_NEIGHBOR_STRIDE: usize = 16;

// Readout engine
pub const CHUNK_QUEUE_DEPTH: usize = 1024;
pub const WATCHDOG_MULTIPLIER: u32 = 10;
/// Words per read when replaying a recorded raw file
pub const REPLAY_CHUNK_WORDS: usize = 4096;
