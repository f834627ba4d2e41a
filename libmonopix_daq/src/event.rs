use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Write;

/// Sentinel for a row whose match could not be resolved. Rows carrying it
/// are excluded from every downstream join.
pub const UNMATCHED: i64 = -1;

/// One high-resolution TLU word matched against its standard-resolution and
/// scintillator-reference counterparts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TluMatchEntry {
    pub trigger_number: i64,
    pub tlu_timestamp: i64,
    pub reference_timestamp: i64,
    pub tlu_hr_timestamp: i64,
}

impl TluMatchEntry {
    pub fn is_matched(&self) -> bool {
        self.trigger_number != UNMATCHED
            && self.tlu_timestamp != UNMATCHED
            && self.reference_timestamp != UNMATCHED
    }
}

/// Per-pixel-hit correlation row. Built from the cluster-token leading edge
/// reconstruction and the trigger assignment walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonopixMatchEntry {
    pub col: u8,
    pub row: u16,
    pub le: u8,
    pub te: u8,
    pub tot: i64,
    pub token_timestamp: i64,
    pub le_timestamp: i64,
    pub trigger_number: i64,
    pub tlu_timestamp: i64,
    pub reference_timestamp: i64,
    /// More than one TLU candidate fell inside the acceptance window
    pub ambiguous: bool,
}

impl MonopixMatchEntry {
    pub fn is_matched(&self) -> bool {
        self.trigger_number != UNMATCHED
    }
}

/// Final correlated event row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventRecord {
    pub event_number: i64,
    pub col: u8,
    pub row: u16,
    pub frame: u16,
    pub charge: f32,
    pub tot: u8,
    pub phase: u8,
    pub phase_quality: u8,
    pub veto_flag: bool,
}

impl EventRecord {
    /// Serialize in the on-disk layout (little-endian, field order)
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), std::io::Error> {
        writer.write_i64::<LittleEndian>(self.event_number)?;
        writer.write_u8(self.col)?;
        writer.write_u16::<LittleEndian>(self.row)?;
        writer.write_u16::<LittleEndian>(self.frame)?;
        writer.write_f32::<LittleEndian>(self.charge)?;
        writer.write_u8(self.tot)?;
        writer.write_u8(self.phase)?;
        writer.write_u8(self.phase_quality)?;
        writer.write_u8(self.veto_flag as u8)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::EVENT_RECORD_SIZE;

    #[test]
    fn test_event_record_layout_size() {
        let mut buf = Vec::new();
        let event = EventRecord {
            event_number: 42,
            col: 1,
            row: 2,
            frame: 3,
            charge: 4.0,
            tot: 5,
            phase: 6,
            phase_quality: 7,
            veto_flag: true,
        };
        event.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), EVENT_RECORD_SIZE);
    }
}
