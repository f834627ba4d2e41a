use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

use super::constants::*;
use super::error::HitFileError;

/// One decoded hit, or one synthetic record from a timestamp channel or a
/// protocol violation.
///
/// Real pixels carry `col` in `0..=55`; synthetic records use the reserved
/// sentinel range `0xE0..=0xFF`. The `cnt` field is overloaded per record
/// kind: the noise bit for pixels, the per-channel event index for
/// timestamp channels, the offending raw word for error records and the
/// trigger number for TLU trigger records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HitRecord {
    pub col: u8,
    pub row: u16,
    pub le: u8,
    pub te: u8,
    pub cnt: u32,
    pub timestamp: i64,
    pub scan_param_id: i32,
}

impl HitRecord {
    /// A completed pixel record
    pub fn pixel(col: u8, row: u16, le: u8, te: u8, timestamp: i64, scan_param_id: i32) -> Self {
        Self {
            col,
            row,
            le,
            te,
            cnt: 0,
            timestamp,
            scan_param_id,
        }
    }

    /// A completed timestamp-channel record
    pub fn counter(col: u8, event_index: u32, timestamp: i64, scan_param_id: i32) -> Self {
        Self {
            col,
            row: 0,
            le: 0,
            te: 0,
            cnt: event_index,
            timestamp,
            scan_param_id,
        }
    }

    /// A TLU trigger record; the resolved timestamp spans the full
    /// high-resolution counter range
    pub fn tlu(trigger_number: u32, timestamp: i64, scan_param_id: i32) -> Self {
        Self {
            col: COL_TLU,
            row: 0,
            le: 0,
            te: 0,
            cnt: trigger_number,
            timestamp,
            scan_param_id,
        }
    }

    /// A synthetic error record. `stage` reports where the fragment sequence
    /// broke and `word` is the offending raw word.
    pub fn protocol_error(col: u8, stage: u16, word: u32, scan_param_id: i32) -> Self {
        Self {
            col,
            row: stage,
            le: 0,
            te: 0,
            cnt: word,
            timestamp: 0,
            scan_param_id,
        }
    }

    /// True for records produced by a physical pixel
    pub fn is_pixel(&self) -> bool {
        self.col <= MAX_REAL_COL
    }

    /// True for garbage and sequence-error records
    pub fn is_error(&self) -> bool {
        matches!(self.col, COL_GARBAGE | COL_PIXEL_SEQ_ERROR | COL_TS_SEQ_ERROR)
    }

    /// Time over threshold, the pulse-width proxy for charge
    pub fn tot(&self) -> i64 {
        (self.te as i64 - self.le as i64) & TOT_MASK
    }

    /// Serialize in the on-disk layout (little-endian, field order)
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), std::io::Error> {
        writer.write_u8(self.col)?;
        writer.write_u16::<LittleEndian>(self.row)?;
        writer.write_u8(self.le)?;
        writer.write_u8(self.te)?;
        writer.write_u32::<LittleEndian>(self.cnt)?;
        writer.write_i64::<LittleEndian>(self.timestamp)?;
        writer.write_i32::<LittleEndian>(self.scan_param_id)?;
        Ok(())
    }

    /// Deserialize from the on-disk layout
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, std::io::Error> {
        Ok(Self {
            col: reader.read_u8()?,
            row: reader.read_u16::<LittleEndian>()?,
            le: reader.read_u8()?,
            te: reader.read_u8()?,
            cnt: reader.read_u32::<LittleEndian>()?,
            timestamp: reader.read_i64::<LittleEndian>()?,
            scan_param_id: reader.read_i32::<LittleEndian>()?,
        })
    }
}

/// Read a whole hit-record file, e.g. the reference-plane hit stream.
pub fn read_hit_file(path: &Path) -> Result<Vec<HitRecord>, HitFileError> {
    if !path.exists() {
        return Err(HitFileError::BadFilePath(path.to_path_buf()));
    }
    let total_bytes = path.metadata()?.len() as usize;
    if total_bytes % HIT_RECORD_SIZE != 0 {
        return Err(HitFileError::TruncatedRecord);
    }
    let mut reader = BufReader::new(File::open(path)?);
    let mut records = Vec::with_capacity(total_bytes / HIT_RECORD_SIZE);
    for _ in 0..(total_bytes / HIT_RECORD_SIZE) {
        records.push(HitRecord::read_from(&mut reader)?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout_size() {
        let mut buf = Vec::new();
        let hit = HitRecord::pixel(5, 130, 10, 20, 0xABCDE, 3);
        hit.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), HIT_RECORD_SIZE);
        let read = HitRecord::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(read, hit);
    }

    #[test]
    fn test_tot_wraps() {
        let hit = HitRecord::pixel(0, 0, 250, 4, 0, 0);
        // trailing edge counter wrapped past the leading edge
        assert_eq!(hit.tot(), (4i64 - 250i64) & 0xFF);
    }

    #[test]
    fn test_sentinels_do_not_collide() {
        assert!(HitRecord::pixel(MAX_REAL_COL, 0, 0, 0, 0, 0).is_pixel());
        assert!(!HitRecord::counter(COL_TLU_HR, 0, 0, 0).is_pixel());
        assert!(HitRecord::protocol_error(COL_PIXEL_SEQ_ERROR, 0, 0, 0).is_error());
        assert!(!HitRecord::tlu(1, 0, 0).is_error());
    }
}
