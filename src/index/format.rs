//! Binary on-disk format for the vector index.
//!
//! Little-endian throughout, 4-byte aligned:
//!
//! ```text
//! header (24 B): magic "LVIX" | version u32 | dims u32 | max_elements u32
//!                | M u16 | ef_construction u16 | seed u32
//! body:          current_size u32, then current_size records of
//!                (label u32, vector dims*f32)
//! trailer:       optional; map_count u32, then per entry
//!                (label u32, id_len u32, id bytes, zero pad to 4-byte align)
//! ```
//!
//! Version 1 does not serialize the ANN graph: the header's `(M,
//! ef_construction, seed)` triple plus the record order make the graph a
//! deterministic function of this file, so load rebuilds it. A file without a
//! trailer ("pure vector payload") is exactly `24 + 4 + n*(4 + dims*4)`
//! bytes. The trailer carries the label→embedding-id bijection.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::BTreeMap;
use std::io::{Read, Write};

use crate::error::{EngineError, EngineResult};

pub const MAGIC: [u8; 4] = *b"LVIX";
pub const FORMAT_VERSION: u32 = 1;
pub const HEADER_BYTES: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexHeader {
    pub version: u32,
    pub dims: u32,
    pub max_elements: u32,
    pub m: u16,
    pub ef_construction: u16,
    pub seed: u32,
}

impl IndexHeader {
    pub fn write<W: Write>(&self, w: &mut W) -> EngineResult<()> {
        w.write_all(&MAGIC)?;
        w.write_u32::<LittleEndian>(self.version)?;
        w.write_u32::<LittleEndian>(self.dims)?;
        w.write_u32::<LittleEndian>(self.max_elements)?;
        w.write_u16::<LittleEndian>(self.m)?;
        w.write_u16::<LittleEndian>(self.ef_construction)?;
        w.write_u32::<LittleEndian>(self.seed)?;
        Ok(())
    }

    pub fn read<R: Read>(r: &mut R) -> EngineResult<Self> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(EngineError::Index(format!(
                "bad index file magic {magic:02x?} (expected {MAGIC:02x?})"
            )));
        }
        let version = r.read_u32::<LittleEndian>()?;
        if version == 0 || version > FORMAT_VERSION {
            return Err(EngineError::Index(format!(
                "unsupported index format version {version} (this engine reads up to {FORMAT_VERSION})"
            )));
        }
        Ok(Self {
            version,
            dims: r.read_u32::<LittleEndian>()?,
            max_elements: r.read_u32::<LittleEndian>()?,
            m: r.read_u16::<LittleEndian>()?,
            ef_construction: r.read_u16::<LittleEndian>()?,
            seed: r.read_u32::<LittleEndian>()?,
        })
    }
}

/// Exact byte length of a file holding `n` records of `dims` dimensions and
/// no trailer.
pub fn pure_payload_len(n: usize, dims: usize) -> usize {
    HEADER_BYTES + 4 + n * (4 + dims * 4)
}

pub fn write_records<W: Write>(
    w: &mut W,
    records: &[(u32, &[f32])],
) -> EngineResult<()> {
    w.write_u32::<LittleEndian>(records.len() as u32)?;
    for (label, vector) in records {
        w.write_u32::<LittleEndian>(*label)?;
        for value in *vector {
            w.write_f32::<LittleEndian>(*value)?;
        }
    }
    Ok(())
}

pub fn read_records<R: Read>(r: &mut R, dims: usize) -> EngineResult<Vec<(u32, Vec<f32>)>> {
    let count = r.read_u32::<LittleEndian>()? as usize;
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        let label = r.read_u32::<LittleEndian>()?;
        let mut vector = vec![0.0f32; dims];
        for value in vector.iter_mut() {
            *value = r.read_f32::<LittleEndian>()?;
        }
        records.push((label, vector));
    }
    Ok(records)
}

fn padded_len(len: usize) -> usize {
    len.div_ceil(4) * 4
}

/// Writes the label→embedding-id trailer. Skipped entirely for an empty map
/// so a pure vector payload keeps its exact size.
pub fn write_id_map<W: Write>(w: &mut W, map: &BTreeMap<u32, String>) -> EngineResult<()> {
    if map.is_empty() {
        return Ok(());
    }
    w.write_u32::<LittleEndian>(map.len() as u32)?;
    for (label, id) in map {
        let bytes = id.as_bytes();
        w.write_u32::<LittleEndian>(*label)?;
        w.write_u32::<LittleEndian>(bytes.len() as u32)?;
        w.write_all(bytes)?;
        for _ in bytes.len()..padded_len(bytes.len()) {
            w.write_u8(0)?;
        }
    }
    Ok(())
}

/// Reads the trailer if present. EOF right after the records means an empty
/// map; a malformed trailer is an error, not an empty map.
pub fn read_id_map<R: Read>(r: &mut R) -> EngineResult<BTreeMap<u32, String>> {
    let count = match r.read_u32::<LittleEndian>() {
        Ok(count) => count as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(BTreeMap::new()),
        Err(e) => return Err(e.into()),
    };

    let mut map = BTreeMap::new();
    for _ in 0..count {
        let label = r.read_u32::<LittleEndian>()?;
        let len = r.read_u32::<LittleEndian>()? as usize;
        let mut bytes = vec![0u8; padded_len(len)];
        r.read_exact(&mut bytes)?;
        bytes.truncate(len);
        let id = String::from_utf8(bytes)
            .map_err(|_| EngineError::Index("non-utf8 embedding id in trailer".into()))?;
        if map.insert(label, id).is_some() {
            return Err(EngineError::IndexDesync(format!(
                "label {label} appears twice in the index trailer"
            )));
        }
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn header() -> IndexHeader {
        IndexHeader {
            version: FORMAT_VERSION,
            dims: 4,
            max_elements: 1024,
            m: 16,
            ef_construction: 128,
            seed: 42,
        }
    }

    #[test]
    fn header_is_exactly_24_bytes_and_round_trips() {
        let mut buf = Vec::new();
        header().write(&mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_BYTES);

        let parsed = IndexHeader::read(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(parsed, header());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = Vec::new();
        header().write(&mut buf).unwrap();
        buf[0] = b'X';
        assert!(IndexHeader::read(&mut Cursor::new(&buf)).is_err());
    }

    #[test]
    fn newer_version_is_rejected() {
        let mut buf = Vec::new();
        IndexHeader { version: FORMAT_VERSION + 1, ..header() }.write(&mut buf).unwrap();
        assert!(IndexHeader::read(&mut Cursor::new(&buf)).is_err());
    }

    #[test]
    fn pure_payload_size_law_holds() {
        // dims=512 with 100 records lands exactly here.
        assert_eq!(pure_payload_len(100, 512), 204_828);

        let mut buf = Vec::new();
        let h = IndexHeader { dims: 3, ..header() };
        h.write(&mut buf).unwrap();
        let v1 = [1.0f32, 0.0, 0.0];
        let v2 = [0.0f32, 1.0, 0.0];
        write_records(&mut buf, &[(7, &v1), (9, &v2)]).unwrap();
        assert_eq!(buf.len(), pure_payload_len(2, 3));
    }

    #[test]
    fn records_round_trip_bit_exactly() {
        let mut buf = Vec::new();
        let v = [0.25f32, -1.5, 3.75, f32::MIN_POSITIVE];
        write_records(&mut buf, &[(3, &v)]).unwrap();
        let records = read_records(&mut Cursor::new(&buf), 4).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, 3);
        assert_eq!(records[0].1, v.to_vec());
    }

    #[test]
    fn id_map_round_trips_with_alignment_padding() {
        let mut map = BTreeMap::new();
        map.insert(1u32, "a".repeat(64));
        map.insert(2u32, "abc".to_string()); // needs one pad byte

        let mut buf = Vec::new();
        write_id_map(&mut buf, &map).unwrap();
        assert_eq!(buf.len() % 4, 0);

        let parsed = read_id_map(&mut Cursor::new(&buf)).unwrap();
        assert_eq!(parsed, map);
    }

    #[test]
    fn missing_trailer_reads_as_empty_map() {
        let parsed = read_id_map(&mut Cursor::new(&[])).unwrap();
        assert!(parsed.is_empty());
    }
}
