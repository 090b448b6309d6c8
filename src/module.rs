//! PLCM container format: the versioned binary module consumed by the
//! device loader.
//!
//! # Format Overview
//!
//! ```text
//! +--------------------------------------------------+
//! | Header (32 bytes, little-endian)                 |
//! |   magic         u32  "PLCM"                      |
//! |   version_major u16                              |
//! |   version_minor u16                              |
//! |   flags         u32                              |
//! |   checksum      u32  reserved, written as 0      |
//! |   code_size     u32                              |
//! |   data_size     u32                              |
//! |   entry_point   u16                              |
//! |   segment_count u16                              |
//! |   reserved      u32  must be 0                   |
//! +--------------------------------------------------+
//! | Segment table: segment_count * 8 bytes           |
//! |   { kind u16, flags u16, size u32 }              |
//! +--------------------------------------------------+
//! | Segment bodies, concatenated in table order      |
//! +--------------------------------------------------+
//! ```
//!
//! The checksum field is reserved but not yet computed on either end of the
//! link; it is written as zero and ignored on parse. The intended algorithm
//! is CRC-32/ISO-HDLC over the whole file with this field zeroed.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;

/// Magic bytes: "PLCM" when viewed in a hex dump.
pub const MODULE_MAGIC: u32 = 0x4D43_4C50;

/// Current container major version.
pub const VERSION_MAJOR: u16 = 1;
/// Current container minor version.
pub const VERSION_MINOR: u16 = 0;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 32;
/// Segment table entry size in bytes.
pub const SEGMENT_ENTRY_SIZE: usize = 8;

/// Segment type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// Executable bytecode.
    Code,
    /// Initialized data.
    Data,
    /// Uninitialized data.
    Bss,
    /// Retentive variables.
    Retain,
    /// I/O mapping table.
    IoMap,
    /// Symbol table.
    SymTab,
    /// Debug information.
    Debug,
    /// Task definitions.
    Task,
    /// Variable tags (networking metadata).
    Tags,
    /// Unrecognized segment type, preserved verbatim.
    Unknown(u16),
}

impl From<u16> for SegmentKind {
    fn from(value: u16) -> Self {
        match value {
            0x01 => Self::Code,
            0x02 => Self::Data,
            0x03 => Self::Bss,
            0x04 => Self::Retain,
            0x05 => Self::IoMap,
            0x10 => Self::SymTab,
            0x11 => Self::Debug,
            0x20 => Self::Task,
            0x30 => Self::Tags,
            other => Self::Unknown(other),
        }
    }
}

impl SegmentKind {
    /// Wire value of this segment kind.
    pub fn as_u16(self) -> u16 {
        match self {
            Self::Code => 0x01,
            Self::Data => 0x02,
            Self::Bss => 0x03,
            Self::Retain => 0x04,
            Self::IoMap => 0x05,
            Self::SymTab => 0x10,
            Self::Debug => 0x11,
            Self::Task => 0x20,
            Self::Tags => 0x30,
            Self::Unknown(v) => v,
        }
    }
}

/// One segment: table entry plus body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub kind: SegmentKind,
    pub flags: u16,
    pub data: Vec<u8>,
}

/// A parsed or to-be-encoded module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    pub version: (u16, u16),
    pub flags: u32,
    pub entry_point: u16,
    pub segments: Vec<Segment>,
}

/// Container encode/parse failure.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("module data too short: {0} bytes")]
    TooShort(usize),

    #[error("bad magic: 0x{0:08X}")]
    BadMagic(u32),

    #[error("unsupported module version {0}.{1}")]
    UnsupportedVersion(u16, u16),

    #[error("segment table or body truncated")]
    Truncated,
}

fn read_u16(cursor: &mut Cursor<&[u8]>) -> Result<u16, ModuleError> {
    cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| ModuleError::Truncated)
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32, ModuleError> {
    cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| ModuleError::Truncated)
}

impl Module {
    /// Minimal module: one code segment and an entry point.
    pub fn with_code(code: Vec<u8>, entry_point: u16) -> Self {
        Module {
            version: (VERSION_MAJOR, VERSION_MINOR),
            flags: 0,
            entry_point,
            segments: vec![Segment {
                kind: SegmentKind::Code,
                flags: 0,
                data: code,
            }],
        }
    }

    /// The code segment body, if present.
    pub fn code(&self) -> Option<&[u8]> {
        self.segments
            .iter()
            .find(|s| s.kind == SegmentKind::Code)
            .map(|s| s.data.as_slice())
    }

    fn size_of(&self, kind: SegmentKind) -> u32 {
        self.segments
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| s.data.len() as u32)
            .sum()
    }

    /// Encode as header + segment table + bodies.
    ///
    /// Deterministic: the same module always encodes to the same bytes.
    pub fn encode(&self) -> Vec<u8> {
        let total: usize = HEADER_SIZE
            + self.segments.len() * SEGMENT_ENTRY_SIZE
            + self.segments.iter().map(|s| s.data.len()).sum::<usize>();
        let mut out = Vec::with_capacity(total);

        out.extend_from_slice(&MODULE_MAGIC.to_le_bytes());
        out.extend_from_slice(&self.version.0.to_le_bytes());
        out.extend_from_slice(&self.version.1.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        // Checksum: reserved, not yet computed.
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&self.size_of(SegmentKind::Code).to_le_bytes());
        out.extend_from_slice(&self.size_of(SegmentKind::Data).to_le_bytes());
        out.extend_from_slice(&self.entry_point.to_le_bytes());
        out.extend_from_slice(&(self.segments.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        debug_assert_eq!(out.len(), HEADER_SIZE);

        for segment in &self.segments {
            out.extend_from_slice(&segment.kind.as_u16().to_le_bytes());
            out.extend_from_slice(&segment.flags.to_le_bytes());
            out.extend_from_slice(&(segment.data.len() as u32).to_le_bytes());
        }
        for segment in &self.segments {
            out.extend_from_slice(&segment.data);
        }
        out
    }

    /// Parse a module from bytes, validating magic, version, and bounds.
    ///
    /// The checksum field is ignored (see module docs).
    pub fn parse(data: &[u8]) -> Result<Module, ModuleError> {
        if data.len() < HEADER_SIZE {
            return Err(ModuleError::TooShort(data.len()));
        }

        let mut cursor = Cursor::new(data);

        let magic = read_u32(&mut cursor)?;
        if magic != MODULE_MAGIC {
            return Err(ModuleError::BadMagic(magic));
        }
        let version_major = read_u16(&mut cursor)?;
        let version_minor = read_u16(&mut cursor)?;
        if version_major != VERSION_MAJOR {
            return Err(ModuleError::UnsupportedVersion(version_major, version_minor));
        }
        let flags = read_u32(&mut cursor)?;
        let _checksum = read_u32(&mut cursor)?;
        let _code_size = read_u32(&mut cursor)?;
        let _data_size = read_u32(&mut cursor)?;
        let entry_point = read_u16(&mut cursor)?;
        let segment_count = read_u16(&mut cursor)? as usize;
        let _reserved = read_u32(&mut cursor)?;

        let table_end = HEADER_SIZE + segment_count * SEGMENT_ENTRY_SIZE;
        if data.len() < table_end {
            return Err(ModuleError::Truncated);
        }

        let mut entries = Vec::with_capacity(segment_count);
        for _ in 0..segment_count {
            let kind = SegmentKind::from(read_u16(&mut cursor)?);
            let seg_flags = read_u16(&mut cursor)?;
            let size = read_u32(&mut cursor)? as usize;
            entries.push((kind, seg_flags, size));
        }

        let mut offset = table_end;
        let mut segments = Vec::with_capacity(segment_count);
        for (kind, seg_flags, size) in entries {
            let end = offset.checked_add(size).ok_or(ModuleError::Truncated)?;
            if data.len() < end {
                return Err(ModuleError::Truncated);
            }
            segments.push(Segment {
                kind,
                flags: seg_flags,
                data: data[offset..end].to_vec(),
            });
            offset = end;
        }

        Ok(Module {
            version: (version_major, version_minor),
            flags,
            entry_point,
            segments,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_layout() {
        let module = Module::with_code(vec![0x40, 10, 0x01], 0);
        let bytes = module.encode();

        assert_eq!(bytes.len(), HEADER_SIZE + SEGMENT_ENTRY_SIZE + 3);
        // Magic reads "PLCM" in the file.
        assert_eq!(&bytes[0..4], b"PLCM");
        // Version 1.0.
        assert_eq!(&bytes[4..8], &[1, 0, 0, 0]);
        // Checksum stays zero.
        assert_eq!(&bytes[12..16], &[0, 0, 0, 0]);
        // code_size = 3, data_size = 0.
        assert_eq!(&bytes[16..20], &[3, 0, 0, 0]);
        assert_eq!(&bytes[20..24], &[0, 0, 0, 0]);
        // Segment entry: kind=code, flags=0, size=3.
        assert_eq!(&bytes[32..40], &[1, 0, 0, 0, 3, 0, 0, 0]);
        // Body.
        assert_eq!(&bytes[40..], &[0x40, 10, 0x01]);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let module = Module::with_code(vec![0x20, 0x01], 7);
        assert_eq!(module.encode(), module.encode());
    }

    #[test]
    fn test_parse_round_trip() {
        let module = Module {
            version: (VERSION_MAJOR, VERSION_MINOR),
            flags: 0x04,
            entry_point: 0x10,
            segments: vec![
                Segment {
                    kind: SegmentKind::Code,
                    flags: 0,
                    data: vec![0x00, 0x01],
                },
                Segment {
                    kind: SegmentKind::Data,
                    flags: 1,
                    data: vec![0xAA; 16],
                },
            ],
        };
        let parsed = Module::parse(&module.encode()).unwrap();
        assert_eq!(parsed, module);
        assert_eq!(parsed.code(), Some(&[0x00, 0x01][..]));
    }

    #[test]
    fn test_parse_rejects_bad_magic() {
        let mut bytes = Module::with_code(vec![0x01], 0).encode();
        bytes[0] = b'X';
        assert!(matches!(
            Module::parse(&bytes),
            Err(ModuleError::BadMagic(_))
        ));
    }

    #[test]
    fn test_parse_rejects_truncation() {
        let bytes = Module::with_code(vec![0x01, 0x02, 0x03], 0).encode();
        assert!(matches!(
            Module::parse(&bytes[..HEADER_SIZE - 1]),
            Err(ModuleError::TooShort(_))
        ));
        assert!(matches!(
            Module::parse(&bytes[..bytes.len() - 1]),
            Err(ModuleError::Truncated)
        ));
    }

    #[test]
    fn test_unknown_segment_kind_preserved() {
        assert_eq!(SegmentKind::from(0x99), SegmentKind::Unknown(0x99));
        assert_eq!(SegmentKind::Unknown(0x99).as_u16(), 0x99);
    }
}
