//! .odb segment file format
//!
//! # File structure
//!
//! ```text
//! Offset   Size        Description
//! ─────────────────────────────────────────────────────────
//! 0x00     8           Magic: "OSTDB001"
//! 0x08     4           u32 LE  version (currently 1)
//! 0x0C     4           u32 LE  flags (bit 0: HAS_IVF)
//! 0x10     4           u32 LE  row count
//! 0x14     4           u32 LE  dimension
//! 0x18     4           u32 LE  nlist (0 when no index)
//! 0x1C     4           reserved
//! 0x20     8           u64 LE  ids section offset
//! 0x28     8           u64 LE  vectors section offset
//! 0x30     8           u64 LE  index section offset (0 when absent)
//! 0x38     8           reserved
//! ids      N*8         i64 LE vector ids
//! vectors  N*D*4       f32 LE row-major vector data
//! index    K*D*4+N*4   f32 LE centroids, then u32 LE per-row list ids
//! ```
//!
//! Writes go to a sibling temp file and are renamed into place, with the
//! file and its parent directory fsynced, so a segment is either fully
//! present at its location or absent.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use thiserror::Error;

/// Magic bytes identifying a .odb segment file.
pub const MAGIC: [u8; 8] = *b"OSTDB001";

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 64;

pub const FORMAT_VERSION: u32 = 1;

pub mod flags {
    /// Segment carries a coarse IVF index section.
    pub const HAS_IVF: u32 = 1;
}

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("invalid magic bytes: expected OSTDB001")]
    InvalidMagic,

    #[error("unsupported format version {0}")]
    UnsupportedVersion(u32),

    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("segment truncated: section {section} ends at {end} but file has {len} bytes")]
    Truncated {
        section: &'static str,
        end: u64,
        len: u64,
    },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Parsed segment header.
#[derive(Debug, Clone, Copy)]
pub struct SegmentHeader {
    pub version: u32,
    pub flags: u32,
    pub row_count: u32,
    pub dim: u32,
    pub nlist: u32,
    pub ids_offset: u64,
    pub vectors_offset: u64,
    pub index_offset: u64,
}

impl SegmentHeader {
    pub fn has_ivf(&self) -> bool {
        self.flags & flags::HAS_IVF != 0 && self.index_offset > 0
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FormatError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "file too small for header",
            )));
        }
        if bytes[0..8] != MAGIC {
            return Err(FormatError::InvalidMagic);
        }

        let u32_at = |off: usize| u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
        let u64_at = |off: usize| u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap());

        let version = u32_at(0x08);
        if version != FORMAT_VERSION {
            return Err(FormatError::UnsupportedVersion(version));
        }

        Ok(Self {
            version,
            flags: u32_at(0x0C),
            row_count: u32_at(0x10),
            dim: u32_at(0x14),
            nlist: u32_at(0x18),
            ids_offset: u64_at(0x20),
            vectors_offset: u64_at(0x28),
            index_offset: u64_at(0x30),
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&MAGIC);
        buf[0x08..0x0C].copy_from_slice(&self.version.to_le_bytes());
        buf[0x0C..0x10].copy_from_slice(&self.flags.to_le_bytes());
        buf[0x10..0x14].copy_from_slice(&self.row_count.to_le_bytes());
        buf[0x14..0x18].copy_from_slice(&self.dim.to_le_bytes());
        buf[0x18..0x1C].copy_from_slice(&self.nlist.to_le_bytes());
        buf[0x20..0x28].copy_from_slice(&self.ids_offset.to_le_bytes());
        buf[0x28..0x30].copy_from_slice(&self.vectors_offset.to_le_bytes());
        buf[0x30..0x38].copy_from_slice(&self.index_offset.to_le_bytes());
        buf
    }
}

/// Optional IVF section payload.
#[derive(Debug, Clone, Default)]
pub struct IvfSection {
    /// `nlist * dim` row-major centroid table.
    pub centroids: Vec<f32>,
    /// Per-row coarse list assignment, `row_count` entries.
    pub assignments: Vec<u32>,
    pub nlist: u32,
}

/// Fully decoded segment file.
#[derive(Debug, Clone)]
pub struct SegmentFile {
    pub header: SegmentHeader,
    pub ids: Vec<i64>,
    /// `row_count * dim` row-major vector data.
    pub vectors: Vec<f32>,
    pub ivf: Option<IvfSection>,
}

/// Write a complete segment at `path` via temp file + rename.
///
/// `ids.len()` must equal `vectors.len() / dim`; the IVF section, when
/// present, must carry one assignment per row.
pub fn write_segment(
    path: &Path,
    dim: usize,
    ids: &[i64],
    vectors: &[f32],
    ivf: Option<&IvfSection>,
) -> Result<u64, FormatError> {
    if dim == 0 || vectors.len() != ids.len() * dim {
        return Err(FormatError::DimensionMismatch {
            expected: ids.len() * dim,
            actual: vectors.len(),
        });
    }

    let row_count = ids.len() as u32;
    let ids_offset = HEADER_SIZE as u64;
    let vectors_offset = ids_offset + ids.len() as u64 * 8;
    let vectors_end = vectors_offset + vectors.len() as u64 * 4;
    let (index_offset, nlist, file_flags) = match ivf {
        Some(section) => (vectors_end, section.nlist, flags::HAS_IVF),
        None => (0, 0, 0),
    };

    let header = SegmentHeader {
        version: FORMAT_VERSION,
        flags: file_flags,
        row_count,
        dim: dim as u32,
        nlist,
        ids_offset,
        vectors_offset,
        index_offset,
    };

    let tmp_path = path.with_extension("odb.tmp");
    {
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&header.to_bytes())?;
        for id in ids {
            writer.write_all(&id.to_le_bytes())?;
        }
        for v in vectors {
            writer.write_all(&v.to_le_bytes())?;
        }
        if let Some(section) = ivf {
            for c in &section.centroids {
                writer.write_all(&c.to_le_bytes())?;
            }
            for a in &section.assignments {
                writer.write_all(&a.to_le_bytes())?;
            }
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }

    std::fs::rename(&tmp_path, path)?;
    sync_parent(path)?;
    Ok(std::fs::metadata(path)?.len())
}

/// Read and decode a whole segment file.
pub fn read_segment(path: &Path) -> Result<SegmentFile, FormatError> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let mut header_bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_bytes)?;
    let header = SegmentHeader::from_bytes(&header_bytes)?;

    let rows = header.row_count as usize;
    let dim = header.dim as usize;

    let ids_end = header.ids_offset + rows as u64 * 8;
    let vectors_end = header.vectors_offset + (rows * dim) as u64 * 4;
    if ids_end > file_len {
        return Err(FormatError::Truncated {
            section: "ids",
            end: ids_end,
            len: file_len,
        });
    }
    if vectors_end > file_len {
        return Err(FormatError::Truncated {
            section: "vectors",
            end: vectors_end,
            len: file_len,
        });
    }

    let mut ids = Vec::with_capacity(rows);
    let mut buf8 = [0u8; 8];
    for _ in 0..rows {
        reader.read_exact(&mut buf8)?;
        ids.push(i64::from_le_bytes(buf8));
    }

    let mut vectors = Vec::with_capacity(rows * dim);
    let mut buf4 = [0u8; 4];
    for _ in 0..rows * dim {
        reader.read_exact(&mut buf4)?;
        vectors.push(f32::from_le_bytes(buf4));
    }

    let ivf = if header.has_ivf() {
        let nlist = header.nlist as usize;
        let index_end = header.index_offset + (nlist * dim) as u64 * 4 + rows as u64 * 4;
        if index_end > file_len {
            return Err(FormatError::Truncated {
                section: "index",
                end: index_end,
                len: file_len,
            });
        }

        let mut centroids = Vec::with_capacity(nlist * dim);
        for _ in 0..nlist * dim {
            reader.read_exact(&mut buf4)?;
            centroids.push(f32::from_le_bytes(buf4));
        }
        let mut assignments = Vec::with_capacity(rows);
        for _ in 0..rows {
            reader.read_exact(&mut buf4)?;
            assignments.push(u32::from_le_bytes(buf4));
        }
        Some(IvfSection {
            centroids,
            assignments,
            nlist: header.nlist,
        })
    } else {
        None
    };

    Ok(SegmentFile {
        header,
        ids,
        vectors,
        ivf,
    })
}

/// Fsync the parent directory so a rename survives a crash.
pub fn sync_parent(path: &Path) -> Result<(), io::Error> {
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent() {
            File::open(parent)?.sync_all()?;
        }
    }
    Ok(())
}
