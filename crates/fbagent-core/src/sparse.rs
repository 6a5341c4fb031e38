//! Android sparse image codec and the plain gzip path.
//!
//! A sparse image is a 28-byte file header followed by `total_chunks`
//! chunks, each a 12-byte chunk header plus payload:
//!
//! | type      | payload          | effect on destination            |
//! |-----------|------------------|----------------------------------|
//! | RAW       | `blocks * blk_sz`| bytes written verbatim           |
//! | FILL      | 4-byte pattern   | pattern repeated over the blocks |
//! | DONT_CARE | none             | cursor advanced, nothing written |
//! | CRC32     | 4-byte checksum  | nothing (validation only)        |
//!
//! The whole chunk table is validated before the destination is touched, so
//! a corrupt image never leaves a partial write behind. The same holds for an
//! image whose expanded size does not fit the destination.

use std::io::{self, Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;
use tracing::{debug, instrument};
use zune_inflate::errors::DecodeErrorStatus;
use zune_inflate::{DeflateDecoder, DeflateOptions};

use crate::error::ErrorKind;

pub const SPARSE_HEADER_MAGIC: u32 = 0xED26_FF3A;
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

const SPARSE_HEADER_MAJOR_VER: u16 = 1;
const SPARSE_HEADER_SIZE: u16 = 28;
const CHUNK_HEADER_SIZE: u16 = 12;

const CHUNK_TYPE_RAW: u16 = 0xCAC1;
const CHUNK_TYPE_FILL: u16 = 0xCAC2;
const CHUNK_TYPE_DONT_CARE: u16 = 0xCAC3;
const CHUNK_TYPE_CRC32: u16 = 0xCAC4;

const FILL_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum SparseError {
    #[error("image too short for a sparse header")]
    TooShort,

    #[error("bad sparse magic 0x{0:08X}")]
    BadMagic(u32),

    #[error("unsupported sparse version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    #[error("bad sparse header sizes (file {file_hdr_sz}, chunk {chunk_hdr_sz})")]
    BadHeaderSize { file_hdr_sz: u16, chunk_hdr_sz: u16 },

    #[error("bad block size {0}")]
    BadBlockSize(u32),

    #[error("Bogus chunk size for chunk {index}, type 0x{chunk_type:04X}")]
    BogusChunk { index: u32, chunk_type: u16 },

    #[error("Unknown chunk type 0x{chunk_type:04X} in chunk {index}")]
    UnknownChunkType { index: u32, chunk_type: u16 },

    #[error("image truncated in chunk {index}")]
    Truncated { index: u32 },

    #[error("wrote {actual} blocks, expected {expected}")]
    BlockCountMismatch { expected: u64, actual: u64 },

    #[error("image expands to {needed} bytes, destination holds {available}")]
    TooLarge { needed: u64, available: u64 },

    #[error("gzip: {0}")]
    Gzip(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl SparseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SparseError::Io(_) => ErrorKind::Storage,
            SparseError::TooLarge { .. } => ErrorKind::Capacity,
            _ => ErrorKind::Format,
        }
    }
}

/// Parsed sparse file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseHeader {
    pub major_version: u16,
    pub minor_version: u16,
    pub file_hdr_sz: u16,
    pub chunk_hdr_sz: u16,
    pub block_size: u32,
    pub total_blocks: u32,
    pub total_chunks: u32,
    pub image_checksum: u32,
}

impl SparseHeader {
    /// Read and check the header, then skip any extra header bytes.
    pub fn read_from<R: Read + ?Sized>(src: &mut R) -> Result<Self, SparseError> {
        let magic = src.read_u32::<LittleEndian>().map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => SparseError::TooShort,
            _ => SparseError::Io(e),
        })?;
        if magic != SPARSE_HEADER_MAGIC {
            return Err(SparseError::BadMagic(magic));
        }
        let header = Self {
            major_version: src.read_u16::<LittleEndian>()?,
            minor_version: src.read_u16::<LittleEndian>()?,
            file_hdr_sz: src.read_u16::<LittleEndian>()?,
            chunk_hdr_sz: src.read_u16::<LittleEndian>()?,
            block_size: src.read_u32::<LittleEndian>()?,
            total_blocks: src.read_u32::<LittleEndian>()?,
            total_chunks: src.read_u32::<LittleEndian>()?,
            image_checksum: src.read_u32::<LittleEndian>()?,
        };
        if header.major_version != SPARSE_HEADER_MAJOR_VER {
            return Err(SparseError::UnsupportedVersion {
                major: header.major_version,
                minor: header.minor_version,
            });
        }
        if header.file_hdr_sz < SPARSE_HEADER_SIZE || header.chunk_hdr_sz < CHUNK_HEADER_SIZE {
            return Err(SparseError::BadHeaderSize {
                file_hdr_sz: header.file_hdr_sz,
                chunk_hdr_sz: header.chunk_hdr_sz,
            });
        }
        if header.block_size == 0 || header.block_size % 4 != 0 {
            return Err(SparseError::BadBlockSize(header.block_size));
        }
        skip(src, u64::from(header.file_hdr_sz - SPARSE_HEADER_SIZE))?;
        Ok(header)
    }

    /// Size of the unsparsed image in bytes.
    pub fn data_size(&self) -> u64 {
        u64::from(self.total_blocks) * u64::from(self.block_size)
    }
}

/// Decoded chunk type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Raw,
    Fill,
    DontCare,
    Crc32,
}

#[derive(Debug, Clone, Copy)]
struct Chunk {
    kind: ChunkKind,
    blocks: u32,
    /// Payload bytes following the chunk header.
    payload: u64,
    /// Bytes this chunk covers on the destination.
    span: u64,
}

impl Chunk {
    fn read_from<R: Read + ?Sized>(
        src: &mut R,
        header: &SparseHeader,
        index: u32,
    ) -> Result<Self, SparseError> {
        let eof = |e: io::Error| match e.kind() {
            io::ErrorKind::UnexpectedEof => SparseError::Truncated { index },
            _ => SparseError::Io(e),
        };
        let chunk_type = src.read_u16::<LittleEndian>().map_err(eof)?;
        let _reserved = src.read_u16::<LittleEndian>().map_err(eof)?;
        let blocks = src.read_u32::<LittleEndian>().map_err(eof)?;
        let total_sz = src.read_u32::<LittleEndian>().map_err(eof)?;
        skip(src, u64::from(header.chunk_hdr_sz - CHUNK_HEADER_SIZE)).map_err(eof)?;

        let span = u64::from(blocks) * u64::from(header.block_size);
        let (kind, payload) = match chunk_type {
            CHUNK_TYPE_RAW => (ChunkKind::Raw, span),
            CHUNK_TYPE_FILL => (ChunkKind::Fill, 4),
            CHUNK_TYPE_DONT_CARE => (ChunkKind::DontCare, 0),
            CHUNK_TYPE_CRC32 => (ChunkKind::Crc32, 4),
            _ => return Err(SparseError::UnknownChunkType { index, chunk_type }),
        };
        if u64::from(total_sz) != u64::from(header.chunk_hdr_sz) + payload {
            return Err(SparseError::BogusChunk { index, chunk_type });
        }
        let span = match kind {
            ChunkKind::Crc32 => 0,
            _ => span,
        };
        Ok(Self {
            kind,
            blocks,
            payload,
            span,
        })
    }
}

/// Result of a successful sparse write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseSummary {
    pub blocks: u64,
    pub bytes_written: u64,
}

/// Probe for the sparse magic.
pub fn is_sparse(bytes: &[u8]) -> bool {
    bytes.len() >= 4
        && u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) == SPARSE_HEADER_MAGIC
}

/// Probe for a gzip member header.
pub fn is_gzip(bytes: &[u8]) -> bool {
    bytes.starts_with(&GZIP_MAGIC)
}

fn skip<R: Read + ?Sized>(src: &mut R, n: u64) -> io::Result<()> {
    if n == 0 {
        return Ok(());
    }
    let skipped = io::copy(&mut (&mut *src).take(n), &mut io::sink())?;
    if skipped != n {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    Ok(())
}

/// Walk the chunk table without writing anything.
///
/// Checks every chunk header, that every payload is present, and that the
/// chunks add up to `total_blocks`. Leaves `src` positioned at its end.
pub fn validate<R: Read + Seek + ?Sized>(src: &mut R) -> Result<SparseHeader, SparseError> {
    let start = src.stream_position()?;
    let end = src.seek(SeekFrom::End(0))?;
    src.seek(SeekFrom::Start(start))?;

    let header = SparseHeader::read_from(src)?;
    let mut blocks = 0u64;
    for index in 0..header.total_chunks {
        let chunk = Chunk::read_from(src, &header, index)?;
        let pos = src.seek(SeekFrom::Current(chunk.payload as i64))?;
        if pos > end {
            return Err(SparseError::Truncated { index });
        }
        blocks += u64::from(chunk.blocks);
    }
    if blocks != u64::from(header.total_blocks) {
        return Err(SparseError::BlockCountMismatch {
            expected: u64::from(header.total_blocks),
            actual: blocks,
        });
    }
    Ok(header)
}

/// Expand a sparse image from `src` onto `dest` at `dest`'s current position.
///
/// `limit` is the room left on `dest`; an image expanding past it is
/// rejected before anything is written.
#[instrument(skip_all, fields(limit))]
pub fn write_sparse<R, W>(src: &mut R, dest: &mut W, limit: u64) -> Result<SparseSummary, SparseError>
where
    R: Read + Seek + ?Sized,
    W: Write + Seek + ?Sized,
{
    let start = src.stream_position()?;
    let checked = validate(src)?;
    if checked.data_size() > limit {
        return Err(SparseError::TooLarge {
            needed: checked.data_size(),
            available: limit,
        });
    }
    src.seek(SeekFrom::Start(start))?;

    let header = SparseHeader::read_from(src)?;
    debug!(
        block_size = header.block_size,
        total_blocks = header.total_blocks,
        total_chunks = header.total_chunks,
        "Writing sparse image"
    );

    let mut blocks = 0u64;
    let mut written = 0u64;
    for index in 0..header.total_chunks {
        let chunk = Chunk::read_from(src, &header, index)?;
        match chunk.kind {
            ChunkKind::Raw => {
                let copied = io::copy(&mut (&mut *src).take(chunk.payload), dest)?;
                if copied != chunk.payload {
                    return Err(SparseError::Truncated { index });
                }
                written += copied;
            }
            ChunkKind::Fill => {
                let pattern = src.read_u32::<LittleEndian>()?.to_le_bytes();
                let fill: Vec<u8> = pattern
                    .iter()
                    .copied()
                    .cycle()
                    .take(FILL_BUFFER_SIZE.min(chunk.span as usize))
                    .collect();
                let mut remaining = chunk.span;
                while remaining > 0 {
                    let n = remaining.min(fill.len() as u64) as usize;
                    dest.write_all(&fill[..n])?;
                    remaining -= n as u64;
                }
                written += chunk.span;
            }
            ChunkKind::DontCare => {
                dest.seek(SeekFrom::Current(chunk.span as i64))?;
            }
            ChunkKind::Crc32 => {
                let _crc = src.read_u32::<LittleEndian>()?;
            }
        }
        blocks += u64::from(chunk.blocks);
    }

    if blocks != u64::from(header.total_blocks) {
        return Err(SparseError::BlockCountMismatch {
            expected: u64::from(header.total_blocks),
            actual: blocks,
        });
    }
    dest.flush()?;
    Ok(SparseSummary {
        blocks,
        bytes_written: written,
    })
}

/// Decompress a gzip stream onto `dest`, returning the bytes written.
///
/// Inflation stops once the output would exceed `limit`, and nothing is
/// written unless the whole stream decodes within it.
#[instrument(skip_all, fields(len = compressed.len(), limit))]
pub fn write_gzip<W: Write + ?Sized>(
    compressed: &[u8],
    dest: &mut W,
    limit: u64,
) -> Result<u64, SparseError> {
    let options = DeflateOptions::default().set_limit(usize::try_from(limit).unwrap_or(usize::MAX));
    let data = DeflateDecoder::new_with_options(compressed, options)
        .decode_gzip()
        .map_err(|e| match e.error {
            DecodeErrorStatus::OutputLimitExceeded(..) => SparseError::TooLarge {
                needed: e.data.len() as u64,
                available: limit,
            },
            other => SparseError::Gzip(format!("{other:?}")),
        })?;
    if data.len() as u64 > limit {
        return Err(SparseError::TooLarge {
            needed: data.len() as u64,
            available: limit,
        });
    }
    dest.write_all(&data)?;
    dest.flush()?;
    debug!(inflated = data.len(), "Gzip image written");
    Ok(data.len() as u64)
}
