//! Region-file ("`.mca`") container format.
//!
//! One region file stores up to 32×32 chunk payloads in 4096-byte sectors.
//! The first two sectors hold the locator table (1024 big-endian entries of
//! `(sectorOffset << 8) | sectorCount`, 0 = absent) and the timestamp table
//! (ignored on read, zero-filled on write). Each occupied payload starts
//! with a 4-byte big-endian length `L`, one compression-scheme byte
//! (1 = gzip, 2 = zlib), then `L-1` compressed bytes, padded to a sector
//! boundary.
//!
//! The file is never compacted: payloads are overwritten in place when they
//! still fit, otherwise moved to a free run of sectors (extending the file
//! when no run exists) while the old sectors return to the free pool.

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

pub const SECTOR_BYTES: usize = 4096;
const CHUNKS_PER_REGION: usize = 1024;
/// The locator's sector-count field is one byte.
const MAX_SECTORS_PER_CHUNK: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionScheme {
    Gzip = 1,
    Zlib = 2,
}

impl CompressionScheme {
    pub fn from_byte(b: u8) -> Option<CompressionScheme> {
        match b {
            1 => Some(CompressionScheme::Gzip),
            2 => Some(CompressionScheme::Zlib),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegionError {
    #[error("chunk ({0}, {1}) is not present in this region")]
    NotPresent(i32, i32),

    #[error("chunk ({cx}, {cz}) payload is malformed: {reason}")]
    Malformed { cx: i32, cz: i32, reason: String },

    #[error("chunk payload needs {0} sectors, more than the 255-sector slot limit")]
    TooBig(usize),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// An open region file with its locator table and free-sector map.
#[derive(Debug)]
pub struct RegionFile {
    file: File,
    path: PathBuf,
    region_pos: (i32, i32),
    offsets: Vec<u32>,
    free_sectors: Vec<bool>,
}

impl RegionFile {
    /// Open (or create) the region file at `path`. A zero-length or
    /// header-truncated file is reinitialized as an empty region; a file not
    /// ending on a sector boundary is padded.
    pub fn open(path: impl Into<PathBuf>, region_pos: (i32, i32)) -> Result<RegionFile, RegionError> {
        let path = path.into();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut size = file.metadata()?.len() as usize;
        if size < 2 * SECTOR_BYTES {
            if size != 0 {
                warn!(path = %path.display(), size, "region header truncated, resetting");
            }
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&[0u8; 2 * SECTOR_BYTES])?;
            size = 2 * SECTOR_BYTES;
        }
        if size % SECTOR_BYTES != 0 {
            let padded = size + SECTOR_BYTES - size % SECTOR_BYTES;
            file.set_len(padded as u64)?;
            size = padded;
        }

        let mut header = [0u8; SECTOR_BYTES];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        let mut offsets: Vec<u32> = header
            .chunks_exact(4)
            .map(|b| u32::from_be_bytes(b.try_into().unwrap()))
            .collect();
        debug_assert_eq!(offsets.len(), CHUNKS_PER_REGION);

        let sector_count = size / SECTOR_BYTES;
        let mut free_sectors = vec![true; sector_count];
        free_sectors[0] = false;
        free_sectors[1] = false;

        for (index, entry) in offsets.iter_mut().enumerate() {
            let offset = (*entry >> 8) as usize;
            let count = (*entry & 0xff) as usize;
            if offset == 0 {
                continue;
            }
            if offset < 2 || offset + count > sector_count {
                warn!(
                    index,
                    offset, count, "locator entry points outside the file, dropping slot"
                );
                *entry = 0;
                continue;
            }
            for sector in free_sectors.iter_mut().skip(offset).take(count) {
                *sector = false;
            }
        }

        Ok(RegionFile {
            file,
            path,
            region_pos,
            offsets,
            free_sectors,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn region_pos(&self) -> (i32, i32) {
        self.region_pos
    }

    fn index(cx: i32, cz: i32) -> usize {
        ((cx & 0x1f) + (cz & 0x1f) * 32) as usize
    }

    fn entry(&self, cx: i32, cz: i32) -> u32 {
        self.offsets[Self::index(cx, cz)]
    }

    fn set_entry(&mut self, cx: i32, cz: i32, entry: u32) -> Result<(), RegionError> {
        let index = Self::index(cx, cz);
        self.offsets[index] = entry;
        self.file.seek(SeekFrom::Start(index as u64 * 4))?;
        self.file.write_all(&entry.to_be_bytes())?;
        Ok(())
    }

    pub fn contains_chunk(&self, cx: i32, cz: i32) -> bool {
        self.entry(cx, cz) >> 8 != 0
    }

    /// Number of occupied chunk slots.
    pub fn chunk_count(&self) -> usize {
        self.offsets.iter().filter(|&&e| e >> 8 != 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.chunk_count() == 0
    }

    /// Chunk positions (absolute coordinates) of every occupied slot.
    pub fn chunk_positions(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        let (rx, rz) = self.region_pos;
        self.offsets
            .iter()
            .enumerate()
            .filter(|(_, &e)| e >> 8 != 0)
            .map(move |(i, _)| ((rx << 5) + (i & 0x1f) as i32, (rz << 5) + (i >> 5) as i32))
    }

    fn malformed(cx: i32, cz: i32, reason: impl Into<String>) -> RegionError {
        RegionError::Malformed {
            cx,
            cz,
            reason: reason.into(),
        }
    }

    /// Read and decompress the payload for chunk `(cx, cz)`.
    pub fn read_chunk(&mut self, cx: i32, cz: i32) -> Result<Vec<u8>, RegionError> {
        let entry = self.entry(cx, cz);
        let offset = (entry >> 8) as usize;
        let allocated = (entry & 0xff) as usize;
        if offset == 0 {
            return Err(RegionError::NotPresent(cx, cz));
        }

        self.file
            .seek(SeekFrom::Start((offset * SECTOR_BYTES) as u64))?;
        let mut head = [0u8; 5];
        self.file
            .read_exact(&mut head)
            .map_err(|e| Self::malformed(cx, cz, format!("unreadable payload header: {e}")))?;

        let length = u32::from_be_bytes(head[..4].try_into().unwrap()) as usize;
        if length < 1 {
            return Err(Self::malformed(cx, cz, "zero-length payload"));
        }
        if 4 + length > allocated * SECTOR_BYTES {
            return Err(Self::malformed(
                cx,
                cz,
                format!("declared length {length} exceeds {allocated} allocated sectors"),
            ));
        }

        let scheme = CompressionScheme::from_byte(head[4])
            .ok_or_else(|| Self::malformed(cx, cz, format!("unknown compression scheme {}", head[4])))?;

        let mut compressed = vec![0u8; length - 1];
        self.file
            .read_exact(&mut compressed)
            .map_err(|e| Self::malformed(cx, cz, format!("truncated payload: {e}")))?;

        let mut data = Vec::new();
        let result = match scheme {
            CompressionScheme::Gzip => GzDecoder::new(compressed.as_slice()).read_to_end(&mut data),
            CompressionScheme::Zlib => ZlibDecoder::new(compressed.as_slice()).read_to_end(&mut data),
        };
        result.map_err(|e| Self::malformed(cx, cz, format!("decompression failed: {e}")))?;
        Ok(data)
    }

    /// Compress and store the payload for chunk `(cx, cz)`. The payload is
    /// written into its sectors before the locator entry points at it, so an
    /// interrupted save leaves the previous content reachable.
    pub fn save_chunk(&mut self, cx: i32, cz: i32, data: &[u8]) -> Result<(), RegionError> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data)?;
        let compressed = encoder.finish()?;

        let total = 4 + 1 + compressed.len();
        let needed = total.div_ceil(SECTOR_BYTES);
        if needed > MAX_SECTORS_PER_CHUNK {
            return Err(RegionError::TooBig(needed));
        }

        let entry = self.entry(cx, cz);
        let old_offset = (entry >> 8) as usize;
        let old_count = (entry & 0xff) as usize;

        let offset = if old_offset != 0 && needed <= old_count {
            // Fits in place; tail sectors go back to the free pool.
            for sector in self
                .free_sectors
                .iter_mut()
                .skip(old_offset + needed)
                .take(old_count - needed)
            {
                *sector = true;
            }
            old_offset
        } else {
            if old_offset != 0 {
                for sector in self.free_sectors.iter_mut().skip(old_offset).take(old_count) {
                    *sector = true;
                }
            }
            self.allocate(needed)?
        };

        self.write_sectors(offset, needed, &compressed)?;
        self.set_entry(cx, cz, ((offset as u32) << 8) | needed as u32)?;
        Ok(())
    }

    /// First-fit scan for `needed` consecutive free sectors; extends the
    /// file when no run exists.
    fn allocate(&mut self, needed: usize) -> Result<usize, RegionError> {
        let mut run_start = 0;
        let mut run_len = 0;
        for (sector, &free) in self.free_sectors.iter().enumerate().skip(2) {
            if free {
                if run_len == 0 {
                    run_start = sector;
                }
                run_len += 1;
                if run_len == needed {
                    for s in self.free_sectors.iter_mut().skip(run_start).take(needed) {
                        *s = false;
                    }
                    return Ok(run_start);
                }
            } else {
                run_len = 0;
            }
        }

        let offset = self.free_sectors.len();
        self.free_sectors.extend(std::iter::repeat(false).take(needed));
        self.file
            .set_len(((offset + needed) * SECTOR_BYTES) as u64)?;
        Ok(offset)
    }

    fn write_sectors(
        &mut self,
        offset: usize,
        sectors: usize,
        compressed: &[u8],
    ) -> Result<(), RegionError> {
        let mut payload = Vec::with_capacity(sectors * SECTOR_BYTES);
        payload.extend_from_slice(&(compressed.len() as u32 + 1).to_be_bytes());
        payload.push(CompressionScheme::Zlib as u8);
        payload.extend_from_slice(compressed);
        payload.resize(sectors * SECTOR_BYTES, 0);

        self.file
            .seek(SeekFrom::Start((offset * SECTOR_BYTES) as u64))?;
        self.file.write_all(&payload)?;
        Ok(())
    }

    /// Remove the chunk's locator entry and free its sectors. The payload
    /// bytes stay in the file until the space is reused.
    pub fn delete_chunk(&mut self, cx: i32, cz: i32) -> Result<(), RegionError> {
        let entry = self.entry(cx, cz);
        let offset = (entry >> 8) as usize;
        let count = (entry & 0xff) as usize;
        if offset != 0 {
            for sector in self.free_sectors.iter_mut().skip(offset).take(count) {
                *sector = true;
            }
        }
        self.set_entry(cx, cz, 0)
    }

    /// Flush and release the file handle.
    pub fn close(self) -> Result<(), RegionError> {
        self.file.sync_all()?;
        Ok(())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
