//! Chunk coordinate ↔ region file mapping for one on-disk folder.
//!
//! A world folder owns the `region/` directory of one dimension (or of the
//! unsaved-work staging area) and a cache of open [`RegionFile`] handles,
//! keyed by region position `(cx >> 5, cz >> 5)`.

use crate::error::WorldError;
use crate::regionfile::{RegionError, RegionFile};
use rustc_hash::{FxHashMap, FxHashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub struct WorldFolder {
    root: PathBuf,
    region_files: FxHashMap<(i32, i32), RegionFile>,
}

impl WorldFolder {
    /// Open a world folder, creating the directory if it does not exist.
    pub fn open(root: impl Into<PathBuf>) -> Result<WorldFolder, WorldError> {
        let root = root.into();
        if !root.exists() {
            fs::create_dir_all(&root)?;
        } else if !root.is_dir() {
            return Err(WorldError::NotAWorld(root.display().to_string()));
        }
        Ok(WorldFolder {
            root,
            region_files: FxHashMap::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a file inside the folder.
    pub fn file_path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Absolute path of a subfolder, created on demand.
    pub fn folder_path(&self, relative: &str) -> Result<PathBuf, WorldError> {
        let path = self.root.join(relative);
        if !path.exists() {
            fs::create_dir_all(&path)?;
        }
        Ok(path)
    }

    fn region_dir(&self) -> PathBuf {
        self.root.join("region")
    }

    pub fn region_filename(&self, rx: i32, rz: i32) -> PathBuf {
        self.region_dir().join(format!("r.{rx}.{rz}.mca"))
    }

    /// Parse `r.<rx>.<rz>.mca` into a region position.
    pub fn parse_region_filename(name: &str) -> Option<(i32, i32)> {
        let mut bits = name.split('.');
        if bits.next()? != "r" {
            return None;
        }
        let rx: i32 = bits.next()?.parse().ok()?;
        let rz: i32 = bits.next()?.parse().ok()?;
        if bits.next()? != "mca" || bits.next().is_some() {
            return None;
        }
        Some((rx, rz))
    }

    /// The open region file holding chunk `(cx, cz)`, opened (and created on
    /// disk) lazily.
    pub fn region_for_chunk(&mut self, cx: i32, cz: i32) -> Result<&mut RegionFile, WorldError> {
        self.region_file(cx >> 5, cz >> 5)
    }

    fn region_file(&mut self, rx: i32, rz: i32) -> Result<&mut RegionFile, WorldError> {
        if !self.region_files.contains_key(&(rx, rz)) {
            fs::create_dir_all(self.region_dir())?;
            let region = RegionFile::open(self.region_filename(rx, rz), (rx, rz))?;
            self.region_files.insert((rx, rz), region);
        }
        Ok(self.region_files.get_mut(&(rx, rz)).unwrap())
    }

    /// Flush and drop every cached region handle.
    pub fn close_regions(&mut self) -> Result<(), WorldError> {
        for (_, region) in self.region_files.drain() {
            region.close()?;
        }
        Ok(())
    }

    /// Scan the region directory and return every chunk position present.
    /// Region files found to contain zero live chunks are deleted.
    pub fn list_chunks(&mut self) -> Result<FxHashSet<(i32, i32)>, WorldError> {
        let mut chunks = FxHashSet::default();
        let region_dir = self.region_dir();
        if !region_dir.is_dir() {
            return Ok(chunks);
        }

        for entry in fs::read_dir(&region_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some((rx, rz)) = name.to_str().and_then(Self::parse_region_filename) else {
                continue;
            };

            let region = self.region_file(rx, rz)?;
            if region.is_empty() {
                info!(path = %entry.path().display(), "removing empty region file");
                let region = self.region_files.remove(&(rx, rz)).unwrap();
                region.close()?;
                fs::remove_file(entry.path())?;
            } else {
                chunks.extend(region.chunk_positions());
            }
        }

        debug!(root = %self.root.display(), count = chunks.len(), "scanned chunks");
        Ok(chunks)
    }

    pub fn contains_chunk(&mut self, cx: i32, cz: i32) -> Result<bool, WorldError> {
        let (rx, rz) = (cx >> 5, cz >> 5);
        // Don't create a region file just to answer "no".
        if !self.region_files.contains_key(&(rx, rz)) && !self.region_filename(rx, rz).exists() {
            return Ok(false);
        }
        Ok(self.region_file(rx, rz)?.contains_chunk(cx, cz))
    }

    /// Read the decompressed payload for chunk `(cx, cz)`.
    pub fn read_chunk(&mut self, cx: i32, cz: i32) -> Result<Vec<u8>, WorldError> {
        if !self.contains_chunk(cx, cz)? {
            return Err(WorldError::ChunkNotPresent(cx, cz));
        }
        match self.region_for_chunk(cx, cz)?.read_chunk(cx, cz) {
            Ok(data) => Ok(data),
            Err(RegionError::NotPresent(..)) => Err(WorldError::ChunkNotPresent(cx, cz)),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save_chunk(&mut self, cx: i32, cz: i32, data: &[u8]) -> Result<(), WorldError> {
        self.region_for_chunk(cx, cz)?.save_chunk(cx, cz, data)?;
        Ok(())
    }

    /// Drop the chunk from its region file, unlinking the file when it holds
    /// no other chunks.
    pub fn delete_chunk(&mut self, cx: i32, cz: i32) -> Result<(), WorldError> {
        let (rx, rz) = (cx >> 5, cz >> 5);
        if !self.region_files.contains_key(&(rx, rz)) && !self.region_filename(rx, rz).exists() {
            return Ok(());
        }
        let region = self.region_file(rx, rz)?;
        region.delete_chunk(cx, cz)?;
        if region.is_empty() {
            let region = self.region_files.remove(&(rx, rz)).unwrap();
            let path = region.path().to_path_buf();
            region.close()?;
            fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn copy_chunk_from(
        &mut self,
        source: &mut WorldFolder,
        cx: i32,
        cz: i32,
    ) -> Result<(), WorldError> {
        let data = source.read_chunk(cx, cz)?;
        self.save_chunk(cx, cz, &data)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_region_filename() {
        assert_eq!(WorldFolder::parse_region_filename("r.0.0.mca"), Some((0, 0)));
        assert_eq!(
            WorldFolder::parse_region_filename("r.-3.12.mca"),
            Some((-3, 12))
        );
        assert_eq!(WorldFolder::parse_region_filename("r.0.0.mcr"), None);
        assert_eq!(WorldFolder::parse_region_filename("r.0.mca"), None);
        assert_eq!(WorldFolder::parse_region_filename("x.0.0.mca"), None);
        assert_eq!(WorldFolder::parse_region_filename("r.a.b.mca"), None);
        assert_eq!(WorldFolder::parse_region_filename("r.0.0.mca.bak"), None);
    }

    #[test]
    fn test_save_read_across_region_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let mut folder = WorldFolder::open(dir.path()).unwrap();
        folder.save_chunk(0, 0, b"zero").unwrap();
        folder.save_chunk(-1, 40, b"negative").unwrap();

        assert_eq!(folder.read_chunk(0, 0).unwrap(), b"zero");
        assert_eq!(folder.read_chunk(-1, 40).unwrap(), b"negative");
        assert!(dir.path().join("region/r.0.0.mca").exists());
        assert!(dir.path().join("region/r.-1.1.mca").exists());
    }

    #[test]
    fn test_missing_chunk_is_not_present() {
        let dir = tempfile::tempdir().unwrap();
        let mut folder = WorldFolder::open(dir.path()).unwrap();
        assert!(!folder.contains_chunk(9, 9).unwrap());
        assert!(matches!(
            folder.read_chunk(9, 9),
            Err(WorldError::ChunkNotPresent(9, 9))
        ));
        // Probing must not have created a region file.
        assert!(!dir.path().join("region/r.0.0.mca").exists());
    }

    #[test]
    fn test_list_chunks_and_empty_region_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let mut folder = WorldFolder::open(dir.path()).unwrap();
        folder.save_chunk(1, 2, b"a").unwrap();
        folder.save_chunk(64, 0, b"b").unwrap();

        // An empty (header-only) region file should be swept away.
        let empty = dir.path().join("region/r.5.5.mca");
        std::fs::write(&empty, [0u8; 8192]).unwrap();
        // Junk filenames are ignored.
        std::fs::write(dir.path().join("region/notes.txt"), b"hi").unwrap();

        let chunks = folder.list_chunks().unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks.contains(&(1, 2)));
        assert!(chunks.contains(&(64, 0)));
        assert!(!empty.exists(), "empty region file should be unlinked");
    }

    #[test]
    fn test_delete_last_chunk_unlinks_region() {
        let dir = tempfile::tempdir().unwrap();
        let mut folder = WorldFolder::open(dir.path()).unwrap();
        folder.save_chunk(3, 3, b"x").unwrap();
        folder.save_chunk(4, 3, b"y").unwrap();

        folder.delete_chunk(3, 3).unwrap();
        assert!(dir.path().join("region/r.0.0.mca").exists());
        folder.delete_chunk(4, 3).unwrap();
        assert!(!dir.path().join("region/r.0.0.mca").exists());
        // Deleting from a region that was never created is a no-op.
        folder.delete_chunk(999, 999).unwrap();
    }

    #[test]
    fn test_copy_chunk_between_folders() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let mut a = WorldFolder::open(dir_a.path()).unwrap();
        let mut b = WorldFolder::open(dir_b.path()).unwrap();

        a.save_chunk(7, -7, b"payload").unwrap();
        b.copy_chunk_from(&mut a, 7, -7).unwrap();
        assert_eq!(b.read_chunk(7, -7).unwrap(), b"payload");
    }
}
