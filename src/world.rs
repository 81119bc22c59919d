//! The world: chunk resolution, caching, write-back, and save.
//!
//! Chunk resolution is three-tiered. A live [`Chunk`] view is returned
//! as-is from the identity table; otherwise the parsed [`ChunkData`] comes
//! from the bounded in-memory cache, the unsaved-work staging folder, or
//! the authoritative region files, in that order. Staging always wins over
//! the region files, which is what makes reads see the latest prior write.
//!
//! Dirty chunks evicted from the bounded cache are written back to the
//! staging folder; an explicit save re-packs every dirty chunk straight
//! into the region files and clears staging. Discarding the staging folder
//! without saving is the abort path.

use crate::chunk::{entity_position, tile_position, ChunkData};
use crate::config::{Dimension, WorldConfig};
use crate::error::WorldError;
use crate::nbt::{self, Compound, Tag, TagList};
use crate::worldfolder::WorldFolder;
use crate::BoundingBox;
use lru::LruCache;
use rustc_hash::{FxBuildHasher, FxHashMap, FxHashSet};
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};
use tracing::{debug, info, warn};

/// Folder holding dirty-but-unsaved chunk payloads inside the world.
const WORK_FOLDER_NAME: &str = "##ANVILITE.TEMP##";
/// Ring of recently returned views, kept alive so the hottest chunks stay
/// pinned even when the caller drops its handles immediately.
const RECENT_CHUNKS: usize = 20;
/// Anvil-format `level.dat` version.
pub const VERSION_ANVIL: i32 = 19133;

// ─── Session lock ───────────────────────────────────────────────────────────

/// An 8-byte big-endian millisecond timestamp in `session.lock`. Whoever
/// wrote it last owns the world; everyone else must fail loudly on write.
struct SessionLock {
    path: PathBuf,
    init_time: i64,
}

impl SessionLock {
    fn acquire(path: PathBuf) -> Result<SessionLock, WorldError> {
        let init_time = chrono::Utc::now().timestamp_millis();
        fs::write(&path, init_time.to_be_bytes())?;
        Ok(SessionLock { path, init_time })
    }

    fn check(&self) -> Result<(), WorldError> {
        let lock = fs::read(&self.path)
            .ok()
            .and_then(|data| data.get(..8).map(|b| i64::from_be_bytes(b.try_into().unwrap())))
            .unwrap_or(-1);
        if lock != self.init_time {
            return Err(WorldError::SessionLockLost);
        }
        Ok(())
    }
}

// ─── Shared level metadata ──────────────────────────────────────────────────

/// `level.dat` root and player files, shared between a world and its
/// dimensions.
struct WorldMeta {
    dat_path: PathBuf,
    root: RefCell<Compound>,
    players_folder: Option<PathBuf>,
    players: Vec<String>,
    player_tag_cache: RefCell<FxHashMap<String, Compound>>,
}

impl WorldMeta {
    fn save_level_dat(&self) -> Result<(), WorldError> {
        let bytes = self.root.borrow().save_gzipped("")?;
        fs::write(&self.dat_path, bytes)?;
        Ok(())
    }
}

// ─── World state ────────────────────────────────────────────────────────────

pub(crate) struct WorldState {
    pub(crate) config: WorldConfig,
    pub(crate) dim: Dimension,
    folder: RefCell<WorldFolder>,
    work_folder: Option<RefCell<WorldFolder>>,
    meta: Rc<WorldMeta>,
    session: Option<Rc<SessionLock>>,
    views: RefCell<FxHashMap<(i32, i32), Weak<ChunkShared>>>,
    data_cache: RefCell<LruCache<(i32, i32), Rc<RefCell<ChunkData>>, FxBuildHasher>>,
    recent: RefCell<VecDeque<Chunk>>,
    pub(crate) needs_lighting: RefCell<FxHashSet<(i32, i32)>>,
    all_chunks: RefCell<Option<FxHashSet<(i32, i32)>>>,
    saving: Cell<bool>,
}

impl WorldState {
    fn check_session_lock(&self) -> Result<(), WorldError> {
        if self.config.readonly {
            return Err(WorldError::ReadOnly);
        }
        match &self.session {
            Some(session) => session.check(),
            None => Err(WorldError::SessionLockLost),
        }
    }
}

// ─── Chunk views ────────────────────────────────────────────────────────────

/// Shared core of a [`Chunk`] view. Deregisters from the world's identity
/// table when the last handle drops, the explicit equivalent of a
/// weak-value dictionary entry expiring. The world reference is weak so the
/// recent-view ring inside the world never forms a cycle.
pub(crate) struct ChunkShared {
    pos: (i32, i32),
    data: Rc<RefCell<ChunkData>>,
    world: Weak<WorldState>,
}

impl Drop for ChunkShared {
    fn drop(&mut self) {
        let Some(world) = self.world.upgrade() else {
            return;
        };
        let mut views = world.views.borrow_mut();
        // Only remove the entry if it is ours (dead); a successor view may
        // already occupy the slot after a delete/recreate cycle.
        let dead = views
            .get(&self.pos)
            .is_some_and(|weak| weak.strong_count() == 0);
        if dead {
            views.remove(&self.pos);
        }
    }
}

/// A handle on one loaded chunk. Cheap to clone; all clones share the same
/// [`ChunkData`]. While any handle is live the chunk is pinned in memory
/// and `get_chunk` returns the same underlying data.
#[derive(Clone)]
pub struct Chunk {
    shared: Rc<ChunkShared>,
}

impl Chunk {
    pub fn pos(&self) -> (i32, i32) {
        self.shared.pos
    }

    pub fn data(&self) -> Ref<'_, ChunkData> {
        self.shared.data.borrow()
    }

    /// Direct mutable access to the chunk data. Callers mutating blocks
    /// this way should finish with [`Chunk::chunk_changed`].
    pub fn data_mut(&self) -> RefMut<'_, ChunkData> {
        self.shared.data.borrow_mut()
    }

    fn world(&self) -> Option<Rc<WorldState>> {
        self.shared.world.upgrade()
    }

    pub fn dirty(&self) -> bool {
        self.data().dirty()
    }

    pub fn set_dirty(&self, dirty: bool) {
        self.data_mut().set_dirty(dirty);
    }

    pub fn needs_lighting(&self) -> bool {
        self.world()
            .is_some_and(|world| world.needs_lighting.borrow().contains(&self.pos()))
    }

    pub fn set_needs_lighting(&self, needs: bool) {
        let Some(world) = self.world() else {
            return;
        };
        let mut set = world.needs_lighting.borrow_mut();
        if needs {
            set.insert(self.pos());
        } else {
            set.remove(&self.pos());
        }
    }

    /// Mark the chunk modified: dirty flag, fresh height map, sky-light
    /// columns reseeded, and queued for relighting.
    pub fn chunk_changed(&self) {
        if let Some(world) = self.world() {
            self.data_mut()
                .chunk_changed(&world.config.materials, true);
        } else {
            self.data_mut().set_dirty(true);
        }
        self.set_needs_lighting(true);
    }

    // ── Cell accessors (chunk-local coordinates) ──

    pub fn block_at(&self, x: usize, y: usize, z: usize) -> u16 {
        self.data().block_at(x, y, z)
    }

    pub fn set_block_at(&self, x: usize, y: usize, z: usize, id: u16) {
        self.data_mut().set_block_at(x, y, z, id);
        self.set_needs_lighting(true);
    }

    pub fn data_at(&self, x: usize, y: usize, z: usize) -> u8 {
        self.data().data_at(x, y, z)
    }

    pub fn set_data_at(&self, x: usize, y: usize, z: usize, value: u8) {
        self.data_mut().set_data_at(x, y, z, value);
        self.set_needs_lighting(true);
    }

    pub fn sky_light_at(&self, x: usize, y: usize, z: usize) -> u8 {
        self.data().sky_light_at(x, y, z)
    }

    pub fn set_sky_light_at(&self, x: usize, y: usize, z: usize, value: u8) {
        self.data_mut().set_sky_light_at(x, y, z, value);
    }

    pub fn block_light_at(&self, x: usize, y: usize, z: usize) -> u8 {
        self.data().block_light_at(x, y, z)
    }

    pub fn set_block_light_at(&self, x: usize, y: usize, z: usize, value: u8) {
        self.data_mut().set_block_light_at(x, y, z, value);
    }

    pub fn biome_at(&self, x: usize, z: usize) -> u8 {
        self.data().biome_at(x, z)
    }

    pub fn set_biome_at(&self, x: usize, z: usize, biome: u8) {
        self.data_mut().set_biome_at(x, z, biome);
    }

    pub fn height_map_at(&self, x: usize, z: usize) -> i32 {
        self.data().height_map_at(x, z)
    }

    // ── Entities ──

    pub fn add_entity(&self, tag: Compound) {
        self.data_mut().add_entity(tag);
    }

    pub fn add_tile_entity(&self, tag: Compound) {
        self.data_mut().add_tile_entity(tag);
    }

    pub fn add_tile_tick(&self, tag: Compound) {
        self.data_mut().add_tile_tick(tag);
    }

    pub fn entities_in_box(&self, bounds: &BoundingBox) -> Vec<Compound> {
        self.data().entities_in_box(bounds)
    }

    pub fn tile_entities_in_box(&self, bounds: &BoundingBox) -> Vec<Compound> {
        self.data().tile_entities_in_box(bounds)
    }

    pub fn tile_ticks_in_box(&self, bounds: &BoundingBox) -> Vec<Compound> {
        self.data().tile_ticks_in_box(bounds)
    }

    pub fn remove_entities_in_box(&self, bounds: &BoundingBox) -> usize {
        self.data_mut().remove_entities_in_box(bounds)
    }

    pub fn remove_tile_entities_in_box(&self, bounds: &BoundingBox) -> usize {
        self.data_mut().remove_tile_entities_in_box(bounds)
    }

    pub fn remove_tile_ticks_in_box(&self, bounds: &BoundingBox) -> usize {
        self.data_mut().remove_tile_ticks_in_box(bounds)
    }
}

// ─── World ──────────────────────────────────────────────────────────────────

/// One dimension of an Anvil world on disk.
pub struct World {
    state: Rc<WorldState>,
}

impl World {
    /// Open an existing world. `path` may be the world folder or its
    /// `level.dat`. Unless `config.readonly` is set this acquires the
    /// session lock and wipes any stale staging folder.
    pub fn open(path: impl AsRef<Path>, config: WorldConfig) -> Result<World, WorldError> {
        World::open_at(path.as_ref(), config, Dimension::Overworld, false, None)
    }

    /// Create a fresh world (or re-initialize `level.dat` of an existing
    /// folder) and open it.
    pub fn create(path: impl AsRef<Path>, config: WorldConfig) -> Result<World, WorldError> {
        if config.readonly {
            return Err(WorldError::ReadOnly);
        }
        World::open_at(path.as_ref(), config, Dimension::Overworld, true, None)
    }

    /// Open an alternate dimension of this world. The session lock and
    /// `level.dat` are shared with the parent.
    pub fn open_dimension(&self, dim: Dimension) -> Result<World, WorldError> {
        let Some(folder_name) = dim.folder_name() else {
            return Ok(World {
                state: self.state.clone(),
            });
        };
        let root = self.state.folder.borrow().root().join(folder_name);
        let config = self.state.config.clone();
        World::open_at(
            &root,
            config,
            dim,
            false,
            Some((self.state.meta.clone(), self.state.session.clone())),
        )
    }

    fn open_at(
        path: &Path,
        config: WorldConfig,
        dim: Dimension,
        create: bool,
        shared: Option<(Rc<WorldMeta>, Option<Rc<SessionLock>>)>,
    ) -> Result<World, WorldError> {
        let mut path = path.to_path_buf();
        if matches!(
            path.file_name().and_then(|n| n.to_str()),
            Some("level.dat") | Some("level.dat_old")
        ) {
            path.pop();
        }

        if !path.exists() && !create && shared.is_none() {
            return Err(WorldError::NotAWorld(format!(
                "{}: no such folder",
                path.display()
            )));
        }

        let folder = WorldFolder::open(&path)?;

        let is_dimension = shared.is_some();
        let (meta, session) = match shared {
            Some((meta, session)) => (meta, session),
            None => {
                let session = if config.readonly {
                    None
                } else {
                    Some(Rc::new(SessionLock::acquire(
                        folder.file_path("session.lock"),
                    )?))
                };
                let meta = Rc::new(load_meta(&folder, create)?);
                if (create || !meta.dat_path.exists()) && !config.readonly {
                    meta.save_level_dat()?;
                }
                (meta, session)
            }
        };

        if !is_dimension {
            let version = meta
                .root
                .borrow()
                .get_compound("Data")
                .and_then(|d| d.get_int("version"))
                .unwrap_or(VERSION_ANVIL);
            if version != VERSION_ANVIL {
                return Err(WorldError::NotAWorld(format!(
                    "unsupported world version {version} (pre-Anvil formats are not supported)"
                )));
            }
        }

        let work_folder = if config.readonly {
            None
        } else {
            let work_path = folder.file_path(WORK_FOLDER_NAME);
            if work_path.exists() {
                // A stale staging folder from a previous session holds work
                // that was never committed; discard it.
                fs::remove_dir_all(&work_path)?;
            }
            Some(RefCell::new(WorldFolder::open(work_path)?))
        };

        info!(path = %path.display(), dim = dim.number(), readonly = config.readonly, "opened world");

        Ok(World {
            state: Rc::new(WorldState {
                config,
                dim,
                folder: RefCell::new(folder),
                work_folder,
                meta,
                session,
                views: RefCell::new(FxHashMap::default()),
                data_cache: RefCell::new(LruCache::unbounded_with_hasher(FxBuildHasher)),
                recent: RefCell::new(VecDeque::with_capacity(RECENT_CHUNKS)),
                needs_lighting: RefCell::new(FxHashSet::default()),
                all_chunks: RefCell::new(None),
                saving: Cell::new(false),
            }),
        })
    }

    pub fn config(&self) -> &WorldConfig {
        &self.state.config
    }

    pub fn dimension(&self) -> Dimension {
        self.state.dim
    }

    pub fn height(&self) -> usize {
        self.state.config.height
    }

    pub fn folder_path(&self) -> PathBuf {
        self.state.folder.borrow().root().to_path_buf()
    }

    // ── Chunk resolution ──

    /// Resolve a chunk to a live view, loading and caching as needed.
    pub fn get_chunk(&self, cx: i32, cz: i32) -> Result<Chunk, WorldError> {
        if let Some(shared) = self
            .state
            .views
            .borrow()
            .get(&(cx, cz))
            .and_then(Weak::upgrade)
        {
            return Ok(Chunk { shared });
        }

        let data = self.chunk_data(cx, cz)?;
        let shared = Rc::new(ChunkShared {
            pos: (cx, cz),
            data,
            world: Rc::downgrade(&self.state),
        });
        self.state
            .views
            .borrow_mut()
            .insert((cx, cz), Rc::downgrade(&shared));

        let chunk = Chunk { shared };
        {
            let mut recent = self.state.recent.borrow_mut();
            if recent.len() >= RECENT_CHUNKS {
                recent.pop_front();
            }
            recent.push_back(chunk.clone());
        }
        Ok(chunk)
    }

    fn chunk_data(&self, cx: i32, cz: i32) -> Result<Rc<RefCell<ChunkData>>, WorldError> {
        if let Some(data) = self.state.data_cache.borrow_mut().get(&(cx, cz)) {
            return Ok(data.clone());
        }

        if self.state.saving.get() {
            return Err(WorldError::ChunkAccessDenied);
        }

        let (bytes, staged) = self.chunk_bytes(cx, cz)?;
        let (root, _) = nbt::read_nbt(&bytes, nbt::Endianness::Big)
            .map_err(|e| WorldError::from(e).into_malformed(cx, cz))?;
        let mut data = ChunkData::from_root_tag((cx, cz), self.state.config.height, root)
            .map_err(|e| e.into_malformed(cx, cz))?;
        // Staging content is always modified-but-unflushed.
        if staged {
            data.set_dirty(true);
        }

        let data = Rc::new(RefCell::new(data));
        self.store_chunk_data((cx, cz), data.clone())?;
        Ok(data)
    }

    /// Raw payload bytes, staging folder first.
    fn chunk_bytes(&self, cx: i32, cz: i32) -> Result<(Vec<u8>, bool), WorldError> {
        if let Some(work) = &self.state.work_folder {
            let mut work = work.borrow_mut();
            if work.contains_chunk(cx, cz)? {
                return Ok((work.read_chunk(cx, cz)?, true));
            }
        }
        Ok((self.state.folder.borrow_mut().read_chunk(cx, cz)?, false))
    }

    /// Insert into the bounded cache, evicting one unpinned entry (written
    /// back to staging if dirty) when over the limit.
    fn store_chunk_data(
        &self,
        pos: (i32, i32),
        data: Rc<RefCell<ChunkData>>,
    ) -> Result<(), WorldError> {
        let mut cache = self.state.data_cache.borrow_mut();
        cache.put(pos, data);

        if cache.len() > self.state.config.loaded_chunk_limit {
            if !self.state.config.readonly {
                self.state.check_session_lock()?;
            }
            for _ in 0..cache.len() {
                let Some((old_pos, old)) = cache.pop_lru() else {
                    break;
                };
                let pinned = self
                    .state
                    .views
                    .borrow()
                    .get(&old_pos)
                    .is_some_and(|weak| weak.strong_count() > 0);
                if pinned {
                    // Back to the young end; try the next-oldest.
                    cache.put(old_pos, old);
                    continue;
                }
                if old.borrow().dirty() && !self.state.config.readonly {
                    let bytes = old.borrow_mut().to_saved_bytes()?;
                    if let Some(work) = &self.state.work_folder {
                        debug!(cx = old_pos.0, cz = old_pos.1, "evicting dirty chunk to staging");
                        work.borrow_mut().save_chunk(old_pos.0, old_pos.1, &bytes)?;
                    }
                }
                break;
            }
        }
        Ok(())
    }

    /// Whether the coordinate has data anywhere: cache, staging, or region
    /// files.
    pub fn contains_chunk(&self, cx: i32, cz: i32) -> Result<bool, WorldError> {
        if let Some(all) = &*self.state.all_chunks.borrow() {
            return Ok(all.contains(&(cx, cz)));
        }
        if self.state.data_cache.borrow().contains(&(cx, cz)) {
            return Ok(true);
        }
        if let Some(work) = &self.state.work_folder {
            if work.borrow_mut().contains_chunk(cx, cz)? {
                return Ok(true);
            }
        }
        self.state.folder.borrow_mut().contains_chunk(cx, cz)
    }

    pub fn contains_point(&self, x: i32, y: i32, z: i32) -> Result<bool, WorldError> {
        if y < 0 || y >= self.state.config.height as i32 {
            return Ok(false);
        }
        self.contains_chunk(x >> 4, z >> 4)
    }

    /// Create an empty chunk at a coordinate that has none.
    pub fn create_chunk(&self, cx: i32, cz: i32) -> Result<(), WorldError> {
        if self.state.config.readonly {
            return Err(WorldError::ReadOnly);
        }
        if self.contains_chunk(cx, cz)? {
            return Err(WorldError::ChunkAlreadyPresent(cx, cz));
        }
        let data = ChunkData::create((cx, cz), self.state.config.height);
        if let Some(all) = self.state.all_chunks.borrow_mut().as_mut() {
            all.insert((cx, cz));
        }
        self.store_chunk_data((cx, cz), Rc::new(RefCell::new(data)))
    }

    /// Create every missing chunk in the box; returns the positions created.
    pub fn create_chunks_in_box(&self, bounds: &BoundingBox) -> Result<Vec<(i32, i32)>, WorldError> {
        let mut created = Vec::new();
        for (cx, cz) in bounds.chunk_positions() {
            if !self.contains_chunk(cx, cz)? {
                self.create_chunk(cx, cz)?;
                created.push((cx, cz));
            }
        }
        info!(count = created.len(), "created chunks");
        Ok(created)
    }

    /// Delete a chunk everywhere it exists: region files, staging, and the
    /// in-memory caches.
    pub fn delete_chunk(&self, cx: i32, cz: i32) -> Result<(), WorldError> {
        if self.state.config.readonly {
            return Err(WorldError::ReadOnly);
        }
        self.state.folder.borrow_mut().delete_chunk(cx, cz)?;
        if let Some(work) = &self.state.work_folder {
            work.borrow_mut().delete_chunk(cx, cz)?;
        }
        self.state.data_cache.borrow_mut().pop(&(cx, cz));
        self.state.views.borrow_mut().remove(&(cx, cz));
        self.state.needs_lighting.borrow_mut().remove(&(cx, cz));
        if let Some(all) = self.state.all_chunks.borrow_mut().as_mut() {
            all.remove(&(cx, cz));
        }
        Ok(())
    }

    pub fn delete_chunks_in_box(&self, bounds: &BoundingBox) -> Result<Vec<(i32, i32)>, WorldError> {
        let mut deleted = Vec::new();
        for (cx, cz) in bounds.chunk_positions() {
            if self.contains_chunk(cx, cz)? {
                self.delete_chunk(cx, cz)?;
                deleted.push((cx, cz));
            }
        }
        info!(count = deleted.len(), "deleted chunks");
        Ok(deleted)
    }

    // ── Chunk enumeration ──

    fn ensure_all_chunks(&self) -> Result<(), WorldError> {
        if self.state.all_chunks.borrow().is_some() {
            return Ok(());
        }
        let mut set = self.state.folder.borrow_mut().list_chunks()?;
        if let Some(work) = &self.state.work_folder {
            set.extend(work.borrow_mut().list_chunks()?);
        }
        for (pos, _) in self.state.data_cache.borrow().iter() {
            set.insert(*pos);
        }
        *self.state.all_chunks.borrow_mut() = Some(set);
        Ok(())
    }

    /// Every known chunk position, scanned lazily and cached. Sorted for
    /// deterministic iteration.
    pub fn all_chunks(&self) -> Result<Vec<(i32, i32)>, WorldError> {
        self.ensure_all_chunks()?;
        let borrow = self.state.all_chunks.borrow();
        let mut positions: Vec<(i32, i32)> =
            borrow.as_ref().map(|s| s.iter().copied().collect()).unwrap_or_default();
        positions.sort_unstable();
        Ok(positions)
    }

    pub fn chunk_count(&self) -> Result<usize, WorldError> {
        self.ensure_all_chunks()?;
        Ok(self.state.all_chunks.borrow().as_ref().map_or(0, |s| s.len()))
    }

    // ── Dirty tracking ──

    pub fn mark_dirty_chunk(&self, cx: i32, cz: i32) -> Result<(), WorldError> {
        self.get_chunk(cx, cz)?.chunk_changed();
        Ok(())
    }

    /// Mark every present chunk in the box dirty; absent or unreadable
    /// chunks are skipped.
    pub fn mark_dirty_box(&self, bounds: &BoundingBox) -> Result<(), WorldError> {
        for (cx, cz) in bounds.chunk_positions() {
            match self.mark_dirty_chunk(cx, cz) {
                Ok(()) => {}
                Err(WorldError::ChunkNotPresent(..)) | Err(WorldError::ChunkMalformed { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn list_dirty_chunks(&self) -> Vec<(i32, i32)> {
        self.state
            .data_cache
            .borrow()
            .iter()
            .filter(|(_, data)| data.borrow().dirty())
            .map(|(pos, _)| *pos)
            .collect()
    }

    pub(crate) fn chunks_needing_lighting(&self) -> Vec<(i32, i32)> {
        self.state.needs_lighting.borrow().iter().copied().collect()
    }

    // ── Point accessors (world coordinates) ──

    fn chunk_for_point(&self, x: i32, z: i32) -> Result<Option<Chunk>, WorldError> {
        match self.get_chunk(x >> 4, z >> 4) {
            Ok(chunk) => Ok(Some(chunk)),
            Err(WorldError::ChunkNotPresent(..)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Block id at a point; 0 outside the world or in absent chunks.
    pub fn block_at(&self, x: i32, y: i32, z: i32) -> Result<u16, WorldError> {
        if y < 0 || y >= self.state.config.height as i32 {
            return Ok(0);
        }
        Ok(self
            .chunk_for_point(x, z)?
            .map_or(0, |c| c.block_at((x & 0xf) as usize, y as usize, (z & 0xf) as usize)))
    }

    /// Set a block id; silently ignored outside the world or in absent
    /// chunks. Marks the chunk dirty and queues it for relighting.
    pub fn set_block_at(&self, x: i32, y: i32, z: i32, id: u16) -> Result<(), WorldError> {
        if y < 0 || y >= self.state.config.height as i32 {
            return Ok(());
        }
        if let Some(chunk) = self.chunk_for_point(x, z)? {
            chunk.set_block_at((x & 0xf) as usize, y as usize, (z & 0xf) as usize, id);
        }
        Ok(())
    }

    pub fn data_at(&self, x: i32, y: i32, z: i32) -> Result<u8, WorldError> {
        if y < 0 || y >= self.state.config.height as i32 {
            return Ok(0);
        }
        Ok(self
            .chunk_for_point(x, z)?
            .map_or(0, |c| c.data_at((x & 0xf) as usize, y as usize, (z & 0xf) as usize)))
    }

    pub fn set_data_at(&self, x: i32, y: i32, z: i32, value: u8) -> Result<(), WorldError> {
        if y < 0 || y >= self.state.config.height as i32 {
            return Ok(());
        }
        if let Some(chunk) = self.chunk_for_point(x, z)? {
            chunk.set_data_at((x & 0xf) as usize, y as usize, (z & 0xf) as usize, value);
        }
        Ok(())
    }

    pub fn block_light_at(&self, x: i32, y: i32, z: i32) -> Result<u8, WorldError> {
        if y < 0 || y >= self.state.config.height as i32 {
            return Ok(0);
        }
        let chunk = self.get_chunk(x >> 4, z >> 4)?;
        Ok(chunk.block_light_at((x & 0xf) as usize, y as usize, (z & 0xf) as usize))
    }

    pub fn set_block_light_at(&self, x: i32, y: i32, z: i32, value: u8) -> Result<(), WorldError> {
        if y < 0 || y >= self.state.config.height as i32 {
            return Ok(());
        }
        let chunk = self.get_chunk(x >> 4, z >> 4)?;
        chunk.set_block_light_at((x & 0xf) as usize, y as usize, (z & 0xf) as usize, value);
        Ok(())
    }

    pub fn sky_light_at(&self, x: i32, y: i32, z: i32) -> Result<u8, WorldError> {
        if y < 0 || y >= self.state.config.height as i32 {
            return Ok(0);
        }
        let chunk = self.get_chunk(x >> 4, z >> 4)?;
        Ok(chunk.sky_light_at((x & 0xf) as usize, y as usize, (z & 0xf) as usize))
    }

    /// Raise the sky light at a point. Only increases are applied; returns
    /// whether the value changed.
    pub fn set_sky_light_at(&self, x: i32, y: i32, z: i32, value: u8) -> Result<bool, WorldError> {
        if y < 0 || y >= self.state.config.height as i32 {
            return Ok(false);
        }
        let chunk = self.get_chunk(x >> 4, z >> 4)?;
        let (lx, ly, lz) = ((x & 0xf) as usize, y as usize, (z & 0xf) as usize);
        let old = chunk.sky_light_at(lx, ly, lz);
        if old < value {
            chunk.set_sky_light_at(lx, ly, lz, value);
        }
        Ok(old < value)
    }

    pub fn biome_at(&self, x: i32, z: i32) -> Result<u8, WorldError> {
        Ok(self
            .chunk_for_point(x, z)?
            .map_or(0xff, |c| c.biome_at((x & 0xf) as usize, (z & 0xf) as usize)))
    }

    pub fn set_biome_at(&self, x: i32, z: i32, biome: u8) -> Result<(), WorldError> {
        if let Some(chunk) = self.chunk_for_point(x, z)? {
            chunk.set_biome_at((x & 0xf) as usize, (z & 0xf) as usize, biome);
        }
        Ok(())
    }

    pub fn height_map_at(&self, x: i32, z: i32) -> Result<i32, WorldError> {
        let chunk = self.get_chunk(x >> 4, z >> 4)?;
        Ok(chunk.height_map_at((x & 0xf) as usize, (z & 0xf) as usize))
    }

    // ── Entities ──

    /// Add an entity; the owning chunk comes from the tag's `Pos`. Ignored
    /// when the tag has no position or its chunk is absent.
    pub fn add_entity(&self, tag: Compound) -> Result<(), WorldError> {
        let Some((x, _, z)) = entity_position(&tag) else {
            return Ok(());
        };
        if let Some(chunk) = self.chunk_for_point(x.floor() as i32, z.floor() as i32)? {
            chunk.add_entity(tag);
        }
        Ok(())
    }

    pub fn add_tile_entity(&self, tag: Compound) -> Result<(), WorldError> {
        let Some((x, _, z)) = tile_position(&tag) else {
            return Ok(());
        };
        if let Some(chunk) = self.chunk_for_point(x, z)? {
            chunk.add_tile_entity(tag);
        }
        Ok(())
    }

    pub fn add_tile_tick(&self, tag: Compound) -> Result<(), WorldError> {
        let Some((x, _, z)) = tile_position(&tag) else {
            return Ok(());
        };
        if let Some(chunk) = self.chunk_for_point(x, z)? {
            chunk.add_tile_tick(tag);
        }
        Ok(())
    }

    pub fn tile_entity_at(&self, x: i32, y: i32, z: i32) -> Result<Option<Compound>, WorldError> {
        Ok(self
            .chunk_for_point(x, z)?
            .and_then(|c| c.data().tile_entity_at(x, y, z).cloned()))
    }

    fn for_chunks_in_box<T>(
        &self,
        bounds: &BoundingBox,
        mut f: impl FnMut(&Chunk, &BoundingBox) -> Vec<T>,
    ) -> Result<Vec<T>, WorldError> {
        let mut out = Vec::new();
        for (cx, cz) in bounds.chunk_positions() {
            match self.get_chunk(cx, cz) {
                Ok(chunk) => out.extend(f(&chunk, bounds)),
                Err(WorldError::ChunkNotPresent(..)) | Err(WorldError::ChunkMalformed { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    pub fn entities_in_box(&self, bounds: &BoundingBox) -> Result<Vec<Compound>, WorldError> {
        self.for_chunks_in_box(bounds, |chunk, b| chunk.entities_in_box(b))
    }

    pub fn tile_entities_in_box(&self, bounds: &BoundingBox) -> Result<Vec<Compound>, WorldError> {
        self.for_chunks_in_box(bounds, |chunk, b| chunk.tile_entities_in_box(b))
    }

    pub fn tile_ticks_in_box(&self, bounds: &BoundingBox) -> Result<Vec<Compound>, WorldError> {
        self.for_chunks_in_box(bounds, |chunk, b| chunk.tile_ticks_in_box(b))
    }

    pub fn remove_entities_in_box(&self, bounds: &BoundingBox) -> Result<usize, WorldError> {
        let removed = self
            .for_chunks_in_box(bounds, |chunk, b| vec![chunk.remove_entities_in_box(b)])?
            .into_iter()
            .sum();
        info!(removed, "removed entities");
        Ok(removed)
    }

    pub fn remove_tile_entities_in_box(&self, bounds: &BoundingBox) -> Result<usize, WorldError> {
        let removed = self
            .for_chunks_in_box(bounds, |chunk, b| {
                vec![chunk.remove_tile_entities_in_box(b)]
            })?
            .into_iter()
            .sum();
        info!(removed, "removed tile entities");
        Ok(removed)
    }

    pub fn remove_tile_ticks_in_box(&self, bounds: &BoundingBox) -> Result<usize, WorldError> {
        let removed = self
            .for_chunks_in_box(bounds, |chunk, b| vec![chunk.remove_tile_ticks_in_box(b)])?
            .into_iter()
            .sum();
        info!(removed, "removed tile ticks");
        Ok(removed)
    }

    // ── Level data ──

    fn with_data<R>(&self, f: impl FnOnce(&Compound) -> R) -> R {
        let root = self.state.meta.root.borrow();
        match root.get_compound("Data") {
            Some(data) => f(data),
            None => f(&Compound::new()),
        }
    }

    fn with_data_mut<R>(&self, f: impl FnOnce(&mut Compound) -> R) -> R {
        let mut root = self.state.meta.root.borrow_mut();
        if root.get_compound("Data").is_none() {
            root.insert("Data", Compound::new());
        }
        f(root.get_compound_mut("Data").expect("Data was just inserted"))
    }

    /// World seed; 0 when absent.
    pub fn random_seed(&self) -> i64 {
        self.with_data(|d| d.get_long("RandomSeed").unwrap_or(0))
    }

    pub fn set_random_seed(&self, seed: i64) {
        self.with_data_mut(|d| d.insert("RandomSeed", seed));
    }

    /// Age of the world in ticks; 0 when absent.
    pub fn time(&self) -> i64 {
        self.with_data(|d| d.get_long("Time").unwrap_or(0))
    }

    pub fn set_time(&self, time: i64) {
        self.with_data_mut(|d| d.insert("Time", time));
    }

    /// Time of day in ticks (24000 per day); 0 when absent.
    pub fn day_time(&self) -> i64 {
        self.with_data(|d| d.get_long("DayTime").unwrap_or(0))
    }

    pub fn set_day_time(&self, time: i64) {
        self.with_data_mut(|d| d.insert("DayTime", time));
    }

    pub fn last_played(&self) -> i64 {
        self.with_data(|d| d.get_long("LastPlayed").unwrap_or(0))
    }

    pub fn level_name(&self) -> String {
        self.with_data(|d| d.get_str("LevelName").unwrap_or("").to_string())
    }

    pub fn set_level_name(&self, name: &str) {
        self.with_data_mut(|d| d.insert("LevelName", name));
    }

    /// Terrain generator name; "default" when absent.
    pub fn generator_name(&self) -> String {
        self.with_data(|d| d.get_str("generatorName").unwrap_or("default").to_string())
    }

    /// 0 = survival, 1 = creative; 0 when absent.
    pub fn game_type(&self) -> i32 {
        self.with_data(|d| d.get_int("GameType").unwrap_or(0))
    }

    pub fn set_game_type(&self, game_type: i32) {
        self.with_data_mut(|d| d.insert("GameType", game_type));
    }

    pub fn size_on_disk(&self) -> i64 {
        self.with_data(|d| d.get_long("SizeOnDisk").unwrap_or(0))
    }

    /// Default spawn position; (0, 2, 0) when absent.
    pub fn spawn_position(&self) -> (i32, i32, i32) {
        self.with_data(|d| {
            (
                d.get_int("SpawnX").unwrap_or(0),
                d.get_int("SpawnY").unwrap_or(2),
                d.get_int("SpawnZ").unwrap_or(0),
            )
        })
    }

    pub fn set_spawn_position(&self, pos: (i32, i32, i32)) {
        self.with_data_mut(|d| {
            d.insert("SpawnX", pos.0);
            d.insert("SpawnY", pos.1);
            d.insert("SpawnZ", pos.2);
        });
    }

    // ── Players ──

    /// Known player ids: file stems from `playerdata/` (or legacy
    /// `players/`) plus the single-player "Player" entry when present.
    pub fn players(&self) -> Vec<String> {
        self.state.meta.players.clone()
    }

    /// A player's tag. "Player" reads the single-player entry embedded in
    /// the level data; anything else loads (and caches) its `.dat` file.
    pub fn player_tag(&self, player: &str) -> Result<Compound, WorldError> {
        if player == "Player" {
            return self
                .with_data(|d| d.get_compound("Player").cloned())
                .ok_or_else(|| WorldError::NotAWorld("no single-player tag".to_string()));
        }
        if let Some(tag) = self.state.meta.player_tag_cache.borrow().get(player) {
            return Ok(tag.clone());
        }
        let folder = self
            .state
            .meta
            .players_folder
            .as_ref()
            .ok_or_else(|| WorldError::NotAWorld("world has no player folder".to_string()))?;
        let bytes = fs::read(folder.join(format!("{player}.dat")))?;
        let (tag, _) = nbt::load(&bytes)?;
        self.state
            .meta
            .player_tag_cache
            .borrow_mut()
            .insert(player.to_string(), tag.clone());
        Ok(tag)
    }

    /// Replace a player's tag; flushed to disk on save. "Player" updates
    /// the single-player entry in the level data.
    pub fn set_player_tag(&self, player: &str, tag: Compound) {
        if player == "Player" {
            self.with_data_mut(|d| d.insert("Player", tag));
        } else {
            self.state
                .meta
                .player_tag_cache
                .borrow_mut()
                .insert(player.to_string(), tag);
        }
    }

    // ── Saving ──

    /// Save everything: dirty cached chunks, staged chunks, players, and
    /// `level.dat`. Returns the number of chunk payloads written.
    pub fn save_in_place(&self) -> Result<usize, WorldError> {
        let mut written = 0;
        for step in self.save_in_place_iter()? {
            if let SaveProgress::Chunk { written: true, .. } | SaveProgress::Migrated { .. } = step?
            {
                written += 1;
            }
        }
        info!(written, dim = self.state.dim.number(), "saved world");
        Ok(written)
    }

    /// Begin a resumable save. While the returned iterator is alive,
    /// `get_chunk` refuses to load chunks that are not already in memory
    /// (`ChunkAccessDenied`).
    pub fn save_in_place_iter(&self) -> Result<SaveInPlace<'_>, WorldError> {
        if self.state.config.readonly {
            return Err(WorldError::ReadOnly);
        }
        self.state.check_session_lock()?;

        let loaded: Vec<(i32, i32)> = self
            .state
            .data_cache
            .borrow()
            .iter()
            .map(|(pos, _)| *pos)
            .collect();
        let staged: Vec<(i32, i32)> = match &self.state.work_folder {
            Some(work) => {
                let mut positions: Vec<_> =
                    work.borrow_mut().list_chunks()?.into_iter().collect();
                positions.sort_unstable();
                positions
            }
            None => Vec::new(),
        };

        self.state.saving.set(true);
        Ok(SaveInPlace {
            world: self,
            phase: SavePhase::Loaded(loaded.into_iter()),
            staged: Some(staged),
        })
    }

    fn commit_save(&self) -> Result<(), WorldError> {
        // Staging is now fully merged into the region files; start it over.
        if let Some(work) = &self.state.work_folder {
            let mut work = work.borrow_mut();
            work.close_regions()?;
            let root = work.root().to_path_buf();
            if root.exists() {
                fs::remove_dir_all(&root)?;
            }
            *work = WorldFolder::open(root)?;
        }

        let meta = &self.state.meta;
        if let Some(folder) = &meta.players_folder {
            for (player, tag) in meta.player_tag_cache.borrow_mut().drain() {
                let bytes = tag.save_gzipped("")?;
                fs::write(folder.join(format!("{player}.dat")), bytes)?;
            }
        }
        meta.save_level_dat()?;
        Ok(())
    }

    // ── Lifecycle ──

    /// Drop all caches and close every region-file handle. Unsaved staged
    /// data stays on disk.
    pub fn unload(&self) -> Result<(), WorldError> {
        if self.state.saving.get() {
            return Err(WorldError::ChunkAccessDenied);
        }
        self.state.folder.borrow_mut().close_regions()?;
        if let Some(work) = &self.state.work_folder {
            work.borrow_mut().close_regions()?;
        }
        *self.state.all_chunks.borrow_mut() = None;
        self.state.views.borrow_mut().clear();
        self.state.recent.borrow_mut().clear();
        self.state.data_cache.borrow_mut().clear();
        Ok(())
    }

    /// Unload and discard all unsaved work. The session lock is verified
    /// first; with a lost lock the staging folder is left for the new owner
    /// to clean up.
    pub fn close(&self) -> Result<(), WorldError> {
        self.unload()?;
        if self.state.config.readonly {
            return Ok(());
        }
        match self.state.check_session_lock() {
            Ok(()) => {
                if let Some(work) = &self.state.work_folder {
                    let root = work.borrow().root().to_path_buf();
                    if root.exists() {
                        fs::remove_dir_all(root)?;
                    }
                }
                Ok(())
            }
            Err(WorldError::SessionLockLost) => {
                warn!("session lock lost at close; leaving staging folder in place");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

// ─── Save iterator ──────────────────────────────────────────────────────────

/// One step of a resumable save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveProgress {
    /// A loaded chunk was visited; `written` is false when it was clean.
    Chunk { cx: i32, cz: i32, written: bool },
    /// A staging-only chunk was promoted into the region files.
    Migrated { cx: i32, cz: i32 },
    /// Staging cleared, players and `level.dat` written.
    Committed,
}

enum SavePhase {
    Loaded(std::vec::IntoIter<(i32, i32)>),
    Staged(std::vec::IntoIter<(i32, i32)>),
    Finish,
    Done,
}

pub struct SaveInPlace<'w> {
    world: &'w World,
    phase: SavePhase,
    staged: Option<Vec<(i32, i32)>>,
}

impl SaveInPlace<'_> {
    fn step(&mut self) -> Result<Option<SaveProgress>, WorldError> {
        loop {
            match &mut self.phase {
                SavePhase::Loaded(iter) => {
                    let Some((cx, cz)) = iter.next() else {
                        let staged = self.staged.take().unwrap_or_default();
                        self.phase = SavePhase::Staged(staged.into_iter());
                        continue;
                    };
                    let state = &self.world.state;
                    let Some(data) = state.data_cache.borrow().peek(&(cx, cz)).cloned() else {
                        continue;
                    };
                    if !data.borrow().dirty() {
                        return Ok(Some(SaveProgress::Chunk {
                            cx,
                            cz,
                            written: false,
                        }));
                    }
                    let bytes = data.borrow_mut().to_saved_bytes()?;
                    state.folder.borrow_mut().save_chunk(cx, cz, &bytes)?;
                    data.borrow_mut().set_dirty(false);
                    return Ok(Some(SaveProgress::Chunk {
                        cx,
                        cz,
                        written: true,
                    }));
                }
                SavePhase::Staged(iter) => {
                    let Some((cx, cz)) = iter.next() else {
                        self.phase = SavePhase::Finish;
                        continue;
                    };
                    let state = &self.world.state;
                    // Chunks still in memory were just saved from their live
                    // arrays; their staged copies are stale.
                    if state.data_cache.borrow().contains(&(cx, cz)) {
                        continue;
                    }
                    let Some(work) = &state.work_folder else {
                        continue;
                    };
                    let bytes = work.borrow_mut().read_chunk(cx, cz)?;
                    state.folder.borrow_mut().save_chunk(cx, cz, &bytes)?;
                    debug!(cx, cz, "promoted staged chunk");
                    return Ok(Some(SaveProgress::Migrated { cx, cz }));
                }
                SavePhase::Finish => {
                    self.world.commit_save()?;
                    self.phase = SavePhase::Done;
                    return Ok(Some(SaveProgress::Committed));
                }
                SavePhase::Done => return Ok(None),
            }
        }
    }
}

impl Iterator for SaveInPlace<'_> {
    type Item = Result<SaveProgress, WorldError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step() {
            Ok(Some(progress)) => Some(Ok(progress)),
            Ok(None) => None,
            Err(e) => {
                self.phase = SavePhase::Done;
                Some(Err(e))
            }
        }
    }
}

impl Drop for SaveInPlace<'_> {
    fn drop(&mut self) {
        self.world.state.saving.set(false);
    }
}

// ─── level.dat loading ──────────────────────────────────────────────────────

fn load_meta(folder: &WorldFolder, create: bool) -> Result<WorldMeta, WorldError> {
    let dat_path = folder.file_path("level.dat");

    let root = if create {
        default_level_root(folder.root())
    } else {
        match read_level_dat(&dat_path) {
            Ok(root) => root,
            Err(e) => {
                let old_path = folder.file_path("level.dat_old");
                warn!(error = %e, "error loading level.dat, trying level.dat_old");
                match read_level_dat(&old_path) {
                    Ok(root) => {
                        info!("level.dat restored from backup");
                        root
                    }
                    Err(e) => {
                        warn!(error = %e, "error loading level.dat_old, initializing defaults");
                        default_level_root(folder.root())
                    }
                }
            }
        }
    };

    // playerdata/ is the modern layout; players/ the legacy one.
    let mut players_folder = None;
    for name in ["playerdata", "players"] {
        let candidate = folder.file_path(name);
        if candidate.is_dir() {
            players_folder = Some(candidate);
            break;
        }
    }

    let mut players: Vec<String> = Vec::new();
    if let Some(dir) = &players_folder {
        for entry in fs::read_dir(dir)? {
            let name = entry?.file_name();
            if let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".dat")) {
                players.push(stem.to_string());
            }
        }
        players.sort_unstable();
    }
    if root
        .get_compound("Data")
        .is_some_and(|d| d.contains_key("Player"))
    {
        players.push("Player".to_string());
    }

    Ok(WorldMeta {
        dat_path,
        root: RefCell::new(root),
        players_folder,
        players,
        player_tag_cache: RefCell::new(FxHashMap::default()),
    })
}

fn read_level_dat(path: &Path) -> Result<Compound, WorldError> {
    let bytes = fs::read(path)?;
    let (root, _) = nbt::load(&bytes)?;
    Ok(root)
}

fn default_level_root(world_path: &Path) -> Compound {
    let name = world_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("World")
        .to_string();

    let mut data = Compound::new();
    data.insert("SpawnX", 0i32);
    data.insert("SpawnY", 2i32);
    data.insert("SpawnZ", 0i32);
    data.insert("LastPlayed", chrono::Utc::now().timestamp_millis());
    data.insert("RandomSeed", rand::random::<i64>());
    data.insert("SizeOnDisk", 0i64);
    data.insert("Time", 1i64);
    data.insert("DayTime", 1i64);
    data.insert("LevelName", name);
    data.insert("MapFeatures", 1i8);
    data.insert("GameType", 0i32);
    data.insert("version", VERSION_ANVIL);
    data.insert("Player", default_player_tag());

    let mut root = Compound::new();
    root.insert("Data", data);
    root
}

fn default_player_tag() -> Compound {
    let mut player = Compound::new();
    player.insert("Air", 300i16);
    player.insert("AttackTime", 0i16);
    player.insert("DeathTime", 0i16);
    player.insert("Fire", -20i16);
    player.insert("Health", 20i16);
    player.insert("HurtTime", 0i16);
    player.insert("Score", 0i32);
    player.insert("FallDistance", 0f32);
    player.insert("OnGround", 0i8);
    player.insert("Inventory", TagList::new());

    let mut motion = TagList::new();
    let mut pos = TagList::new();
    for spawn in [0.5f64, 2.8, 0.5] {
        let _ = motion.push(Tag::Double(0.0));
        let _ = pos.push(Tag::Double(spawn));
    }
    player.insert("Motion", motion);
    player.insert("Pos", pos);

    let mut rotation = TagList::new();
    let _ = rotation.push(Tag::Float(0.0));
    let _ = rotation.push(Tag::Float(0.0));
    player.insert("Rotation", rotation);
    player
}
