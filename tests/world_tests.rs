use anvilite::{BoundingBox, Compound, Dimension, TagList, World, WorldConfig, WorldError, WorldFolder};
use std::path::{Path, PathBuf};

/// Route library events to the test output; `RUST_LOG=debug` to see them.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn small_cache_config(limit: usize) -> WorldConfig {
    init_logging();
    WorldConfig {
        loaded_chunk_limit: limit,
        ..WorldConfig::default()
    }
}

/// The unsaved-work staging folder created inside the world root.
fn staging_path(root: &Path) -> Option<PathBuf> {
    std::fs::read_dir(root)
        .ok()?
        .flatten()
        .map(|e| e.path())
        .find(|p| {
            p.is_dir()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("##"))
        })
}

#[test]
fn test_create_and_reopen_world() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("world");

    let world = World::create(&path, WorldConfig::default()).unwrap();
    world.create_chunk(0, 0).unwrap();
    world.set_block_at(5, 64, 5, 1).unwrap();
    assert_eq!(world.block_at(5, 64, 5).unwrap(), 1);
    world.save_in_place().unwrap();
    world.close().unwrap();

    assert!(path.join("level.dat").exists());
    assert!(path.join("region/r.0.0.mca").exists());
    assert!(path.join("session.lock").exists());

    let world = World::open(&path, WorldConfig::default()).unwrap();
    assert!(world.contains_chunk(0, 0).unwrap());
    assert_eq!(world.block_at(5, 64, 5).unwrap(), 1);
    // Out-of-world and absent-chunk reads are zero.
    assert_eq!(world.block_at(5, -1, 5).unwrap(), 0);
    assert_eq!(world.block_at(5000, 64, 5).unwrap(), 0);
}

#[test]
fn test_open_missing_world_fails() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        World::open(dir.path().join("nope"), WorldConfig::default()),
        Err(WorldError::NotAWorld(_))
    ));
}

#[test]
fn test_create_chunk_twice_fails() {
    let dir = tempfile::tempdir().unwrap();
    let world = World::create(dir.path().join("world"), WorldConfig::default()).unwrap();
    world.create_chunk(3, 3).unwrap();
    assert!(matches!(
        world.create_chunk(3, 3),
        Err(WorldError::ChunkAlreadyPresent(3, 3))
    ));
}

#[test]
fn test_get_absent_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let world = World::create(dir.path().join("world"), WorldConfig::default()).unwrap();
    assert!(matches!(
        world.get_chunk(7, 7),
        Err(WorldError::ChunkNotPresent(7, 7))
    ));
}

#[test]
fn test_views_share_chunk_data() {
    let dir = tempfile::tempdir().unwrap();
    let world = World::create(dir.path().join("world"), WorldConfig::default()).unwrap();
    world.create_chunk(0, 0).unwrap();

    let a = world.get_chunk(0, 0).unwrap();
    let b = world.get_chunk(0, 0).unwrap();
    a.set_block_at(1, 1, 1, 42);
    assert_eq!(b.block_at(1, 1, 1), 42);
}

#[test]
fn test_eviction_writes_one_dirty_chunk_to_staging() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("world");
    let world = World::create(&path, small_cache_config(3)).unwrap();

    // Four fresh (dirty) chunks with no live views: the insert that exceeds
    // the limit must write back exactly one chunk.
    for cx in 0..4 {
        world.create_chunk(cx, 0).unwrap();
    }

    let staging = staging_path(&path).expect("staging folder exists");
    let mut staged = WorldFolder::open(staging).unwrap();
    let chunks = staged.list_chunks().unwrap();
    assert_eq!(chunks.len(), 1, "exactly one evicted chunk in staging");
    assert!(chunks.contains(&(0, 0)), "the least recently used chunk is evicted");
}

#[test]
fn test_staging_preserves_writes_and_save_promotes_them() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("world");
    let world = World::create(&path, small_cache_config(2)).unwrap();

    for cx in 0..25 {
        world.create_chunk(cx, 0).unwrap();
    }
    {
        let chunk = world.get_chunk(0, 0).unwrap();
        chunk.set_block_at(0, 64, 0, 5);
    }
    // Push (0, 0) out of the recent-view ring and out of the cache.
    for cx in 1..25 {
        world.get_chunk(cx, 0).unwrap();
    }

    // Nothing has touched the authoritative region files yet.
    let region_dir = path.join("region");
    let region_count = region_dir
        .read_dir()
        .map(|d| d.count())
        .unwrap_or(0);
    assert_eq!(region_count, 0, "writes buffer in staging until an explicit save");

    // Read-your-writes through the staging folder.
    assert_eq!(world.block_at(0, 64, 0).unwrap(), 5);

    let written = world.save_in_place().unwrap();
    assert!(written >= 25, "all chunks reach the region files");
    assert_eq!(world.block_at(0, 64, 0).unwrap(), 5);

    // Staging is cleared by a successful save.
    let staging = staging_path(&path).expect("staging folder exists");
    let mut staged = WorldFolder::open(staging).unwrap();
    assert!(staged.list_chunks().unwrap().is_empty());
}

#[test]
fn test_second_save_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("world");
    let world = World::create(&path, WorldConfig::default()).unwrap();
    world.create_chunk(0, 0).unwrap();
    world.set_block_at(3, 70, 3, 20).unwrap();

    world.save_in_place().unwrap();
    let region = path.join("region/r.0.0.mca");
    let first = std::fs::read(&region).unwrap();

    // Nothing dirty: nothing rewritten.
    world.save_in_place().unwrap();
    assert_eq!(std::fs::read(&region).unwrap(), first);

    // Dirty but unchanged content must also land byte-identically.
    world.get_chunk(0, 0).unwrap().set_dirty(true);
    world.save_in_place().unwrap();
    assert_eq!(std::fs::read(&region).unwrap(), first);
}

#[test]
fn test_get_chunk_denied_while_saving() {
    let dir = tempfile::tempdir().unwrap();
    let world = World::create(dir.path().join("world"), small_cache_config(1)).unwrap();
    world.create_chunk(0, 0).unwrap();
    world.create_chunk(1, 0).unwrap(); // evicts (0, 0) to staging

    let mut save = world.save_in_place_iter().unwrap();
    save.next();
    assert!(matches!(
        world.get_chunk(0, 0),
        Err(WorldError::ChunkAccessDenied)
    ));
    drop(save);
    assert!(world.get_chunk(0, 0).is_ok());
}

#[test]
fn test_session_lock_lost_blocks_save() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("world");
    let world = World::create(&path, WorldConfig::default()).unwrap();
    world.create_chunk(0, 0).unwrap();

    // Another process takes over the world.
    std::fs::write(path.join("session.lock"), 12345i64.to_be_bytes()).unwrap();

    assert!(matches!(
        world.save_in_place(),
        Err(WorldError::SessionLockLost)
    ));
}

#[test]
fn test_delete_chunk_everywhere() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("world");
    let world = World::create(&path, WorldConfig::default()).unwrap();
    world.create_chunk(0, 0).unwrap();
    world.create_chunk(1, 0).unwrap();
    world.save_in_place().unwrap();

    world.delete_chunk(0, 0).unwrap();
    assert!(!world.contains_chunk(0, 0).unwrap());
    assert!(world.contains_chunk(1, 0).unwrap());
    assert!(matches!(
        world.get_chunk(0, 0),
        Err(WorldError::ChunkNotPresent(0, 0))
    ));

    // Deleting the last chunk removes the region file entirely.
    world.delete_chunk(1, 0).unwrap();
    assert!(!path.join("region/r.0.0.mca").exists());
}

#[test]
fn test_all_chunks_spans_region_and_staging() {
    let dir = tempfile::tempdir().unwrap();
    let world = World::create(dir.path().join("world"), small_cache_config(2)).unwrap();
    for cx in 0..5 {
        world.create_chunk(cx, 7).unwrap();
    }
    let all = world.all_chunks().unwrap();
    assert_eq!(all, vec![(0, 7), (1, 7), (2, 7), (3, 7), (4, 7)]);
    assert_eq!(world.chunk_count().unwrap(), 5);
}

#[test]
fn test_level_dat_fallback_to_backup() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("world");
    {
        let world = World::create(&path, WorldConfig::default()).unwrap();
        world.set_level_name("Backup Copy");
        world.save_in_place().unwrap();
        world.close().unwrap();
    }
    std::fs::copy(path.join("level.dat"), path.join("level.dat_old")).unwrap();
    std::fs::write(path.join("level.dat"), b"this is not NBT at all").unwrap();

    let world = World::open(&path, WorldConfig::default()).unwrap();
    assert_eq!(world.level_name(), "Backup Copy");
}

#[test]
fn test_level_field_defaults_and_setters() {
    let dir = tempfile::tempdir().unwrap();
    let world = World::create(dir.path().join("NamedWorld"), WorldConfig::default()).unwrap();

    assert_eq!(world.level_name(), "NamedWorld");
    assert_eq!(world.time(), 1);
    assert_eq!(world.day_time(), 1);
    assert_eq!(world.game_type(), 0);
    assert_eq!(world.generator_name(), "default");
    assert_eq!(world.spawn_position(), (0, 2, 0));
    assert!(world.last_played() > 0);

    world.set_time(24000);
    world.set_game_type(1);
    world.set_spawn_position((10, 80, -10));
    assert_eq!(world.time(), 24000);
    assert_eq!(world.game_type(), 1);
    assert_eq!(world.spawn_position(), (10, 80, -10));
}

#[test]
fn test_singleplayer_tag() {
    let dir = tempfile::tempdir().unwrap();
    let world = World::create(dir.path().join("world"), WorldConfig::default()).unwrap();
    assert!(world.players().contains(&"Player".to_string()));
    let tag = world.player_tag("Player").unwrap();
    assert_eq!(tag.get_short("Health"), Some(20));
}

#[test]
fn test_nether_dimension_folder() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("world");
    let world = World::create(&path, WorldConfig::default()).unwrap();

    let nether = world.open_dimension(Dimension::Nether).unwrap();
    assert_eq!(nether.dimension(), Dimension::Nether);
    nether.create_chunk(0, 0).unwrap();
    nether.save_in_place().unwrap();
    assert!(path.join("DIM-1/region/r.0.0.mca").exists());
}

#[test]
fn test_entities_roundtrip_through_world() {
    let dir = tempfile::tempdir().unwrap();
    let world = World::create(dir.path().join("world"), WorldConfig::default()).unwrap();
    world.create_chunk(0, 0).unwrap();

    let mut entity = Compound::new();
    entity.insert("id", "Creeper");
    let mut pos = TagList::new();
    pos.push(4.5f64).unwrap();
    pos.push(64.0f64).unwrap();
    pos.push(4.5f64).unwrap();
    entity.insert("Pos", pos);
    world.add_entity(entity).unwrap();

    let mut tile = Compound::new();
    tile.insert("id", "Chest");
    tile.insert("x", 4i32);
    tile.insert("y", 64i32);
    tile.insert("z", 4i32);
    world.add_tile_entity(tile).unwrap();

    let around = BoundingBox::new((0, 0, 0), (16, 256, 16));
    assert_eq!(world.entities_in_box(&around).unwrap().len(), 1);
    assert!(world.tile_entity_at(4, 64, 4).unwrap().is_some());

    world.save_in_place().unwrap();
    world.unload().unwrap();

    assert_eq!(world.entities_in_box(&around).unwrap().len(), 1);
    assert_eq!(world.remove_entities_in_box(&around).unwrap(), 1);
    assert_eq!(world.entities_in_box(&around).unwrap().len(), 0);
    assert_eq!(world.remove_tile_entities_in_box(&around).unwrap(), 1);
}

#[test]
fn test_mark_dirty_box_skips_missing_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let world = World::create(dir.path().join("world"), WorldConfig::default()).unwrap();
    world.create_chunk(0, 0).unwrap();

    // Box extends over absent chunks; only the present one gets flagged.
    let bounds = BoundingBox::new((0, 0, 0), (64, 64, 64));
    world.mark_dirty_box(&bounds).unwrap();
    assert_eq!(world.list_dirty_chunks(), vec![(0, 0)]);
}

#[test]
fn test_readonly_world_rejects_writes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("world");
    {
        let world = World::create(&path, WorldConfig::default()).unwrap();
        world.create_chunk(0, 0).unwrap();
        world.save_in_place().unwrap();
        world.close().unwrap();
    }

    // A readonly open must not take (or rewrite) the session lock.
    std::fs::remove_file(path.join("session.lock")).unwrap();

    let config = WorldConfig {
        readonly: true,
        ..WorldConfig::default()
    };
    let world = World::open(&path, config).unwrap();
    assert!(world.contains_chunk(0, 0).unwrap());
    assert!(matches!(world.create_chunk(1, 1), Err(WorldError::ReadOnly)));
    assert!(matches!(world.delete_chunk(0, 0), Err(WorldError::ReadOnly)));
    assert!(matches!(world.save_in_place(), Err(WorldError::ReadOnly)));
    assert!(!path.join("session.lock").exists());
}
