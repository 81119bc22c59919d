//! Minecraft Anvil world storage and chunk management.
//!
//! This crate implements the storage engine under a world editor: the NBT
//! tag model and its binary codec ([`nbt`]), the sector-allocated region
//! file container ([`regionfile`]), the on-disk world folder layout
//! ([`worldfolder`]), a bounded chunk cache with write-back to an
//! unsaved-work staging area ([`world`]), and the iterative relighting
//! engine ([`lighting`]).
//!
//! ```no_run
//! use anvilite::{World, WorldConfig};
//!
//! let world = World::open("saves/my-world", WorldConfig::default())?;
//! let chunk = world.get_chunk(0, 0)?;
//! chunk.set_block_at(8, 64, 8, 89); // glowstone
//! world.generate_lights(None)?;
//! world.save_in_place()?;
//! # Ok::<(), anvilite::WorldError>(())
//! ```

pub mod bounds;
pub mod chunk;
pub mod config;
pub mod error;
pub mod lighting;
pub mod materials;
pub mod nbt;
pub mod regionfile;
pub mod world;
pub mod worldfolder;

pub use bounds::BoundingBox;
pub use chunk::{pack_nibble_array, unpack_nibble_array, ChunkData};
pub use config::{Dimension, WorldConfig};
pub use error::WorldError;
pub use lighting::{LightKind, Relight, RelightProgress};
pub use materials::BlockProperties;
pub use nbt::{Compound, Endianness, NbtFormatError, Tag, TagKind, TagList};
pub use regionfile::{CompressionScheme, RegionError, RegionFile};
pub use world::{Chunk, SaveInPlace, SaveProgress, World};
pub use worldfolder::WorldFolder;
