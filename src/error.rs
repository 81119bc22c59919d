use crate::nbt::NbtFormatError;
use crate::regionfile::RegionError;

/// Errors surfaced by the world/chunk layer.
///
/// `ChunkNotPresent` and `ChunkMalformed` are recoverable per chunk: callers
/// may create, skip, or regenerate the coordinate. `SessionLockLost` is fatal
/// for further writes to the world.
#[derive(Debug, thiserror::Error)]
pub enum WorldError {
    #[error("chunk ({0}, {1}) is not present")]
    ChunkNotPresent(i32, i32),

    #[error("chunk ({cx}, {cz}) is malformed: {reason}")]
    ChunkMalformed { cx: i32, cz: i32, reason: String },

    #[error("chunk access denied: a save is in progress")]
    ChunkAccessDenied,

    #[error("session lock lost: the world is being accessed from another location")]
    SessionLockLost,

    #[error("world is opened read only")]
    ReadOnly,

    #[error("chunk ({0}, {1}) already present")]
    ChunkAlreadyPresent(i32, i32),

    #[error("not an Anvil world folder: {0}")]
    NotAWorld(String),

    #[error("region file error: {0}")]
    Region(#[from] RegionError),

    #[error("tag format error: {0}")]
    Nbt(#[from] NbtFormatError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorldError {
    /// Wrap a decode-time failure as `ChunkMalformed` for the given
    /// coordinate, per the chunk-resolution boundary contract. Errors that
    /// already carry chunk-level meaning pass through untouched.
    pub(crate) fn into_malformed(self, cx: i32, cz: i32) -> WorldError {
        match self {
            WorldError::ChunkNotPresent(..)
            | WorldError::ChunkMalformed { .. }
            | WorldError::ChunkAccessDenied
            | WorldError::SessionLockLost => self,
            other => WorldError::ChunkMalformed {
                cx,
                cz,
                reason: other.to_string(),
            },
        }
    }
}
