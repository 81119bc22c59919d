//! World configuration.
//!
//! Everything the storage core used to pick up from ambient process state is
//! an explicit field here, passed into [`crate::World`] at open time.

use crate::materials::BlockProperties;
use serde::{Deserialize, Serialize};

/// A world dimension. Alternate dimensions live in `DIM-1` / `DIM1`
/// subfolders with the same region layout as the overworld.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Dimension {
    #[default]
    Overworld,
    Nether,
    End,
}

impl Dimension {
    pub fn number(self) -> i32 {
        match self {
            Dimension::Overworld => 0,
            Dimension::Nether => -1,
            Dimension::End => 1,
        }
    }

    /// Subfolder under the world root, `None` for the overworld.
    pub fn folder_name(self) -> Option<&'static str> {
        match self {
            Dimension::Overworld => None,
            Dimension::Nether => Some("DIM-1"),
            Dimension::End => Some("DIM1"),
        }
    }

    /// The Nether and the End have no sky; sky-light relighting is skipped
    /// there entirely.
    pub fn has_sky_light(self) -> bool {
        matches!(self, Dimension::Overworld)
    }
}

/// Options for opening a world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldConfig {
    /// Upper bound on parsed-but-unattached chunks held in memory, and on
    /// the relighting batch size.
    #[serde(default = "default_loaded_chunk_limit")]
    pub loaded_chunk_limit: usize,
    /// Cap on light propagation passes per light kind.
    #[serde(default = "default_light_passes")]
    pub light_passes: u32,
    /// World height in blocks. Sections are 16 high, so this must be a
    /// multiple of 16.
    #[serde(default = "default_height")]
    pub height: usize,
    /// Read-only worlds never take the session lock and never write.
    #[serde(default)]
    pub readonly: bool,
    /// Block light tables for the game edition being edited.
    #[serde(default)]
    pub materials: BlockProperties,
}

fn default_loaded_chunk_limit() -> usize {
    400
}

fn default_light_passes() -> u32 {
    14
}

fn default_height() -> usize {
    256
}

impl Default for WorldConfig {
    fn default() -> Self {
        WorldConfig {
            loaded_chunk_limit: default_loaded_chunk_limit(),
            light_passes: default_light_passes(),
            height: default_height(),
            readonly: false,
            materials: BlockProperties::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorldConfig::default();
        assert_eq!(config.loaded_chunk_limit, 400);
        assert_eq!(config.light_passes, 14);
        assert_eq!(config.height, 256);
        assert!(!config.readonly);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: WorldConfig = serde_json::from_str(r#"{"loaded_chunk_limit": 16}"#).unwrap();
        assert_eq!(config.loaded_chunk_limit, 16);
        assert_eq!(config.light_passes, 14);
        assert_eq!(config.height, 256);
    }

    #[test]
    fn test_dimension_folders() {
        assert_eq!(Dimension::Overworld.folder_name(), None);
        assert_eq!(Dimension::Nether.folder_name(), Some("DIM-1"));
        assert_eq!(Dimension::End.folder_name(), Some("DIM1"));
        assert!(Dimension::Overworld.has_sky_light());
        assert!(!Dimension::Nether.has_sky_light());
        assert!(!Dimension::End.has_sky_light());
    }
}
