//! Per-block-id light property tables.
//!
//! The lighting engine consults these tables by numeric block id; which
//! table applies is decided by the caller (different game editions ship
//! different tables), so the world takes a [`BlockProperties`] through its
//! configuration instead of hard-coding one.

use serde::{Deserialize, Serialize};

/// Block ids are 12-bit once the high-nibble `Add` array is merged in.
pub const BLOCK_ID_COUNT: usize = 4096;

/// Light emission (0–15) and raw light absorption (0–15) per block id.
///
/// Absorption is stored raw: 0 means fully transparent, which is what the
/// height-map computation needs. The lighting passes clamp absorption into
/// [1, 15] so light always falls off by at least one per cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockProperties {
    emission: Vec<u8>,
    absorption: Vec<u8>,
}

impl BlockProperties {
    /// A table where every id is transparent and emits nothing.
    pub fn transparent() -> BlockProperties {
        BlockProperties {
            emission: vec![0; BLOCK_ID_COUNT],
            absorption: vec![0; BLOCK_ID_COUNT],
        }
    }

    /// The classic numeric-id table: air and a small set of known
    /// transparent blocks pass light, light sources emit, everything else
    /// is opaque.
    pub fn classic() -> BlockProperties {
        let mut emission = vec![0u8; BLOCK_ID_COUNT];
        let mut absorption = vec![15u8; BLOCK_ID_COUNT];

        // Fully transparent blocks.
        for id in [
            0u16, // air
            6,    // sapling
            20,   // glass
            26,   // bed
            27, 28, 66, // rails
            31, 32, // grasses / dead bush
            37, 38, 39, 40, // flowers, mushrooms
            50, // torch
            51, // fire
            55, // redstone wire
            59, // crops
            63, 68, // signs
            64, 71, // doors
            65, // ladder
            69, 70, 72, // lever, pressure plates
            75, 76, // redstone torches
            77, // button
            78, // snow layer
            83, // reeds
            90, // portal
            96, // trapdoor
            102, // glass pane
            106, // vines
        ] {
            absorption[id as usize] = 0;
        }

        // Translucent blocks.
        absorption[8] = 3; // flowing water
        absorption[9] = 3; // still water
        absorption[18] = 1; // leaves
        absorption[79] = 3; // ice
        absorption[30] = 1; // cobweb

        // Light sources.
        emission[10] = 15; // flowing lava
        emission[11] = 15; // still lava
        emission[39] = 1; // brown mushroom
        emission[50] = 14; // torch
        emission[51] = 15; // fire
        emission[62] = 13; // lit furnace
        emission[76] = 7; // lit redstone torch
        emission[89] = 15; // glowstone
        emission[90] = 11; // portal
        emission[91] = 15; // jack o'lantern
        emission[94] = 9; // repeater (powered)

        BlockProperties {
            emission,
            absorption,
        }
    }

    pub fn emission(&self, id: u16) -> u8 {
        self.emission.get(id as usize).copied().unwrap_or(0)
    }

    /// Raw absorption for `id`; 0 means the block does not block light at
    /// all (relevant for the height map).
    pub fn absorption(&self, id: u16) -> u8 {
        self.absorption.get(id as usize).copied().unwrap_or(15)
    }

    pub fn set_emission(&mut self, id: u16, value: u8) {
        if let Some(slot) = self.emission.get_mut(id as usize) {
            *slot = value.min(15);
        }
    }

    pub fn set_absorption(&mut self, id: u16, value: u8) {
        if let Some(slot) = self.absorption.get_mut(id as usize) {
            *slot = value.min(15);
        }
    }
}

impl Default for BlockProperties {
    fn default() -> Self {
        BlockProperties::classic()
    }
}
