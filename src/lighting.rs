//! Iterative relighting.
//!
//! Recomputes sky-light and block-light for a set of dirty chunks so the
//! values are consistent with the current blocks, spreading correctly
//! across chunk boundaries.
//!
//! Seeding resets each dirty chunk's block light to its blocks' emission
//! values and pulls in the eight neighbors (a removed light source is only
//! detectable by re-examining them). Propagation then runs a bounded number
//! of passes per light kind; each pass moves light one cell along each axis
//! with `max(current, source - absorption)`, absorption clamped to [1, 15].
//! A chunk whose light stops changing drops out of the active set. Large
//! requests are split into batches under the loaded-chunk limit to bound
//! peak memory.

use crate::chunk::ChunkData;
use crate::error::WorldError;
use crate::materials::BlockProperties;
use crate::world::{Chunk, World};
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightKind {
    Block,
    Sky,
}

impl LightKind {
    pub fn name(self) -> &'static str {
        match self {
            LightKind::Block => "BlockLight",
            LightKind::Sky => "SkyLight",
        }
    }
}

/// One step of a resumable relighting run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelightProgress {
    /// A batch was seeded: emission reset, neighbors pulled in.
    Seeded { batch: usize, chunks: usize },
    /// One propagation pass ran over `active` chunks.
    Pass {
        batch: usize,
        light: LightKind,
        pass: u32,
        active: usize,
    },
    /// A batch converged (or hit the pass cap) for every light kind.
    BatchDone { batch: usize },
}

impl World {
    /// Relight the given chunk positions, or everything flagged as needing
    /// lighting when `positions` is `None`.
    pub fn generate_lights(&self, positions: Option<&[(i32, i32)]>) -> Result<(), WorldError> {
        for step in self.generate_lights_iter(positions)? {
            step?;
        }
        Ok(())
    }

    /// Begin a resumable relighting run; each iteration performs one seed
    /// or propagation step and reports progress.
    pub fn generate_lights_iter(
        &self,
        positions: Option<&[(i32, i32)]>,
    ) -> Result<Relight<'_>, WorldError> {
        let mut dirty: Vec<(i32, i32)> = match positions {
            Some(requested) => {
                let mut present = Vec::with_capacity(requested.len());
                for &(cx, cz) in requested {
                    if self.contains_chunk(cx, cz)? {
                        present.push((cx, cz));
                    }
                }
                present
            }
            None => self.chunks_needing_lighting(),
        };
        dirty.sort_unstable();

        info!(count = dirty.len(), "asked to light chunks");

        let limit = self.config().loaded_chunk_limit.max(1);
        let mut batches = vec![dirty];
        while batches[0].len() > limit {
            batches = split_chunk_lists(batches);
        }
        batches.retain(|batch| !batch.is_empty());
        if batches.len() > 1 {
            info!(batches = batches.len(), "splitting relight into batches to conserve memory");
        }

        Ok(Relight {
            world: self,
            batches: batches.into(),
            batch: 0,
            current: None,
        })
    }
}

/// Split each list into quarters: halved on x (input is x-sorted), each half
/// sorted on z and halved again.
fn split_chunk_lists(lists: Vec<Vec<(i32, i32)>>) -> Vec<Vec<(i32, i32)>> {
    let mut out = Vec::with_capacity(lists.len() * 4);
    for list in lists {
        let (small_x, big_x) = list.split_at(list.len() / 2);
        for half in [small_x, big_x] {
            let mut by_z = half.to_vec();
            by_z.sort_unstable_by_key(|&(cx, cz)| (cz, cx));
            let (near, far) = by_z.split_at(by_z.len() / 2);
            out.push(near.to_vec());
            out.push(far.to_vec());
        }
    }
    out
}

// ─── Relight iterator ───────────────────────────────────────────────────────

pub struct Relight<'w> {
    world: &'w World,
    batches: VecDeque<Vec<(i32, i32)>>,
    batch: usize,
    current: Option<BatchState>,
}

struct BatchState {
    /// Dirty set after neighbor expansion; holding the views pins every
    /// chunk of the batch for its whole run.
    seeded: Vec<Chunk>,
    lights: VecDeque<LightKind>,
    pass: u32,
    active: Vec<Chunk>,
}

impl Relight<'_> {
    fn step(&mut self) -> Result<Option<RelightProgress>, WorldError> {
        loop {
            let Some(state) = &mut self.current else {
                let Some(positions) = self.batches.pop_front() else {
                    return Ok(None);
                };
                let state = seed_batch(self.world, &positions)?;
                let chunks = state.seeded.len();
                self.current = Some(state);
                return Ok(Some(RelightProgress::Seeded {
                    batch: self.batch,
                    chunks,
                }));
            };

            let Some(&light) = state.lights.front() else {
                for chunk in &state.seeded {
                    chunk.set_needs_lighting(false);
                }
                let done = RelightProgress::BatchDone { batch: self.batch };
                self.batch += 1;
                self.current = None;
                return Ok(Some(done));
            };

            if state.pass >= self.world.config().light_passes || state.active.is_empty() {
                state.lights.pop_front();
                state.pass = 0;
                state.active = state.seeded.clone();
                continue;
            }

            debug!(light = light.name(), pass = state.pass, chunks = state.active.len(), "propagation pass");
            let active = std::mem::take(&mut state.active);
            let pass = state.pass;
            state.pass += 1;
            state.active = propagate_pass(self.world, &active, light)?;
            return Ok(Some(RelightProgress::Pass {
                batch: self.batch,
                light,
                pass,
                active: active.len(),
            }));
        }
    }
}

impl Iterator for Relight<'_> {
    type Item = Result<RelightProgress, WorldError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step() {
            Ok(Some(progress)) => Some(Ok(progress)),
            Ok(None) => None,
            Err(e) => {
                self.current = None;
                self.batches.clear();
                Some(Err(e))
            }
        }
    }
}

// ─── Seeding ────────────────────────────────────────────────────────────────

fn seed_batch(world: &World, positions: &[(i32, i32)]) -> Result<BatchState, WorldError> {
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut seen: FxHashSet<(i32, i32)> = FxHashSet::default();

    for &(cx, cz) in positions {
        match world.get_chunk(cx, cz) {
            Ok(chunk) => {
                if seen.insert((cx, cz)) {
                    chunks.push(chunk);
                }
            }
            Err(WorldError::ChunkNotPresent(..)) => continue,
            Err(WorldError::ChunkMalformed { cx, cz, reason }) => {
                warn!(cx, cz, reason = %reason, "skipping malformed chunk during relight");
                continue;
            }
            Err(e) => return Err(e),
        }
    }

    // Fresh height maps and sky seeds for the requested set.
    for chunk in &chunks {
        chunk.chunk_changed();
    }

    // Relight the neighbors too, in case a light source they were lit by is
    // now gone.
    let requested: Vec<Chunk> = chunks.clone();
    for chunk in &requested {
        let (cx, cz) = chunk.pos();
        for dx in -1..=1 {
            for dz in -1..=1 {
                if dx == 0 && dz == 0 {
                    continue;
                }
                match world.get_chunk(cx + dx, cz + dz) {
                    Ok(neighbor) => {
                        neighbor.set_dirty(true);
                        if seen.insert(neighbor.pos()) {
                            chunks.push(neighbor);
                        }
                    }
                    Err(WorldError::ChunkNotPresent(..))
                    | Err(WorldError::ChunkMalformed { .. }) => continue,
                    Err(e) => return Err(e),
                }
            }
        }
    }

    chunks.sort_by_key(Chunk::pos);
    info!(chunks = chunks.len(), "lighting chunks");

    let props = &world.config().materials;
    for chunk in &chunks {
        let mut data = chunk.data_mut();
        seed_emission(&mut data, props);
        data.set_dirty(true);
    }

    let mut lights = VecDeque::new();
    lights.push_back(LightKind::Block);
    if world.dimension().has_sky_light() {
        lights.push_back(LightKind::Sky);
    }

    Ok(BatchState {
        active: chunks.clone(),
        seeded: chunks,
        lights,
        pass: 0,
    })
}

/// Reset block light to each block's self-emission.
fn seed_emission(data: &mut ChunkData, props: &BlockProperties) {
    for cell in 0..data.blocks.len() {
        data.block_light[cell] = props.emission(data.blocks[cell]);
    }
}

// ─── Propagation ────────────────────────────────────────────────────────────

#[derive(Clone, Copy)]
enum Axis {
    X,
    Z,
}

#[inline]
fn edge_col(axis: Axis, edge: usize, i: usize, height: usize) -> usize {
    match axis {
        Axis::X => (edge * 16 + i) * height,
        Axis::Z => (i * 16 + edge) * height,
    }
}

#[inline]
fn absorption(props: &BlockProperties, id: u16) -> i16 {
    props.absorption(id).clamp(1, 15) as i16
}

fn light_of(data: &ChunkData, kind: LightKind) -> &[u8] {
    match kind {
        LightKind::Block => &data.block_light,
        LightKind::Sky => &data.sky_light,
    }
}

fn light_of_mut(data: &mut ChunkData, kind: LightKind) -> &mut [u8] {
    match kind {
        LightKind::Block => &mut data.block_light,
        LightKind::Sky => &mut data.sky_light,
    }
}

/// Run one propagation pass over `active`; returns the chunks whose light
/// (or whose low-side neighbor's shared face) changed and must run again.
fn propagate_pass(
    world: &World,
    active: &[Chunk],
    kind: LightKind,
) -> Result<Vec<Chunk>, WorldError> {
    let props = &world.config().materials;
    let mut next: Vec<Chunk> = Vec::new();
    let mut queued: FxHashSet<(i32, i32)> = FxHashSet::default();
    let mut queue = |list: &mut Vec<Chunk>, chunk: &Chunk| {
        if queued.insert(chunk.pos()) {
            list.push(chunk.clone());
        }
    };

    for chunk in active {
        let (cx, cz) = chunk.pos();
        let xm = lighting_neighbor(world, cx - 1, cz)?;
        let xp = lighting_neighbor(world, cx + 1, cz)?;
        let zm = lighting_neighbor(world, cx, cz - 1)?;
        let zp = lighting_neighbor(world, cx, cz + 1)?;

        let (xm_changed, zm_changed, self_changed) =
            relight_chunk(chunk, xm.as_ref(), xp.as_ref(), zm.as_ref(), zp.as_ref(), kind, props);

        if xm_changed {
            if let Some(neighbor) = &xm {
                queue(&mut next, neighbor);
            }
        }
        if zm_changed {
            if let Some(neighbor) = &zm {
                queue(&mut next, neighbor);
            }
        }
        if self_changed {
            queue(&mut next, chunk);
        }
    }

    next.sort_by_key(Chunk::pos);
    Ok(next)
}

/// Fetch a neighbor for propagation; an out-of-world neighbor reads as
/// all-zero light and air. Present neighbors are marked dirty since their
/// edges may be written.
fn lighting_neighbor(world: &World, cx: i32, cz: i32) -> Result<Option<Chunk>, WorldError> {
    match world.get_chunk(cx, cz) {
        Ok(chunk) => {
            chunk.set_dirty(true);
            Ok(Some(chunk))
        }
        Err(WorldError::ChunkNotPresent(..)) | Err(WorldError::ChunkMalformed { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Spread light one cell in every direction within `chunk` and across its
/// four side faces. Returns whether the low-X neighbor's face, the low-Z
/// neighbor's face, or the chunk's own light changed.
fn relight_chunk(
    chunk: &Chunk,
    xm: Option<&Chunk>,
    xp: Option<&Chunk>,
    zm: Option<&Chunk>,
    zp: Option<&Chunk>,
    kind: LightKind,
    props: &BlockProperties,
) -> (bool, bool, bool) {
    let mut c = chunk.data_mut();
    let old_light = light_of(&c, kind).to_vec();

    // ── X axis ──
    let old_xm_edge = xm.map(|n| copy_edge(&n.data(), Axis::X, 15, kind));

    // Toward -X: into the neighbor's far face, one cell through the body,
    // then the near face fed from the +X neighbor.
    if let Some(n) = xm {
        spread_face(&c, 0, &mut n.data_mut(), 15, Axis::X, kind, props);
    }
    spread_body(&mut c, Axis::X, false, kind, props);
    if let Some(n) = xp {
        spread_face(&n.data(), 0, &mut c, 15, Axis::X, kind, props);
    }

    // Toward +X.
    if let Some(n) = xp {
        spread_face(&c, 15, &mut n.data_mut(), 0, Axis::X, kind, props);
    }
    spread_body(&mut c, Axis::X, true, kind, props);
    if let Some(n) = xm {
        spread_face(&n.data(), 15, &mut c, 0, Axis::X, kind, props);
    }

    let xm_changed = match (&old_xm_edge, xm) {
        (Some(old), Some(n)) => *old != copy_edge(&n.data(), Axis::X, 15, kind),
        _ => false,
    };

    // ── Z axis ──
    let old_zm_edge = zm.map(|n| copy_edge(&n.data(), Axis::Z, 15, kind));

    if let Some(n) = zm {
        spread_face(&c, 0, &mut n.data_mut(), 15, Axis::Z, kind, props);
    }
    spread_body(&mut c, Axis::Z, false, kind, props);
    if let Some(n) = zp {
        spread_face(&n.data(), 0, &mut c, 15, Axis::Z, kind, props);
    }

    if let Some(n) = zp {
        spread_face(&c, 15, &mut n.data_mut(), 0, Axis::Z, kind, props);
    }
    spread_body(&mut c, Axis::Z, true, kind, props);
    if let Some(n) = zm {
        spread_face(&n.data(), 15, &mut c, 0, Axis::Z, kind, props);
    }

    let zm_changed = match (&old_zm_edge, zm) {
        (Some(old), Some(n)) => *old != copy_edge(&n.data(), Axis::Z, 15, kind),
        _ => false,
    };

    // ── Vertical, both directions within the chunk ──
    spread_vertical(&mut c, kind, props);

    let self_changed = old_light != light_of(&c, kind);
    (xm_changed, zm_changed, self_changed)
}

fn copy_edge(data: &ChunkData, axis: Axis, edge: usize, kind: LightKind) -> Vec<u8> {
    let h = data.height();
    let mut out = Vec::with_capacity(16 * h);
    for i in 0..16 {
        let base = edge_col(axis, edge, i, h);
        out.extend_from_slice(&light_of(data, kind)[base..base + h]);
    }
    out
}

/// Carry light across the shared face from `src`'s `src_edge` plane into
/// `dst`'s `dst_edge` plane.
fn spread_face(
    src: &ChunkData,
    src_edge: usize,
    dst: &mut ChunkData,
    dst_edge: usize,
    axis: Axis,
    kind: LightKind,
    props: &BlockProperties,
) {
    let h = dst.height();
    for i in 0..16 {
        let sc = edge_col(axis, src_edge, i, h);
        let dc = edge_col(axis, dst_edge, i, h);
        for y in 0..h {
            let absorb = absorption(props, dst.blocks[dc + y]);
            let new = light_of(src, kind)[sc + y] as i16 - absorb;
            let slot = &mut light_of_mut(dst, kind)[dc + y];
            if new > *slot as i16 {
                *slot = new as u8;
            }
        }
    }
}

/// Move light one cell through the chunk along `axis`; `ascending` chooses
/// the direction of travel.
fn spread_body(data: &mut ChunkData, axis: Axis, ascending: bool, kind: LightKind, props: &BlockProperties) {
    let h = data.height();
    // Target columns ordered so every read still sees this step's source
    // values (the far column is read before it is overwritten).
    let targets: Vec<usize> = if ascending {
        (1..16).rev().collect()
    } else {
        (0..15).collect()
    };
    for i in 0..16 {
        for &t in &targets {
            let s = if ascending { t - 1 } else { t + 1 };
            let tc = edge_col(axis, t, i, h);
            let sc = edge_col(axis, s, i, h);
            for y in 0..h {
                let absorb = absorption(props, data.blocks[tc + y]);
                let new = light_of(data, kind)[sc + y] as i16 - absorb;
                let slot = &mut light_of_mut(data, kind)[tc + y];
                if new > *slot as i16 {
                    *slot = new as u8;
                }
            }
        }
    }
}

/// Vertical propagation, up then down, within each column.
fn spread_vertical(data: &mut ChunkData, kind: LightKind, props: &BlockProperties) {
    let h = data.height();
    for x in 0..16 {
        for z in 0..16 {
            let base = data.cell(x, z, 0);
            for y in (1..h).rev() {
                let absorb = absorption(props, data.blocks[base + y]);
                let new = light_of(data, kind)[base + y - 1] as i16 - absorb;
                let slot = &mut light_of_mut(data, kind)[base + y];
                if new > *slot as i16 {
                    *slot = new as u8;
                }
            }
            for y in 0..h - 1 {
                let absorb = absorption(props, data.blocks[base + y]);
                let new = light_of(data, kind)[base + y + 1] as i16 - absorb;
                let slot = &mut light_of_mut(data, kind)[base + y];
                if new > *slot as i16 {
                    *slot = new as u8;
                }
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_chunk_lists_quarters() {
        let positions: Vec<(i32, i32)> = (0..8)
            .flat_map(|x| (0..8).map(move |z| (x, z)))
            .collect();
        let mut sorted = positions.clone();
        sorted.sort_unstable();

        let quarters = split_chunk_lists(vec![sorted.clone()]);
        assert_eq!(quarters.len(), 4);
        let total: usize = quarters.iter().map(Vec::len).sum();
        assert_eq!(total, 64);

        // Every input position survives exactly once.
        let mut recombined: Vec<(i32, i32)> = quarters.into_iter().flatten().collect();
        recombined.sort_unstable();
        assert_eq!(recombined, sorted);
    }

    #[test]
    fn test_split_chunk_lists_handles_small_lists() {
        let quarters = split_chunk_lists(vec![vec![(0, 0)]]);
        let total: usize = quarters.iter().map(Vec::len).sum();
        assert_eq!(total, 1);
    }
}
