//! Procedural terrain generation from layered simplex noise.
//!
//! Generation is deterministic from the chunk coordinate alone, which is what
//! lets the cache fall back to regeneration whenever a chunk file cannot be
//! read.

use glam::IVec3;

use crate::block::{self, Block};
use crate::chunk::Chunk;
use crate::geom::CHUNK_SIZE;
use crate::util::noise::{noise2, noise3};

/// No soil accumulates above this height.
const WORLD_SOIL_LEVEL: f64 = 9.0;
/// No floating islands are created below this height.
const FLOATING_ISLANDS_LIM: f64 = 96.0;
/// The density required for a floating island.
const FLOATING_ISLANDS_PROB: f64 = 0.85;
/// A bigger number makes cave tunnels wider.
const CAVE_WIDTH: f64 = 0.1;
/// Max depth of excavated holes.
const HOLE_DEPTH: f64 = 50.0;

// Flora probability thresholds, from rare to common.
const TREE3_PROB: f64 = 0.0005;
const TREE2_PROB: f64 = 0.005;
const TREE1_PROB: f64 = 0.010;
const FLOWER_PROB: f64 = 0.012;
const TUFT_PROB: f64 = 0.020;

/// Density field used for islands, holes and tunnels, in range 0..1.
#[inline]
fn density(x: f64, y: f64, z: f64) -> f64 {
    noise3(x * 0.01, y * 0.01, z * 0.01) / 2.0 + 0.5
}

/// The terrain generator. One instance is shared by every task that can miss
/// the chunk cache.
#[derive(Debug, Clone)]
pub struct TerrainGenerator {
    /// When set, every generated chunk is plain air and nothing is written
    /// back to disk: the read-only world mode.
    pub inhibit_create: bool,
}

impl TerrainGenerator {

    pub fn new(inhibit_create: bool) -> Self {
        Self { inhibit_create }
    }

    /// Generate the chunk at the given coordinate. The result is compressed
    /// and checksummed, ready for cache insertion.
    pub fn generate(&self, pos: IVec3) -> Chunk {

        let mut chunk = Chunk::new_air(pos);
        if self.inhibit_create {
            return chunk;
        }

        let z1 = pos.z as i64 * CHUNK_SIZE as i64;

        for x in 0..CHUNK_SIZE as u8 {
            let xf = (x as i64 + pos.x as i64 * CHUNK_SIZE as i64) as f64;
            for y in 0..CHUNK_SIZE as u8 {
                let yf = (y as i64 + pos.y as i64 * CHUNK_SIZE as i64) as f64;

                // High frequency terrain, modulated by a squared factor, on
                // top of a slow low frequency base.
                let high_freq = 20.0 * noise2(xf * 0.016, yf * 0.016);
                let f = noise2(xf * 0.0025, yf * 0.0025);
                let low_freq = 15.0 * noise2(xf * 0.0013, yf * 0.0013);
                let stone_height = (2.5 + high_freq * f * f + low_freq).floor();

                // Iterate from high z to low, so rules that look at the
                // block above stay within the chunk.
                for z in (0..CHUNK_SIZE as u8).rev() {
                    let zf = (z as i64 + z1) as f64;
                    chunk.set_raw(x, y, z, self.column_block(&chunk, x, y, z, xf, yf, zf, stone_height));
                }

                // Seed flora on soil with air above. A second low frequency
                // modulator thins out whole areas.
                for z in (0..CHUNK_SIZE as u8 - 1).rev() {
                    if chunk.get(x, y, z) != block::SOIL || !block::is_invisible(chunk.get(x, y, z + 1)) {
                        continue;
                    }
                    // Without scaling there is a line where xf+yf == 0 gives 0.
                    let rnd = noise2(xf * 422.34, yf * 234.123).abs();
                    if rnd > TUFT_PROB {
                        continue;
                    }
                    let low = 1.0 - noise2(xf * 0.002, yf * 0.002).abs();
                    let low = 1.0 - low * low;
                    let flora = match rnd {
                        r if r < TREE3_PROB * low => Some(block::TREE3),
                        r if r < TREE2_PROB * low => Some(block::TREE2),
                        r if r < TREE1_PROB * low => Some(block::TREE1),
                        r if r < FLOWER_PROB * low => Some(block::FLOWERS),
                        r if r < TUFT_PROB * low => Some(block::TUFT),
                        _ => None,
                    };
                    if let Some(flora) = flora {
                        chunk.set_raw(x, y, z + 1, flora);
                    }
                }

            }
        }

        chunk.compress();
        chunk.update_checksum();
        chunk.rebuild_links();
        chunk

    }

    /// Compute the terrain block for one cell, given the column's stone
    /// height. `chunk` is read for the block above the cell.
    #[allow(clippy::too_many_arguments)]
    fn column_block(&self, chunk: &Chunk, x: u8, y: u8, z: u8, xf: f64, yf: f64, zf: f64, stone_height: f64) -> Block {

        if zf > FLOATING_ISLANDS_LIM {
            // Gradual transient, or all islands would have a hard cut off.
            let f = ((1.0 - FLOATING_ISLANDS_PROB) / CHUNK_SIZE as f64 * (zf - FLOATING_ISLANDS_LIM)
                + FLOATING_ISLANDS_PROB)
                .min(1.0);
            let d = f * density(xf / 2.0, yf / 2.0, zf);
            if d > FLOATING_ISLANDS_PROB {
                if (z as i32) < CHUNK_SIZE - 1 && block::is_invisible(chunk.get(x, y, z + 1)) {
                    return block::SOIL; // Grass cap on top.
                }
                return block::STONE;
            }
            return block::AIR;
        }

        let d = density(xf / 2.0, yf / 2.0, zf);
        let mut soil_depth = (2.0 * noise2(xf * 0.012, yf * 0.012) + 2.8).floor();
        if stone_height > WORLD_SOIL_LEVEL {
            soil_depth = 0.0;
        } else if soil_depth + stone_height > WORLD_SOIL_LEVEL {
            soil_depth = WORLD_SOIL_LEVEL - stone_height;
        }
        let height = stone_height + soil_depth;

        let mut bl = block::AIR;
        if zf <= stone_height {
            bl = if zf > 24.0 { block::SNOW } else { block::STONE };
        } else if zf <= height {
            bl = block::SOIL;
        }

        // Excavate holes, fading out below sea level so they never go too
        // deep.
        if zf > -HOLE_DEPTH && zf < HOLE_DEPTH {
            let hole = density(xf, yf, zf);
            let fade = if zf <= 0.0 { (HOLE_DEPTH + zf) / HOLE_DEPTH } else { 1.0 };
            if hole * fade > 0.7 {
                bl = block::AIR;
            }
        }

        // Below the water line: air floods, soil petrifies, and stone at the
        // surface becomes a beach when open above.
        if zf <= 0.0 {
            if bl == block::AIR {
                bl = block::WATER;
            } else if bl == block::SOIL {
                bl = block::STONE;
            }
            if bl == block::STONE && zf == 0.0 && (z as i32) < CHUNK_SIZE - 1
                && block::is_invisible(chunk.get(x, y, z + 1))
            {
                bl = block::SAND;
            }
        }

        // Carve tunnels where two mirrored density shells intersect.
        let in_shell = d > 0.5 - CAVE_WIDTH / 2.0 && d < 0.5 + CAVE_WIDTH / 2.0;
        if zf <= height && in_shell {
            let d2 = density(1000.0 - xf / 2.0, 1000.0 - yf / 2.0, 1000.0 - zf);
            let in_mirror = d2 > 0.5 - CAVE_WIDTH / 2.0 && d2 < 0.5 + CAVE_WIDTH / 2.0;
            if in_mirror && bl != block::WATER {
                bl = block::AIR;
            }
        }

        bl

    }

}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn generation_is_deterministic() {
        let gen = TerrainGenerator::new(false);
        let a = gen.generate(IVec3::new(0, 0, 0));
        let b = gen.generate(IVec3::new(0, 0, 0));
        assert_eq!(a.compressed(), b.compressed());
        assert_eq!(a.checksum, b.checksum);
    }

    #[test]
    fn different_chunks_differ() {
        let gen = TerrainGenerator::new(false);
        let a = gen.generate(IVec3::new(0, 0, 0));
        let b = gen.generate(IVec3::new(5, -3, 0));
        assert_ne!(a.compressed(), b.compressed());
    }

    #[test]
    fn high_altitude_is_mostly_air() {
        let gen = TerrainGenerator::new(false);
        // Far above the floating island band.
        let chunk = gen.generate(IVec3::new(0, 0, 40));
        let air = (0..32u8)
            .flat_map(|x| (0..32u8).flat_map(move |y| (0..32u8).map(move |z| (x, y, z))))
            .filter(|&(x, y, z)| chunk.get(x, y, z) == block::AIR)
            .count();
        assert!(air > crate::geom::CHUNK_VOL / 2);
    }

    #[test]
    fn inhibit_mode_generates_air_only() {
        let gen = TerrainGenerator::new(true);
        let chunk = gen.generate(IVec3::new(0, 0, 0));
        assert!(chunk.compressed().chunks_exact(2).all(|p| p[0] == block::AIR));
    }

    #[test]
    fn sea_level_chunk_contains_water() {
        let gen = TerrainGenerator::new(false);
        // The chunk spanning z in -32..0 is below the water line.
        let chunk = gen.generate(IVec3::new(2, 2, -1));
        let water = chunk.compressed()
            .chunks_exact(2)
            .any(|p| p[0] == block::WATER);
        assert!(water);
    }

}
