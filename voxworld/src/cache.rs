//! The shared in-memory chunk cache.
//!
//! A closed-address hash table keyed by chunk coordinate. The bucket table is
//! behind one read/write lock; every chunk handle carries its own lock plus
//! an atomic touch bit, so the hot lookup path runs entirely under the shared
//! table lock. A periodic clock sweep evicts chunks whose touch bit was not
//! set since the previous pass.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use glam::{DVec3, IVec3};
use tracing::warn;

use crate::block::{self, Block};
use crate::chunk::Chunk;
use crate::gen::TerrainGenerator;
use crate::geom;
use crate::storage::ChunkDir;

/// Number of hash buckets. An even number does not mix well with the
/// coordinate hash.
pub const WORLD_CACHE_SIZE: usize = 32767;

/// Hash a chunk coordinate into a bucket index.
#[inline]
fn bucket_index(pos: IVec3) -> usize {
    let hash = (pos.x as u32)
        .wrapping_mul(87)
        .wrapping_add((pos.y as u32).wrapping_mul(988_261))
        .wrapping_add((pos.z as u32).wrapping_mul(79_261));
    hash as usize % WORLD_CACHE_SIZE
}

/// A cached chunk. The cache exclusively owns all live chunks; everyone else
/// holds `Arc` handles whose lifetime outlasting eviction is harmless.
pub struct ChunkHandle {
    /// The chunk coordinate, immutable for the lifetime of the handle.
    pub pos: IVec3,
    /// Cleared by the sweeper, set by any access.
    touched: AtomicBool,
    /// Mirrors `Chunk::has_jelly` so the lookup path can test it without
    /// taking the chunk lock.
    jelly: AtomicBool,
    inner: RwLock<Chunk>,
}

impl ChunkHandle {

    fn new(chunk: Chunk) -> Arc<Self> {
        Arc::new(Self {
            pos: chunk.pos,
            touched: AtomicBool::new(true),
            jelly: AtomicBool::new(chunk.has_jelly()),
            inner: RwLock::new(chunk),
        })
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Chunk> {
        self.inner.read().expect("poisoned")
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Chunk> {
        self.inner.write().expect("poisoned")
    }

    /// Turn a block to jelly under this chunk's lock and keep the handle's
    /// jelly bit in sync.
    pub fn turn_to_jelly(&self, x: u8, y: u8, z: u8, deadline: Instant) {
        let mut chunk = self.write();
        chunk.turn_to_jelly(x, y, z, deadline);
        self.jelly.store(chunk.has_jelly(), Ordering::Relaxed);
    }

    /// Revert expired jelly blocks, or all of them.
    pub fn restore_jelly(&self, unconditionally: bool) {
        let mut chunk = self.write();
        chunk.restore_jelly(unconditionally, Instant::now());
        self.jelly.store(chunk.has_jelly(), Ordering::Relaxed);
    }

}

/// The cache itself, shared between every task through an `Arc`.
pub struct ChunkCache {
    buckets: RwLock<Vec<Vec<Arc<ChunkHandle>>>>,
    dir: ChunkDir,
    gen: TerrainGenerator,
    count: AtomicUsize,
}

impl ChunkCache {

    pub fn new(dir: ChunkDir, gen: TerrainGenerator) -> Self {
        Self {
            buckets: RwLock::new(vec![Vec::new(); WORLD_CACHE_SIZE]),
            dir,
            gen,
            count: AtomicUsize::new(0),
        }
    }

    /// Number of chunks currently cached.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Find the chunk, loading or generating it on a miss. This is the speed
    /// critical entry point of the whole world model.
    pub fn find(&self, pos: IVec3) -> Arc<ChunkHandle> {

        // The fast path assumes the chunk is cached and only needs the
        // shared table lock.
        {
            let buckets = self.buckets.read().expect("poisoned");
            if let Some(handle) = lookup(&buckets, pos) {
                drop(buckets);
                if handle.jelly.load(Ordering::Relaxed) {
                    handle.restore_jelly(false);
                }
                return handle;
            }
        }

        // Slow path: take the exclusive lock, then re-check because another
        // task may have inserted the chunk in between.
        let mut buckets = self.buckets.write().expect("poisoned");
        if let Some(handle) = lookup(&buckets, pos) {
            return handle;
        }

        let handle = ChunkHandle::new(self.load_or_generate(pos));
        buckets[bucket_index(pos)].push(Arc::clone(&handle));
        self.count.fetch_add(1, Ordering::Relaxed);
        handle

    }

    /// Read a chunk from disk, falling back to deterministic generation when
    /// the file is absent or unreadable. Fresh chunks in the starter band
    /// come out owned by the reserved owner and are written back so the
    /// region stays stable across restarts.
    fn load_or_generate(&self, pos: IVec3) -> Chunk {

        match self.dir.read_chunk(pos) {
            Ok(Some(chunk)) => return chunk,
            Ok(None) => {}
            Err(e) => warn!("chunk {pos} unreadable, regenerating: {e}"),
        }

        let mut chunk = self.gen.generate(pos);
        if (-4..=4).contains(&pos.y) && (-1..=2).contains(&pos.z) {
            chunk.owner = block::OWNER_RESERVED;
        }
        if !self.gen.inhibit_create {
            if let Err(e) = self.dir.write_chunk(&chunk) {
                warn!("chunk {pos} initial write failed: {e}");
            }
        }
        chunk

    }

    /// The block type at a world position.
    pub fn get_block(&self, pos: DVec3) -> Block {
        let cc = geom::calc_chunk_pos(pos);
        let (x, y, z) = geom::calc_block_offset(pos, cc);
        let handle = self.find(cc);
        let chunk = handle.read();
        chunk.get(x, y, z)
    }

    /// Apply a player block mutation and persist the chunk. Returns false
    /// when the chunk refuses the edit.
    pub fn update_block(&self, cc: IVec3, x: u8, y: u8, z: u8, new: Block) -> bool {
        let handle = self.find(cc);
        let mut chunk = handle.write();
        if !chunk.update_block(x, y, z, new) {
            return false;
        }
        handle.jelly.store(chunk.has_jelly(), Ordering::Relaxed);
        if !self.gen.inhibit_create {
            // The per-chunk lock is held over the file write on purpose:
            // this is the one sanctioned lock-across-io in the system.
            if let Err(e) = self.dir.write_chunk(&chunk) {
                warn!("chunk {cc} write failed: {e}");
            }
        }
        true
    }

    /// Claim an unowned chunk for a player. The ownership test and the
    /// commit happen under one chunk lock, so two racing claims cannot both
    /// win.
    pub fn claim_chunk(&self, cc: IVec3, new_owner: u32) -> bool {
        let handle = self.find(cc);
        let mut chunk = handle.write();
        if chunk.owner != block::OWNER_NONE {
            return false;
        }
        chunk.owner = new_owner;
        chunk.flag |= block::CHF_MODIFIED;
        if !self.gen.inhibit_create {
            if let Err(e) = self.dir.write_chunk(&chunk) {
                warn!("chunk {cc} write failed: {e}");
            }
        }
        true
    }

    /// Overwrite a chunk's owner, for admin grants.
    pub fn set_owner(&self, cc: IVec3, owner: u32) -> u32 {
        let handle = self.find(cc);
        let mut chunk = handle.write();
        let previous = chunk.owner;
        chunk.owner = owner;
        chunk.flag |= block::CHF_MODIFIED;
        if !self.gen.inhibit_create {
            if let Err(e) = self.dir.write_chunk(&chunk) {
                warn!("chunk {cc} write failed: {e}");
            }
        }
        previous
    }

    /// One clock sweep pass over every bucket: a chunk whose touch bit is
    /// clear is evicted, a set bit is cleared to arm it for the next pass.
    /// Modified chunks are written out before the handle is dropped.
    pub fn sweep(&self) {
        let mut buckets = self.buckets.write().expect("poisoned");
        for bucket in buckets.iter_mut() {
            bucket.retain(|handle| {
                if handle.touched.swap(false, Ordering::Relaxed) {
                    return true;
                }
                let mut chunk = handle.write();
                if chunk.flag & block::CHF_MODIFIED != 0 && !self.gen.inhibit_create {
                    chunk.restore_jelly(true, Instant::now());
                    if let Err(e) = self.dir.write_chunk(&chunk) {
                        warn!("evicting chunk {}: write failed: {e}", handle.pos);
                    }
                }
                self.count.fetch_sub(1, Ordering::Relaxed);
                false
            });
        }
    }

    /// Whether a position can hold an entity of the given height: solid
    /// ground below the feet and permeable space all the way up.
    pub fn valid_spawn_point(&self, pos: DVec3, height: f64) -> bool {
        if pos.z < 0.0 {
            return false;
        }
        if block::is_permeable(self.get_block(pos - DVec3::Z)) {
            return false;
        }
        let mut off = 0.0;
        while off < height {
            if !block::is_permeable(self.get_block(pos + DVec3::Z * off)) {
                return false;
            }
            off += 1.0;
        }
        true
    }

    /// The six face-adjacent chunks, loading each as needed.
    pub fn adjacent(&self, cc: IVec3) -> [Arc<ChunkHandle>; 6] {
        [
            self.find(cc + IVec3::X),
            self.find(cc - IVec3::X),
            self.find(cc + IVec3::Y),
            self.find(cc - IVec3::Y),
            self.find(cc + IVec3::Z),
            self.find(cc - IVec3::Z),
        ]
    }

    /// Write back every modified chunk, used at shutdown.
    pub fn flush(&self) {
        if self.gen.inhibit_create {
            return;
        }
        let buckets = self.buckets.read().expect("poisoned");
        for bucket in buckets.iter() {
            for handle in bucket {
                let mut chunk = handle.write();
                if chunk.flag & block::CHF_MODIFIED != 0 {
                    chunk.restore_jelly(true, Instant::now());
                    if let Err(e) = self.dir.write_chunk(&chunk) {
                        warn!("flush of chunk {} failed: {e}", handle.pos);
                    }
                }
            }
        }
    }

    /// Integrate gravity over `dt` for an entity at `coord` with the given
    /// upward speed. The coordinate is moved; the new speed is returned, zero
    /// when the fall hit ground. A fall of more than one block per step is
    /// probed block by block so nothing falls through a floor.
    pub fn update_z_pos(&self, dt: std::time::Duration, z_speed: f64, coord: &mut DVec3, gravity: f64) -> f64 {
        let new_speed = z_speed - dt.as_secs_f64() * gravity;
        if new_speed > 0.0 {
            coord.z += new_speed;
            new_speed
        } else if new_speed < 0.0 {
            let down = -new_speed;
            let start = down - down.floor();
            let mut allowed = 0.0;
            let mut d = start;
            while d <= down {
                let probe = DVec3::new(coord.x, coord.y, coord.z - d);
                if !block::is_permeable(self.get_block(probe)) {
                    // Ground: stop the fall on top of the blocking block.
                    coord.z = probe.z.floor() + 1.0;
                    return 0.0;
                }
                allowed = d;
                d += 1.0;
            }
            coord.z -= allowed;
            new_speed
        } else {
            new_speed
        }
    }

    /// The ground height at `(x, y)`: scan downward from the top of the
    /// island band for the first impermeable block, returning the z of the
    /// free space above it.
    pub fn find_ground(&self, x: f64, y: f64) -> f64 {
        let mut z = 95.0;
        while z >= 0.0 {
            if !block::is_permeable(self.get_block(DVec3::new(x, y, z))) {
                break;
            }
            z -= 1.0;
        }
        z + 1.0
    }

}

fn lookup(buckets: &[Vec<Arc<ChunkHandle>>], pos: IVec3) -> Option<Arc<ChunkHandle>> {
    buckets[bucket_index(pos)].iter()
        .find(|h| h.pos == pos)
        .map(|h| {
            h.touched.store(true, Ordering::Relaxed);
            Arc::clone(h)
        })
}

#[cfg(test)]
mod tests {

    use std::time::Duration;
    use super::*;

    fn test_cache(name: &str, inhibit: bool) -> ChunkCache {
        let dir = std::env::temp_dir().join(format!("voxworld-cache-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        ChunkCache::new(ChunkDir::new(dir).unwrap(), TerrainGenerator::new(inhibit))
    }

    #[test]
    fn find_caches_and_marks_touched() {
        let cache = test_cache("find", true);
        let a = cache.find(IVec3::new(1, 2, 3));
        let b = cache.find(IVec3::new(1, 2, 3));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn sweep_evicts_untouched_chunks() {
        let cache = test_cache("sweep", true);
        cache.find(IVec3::new(0, 0, 0));
        cache.find(IVec3::new(1, 0, 0));
        assert_eq!(cache.len(), 2);

        // First pass clears the touch bits, second pass evicts.
        cache.sweep();
        assert_eq!(cache.len(), 2);
        // Keep one alive in between.
        cache.find(IVec3::new(0, 0, 0));
        cache.sweep();
        assert_eq!(cache.len(), 1);
        cache.sweep();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn jelly_restores_on_lookup() {
        let cache = test_cache("jelly", true);
        let handle = cache.find(IVec3::new(0, 0, 0));
        {
            let mut chunk = handle.write();
            chunk.set_raw(4, 4, 4, block::STONE);
        }
        handle.turn_to_jelly(4, 4, 4, Instant::now() - Duration::from_secs(1));
        assert_eq!(handle.read().get(4, 4, 4), block::AIR);

        // The expired jelly is reverted by the next lookup.
        let handle = cache.find(IVec3::new(0, 0, 0));
        assert_eq!(handle.read().get(4, 4, 4), block::STONE);
    }

    #[test]
    fn eviction_persists_modified_chunks() {
        let cache = test_cache("persist", false);
        let cc = IVec3::new(0, 0, 4);
        assert!(cache.update_block(cc, 7, 7, 7, block::BRICK));
        cache.sweep();
        cache.sweep();
        assert_eq!(cache.len(), 0);

        let handle = cache.find(cc);
        assert_eq!(handle.read().get(7, 7, 7), block::BRICK);
    }

    #[test]
    fn starter_band_is_reserved() {
        let cache = test_cache("starter", false);
        let starter = cache.find(IVec3::new(0, 0, 0));
        assert_eq!(starter.read().owner, block::OWNER_RESERVED);
        let outside = cache.find(IVec3::new(0, 8, 0));
        assert_eq!(outside.read().owner, block::OWNER_NONE);
    }

}
