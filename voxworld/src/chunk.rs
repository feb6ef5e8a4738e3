//! A chunk stores a 32³ volume of blocks together with its compressed
//! representation, checksum, ownership, trigger wiring and temporary jelly
//! blocks.
//!
//! Whenever a chunk is not being mutated, the raw block array and the
//! compressed stream encode the same data; the filtered stream, if present,
//! is derivable from the raw array.

use std::time::Instant;

use glam::IVec3;
use serde::{Deserialize, Serialize};

use crate::block::{self, Block};
use crate::geom::{CHUNK_SIZE, CHUNK_VOL};

/// Association between one trigger block and one activator block, always
/// within the same chunk. Many-to-many: three triggers wired to four
/// activators produce twelve links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerLink {
    /// Coordinate of the trigger.
    pub trigger: (u8, u8, u8),
    /// Coordinate of the activator, holding a `SPAWN` or `TEXT` block.
    pub activator: (u8, u8, u8),
}

/// One record per `TEXT` block in the chunk. The messages are persisted with
/// the chunk; the inhibit deadline is not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextActivator {
    pub x: u8,
    pub y: u8,
    pub z: u8,
    pub messages: Vec<String>,
    /// The activator may not fire again until this time.
    #[serde(skip)]
    pub inhibit_until: Option<Instant>,
}

/// A block temporarily turned into air, with the deadline at which it
/// reverts to the original content.
#[derive(Debug, Clone, Copy)]
struct JellyBlock {
    deadline: Instant,
    original: Block,
    x: u8,
    y: u8,
    z: u8,
}

/// A 32³ region of the world.
pub struct Chunk {
    /// The chunk coordinate.
    pub pos: IVec3,
    /// Raw blocks in fixed `(x, y, z)` order.
    blocks: Box<[Block; CHUNK_VOL]>,
    /// RLE compressed blocks, kept in sync with `blocks`.
    compressed: Vec<u8>,
    /// Compressed stream with invisible blocks turned to air, built lazily.
    filtered: Option<Vec<u8>>,
    /// CRC32 of the compressed stream.
    pub checksum: u32,
    /// Bit mapped chunk flags, see `block::CHF_MODIFIED`.
    pub flag: u32,
    /// Owner uid, `OWNER_NONE` when unowned.
    pub owner: u32,
    /// Trigger→activator wiring, rebuilt after any block change.
    pub trigger_links: Vec<TriggerLink>,
    /// Text activators with their messages, persisted with the chunk.
    pub text_activators: Vec<TextActivator>,
    /// Outstanding jelly blocks, oldest first.
    jelly: Vec<JellyBlock>,
}

#[inline]
fn block_index(x: u8, y: u8, z: u8) -> usize {
    debug_assert!((x as i32) < CHUNK_SIZE && (y as i32) < CHUNK_SIZE && (z as i32) < CHUNK_SIZE);
    (x as usize * CHUNK_SIZE as usize + y as usize) * CHUNK_SIZE as usize + z as usize
}

impl Chunk {

    /// Create a chunk full of air at the given coordinate.
    pub fn new_air(pos: IVec3) -> Self {
        let mut chunk = Self {
            pos,
            blocks: vec![block::AIR; CHUNK_VOL].into_boxed_slice().try_into().unwrap(),
            compressed: Vec::new(),
            filtered: None,
            checksum: 0,
            flag: 0,
            owner: block::OWNER_NONE,
            trigger_links: Vec::new(),
            text_activators: Vec::new(),
            jelly: Vec::new(),
        };
        chunk.compress();
        chunk.update_checksum();
        chunk
    }

    /// Rebuild a chunk from a compressed stream, as read from disk. Trigger
    /// links are not rebuilt here, the caller does that once the activator
    /// partition is also restored.
    pub fn from_compressed(pos: IVec3, compressed: Vec<u8>) -> Self {
        let blocks = decode_rle(&compressed);
        Self {
            pos,
            blocks,
            compressed,
            filtered: None,
            checksum: 0,
            flag: 0,
            owner: block::OWNER_NONE,
            trigger_links: Vec::new(),
            text_activators: Vec::new(),
            jelly: Vec::new(),
        }
    }

    #[inline]
    pub fn get(&self, x: u8, y: u8, z: u8) -> Block {
        self.blocks[block_index(x, y, z)]
    }

    /// Set a block without any of the update machinery. Only for generation
    /// and tests; gameplay mutation goes through [`Chunk::update_block`].
    #[inline]
    pub fn set_raw(&mut self, x: u8, y: u8, z: u8, block: Block) {
        self.blocks[block_index(x, y, z)] = block;
    }

    /// Rebuild the compressed stream from the raw array. Invalidates the
    /// filtered stream.
    pub fn compress(&mut self) {
        self.compressed = encode_rle(&self.blocks[..]);
        self.filtered = None;
    }

    /// Recompute the checksum; the compressed stream must be current.
    pub fn update_checksum(&mut self) {
        let mut crc = flate2::Crc::new();
        crc.update(&self.compressed);
        self.checksum = crc.sum();
    }

    /// The compressed stream as sent to persistence.
    #[inline]
    pub fn compressed(&self) -> &[u8] {
        &self.compressed
    }

    /// The compressed stream with invisible blocks replaced by air, for
    /// sending to clients. Built on first use and cached.
    pub fn filtered(&mut self) -> &[u8] {
        if self.filtered.is_none() {
            self.filtered = Some(filter_invisible(&self.compressed));
        }
        self.filtered.as_deref().unwrap()
    }

    /// Apply a single block mutation from a player. Any pending jelly blocks
    /// are reverted first so the edit applies to the real content. A write is
    /// refused when both the old and new block are solid content, which
    /// happens when a client sends the same build twice.
    ///
    /// On success the compressed stream, checksum, modified flag and trigger
    /// links are all brought up to date.
    pub fn update_block(&mut self, x: u8, y: u8, z: u8, new: Block) -> bool {

        if !self.jelly.is_empty() {
            self.restore_jelly(true, Instant::now());
        }

        let index = block_index(x, y, z);
        if self.blocks[index] != block::AIR && new != block::AIR {
            return false;
        }

        self.blocks[index] = new;
        self.compress();
        self.update_checksum();
        self.flag |= block::CHF_MODIFIED;
        self.rebuild_links();
        true

    }

    /// True if any jelly block is outstanding.
    #[inline]
    pub fn has_jelly(&self) -> bool {
        !self.jelly.is_empty()
    }

    /// Turn one block into air until the deadline. Air itself cannot turn to
    /// jelly. The raw array is modified but not the compressed stream: jelly
    /// is a transient overlay that clients learn about through the jelly
    /// message, not through chunk downloads.
    pub fn turn_to_jelly(&mut self, x: u8, y: u8, z: u8, deadline: Instant) {
        let index = block_index(x, y, z);
        let original = self.blocks[index];
        if original == block::AIR {
            tracing::warn!("tried to make jelly of air at {:?} {x},{y},{z}", self.pos);
            return;
        }
        self.jelly.push(JellyBlock { deadline, original, x, y, z });
        self.blocks[index] = block::AIR;
    }

    /// Revert jelly blocks whose deadline has passed, or all of them when
    /// `unconditionally` is set. The list is ordered oldest first and the
    /// scan stops at the first entry still in the future.
    pub fn restore_jelly(&mut self, unconditionally: bool, now: Instant) {
        let mut remain = 0;
        for (i, jb) in self.jelly.iter().enumerate() {
            if jb.deadline > now && !unconditionally {
                break;
            }
            self.blocks[block_index(jb.x, jb.y, jb.z)] = jb.original;
            remain = i + 1;
        }
        self.jelly.drain(..remain);
    }

    /// Find the messages of the text activator at the given coordinate.
    pub fn find_activator(&self, x: u8, y: u8, z: u8) -> Option<&TextActivator> {
        self.text_activators.iter().find(|a| (a.x, a.y, a.z) == (x, y, z))
    }

    pub fn find_activator_mut(&mut self, x: u8, y: u8, z: u8) -> Option<&mut TextActivator> {
        self.text_activators.iter_mut().find(|a| (a.x, a.y, a.z) == (x, y, z))
    }

    /// Rebuild the trigger wiring from the raw blocks: for every trigger, a
    /// flood fill through link blocks finds the activators it is connected
    /// to, and every `TEXT` block gets a text-activator record. Messages from
    /// the previous records are carried over by coordinate; records with no
    /// matching block are discarded.
    ///
    /// The fill never crosses the chunk boundary: cross-chunk links would
    /// require holding two chunk locks at once.
    pub fn rebuild_links(&mut self) {

        self.trigger_links.clear();
        let old_activators = std::mem::take(&mut self.text_activators);

        let size = CHUNK_SIZE as u8;
        for x in 0..size {
            for y in 0..size {
                for z in 0..size {
                    match self.get(x, y, z) {
                        block::TEXT => {
                            self.text_activators.push(TextActivator {
                                x, y, z,
                                messages: Vec::new(),
                                inhibit_until: None,
                            });
                        }
                        block::TRIGGER | block::DE_TRIGGER => {
                            self.follow_links(x, y, z);
                        }
                        _ => {}
                    }
                }
            }
        }

        // Carry the old messages over onto matching new records.
        for activator in &mut self.text_activators {
            if let Some(old) = old_activators.iter()
                .find(|o| (o.x, o.y, o.z) == (activator.x, activator.y, activator.z))
            {
                activator.messages = old.messages.clone();
            }
        }

    }

    /// Flood fill from one trigger and append a link for every activator
    /// reached. Activators themselves continue the fill, as do links and
    /// other triggers.
    fn follow_links(&mut self, tx: u8, ty: u8, tz: u8) {

        let mut visited = [false; CHUNK_VOL];
        let mut stack: Vec<(u8, u8, u8)> = vec![(tx, ty, tz)];
        visited[block_index(tx, ty, tz)] = true;

        while let Some((x, y, z)) = stack.pop() {
            let neighbors = [
                (x as i32 + 1, y as i32, z as i32),
                (x as i32 - 1, y as i32, z as i32),
                (x as i32, y as i32 + 1, z as i32),
                (x as i32, y as i32 - 1, z as i32),
                (x as i32, y as i32, z as i32 + 1),
                (x as i32, y as i32, z as i32 - 1),
            ];
            for (nx, ny, nz) in neighbors {
                if nx < 0 || ny < 0 || nz < 0 || nx >= CHUNK_SIZE || ny >= CHUNK_SIZE || nz >= CHUNK_SIZE {
                    // Never follow into the next chunk.
                    continue;
                }
                let (nx, ny, nz) = (nx as u8, ny as u8, nz as u8);
                let index = block_index(nx, ny, nz);
                if visited[index] {
                    continue;
                }
                let bl = self.blocks[index];
                if bl == block::SPAWN || bl == block::TEXT {
                    self.trigger_links.push(TriggerLink {
                        trigger: (tx, ty, tz),
                        activator: (nx, ny, nz),
                    });
                } else if bl != block::LINK && bl != block::TRIGGER && bl != block::DE_TRIGGER {
                    // Dead end, not part of the wiring.
                    continue;
                }
                visited[index] = true;
                stack.push((nx, ny, nz));
            }
        }

    }

}

/// RLE-encode a block volume into `(type, run)` pairs, run length capped at
/// 255, walked in fixed `(x, y, z)` order.
pub fn encode_rle(blocks: &[Block]) -> Vec<u8> {
    let mut out = Vec::with_capacity(CHUNK_VOL / 100);
    for &b in blocks {
        match out.last_chunk_mut::<2>() {
            Some([ty, run]) if *ty == b && *run != 255 => *run += 1,
            _ => out.extend_from_slice(&[b, 1]),
        }
    }
    out
}

/// Inverse of [`encode_rle`]. Truncated input yields air for the missing
/// tail, which only happens on corrupt files.
pub fn decode_rle(data: &[u8]) -> Box<[Block; CHUNK_VOL]> {
    let mut blocks = vec![block::AIR; CHUNK_VOL];
    let mut i = 0;
    for pair in data.chunks_exact(2) {
        let (ty, run) = (pair[0], pair[1] as usize);
        let end = (i + run).min(CHUNK_VOL);
        blocks[i..end].fill(ty);
        i = end;
        if i == CHUNK_VOL {
            break;
        }
    }
    blocks.into_boxed_slice().try_into().unwrap()
}

/// Rewrite every pair whose type is invisible to air. Run lengths are left
/// as-is: adjacent air runs are not merged.
pub fn filter_invisible(compressed: &[u8]) -> Vec<u8> {
    let mut out = compressed.to_vec();
    for pair in out.chunks_exact_mut(2) {
        if block::is_invisible(pair[0]) {
            pair[0] = block::AIR;
        }
    }
    out
}

#[cfg(test)]
mod tests {

    use std::time::Duration;
    use super::*;

    fn test_chunk() -> Chunk {
        let mut chunk = Chunk::new_air(IVec3::new(0, 0, 0));
        for x in 0..8u8 {
            for y in 0..8u8 {
                chunk.set_raw(x, y, 0, block::STONE);
                chunk.set_raw(x, y, 1, block::SOIL);
            }
        }
        chunk.set_raw(3, 3, 2, block::TRIGGER);
        chunk.compress();
        chunk.update_checksum();
        chunk
    }

    #[test]
    fn rle_round_trip() {
        let chunk = test_chunk();
        let decoded = decode_rle(chunk.compressed());
        assert_eq!(&decoded[..], &chunk.blocks[..]);
    }

    #[test]
    fn rle_run_cap() {
        // A full air chunk needs ceil(32768/255) pairs, all air.
        let chunk = Chunk::new_air(IVec3::new(1, 2, 3));
        let comp = chunk.compressed();
        assert_eq!(comp.len() % 2, 0);
        assert_eq!(comp.len() / 2, (CHUNK_VOL + 254) / 255);
        assert!(comp.chunks_exact(2).all(|p| p[0] == block::AIR));
    }

    #[test]
    fn checksum_matches_compressed_stream() {
        let chunk = test_chunk();
        let mut crc = flate2::Crc::new();
        crc.update(chunk.compressed());
        assert_eq!(chunk.checksum, crc.sum());
    }

    #[test]
    fn filtered_stream_hides_scripting_blocks() {
        let mut chunk = test_chunk();
        let filtered = filter_invisible(chunk.compressed());
        assert_eq!(filtered.len(), chunk.compressed().len());
        let decoded = decode_rle(&filtered);
        assert_eq!(decoded[super::block_index(3, 3, 2)], block::AIR);
        assert_eq!(decoded[super::block_index(3, 3, 0)], block::STONE);
        // Cached lazy build returns the same bytes.
        assert_eq!(chunk.filtered(), &filtered[..]);
    }

    #[test]
    fn update_block_refuses_solid_over_solid() {
        let mut chunk = test_chunk();
        assert!(!chunk.update_block(0, 0, 0, block::BRICK));
        assert!(chunk.update_block(0, 0, 0, block::AIR));
        assert!(chunk.update_block(0, 0, 0, block::BRICK));
        assert_ne!(chunk.flag & block::CHF_MODIFIED, 0);
    }

    #[test]
    fn trigger_linking_follows_chains() {
        let mut chunk = Chunk::new_air(IVec3::new(0, 0, 0));
        chunk.set_raw(5, 5, 5, block::TRIGGER);
        chunk.set_raw(5, 5, 6, block::TEXT);
        chunk.rebuild_links();
        assert_eq!(chunk.trigger_links.len(), 1);
        assert_eq!(chunk.text_activators.len(), 1);

        // A link chain to a second text block.
        chunk.set_raw(5, 6, 5, block::LINK);
        chunk.set_raw(5, 7, 5, block::LINK);
        chunk.set_raw(5, 8, 5, block::LINK);
        chunk.set_raw(5, 9, 5, block::TEXT);
        chunk.rebuild_links();
        assert_eq!(chunk.trigger_links.len(), 2);
        assert_eq!(chunk.text_activators.len(), 2);

        // A detrigger that reaches both activators through the trigger.
        chunk.set_raw(5, 4, 5, block::DE_TRIGGER);
        chunk.rebuild_links();
        assert_eq!(chunk.trigger_links.len(), 4);
        assert_eq!(chunk.text_activators.len(), 2);
    }

    #[test]
    fn rebuild_is_idempotent_and_keeps_messages() {
        let mut chunk = Chunk::new_air(IVec3::new(0, 0, 0));
        chunk.set_raw(1, 1, 1, block::TRIGGER);
        chunk.set_raw(1, 1, 2, block::TEXT);
        chunk.rebuild_links();
        chunk.find_activator_mut(1, 1, 2).unwrap().messages.push("hello".into());

        let before = chunk.trigger_links.clone();
        chunk.rebuild_links();
        assert_eq!(chunk.trigger_links, before);
        assert_eq!(chunk.find_activator(1, 1, 2).unwrap().messages, ["hello"]);
    }

    #[test]
    fn links_never_cross_the_chunk_boundary() {
        let mut chunk = Chunk::new_air(IVec3::new(0, 0, 0));
        // A trigger at the face; its fill would escape at x = -1.
        chunk.set_raw(0, 5, 5, block::TRIGGER);
        chunk.set_raw(31, 5, 5, block::TEXT);
        chunk.rebuild_links();
        assert!(chunk.trigger_links.is_empty());
    }

    #[test]
    fn jelly_blocks_revert_on_deadline() {
        let mut chunk = Chunk::new_air(IVec3::new(i32::MAX, 0, 0));
        chunk.set_raw(0, 0, 0, block::STONE);
        chunk.set_raw(0, 0, 1, block::STONE);

        let now = Instant::now();
        chunk.turn_to_jelly(0, 0, 0, now - Duration::from_secs(1));
        chunk.turn_to_jelly(0, 0, 1, now + Duration::from_secs(10));
        assert_eq!(chunk.get(0, 0, 0), block::AIR);
        assert_eq!(chunk.get(0, 0, 1), block::AIR);

        // Partial revert: only the expired one comes back.
        chunk.restore_jelly(false, now);
        assert_eq!(chunk.get(0, 0, 0), block::STONE);
        assert_eq!(chunk.get(0, 0, 1), block::AIR);
        assert!(chunk.has_jelly());

        // Unconditional revert restores everything.
        chunk.restore_jelly(true, now);
        assert_eq!(chunk.get(0, 0, 1), block::STONE);
        assert!(!chunk.has_jelly());
    }

}
