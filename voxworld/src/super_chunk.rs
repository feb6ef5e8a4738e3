//! The super-chunk store: sparse teleport anchors, at most one per chunk.
//!
//! Anchors are not part of the chunk files. A super chunk aggregates a
//! 10×10×10 cube of chunks into one 4004-byte file: a version counter
//! followed by a `{flag, x, y, z}` record per slot. The file name derives
//! from the chunk coordinate floored to the nearest multiple of ten on each
//! axis.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::RwLock;

use glam::IVec3;
use tracing::warn;

/// Chunks per super-chunk axis. This cannot change once files exist.
pub const SCH_SIZE: i32 = 10;
/// Slots in one super chunk.
const SCH_SLOTS: usize = (SCH_SIZE * SCH_SIZE * SCH_SIZE) as usize;
/// On-disk size: version word plus four bytes per slot.
pub const SCH_FILE_LEN: usize = 4 + SCH_SLOTS * 4;

/// Flag bit: the slot holds a teleport anchor.
const FLAG_TP_DEFINED: u8 = 0x01;

#[derive(Debug, Clone, Copy, Default)]
struct SlotData {
    flag: u8,
    x: u8,
    y: u8,
    z: u8,
}

struct SuperChunk {
    /// Really a change counter, bumped on every mutation; clients use it to
    /// detect stale copies.
    checksum: u32,
    slots: [SlotData; SCH_SLOTS],
}

impl SuperChunk {

    fn new() -> Self {
        Self { checksum: 0, slots: [SlotData::default(); SCH_SLOTS] }
    }

    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() != SCH_FILE_LEN {
            return None;
        }
        let checksum = u32::from_le_bytes(data[..4].try_into().unwrap());
        let mut slots = [SlotData::default(); SCH_SLOTS];
        for (slot, quad) in slots.iter_mut().zip(data[4..].chunks_exact(4)) {
            *slot = SlotData { flag: quad[0], x: quad[1], y: quad[2], z: quad[3] };
        }
        Some(Self { checksum, slots })
    }

    fn write_to(&self, write: &mut impl Write) -> io::Result<()> {
        write.write_all(&self.checksum.to_le_bytes())?;
        for slot in &self.slots {
            write.write_all(&[slot.flag, slot.x, slot.y, slot.z])?;
        }
        Ok(())
    }

    #[inline]
    fn slot_index(base: IVec3, cc: IVec3) -> usize {
        let d = cc - base;
        (d.x * SCH_SIZE * SCH_SIZE + d.y * SCH_SIZE + d.z) as usize
    }

}

/// Round down to the nearest multiple of [`SCH_SIZE`].
#[inline]
fn trunc(a: i32) -> i32 {
    a.div_euclid(SCH_SIZE) * SCH_SIZE
}

/// The base coordinate of the super chunk containing `cc`.
#[inline]
pub fn base_of(cc: IVec3) -> IVec3 {
    IVec3::new(trunc(cc.x), trunc(cc.y), trunc(cc.z))
}

/// Manager for all loaded super chunks.
pub struct SuperChunkStore {
    folder: PathBuf,
    loaded: RwLock<HashMap<IVec3, SuperChunk>>,
}

impl SuperChunkStore {

    /// Open the store, creating its folder when missing.
    pub fn new(folder: impl Into<PathBuf>) -> io::Result<Self> {
        let folder = folder.into();
        fs::create_dir_all(&folder)?;
        Ok(Self { folder, loaded: RwLock::new(HashMap::new()) })
    }

    fn file_name(&self, base: IVec3) -> PathBuf {
        self.folder.join(format!("s{},{},{}", base.x, base.y, base.z))
    }

    /// Run `f` with the super chunk for `cc` loaded, creating an empty one
    /// when there is no file.
    fn with_loaded<R>(&self, base: IVec3, f: impl FnOnce(&SuperChunk) -> R) -> R {

        {
            let loaded = self.loaded.read().expect("poisoned");
            if let Some(sc) = loaded.get(&base) {
                return f(sc);
            }
        }

        let sc = fs::read(self.file_name(base)).ok()
            .and_then(|data| SuperChunk::parse(&data))
            .unwrap_or_else(SuperChunk::new);

        let mut loaded = self.loaded.write().expect("poisoned");
        // Another task may have loaded it while the lock was free.
        let sc = loaded.entry(base).or_insert(sc);
        f(sc)

    }

    fn mutate(&self, base: IVec3, f: impl FnOnce(&mut SuperChunk)) {
        // Make sure it is resident, then mutate under the write lock and
        // rewrite the file with the bumped counter.
        self.with_loaded(base, |_| ());
        let mut loaded = self.loaded.write().expect("poisoned");
        let sc = loaded.entry(base).or_insert_with(SuperChunk::new);
        f(sc);
        sc.checksum = sc.checksum.wrapping_add(1);
        match File::create(self.file_name(base)) {
            Ok(mut file) => {
                if let Err(e) = sc.write_to(&mut file) {
                    warn!("super chunk {base} write failed: {e}");
                }
            }
            Err(e) => warn!("super chunk {base} create failed: {e}"),
        }
    }

    /// The teleport anchor of the chunk, if defined.
    pub fn get_teleport(&self, cc: IVec3) -> Option<(u8, u8, u8)> {
        let base = base_of(cc);
        self.with_loaded(base, |sc| {
            let slot = sc.slots[SuperChunk::slot_index(base, cc)];
            (slot.flag & FLAG_TP_DEFINED != 0).then_some((slot.x, slot.y, slot.z))
        })
    }

    /// Set the teleport anchor of the chunk.
    pub fn set_teleport(&self, cc: IVec3, x: u8, y: u8, z: u8) {
        let base = base_of(cc);
        self.mutate(base, |sc| {
            let slot = &mut sc.slots[SuperChunk::slot_index(base, cc)];
            *slot = SlotData { flag: slot.flag | FLAG_TP_DEFINED, x, y, z };
        });
    }

    /// Remove the teleport anchor of the chunk.
    pub fn remove_teleport(&self, cc: IVec3) {
        let base = base_of(cc);
        self.mutate(base, |sc| {
            sc.slots[SuperChunk::slot_index(base, cc)] = SlotData::default();
        });
    }

    /// True when the client's checksum matches the live one.
    pub fn verify_checksum(&self, cc: IVec3, checksum: u32) -> bool {
        self.with_loaded(base_of(cc), |sc| sc.checksum == checksum)
    }

    /// Serialize the base coordinate LSBs followed by the full super chunk
    /// body, the payload of the `SuperchunkAnswer` message.
    pub fn answer_payload(&self, cc: IVec3) -> Vec<u8> {
        let base = base_of(cc);
        let mut buf = Vec::with_capacity(3 + SCH_FILE_LEN);
        buf.extend_from_slice(&[base.x as u8, base.y as u8, base.z as u8]);
        self.with_loaded(base, |sc| {
            sc.write_to(&mut buf).expect("vec write");
        });
        buf
    }

    /// Number of loaded super chunks.
    pub fn len(&self) -> usize {
        self.loaded.read().expect("poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

}

#[cfg(test)]
mod tests {

    use super::*;

    fn test_store(name: &str) -> SuperChunkStore {
        let dir = std::env::temp_dir().join(format!("voxworld-sch-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        SuperChunkStore::new(dir).unwrap()
    }

    #[test]
    fn trunc_rounds_toward_negative() {
        assert_eq!(trunc(0), 0);
        assert_eq!(trunc(9), 0);
        assert_eq!(trunc(10), 10);
        assert_eq!(trunc(-1), -10);
        assert_eq!(trunc(-10), -10);
        assert_eq!(trunc(-11), -20);
    }

    #[test]
    fn set_get_remove() {
        let store = test_store("set");
        let cc = IVec3::new(13, -4, 27);
        assert_eq!(store.get_teleport(cc), None);
        store.set_teleport(cc, 5, 6, 7);
        assert_eq!(store.get_teleport(cc), Some((5, 6, 7)));
        // A different chunk in the same super chunk is unaffected.
        assert_eq!(store.get_teleport(IVec3::new(14, -4, 27)), None);
        store.remove_teleport(cc);
        assert_eq!(store.get_teleport(cc), None);
    }

    #[test]
    fn mutations_bump_the_checksum_and_persist() {
        let store = test_store("bump");
        let cc = IVec3::new(1, 2, 3);
        assert!(store.verify_checksum(cc, 0));
        store.set_teleport(cc, 1, 1, 1);
        assert!(!store.verify_checksum(cc, 0));
        assert!(store.verify_checksum(cc, 1));

        // A fresh store reads back from the file.
        let store2 = SuperChunkStore::new(store.folder.clone()).unwrap();
        assert_eq!(store2.get_teleport(cc), Some((1, 1, 1)));
        assert!(store2.verify_checksum(cc, 1));
    }

    #[test]
    fn answer_payload_layout() {
        let store = test_store("payload");
        let payload = store.answer_payload(IVec3::new(12, 0, -3));
        assert_eq!(payload.len(), 3 + SCH_FILE_LEN);
        assert_eq!(payload[0], 10); // Base (10, 0, -10) LSBs.
        assert_eq!(payload[1], 0);
        assert_eq!(payload[2], (-10i32 & 0xFF) as u8);
    }

}
