//! File-backed chunk persistence.
//!
//! One file per chunk at `<chunk_folder>/x,y,z`, laid out as a 24-byte
//! header (flag, checksum, owner, three reserved words) followed by typed
//! partitions `{kind u16, length u16, bytes}`. Unknown partition kinds are
//! skipped by length so older servers can read newer files; an absent
//! partition means empty. A file that cannot be fully parsed is treated as
//! missing, the caller falls back to regeneration.

use std::fs::{self, File};
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};

use glam::IVec3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chunk::{Chunk, TextActivator};
use crate::io::{ReadWireExt, WriteWireExt};

/// Partition kind for the RLE compressed block volume.
pub const PART_COMP_CHUNK: u16 = 0;
/// Partition kind for the serialized text activators.
pub const PART_TEXT_ACTIVATORS: u16 = 1;

/// Size of the fixed chunk file header.
const HEADER_LEN: usize = 24;

/// Error reading or writing a chunk file.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("truncated chunk file")]
    Truncated,
    #[error("bad partition length {length} with {remaining} bytes remaining")]
    BadPartition { length: usize, remaining: usize },
    #[error("bad text activator partition: {0}")]
    BadActivators(#[from] serde_json::Error),
}

/// Serialized form of a text activator; inhibit deadlines are not persisted.
#[derive(Serialize, Deserialize)]
struct TextActivatorDoc {
    x: u8,
    y: u8,
    z: u8,
    messages: Vec<String>,
}

/// A directory of chunk files.
#[derive(Debug, Clone)]
pub struct ChunkDir {
    path: PathBuf,
}

impl ChunkDir {

    /// Open the chunk folder, creating it when missing.
    pub fn new(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    /// The file path for a chunk coordinate.
    pub fn chunk_file(&self, pos: IVec3) -> PathBuf {
        self.path.join(format!("{},{},{}", pos.x, pos.y, pos.z))
    }

    /// Read the chunk at the given coordinate. `Ok(None)` when no file
    /// exists; parse failures are errors so the caller can log the cause
    /// before regenerating.
    pub fn read_chunk(&self, pos: IVec3) -> Result<Option<Chunk>, StorageError> {
        let data = match fs::read(self.chunk_file(pos)) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        read_chunk_from(&data, pos).map(Some)
    }

    /// Write the chunk to its file. The chunk's compressed stream must be
    /// current.
    pub fn write_chunk(&self, chunk: &Chunk) -> Result<(), StorageError> {
        let mut file = File::create(self.chunk_file(chunk.pos))?;
        write_chunk_to(&mut file, chunk)?;
        Ok(())
    }

    /// Remove a chunk file, used by offline maintenance tools.
    pub fn remove_chunk(&self, pos: IVec3) -> io::Result<()> {
        match fs::remove_file(self.chunk_file(pos)) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

}

/// Serialize a chunk into the writer.
pub fn write_chunk_to(write: &mut impl Write, chunk: &Chunk) -> Result<(), StorageError> {

    write.write_wire_u32(chunk.flag)?;
    write.write_wire_u32(chunk.checksum)?;
    write.write_wire_u32(chunk.owner)?;
    for _ in 0..3 {
        write.write_wire_u32(0)?; // Reserved.
    }

    write_partition(write, PART_COMP_CHUNK, chunk.compressed())?;

    if !chunk.text_activators.is_empty() {
        let docs: Vec<TextActivatorDoc> = chunk.text_activators.iter()
            .map(|a| TextActivatorDoc {
                x: a.x,
                y: a.y,
                z: a.z,
                messages: a.messages.clone(),
            })
            .collect();
        let data = serde_json::to_vec(&docs)?;
        write_partition(write, PART_TEXT_ACTIVATORS, &data)?;
    }

    Ok(())

}

fn write_partition(write: &mut impl Write, kind: u16, data: &[u8]) -> Result<(), StorageError> {
    debug_assert!(data.len() <= u16::MAX as usize);
    write.write_wire_u16(kind)?;
    write.write_wire_u16(data.len() as u16)?;
    write.write_all(data)?;
    Ok(())
}

/// Parse a chunk from its file bytes. The trigger links are rebuilt after the
/// blocks and activator messages are restored.
pub fn read_chunk_from(data: &[u8], pos: IVec3) -> Result<Chunk, StorageError> {

    if data.len() < HEADER_LEN {
        return Err(StorageError::Truncated);
    }

    let mut cursor = Cursor::new(data);
    let flag = cursor.read_wire_u32()?;
    let checksum = cursor.read_wire_u32()?;
    let owner = cursor.read_wire_u32()?;
    for _ in 0..3 {
        cursor.read_wire_u32()?; // Reserved.
    }

    let mut compressed = Vec::new();
    let mut activators: Vec<TextActivator> = Vec::new();

    let mut remaining = &data[HEADER_LEN..];
    while !remaining.is_empty() {
        if remaining.len() < 4 {
            return Err(StorageError::Truncated);
        }
        let kind = u16::from_le_bytes([remaining[0], remaining[1]]);
        let length = u16::from_le_bytes([remaining[2], remaining[3]]) as usize;
        remaining = &remaining[4..];
        if length > remaining.len() {
            return Err(StorageError::BadPartition { length, remaining: remaining.len() });
        }
        let body = &remaining[..length];
        match kind {
            PART_COMP_CHUNK => compressed = body.to_vec(),
            PART_TEXT_ACTIVATORS => {
                let docs: Vec<TextActivatorDoc> = serde_json::from_slice(body)?;
                activators = docs.into_iter()
                    .map(|d| TextActivator {
                        x: d.x,
                        y: d.y,
                        z: d.z,
                        messages: d.messages,
                        inhibit_until: None,
                    })
                    .collect();
            }
            _ => {} // Unknown partitions skip by length.
        }
        remaining = &remaining[length..];
    }

    let mut chunk = Chunk::from_compressed(pos, compressed);
    chunk.flag = flag;
    chunk.checksum = checksum;
    chunk.owner = owner;
    chunk.rebuild_links();

    // The rebuild derived fresh empty activator records; overlay the saved
    // messages by coordinate.
    for saved in activators {
        if let Some(rec) = chunk.find_activator_mut(saved.x, saved.y, saved.z) {
            rec.messages = saved.messages;
        }
    }

    Ok(chunk)

}

/// Consume a reader fully, for callers that stream instead of slicing.
pub fn read_chunk_stream(read: &mut impl Read, pos: IVec3) -> Result<Chunk, StorageError> {
    let mut data = Vec::new();
    read.read_to_end(&mut data)?;
    read_chunk_from(&data, pos)
}

#[cfg(test)]
mod tests {

    use crate::block;
    use crate::gen::TerrainGenerator;
    use super::*;

    #[test]
    fn save_load_round_trip() {

        let gen = TerrainGenerator::new(false);
        let mut chunk = gen.generate(IVec3::new(0, 0, 4));
        chunk.owner = 42;
        chunk.flag |= block::CHF_MODIFIED;

        let mut buf = Vec::new();
        write_chunk_to(&mut buf, &chunk).unwrap();
        let restored = read_chunk_from(&buf, chunk.pos).unwrap();

        assert_eq!(restored.compressed(), chunk.compressed());
        assert_eq!(restored.checksum, chunk.checksum);
        assert_eq!(restored.owner, chunk.owner);
        assert_eq!(restored.flag, chunk.flag);
        assert_eq!(restored.trigger_links.len(), chunk.trigger_links.len());
        for x in 0..32u8 {
            for y in 0..32u8 {
                for z in 0..32u8 {
                    assert_eq!(restored.get(x, y, z), chunk.get(x, y, z));
                }
            }
        }

    }

    #[test]
    fn activator_messages_survive_persistence() {

        let mut chunk = Chunk::new_air(IVec3::new(1, 1, 1));
        chunk.set_raw(5, 5, 5, block::TRIGGER);
        chunk.set_raw(5, 5, 6, block::TEXT);
        chunk.compress();
        chunk.update_checksum();
        chunk.rebuild_links();
        chunk.find_activator_mut(5, 5, 6).unwrap().messages =
            vec!["/level<10".to_string(), "welcome".to_string()];

        let mut buf = Vec::new();
        write_chunk_to(&mut buf, &chunk).unwrap();
        let restored = read_chunk_from(&buf, chunk.pos).unwrap();

        assert_eq!(restored.trigger_links.len(), 1);
        assert_eq!(restored.text_activators.len(), 1);
        assert_eq!(restored.find_activator(5, 5, 6).unwrap().messages, ["/level<10", "welcome"]);

    }

    #[test]
    fn unknown_partitions_are_skipped() {

        let chunk = Chunk::new_air(IVec3::new(0, 0, 0));
        let mut buf = Vec::new();
        write_chunk_to(&mut buf, &chunk).unwrap();

        // Append a partition from the future.
        buf.extend_from_slice(&9u16.to_le_bytes());
        buf.extend_from_slice(&3u16.to_le_bytes());
        buf.extend_from_slice(&[1, 2, 3]);

        let restored = read_chunk_from(&buf, chunk.pos).unwrap();
        assert_eq!(restored.compressed(), chunk.compressed());

    }

    #[test]
    fn truncated_files_are_rejected() {
        let chunk = Chunk::new_air(IVec3::new(0, 0, 0));
        let mut buf = Vec::new();
        write_chunk_to(&mut buf, &chunk).unwrap();
        assert!(read_chunk_from(&buf[..10], chunk.pos).is_err());
        assert!(read_chunk_from(&buf[..buf.len() - 1], chunk.pos).is_err());
    }

    #[test]
    fn missing_file_reads_as_none() {
        let dir = ChunkDir::new(std::env::temp_dir().join("voxworld-test-chunks")).unwrap();
        assert!(dir.read_chunk(IVec3::new(9999, 9999, 9999)).unwrap().is_none());
    }

}
