//! Coordinate systems and conversions between them.
//!
//! World positions are continuous `DVec3` where the Z axis points up; chunk
//! coordinates are signed `IVec3` at a granularity of [`CHUNK_SIZE`] blocks
//! per axis. The quadtree and all "who is near whom" queries work on the
//! horizontal `(x, y)` plane.

use glam::{DVec3, IVec3};

/// Number of blocks along each chunk axis.
pub const CHUNK_SIZE: i32 = 32;
/// Number of blocks in a chunk.
pub const CHUNK_VOL: usize = (CHUNK_SIZE * CHUNK_SIZE * CHUNK_SIZE) as usize;

/// Calculate the chunk coordinate containing the given world position.
#[inline]
pub fn calc_chunk_pos(pos: DVec3) -> IVec3 {
    IVec3 {
        x: (pos.x / CHUNK_SIZE as f64).floor() as i32,
        y: (pos.y / CHUNK_SIZE as f64).floor() as i32,
        z: (pos.z / CHUNK_SIZE as f64).floor() as i32,
    }
}

/// Calculate the in-chunk block offset of a world position, given the chunk
/// coordinate returned by [`calc_chunk_pos`] for it.
#[inline]
pub fn calc_block_offset(pos: DVec3, cc: IVec3) -> (u8, u8, u8) {
    let x = pos.x.floor() as i64 - cc.x as i64 * CHUNK_SIZE as i64;
    let y = pos.y.floor() as i64 - cc.y as i64 * CHUNK_SIZE as i64;
    let z = pos.z.floor() as i64 - cc.z as i64 * CHUNK_SIZE as i64;
    (x as u8, y as u8, z as u8)
}

/// The world position of the low corner of the block at the given in-chunk
/// offset.
#[inline]
pub fn block_world_pos(cc: IVec3, x: u8, y: u8, z: u8) -> DVec3 {
    DVec3 {
        x: cc.x as f64 * CHUNK_SIZE as f64 + x as f64,
        y: cc.y as f64 * CHUNK_SIZE as f64 + y as f64,
        z: cc.z as f64 * CHUNK_SIZE as f64 + z as f64,
    }
}

/// Given only the least significant byte of each chunk axis, reconstruct the
/// full coordinate relative to a reference chunk. Only valid when the target
/// is within 127 chunks of the reference on each axis, which holds for every
/// message that uses the compressed form.
pub fn update_lsb(reference: IVec3, x: u8, y: u8, z: u8) -> IVec3 {
    let mut ret = IVec3 {
        x: (reference.x & !0xFF) | x as i32,
        y: (reference.y & !0xFF) | y as i32,
        z: (reference.z & !0xFF) | z as i32,
    };
    // Wrap around can happen near the byte boundary.
    for i in 0..3 {
        if reference[i] - ret[i] > 127 {
            ret[i] += 0x100;
        }
        if ret[i] - reference[i] > 127 {
            ret[i] -= 0x100;
        }
    }
    ret
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn chunk_pos_rounds_toward_negative() {
        assert_eq!(calc_chunk_pos(DVec3::new(0.5, 31.9, 32.0)), IVec3::new(0, 0, 1));
        assert_eq!(calc_chunk_pos(DVec3::new(-0.5, -32.0, -32.1)), IVec3::new(-1, -1, -2));
    }

    #[test]
    fn block_offset_in_negative_chunks() {
        let pos = DVec3::new(-0.5, -32.0, 63.9);
        let cc = calc_chunk_pos(pos);
        assert_eq!(cc, IVec3::new(-1, -1, 1));
        assert_eq!(calc_block_offset(pos, cc), (31, 0, 31));
    }

    #[test]
    fn lsb_reconstruction() {
        let reference = IVec3::new(3, -2, 510);
        assert_eq!(update_lsb(reference, 3, 254, 254), IVec3::new(3, -2, 510));
        // Wrap forward and backward across the byte boundary.
        assert_eq!(update_lsb(IVec3::new(255, 0, 0), 1, 0, 0), IVec3::new(257, 0, 0));
        assert_eq!(update_lsb(IVec3::new(256, 0, 0), 255, 0, 0), IVec3::new(255, 0, 0));
    }

}
