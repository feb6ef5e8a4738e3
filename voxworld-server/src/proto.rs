//! The client protocol definition.
//!
//! Frames are `len_lo, len_hi, cmd, payload…` with all integers little
//! endian. Command numbers can never change, that would break deployed
//! clients.

use std::io::{self, Cursor, Read, Write};

use glam::IVec3;

use voxworld::io::{compose_frame, Frame, ReadWireExt, WriteWireExt};
use voxworld::item::ObjectCode;

pub const CMD_LOGIN: u8 = 1;
pub const CMD_SAVE: u8 = 2;
pub const CMD_QUIT: u8 = 3;
pub const CMD_MESSAGE: u8 = 4;
pub const CMD_GET_COORDINATE: u8 = 5;
pub const CMD_REPORT_COORDINATE: u8 = 6;
pub const CMD_READ_CHUNK: u8 = 7;
pub const CMD_CHUNK_ANSWER: u8 = 8;
pub const CMD_LOGIN_ACK: u8 = 9;
pub const CMD_START_FWD: u8 = 10;
pub const CMD_STOP_FWD: u8 = 11;
pub const CMD_START_BWD: u8 = 12;
pub const CMD_STOP_BWD: u8 = 13;
pub const CMD_START_LFT: u8 = 14;
pub const CMD_STOP_LFT: u8 = 15;
pub const CMD_START_RGT: u8 = 16;
pub const CMD_STOP_RGT: u8 = 17;
pub const CMD_JUMP: u8 = 18;
pub const CMD_SET_DIR: u8 = 19;
pub const CMD_OBJECT_LIST: u8 = 20;
pub const CMD_HIT_BLOCK: u8 = 21;
pub const CMD_BLOCK_UPDATE: u8 = 22;
pub const CMD_REQ_PASSWORD: u8 = 24;
pub const CMD_RESP_PASSWORD: u8 = 25;
pub const CMD_PROT_VERSION: u8 = 26;
/// Request and answer share the number; the direction disambiguates.
pub const CMD_VRFY_SUPERCHUNK_CS: u8 = 29;
pub const CMD_SUPERCHUNK_ANSWER: u8 = 29;
pub const CMD_PLAYER_STATS: u8 = 30;
pub const CMD_ATTACK_MONSTER: u8 = 31;
pub const CMD_PLAYER_ACTION: u8 = 32;
pub const CMD_RESP_PLAYER_HIT_BY_MONSTER: u8 = 33;
pub const CMD_RESP_PLAYER_HIT_MONSTER: u8 = 34;
pub const CMD_RESP_AGGRO_FROM_MONSTER: u8 = 35;
pub const CMD_VRFY_CHUNK_CS: u8 = 36;
pub const CMD_USE_ITEM: u8 = 37;
pub const CMD_UPD_INV: u8 = 38;
pub const CMD_EQUIPMENT: u8 = 39;
pub const CMD_JELLY_BLOCKS: u8 = 40;
pub const CMD_PING: u8 = 41;
pub const CMD_DROP_ITEM: u8 = 42;
pub const CMD_LOGIN_FAILED: u8 = 43;
pub const CMD_REQ_PLAYER_INFO: u8 = 44;
pub const CMD_RESP_PLAYER_NAME: u8 = 45;
pub const CMD_TELEPORT: u8 = 46;

/// Object types in the object list.
pub const OBJ_TYPE_PLAYER: u8 = 0;
pub const OBJ_TYPE_MONSTER: u8 = 1;

/// Object states in the object list.
pub const OBJ_STATE_REMOVE: u8 = 0;
pub const OBJ_STATE_IN_GAME: u8 = 1;

/// Fixed point resolution of coordinates on the wire.
pub const BLOCK_COORD_RES: f64 = 100.0;

/// Actions of the generic player action command.
pub const USER_ACTION_HEAL: u8 = 0;
pub const USER_ACTION_COMB_ATTACK: u8 = 1;

// Player status flags, sent with the stats message.
pub const USER_FLAG_IN_FIGHT: u32 = 1 << 0;
pub const USER_FLAG_HEALED: u32 = 1 << 3;
pub const USER_FLAG_JUMP: u32 = 1 << 4;
/// All flags that clear once the client has been told.
pub const USER_FLAG_TRANSIENT_MASK: u32 = USER_FLAG_HEALED | USER_FLAG_JUMP;

/// A packet received from a client.
#[derive(Debug, Clone)]
pub enum InPacket {
    /// Start a login with the account email.
    Login(String),
    /// Save the player now.
    Save,
    /// Leave the game.
    Quit,
    /// A chat line; a leading `/` makes it a command.
    Message(String),
    /// Ask for the current coordinate.
    GetCoordinate,
    /// Download one chunk.
    ReadChunk(IVec3),
    /// Movement intent changes.
    StartFwd,
    StopFwd,
    StartBwd,
    StopBwd,
    StartLft,
    StopLft,
    StartRgt,
    StopRgt,
    Jump,
    /// New looking direction, radians scaled by 100 on the wire.
    SetDir { hor: f32, vert: f32 },
    /// Remove the block, turning it to air.
    HitBlock { cc: IVec3, dx: u8, dy: u8, dz: u8 },
    /// Attach a block.
    BlockUpdate { cc: IVec3, dx: u8, dy: u8, dz: u8, block: u8 },
    /// The RC4 encrypted salted password.
    RespPassword(Vec<u8>),
    /// Checksums to verify, one answer per mismatch.
    VerifySuperchunkCs(Vec<ChecksumEntry>),
    VerifyChunkCs(Vec<ChecksumEntry>),
    /// Start attacking a monster.
    AttackMonster(u32),
    /// A generic action, see `USER_ACTION_*`.
    PlayerAction(u8),
    /// Use an inventory item.
    UseItem { code: ObjectCode, level: u32 },
    /// Drop an inventory item for experience.
    DropItem { code: ObjectCode, level: u32 },
    /// Ping request (0) or reply (1).
    Ping(u8),
    /// Ask for the name and equipment of a player.
    ReqPlayerInfo(u32),
    /// Use the teleport of the addressed chunk.
    Teleport { x: u8, y: u8, z: u8 },
}

/// One entry of a checksum verification request.
#[derive(Debug, Clone, Copy)]
pub struct ChecksumEntry {
    pub x: u8,
    pub y: u8,
    pub z: u8,
    pub checksum: u32,
}

impl InPacket {

    /// Decode a frame. Unknown commands and short payloads are errors, and
    /// errors terminate the session.
    pub fn decode(frame: &Frame) -> io::Result<Self> {

        let mut read = Cursor::new(&frame.payload[..]);

        Ok(match frame.cmd {
            CMD_LOGIN => InPacket::Login(read.read_wire_string()?),
            CMD_SAVE => InPacket::Save,
            CMD_QUIT => InPacket::Quit,
            CMD_MESSAGE => InPacket::Message(read.read_wire_string()?),
            CMD_GET_COORDINATE => InPacket::GetCoordinate,
            CMD_READ_CHUNK => InPacket::ReadChunk(read_chunk_coord(&mut read)?),
            CMD_START_FWD => InPacket::StartFwd,
            CMD_STOP_FWD => InPacket::StopFwd,
            CMD_START_BWD => InPacket::StartBwd,
            CMD_STOP_BWD => InPacket::StopBwd,
            CMD_START_LFT => InPacket::StartLft,
            CMD_STOP_LFT => InPacket::StopLft,
            CMD_START_RGT => InPacket::StartRgt,
            CMD_STOP_RGT => InPacket::StopRgt,
            CMD_JUMP => InPacket::Jump,
            CMD_SET_DIR => {
                let hor = read.read_wire_u16()? as f32 / 100.0;
                let vert = read.read_wire_u16()? as i16 as f32 / 100.0;
                InPacket::SetDir { hor, vert }
            }
            CMD_HIT_BLOCK => {
                let cc = read_chunk_coord(&mut read)?;
                let (dx, dy, dz) = (read.read_wire_u8()?, read.read_wire_u8()?, read.read_wire_u8()?);
                InPacket::HitBlock { cc, dx, dy, dz }
            }
            CMD_BLOCK_UPDATE => {
                let cc = read_chunk_coord(&mut read)?;
                let (dx, dy, dz) = (read.read_wire_u8()?, read.read_wire_u8()?, read.read_wire_u8()?);
                let block = read.read_wire_u8()?;
                InPacket::BlockUpdate { cc, dx, dy, dz, block }
            }
            CMD_RESP_PASSWORD => InPacket::RespPassword(frame.payload.clone()),
            CMD_VRFY_SUPERCHUNK_CS => InPacket::VerifySuperchunkCs(read_checksum_list(&frame.payload)?),
            CMD_VRFY_CHUNK_CS => InPacket::VerifyChunkCs(read_checksum_list(&frame.payload)?),
            CMD_ATTACK_MONSTER => InPacket::AttackMonster(read.read_wire_u32()?),
            CMD_PLAYER_ACTION => InPacket::PlayerAction(read.read_wire_u8()?),
            CMD_USE_ITEM => {
                let code = ObjectCode(read.read_wire_code()?);
                // Old clients do not send the level.
                let level = read.read_wire_u32().unwrap_or(0);
                InPacket::UseItem { code, level }
            }
            CMD_DROP_ITEM => {
                let code = ObjectCode(read.read_wire_code()?);
                let level = read.read_wire_u32()?;
                InPacket::DropItem { code, level }
            }
            CMD_PING => InPacket::Ping(read.read_wire_u8()?),
            CMD_REQ_PLAYER_INFO => InPacket::ReqPlayerInfo(read.read_wire_u32()?),
            CMD_TELEPORT => {
                let (x, y, z) = (read.read_wire_u8()?, read.read_wire_u8()?, read.read_wire_u8()?);
                InPacket::Teleport { x, y, z }
            }
            id => return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown command {id}"),
            )),
        })

    }

}

fn read_chunk_coord(read: &mut impl Read) -> io::Result<IVec3> {
    Ok(IVec3 {
        x: read.read_wire_i32()?,
        y: read.read_wire_i32()?,
        z: read.read_wire_i32()?,
    })
}

fn read_checksum_list(payload: &[u8]) -> io::Result<Vec<ChecksumEntry>> {
    if payload.is_empty() || payload.len() % 7 != 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad checksum list length"));
    }
    Ok(payload.chunks_exact(7)
        .map(|e| ChecksumEntry {
            x: e[0],
            y: e[1],
            z: e[2],
            checksum: u32::from_le_bytes([e[3], e[4], e[5], e[6]]),
        })
        .collect())
}

/// One entry of the object list message.
#[derive(Debug, Clone, Copy)]
pub struct ObjectEntry {
    pub id: u32,
    pub state: u8,
    pub kind: u8,
    pub hp: u8,
    pub level: u32,
    /// Offsets from the receiving player, blocks scaled by the fixed point
    /// resolution.
    pub dx: i16,
    pub dy: i16,
    pub dz: i16,
    /// Looking direction mapped onto 0..=255 around the circle.
    pub dir: u8,
}

/// A packet sent to a client.
#[derive(Debug, Clone)]
pub enum OutPacket {
    /// Plain text shown in the client's message area.
    Message(String),
    /// The player's own position, fixed point.
    ReportCoordinate { x: i64, y: i64, z: i64 },
    /// One chunk download.
    ChunkAnswer {
        flag: u32,
        checksum: u32,
        owner: u32,
        cc: IVec3,
        compressed: Vec<u8>,
    },
    /// Login accepted.
    LoginAck { uid: u32, dir_hor: u16, dir_vert: u16, admin: u8 },
    /// Login refused; the reason is never disclosed.
    LoginFailed,
    /// Positions and stats of near objects.
    ObjectList(Vec<ObjectEntry>),
    /// The challenge for the password exchange.
    ReqPassword(Vec<u8>),
    /// Protocol and expected client version.
    ProtVersion { minor: u16, major: u16, client_minor: u16, client_major: u16 },
    /// The super chunk body for a mismatched checksum.
    SuperchunkAnswer(Vec<u8>),
    /// Stats of the receiving player.
    PlayerStats { hp: u8, exp: u8, level: u32, flags: u32, mana: u8 },
    /// One block changed.
    BlockUpdate { cc: IVec3, dx: u8, dy: u8, dz: u8, block: u8 },
    /// Damage taken from a monster.
    HitByMonster { monster: u32, damage: u8 },
    /// Damage dealt to a monster.
    HitMonster { monster: u32, damage: u8 },
    /// A monster started hunting the player.
    AggroFromMonster { monster: u32 },
    /// One inventory stack, count saturating at 255.
    UpdateInventory { code: ObjectCode, count: u8, level: u32 },
    /// The three equipment slots of a player.
    Equipment {
        uid: u32,
        weapon: (ObjectCode, u32),
        armor: (ObjectCode, u32),
        helmet: (ObjectCode, u32),
    },
    /// A block temporarily turned passable.
    JellyBlocks { timeout: u8, cc: IVec3, dx: u8, dy: u8, dz: u8 },
    /// Ping reply.
    Ping(u8),
    /// Name and admin level of a player.
    PlayerName { uid: u32, admin: u8, name: String },
}

impl OutPacket {

    /// Encode into a complete frame.
    pub fn to_frame(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        let cmd = self.write_payload(&mut payload).expect("vec write");
        compose_frame(cmd, &payload)
    }

    fn write_payload(&self, write: &mut impl Write) -> io::Result<u8> {
        Ok(match *self {
            OutPacket::Message(ref text) => {
                write.write_all(text.as_bytes())?;
                CMD_MESSAGE
            }
            OutPacket::ReportCoordinate { x, y, z } => {
                write.write_wire_i64(x)?;
                write.write_wire_i64(y)?;
                write.write_wire_i64(z)?;
                CMD_REPORT_COORDINATE
            }
            OutPacket::ChunkAnswer { flag, checksum, owner, cc, ref compressed } => {
                write.write_wire_u32(flag)?;
                write.write_wire_u32(checksum)?;
                write.write_wire_u32(owner)?;
                write.write_wire_i32(cc.x)?;
                write.write_wire_i32(cc.y)?;
                write.write_wire_i32(cc.z)?;
                write.write_all(compressed)?;
                CMD_CHUNK_ANSWER
            }
            OutPacket::LoginAck { uid, dir_hor, dir_vert, admin } => {
                write.write_wire_u32(uid)?;
                write.write_wire_u16(dir_hor)?;
                write.write_wire_u16(dir_vert)?;
                write.write_wire_u8(admin)?;
                CMD_LOGIN_ACK
            }
            OutPacket::LoginFailed => CMD_LOGIN_FAILED,
            OutPacket::ObjectList(ref entries) => {
                for e in entries {
                    write.write_wire_u32(e.id)?;
                    write.write_wire_u8(e.state)?;
                    write.write_wire_u8(e.kind)?;
                    write.write_wire_u8(e.hp)?;
                    write.write_wire_u32(e.level)?;
                    write.write_wire_i16(e.dx)?;
                    write.write_wire_i16(e.dy)?;
                    write.write_wire_i16(e.dz)?;
                    write.write_wire_u8(e.dir)?;
                }
                CMD_OBJECT_LIST
            }
            OutPacket::ReqPassword(ref challenge) => {
                write.write_all(challenge)?;
                CMD_REQ_PASSWORD
            }
            OutPacket::ProtVersion { minor, major, client_minor, client_major } => {
                write.write_wire_u16(minor)?;
                write.write_wire_u16(major)?;
                write.write_wire_u16(client_minor)?;
                write.write_wire_u16(client_major)?;
                CMD_PROT_VERSION
            }
            OutPacket::SuperchunkAnswer(ref body) => {
                write.write_all(body)?;
                CMD_SUPERCHUNK_ANSWER
            }
            OutPacket::PlayerStats { hp, exp, level, flags, mana } => {
                write.write_wire_u8(hp)?;
                write.write_wire_u8(exp)?;
                write.write_wire_u32(level)?;
                write.write_wire_u32(flags)?;
                write.write_wire_u8(mana)?;
                CMD_PLAYER_STATS
            }
            OutPacket::BlockUpdate { cc, dx, dy, dz, block } => {
                write.write_wire_i32(cc.x)?;
                write.write_wire_i32(cc.y)?;
                write.write_wire_i32(cc.z)?;
                write.write_all(&[dx, dy, dz, block])?;
                CMD_BLOCK_UPDATE
            }
            OutPacket::HitByMonster { monster, damage } => {
                write.write_wire_u32(monster)?;
                write.write_wire_u8(damage)?;
                CMD_RESP_PLAYER_HIT_BY_MONSTER
            }
            OutPacket::HitMonster { monster, damage } => {
                write.write_wire_u32(monster)?;
                write.write_wire_u8(damage)?;
                CMD_RESP_PLAYER_HIT_MONSTER
            }
            OutPacket::AggroFromMonster { monster } => {
                write.write_wire_u32(monster)?;
                CMD_RESP_AGGRO_FROM_MONSTER
            }
            OutPacket::UpdateInventory { code, count, level } => {
                write.write_all(&code.0)?;
                write.write_wire_u8(count)?;
                write.write_wire_u32(level)?;
                CMD_UPD_INV
            }
            OutPacket::Equipment { uid, weapon, armor, helmet } => {
                write.write_wire_u32(uid)?;
                for (slot, (code, level)) in [weapon, armor, helmet].into_iter().enumerate() {
                    write.write_wire_u8(slot as u8)?;
                    write.write_all(&code.0)?;
                    write.write_wire_u32(level)?;
                }
                CMD_EQUIPMENT
            }
            OutPacket::JellyBlocks { timeout, cc, dx, dy, dz } => {
                write.write_wire_u8(0)?; // Flag.
                write.write_wire_u8(timeout)?;
                write.write_all(&[cc.x as u8, cc.y as u8, cc.z as u8])?;
                write.write_all(&[dx, dy, dz])?;
                CMD_JELLY_BLOCKS
            }
            OutPacket::Ping(kind) => {
                write.write_wire_u8(kind)?;
                CMD_PING
            }
            OutPacket::PlayerName { uid, admin, ref name } => {
                write.write_wire_u32(uid)?;
                write.write_wire_u8(admin)?;
                write.write_all(name.as_bytes())?;
                CMD_RESP_PLAYER_NAME
            }
        })
    }

}

#[cfg(test)]
mod tests {

    use voxworld::io::{read_frame, FRAME_INITIAL_CAP};
    use super::*;

    fn decode(frame: &[u8]) -> Frame {
        let mut cap = FRAME_INITIAL_CAP;
        read_frame(&mut Cursor::new(frame), &mut cap).unwrap()
    }

    #[test]
    fn login_ack_layout() {
        let frame = OutPacket::LoginAck { uid: 7, dir_hor: 314, dir_vert: 62, admin: 9 }.to_frame();
        assert_eq!(frame.len(), 12);
        assert_eq!(frame[2], CMD_LOGIN_ACK);
        assert_eq!(&frame[3..7], &7u32.to_le_bytes());
        assert_eq!(frame[11], 9);
    }

    #[test]
    fn object_list_entries_are_18_bytes() {
        let entry = ObjectEntry {
            id: 1, state: OBJ_STATE_IN_GAME, kind: OBJ_TYPE_MONSTER,
            hp: 255, level: 3, dx: -100, dy: 100, dz: 0, dir: 128,
        };
        let frame = OutPacket::ObjectList(vec![entry, entry]).to_frame();
        assert_eq!(frame.len(), 3 + 2 * 18);
    }

    #[test]
    fn in_packet_round_trip() {
        let frame = decode(&compose_frame(CMD_LOGIN, b"someone@example.com"));
        match InPacket::decode(&frame).unwrap() {
            InPacket::Login(mail) => assert_eq!(mail, "someone@example.com"),
            other => panic!("unexpected {other:?}"),
        }

        let mut payload = Vec::new();
        payload.extend_from_slice(&3i32.to_le_bytes());
        payload.extend_from_slice(&(-2i32).to_le_bytes());
        payload.extend_from_slice(&7i32.to_le_bytes());
        let frame = decode(&compose_frame(CMD_READ_CHUNK, &payload));
        match InPacket::decode(&frame).unwrap() {
            InPacket::ReadChunk(cc) => assert_eq!(cc, IVec3::new(3, -2, 7)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn set_dir_scales_by_100(){
        let mut payload = Vec::new();
        payload.extend_from_slice(&314u16.to_le_bytes());
        payload.extend_from_slice(&(-62i16 as u16).to_le_bytes());
        let frame = decode(&compose_frame(CMD_SET_DIR, &payload));
        match InPacket::decode(&frame).unwrap() {
            InPacket::SetDir { hor, vert } => {
                assert!((hor - 3.14).abs() < 1e-6);
                assert!((vert + 0.62).abs() < 1e-6);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_commands_are_errors() {
        let frame = decode(&compose_frame(200, &[]));
        assert!(InPacket::decode(&frame).is_err());
    }

    #[test]
    fn checksum_lists_must_be_multiples_of_seven() {
        let frame = decode(&compose_frame(CMD_VRFY_CHUNK_CS, &[1, 2, 3]));
        assert!(InPacket::decode(&frame).is_err());
        let mut payload = vec![1, 2, 3];
        payload.extend_from_slice(&0xDEADBEEFu32.to_le_bytes());
        let frame = decode(&compose_frame(CMD_VRFY_CHUNK_CS, &payload));
        match InPacket::decode(&frame).unwrap() {
            InPacket::VerifyChunkCs(list) => {
                assert_eq!(list.len(), 1);
                assert_eq!(list[0].checksum, 0xDEADBEEF);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

}
