//! Connected players: the per-session state machine, the socket loop, and
//! the movement physics.
//!
//! Every connection gets one thread running [`SessionRunner::run`]. That
//! thread is the exclusive writer to the socket and the exclusive mutator of
//! the session's control fields; all other threads reach a session through
//! its bounded byte queue (pre-encoded frames) or its typed command queue.
//! Socket reads carry a one-tick deadline, so the loop keeps running physics
//! and queue draining even when the client is silent.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use glam::{DVec3, IVec3};
use rand::Rng;
use tracing::{debug, info, warn};

use voxworld::block::{self, Block};
use voxworld::combat;
use voxworld::entity::PlayerRecord;
use voxworld::geom::{self, CHUNK_SIZE};
use voxworld::item::{self, ObjectCode};
use voxworld::keys::Key;
use voxworld::quadtree::{QtEntry, QtHandle};
use voxworld::util::rc4::{new_challenge, xor_key, Rc4};

use crate::activator;
use crate::commands;
use crate::config::*;
use crate::db::License;
use crate::monster;
use crate::proto::*;
use crate::server::Server;

/// The connection states of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for the login command.
    Login,
    /// Login received, waiting for the password response.
    Password,
    /// The player is in the world.
    In,
    /// The connection is gone; the session thread unwinds.
    Disconnected,
}

/// Work another thread asks a session to do. Applied serially by the session
/// thread, so one player sees events in their arrival order.
#[derive(Debug)]
pub enum SessionCommand {
    /// Include this entity in the next object list report.
    ObjectMoved(QtHandle),
    /// Show a text message.
    Message(String),
    /// A monster landed a melee hit.
    HitByMonster { monster_id: u32, monster_level: u32, weapon_dmg: f32 },
    /// An activator granted a key.
    GrantKey(Key),
    /// An activator granted an item; the cost is charged to the owner of the
    /// chunk the recipient stands in.
    AddItem { code: ObjectCode, level: u32, cost: f64 },
}

/// The lock-protected mutable state of a session.
pub struct PlayerState {
    pub conn: ConnState,
    pub uid: u32,
    pub record: PlayerRecord,
    /// Movement intent flags, set by the client commands.
    pub mv_fwd: bool,
    pub mv_bwd: bool,
    pub mv_lft: bool,
    pub mv_rgt: bool,
    /// When the position was last integrated.
    pub last_move: Instant,
    /// The last position reported to the quadtree and to other players.
    pub prev_coord: DVec3,
    /// Status flags for the stats message, see `USER_FLAG_*`.
    pub flags: u32,
    /// Stats changed; the client needs a fresh stats message.
    pub updated_stats: bool,
    /// Persist the record on the next loop iteration.
    pub force_save: bool,
    /// The monster this player attacks, if any.
    pub aggro: Option<u32>,
    /// The feet block of the previous trigger check, for edge detection.
    pub trap_prev_block: Block,
    /// The login challenge, kept for the password phase.
    pub challenge: Vec<u8>,
    /// The license of the account logging in.
    pub license: Option<License>,
    /// When this login session started, for the online-time counter.
    pub logon_time: Instant,
}

/// One connected client.
pub struct Session {
    pub slot: usize,
    pub state: RwLock<PlayerState>,
    /// Set once when the player enters the world.
    pub qt_entry: OnceLock<Arc<QtEntry>>,
    bytes_tx: Sender<Vec<u8>>,
    bytes_rx: Receiver<Vec<u8>>,
    cmd_tx: Sender<SessionCommand>,
    cmd_rx: Receiver<SessionCommand>,
}

impl Session {

    pub fn new(slot: usize) -> Arc<Self> {
        let (bytes_tx, bytes_rx) = bounded(CLIENT_CHANNEL_SIZE);
        let (cmd_tx, cmd_rx) = bounded(CLIENT_CHANNEL_SIZE);
        Arc::new(Self {
            slot,
            state: RwLock::new(PlayerState {
                conn: ConnState::Login,
                uid: 0,
                record: PlayerRecord::default(),
                mv_fwd: false,
                mv_bwd: false,
                mv_lft: false,
                mv_rgt: false,
                last_move: Instant::now(),
                prev_coord: DVec3::ZERO,
                flags: 0,
                updated_stats: false,
                force_save: false,
                aggro: None,
                trap_prev_block: block::AIR,
                challenge: Vec::new(),
                license: None,
                logon_time: Instant::now(),
            }),
            qt_entry: OnceLock::new(),
            bytes_tx,
            bytes_rx,
            cmd_tx,
            cmd_rx,
        })
    }

    pub fn conn_state(&self) -> ConnState {
        self.state.read().expect("poisoned").conn
    }

    pub fn uid(&self) -> u32 {
        self.state.read().expect("poisoned").uid
    }

    /// Queue a pre-encoded frame; a full queue drops it, losing a message is
    /// better than blocking a foreign thread.
    pub fn send_bytes(&self, frame: Vec<u8>) {
        match self.bytes_tx.try_send(frame) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => debug!("session {}: byte queue full", self.slot),
        }
    }

    pub fn send_packet(&self, packet: &OutPacket) {
        self.send_bytes(packet.to_frame());
    }

    /// Queue a command; same overflow policy as the byte queue.
    pub fn send_command(&self, cmd: SessionCommand) {
        match self.cmd_tx.try_send(cmd) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => debug!("session {}: command queue full", self.slot),
        }
    }

    /// Take one queued command; the session loop drains this, tests inspect
    /// it.
    pub(crate) fn try_recv_command(&self) -> Option<SessionCommand> {
        self.cmd_rx.try_recv().ok()
    }

}

/// How many write timeouts in a row give up on a client.
const WRITE_RETRY_LIMIT: u32 = 5;

/// The state owned by the session thread itself.
pub struct SessionRunner {
    pub(crate) server: Arc<Server>,
    pub(crate) session: Arc<Session>,
    stream: TcpStream,
    /// Current frame length cap, grown on demand.
    cap: usize,
    /// Entities to include in the next object list.
    obj_moved: Vec<QtHandle>,
    last_update: Instant,
    last_full_report: Instant,
    last_attack: Instant,
    /// Only every tenth committed move trickles score, the counter.
    move_score_delay: u16,
}

impl SessionRunner {

    pub fn new(server: Arc<Server>, session: Arc<Session>, stream: TcpStream) -> Self {
        let now = Instant::now();
        Self {
            server,
            session,
            stream,
            cap: voxworld::io::FRAME_INITIAL_CAP,
            obj_moved: Vec::with_capacity(10),
            last_update: now,
            last_full_report: now,
            last_attack: now,
            move_score_delay: 0,
        }
    }

    /// The session main loop; returns when the client is gone.
    pub fn run(mut self) {

        if let Err(e) = self.stream.set_read_timeout(Some(OBJECTS_UPDATE_PERIOD)) {
            warn!("session {}: set_read_timeout: {e}", self.session.slot);
            return;
        }
        let _ = self.stream.set_write_timeout(Some(Duration::from_secs(2)));
        let _ = self.stream.set_nodelay(true);

        self.send_blocking(&OutPacket::ProtVersion {
            minor: PROT_VERSION_MINOR,
            major: PROT_VERSION_MAJOR,
            client_minor: 0,
            client_major: 0,
        }.to_frame());

        while self.server.running() && self.session.conn_state() != ConnState::Disconnected {

            self.periodic_work();

            if !self.drain_queues() {
                break;
            }

            match self.read_frame() {
                Ok(Some(frame)) => {
                    self.server.traffic.add_received(frame.payload.len() + 3);
                    match InPacket::decode(&frame) {
                        Ok(packet) => {
                            if !self.handle_packet(packet) {
                                break;
                            }
                        }
                        Err(e) => {
                            // Protocol errors terminate the session.
                            info!("session {}: {e}", self.session.slot);
                            break;
                        }
                    }
                }
                Ok(None) => {} // No input this tick.
                Err(e) => {
                    debug!("session {}: read: {e}", self.session.slot);
                    break;
                }
            }

        }

        self.save_player();
        self.cleanup();

    }

    /// Tick work between socket reads: physics, visibility, combat, stat and
    /// save flushing.
    fn periodic_work(&mut self) {

        let now = Instant::now();
        let in_world = self.session.conn_state() == ConnState::In;

        if in_world && now.duration_since(self.last_update) > OBJECTS_UPDATE_PERIOD {
            self.last_update = now;
            self.flush_moved_objects();
            self.update_position();
            let full_report = now.duration_since(self.last_full_report) > Duration::from_secs(2);
            if full_report {
                self.last_full_report = now;
            }
            self.report_own_position(full_report);
        }

        if in_world {
            let delta = now.duration_since(self.last_attack);
            if delta > ATTACK_PERIOD {
                self.last_attack = now;
                self.manage_attack_period(delta);
            }
        }

        let (updated_stats, force_save) = {
            let mut state = self.session.state.write().expect("poisoned");
            (
                std::mem::take(&mut state.updated_stats),
                std::mem::take(&mut state.force_save),
            )
        };

        if updated_stats {
            self.send_stats();
        }
        if force_save {
            self.save_player();
        }

    }

    /// Drain the outbound byte queue and the command queue. Returns false
    /// when the session died while draining.
    fn drain_queues(&mut self) -> bool {
        loop {
            if let Ok(frame) = self.session.bytes_rx.try_recv() {
                self.send_blocking(&frame);
            } else if let Ok(cmd) = self.session.cmd_rx.try_recv() {
                self.handle_command(cmd);
            } else {
                return self.session.conn_state() != ConnState::Disconnected;
            }
            if self.session.conn_state() == ConnState::Disconnected {
                self.save_player();
                return false;
            }
        }
    }

    /// Read one frame, honoring the tick deadline: `Ok(None)` means no input
    /// arrived this tick. A partial header keeps the read alive until the
    /// frame completes.
    fn read_frame(&mut self) -> io::Result<Option<voxworld::io::Frame>> {

        fn is_timeout(e: &io::Error) -> bool {
            matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
        }

        let mut head = [0u8; 2];
        let mut filled = 0usize;
        while filled < 2 {
            match self.stream.read(&mut head[filled..]) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => filled += n,
                Err(e) if is_timeout(&e) && filled == 0 => return Ok(None),
                Err(e) if is_timeout(&e) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let length = u16::from_le_bytes(head) as usize;
        if length < 3 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "frame below header size"));
        }
        if length > self.cap {
            self.cap = length;
        }

        let mut body = vec![0u8; length - 2];
        let mut filled = 0usize;
        while filled < body.len() {
            match self.stream.read(&mut body[filled..]) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => filled += n,
                Err(e) if is_timeout(&e) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(Some(voxworld::io::Frame {
            cmd: body[0],
            payload: body[1..].to_vec(),
        }))

    }

    /// Write a frame to the socket, retrying timeouts a bounded number of
    /// times. Exhausted retries disconnect the session.
    pub fn send_blocking(&mut self, frame: &[u8]) {
        let mut remaining = frame;
        let mut retries = 0;
        while !remaining.is_empty() {
            match self.stream.write(remaining) {
                Ok(n) => {
                    self.server.traffic.add_sent(n);
                    remaining = &remaining[n..];
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    retries += 1;
                    if retries >= WRITE_RETRY_LIMIT {
                        self.disconnect();
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(_) => {
                    self.disconnect();
                    return;
                }
            }
        }
    }

    fn send_packet_blocking(&mut self, packet: &OutPacket) {
        self.send_blocking(&packet.to_frame());
    }

    /// Show a message in the client.
    pub fn printf(&mut self, text: impl Into<String>) {
        self.send_packet_blocking(&OutPacket::Message(text.into()));
    }

    fn disconnect(&self) {
        let mut state = self.session.state.write().expect("poisoned");
        if state.conn == ConnState::In {
            state.conn = ConnState::Disconnected;
        }
    }

    // ------------------------------------------------------------------
    // Packet dispatch.

    /// Handle one inbound packet; false terminates the session.
    fn handle_packet(&mut self, packet: InPacket) -> bool {

        let conn = self.session.conn_state();

        // The pre-login states accept only their own commands.
        match (conn, &packet) {
            (_, InPacket::Ping(0)) => {
                self.send_packet_blocking(&OutPacket::Ping(1));
                return true;
            }
            (_, InPacket::Ping(_)) => return true,
            (ConnState::Login, InPacket::Login(mail)) => {
                let mail = mail.clone();
                return self.handle_login(&mail);
            }
            (ConnState::Password, InPacket::RespPassword(encrypted)) => {
                let encrypted = encrypted.clone();
                if !self.handle_password(&encrypted) {
                    self.send_packet_blocking(&OutPacket::LoginFailed);
                    return false;
                }
                self.welcome();
                return true;
            }
            (ConnState::In, _) => {}
            _ => {
                info!("session {}: packet {packet:?} in state {conn:?}", self.session.slot);
                return false;
            }
        }

        match packet {
            InPacket::Save => self.save_player(),
            InPacket::Quit => {
                self.save_player();
                return false;
            }
            InPacket::Message(text) => commands::handle_message(self, &text),
            InPacket::GetCoordinate => self.report_coordinate(),
            InPacket::ReadChunk(cc) => self.read_chunk(cc),
            InPacket::StartFwd => self.player_move(MoveChange::Intent { fwd: Some(true), bwd: Some(false), lft: None, rgt: None }),
            InPacket::StopFwd => self.player_move(MoveChange::Intent { fwd: Some(false), bwd: None, lft: None, rgt: None }),
            InPacket::StartBwd => self.player_move(MoveChange::Intent { fwd: Some(false), bwd: Some(true), lft: None, rgt: None }),
            InPacket::StopBwd => self.player_move(MoveChange::Intent { fwd: None, bwd: Some(false), lft: None, rgt: None }),
            InPacket::StartLft => self.player_move(MoveChange::Intent { fwd: None, bwd: None, lft: Some(true), rgt: Some(false) }),
            InPacket::StopLft => self.player_move(MoveChange::Intent { fwd: None, bwd: None, lft: Some(false), rgt: None }),
            InPacket::StartRgt => self.player_move(MoveChange::Intent { fwd: None, bwd: None, lft: Some(false), rgt: Some(true) }),
            InPacket::StopRgt => self.player_move(MoveChange::Intent { fwd: None, bwd: None, lft: None, rgt: Some(false) }),
            InPacket::Jump => self.player_move(MoveChange::Jump),
            InPacket::SetDir { hor, vert } => {
                let mut state = self.session.state.write().expect("poisoned");
                state.record.dir_hor = hor;
                state.record.dir_vert = vert;
            }
            InPacket::HitBlock { cc, dx, dy, dz } => self.hit_block(cc, dx, dy, dz),
            InPacket::BlockUpdate { cc, dx, dy, dz, block } => self.attach_block(cc, dx, dy, dz, block),
            InPacket::VerifyChunkCs(list) => {
                for entry in list {
                    let reference = geom::calc_chunk_pos(self.state_coord());
                    let cc = geom::update_lsb(reference, entry.x, entry.y, entry.z);
                    let handle = self.server.cache.find(cc);
                    let matches = handle.read().checksum == entry.checksum;
                    if !matches {
                        self.read_chunk(cc);
                    }
                }
            }
            InPacket::VerifySuperchunkCs(list) => {
                for entry in list {
                    let reference = geom::calc_chunk_pos(self.state_coord());
                    let cc = geom::update_lsb(reference, entry.x, entry.y, entry.z);
                    if !self.server.super_chunks.verify_checksum(cc, entry.checksum) {
                        self.superchunk_answer(cc);
                    }
                }
            }
            InPacket::AttackMonster(monster_id) => self.attack_monster(monster_id),
            InPacket::PlayerAction(action) => self.player_action(action),
            InPacket::UseItem { code, level } => self.use_item(code, level),
            InPacket::DropItem { code, level } => self.drop_item(code, level),
            InPacket::ReqPlayerInfo(uid) => self.report_player_info(uid),
            InPacket::Teleport { x, y, z } => self.teleport(x, y, z),
            InPacket::Login(_) | InPacket::RespPassword(_) | InPacket::Ping(_) => {
                // Re-login attempts from inside the world are protocol
                // violations.
                return false;
            }
        }

        true

    }

    // ------------------------------------------------------------------
    // Login.

    /// Handle the login command. Test users skip the password exchange
    /// entirely; everyone else is sent a challenge, even when the account
    /// does not exist, so nothing is learned from the reply.
    fn handle_login(&mut self, mail: &str) -> bool {

        let peer_ip = self.stream.peer_addr().map(|a| a.ip().to_string()).unwrap_or_default();

        if self.server.cfg.allow_test_user
            && PlayerRecord::is_test_player(mail)
            && (self.server.cfg.test_ip_list.is_empty()
                || self.server.cfg.test_ip_list.iter().any(|ip| *ip == peer_ip))
        {
            self.login_test_user(mail);
            return true;
        }

        let license = self.server.store.load_license(mail);
        if license.is_none() {
            debug!("login failed or no license for {mail:?}");
        }

        let mut state = self.session.state.write().expect("poisoned");
        state.license = license;
        state.challenge = new_challenge();
        state.conn = ConnState::Password;
        let challenge = state.challenge.clone();
        drop(state);

        self.send_packet_blocking(&OutPacket::ReqPassword(challenge));
        true

    }

    /// Admit a test player without a password: never persisted, admin level
    /// 9, and a starting position spread over the world by the number in the
    /// name.
    fn login_test_user(&mut self, name: &str) {

        let num: f64 = name[TEST_PLAYER_PREFIX.len()..].parse().unwrap_or(0.0);
        let radius = (num / TEST_PLAYERS_PER_CHUNK).sqrt() * CHUNK_SIZE as f64;
        let angle = rand::thread_rng().gen::<f64>() * std::f64::consts::TAU;
        let x = angle.cos() * radius;
        let y = angle.sin() * radius;
        let z = self.server.cache.find_ground(x, y);

        let uid = block::OWNER_TEST - num as u32;
        {
            let mut state = self.session.state.write().expect("poisoned");
            state.uid = uid;
            state.record = PlayerRecord {
                name: name.to_string(),
                coord: DVec3::new(x, y, z),
                revive_sp: DVec3::new(x, y, z),
                admin_level: 9,
                ..Default::default()
            };
        }

        self.login_ack();

    }

    /// Verify the RC4 encrypted password against the stored salted hash.
    /// The failure reason is never revealed to the client.
    fn handle_password(&mut self, encrypted: &[u8]) -> bool {

        let (license, challenge) = {
            let state = self.session.state.read().expect("poisoned");
            (state.license.clone(), state.challenge.clone())
        };

        let Some(license) = license else {
            debug!("terminate because of no license");
            return false;
        };

        let mut password = encrypted.to_vec();
        Rc4::new(&xor_key(license.license_key.as_bytes(), &challenge)).apply(&mut password);

        if !license.verify_password(&password, &self.server.cfg.password_salt) {
            debug!("terminate because of bad password");
            return false;
        }

        let Some(record) = self.server.store.load_player(license.uid) else {
            warn!("no player document for uid {}", license.uid);
            return false;
        };

        {
            let mut state = self.session.state.write().expect("poisoned");
            state.uid = license.uid;
            state.record = record;
            state.record.inventory.clean_up();
            if state.record.max_chunks == 0 {
                state.record.max_chunks = voxworld::entity::DEFAULT_MAX_CHUNKS;
            }
            if state.record.revive_sp == DVec3::ZERO {
                state.record.revive_sp = state.record.coord;
                state.record.home_sp = state.record.coord;
            }
            state.logon_time = Instant::now();
        }

        // Seed the score table while nothing is locked.
        let territory = self.server.store.load_territory(license.uid);
        let doc = self.server.store.load_score(license.uid);
        self.server.scores.initialize(license.uid, &license.avatar, territory.len(), doc);

        self.login_ack();
        true

    }

    /// The player was accepted: acknowledge, exchange visibility with near
    /// players, enter the quadtree and the indices.
    fn login_ack(&mut self) {

        self.report_all_inventory();

        let (uid, name, coord, dir_hor, dir_vert, admin, listeners) = {
            let mut state = self.session.state.write().expect("poisoned");
            state.prev_coord = state.record.coord;
            (
                state.uid,
                state.record.name.clone(),
                state.record.coord,
                state.record.dir_hor,
                state.record.dir_vert,
                state.record.admin_level,
                state.record.listeners.clone(),
            )
        };

        self.send_packet_blocking(&OutPacket::LoginAck {
            uid,
            dir_hor: (dir_hor * 100.0) as u16,
            dir_vert: (dir_vert * 100.0) as u16,
            admin,
        });

        // Tell everyone near, and learn about them. The player is not in the
        // quadtree yet, so the query cannot find self.
        let near = self.server.near_players(coord.truncate(), NEAR_OBJECTS);
        for other in &near {
            self.report_equipment_to(other, &self.session.clone());
            other.send_command(SessionCommand::ObjectMoved(QtHandle::Player(uid)));
            self.obj_moved.push(QtHandle::Player(other.uid()));
        }
        let session = Arc::clone(&self.session);
        self.report_equipment_to(&session, &session);

        let entry = self.session.qt_entry.get_or_init(|| {
            QtEntry::new(QtHandle::Player(uid), coord.truncate())
        });
        self.server.player_qt.add(entry);

        {
            let mut state = self.session.state.write().expect("poisoned");
            state.conn = ConnState::In;
            state.updated_stats = true;
        }
        self.server.sessions.register_login(&self.session, &name, uid);

        // Tell the friends that are online.
        let mut online = Vec::new();
        for listener in listeners {
            if let Some(other) = self.server.sessions.by_uid(listener) {
                other.send_command(SessionCommand::Message(format!("Logged in: {name}")));
                online.push(other.state.read().expect("poisoned").record.name.clone());
            }
        }
        if !online.is_empty() {
            self.printf(format!("Friends online: {}", online.join(", ")));
        }

        info!("{name} ({uid}) logged in");

    }

    /// Send the welcome file and the current player list after a password
    /// login.
    fn welcome(&mut self) {
        if let Ok(content) = std::fs::read_to_string(&self.server.cfg.welcome_file) {
            let lines: Vec<String> = content.lines()
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect();
            for line in lines {
                self.printf(line);
            }
        }
        let others: Vec<String> = self.server.sessions.in_world().iter()
            .filter(|s| !Arc::ptr_eq(s, &self.session))
            .map(|s| s.state.read().expect("poisoned").record.name.clone())
            .collect();
        if !others.is_empty() {
            self.printf(format!("Current players: {}", others.join(", ")));
        }
    }

    // ------------------------------------------------------------------
    // Reports to the client.

    fn state_coord(&self) -> DVec3 {
        self.session.state.read().expect("poisoned").record.coord
    }

    fn report_coordinate(&mut self) {
        let coord = self.state_coord();
        self.send_packet_blocking(&OutPacket::ReportCoordinate {
            x: (coord.x * BLOCK_COORD_RES) as i64,
            y: (coord.y * BLOCK_COORD_RES) as i64,
            z: (coord.z * BLOCK_COORD_RES) as i64,
        });
    }

    fn send_stats(&mut self) {
        let packet = {
            let mut state = self.session.state.write().expect("poisoned");
            let packet = OutPacket::PlayerStats {
                hp: (state.record.hit_points * 255.0) as u8,
                exp: (state.record.exp * 255.0) as u8,
                level: state.record.level,
                flags: state.flags,
                mana: (state.record.mana * 255.0) as u8,
            };
            state.flags &= !USER_FLAG_TRANSIENT_MASK;
            packet
        };
        self.send_packet_blocking(&packet);
    }

    /// The full inventory, one message.
    fn report_all_inventory(&mut self) {
        let stacks: Vec<(ObjectCode, u8, u32)> = {
            let state = self.session.state.read().expect("poisoned");
            state.record.inventory.iter()
                .map(|s| (s.code, s.count.min(255) as u8, s.level))
                .collect()
        };
        for (code, count, level) in stacks {
            self.send_packet_blocking(&OutPacket::UpdateInventory { code, count, level });
        }
    }

    /// One inventory stack, count zero when it is gone.
    fn report_inventory_item(&mut self, code: ObjectCode, level: u32) {
        let count = {
            let state = self.session.state.read().expect("poisoned");
            state.record.inventory.find(code, level).map_or(0, |s| s.count.min(255) as u8)
        };
        self.send_packet_blocking(&OutPacket::UpdateInventory { code, count, level });
    }

    /// Report the equipment of `of` to `target`: to self synchronously, to
    /// others through their queue.
    fn report_equipment_to(&mut self, target: &Arc<Session>, of: &Arc<Session>) {
        let packet = {
            let state = of.state.read().expect("poisoned");
            OutPacket::Equipment {
                uid: state.uid,
                weapon: (ObjectCode::weapon(state.record.weapon.grade), state.record.weapon.level),
                armor: (ObjectCode::armor(state.record.armor.grade), state.record.armor.level),
                helmet: (ObjectCode::helmet(state.record.helmet.grade), state.record.helmet.level),
            }
        };
        if Arc::ptr_eq(target, &self.session) {
            self.send_packet_blocking(&packet);
        } else {
            target.send_packet(&packet);
        }
    }

    fn report_player_info(&mut self, uid: u32) {
        let Some(other) = self.server.sessions.by_uid(uid) else { return };
        let (name, admin) = {
            let state = other.state.read().expect("poisoned");
            (state.record.name.clone(), state.record.admin_level)
        };
        self.send_packet_blocking(&OutPacket::PlayerName { uid, admin, name });
        self.report_equipment_to(&Arc::clone(&self.session), &other);
    }

    /// Send the accumulated object list. Entries are relative to the
    /// receiver with fixed point offsets, capped per message.
    fn flush_moved_objects(&mut self) {

        if self.obj_moved.is_empty() {
            return;
        }
        let moved = std::mem::take(&mut self.obj_moved);
        let own_coord = self.state_coord();

        // As specified by the protocol, at most 10 entries per message.
        const MAX_PER_MESSAGE: usize = 10;
        let mut entries = Vec::with_capacity(MAX_PER_MESSAGE);

        for handle in moved {
            let info = match handle {
                QtHandle::Player(uid) => {
                    self.server.sessions.by_uid(uid).map(|s| {
                        let state = s.state.read().expect("poisoned");
                        (state.record.coord, state.record.hit_points, state.record.level, state.record.dir_hor)
                    })
                }
                QtHandle::Monster(id) => {
                    self.server.monsters.get(id).map(|m| {
                        let body = m.body.lock().expect("poisoned");
                        (body.coord, body.hit_points, body.level, body.dir_hor)
                    })
                }
            };
            let Some((coord, hp, level, dir)) = info else { continue };
            let delta = coord - own_coord;
            entries.push(ObjectEntry {
                id: handle.id(),
                state: OBJ_STATE_IN_GAME,
                kind: match handle {
                    QtHandle::Player(_) => OBJ_TYPE_PLAYER,
                    QtHandle::Monster(_) => OBJ_TYPE_MONSTER,
                },
                hp: (hp * 255.0) as u8,
                level,
                dx: (delta.x * BLOCK_COORD_RES) as i16,
                dy: (delta.y * BLOCK_COORD_RES) as i16,
                dz: (delta.z * BLOCK_COORD_RES) as i16,
                dir: (dir / std::f32::consts::TAU * 256.0) as u8,
            });
            if entries.len() == MAX_PER_MESSAGE {
                self.send_packet_blocking(&OutPacket::ObjectList(std::mem::take(&mut entries)));
            }
        }

        if !entries.is_empty() {
            self.send_packet_blocking(&OutPacket::ObjectList(entries));
        }

    }

    /// After physics: report to self when moved, and tell the quadtree and
    /// everyone near.
    fn report_own_position(&mut self, force: bool) {

        let (uid, coord, prev) = {
            let state = self.session.state.read().expect("poisoned");
            if state.conn != ConnState::In {
                return;
            }
            (state.uid, state.record.coord, state.prev_coord)
        };

        let moved = coord != prev;
        if moved {
            self.report_coordinate();
        }
        if moved || force {
            if let Some(entry) = self.session.qt_entry.get() {
                self.server.player_qt.move_to(entry, coord.truncate());
            }
            self.session.state.write().expect("poisoned").prev_coord = coord;
            for other in self.server.near_players(coord.truncate(), NEAR_OBJECTS) {
                if !Arc::ptr_eq(&other, &self.session) {
                    other.send_command(SessionCommand::ObjectMoved(QtHandle::Player(uid)));
                }
            }
        }

    }

    // ------------------------------------------------------------------
    // Movement.

    fn player_move(&mut self, change: MoveChange) {

        let (feet, _swimming) = self.update_position();
        let mut checktrigger = false;
        let mut trigger_block = feet;

        match change {
            MoveChange::Intent { fwd, bwd, lft, rgt } => {
                let mut state = self.session.state.write().expect("poisoned");
                if let Some(v) = fwd { state.mv_fwd = v }
                if let Some(v) = bwd { state.mv_bwd = v }
                if let Some(v) = lft { state.mv_lft = v }
                if let Some(v) = rgt { state.mv_rgt = v }
            }
            MoveChange::Jump => {
                let cache = &self.server.cache;
                let mut state = self.session.state.write().expect("poisoned");
                let coord = state.record.coord;
                state.record.climbing = !state.record.flying && near_ladder(cache, coord);
                if state.record.climbing {
                    // One ladder step, when there is headroom.
                    let head = coord + DVec3::new(0.0, 0.0, PLAYER_HEIGHT + 1.0);
                    if block::is_permeable(cache.get_block(head)) {
                        state.record.coord.z += 1.0;
                        checktrigger = true;
                        trigger_block = cache.get_block(state.record.coord);
                    }
                } else if state.record.flying || swimming(cache, coord) {
                    let head1 = coord + DVec3::new(0.0, 0.0, PLAYER_HEIGHT + 1.0);
                    let head2 = head1 + DVec3::Z;
                    if block::is_permeable(cache.get_block(head1)) && block::is_permeable(cache.get_block(head2)) {
                        state.record.coord.z += 2.0;
                    }
                    checktrigger = true;
                    trigger_block = cache.get_block(state.record.coord);
                } else if !block::is_permeable(cache.get_block(coord - DVec3::new(0.0, 0.0, 0.1))) {
                    state.record.z_speed = PLAYER_JUMP_SPEED;
                }
            }
        }

        // Flying outside own territory turns itself off for non-admins.
        if checktrigger {
            let (coord, flying, admin, uid) = {
                let state = self.session.state.read().expect("poisoned");
                (state.record.coord, state.record.flying, state.record.admin_level, state.uid)
            };
            if flying && admin == 0 {
                let owner = self.server.cache.find(geom::calc_chunk_pos(coord)).read().owner;
                if owner != uid {
                    self.session.state.write().expect("poisoned").record.flying = false;
                }
            }
            activator::check_triggers(&self.server, &self.session, trigger_block);
        }

    }

    /// Integrate the player position over the elapsed time. Returns the feet
    /// block after the move (air when nothing moved) and the swimming state;
    /// fires triggers on a successful move.
    fn update_position(&mut self) -> (Block, bool) {
        let session = Arc::clone(&self.session);
        let (moved, feet, swim) = {
            let mut state = session.state.write().expect("poisoned");
            self.update_position_locked(&mut state)
        };
        if moved {
            activator::check_triggers(&self.server, &self.session, feet);
        }
        (feet, swim)
    }

    fn update_position_locked(&mut self, state: &mut PlayerState) -> (bool, Block, bool) {

        if state.conn != ConnState::In {
            return (false, block::AIR, false);
        }

        let cache = &self.server.cache;
        let now = Instant::now();
        let dt = now.duration_since(state.last_move);
        state.last_move = now;

        if state.record.flying || (state.record.climbing && !near_ladder(cache, state.record.coord)) {
            state.record.climbing = false;
        }

        let swim = swimming(cache, state.record.coord);
        let no_gravity = swim || state.record.flying || state.record.climbing;

        let (mut x, mut y, mut z) = (0.0f64, 0.0f64, 0.0f64);
        let mut cv = 1.0f64;

        if !no_gravity {
            let new_speed = cache.update_z_pos(dt, state.record.z_speed, &mut state.record.coord, GRAVITY);
            if state.record.z_speed < -1.0 && new_speed == 0.0 {
                // Landed hard enough for the client to play the thump.
                state.flags |= USER_FLAG_JUMP;
                state.updated_stats = true;
            }
            state.record.z_speed = new_speed;
        } else {
            // No gravity: the vertical look angle steers the climb.
            let (sv, c) = (state.record.dir_vert as f64).sin_cos();
            cv = c;
            if state.mv_fwd {
                z = -sv;
            } else if state.mv_bwd {
                z = sv;
            }
        }

        if state.mv_fwd {
            y = cv;
        }
        if state.mv_bwd {
            y = -cv;
        }
        if state.mv_lft {
            x = -cv;
        }
        if state.mv_rgt {
            x = cv;
        }

        if x == 0.0 && y == 0.0 && z == 0.0 {
            return (false, block::AIR, swim);
        }

        let d = (x * x + y * y + z * z).sqrt();
        let mut dist = dt.as_secs_f64() * voxworld::entity::RUNNING_SPEED as f64;
        if state.record.flying {
            dist *= FLYING_SPEED_FACTOR;
        }
        x *= dist / d;
        y *= dist / d;
        z *= dist / d;

        // Rotate by the heading; north is zero, increasing to the right.
        let (s, c) = (-(state.record.dir_hor as f64)).sin_cos();
        let step = DVec3::new(x * c - y * s, x * s + y * c, z);

        let admin_fly = state.record.admin_level == 10 && state.record.flying;
        let mut new_coord = state.record.coord + step;
        let feet = cache.get_block(new_coord);

        if block::is_permeable(feet) || admin_fly {
            // Feet fit; check every block up to head height.
            let mut probe = new_coord;
            let mut off = 1.0;
            while off < PLAYER_HEIGHT {
                probe.z += 1.0;
                if !block::is_permeable(cache.get_block(probe)) && !admin_fly {
                    return (false, block::AIR, swim);
                }
                off += 1.0;
            }

            if swim && !swimming(cache, new_coord) {
                // Swimming upward out of the water: snap back to surface
                // height so the swimmer stays wet.
                let below = new_coord - DVec3::Z;
                let bl = cache.get_block(below);
                if bl == block::WATER || bl == block::BROWN_WATER {
                    new_coord.z = (new_coord.z + SWIMMING_HEIGHT).floor() - SWIMMING_HEIGHT - 0.1;
                }
            }

            state.record.coord = new_coord;
            self.trickle_move_score(state, dist);
            return (true, feet, swim);
        }

        // An obstacle: allow the move when it is a single block step up.
        let step_up = new_coord + DVec3::Z;
        let feet = cache.get_block(step_up);
        if block::is_permeable(feet) {
            let mut probe = step_up;
            let mut off = 1.0;
            while off < PLAYER_HEIGHT {
                probe.z += 1.0;
                if !block::is_permeable(cache.get_block(probe)) {
                    return (false, block::AIR, swim);
                }
                off += 1.0;
            }
            state.record.coord = step_up;
            return (true, feet, swim);
        }

        (false, block::AIR, swim)

    }

    /// Award movement score to the owner of the ground being walked on, once
    /// every ten commits to keep it cheap.
    fn trickle_move_score(&mut self, state: &PlayerState, dist: f64) {
        const DELAY_FACTOR: u16 = 10;
        self.move_score_delay += 1;
        if self.move_score_delay < DELAY_FACTOR {
            return;
        }
        self.move_score_delay = 0;
        let handle = self.server.cache.find(geom::calc_chunk_pos(state.record.coord));
        let owner = handle.read().owner;
        if owner != state.uid
            && !state.record.dead
            && !block::owner_is_reserved(owner)
            && state.uid < block::OWNER_RESERVED
        {
            self.server.scores.add(owner, SCORE_MOVE_FACT * DELAY_FACTOR as f64 * dist);
        }
    }

    // ------------------------------------------------------------------
    // Combat and items.

    /// Once a second: melee the aggro target when close enough, or recover
    /// health and mana when idle.
    fn manage_attack_period(&mut self, delta: Duration) {

        let (aggro, coord, dead, hp, mana) = {
            let state = self.session.state.read().expect("poisoned");
            (
                state.aggro,
                state.record.coord,
                state.record.dead,
                state.record.hit_points,
                state.record.mana,
            )
        };

        if let Some(monster_id) = aggro {
            let target = self.server.monsters.get(monster_id);
            let mut drop_aggro = dead;
            match target {
                Some(ref m) => {
                    let (mcoord, mdead) = {
                        let body = m.body.lock().expect("poisoned");
                        (body.coord, body.dead || body.hit_points <= 0.0)
                    };
                    let dist2 = coord.distance_squared(mcoord);
                    if dist2 > MONSTER_AGGRO_DISTANCE * MONSTER_AGGRO_DISTANCE {
                        self.printf("Too far away for combat");
                        drop_aggro = true;
                    } else if mdead {
                        drop_aggro = true;
                    } else if dist2 <= MELEE_DIST_LIMIT * MELEE_DIST_LIMIT {
                        monster::hit_monster(&self.server, &self.session, m, 1.0);
                        self.flush_outbound();
                    }
                }
                None => drop_aggro = true,
            }
            if drop_aggro {
                let mut state = self.session.state.write().expect("poisoned");
                state.aggro = None;
                state.flags &= !USER_FLAG_IN_FIGHT;
                state.updated_stats = true;
            }
        } else if !dead && (hp < 1.0 || mana < 1.0) {
            let mut state = self.session.state.write().expect("poisoned");
            let regen = delta.as_secs_f32() / HEALING_PERIOD.as_secs_f32();
            let new_hp = (state.record.hit_points + regen).min(1.0);
            if new_hp > state.record.hit_points {
                state.record.hit_points = new_hp;
                state.updated_stats = true;
            }
            let new_mana = (state.record.mana + regen).min(1.0);
            if new_mana > state.record.mana {
                state.record.mana = new_mana;
                state.updated_stats = true;
            }
        }

    }

    /// Flush the outbound byte queue right away, so combat feedback does not
    /// wait for the next loop iteration.
    fn flush_outbound(&mut self) {
        while let Ok(frame) = self.session.bytes_rx.try_recv() {
            self.send_blocking(&frame);
        }
    }

    fn attack_monster(&mut self, monster_id: u32) {

        let Some(m) = self.server.monsters.get(monster_id) else { return };
        let (coord, dead, uid) = {
            let state = self.session.state.read().expect("poisoned");
            (state.record.coord, state.record.dead, state.uid)
        };
        if dead {
            self.printf("Can't attack when dead");
            return;
        }

        let (level, hp) = {
            let mut body = m.body.lock().expect("poisoned");
            if coord.distance_squared(body.coord) > MONSTER_AGGRO_DISTANCE * MONSTER_AGGRO_DISTANCE {
                drop(body);
                self.printf("Too far away to attack.");
                return;
            }
            if body.aggro.is_none() {
                body.aggro = Some(uid);
                body.speed = voxworld::entity::ASSAULT_FACTOR * body.max_speed;
                body.state = voxworld::entity::MonsterState::Defending;
            }
            (body.level, body.hit_points)
        };

        {
            let mut state = self.session.state.write().expect("poisoned");
            if state.aggro == Some(monster_id) {
                return;
            }
            state.aggro = Some(monster_id);
            state.flags |= USER_FLAG_IN_FIGHT;
            state.updated_stats = true;
        }
        self.printf(format!("You attack a level {} monster, {:.0}% hp", level, hp * 100.0));

    }

    /// The generic actions: the healing spell and the combination attack.
    fn player_action(&mut self, action: u8) {

        let dead = self.session.state.read().expect("poisoned").record.dead;
        if dead {
            self.printf("Unable now");
            return;
        }

        match action {
            USER_ACTION_HEAL => {
                let mut state = self.session.state.write().expect("poisoned");
                if state.record.mana < MANA_FOR_HEALING {
                    drop(state);
                    self.printf("Not enough mana");
                } else if state.record.hit_points >= 1.0 {
                    drop(state);
                    self.printf("Already full health");
                } else {
                    state.record.heal(HEALTH_AT_HEALING_SPELL, MANA_FOR_HEALING);
                    state.flags |= USER_FLAG_HEALED;
                    state.updated_stats = true;
                }
            }
            USER_ACTION_COMB_ATTACK => {
                let aggro = self.session.state.read().expect("poisoned").aggro;
                let Some(monster_id) = aggro else {
                    self.printf("Start attack first");
                    return;
                };
                let enough = {
                    let mut state = self.session.state.write().expect("poisoned");
                    if state.record.mana < MANA_FOR_COMB_ATTACK {
                        false
                    } else {
                        state.record.mana -= MANA_FOR_COMB_ATTACK;
                        state.updated_stats = true;
                        true
                    }
                };
                if !enough {
                    self.printf("Not enough mana");
                    return;
                }
                if let Some(m) = self.server.monsters.get(monster_id) {
                    monster::hit_monster(&self.server, &self.session, &m, WEAPON_DMG_COMB_ATTACK);
                    self.flush_outbound();
                }
            }
            other => debug!("unknown player action {other}"),
        }

    }

    fn use_item(&mut self, code: ObjectCode, level: u32) {
        let outcome = {
            let mut state = self.session.state.write().expect("poisoned");
            let outcome = state.record.use_item(code, level);
            if outcome.consumed {
                state.updated_stats = true;
            }
            outcome
        };
        if !outcome.consumed {
            self.printf("#FAIL");
            return;
        }
        self.report_inventory_item(code, level);
        if outcome.broadcast {
            self.broadcast_equipment();
            self.report_all_inventory();
        }
    }

    fn broadcast_equipment(&mut self) {
        let coord = self.state_coord();
        for other in self.server.near_players(coord.truncate(), NEAR_OBJECTS) {
            self.report_equipment_to(&other, &Arc::clone(&self.session));
        }
    }

    /// Destroy an item for experience proportional to its drop value.
    fn drop_item(&mut self, code: ObjectCode, level: u32) {
        {
            let mut state = self.session.state.write().expect("poisoned");
            let value = item::item_value_as_drop(state.record.level, level, code) * ITEM_REWARD_NORMALIZER;
            if value >= 0.0 && state.record.inventory.remove_one(code, level) {
                state.record.add_experience(value);
                state.updated_stats = true;
            }
        }
        self.report_inventory_item(code, level);
    }

    // ------------------------------------------------------------------
    // World access.

    fn read_chunk(&mut self, cc: IVec3) {

        // Refuse requests too far from the player; clients should not
        // download the world.
        let own = geom::calc_chunk_pos(self.state_coord());
        let d = own - cc;
        let dist = d.x * d.x + d.y * d.y + d.z * d.z;
        if dist > 3 * MAX_CHUNK_REQ_DIST * MAX_CHUNK_REQ_DIST {
            self.printf("!Bad chunk request");
            return;
        }

        let handle = self.server.cache.find(cc);
        let packet = {
            let mut chunk = handle.write();
            OutPacket::ChunkAnswer {
                flag: chunk.flag,
                checksum: chunk.checksum,
                owner: chunk.owner,
                cc,
                compressed: chunk.filtered().to_vec(),
            }
        };
        self.send_packet_blocking(&packet);

    }

    fn superchunk_answer(&mut self, cc: IVec3) {
        let body = self.server.super_chunks.answer_payload(cc);
        self.send_packet_blocking(&OutPacket::SuperchunkAnswer(body));
    }

    /// Remove a block (or a teleport anchor) from an owned chunk.
    fn hit_block(&mut self, cc: IVec3, dx: u8, dy: u8, dz: u8) {

        let (uid, admin) = {
            let state = self.session.state.read().expect("poisoned");
            (state.uid, state.record.admin_level)
        };
        let owner = self.server.cache.find(cc).read().owner;
        if owner != uid && admin < 1 {
            self.printf("#FAIL Not owner of chunk. See help for territory");
            return;
        }

        // Teleport anchors are not blocks in the chunk; intercept them.
        if self.server.super_chunks.get_teleport(cc) == Some((dx, dy, dz)) {
            self.server.super_chunks.remove_teleport(cc);
            let coord = self.state_coord();
            for other in self.server.near_players(coord.truncate(), NEAR_OBJECTS) {
                other.send_packet(&OutPacket::SuperchunkAnswer(self.server.super_chunks.answer_payload(cc)));
                other.send_packet(&OutPacket::BlockUpdate { cc, dx, dy, dz, block: block::AIR });
            }
            return;
        }

        if !self.server.cache.update_block(cc, dx, dy, dz, block::AIR) {
            return;
        }
        self.session.state.write().expect("poisoned").record.block_rem += 1;
        self.broadcast_block_update(cc, dx, dy, dz, block::AIR);

    }

    /// Attach a block to an owned chunk; the teleport pseudo block goes to
    /// the super chunk store instead.
    fn attach_block(&mut self, cc: IVec3, dx: u8, dy: u8, dz: u8, bl: u8) {

        if bl == block::TELEPORT {
            self.set_teleport(cc, dx, dy, dz);
            return;
        }

        let (uid, admin) = {
            let state = self.session.state.read().expect("poisoned");
            (state.uid, state.record.admin_level)
        };
        let owner = self.server.cache.find(cc).read().owner;
        if owner != uid && admin < 1 {
            self.printf("Not owner of chunk. See help for territory");
            return;
        }
        if !self.server.cache.update_block(cc, dx, dy, dz, bl) {
            return;
        }
        self.session.state.write().expect("poisoned").record.block_add += 1;
        self.broadcast_block_update(cc, dx, dy, dz, bl);

    }

    fn broadcast_block_update(&mut self, cc: IVec3, dx: u8, dy: u8, dz: u8, bl: u8) {
        let coord = self.state_coord();
        let packet = OutPacket::BlockUpdate { cc, dx, dy, dz, block: bl };
        for other in self.server.near_players(coord.truncate(), NEAR_OBJECTS) {
            if Arc::ptr_eq(&other, &self.session) {
                self.send_packet_blocking(&packet);
            } else {
                other.send_packet(&packet);
            }
        }
    }

    /// Place a teleport anchor: owner (or admin) only, and only one portal
    /// per player.
    fn set_teleport(&mut self, cc: IVec3, dx: u8, dy: u8, dz: u8) {

        let (uid, admin) = {
            let state = self.session.state.read().expect("poisoned");
            (state.uid, state.record.admin_level)
        };
        let owner = self.server.cache.find(cc).read().owner;
        if owner != uid && admin == 0 {
            self.printf("#FAIL");
            return;
        }

        let territory = self.server.store.load_territory(uid);
        let others = territory.iter()
            .filter(|&&t| t != cc && self.server.super_chunks.get_teleport(t).is_some())
            .count();
        if others > 0 && admin == 0 {
            self.printf("#FAIL You can only have one magical portal");
            return;
        }

        let previous = self.server.super_chunks.get_teleport(cc);
        self.server.super_chunks.set_teleport(cc, dx, dy, dz);

        let coord = self.state_coord();
        for other in self.server.near_players(coord.truncate(), NEAR_OBJECTS) {
            other.send_packet(&OutPacket::SuperchunkAnswer(self.server.super_chunks.answer_payload(cc)));
            if let Some((px, py, pz)) = previous {
                other.send_packet(&OutPacket::BlockUpdate { cc, dx: px, dy: py, dz: pz, block: block::AIR });
            }
            other.send_packet(&OutPacket::BlockUpdate { cc, dx, dy, dz, block: block::TELEPORT });
        }

    }

    /// Jump through the teleport of the addressed chunk, when the player's
    /// level covers the destination difficulty.
    fn teleport(&mut self, x: u8, y: u8, z: u8) {

        let own = self.state_coord();
        let cc = geom::update_lsb(geom::calc_chunk_pos(own), x, y, z);
        let Some((tx, ty, tz)) = self.server.super_chunks.get_teleport(cc) else {
            self.printf("#FAIL");
            return;
        };

        let dest = geom::block_world_pos(cc, tx, ty, tz);
        let required = combat::monster_difficulty(dest);
        let (level, uid) = {
            let state = self.session.state.read().expect("poisoned");
            (state.record.level, state.uid)
        };
        if required > level {
            self.printf(format!("#FAIL Level {required} required"));
            return;
        }

        for other in self.server.near_players(own.truncate(), NEAR_OBJECTS) {
            if !Arc::ptr_eq(&other, &self.session) {
                other.send_command(SessionCommand::Message("#PLP1".into()));
                other.send_command(SessionCommand::ObjectMoved(QtHandle::Player(uid)));
            }
        }

        {
            let mut state = self.session.state.write().expect("poisoned");
            state.record.coord = dest;
        }

        for other in self.server.near_players(dest.truncate(), NEAR_OBJECTS) {
            if !Arc::ptr_eq(&other, &self.session) {
                other.send_command(SessionCommand::Message("#BOOM".into()));
                other.send_command(SessionCommand::ObjectMoved(QtHandle::Player(uid)));
            }
        }
        self.printf("#BOOM");

    }

    // ------------------------------------------------------------------
    // Commands from other threads.

    fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::ObjectMoved(handle) => self.obj_moved.push(handle),
            SessionCommand::Message(text) => self.printf(text),
            SessionCommand::HitByMonster { monster_id, monster_level, weapon_dmg } => {
                self.apply_monster_hit(monster_id, monster_level, weapon_dmg);
            }
            SessionCommand::GrantKey(key) => {
                let mut state = self.session.state.write().expect("poisoned");
                state.record.keys.add(key);
            }
            SessionCommand::AddItem { code, level, cost } => self.apply_add_item(code, level, cost),
        }
    }

    /// A monster melee hit: compute the damage against the player's
    /// protection, mark death, trickle score to the territory owner.
    fn apply_monster_hit(&mut self, monster_id: u32, monster_level: u32, weapon_dmg: f32) {

        let (damage, coord, uid) = {
            let mut state = self.session.state.write().expect("poisoned");
            let dmg = combat::monster_hit_damage(
                state.record.level,
                monster_level,
                weapon_dmg,
                (state.record.armor.level, state.record.armor.grade),
                (state.record.helmet.level, state.record.helmet.grade),
            );
            state.record.hit_points -= dmg;
            state.updated_stats = true;
            if state.record.hit_points <= 0.0 {
                state.record.hit_points = 0.0;
                state.record.dead = true;
            }
            (dmg, state.record.coord, state.uid)
        };

        let handle = self.server.cache.find(geom::calc_chunk_pos(coord));
        let owner = handle.read().owner;
        if owner != uid && !block::owner_is_reserved(owner) {
            self.server.scores.add(owner, damage as f64 * SCORE_DAMAGE_FACT);
        }

        self.send_packet_blocking(&OutPacket::HitByMonster {
            monster: monster_id,
            damage: (damage * 255.0 + 0.5) as u8,
        });

    }

    /// An activator granted an item; the chunk owner of the ground the
    /// player stands on covers the cost, unless the ground is unowned,
    /// reserved or the player's own.
    fn apply_add_item(&mut self, code: ObjectCode, level: u32, cost: f64) {

        let (coord, uid) = {
            let state = self.session.state.read().expect("poisoned");
            (state.record.coord, state.uid)
        };
        let handle = self.server.cache.find(geom::calc_chunk_pos(coord));
        let owner = handle.read().owner;

        let cost_covered = if !block::owner_is_reserved(owner) && uid < block::OWNER_RESERVED {
            self.server.scores.pay(owner, cost)
        } else {
            true
        };
        if !cost_covered {
            return;
        }

        {
            let mut state = self.session.state.write().expect("poisoned");
            state.record.inventory.add_one(code, level);
        }
        self.report_inventory_item(code, level);

    }

    // ------------------------------------------------------------------
    // Shutdown.

    /// Persist the player document, except for test players which are never
    /// saved.
    fn save_player(&mut self) {
        let (uid, record) = {
            let mut state = self.session.state.write().expect("poisoned");
            if state.license.is_none() || state.uid >= block::OWNER_RESERVED {
                return;
            }
            if state.conn != ConnState::In && state.conn != ConnState::Disconnected {
                return;
            }
            let online = state.logon_time.elapsed().as_secs() as u32;
            state.record.time_online += online;
            state.logon_time = Instant::now();
            (state.uid, state.record.clone())
        };
        self.server.store.save_player(uid, &record);
    }

    /// Unwind the session: leave the quadtree, the table, and notify the
    /// friends.
    fn cleanup(&mut self) {

        let (name, uid, listeners, was_in) = {
            let mut state = self.session.state.write().expect("poisoned");
            let was_in = matches!(state.conn, ConnState::In | ConnState::Disconnected);
            state.conn = ConnState::Disconnected;
            (
                state.record.name.clone(),
                state.uid,
                state.record.listeners.clone(),
                was_in,
            )
        };

        if was_in {
            if let Some(entry) = self.session.qt_entry.get() {
                self.server.player_qt.remove(entry);
            }
        }
        self.server.sessions.remove(&self.session);

        for listener in listeners {
            if let Some(other) = self.server.sessions.by_uid(listener) {
                other.send_command(SessionCommand::Message(format!("Logged out: {name}")));
            }
        }

        if !name.is_empty() {
            info!("{name} ({uid}) disconnected");
        }

    }

}

/// A movement related client command.
enum MoveChange {
    Intent {
        fwd: Option<bool>,
        bwd: Option<bool>,
        lft: Option<bool>,
        rgt: Option<bool>,
    },
    Jump,
}

/// How much of the body stays above water when swimming.
const SWIMMING_HEIGHT: f64 = PLAYER_HEIGHT / 2.0;

/// True when the main body is in water.
pub fn swimming(cache: &voxworld::cache::ChunkCache, coord: DVec3) -> bool {
    let body = cache.get_block(coord + DVec3::new(0.0, 0.0, SWIMMING_HEIGHT));
    body == block::WATER || body == block::BROWN_WATER
}

/// True when a ladder is adjacent at chest height.
pub fn near_ladder(cache: &voxworld::cache::ChunkCache, coord: DVec3) -> bool {
    [
        DVec3::new(-1.0, 0.0, 1.0),
        DVec3::new(1.0, 0.0, 1.0),
        DVec3::new(0.0, -1.0, 1.0),
        DVec3::new(0.0, 1.0, 1.0),
    ]
    .into_iter()
    .any(|off| cache.get_block(coord + off) == block::LADDER)
}

#[cfg(test)]
mod tests {

    use std::net::TcpListener;
    use crate::config::Config;
    use crate::db::FileStore;
    use super::*;

    fn test_server(name: &str, allow_test_user: bool) -> Arc<Server> {
        let dir = std::env::temp_dir().join(format!("voxworld-player-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let cfg = Config {
            chunk_folder: dir.join("DB"),
            super_chunk_folder: dir.join("SDB"),
            player_folder: dir.join("PDB"),
            allow_test_user,
            inhibit_create: true,
            ..Default::default()
        };
        let store = Box::new(FileStore::new(dir.join("PDB")).unwrap());
        Server::new(cfg, store).unwrap()
    }

    fn loopback() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        (client, server_side)
    }

    fn read_one_frame(stream: &mut TcpStream) -> (u8, Vec<u8>) {
        let mut cap = voxworld::io::FRAME_INITIAL_CAP;
        let frame = voxworld::io::read_frame(stream, &mut cap).unwrap();
        (frame.cmd, frame.payload)
    }

    #[test]
    fn test_user_logs_in_without_password() {

        let server = test_server("login", true);
        let (mut client, server_side) = loopback();
        let session = server.sessions.allocate().unwrap();
        let mut runner = SessionRunner::new(Arc::clone(&server), Arc::clone(&session), server_side);

        assert!(runner.handle_login("test0"));

        // Straight to the world, no password phase.
        assert_eq!(session.conn_state(), ConnState::In);
        assert_eq!(session.uid(), u32::MAX);
        assert_eq!(server.player_qt.len(), 1);

        // The client got the acknowledgment with admin level 9.
        let (cmd, payload) = read_one_frame(&mut client);
        assert_eq!(cmd, CMD_LOGIN_ACK);
        assert_eq!(payload.len(), 9);
        assert_eq!(u32::from_le_bytes(payload[..4].try_into().unwrap()), u32::MAX);
        assert_eq!(payload[8], 9);

    }

    #[test]
    fn unknown_account_still_gets_a_challenge() {

        let server = test_server("challenge", false);
        let (mut client, server_side) = loopback();
        let session = server.sessions.allocate().unwrap();
        let mut runner = SessionRunner::new(Arc::clone(&server), Arc::clone(&session), server_side);

        assert!(runner.handle_login("nobody@example.com"));
        assert_eq!(session.conn_state(), ConnState::Password);

        let (cmd, payload) = read_one_frame(&mut client);
        assert_eq!(cmd, CMD_REQ_PASSWORD);
        assert_eq!(payload.len(), 20);

        // Whatever the password, the login fails without leaking why.
        assert!(!runner.handle_password(b"anything"));

    }

    #[test]
    fn full_password_login_round_trip() {

        let server = test_server("password", false);

        // Provision an account the way the web frontend would.
        let license = License {
            mail: "ada@example.com".into(),
            password_hash: License::hash_password(b"lovelace", &server.cfg.password_salt),
            license_key: "ABCDEFGHIJKLMNOPQRST".into(),
            uid: 17,
            avatar: "ada".into(),
            last_seen: String::new(),
        };
        server.store.save_license(&license);
        server.store.save_player(17, &PlayerRecord {
            name: "ada".into(),
            level: 3,
            ..Default::default()
        });

        let (mut client, server_side) = loopback();
        let session = server.sessions.allocate().unwrap();
        let mut runner = SessionRunner::new(Arc::clone(&server), Arc::clone(&session), server_side);

        assert!(runner.handle_login("ada@example.com"));
        let (cmd, challenge) = read_one_frame(&mut client);
        assert_eq!(cmd, CMD_REQ_PASSWORD);

        // Encrypt like the client: RC4 keyed with license xor challenge.
        let mut encrypted = b"lovelace".to_vec();
        Rc4::new(&xor_key(license.license_key.as_bytes(), &challenge)).apply(&mut encrypted);
        assert!(runner.handle_password(&encrypted));
        assert_eq!(session.conn_state(), ConnState::In);
        assert_eq!(session.uid(), 17);

        // A wrong password on a fresh session is refused.
        let (_client2, server_side2) = loopback();
        let session2 = server.sessions.allocate().unwrap();
        let mut runner2 = SessionRunner::new(Arc::clone(&server), session2, server_side2);
        assert!(runner2.handle_login("ada@example.com"));
        assert!(!runner2.handle_password(b"garbage"));

    }

    #[test]
    fn swimming_checks_the_body_block() {
        let server = test_server("swim", true);
        let cc = glam::IVec3::new(0, 0, 0);
        let handle = server.cache.find(cc);
        {
            let mut chunk = handle.write();
            for z in 0..4u8 {
                chunk.set_raw(5, 5, z, block::WATER);
            }
        }
        assert!(swimming(&server.cache, DVec3::new(5.5, 5.5, 0.5)));
        assert!(!swimming(&server.cache, DVec3::new(8.5, 8.5, 0.5)));
    }

}

