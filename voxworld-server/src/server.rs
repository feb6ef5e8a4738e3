//! The server state shared by every thread, and the session table.
//!
//! Long lived singletons (chunk cache, quadtrees, monster map, session
//! table, score board, super chunk store) are owned here and injected into
//! the connection and scheduler threads as one `Arc<Server>`; nothing in the
//! core library reaches for ambient globals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use glam::DVec2;
use tracing::info;

use voxworld::cache::ChunkCache;
use voxworld::gen::TerrainGenerator;
use voxworld::quadtree::{QtHandle, Quadtree};
use voxworld::score::ScoreBoard;
use voxworld::stats::{TimerStats, TrafficStats};
use voxworld::storage::ChunkDir;
use voxworld::super_chunk::SuperChunkStore;

use crate::config::{Config, MAX_PLAYERS};
use crate::db::PlayerStore;
use crate::monster::MonsterMap;
use crate::player::{ConnState, Session};

/// Everything the threads share.
pub struct Server {
    pub cfg: Config,
    pub cache: ChunkCache,
    /// All in-world players, indexed by horizontal position.
    pub player_qt: Quadtree,
    /// All monsters, indexed by horizontal position.
    pub monster_qt: Quadtree,
    pub monsters: MonsterMap,
    pub sessions: SessionTable,
    pub scores: ScoreBoard,
    pub super_chunks: SuperChunkStore,
    pub store: Box<dyn PlayerStore>,
    pub timers: TimerStats,
    pub traffic: TrafficStats,
    /// Cleared by the signal handler; every loop watches it.
    running: AtomicBool,
}

impl Server {

    /// Wire up all shared state. Fails when any of the data folders cannot
    /// be opened.
    pub fn new(cfg: Config, store: Box<dyn PlayerStore>) -> anyhow::Result<Arc<Self>> {
        let dir = ChunkDir::new(&cfg.chunk_folder)?;
        let gen = TerrainGenerator::new(cfg.inhibit_create);
        let super_chunks = SuperChunkStore::new(&cfg.super_chunk_folder)?;
        Ok(Arc::new(Self {
            cache: ChunkCache::new(dir, gen),
            player_qt: Quadtree::new(),
            monster_qt: Quadtree::new(),
            monsters: MonsterMap::new(),
            sessions: SessionTable::new(MAX_PLAYERS),
            scores: ScoreBoard::new(),
            super_chunks,
            store,
            timers: TimerStats::new(),
            traffic: TrafficStats::new(),
            running: AtomicBool::new(true),
            cfg,
        }))
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Begin the cooperative shutdown: the score task saves its remaining
    /// entries, every in-world player is flagged for a save, and after a
    /// short grace period the process exits.
    pub fn shutdown(&self) {

        info!("graceful shutdown initiated");
        self.running.store(false, Ordering::Relaxed);

        self.scores.maintain(|uid, doc| self.store.save_score(uid, &doc));

        for session in self.sessions.in_world() {
            let mut state = session.state.write().expect("poisoned");
            state.force_save = true;
        }

        // Let the session threads run their save pass before the world
        // flush.
        thread::sleep(Duration::from_millis(500));
        self.cache.flush();
        info!("world saved");

    }

    /// The sessions of all in-world players within `dist` of a horizontal
    /// position.
    pub fn near_players(&self, pos: DVec2, dist: f64) -> Vec<Arc<Session>> {
        self.player_qt.find_near(pos, dist)
            .into_iter()
            .filter_map(|entry| match entry.handle {
                QtHandle::Player(uid) => self.sessions.by_uid(uid),
                QtHandle::Monster(_) => None,
            })
            .collect()
    }

}

/// The table of connected sessions, with the name and uid indices. One lock
/// covers all three.
pub struct SessionTable {
    inner: RwLock<TableInner>,
}

struct TableInner {
    slots: Vec<Option<Arc<Session>>>,
    by_name: HashMap<String, Arc<Session>>,
    by_uid: HashMap<u32, Arc<Session>>,
    count: usize,
}

impl SessionTable {

    pub fn new(max: usize) -> Self {
        Self {
            inner: RwLock::new(TableInner {
                slots: (0..max).map(|_| None).collect(),
                by_name: HashMap::new(),
                by_uid: HashMap::new(),
                count: 0,
            }),
        }
    }

    /// Allocate a slot for a fresh connection; `None` refuses it.
    pub fn allocate(&self) -> Option<Arc<Session>> {
        let mut inner = self.inner.write().expect("poisoned");
        let slot = inner.slots.iter().position(|s| s.is_none())?;
        let session = Session::new(slot);
        inner.slots[slot] = Some(Arc::clone(&session));
        inner.count += 1;
        Some(session)
    }

    /// Index a session under its name and uid once the login completed.
    pub fn register_login(&self, session: &Arc<Session>, name: &str, uid: u32) {
        let mut inner = self.inner.write().expect("poisoned");
        inner.by_name.insert(name.to_lowercase(), Arc::clone(session));
        inner.by_uid.insert(uid, Arc::clone(session));
    }

    /// Drop a session from the table and all indices.
    pub fn remove(&self, session: &Arc<Session>) {
        let mut inner = self.inner.write().expect("poisoned");
        if inner.slots[session.slot].take().is_some() {
            inner.count -= 1;
        }
        let state = session.state.read().expect("poisoned");
        inner.by_name.remove(&state.record.name.to_lowercase());
        inner.by_uid.remove(&state.uid);
    }

    pub fn by_uid(&self, uid: u32) -> Option<Arc<Session>> {
        self.inner.read().expect("poisoned").by_uid.get(&uid).cloned()
    }

    pub fn by_name(&self, name: &str) -> Option<Arc<Session>> {
        self.inner.read().expect("poisoned").by_name.get(&name.to_lowercase()).cloned()
    }

    pub fn count(&self) -> usize {
        self.inner.read().expect("poisoned").count
    }

    /// Snapshot of every session currently in the world.
    pub fn in_world(&self) -> Vec<Arc<Session>> {
        let inner = self.inner.read().expect("poisoned");
        inner.slots.iter()
            .flatten()
            .filter(|s| s.conn_state() == ConnState::In)
            .cloned()
            .collect()
    }

}

#[cfg(test)]
mod tests {

    use glam::{DVec3, IVec3};
    use voxworld::block;
    use voxworld::quadtree::{QtEntry, QtHandle};
    use crate::config::MONSTER_LIMIT_FOR_RESPAWN;
    use crate::monster;
    use super::*;

    fn test_server(name: &str) -> Arc<Server> {
        let dir = std::env::temp_dir().join(format!("voxworld-server-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let cfg = Config {
            chunk_folder: dir.join("DB"),
            super_chunk_folder: dir.join("SDB"),
            player_folder: dir.join("PDB"),
            inhibit_create: true,
            ..Default::default()
        };
        let store = Box::new(crate::db::FileStore::new(dir.join("PDB")).unwrap());
        Server::new(cfg, store).unwrap()
    }

    /// Lay a stone floor at the given height across a square of chunks, so
    /// spawn points exist in the otherwise empty test world.
    fn stone_floor(server: &Server, z: u8, chunk_range: i32) {
        for cx in -chunk_range..=chunk_range {
            for cy in -chunk_range..=chunk_range {
                let handle = server.cache.find(IVec3::new(cx, cy, 0));
                let mut chunk = handle.write();
                for x in 0..32u8 {
                    for y in 0..32u8 {
                        chunk.set_raw(x, y, z, block::STONE);
                    }
                }
            }
        }
    }

    /// Put a player session into the world at a position, bypassing the
    /// network login.
    fn insert_player(server: &Arc<Server>, uid: u32, coord: DVec3) -> Arc<Session> {
        let session = server.sessions.allocate().unwrap();
        {
            let mut state = session.state.write().expect("poisoned");
            state.conn = ConnState::In;
            state.uid = uid;
            state.record.coord = coord;
            state.prev_coord = coord;
        }
        let entry = session.qt_entry.get_or_init(|| {
            QtEntry::new(QtHandle::Player(uid), coord.truncate())
        });
        server.player_qt.add(entry);
        server.sessions.register_login(&session, "tester", uid);
        session
    }

    #[test]
    fn spawn_tick_respects_the_limit_and_purge_cleans_up() {

        let server = test_server("spawnpurge");
        stone_floor(&server, 4, 1);
        let session = insert_player(&server, 1, DVec3::new(16.0, 16.0, 5.0));

        // One spawn attempt per tick per player, until the area holds the
        // limit.
        for _ in 0..MONSTER_LIMIT_FOR_RESPAWN + 1 {
            monster::spawn_tick(&server);
        }
        assert_eq!(server.monsters.len(), MONSTER_LIMIT_FOR_RESPAWN);
        assert_eq!(server.monster_qt.len(), MONSTER_LIMIT_FOR_RESPAWN);

        // With the player gone the purge removes everything.
        if let Some(entry) = session.qt_entry.get() {
            server.player_qt.remove(entry);
        }
        server.sessions.remove(&session);
        monster::purge_tick(&server);
        assert!(server.monsters.is_empty());
        assert!(server.monster_qt.is_empty());

    }

    #[test]
    fn monsters_do_not_spawn_in_owned_chunks() {

        let server = test_server("owned");
        stone_floor(&server, 4, 1);
        // Give every chunk of the floor to a player.
        for cx in -1..=1 {
            for cy in -1..=1 {
                server.cache.set_owner(IVec3::new(cx, cy, 0), 42);
            }
        }
        insert_player(&server, 1, DVec3::new(16.0, 16.0, 5.0));

        for _ in 0..5 {
            monster::spawn_tick(&server);
        }
        assert!(server.monsters.is_empty());

    }

    #[test]
    fn session_table_refuses_when_full() {
        let table = SessionTable::new(2);
        let a = table.allocate().unwrap();
        let _b = table.allocate().unwrap();
        assert!(table.allocate().is_none());
        table.remove(&a);
        assert!(table.allocate().is_some());
    }

    #[test]
    fn melee_reaches_the_player_through_the_command_queue() {

        let server = test_server("melee");
        stone_floor(&server, 4, 1);
        let session = insert_player(&server, 1, DVec3::new(16.0, 16.0, 5.0));

        let m = monster::spawn_at(&server, DVec3::new(17.0, 16.0, 5.0), 0);
        m.body.lock().expect("poisoned").aggro = Some(1);

        monster::melee_tick(&server);

        // The hit arrived as a typed command on the session queue (behind
        // the spawn notification); the session thread applies it serially.
        let mut hit = None;
        while let Some(cmd) = session.try_recv_command() {
            if let crate::player::SessionCommand::HitByMonster { monster_id, .. } = cmd {
                hit = Some(monster_id);
            }
        }
        assert_eq!(hit, Some(m.id));

    }

}
