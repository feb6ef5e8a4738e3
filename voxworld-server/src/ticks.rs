//! The scheduler threads: independent tasks each sleeping a configured
//! period, reporting their elapsed time into the timer registry.
//!
//! The scheduling principle slows a task down under heavy load instead of
//! trying to catch up: each iteration sleeps the full period before working.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::*;
use crate::monster;
use crate::server::Server;

/// Spawn every periodic task.
pub fn spawn_schedulers(server: &Arc<Server>) {

    spawn(server, "PurgeOldChunks", CHUNK_PURGE_PERIOD, |server| {
        server.cache.sweep();
    });

    spawn(server, "UpdateMonsterState", MONSTER_STATE_PERIOD, |server| {
        monster::state_tick(server);
    });

    {
        // The position tick forces a full report every ~4 s so clients
        // recover from any lost increments.
        let mut last_full = Instant::now();
        spawn(server, "UpdateMonsterPos", OBJECTS_UPDATE_PERIOD, move |server| {
            let full = last_full.elapsed() > Duration::from_secs(4);
            if full {
                last_full = Instant::now();
            }
            monster::position_tick(server, full);
        });
    }

    spawn(server, "UpdateMonstersTarget", MONSTER_TARGET_PERIOD, |server| {
        monster::target_tick(server);
    });

    spawn(server, "PurgeMonsters", MONSTER_PURGE_PERIOD, |server| {
        monster::purge_tick(server);
    });

    spawn(server, "SpawnMonsters", MONSTER_SPAWN_PERIOD, |server| {
        monster::spawn_tick(server);
    });

    spawn(server, "MonsterMelee", ATTACK_PERIOD, |server| {
        monster::melee_tick(server);
    });

    spawn(server, "Autosave", AUTOSAVE_PERIOD, |server| {
        for session in server.sessions.in_world() {
            session.state.write().expect("poisoned").force_save = true;
        }
    });

    spawn(server, "ScoreMaintenance", SCORE_UPDATE_PERIOD, |server| {
        server.scores.maintain(|uid, doc| server.store.save_score(uid, &doc));
    });

    spawn(server, "TrafficAverage", TRAFFIC_PERIOD, |server| {
        server.traffic.update_average(TRAFFIC_PERIOD);
    });

}

/// One scheduler thread: sleep the period, run the task, record the elapsed
/// time, until shutdown.
fn spawn<F>(server: &Arc<Server>, name: &str, period: Duration, mut task: F)
where
    F: FnMut(&Server) + Send + 'static,
{
    let slot = server.timers.register(name, period);
    let server = Arc::clone(server);
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            while server.running() {
                // The elapsed time includes the sleep, so the report shows
                // how far each task overruns its period.
                let start = Instant::now();
                thread::sleep(period);
                task(&server);
                slot.set_elapsed(start.elapsed());
            }
        })
        .expect("scheduler thread spawn");
}
