//! Monsters: the owning map, the AI state machine, and the periodic ticks
//! that drive spawning, movement, targeting, melee and purging.
//!
//! The map itself sits behind one read/write lock; each monster's mutable
//! body has its own lock. Tick functions snapshot the monster list and drop
//! the map lock before touching anything else, so the lock order (session →
//! quadtree → monster → chunk) holds throughout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use glam::{DVec2, DVec3};
use rand::Rng;
use tracing::debug;

use voxworld::block;
use voxworld::combat;
use voxworld::entity::{MonsterBody, MonsterState, ASSAULT_FACTOR, WALKING_FACTOR};
use voxworld::geom;
use voxworld::item;
use voxworld::quadtree::{QtEntry, QtHandle};

use crate::config::*;
use crate::player::{ConnState, Session, SessionCommand};
use crate::proto::OutPacket;
use crate::server::Server;

/// One monster: immutable identity, the quadtree entry, and the locked body.
pub struct Monster {
    pub id: u32,
    pub entry: Arc<QtEntry>,
    pub body: Mutex<MonsterBody>,
    /// Set when the monster left the map; stale references check this.
    pub invalid: AtomicBool,
}

/// The owning table of all live monsters.
pub struct MonsterMap {
    inner: RwLock<HashMap<u32, Arc<Monster>>>,
    next_id: AtomicU32,
    /// When the positions were last integrated.
    last_moved: Mutex<Instant>,
}

impl MonsterMap {

    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(0),
            last_moved: Mutex::new(Instant::now()),
        }
    }

    pub fn get(&self, id: u32) -> Option<Arc<Monster>> {
        self.inner.read().expect("poisoned").get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A snapshot of every monster; tick functions iterate this without the
    /// map lock.
    pub fn all(&self) -> Vec<Arc<Monster>> {
        self.inner.read().expect("poisoned").values().cloned().collect()
    }

    fn insert(&self, body: MonsterBody) -> Arc<Monster> {
        let mut inner = self.inner.write().expect("poisoned");
        // The id space wraps eventually, which is fine as long as the id is
        // free right now.
        let mut id = self.next_id.load(Ordering::Relaxed);
        while inner.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        self.next_id.store(id.wrapping_add(1), Ordering::Relaxed);
        let monster = Arc::new(Monster {
            id,
            entry: QtEntry::new(QtHandle::Monster(id), body.coord.truncate()),
            body: Mutex::new(body),
            invalid: AtomicBool::new(false),
        });
        inner.insert(id, Arc::clone(&monster));
        monster
    }

}

impl Default for MonsterMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Count live monsters within the spawn-check distance of a position.
pub fn count_near_monsters(server: &Server, pos: DVec2) -> usize {
    server.monster_qt.find_near(pos, MONSTER_SPAWN_CHECK_DIST)
        .iter()
        .filter(|entry| match entry.handle {
            QtHandle::Monster(id) => server.monsters.get(id)
                .is_some_and(|m| !m.body.lock().expect("poisoned").dead),
            _ => false,
        })
        .count()
}

/// Spawn a monster near a position, telling every near player about it. The
/// level is the area difficulty adjusted by `delta_level`.
pub fn spawn_at(server: &Server, coord: DVec3, delta_level: i32) -> Arc<Monster> {

    let base = combat::monster_difficulty(coord) as i32;
    let level = (base + delta_level).max(0) as u32;
    let dir = rand::thread_rng().gen::<f32>() * std::f32::consts::TAU;
    let monster = server.monsters.insert(MonsterBody::spawn(level, coord, dir));

    for other in server.near_players(coord.truncate(), NEAR_OBJECTS) {
        other.send_command(SessionCommand::ObjectMoved(QtHandle::Monster(monster.id)));
    }
    server.monster_qt.add(&monster.entry);

    monster

}

/// The spawn tick: give each in-world player company unless the area is
/// already populated or owned.
pub fn spawn_tick(server: &Server) {
    for session in server.sessions.in_world() {
        try_spawn_for(server, &session);
    }
}

fn try_spawn_for(server: &Server, session: &Arc<Session>) {

    let coord = {
        let state = session.state.read().expect("poisoned");
        if state.conn != ConnState::In {
            return;
        }
        state.record.coord
    };

    if count_near_monsters(server, coord.truncate()) >= MONSTER_LIMIT_FOR_RESPAWN {
        return;
    }

    // A random point a fixed distance away, at a workable height.
    let angle = rand::thread_rng().gen::<f64>() * std::f64::consts::TAU;
    let mut target = coord;
    target.x += angle.cos() * MONSTER_SPAWN_DISTANCE;
    target.y += angle.sin() * MONSTER_SPAWN_DISTANCE;

    if count_near_monsters(server, target.truncate()) >= MONSTER_LIMIT_FOR_RESPAWN {
        return;
    }

    let mut found = false;
    let mut dz = -MONSTER_SPAWN_HEIGHT_DIFF;
    while dz < MONSTER_SPAWN_HEIGHT_DIFF {
        let probe = DVec3::new(target.x, target.y, target.z + dz);
        if server.cache.valid_spawn_point(probe, 3.0) {
            target.z += dz;
            found = true;
            break;
        }
        dz += 1.0;
    }
    if !found {
        return;
    }

    // Owned chunks keep their monsters out.
    let handle = server.cache.find(geom::calc_chunk_pos(target));
    let owner = handle.read().owner;
    if block::owner_is_reserved(owner) {
        spawn_at(server, target, 0);
    }

}

/// The state tick: advance every monster's state machine.
pub fn state_tick(server: &Server) {

    let mut rng = rand::thread_rng();

    for monster in server.monsters.all() {

        // Read what the attacking states need from the player before the
        // body lock, respecting the lock order.
        let aggro_info = {
            let body = monster.body.lock().expect("poisoned");
            if body.dead {
                continue;
            }
            body.aggro
        }
        .and_then(|uid| server.sessions.by_uid(uid))
        .map(|session| {
            let state = session.state.read().expect("poisoned");
            (state.conn == ConnState::In && !state.record.dead, state.record.coord)
        });

        let mut body = monster.body.lock().expect("poisoned");
        if body.dead {
            continue;
        }

        match body.state {

            MonsterState::Normal => {
                if rng.gen::<f32>() > MONSTER_MOVING_PROB {
                    // Nudge the heading so strolls avoid sharp turns.
                    body.dir_hor += (0.5 - rng.gen::<f32>()) * std::f32::consts::PI / 60.0;
                    if body.dir_hor < 0.0 {
                        body.dir_hor += std::f32::consts::TAU;
                    }
                    if body.dir_hor > std::f32::consts::TAU {
                        body.dir_hor -= std::f32::consts::TAU;
                    }
                    body.mv_fwd = true;
                    body.speed = WALKING_FACTOR * body.max_speed;
                    body.state = MonsterState::Strolling;
                }
            }

            MonsterState::Strolling => {
                if rng.gen::<f32>() <= MONSTER_MOVING_PROB {
                    body.mv_fwd = false;
                    body.state = MonsterState::Normal;
                }
            }

            MonsterState::Turning => {
                let turn = body.turning_dir;
                body.dir_hor += turn;
                // Try moving again; a blocked path puts it back to turning.
                body.mv_fwd = true;
                body.speed = WALKING_FACTOR * body.max_speed;
                body.state = MonsterState::Strolling;
            }

            MonsterState::Hostile | MonsterState::GoHome => {}

            MonsterState::Attacking => {
                match aggro_info {
                    None | Some((false, _)) => {
                        // The target is gone; calm down.
                        body.aggro = None;
                        body.speed = WALKING_FACTOR * body.max_speed;
                        body.state = MonsterState::Normal;
                    }
                    Some((true, player_coord)) => {
                        let (dir, dist2) = body.dir_toward(player_coord);
                        body.dir_hor = dir;

                        // The fatigue budget targets 15 seconds of chase at
                        // full persistence.
                        let drain = body.persistence / (15.0 / MONSTER_STATE_PERIOD.as_secs_f32());
                        body.fatigue -= drain;
                        if body.fatigue <= 0.0 {
                            body.aggro = None;
                            body.fatigue = 0.0;
                            body.state = MonsterState::Recovering;
                        }

                        // Chase until melee range, then hold position.
                        body.mv_fwd = dist2 > MELEE_DIST_LIMIT * MELEE_DIST_LIMIT;
                    }
                }
            }

            MonsterState::Defending => {
                body.state = MonsterState::Attacking;
            }

            MonsterState::Recovering => {
                let gain = body.persistence / (30.0 / MONSTER_STATE_PERIOD.as_secs_f32());
                body.fatigue += gain;
                if body.fatigue > 100.0 {
                    body.fatigue = 100.0;
                    body.state = MonsterState::Normal;
                }
            }

        }

    }

}

/// The position tick: integrate motion, update the quadtree, and tell near
/// players about everything that moved. A `full_report` forces entries for
/// monsters that stood still.
pub fn position_tick(server: &Server, full_report: bool) {

    let now = Instant::now();
    let mut dt = {
        let mut last = server.monsters.last_moved.lock().expect("poisoned");
        let dt = now.duration_since(*last);
        *last = now;
        dt
    };
    if dt > OBJECTS_UPDATE_PERIOD * 4 {
        // A scheduler stall (or host sleep) must not teleport monsters.
        dt = OBJECTS_UPDATE_PERIOD * 2;
    }

    for monster in server.monsters.all() {

        let (moved, report, pos) = {
            let mut body = monster.body.lock().expect("poisoned");
            let old = body.coord;
            if !body.dead {
                move_monster(server, &mut body, dt);
            }
            let moved = body.coord != old;
            let report = full_report || moved || body.updated_stats;
            body.updated_stats = false;
            (moved, report, body.coord)
        };

        if report {
            for other in server.near_players(monster.entry.pos(), NEAR_OBJECTS) {
                other.send_command(SessionCommand::ObjectMoved(QtHandle::Monster(monster.id)));
            }
            if moved {
                server.monster_qt.move_to(&monster.entry, pos.truncate());
                monster.body.lock().expect("poisoned").prev_coord = pos;
            }
        }

    }

}

/// Move one monster: gravity, then the forward step with a one-block climb
/// allowance; a wall turns the monster instead.
fn move_monster(server: &Server, body: &mut MonsterBody, dt: Duration) {

    body.z_speed = server.cache.update_z_pos(dt, body.z_speed, &mut body.coord, GRAVITY);

    if !body.mv_fwd {
        return;
    }

    let (s, c) = (body.dir_hor as f64).sin_cos();
    let dist = body.speed as f64 * dt.as_secs_f64();
    let mut target = body.coord;
    target.x += s * dist;
    target.y += c * dist;

    if block::is_permeable(server.cache.get_block(target)) {
        body.coord = target;
        body.updated_stats = true;
        return;
    }

    target.z += 1.0;
    if block::is_permeable(server.cache.get_block(target)) {
        body.coord = target;
        body.updated_stats = true;
        return;
    }

    // A wall; turn in place for a while.
    body.turning_dir = std::f32::consts::PI / 12.0;
    body.mv_fwd = false;
    body.state = MonsterState::Turning;

}

/// The targeting tick: monsters without aggro look for players to attack,
/// gated by aggression, level and field of view.
pub fn target_tick(server: &Server) {

    let mut rng = rand::thread_rng();

    for monster in server.monsters.all() {

        let (pos, dir_hor, aggression, level) = {
            let body = monster.body.lock().expect("poisoned");
            if body.aggro.is_some() || body.dead || body.state == MonsterState::Recovering {
                continue;
            }
            (body.coord, body.dir_hor, body.aggression, body.level)
        };

        let near = server.near_players(pos.truncate(), MONSTER_AGGRO_DISTANCE);
        if near.is_empty() {
            continue;
        }

        if 100.0 * rng.gen::<f32>() > aggression {
            continue;
        }

        for session in near {
            let (player_level, player_coord, alive) = {
                let state = session.state.read().expect("poisoned");
                (state.record.level, state.record.coord, state.conn == ConnState::In && !state.record.dead)
            };
            if !alive {
                continue;
            }

            let mut body = monster.body.lock().expect("poisoned");
            let (dir, dist2) = body.dir_toward(player_coord);
            let mut delta = (dir - dir_hor).abs();
            if delta > std::f32::consts::PI {
                delta = (delta - std::f32::consts::TAU).abs();
            }

            if dist2 >= MONSTER_AGGRO_DISTANCE * MONSTER_AGGRO_DISTANCE {
                // The quadtree ignores height; the real distance can fail.
                continue;
            }

            if player_level > level + 3 || level < combat::AGGRESSIVE_LEVEL_START {
                // Too strong a player (or too meek a monster): just stare.
                body.dir_hor = dir;
                body.mv_fwd = false;
            } else if delta < MONSTER_FIELD_OF_VIEW {
                session.send_packet(&OutPacket::AggroFromMonster { monster: monster.id });
                body.aggro = Some(session.uid());
                body.state = MonsterState::Attacking;
                body.speed = ASSAULT_FACTOR * body.max_speed;
            }
            break;

        }

    }

}

/// The melee tick: every monster with aggro in range lands a hit through the
/// target's command queue; far targets lose the aggro.
pub fn melee_tick(server: &Server) {

    for monster in server.monsters.all() {

        let (aggro, coord, level, dead) = {
            let body = monster.body.lock().expect("poisoned");
            (body.aggro, body.coord, body.level, body.dead)
        };
        let Some(uid) = aggro else { continue };
        if dead {
            continue;
        }

        let Some(session) = server.sessions.by_uid(uid) else {
            monster.body.lock().expect("poisoned").aggro = None;
            continue;
        };
        let (player_coord, gone) = {
            let state = session.state.read().expect("poisoned");
            (state.record.coord, state.conn != ConnState::In || state.record.dead)
        };
        if gone {
            monster.body.lock().expect("poisoned").aggro = None;
            continue;
        }

        let dist2 = coord.distance_squared(player_coord);
        if dist2 > MELEE_DIST_LIMIT * MELEE_DIST_LIMIT {
            if dist2 > MONSTER_AGGRO_DISTANCE * MONSTER_AGGRO_DISTANCE {
                monster.body.lock().expect("poisoned").aggro = None;
            }
            continue;
        }

        session.send_command(SessionCommand::HitByMonster {
            monster_id: monster.id,
            monster_level: level,
            weapon_dmg: 1.0,
        });

    }

}

/// The purge tick, two passes: mark monsters that are dead or have no
/// players near, then remove the marked ones under the exclusive map lock.
/// Quadtree removal happens after the map lock is gone.
pub fn purge_tick(server: &Server) {

    for monster in server.monsters.all() {
        let near_player = server.player_qt.find_near(monster.entry.pos(), NEAR_OBJECTS)
            .iter()
            .any(|e| matches!(e.handle, QtHandle::Player(_)));
        let mut body = monster.body.lock().expect("poisoned");
        if body.dead || !near_player {
            body.purge = true;
        }
    }

    let purged: Vec<Arc<Monster>> = {
        let mut inner = server.monsters.inner.write().expect("poisoned");
        let ids: Vec<u32> = inner.iter()
            .filter(|(_, m)| m.body.lock().expect("poisoned").purge)
            .map(|(&id, _)| id)
            .collect();
        ids.iter().filter_map(|id| inner.remove(id)).collect()
    };

    for monster in purged {
        server.monster_qt.remove(&monster.entry);
        monster.invalid.store(true, Ordering::Relaxed);
        debug!("purged monster {}", monster.id);
    }

}

/// A player swing lands on a monster. On a kill the player gets experience
/// (tripled and more at the lowest levels), a kill count, and a roll on the
/// drop table.
pub fn hit_monster(server: &Server, session: &Arc<Session>, monster: &Arc<Monster>, weapon_dmg: f32) {

    let (player_level, weapon) = {
        let state = session.state.read().expect("poisoned");
        (state.record.level, (state.record.weapon.level, state.record.weapon.grade))
    };

    let (damage, died, monster_level) = {
        let mut body = monster.body.lock().expect("poisoned");
        let damage = combat::player_hit_damage(body.level, player_level, weapon_dmg, weapon);
        body.hit_points -= damage;
        body.updated_stats = true;
        let died = body.hit_points <= 0.0;
        if died {
            body.hit_points = 0.0;
            body.dead = true;
        }
        (damage, died, body.level)
    };

    if died {
        let experience = {
            let mut exp = combat::experience_for_kill(player_level, monster_level);
            // Give more experience to the lowest levels.
            exp *= match player_level {
                0 => 5.0,
                1 => 2.5,
                2 => 1.5,
                _ => 1.0,
            };
            exp
        };

        let drops = {
            let mut state = session.state.write().expect("poisoned");
            state.flags &= !crate::proto::USER_FLAG_IN_FIGHT;
            state.record.num_kill += 1;
            state.record.add_experience(experience);
            state.updated_stats = true;

            // Adjust the drop probability so a level of kills drops about
            // one item.
            let modifier = combat::experience_same_level() / experience;
            let drops = item::roll_drops(state.record.level, modifier, &mut rand::thread_rng());
            for drop in &drops {
                state.record.inventory.add_one(drop.code, drop.level);
            }
            drops
        };

        for drop in drops {
            let count = {
                let state = session.state.read().expect("poisoned");
                state.record.inventory.find(drop.code, drop.level).map_or(0, |s| s.count.min(255) as u8)
            };
            session.send_packet(&OutPacket::UpdateInventory {
                code: drop.code,
                count,
                level: drop.level,
            });
        }
    }

    session.send_packet(&OutPacket::HitMonster {
        monster: monster.id,
        damage: (damage * 255.0 + 0.5) as u8,
    });

}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn map_assigns_unique_ids() {
        let map = MonsterMap::new();
        let a = map.insert(MonsterBody::spawn(0, DVec3::ZERO, 0.0));
        let b = map.insert(MonsterBody::spawn(0, DVec3::ZERO, 0.0));
        assert_ne!(a.id, b.id);
        assert_eq!(map.len(), 2);
        assert!(map.get(a.id).is_some());
    }

}
