//! The trigger/activator subsystem: detecting trigger edges under a player's
//! feet and interpreting the little line-based command language attached to
//! text activators.
//!
//! Nothing is locked when a trigger fires. Chunks, players and monsters are
//! all touched, but never under the same lock: the activator list is copied
//! out under the chunk's read lock, interpreted lock-free, and the new
//! inhibit deadlines are written back under the chunk's write lock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::DVec3;
use tracing::debug;

use voxworld::block::{self, Block};
use voxworld::entity::MonsterState;
use voxworld::geom;
use voxworld::item::ObjectCode;
use voxworld::keys::Key;

use crate::config::{DEFAULT_TRIGGER_BLOCK_TIME, JELLY_TIMEOUT, NEAR_OBJECTS};
use crate::monster;
use crate::player::{Session, SessionCommand};
use crate::proto::OutPacket;
use crate::server::Server;

/// Detect a fresh trigger edge under the player's feet and fire the linked
/// activators. The previous feet block is remembered per session, so walking
/// within one trigger region fires at most once.
pub fn check_triggers(server: &Arc<Server>, session: &Arc<Session>, bl: Block) {

    let (coord, fire) = {
        let mut state = session.state.write().expect("poisoned");
        let mut fire = !state.record.dead;
        match bl {
            block::TRIGGER if state.trap_prev_block == block::TRIGGER => fire = false,
            block::DE_TRIGGER if state.trap_prev_block == block::DE_TRIGGER => fire = false,
            block::TRIGGER | block::DE_TRIGGER => {}
            _ => fire = false,
        }
        state.trap_prev_block = bl;
        (state.record.coord, fire)
    };
    if !fire {
        return;
    }

    let cc = geom::calc_chunk_pos(coord);
    let offset = geom::calc_block_offset(coord, cc);
    let handle = server.cache.find(cc);

    // Copy the eligible activators out so the chunk can unlock before any
    // other subsystem is touched.
    struct Pending {
        pos: (u8, u8, u8),
        messages: Vec<String>,
        inhibit: u32,
    }

    let now = Instant::now();
    let (owner, mut pending) = {
        let chunk = handle.read();
        let pending: Vec<Pending> = chunk.trigger_links.iter()
            .filter(|link| link.trigger == offset)
            .filter_map(|link| {
                let (x, y, z) = link.activator;
                let activator = chunk.find_activator(x, y, z)?;
                if activator.inhibit_until.is_some_and(|t| t > now) {
                    return None;
                }
                Some(Pending {
                    pos: link.activator,
                    messages: activator.messages.clone(),
                    inhibit: DEFAULT_TRIGGER_BLOCK_TIME,
                })
            })
            .collect();
        (chunk.owner, pending)
    };

    for entry in &mut pending {
        let ac = geom::block_world_pos(cc, entry.pos.0, entry.pos.1, entry.pos.2);
        let mut recipients: Vec<Arc<Session>> = vec![Arc::clone(session)];
        for line in &entry.messages {
            let outcome = evaluate_line(server, session, line, ac, &mut recipients, owner);
            if outcome.terminate {
                break;
            }
            if let Some(inhibit) = outcome.inhibit {
                entry.inhibit = inhibit;
            }
        }
    }

    if !pending.is_empty() {
        let mut chunk = handle.write();
        for entry in &pending {
            if let Some(activator) = chunk.find_activator_mut(entry.pos.0, entry.pos.1, entry.pos.2) {
                activator.inhibit_until = Some(now + Duration::from_secs(entry.inhibit as u64));
            }
        }
    }

}

/// What one line of an activator message did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LineOutcome {
    /// A new reactivation delay in seconds, when the line set one.
    pub inhibit: Option<u32>,
    /// The rest of this activator's lines are skipped.
    pub terminate: bool,
}

/// Interpret one line: consume leading `/` directives, then show whatever
/// text remains to every recipient.
pub fn evaluate_line(
    server: &Arc<Server>,
    up: &Arc<Session>,
    line: &str,
    ac: DVec3,
    recipients: &mut Vec<Arc<Session>>,
    owner: u32,
) -> LineOutcome {

    let mut outcome = LineOutcome::default();
    let mut line = line;

    while line.starts_with('/') {
        let (word, rest) = match line.split_once(' ') {
            Some((word, rest)) => (word, rest),
            None => (line, ""),
        };

        let (level, admin) = {
            let state = up.state.read().expect("poisoned");
            (state.record.level, state.record.admin_level)
        };

        if let Some(lim) = word.strip_prefix("/level>") {
            if let Ok(lim) = lim.parse::<u32>() {
                if level <= lim {
                    outcome.terminate = true;
                    return outcome;
                }
            }
        } else if let Some(lim) = word.strip_prefix("/level<") {
            if let Ok(lim) = lim.parse::<u32>() {
                if level >= lim {
                    outcome.terminate = true;
                    return outcome;
                }
            }
        } else if let Some(lim) = word.strip_prefix("/admin>") {
            if let Ok(lim) = lim.parse::<u8>() {
                if admin <= lim {
                    outcome.terminate = true;
                    return outcome;
                }
            }
        } else if let Some(args) = word.strip_prefix("/keycond:") {
            // The rest of the line is the failure text.
            outcome.terminate = !test_key_condition(up, owner, args, rest);
            return outcome;
        } else if let Some(args) = word.strip_prefix("/addkey:") {
            // The rest of the line is the key description.
            grant_key(recipients, owner, args, rest);
            return outcome;
        } else if let Some(args) = word.strip_prefix("/monster") {
            spawn_activator_monster(server, recipients, args, ac);
        } else if let Some(args) = word.strip_prefix("/invadd:") {
            if let Some(inhibit) = grant_item(recipients, args, ac) {
                outcome.inhibit.get_or_insert(inhibit);
            }
        } else if let Some(args) = word.strip_prefix("/broadcast:") {
            match args.parse::<f64>() {
                Ok(dist) => {
                    *recipients = server.near_players(ac.truncate(), dist.min(20.0));
                }
                Err(e) => debug!("broadcast error {e} at {ac}"),
            }
        } else if let Some(args) = word.strip_prefix("/inhibit:") {
            match args.parse::<u32>() {
                Ok(seconds) => outcome.inhibit = Some(seconds),
                Err(e) => debug!("inhibit error {e} at {ac}"),
            }
        } else if let Some(args) = word.strip_prefix("/jelly:") {
            *recipients = server.near_players(ac.truncate(), NEAR_OBJECTS);
            jelly_block(server, recipients, args, ac);
            // A door must not reopen before it has closed again.
            if outcome.inhibit.unwrap_or(0) < JELLY_TIMEOUT {
                outcome.inhibit = Some(JELLY_TIMEOUT);
            }
        } else {
            debug!("unknown modifier {word}");
        }

        line = rest;
    }

    if !line.is_empty() {
        for recipient in living(recipients) {
            recipient.send_command(SessionCommand::Message(line.to_string()));
        }
    }

    outcome

}

/// `K,O`: pass only when the player holds key `K` of owner `O` (the chunk
/// owner when `O` is absent or unparsable); the fail text goes to the
/// triggering player alone.
fn test_key_condition(up: &Arc<Session>, chunk_owner: u32, args: &str, fail_text: &str) -> bool {
    let Some((kid, owner)) = args.split_once(',') else {
        debug!("bad key condition {args:?}");
        return false;
    };
    let Ok(kid) = kid.parse::<u32>() else {
        debug!("bad key condition {args:?}");
        return false;
    };
    let owner = owner.parse::<u32>().unwrap_or(chunk_owner);
    let held = up.state.read().expect("poisoned").record.keys.test(owner, kid);
    if !held {
        up.send_command(SessionCommand::Message(fail_text.to_string()));
    }
    held
}

/// `K,V`: grant key `K` with view `V`, owned by the chunk owner, to every
/// recipient.
fn grant_key(recipients: &[Arc<Session>], owner: u32, args: &str, descr: &str) {
    let Some((kid, view)) = args.split_once(',') else {
        debug!("bad key {args:?}");
        return;
    };
    let (Ok(kid), Ok(view)) = (kid.parse::<u32>(), view.parse::<u32>()) else {
        debug!("bad key {args:?}");
        return;
    };
    for recipient in living(recipients) {
        recipient.send_command(SessionCommand::GrantKey(Key {
            owner,
            kid,
            descr: descr.to_string(),
            view,
        }));
    }
}

/// `:±D`: spawn a monster at the activator with a level delta, aggro'd on
/// each recipient.
fn spawn_activator_monster(server: &Arc<Server>, recipients: &[Arc<Session>], args: &str, ac: DVec3) {
    let delta = match args {
        ":0" => 0,
        ":+1" => 1,
        ":-1" => -1,
        ":+2" => 2,
        ":-2" => -2,
        other => {
            debug!("unknown monster spawn modifier {other:?}");
            0
        }
    };
    for recipient in living(recipients) {
        let m = monster::spawn_at(server, ac, delta);
        let mut body = m.body.lock().expect("poisoned");
        body.aggro = Some(recipient.uid());
        body.state = MonsterState::Attacking;
    }
}

/// `XXXN`: give each living recipient the item; the reward's cost is paid
/// from the chunk owner's score balance by the recipient's command handler.
/// Returns the grown inhibit time.
fn grant_item(recipients: &[Arc<Session>], args: &str, ac: DVec3) -> Option<u32> {

    let code: ObjectCode = args.to_string().try_into().ok()?;
    code.kind()?;

    // An item level matching the local monster difficulty.
    let level = voxworld::combat::monster_difficulty(ac);
    let quality = match code.grade() {
        Some(g @ 1..=9) => g as f64,
        _ => 0.0,
    };
    let cost = 2f64.powf(quality - 1.0);

    let mut granted = 0u32;
    for recipient in living(recipients) {
        recipient.send_command(SessionCommand::AddItem { code, level, cost });
        granted += 1;
    }

    Some(DEFAULT_TRIGGER_BLOCK_TIME + (1 + cost as u32) * granted * 50)

}

/// The recipients that are alive; dead players never receive activator
/// effects.
fn living(recipients: &[Arc<Session>]) -> impl Iterator<Item = &Arc<Session>> {
    recipients.iter().filter(|r| !r.state.read().expect("poisoned").record.dead)
}

/// `DIR` (n/s/e/w/u/d): turn the adjacent block to jelly and tell everyone
/// near.
fn jelly_block(server: &Arc<Server>, recipients: &[Arc<Session>], direction: &str, ac: DVec3) {

    let mut target = ac;
    match direction {
        "n" => target.y += 1.0,
        "s" => target.y -= 1.0,
        "e" => target.x += 1.0,
        "w" => target.x -= 1.0,
        "u" => target.z += 1.0,
        "d" => target.z -= 1.0,
        other => {
            debug!("unknown jelly direction {other:?}");
            return;
        }
    }

    let cc = geom::calc_chunk_pos(target);
    let (dx, dy, dz) = geom::calc_block_offset(target, cc);
    let handle = server.cache.find(cc);
    handle.turn_to_jelly(dx, dy, dz, Instant::now() + Duration::from_secs(JELLY_TIMEOUT as u64));

    let packet = OutPacket::JellyBlocks {
        timeout: JELLY_TIMEOUT as u8,
        cc,
        dx,
        dy,
        dz,
    };
    for recipient in recipients {
        recipient.send_packet(&packet);
    }

}

#[cfg(test)]
mod tests {

    use voxworld::entity::PlayerRecord;
    use crate::config::Config;
    use crate::db::FileStore;
    use super::*;

    fn test_server(name: &str) -> Arc<Server> {
        let dir = std::env::temp_dir().join(format!("voxworld-act-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let cfg = Config {
            chunk_folder: dir.join("DB"),
            super_chunk_folder: dir.join("SDB"),
            player_folder: dir.join("PDB"),
            inhibit_create: true,
            ..Default::default()
        };
        let store = Box::new(FileStore::new(dir.join("PDB")).unwrap());
        Server::new(cfg, store).unwrap()
    }

    fn test_session(level: u32, admin: u8) -> Arc<Session> {
        let session = Session::new(0);
        {
            let mut state = session.state.write().expect("poisoned");
            state.record = PlayerRecord { level, admin_level: admin, ..Default::default() };
        }
        session
    }

    fn eval(server: &Arc<Server>, session: &Arc<Session>, line: &str) -> LineOutcome {
        let mut recipients = vec![Arc::clone(session)];
        evaluate_line(server, session, line, DVec3::ZERO, &mut recipients, 0)
    }

    #[test]
    fn level_and_admin_conditions() {
        let server = test_server("cond");
        let session = test_session(9, 5);
        assert!(!eval(&server, &session, "/level<10 X").terminate);
        assert!(eval(&server, &session, "/level<9 X").terminate);
        assert!(eval(&server, &session, "/level>9 X").terminate);
        assert!(eval(&server, &session, "/admin>5 X").terminate);
        assert!(!eval(&server, &session, "/admin>4 X").terminate);
    }

    #[test]
    fn inhibit_directive_sets_the_delay() {
        let server = test_server("inhibit");
        let session = test_session(9, 5);
        let outcome = eval(&server, &session, "/inhibit:9 X");
        assert_eq!(outcome.inhibit, Some(9));
        assert!(!outcome.terminate);
    }

    #[test]
    fn jelly_enforces_its_minimum_inhibit() {
        let server = test_server("jelly");
        let session = test_session(1, 0);
        let outcome = eval(&server, &session, "/jelly:u door opens");
        assert_eq!(outcome.inhibit, Some(JELLY_TIMEOUT));
    }

    #[test]
    fn triggers_fire_once_per_pass_and_honor_the_inhibit() {

        let server = test_server("fire");
        let session = test_session(5, 0);

        // Wire a trigger to a text activator in the chunk under the player.
        let handle = server.cache.find(glam::IVec3::ZERO);
        {
            let mut chunk = handle.write();
            chunk.set_raw(5, 5, 5, block::TRIGGER);
            chunk.set_raw(5, 5, 6, block::TEXT);
            chunk.rebuild_links();
            chunk.find_activator_mut(5, 5, 6).unwrap().messages.push("ouch".into());
        }
        {
            let mut state = session.state.write().expect("poisoned");
            state.record.coord = DVec3::new(5.5, 5.5, 5.0);
        }

        let drain = |session: &Arc<Session>| {
            let mut messages = Vec::new();
            while let Some(cmd) = session.try_recv_command() {
                if let SessionCommand::Message(text) = cmd {
                    messages.push(text);
                }
            }
            messages
        };

        // The first step onto the trigger fires.
        check_triggers(&server, &session, block::TRIGGER);
        assert_eq!(drain(&session), ["ouch"]);

        // Standing on the same trigger region does not fire again.
        check_triggers(&server, &session, block::TRIGGER);
        assert!(drain(&session).is_empty());

        // Even a fresh edge stays quiet inside the inhibit window.
        check_triggers(&server, &session, block::AIR);
        check_triggers(&server, &session, block::TRIGGER);
        assert!(drain(&session).is_empty());

    }

    #[test]
    fn key_condition_defaults_to_the_chunk_owner() {
        let server = test_server("keys");
        let session = test_session(3, 0);
        {
            let mut state = session.state.write().expect("poisoned");
            state.record.keys.add(Key { owner: 77, kid: 4, descr: String::new(), view: 0 });
        }
        let mut recipients = vec![Arc::clone(&session)];
        let held = evaluate_line(&server, &session, "/keycond:4,77 no entry", DVec3::ZERO, &mut recipients, 0);
        assert!(!held.terminate);
        let missing = evaluate_line(&server, &session, "/keycond:5,77 no entry", DVec3::ZERO, &mut recipients, 0);
        assert!(missing.terminate);
    }

}
