//! Chat input: plain lines go to near players, lines with a leading slash
//! are commands.

use std::sync::Arc;

use voxworld::block;
use voxworld::combat;
use voxworld::entity::PlayerRecord;
use voxworld::geom;
use voxworld::quadtree::QtHandle;

use crate::config::NEAR_OBJECTS;
use crate::player::{SessionCommand, SessionRunner};

/// Entry point for the message command.
pub fn handle_message(runner: &mut SessionRunner, text: &str) {
    if let Some(rest) = text.strip_prefix('/') {
        let parts: Vec<&str> = rest.split_whitespace().collect();
        if let Err(message) = handle_command(runner, &parts) {
            runner.printf(message);
        }
    } else if !text.is_empty() {
        chat(runner, text);
    }
}

/// Relay a chat line to everyone near, tagged with the speaker.
fn chat(runner: &mut SessionRunner, text: &str) {
    let (name, coord) = {
        let state = runner.session.state.read().expect("poisoned");
        (state.record.name.clone(), state.record.coord)
    };
    let line = format!("{name}: {text}");
    for other in runner.server.near_players(coord.truncate(), NEAR_OBJECTS) {
        if Arc::ptr_eq(&other, &runner.session) {
            runner.printf(line.clone());
        } else {
            other.send_command(SessionCommand::Message(line.clone()));
        }
    }
}

fn handle_command(runner: &mut SessionRunner, parts: &[&str]) -> Result<(), String> {
    match *parts {
        ["territory"] => territory_list(runner),
        ["territory", "claim"] => territory_claim(runner, None),
        ["territory", "claim", dir] => territory_claim(runner, Some(dir)),
        ["territory", "grant", uid] => territory_grant(runner, uid),
        ["territory", ..] => Err("Usage: /territory [claim [dir] | grant <uid>]".into()),
        ["friend", "add", name] => friend_add(runner, name),
        ["friend", "remove", name] => friend_remove(runner, name),
        ["friend", ..] => Err("Usage: /friend add|remove <name>".into()),
        ["tell", name, ..] => tell(runner, name, &parts[2..]),
        ["fly"] => toggle_fly(runner),
        ["revive"] => revive(runner),
        ["status"] => status_report(runner),
        _ => Err("Unknown command!".into()),
    }
}

fn territory_list(runner: &mut SessionRunner) -> Result<(), String> {
    let (uid, max) = {
        let state = runner.session.state.read().expect("poisoned");
        (state.uid, state.record.max_chunks)
    };
    let territory = runner.server.store.load_territory(uid);
    let list: Vec<String> = territory.iter().map(|cc| format!("({},{},{})", cc.x, cc.y, cc.z)).collect();
    runner.printf(format!("Territory ({} of {}): {}", territory.len(), max, list.join(" ")));
    Ok(())
}

/// Claim the chunk the player stands in (or the adjacent one named by the
/// direction): unowned, within the chunk allowance, matching the area
/// difficulty, and adjacent to owned territory unless it is the first.
fn territory_claim(runner: &mut SessionRunner, dir: Option<&str>) -> Result<(), String> {

    let (uid, name, admin, level, max_chunks, coord) = {
        let state = runner.session.state.read().expect("poisoned");
        (
            state.uid,
            state.record.name.clone(),
            state.record.admin_level,
            state.record.level,
            state.record.max_chunks,
            state.record.coord,
        )
    };

    let mut territory = runner.server.store.load_territory(uid);

    if admin < 1 && territory.len() >= max_chunks as usize {
        return Err(format!("#FAIL !You are not allowed more chunks than {max_chunks}"));
    }
    if PlayerRecord::is_test_player(&name) || uid >= block::OWNER_RESERVED {
        return Err("#FAIL !Test players can't claim territory".into());
    }
    if combat::monster_difficulty(coord) > level && admin == 0 {
        return Err("#FAIL !You are too low level for this area".into());
    }

    let mut cc = geom::calc_chunk_pos(coord);
    match dir {
        None => {}
        Some("up") => cc.z += 1,
        Some("down") => cc.z -= 1,
        Some("west") => cc.x -= 1,
        Some("east") => cc.x += 1,
        Some("south") => cc.y -= 1,
        Some("north") => cc.y += 1,
        Some(_) => return Err("Usage: /territory claim [up|down|north|south|east|west]".into()),
    }

    // Chunk locks are taken strictly one at a time: adjacency first, then
    // the claim itself re-checks ownership before committing.
    let mut approved = territory.is_empty() || admin > 0;
    if !approved {
        approved = runner.server.cache.adjacent(cc).iter()
            .any(|handle| handle.read().owner == uid);
    }
    if !approved {
        return Err("#FAIL !You must allocate adjacent to another of your chunks".into());
    }

    if !runner.server.cache.claim_chunk(cc, uid) {
        return Err(format!("#FAIL !Chunk ({},{},{}) is already allocated", cc.x, cc.y, cc.z));
    }

    if !territory.contains(&cc) {
        territory.push(cc);
    }
    runner.server.store.save_territory(uid, &territory);
    runner.server.scores.set_chunk_count(uid, territory.len());

    runner.printf(format!("!Congratulations, you now own chunk ({},{},{})", cc.x, cc.y, cc.z));
    Ok(())

}

/// Admin override of a chunk's owner.
fn territory_grant(runner: &mut SessionRunner, new_owner: &str) -> Result<(), String> {
    let (admin, coord) = {
        let state = runner.session.state.read().expect("poisoned");
        (state.record.admin_level, state.record.coord)
    };
    if admin < 1 {
        return Err("#FAIL".into());
    }
    let new_owner: u32 = new_owner.parse().map_err(|e| format!("{e}"))?;
    let cc = geom::calc_chunk_pos(coord);
    let previous = runner.server.cache.set_owner(cc, new_owner);
    runner.printf(format!("Changed owner from {previous} to {new_owner}"));
    Ok(())
}

/// Start listening on another player's logins and logouts.
fn friend_add(runner: &mut SessionRunner, name: &str) -> Result<(), String> {
    let uid = runner.session.uid();
    let Some(other) = runner.server.sessions.by_name(name) else {
        return Err(format!("{name} is not logged in"));
    };
    let mut state = other.state.write().expect("poisoned");
    if state.record.listeners.contains(&uid) {
        return Err(format!("Already a friend of {name}"));
    }
    state.record.listeners.push(uid);
    drop(state);
    runner.printf(format!("Following {name}"));
    Ok(())
}

fn friend_remove(runner: &mut SessionRunner, name: &str) -> Result<(), String> {
    let uid = runner.session.uid();
    let Some(other) = runner.server.sessions.by_name(name) else {
        return Err(format!("{name} is not logged in"));
    };
    let mut state = other.state.write().expect("poisoned");
    match state.record.listeners.iter().position(|&l| l == uid) {
        Some(index) => {
            state.record.listeners.swap_remove(index);
            Ok(())
        }
        None => Err(format!("Not a friend of {name}")),
    }
}

/// Private message to a named player.
fn tell(runner: &mut SessionRunner, name: &str, words: &[&str]) -> Result<(), String> {
    let Some(other) = runner.server.sessions.by_name(name) else {
        return Err(format!("{name} is not logged in"));
    };
    let from = runner.session.state.read().expect("poisoned").record.name.clone();
    other.send_command(SessionCommand::Message(format!("{from} tells you: {}", words.join(" "))));
    Ok(())
}

/// Flying is for admins and for owners inside their own territory; the
/// movement code drops it again outside.
fn toggle_fly(runner: &mut SessionRunner) -> Result<(), String> {
    let flying = {
        let mut state = runner.session.state.write().expect("poisoned");
        state.record.flying = !state.record.flying;
        state.record.flying
    };
    runner.printf(if flying { "Flying on" } else { "Flying off" });
    Ok(())
}

/// Return a dead player to the revive spawn with a sliver of health.
fn revive(runner: &mut SessionRunner) -> Result<(), String> {
    let uid = {
        let mut state = runner.session.state.write().expect("poisoned");
        if !state.record.dead {
            return Err("You are not dead".into());
        }
        state.record.coord = state.record.revive_sp;
        state.record.dead = false;
        state.record.hit_points = 0.3;
        state.updated_stats = true;
        state.uid
    };
    for other in runner.server.near_players(
        runner.session.state.read().expect("poisoned").record.coord.truncate(),
        NEAR_OBJECTS,
    ) {
        other.send_command(SessionCommand::ObjectMoved(QtHandle::Player(uid)));
    }
    Ok(())
}

/// Admin dump of the observability registries.
fn status_report(runner: &mut SessionRunner) -> Result<(), String> {
    let admin = runner.session.state.read().expect("poisoned").record.admin_level;
    if admin < 1 {
        return Err("#FAIL".into());
    }

    let mut out = Vec::new();
    runner.server.timers.report(&mut out).map_err(|e| e.to_string())?;
    runner.server.scores.report(&mut out).map_err(|e| e.to_string())?;
    let lines: Vec<String> = String::from_utf8_lossy(&out).lines().map(str::to_string).collect();
    for line in lines {
        runner.printf(line);
    }
    runner.printf(runner.server.traffic.summary());
    runner.printf(format!(
        "{} players, {} monsters, {} chunks cached",
        runner.server.sessions.count(),
        runner.server.monsters.len(),
        runner.server.cache.len(),
    ));
    Ok(())
}
