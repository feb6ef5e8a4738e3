//! Server tuning constants and the runtime configuration.
//!
//! Durations are fixed constants; everything an operator reasonably changes
//! lives in [`Config`], populated from the command line and an optional
//! config file.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// How often player and monster positions are updated; also the session
/// socket read deadline.
pub const OBJECTS_UPDATE_PERIOD: Duration = Duration::from_millis(100);
/// How often a monster re-evaluates which player to aggro.
pub const MONSTER_TARGET_PERIOD: Duration = Duration::from_secs(5);
/// How often the monster state machines advance.
pub const MONSTER_STATE_PERIOD: Duration = Duration::from_secs(1);
/// How often attacks (or idle healing) are evaluated.
pub const ATTACK_PERIOD: Duration = Duration::from_secs(1);
/// Autosave of all online players.
pub const AUTOSAVE_PERIOD: Duration = Duration::from_secs(300);
/// Sweep period of the chunk cache.
pub const CHUNK_PURGE_PERIOD: Duration = Duration::from_millis(100);
/// Period between monster purges.
pub const MONSTER_PURGE_PERIOD: Duration = Duration::from_secs(30);
/// Period between monster spawn attempts.
pub const MONSTER_SPAWN_PERIOD: Duration = Duration::from_secs(10);
/// Period between score decay/persist passes.
pub const SCORE_UPDATE_PERIOD: Duration = Duration::from_secs(100);
/// Period between traffic average updates.
pub const TRAFFIC_PERIOD: Duration = Duration::from_secs(30);
/// Time to heal from zero to full when idle.
pub const HEALING_PERIOD: Duration = Duration::from_secs(120);

/// Default seconds until an activator can fire again.
pub const DEFAULT_TRIGGER_BLOCK_TIME: u32 = 10;
/// Seconds a jelly block stays passable.
pub const JELLY_TIMEOUT: u32 = 15;
/// Probability per state tick that an idle monster keeps standing still.
pub const MONSTER_MOVING_PROB: f32 = 0.6;
/// Maximum number of logged in players.
pub const MAX_PLAYERS: usize = 2000;
/// Gravity, blocks per second squared.
pub const GRAVITY: f64 = 5.0;
/// Blocks away that random monsters spawn.
pub const MONSTER_SPAWN_DISTANCE: f64 = 25.0;
/// Monsters inside this distance count against the spawn limit.
pub const MONSTER_SPAWN_CHECK_DIST: f64 = 40.0;
/// How close a monster must be to give aggro.
pub const MONSTER_AGGRO_DISTANCE: f64 = 20.0;
/// The viewing angle of a monster, in radians.
pub const MONSTER_FIELD_OF_VIEW: f32 = 1.40;
/// Max distance for melee hits.
pub const MELEE_DIST_LIMIT: f64 = 4.0;
/// Monsters spawn within this height difference of the player.
pub const MONSTER_SPAWN_HEIGHT_DIFF: f64 = 6.0;
/// No new monsters spawn when at least this many are near.
pub const MONSTER_LIMIT_FOR_RESPAWN: usize = 3;
/// Everything within this distance is reported to clients.
pub const NEAR_OBJECTS: f64 = 64.0;
/// How much quicker flying is than walking.
pub const FLYING_SPEED_FACTOR: f64 = 3.0;
/// Player height in blocks (1.8 m at two blocks per meter).
pub const PLAYER_HEIGHT: f64 = 3.6;
/// Initial upward speed of a jump, blocks per second.
pub const PLAYER_JUMP_SPEED: f64 = 2.0;
/// Name prefix of password-less test players.
pub const TEST_PLAYER_PREFIX: &str = "test";
/// Density used when placing test players over the world.
pub const TEST_PLAYERS_PER_CHUNK: f64 = 1.0;
/// Bound of the per-session outbound queues.
pub const CLIENT_CHANNEL_SIZE: usize = 100;
/// Mana needed for the healing spell.
pub const MANA_FOR_HEALING: f32 = 0.35;
/// Health restored by the healing spell.
pub const HEALTH_AT_HEALING_SPELL: f32 = 0.3;
/// Mana needed for the combination attack.
pub const MANA_FOR_COMB_ATTACK: f32 = 0.15;
/// Damage of the combination attack.
pub const WEAPON_DMG_COMB_ATTACK: f32 = 1.5;
/// Experience multiplier for the value of a dropped item.
pub const ITEM_REWARD_NORMALIZER: f32 = 0.02;
/// A player must move 128 blocks in foreign territory to award 1 point.
pub const SCORE_MOVE_FACT: f64 = 1.0 / 128.0;
/// Five monster kills in foreign territory award 1 point.
pub const SCORE_DAMAGE_FACT: f64 = 1.0 / 5.0;
/// Chunk requests further than this many chunks away are refused.
pub const MAX_CHUNK_REQ_DIST: i32 = 10;
/// Protocol version reported to clients.
pub const PROT_VERSION_MAJOR: u16 = 5;
pub const PROT_VERSION_MINOR: u16 = 2;

/// Runtime configuration assembled in `main` from CLI flags and the config
/// file.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the listener binds.
    pub listen_addr: String,
    /// Folder for chunk files.
    pub chunk_folder: PathBuf,
    /// Folder for super chunk files.
    pub super_chunk_folder: PathBuf,
    /// Folder for the player document store.
    pub player_folder: PathBuf,
    /// Allow `testN` logins without a password.
    pub allow_test_user: bool,
    /// Source addresses allowed to use test logins; empty allows all.
    pub test_ip_list: Vec<String>,
    /// Read-only world: generate air, never write chunk files.
    pub inhibit_create: bool,
    /// File whose lines are sent to players after login.
    pub welcome_file: PathBuf,
    /// Salt applied to passwords before hashing, shared with the account
    /// frontend.
    pub password_salt: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:57862".into(),
            chunk_folder: "DB".into(),
            super_chunk_folder: "SDB".into(),
            player_folder: "PDB".into(),
            allow_test_user: false,
            test_ip_list: Vec::new(),
            inhibit_create: false,
            welcome_file: "welcome.txt".into(),
            password_salt: String::new(),
        }
    }
}

/// The optional on-disk part of the configuration.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    /// Source addresses allowed to use test logins.
    #[serde(default)]
    pub test_ip: Vec<String>,
    /// Password salt shared with the account frontend.
    #[serde(default)]
    pub password_salt: String,
}

impl ConfigFile {

    /// Load the file, treating a missing file as the default configuration.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        match fs::read_to_string(path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

}
