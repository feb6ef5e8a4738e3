//! The player and monster records.
//!
//! `PlayerRecord` is what the document store persists per player; everything
//! else about a connected player is volatile session state owned by the
//! server crate. Monsters are never persisted at all.

use glam::DVec3;
use serde::{Deserialize, Serialize};

use crate::item::{self, Inventory, ItemKind, ObjectCode};
use crate::keys::KeyRing;

/// Default number of chunks a player can own.
pub const DEFAULT_MAX_CHUNKS: u32 = 10;

/// One equipment slot: the grade of the item and the level at which it was
/// found. Grade 0 is the bare default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquipSlot {
    pub grade: u8,
    pub level: u32,
}

/// The persistent player document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerRecord {
    pub name: String,
    /// Feet position.
    pub coord: DVec3,
    /// Horizontal looking direction in radians, north is zero.
    pub dir_hor: f32,
    /// Vertical looking direction in radians, horizontal is zero.
    pub dir_vert: f32,
    /// Upward movement speed.
    pub z_speed: f64,
    pub admin_level: u8,
    pub flying: bool,
    pub climbing: bool,
    pub dead: bool,
    pub weapon: EquipSlot,
    pub armor: EquipSlot,
    pub helmet: EquipSlot,
    pub level: u32,
    /// Experience toward the next level, 0..1.
    pub exp: f32,
    /// Hit points, 0..1; 0 is dead.
    pub hit_points: f32,
    /// Mana, 0..1.
    pub mana: f32,
    pub num_kill: u32,
    /// Home spawn, if any.
    pub home_sp: DVec3,
    /// Where the player revives after death.
    pub revive_sp: DVec3,
    /// Used by targeting mechanisms.
    pub target_coor: DVec3,
    /// Max number of chunks this player can own.
    pub max_chunks: u32,
    pub block_add: u32,
    pub block_rem: u32,
    /// Total time online, in seconds.
    pub time_online: u32,
    pub head: u16,
    pub body: u16,
    pub keys: KeyRing,
    /// Players notified when this one logs in or out.
    pub listeners: Vec<u32>,
    pub inventory: Inventory,
}

impl Default for PlayerRecord {
    fn default() -> Self {
        Self {
            name: String::new(),
            coord: DVec3::ZERO,
            dir_hor: 0.0,
            dir_vert: 0.0,
            z_speed: 0.0,
            admin_level: 0,
            flying: false,
            climbing: false,
            dead: false,
            weapon: EquipSlot::default(),
            armor: EquipSlot::default(),
            helmet: EquipSlot::default(),
            level: 0,
            exp: 0.0,
            hit_points: 1.0,
            mana: 1.0,
            num_kill: 0,
            home_sp: DVec3::ZERO,
            revive_sp: DVec3::ZERO,
            target_coor: DVec3::ZERO,
            max_chunks: DEFAULT_MAX_CHUNKS,
            block_add: 0,
            block_rem: 0,
            time_online: 0,
            head: 0,
            body: 0,
            keys: KeyRing::default(),
            listeners: Vec::new(),
            inventory: Inventory::default(),
        }
    }
}

/// What happened when an inventory item was used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UseOutcome {
    /// The item was consumed from the inventory.
    pub consumed: bool,
    /// Near players should be told, because the looks changed.
    pub broadcast: bool,
}

const NO_USE: UseOutcome = UseOutcome { consumed: false, broadcast: false };

impl PlayerRecord {

    /// Add experience, leveling up when it crosses 1.
    pub fn add_experience(&mut self, exp: f32) {
        self.exp += exp;
        if self.exp > 1.0 {
            self.level += 1;
            self.exp -= 1.0;
        }
    }

    /// Heal the given amount (capped at full) for a mana cost. True when any
    /// healing took effect.
    pub fn heal(&mut self, heal: f32, mana_cost: f32) -> bool {
        let heal = heal.min(1.0 - self.hit_points);
        if heal > 0.0 {
            self.hit_points += heal;
            self.mana -= mana_cost;
            true
        } else {
            false
        }
    }

    /// Restore mana, capped at full. True when anything was restored.
    pub fn add_mana(&mut self, mana: f32) -> bool {
        let mana = mana.min(1.0 - self.mana);
        if mana > 0.0 {
            self.mana += mana;
            true
        } else {
            false
        }
    }

    /// Use an inventory item. Equipment upgrades move the replaced item back
    /// into the inventory; an inferior item fails the use. Dead players can
    /// only fail.
    pub fn use_item(&mut self, code: ObjectCode, level: u32) -> UseOutcome {

        if self.inventory.find(code, level).is_none() {
            return NO_USE;
        }

        match code.kind() {
            Some(ItemKind::Potion) => {
                if self.dead {
                    return NO_USE;
                }
                let restored = if code == item::HEALTH_POTION {
                    self.heal(0.3, 0.0)
                } else {
                    self.add_mana(0.3)
                };
                if restored {
                    self.inventory.remove_one(code, level);
                }
                UseOutcome { consumed: restored, broadcast: false }
            }
            Some(ItemKind::Scroll) => {
                if self.dead {
                    return NO_USE;
                }
                self.revive_sp = self.coord;
                self.inventory.remove_one(code, level);
                UseOutcome { consumed: true, broadcast: false }
            }
            Some(ItemKind::Weapon) => self.equip(code, level, |pl| &mut pl.weapon, ObjectCode::weapon),
            Some(ItemKind::Armor) => self.equip(code, level, |pl| &mut pl.armor, ObjectCode::armor),
            Some(ItemKind::Helmet) => self.equip(code, level, |pl| &mut pl.helmet, ObjectCode::helmet),
            None => NO_USE,
        }

    }

    /// Equip an item into a slot when it beats the current one, putting the
    /// replaced item back in the inventory. `new_level + new_grade` must
    /// reach `current_level + current_grade`.
    fn equip(
        &mut self,
        code: ObjectCode,
        level: u32,
        slot: impl Fn(&mut Self) -> &mut EquipSlot,
        make_code: impl Fn(u8) -> ObjectCode,
    ) -> UseOutcome {
        let grade = code.grade().unwrap_or(0);
        let current = *slot(self);
        if level + (grade as u32) < current.level + current.grade as u32 {
            return NO_USE;
        }
        self.inventory.add_one(make_code(current.grade), current.level);
        *slot(self) = EquipSlot { grade, level };
        self.inventory.remove_one(code, level);
        UseOutcome { consumed: true, broadcast: true }
    }

    /// True for reserved test player names.
    pub fn is_test_player(name: &str) -> bool {
        name.starts_with("test")
    }

}

/// The monster state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MonsterState {
    #[default]
    Normal,
    Strolling,
    Turning,
    Hostile,
    Attacking,
    Defending,
    Recovering,
    GoHome,
}

// Monster speed attributes, as factors of the max speed.
pub const WALKING_FACTOR: f32 = 0.50;
pub const RUNNING_FACTOR: f32 = 0.75;
pub const ASSAULT_FACTOR: f32 = 1.00;
pub const PANIC_FACTOR: f32 = 1.10;

/// Blocks per second of a running player, also the reference for monster
/// speeds.
pub const RUNNING_SPEED: f32 = 4.0;

/// The mutable body of a monster. The id and quadtree entry live outside, in
/// the monster map; this part is always mutated under the per-monster lock.
#[derive(Debug, Clone)]
pub struct MonsterBody {
    pub level: u32,
    /// Hit points 0..1.
    pub hit_points: f32,
    /// Body height in blocks, 1..5.5.
    pub size: f32,
    pub max_speed: f32,
    /// Current speed, some factor of the max.
    pub speed: f32,
    /// How long the monster keeps chasing, budgeted into `fatigue`.
    pub persistence: f32,
    pub fatigue: f32,
    /// 0..100 chance per targeting pass of initiating an attack.
    pub aggression: f32,
    pub state: MonsterState,
    /// Uid of the player that has aggro, if any.
    pub aggro: Option<u32>,
    pub coord: DVec3,
    pub prev_coord: DVec3,
    pub spawn_coord: DVec3,
    pub z_speed: f64,
    /// Horizontal heading in radians.
    pub dir_hor: f32,
    /// Applied turn when the monster is in the turning state.
    pub turning_dir: f32,
    /// Moving in the looking direction; monsters do not strafe.
    pub mv_fwd: bool,
    pub dead: bool,
    pub purge: bool,
    /// Set when stats changed and near clients have to be told.
    pub updated_stats: bool,
}

impl MonsterBody {

    /// Create a monster at a position. Size and aggression derive
    /// deterministically from the level; the client runs the same size
    /// formula, so it cannot change on only one side.
    pub fn spawn(level: u32, coord: DVec3, dir_hor: f32) -> Self {
        let size = Self::size_for_level(level);
        let max_speed = RUNNING_SPEED * (-size * 0.1 + 1.35);
        Self {
            level,
            hit_points: 1.0,
            size,
            max_speed,
            speed: WALKING_FACTOR * max_speed,
            persistence: 100.0,
            fatigue: 100.0,
            aggression: 50.0 + (level % 5) as f32 * 10.0,
            state: MonsterState::Normal,
            aggro: None,
            coord,
            prev_coord: coord,
            spawn_coord: coord,
            z_speed: 0.0,
            dir_hor,
            turning_dir: 0.0,
            mv_fwd: false,
            dead: false,
            purge: false,
            updated_stats: false,
        }
    }

    /// The body height for a level, from a cheap bit mix.
    pub fn size_for_level(level: u32) -> f32 {
        let rnd = level.wrapping_add(137).wrapping_mul(871);
        let mut rnd2 = (rnd & 0xFF) as f32 / 255.0;
        rnd2 *= rnd2;
        rnd2 *= rnd2;
        1.0 + rnd2 * 4.0
    }

    /// Heading and squared distance from this monster toward a position.
    /// The heading uses the same north-zero convention as players.
    pub fn dir_toward(&self, target: DVec3) -> (f32, f64) {
        let d = target - self.coord;
        let mut dir = if d.y == 0.0 {
            if d.x > 0.0 { std::f32::consts::FRAC_PI_2 } else { -std::f32::consts::FRAC_PI_2 }
        } else {
            f64::atan2(d.x, d.y) as f32
        };
        if dir < 0.0 {
            dir += std::f32::consts::TAU;
        }
        (dir, d.length_squared())
    }

}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn equipment_upgrade_rules() {
        let mut pl = PlayerRecord { level: 5, ..Default::default() };
        pl.inventory.add_one(ObjectCode::weapon(2), 5);

        let outcome = pl.use_item(ObjectCode::weapon(2), 5);
        assert!(outcome.consumed && outcome.broadcast);
        assert_eq!(pl.weapon, EquipSlot { grade: 2, level: 5 });
        // The bare hands went back to the inventory.
        assert!(pl.inventory.find(ObjectCode::weapon(0), 0).is_some());

        // An inferior item is refused and stays in the inventory.
        pl.inventory.add_one(ObjectCode::weapon(1), 4);
        let outcome = pl.use_item(ObjectCode::weapon(1), 4);
        assert!(!outcome.consumed);
        assert_eq!(pl.weapon, EquipSlot { grade: 2, level: 5 });
        assert!(pl.inventory.find(ObjectCode::weapon(1), 4).is_some());
    }

    #[test]
    fn potions_only_help_when_needed() {
        let mut pl = PlayerRecord::default();
        pl.inventory.add_one(item::HEALTH_POTION, 0);
        // Already at full health: not consumed.
        assert!(!pl.use_item(item::HEALTH_POTION, 0).consumed);
        pl.hit_points = 0.5;
        assert!(pl.use_item(item::HEALTH_POTION, 0).consumed);
        assert!((pl.hit_points - 0.8).abs() < 1e-6);
        assert!(pl.inventory.find(item::HEALTH_POTION, 0).is_none());
    }

    #[test]
    fn scroll_moves_the_revive_point() {
        let mut pl = PlayerRecord::default();
        pl.coord = DVec3::new(10.0, 20.0, 30.0);
        pl.inventory.add_one(item::RES_SCROLL, 2);
        assert!(pl.use_item(item::RES_SCROLL, 2).consumed);
        assert_eq!(pl.revive_sp, pl.coord);
    }

    #[test]
    fn experience_levels_up() {
        let mut pl = PlayerRecord::default();
        pl.add_experience(0.6);
        assert_eq!(pl.level, 0);
        pl.add_experience(0.6);
        assert_eq!(pl.level, 1);
        assert!((pl.exp - 0.2).abs() < 1e-6);
    }

    #[test]
    fn monster_size_is_deterministic_and_bounded() {
        for level in 0..100 {
            let size = MonsterBody::size_for_level(level);
            assert!((1.0..=5.5).contains(&size), "level {level} size {size}");
            assert_eq!(size, MonsterBody::size_for_level(level));
        }
    }

    #[test]
    fn dir_toward_is_north_zero() {
        let m = MonsterBody::spawn(0, DVec3::ZERO, 0.0);
        let (north, _) = m.dir_toward(DVec3::new(0.0, 5.0, 0.0));
        assert!(north.abs() < 1e-6);
        let (east, d2) = m.dir_toward(DVec3::new(5.0, 0.0, 0.0));
        assert!((east - std::f32::consts::FRAC_PI_2).abs() < 1e-6);
        assert!((d2 - 25.0).abs() < 1e-9);
    }

    #[test]
    fn record_document_round_trip() {
        let mut pl = PlayerRecord { name: "ada".into(), level: 3, ..Default::default() };
        pl.inventory.add_one(item::MANA_POTION, 1);
        pl.keys.add(crate::keys::Key { owner: 7, kid: 1, descr: "gate".into(), view: 2 });
        let json = serde_json::to_string(&pl).unwrap();
        let back: PlayerRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "ada");
        assert_eq!(back.level, 3);
        assert!(back.keys.test(7, 1));
        assert!(back.inventory.find(item::MANA_POTION, 1).is_some());
    }

}
