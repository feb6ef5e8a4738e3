//! Combat arithmetic: damage multipliers, experience, and the difficulty
//! gradient of the world.
//!
//! All hit points are normalized to 0..1, so a multiplier of 0.1 means ten
//! same-level hits kill.

use glam::DVec3;

/// How many same-level hits it takes to kill.
const NUMBER_OF_HITS_TO_KILL: f64 = 10.0;
/// Exponent tuning so one level of difference changes damage by about 30%.
const KILL_ADJUST: f64 = 0.262;
/// Sigmoid offset for the experience of a kill.
const EXP_LEVEL_OFFSET: f64 = -0.7;
/// Multiplicative factor for killing higher level monsters.
const EXP_MULTIPLIER: f64 = 1.5;
/// Experience for killing a monster at the same level.
const EXP_FOR_ONE_MONSTER: f64 = 0.0083;
/// All monsters spawned within this horizontal distance are level 0.
const MONSTER_LEVEL_FREE_ZONE: f64 = 32.0;
/// The vertical difficulty grows this much faster than the horizontal.
const MONSTER_LEVEL_VERT_FACTOR: f64 = 3.0;
/// Blocks to walk to meet monsters of the next level.
const MONSTER_LEVEL_GROWTH: f64 = 32.0;
/// Damage multiplier between monsters and players, used inverted in both
/// directions.
const MONSTER_VS_PLAYER_FACT: f32 = 2.0;
/// Monsters below this level are softened further for beginners.
const EASY_MONSTER_LEVEL: f32 = 10.0;
/// Monsters below this level never initiate attacks.
pub const AGGRESSIVE_LEVEL_START: u32 = 5;
/// Armor multipliers are pulled toward 1 by this calibration so a full set
/// does not dominate the weapon.
const ARMOR_MODIFIER_CAL: f32 = 0.282;

/// The monster level required by the surroundings of a position. Grows with
/// distance from the starting line, three times faster vertically.
pub fn monster_difficulty(pos: DVec3) -> u32 {
    let dist = pos.y.abs() + pos.z.abs() * MONSTER_LEVEL_VERT_FACTOR - MONSTER_LEVEL_FREE_ZONE;
    if dist <= 0.0 {
        0
    } else {
        (dist / MONSTER_LEVEL_GROWTH) as u32
    }
}

/// Damage multiplier for an attacker at `attacker_lvl` hitting a defender at
/// `defender_lvl`, in 0..1.
pub fn player_level_diff(attacker_lvl: u32, defender_lvl: u32) -> f32 {
    ((KILL_ADJUST * (defender_lvl as f64 - attacker_lvl as f64)).exp() / NUMBER_OF_HITS_TO_KILL) as f32
}

/// Shared shape of the equipment multipliers: the grade is detracted by how
/// far the item level is from the fighter level, then mapped to a multiplier
/// near 1. The same table is used by the client inventory screen.
fn grade_multiplier(fighter_lvl: u32, item_lvl: u32, grade: u8) -> f32 {
    let mut detract = 0u8;
    if fighter_lvl > item_lvl + grade as u32 {
        detract = (fighter_lvl - item_lvl) as u8 - grade;
    }
    if fighter_lvl + (grade as u32) < item_lvl {
        detract = (item_lvl - fighter_lvl) as u8 - grade;
    }
    let grade = grade - detract.min(grade);
    match grade {
        0 => 0.9,
        1 => 1.0,
        2 => 1.1,
        3 => 1.2,
        4 => 1.3,
        _ => 1.0,
    }
}

/// Multiplier for a fighter at `fighter_lvl` using a weapon found at
/// `weapon_lvl` of the given grade.
pub fn weapon_level_diff(fighter_lvl: u32, weapon_lvl: u32, grade: u8) -> f32 {
    grade_multiplier(fighter_lvl, weapon_lvl, grade)
}

/// Divisor for a fighter wearing armor (or a helmet) found at `armor_lvl` of
/// the given grade. The multiplier is calibrated toward 1.
pub fn armor_level_diff(fighter_lvl: u32, armor_lvl: u32, grade: u8) -> f32 {
    (grade_multiplier(fighter_lvl, armor_lvl, grade) - 1.0) * ARMOR_MODIFIER_CAL + 1.0
}

/// The monster/player factor, exaggerated for low level monsters to ease
/// beginners.
pub fn monster_vs_player_factor(monster_lvl: u32) -> f32 {
    let diff = (EASY_MONSTER_LEVEL - monster_lvl as f32).max(0.0);
    MONSTER_VS_PLAYER_FACT + MONSTER_VS_PLAYER_FACT / EASY_MONSTER_LEVEL * diff
}

/// Experience for a player at `player_lvl` killing a monster at
/// `monster_lvl`, before the beginner multipliers.
pub fn experience_for_kill(player_lvl: u32, monster_lvl: u32) -> f32 {
    (EXP_FOR_ONE_MONSTER
        * (EXP_MULTIPLIER / (1.0 + (player_lvl as f64 - monster_lvl as f64 + EXP_LEVEL_OFFSET).exp())))
        as f32
}

/// Experience for a same-level kill, the reference point of the drop tables.
pub fn experience_same_level() -> f32 {
    experience_for_kill(0, 0)
}

/// Damage dealt to a player by a monster of the given level, given the
/// player's armor and helmet. Clamped to 0..1.
pub fn monster_hit_damage(
    player_lvl: u32,
    monster_lvl: u32,
    weapon_dmg: f32,
    armor: (u32, u8),
    helmet: (u32, u8),
) -> f32 {
    let dmg = weapon_dmg
        * player_level_diff(player_lvl, monster_lvl)
        * weapon_level_diff(monster_lvl, monster_lvl, 1)
        / armor_level_diff(player_lvl, armor.0, armor.1)
        / armor_level_diff(player_lvl, helmet.0, helmet.1)
        / monster_vs_player_factor(monster_lvl);
    dmg.clamp(0.0, 1.0)
}

/// Damage dealt to a monster by a player swing. Clamped to 0..1.
pub fn player_hit_damage(
    monster_lvl: u32,
    player_lvl: u32,
    weapon_dmg: f32,
    weapon: (u32, u8),
) -> f32 {
    let dmg = weapon_dmg
        * player_level_diff(monster_lvl, player_lvl)
        * weapon_level_diff(player_lvl, weapon.0, weapon.1)
        * monster_vs_player_factor(monster_lvl);
    dmg.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn ten_same_level_hits_kill() {
        let dmg = player_level_diff(7, 7);
        assert!((dmg - 0.1).abs() < 1e-6);
    }

    #[test]
    fn level_difference_tilts_damage() {
        assert!(player_level_diff(5, 6) > player_level_diff(5, 5));
        assert!(player_level_diff(6, 5) < player_level_diff(5, 5));
    }

    #[test]
    fn grade_multiplier_detracts_out_of_range_items() {
        // Item at the fighter's level keeps its full grade.
        assert!((weapon_level_diff(10, 10, 4) - 1.3).abs() < 1e-6);
        // A far lower-level item loses the whole grade.
        assert!((weapon_level_diff(20, 2, 3) - 0.9).abs() < 1e-6);
        // Grade absorbs part of the offset.
        assert!((weapon_level_diff(12, 10, 3) - 1.2).abs() < 1e-6);
    }

    #[test]
    fn armor_is_calibrated_toward_one() {
        let weapon = weapon_level_diff(10, 10, 4);
        let armor = armor_level_diff(10, 10, 4);
        assert!(armor > 1.0 && armor < weapon);
        assert!((armor - (1.0 + 0.3 * ARMOR_MODIFIER_CAL)).abs() < 1e-6);
    }

    #[test]
    fn easy_monsters_hit_softer() {
        assert!(monster_vs_player_factor(0) > monster_vs_player_factor(5));
        assert_eq!(monster_vs_player_factor(10), 2.0);
        assert_eq!(monster_vs_player_factor(50), 2.0);
    }

    #[test]
    fn difficulty_gradient() {
        assert_eq!(monster_difficulty(DVec3::new(0.0, 0.0, 0.0)), 0);
        assert_eq!(monster_difficulty(DVec3::new(0.0, 31.0, 0.0)), 0);
        assert_eq!(monster_difficulty(DVec3::new(0.0, 96.0, 0.0)), 2);
        // Vertical distance counts three-fold.
        assert_eq!(
            monster_difficulty(DVec3::new(0.0, 0.0, 32.0)),
            monster_difficulty(DVec3::new(0.0, 96.0, 0.0))
        );
    }

    #[test]
    fn kill_experience_rewards_harder_monsters() {
        let same = experience_for_kill(10, 10);
        assert!(experience_for_kill(10, 12) > same);
        assert!(experience_for_kill(10, 8) < same);
        assert!(same > 0.0 && same < 1.0);
    }

    #[test]
    fn hit_damage_is_clamped() {
        let dmg = monster_hit_damage(0, 60, 1.0, (0, 0), (0, 0));
        assert!(dmg <= 1.0);
        let dmg = player_hit_damage(0, 60, 1.5, (60, 4));
        assert!(dmg <= 1.0);
    }

}
