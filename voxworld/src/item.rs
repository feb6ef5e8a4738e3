//! Items and the player inventory.
//!
//! Every item is identified by a 4-character code where the last character
//! carries the grade: `WEP1`..`WEP4` are weapons, `ARM*` armor, `HLM*`
//! helmets, `POTH`/`POTM` potions, `S001` the resurrection scroll. The
//! inventory is a flat list of `(code, level, count)` stacks.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::combat;

/// A 4-character item code.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectCode(pub [u8; 4]);

pub const HEALTH_POTION: ObjectCode = ObjectCode(*b"POTH");
pub const MANA_POTION: ObjectCode = ObjectCode(*b"POTM");
pub const RES_SCROLL: ObjectCode = ObjectCode(*b"S001");

impl ObjectCode {

    /// The weapon code of a given grade, `WEP0` for bare hands.
    pub fn weapon(grade: u8) -> Self {
        debug_assert!(grade <= 4);
        ObjectCode([b'W', b'E', b'P', b'0' + grade])
    }

    /// The armor code of a given grade.
    pub fn armor(grade: u8) -> Self {
        debug_assert!(grade <= 4);
        ObjectCode([b'A', b'R', b'M', b'0' + grade])
    }

    /// The helmet code of a given grade.
    pub fn helmet(grade: u8) -> Self {
        debug_assert!(grade <= 4);
        ObjectCode([b'H', b'L', b'M', b'0' + grade])
    }

    /// The grade digit, for codes of the form `XXXN`.
    pub fn grade(self) -> Option<u8> {
        match self.0[3] {
            d @ b'0'..=b'9' => Some(d - b'0'),
            _ => None,
        }
    }

    /// What family of item this code belongs to, when known.
    pub fn kind(self) -> Option<ItemKind> {
        match &self.0 {
            b"POTH" | b"POTM" => Some(ItemKind::Potion),
            b"S001" => Some(ItemKind::Scroll),
            [b'W', b'E', b'P', b'0'..=b'4'] => Some(ItemKind::Weapon),
            [b'A', b'R', b'M', b'0'..=b'4'] => Some(ItemKind::Armor),
            [b'H', b'L', b'M', b'0'..=b'4'] => Some(ItemKind::Helmet),
            _ => None,
        }
    }

}

impl fmt::Display for ObjectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for ObjectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectCode({self})")
    }
}

impl TryFrom<String> for ObjectCode {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.as_bytes()
            .try_into()
            .map(ObjectCode)
            .map_err(|_| format!("object code must be 4 bytes, got {s:?}"))
    }
}

impl From<ObjectCode> for String {
    fn from(code: ObjectCode) -> String {
        code.to_string()
    }
}

/// Families of items with distinct use behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Potion,
    Weapon,
    Armor,
    Helmet,
    Scroll,
}

/// One inventory stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemStack {
    pub code: ObjectCode,
    pub level: u32,
    pub count: u32,
}

/// The player inventory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory(Vec<ItemStack>);

impl Inventory {

    /// Add one item, merging into an existing stack when code and level
    /// match.
    pub fn add_one(&mut self, code: ObjectCode, level: u32) {
        for stack in &mut self.0 {
            if stack.code == code && stack.level == level {
                stack.count += 1;
                return;
            }
        }
        self.0.push(ItemStack { code, level, count: 1 });
    }

    /// Remove one item from the matching stack, dropping the stack at zero.
    /// Returns false when there is no such item.
    pub fn remove_one(&mut self, code: ObjectCode, level: u32) -> bool {
        for (i, stack) in self.0.iter_mut().enumerate() {
            if stack.code == code && stack.level == level {
                stack.count -= 1;
                if stack.count == 0 {
                    self.0.swap_remove(i);
                }
                return true;
            }
        }
        false
    }

    /// The stack for a code and level, if present.
    pub fn find(&self, code: ObjectCode, level: u32) -> Option<&ItemStack> {
        self.0.iter().find(|s| s.code == code && s.level == level)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ItemStack> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Drop stacks that carry no items, which can sneak in through old
    /// documents.
    pub fn clean_up(&mut self) {
        self.0.retain(|s| s.count > 0 && s.code.kind().is_some());
    }

}

/// The normalized experience value of dropping an item: 1 for an item of the
/// lowest grade at the player's own level, clamped to 0..3.
pub fn item_value_as_drop(player_level: u32, item_level: u32, code: ObjectCode) -> f32 {
    let Some(grade) = code.grade() else { return 0.0 };
    let diff = 1.0 + (item_level as f32 - player_level as f32 + grade as f32) / 2.0;
    diff.clamp(0.0, 3.0)
}

/// Roll the drop table for a kill. The `modifier` rescales all probabilities
/// so that the expected number of drops over the ~`1/xp` kills a level takes
/// is about one; 1.0 is neutral, smaller is more generous.
pub fn roll_drops(player_level: u32, modifier: f32, rng: &mut impl Rng) -> Vec<ItemStack> {

    let base = combat::experience_same_level();
    let mut drops = Vec::new();
    let mut push = |code: ObjectCode| {
        drops.push(ItemStack { code, level: player_level, count: 1 });
    };

    if rng.gen::<f32>() * modifier < 0.05 {
        push(HEALTH_POTION);
    }
    if rng.gen::<f32>() * modifier < 0.05 {
        push(MANA_POTION);
    }

    // One roll per equipment family; grade 3 is a hundred times rarer than
    // grade 1.
    for maker in [ObjectCode::weapon, ObjectCode::armor, ObjectCode::helmet] {
        let prob = rng.gen::<f32>() * modifier;
        if prob < base / 100.0 {
            push(maker(3));
        } else if prob < base / 10.0 {
            push(maker(2));
        } else if prob < base {
            push(maker(1));
        }
    }

    drops

}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn codes_parse_and_classify() {
        assert_eq!(ObjectCode::weapon(3).to_string(), "WEP3");
        assert_eq!(ObjectCode::armor(0).kind(), Some(ItemKind::Armor));
        assert_eq!(HEALTH_POTION.kind(), Some(ItemKind::Potion));
        assert_eq!(RES_SCROLL.kind(), Some(ItemKind::Scroll));
        assert_eq!(ObjectCode(*b"XYZW").kind(), None);
        assert_eq!(ObjectCode::weapon(2).grade(), Some(2));
    }

    #[test]
    fn inventory_stacks_and_unstacks() {
        let mut inv = Inventory::default();
        inv.add_one(HEALTH_POTION, 3);
        inv.add_one(HEALTH_POTION, 3);
        inv.add_one(HEALTH_POTION, 4);
        assert_eq!(inv.len(), 2);
        assert_eq!(inv.find(HEALTH_POTION, 3).unwrap().count, 2);
        assert!(inv.remove_one(HEALTH_POTION, 3));
        assert!(inv.remove_one(HEALTH_POTION, 3));
        assert!(!inv.remove_one(HEALTH_POTION, 3));
        assert_eq!(inv.len(), 1);
    }

    #[test]
    fn drop_value_is_clamped() {
        assert_eq!(item_value_as_drop(10, 10, ObjectCode::weapon(1)), 1.5);
        assert_eq!(item_value_as_drop(30, 2, ObjectCode::weapon(1)), 0.0);
        assert_eq!(item_value_as_drop(2, 30, ObjectCode::weapon(1)), 3.0);
        assert_eq!(item_value_as_drop(5, 5, RES_SCROLL), 1.5);
        assert_eq!(item_value_as_drop(5, 5, HEALTH_POTION), 0.0);
    }

    #[test]
    fn inventory_serializes_with_string_codes() {
        let mut inv = Inventory::default();
        inv.add_one(ObjectCode::weapon(1), 7);
        let json = serde_json::to_string(&inv).unwrap();
        assert!(json.contains("WEP1"), "{json}");
        let back: Inventory = serde_json::from_str(&json).unwrap();
        assert_eq!(back.find(ObjectCode::weapon(1), 7).unwrap().count, 1);
    }

    #[test]
    fn drops_are_modest() {
        let mut rng = rand::thread_rng();
        // With a neutral modifier a single kill should very rarely produce
        // more than a couple of items.
        for _ in 0..100 {
            let drops = roll_drops(5, 1.0, &mut rng);
            assert!(drops.len() <= 5);
        }
    }

}
