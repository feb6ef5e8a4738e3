//! Keys and key rings. Keys are granted by activators and tested by door
//! conditions; the ring has a bounded size and forgets the oldest key when a
//! new one does not fit.

use serde::{Deserialize, Serialize};

/// Maximum number of keys on a ring.
const KEY_RING_MAX: usize = 10;

/// One key, as granted by a territory owner's activator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    /// The territory owner that created the key.
    pub owner: u32,
    /// The key id, unique per owner.
    pub kid: u32,
    /// One line description shown to the player.
    pub descr: String,
    /// Which model the client draws for it.
    pub view: u32,
}

/// The bounded list of keys a player carries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyRing(Vec<Key>);

impl KeyRing {

    /// Add a key. Adding a key already present is a no-op; adding to a full
    /// ring drops the oldest key.
    pub fn add(&mut self, key: Key) {
        if self.test(key.owner, key.kid) {
            return;
        }
        if self.0.len() >= KEY_RING_MAX {
            self.0.remove(0);
        }
        self.0.push(key);
    }

    /// True if a key with the given owner and id is on the ring.
    pub fn test(&self, owner: u32, kid: u32) -> bool {
        self.0.iter().any(|k| k.owner == owner && k.kid == kid)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Key> {
        self.0.iter()
    }

}

#[cfg(test)]
mod tests {

    use super::*;

    fn key(owner: u32, kid: u32) -> Key {
        Key { owner, kid, descr: String::new(), view: 0 }
    }

    #[test]
    fn ring_is_bounded_and_drops_the_oldest() {
        let mut ring = KeyRing::default();
        for kid in 0..12 {
            ring.add(key(1, kid));
        }
        assert_eq!(ring.len(), KEY_RING_MAX);
        assert!(!ring.test(1, 0));
        assert!(!ring.test(1, 1));
        assert!(ring.test(1, 2));
        assert!(ring.test(1, 11));
    }

    #[test]
    fn duplicate_add_is_a_no_op() {
        let mut ring = KeyRing::default();
        ring.add(key(3, 7));
        ring.add(key(3, 7));
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn test_matches_owner_and_id_together() {
        let mut ring = KeyRing::default();
        ring.add(key(3, 7));
        assert!(ring.test(3, 7));
        assert!(!ring.test(3, 8));
        assert!(!ring.test(4, 7));
    }

}
