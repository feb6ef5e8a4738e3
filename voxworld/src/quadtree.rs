//! Recursive spatial index over the horizontal plane.
//!
//! Keeps track of which mobile entities are close to each other. The cost of
//! checking all pairs grows with the square of the population, so the square
//! is recursively divided in two per dimension once a node holds more than a
//! handful of objects.
//!
//! One read/write lock covers the whole tree: queries take it shared,
//! structural mutation takes it exclusive. The common case of an object
//! moving within its current leaf is a plain position store under the shared
//! lock with no rebalancing at all.
//!
//! The tree never owns entities. Each entry is an `Arc` holding a typed id
//! and the live position; the owning table (sessions or the monster map)
//! holds the other reference.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use glam::DVec2;

/// Do not divide deeper than this.
const MAX_DEPTH: u32 = 6;
/// Collapse a node's children when its count falls below this.
const MIN_OBJECTS: usize = 5;
/// Split a leaf when its count exceeds this.
const MAX_OBJECTS: usize = 10;
/// How much the area grows when a position lands outside the root.
const EXPAND_FACTOR: f64 = 1.3;
/// Half extent of a fresh root square, in blocks.
const INITIAL_SIZE: f64 = 64.0;

/// Non-owning reference to an entity in the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QtHandle {
    Player(u32),
    Monster(u32),
}

impl QtHandle {

    /// The id the wire protocol uses for this entity.
    #[inline]
    pub fn id(self) -> u32 {
        match self {
            QtHandle::Player(id) => id,
            QtHandle::Monster(id) => id,
        }
    }

}

/// One indexed entity: its handle plus the live position, stored as atomic
/// f64 bit patterns so queries under the shared lock always see a current
/// (at worst one tick stale) position.
pub struct QtEntry {
    pub handle: QtHandle,
    x: AtomicU64,
    y: AtomicU64,
}

impl QtEntry {

    pub fn new(handle: QtHandle, pos: DVec2) -> Arc<Self> {
        Arc::new(Self {
            handle,
            x: AtomicU64::new(pos.x.to_bits()),
            y: AtomicU64::new(pos.y.to_bits()),
        })
    }

    /// The position as last reported to the index.
    #[inline]
    pub fn pos(&self) -> DVec2 {
        DVec2 {
            x: f64::from_bits(self.x.load(Ordering::Relaxed)),
            y: f64::from_bits(self.y.load(Ordering::Relaxed)),
        }
    }

    #[inline]
    fn store_pos(&self, pos: DVec2) {
        self.x.store(pos.x.to_bits(), Ordering::Relaxed);
        self.y.store(pos.y.to_bits(), Ordering::Relaxed);
    }

}

struct Node {
    /// Lower left corner.
    corner1: DVec2,
    /// Upper right corner.
    corner2: DVec2,
    center: DVec2,
    depth: u32,
    /// Total objects in this node and all its descendants.
    count: usize,
    children: Option<Box<[[Node; 2]; 2]>>,
    objects: Vec<Arc<QtEntry>>,
}

impl Node {

    fn new(corner1: DVec2, corner2: DVec2, depth: u32) -> Self {
        Self {
            corner1,
            corner2,
            center: (corner1 + corner2) / 2.0,
            depth,
            count: 0,
            children: None,
            objects: Vec::new(),
        }
    }

    /// The child quadrant that contains the position.
    #[inline]
    fn quadrant(&self, pos: DVec2) -> (usize, usize) {
        ((pos.x > self.center.x) as usize, (pos.y > self.center.y) as usize)
    }

    /// Move every object of this node into freshly created children.
    fn make_children(&mut self) {
        let c1 = self.corner1;
        let c2 = self.corner2;
        let cm = self.center;
        let depth = self.depth + 1;
        let child = |x: usize, y: usize| {
            let min = DVec2 {
                x: if x == 0 { c1.x } else { cm.x },
                y: if y == 0 { c1.y } else { cm.y },
            };
            let max = DVec2 {
                x: if x == 0 { cm.x } else { c2.x },
                y: if y == 0 { cm.y } else { c2.y },
            };
            Node::new(min, max, depth)
        };
        self.children = Some(Box::new([
            [child(0, 0), child(0, 1)],
            [child(1, 0), child(1, 1)],
        ]));
        for entry in std::mem::take(&mut self.objects) {
            let pos = entry.pos();
            let (x, y) = self.quadrant(pos);
            self.children.as_mut().unwrap()[x][y].add(entry, pos);
        }
    }

    /// Destroy the children and pull every descendant object back into this
    /// node.
    fn destroy_children(&mut self) {
        if let Some(children) = self.children.take() {
            for mut child in (*children).into_iter().flatten() {
                child.collect_objects(&mut self.objects);
            }
        }
    }

    fn collect_objects(&mut self, out: &mut Vec<Arc<QtEntry>>) {
        if let Some(children) = self.children.take() {
            for mut child in (*children).into_iter().flatten() {
                child.collect_objects(out);
            }
        } else {
            out.append(&mut self.objects);
        }
    }

    fn add(&mut self, entry: Arc<QtEntry>, pos: DVec2) {
        self.count += 1;
        if self.children.is_none() && self.depth < MAX_DEPTH && self.count > MAX_OBJECTS {
            self.make_children();
        }
        if self.children.is_some() {
            let (x, y) = self.quadrant(pos);
            self.children.as_mut().unwrap()[x][y].add(entry, pos);
        } else {
            self.objects.push(entry);
        }
    }

    /// Remove the entry, descending by its current position. Returns false
    /// only when the object cannot be found, which the caller treats as
    /// fatal state corruption.
    fn remove(&mut self, entry: &Arc<QtEntry>, pos: DVec2) -> bool {
        if self.count == 0 {
            return false;
        }
        self.count -= 1;
        if self.children.is_some() && self.count < MIN_OBJECTS {
            self.destroy_children();
        }
        if self.children.is_some() {
            let (x, y) = self.quadrant(pos);
            self.children.as_mut().unwrap()[x][y].remove(entry, pos)
        } else {
            match self.objects.iter().position(|o| Arc::ptr_eq(o, entry)) {
                Some(index) => {
                    self.objects.swap_remove(index);
                    true
                }
                None => false,
            }
        }
    }

    /// True when the entry is filed in the leaf that covers `pos`.
    fn present_at(&self, entry: &Arc<QtEntry>, pos: DVec2) -> bool {
        match &self.children {
            None => self.objects.iter().any(|o| Arc::ptr_eq(o, entry)),
            Some(children) => {
                let (x, y) = self.quadrant(pos);
                children[x][y].present_at(entry, pos)
            }
        }
    }

    fn find_near(&self, pos: DVec2, dist: f64, out: &mut Vec<Arc<QtEntry>>) {
        match &self.children {
            None => {
                for entry in &self.objects {
                    if pos.distance_squared(entry.pos()) <= dist * dist {
                        out.push(Arc::clone(entry));
                    }
                }
            }
            Some(children) => {
                // Descend into every quadrant the query disk touches; more
                // than one can match.
                for x in 0..2usize {
                    if x == 0 && pos.x - dist > self.center.x {
                        continue;
                    }
                    if x == 1 && pos.x + dist < self.center.x {
                        continue;
                    }
                    for y in 0..2usize {
                        if y == 0 && pos.y - dist > self.center.y {
                            continue;
                        }
                        if y == 1 && pos.y + dist < self.center.y {
                            continue;
                        }
                        children[x][y].find_near(pos, dist, out);
                    }
                }
            }
        }
    }

    /// Grow the root in place so it covers `pos`. All objects are pulled up
    /// to this node; the next additions will re-split the tree.
    fn expand_for(&mut self, pos: DVec2) {
        let mut changed = false;
        let mut c1 = self.corner1;
        let mut c2 = self.corner2;
        for i in 0..2 {
            if pos[i] < self.corner1[i] {
                changed = true;
                c1[i] = self.corner2[i] - (self.corner2[i] - pos[i]) * EXPAND_FACTOR;
            }
            if pos[i] > self.corner2[i] {
                changed = true;
                c2[i] = self.corner1[i] + (pos[i] - self.corner1[i]) * EXPAND_FACTOR;
            }
        }
        if !changed {
            return;
        }
        self.destroy_children();
        self.corner1 = c1;
        self.corner2 = c2;
        self.center = (c1 + c2) / 2.0;
    }

}

/// The quadtree, usable from any number of tasks.
pub struct Quadtree {
    root: RwLock<Node>,
}

impl Default for Quadtree {
    fn default() -> Self {
        Self::new()
    }
}

impl Quadtree {

    pub fn new() -> Self {
        let half = DVec2::splat(INITIAL_SIZE);
        Self {
            root: RwLock::new(Node::new(-half, half, 1)),
        }
    }

    /// Add an entry at its current position.
    pub fn add(&self, entry: &Arc<QtEntry>) {
        let mut root = self.root.write().expect("poisoned");
        let pos = entry.pos();
        root.expand_for(pos);
        root.add(Arc::clone(entry), pos);
    }

    /// Remove an entry. A missing object means the index no longer matches
    /// the owner tables; all shared state is untrusted at that point, so
    /// this aborts loudly.
    pub fn remove(&self, entry: &Arc<QtEntry>) {
        let mut root = self.root.write().expect("poisoned");
        let pos = entry.pos();
        if !root.remove(entry, pos) {
            panic!("quadtree: remove of {:?} at {pos} not found", entry.handle);
        }
    }

    /// Update an entry's position. When the object stays inside the leaf
    /// that covers the new position, only the stored position changes and
    /// the shared lock suffices.
    pub fn move_to(&self, entry: &Arc<QtEntry>, to: DVec2) {
        {
            let root = self.root.read().expect("poisoned");
            if root.present_at(entry, to) {
                entry.store_pos(to);
                return;
            }
        }
        let mut root = self.root.write().expect("poisoned");
        let from = entry.pos();
        if !root.remove(entry, from) {
            panic!("quadtree: move of {:?} from {from} not found", entry.handle);
        }
        entry.store_pos(to);
        root.expand_for(to);
        root.add(Arc::clone(entry), to);
    }

    /// All entries within `dist` of `pos`.
    pub fn find_near(&self, pos: DVec2, dist: f64) -> Vec<Arc<QtEntry>> {
        let root = self.root.read().expect("poisoned");
        let mut out = Vec::new();
        root.find_near(pos, dist, &mut out);
        out
    }

    /// True when no object is indexed.
    pub fn is_empty(&self) -> bool {
        let root = self.root.read().expect("poisoned");
        root.count == 0 && root.children.is_none() && root.objects.is_empty()
    }

    /// Number of indexed objects.
    pub fn len(&self) -> usize {
        self.root.read().expect("poisoned").count
    }

}

#[cfg(test)]
mod tests {

    use super::*;

    fn entry(id: u32, x: f64, y: f64) -> Arc<QtEntry> {
        QtEntry::new(QtHandle::Monster(id), DVec2::new(x, y))
    }

    #[test]
    fn add_remove_round_trip() {
        let tree = Quadtree::new();
        assert!(tree.is_empty());
        let entries: Vec<_> = (0..50).map(|i| entry(i, i as f64, -(i as f64))).collect();
        for e in &entries {
            tree.add(e);
        }
        assert_eq!(tree.len(), 50);
        for e in &entries {
            tree.remove(e);
        }
        assert!(tree.is_empty());
    }

    #[test]
    fn every_entry_lives_in_exactly_one_leaf() {
        let tree = Quadtree::new();
        let entries: Vec<_> = (0..100)
            .map(|i| entry(i, (i % 13) as f64 * 5.0, (i % 7) as f64 * 9.0))
            .collect();
        for e in &entries {
            tree.add(e);
        }
        // A radius covering everything must return each entry once.
        let found = tree.find_near(DVec2::ZERO, 1e6);
        assert_eq!(found.len(), 100);
        let mut ids: Vec<u32> = found.iter().map(|e| e.handle.id()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn find_near_filters_by_distance() {
        let tree = Quadtree::new();
        let close = entry(1, 1.0, 1.0);
        let far = entry(2, 50.0, 50.0);
        tree.add(&close);
        tree.add(&far);
        let found = tree.find_near(DVec2::ZERO, 10.0);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].handle, QtHandle::Monster(1));
    }

    #[test]
    fn expansion_covers_far_positions() {
        let tree = Quadtree::new();
        let near = entry(1, 0.0, 0.0);
        let far = entry(2, 100_000.0, -70_000.0);
        tree.add(&near);
        tree.add(&far);
        assert_eq!(tree.len(), 2);
        let found = tree.find_near(DVec2::new(100_000.0, -70_000.0), 5.0);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].handle, QtHandle::Monster(2));
    }

    #[test]
    fn move_without_leaf_change_keeps_structure() {
        let tree = Quadtree::new();
        let e = entry(7, 3.0, 3.0);
        tree.add(&e);
        tree.move_to(&e, DVec2::new(4.0, 4.0));
        assert_eq!(e.pos(), DVec2::new(4.0, 4.0));
        assert_eq!(tree.len(), 1);
        let found = tree.find_near(DVec2::new(4.0, 4.0), 1.0);
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn move_across_the_tree_relocates() {
        let tree = Quadtree::new();
        // Enough population to force splits.
        let entries: Vec<_> = (0..40).map(|i| entry(i, (i as f64) - 20.0, 0.0)).collect();
        for e in &entries {
            tree.add(e);
        }
        let mover = entry(100, -20.0, -20.0);
        tree.add(&mover);
        tree.move_to(&mover, DVec2::new(60.0, 60.0));
        let found = tree.find_near(DVec2::new(60.0, 60.0), 2.0);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].handle, QtHandle::Monster(100));
        tree.remove(&mover);
        for e in &entries {
            tree.remove(e);
        }
        assert!(tree.is_empty());
    }

    #[test]
    #[should_panic(expected = "not found")]
    fn removing_a_stranger_is_fatal() {
        let tree = Quadtree::new();
        tree.add(&entry(1, 0.0, 0.0));
        tree.remove(&entry(2, 0.0, 0.0));
    }

    #[test]
    fn churn_collapses_back_to_a_leaf() {
        let tree = Quadtree::new();
        let entries: Vec<_> = (0..200)
            .map(|i| entry(i, ((i * 37) % 100) as f64 - 50.0, ((i * 53) % 100) as f64 - 50.0))
            .collect();
        for e in &entries {
            tree.add(e);
        }
        for e in entries.iter().skip(3) {
            tree.remove(e);
        }
        assert_eq!(tree.len(), 3);
        let found = tree.find_near(DVec2::ZERO, 1e4);
        assert_eq!(found.len(), 3);
    }

}
