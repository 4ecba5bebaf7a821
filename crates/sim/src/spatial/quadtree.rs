//! Region quadtree over the arena's bounding circles.
//!
//! Nodes live in a slab with a free list; child links are slab
//! indices, parent links are non-owning indices back up the tree.
//! Structure (splits and merges) only changes inside [`QuadTree::post_tick`],
//! which runs between ticks with exclusive access. During a tick the
//! node topology is frozen: worker threads may query leaves and move
//! items between them, so membership lists sit behind per-leaf locks
//! and the per-item bookkeeping is atomic.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering::Relaxed};

use parking_lot::Mutex;

use super::shape::{circle_quadrant, quad, Circle, Rect, Shape};
use crate::arena::{CellId, CELL_CAPACITY};

const NIL: u32 = u32::MAX;

struct Node {
    rect: Rect,
    level: u32,
    parent: u32,
    /// Child slab indices in TL, TR, BL, BR order; `None` for leaves.
    children: Option<[u32; 4]>,
    items: Mutex<Vec<CellId>>,
}

impl Node {
    fn new(rect: Rect, level: u32, parent: u32) -> Self {
        Self {
            rect,
            level,
            parent,
            children: None,
            items: Mutex::new(Vec::new()),
        }
    }
}

/// Per-item tracking: owning leaf plus the last reported bounding
/// circle, stored as raw bits so workers can refresh it without a lock.
struct ItemSlot {
    node: AtomicU32,
    x: AtomicU32,
    y: AtomicU32,
    r: AtomicU32,
}

impl ItemSlot {
    fn empty() -> Self {
        Self {
            node: AtomicU32::new(NIL),
            x: AtomicU32::new(0),
            y: AtomicU32::new(0),
            r: AtomicU32::new(0),
        }
    }

    fn store_circle(&self, c: &Circle) {
        self.x.store(c.x.to_bits(), Relaxed);
        self.y.store(c.y.to_bits(), Relaxed);
        self.r.store(c.r.to_bits(), Relaxed);
    }

    fn circle(&self) -> Circle {
        Circle {
            x: f32::from_bits(self.x.load(Relaxed)),
            y: f32::from_bits(self.y.load(Relaxed)),
            r: f32::from_bits(self.r.load(Relaxed)),
        }
    }
}

pub struct QuadTree {
    nodes: Vec<Node>,
    free: Vec<u32>,
    max_level: u32,
    max_items: usize,
    items: Box<[ItemSlot]>,
    len: AtomicUsize,
}

impl QuadTree {
    pub fn new(bounds: Rect, max_level: u32, max_items: usize) -> Self {
        let items = (0..CELL_CAPACITY).map(|_| ItemSlot::empty()).collect();
        Self {
            nodes: vec![Node::new(bounds, 0, NIL)],
            free: Vec::new(),
            max_level,
            max_items: max_items.max(1),
            items,
            len: AtomicUsize::new(0),
        }
    }

    /// Number of tracked items.
    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live nodes in the slab.
    #[inline]
    pub fn node_count(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    /// Deepest existing node whose region the circle belongs to,
    /// starting from `from` and descending by center-point quadrant
    /// tests. Never allocates; splits are deferred to `post_tick`.
    fn descend(&self, from: u32, c: &Circle) -> u32 {
        let mut idx = from;
        while let Some(children) = self.nodes[idx as usize].children {
            let rect = self.nodes[idx as usize].rect;
            match circle_quadrant(c, rect.x, rect.y) {
                Some(q) => idx = children[q],
                None => break,
            }
        }
        idx
    }

    /// Tracks a cell. The id must not already be tracked.
    pub fn insert(&self, id: CellId, c: Circle) {
        let slot = &self.items[id as usize];
        debug_assert_eq!(slot.node.load(Relaxed), NIL);
        slot.store_circle(&c);
        let idx = self.descend(0, &c);
        self.nodes[idx as usize].items.lock().push(id);
        slot.node.store(idx, Relaxed);
        self.len.fetch_add(1, Relaxed);
    }

    /// Stops tracking a cell. No-op for ids that were never inserted.
    pub fn remove(&self, id: CellId) {
        let slot = &self.items[id as usize];
        let idx = slot.node.swap(NIL, Relaxed);
        if idx == NIL {
            return;
        }
        let mut items = self.nodes[idx as usize].items.lock();
        if let Some(pos) = items.iter().position(|&i| i == id) {
            items.swap_remove(pos);
        }
        drop(items);
        self.len.fetch_sub(1, Relaxed);
    }

    /// Refreshes a cell's bounding circle and, when the circle has
    /// left its node's region, walks up to the nearest enclosing
    /// ancestor and back down to the correct node. No-op for
    /// untracked ids.
    ///
    /// The old and new leaf locks are taken one after the other, never
    /// nested, so concurrent relocations cannot deadlock.
    pub fn relocate(&self, id: CellId, c: Circle) {
        let slot = &self.items[id as usize];
        let from = slot.node.load(Relaxed);
        if from == NIL {
            return;
        }
        slot.store_circle(&c);

        let mut up = from;
        loop {
            let node = &self.nodes[up as usize];
            if node.parent == NIL || node.rect.contains(&c) {
                break;
            }
            up = node.parent;
        }
        let to = self.descend(up, &c);
        if to == from {
            return;
        }

        let mut items = self.nodes[from as usize].items.lock();
        if let Some(pos) = items.iter().position(|&i| i == id) {
            items.swap_remove(pos);
        }
        drop(items);
        self.nodes[to as usize].items.lock().push(id);
        slot.node.store(to, Relaxed);
    }

    /// Last circle reported for a tracked cell.
    pub fn circle(&self, id: CellId) -> Circle {
        self.items[id as usize].circle()
    }

    /// Calls `f` for every tracked item whose circle overlaps the
    /// shape. Descent is pruned with the overlap-quadrant bitmask.
    pub fn query<F: FnMut(CellId)>(&self, shape: &Shape, mut f: F) {
        if shape.is_degenerate() {
            return;
        }
        self.query_node(0, shape, &mut f);
    }

    fn query_node<F: FnMut(CellId)>(&self, idx: u32, shape: &Shape, f: &mut F) {
        let node = &self.nodes[idx as usize];
        {
            let items = node.items.lock();
            for &id in items.iter() {
                if shape.overlaps(&self.items[id as usize].circle()) {
                    f(id);
                }
            }
        }
        if let Some(children) = node.children {
            let mask = shape.overlap_quadrants(node.rect.x, node.rect.y);
            if mask & (quad::TOP | quad::LEFT) == quad::TOP | quad::LEFT {
                self.query_node(children[0], shape, f);
            }
            if mask & (quad::TOP | quad::RIGHT) == quad::TOP | quad::RIGHT {
                self.query_node(children[1], shape, f);
            }
            if mask & (quad::BOTTOM | quad::LEFT) == quad::BOTTOM | quad::LEFT {
                self.query_node(children[2], shape, f);
            }
            if mask & (quad::BOTTOM | quad::RIGHT) == quad::BOTTOM | quad::RIGHT {
                self.query_node(children[3], shape, f);
            }
        }
    }

    /// Short-circuiting overlap test; stops at the first item for
    /// which `pred` returns true.
    pub fn any_match<F: FnMut(CellId) -> bool>(&self, shape: &Shape, mut pred: F) -> bool {
        if shape.is_degenerate() {
            return false;
        }
        self.any_node(0, shape, &mut pred)
    }

    fn any_node<F: FnMut(CellId) -> bool>(&self, idx: u32, shape: &Shape, pred: &mut F) -> bool {
        let node = &self.nodes[idx as usize];
        {
            let items = node.items.lock();
            for &id in items.iter() {
                if shape.overlaps(&self.items[id as usize].circle()) && pred(id) {
                    return true;
                }
            }
        }
        if let Some(children) = node.children {
            let mask = shape.overlap_quadrants(node.rect.x, node.rect.y);
            let order = [
                (quad::TOP | quad::LEFT, children[0]),
                (quad::TOP | quad::RIGHT, children[1]),
                (quad::BOTTOM | quad::LEFT, children[2]),
                (quad::BOTTOM | quad::RIGHT, children[3]),
            ];
            for (bits, child) in order {
                if mask & bits == bits && self.any_node(child, shape, pred) {
                    return true;
                }
            }
        }
        false
    }

    /// Restructuring barrier: splits full leaves, then collapses
    /// interior nodes left with four empty leaf children. Runs between
    /// ticks with exclusive access.
    pub fn post_tick(&mut self) {
        self.split_pass(0);
        self.merge_pass(0);
    }

    fn alloc_node(&mut self, rect: Rect, level: u32, parent: u32) -> u32 {
        if let Some(idx) = self.free.pop() {
            let node = &mut self.nodes[idx as usize];
            node.rect = rect;
            node.level = level;
            node.parent = parent;
            node.children = None;
            debug_assert!(node.items.get_mut().is_empty());
            idx
        } else {
            self.nodes.push(Node::new(rect, level, parent));
            (self.nodes.len() - 1) as u32
        }
    }

    fn split_pass(&mut self, idx: u32) {
        if let Some(children) = self.nodes[idx as usize].children {
            for child in children {
                self.split_pass(child);
            }
            return;
        }

        let node = &mut self.nodes[idx as usize];
        if node.level >= self.max_level || node.items.get_mut().len() < self.max_items {
            return;
        }
        let rect = node.rect;
        let level = node.level;
        let held = std::mem::take(node.items.get_mut());

        let qw = rect.hw / 2.0;
        let qh = rect.hh / 2.0;
        let children = [
            self.alloc_node(Rect::new(rect.x - qw, rect.y + qh, qw, qh), level + 1, idx),
            self.alloc_node(Rect::new(rect.x + qw, rect.y + qh, qw, qh), level + 1, idx),
            self.alloc_node(Rect::new(rect.x - qw, rect.y - qh, qw, qh), level + 1, idx),
            self.alloc_node(Rect::new(rect.x + qw, rect.y - qh, qw, qh), level + 1, idx),
        ];

        let mut kept = Vec::new();
        for id in held {
            let c = self.items[id as usize].circle();
            match circle_quadrant(&c, rect.x, rect.y) {
                Some(q) => {
                    let child = children[q];
                    self.nodes[child as usize].items.get_mut().push(id);
                    self.items[id as usize].node.store(child, Relaxed);
                }
                None => kept.push(id),
            }
        }
        let node = &mut self.nodes[idx as usize];
        *node.items.get_mut() = kept;
        node.children = Some(children);

        for child in children {
            self.split_pass(child);
        }
    }

    /// Collapses, bottom-up, every interior node whose four children
    /// are empty leaves. Items are never moved: a node only loses its
    /// children once nothing lives below it.
    fn merge_pass(&mut self, idx: u32) {
        let Some(children) = self.nodes[idx as usize].children else {
            return;
        };
        for child in children {
            self.merge_pass(child);
        }

        let mut collapsible = true;
        for child in children {
            let node = &mut self.nodes[child as usize];
            if node.children.is_some() || !node.items.get_mut().is_empty() {
                collapsible = false;
                break;
            }
        }
        if collapsible {
            for child in children {
                self.free.push(child);
            }
            self.nodes[idx as usize].children = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> QuadTree {
        QuadTree::new(Rect::new(0.0, 0.0, 1000.0, 1000.0), 8, 4)
    }

    fn collect(t: &QuadTree, shape: &Shape) -> Vec<CellId> {
        let mut out = Vec::new();
        t.query(shape, |id| out.push(id));
        out.sort_unstable();
        out
    }

    #[test]
    fn query_finds_everything_across_splits_and_merges() {
        let mut t = tree();
        // Cluster in the top-right quadrant, enough to force splits.
        for i in 0..16u16 {
            let x = 400.0 + (i % 4) as f32 * 20.0;
            let y = 400.0 + (i / 4) as f32 * 20.0;
            t.insert(i + 1, Circle::new(x, y, 5.0));
        }
        t.post_tick();
        assert!(t.node_count() > 1);

        let everything = Shape::Rect(Rect::new(0.0, 0.0, 1000.0, 1000.0));
        let found = collect(&t, &everything);
        assert_eq!(found, (1..=16).collect::<Vec<_>>());

        // Remove most of them; emptied quads collapse, the rest stay.
        for i in 3..16u16 {
            t.remove(i + 1);
        }
        let before = t.node_count();
        t.post_tick();
        assert!(t.node_count() < before);
        assert_eq!(collect(&t, &everything), vec![1, 2, 3]);

        // Removing the rest collapses the tree to its root.
        for id in [1, 2, 3] {
            t.remove(id);
        }
        t.post_tick();
        assert_eq!(t.node_count(), 1);
    }

    #[test]
    fn full_leaf_splits_even_without_overflow() {
        // max_items is 4, so four distributable items are enough.
        let mut t = tree();
        t.insert(1, Circle::new(-500.0, 500.0, 5.0));
        t.insert(2, Circle::new(500.0, 500.0, 5.0));
        t.insert(3, Circle::new(-500.0, -500.0, 5.0));
        t.insert(4, Circle::new(500.0, -500.0, 5.0));

        t.post_tick();
        assert_eq!(t.node_count(), 5);

        let everything = Shape::Rect(Rect::new(0.0, 0.0, 1000.0, 1000.0));
        assert_eq!(collect(&t, &everything), vec![1, 2, 3, 4]);
    }

    #[test]
    fn straddler_splits_collapse_back_each_pass() {
        // Five circles pinned on the root center can never distribute:
        // the split they force must be undone in the same pass, so no
        // interior node is left with four empty leaf children.
        let mut t = tree();
        for i in 0..5u16 {
            t.insert(i + 1, Circle::new(0.0, 0.0, 20.0 + i as f32));
        }
        let everything = Shape::Rect(Rect::new(0.0, 0.0, 1000.0, 1000.0));
        for _ in 0..3 {
            t.post_tick();
            assert_eq!(t.node_count(), 1);
            assert_eq!(collect(&t, &everything), vec![1, 2, 3, 4, 5]);
        }
    }

    #[test]
    fn straddling_items_stay_on_interior_nodes() {
        let mut t = tree();
        for i in 0..8u16 {
            t.insert(i + 1, Circle::new(300.0 + i as f32, 300.0, 5.0));
        }
        // Sits on the root's vertical axis.
        t.insert(100, Circle::new(0.0, 300.0, 10.0));
        t.post_tick();

        let probe = Shape::Circle(Circle::new(0.0, 300.0, 15.0));
        assert!(collect(&t, &probe).contains(&100));
    }

    #[test]
    fn relocate_walks_to_the_correct_node() {
        let mut t = tree();
        for i in 0..12u16 {
            t.insert(i + 1, Circle::new(-500.0 + i as f32 * 3.0, 500.0, 4.0));
        }
        t.post_tick();
        assert!(t.node_count() > 1);

        // Move one item diagonally across the whole map.
        t.relocate(1, Circle::new(500.0, -500.0, 4.0));
        let probe = Shape::Circle(Circle::new(500.0, -500.0, 10.0));
        assert_eq!(collect(&t, &probe), vec![1]);
        let old = Shape::Circle(Circle::new(-500.0, 500.0, 10.0));
        assert!(!collect(&t, &old).contains(&1));
    }

    #[test]
    fn untracked_ids_are_ignored() {
        let t = tree();
        t.remove(42);
        t.relocate(42, Circle::new(10.0, 10.0, 5.0));
        assert_eq!(t.len(), 0);
    }

    #[test]
    fn degenerate_shapes_match_nothing() {
        let t = tree();
        t.insert(1, Circle::new(0.0, 0.0, 10.0));
        assert!(collect(&t, &Shape::Circle(Circle::new(0.0, 0.0, 0.0))).is_empty());
        assert!(collect(&t, &Shape::Rect(Rect::new(0.0, 0.0, 0.0, 50.0))).is_empty());
    }

    #[test]
    fn any_match_short_circuits() {
        let t = tree();
        for i in 0..6u16 {
            t.insert(i + 1, Circle::new(i as f32 * 10.0, 0.0, 5.0));
        }
        let probe = Shape::Circle(Circle::new(0.0, 0.0, 100.0));
        let mut seen = 0;
        assert!(t.any_match(&probe, |_| {
            seen += 1;
            true
        }));
        assert_eq!(seen, 1);
        assert!(!t.any_match(&probe, |_| false));
    }
}
