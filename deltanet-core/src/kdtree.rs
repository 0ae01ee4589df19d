// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A KD-tree over the live equivalence-class rectangles, answering
//! "which classes intersect this rectangle" during rule insertion and
//! query evaluation.
//!
//! Splitting planes cycle through the axes by depth; a node's split
//! value is the midpoint of its own rectangle on that axis. Every node
//! also keeps the bounding box of its whole subtree, and both lookup
//! paths (`intersect`, `delete`) prune on the bounding boxes alone.
//! That keeps them correct even after deletions, which promote an
//! arbitrary leaf into the vacated slot and so do not preserve the
//! split-key invariant.

use crate::rect::HyperRectangle;

#[derive(Debug)]
struct Node {
    rect: HyperRectangle,
    // Bounding box of this node's rectangle and everything below it.
    bbox: Vec<u64>,
    axis: usize,
    split: u64,
    left: Option<Box<Node>>,
    right: Option<Box<Node>>,
}

impl Node {
    fn new(rect: HyperRectangle, axis: usize) -> Self {
        let bbox = rect.bounds().to_vec();
        let split = rect.mid(axis);
        Self { rect, bbox, axis, split, left: None, right: None }
    }
}

#[derive(Debug)]
pub struct KdTree {
    k: usize,
    root: Option<Box<Node>>,
    len: usize,
}

impl KdTree {
    pub fn new(k: usize) -> Self {
        assert!(k > 0);
        Self { k, root: None, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn insert(&mut self, rect: HyperRectangle) {
        assert_eq!(rect.dims(), self.k);
        let k = self.k;
        insert_rec(&mut self.root, rect, 0, k);
        self.len += 1;
    }

    /// Remove the rectangle with exactly these bounds. Returns whether
    /// anything was removed.
    pub fn delete(&mut self, rect: &HyperRectangle) -> bool {
        let removed = delete_rec(&mut self.root, rect);
        if removed {
            self.len -= 1;
        }
        removed
    }

    /// The alpha indices of all stored rectangles intersecting `q`, in
    /// a deterministic traversal order.
    pub fn intersect(&self, q: &HyperRectangle) -> Vec<usize> {
        let mut out = Vec::new();
        intersect_rec(&self.root, q, &mut out);
        out
    }

    /// Every stored rectangle, for invariant checks.
    pub fn rects(&self) -> Vec<&HyperRectangle> {
        let mut out = Vec::new();
        collect_rec(&self.root, &mut out);
        out
    }
}

fn insert_rec(
    slot: &mut Option<Box<Node>>,
    rect: HyperRectangle,
    axis: usize,
    k: usize,
) {
    match slot {
        None => *slot = Some(Box::new(Node::new(rect, axis))),
        Some(n) => {
            expand_bbox(&mut n.bbox, &rect);
            let next = (n.axis + 1) % k;
            if rect.mid(n.axis) < n.split {
                insert_rec(&mut n.left, rect, next, k);
            } else {
                insert_rec(&mut n.right, rect, next, k);
            }
        }
    }
}

fn delete_rec(slot: &mut Option<Box<Node>>, rect: &HyperRectangle) -> bool {
    let n = match slot {
        None => return false,
        Some(n) => n,
    };

    if !bbox_contains(&n.bbox, rect) {
        return false;
    }

    if n.rect == *rect {
        match pop_leaf(&mut n.left).or_else(|| pop_leaf(&mut n.right)) {
            Some(leaf) => {
                n.rect = leaf;
                refresh_bbox(n);
            }
            None => *slot = None,
        }
        return true;
    }

    if delete_rec(&mut n.left, rect) || delete_rec(&mut n.right, rect) {
        refresh_bbox(n);
        return true;
    }

    false
}

/// Detach some leaf of this subtree and hand back its rectangle.
fn pop_leaf(slot: &mut Option<Box<Node>>) -> Option<HyperRectangle> {
    {
        let n = slot.as_ref()?;
        if n.left.is_none() && n.right.is_none() {
            return Some(slot.take().unwrap().rect);
        }
    }

    let n = slot.as_mut().unwrap();
    let leaf = pop_leaf(&mut n.left).or_else(|| pop_leaf(&mut n.right));
    refresh_bbox(n);
    leaf
}

fn intersect_rec(
    slot: &Option<Box<Node>>,
    q: &HyperRectangle,
    out: &mut Vec<usize>,
) {
    let n = match slot {
        None => return,
        Some(n) => n,
    };

    if !bbox_overlaps(&n.bbox, q) {
        return;
    }

    if n.rect.intersects(q) {
        out.push(n.rect.alpha());
    }
    intersect_rec(&n.left, q, out);
    intersect_rec(&n.right, q, out);
}

fn collect_rec<'a>(slot: &'a Option<Box<Node>>, out: &mut Vec<&'a HyperRectangle>) {
    if let Some(n) = slot {
        out.push(&n.rect);
        collect_rec(&n.left, out);
        collect_rec(&n.right, out);
    }
}

fn expand_bbox(bbox: &mut [u64], rect: &HyperRectangle) {
    for d in 0..rect.dims() {
        bbox[2 * d] = bbox[2 * d].min(rect.lo(d));
        bbox[2 * d + 1] = bbox[2 * d + 1].max(rect.hi(d));
    }
}

fn bbox_contains(bbox: &[u64], rect: &HyperRectangle) -> bool {
    (0..rect.dims())
        .all(|d| bbox[2 * d] <= rect.lo(d) && rect.hi(d) <= bbox[2 * d + 1])
}

fn bbox_overlaps(bbox: &[u64], rect: &HyperRectangle) -> bool {
    (0..rect.dims())
        .all(|d| bbox[2 * d] < rect.hi(d) && rect.lo(d) < bbox[2 * d + 1])
}

fn refresh_bbox(n: &mut Node) {
    let mut bbox = n.rect.bounds().to_vec();
    for child in [&n.left, &n.right].into_iter().flatten() {
        for d in 0..bbox.len() / 2 {
            bbox[2 * d] = bbox[2 * d].min(child.bbox[2 * d]);
            bbox[2 * d + 1] = bbox[2 * d + 1].max(child.bbox[2 * d + 1]);
        }
    }
    n.bbox = bbox;
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn rect(alpha: usize, bounds: &[u64]) -> HyperRectangle {
        let mut r = HyperRectangle::new(bounds.to_vec());
        r.set_alpha(alpha);
        r
    }

    #[test]
    fn insert_and_intersect() {
        let mut tree = KdTree::new(2);
        tree.insert(rect(0, &[0, 10, 0, 10]));
        tree.insert(rect(1, &[10, 20, 0, 10]));
        tree.insert(rect(2, &[0, 10, 10, 20]));

        let mut hits = tree.intersect(&rect(0, &[5, 15, 5, 15]));
        hits.sort_unstable();
        assert_eq!(hits, vec![0, 1, 2]);

        let hits = tree.intersect(&rect(0, &[12, 15, 12, 15]));
        assert!(hits.is_empty());
    }

    #[test]
    fn delete_by_bounds() {
        let mut tree = KdTree::new(1);
        tree.insert(rect(0, &[0, 10]));
        tree.insert(rect(1, &[10, 20]));
        tree.insert(rect(2, &[20, 30]));
        assert_eq!(tree.len(), 3);

        assert!(tree.delete(&rect(9, &[10, 20])));
        assert!(!tree.delete(&rect(9, &[10, 20])));
        assert_eq!(tree.len(), 2);

        let mut hits = tree.intersect(&rect(0, &[0, 30]));
        hits.sort_unstable();
        assert_eq!(hits, vec![0, 2]);
    }

    // Drive the tree with a random insert/delete workload and compare
    // every intersection query against a linear scan.
    #[test]
    fn matches_linear_scan() {
        let mut rng = StdRng::seed_from_u64(7);
        let k = 3;
        let mut tree = KdTree::new(k);
        let mut live: Vec<HyperRectangle> = Vec::new();

        let random_rect = |rng: &mut StdRng, alpha: usize| {
            let mut bounds = Vec::new();
            for _ in 0..k {
                let lo = rng.gen_range(0..100u64);
                let hi = rng.gen_range(lo + 1..110);
                bounds.extend([lo, hi]);
            }
            rect(alpha, &bounds)
        };

        for i in 0..300 {
            if !live.is_empty() && rng.gen_bool(0.3) {
                let idx = rng.gen_range(0..live.len());
                let victim = live.swap_remove(idx);
                assert!(tree.delete(&victim));
            } else {
                // Deletion is by bounds, so keep the live set free of
                // bound-for-bound duplicates.
                let r = loop {
                    let r = random_rect(&mut rng, i);
                    if !live.contains(&r) {
                        break r;
                    }
                };
                tree.insert(r.clone());
                live.push(r);
            }
            assert_eq!(tree.len(), live.len());

            let q = random_rect(&mut rng, usize::MAX);
            let mut got = tree.intersect(&q);
            got.sort_unstable();
            let mut want: Vec<usize> = live
                .iter()
                .filter(|r| r.intersects(&q))
                .map(|r| r.alpha())
                .collect();
            want.sort_unstable();
            assert_eq!(got, want);
        }
    }
}
