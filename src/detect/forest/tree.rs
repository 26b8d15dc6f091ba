//! A single robust random cut tree stored as an index arena.
//!
//! Leaves hold a point and the slots that reference it (duplicates share a
//! leaf). Branches hold the cut and the bounding box of their subtree.

use std::collections::HashMap;

use rand::Rng;

use crate::detect::slots::SlotId;

type NodeId = usize;

#[derive(Debug, Clone)]
enum Kind {
    Leaf {
        point: Vec<f64>,
        slots: Vec<SlotId>,
    },
    Branch {
        dim: usize,
        cut: f64,
        left: NodeId,
        right: NodeId,
        min: Vec<f64>,
        max: Vec<f64>,
    },
}

#[derive(Debug, Clone)]
struct Node {
    parent: Option<NodeId>,
    count: usize,
    kind: Kind,
}

#[derive(Debug, Clone, Default)]
pub struct RandomCutTree {
    nodes: Vec<Node>,
    free: Vec<NodeId>,
    root: Option<NodeId>,
    leaves: HashMap<SlotId, NodeId>,
}

/// Result of a failed insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    SlotInUse,
    Dimension { expected: usize },
}

impl RandomCutTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live slots (duplicates counted individually).
    pub fn live_count(&self) -> usize {
        self.leaves.len()
    }

    pub fn point(&self, slot: SlotId) -> Option<&[f64]> {
        let leaf = *self.leaves.get(&slot)?;
        match &self.nodes[leaf].kind {
            Kind::Leaf { point, .. } => Some(point),
            Kind::Branch { .. } => None,
        }
    }

    fn dimensions(&self) -> Option<usize> {
        let root = self.root?;
        let (lo, _) = self.bbox(root);
        Some(lo.len())
    }

    pub fn insert<R: Rng>(
        &mut self,
        slot: SlotId,
        point: &[f64],
        rng: &mut R,
    ) -> Result<(), InsertError> {
        if self.leaves.contains_key(&slot) {
            return Err(InsertError::SlotInUse);
        }
        if let Some(expected) = self.dimensions() {
            if expected != point.len() {
                return Err(InsertError::Dimension { expected });
            }
        }

        let Some(root) = self.root else {
            let leaf = self.alloc(Node {
                parent: None,
                count: 1,
                kind: Kind::Leaf {
                    point: point.to_vec(),
                    slots: vec![slot],
                },
            });
            self.root = Some(leaf);
            self.leaves.insert(slot, leaf);
            return Ok(());
        };

        if let Some(leaf) = self.find_duplicate(point) {
            if let Kind::Leaf { slots, .. } = &mut self.nodes[leaf].kind {
                slots.push(slot);
            }
            self.adjust_counts(Some(leaf), 1);
            self.leaves.insert(slot, leaf);
            return Ok(());
        }

        let mut node = root;
        let mut parent: Option<NodeId> = None;
        let mut went_left = false;
        let (dim, cut, leaf_left) = loop {
            let (lo, hi) = self.bbox(node);
            let (dim, cut) = random_cut(lo, hi, point, rng);
            if cut <= lo[dim] {
                break (dim, cut, true);
            }
            if cut >= hi[dim] {
                break (dim, cut, false);
            }
            match &self.nodes[node].kind {
                Kind::Branch {
                    dim: d,
                    cut: c,
                    left,
                    right,
                    ..
                } => {
                    parent = Some(node);
                    went_left = point[*d] <= *c;
                    node = if went_left { *left } else { *right };
                }
                Kind::Leaf { .. } => break (dim, cut, point[dim] <= cut),
            }
        };

        let leaf = self.alloc(Node {
            parent: None,
            count: 1,
            kind: Kind::Leaf {
                point: point.to_vec(),
                slots: vec![slot],
            },
        });

        let (lo, hi) = self.bbox(node);
        let min: Vec<f64> = lo.iter().zip(point).map(|(a, b)| a.min(*b)).collect();
        let max: Vec<f64> = hi.iter().zip(point).map(|(a, b)| a.max(*b)).collect();
        let (left, right) = if leaf_left { (leaf, node) } else { (node, leaf) };
        let count = self.nodes[node].count + 1;
        let branch = self.alloc(Node {
            parent,
            count,
            kind: Kind::Branch {
                dim,
                cut,
                left,
                right,
                min,
                max,
            },
        });
        self.nodes[node].parent = Some(branch);
        self.nodes[leaf].parent = Some(branch);

        match parent {
            None => self.root = Some(branch),
            Some(p) => {
                if let Kind::Branch { left, right, .. } = &mut self.nodes[p].kind {
                    if went_left {
                        *left = branch;
                    } else {
                        *right = branch;
                    }
                }
            }
        }

        let mut cur = parent;
        while let Some(id) = cur {
            let n = &mut self.nodes[id];
            n.count += 1;
            if let Kind::Branch { min, max, .. } = &mut n.kind {
                for (i, v) in point.iter().enumerate() {
                    min[i] = min[i].min(*v);
                    max[i] = max[i].max(*v);
                }
            }
            cur = n.parent;
        }

        self.leaves.insert(slot, leaf);
        Ok(())
    }

    /// Remove the point stored under `slot`. Returns false if it is not live.
    pub fn evict(&mut self, slot: SlotId) -> bool {
        let Some(leaf) = self.leaves.remove(&slot) else {
            return false;
        };

        if self.nodes[leaf].count > 1 {
            if let Kind::Leaf { slots, .. } = &mut self.nodes[leaf].kind {
                slots.retain(|s| *s != slot);
            }
            self.adjust_counts(Some(leaf), -1);
            return true;
        }

        let parent = self.nodes[leaf].parent;
        self.release(leaf);

        let Some(parent) = parent else {
            self.root = None;
            return true;
        };

        let sibling = self.sibling(parent, leaf);
        let grand = self.nodes[parent].parent;
        self.nodes[sibling].parent = grand;
        match grand {
            None => self.root = Some(sibling),
            Some(g) => {
                if let Kind::Branch { left, right, .. } = &mut self.nodes[g].kind {
                    if *left == parent {
                        *left = sibling;
                    } else {
                        *right = sibling;
                    }
                }
            }
        }
        self.release(parent);

        let mut cur = grand;
        while let Some(id) = cur {
            self.nodes[id].count -= 1;
            self.tighten(id);
            cur = self.nodes[id].parent;
        }
        true
    }

    /// Collusive displacement of the point under `slot`: the largest ratio of
    /// sibling size to subtree size along the path to the root.
    pub fn codisp(&self, slot: SlotId) -> Option<f64> {
        let mut node = *self.leaves.get(&slot)?;
        let mut best = 0.0_f64;
        while let Some(parent) = self.nodes[node].parent {
            let sibling = self.sibling(parent, node);
            let ratio = self.nodes[sibling].count as f64 / self.nodes[node].count as f64;
            best = best.max(ratio);
            node = parent;
        }
        Some(best)
    }

    fn find_duplicate(&self, point: &[f64]) -> Option<NodeId> {
        let mut node = self.root?;
        loop {
            match &self.nodes[node].kind {
                Kind::Branch {
                    dim,
                    cut,
                    left,
                    right,
                    ..
                } => node = if point[*dim] <= *cut { *left } else { *right },
                Kind::Leaf { point: p, .. } => {
                    return (p.as_slice() == point).then_some(node);
                }
            }
        }
    }

    fn bbox(&self, id: NodeId) -> (&[f64], &[f64]) {
        match &self.nodes[id].kind {
            Kind::Leaf { point, .. } => (point, point),
            Kind::Branch { min, max, .. } => (min, max),
        }
    }

    fn sibling(&self, parent: NodeId, child: NodeId) -> NodeId {
        match &self.nodes[parent].kind {
            Kind::Branch { left, right, .. } => {
                if *left == child {
                    *right
                } else {
                    *left
                }
            }
            Kind::Leaf { .. } => child,
        }
    }

    /// Recompute a branch's bounding box from its children.
    fn tighten(&mut self, id: NodeId) {
        let (left, right) = match &self.nodes[id].kind {
            Kind::Branch { left, right, .. } => (*left, *right),
            Kind::Leaf { .. } => return,
        };
        let (llo, lhi) = self.bbox(left);
        let (rlo, rhi) = self.bbox(right);
        let new_min: Vec<f64> = llo.iter().zip(rlo).map(|(a, b)| a.min(*b)).collect();
        let new_max: Vec<f64> = lhi.iter().zip(rhi).map(|(a, b)| a.max(*b)).collect();
        if let Kind::Branch { min, max, .. } = &mut self.nodes[id].kind {
            *min = new_min;
            *max = new_max;
        }
    }

    fn adjust_counts(&mut self, from: Option<NodeId>, delta: isize) {
        let mut cur = from;
        while let Some(id) = cur {
            let n = &mut self.nodes[id];
            n.count = n.count.saturating_add_signed(delta);
            cur = n.parent;
        }
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.nodes[id] = node;
                id
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, id: NodeId) {
        self.nodes[id] = Node {
            parent: None,
            count: 0,
            kind: Kind::Leaf {
                point: Vec::new(),
                slots: Vec::new(),
            },
        };
        self.free.push(id);
    }
}

/// Pick a cut dimension with probability proportional to its span in the
/// box extended by `point`, then a uniform cut position along it.
fn random_cut<R: Rng>(lo: &[f64], hi: &[f64], point: &[f64], rng: &mut R) -> (usize, f64) {
    let lo_hat: Vec<f64> = lo.iter().zip(point).map(|(a, b)| a.min(*b)).collect();
    let hi_hat: Vec<f64> = hi.iter().zip(point).map(|(a, b)| a.max(*b)).collect();
    let spans: Vec<f64> = hi_hat.iter().zip(&lo_hat).map(|(h, l)| h - l).collect();
    let total: f64 = spans.iter().sum();
    if total.is_infinite() {
        return scaled_cut(&lo_hat, &hi_hat, rng);
    }
    if !(total > 0.0) {
        return (0, lo_hat[0]);
    }

    let r = rng.gen_range(0.0..total);
    let mut acc = 0.0;
    for (dim, span) in spans.iter().enumerate() {
        acc += span;
        if *span > 0.0 && acc >= r {
            return (dim, lo_hat[dim] + acc - r);
        }
    }
    let last = spans.iter().rposition(|s| *s > 0.0).unwrap_or(0);
    (last, lo_hat[last] + spans[last])
}

/// Cut for a box whose span overflows `f64`. Dimensions are weighted by
/// half-spans relative to the widest one and the cut is interpolated between
/// the box edges, so no intermediate value leaves the finite range.
fn scaled_cut<R: Rng>(lo: &[f64], hi: &[f64], rng: &mut R) -> (usize, f64) {
    let half: Vec<f64> = lo.iter().zip(hi).map(|(l, h)| h * 0.5 - l * 0.5).collect();
    let widest = half.iter().copied().fold(0.0, f64::max);
    if !(widest > 0.0) {
        return (0, lo[0]);
    }
    let weights: Vec<f64> = half.iter().map(|s| s / widest).collect();
    let total: f64 = weights.iter().sum();

    let r = rng.gen_range(0.0..total);
    let mut acc = 0.0;
    for (dim, w) in weights.iter().enumerate() {
        acc += w;
        if *w > 0.0 && acc >= r {
            let frac = ((acc - r) / w).clamp(0.0, 1.0);
            return (dim, lo[dim] * (1.0 - frac) + hi[dim] * frac);
        }
    }
    let last = weights.iter().rposition(|w| *w > 0.0).unwrap_or(0);
    (last, hi[last])
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn test_insert_and_evict_keep_counts_consistent() {
        let mut tree = RandomCutTree::new();
        let mut rng = rng();
        for i in 0..20 {
            tree.insert(i, &[i as f64, (i % 3) as f64], &mut rng).unwrap();
        }
        assert_eq!(tree.live_count(), 20);
        assert_eq!(tree.nodes[tree.root.unwrap()].count, 20);

        for i in (0..20).step_by(2) {
            assert!(tree.evict(i));
        }
        assert_eq!(tree.live_count(), 10);
        assert_eq!(tree.nodes[tree.root.unwrap()].count, 10);
        assert!(!tree.evict(0));

        for i in (1..20).step_by(2) {
            assert!(tree.evict(i));
        }
        assert!(tree.root.is_none());
        assert_eq!(tree.live_count(), 0);
    }

    #[test]
    fn test_outlier_scores_higher_than_inlier() {
        let mut tree = RandomCutTree::new();
        let mut rng = rng();
        for i in 0..64 {
            let x = (i % 8) as f64 * 0.1;
            let y = (i / 8) as f64 * 0.1;
            tree.insert(i, &[x, y], &mut rng).unwrap();
        }
        tree.insert(100, &[1.0e4, -1.0e4], &mut rng).unwrap();

        let outlier = tree.codisp(100).unwrap();
        let inlier = tree.codisp(27).unwrap();
        assert!(outlier > inlier, "outlier {} <= inlier {}", outlier, inlier);
        assert!(outlier >= 32.0);
    }

    #[test]
    fn test_duplicates_share_a_leaf() {
        let mut tree = RandomCutTree::new();
        let mut rng = rng();
        tree.insert(0, &[1.0, 1.0], &mut rng).unwrap();
        tree.insert(1, &[5.0, 5.0], &mut rng).unwrap();
        tree.insert(2, &[1.0, 1.0], &mut rng).unwrap();
        assert_eq!(tree.live_count(), 3);
        assert_eq!(tree.leaves[&0], tree.leaves[&2]);

        assert!(tree.evict(0));
        assert_eq!(tree.point(2), Some(&[1.0, 1.0][..]));
        assert_eq!(tree.nodes[tree.root.unwrap()].count, 2);
    }

    #[test]
    fn test_rejects_live_slot_and_wrong_dimension() {
        let mut tree = RandomCutTree::new();
        let mut rng = rng();
        tree.insert(0, &[1.0, 2.0], &mut rng).unwrap();
        assert_eq!(tree.insert(0, &[3.0, 4.0], &mut rng), Err(InsertError::SlotInUse));
        assert_eq!(
            tree.insert(1, &[3.0], &mut rng),
            Err(InsertError::Dimension { expected: 2 })
        );
    }

    #[test]
    fn test_extreme_magnitudes_do_not_overflow_cuts() {
        let mut tree = RandomCutTree::new();
        let mut rng = rng();
        tree.insert(0, &[0.0, 0.0], &mut rng).unwrap();
        tree.insert(1, &[1.0e308, 1.0e308], &mut rng).unwrap();
        tree.insert(2, &[-1.0e308, 1.0e308], &mut rng).unwrap();
        tree.insert(3, &[f64::MAX, -f64::MAX], &mut rng).unwrap();
        assert_eq!(tree.live_count(), 4);
        for slot in 0..4 {
            assert!(tree.codisp(slot).unwrap().is_finite());
        }
    }

    #[test]
    fn test_scaled_cut_stays_inside_box() {
        let mut rng = rng();
        for _ in 0..100 {
            let (dim, cut) = random_cut(&[-f64::MAX, 0.0], &[f64::MAX, 1.0], &[0.0, 0.5], &mut rng);
            assert!(dim < 2);
            assert!(cut.is_finite());
            if dim == 1 {
                assert!((0.0..=1.0).contains(&cut));
            }
        }
    }

    #[test]
    fn test_single_point_scores_zero() {
        let mut tree = RandomCutTree::new();
        tree.insert(0, &[1.0], &mut rng()).unwrap();
        assert_eq!(tree.codisp(0), Some(0.0));
        assert_eq!(tree.codisp(9), None);
    }
}
