//! The scoring ensemble behind a detection session.
//!
//! Sessions only talk to the [`ForestOracle`] trait; [`RandomCutForest`] is
//! the robust random cut forest used by the detector binary.

mod tree;

use rand::rngs::StdRng;
use rand::SeedableRng;

pub use self::tree::RandomCutTree;
use self::tree::InsertError;
use super::slots::SlotId;
use super::DetectError;

/// Capacity-bounded ensemble of space-partitioning trees, addressed by
/// `(tree index, slot)`.
pub trait ForestOracle {
    fn num_trees(&self) -> usize;

    fn insert(&mut self, tree: usize, slot: SlotId, point: &[f64]) -> Result<(), DetectError>;

    fn evict(&mut self, tree: usize, slot: SlotId) -> Result<(), DetectError>;

    /// Displacement score of the point stored under `slot`.
    fn score(&self, tree: usize, slot: SlotId) -> Result<f64, DetectError>;

    /// Live points in one tree; 0 for an out-of-range index.
    fn live_count(&self, tree: usize) -> usize;

    /// The point stored under `slot`, if the oracle can report it.
    fn point(&self, _slot: SlotId) -> Option<Vec<f64>> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct RandomCutForest {
    trees: Vec<RandomCutTree>,
    capacity: usize,
    rng: StdRng,
}

impl RandomCutForest {
    /// Build an empty forest. `seed` pins cut selection for reproducible runs.
    pub fn new(num_trees: usize, capacity: usize, seed: Option<u64>) -> Result<Self, DetectError> {
        if num_trees == 0 {
            return Err(DetectError::InvalidConfig(
                "forest needs at least one tree".to_string(),
            ));
        }
        if capacity == 0 {
            return Err(DetectError::InvalidConfig(
                "forest capacity (leaves) must be positive".to_string(),
            ));
        }
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            trees: (0..num_trees).map(|_| RandomCutTree::new()).collect(),
            capacity,
            rng,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn tree(&self, tree: usize) -> Result<&RandomCutTree, DetectError> {
        self.trees.get(tree).ok_or(DetectError::TreeOutOfRange {
            tree,
            trees: self.trees.len(),
        })
    }
}

impl ForestOracle for RandomCutForest {
    fn num_trees(&self) -> usize {
        self.trees.len()
    }

    fn insert(&mut self, tree: usize, slot: SlotId, point: &[f64]) -> Result<(), DetectError> {
        let trees = self.trees.len();
        let t = self
            .trees
            .get_mut(tree)
            .ok_or(DetectError::TreeOutOfRange { tree, trees })?;
        if t.live_count() >= self.capacity {
            return Err(DetectError::SlotOverflow {
                capacity: self.capacity,
            });
        }
        t.insert(slot, point, &mut self.rng).map_err(|e| match e {
            InsertError::SlotInUse => DetectError::SlotInUse { tree, slot },
            InsertError::Dimension { expected } => DetectError::DimensionMismatch {
                expected,
                got: point.len(),
            },
        })
    }

    fn evict(&mut self, tree: usize, slot: SlotId) -> Result<(), DetectError> {
        let trees = self.trees.len();
        let t = self
            .trees
            .get_mut(tree)
            .ok_or(DetectError::TreeOutOfRange { tree, trees })?;
        if t.evict(slot) {
            Ok(())
        } else {
            Err(DetectError::UnknownSlot { tree, slot })
        }
    }

    fn score(&self, tree: usize, slot: SlotId) -> Result<f64, DetectError> {
        self.tree(tree)?
            .codisp(slot)
            .ok_or(DetectError::UnknownSlot { tree, slot })
    }

    fn live_count(&self, tree: usize) -> usize {
        self.trees.get(tree).map_or(0, RandomCutTree::live_count)
    }

    fn point(&self, slot: SlotId) -> Option<Vec<f64>> {
        self.trees.first()?.point(slot).map(<[f64]>::to_vec)
    }
}
