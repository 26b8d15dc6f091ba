//! Bounded pool of reusable forest slots.
//!
//! The forest stores at most `capacity` points. Logical positions grow
//! without bound; each one maps onto a slot in `[0, capacity)`. Slots are
//! handed out oldest-first from an explicit queue so that a restarted
//! session resumes the same rotation it left off with.

use std::collections::VecDeque;

use super::DetectError;

pub type SlotId = usize;

/// A slot handed out by [`SlotRecycler::next_slot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub id: SlotId,
    /// Logical stream position this slot now stands for.
    pub position: u64,
    /// True when the slot came back out of the pool and still holds an
    /// older point that must be evicted before insertion.
    pub reused: bool,
}

#[derive(Debug, Clone)]
pub struct SlotRecycler {
    capacity: usize,
    pool: VecDeque<SlotId>,
    /// Slots handed out and not yet returned.
    outstanding: usize,
    next_position: u64,
}

impl SlotRecycler {
    /// Empty recycler for a forest with no prior points.
    pub fn new(capacity: usize) -> Result<Self, DetectError> {
        if capacity == 0 {
            return Err(DetectError::InvalidConfig(
                "slot capacity must be positive".to_string(),
            ));
        }
        Ok(Self {
            capacity,
            pool: VecDeque::with_capacity(capacity),
            outstanding: 0,
            next_position: 0,
        })
    }

    /// Recycler for a forest that already holds points up to
    /// `last_position`.
    ///
    /// When the forest holds a full `capacity` of live points the pool is
    /// seeded with the `capacity` most recent positions, otherwise with every
    /// position from 0 through `last_position`.
    pub fn seeded(
        capacity: usize,
        last_position: Option<u64>,
        live: usize,
    ) -> Result<Self, DetectError> {
        let mut recycler = Self::new(capacity)?;
        let Some(last) = last_position else {
            return Ok(recycler);
        };

        let cap = capacity as u64;
        let first = if live >= capacity && last + 1 >= cap {
            last + 1 - cap
        } else {
            0
        };
        if last - first + 1 > cap {
            return Err(DetectError::SlotOverflow { capacity });
        }
        for position in first..=last {
            recycler.pool.push_back((position % cap) as SlotId);
        }
        recycler.next_position = last + 1;
        Ok(recycler)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently waiting for reuse.
    pub fn pooled(&self) -> usize {
        self.pool.len()
    }

    /// Slots issued by [`Self::next_slot`] and not yet recycled.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Last logical position issued, if any.
    pub fn last_position(&self) -> Option<u64> {
        self.next_position.checked_sub(1)
    }

    /// Slots in the order they will be reused, oldest first.
    pub fn pooled_slots(&self) -> impl Iterator<Item = SlotId> + '_ {
        self.pool.iter().copied()
    }

    /// Issue the slot for the next logical position.
    ///
    /// Fresh slots are allocated until `capacity` slots exist; after that the
    /// oldest pooled slot is reused. With every slot issued and none pooled
    /// the request is an overflow and no position is consumed.
    pub fn next_slot(&mut self) -> Result<Slot, DetectError> {
        let allocated = self.pool.len() + self.outstanding;
        let (id, reused) = if allocated < self.capacity {
            (allocated, false)
        } else {
            match self.pool.pop_front() {
                Some(id) => (id, true),
                None => {
                    return Err(DetectError::SlotOverflow {
                        capacity: self.capacity,
                    })
                }
            }
        };

        let position = self.next_position;
        self.next_position += 1;
        self.outstanding += 1;
        Ok(Slot {
            id,
            position,
            reused,
        })
    }

    /// Return an issued slot to the pool once its new point has been
    /// inserted.
    pub fn recycle(&mut self, slot: SlotId) -> Result<(), DetectError> {
        if slot >= self.capacity || self.outstanding == 0 {
            return Err(DetectError::SlotOverflow {
                capacity: self.capacity,
            });
        }
        self.outstanding -= 1;
        self.pool.push_back(slot);
        Ok(())
    }
}
