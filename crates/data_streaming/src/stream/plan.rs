//! src/stream/plan.rs
//!
//! Deterministic iteration plan for one worker's slice groups.
//!
//! A round is one pass over an order list of group indexes. The plan keeps
//! up to `width` groups open at once and deals records from them round-robin,
//! so consecutive samples come from different slices while the whole
//! sequence stays a pure function of `(order, counts, width)`. That purity
//! is what makes checkpoint restore cheap: a saved position is just a count
//! of consumed samples, and `fast_forward` replays the bookkeeping without
//! touching storage.

use anyhow::{ensure, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

/// Group visit order for one round.
///
/// Training mode shuffles; `shuffle_over_epochs` of `n` shuffles `n` passes
/// worth of groups together, and -1 draws one pass with replacement.
/// Non-training order is the identity.
pub(crate) fn build_order(
    groups: usize,
    training: bool,
    shuffle_over_epochs: i64,
    seed: u64,
) -> Vec<usize> {
    if groups == 0 {
        return Vec::new();
    }
    if !training {
        return (0..groups).collect();
    }
    let mut rng = StdRng::seed_from_u64(seed);
    if shuffle_over_epochs == -1 {
        return (0..groups).map(|_| rng.random_range(0..groups)).collect();
    }
    let repeats = shuffle_over_epochs.max(1) as usize;
    let mut order: Vec<usize> = (0..repeats).flat_map(|_| 0..groups).collect();
    order.shuffle(&mut rng);
    order
}

/// Where one pull landed: reader slot, group, record index within the
/// group's slices, and whether the slot is now exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PlanPos {
    pub slot: usize,
    pub group: usize,
    pub index: u64,
    pub last: bool,
}

#[derive(Debug, Clone)]
struct OpenSlot {
    slot: usize,
    group: usize,
    taken: u64,
}

/// Cursor over one round. Every open order entry gets a fresh slot id, so a
/// group visited twice in one round maps to two distinct readers.
#[derive(Debug, Clone)]
pub(crate) struct RoundPlan {
    order: Vec<usize>,
    counts: Vec<u64>,
    width: usize,
    next_in_order: usize,
    next_slot: usize,
    open: Vec<OpenSlot>,
    turn: usize,
}

impl RoundPlan {
    pub(crate) fn new(order: Vec<usize>, counts: Vec<u64>, width: usize) -> Self {
        debug_assert!(order.iter().all(|&group| group < counts.len()));
        Self {
            order,
            counts,
            width: width.max(1),
            next_in_order: 0,
            next_slot: 0,
            open: Vec::new(),
            turn: 0,
        }
    }

    /// Advances the cursor by one sample; `None` ends the round.
    pub(crate) fn next(&mut self) -> Option<PlanPos> {
        while self.open.len() < self.width && self.next_in_order < self.order.len() {
            let group = self.order[self.next_in_order];
            self.next_in_order += 1;
            if self.counts[group] == 0 {
                continue;
            }
            self.open.push(OpenSlot {
                slot: self.next_slot,
                group,
                taken: 0,
            });
            self.next_slot += 1;
        }
        if self.open.is_empty() {
            return None;
        }
        if self.turn >= self.open.len() {
            self.turn = 0;
        }

        let open = &mut self.open[self.turn];
        let pos = PlanPos {
            slot: open.slot,
            group: open.group,
            index: open.taken,
            last: open.taken + 1 == self.counts[open.group],
        };
        open.taken += 1;
        if pos.last {
            // The next slot shifts into `turn`, keeping the rotation fair.
            self.open.remove(self.turn);
        } else {
            self.turn += 1;
            if self.turn >= self.open.len() {
                self.turn = 0;
            }
        }
        Some(pos)
    }

    /// Replays `consumed` pulls of bookkeeping without touching storage.
    pub(crate) fn fast_forward(&mut self, consumed: u64) -> Result<()> {
        for done in 0..consumed {
            ensure!(
                self.next().is_some(),
                "round ended after {done} of {consumed} restored samples; \
                 the checkpoint does not match this stream's shape"
            );
        }
        Ok(())
    }
}
