//! Callback table keyed by slot.

use batch::{Allocator, Batch, Reply, SlotId};

/// User code invoked with one input batch per cycle.
///
/// Returns `None` for "no reply" or a [`Reply`] mapping for the channel's
/// reply fields.
pub type Callback<C> = Box<dyn FnMut(&Batch<'_>, &mut C) -> anyhow::Result<Option<Reply>>>;

/// Slot -> callback mapping. One callback may serve several slots (all
/// replicas of a channel share the callback registered for it).
pub(crate) struct CallbackTable<C> {
    callbacks: Vec<Callback<C>>,
    by_slot: Vec<Option<usize>>,
}

impl<C> CallbackTable<C> {
    pub(crate) fn new(num_slots: usize) -> Self {
        Self {
            callbacks: Vec::new(),
            by_slot: vec![None; num_slots],
        }
    }

    /// Installs `callback` for every slot in `slots`, replacing earlier
    /// registrations. Callbacks no longer referenced by any slot are dropped.
    pub(crate) fn assign(&mut self, slots: &[SlotId], callback: Callback<C>) {
        let idx = self.callbacks.len();
        self.callbacks.push(callback);
        for slot in slots {
            if let Some(entry) = self.by_slot.get_mut(slot.index()) {
                *entry = Some(idx);
            }
        }
        self.compact();
    }

    fn compact(&mut self) {
        let mut used = vec![false; self.callbacks.len()];
        for idx in self.by_slot.iter().flatten() {
            used[*idx] = true;
        }
        if used.iter().all(|&u| u) {
            return;
        }
        let mut remap = vec![None; self.callbacks.len()];
        let mut kept = Vec::with_capacity(self.callbacks.len());
        for (old, callback) in std::mem::take(&mut self.callbacks).into_iter().enumerate() {
            if used[old] {
                remap[old] = Some(kept.len());
                kept.push(callback);
            }
        }
        self.callbacks = kept;
        for entry in &mut self.by_slot {
            *entry = entry.and_then(|old| remap[old]);
        }
    }

    pub(crate) fn get_mut(&mut self, slot: SlotId) -> Option<&mut Callback<C>> {
        let idx = (*self.by_slot.get(slot.index())?)?;
        self.callbacks.get_mut(idx)
    }

    pub(crate) fn contains(&self, slot: SlotId) -> bool {
        matches!(self.by_slot.get(slot.index()), Some(Some(_)))
    }

    /// Slots of `allocator` without a callback, with their channel names.
    pub(crate) fn missing(&self, allocator: &Allocator) -> Vec<(SlotId, String)> {
        allocator
            .slots()
            .filter(|slot| !self.contains(slot.id()))
            .map(|slot| (slot.id(), slot.channel().to_owned()))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.callbacks.len()
    }
}
