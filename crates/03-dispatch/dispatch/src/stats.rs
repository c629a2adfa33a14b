use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Counters updated by the dispatch loop.
#[derive(Default)]
pub(crate) struct DispatchMetrics {
    cycles: AtomicU64,
    rows: AtomicU64,
    idle_waits: AtomicU32,
    extra_key_warnings: AtomicU32,
    per_channel: Vec<(String, AtomicU64)>,
}

impl DispatchMetrics {
    pub(crate) fn new<'a>(channels: impl Iterator<Item = &'a str>) -> Self {
        Self {
            per_channel: channels
                .map(|name| (name.to_owned(), AtomicU64::new(0)))
                .collect(),
            ..Self::default()
        }
    }

    pub(crate) fn record_cycle(&self, label_idx: usize, rows: usize) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.rows.fetch_add(rows as u64, Ordering::Relaxed);
        if let Some((_, count)) = self.per_channel.get(label_idx) {
            count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_idle(&self) {
        self.idle_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_extra_keys(&self) {
        self.extra_key_warnings.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            cycles: self.cycles.load(Ordering::Relaxed),
            rows: self.rows.load(Ordering::Relaxed),
            idle_waits: self.idle_waits.load(Ordering::Relaxed),
            extra_key_warnings: self.extra_key_warnings.load(Ordering::Relaxed),
            per_channel: self
                .per_channel
                .iter()
                .map(|(name, count)| (name.clone(), count.load(Ordering::Relaxed)))
                .collect(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub cycles: u64,
    pub rows: u64,
    pub idle_waits: u32,
    pub extra_key_warnings: u32,
    /// Cycles per channel, in declaration order.
    pub per_channel: Vec<(String, u64)>,
}

impl DispatchStats {
    pub fn channel_cycles(&self, channel: &str) -> Option<u64> {
        self.per_channel
            .iter()
            .find_map(|(name, count)| (name == channel).then_some(*count))
    }

    /// Mean effective size over all dispatched cycles.
    pub fn mean_batch(&self) -> f64 {
        if self.cycles == 0 {
            0.0
        } else {
            self.rows as f64 / self.cycles as f64
        }
    }
}
