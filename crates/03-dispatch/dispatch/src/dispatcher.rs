//! The wait -> build -> invoke -> reconcile -> step loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use batch::{Allocator, Batch, Reply, SlotId};
use serde::{Deserialize, Serialize};

use crate::callback::{Callback, CallbackTable};
use crate::engine::Engine;
use crate::error::{CoverageError, DispatchError, Error, ReconciliationError, Result, State};
use crate::stats::{DispatchMetrics, DispatchStats};

/// Loop settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Upper bound on one `wait`; `None` blocks until a slot is ready.
    pub wait_timeout: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Some(Duration::from_millis(100)),
        }
    }
}

/// Outcome of one [`Dispatcher::run`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cycle {
    /// A slot was serviced and released.
    Dispatched { slot: SlotId, size: usize },
    /// The wait timed out without a ready slot.
    Idle,
}

/// Requests a stop from outside the loop (another thread or a signal
/// handler). Checked between cycles only.
#[derive(Clone, Debug, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Owns the allocator, the engine, and the callback table.
pub struct Dispatcher<E: Engine, C> {
    engine: E,
    callbacks: CallbackTable<C>,
    allocator: Allocator,
    config: DispatcherConfig,
    state: State,
    stop: StopHandle,
    metrics: DispatchMetrics,
}

impl<E: Engine, C> Dispatcher<E, C> {
    /// Hands every slot's buffer group to the engine.
    pub fn new(allocator: Allocator, mut engine: E, config: DispatcherConfig) -> Result<Self> {
        for group in allocator.buffer_groups() {
            engine.allocate_buffer_group(&group)?;
        }
        Ok(Self {
            engine,
            callbacks: CallbackTable::new(allocator.num_slots()),
            metrics: DispatchMetrics::new(allocator.channels()),
            allocator,
            config,
            state: State::Unstarted,
            stop: StopHandle::default(),
        })
    }

    pub fn builder(allocator: Allocator, engine: E) -> DispatcherBuilder<E, C> {
        DispatcherBuilder::new(allocator, engine)
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.allocator.has_channel(channel)
    }

    fn require_not_stopped(&self, action: &'static str) -> Result<(), DispatchError> {
        if self.state == State::Stopped {
            return Err(DispatchError::Lifecycle {
                state: self.state,
                action,
            });
        }
        Ok(())
    }

    /// Registers `callback` for every slot of `channel`.
    pub fn register<F>(&mut self, channel: &str, callback: F) -> Result<()>
    where
        F: FnMut(&Batch<'_>, &mut C) -> anyhow::Result<Option<Reply>> + 'static,
    {
        self.register_boxed(channel, Box::new(callback))
    }

    fn register_boxed(&mut self, channel: &str, callback: Callback<C>) -> Result<()> {
        self.require_not_stopped("register a callback on")?;
        let slots = self
            .allocator
            .slots_of(channel)
            .ok_or_else(|| batch::ConfigError::UnknownChannel(channel.to_owned()))?;
        tracing::debug!(channel, slots = slots.len(), "callback registered");
        self.callbacks.assign(slots, callback);
        Ok(())
    }

    /// Registers `callback` for one slot only.
    pub fn register_slot<F>(&mut self, slot: SlotId, callback: F) -> Result<()>
    where
        F: FnMut(&Batch<'_>, &mut C) -> anyhow::Result<Option<Reply>> + 'static,
    {
        self.register_slot_boxed(slot, Box::new(callback))
    }

    fn register_slot_boxed(&mut self, slot: SlotId, callback: Callback<C>) -> Result<()> {
        self.require_not_stopped("register a callback on")?;
        if self.allocator.slot(slot).is_none() {
            return Err(DispatchError::UnknownSlot(slot).into());
        }
        self.callbacks.assign(&[slot], callback);
        Ok(())
    }

    /// Registers `callback` if `channel` exists; returns whether it did.
    ///
    /// An absent channel is `Ok(false)`; any other registration failure is
    /// returned as is.
    pub fn register_if_exists<F>(&mut self, channel: &str, callback: F) -> Result<bool>
    where
        F: FnMut(&Batch<'_>, &mut C) -> anyhow::Result<Option<Reply>> + 'static,
    {
        if !self.has_channel(channel) {
            return Ok(false);
        }
        self.register(channel, callback)?;
        Ok(true)
    }

    /// Fails with every slot that has no callback.
    pub fn check_callbacks(&self) -> Result<(), CoverageError> {
        let missing = self.callbacks.missing(&self.allocator);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(CoverageError { missing })
        }
    }

    /// `Unstarted -> Running`, only once every slot is covered.
    pub fn start(&mut self) -> Result<()> {
        if self.state != State::Unstarted {
            return Err(DispatchError::Lifecycle {
                state: self.state,
                action: "start",
            }
            .into());
        }
        self.check_callbacks()?;
        self.engine.start()?;
        self.state = State::Running;
        tracing::info!(
            slots = self.allocator.num_slots(),
            channels = self.allocator.channels().count(),
            "dispatcher started"
        );
        Ok(())
    }

    /// Runs one dispatch cycle.
    ///
    /// Any error leaves the slot unreleased and propagates unchanged; the
    /// loop never retries.
    pub fn run(&mut self, ctx: &mut C) -> Result<Cycle> {
        if self.state != State::Running {
            return Err(DispatchError::Lifecycle {
                state: self.state,
                action: "run",
            }
            .into());
        }
        let Some(ready) = self.engine.wait(self.config.wait_timeout)? else {
            self.metrics.record_idle();
            return Ok(Cycle::Idle);
        };
        let slot_id = ready.slot();
        let size = ready.size();
        let slot = self
            .allocator
            .slot(slot_id)
            .ok_or(DispatchError::UnknownSlot(slot_id))?;
        let channel = slot.channel().to_owned();
        let label_idx = slot.label_idx();
        let device = slot.device();
        if size == 0 || size > slot.capacity() {
            return Err(DispatchError::InvalidSize {
                channel,
                size,
                capacity: slot.capacity(),
            }
            .into());
        }
        tracing::trace!(slot = %slot_id, channel = %channel, size, "dispatching");

        let callback = self
            .callbacks
            .get_mut(slot_id)
            .ok_or_else(|| DispatchError::NoCallback {
                slot: slot_id,
                channel: channel.clone(),
            })?;
        let input = self
            .allocator
            .input_batch(slot_id, size)
            .map_err(|err| Error::from_batch(&channel, err))?;
        let outcome = if device.is_host() {
            callback(&input, ctx)
        } else {
            let on_device = input
                .to_device(device)
                .map_err(|err| Error::from_batch(&channel, err))?;
            callback(&on_device, ctx)
        };
        drop(input);
        let reply = outcome.map_err(|source| DispatchError::Callback {
            channel: channel.clone(),
            source,
        })?;

        self.reconcile(slot_id, size, &channel, reply)?;
        self.engine.step(ready)?;
        self.metrics.record_cycle(label_idx, size);
        Ok(Cycle::Dispatched {
            slot: slot_id,
            size,
        })
    }

    fn reconcile(
        &mut self,
        slot: SlotId,
        size: usize,
        channel: &str,
        reply: Option<Reply>,
    ) -> Result<()> {
        let target = self
            .allocator
            .reply_batch(slot, size)
            .map_err(|err| Error::from_batch(channel, err))?;
        let Some(mut target) = target else {
            return match reply {
                Some(reply) if !reply.is_empty() => Err(DispatchError::UnexpectedReply {
                    channel: channel.to_owned(),
                    keys: reply.keys().map(str::to_owned).collect(),
                }
                .into()),
                _ => Ok(()),
            };
        };
        let Some(reply) = reply else {
            return Err(DispatchError::MissingReply {
                channel: channel.to_owned(),
                expected: target.keys().map(str::to_owned).collect(),
            }
            .into());
        };
        let report = target
            .copy_from(&reply)
            .map_err(|err| Error::from_batch(channel, err))?;
        if !report.missing_keys.is_empty() {
            return Err(ReconciliationError {
                channel: channel.to_owned(),
                missing: report.missing_keys,
            }
            .into());
        }
        if !report.extra_keys.is_empty() {
            tracing::warn!(
                channel,
                extra = ?report.extra_keys,
                "reply has keys the channel does not declare"
            );
            self.metrics.record_extra_keys();
        }
        Ok(())
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Starts if needed, then runs cycles until the stop handle fires.
    pub fn run_until_stopped(&mut self, ctx: &mut C) -> Result<DispatchStats> {
        if self.state == State::Unstarted {
            self.start()?;
        }
        while !self.stop.is_stopped() {
            self.run(ctx)?;
        }
        self.stop()?;
        Ok(self.stats())
    }

    /// `Running -> Stopped`. Stopping twice is a no-op.
    pub fn stop(&mut self) -> Result<()> {
        match self.state {
            State::Running => {
                self.state = State::Stopped;
                self.engine.stop()?;
                tracing::info!(cycles = self.metrics.snapshot().cycles, "dispatcher stopped");
            }
            State::Unstarted => self.state = State::Stopped,
            State::Stopped => {}
        }
        Ok(())
    }

    pub fn stats(&self) -> DispatchStats {
        self.metrics.snapshot()
    }
}

impl<E: Engine, C> Drop for Dispatcher<E, C> {
    fn drop(&mut self) {
        if self.state == State::Running {
            if let Err(err) = self.stop() {
                tracing::error!("failed to stop engine: {err}");
            }
        }
    }
}

enum Target {
    Channel(String),
    Slot(SlotId),
}

/// Collects callbacks and refuses to build a dispatcher with uncovered slots.
pub struct DispatcherBuilder<E: Engine, C> {
    allocator: Allocator,
    engine: E,
    config: DispatcherConfig,
    callbacks: Vec<(Target, Callback<C>)>,
}

impl<E: Engine, C> DispatcherBuilder<E, C> {
    pub fn new(allocator: Allocator, engine: E) -> Self {
        Self {
            allocator,
            engine,
            config: DispatcherConfig::default(),
            callbacks: Vec::new(),
        }
    }

    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Callback for every slot of `channel`.
    pub fn on<F>(mut self, channel: impl Into<String>, callback: F) -> Self
    where
        F: FnMut(&Batch<'_>, &mut C) -> anyhow::Result<Option<Reply>> + 'static,
    {
        self.callbacks
            .push((Target::Channel(channel.into()), Box::new(callback)));
        self
    }

    /// Callback for a single slot; wins over a channel-wide one registered
    /// earlier.
    pub fn on_slot<F>(mut self, slot: SlotId, callback: F) -> Self
    where
        F: FnMut(&Batch<'_>, &mut C) -> anyhow::Result<Option<Reply>> + 'static,
    {
        self.callbacks.push((Target::Slot(slot), Box::new(callback)));
        self
    }

    /// Registers every callback and checks coverage.
    pub fn build(self) -> Result<Dispatcher<E, C>> {
        let mut dispatcher = Dispatcher::new(self.allocator, self.engine, self.config)?;
        for (target, callback) in self.callbacks {
            match target {
                Target::Channel(channel) => dispatcher.register_boxed(&channel, callback)?,
                Target::Slot(slot) => dispatcher.register_slot_boxed(slot, callback)?,
            }
        }
        dispatcher.check_callbacks()?;
        Ok(dispatcher)
    }
}
