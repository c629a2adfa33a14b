//! Multi-threaded reference engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use batch::{BufferGroup, SlotId};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use dispatch::{Engine, EngineError, ReadySlot};
use parking_lot::Mutex;
use smem::wait::HandOff;

use crate::client::{Client, InputLayout, Request};
use crate::collector::{Collector, CollectorLinks};
use crate::error::NativeError;

/// Counters shared by all collector threads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NativeStats {
    /// Batches handed to the host and released.
    pub batches: u64,
    /// Rows across those batches.
    pub rows: u64,
    /// Batches released below capacity because their timeout expired.
    pub partial_batches: u64,
}

impl NativeStats {
    pub(crate) fn record(&mut self, size: usize, capacity: usize) {
        self.batches += 1;
        self.rows += size as u64;
        if size < capacity {
            self.partial_batches += 1;
        }
    }
}

struct ChannelQueue {
    client: Client,
    requests: Receiver<Request>,
}

struct SlotState {
    handoff: Arc<HandOff>,
    collector: Option<Collector>,
}

/// Engine that batches rows submitted by [`Client`]s on one thread per slot.
///
/// Every slot of a channel pulls from the same request queue, so duplicate
/// slots let one slot fill while another is with the host. Collectors hold
/// the registered descriptors, which keep their buffers allocated until the
/// collector threads are joined.
pub struct ThreadedEngine {
    channels: HashMap<String, ChannelQueue>,
    slots: Vec<Option<SlotState>>,
    ready_tx: Sender<(SlotId, usize)>,
    ready_rx: Receiver<(SlotId, usize)>,
    shutdown_tx: Option<Sender<()>>,
    shutdown_rx: Receiver<()>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<Mutex<NativeStats>>,
    running: bool,
}

impl Default for ThreadedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadedEngine {
    /// Creates an engine with no slots.
    pub fn new() -> Self {
        let (ready_tx, ready_rx) = unbounded();
        let (shutdown_tx, shutdown_rx) = unbounded();
        Self {
            channels: HashMap::new(),
            slots: Vec::new(),
            ready_tx,
            ready_rx,
            shutdown_tx: Some(shutdown_tx),
            shutdown_rx,
            workers: Vec::new(),
            stats: Arc::new(Mutex::new(NativeStats::default())),
            running: false,
        }
    }

    /// Producer handle for `channel`.
    pub fn client(&self, channel: &str) -> Result<Client, NativeError> {
        self.channels
            .get(channel)
            .map(|queue| queue.client.clone())
            .ok_or_else(|| NativeError::UnknownChannel(channel.to_owned()))
    }

    /// Snapshot of the collector counters.
    pub fn stats(&self) -> NativeStats {
        *self.stats.lock()
    }

    /// Whether [`Engine::start`] has run and [`Engine::stop`] has not.
    pub fn is_running(&self) -> bool {
        self.running
    }

    fn handoff(&self, slot: SlotId) -> Result<&HandOff, EngineError> {
        self.slots
            .get(slot.index())
            .and_then(Option::as_ref)
            .map(|state| state.handoff.as_ref())
            .ok_or(EngineError::UnknownSlot(slot))
    }

    fn shutdown(&mut self) -> Result<(), EngineError> {
        self.running = false;
        self.shutdown_tx.take();
        for state in self.slots.iter().flatten() {
            state.handoff.close();
        }
        let mut panicked = 0;
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                panicked += 1;
            }
        }
        // Dropping the queues fails every row that never made it into a batch.
        for (_, queue) in self.channels.drain() {
            while queue.requests.try_recv().is_ok() {}
        }
        while self.ready_rx.try_recv().is_ok() {}
        if panicked > 0 {
            log::error!("{panicked} collector threads panicked");
            return Err(EngineError::Failed(format!("{panicked} collector threads panicked")));
        }
        Ok(())
    }
}

impl Engine for ThreadedEngine {
    fn allocate_buffer_group(&mut self, group: &BufferGroup) -> Result<(), EngineError> {
        if self.running || self.shutdown_tx.is_none() {
            return Err(EngineError::AlreadyStarted);
        }
        if group.inputs.is_empty() {
            return Err(EngineError::Rejected {
                slot: group.slot,
                reason: format!("channel `{}` has no input fields", group.channel),
            });
        }
        let queue = self
            .channels
            .entry(group.channel.clone())
            .or_insert_with(|| {
                let (tx, rx) = unbounded();
                let layout: Arc<[InputLayout]> = group.inputs.iter().map(InputLayout::from).collect();
                ChannelQueue {
                    client: Client::new(Arc::from(group.channel.as_str()), layout, tx),
                    requests: rx,
                }
            });
        let handoff = Arc::new(HandOff::new());
        let links = CollectorLinks {
            handoff: Arc::clone(&handoff),
            requests: queue.requests.clone(),
            shutdown: self.shutdown_rx.clone(),
            ready: self.ready_tx.clone(),
            stats: Arc::clone(&self.stats),
        };
        // SAFETY: the collector only touches the buffers outside the `Ready`
        // phase, and the host only inside it.
        let collector = unsafe { Collector::new(group, links) }.map_err(|err| {
            EngineError::Rejected {
                slot: group.slot,
                reason: err.to_string(),
            }
        })?;

        let idx = group.slot.index();
        if self.slots.len() <= idx {
            self.slots.resize_with(idx + 1, || None);
        }
        self.slots[idx] = Some(SlotState {
            handoff,
            collector: Some(collector),
        });
        log::debug!("registered slot {} for channel `{}`", group.slot, group.channel);
        Ok(())
    }

    fn start(&mut self) -> Result<(), EngineError> {
        if self.running || self.shutdown_tx.is_none() {
            return Err(EngineError::AlreadyStarted);
        }
        for state in self.slots.iter_mut().flatten() {
            let Some(collector) = state.collector.take() else {
                continue;
            };
            let worker = thread::Builder::new()
                .name("smem-collector".into())
                .spawn(move || collector.run())
                .map_err(|err| EngineError::Failed(format!("spawn collector: {err}")))?;
            self.workers.push(worker);
        }
        self.running = true;
        log::info!("threaded engine started with {} collectors", self.workers.len());
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<Option<ReadySlot>, EngineError> {
        if !self.running {
            return Err(EngineError::NotRunning);
        }
        let next = match timeout {
            Some(timeout) => match self.ready_rx.recv_timeout(timeout) {
                Ok(next) => Some(next),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(EngineError::Failed("ready queue disconnected".into()))
                }
            },
            None => Some(
                self.ready_rx
                    .recv()
                    .map_err(|_| EngineError::Failed("ready queue disconnected".into()))?,
            ),
        };
        Ok(next.map(|(slot, size)| ReadySlot::new(slot, size)))
    }

    fn step(&mut self, ready: ReadySlot) -> Result<(), EngineError> {
        let slot = ready.slot();
        self.handoff(slot)?
            .release()
            .map_err(|_| EngineError::NotReady(slot))
    }

    fn stop(&mut self) -> Result<(), EngineError> {
        if !self.running {
            return Ok(());
        }
        let result = self.shutdown();
        log::info!("threaded engine stopped: {:?}", self.stats());
        result
    }
}

impl Drop for ThreadedEngine {
    fn drop(&mut self) {
        if !self.workers.is_empty() || self.running {
            if let Err(err) = self.shutdown() {
                log::error!("threaded engine shutdown failed: {err}");
            }
        }
    }
}
