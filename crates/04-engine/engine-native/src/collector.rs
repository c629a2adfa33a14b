//! Per-slot batching thread.

use std::sync::Arc;
use std::time::{Duration, Instant};

use batch::{BufferGroup, SlotId};
use crossbeam_channel::{select, Receiver, Sender};
use parking_lot::Mutex;
use smem::wait::{HandOff, Phase};
use smem::{Array, ForeignBuffer, SmemResult};

use crate::client::{Request, RowReply};
use crate::threaded::NativeStats;

enum Next {
    Request(Request),
    Timeout,
    Shutdown,
}

/// Owns one slot's descriptors while the slot is in the native phase.
pub(crate) struct Collector {
    slot: SlotId,
    channel: String,
    capacity: usize,
    timeout: Duration,
    min_batchsize: usize,
    inputs: Vec<ForeignBuffer>,
    replies: Vec<ForeignBuffer>,
    handoff: Arc<HandOff>,
    requests: Receiver<Request>,
    shutdown: Receiver<()>,
    ready: Sender<(SlotId, usize)>,
    stats: Arc<Mutex<NativeStats>>,
}

pub(crate) struct CollectorLinks {
    pub(crate) handoff: Arc<HandOff>,
    pub(crate) requests: Receiver<Request>,
    pub(crate) shutdown: Receiver<()>,
    pub(crate) ready: Sender<(SlotId, usize)>,
    pub(crate) stats: Arc<Mutex<NativeStats>>,
}

impl Collector {
    /// # Safety
    ///
    /// The host may only touch the buffers of `group` while the slot's
    /// hand-off word is `Ready`.
    pub(crate) unsafe fn new(group: &BufferGroup, links: CollectorLinks) -> SmemResult<Self> {
        let open = |descs: &[smem::FieldDescriptor]| -> SmemResult<Vec<ForeignBuffer>> {
            descs
                .iter()
                // SAFETY: forwarded from the caller's contract.
                .map(|desc| unsafe { ForeignBuffer::new(desc.clone()) })
                .collect()
        };
        Ok(Self {
            slot: group.slot,
            channel: group.channel.clone(),
            capacity: group.capacity,
            timeout: group.timeout,
            min_batchsize: group.min_batchsize.clamp(1, group.capacity),
            inputs: open(&group.inputs)?,
            replies: open(&group.replies)?,
            handoff: links.handoff,
            requests: links.requests,
            shutdown: links.shutdown,
            ready: links.ready,
            stats: links.stats,
        })
    }

    pub(crate) fn run(mut self) {
        log::debug!(
            "collector for slot {} (`{}`) started: capacity={} timeout={:?} min_batchsize={}",
            self.slot,
            self.channel,
            self.capacity,
            self.timeout,
            self.min_batchsize
        );
        let mut pending = Vec::with_capacity(self.capacity);
        loop {
            pending.clear();
            if !self.collect(&mut pending) {
                break;
            }
            let size = pending.len();
            if self.handoff.publish().is_err() || self.ready.send((self.slot, size)).is_err() {
                break;
            }
            log::trace!("slot {} ready with {} rows", self.slot, size);
            if self.handoff.wait_released() != Phase::Released {
                break;
            }
            self.stats.lock().record(size, self.capacity);
            self.scatter(&pending);
            if self.handoff.reclaim().is_err() {
                break;
            }
        }
        log::debug!("collector for slot {} stopped", self.slot);
    }

    /// Fills rows until the batch is full, or until the timeout has expired
    /// with at least `min_batchsize` rows. A zero timeout waits for a full
    /// batch. Returns false on shutdown.
    fn collect(&mut self, pending: &mut Vec<Sender<RowReply>>) -> bool {
        let mut deadline = None;
        let mut expired = false;
        while pending.len() < self.capacity {
            match self.next(deadline) {
                Next::Request(request) => {
                    self.write(pending.len(), &request);
                    pending.push(request.reply);
                    if pending.len() == 1 && !self.timeout.is_zero() {
                        deadline = Some(Instant::now() + self.timeout);
                    }
                }
                Next::Timeout => {
                    deadline = None;
                    expired = true;
                }
                Next::Shutdown => return false,
            }
            if expired && pending.len() >= self.min_batchsize {
                break;
            }
        }
        true
    }

    fn next(&self, deadline: Option<Instant>) -> Next {
        match deadline {
            Some(deadline) => select! {
                recv(self.requests) -> msg => msg.map_or(Next::Shutdown, Next::Request),
                recv(self.shutdown) -> _ => Next::Shutdown,
                default(deadline.saturating_duration_since(Instant::now())) => Next::Timeout,
            },
            None => select! {
                recv(self.requests) -> msg => msg.map_or(Next::Shutdown, Next::Request),
                recv(self.shutdown) -> _ => Next::Shutdown,
            },
        }
    }

    fn write(&mut self, row: usize, request: &Request) {
        for (buffer, bytes) in self.inputs.iter_mut().zip(&request.inputs) {
            if let Err(err) = buffer.write_row_bytes(row, bytes) {
                log::error!(
                    "slot {}: failed to write `{}` row {row}: {err}",
                    self.slot,
                    buffer.descriptor().name
                );
            }
        }
    }

    fn scatter(&self, pending: &[Sender<RowReply>]) {
        for (row, reply) in pending.iter().enumerate() {
            let mut out = RowReply::default();
            for buffer in &self.replies {
                let desc = buffer.descriptor();
                let value = buffer
                    .read_row_bytes(row)
                    .and_then(|bytes| Array::from_bytes(desc.elem, &desc.shape[1..], &bytes));
                match value {
                    Ok(value) => out.push(desc.name.clone(), value),
                    Err(err) => log::error!(
                        "slot {}: failed to read `{}` row {row}: {err}",
                        self.slot,
                        desc.name
                    ),
                }
            }
            // The game may have given up on its reply.
            let _ = reply.send(out);
        }
    }
}
