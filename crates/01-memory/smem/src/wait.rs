//! Futex-style wait/notify and the per-slot phase word built on top of it.
//!
//! Native targets park on the `atomic-wait` crate. Loom builds stub the park
//! so the deterministic scheduler can explore interleavings; callers spin
//! with a yield instead.

#[cfg(feature = "loom")]
use loom::sync::atomic::{AtomicU32, Ordering};
#[cfg(not(feature = "loom"))]
use std::sync::atomic::{AtomicU32, Ordering};

/// Result of attempting to wait on an atomic location.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitResult {
    /// The caller parked and was woken (possibly spuriously).
    Woken,
    /// The value no longer matched when the wait was attempted.
    NotEqual,
}

#[cfg(feature = "loom")]
mod imp {
    use super::{AtomicU32, WaitResult};

    #[inline]
    pub(crate) fn wait_u32(atomic: &AtomicU32, expected: u32) -> WaitResult {
        let _ = (atomic, expected);
        loom::thread::yield_now();
        WaitResult::NotEqual
    }

    #[inline]
    pub(crate) fn wake_all(atomic: &AtomicU32) {
        let _ = atomic;
    }
}

#[cfg(not(feature = "loom"))]
mod imp {
    use super::{AtomicU32, Ordering, WaitResult};

    #[inline]
    pub(crate) fn wait_u32(atomic: &AtomicU32, expected: u32) -> WaitResult {
        if atomic.load(Ordering::Acquire) != expected {
            return WaitResult::NotEqual;
        }
        atomic_wait::wait(atomic, expected);
        WaitResult::Woken
    }

    #[inline]
    pub(crate) fn wake_all(atomic: &AtomicU32) {
        atomic_wait::wake_all(atomic as *const AtomicU32);
    }
}

/// Blocks while `atomic` holds `expected`, or until a wakeup occurs.
#[inline]
pub fn wait_u32(atomic: &AtomicU32, expected: u32) -> WaitResult {
    imp::wait_u32(atomic, expected)
}

/// Wakes all waiters parked on `atomic`.
#[inline]
pub fn wake_all(atomic: &AtomicU32) {
    imp::wake_all(atomic)
}

/// Ownership phase of one slot's buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Phase {
    /// The native side owns the buffers and is filling inputs.
    Filling = 0,
    /// Inputs are complete; the host owns the buffers until it steps.
    Ready = 1,
    /// The host has written replies and handed the buffers back.
    Released = 2,
    /// The slot is shut down; no further transitions.
    Closed = 3,
    /// Shutdown arrived after a release; the native side still delivers
    /// the replies, then the slot closes.
    Draining = 4,
}

impl Phase {
    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Phase::Filling,
            1 => Phase::Ready,
            2 => Phase::Released,
            4 => Phase::Draining,
            _ => Phase::Closed,
        }
    }
}

/// Phase word gating which side may touch a slot's buffers.
///
/// The native side moves `Filling -> Ready` with [`HandOff::publish`] and
/// parks in [`HandOff::wait_released`]; the host moves `Ready -> Released`
/// with [`HandOff::release`]. Release/acquire ordering on the word makes
/// every buffer write before a transition visible after it.
#[derive(Debug)]
pub struct HandOff {
    phase: AtomicU32,
}

impl Default for HandOff {
    fn default() -> Self {
        Self::new()
    }
}

impl HandOff {
    pub fn new() -> Self {
        Self {
            phase: AtomicU32::new(Phase::Filling as u32),
        }
    }

    pub fn phase(&self) -> Phase {
        Phase::from_raw(self.phase.load(Ordering::Acquire))
    }

    fn transition(&self, from: Phase, to: Phase) -> Result<(), Phase> {
        self.phase
            .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(Phase::from_raw)
    }

    /// Native side: inputs are written, hand the buffers to the host.
    pub fn publish(&self) -> Result<(), Phase> {
        self.transition(Phase::Filling, Phase::Ready)
    }

    /// Host side: replies are written, hand the buffers back.
    pub fn release(&self) -> Result<(), Phase> {
        self.transition(Phase::Ready, Phase::Released)?;
        wake_all(&self.phase);
        Ok(())
    }

    /// Native side: take the buffers back after reading replies.
    ///
    /// A slot that was closed while released moves to `Closed` here and
    /// reports it as the error.
    pub fn reclaim(&self) -> Result<(), Phase> {
        match self.transition(Phase::Released, Phase::Filling) {
            Err(Phase::Draining) => {
                self.phase.store(Phase::Closed as u32, Ordering::Release);
                Err(Phase::Closed)
            }
            other => other,
        }
    }

    /// Blocks while the host owns the buffers. Returns `Released` when the
    /// host stepped the slot, even if shutdown followed, otherwise `Closed`.
    pub fn wait_released(&self) -> Phase {
        loop {
            match self.phase() {
                Phase::Ready => {
                    wait_u32(&self.phase, Phase::Ready as u32);
                }
                Phase::Released | Phase::Draining => return Phase::Released,
                other => return other,
            }
        }
    }

    /// Shuts the slot down and wakes any parked waiter.
    ///
    /// A release already handed to the native side is kept: the slot drains
    /// instead, and closes on the next [`HandOff::reclaim`].
    pub fn close(&self) {
        let mut current = self.phase.load(Ordering::Acquire);
        loop {
            let next = match Phase::from_raw(current) {
                Phase::Released => Phase::Draining,
                Phase::Draining | Phase::Closed => break,
                Phase::Filling | Phase::Ready => Phase::Closed,
            };
            match self.phase.compare_exchange_weak(
                current,
                next as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        wake_all(&self.phase);
    }
}
