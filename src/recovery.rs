//! Recovery coordination
//!
//! Port resets are heavyweight host-controller calls and must never run on
//! the executor that the state machines advance on. They run on a dedicated
//! worker thread; everyone else parks on the [ResetGate] until the worker
//! signals completion. One gate per transport is enough: resets do not nest
//! and concurrent requesters all want the same outcome.

use std::sync::{Condvar, Mutex, PoisonError};

use crate::fmt::{error, info};
use crate::pipes::{UsbError, UsbPipes};

#[derive(Debug, Default)]
struct GateState {
    in_progress: bool,
    last_ok: bool,
}

/// A single mutex/condvar pair serialising device resets.
///
/// `begin` claims the gate, `finish` releases it and wakes every waiter,
/// `wait_idle` parks until no reset is running and reports how the last one
/// went. No busy spin anywhere.
#[derive(Debug)]
pub(crate) struct ResetGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl ResetGate {
    pub(crate) fn new() -> Self {
        ResetGate {
            state: Mutex::new(GateState {
                in_progress: false,
                last_ok: true,
            }),
            cond: Condvar::new(),
        }
    }

    /// Claims the gate. Returns false if a reset is already running, in
    /// which case the caller should `wait_idle` instead of starting another.
    pub(crate) fn begin(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.in_progress {
            false
        } else {
            state.in_progress = true;
            true
        }
    }

    /// Releases the gate, recording the outcome, and wakes all waiters.
    pub(crate) fn finish(&self, ok: bool) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.in_progress = false;
        state.last_ok = ok;
        self.cond.notify_all();
    }

    /// Parks until no reset is in progress; reports the last reset outcome.
    pub(crate) fn wait_idle(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        while state.in_progress {
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.last_ok
    }
}

/// The port-reset procedure: host-controller reset, then
/// CLEAR_FEATURE(ENDPOINT_HALT) on both bulk endpoints so the first command
/// after re-validation starts clean.
pub(crate) fn port_reset_sequence<P: UsbPipes>(
    pipes: &P,
    bulk_in: u8,
    bulk_out: u8,
) -> Result<(), UsbError> {
    info!("usbh: recovery: Port reset");
    pipes.reset_port()?;
    pipes.clear_stall(bulk_in)?;
    pipes.clear_stall(bulk_out)?;
    Ok(())
}

/// Runs the port-reset procedure on a scoped worker thread and parks the
/// caller on `gate` until it finishes. Used where no shared transport handle
/// exists yet (MaxLUN discovery during attach).
pub(crate) fn reset_on_worker<P: UsbPipes>(
    pipes: &P,
    gate: &ResetGate,
    bulk_in: u8,
    bulk_out: u8,
) -> bool {
    if gate.begin() {
        std::thread::scope(|scope| {
            scope.spawn(|| {
                let ok = match port_reset_sequence(pipes, bulk_in, bulk_out) {
                    Ok(()) => true,
                    Err(err) => {
                        error!("usbh: recovery: Port reset failed: {}", err);
                        false
                    }
                };
                gate.finish(ok);
            });
        });
    }
    gate.wait_idle()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn gate_serialises_one_reset() {
        let gate = ResetGate::new();
        assert!(gate.begin());
        assert!(!gate.begin());
        gate.finish(true);
        assert!(gate.begin());
        gate.finish(false);
        assert!(!gate.wait_idle());
    }

    #[test]
    fn waiters_park_until_finish() {
        let gate = Arc::new(ResetGate::new());
        assert!(gate.begin());

        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.wait_idle())
        };

        thread::sleep(Duration::from_millis(20));
        gate.finish(true);
        assert!(waiter.join().unwrap());
    }
}
