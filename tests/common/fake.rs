use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use usbh_storage::pipes::{DeviceRequest, UsbError, UsbPipes};

/// Scripted outcome of one transfer
#[derive(Debug, Clone)]
pub enum Reply {
    /// Data handed back to an IN transfer
    Bytes(Vec<u8>),
    /// Byte count acknowledged for an OUT transfer
    Accept(usize),
    Error(UsbError),
    /// Park the transfer until its pipe is aborted
    Block,
}

/// Everything the transport did, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    BulkIn { endpoint: u8, len: usize },
    BulkOut { endpoint: u8, data: Vec<u8> },
    InterruptIn { endpoint: u8 },
    ControlIn { req: DeviceRequest },
    ControlOut { req: DeviceRequest, data: Vec<u8> },
    ClearStall { endpoint: u8 },
    ResetPipe { endpoint: u8 },
    AbortPipe { endpoint: u8 },
    ResetPort,
}

#[derive(Default)]
struct Inner {
    script: VecDeque<Reply>,
    ops: Vec<Op>,
    reset_results: VecDeque<Result<(), UsbError>>,
    aborted: HashSet<u8>,
}

/// A scripted stand-in for the USB stack.
///
/// Every transfer (bulk, interrupt, control) pops the next [Reply] off the
/// script; housekeeping calls (clear stall, pipe reset, abort, port reset)
/// succeed unless scripted otherwise. Everything lands in the op journal for
/// the test to assert on. A transfer with no scripted reply is a test bug
/// and panics.
#[derive(Clone)]
pub struct FakePipes {
    inner: Arc<(Mutex<Inner>, Condvar)>,
}

impl FakePipes {
    pub fn new() -> Self {
        FakePipes {
            inner: Arc::new((Mutex::new(Inner::default()), Condvar::new())),
        }
    }

    pub fn script(&self, replies: impl IntoIterator<Item = Reply>) {
        let mut inner = self.inner.0.lock().unwrap();
        inner.script.extend(replies);
    }

    /// Queues an outcome for the next port reset (default is success)
    pub fn script_reset(&self, result: Result<(), UsbError>) {
        self.inner.0.lock().unwrap().reset_results.push_back(result);
    }

    pub fn ops(&self) -> Vec<Op> {
        self.inner.0.lock().unwrap().ops.clone()
    }

    pub fn remaining_script(&self) -> usize {
        self.inner.0.lock().unwrap().script.len()
    }

    /// Journals `op`, then resolves the next scripted reply, parking on a
    /// [Reply::Block] until the endpoint is aborted.
    fn transact(&self, op: Op, endpoint: u8) -> Reply {
        let (lock, cond) = &*self.inner;
        let mut inner = lock.lock().unwrap();
        inner.ops.push(op);
        match inner.script.pop_front() {
            Some(Reply::Block) => {
                while !inner.aborted.contains(&endpoint) {
                    inner = cond.wait(inner).unwrap();
                }
                Reply::Error(UsbError::Aborted)
            }
            Some(reply) => reply,
            None => panic!("transfer without a scripted reply: {:?}", inner.ops.last()),
        }
    }

    fn record(&self, op: Op) {
        self.inner.0.lock().unwrap().ops.push(op);
    }
}

impl UsbPipes for FakePipes {
    fn bulk_in(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        _no_data_timeout: Duration,
        _completion_timeout: Duration,
    ) -> Result<usize, UsbError> {
        let op = Op::BulkIn {
            endpoint,
            len: buf.len(),
        };
        match self.transact(op, endpoint) {
            Reply::Bytes(bytes) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(n)
            }
            Reply::Accept(n) => Ok(n),
            Reply::Error(err) => Err(err),
            Reply::Block => unreachable!(),
        }
    }

    fn bulk_out(
        &self,
        endpoint: u8,
        buf: &[u8],
        _no_data_timeout: Duration,
        _completion_timeout: Duration,
    ) -> Result<usize, UsbError> {
        let op = Op::BulkOut {
            endpoint,
            data: buf.to_vec(),
        };
        match self.transact(op, endpoint) {
            Reply::Accept(n) => Ok(n),
            Reply::Bytes(_) => Ok(buf.len()),
            Reply::Error(err) => Err(err),
            Reply::Block => unreachable!(),
        }
    }

    fn interrupt_in(&self, endpoint: u8, buf: &mut [u8]) -> Result<usize, UsbError> {
        match self.transact(Op::InterruptIn { endpoint }, endpoint) {
            Reply::Bytes(bytes) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(n)
            }
            Reply::Accept(n) => Ok(n),
            Reply::Error(err) => Err(err),
            Reply::Block => unreachable!(),
        }
    }

    fn control_in(&self, req: DeviceRequest, buf: &mut [u8]) -> Result<usize, UsbError> {
        match self.transact(Op::ControlIn { req }, 0) {
            Reply::Bytes(bytes) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(n)
            }
            Reply::Accept(n) => Ok(n),
            Reply::Error(err) => Err(err),
            Reply::Block => unreachable!(),
        }
    }

    fn control_out(&self, req: DeviceRequest, data: &[u8]) -> Result<(), UsbError> {
        let op = Op::ControlOut {
            req,
            data: data.to_vec(),
        };
        match self.transact(op, 0) {
            Reply::Error(err) => Err(err),
            _ => Ok(()),
        }
    }

    fn clear_stall(&self, endpoint: u8) -> Result<(), UsbError> {
        self.record(Op::ClearStall { endpoint });
        Ok(())
    }

    fn reset_pipe(&self, endpoint: u8) -> Result<(), UsbError> {
        self.record(Op::ResetPipe { endpoint });
        Ok(())
    }

    fn abort_pipe(&self, endpoint: u8) -> Result<(), UsbError> {
        let (lock, cond) = &*self.inner;
        let mut inner = lock.lock().unwrap();
        inner.ops.push(Op::AbortPipe { endpoint });
        inner.aborted.insert(endpoint);
        cond.notify_all();
        Ok(())
    }

    fn reset_port(&self) -> Result<(), UsbError> {
        let mut inner = self.inner.0.lock().unwrap();
        inner.ops.push(Op::ResetPort);
        inner.reset_results.pop_front().unwrap_or(Ok(()))
    }
}
