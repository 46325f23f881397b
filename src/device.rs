//! Transport core
//!
//! Owns one opened Mass Storage interface: resolves the transport variant
//! (with quirk overrides), discovers MaxLUN, publishes one [LogicalUnit] nub
//! per LUN, arbitrates the single in-flight command and coordinates recovery
//! and teardown.
//!
//! Commands are executed on a dedicated thread consuming a channel; every
//! submission is fully staged into a request block before it is handed over,
//! so the executor never observes a half-initialised command. The executor
//! holds a strong reference to the transport only while a command is in
//! flight, which lets an abandoned transport tear itself down.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use thiserror::Error;

use crate::fmt::{debug, error, info, trace, warn};
use crate::pipes::{self, UsbError, UsbPipes};
use crate::quirks::Quirks;
use crate::recovery::{self, ResetGate};
use crate::scsi::{ScsiTask, ServiceResponse, TaskResult, TaskStatus};
use crate::transport::{bbb, Disposition, Machine, Protocol, RequestBlock, TransportConfig};

/// Endpoint layout and declared class bytes of a matched interface
#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    /// bInterfaceNumber, used as wIndex in class-specific requests
    pub interface_number: u16,
    pub subclass: u8,
    pub protocol: u8,
    pub bulk_in: u8,
    pub bulk_out: u8,
    pub interrupt_in: Option<u8>,
}

/// Why attach failed
#[derive(Debug, Copy, Clone, PartialEq, Eq, Error)]
pub enum AttachError {
    #[error("unsupported interface protocol {0:#04x}")]
    UnsupportedProtocol(u8),
    #[error("CBI interface without an interrupt endpoint")]
    MissingInterruptEndpoint,
    #[error("could not start the command executor")]
    NoResources,
}

/// Why a submission was rejected; the request was not started
#[derive(Debug, Copy, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// A command is in flight; the scheduler should retry later
    #[error("transport busy")]
    Busy,
    /// The device is gone or torn down
    #[error("device not present")]
    NotAttached,
    /// The task addresses a LUN above MaxLUN
    #[error("LUN above MaxLUN")]
    BadLun,
}

/// Characteristics the SCSI layer may query
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Feature {
    MaxLun,
    MaxBlockCountRead,
    MaxBlockCountWrite,
    MaxByteCountRead,
    MaxByteCountWrite,
}

/// Response to a selective command abort
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AbortResponse {
    /// Selective abort is not supported; only device-wide abort exists
    FunctionRejected,
}

/// One attached Mass Storage interface.
///
/// Created by [MassStorage::attach], driven by [MassStorage::submit], ended
/// by [MassStorage::terminate]. All methods are callable from any thread.
pub struct MassStorage<P: UsbPipes + 'static> {
    pipes: P,
    config: TransportConfig,
    /// Handle to hand out strong references to workers and nubs
    weak_self: Weak<Self>,
    /// Set once at attach, cleared on any terminal disconnection. Never
    /// re-set for the same transport instance.
    attached: AtomicBool,
    /// The single-in-flight arbiter shared by every transport variant
    busy: AtomicBool,
    reset_gate: ResetGate,
    /// A port reset ran; the upper layer must re-validate the device
    needs_revalidation: AtomicBool,
    inbox: Mutex<Option<SyncSender<RequestBlock>>>,
    executor: Mutex<Option<JoinHandle<()>>>,
    clients: Mutex<HashSet<u64>>,
}

impl<P: UsbPipes + 'static> MassStorage<P> {
    /// Opens the transport over an exclusively-owned interface.
    ///
    /// Resolves protocol and subclass (quirks override the descriptor),
    /// discovers MaxLUN per the Bulk-Only class request, and starts the
    /// command executor. The returned handle is ready for [submit].
    ///
    /// [submit]: MassStorage::submit
    pub fn attach(pipes: P, info: InterfaceInfo, quirks: Quirks) -> Result<Arc<Self>, AttachError> {
        let protocol_byte = quirks.preferred_protocol.unwrap_or(info.protocol);
        let protocol = Protocol::try_from(protocol_byte)
            .map_err(|_| AttachError::UnsupportedProtocol(protocol_byte))?;
        let subclass = quirks.preferred_subclass.unwrap_or(info.subclass);
        if protocol == Protocol::Cbi && info.interrupt_in.is_none() {
            return Err(AttachError::MissingInterruptEndpoint);
        }

        let reset_gate = ResetGate::new();
        let max_lun = discover_max_lun(&pipes, &reset_gate, &info, &quirks, protocol);
        info!(
            "usbh: core: Attach: protocol {:?}, subclass {:#04x}, MaxLUN {}",
            protocol, subclass, max_lun
        );

        let config = TransportConfig {
            interface_number: info.interface_number,
            protocol,
            subclass,
            bulk_in: info.bulk_in,
            bulk_out: info.bulk_out,
            interrupt_in: info.interrupt_in,
            max_lun,
            quirks,
        };

        let (sender, receiver) = sync_channel(1);
        let device = Arc::new_cyclic(|weak| MassStorage {
            pipes,
            config,
            weak_self: weak.clone(),
            attached: AtomicBool::new(true),
            busy: AtomicBool::new(false),
            reset_gate,
            needs_revalidation: AtomicBool::new(false),
            inbox: Mutex::new(Some(sender)),
            executor: Mutex::new(None),
            clients: Mutex::new(HashSet::new()),
        });

        let handle = {
            let weak = Arc::downgrade(&device);
            let protocol = device.config.protocol;
            thread::Builder::new()
                .name("usbh-storage".into())
                .spawn(move || executor_loop(weak, protocol, receiver))
                .map_err(|_| AttachError::NoResources)?
        };
        *lock(&device.executor) = Some(handle);

        Ok(device)
    }

    /// Submits a task. `Ok(())` means the request is in process and the
    /// completion closure will be invoked exactly once; any error means it
    /// was rejected and never started.
    pub fn submit(
        &self,
        task: ScsiTask,
        completion: impl FnOnce(ScsiTask, TaskResult) + Send + 'static,
    ) -> Result<(), SubmitError> {
        if !self.attached.load(Ordering::Acquire) {
            return Err(SubmitError::NotAttached);
        }
        if task.lun() > self.config.max_lun {
            return Err(SubmitError::BadLun);
        }
        if self.busy.swap(true, Ordering::AcqRel) {
            return Err(SubmitError::Busy);
        }

        // Fully staged before handover; the executor never sees a
        // half-initialised block
        let block = RequestBlock::new(task, Box::new(completion));
        let inbox = lock(&self.inbox);
        let accepted = inbox.as_ref().map(|tx| tx.try_send(block).is_ok());
        if accepted != Some(true) {
            self.busy.store(false, Ordering::Release);
            return Err(SubmitError::NotAttached);
        }
        Ok(())
    }

    /// Selective command abort. Not implemented by this driver; device-wide
    /// abort goes through [MassStorage::terminate].
    pub fn abort(&self) -> AbortResponse {
        AbortResponse::FunctionRejected
    }

    /// SCSI Device Characteristics lookup. `None` means no preference.
    pub fn feature_query(&self, feature: Feature) -> Option<u64> {
        let quirks = &self.config.quirks;
        match feature {
            Feature::MaxLun => Some(self.config.max_lun as u64),
            Feature::MaxBlockCountRead => quirks.max_block_count_read.map(u64::from),
            Feature::MaxBlockCountWrite => quirks.max_block_count_write.map(u64::from),
            Feature::MaxByteCountRead => quirks.max_byte_count_read,
            Feature::MaxByteCountWrite => quirks.max_byte_count_write,
        }
    }

    /// One nub per LUN, 0..=MaxLUN. With MaxLUN 0 the single entry stands
    /// for the transport itself.
    pub fn logical_units(&self) -> Vec<LogicalUnit<P>> {
        let Some(device) = self.weak_self.upgrade() else {
            return Vec::new();
        };
        (0..=self.config.max_lun)
            .map(|lun| LogicalUnit {
                lun,
                device: Arc::clone(&device),
            })
            .collect()
    }

    /// Registers a client. With MaxLUN 0 the open is exclusive; with more
    /// LUNs the opens multiplex across the nubs.
    pub fn handle_open(&self, client: u64) -> bool {
        if !self.attached.load(Ordering::Acquire) {
            return false;
        }
        let mut clients = lock(&self.clients);
        if self.config.max_lun == 0 && !clients.is_empty() && !clients.contains(&client) {
            return false;
        }
        clients.insert(client);
        true
    }

    /// Deregisters a client. Returns true when the last client of a
    /// multi-LUN transport left, which asks the caller to drive the close.
    pub fn handle_close(&self, client: u64) -> bool {
        let mut clients = lock(&self.clients);
        clients.remove(&client);
        self.config.max_lun > 0 && clients.is_empty()
    }

    pub fn handle_is_open(&self, client: u64) -> bool {
        lock(&self.clients).contains(&client)
    }

    /// Power-resume hook: probes the bulk-in endpoint and schedules a device
    /// reset if the device slept through resume, or unconditionally for
    /// devices quirked reset-on-resume.
    pub fn handle_power_on(&self) {
        if !self.attached.load(Ordering::Acquire) {
            return;
        }
        if self.config.quirks.reset_on_resume {
            info!("usbh: core: Reset-on-resume quirk set, scheduling reset");
            self.schedule_reset();
            return;
        }
        let mut status = [0u8; 2];
        let probe = self.pipes.control_in(
            pipes::endpoint_status_request(self.config.bulk_in),
            &mut status,
        );
        if let Err(err) = probe {
            warn!("usbh: core: Resume probe failed ({}), scheduling reset", err);
            self.schedule_reset();
        }
    }

    /// True once after each port reset; the upper layer re-validates the
    /// device and the flag clears.
    pub fn take_revalidation_flag(&self) -> bool {
        self.needs_revalidation.swap(false, Ordering::AcqRel)
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    pub fn max_lun(&self) -> u8 {
        self.config.max_lun
    }

    /// Tears the transport down: fails the in-flight command with
    /// DeviceNotPresent, unblocks every pipe, stops the executor. After this
    /// returns the core initiates no further USB transfer and every
    /// operation reports the device as not present.
    pub fn terminate(&self) {
        if self.attached.swap(false, Ordering::AcqRel) {
            info!("usbh: core: Terminate");
        }

        // Unblock whatever transfer is outstanding so the executor can
        // synthesise the completion
        let _ = self.pipes.abort_pipe(self.config.bulk_in);
        let _ = self.pipes.abort_pipe(self.config.bulk_out);
        if let Some(interrupt) = self.config.interrupt_in {
            let _ = self.pipes.abort_pipe(interrupt);
        }

        // No reset worker may outlive the teardown
        self.reset_gate.wait_idle();

        let sender = lock(&self.inbox).take();
        drop(sender);
        let handle = lock(&self.executor).take();
        if let Some(handle) = handle {
            // terminate may run on the executor itself, from a completion
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    /// Runs one accepted block to completion. Executor context only.
    fn process(&self, machine: &mut Machine, mut block: RequestBlock) {
        // A resume-triggered reset may be mid-flight; commands wait it out
        self.reset_gate.wait_idle();

        let disposition = if !self.attached.load(Ordering::Acquire) {
            Disposition::DeviceNotPresent
        } else {
            machine.execute(&self.pipes, &self.config, &mut block)
        };
        let disposition = match disposition {
            Disposition::NeedsPortReset => {
                if self.reset_device() {
                    // Device recovered; the command itself is lost
                    Disposition::CheckCondition
                } else {
                    Disposition::DeviceNotPresent
                }
            }
            other => other,
        };
        self.finish(block, disposition);
    }

    /// Maps the disposition, clears busy, invokes the upstream completion.
    fn finish(&self, block: RequestBlock, disposition: Disposition) {
        if disposition == Disposition::DeviceNotPresent {
            self.attached.store(false, Ordering::Release);
        }
        let result = match disposition {
            Disposition::Good => TaskResult {
                response: ServiceResponse::TaskComplete,
                status: TaskStatus::Good,
            },
            Disposition::CheckCondition => TaskResult {
                response: ServiceResponse::TaskComplete,
                status: TaskStatus::CheckCondition,
            },
            Disposition::DeviceNotPresent => TaskResult {
                response: ServiceResponse::TaskComplete,
                status: TaskStatus::DeviceNotPresent,
            },
            Disposition::DeliveryFailure | Disposition::NeedsPortReset => TaskResult {
                response: ServiceResponse::DeliveryFailure,
                status: TaskStatus::NoStatus,
            },
        };
        info!("usbh: core: Complete: {:?}", result.status);

        let RequestBlock {
            task, completion, ..
        } = block;
        self.busy.store(false, Ordering::Release);
        completion(task, result);
    }

    /// Starts the port-reset worker unless one is already running. The
    /// worker holds a strong reference for its whole run.
    fn schedule_reset(&self) {
        if !self.attached.load(Ordering::Acquire) {
            return;
        }
        if !self.reset_gate.begin() {
            return;
        }
        self.needs_revalidation.store(true, Ordering::Release);

        let Some(device) = self.weak_self.upgrade() else {
            self.reset_gate.finish(false);
            return;
        };
        let spawned = thread::Builder::new().name("usbh-reset".into()).spawn(move || {
            let ok = match recovery::port_reset_sequence(
                &device.pipes,
                device.config.bulk_in,
                device.config.bulk_out,
            ) {
                Ok(()) => true,
                Err(err) => {
                    error!("usbh: core: Port reset failed: {}", err);
                    false
                }
            };
            device.reset_gate.finish(ok);
            // device reference released here, on worker exit
        });
        if spawned.is_err() {
            self.reset_gate.finish(false);
        }
    }

    /// Schedules a reset and parks until it settles. A failed reset is
    /// terminal for the transport.
    fn reset_device(&self) -> bool {
        if !self.attached.load(Ordering::Acquire) {
            return false;
        }
        self.schedule_reset();
        let ok = self.reset_gate.wait_idle();
        if !ok {
            self.attached.store(false, Ordering::Release);
        }
        ok
    }
}

/// One logical unit published upward by the transport
pub struct LogicalUnit<P: UsbPipes + 'static> {
    lun: u8,
    device: Arc<MassStorage<P>>,
}

impl<P: UsbPipes + 'static> LogicalUnit<P> {
    pub fn lun(&self) -> u8 {
        self.lun
    }

    pub fn device(&self) -> &Arc<MassStorage<P>> {
        &self.device
    }

    /// Submits with the task re-addressed to this unit
    pub fn submit(
        &self,
        mut task: ScsiTask,
        completion: impl FnOnce(ScsiTask, TaskResult) + Send + 'static,
    ) -> Result<(), SubmitError> {
        task.set_lun(self.lun);
        self.device.submit(task, completion)
    }
}

impl<P: UsbPipes + 'static> Clone for LogicalUnit<P> {
    fn clone(&self) -> Self {
        LogicalUnit {
            lun: self.lun,
            device: Arc::clone(&self.device),
        }
    }
}

/// The dedicated command executor. Holds only a weak handle between
/// commands so a fully-released transport can unwind.
fn executor_loop<P: UsbPipes + 'static>(
    device: Weak<MassStorage<P>>,
    protocol: Protocol,
    inbox: Receiver<RequestBlock>,
) {
    let mut machine = Machine::for_protocol(protocol);
    while let Ok(block) = inbox.recv() {
        let Some(device) = device.upgrade() else { break };
        device.process(&mut machine, block);
    }
    trace!("usbh: core: Executor drained");
}

/// GET MAX LUN with a policy for the misbehaviours seen in the field: clear
/// a stalled control pipe and retry (3 attempts), port-reset an unresponsive
/// device and retry once, assume 0 on anything else.
fn discover_max_lun<P: UsbPipes>(
    pipes: &P,
    gate: &ResetGate,
    info: &InterfaceInfo,
    quirks: &Quirks,
    protocol: Protocol,
) -> u8 {
    if let Some(declared) = quirks.declared_max_lun {
        debug!("usbh: core: Quirk declares MaxLUN {}", declared);
        return declared & 0x0F;
    }
    // The class request exists only on Bulk Only interfaces
    if protocol != Protocol::BulkOnly {
        return 0;
    }

    let request = bbb::get_max_lun_request(info.interface_number);
    let mut response = [0u8; 1];
    let mut attempts = 0;
    let mut reset_tried = false;
    loop {
        attempts += 1;
        match pipes.control_in(request, &mut response) {
            Ok(_) => return response[0] & 0x0F,
            Err(UsbError::Stalled) if attempts < 3 => {
                debug!("usbh: core: GET MAX LUN stalled, clearing control pipe");
                let _ = pipes.clear_stall(pipes::CONTROL_ENDPOINT);
            }
            Err(UsbError::NotResponding) if !reset_tried => {
                warn!("usbh: core: Device unresponsive during MaxLUN discovery");
                reset_tried = true;
                if !recovery::reset_on_worker(pipes, gate, info.bulk_in, info.bulk_out) {
                    return 0;
                }
            }
            Err(err) => {
                debug!("usbh: core: GET MAX LUN failed ({}), assuming 0", err);
                return 0;
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
