//! Upstream SCSI task interface
//!
//! The transport carries SCSI command blocks; it never builds or interprets
//! them. A [ScsiTask] is created by the SCSI layer, submitted through
//! [MassStorage::submit], and handed back through the completion closure with
//! its realized transfer count and a [TaskResult].
//!
//! [MassStorage::submit]: crate::device::MassStorage::submit

use std::time::Duration;
use thiserror::Error;

use crate::fmt::warn;

/// Default bound on the wait for first data on the wire
pub const DEFAULT_NO_DATA_TIMEOUT: Duration = Duration::from_secs(5);
/// Default bound on a whole bulk transfer
pub const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_secs(30);

/// Data-transfer direction of a SCSI command, seen from the host
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum DataDirection {
    /// No data phase
    #[default]
    None,
    /// Device to host
    In,
    /// Host to device
    Out,
}

/// Why a task was not accepted at construction
#[derive(Debug, Copy, Clone, PartialEq, Eq, Error)]
pub enum InvalidTask {
    /// CDB length outside 1..=16
    #[error("CDB length {0} outside 1..=16")]
    BadCdbLength(usize),
    /// A data direction was given without a byte count, or vice versa
    #[error("data direction inconsistent with requested byte count")]
    DirectionMismatch,
}

/// Service response reported to the SCSI layer
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ServiceResponse {
    /// The command was delivered and a status is available
    TaskComplete,
    /// The command never reached the device
    DeliveryFailure,
}

/// Task status reported to the SCSI layer
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    /// Command passed
    Good,
    /// Command failed; the upper layer should issue REQUEST SENSE
    CheckCondition,
    /// The device is gone, no further commands will succeed
    DeviceNotPresent,
    /// No status was obtained
    NoStatus,
}

/// Completion verdict of a submitted task
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub response: ServiceResponse,
    pub status: TaskStatus,
}

/// Completion closure invoked exactly once per accepted task
pub type TaskCompletion = Box<dyn FnOnce(ScsiTask, TaskResult) + Send + 'static>;

/// One SCSI command in transit through the transport.
///
/// Owns the CDB, the addressed logical unit, the data buffer and the transfer
/// timeouts. The inbound and outbound timeout values are accepted separately;
/// most callers leave the defaults.
#[derive(Debug)]
pub struct ScsiTask {
    cdb: [u8; 16],
    cdb_len: u8,
    lun: u8,
    direction: DataDirection,
    requested_len: u32,
    data: Vec<u8>,
    no_data_timeout: Duration,
    completion_timeout: Duration,
    realized_len: u32,
}

impl ScsiTask {
    /// Creates a task carrying `cdb` with a data phase of `requested_len`
    /// bytes in `direction`. For [DataDirection::In] the buffer is allocated
    /// zeroed; for [DataDirection::Out] fill it via [ScsiTask::data_mut]
    /// before submitting.
    pub fn new(
        cdb: &[u8],
        lun: u8,
        direction: DataDirection,
        requested_len: u32,
    ) -> Result<Self, InvalidTask> {
        if cdb.is_empty() || cdb.len() > 16 {
            return Err(InvalidTask::BadCdbLength(cdb.len()));
        }
        if (direction == DataDirection::None) != (requested_len == 0) {
            return Err(InvalidTask::DirectionMismatch);
        }
        if let Some(expected) = cdb_len_for_opcode(cdb[0]) {
            if expected as usize != cdb.len() {
                warn!(
                    "usbh: task: CDB length {} unusual for opcode {:#04x} (group says {})",
                    cdb.len(),
                    cdb[0],
                    expected
                );
            }
        }

        let mut block = [0u8; 16];
        block[..cdb.len()].copy_from_slice(cdb);
        Ok(ScsiTask {
            cdb: block,
            cdb_len: cdb.len() as u8,
            lun,
            direction,
            requested_len,
            data: vec![0u8; requested_len as usize],
            no_data_timeout: DEFAULT_NO_DATA_TIMEOUT,
            completion_timeout: DEFAULT_COMPLETION_TIMEOUT,
            realized_len: 0,
        })
    }

    /// Task with no data phase
    pub fn no_data(cdb: &[u8], lun: u8) -> Result<Self, InvalidTask> {
        Self::new(cdb, lun, DataDirection::None, 0)
    }

    /// Device-to-host task expecting `len` bytes
    pub fn data_in(cdb: &[u8], lun: u8, len: u32) -> Result<Self, InvalidTask> {
        Self::new(cdb, lun, DataDirection::In, len)
    }

    /// Host-to-device task carrying `data`
    pub fn data_out(cdb: &[u8], lun: u8, data: Vec<u8>) -> Result<Self, InvalidTask> {
        let mut task = Self::new(cdb, lun, DataDirection::Out, data.len() as u32)?;
        task.data = data;
        Ok(task)
    }

    /// Overrides both transfer timeouts
    pub fn with_timeouts(mut self, no_data: Duration, completion: Duration) -> Self {
        self.no_data_timeout = no_data;
        self.completion_timeout = completion;
        self
    }

    pub fn cdb(&self) -> &[u8] {
        &self.cdb[..self.cdb_len as usize]
    }

    pub fn lun(&self) -> u8 {
        self.lun
    }

    pub(crate) fn set_lun(&mut self, lun: u8) {
        self.lun = lun;
    }

    pub fn direction(&self) -> DataDirection {
        self.direction
    }

    /// Byte count requested from the device
    pub fn requested_len(&self) -> u32 {
        self.requested_len
    }

    /// Bytes actually transferred, valid after completion
    pub fn realized_len(&self) -> u32 {
        self.realized_len
    }

    pub(crate) fn set_realized_len(&mut self, len: u32) {
        self.realized_len = len;
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Consumes the task, yielding the data buffer
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn no_data_timeout(&self) -> Duration {
        self.no_data_timeout
    }

    pub fn completion_timeout(&self) -> Duration {
        self.completion_timeout
    }
}

/// CDB length implied by the opcode's group code, where the group defines one
pub fn cdb_len_for_opcode(opcode: u8) -> Option<u8> {
    match opcode >> 5 {
        0 => Some(6),
        1 | 2 => Some(10),
        4 => Some(16),
        5 => Some(12),
        _ => None, // vendor or reserved groups carry their own length
    }
}
