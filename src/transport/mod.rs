//! USB Mass Storage transports
//!
//! One [Transport] implementation exists per protocol family: [bbb] drives
//! the three-phase Bulk Only protocol, [cbi] drives Control/Bulk/Interrupt
//! and Control/Bulk. The transport core selects one at attach time and feeds
//! it [RequestBlock]s, one at a time.

use num_enum::TryFromPrimitive;

use crate::pipes::{UsbError, UsbPipes};
use crate::quirks::Quirks;
use crate::scsi::{ScsiTask, TaskCompletion};

pub mod bbb;
pub mod cbi;

/* Interface protocol codes (bInterfaceProtocol) */

/// Control/Bulk/Interrupt with command completion interrupt
pub const TRANSPORT_CBI: u8 = 0x00;
/// Control/Bulk, no interrupt endpoint
pub const TRANSPORT_CB: u8 = 0x01;
/// Bulk Only Transport
pub const TRANSPORT_BBB: u8 = 0x50;

/// Transport protocol negotiated for an interface
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive)]
pub enum Protocol {
    Cbi = TRANSPORT_CBI,
    Cb = TRANSPORT_CB,
    BulkOnly = TRANSPORT_BBB,
}

/// The status byte of a Mass Storage command completion.
///
/// Refer to the USB-MS doc.
#[repr(u8)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, TryFromPrimitive)]
pub enum CommandStatus {
    #[default]
    Passed = 0x00,
    Failed = 0x01,
    PhaseError = 0x02,
}

/// Transport configuration, immutable after attach
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// wIndex value for class-specific and endpoint-recipient requests
    pub interface_number: u16,
    pub protocol: Protocol,
    pub subclass: u8,
    pub bulk_in: u8,
    pub bulk_out: u8,
    pub interrupt_in: Option<u8>,
    /// Highest valid LUN, 0..=15
    pub max_lun: u8,
    pub quirks: Quirks,
}

/// How a command left the state machine.
///
/// This is transport-internal: the core maps it to the upstream
/// (service response, task status) pair. [Disposition::NeedsPortReset] is the
/// one non-terminal value; it asks the recovery coordinator for a port reset
/// before the verdict is final.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// Command passed, realized count is set
    Good,
    /// Command failed or recovery was needed; upper layers will REQUEST SENSE
    CheckCondition,
    /// The interface is gone
    DeviceNotPresent,
    /// The command never reached the device
    DeliveryFailure,
    /// The device stopped answering mid-command, or a quirk routes recovery
    /// through a standard USB reset
    NeedsPortReset,
}

impl Disposition {
    /// Terminal disposition for a failed pipe operation
    pub(crate) fn from_error(err: UsbError) -> Disposition {
        match err {
            UsbError::NoDevice | UsbError::Aborted => Disposition::DeviceNotPresent,
            UsbError::NotResponding => Disposition::NeedsPortReset,
            UsbError::NoResources => Disposition::DeliveryFailure,
            _ => Disposition::CheckCondition,
        }
    }
}

/// Per-command context: the transport request block.
///
/// Created when a task is accepted, mutated only by the executing state
/// machine, released exactly once on terminal completion. Completion consumes
/// the block, so a double completion cannot compile.
pub(crate) struct RequestBlock {
    pub task: ScsiTask,
    pub completion: TaskCompletion,
    /// CBW tag of the in-flight command (Bulk Only)
    pub tag: u32,
    /// Wire image of the CBW
    pub cbw: [u8; bbb::CBW_LEN],
    /// Wire image of the last CSW read
    pub csw: [u8; bbb::CSW_LEN],
    /// Scratch for the GET_STATUS endpoint probe
    pub ep_status: [u8; 2],
    /// Bytes actually moved during the data phase
    pub data_moved: u32,
}

impl RequestBlock {
    pub(crate) fn new(task: ScsiTask, completion: TaskCompletion) -> Self {
        RequestBlock {
            task,
            completion,
            tag: 0,
            cbw: [0u8; bbb::CBW_LEN],
            csw: [0u8; bbb::CSW_LEN],
            ep_status: [0u8; 2],
            data_moved: 0,
        }
    }
}

/// USB Mass Storage transport state machine.
///
/// Implementations drive exactly one command at a time through their phases,
/// blocking on the pipe calls in between. The caller guarantees exclusive
/// access to the pipes for the duration of [Transport::execute].
pub(crate) trait Transport {
    /// Interface protocol code
    const PROTO: u8;

    /// Runs `block` to a terminal state and reports how it ended.
    fn execute<P: UsbPipes>(
        &mut self,
        pipes: &P,
        config: &TransportConfig,
        block: &mut RequestBlock,
    ) -> Disposition;
}

/// The tagged transport variant owned by a device's executor
pub(crate) enum Machine {
    BulkOnly(bbb::BulkOnly),
    Cbi(cbi::Cbi),
}

impl Machine {
    pub(crate) fn for_protocol(protocol: Protocol) -> Machine {
        match protocol {
            Protocol::BulkOnly => Machine::BulkOnly(bbb::BulkOnly::new()),
            Protocol::Cbi | Protocol::Cb => Machine::Cbi(cbi::Cbi::new()),
        }
    }

    pub(crate) fn execute<P: UsbPipes>(
        &mut self,
        pipes: &P,
        config: &TransportConfig,
        block: &mut RequestBlock,
    ) -> Disposition {
        match self {
            Machine::BulkOnly(bot) => bot.execute(pipes, config, block),
            Machine::Cbi(cbi) => cbi.execute(pipes, config, block),
        }
    }
}
