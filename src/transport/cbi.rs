//! Control/Bulk/Interrupt and Control/Bulk transports
//!
//! Commands travel as an Accept Device-Specific Command (ADSC) control
//! transfer carrying the CDB, followed by an optional bulk data phase. CBI
//! then reads a 2-byte completion packet from the interrupt pipe; CB has no
//! status phase and infers success from the absence of a stall.

use crate::fmt::{debug, info, trace};
use crate::pipes::{self, DeviceRequest, UsbError, UsbPipes};
use crate::scsi::DataDirection;
use crate::transport::{
    Disposition, Protocol, RequestBlock, Transport, TransportConfig, TRANSPORT_CBI,
};
use crate::SUBCLASS_UFI;

/// Accept Device-Specific Command, the class request carrying the CDB
const CLASS_SPECIFIC_ADSC: u8 = 0x00;

/// A CBI command block is at most 12 bytes, zero-padded on the wire
const CBI_COMMAND_LEN: usize = 12;

/// CBI/CB state machine phases
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum CbiPhase {
    CommandSent,
    BulkIoComplete,
    StatusReceived,
}

/// Control/Bulk/Interrupt transport.
///
/// Much simpler than Bulk Only: no tags, no status wrapper, and the only
/// recovery is clearing a halted bulk endpoint before failing the task.
pub(crate) struct Cbi;

impl Cbi {
    pub(crate) fn new() -> Self {
        Cbi
    }
}

impl Transport for Cbi {
    const PROTO: u8 = TRANSPORT_CBI;

    fn execute<P: UsbPipes>(
        &mut self,
        pipes: &P,
        config: &TransportConfig,
        block: &mut RequestBlock,
    ) -> Disposition {
        let cdb = block.task.cdb();
        if cdb.len() > CBI_COMMAND_LEN {
            debug!("usbh: cbi: CDB of {} bytes does not fit ADSC", cdb.len());
            return Disposition::DeliveryFailure;
        }
        let mut command = [0u8; CBI_COMMAND_LEN];
        command[..cdb.len()].copy_from_slice(cdb);

        info!(
            "usbh: cbi: Send ADSC: {} bytes {:?}",
            block.task.requested_len(),
            block.task.direction()
        );
        let mut phase = CbiPhase::CommandSent;
        let mut result = pipes
            .control_out(adsc_request(config.interface_number), &command)
            .map(|_| 0usize);

        loop {
            trace!("usbh: cbi: Phase {:?}: {:?}", phase, result);
            match phase {
                CbiPhase::CommandSent => match result {
                    Ok(_) => {
                        if block.task.direction() == DataDirection::None {
                            phase = CbiPhase::StatusReceived;
                            result = read_status(pipes, config, block);
                        } else {
                            phase = CbiPhase::BulkIoComplete;
                            result = transfer_data(pipes, config, block);
                        }
                    }
                    // An ADSC stall is the device rejecting the command
                    Err(UsbError::Stalled) => {
                        let _ = pipes.clear_stall(pipes::CONTROL_ENDPOINT);
                        return Disposition::CheckCondition;
                    }
                    Err(UsbError::NoDevice) | Err(UsbError::Aborted) => {
                        return Disposition::DeviceNotPresent
                    }
                    Err(UsbError::NotResponding) => return Disposition::NeedsPortReset,
                    Err(_) => return Disposition::DeliveryFailure,
                },

                CbiPhase::BulkIoComplete => match result {
                    Ok(moved) => {
                        block.data_moved = moved as u32;
                        block.task.set_realized_len(moved as u32);
                        phase = CbiPhase::StatusReceived;
                        result = read_status(pipes, config, block);
                    }
                    Err(UsbError::Stalled) => {
                        // Clear the halt so the next command can run, then
                        // report the failure upward
                        let _ = pipes.clear_stall(data_pipe(config, block));
                        block.task.set_realized_len(0);
                        return Disposition::CheckCondition;
                    }
                    Err(UsbError::NoDevice) | Err(UsbError::Aborted) => {
                        return Disposition::DeviceNotPresent
                    }
                    Err(UsbError::NotResponding) => return Disposition::NeedsPortReset,
                    Err(err) => return Disposition::from_error(err),
                },

                CbiPhase::StatusReceived => match result {
                    Ok(_) => return interrupt_verdict(config, block),
                    Err(UsbError::NoDevice) | Err(UsbError::Aborted) => {
                        return Disposition::DeviceNotPresent
                    }
                    Err(UsbError::NotResponding) => return Disposition::NeedsPortReset,
                    Err(_) => return Disposition::CheckCondition,
                },
            }
        }
    }
}

/// Completion phase: CBI polls the interrupt pipe, CB succeeds by reaching
/// this point without a stall.
fn read_status<P: UsbPipes>(
    pipes: &P,
    config: &TransportConfig,
    block: &mut RequestBlock,
) -> Result<usize, UsbError> {
    match (config.protocol, config.interrupt_in) {
        (Protocol::Cbi, Some(endpoint)) => {
            trace!("usbh: cbi: Read interrupt status");
            block.ep_status = [0u8; 2];
            pipes.interrupt_in(endpoint, &mut block.ep_status)
        }
        _ => {
            block.ep_status = [0u8; 2];
            Ok(0)
        }
    }
}

/// Interprets the 2-byte interrupt data. For UFI the bytes are ASC/ASCQ;
/// for other subclasses byte 1 is the Command Completion Interrupt value.
fn interrupt_verdict(config: &TransportConfig, block: &RequestBlock) -> Disposition {
    if config.protocol != Protocol::Cbi {
        return Disposition::Good;
    }
    let [first, second] = block.ep_status;
    let passed = if config.subclass == SUBCLASS_UFI {
        first == 0 && second == 0
    } else {
        second & 0x0F == 0
    };
    if passed {
        Disposition::Good
    } else {
        debug!(
            "usbh: cbi: Interrupt status {:#04x} {:#04x}",
            first, second
        );
        Disposition::CheckCondition
    }
}

fn transfer_data<P: UsbPipes>(
    pipes: &P,
    config: &TransportConfig,
    block: &mut RequestBlock,
) -> Result<usize, UsbError> {
    let len = block.task.requested_len() as usize;
    let no_data = block.task.no_data_timeout();
    let completion = block.task.completion_timeout();
    match block.task.direction() {
        DataDirection::In => {
            let buf = &mut block.task.data_mut()[..len];
            pipes.bulk_in(config.bulk_in, buf, no_data, completion)
        }
        DataDirection::Out => {
            pipes.bulk_out(config.bulk_out, &block.task.data()[..len], no_data, completion)
        }
        DataDirection::None => Ok(0),
    }
}

fn data_pipe(config: &TransportConfig, block: &RequestBlock) -> u8 {
    match block.task.direction() {
        DataDirection::In => config.bulk_in,
        DataDirection::Out => config.bulk_out,
        DataDirection::None => pipes::CONTROL_ENDPOINT,
    }
}

fn adsc_request(interface_number: u16) -> DeviceRequest {
    DeviceRequest {
        request_type: pipes::REQUEST_TYPE_CLASS_INTERFACE_OUT,
        request: CLASS_SPECIFIC_ADSC,
        value: 0,
        index: interface_number,
        length: CBI_COMMAND_LEN as u16,
    }
}
