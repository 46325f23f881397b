//! Bulk Only Transport (BBB/BOT), host side
//!
//! Drives one command through the three-phase Command/Data/Status protocol.
//! Every phase can stall, time out or desynchronise; the machine recovers
//! with endpoint-status probes, CLEAR_FEATURE(ENDPOINT_HALT) and, on phase
//! errors, the full reset-recovery sequence (class reset, clear bulk-in,
//! clear bulk-out).

use crate::fmt::{debug, error, info, trace};
use crate::pipes::{self, DeviceRequest, UsbError, UsbPipes};
use crate::scsi::DataDirection;
use crate::transport::{
    CommandStatus, Disposition, RequestBlock, Transport, TransportConfig, TRANSPORT_BBB,
};

const CLASS_SPECIFIC_BULK_ONLY_MASS_STORAGE_RESET: u8 = 0xFF;
const CLASS_SPECIFIC_GET_MAX_LUN: u8 = 0xFE;

const CBW_SIGNATURE_LE: [u8; 4] = 0x43425355u32.to_le_bytes();
const CSW_SIGNATURE_LE: [u8; 4] = 0x53425355u32.to_le_bytes();

pub(crate) const CBW_LEN: usize = 31;
pub(crate) const CSW_LEN: usize = 13;

const CBW_FLAGS_DATA_IN: u8 = 0x80;
const CBW_LUN_MASK: u8 = 0x0F;
const CBW_CB_LENGTH_MASK: u8 = 0x1F;

/// Bulk Only state machine phases.
///
/// A phase names the transfer that was just issued; the machine advances
/// when that transfer returns. Spec. 5.3
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum BotPhase {
    CommandSent,
    BulkIoComplete,
    CheckBulkStall,
    ClearBulkStall,
    StatusReceived,
    StatusReceived2ndTime,
    ResetCompleted,
    ClearBulkInCompleted,
    ClearBulkOutCompleted,
}

/// What a tag-matched CSW means for the task
enum CswVerdict {
    Done(Disposition),
    PhaseError,
}

/// Bulk Only Transport
///
/// One instance per attached interface; owns nothing but the tag counter.
/// [Transport::execute] blocks on each pipe call and feeds the result into
/// the next transition, so the whole protocol reads top to bottom in one
/// place.
pub(crate) struct BulkOnly {
    tag: u32,
}

impl BulkOnly {
    pub(crate) fn new() -> Self {
        BulkOnly { tag: 0 }
    }

    /// Next CBW tag. Monotonic per transport, never 0, wraparound permitted;
    /// single-in-flight arbitration keeps live tags from colliding.
    fn next_tag(&mut self) -> u32 {
        self.tag = self.tag.wrapping_add(1);
        if self.tag == 0 {
            self.tag = 1;
        }
        self.tag
    }
}

impl Transport for BulkOnly {
    const PROTO: u8 = TRANSPORT_BBB;

    fn execute<P: UsbPipes>(
        &mut self,
        pipes: &P,
        config: &TransportConfig,
        block: &mut RequestBlock,
    ) -> Disposition {
        block.tag = self.next_tag();
        build_cbw(block);

        info!(
            "usbh: bbb: Send CBW: tag {}, {} bytes {:?}",
            block.tag,
            block.task.requested_len(),
            block.task.direction()
        );
        let mut phase = BotPhase::CommandSent;
        let mut result = pipes.bulk_out(
            config.bulk_out,
            &block.cbw,
            block.task.no_data_timeout(),
            block.task.completion_timeout(),
        );
        // Endpoint under suspicion after a failed transfer; probed in
        // CheckBulkStall, cleared in ClearBulkStall
        let mut suspect_ep = config.bulk_in;

        loop {
            trace!("usbh: bbb: Phase {:?}: {:?}", phase, result);
            match phase {
                BotPhase::CommandSent => match result {
                    Ok(_) => {
                        if block.task.direction() == DataDirection::None {
                            phase = BotPhase::StatusReceived;
                            result = receive_csw(pipes, config, block);
                        } else {
                            phase = BotPhase::BulkIoComplete;
                            result = transfer_data(pipes, config, block);
                        }
                    }
                    Err(UsbError::NoDevice) | Err(UsbError::Aborted) => {
                        return Disposition::DeviceNotPresent
                    }
                    Err(UsbError::NotResponding) => return Disposition::NeedsPortReset,
                    // The CBW never reached the device
                    Err(_) => return Disposition::DeliveryFailure,
                },

                BotPhase::BulkIoComplete => match result {
                    Ok(moved) => {
                        block.data_moved = moved as u32;
                        phase = BotPhase::StatusReceived;
                        result = receive_csw(pipes, config, block);
                    }
                    Err(UsbError::NoDevice) | Err(UsbError::Aborted) => {
                        return Disposition::DeviceNotPresent
                    }
                    Err(UsbError::NotResponding) => return Disposition::NeedsPortReset,
                    Err(_) => {
                        suspect_ep = data_pipe(config, block);
                        phase = BotPhase::CheckBulkStall;
                        result = probe_endpoint(pipes, block, suspect_ep);
                    }
                },

                BotPhase::CheckBulkStall => match result {
                    Ok(_) => {
                        if block.ep_status[0] & 0x01 == 0x01 {
                            debug!("usbh: bbb: Endpoint {:#04x} halted, clearing", suspect_ep);
                            phase = BotPhase::ClearBulkStall;
                            result = pipes.clear_stall(suspect_ep).map(|_| 0);
                        } else {
                            // Not a halt; see whether a status is available
                            phase = BotPhase::StatusReceived;
                            result = receive_csw(pipes, config, block);
                        }
                    }
                    Err(err) => return Disposition::from_error(err),
                },

                BotPhase::ClearBulkStall => match result {
                    Ok(_) => {
                        phase = BotPhase::StatusReceived;
                        result = receive_csw(pipes, config, block);
                    }
                    Err(err) => return Disposition::from_error(err),
                },

                BotPhase::StatusReceived => match result {
                    Ok(n) => {
                        if n != CSW_LEN || !csw_accepted(block) {
                            // Wrong signature or a stale tag; one more read
                            // may surface the real status
                            debug!("usbh: bbb: CSW not accepted, retrying");
                            phase = BotPhase::StatusReceived2ndTime;
                            result = receive_csw(pipes, config, block);
                        } else {
                            match csw_verdict(block) {
                                CswVerdict::Done(disposition) => return disposition,
                                CswVerdict::PhaseError => {
                                    info!("usbh: bbb: Phase error, reset recovery");
                                    if config.quirks.use_standard_usb_reset {
                                        return Disposition::NeedsPortReset;
                                    }
                                    phase = BotPhase::ResetCompleted;
                                    result = class_reset(pipes, config);
                                }
                            }
                        }
                    }
                    Err(UsbError::Stalled) => {
                        suspect_ep = config.bulk_in;
                        phase = BotPhase::CheckBulkStall;
                        result = probe_endpoint(pipes, block, suspect_ep);
                    }
                    Err(UsbError::NoDevice) | Err(UsbError::Aborted) => {
                        return Disposition::DeviceNotPresent
                    }
                    Err(UsbError::NotResponding) => return Disposition::NeedsPortReset,
                    Err(_) => {
                        phase = BotPhase::StatusReceived2ndTime;
                        result = receive_csw(pipes, config, block);
                    }
                },

                BotPhase::StatusReceived2ndTime => match result {
                    Ok(n) if n == CSW_LEN && csw_accepted(block) => {
                        // A status that only shows up on the second read means
                        // the transport is out of sync with the device
                        error!("usbh: bbb: Late CSW for tag {}", block.tag);
                        return Disposition::CheckCondition;
                    }
                    Err(UsbError::NoDevice) | Err(UsbError::Aborted) => {
                        return Disposition::DeviceNotPresent
                    }
                    Err(UsbError::NotResponding) => return Disposition::NeedsPortReset,
                    _ => {
                        info!("usbh: bbb: No usable CSW, reset recovery");
                        if config.quirks.use_standard_usb_reset {
                            return Disposition::NeedsPortReset;
                        }
                        phase = BotPhase::ResetCompleted;
                        result = class_reset(pipes, config);
                    }
                },

                BotPhase::ResetCompleted => match result {
                    Ok(_) => {
                        phase = BotPhase::ClearBulkInCompleted;
                        result = pipes.clear_stall(config.bulk_in).map(|_| 0);
                    }
                    Err(err) => return Disposition::from_error(err),
                },

                BotPhase::ClearBulkInCompleted => match result {
                    Ok(_) => {
                        phase = BotPhase::ClearBulkOutCompleted;
                        result = pipes.clear_stall(config.bulk_out).map(|_| 0);
                    }
                    Err(err) => return Disposition::from_error(err),
                },

                BotPhase::ClearBulkOutCompleted => {
                    // Recovery ran to the end; the command itself is lost
                    block.task.set_realized_len(0);
                    return match result {
                        Ok(_) => Disposition::CheckCondition,
                        Err(err) => Disposition::from_error(err),
                    };
                }
            }
        }
    }
}

/// Fills the 31-byte CBW wire image from the task. Spec. 5.1
fn build_cbw(block: &mut RequestBlock) {
    let flags = match block.task.direction() {
        DataDirection::In => CBW_FLAGS_DATA_IN,
        DataDirection::Out | DataDirection::None => 0x00,
    };
    let cdb = block.task.cdb();

    block.cbw[0..4].copy_from_slice(&CBW_SIGNATURE_LE);
    block.cbw[4..8].copy_from_slice(&block.tag.to_le_bytes());
    block.cbw[8..12].copy_from_slice(&block.task.requested_len().to_le_bytes());
    block.cbw[12] = flags;
    block.cbw[13] = block.task.lun() & CBW_LUN_MASK;
    block.cbw[14] = (cdb.len() as u8) & CBW_CB_LENGTH_MASK;
    block.cbw[15..].fill(0);
    block.cbw[15..15 + cdb.len()].copy_from_slice(cdb);
}

/// Starts the data phase on the direction's bulk pipe
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

/// Reads the 13-byte CSW from bulk-in
fn receive_csw<P: UsbPipes>(
    pipes: &P,
    config: &TransportConfig,
    block: &mut RequestBlock,
) -> Result<usize, UsbError> {
    trace!("usbh: bbb: Read CSW");
    block.csw = [0u8; CSW_LEN];
    pipes.bulk_in(
        config.bulk_in,
        &mut block.csw,
        block.task.no_data_timeout(),
        block.task.completion_timeout(),
    )
}

/// GET_STATUS probe into the block's scratch buffer
fn probe_endpoint<P: UsbPipes>(
    pipes: &P,
    block: &mut RequestBlock,
    endpoint: u8,
) -> Result<usize, UsbError> {
    debug!("usbh: bbb: Probe endpoint {:#04x}", endpoint);
    block.ep_status = [0u8; 2];
    pipes.control_in(pipes::endpoint_status_request(endpoint), &mut block.ep_status)
}

/// Class-specific Bulk-Only Mass Storage Reset. Spec. 3.1
fn class_reset<P: UsbPipes>(pipes: &P, config: &TransportConfig) -> Result<usize, UsbError> {
    info!("usbh: bbb: Bulk-Only mass storage reset");
    let req = DeviceRequest {
        request_type: pipes::REQUEST_TYPE_CLASS_INTERFACE_OUT,
        request: CLASS_SPECIFIC_BULK_ONLY_MASS_STORAGE_RESET,
        value: 0,
        index: config.interface_number,
        length: 0,
    };
    pipes.control_out(req, &[]).map(|_| 0)
}

/// The bulk pipe carrying the data phase; control for no-data commands
fn data_pipe(config: &TransportConfig, block: &RequestBlock) -> u8 {
    match block.task.direction() {
        DataDirection::In => config.bulk_in,
        DataDirection::Out => config.bulk_out,
        DataDirection::None => pipes::CONTROL_ENDPOINT,
    }
}

/// Signature and tag gate. Spec. 6.3: only a CSW carrying the in-flight tag
/// may drive success.
fn csw_accepted(block: &RequestBlock) -> bool {
    let tag = u32::from_le_bytes([block.csw[4], block.csw[5], block.csw[6], block.csw[7]]);
    block.csw[0..4] == CSW_SIGNATURE_LE && tag == block.tag
}

/// Decodes an accepted CSW into a task verdict
fn csw_verdict(block: &mut RequestBlock) -> CswVerdict {
    let residue = u32::from_le_bytes([block.csw[8], block.csw[9], block.csw[10], block.csw[11]]);
    let requested = block.task.requested_len();

    match CommandStatus::try_from(block.csw[12]) {
        Ok(CommandStatus::Passed) => {
            if residue > requested {
                error!(
                    "usbh: bbb: Residue {} exceeds requested {}",
                    residue, requested
                );
                block.task.set_realized_len(0);
                return CswVerdict::Done(Disposition::CheckCondition);
            }
            let realized = requested - residue;
            if realized > block.data_moved {
                // Device claims more than the bus moved; treat as an underrun
                debug!(
                    "usbh: bbb: Underrun: device reports {}, moved {}",
                    realized, block.data_moved
                );
                block.task.set_realized_len(block.data_moved);
                return CswVerdict::Done(Disposition::CheckCondition);
            }
            block.task.set_realized_len(realized);
            CswVerdict::Done(Disposition::Good)
        }
        Ok(CommandStatus::Failed) => {
            let realized = requested.saturating_sub(residue).min(block.data_moved);
            block.task.set_realized_len(realized);
            CswVerdict::Done(Disposition::CheckCondition)
        }
        Ok(CommandStatus::PhaseError) => CswVerdict::PhaseError,
        Err(_) => {
            error!("usbh: bbb: Unknown CSW status {:#04x}", block.csw[12]);
            block.task.set_realized_len(0);
            CswVerdict::Done(Disposition::CheckCondition)
        }
    }
}

/// GET MAX LUN class request. Spec. 3.2
pub(crate) fn get_max_lun_request(interface_number: u16) -> DeviceRequest {
    DeviceRequest {
        request_type: pipes::REQUEST_TYPE_CLASS_INTERFACE_IN,
        request: CLASS_SPECIFIC_GET_MAX_LUN,
        value: 0,
        index: interface_number,
        length: 1,
    }
}
