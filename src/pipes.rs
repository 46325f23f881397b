//! Contracts toward the USB stack
//!
//! The transport core drives a device exclusively through [UsbPipes]. A
//! platform binding implements it over the host stack's pipe objects; the
//! tests implement it over a scripted fake. Endpoints are addressed by their
//! endpoint address byte as reported in the interface descriptor, with `0`
//! naming the default control pipe.
//!
//! All transfer methods block until the transfer completes, fails, or is
//! aborted from another thread via [UsbPipes::abort_pipe]. Each call is one
//! suspension point of the state machines in [transport].
//!
//! [transport]: crate::transport

use std::time::Duration;
use thiserror::Error;

/* Standard request codes (USB 2.0 ch. 9) */

pub const REQUEST_GET_STATUS: u8 = 0x00;
pub const REQUEST_CLEAR_FEATURE: u8 = 0x01;

/// Feature selector for CLEAR_FEATURE on an endpoint
pub const FEATURE_ENDPOINT_HALT: u16 = 0x00;

/* bmRequestType values used by the transports */

/// Class request, host to device, interface recipient
pub const REQUEST_TYPE_CLASS_INTERFACE_OUT: u8 = 0x21;
/// Class request, device to host, interface recipient
pub const REQUEST_TYPE_CLASS_INTERFACE_IN: u8 = 0xA1;
/// Standard request, device to host, endpoint recipient
pub const REQUEST_TYPE_STANDARD_ENDPOINT_IN: u8 = 0x82;

/// The default control pipe address
pub const CONTROL_ENDPOINT: u8 = 0x00;

/// Error produced by a pipe operation
#[derive(Debug, Copy, Clone, PartialEq, Eq, Error)]
pub enum UsbError {
    /// The endpoint answered with a STALL handshake
    #[error("endpoint stalled")]
    Stalled,
    /// The device stopped answering; the transfer timed out
    #[error("device not responding")]
    NotResponding,
    /// The interface is gone, usually an unplug
    #[error("device removed")]
    NoDevice,
    /// The transfer was cancelled via [UsbPipes::abort_pipe]
    #[error("transfer aborted")]
    Aborted,
    /// The stack could not stage the transfer
    #[error("out of transfer resources")]
    NoResources,
    /// Any other host stack failure
    #[error("USB stack error")]
    Other,
}

/// A request sent over the default control pipe
///
/// Field names follow chapter 9 of the USB specification. Direction of the
/// data stage is bit 7 of `request_type`; [UsbPipes::control_in] and
/// [UsbPipes::control_out] must be called accordingly.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DeviceRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

/// Pipe primitives of one opened USB interface.
///
/// An implementation owns the interface exclusively for the lifetime of the
/// value; no other client may issue transfers on its pipes. All methods take
/// `&self`: the transport serialises transfers itself and only ever has one
/// in flight, but [UsbPipes::abort_pipe] and [UsbPipes::reset_port] must be
/// callable concurrently from the recovery paths.
pub trait UsbPipes: Send + Sync {
    /// Reads from a bulk IN endpoint into `buf`, returning the byte count.
    ///
    /// `no_data_timeout` bounds the wait for the first data on the wire,
    /// `completion_timeout` bounds the whole transfer.
    fn bulk_in(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        no_data_timeout: Duration,
        completion_timeout: Duration,
    ) -> Result<usize, UsbError>;

    /// Writes `buf` to a bulk OUT endpoint, returning the byte count.
    fn bulk_out(
        &self,
        endpoint: u8,
        buf: &[u8],
        no_data_timeout: Duration,
        completion_timeout: Duration,
    ) -> Result<usize, UsbError>;

    /// Reads a single packet from an interrupt IN endpoint.
    fn interrupt_in(&self, endpoint: u8, buf: &mut [u8]) -> Result<usize, UsbError>;

    /// Issues a control request with a device-to-host data stage.
    fn control_in(&self, req: DeviceRequest, buf: &mut [u8]) -> Result<usize, UsbError>;

    /// Issues a control request with a host-to-device (or absent) data stage.
    fn control_out(&self, req: DeviceRequest, data: &[u8]) -> Result<(), UsbError>;

    /// Sends CLEAR_FEATURE(ENDPOINT_HALT) for `endpoint` and resets the
    /// host-side data toggle.
    fn clear_stall(&self, endpoint: u8) -> Result<(), UsbError>;

    /// Resets the host-side pipe state (data toggle) without touching the
    /// device.
    fn reset_pipe(&self, endpoint: u8) -> Result<(), UsbError>;

    /// Cancels every transfer outstanding on `endpoint`; blocked callers
    /// return [UsbError::Aborted].
    fn abort_pipe(&self, endpoint: u8) -> Result<(), UsbError>;

    /// Requests a full port reset from the host controller. Heavyweight;
    /// the device re-enumerates afterwards.
    fn reset_port(&self) -> Result<(), UsbError>;
}

/// Builds the GET_STATUS request used to probe an endpoint for the halt bit.
///
/// The response is a 2-byte little-endian status word; bit 0 of the first
/// byte is the halt feature.
pub(crate) fn endpoint_status_request(endpoint: u8) -> DeviceRequest {
    DeviceRequest {
        request_type: REQUEST_TYPE_STANDARD_ENDPOINT_IN,
        request: REQUEST_GET_STATUS,
        value: 0,
        index: endpoint as u16,
        length: 2,
    }
}
