//! Host-side USB Mass Storage transport layer
//!
//! Carries SCSI command blocks between a host SCSI stack and a USB storage
//! peripheral over the transports defined by the USB Mass Storage class:
//!
//! # Transports:
//! * [Bulk Only] - three-phase Command/Data/Status protocol
//! * [CBI / CB] - control-endpoint commands with optional interrupt status
//!
//! The crate owns the transport state machines, single-in-flight arbitration,
//! MaxLUN discovery and the fault-recovery paths (endpoint clears,
//! reset-recovery, port reset). It does not interpret SCSI commands: CDBs and
//! data buffers pass through untouched, carried by a [ScsiTask].
//!
//! The USB stack itself is abstracted behind the [UsbPipes] trait; a platform
//! binds the crate to real hardware by implementing it over its bulk, interrupt
//! and control pipe primitives.
//!
//! # Features
//! | Feature | Description                           |
//! | ------- |---------------------------------------|
//! | `log` | Enable logging via [log](https://crates.io/crates/log) crate |
//!
//! [Bulk Only]: crate::transport::bbb
//! [CBI / CB]: crate::transport::cbi
//! [ScsiTask]: crate::scsi::ScsiTask
//! [UsbPipes]: crate::pipes::UsbPipes

pub mod device;
pub(crate) mod fmt;
pub mod pipes;
pub mod quirks;
pub(crate) mod recovery;
pub mod scsi;
pub mod transport;

/// USB Mass Storage Class code
pub const CLASS_MASS_STORAGE: u8 = 0x08;

/* Mass Storage subclass codes (bInterfaceSubClass) */

/// Reduced Block Commands
pub const SUBCLASS_RBC: u8 = 0x01;
/// SFF-8020i / MMC-2 (ATAPI)
pub const SUBCLASS_SFF8020I: u8 = 0x02;
/// QIC-157 tape
pub const SUBCLASS_QIC157: u8 = 0x03;
/// USB Floppy Interface
pub const SUBCLASS_UFI: u8 = 0x04;
/// SFF-8070i
pub const SUBCLASS_SFF8070I: u8 = 0x05;
/// SCSI Transparent command set
pub const SUBCLASS_SCSI: u8 = 0x06;
