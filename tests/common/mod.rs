#![allow(dead_code)]

use std::sync::mpsc::{channel, sync_channel, Receiver};
use std::thread;
use std::time::Duration;

use usbh_storage::device::InterfaceInfo;
use usbh_storage::scsi::{ScsiTask, TaskResult};
use usbh_storage::transport::{TRANSPORT_BBB, TRANSPORT_CB, TRANSPORT_CBI};
use usbh_storage::{SUBCLASS_SCSI, SUBCLASS_UFI};

pub mod fake;

pub const BULK_IN: u8 = 0x81;
pub const BULK_OUT: u8 = 0x02;
pub const INTERRUPT_IN: u8 = 0x83;

pub fn bot_interface() -> InterfaceInfo {
    InterfaceInfo {
        interface_number: 0,
        subclass: SUBCLASS_SCSI,
        protocol: TRANSPORT_BBB,
        bulk_in: BULK_IN,
        bulk_out: BULK_OUT,
        interrupt_in: None,
    }
}

pub fn cbi_interface(subclass: u8) -> InterfaceInfo {
    InterfaceInfo {
        interface_number: 0,
        subclass,
        protocol: TRANSPORT_CBI,
        bulk_in: BULK_IN,
        bulk_out: BULK_OUT,
        interrupt_in: Some(INTERRUPT_IN),
    }
}

pub fn cb_interface() -> InterfaceInfo {
    InterfaceInfo {
        interface_number: 0,
        subclass: SUBCLASS_UFI,
        protocol: TRANSPORT_CB,
        bulk_in: BULK_IN,
        bulk_out: BULK_OUT,
        interrupt_in: None,
    }
}

/// A completion closure paired with the channel its verdict arrives on
pub fn completion() -> (
    Box<dyn FnOnce(ScsiTask, TaskResult) + Send>,
    Receiver<(ScsiTask, TaskResult)>,
) {
    let (tx, rx) = channel();
    (
        Box::new(move |task, result| {
            let _ = tx.send((task, result));
        }),
        rx,
    )
}

/// Wire image of a Command Status Wrapper
pub fn csw_bytes(tag: u32, residue: u32, status: u8) -> Vec<u8> {
    let mut bytes = vec![];
    bytes.extend_from_slice(0x53425355u32.to_le_bytes().as_slice());
    bytes.extend_from_slice(tag.to_le_bytes().as_slice());
    bytes.extend_from_slice(residue.to_le_bytes().as_slice());
    bytes.push(status);
    bytes
}

pub fn cbw_tag(cbw: &[u8]) -> u32 {
    u32::from_le_bytes(cbw[4..8].try_into().unwrap())
}

pub fn timeout<F, T>(timeout: Duration, f: F)
where
    F: FnOnce() -> T,
    F: Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = sync_channel(0);
    thread::spawn(move || {
        f();
        tx.send(()).unwrap();
    });
    rx.recv_timeout(timeout).expect("timeout");
}
