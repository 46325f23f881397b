//! Per-device protocol policies
//!
//! Shipping mass-storage devices misdeclare themselves often enough that the
//! transport accepts a per-device override set at attach time. The dictionary
//! normally comes from the platform property store; [Quirks::for_device]
//! seeds it from a small built-in table of known offenders.

/// Per-device overrides, read-only after attach
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Quirks {
    /// Use this interface protocol instead of the descriptor's
    pub preferred_protocol: Option<u8>,
    /// Use this subclass instead of the descriptor's
    pub preferred_subclass: Option<u8>,
    /// Recover with a standard USB reset instead of the class-specific
    /// Bulk-Only reset
    pub use_standard_usb_reset: bool,
    /// Device loses its marbles across suspend; reset it on every resume
    pub reset_on_resume: bool,
    /// Skip GET MAX LUN and use this value
    pub declared_max_lun: Option<u8>,
    /// Largest block count per READ the device tolerates
    pub max_block_count_read: Option<u32>,
    /// Largest block count per WRITE the device tolerates
    pub max_block_count_write: Option<u32>,
    /// Largest byte count per READ the device tolerates
    pub max_byte_count_read: Option<u64>,
    /// Largest byte count per WRITE the device tolerates
    pub max_byte_count_write: Option<u64>,
}

impl Quirks {
    /// No overrides
    pub fn none() -> Self {
        Self::default()
    }

    /// Looks up `(vid, pid)` in the built-in table. Unknown devices get an
    /// empty set; platform glue may still merge its own store on top.
    pub fn for_device(vid: u16, pid: u16) -> Self {
        for (id, quirks) in KNOWN_DEVICES {
            if *id == (vid, pid) {
                return quirks.clone();
            }
        }
        Self::default()
    }
}

const KNOWN_DEVICES: &[((u16, u16), Quirks)] = &[
    // Genesys Logic card readers drop off the bus across suspend
    (
        (0x05e3, 0x0702),
        Quirks {
            preferred_protocol: None,
            preferred_subclass: None,
            use_standard_usb_reset: false,
            reset_on_resume: true,
            declared_max_lun: None,
            max_block_count_read: None,
            max_block_count_write: None,
            max_byte_count_read: None,
            max_byte_count_write: None,
        },
    ),
    // Early Cypress bridges wedge on the class-specific reset
    (
        (0x04b4, 0x6830),
        Quirks {
            preferred_protocol: None,
            preferred_subclass: None,
            use_standard_usb_reset: true,
            reset_on_resume: false,
            declared_max_lun: Some(0),
            max_block_count_read: None,
            max_block_count_write: None,
            max_byte_count_read: None,
            max_byte_count_write: None,
        },
    ),
];
