//! Error kinds shared by every layer of the driver.

use std::time::Duration;

use crate::coord::CoreCoord;

/// The single error type returned by fallible driver operations.
///
/// Lower layers (TLB, ARC messenger, transport) return these directly; the
/// `Chip` and `Cluster` façades propagate them unchanged to callers. Nothing
/// in this crate retries on a caller's behalf — retry policy belongs to the
/// caller, per the ARC messaging contract.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("access [{offset}, {offset}+{size}) exceeds window of {usable_size} bytes")]
    OutOfBounds {
        offset: u64,
        size: u64,
        usable_size: u64,
    },

    #[error("misaligned access: offset 0x{offset:x}, size {size} (register accesses require 4-byte alignment and a 4-byte multiple size)")]
    Alignment { offset: u64, size: u64 },

    #[error("{what} is not supported on this architecture generation")]
    Unsupported { what: &'static str },

    #[error("core type {core_type:?} cannot be a multicast target")]
    UnsupportedCoreType { core_type: crate::coord::CoreType },

    #[error("{coord:?} has no coordinate in the {target:?} system (it is a harvested unit)")]
    NoSuchCoordinate {
        coord: CoreCoord,
        target: crate::coord::CoordSystem,
    },

    #[error("resource busy: {what}")]
    Busy { what: &'static str },

    #[error("no free {what} available")]
    Exhausted { what: &'static str },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("DMA did not complete within {0:?}")]
    DmaTimeout(Duration),

    #[error("SIGBUS while accessing the mapped BAR region")]
    BusError,

    #[error("hardware appears hung (scratch register read back all-ones)")]
    HardwareHung,

    #[error("ARC firmware did not recognize message code 0x{0:x}")]
    UnknownMessage(u32),

    #[error("malformed ARC response: {0}")]
    ProtocolError(String),

    #[error("kernel-driver call failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("cluster descriptor invariant violated: {0}")]
    Verification(String),
}

pub type Result<T> = std::result::Result<T, DriverError>;
