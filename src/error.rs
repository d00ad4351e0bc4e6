//! Error definitions shared across library modules.
//! Only construction-time failures surface here: runtime protocol errors
//! (stuff, bit, and form errors) feed the fault-confinement counters instead
//! of being reported to the caller.
use thiserror::Error;

#[derive(Error, Debug)]
/// Errors that can occur while building a standard-format data frame.
pub enum FrameError {
    /// The identifier does not fit in the 11-bit arbitration field.
    #[error("identifier {0:#05x} does not fit in 11 bits")]
    InvalidId(u16),
    /// More payload bytes than the DLC can express.
    #[error("payload of {0} bytes exceeds the 8-byte limit")]
    PayloadTooLarge(usize),
}

#[derive(Error, Debug)]
/// Errors raised by the bus lifecycle.
pub enum BusError {
    /// The bus has already been activated; its topology is frozen.
    #[error("bus is already active")]
    AlreadyActive,
}

#[derive(Error, Debug)]
/// Failure to attach a node to its bus.
pub enum NodeAttachError {
    /// The bus refused the attachment.
    #[error("cannot attach to bus: {0}")]
    Bus(#[from] BusError),
}
