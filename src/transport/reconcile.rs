//! Host/device data stage reconciliation
//!
//! The USB BBB doc (section 6.7) enumerates thirteen combinations of what the host asked for
//! in the CBW (`Hn`, `Hi`, `Ho`) and what the device is going to do (`Dn`, `Di`, `Do`).
//! [reconcile] maps each of them to a CSW status and to the endpoint that has to be stalled
//! once the data stage is over.

use crate::transport::{CommandStatus, DataDirection};
use core::cmp::min;

/// Outcome of a host/device comparison
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Reconciliation {
    /// Case number, 1..=13
    pub case: u8,
    pub status: CommandStatus,
    pub stall_in: bool,
    pub stall_out: bool,
    /// Bytes to move during the data stage
    pub transfer_len: u32,
}

impl Reconciliation {
    fn new(case: u8, status: CommandStatus) -> Self {
        Reconciliation {
            case,
            status,
            stall_in: false,
            stall_out: false,
            transfer_len: 0,
        }
    }

    fn stall_in(self) -> Self {
        Reconciliation {
            stall_in: true,
            ..self
        }
    }

    fn stall_out(self) -> Self {
        Reconciliation {
            stall_out: true,
            ..self
        }
    }

    fn transfer(self, len: u32) -> Self {
        Reconciliation {
            transfer_len: len,
            ..self
        }
    }

    /// Host and device disagree on the direction of the data stage
    pub fn direction_mismatch(&self) -> bool {
        matches!(self.case, 8 | 10)
    }
}

/// Compares the host expectation with the device intent.
///
/// A zero length or a [DataDirection::NotExpected] direction on either side means "no data".
pub fn reconcile(
    host_len: u32,
    host_dir: DataDirection,
    device_len: u32,
    device_dir: DataDirection,
) -> Reconciliation {
    use CommandStatus::{Failed, Passed, PhaseError};
    use DataDirection::{In, NotExpected, Out};

    let host_dir = if host_len == 0 { NotExpected } else { host_dir };
    let (device_len, device_dir) = match device_dir {
        _ if device_len == 0 => (0, NotExpected),
        NotExpected => (0, NotExpected),
        dir => (device_len, dir),
    };
    let common = min(host_len, device_len);

    match (host_dir, device_dir) {
        (NotExpected, NotExpected) => Reconciliation::new(1, Passed),
        (NotExpected, In) => Reconciliation::new(2, PhaseError),
        (NotExpected, Out) => Reconciliation::new(3, PhaseError),

        (In, NotExpected) => Reconciliation::new(4, Failed).stall_in(),
        (In, In) if host_len > device_len => Reconciliation::new(5, Passed)
            .stall_in()
            .transfer(common),
        (In, In) if host_len == device_len => Reconciliation::new(6, Passed).transfer(common),
        (In, In) => Reconciliation::new(7, PhaseError).transfer(common),
        (In, Out) => Reconciliation::new(8, PhaseError),

        (Out, NotExpected) => Reconciliation::new(9, Passed).stall_out(),
        (Out, In) => Reconciliation::new(10, PhaseError),
        (Out, Out) if host_len > device_len => Reconciliation::new(11, Passed)
            .stall_out()
            .transfer(common),
        (Out, Out) if host_len == device_len => Reconciliation::new(12, Passed).transfer(common),
        (Out, Out) => Reconciliation::new(13, PhaseError).transfer(common),
    }
}
