//! USB Mass Storage subclasses
//!
//! The transport doesn't interpret command blocks. Every logical unit is backed by a
//! [LunHandler] which runs the subclass command set (SCSI, UFI or vendor specific) and
//! moves bytes between the data stage and its medium.

use crate::transport::DataDirection;

pub mod registry;

/// SCSI device subclass code
pub const SUBCLASS_SCSI: u8 = 0x06; // SCSI Transparent command set

/// UFI subclass code
pub const SUBCLASS_UFI: u8 = 0x04;

/// Most logical units a BOT device can address (4-bit `bCBWLUN`)
pub const MAX_LUNS: usize = 16;

const MAX_VENDOR_ID_LEN: usize = 8;
const MAX_PRODUCT_ID_LEN: usize = 16;

/// Logical unit index, as carried by `bCBWLUN`
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LunId(pub(crate) u8);

impl LunId {
    pub fn index(&self) -> u8 {
        self.0
    }
}

/// Logical unit description, as reported by `INQUIRY`
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LunInfo<'a> {
    /// At most 8 bytes
    pub vendor_id: &'a str,
    /// At most 16 bytes
    pub product_id: &'a str,
    pub revision: u32,
    pub read_only: bool,
}

impl LunInfo<'_> {
    pub(crate) fn is_valid(&self) -> bool {
        self.vendor_id.len() <= MAX_VENDOR_ID_LEN && self.product_id.len() <= MAX_PRODUCT_ID_LEN
    }
}

/// What the device is going to do during the data stage of a command
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DataPhase {
    pub len: u32,
    pub direction: DataDirection,
}

impl DataPhase {
    /// The command has no data stage
    pub fn none() -> Self {
        Default::default()
    }

    /// `len` bytes will be sent to the host
    pub fn to_host(len: u32) -> Self {
        DataPhase {
            len,
            direction: DataDirection::In,
        }
    }

    /// `len` bytes are expected from the host
    pub fn from_host(len: u32) -> Self {
        DataPhase {
            len,
            direction: DataDirection::Out,
        }
    }
}

/// Failure reported by a [LunHandler]. Ends up as a `FAILED` CSW
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandError {
    /// No medium is attached to the logical unit
    NotPresent,
    /// The command or the medium access failed
    Failed,
}

/// Command set of a logical unit.
///
/// Handlers are shared between the task driving the transport and the configuration API,
/// so all methods take `&self`.
pub trait LunHandler: Sync {
    /// Runs a command block.
    ///
    /// `buf` is the transport's scratch buffer. Returns the length and direction of the data
    /// stage the device intends to perform.
    fn process_command(
        &self,
        lun: LunId,
        cb: &[u8],
        buf: &mut [u8],
    ) -> Result<DataPhase, CommandError>;

    /// Fills `buf` with the next chunk of data to send to the host
    fn read_data(&self, lun: LunId, opcode: u8, buf: &mut [u8]) -> Result<(), CommandError>;

    /// Consumes the next chunk of data received from the host
    fn write_data(&self, lun: LunId, opcode: u8, buf: &[u8]) -> Result<(), CommandError>;

    /// Called when a medium is attached to the logical unit
    fn open(&self, _lun: LunId, _medium: &str) -> Result<(), CommandError> {
        Ok(())
    }

    /// Called when the medium is detached
    fn close(&self, _lun: LunId) -> Result<(), CommandError> {
        Ok(())
    }

    /// The host activated the configuration
    fn enable(&self, _lun: LunId) {}

    /// The host deactivated the configuration, or the bus was reset
    fn disable(&self, _lun: LunId) {}
}
