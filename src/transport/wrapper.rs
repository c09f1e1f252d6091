//! Command Block Wrapper (CBW) and Command Status Wrapper (CSW) wire layouts
//!
//! Both wrappers are little endian. Parsing and formatting never validate anything, use
//! [CommandBlockWrapper::validate] before acting on a received CBW.

use crate::transport::{CommandStatus, DataDirection};
use num_enum::TryFromPrimitive;

pub const CBW_SIGNATURE: u32 = 0x43425355;
pub const CSW_SIGNATURE: u32 = 0x53425355;

pub const CBW_LEN: usize = 31;
pub const CSW_LEN: usize = 13;

/// Size of the `CBWCB` field
pub const CB_LEN: usize = 16;

/// Host's transfer request
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommandBlockWrapper {
    pub signature: u32,
    /// Echoed back in the CSW
    pub tag: u32,
    pub data_transfer_len: u32,
    /// Bit 7 is the direction, `1` = device to host
    pub flags: u8,
    pub lun: u8,
    /// Number of valid bytes in `block`
    pub block_len: u8,
    pub block: [u8; CB_LEN],
}

/// Why a CBW isn't valid nor meaningful. Refer to USB BBB doc 6.2
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InvalidCbw {
    /// Received transfer is not 31 bytes long
    Length(usize),
    Signature(u32),
    /// LUN bits 4..7 or CB length bits 5..7 are set
    ReservedBits,
    /// LUN is not registered
    Lun(u8),
}

impl CommandBlockWrapper {
    pub fn from_le_bytes(raw: &[u8; CBW_LEN]) -> Self {
        let mut block = [0u8; CB_LEN];
        block.copy_from_slice(&raw[15..]);

        CommandBlockWrapper {
            signature: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            tag: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            data_transfer_len: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            flags: raw[12],
            lun: raw[13],
            block_len: raw[14],
            block,
        }
    }

    pub fn to_le_bytes(&self) -> [u8; CBW_LEN] {
        let mut raw = [0u8; CBW_LEN];
        raw[..4].copy_from_slice(self.signature.to_le_bytes().as_slice());
        raw[4..8].copy_from_slice(self.tag.to_le_bytes().as_slice());
        raw[8..12].copy_from_slice(self.data_transfer_len.to_le_bytes().as_slice());
        raw[12] = self.flags;
        raw[13] = self.lun;
        raw[14] = self.block_len;
        raw[15..].copy_from_slice(self.block.as_slice());
        raw
    }

    /// Checks the CBW is valid and meaningful for a device with `max_lun` logical units
    pub fn validate(&self, max_lun: u8) -> Result<(), InvalidCbw> {
        if self.signature != CBW_SIGNATURE {
            return Err(InvalidCbw::Signature(self.signature));
        }
        if self.lun & 0xF0 != 0 || self.block_len & 0xE0 != 0 {
            return Err(InvalidCbw::ReservedBits);
        }
        if self.lun >= max_lun {
            return Err(InvalidCbw::Lun(self.lun));
        }
        Ok(())
    }

    /// What the host expects to happen during the data stage
    pub fn direction(&self) -> DataDirection {
        DataDirection::from_flags(self.flags, self.data_transfer_len)
    }

    /// SCSI operation code
    pub fn opcode(&self) -> u8 {
        self.block[0]
    }
}

/// Device's transfer outcome
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommandStatusWrapper {
    pub signature: u32,
    pub tag: u32,
    /// Requested minus actually transferred bytes
    pub data_residue: u32,
    pub status: CommandStatus,
}

/// Unknown `bCSWStatus`
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InvalidCsw(pub u8);

impl Default for CommandStatusWrapper {
    fn default() -> Self {
        CommandStatusWrapper::new(0, 0, CommandStatus::Passed)
    }
}

impl CommandStatusWrapper {
    pub fn new(tag: u32, data_residue: u32, status: CommandStatus) -> Self {
        CommandStatusWrapper {
            signature: CSW_SIGNATURE,
            tag,
            data_residue,
            status,
        }
    }

    pub fn to_le_bytes(&self) -> [u8; CSW_LEN] {
        let mut csw = [0u8; CSW_LEN];
        csw[..4].copy_from_slice(self.signature.to_le_bytes().as_slice());
        csw[4..8].copy_from_slice(self.tag.to_le_bytes().as_slice());
        csw[8..12].copy_from_slice(self.data_residue.to_le_bytes().as_slice());
        csw[12] = self.status as u8;
        csw
    }

    pub fn from_le_bytes(raw: &[u8; CSW_LEN]) -> Result<Self, InvalidCsw> {
        let status = CommandStatus::try_from_primitive(raw[12]).map_err(|_| InvalidCsw(raw[12]))?;

        Ok(CommandStatusWrapper {
            signature: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            tag: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            data_residue: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            status,
        })
    }
}
