//! Bulk Only Transport and the USB core it runs on
//!
//! The transport doesn't touch any USB peripheral itself. Everything it needs from the device
//! stack is described by [UsbCore], and everything it needs from the OS is described by [Signal].

use num_enum::TryFromPrimitive;
use usb_device::device::UsbDeviceState;
use usb_device::endpoint::EndpointAddress;
use usb_device::UsbError;

pub mod bbb;
pub mod reconcile;
pub mod wrapper;

/// Bulk Only Transport interface protocol
pub const TRANSPORT_BBB: u8 = 0x50;

/// Blocking primitives of a USB device core.
///
/// Bulk transfers block the calling task until the transfer completes, fails or times out.
/// Stall and abort requests must be callable from any context, including the core's own
/// callbacks into [ClassDriver].
///
/// [ClassDriver]: crate::class::ClassDriver
pub trait UsbCore {
    /// Current USB device state
    fn state(&self) -> UsbDeviceState;

    /// Sends `buf` on a bulk IN endpoint, returning the number of bytes sent.
    ///
    /// `timeout_ms == 0` waits forever.
    fn bulk_tx(
        &self,
        ep: EndpointAddress,
        buf: &[u8],
        timeout_ms: u32,
    ) -> Result<usize, TransportError>;

    /// Receives up to `buf.len()` bytes on a bulk OUT endpoint, returning the number of bytes
    /// received. A short packet ends the transfer early.
    ///
    /// `timeout_ms == 0` waits forever.
    fn bulk_rx(
        &self,
        ep: EndpointAddress,
        buf: &mut [u8],
        timeout_ms: u32,
    ) -> Result<usize, TransportError>;

    /// Sets or clears the halt condition of an endpoint
    fn stall(&self, ep: EndpointAddress, stalled: bool);

    fn is_stalled(&self, ep: EndpointAddress) -> bool;

    /// Cancels any pending transfer on an endpoint. Halt and data toggle are left untouched.
    fn abort(&self, ep: EndpointAddress) -> Result<(), TransportError>;
}

impl<T: UsbCore + ?Sized> UsbCore for &T {
    fn state(&self) -> UsbDeviceState {
        (**self).state()
    }

    fn bulk_tx(
        &self,
        ep: EndpointAddress,
        buf: &[u8],
        timeout_ms: u32,
    ) -> Result<usize, TransportError> {
        (**self).bulk_tx(ep, buf, timeout_ms)
    }

    fn bulk_rx(
        &self,
        ep: EndpointAddress,
        buf: &mut [u8],
        timeout_ms: u32,
    ) -> Result<usize, TransportError> {
        (**self).bulk_rx(ep, buf, timeout_ms)
    }

    fn stall(&self, ep: EndpointAddress, stalled: bool) {
        (**self).stall(ep, stalled)
    }

    fn is_stalled(&self, ep: EndpointAddress) -> bool {
        (**self).is_stalled(ep)
    }

    fn abort(&self, ep: EndpointAddress) -> Result<(), TransportError> {
        (**self).abort(ep)
    }
}

/// Counting semaphore provided by the OS.
///
/// `post` may be called from interrupt context and before the matching `pend`.
pub trait Signal {
    /// Blocks until the signal is posted
    fn pend(&self);

    fn post(&self);
}

/// Error reported by the [UsbCore] bulk primitives.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// USB stack error
    Usb(UsbError),
    /// Transfer didn't complete in time
    Timeout,
    /// Transfer was cancelled by [UsbCore::abort] or a bus event
    Aborted,
    /// Packet with an unexpected data toggle or a receive error
    DataToggle,
}

impl From<UsbError> for TransportError {
    fn from(err: UsbError) -> Self {
        TransportError::Usb(err)
    }
}

/// How the transport reacts to a [TransportError]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FaultClass {
    /// Retry the same transfer
    Transient,
    /// Byte stream can't be trusted anymore. Reset Recovery is required
    Desync,
    /// Anything else
    Other,
}

impl TransportError {
    pub fn class(&self) -> FaultClass {
        match self {
            TransportError::Timeout
            | TransportError::Aborted
            | TransportError::Usb(UsbError::WouldBlock)
            | TransportError::Usb(UsbError::InvalidState) => FaultClass::Transient,
            TransportError::DataToggle
            | TransportError::Usb(UsbError::BufferOverflow)
            | TransportError::Usb(UsbError::EndpointOverflow) => FaultClass::Desync,
            TransportError::Usb(_) => FaultClass::Other,
        }
    }
}

/// The status of a Mass Storage command.
///
/// Refer to the USB-MS doc.
#[repr(u8)]
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandStatus {
    #[default]
    Passed = 0x00,
    Failed = 0x01,
    PhaseError = 0x02,
}

/// Data stage direction, as seen by the host or announced by the device
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataDirection {
    /// Host to device
    Out,
    /// Device to host
    In,
    /// No data stage
    #[default]
    NotExpected,
}

impl DataDirection {
    /// Direction of a data stage of `len` bytes with the given `bmCBWFlags`
    pub fn from_flags(flags: u8, len: u32) -> Self {
        if len == 0 {
            DataDirection::NotExpected
        } else if flags & CBW_FLAGS_DIR_IN != 0 {
            DataDirection::In
        } else {
            DataDirection::Out
        }
    }
}

pub(crate) const CBW_FLAGS_DIR_IN: u8 = 1 << 7;
