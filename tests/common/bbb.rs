use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use usb_device::device::UsbDeviceState;
use usb_device::endpoint::EndpointAddress;
use usb_device::UsbDirection;
use usbd_msc::transport::{TransportError, UsbCore};

pub const CBW_SIGNATURE: u32 = 0x43425355;
pub const CSW_SIGNATURE: u32 = 0x53425355;
const CBW_LEN: usize = 31;
const CSW_LEN: usize = 13;

pub fn bulk_in() -> EndpointAddress {
    EndpointAddress::from_parts(1, UsbDirection::In)
}

pub fn bulk_out() -> EndpointAddress {
    EndpointAddress::from_parts(2, UsbDirection::Out)
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum CommandStatus {
    Passed = 0x00,
    Failed = 0x01,
    PhaseError = 0x02,
}

#[allow(dead_code)]
#[derive(Copy, Clone)]
pub enum DataDirection {
    Out,
    In,
    NotExpected,
}

/// Command Block Wrapper as built by a USB host
pub struct Cbw {
    pub signature: u32,
    pub tag: u32,
    pub data_transfer_len: u32,
    pub direction: DataDirection,
    pub lun: u8,
    pub block: Vec<u8>,
}

impl Cbw {
    pub fn new(tag: u32, data_transfer_len: u32, direction: DataDirection, block: Vec<u8>) -> Self {
        Cbw {
            signature: CBW_SIGNATURE,
            tag,
            data_transfer_len,
            direction,
            lun: 0,
            block,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        assert!((1..=16).contains(&self.block.len()));

        let mut bytes = vec![];
        bytes.extend_from_slice(self.signature.to_le_bytes().as_slice()); // signature
        bytes.extend_from_slice(self.tag.to_le_bytes().as_slice()); // tag
        bytes.extend_from_slice(self.data_transfer_len.to_le_bytes().as_slice()); // data transfer len

        let direction = match self.direction {
            DataDirection::In => 1_u8 << 7,
            DataDirection::Out | DataDirection::NotExpected => 0u8,
        };
        bytes.push(direction); // direction
        bytes.push(self.lun); // lun
        bytes.push(self.block.len() as u8); // block size

        let mut block = vec![0u8; 16];
        block.as_mut_slice()[..self.block.len()].copy_from_slice(self.block.as_slice());
        bytes.extend_from_slice(block.as_slice()); // block

        assert_eq!(CBW_LEN, bytes.len());
        bytes
    }
}

/// Command Status Wrapper as seen by a USB host
#[derive(Debug, Eq, PartialEq)]
pub struct Csw {
    pub tag: u32,
    pub data_residue: u32,
    pub status: CommandStatus,
}

impl Csw {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        assert_eq!(CSW_LEN, bytes.len());
        assert_eq!(
            CSW_SIGNATURE,
            u32::from_le_bytes(bytes[..4].try_into().unwrap())
        );

        let status = match bytes[12] {
            0x00 => CommandStatus::Passed,
            0x01 => CommandStatus::Failed,
            0x02 => CommandStatus::PhaseError,
            _ => panic!("invalid status code"),
        };

        Self {
            tag: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            data_residue: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            status,
        }
    }
}

struct Inner {
    state: UsbDeviceState,
    /// Host to device transfers, a short one ends a data stage
    out_transfers: VecDeque<Vec<u8>>,
    /// Device to host transfers
    in_transfers: VecDeque<Vec<u8>>,
    rx_errors: VecDeque<TransportError>,
    tx_errors: VecDeque<TransportError>,
    stalled: HashSet<u8>,
    aborted: Vec<u8>,
}

/// USB core with a host on the other end of the bus
#[derive(Clone)]
pub struct DummyCore {
    inner: Arc<Mutex<Inner>>,
}

impl DummyCore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: UsbDeviceState::Configured,
                out_transfers: VecDeque::new(),
                in_transfers: VecDeque::new(),
                rx_errors: VecDeque::new(),
                tx_errors: VecDeque::new(),
                stalled: HashSet::new(),
                aborted: vec![],
            })),
        }
    }

    pub fn set_state(&self, state: UsbDeviceState) {
        self.inner.lock().unwrap().state = state;
    }

    /// Write Command Block Wrapper as if it was written by a USB host
    pub fn write_cbw(&self, cbw: Cbw) {
        self.write_data(cbw.into_bytes().as_slice());
    }

    /// Write some data as if it was written by a USB host during Host to Device data transfer
    pub fn write_data(&self, data: &[u8]) {
        self.inner
            .lock()
            .unwrap()
            .out_transfers
            .push_back(data.to_vec());
    }

    /// Read a single transfer as if it was read by a USB host
    pub fn read_transfer(&self) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().in_transfers.pop_front()
    }

    /// Read data stage transfers until `n` bytes are collected
    pub fn read_n_bytes(&self, n: usize) -> Vec<u8> {
        let mut bytes = vec![];
        while bytes.len() < n {
            match self.read_transfer() {
                None => break,
                Some(mut transfer) => bytes.append(&mut transfer),
            }
        }
        bytes
    }

    /// Read Command Status as if it was read by a USB host
    pub fn read_csw(&self) -> Option<Csw> {
        self.read_transfer()
            .map(|bytes| Csw::from_bytes(bytes.as_slice()))
    }

    pub fn nothing_sent(&self) -> bool {
        self.inner.lock().unwrap().in_transfers.is_empty()
    }

    pub fn fail_next_rx(&self, err: TransportError) {
        self.inner.lock().unwrap().rx_errors.push_back(err);
    }

    pub fn fail_next_tx(&self, err: TransportError) {
        self.inner.lock().unwrap().tx_errors.push_back(err);
    }

    /// Clear Feature HALT, as the core does it on behalf of the host
    pub fn clear_halt(&self, ep: EndpointAddress) {
        self.inner.lock().unwrap().stalled.remove(&u8::from(ep));
    }

    pub fn was_aborted(&self, ep: EndpointAddress) -> bool {
        self.inner.lock().unwrap().aborted.contains(&u8::from(ep))
    }
}

impl UsbCore for DummyCore {
    fn state(&self) -> UsbDeviceState {
        self.inner.lock().unwrap().state
    }

    fn bulk_tx(
        &self,
        ep: EndpointAddress,
        buf: &[u8],
        _timeout_ms: u32,
    ) -> Result<usize, TransportError> {
        assert!(ep.is_in());
        let mut lock = self.inner.lock().unwrap();
        if let Some(err) = lock.tx_errors.pop_front() {
            return Err(err);
        }
        lock.in_transfers.push_back(buf.to_vec());
        Ok(buf.len())
    }

    fn bulk_rx(
        &self,
        ep: EndpointAddress,
        buf: &mut [u8],
        _timeout_ms: u32,
    ) -> Result<usize, TransportError> {
        assert!(ep.is_out());
        let mut lock = self.inner.lock().unwrap();
        if let Some(err) = lock.rx_errors.pop_front() {
            return Err(err);
        }

        // nothing from the host
        let Some(transfer) = lock.out_transfers.front_mut() else {
            return Err(TransportError::Timeout);
        };
        let count = transfer.len().min(buf.len());
        buf[..count].copy_from_slice(&transfer[..count]);
        transfer.drain(..count);
        if transfer.is_empty() {
            lock.out_transfers.pop_front();
        }
        Ok(count)
    }

    fn stall(&self, ep: EndpointAddress, stalled: bool) {
        let mut lock = self.inner.lock().unwrap();
        if stalled {
            lock.stalled.insert(u8::from(ep));
        } else {
            lock.stalled.remove(&u8::from(ep));
        }
    }

    fn is_stalled(&self, ep: EndpointAddress) -> bool {
        self.inner.lock().unwrap().stalled.contains(&u8::from(ep))
    }

    fn abort(&self, ep: EndpointAddress) -> Result<(), TransportError> {
        self.inner.lock().unwrap().aborted.push(u8::from(ep));
        Ok(())
    }
}
