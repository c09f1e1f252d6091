#![allow(dead_code)]

use std::sync::mpsc::sync_channel;
use std::sync::{Condvar, Mutex};
use std::thread;
use std::time::Duration;
use usb_device::control::{Recipient, Request, RequestType};
use usb_device::UsbDirection;
use usbd_msc::class::{ClassDriver, ClassHandle, CommHandle, Msc, MscConfig};
use usbd_msc::subclass::{LunId, SUBCLASS_SCSI};
use usbd_msc::transport::bbb::{BulkOnly, CommState};
use usbd_msc::transport::Signal;

use crate::common::bbb::{bulk_in, bulk_out, DummyCore};
use crate::common::disk::{RamDisk, INFO};

pub mod bbb;
pub mod disk;

pub const CONFIG: u8 = 1;
pub const DISK_BLOCKS: usize = 8;

pub type TestMsc = Msc<'static, DummyCore, StdSignal, 1, 2>;
pub type TestTask = BulkOnly<'static, 'static, DummyCore, StdSignal, Vec<u8>, 1, 2>;

/// Counting semaphore
#[derive(Default)]
pub struct StdSignal {
    count: Mutex<u32>,
    cond: Condvar,
}

impl Signal for StdSignal {
    fn pend(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    fn post(&self) {
        *self.count.lock().unwrap() += 1;
        self.cond.notify_one();
    }
}

/// A configured device with a single class instance
pub struct Device {
    pub core: DummyCore,
    pub msc: &'static TestMsc,
    pub class: ClassHandle,
    pub comm: CommHandle,
    pub disks: Vec<&'static RamDisk>,
    pub luns: Vec<LunId>,
}

impl Device {
    /// Registers and attaches `luns` RAM disks, then activates the configuration
    pub fn new(luns: usize, config: MscConfig) -> Self {
        let core = DummyCore::new();
        let msc: &'static TestMsc = Box::leak(Box::new(Msc::new(core.clone(), config)));
        let class = msc.create_instance(SUBCLASS_SCSI).unwrap();
        let comm = msc
            .add_to_configuration(class, CONFIG, bulk_in(), bulk_out())
            .unwrap();

        let mut disks = vec![];
        let mut ids = vec![];
        for _ in 0..luns {
            let disk: &'static RamDisk = Box::leak(Box::new(RamDisk::new(DISK_BLOCKS)));
            let lun = msc.register_lun(class, INFO, disk).unwrap();
            msc.attach(class, lun, "ram").unwrap();
            disks.push(disk);
            ids.push(lun);
        }

        msc.connect(CONFIG, comm);

        Self {
            core,
            msc,
            class,
            comm,
            disks,
            luns: ids,
        }
    }

    pub fn task(&self, buf_len: usize) -> TestTask {
        self.msc.task(self.class, vec![0u8; buf_len]).unwrap()
    }

    pub fn state(&self) -> CommState {
        self.msc.comm_state(self.comm).unwrap()
    }

    /// Host side Clear Feature HALT followed by the core's notification
    pub fn clear_halt(&self, ep: usb_device::endpoint::EndpointAddress) {
        self.core.clear_halt(ep);
        self.msc.endpoint_state_update(CONFIG, self.comm, ep);
    }

    pub fn mass_storage_reset(&self) -> usb_device::Result<usize> {
        self.msc
            .class_request(self.comm, &class_request(UsbDirection::Out, 0xFF, 0), &mut [])
    }

    pub fn get_max_lun(&self) -> usb_device::Result<u8> {
        let mut data = [0xAAu8; 1];
        self.msc
            .class_request(self.comm, &class_request(UsbDirection::In, 0xFE, 1), &mut data)
            .map(|_| data[0])
    }
}

pub fn class_request(direction: UsbDirection, request: u8, length: u16) -> Request {
    Request {
        direction,
        request_type: RequestType::Class,
        recipient: Recipient::Interface,
        request,
        value: 0,
        index: 0,
        length,
    }
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
