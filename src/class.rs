//! Mass Storage class instances and their binding to the USB core
//!
//! [Msc] owns a fixed pool of class instances and a fixed pool of communications (one per
//! configuration an instance is added to). Both are addressed by opaque handles, the USB core
//! hands a [CommHandle] back on every [ClassDriver] callback.

use crate::subclass::registry::LunRegistry;
use crate::subclass::{CommandError, LunHandler, LunId, LunInfo, MAX_LUNS};
use crate::transport::bbb::{BulkOnly, CommState, Communication, MIN_BUFFER_LEN};
use crate::transport::{Signal, UsbCore, TRANSPORT_BBB};
use crate::CLASS_MASS_STORAGE;
use core::borrow::BorrowMut;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use num_enum::TryFromPrimitive;
use usb_device::control::{Recipient, Request, RequestType};
use usb_device::device::UsbDeviceState;
use usb_device::endpoint::EndpointAddress;
use usb_device::{UsbDirection, UsbError};

const CLASS_SPECIFIC_BULK_ONLY_MASS_STORAGE_RESET: u8 = 0xFF;
const CLASS_SPECIFIC_GET_MAX_LUN: u8 = 0xFE;

const NO_COMM: u8 = u8::MAX;

/// Configuration of the class
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MscConfig {
    /// Logical units per class instance, 1..=16
    pub lun_quota: u8,
    /// Timeout of every bulk transfer. `0` waits forever
    pub bulk_timeout_ms: u32,
    /// Consecutive CBW receive failures tolerated before Reset Recovery. `None` retries forever
    pub cbw_retry_limit: Option<u8>,
}

impl MscConfig {
    pub const fn new() -> Self {
        MscConfig {
            lun_quota: MAX_LUNS as u8,
            bulk_timeout_ms: 0,
            cbw_retry_limit: Some(8),
        }
    }
}

impl Default for MscConfig {
    fn default() -> Self {
        MscConfig::new()
    }
}

/// Pool a [MscError::ResourceExhausted] refers to
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Resource {
    ClassInstance,
    Communication,
    Lun,
}

/// Configuration API error
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MscError {
    /// A fixed size pool is full
    ResourceExhausted(Resource),
    /// Class or communication handle doesn't come from this [Msc]
    InvalidHandle,
    /// Bulk endpoint address with the wrong direction
    InvalidEndpoint,
    /// Unknown logical unit or invalid [LunInfo]
    InvalidLun,
    /// Operation not allowed in the current state
    InvalidState,
    /// Data buffer can't fit a single bulk packet
    BufferTooSmall,
    /// The [LunHandler] refused to open or close its medium
    Medium(CommandError),
}

/// Class instance index
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ClassHandle(pub(crate) u8);

impl ClassHandle {
    pub fn index(&self) -> u8 {
        self.0
    }
}

/// Communication index, the interface argument of [ClassDriver] callbacks
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommHandle(pub(crate) u8);

impl CommHandle {
    pub fn index(&self) -> u8 {
        self.0
    }
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
enum ClassState {
    None = 0,
    /// Added to a configuration
    Init,
    /// Configuration active
    Config,
}

pub(crate) struct ClassInstance<'a, S> {
    state: AtomicU8,
    subclass: AtomicU8,
    comm: AtomicU8,
    task_taken: AtomicBool,
    pub(crate) luns: LunRegistry<'a>,
    /// Posted on configuration activation
    pub(crate) connect: S,
    /// Posted when a halt is cleared, or on teardown
    pub(crate) comm_signal: S,
}

impl<S: Default> ClassInstance<'_, S> {
    fn new(lun_quota: u8) -> Self {
        ClassInstance {
            state: AtomicU8::new(ClassState::None as u8),
            subclass: AtomicU8::new(0),
            comm: AtomicU8::new(NO_COMM),
            task_taken: AtomicBool::new(false),
            luns: LunRegistry::new(lun_quota),
            connect: S::default(),
            comm_signal: S::default(),
        }
    }
}

impl<S> ClassInstance<'_, S> {
    fn state(&self) -> ClassState {
        ClassState::try_from_primitive(self.state.load(Ordering::Acquire))
            .unwrap_or(ClassState::None)
    }

    fn set_state(&self, state: ClassState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Callbacks the USB core invokes for an interface of this class.
///
/// `comm` is the handle returned by [Msc::add_to_configuration]. All callbacks may run in
/// interrupt context and never block.
pub trait ClassDriver {
    /// The host activated configuration `config`
    fn connect(&self, config: u8, comm: CommHandle);

    /// Configuration `config` is no longer active (bus reset, disconnect or reconfiguration)
    fn disconnect(&self, config: u8, comm: CommHandle);

    /// Mass Storage has a single alternate setting
    fn alt_setting_update(&self, _config: u8, _comm: CommHandle, _alt_setting: u8) {}

    /// The halt condition of `ep` changed
    fn endpoint_state_update(&self, config: u8, comm: CommHandle, ep: EndpointAddress);

    /// Class specific control request addressed to the interface.
    ///
    /// Returns the number of bytes written into `data` for device-to-host requests.
    /// [UsbError::Unsupported] means the request must be stalled.
    fn class_request(
        &self,
        comm: CommHandle,
        req: &Request,
        data: &mut [u8],
    ) -> usb_device::Result<usize>;
}

/// Mass Storage class over Bulk Only Transport
///
/// # Type parameters
/// * `C` - the USB core
/// * `S` - OS signal, two per instance
/// * `INSTANCES` - class instance pool size
/// * `COMMS` - communication pool size, one per (instance, configuration) pair
pub struct Msc<'a, C, S, const INSTANCES: usize, const COMMS: usize> {
    core: C,
    config: MscConfig,
    instances: [ClassInstance<'a, S>; INSTANCES],
    comms: [Communication; COMMS],
    instance_count: AtomicU8,
    comm_count: AtomicU8,
}

impl<'a, C, S, const INSTANCES: usize, const COMMS: usize> Msc<'a, C, S, INSTANCES, COMMS>
where
    C: UsbCore,
    S: Signal + Default,
{
    pub fn new(core: C, config: MscConfig) -> Self {
        Msc {
            core,
            config,
            instances: core::array::from_fn(|_| ClassInstance::new(config.lun_quota)),
            comms: core::array::from_fn(|_| Communication::new()),
            instance_count: AtomicU8::new(0),
            comm_count: AtomicU8::new(0),
        }
    }
}

impl<'a, C, S, const INSTANCES: usize, const COMMS: usize> Msc<'a, C, S, INSTANCES, COMMS>
where
    C: UsbCore,
    S: Signal,
{
    pub fn core(&self) -> &C {
        &self.core
    }

    pub fn config(&self) -> &MscConfig {
        &self.config
    }

    /// Allocates a class instance for the given subclass (e.g. [SUBCLASS_SCSI])
    ///
    /// [SUBCLASS_SCSI]: crate::subclass::SUBCLASS_SCSI
    pub fn create_instance(&self, subclass: u8) -> Result<ClassHandle, MscError> {
        let index = allocate(&self.instance_count, INSTANCES)
            .ok_or(MscError::ResourceExhausted(Resource::ClassInstance))?;

        self.instances[index as usize]
            .subclass
            .store(subclass, Ordering::Relaxed);
        info!("usb: msc: Created instance {}", index);
        Ok(ClassHandle(index))
    }

    /// Adds a class instance to configuration `config`, using the given bulk endpoints.
    ///
    /// The returned handle is the interface argument for the USB core.
    pub fn add_to_configuration(
        &self,
        class: ClassHandle,
        config: u8,
        bulk_in: EndpointAddress,
        bulk_out: EndpointAddress,
    ) -> Result<CommHandle, MscError> {
        let instance = self.try_instance(class)?;
        if !bulk_in.is_in() || !bulk_out.is_out() {
            return Err(MscError::InvalidEndpoint);
        }

        let index = allocate(&self.comm_count, COMMS)
            .ok_or(MscError::ResourceExhausted(Resource::Communication))?;
        self.comms[index as usize].bind(class, config, bulk_in, bulk_out);

        let _ = instance.state.compare_exchange(
            ClassState::None as u8,
            ClassState::Init as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        info!(
            "usb: msc: Instance {} added to config {} as comm {}",
            class.0,
            config,
            index
        );
        Ok(CommHandle(index))
    }

    /// Interface class, subclass and protocol codes
    pub fn interface_codes(&self, class: ClassHandle) -> Result<(u8, u8, u8), MscError> {
        let instance = self.try_instance(class)?;
        Ok((
            CLASS_MASS_STORAGE,
            instance.subclass.load(Ordering::Relaxed),
            TRANSPORT_BBB,
        ))
    }

    pub fn register_lun(
        &self,
        class: ClassHandle,
        info: LunInfo<'a>,
        handler: &'a dyn LunHandler,
    ) -> Result<LunId, MscError> {
        self.try_instance(class)?.luns.register(info, handler)
    }

    /// Description a logical unit was registered with, for the command set's `INQUIRY` data
    pub fn lun_info(&self, class: ClassHandle, lun: LunId) -> Result<LunInfo<'a>, MscError> {
        self.try_instance(class)?
            .luns
            .info(lun)
            .ok_or(MscError::InvalidLun)
    }

    pub fn attach(&self, class: ClassHandle, lun: LunId, medium: &str) -> Result<(), MscError> {
        self.try_instance(class)?.luns.attach(lun, medium)
    }

    pub fn detach(&self, class: ClassHandle, lun: LunId) -> Result<(), MscError> {
        self.try_instance(class)?.luns.detach(lun)
    }

    pub fn is_attached(&self, class: ClassHandle, lun: LunId) -> bool {
        self.try_instance(class)
            .map(|instance| instance.luns.is_attached(lun))
            .unwrap_or(false)
    }

    /// Number of registered logical units
    pub fn max_lun(&self, class: ClassHandle) -> Result<u8, MscError> {
        Ok(self.try_instance(class)?.luns.max_lun())
    }

    /// The device is configured and the instance is bound to the active configuration
    pub fn is_enabled(&self, class: ClassHandle) -> bool {
        let Ok(instance) = self.try_instance(class) else {
            return false;
        };
        self.core.state() == UsbDeviceState::Configured
            && instance.state() == ClassState::Config
            && instance.comm.load(Ordering::Acquire) != NO_COMM
    }

    /// Transport state of a communication
    pub fn comm_state(&self, comm: CommHandle) -> Result<CommState, MscError> {
        Ok(self.try_comm(comm)?.state())
    }

    /// Creates the task side of an instance's transport.
    ///
    /// `buf` is the data stage buffer, at least one bulk packet long. There is a single task
    /// per instance.
    pub fn task<B: BorrowMut<[u8]>>(
        &self,
        class: ClassHandle,
        buf: B,
    ) -> Result<BulkOnly<'_, 'a, C, S, B, INSTANCES, COMMS>, MscError> {
        let instance = self.try_instance(class)?;
        if buf.borrow().len() < MIN_BUFFER_LEN {
            return Err(MscError::BufferTooSmall);
        }
        if instance.task_taken.swap(true, Ordering::AcqRel) {
            return Err(MscError::InvalidState);
        }
        Ok(BulkOnly::new(self, class, buf))
    }

    pub(crate) fn instance(&self, class: ClassHandle) -> &ClassInstance<'a, S> {
        &self.instances[class.0 as usize]
    }

    /// Communication bound to the active configuration of an instance
    pub(crate) fn bound_comm(&self, class: ClassHandle) -> Option<&Communication> {
        match self.instance(class).comm.load(Ordering::Acquire) {
            NO_COMM => None,
            index => self.comms.get(index as usize),
        }
    }

    fn try_instance(&self, class: ClassHandle) -> Result<&ClassInstance<'a, S>, MscError> {
        if class.0 < self.instance_count.load(Ordering::Acquire) {
            Ok(&self.instances[class.0 as usize])
        } else {
            Err(MscError::InvalidHandle)
        }
    }

    fn try_comm(&self, comm: CommHandle) -> Result<&Communication, MscError> {
        if comm.0 < self.comm_count.load(Ordering::Acquire) {
            Ok(&self.comms[comm.0 as usize])
        } else {
            Err(MscError::InvalidHandle)
        }
    }

    fn comm_and_instance(
        &self,
        comm: CommHandle,
    ) -> Option<(&Communication, &ClassInstance<'a, S>)> {
        let communication = self.try_comm(comm).ok()?;
        let class = communication.class()?;
        Some((communication, self.instance(class)))
    }
}

impl<C, S, const INSTANCES: usize, const COMMS: usize> ClassDriver
    for Msc<'_, C, S, INSTANCES, COMMS>
where
    C: UsbCore,
    S: Signal,
{
    fn connect(&self, config: u8, comm: CommHandle) {
        let Some((communication, instance)) = self.comm_and_instance(comm) else {
            error!("usb: msc: Connect with an unknown comm {}", comm.0);
            return;
        };

        critical_section::with(|_| {
            instance.comm.store(comm.0, Ordering::Release);
            instance.set_state(ClassState::Config);
            communication.set_state(CommState::Cbw);
        });

        instance.luns.enable_all();
        instance.connect.post();
        info!("usb: msc: Conn, config {}", config);
    }

    fn disconnect(&self, config: u8, comm: CommHandle) {
        let Some((communication, instance)) = self.comm_and_instance(comm) else {
            error!("usb: msc: Disconnect with an unknown comm {}", comm.0);
            return;
        };

        let waiting = critical_section::with(|_| {
            let prev = communication.set_state(CommState::None);
            // leave an instance bound to another configuration alone
            let _ = instance.comm.compare_exchange(
                comm.0,
                NO_COMM,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            instance.set_state(ClassState::Init);
            prev.is_waiting()
        });

        // wake the task blocked on a halt, it finds the communication unbound
        if waiting {
            instance.comm_signal.post();
        }

        instance.luns.disable_all();
        info!("usb: msc: Disconn, config {}", config);
    }

    fn endpoint_state_update(&self, _config: u8, comm: CommHandle, ep: EndpointAddress) {
        let Some((communication, instance)) = self.comm_and_instance(comm) else {
            error!("usb: msc: Update ep with an unknown comm {}", comm.0);
            return;
        };

        if communication.endpoint_state_update(&self.core, ep) {
            instance.comm_signal.post();
        }
    }

    fn class_request(
        &self,
        comm: CommHandle,
        req: &Request,
        data: &mut [u8],
    ) -> usb_device::Result<usize> {
        // not interested in this request
        if !(req.request_type == RequestType::Class && req.recipient == Recipient::Interface) {
            return Err(UsbError::Unsupported);
        }
        let (communication, instance) = self
            .comm_and_instance(comm)
            .ok_or(UsbError::InvalidState)?;

        debug!("usb: msc: Recv class request: {:#x}", req.request);

        match req.request {
            // USB BBB doc 3.1
            CLASS_SPECIFIC_BULK_ONLY_MASS_STORAGE_RESET
                if req.direction == UsbDirection::Out && req.value == 0 && req.length == 0 =>
            {
                let reset = communication.mass_storage_reset(&self.core);
                // no halt left to clear after a phase error
                if communication.recovery_complete(&self.core) {
                    instance.comm_signal.post();
                }
                reset.map_err(|_| UsbError::InvalidState)?;
                Ok(0)
            }
            // USB BBB doc 3.2
            CLASS_SPECIFIC_GET_MAX_LUN
                if req.direction == UsbDirection::In && req.value == 0 && req.length == 1 =>
            {
                let count = instance.luns.max_lun();
                if count == 0 || instance.state() != ClassState::Config {
                    warn!("usb: msc: Get Max LUN while not ready");
                    return Err(UsbError::InvalidState);
                }
                let max_lun = data.first_mut().ok_or(UsbError::BufferOverflow)?;
                *max_lun = count - 1;
                info!("usb: msc: Get Max LUN: {}", count - 1);
                Ok(1)
            }
            _ => {
                warn!("usb: msc: Unsupported class request: {:#x}", req.request);
                Err(UsbError::Unsupported)
            }
        }
    }
}

/// Takes the next slot of a pool of `size` entries
fn allocate(count: &AtomicU8, size: usize) -> Option<u8> {
    let limit = size.min(u8::MAX as usize) as u8;
    count
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            (n < limit).then_some(n + 1)
        })
        .ok()
}
