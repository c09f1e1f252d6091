//! Logical unit registry of a class instance

use crate::class::{MscError, Resource};
use crate::subclass::{CommandError, DataPhase, LunHandler, LunId, LunInfo, MAX_LUNS};
use core::cell::Cell;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use critical_section::Mutex;

#[derive(Copy, Clone)]
struct Binding<'a> {
    info: LunInfo<'a>,
    handler: &'a dyn LunHandler,
}

struct LogicalUnit<'a> {
    binding: Mutex<Cell<Option<Binding<'a>>>>,
    attached: AtomicBool,
}

impl LogicalUnit<'_> {
    fn new() -> Self {
        LogicalUnit {
            binding: Mutex::new(Cell::new(None)),
            attached: AtomicBool::new(false),
        }
    }
}

/// Maps `bCBWLUN` to a [LunHandler].
///
/// Units are registered once, in order, and never removed. Media can be attached and detached
/// at any time, including while the transport is in the middle of a command.
pub struct LunRegistry<'a> {
    quota: u8,
    count: AtomicU8,
    units: [LogicalUnit<'a>; MAX_LUNS],
}

impl<'a> LunRegistry<'a> {
    /// Creates an empty registry accepting at most `quota` units (clamped to 1..=16)
    pub fn new(quota: u8) -> Self {
        LunRegistry {
            quota: quota.clamp(1, MAX_LUNS as u8),
            count: AtomicU8::new(0),
            units: core::array::from_fn(|_| LogicalUnit::new()),
        }
    }

    pub fn register(
        &self,
        info: LunInfo<'a>,
        handler: &'a dyn LunHandler,
    ) -> Result<LunId, MscError> {
        if !info.is_valid() {
            return Err(MscError::InvalidLun);
        }

        let lun = critical_section::with(|cs| {
            let count = self.count.load(Ordering::Acquire);
            if count >= self.quota {
                return Err(MscError::ResourceExhausted(Resource::Lun));
            }
            self.units[count as usize]
                .binding
                .borrow(cs)
                .set(Some(Binding { info, handler }));
            self.count.store(count + 1, Ordering::Release);
            Ok(LunId(count))
        })?;

        info!("usb: msc: Registered LUN {}: {}", lun.0, info.product_id);
        Ok(lun)
    }

    /// Number of registered units
    pub fn max_lun(&self) -> u8 {
        self.count.load(Ordering::Acquire)
    }

    pub fn info(&self, lun: LunId) -> Option<LunInfo<'a>> {
        self.binding(lun.0).map(|binding| binding.info)
    }

    /// Opens `medium` and makes the unit available to the host
    pub fn attach(&self, lun: LunId, medium: &str) -> Result<(), MscError> {
        let binding = self.binding(lun.0).ok_or(MscError::InvalidLun)?;
        let unit = &self.units[lun.0 as usize];

        if unit.attached.load(Ordering::Acquire) {
            return Err(MscError::InvalidState);
        }
        binding
            .handler
            .open(lun, medium)
            .map_err(MscError::Medium)?;
        unit.attached.store(true, Ordering::Release);

        info!("usb: msc: Attached LUN {} to {}", lun.0, medium);
        Ok(())
    }

    /// Makes the unit unavailable to the host and closes its medium.
    ///
    /// Detaching a detached unit does nothing.
    pub fn detach(&self, lun: LunId) -> Result<(), MscError> {
        let binding = self.binding(lun.0).ok_or(MscError::InvalidLun)?;

        if !self.units[lun.0 as usize]
            .attached
            .swap(false, Ordering::AcqRel)
        {
            return Ok(());
        }

        info!("usb: msc: Detached LUN {}", lun.0);
        binding.handler.close(lun).map_err(MscError::Medium)
    }

    pub fn is_attached(&self, lun: LunId) -> bool {
        self.binding(lun.0).is_some()
            && self.units[lun.0 as usize]
                .attached
                .load(Ordering::Acquire)
    }

    /// Runs a command block on an attached unit
    pub fn dispatch(&self, lun: u8, cb: &[u8], buf: &mut [u8]) -> Result<DataPhase, CommandError> {
        let handler = self.attached_handler(lun)?;
        let phase = handler.process_command(LunId(lun), cb, buf)?;

        // detached while the command was running
        self.attached_handler(lun)?;
        Ok(phase)
    }

    pub(crate) fn read_data(
        &self,
        lun: u8,
        opcode: u8,
        buf: &mut [u8],
    ) -> Result<(), CommandError> {
        self.attached_handler(lun)?
            .read_data(LunId(lun), opcode, buf)
    }

    pub(crate) fn write_data(&self, lun: u8, opcode: u8, buf: &[u8]) -> Result<(), CommandError> {
        self.attached_handler(lun)?
            .write_data(LunId(lun), opcode, buf)
    }

    pub(crate) fn enable_all(&self) {
        for lun in 0..self.max_lun() {
            if let Some(binding) = self.binding(lun) {
                binding.handler.enable(LunId(lun));
            }
        }
    }

    pub(crate) fn disable_all(&self) {
        for lun in 0..self.max_lun() {
            if let Some(binding) = self.binding(lun) {
                binding.handler.disable(LunId(lun));
            }
        }
    }

    fn binding(&self, lun: u8) -> Option<Binding<'a>> {
        if lun >= self.max_lun() {
            return None;
        }
        critical_section::with(|cs| self.units[lun as usize].binding.borrow(cs).get())
    }

    fn attached_handler(&self, lun: u8) -> Result<&'a dyn LunHandler, CommandError> {
        match self.binding(lun) {
            Some(binding) if self.units[lun as usize].attached.load(Ordering::Acquire) => {
                Ok(binding.handler)
            }
            _ => {
                warn!("usb: msc: LUN {} not present", lun);
                Err(CommandError::NotPresent)
            }
        }
    }
}
