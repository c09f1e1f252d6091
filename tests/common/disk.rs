use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use usbd_msc::subclass::{CommandError, DataPhase, LunHandler, LunId, LunInfo};

pub const BLOCK_SIZE: usize = 512;

/* SCSI codes */
pub const TEST_UNIT_READY: u8 = 0x00;
pub const INQUIRY: u8 = 0x12;
pub const READ_10: u8 = 0x28;
pub const WRITE_10: u8 = 0x2A;

pub const INFO: LunInfo<'static> = LunInfo {
    vendor_id: "usbd-msc",
    product_id: "RAM disk",
    revision: 0x0001,
    read_only: false,
};

pub fn test_unit_ready() -> Vec<u8> {
    vec![TEST_UNIT_READY, 0, 0, 0, 0, 0]
}

pub fn inquiry(alloc_len: u8) -> Vec<u8> {
    vec![INQUIRY, 0, 0, 0, alloc_len, 0]
}

pub fn read_10(lba: u32, len: u16) -> Vec<u8> {
    rw_10(READ_10, lba, len)
}

pub fn write_10(lba: u32, len: u16) -> Vec<u8> {
    rw_10(WRITE_10, lba, len)
}

fn rw_10(opcode: u8, lba: u32, len: u16) -> Vec<u8> {
    let mut block = vec![opcode, 0];
    block.extend_from_slice(lba.to_be_bytes().as_slice());
    block.push(0);
    block.extend_from_slice(len.to_be_bytes().as_slice());
    block.push(0);
    block
}

type Hook = Box<dyn FnOnce() + Send>;

/// Minimal SCSI block device over a byte vector
pub struct RamDisk {
    blocks: Mutex<Vec<u8>>,
    /// Byte offset of the next data stage chunk
    cursor: AtomicUsize,
    /// Replaces the outcome of the next command
    script: Mutex<Option<Result<DataPhase, CommandError>>>,
    /// Runs once, on the next `read_data`
    read_hook: Mutex<Option<Hook>>,
    pub commands: AtomicUsize,
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub enabled: AtomicUsize,
    pub disabled: AtomicUsize,
}

impl RamDisk {
    /// Disk of `count` blocks filled with a counting pattern
    pub fn new(count: usize) -> Self {
        let blocks = (0..count * BLOCK_SIZE).map(|i| (i % 251) as u8).collect();
        Self {
            blocks: Mutex::new(blocks),
            cursor: AtomicUsize::new(0),
            script: Mutex::new(None),
            read_hook: Mutex::new(None),
            commands: AtomicUsize::new(0),
            opened: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
            enabled: AtomicUsize::new(0),
            disabled: AtomicUsize::new(0),
        }
    }

    pub fn block(&self, lba: usize) -> Vec<u8> {
        self.blocks.lock().unwrap()[lba * BLOCK_SIZE..(lba + 1) * BLOCK_SIZE].to_vec()
    }

    pub fn respond_next(&self, outcome: Result<DataPhase, CommandError>) {
        *self.script.lock().unwrap() = Some(outcome);
    }

    pub fn on_next_read<F: FnOnce() + Send + 'static>(&self, f: F) {
        *self.read_hook.lock().unwrap() = Some(Box::new(f));
    }

    fn seek(&self, cb: &[u8]) -> u32 {
        let lba = u32::from_be_bytes(cb[2..6].try_into().unwrap());
        let len = u16::from_be_bytes(cb[7..9].try_into().unwrap());
        self.cursor
            .store(lba as usize * BLOCK_SIZE, Ordering::SeqCst);
        len as u32 * BLOCK_SIZE as u32
    }
}

impl LunHandler for RamDisk {
    fn process_command(
        &self,
        _lun: LunId,
        cb: &[u8],
        _buf: &mut [u8],
    ) -> Result<DataPhase, CommandError> {
        self.commands.fetch_add(1, Ordering::SeqCst);
        if let Some(outcome) = self.script.lock().unwrap().take() {
            self.cursor.store(0, Ordering::SeqCst);
            return outcome;
        }

        match cb[0] {
            TEST_UNIT_READY => Ok(DataPhase::none()),
            INQUIRY => {
                self.cursor.store(0, Ordering::SeqCst);
                Ok(DataPhase::to_host(cb[4].min(36) as u32))
            }
            READ_10 => Ok(DataPhase::to_host(self.seek(cb))),
            WRITE_10 => Ok(DataPhase::from_host(self.seek(cb))),
            _ => Err(CommandError::Failed),
        }
    }

    fn read_data(&self, _lun: LunId, _opcode: u8, buf: &mut [u8]) -> Result<(), CommandError> {
        let hook = self.read_hook.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }

        let offset = self.cursor.fetch_add(buf.len(), Ordering::SeqCst);
        let blocks = self.blocks.lock().unwrap();
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = blocks.get(offset + i).copied().unwrap_or(0);
        }
        Ok(())
    }

    fn write_data(&self, _lun: LunId, _opcode: u8, buf: &[u8]) -> Result<(), CommandError> {
        let offset = self.cursor.fetch_add(buf.len(), Ordering::SeqCst);
        let mut blocks = self.blocks.lock().unwrap();
        let dst = blocks
            .get_mut(offset..offset + buf.len())
            .ok_or(CommandError::Failed)?;
        dst.copy_from_slice(buf);
        Ok(())
    }

    fn open(&self, _lun: LunId, _medium: &str) -> Result<(), CommandError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self, _lun: LunId) -> Result<(), CommandError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn enable(&self, _lun: LunId) {
        self.enabled.fetch_add(1, Ordering::SeqCst);
    }

    fn disable(&self, _lun: LunId) {
        self.disabled.fetch_add(1, Ordering::SeqCst);
    }
}
