//! Bulk Only Transport (BBB/BOT)
//!
//! A [Communication] holds the transport state of one configuration binding. It is shared
//! between the task running [BulkOnly] and the USB core's callbacks, so every field is either
//! atomic or guarded by a critical section. The state itself is a single [CommState] value
//! which only changes through [Communication::set_state] and [Communication::advance].

use crate::class::{ClassHandle, Msc};
use crate::transport::reconcile::reconcile;
use crate::transport::wrapper::{
    CommandBlockWrapper, CommandStatusWrapper, InvalidCbw, CBW_LEN,
};
use crate::transport::{
    CommandStatus, DataDirection, FaultClass, Signal, TransportError, UsbCore,
};
use core::borrow::BorrowMut;
use core::cell::Cell;
use core::cmp::min;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use critical_section::Mutex;
use num_enum::TryFromPrimitive;
use usb_device::endpoint::EndpointAddress;

/// Smallest data buffer accepted by [Msc::task]. One full speed bulk packet
pub const MIN_BUFFER_LEN: usize = 64;

pub(crate) const NO_CLASS: u8 = u8::MAX;

/// Transport state of a [Communication]
#[repr(u8)]
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommState {
    /// Not bound to an active configuration
    #[default]
    None = 0,
    /// Waiting for a CBW
    Cbw,
    /// Running a command and moving its data
    Data,
    /// Sending the CSW
    Csw,
    /// Waiting for the host to clear the bulk IN halt
    BulkInStall,
    /// Waiting for the host to clear the bulk OUT halt
    BulkOutStall,
    /// Waiting for the host to clear both halts
    ResetRecovery,
    ResetRecoveryBulkInStall,
    /// Both endpoints halted, waiting for a Mass Storage Reset
    ResetRecoveryBulkOutStall,
}

impl CommState {
    /// The task is blocked on the communication signal in this state
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            CommState::BulkInStall
                | CommState::BulkOutStall
                | CommState::ResetRecovery
                | CommState::ResetRecoveryBulkInStall
                | CommState::ResetRecoveryBulkOutStall
        )
    }
}

struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        StateCell(AtomicU8::new(CommState::None as u8))
    }

    fn get(&self) -> CommState {
        // only valid discriminants are ever stored
        CommState::try_from_primitive(self.0.load(Ordering::Acquire)).unwrap_or_default()
    }

    fn swap(&self, state: CommState) -> CommState {
        CommState::try_from_primitive(self.0.swap(state as u8, Ordering::AcqRel))
            .unwrap_or_default()
    }

    fn compare_exchange(&self, from: CommState, to: CommState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// One configuration binding of a class instance
pub struct Communication {
    class: AtomicU8,
    config: AtomicU8,
    bulk_in: AtomicU8,
    bulk_out: AtomicU8,
    state: StateCell,
    stall: AtomicBool,
    /// Set on entering Reset Recovery, cleared by the Mass Storage Reset
    reset_pending: AtomicBool,
    bytes_to_xfer: AtomicU32,
    cbw: Mutex<Cell<CommandBlockWrapper>>,
    csw: Mutex<Cell<CommandStatusWrapper>>,
}

impl Communication {
    pub(crate) fn new() -> Self {
        Communication {
            class: AtomicU8::new(NO_CLASS),
            config: AtomicU8::new(0),
            bulk_in: AtomicU8::new(0),
            bulk_out: AtomicU8::new(0),
            state: StateCell::new(),
            stall: AtomicBool::new(false),
            reset_pending: AtomicBool::new(false),
            bytes_to_xfer: AtomicU32::new(0),
            cbw: Mutex::new(Cell::new(Default::default())),
            csw: Mutex::new(Cell::new(Default::default())),
        }
    }

    pub(crate) fn bind(
        &self,
        class: ClassHandle,
        config: u8,
        bulk_in: EndpointAddress,
        bulk_out: EndpointAddress,
    ) {
        self.config.store(config, Ordering::Relaxed);
        self.bulk_in.store(bulk_in.into(), Ordering::Relaxed);
        self.bulk_out.store(bulk_out.into(), Ordering::Relaxed);
        self.class.store(class.index(), Ordering::Release);
    }

    /// Owning class instance
    pub(crate) fn class(&self) -> Option<ClassHandle> {
        match self.class.load(Ordering::Acquire) {
            NO_CLASS => None,
            index => Some(ClassHandle(index)),
        }
    }

    pub fn config(&self) -> u8 {
        self.config.load(Ordering::Relaxed)
    }

    pub fn bulk_in(&self) -> EndpointAddress {
        EndpointAddress::from(self.bulk_in.load(Ordering::Relaxed))
    }

    pub fn bulk_out(&self) -> EndpointAddress {
        EndpointAddress::from(self.bulk_out.load(Ordering::Relaxed))
    }

    pub fn state(&self) -> CommState {
        self.state.get()
    }

    /// Forces a new state, returning the previous one.
    ///
    /// Used on configuration changes, which also drop a pending Reset Recovery. The task moves
    /// through [Communication::advance].
    pub(crate) fn set_state(&self, state: CommState) -> CommState {
        self.reset_pending.store(false, Ordering::Release);
        let prev = self.state.swap(state);
        if prev != state {
            info!("usb: bbb: Enter state: {:?} -> {:?}", prev, state);
        }
        prev
    }

    /// Moves from `from` to `to` unless someone else changed the state meanwhile
    pub(crate) fn advance(&self, from: CommState, to: CommState) -> bool {
        let done = self.state.compare_exchange(from, to);
        if done {
            info!("usb: bbb: Enter state: {:?} -> {:?}", from, to);
        } else {
            debug!(
                "usb: bbb: State changed under the task: {:?} (expected {:?})",
                self.state(),
                from
            );
        }
        done
    }

    pub fn cbw(&self) -> CommandBlockWrapper {
        critical_section::with(|cs| self.cbw.borrow(cs).get())
    }

    pub fn csw(&self) -> CommandStatusWrapper {
        critical_section::with(|cs| self.csw.borrow(cs).get())
    }

    fn set_cbw(&self, cbw: CommandBlockWrapper) {
        critical_section::with(|cs| self.cbw.borrow(cs).set(cbw));
    }

    fn update_csw<F: FnOnce(&mut CommandStatusWrapper)>(&self, f: F) {
        critical_section::with(|cs| {
            let cell = self.csw.borrow(cs);
            let mut csw = cell.get();
            f(&mut csw);
            cell.set(csw);
        });
    }

    /// Halts both endpoints, starting the Reset Recovery handshake
    fn enter_reset_recovery<C: UsbCore>(&self, core: &C, from: CommState) {
        error!("usb: bbb: Reset Recovery, stall IN/OUT");
        self.reset_pending.store(true, Ordering::Release);
        if !self.advance(from, CommState::ResetRecoveryBulkInStall) {
            return;
        }
        self.stall_in(core);
        if self.advance(
            CommState::ResetRecoveryBulkInStall,
            CommState::ResetRecoveryBulkOutStall,
        ) {
            self.stall_out(core);
        }
    }

    fn stall_in<C: UsbCore>(&self, core: &C) {
        info!("usb: bbb: Stall IN ep");
        core.stall(self.bulk_in(), true);
    }

    fn stall_out<C: UsbCore>(&self, core: &C) {
        info!("usb: bbb: Stall OUT ep");
        core.stall(self.bulk_out(), true);
    }

    /// Reacts to a halt change of `ep`. Returns `true` if the task has to be signalled.
    ///
    /// Until the host sends a Mass Storage Reset, any halt it clears during Reset Recovery is
    /// set again.
    pub(crate) fn endpoint_state_update<C: UsbCore>(&self, core: &C, ep: EndpointAddress) -> bool {
        let (bulk_in, bulk_out) = (self.bulk_in(), self.bulk_out());

        match self.state() {
            state @ (CommState::BulkInStall | CommState::BulkOutStall) => {
                let expected = if state == CommState::BulkInStall {
                    bulk_in
                } else {
                    bulk_out
                };
                if ep != expected {
                    error!("usb: bbb: Update ep in {:?}: invalid endpoint", state);
                    false
                } else if core.is_stalled(ep) {
                    debug!("usb: bbb: Update ep in {:?}: still stalled", state);
                    false
                } else {
                    debug!("usb: bbb: Update ep in {:?}: cleared", state);
                    true
                }
            }
            CommState::Cbw | CommState::Data | CommState::Csw => {
                trace!("usb: bbb: Update ep: skip");
                false
            }
            state @ (CommState::ResetRecoveryBulkInStall
            | CommState::ResetRecoveryBulkOutStall) => {
                if ep != bulk_in && ep != bulk_out {
                    error!("usb: bbb: Update ep in {:?}: invalid endpoint", state);
                } else if !core.is_stalled(ep) {
                    warn!("usb: bbb: Halt cleared before Mass Storage Reset, stall again");
                    core.stall(ep, true);
                }
                false
            }
            CommState::ResetRecovery => self.recovery_complete(core),
            CommState::None => {
                debug!("usb: bbb: Update ep while unbound, clear stall IN/OUT");
                core.stall(bulk_in, false);
                core.stall(bulk_out, false);
                false
            }
        }
    }

    /// The host sent the Mass Storage Reset and cleared both halts
    pub(crate) fn recovery_complete<C: UsbCore>(&self, core: &C) -> bool {
        let done = self.state() == CommState::ResetRecovery
            && !self.reset_pending.load(Ordering::Acquire)
            && !core.is_stalled(self.bulk_in())
            && !core.is_stalled(self.bulk_out());
        if done {
            debug!("usb: bbb: Reset Recovery complete");
        }
        done
    }

    /// Bulk-Only Mass Storage Reset. Data toggles and halts are preserved
    pub(crate) fn mass_storage_reset<C: UsbCore>(&self, core: &C) -> Result<(), TransportError> {
        info!("usb: bbb: Recv reset");
        let in_res = core.abort(self.bulk_in());
        let out_res = core.abort(self.bulk_out());
        if let Err(err) = in_res {
            error!("usb: bbb: Abort IN ep failed: {:?}", err);
        }
        if let Err(err) = out_res {
            error!("usb: bbb: Abort OUT ep failed: {:?}", err);
        }

        // first step of the Reset Recovery handshake
        self.reset_pending.store(false, Ordering::Release);
        if let state @ (CommState::ResetRecoveryBulkInStall | CommState::ResetRecoveryBulkOutStall) =
            self.state()
        {
            self.advance(state, CommState::ResetRecovery);
        }

        in_res.and(out_res)
    }
}

/// Task side of the Bulk Only Transport of a class instance.
///
/// Created by [Msc::task]. Every [step] handles one transport state, blocking on exactly one
/// bulk transfer or one signal.
///
/// [step]: crate::transport::bbb::BulkOnly::step
pub struct BulkOnly<'m, 'a, C, S, B, const INSTANCES: usize, const COMMS: usize>
where
    C: UsbCore,
    S: Signal,
    B: BorrowMut<[u8]>,
{
    msc: &'m Msc<'a, C, S, INSTANCES, COMMS>,
    class: ClassHandle,
    buf: B,
    cbw_buf: [u8; CBW_LEN],
    rx_retries: u8,
}

impl<'m, 'a, C, S, B, const INSTANCES: usize, const COMMS: usize>
    BulkOnly<'m, 'a, C, S, B, INSTANCES, COMMS>
where
    C: UsbCore,
    S: Signal,
    B: BorrowMut<[u8]>,
{
    pub(crate) fn new(
        msc: &'m Msc<'a, C, S, INSTANCES, COMMS>,
        class: ClassHandle,
        buf: B,
    ) -> Self {
        BulkOnly {
            msc,
            class,
            buf,
            cbw_buf: [0u8; CBW_LEN],
            rx_retries: 0,
        }
    }

    pub fn class(&self) -> ClassHandle {
        self.class
    }

    /// Drives the transport forever
    pub fn run(&mut self) -> ! {
        loop {
            self.step();
        }
    }

    /// Handles the current transport state once.
    ///
    /// Blocks until the instance is connected, then performs the handler of the current state.
    pub fn step(&mut self) {
        if !self.msc.is_enabled(self.class) {
            self.msc.instance(self.class).connect.pend();
        }

        let Some(comm) = self.msc.bound_comm(self.class) else {
            return;
        };

        match comm.state() {
            CommState::Cbw => self.read_cbw(comm),
            CommState::Data => self.process_command(comm),
            CommState::Csw => self.write_csw(comm),
            state @ (CommState::BulkInStall | CommState::BulkOutStall) => {
                self.wait_for_clear(comm, state)
            }
            state @ (CommState::ResetRecovery
            | CommState::ResetRecoveryBulkInStall
            | CommState::ResetRecoveryBulkOutStall) => self.wait_for_recovery(comm, state),
            CommState::None => {}
        }
    }

    fn timeout(&self) -> u32 {
        self.msc.config().bulk_timeout_ms
    }

    fn read_cbw(&mut self, comm: &Communication) {
        let msc = self.msc;
        let core = msc.core();

        let timeout = self.timeout();

        let len = match core.bulk_rx(comm.bulk_out(), &mut self.cbw_buf, timeout) {
            Ok(len) => len,
            Err(err) => {
                self.cbw_rx_failed(comm, err);
                return;
            }
        };
        self.rx_retries = 0;
        trace!("usb: bbb: Recv CBW with len={}", len);

        if len != CBW_LEN {
            warn!("usb: bbb: Invalid CBW: {:?}", InvalidCbw::Length(len));
            comm.enter_reset_recovery(core, CommState::Cbw);
            return;
        }

        let cbw = CommandBlockWrapper::from_le_bytes(&self.cbw_buf);
        let max_lun = msc.instance(self.class).luns.max_lun();
        if let Err(err) = cbw.validate(max_lun) {
            warn!("usb: bbb: Invalid CBW: {:?}", err);
            comm.enter_reset_recovery(core, CommState::Cbw);
            return;
        }

        debug!("usb: bbb: Recv CBW: {:?}", cbw);
        comm.set_cbw(cbw);
        comm.update_csw(|csw| {
            *csw = CommandStatusWrapper::new(cbw.tag, cbw.data_transfer_len, CommandStatus::Passed)
        });
        comm.bytes_to_xfer.store(0, Ordering::Relaxed);
        comm.stall.store(false, Ordering::Relaxed);
        comm.advance(CommState::Cbw, CommState::Data);
    }

    fn cbw_rx_failed(&mut self, comm: &Communication, err: TransportError) {
        let msc = self.msc;
        let core = msc.core();

        match err.class() {
            // idle host
            FaultClass::Transient if err == TransportError::Timeout => {
                trace!("usb: bbb: Recv CBW timeout");
            }
            FaultClass::Transient => {
                self.rx_retries = self.rx_retries.saturating_add(1);
                warn!(
                    "usb: bbb: Recv CBW failed: {:?}, attempt {}",
                    err,
                    self.rx_retries
                );
                if let Some(limit) = msc.config().cbw_retry_limit {
                    if self.rx_retries > limit {
                        self.rx_retries = 0;
                        comm.enter_reset_recovery(core, CommState::Cbw);
                    }
                }
            }
            FaultClass::Desync => {
                warn!("usb: bbb: Recv CBW failed: {:?}", err);
                self.rx_retries = 0;
                comm.enter_reset_recovery(core, CommState::Cbw);
            }
            FaultClass::Other => {
                error!("usb: bbb: Recv CBW failed: {:?}", err);
                self.rx_retries = 0;
                if comm.advance(CommState::Cbw, CommState::BulkOutStall) {
                    comm.stall_out(core);
                }
            }
        }
    }

    fn process_command(&mut self, comm: &Communication) {
        let luns = &self.msc.instance(self.class).luns;
        let cbw = comm.cbw();
        let host_dir = cbw.direction();
        let block_len = min(cbw.block_len as usize, cbw.block.len());

        let phase = match luns.dispatch(cbw.lun, &cbw.block[..block_len], self.buf.borrow_mut()) {
            Ok(phase) => phase,
            Err(err) => {
                warn!("usb: bbb: Command {:#x} failed: {:?}", cbw.opcode(), err);
                comm.update_csw(|csw| csw.status = CommandStatus::Failed);
                self.finish_data_stage(comm, host_dir, host_dir != DataDirection::NotExpected);
                return;
            }
        };

        let outcome = reconcile(
            cbw.data_transfer_len,
            host_dir,
            phase.len,
            phase.direction,
        );
        debug!("usb: bbb: Data stage: {:?}", outcome);

        comm.update_csw(|csw| csw.status = outcome.status);
        comm.bytes_to_xfer
            .store(outcome.transfer_len, Ordering::Relaxed);
        comm.stall.store(
            outcome.stall_in || outcome.stall_out || outcome.direction_mismatch(),
            Ordering::Relaxed,
        );

        if outcome.transfer_len > 0 {
            match host_dir {
                DataDirection::In => self.write_to_host(comm),
                DataDirection::Out => {
                    if !self.read_from_host(comm) {
                        return;
                    }
                }
                DataDirection::NotExpected => {}
            }
        }

        let stall = comm.stall.swap(false, Ordering::Relaxed);
        self.finish_data_stage(comm, host_dir, stall);
    }

    /// Leaves the data stage, halting the pipe the host uses if `stall`
    fn finish_data_stage(&self, comm: &Communication, host_dir: DataDirection, stall: bool) {
        let core = self.msc.core();

        match host_dir {
            DataDirection::In if stall => {
                if comm.advance(CommState::Data, CommState::BulkInStall) {
                    comm.stall_in(core);
                }
            }
            DataDirection::Out if stall => {
                if comm.advance(CommState::Data, CommState::BulkOutStall) {
                    comm.stall_out(core);
                }
            }
            _ => {
                comm.advance(CommState::Data, CommState::Csw);
            }
        }
    }

    fn write_to_host(&mut self, comm: &Communication) {
        let msc = self.msc;
        let core = msc.core();
        let luns = &msc.instance(self.class).luns;
        let cbw = comm.cbw();
        let timeout = self.timeout();
        let buf = self.buf.borrow_mut();

        loop {
            let remaining = comm.bytes_to_xfer.load(Ordering::Relaxed);
            if remaining == 0 {
                break;
            }
            let chunk = min(remaining as usize, buf.len());

            if let Err(err) = luns.read_data(cbw.lun, cbw.opcode(), &mut buf[..chunk]) {
                warn!("usb: bbb: Read from device failed: {:?}", err);
                fail_command(comm);
                break;
            }

            let sent = match core.bulk_tx(comm.bulk_in(), &buf[..chunk], timeout) {
                Ok(sent) => min(sent, chunk),
                Err(err) => {
                    warn!("usb: bbb: Send data failed: {:?}", err);
                    comm.stall.store(true, Ordering::Relaxed);
                    break;
                }
            };
            moved(comm, sent as u32);

            if sent < chunk {
                comm.stall.store(true, Ordering::Relaxed);
                break;
            }
        }
    }

    /// Returns `false` if the transfer failed and the state has already been changed
    fn read_from_host(&mut self, comm: &Communication) -> bool {
        let msc = self.msc;
        let core = msc.core();
        let luns = &msc.instance(self.class).luns;
        let cbw = comm.cbw();
        let timeout = self.timeout();
        let buf = self.buf.borrow_mut();
        let mut failed = false;

        loop {
            let remaining = comm.bytes_to_xfer.load(Ordering::Relaxed);
            if remaining == 0 {
                break;
            }
            let chunk = min(remaining as usize, buf.len());

            let received = match core.bulk_rx(comm.bulk_out(), &mut buf[..chunk], timeout) {
                Ok(received) => min(received, chunk),
                Err(err) => {
                    error!("usb: bbb: Recv data failed: {:?}, stall OUT", err);
                    if comm.advance(CommState::Data, CommState::BulkOutStall) {
                        comm.stall_out(core);
                    }
                    return false;
                }
            };

            // keep draining the host after a failure
            if !failed {
                if let Err(err) = luns.write_data(cbw.lun, cbw.opcode(), &buf[..received]) {
                    warn!("usb: bbb: Write to device failed: {:?}", err);
                    fail_command(comm);
                    failed = true;
                }
            }
            moved(comm, received as u32);

            if received < chunk {
                debug!("usb: bbb: Short packet, data stage ended by host");
                break;
            }
        }
        true
    }

    fn write_csw(&mut self, comm: &Communication) {
        let core = self.msc.core();
        let csw = comm.csw();
        debug!("usb: bbb: Send CSW: {:?}", csw);

        // the host may send the reset as soon as it sees the CSW
        if csw.status == CommandStatus::PhaseError {
            comm.reset_pending.store(true, Ordering::Release);
        }

        match core.bulk_tx(comm.bulk_in(), &csw.to_le_bytes(), self.timeout()) {
            Err(err) => {
                error!("usb: bbb: Send CSW failed: {:?}", err);
                comm.enter_reset_recovery(core, CommState::Csw);
            }
            Ok(_) if csw.status == CommandStatus::PhaseError => {
                comm.advance(CommState::Csw, CommState::ResetRecovery);
            }
            Ok(_) => {
                comm.advance(CommState::Csw, CommState::Cbw);
            }
        }
    }

    fn wait_for_clear(&mut self, comm: &Communication, state: CommState) {
        let ep = if state == CommState::BulkInStall {
            comm.bulk_in()
        } else {
            comm.bulk_out()
        };
        self.msc.instance(self.class).comm_signal.pend();

        // torn down or a stale signal
        if comm.state() == state && !self.msc.core().is_stalled(ep) {
            comm.advance(state, CommState::Csw);
        }
    }

    fn wait_for_recovery(&mut self, comm: &Communication, state: CommState) {
        self.msc.instance(self.class).comm_signal.pend();

        // stale posts leave the task waiting for the host handshake
        if comm.recovery_complete(self.msc.core()) {
            comm.advance(CommState::ResetRecovery, CommState::Cbw);
        } else {
            trace!("usb: bbb: Woken in {:?}, keep waiting", state);
        }
    }
}

fn fail_command(comm: &Communication) {
    comm.update_csw(|csw| csw.status = CommandStatus::Failed);
    comm.stall.store(true, Ordering::Relaxed);
}

/// Accounts for `count` bytes moved during the data stage
fn moved(comm: &Communication, count: u32) {
    let remaining = comm.bytes_to_xfer.load(Ordering::Relaxed);
    comm.bytes_to_xfer
        .store(remaining.saturating_sub(count), Ordering::Relaxed);
    comm.update_csw(|csw| csw.data_residue = csw.data_residue.saturating_sub(count));
    trace!("usb: bbb: Data residue: {}", comm.csw().data_residue);
}
