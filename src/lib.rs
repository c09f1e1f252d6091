//! USB Mass Storage Bulk-Only Transport engine for blocking USB device stacks
//!
//! The crate implements the device side of the [Bulk Only] transport: receiving CBWs,
//! reconciling what the host asked for with what the device is going to do, moving the data
//! stage, sending CSWs and recovering from protocol faults through endpoint halts and Reset
//! Recovery.
//!
//! It doesn't own a USB peripheral. The device stack is described by [UsbCore] and calls back
//! into the class through [ClassDriver]. Command blocks are interpreted by a [LunHandler] per
//! logical unit (SCSI, UFI or vendor specific).
//!
//! # Usage
//! 1. Create an [Msc] with a [UsbCore], then a class instance and add it to a configuration.
//! 2. Register and attach logical units.
//! 3. Run [BulkOnly::run] from [Msc::task] in a dedicated task per class instance.
//!
//! # Features
//! | Feature | Description                           |
//! | ------- |---------------------------------------|
//! | `defmt` | Enable logging via [defmt](https://crates.io/crates/defmt) crate |
//! | `log` | Enable logging via [log](https://crates.io/crates/log) crate |
//!
//! [Bulk Only]: crate::transport::bbb
//! [UsbCore]: crate::transport::UsbCore
//! [ClassDriver]: crate::class::ClassDriver
//! [LunHandler]: crate::subclass::LunHandler
//! [Msc]: crate::class::Msc
//! [Msc::task]: crate::class::Msc::task
//! [BulkOnly::run]: crate::transport::bbb::BulkOnly::run

#![no_std]

// must come first, the logging macros are textually scoped
#[macro_use]
mod fmt;

pub mod class;
pub mod subclass;
pub mod transport;

/// USB Mass Storage Class code
pub const CLASS_MASS_STORAGE: u8 = 0x08;
