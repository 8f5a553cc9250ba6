#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
//!
//! Firmware update engine of a USB DFU bootloader for a `usb-device`
//! device.
//!
//! ## About
//!
//! A DFU-mode bootloader is the small program that runs when there is
//! no (or a broken) application image in flash, or when the application
//! asked for an update. It enumerates as a DFU 1.1 device and lets a
//! host tool download a new firmware image, read the current one back,
//! erase flash, and reset the system.
//!
//! This crate implements the whole device side of that mode on top of
//! the raw [`usb_device::bus::UsbBus`] hardware trait:
//!
//! * the endpoint zero control transfer engine, including the standard
//!   requests and on-demand descriptor serialization,
//! * the DFU class state machine (download, upload, status reporting),
//! * a vendor command sub-protocol carried inside DFU download
//!   payloads: program, read, check-erased, erase, device info, raw
//!   binary mode and reset,
//! * a deferred flash scheduler, so that erase and program run in the
//!   main loop and never inside the USB interrupt.
//!
//! Actual flash access is not part of the library and is provided by
//! the user through [`FlashReader`] (interrupt context, reads only) and
//! [`FlashBackend`] (polling context, erase/program plus optional
//! decrypt, start, progress and completion hooks).
//!
//! ## Architecture
//!
//! The bootloader is split in two halves over a [`Shared`] exchange
//! structure, which is `const`-constructible and meant to live in a
//! `static`:
//!
//! * [`DfuDevice`] — call [`poll`](DfuDevice::poll) from the USB
//!   interrupt handler,
//! * [`FlashScheduler`] — call [`run`](FlashScheduler::run) (or
//!   [`poll`](FlashScheduler::poll)) from the main loop.
//!
//! The interrupt half stages work and raises a command flag; the
//! polling half executes it and clears the flag. The host observes
//! completion by polling DFU GetStatus.
//!
//! ## Example
//!
//! ```ignore
//! use usbd_dfu_boot::{BootConfig, DfuDevice, FlashScheduler, Shared};
//!
//! static SHARED: Shared = Shared::new();
//!
//! const CONFIG: BootConfig = BootConfig {
//!     vendor_id: 0x1cbe,
//!     product_id: 0x00ff,
//!     device_release: 0x0001,
//!     manufacturer: "Example Corp",
//!     product: "Firmware Update",
//!     serial_number: "0",
//!     self_powered: false,
//!     max_power_ma: 100,
//!     flash_size: 256 * 1024,
//!     page_size: 1024,
//!     app_start: 0x1000,
//!     reserved_space: 0,
//!     part_info: 0,
//!     class_info: 0,
//!     code_protection: false,
//!     allow_self_update: false,
//! };
//!
//! // `bus` is the target's usb_device::bus::UsbBus implementation,
//! // `flash` implements FlashReader + FlashBackend for its flash.
//! let mut device = DfuDevice::new(bus, flash_reader, &SHARED, CONFIG);
//! let mut scheduler = FlashScheduler::new(flash, &SHARED, &CONFIG);
//!
//! // from the USB interrupt:
//! //     device.poll();
//! // from main:
//! scheduler.run();
//! ```

/// Vendor command sub-protocol carried in DFU download payloads.
pub mod command;
/// Board configuration and the device information record.
pub mod config;
/// USB device half: poll loop, dispatch, standard requests.
pub mod device;
/// DFU class state machine.
pub mod dfu;
/// Flash access traits.
pub mod flash;
/// Deferred flash scheduler.
pub mod scheduler;
/// Cross-context exchange state.
pub mod shared;

mod descriptor;
mod ep0;

/// Maximum DFU transfer size in bytes, as reported in the functional
/// descriptor.
pub const TRANSFER_SIZE: usize = 1024;

/// Size in bytes of the block unit used by command start/block fields.
pub const BLOCK_SIZE: u32 = 1024;

#[doc(inline)]
pub use crate::command::{CommandError, DownloadCommand};
#[doc(inline)]
pub use crate::config::{BootConfig, DeviceInfo};
#[doc(inline)]
pub use crate::device::DfuDevice;
#[doc(inline)]
pub use crate::dfu::{DfuState, DfuStatus};
#[doc(inline)]
pub use crate::flash::{FlashBackend, FlashError, FlashReader};
#[doc(inline)]
pub use crate::scheduler::FlashScheduler;
#[doc(inline)]
pub use crate::shared::{MemoryBlock, Shared};
