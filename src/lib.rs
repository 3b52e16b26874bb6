#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

//! Interface firmware core for a CMSIS-DAP style debug probe
//!
//! The probe sits between a host and a target MCU and offers:
//! * a virtual COM port bridged to the target UART ([`uart`], [`cdc`])
//! * a drag-and-drop drive: the host copies a firmware image onto an
//!   emulated FAT12 volume and it is streamed into target flash ([`vfs`],
//!   [`transfer`], [`drive`])
//! * a DFU run-time interface to switch into the bootloader ([`dfu`])
//! * the main event task driving LEDs, USB attach and target reset
//!   ([`main_task`], [`event`])
//!
//! Everything runs without allocation. Hardware is reached through traits
//! the board implements: [`uart::UartHardware`], [`flash::FlashTarget`],
//! [`target::TargetDebug`], [`settings::Settings`] and
//! [`main_task::Board`]. USB classes are built on `usb-device`.

pub mod block_device;
pub mod cdc;
pub mod dfu;
pub mod drive;
pub mod event;
pub mod flash;
pub mod main_task;
pub mod ring;
pub mod settings;
pub mod target;
pub mod transfer;
pub mod uart;
pub mod vfs;

pub use crate::cdc::{CdcAcmClass, CdcAcmPorts};
pub use crate::dfu::{DfuRuntimeClass, DfuRuntimeOps};
pub use crate::drive::{DragAndDrop, Drive, MountEvent};
pub use crate::main_task::{Control, MainTask};
pub use crate::ring::RingBuffer;
pub use crate::uart::Uart;
