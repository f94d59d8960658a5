//! # sdmmc-spi
//!
//! > A block-device driver for MMC/SD cards over SPI, in legacy
//! > single-data-line mode.
//!
//! This crate drives an SD or MMC card over a bit-banged or hardware SPI
//! peripheral, one command and one data block at a time. It is `#![no_std]`,
//! does not use `alloc`, and performs no filesystem parsing of its own — it
//! hands a `BlockDevice` of fixed 512-byte sectors to whatever layer above it
//! wants one (a FAT driver, a logger, a raw dd-style copy).
//!
//! ## Using the crate
//!
//! You need an `embedded-hal` 0.2 SPI peripheral, a push-pull GPIO output
//! for chip-select, and a millisecond-granularity delay source:
//!
//! ```rust,ignore
//! # struct DummySpi;
//! # struct DummyCsPin;
//! # struct DummyDelay;
//! # impl embedded_hal::blocking::spi::Transfer<u8> for DummySpi {
//! #   type Error = ();
//! #   fn transfer<'w>(&mut self, data: &'w mut [u8]) -> Result<&'w [u8], ()> { Ok(data) }
//! # }
//! # impl embedded_hal::digital::v2::OutputPin for DummyCsPin {
//! #   type Error = ();
//! #   fn set_low(&mut self) -> Result<(), ()> { Ok(()) }
//! #   fn set_high(&mut self) -> Result<(), ()> { Ok(()) }
//! # }
//! # impl embedded_hal::blocking::delay::DelayUs<u16> for DummyDelay {
//! #   fn delay_us(&mut self, _us: u16) {}
//! # }
//! let mut card = sdmmc_spi::MmcSpi::new(DummySpi, DummyCsPin, DummyDelay);
//! let status = card.initialize();
//! if !status.contains(sdmmc_spi::DiskStatus::NOINIT) {
//!     let mut sector = [0u8; 512];
//!     card.disk_read(&mut sector, 0, 1).unwrap();
//! }
//! ```
//!
//! ## Features
//!
//! * `log` (default): log protocol-level diagnostics via the `log` crate.
//! * `defmt-log`: log the same diagnostics via `defmt` instead, for
//!   `probe-run`/`defmt-rtt` targets. Mutually exclusive with `log`.

#![cfg_attr(not(test), no_std)]

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

#[macro_use]
mod structure;

mod block;
mod blockdev;
mod card;
mod error;
mod framing;
mod proto;
mod timer;

#[cfg(test)]
mod tests;

pub use crate::block::{Block, BlockCount, BlockIdx};
pub use crate::blockdev::{BlockDevice, DiskError, DiskResult, DiskStatus, Ioctl, Power};
pub use crate::card::{CardType, MmcSpi};
pub use crate::error::Error;
pub use crate::proto::{Csd, CsdV1, CsdV2};

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
