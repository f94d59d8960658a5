//! The block interface: the thin, sector-addressed read/write/ioctl/status
//! surface a FAT filesystem layer consumes. This is where
//! `PARERR`/`NOTRDY`/`WRPRT` are decided *before* any bus activity —
//! everything else is delegated to the protocol engine in `card`.

mod refcell;

use crate::block::{Block, BlockCount, BlockIdx};
use crate::card::MmcSpi;
use embedded_hal::digital::v2::OutputPin;
use embedded_hal::{blocking::delay::DelayUs, blocking::spi::Transfer};

bitflags::bitflags! {
    /// Disk status bits. `NOINIT` is owned by the protocol engine;
    /// `NODISK`/`PROTECT` are set only by the host.
    pub struct DiskStatus: u8 {
        /// The drive has not been (successfully) initialized.
        const NOINIT = 0x01;
        /// No medium is present, as reported by the host.
        const NODISK = 0x02;
        /// The medium is write-protected, as reported by the host.
        const PROTECT = 0x04;
    }
}

/// Everything the block interface can fail with, beyond plain success.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DiskError {
    /// A command, response, or data transfer failed at the protocol level.
    Error,
    /// A write was rejected because the medium is write-protected.
    WrProt,
    /// The drive has not been initialized (`NOINIT` is set).
    NotReady,
    /// The request itself was invalid (e.g. a zero sector count).
    ParErr,
}

/// The result of a block-interface operation, expressed as
/// `Result<T, DiskError>` rather than a flat C-style status enum, since
/// `Ok`/`Err` already says exactly that and composes with `?`.
pub type DiskResult<T = ()> = Result<T, DiskError>;

impl From<crate::Error> for DiskError {
    fn from(_: crate::Error) -> Self {
        DiskError::Error
    }
}

/// A power-control ioctl sub-command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Power {
    /// Turn the card off; the next `initialize()` redoes the full power-on
    /// handshake.
    Off,
    /// Re-run the power-on handshake without reclassifying the card.
    On,
    /// Report whether the power-on handshake currently considers the card
    /// powered.
    Query,
}

/// An ioctl request, carrying its output buffer (if any) by reference. Each
/// control code pairs with exactly one buffer shape, so the enum makes a
/// mismatch unrepresentable instead of relying on the caller to cast a raw
/// pointer correctly.
pub enum Ioctl<'a> {
    /// Wait for the card to go ready; succeeds once `0xFF` is seen.
    Sync,
    /// Total number of 512-byte sectors on the card.
    GetSectorCount(&'a mut u32),
    /// The fixed sector size, always 512.
    GetSectorSize(&'a mut u16),
    /// Power control (see `Power`); `Power::Query`'s answer lands in the
    /// reference.
    Power(Power, &'a mut bool),
    /// Raw Card Specific Data register.
    GetCsd(&'a mut [u8; 16]),
    /// Raw Card Identification register.
    GetCid(&'a mut [u8; 16]),
    /// Raw Operation Conditions Register.
    GetOcr(&'a mut [u8; 4]),
}

impl<SPI, CS, DELAY> MmcSpi<SPI, CS, DELAY>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    DELAY: DelayUs<u16>,
{
    /// Classify the card and, on success, clear `NOINIT`. Returns the
    /// resulting status either way.
    pub fn initialize(&mut self) -> DiskStatus {
        if self.status.contains(DiskStatus::NODISK) {
            return self.status;
        }
        let _ = MmcSpi::classify(self);
        self.status
    }

    /// The current disk status bits.
    pub fn status(&self) -> DiskStatus {
        self.status
    }

    /// Mark (or clear) the no-medium condition. Owned entirely by the host;
    /// the protocol engine never sets or clears this bit itself.
    pub fn set_no_disk(&mut self, no_disk: bool) {
        self.status.set(DiskStatus::NODISK, no_disk);
    }

    /// Mark (or clear) the write-protect condition.
    pub fn set_write_protect(&mut self, protected: bool) {
        self.status.set(DiskStatus::PROTECT, protected);
    }

    /// Read `count` consecutive 512-byte sectors into `buf`, starting at
    /// `sector`. `buf` must be exactly `count * 512` bytes.
    pub fn disk_read(&mut self, buf: &mut [u8], sector: u32, count: u32) -> DiskResult {
        if count == 0 {
            return Err(DiskError::ParErr);
        }
        if self.status.contains(DiskStatus::NOINIT) {
            return Err(DiskError::NotReady);
        }
        MmcSpi::read_sectors(self, buf, sector, count).map_err(DiskError::from)
    }

    /// Write `count` consecutive 512-byte sectors from `buf`, starting at
    /// `sector`. `buf` must be exactly `count * 512` bytes.
    pub fn disk_write(&mut self, buf: &[u8], sector: u32, count: u32) -> DiskResult {
        if count == 0 {
            return Err(DiskError::ParErr);
        }
        if self.status.contains(DiskStatus::NOINIT) {
            return Err(DiskError::NotReady);
        }
        if self.status.contains(DiskStatus::PROTECT) {
            return Err(DiskError::WrProt);
        }
        MmcSpi::write_sectors(self, buf, sector, count).map_err(DiskError::from)
    }

    /// Run a control/inquiry operation.
    pub fn disk_ioctl(&mut self, request: Ioctl<'_>) -> DiskResult {
        if let Ioctl::Power(power, answer) = request {
            return match power {
                Power::Off => {
                    MmcSpi::power_off(self);
                    Ok(())
                }
                Power::On => MmcSpi::power_on(self).map_err(DiskError::from),
                Power::Query => {
                    *answer = MmcSpi::is_powered(self);
                    Ok(())
                }
            };
        }

        if self.status.contains(DiskStatus::NOINIT) {
            return Err(DiskError::NotReady);
        }

        match request {
            Ioctl::Sync => MmcSpi::sync(self).map_err(DiskError::from),
            Ioctl::GetSectorCount(out) => {
                *out = MmcSpi::sector_count(self)?;
                Ok(())
            }
            Ioctl::GetSectorSize(out) => {
                *out = 512;
                Ok(())
            }
            Ioctl::GetCsd(out) => {
                *out = MmcSpi::read_csd_raw(self)?;
                Ok(())
            }
            Ioctl::GetCid(out) => {
                *out = MmcSpi::read_cid(self)?;
                Ok(())
            }
            Ioctl::GetOcr(out) => {
                *out = MmcSpi::read_ocr(self)?;
                Ok(())
            }
            Ioctl::Power(..) => unreachable!("handled above"),
        }
    }
}

/// Represents a block device: something that can read and write fixed-size
/// blocks, addressed from zero. Implemented for `MmcSpi` so a filesystem
/// layer that already speaks this trait needs no adapter code.
pub trait BlockDevice {
    /// The errors that the `BlockDevice` can return. Must be debug formattable.
    type Error: core::fmt::Debug;
    /// Read one or more blocks, starting at the given block index.
    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        reason: &str,
    ) -> Result<(), Self::Error>;
    /// Write one or more blocks, starting at the given block index.
    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error>;
    /// Determine how many blocks this device can hold.
    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error>;

    /// Convenience wrapper for reading exactly one block.
    fn read_block(&mut self, block_idx: BlockIdx) -> Result<Block, Self::Error> {
        let mut blocks = [Block::new()];
        self.read(&mut blocks, block_idx, "")?;
        let [block] = blocks;
        Ok(block)
    }
}

impl<T> BlockDevice for &mut T
where
    T: BlockDevice,
{
    type Error = T::Error;

    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        reason: &str,
    ) -> Result<(), Self::Error> {
        (*self).read(blocks, start_block_idx, reason)
    }

    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        (*self).write(blocks, start_block_idx)
    }

    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        (*self).num_blocks()
    }
}

impl<SPI, CS, DELAY> BlockDevice for MmcSpi<SPI, CS, DELAY>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    DELAY: DelayUs<u16>,
{
    type Error = DiskError;

    fn read(
        &mut self,
        blocks: &mut [Block],
        start_block_idx: BlockIdx,
        _reason: &str,
    ) -> Result<(), Self::Error> {
        for (idx, block) in blocks.iter_mut().enumerate() {
            self.disk_read(&mut block.contents, start_block_idx.0 + idx as u32, 1)?;
        }
        Ok(())
    }

    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        for (idx, block) in blocks.iter().enumerate() {
            self.disk_write(&block.contents, start_block_idx.0 + idx as u32, 1)?;
        }
        Ok(())
    }

    fn num_blocks(&mut self) -> Result<BlockCount, Self::Error> {
        let mut count = 0u32;
        self.disk_ioctl(Ioctl::GetSectorCount(&mut count))?;
        Ok(BlockCount(count))
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
