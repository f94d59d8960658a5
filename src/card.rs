//! The protocol engine: power-on, card classification, sector read/write and
//! the raw register ioctls. Everything here is driven directly off the SD
//! Physical Layer command set, with no knowledge of sectors-as-files.

use embedded_hal::digital::v2::OutputPin;
use embedded_hal::{blocking::delay::DelayUs, blocking::spi::Transfer};

#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};

use crate::blockdev::DiskStatus;
use crate::framing::Framing;
use crate::proto::*;
use crate::timer::Countdown;
use crate::Error;

/// The classification a card settles into after a successful
/// `initialize()`. A closed, tagged enum rather than raw OCR bit tests, so
/// byte- vs block-addressing is explicit at every call site.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CardType {
    /// An MMC (ver 3) card. Always byte-addressed.
    Mmc,
    /// An SD ver 1 card. Always byte-addressed.
    SdV1,
    /// An SD ver 2 card, standard or high capacity.
    SdV2 {
        /// `true` for SDHC/SDXC (block-addressed), `false` for standard
        /// capacity SDv2 (byte-addressed).
        block_addressed: bool,
    },
}

impl CardType {
    /// Does this card address sectors in 512-byte blocks on the wire
    /// (`true`), or does it expect a raw byte offset (`false`)?
    pub fn is_block_addressed(self) -> bool {
        matches!(self, CardType::SdV2 { block_addressed: true })
    }
}

/// The SD/MMC SPI driver context: one per card, owning the bus it was built
/// with for as long as any operation is in flight.
pub struct MmcSpi<SPI, CS, DELAY>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    DELAY: DelayUs<u16>,
{
    pub(crate) spi: SPI,
    pub(crate) cs: CS,
    pub(crate) delay: DELAY,
    pub(crate) status: DiskStatus,
    pub(crate) card_type: Option<CardType>,
    pub(crate) power_on: bool,
    pub(crate) timer1: Countdown,
    pub(crate) timer2: Countdown,
}

impl<SPI, CS, DELAY> MmcSpi<SPI, CS, DELAY>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    DELAY: DelayUs<u16>,
{
    /// Build a driver context from its bus bindings. The card is assumed
    /// uninitialized (`NOINIT` set) until `initialize()` succeeds.
    pub fn new(spi: SPI, cs: CS, delay: DELAY) -> Self {
        MmcSpi {
            spi,
            cs,
            delay,
            status: DiskStatus::NOINIT,
            card_type: None,
            power_on: false,
            timer1: Countdown::new(),
            timer2: Countdown::new(),
        }
    }

    /// Call this from the host's 1ms tick (timer interrupt) to drive
    /// `Timer1`/`Timer2` down. Not required on a bus where the wait loops
    /// advance their own clock via `DELAY` (see `timer::Countdown`).
    pub fn tick(&self) {
        self.timer1.tick();
        self.timer2.tick();
    }

    fn discard_byte(&mut self) -> Result<u8, Error> {
        self.spi
            .transfer(&mut [0xFF])
            .map(|b| b[0])
            .map_err(|_e| Error::Transport)
    }

    fn with_chip_select<F, R>(&mut self, f: F) -> Result<R, Error>
    where
        F: FnOnce(&mut Framing<'_, SPI, CS, DELAY>) -> Result<R, Error>,
    {
        let mut framing = Framing::new(
            &mut self.spi,
            &mut self.cs,
            &mut self.delay,
            &self.timer1,
            &self.timer2,
        )?;
        f(&mut framing)
    }

    /// Run the power-on handshake: at least 74 clock cycles with CS high,
    /// then `GO_IDLE_STATE` polled for up to ~8000 byte-reads.
    pub(crate) fn power_on(&mut self) -> Result<(), Error> {
        self.cs.set_high().map_err(|_| Error::GpioError)?;
        for _ in 0..10 {
            self.discard_byte()?;
        }

        let result = self.with_chip_select(|f| {
            let crc = command_checksum(CMD0, 0);
            let frame = [0x40 | CMD0, 0, 0, 0, 0, crc];
            for b in frame.iter() {
                f.send(*b)?;
            }
            for _ in 0..8000 {
                if f.receive()? == R1_IDLE_STATE {
                    return Ok(());
                }
            }
            Err(Error::TimeoutCommand(CMD0))
        });

        result?;
        self.power_on = true;
        Ok(())
    }

    /// Drop power. The next `initialize()` will re-run the full power-on
    /// handshake from scratch.
    pub(crate) fn power_off(&mut self) {
        self.power_on = false;
    }

    /// Is the power-on handshake currently considered complete?
    pub(crate) fn is_powered(&self) -> bool {
        self.power_on
    }

    /// Classify the card as MMC, SDv1, or SDv2 (standard or high capacity),
    /// forcing a 512-byte block length where the card doesn't already use
    /// one. On failure `card_type` is left unset and power is turned off.
    pub(crate) fn classify(&mut self) -> Result<CardType, Error> {
        self.power_on()?;

        let result = self.with_chip_select(|f| {
            if f.command(CMD0, 0)? != R1_IDLE_STATE {
                return Err(Error::ClassificationFailed);
            }

            f.timer1_arm_init();
            if f.command(CMD8, IF_COND_ARG)? == R1_IDLE_STATE {
                // SDv2 path: read the R7 trailer and check the echoed
                // voltage window and check pattern.
                let mut r7 = [0u8; 4];
                for b in r7.iter_mut() {
                    *b = f.receive()?;
                }
                if r7[2] != 0x01 || r7[3] != 0xAA {
                    return Err(Error::VoltageMismatch);
                }

                loop {
                    if f.acmd(CMD41, OCR_HCS_BIT)?.1 == R1_READY_STATE {
                        break;
                    }
                    if f.timer1_expired() {
                        return Err(Error::ClassificationFailed);
                    }
                    f.timer1_advance()?;
                }

                if f.command(CMD58, 0)? != R1_READY_STATE {
                    return Err(Error::ClassificationFailed);
                }
                let mut ocr = [0u8; 4];
                for b in ocr.iter_mut() {
                    *b = f.receive()?;
                }
                let block_addressed = (ocr[0] & 0x40) != 0;
                Ok(CardType::SdV2 { block_addressed })
            } else {
                // Legacy path: tell MMC and SDv1 apart by whether the card
                // accepts ACMD41 at all. Both the CMD55 and the CMD41
                // response have to indicate acceptance; a card that bounces
                // CMD55 but happens to answer the following CMD41 with
                // something <= 1 is not actually SD.
                let (cmd55_response, cmd41_response) = f.acmd(CMD41, 0)?;
                let is_sd1 = cmd55_response <= R1_IDLE_STATE && cmd41_response <= R1_IDLE_STATE;

                loop {
                    let done = if is_sd1 {
                        f.acmd(CMD41, 0)?.1 == R1_READY_STATE
                    } else {
                        f.command(CMD1, 0)? == R1_READY_STATE
                    };
                    if done {
                        break;
                    }
                    if f.timer1_expired() {
                        return Err(Error::ClassificationFailed);
                    }
                    f.timer1_advance()?;
                }

                if f.command(CMD16, 512)? != R1_READY_STATE {
                    return Err(Error::ClassificationFailed);
                }

                Ok(if is_sd1 { CardType::SdV1 } else { CardType::Mmc })
            }
        });

        match result {
            Ok(card_type) => {
                debug!("card classified");
                self.card_type = Some(card_type);
                self.status.remove(DiskStatus::NOINIT);
                Ok(card_type)
            }
            Err(e) => {
                warn!("classification failed");
                self.power_off();
                Err(e)
            }
        }
    }

    fn addr_for(&self, card_type: CardType, sector: u32) -> u32 {
        if card_type.is_block_addressed() {
            sector
        } else {
            sector.wrapping_mul(512)
        }
    }

    /// Read `count` consecutive 512-byte sectors starting at `sector`.
    pub(crate) fn read_sectors(
        &mut self,
        buf: &mut [u8],
        sector: u32,
        count: u32,
    ) -> Result<(), Error> {
        let card_type = self.card_type.ok_or(Error::ClassificationFailed)?;
        let addr = self.addr_for(card_type, sector);
        self.with_chip_select(|f| {
            if count == 1 {
                if f.command(CMD17, addr)? != R1_READY_STATE {
                    return Err(Error::ReadError);
                }
                f.read_data(&mut buf[..512])?;
            } else {
                if f.command(CMD18, addr)? != R1_READY_STATE {
                    return Err(Error::ReadError);
                }
                for chunk in buf.chunks_mut(512).take(count as usize) {
                    f.read_data(chunk)?;
                }
                f.command(CMD12, 0)?;
            }
            Ok(())
        })
    }

    /// Write `count` consecutive 512-byte sectors starting at `sector`.
    pub(crate) fn write_sectors(
        &mut self,
        buf: &[u8],
        sector: u32,
        count: u32,
    ) -> Result<(), Error> {
        let card_type = self.card_type.ok_or(Error::ClassificationFailed)?;
        let addr = self.addr_for(card_type, sector);
        self.with_chip_select(|f| {
            if count == 1 {
                if f.command(CMD24, addr)? != R1_READY_STATE {
                    return Err(Error::WriteError);
                }
                f.write_data(DATA_START_BLOCK, &buf[..512])?;
            } else {
                if card_type == CardType::SdV1 {
                    f.acmd(CMD23, count)?;
                }
                if f.command(CMD25, addr)? != R1_READY_STATE {
                    return Err(Error::WriteError);
                }
                let mut first_error = None;
                for chunk in buf.chunks(512).take(count as usize) {
                    if let Err(e) = f.write_data(WRITE_MULTIPLE_TOKEN, chunk) {
                        first_error = Some(e);
                        break;
                    }
                }
                // Always send the stop token, even after a rejected block,
                // so the card's write-multiple state machine isn't left
                // dangling; report whichever error happened first.
                let stop_result = f.write_data(STOP_TRAN_TOKEN, &[]);
                if let Some(e) = first_error {
                    return Err(e);
                }
                stop_result?;
            }
            Ok(())
        })
    }

    /// Wait for the card to report ready (`0xFF`); used by `ioctl(SYNC)`.
    pub(crate) fn sync(&mut self) -> Result<(), Error> {
        self.with_chip_select(|f| {
            if f.ready_wait()? == 0xFF {
                Ok(())
            } else {
                Err(Error::TimeoutWaitNotBusy)
            }
        })
    }

    /// Read the raw 16-byte Card Specific Data register (`SEND_CSD`).
    pub(crate) fn read_csd_raw(&mut self) -> Result<[u8; 16], Error> {
        let mut data = [0u8; 16];
        self.with_chip_select(|f| {
            if f.command(CMD9, 0)? != R1_READY_STATE {
                return Err(Error::RegisterReadError);
            }
            f.read_data(&mut data)
        })?;
        Ok(data)
    }

    /// Read and parse the Card Specific Data register (`SEND_CSD`).
    pub(crate) fn read_csd(&mut self) -> Result<Csd, Error> {
        Ok(Csd::parse(self.read_csd_raw()?))
    }

    /// Read the Card Identification register (`SEND_CID`).
    pub(crate) fn read_cid(&mut self) -> Result<[u8; 16], Error> {
        let mut data = [0u8; 16];
        self.with_chip_select(|f| {
            if f.command(CMD10, 0)? != R1_READY_STATE {
                return Err(Error::RegisterReadError);
            }
            f.read_data(&mut data)
        })?;
        Ok(data)
    }

    /// Read the Operation Conditions Register (`READ_OCR`), a raw 4-byte
    /// register rather than a data block.
    pub(crate) fn read_ocr(&mut self) -> Result<[u8; 4], Error> {
        self.with_chip_select(|f| {
            if f.command(CMD58, 0)? != R1_READY_STATE {
                return Err(Error::RegisterReadError);
            }
            let mut ocr = [0u8; 4];
            for b in ocr.iter_mut() {
                *b = f.receive()?;
            }
            Ok(ocr)
        })
    }

    /// Total number of 512-byte sectors on the card, derived from the CSD.
    pub(crate) fn sector_count(&mut self) -> Result<u32, Error> {
        let csd = self.read_csd()?;
        Ok(csd.sector_count())
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
