//! Integration tests against a scripted mock SPI bus standing in for a
//! real card. The mock understands just enough of the command framing to
//! play back the handshake/read/write protocols this driver issues; it
//! does not implement CRC (this driver runs with CRC disabled, the SPI
//! mode default) or anything beyond the command set actually exercised
//! here.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::rc::Rc;
use std::vec::Vec;

use embedded_hal::blocking::delay::DelayUs;
use embedded_hal::blocking::spi::Transfer;
use embedded_hal::digital::v2::OutputPin;
use hex_literal::hex;

use crate::proto::{
    CMD0, CMD1, CMD8, CMD9, CMD10, CMD12, CMD16, CMD17, CMD18, CMD24, CMD25, CMD41, CMD55, CMD58,
    DATA_START_BLOCK, R1_IDLE_STATE, R1_ILLEGAL_COMMAND, R1_READY_STATE, STOP_TRAN_TOKEN,
};
use crate::{CardType, DiskError, DiskStatus, Ioctl, MmcSpi};

const CSD_V2_FIXTURE: [u8; 16] = hex!("40 0E 00 32 5B 59 00 00 1D 69 7F 80 0A 40 00 8B");

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum CardKind {
    Mmc,
    SdV1,
    Sdhc,
}

/// A scripted SD/MMC card: decodes the 6-byte command frames this driver
/// sends and answers with the response bytes the real protocol would give,
/// queued up to be drained one byte per subsequent SPI transfer.
struct MockCard {
    kind: CardKind,
    csd: [u8; 16],
    sectors: HashMap<u32, [u8; 512]>,
    queue: VecDeque<u8>,
    default_byte: u8,
    frame: Vec<u8>,
    acmd_pending: bool,
    sdv1_acmd41_calls: u32,
    expect_write_token: bool,
    multi_write_active: bool,
    swallow: usize,
    payload_buf: Vec<u8>,
    payload_addr: u32,
    write_block_index: u32,
    reject_block: Option<u32>,
    busy_ticks: u32,
    stop_token_received: bool,
    cmd55_response_override: Option<u8>,
}

impl MockCard {
    fn new(kind: CardKind, csd: [u8; 16]) -> Self {
        MockCard {
            kind,
            csd,
            sectors: HashMap::new(),
            queue: VecDeque::new(),
            default_byte: 0xFF,
            frame: Vec::new(),
            acmd_pending: false,
            sdv1_acmd41_calls: 0,
            expect_write_token: false,
            multi_write_active: false,
            swallow: 0,
            payload_buf: Vec::new(),
            payload_addr: 0,
            write_block_index: 0,
            reject_block: None,
            busy_ticks: 0,
            stop_token_received: false,
            cmd55_response_override: None,
        }
    }

    fn handle_byte(&mut self, out: u8) -> u8 {
        if self.swallow > 0 {
            self.payload_buf.push(out);
            self.swallow -= 1;
            if self.swallow == 0 {
                self.finish_payload();
                // The response just queued belongs to the *next* transfer,
                // not this one.
                return self.default_byte;
            }
            return self.pop_or_default();
        }

        if self.expect_write_token {
            self.expect_write_token = false;
            if out == STOP_TRAN_TOKEN {
                self.multi_write_active = false;
                self.stop_token_received = true;
            } else {
                self.swallow = 512 + 2;
            }
            return self.pop_or_default();
        }

        if !self.frame.is_empty() || (out & 0xC0) == 0x40 {
            self.frame.push(out);
            if self.frame.len() == 6 {
                let mut frame = [0u8; 6];
                frame.copy_from_slice(&self.frame);
                self.frame.clear();
                self.decode_command(&frame);
                // Same reasoning as above: don't hand back a response we
                // only just queued on the byte that triggered it.
                return self.default_byte;
            }
            return self.pop_or_default();
        }

        self.pop_or_default()
    }

    fn pop_or_default(&mut self) -> u8 {
        self.queue.pop_front().unwrap_or(self.default_byte)
    }

    fn finish_payload(&mut self) {
        let mut data = [0u8; 512];
        data.copy_from_slice(&self.payload_buf[..512]);
        self.payload_buf.clear();

        let block_index = self.write_block_index;
        self.write_block_index += 1;

        if self.reject_block == Some(block_index) {
            // Low 5 bits deliberately not 0b00101 (accepted).
            self.queue.push_back(0x0B);
        } else {
            self.sectors
                .insert(self.payload_addr.wrapping_add(block_index), data);
            self.queue.push_back(0x05);
            for _ in 0..self.busy_ticks {
                self.queue.push_back(0x00);
            }
            self.queue.push_back(0xFF);
        }

        self.expect_write_token = self.multi_write_active;
    }

    fn decode_command(&mut self, frame: &[u8; 6]) {
        let command = frame[0] & 0x3F;
        let arg = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
        let was_acmd = self.acmd_pending;
        self.acmd_pending = false;

        match command {
            CMD0 => self.queue.push_back(R1_IDLE_STATE),
            CMD1 => self.queue.push_back(R1_READY_STATE),
            CMD8 => {
                if self.kind == CardKind::Sdhc {
                    self.queue.push_back(R1_IDLE_STATE);
                    self.queue.extend(arg.to_be_bytes());
                } else {
                    self.queue.push_back(R1_ILLEGAL_COMMAND);
                }
            }
            CMD9 => {
                self.queue.push_back(R1_READY_STATE);
                self.queue.push_back(DATA_START_BLOCK);
                self.queue.extend(self.csd);
                self.queue.push_back(0);
                self.queue.push_back(0);
            }
            CMD10 => {
                self.queue.push_back(R1_READY_STATE);
                self.queue.push_back(DATA_START_BLOCK);
                self.queue.extend([0u8; 16]);
                self.queue.push_back(0);
                self.queue.push_back(0);
            }
            CMD12 => self.queue.push_back(R1_READY_STATE),
            CMD16 => self.queue.push_back(R1_READY_STATE),
            CMD17 => {
                self.queue.push_back(R1_READY_STATE);
                self.queue.push_back(DATA_START_BLOCK);
                let data = self.sectors.get(&arg).copied().unwrap_or([0u8; 512]);
                self.queue.extend(data);
                self.queue.push_back(0);
                self.queue.push_back(0);
            }
            CMD18 => {
                self.queue.push_back(R1_READY_STATE);
                let data = self.sectors.get(&arg).copied().unwrap_or([0u8; 512]);
                self.queue.push_back(DATA_START_BLOCK);
                self.queue.extend(data);
                self.queue.push_back(0);
                self.queue.push_back(0);
            }
            CMD24 => {
                self.queue.push_back(R1_READY_STATE);
                self.multi_write_active = false;
                self.expect_write_token = true;
                self.payload_addr = arg;
                self.write_block_index = 0;
            }
            CMD25 => {
                self.queue.push_back(R1_READY_STATE);
                self.multi_write_active = true;
                self.expect_write_token = true;
                self.payload_addr = arg;
                self.write_block_index = 0;
            }
            CMD41 => {
                if was_acmd {
                    match self.kind {
                        CardKind::Sdhc => self.queue.push_back(R1_READY_STATE),
                        CardKind::SdV1 => {
                            self.sdv1_acmd41_calls += 1;
                            if self.sdv1_acmd41_calls <= 1 {
                                self.queue.push_back(R1_IDLE_STATE);
                            } else {
                                self.queue.push_back(R1_READY_STATE);
                            }
                        }
                        CardKind::Mmc => self.queue.push_back(R1_ILLEGAL_COMMAND),
                    }
                } else {
                    self.queue.push_back(R1_ILLEGAL_COMMAND);
                }
            }
            CMD55 => {
                self.queue
                    .push_back(self.cmd55_response_override.unwrap_or(R1_IDLE_STATE));
                self.acmd_pending = true;
            }
            CMD58 => {
                self.queue.push_back(R1_READY_STATE);
                // Bit 6 of byte 0 set: card reports block addressing (HC).
                self.queue.extend([0xC0, 0xFF, 0x80, 0x00]);
            }
            _ => self.queue.push_back(R1_ILLEGAL_COMMAND),
        }
    }
}

#[derive(Clone)]
struct MockSpi(Rc<RefCell<MockCard>>);

impl Transfer<u8> for MockSpi {
    type Error = Infallible;

    fn transfer<'w>(&mut self, data: &'w mut [u8]) -> Result<&'w [u8], Self::Error> {
        for byte in data.iter_mut() {
            *byte = self.0.borrow_mut().handle_byte(*byte);
        }
        Ok(data)
    }
}

struct MockCs;

impl OutputPin for MockCs {
    type Error = Infallible;
    fn set_low(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
    fn set_high(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

struct MockDelay;

impl DelayUs<u16> for MockDelay {
    fn delay_us(&mut self, _us: u16) {}
}

fn new_card(kind: CardKind, csd: [u8; 16]) -> (MmcSpi<MockSpi, MockCs, MockDelay>, Rc<RefCell<MockCard>>) {
    let mock = Rc::new(RefCell::new(MockCard::new(kind, csd)));
    let mmc = MmcSpi::new(MockSpi(mock.clone()), MockCs, MockDelay);
    (mmc, mock)
}

#[test]
fn sdhc_card_initializes_as_block_addressed() {
    let (mut mmc, _mock) = new_card(CardKind::Sdhc, CSD_V2_FIXTURE);
    let status = mmc.initialize();
    assert!(!status.contains(DiskStatus::NOINIT));
    assert_eq!(
        mmc.card_type,
        Some(CardType::SdV2 {
            block_addressed: true
        })
    );
}

#[test]
fn sdv1_card_initializes_as_byte_addressed() {
    let (mut mmc, _mock) = new_card(CardKind::SdV1, [0u8; 16]);
    let status = mmc.initialize();
    assert!(!status.contains(DiskStatus::NOINIT));
    assert_eq!(mmc.card_type, Some(CardType::SdV1));
}

#[test]
fn mmc_card_initializes_as_byte_addressed() {
    let (mut mmc, _mock) = new_card(CardKind::Mmc, [0u8; 16]);
    let status = mmc.initialize();
    assert!(!status.contains(DiskStatus::NOINIT));
    assert_eq!(mmc.card_type, Some(CardType::Mmc));
}

#[test]
fn card_rejecting_cmd55_is_classified_as_mmc_even_if_the_following_cmd41_looks_sd_like() {
    let (mut mmc, mock) = new_card(CardKind::SdV1, [0u8; 16]);
    // A card that bounces APP_CMD itself isn't SD, regardless of what it
    // answers to the command that follows.
    mock.borrow_mut().cmd55_response_override = Some(R1_ILLEGAL_COMMAND);
    let status = mmc.initialize();
    assert!(!status.contains(DiskStatus::NOINIT));
    assert_eq!(mmc.card_type, Some(CardType::Mmc));
}

#[test]
fn single_block_read_returns_the_requested_sector() {
    let (mut mmc, mock) = new_card(CardKind::Sdhc, CSD_V2_FIXTURE);
    assert!(!mmc.initialize().contains(DiskStatus::NOINIT));

    let mut expected = [0u8; 512];
    for (i, b) in expected.iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    mock.borrow_mut().sectors.insert(5, expected);

    let mut buf = [0u8; 512];
    mmc.disk_read(&mut buf, 5, 1).expect("read should succeed");
    assert_eq!(buf, expected);
}

#[test]
fn single_block_write_survives_a_busy_card() {
    let (mut mmc, mock) = new_card(CardKind::Sdhc, CSD_V2_FIXTURE);
    assert!(!mmc.initialize().contains(DiskStatus::NOINIT));
    mock.borrow_mut().busy_ticks = 3;

    let mut payload = [0u8; 512];
    for (i, b) in payload.iter_mut().enumerate() {
        *b = (i % 199) as u8;
    }

    mmc.disk_write(&payload, 5, 1).expect("write should succeed");
    assert_eq!(mock.borrow().sectors.get(&5), Some(&payload));
}

#[test]
fn multi_block_write_aborts_when_a_later_block_is_rejected() {
    let (mut mmc, mock) = new_card(CardKind::Sdhc, CSD_V2_FIXTURE);
    assert!(!mmc.initialize().contains(DiskStatus::NOINIT));
    mock.borrow_mut().reject_block = Some(1);

    let payload = [0u8; 1024];
    let result = mmc.disk_write(&payload, 10, 2);
    assert_eq!(result, Err(DiskError::Error));
    // The first block was accepted and stored before the second was rejected.
    assert!(mock.borrow().sectors.contains_key(&10));
    // The driver must still send the stop token instead of leaving the card
    // waiting for more write-multiple blocks forever.
    assert!(mock.borrow().stop_token_received);
}

#[test]
fn get_sector_count_reports_the_csd_v2_capacity() {
    let (mut mmc, _mock) = new_card(CardKind::Sdhc, CSD_V2_FIXTURE);
    assert!(!mmc.initialize().contains(DiskStatus::NOINIT));

    let mut count = 0u32;
    mmc.disk_ioctl(Ioctl::GetSectorCount(&mut count)).unwrap();
    assert_eq!(count, 7_710_720);
}

#[test]
fn disk_read_before_initialize_reports_not_ready() {
    let (mut mmc, _mock) = new_card(CardKind::Sdhc, CSD_V2_FIXTURE);
    let mut buf = [0u8; 512];
    assert_eq!(mmc.disk_read(&mut buf, 0, 1), Err(DiskError::NotReady));
}

#[test]
fn disk_write_with_zero_count_is_a_parameter_error() {
    let (mut mmc, _mock) = new_card(CardKind::Sdhc, CSD_V2_FIXTURE);
    assert!(!mmc.initialize().contains(DiskStatus::NOINIT));
    assert_eq!(mmc.disk_write(&[], 0, 0), Err(DiskError::ParErr));
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
