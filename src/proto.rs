//! Wire-level constants and register layouts for the SD/MMC SPI protocol.
//!
//! Command indices, data tokens and response masks are bit-exact with the
//! values an oscilloscope would show on the wire; see the SD Physical Layer
//! Simplified Specification for the authoritative definitions.

// ==============================================================================
// Command indices. Framing::command ORs these with 0x40 to get the command byte.
// ==============================================================================

/// GO_IDLE_STATE - reset the card and enter SPI mode if CS is low.
pub const CMD0: u8 = 0;
/// SEND_OP_COND - start MMC (ver 3) initialization.
pub const CMD1: u8 = 1;
/// SEND_IF_COND - verify the SD Memory Card interface operating condition.
pub const CMD8: u8 = 8;
/// SEND_CSD - read the Card Specific Data register.
pub const CMD9: u8 = 9;
/// SEND_CID - read the Card Identification register.
pub const CMD10: u8 = 10;
/// STOP_TRANSMISSION - end a multiple block read sequence.
pub const CMD12: u8 = 12;
/// SET_BLOCKLEN - force the card's block length (byte-addressed cards only).
pub const CMD16: u8 = 16;
/// READ_SINGLE_BLOCK - read one data block.
pub const CMD17: u8 = 17;
/// READ_MULTIPLE_BLOCK - read data blocks until STOP_TRANSMISSION.
pub const CMD18: u8 = 18;
/// SET_BLOCK_COUNT (ACMD23) - pre-declare the block count of a multi-write.
pub const CMD23: u8 = 23;
/// WRITE_BLOCK - write one data block.
pub const CMD24: u8 = 24;
/// WRITE_MULTIPLE_BLOCK - write data blocks until the stop token.
pub const CMD25: u8 = 25;
/// SD_SEND_OP_COND (ACMD41) - start SD initialization, optionally with HCS.
pub const CMD41: u8 = 41;
/// APP_CMD - escape for the next command being application-specific.
pub const CMD55: u8 = 55;
/// READ_OCR - read the Operation Conditions Register.
pub const CMD58: u8 = 58;

/// Argument of `SEND_IF_COND` during version probing: voltage window
/// 2.7-3.6V (`0x100`) and the check pattern `0xAA`.
pub const IF_COND_ARG: u32 = 0x0000_01AA;
/// HCS (Host Capacity Support) bit sent in `ACMD41`'s argument.
pub const OCR_HCS_BIT: u32 = 1 << 30;

// ==============================================================================
// R1 response.
// ==============================================================================

/// Card is ready (R1 with no flags set).
pub const R1_READY_STATE: u8 = 0x00;
/// Card is idle (just reset, not yet initialized).
pub const R1_IDLE_STATE: u8 = 0x01;
/// Command was not recognised.
pub const R1_ILLEGAL_COMMAND: u8 = 0x04;

// ==============================================================================
// Data tokens and data-response mask.
// ==============================================================================

/// Start-of-block token for single-block read/write and multi-block read.
pub const DATA_START_BLOCK: u8 = 0xFE;
/// Start-of-block token for multi-block write continuation.
pub const WRITE_MULTIPLE_TOKEN: u8 = 0xFC;
/// Stop token terminating a multi-block write.
pub const STOP_TRAN_TOKEN: u8 = 0xFD;

/// Mask for the low 5 bits of the data-response byte after a written block.
pub const DATA_RES_MASK: u8 = 0x1F;
/// Data-response value meaning the block was accepted.
pub const DATA_RES_ACCEPTED: u8 = 0b00101;

/// Perform the 7-bit CRC used to checksum SD/MMC command frames.
pub fn crc7(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for mut d in data.iter().cloned() {
        for _bit in 0..8 {
            crc <<= 1;
            if ((d & 0x80) ^ (crc & 0x80)) != 0 {
                crc ^= 0x09;
            }
            d <<= 1;
        }
    }
    (crc << 1) | 1
}

/// Checksum byte for a command frame. CRC checking is off on the wire for
/// every command except the two issued before the card has left its reset
/// state, for which the real CRC7 is required regardless of the CRC-disabled
/// default (SD Physical Layer spec, §7.2.2).
pub fn command_checksum(command: u8, arg: u32) -> u8 {
    match command {
        CMD0 | CMD8 => {
            let frame = [
                0x40 | command,
                (arg >> 24) as u8,
                (arg >> 16) as u8,
                (arg >> 8) as u8,
                arg as u8,
            ];
            crc7(&frame)
        }
        _ => 0x01,
    }
}

/// Card Specific Data, version 1.0 (byte-addressed SD/MMC cards).
#[derive(Default)]
pub struct CsdV1 {
    /// The 16 raw bytes of the register.
    pub data: [u8; 16],
}

/// Card Specific Data, version 2.0 (SDHC/SDXC).
#[derive(Default)]
pub struct CsdV2 {
    /// The 16 raw bytes of the register.
    pub data: [u8; 16],
}

/// A Card Specific Data register, in whichever version the card reports.
pub enum Csd {
    /// A version 1.0 CSD.
    V1(CsdV1),
    /// A version 2.0 CSD.
    V2(CsdV2),
}

impl CsdV1 {
    /// An empty, zeroed CSD ready to be filled in by a data-block read.
    pub fn new() -> CsdV1 {
        CsdV1::default()
    }

    fn data(&self) -> &[u8; 16] {
        &self.data
    }

    define_field!(csd_structure, u8, 0, 6, 2);
    define_field!(read_block_length, u8, 5, 0, 4);
    define_field!(device_size, u32, [(6, 0, 2), (7, 0, 8), (8, 6, 2)]);
    define_field!(device_size_multiplier, u8, [(9, 0, 2), (10, 7, 1)]);
    define_field!(erase_single_block_enabled, bool, 10, 6);

    /// Total card capacity in bytes, per the v1.0 `C_SIZE`/`C_SIZE_MULT`/
    /// `READ_BL_LEN` formula.
    pub fn card_capacity_bytes(&self) -> u64 {
        let multiplier = self.device_size_multiplier() + self.read_block_length() + 2;
        (u64::from(self.device_size()) + 1) << multiplier
    }

    /// Total card capacity in 512-byte sectors.
    pub fn sector_count(&self) -> u32 {
        // Same formula as `card_capacity_bytes()`, shifted down by 9 to go
        // from bytes to 512-byte sectors.
        let shift = self.device_size_multiplier() + self.read_block_length() + 2 - 9;
        (self.device_size() + 1) << shift
    }
}

impl CsdV2 {
    /// An empty, zeroed CSD ready to be filled in by a data-block read.
    pub fn new() -> CsdV2 {
        CsdV2::default()
    }

    fn data(&self) -> &[u8; 16] {
        &self.data
    }

    define_field!(csd_structure, u8, 0, 6, 2);
    define_field!(device_size, u32, [(8, 0, 8), (9, 0, 8)]);
    define_field!(erase_single_block_enabled, bool, 10, 6);

    /// Total card capacity in bytes: `(C_SIZE + 1) << 19` (`C_SIZE + 1`
    /// 512KiB units).
    pub fn card_capacity_bytes(&self) -> u64 {
        (u64::from(self.device_size()) + 1) << 19
    }

    /// Total card capacity in 512-byte sectors: `(C_SIZE + 1) << 10`.
    pub fn sector_count(&self) -> u32 {
        (self.device_size() + 1) << 10
    }
}

impl Csd {
    /// Parse a 16-byte CSD register, picking the v1.0 or v2.0 layout from
    /// the structure-version bits in byte 0 (top two bits) rather than from
    /// the card's classified type, since that's the bit the register itself
    /// actually carries.
    pub fn parse(data: [u8; 16]) -> Csd {
        let probe = CsdV2 { data };
        if probe.csd_structure() == 1 {
            Csd::V2(probe)
        } else {
            Csd::V1(CsdV1 { data })
        }
    }

    /// Total card capacity in 512-byte sectors, regardless of CSD version.
    pub fn sector_count(&self) -> u32 {
        match self {
            Csd::V1(csd) => csd.sector_count(),
            Csd::V2(csd) => csd.sector_count(),
        }
    }

    /// Whether the card supports erasing a single 512-byte block.
    pub fn erase_single_block_enabled(&self) -> bool {
        match self {
            Csd::V1(csd) => csd.erase_single_block_enabled(),
            Csd::V2(csd) => csd.erase_single_block_enabled(),
        }
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
