//! Command frames and data-block transfers.
//!
//! `Framing` is created with chip-select already asserted and deasserts it on
//! drop, so every command plus its response or data block is atomic with
//! respect to the card — including the per-block loop of a multi-block read
//! or write, not just a single command.

use embedded_hal::{
    blocking::{delay::DelayUs, spi::Transfer},
    digital::v2::OutputPin,
};

use crate::proto::*;
use crate::timer::Countdown;
use crate::Error;

#[cfg(feature = "log")]
use log::trace;

#[cfg(feature = "defmt-log")]
use defmt::trace;

/// A command/data-block transaction with chip-select held low.
pub(crate) struct Framing<'a, SPI, CS, DELAY>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    DELAY: DelayUs<u16>,
{
    spi: &'a mut SPI,
    cs: &'a mut CS,
    delay: &'a mut DELAY,
    timer1: &'a Countdown,
    timer2: &'a Countdown,
}

impl<'a, SPI, CS, DELAY> Drop for Framing<'a, SPI, CS, DELAY>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    DELAY: DelayUs<u16>,
{
    fn drop(&mut self) {
        // Deassert CS and clock one dummy byte so the card's internal clock
        // advances by eight cycles, matching every other CS deassertion.
        let _ = self.cs.set_high();
        let _ = self.delay.delay_us(1000);
        let _ = self.receive();
    }
}

impl<'a, SPI, CS, DELAY> Framing<'a, SPI, CS, DELAY>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
    DELAY: DelayUs<u16>,
{
    /// Assert chip-select and begin a transaction.
    pub(crate) fn new(
        spi: &'a mut SPI,
        cs: &'a mut CS,
        delay: &'a mut DELAY,
        timer1: &'a Countdown,
        timer2: &'a Countdown,
    ) -> Result<Self, Error> {
        cs.set_low().map_err(|_| Error::GpioError)?;
        delay.delay_us(1000);
        Ok(Framing {
            spi,
            cs,
            delay,
            timer1,
            timer2,
        })
    }

    fn transfer(&mut self, out: u8) -> Result<u8, Error> {
        self.spi
            .transfer(&mut [out])
            .map(|b| b[0])
            .map_err(|_e| Error::Transport)
    }

    /// Clock in one byte by transmitting `0xFF`.
    pub(crate) fn receive(&mut self) -> Result<u8, Error> {
        self.transfer(0xFF)
    }

    /// Clock out one byte, discarding whatever comes back.
    pub(crate) fn send(&mut self, out: u8) -> Result<(), Error> {
        self.transfer(out)?;
        Ok(())
    }

    /// Advance the countdown by one millisecond. Used by wait loops on a
    /// fully synchronous bus, where there's no interrupt to decrement the
    /// timer for us (see `timer::Countdown`).
    fn advance(&mut self, timer: &Countdown) -> Result<(), Error> {
        self.delay.delay_us(1000);
        timer.tick();
        Ok(())
    }

    /// Arm `timer1` to 1000ms, the initialization op-cond polling window.
    pub(crate) fn timer1_arm_init(&self) {
        self.timer1.arm(1000);
    }

    /// Has `timer1` run out?
    pub(crate) fn timer1_expired(&self) -> bool {
        self.timer1.expired()
    }

    /// Advance `timer1` by one millisecond (synchronous-bus fallback).
    pub(crate) fn timer1_advance(&mut self) -> Result<(), Error> {
        self.advance(self.timer1)
    }

    /// Arm `timer2` to 500ms and receive bytes until the card reports
    /// `0xFF` (ready) or the timer runs out. Returns the last byte seen.
    pub(crate) fn ready_wait(&mut self) -> Result<u8, Error> {
        self.timer2.arm(500);
        let mut last = self.receive()?;
        while last != 0xFF && !self.timer2.expired() {
            self.advance(self.timer2)?;
            last = self.receive()?;
        }
        Ok(last)
    }

    /// Build and send a six-byte command frame, then poll for its R1
    /// response.
    pub(crate) fn command(&mut self, command: u8, arg: u32) -> Result<u8, Error> {
        if self.ready_wait()? != 0xFF {
            return Err(Error::TimeoutWaitNotBusy);
        }

        let crc = command_checksum(command, arg);
        let frame = [
            0x40 | command,
            (arg >> 24) as u8,
            (arg >> 16) as u8,
            (arg >> 8) as u8,
            arg as u8,
            crc,
        ];
        for b in frame.iter() {
            self.send(*b)?;
        }

        // STOP_TRANSMISSION gets one stuff byte ahead of its response.
        if command == CMD12 {
            self.receive()?;
        }

        for _ in 0..10 {
            let result = self.receive()?;
            if (result & 0x80) == 0 {
                return Ok(result);
            }
        }
        trace!("command {} timed out waiting for a response", command);
        Err(Error::TimeoutCommand(command))
    }

    /// Send `APP_CMD` followed by the given application-specific command.
    /// Returns both responses: callers that only care about the
    /// application-specific command can match on `.1`, but some
    /// classification decisions need both (a card can answer `CMD55`
    /// favorably and still reject the command that follows it).
    pub(crate) fn acmd(&mut self, command: u8, arg: u32) -> Result<(u8, u8), Error> {
        let cmd55_response = self.command(CMD55, 0)?;
        let response = self.command(command, arg)?;
        Ok((cmd55_response, response))
    }

    /// Receive a data block of exactly `buffer.len()` payload bytes,
    /// preceded by a start token and followed by two (unchecked) checksum
    /// bytes.
    pub(crate) fn read_data(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        self.timer1.arm(200);
        let token = loop {
            let b = self.receive()?;
            if b != 0xFF {
                break b;
            }
            if self.timer1.expired() {
                return Err(Error::TimeoutReadBuffer);
            }
            self.advance(self.timer1)?;
        };
        if token != DATA_START_BLOCK {
            return Err(Error::ReadError);
        }

        for b in buffer.iter_mut() {
            *b = self.receive()?;
        }

        // Discard the two checksum bytes; CRC checking is off in this mode.
        self.receive()?;
        self.receive()?;

        Ok(())
    }

    /// Transmit a data block (or the multi-write stop token, which carries
    /// no payload).
    pub(crate) fn write_data(&mut self, token: u8, buffer: &[u8]) -> Result<(), Error> {
        if self.ready_wait()? != 0xFF {
            return Err(Error::TimeoutWaitNotBusy);
        }

        self.send(token)?;

        if token == STOP_TRAN_TOKEN {
            return Ok(());
        }

        for &b in buffer.iter() {
            self.send(b)?;
        }
        // Two dummy checksum bytes; no CRC is computed or checked.
        self.send(0xFF)?;
        self.send(0xFF)?;

        let status = self.receive()?;
        if (status & DATA_RES_MASK) != DATA_RES_ACCEPTED {
            return Err(Error::WriteError);
        }

        // Drain the busy signal: the card holds the line at 0x00 while it
        // programs the block. This is deliberately "wait while 0x00", not
        // "wait until not-0xFF".
        loop {
            if self.receive()? != 0x00 {
                break;
            }
        }

        Ok(())
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
