//! The protocol engine's internal error type.
//!
//! The block interface collapses all of these down to the closed
//! `DiskResult` set it promises callers; this richer type exists for
//! diagnostics and logging at the protocol layer.

/// Everything that can go wrong talking to the card.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone)]
pub enum Error {
    /// The SPI peripheral itself reported an error.
    Transport,
    /// Couldn't drive the chip-select (or another) GPIO pin.
    GpioError,
    /// A command didn't get a response before its retry budget ran out.
    TimeoutCommand(u8),
    /// The card never asserted ready (`0xFF`) within the ready-wait window.
    TimeoutWaitNotBusy,
    /// No data-start token arrived within the 200ms data-block window.
    TimeoutReadBuffer,
    /// A data block arrived with something other than the start token.
    ReadError,
    /// A data block was rejected, or its busy-drain never completed.
    WriteError,
    /// `SEND_IF_COND` was accepted but echoed a voltage window or check
    /// pattern this driver doesn't recognise.
    VoltageMismatch,
    /// Reading a CSD/CID/OCR register failed.
    RegisterReadError,
    /// The card never left the idle state during initialization.
    ClassificationFailed,
}
