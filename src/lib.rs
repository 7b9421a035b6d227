//! XIAO MG24 Sense USB-CDC audio capture: device core and host recorder.
//!
//! The device core (capture engine + protocol session) is hardware-abstracted
//! over an [`Adc`] source and a wrapping microsecond [`Clock`], so the same
//! code drives a real microphone peripheral, the built-in simulator, or test
//! fakes. The host side is a serial-port client for the same protocol.
//!
//! # Wire protocol
//!
//! Over a 115200-baud byte stream, newline-terminated text lines plus one raw
//! binary payload per capture:
//!
//! 1. Device announces `READY` at boot.
//! 2. Host sends `REC,<sr>,<n>`.
//! 3. Device answers `ERR` (malformed/zero command), `ERR,BUF` (buffer grow
//!    failure), or `ACK` followed, once sampling completes, by
//!    `DATA,<effective_n>`, exactly `effective_n * 2` bytes of little-endian
//!    signed 16-bit samples, and `DONE`.
//!
//! Rates above the device limit are clamped and the sample count rescaled so
//! the recorded wall-clock duration is preserved; see
//! [`CaptureRequest::negotiate`].

mod capture;
mod errors;
mod host;
mod logging;
mod session;

pub use capture::{
    write_frame, Adc, AdcCalibration, CaptureEngine, Clock, SineAdc, SystemClock,
    TX_CHUNK_SAMPLES,
};
pub use errors::{LinkError, Result};
pub use host::{Recorder, Recording};
pub use logging::init_rust_logging;
pub use session::{CaptureRequest, Session, MAX_SAMPLES, MAX_SECONDS, MAX_SR};
