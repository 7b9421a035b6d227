//! Command parser and request/response state machine for the capture link.
//!
//! The session is strictly half-duplex and single-threaded: it reads one
//! `REC,<sr>,<n>` line, answers with `ACK` (or `ERR`), blocks in the capture
//! engine, streams the `DATA` frame, and only then reads the next line.
//! Bytes that arrive while a capture is in progress sit in the transport
//! buffer and are handled as the next command once the frame is out.

use std::io::{BufRead, Write};

use log::{debug, warn};

use crate::capture::{write_frame, Adc, CaptureEngine, Clock};
use crate::errors::{LinkError, Result};

/// Highest sampling rate the ADC path sustains.
pub const MAX_SR: u32 = 8000;
/// Longest supported capture.
pub const MAX_SECONDS: u32 = 10;
/// Sample buffer bound, `MAX_SR * MAX_SECONDS`.
pub const MAX_SAMPLES: u32 = MAX_SR * MAX_SECONDS;

/// A parsed `REC` command, before negotiation against the device limits.
///
/// Both fields are nonzero once `parse` accepts a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    pub sample_rate_hz: u32,
    pub sample_count: u32,
}

impl CaptureRequest {
    /// Parse a command line of the form `REC,<sr>,<n>`.
    ///
    /// The line is trimmed of surrounding whitespace first. Anything else,
    /// including zero-valued fields, is rejected.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let rest = line
            .strip_prefix("REC,")
            .ok_or_else(|| LinkError::Command(format!("expected REC,<sr>,<n>, got {line:?}")))?;
        let (rate, count) = rest
            .split_once(',')
            .ok_or_else(|| LinkError::Command(format!("missing sample count in {line:?}")))?;
        let sample_rate_hz: u32 = rate
            .parse()
            .map_err(|_| LinkError::Command(format!("bad sample rate {rate:?}")))?;
        let sample_count: u32 = count
            .parse()
            .map_err(|_| LinkError::Command(format!("bad sample count {count:?}")))?;
        if sample_rate_hz == 0 || sample_count == 0 {
            return Err(LinkError::Command("zero-valued field".into()));
        }
        Ok(Self {
            sample_rate_hz,
            sample_count,
        })
    }

    /// Clamp the request to the device limits.
    ///
    /// The count is clamped to [`MAX_SAMPLES`] first, then the rate to
    /// [`MAX_SR`]. When the rate had to be lowered, the count is rescaled to
    /// preserve the requested wall-clock duration at the new rate (rounded,
    /// floored at one sample, re-clamped). A client asking for a rate above
    /// the limit therefore gets proportionally fewer samples, not a shorter
    /// recording.
    pub fn negotiate(self) -> CaptureRequest {
        let mut sample_count = self.sample_count.min(MAX_SAMPLES);
        let sample_rate_hz = self.sample_rate_hz.min(MAX_SR);
        if sample_rate_hz != self.sample_rate_hz {
            let requested = self.sample_rate_hz as u64;
            let scaled =
                (sample_count as u64 * sample_rate_hz as u64 + requested / 2) / requested;
            sample_count = (scaled as u32).max(1).min(MAX_SAMPLES);
            warn!(
                "rate {} above limit {}; resampling to {} samples at {} Hz",
                self.sample_rate_hz, MAX_SR, sample_count, sample_rate_hz
            );
        }
        CaptureRequest {
            sample_rate_hz,
            sample_count,
        }
    }
}

/// The device-side protocol session, wrapping a [`CaptureEngine`].
pub struct Session<A, C> {
    engine: CaptureEngine<A, C>,
}

impl<A: Adc, C: Clock> Session<A, C> {
    pub fn new(engine: CaptureEngine<A, C>) -> Self {
        Self { engine }
    }

    /// Announce `READY`, then process command lines until the input ends.
    ///
    /// No command outcome terminates the loop; rejected commands answer `ERR`
    /// and the session keeps reading. Only transport I/O failure returns an
    /// error, since there is no channel left to report on.
    pub fn serve<R: BufRead, W: Write>(&mut self, mut reader: R, mut writer: W) -> Result<()> {
        writer.write_all(b"READY\n")?;
        writer.flush()?;

        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                break;
            }
            if line.trim().is_empty() {
                continue;
            }
            self.handle_line(&line, &mut writer)?;
        }
        Ok(())
    }

    /// Handle one command line: validate, capture, transmit.
    pub fn handle_line<W: Write>(&mut self, line: &str, writer: &mut W) -> Result<()> {
        let request = match CaptureRequest::parse(line) {
            Ok(request) => request,
            Err(e) => {
                debug!("rejecting command: {e}");
                writer.write_all(b"ERR\n")?;
                writer.flush()?;
                return Ok(());
            }
        };

        let accepted = request.negotiate();
        debug!(
            "accepted capture: {} samples at {} Hz",
            accepted.sample_count, accepted.sample_rate_hz
        );
        writer.write_all(b"ACK\n")?;
        writer.flush()?;

        let samples = match self
            .engine
            .capture(accepted.sample_rate_hz, accepted.sample_count)
        {
            Ok(samples) => samples,
            Err(LinkError::Buffer) => {
                warn!("buffer grow failed for {} samples", accepted.sample_count);
                writer.write_all(b"ERR,BUF\n")?;
                writer.flush()?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        write_frame(writer, samples)
    }
}
