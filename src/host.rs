//! Host-side recorder: issues `REC` commands over a serial link and decodes
//! the response frame into signed 16-bit samples.
//!
//! The link is half-duplex and synchronous: one request, then the complete
//! response (or a timeout) before the next request. The device performs no
//! receipt acknowledgement and has no retry logic, so truncated or garbled
//! framing is surfaced here as a failed capture; retrying means issuing a
//! fresh `REC` command.

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::errors::{LinkError, Result};
use crate::session::MAX_SR;

/// Serial baud rate the device enumerates at.
const BAUD_RATE: u32 = 115_200;

/// Per-read timeout on the serial port.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Settle time after opening the port; some cores reset on open.
const ENUMERATION_DELAY: Duration = Duration::from_millis(250);

/// Longest header/marker line the device ever sends.
const MAX_LINE: usize = 64;

/// Trait for Read + Write + Send, allowing different transport backends.
trait Transport: Read + Write + Send {}
impl<T: Read + Write + Send> Transport for T {}

/// A completed capture: the decoded samples and the effective rate they were
/// acquired at (the device clamps rates above its limit).
#[derive(Debug, Clone)]
pub struct Recording {
    pub samples: Vec<i16>,
    pub sample_rate_hz: u32,
}

impl Recording {
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate_hz as f64
    }
}

/// Client for the capture protocol.
///
/// # Example
/// ```ignore
/// let mut recorder = Recorder::connect_serial("/dev/ttyACM0")?;
/// let recording = recorder.record(8000, 2.0)?;
/// println!("{} samples, {:.2}s", recording.samples.len(), recording.duration_secs());
/// ```
pub struct Recorder {
    transport: Box<dyn Transport>,
}

impl Recorder {
    /// Open the device's CDC serial port.
    ///
    /// Discards the startup `READY` banner along with anything else pending
    /// in the buffers.
    pub fn connect_serial(path: &str) -> Result<Self> {
        let port = serialport::new(path, BAUD_RATE)
            .timeout(DEFAULT_TIMEOUT)
            .open()?;
        std::thread::sleep(ENUMERATION_DELAY);
        port.clear(serialport::ClearBuffer::All)?;
        Ok(Self {
            transport: Box::new(port),
        })
    }

    /// Wrap an already-connected byte stream.
    #[allow(dead_code)]
    pub fn from_stream<T: Read + Write + Send + 'static>(stream: T) -> Self {
        Self {
            transport: Box::new(stream),
        }
    }

    /// Record for `seconds` at `sample_rate_hz`.
    pub fn record(&mut self, sample_rate_hz: u32, seconds: f64) -> Result<Recording> {
        if !seconds.is_finite() || seconds <= 0.0 {
            return Err(LinkError::Command(format!("bad duration {seconds}")));
        }
        let sample_count = (sample_rate_hz as f64 * seconds).round() as u32;
        self.record_samples(sample_rate_hz, sample_count)
    }

    /// Record exactly `sample_count` samples at `sample_rate_hz`.
    ///
    /// The device may answer with a different count (clamped, or rescaled
    /// when the rate exceeds its limit); the declared count is honored.
    pub fn record_samples(&mut self, sample_rate_hz: u32, sample_count: u32) -> Result<Recording> {
        if sample_rate_hz == 0 || sample_count == 0 {
            return Err(LinkError::Command("rate and count must be nonzero".into()));
        }
        if sample_rate_hz > MAX_SR {
            warn!(
                "requested rate {} Hz exceeds device limit {} Hz; device will resample",
                sample_rate_hz, MAX_SR
            );
        }

        // Stale bytes from an earlier failed capture would otherwise show up
        // ahead of the ACK/DATA headers.
        self.flush_input()?;

        let command = format!("REC,{},{}\n", sample_rate_hz, sample_count);
        self.transport.write_all(command.as_bytes())?;
        self.transport.flush()?;

        // Allow at least the requested recording duration plus slack before
        // giving up on the header; long captures block the device for their
        // full length.
        let requested_secs = sample_count as f64 / sample_rate_hz as f64;
        let deadline = Instant::now() + Duration::from_secs_f64((requested_secs + 2.0).max(5.0));

        let declared = self.read_data_header(deadline)?;
        if declared != sample_count {
            debug!(
                "device adjusted sample count {} -> {}",
                sample_count, declared
            );
        }

        let payload = self.read_payload(declared as usize * 2, deadline)?;

        let trailer = self.read_line(deadline, "DONE marker")?;
        if trailer != "DONE" {
            return Err(LinkError::Header(trailer));
        }

        let samples = payload
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Ok(Recording {
            samples,
            sample_rate_hz: sample_rate_hz.min(MAX_SR),
        })
    }

    /// Read lines until the `DATA,<n>` header, skipping blanks and the
    /// `READY`/`ACK` markers. Anything else (including `ERR`) fails the
    /// capture.
    fn read_data_header(&mut self, deadline: Instant) -> Result<u32> {
        loop {
            let line = self.read_line(deadline, "DATA header")?;
            if line.is_empty() || line == "READY" || line == "ACK" {
                continue;
            }
            if let Some(count) = line.strip_prefix("DATA,") {
                return count
                    .parse::<u32>()
                    .map_err(|_| LinkError::Header(line.clone()));
            }
            return Err(LinkError::Header(line));
        }
    }

    fn read_payload(&mut self, byte_count: usize, deadline: Instant) -> Result<Vec<u8>> {
        let mut payload = vec![0u8; byte_count];
        let mut got = 0usize;
        while got < byte_count {
            match self.transport.read(&mut payload[got..]) {
                Ok(0) => {
                    return Err(LinkError::Truncated {
                        expected: byte_count,
                        got,
                    })
                }
                Ok(n) => got += n,
                Err(e)
                    if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
                Err(e) => return Err(e.into()),
            }
            if got < byte_count && Instant::now() > deadline {
                return Err(LinkError::Truncated {
                    expected: byte_count,
                    got,
                });
            }
        }
        Ok(payload)
    }

    /// Read one newline-terminated line, byte at a time, under a deadline.
    ///
    /// Leading delimiters are skipped so a stray blank line never counts as a
    /// response.
    fn read_line(&mut self, deadline: Instant, what: &str) -> Result<String> {
        let mut response = Vec::with_capacity(MAX_LINE);
        loop {
            let mut byte = [0u8; 1];
            match self.transport.read(&mut byte) {
                Ok(n) if n >= 1 => {
                    if byte[0] == b'\n' || byte[0] == b'\r' || byte[0] == 0 {
                        if !response.is_empty() {
                            break;
                        }
                        continue;
                    }
                    response.push(byte[0]);
                    if response.len() >= MAX_LINE {
                        break;
                    }
                }
                Ok(_) => {
                    // Stream closed under us.
                    if !response.is_empty() {
                        break;
                    }
                    return Err(LinkError::Timeout(format!(
                        "stream ended while waiting for {what}"
                    )));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == ErrorKind::TimedOut => {
                    if !response.is_empty() {
                        break;
                    }
                }
                Err(e) => {
                    if !response.is_empty() {
                        break;
                    }
                    return Err(e.into());
                }
            }

            if Instant::now() > deadline {
                if !response.is_empty() {
                    break;
                }
                return Err(LinkError::Timeout(format!("waiting for {what}")));
            }
        }
        Ok(String::from_utf8_lossy(&response).trim().to_string())
    }

    /// Drain any pending input data.
    fn flush_input(&mut self) -> Result<()> {
        let mut buf = [0u8; 256];
        let start = Instant::now();
        let max_flush = Duration::from_millis(200);
        let mut iterations = 0usize;
        loop {
            iterations += 1;
            match self.transport.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }

            if iterations > 64 || start.elapsed() > max_flush {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    use std::sync::{Arc, Mutex};

    /// In-memory link that releases its scripted response only after a
    /// newline-terminated command has been written, mirroring the real
    /// request/response ordering.
    struct ScriptedLink {
        response: io::Cursor<Vec<u8>>,
        armed: bool,
        sent: Arc<Mutex<Vec<u8>>>,
    }

    impl ScriptedLink {
        fn new(response: Vec<u8>) -> Self {
            Self {
                response: io::Cursor::new(response),
                armed: false,
                sent: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn sent(&self) -> Arc<Mutex<Vec<u8>>> {
            Arc::clone(&self.sent)
        }
    }

    impl Read for ScriptedLink {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if !self.armed {
                return Ok(0);
            }
            self.response.read(buf)
        }
    }

    impl Write for ScriptedLink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut sent = self.sent.lock().unwrap();
            sent.extend_from_slice(buf);
            if sent.contains(&b'\n') {
                self.armed = true;
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn frame(samples: &[i16]) -> Vec<u8> {
        let mut out = format!("READY\nACK\nDATA,{}\n", samples.len()).into_bytes();
        for &s in samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out.extend_from_slice(b"DONE\n");
        out
    }

    #[test]
    fn decodes_a_complete_frame() {
        let mut recorder = Recorder::from_stream(ScriptedLink::new(frame(&[0, -100, 32767])));
        let recording = recorder.record_samples(8000, 3).unwrap();
        assert_eq!(recording.samples, vec![0, -100, 32767]);
        assert_eq!(recording.sample_rate_hz, 8000);
    }

    #[test]
    fn sends_the_command_verbatim() {
        let link = ScriptedLink::new(frame(&[1]));
        let sent = link.sent();
        let mut recorder = Recorder::from_stream(link);
        recorder.record_samples(4000, 1).unwrap();
        assert_eq!(&*sent.lock().unwrap(), b"REC,4000,1\n");
    }

    #[test]
    fn honors_device_adjusted_count() {
        // Device halved the count (rate was clamped); host must read the
        // declared amount, not the requested one.
        let mut recorder = Recorder::from_stream(ScriptedLink::new(frame(&[5, 6])));
        let recording = recorder.record_samples(16_000, 4).unwrap();
        assert_eq!(recording.samples, vec![5, 6]);
        assert_eq!(recording.sample_rate_hz, 8000);
    }

    #[test]
    fn err_response_fails_the_capture() {
        let mut recorder =
            Recorder::from_stream(ScriptedLink::new(b"READY\nERR\n".to_vec()));
        match recorder.record_samples(8000, 10) {
            Err(LinkError::Header(line)) => assert_eq!(line, "ERR"),
            other => panic!("expected header error, got {other:?}"),
        }
    }

    #[test]
    fn truncated_payload_is_reported() {
        let mut response = b"ACK\nDATA,4\n".to_vec();
        response.extend_from_slice(&[1, 2, 3]); // 3 of 8 payload bytes
        let mut recorder = Recorder::from_stream(ScriptedLink::new(response));
        match recorder.record_samples(8000, 4) {
            Err(LinkError::Truncated { expected, got }) => {
                assert_eq!(expected, 8);
                assert_eq!(got, 3);
            }
            other => panic!("expected truncation, got {other:?}"),
        }
    }

    #[test]
    fn missing_done_marker_is_reported() {
        let mut response = b"ACK\nDATA,1\n".to_vec();
        response.extend_from_slice(&7i16.to_le_bytes());
        let mut recorder = Recorder::from_stream(ScriptedLink::new(response));
        assert!(recorder.record_samples(8000, 1).is_err());
    }

    #[test]
    fn garbage_header_is_reported() {
        let mut recorder =
            Recorder::from_stream(ScriptedLink::new(b"READY\nWHAT,3\n".to_vec()));
        assert!(matches!(
            recorder.record_samples(8000, 1),
            Err(LinkError::Header(_))
        ));
    }

    #[test]
    fn rejects_zero_parameters_locally() {
        let mut recorder = Recorder::from_stream(ScriptedLink::new(Vec::new()));
        assert!(recorder.record_samples(0, 100).is_err());
        assert!(recorder.record_samples(8000, 0).is_err());
        assert!(recorder.record(8000, 0.0).is_err());
    }
}
