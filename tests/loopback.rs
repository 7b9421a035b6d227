//! End-to-end check: the device session's byte stream, parsed back by the
//! host recorder over an in-memory link.

use std::io::{self, Cursor, Read, Write};

use mg24_audio::{
    AdcCalibration, CaptureEngine, Recorder, Session, SineAdc, SystemClock, MAX_SR,
};

/// One-shot link: reads return the pre-recorded device output once a
/// newline-terminated command has been written.
struct ReplayLink {
    device_output: Cursor<Vec<u8>>,
    armed: bool,
}

impl ReplayLink {
    fn new(device_output: Vec<u8>) -> Self {
        Self {
            device_output: Cursor::new(device_output),
            armed: false,
        }
    }
}

impl Read for ReplayLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.armed {
            return Ok(0);
        }
        self.device_output.read(buf)
    }
}

impl Write for ReplayLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.contains(&b'\n') {
            self.armed = true;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn run_device(commands: &[u8]) -> Vec<u8> {
    let calibration = AdcCalibration::new(12).unwrap();
    let adc = SineAdc::new(12, 440, MAX_SR);
    let engine = CaptureEngine::new(adc, SystemClock::new(), calibration);
    let mut session = Session::new(engine);

    let mut output = Vec::new();
    session
        .serve(Cursor::new(commands.to_vec()), &mut output)
        .unwrap();
    output
}

#[test]
fn over_limit_rate_round_trips_with_halved_count() {
    // 1600 samples requested at 16 kHz: the device clamps to 8 kHz and keeps
    // the 100 ms duration, so 800 samples come back.
    let output = run_device(b"REC,16000,1600\n");

    let mut recorder = Recorder::from_stream(ReplayLink::new(output));
    let recording = recorder.record_samples(16_000, 1600).unwrap();
    assert_eq!(recording.samples.len(), 800);
    assert_eq!(recording.sample_rate_hz, 8000);
    // A 440 Hz tone at near-full ADC swing should come back loud.
    let peak = recording.samples.iter().map(|s| s.unsigned_abs()).max();
    assert!(peak.unwrap() > 20_000);
}

#[test]
fn in_range_request_round_trips_exactly() {
    let output = run_device(b"REC,8000,160\n");

    let mut recorder = Recorder::from_stream(ReplayLink::new(output));
    let recording = recorder.record_samples(8000, 160).unwrap();
    assert_eq!(recording.samples.len(), 160);
    assert_eq!(recording.sample_rate_hz, 8000);
}

#[test]
fn device_rejection_surfaces_as_host_error() {
    let output = run_device(b"REC,0,100\n");
    assert!(output.ends_with(b"ERR\n"));

    let mut recorder = Recorder::from_stream(ReplayLink::new(output));
    assert!(recorder.record_samples(8000, 100).is_err());
}
