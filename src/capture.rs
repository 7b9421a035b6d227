//! Audio capture engine: the fixed-period sampling loop and frame transmit path.
//!
//! # Timing
//!
//! Sampling is paced by a busy-wait on a wrapping microsecond clock, the same
//! scheme the firmware uses against the MCU `micros()` counter. The deadline
//! is advanced *before* each ADC read, so loop overhead shifts individual
//! samples slightly but never accumulates into rate drift. The clock is a
//! `u32` that wraps roughly every 71 minutes; deadline comparisons use a
//! wraparound-safe signed difference.

use std::io::Write;
use std::time::Instant;

use log::debug;

use crate::errors::{LinkError, Result};

/// Lead time added to the first sampling deadline so the loop is settled
/// before the first ADC read.
const STARTUP_GUARD_US: u32 = 200;

/// Samples per `write` call when streaming the binary payload.
pub const TX_CHUNK_SAMPLES: usize = 1024;

// ============================================================================
// Hardware Abstraction
// ============================================================================

/// One raw code per call from the microphone ADC.
///
/// Implementations carry their own input-pin selection; the engine only ever
/// asks for the next conversion result.
pub trait Adc {
    fn read(&mut self) -> u16;
}

/// Wrapping microsecond counter, monotonic modulo `u32`.
pub trait Clock {
    fn now_us(&self) -> u32;
}

/// Host-side [`Clock`] backed by `Instant`, wrapping like an MCU tick counter.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_us(&self) -> u32 {
        self.origin.elapsed().as_micros() as u32
    }
}

/// Synthetic microphone producing a pure tone, for the simulator and tests.
pub struct SineAdc {
    midpoint: f32,
    amplitude: f32,
    phase: f32,
    step: f32,
}

impl SineAdc {
    pub fn new(bit_depth: u8, tone_hz: u32, sample_rate_hz: u32) -> Self {
        let midpoint = (1u32 << (bit_depth - 1)) as f32;
        Self {
            midpoint,
            amplitude: midpoint - 1.0,
            phase: 0.0,
            step: std::f32::consts::TAU * tone_hz as f32 / sample_rate_hz as f32,
        }
    }
}

impl Adc for SineAdc {
    fn read(&mut self) -> u16 {
        let value = self.midpoint + self.amplitude * self.phase.sin();
        self.phase = (self.phase + self.step) % std::f32::consts::TAU;
        value as u16
    }
}

// ============================================================================
// Amplitude Mapping
// ============================================================================

/// Maps raw unsigned ADC codes to signed 16-bit PCM.
///
/// Built once at startup from the configured ADC resolution and immutable
/// afterwards. A raw code is centered on the range midpoint, shifted up to
/// full 16-bit scale, and saturated rather than wrapped, which keeps the
/// mapping correct for any resolution without per-board special cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdcCalibration {
    bit_depth: u8,
    midpoint: i32,
    shift: u8,
}

impl AdcCalibration {
    pub fn new(bit_depth: u8) -> Result<Self> {
        if !(8..=16).contains(&bit_depth) {
            return Err(LinkError::Calibration(bit_depth));
        }
        Ok(Self {
            bit_depth,
            midpoint: 1i32 << (bit_depth - 1),
            shift: 16 - bit_depth,
        })
    }

    #[allow(dead_code)]
    pub fn bit_depth(&self) -> u8 {
        self.bit_depth
    }

    /// Convert one raw ADC code to a signed 16-bit PCM sample.
    #[inline]
    pub fn pcm(&self, raw: u16) -> i16 {
        let centered = raw as i32 - self.midpoint;
        let scaled = centered << self.shift;
        scaled.clamp(i16::MIN as i32, i16::MAX as i32) as i16
    }
}

// ============================================================================
// Capture Engine
// ============================================================================

/// Owns the sample buffer and runs the acquisition loop.
///
/// The buffer grows on demand and is never shrunk; its contents are
/// overwritten on each capture. Allocation goes through `try_reserve` so a
/// failed grow is reported (`ERR,BUF` on the wire) instead of aborting, and
/// leaves prior contents intact.
pub struct CaptureEngine<A, C> {
    adc: A,
    clock: C,
    calibration: AdcCalibration,
    buffer: Vec<i16>,
}

impl<A: Adc, C: Clock> CaptureEngine<A, C> {
    pub fn new(adc: A, clock: C, calibration: AdcCalibration) -> Self {
        Self {
            adc,
            clock,
            calibration,
            buffer: Vec::new(),
        }
    }

    #[allow(dead_code)]
    pub fn calibration(&self) -> AdcCalibration {
        self.calibration
    }

    /// Acquire `sample_count` samples at `sample_rate_hz`, blocking until done.
    ///
    /// Exactly one ADC read per output sample, at the nominal period; no
    /// skipping, averaging, or oversampling.
    pub fn capture(&mut self, sample_rate_hz: u32, sample_count: u32) -> Result<&[i16]> {
        let n = sample_count as usize;
        self.ensure_capacity(n)?;

        let period_us = 1_000_000 / sample_rate_hz;
        let started = self.clock.now_us();
        let mut next_tick = started.wrapping_add(STARTUP_GUARD_US);

        for slot in self.buffer[..n].iter_mut() {
            while (self.clock.now_us().wrapping_sub(next_tick) as i32) < 0 {
                std::hint::spin_loop();
            }
            next_tick = next_tick.wrapping_add(period_us);
            *slot = self.calibration.pcm(self.adc.read());
        }

        debug!(
            "captured {} samples at {} Hz in {} us",
            n,
            sample_rate_hz,
            self.clock.now_us().wrapping_sub(started)
        );
        Ok(&self.buffer[..n])
    }

    fn ensure_capacity(&mut self, n: usize) -> Result<()> {
        if self.buffer.len() < n {
            let additional = n - self.buffer.len();
            self.buffer
                .try_reserve(additional)
                .map_err(|_| LinkError::Buffer)?;
            self.buffer.resize(n, 0);
        }
        Ok(())
    }
}

/// Write one complete response frame: `DATA,<n>` header, the samples as raw
/// little-endian bytes in bounded chunks, then the `DONE` marker.
pub fn write_frame<W: Write>(writer: &mut W, samples: &[i16]) -> Result<()> {
    writeln!(writer, "DATA,{}", samples.len())?;

    let mut chunk = [0u8; TX_CHUNK_SAMPLES * 2];
    for block in samples.chunks(TX_CHUNK_SAMPLES) {
        let mut used = 0;
        for &sample in block {
            chunk[used..used + 2].copy_from_slice(&sample.to_le_bytes());
            used += 2;
        }
        writer.write_all(&chunk[..used])?;
    }

    writeln!(writer, "DONE")?;
    writer.flush()?;
    Ok(())
}
