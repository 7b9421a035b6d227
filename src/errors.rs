use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("malformed command: {0}")]
    Command(String),
    #[error("sample buffer allocation failed")]
    Buffer,
    #[error("unsupported ADC bit depth: {0}")]
    Calibration(u8),
    #[error("unexpected header from device: {0}")]
    Header(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("truncated payload: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
}

pub type Result<T> = std::result::Result<T, LinkError>;
