use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GpioError {
    #[error("Pin {0} is outside the configured valid set")]
    InvalidPinNumber(u32),
    #[error("Pin {0} is already allocated")]
    PinAlreadyAllocated(u32),
    #[error("Pin {0} is not allocated")]
    PinNotAllocated(u32),
    #[error("Pin {0} has a fixed direction")]
    UnsupportedDirectionChange(u32),
    #[error("Pin {0} does not support edge interrupts")]
    UnsupportedEdgeInterrupt(u32),
    #[error("Invalid configuration value: {0}")]
    InvalidConfigurationValue(String),
    #[error("Interrupt wait failed: {0}")]
    WaitFailure(nix::errno::Errno),
    #[error("Value handle for pin {0} is not open")]
    ValueHandleNotOpen(u32),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
