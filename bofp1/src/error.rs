use core::result::Result as CoreResult;
use thiserror::Error;

pub type Result<T> = CoreResult<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("An acquisition is already in flight")]
    Busy,
    #[error("Acquisition did not complete before the watchdog deadline")]
    Timeout,
    #[error("Device broke the stream-out protocol: {0}")]
    Protocol(&'static str),
    #[error("Out of transaction or buffer memory")]
    OutOfMemory,
    #[error("Channel is not supported by this decoder")]
    Unsupported,
    #[error("Requested value cannot be expressed by the device: {0}")]
    InvalidArgument(&'static str),
    #[error("Bus error: {0}")]
    Bus(#[from] std::io::Error),
}
