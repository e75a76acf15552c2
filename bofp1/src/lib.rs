//! Driver for the BOFP-1 FPGA spectrometer front-end.
//!
//! The front-end wraps a TCD1304-class linear CCD behind a bank of SPI
//! registers: the host writes timing and pipeline registers, triggers a
//! sample, and streams the captured frame out of a fifo, paced by two GPIO
//! lines (sensor busy and fifo watermark). This crate provides the register
//! transport, the interrupt-driven acquisition engine and the frame decoder;
//! the hardware itself is reached through the [`hal`] traits so the driver
//! runs unchanged against a real bus or a test double.

pub mod config;
pub mod decoder;
mod engine;
mod error;
pub mod hal;
pub mod transport;

pub use config::{DeviceConfig, Pipeline, NUM_ELEMENTS_TOTAL};
pub use decoder::{Channel, Reading};
pub use engine::{Capture, Completion, Engine, EngineHandle};
pub use error::{Error, Result};
