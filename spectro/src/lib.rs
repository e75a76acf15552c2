//! Host-facing acquisition service for the BOFP1 spectrometer.
//!
//! [`pipeline::Spectro`] queues acquisitions onto the driver and holds the
//! latest capture together with its decode cursor; [`usb::BulkStream`]
//! drains that cursor through a bulk-IN endpoint, one pooled transfer at a
//! time.

pub mod pipeline;
pub mod usb;

pub use pipeline::{Spectro, StreamRead};
pub use usb::{BulkStream, Endpoint};
