//! Trait seams for the hardware primitives the driver is built on top of.
//!
//! Bus transfers, GPIO edge sources and the light source are platform
//! concerns; the driver only ever talks to them through these traits so that
//! tests can substitute software implementations.

use std::io;

/// Synchronous serial bus. One call covers one chip-select window.
///
/// Implementations block until the transfer is done and must only be called
/// from worker context, never from an interrupt handler.
pub trait SpiBus: Send {
    /// Clocks out `tx`, then clocks in `rx.len()` bytes within the same
    /// chip-select window.
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<()>;
}

impl<T: SpiBus + ?Sized> SpiBus for Box<T> {
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<()> {
        (**self).transfer(tx, rx)
    }
}

/// A GPIO line that can generate edge events.
///
/// Edge delivery itself happens out of band: the platform's interrupt handler
/// calls [`crate::EngineHandle::busy_edge`] or
/// [`crate::EngineHandle::watermark_edge`]. This trait only controls whether
/// those events are generated, and samples the current level.
pub trait EdgeInput: Send + Sync {
    fn enable_events(&self) -> io::Result<()>;
    fn disable_events(&self) -> io::Result<()>;
    fn is_asserted(&self) -> io::Result<bool>;
}

/// On/off light source used for dark-current calibration.
pub trait LightSource: Send {
    fn set_enabled(&mut self, on: bool) -> io::Result<()>;
}
