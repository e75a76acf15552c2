//! Test doubles for the bofp1 driver: a mockall mock over the bus trait and
//! a register-level emulation of the FPGA front-end, complete with fifo,
//! busy/watermark lines and a light source, for integration tests.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use bofp1::hal::{EdgeInput, LightSource, SpiBus};
use bofp1::transport::{REG_RESET, REG_SAMPLE, REG_STATUS, REG_STREAM};
use bofp1::EngineHandle;
use mockall::mock;

mock! {
    pub Bus {}
    impl SpiBus for Bus {
        fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> std::io::Result<()>;
    }
}

/// Fifo occupancy at which the emulated watermark line fires.
pub const WATERMARK_THRESHOLD: usize = 512;

const REG_BIT_WR: u8 = 0x80;

#[derive(Default)]
struct Inner {
    regs: [u8; 16],
    /// Frame loaded into the fifo when a sample is triggered.
    frame: Vec<u8>,
    fifo: Vec<u8>,
    fifo_pos: usize,
    busy: bool,
    busy_edge_sent: bool,
    busy_events: bool,
    watermark_events: bool,
    /// When set, sample triggers are silently dropped.
    stalled: bool,
    /// Caps how much of the frame actually reaches the fifo.
    fifo_limit: Option<usize>,
    light_on: bool,
    writes: Vec<(u8, u8)>,
}

impl Inner {
    fn apply_write(&mut self, addr: u8, value: u8) {
        self.writes.push((addr, value));
        match addr {
            REG_SAMPLE => {
                if self.stalled {
                    return;
                }
                let mut fifo = self.frame.clone();
                if let Some(limit) = self.fifo_limit {
                    fifo.truncate(limit);
                }
                self.fifo = fifo;
                self.fifo_pos = 0;
                self.busy = true;
                self.busy_edge_sent = false;
            }
            REG_RESET => {
                self.fifo.clear();
                self.fifo_pos = 0;
                self.busy = false;
            }
            _ => {
                if let Some(slot) = self.regs.get_mut(addr as usize) {
                    *slot = value;
                }
            }
        }
    }

    fn apply_read(&mut self, addr: u8, out: &mut [u8]) {
        match addr {
            REG_STREAM => {
                for byte in out.iter_mut() {
                    *byte = if self.fifo_pos < self.fifo.len() {
                        let value = self.fifo[self.fifo_pos];
                        self.fifo_pos += 1;
                        value
                    } else {
                        // Real hardware clocks out garbage past the fifo
                        0
                    };
                }
                if self.busy && self.fifo_pos >= self.fifo.len() {
                    self.busy = false;
                }
            }
            _ => {
                let value = self.regs.get(addr as usize).copied().unwrap_or(0);
                for byte in out.iter_mut() {
                    *byte = value;
                }
            }
        }
    }

    fn available(&self) -> usize {
        self.fifo.len() - self.fifo_pos
    }
}

/// Register-level front-end emulation. Hand its [`FakeFrontEnd::bus`],
/// line and lamp adapters to `Engine::new`, then drive the acquisition with
/// [`FakeFrontEnd::run_acquisition`].
#[derive(Clone, Default)]
pub struct FakeFrontEnd {
    inner: Arc<Mutex<Inner>>,
}

enum PumpEvent {
    Watermark,
    Busy,
}

impl FakeFrontEnd {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Loads the frame the next sample will produce, big-endian per word.
    pub fn set_frame_words(&self, words: &[u16]) {
        let mut frame = Vec::with_capacity(words.len() * 2);
        for word in words {
            frame.extend_from_slice(&word.to_be_bytes());
        }
        self.lock().frame = frame;
    }

    pub fn set_uniform_frame(&self, value: u16, elements: usize) {
        self.set_frame_words(&vec![value; elements]);
    }

    /// Makes the device ignore sample triggers, so nothing ever completes.
    pub fn stall(&self, on: bool) {
        self.lock().stalled = on;
    }

    /// Makes the next sample deliver only `bytes` of the frame before the
    /// busy line drops.
    pub fn truncate_fifo(&self, bytes: usize) {
        self.lock().fifo_limit = Some(bytes);
    }

    pub fn set_status(&self, value: u8) {
        self.lock().regs[REG_STATUS as usize] = value;
    }

    /// Every register write seen so far, in order, as `(addr, value)`.
    pub fn writes(&self) -> Vec<(u8, u8)> {
        self.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }

    pub fn reg(&self, addr: u8) -> u8 {
        self.lock().regs.get(addr as usize).copied().unwrap_or(0)
    }

    pub fn light_on(&self) -> bool {
        self.lock().light_on
    }

    pub fn bus(&self) -> FrontEndBus {
        FrontEndBus {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn busy_line(&self) -> BusyLine {
        BusyLine {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn watermark_line(&self) -> WatermarkLine {
        WatermarkLine {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn lamp(&self) -> Lamp {
        Lamp {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Plays the device's side of one acquisition: raises watermark edges
    /// while full chunks are queued and a single busy edge for the
    /// sub-threshold tail, until the engine goes idle. Returns early with
    /// a log message if the engine never settles.
    pub fn run_acquisition(&self, handle: &EngineHandle) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while handle.is_busy() {
            if Instant::now() > deadline {
                log::error!("emulated acquisition did not settle");
                return;
            }
            // Decide under the lock, deliver outside it: the edge entry
            // points take the same lock to mask their event source.
            let event = {
                let mut inner = self.lock();
                let available = inner.available();
                if inner.watermark_events && available >= WATERMARK_THRESHOLD {
                    Some(PumpEvent::Watermark)
                } else if inner.busy_events
                    && available > 0
                    && available < WATERMARK_THRESHOLD
                    && !inner.busy_edge_sent
                {
                    inner.busy_edge_sent = true;
                    Some(PumpEvent::Busy)
                } else {
                    None
                }
            };
            match event {
                Some(PumpEvent::Watermark) => handle.watermark_edge(),
                Some(PumpEvent::Busy) => handle.busy_edge(),
                None => thread::sleep(Duration::from_millis(1)),
            }
        }
    }
}

pub struct FrontEndBus {
    inner: Arc<Mutex<Inner>>,
}

impl SpiBus for FrontEndBus {
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> std::io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if tx.first().is_some_and(|addr| addr & REG_BIT_WR != 0) {
            for pair in tx.chunks_exact(2) {
                inner.apply_write(pair[0] & !REG_BIT_WR, pair[1]);
            }
        } else if let Some(addr) = tx.first() {
            inner.apply_read(*addr, rx);
        }
        Ok(())
    }
}

pub struct BusyLine {
    inner: Arc<Mutex<Inner>>,
}

impl EdgeInput for BusyLine {
    fn enable_events(&self) -> std::io::Result<()> {
        self.inner.lock().unwrap().busy_events = true;
        Ok(())
    }

    fn disable_events(&self) -> std::io::Result<()> {
        self.inner.lock().unwrap().busy_events = false;
        Ok(())
    }

    fn is_asserted(&self) -> std::io::Result<bool> {
        Ok(self.inner.lock().unwrap().busy)
    }
}

pub struct WatermarkLine {
    inner: Arc<Mutex<Inner>>,
}

impl EdgeInput for WatermarkLine {
    fn enable_events(&self) -> std::io::Result<()> {
        self.inner.lock().unwrap().watermark_events = true;
        Ok(())
    }

    fn disable_events(&self) -> std::io::Result<()> {
        self.inner.lock().unwrap().watermark_events = false;
        Ok(())
    }

    fn is_asserted(&self) -> std::io::Result<bool> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.available() >= WATERMARK_THRESHOLD)
    }
}

pub struct Lamp {
    inner: Arc<Mutex<Inner>>,
}

impl LightSource for Lamp {
    fn set_enabled(&mut self, on: bool) -> std::io::Result<()> {
        self.inner.lock().unwrap().light_on = on;
        Ok(())
    }
}
