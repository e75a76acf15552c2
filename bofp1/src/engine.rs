//! Acquisition state machine.
//!
//! One acquisition walks Idle → Flushing → [Calibrating] → Integrating →
//! Streaming → Finishing (or Erroring) → Idle. All bus traffic happens on a
//! dedicated worker thread fed by a bounded event queue; the interrupt-facing
//! entry points on [`EngineHandle`] only mask the GPIO event source and push
//! an event, so they are safe to call from contexts that must not block.
//! The watchdog is the worker's receive deadline: if no event arrives before
//! the modelled worst-case acquisition time, the device is reset and
//! reconfigured and the request completes with [`Error::Timeout`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use bytes::{BufMut, BytesMut};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use scopeguard::{guard, ScopeGuard};

use crate::config::{self, DeviceConfig, Pipeline};
use crate::decoder::HEADER_SIZE;
use crate::error::{Error, Result};
use crate::hal::{EdgeInput, LightSource, SpiBus};
use crate::transport::{
    Step, Transport, REG_CALIBRATE, REG_CCD_SH1, REG_CCD_SH2, REG_CCD_SH3, REG_FLUSH,
    REG_MOVING_AVG_N, REG_PIPELINE, REG_RESET, REG_SAMPLE, REG_STATUS, REG_TOTAL_AVG_N,
};

/// Bytes pulled per fifo watermark, chained with one status-register read.
const READ_CHUNK: usize = 256 * 2;

const EVENT_QUEUE_DEPTH: usize = 8;

/// A completed acquisition: frame-count header plus raw sensor words, ready
/// for [`crate::decoder`].
#[derive(Debug)]
pub struct Capture {
    buf: BytesMut,
}

impl Capture {
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> BytesMut {
        self.buf
    }
}

/// Invoked exactly once per successfully submitted request, from the engine
/// worker thread.
pub type Completion = Box<dyn FnOnce(Result<Capture>) + Send>;

enum Event {
    Submit(Completion),
    BusyEdge,
    WatermarkEdge,
    Shutdown,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Phase {
    Idle,
    Flushing,
    Calibrating,
    Integrating,
    Streaming,
    Finishing,
    Erroring,
}

/// Configuration registers mirrored on the host side; rewritten wholesale
/// during error recovery.
#[derive(Clone, Copy)]
struct Tunables {
    shutter_div: u32,
    pipeline: Pipeline,
    moving_avg_n: u8,
    total_avg_n: u8,
}

struct Shared {
    cfg: DeviceConfig,
    /// Single-flight flag: test-and-set on submit, cleared at Idle.
    busy: AtomicBool,
    bus: Mutex<Transport<Box<dyn SpiBus>>>,
    light: Option<Mutex<Box<dyn LightSource>>>,
    busy_line: Box<dyn EdgeInput>,
    watermark_line: Box<dyn EdgeInput>,
    tunables: Mutex<Tunables>,
}

pub struct Engine {
    shared: Arc<Shared>,
    tx: Sender<Event>,
    worker: Option<JoinHandle<()>>,
}

impl Engine {
    /// Opens the device: applies the configured shutter divisor, pipeline
    /// flags and averaging counts, then starts the worker.
    pub fn new(
        cfg: DeviceConfig,
        bus: impl SpiBus + 'static,
        busy_line: impl EdgeInput + 'static,
        watermark_line: impl EdgeInput + 'static,
        light: Option<Box<dyn LightSource>>,
    ) -> Result<Self> {
        let mut transport = Transport::new(Box::new(bus) as Box<dyn SpiBus>);
        let shutter_div = cfg.shutter_divisor(cfg.integration_time_us)?;
        let tunables = Tunables {
            shutter_div,
            pipeline: cfg.pipeline,
            moving_avg_n: cfg.moving_avg_n,
            total_avg_n: cfg.total_avg_n,
        };
        write_config(&mut transport, &tunables)?;

        let shared = Arc::new(Shared {
            cfg,
            busy: AtomicBool::new(false),
            bus: Mutex::new(transport),
            light: light.map(Mutex::new),
            busy_line: Box::new(busy_line),
            watermark_line: Box::new(watermark_line),
            tunables: Mutex::new(tunables),
        });

        let (tx, rx) = bounded(EVENT_QUEUE_DEPTH);
        let worker = thread::Builder::new()
            .name("bofp1".into())
            .spawn({
                let shared = Arc::clone(&shared);
                move || {
                    Worker {
                        shared,
                        rx,
                        phase: Phase::Idle,
                        active: None,
                    }
                    .run()
                }
            })
            .map_err(Error::Bus)?;

        Ok(Engine {
            shared,
            tx,
            worker: Some(worker),
        })
    }

    /// Handle for the interrupt wiring; cheap to clone.
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            shared: Arc::clone(&self.shared),
            tx: self.tx.clone(),
        }
    }

    /// Submits one acquisition. At most one may be in flight: a second
    /// submit before the first completes fails with [`Error::Busy`] without
    /// touching the in-flight request. On `Err` the completion is dropped
    /// uninvoked.
    pub fn submit(&self, completion: Completion) -> Result<()> {
        if self.shared.busy.swap(true, Ordering::SeqCst) {
            return Err(Error::Busy);
        }
        let clear = guard(&self.shared, |s| s.busy.store(false, Ordering::SeqCst));
        self.tx
            .try_send(Event::Submit(completion))
            .map_err(|err| match err {
                TrySendError::Full(_) => Error::OutOfMemory,
                TrySendError::Disconnected(_) => {
                    log::error!("engine worker is gone");
                    Error::OutOfMemory
                }
            })?;
        ScopeGuard::into_inner(clear);
        Ok(())
    }

    /// Writes a new shutter divisor derived from `time_us`. The cached value
    /// only changes if the register write succeeds.
    pub fn set_integration_time_us(&self, time_us: u32) -> Result<()> {
        let div = self.shared.cfg.shutter_divisor(time_us)?;
        let sh = div.to_be_bytes();
        self.shared.bus.lock().unwrap().write_regs(&[
            (REG_CCD_SH1, sh[1]),
            (REG_CCD_SH2, sh[2]),
            (REG_CCD_SH3, sh[3]),
        ])?;
        self.shared.tunables.lock().unwrap().shutter_div = div;
        Ok(())
    }

    pub fn integration_time_us(&self) -> u32 {
        let div = self.shared.tunables.lock().unwrap().shutter_div;
        self.shared.cfg.integration_time_us(div)
    }

    pub fn set_pipeline(&self, pipeline: Pipeline) -> Result<()> {
        self.shared
            .bus
            .lock()
            .unwrap()
            .write_reg(REG_PIPELINE, pipeline.bits())?;
        self.shared.tunables.lock().unwrap().pipeline = pipeline;
        Ok(())
    }

    pub fn pipeline(&self) -> Pipeline {
        self.shared.tunables.lock().unwrap().pipeline
    }

    pub fn set_moving_avg_n(&self, n: u8) -> Result<()> {
        self.shared
            .bus
            .lock()
            .unwrap()
            .write_reg(REG_MOVING_AVG_N, n)?;
        self.shared.tunables.lock().unwrap().moving_avg_n = n;
        Ok(())
    }

    pub fn moving_avg_n(&self) -> u8 {
        self.shared.tunables.lock().unwrap().moving_avg_n
    }

    pub fn set_total_avg_n(&self, n: u8) -> Result<()> {
        self.shared
            .bus
            .lock()
            .unwrap()
            .write_reg(REG_TOTAL_AVG_N, n)?;
        self.shared.tunables.lock().unwrap().total_avg_n = n;
        Ok(())
    }

    pub fn total_avg_n(&self) -> u8 {
        self.shared.tunables.lock().unwrap().total_avg_n
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // The queue may be momentarily full; the worker keeps draining, so a
        // blocking send always lands and the join never hangs.
        if self.tx.send(Event::Shutdown).is_ok() {
            if let Some(worker) = self.worker.take() {
                let _ = worker.join();
            }
        }
    }
}

/// Clonable handle for interrupt wiring and ad-hoc polling.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<Shared>,
    tx: Sender<Event>,
}

impl EngineHandle {
    /// Busy-line falling edge. Interrupt context: never blocks, only hands
    /// off to the worker.
    pub fn busy_edge(&self) {
        if self.tx.try_send(Event::BusyEdge).is_err() {
            log::error!("event queue full; busy edge dropped");
        }
    }

    /// Fifo watermark edge. Interrupt context: masks the watermark source
    /// (the worker re-arms it after draining a chunk) and hands off.
    pub fn watermark_edge(&self) {
        if let Err(err) = self.shared.watermark_line.disable_events() {
            log::warn!("unable to mask watermark events: {err}");
        }
        if self.tx.try_send(Event::WatermarkEdge).is_err() {
            log::error!("event queue full; watermark edge dropped");
        }
    }

    /// Whether an acquisition is currently in flight.
    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::SeqCst)
    }
}

fn write_config(transport: &mut Transport<Box<dyn SpiBus>>, t: &Tunables) -> Result<()> {
    let sh = t.shutter_div.to_be_bytes();
    transport.write_regs(&[
        (REG_CCD_SH1, sh[1]),
        (REG_CCD_SH2, sh[2]),
        (REG_CCD_SH3, sh[3]),
    ])?;
    transport.write_regs(&[
        (REG_PIPELINE, t.pipeline.bits()),
        (REG_MOVING_AVG_N, t.moving_avg_n),
        (REG_TOTAL_AVG_N, t.total_avg_n),
    ])?;
    Ok(())
}

struct Active {
    completion: Completion,
    buf: BytesMut,
    /// Payload bytes received so far.
    cursor: usize,
    frame_bytes: usize,
    deadline: Instant,
    status_flags: u8,
}

struct Worker {
    shared: Arc<Shared>,
    rx: Receiver<Event>,
    phase: Phase,
    active: Option<Active>,
}

impl Worker {
    fn run(mut self) {
        loop {
            let deadline = self.active.as_ref().map(|a| a.deadline);
            let event = match deadline {
                Some(deadline) => match self.rx.recv_deadline(deadline) {
                    Ok(event) => event,
                    Err(RecvTimeoutError::Timeout) => {
                        log::error!("acquisition timed out in {:?}", self.phase);
                        self.erroring(Error::Timeout);
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match self.rx.recv() {
                    Ok(event) => event,
                    Err(_) => break,
                },
            };

            match event {
                Event::Submit(completion) => self.begin(completion),
                Event::BusyEdge | Event::WatermarkEdge => self.drain(),
                Event::Shutdown => break,
            }
        }
    }

    fn begin(&mut self, completion: Completion) {
        let t = *self.shared.tunables.lock().unwrap();
        let elements = config::effective_elements(t.pipeline, t.moving_avg_n);
        let frame_bytes = elements * 2;

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + frame_bytes);
        buf.put_u16(elements as u16);
        buf.resize(HEADER_SIZE + frame_bytes, 0);

        let budget = self
            .shared
            .cfg
            .watchdog_budget(t.shutter_div, t.pipeline, t.total_avg_n);
        self.active = Some(Active {
            completion,
            buf,
            cursor: 0,
            frame_bytes,
            deadline: Instant::now() + budget,
            status_flags: 0,
        });

        self.phase = Phase::Flushing;
        if let Err(err) = self.prime(&t) {
            self.erroring(err);
            return;
        }

        // Watchdog runs from the start of integration, not from submit
        if let Some(active) = self.active.as_mut() {
            active.deadline = Instant::now() + budget;
        }
        self.phase = Phase::Integrating;
        log::debug!("integrating; watchdog budget {:?}", budget);
    }

    /// Flush, optional dark-current calibration, then trigger the sample and
    /// arm both edge sources.
    fn prime(&mut self, t: &Tunables) -> Result<()> {
        let dark = t.pipeline.dark_current && self.shared.light.is_some();

        if dark {
            self.set_light(false)?;
            thread::sleep(config::LIGHT_SETTLE);
        }
        self.shared.bus.lock().unwrap().write_reg(REG_FLUSH, 0)?;

        if dark {
            self.phase = Phase::Calibrating;
            log::debug!("dark-current calibration pass");
            self.shared.bus.lock().unwrap().write_reg(REG_CALIBRATE, 0)?;
            self.set_light(true)?;
            thread::sleep(config::CALIBRATION_TIME);
        }

        self.shared.bus.lock().unwrap().write_reg(REG_SAMPLE, 0)?;
        self.shared.busy_line.enable_events()?;
        self.shared.watermark_line.enable_events()?;
        Ok(())
    }

    /// Shared entry for both edge sources. Idempotent: once the frame is
    /// complete (or nothing is in flight) further edges are no-ops, so a
    /// busy edge and a watermark edge racing for the same bytes cannot
    /// double-advance the cursor.
    fn drain(&mut self) {
        match self.drain_step() {
            Ok(true) => self.finish(),
            Ok(false) => {}
            Err(err) => self.erroring(err),
        }
    }

    fn drain_step(&mut self) -> Result<bool> {
        let Some(active) = self.active.as_mut() else {
            log::debug!("edge with no acquisition in flight");
            return Ok(false);
        };
        if active.cursor >= active.frame_bytes {
            log::warn!("duplicate read detected");
            return Ok(false);
        }
        self.phase = Phase::Streaming;

        let remaining = active.frame_bytes - active.cursor;
        let size = remaining.min(READ_CHUNK);
        let start = HEADER_SIZE + active.cursor;
        log::debug!("cursor: {}, chunk: {}", active.cursor, size);

        // Stream chunk and status register as one chained transaction
        let status = {
            let mut bus = self.shared.bus.lock().unwrap();
            bus.stream_read(&mut active.buf[start..start + size])?;
            bus.read_reg(REG_STATUS)?
        };
        active.status_flags = status;
        active.cursor += size;

        if active.cursor >= active.frame_bytes {
            return Ok(true);
        }
        if !self.shared.busy_line.is_asserted()? {
            log::error!("sensor completed while stream bytes are outstanding");
            return Err(Error::Protocol("device idle with stream bytes outstanding"));
        }
        self.shared.watermark_line.enable_events()?;
        Ok(false)
    }

    fn finish(&mut self) {
        self.phase = Phase::Finishing;
        let Some(active) = self.active.take() else {
            return;
        };
        if active.status_flags != 0 {
            // The payload is still handed over; the consumer decides
            log::warn!(
                "device status {:#04x} after capture; frame may be malformed",
                active.status_flags
            );
        }
        self.teardown();
        log::info!("acquisition done ({} payload bytes)", active.frame_bytes);
        (active.completion)(Ok(Capture { buf: active.buf }));
        self.phase = Phase::Idle;
    }

    /// Reset the front-end and re-apply every configuration register, then
    /// surface `err` through the completion. The device must never be left
    /// in an unknown register state after a failure.
    fn erroring(&mut self, err: Error) {
        self.phase = Phase::Erroring;
        log::info!("resetting front-end: {err}");

        let t = *self.shared.tunables.lock().unwrap();
        let sh = t.shutter_div.to_be_bytes();
        let recovered = {
            let mut bus = self.shared.bus.lock().unwrap();
            bus.run(&mut [
                // The FPGA needs clock cycles to carry out the reset, so it
                // stays its own tiny write ahead of the reconfiguration
                Step::Write(&[(REG_RESET, 0)]),
                Step::Write(&[
                    (REG_CCD_SH1, sh[1]),
                    (REG_CCD_SH2, sh[2]),
                    (REG_CCD_SH3, sh[3]),
                ]),
                Step::Write(&[
                    (REG_PIPELINE, t.pipeline.bits()),
                    (REG_MOVING_AVG_N, t.moving_avg_n),
                    (REG_TOTAL_AVG_N, t.total_avg_n),
                ]),
            ])
        };
        if let Err(reset_err) = recovered {
            log::error!("reset and reconfigure failed: {reset_err}");
        }

        self.teardown();
        if let Some(active) = self.active.take() {
            (active.completion)(Err(err));
        }
        self.phase = Phase::Idle;
    }

    fn teardown(&self) {
        if let Err(err) = self.shared.busy_line.disable_events() {
            log::warn!("unable to mask busy events: {err}");
        }
        if let Err(err) = self.shared.watermark_line.disable_events() {
            log::warn!("unable to mask watermark events: {err}");
        }
        if let Err(err) = self.set_light(false) {
            log::warn!("unable to release light source: {err}");
        }
        self.shared.busy.store(false, Ordering::SeqCst);
    }

    fn set_light(&self, on: bool) -> Result<()> {
        if let Some(light) = &self.shared.light {
            light.lock().unwrap().set_enabled(on)?;
        }
        Ok(())
    }
}
