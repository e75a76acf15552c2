//! Acquisition queue and readout cursor.
//!
//! Samples are serialized through a short job queue onto a worker thread:
//! each job runs one acquisition to completion, installs the capture as the
//! current readout context, and only then notifies the requester. Readout is
//! pull-based: [`Spectro::stream_read`] converts readings to big-endian
//! millivolt words from wherever the cursor left off, so a transport can
//! drain a frame in arbitrary chunk sizes.

use std::sync::{Arc, Mutex};
use std::thread;

use bofp1::decoder::{self, Channel, Reading};
use bofp1::{Completion, Engine, Error, Pipeline, Result};
use bytes::BytesMut;
use crossbeam_channel::{bounded, Receiver, Sender};

/// Pending acquisitions the queue holds before rejecting submissions.
const QUEUE_DEPTH: usize = 2;

/// Readings decoded per pass while filling a destination slice.
const DECODE_CHUNK: usize = 256;

type Job = Box<dyn FnOnce() + Send>;

/// Outcome of one [`Spectro::stream_read`] call.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct StreamRead {
    /// Bytes written into the destination.
    pub written: usize,
    /// Whether the current capture has readings left beyond the cursor.
    pub more: bool,
}

struct ReadCtx {
    /// Latest completed capture, raw driver layout.
    capture: Option<BytesMut>,
    /// Readings already streamed out of it.
    fit: usize,
}

struct Inner {
    engine: Engine,
    ctx: Mutex<ReadCtx>,
}

/// Handle to the acquisition service; cheap to clone.
#[derive(Clone)]
pub struct Spectro {
    inner: Arc<Inner>,
    jobs: Sender<Job>,
}

impl Spectro {
    /// Takes ownership of the driver and starts the acquisition worker.
    pub fn new(engine: Engine) -> Result<Self> {
        let inner = Arc::new(Inner {
            engine,
            ctx: Mutex::new(ReadCtx {
                capture: None,
                fit: 0,
            }),
        });
        let (jobs, job_rx) = bounded::<Job>(QUEUE_DEPTH);
        thread::Builder::new()
            .name("spectro-aq".into())
            .spawn(move || worker(job_rx))
            .map_err(Error::Bus)?;
        Ok(Spectro { inner, jobs })
    }

    /// Queues one acquisition, failing immediately with [`Error::Busy`] when
    /// the queue is full. `entry` runs on the worker thread after the
    /// capture has been installed as the readout context; on acquisition
    /// failure the error is logged and `entry` is never invoked, leaving the
    /// previous context untouched.
    pub fn sample(&self, entry: impl FnOnce() + Send + 'static) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let job: Job = Box::new(move || {
            let (tx, rx) = bounded(1);
            let completion: Completion = Box::new(move |res| {
                let _ = tx.send(res);
            });
            if let Err(err) = inner.engine.submit(completion) {
                log::warn!("could not start acquisition: {err}");
                return;
            }
            match rx.recv() {
                Ok(Ok(capture)) => {
                    {
                        let mut ctx = inner.ctx.lock().unwrap();
                        ctx.capture = Some(capture.into_bytes());
                        ctx.fit = 0;
                    }
                    entry();
                }
                Ok(Err(err)) => log::warn!("acquisition failed: {err}"),
                Err(_) => log::warn!("driver dropped the completion"),
            }
        });
        self.jobs.try_send(job).map_err(|_| Error::Busy)
    }

    /// Streams decoded readings as big-endian millivolt words into `dst`,
    /// advancing the readout cursor. Fills `dst` whole except on the final
    /// chunk of a frame. A decode failure tears down the current context and
    /// reports the stream as complete; the frame is lost, not retried.
    pub fn stream_read(&self, dst: &mut [u8]) -> Result<StreamRead> {
        let mut guard = self.inner.ctx.lock().unwrap();
        let ReadCtx { capture, fit } = &mut *guard;
        let Some(buf) = capture.as_ref() else {
            return Ok(StreamRead {
                written: 0,
                more: false,
            });
        };
        let frames = decoder::frame_count(buf, Channel::Voltage)? as usize;

        let mut out = [Reading::default(); DECODE_CHUNK];
        let mut written = 0;
        let mut failed = false;
        while written + 2 <= dst.len() {
            let room = (dst.len() - written) / 2;
            let n = match decoder::decode(
                buf,
                Channel::Voltage,
                fit,
                room.min(DECODE_CHUNK),
                &mut out,
            ) {
                Ok(n) => n,
                Err(err) => {
                    log::warn!("decode failed, dropping frame: {err}");
                    failed = true;
                    break;
                }
            };
            if n == 0 {
                break;
            }
            for reading in &out[..n] {
                dst[written..written + 2].copy_from_slice(&reading.millivolts().to_be_bytes());
                written += 2;
            }
        }

        if failed {
            *capture = None;
            *fit = 0;
            return Ok(StreamRead {
                written: 0,
                more: false,
            });
        }
        Ok(StreamRead {
            written,
            more: *fit < frames,
        })
    }

    pub fn set_integration_time_us(&self, time_us: u32) -> Result<()> {
        self.inner.engine.set_integration_time_us(time_us)
    }

    pub fn integration_time_us(&self) -> u32 {
        self.inner.engine.integration_time_us()
    }

    pub fn set_pipeline(&self, pipeline: Pipeline) -> Result<()> {
        self.inner.engine.set_pipeline(pipeline)
    }

    pub fn pipeline(&self) -> Pipeline {
        self.inner.engine.pipeline()
    }

    pub fn set_moving_avg_n(&self, n: u8) -> Result<()> {
        self.inner.engine.set_moving_avg_n(n)
    }

    pub fn set_total_avg_n(&self, n: u8) -> Result<()> {
        self.inner.engine.set_total_avg_n(n)
    }
}

fn worker(jobs: Receiver<Job>) {
    for job in jobs {
        job();
    }
    log::debug!("acquisition worker exiting");
}
