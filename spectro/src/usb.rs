//! Bulk-IN streaming over a vendor endpoint.
//!
//! Transfers come out of a fixed two-buffer pool and at most one is
//! outstanding at a time; the controller hands buffers back through
//! [`BulkStream::on_complete`], which re-pumps while the frame has readings
//! left. The host detects end of frame by the final short transfer.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bofp1::Result;
use bytes::BytesMut;
use scopeguard::{guard, ScopeGuard};

use crate::pipeline::Spectro;

/// Size of each pooled bulk transfer.
pub const TRANSFER_SIZE: usize = 512;

const POOL_BUFFERS: usize = 2;

/// Interval before a pump retry when the pool is exhausted.
const POOL_RETRY: Duration = Duration::from_millis(1);

/// Controller side of a bulk-IN endpoint. `submit` takes ownership of the
/// buffer; the controller gives it back through [`BulkStream::on_complete`]
/// once the transfer finishes. A failed submit consumes the buffer and will
/// never complete.
pub trait Endpoint: Send {
    fn submit(&mut self, buf: BytesMut) -> io::Result<()>;
}

struct BufPool {
    free: Mutex<Vec<BytesMut>>,
}

impl BufPool {
    fn new() -> Self {
        BufPool {
            free: Mutex::new(
                (0..POOL_BUFFERS)
                    .map(|_| BytesMut::with_capacity(TRANSFER_SIZE))
                    .collect(),
            ),
        }
    }

    fn acquire(&self) -> Option<BytesMut> {
        self.free.lock().unwrap().pop()
    }

    fn release(&self, mut buf: BytesMut) {
        buf.clear();
        let mut free = self.free.lock().unwrap();
        if free.len() < POOL_BUFFERS {
            free.push(buf);
        }
    }

    /// Replaces a buffer lost to a failed submit.
    fn restock(&self) {
        self.release(BytesMut::with_capacity(TRANSFER_SIZE));
    }
}

struct Inner {
    source: Spectro,
    endpoint: Mutex<Box<dyn Endpoint>>,
    pool: BufPool,
    enabled: AtomicBool,
    /// One transfer outstanding at a time; a pump while set is a no-op.
    in_flight: AtomicBool,
    /// The last stream read reported more of the frame remaining.
    pending: AtomicBool,
}

/// Bulk-IN transmission state machine; cheap to clone.
#[derive(Clone)]
pub struct BulkStream {
    inner: Arc<Inner>,
}

impl BulkStream {
    pub fn new(source: Spectro, endpoint: Box<dyn Endpoint>) -> Self {
        BulkStream {
            inner: Arc::new(Inner {
                source,
                endpoint: Mutex::new(endpoint),
                pool: BufPool::new(),
                enabled: AtomicBool::new(false),
                in_flight: AtomicBool::new(false),
                pending: AtomicBool::new(false),
            }),
        }
    }

    /// Class enabled by the host. Nothing is transmitted until a frame is
    /// queued via [`BulkStream::begin_read`].
    pub fn enable(&self) {
        self.inner.enabled.store(true, Ordering::SeqCst);
    }

    /// Class disabled; in-flight transfers still complete but nothing new
    /// starts.
    pub fn disable(&self) {
        self.inner.enabled.store(false, Ordering::SeqCst);
        self.inner.pending.store(false, Ordering::SeqCst);
    }

    /// Host requested a frame: queue one acquisition and start streaming
    /// once its capture is installed.
    pub fn begin_read(&self) -> Result<()> {
        let stream = self.clone();
        self.inner.source.sample(move || stream.pump())
    }

    /// Starts the next transfer if the stream is enabled and none is in
    /// flight.
    pub fn pump(&self) {
        let inner = &self.inner;
        if !inner.enabled.load(Ordering::SeqCst) {
            return;
        }
        if inner.in_flight.swap(true, Ordering::SeqCst) {
            return;
        }
        let clear = guard(inner, |inner| {
            inner.in_flight.store(false, Ordering::SeqCst);
        });

        let Some(mut buf) = inner.pool.acquire() else {
            // Both buffers tied up; let completions catch up and retry
            drop(clear);
            let stream = self.clone();
            thread::spawn(move || {
                thread::sleep(POOL_RETRY);
                stream.pump();
            });
            return;
        };

        buf.resize(TRANSFER_SIZE, 0);
        let read = match inner.source.stream_read(&mut buf) {
            Ok(read) => read,
            Err(err) => {
                log::warn!("stream read failed: {err}");
                inner.pool.release(buf);
                return;
            }
        };
        if read.written == 0 && !read.more {
            // Frame fully drained; the previous short transfer told the host
            inner.pool.release(buf);
            return;
        }
        buf.truncate(read.written);
        inner.pending.store(read.more, Ordering::SeqCst);

        if let Err(err) = inner.endpoint.lock().unwrap().submit(buf) {
            log::warn!("bulk-in submit failed: {err}");
            inner.pool.restock();
            inner.pending.store(false, Ordering::SeqCst);
            return;
        }
        // Transfer owns the flag until on_complete
        ScopeGuard::into_inner(clear);
    }

    /// Transfer completion from the controller: recycles the buffer and
    /// keeps draining the frame.
    pub fn on_complete(&self, buf: BytesMut) {
        self.inner.pool.release(buf);
        self.inner.in_flight.store(false, Ordering::SeqCst);
        if self.inner.pending.swap(false, Ordering::SeqCst) {
            self.pump();
        }
    }
}
