use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bofp1::{DeviceConfig, Engine, EngineHandle, Error, Pipeline, NUM_ELEMENTS_TOTAL};
use bytes::BytesMut;
use claims::*;
use crossbeam_channel::bounded;
use spectro::{BulkStream, Endpoint, Spectro, StreamRead};
use utilities::FakeFrontEnd;

fn config() -> DeviceConfig {
    DeviceConfig {
        clock_hz: 8_000_000,
        prescaler: 8,
        integration_time_us: 100,
        pipeline: Pipeline::default(),
        moving_avg_n: 0,
        total_avg_n: 0,
    }
}

fn service(fe: &FakeFrontEnd) -> (Spectro, EngineHandle) {
    let _ = env_logger::builder().is_test(true).try_init();
    let engine = Engine::new(
        config(),
        fe.bus(),
        fe.busy_line(),
        fe.watermark_line(),
        None,
    )
    .unwrap();
    let handle = engine.handle();
    (Spectro::new(engine).unwrap(), handle)
}

/// Runs one acquisition to completion and waits for the readout context to
/// be installed.
fn sample_blocking(fe: &FakeFrontEnd, spectro: &Spectro, handle: &EngineHandle) {
    let (tx, rx) = bounded(1);
    assert_ok!(spectro.sample(move || {
        let _ = tx.send(());
    }));
    // The submit happens on the acquisition worker; wait for it to land
    wait_for(|| handle.is_busy());
    fe.run_acquisition(handle);
    assert_ok!(rx.recv_timeout(Duration::from_secs(5)));
}

fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(Instant::now() < deadline, "condition never settled");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn frame_streams_out_in_chunks() {
    let fe = FakeFrontEnd::new();
    fe.set_uniform_frame(0x8000, NUM_ELEMENTS_TOTAL);
    let (spectro, handle) = service(&fe);
    sample_blocking(&fe, &spectro, &handle);

    // 3648 readings, two bytes each: 14 full chunks and a short tail
    let mut chunk = [0u8; 512];
    for _ in 0..14 {
        assert_ok_eq!(
            spectro.stream_read(&mut chunk),
            StreamRead {
                written: 512,
                more: true
            }
        );
        // 0x8000 raw is full scale over two volts: 1000 mV, big-endian
        assert_eq!(&chunk[..2], &[0x03, 0xE8]);
    }
    assert_ok_eq!(
        spectro.stream_read(&mut chunk),
        StreamRead {
            written: 128,
            more: false
        }
    );
    // The cursor stays drained until the next sample
    assert_ok_eq!(
        spectro.stream_read(&mut chunk),
        StreamRead {
            written: 0,
            more: false
        }
    );
}

#[test]
fn stream_read_before_any_sample_is_empty() {
    let fe = FakeFrontEnd::new();
    let (spectro, _handle) = service(&fe);

    let mut chunk = [0u8; 512];
    assert_ok_eq!(
        spectro.stream_read(&mut chunk),
        StreamRead {
            written: 0,
            more: false
        }
    );
}

#[test]
fn new_sample_rewinds_the_cursor() {
    let fe = FakeFrontEnd::new();
    fe.set_uniform_frame(0x8000, NUM_ELEMENTS_TOTAL);
    let (spectro, handle) = service(&fe);
    sample_blocking(&fe, &spectro, &handle);

    let mut chunk = [0u8; 512];
    assert_ok_eq!(
        spectro.stream_read(&mut chunk),
        StreamRead {
            written: 512,
            more: true
        }
    );

    // Second acquisition replaces the context and starts over
    fe.set_uniform_frame(0xFFFF, NUM_ELEMENTS_TOTAL);
    sample_blocking(&fe, &spectro, &handle);
    assert_ok_eq!(
        spectro.stream_read(&mut chunk),
        StreamRead {
            written: 512,
            more: true
        }
    );
    // 0xFFFF raw clips just under full scale: 1999 mV
    assert_eq!(&chunk[..2], &[0x07, 0xCF]);
}

#[test]
fn overfull_queue_rejects_with_busy() {
    let fe = FakeFrontEnd::new();
    fe.set_uniform_frame(0x8000, NUM_ELEMENTS_TOTAL);
    // Sampling stalls, so queued jobs only drain on watchdog timeouts
    fe.stall(true);
    let (spectro, _handle) = service(&fe);

    assert_ok!(spectro.sample(|| {}));
    // Let the worker pick the first job up and block on it
    thread::sleep(Duration::from_millis(20));
    assert_ok!(spectro.sample(|| {}));
    assert_ok!(spectro.sample(|| {}));
    assert_matches!(spectro.sample(|| {}), Err(Error::Busy));
}

#[derive(Clone, Default)]
struct FakeEndpoint {
    transfers: Arc<Mutex<Vec<BytesMut>>>,
}

impl FakeEndpoint {
    fn take(&self) -> Option<BytesMut> {
        self.transfers.lock().unwrap().pop()
    }

    fn outstanding(&self) -> usize {
        self.transfers.lock().unwrap().len()
    }
}

impl Endpoint for FakeEndpoint {
    fn submit(&mut self, buf: BytesMut) -> std::io::Result<()> {
        self.transfers.lock().unwrap().push(buf);
        Ok(())
    }
}

#[test]
fn begin_read_drives_one_acquisition_through_the_endpoint() {
    let fe = FakeFrontEnd::new();
    fe.set_uniform_frame(0x8000, NUM_ELEMENTS_TOTAL);
    let (spectro, handle) = service(&fe);
    let endpoint = FakeEndpoint::default();
    let stream = BulkStream::new(spectro, Box::new(endpoint.clone()));
    stream.enable();

    assert_ok!(stream.begin_read());
    wait_for(|| handle.is_busy());
    fe.run_acquisition(&handle);

    // Complete transfers one by one; never more than one outstanding
    let mut lens = Vec::new();
    loop {
        wait_for(|| endpoint.outstanding() > 0);
        assert_eq!(endpoint.outstanding(), 1);
        let buf = endpoint.take().unwrap();
        let done = buf.len() < 512;
        lens.push(buf.len());
        stream.on_complete(buf);
        if done {
            break;
        }
    }
    assert_eq!(lens.len(), 15);
    assert!(lens[..14].iter().all(|&len| len == 512));
    assert_eq!(lens[14], 128);
    assert_eq!(lens.iter().sum::<usize>(), NUM_ELEMENTS_TOTAL * 2);

    // Drained frame: completing the short transfer submits nothing further
    thread::sleep(Duration::from_millis(10));
    assert_eq!(endpoint.outstanding(), 0);
}

#[test]
fn pump_while_transfer_outstanding_is_a_no_op() {
    let fe = FakeFrontEnd::new();
    fe.set_uniform_frame(0x8000, NUM_ELEMENTS_TOTAL);
    let (spectro, handle) = service(&fe);
    let endpoint = FakeEndpoint::default();
    let stream = BulkStream::new(spectro, Box::new(endpoint.clone()));
    stream.enable();

    assert_ok!(stream.begin_read());
    wait_for(|| handle.is_busy());
    fe.run_acquisition(&handle);

    // Extra pumps while a transfer is in flight must not queue or submit
    wait_for(|| endpoint.outstanding() > 0);
    for _ in 0..4 {
        stream.pump();
    }
    thread::sleep(Duration::from_millis(10));
    assert_eq!(endpoint.outstanding(), 1);

    // The drain still runs to the short packet afterwards
    let mut count = 0;
    loop {
        wait_for(|| endpoint.outstanding() > 0);
        let buf = endpoint.take().unwrap();
        let done = buf.len() < 512;
        count += 1;
        stream.on_complete(buf);
        if done {
            break;
        }
    }
    assert_eq!(count, 15);
}

#[test]
fn disabled_stream_submits_nothing() {
    let fe = FakeFrontEnd::new();
    fe.set_uniform_frame(0x8000, NUM_ELEMENTS_TOTAL);
    let (spectro, handle) = service(&fe);
    let endpoint = FakeEndpoint::default();
    let stream = BulkStream::new(spectro, Box::new(endpoint.clone()));

    assert_ok!(stream.begin_read());
    wait_for(|| handle.is_busy());
    fe.run_acquisition(&handle);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(endpoint.outstanding(), 0);

    // Enabling and pumping picks the capture back up
    stream.enable();
    stream.pump();
    wait_for(|| endpoint.outstanding() == 1);
}
