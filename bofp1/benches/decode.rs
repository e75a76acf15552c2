use bofp1::decoder::{decode, Channel, Reading};
use bofp1::NUM_ELEMENTS_TOTAL;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn capture() -> Vec<u8> {
    let mut buf = (NUM_ELEMENTS_TOTAL as u16).to_be_bytes().to_vec();
    for i in 0..NUM_ELEMENTS_TOTAL {
        buf.extend_from_slice(&(i as u16).wrapping_mul(17).to_be_bytes());
    }
    buf
}

fn bench_frame_decode(c: &mut Criterion) {
    let buf = capture();
    c.bench_function("full frame to millivolts", |b| {
        b.iter(|| {
            let mut fit = 0;
            let mut out = [Reading::default(); 256];
            let mut acc = 0u64;
            loop {
                let n = decode(black_box(&buf), Channel::Voltage, &mut fit, out.len(), &mut out)
                    .expect("decode failed");
                if n == 0 {
                    break;
                }
                acc += out[..n].iter().map(|r| r.millivolts() as u64).sum::<u64>();
            }
            acc
        })
    });
}

criterion_group!(benches, bench_frame_decode);
criterion_main!(benches);
