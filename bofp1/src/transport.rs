//! Register transport: frames register reads/writes as bus transactions.
//!
//! The FPGA addresses registers with a single byte where the MSB carries the
//! transfer direction. Writes are `{addr|WR, value}` pairs and the front-end
//! accepts at most [`TINY_WRITE_MAX`] bytes per transaction, so longer
//! register sequences have to be split into chained sub-transactions. The
//! chaining is part of the device contract and is exposed here rather than
//! hidden: callers hand over the full step list and the transport runs it
//! without interleaving anything else.

use crate::error::Result;
use crate::hal::SpiBus;

pub const REG_STREAM: u8 = 0x0;
pub const REG_SAMPLE: u8 = 0x1;
pub const REG_RESET: u8 = 0x2;
pub const REG_CCD_SH1: u8 = 0x3;
pub const REG_CCD_SH2: u8 = 0x4;
pub const REG_CCD_SH3: u8 = 0x5;
pub const REG_PIPELINE: u8 = 0x6;
pub const REG_MOVING_AVG_N: u8 = 0x7;
pub const REG_TOTAL_AVG_N: u8 = 0x8;
pub const REG_STATUS: u8 = 0x9;
pub const REG_CALIBRATE: u8 = 0xA;
pub const REG_FLUSH: u8 = 0xB;

const REG_BIT_WR: u8 = 0x80;

/// Hard cap on bytes per write transaction accepted by the front-end.
pub const TINY_WRITE_MAX: usize = 7;

const PAIRS_PER_WRITE: usize = TINY_WRITE_MAX / 2;

pub(crate) fn write_addr(addr: u8) -> u8 {
    addr | REG_BIT_WR
}

pub(crate) fn read_addr(addr: u8) -> u8 {
    addr & !REG_BIT_WR
}

/// One step of a chained transaction.
pub enum Step<'a> {
    /// Write `(addr, value)` pairs; split into tiny writes as needed.
    Write(&'a [(u8, u8)]),
    /// Select `addr` for reading and clock the slice in.
    Read { addr: u8, into: &'a mut [u8] },
}

pub struct Transport<B> {
    bus: B,
}

impl<B: SpiBus> Transport<B> {
    pub fn new(bus: B) -> Self {
        Transport { bus }
    }

    pub fn write_reg(&mut self, addr: u8, value: u8) -> Result<()> {
        self.bus.transfer(&[write_addr(addr), value], &mut [])?;
        Ok(())
    }

    /// Writes a register sequence as one chained transaction, splitting at
    /// the tiny-write cap.
    pub fn write_regs(&mut self, pairs: &[(u8, u8)]) -> Result<()> {
        for chunk in pairs.chunks(PAIRS_PER_WRITE) {
            let mut buf = [0u8; TINY_WRITE_MAX];
            let mut len = 0;
            for (addr, value) in chunk {
                buf[len] = write_addr(*addr);
                buf[len + 1] = *value;
                len += 2;
            }
            self.bus.transfer(&buf[..len], &mut [])?;
        }
        Ok(())
    }

    pub fn read_reg(&mut self, addr: u8) -> Result<u8> {
        let mut value = [0u8];
        self.bus.transfer(&[read_addr(addr)], &mut value)?;
        Ok(value[0])
    }

    /// Streams `buf.len()` payload bytes out of the stream register.
    pub fn stream_read(&mut self, buf: &mut [u8]) -> Result<()> {
        self.bus.transfer(&[read_addr(REG_STREAM)], buf)?;
        Ok(())
    }

    /// Runs an ordered step list back to back. Nothing else may touch the
    /// bus between steps; the caller guarantees exclusivity by holding the
    /// transport for the duration.
    pub fn run(&mut self, steps: &mut [Step<'_>]) -> Result<()> {
        for step in steps {
            match step {
                Step::Write(pairs) => self.write_regs(pairs)?,
                Step::Read { addr, into } => {
                    self.bus.transfer(&[read_addr(*addr)], into)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    /// Records every chip-select window for inspection.
    #[derive(Clone, Default)]
    struct TraceBus {
        windows: Arc<Mutex<Vec<(Vec<u8>, usize)>>>,
    }

    impl SpiBus for TraceBus {
        fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<()> {
            self.windows.lock().unwrap().push((tx.to_vec(), rx.len()));
            Ok(())
        }
    }

    #[test]
    fn write_sets_direction_bit() {
        let bus = TraceBus::default();
        let mut t = Transport::new(bus.clone());
        assert_ok!(t.write_reg(REG_SAMPLE, 0x00));
        let windows = bus.windows.lock().unwrap();
        assert_eq!(windows[0].0, vec![0x81, 0x00]);
    }

    #[test]
    fn read_keeps_direction_bit_clear() {
        let bus = TraceBus::default();
        let mut t = Transport::new(bus.clone());
        assert_ok!(t.read_reg(REG_STATUS));
        let windows = bus.windows.lock().unwrap();
        assert_eq!(windows[0].0, vec![REG_STATUS]);
        assert_eq!(windows[0].1, 1);
    }

    #[test]
    fn long_write_splits_at_tiny_write_cap() {
        let bus = TraceBus::default();
        let mut t = Transport::new(bus.clone());
        // 5 pairs = 10 bytes, must split into 6 + 4
        assert_ok!(t.write_regs(&[
            (REG_CCD_SH1, 0x01),
            (REG_CCD_SH2, 0x02),
            (REG_CCD_SH3, 0x03),
            (REG_MOVING_AVG_N, 0x04),
            (REG_TOTAL_AVG_N, 0x05),
        ]));
        let windows = bus.windows.lock().unwrap();
        assert_eq!(windows.len(), 2);
        assert_eq!(
            windows[0].0,
            vec![0x83, 0x01, 0x84, 0x02, 0x85, 0x03]
        );
        assert_eq!(windows[1].0, vec![0x87, 0x04, 0x88, 0x05]);
        assert!(windows.iter().all(|(tx, _)| tx.len() <= TINY_WRITE_MAX));
    }

    #[test]
    fn boxed_bus_still_transfers() {
        let bus = TraceBus::default();
        let mut t = Transport::new(Box::new(bus.clone()) as Box<dyn SpiBus>);
        assert_ok!(t.write_reg(REG_RESET, 0x00));
        let windows = bus.windows.lock().unwrap();
        assert_eq!(windows[0].0, vec![0x82, 0x00]);
    }

    #[test]
    fn stream_read_selects_stream_register() {
        let bus = TraceBus::default();
        let mut t = Transport::new(bus.clone());
        let mut payload = [0u8; 512];
        assert_ok!(t.stream_read(&mut payload));
        let windows = bus.windows.lock().unwrap();
        assert_eq!(windows[0].0, vec![REG_STREAM]);
        assert_eq!(windows[0].1, 512);
    }
}
