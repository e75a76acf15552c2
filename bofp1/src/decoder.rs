//! Decode layer: interprets a captured buffer as calibrated fixed-point
//! readings.
//!
//! A capture starts with a big-endian frame-count header followed by raw
//! big-endian sensor words. Decoding is sequential only: the caller owns a
//! cursor (`fit`) that advances monotonically and is reset by the caller
//! when a new frame is captured.

use nom::number::complete::be_u16;

use crate::error::{Error, Result};

/// Channel identifiers shared with the host protocol.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Channel {
    /// Calibrated per-pixel voltage. The only channel this decoder produces.
    Voltage,
    /// Raw device status flags; diagnostics only, not decodable.
    Status,
}

/// Full-scale shift applied to every reading: raw words are left-aligned
/// into Q31 and span `2^SHIFT` volts.
pub const SHIFT: u8 = 1;

pub(crate) const HEADER_SIZE: usize = 2;
const READING_SIZE: usize = 2;

/// One calibrated reading: Q31 value plus its full-scale shift.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Reading {
    pub value: i32,
    pub shift: u8,
}

impl Reading {
    fn from_raw(raw: u16) -> Self {
        Reading {
            value: (raw as i32) << 15,
            shift: SHIFT,
        }
    }

    /// Reading scaled to millivolts.
    pub fn millivolts(self) -> u16 {
        ((self.value as i64 * 1000) << self.shift >> 31) as u16
    }
}

fn parse_u16(buf: &[u8], context: &'static str) -> Result<u16> {
    let (_, value) = be_u16::<_, nom::error::Error<&[u8]>>(buf)
        .map_err(|_| Error::Protocol(context))?;
    Ok(value)
}

/// Calibrated element count recorded in the capture header. Not a constant:
/// the moving-average stage trims the frame.
pub fn frame_count(buf: &[u8], channel: Channel) -> Result<u16> {
    if channel != Channel::Voltage {
        return Err(Error::Unsupported);
    }
    parse_u16(buf, "truncated frame header")
}

/// Sizing contract: `(header_size, per_reading_size)` in buffer bytes.
pub fn size_info(channel: Channel) -> Result<(usize, usize)> {
    if channel != Channel::Voltage {
        return Err(Error::Unsupported);
    }
    Ok((HEADER_SIZE, READING_SIZE))
}

/// Decodes up to `max` readings starting at `*fit`, advancing the cursor.
/// Returns the number of readings produced; 0 once the cursor has passed the
/// recorded frame count.
pub fn decode(
    buf: &[u8],
    channel: Channel,
    fit: &mut usize,
    max: usize,
    out: &mut [Reading],
) -> Result<usize> {
    let frames = frame_count(buf, channel)? as usize;
    if *fit >= frames {
        return Ok(0);
    }

    let want = max.min(out.len()).min(frames - *fit);
    for produced in 0..want {
        let offset = HEADER_SIZE + (*fit + produced) * READING_SIZE;
        if offset + READING_SIZE > buf.len() {
            return Err(Error::Protocol("capture shorter than frame header claims"));
        }
        let raw = parse_u16(&buf[offset..], "truncated reading")?;
        out[produced] = Reading::from_raw(raw);
    }

    *fit += want;
    Ok(want)
}
