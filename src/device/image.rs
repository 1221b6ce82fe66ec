//! Byte images of classes and objects as they sit in device memory.
//!
//! Fields are little-endian, 8 bytes wide, and written in layout order: the
//! class tag first, then each level's fields from the root down. Variable-length
//! traces are a `u64` length followed by their values.

use crate::class::Selector;
use crate::device::DeviceAddress;
use crate::error::DeviceError;

const WORD: usize = 8;

fn malformed(offset: usize, reason: impl Into<String>) -> DeviceError {
    DeviceError::MalformedImage {
        offset,
        reason: reason.into(),
    }
}

/// Sequential writer for a device image.
#[derive(Debug, Default, Clone)]
pub struct ImageWriter {
    buf: Vec<u8>,
}

impl ImageWriter {
    /// Creates an empty image.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a `u64`.
    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Appends an `f64`.
    pub fn put_f64(&mut self, value: f64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Appends a device address.
    pub fn put_address(&mut self, address: DeviceAddress) {
        self.put_u64(address.raw());
    }

    /// Appends a length-prefixed trace.
    pub fn put_trace(&mut self, values: &[f64]) {
        self.put_u64(values.len() as u64);
        for &v in values {
            self.put_f64(v);
        }
    }

    /// Bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Current contents.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Finishes the image.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Sequential reader over a device image.
#[derive(Debug, Clone)]
pub struct ImageReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ImageReader<'a> {
    /// Starts reading at offset 0.
    #[must_use]
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current offset.
    #[must_use]
    pub const fn position(&self) -> usize {
        self.pos
    }

    /// Skips `len` bytes.
    pub fn skip(&mut self, len: usize) -> Result<(), DeviceError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| malformed(self.pos, format!("cannot skip {len} bytes")))?;
        self.pos = end;
        Ok(())
    }

    fn word(&mut self) -> Result<[u8; WORD], DeviceError> {
        let end = self.pos + WORD;
        let bytes = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| malformed(self.pos, "unexpected end of image"))?;
        let mut out = [0u8; WORD];
        out.copy_from_slice(bytes);
        self.pos = end;
        Ok(out)
    }

    /// Reads a `u64`.
    pub fn get_u64(&mut self) -> Result<u64, DeviceError> {
        self.word().map(u64::from_le_bytes)
    }

    /// Reads an `f64`.
    pub fn get_f64(&mut self) -> Result<f64, DeviceError> {
        self.word().map(f64::from_le_bytes)
    }

    /// Reads a device address.
    pub fn get_address(&mut self) -> Result<DeviceAddress, DeviceError> {
        self.get_u64().map(DeviceAddress::from_raw)
    }

    /// Reads a trace length and returns the offset of its first value.
    pub fn trace_header(&mut self) -> Result<(usize, usize), DeviceError> {
        let at = self.pos;
        let len = usize::try_from(self.get_u64()?)
            .map_err(|_| malformed(at, "trace length overflows usize"))?;
        let start = self.pos;
        let fits = len
            .checked_mul(WORD)
            .and_then(|bytes| start.checked_add(bytes))
            .is_some_and(|end| end <= self.buf.len());
        if !fits {
            return Err(malformed(at, format!("trace of {len} values overruns image")));
        }
        Ok((len, start))
    }

    /// Reads a length-prefixed trace.
    pub fn get_trace(&mut self) -> Result<Vec<f64>, DeviceError> {
        let (len, _) = self.trace_header()?;
        (0..len).map(|_| self.get_f64()).collect()
    }
}

/// Reads the `u64` at `offset`.
pub fn read_u64_at(buf: &[u8], offset: usize) -> Result<u64, DeviceError> {
    ImageReader {
        buf,
        pos: offset,
    }
    .get_u64()
}

/// Reads the `f64` at `offset`.
pub fn read_f64_at(buf: &[u8], offset: usize) -> Result<f64, DeviceError> {
    ImageReader {
        buf,
        pos: offset,
    }
    .get_f64()
}

/// Overwrites the `f64` at `offset`.
pub fn write_f64_at(buf: &mut [u8], offset: usize, value: f64) -> Result<(), DeviceError> {
    let slot = buf
        .get_mut(offset..offset + WORD)
        .ok_or_else(|| malformed(offset, "write past end of image"))?;
    slot.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Offset of value `index` in a trace whose values start at `start`.
#[must_use]
pub const fn trace_offset(start: usize, index: usize) -> usize {
    start + index * WORD
}

/// Device copy of a class record.
///
/// Layout: superclass link, instance size, slot count, then one
/// `(selector code, device address)` pair per slot in slot order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassImage {
    /// Device address of the superclass image. The root links to itself.
    pub super_link: DeviceAddress,
    /// Instance size in bytes.
    pub instance_size: u64,
    /// Device entry point per selector; NULL where the slot has no device code.
    pub slots: Vec<(Selector, DeviceAddress)>,
}

impl ClassImage {
    /// Encoded length of an image with `slots` slots.
    #[must_use]
    pub const fn encoded_len(slots: usize) -> usize {
        3 * WORD + slots * 2 * WORD
    }

    /// Serializes the image.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ImageWriter::new();
        w.put_address(self.super_link);
        w.put_u64(self.instance_size);
        w.put_u64(self.slots.len() as u64);
        for (selector, address) in &self.slots {
            w.put_u64(selector.code());
            w.put_address(*address);
        }
        w.into_bytes()
    }

    /// Parses an image written by [`ClassImage::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, DeviceError> {
        let mut r = ImageReader::new(bytes);
        let super_link = r.get_address()?;
        let instance_size = r.get_u64()?;
        let count = r.get_u64()?;
        let mut slots = Vec::new();
        for _ in 0..count {
            let at = r.position();
            let code = r.get_u64()?;
            let selector = Selector::from_code(code)
                .ok_or_else(|| malformed(at, format!("unknown selector code {code}")))?;
            slots.push((selector, r.get_address()?));
        }
        Ok(Self {
            super_link,
            instance_size,
            slots,
        })
    }

    /// Device address stored for `selector`, if the class has that slot.
    #[must_use]
    pub fn slot(&self, selector: Selector) -> Option<DeviceAddress> {
        self.slots
            .iter()
            .find(|(s, _)| *s == selector)
            .map(|(_, address)| *address)
    }
}
