//! Blocking telegram decoder
//!
//! The hub links are noisy, so the decoder is lenient: a header announcing
//! an impossible length is dropped and decoding resumes one byte later, and
//! a payload that does not arrive in time is discarded. Neither case is an
//! error; only I/O failures are.
//!
//! Decoding sleeps between polls and must run on a blocking worker, never
//! directly on the event loop.

use std::collections::VecDeque;
use std::io;
use std::thread;
use std::time::{Duration, Instant};

use super::{header_length, Telegram, DEFAULT_MAX_LENGTH, HEADER_LEN};

/// A byte stream that can report how much data is already buffered.
pub trait ByteSource {
    /// Bytes that can be read without blocking.
    fn available(&mut self) -> io::Result<usize>;

    /// Read up to `buf.len()` buffered bytes.
    fn read_into(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl ByteSource for VecDeque<u8> {
    fn available(&mut self) -> io::Result<usize> {
        Ok(self.len())
    }

    fn read_into(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.len());
        for (slot, byte) in buf.iter_mut().zip(self.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

/// Tuning for [`Framer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramerSettings {
    /// Largest payload length accepted in a header.
    pub max_length: usize,
    /// How long to wait for the header, and again for the payload.
    pub timeout: Duration,
    /// Sleep between availability checks.
    pub poll_interval: Duration,
}

impl Default for FramerSettings {
    fn default() -> Self {
        Self {
            max_length: DEFAULT_MAX_LENGTH,
            timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// Result of one decoding attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete telegram.
    Telegram(Telegram),
    /// No header arrived before the timeout.
    Idle,
    /// The header announced 0 or more than `max_length` bytes.
    Malformed { length: usize },
    /// The payload did not fully arrive; what did arrive was dropped.
    Incomplete { expected: usize, received: usize },
}

/// Stateful decoder. Holds at most one byte carried over from a rejected
/// header; that byte becomes the first byte of the next header.
#[derive(Debug, Clone)]
pub struct Framer {
    settings: FramerSettings,
    carry: Option<u8>,
}

impl Framer {
    pub fn new(settings: FramerSettings) -> Self {
        Self {
            settings,
            carry: None,
        }
    }

    pub fn settings(&self) -> &FramerSettings {
        &self.settings
    }

    /// Forget any carried byte, e.g. after the link was reopened.
    pub fn reset(&mut self) {
        self.carry = None;
    }

    /// Make one decoding attempt against `src`.
    pub fn poll<S: ByteSource + ?Sized>(&mut self, src: &mut S) -> io::Result<Decoded> {
        let carried = usize::from(self.carry.is_some());
        if !self.wait_for(src, HEADER_LEN - carried)? {
            return Ok(Decoded::Idle);
        }

        let mut header = [0u8; HEADER_LEN];
        let start = match self.carry.take() {
            Some(byte) => {
                header[0] = byte;
                1
            }
            None => 0,
        };
        read_exact(src, &mut header[start..])?;

        let length = header_length(header);
        if length == 0 || length > self.settings.max_length {
            // Slide by one byte rather than trusting the bogus length.
            self.carry = Some(header[1]);
            return Ok(Decoded::Malformed { length });
        }

        if !self.wait_for(src, length)? {
            let arrived = src.available()?.min(length);
            let mut scratch = vec![0u8; arrived];
            read_exact(src, &mut scratch)?;
            return Ok(Decoded::Incomplete {
                expected: length,
                received: arrived,
            });
        }

        let mut bytes = vec![0u8; HEADER_LEN + length];
        bytes[..HEADER_LEN].copy_from_slice(&header);
        read_exact(src, &mut bytes[HEADER_LEN..])?;
        Ok(Decoded::Telegram(Telegram(bytes)))
    }

    /// Decode the next telegram, or `None` when nothing usable arrived.
    /// Malformed and incomplete packets are logged and dropped.
    pub fn decode_stream<S: ByteSource + ?Sized>(
        &mut self,
        src: &mut S,
    ) -> io::Result<Option<Telegram>> {
        match self.poll(src)? {
            Decoded::Telegram(telegram) => Ok(Some(telegram)),
            Decoded::Idle => Ok(None),
            Decoded::Malformed { length } => {
                log::warn!("Invalid telegram length {}, resynchronising", length);
                Ok(None)
            }
            Decoded::Incomplete { expected, received } => {
                log::warn!("Incomplete telegram: got {}/{} bytes", received, expected);
                Ok(None)
            }
        }
    }

    fn wait_for<S: ByteSource + ?Sized>(&self, src: &mut S, needed: usize) -> io::Result<bool> {
        let deadline = Instant::now() + self.settings.timeout;
        loop {
            if src.available()? >= needed {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(self.settings.poll_interval);
        }
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new(FramerSettings::default())
    }
}

fn read_exact<S: ByteSource + ?Sized>(src: &mut S, buf: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = src.read_into(&mut buf[filled..])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "byte source reported data it could not deliver",
            ));
        }
        filled += n;
    }
    Ok(())
}
