// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The framed stream the provisioning handshake runs over.
//!
//! Messages to the device are written one chunk (by default, one character) at a time with a
//! short pause between chunks, followed by the [`TERMINATOR`]. The device's UART driver has no
//! flow control, so writing faster than it drains its receive buffer drops bytes.
//!
//! Reads pull one byte at a time until a stop marker appears in the accumulated output. Bytes
//! outside the ASCII range are rendered as hex escapes (`0xff`) so line noise never aborts a
//! read, and the returned text is always ASCII.

use std::{num::NonZeroUsize, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{Level, instrument};

use crate::error::TransportError;

/// Appended to every message written to the device.
pub const TERMINATOR: &str = ">>>>>>";

/// The most output [`FramedStream::drain`] keeps.
pub const DRAIN_TAIL: usize = 4096;

/// Pacing and timeout settings for a [`FramedStream`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Framing {
    /// How long to wait for any single byte before giving up on a read; the default is 20
    /// seconds.
    ///
    /// The device can pause for several seconds between prompts (for example, while it
    /// generates a key pair), so this should be generous.
    pub read_timeout: Duration,
    /// How long to pause before each chunk is written; the default is 10 milliseconds.
    pub char_delay: Duration,
    /// The number of bytes written per chunk; the default is 1.
    pub chunk_size: NonZeroUsize,
}

impl Default for Framing {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(20),
            char_delay: Duration::from_millis(10),
            chunk_size: NonZeroUsize::MIN,
        }
    }
}

/// A byte stream speaking the device's framed, marker-delimited protocol.
///
/// The stream is owned exclusively; it is closed when the `FramedStream` is dropped, or can be
/// recovered with [`FramedStream::into_inner`].
#[derive(Debug)]
pub struct FramedStream<S> {
    stream: S,
    framing: Framing,
}

impl<S> FramedStream<S> {
    pub fn new(stream: S, framing: Framing) -> Self {
        Self { stream, framing }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> FramedStream<S> {
    /// Write `payload` followed by the [`TERMINATOR`].
    ///
    /// The stream is flushed before every chunk. Returns the number of bytes written, which is
    /// always `payload.len() + TERMINATOR.len()`.
    ///
    /// # Errors
    ///
    /// [`TransportError::NotAscii`] is returned, and nothing is written, if `payload` contains
    /// non-ASCII characters. [`TransportError::PartialWrite`] is returned if the stream accepted
    /// fewer bytes than the frame holds.
    #[instrument(skip_all, level = Level::DEBUG, fields(len = payload.len()), err)]
    pub async fn write(&mut self, payload: &str) -> Result<usize, TransportError> {
        if !payload.is_ascii() {
            return Err(TransportError::NotAscii);
        }

        let mut written = 0;
        for chunk in payload.as_bytes().chunks(self.framing.chunk_size.get()) {
            self.stream.flush().await?;
            if !self.framing.char_delay.is_zero() {
                tokio::time::sleep(self.framing.char_delay).await;
            }
            written += self.stream.write(chunk).await?;
        }
        self.stream.flush().await?;
        written += self.stream.write(TERMINATOR.as_bytes()).await?;
        self.stream.flush().await?;
        tracing::debug!(payload, "Sent payload to the device");

        let expected = payload.len() + TERMINATOR.len();
        if written != expected {
            return Err(TransportError::PartialWrite { expected, written });
        }
        Ok(written)
    }

    /// Read until `stop_marker` appears in the output or `max_length` bytes have been read.
    ///
    /// A `max_length` of `None` or `Some(0)` means there is no cap. An empty `stop_marker`
    /// matches immediately and nothing is read. The returned text includes the marker.
    ///
    /// Each line is logged under the `provisioner::device` target as it completes.
    ///
    /// # Errors
    ///
    /// [`TransportError::Timeout`] is returned if any single byte takes longer than
    /// [`Framing::read_timeout`] to arrive.
    pub async fn read(
        &mut self,
        stop_marker: &str,
        max_length: Option<usize>,
    ) -> Result<String, TransportError> {
        let timeout = self.framing.read_timeout;
        self.read_until(stop_marker, max_length, Some(timeout), None)
            .await
    }

    /// Read until `stop_marker` appears, with no length cap and no timeout.
    ///
    /// This is for passively watching device output after the handshake is done; it only
    /// returns when the marker appears or the stream fails. Every line is still logged, but
    /// only the last [`DRAIN_TAIL`] bytes (or the marker, if it's longer) are returned.
    pub async fn drain(&mut self, stop_marker: &str) -> Result<String, TransportError> {
        let tail = DRAIN_TAIL.max(stop_marker.len());
        self.read_until(stop_marker, None, None, Some(tail)).await
    }

    async fn read_until(
        &mut self,
        stop_marker: &str,
        max_length: Option<usize>,
        timeout: Option<Duration>,
        tail: Option<usize>,
    ) -> Result<String, TransportError> {
        let cap = max_length.filter(|cap| *cap > 0);
        let mut buffer = String::new();
        let mut line_start = 0;
        let mut bytes_read = 0;
        let mut matched = stop_marker.is_empty();

        while !matched && cap.is_none_or(|cap| bytes_read < cap) {
            let byte = self.read_byte(stop_marker, timeout).await?;
            bytes_read += 1;

            // Any new match has to end in what this byte appended.
            let search_from = buffer
                .len()
                .saturating_sub(stop_marker.len().saturating_sub(1));
            decode_into(byte, &mut buffer);
            matched = buffer[search_from..].contains(stop_marker);

            if byte == b'\n' {
                log_device_line(&buffer[line_start..]);
                line_start = buffer.len();
            }

            if let Some(tail) = tail.filter(|tail| buffer.len() > *tail) {
                let cut = buffer.len() - tail;
                if line_start < cut {
                    log_device_line(&buffer[line_start..cut]);
                    line_start = cut;
                }
                buffer.drain(..cut);
                line_start -= cut;
            }
        }
        if line_start < buffer.len() {
            log_device_line(&buffer[line_start..]);
        }

        Ok(buffer)
    }

    async fn read_byte(
        &mut self,
        stop_marker: &str,
        timeout: Option<Duration>,
    ) -> Result<u8, TransportError> {
        let result = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.stream.read_u8())
                .await
                .map_err(|_elapsed| TransportError::Timeout {
                    marker: stop_marker.to_string(),
                    timeout,
                })?,
            None => self.stream.read_u8().await,
        };

        result.map_err(|error| {
            if error.kind() == std::io::ErrorKind::UnexpectedEof {
                TransportError::Closed {
                    marker: stop_marker.to_string(),
                }
            } else {
                TransportError::Io(error)
            }
        })
    }
}

/// Append `byte` to `buffer` as a character, or as a hex escape if it isn't ASCII.
fn decode_into(byte: u8, buffer: &mut String) {
    if byte.is_ascii() {
        buffer.push(char::from(byte));
    } else {
        buffer.push_str(&format!("{byte:#x}"));
    }
}

fn log_device_line(line: &str) {
    tracing::info!(target: "provisioner::device", "{}", line.trim_end());
}
