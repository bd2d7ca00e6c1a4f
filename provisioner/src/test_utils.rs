// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! In-memory streams standing in for a device on the other end of a UART.

use std::{
    collections::VecDeque,
    future::Future,
    io,
    pin::Pin,
    task::{Context, Poll, Waker},
    time::Duration,
};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::framing::TERMINATOR;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    Flush,
    Write(Vec<u8>),
}

/// A stream that serves fixed input and records every write and flush.
///
/// Once the input is exhausted reads never complete, unless [`MockStream::with_eof`] was used.
#[derive(Debug, Default)]
pub(crate) struct MockStream {
    input: VecDeque<u8>,
    eof: bool,
    max_write: Option<usize>,
    pub(crate) events: Vec<Event>,
}

impl MockStream {
    pub(crate) fn new(input: impl AsRef<[u8]>) -> Self {
        Self {
            input: input.as_ref().iter().copied().collect(),
            ..Default::default()
        }
    }

    /// Report end-of-file once the input is exhausted.
    pub(crate) fn with_eof(mut self) -> Self {
        self.eof = true;
        self
    }

    /// Accept at most `max_write` bytes per write call.
    pub(crate) fn with_max_write(mut self, max_write: usize) -> Self {
        self.max_write = Some(max_write);
        self
    }

    /// All bytes written, in order.
    pub(crate) fn written(&self) -> Vec<u8> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::Write(bytes) => Some(bytes.as_slice()),
                Event::Flush => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    /// The number of input bytes not yet read.
    pub(crate) fn remaining(&self) -> usize {
        self.input.len()
    }
}

impl AsyncRead for MockStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.input.is_empty() {
            return if this.eof {
                Poll::Ready(Ok(()))
            } else {
                Poll::Pending
            };
        }
        let count = buf.remaining().min(this.input.len());
        let bytes: Vec<u8> = this.input.drain(..count).collect();
        buf.put_slice(&bytes);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let count = this
            .max_write
            .map_or(buf.len(), |max_write| max_write.min(buf.len()));
        this.events.push(Event::Write(buf[..count].to_vec()));
        Poll::Ready(Ok(count))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().events.push(Event::Flush);
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// A fake device that replies to each framed message with the next scripted output.
///
/// The initial output is readable straight away. Every time a complete frame (a message
/// followed by the terminator) is written, the message is recorded in `frames` and the next
/// reply becomes readable. When nothing is readable, reads wait.
#[derive(Debug, Default)]
pub(crate) struct ScriptedDevice {
    readable: VecDeque<u8>,
    replies: VecDeque<Vec<u8>>,
    delayed: Option<(Pin<Box<tokio::time::Sleep>>, Vec<u8>)>,
    pending: Vec<u8>,
    reader: Option<Waker>,
    pub(crate) frames: Vec<String>,
}

impl ScriptedDevice {
    pub(crate) fn new(initial: &str) -> Self {
        Self {
            readable: initial.bytes().collect(),
            ..Default::default()
        }
    }

    /// Queue output the device prints after receiving the next frame.
    pub(crate) fn then(mut self, reply: &str) -> Self {
        self.replies.push_back(reply.as_bytes().to_vec());
        self
    }

    /// Output the device prints on its own after `delay`, once everything else is read.
    pub(crate) fn delayed(mut self, delay: Duration, output: &str) -> Self {
        self.delayed = Some((
            Box::pin(tokio::time::sleep(delay)),
            output.as_bytes().to_vec(),
        ));
        self
    }
}

impl AsyncRead for ScriptedDevice {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.readable.is_empty() {
            if let Some((sleep, _)) = this.delayed.as_mut() {
                if sleep.as_mut().poll(cx).is_ready() {
                    let (_, output) = this.delayed.take().expect("checked above");
                    this.readable.extend(output);
                }
            }
        }
        if this.readable.is_empty() {
            this.reader = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let count = buf.remaining().min(this.readable.len());
        let bytes: Vec<u8> = this.readable.drain(..count).collect();
        buf.put_slice(&bytes);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ScriptedDevice {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.pending.extend_from_slice(buf);
        if this.pending.ends_with(TERMINATOR.as_bytes()) {
            let frame_len = this.pending.len() - TERMINATOR.len();
            let frame = String::from_utf8_lossy(&this.pending[..frame_len]).into_owned();
            this.frames.push(frame);
            this.pending.clear();

            if let Some(reply) = this.replies.pop_front() {
                this.readable.extend(reply);
                if let Some(reader) = this.reader.take() {
                    reader.wake();
                }
            }
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
