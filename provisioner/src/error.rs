// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Error types for the framed transport, the CSR extractor, and the provisioning session.

use std::time::Duration;

/// Errors the [`crate::framing::FramedStream`] may return.
///
/// None of these are retried; every variant ends the session it occurs in.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
    /// An I/O error occurred on the underlying stream.
    ///
    /// For a serial port this is usually because the device was unplugged or the
    /// port is held open by another process.
    #[error("an I/O error occurred: {0}")]
    Io(#[from] std::io::Error),

    /// The stop marker did not appear before a single byte read exceeded the read timeout.
    ///
    /// The device is either stalled, waiting on a prompt the host doesn't know about, or
    /// not running the provisioning firmware at all. The device output read so far has
    /// already been logged.
    #[error("timed out after {timeout:?} waiting for {marker:?} from the device")]
    Timeout { marker: String, timeout: Duration },

    /// The stream reached end-of-file before the stop marker appeared.
    #[error("the device stream closed while waiting for {marker:?}")]
    Closed { marker: String },

    /// The stream accepted fewer bytes than the frame contains.
    ///
    /// The device firmware cannot resynchronize after a short frame, so this is fatal.
    #[error("partial write: expected to write {expected} bytes, wrote {written}")]
    PartialWrite { expected: usize, written: usize },

    /// The payload contains characters outside the single-byte range the device accepts.
    #[error("payload contains non-ASCII characters and cannot be sent to the device")]
    NotAscii,
}

/// Errors [`crate::csr::extract`] may return.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum CsrError {
    /// No well-formed certificate signing request was found in the device output.
    #[error("no well-formed certificate signing request found in the device output")]
    NotFound,
}

/// Errors the [`crate::session::Session`] may return.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SessionError {
    /// Reading from or writing to the device failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The device printed its CSR marker, but no CSR could be extracted.
    ///
    /// There is nothing to issue a certificate for, so the session ends.
    #[error("failed to extract the device CSR: {0}")]
    Csr(#[from] CsrError),

    /// A backend operation (endpoint lookup, certificate issuance, import) failed.
    #[error("backend operation failed: {0:#}")]
    Backend(anyhow::Error),

    /// The operator interrupted the session before it reached the monitor state.
    #[error("session interrupted while in state {state}")]
    Interrupted { state: &'static str },
}
