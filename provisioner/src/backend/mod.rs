// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The services a provisioning session relies on but doesn't implement itself.
//!
//! A [`Backend`] answers for the device registry and the certificate authority: it knows the
//! endpoint devices connect to, issues device certificates from their signing requests, and
//! provides the certificate the device uses to verify OTA images.

use std::path::{Path, PathBuf};

pub mod local;

pub use local::LocalBackend;

/// A certificate and private key pair on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationCertificate {
    /// The PEM-encoded certificate sent to the device.
    pub certificate: PathBuf,
    /// The PEM-encoded private key matching `certificate`; it never leaves the host.
    pub private_key: PathBuf,
}

/// Registry and certificate authority operations used during a session.
///
/// Errors from any of these end the session; nothing is retried.
#[allow(async_fn_in_trait)]
pub trait Backend {
    /// Check `thing_name` can be registered.
    ///
    /// Sessions call this before anything is sent to the device.
    fn check_thing_name(&self, thing_name: &str) -> anyhow::Result<()> {
        validate_thing_name(thing_name)
    }

    /// The address of the data endpoint the device should connect to.
    async fn resolve_endpoint(&self) -> anyhow::Result<String>;

    /// Register `thing_name` and issue it a certificate for the PEM-encoded `csr`.
    ///
    /// Returns the PEM-encoded certificate.
    async fn issue_certificate_from_csr(&self, csr: &str, thing_name: &str)
    -> anyhow::Result<String>;

    /// Get the certificate the device uses to verify OTA update signatures.
    async fn ota_verification_certificate(&self) -> anyhow::Result<VerificationCertificate>;

    /// Import a certificate and its private key so they can be used to sign OTA updates.
    ///
    /// Returns an identifier for the imported certificate.
    async fn import_certificate(
        &self,
        certificate: &Path,
        private_key: &Path,
    ) -> anyhow::Result<String>;
}

/// Thing names follow the usual registry rules: 1-128 characters of `[a-zA-Z0-9:_-]`.
pub fn validate_thing_name(thing_name: &str) -> anyhow::Result<()> {
    let valid = !thing_name.is_empty()
        && thing_name.len() <= 128
        && thing_name
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || matches!(byte, b':' | b'_' | b'-'));
    if !valid {
        anyhow::bail!(
            "'{thing_name}' is not a valid thing name; use 1-128 letters, digits, ':', '_', or '-'"
        );
    }
    Ok(())
}
