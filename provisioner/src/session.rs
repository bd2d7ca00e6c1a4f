// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The provisioning handshake.
//!
//! The device firmware runs an interactive menu on its UART. A [`Session`] walks that menu in
//! a fixed order: confirm provisioning (and re-provisioning, if the device already has an
//! identity), then send the thing name, the endpoint, and the OTA verification certificate,
//! then read the device's CSR and send back the issued certificate. Afterwards it keeps
//! logging device output until the device prints [`markers::SENTINEL`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{backend::Backend, csr, error::SessionError, framing::FramedStream};

/// Substrings of the device output that mark each prompt.
pub mod markers {
    /// Every yes/no question the device asks ends with this.
    pub const YES_NO: &str = "y/n";
    pub const ALREADY_PROVISIONED: &str = "Device was already provisioned";
    pub const PROVISION_PROMPT: &str = "Do you want to provision the device";
    pub const READ_THING_NAME: &str = "read thing name";
    pub const READ_ENDPOINT: &str = "read thing endpoint";
    pub const READ_OTA_KEY: &str = "read OTA verification key";
    /// Printed once the device has written its CSR.
    pub const FINISHED_CSR: &str = "Finished outputting CSR";
    pub const READY_FOR_CERTIFICATE: &str = "Ready to read device certificate";
    /// The device prints this when it's done; the session ends once it's seen.
    pub const SENTINEL: &str = "!!!!!!!!!!!!!!";
}

/// The answer sent to every yes/no question.
pub const AFFIRMATIVE: &str = "y";

/// Session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// How long to wait after the device asks for its certificate before sending it.
    ///
    /// The default is 1 second.
    pub settle_delay: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(1),
        }
    }
}

/// A step of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum State {
    AwaitProvisionPrompt,
    AwaitReprovisionConfirm,
    AwaitProvisionConfirm,
    SendThingName,
    SendEndpoint,
    SendOtaVerificationCert,
    SendDeviceCertificate,
    Monitor,
}

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            State::AwaitProvisionPrompt => "AwaitProvisionPrompt",
            State::AwaitReprovisionConfirm => "AwaitReprovisionConfirm",
            State::AwaitProvisionConfirm => "AwaitProvisionConfirm",
            State::SendThingName => "SendThingName",
            State::SendEndpoint => "SendEndpoint",
            State::SendOtaVerificationCert => "SendOtaVerificationCert",
            State::SendDeviceCertificate => "SendDeviceCertificate",
            State::Monitor => "Monitor",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The device was sent its certificate.
    Provisioned {
        /// The PEM-encoded certificate issued to the device.
        certificate: String,
    },
    /// The device didn't offer to be provisioned.
    Declined,
}

#[derive(Debug, Default)]
struct Progress {
    /// The output of the most recent read.
    device_output: String,
    certificate: Option<String>,
}

/// One provisioning run against one device.
#[derive(Debug)]
pub struct Session<S> {
    stream: FramedStream<S>,
    thing_name: String,
    options: Options,
}

impl<S> Session<S> {
    pub fn new(stream: FramedStream<S>, thing_name: impl Into<String>, options: Options) -> Self {
        Self {
            stream,
            thing_name: thing_name.into(),
            options,
        }
    }

    pub fn thing_name(&self) -> &str {
        &self.thing_name
    }

    /// Release the stream.
    pub fn into_inner(self) -> FramedStream<S> {
        self.stream
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    /// Run the handshake to completion.
    ///
    /// Cancelling `halt_token` while the session is monitoring device output ends the session
    /// normally; cancelling it at any earlier point is an error.
    ///
    /// # Errors
    ///
    /// Any transport failure, a missing CSR, or a backend failure ends the session with an
    /// error. Nothing is retried.
    #[instrument(skip_all, fields(thing_name = %self.thing_name), err)]
    pub async fn run<B: Backend>(
        &mut self,
        backend: &B,
        halt_token: CancellationToken,
    ) -> Result<Outcome, SessionError> {
        backend
            .check_thing_name(&self.thing_name)
            .map_err(SessionError::Backend)?;

        let mut progress = Progress::default();
        let mut state = State::AwaitProvisionPrompt;

        loop {
            tracing::info!(state = state.name(), "Entering state");
            let next = tokio::select! {
                biased;
                _ = halt_token.cancelled() => {
                    if state == State::Monitor {
                        tracing::info!("Stopped monitoring device output");
                        break;
                    }
                    return Err(SessionError::Interrupted { state: state.name() });
                }
                next = self.step(state, backend, &mut progress) => next?,
            };

            match next {
                Some(next) => state = next,
                None => break,
            }
        }

        Ok(progress
            .certificate
            .map_or(Outcome::Declined, |certificate| Outcome::Provisioned {
                certificate,
            }))
    }

    /// Run a single state; returns the state to move to, or `None` once the session is over.
    async fn step<B: Backend>(
        &mut self,
        state: State,
        backend: &B,
        progress: &mut Progress,
    ) -> Result<Option<State>, SessionError> {
        let next = match state {
            State::AwaitProvisionPrompt => {
                progress.device_output = self.stream.read(markers::YES_NO, None).await?;
                if progress.device_output.contains(markers::ALREADY_PROVISIONED) {
                    State::AwaitReprovisionConfirm
                } else {
                    State::AwaitProvisionConfirm
                }
            }
            State::AwaitReprovisionConfirm => {
                self.stream.write(AFFIRMATIVE).await?;
                progress.device_output = self.stream.read(markers::YES_NO, None).await?;
                State::AwaitProvisionConfirm
            }
            State::AwaitProvisionConfirm => {
                if progress.device_output.contains(markers::PROVISION_PROMPT) {
                    self.stream.write(AFFIRMATIVE).await?;
                    State::SendThingName
                } else {
                    tracing::warn!("The device did not offer to provision; monitoring its output");
                    State::Monitor
                }
            }
            State::SendThingName => {
                progress.device_output = self.stream.read(markers::READ_THING_NAME, None).await?;
                self.stream.write(&self.thing_name).await?;
                State::SendEndpoint
            }
            State::SendEndpoint => {
                progress.device_output = self.stream.read(markers::READ_ENDPOINT, None).await?;
                let endpoint = backend
                    .resolve_endpoint()
                    .await
                    .map_err(SessionError::Backend)?;
                tracing::debug!(%endpoint, "Resolved endpoint");
                self.stream.write(&endpoint).await?;
                State::SendOtaVerificationCert
            }
            State::SendOtaVerificationCert => {
                progress.device_output = self.stream.read(markers::READ_OTA_KEY, None).await?;
                let verification = backend
                    .ota_verification_certificate()
                    .await
                    .map_err(SessionError::Backend)?;
                let certificate_id = backend
                    .import_certificate(&verification.certificate, &verification.private_key)
                    .await
                    .map_err(SessionError::Backend)?;
                tracing::info!(%certificate_id, "Imported OTA verification certificate");
                let pem = tokio::fs::read_to_string(&verification.certificate)
                    .await
                    .map_err(|error| {
                        SessionError::Backend(anyhow::Error::new(error).context(format!(
                            "failed to read the OTA verification certificate from {}",
                            verification.certificate.display()
                        )))
                    })?;
                self.stream.write(pem.trim()).await?;
                State::SendDeviceCertificate
            }
            State::SendDeviceCertificate => {
                progress.device_output = self.stream.read(markers::FINISHED_CSR, None).await?;
                let csr = csr::extract(&progress.device_output)?.to_string();
                tracing::debug!(%csr, "Extracted CSR from the device output");

                progress.device_output = self
                    .stream
                    .read(markers::READY_FOR_CERTIFICATE, None)
                    .await?;
                let certificate = backend
                    .issue_certificate_from_csr(&csr, &self.thing_name)
                    .await
                    .map_err(SessionError::Backend)?;
                tokio::time::sleep(self.options.settle_delay).await;
                self.stream.write(certificate.trim()).await?;
                tracing::info!("Sent the device its certificate");
                progress.certificate = Some(certificate);
                State::Monitor
            }
            State::Monitor => {
                progress.device_output = self.stream.drain(markers::SENTINEL).await?;
                tracing::info!("Device finished");
                return Ok(None);
            }
        };

        Ok(Some(next))
    }
}
