// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! A [`Backend`] that keeps everything on the local filesystem.
//!
//! The state directory doubles as a small certificate authority and device registry:
//!
//! ```text
//! ca.certificate.pem, ca.private_key.pem     the CA that signs device certificates
//! ota.certificate.pem, ota.private_key.pem   the OTA code-verification certificate
//! certificates/<id>.pem                      issued device certificates
//! imported/<id>.{certificate,private_key}.pem
//! policies/<name>.json
//! things/<name>.json
//! ```
//!
//! Certificate IDs are the hex-encoded SHA-256 fingerprint of the DER certificate. The CA and
//! the OTA certificate are generated (as P-256 keys) the first time they are needed.

use std::{
    num::NonZeroU32,
    path::{Path, PathBuf},
};

use anyhow::Context;
use openssl::{
    asn1::{Asn1Integer, Asn1Time},
    bn::BigNum,
    ec::{EcGroup, EcKey},
    hash::MessageDigest,
    nid::Nid,
    pkey::{HasPublic, PKey, PKeyRef, Private},
    x509::{self, X509, X509Builder, X509NameBuilder, X509NameRef, X509Ref, X509Req},
};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::instrument;

use super::{Backend, VerificationCertificate, validate_thing_name};

const CERTIFICATES: &str = "certificates";
const IMPORTED: &str = "imported";
const POLICIES: &str = "policies";
const THINGS: &str = "things";

/// Configuration for the [`LocalBackend`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The directory holding the certificate authority, issued certificates, and device
    /// registry. Back this directory up; losing the CA key means devices can't be re-issued
    /// certificates that chain to the same root.
    ///
    /// Defaults to "/var/lib/provisioner/".
    pub state_directory: PathBuf,
    /// The endpoint address written to devices.
    pub endpoint: String,
    /// The policy attached to every provisioned device.
    pub policy_name: String,
    /// The CA certificate; relative paths are relative to `state_directory`.
    pub ca_certificate: PathBuf,
    /// The CA private key; relative paths are relative to `state_directory`.
    pub ca_private_key: PathBuf,
    /// The common name used if the CA is generated.
    pub ca_common_name: String,
    /// The OTA code-verification certificate; relative paths are relative to
    /// `state_directory`.
    pub ota_certificate: PathBuf,
    /// The OTA code-signing private key; relative paths are relative to `state_directory`.
    pub ota_private_key: PathBuf,
    /// The common name used if the OTA certificate is generated.
    pub ota_common_name: String,
    /// How long generated and issued certificates are valid for; the default is 365 days.
    pub validity_days: NonZeroU32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_directory: PathBuf::from("/var/lib/provisioner/"),
            endpoint: "iot.example.com".to_string(),
            policy_name: "DemoPolicy".to_string(),
            ca_certificate: PathBuf::from("ca.certificate.pem"),
            ca_private_key: PathBuf::from("ca.private_key.pem"),
            ca_common_name: "Provisioner Local CA".to_string(),
            ota_certificate: PathBuf::from("ota.certificate.pem"),
            ota_private_key: PathBuf::from("ota.private_key.pem"),
            ota_common_name: "OTA Code Verify Key".to_string(),
            validity_days: NonZeroU32::new(365).unwrap(),
        }
    }
}

impl Config {
    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.state_directory.join(path)
        }
    }
}

/// A device registered in the local registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThingRecord {
    pub thing_name: String,
    /// The ID of the certificate most recently issued to the device.
    pub certificate_id: String,
    pub policy_name: String,
}

#[derive(Debug, Clone, Copy)]
enum Usage {
    CertificateAuthority,
    CodeSigning,
    Device,
}

/// A local certificate authority and file-backed device registry.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    config: Config,
}

impl LocalBackend {
    /// Prepare the state directory, generating the certificate authority if it doesn't exist.
    ///
    /// # Errors
    ///
    /// An error is returned if the state directory can't be created, or if only one of the CA
    /// certificate and private key exists.
    #[instrument(skip_all, err, fields(state_directory = %config.state_directory.display()))]
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        for directory in [CERTIFICATES, IMPORTED, POLICIES, THINGS] {
            let directory = config.state_directory.join(directory);
            tokio::fs::create_dir_all(&directory)
                .await
                .with_context(|| format!("failed to create {}", directory.display()))?;
        }

        let backend = Self { config };
        let created = backend
            .ensure_self_signed(
                &backend.config.ca_certificate,
                &backend.config.ca_private_key,
                &backend.config.ca_common_name,
                Usage::CertificateAuthority,
            )
            .await?;
        if created {
            tracing::info!("Generated a new local certificate authority");
        }

        Ok(backend)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Look up a registered device.
    pub async fn thing(&self, thing_name: &str) -> anyhow::Result<ThingRecord> {
        validate_thing_name(thing_name)?;
        let path = self.thing_path(thing_name);
        let record = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("no thing named '{thing_name}' is registered"))?;
        serde_json::from_str(&record)
            .with_context(|| format!("the record at {} is invalid", path.display()))
    }

    fn thing_path(&self, thing_name: &str) -> PathBuf {
        self.config
            .state_directory
            .join(THINGS)
            .join(format!("{thing_name}.json"))
    }

    async fn certificate_authority(&self) -> anyhow::Result<(X509, PKey<Private>)> {
        let certificate_path = self.config.resolve(&self.config.ca_certificate);
        let private_key_path = self.config.resolve(&self.config.ca_private_key);
        let certificate = tokio::fs::read(&certificate_path)
            .await
            .with_context(|| format!("failed to read {}", certificate_path.display()))?;
        let certificate = X509::from_pem(&certificate)
            .with_context(|| format!("{} is not a PEM certificate", certificate_path.display()))?;
        let private_key = tokio::fs::read(&private_key_path)
            .await
            .with_context(|| format!("failed to read {}", private_key_path.display()))?;
        let private_key = PKey::private_key_from_pem(&private_key)
            .with_context(|| format!("{} is not a PEM private key", private_key_path.display()))?;

        if !certificate.public_key()?.public_eq(&private_key) {
            anyhow::bail!("the CA private key does not match the CA certificate");
        }
        Ok((certificate, private_key))
    }

    /// Generate a self-signed certificate and key unless both already exist.
    ///
    /// Returns whether anything was generated.
    async fn ensure_self_signed(
        &self,
        certificate: &Path,
        private_key: &Path,
        common_name: &str,
        usage: Usage,
    ) -> anyhow::Result<bool> {
        let certificate = self.config.resolve(certificate);
        let private_key = self.config.resolve(private_key);
        match (certificate.exists(), private_key.exists()) {
            (true, true) => Ok(false),
            (false, false) => {
                let key = PKey::from_ec_key(EcKey::generate(
                    EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?.as_ref(),
                )?)?;
                let subject = subject_name(common_name)?;
                let cert = build_certificate(
                    &subject,
                    &key,
                    None,
                    &key,
                    self.config.validity_days.get(),
                    usage,
                )?;
                write_new(&private_key, &key.private_key_to_pem_pkcs8()?, 0o600).await?;
                if let Err(error) = write_new(&certificate, &cert.to_pem()?, 0o644).await {
                    // The key is useless without its certificate.
                    if let Err(remove_error) = tokio::fs::remove_file(&private_key).await {
                        tracing::error!(?remove_error, private_key=%private_key.display(), "Failed to remove private key");
                    }
                    return Err(error);
                }
                tracing::debug!(certificate=%certificate.display(), ?usage, "Generated self-signed certificate");
                Ok(true)
            }
            _ => Err(anyhow::anyhow!(
                "only one of {} and {} exists; provide both or neither",
                certificate.display(),
                private_key.display()
            )),
        }
    }

    async fn create_policy(&self) -> anyhow::Result<()> {
        validate_policy_name(&self.config.policy_name)?;
        let path = self
            .config
            .state_directory
            .join(POLICIES)
            .join(format!("{}.json", self.config.policy_name));
        if path.exists() {
            return Ok(());
        }

        let document = serde_json::json!({
            "Version": "2012-10-17",
            "Statement": [{"Effect": "Allow", "Action": "iot:*", "Resource": "*"}],
        });
        tokio::fs::write(&path, serde_json::to_string_pretty(&document)?)
            .await
            .with_context(|| format!("failed to write policy to {}", path.display()))?;
        tracing::info!(policy_name = %self.config.policy_name, "Created policy");
        Ok(())
    }
}

impl Backend for LocalBackend {
    async fn resolve_endpoint(&self) -> anyhow::Result<String> {
        Ok(self.config.endpoint.clone())
    }

    #[instrument(skip(self, csr), err)]
    async fn issue_certificate_from_csr(
        &self,
        csr: &str,
        thing_name: &str,
    ) -> anyhow::Result<String> {
        validate_thing_name(thing_name)?;
        let request = X509Req::from_pem(csr.as_bytes())
            .context("the certificate signing request is not valid PEM")?;
        let public_key = request.public_key()?;
        if !request.verify(&public_key)? {
            anyhow::bail!("the certificate signing request's signature is invalid");
        }

        let (ca_certificate, ca_private_key) = self.certificate_authority().await?;
        let certificate = build_certificate(
            request.subject_name(),
            &public_key,
            Some(&*ca_certificate),
            &ca_private_key,
            self.config.validity_days.get(),
            Usage::Device,
        )?;
        let certificate_id = certificate_id(&certificate)?;
        let pem = String::from_utf8(certificate.to_pem()?)?;
        let path = self
            .config
            .state_directory
            .join(CERTIFICATES)
            .join(format!("{certificate_id}.pem"));
        write_new(&path, pem.as_bytes(), 0o644).await?;

        self.create_policy().await?;
        let record = ThingRecord {
            thing_name: thing_name.to_string(),
            certificate_id,
            policy_name: self.config.policy_name.clone(),
        };
        tokio::fs::write(
            self.thing_path(thing_name),
            serde_json::to_string_pretty(&record)?,
        )
        .await
        .context("failed to register the thing")?;
        tracing::info!(
            thing_name,
            certificate_id = %record.certificate_id,
            policy_name = %record.policy_name,
            "Issued device certificate and registered thing"
        );

        Ok(pem)
    }

    #[instrument(skip(self), err)]
    async fn ota_verification_certificate(&self) -> anyhow::Result<VerificationCertificate> {
        let created = self
            .ensure_self_signed(
                &self.config.ota_certificate,
                &self.config.ota_private_key,
                &self.config.ota_common_name,
                Usage::CodeSigning,
            )
            .await?;
        if created {
            tracing::info!("Generated a new OTA code-verification certificate");
        }

        Ok(VerificationCertificate {
            certificate: self.config.resolve(&self.config.ota_certificate),
            private_key: self.config.resolve(&self.config.ota_private_key),
        })
    }

    #[instrument(skip(self), err)]
    async fn import_certificate(
        &self,
        certificate: &Path,
        private_key: &Path,
    ) -> anyhow::Result<String> {
        let certificate_pem = tokio::fs::read(certificate)
            .await
            .with_context(|| format!("failed to read {}", certificate.display()))?;
        let private_key_pem = tokio::fs::read(private_key)
            .await
            .with_context(|| format!("failed to read {}", private_key.display()))?;
        let cert = X509::from_pem(&certificate_pem)
            .with_context(|| format!("{} is not a PEM certificate", certificate.display()))?;
        let key = PKey::private_key_from_pem(&private_key_pem)
            .with_context(|| format!("{} is not a PEM private key", private_key.display()))?;
        if !cert.public_key()?.public_eq(&key) {
            anyhow::bail!("the private key does not match the certificate");
        }

        let certificate_id = certificate_id(&cert)?;
        let directory = self.config.state_directory.join(IMPORTED);
        let destination = directory.join(format!("{certificate_id}.certificate.pem"));
        if destination.exists() {
            tracing::info!(%certificate_id, "Certificate was already imported");
            return Ok(certificate_id);
        }
        write_new(
            &directory.join(format!("{certificate_id}.private_key.pem")),
            &private_key_pem,
            0o600,
        )
        .await?;
        write_new(&destination, &certificate_pem, 0o644).await?;
        tracing::info!(%certificate_id, "Imported certificate");

        Ok(certificate_id)
    }
}

fn validate_policy_name(policy_name: &str) -> anyhow::Result<()> {
    let valid = !policy_name.is_empty()
        && policy_name.len() <= 128
        && policy_name.bytes().all(|byte| {
            byte.is_ascii_alphanumeric() || matches!(byte, b'+' | b'=' | b',' | b'.' | b'@' | b'-' | b'_')
        });
    if !valid {
        anyhow::bail!("'{policy_name}' is not a valid policy name");
    }
    Ok(())
}

fn subject_name(common_name: &str) -> anyhow::Result<x509::X509Name> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
    Ok(name.build())
}

fn build_certificate<T: HasPublic>(
    subject: &X509NameRef,
    public_key: &PKeyRef<T>,
    issuer: Option<&X509Ref>,
    signing_key: &PKeyRef<Private>,
    validity_days: u32,
    usage: Usage,
) -> anyhow::Result<X509> {
    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    builder.set_pubkey(public_key)?;

    let mut serial_number = [0; 20];
    openssl::rand::rand_bytes(&mut serial_number)?;
    let mut serial_number = BigNum::from_slice(&serial_number)?;
    serial_number.set_negative(false);
    builder.set_serial_number(Asn1Integer::from_bn(&serial_number)?.as_ref())?;

    builder.set_subject_name(subject)?;
    builder.set_issuer_name(issuer.map_or(subject, |issuer| issuer.subject_name()))?;
    builder.set_not_before(Asn1Time::days_from_now(0)?.as_ref())?;
    builder.set_not_after(Asn1Time::days_from_now(validity_days)?.as_ref())?;

    let mut basic_constraints = x509::extension::BasicConstraints::new();
    basic_constraints.critical();
    if let Usage::CertificateAuthority = usage {
        basic_constraints.ca().pathlen(0);
    }
    builder.append_extension(basic_constraints.build()?)?;

    match usage {
        Usage::CertificateAuthority => {
            builder.append_extension(
                x509::extension::KeyUsage::new()
                    .critical()
                    .key_cert_sign()
                    .crl_sign()
                    .build()?,
            )?;
        }
        Usage::CodeSigning => {
            builder.append_extension(
                x509::extension::KeyUsage::new()
                    .critical()
                    .digital_signature()
                    .build()?,
            )?;
            builder.append_extension(
                x509::extension::ExtendedKeyUsage::new()
                    .code_signing()
                    .build()?,
            )?;
        }
        Usage::Device => {
            builder.append_extension(
                x509::extension::KeyUsage::new()
                    .critical()
                    .digital_signature()
                    .build()?,
            )?;
            builder.append_extension(
                x509::extension::ExtendedKeyUsage::new()
                    .client_auth()
                    .build()?,
            )?;
        }
    }

    let subject_key_id = x509::extension::SubjectKeyIdentifier::new()
        .build(&builder.x509v3_context(issuer, None))?;
    builder.append_extension(subject_key_id)?;
    if issuer.is_some() {
        let authority_key_id = x509::extension::AuthorityKeyIdentifier::new()
            .keyid(false)
            .build(&builder.x509v3_context(issuer, None))?;
        builder.append_extension(authority_key_id)?;
    }

    builder.sign(signing_key, MessageDigest::sha256())?;
    Ok(builder.build())
}

fn certificate_id(certificate: &X509Ref) -> anyhow::Result<String> {
    Ok(certificate
        .digest(MessageDigest::sha256())?
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect())
}

/// Write a file that must not already exist.
async fn write_new(path: &Path, contents: &[u8], mode: u32) -> anyhow::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(mode);
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options
        .open(path)
        .await
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(contents).await?;
    file.flush().await?;
    Ok(())
}
