// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use provisioner::{
    backend::{LocalBackend, validate_thing_name},
    cli::{Cli, Command},
    config::{Config, SerialPort, load_config},
    framing::FramedStream,
    session::{Outcome, Session, markers},
};
use tokio::signal::unix::{SignalKind, signal};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan, layer::SubscriberExt};

// The path, relative to $CONFIGURATION_DIRECTORY, of the default config file location.
const DEFAULT_CONFIG: &str = "provisioner/config.toml";

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let opts = Cli::parse();

    // Unfortunately we can't use clap's value_parser since EnvFilter does not
    // implement Clone.
    let log_filter = EnvFilter::builder().parse(&opts.log_filter).context(
        "PROVISIONER_LOG contains an invalid log directive; refer to \
            https://docs.rs/tracing-subscriber/0.3.19/tracing_subscriber/\
            filter/struct.EnvFilter.html#directives for format details.",
    )?;
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(log_filter);
    tracing::subscriber::set_global_default(registry)
        .expect("Programming error: set_global_default should only be called once.");

    let mut config = load_config::<Config>(opts.config, PathBuf::from(DEFAULT_CONFIG).as_path())?;
    if let Some(port) = opts.port {
        config.serial.port = port;
    }

    match opts.command {
        Command::Provision { thing_name } => {
            let thing_name = thing_name
                .unwrap_or_else(|| format!("generated-thing-{}", uuid::Uuid::now_v7()));
            validate_thing_name(&thing_name)?;
            let backend = LocalBackend::new(config.local.clone()).await?;
            let stream = FramedStream::new(open_serial(&config.serial)?, config.framing.clone());
            let halt_token = CancellationToken::new();
            tokio::spawn(signal_handler(halt_token.clone()));

            let mut session = Session::new(stream, thing_name, config.session.clone());
            match session.run(&backend, halt_token).await? {
                Outcome::Provisioned { .. } => {
                    tracing::info!(thing_name = session.thing_name(), "Device provisioned");
                }
                Outcome::Declined => {
                    tracing::warn!("The device was not provisioned");
                }
            }
        }
        Command::Monitor => {
            let mut stream = FramedStream::new(open_serial(&config.serial)?, config.framing);
            let halt_token = CancellationToken::new();
            tokio::spawn(signal_handler(halt_token.clone()));

            tokio::select! {
                _ = halt_token.cancelled() => {
                    tracing::info!("Stopped monitoring device output");
                }
                output = stream.drain(markers::SENTINEL) => {
                    output?;
                    tracing::info!("Device finished");
                }
            }
        }
        Command::Config => {
            println!(
                "# This is the current configuration\n\n{config}\n# This concludes the configuration.\n"
            );
        }
    }

    Ok(())
}

/// Open the serial port as 8N1 at the configured baud rate.
fn open_serial(serial: &SerialPort) -> anyhow::Result<SerialStream> {
    let stream = tokio_serial::new(&serial.port, serial.baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .open_native_async()
        .with_context(|| format!("failed to open serial port {}", serial.port))?;
    tracing::info!(port = %serial.port, baud_rate = serial.baud_rate, "Opened serial port");
    Ok(stream)
}

/// Install and manage signal handlers for the process.
///
/// # SIGTERM and SIGINT
///
/// Sending SIGTERM or SIGINT to the process cancels `halt_token`. While the device's output
/// is being monitored this ends the process normally; before then, it aborts the session.
async fn signal_handler(halt_token: CancellationToken) -> Result<(), anyhow::Error> {
    let mut sigterm_stream = signal(SignalKind::terminate()).inspect_err(|error| {
        tracing::error!(?error, "Failed to register a SIGTERM signal handler");
    })?;
    let mut sigint_stream = signal(SignalKind::interrupt()).inspect_err(|error| {
        tracing::error!(?error, "Failed to register a SIGINT signal handler");
    })?;

    loop {
        tokio::select! {
            _ = sigterm_stream.recv() => {
                tracing::info!("SIGTERM received, stopping");
                halt_token.cancel();
            }
            _ = sigint_stream.recv() => {
                tracing::info!("SIGINT received, stopping");
                halt_token.cancel();
            }
        }
    }
}
