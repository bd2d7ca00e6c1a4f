// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Define the command-line interface.

use std::path::PathBuf;

use clap::Parser;

/// Provision a device with an X.509 identity over its serial console.
///
/// The device must be running firmware with the provisioning menu enabled. Connect it, then run
/// the `provision` subcommand; the device's console output is logged as the session runs.
///
/// Certificates are issued by a certificate authority kept in the state directory, which is
/// created on first use. To view the current configuration, run the `config` subcommand.
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// The path to the configuration file.
    ///
    /// If no path is provided, the defaults are used. To view the configuration, run the
    /// `config` subcommand.
    #[arg(long, short, env = "PROVISIONER_CONFIG")]
    pub config: Option<PathBuf>,

    /// A set of one or more comma-separated directives to filter logs.
    ///
    /// The general format is "target_name[span_name{field=value}]=level" where level is
    /// one of TRACE, DEBUG, INFO, WARN, ERROR. Device console output is logged at INFO
    /// with the "provisioner::device" target.
    ///
    /// Details: https://docs.rs/tracing-subscriber/0.3.19/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[arg(long, env = "PROVISIONER_LOG", default_value = "WARN,provisioner=INFO")]
    pub log_filter: String,

    /// The serial port the device is attached to; overrides the configuration file.
    #[arg(long, short)]
    pub port: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand, Debug)]
pub enum Command {
    /// Run the provisioning handshake with the attached device.
    ///
    /// Once the device has its certificate, its console output is logged until it reports
    /// it's done. Press Ctrl+C to stop watching early.
    Provision {
        /// The name to register the device under.
        ///
        /// If no name is provided, one is generated.
        #[arg(long, short)]
        thing_name: Option<String>,
    },

    /// Log the device's console output until it reports it's done, or until interrupted.
    Monitor,

    /// See the current configuration.
    Config,
}
