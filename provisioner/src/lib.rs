// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

/*!
# Provisioner

Provisioner gives an embedded device its X.509 identity over the device's serial console.

The device firmware exposes an interactive provisioning menu on its UART. Provisioner drives
that menu: it confirms the device should be provisioned, sends it a thing name and the endpoint
it should connect to, sends the certificate it uses to verify OTA updates, reads the
certificate signing request the device generates, and sends back a certificate issued for it.

## Components

The [`framing`] module implements the byte-level protocol the menu speaks: messages are sent a
character at a time with a short pause between characters and end with a fixed terminator, and
replies are read until a known marker appears.

The [`session`] module walks the menu from start to finish, and [`csr`] pulls the device's
signing request out of its console output.

Everything that isn't part of talking to the device, like issuing certificates or looking up the
endpoint, sits behind the [`backend::Backend`] trait. [`backend::LocalBackend`] implements it with
a certificate authority and device registry kept in a local directory.

## Crate features

* **cli** -
  Include the `provisioner` CLI, which opens a serial port and runs a session. This is a
  default feature.
*/

pub mod backend;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod csr;
pub mod error;
pub mod framing;
pub mod session;

#[cfg(test)]
mod test_utils;
