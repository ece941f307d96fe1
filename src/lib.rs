//! convoy: agentless rollout and reboot coordination for Ubuntu and NixOS
//! fleets.
//!
//! The engine lives in [`domain`]; [`transport`] and [`nix`] provide the
//! OpenSSH and nix CLI adapters it drives.

pub mod config;
pub mod domain;
pub mod error;
pub mod inventory;
pub mod logging;
pub mod nix;
pub mod transport;

#[cfg(test)]
mod testing;
