// #![deny(warnings)]

#![warn(unused_extern_crates)]
// Enable some groups of clippy lints.
#![deny(clippy::suspicious)]
#![deny(clippy::perf)]
// Specific lints to enforce.
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::trivially_copy_pass_by_ref)]
#![deny(clippy::disallowed_types)]
#![deny(clippy::manual_let_else)]
#![allow(clippy::unreachable)]

//! Userspace support for kAFS, the Linux in-kernel AFS client.
//!
//! AFS tokens live in the kernel keyring as `rxrpc` keys. This crate turns Kerberos
//! service tickets into those keys, scopes them into process authentication groups
//! (PAGs, which are just named session keyrings), and drives the whole thing from a
//! PAM session so that a login ends up with tokens for the configured cells.

pub mod afslog;
pub mod ccache;
pub mod cells;
pub mod constants;
pub(crate) mod crypto;
pub mod error;
pub mod identity;
pub mod keyring;
pub mod procfs;
pub mod profile;
pub mod session;
pub mod token;

#[cfg(feature = "pam")]
mod pam;

#[cfg(test)]
pub(crate) mod testing;

pub use error::KafsError;
