//! # oxibridge-daemon
//!
//! The oxibridge daemon: command line, logging, startup checks and the
//! status HTTP surface around an [`oxibridge_core::Session`].

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

pub mod api;
pub mod app;
pub mod cli;
pub mod logging;
pub mod state;
