//! Common utilities for usbhid-rs
//!
//! This crate provides functionality shared between the core library and
//! the command line tool: the error type every layer reports through and
//! the tracing subscriber setup.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
pub use logging::setup_logging;
