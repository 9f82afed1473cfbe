//! Test utilities for `serial-cam`
//!
//! Provides synthetic stream generation and test helpers for validating
//! the synchronize-and-decode pipeline without a physical serial device.

pub mod stream_generator;

pub use stream_generator::*;
