//! StackVM CLI library.
//!
//! Shared pieces of the `stackvm` binary: colored output, configuration
//! discovery and program listings.

pub mod colors;
pub mod config;
pub mod inspect;
