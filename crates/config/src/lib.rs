//! Configuration module for Clip Relay
//!
//! Handles layered loading from TOML files (user file, defaults file, built-in
//! defaults), environment variable overrides, and validation.

pub mod config;

pub use config::*;
