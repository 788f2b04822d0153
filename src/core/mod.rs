//! Core runtime infrastructure.
//!
//! This module contains the essential components for running statebase:
//! - [`config`] - Configuration parsing and validation
//! - [`runtime`] - Process lifecycle: datastore, listener, shutdown
//! - [`error`] - Error types shared by every layer

pub mod config;
pub mod error;
pub mod runtime;
