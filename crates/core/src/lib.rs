//! Core domain types for the Depot media lifecycle service.
//!
//! This crate provides:
//! - The upload error taxonomy and retryability classification
//! - Bounded exponential backoff policy
//! - The batch upload processor driving file sets through object storage
//! - Media object lifecycle states
//! - Configuration types shared across crates

pub mod batch;
pub mod classify;
pub mod config;
pub mod error;
pub mod media;
pub mod retry;

pub use error::{Error, Result};

/// Default number of files processed per upload batch.
pub const DEFAULT_BATCH_SIZE: usize = 5;

/// Maximum number of files processed per upload batch.
pub const MAX_BATCH_SIZE: usize = 100;

/// Maximum storage key length accepted anywhere in the system.
pub const MAX_KEY_LENGTH: usize = 1024;
