//! HTTP handlers.

pub mod cleanup;
pub mod health;
pub mod media;

pub use cleanup::{
    cancel_cleanup_job, execute_cleanup, get_cleanup_job, list_cleanup_jobs, scan_cleanup,
};
pub use health::health_check;
pub use media::upload_media;
