//! Repository traits per entity.

pub mod cleanup_jobs;
pub mod media;

pub use cleanup_jobs::CleanupJobRepo;
pub use media::MediaRepo;
