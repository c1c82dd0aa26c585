//! Preview controller data models.

pub mod deployment;
pub mod environment;
pub mod revision;
