//! Business logic behind the HTTP surface.

pub mod cluster;
pub mod comment;
pub mod deployment_service;
pub mod environment_service;
pub mod github;
pub mod manifest;
pub mod workflow;

#[cfg(test)]
pub mod testing;
