//! Server services — GitHub access and target loading.

pub mod github_service;
pub mod target_service;
