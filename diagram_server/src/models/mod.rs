//! Inbound payload shapes.

pub mod github_push;
