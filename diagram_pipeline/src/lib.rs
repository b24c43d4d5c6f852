//! Diagram pipeline — keeps diagram metadata in sync with a repository.
//!
//! A push event flows through change detection, block extraction, dialect
//! validation, complexity analysis and metadata generation per file, then
//! the reconciler commits every metadata change in one batch and opens
//! issues for blocks that failed validation.

pub mod complexity;
pub mod detector;
pub mod error;
pub mod extractor;
pub mod fakes;
pub mod metadata;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod platform;
pub mod reconciler;
pub mod retry;
pub mod stages;
pub mod validator;

pub use error::{PipelineError, PipelineResult, PlatformError};
pub use model::{ChangeEvent, ChangedFile, DiagramBlock, DiagramChange, EventType, FileStatus, RepoTarget, ValidationResult};
pub use orchestrator::{Acknowledgement, Orchestrator, Pipeline, PipelineConfig, RunState, RunStatus, SubmitOutcome};
pub use platform::{FileOp, HostingPlatform, NewIssue};
pub use validator::DialectRegistry;
