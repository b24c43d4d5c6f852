//! Repository targets — loaded from a JSON file, reloadable at runtime.

use std::path::{Path, PathBuf};

use diagram_pipeline::{Orchestrator, PipelineError, RepoTarget};

#[derive(Debug, thiserror::Error)]
pub enum TargetLoadError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error(transparent)]
    Invalid(#[from] PipelineError),
}

/// Read a JSON array of targets. Validation happens when the set is applied.
pub fn load_targets(path: &Path) -> Result<Vec<RepoTarget>, TargetLoadError> {
    let bytes = std::fs::read(path).map_err(|source| TargetLoadError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| TargetLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Re-read the target file and swap it into the orchestrator.
///
/// On any error the running target set is left untouched.
pub fn reload(orchestrator: &Orchestrator, path: &Path) -> Result<Vec<String>, TargetLoadError> {
    let result = load_targets(path).and_then(|targets| orchestrator.reload(targets).map_err(Into::into));
    match &result {
        Ok(()) => {
            crate::metrics::targets_reloaded("ok");
            tracing::info!(path = %path.display(), repos = ?orchestrator.repositories(), "Targets reloaded");
        }
        Err(e) => {
            crate::metrics::targets_reloaded("error");
            tracing::error!(path = %path.display(), "Target reload failed: {e}");
        }
    }
    result.map(|()| orchestrator.repositories())
}
