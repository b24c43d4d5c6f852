//! Local working-tree scan for `diagram-scan`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use diagram_pipeline::metadata::{sidecar_path, DiagramMetadata};
use diagram_pipeline::stages::{analyze_source, FileOutcome};
use diagram_pipeline::{DialectRegistry, RepoTarget};
use eyre::WrapErr;
use walkdir::{DirEntry, WalkDir};

const SKIPPED_DIRS: [&str; 3] = [".git", "target", "node_modules"];

fn is_skipped(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| SKIPPED_DIRS.contains(&name))
}

/// Repository-style path of `path` under `root`, always `/`-separated.
fn relative(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Run the per-file stages over every qualifying file under `root`, sorted by path.
pub fn scan(
    root: &Path,
    target: &RepoTarget,
    registry: &DialectRegistry,
    generated_at: DateTime<Utc>,
) -> eyre::Result<Vec<FileOutcome>> {
    let mut files: Vec<(String, PathBuf)> = Vec::new();
    for entry in WalkDir::new(root).into_iter().filter_entry(|e| !is_skipped(e)) {
        let entry = entry.wrap_err_with(|| format!("walking {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = relative(root, entry.path());
        if target.matches(&rel) {
            files.push((rel, entry.into_path()));
        }
    }
    files.sort();
    tracing::debug!(root = %root.display(), files = files.len(), "Scanning working tree");

    files
        .into_iter()
        .map(|(rel, path)| {
            let bytes = fs::read(&path).wrap_err_with(|| format!("reading {}", path.display()))?;
            let text = String::from_utf8_lossy(&bytes);
            Ok(analyze_source(registry, &rel, &text, generated_at))
        })
        .collect()
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub written: Vec<String>,
    pub deleted: Vec<String>,
}

/// Bring sidecars under `root` in line with `outcomes`, leaving up-to-date ones untouched.
///
/// Refuses to write anything when two sources map to the same sidecar, and
/// only removes sidecars recorded for the source being cleaned up.
pub fn write_sidecars(root: &Path, suffix: &str, outcomes: &[FileOutcome]) -> eyre::Result<WriteSummary> {
    let mut claimed: HashMap<String, &str> = HashMap::new();
    for outcome in outcomes {
        if let FileOutcome::Analyzed { path, .. } = outcome {
            let sidecar = sidecar_path(path, suffix);
            if let Some(first) = claimed.insert(sidecar.clone(), path) {
                eyre::bail!("{first} and {path} both map to {sidecar}");
            }
        }
    }

    let mut summary = WriteSummary::default();
    for outcome in outcomes {
        let sidecar = sidecar_path(outcome.path(), suffix);
        let full = root.join(&sidecar);
        let current = fs::read(&full).ok().and_then(|b| DiagramMetadata::from_bytes(&b));
        match outcome {
            FileOutcome::Analyzed { metadata, .. } => {
                if current.is_some_and(|c| c.same_analysis(metadata)) {
                    continue;
                }
                fs::write(&full, metadata.to_bytes()).wrap_err_with(|| format!("writing {sidecar}"))?;
                summary.written.push(sidecar);
            }
            FileOutcome::NoBlocks { path } | FileOutcome::Deleted { path } => {
                let owned = current.is_some_and(|c| c.source_path == *path);
                if owned && !claimed.contains_key(&sidecar) {
                    fs::remove_file(&full).wrap_err_with(|| format!("removing {sidecar}"))?;
                    summary.deleted.push(sidecar);
                }
            }
            FileOutcome::Invalid { .. } => {}
        }
    }
    Ok(summary)
}
