//! Change detection — narrows a commit's touched files to diagram sources.

use futures::future::join_all;

use crate::model::{ChangeEvent, ChangedFile, DiagramChange, FileStatus, RepoTarget};
use crate::platform::HostingPlatform;
use crate::retry::{with_backoff, RetryPolicy};

/// Touched files that pass the target's predicate, in event order.
pub fn relevant_files<'a>(target: &RepoTarget, event: &'a ChangeEvent) -> Vec<&'a ChangedFile> {
    event
        .changed_files
        .iter()
        .filter(|file| target.matches(&file.path))
        .collect()
}

/// Build `DiagramChange`s, fetching pre-change content for modified files.
///
/// The previous-content fetch is best-effort: a missing file or a failed call
/// leaves `previous_content` empty. Deleted files trigger no calls.
pub async fn detect(
    platform: &dyn HostingPlatform,
    target: &RepoTarget,
    event: &ChangeEvent,
    policy: &RetryPolicy,
) -> Vec<DiagramChange> {
    let files = relevant_files(target, event);
    tracing::debug!(
        repo = %target.repository,
        commit = %event.commit_sha,
        touched = event.changed_files.len(),
        relevant = files.len(),
        "Detected diagram changes"
    );

    join_all(files.into_iter().map(|file| async move {
        let previous_content = match file.status {
            FileStatus::Modified => previous_content(platform, target, event, &file.path, policy).await,
            FileStatus::Added | FileStatus::Deleted => None,
        };
        DiagramChange {
            path: file.path.clone(),
            action: file.status,
            patch: file.patch.clone(),
            previous_content,
        }
    }))
    .await
}

async fn previous_content(
    platform: &dyn HostingPlatform,
    target: &RepoTarget,
    event: &ChangeEvent,
    path: &str,
    policy: &RetryPolicy,
) -> Option<String> {
    let fetched = with_backoff(policy, "fetch_previous", || {
        platform.fetch_content(target, path, &event.parent_sha)
    })
    .await;

    match fetched {
        Ok(Some(bytes)) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Ok(None) => None,
        Err(e) => {
            tracing::warn!(
                repo = %target.repository,
                path,
                parent = %event.parent_sha,
                "Previous content unavailable: {e}"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PlatformError;
    use crate::fakes::{MemoryPlatform, PlatformCall};
    use pretty_assertions::assert_eq;

    fn target() -> RepoTarget {
        RepoTarget::new("acme/docs")
            .with_include(&["docs/"])
            .with_exclude(&["docs/private/"])
            .validate()
            .unwrap()
    }

    fn event(files: Vec<ChangedFile>) -> ChangeEvent {
        ChangeEvent::push("acme/docs", "main", "c2", "c1", files)
    }

    #[test]
    fn filter_keeps_every_qualifying_file_in_order() {
        let t = target();
        let paths = [
            "docs/z.md",
            "src/lib.rs",
            "docs/private/secret.md",
            "docs/a.MD",
            "docs/img.png",
            "README.md",
            "docs/sub/b.markdown",
        ];
        let e = event(paths.iter().map(|p| ChangedFile::new(*p, FileStatus::Added)).collect());

        let kept: Vec<&str> = relevant_files(&t, &e).iter().map(|f| f.path.as_str()).collect();
        assert_eq!(kept, vec!["docs/z.md", "docs/a.MD", "docs/sub/b.markdown"]);

        for file in &e.changed_files {
            assert_eq!(t.matches(&file.path), kept.contains(&file.path.as_str()));
        }
    }

    #[tokio::test]
    async fn modified_files_carry_previous_content() {
        let platform = MemoryPlatform::new();
        platform.seed_commit("acme/docs", "main", "c1", &[("docs/flow.md", "old")]);
        let e = event(vec![
            ChangedFile::new("docs/flow.md", FileStatus::Modified),
            ChangedFile::new("docs/new.md", FileStatus::Added),
            ChangedFile::new("docs/gone.md", FileStatus::Deleted),
        ]);

        let changes = detect(&platform, &target(), &e, &RetryPolicy::immediate(1)).await;
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[0].previous_content.as_deref(), Some("old"));
        assert_eq!(changes[1].previous_content, None);
        assert_eq!(changes[2].action, FileStatus::Deleted);
        // Only the modified file triggered a fetch.
        assert_eq!(platform.calls(PlatformCall::FetchContent), 1);
    }

    #[tokio::test]
    async fn failed_previous_fetch_is_not_an_error() {
        let platform = MemoryPlatform::new();
        platform.fail_next(
            PlatformCall::FetchContent,
            PlatformError::permanent("fetch_content", "forbidden"),
        );
        let e = event(vec![ChangedFile::new("docs/flow.md", FileStatus::Modified)]);

        let changes = detect(&platform, &target(), &e, &RetryPolicy::immediate(3)).await;
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].previous_content, None);
    }
}
