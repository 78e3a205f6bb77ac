use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tokio::fs;
use uuid::Uuid;

use crate::languages::LanguageSpec;
use crate::sandbox::Sandbox;

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("failed to create workspace directory: {0}")]
    Create(#[source] std::io::Error),
    #[error("failed to write source file: {0}")]
    WriteSource(#[source] std::io::Error),
}

/// Per-submission scratch directory holding the source, the compiled
/// executable, and per-case I/O files. Owned exclusively by one pipeline
/// invocation and destroyed before it returns; the `Drop` impl is a
/// last-resort sweep for panic unwinds.
#[derive(Debug)]
pub struct Workspace {
    submission_id: String,
    dir: PathBuf,
    box_id: u32,
    destroyed: bool,
}

impl Workspace {
    /// Creates a uniquely-named directory under `scratch_root` and writes the
    /// submitted source to the language's source filename with mode 0644.
    /// The directory is removed again if the source write fails.
    pub async fn prepare(
        scratch_root: &Path,
        submission_id: &str,
        source_code: &str,
        language: &LanguageSpec,
    ) -> Result<Workspace, WorkspaceError> {
        let dir = scratch_root.join(format!("judged-{}-{}", submission_id, Uuid::new_v4()));
        fs::create_dir_all(&dir)
            .await
            .map_err(WorkspaceError::Create)?;

        let workspace = Workspace {
            submission_id: submission_id.to_string(),
            dir,
            box_id: derive_box_id(submission_id),
            destroyed: false,
        };

        if let Err(err) = workspace.write_source(source_code, language).await {
            let _ = fs::remove_dir_all(&workspace.dir).await;
            return Err(err);
        }

        tracing::debug!(
            submission_id = %workspace.submission_id,
            dir = %workspace.dir.display(),
            "workspace prepared"
        );
        Ok(workspace)
    }

    async fn write_source(
        &self,
        source_code: &str,
        language: &LanguageSpec,
    ) -> Result<(), WorkspaceError> {
        let path = self.dir.join(&language.source_file);
        fs::write(&path, source_code)
            .await
            .map_err(WorkspaceError::WriteSource)?;
        fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644))
            .await
            .map_err(WorkspaceError::WriteSource)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn submission_id(&self) -> &str {
        &self.submission_id
    }

    /// Numeric sandbox slot for backends that need one (isolate box ids).
    /// Stable per submission id, so retries land in the same box.
    pub fn box_id(&self) -> u32 {
        self.box_id
    }

    /// Removes the directory tree and tells the sandbox backend to tear down
    /// any per-submission state. Idempotent; failures are logged, never
    /// propagated.
    pub async fn destroy(&mut self, sandbox: &dyn Sandbox) {
        if !self.destroyed {
            self.destroyed = true;
            sandbox.cleanup(self).await;
        }
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(
                    dir = %self.dir.display(),
                    error = %err,
                    "failed to remove workspace directory"
                );
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.destroyed {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }
}

fn derive_box_id(submission_id: &str) -> u32 {
    let mut hasher = DefaultHasher::new();
    submission_id.hash(&mut hasher);
    (hasher.finish() % 100) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::MockSandbox;

    fn text_language() -> LanguageSpec {
        LanguageSpec {
            source_file: "main.txt".to_string(),
            executable_file: String::new(),
            compile_cmd: vec![],
            run_cmd: vec!["/bin/cat".to_string(), "main.txt".to_string()],
        }
    }

    fn scratch_root() -> PathBuf {
        std::env::temp_dir().join(format!("judged-ws-test-{}", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn prepare_writes_source_with_expected_mode() {
        let root = scratch_root();
        let mut workspace = Workspace::prepare(&root, "sub-1", "hello\n", &text_language())
            .await
            .unwrap();

        let source = workspace.dir().join("main.txt");
        assert_eq!(std::fs::read_to_string(&source).unwrap(), "hello\n");
        let mode = std::fs::metadata(&source).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);

        let mut sandbox = MockSandbox::new();
        sandbox.expect_cleanup().times(1).return_const(());
        workspace.destroy(&sandbox).await;
        std::fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn destroy_removes_directory_and_is_idempotent() {
        let root = scratch_root();
        let mut workspace = Workspace::prepare(&root, "sub-2", "x", &text_language())
            .await
            .unwrap();
        let dir = workspace.dir().to_path_buf();
        assert!(dir.exists());

        let mut sandbox = MockSandbox::new();
        sandbox.expect_cleanup().times(1).return_const(());
        workspace.destroy(&sandbox).await;
        assert!(!dir.exists());

        // Second destroy: no sandbox call, no error.
        workspace.destroy(&sandbox).await;
        assert!(!dir.exists());

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn drop_sweeps_undestroyed_workspace() {
        let root = scratch_root();
        let dir = {
            let workspace = Workspace::prepare(&root, "sub-3", "x", &text_language())
                .await
                .unwrap();
            workspace.dir().to_path_buf()
        };
        assert!(!dir.exists());
        std::fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn box_id_is_stable_and_bounded() {
        let root = scratch_root();
        let mut first = Workspace::prepare(&root, "sub-4", "x", &text_language())
            .await
            .unwrap();
        let mut second = Workspace::prepare(&root, "sub-4", "x", &text_language())
            .await
            .unwrap();
        assert_eq!(first.box_id(), second.box_id());
        assert!(first.box_id() < 100);
        // Distinct directories even for the same submission id.
        assert_ne!(first.dir(), second.dir());

        let mut sandbox = MockSandbox::new();
        sandbox.expect_cleanup().times(2).return_const(());
        first.destroy(&sandbox).await;
        second.destroy(&sandbox).await;
        std::fs::remove_dir_all(&root).unwrap();
    }
}
