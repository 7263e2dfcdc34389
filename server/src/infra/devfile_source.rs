//! Access to devfiles stored in project repositories

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::error::{Error, Result};

/// Fetches the raw devfile of a project at a ref
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DevfileSource: Send + Sync {
    async fn fetch(&self, project_id: &str, project_ref: &str, devfile_path: &str)
        -> Result<String>;
}

/// Reads devfiles from checkouts laid out as `<root>/<project_id>/<devfile_path>`.
///
/// The checkout is expected to already be at the requested ref.
pub struct FsDevfileSource {
    root: PathBuf,
}

impl FsDevfileSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, project_id: &str, devfile_path: &str) -> Result<PathBuf> {
        let relative = Path::new(project_id).join(devfile_path);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(Error::InvalidParameter(format!(
                "Devfile path escapes project: {}",
                relative.display()
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl DevfileSource for FsDevfileSource {
    async fn fetch(
        &self,
        project_id: &str,
        project_ref: &str,
        devfile_path: &str,
    ) -> Result<String> {
        let path = self.resolve(project_id, devfile_path)?;
        tracing::debug!(?path, project_ref, "Reading devfile");

        match fs::read_to_string(&path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::DevfileNotFound(
                format!("{}:{} at {}", project_id, devfile_path, project_ref),
            )),
            Err(e) => Err(Error::Internal(format!("Failed to read devfile: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("devfile-source-{}-{}", name, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(dir.join("group/project")).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_reads_devfile_from_checkout() {
        let root = temp_root("read");
        std::fs::write(root.join("group/project/.devfile.yaml"), "schemaVersion: 2.2.0\n").unwrap();

        let source = FsDevfileSource::new(&root);
        let content = source
            .fetch("group/project", "main", ".devfile.yaml")
            .await
            .expect("Failed to fetch devfile");
        assert_eq!(content, "schemaVersion: 2.2.0\n");

        std::fs::remove_dir_all(root).ok();
    }

    #[tokio::test]
    async fn test_missing_devfile() {
        let root = temp_root("missing");
        let source = FsDevfileSource::new(&root);
        let result = source.fetch("group/project", "main", ".devfile.yaml").await;
        assert!(matches!(result, Err(Error::DevfileNotFound(_))));
        std::fs::remove_dir_all(root).ok();
    }

    #[tokio::test]
    async fn test_rejects_traversal() {
        let source = FsDevfileSource::new("/tmp");
        let result = source.fetch("group/project", "main", "../../etc/passwd").await;
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }
}
