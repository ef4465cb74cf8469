//! Name directory boundary.
//!
//! Nodes publish their control address under their assigned name; the
//! launcher polls `resolve` during the handshake. The directory itself is an
//! external collaborator, consumed only through this trait.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait Directory: Send + Sync {
    /// Publish `address` under `name`, replacing any previous entry.
    async fn publish(&self, name: &str, address: &str) -> Result<()>;

    /// Resolve `name` to the published address, or `None` if nothing is
    /// published yet.
    async fn resolve(&self, name: &str) -> Result<Option<String>>;

    async fn unpublish(&self, name: &str) -> Result<()>;

    /// Whether endpoints reached through this directory require the secure
    /// channel arguments on the node command line.
    fn is_secure(&self) -> bool;
}

/// Directory backed by address files under a shared root, one
/// `<name>.addr` file per node. Writes go through a temp file and a rename
/// so a concurrent `resolve` never sees a partial address.
#[derive(Debug, Clone)]
pub struct FsDirectory {
    root: PathBuf,
    secure: bool,
}

impl FsDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            secure: false,
        }
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    fn entry_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.addr"))
    }
}

#[async_trait]
impl Directory for FsDirectory {
    async fn publish(&self, name: &str, address: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let tmp = self.root.join(format!(".{name}.addr.tmp"));
        tokio::fs::write(&tmp, address).await?;
        tokio::fs::rename(&tmp, self.entry_path(name)).await?;
        tracing::debug!(name, address, "node address published");
        Ok(())
    }

    async fn resolve(&self, name: &str) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.entry_path(name)).await {
            Ok(contents) => {
                let address = contents.trim().to_string();
                Ok((!address.is_empty()).then_some(address))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn unpublish(&self, name: &str) -> Result<()> {
        match tokio::fs::remove_file(self.entry_path(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn is_secure(&self) -> bool {
        self.secure
    }
}

/// In-process directory for tests and embedded setups.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    entries: Mutex<HashMap<String, String>>,
    secure: bool,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn publish(&self, name: &str, address: &str) -> Result<()> {
        self.entries
            .lock()
            .expect("directory mutex poisoned")
            .insert(name.to_string(), address.to_string());
        Ok(())
    }

    async fn resolve(&self, name: &str) -> Result<Option<String>> {
        Ok(self
            .entries
            .lock()
            .expect("directory mutex poisoned")
            .get(name)
            .cloned())
    }

    async fn unpublish(&self, name: &str) -> Result<()> {
        self.entries
            .lock()
            .expect("directory mutex poisoned")
            .remove(name);
        Ok(())
    }

    fn is_secure(&self) -> bool {
        self.secure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fs_directory_publish_resolve_unpublish() {
        let root = tempfile::tempdir().unwrap();
        let dir = FsDirectory::new(root.path());

        assert_eq!(dir.resolve("n1").await.unwrap(), None);

        dir.publish("n1", "127.0.0.1:4100").await.unwrap();
        assert_eq!(
            dir.resolve("n1").await.unwrap().as_deref(),
            Some("127.0.0.1:4100")
        );

        dir.publish("n1", "127.0.0.1:4200").await.unwrap();
        assert_eq!(
            dir.resolve("n1").await.unwrap().as_deref(),
            Some("127.0.0.1:4200")
        );

        dir.unpublish("n1").await.unwrap();
        assert_eq!(dir.resolve("n1").await.unwrap(), None);
        // removing again is fine
        dir.unpublish("n1").await.unwrap();
    }

    #[tokio::test]
    async fn memory_directory_round_trip() {
        let dir = MemoryDirectory::new();
        dir.publish("n2", "127.0.0.1:9").await.unwrap();
        assert_eq!(dir.resolve("n2").await.unwrap().as_deref(), Some("127.0.0.1:9"));
        dir.unpublish("n2").await.unwrap();
        assert_eq!(dir.resolve("n2").await.unwrap(), None);
    }

    #[test]
    fn secure_flag() {
        assert!(!MemoryDirectory::new().is_secure());
        assert!(MemoryDirectory::new().with_secure(true).is_secure());
        assert!(FsDirectory::new("/tmp").with_secure(true).is_secure());
    }
}
