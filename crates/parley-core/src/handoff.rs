use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};

use parley_types::models::Profile;

use crate::error::HandoffError;

/// One-shot slot for passing a selected peer from another view.
///
/// The entry is a JSON profile at a session-scoped path. Reading it removes
/// it, so a peer is only ever picked up once.
#[derive(Debug, Clone)]
pub struct PeerHandoff {
    path: PathBuf,
}

impl PeerHandoff {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn stash(&self, peer: &Profile) -> Result<(), HandoffError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&self.path, serde_json::to_vec(peer)?).await?;
        debug!("Stashed peer {} at {}", peer.id, self.path.display());
        Ok(())
    }

    /// Consume the stashed peer, if any. The entry is deleted before it is
    /// parsed so a corrupt entry is not read twice either.
    pub async fn take(&self) -> Result<Option<Profile>, HandoffError> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Hand-off entry {} already gone", self.path.display());
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Some(serde_json::from_slice(&raw)?))
    }
}
