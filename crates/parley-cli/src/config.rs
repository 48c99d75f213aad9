use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use parley_core::config::{SyncConfig, UploadFailurePolicy};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendKind {
    /// Hosted backend over HTTP.
    Remote { url: String, anon_key: String },
    /// SQLite database and a storage directory on this machine.
    Local {
        db_path: PathBuf,
        storage_dir: PathBuf,
        jwt_secret: String,
    },
}

#[derive(Debug, Clone)]
pub struct CliConfig {
    pub backend: BackendKind,
    /// Signed in automatically at start when both are set.
    pub credentials: Option<(String, String)>,
    pub handoff_path: PathBuf,
    pub sync: SyncConfig,
}

impl CliConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset and empty values are the same.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let backend = match var("PARLEY_BACKEND").as_deref().unwrap_or("remote") {
            "remote" => BackendKind::Remote {
                url: var("PARLEY_URL").context("PARLEY_URL is required for the remote backend")?,
                anon_key: var("PARLEY_ANON_KEY")
                    .context("PARLEY_ANON_KEY is required for the remote backend")?,
            },
            "local" => BackendKind::Local {
                db_path: var("PARLEY_DB_PATH")
                    .unwrap_or_else(|| "parley.db".into())
                    .into(),
                storage_dir: var("PARLEY_STORAGE_DIR")
                    .unwrap_or_else(|| "parley-storage".into())
                    .into(),
                jwt_secret: var("PARLEY_JWT_SECRET").unwrap_or_else(|| "dev-secret-change-me".into()),
            },
            other => bail!("unknown PARLEY_BACKEND '{}', expected remote or local", other),
        };

        let credentials = var("PARLEY_EMAIL").zip(var("PARLEY_PASSWORD"));

        let handoff_path = var("PARLEY_HANDOFF_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("parley").join("selected-peer.json"));

        let mut sync = SyncConfig::default();
        if let Some(ms) = var("PARLEY_POLL_MS") {
            let ms: u64 = ms
                .parse()
                .with_context(|| format!("PARLEY_POLL_MS must be milliseconds, got '{}'", ms))?;
            if ms == 0 {
                bail!("PARLEY_POLL_MS must be greater than zero");
            }
            sync.poll_interval = Duration::from_millis(ms);
        }
        if let Some(policy) = var("PARLEY_UPLOAD_FALLBACK") {
            sync.upload_failure = policy
                .parse::<UploadFailurePolicy>()
                .map_err(anyhow::Error::msg)?;
        }

        Ok(Self {
            backend,
            credentials,
            handoff_path,
            sync,
        })
    }
}
