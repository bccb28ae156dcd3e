//! Model identifiers and existence probes.

use std::path::{Path, PathBuf};

use hf_hub::api::sync::{Api, ApiBuilder};
use hf_hub::{Repo, RepoType};
use tracing::{debug, warn};

/// Where a model lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// Local path to model directory or file.
    Local(PathBuf),
    /// HuggingFace Hub repository ID.
    Hub {
        /// Repository ID (e.g., "meta-llama/Llama-2-7b").
        repo_id: String,
        /// Optional revision (branch, tag, or commit).
        revision: Option<String>,
    },
}

impl ModelSource {
    /// Create a model source from a local path.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        Self::Local(path.as_ref().to_path_buf())
    }

    /// Create a model source from a HuggingFace repo ID.
    pub fn from_hub(repo_id: impl Into<String>) -> Self {
        Self::Hub {
            repo_id: repo_id.into(),
            revision: None,
        }
    }

    /// Parse a model identifier.
    ///
    /// Existing paths and anything starting with `/` or `.` are local. Other
    /// identifiers are Hub repo IDs, optionally pinned with `repo@revision`.
    pub fn parse(s: &str) -> Self {
        let path = Path::new(s);
        if path.exists() || s.starts_with('/') || s.starts_with('.') {
            return Self::Local(path.to_path_buf());
        }

        #[cfg(windows)]
        if s.contains('\\') || path.is_absolute() {
            return Self::Local(path.to_path_buf());
        }

        match s.split_once('@') {
            Some((repo_id, revision)) if !repo_id.is_empty() && !revision.is_empty() => {
                Self::Hub {
                    repo_id: repo_id.to_string(),
                    revision: Some(revision.to_string()),
                }
            }
            _ => Self::from_hub(s),
        }
    }

    /// Whether this source is on the local filesystem.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }
}

/// Build a blocking Hub client without terminal progress bars.
pub(crate) fn hub_api() -> Result<Api, hf_hub::api::sync::ApiError> {
    ApiBuilder::new().with_progress(false).build()
}

/// Hub repository handle for a model.
pub(crate) fn hub_repo(repo_id: &str, revision: Option<&str>) -> Repo {
    match revision {
        Some(rev) => Repo::with_revision(repo_id.to_string(), RepoType::Model, rev.to_string()),
        None => Repo::model(repo_id.to_string()),
    }
}

/// Answers whether a model identifier refers to something that exists.
///
/// Probes are read-only.
pub trait SourceProbe: Send + Sync {
    /// Whether `identifier` resolves to an existing model.
    fn exists(&self, identifier: &str) -> bool;
}

/// Filesystem-only probe. Every identifier is treated as a local path.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalProbe;

impl SourceProbe for LocalProbe {
    fn exists(&self, identifier: &str) -> bool {
        Path::new(identifier).exists()
    }
}

/// Probe that checks local paths on disk and Hub repo IDs against the Hub.
#[derive(Debug, Clone, Copy, Default)]
pub struct HubProbe;

impl SourceProbe for HubProbe {
    fn exists(&self, identifier: &str) -> bool {
        match ModelSource::parse(identifier) {
            ModelSource::Local(path) => path.exists(),
            ModelSource::Hub { repo_id, revision } => {
                let api = match hub_api() {
                    Ok(api) => api,
                    Err(e) => {
                        warn!("Cannot reach HuggingFace Hub to probe {}: {}", repo_id, e);
                        return false;
                    }
                };
                match api.repo(hub_repo(&repo_id, revision.as_deref())).info() {
                    Ok(_) => true,
                    Err(e) => {
                        debug!("Hub probe for {} failed: {}", identifier, e);
                        false
                    }
                }
            }
        }
    }
}
