//! Image build plans, content fingerprints and the shared push cache.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use camino::Utf8PathBuf;
use sha2::{Digest, Sha256};
use shell_escape::unix::escape;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Number of fingerprint characters embedded in generated image names.
pub const IMAGE_NAME_HASH_LEN: usize = 16;

/// Future returned by image builder operations.
pub type BuildFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BuildError>> + Send + 'a>>;

/// A single layer-producing instruction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BuildInstruction {
    /// Runs a command during the build.
    Run(Vec<String>),
    /// Bakes an environment variable into the image.
    Env {
        /// Variable name.
        key: String,
        /// Variable value.
        value: String,
    },
    /// Switches the user for subsequent instructions and the entrypoint.
    User(String),
    /// Copies a staged file into the image.
    Copy {
        /// File name relative to the build context.
        source: String,
        /// Absolute destination inside the image.
        dest: String,
        /// Optional `user:group` ownership.
        chown: Option<String>,
        /// SHA-256 of the staged content.
        digest: String,
    },
}

/// Base image plus the ordered instructions recorded while preparing.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BuildPlan {
    /// Image the plan builds on.
    pub base_image: String,
    /// Directory holding staged files referenced by `Copy` instructions.
    pub context_dir: Utf8PathBuf,
    /// Instructions in recording order.
    pub instructions: Vec<BuildInstruction>,
}

impl BuildPlan {
    /// Starts a plan on `base_image` with no instructions.
    #[must_use]
    pub fn new(base_image: impl Into<String>, context_dir: Utf8PathBuf) -> Self {
        Self {
            base_image: base_image.into(),
            context_dir,
            instructions: Vec::new(),
        }
    }

    /// Returns `true` when any instruction has been recorded.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        !self.instructions.is_empty()
    }

    /// Renders the plan as a Dockerfile.
    #[must_use]
    pub fn dockerfile(&self) -> String {
        let mut lines = vec![format!("FROM {}", self.base_image)];
        lines.extend(self.instructions.iter().map(|instruction| match instruction {
            BuildInstruction::Run(args) => {
                let rendered = args
                    .iter()
                    .map(|arg| escape(arg.as_str().into()).into_owned())
                    .collect::<Vec<_>>()
                    .join(" ");
                format!("RUN {rendered}")
            }
            BuildInstruction::Env { key, value } => {
                format!("ENV {key}={}", escape(value.as_str().into()))
            }
            BuildInstruction::User(user) => format!("USER {user}"),
            BuildInstruction::Copy {
                source,
                dest,
                chown: Some(owner),
                ..
            } => format!("COPY --chown={owner} {source} {dest}"),
            BuildInstruction::Copy { source, dest, .. } => format!("COPY {source} {dest}"),
        }));
        let mut out = lines.join("\n");
        out.push('\n');
        out
    }

    /// Returns the SHA-256 of the rendered plan and every copied file's
    /// content digest, as lowercase hex.
    ///
    /// Identical plans always produce identical fingerprints; the build
    /// directory location does not participate.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.dockerfile().as_bytes());
        for instruction in &self.instructions {
            if let BuildInstruction::Copy { dest, digest, .. } = instruction {
                hasher.update(dest.as_bytes());
                hasher.update([0]);
                hasher.update(digest.as_bytes());
                hasher.update([0]);
            }
        }
        hex::encode(hasher.finalize())
    }
}

/// Remote git repository used as an image build context.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct GitRepoSource {
    /// Clone URL.
    pub url: String,
    /// Branch to build.
    pub branch: String,
    /// Optional commit pinned within the branch.
    pub commit: Option<String>,
    /// Optional username for private repositories.
    pub username: Option<String>,
    /// Optional password or token for private repositories.
    pub password: Option<String>,
}

impl GitRepoSource {
    /// Returns a deterministic fingerprint of the repository coordinates.
    ///
    /// Credentials other than the username are excluded so rotating a token
    /// does not produce a new image.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            self.url.as_str(),
            self.branch.as_str(),
            self.commit.as_deref().unwrap_or_default(),
            self.username.as_deref().unwrap_or_default(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0]);
        }
        hex::encode(hasher.finalize())
    }
}

/// Returns the image reference for content with the given fingerprint.
#[must_use]
pub fn image_name(registry: &str, fingerprint: &str, tag: &str) -> String {
    let short = fingerprint.get(..IMAGE_NAME_HASH_LEN).unwrap_or(fingerprint);
    format!("{}/corral-{short}:{tag}", registry.trim_end_matches('/'))
}

/// Errors raised by image builders.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BuildError {
    /// Building or pushing a plan failed.
    #[error("failed to push image {image}: {message}")]
    Push {
        /// Target image reference.
        image: String,
        /// Error message from the builder.
        message: String,
    },
    /// Building from a git repository failed.
    #[error("failed to build {url} into image {image}: {message}")]
    Git {
        /// Repository URL.
        url: String,
        /// Target image reference.
        image: String,
        /// Error message from the builder.
        message: String,
    },
}

/// Builds and pushes images for committed instances.
pub trait ImageBuilder: Send + Sync {
    /// Builds `plan` and pushes it as `image`, returning the pushed
    /// reference.
    fn push<'a>(&'a self, plan: &'a BuildPlan, image: &'a str) -> BuildFuture<'a, String>;

    /// Builds the Dockerfile at the root of `source` and pushes it as
    /// `image`, returning the pushed reference.
    fn build_from_git<'a>(
        &'a self,
        source: &'a GitRepoSource,
        image: &'a str,
    ) -> BuildFuture<'a, String>;

    /// Returns the cache key for `plan`.
    fn fingerprint(&self, plan: &BuildPlan) -> String {
        plan.fingerprint()
    }
}

/// Process-wide map from content fingerprint to pushed image reference.
///
/// Concurrent lookups of the same fingerprint share a single push; a failed
/// push leaves the entry empty so a later commit may retry.
#[derive(Debug, Default)]
pub struct ImageCache {
    entries: Mutex<HashMap<String, Arc<OnceCell<String>>>>,
}

impl ImageCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached image for `fingerprint`, running `push` to
    /// populate it on a miss.
    ///
    /// # Errors
    ///
    /// Returns the error produced by `push`.
    pub async fn get_or_push<F, Fut>(&self, fingerprint: &str, push: F) -> Result<String, BuildError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, BuildError>>,
    {
        let cell = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(entries.entry(fingerprint.to_owned()).or_default())
        };
        if let Some(image) = cell.get() {
            debug!(fingerprint, image = image.as_str(), "image cache hit");
            return Ok(image.clone());
        }
        let image = cell.get_or_try_init(push).await?;
        info!(fingerprint, image = image.as_str(), "image cached");
        Ok(image.clone())
    }

    /// Returns the cached image for `fingerprint`, if any.
    #[must_use]
    pub fn get(&self, fingerprint: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(fingerprint).and_then(|cell| cell.get().cloned())
    }

    /// Returns the number of fingerprints with a pushed image.
    #[must_use]
    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.values().filter(|cell| cell.initialized()).count()
    }

    /// Returns `true` when no image has been pushed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
