//! Files shipped into the container and the persistent volume.

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::error::Error;
use crate::image::BuildInstruction;
use crate::staging::{BuildContext, content_digest, read_source};
use crate::state::InstanceState;
use crate::wait::CallContext;

use super::Instance;

/// A file placed in the container at `dest`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct File {
    /// Host path the content was read from. Empty for in-memory content.
    pub source: Utf8PathBuf,
    /// Absolute path inside the container.
    pub dest: String,
    /// `user:group` ownership applied when the file is baked into the image.
    pub owner: Option<String>,
    /// Octal permission bits.
    pub permission: Option<u32>,
    pub(crate) key: String,
    pub(crate) contents: Option<Vec<u8>>,
}

impl File {
    /// Returns `true` when the file is baked into the image rather than
    /// mounted from a ConfigMap.
    #[must_use]
    pub const fn is_baked(&self) -> bool {
        self.contents.is_none()
    }
}

/// The instance's persistent volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Volume {
    /// Mount path inside the container.
    pub path: String,
    /// Requested capacity, for example `1Gi`.
    pub size: String,
    /// `user:group` ownership applied by an init container before start.
    pub owner: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct StorageConfig {
    pub(crate) files: Vec<File>,
    pub(crate) volume: Option<Volume>,
}

impl StorageConfig {
    /// Returns the files delivered through the instance's ConfigMap.
    pub(crate) fn mounted_files(&self) -> impl Iterator<Item = &File> {
        self.files.iter().filter(|file| !file.is_baked())
    }
}

/// Storage operations on an [`Instance`].
pub struct Storage<'a> {
    instance: &'a mut Instance,
}

impl<'a> Storage<'a> {
    pub(super) const fn new(instance: &'a mut Instance) -> Self {
        Self { instance }
    }

    /// Returns every file in insertion order.
    #[must_use]
    pub fn files(&self) -> &[File] {
        &self.instance.storage.files
    }

    /// Returns the volume, if one was added.
    #[must_use]
    pub fn volume(&self) -> Option<&Volume> {
        self.instance.storage.volume.as_ref()
    }

    /// Places the host file `source` at `dest`.
    ///
    /// While preparing, the file is staged into the build directory and
    /// copied into the image. Once committed it is mounted from the
    /// instance's ConfigMap, which is written on the next start.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] outside `Preparing`,
    /// `Committed` or `Stopped`, [`Error::Validation`] for an empty source
    /// or a relative destination, and [`Error::Staging`] when the source
    /// cannot be read or staged.
    pub fn add_file(&mut self, source: impl AsRef<Utf8Path>, dest: &str, owner: &str) -> Result<(), Error> {
        self.add_file_inner(source.as_ref(), dest, owner, None)
    }

    /// Like [`Storage::add_file`] with explicit permission bits.
    ///
    /// # Errors
    ///
    /// See [`Storage::add_file`].
    pub fn add_file_with_permission(
        &mut self,
        source: impl AsRef<Utf8Path>,
        dest: &str,
        owner: &str,
        permission: u32,
    ) -> Result<(), Error> {
        self.add_file_inner(source.as_ref(), dest, owner, Some(permission))
    }

    fn add_file_inner(
        &mut self,
        source: &Utf8Path,
        dest: &str,
        owner: &str,
        permission: Option<u32>,
    ) -> Result<(), Error> {
        self.ensure_file_state()?;
        if source.as_str().trim().is_empty() {
            return Err(Error::validation(
                &self.instance.k8s_name,
                "file source",
                "must not be empty",
            ));
        }
        self.validate_dest(dest)?;
        let contents = read_source(&self.instance.k8s_name, source)?;
        self.store(source.to_path_buf(), &contents, dest, owner, permission)
    }

    /// Places in-memory `contents` at `dest`.
    ///
    /// # Errors
    ///
    /// See [`Storage::add_file`].
    pub fn add_file_bytes(&mut self, contents: &[u8], dest: &str, owner: &str) -> Result<(), Error> {
        self.ensure_file_state()?;
        self.validate_dest(dest)?;
        self.store(Utf8PathBuf::new(), contents, dest, owner, None)
    }

    /// Adds the instance's persistent volume.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] outside `Preparing` or
    /// `Committed`, and [`Error::Validation`] for a relative path, an empty
    /// size or a second volume.
    pub fn add_volume(&mut self, path: &str, size: &str) -> Result<(), Error> {
        self.add_volume_inner(path, size, None)
    }

    /// Adds the persistent volume and hands ownership of its root to
    /// `owner` (`user:group`) before the workload starts.
    ///
    /// # Errors
    ///
    /// See [`Storage::add_volume`].
    pub fn add_volume_with_owner(&mut self, path: &str, size: &str, owner: &str) -> Result<(), Error> {
        self.add_volume_inner(path, size, Some(owner.to_owned()))
    }

    fn add_volume_inner(&mut self, path: &str, size: &str, owner: Option<String>) -> Result<(), Error> {
        self.instance.ensure_state(
            "add volume",
            &[InstanceState::Preparing, InstanceState::Committed],
        )?;
        let instance = &self.instance.k8s_name;
        if !path.starts_with('/') {
            return Err(Error::validation(instance, "volume path", "must be absolute"));
        }
        if size.trim().is_empty() {
            return Err(Error::validation(instance, "volume size", "must not be empty"));
        }
        if self.instance.storage.volume.is_some() {
            return Err(Error::validation(
                instance,
                "volume",
                "only one volume per instance is supported",
            ));
        }
        self.instance.storage.volume = Some(Volume {
            path: path.to_owned(),
            size: size.trim().to_owned(),
            owner: owner.filter(|owner| !owner.trim().is_empty()),
        });
        Ok(())
    }

    /// Reads a file from the running container.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] outside `Started` and the
    /// errors of [`Execution::execute_command`](super::execution::Execution::execute_command).
    pub async fn read_file(&mut self, ctx: &CallContext, path: &str) -> Result<String, Error> {
        self.instance.ensure_state("read file", &[InstanceState::Started])?;
        self.instance
            .execution()
            .execute_command(ctx, &["cat", path])
            .await
    }

    fn ensure_file_state(&self) -> Result<(), Error> {
        self.instance.ensure_state(
            "add file",
            &[InstanceState::Preparing, InstanceState::Committed, InstanceState::Stopped],
        )
    }

    fn validate_dest(&self, dest: &str) -> Result<(), Error> {
        if dest.trim().is_empty() || !dest.starts_with('/') {
            return Err(Error::validation(
                &self.instance.k8s_name,
                "file destination",
                "must be an absolute path",
            ));
        }
        Ok(())
    }

    fn store(
        &mut self,
        source: Utf8PathBuf,
        contents: &[u8],
        dest: &str,
        owner: &str,
        permission: Option<u32>,
    ) -> Result<(), Error> {
        let key = format!("file-{}", self.instance.storage.files.len());
        let owner = Some(owner.trim().to_owned()).filter(|owner| !owner.is_empty());
        let baked = self.instance.state == InstanceState::Preparing;
        if baked {
            let dir = self.instance.deps.build_dir_for(&self.instance.k8s_name);
            let context = BuildContext::open(&self.instance.k8s_name, &dir)?;
            let digest = context.stage(&self.instance.k8s_name, &key, contents)?;
            super::build::record_copy(
                self.instance,
                BuildInstruction::Copy {
                    source: key.clone(),
                    dest: dest.to_owned(),
                    chown: owner.clone(),
                    digest,
                },
            );
            if let Some(mode) = permission {
                super::build::record_copy(
                    self.instance,
                    BuildInstruction::Run(vec![
                        String::from("chmod"),
                        format!("{mode:o}"),
                        dest.to_owned(),
                    ]),
                );
            }
        }
        debug!(
            instance = self.instance.k8s_name.as_str(),
            dest,
            baked,
            digest = content_digest(contents).as_str(),
            "file added"
        );
        self.instance.storage.files.push(File {
            source,
            dest: dest.to_owned(),
            owner,
            permission,
            key,
            contents: (!baked).then(|| contents.to_vec()),
        });
        Ok(())
    }
}
