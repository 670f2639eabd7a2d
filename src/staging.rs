//! Per-instance build directories and file staging.
//!
//! Files added while an instance is preparing are copied into its build
//! directory so the image builder sees a self-contained context. Files added
//! later are read into memory and shipped through a ConfigMap instead.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use sha2::{Digest, Sha256};

use crate::error::Error;

/// Handle on an instance's build directory.
#[derive(Debug)]
pub(crate) struct BuildContext {
    path: Utf8PathBuf,
    dir: Dir,
}

impl BuildContext {
    /// Creates (if needed) and opens the directory at `path`.
    pub(crate) fn open(instance: &str, path: &Utf8Path) -> Result<Self, Error> {
        Dir::create_ambient_dir_all(path, ambient_authority())
            .map_err(|err| staging_error(instance, path, &err))?;
        let dir = Dir::open_ambient_dir(path, ambient_authority())
            .map_err(|err| staging_error(instance, path, &err))?;
        Ok(Self {
            path: path.to_path_buf(),
            dir,
        })
    }

    /// Returns the directory path.
    #[cfg(test)]
    pub(crate) fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Writes `contents` under `name` and returns their SHA-256 digest.
    pub(crate) fn stage(&self, instance: &str, name: &str, contents: &[u8]) -> Result<String, Error> {
        self.dir
            .write(name, contents)
            .map_err(|err| staging_error(instance, &self.path.join(name), &err))?;
        Ok(content_digest(contents))
    }
}

/// Reads a source file from the host filesystem.
pub(crate) fn read_source(instance: &str, path: &Utf8Path) -> Result<Vec<u8>, Error> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path.file_name().ok_or_else(|| Error::Staging {
        instance: instance.to_owned(),
        path: path.to_path_buf(),
        message: String::from("path is missing a file name"),
    })?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority())
        .map_err(|err| staging_error(instance, parent, &err))?;
    dir.read(file_name)
        .map_err(|err| staging_error(instance, path, &err))
}

/// Returns the lowercase hex SHA-256 of `contents`.
pub(crate) fn content_digest(contents: &[u8]) -> String {
    hex::encode(Sha256::digest(contents))
}

fn staging_error(instance: &str, path: &Utf8Path, err: &io::Error) -> Error {
    Error::Staging {
        instance: instance.to_owned(),
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}
