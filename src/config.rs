//! Configuration loading via `ortho-config`.

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Default prefix for generated test scopes.
pub const DEFAULT_SCOPE_PREFIX: &str = "corral";

/// Default registry that committed images are pushed to.
pub const DEFAULT_IMAGE_REGISTRY: &str = "ttl.sh";

/// Default tag for pushed images. `ttl.sh` reads it as an expiry.
pub const DEFAULT_IMAGE_TAG: &str = "24h";

/// Default root for per-instance build directories.
pub const DEFAULT_BUILD_DIR: &str = "/tmp/corral";

/// Default image for the init container that prepares volume ownership.
pub const DEFAULT_INIT_IMAGE: &str = "docker.io/busybox:1.36";

/// Orchestration settings loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "CORRAL",
    discovery(
        app_name = "corral",
        env_var = "CORRAL_CONFIG_PATH",
        config_file_name = "corral.toml",
        dotfile_name = ".corral.toml",
        project_file_name = "corral.toml"
    )
)]
pub struct CorralConfig {
    /// Namespace to deploy into. When unset a fresh test scope is generated
    /// and used as the namespace.
    pub namespace: Option<String>,
    /// Prefix for generated test scopes.
    #[ortho_config(default = DEFAULT_SCOPE_PREFIX.to_owned())]
    pub scope_prefix: String,
    /// Registry host that committed images are pushed to.
    #[ortho_config(default = DEFAULT_IMAGE_REGISTRY.to_owned())]
    pub image_registry: String,
    /// Tag applied to pushed images.
    #[ortho_config(default = DEFAULT_IMAGE_TAG.to_owned())]
    pub image_tag: String,
    /// Local directory holding per-instance build contexts.
    #[ortho_config(default = DEFAULT_BUILD_DIR.to_owned())]
    pub build_dir: String,
    /// Image for the volume-ownership init container.
    #[ortho_config(default = DEFAULT_INIT_IMAGE.to_owned())]
    pub init_image: String,
    /// Leaves cluster resources behind after a batch destroy. Useful when
    /// debugging a failed run.
    #[ortho_config(default = false)]
    pub skip_cleanup: bool,
}

impl Default for CorralConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            scope_prefix: DEFAULT_SCOPE_PREFIX.to_owned(),
            image_registry: DEFAULT_IMAGE_REGISTRY.to_owned(),
            image_tag: DEFAULT_IMAGE_TAG.to_owned(),
            build_dir: DEFAULT_BUILD_DIR.to_owned(),
            init_image: DEFAULT_INIT_IMAGE.to_owned(),
            skip_cleanup: false,
        }
    }
}

impl CorralConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails, or
    /// [`ConfigError::MissingField`] when validation fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        let config = Self::load_from_iter([std::ffi::OsString::from("corral")])
            .map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects blank required values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] naming the environment variable
    /// that would supply the missing value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            (&self.scope_prefix, "CORRAL_SCOPE_PREFIX"),
            (&self.image_registry, "CORRAL_IMAGE_REGISTRY"),
            (&self.image_tag, "CORRAL_IMAGE_TAG"),
            (&self.build_dir, "CORRAL_BUILD_DIR"),
            (&self.init_image, "CORRAL_INIT_IMAGE"),
        ];
        for (value, env_var) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingField(format!(
                    "{env_var} must not be empty"
                )));
            }
        }
        if self
            .namespace
            .as_deref()
            .is_some_and(|namespace| namespace.trim().is_empty())
        {
            return Err(ConfigError::MissingField(String::from(
                "CORRAL_NAMESPACE must not be empty when set",
            )));
        }
        Ok(())
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::EnvGuard;
    use rstest::rstest;

    #[test]
    fn default_config_is_valid() {
        assert!(CorralConfig::default().validate().is_ok());
    }

    #[rstest]
    #[case::registry(CorralConfig { image_registry: String::from(" "), ..CorralConfig::default() }, "CORRAL_IMAGE_REGISTRY")]
    #[case::namespace(CorralConfig { namespace: Some(String::new()), ..CorralConfig::default() }, "CORRAL_NAMESPACE")]
    fn validate_names_offending_variable(#[case] config: CorralConfig, #[case] needle: &str) {
        let err = config.validate().expect_err("blank value must be rejected");
        assert!(err.to_string().contains(needle), "unexpected error: {err}");
    }

    #[tokio::test]
    async fn environment_overrides_defaults() {
        let _guard = EnvGuard::set_vars(&[
            ("CORRAL_IMAGE_REGISTRY", "registry.local:5000"),
            ("CORRAL_SKIP_CLEANUP", "true"),
        ])
        .await;
        let config = CorralConfig::load_without_cli_args().expect("config should load");
        assert_eq!(config.image_registry, "registry.local:5000");
        assert!(config.skip_cleanup);
        assert_eq!(config.image_tag, DEFAULT_IMAGE_TAG);
    }
}
