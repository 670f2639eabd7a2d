//! Image selection, build instructions and the commit step.

use std::collections::BTreeMap;
use std::fmt;

use tracing::info;

use crate::error::Error;
use crate::image::{BuildInstruction, BuildPlan, GitRepoSource, image_name};
use crate::state::InstanceState;
use crate::wait::CallContext;

use super::Instance;

/// Pull policy written into the container spec.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum ImagePullPolicy {
    /// Always pull the image.
    Always,
    /// Pull only when the node lacks the image.
    #[default]
    IfNotPresent,
    /// Never pull.
    Never,
}

impl ImagePullPolicy {
    /// Returns the Kubernetes spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Always => "Always",
            Self::IfNotPresent => "IfNotPresent",
            Self::Never => "Never",
        }
    }
}

impl fmt::Display for ImagePullPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default)]
pub(crate) struct BuildConfig {
    pub(crate) image_name: String,
    pub(crate) pull_policy: ImagePullPolicy,
    pub(crate) plan: Option<BuildPlan>,
    pub(crate) command: Vec<String>,
    pub(crate) args: Vec<String>,
    pub(crate) env: BTreeMap<String, String>,
}

/// Build-phase operations on an [`Instance`].
pub struct Build<'a> {
    instance: &'a mut Instance,
}

impl<'a> Build<'a> {
    pub(super) const fn new(instance: &'a mut Instance) -> Self {
        Self { instance }
    }

    /// Returns the image the workload will run. Empty until an image is set.
    #[must_use]
    pub fn image_name(&self) -> &str {
        &self.instance.build.image_name
    }

    /// Returns the pod-level environment.
    #[must_use]
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.instance.build.env
    }

    /// Returns the start command override.
    #[must_use]
    pub fn start_command(&self) -> &[String] {
        &self.instance.build.command
    }

    /// Returns the container arguments.
    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.instance.build.args
    }

    /// Returns the pull policy.
    #[must_use]
    pub fn image_pull_policy(&self) -> ImagePullPolicy {
        self.instance.build.pull_policy
    }

    /// Returns the pending build plan, if the instance is preparing one.
    #[must_use]
    pub fn plan(&self) -> Option<&BuildPlan> {
        self.instance.build.plan.as_ref()
    }

    /// Selects `image` as the base and opens a build plan.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] outside `None`, `Preparing`
    /// or `Stopped`, and [`Error::Validation`] for an empty image or an
    /// attached sidecar that has already run.
    pub fn set_image(&mut self, image: &str) -> Result<(), Error> {
        self.instance.ensure_state(
            "set image",
            &[InstanceState::None, InstanceState::Preparing, InstanceState::Stopped],
        )?;
        self.ensure_not_running_sidecar()?;
        let image = image.trim();
        if image.is_empty() {
            return Err(Error::validation(
                &self.instance.k8s_name,
                "image",
                "must not be empty",
            ));
        }
        self.open_plan(image);
        Ok(())
    }

    /// Builds `source` through the image builder and uses the result as the
    /// base image. Builds are cached by the repository fingerprint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] outside `None` or
    /// `Preparing`, [`Error::Validation`] when the URL or branch is empty
    /// or the instance is an attached sidecar that has already run,
    /// [`Error::Timeout`] when `ctx` is already done, and [`Error::Build`]
    /// when the builder fails.
    pub async fn set_git_repo(
        &mut self,
        ctx: &CallContext,
        source: &GitRepoSource,
    ) -> Result<(), Error> {
        self.instance.ensure_state(
            "set git repo",
            &[InstanceState::None, InstanceState::Preparing],
        )?;
        self.ensure_not_running_sidecar()?;
        if source.url.trim().is_empty() || source.branch.trim().is_empty() {
            return Err(Error::validation(
                &self.instance.k8s_name,
                "git repo",
                "url and branch are required",
            ));
        }
        if ctx.is_done() {
            return Err(Error::timeout("git build", &self.instance.k8s_name));
        }
        let deps = std::sync::Arc::clone(&self.instance.deps);
        let fingerprint = source.fingerprint();
        let target = image_name(
            &deps.config().image_registry,
            &fingerprint,
            &deps.config().image_tag,
        );
        let image = deps
            .image_cache()
            .get_or_push(&fingerprint, || {
                deps.image_builder().build_from_git(source, &target)
            })
            .await
            .map_err(|source| Error::Build {
                instance: self.instance.k8s_name.clone(),
                source,
            })?;
        info!(instance = self.instance.k8s_name.as_str(), image = image.as_str(), "built image from git");
        self.open_plan(&image);
        Ok(())
    }

    /// Records a command run while building the image.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] outside `Preparing` and
    /// [`Error::Validation`] for an empty command.
    pub fn execute_command(&mut self, command: &[&str]) -> Result<(), Error> {
        self.instance
            .ensure_state("execute build command", &[InstanceState::Preparing])?;
        if command.is_empty() {
            return Err(Error::validation(
                &self.instance.k8s_name,
                "command",
                "must not be empty",
            ));
        }
        let args = command.iter().map(|arg| (*arg).to_owned()).collect();
        self.push_instruction(BuildInstruction::Run(args));
        Ok(())
    }

    /// Switches the image user.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] outside `Preparing`.
    pub fn set_user(&mut self, user: &str) -> Result<(), Error> {
        self.instance.ensure_state("set user", &[InstanceState::Preparing])?;
        self.push_instruction(BuildInstruction::User(user.to_owned()));
        Ok(())
    }

    /// Sets an environment variable. While preparing the variable is baked
    /// into the image; once committed it is written into the pod spec.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] outside `Preparing`,
    /// `Committed` or `Stopped`, and [`Error::Validation`] for an empty key.
    pub fn set_environment_variable(&mut self, key: &str, value: &str) -> Result<(), Error> {
        self.instance.ensure_state(
            "set environment variable",
            &[InstanceState::Preparing, InstanceState::Committed, InstanceState::Stopped],
        )?;
        if key.trim().is_empty() {
            return Err(Error::validation(
                &self.instance.k8s_name,
                "environment variable",
                "key must not be empty",
            ));
        }
        if self.instance.state == InstanceState::Preparing {
            self.push_instruction(BuildInstruction::Env {
                key: key.to_owned(),
                value: value.to_owned(),
            });
        } else {
            self.instance
                .build
                .env
                .insert(key.to_owned(), value.to_owned());
        }
        Ok(())
    }

    /// Overrides the container entrypoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] outside `Preparing`,
    /// `Committed` or `Stopped`.
    pub fn set_start_command(&mut self, command: &[&str]) -> Result<(), Error> {
        self.instance.ensure_state("set start command", Self::POD_SPEC_STATES)?;
        self.instance.build.command = command.iter().map(|arg| (*arg).to_owned()).collect();
        Ok(())
    }

    /// Sets the container arguments.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] outside `Preparing`,
    /// `Committed` or `Stopped`.
    pub fn set_args(&mut self, args: &[&str]) -> Result<(), Error> {
        self.instance.ensure_state("set args", Self::POD_SPEC_STATES)?;
        self.instance.build.args = args.iter().map(|arg| (*arg).to_owned()).collect();
        Ok(())
    }

    /// Sets the image pull policy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] outside `Preparing`,
    /// `Committed` or `Stopped`.
    pub fn set_image_pull_policy(&mut self, policy: ImagePullPolicy) -> Result<(), Error> {
        self.instance
            .ensure_state("set image pull policy", Self::POD_SPEC_STATES)?;
        self.instance.build.pull_policy = policy;
        Ok(())
    }

    /// Finalises the image.
    ///
    /// Plans without recorded instructions keep the selected image. Other
    /// plans are fingerprinted and looked up in the shared cache; a miss
    /// pushes a new image and stores it. Concurrent commits of identical
    /// plans push once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] outside `Preparing`,
    /// [`Error::Timeout`] when `ctx` is already done, and [`Error::Build`]
    /// when the push fails. The state is unchanged on error.
    pub async fn commit(&mut self, ctx: &CallContext) -> Result<(), Error> {
        self.instance.ensure_state("commit", &[InstanceState::Preparing])?;
        if ctx.is_done() {
            return Err(Error::timeout("commit", &self.instance.k8s_name));
        }
        let image = match self.instance.build.plan.as_ref() {
            Some(plan) if plan.has_changes() => self.push_plan(plan.clone()).await?,
            _ => self.instance.build.image_name.clone(),
        };
        self.instance.build.image_name = image;
        self.instance.build.plan = None;
        self.instance.state = InstanceState::Committed;
        info!(
            instance = self.instance.k8s_name.as_str(),
            image = self.instance.build.image_name.as_str(),
            "instance committed"
        );
        Ok(())
    }

    const POD_SPEC_STATES: &'static [InstanceState] = &[
        InstanceState::Preparing,
        InstanceState::Committed,
        InstanceState::Stopped,
    ];

    async fn push_plan(&self, plan: BuildPlan) -> Result<String, Error> {
        let deps = &self.instance.deps;
        let builder = deps.image_builder();
        let fingerprint = builder.fingerprint(&plan);
        let target = image_name(
            &deps.config().image_registry,
            &fingerprint,
            &deps.config().image_tag,
        );
        deps.image_cache()
            .get_or_push(&fingerprint, || builder.push(&plan, &target))
            .await
            .map_err(|source| Error::Build {
                instance: self.instance.k8s_name.clone(),
                source,
            })
    }

    fn ensure_not_running_sidecar(&self) -> Result<(), Error> {
        if self.instance.is_sidecar()
            && matches!(
                self.instance.state,
                InstanceState::Started | InstanceState::Stopped
            )
        {
            return Err(Error::validation(
                &self.instance.k8s_name,
                "image",
                "an attached sidecar cannot be re-imaged once started",
            ));
        }
        Ok(())
    }

    fn open_plan(&mut self, image: &str) {
        let context_dir = self.instance.deps.build_dir_for(&self.instance.k8s_name);
        self.instance.build.image_name = image.to_owned();
        self.instance.build.plan = Some(BuildPlan::new(image, context_dir));
        self.instance.state = InstanceState::Preparing;
    }

    fn push_instruction(&mut self, instruction: BuildInstruction) {
        if let Some(plan) = self.instance.build.plan.as_mut() {
            plan.instructions.push(instruction);
        }
    }
}

/// Appends a file copy to the pending plan. Used by the storage handle while
/// preparing.
pub(super) fn record_copy(instance: &mut Instance, instruction: BuildInstruction) {
    if let Some(plan) = instance.build.plan.as_mut() {
        plan.instructions.push(instruction);
    }
}
