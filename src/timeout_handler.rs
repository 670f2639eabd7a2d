//! In-cluster deadline for a test scope.
//!
//! The handler is an ordinary instance whose container sleeps for the test
//! timeout and then deletes every scope-labelled resource with `kubectl`. It
//! keeps a crashed or hung test run from leaking workloads even when the
//! host never gets to call `destroy`.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::rbac::v1::PolicyRule;
use shell_escape::unix::escape;
use tracing::info;

use crate::deps::SystemDependencies;
use crate::error::Error;
use crate::instance::{Instance, InstanceType};
use crate::janitor::SWEPT_KINDS;
use crate::labels::SCOPE_LABEL;
use crate::wait::CallContext;

/// Image providing `kubectl`.
pub const TIMEOUT_HANDLER_IMAGE: &str = "docker.io/bitnami/kubectl:1.32";

/// Instance name of the handler.
pub const TIMEOUT_HANDLER_NAME: &str = "timeout-handler";

/// A running [`InstanceType::TimeoutHandler`] instance.
#[derive(Debug)]
pub struct TimeoutHandler {
    instance: Instance,
    timeout: Duration,
}

impl TimeoutHandler {
    /// Starts the handler; after `timeout` it deletes the scope's resources,
    /// itself included.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a zero timeout, and any error raised
    /// while committing or starting the instance.
    pub async fn deploy(
        ctx: &CallContext,
        deps: Arc<SystemDependencies>,
        timeout: Duration,
    ) -> Result<Self, Error> {
        if timeout.as_secs() == 0 {
            return Err(Error::validation(
                TIMEOUT_HANDLER_NAME,
                "timeout",
                "must be at least one second",
            ));
        }
        let script = cleanup_script(&deps, timeout);
        let mut instance = Instance::with_type(TIMEOUT_HANDLER_NAME, InstanceType::TimeoutHandler, deps)?;
        instance.build().set_image(TIMEOUT_HANDLER_IMAGE)?;
        instance.build().commit(ctx).await?;
        instance.build().set_start_command(&["sh", "-c", &script])?;
        for rule in cleanup_rules() {
            instance.resources().add_policy_rule(rule)?;
        }
        instance.execution().start(ctx).await?;
        info!(
            instance = instance.k8s_name(),
            timeout_secs = timeout.as_secs(),
            "timeout handler armed"
        );
        Ok(Self { instance, timeout })
    }

    /// Returns the configured timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns the underlying instance.
    #[must_use]
    pub const fn instance(&self) -> &Instance {
        &self.instance
    }

    /// Disarms the handler by removing its resources.
    ///
    /// # Errors
    ///
    /// See [`Execution::destroy`](crate::instance::execution::Execution::destroy).
    pub async fn destroy(&mut self, ctx: &CallContext) -> Result<(), Error> {
        self.instance.execution().destroy(ctx).await
    }
}

fn cleanup_script(deps: &SystemDependencies, timeout: Duration) -> String {
    let kinds: Vec<&str> = SWEPT_KINDS.iter().map(|kind| kind.resource).collect();
    let selector = format!("{SCOPE_LABEL}={}", deps.scope());
    format!(
        "sleep {}; kubectl delete {} -n {} -l {} --wait=false",
        timeout.as_secs(),
        kinds.join(","),
        escape(Cow::Borrowed(deps.namespace())),
        escape(Cow::Owned(selector)),
    )
}

/// One rule per API group covering exactly the swept kinds.
fn cleanup_rules() -> Vec<PolicyRule> {
    let mut groups: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for kind in SWEPT_KINDS {
        groups
            .entry(kind.api_group)
            .or_default()
            .push(kind.resource.to_owned());
    }
    groups
        .into_iter()
        .map(|(group, resources)| PolicyRule {
            api_groups: Some(vec![group.to_owned()]),
            resources: Some(resources),
            verbs: ["delete", "get", "list"].map(str::to_owned).to_vec(),
            ..PolicyRule::default()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Manifest, ResourceKind};
    use crate::test_support::TestHarness;

    #[test]
    fn rules_cover_every_swept_kind() {
        let rules = cleanup_rules();
        let covered: usize = rules
            .iter()
            .filter_map(|rule| rule.resources.as_ref())
            .map(Vec::len)
            .sum();
        assert_eq!(covered, SWEPT_KINDS.len());
        let core = rules
            .iter()
            .find(|rule| rule.api_groups == Some(vec![String::new()]))
            .expect("core group rule");
        assert_eq!(
            core.resources.as_deref(),
            Some(
                &[
                    String::from("services"),
                    String::from("configmaps"),
                    String::from("persistentvolumeclaims"),
                    String::from("serviceaccounts"),
                ][..]
            )
        );
    }

    #[tokio::test]
    async fn deploy_runs_scoped_cleanup_command() {
        let harness = TestHarness::new("/tmp/corral-timeout").expect("harness");
        let ctx = CallContext::new();
        let handler = TimeoutHandler::deploy(&ctx, Arc::clone(&harness.deps), Duration::from_secs(600))
            .await
            .expect("handler deploys");
        assert_eq!(handler.timeout(), Duration::from_secs(600));

        let Some(Manifest::ReplicaSet(replica_set)) =
            harness.cluster.object(ResourceKind::ReplicaSet, TIMEOUT_HANDLER_NAME)
        else {
            panic!("handler replica set missing");
        };
        let command = replica_set
            .spec
            .and_then(|spec| spec.template)
            .and_then(|template| template.spec)
            .and_then(|pod| pod.containers.into_iter().next())
            .and_then(|container| container.command)
            .expect("start command set");
        let script = command.last().expect("script argument");
        assert!(script.starts_with("sleep 600; kubectl delete replicasets,services,"));
        assert!(script.ends_with("-n corral-test -l corral.dev/scope=corral-test --wait=false"));
        assert!(harness.cluster.contains(ResourceKind::Role, TIMEOUT_HANDLER_NAME));
    }

    #[tokio::test]
    async fn zero_timeout_is_rejected() {
        let harness = TestHarness::new("/tmp/corral-timeout").expect("harness");
        let err = TimeoutHandler::deploy(&CallContext::new(), harness.deps, Duration::ZERO)
            .await
            .expect_err("zero timeout rejected");
        assert!(matches!(err, Error::Validation { .. }));
    }
}
