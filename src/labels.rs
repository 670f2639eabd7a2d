//! Label keys stamped onto every resource the engine creates.

use std::collections::BTreeMap;

/// Pod selector label carrying the owning instance's cluster name.
pub const APP_LABEL: &str = "app";

/// Label carrying the test scope; the janitor and timeout handler sweep by it.
pub const SCOPE_LABEL: &str = "corral.dev/scope";

/// Standard managed-by label.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value written under [`MANAGED_BY_LABEL`].
pub const MANAGED_BY_VALUE: &str = "corral";

/// Label recording the instance type.
pub const INSTANCE_TYPE_LABEL: &str = "corral.dev/instance-type";

/// Builds the label set for a resource owned by `app` in `scope`.
#[must_use]
pub fn resource_labels(app: &str, scope: &str, instance_type: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_LABEL.to_owned(), app.to_owned()),
        (SCOPE_LABEL.to_owned(), scope.to_owned()),
        (MANAGED_BY_LABEL.to_owned(), MANAGED_BY_VALUE.to_owned()),
        (INSTANCE_TYPE_LABEL.to_owned(), instance_type.to_owned()),
    ])
}

/// Returns the selector labels that pick the pod of `app`.
#[must_use]
pub fn pod_selector(app: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(APP_LABEL.to_owned(), app.to_owned())])
}

/// Returns `app=<name>` for list calls.
#[must_use]
pub fn app_selector(app: &str) -> String {
    format!("{APP_LABEL}={app}")
}

/// Returns `corral.dev/scope=<scope>` for list calls.
#[must_use]
pub fn scope_selector(scope: &str) -> String {
    format!("{SCOPE_LABEL}={scope}")
}
