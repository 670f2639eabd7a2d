//! Shared fixtures for integration tests.
//!
//! Integration tests are compiled as separate crates (one per top-level file in
//! `tests/`). Placing shared helpers under `tests/support/` avoids creating an
//! additional integration test binary while still allowing reuse via:
//!
//! ```rust
//! #[path = "support/fixtures.rs"]
//! mod fixtures;
//! ```

use std::sync::Arc;

use corral::test_support::TestHarness;
use corral::{CallContext, Instance};
use tempfile::TempDir;

/// Fake collaborators plus a temporary build directory that lives as long as
/// the fixture.
pub struct Env {
    pub harness: TestHarness,
    pub ctx: CallContext,
    _build_dir: TempDir,
}

#[allow(dead_code, reason = "each test binary uses a subset of the fixtures")]
impl Env {
    pub fn new() -> Self {
        let build_dir = TempDir::new().expect("temporary build dir");
        let path = build_dir.path().to_str().expect("utf-8 temp path").to_owned();
        Self {
            harness: TestHarness::new(&path).expect("harness"),
            ctx: CallContext::new(),
            _build_dir: build_dir,
        }
    }

    /// Creates `name` running `image` and commits it.
    pub async fn committed(&self, name: &str, image: &str) -> Instance {
        let mut instance =
            Instance::new(name, Arc::clone(&self.harness.deps)).expect("instance");
        instance.build().set_image(image).expect("image");
        instance.build().commit(&self.ctx).await.expect("commit");
        instance
    }

    /// Creates `name` running nginx with TCP port 80 and commits it.
    pub async fn web(&self, name: &str) -> Instance {
        let mut instance =
            Instance::new(name, Arc::clone(&self.harness.deps)).expect("instance");
        instance.build().set_image("nginx:1.27").expect("image");
        instance.network().add_port_tcp(80).expect("port");
        instance.build().commit(&self.ctx).await.expect("commit");
        instance
    }
}
