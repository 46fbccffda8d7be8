//! Test harness wiring the real manager to the mocks

use std::sync::Arc;
use std::time::Duration;

use devtun_agent::{DeviceTunnelManager, TunnelEstablisher};

use crate::access_point::MockAccessPoint;
use crate::mocks::{MockDirectory, MockIdentityResolver};

/// User-Agent the test agent identifies with
pub const CLIENT_ID: &str = "devtun-e2e";

/// A tunnel manager connected to one mock access point
pub struct TestAgent {
    pub manager: Arc<DeviceTunnelManager>,
    pub resolver: Arc<MockIdentityResolver>,
    pub directory: Arc<MockDirectory>,
    pub access_point: MockAccessPoint,
}

impl TestAgent {
    pub async fn start() -> Self {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let access_point = MockAccessPoint::start().await;
        let resolver = MockIdentityResolver::new();
        let directory = MockDirectory::new(vec![access_point.access_point()]);
        let establisher = TunnelEstablisher::new(
            Arc::new(devtun_common::load_webpki_client_config()),
            CLIENT_ID,
            Duration::from_secs(5),
        );
        let manager = DeviceTunnelManager::new(resolver.clone(), directory.clone(), establisher);

        Self {
            manager,
            resolver,
            directory,
            access_point,
        }
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
