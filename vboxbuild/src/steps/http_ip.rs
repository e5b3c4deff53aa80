use async_trait::async_trait;
use vboxbuild_shared::constants::nat;
use vboxbuild_shared::errors::BuildResult;

use crate::pipeline::Step;
use crate::state::BuildState;

/// Records the address a NAT guest reaches the host on, for HTTP server
/// templating.
#[derive(Debug, Default)]
pub struct StepHttpIpDiscover;

impl StepHttpIpDiscover {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Step for StepHttpIpDiscover {
    fn name(&self) -> &'static str {
        "http_ip_discover"
    }

    async fn run(&mut self, state: &mut BuildState) -> BuildResult<()> {
        state.http_ip = Some(nat::HOST_GATEWAY_IP.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BuildConfig;
    use crate::steps::testing::harness;

    #[tokio::test]
    async fn test_records_gateway_address() {
        let mut h = harness(BuildConfig::default());
        StepHttpIpDiscover::new().run(&mut h.state).await.unwrap();

        assert_eq!(h.state.http_ip.as_deref(), Some("10.0.2.2"));
        assert!(h.driver.calls().is_empty());
    }
}
