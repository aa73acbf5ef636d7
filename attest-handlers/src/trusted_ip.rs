use async_trait::async_trait;
use attest_common::context::Context;
use ipnet::IpNet;

use crate::handler::{Handler, HandlerResult, Stage};

/// Classifies the connecting client against the configured local and
/// trusted networks. Runs first at connect so guarded peers can
/// short-circuit on the flags it sets.
pub struct TrustedIp {
    local: Vec<IpNet>,
    trusted: Vec<IpNet>,
}

impl TrustedIp {
    #[must_use]
    pub fn new(local: Vec<IpNet>, trusted: Vec<IpNet>) -> Self {
        Self { local, trusted }
    }
}

#[async_trait]
impl Handler for TrustedIp {
    fn name(&self) -> &'static str {
        "trusted-ip"
    }

    fn stages(&self) -> &'static [Stage] {
        &[Stage::Connect]
    }

    fn required_after(&self, stage: Stage) -> &'static [&'static str] {
        // Classification must land before the guarded lookups run.
        match stage {
            Stage::Connect => &["iprev"],
            _ => &[],
        }
    }

    async fn connect(&self, ctx: &mut Context) -> HandlerResult {
        let Some(ip) = ctx.client_ip else {
            return Ok(());
        };

        ctx.is_local_ip_address = ip.is_loopback() || self.local.iter().any(|net| net.contains(&ip));
        ctx.is_trusted_ip_address = self.trusted.iter().any(|net| net.contains(&ip));

        Ok(())
    }
}
