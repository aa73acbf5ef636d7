use std::sync::Arc;

use async_trait::async_trait;
use attest_common::context::{AuthFragment, Context};
use attest_metrics::{Counter, MetricsRegistry};

use crate::handler::{Handler, HandlerError, HandlerResult, Stage};

/// Forward-confirmed reverse DNS (RFC 8601 `iprev`).
///
/// Resolves the client's PTR names and confirms one of them forward.
/// The confirmed name lands in `Context::verified_ptr` for the `ptr`
/// handler to compare against HELO. External clients only.
pub struct Iprev {
    resolver: Arc<attest_dns::Resolver>,
    pass: Counter,
    fail: Counter,
}

impl Iprev {
    #[must_use]
    pub fn new(resolver: Arc<attest_dns::Resolver>, registry: &MetricsRegistry) -> Self {
        Self {
            resolver,
            pass: registry.counter("handler_iprev_pass_total"),
            fail: registry.counter("handler_iprev_fail_total"),
        }
    }
}

#[async_trait]
impl Handler for Iprev {
    fn name(&self) -> &'static str {
        "iprev"
    }

    fn stages(&self) -> &'static [Stage] {
        &[Stage::Connect]
    }

    fn register_metrics(&self, registry: &MetricsRegistry) {
        registry.counter("handler_iprev_pass_total");
        registry.counter("handler_iprev_fail_total");
    }

    async fn connect(&self, ctx: &mut Context) -> HandlerResult {
        if ctx.is_exempt() {
            return Ok(());
        }

        let Some(ip) = ctx.client_ip else {
            return Ok(());
        };

        match self.resolver.verify_ptr(ip).await {
            Ok(Some(name)) => {
                if ctx.client_rdns.is_none() {
                    ctx.client_rdns = Some(name.clone());
                }
                ctx.verified_ptr = Some(name.clone());
                self.pass.incr();
                ctx.add_auth_fragment(
                    AuthFragment::new("iprev", "pass")
                        .with_comment(name)
                        .with_property("policy.iprev", ip.to_string()),
                );
                Ok(())
            }
            Ok(None) => {
                self.fail.incr();
                ctx.add_auth_fragment(
                    AuthFragment::new("iprev", "fail")
                        .with_comment("PTR does not resolve back to the client address")
                        .with_property("policy.iprev", ip.to_string()),
                );
                Ok(())
            }
            Err(err) if err.is_temporary() => Err(HandlerError::Temp(err.to_string())),
            Err(_) => {
                self.fail.incr();
                ctx.add_auth_fragment(
                    AuthFragment::new("iprev", "fail")
                        .with_comment("no PTR record")
                        .with_property("policy.iprev", ip.to_string()),
                );
                Ok(())
            }
        }
    }
}
