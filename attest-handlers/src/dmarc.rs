use std::sync::Arc;

use async_trait::async_trait;
use attest_common::context::{AuthFragment, Context};
use attest_metrics::{Counter, MetricsRegistry};

use crate::{
    handler::{Handler, HandlerResult, Stage},
    verifier::{DmarcEvaluator, Verdict},
};

#[derive(Debug, Default)]
struct DmarcSession {
    from_domain: Option<String>,
}

/// Domain-based Message Authentication evaluation at end-of-message.
///
/// Depends on spf and dkim having run so the assembled header lists
/// their verdicts ahead of the policy that combines them. External
/// clients only.
pub struct Dmarc {
    evaluator: Arc<dyn DmarcEvaluator>,
    pass: Counter,
    fail: Counter,
}

impl Dmarc {
    #[must_use]
    pub fn new(evaluator: Arc<dyn DmarcEvaluator>, registry: &MetricsRegistry) -> Self {
        Self {
            evaluator,
            pass: registry.counter("handler_dmarc_pass_total"),
            fail: registry.counter("handler_dmarc_fail_total"),
        }
    }
}

/// Domain of the first address in a `From:` header value.
pub(crate) fn from_domain(value: &str) -> Option<String> {
    let addresses = mailparse::addrparse(value).ok()?;
    addresses.extract_single_info().and_then(|info| {
        info.addr
            .rsplit_once('@')
            .map(|(_, domain)| domain.to_ascii_lowercase())
    })
}

#[async_trait]
impl Handler for Dmarc {
    fn name(&self) -> &'static str {
        "dmarc"
    }

    fn stages(&self) -> &'static [Stage] {
        &[Stage::Header, Stage::Eom]
    }

    fn requires_before(&self, stage: Stage) -> &'static [&'static str] {
        match stage {
            Stage::Eom => &["dkim", "spf"],
            _ => &[],
        }
    }

    fn register_metrics(&self, registry: &MetricsRegistry) {
        registry.counter("handler_dmarc_pass_total");
        registry.counter("handler_dmarc_fail_total");
    }

    async fn header(&self, ctx: &mut Context, name: &str, value: &str) -> HandlerResult {
        if name.eq_ignore_ascii_case("from") {
            let domain = from_domain(value);
            let session = ctx.handler_slot::<DmarcSession>("dmarc");
            if session.from_domain.is_none() {
                session.from_domain = domain;
            }
        }
        Ok(())
    }

    async fn eom(&self, ctx: &mut Context) -> HandlerResult {
        if ctx.is_exempt() {
            return Ok(());
        }

        let Some(ip) = ctx.client_ip else {
            return Ok(());
        };

        let session = std::mem::take(ctx.handler_slot::<DmarcSession>("dmarc"));
        let Some(domain) = session.from_domain else {
            // No RFC5322.From domain to align against.
            return Ok(());
        };

        let helo = ctx.helo_name.clone().unwrap_or_default();
        let mail_from = ctx.envelope_from.clone().unwrap_or_default();
        let message = std::mem::take(&mut ctx.message);

        let outcome = self
            .evaluator
            .evaluate(&message, ip, &helo, &mail_from, &domain)
            .await;
        ctx.message = message;
        let verdict = outcome?;

        match verdict.result {
            Verdict::Pass => self.pass.incr(),
            Verdict::Fail => self.fail.incr(),
            _ => {}
        }

        let mut fragment = AuthFragment::new("dmarc", verdict.result.as_str())
            .with_property("header.from", domain);
        if let Some(policy) = verdict.policy {
            fragment = fragment.with_property("policy.dmarc", policy);
        }
        ctx.add_auth_fragment(fragment);

        Ok(())
    }
}
