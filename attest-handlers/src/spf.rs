use std::sync::Arc;

use async_trait::async_trait;
use attest_common::context::{AuthFragment, Context};
use attest_metrics::{Counter, MetricsRegistry};

use crate::{
    handler::{Handler, HandlerResult, Stage},
    verifier::{SpfEvaluator, SpfVerdict, Verdict},
};

/// Published slot cooperating handlers may read after spf has run.
#[derive(Debug, Clone, Default)]
pub struct SpfState {
    pub verdict: Option<SpfVerdict>,
    pub sender: Option<String>,
}

/// Sender Policy Framework evaluation of the MAIL FROM identity, with
/// HELO as the fallback identity for the null sender. External
/// clients only.
pub struct Spf {
    evaluator: Arc<dyn SpfEvaluator>,
    pass: Counter,
    fail: Counter,
}

impl Spf {
    #[must_use]
    pub fn new(evaluator: Arc<dyn SpfEvaluator>, registry: &MetricsRegistry) -> Self {
        Self {
            evaluator,
            pass: registry.counter("handler_spf_pass_total"),
            fail: registry.counter("handler_spf_fail_total"),
        }
    }
}

/// Strip the angle brackets of an envelope address.
fn bare_address(addr: &str) -> &str {
    addr.trim().trim_start_matches('<').trim_end_matches('>')
}

#[async_trait]
impl Handler for Spf {
    fn name(&self) -> &'static str {
        "spf"
    }

    fn stages(&self) -> &'static [Stage] {
        &[Stage::EnvFrom]
    }

    fn register_metrics(&self, registry: &MetricsRegistry) {
        registry.counter("handler_spf_pass_total");
        registry.counter("handler_spf_fail_total");
    }

    async fn envfrom(&self, ctx: &mut Context, addr: &str) -> HandlerResult {
        if ctx.is_exempt() {
            return Ok(());
        }

        let Some(ip) = ctx.client_ip else {
            return Ok(());
        };

        let helo = ctx.helo_name.clone().unwrap_or_default();
        let sender = bare_address(addr).to_string();

        let verdict = if sender.is_empty() {
            self.evaluator.evaluate_helo(ip, &helo).await
        } else {
            self.evaluator.evaluate_mail_from(ip, &helo, &sender).await
        };

        match verdict.result {
            Verdict::Pass => self.pass.incr(),
            Verdict::Fail | Verdict::SoftFail => self.fail.incr(),
            _ => {}
        }

        let mut fragment = AuthFragment::new("spf", verdict.result.as_str())
            .with_property("smtp.mailfrom", sender.clone())
            .with_property("smtp.helo", helo);
        if let Some(comment) = &verdict.comment {
            fragment = fragment.with_comment(comment.clone());
        }
        ctx.add_auth_fragment(fragment);

        let state = ctx.handler_slot::<SpfState>("spf");
        state.verdict = Some(verdict);
        state.sender = Some(sender);

        Ok(())
    }
}
