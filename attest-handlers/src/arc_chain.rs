use std::sync::Arc;

use async_trait::async_trait;
use attest_common::context::{AuthFragment, Context};

use crate::{
    handler::{Handler, HandlerResult, Stage},
    verifier::{ArcEvaluator, Verdict},
};

/// Authenticated Received Chain validation at end-of-message. Runs
/// for every message; ones without a chain stay unmentioned.
pub struct ArcChain {
    evaluator: Arc<dyn ArcEvaluator>,
}

impl ArcChain {
    #[must_use]
    pub fn new(evaluator: Arc<dyn ArcEvaluator>) -> Self {
        Self { evaluator }
    }
}

#[async_trait]
impl Handler for ArcChain {
    fn name(&self) -> &'static str {
        "arc"
    }

    fn stages(&self) -> &'static [Stage] {
        &[Stage::Eom]
    }

    fn requires_before(&self, stage: Stage) -> &'static [&'static str] {
        match stage {
            Stage::Eom => &["dkim"],
            _ => &[],
        }
    }

    async fn eom(&self, ctx: &mut Context) -> HandlerResult {
        if ctx.message.is_empty() {
            return Ok(());
        }

        let message = std::mem::take(&mut ctx.message);
        let outcome = self.evaluator.evaluate(&message).await;
        ctx.message = message;

        match outcome? {
            Verdict::None => {}
            verdict => {
                ctx.add_auth_fragment(AuthFragment::new("arc", verdict.as_str()));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    struct StaticArc(Verdict);

    #[async_trait]
    impl ArcEvaluator for StaticArc {
        async fn evaluate(&self, _message: &[u8]) -> Result<Verdict, crate::HandlerError> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn chain_verdict_is_reported() {
        let handler = ArcChain::new(Arc::new(StaticArc(Verdict::Pass)));
        let mut ctx = Context::new();
        ctx.message.extend_from_slice(b"Subject: hi\r\n\r\nbody");

        handler.eom(&mut ctx).await.unwrap();

        assert_eq!(ctx.fragments()[0].method, "arc");
        assert_eq!(ctx.fragments()[0].result, "pass");
    }

    #[tokio::test]
    async fn chainless_messages_stay_unmentioned() {
        let handler = ArcChain::new(Arc::new(StaticArc(Verdict::None)));
        let mut ctx = Context::new();
        ctx.message.extend_from_slice(b"Subject: hi\r\n\r\nbody");

        handler.eom(&mut ctx).await.unwrap();
        assert!(ctx.fragments().is_empty());
    }

    #[tokio::test]
    async fn exempt_clients_are_still_validated() {
        let handler = ArcChain::new(Arc::new(StaticArc(Verdict::Pass)));
        let mut ctx = Context::new();
        ctx.is_trusted_ip_address = true;
        ctx.message.extend_from_slice(b"Subject: hi\r\n\r\nbody");

        handler.eom(&mut ctx).await.unwrap();
        assert_eq!(ctx.fragments()[0].result, "pass");
    }
}
