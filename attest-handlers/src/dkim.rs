use std::sync::Arc;

use async_trait::async_trait;
use attest_common::{
    config::DkimOptions,
    context::{AuthFragment, Context},
};
use attest_metrics::{Counter, MetricsRegistry};

use crate::{
    handler::{Handler, HandlerResult, Stage},
    verifier::{parse_signature_tags, SignatureTags, SignatureVerdict, SignatureVerifier, Verdict},
};

/// Streaming accumulator carried in the handler's context slot.
///
/// The verifier wants the CRLF-canonical byte stream of the whole
/// message; it is fed incrementally across the header, eoh and body
/// stages and consumed once at end-of-message.
#[derive(Debug, Default)]
pub struct DkimSession {
    buf: Vec<u8>,
    signatures: Vec<SignatureTags>,
}

impl DkimSession {
    /// Append text with bare LFs normalized to CRLF.
    fn push_canonical(&mut self, text: &str) {
        let mut previous = 0u8;
        for &byte in text.as_bytes() {
            if byte == b'\n' && previous != b'\r' {
                self.buf.push(b'\r');
            }
            self.buf.push(byte);
            previous = byte;
        }
    }

    fn push_header(&mut self, name: &str, value: &str) {
        self.push_canonical(name);
        self.push_canonical(": ");
        self.push_canonical(value);
        self.buf.extend_from_slice(b"\r\n");
    }
}

/// Verdicts published for cooperating handlers (adsp, say) once
/// verification has run.
#[derive(Debug, Default)]
pub struct DkimVerdicts {
    pub verdicts: Vec<SignatureVerdict>,
}

/// DomainKeys Identified Mail verification. Runs for every message,
/// whatever the client's classification; policy handlers downstream
/// rely on its published verdicts.
///
/// One fragment per signature, carrying `header.d`, `header.i` and the
/// first eight characters of `header.b`. `X-Google-DKIM-Signature`
/// headers are opportunistically ingested as synthesized
/// `DKIM-Signature`s.
pub struct Dkim {
    verifier: Arc<dyn SignatureVerifier>,
    options: DkimOptions,
    pass: Counter,
    fail: Counter,
}

impl Dkim {
    #[must_use]
    pub fn new(
        verifier: Arc<dyn SignatureVerifier>,
        options: DkimOptions,
        registry: &MetricsRegistry,
    ) -> Self {
        Self {
            verifier,
            options,
            pass: registry.counter("handler_dkim_pass_total"),
            fail: registry.counter("handler_dkim_fail_total"),
        }
    }

    fn fragment_for(verdict: &crate::verifier::SignatureVerdict, fallback: Option<&SignatureTags>) -> AuthFragment {
        let result = verdict.result.unwrap_or(Verdict::None);
        let mut fragment = AuthFragment::new("dkim", result.as_str());

        if let (Some(bits), Some(key_type)) = (verdict.key_bits, verdict.key_type.as_deref()) {
            fragment = fragment.with_comment(format!("{bits}-bit {key_type} key"));
        } else if let Some(comment) = &verdict.comment {
            fragment = fragment.with_comment(comment.clone());
        }

        let domain = verdict
            .domain
            .clone()
            .or_else(|| fallback.and_then(|tags| tags.domain.clone()));
        let identity = verdict
            .identity
            .clone()
            .or_else(|| fallback.and_then(|tags| tags.identity.clone()));
        let b_tag = verdict
            .b_tag
            .clone()
            .or_else(|| fallback.and_then(|tags| tags.b_tag.clone()));

        if let Some(domain) = domain {
            fragment = fragment.with_property("header.d", domain);
        }
        if let Some(identity) = identity {
            fragment = fragment.with_property("header.i", identity);
        }
        if let Some(b_tag) = b_tag {
            fragment = fragment.with_property("header.b", b_tag);
        }

        fragment
    }
}

#[async_trait]
impl Handler for Dkim {
    fn name(&self) -> &'static str {
        "dkim"
    }

    fn stages(&self) -> &'static [Stage] {
        &[
            Stage::EnvFrom,
            Stage::Header,
            Stage::Eoh,
            Stage::Body,
            Stage::Eom,
        ]
    }

    fn register_metrics(&self, registry: &MetricsRegistry) {
        registry.counter("handler_dkim_pass_total");
        registry.counter("handler_dkim_fail_total");
    }

    async fn envfrom(&self, ctx: &mut Context, _addr: &str) -> HandlerResult {
        // A fresh streaming verifier per message.
        *ctx.handler_slot::<DkimSession>("dkim") = DkimSession::default();
        Ok(())
    }

    async fn header(&self, ctx: &mut Context, name: &str, value: &str) -> HandlerResult {
        let session = ctx.handler_slot::<DkimSession>("dkim");

        if name.eq_ignore_ascii_case("dkim-signature") {
            session.signatures.push(parse_signature_tags(value));
            session.push_header(name, value);
        } else if name.eq_ignore_ascii_case("x-google-dkim-signature") {
            // Ingest as a synthesized DKIM-Signature.
            session.signatures.push(parse_signature_tags(value));
            session.push_header("DKIM-Signature", value);
        } else {
            session.push_header(name, value);
        }

        Ok(())
    }

    async fn eoh(&self, ctx: &mut Context) -> HandlerResult {
        ctx.handler_slot::<DkimSession>("dkim")
            .buf
            .extend_from_slice(b"\r\n");
        Ok(())
    }

    async fn body(&self, ctx: &mut Context, chunk: &[u8]) -> HandlerResult {
        ctx.handler_slot::<DkimSession>("dkim")
            .buf
            .extend_from_slice(chunk);
        Ok(())
    }

    async fn eom(&self, ctx: &mut Context) -> HandlerResult {
        let session = std::mem::take(ctx.handler_slot::<DkimSession>("dkim"));

        if session.signatures.is_empty() {
            match self.options.check_dkim {
                // Level 1 reports unsigned mail explicitly.
                1 => ctx.add_auth_fragment(
                    AuthFragment::new("dkim", "none").with_comment("no signatures found"),
                ),
                // Level 2 stays silent about it.
                _ => {}
            }
            *ctx.handler_slot::<DkimVerdicts>("dkim") = DkimVerdicts::default();
            return Ok(());
        }

        let verdicts = self.verifier.verify(&session.buf).await?;

        for (idx, verdict) in verdicts.iter().enumerate() {
            match verdict.result.unwrap_or(Verdict::None) {
                Verdict::Pass => self.pass.incr(),
                Verdict::Fail => self.fail.incr(),
                _ => {}
            }
            ctx.add_auth_fragment(Self::fragment_for(verdict, session.signatures.get(idx)));
        }

        *ctx.handler_slot::<DkimVerdicts>("dkim") = DkimVerdicts { verdicts };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::verifier::SignatureVerdict;

    struct StaticSignatures(Vec<SignatureVerdict>);

    #[async_trait]
    impl SignatureVerifier for StaticSignatures {
        async fn verify(
            &self,
            _message: &[u8],
        ) -> Result<Vec<SignatureVerdict>, crate::HandlerError> {
            Ok(self.0.clone())
        }
    }

    fn handler(check_dkim: u8, verdicts: Vec<SignatureVerdict>) -> Dkim {
        Dkim::new(
            Arc::new(StaticSignatures(verdicts)),
            DkimOptions { check_dkim },
            &MetricsRegistry::new(),
        )
    }

    async fn feed_message(handler: &Dkim, ctx: &mut Context, headers: &[(&str, &str)]) {
        handler.envfrom(ctx, "<bob@example.com>").await.unwrap();
        for (name, value) in headers {
            handler.header(ctx, name, value).await.unwrap();
        }
        handler.eoh(ctx).await.unwrap();
        handler.body(ctx, b"Hello\r\n").await.unwrap();
        handler.eom(ctx).await.unwrap();
    }

    #[tokio::test]
    async fn unsigned_message_reports_none_at_level_one() {
        let handler = handler(1, Vec::new());
        let mut ctx = Context::new();

        feed_message(&handler, &mut ctx, &[("Subject", "hi")]).await;

        let fragment = &ctx.fragments()[0];
        assert_eq!(fragment.method, "dkim");
        assert_eq!(fragment.result, "none");
        assert_eq!(fragment.comment.as_deref(), Some("no signatures found"));
    }

    #[tokio::test]
    async fn unsigned_message_is_silent_at_level_two() {
        let handler = handler(2, Vec::new());
        let mut ctx = Context::new();

        feed_message(&handler, &mut ctx, &[("Subject", "hi")]).await;
        assert!(ctx.fragments().is_empty());
    }

    #[tokio::test]
    async fn passing_signature_carries_key_comment_and_properties() {
        let handler = handler(
            1,
            vec![SignatureVerdict {
                result: Some(Verdict::Pass),
                key_bits: Some(2048),
                key_type: Some("rsa".to_string()),
                ..SignatureVerdict::default()
            }],
        );
        let mut ctx = Context::new();

        feed_message(
            &handler,
            &mut ctx,
            &[
                (
                    "DKIM-Signature",
                    "v=1; a=rsa-sha256; d=example.com; s=mail; b=AbCdEfGhRest",
                ),
                ("Subject", "hi"),
            ],
        )
        .await;

        let fragment = &ctx.fragments()[0];
        assert_eq!(fragment.result, "pass");
        assert_eq!(fragment.comment.as_deref(), Some("2048-bit rsa key"));
        assert_eq!(
            fragment.properties,
            vec![
                ("header.d".to_string(), "example.com".to_string()),
                ("header.i".to_string(), "@example.com".to_string()),
                ("header.b".to_string(), "AbCdEfGh".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn google_signature_is_synthesized() {
        let handler = handler(
            1,
            vec![SignatureVerdict {
                result: Some(Verdict::Pass),
                ..SignatureVerdict::default()
            }],
        );
        let mut ctx = Context::new();

        feed_message(
            &handler,
            &mut ctx,
            &[(
                "X-Google-DKIM-Signature",
                "v=1; d=google.example; s=g; b=GGGGHHHHRest",
            )],
        )
        .await;

        let fragment = &ctx.fragments()[0];
        assert_eq!(fragment.result, "pass");
        assert!(fragment
            .properties
            .contains(&("header.d".to_string(), "google.example".to_string())));
    }

    #[tokio::test]
    async fn one_fragment_per_signature() {
        let handler = handler(
            1,
            vec![
                SignatureVerdict {
                    result: Some(Verdict::Pass),
                    ..SignatureVerdict::default()
                },
                SignatureVerdict {
                    result: Some(Verdict::Fail),
                    comment: Some("body hash mismatch".to_string()),
                    ..SignatureVerdict::default()
                },
            ],
        );
        let mut ctx = Context::new();

        feed_message(
            &handler,
            &mut ctx,
            &[
                ("DKIM-Signature", "v=1; d=one.example; s=a; b=AAAA1111x"),
                ("DKIM-Signature", "v=1; d=two.example; s=b; b=BBBB2222x"),
            ],
        )
        .await;

        let fragments = ctx.fragments();
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].result, "pass");
        assert!(fragments[0]
            .properties
            .contains(&("header.d".to_string(), "one.example".to_string())));
        assert_eq!(fragments[1].result, "fail");
        assert_eq!(fragments[1].comment.as_deref(), Some("body hash mismatch"));
    }

    #[tokio::test]
    async fn exempt_clients_are_still_verified() {
        let handler = handler(
            1,
            vec![SignatureVerdict {
                result: Some(Verdict::Pass),
                ..SignatureVerdict::default()
            }],
        );
        let mut ctx = Context::new();
        ctx.is_local_ip_address = true;

        feed_message(
            &handler,
            &mut ctx,
            &[("DKIM-Signature", "v=1; d=example.com; s=mail; b=AbCdEfGhX")],
        )
        .await;

        // DKIM carries no exemption guard: local, trusted and
        // authenticated clients get their signatures checked too.
        assert_eq!(ctx.fragments().len(), 1);
        assert_eq!(ctx.fragments()[0].result, "pass");
    }

    #[tokio::test]
    async fn verdicts_are_published_for_peers() {
        let handler = handler(
            1,
            vec![SignatureVerdict {
                result: Some(Verdict::Pass),
                domain: Some("example.com".to_string()),
                ..SignatureVerdict::default()
            }],
        );
        let mut ctx = Context::new();

        feed_message(
            &handler,
            &mut ctx,
            &[("DKIM-Signature", "v=1; d=example.com; s=mail; b=AbCdEfGhX")],
        )
        .await;

        let published = ctx.peek_slot::<DkimVerdicts>("dkim").unwrap();
        assert_eq!(published.verdicts.len(), 1);
        assert_eq!(published.verdicts[0].result, Some(Verdict::Pass));
        assert_eq!(published.verdicts[0].domain.as_deref(), Some("example.com"));
    }

    #[tokio::test]
    async fn accumulator_is_canonical_crlf() {
        let handler = handler(2, Vec::new());
        let mut ctx = Context::new();

        handler.envfrom(&mut ctx, "<>").await.unwrap();
        handler
            .header(&mut ctx, "Subject", "line one\n\tline two")
            .await
            .unwrap();
        handler.eoh(&mut ctx).await.unwrap();

        let session = ctx.peek_slot::<DkimSession>("dkim").unwrap();
        assert_eq!(
            session.buf,
            b"Subject: line one\r\n\tline two\r\n\r\n".to_vec()
        );
    }
}
