use std::sync::Arc;

use async_trait::async_trait;
use attest_common::context::{AuthFragment, Context};
use attest_dns::DnsError;

use crate::{
    dkim::DkimVerdicts,
    dmarc::from_domain,
    handler::{Handler, HandlerResult, Stage},
    verifier::Verdict,
};

#[derive(Debug, Default)]
struct AdspSession {
    from_domain: Option<String>,
}

/// Author Domain Signing Practices (RFC 5617, successor of the SSP
/// draft). Fetches the author domain's published `dkim=` practice and
/// combines it with dkim's verdicts into a `dkim-adsp` fragment.
/// External clients only.
pub struct Adsp {
    resolver: Arc<attest_dns::Resolver>,
}

impl Adsp {
    #[must_use]
    pub fn new(resolver: Arc<attest_dns::Resolver>) -> Self {
        Self { resolver }
    }
}

/// Outcome when no author-aligned signature verified: the published
/// practice decides how hard to judge the absence.
fn practice_result(practice: Option<&str>) -> &'static str {
    match practice {
        Some("all") => "fail",
        Some("discardable") => "discard",
        Some(_) => "unknown",
        None => "none",
    }
}

/// The `dkim=` tag of an `_adsp._domainkey` record.
fn parse_practice(record: &str) -> Option<String> {
    record.split(';').find_map(|tag| {
        let (key, value) = tag.split_once('=')?;
        (key.trim() == "dkim").then(|| value.trim().to_ascii_lowercase())
    })
}

#[async_trait]
impl Handler for Adsp {
    fn name(&self) -> &'static str {
        "adsp"
    }

    fn stages(&self) -> &'static [Stage] {
        &[Stage::Header, Stage::Eom]
    }

    fn requires_before(&self, stage: Stage) -> &'static [&'static str] {
        // Alignment is judged against dkim's published verdicts.
        match stage {
            Stage::Eom => &["dkim"],
            _ => &[],
        }
    }

    async fn header(&self, ctx: &mut Context, name: &str, value: &str) -> HandlerResult {
        if name.eq_ignore_ascii_case("from") {
            let domain = from_domain(value);
            let session = ctx.handler_slot::<AdspSession>("adsp");
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

        let session = std::mem::take(ctx.handler_slot::<AdspSession>("adsp"));
        let Some(domain) = session.from_domain else {
            // No author domain to hold practices against.
            return Ok(());
        };

        let aligned_pass = ctx
            .peek_slot::<DkimVerdicts>("dkim")
            .is_some_and(|published| {
                published.verdicts.iter().any(|verdict| {
                    verdict.result == Some(Verdict::Pass)
                        && verdict
                            .domain
                            .as_deref()
                            .is_some_and(|signed| signed.eq_ignore_ascii_case(&domain))
                })
            });

        let fragment = if aligned_pass {
            AuthFragment::new("dkim-adsp", "pass")
        } else {
            let record_name = format!("_adsp._domainkey.{domain}");
            match self.resolver.lookup_txt(&record_name).await {
                Ok(records) => {
                    let practice = records.iter().find_map(|record| parse_practice(record));
                    AuthFragment::new("dkim-adsp", practice_result(practice.as_deref()))
                }
                Err(DnsError::NxDomain(_)) => AuthFragment::new("dkim-adsp", "none"),
                Err(err) if err.is_temporary() => {
                    AuthFragment::new("dkim-adsp", "temperror").with_comment(err.to_string())
                }
                Err(err) => {
                    AuthFragment::new("dkim-adsp", "permerror").with_comment(err.to_string())
                }
            }
        };

        ctx.add_auth_fragment(fragment.with_property("header.from", domain));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use attest_dns::DnsConfig;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::verifier::SignatureVerdict;

    fn handler() -> Adsp {
        Adsp::new(Arc::new(attest_dns::Resolver::new(DnsConfig::default())))
    }

    fn publish_pass(ctx: &mut Context, domain: &str) {
        *ctx.handler_slot::<DkimVerdicts>("dkim") = DkimVerdicts {
            verdicts: vec![SignatureVerdict {
                result: Some(Verdict::Pass),
                domain: Some(domain.to_string()),
                ..SignatureVerdict::default()
            }],
        };
    }

    #[test]
    fn practice_mapping() {
        assert_eq!(practice_result(Some("all")), "fail");
        assert_eq!(practice_result(Some("discardable")), "discard");
        assert_eq!(practice_result(Some("unknown")), "unknown");
        assert_eq!(practice_result(None), "none");
    }

    #[test]
    fn practice_tag_is_scanned() {
        assert_eq!(parse_practice("dkim=all"), Some("all".to_string()));
        assert_eq!(
            parse_practice("dkim = Discardable ; extra=1"),
            Some("discardable".to_string())
        );
        assert_eq!(parse_practice("v=1; p=abc"), None);
    }

    #[tokio::test]
    async fn aligned_pass_needs_no_policy_lookup() {
        let handler = handler();
        let mut ctx = Context::new();
        publish_pass(&mut ctx, "Example.COM");
        handler
            .header(&mut ctx, "From", "Bob <bob@example.com>")
            .await
            .unwrap();

        handler.eom(&mut ctx).await.unwrap();

        let fragment = &ctx.fragments()[0];
        assert_eq!(fragment.method, "dkim-adsp");
        assert_eq!(fragment.result, "pass");
        assert_eq!(
            fragment.properties,
            vec![("header.from".to_string(), "example.com".to_string())]
        );
    }

    #[tokio::test]
    async fn guarded_for_exempt_clients() {
        let handler = handler();
        let mut ctx = Context::new();
        ctx.is_authenticated = true;
        publish_pass(&mut ctx, "example.com");
        handler
            .header(&mut ctx, "From", "bob@example.com")
            .await
            .unwrap();

        handler.eom(&mut ctx).await.unwrap();
        assert!(ctx.fragments().is_empty());
    }

    #[tokio::test]
    async fn silent_without_a_from_domain() {
        let handler = handler();
        let mut ctx = Context::new();
        handler.eom(&mut ctx).await.unwrap();
        assert!(ctx.fragments().is_empty());
    }
}
