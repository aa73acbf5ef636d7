use async_trait::async_trait;
use attest_common::context::Context;

use crate::handler::{Handler, HandlerResult, Stage};

/// Compares the forward-confirmed PTR name against the HELO argument
/// and reports the outcome in an auxiliary `X-PTR` header. Purely
/// informational; never part of the canonical `Authentication-Results`
/// line. External clients only.
pub struct Ptr;

impl Ptr {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Default for Ptr {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for Ptr {
    fn name(&self) -> &'static str {
        "ptr"
    }

    fn stages(&self) -> &'static [Stage] {
        &[Stage::Helo]
    }

    fn requires_before(&self, stage: Stage) -> &'static [&'static str] {
        // The comparison needs the verified PTR name.
        match stage {
            Stage::Helo => &["iprev"],
            _ => &[],
        }
    }

    async fn helo(&self, ctx: &mut Context, helo: &str) -> HandlerResult {
        if ctx.is_exempt() {
            return Ok(());
        }

        let lookup = ctx.verified_ptr.clone().unwrap_or_default();
        let result = if !lookup.is_empty() && lookup.eq_ignore_ascii_case(helo) {
            "pass"
        } else {
            "fail"
        };

        ctx.add_aux_header(
            "X-PTR",
            format!("x-ptr={result} x-ptr-helo={helo} x-ptr-lookup={lookup}"),
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn matching_ptr_passes() {
        let mut ctx = Context::new();
        ctx.verified_ptr = Some("mx.example.com".to_string());

        Ptr::new().helo(&mut ctx, "mx.example.com").await.unwrap();

        let aux = ctx.aux_headers();
        assert_eq!(aux.len(), 1);
        assert_eq!(aux[0].name, "X-PTR");
        assert_eq!(
            aux[0].value,
            "x-ptr=pass x-ptr-helo=mx.example.com x-ptr-lookup=mx.example.com"
        );
        // Informational only: nothing lands on the canonical line.
        assert!(ctx.fragments().is_empty());
    }

    #[tokio::test]
    async fn mismatched_ptr_fails_with_both_properties() {
        let mut ctx = Context::new();
        ctx.verified_ptr = Some("other.example.org".to_string());

        Ptr::new().helo(&mut ctx, "mx.example.com").await.unwrap();

        assert_eq!(
            ctx.aux_headers()[0].value,
            "x-ptr=fail x-ptr-helo=mx.example.com x-ptr-lookup=other.example.org"
        );
    }

    #[tokio::test]
    async fn comparison_is_case_insensitive() {
        let mut ctx = Context::new();
        ctx.verified_ptr = Some("MX.Example.COM".to_string());

        Ptr::new().helo(&mut ctx, "mx.example.com").await.unwrap();
        assert!(ctx.aux_headers()[0].value.starts_with("x-ptr=pass"));
    }

    #[tokio::test]
    async fn guarded_for_exempt_clients() {
        let mut ctx = Context::new();
        ctx.is_trusted_ip_address = true;
        ctx.verified_ptr = Some("mx.example.com".to_string());

        Ptr::new().helo(&mut ctx, "mx.example.com").await.unwrap();
        assert!(ctx.aux_headers().is_empty());
    }
}
