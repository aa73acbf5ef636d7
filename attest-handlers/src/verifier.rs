//! Collaborator seams for the RFC authentication math.
//!
//! The cryptographic and policy evaluation of DKIM, SPF, DMARC and ARC
//! is out of scope for the gateway itself; handlers consume it through
//! these traits. Production wires in [`RfcVerifier`], backed by the
//! `mail-auth` crate; tests substitute static implementations.

use std::{net::IpAddr, sync::Arc};

use async_trait::async_trait;
use mail_auth::{AuthenticatedMessage, DkimResult, DmarcResult, Resolver, SpfResult};

use crate::handler::HandlerError;

/// The seven-way result token vocabulary of RFC 8601.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail,
    SoftFail,
    Neutral,
    None,
    TempError,
    PermError,
}

impl Verdict {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::SoftFail => "softfail",
            Self::Neutral => "neutral",
            Self::None => "none",
            Self::TempError => "temperror",
            Self::PermError => "permerror",
        }
    }
}

impl From<&DkimResult> for Verdict {
    fn from(result: &DkimResult) -> Self {
        match result {
            DkimResult::Pass => Self::Pass,
            DkimResult::Fail(_) => Self::Fail,
            DkimResult::Neutral(_) => Self::Neutral,
            DkimResult::TempError(_) => Self::TempError,
            DkimResult::PermError(_) => Self::PermError,
            DkimResult::None => Self::None,
        }
    }
}

impl From<SpfResult> for Verdict {
    fn from(result: SpfResult) -> Self {
        match result {
            SpfResult::Pass => Self::Pass,
            SpfResult::Fail => Self::Fail,
            SpfResult::SoftFail => Self::SoftFail,
            SpfResult::Neutral => Self::Neutral,
            SpfResult::TempError => Self::TempError,
            SpfResult::PermError => Self::PermError,
            SpfResult::None => Self::None,
        }
    }
}

/// Outcome for one DKIM (or synthesized) signature.
#[derive(Debug, Clone, Default)]
pub struct SignatureVerdict {
    pub result: Option<Verdict>,
    pub comment: Option<String>,
    pub domain: Option<String>,
    pub selector: Option<String>,
    pub identity: Option<String>,
    /// First eight characters of the signature's `b=` value.
    pub b_tag: Option<String>,
    /// Key details when the verifier surfaced them.
    pub key_bits: Option<u32>,
    pub key_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SpfVerdict {
    pub result: Verdict,
    pub comment: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DmarcVerdict {
    pub result: Verdict,
    /// The published `p=` policy, when one exists.
    pub policy: Option<String>,
}

/// Verifies every signature of a complete message.
#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    async fn verify(&self, message: &[u8]) -> Result<Vec<SignatureVerdict>, HandlerError>;
}

/// SPF policy evaluation for the HELO and MAIL FROM identities.
#[async_trait]
pub trait SpfEvaluator: Send + Sync {
    async fn evaluate_helo(&self, ip: IpAddr, helo: &str) -> SpfVerdict;
    async fn evaluate_mail_from(&self, ip: IpAddr, helo: &str, sender: &str) -> SpfVerdict;
}

/// DMARC alignment evaluation over the complete message.
#[async_trait]
pub trait DmarcEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        message: &[u8],
        ip: IpAddr,
        helo: &str,
        mail_from: &str,
        from_domain: &str,
    ) -> Result<DmarcVerdict, HandlerError>;
}

/// ARC chain validation over the complete message.
#[async_trait]
pub trait ArcEvaluator: Send + Sync {
    async fn evaluate(&self, message: &[u8]) -> Result<Verdict, HandlerError>;
}

/// The full set of seams a worker hands to its handlers.
#[derive(Clone)]
pub struct VerifierSet {
    pub signature: Arc<dyn SignatureVerifier>,
    pub spf: Arc<dyn SpfEvaluator>,
    pub dmarc: Arc<dyn DmarcEvaluator>,
    pub arc: Arc<dyn ArcEvaluator>,
}

impl VerifierSet {
    /// The production wiring: everything backed by one `RfcVerifier`.
    #[must_use]
    pub fn rfc(verifier: Arc<RfcVerifier>) -> Self {
        Self {
            signature: Arc::clone(&verifier) as Arc<dyn SignatureVerifier>,
            spf: Arc::clone(&verifier) as Arc<dyn SpfEvaluator>,
            dmarc: Arc::clone(&verifier) as Arc<dyn DmarcEvaluator>,
            arc: verifier as Arc<dyn ArcEvaluator>,
        }
    }
}

/// Tag values a `DKIM-Signature` header carries that surface in the
/// assembled header properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignatureTags {
    pub domain: Option<String>,
    pub selector: Option<String>,
    pub identity: Option<String>,
    pub b_tag: Option<String>,
}

/// Minimal tag-list scan of a `DKIM-Signature` value: enough to name
/// the signature in emitted properties, nothing more. The actual
/// signature semantics stay with the verifier collaborator.
#[must_use]
pub fn parse_signature_tags(value: &str) -> SignatureTags {
    let mut tags = SignatureTags::default();

    for tag in value.split(';') {
        let Some((key, tag_value)) = tag.split_once('=') else {
            continue;
        };
        let tag_value: String = tag_value.split_whitespace().collect();

        match key.trim() {
            "d" => tags.domain = Some(tag_value),
            "s" => tags.selector = Some(tag_value),
            "i" => tags.identity = Some(tag_value),
            "b" => {
                let mut b8 = tag_value;
                b8.truncate(8);
                tags.b_tag = Some(b8);
            }
            _ => {}
        }
    }

    // The AUID defaults to @domain when the signer leaves `i=` out.
    if tags.identity.is_none() {
        if let Some(domain) = &tags.domain {
            tags.identity = Some(format!("@{domain}"));
        }
    }

    tags
}

/// `mail-auth` backed implementation of every seam.
pub struct RfcVerifier {
    resolver: Resolver,
    hostname: String,
    dns: Arc<attest_dns::Resolver>,
}

impl RfcVerifier {
    pub fn new(
        hostname: impl Into<String>,
        dns: Arc<attest_dns::Resolver>,
    ) -> Result<Self, HandlerError> {
        let resolver = Resolver::new_system_conf()
            .map_err(|err| HandlerError::Temp(format!("resolver setup failed: {err}")))?;

        Ok(Self {
            resolver,
            hostname: hostname.into(),
            dns,
        })
    }

    fn parse<'x>(message: &'x [u8]) -> Result<AuthenticatedMessage<'x>, HandlerError> {
        AuthenticatedMessage::parse(message)
            .ok_or_else(|| HandlerError::Perm("message could not be parsed".to_string()))
    }

    fn dkim_comment(result: &DkimResult) -> Option<String> {
        match result {
            DkimResult::Pass | DkimResult::None => None,
            DkimResult::Fail(err)
            | DkimResult::Neutral(err)
            | DkimResult::TempError(err)
            | DkimResult::PermError(err) => Some(err.to_string()),
        }
    }
}

#[async_trait]
impl SignatureVerifier for RfcVerifier {
    async fn verify(&self, message: &[u8]) -> Result<Vec<SignatureVerdict>, HandlerError> {
        let parsed = Self::parse(message)?;
        let outputs = self.resolver.verify_dkim(&parsed).await;

        // Outputs come back in document order; pair them with the raw
        // tag values scanned from the same message.
        let tags = extract_signature_headers(message);

        Ok(outputs
            .iter()
            .enumerate()
            .map(|(idx, output)| {
                let sig = tags.get(idx).cloned().unwrap_or_default();
                SignatureVerdict {
                    result: Some(Verdict::from(output.result())),
                    comment: Self::dkim_comment(output.result()),
                    domain: sig.domain,
                    selector: sig.selector,
                    identity: sig.identity,
                    b_tag: sig.b_tag,
                    key_bits: None,
                    key_type: None,
                }
            })
            .collect())
    }
}

#[async_trait]
impl SpfEvaluator for RfcVerifier {
    async fn evaluate_helo(&self, ip: IpAddr, helo: &str) -> SpfVerdict {
        let output = self.resolver.verify_spf_helo(ip, helo, &self.hostname).await;
        SpfVerdict {
            result: Verdict::from(output.result()),
            comment: None,
        }
    }

    async fn evaluate_mail_from(&self, ip: IpAddr, helo: &str, sender: &str) -> SpfVerdict {
        let output = self
            .resolver
            .verify_spf_sender(ip, helo, &self.hostname, sender)
            .await;
        SpfVerdict {
            result: Verdict::from(output.result()),
            comment: None,
        }
    }
}

#[async_trait]
impl DmarcEvaluator for RfcVerifier {
    async fn evaluate(
        &self,
        message: &[u8],
        ip: IpAddr,
        helo: &str,
        mail_from: &str,
        from_domain: &str,
    ) -> Result<DmarcVerdict, HandlerError> {
        let parsed = Self::parse(message)?;

        let dkim = self.resolver.verify_dkim(&parsed).await;
        let spf = self
            .resolver
            .verify_spf_sender(ip, helo, &self.hostname, mail_from)
            .await;
        let output = self
            .resolver
            .verify_dmarc(&parsed, &dkim, from_domain, &spf)
            .await;

        let result = match (output.dkim_result(), output.spf_result()) {
            (DmarcResult::Pass, _) | (_, DmarcResult::Pass) => Verdict::Pass,
            (DmarcResult::TempError(_), _) | (_, DmarcResult::TempError(_)) => Verdict::TempError,
            (DmarcResult::PermError(_), _) | (_, DmarcResult::PermError(_)) => Verdict::PermError,
            (DmarcResult::None, DmarcResult::None) => Verdict::None,
            _ => Verdict::Fail,
        };

        Ok(DmarcVerdict {
            result,
            policy: self.published_policy(from_domain).await,
        })
    }
}

impl RfcVerifier {
    /// Scan the published `_dmarc` record for its `p=` token. Policy
    /// discovery is a plain TXT fetch; alignment evaluation stays with
    /// the collaborator.
    async fn published_policy(&self, from_domain: &str) -> Option<String> {
        let records = self
            .dns
            .lookup_txt(&format!("_dmarc.{from_domain}"))
            .await
            .ok()?;

        records.iter().find_map(|record| {
            record.split(';').find_map(|tag| {
                let (key, value) = tag.split_once('=')?;
                (key.trim() == "p").then(|| value.trim().to_string())
            })
        })
    }
}

#[async_trait]
impl ArcEvaluator for RfcVerifier {
    async fn evaluate(&self, message: &[u8]) -> Result<Verdict, HandlerError> {
        let parsed = Self::parse(message)?;
        let output = self.resolver.verify_arc(&parsed).await;
        Ok(Verdict::from(output.result()))
    }
}

/// The `DKIM-Signature` header values of a raw message, in document
/// order, with `X-Google-DKIM-Signature` folded in as synthesized
/// signatures.
#[must_use]
pub fn extract_signature_headers(message: &[u8]) -> Vec<SignatureTags> {
    let mut tags = Vec::new();
    let mut current: Option<String> = None;

    for line in message.split_inclusive(|&byte| byte == b'\n') {
        let text = String::from_utf8_lossy(line);
        let trimmed = text.trim_end_matches(['\r', '\n']);

        if trimmed.is_empty() {
            break; // end of headers
        }

        if trimmed.starts_with([' ', '\t']) {
            if let Some(value) = &mut current {
                value.push_str(trimmed);
            }
            continue;
        }

        if let Some(value) = current.take() {
            tags.push(parse_signature_tags(&value));
        }

        if let Some((name, value)) = trimmed.split_once(':') {
            let name = name.trim();
            if name.eq_ignore_ascii_case("dkim-signature")
                || name.eq_ignore_ascii_case("x-google-dkim-signature")
            {
                current = Some(value.to_string());
            }
        }
    }

    if let Some(value) = current.take() {
        tags.push(parse_signature_tags(&value));
    }

    tags
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn verdict_tokens() {
        assert_eq!(Verdict::Pass.as_str(), "pass");
        assert_eq!(Verdict::SoftFail.as_str(), "softfail");
        assert_eq!(Verdict::TempError.as_str(), "temperror");
    }

    #[test]
    fn signature_tags_parse_the_named_tags() {
        let tags = parse_signature_tags(
            "v=1; a=rsa-sha256; d=example.com; s=mail; i=bob@example.com; \
             h=from:to:subject; b=AbCdEfGhIjKlMnOp; bh=xyz",
        );

        assert_eq!(tags.domain.as_deref(), Some("example.com"));
        assert_eq!(tags.selector.as_deref(), Some("mail"));
        assert_eq!(tags.identity.as_deref(), Some("bob@example.com"));
        assert_eq!(tags.b_tag.as_deref(), Some("AbCdEfGh"));
    }

    #[test]
    fn identity_defaults_to_at_domain() {
        let tags = parse_signature_tags("v=1; d=example.com; s=mail; b=ZZ");
        assert_eq!(tags.identity.as_deref(), Some("@example.com"));
    }

    #[test]
    fn b_tag_ignores_folding_whitespace() {
        let tags = parse_signature_tags("d=example.com; b=AbCd\r\n\t EfGhMore");
        assert_eq!(tags.b_tag.as_deref(), Some("AbCdEfGh"));
    }

    #[test]
    fn signature_headers_extracted_in_document_order() {
        let message = b"From: a@example.com\r\n\
            DKIM-Signature: v=1; d=example.com; s=one; b=AAAABBBBCCCC\r\n\
            X-Google-DKIM-Signature: v=1; d=google.example; s=two;\r\n\
            \tb=DDDDEEEEFFFF\r\n\
            Subject: hi\r\n\
            \r\n\
            body\r\n";

        let tags = extract_signature_headers(message);
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].domain.as_deref(), Some("example.com"));
        assert_eq!(tags[0].b_tag.as_deref(), Some("AAAABBBB"));
        assert_eq!(tags[1].domain.as_deref(), Some("google.example"));
        assert_eq!(tags[1].b_tag.as_deref(), Some("DDDDEEEE"));
    }

    #[test]
    fn signature_scan_stops_at_body() {
        let message = b"Subject: hi\r\n\r\nDKIM-Signature: d=body.example; b=XX\r\n";
        assert!(extract_signature_headers(message).is_empty());
    }
}
