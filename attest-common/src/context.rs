//! The per-connection context shared by every handler.
//!
//! One `Context` is constructed per accepted connection, mutated only
//! by handlers during their own callbacks, and dropped at close.
//! Handlers are cooperative: any handler may read any field and each
//! owns a private slot in `handler_state` keyed by its name.

use std::{any::Any, fmt, net::IpAddr};

use ahash::AHashMap;

use crate::internal;

/// One entry destined for the `Authentication-Results` header:
/// `method=result (comment) key=value ...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFragment {
    pub method: String,
    pub result: String,
    pub comment: Option<String>,
    pub properties: Vec<(String, String)>,
}

impl AuthFragment {
    #[must_use]
    pub fn new(method: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            result: result.into(),
            comment: None,
            properties: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push((key.into(), value.into()));
        self
    }
}

/// An informational header emitted alongside `Authentication-Results`,
/// never part of the canonical line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxHeader {
    pub name: String,
    pub value: String,
}

/// The verdict returned to the MTA. Severity only ever escalates over
/// the life of a message; an operator policy override at assembly is
/// the single exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Disposition {
    Accept,
    #[default]
    Continue,
    Quarantine,
    Tempfail,
    Discard,
    Reject,
}

impl Disposition {
    const fn severity(self) -> u8 {
        match self {
            Self::Accept => 0,
            Self::Continue => 1,
            Self::Quarantine => 2,
            Self::Tempfail => 3,
            Self::Discard => 4,
            Self::Reject => 5,
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Accept => "accept",
            Self::Continue => "continue",
            Self::Quarantine => "quarantine",
            Self::Tempfail => "tempfail",
            Self::Discard => "discard",
            Self::Reject => "reject",
        })
    }
}

/// Per-connection scratchpad.
#[derive(Default)]
pub struct Context {
    /// Address of the SMTP client as reported by the MTA.
    pub client_ip: Option<IpAddr>,
    /// Reverse-DNS name of the client, as reported or as resolved.
    pub client_rdns: Option<String>,
    /// PTR name whose forward lookup resolves back to `client_ip`.
    pub verified_ptr: Option<String>,
    /// EHLO/HELO argument.
    pub helo_name: Option<String>,

    pub is_local_ip_address: bool,
    pub is_trusted_ip_address: bool,
    pub is_authenticated: bool,

    pub envelope_from: Option<String>,
    pub envelope_rcpt: Vec<String>,

    /// MTA-assigned identifier, used as the log correlation key.
    pub queue_id: Option<String>,

    /// Raw message bytes accumulated by the engine (headers, blank
    /// line, body) for handlers that finalize at end-of-message.
    pub message: Vec<u8>,

    handler_state: AHashMap<&'static str, Box<dyn Any + Send>>,

    result_fragments: Vec<AuthFragment>,
    aux_headers: Vec<AuxHeader>,

    reject_reason: Option<String>,
    disposition: Disposition,

    pub exit_on_close: bool,
    pub exit_on_close_error: bool,
}

impl Context {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether guarded handlers should skip this client entirely.
    #[must_use]
    pub const fn is_exempt(&self) -> bool {
        self.is_local_ip_address || self.is_trusted_ip_address || self.is_authenticated
    }

    /// The handler's private per-message slot, created on first use.
    pub fn handler_slot<T: Default + Any + Send>(&mut self, handler: &'static str) -> &mut T {
        let slot = self
            .handler_state
            .entry(handler)
            .or_insert_with(|| Box::new(T::default()));

        // A type clash here means two handlers share one name, which the
        // registry rejects; recover by resetting the slot.
        if !slot.is::<T>() {
            *slot = Box::new(T::default());
        }

        slot.downcast_mut::<T>().unwrap()
    }

    /// A read-only peek at another handler's published slot.
    #[must_use]
    pub fn peek_slot<T: Any + Send>(&self, handler: &'static str) -> Option<&T> {
        self.handler_state
            .get(handler)
            .and_then(|slot| slot.downcast_ref())
    }

    pub fn add_auth_fragment(&mut self, fragment: AuthFragment) {
        self.result_fragments.push(fragment);
    }

    pub fn add_aux_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.aux_headers.push(AuxHeader {
            name: name.into(),
            value: value.into(),
        });
    }

    #[must_use]
    pub fn fragments(&self) -> &[AuthFragment] {
        &self.result_fragments
    }

    #[must_use]
    pub fn aux_headers(&self) -> &[AuxHeader] {
        &self.aux_headers
    }

    #[must_use]
    pub const fn disposition(&self) -> Disposition {
        self.disposition
    }

    #[must_use]
    pub fn reject_reason(&self) -> Option<&str> {
        self.reject_reason.as_deref()
    }

    /// Escalate the disposition; a weaker request than the current one
    /// is ignored.
    pub fn escalate(&mut self, disposition: Disposition) {
        if disposition.severity() > self.disposition.severity() {
            self.disposition = disposition;
        }
    }

    pub fn set_reject(&mut self, reason: impl Into<String>) {
        self.reject_reason = Some(reason.into());
        self.escalate(Disposition::Reject);
    }

    pub fn set_quarantine(&mut self, reason: impl Into<String>) {
        self.reject_reason = Some(reason.into());
        self.escalate(Disposition::Quarantine);
    }

    pub fn set_tempfail(&mut self, reason: impl Into<String>) {
        self.reject_reason = Some(reason.into());
        self.escalate(Disposition::Tempfail);
    }

    /// Operator policy override applied at final assembly. The only
    /// path that may lower severity.
    pub fn override_disposition(&mut self, disposition: Disposition) {
        self.disposition = disposition;
    }

    /// Clear everything scoped to the current message, keeping the
    /// connection-scoped classification. On ABORT the fragments
    /// accumulated so far are discarded and their count logged.
    pub fn reset_message(&mut self, aborted: bool) {
        if aborted && !self.result_fragments.is_empty() {
            internal!(
                level = DEBUG,
                "Discarding {} result fragment(s) on abort (queue_id: {})",
                self.result_fragments.len(),
                self.queue_id.as_deref().unwrap_or("-")
            );
        }

        self.envelope_from = None;
        self.envelope_rcpt.clear();
        self.queue_id = None;
        self.message.clear();
        self.handler_state.clear();
        self.result_fragments.clear();
        self.aux_headers.clear();
        self.reject_reason = None;
        self.disposition = Disposition::default();
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("client_ip", &self.client_ip)
            .field("client_rdns", &self.client_rdns)
            .field("verified_ptr", &self.verified_ptr)
            .field("helo_name", &self.helo_name)
            .field("is_local_ip_address", &self.is_local_ip_address)
            .field("is_trusted_ip_address", &self.is_trusted_ip_address)
            .field("is_authenticated", &self.is_authenticated)
            .field("envelope_from", &self.envelope_from)
            .field("envelope_rcpt", &self.envelope_rcpt)
            .field("queue_id", &self.queue_id)
            .field("fragments", &self.result_fragments)
            .field("disposition", &self.disposition)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn disposition_escalates_monotonically() {
        let mut ctx = Context::new();
        assert_eq!(ctx.disposition(), Disposition::Continue);

        ctx.escalate(Disposition::Quarantine);
        assert_eq!(ctx.disposition(), Disposition::Quarantine);

        ctx.set_reject("bad actor");
        assert_eq!(ctx.disposition(), Disposition::Reject);

        // A later, weaker request never wins.
        ctx.escalate(Disposition::Continue);
        ctx.set_tempfail("try later");
        assert_eq!(ctx.disposition(), Disposition::Reject);
    }

    #[test]
    fn operator_override_may_lower() {
        let mut ctx = Context::new();
        ctx.set_reject("spam");
        ctx.override_disposition(Disposition::Accept);
        assert_eq!(ctx.disposition(), Disposition::Accept);
    }

    #[test]
    fn handler_slots_are_private_and_typed() {
        #[derive(Default)]
        struct Scratch {
            count: u32,
        }

        let mut ctx = Context::new();
        ctx.handler_slot::<Scratch>("dkim").count = 3;
        ctx.handler_slot::<Scratch>("dkim").count += 1;
        assert_eq!(ctx.handler_slot::<Scratch>("dkim").count, 4);
        assert_eq!(ctx.handler_slot::<Scratch>("spf").count, 0);

        assert_eq!(ctx.peek_slot::<Scratch>("dkim").map(|s| s.count), Some(4));
        assert!(ctx.peek_slot::<Scratch>("missing").is_none());
    }

    #[test]
    fn reset_message_keeps_connection_scope() {
        let mut ctx = Context::new();
        ctx.client_ip = Some("192.0.2.1".parse().unwrap());
        ctx.helo_name = Some("mx.example.com".to_string());
        ctx.is_trusted_ip_address = true;
        ctx.envelope_from = Some("a@example.com".to_string());
        ctx.envelope_rcpt.push("b@example.org".to_string());
        ctx.queue_id = Some("4Zw1".to_string());
        ctx.message.extend_from_slice(b"Subject: hi\r\n\r\nbody");
        ctx.add_auth_fragment(AuthFragment::new("spf", "pass"));
        ctx.set_reject("nope");

        ctx.reset_message(true);

        assert_eq!(ctx.client_ip, Some("192.0.2.1".parse().unwrap()));
        assert_eq!(ctx.helo_name.as_deref(), Some("mx.example.com"));
        assert!(ctx.is_trusted_ip_address);

        assert!(ctx.envelope_from.is_none());
        assert!(ctx.envelope_rcpt.is_empty());
        assert!(ctx.queue_id.is_none());
        assert!(ctx.message.is_empty());
        assert!(ctx.fragments().is_empty());
        assert!(ctx.reject_reason().is_none());
        assert_eq!(ctx.disposition(), Disposition::Continue);
    }

    #[test]
    fn exemption_covers_all_three_classifications() {
        let mut ctx = Context::new();
        assert!(!ctx.is_exempt());

        ctx.is_local_ip_address = true;
        assert!(ctx.is_exempt());

        ctx.is_local_ip_address = false;
        ctx.is_authenticated = true;
        assert!(ctx.is_exempt());
    }

    #[test]
    fn fragments_are_append_only_in_order() {
        let mut ctx = Context::new();
        ctx.add_auth_fragment(AuthFragment::new("iprev", "pass"));
        ctx.add_auth_fragment(
            AuthFragment::new("dkim", "pass").with_property("header.d", "example.com"),
        );

        let methods: Vec<_> = ctx.fragments().iter().map(|f| f.method.as_str()).collect();
        assert_eq!(methods, vec!["iprev", "dkim"]);
    }
}
