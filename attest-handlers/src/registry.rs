//! The compile-time handler registry.
//!
//! Handlers register themselves here; `load_handlers` is the
//! config-time allowlist over the statically known set. An unknown
//! name is fatal at worker startup.

use std::sync::Arc;

use attest_common::config::Config;
use attest_metrics::MetricsRegistry;
use thiserror::Error;

use crate::{
    adsp::Adsp,
    arc_chain::ArcChain,
    dkim::Dkim,
    dmarc::Dmarc,
    handler::Handler,
    iprev::Iprev,
    ptr::Ptr,
    spf::Spf,
    trusted_ip::TrustedIp,
    verifier::VerifierSet,
};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Unknown handler {0:?} in load_handlers")]
    UnknownHandler(String),
}

/// Whether `name` is a handler this build can construct.
#[must_use]
pub fn is_known_handler(name: &str) -> bool {
    matches!(
        name,
        "trusted-ip" | "iprev" | "ptr" | "spf" | "dkim" | "adsp" | "dmarc" | "arc"
    )
}

/// Instantiate one handler object per activated module.
///
/// Part of a worker's `setup_handlers()`: the result feeds
/// [`Pipeline::build`](crate::Pipeline::build) which computes and
/// caches the per-stage call orders.
pub fn build(
    config: &Config,
    resolver: &Arc<attest_dns::Resolver>,
    verifiers: &VerifierSet,
    registry: &MetricsRegistry,
) -> Result<Vec<Arc<dyn Handler>>, RegistryError> {
    config
        .load_handlers
        .iter()
        .map(|name| construct(name, config, resolver, verifiers, registry))
        .collect()
}

fn construct(
    name: &str,
    config: &Config,
    resolver: &Arc<attest_dns::Resolver>,
    verifiers: &VerifierSet,
    registry: &MetricsRegistry,
) -> Result<Arc<dyn Handler>, RegistryError> {
    Ok(match name {
        "trusted-ip" => Arc::new(TrustedIp::new(
            config.local_networks.clone(),
            config.trusted_networks.clone(),
        )),
        "iprev" => Arc::new(Iprev::new(Arc::clone(resolver), registry)),
        "ptr" => Arc::new(Ptr::new()),
        "spf" => Arc::new(Spf::new(Arc::clone(&verifiers.spf), registry)),
        "dkim" => Arc::new(Dkim::new(
            Arc::clone(&verifiers.signature),
            config.handlers.dkim.clone(),
            registry,
        )),
        "adsp" => Arc::new(Adsp::new(Arc::clone(resolver))),
        "dmarc" => Arc::new(Dmarc::new(Arc::clone(&verifiers.dmarc), registry)),
        "arc" => Arc::new(ArcChain::new(Arc::clone(&verifiers.arc))),
        unknown => return Err(RegistryError::UnknownHandler(unknown.to_string())),
    })
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::verifier::{
        ArcEvaluator, DmarcEvaluator, DmarcVerdict, SignatureVerdict, SignatureVerifier,
        SpfEvaluator, SpfVerdict, Verdict,
    };

    struct Inert;

    #[async_trait]
    impl SignatureVerifier for Inert {
        async fn verify(
            &self,
            _message: &[u8],
        ) -> Result<Vec<SignatureVerdict>, crate::HandlerError> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl SpfEvaluator for Inert {
        async fn evaluate_helo(&self, _ip: std::net::IpAddr, _helo: &str) -> SpfVerdict {
            SpfVerdict {
                result: Verdict::None,
                comment: None,
            }
        }

        async fn evaluate_mail_from(
            &self,
            _ip: std::net::IpAddr,
            _helo: &str,
            _sender: &str,
        ) -> SpfVerdict {
            SpfVerdict {
                result: Verdict::None,
                comment: None,
            }
        }
    }

    #[async_trait]
    impl DmarcEvaluator for Inert {
        async fn evaluate(
            &self,
            _message: &[u8],
            _ip: std::net::IpAddr,
            _helo: &str,
            _mail_from: &str,
            _from_domain: &str,
        ) -> Result<DmarcVerdict, crate::HandlerError> {
            Ok(DmarcVerdict {
                result: Verdict::None,
                policy: None,
            })
        }
    }

    #[async_trait]
    impl ArcEvaluator for Inert {
        async fn evaluate(&self, _message: &[u8]) -> Result<Verdict, crate::HandlerError> {
            Ok(Verdict::None)
        }
    }

    fn verifiers() -> VerifierSet {
        let inert = Arc::new(Inert);
        VerifierSet {
            signature: Arc::clone(&inert) as Arc<dyn SignatureVerifier>,
            spf: Arc::clone(&inert) as Arc<dyn SpfEvaluator>,
            dmarc: Arc::clone(&inert) as Arc<dyn DmarcEvaluator>,
            arc: inert as Arc<dyn ArcEvaluator>,
        }
    }

    fn config(load_handlers: &[&str]) -> Config {
        let mut config: Config = ron::from_str(
            r#"(
                hostname: "mx.example.com",
                connection: "inet:8893@localhost",
            )"#,
        )
        .unwrap();
        config.load_handlers = load_handlers.iter().map(ToString::to_string).collect();
        config
    }

    #[tokio::test]
    async fn builds_the_default_set_in_config_order() {
        let config = config(&[
            "trusted-ip",
            "iprev",
            "ptr",
            "spf",
            "dkim",
            "adsp",
            "dmarc",
            "arc",
        ]);
        let resolver = Arc::new(attest_dns::Resolver::new(attest_dns::DnsConfig::default()));

        let handlers = build(&config, &resolver, &verifiers(), &MetricsRegistry::new()).unwrap();
        let names: Vec<_> = handlers.iter().map(|handler| handler.name()).collect();
        assert_eq!(
            names,
            vec!["trusted-ip", "iprev", "ptr", "spf", "dkim", "adsp", "dmarc", "arc"]
        );
    }

    #[tokio::test]
    async fn unknown_handler_is_fatal() {
        let config = config(&["iprev", "no-such-module"]);
        let resolver = Arc::new(attest_dns::Resolver::new(attest_dns::DnsConfig::default()));

        let err = match build(&config, &resolver, &verifiers(), &MetricsRegistry::new()) {
            Err(err) => err,
            Ok(_) => panic!("expected build to fail"),
        };
        assert_eq!(
            err.to_string(),
            "Unknown handler \"no-such-module\" in load_handlers"
        );
    }
}
