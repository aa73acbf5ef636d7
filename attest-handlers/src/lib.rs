//! The authentication handler pipeline.
//!
//! Handlers are cooperative modules sharing one per-connection
//! [`Context`](attest_common::context::Context). The scheduler computes
//! a per-stage topological order over their declared dependencies once
//! per worker and dispatches lifecycle events through it.

mod adsp;
mod arc_chain;
mod dkim;
mod dmarc;
mod handler;
mod iprev;
mod pipeline;
mod ptr;
mod registry;
mod spf;
mod trusted_ip;
mod verifier;

pub use adsp::Adsp;
pub use arc_chain::ArcChain;
pub use dkim::{Dkim, DkimVerdicts};
pub use dmarc::Dmarc;
pub use handler::{Handler, HandlerError, HandlerResult, Stage};
pub use iprev::Iprev;
pub use pipeline::{Event, Pipeline, PipelineError};
pub use ptr::Ptr;
pub use registry::{build, is_known_handler, RegistryError};
pub use spf::Spf;
pub use trusted_ip::TrustedIp;
pub use verifier::{
    ArcEvaluator, DmarcEvaluator, DmarcVerdict, RfcVerifier, SignatureVerifier, SignatureVerdict,
    SpfEvaluator, SpfVerdict, Verdict, VerifierSet,
};
