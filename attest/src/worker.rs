//! One worker: its own handler pipeline and DNS cache, serving
//! connections from the shared queue until its request budget is
//! spent or the supervisor retires it.

use std::{sync::Arc, time::Duration};

use attest_common::{config::Config, config::FrontendProtocol, internal, Signal};
use attest_dns::{DnsConfig, Resolver};
use attest_handlers::{Pipeline, RfcVerifier, VerifierSet};
use attest_metrics::MetricsRegistry;
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::{
    listeners::Accepted,
    supervisor::{PoolState, SupervisorError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// `max_requests_per_child` messages served.
    Budget,
    /// Retired by the supervisor (spare trimming or config reload).
    Retired,
    /// Shutdown signal or closed queue.
    Shutdown,
    /// A handler requested worker termination for diagnostics.
    ExitOnClose { error: bool },
}

pub struct Worker {
    id: u64,
    generation: u64,
    config: Arc<Config>,
    pipeline: Arc<Pipeline>,
    metrics: Arc<MetricsRegistry>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// `setup_handlers()`: instantiate one handler object per active
    /// module and compute the cached per-stage call orders. A cycle or
    /// an unknown handler name here is fatal for the whole daemon.
    pub fn setup(
        id: u64,
        generation: u64,
        config: Arc<Config>,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self, SupervisorError> {
        // Refuse unknown handler names before anything else is built.
        if let Some(unknown) = config
            .load_handlers
            .iter()
            .find(|name| !attest_handlers::is_known_handler(name.as_str()))
        {
            return Err(SupervisorError::Fatal(
                attest_handlers::RegistryError::UnknownHandler(unknown.clone()).to_string(),
            ));
        }

        let resolver = Arc::new(Resolver::new(DnsConfig {
            timeout_secs: config.timeouts.dns_secs,
            ..DnsConfig::default()
        }));

        let verifier = RfcVerifier::new(config.hostname.clone(), Arc::clone(&resolver))
            .map_err(|err| SupervisorError::Fatal(format!("verifier setup failed: {err}")))?;
        let verifiers = VerifierSet::rfc(Arc::new(verifier));

        let handlers = attest_handlers::build(&config, &resolver, &verifiers, &metrics)
            .map_err(|err| SupervisorError::Fatal(err.to_string()))?;
        let pipeline = Pipeline::build(handlers, Arc::clone(&metrics))
            .map_err(|err| SupervisorError::Fatal(err.to_string()))?;

        Ok(Self {
            id,
            generation,
            config,
            pipeline: Arc::new(pipeline),
            metrics,
        })
    }

    pub async fn run(
        self,
        queue: Arc<Mutex<mpsc::Receiver<Accepted>>>,
        mut shutdown: broadcast::Receiver<Signal>,
        pool: Arc<PoolState>,
    ) -> WorkerExit {
        internal!(level = DEBUG, "Worker {} waiting (0)", self.id);

        let budget = self.config.workers.max_requests_per_child;
        let mut served: u64 = 0;

        loop {
            if pool.generation() != self.generation {
                internal!(level = DEBUG, "Worker {} retiring (stale config)", self.id);
                return WorkerExit::Retired;
            }
            if pool.take_retirement() {
                internal!(level = DEBUG, "Worker {} retiring (spare)", self.id);
                return WorkerExit::Retired;
            }

            pool.idle_enter();
            let next = {
                let mut receiver = queue.lock().await;
                tokio::select! {
                    signal = shutdown.recv() => {
                        pool.idle_leave();
                        return match signal {
                            Ok(Signal::Reload) => WorkerExit::Retired,
                            _ => WorkerExit::Shutdown,
                        };
                    }
                    conn = receiver.recv() => conn,
                }
            };
            pool.idle_leave();

            let Some(accepted) = next else {
                // Queue closed underneath us.
                return WorkerExit::Shutdown;
            };

            internal!(level = DEBUG, "Worker {} processing ({})", self.id, served + 1);

            let remaining = budget.saturating_sub(served).max(1);
            let outcome = self.serve(accepted, remaining).await;

            match outcome {
                Ok((messages, exit_on_close, exit_error)) => {
                    served += messages;
                    if exit_on_close {
                        internal!(
                            level = WARN,
                            "Worker {} terminating on handler request",
                            self.id
                        );
                        return WorkerExit::ExitOnClose { error: exit_error };
                    }
                }
                Err(err) if err.is_shutdown() => return WorkerExit::Shutdown,
                Err(err) => {
                    // A misbehaving client taints only its own
                    // connection.
                    internal!(level = WARN, "Worker {} session error: {err}", self.id);
                }
            }

            if served >= budget {
                internal!(
                    level = DEBUG,
                    "Worker {} request budget spent ({served}), exiting",
                    self.id
                );
                return WorkerExit::Budget;
            }
        }
    }

    async fn serve(
        &self,
        accepted: Accepted,
        remaining: u64,
    ) -> Result<(u64, bool, bool), attest_common::error::SessionError> {
        let timeouts = &self.config.timeouts;

        match self.config.protocol {
            FrontendProtocol::Milter => {
                let session = attest_milter::Session::new(
                    accepted.stream,
                    Arc::clone(&self.pipeline),
                    Arc::clone(&self.metrics),
                    attest_milter::SessionConfig {
                        hostname: self.config.hostname.clone(),
                        command_timeout: Duration::from_secs(timeouts.command_secs),
                        message_timeout: Duration::from_secs(timeouts.message_secs),
                        max_messages: Some(remaining),
                    },
                );
                let outcome = session.run().await?;
                Ok((
                    outcome.messages,
                    outcome.exit_on_close,
                    outcome.exit_on_close_error,
                ))
            }
            FrontendProtocol::Smtp => {
                let session = attest_smtp::Session::new(
                    accepted.stream,
                    accepted.peer,
                    Arc::clone(&self.pipeline),
                    Arc::clone(&self.metrics),
                    attest_smtp::SessionConfig {
                        hostname: self.config.hostname.clone(),
                        upstream: self.config.upstream.clone(),
                        command_timeout: Duration::from_secs(timeouts.command_secs),
                        message_timeout: Duration::from_secs(timeouts.message_secs),
                        max_messages: Some(remaining),
                    },
                );
                let outcome = session.run().await?;
                Ok((
                    outcome.messages,
                    outcome.exit_on_close,
                    outcome.exit_on_close_error,
                ))
            }
        }
    }
}
