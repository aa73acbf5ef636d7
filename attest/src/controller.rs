//! Top-level daemon orchestration: configuration, logging, listener
//! binding, privilege drop, signal handling and the restart loop
//! around the serve cycle.

use std::{path::PathBuf, sync::Arc, time::Instant};

use attest_common::{config::Config, internal, logging, Signal};
use attest_metrics::MetricsRegistry;
use tokio::sync::{broadcast, mpsc};

use crate::{
    listeners,
    privs,
    supervisor::{
        RestartThrottle, Supervisor, SupervisorError, RESTART_DELAY, RESTART_LIMIT,
        RESTART_WINDOW,
    },
};

pub struct Controller {
    config_path: PathBuf,
}

impl Controller {
    #[must_use]
    pub const fn new(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    pub fn from_default_location() -> anyhow::Result<Self> {
        Ok(Self::new(Config::find_file()?))
    }

    /// Run the daemon until shutdown.
    ///
    /// A failed serve cycle is restarted after ten seconds unless the
    /// restart throttle trips, in which case the master abandons and
    /// exits nonzero. Fatal configuration problems never retry.
    pub async fn run(self) -> anyhow::Result<()> {
        let config = Config::load(&self.config_path)?;

        let error_log = match &config.error_log {
            Some(path) => {
                let file = logging::open_error_log(path)?;
                privs::chown_to_runas(path, &config)?;
                Some(file)
            }
            None => None,
        };
        logging::init(config.debug, error_log);

        internal!(level = INFO, "Controller running ({})", config.hostname);

        let (shutdown, _) = broadcast::channel(64);
        tokio::spawn(watch_signals(shutdown.clone()));

        let mut throttle = RestartThrottle::new(RESTART_LIMIT, RESTART_WINDOW);
        let config = Arc::new(config);

        loop {
            match self.serve_cycle(Arc::clone(&config), &shutdown).await {
                Ok(()) => {
                    internal!(level = INFO, "Shutting down");
                    return Ok(());
                }
                Err(err @ (SupervisorError::Fatal(_) | SupervisorError::RestartStorm { .. })) => {
                    internal!(level = ERROR, "{err}");
                    anyhow::bail!(err);
                }
                Err(SupervisorError::Transient(reason)) => {
                    internal!(level = ERROR, "Serve cycle failed: {reason}");
                    if throttle.record(Instant::now()) {
                        internal!(level = ERROR, "Abandoning automatic restart");
                        anyhow::bail!("Abandoning automatic restart");
                    }
                    internal!(level = INFO, "Restarting in {}s", RESTART_DELAY.as_secs());
                    tokio::time::sleep(RESTART_DELAY).await;
                }
            }
        }
    }

    /// One serve cycle: bind everything, drop privileges, run the
    /// supervisor until it stops.
    async fn serve_cycle(
        &self,
        config: Arc<Config>,
        shutdown: &broadcast::Sender<Signal>,
    ) -> Result<(), SupervisorError> {
        let backlog = config.workers.listen_backlog;
        let queue_depth = usize::try_from(backlog).unwrap_or(20).max(1);
        let (queue_tx, queue_rx) = mpsc::channel(queue_depth);

        let mut accept_tasks = Vec::new();
        for (idx, listener_config) in config.data_connections().into_iter().enumerate() {
            let spec = listener_config.connection;
            let bound = listeners::bind(&spec, backlog, listener_config.umask)
                .await
                .map_err(|err| {
                    SupervisorError::Fatal(format!("Failed to bind {spec}: {err}"))
                })?;

            accept_tasks.push(tokio::spawn(listeners::accept_loop(
                format!("{spec} (#{idx})"),
                bound,
                queue_tx.clone(),
                shutdown.subscribe(),
            )));
        }
        // Workers observe a closed queue when every accept loop ends.
        drop(queue_tx);

        let metrics = Arc::new(MetricsRegistry::new());
        let mut metrics_task = None;
        if let Some(spec) = config.metric_connection() {
            let registry = Arc::clone(&metrics);
            let receiver = shutdown.subscribe();
            metrics_task = Some(tokio::spawn(async move {
                if let Err(err) = attest_metrics::serve(spec, registry, receiver).await {
                    internal!(level = ERROR, "Metrics listener failed: {err}");
                }
            }));
        }

        // Sockets are bound; identity can drop now.
        privs::drop_privileges(&config)
            .map_err(|err| SupervisorError::Fatal(format!("Privilege drop failed: {err}")))?;

        let supervisor = Supervisor::new(
            Arc::clone(&config),
            Some(self.config_path.clone()),
            metrics,
            queue_rx,
        );
        let outcome = supervisor.run(shutdown.clone()).await;

        for task in accept_tasks {
            task.abort();
        }
        if let Some(task) = metrics_task {
            task.abort();
        }

        outcome
    }
}

/// Translate process signals into the internal control broadcast:
/// SIGTERM and ctrl-c shut down, SIGQUIT drains, SIGHUP reloads.
async fn watch_signals(shutdown: broadcast::Sender<Signal>) {
    use tokio::signal::unix::{signal, SignalKind};

    let Ok(mut hangup) = signal(SignalKind::hangup()) else {
        return;
    };
    let Ok(mut quit) = signal(SignalKind::quit()) else {
        return;
    };
    let Ok(mut terminate) = signal(SignalKind::terminate()) else {
        return;
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                internal!(level = INFO, "Interrupt received, shutting down");
                let _ = shutdown.send(Signal::Shutdown);
            }
            _ = terminate.recv() => {
                internal!(level = INFO, "SIGTERM received, shutting down");
                let _ = shutdown.send(Signal::Shutdown);
            }
            _ = quit.recv() => {
                internal!(level = INFO, "SIGQUIT received, draining");
                let _ = shutdown.send(Signal::Drain);
            }
            _ = hangup.recv() => {
                internal!(level = INFO, "SIGHUP received, reloading configuration");
                let _ = shutdown.send(Signal::Reload);
            }
        }
    }
}
