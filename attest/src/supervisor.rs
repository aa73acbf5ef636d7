//! The worker supervisor: keeps the pool between its configured
//! bounds, reaps finished workers and spawns replacements, retires
//! surplus or stale workers, and abandons the daemon when worker
//! failures storm.

use std::{
    collections::VecDeque,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use attest_common::{config::Config, internal, Signal};
use attest_metrics::{Counter, MetricsRegistry, FORKED_CHILDREN_TOTAL, REAPED_CHILDREN_TOTAL};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinSet,
};

use crate::{
    listeners::Accepted,
    worker::{Worker, WorkerExit},
};

/// Delay before the controller restarts a failed serve cycle.
pub const RESTART_DELAY: Duration = Duration::from_secs(10);
/// Failures inside this window trip the abandonment throttle.
pub const RESTART_WINDOW: Duration = Duration::from_secs(120);
/// Failures within the window after which restarting is abandoned.
pub const RESTART_LIMIT: usize = 4;

#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Unrecoverable: pipeline cycle, unknown handler, bind failure.
    /// The master exits nonzero without retrying.
    #[error("{0}")]
    Fatal(String),

    /// Too many failures too quickly; the master gives up.
    #[error("Abandoning automatic restart: {failures} failures within {window_secs}s")]
    RestartStorm { failures: usize, window_secs: u64 },

    /// The serve cycle collapsed but a restart may recover it.
    #[error("{0}")]
    Transient(String),
}

/// Sliding-window failure counter behind the restart policy: allow a
/// restart unless `limit` failures landed within `window`.
#[derive(Debug)]
pub struct RestartThrottle {
    limit: usize,
    window: Duration,
    events: VecDeque<Instant>,
}

impl RestartThrottle {
    #[must_use]
    pub const fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            events: VecDeque::new(),
        }
    }

    /// Record a failure at `now`; `true` means give up.
    pub fn record(&mut self, now: Instant) -> bool {
        self.events.push_back(now);
        while let Some(&oldest) = self.events.front() {
            if now.duration_since(oldest) > self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
        self.events.len() >= self.limit
    }
}

/// Shared pool bookkeeping workers update as they move between idle
/// and busy.
#[derive(Debug, Default)]
pub struct PoolState {
    idle: AtomicUsize,
    retiring: AtomicUsize,
    generation: AtomicU64,
}

impl PoolState {
    pub fn idle_enter(&self) {
        self.idle.fetch_add(1, Ordering::Relaxed);
    }

    pub fn idle_leave(&self) {
        self.idle.fetch_sub(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn idle(&self) -> usize {
        self.idle.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }

    pub fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::Relaxed);
    }

    /// Ask `count` workers to retire once idle.
    pub fn request_retirement(&self, count: usize) {
        self.retiring.fetch_add(count, Ordering::Relaxed);
    }

    /// Claim one pending retirement request, if any.
    pub fn take_retirement(&self) -> bool {
        let mut current = self.retiring.load(Ordering::Relaxed);
        while current > 0 {
            match self.retiring.compare_exchange(
                current,
                current - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
        false
    }
}

pub struct Supervisor {
    config: Arc<Config>,
    config_path: Option<PathBuf>,
    metrics: Arc<MetricsRegistry>,
    queue: Arc<Mutex<mpsc::Receiver<Accepted>>>,
    pool: Arc<PoolState>,
    forked: Counter,
    reaped: Counter,
    throttle: RestartThrottle,
    next_worker_id: u64,
}

impl Supervisor {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        config_path: Option<PathBuf>,
        metrics: Arc<MetricsRegistry>,
        queue: mpsc::Receiver<Accepted>,
    ) -> Self {
        let forked = metrics.counter(FORKED_CHILDREN_TOTAL);
        let reaped = metrics.counter(REAPED_CHILDREN_TOTAL);

        Self {
            config,
            config_path,
            metrics,
            queue: Arc::new(Mutex::new(queue)),
            pool: Arc::new(PoolState::default()),
            forked,
            reaped,
            throttle: RestartThrottle::new(RESTART_LIMIT, RESTART_WINDOW),
            next_worker_id: 0,
        }
    }

    fn spawn_worker(
        &mut self,
        workers: &mut JoinSet<WorkerExit>,
        shutdown: &broadcast::Sender<Signal>,
    ) -> Result<(), SupervisorError> {
        self.next_worker_id += 1;
        let worker = Worker::setup(
            self.next_worker_id,
            self.pool.generation(),
            Arc::clone(&self.config),
            Arc::clone(&self.metrics),
        )?;

        workers.spawn(worker.run(
            Arc::clone(&self.queue),
            shutdown.subscribe(),
            Arc::clone(&self.pool),
        ));
        self.forked.incr();
        Ok(())
    }

    fn maintain_pool(
        &mut self,
        workers: &mut JoinSet<WorkerExit>,
        shutdown: &broadcast::Sender<Signal>,
    ) -> Result<(), SupervisorError> {
        let sizing = self.config.workers.clone();
        let total = workers.len();
        let idle = self.pool.idle();

        if total < sizing.min_children {
            for _ in total..sizing.min_children {
                self.spawn_worker(workers, shutdown)?;
            }
        } else if idle < sizing.min_spare_children && total < sizing.max_children {
            self.spawn_worker(workers, shutdown)?;
        } else if idle > sizing.max_spare_children && total > sizing.min_children {
            let surplus = (idle - sizing.max_spare_children).min(total - sizing.min_children);
            self.pool.request_retirement(surplus);
        }

        Ok(())
    }

    fn reload_config(&mut self) {
        let Some(path) = self.config_path.clone() else {
            internal!(level = WARN, "Reload requested but no config path is known");
            return;
        };

        match Config::load(&path) {
            Ok(config) => {
                internal!(level = INFO, "Configuration reloaded, replacing workers");
                self.config = Arc::new(config);
                // Stale-generation workers retire once their current
                // connection finishes; nothing in flight is dropped.
                self.pool.bump_generation();
            }
            Err(err) => {
                internal!(level = ERROR, "Reload failed, keeping old configuration: {err}");
            }
        }
    }

    /// Run the pool until shutdown. `Err` means the daemon must stop:
    /// fatal configuration problems immediately, or a worker-failure
    /// storm that exhausted the restart budget.
    pub async fn run(
        mut self,
        shutdown: broadcast::Sender<Signal>,
    ) -> Result<(), SupervisorError> {
        let mut workers: JoinSet<WorkerExit> = JoinSet::new();
        let mut shutdown_rx = shutdown.subscribe();
        let mut stopping = false;
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        internal!(
            level = INFO,
            "Supervisor starting {} worker(s)",
            self.config.workers.min_children
        );
        for _ in 0..self.config.workers.min_children {
            self.spawn_worker(&mut workers, &shutdown)?;
        }

        loop {
            tokio::select! {
                signal = shutdown_rx.recv() => {
                    match signal {
                        Ok(Signal::Shutdown | Signal::Drain) | Err(broadcast::error::RecvError::Closed) => {
                            internal!(level = INFO, "Supervisor draining workers");
                            stopping = true;
                            if workers.is_empty() {
                                break;
                            }
                        }
                        Ok(Signal::Reload) => {
                            self.reload_config();
                            self.maintain_pool(&mut workers, &shutdown)?;
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                    }
                }

                Some(finished) = workers.join_next() => {
                    self.reaped.incr();

                    let exit = match finished {
                        Ok(exit) => Some(exit),
                        Err(err) => {
                            internal!(level = ERROR, "Worker died: {err}");
                            None
                        }
                    };

                    if stopping {
                        if workers.is_empty() {
                            break;
                        }
                        continue;
                    }

                    let failed =
                        matches!(exit, None | Some(WorkerExit::ExitOnClose { error: true }));
                    if failed && self.throttle.record(Instant::now()) {
                        return Err(SupervisorError::RestartStorm {
                            failures: RESTART_LIMIT,
                            window_secs: RESTART_WINDOW.as_secs(),
                        });
                    }

                    if exit == Some(WorkerExit::Shutdown) {
                        // Not stopping, yet a worker saw the queue
                        // close: the listeners collapsed.
                        return Err(SupervisorError::Transient(
                            "connection queue closed while serving".to_string(),
                        ));
                    }

                    self.maintain_pool(&mut workers, &shutdown)?;
                }

                _ = tick.tick() => {
                    if !stopping {
                        self.maintain_pool(&mut workers, &shutdown)?;
                    }
                }
            }
        }

        while let Some(finished) = workers.join_next().await {
            self.reaped.incr();
            if let Err(err) = finished {
                internal!(level = ERROR, "Worker died during drain: {err}");
            }
        }

        internal!(level = INFO, "Supervisor stopped");
        Ok(())
    }
}
