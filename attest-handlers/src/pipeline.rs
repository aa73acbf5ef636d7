//! Per-stage topological ordering and dispatch.
//!
//! The order is computed once per worker and cached for its lifetime.
//! Ties break lexicographically by handler name so the emitted
//! `Authentication-Results` method ordering is reproducible.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Instant,
};

use attest_common::{
    context::{AuthFragment, Context},
    internal,
};
use attest_metrics::MetricsRegistry;
use thiserror::Error;

use crate::handler::{Handler, HandlerError, Stage};

/// A lifecycle event together with its stage-specific arguments.
#[derive(Debug, Clone, Copy)]
pub enum Event<'a> {
    Connect,
    Helo(&'a str),
    EnvFrom(&'a str),
    EnvRcpt(&'a str),
    Header(&'a str, &'a str),
    Eoh,
    Body(&'a [u8]),
    Eom,
    Abort,
    Close,
}

impl Event<'_> {
    #[must_use]
    pub const fn stage(&self) -> Stage {
        match self {
            Self::Connect => Stage::Connect,
            Self::Helo(_) => Stage::Helo,
            Self::EnvFrom(_) => Stage::EnvFrom,
            Self::EnvRcpt(_) => Stage::EnvRcpt,
            Self::Header(..) => Stage::Header,
            Self::Eoh => Stage::Eoh,
            Self::Body(_) => Stage::Body,
            Self::Eom => Stage::Eom,
            Self::Abort => Stage::Abort,
            Self::Close => Stage::Close,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The dependency graph has a cycle; no valid call order exists.
    #[error("Could not build order list for stage {stage}: {remaining:?} still have unmet requirements")]
    OrderList {
        stage: Stage,
        remaining: Vec<String>,
    },

    /// Two handlers share a name; slots and ordering would collide.
    #[error("Duplicate handler name {0:?}")]
    DuplicateName(String),
}

/// The per-worker handler set with its cached per-stage call orders.
pub struct Pipeline {
    handlers: Vec<Arc<dyn Handler>>,
    order: HashMap<Stage, Vec<usize>>,
    metrics: Arc<MetricsRegistry>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("handlers", &self.handlers.iter().map(|h| h.name()).collect::<Vec<_>>())
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Sort the handlers once per stage and cache the result.
    ///
    /// A cycle in the declared dependencies is a fatal global error:
    /// the worker refuses to start and the master exits nonzero.
    pub fn build(
        handlers: Vec<Arc<dyn Handler>>,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self, PipelineError> {
        let mut seen = BTreeSet::new();
        for handler in &handlers {
            if !seen.insert(handler.name()) {
                return Err(PipelineError::DuplicateName(handler.name().to_string()));
            }
            handler.register_metrics(&metrics);
        }

        let mut order = HashMap::new();
        for stage in Stage::ALL {
            order.insert(stage, stage_order(&handlers, stage)?);
        }

        for stage in Stage::ALL {
            let names: Vec<_> = order[&stage]
                .iter()
                .map(|&idx| handlers[idx].name())
                .collect();
            if !names.is_empty() {
                internal!(level = DEBUG, "Callback order for {stage}: {names:?}");
            }
        }

        Ok(Self {
            handlers,
            order,
            metrics,
        })
    }

    #[must_use]
    pub fn handler_names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|handler| handler.name()).collect()
    }

    /// The cached call order for `stage`, by handler name.
    #[must_use]
    pub fn order_for(&self, stage: Stage) -> Vec<&'static str> {
        self.order[&stage]
            .iter()
            .map(|&idx| self.handlers[idx].name())
            .collect()
    }

    /// Invoke every handler declaring this event's stage, in cached
    /// order.
    ///
    /// A handler error is reified as a single `temperror`/`permerror`
    /// fragment for that handler; the walk always continues so the
    /// assembled header stays complete. Dispositions requested by
    /// handlers never short-circuit dispatch either; the engine
    /// consults the accumulated disposition at end-of-message.
    pub async fn dispatch(&self, ctx: &mut Context, event: Event<'_>) {
        let stage = event.stage();
        let started = Instant::now();

        for &idx in &self.order[&stage] {
            let handler = &self.handlers[idx];
            let outcome = match event {
                Event::Connect => handler.connect(ctx).await,
                Event::Helo(helo) => handler.helo(ctx, helo).await,
                Event::EnvFrom(addr) => handler.envfrom(ctx, addr).await,
                Event::EnvRcpt(addr) => handler.envrcpt(ctx, addr).await,
                Event::Header(name, value) => handler.header(ctx, name, value).await,
                Event::Eoh => handler.eoh(ctx).await,
                Event::Body(chunk) => handler.body(ctx, chunk).await,
                Event::Eom => handler.eom(ctx).await,
                Event::Abort => handler.abort(ctx).await,
                Event::Close => handler.close(ctx).await,
            };

            if let Err(err) = outcome {
                self.reify_error(ctx, handler.name(), stage, &err);
            }
        }

        self.metrics.record_stage(stage.as_str(), started.elapsed());
    }

    fn reify_error(&self, ctx: &mut Context, name: &str, stage: Stage, err: &HandlerError) {
        internal!(
            level = WARN,
            "Handler {name} failed at {stage} (queue_id: {}): {err}",
            ctx.queue_id.as_deref().unwrap_or("-")
        );

        ctx.add_auth_fragment(
            AuthFragment::new(name, err.result_token()).with_comment(err.to_string()),
        );
        self.metrics
            .counter(&format!("handler_{name}_error_total"))
            .incr();
    }
}

/// Build the call order for one stage.
///
/// Handlers not declaring the stage are absent. Requirements naming a
/// handler that is inactive in this stage are ignored; stages are
/// already strictly ordered against each other.
fn stage_order(
    handlers: &[Arc<dyn Handler>],
    stage: Stage,
) -> Result<Vec<usize>, PipelineError> {
    // Lexicographic seed gives deterministic tie-breaking.
    let mut todo: Vec<usize> = (0..handlers.len())
        .filter(|&idx| handlers[idx].stages().contains(&stage))
        .collect();
    todo.sort_by_key(|&idx| handlers[idx].name());

    let in_stage: BTreeSet<&str> = todo.iter().map(|&idx| handlers[idx].name()).collect();

    // requirements[name] = peers that must have run before `name`.
    let mut requirements: HashMap<&str, BTreeSet<&str>> = HashMap::new();
    for &idx in &todo {
        let handler = &handlers[idx];
        let entry = requirements.entry(handler.name()).or_default();
        for &peer in handler.requires_before(stage) {
            if in_stage.contains(peer) {
                entry.insert(peer);
            }
        }
    }

    // `required_after` inverts into a requirement on the peer.
    for &idx in &todo {
        let handler = &handlers[idx];
        for &peer in handler.required_after(stage) {
            if in_stage.contains(peer) {
                requirements.entry(peer).or_default().insert(handler.name());
            }
        }
    }

    let mut emitted = Vec::with_capacity(todo.len());
    let mut satisfied: BTreeSet<&str> = BTreeSet::new();

    while !todo.is_empty() {
        let mut progressed = false;

        let mut remaining = Vec::with_capacity(todo.len());
        for idx in todo {
            let name = handlers[idx].name();
            let unmet = requirements
                .get(name)
                .is_some_and(|reqs| !reqs.iter().all(|req| satisfied.contains(req)));

            if unmet {
                remaining.push(idx);
            } else {
                satisfied.insert(name);
                emitted.push(idx);
                progressed = true;
            }
        }

        if !progressed {
            return Err(PipelineError::OrderList {
                stage,
                remaining: remaining
                    .iter()
                    .map(|&idx| handlers[idx].name().to_string())
                    .collect(),
            });
        }

        todo = remaining;
    }

    Ok(emitted)
}
