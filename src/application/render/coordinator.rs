//! Render coordinator.
//!
//! A single driver task owns every piece of mutable state: the request queue,
//! the active batch, and the readiness of the shared surface. Submissions,
//! script messages and timer expiries all reach it over channels, so results
//! are correlated on one logical execution context and requests never
//! interleave on the surface.

use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::{Duration, Instant},
};

use metrics::{counter, histogram};
use once_cell::sync::{Lazy, OnceCell};
use thiserror::Error;
use tokio::{
    runtime::Handle,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::FormulaCache;
use crate::config::{
    DEFAULT_CACHE_CAPACITY, DEFAULT_DISPLAY_MODE, DEFAULT_READY_TIMEOUT_SECS,
    DEFAULT_RENDER_SCALE, DEFAULT_REQUEST_TIMEOUT_SECS, RenderSettings,
};
use crate::util::lock::mutex_lock;

use super::channel::{self, BatchResults, InboundMessage};
use super::jobs::{RenderBatch, ResolveOutcome};
use super::katex_surface::KatexSurface;
use super::surface::{
    MessageSink, PostedMessage, RenderSurface, ScriptBundle, ScriptCall, SurfaceManager,
};
use super::types::{FormulaError, FormulaImage, RenderResult, SurfaceError};

const SOURCE: &str = "application::render::coordinator";
const METRIC_FORMULAS_RENDERED: &str = "mathsnap_formulas_rendered_total";
const METRIC_FORMULAS_FAILED: &str = "mathsnap_formulas_failed_total";
const METRIC_REQUESTS_TIMED_OUT: &str = "mathsnap_requests_timed_out_total";
const METRIC_REQUEST_MS: &str = "mathsnap_request_ms";
/// A request is sent to the surface at most this many times; a termination
/// after the last attempt fails the remaining slots.
const MAX_DISPATCHES: u32 = 2;

/// Runtime knobs of a coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Scale factor forwarded to the typesetting script.
    pub scale: u32,
    /// Time a dispatched request may take before pending slots fail.
    pub request_timeout: Duration,
    /// Time the script environment may take to report ready after a load.
    pub ready_timeout: Duration,
    /// Rendered formulas kept in memory; zero disables the cache.
    pub cache_capacity: usize,
    /// Render formulas in display (block) mode.
    pub display_mode: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            scale: DEFAULT_RENDER_SCALE,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            ready_timeout: Duration::from_secs(DEFAULT_READY_TIMEOUT_SECS),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            display_mode: DEFAULT_DISPLAY_MODE,
        }
    }
}

impl From<&RenderSettings> for CoordinatorConfig {
    fn from(settings: &RenderSettings) -> Self {
        Self {
            scale: settings.scale.get(),
            request_timeout: settings.request_timeout,
            ready_timeout: settings.ready_timeout,
            cache_capacity: settings.cache_capacity,
            display_mode: settings.display_mode,
        }
    }
}

#[derive(Debug, Error)]
pub enum CoordinatorConfigError {
    #[error("shared render coordinator already configured")]
    AlreadyConfigured,
    #[error("shared render coordinator already in use")]
    AlreadyInitialized,
}

/// Pending ordered results of one request.
///
/// Resolves to exactly as many results as formulas were submitted. If the
/// coordinator goes away first, or the request is cancelled, every
/// unresolved slot resolves to [`FormulaError::Aborted`].
///
/// Dropping a ticket before it resolves cancels the request.
#[derive(Debug)]
pub struct RenderTicket {
    receiver: oneshot::Receiver<Vec<RenderResult>>,
    expected: usize,
    cancel: Option<CancelHandle>,
}

#[derive(Debug)]
struct CancelHandle {
    request_id: Uuid,
    commands: mpsc::WeakUnboundedSender<DriverCommand>,
}

impl RenderTicket {
    /// Number of results this ticket resolves to.
    pub fn len(&self) -> usize {
        self.expected
    }

    pub fn is_empty(&self) -> bool {
        self.expected == 0
    }

    /// Take the results if the request has already finished.
    pub fn try_take(&mut self) -> Option<Vec<RenderResult>> {
        let results = match self.receiver.try_recv() {
            Ok(results) => results,
            Err(oneshot::error::TryRecvError::Closed) => aborted(self.expected),
            Err(oneshot::error::TryRecvError::Empty) => return None,
        };
        self.cancel = None;
        Some(results)
    }

    /// Withdraw the request. A queued request never reaches the surface; an
    /// in-flight one releases the surface for the next request. The ticket
    /// still resolves, with `Aborted` for every slot that had no result yet.
    pub fn cancel(&mut self) {
        let Some(handle) = self.cancel.take() else {
            return;
        };
        if let Some(commands) = handle.commands.upgrade() {
            let _ = commands.send(DriverCommand::Cancel {
                request_id: handle.request_id,
            });
        }
    }
}

impl Future for RenderTicket {
    type Output = Vec<RenderResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let expected = self.expected;
        let polled = Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| aborted(expected)));
        if polled.is_ready() {
            self.cancel = None;
        }
        polled
    }
}

impl Drop for RenderTicket {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn aborted(expected: usize) -> Vec<RenderResult> {
    vec![RenderResult::Failed(FormulaError::Aborted); expected]
}

fn into_images(results: Vec<RenderResult>) -> Vec<FormulaImage> {
    results
        .into_iter()
        .map(RenderResult::into_image_or_placeholder)
        .collect()
}

/// Batch renderer in front of one shared rendering surface.
pub struct RenderCoordinator {
    surfaces: Arc<SurfaceManager>,
    config: CoordinatorConfig,
    cache: Arc<FormulaCache>,
    driver: Mutex<Option<mpsc::UnboundedSender<DriverCommand>>>,
}

impl RenderCoordinator {
    pub fn new(surfaces: SurfaceManager, config: CoordinatorConfig) -> Self {
        let cache = Arc::new(FormulaCache::new(config.cache_capacity));
        Self {
            surfaces: Arc::new(surfaces),
            config,
            cache,
            driver: Mutex::new(None),
        }
    }

    /// Coordinator backed by the in-process KaTeX surface.
    pub fn with_katex(config: CoordinatorConfig) -> Self {
        let display_mode = config.display_mode;
        let surfaces = SurfaceManager::new(ScriptBundle::embedded(), move || {
            KatexSurface::shared(display_mode)
        });
        Self::new(surfaces, config)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn surfaces(&self) -> &SurfaceManager {
        &self.surfaces
    }

    /// The shared surface, created on first call.
    pub fn get_surface(&self) -> Arc<dyn RenderSurface> {
        self.surfaces.get_surface()
    }

    pub fn cached_formulas(&self) -> usize {
        self.cache.len()
    }

    /// Drop every cached render, e.g. under memory pressure.
    pub fn clear_cache(&self) {
        let dropped = self.cache.len();
        self.cache.clear();
        info!(
            target = SOURCE,
            op = "coordinator::clear_cache",
            dropped,
            "Formula cache cleared"
        );
    }

    /// Submit formulas and get a future of their ordered results.
    ///
    /// Must be called from within a tokio runtime for non-empty input;
    /// otherwise every slot resolves to [`FormulaError::Aborted`].
    pub fn render(&self, formulas: Vec<String>) -> RenderTicket {
        let expected = formulas.len();
        let (tx, rx) = oneshot::channel();
        let mut ticket = RenderTicket {
            receiver: rx,
            expected,
            cancel: None,
        };

        if formulas.is_empty() {
            let _ = tx.send(Vec::new());
            return ticket;
        }

        let batch = RenderBatch::new(formulas, tx);
        let request_id = batch.request_id();
        match self.driver_sender() {
            Some(sender) => {
                let commands = sender.downgrade();
                match sender.send(DriverCommand::Submit(batch)) {
                    Ok(()) => {
                        ticket.cancel = Some(CancelHandle {
                            request_id,
                            commands,
                        });
                    }
                    Err(_) => warn!(
                        target = SOURCE,
                        op = "coordinator::render",
                        request_id = %request_id,
                        result = "driver_stopped",
                        "Render driver stopped before accepting the request"
                    ),
                }
            }
            None => {
                error!(
                    target = SOURCE,
                    op = "coordinator::render",
                    result = "no_runtime",
                    formulas = expected,
                    "Render requested outside a tokio runtime; completing with placeholders"
                );
            }
        }

        ticket
    }

    /// Callback flavour of [`render`](Self::render). `completion` runs exactly
    /// once with one image per formula; failed slots carry
    /// [`FormulaImage::placeholder`].
    pub fn render_formulas<F>(&self, formulas: Vec<String>, completion: F)
    where
        F: FnOnce(Vec<FormulaImage>) + Send + 'static,
    {
        let mut ticket = self.render(formulas);
        if let Some(results) = ticket.try_take() {
            completion(into_images(results));
            return;
        }

        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let results = ticket.await;
                    completion(into_images(results));
                });
            }
            Err(_) => completion(into_images(aborted(ticket.len()))),
        }
    }

    fn driver_sender(&self) -> Option<mpsc::UnboundedSender<DriverCommand>> {
        let mut driver = mutex_lock(&self.driver, SOURCE, "driver_sender");
        if let Some(sender) = driver.as_ref().filter(|sender| !sender.is_closed()) {
            return Some(sender.clone());
        }

        let handle = Handle::try_current().ok()?;
        if driver.is_some() {
            warn!(
                target = SOURCE,
                op = "coordinator::driver",
                result = "restarted",
                "Render driver stopped; starting a new one"
            );
        }

        let (tx, submissions) = mpsc::unbounded_channel();
        let (sink, messages) = MessageSink::channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let task = Driver {
            surfaces: Arc::clone(&self.surfaces),
            config: self.config.clone(),
            cache: Arc::clone(&self.cache),
            sink,
            events_tx,
            state: SurfaceState::Cold,
            generation: 0,
            ready_timer: None,
            queue: VecDeque::new(),
            active: None,
        };
        handle.spawn(task.run(submissions, messages, events));

        *driver = Some(tx.clone());
        Some(tx)
    }
}

static SHARED_CONFIG: OnceCell<CoordinatorConfig> = OnceCell::new();

static SHARED_MANAGER: Lazy<Arc<RenderCoordinator>> = Lazy::new(|| {
    let config = SHARED_CONFIG.get().cloned().unwrap_or_default();
    Arc::new(RenderCoordinator::with_katex(config))
});

/// Set the configuration of the process-wide coordinator. Only effective
/// before the first call to [`shared_manager`].
pub fn configure_shared_manager(config: CoordinatorConfig) -> Result<(), CoordinatorConfigError> {
    if Lazy::get(&SHARED_MANAGER).is_some() {
        return Err(CoordinatorConfigError::AlreadyInitialized);
    }
    SHARED_CONFIG
        .set(config)
        .map_err(|_| CoordinatorConfigError::AlreadyConfigured)
}

/// Process-wide coordinator backed by the in-process KaTeX surface.
///
/// Its driver runs on the runtime of the first caller that submits work.
pub fn shared_manager() -> Arc<RenderCoordinator> {
    Arc::clone(&SHARED_MANAGER)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SurfaceState {
    Cold,
    Loading,
    Ready,
}

#[derive(Debug)]
enum DriverCommand {
    Submit(RenderBatch),
    Cancel { request_id: Uuid },
}

#[derive(Debug)]
enum DriverEvent {
    LoadFinished {
        generation: u64,
        result: Result<(), SurfaceError>,
    },
    ReadyTimedOut {
        generation: u64,
    },
    DispatchFailed {
        batch_id: Uuid,
        error: SurfaceError,
    },
    RequestTimedOut {
        batch_id: Uuid,
    },
}

struct ActiveBatch {
    batch: RenderBatch,
    first_dispatch: Instant,
    timer: JoinHandle<()>,
}

struct Driver {
    surfaces: Arc<SurfaceManager>,
    config: CoordinatorConfig,
    cache: Arc<FormulaCache>,
    sink: MessageSink,
    events_tx: mpsc::UnboundedSender<DriverEvent>,
    state: SurfaceState,
    generation: u64,
    ready_timer: Option<JoinHandle<()>>,
    queue: VecDeque<RenderBatch>,
    active: Option<ActiveBatch>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<DriverCommand>,
        mut messages: mpsc::UnboundedReceiver<PostedMessage>,
        mut events: mpsc::UnboundedReceiver<DriverEvent>,
    ) {
        let mut accepting = true;
        loop {
            if !accepting && self.is_idle() {
                break;
            }

            tokio::select! {
                command = commands.recv(), if accepting => match command {
                    Some(DriverCommand::Submit(batch)) => self.accept(batch),
                    Some(DriverCommand::Cancel { request_id }) => self.on_cancel(request_id),
                    None => accepting = false,
                },
                Some(message) = messages.recv() => self.on_message(message),
                Some(event) = events.recv() => self.on_event(event),
            }
        }

        self.cancel_ready_timer();
        debug!(
            target = SOURCE,
            op = "coordinator::driver",
            result = "stopped",
            "Render driver stopped"
        );
    }

    fn is_idle(&self) -> bool {
        self.active.is_none() && self.queue.is_empty()
    }

    fn accept(&mut self, mut batch: RenderBatch) {
        let scale = self.config.scale;
        let hits: Vec<(usize, FormulaImage)> = batch
            .jobs()
            .iter()
            .filter_map(|job| {
                self.cache
                    .get(job.formula(), scale)
                    .map(|image| (job.index(), image))
            })
            .collect();
        let cache_hits = hits.len();
        for (index, image) in hits {
            batch.resolve(index, RenderResult::Image(image));
        }

        info!(
            target = SOURCE,
            op = "coordinator::accept",
            batch_id = %batch.id(),
            formulas = batch.len(),
            cache_hits,
            queued = self.queue.len(),
            "Render request accepted"
        );

        if batch.is_complete() {
            self.finish(batch, "cached");
            return;
        }

        self.queue.push_back(batch);
        self.advance();
    }

    fn advance(&mut self) {
        if self.active.is_some() || self.queue.is_empty() {
            return;
        }

        match self.state {
            SurfaceState::Cold => self.prime(),
            SurfaceState::Loading => {}
            SurfaceState::Ready => {
                if let Some(batch) = self.queue.pop_front() {
                    self.dispatch(batch);
                }
            }
        }
    }

    fn prime(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        self.state = SurfaceState::Loading;

        let surface = self.surfaces.get_surface();
        let bundle = self.surfaces.bundle().clone();
        let sink = self.sink.for_generation(generation);
        let events = self.events_tx.clone();

        info!(
            target = SOURCE,
            op = "coordinator::prime",
            generation,
            host_page = %bundle.host_page,
            "Loading script environment"
        );

        tokio::spawn(async move {
            let result = surface.load(&bundle, sink).await;
            let _ = events.send(DriverEvent::LoadFinished { generation, result });
        });

        let events = self.events_tx.clone();
        let ready_timeout = self.config.ready_timeout;
        self.cancel_ready_timer();
        self.ready_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(ready_timeout).await;
            let _ = events.send(DriverEvent::ReadyTimedOut { generation });
        }));
    }

    fn cancel_ready_timer(&mut self) {
        if let Some(timer) = self.ready_timer.take() {
            timer.abort();
        }
    }

    fn surface_failed(&mut self, reason: String) {
        self.state = SurfaceState::Cold;
        self.cancel_ready_timer();

        error!(
            target = SOURCE,
            op = "coordinator::prime",
            result = "failed",
            generation = self.generation,
            queued = self.queue.len(),
            error = %reason,
            "Script environment unavailable; failing queued requests"
        );

        let error = FormulaError::surface_unavailable(reason);
        for mut batch in std::mem::take(&mut self.queue) {
            batch.fail_pending(&error);
            self.finish(batch, "surface_unavailable");
        }
    }

    fn dispatch(&mut self, mut batch: RenderBatch) {
        let batch_id = batch.id();
        let first_dispatch = batch.mark_dispatched();
        let call = ScriptCall {
            batch_id,
            formulas: batch.pending_formulas(),
            scale: self.config.scale,
        };

        info!(
            target = SOURCE,
            op = "coordinator::dispatch",
            batch_id = %batch_id,
            request_id = %batch.request_id(),
            formulas = call.formulas.len(),
            attempt = batch.dispatches(),
            waited_ms = batch.accepted_at().elapsed().as_millis() as u64,
            "Dispatching formula batch"
        );

        let surface = self.surfaces.get_surface();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            if let Err(error) = surface.evaluate(call).await {
                let _ = events.send(DriverEvent::DispatchFailed { batch_id, error });
            }
        });

        let events = self.events_tx.clone();
        let deadline =
            tokio::time::Instant::from_std(first_dispatch + self.config.request_timeout);
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = events.send(DriverEvent::RequestTimedOut { batch_id });
        });

        self.active = Some(ActiveBatch {
            batch,
            first_dispatch,
            timer,
        });
    }

    fn complete_active(&mut self, outcome: &'static str) {
        if let Some(active) = self.active.take() {
            active.timer.abort();
            self.finish(active.batch, outcome);
        }
        self.advance();
    }

    fn finish(&self, batch: RenderBatch, outcome: &'static str) {
        let batch_id = batch.id();
        let elapsed = batch.accepted_at().elapsed();
        let (results, completion) = batch.into_results();
        let rendered = results.iter().filter(|result| result.is_image()).count();
        let failed = results.len() - rendered;

        counter!(METRIC_FORMULAS_RENDERED).increment(rendered as u64);
        counter!(METRIC_FORMULAS_FAILED).increment(failed as u64);
        histogram!(METRIC_REQUEST_MS).record(elapsed.as_secs_f64() * 1000.0);

        info!(
            target = SOURCE,
            op = "coordinator::complete",
            batch_id = %batch_id,
            outcome,
            formulas = results.len(),
            rendered,
            failed,
            elapsed_ms = elapsed.as_millis() as u64,
            "Render request completed"
        );

        if completion.send(results).is_err() {
            debug!(
                target = SOURCE,
                op = "coordinator::complete",
                batch_id = %batch_id,
                result = "requester_gone",
                "Requester dropped before completion"
            );
        }
    }

    fn on_event(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::LoadFinished { generation, result } => {
                if generation != self.generation || self.state != SurfaceState::Loading {
                    debug!(
                        target = SOURCE,
                        op = "coordinator::prime",
                        generation,
                        result = "stale",
                        "Ignoring load outcome of an earlier generation"
                    );
                    return;
                }
                match result {
                    Ok(()) => debug!(
                        target = SOURCE,
                        op = "coordinator::prime",
                        generation,
                        result = "loaded",
                        "Script environment loaded; awaiting ready message"
                    ),
                    Err(error) => self.surface_failed(error.to_string()),
                }
            }
            DriverEvent::ReadyTimedOut { generation } => {
                if generation == self.generation && self.state == SurfaceState::Loading {
                    let reason = format!(
                        "script environment not ready after {} ms",
                        self.config.ready_timeout.as_millis()
                    );
                    self.surface_failed(reason);
                }
            }
            DriverEvent::DispatchFailed { batch_id, error } => {
                let Some(active) = self.active_for(batch_id) else {
                    return;
                };
                warn!(
                    target = SOURCE,
                    op = "coordinator::dispatch",
                    batch_id = %batch_id,
                    result = "error",
                    error = %error,
                    "Surface rejected formula batch"
                );
                active.batch.fail_pending(&FormulaError::dispatch(error.to_string()));
                self.complete_active("dispatch_failed");
            }
            DriverEvent::RequestTimedOut { batch_id } => {
                let Some(active) = self.active_for(batch_id) else {
                    return;
                };
                let elapsed_ms = active.first_dispatch.elapsed().as_millis() as u64;
                let pending = active
                    .batch
                    .fail_pending(&FormulaError::Timeout { elapsed_ms });
                counter!(METRIC_REQUESTS_TIMED_OUT).increment(1);
                warn!(
                    target = SOURCE,
                    op = "coordinator::timeout",
                    batch_id = %batch_id,
                    pending,
                    elapsed_ms,
                    "Render request timed out"
                );
                self.complete_active("timeout");
            }
        }
    }

    fn active_for(&mut self, batch_id: Uuid) -> Option<&mut ActiveBatch> {
        self.active
            .as_mut()
            .filter(|active| active.batch.id() == batch_id)
    }

    fn on_cancel(&mut self, request_id: Uuid) {
        if let Some(position) = self
            .queue
            .iter()
            .position(|batch| batch.request_id() == request_id)
        {
            if let Some(mut batch) = self.queue.remove(position) {
                info!(
                    target = SOURCE,
                    op = "coordinator::cancel",
                    request_id = %request_id,
                    state = "queued",
                    "Render request cancelled"
                );
                batch.fail_pending(&FormulaError::Aborted);
                self.finish(batch, "cancelled");
            }
            return;
        }

        let Some(active) = self
            .active
            .as_mut()
            .filter(|active| active.batch.request_id() == request_id)
        else {
            debug!(
                target = SOURCE,
                op = "coordinator::cancel",
                request_id = %request_id,
                result = "ignored",
                "Cancel for a request that is no longer pending"
            );
            return;
        };

        info!(
            target = SOURCE,
            op = "coordinator::cancel",
            request_id = %request_id,
            batch_id = %active.batch.id(),
            state = "in_flight",
            "Render request cancelled"
        );
        active.batch.fail_pending(&FormulaError::Aborted);
        self.complete_active("cancelled");
    }

    fn on_message(&mut self, posted: PostedMessage) {
        let PostedMessage {
            generation,
            message,
        } = posted;
        match channel::decode(&message) {
            Ok(InboundMessage::Ready) => self.on_ready(generation),
            Ok(InboundMessage::Terminated { reason }) => self.on_terminated(generation, reason),
            Ok(InboundMessage::Results(results)) => self.on_results(results),
            Err(error) => warn!(
                target = SOURCE,
                op = "channel::decode",
                handler = %message.handler,
                result = "discarded",
                error = %error,
                "Discarding malformed script message"
            ),
        }
    }

    fn on_ready(&mut self, generation: u64) {
        if generation != self.generation || self.state != SurfaceState::Loading {
            debug!(
                target = SOURCE,
                op = "coordinator::ready",
                generation,
                current = self.generation,
                result = "ignored",
                "Ready message from an abandoned load or while not loading"
            );
            return;
        }

        self.state = SurfaceState::Ready;
        self.cancel_ready_timer();
        info!(
            target = SOURCE,
            op = "coordinator::ready",
            generation = self.generation,
            queued = self.queue.len(),
            "Script environment ready"
        );
        self.advance();
    }

    fn on_terminated(&mut self, generation: u64, reason: Option<String>) {
        if generation != self.generation {
            debug!(
                target = SOURCE,
                op = "coordinator::terminated",
                generation,
                current = self.generation,
                result = "stale",
                "Ignoring termination of an abandoned load"
            );
            return;
        }

        warn!(
            target = SOURCE,
            op = "coordinator::terminated",
            reason = reason.as_deref().unwrap_or("unknown"),
            in_flight = self.active.is_some(),
            queued = self.queue.len(),
            "Script environment terminated; re-priming surface"
        );

        self.cancel_ready_timer();
        self.state = SurfaceState::Cold;
        if let Some(active) = self.active.take() {
            active.timer.abort();
            let mut batch = active.batch;
            if batch.dispatches() >= MAX_DISPATCHES {
                let reason = format!(
                    "script environment terminated on each of {} attempts",
                    batch.dispatches()
                );
                batch.fail_pending(&FormulaError::surface_unavailable(reason));
                self.finish(batch, "terminated");
            } else {
                batch.rekey();
                self.queue.push_front(batch);
            }
        }
        self.advance();
    }

    fn on_results(&mut self, results: BatchResults) {
        for rejected in &results.rejected {
            warn!(
                target = SOURCE,
                op = "channel::correlate",
                batch_id = %results.batch_id,
                result = "discarded",
                error = %rejected,
                "Ignoring uncorrelated result entry"
            );
        }

        let scale = self.config.scale;
        let Some(active) = self
            .active
            .as_mut()
            .filter(|active| active.batch.id() == results.batch_id)
        else {
            warn!(
                target = SOURCE,
                op = "channel::correlate",
                batch_id = %results.batch_id,
                result = "unknown_batch",
                "Ignoring results for a batch that is not in flight"
            );
            return;
        };

        for entry in results.entries {
            let result = match entry.outcome {
                Ok(image) => RenderResult::Image(image),
                Err(message) => RenderResult::Failed(FormulaError::typeset(message)),
            };
            let cacheable = result.image().cloned();

            let (slot, outcome) = match (entry.index, entry.latex.as_deref()) {
                (Some(index), latex) => {
                    let formula = active.batch.formula(index);
                    let mismatch = match (formula, latex) {
                        (Some(formula), Some(latex)) => formula != latex,
                        _ => false,
                    };
                    if mismatch {
                        warn!(
                            target = SOURCE,
                            op = "channel::correlate",
                            batch_id = %results.batch_id,
                            index,
                            result = "formula_mismatch",
                            "Ignoring result whose formula does not match its slot"
                        );
                        continue;
                    }
                    (Some(index), active.batch.resolve(index, result))
                }
                (None, Some(latex)) => active.batch.resolve_by_formula(latex, result),
                (None, None) => continue,
            };

            match outcome {
                ResolveOutcome::Resolved => {
                    let formula = slot.and_then(|index| active.batch.formula(index));
                    if let (Some(formula), Some(image)) = (formula, cacheable) {
                        self.cache.put(formula, scale, image);
                    }
                }
                ResolveOutcome::AlreadyResolved => debug!(
                    target = SOURCE,
                    op = "channel::correlate",
                    batch_id = %results.batch_id,
                    result = "duplicate",
                    "Ignoring result for an already resolved slot"
                ),
                ResolveOutcome::UnknownSlot => warn!(
                    target = SOURCE,
                    op = "channel::correlate",
                    batch_id = %results.batch_id,
                    index = ?entry.index,
                    result = "unknown_slot",
                    "Ignoring result for an unknown slot"
                ),
            }
        }

        let remaining = active.batch.pending_count();
        if remaining == 0 {
            self.complete_active("rendered");
        } else {
            debug!(
                target = SOURCE,
                op = "channel::correlate",
                batch_id = %results.batch_id,
                remaining,
                "Awaiting remaining formulas"
            );
        }
    }
}
