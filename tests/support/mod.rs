#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mathsnap::application::render::{
    CoordinatorConfig, MediaType, MessageSink, RESULT_HANDLER, RenderCoordinator, RenderSurface,
    ScriptBundle, ScriptCall, ScriptMessage, SurfaceError, SurfaceManager, encode_data_url,
};
use serde_json::{Value, json};

/// How the fake script environment answers a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// One message carrying every result.
    Batch,
    /// One message per formula, last formula first.
    Reversed,
    /// One message carrying results identified by formula text only.
    ByFormula,
    /// Accept the call and never answer.
    Silent,
    /// Reject the evaluate call.
    Reject,
}

/// When a load announces readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ready {
    Immediate,
    After(Duration),
    Never,
}

#[derive(Debug, Default)]
struct Terminations {
    on_calls: HashSet<usize>,
    every_call: bool,
    delay: Duration,
}

pub struct ScriptedSurface {
    mode: Mode,
    delay: Duration,
    default_ready: Ready,
    ready_plan: Mutex<VecDeque<Ready>>,
    failing_loads: Mutex<HashSet<usize>>,
    terminations: Mutex<Terminations>,
    loads: AtomicUsize,
    calls: Mutex<Vec<ScriptCall>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    sink: Mutex<Option<MessageSink>>,
}

impl ScriptedSurface {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            delay: Duration::ZERO,
            default_ready: Ready::Immediate,
            ready_plan: Mutex::new(VecDeque::new()),
            failing_loads: Mutex::new(HashSet::new()),
            terminations: Mutex::new(Terminations::default()),
            loads: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
            sink: Mutex::new(None),
        }
    }

    pub fn failing_first_loads(self, count: usize) -> Self {
        self.failing_loads.lock().expect("loads lock").extend(1..=count);
        self
    }

    /// Fail the `number`-th load (1-based).
    pub fn failing_load(self, number: usize) -> Self {
        self.failing_loads.lock().expect("loads lock").insert(number);
        self
    }

    pub fn without_ready(mut self) -> Self {
        self.default_ready = Ready::Never;
        self
    }

    /// Readiness of successive loads; loads past the plan use the default.
    pub fn ready_plan(self, plan: impl IntoIterator<Item = Ready>) -> Self {
        self.ready_plan.lock().expect("plan lock").extend(plan);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn terminating_once(self) -> Self {
        self.terminating_on_call(1)
    }

    /// Post a termination instead of results for the `number`-th evaluate.
    pub fn terminating_on_call(self, number: usize) -> Self {
        self.terminations
            .lock()
            .expect("terminations lock")
            .on_calls
            .insert(number);
        self
    }

    /// Post a termination `after` every evaluate.
    pub fn terminating_every_call(self, after: Duration) -> Self {
        {
            let mut terminations = self.terminations.lock().expect("terminations lock");
            terminations.every_call = true;
            terminations.delay = after;
        }
        self
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<ScriptCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// Highest number of answered evaluations outstanding at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Inject a message as if the script environment posted it.
    pub fn post(&self, message: ScriptMessage) -> bool {
        let sink = self.sink.lock().expect("sink lock").clone();
        sink.map(|sink| sink.post(message)).unwrap_or(false)
    }

    fn termination_for(&self, call_number: usize) -> Option<Duration> {
        let terminations = self.terminations.lock().expect("terminations lock");
        (terminations.every_call || terminations.on_calls.contains(&call_number))
            .then_some(terminations.delay)
    }
}

/// Typeset outcome of the fake engine: `!!!` prefixed formulas are invalid.
pub fn result_entry(index: Option<usize>, latex: &str) -> Value {
    let mut entry = if latex.starts_with("!!!") {
        json!({ "latex": latex, "error": "ParseError: unexpected character '!'" })
    } else {
        json!({ "latex": latex, "base64": encode_data_url(&MediaType::Png, fake_png(latex).as_slice()) })
    };
    if let Some(index) = index {
        entry["index"] = json!(index);
    }
    entry
}

pub fn fake_png(latex: &str) -> Vec<u8> {
    format!("png:{latex}").into_bytes()
}

pub fn results_message(batch_id: impl ToString, results: Vec<Value>) -> ScriptMessage {
    ScriptMessage::new(
        RESULT_HANDLER,
        json!({ "batchId": batch_id.to_string(), "results": results }),
    )
}

fn replies(mode: Mode, call: &ScriptCall) -> Vec<Vec<Value>> {
    match mode {
        Mode::Batch => vec![
            call.formulas
                .iter()
                .map(|f| result_entry(Some(f.index), &f.latex))
                .collect(),
        ],
        Mode::Reversed => call
            .formulas
            .iter()
            .rev()
            .map(|f| vec![result_entry(Some(f.index), &f.latex)])
            .collect(),
        Mode::ByFormula => vec![
            call.formulas
                .iter()
                .map(|f| result_entry(None, &f.latex))
                .collect(),
        ],
        Mode::Silent | Mode::Reject => Vec::new(),
    }
}

#[async_trait]
impl RenderSurface for ScriptedSurface {
    async fn load(&self, _bundle: &ScriptBundle, sink: MessageSink) -> Result<(), SurfaceError> {
        let number = self.loads.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing_loads.lock().expect("loads lock").contains(&number) {
            return Err(SurfaceError::load("bundle resource unavailable"));
        }

        *self.sink.lock().expect("sink lock") = Some(sink.clone());
        let ready = self
            .ready_plan
            .lock()
            .expect("plan lock")
            .pop_front()
            .unwrap_or(self.default_ready);
        match ready {
            Ready::Immediate => {
                sink.post(ScriptMessage::ready());
            }
            Ready::After(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    sink.post(ScriptMessage::ready());
                });
            }
            Ready::Never => {}
        }
        Ok(())
    }

    async fn evaluate(&self, call: ScriptCall) -> Result<(), SurfaceError> {
        let call_number = {
            let mut calls = self.calls.lock().expect("calls lock");
            calls.push(call.clone());
            calls.len()
        };

        if self.mode == Mode::Reject {
            return Err(SurfaceError::evaluate("script threw"));
        }

        let sink = self
            .sink
            .lock()
            .expect("sink lock")
            .clone()
            .ok_or(SurfaceError::NotReady)?;

        if let Some(delay) = self.termination_for(call_number) {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                sink.post(ScriptMessage::terminated("content process crashed"));
            });
            return Ok(());
        }

        let replies = replies(self.mode, &call);
        if replies.is_empty() {
            return Ok(());
        }

        let outstanding = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(outstanding, Ordering::SeqCst);
        let in_flight = Arc::clone(&self.in_flight);
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
            for results in replies {
                sink.post(results_message(call.batch_id, results));
            }
        });
        Ok(())
    }
}

pub fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig {
        scale: 2,
        request_timeout: Duration::from_secs(2),
        ready_timeout: Duration::from_secs(1),
        cache_capacity: 16,
        display_mode: true,
    }
}

pub fn coordinator(surface: &Arc<ScriptedSurface>, config: CoordinatorConfig) -> RenderCoordinator {
    let surface: Arc<dyn RenderSurface> = surface.clone();
    RenderCoordinator::new(
        SurfaceManager::with_surface(ScriptBundle::embedded(), surface),
        config,
    )
}

pub fn formulas(items: &[&str]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

/// Wait until the surface has received at least `count` evaluate calls.
pub async fn wait_for_calls(surface: &ScriptedSurface, count: usize) -> Vec<ScriptCall> {
    for _ in 0..300 {
        let calls = surface.calls();
        if calls.len() >= count {
            return calls;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("surface never received {count} evaluate calls");
}
