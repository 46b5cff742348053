//! Rendering surface collaborator and its lifecycle.
//!
//! A surface hosts a script environment running a typesetting library. The
//! coordinator only needs three things from it: load the environment from a
//! bundle, evaluate a batch call, and post messages back. Everything the
//! script environment says arrives through the [`MessageSink`] handed over at
//! load time.

use std::{fmt, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use super::types::SurfaceError;

/// Handler name carrying per-batch typesetting results.
pub const RESULT_HANDLER: &str = "katexHandler";
/// Handler name the script environment posts once it is ready for work.
pub const READY_HANDLER: &str = "katexReadyHandler";
/// Handler name a surface posts when its script process died.
pub const TERMINATED_HANDLER: &str = "surfaceTerminated";
/// Script entry point invoked for every batch.
pub const BATCH_FUNCTION: &str = "renderFormulasBatch";

const DEFAULT_HOST_PAGE: &str = "mathsnap.html";

/// Message posted by the script environment.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptMessage {
    pub handler: String,
    pub body: Value,
}

impl ScriptMessage {
    pub fn new(handler: impl Into<String>, body: Value) -> Self {
        Self {
            handler: handler.into(),
            body,
        }
    }

    pub fn ready() -> Self {
        Self::new(READY_HANDLER, Value::Null)
    }

    pub fn terminated(reason: impl Into<String>) -> Self {
        Self::new(
            TERMINATED_HANDLER,
            serde_json::json!({ "reason": reason.into() }),
        )
    }
}

/// Message as received by the coordinator, tagged with the load generation
/// of the sink it was posted through.
#[derive(Debug, Clone, PartialEq)]
pub struct PostedMessage {
    pub generation: u64,
    pub message: ScriptMessage,
}

/// Receiving end registered with a surface for its outbound messages.
///
/// Every load gets its own sink generation, so messages from an abandoned
/// load can be told apart from those of the current one.
#[derive(Debug, Clone)]
pub struct MessageSink {
    tx: mpsc::UnboundedSender<PostedMessage>,
    generation: u64,
}

impl MessageSink {
    /// Create a generation-0 sink together with the receiver the coordinator
    /// drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PostedMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, generation: 0 }, rx)
    }

    /// Sink feeding the same receiver under another generation.
    pub fn for_generation(&self, generation: u64) -> Self {
        Self {
            tx: self.tx.clone(),
            generation,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Post a message; returns `false` once the receiving side is gone.
    pub fn post(&self, message: ScriptMessage) -> bool {
        self.tx
            .send(PostedMessage {
                generation: self.generation,
                message,
            })
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Host page and typesetting library the surface loads before any work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptBundle {
    pub host_page: String,
    pub base_dir: Option<PathBuf>,
}

impl ScriptBundle {
    /// Bundle compiled into the surface itself.
    pub fn embedded() -> Self {
        Self {
            host_page: DEFAULT_HOST_PAGE.to_string(),
            base_dir: None,
        }
    }

    /// Bundle served from a directory on disk.
    pub fn from_dir(base_dir: impl Into<PathBuf>, host_page: impl Into<String>) -> Self {
        Self {
            host_page: host_page.into(),
            base_dir: Some(base_dir.into()),
        }
    }

    /// Absolute location of the host page, when it lives on disk.
    pub fn host_page_path(&self) -> Option<PathBuf> {
        self.base_dir.as_ref().map(|dir| dir.join(&self.host_page))
    }
}

impl Default for ScriptBundle {
    fn default() -> Self {
        Self::embedded()
    }
}

/// Formula paired with its slot in the originating request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexedFormula {
    pub index: usize,
    pub latex: String,
}

/// One batched invocation of the typesetting script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptCall {
    pub batch_id: Uuid,
    pub formulas: Vec<IndexedFormula>,
    pub scale: u32,
}

impl ScriptCall {
    /// Script source invoking [`BATCH_FUNCTION`] for web-based surfaces.
    ///
    /// Arguments are encoded as JSON literals, which are valid script
    /// literals, so formula text never needs manual escaping.
    pub fn to_script(&self) -> Result<String, serde_json::Error> {
        let batch_id = serde_json::to_string(&self.batch_id.to_string())?;
        let formulas = serde_json::to_string(&self.formulas)?;
        Ok(format!(
            "{BATCH_FUNCTION}({batch_id}, {formulas}, {})",
            self.scale
        ))
    }
}

/// Script-capable rendering surface.
///
/// `evaluate` returns once the call has been accepted; results are posted
/// later through the sink registered by `load`.
#[async_trait]
pub trait RenderSurface: Send + Sync {
    async fn load(&self, bundle: &ScriptBundle, sink: MessageSink) -> Result<(), SurfaceError>;

    async fn evaluate(&self, call: ScriptCall) -> Result<(), SurfaceError>;
}

type SurfaceFactory = Box<dyn Fn() -> Arc<dyn RenderSurface> + Send + Sync>;

/// Owns the single shared surface instance.
///
/// The surface is built on first access and kept for the lifetime of the
/// manager; concurrent first calls still produce exactly one instance.
pub struct SurfaceManager {
    bundle: ScriptBundle,
    factory: SurfaceFactory,
    surface: OnceCell<Arc<dyn RenderSurface>>,
}

impl SurfaceManager {
    pub fn new<F>(bundle: ScriptBundle, factory: F) -> Self
    where
        F: Fn() -> Arc<dyn RenderSurface> + Send + Sync + 'static,
    {
        Self {
            bundle,
            factory: Box::new(factory),
            surface: OnceCell::new(),
        }
    }

    /// Manager around an already constructed surface.
    pub fn with_surface(bundle: ScriptBundle, surface: Arc<dyn RenderSurface>) -> Self {
        Self::new(bundle, move || Arc::clone(&surface))
    }

    /// Shared surface, created on first call.
    pub fn get_surface(&self) -> Arc<dyn RenderSurface> {
        let surface = self.surface.get_or_init(|| {
            info!(
                target = "application::render::surface",
                op = "surface::create",
                host_page = %self.bundle.host_page,
                "Creating shared rendering surface"
            );
            (self.factory)()
        });
        Arc::clone(surface)
    }

    pub fn is_created(&self) -> bool {
        self.surface.get().is_some()
    }

    pub fn bundle(&self) -> &ScriptBundle {
        &self.bundle
    }
}

impl fmt::Debug for SurfaceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SurfaceManager")
            .field("bundle", &self.bundle)
            .field("created", &self.is_created())
            .finish()
    }
}
