//! In-process surface running the KaTeX script library inside the embedded
//! duktape engine shipped by the `katex` crate.
//!
//! It speaks the same message protocol as a web surface: a ready message after
//! load, then one result message per evaluated batch carrying `data:` URLs.
//! Output is KaTeX HTML markup; the render scale does not apply to it.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use katex::{OptsBuilder, OutputType};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::util::lock::mutex_lock;

use super::channel::encode_data_url;
use super::surface::{
    MessageSink, RESULT_HANDLER, RenderSurface, ScriptBundle, ScriptCall, ScriptMessage,
};
use super::types::{MediaType, SurfaceError};

const SOURCE: &str = "application::render::katex";
const WARM_UP_FORMULA: &str = "x";

/// Render a KaTeX expression to HTML, returning an inline (`<span>`) or block fragment.
pub(crate) fn render_math_html(literal: &str, display_mode: bool) -> Result<String, String> {
    let mut builder = OptsBuilder::default();
    builder.display_mode(display_mode);
    builder.output_type(OutputType::Html);
    builder.throw_on_error(true);

    let opts = builder
        .build()
        .map_err(|err| format!("failed to build KaTeX options: {err}"))?;

    katex::render_with_opts(literal, opts).map_err(|err| format!("KaTeX rendering failed: {err}"))
}

#[derive(Debug)]
pub struct KatexSurface {
    display_mode: bool,
    sink: Mutex<Option<MessageSink>>,
}

impl KatexSurface {
    pub fn new(display_mode: bool) -> Self {
        Self {
            display_mode,
            sink: Mutex::new(None),
        }
    }

    pub fn shared(display_mode: bool) -> Arc<dyn RenderSurface> {
        Arc::new(Self::new(display_mode))
    }

    fn current_sink(&self) -> Option<MessageSink> {
        mutex_lock(&self.sink, SOURCE, "current_sink").clone()
    }
}

#[async_trait]
impl RenderSurface for KatexSurface {
    async fn load(&self, bundle: &ScriptBundle, sink: MessageSink) -> Result<(), SurfaceError> {
        if let Some(path) = bundle.host_page_path() {
            return Err(SurfaceError::load(format!(
                "in-process KaTeX surface cannot load external bundle `{}`",
                path.display()
            )));
        }

        let started_at = Instant::now();
        let display_mode = self.display_mode;
        tokio::task::spawn_blocking(move || render_math_html(WARM_UP_FORMULA, display_mode))
            .await
            .map_err(|err| SurfaceError::load(format!("KaTeX warm-up task failed: {err}")))?
            .map_err(SurfaceError::load)?;

        *mutex_lock(&self.sink, SOURCE, "load") = Some(sink.clone());
        info!(
            target = SOURCE,
            op = "katex::load",
            result = "ready",
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "KaTeX script environment loaded"
        );
        sink.post(ScriptMessage::ready());
        Ok(())
    }

    async fn evaluate(&self, call: ScriptCall) -> Result<(), SurfaceError> {
        let sink = self.current_sink().ok_or(SurfaceError::NotReady)?;
        let display_mode = self.display_mode;

        debug!(
            target = SOURCE,
            op = "katex::evaluate",
            batch_id = %call.batch_id,
            formulas = call.formulas.len(),
            "Evaluating formula batch"
        );

        tokio::task::spawn_blocking(move || {
            let results: Vec<Value> = call
                .formulas
                .iter()
                .map(|formula| match render_math_html(&formula.latex, display_mode) {
                    Ok(html) => json!({
                        "index": formula.index,
                        "latex": formula.latex,
                        "base64": encode_data_url(&MediaType::Html, html.as_bytes()),
                    }),
                    Err(error) => json!({
                        "index": formula.index,
                        "latex": formula.latex,
                        "error": error,
                    }),
                })
                .collect();

            let message = ScriptMessage::new(
                RESULT_HANDLER,
                json!({ "batchId": call.batch_id.to_string(), "results": results }),
            );
            if !sink.post(message) {
                warn!(
                    target = SOURCE,
                    op = "katex::evaluate",
                    batch_id = %call.batch_id,
                    result = "receiver_closed",
                    "Dropping batch results; coordinator is gone"
                );
            }
        });

        Ok(())
    }
}
