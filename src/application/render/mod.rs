//! Batch formula rendering.
//!
//! Callers hand an ordered list of LaTeX formulas to a [`RenderCoordinator`]
//! and receive one result per formula, in order, exactly once. Typesetting is
//! delegated to a [`RenderSurface`] hosting a script environment; the
//! coordinator only schedules work on it and correlates what comes back.

mod channel;
mod coordinator;
mod jobs;
mod katex_surface;
mod surface;
mod types;

pub use channel::{
    BatchResults, ChannelError, InboundMessage, ResultEntry, decode as decode_message,
    decode_image, encode_data_url,
};
pub use coordinator::{
    CoordinatorConfig, CoordinatorConfigError, RenderCoordinator, RenderTicket,
    configure_shared_manager, shared_manager,
};
pub use jobs::{JobStatus, RenderJob};
pub use katex_surface::KatexSurface;
pub use surface::{
    BATCH_FUNCTION, IndexedFormula, MessageSink, PostedMessage, READY_HANDLER, RESULT_HANDLER,
    RenderSurface, ScriptBundle, ScriptCall, ScriptMessage, SurfaceManager, TERMINATED_HANDLER,
};
pub use types::{FormulaError, FormulaImage, MediaType, RenderResult, SurfaceError};
