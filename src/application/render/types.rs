use bytes::Bytes;
use thiserror::Error;

/// Encoding of the bytes carried by a [`FormulaImage`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MediaType {
    Png,
    Svg,
    Html,
    Other(String),
}

impl MediaType {
    /// Map a MIME string (as found in a `data:` URL) to a media type.
    pub fn from_mime(mime: &str) -> Self {
        match mime.trim().to_ascii_lowercase().as_str() {
            "image/png" => MediaType::Png,
            "image/svg+xml" => MediaType::Svg,
            "text/html" => MediaType::Html,
            other => MediaType::Other(other.to_string()),
        }
    }

    pub fn as_mime(&self) -> &str {
        match self {
            MediaType::Png => "image/png",
            MediaType::Svg => "image/svg+xml",
            MediaType::Html => "text/html",
            MediaType::Other(mime) => mime.as_str(),
        }
    }

    /// File extension used when persisting images of this type.
    pub fn extension(&self) -> &'static str {
        match self {
            MediaType::Png => "png",
            MediaType::Svg => "svg",
            MediaType::Html => "html",
            MediaType::Other(_) => "bin",
        }
    }
}

/// Rendered output for a single formula. The payload is opaque to the
/// coordinator; only the surface that produced it knows how it was drawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormulaImage {
    data: Bytes,
    media_type: MediaType,
}

impl FormulaImage {
    pub fn new(data: impl Into<Bytes>, media_type: MediaType) -> Self {
        Self {
            data: data.into(),
            media_type,
        }
    }

    /// Blank image standing in for a formula that failed to render.
    pub fn placeholder() -> Self {
        Self {
            data: Bytes::new(),
            media_type: MediaType::Png,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn media_type(&self) -> &MediaType {
        &self.media_type
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Outcome for one slot of a render request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderResult {
    Image(FormulaImage),
    Failed(FormulaError),
}

impl RenderResult {
    pub fn is_image(&self) -> bool {
        matches!(self, RenderResult::Image(_))
    }

    pub fn image(&self) -> Option<&FormulaImage> {
        match self {
            RenderResult::Image(image) => Some(image),
            RenderResult::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&FormulaError> {
        match self {
            RenderResult::Image(_) => None,
            RenderResult::Failed(error) => Some(error),
        }
    }

    /// Collapse into an image, substituting the placeholder for failures.
    pub fn into_image_or_placeholder(self) -> FormulaImage {
        match self {
            RenderResult::Image(image) => image,
            RenderResult::Failed(_) => FormulaImage::placeholder(),
        }
    }
}

/// Reasons a single formula slot ends up without an image.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormulaError {
    #[error("formula could not be typeset: {message}")]
    Typeset { message: String },
    #[error("rendering surface unavailable: {message}")]
    SurfaceUnavailable { message: String },
    #[error("render request timed out after {elapsed_ms} ms")]
    Timeout { elapsed_ms: u64 },
    #[error("script dispatch failed: {message}")]
    Dispatch { message: String },
    #[error("render coordinator stopped before the request completed")]
    Aborted,
}

impl FormulaError {
    pub fn typeset(message: impl Into<String>) -> Self {
        Self::Typeset {
            message: message.into(),
        }
    }

    pub fn surface_unavailable(message: impl Into<String>) -> Self {
        Self::SurfaceUnavailable {
            message: message.into(),
        }
    }

    pub fn dispatch(message: impl Into<String>) -> Self {
        Self::Dispatch {
            message: message.into(),
        }
    }
}

/// Errors raised by a rendering surface collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SurfaceError {
    #[error("script environment failed to load: {message}")]
    Load { message: String },
    #[error("script evaluation failed: {message}")]
    Evaluate { message: String },
    #[error("script environment is not loaded")]
    NotReady,
}

impl SurfaceError {
    pub fn load(message: impl Into<String>) -> Self {
        Self::Load {
            message: message.into(),
        }
    }

    pub fn evaluate(message: impl Into<String>) -> Self {
        Self::Evaluate {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_type_round_trips_known_mimes() {
        assert_eq!(MediaType::from_mime("image/PNG"), MediaType::Png);
        assert_eq!(MediaType::from_mime("image/svg+xml"), MediaType::Svg);
        assert_eq!(MediaType::from_mime(" text/html "), MediaType::Html);
        assert_eq!(
            MediaType::from_mime("image/webp"),
            MediaType::Other("image/webp".to_string())
        );
        assert_eq!(MediaType::Other("image/webp".into()).extension(), "bin");
    }

    #[test]
    fn failures_collapse_to_placeholder() {
        let failed = RenderResult::Failed(FormulaError::typeset("bad"));
        assert!(failed.into_image_or_placeholder().is_placeholder());

        let image = FormulaImage::new(vec![1u8, 2, 3], MediaType::Png);
        let ok = RenderResult::Image(image.clone());
        assert_eq!(ok.into_image_or_placeholder(), image);
    }
}
