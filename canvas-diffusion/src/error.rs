//! Error type shared by every stage of the render pipeline.

use crate::models::residency::{ComponentKind, Residency};

/// Errors produced while parsing canvases, compiling conditioning, moving
/// models between devices or running the diffusion stages.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The LLM response holds no usable canvas. Recoverable: the caller
    /// should disable rendering for that turn.
    #[error("malformed canvas: {0}")]
    MalformedCanvas(String),

    #[error("step count must be at least 1, got {0}")]
    InvalidStepCount(usize),

    /// A render parameter was rejected before any device work began.
    #[error("invalid render parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    /// The loaded pipeline is not the regional pipeline the orchestrator drives.
    #[error("loaded pipeline is `{found}`, expected `{expected}`")]
    PipelineType { expected: &'static str, found: String },

    /// A stage tried to use a component that was not placed on the accelerator.
    #[error("{component} is required on the accelerator but is {found}")]
    ResidencyViolation {
        component: ComponentKind,
        found: Residency,
    },

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no diffusion pipeline is loaded")]
    NoPipeline,

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// The chat worker thread panicked or its model lock was poisoned.
    #[error("chat worker failed: {0}")]
    Worker(String),

    /// Any compute failure inside a stage, out-of-memory included.
    #[error("stage `{stage}` failed: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: Box<Error>,
    },

    #[error(transparent)]
    Candle(#[from] candle::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

impl Error {
    pub fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }

    /// Wraps a failure with the name of the stage it happened in.
    pub fn in_stage(self, stage: &'static str) -> Self {
        match self {
            // Contract failures keep their own identity.
            e @ (Self::ResidencyViolation { .. } | Self::Stage { .. } | Self::PipelineType { .. }) => e,
            e => Self::Stage {
                stage,
                source: Box::new(e),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Attaches a stage name to the error of a fallible stage call.
pub(crate) trait StageContext<T> {
    fn stage(self, stage: &'static str) -> Result<T>;
}

impl<T, E: Into<Error>> StageContext<T> for std::result::Result<T, E> {
    fn stage(self, stage: &'static str) -> Result<T> {
        self.map_err(|e| e.into().in_stage(stage))
    }
}
