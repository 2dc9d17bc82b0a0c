use std::fmt::Display;

use crate::dataset::Stage;

/// Which axis of a matrix a filter exhausted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Axis {
    /// Cells (matrix columns)
    Cells,
    /// Genes (matrix rows)
    Genes,
}

impl Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Axis::Cells => f.write_str("cells"),
            Axis::Genes => f.write_str("genes"),
        }
    }
}

/// Typed failures raised by the pipeline. These travel inside `anyhow::Error` and can be
/// recovered with `err.downcast_ref::<PipelineError>()`.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// Malformed input table.
    Format {
        /// file or record the problem was found in
        context: String,
        /// what was wrong
        message: String,
    },
    /// A filtering step removed every cell or every gene.
    FilterExhaustion {
        /// the step that emptied the data
        stage: String,
        /// the exhausted axis
        axis: Axis,
    },
    /// A stage was invoked before one of its prerequisites.
    Ordering {
        /// the stage that must run first
        required: Stage,
        /// the stage that was attempted
        attempted: Stage,
    },
    /// The pathway-enrichment service call failed.
    RemoteService(String),
    /// A parameter was out of range or inconsistent.
    InvalidParameter(String),
}

impl PipelineError {
    pub fn format(context: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::Format {
            context: context.into(),
            message: message.into(),
        }
    }

    pub fn exhausted(stage: impl Into<String>, axis: Axis) -> Self {
        PipelineError::FilterExhaustion {
            stage: stage.into(),
            axis,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        PipelineError::InvalidParameter(message.into())
    }
}

impl std::error::Error for PipelineError {}

impl Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Format { context, message } => write!(f, "format error in {context}: {message}"),
            PipelineError::FilterExhaustion { stage, axis } => {
                write!(f, "{stage} removed all {axis}")
            }
            PipelineError::Ordering { required, attempted } => {
                write!(f, "{attempted} requires {required} to have run first")
            }
            PipelineError::RemoteService(msg) => write!(f, "remote service error: {msg}"),
            PipelineError::InvalidParameter(msg) => write!(f, "invalid parameter: {msg}"),
        }
    }
}
