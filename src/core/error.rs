use thiserror::Error;

/// Failures surfaced by the movie pipeline and its generation backends.
#[derive(Debug, Error)]
pub enum GenerationError {
    /// The image endpoint answered with a non-success status. The payload is kept verbatim.
    #[error("image generation failed with status {status}: {payload}")]
    Upstream { status: u16, payload: String },

    #[error("step '{step}' failed: {source:#}")]
    StepResolution {
        step: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("invalid image request: {0}")]
    InvalidRequest(String),

    #[error("pipeline cancelled before step '{step}' completed")]
    Cancelled { step: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl GenerationError {
    pub fn step_resolution(step: &str, source: anyhow::Error) -> Self {
        Self::StepResolution {
            step: step.to_string(),
            source,
        }
    }

    /// Identifier of the step this error belongs to, if any.
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::StepResolution { step, .. } | Self::Cancelled { step } => Some(step),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_keeps_payload_verbatim() {
        let err = GenerationError::Upstream {
            status: 422,
            payload: r#"{"errors": ["bad prompt"]}"#.to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("422"));
        assert!(text.contains(r#"{"errors": ["bad prompt"]}"#));
    }

    #[test]
    fn test_step_resolution_names_step_and_cause() {
        let err = GenerationError::step_resolution("act2", anyhow::anyhow!("model unavailable"));
        assert_eq!(err.step(), Some("act2"));
        let text = err.to_string();
        assert!(text.contains("act2"));
        assert!(text.contains("model unavailable"));
    }

    #[test]
    fn test_io_variant_from() {
        let err: GenerationError = std::io::Error::other("disk full").into();
        assert_eq!(err.to_string(), "io error: disk full");
        assert_eq!(err.step(), None);
    }
}
