//! Typed failures raised by the interpolation pipeline.
//!
//! Stage workers wrap these in `anyhow::Error` with extra context, so callers
//! recover the category with `error.downcast_ref::<PipelineError>()`.

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("failed to read source frame {index}")]
    SourceRead {
        index: u64,
        #[source]
        source: BoxError,
    },
    #[error("cannot align {width}x{height} frame: {reason}")]
    Alignment {
        width: u32,
        height: u32,
        reason: String,
    },
    #[error("flow model failed on pair {pair}")]
    Inference {
        pair: u64,
        #[source]
        source: BoxError,
    },
    #[error("failed to write output frame {index}")]
    SinkWrite {
        index: u64,
        #[source]
        source: BoxError,
    },
    #[error("exponent {0} is outside the supported range 1..=6")]
    InvalidExponent(u32),
}

impl PipelineError {
    pub fn source_read(index: u64, error: anyhow::Error) -> Self {
        Self::SourceRead {
            index,
            source: error.into(),
        }
    }

    pub fn inference(pair: u64, error: anyhow::Error) -> Self {
        Self::Inference {
            pair,
            source: error.into(),
        }
    }

    pub fn sink_write(index: u64, error: anyhow::Error) -> Self {
        Self::SinkWrite {
            index,
            source: error.into(),
        }
    }

    pub fn alignment(width: u32, height: u32, reason: impl Into<String>) -> Self {
        Self::Alignment {
            width,
            height,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_source_chain_is_preserved() {
        let error = PipelineError::inference(3, anyhow::anyhow!("device lost"));
        assert_eq!(error.to_string(), "flow model failed on pair 3");
        let source = error.source().expect("inference error keeps its cause");
        assert!(source.to_string().contains("device lost"));
    }

    #[test]
    fn test_downcast_through_anyhow_context() {
        let error = anyhow::Error::new(PipelineError::alignment(0, 4, "zero-sized frame"))
            .context("scheduler stage failed");
        let typed = error
            .downcast_ref::<PipelineError>()
            .expect("typed error survives context");
        assert!(matches!(typed, PipelineError::Alignment { width: 0, .. }));
    }
}
