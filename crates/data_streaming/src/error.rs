//! src/error.rs
//!
//! Error taxonomy for the streaming pipeline.
//!
//! Three classes of failure flow through a pipeline:
//! - **Recoverable, per sample**: a transform, materializer, or shard read
//!   failed for one record. These are handed to the configured [`ErrorHandler`]
//!   which decides whether to drop the sample and continue (`Ok(())`) or to
//!   escalate (`Err`).
//! - **Fatal**: a contract violation such as a missing primary record in a
//!   joined position, or a transform that was declared stateless producing a
//!   different result on replay. Fatal errors bypass handlers entirely and
//!   abort the stream. They are modeled as [`FatalSampleError`] so they stay
//!   recognizable through `anyhow` context chains.
//! - **Construction-time**: invalid shard structures, mismatched exclusion
//!   sets, bad worker configurations. Reported immediately as plain `anyhow`
//!   errors from constructors; nothing is retried.

use anyhow::Result;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// A non-recoverable per-sample failure.
///
/// Unlike ordinary sample errors, a `FatalSampleError` is never offered to an
/// [`ErrorHandler`]: it indicates the pipeline itself (not the data) is in an
/// inconsistent state, so dropping the sample and continuing would hide a bug.
#[derive(Debug, Error)]
pub enum FatalSampleError {
    #[error("fatal failure for sample '{sample_id}': {message}")]
    Sample { sample_id: String, message: String },
    #[error("fatal stream failure: {message}")]
    Stream { message: String },
}

impl FatalSampleError {
    pub fn new(message: impl Into<String>) -> Self {
        FatalSampleError::Stream {
            message: message.into(),
        }
    }

    /// Same failure, tagged with the identity of the offending sample.
    pub fn for_sample(sample_id: impl Into<String>, message: impl Into<String>) -> Self {
        FatalSampleError::Sample {
            sample_id: sample_id.into(),
            message: message.into(),
        }
    }
}

/// Returns true if the error (or any cause in its chain) is a
/// [`FatalSampleError`].
///
/// Checked before handler dispatch so that fatal errors cannot be absorbed,
/// no matter how much context was layered on top of them.
pub fn is_fatal(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<FatalSampleError>().is_some())
}

/// Decides the fate of a recoverable per-sample error.
///
/// Receives the error and, when known, the identity of the offending sample.
/// Returning `Ok(())` drops the sample and lets iteration continue; returning
/// `Err` escalates and ends the stream.
pub type ErrorHandler = Arc<dyn Fn(anyhow::Error, Option<&str>) -> Result<()> + Send + Sync>;

/// The default handler: log the failure and keep going.
pub fn log_and_skip_handler() -> ErrorHandler {
    Arc::new(|err, sample_id| {
        let detail = format!("{err:#}");
        warn!(
            sample = sample_id.unwrap_or("<unknown>"),
            error = %detail,
            "dropping sample after error"
        );
        Ok(())
    })
}

/// A handler that escalates every error it sees.
pub fn reraise_handler() -> ErrorHandler {
    Arc::new(|err, _sample_id| Err(err))
}
