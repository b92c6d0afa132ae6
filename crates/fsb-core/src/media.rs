//! Media-processing port.
//!
//! The workspace delegates the actual transforms to an external tool behind
//! this trait; the primary implementation drives ffmpeg as a subprocess.

use std::path::Path;

use async_trait::async_trait;

use crate::{errors::Error, Result};

pub const MAX_CLIP_SECONDS: u32 = 60;
pub const MIN_CLIP_SECONDS: u32 = 1;
const MAX_WATERMARK_LEN: usize = 64;

/// One bounded media transform. A closed set on purpose: every call site can
/// be checked exhaustively.
#[derive(Clone, Debug, PartialEq)]
pub enum OperationSpec {
    Screenshot { at_second: u32 },
    RandomScreenshot,
    Clip { start_second: u32, duration_seconds: u32 },
    Watermark { text: String },
}

impl OperationSpec {
    pub fn name(&self) -> &'static str {
        match self {
            OperationSpec::Screenshot { .. } => "screenshot",
            OperationSpec::RandomScreenshot => "random screenshot",
            OperationSpec::Clip { .. } => "clip",
            OperationSpec::Watermark { .. } => "watermark",
        }
    }

    /// Parameter bounds check, performed before any subprocess work.
    pub fn validate(&self) -> Result<()> {
        match self {
            OperationSpec::Screenshot { .. } | OperationSpec::RandomScreenshot => Ok(()),
            OperationSpec::Clip {
                duration_seconds, ..
            } => {
                if *duration_seconds < MIN_CLIP_SECONDS || *duration_seconds > MAX_CLIP_SECONDS {
                    return Err(Error::InvalidOperation(format!(
                        "clip duration must be between {MIN_CLIP_SECONDS} and {MAX_CLIP_SECONDS} seconds, got {duration_seconds}"
                    )));
                }
                Ok(())
            }
            OperationSpec::Watermark { text } => {
                if text.trim().is_empty() {
                    return Err(Error::InvalidOperation(
                        "watermark text must not be empty".to_string(),
                    ));
                }
                if text.len() > MAX_WATERMARK_LEN {
                    return Err(Error::InvalidOperation(format!(
                        "watermark text is limited to {MAX_WATERMARK_LEN} characters"
                    )));
                }
                if text.contains('\n') {
                    return Err(Error::InvalidOperation(
                        "watermark text must be a single line".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// File extension of the produced artifact.
    pub fn output_extension(&self) -> &'static str {
        match self {
            OperationSpec::Screenshot { .. } | OperationSpec::RandomScreenshot => "jpg",
            OperationSpec::Clip { .. } | OperationSpec::Watermark { .. } => "mp4",
        }
    }
}

/// Hexagonal port for the external media tool.
#[async_trait]
pub trait MediaProcessor: Send + Sync {
    /// Source duration in seconds.
    async fn probe_duration(&self, input: &Path) -> Result<f64>;

    /// Run one transform, writing the artifact to `output`.
    ///
    /// Implementations report a non-zero tool exit as `Error::Processing` and
    /// a blown time budget as `Error::ProcessingTimeout`; in both cases any
    /// partial output must be discarded.
    async fn transform(&self, input: &Path, op: &OperationSpec, output: &Path) -> Result<()>;
}
