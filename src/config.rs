//! Ambient runtime knobs shared by more than one stage (spec section 2's
//! "supporting utilities"): buffer sizing and worker-pool width. Each
//! stage's own runtime-specific knobs (capture's frame rate, crop, async
//! transfer) live next to that stage instead — see `capture::CaptureConfig`.

use crate::error::{PipelineError, Result};

/// Shared pipeline sizing: how large each packet buffer is, and how many
/// worker threads the scale stage runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    pub buffer_capacity: usize,
    pub scale_threads: usize,
}

impl PipelineConfig {
    pub fn new(buffer_capacity: usize, scale_threads: usize) -> Result<Self> {
        if buffer_capacity == 0 {
            return Err(PipelineError::InvalidArgument(
                "buffer_capacity must be > 0".into(),
            ));
        }
        if scale_threads == 0 {
            return Err(PipelineError::InvalidArgument(
                "scale_threads must be > 0".into(),
            ));
        }
        Ok(Self { buffer_capacity, scale_threads })
    }
}

impl Default for PipelineConfig {
    /// One scale worker per available core, a generous default buffer —
    /// matches the teacher's own `std::thread::available_parallelism`
    /// fallback pattern.
    fn default() -> Self {
        Self {
            buffer_capacity: 16 * 1024 * 1024,
            scale_threads: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_capacity() {
        assert!(matches!(
            PipelineConfig::new(0, 1),
            Err(PipelineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn default_has_at_least_one_thread() {
        assert!(PipelineConfig::default().scale_threads >= 1);
    }
}
