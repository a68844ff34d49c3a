//! In-process capture/scale streaming pipeline for a screen-and-audio
//! recorder: the packet buffer, thread runner, state tracker, scale
//! stage, and frame capture stage that carry typed messages between
//! asynchronous producer and processing stages.
//!
//! The GL/X11 hook, the ALSA hook, CLI/config loading, the on-disk
//! container format, and external pipe/encoder front-ends all live
//! outside this crate; `capture::Surface` and `capture::AsyncTransfer`
//! are the seams a real hook plugs into.

pub mod buffer;
pub mod capture;
pub mod clock;
pub mod config;
pub mod error;
pub mod message;
pub mod rational;
pub mod runner;
pub mod scale;
pub mod tracker;

pub use buffer::{DmaFlags, PacketBuffer, ReadHandle, WriteHandle};
pub use capture::{AsyncTransfer, CaptureConfig, CaptureStage, CaptureStats, CropRect, ReadSource, Surface};
pub use clock::{FakeClock, MonotonicClock, SystemClock};
pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use rational::{FpsSchedule, Rational};
pub use runner::{ReadOutcome, Runner, Stage};
pub use scale::ScaleStage;
pub use tracker::{StateTracker, TrackedMessage};
