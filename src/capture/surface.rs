//! External collaborator interfaces for the frame capture stage (spec
//! section 6): a rendering-surface provider and an optional asynchronous
//! device-to-host transfer object. Both are out of scope per spec section
//! 1 (the GL/X11 hook lives outside this crate); only their interfaces
//! with the core are specified here.

use crate::error::Result;
use crate::message::VideoFormat;

/// Which framebuffer a capture reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    Front,
    Back,
}

/// Provides pixel, geometry, and gamma data for one rendering surface.
/// Implemented by the GL/X11 hook in a separate crate; tests provide a
/// fake.
pub trait Surface: Send + Sync {
    /// Reads `w x h` pixels at `(x, y)` from `source` into `dst`, encoded
    /// as `format`. `dst` is exactly `w * h * format.bytes_per_pixel()`
    /// bytes, already sized by the caller.
    fn read_pixels(
        &self,
        source: ReadSource,
        x: i32,
        y: i32,
        w: u32,
        h: u32,
        format: VideoFormat,
        dst: &mut [u8],
    ) -> Result<()>;

    /// Current size of `window`.
    fn geometry(&self, window: u64) -> Result<(u32, u32)>;

    /// Current gamma ramp midpoint for `(display, screen)`, as `(r, g, b)`.
    fn gamma(&self, display: u64, screen: i32) -> Result<(f32, f32, f32)>;

    /// Issues the "capture is active" indicator draw call. A no-op
    /// default: most surfaces never enable `draw_indicator`.
    fn draw_indicator(&self, _display: u64) -> Result<()> {
        Ok(())
    }
}

/// Device-to-host asynchronous transfer: begins a copy of framebuffer
/// contents into a staging region, to be mapped and read back on a later
/// call, hiding transfer latency across frame boundaries.
pub trait AsyncTransfer: Send + Sync {
    fn begin(
        &self,
        source: ReadSource,
        x: i32,
        y: i32,
        w: u32,
        h: u32,
        format: VideoFormat,
    ) -> Result<()>;

    /// Maps the most recently begun transfer's staging region for
    /// reading. Must be called only after `begin` and before `unmap`.
    fn map(&self) -> Result<&[u8]>;

    fn unmap(&self);
}
