//! Frame capture stage (spec section 4.E): a time-gated sampler that
//! extracts frames from a rendering surface into the output buffer, with
//! optional asynchronous device-to-host transfer and double buffering.

mod surface;

pub use surface::{AsyncTransfer, ReadSource, Surface};

use std::collections::HashMap;
use std::hint;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as PlMutex;
use parking_lot::RwLock;

use crate::buffer::{DmaFlags, PacketBuffer};
use crate::clock::MonotonicClock;
use crate::error::{PipelineError, Result};
use crate::message::{ColorMsg, FrameHeader, MsgHeader, MsgKind, VideoFlags, VideoFormat, VideoFormatMsg, HEADER_SIZE};
use crate::rational::FpsSchedule;

/// A pixel-aligned crop rectangle within the source surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// Runtime-configurable knobs (spec section 4.E); setters may be rejected
/// with `AlreadyRunning` while capturing is live, and with
/// `NotSupported`/`InvalidArgument` for values this stage cannot honour.
pub struct CaptureConfig {
    inner: RwLock<ConfigInner>,
    running: AtomicBool,
}

#[derive(Clone)]
struct ConfigInner {
    fps: FpsSchedule,
    source: ReadSource,
    format: VideoFormat,
    pack_alignment: u8,
    try_async: bool,
    draw_indicator: bool,
    ignore_time: bool,
    lock_fps: bool,
    crop: Option<CropRect>,
}

impl CaptureConfig {
    pub fn new(target_fps: u32) -> Result<Arc<Self>> {
        if target_fps == 0 {
            return Err(PipelineError::InvalidArgument("target_fps must be > 0".into()));
        }
        Ok(Arc::new(Self {
            inner: RwLock::new(ConfigInner {
                fps: FpsSchedule::new(target_fps),
                source: ReadSource::Front,
                format: VideoFormat::Bgra,
                pack_alignment: 1,
                try_async: false,
                draw_indicator: false,
                ignore_time: false,
                lock_fps: false,
                crop: None,
            }),
            running: AtomicBool::new(false),
        }))
    }

    fn guard_not_running(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(PipelineError::AlreadyRunning);
        }
        Ok(())
    }

    pub fn set_target_fps(&self, fps: u32) -> Result<()> {
        self.guard_not_running()?;
        if fps == 0 {
            return Err(PipelineError::InvalidArgument("target_fps must be > 0".into()));
        }
        self.inner.write().fps = FpsSchedule::new(fps);
        Ok(())
    }

    pub fn set_source(&self, source: ReadSource) -> Result<()> {
        self.guard_not_running()?;
        self.inner.write().source = source;
        Ok(())
    }

    pub fn set_format(&self, format: VideoFormat) -> Result<()> {
        self.guard_not_running()?;
        if format == VideoFormat::YCbCr420Jpeg {
            return Err(PipelineError::NotSupported(
                "capture only supports BGRA or BGR pixel formats".into(),
            ));
        }
        self.inner.write().format = format;
        Ok(())
    }

    pub fn set_pack_alignment(&self, alignment: u8) -> Result<()> {
        self.guard_not_running()?;
        if alignment != 1 && alignment != 8 {
            return Err(PipelineError::InvalidArgument("pack alignment must be 1 or 8".into()));
        }
        self.inner.write().pack_alignment = alignment;
        Ok(())
    }

    pub fn set_try_async(&self, enabled: bool) -> Result<()> {
        self.guard_not_running()?;
        self.inner.write().try_async = enabled;
        Ok(())
    }

    pub fn set_draw_indicator(&self, enabled: bool) -> Result<()> {
        self.inner.write().draw_indicator = enabled;
        Ok(())
    }

    pub fn set_ignore_time(&self, enabled: bool) -> Result<()> {
        self.inner.write().ignore_time = enabled;
        Ok(())
    }

    pub fn set_lock_fps(&self, enabled: bool) -> Result<()> {
        self.inner.write().lock_fps = enabled;
        Ok(())
    }

    pub fn set_crop(&self, crop: Option<CropRect>) -> Result<()> {
        self.guard_not_running()?;
        self.inner.write().crop = crop;
        Ok(())
    }
}

/// A short, bounded critical section for mutating the capture stream
/// list — bounded by a single hashmap lookup/insert, never by I/O or a
/// blocking buffer operation.
struct Spinlock(AtomicBool);

impl Spinlock {
    fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    fn lock(&self) -> SpinlockGuard<'_> {
        while self.0.compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed).is_err() {
            hint::spin_loop();
        }
        SpinlockGuard(self)
    }
}

struct SpinlockGuard<'a>(&'a Spinlock);

impl Drop for SpinlockGuard<'_> {
    fn drop(&mut self) {
        self.0 .0.store(false, Ordering::Release);
    }
}

#[derive(Clone, Copy, Default)]
struct Geometry {
    w: u32,
    h: u32,
    cw: u32,
    ch: u32,
    cx: u32,
    cy: u32,
    row: usize,
}

#[derive(Default)]
struct AsyncFlight {
    in_flight: bool,
    pbo_time: u64,
}

/// Per-(display, surface) capture state (spec section 3). Created lazily
/// on first frame, lives until pipeline teardown.
struct CaptureStream {
    id: u32,
    geometry: PlMutex<Geometry>,
    color: PlMutex<ColorMsg>,
    need_color_update: AtomicBool,
    capturing: AtomicBool,
    last_ns: AtomicU64,
    async_flight: PlMutex<AsyncFlight>,
    frames_captured: AtomicU64,
    frames_dropped: AtomicU64,
    frames_skipped: AtomicU64,
}

impl CaptureStream {
    fn new(id: u32) -> Self {
        Self {
            id,
            geometry: PlMutex::new(Geometry::default()),
            color: PlMutex::new(ColorMsg::neutral(id)),
            need_color_update: AtomicBool::new(true),
            capturing: AtomicBool::new(false),
            last_ns: AtomicU64::new(0),
            async_flight: PlMutex::new(AsyncFlight::default()),
            frames_captured: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            frames_skipped: AtomicU64::new(0),
        }
    }
}

/// Read-only snapshot of one stream's counters — ambient bookkeeping, not
/// a wire message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureStats {
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub frames_skipped: u64,
}

/// Drives frame sampling for every (display, surface) pair that calls
/// `frame()`. Generic over the collaborator traits so tests can supply a
/// fake surface and transfer object.
pub struct CaptureStage<S, T> {
    config: Arc<CaptureConfig>,
    streams: RwLock<HashMap<(u64, u64), Arc<CaptureStream>>>,
    next_id: AtomicU32,
    global_capturing: AtomicBool,
    spinlock: Spinlock,
    out: Arc<PacketBuffer>,
    surface: Arc<S>,
    transfer: Option<Arc<T>>,
    clock: Arc<dyn MonotonicClock>,
}

impl<S: Surface, T: AsyncTransfer> CaptureStage<S, T> {
    pub fn new(
        config: Arc<CaptureConfig>,
        out: Arc<PacketBuffer>,
        surface: Arc<S>,
        transfer: Option<Arc<T>>,
        clock: Arc<dyn MonotonicClock>,
    ) -> Self {
        Self {
            config,
            streams: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            global_capturing: AtomicBool::new(false),
            spinlock: Spinlock::new(),
            out,
            surface,
            transfer,
            clock,
        }
    }

    pub fn stats(&self, display: u64, surface_id: u64) -> Option<CaptureStats> {
        self.streams.read().get(&(display, surface_id)).map(|s| CaptureStats {
            frames_captured: s.frames_captured.load(Ordering::Relaxed),
            frames_dropped: s.frames_dropped.load(Ordering::Relaxed),
            frames_skipped: s.frames_skipped.load(Ordering::Relaxed),
        })
    }

    pub fn start(&self) -> Result<()> {
        let _g = self.spinlock.lock();
        if self.global_capturing.swap(true, Ordering::SeqCst) {
            return Err(PipelineError::AlreadyRunning);
        }
        self.config.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Clears the global `CAPTURING` bit, then spin-waits (sleeping 1ms
    /// between checks) until every per-stream bit clears, then resets
    /// each stream's `last` to 0. After this returns no frame callback is
    /// inside the critical path — it is safe to reconfigure.
    pub fn stop(&self) {
        {
            let _g = self.spinlock.lock();
            self.global_capturing.store(false, Ordering::SeqCst);
        }
        loop {
            let all_clear = self.streams.read().values().all(|s| !s.capturing.load(Ordering::SeqCst));
            if all_clear {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        for s in self.streams.read().values() {
            s.last_ns.store(0, Ordering::SeqCst);
        }
        self.config.running.store(false, Ordering::SeqCst);
    }

    fn resolve_stream(&self, display: u64, surface_id: u64) -> Arc<CaptureStream> {
        if let Some(s) = self.streams.read().get(&(display, surface_id)) {
            return s.clone();
        }
        let mut streams = self.streams.write();
        streams
            .entry((display, surface_id))
            .or_insert_with(|| {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                Arc::new(CaptureStream::new(id))
            })
            .clone()
    }

    /// Samples one frame for `(display, surface_id)`. A rate-gated,
    /// busy-dropped, or pre-capture-dispatch call all return `Ok(())`
    /// without writing a `VideoFrame` message; only write-path failures
    /// trigger the global error path.
    pub fn frame(&self, display: u64, surface_id: u64) -> Result<()> {
        let stream = {
            let _g = self.spinlock.lock();
            if !self.global_capturing.load(Ordering::SeqCst) {
                return Ok(());
            }
            let stream = self.resolve_stream(display, surface_id);
            stream.capturing.store(true, Ordering::SeqCst);
            stream
        };

        let result = self.frame_inner(&stream, display, surface_id);
        stream.capturing.store(false, Ordering::SeqCst);

        let captured = match result {
            Ok(captured) => captured,
            Err(e) => {
                if !matches!(e, PipelineError::Cancelled) {
                    log::error!("capture: fatal error on stream {}: {e}", stream.id);
                    self.global_capturing.store(false, Ordering::SeqCst);
                    self.out.cancel_buffer();
                }
                return Err(e);
            }
        };

        if captured && self.config.inner.read().draw_indicator {
            if let Err(e) = self.surface.draw_indicator(display) {
                log::warn!("capture: indicator draw failed on stream {}: {e}", stream.id);
            }
        }

        Ok(())
    }

    /// Returns `Ok(true)` only when a `VideoFrame` message was actually
    /// written this call — the rate-gated skip, async kickoff-only, and
    /// `Busy`-drop paths all return `Ok(false)` so the caller does not
    /// draw the capture indicator for a call that captured nothing.
    fn frame_inner(&self, stream: &Arc<CaptureStream>, display: u64, surface_id: u64) -> Result<bool> {
        let cfg = self.config.inner.read().clone();
        let last = stream.last_ns.load(Ordering::SeqCst);
        let now = if cfg.ignore_time { last + cfg.fps.period_ns } else { self.clock.now_ns() };

        // `last == 0` is the "never captured" sentinel (fresh stream, or
        // just after `stop()` reset it) — always let that first frame
        // through regardless of the rate gate.
        let rate_gated = last != 0
            && now.saturating_sub(last) < cfg.fps.period_ns
            && !cfg.lock_fps
            && !cfg.ignore_time;
        if rate_gated {
            stream.frames_skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }

        self.refresh_geometry_and_color(stream, display, surface_id, &cfg)?;

        if cfg.try_async && self.transfer.is_some() {
            let mut flight = stream.async_flight.lock();
            if !flight.in_flight {
                let geom = *stream.geometry.lock();
                self.transfer.as_ref().unwrap().begin(
                    cfg.source,
                    geom.cx as i32,
                    geom.cy as i32,
                    geom.cw,
                    geom.ch,
                    cfg.format,
                )?;
                flight.in_flight = true;
                flight.pbo_time = now;
                return Ok(false);
            }
        }

        let try_mode = !(cfg.lock_fps || cfg.ignore_time);
        let mut w = match self.out.open_write(try_mode) {
            Ok(w) => w,
            Err(PipelineError::Busy) => {
                stream.frames_dropped.fetch_add(1, Ordering::Relaxed);
                log::info!("capture: dropped frame for stream {} (buffer busy)", stream.id);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let geom = *stream.geometry.lock();
        let pixel_len = geom.row * geom.ch as usize;
        let size = HEADER_SIZE + FrameHeader::SIZE + pixel_len;
        w.set_size(size)?;

        let transfer_was_live = cfg.try_async && self.transfer.is_some() && stream.async_flight.lock().in_flight;
        let pbo_time = stream.async_flight.lock().pbo_time;
        let frame_time = if transfer_was_live && pbo_time < now { pbo_time } else { now };

        w.write(&MsgHeader { kind: MsgKind::VideoFrame, size: size as u32 }.to_bytes())?;
        w.write(&FrameHeader { id: stream.id, time_ns: frame_time }.to_bytes())?;

        {
            let dst = w.dma(pixel_len, DmaFlags::ACCEPT_FAKE_DMA)?;
            if transfer_was_live {
                let transfer = self.transfer.as_ref().unwrap();
                let mapped = transfer.map()?;
                dst.copy_from_slice(&mapped[..pixel_len]);
                transfer.unmap();
                transfer.begin(cfg.source, geom.cx as i32, geom.cy as i32, geom.cw, geom.ch, cfg.format)?;
                let mut flight = stream.async_flight.lock();
                flight.in_flight = true;
                flight.pbo_time = now;
            } else {
                self.surface.read_pixels(cfg.source, geom.cx as i32, geom.cy as i32, geom.cw, geom.ch, cfg.format, dst)?;
            }
        }

        w.close()?;
        let captured = stream.frames_captured.fetch_add(1, Ordering::Relaxed) + 1;

        if cfg.lock_fps {
            let elapsed = self.clock.now_ns().saturating_sub(now);
            if elapsed < cfg.fps.period_ns {
                std::thread::sleep(Duration::from_nanos(cfg.fps.period_ns - elapsed));
            }
        }

        let mut next = last + cfg.fps.period_ns;
        if captured % cfg.fps.fps_rem_period == 0 {
            next += cfg.fps.fps_rem;
        }
        stream.last_ns.store(next, Ordering::SeqCst);

        Ok(true)
    }

    fn refresh_geometry_and_color(
        &self,
        stream: &Arc<CaptureStream>,
        display: u64,
        surface_id: u64,
        cfg: &ConfigInner,
    ) -> Result<()> {
        let (w, h) = self.surface.geometry(surface_id)?;
        let (cx, cy, cw, ch) = match cfg.crop {
            Some(c) => (c.x, c.y, c.w.min(w.saturating_sub(c.x)), c.h.min(h.saturating_sub(c.y))),
            None => (0, 0, w, h),
        };
        let bpp = cfg.format.bytes_per_pixel();
        let packed_row = cw as usize * bpp;
        let row = if cfg.pack_alignment == 8 { (packed_row + 7) & !7 } else { packed_row };

        let changed = {
            let mut geom = stream.geometry.lock();
            let changed = geom.w != w || geom.h != h || geom.cw != cw || geom.ch != ch || geom.cx != cx || geom.cy != cy;
            if changed {
                *geom = Geometry { w, h, cw, ch, cx, cy, row };
            }
            changed
        };
        if changed {
            self.emit_video_format(stream, cfg)?;
        }

        let (r, g, b) = self.surface.gamma(display, 0)?;
        let need_update = stream.need_color_update.swap(false, Ordering::SeqCst);
        let msg = {
            let mut color = stream.color.lock();
            let differs = (color.gamma_r - r).abs() > f32::EPSILON
                || (color.gamma_g - g).abs() > f32::EPSILON
                || (color.gamma_b - b).abs() > f32::EPSILON;
            if need_update || differs {
                color.gamma_r = r;
                color.gamma_g = g;
                color.gamma_b = b;
                Some(*color)
            } else {
                None
            }
        };
        if let Some(msg) = msg {
            self.emit_color(&msg)?;
        }

        Ok(())
    }

    fn emit_video_format(&self, stream: &Arc<CaptureStream>, cfg: &ConfigInner) -> Result<()> {
        let geom = *stream.geometry.lock();
        let flags = if cfg.pack_alignment == 8 { VideoFlags::DWORD_ALIGNED } else { VideoFlags::empty() };
        let msg = VideoFormatMsg { id: stream.id, flags, format: cfg.format, width: geom.cw, height: geom.ch };
        let payload = msg.to_bytes();
        self.emit(MsgKind::VideoFormat, &payload)
    }

    fn emit_color(&self, msg: &ColorMsg) -> Result<()> {
        self.emit(MsgKind::Color, &msg.to_bytes())
    }

    fn emit(&self, kind: MsgKind, payload: &[u8]) -> Result<()> {
        let mut w = self.out.open_write(false)?;
        w.set_size(HEADER_SIZE + payload.len())?;
        w.write(&MsgHeader { kind, size: (HEADER_SIZE + payload.len()) as u32 }.to_bytes())?;
        w.write(payload)?;
        w.close()
    }
}
