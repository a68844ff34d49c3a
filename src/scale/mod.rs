//! Scale stage (spec section 4.D): a parallel worker pool that downscales
//! and/or format-converts video frames, driven by the thread runner (4.B).

mod table;

pub use table::{ResampleTable, Sample};

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{PipelineError, Result};
use crate::message::{
    FrameHeader, MsgHeader, MsgKind, VideoFlags, VideoFormat, VideoFormatMsg, HEADER_SIZE,
};
use crate::runner::{ReadOutcome, Stage};

enum Mode {
    /// `process == false`: frames and the format message forward
    /// unchanged, no per-pixel work at all.
    PassThrough,
    /// `s == 1`, source `BGRA`: repack three bytes per pixel, no tables.
    BgraToBgr,
    /// `s == 0.5`: 2x2 box filter, no tables.
    Half,
    /// General bilinear resample over a precomputed table.
    Bilinear(Arc<ResampleTable>),
}

struct StreamState {
    process: bool,
    mode: Mode,
    src_bpp: usize,
    src_row: usize,
    w: u32,
    h: u32,
    sw: u32,
    sh: u32,
}

impl StreamState {
    fn initial() -> Self {
        Self {
            process: false,
            mode: Mode::PassThrough,
            src_bpp: 0,
            src_row: 0,
            w: 0,
            h: 0,
            sw: 0,
            sh: 0,
        }
    }
}

/// Configured with a target scale `s ∈ (0, 1]`; `s == 1` with a `BGRA`
/// source still repacks to `BGR`, `s == 1` with a `BGR` source is a pure
/// pass-through.
pub struct ScaleStage {
    scale: f64,
    streams: RwLock<HashMap<u32, Arc<RwLock<StreamState>>>>,
}

impl ScaleStage {
    pub fn new(scale: f64) -> Result<Self> {
        if !(scale > 0.0 && scale <= 1.0) {
            return Err(PipelineError::InvalidArgument(format!(
                "scale factor must be in (0, 1], got {scale}"
            )));
        }
        Ok(Self { scale, streams: RwLock::new(HashMap::new()) })
    }

    fn stream_for(&self, id: u32) -> Arc<RwLock<StreamState>> {
        if let Some(s) = self.streams.read().get(&id) {
            return s.clone();
        }
        self.streams
            .write()
            .entry(id)
            .or_insert_with(|| Arc::new(RwLock::new(StreamState::initial())))
            .clone()
    }

    fn handle_video_format(&self, payload: &[u8]) -> Result<ReadOutcome<Vec<u8>>> {
        let msg = VideoFormatMsg::from_bytes(payload)?;
        let src_bpp = match msg.format {
            VideoFormat::Bgra => 4,
            VideoFormat::Bgr => 3,
            VideoFormat::YCbCr420Jpeg => {
                return Err(PipelineError::NotSupported(
                    "scale stage only resamples packed BGR/BGRA frames".into(),
                ))
            }
        };

        let stream = self.stream_for(msg.id);
        let mut guard = stream.write();

        let pass_through = self.scale == 1.0 && msg.format == VideoFormat::Bgr;
        if pass_through {
            *guard = StreamState { process: false, ..StreamState::initial() };
            drop(guard);
            return Ok(ReadOutcome::Copy);
        }

        let row = {
            let packed = msg.width as usize * src_bpp;
            if msg.flags.contains(VideoFlags::DWORD_ALIGNED) {
                (packed + 7) & !7
            } else {
                packed
            }
        };

        let sw = (self.scale * msg.width as f64).floor() as u32;
        let sh = (self.scale * msg.height as f64).floor() as u32;

        let mode = if self.scale == 1.0 {
            Mode::BgraToBgr
        } else if self.scale == 0.5 {
            Mode::Half
        } else {
            Mode::Bilinear(Arc::new(table::build(msg.width, msg.height, src_bpp, row, sw, sh)))
        };

        *guard = StreamState { process: true, mode, src_bpp, src_row: row, w: msg.width, h: msg.height, sw, sh };
        drop(guard);

        // Target is always packed BGR: strip DWORD_ALIGNED, which no
        // longer applies, and force the format tag regardless of what
        // the source reported (see DESIGN.md on the GLC_CTX_BGR open
        // question).
        let out_msg = VideoFormatMsg {
            id: msg.id,
            flags: msg.flags.remove(VideoFlags::DWORD_ALIGNED),
            format: VideoFormat::Bgr,
            width: sw,
            height: sh,
        };
        let full = encode(MsgKind::VideoFormat, &out_msg.to_bytes());
        Ok(ReadOutcome::Write { size: full.len(), state: full })
    }

    fn handle_video_frame(&self, payload: &[u8]) -> Result<ReadOutcome<Vec<u8>>> {
        let fh = FrameHeader::from_bytes(payload)?;
        let pixels = &payload[FrameHeader::SIZE..];

        let stream = match self.streams.read().get(&fh.id) {
            Some(s) => s.clone(),
            None => {
                return Err(PipelineError::NotReady);
            }
        };

        let guard = stream.read();
        if !guard.process {
            drop(guard);
            return Ok(ReadOutcome::Copy);
        }

        let out_pixels = match &guard.mode {
            Mode::PassThrough => unreachable!("process=true never pairs with PassThrough"),
            Mode::BgraToBgr => repack_bgra_to_bgr(pixels, guard.w, guard.h, guard.src_row),
            Mode::Half => half_scale(pixels, guard.src_bpp, guard.src_row, guard.sw, guard.sh),
            Mode::Bilinear(table) => bilinear_resample(pixels, table),
        };
        drop(guard);

        let mut body = Vec::with_capacity(FrameHeader::SIZE + out_pixels.len());
        body.extend_from_slice(&fh.to_bytes());
        body.extend_from_slice(&out_pixels);
        let full = encode(MsgKind::VideoFrame, &body);
        Ok(ReadOutcome::Write { size: full.len(), state: full })
    }
}

impl Stage for ScaleStage {
    type State = Vec<u8>;

    fn read(&self, header: &MsgHeader, payload: &[u8]) -> Result<ReadOutcome<Self::State>> {
        match header.kind {
            MsgKind::VideoFormat => self.handle_video_format(payload),
            MsgKind::VideoFrame => self.handle_video_frame(payload),
            _ => Ok(ReadOutcome::Copy),
        }
    }

    fn write(&self, state: Self::State, out: &mut [u8]) -> Result<()> {
        out.copy_from_slice(&state);
        Ok(())
    }
}

fn encode(kind: MsgKind, payload: &[u8]) -> Vec<u8> {
    let header = MsgHeader { kind, size: (HEADER_SIZE + payload.len()) as u32 };
    let mut full = Vec::with_capacity(HEADER_SIZE + payload.len());
    full.extend_from_slice(&header.to_bytes());
    full.extend_from_slice(payload);
    full
}

/// `s == 1`, source `BGRA`: pack three bytes per target pixel by stepping
/// the source by `bpp`, dropping alpha. Output is always packed (no row
/// padding), matching the scale stage's "target is always packed" rule.
fn repack_bgra_to_bgr(src: &[u8], w: u32, h: u32, src_row: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(w as usize * h as usize * 3);
    for y in 0..h as usize {
        let row = &src[y * src_row..];
        for x in 0..w as usize {
            let p = x * 4;
            out.extend_from_slice(&row[p..p + 3]);
        }
    }
    out
}

/// `s == 0.5`: for each 2x2 source block, output `(a+b+c+d) >> 2` per
/// channel, over the three BGR channels (alpha, if present, is dropped).
fn half_scale(src: &[u8], src_bpp: usize, src_row: usize, sw: u32, sh: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(sw as usize * sh as usize * 3);
    for y in 0..sh as usize {
        let (y0, y1) = (2 * y, 2 * y + 1);
        for x in 0..sw as usize {
            let (x0, x1) = (2 * x, 2 * x + 1);
            for c in 0..3 {
                let a = src[y0 * src_row + x0 * src_bpp + c] as u32;
                let b = src[y0 * src_row + x1 * src_bpp + c] as u32;
                let cc = src[y1 * src_row + x0 * src_bpp + c] as u32;
                let d = src[y1 * src_row + x1 * src_bpp + c] as u32;
                out.push(((a + b + cc + d) >> 2) as u8);
            }
        }
    }
    out
}

/// General bilinear path: for each target pixel, three channels each
/// `= Σ source[pos[i]+c] * factor[i]`, truncated to byte.
fn bilinear_resample(src: &[u8], table: &ResampleTable) -> Vec<u8> {
    let mut out = Vec::with_capacity(table.sw as usize * table.sh as usize * 3);
    for sample in &table.samples {
        for c in 0..3 {
            let v: f32 = (0..4)
                .map(|i| src[sample.pos[i] + c] as f32 * sample.factor[i])
                .sum();
            out.push(v.clamp(0.0, 255.0) as u8);
        }
    }
    out
}
