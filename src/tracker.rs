//! State tracker (spec section 4.C): records the latest format and color
//! message per stream and replays them to late-joining consumers.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::message::{AudioFormatMsg, ColorMsg, MsgHeader, MsgKind, VideoFormatMsg};
use crate::error::Result;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TrackedMessage {
    VideoFormat(VideoFormatMsg),
    Color(ColorMsg),
    AudioFormat(AudioFormatMsg),
}

#[derive(Default, Clone, Copy)]
struct StreamRecord {
    video_format: Option<VideoFormatMsg>,
    color: Option<ColorMsg>,
    audio_format: Option<AudioFormatMsg>,
}

/// Append-mostly table keyed by `stream_id`. Streams are kept in a
/// `BTreeMap` rather than a `HashMap` so `iterate` replays them in a
/// stable, id-ascending order — matching spec section 8's end-to-end
/// scenario, which expects a deterministic callback order.
pub struct StateTracker {
    streams: Mutex<BTreeMap<u32, StreamRecord>>,
}

impl StateTracker {
    pub fn new() -> Self {
        Self { streams: Mutex::new(BTreeMap::new()) }
    }

    /// Records the latest `VideoFormat`, `AudioFormat`, or `Color` for a
    /// stream. Any other message kind is ignored — the tracker only
    /// cares about state messages, not data.
    pub fn submit(&self, header: &MsgHeader, payload: &[u8]) -> Result<()> {
        let mut streams = self.streams.lock().unwrap();
        match header.kind {
            MsgKind::VideoFormat => {
                let msg = VideoFormatMsg::from_bytes(payload)?;
                streams.entry(msg.id).or_default().video_format = Some(msg);
            }
            MsgKind::Color => {
                let msg = ColorMsg::from_bytes(payload)?;
                streams.entry(msg.id).or_default().color = Some(msg);
            }
            MsgKind::AudioFormat => {
                let msg = AudioFormatMsg::from_bytes(payload)?;
                streams.entry(msg.id).or_default().audio_format = Some(msg);
            }
            _ => {}
        }
        Ok(())
    }

    /// Replays, for each known stream in ascending id order, each present
    /// kind in the order format → color → audio-format. Idempotent: a
    /// second `iterate` call with no new `submit`s in between yields the
    /// same sequence.
    pub fn iterate(&self, mut callback: impl FnMut(u32, TrackedMessage)) {
        let streams = self.streams.lock().unwrap();
        for (&id, record) in streams.iter() {
            if let Some(vf) = record.video_format {
                callback(id, TrackedMessage::VideoFormat(vf));
            }
            if let Some(c) = record.color {
                callback(id, TrackedMessage::Color(c));
            }
            if let Some(af) = record.audio_format {
                callback(id, TrackedMessage::AudioFormat(af));
            }
        }
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{VideoFlags, VideoFormat};

    fn video_format_msg(id: u32) -> (MsgHeader, Vec<u8>) {
        let msg = VideoFormatMsg {
            id,
            flags: VideoFlags::empty(),
            format: VideoFormat::Bgr,
            width: 640,
            height: 480,
        };
        let bytes = msg.to_bytes();
        (MsgHeader { kind: MsgKind::VideoFormat, size: bytes.len() as u32 }, bytes)
    }

    fn color_msg_bytes(id: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&id.to_be_bytes());
        for v in [0.1f32, 0.2, 1.0, 1.0, 1.0] {
            buf.extend_from_slice(&v.to_be_bytes());
        }
        buf
    }

    fn audio_format_bytes(id: u32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&id.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&48_000u32.to_be_bytes());
        buf.extend_from_slice(&2u32.to_be_bytes());
        buf.push(0);
        buf
    }

    #[test]
    fn replays_in_format_color_audio_order_across_streams() {
        let tracker = StateTracker::new();
        let (h1, p1) = video_format_msg(1);
        tracker.submit(&h1, &p1).unwrap();
        tracker
            .submit(&MsgHeader { kind: MsgKind::Color, size: 0 }, &color_msg_bytes(1))
            .unwrap();
        tracker
            .submit(&MsgHeader { kind: MsgKind::AudioFormat, size: 0 }, &audio_format_bytes(2))
            .unwrap();

        let mut seen = Vec::new();
        tracker.iterate(|id, msg| seen.push((id, msg)));

        assert_eq!(seen.len(), 3);
        assert!(matches!(seen[0], (1, TrackedMessage::VideoFormat(_))));
        assert!(matches!(seen[1], (1, TrackedMessage::Color(_))));
        assert!(matches!(seen[2], (2, TrackedMessage::AudioFormat(_))));
    }

    #[test]
    fn idempotent_submit_and_iterate() {
        let tracker = StateTracker::new();
        let (h, p) = video_format_msg(1);
        tracker.submit(&h, &p).unwrap();
        tracker.submit(&h, &p).unwrap();

        let mut first = Vec::new();
        tracker.iterate(|id, msg| first.push((id, msg)));
        let mut second = Vec::new();
        tracker.iterate(|id, msg| second.push((id, msg)));

        assert_eq!(first.len(), 1);
        assert_eq!(first, second);
    }
}
