//! Keyframe-annotated frame index
//!
//! Built once per source by a forward scan over every packet of the selected
//! stream. Entries are kept in presentation order and each one knows the
//! nearest keyframe at or before it, which is what seeking jumps to.

use crate::error::{DecoderError, Result};
use crate::nal::{self, CodecId};
use crate::session::{Packet, Rational};
use tracing::debug;

/// One frame of the selected stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub pts: i64,
    pub is_keyframe: bool,
    pub is_flush_frame: bool,
    pub last_keyframe_id: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameIndex {
    entries: Vec<IndexEntry>,
    keyframes: Vec<usize>,
    time_base: Rational,
    is_vfr: bool,
}

impl FrameIndex {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn entry(&self, frame: usize) -> Option<&IndexEntry> {
        self.entries.get(frame)
    }

    /// Positions of all keyframes, ascending
    pub fn keyframes(&self) -> &[usize] {
        &self.keyframes
    }

    /// Nearest keyframe at or before `frame`
    pub fn keyframe_for(&self, frame: usize) -> Option<usize> {
        self.entries.get(frame).map(|e| e.last_keyframe_id)
    }

    pub fn is_vfr(&self) -> bool {
        self.is_vfr
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    /// Presentation time of `frame` in seconds, relative to the first entry
    pub fn timestamp_seconds(&self, frame: usize) -> Option<f64> {
        let first = self.entries.first()?.pts;
        self.entries
            .get(frame)
            .map(|e| self.time_base.to_seconds(e.pts - first))
    }
}

/// Accumulates packets of one stream into a [`FrameIndex`]
pub struct FrameIndexBuilder {
    stream: usize,
    codec: CodecId,
    time_base: Rational,
    source_name: String,
    entries: Vec<IndexEntry>,
    skipped_negative: usize,
}

impl FrameIndexBuilder {
    pub fn new(stream: usize, codec: CodecId, time_base: Rational, source_name: impl Into<String>) -> Self {
        Self {
            stream,
            codec,
            time_base,
            source_name: source_name.into(),
            entries: Vec::new(),
            skipped_negative: 0,
        }
    }

    /// Index one packet; packets of other streams are ignored.
    pub fn push(&mut self, packet: &Packet) -> Result<()> {
        if packet.stream_index != self.stream {
            return Ok(());
        }

        let is_keyframe = nal::is_keyframe(&self.codec, &packet.data, packet.is_keyframe);

        let pts = match packet.pts.or(packet.dts) {
            Some(ts) => ts,
            None => {
                return Err(DecoderError::NoTimestamps {
                    source_name: self.source_name.clone(),
                })
            }
        };

        if pts < 0 {
            self.skipped_negative += 1;
            return Ok(());
        }

        self.entries.push(IndexEntry {
            pts,
            is_keyframe,
            is_flush_frame: false,
            last_keyframe_id: 0,
        });
        Ok(())
    }

    pub fn finish(self) -> Result<FrameIndex> {
        let Self {
            source_name,
            mut entries,
            time_base,
            skipped_negative,
            ..
        } = self;

        if entries.is_empty() {
            return Err(DecoderError::NoFrames { source_name });
        }

        // Storage order is not presentation order
        entries.sort_by_key(|e| e.pts);

        if let Some(last) = entries.last_mut() {
            last.is_flush_frame = true;
        }

        let keyframes: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_keyframe)
            .map(|(i, _)| i)
            .collect();

        if keyframes.is_empty() {
            return Err(DecoderError::NoKeyframes { source_name });
        }

        for (i, entry) in entries.iter_mut().enumerate() {
            // upper_bound over keyframe positions, then step back one
            let after = keyframes.partition_point(|&k| k <= i);
            entry.last_keyframe_id = if after == 0 { keyframes[0] } else { keyframes[after - 1] };
        }

        let is_vfr = detect_variable_frame_rate(&entries);

        debug!(
            "Built frame index for {}: {} frames, {} keyframes, vfr={}, skipped {} negative timestamps",
            source_name,
            entries.len(),
            keyframes.len(),
            is_vfr,
            skipped_negative
        );

        Ok(FrameIndex {
            entries,
            keyframes,
            time_base,
            is_vfr,
        })
    }
}

/// Any step differing from the first one marks the stream variable-frame-rate.
///
/// Needs more than three entries to decide.
pub fn detect_variable_frame_rate(entries: &[IndexEntry]) -> bool {
    if entries.len() <= 3 {
        return false;
    }
    let first_delta = entries[1].pts - entries[0].pts;
    entries
        .windows(2)
        .skip(1)
        .any(|w| w[1].pts - w[0].pts != first_delta)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(stream: usize, pts: Option<i64>, key: bool) -> Packet {
        Packet {
            stream_index: stream,
            pts,
            dts: None,
            is_keyframe: key,
            data: Vec::new(),
        }
    }

    fn build(packets: &[Packet]) -> Result<FrameIndex> {
        let mut builder = FrameIndexBuilder::new(0, CodecId::Other("mpeg4".into()), Rational::new(1, 10), "test.avi");
        for p in packets {
            builder.push(p)?;
        }
        builder.finish()
    }

    #[test]
    fn test_sorted_with_keyframe_links() {
        let index = build(&[
            packet(0, Some(0), true),
            packet(0, Some(20), false),
            packet(0, Some(10), false),
            packet(1, Some(15), true),
            packet(0, Some(30), true),
            packet(0, Some(40), false),
        ])
        .unwrap();

        let pts: Vec<i64> = index.entries().iter().map(|e| e.pts).collect();
        assert_eq!(pts, vec![0, 10, 20, 30, 40]);
        let links: Vec<usize> = index.entries().iter().map(|e| e.last_keyframe_id).collect();
        assert_eq!(links, vec![0, 0, 0, 3, 3]);
        assert!(index.entries().last().unwrap().is_flush_frame);
        assert_eq!(index.entries().iter().filter(|e| e.is_flush_frame).count(), 1);
        assert_eq!(index.keyframes(), &[0, 3]);
    }

    #[test]
    fn test_entries_before_first_keyframe_point_to_it() {
        let index = build(&[
            packet(0, Some(0), false),
            packet(0, Some(1), false),
            packet(0, Some(2), true),
        ])
        .unwrap();
        assert_eq!(index.keyframe_for(0), Some(2));
        assert_eq!(index.keyframe_for(1), Some(2));
        assert_eq!(index.keyframe_for(2), Some(2));
    }

    #[test]
    fn test_dts_fallback_and_negative_skip() {
        let mut p = packet(0, None, true);
        p.dts = Some(5);
        let index = build(&[packet(0, Some(-3), true), p, packet(0, Some(9), false)]).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.entries()[0].pts, 5);
    }

    #[test]
    fn test_missing_timestamp_is_fatal() {
        let err = build(&[packet(0, Some(0), true), packet(0, None, false)]).unwrap_err();
        assert!(matches!(err, DecoderError::NoTimestamps { .. }));
        assert!(err.to_string().contains("test.avi"));
    }

    #[test]
    fn test_no_frames_and_no_keyframes() {
        assert!(matches!(build(&[]).unwrap_err(), DecoderError::NoFrames { .. }));
        assert!(matches!(
            build(&[packet(1, Some(0), true)]).unwrap_err(),
            DecoderError::NoFrames { .. }
        ));
        assert!(matches!(
            build(&[packet(0, Some(0), false)]).unwrap_err(),
            DecoderError::NoKeyframes { .. }
        ));
    }

    #[test]
    fn test_vfr_detection() {
        let entries = |pts: &[i64]| -> Vec<IndexEntry> {
            pts.iter()
                .map(|&pts| IndexEntry {
                    pts,
                    is_keyframe: false,
                    is_flush_frame: false,
                    last_keyframe_id: 0,
                })
                .collect()
        };
        assert!(!detect_variable_frame_rate(&entries(&[0, 10, 20, 30, 40])));
        assert!(detect_variable_frame_rate(&entries(&[0, 10, 20, 35, 40])));
        // too short to decide
        assert!(!detect_variable_frame_rate(&entries(&[0, 10, 25])));
    }

    #[test]
    fn test_timestamp_seconds_relative_to_first() {
        let index = build(&[packet(0, Some(100), true), packet(0, Some(105), false)]).unwrap();
        assert_eq!(index.timestamp_seconds(0), Some(0.0));
        assert!((index.timestamp_seconds(1).unwrap() - 0.5).abs() < 1e-12);
    }
}
