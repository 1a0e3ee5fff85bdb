//! Random-access frame decoder
//!
//! Wraps one demuxer/decoder session and exposes seek-by-frame plus batch
//! decoding. Seeking jumps to the nearest preceding keyframe when an index is
//! available and decodes-and-discards up to the requested frame otherwise.
//!
//! A decoder is not safe for concurrent use; all operations take `&mut self`.
//! Decode independent sources with independent decoders.

use crate::boundary::{self, BoundaryType};
use crate::error::{DecoderError, Result};
use crate::frame_index::{FrameIndex, FrameIndexBuilder};
use crate::session::{describe_streams, DecoderOptions, SessionOpener, StreamInfo, VideoSession};
use crate::source::MediaSource;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Forward distance (in frames) decoded linearly instead of seeking
pub const MINIMUM_SEEK_LEAP: i64 = 10;

pub struct FramesDecoder {
    source: MediaSource,
    opener: Arc<dyn SessionOpener>,
    options: DecoderOptions,
    session: Option<Box<dyn VideoSession>>,
    stream_id: Option<usize>,
    index: Option<FrameIndex>,
    num_frames: Option<i64>,
    next_frame_idx: i64,
    can_seek: bool,
    is_valid: bool,
    seeks_issued: usize,
    resets: usize,
}

impl FramesDecoder {
    /// Open `source` and select its best video stream.
    ///
    /// Failing to open the source or to find a usable video stream is not an
    /// error: it is logged and the decoder reports `is_valid() == false`.
    pub fn open(source: MediaSource, opener: Arc<dyn SessionOpener>, options: DecoderOptions) -> Self {
        let mut decoder = Self {
            source,
            opener,
            options,
            session: None,
            stream_id: None,
            index: None,
            num_frames: None,
            next_frame_idx: 0,
            can_seek: false,
            is_valid: false,
            seeks_issued: 0,
            resets: 0,
        };

        match decoder.opener.open(&decoder.source, &decoder.options) {
            Ok(session) => {
                decoder.session = Some(session);
                decoder.is_valid = true;
                decoder.can_seek = true;
            }
            Err(e) => {
                warn!(
                    "Failed to open video file \"{}\", due to {}",
                    decoder.source.name(),
                    e
                );
                return decoder;
            }
        }

        if !decoder.select_video_stream(None) {
            warn!("\"{}\" is not a valid video", decoder.source.name());
            decoder.is_valid = false;
        }
        decoder
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    pub fn source_name(&self) -> String {
        self.source.name()
    }

    pub fn options(&self) -> &DecoderOptions {
        &self.options
    }

    pub fn stream_id(&self) -> Option<usize> {
        self.stream_id
    }

    pub fn next_frame_idx(&self) -> i64 {
        self.next_frame_idx
    }

    pub fn can_seek(&self) -> bool {
        self.can_seek
    }

    pub fn has_index(&self) -> bool {
        self.index.is_some()
    }

    pub fn index(&self) -> Option<&FrameIndex> {
        self.index.as_ref()
    }

    /// Container-level seeks attempted so far
    pub fn seeks_issued(&self) -> usize {
        self.seeks_issued
    }

    /// Session reopens performed so far
    pub fn resets(&self) -> usize {
        self.resets
    }

    pub fn stream_info(&self) -> Option<&StreamInfo> {
        let session = self.session.as_ref()?;
        session.streams().get(self.stream_id?)
    }

    pub fn width(&self) -> usize {
        self.stream_info().map(|s| s.width as usize).unwrap_or(0)
    }

    pub fn height(&self) -> usize {
        self.stream_info().map(|s| s.height as usize).unwrap_or(0)
    }

    pub fn channels(&self) -> usize {
        self.options.image_type.channels()
    }

    /// Bytes of one decoded frame
    pub fn frame_size(&self) -> usize {
        self.width() * self.height() * self.channels()
    }

    /// Every stream of the source, for diagnostics
    pub fn describe_streams(&self) -> String {
        self.session
            .as_deref()
            .map(|session| describe_streams(session))
            .unwrap_or_default()
    }

    fn stream(&self) -> Result<usize> {
        self.stream_id
            .ok_or_else(|| DecoderError::NotValid(self.source.name()))
    }

    fn session_mut(&mut self) -> Result<&mut Box<dyn VideoSession>> {
        let name = self.source.name();
        self.session.as_mut().ok_or(DecoderError::NotValid(name))
    }

    /// Select `stream`, or the best video stream when `None`.
    pub fn select_video_stream(&mut self, stream: Option<usize>) -> bool {
        let name = self.source.name();
        let session = match self.session.as_mut() {
            Some(session) => session,
            None => return false,
        };

        let stream_id = match stream.or_else(|| session.find_best_video_stream()) {
            Some(id) => id,
            None => {
                warn!("Could not find a valid video stream in a file in {}", name);
                return false;
            }
        };

        let info = match session.streams().get(stream_id) {
            Some(info) => info,
            None => {
                debug!("Invalid stream id: {}", stream_id);
                return false;
            }
        };

        debug!(
            "Selecting stream {} (codec={}, type={:?}, width={}, height={})",
            stream_id, info.codec, info.media_type, info.width, info.height
        );

        if !info.media_type.may_be_video() {
            debug!("Stream {} is not a video stream", stream_id);
            self.stream_id = None;
            return false;
        }

        self.stream_id = Some(stream_id);
        if !self.check_dimensions() {
            return false;
        }

        self.next_frame_idx = 0;
        self.can_seek = true;
        true
    }

    fn check_dimensions(&mut self) -> bool {
        if self.width() != 0 && self.height() != 0 {
            return true;
        }
        let name = self.source.name();
        if let Some(session) = self.session.as_mut() {
            if let Err(e) = session.find_stream_info() {
                warn!("Could not find stream information in {}: {}", name, e);
                return false;
            }
        }
        if self.width() == 0 || self.height() == 0 {
            warn!("Couldn't load video size info for {}", name);
            return false;
        }
        true
    }

    /// Number of frames in the selected stream.
    ///
    /// Uses the index when built, the container's declared count when present,
    /// and otherwise counts packets (which leaves the decoder reset).
    pub fn num_frames(&mut self) -> Result<i64> {
        if let Some(n) = self.num_frames {
            return Ok(n);
        }
        if let Some(index) = &self.index {
            let n = index.len() as i64;
            self.num_frames = Some(n);
            return Ok(n);
        }
        let declared = self.stream_info().map(|s| s.nb_frames).unwrap_or(0);
        if declared > 0 {
            self.num_frames = Some(declared);
            return Ok(declared);
        }
        self.parse_num_frames()
    }

    fn parse_num_frames(&mut self) -> Result<i64> {
        let stream = self.stream()?;
        let name = self.source.name();
        let session = self.session_mut()?;
        let mut count = 0i64;
        loop {
            match session.read_packet() {
                Ok(Some(packet)) if packet.stream_index == stream => count += 1,
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(e) => {
                    debug!("Stopped counting packets of {}: {}", name, e);
                    break;
                }
            }
        }
        self.num_frames = Some(count);
        self.reset()?;
        Ok(count)
    }

    /// Scan the whole stream and build the keyframe index.
    ///
    /// No-op when an index already exists. Leaves the decoder at frame 0.
    pub fn build_index(&mut self) -> Result<()> {
        if self.index.is_some() {
            return Ok(());
        }

        let stream = self.stream()?;
        let name = self.source.name();
        let info = self
            .stream_info()
            .cloned()
            .ok_or_else(|| DecoderError::NotValid(name.clone()))?;

        let mut builder = FrameIndexBuilder::new(stream, info.codec, info.time_base, name.clone());
        let session = self.session_mut()?;
        while let Some(packet) = session
            .read_packet()
            .map_err(|e| DecoderError::session(&name, e))?
        {
            builder.push(&packet)?;
        }

        let index = builder.finish()?;
        self.num_frames = Some(index.len() as i64);
        self.index = Some(index);
        self.reset()
    }

    /// Reopen the source and return to frame 0.
    pub fn reset(&mut self) -> Result<()> {
        debug!("Reset: reopening {}", self.source.name());
        let stream = self.stream_id;

        if let MediaSource::Memory { file, .. } = &mut self.source {
            file.rewind();
        }

        let session = self
            .opener
            .open(&self.source, &self.options)
            .map_err(|e| DecoderError::Open {
                source_name: self.source.name(),
                message: e.to_string(),
            })?;

        self.session = Some(session);
        self.is_valid = true;
        self.can_seek = true;
        self.next_frame_idx = 0;
        self.resets += 1;

        if !self.select_video_stream(stream) {
            warn!("Could not reselect video stream of {} after reset", self.source.name());
            self.is_valid = false;
        }
        Ok(())
    }

    fn av_seek_frame(&mut self, timestamp: i64, frame_id: i64) -> Result<bool> {
        if !self.can_seek {
            debug!("Not seekable, returning directly");
            return Ok(false);
        }

        let stream = self.stream()?;
        self.seeks_issued += 1;
        let result = self.session_mut()?.seek(stream, timestamp);
        if let Err(e) = &result {
            debug!("Container seek to timestamp {} failed: {}", timestamp, e);
        }
        self.can_seek = result.is_ok();
        if !self.can_seek {
            return Ok(false);
        }

        debug!("Seeked to frame {}", frame_id);
        self.session_mut()?.flush();
        self.next_frame_idx = frame_id;
        Ok(true)
    }

    /// Position the decoder so the next decoded frame is `frame_id`.
    pub fn seek_frame(&mut self, frame_id: i64) -> Result<()> {
        trace!(
            "SeekFrame: seeking to frame {} (current={})",
            frame_id,
            self.next_frame_idx
        );

        let num_frames = self.num_frames()?;
        if frame_id < 0 || frame_id >= num_frames {
            return Err(DecoderError::InvalidSeek {
                frame_id,
                num_frames,
            });
        }

        if frame_id == self.next_frame_idx {
            trace!("Already at requested frame");
            return Ok(());
        }

        if self.next_frame_idx < 0 {
            self.reset()?;
        }

        let next = self.next_frame_idx;
        if frame_id < next || frame_id > next + MINIMUM_SEEK_LEAP {
            if let Some(index) = &self.index {
                let current_keyframe = index.keyframe_for(next as usize);
                let requested = index.entries()[frame_id as usize];
                let keyframe_id = requested.last_keyframe_id;
                let keyframe_pts = index.entries()[keyframe_id].pts;

                if keyframe_id as i64 > frame_id {
                    // Frame presents before the first keyframe; only frame 0 precedes it
                    debug!("Frame {} precedes first keyframe, resetting decoder", frame_id);
                    self.reset()?;
                } else if current_keyframe != Some(keyframe_id) || frame_id < next {
                    debug!(
                        "Seeking to key frame {} timestamp {} for requested frame {} timestamp {}",
                        keyframe_id, keyframe_pts, frame_id, requested.pts
                    );
                    if !self.av_seek_frame(keyframe_pts, keyframe_id as i64)? {
                        // Availability over strictness: a failed keyframe seek
                        // degrades to decoding from the start.
                        warn!(
                            "Failed to seek to keyframe {} timestamp {} in {}. Resetting decoder.",
                            keyframe_id,
                            keyframe_pts,
                            self.source.name()
                        );
                        self.reset()?;
                    }
                }
            } else if frame_id < next {
                debug!("No index & seeking backwards. Resetting decoder.");
                self.reset()?;
            }
        }

        trace!(
            "Skipping frames from {} to {}",
            self.next_frame_idx,
            frame_id
        );
        while self.next_frame_idx < frame_id {
            if !self.read_next_frame(None)? {
                return Err(DecoderError::Session {
                    source_name: self.source.name(),
                    message: format!("end of stream reached while skipping to frame {}", frame_id),
                });
            }
        }
        debug_assert_eq!(self.next_frame_idx, frame_id);
        Ok(())
    }

    /// Decode the next frame into `out` (or discard it).
    ///
    /// Returns `false` at end of stream, after which the position is invalid.
    pub fn read_next_frame(&mut self, out: Option<&mut [u8]>) -> Result<bool> {
        if self.next_frame_idx < 0 {
            return Ok(false);
        }
        if let Some(buf) = &out {
            let required = self.frame_size();
            if buf.len() < required {
                return Err(DecoderError::OutputTooSmall {
                    required,
                    actual: buf.len(),
                });
            }
        }

        let stream = self.stream()?;
        let name = self.source.name();
        let decoded = self
            .session_mut()?
            .decode_next_frame(stream, out)
            .map_err(|e| DecoderError::session(&name, e))?;

        if decoded {
            self.next_frame_idx += 1;
        } else {
            trace!("End of stream in {}", name);
            self.next_frame_idx = -1;
        }
        Ok(decoded)
    }

    /// Decode `frame_ids` into consecutive frame slots of `out`.
    ///
    /// Out-of-range ids are resolved with `boundary` against
    /// `[0, num_frames)`. Frames are decoded in ascending order, then written
    /// to the slot matching their position in `frame_ids`.
    ///
    /// Requesting `out_timestamps` from a decoder opened without an index
    /// first scans the whole stream to build one, which costs a full demux
    /// pass and a session reset.
    pub fn decode_frames(
        &mut self,
        out: &mut [u8],
        frame_ids: &[i64],
        boundary: BoundaryType,
        constant_frame: Option<&[u8]>,
        out_timestamps: Option<&mut [f64]>,
    ) -> Result<()> {
        let num_frames = self.num_frames()?;
        let mut sorted = Vec::with_capacity(frame_ids.len());
        for (slot, &frame_id) in frame_ids.iter().enumerate() {
            sorted.push((boundary::resolve(boundary, frame_id, 0, num_frames)?, slot));
        }
        sorted.sort();
        self.decode_frames_impl(out, &sorted, boundary, constant_frame, out_timestamps)
    }

    /// Decode `start, start + stride, ...` below `end`.
    #[allow(clippy::too_many_arguments)]
    pub fn decode_frame_range(
        &mut self,
        out: &mut [u8],
        start: i64,
        end: i64,
        stride: i64,
        boundary: BoundaryType,
        constant_frame: Option<&[u8]>,
        out_timestamps: Option<&mut [f64]>,
    ) -> Result<()> {
        if stride <= 0 {
            return Err(DecoderError::InvalidStride(stride));
        }
        debug!("DecodeFrames: start={}, end={}, stride={}", start, end, stride);
        let overflow = || DecoderError::RangeOverflow { start, end, stride };
        let span = end
            .checked_sub(start)
            .and_then(|span| span.checked_add(stride - 1))
            .ok_or_else(overflow)?;
        let count = (span / stride).max(0);
        // the last id is below `end`, so no step past it can overflow
        let ids: Vec<i64> = (0..count).map(|i| start + i * stride).collect();
        self.decode_frames(out, &ids, boundary, constant_frame, out_timestamps)
    }

    fn decode_frames_impl(
        &mut self,
        out: &mut [u8],
        sorted: &[(i64, usize)],
        boundary: BoundaryType,
        constant_frame: Option<&[u8]>,
        out_timestamps: Option<&mut [f64]>,
    ) -> Result<()> {
        if boundary == BoundaryType::Constant && constant_frame.is_none() {
            return Err(DecoderError::MissingConstantFrame);
        }

        let frame_size = self.frame_size();
        let required = frame_size * sorted.len();
        if out.len() < required {
            return Err(DecoderError::OutputTooSmall {
                required,
                actual: out.len(),
            });
        }

        if let Some(timestamps) = out_timestamps.as_deref() {
            if timestamps.len() < sorted.len() {
                return Err(DecoderError::OutputTooSmall {
                    required: sorted.len(),
                    actual: timestamps.len(),
                });
            }
            self.build_index()?;
        }

        let num_frames = self.num_frames()?;
        let mut last_out_slot: Option<usize> = None;
        for &(frame_id, slot) in sorted {
            let range = slot * frame_size..(slot + 1) * frame_size;
            if frame_id >= 0 && frame_id < num_frames {
                trace!("Decoding frame {} to position {}", frame_id, slot);
                self.seek_frame(frame_id)?;
                if !self.read_next_frame(Some(&mut out[range]))? {
                    return Err(DecoderError::Session {
                        source_name: self.source.name(),
                        message: format!("end of stream reached while decoding frame {}", frame_id),
                    });
                }
                last_out_slot = Some(slot);
            } else if frame_id < 0 {
                trace!("Copying constant frame to position {}", slot);
                let constant = constant_frame.ok_or(DecoderError::MissingConstantFrame)?;
                if constant.len() < frame_size {
                    return Err(DecoderError::OutputTooSmall {
                        required: frame_size,
                        actual: constant.len(),
                    });
                }
                out[range].copy_from_slice(&constant[..frame_size]);
            } else {
                let last = last_out_slot.ok_or_else(|| DecoderError::Session {
                    source_name: self.source.name(),
                    message: format!("no decoded frame to repeat for index {}", frame_id),
                })?;
                trace!("Copying last decoded frame {} to position {}", last, slot);
                out.copy_within(last * frame_size..(last + 1) * frame_size, range.start);
            }
        }

        if let Some(timestamps) = out_timestamps {
            if let Some(index) = &self.index {
                let last = index.len().saturating_sub(1);
                for &(frame_id, slot) in sorted {
                    timestamps[slot] = if frame_id >= 0 {
                        index
                            .timestamp_seconds((frame_id as usize).min(last))
                            .unwrap_or(-1.0)
                    } else {
                        -1.0
                    };
                }
            }
        }
        Ok(())
    }
}
