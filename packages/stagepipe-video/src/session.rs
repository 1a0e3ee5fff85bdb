//! Contract of the demuxer/decoder backend
//!
//! The frames decoder never parses containers itself. It drives a
//! [`VideoSession`] obtained from a [`SessionOpener`], reopening it whenever the
//! decoder has to return to position zero.

use crate::error::SessionError;
use crate::nal::CodecId;
use crate::source::MediaSource;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

pub type SessionResult<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaType {
    Unknown,
    Video,
    Audio,
    Data,
    Subtitle,
    Attachment,
}

impl MediaType {
    /// Unknown streams are given the benefit of the doubt
    pub fn may_be_video(&self) -> bool {
        matches!(self, Self::Video | Self::Unknown)
    }
}

/// Stream time base as a fraction of a second
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    pub fn to_seconds(&self, timestamp: i64) -> f64 {
        if self.den == 0 {
            return 0.0;
        }
        timestamp as f64 * self.num as f64 / self.den as f64
    }
}

impl Default for Rational {
    fn default() -> Self {
        Self { num: 1, den: 1 }
    }
}

/// Codec parameters of one container stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub media_type: MediaType,
    pub codec: CodecId,
    pub width: u32,
    pub height: u32,
    pub time_base: Rational,
    /// Frame count declared by the container, 0 when unknown
    pub nb_frames: i64,
    pub bit_rate: i64,
    pub sample_rate: i32,
}

/// One demuxed packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub stream_index: usize,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    /// Keyframe flag as set by the container
    pub is_keyframe: bool,
    pub data: Vec<u8>,
}

/// Log verbosity handed to the backend when a session is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendLogLevel {
    Quiet,
    #[default]
    Error,
    Warning,
    Info,
    Debug,
}

/// Pixel layout of decoded frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ImageType {
    #[default]
    Rgb,
    YCbCr,
}

impl ImageType {
    pub fn channels(&self) -> usize {
        3
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderOptions {
    pub image_type: ImageType,
    pub log_level: BackendLogLevel,
}

/// An open demuxer/decoder over one source
pub trait VideoSession: Send {
    fn streams(&self) -> &[StreamInfo];

    /// Index of the best video stream, if any
    fn find_best_video_stream(&self) -> Option<usize>;

    /// Probe the source for missing stream parameters (e.g. dimensions)
    fn find_stream_info(&mut self) -> SessionResult<()>;

    /// Next packet in storage order, `None` at end of stream
    fn read_packet(&mut self) -> SessionResult<Option<Packet>>;

    /// Seek `stream` to the last keyframe at or before `timestamp`
    fn seek(&mut self, stream: usize, timestamp: i64) -> SessionResult<()>;

    /// Drop decoder state buffered before a seek
    fn flush(&mut self);

    /// Decode the next frame of `stream` in presentation order.
    ///
    /// Writes pixels into `out` when given. Returns `false` at end of stream.
    fn decode_next_frame(&mut self, stream: usize, out: Option<&mut [u8]>) -> SessionResult<bool>;
}

/// Opens (and reopens) sessions over a media source
pub trait SessionOpener: Send + Sync {
    fn open(
        &self,
        source: &MediaSource,
        options: &DecoderOptions,
    ) -> SessionResult<Box<dyn VideoSession>>;
}

/// Human-readable dump of every stream in a session
pub fn describe_streams(session: &dyn VideoSession) -> String {
    let streams = session.streams();
    let mut out = String::new();
    let _ = writeln!(out, "Number of streams: {}", streams.len());
    for (i, s) in streams.iter().enumerate() {
        let _ = writeln!(out, "Stream {}: {:?}", i, s.media_type);
        let _ = writeln!(out, "  Codec: {}", s.codec);
        let _ = writeln!(out, "  Width: {}", s.width);
        let _ = writeln!(out, "  Height: {}", s.height);
        let _ = writeln!(out, "  Sample Rate: {}", s.sample_rate);
        let _ = writeln!(out, "  Bit Rate: {}", s.bit_rate);
    }
    out
}
