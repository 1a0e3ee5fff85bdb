//! Keyframe probing for length-prefixed NAL unit streams
//!
//! Containers carrying H.264/HEVC also flag recovery points that are not
//! decoder refresh points, so for those codecs a flagged packet only counts
//! once one of its NAL units confirms it. Every NAL unit is prefixed by a
//! 4-byte big-endian length.

use serde::{Deserialize, Serialize};

const NAL_LENGTH_SIZE: usize = 4;

const H264_NAL_TYPE_MASK: u8 = 0x1F;
const H264_NAL_IDR: u8 = 5;

const HEVC_NAL_TYPE_MASK: u8 = 0x3F;
const HEVC_NAL_IRAP_FIRST: u8 = 16;
const HEVC_NAL_IRAP_LAST: u8 = 21;

/// Codec of the selected stream, as far as keyframe probing cares
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodecId {
    H264,
    Hevc,
    Other(String),
}

impl CodecId {
    pub fn name(&self) -> &str {
        match self {
            Self::H264 => "h264",
            Self::Hevc => "hevc",
            Self::Other(name) => name,
        }
    }

    /// Whether the container keyframe flag must be confirmed by NAL inspection
    pub fn probes_nal_units(&self) -> bool {
        matches!(self, Self::H264 | Self::Hevc)
    }
}

impl std::fmt::Display for CodecId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

fn read_nal_unit_length(buf: &[u8]) -> usize {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize
}

/// Iterate over the header byte of every complete NAL unit in `data`.
///
/// Stops at the first unit whose declared size overruns the packet.
pub fn nal_unit_headers(data: &[u8]) -> impl Iterator<Item = u8> + '_ {
    let mut start = 0usize;
    std::iter::from_fn(move || {
        while start + NAL_LENGTH_SIZE < data.len() {
            let size = read_nal_unit_length(&data[start..]);
            let unit = start + NAL_LENGTH_SIZE;
            if unit + size > data.len() {
                start = data.len();
                return None;
            }
            start = unit + size;
            if size > 0 {
                return Some(data[unit]);
            }
        }
        None
    })
}

fn is_h264_keyframe(header: u8) -> bool {
    header & H264_NAL_TYPE_MASK == H264_NAL_IDR
}

fn is_hevc_keyframe(header: u8) -> bool {
    let nal_type = (header >> 1) & HEVC_NAL_TYPE_MASK;
    (HEVC_NAL_IRAP_FIRST..=HEVC_NAL_IRAP_LAST).contains(&nal_type)
}

/// Decide whether a packet starts a keyframe.
///
/// Only packets the container flagged are candidates: the demuxer can seek
/// to nothing else.
pub fn is_keyframe(codec: &CodecId, data: &[u8], container_flag: bool) -> bool {
    match codec {
        CodecId::H264 => container_flag && nal_unit_headers(data).any(is_h264_keyframe),
        CodecId::Hevc => container_flag && nal_unit_headers(data).any(is_hevc_keyframe),
        CodecId::Other(_) => container_flag,
    }
}
