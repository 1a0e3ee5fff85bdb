/*
 * Stagepipe Video - random-access frame decoding
 *
 * Architecture:
 * - Boundary resolution for out-of-range frame indices
 * - Keyframe probing (length-prefixed NAL units)
 * - Frame index (sorted, keyframe-annotated, built once per source)
 * - Frames decoder (seek/skip state machine over an opaque demuxer session)
 */

pub mod boundary;
pub mod decoder;
pub mod error;
pub mod frame_index;
pub mod nal;
pub mod session;
pub mod source;

// Re-exports
pub use boundary::{resolve, BoundaryType, CONSTANT_SENTINEL};
pub use decoder::{FramesDecoder, MINIMUM_SEEK_LEAP};
pub use error::{BoundaryError, DecoderError, Result, SessionError};
pub use frame_index::{FrameIndex, FrameIndexBuilder, IndexEntry};
pub use nal::CodecId;
pub use session::{
    BackendLogLevel, DecoderOptions, ImageType, MediaType, Packet, Rational, SessionOpener,
    SessionResult, StreamInfo, VideoSession,
};
pub use source::{MediaSource, MemoryVideoFile, ReadOutcome, SeekMode};
