use thiserror::Error;

pub type Result<T> = std::result::Result<T, DecoderError>;

/// Out-of-range index under a boundary policy that rejects it
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BoundaryError {
    #[error(
        "Unexpected out-of-bounds frame index {index} for pad_mode = 'none' and a sample \
         containing a ROI with {len} frames. Range of valid frame indices for this sample is \
         [{start}, {end}). Change `pad_mode` to other than 'none' for out-of-bounds sampling."
    )]
    OutOfBounds {
        index: i64,
        start: i64,
        end: i64,
        len: i64,
    },

    #[error("Empty index range [{start}, {end})")]
    EmptyRange { start: i64, end: i64 },

    #[error("Invalid boundary type: {0}")]
    UnknownType(String),
}

#[derive(Error, Debug)]
pub enum DecoderError {
    #[error("Invalid seek frame id. frame_id = {frame_id}, num_frames = {num_frames}")]
    InvalidSeek { frame_id: i64, num_frames: i64 },

    #[error("Video file \"{source_name}\" has no valid timestamps")]
    NoTimestamps { source_name: String },

    #[error("No valid frames found in video file \"{source_name}\"")]
    NoFrames { source_name: String },

    #[error("No keyframes found in video file \"{source_name}\"")]
    NoKeyframes { source_name: String },

    #[error("Unsupported seeking method in memory file. Seeking method: {0}")]
    UnsupportedSeekMode(i32),

    #[error("Invalid position in memory file: {0}")]
    InvalidPosition(i64),

    #[error("Frame range [{start}, {end}) with stride {stride} overflows")]
    RangeOverflow { start: i64, end: i64, stride: i64 },

    #[error("Constant frame must be provided if boundary type is CONSTANT")]
    MissingConstantFrame,

    #[error("Could not open video file \"{source_name}\" due to: {message}")]
    Open { source_name: String, message: String },

    #[error("\"{0}\" is not a valid video")]
    NotValid(String),

    #[error("Decoding \"{source_name}\" failed: {message}")]
    Session { source_name: String, message: String },

    #[error("Output buffer holds {actual} bytes, {required} required")]
    OutputTooSmall { required: usize, actual: usize },

    #[error("Invalid stride {0}, must be positive")]
    InvalidStride(i64),

    #[error(transparent)]
    Boundary(#[from] BoundaryError),
}

impl DecoderError {
    pub fn session<E: std::fmt::Display>(source_name: &str, e: E) -> Self {
        Self::Session {
            source_name: source_name.to_string(),
            message: e.to_string(),
        }
    }
}

/// Failure reported by the demuxer/decoder backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct SessionError {
    pub message: String,
}

impl SessionError {
    pub fn new<E: std::fmt::Display>(e: E) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}
