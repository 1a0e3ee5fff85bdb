//! In-memory fake container and demuxer session for decoder tests
//!
//! Videos are serialized into a small binary container and opened through
//! `MediaSource::Memory`, so every session reads its packets back through a
//! `MemoryVideoFile`. Decoded frames are filled with their presentation index.

#![allow(dead_code)]

use stagepipe_video::{
    CodecId, DecoderOptions, MediaSource, MediaType, MemoryVideoFile, Packet, Rational,
    ReadOutcome, SessionError, SessionOpener, SessionResult, StreamInfo, VideoSession,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

const MAGIC: &[u8; 4] = b"SPV1";

#[derive(Debug, Clone)]
pub struct FakeVideo {
    pub width: u32,
    pub height: u32,
    pub time_base: Rational,
    pub declared_frames: i64,
    /// Adds an audio stream in front of the video stream
    pub with_audio: bool,
    pub codec: CodecId,
    pub packets: Vec<Packet>,
}

impl FakeVideo {
    /// Constant frame rate video, pts = 10 * i, keyframe every `gop` frames
    pub fn cfr(num_frames: usize, gop: usize) -> Self {
        let packets = (0..num_frames)
            .map(|i| video_packet(Some(10 * i as i64), i % gop == 0))
            .collect();
        Self {
            width: 4,
            height: 2,
            time_base: Rational::new(1, 100),
            declared_frames: 0,
            with_audio: false,
            codec: CodecId::Other("fake".to_string()),
            packets,
        }
    }

    /// H.264 video, pts = 10 * i. The container flags the frames in
    /// `flagged`, and the frames in `idr` carry an IDR slice.
    pub fn h264(num_frames: usize, flagged: &[usize], idr: &[usize]) -> Self {
        let mut video = Self::cfr(num_frames, usize::MAX);
        video.codec = CodecId::H264;
        video.packets = (0..num_frames)
            .map(|i| {
                let mut packet = video_packet(Some(10 * i as i64), flagged.contains(&i));
                packet.data = h264_access_unit(idr.contains(&i));
                packet
            })
            .collect();
        video
    }

    pub fn video_stream(&self) -> usize {
        usize::from(self.with_audio)
    }

    pub fn frame_size(&self) -> usize {
        (self.width * self.height * 3) as usize
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = MAGIC.to_vec();
        out.extend(self.width.to_le_bytes());
        out.extend(self.height.to_le_bytes());
        out.extend(self.time_base.num.to_le_bytes());
        out.extend(self.time_base.den.to_le_bytes());
        out.extend(self.declared_frames.to_le_bytes());
        out.push(u8::from(self.with_audio));
        out.push(codec_tag(&self.codec));
        out.extend((self.packets.len() as u32).to_le_bytes());
        for p in &self.packets {
            out.push(p.stream_index as u8);
            let flags = u8::from(p.is_keyframe) | (u8::from(p.pts.is_some()) << 1) | (u8::from(p.dts.is_some()) << 2);
            out.push(flags);
            out.extend(p.pts.unwrap_or(0).to_le_bytes());
            out.extend(p.dts.unwrap_or(0).to_le_bytes());
            out.extend((p.data.len() as u32).to_le_bytes());
            out.extend(&p.data);
        }
        out
    }

    pub fn source(&self) -> MediaSource {
        MediaSource::memory(self.to_bytes(), "fake.spv")
    }
}

/// Length-prefixed NAL units of one access unit: SPS then an IDR or a
/// non-IDR slice
pub fn h264_access_unit(idr: bool) -> Vec<u8> {
    let mut out = Vec::new();
    for (header, payload) in [(0x67u8, 3usize), (if idr { 0x65 } else { 0x41 }, 6)] {
        out.extend(((payload + 1) as u32).to_be_bytes());
        out.push(header);
        out.extend(std::iter::repeat(0xAB).take(payload));
    }
    out
}

fn codec_tag(codec: &CodecId) -> u8 {
    match codec {
        CodecId::Other(_) => 0,
        CodecId::H264 => 1,
        CodecId::Hevc => 2,
    }
}

fn codec_from_tag(tag: u8) -> CodecId {
    match tag {
        1 => CodecId::H264,
        2 => CodecId::Hevc,
        _ => CodecId::Other("fake".to_string()),
    }
}

pub fn video_packet(pts: Option<i64>, key: bool) -> Packet {
    Packet {
        stream_index: 0,
        pts,
        dts: None,
        is_keyframe: key,
        data: vec![0u8; 8],
    }
}

struct Reader {
    file: MemoryVideoFile,
}

impl Reader {
    fn take<const N: usize>(&mut self) -> SessionResult<[u8; N]> {
        let mut buf = [0u8; N];
        match self.file.read(&mut buf) {
            ReadOutcome::Bytes(n) if n == N => Ok(buf),
            _ => Err(SessionError::new("truncated container")),
        }
    }

    fn bytes(&mut self, len: usize) -> SessionResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        if len == 0 {
            return Ok(buf);
        }
        match self.file.read(&mut buf) {
            ReadOutcome::Bytes(n) if n == len => Ok(buf),
            _ => Err(SessionError::new("truncated packet")),
        }
    }
}

fn parse(mut file: MemoryVideoFile) -> SessionResult<FakeVideo> {
    file.rewind();
    let mut r = Reader { file };
    if &r.take::<4>()? != MAGIC {
        return Err(SessionError::new("Invalid data found when processing input"));
    }
    let width = u32::from_le_bytes(r.take()?);
    let height = u32::from_le_bytes(r.take()?);
    let num = i32::from_le_bytes(r.take()?);
    let den = i32::from_le_bytes(r.take()?);
    let declared_frames = i64::from_le_bytes(r.take()?);
    let with_audio = r.take::<1>()?[0] != 0;
    let codec = codec_from_tag(r.take::<1>()?[0]);
    let count = u32::from_le_bytes(r.take()?);
    let mut packets = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let [stream] = r.take::<1>()?;
        let [flags] = r.take::<1>()?;
        let pts = i64::from_le_bytes(r.take()?);
        let dts = i64::from_le_bytes(r.take()?);
        let len = u32::from_le_bytes(r.take()?) as usize;
        let data = r.bytes(len)?;
        packets.push(Packet {
            stream_index: stream as usize,
            pts: (flags & 2 != 0).then_some(pts),
            dts: (flags & 4 != 0).then_some(dts),
            is_keyframe: flags & 1 != 0,
            data,
        });
    }
    Ok(FakeVideo {
        width,
        height,
        time_base: Rational::new(num, den),
        declared_frames,
        with_audio,
        codec,
        packets,
    })
}

/// Counters shared by every session an opener creates
#[derive(Debug, Default)]
pub struct FakeStats {
    pub opens: AtomicUsize,
    pub seeks: AtomicUsize,
    pub packets_read: AtomicUsize,
    pub frames_decoded: AtomicUsize,
    pub fail_seeks: AtomicBool,
    /// Dimensions reported only after `find_stream_info`
    pub lazy_dimensions: AtomicBool,
}

impl FakeStats {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn seeks(&self) -> usize {
        self.seeks.load(Ordering::SeqCst)
    }

    pub fn packets_read(&self) -> usize {
        self.packets_read.load(Ordering::SeqCst)
    }
}

#[derive(Default, Clone)]
pub struct FakeOpener {
    pub stats: Arc<FakeStats>,
}

impl FakeOpener {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionOpener for FakeOpener {
    fn open(&self, source: &MediaSource, _options: &DecoderOptions) -> SessionResult<Box<dyn VideoSession>> {
        let video = match source {
            MediaSource::Memory { file, .. } => parse(file.clone())?,
            MediaSource::File(path) => {
                return Err(SessionError::new(format!("{}: No such file or directory", path.display())))
            }
        };
        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession::new(video, self.stats.clone())))
    }
}

pub struct FakeSession {
    streams: Vec<StreamInfo>,
    video_stream: usize,
    packets: Vec<Packet>,
    read_pos: usize,
    /// Presentation-ordered (pts, keyframe) of the video stream
    frames: Vec<(i64, bool)>,
    decode_pos: usize,
    real_dimensions: (u32, u32),
    stats: Arc<FakeStats>,
}

impl FakeSession {
    fn new(video: FakeVideo, stats: Arc<FakeStats>) -> Self {
        let lazy = stats.lazy_dimensions.load(Ordering::SeqCst);
        let video_info = StreamInfo {
            media_type: MediaType::Video,
            codec: video.codec.clone(),
            width: if lazy { 0 } else { video.width },
            height: if lazy { 0 } else { video.height },
            time_base: video.time_base,
            nb_frames: video.declared_frames,
            bit_rate: 0,
            sample_rate: 0,
        };
        let mut streams = Vec::new();
        if video.with_audio {
            streams.push(StreamInfo {
                media_type: MediaType::Audio,
                codec: CodecId::Other("aac".to_string()),
                width: 0,
                height: 0,
                time_base: Rational::new(1, 48_000),
                nb_frames: 0,
                bit_rate: 128_000,
                sample_rate: 48_000,
            });
        }
        let video_stream = streams.len();
        streams.push(video_info);

        let mut frames: Vec<(i64, bool)> = video
            .packets
            .iter()
            .filter(|p| p.stream_index == video_stream)
            .filter_map(|p| p.pts.or(p.dts).map(|ts| (ts, p.is_keyframe)))
            .filter(|(ts, _)| *ts >= 0)
            .collect();
        frames.sort_by_key(|(ts, _)| *ts);

        Self {
            streams,
            video_stream,
            packets: video.packets,
            read_pos: 0,
            frames,
            decode_pos: 0,
            real_dimensions: (video.width, video.height),
            stats,
        }
    }
}

impl VideoSession for FakeSession {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn find_best_video_stream(&self) -> Option<usize> {
        self.streams
            .iter()
            .position(|s| s.media_type == MediaType::Video)
    }

    fn find_stream_info(&mut self) -> SessionResult<()> {
        let (w, h) = self.real_dimensions;
        let info = &mut self.streams[self.video_stream];
        info.width = w;
        info.height = h;
        Ok(())
    }

    fn read_packet(&mut self) -> SessionResult<Option<Packet>> {
        let packet = self.packets.get(self.read_pos).cloned();
        if packet.is_some() {
            self.read_pos += 1;
            self.stats.packets_read.fetch_add(1, Ordering::SeqCst);
        }
        Ok(packet)
    }

    fn seek(&mut self, stream: usize, timestamp: i64) -> SessionResult<()> {
        self.stats.seeks.fetch_add(1, Ordering::SeqCst);
        if self.stats.fail_seeks.load(Ordering::SeqCst) {
            return Err(SessionError::new("Operation not permitted"));
        }
        if stream != self.video_stream {
            return Err(SessionError::new("seek on non-video stream"));
        }
        let target = self
            .frames
            .iter()
            .rposition(|&(ts, key)| key && ts <= timestamp)
            .ok_or_else(|| SessionError::new("no keyframe before timestamp"))?;
        self.decode_pos = target;
        Ok(())
    }

    fn flush(&mut self) {}

    fn decode_next_frame(&mut self, stream: usize, out: Option<&mut [u8]>) -> SessionResult<bool> {
        if stream != self.video_stream {
            return Err(SessionError::new("decode on non-video stream"));
        }
        if self.decode_pos >= self.frames.len() {
            return Ok(false);
        }
        if let Some(buf) = out {
            buf.fill(self.decode_pos as u8);
        }
        self.decode_pos += 1;
        self.stats.frames_decoded.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}
