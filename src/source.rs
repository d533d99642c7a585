//! Where camera frames come from.
//!
//! Every source is driven from a camera's capture thread, so the HTTP based
//! ones use the blocking reqwest client and are only opened on that thread.

use crate::image::{Image, decode_image, is_jpeg};
use anyhow::{Context, anyhow, bail};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    io::Read,
    path::PathBuf,
    time::{Duration, Instant},
};
use tracing::{debug, info};

const DEFAULT_SOURCE_FPS: f32 = 10.0;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(10);
const MJPEG_READ_CHUNK: usize = 16 * 1024;
const MAX_MJPEG_FRAME_BYTES: usize = 16 * 1024 * 1024;
const MAX_PART_HEADER_BYTES: usize = 1024;

fn default_fps() -> f32 {
    DEFAULT_SOURCE_FPS
}

fn default_loop_frames() -> bool {
    true
}

/// Camera definition as it appears in start requests and the config file.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CameraSource {
    /// `multipart/x-mixed-replace` MJPEG over HTTP.
    Mjpeg { url: String },
    /// A URL returning a single JPEG, polled at `fps`.
    Snapshot {
        url: String,
        #[serde(default = "default_fps")]
        fps: f32,
    },
    /// JPEG files replayed in file name order.
    Directory {
        path: PathBuf,
        #[serde(default = "default_fps")]
        fps: f32,
        #[serde(default = "default_loop_frames")]
        loop_frames: bool,
    },
}

impl fmt::Display for CameraSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CameraSource::Mjpeg { url } => write!(f, "mjpeg {url}"),
            CameraSource::Snapshot { url, fps } => write!(f, "snapshot {url} @ {fps} fps"),
            CameraSource::Directory { path, fps, .. } => {
                write!(f, "directory {} @ {fps} fps", path.display())
            }
        }
    }
}

impl CameraSource {
    pub fn build(&self) -> anyhow::Result<Box<dyn FrameSource>> {
        let source: Box<dyn FrameSource> = match self {
            CameraSource::Mjpeg { url } => Box::new(MjpegSource::new(url.clone())),
            CameraSource::Snapshot { url, fps } => {
                Box::new(SnapshotSource::new(url.clone(), frame_interval(*fps)?))
            }
            CameraSource::Directory {
                path,
                fps,
                loop_frames,
            } => Box::new(DirectorySource::new(
                path.clone(),
                frame_interval(*fps)?,
                *loop_frames,
            )),
        };
        Ok(source)
    }
}

fn frame_interval(fps: f32) -> anyhow::Result<Duration> {
    if !fps.is_finite() || fps <= 0.0 {
        bail!("Source fps must be a positive number, got {fps}");
    }
    Duration::try_from_secs_f32(1.0 / fps)
        .map_err(|err| anyhow!("Source fps {fps} is out of range: {err}"))
}

/// A blocking producer of decoded frames.
pub trait FrameSource: Send {
    /// Connects or scans, called once on the capture thread before any frame.
    fn open(&mut self) -> anyhow::Result<()>;

    /// Blocks until the next frame is available.
    fn next_frame(&mut self) -> anyhow::Result<Image>;
}

/// Sleeps what is left of `interval` since the previous frame.
fn pace(last_frame_at: &mut Option<Instant>, interval: Duration) {
    if let Some(last) = *last_frame_at {
        let elapsed = last.elapsed();
        if elapsed < interval {
            std::thread::sleep(interval - elapsed);
        }
    }
    *last_frame_at = Some(Instant::now());
}

/// Pulls complete JPEG images out of a byte stream.
///
/// A part's `Content-Length` header decides where the image ends. Without one
/// the image runs from SOI to the first EOI, and anything between images is
/// skipped, so this works for any MJPEG framing.
pub struct MjpegReader<R> {
    reader: R,
    buffer: Vec<u8>,
    chunk: Vec<u8>,
}

impl<R: Read> MjpegReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(MJPEG_READ_CHUNK * 4),
            chunk: vec![0; MJPEG_READ_CHUNK],
        }
    }

    pub fn next_jpeg(&mut self) -> anyhow::Result<Bytes> {
        loop {
            match find_marker(&self.buffer, 0, 0xD8) {
                Some(start) => {
                    let end = match content_length(&self.buffer[..start]) {
                        Some(length) if length > MAX_MJPEG_FRAME_BYTES => {
                            bail!("MJPEG part of {length} bytes exceeds {MAX_MJPEG_FRAME_BYTES}")
                        }
                        Some(length) if length >= 4 => {
                            (self.buffer.len() >= start + length).then_some(start + length)
                        }
                        _ => find_marker(&self.buffer, start + 2, 0xD9).map(|eoi| eoi + 2),
                    };
                    if let Some(end) = end {
                        let jpeg = Bytes::copy_from_slice(&self.buffer[start..end]);
                        self.buffer.drain(..end);
                        return Ok(jpeg);
                    }
                }
                None if self.buffer.len() > MAX_PART_HEADER_BYTES => {
                    // Part headers sit right before SOI, drop what is older
                    let discard = self.buffer.len() - MAX_PART_HEADER_BYTES;
                    self.buffer.drain(..discard);
                }
                None => {}
            }

            if self.buffer.len() > MAX_MJPEG_FRAME_BYTES + MAX_PART_HEADER_BYTES {
                bail!("MJPEG frame exceeds {MAX_MJPEG_FRAME_BYTES} bytes");
            }

            let read = self.reader.read(&mut self.chunk)?;
            if read == 0 {
                bail!("MJPEG stream ended");
            }
            self.buffer.extend_from_slice(&self.chunk[..read]);
        }
    }
}

/// Last `Content-Length` among the part headers in `headers`.
fn content_length(headers: &[u8]) -> Option<usize> {
    String::from_utf8_lossy(headers)
        .lines()
        .filter_map(|line| line.split_once(':'))
        .filter(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .filter_map(|(_, value)| value.trim().parse().ok())
        .last()
}

fn find_marker(data: &[u8], from: usize, marker: u8) -> Option<usize> {
    if from >= data.len() {
        return None;
    }
    data[from..]
        .windows(2)
        .position(|pair| pair[0] == 0xFF && pair[1] == marker)
        .map(|position| position + from)
}

pub struct MjpegSource {
    url: String,
    reader: Option<MjpegReader<reqwest::blocking::Response>>,
    frame_count: u64,
}

impl MjpegSource {
    pub fn new(url: String) -> Self {
        Self {
            url,
            reader: None,
            frame_count: 0,
        }
    }

    fn connect(&mut self) -> anyhow::Result<()> {
        // The stream never completes, only the connect phase is bounded
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(None)
            .build()?;
        let response = client
            .get(&self.url)
            .send()
            .with_context(|| format!("Failed to connect to {}", self.url))?
            .error_for_status()?;
        info!(url = %self.url, "Connected to MJPEG stream");
        self.reader = Some(MjpegReader::new(response));
        Ok(())
    }
}

impl FrameSource for MjpegSource {
    fn open(&mut self) -> anyhow::Result<()> {
        self.connect()
    }

    fn next_frame(&mut self) -> anyhow::Result<Image> {
        if self.reader.is_none() {
            self.connect()?;
        }
        let Some(reader) = self.reader.as_mut() else {
            bail!("MJPEG stream {} is not connected", self.url);
        };
        let jpeg = match reader.next_jpeg() {
            Ok(jpeg) => jpeg,
            Err(err) => {
                // Reconnect on the next call
                self.reader = None;
                return Err(err);
            }
        };

        self.frame_count += 1;
        let mut image = Image::default();
        decode_image(Some(format!("frame_{}.jpg", self.frame_count)), jpeg, &mut image)?;
        Ok(image)
    }
}

pub struct SnapshotSource {
    url: String,
    interval: Duration,
    client: Option<reqwest::blocking::Client>,
    last_frame_at: Option<Instant>,
}

impl SnapshotSource {
    pub fn new(url: String, interval: Duration) -> Self {
        Self {
            url,
            interval,
            client: None,
            last_frame_at: None,
        }
    }

    fn fetch(&self, client: &reqwest::blocking::Client) -> anyhow::Result<Bytes> {
        let response = client
            .get(&self.url)
            .send()
            .with_context(|| format!("Failed to fetch snapshot from {}", self.url))?
            .error_for_status()?;
        Ok(response.bytes()?)
    }
}

impl FrameSource for SnapshotSource {
    fn open(&mut self) -> anyhow::Result<()> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(SNAPSHOT_TIMEOUT)
            .build()?;
        // One fetch proves the URL serves something
        self.fetch(&client)?;
        self.client = Some(client);
        Ok(())
    }

    fn next_frame(&mut self) -> anyhow::Result<Image> {
        pace(&mut self.last_frame_at, self.interval);
        let Some(client) = self.client.as_ref() else {
            bail!("Snapshot source {} is not open", self.url);
        };
        let data = self.fetch(client)?;
        let mut image = Image::default();
        decode_image(Some("snapshot.jpg".to_string()), data, &mut image)?;
        Ok(image)
    }
}

pub struct DirectorySource {
    path: PathBuf,
    interval: Duration,
    loop_frames: bool,
    files: Vec<PathBuf>,
    index: usize,
    last_frame_at: Option<Instant>,
}

impl DirectorySource {
    pub fn new(path: PathBuf, interval: Duration, loop_frames: bool) -> Self {
        Self {
            path,
            interval,
            loop_frames,
            files: Vec::new(),
            index: 0,
            last_frame_at: None,
        }
    }
}

impl FrameSource for DirectorySource {
    fn open(&mut self) -> anyhow::Result<()> {
        let entries = std::fs::read_dir(&self.path)
            .with_context(|| format!("Failed to read directory {}", self.path.display()))?;
        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_jpeg_file = path.is_file()
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(is_jpeg);
            if is_jpeg_file {
                files.push(path);
            }
        }
        if files.is_empty() {
            bail!("No JPEG files found in {}", self.path.display());
        }
        files.sort();
        debug!(path = %self.path.display(), frames = files.len(), "Directory source opened");
        self.files = files;
        self.index = 0;
        Ok(())
    }

    fn next_frame(&mut self) -> anyhow::Result<Image> {
        if self.index >= self.files.len() {
            if !self.loop_frames || self.files.is_empty() {
                bail!("No more frames in {}", self.path.display());
            }
            self.index = 0;
        }
        pace(&mut self.last_frame_at, self.interval);

        let file = &self.files[self.index];
        self.index += 1;
        let data = std::fs::read(file)
            .with_context(|| format!("Failed to read frame {}", file.display()))?;
        let name = file
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string);
        let mut image = Image::default();
        decode_image(name, Bytes::from(data), &mut image)?;
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::encode_jpeg;
    use std::io::Cursor;

    fn jpeg(width: usize, height: usize, value: u8) -> Bytes {
        let image = Image::from_rgb(width, height, vec![value; width * height * 3]).unwrap();
        encode_jpeg(&image, 90).unwrap()
    }

    fn multipart_stream(frames: &[Bytes]) -> Vec<u8> {
        let mut stream = Vec::new();
        for frame in frames {
            stream.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n");
            stream.extend_from_slice(format!("Content-Length: {}\r\n\r\n", frame.len()).as_bytes());
            stream.extend_from_slice(frame);
            stream.extend_from_slice(b"\r\n");
        }
        stream
    }

    /// Hands out at most `step` bytes per read.
    struct Trickle {
        data: Vec<u8>,
        position: usize,
        step: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let remaining = self.data.len() - self.position;
            let n = remaining.min(self.step).min(buf.len());
            buf[..n].copy_from_slice(&self.data[self.position..self.position + n]);
            self.position += n;
            Ok(n)
        }
    }

    #[test]
    fn mjpeg_reader_extracts_frames_between_boundaries() {
        let frames = [jpeg(8, 8, 10), jpeg(16, 8, 200)];
        let mut reader = MjpegReader::new(Cursor::new(multipart_stream(&frames)));
        assert_eq!(reader.next_jpeg().unwrap(), frames[0]);
        assert_eq!(reader.next_jpeg().unwrap(), frames[1]);
        assert!(reader.next_jpeg().is_err());
    }

    #[test]
    fn mjpeg_reader_handles_partial_reads() {
        let frames = [jpeg(8, 8, 10), jpeg(8, 16, 60), jpeg(24, 8, 120)];
        let mut reader = MjpegReader::new(Trickle {
            data: multipart_stream(&frames),
            position: 0,
            step: 3,
        });
        for frame in frames.iter() {
            assert_eq!(&reader.next_jpeg().unwrap(), frame);
        }
    }

    #[test]
    fn mjpeg_reader_skips_leading_garbage() {
        let frame = jpeg(8, 8, 33);
        let mut data = vec![0x00, 0xFF, 0x12, b'x', 0xFF];
        data.extend_from_slice(&frame);
        let mut reader = MjpegReader::new(Cursor::new(data));
        assert_eq!(reader.next_jpeg().unwrap(), frame);
    }

    /// `main` with `thumbnail` embedded in an APP1 segment, as EXIF does.
    fn jpeg_with_thumbnail(main: &Bytes, thumbnail: &Bytes) -> Bytes {
        let segment_length = (2 + 6 + thumbnail.len()) as u16;
        let mut data = vec![0xFF, 0xD8, 0xFF, 0xE1];
        data.extend_from_slice(&segment_length.to_be_bytes());
        data.extend_from_slice(b"Exif\0\0");
        data.extend_from_slice(thumbnail);
        data.extend_from_slice(&main[2..]);
        Bytes::from(data)
    }

    #[test]
    fn mjpeg_reader_uses_content_length_past_embedded_thumbnails() {
        let frames = [
            jpeg_with_thumbnail(&jpeg(32, 16, 90), &jpeg(8, 8, 20)),
            jpeg(8, 8, 70),
        ];
        let mut reader = MjpegReader::new(Trickle {
            data: multipart_stream(&frames),
            position: 0,
            step: 5,
        });
        assert_eq!(reader.next_jpeg().unwrap(), frames[0]);
        assert_eq!(reader.next_jpeg().unwrap(), frames[1]);
    }

    #[test]
    fn content_length_is_read_case_insensitively() {
        let headers = b"\r\n--frame\r\ncontent-type: image/jpeg\r\nCONTENT-LENGTH: 1234\r\n\r\n";
        assert_eq!(content_length(headers), Some(1234));
        assert_eq!(content_length(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n"), None);
    }

    #[test]
    fn camera_source_is_tagged_by_type() {
        let source: CameraSource =
            serde_json::from_str(r#"{"type": "mjpeg", "url": "http://cam/video"}"#).unwrap();
        assert_eq!(
            source,
            CameraSource::Mjpeg {
                url: "http://cam/video".into()
            }
        );

        let source: CameraSource =
            serde_json::from_str(r#"{"type": "directory", "path": "/frames"}"#).unwrap();
        assert_eq!(
            source,
            CameraSource::Directory {
                path: "/frames".into(),
                fps: DEFAULT_SOURCE_FPS,
                loop_frames: true
            }
        );
        assert!(serde_json::from_str::<CameraSource>(r#"{"type": "usb"}"#).is_err());
    }

    #[test]
    fn non_positive_fps_is_rejected() {
        let source = CameraSource::Snapshot {
            url: "http://cam/snapshot.jpg".into(),
            fps: 0.0,
        };
        assert!(source.build().is_err());
    }

    #[test]
    fn fps_too_small_for_a_frame_interval_is_rejected() {
        let source = CameraSource::Directory {
            path: "/frames".into(),
            fps: 1e-20,
            loop_frames: true,
        };
        let err = source.build().err().unwrap();
        assert!(err.to_string().contains("out of range"));
    }

    fn write_frames(dir: &std::path::Path) {
        std::fs::write(dir.join("b.jpg"), jpeg(16, 8, 50)).unwrap();
        std::fs::write(dir.join("a.jpg"), jpeg(8, 8, 50)).unwrap();
        std::fs::write(dir.join("notes.txt"), b"not a frame").unwrap();
    }

    #[test]
    fn directory_source_replays_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        write_frames(dir.path());

        let mut source = DirectorySource::new(dir.path().to_path_buf(), Duration::ZERO, true);
        source.open().unwrap();
        let widths: Vec<usize> = (0..3).map(|_| source.next_frame().unwrap().width).collect();
        assert_eq!(widths, vec![8, 16, 8]);
    }

    #[test]
    fn directory_source_without_loop_runs_dry() {
        let dir = tempfile::tempdir().unwrap();
        write_frames(dir.path());

        let mut source = DirectorySource::new(dir.path().to_path_buf(), Duration::ZERO, false);
        source.open().unwrap();
        assert_eq!(source.next_frame().unwrap().name.as_deref(), Some("a.jpg"));
        assert_eq!(source.next_frame().unwrap().name.as_deref(), Some("b.jpg"));
        assert!(source.next_frame().is_err());
    }

    #[test]
    fn empty_directory_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = DirectorySource::new(dir.path().to_path_buf(), Duration::ZERO, true);
        assert!(source.open().is_err());
        let mut missing = DirectorySource::new(dir.path().join("missing"), Duration::ZERO, true);
        assert!(missing.open().is_err());
    }
}
