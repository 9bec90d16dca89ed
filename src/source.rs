//! Frame sources. All of them are single pass: once a source fails it stays failed.

use crate::{error::Error, remote::Remote};
use opencv::{
    core::{self, Mat, Vector, ROTATE_90_COUNTERCLOCKWISE},
    imgcodecs::{imdecode, IMREAD_COLOR},
    prelude::*,
    videoio::{VideoCapture, CAP_ANY, CAP_PROP_FRAME_HEIGHT, CAP_PROP_FRAME_WIDTH, CAP_V4L2},
};
use std::{
    io::{self, Read},
    process::{Child, Stdio},
    sync::mpsc::{self, Receiver, RecvTimeoutError},
    thread,
    time::Duration,
};
use tracing::{debug, info, instrument, warn};

const READ_CHUNK: usize = 4096;
/// Chunks buffered ahead of the decoder.
const CHUNK_BACKLOG: usize = 64;
const REMOTE_STILL_PATH: &str = "/tmp/capture.jpg";
const STILL_TIMEOUT: Duration = Duration::from_secs(30);
const SOI: [u8; 2] = [0xff, 0xd8];
const EOI: [u8; 2] = [0xff, 0xd9];

pub(crate) trait FrameSource {
    fn next_frame(&mut self) -> Result<Mat, Error>;

    /// Release whatever the source holds open. Safe to call more than once.
    fn release(&mut self) {}
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    fn next_frame(&mut self) -> Result<Mat, Error> {
        (**self).next_frame()
    }

    fn release(&mut self) {
        (**self).release()
    }
}

/// A V4L2 device (`/dev/videoN`, given as `N`) or anything else OpenCV can open.
pub(crate) struct Capture {
    capture: VideoCapture,
}

impl Capture {
    pub(crate) fn open(
        source: &str,
        frame_width: Option<u16>,
        frame_height: Option<u16>,
    ) -> Result<Self, Error> {
        let mut capture = match source.parse::<i32>() {
            Ok(device) => VideoCapture::new(device, CAP_V4L2),
            Err(_) => VideoCapture::from_file(source, CAP_ANY),
        }
        .map_err(|e| Error::OpenCapture(source.to_owned(), e))?;

        if !capture
            .is_opened()
            .map_err(|e| Error::OpenCapture(source.to_owned(), e))?
        {
            return Err(Error::CaptureNotOpened(source.to_owned()));
        }

        if let Some(width) = frame_width.map(f64::from) {
            capture
                .set(CAP_PROP_FRAME_WIDTH, width)
                .map_err(Error::SetCaptureProperty)?;
        }

        if let Some(height) = frame_height.map(f64::from) {
            capture
                .set(CAP_PROP_FRAME_HEIGHT, height)
                .map_err(Error::SetCaptureProperty)?;
        }

        let width = capture
            .get(CAP_PROP_FRAME_WIDTH)
            .map_err(Error::GetCaptureProperty)?;
        let height = capture
            .get(CAP_PROP_FRAME_HEIGHT)
            .map_err(Error::GetCaptureProperty)?;
        info!(message = "got dimensions from video capture", width, height);

        Ok(Self { capture })
    }
}

impl FrameSource for Capture {
    fn next_frame(&mut self) -> Result<Mat, Error> {
        let mut frame = Mat::default();
        if !self.capture.read(&mut frame).map_err(Error::ReadFrame)?
            || frame.empty().map_err(Error::ReadFrame)?
        {
            return Err(Error::FrameSourceExhausted);
        }
        Ok(frame)
    }

    fn release(&mut self) {
        if let Err(error) = self.capture.release() {
            warn!(message = "failed to release video capture", %error);
        }
    }
}

/// Accumulates an MJPEG byte stream and cuts it into complete JPEG images.
#[derive(Debug, Default)]
pub(crate) struct JpegSplitter {
    buf: Vec<u8>,
}

fn find(haystack: &[u8], needle: &[u8; 2], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(2)
        .position(|window| window == needle)
        .map(|i| i + from)
}

impl JpegSplitter {
    pub(crate) fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// The next complete image, from start-of-image through end-of-image inclusive.
    ///
    /// Bytes before a start marker are garbage and are discarded.
    pub(crate) fn next_frame(&mut self) -> Option<Vec<u8>> {
        let start = match find(&self.buf, &SOI, 0) {
            Some(start) => start,
            None => {
                // keep a trailing 0xff, it may begin a marker split across chunks
                let keep = usize::from(self.buf.last() == Some(&SOI[0]));
                let drop = self.buf.len() - keep;
                self.buf.drain(..drop);
                return None;
            }
        };
        let end = match find(&self.buf, &EOI, start + SOI.len()) {
            Some(end) => end,
            None => {
                self.buf.drain(..start);
                return None;
            }
        };
        let frame = self.buf[start..end + EOI.len()].to_vec();
        self.buf.drain(..end + EOI.len());
        Some(frame)
    }
}

/// Decode one JPEG image into a BGR frame.
pub(crate) fn decode_jpeg(jpeg: &[u8]) -> Result<Mat, Error> {
    let frame = imdecode(&jpeg.iter().copied().collect::<Vector<u8>>(), IMREAD_COLOR)
        .map_err(Error::DecodeJpeg)?;
    if frame.empty().map_err(Error::DecodeJpeg)? {
        return Err(Error::UndecodableImage);
    }
    Ok(frame)
}

/// Take a single still with `rpicam-still` on the camera host and fetch the JPEG.
#[instrument(name = "capture_still", skip(remote))]
pub(crate) fn capture_still(remote: &Remote, width: u16, height: u16) -> Result<Vec<u8>, Error> {
    remote.run(
        &format!(
            "rpicam-still -o {} --width {} --height {} -t 1000 -n",
            REMOTE_STILL_PATH, width, height
        ),
        STILL_TIMEOUT,
    )?;
    let jpeg = remote.read_file(REMOTE_STILL_PATH, STILL_TIMEOUT)?;
    info!(message = "still captured", host = remote.target(), bytes = jpeg.len());
    Ok(jpeg)
}

/// Byte chunks read off a pipe by a background thread.
///
/// The thread ends on EOF or a read error, and when the receiving side is dropped.
struct Chunks {
    rx: Receiver<io::Result<Vec<u8>>>,
    timeout: Duration,
}

impl Chunks {
    fn spawn<R>(mut reader: R, timeout: Duration) -> Result<Self, Error>
    where
        R: Read + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(CHUNK_BACKLOG);
        thread::Builder::new()
            .name("camera-stream".to_owned())
            .spawn(move || {
                let mut chunk = vec![0; READ_CHUNK];
                loop {
                    let read = match reader.read(&mut chunk) {
                        Ok(0) => return,
                        Ok(n) => Ok(chunk[..n].to_vec()),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => Err(e),
                    };
                    let failed = read.is_err();
                    if tx.send(read).is_err() || failed {
                        return;
                    }
                }
            })
            .map_err(|e| Error::SpawnThread("camera-stream", e))?;
        Ok(Self { rx, timeout })
    }

    fn next(&self) -> Result<Vec<u8>, Error> {
        match self.rx.recv_timeout(self.timeout) {
            Ok(chunk) => chunk.map_err(Error::ReadStream),
            Err(RecvTimeoutError::Timeout) => Err(Error::FrameTimeout(self.timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(Error::FrameSourceExhausted),
        }
    }
}

/// Camera frames from `rpicam-vid` on the camera host, piped back over ssh as MJPEG.
pub(crate) struct MjpegStream {
    child: Option<Child>,
    chunks: Chunks,
    splitter: JpegSplitter,
}

fn stream_command(width: u16, height: u16, fps: u16) -> String {
    format!(
        "rpicam-vid -t 0 --width {} --height {} --framerate {} --codec mjpeg --inline -n -o -",
        width, height, fps
    )
}

impl MjpegStream {
    /// `frame_timeout` bounds the wait for stream data; a stalled camera fails the source.
    pub(crate) fn spawn(
        remote: &Remote,
        width: u16,
        height: u16,
        fps: u16,
        frame_timeout: Duration,
    ) -> Result<Self, Error> {
        let mut child = remote
            .command(&stream_command(width, height, fps))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(Error::SpawnStream)?;
        let stdout = child.stdout.take().ok_or(Error::GetStreamStdout)?;
        let mut stream = Self::from_reader(stdout, frame_timeout)?;
        stream.child = Some(child);
        info!(
            message = "camera streaming over ssh",
            host = remote.target(),
            width,
            height,
            fps
        );
        Ok(stream)
    }

    fn from_reader<R>(reader: R, frame_timeout: Duration) -> Result<Self, Error>
    where
        R: Read + Send + 'static,
    {
        Ok(Self {
            child: None,
            chunks: Chunks::spawn(reader, frame_timeout)?,
            splitter: JpegSplitter::default(),
        })
    }
}

impl FrameSource for MjpegStream {
    fn next_frame(&mut self) -> Result<Mat, Error> {
        loop {
            while let Some(jpeg) = self.splitter.next_frame() {
                match decode_jpeg(&jpeg) {
                    Err(Error::UndecodableImage) => {
                        debug!(message = "skipping undecodable frame");
                    }
                    frame => return frame,
                }
            }

            let chunk = self.chunks.next()?;
            self.splitter.push(&chunk);
        }
    }

    fn release(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
            info!(message = "camera stream stopped");
        }
    }
}

impl Drop for MjpegStream {
    fn drop(&mut self) {
        self.release();
    }
}

/// Rotates every frame 90° counter-clockwise, for a camera mounted on its side.
pub(crate) struct Rotated<S>(pub(crate) S);

impl<S: FrameSource> FrameSource for Rotated<S> {
    fn next_frame(&mut self) -> Result<Mat, Error> {
        let frame = self.0.next_frame()?;
        let mut rotated = Mat::default();
        core::rotate(&frame, &mut rotated, ROTATE_90_COUNTERCLOCKWISE).map_err(Error::RotateFrame)?;
        Ok(rotated)
    }

    fn release(&mut self) {
        self.0.release()
    }
}

#[cfg(test)]
mod tests {
    use super::{stream_command, FrameSource, JpegSplitter, MjpegStream};
    use crate::error::Error;
    use std::{
        io::{self, Cursor, Read},
        thread,
        time::{Duration, Instant},
    };

    /// A camera that never sends another byte.
    struct Stalled;

    impl Read for Stalled {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            loop {
                thread::sleep(Duration::from_secs(3600));
            }
        }
    }

    struct Broken;

    impl Read for Broken {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
        }
    }

    #[test]
    fn stalled_stream_times_out() {
        let mut stream = MjpegStream::from_reader(Stalled, Duration::from_millis(100)).unwrap();
        let start = Instant::now();
        assert!(matches!(
            stream.next_frame(),
            Err(Error::FrameTimeout(timeout)) if timeout == Duration::from_millis(100)
        ));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn ended_stream_is_exhausted() {
        let mut stream =
            MjpegStream::from_reader(Cursor::new(b"no jpeg here".to_vec()), Duration::from_secs(5))
                .unwrap();
        assert!(matches!(
            stream.next_frame(),
            Err(Error::FrameSourceExhausted)
        ));
    }

    #[test]
    fn read_error_is_reported() {
        let mut stream = MjpegStream::from_reader(Broken, Duration::from_secs(5)).unwrap();
        assert!(matches!(stream.next_frame(), Err(Error::ReadStream(_))));
    }

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0xff, 0xd8];
        bytes.extend_from_slice(body);
        bytes.extend_from_slice(&[0xff, 0xd9]);
        bytes
    }

    #[test]
    fn splits_back_to_back_frames() {
        let mut splitter = JpegSplitter::default();
        let mut stream = jpeg(b"one");
        stream.extend(jpeg(b"two"));
        splitter.push(&stream);
        assert_eq!(splitter.next_frame(), Some(jpeg(b"one")));
        assert_eq!(splitter.next_frame(), Some(jpeg(b"two")));
        assert_eq!(splitter.next_frame(), None);
    }

    #[test]
    fn frame_split_across_chunks() {
        let mut splitter = JpegSplitter::default();
        let frame = jpeg(b"payload");
        let (head, tail) = frame.split_at(5);
        splitter.push(head);
        assert_eq!(splitter.next_frame(), None);
        splitter.push(tail);
        assert_eq!(splitter.next_frame(), Some(frame));
    }

    #[test]
    fn end_marker_split_across_chunks() {
        let mut splitter = JpegSplitter::default();
        let frame = jpeg(b"payload");
        let (head, tail) = frame.split_at(frame.len() - 1);
        splitter.push(head);
        assert_eq!(splitter.next_frame(), None);
        splitter.push(tail);
        assert_eq!(splitter.next_frame(), Some(frame));
    }

    #[test]
    fn start_marker_split_across_chunks() {
        let mut splitter = JpegSplitter::default();
        splitter.push(&[0x00, 0x01, 0xff]);
        assert_eq!(splitter.next_frame(), None);
        splitter.push(&[0xd8, 0x42, 0xff, 0xd9]);
        assert_eq!(splitter.next_frame(), Some(vec![0xff, 0xd8, 0x42, 0xff, 0xd9]));
    }

    #[test]
    fn garbage_before_start_is_dropped() {
        let mut splitter = JpegSplitter::default();
        let mut stream = b"noise".to_vec();
        stream.extend(jpeg(b"x"));
        splitter.push(&stream);
        assert_eq!(splitter.next_frame(), Some(jpeg(b"x")));
    }

    #[test]
    fn end_marker_is_not_matched_inside_start_marker() {
        let mut splitter = JpegSplitter::default();
        // 0xff 0xd8 0xd9 must not be read as an empty image ending at offset 1
        splitter.push(&[0xff, 0xd8, 0xd9, 0x00]);
        assert_eq!(splitter.next_frame(), None);
        splitter.push(&[0xff, 0xd9]);
        assert_eq!(
            splitter.next_frame(),
            Some(vec![0xff, 0xd8, 0xd9, 0x00, 0xff, 0xd9])
        );
    }

    #[test]
    fn stream_command_requests_mjpeg_on_stdout() {
        assert_eq!(
            stream_command(640, 480, 15),
            "rpicam-vid -t 0 --width 640 --height 480 --framerate 15 --codec mjpeg --inline -n -o -"
        );
    }
}
