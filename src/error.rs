use std::{path::PathBuf, time::Duration};

#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    #[error("failed to open video capture: {0}")]
    OpenCapture(String, #[source] opencv::Error),

    #[error("video capture could not be opened: {0}")]
    CaptureNotOpened(String),

    #[error("failed to set capture property")]
    SetCaptureProperty(#[source] opencv::Error),

    #[error("failed to get capture property")]
    GetCaptureProperty(#[source] opencv::Error),

    #[error("failed reading frame")]
    ReadFrame(#[source] opencv::Error),

    #[error("frame source is exhausted")]
    FrameSourceExhausted,

    #[error("failed to spawn camera stream process")]
    SpawnStream(#[source] std::io::Error),

    #[error("camera stream process has no stdout")]
    GetStreamStdout,

    #[error("failed reading camera stream")]
    ReadStream(#[source] std::io::Error),

    #[error("no frame from camera stream within {0:?}")]
    FrameTimeout(Duration),

    #[error("failed to decode JPEG frame")]
    DecodeJpeg(#[source] opencv::Error),

    #[error("JPEG data did not decode to an image")]
    UndecodableImage,

    #[error("failed to rotate frame")]
    RotateFrame(#[source] opencv::Error),

    #[error("failed to read pose network from {1:?}")]
    ReadNet(#[source] opencv::Error, PathBuf),

    #[error("failed to build input blob from frame")]
    BlobFromImage(#[source] opencv::Error),

    #[error("failed to set network input")]
    SetNetInput(#[source] opencv::Error),

    #[error("failed to run network forward pass")]
    Forward(#[source] opencv::Error),

    #[error("failed to get Mat data")]
    GetMatData(#[source] opencv::Error),

    #[error("expected pose output with {expected} rows, got {len} values")]
    UnexpectedOutputShape { expected: usize, len: usize },

    #[error("failed to construct array view from network output")]
    ConstructArrayView(#[source] ndarray::ShapeError),

    #[error("failed to construct NotNan from f32: {1}")]
    ConstructNotNan(#[source] ordered_float::FloatIsNan, f32),

    #[error("failed to convert value to f32")]
    ConvertToF32,

    #[error("failed to convert {0} to a keypoint kind")]
    ConvertUSizeToKeypointKind(usize),

    #[error("failed to spawn {0}")]
    SpawnRemote(&'static str, #[source] std::io::Error),

    #[error("failed waiting for remote command")]
    WaitRemote(#[source] std::io::Error),

    #[error("failed collecting remote command output")]
    CollectRemoteOutput(#[source] std::io::Error),

    #[error("remote command timed out after {1:?}: {0}")]
    RemoteTimedOut(String, Duration),

    #[error("remote command failed (exit {code:?}): {stderr}")]
    RemoteFailed { code: Option<i32>, stderr: String },

    #[error("failed to write to remote command stdin")]
    WriteRemoteStdin(#[source] std::io::Error),

    #[error("failed to spawn {0} thread")]
    SpawnThread(&'static str, #[source] std::io::Error),

    #[error("failed to read {1:?}")]
    ReadFile(#[source] std::io::Error, PathBuf),

    #[error("failed to write {1:?}")]
    WriteFile(#[source] std::io::Error, PathBuf),

    #[error("failed to create directory {1:?}")]
    CreateDir(#[source] std::io::Error, PathBuf),

    #[error("failed to encode frame as JPEG")]
    EncodeFrame(#[source] opencv::Error),

    #[error("missing API key: set {0}")]
    MissingApiKey(&'static str),

    #[error("failed to build HTTP client")]
    BuildHttpClient(#[source] reqwest::Error),

    #[error("request to {0} failed")]
    Request(&'static str, #[source] reqwest::Error),

    #[error("{0} rate limited the request")]
    RateLimited(&'static str),

    #[error("analysis response contained no text")]
    EmptyAnalysis,

    #[cfg(feature = "local-audio")]
    #[error("local audio output failed: {0}")]
    LocalAudio(String),

    #[error("failed to draw line")]
    DrawLine(#[source] opencv::Error),

    #[error("failed to draw circle")]
    DrawCircle(#[source] opencv::Error),

    #[error("failed to draw marker")]
    DrawMarker(#[source] opencv::Error),

    #[error("failed to draw rectangle")]
    DrawRectangle(#[source] opencv::Error),

    #[error("failed to draw text")]
    PutText(#[source] opencv::Error),

    #[error("failed to convert {0:?} to integer pixel coordinates")]
    ConvertPoint(opencv::core::Point2f),

    #[error("failed to copy frame")]
    CopyFrame(#[source] opencv::Error),

    #[cfg(feature = "gui")]
    #[error("failed to show image")]
    ImShow(#[source] opencv::Error),

    #[cfg(feature = "gui")]
    #[error("failed waiting for key press")]
    WaitKey(#[source] opencv::Error),
}
