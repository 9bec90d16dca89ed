use crate::{
    alarm::{kill_timeout, KILL_ALARM_COMMAND},
    error::Error,
    remote::Remote,
};
use std::{path::Path, thread, time::Duration};
use tracing::{info, instrument};

const REMOTE_GUIDANCE_PATH: &str = "/tmp/guidance.mp3";
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);
const PLAY_TIMEOUT: Duration = Duration::from_secs(120);
/// Give the killed alarm player a moment to release the audio device.
const SETTLE: Duration = Duration::from_millis(300);

/// Plays a guidance recording once, blocking until it finishes.
pub(crate) trait GuidancePlayer: Send + Sync {
    fn play(&self, audio: &Path) -> Result<(), Error>;
}

/// Plays on the camera host's speaker.
pub(crate) struct RemotePlayer {
    remote: Remote,
    player: String,
}

impl RemotePlayer {
    pub(crate) fn new(remote: Remote, player: String) -> Self {
        Self { remote, player }
    }

    fn play_command(&self) -> String {
        format!("{} {}", self.player, REMOTE_GUIDANCE_PATH)
    }
}

impl GuidancePlayer for RemotePlayer {
    #[instrument(name = "RemotePlayer::play", skip(self))]
    fn play(&self, audio: &Path) -> Result<(), Error> {
        self.remote
            .upload(audio, REMOTE_GUIDANCE_PATH, UPLOAD_TIMEOUT)?;
        info!(message = "guidance uploaded", host = self.remote.target());

        // leftover alarm audio would drown the guidance out
        self.remote
            .run(KILL_ALARM_COMMAND, kill_timeout(&self.remote))?;
        thread::sleep(SETTLE);

        self.remote.run(&self.play_command(), PLAY_TIMEOUT).map(drop)
    }
}

#[cfg(feature = "local-audio")]
pub(crate) use local::LocalPlayer;

#[cfg(feature = "local-audio")]
mod local {
    use super::GuidancePlayer;
    use crate::error::Error;
    use rodio::{Decoder, OutputStream, Sink};
    use std::{fs::File, io::BufReader, path::Path};

    /// Plays on this machine's default output device.
    #[derive(Debug, Default)]
    pub(crate) struct LocalPlayer;

    impl GuidancePlayer for LocalPlayer {
        fn play(&self, audio: &Path) -> Result<(), Error> {
            let file = File::open(audio).map_err(|e| Error::ReadFile(e, audio.to_owned()))?;
            let (_stream, handle) =
                OutputStream::try_default().map_err(|e| Error::LocalAudio(e.to_string()))?;
            let sink = Sink::try_new(&handle).map_err(|e| Error::LocalAudio(e.to_string()))?;
            let source =
                Decoder::new(BufReader::new(file)).map_err(|e| Error::LocalAudio(e.to_string()))?;
            sink.append(source);
            sink.sleep_until_end();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RemotePlayer;
    use crate::remote::Remote;
    use std::time::Duration;

    #[test]
    fn plays_uploaded_file() {
        let player = RemotePlayer::new(
            Remote::new("pi", "camera.local", Duration::from_secs(1)),
            "mpg123 -q -o pulse".to_owned(),
        );
        assert_eq!(player.play_command(), "mpg123 -q -o pulse /tmp/guidance.mp3");
    }
}
