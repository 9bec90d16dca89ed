//! The looping audible alarm.
//!
//! Every backend keeps its playing flag behind a lock, so `start`, `stop` and `is_playing`
//! can race with the backend's own playback machinery without tearing.

use crate::{error::Error, remote::Remote};
use std::{
    path::Path,
    process::{Child, Stdio},
    sync::{Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{error, info, instrument, warn};

pub(crate) const REMOTE_ALARM_PATH: &str = "/tmp/alarm.mp3";

/// Time the remote kill gets on top of the ssh connect timeout.
const KILL_GRACE: Duration = Duration::from_secs(5);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Idempotent start/stop of a looping alarm sound.
///
/// Failures are logged by the implementation and never returned: an alarm that cannot sound
/// must not take monitoring down with it.
pub(crate) trait AlarmActuator {
    fn start(&self);
    fn stop(&self);
    fn is_playing(&self) -> bool;
}

impl<T: AlarmActuator + ?Sized> AlarmActuator for Box<T> {
    fn start(&self) {
        (**self).start()
    }

    fn stop(&self) {
        (**self).stop()
    }

    fn is_playing(&self) -> bool {
        (**self).is_playing()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct RemoteAlarmState {
    playing: bool,
    session: Option<Child>,
    kill: Option<JoinHandle<()>>,
}

impl RemoteAlarmState {
    /// Wait for a remote kill still in flight, so it cannot take down a newer loop.
    fn finish_kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            if kill.join().is_err() {
                warn!(message = "remote alarm kill panicked");
            }
        }
    }
}

pub(crate) fn kill_timeout(remote: &Remote) -> Duration {
    remote.connect_timeout() + KILL_GRACE
}

/// Loops an mp3 on the camera host's speaker through a held-open ssh session.
pub(crate) struct RemoteAlarm {
    remote: Remote,
    player: String,
    state: Mutex<RemoteAlarmState>,
}

impl RemoteAlarm {
    pub(crate) fn new(remote: Remote, player: String) -> Self {
        Self {
            remote,
            player,
            state: Mutex::new(RemoteAlarmState::default()),
        }
    }

    /// Copy the alarm sound to the host so `start` has something to loop.
    #[instrument(name = "RemoteAlarm::upload", skip(self))]
    pub(crate) fn upload(&self, alarm_file: &Path) -> Result<(), Error> {
        self.remote
            .upload(alarm_file, REMOTE_ALARM_PATH, UPLOAD_TIMEOUT)?;
        info!(message = "uploaded alarm sound", host = self.remote.target());
        Ok(())
    }

    fn loop_command(&self) -> String {
        format!(
            "while true; do {} {} 2>/dev/null; done",
            self.player, REMOTE_ALARM_PATH
        )
    }
}

/// Kill the looping shell and any player it left behind.
pub(crate) const KILL_ALARM_COMMAND: &str =
    "pkill -9 -f 'alarm.mp3' 2>/dev/null; pkill -9 mpg123 2>/dev/null; exit 0";

impl AlarmActuator for RemoteAlarm {
    fn start(&self) {
        let mut state = lock(&self.state);
        if state.playing {
            return;
        }
        state.finish_kill();
        let spawned = self
            .remote
            .command(&self.loop_command())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match spawned {
            Ok(session) => {
                state.session = Some(session);
                state.playing = true;
                info!(message = "alarm started", host = self.remote.target());
            }
            Err(error) => error!(message = "failed to start alarm", %error),
        }
    }

    /// Drops the held session right away; the remote cleanup runs in the background.
    fn stop(&self) {
        let mut state = lock(&self.state);
        if !state.playing {
            return;
        }
        if let Some(mut session) = state.session.take() {
            let _ = session.kill();
            let _ = session.wait();
        }
        state.playing = false;

        let remote = self.remote.clone();
        let spawned = thread::Builder::new()
            .name("alarm-kill".to_owned())
            .spawn(move || {
                if let Err(error) = remote.run(KILL_ALARM_COMMAND, kill_timeout(&remote)) {
                    warn!(message = "failed to kill remote alarm player", %error);
                }
            });
        match spawned {
            Ok(kill) => state.kill = Some(kill),
            Err(error) => warn!(message = "failed to launch remote alarm kill", %error),
        }
        info!(message = "alarm stopped");
    }

    fn is_playing(&self) -> bool {
        lock(&self.state).playing
    }
}

impl Drop for RemoteAlarm {
    fn drop(&mut self) {
        self.stop();
        lock(&self.state).finish_kill();
    }
}

#[cfg(feature = "local-audio")]
pub(crate) use local::LocalAlarm;

#[cfg(feature = "local-audio")]
mod local {
    use super::{lock, AlarmActuator};
    use crate::error::Error;
    use rodio::{Decoder, OutputStream, Sink};
    use std::{
        io::Cursor,
        path::Path,
        sync::{
            mpsc::{self, Sender},
            Arc, Mutex,
        },
        thread,
    };
    use tracing::{error, info};

    enum Command {
        Start,
        Stop,
    }

    /// Loops the alarm on this machine's default output device.
    ///
    /// rodio's output stream is not `Send`, so it lives on a dedicated thread driven by a
    /// command channel.
    pub(crate) struct LocalAlarm {
        tx: Mutex<Sender<Command>>,
        playing: Arc<Mutex<bool>>,
    }

    impl LocalAlarm {
        pub(crate) fn new(alarm_file: &Path) -> Result<Self, Error> {
            let sound = std::fs::read(alarm_file)
                .map_err(|e| Error::ReadFile(e, alarm_file.to_owned()))?;
            let (tx, rx) = mpsc::channel::<Command>();
            let playing = Arc::new(Mutex::new(false));
            let playing_thread = playing.clone();

            thread::Builder::new()
                .name("alarm-audio".to_owned())
                .spawn(move || {
                    let mut output: Option<(OutputStream, Sink)> = None;

                    while let Ok(command) = rx.recv() {
                        match command {
                            Command::Start => match start_loop(&sound) {
                                Ok(started) => output = Some(started),
                                Err(error) => {
                                    error!(message = "failed to start alarm", %error);
                                    *lock(&playing_thread) = false;
                                }
                            },
                            Command::Stop => {
                                if let Some((_stream, sink)) = output.take() {
                                    sink.stop();
                                }
                            }
                        }
                    }
                })
                .map_err(|e| Error::SpawnThread("alarm-audio", e))?;

            Ok(Self {
                tx: Mutex::new(tx),
                playing,
            })
        }
    }

    fn start_loop(sound: &[u8]) -> Result<(OutputStream, Sink), Error> {
        let (stream, handle) =
            OutputStream::try_default().map_err(|e| Error::LocalAudio(e.to_string()))?;
        let sink = Sink::try_new(&handle).map_err(|e| Error::LocalAudio(e.to_string()))?;
        let source = Decoder::new_looped(Cursor::new(sound.to_vec()))
            .map_err(|e| Error::LocalAudio(e.to_string()))?;
        sink.append(source);
        Ok((stream, sink))
    }

    impl AlarmActuator for LocalAlarm {
        fn start(&self) {
            let mut playing = lock(&self.playing);
            if *playing {
                return;
            }
            if lock(&self.tx).send(Command::Start).is_err() {
                error!(message = "alarm audio thread is gone");
                return;
            }
            *playing = true;
            info!(message = "alarm started", output = "local");
        }

        fn stop(&self) {
            let mut playing = lock(&self.playing);
            if !*playing {
                return;
            }
            // a dead audio thread has nothing left to stop
            let _ = lock(&self.tx).send(Command::Stop);
            *playing = false;
            info!(message = "alarm stopped", output = "local");
        }

        fn is_playing(&self) -> bool {
            *lock(&self.playing)
        }
    }
}
