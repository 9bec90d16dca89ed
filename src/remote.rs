//! Command execution and file transfer on the camera host over `ssh`/`scp`.

use crate::error::Error;
use std::{
    io::{self, Read, Write},
    path::Path,
    process::{Child, Command, Output, Stdio},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, instrument};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub(crate) struct Remote {
    target: String,
    connect_timeout: Duration,
}

impl Remote {
    pub(crate) fn new(user: &str, host: &str, connect_timeout: Duration) -> Self {
        Self {
            target: format!("{}@{}", user, host),
            connect_timeout,
        }
    }

    pub(crate) fn target(&self) -> &str {
        &self.target
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    fn ssh_options(&self, command: &mut Command) {
        command
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)))
            .arg("-o")
            .arg("ServerAliveInterval=5")
            .arg("-o")
            .arg("ServerAliveCountMax=2");
    }

    /// An `ssh` invocation running `remote_command` on the host, not yet spawned.
    pub(crate) fn command(&self, remote_command: &str) -> Command {
        let mut command = Command::new("ssh");
        self.ssh_options(&mut command);
        command.arg(&self.target).arg(remote_command);
        command
    }

    /// Spawn `remote_command` with stdout piped back, for long-running readers.
    pub(crate) fn spawn_reader(&self, remote_command: &str) -> Result<Child, Error> {
        self.command(remote_command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::SpawnRemote("ssh", e))
    }

    fn output(&self, remote_command: &str, timeout: Duration) -> Result<Vec<u8>, Error> {
        let child = self
            .command(remote_command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::SpawnRemote("ssh", e))?;
        let output = wait_with_timeout(child, timeout, remote_command)?;
        check_output(output)
    }

    /// Run `remote_command` to completion and return its trimmed stdout.
    #[instrument(name = "Remote::run", skip(self), level = "debug")]
    pub(crate) fn run(&self, remote_command: &str, timeout: Duration) -> Result<String, Error> {
        let stdout = self.output(remote_command, timeout)?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_owned())
    }

    /// The contents of `remote_path` on the host.
    #[instrument(name = "Remote::read_file", skip(self), level = "debug")]
    pub(crate) fn read_file(&self, remote_path: &str, timeout: Duration) -> Result<Vec<u8>, Error> {
        self.output(&format!("cat {}", remote_path), timeout)
    }

    /// Write `contents` to `remote_path` on the host.
    #[instrument(name = "Remote::write_file", skip(self, contents), level = "debug")]
    pub(crate) fn write_file(
        &self,
        contents: &[u8],
        remote_path: &str,
        timeout: Duration,
    ) -> Result<(), Error> {
        let remote_command = format!("cat > {}", remote_path);
        let mut child = self
            .command(&remote_command)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::SpawnRemote("ssh", e))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(contents).map_err(Error::WriteRemoteStdin)?;
        }
        let output = wait_with_timeout(child, timeout, &remote_command)?;
        check_output(output).map(drop)
    }

    /// Copy a local file to `remote_path` on the host.
    #[instrument(name = "Remote::upload", skip(self), level = "debug")]
    pub(crate) fn upload(
        &self,
        local_path: &Path,
        remote_path: &str,
        timeout: Duration,
    ) -> Result<(), Error> {
        let mut command = Command::new("scp");
        self.ssh_options(&mut command);
        let child = command
            .arg("-q")
            .arg(local_path)
            .arg(format!("{}:{}", self.target, remote_path))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::SpawnRemote("scp", e))?;
        let output = wait_with_timeout(child, timeout, remote_path)?;
        check_output(output).map(drop)
    }
}

fn check_output(output: Output) -> Result<Vec<u8>, Error> {
    if output.status.success() {
        Ok(output.stdout)
    } else {
        Err(Error::RemoteFailed {
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        })
    }
}

/// Reads a child's pipe to the end on its own thread.
struct Drain(Option<JoinHandle<io::Result<Vec<u8>>>>);

impl Drain {
    fn spawn<R>(pipe: Option<R>) -> Result<Self, Error>
    where
        R: Read + Send + 'static,
    {
        let handle = pipe
            .map(|mut pipe| {
                thread::Builder::new()
                    .name("remote-output".to_owned())
                    .spawn(move || {
                        let mut buf = Vec::new();
                        pipe.read_to_end(&mut buf).map(|_| buf)
                    })
            })
            .transpose()
            .map_err(|e| Error::SpawnThread("remote-output", e))?;
        Ok(Self(handle))
    }

    fn collect(self) -> Result<Vec<u8>, Error> {
        match self.0 {
            Some(handle) => handle
                .join()
                .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::Other, "reader panicked")))
                .map_err(Error::CollectRemoteOutput),
            None => Ok(Vec::new()),
        }
    }
}

/// Wait for `child` to exit, killing it once `timeout` has elapsed.
///
/// stdout and stderr are drained while waiting, so a chatty command cannot stall on a full pipe.
pub(crate) fn wait_with_timeout(
    mut child: Child,
    timeout: Duration,
    description: &str,
) -> Result<Output, Error> {
    let stdout = Drain::spawn(child.stdout.take())?;
    let stderr = Drain::spawn(child.stderr.take())?;

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait().map_err(Error::WaitRemote)? {
            break status;
        }
        if Instant::now() >= deadline {
            debug!(message = "killing timed out child", description);
            // already exited or unkillable; either way we report the timeout
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::RemoteTimedOut(description.to_owned(), timeout));
        }
        thread::sleep(POLL_INTERVAL);
    };

    Ok(Output {
        status,
        stdout: stdout.collect()?,
        stderr: stderr.collect()?,
    })
}
