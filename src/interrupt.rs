//! The external "escalate now" request, delivered as one consumable edge per press.

use crate::{error::Error, remote::Remote};
use std::{
    io::{BufRead, BufReader, Read},
    process::Child,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{error, info, warn};

const SCRIPT_PATH: &str = "/tmp/button_listener.py";
const SETUP_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(3);
const STOP_POLL: Duration = Duration::from_millis(100);

pub(crate) trait InterruptSignal {
    fn start(&mut self) -> Result<(), Error>;
    fn stop(&mut self);
    /// Whether an edge is pending, without consuming it.
    fn poll(&self) -> bool;
    /// Drop any pending edge.
    fn consume(&self);
    /// Atomically check and consume the pending edge.
    fn take(&self) -> bool;
}

impl<T: InterruptSignal + ?Sized> InterruptSignal for Box<T> {
    fn start(&mut self) -> Result<(), Error> {
        (**self).start()
    }

    fn stop(&mut self) {
        (**self).stop()
    }

    fn poll(&self) -> bool {
        (**self).poll()
    }

    fn consume(&self) {
        (**self).consume()
    }

    fn take(&self) -> bool {
        (**self).take()
    }
}

/// Single-writer/single-reader edge flag. Repeated raises before a take coalesce into one.
#[derive(Debug, Clone, Default)]
pub(crate) struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub(crate) fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// A bare flag is its own signal source, raised from the keyboard or tests.
impl InterruptSignal for InterruptFlag {
    fn start(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn stop(&mut self) {}

    fn poll(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn consume(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// The listener script run on the camera host. gpiozero debounces the pin.
pub(crate) fn listener_script(pin: u8) -> String {
    format!(
        "#!/usr/bin/env python3\n\
         import time\n\
         from gpiozero import Button\n\
         b = Button({}, pull_up=True, bounce_time=0.05)\n\
         print('READY', flush=True)\n\
         while True:\n\
         \x20   b.wait_for_press()\n\
         \x20   print('PRESSED', flush=True)\n\
         \x20   time.sleep(0.3)\n",
        pin
    )
}

const CLEANUP_COMMAND: &str = "pkill -f button_listener 2>/dev/null; \
                               pkill -f wait_for_press 2>/dev/null; \
                               sleep 0.5; exit 0";

#[derive(Debug, PartialEq, Eq)]
enum Line {
    Ready,
    Pressed,
    Other,
}

fn parse_line(line: &str) -> Line {
    let line = line.trim();
    if line == "READY" {
        Line::Ready
    } else if line.contains("PRESSED") {
        Line::Pressed
    } else {
        Line::Other
    }
}

/// Watches a GPIO push button on the camera host over ssh.
///
/// The session is reopened with a fixed backoff whenever it drops. Its only effect on the
/// rest of the system is raising the flag.
pub(crate) struct ButtonListener {
    remote: Remote,
    pin: u8,
    flag: InterruptFlag,
    running: Arc<AtomicBool>,
    session: Arc<Mutex<Option<Child>>>,
    thread: Option<JoinHandle<()>>,
}

impl ButtonListener {
    pub(crate) fn new(remote: Remote, pin: u8) -> Self {
        Self {
            remote,
            pin,
            flag: InterruptFlag::default(),
            running: Arc::new(AtomicBool::new(false)),
            session: Arc::new(Mutex::new(None)),
            thread: None,
        }
    }

    /// A handle to the flag this listener raises.
    pub(crate) fn flag(&self) -> InterruptFlag {
        self.flag.clone()
    }
}

struct Worker {
    remote: Remote,
    pin: u8,
    flag: InterruptFlag,
    running: Arc<AtomicBool>,
    session: Arc<Mutex<Option<Child>>>,
}

impl Worker {
    fn run(self) {
        while self.running.load(Ordering::SeqCst) {
            if let Err(error) = self.listen() {
                error!(message = "button listener failed", %error);
            }
            self.backoff();
        }
        info!(message = "button listener stopped");
    }

    fn backoff(&self) {
        let deadline = Instant::now() + RECONNECT_BACKOFF;
        while self.running.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(STOP_POLL);
        }
    }

    fn listen(&self) -> Result<(), Error> {
        if let Err(error) = self.remote.run(CLEANUP_COMMAND, SETUP_TIMEOUT) {
            warn!(message = "failed to clean up old listeners", %error);
        }
        self.remote.write_file(
            listener_script(self.pin).as_bytes(),
            SCRIPT_PATH,
            SETUP_TIMEOUT,
        )?;

        let mut child = self
            .remote
            .spawn_reader(&format!("python3 {}", SCRIPT_PATH))?;
        let stdout = child.stdout.take().ok_or(Error::GetStreamStdout)?;
        let mut stderr = child.stderr.take();
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(child);

        if !self.running.load(Ordering::SeqCst) {
            self.end_session();
            return Ok(());
        }
        info!(message = "button listener running", pin = self.pin);

        let result = self.read_presses(stdout);
        self.end_session();
        if let Some(stderr) = stderr.as_mut() {
            let mut message = String::new();
            if stderr.read_to_string(&mut message).is_ok() && !message.trim().is_empty() {
                warn!(message = "button listener stderr", stderr = message.trim());
            }
        }
        result
    }

    fn read_presses<R: Read>(&self, stdout: R) -> Result<(), Error> {
        for line in BufReader::new(stdout).lines() {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            match parse_line(&line.map_err(Error::ReadStream)?) {
                Line::Ready => info!(message = "listening for presses", pin = self.pin),
                Line::Pressed => {
                    info!(message = "button pressed", pin = self.pin);
                    self.flag.raise();
                }
                Line::Other => {}
            }
        }
        Ok(())
    }

    fn end_session(&self) {
        if let Some(mut child) = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl InterruptSignal for ButtonListener {
    fn start(&mut self) -> Result<(), Error> {
        if self.thread.is_some() {
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);
        let worker = Worker {
            remote: self.remote.clone(),
            pin: self.pin,
            flag: self.flag.clone(),
            running: self.running.clone(),
            session: self.session.clone(),
        };
        let thread = thread::Builder::new()
            .name("button-listener".to_owned())
            .spawn(move || worker.run())
            .map_err(|e| Error::SpawnThread("button-listener", e))?;
        self.thread = Some(thread);
        info!(message = "starting button listener", pin = self.pin);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        // killing the session unblocks the reader
        if let Some(mut child) = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(message = "button listener thread panicked");
            }
        }
    }

    fn poll(&self) -> bool {
        self.flag.poll()
    }

    fn consume(&self) {
        self.flag.consume()
    }

    fn take(&self) -> bool {
        self.flag.take()
    }
}

impl Drop for ButtonListener {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::{listener_script, parse_line, InterruptFlag, InterruptSignal, Line};

    #[test]
    fn take_consumes_exactly_one_edge() {
        let flag = InterruptFlag::default();
        assert!(!flag.take());
        flag.raise();
        flag.raise();
        assert!(flag.poll());
        assert!(flag.poll());
        assert!(flag.take());
        assert!(!flag.take());
        assert!(!flag.poll());
    }

    #[test]
    fn consume_clears() {
        let flag = InterruptFlag::default();
        flag.raise();
        flag.consume();
        assert!(!flag.poll());
    }

    #[test]
    fn clones_share_the_edge() {
        let flag = InterruptFlag::default();
        let writer = flag.clone();
        writer.raise();
        assert!(flag.take());
        assert!(!writer.poll());
    }

    #[test]
    fn boxed_signal_delegates() {
        let flag = InterruptFlag::default();
        let boxed: Box<dyn InterruptSignal> = Box::new(flag.clone());
        flag.raise();
        assert!(boxed.poll());
        assert!(boxed.take());
        assert!(!flag.poll());
    }

    #[test]
    fn parses_listener_output() {
        assert_eq!(parse_line("READY\n"), Line::Ready);
        assert_eq!(parse_line("PRESSED"), Line::Pressed);
        assert_eq!(parse_line("  PRESSED!  "), Line::Pressed);
        assert_eq!(parse_line("Traceback (most recent call last):"), Line::Other);
    }

    #[test]
    fn script_uses_pin_with_debounce() {
        let script = listener_script(17);
        assert!(script.contains("Button(17, pull_up=True, bounce_time=0.05)"));
        assert!(script.contains("\n    b.wait_for_press()\n"));
    }
}
