//! The analysis-and-guidance job run when someone presses the button, or once on a still.

use crate::{
    classify::Evidence,
    error::Error,
    sites::SiteMap,
};
use opencv::{core::Mat, core::Vector, imgcodecs::imencode};
use std::{
    fmt,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread,
};
use tracing::{error, info, instrument, warn};

pub(crate) mod gemini;
pub(crate) mod playback;
pub(crate) mod speech;

pub(crate) use gemini::Gemini;
pub(crate) use playback::{GuidancePlayer, RemotePlayer};
pub(crate) use speech::ElevenLabs;

#[cfg(feature = "local-audio")]
pub(crate) use playback::LocalPlayer;

/// Produces guidance for a frame, asynchronously.
///
/// The controller only ever asks whether a job has finished. What the job produced is for the
/// presentation layer.
pub(crate) trait EscalationPipeline {
    type Frame;

    /// Start a job. Must not block on the job itself.
    fn submit(&mut self, frame: &Self::Frame, evidence: &Evidence) -> JobHandle;

    fn is_complete(&self, job: &JobHandle) -> bool {
        job.is_complete()
    }
}

/// Describes a scene from an image and a prompt.
pub(crate) trait Analyzer: Send + Sync {
    fn analyze(&self, jpeg: &[u8], prompt: &str) -> Result<String, Error>;
}

/// Turns guidance text into encoded speech audio.
pub(crate) trait Synthesizer: Send + Sync {
    fn synthesize(&self, text: &str) -> Result<Vec<u8>, Error>;
}

/// Spoken instead of an analysis when a still shows no distress.
pub(crate) const NO_DISTRESS_RESPONSE: &str = "No distress detected. The scene appears safe.";

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Guidance {
    pub(crate) text: String,
    pub(crate) image: PathBuf,
    pub(crate) pose_image: Option<PathBuf>,
    pub(crate) audio: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum JobOutcome {
    Completed(Guidance),
    Failed(String),
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed(guidance) => f.write_str(&guidance.text),
            Self::Failed(reason) => write!(f, "guidance failed: {}", reason),
        }
    }
}

/// Handle to an escalation job running on its own thread.
#[derive(Debug, Clone, Default)]
pub(crate) struct JobHandle {
    done: Arc<AtomicBool>,
    outcome: Arc<Mutex<Option<JobOutcome>>>,
}

/// Marks the job complete when dropped, so a panicking job still finishes.
struct CompleteOnDrop(Arc<AtomicBool>);

impl Drop for CompleteOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl JobHandle {
    pub(crate) fn spawn<F>(name: &str, job: F) -> Self
    where
        F: FnOnce() -> Result<Guidance, Error> + Send + 'static,
    {
        let handle = Self::default();
        let done = CompleteOnDrop(handle.done.clone());
        let outcome = handle.outcome.clone();

        let spawned = thread::Builder::new().name(name.to_owned()).spawn(move || {
            let _done = done;
            let result = match job() {
                Ok(guidance) => JobOutcome::Completed(guidance),
                Err(error) => {
                    error!(message = "escalation job failed", %error);
                    JobOutcome::Failed(error.to_string())
                }
            };
            *outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
        });

        match spawned {
            Ok(_) => handle,
            Err(e) => {
                let error = Error::SpawnThread("escalation", e);
                error!(message = "failed to launch escalation job", %error);
                Self::finished(JobOutcome::Failed(error.to_string()))
            }
        }
    }

    /// A job that is already over, used when the job cannot even be launched.
    pub(crate) fn finished(outcome: JobOutcome) -> Self {
        let handle = Self::default();
        handle.complete(outcome);
        handle
    }

    pub(crate) fn complete(&self, outcome: JobOutcome) {
        *self
            .outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(outcome);
        self.done.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// `None` while running, and for a job that panicked.
    pub(crate) fn outcome(&self) -> Option<JobOutcome> {
        self.outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

pub(crate) fn format_sites(sites: &SiteMap) -> String {
    if sites.is_empty() {
        return "none".to_owned();
    }
    sites
        .iter()
        .map(|site| format!("{}: ({:.0},{:.0})", site.key(), site.point.x, site.point.y))
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn build_prompt(reason: &str, sites: &str) -> String {
    format!(
        "You are an emergency medical assistant guiding a bystander through a crisis. \
         Pose detection found: {}. \
         Anatomical landmarks: {}. \
         In 2-3 calm, clear sentences: describe what you see, assess the situation, \
         and give the single most important first-aid instruction RIGHT NOW.",
        reason, sites
    )
}

/// Frame → analysis → speech → playback, with every artifact saved under `out_dir`.
pub(crate) struct GuidancePipeline {
    out_dir: PathBuf,
    analyzer: Arc<dyn Analyzer>,
    synthesizer: Option<Arc<dyn Synthesizer>>,
    player: Option<Arc<dyn GuidancePlayer>>,
}

impl GuidancePipeline {
    pub(crate) fn new(
        out_dir: PathBuf,
        analyzer: Arc<dyn Analyzer>,
        synthesizer: Option<Arc<dyn Synthesizer>>,
        player: Option<Arc<dyn GuidancePlayer>>,
    ) -> Self {
        Self {
            out_dir,
            analyzer,
            synthesizer,
            player,
        }
    }

    fn job(&self, jpeg: Vec<u8>, prompt: Option<String>) -> Job {
        Job {
            out_dir: self.out_dir.clone(),
            stem: chrono::Local::now().format("%Y%m%d_%H%M%S").to_string(),
            jpeg,
            annotated: None,
            prompt,
            analyzer: self.analyzer.clone(),
            synthesizer: self.synthesizer.clone(),
            player: self.player.clone(),
        }
    }

    /// Guidance for a single still, on the calling thread.
    ///
    /// A still without distress skips analysis and gets [`NO_DISTRESS_RESPONSE`]. `prompt`
    /// replaces the generated analysis prompt.
    pub(crate) fn run_once(
        &self,
        jpeg: Vec<u8>,
        annotated: Option<Vec<u8>>,
        evidence: &Evidence,
        prompt: Option<&str>,
    ) -> Result<Guidance, Error> {
        let prompt = if evidence.is_distressed() {
            Some(prompt.map(ToOwned::to_owned).unwrap_or_else(|| {
                build_prompt(&evidence.reason(), &format_sites(&evidence.sites))
            }))
        } else {
            None
        };
        let mut job = self.job(jpeg, prompt);
        job.annotated = annotated;
        job.run()
    }
}

pub(crate) fn encode_jpeg(frame: &Mat) -> Result<Vec<u8>, Error> {
    let mut buf = Vector::<u8>::new();
    imencode(".jpg", frame, &mut buf, &Vector::new()).map_err(Error::EncodeFrame)?;
    Ok(buf.to_vec())
}

impl EscalationPipeline for GuidancePipeline {
    type Frame = Mat;

    fn submit(&mut self, frame: &Mat, evidence: &Evidence) -> JobHandle {
        let jpeg = match encode_jpeg(frame) {
            Ok(jpeg) => jpeg,
            Err(error) => {
                error!(message = "failed to encode escalation frame", %error);
                return JobHandle::finished(JobOutcome::Failed(error.to_string()));
            }
        };
        let prompt = build_prompt(&evidence.reason(), &format_sites(&evidence.sites));
        let job = self.job(jpeg, Some(prompt));
        info!(
            message = "escalation job submitted",
            stem = %job.stem,
            findings = evidence.count(),
            sites = evidence.sites.len()
        );
        JobHandle::spawn("escalation", move || job.run())
    }
}

struct Job {
    out_dir: PathBuf,
    stem: String,
    jpeg: Vec<u8>,
    /// The frame with poses drawn on, saved as `{stem}_pose.jpg`.
    annotated: Option<Vec<u8>>,
    /// `None` when nothing was detected and analysis is skipped.
    prompt: Option<String>,
    analyzer: Arc<dyn Analyzer>,
    synthesizer: Option<Arc<dyn Synthesizer>>,
    player: Option<Arc<dyn GuidancePlayer>>,
}

fn write(path: PathBuf, contents: &[u8]) -> Result<PathBuf, Error> {
    std::fs::write(&path, contents).map_err(|e| Error::WriteFile(e, path.clone()))?;
    Ok(path)
}

impl Job {
    fn artifact(&self, suffix: &str) -> PathBuf {
        self.out_dir.join(format!("{}{}", self.stem, suffix))
    }

    #[instrument(name = "Job::run", skip(self), fields(stem = %self.stem))]
    fn run(self) -> Result<Guidance, Error> {
        std::fs::create_dir_all(&self.out_dir)
            .map_err(|e| Error::CreateDir(e, self.out_dir.clone()))?;
        let image = write(self.artifact(".jpg"), &self.jpeg)?;
        info!(message = "frame saved", path = ?image);

        let pose_image = match &self.annotated {
            Some(annotated) => Some(write(self.artifact("_pose.jpg"), annotated)?),
            None => None,
        };

        let text = match &self.prompt {
            Some(prompt) => {
                let text = self.analyzer.analyze(&self.jpeg, prompt)?;
                info!(message = "guidance received", %text);
                text
            }
            None => {
                info!(message = "no distress, skipping analysis");
                NO_DISTRESS_RESPONSE.to_owned()
            }
        };
        write(self.artifact(".txt"), text.as_bytes())?;

        let audio = match &self.synthesizer {
            Some(synthesizer) => {
                let speech = synthesizer.synthesize(&text)?;
                let path = write(self.artifact(".mp3"), &speech)?;
                if let Some(player) = &self.player {
                    play(player.as_ref(), &path);
                }
                Some(path)
            }
            None => None,
        };

        Ok(Guidance {
            text,
            image,
            pose_image,
            audio,
        })
    }
}

/// Playback is best effort: the guidance text is already saved.
fn play(player: &dyn GuidancePlayer, path: &Path) {
    match player.play(path) {
        Ok(()) => info!(message = "guidance played"),
        Err(error) => warn!(message = "guidance playback failed", %error),
    }
}
