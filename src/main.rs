use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use num_traits::cast::ToPrimitive;
use opencv::prelude::*;
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use structopt::StructOpt;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;

mod alarm;
mod classify;
mod controller;
mod display;
mod error;
mod escalate;
mod estimate;
mod interrupt;
mod pose;
mod remote;
mod sites;
mod source;

use alarm::{AlarmActuator, RemoteAlarm};
use controller::{DistressController, Policy};
use escalate::{
    Analyzer, ElevenLabs, Gemini, GuidancePipeline, GuidancePlayer, JobOutcome, RemotePlayer,
    Synthesizer,
};
use estimate::{PoseEstimator, YoloPose};
use interrupt::{ButtonListener, InterruptFlag, InterruptSignal};
use remote::Remote;
use source::{Capture, FrameSource, MjpegStream, Rotated};

type Controller =
    DistressController<Box<dyn AlarmActuator>, GuidancePipeline, Box<dyn InterruptSignal>>;

#[derive(structopt::StructOpt)]
#[structopt(about = "Live distress detection with an audible alarm and on-demand guidance")]
struct Opt {
    /// A v4l2 device number (/dev/videoN) or a video file/URL. Ignored with --ssh-stream.
    #[structopt(short, long, default_value = "0")]
    source: String,

    /// Stream MJPEG from the camera host's rpicam-vid over ssh instead of a local source.
    #[structopt(long)]
    ssh_stream: bool,

    /// The width of the input frame.
    #[structopt(long, default_value = "640")]
    frame_width: u16,

    /// The height of the input frame.
    #[structopt(long, default_value = "480")]
    frame_height: u16,

    /// Camera frame rate, for --ssh-stream.
    #[structopt(long, default_value = "15")]
    fps: u16,

    /// Seconds without camera data before --ssh-stream gives up.
    #[structopt(long, default_value = "10")]
    frame_timeout_secs: u64,

    /// Rotate frames 90 degrees counter-clockwise.
    #[structopt(long)]
    rotate: bool,

    /// Path to a YOLOv8 pose ONNX model.
    #[structopt(short, long, default_value = "yolov8n-pose.onnx", parse(from_os_str))]
    model: PathBuf,

    /// Square input size the model expects.
    #[structopt(long, default_value = "640")]
    input_size: i32,

    /// Person detection score threshold.
    #[structopt(short, long, default_value = "0.5")]
    threshold: f32,

    /// IoU above which overlapping detections are suppressed.
    #[structopt(long, default_value = "0.45")]
    iou_threshold: f32,

    #[structopt(long, env = "PI_USER", default_value = "pi")]
    pi_user: String,

    #[structopt(long, env = "PI_HOST", default_value = "raspberrypi.local")]
    pi_host: String,

    /// SSH connect timeout in seconds.
    #[structopt(long, default_value = "10")]
    connect_timeout_secs: u64,

    /// mpg123 output module on the camera host.
    #[structopt(long, env = "PI_AUDIO_DEVICE", default_value = "pulse")]
    audio_device: String,

    /// GPIO pin (BCM numbering) of the guidance button.
    #[structopt(long, env = "GPIO_PIN", default_value = "17")]
    pin: u8,

    /// Don't listen for the hardware button.
    #[structopt(long)]
    no_button: bool,

    /// Alarm sound, uploaded to the camera host at startup.
    #[structopt(long, default_value = "alarm.mp3", parse(from_os_str))]
    alarm_file: PathBuf,

    /// Sound the alarm and play guidance on this machine instead of the camera host.
    #[cfg(feature = "local-audio")]
    #[structopt(long)]
    local_audio: bool,

    #[structopt(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    gemini_api_key: Option<String>,

    #[structopt(long, default_value = "gemini-2.5-flash")]
    gemini_model: String,

    #[structopt(long, env = "ELEVENLABS_API_KEY", hide_env_values = true)]
    elevenlabs_api_key: Option<String>,

    /// ElevenLabs voice, defaults to a stock voice.
    #[structopt(long, env = "ELEVENLABS_VOICE_ID")]
    voice_id: Option<String>,

    /// Save guidance text only; skip speech synthesis and playback.
    #[structopt(long)]
    text_only: bool,

    /// Save guidance audio without playing it.
    #[structopt(long)]
    no_play: bool,

    /// Check a single still and speak guidance for it, then exit.
    #[structopt(long)]
    once: bool,

    /// With --once, analyze this image instead of taking a still on the camera host.
    #[structopt(long, requires = "once", parse(from_os_str))]
    image: Option<PathBuf>,

    /// With --once, replaces the generated analysis prompt.
    #[structopt(short, long, requires = "once")]
    prompt: Option<String>,

    /// Where captured frames, guidance text and audio are written.
    #[structopt(short, long, default_value = "captures", parse(from_os_str))]
    out_dir: PathBuf,

    /// Consecutive distressed frames before the alarm sounds.
    #[structopt(long, default_value = "5")]
    distress_threshold: u32,

    /// Minimum seconds between honored button presses.
    #[structopt(long, default_value = "5")]
    cooldown_secs: u64,

    #[structopt(short = "-W", long, default_value = "1")]
    wait_key_ms: i32,

    #[structopt(short, long, default_value = "info", env = "RUST_LOG")]
    log_level: tracing_subscriber::filter::EnvFilter,

    #[structopt(long)]
    show_progress: bool,
}

impl Opt {
    fn remote(&self) -> Remote {
        Remote::new(
            &self.pi_user,
            &self.pi_host,
            Duration::from_secs(self.connect_timeout_secs),
        )
    }

    fn player(&self) -> String {
        format!("mpg123 -q -o {}", self.audio_device)
    }
}

fn frame_source(opt: &Opt) -> Result<Box<dyn FrameSource>> {
    let source: Box<dyn FrameSource> = if opt.ssh_stream {
        Box::new(
            MjpegStream::spawn(
                &opt.remote(),
                opt.frame_width,
                opt.frame_height,
                opt.fps,
                Duration::from_secs(opt.frame_timeout_secs),
            )
            .context("failed starting camera stream")?,
        )
    } else {
        Box::new(
            Capture::open(&opt.source, Some(opt.frame_width), Some(opt.frame_height))
                .context("failed opening video capture")?,
        )
    };
    Ok(if opt.rotate {
        Box::new(Rotated(source))
    } else {
        source
    })
}

fn alarm_actuator(opt: &Opt) -> Result<Box<dyn AlarmActuator>> {
    #[cfg(feature = "local-audio")]
    {
        if opt.local_audio {
            return Ok(Box::new(
                alarm::LocalAlarm::new(&opt.alarm_file).context("failed loading alarm sound")?,
            ));
        }
    }
    let alarm = RemoteAlarm::new(opt.remote(), opt.player());
    // a silent alarm must not stop monitoring
    if let Err(error) = alarm.upload(&opt.alarm_file) {
        warn!(message = "failed to upload alarm sound", %error);
    }
    Ok(Box::new(alarm))
}

fn guidance_player(opt: &Opt) -> Arc<dyn GuidancePlayer> {
    #[cfg(feature = "local-audio")]
    {
        if opt.local_audio {
            return Arc::new(escalate::LocalPlayer::default());
        }
    }
    Arc::new(RemotePlayer::new(opt.remote(), opt.player()))
}

fn escalation_pipeline(opt: &Opt) -> Result<GuidancePipeline> {
    let analyzer: Arc<dyn Analyzer> = Arc::new(
        Gemini::new(opt.gemini_api_key.clone(), opt.gemini_model.clone())
            .context("failed constructing analysis client")?,
    );
    if opt.gemini_api_key.is_none() {
        warn!(message = "GEMINI_API_KEY is not set, guidance requests will fail");
    }

    let (synthesizer, player) = if opt.text_only {
        (None, None)
    } else {
        let synthesizer: Arc<dyn Synthesizer> = Arc::new(
            ElevenLabs::new(
                opt.elevenlabs_api_key.clone(),
                opt.voice_id
                    .clone()
                    .unwrap_or_else(|| escalate::speech::DEFAULT_VOICE_ID.to_owned()),
            )
            .context("failed constructing speech client")?,
        );
        let player = if opt.no_play {
            None
        } else {
            Some(guidance_player(opt))
        };
        (Some(synthesizer), player)
    };

    Ok(GuidancePipeline::new(
        opt.out_dir.clone(),
        analyzer,
        synthesizer,
        player,
    ))
}

/// The interrupt source, and a flag the keyboard can raise on it.
fn interrupt_source(opt: &Opt) -> Result<(Box<dyn InterruptSignal>, InterruptFlag)> {
    if opt.no_button {
        let flag = InterruptFlag::default();
        return Ok((Box::new(flag.clone()), flag));
    }
    let mut listener = ButtonListener::new(opt.remote(), opt.pin);
    listener
        .start()
        .context("failed starting button listener")?;
    let flag = listener.flag();
    Ok((Box::new(listener), flag))
}

/// Still, estimate, classify, then guidance for that one frame.
fn run_once(opt: &Opt, estimator: &mut YoloPose, pipeline: &GuidancePipeline) -> Result<()> {
    let jpeg = match &opt.image {
        Some(path) => std::fs::read(path).with_context(|| format!("failed reading {:?}", path))?,
        None => source::capture_still(&opt.remote(), opt.frame_width, opt.frame_height)
            .context("failed capturing still")?,
    };
    let frame = source::decode_jpeg(&jpeg).context("failed decoding still")?;
    let skeletons = estimator
        .estimate(&frame)
        .context("failed estimating poses")?;
    let frame_height = frame.rows().to_f32().ok_or(error::Error::ConvertToF32)?;
    let evidence = classify::classify(&skeletons, frame_height);
    info!(
        message = "still checked",
        persons = evidence.num_persons,
        distressed = evidence.is_distressed(),
        reason = %evidence.reason()
    );

    let annotated = display::annotate_still(&frame, &skeletons, &evidence, estimator.timing.last)
        .and_then(|annotated| escalate::encode_jpeg(&annotated));
    let annotated = match annotated {
        Ok(annotated) => Some(annotated),
        Err(error) => {
            warn!(message = "failed annotating still", %error);
            None
        }
    };

    let guidance = pipeline
        .run_once(jpeg, annotated, &evidence, opt.prompt.as_deref())
        .context("failed producing guidance")?;
    info!(
        message = "guidance ready",
        text = %guidance.text,
        image = ?guidance.image,
        pose_image = ?guidance.pose_image,
        audio = ?guidance.audio
    );
    Ok(())
}

fn report(job: &escalate::JobHandle) {
    match job.outcome() {
        Some(JobOutcome::Completed(guidance)) => info!(
            message = "guidance ready",
            text = %guidance.text,
            image = ?guidance.image,
            audio = ?guidance.audio
        ),
        Some(JobOutcome::Failed(reason)) => warn!(message = "guidance failed", %reason),
        None => error!(message = "guidance job ended without an outcome"),
    }
}

/// Frame, estimate, classify, tick, present; until stopped or the source fails.
fn run(
    opt: &Opt,
    running: &AtomicBool,
    source: &mut dyn FrameSource,
    estimator: &mut YoloPose,
    controller: &mut Controller,
    keyboard: &InterruptFlag,
    pb_status: Option<&ProgressBar>,
) -> Result<()> {
    let mut nframes = 0_usize;
    while running.load(Ordering::SeqCst) {
        let frame = source.next_frame().context("failed reading frame")?;
        nframes += 1;

        let skeletons = match estimator.estimate(&frame) {
            Ok(skeletons) => skeletons,
            Err(error) => {
                warn!(message = "pose estimation failed", %error);
                Vec::new()
            }
        };
        let frame_height = frame.rows().to_f32().ok_or(error::Error::ConvertToF32)?;
        let evidence = classify::classify(&skeletons, frame_height);

        let state = controller.tick(&frame, &evidence, Instant::now());
        if let Some(job) = controller.take_finished_job() {
            report(&job);
        }

        let inference = estimator.timing.last;
        if let Some(pb_status) = pb_status {
            pb_status.set_message(display::status_line(
                state,
                controller.streak(),
                &evidence,
                inference,
            ));
            pb_status.inc(1);
        }

        #[cfg(feature = "gui")]
        display::draw_overlay(&frame, &skeletons, &evidence, state, inference)
            .context("failed drawing overlay")?;

        match display::wait_key(opt.wait_key_ms).context("failed waiting for key")? {
            display::Key::Quit => running.store(false, Ordering::SeqCst),
            display::Key::Interrupt => keyboard.raise(),
            display::Key::None => {}
        }
    }
    info!(
        message = "stopped",
        frames = nframes,
        inference = ?estimator.timing.inference
    );
    Ok(())
}

fn main() -> Result<()> {
    let mut opt = Opt::from_args();

    tracing::subscriber::set_global_default(
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(std::mem::take(&mut opt.log_level)),
    )?;

    let running = Arc::new(AtomicBool::new(true));
    let running_ctrl_c = running.clone();

    ctrlc::set_handler(move || {
        running_ctrl_c.store(false, Ordering::SeqCst);
    })
    .context("failed setting Ctrl-C handler")?;

    let mut estimator = YoloPose::new(&opt.model, opt.input_size, opt.threshold, opt.iou_threshold)
        .context("failed loading pose model")?;
    info!(message = "pose model ready", model = ?opt.model);

    if opt.once {
        return run_once(&opt, &mut estimator, &escalation_pipeline(&opt)?);
    }

    let (interrupt, keyboard) = interrupt_source(&opt)?;
    let mut controller = DistressController::new(
        alarm_actuator(&opt)?,
        escalation_pipeline(&opt)?,
        interrupt,
        Policy {
            distress_threshold: opt.distress_threshold,
            cooldown: Duration::from_secs(opt.cooldown_secs),
        },
    );
    let mut source = frame_source(&opt)?;

    let pb_status = if opt.show_progress {
        Some(
            ProgressBar::new_spinner().with_style(
                ProgressStyle::default_spinner()
                    .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ")
                    .template("{prefix:.bold.dim} {spinner} {wide_msg}"),
            ),
        )
    } else {
        None
    };

    info!(message = "monitoring for distress");
    let result = run(
        &opt,
        &running,
        source.as_mut(),
        &mut estimator,
        &mut controller,
        &keyboard,
        pb_status.as_ref(),
    );

    controller.shutdown();
    source.release();
    if let Some(pb_status) = pb_status {
        pb_status.finish_and_clear();
    }
    result
}
