use crate::{
    classify::Evidence,
    controller::ControllerState,
    error::Error,
    pose::{constants::KEYPOINT_EDGES, Skeleton},
    sites::Site,
};
use opencv::{
    core::{Mat, Point2f, Point2i, Rect, Scalar},
    imgproc::{FILLED, FONT_HERSHEY_SIMPLEX, LINE_8, LINE_AA, MARKER_CROSS},
    prelude::*,
};
use std::time::Duration;

/// The headline for the current frame.
pub(crate) fn banner(state: ControllerState, evidence: &Evidence) -> String {
    match state {
        ControllerState::Alarm => format!("EMERGENCY! {}", evidence.reason()),
        ControllerState::Escalating => "ANALYZING... guidance in progress".to_owned(),
        ControllerState::Monitoring if evidence.is_distressed() => {
            format!("DISTRESS: {}", evidence.reason())
        }
        ControllerState::Monitoring => "MONITORING - No distress".to_owned(),
    }
}

fn fps(inference: Duration) -> f64 {
    let secs = inference.as_secs_f64();
    if secs > 0.0 {
        1.0 / secs
    } else {
        0.0
    }
}

/// One line summary for the progress spinner.
pub(crate) fn status_line(
    state: ControllerState,
    streak: u32,
    evidence: &Evidence,
    inference: Duration,
) -> String {
    format!(
        "[{}] streak {} | {} | {:.0}ms ({:.0} FPS)",
        state,
        streak,
        banner(state, evidence),
        inference.as_secs_f64() * 1000.0,
        fps(inference)
    )
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(not(feature = "gui"), allow(dead_code))]
pub(crate) enum Key {
    None,
    Quit,
    Interrupt,
}

#[cfg(feature = "gui")]
pub(crate) fn wait_key(delay_ms: i32) -> Result<Key, Error> {
    const ESC: i32 = 27;
    let key = opencv::highgui::wait_key(delay_ms).map_err(Error::WaitKey)?;
    Ok(match key & 0xff {
        k if k == i32::from(b'q') || k == ESC => Key::Quit,
        k if k == i32::from(b' ') => Key::Interrupt,
        _ => Key::None,
    })
}

#[cfg(not(feature = "gui"))]
pub(crate) fn wait_key(_delay_ms: i32) -> Result<Key, Error> {
    Ok(Key::None)
}

type Color = (f64, f64, f64);

const WHITE: Color = (255.0, 255.0, 255.0);
const GREY: Color = (200.0, 200.0, 200.0);

fn to_i(point: Point2f) -> Result<Point2i, Error> {
    point.to().ok_or(Error::ConvertPoint(point))
}

fn site_color(site: Site) -> Color {
    match site {
        Site::SternumCpr => (0.0, 0.0, 255.0),
        Site::LeftOuterThighEpipen | Site::RightOuterThighEpipen => (0.0, 165.0, 255.0),
        Site::LeftNeckPulse | Site::RightNeckPulse => (255.0, 0.0, 255.0),
        Site::ChestCenterAed => (0.0, 255.0, 255.0),
    }
}

/// Label drawn next to a site marker, e.g. `OUTER THIGH EPIPEN`.
fn site_label(site: Site) -> String {
    site.kind().replace('_', " ").to_uppercase()
}

fn put_text(
    out: &mut Mat,
    text: &str,
    origin: Point2i,
    scale: f64,
    color: Color,
) -> Result<(), Error> {
    opencv::imgproc::put_text(
        out,
        text,
        origin,
        FONT_HERSHEY_SIMPLEX,
        scale,
        Scalar::from(color),
        1,       // thickness
        LINE_AA, // line_type
        false,   // bottom_left_origin
    )
    .map_err(Error::PutText)
}

fn fill_banner(out: &mut Mat, height: i32, color: Color) -> Result<(), Error> {
    let width = out.cols();
    opencv::imgproc::rectangle(
        out,
        Rect::new(0, 0, width, height),
        Scalar::from(color),
        FILLED,
        LINE_8,
        0,
    )
    .map_err(Error::DrawRectangle)
}

/// Skeletons and anatomical site markers, drawn onto a copy of `frame`.
fn draw_poses(frame: &Mat, skeletons: &[Skeleton], evidence: &Evidence) -> Result<Mat, Error> {
    const GREEN: Color = (0.0, 255.0, 0.0);
    const YELLOW: Color = (0.0, 255.0, 255.0);

    let mut out = Mat::default();
    frame.copy_to(&mut out).map_err(Error::CopyFrame)?;

    for skeleton in skeletons {
        for keypoint in skeleton.keypoints.iter().filter(|k| k.is_visible()) {
            opencv::imgproc::circle(
                &mut out,
                to_i(keypoint.point)?,
                4,
                Scalar::from(GREEN),
                -1,     // thickness
                LINE_8, // line_type
                0,      // shift
            )
            .map_err(Error::DrawCircle)?;
        }
        for &(a, b) in KEYPOINT_EDGES.iter() {
            if let (Some(a), Some(b)) = (skeleton.visible(a), skeleton.visible(b)) {
                opencv::imgproc::line(
                    &mut out,
                    to_i(a)?,
                    to_i(b)?,
                    Scalar::from(YELLOW),
                    2,      // thickness
                    LINE_8, // line_type
                    0,      // shift
                )
                .map_err(Error::DrawLine)?;
            }
        }
    }

    for site in evidence.sites.iter() {
        let color = site_color(site.site);
        let center = to_i(site.point)?;
        opencv::imgproc::draw_marker(
            &mut out,
            center,
            Scalar::from(color),
            MARKER_CROSS,
            20,
            2,
            LINE_8,
        )
        .map_err(Error::DrawMarker)?;
        opencv::imgproc::circle(&mut out, center, 12, Scalar::from(color), 2, LINE_8, 0)
            .map_err(Error::DrawCircle)?;
        put_text(
            &mut out,
            &site_label(site.site),
            Point2i::new(center.x + 15, center.y - 5),
            0.4,
            color,
        )?;
    }

    Ok(out)
}

/// A single analyzed still: poses, sites, a distress banner and the inference time.
pub(crate) fn annotate_still(
    frame: &Mat,
    skeletons: &[Skeleton],
    evidence: &Evidence,
    inference: Duration,
) -> Result<Mat, Error> {
    const BANNER_HEIGHT: i32 = 30;

    let mut out = draw_poses(frame, skeletons, evidence)?;
    let (width, height) = (out.cols(), out.rows());

    if evidence.is_distressed() {
        fill_banner(&mut out, BANNER_HEIGHT, (0.0, 0.0, 200.0))?;
        put_text(
            &mut out,
            &format!("DISTRESS: {}", evidence.reason()),
            Point2i::new(5, 20),
            0.45,
            WHITE,
        )?;
    } else {
        fill_banner(&mut out, BANNER_HEIGHT, (0.0, 150.0, 0.0))?;
        put_text(&mut out, "NO DISTRESS DETECTED", Point2i::new(5, 20), 0.5, WHITE)?;
    }

    put_text(
        &mut out,
        &format!("{:.0}ms", inference.as_secs_f64() * 1000.0),
        Point2i::new(width - 70, height - 10),
        0.4,
        GREY,
    )?;
    Ok(out)
}

#[cfg(feature = "gui")]
pub(crate) fn draw_overlay(
    frame: &Mat,
    skeletons: &[Skeleton],
    evidence: &Evidence,
    state: ControllerState,
    inference: Duration,
) -> Result<(), Error> {
    use std::time::{SystemTime, UNIX_EPOCH};

    const BANNER_HEIGHT: i32 = 35;

    let mut out = draw_poses(frame, skeletons, evidence)?;
    let (width, height) = (out.cols(), out.rows());

    let banner_color = match state {
        ControllerState::Alarm => {
            // flash at 2Hz
            let quarter_secs = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() / 250)
                .unwrap_or_default();
            if quarter_secs % 2 == 0 {
                (0.0, 0.0, 255.0)
            } else {
                (0.0, 0.0, 180.0)
            }
        }
        ControllerState::Escalating => (200.0, 100.0, 0.0),
        ControllerState::Monitoring if evidence.is_distressed() => (0.0, 0.0, 200.0),
        ControllerState::Monitoring => (0.0, 150.0, 0.0),
    };
    fill_banner(&mut out, BANNER_HEIGHT, banner_color)?;

    let footer = [
        (banner(state, evidence), Point2i::new(5, 24), 0.5, WHITE),
        (
            format!(
                "{:.0}ms ({:.0} FPS)",
                inference.as_secs_f64() * 1000.0,
                fps(inference)
            ),
            Point2i::new(width - 160, height - 10),
            0.45,
            GREY,
        ),
        (
            format!("[{}]  Q: quit  SPACE: guidance", state),
            Point2i::new(5, height - 10),
            0.4,
            GREY,
        ),
    ];
    for (text, origin, scale, color) in footer.iter() {
        put_text(&mut out, text, *origin, *scale, *color)?;
    }

    opencv::highgui::imshow("guardian eye", &out).map_err(Error::ImShow)
}

#[cfg(test)]
mod tests {
    use super::{annotate_still, banner, site_label, status_line};
    use crate::{
        classify::{classify, Evidence, Finding, Reason},
        controller::ControllerState,
        pose::{testing::skeleton, KeypointKind::*},
        sites::Site,
    };
    use opencv::{
        core::{Mat, Scalar, CV_8UC3},
        prelude::*,
    };
    use std::time::Duration;

    fn black_frame() -> Mat {
        Mat::new_rows_cols_with_default(480, 640, CV_8UC3, Scalar::all(0.0)).unwrap()
    }

    /// BGR value at (row, col) of an 8-bit three channel frame.
    fn pixel(frame: &Mat, row: usize, col: usize) -> [u8; 3] {
        let cols = frame.cols() as usize;
        let data = frame.data_typed::<u8>().unwrap();
        let i = (row * cols + col) * 3;
        [data[i], data[i + 1], data[i + 2]]
    }

    fn crouched() -> Evidence {
        Evidence {
            findings: vec![Finding {
                person: 2,
                reason: Reason::Crouched,
            }],
            num_persons: 2,
            ..Default::default()
        }
    }

    #[test]
    fn banner_follows_state() {
        assert_eq!(
            banner(ControllerState::Alarm, &crouched()),
            "EMERGENCY! Person 2: crouched/curled posture"
        );
        assert_eq!(
            banner(ControllerState::Monitoring, &crouched()),
            "DISTRESS: Person 2: crouched/curled posture"
        );
        assert_eq!(
            banner(ControllerState::Monitoring, &Evidence::default()),
            "MONITORING - No distress"
        );
        assert!(banner(ControllerState::Escalating, &crouched()).starts_with("ANALYZING"));
    }

    #[test]
    fn status_line_reports_timing() {
        let line = status_line(
            ControllerState::Monitoring,
            3,
            &crouched(),
            Duration::from_millis(50),
        );
        assert!(line.starts_with("[MONITORING] streak 3 | DISTRESS"));
        assert!(line.ends_with("50ms (20 FPS)"));
    }

    #[test]
    fn zero_inference_time_has_zero_fps() {
        let line = status_line(
            ControllerState::Alarm,
            5,
            &Evidence::default(),
            Duration::default(),
        );
        assert!(line.ends_with("0ms (0 FPS)"));
    }

    #[test]
    fn site_labels_drop_the_side() {
        assert_eq!(site_label(Site::LeftOuterThighEpipen), "OUTER THIGH EPIPEN");
        assert_eq!(site_label(Site::RightNeckPulse), "NECK PULSE");
        assert_eq!(site_label(Site::SternumCpr), "STERNUM CPR");
    }

    #[test]
    fn calm_still_gets_a_green_banner() {
        let frame = black_frame();
        let annotated =
            annotate_still(&frame, &[], &Evidence::default(), Duration::from_millis(12)).unwrap();
        assert_eq!(annotated.size().unwrap(), frame.size().unwrap());
        assert_eq!(pixel(&annotated, 2, 630), [0, 150, 0]);
        // the input frame is left untouched
        assert_eq!(pixel(&frame, 2, 630), [0, 0, 0]);
    }

    #[test]
    fn distressed_still_gets_a_red_banner_and_markers() {
        let fallen = skeleton(&[
            (Nose, 200.0, 300.0),
            (LeftShoulder, 180.0, 260.0),
            (RightShoulder, 220.0, 260.0),
            (LeftHip, 190.0, 200.0),
            (RightHip, 210.0, 200.0),
        ]);
        let skeletons = [fallen];
        let evidence = classify(&skeletons, 480.0);
        assert!(evidence.is_distressed());

        let annotated =
            annotate_still(&black_frame(), &skeletons, &evidence, Duration::from_millis(12))
                .unwrap();
        assert_eq!(pixel(&annotated, 2, 630), [0, 0, 200]);
        // sternum marker at (200, 260)
        assert_ne!(pixel(&annotated, 260, 200), [0, 0, 0]);
    }
}
