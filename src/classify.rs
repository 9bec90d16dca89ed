use crate::{
    pose::{KeypointKind::*, Skeleton},
    sites::{map_sites, SiteMap},
};
use opencv::core::Point2f;
use std::fmt;

/// Nose this far below the hip line counts as a fall.
const HEAD_BELOW_HIP_PX: f32 = 20.0;
const TORSO_HORIZONTAL_RATIO: f32 = 1.5;
const TORSO_HORIZONTAL_MAX_DY: f32 = 100.0;
const BODY_SPREAD_RATIO: f32 = 1.8;
const BODY_SPREAD_MIN_POINTS: usize = 4;
const FACE_ZONE_MARGIN: f32 = 0.5;
const CROUCH_MAX_TORSO: f32 = 40.0;
const CROUCH_MAX_HEAD_TO_HIP: f32 = 60.0;
const LOW_IN_FRAME_FRACTION: f32 = 0.75;
const LOW_IN_FRAME_MIN_POINTS: usize = 3;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Reason {
    HeadBelowHips,
    TorsoHorizontal,
    BodySpreadHorizontal,
    HandsAboveHead,
    HandsCoveringFace,
    HandNearFace,
    Crouched,
    BodyLow,
}

impl Reason {
    pub(crate) fn description(self) -> &'static str {
        match self {
            Self::HeadBelowHips => "head below hips - possible fall",
            Self::TorsoHorizontal => "torso horizontal - lying down",
            Self::BodySpreadHorizontal => "body spread horizontal - on the ground",
            Self::HandsAboveHead => "hands above head - distress posture",
            Self::HandsCoveringFace => "hands covering face - distress posture",
            Self::HandNearFace => "hand near face - possible distress",
            Self::Crouched => "crouched/curled posture",
            Self::BodyLow => "body very low - possible collapse",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// A reason attributed to one person (1-based, in detection order).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Finding {
    pub(crate) person: usize,
    pub(crate) reason: Reason,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Person {}: {}", self.person, self.reason)
    }
}

/// Distress evidence for a single frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Evidence {
    pub(crate) findings: Vec<Finding>,
    pub(crate) sites: SiteMap,
    pub(crate) num_persons: usize,
}

impl Evidence {
    pub(crate) fn count(&self) -> usize {
        self.findings.len()
    }

    pub(crate) fn is_distressed(&self) -> bool {
        self.count() > 0
    }

    /// Human readable summary of the frame.
    pub(crate) fn reason(&self) -> String {
        if self.num_persons == 0 {
            "No person detected".to_owned()
        } else if self.findings.is_empty() {
            "No distress posture detected".to_owned()
        } else {
            self.findings
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ")
        }
    }

    #[cfg(test)]
    pub(crate) fn has(&self, person: usize, reason: Reason) -> bool {
        self.findings
            .iter()
            .any(|finding| finding.person == person && finding.reason == reason)
    }
}

/// Classify every skeleton in a frame and union the results.
pub(crate) fn classify(skeletons: &[Skeleton], frame_height: f32) -> Evidence {
    let mut evidence = Evidence {
        num_persons: skeletons.len(),
        ..Default::default()
    };

    for (i, skeleton) in skeletons.iter().enumerate() {
        let person = i + 1;
        evidence.findings.extend(
            check_skeleton(skeleton, frame_height)
                .into_iter()
                .map(|reason| Finding { person, reason }),
        );
        evidence.sites.extend_person(person, map_sites(skeleton));
    }

    evidence
}

/// Run the posture checks on one skeleton. Checks whose keypoints are missing are skipped.
pub(crate) fn check_skeleton(skeleton: &Skeleton, frame_height: f32) -> Vec<Reason> {
    let nose = skeleton.visible(Nose);
    let mid_shoulder = skeleton.midpoint(LeftShoulder, RightShoulder);
    let mid_hip = skeleton.midpoint(LeftHip, RightHip);

    let mut reasons = Vec::new();

    if let (Some(nose), Some(mid_hip)) = (nose, mid_hip) {
        if nose.y - mid_hip.y > HEAD_BELOW_HIP_PX {
            reasons.push(Reason::HeadBelowHips);
        }
    }

    if let (Some(shoulder), Some(hip)) = (mid_shoulder, mid_hip) {
        let dy = (shoulder.y - hip.y).abs();
        let dx = (shoulder.x - hip.x).abs();
        if dx > dy * TORSO_HORIZONTAL_RATIO && dy < TORSO_HORIZONTAL_MAX_DY {
            reasons.push(Reason::TorsoHorizontal);
        }
    }

    if body_spread_horizontal(skeleton) {
        reasons.push(Reason::BodySpreadHorizontal);
    }

    if let (Some(nose), Some(shoulder)) = (nose, mid_shoulder) {
        let wrists = [skeleton.visible(LeftWrist), skeleton.visible(RightWrist)];
        if let Some(reason) = hands_reason(nose, shoulder, &wrists) {
            reasons.push(reason);
        }
    }

    if let (Some(nose), Some(shoulder), Some(hip)) = (nose, mid_shoulder, mid_hip) {
        let torso = (shoulder.y - hip.y).abs();
        let head_to_hip = (nose.y - hip.y).abs();
        if torso < CROUCH_MAX_TORSO && head_to_hip < CROUCH_MAX_HEAD_TO_HIP {
            reasons.push(Reason::Crouched);
        }
    }

    let core = [Nose, LeftShoulder, RightShoulder, LeftHip, RightHip]
        .iter()
        .filter_map(|&kind| skeleton.visible(kind))
        .collect::<Vec<_>>();
    if core.len() >= LOW_IN_FRAME_MIN_POINTS {
        let mean_y = core.iter().map(|p| p.y).sum::<f32>() / core.len() as f32;
        if mean_y > frame_height * LOW_IN_FRAME_FRACTION {
            reasons.push(Reason::BodyLow);
        }
    }

    reasons
}

fn body_spread_horizontal(skeleton: &Skeleton) -> bool {
    let points = [
        Nose,
        LeftShoulder,
        RightShoulder,
        LeftHip,
        RightHip,
        LeftAnkle,
        RightAnkle,
        LeftWrist,
        RightWrist,
    ]
    .iter()
    .filter_map(|&kind| skeleton.visible(kind))
    .collect::<Vec<_>>();

    if points.len() < BODY_SPREAD_MIN_POINTS {
        return false;
    }

    let (min_x, max_x, min_y, max_y) = points.iter().fold(
        (f32::MAX, f32::MIN, f32::MAX, f32::MIN),
        |(min_x, max_x, min_y, max_y), p| {
            (min_x.min(p.x), max_x.max(p.x), min_y.min(p.y), max_y.max(p.y))
        },
    );
    let width = max_x - min_x;
    let height = max_y - min_y;

    height > 0.0 && width / height > BODY_SPREAD_RATIO
}

/// Tiered: any hand above the head wins, then two hands at the face, then one.
fn hands_reason(nose: Point2f, shoulder: Point2f, wrists: &[Option<Point2f>]) -> Option<Reason> {
    let face_zone_bottom = shoulder.y + (shoulder.y - nose.y).abs() * FACE_ZONE_MARGIN;

    let (above, on_face) = wrists
        .iter()
        .flatten()
        .fold((0, 0), |(above, on_face), wrist| {
            if wrist.y < nose.y {
                (above + 1, on_face)
            } else if wrist.y < face_zone_bottom {
                (above, on_face + 1)
            } else {
                (above, on_face)
            }
        });

    if above >= 1 {
        Some(Reason::HandsAboveHead)
    } else if above + on_face >= 2 {
        Some(Reason::HandsCoveringFace)
    } else if on_face == 1 {
        Some(Reason::HandNearFace)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::{check_skeleton, classify, Reason};
    use crate::pose::{testing::skeleton, KeypointKind::*, Skeleton};

    const FRAME_HEIGHT: f32 = 480.0;

    /// Upright person standing mid-frame, nothing should fire.
    fn standing() -> Vec<(crate::pose::KeypointKind, f32, f32)> {
        vec![
            (Nose, 320.0, 60.0),
            (LeftShoulder, 300.0, 120.0),
            (RightShoulder, 340.0, 120.0),
            (LeftWrist, 290.0, 260.0),
            (RightWrist, 350.0, 260.0),
            (LeftHip, 305.0, 250.0),
            (RightHip, 335.0, 250.0),
            (LeftAnkle, 305.0, 420.0),
            (RightAnkle, 335.0, 420.0),
        ]
    }

    fn with(
        mut points: Vec<(crate::pose::KeypointKind, f32, f32)>,
        kind: crate::pose::KeypointKind,
        x: f32,
        y: f32,
    ) -> Skeleton {
        points.retain(|&(k, _, _)| k != kind);
        points.push((kind, x, y));
        skeleton(&points)
    }

    #[test]
    fn standing_is_not_distressed() {
        assert!(check_skeleton(&skeleton(&standing()), FRAME_HEIGHT).is_empty());
    }

    #[test]
    fn no_visible_keypoints_is_empty() {
        let evidence = classify(&[Skeleton::default(), Skeleton::default()], FRAME_HEIGHT);
        assert_eq!(evidence.count(), 0);
        assert!(!evidence.is_distressed());
        assert!(evidence.sites.is_empty());
        assert_eq!(evidence.reason(), "No distress posture detected");
    }

    #[test]
    fn no_persons() {
        let evidence = classify(&[], FRAME_HEIGHT);
        assert!(!evidence.is_distressed());
        assert_eq!(evidence.reason(), "No person detected");
    }

    mod fallen {
        use super::*;

        fn nose_and_hips(nose_y: f32) -> Skeleton {
            skeleton(&[
                (Nose, 200.0, nose_y),
                (LeftHip, 190.0, 100.0),
                (RightHip, 210.0, 100.0),
            ])
        }

        #[test]
        fn nose_below_hips() {
            let reasons = check_skeleton(&nose_and_hips(150.0), FRAME_HEIGHT);
            assert!(reasons.contains(&Reason::HeadBelowHips));
        }

        #[test]
        fn nose_level_with_hips() {
            let reasons = check_skeleton(&nose_and_hips(100.0), FRAME_HEIGHT);
            assert!(!reasons.contains(&Reason::HeadBelowHips));
        }

        #[test]
        fn exactly_twenty_pixels_does_not_fire() {
            let reasons = check_skeleton(&nose_and_hips(120.0), FRAME_HEIGHT);
            assert!(!reasons.contains(&Reason::HeadBelowHips));
        }

        #[test]
        fn missing_hip_skips_check() {
            let s = skeleton(&[(Nose, 200.0, 300.0), (LeftHip, 190.0, 100.0)]);
            assert!(check_skeleton(&s, FRAME_HEIGHT).is_empty());
        }
    }

    mod torso {
        use super::*;

        fn torso(shoulder: (f32, f32), hip: (f32, f32)) -> Vec<Reason> {
            let s = skeleton(&[
                (LeftShoulder, shoulder.0, shoulder.1),
                (RightShoulder, shoulder.0, shoulder.1),
                (LeftHip, hip.0, hip.1),
                (RightHip, hip.0, hip.1),
            ]);
            check_skeleton(&s, FRAME_HEIGHT)
        }

        #[test]
        fn lying_torso_fires() {
            let s = skeleton(&[
                (LeftShoulder, 100.0, 200.0),
                (RightShoulder, 100.0, 220.0),
                (LeftHip, 250.0, 230.0),
                (RightHip, 250.0, 250.0),
            ]);
            let reasons = check_skeleton(&s, FRAME_HEIGHT);
            assert!(reasons.contains(&Reason::TorsoHorizontal));
        }

        #[test]
        fn upright_torso_does_not_fire() {
            // dx = 10, dy = 130
            let reasons = torso((320.0, 120.0), (330.0, 250.0));
            assert!(!reasons.contains(&Reason::TorsoHorizontal));
        }

        #[test]
        fn dx_exactly_one_and_a_half_dy_does_not_fire() {
            // dx = 30, dy = 20
            let reasons = torso((100.0, 200.0), (130.0, 220.0));
            assert!(!reasons.contains(&Reason::TorsoHorizontal));
        }

        #[test]
        fn large_vertical_offset_does_not_fire() {
            // dx = 400 dominates, but dy = 100 is too tall for lying down
            let reasons = torso((100.0, 100.0), (500.0, 200.0));
            assert!(!reasons.contains(&Reason::TorsoHorizontal));
        }

        #[test]
        fn just_under_the_vertical_limit_fires() {
            let reasons = torso((100.0, 100.0), (500.0, 199.0));
            assert!(reasons.contains(&Reason::TorsoHorizontal));
        }
    }

    mod body_spread {
        use super::*;

        #[test]
        fn wide_body_fires() {
            let s = skeleton(&[
                (Nose, 50.0, 300.0),
                (LeftShoulder, 120.0, 290.0),
                (LeftHip, 300.0, 310.0),
                (LeftAnkle, 500.0, 320.0),
            ]);
            assert!(check_skeleton(&s, FRAME_HEIGHT).contains(&Reason::BodySpreadHorizontal));
        }

        #[test]
        fn three_points_is_not_enough() {
            let s = skeleton(&[
                (Nose, 50.0, 300.0),
                (LeftHip, 300.0, 310.0),
                (LeftAnkle, 500.0, 320.0),
            ]);
            assert!(!check_skeleton(&s, FRAME_HEIGHT).contains(&Reason::BodySpreadHorizontal));
        }

        #[test]
        fn zero_height_does_not_fire() {
            let s = skeleton(&[
                (Nose, 50.0, 100.0),
                (LeftShoulder, 120.0, 100.0),
                (LeftHip, 300.0, 100.0),
                (LeftAnkle, 500.0, 100.0),
            ]);
            assert!(!check_skeleton(&s, FRAME_HEIGHT).contains(&Reason::BodySpreadHorizontal));
        }
    }

    mod hands {
        use super::*;

        fn hand_reasons(s: &Skeleton) -> Vec<Reason> {
            check_skeleton(s, FRAME_HEIGHT)
                .into_iter()
                .filter(|reason| {
                    matches!(
                        reason,
                        Reason::HandsAboveHead | Reason::HandsCoveringFace | Reason::HandNearFace
                    )
                })
                .collect()
        }

        #[test]
        fn both_wrists_above_head() {
            let mut points = standing();
            points.retain(|&(k, _, _)| k != LeftWrist && k != RightWrist);
            points.push((LeftWrist, 290.0, 20.0));
            points.push((RightWrist, 350.0, 30.0));
            let reasons = hand_reasons(&skeleton(&points));
            assert_eq!(reasons, vec![Reason::HandsAboveHead]);
            assert!(!reasons.contains(&Reason::HandsCoveringFace));
        }

        #[test]
        fn one_above_one_on_face_is_above_head() {
            let mut points = standing();
            points.retain(|&(k, _, _)| k != LeftWrist && k != RightWrist);
            points.push((LeftWrist, 300.0, 40.0));
            points.push((RightWrist, 330.0, 100.0));
            assert_eq!(hand_reasons(&skeleton(&points)), vec![Reason::HandsAboveHead]);
        }

        #[test]
        fn both_on_face() {
            let mut points = standing();
            points.retain(|&(k, _, _)| k != LeftWrist && k != RightWrist);
            // face zone is [60, 150)
            points.push((LeftWrist, 310.0, 80.0));
            points.push((RightWrist, 330.0, 145.0));
            assert_eq!(
                hand_reasons(&skeleton(&points)),
                vec![Reason::HandsCoveringFace]
            );
        }

        #[test]
        fn exactly_one_on_face() {
            let s = with(standing(), LeftWrist, 310.0, 90.0);
            assert_eq!(hand_reasons(&s), vec![Reason::HandNearFace]);
        }

        #[test]
        fn wrist_at_nose_height_is_on_face() {
            let s = with(standing(), RightWrist, 330.0, 60.0);
            assert_eq!(hand_reasons(&s), vec![Reason::HandNearFace]);
        }

        #[test]
        fn wrist_at_bottom_of_face_zone_is_not_on_face() {
            // face zone is [60, 150)
            let s = with(standing(), LeftWrist, 310.0, 150.0);
            assert!(hand_reasons(&s).is_empty());
        }

        #[test]
        fn wrist_just_inside_face_zone_is_on_face() {
            let s = with(standing(), LeftWrist, 310.0, 149.0);
            assert_eq!(hand_reasons(&s), vec![Reason::HandNearFace]);
        }

        #[test]
        fn missing_nose_skips_check() {
            let mut points = standing();
            points.retain(|&(k, _, _)| k != Nose);
            points.retain(|&(k, _, _)| k != LeftWrist);
            points.push((LeftWrist, 300.0, 10.0));
            assert!(hand_reasons(&skeleton(&points)).is_empty());
        }
    }

    mod crouched {
        use super::*;

        fn curled(nose_y: f32, shoulder_y: f32, hip_y: f32) -> Vec<Reason> {
            let s = skeleton(&[
                (Nose, 320.0, nose_y),
                (LeftShoulder, 300.0, shoulder_y),
                (RightShoulder, 340.0, shoulder_y),
                (LeftHip, 305.0, hip_y),
                (RightHip, 335.0, hip_y),
            ]);
            check_skeleton(&s, FRAME_HEIGHT)
        }

        #[test]
        fn compact_pose_fires() {
            assert!(curled(230.0, 240.0, 270.0).contains(&Reason::Crouched));
        }

        #[test]
        fn torso_of_forty_does_not_fire() {
            // head to hip is 50
            assert!(!curled(220.0, 230.0, 270.0).contains(&Reason::Crouched));
        }

        #[test]
        fn head_to_hip_of_sixty_does_not_fire() {
            // torso is 30
            assert!(!curled(210.0, 240.0, 270.0).contains(&Reason::Crouched));
        }

        #[test]
        fn missing_nose_skips_check() {
            let s = skeleton(&[
                (LeftShoulder, 300.0, 240.0),
                (RightShoulder, 340.0, 240.0),
                (LeftHip, 305.0, 270.0),
                (RightHip, 335.0, 270.0),
            ]);
            assert!(!check_skeleton(&s, FRAME_HEIGHT).contains(&Reason::Crouched));
        }
    }

    mod body_low {
        use super::*;

        #[test]
        fn low_in_frame_fires() {
            let s = skeleton(&[
                (Nose, 320.0, 400.0),
                (LeftShoulder, 300.0, 380.0),
                (RightShoulder, 340.0, 380.0),
            ]);
            assert!(check_skeleton(&s, FRAME_HEIGHT).contains(&Reason::BodyLow));
            assert!(!check_skeleton(&s, 600.0).contains(&Reason::BodyLow));
        }

        #[test]
        fn two_core_points_is_not_enough() {
            let s = skeleton(&[(Nose, 320.0, 470.0), (LeftShoulder, 300.0, 470.0)]);
            assert!(!check_skeleton(&s, FRAME_HEIGHT).contains(&Reason::BodyLow));
        }

        #[test]
        fn mean_exactly_three_quarters_does_not_fire() {
            // 0.75 * 480 = 360
            let s = skeleton(&[
                (Nose, 320.0, 350.0),
                (LeftShoulder, 300.0, 360.0),
                (RightShoulder, 340.0, 370.0),
            ]);
            assert!(!check_skeleton(&s, FRAME_HEIGHT).contains(&Reason::BodyLow));
        }

        #[test]
        fn wrists_and_ankles_do_not_count() {
            let s = skeleton(&[
                (Nose, 320.0, 100.0),
                (LeftWrist, 300.0, 470.0),
                (RightWrist, 340.0, 470.0),
                (LeftAnkle, 300.0, 470.0),
            ]);
            assert!(!check_skeleton(&s, FRAME_HEIGHT).contains(&Reason::BodyLow));
        }
    }

    #[test]
    fn findings_are_labelled_per_person() {
        let fallen = skeleton(&[
            (Nose, 200.0, 150.0),
            (LeftHip, 190.0, 100.0),
            (RightHip, 210.0, 100.0),
        ]);
        let evidence = classify(&[skeleton(&standing()), fallen], FRAME_HEIGHT);
        assert_eq!(evidence.num_persons, 2);
        assert!(evidence.is_distressed());
        assert!(evidence.has(2, Reason::HeadBelowHips));
        assert!(!evidence.has(1, Reason::HeadBelowHips));
        assert!(evidence
            .reason()
            .starts_with("Person 2: head below hips - possible fall"));
    }
}
