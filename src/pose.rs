use opencv::core::Point2f;

/// Minimum confidence for a keypoint to count as visible.
pub(crate) const VISIBILITY_THRESHOLD: f32 = 0.3;

/// Keypoints in the order the pose network emits them.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, num_derive::FromPrimitive)]
pub(crate) enum KeypointKind {
    Nose,
    LeftEye,
    RightEye,
    LeftEar,
    RightEar,
    LeftShoulder,
    RightShoulder,
    LeftElbow,
    RightElbow,
    LeftWrist,
    RightWrist,
    LeftHip,
    RightHip,
    LeftKnee,
    RightKnee,
    LeftAnkle,
    RightAnkle,
}

impl KeypointKind {
    #[inline]
    pub(crate) fn idx(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub(crate) struct Keypoint {
    pub(crate) point: Point2f,
    pub(crate) confidence: f32,
}

impl Keypoint {
    pub(crate) fn new(x: f32, y: f32, confidence: f32) -> Self {
        Self {
            point: Point2f::new(x, y),
            confidence,
        }
    }

    pub(crate) fn is_visible(&self) -> bool {
        self.confidence >= VISIBILITY_THRESHOLD
    }
}

pub(crate) const NUM_KEYPOINTS: usize = 17;
pub(crate) type Keypoints = [Keypoint; NUM_KEYPOINTS];

/// One detected person.
#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct Skeleton {
    pub(crate) keypoints: Keypoints,
    pub(crate) score: f32,
}

impl Skeleton {
    pub(crate) fn new(keypoints: Keypoints, score: f32) -> Self {
        Self { keypoints, score }
    }

    pub(crate) fn keypoint(&self, kind: KeypointKind) -> &Keypoint {
        &self.keypoints[kind.idx()]
    }

    /// The keypoint's location, or `None` when it is below the visibility threshold.
    pub(crate) fn visible(&self, kind: KeypointKind) -> Option<Point2f> {
        let keypoint = self.keypoint(kind);
        if keypoint.is_visible() {
            Some(keypoint.point)
        } else {
            None
        }
    }

    /// Midpoint of two keypoints, only when both are visible.
    pub(crate) fn midpoint(&self, a: KeypointKind, b: KeypointKind) -> Option<Point2f> {
        Some(midpoint(self.visible(a)?, self.visible(b)?))
    }
}

#[inline]
pub(crate) fn midpoint(a: Point2f, b: Point2f) -> Point2f {
    Point2f::new((a.x + b.x) / 2.0, (a.y + b.y) / 2.0)
}

pub(crate) mod constants {
    use crate::pose::KeypointKind::{self, *};

    pub(crate) const KEYPOINT_EDGES: [(KeypointKind, KeypointKind); 19] = [
        (Nose, LeftEye),
        (Nose, RightEye),
        (Nose, LeftEar),
        (Nose, RightEar),
        (LeftEar, LeftEye),
        (RightEar, RightEye),
        (LeftEye, RightEye),
        (LeftShoulder, RightShoulder),
        (LeftShoulder, LeftElbow),
        (LeftShoulder, LeftHip),
        (RightShoulder, RightElbow),
        (RightShoulder, RightHip),
        (LeftElbow, LeftWrist),
        (RightElbow, RightWrist),
        (LeftHip, RightHip),
        (LeftHip, LeftKnee),
        (RightHip, RightKnee),
        (LeftKnee, LeftAnkle),
        (RightKnee, RightAnkle),
    ];
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{Keypoint, KeypointKind, Skeleton};

    /// Build a skeleton where only the listed keypoints are visible.
    pub(crate) fn skeleton(points: &[(KeypointKind, f32, f32)]) -> Skeleton {
        let mut skeleton = Skeleton::default();
        for &(kind, x, y) in points {
            skeleton.keypoints[kind.idx()] = Keypoint::new(x, y, 0.9);
        }
        skeleton
    }
}
