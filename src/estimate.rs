use crate::{
    error::Error,
    pose::{Keypoint, KeypointKind, Keypoints, Skeleton, NUM_KEYPOINTS},
};
use ndarray::{ArrayView2, Axis};
use num_traits::cast::{FromPrimitive, ToPrimitive};
use opencv::{
    core::{Mat, Scalar, Size, CV_32F},
    dnn::{self, Net},
    prelude::*,
};
use ordered_float::NotNan;
use std::{
    cmp::Reverse,
    path::Path,
    time::{Duration, Instant},
};
use tracing::{debug, instrument};

/// Box (cx, cy, w, h), person score, then (x, y, confidence) per keypoint.
const OUTPUT_ROWS: usize = 4 + 1 + 3 * NUM_KEYPOINTS;

/// Turns a frame into zero or more skeletons.
pub(crate) trait PoseEstimator {
    fn estimate(&mut self, frame: &Mat) -> Result<Vec<Skeleton>, Error>;
}

#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct Timing {
    pub(crate) inference: Duration,
    pub(crate) last: Duration,
}

/// A YOLOv8 pose network exported to ONNX, run through OpenCV's dnn module.
pub(crate) struct YoloPose {
    net: Net,
    input_size: i32,
    score_threshold: f32,
    iou_threshold: f32,
    pub(crate) timing: Timing,
}

impl YoloPose {
    pub(crate) fn new<P>(
        model_path: P,
        input_size: i32,
        score_threshold: f32,
        iou_threshold: f32,
    ) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        let model_path = model_path.as_ref();
        let net = dnn::read_net_from_onnx(&model_path.to_string_lossy())
            .map_err(|e| Error::ReadNet(e, model_path.to_owned()))?;
        Ok(Self {
            net,
            input_size,
            score_threshold,
            iou_threshold,
            timing: Default::default(),
        })
    }
}

impl PoseEstimator for YoloPose {
    #[instrument(name = "YoloPose::estimate", skip(self, frame), level = "debug")]
    fn estimate(&mut self, frame: &Mat) -> Result<Vec<Skeleton>, Error> {
        let blob = dnn::blob_from_image(
            frame,
            1.0 / 255.0,
            Size::new(self.input_size, self.input_size),
            Scalar::default(),
            true,
            false,
            CV_32F,
        )
        .map_err(Error::BlobFromImage)?;
        self.net
            .set_input(&blob, "", 1.0, Scalar::default())
            .map_err(Error::SetNetInput)?;

        let start_inference = Instant::now();
        let output = self.net.forward_single("").map_err(Error::Forward)?;
        let elapsed = start_inference.elapsed();
        self.timing.inference += elapsed;
        self.timing.last = elapsed;

        let input_size = self.input_size.to_f32().ok_or(Error::ConvertToF32)?;
        let scale = (
            frame.cols().to_f32().ok_or(Error::ConvertToF32)? / input_size,
            frame.rows().to_f32().ok_or(Error::ConvertToF32)? / input_size,
        );
        let skeletons = decode_output(
            output.data_typed::<f32>().map_err(Error::GetMatData)?,
            scale,
            self.score_threshold,
            self.iou_threshold,
        )?;
        debug!(
            message = "decoded poses",
            count = skeletons.len(),
            top_score = ?skeletons.first().map(|skeleton| skeleton.score),
            ?elapsed
        );
        Ok(skeletons)
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
struct BoundingBox {
    x0: f32,
    y0: f32,
    x1: f32,
    y1: f32,
}

impl BoundingBox {
    fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            x0: cx - w / 2.0,
            y0: cy - h / 2.0,
            x1: cx + w / 2.0,
            y1: cy + h / 2.0,
        }
    }

    fn area(&self) -> f32 {
        (self.x1 - self.x0).max(0.0) * (self.y1 - self.y0).max(0.0)
    }

    fn iou(&self, other: &Self) -> f32 {
        let intersection = Self {
            x0: self.x0.max(other.x0),
            y0: self.y0.max(other.y0),
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
        }
        .area();
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }
}

/// Decode a raw `(56, N)` pose head into skeletons in frame coordinates.
///
/// Candidates under `score_threshold` are dropped, and the rest go through greedy
/// non-maximum suppression in decreasing score order.
pub(crate) fn decode_output(
    data: &[f32],
    scale: (f32, f32),
    score_threshold: f32,
    iou_threshold: f32,
) -> Result<Vec<Skeleton>, Error> {
    if data.is_empty() || data.len() % OUTPUT_ROWS != 0 {
        return Err(Error::UnexpectedOutputShape {
            expected: OUTPUT_ROWS,
            len: data.len(),
        });
    }
    let output = ArrayView2::from_shape((OUTPUT_ROWS, data.len() / OUTPUT_ROWS), data)
        .map_err(Error::ConstructArrayView)?;
    let (sx, sy) = scale;

    let mut candidates = output
        .axis_iter(Axis(1))
        .filter(|column| column[4] >= score_threshold)
        .map(|column| {
            let score = NotNan::new(column[4]).map_err(|e| Error::ConstructNotNan(e, column[4]))?;
            let bbox = BoundingBox::from_center(
                column[0] * sx,
                column[1] * sy,
                column[2] * sx,
                column[3] * sy,
            );
            let mut keypoints = Keypoints::default();
            for k in 0..NUM_KEYPOINTS {
                let kind =
                    KeypointKind::from_usize(k).ok_or(Error::ConvertUSizeToKeypointKind(k))?;
                let base = 5 + 3 * k;
                keypoints[kind.idx()] = Keypoint::new(
                    column[base] * sx,
                    column[base + 1] * sy,
                    column[base + 2],
                );
            }
            Ok::<_, Error>((score, bbox, keypoints))
        })
        .collect::<Result<Vec<_>, Error>>()?;

    candidates.sort_by_key(|&(score, ..)| Reverse(score));

    let mut kept: Vec<(BoundingBox, Skeleton)> = Vec::with_capacity(candidates.len());
    for (score, bbox, keypoints) in candidates {
        if kept
            .iter()
            .all(|(other, _)| bbox.iou(other) <= iou_threshold)
        {
            kept.push((bbox, Skeleton::new(keypoints, score.into_inner())));
        }
    }
    Ok(kept.into_iter().map(|(_, skeleton)| skeleton).collect())
}
