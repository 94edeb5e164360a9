//! Masked depth losses and accuracy metrics.
//!
//! Ground-truth depth uses 0.0 for pixels without a measurement; those pixels
//! never contribute to a numerator or a pixel count. Tensors carry a leading
//! batch axis: depth maps are `(B, H, W)`, probability volumes
//! `(B, D, H, W)`, and per-sample scalars such as depth intervals `(B,)`.

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Relative measurement noise of a ground-truth depth, per unit of depth.
const DEPTH_NOISE_FLOOR: f64 = 0.005;

/// Reporting interval divisor, independent of the number of depth bins so
/// runs with different bin counts stay comparable.
pub const REPORT_INTERVALS: f64 = 191.0;

/// 1.0 where the ground truth holds a measurement, 0.0 elsewhere.
pub fn valid_mask(gt: &Tensor) -> Result<Tensor> {
    Ok(gt.ne(0f32)?.to_dtype(DType::F32)?)
}

/// Noise-aware masked loss: `sum_b N_b * sum((|gt - pred| + 0.005 gt)^alpha) / V_b^beta`.
///
/// `V_b` is the valid pixel count of sample `b` and
/// `N_b = mean(V)^(beta - 1) / interval_b^alpha` keeps the loss near 1 whatever
/// the interval or resolution.
pub fn masked_regression_loss(
    gt: &Tensor,
    pred: &Tensor,
    interval: &Tensor,
    alpha: f64,
    beta: f64,
) -> Result<Tensor> {
    let mask = valid_mask(gt)?;
    let valid = mask.sum((1, 2))?.affine(1.0, 1e-6)?;
    let denominator = if beta != 1.0 {
        valid.powf(beta)?
    } else {
        valid.clone()
    };

    let mut error = ((gt - pred)?.abs()? + gt.affine(DEPTH_NOISE_FLOOR, 0.0)?)?;
    if alpha != 1.0 {
        error = error.powf(alpha)?;
    }
    let numerator = (error * &mask)?.sum((1, 2))?;

    let interval_term = if alpha != 1.0 {
        interval.powf(alpha)?
    } else {
        interval.clone()
    };
    let normalization = valid
        .mean_all()?
        .powf(beta - 1.0)?
        .broadcast_div(&interval_term)?;

    Ok(((numerator / denominator)? * normalization)?.sum_all()?)
}

/// Fraction of valid pixels whose error is within `k` depth intervals.
pub fn threshold_accuracy(gt: &Tensor, pred: &Tensor, interval: &Tensor, k: f64) -> Result<Tensor> {
    let batch = gt.dim(0)?;
    let mask = valid_mask(gt)?;
    let denominator = mask.sum_all()?.affine(1.0, 1e-6)?;
    let ratio = (gt - pred)?
        .abs()?
        .broadcast_div(&interval.reshape((batch, 1, 1))?)?;
    let within = ratio.le(k as f32)?.to_dtype(DType::F32)?;
    Ok(((within * mask)?.sum_all()? / denominator)?)
}

#[derive(Debug)]
pub struct RegressionReport {
    pub loss: Tensor,
    pub less_one: Tensor,
    pub less_three: Tensor,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub loss: f32,
    pub less_one: f32,
    pub less_three: f32,
}

impl RegressionReport {
    pub fn summary(&self) -> Result<MetricSummary> {
        Ok(MetricSummary {
            loss: self.loss.to_scalar::<f32>()?,
            less_one: self.less_one.to_scalar::<f32>()?,
            less_three: self.less_three.to_scalar::<f32>()?,
        })
    }
}

fn regression_report(
    gt: &Tensor,
    pred: &Tensor,
    interval: &Tensor,
    alpha: f64,
    beta: f64,
) -> Result<RegressionReport> {
    Ok(RegressionReport {
        loss: masked_regression_loss(gt, pred, interval, alpha, beta)?,
        less_one: threshold_accuracy(gt, pred, interval, 1.0)?,
        less_three: threshold_accuracy(gt, pred, interval, 3.0)?,
    })
}

/// Loss and both accuracies for a regressed depth map, measured against the
/// range `[depth_start, depth_end]` split into [`REPORT_INTERVALS`] steps.
pub fn regression_metrics(
    pred: &Tensor,
    gt: &Tensor,
    depth_start: &Tensor,
    depth_end: &Tensor,
    alpha: f64,
    beta: f64,
) -> Result<RegressionReport> {
    let interval = (depth_end - depth_start)?.affine(1.0 / REPORT_INTERVALS, 0.0)?;
    regression_report(gt, pred, &interval, alpha, beta)
}

/// Ground-truth bin per pixel as `i64`.
///
/// Invalid pixels map to bin 0. Valid depths that fall outside
/// `[0, depth_num)` map to -1, which one-hot encodes to an all-zero row.
pub fn bin_indices(
    gt: &Tensor,
    depth_start: &Tensor,
    depth_interval: &Tensor,
    depth_num: usize,
) -> Result<Tensor> {
    let batch = gt.dim(0)?;
    let mask = valid_mask(gt)?;
    let index = gt
        .broadcast_sub(&depth_start.reshape((batch, 1, 1))?)?
        .broadcast_div(&depth_interval.reshape((batch, 1, 1))?)?
        .mul(&mask)?
        .round()?;
    let upper = depth_num.saturating_sub(1) as f32;
    let in_range = index.ge(0f32)?.mul(&index.le(upper)?)?;
    let outside = Tensor::full(-1f32, index.shape(), index.device())?;
    Ok(in_range.where_cond(&index, &outside)?.to_dtype(DType::I64)?)
}

#[derive(Debug)]
pub struct ClassificationReport {
    pub cross_entropy: Tensor,
    /// Winner-take-all depth scored with `alpha = beta = 1`.
    pub regression: RegressionReport,
    pub wta_depth: Tensor,
}

/// Cross entropy of the probability volume against the one-hot ground-truth
/// bin, averaged over valid pixels per sample and summed over the batch.
///
/// The winner-take-all depth derived from the same volume is always scored
/// alongside, so classification and regression figures are reported
/// together.
pub fn masked_classification_loss(
    prob_volume: &Tensor,
    gt: &Tensor,
    depth_start: &Tensor,
    depth_interval: &Tensor,
    depth_num: usize,
) -> Result<ClassificationReport> {
    let (batch, bins, _, _) = prob_volume.dims4()?;
    if bins != depth_num {
        return Err(candle_core::Error::Msg(format!(
            "probability volume has {bins} bins, expected {depth_num}"
        ))
        .into());
    }

    let mask = valid_mask(gt)?;
    let valid = mask.sum((1, 2))?.affine(1.0, 1e-7)?;

    let index = bin_indices(gt, depth_start, depth_interval, depth_num)?;
    let one_hot = candle_nn::encoding::one_hot(index, depth_num, 1f32, 0f32)?;
    // Zero probabilities would give log(0) * 0 = NaN for the off bins.
    let log_prob = prob_volume
        .permute((0, 2, 3, 1))?
        .maximum(f32::MIN_POSITIVE)?
        .log()?;
    let cross_entropy_image = (one_hot * log_prob)?.sum(3)?.neg()?;
    let per_sample = (cross_entropy_image * &mask)?.sum((1, 2))?;
    let cross_entropy = (per_sample / valid)?.sum_all()?;

    let start = depth_start.reshape((batch, 1, 1))?;
    let interval = depth_interval.reshape((batch, 1, 1))?;
    let wta_depth = prob_volume
        .argmax(1)?
        .to_dtype(DType::F32)?
        .broadcast_mul(&interval)?
        .broadcast_add(&start)?;

    let regression = regression_report(gt, &wta_depth, &depth_interval.abs()?, 1.0, 1.0)?;

    Ok(ClassificationReport {
        cross_entropy,
        regression,
        wta_depth,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;

    fn tensor3(values: &[f32], h: usize, w: usize) -> Tensor {
        Tensor::from_vec(values.to_vec(), (1, h, w), &Device::Cpu).unwrap()
    }

    fn scalar(t: &Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    fn per_sample(values: &[f32]) -> Tensor {
        Tensor::from_vec(values.to_vec(), values.len(), &Device::Cpu).unwrap()
    }

    #[test]
    fn exact_prediction_saturates_accuracy() {
        let gt = tensor3(&[0.0, 500.0, 510.0, 520.0], 2, 2);
        let interval = per_sample(&[2.5]);
        let one = threshold_accuracy(&gt, &gt, &interval, 1.0).unwrap();
        let three = threshold_accuracy(&gt, &gt, &interval, 3.0).unwrap();
        assert_abs_diff_eq!(scalar(&one), 1.0, epsilon = 1e-5);
        assert_abs_diff_eq!(scalar(&three), 1.0, epsilon = 1e-5);
    }

    #[test]
    fn accuracy_without_valid_pixels_is_zero() {
        let gt = tensor3(&[0.0; 4], 2, 2);
        let pred = tensor3(&[1.0, 2.0, 3.0, 4.0], 2, 2);
        let acc = threshold_accuracy(&gt, &pred, &per_sample(&[1.0]), 1.0).unwrap();
        assert_eq!(scalar(&acc), 0.0);
    }

    #[test]
    fn accuracy_counts_pixels_within_k_intervals() {
        let gt = tensor3(&[10.0, 10.0, 10.0, 0.0], 2, 2);
        let pred = tensor3(&[10.5, 12.0, 16.0, 99.0], 2, 2);
        let interval = per_sample(&[1.0]);
        let one = threshold_accuracy(&gt, &pred, &interval, 1.0).unwrap();
        let three = threshold_accuracy(&gt, &pred, &interval, 3.0).unwrap();
        assert_abs_diff_eq!(scalar(&one), 1.0 / 3.0, epsilon = 1e-5);
        assert_abs_diff_eq!(scalar(&three), 2.0 / 3.0, epsilon = 1e-5);
    }

    #[test]
    fn regression_loss_ignores_invalid_pixels() {
        let gt = tensor3(&[2.0, 0.0], 1, 2);
        let pred = tensor3(&[1.0, 5.0], 1, 2);
        let loss = masked_regression_loss(&gt, &pred, &per_sample(&[0.5]), 1.0, 1.0).unwrap();
        // (|2 - 1| + 0.005 * 2) / 1 / 0.5
        assert_abs_diff_eq!(scalar(&loss), 2.02, epsilon = 1e-4);
    }

    #[test]
    fn regression_loss_applies_exponents() {
        let gt = tensor3(&[2.0, 0.0], 1, 2);
        let pred = tensor3(&[1.0, 5.0], 1, 2);
        let loss = masked_regression_loss(&gt, &pred, &per_sample(&[0.5]), 2.0, 2.0).unwrap();
        // 1.01^2 / 1^2 * 1^(2 - 1) / 0.5^2
        assert_abs_diff_eq!(scalar(&loss), 1.0201 * 4.0, epsilon = 1e-3);
    }

    #[test]
    fn regression_loss_sums_over_the_batch() {
        let gt = Tensor::from_vec(vec![4.0f32, 4.0, 8.0, 0.0], (2, 1, 2), &Device::Cpu).unwrap();
        let pred = Tensor::from_vec(vec![3.0f32, 5.0, 8.0, 1.0], (2, 1, 2), &Device::Cpu).unwrap();
        let interval = per_sample(&[1.0, 2.0]);
        let loss = masked_regression_loss(&gt, &pred, &interval, 1.0, 1.0).unwrap();
        // sample 0: (1.02 + 1.02) / 2 / 1, sample 1: 0.04 / 1 / 2
        assert_abs_diff_eq!(scalar(&loss), 1.02 + 0.02, epsilon = 1e-4);
    }

    #[test]
    fn regression_metrics_use_fixed_report_interval() {
        let gt = tensor3(&[500.0, 600.0], 1, 2);
        let pred = tensor3(&[502.0, 600.0], 1, 2);
        let report = regression_metrics(
            &pred,
            &gt,
            &per_sample(&[400.0]),
            &per_sample(&[400.0 + 191.0]),
            1.0,
            1.0,
        )
        .unwrap()
        .summary()
        .unwrap();
        assert_abs_diff_eq!(report.less_one, 0.5, epsilon = 1e-5);
        assert_abs_diff_eq!(report.less_three, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn depth_start_maps_to_bin_zero() {
        let gt = tensor3(&[425.0, 0.0, 425.0, 425.0], 2, 2);
        let index = bin_indices(&gt, &per_sample(&[425.0]), &per_sample(&[2.5]), 192).unwrap();
        let values = index.flatten_all().unwrap().to_vec1::<i64>().unwrap();
        assert_eq!(values, vec![0, 0, 0, 0]);
    }

    #[test]
    fn out_of_range_depths_get_no_bin() {
        let gt = tensor3(&[400.0, 430.0, 1000.0], 1, 3);
        let index = bin_indices(&gt, &per_sample(&[425.0]), &per_sample(&[2.5]), 4).unwrap();
        let values = index.flatten_all().unwrap().to_vec1::<i64>().unwrap();
        assert_eq!(values, vec![-1, 2, -1]);
    }

    fn volume(bins: &[[f32; 2]]) -> Tensor {
        // bins[d] holds the two pixels of a 1x2 image for bin d
        let flat: Vec<f32> = bins.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (1, bins.len(), 1, 2), &Device::Cpu).unwrap()
    }

    #[test]
    fn confident_correct_volume_has_zero_cross_entropy() {
        let gt = tensor3(&[10.0, 0.0], 1, 2);
        let prob = volume(&[[1.0, 0.0], [0.0, 1.0], [0.0, 0.0]]);
        let report =
            masked_classification_loss(&prob, &gt, &per_sample(&[10.0]), &per_sample(&[1.0]), 3)
                .unwrap();
        assert_abs_diff_eq!(scalar(&report.cross_entropy), 0.0, epsilon = 1e-5);
        let summary = report.regression.summary().unwrap();
        assert_abs_diff_eq!(summary.less_one, 1.0, epsilon = 1e-5);
        assert_abs_diff_eq!(summary.less_three, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn cross_entropy_is_averaged_over_valid_pixels() {
        let gt = tensor3(&[11.0, 12.0], 1, 2);
        let prob = volume(&[[0.25, 0.25], [0.5, 0.25], [0.25, 0.5]]);
        let report =
            masked_classification_loss(&prob, &gt, &per_sample(&[10.0]), &per_sample(&[1.0]), 3)
                .unwrap();
        let expected = -(0.5f32.ln() + 0.5f32.ln()) / 2.0;
        assert_abs_diff_eq!(scalar(&report.cross_entropy), expected, epsilon = 1e-5);
    }

    #[test]
    fn winner_take_all_depth_follows_argmax() {
        let gt = tensor3(&[11.0, 12.0], 1, 2);
        let prob = volume(&[[0.1, 0.7], [0.8, 0.2], [0.1, 0.1]]);
        let report =
            masked_classification_loss(&prob, &gt, &per_sample(&[10.0]), &per_sample(&[1.0]), 3)
                .unwrap();
        let depth = report.wta_depth.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(depth, vec![11.0, 10.0]);
        let summary = report.regression.summary().unwrap();
        assert_abs_diff_eq!(summary.less_one, 0.5, epsilon = 1e-5);
        assert_abs_diff_eq!(summary.less_three, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn zero_probabilities_stay_finite() {
        let gt = tensor3(&[11.0, 0.0], 1, 2);
        let prob = volume(&[[0.0, 0.0], [0.0, 0.0], [1.0, 1.0]]);
        let report =
            masked_classification_loss(&prob, &gt, &per_sample(&[10.0]), &per_sample(&[1.0]), 3)
                .unwrap();
        assert!(scalar(&report.cross_entropy).is_finite());
    }

    #[test]
    fn bin_count_mismatch_is_an_error() {
        let gt = tensor3(&[11.0, 0.0], 1, 2);
        let prob = volume(&[[0.5, 0.5], [0.5, 0.5]]);
        assert!(
            masked_classification_loss(&prob, &gt, &per_sample(&[10.0]), &per_sample(&[1.0]), 3)
                .is_err()
        );
    }
}
