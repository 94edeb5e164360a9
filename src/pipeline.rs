use std::sync::Arc;
use std::time::Instant;

use candle_core::{Device, Tensor};
use serde::Serialize;
use tracing::{info, warn};

use crate::artifacts::{ArtifactPaths, ArtifactWriter};
use crate::error::{MvsError, Result};
use crate::loss::{masked_classification_loss, regression_metrics, MetricSummary};
use crate::observer::{NoopObserver, PipelineObserver};
use crate::stream::MvsBatch;

/// Output of the depth network for one batch.
#[derive(Clone, Debug)]
pub struct NetworkOutput {
    /// Regressed depth, `(B, H, W)`.
    pub depth: Tensor,
    /// Softmax over depth bins, `(B, D, H, W)`.
    pub prob_volume: Tensor,
}

/// The network itself lives outside this crate.
pub trait DepthNetwork {
    fn infer(&mut self, batch: &MvsBatch) -> Result<NetworkOutput>;
}

impl<F> DepthNetwork for F
where
    F: FnMut(&MvsBatch) -> Result<NetworkOutput>,
{
    fn infer(&mut self, batch: &MvsBatch) -> Result<NetworkOutput> {
        self(batch)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SampleMetrics {
    pub sample_id: u32,
    pub regression: MetricSummary,
    pub cross_entropy: Option<f32>,
    pub winner_take_all: Option<MetricSummary>,
}

#[derive(Debug, Default)]
pub struct InferenceSummary {
    pub steps: usize,
    pub artifacts: Vec<ArtifactPaths>,
    pub metrics: Vec<SampleMetrics>,
    pub seconds: f64,
}

/// Scores a network output against the ground truth carried by the batch.
///
/// Returns `None` when the batch has no ground truth. The probability volume
/// is only scored when its bin count matches the reference camera.
pub fn evaluate_output(batch: &MvsBatch, output: &NetworkOutput) -> Result<Option<SampleMetrics>> {
    let Some(gt) = &batch.depth else {
        return Ok(None);
    };
    let sampling = batch.reference_camera.depth_sampling();
    if sampling.end == sampling.start {
        warn!(
            sample_id = batch.sample_id,
            "reference camera has an empty depth range; skipping metrics"
        );
        return Ok(None);
    }
    let device = Device::Cpu;
    let pred = output.depth.to_device(&device)?;
    if pred.dims() != gt.dims() {
        return Err(MvsError::GeometryConfig(format!(
            "predicted depth {:?} does not match ground truth {:?}",
            pred.dims(),
            gt.dims()
        )));
    }
    let start = Tensor::new(&[sampling.start as f32], &device)?;
    let end = Tensor::new(&[sampling.end as f32], &device)?;
    let regression = regression_metrics(&pred, gt, &start, &end, 1.0, 1.0)?.summary()?;

    let prob_volume = output.prob_volume.to_device(&device)?;
    let (cross_entropy, winner_take_all) = match prob_volume.dims4() {
        Ok((_, bins, _, _)) if bins == sampling.count && bins > 0 => {
            let interval = Tensor::new(&[sampling.interval as f32], &device)?;
            let report = masked_classification_loss(&prob_volume, gt, &start, &interval, bins)?;
            (
                Some(report.cross_entropy.to_scalar::<f32>()?),
                Some(report.regression.summary()?),
            )
        }
        _ => {
            warn!(
                sample_id = batch.sample_id,
                "probability volume {:?} does not match {} depth bins; skipping classification metrics",
                prob_volume.dims(),
                sampling.count
            );
            (None, None)
        }
    };

    Ok(Some(SampleMetrics {
        sample_id: batch.sample_id,
        regression,
        cross_entropy,
        winner_take_all,
    }))
}

/// Pulls `steps` batches, runs the network on each and persists the results.
///
/// Any error stops the run; earlier samples stay on disk.
pub fn run_inference<I, N>(
    batches: I,
    network: &mut N,
    writer: &ArtifactWriter,
    steps: usize,
    observer: Option<Arc<dyn PipelineObserver>>,
) -> Result<InferenceSummary>
where
    I: IntoIterator<Item = Result<MvsBatch>>,
    N: DepthNetwork + ?Sized,
{
    let observer: Arc<dyn PipelineObserver> = match observer {
        Some(observer) => observer,
        None => Arc::new(NoopObserver),
    };
    let started = Instant::now();
    let mut summary = InferenceSummary::default();

    for (step, batch) in batches.into_iter().take(steps).enumerate() {
        let batch = batch?;
        let step_started = Instant::now();
        let output = network.infer(&batch)?;
        info!(
            step,
            sample_id = batch.sample_id,
            epoch = batch.epoch,
            "depth inference finished ({:.3} sec/step)",
            step_started.elapsed().as_secs_f64()
        );

        if let Some(metrics) = evaluate_output(&batch, &output)? {
            observer.metrics_computed(batch.sample_id, &metrics.regression);
            summary.metrics.push(metrics);
        }
        summary.artifacts.push(writer.persist(&batch, &output)?);
        summary.steps += 1;
    }

    summary.seconds = started.elapsed().as_secs_f64();
    Ok(summary)
}
