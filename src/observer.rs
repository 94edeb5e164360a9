use tracing::debug;

use crate::artifacts::ArtifactPaths;
use crate::loss::MetricSummary;
use crate::stream::MvsBatch;

/// Hooks for visualization or experiment tracking.
///
/// Injected at construction time and always invoked; an observer that is not
/// interested in an event keeps the default empty body.
pub trait PipelineObserver: Send + Sync {
    fn batch_prepared(&self, _batch: &MvsBatch) {}

    fn artifacts_written(&self, _sample_id: u32, _paths: &ArtifactPaths) {}

    fn metrics_computed(&self, _sample_id: u32, _metrics: &MetricSummary) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

/// Reports every event at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl PipelineObserver for TracingObserver {
    fn batch_prepared(&self, batch: &MvsBatch) {
        debug!(
            sample_id = batch.sample_id,
            epoch = batch.epoch,
            "prepared batch: scaled {:?}, centered {:?}, cameras {:?}",
            batch.scaled_images.dims(),
            batch.centered_images.dims(),
            batch.cameras.dims()
        );
    }

    fn artifacts_written(&self, sample_id: u32, paths: &ArtifactPaths) {
        debug!(sample_id, "wrote depth map {}", paths.depth_pfm.display());
    }

    fn metrics_computed(&self, sample_id: u32, metrics: &MetricSummary) {
        debug!(
            sample_id,
            "loss={:.4} less_one={:.4} less_three={:.4}",
            metrics.loss,
            metrics.less_one,
            metrics.less_three
        );
    }
}
