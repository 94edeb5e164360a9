use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use candle_core::{Device, Tensor};
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use mvs_prep::geometry::{mask_depth_range, resize_nearest};
use mvs_prep::loss::{regression_metrics, MetricSummary};
use mvs_prep::pairs::{attach_depth_maps, load_pair_list};
use mvs_prep::pfm::read_pfm;
use mvs_prep::stream::{prepare_sample, PreparedSample};
use mvs_prep::{
    ArtifactWriter, CameraModel, MvsSample, ParseOptions, PipelineConfig, Prefetch, TracingObserver,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::cli::{EvaluateArgs, PrepareArgs};

#[derive(Serialize)]
struct RunConfig<'a> {
    run_id: &'a str,
    args: &'a PrepareArgs,
    pipeline: &'a PipelineConfig,
}

#[derive(Clone, Debug, Serialize)]
struct SampleScore {
    sample_id: u32,
    valid_pixels: usize,
    metrics: MetricSummary,
}

#[derive(Debug, Serialize)]
struct EvaluationReport<'a> {
    created_at: String,
    args: &'a EvaluateArgs,
    samples: Vec<SampleScore>,
    mean: Option<MetricSummary>,
}

pub fn run_prepare(args: &PrepareArgs) -> anyhow::Result<()> {
    args.validate()?;
    let cfg = args.pipeline.to_config();

    let dense_folder = Path::new(&args.dense_folder).expand_home();
    let mut samples = load_pair_list(&dense_folder, cfg.view_num)
        .with_context(|| format!("Failed to read view selection in {}", dense_folder.display()))?;
    if args.max_samples > 0 {
        samples.truncate(args.max_samples);
    }
    if samples.is_empty() {
        anyhow::bail!("No reference views listed under {}", dense_folder.display());
    }
    if let Some(depth_folder) = &args.depth_folder {
        let depth_folder = Path::new(depth_folder).expand_home();
        let attached = attach_depth_maps(&mut samples, &depth_folder)?;
        info!(
            "Attached ground truth to {attached}/{} samples from {}",
            samples.len(),
            depth_folder.display()
        );
    }

    let run_id = args
        .run_name
        .clone()
        .unwrap_or_else(|| Utc::now().format("%Y%m%d-%H%M%S").to_string());
    let output_root = match &args.output_dir {
        Some(dir) => PathBuf::from(dir).expand_home(),
        None => dense_folder.join("prepared"),
    };
    let run_dir = output_root.join(&run_id);
    let writer = ArtifactWriter::new(&run_dir, &cfg)
        .with_context(|| format!("Failed to create output dir: {}", run_dir.display()))?
        .with_observer(Arc::new(TracingObserver));

    let config_path = run_dir.join("config.json");
    let run_config = RunConfig {
        run_id: &run_id,
        args,
        pipeline: &cfg,
    };
    fs::write(&config_path, serde_json::to_string_pretty(&run_config)?)
        .with_context(|| format!("Failed writing config: {}", config_path.display()))?;

    info!(
        "Preparing {} samples with {} views each into {}",
        samples.len(),
        cfg.view_num,
        run_dir.display()
    );

    let progress = ProgressBar::new(samples.len() as u64);
    progress.set_style(progress_style());
    let started = Instant::now();

    let worker_cfg = cfg.clone();
    let prepared = samples.into_iter().map(move |sample| {
        let result = prepare_sample(&sample, &worker_cfg);
        (sample, result)
    });
    let prepared: Box<dyn Iterator<Item = (MvsSample, mvs_prep::Result<PreparedSample>)>> =
        if args.prefetch {
            Box::new(Prefetch::spawn(prepared))
        } else {
            Box::new(prepared)
        };

    let mut written = 0usize;
    for (sample, result) in prepared {
        let reference = sample
            .views
            .first()
            .map(|view| view.image.display().to_string())
            .unwrap_or_default();
        let prepared: PreparedSample =
            result.with_context(|| format!("Failed to prepare sample {reference}"))?;
        let npz_path = writer
            .export_inputs(&prepared)
            .with_context(|| format!("Failed writing inputs for sample {reference}"))?;
        written += 1;
        progress.set_message(format!("{}", npz_path.display()));
        progress.inc(1);
    }
    progress.finish_and_clear();

    info!("Run ID: {run_id}");
    info!(
        "Prepared {written} samples in {:.1}s",
        started.elapsed().as_secs_f64()
    );
    Ok(())
}

pub fn run_evaluate(args: &EvaluateArgs) -> anyhow::Result<()> {
    args.validate()?;
    let pred_dir = Path::new(&args.pred_dir).expand_home();
    let gt_dir = Path::new(&args.gt_dir).expand_home();

    let ids = predicted_ids(&pred_dir)?;
    if ids.is_empty() {
        anyhow::bail!("No *_init.pfm depth maps found in {}", pred_dir.display());
    }

    let progress = ProgressBar::new(ids.len() as u64);
    progress.set_style(progress_style());

    let mut samples = Vec::with_capacity(ids.len());
    for id in ids {
        progress.inc(1);
        let gt_path = gt_dir.join(format!("{id:08}.pfm"));
        if !gt_path.is_file() {
            warn!(sample_id = id, "no ground truth at {}", gt_path.display());
            continue;
        }
        let score = score_sample(&pred_dir, &gt_path, id, args)
            .with_context(|| format!("Failed to score sample {id:08}"))?;
        if let Some(score) = score {
            progress.set_message(format!(
                "loss={:.4} <1={:.3}",
                score.metrics.loss, score.metrics.less_one
            ));
            samples.push(score);
        }
    }
    progress.finish_and_clear();

    let mean = mean_metrics(&samples);
    if let Some(mean) = &mean {
        info!(
            "Scored {} samples: loss={:.4} less_one={:.4} less_three={:.4}",
            samples.len(),
            mean.loss,
            mean.less_one,
            mean.less_three
        );
    }

    let report = EvaluationReport {
        created_at: Utc::now().to_rfc3339(),
        args,
        samples,
        mean,
    };
    let output = match &args.output {
        Some(path) => PathBuf::from(path).expand_home(),
        None => pred_dir.join("metrics.json"),
    };
    fs::write(&output, serde_json::to_string_pretty(&report)?)
        .with_context(|| format!("Failed writing metrics: {}", output.display()))?;
    info!("Wrote {}", output.display());
    Ok(())
}

fn predicted_ids(pred_dir: &Path) -> anyhow::Result<Vec<u32>> {
    let mut ids: Vec<u32> = fs::read_dir(pred_dir)
        .with_context(|| format!("Failed to read prediction dir: {}", pred_dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name();
            let name = name.to_str()?;
            name.strip_suffix("_init.pfm")?.parse().ok()
        })
        .collect();
    ids.sort_unstable();
    Ok(ids)
}

fn score_sample(
    pred_dir: &Path,
    gt_path: &Path,
    id: u32,
    args: &EvaluateArgs,
) -> anyhow::Result<Option<SampleScore>> {
    let pred = read_pfm(&pred_dir.join(format!("{id:08}_init.pfm")))?.into_mono()?;
    let camera = CameraModel::load(
        &pred_dir.join(format!("{id:08}.txt")),
        &ParseOptions::default(),
    )?;
    let sampling = *camera.depth_sampling();
    if sampling.end == sampling.start {
        warn!(sample_id = id, "camera has an empty depth range; skipped");
        return Ok(None);
    }

    let gt = read_pfm(gt_path)?.into_mono()?;
    let (h, w) = pred.dim();
    let gt = if gt.dim() == (h, w) {
        gt
    } else {
        resize_nearest(gt.view(), h, w)
    };
    let (low, high) = if sampling.end < sampling.start {
        (sampling.end, sampling.start)
    } else {
        (sampling.start, sampling.end)
    };
    let gt = mask_depth_range(gt.view(), low as f32, high as f32);
    let valid_pixels = gt.iter().filter(|&&d| d != 0.0).count();

    let device = Device::Cpu;
    let to_tensor = |map: Vec<f32>| Tensor::from_vec(map, (1, h, w), &device);
    let pred = to_tensor(pred.iter().copied().collect())?;
    let gt = to_tensor(gt.iter().copied().collect())?;
    let start = Tensor::new(&[sampling.start as f32], &device)?;
    let end = Tensor::new(&[sampling.end as f32], &device)?;
    let metrics = regression_metrics(&pred, &gt, &start, &end, args.alpha, args.beta)?.summary()?;
    Ok(Some(SampleScore {
        sample_id: id,
        valid_pixels,
        metrics,
    }))
}

fn mean_metrics(samples: &[SampleScore]) -> Option<MetricSummary> {
    if samples.is_empty() {
        return None;
    }
    let n = samples.len() as f32;
    let sum = |field: fn(&MetricSummary) -> f32| -> f32 {
        samples.iter().map(|sample| field(&sample.metrics)).sum::<f32>() / n
    };
    Some(MetricSummary {
        loss: sum(|m| m.loss),
        less_one: sum(|m| m.less_one),
        less_three: sum(|m| m.less_three),
    })
}

fn progress_style() -> ProgressStyle {
    ProgressStyle::with_template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

trait ExpandHome {
    fn expand_home(&self) -> PathBuf;
}

impl ExpandHome for PathBuf {
    fn expand_home(&self) -> PathBuf {
        self.as_path().expand_home()
    }
}

impl ExpandHome for Path {
    fn expand_home(&self) -> PathBuf {
        let Ok(rest) = self.strip_prefix("~") else {
            return self.to_path_buf();
        };
        match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => self.to_path_buf(),
        }
    }
}
