//! Sample loading and the endless batch stream fed to depth inference.
//!
//! A sample is one reference view plus its source views. Loading applies the
//! shared scale, the per-view alignment crop and per-view standardization, and
//! derives a second, lower-resolution copy of the images and cameras at which
//! the cost volume is built. Network inputs use the configured channel order.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;

use candle_core::{Device, Tensor};
use ndarray::{stack, Array2, Array3, ArrayView, Axis, Dimension};
use tracing::{debug, warn};

use crate::camera::CameraModel;
use crate::config::{ChannelOrder, PipelineConfig};
use crate::error::{MvsError, Result};
use crate::geometry::{
    alignment_crop, crop_depth, crop_view, mask_depth_range, scale_depth, scale_view, shared_scale,
};
use crate::observer::{NoopObserver, PipelineObserver};
use crate::pfm::read_pfm;

const STANDARDIZE_EPSILON: f32 = 1e-8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ViewPaths {
    pub image: PathBuf,
    pub camera: PathBuf,
}

/// Files of one sample. `views[0]` is the reference view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MvsSample {
    pub views: Vec<ViewPaths>,
    pub depth: Option<PathBuf>,
}

impl MvsSample {
    /// Numeric identifier taken from the reference image file name.
    pub fn sample_id(&self) -> Result<u32> {
        let reference = self
            .views
            .first()
            .ok_or_else(|| MvsError::GeometryConfig("sample has no views".to_string()))?;
        let stem = reference
            .image
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or_default();
        stem.parse().map_err(|_| {
            MvsError::Parse(format!(
                "reference image {} does not have a numeric name",
                reference.image.display()
            ))
        })
    }
}

/// A loaded sample, still as plain arrays.
#[derive(Clone, Debug)]
pub struct PreparedSample {
    pub sample_id: u32,
    /// Reference view at cost-volume resolution, always RGB.
    pub reference_image: Array3<f32>,
    /// Unnormalized images at cost-volume resolution, `(h, w, 3)` each.
    pub scaled_images: Vec<Array3<f32>>,
    /// Standardized images at crop resolution, `(H, W, 3)` each.
    pub centered_images: Vec<Array3<f32>>,
    /// Cameras matching `scaled_images`.
    pub cameras: Vec<CameraModel>,
    /// Ground truth at cost-volume resolution, zero where invalid.
    pub depth: Option<Array2<f32>>,
}

impl PreparedSample {
    pub fn reference_camera(&self) -> &CameraModel {
        &self.cameras[0]
    }

    /// Cameras packed as `(N, 2, 4, 4)`.
    pub fn packed_cameras(&self) -> Result<ndarray::Array4<f32>> {
        let flat: Vec<f32> = self
            .cameras
            .iter()
            .flat_map(|camera| camera.to_packed())
            .flatten()
            .flatten()
            .collect();
        Ok(ndarray::Array4::from_shape_vec(
            (self.cameras.len(), 2, 4, 4),
            flat,
        )?)
    }
}

/// One inference step worth of tensors, batch size 1.
#[derive(Clone, Debug)]
pub struct MvsBatch {
    pub sample_id: u32,
    pub epoch: usize,
    /// `(1, N, h, w, 3)`
    pub scaled_images: Tensor,
    /// `(1, N, H, W, 3)`
    pub centered_images: Tensor,
    /// `(1, N, 2, 4, 4)`
    pub cameras: Tensor,
    /// `(1, h, w)` when ground truth was supplied.
    pub depth: Option<Tensor>,
    pub reference_image: Array3<f32>,
    pub reference_camera: CameraModel,
}

impl MvsBatch {
    pub fn from_prepared(sample: &PreparedSample, epoch: usize) -> Result<Self> {
        let scaled = stack_views(&sample.scaled_images)?;
        let centered = stack_views(&sample.centered_images)?;
        let cameras = sample.packed_cameras()?;
        let depth = sample
            .depth
            .as_ref()
            .map(|depth| batched_tensor(depth.view()))
            .transpose()?;
        Ok(Self {
            sample_id: sample.sample_id,
            epoch,
            scaled_images: batched_tensor(scaled.view())?,
            centered_images: batched_tensor(centered.view())?,
            cameras: batched_tensor(cameras.view())?,
            depth,
            reference_image: sample.reference_image.clone(),
            reference_camera: sample.reference_camera().clone(),
        })
    }

    pub fn view_count(&self) -> usize {
        self.scaled_images.dims().get(1).copied().unwrap_or(0)
    }
}

pub(crate) fn stack_views(views: &[Array3<f32>]) -> Result<ndarray::Array4<f32>> {
    let views: Vec<_> = views.iter().map(|view| view.view()).collect();
    Ok(stack(Axis(0), &views)?)
}

/// Tensor with a leading batch dimension of one.
fn batched_tensor<D: Dimension>(array: ArrayView<'_, f32, D>) -> Result<Tensor> {
    let mut shape = vec![1];
    shape.extend_from_slice(array.shape());
    let data: Vec<f32> = array.iter().copied().collect();
    Ok(Tensor::from_vec(data, shape, &Device::Cpu)?)
}

/// Per-channel `(x - mean) / (std + 1e-8)`.
pub fn standardize(image: &Array3<f32>) -> Array3<f32> {
    let mut out = image.clone();
    for mut channel in out.axis_iter_mut(Axis(2)) {
        let mean = channel.mean().unwrap_or(0.0);
        let std = channel.var(0.0).sqrt();
        channel.mapv_inplace(|v| (v - mean) / (std + STANDARDIZE_EPSILON));
    }
    out
}

/// Reorders RGB channels for the network.
pub fn to_channel_order(image: Array3<f32>, order: ChannelOrder) -> Array3<f32> {
    match order {
        ChannelOrder::Rgb => image,
        ChannelOrder::Bgr => Array3::from_shape_fn(image.dim(), |(y, x, c)| image[[y, x, 2 - c]]),
    }
}

/// Reads an image as `(H, W, 3)` RGB floats in `[0, 255]`.
pub fn load_rgb(path: &Path) -> Result<Array3<f32>> {
    let rgb = image::open(path)
        .map_err(|source| MvsError::image(path, source))?
        .to_rgb8();
    let (width, height) = rgb.dimensions();
    let data: Vec<f32> = rgb.into_raw().into_iter().map(f32::from).collect();
    Ok(Array3::from_shape_vec(
        (height as usize, width as usize, 3),
        data,
    )?)
}

/// Loads and normalizes one sample.
pub fn prepare_sample(sample: &MvsSample, cfg: &PipelineConfig) -> Result<PreparedSample> {
    let sample_id = sample.sample_id()?;
    let reference = &sample.views[0];
    let options = cfg.parse_options();

    // Missing sources are filled with the reference view; extra ones are ignored.
    let view_paths: Vec<&ViewPaths> = (0..cfg.view_num)
        .map(|i| sample.views.get(i).unwrap_or(reference))
        .collect();
    if sample.views.len() < cfg.view_num {
        debug!(
            sample_id,
            "padding {} missing source views with the reference",
            cfg.view_num - sample.views.len()
        );
    }

    let mut images = Vec::with_capacity(cfg.view_num);
    let mut cameras = Vec::with_capacity(cfg.view_num);
    for paths in view_paths {
        images.push(load_rgb(&paths.image)?);
        let camera = CameraModel::load(&paths.camera, &options)?;
        let camera = if camera.depth_sampling().count == 0 {
            camera.with_depth_count(cfg.max_d)
        } else {
            camera
        };
        cameras.push(camera);
    }

    let native_sizes: Vec<(usize, usize)> = images
        .iter()
        .map(|image| {
            let (h, w, _) = image.dim();
            (h, w)
        })
        .collect();
    let scale = shared_scale(&native_sizes, cfg.max_h, cfg.max_w)?;

    let mut centered_images = Vec::with_capacity(cfg.view_num);
    let mut scaled_images = Vec::with_capacity(cfg.view_num);
    let mut low_res_cameras = Vec::with_capacity(cfg.view_num);
    let mut reference_window = None;
    let mut reference_image = None;
    for (image, camera) in images.iter().zip(&cameras) {
        let (resized, resized_camera) = scale_view(image.view(), camera, scale);
        let (h, w, _) = resized.dim();
        let window = alignment_crop((h, w), cfg.base_image_size, cfg.max_h, cfg.max_w)?;
        reference_window.get_or_insert(window);
        let (cropped, cropped_camera) = crop_view(resized.view(), &resized_camera, window);

        let (low_res, low_res_camera) =
            scale_view(cropped.view(), &cropped_camera, cfg.sample_scale);
        reference_image.get_or_insert_with(|| low_res.clone());
        let cropped = to_channel_order(cropped, cfg.channel_order);
        centered_images.push(standardize(&cropped));
        scaled_images.push(to_channel_order(low_res, cfg.channel_order));
        low_res_cameras.push(low_res_camera);
    }

    let first_dim = centered_images[0].dim();
    if let Some(mismatch) = centered_images.iter().find(|image| image.dim() != first_dim) {
        return Err(MvsError::GeometryConfig(format!(
            "sample {sample_id}: views crop to different sizes ({first_dim:?} vs {:?})",
            mismatch.dim()
        )));
    }

    let reference_image = reference_image
        .ok_or_else(|| MvsError::GeometryConfig(format!("sample {sample_id} has no views")))?;

    let depth = match (&sample.depth, reference_window) {
        (Some(path), Some(window)) => {
            let depth = read_pfm(path)?.into_mono()?;
            if depth.dim() != native_sizes[0] {
                return Err(MvsError::GeometryConfig(format!(
                    "depth map {} is {:?}, reference image is {:?}",
                    path.display(),
                    depth.dim(),
                    native_sizes[0]
                )));
            }
            let depth = scale_depth(depth.view(), scale);
            let depth = crop_depth(depth.view(), window);
            let depth = scale_depth(depth.view(), cfg.sample_scale);
            let range = low_res_cameras[0].depth_sampling();
            if range.is_zero() {
                warn!(sample_id, "reference camera has no depth range; depth map left unmasked");
                Some(depth)
            } else {
                let (low, high) = if range.end < range.start {
                    (range.end, range.start)
                } else {
                    (range.start, range.end)
                };
                Some(mask_depth_range(depth.view(), low as f32, high as f32))
            }
        }
        _ => None,
    };

    Ok(PreparedSample {
        sample_id,
        reference_image,
        scaled_images,
        centered_images,
        cameras: low_res_cameras,
        depth,
    })
}

/// Endless iterator over batches: wraps to the first sample after the last
/// one and counts epochs. Yields `None` only for an empty sample list.
pub struct MvsStream {
    samples: Vec<MvsSample>,
    cfg: PipelineConfig,
    observer: Arc<dyn PipelineObserver>,
    cursor: usize,
}

impl MvsStream {
    pub fn new(samples: Vec<MvsSample>, cfg: PipelineConfig) -> Result<Self> {
        cfg.validate()?;
        if let Some(bad) = samples.iter().find(|sample| sample.views.is_empty()) {
            return Err(MvsError::GeometryConfig(format!(
                "sample without views (depth {:?})",
                bad.depth
            )));
        }
        Ok(Self {
            samples,
            cfg,
            observer: Arc::new(NoopObserver),
            cursor: 0,
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Samples per epoch.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn epoch(&self) -> usize {
        if self.samples.is_empty() {
            0
        } else {
            self.cursor / self.samples.len()
        }
    }

    /// Restarts from the first sample of epoch zero.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    pub fn prefetch(self) -> Prefetch<Result<MvsBatch>> {
        Prefetch::spawn(self)
    }
}

impl Iterator for MvsStream {
    type Item = Result<MvsBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.samples.is_empty() {
            return None;
        }
        let epoch = self.epoch();
        let index = self.cursor % self.samples.len();
        self.cursor += 1;

        let batch = prepare_sample(&self.samples[index], &self.cfg)
            .and_then(|prepared| MvsBatch::from_prepared(&prepared, epoch));
        if let Ok(batch) = &batch {
            self.observer.batch_prepared(batch);
        }
        Some(batch)
    }
}

/// Runs an iterator on a worker thread, one item ahead of the consumer.
///
/// Dropping the `Prefetch` stops the worker after its current item.
pub struct Prefetch<T> {
    receiver: Receiver<T>,
}

impl<T: Send + 'static> Prefetch<T> {
    pub fn spawn<I>(source: I) -> Self
    where
        I: Iterator<Item = T> + Send + 'static,
    {
        let (sender, receiver) = mpsc::sync_channel(1);
        thread::spawn(move || {
            for item in source {
                if sender.send(item).is_err() {
                    break;
                }
            }
        });
        Self { receiver }
    }
}

impl<T> Iterator for Prefetch<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.receiver.recv().ok()
    }
}
