use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{Device, Tensor};
use image::{ImageBuffer, Luma, Rgb, RgbImage};
use ndarray::{Array2, ArrayView2, ArrayView3};
use ndarray_npy::NpzWriter;

use crate::config::PipelineConfig;
use crate::error::{MvsError, Result};
use crate::observer::{NoopObserver, PipelineObserver};
use crate::pfm::write_pfm;
use crate::pipeline::NetworkOutput;
use crate::stream::{stack_views, MvsBatch, PreparedSample};

const U16_MAX: f32 = u16::MAX as f32;

/// Files written for one sample, named after its zero-padded identifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub depth_pfm: PathBuf,
    pub prob_pfm: PathBuf,
    pub image: PathBuf,
    pub camera: PathBuf,
    pub prob_png: PathBuf,
    pub depth_png: PathBuf,
    pub inverse_depth_png: Option<PathBuf>,
}

impl ArtifactPaths {
    pub fn for_sample(output_dir: &Path, sample_id: u32, inverse_depth: bool) -> Self {
        let name = |suffix: &str| output_dir.join(format!("{sample_id:08}{suffix}"));
        Self {
            depth_pfm: name("_init.pfm"),
            prob_pfm: name("_prob.pfm"),
            image: name(".jpg"),
            camera: name(".txt"),
            prob_png: name("_prob.png"),
            depth_png: name("_depth.png"),
            inverse_depth_png: inverse_depth.then(|| name("_depth_inverse.png")),
        }
    }
}

pub struct ArtifactWriter {
    output_dir: PathBuf,
    write_inverse_depth: bool,
    inverse_depth_exponent: f64,
    observer: Arc<dyn PipelineObserver>,
}

impl ArtifactWriter {
    pub fn new(output_dir: &Path, cfg: &PipelineConfig) -> Result<Self> {
        fs::create_dir_all(output_dir).map_err(|source| MvsError::io(output_dir, source))?;
        Ok(Self {
            output_dir: output_dir.to_path_buf(),
            write_inverse_depth: cfg.write_inverse_depth,
            inverse_depth_exponent: cfg.inverse_depth_exponent,
            observer: Arc::new(NoopObserver),
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Writes the estimate for the first batch element together with the
    /// reference image and camera it was computed at.
    pub fn persist(&self, batch: &MvsBatch, output: &NetworkOutput) -> Result<ArtifactPaths> {
        let depth = first_map(&output.depth)?;
        let confidence = first_map(&output.prob_volume.max(1)?)?;
        if depth.dim() != confidence.dim() {
            return Err(MvsError::GeometryConfig(format!(
                "depth map is {:?} but probability map is {:?}",
                depth.dim(),
                confidence.dim()
            )));
        }

        let paths =
            ArtifactPaths::for_sample(&self.output_dir, batch.sample_id, self.write_inverse_depth);
        write_pfm(&paths.depth_pfm, depth.view(), 1.0)?;
        write_pfm(&paths.prob_pfm, confidence.view(), 1.0)?;
        save_rgb(&paths.image, batch.reference_image.view())?;
        batch.reference_camera.save(&paths.camera)?;
        save_luma16(&paths.prob_png, &confidence_png(confidence.view()))?;
        save_luma16(&paths.depth_png, &depth_png(depth.view()))?;
        if let Some(path) = &paths.inverse_depth_png {
            let encoded = inverse_depth_png(depth.view(), self.inverse_depth_exponent);
            save_luma16(path, &encoded)?;
        }

        self.observer.artifacts_written(batch.sample_id, &paths);
        Ok(paths)
    }

    /// Stores a prepared sample without running a network: the reference
    /// image and camera plus every input array in `<id>_inputs.npz`.
    pub fn export_inputs(&self, sample: &PreparedSample) -> Result<PathBuf> {
        let id = sample.sample_id;
        save_rgb(
            &self.output_dir.join(format!("{id:08}.jpg")),
            sample.reference_image.view(),
        )?;
        sample
            .reference_camera()
            .save(&self.output_dir.join(format!("{id:08}.txt")))?;

        let path = self.output_dir.join(format!("{id:08}_inputs.npz"));
        let npz_err = |message: String| MvsError::Npz {
            path: path.clone(),
            message,
        };
        let scaled = stack_views(&sample.scaled_images)?;
        let centered = stack_views(&sample.centered_images)?;
        let cameras = sample.packed_cameras()?;

        let file = File::create(&path).map_err(|source| MvsError::io(&path, source))?;
        let mut npz = NpzWriter::new(file);
        npz.add_array("scaled_images", &scaled)
            .map_err(|err| npz_err(format!("scaled_images: {err}")))?;
        npz.add_array("centered_images", &centered)
            .map_err(|err| npz_err(format!("centered_images: {err}")))?;
        npz.add_array("cameras", &cameras)
            .map_err(|err| npz_err(format!("cameras: {err}")))?;
        if let Some(depth) = &sample.depth {
            npz.add_array("depth", depth)
                .map_err(|err| npz_err(format!("depth: {err}")))?;
        }
        npz.finish().map_err(|err| npz_err(err.to_string()))?;
        Ok(path)
    }
}

/// First element of a `(B, H, W)` tensor as an array.
fn first_map(tensor: &Tensor) -> Result<Array2<f32>> {
    let map = tensor.to_device(&Device::Cpu)?.get(0)?;
    let (h, w) = map.dims2()?;
    let data = map.flatten_all()?.to_vec1::<f32>()?;
    Ok(Array2::from_shape_vec((h, w), data)?)
}

/// Depth clipped to `[0, 65535]`, fractional part dropped.
pub fn depth_png(depth: ArrayView2<'_, f32>) -> ImageBuffer<Luma<u16>, Vec<u16>> {
    luma16(depth, |d| d.clamp(0.0, U16_MAX) as u16)
}

/// Probabilities in `[0, 1]` spread over the full 16-bit range.
pub fn confidence_png(prob: ArrayView2<'_, f32>) -> ImageBuffer<Luma<u16>, Vec<u16>> {
    luma16(prob, |p| (p * U16_MAX).clamp(0.0, U16_MAX) as u16)
}

/// Near surfaces bright, far ones dark.
///
/// The clipped depth is stretched so its maximum reaches 65535, then mapped
/// through `((max - d) / max) ^ exponent`.
pub fn inverse_depth_png(
    depth: ArrayView2<'_, f32>,
    exponent: f64,
) -> ImageBuffer<Luma<u16>, Vec<u16>> {
    let clipped = depth.mapv(|d| d.clamp(0.0, U16_MAX).trunc());
    let min = clipped.iter().copied().fold(f32::INFINITY, f32::min);
    let shifted = clipped.mapv(|d| d - min);
    let max = shifted.iter().copied().fold(0.0, f32::max);
    let stretch = if max > 0.0 { U16_MAX / max } else { 0.0 };
    luma16(shifted.view(), |d| {
        let normalized = (d * stretch) as f64;
        let inverse = ((U16_MAX as f64 - normalized) / U16_MAX as f64).powf(exponent);
        (inverse * U16_MAX as f64).clamp(0.0, U16_MAX as f64) as u16
    })
}

fn luma16(
    map: ArrayView2<'_, f32>,
    encode: impl Fn(f32) -> u16,
) -> ImageBuffer<Luma<u16>, Vec<u16>> {
    let (h, w) = map.dim();
    ImageBuffer::from_fn(w as u32, h as u32, |x, y| {
        Luma([encode(map[[y as usize, x as usize]])])
    })
}

fn save_luma16(path: &Path, image: &ImageBuffer<Luma<u16>, Vec<u16>>) -> Result<()> {
    image.save(path).map_err(|source| MvsError::image(path, source))
}

/// Saves an `(H, W, 3)` image with samples in `[0, 255]`.
pub fn save_rgb(path: &Path, image: ArrayView3<'_, f32>) -> Result<()> {
    let (h, w, _) = image.dim();
    let mut out: RgbImage = ImageBuffer::new(w as u32, h as u32);
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let (row, col) = (y as usize, x as usize);
        let channel = |c: usize| image[[row, col, c]].round().clamp(0.0, 255.0) as u8;
        *pixel = Rgb([channel(0), channel(1), channel(2)]);
    }
    out.save(path).map_err(|source| MvsError::image(path, source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn artifact_names_are_zero_padded() {
        let paths = ArtifactPaths::for_sample(Path::new("out"), 7, false);
        assert_eq!(paths.depth_pfm, PathBuf::from("out/00000007_init.pfm"));
        assert_eq!(paths.prob_pfm, PathBuf::from("out/00000007_prob.pfm"));
        assert_eq!(paths.image, PathBuf::from("out/00000007.jpg"));
        assert_eq!(paths.camera, PathBuf::from("out/00000007.txt"));
        assert_eq!(paths.prob_png, PathBuf::from("out/00000007_prob.png"));
        assert_eq!(paths.depth_png, PathBuf::from("out/00000007_depth.png"));
        assert!(paths.inverse_depth_png.is_none());
    }

    #[test]
    fn depth_png_clips_and_truncates() {
        let png = depth_png(array![[-3.0f32, 512.7], [70000.0, 0.0]].view());
        assert_eq!(png.get_pixel(0, 0)[0], 0);
        assert_eq!(png.get_pixel(1, 0)[0], 512);
        assert_eq!(png.get_pixel(0, 1)[0], u16::MAX);
    }

    #[test]
    fn confidence_png_spans_full_range() {
        let png = confidence_png(array![[0.0f32, 1.0, 0.5]].view());
        assert_eq!(png.get_pixel(0, 0)[0], 0);
        assert_eq!(png.get_pixel(1, 0)[0], u16::MAX);
        assert_eq!(png.get_pixel(2, 0)[0], 32767);
    }

    #[test]
    fn inverse_depth_puts_near_surfaces_on_top() {
        let png = inverse_depth_png(array![[100.0f32, 200.0, 300.0]].view(), 2.0);
        assert_eq!(png.get_pixel(0, 0)[0], u16::MAX);
        assert_eq!(png.get_pixel(2, 0)[0], 0);
        // Halfway depth maps to (1/2)^2 of the range.
        let mid = png.get_pixel(1, 0)[0] as f32;
        assert!((mid - U16_MAX / 4.0).abs() <= 2.0);
    }

    #[test]
    fn flat_depth_does_not_divide_by_zero() {
        let png = inverse_depth_png(array![[5.0f32, 5.0]].view(), 2.0);
        assert!(png.pixels().all(|p| p[0] == u16::MAX));
    }

    #[test]
    fn rgb_round_trips_through_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ref.png");
        let image = ndarray::Array3::from_shape_fn((2, 3, 3), |(y, x, c)| (y * 60 + x * 20 + c) as f32);
        save_rgb(&path, image.view()).unwrap();
        let back = image::open(&path).unwrap().to_rgb8();
        assert_eq!(back.get_pixel(2, 1).0, [100, 101, 102]);
    }
}
