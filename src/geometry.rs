//! Shared-scale and alignment-crop geometry for multi-view samples.
//!
//! Every view of a sample is resized by one common factor so that the
//! relative geometry between cameras is preserved, then each view is
//! center-cropped on its own to a size the network's downsampling stages can
//! divide evenly. Camera intrinsics follow every image operation.

use ndarray::{s, Array2, Array3, ArrayView2, ArrayView3};

use crate::camera::CameraModel;
use crate::error::{MvsError, Result};

/// Pixel window `[y, y + height) x [x, x + width)` inside a view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CropWindow {
    pub y: usize,
    pub x: usize,
    pub height: usize,
    pub width: usize,
}

/// Largest per-view scale needed to bring `(height, width)` views down to the
/// `max_h x max_w` bound.
///
/// Only shrinking is supported: a result above 1.0 means some view is smaller
/// than the bound in both dimensions and the call fails.
pub fn shared_scale(native_sizes: &[(usize, usize)], max_h: usize, max_w: usize) -> Result<f64> {
    if native_sizes.is_empty() {
        return Err(MvsError::GeometryConfig(
            "cannot compute a shared scale without views".to_string(),
        ));
    }

    let mut scale = 0f64;
    for &(h, w) in native_sizes {
        if h == 0 || w == 0 {
            return Err(MvsError::GeometryConfig(format!(
                "view has an empty size {h}x{w}"
            )));
        }
        let height_scale = max_h as f64 / h as f64;
        let width_scale = max_w as f64 / w as f64;
        scale = scale.max(height_scale.max(width_scale));
    }

    if scale > 1.0 {
        return Err(MvsError::GeometryConfig(format!(
            "bounds {max_h}x{max_w} would upsample views by {scale:.4}; max_h and max_w must not exceed any view size"
        )));
    }
    Ok(scale)
}

/// Centered crop for one view.
///
/// Dimensions larger than the target are clamped to it. A dimension at or
/// below the target is rounded *down* to a multiple of `base_size` (it is
/// kept as is when already aligned), not up to the next multiple, so the
/// window never extends past the image.
pub fn alignment_crop(
    native: (usize, usize),
    base_size: usize,
    target_h: usize,
    target_w: usize,
) -> Result<CropWindow> {
    if base_size == 0 {
        return Err(MvsError::GeometryConfig(
            "base image size must be positive".to_string(),
        ));
    }
    let (h, w) = native;
    let height = aligned_extent(h, base_size, target_h);
    let width = aligned_extent(w, base_size, target_w);
    if height == 0 || width == 0 {
        return Err(MvsError::GeometryConfig(format!(
            "view {h}x{w} is smaller than the alignment base {base_size}"
        )));
    }
    Ok(CropWindow {
        y: (h - height).div_ceil(2),
        x: (w - width).div_ceil(2),
        height,
        width,
    })
}

fn aligned_extent(native: usize, base: usize, target: usize) -> usize {
    if native > target {
        return target;
    }
    let rounded_up = native.div_ceil(base) * base;
    if rounded_up <= native {
        rounded_up
    } else {
        (native / base) * base
    }
}

pub fn crop_view(
    image: ArrayView3<'_, f32>,
    camera: &CameraModel,
    window: CropWindow,
) -> (Array3<f32>, CameraModel) {
    let cropped = image
        .slice(s![
            window.y..window.y + window.height,
            window.x..window.x + window.width,
            ..
        ])
        .to_owned();
    (cropped, camera.crop(window.x, window.y))
}

pub fn crop_depth(depth: ArrayView2<'_, f32>, window: CropWindow) -> Array2<f32> {
    depth
        .slice(s![
            window.y..window.y + window.height,
            window.x..window.x + window.width
        ])
        .to_owned()
}

/// Output extent of a resize by `scale`, never below one pixel.
pub fn scaled_extent(extent: usize, scale: f64) -> usize {
    ((extent as f64 * scale).round() as usize).max(1)
}

/// Bilinear resize of the image together with its camera.
pub fn scale_view(
    image: ArrayView3<'_, f32>,
    camera: &CameraModel,
    scale: f64,
) -> (Array3<f32>, CameraModel) {
    let (h, w, _) = image.dim();
    let resized = resize_bilinear(image, scaled_extent(h, scale), scaled_extent(w, scale));
    (resized, camera.scale(scale))
}

/// Nearest-neighbour resize for depth maps, where blending across the
/// invalid-pixel sentinel would invent depths.
pub fn scale_depth(depth: ArrayView2<'_, f32>, scale: f64) -> Array2<f32> {
    let (h, w) = depth.dim();
    resize_nearest(depth, scaled_extent(h, scale), scaled_extent(w, scale))
}

pub fn resize_bilinear(src: ArrayView3<'_, f32>, dst_h: usize, dst_w: usize) -> Array3<f32> {
    let (src_h, src_w, channels) = src.dim();
    if src_h == dst_h && src_w == dst_w {
        return src.to_owned();
    }

    let mut out = Array3::<f32>::zeros((dst_h, dst_w, channels));
    if src_h == 0 || src_w == 0 {
        return out;
    }
    let scale_y = src_h as f32 / dst_h as f32;
    let scale_x = src_w as f32 / dst_w as f32;

    for y in 0..dst_h {
        let in_y = ((y as f32 + 0.5) * scale_y - 0.5)
            .max(0.0)
            .min((src_h - 1) as f32);
        let y0 = in_y.floor() as usize;
        let y1 = (y0 + 1).min(src_h - 1);
        let wy = in_y - y0 as f32;

        for x in 0..dst_w {
            let in_x = ((x as f32 + 0.5) * scale_x - 0.5)
                .max(0.0)
                .min((src_w - 1) as f32);
            let x0 = in_x.floor() as usize;
            let x1 = (x0 + 1).min(src_w - 1);
            let wx = in_x - x0 as f32;

            for c in 0..channels {
                let top = src[[y0, x0, c]] * (1.0 - wx) + src[[y0, x1, c]] * wx;
                let bottom = src[[y1, x0, c]] * (1.0 - wx) + src[[y1, x1, c]] * wx;
                out[[y, x, c]] = top * (1.0 - wy) + bottom * wy;
            }
        }
    }

    out
}

pub fn resize_nearest(src: ArrayView2<'_, f32>, dst_h: usize, dst_w: usize) -> Array2<f32> {
    let (src_h, src_w) = src.dim();
    if src_h == dst_h && src_w == dst_w {
        return src.to_owned();
    }
    if src_h == 0 || src_w == 0 {
        return Array2::zeros((dst_h, dst_w));
    }
    let scale_y = src_h as f64 / dst_h as f64;
    let scale_x = src_w as f64 / dst_w as f64;
    Array2::from_shape_fn((dst_h, dst_w), |(y, x)| {
        let sy = ((y as f64 * scale_y).floor() as usize).min(src_h - 1);
        let sx = ((x as f64 * scale_x).floor() as usize).min(src_w - 1);
        src[[sy, sx]]
    })
}

/// Zeroes ground-truth depths outside `(min_depth, max_depth]`.
pub fn mask_depth_range(depth: ArrayView2<'_, f32>, min_depth: f32, max_depth: f32) -> Array2<f32> {
    depth.mapv(|d| if d > min_depth && d <= max_depth { d } else { 0.0 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{DepthSampling, Intrinsics};
    use approx::assert_relative_eq;
    use nalgebra::{Matrix3, Vector3};
    use ndarray::{array, Array};

    fn camera() -> CameraModel {
        CameraModel::new(
            Matrix3::identity(),
            Vector3::new(1.0, 2.0, 3.0),
            Intrinsics {
                fx: 1000.0,
                fy: 1000.0,
                cx: 400.0,
                cy: 300.0,
            },
            DepthSampling::derived(425.0, 2.5, 192),
        )
    }

    #[test]
    fn shared_scale_takes_the_largest_requirement() {
        let scale = shared_scale(&[(768, 1024), (600, 800)], 384, 512).unwrap();
        assert_relative_eq!(scale, 0.64);
    }

    #[test]
    fn shared_scale_considers_both_axes() {
        // Height needs 0.5, width needs 0.8 for the second view.
        let scale = shared_scale(&[(800, 1000), (768, 640)], 384, 512).unwrap();
        assert_relative_eq!(scale, 0.8);
    }

    #[test]
    fn shared_scale_rejects_upsampling() {
        let err = shared_scale(&[(768, 1024), (300, 400)], 384, 512).unwrap_err();
        assert!(matches!(err, MvsError::GeometryConfig(_)));
    }

    #[test]
    fn shared_scale_rejects_empty_input() {
        assert!(matches!(
            shared_scale(&[], 384, 512),
            Err(MvsError::GeometryConfig(_))
        ));
    }

    #[test]
    fn oversized_view_is_clamped_and_centered() {
        let window = alignment_crop((491, 655), 8, 384, 512).unwrap();
        assert_eq!(
            window,
            CropWindow {
                y: 54,
                x: 72,
                height: 384,
                width: 512
            }
        );
    }

    #[test]
    fn aligned_view_at_target_is_kept_whole() {
        let window = alignment_crop((384, 512), 8, 384, 512).unwrap();
        assert_eq!(
            window,
            CropWindow {
                y: 0,
                x: 0,
                height: 384,
                width: 512
            }
        );
    }

    #[test]
    fn unaligned_small_view_keeps_largest_aligned_window() {
        let window = alignment_crop((300, 510), 8, 384, 512).unwrap();
        assert_eq!(window.height, 296);
        assert_eq!(window.width, 504);
        assert_eq!(window.y, 2);
        assert_eq!(window.x, 3);
    }

    #[test]
    fn views_below_the_base_are_rejected() {
        assert!(alignment_crop((4, 100), 8, 384, 512).is_err());
        assert!(alignment_crop((100, 100), 0, 384, 512).is_err());
    }

    #[test]
    fn crop_moves_pixels_and_principal_point_together() {
        let image = Array::from_shape_fn((6, 8, 3), |(y, x, c)| (y * 100 + x * 10 + c) as f32);
        let window = alignment_crop((6, 8), 2, 4, 4).unwrap();
        let (cropped, cam) = crop_view(image.view(), &camera(), window);
        assert_eq!(cropped.dim(), (4, 4, 3));
        assert_eq!(cropped[[0, 0, 1]], image[[window.y, window.x, 1]]);
        assert_relative_eq!(cam.intrinsics().cx, 400.0 - window.x as f64);
        assert_relative_eq!(cam.intrinsics().cy, 300.0 - window.y as f64);
    }

    #[test]
    fn scale_view_resizes_image_and_camera() {
        let image = Array3::<f32>::from_elem((10, 20, 3), 0.5);
        let (resized, cam) = scale_view(image.view(), &camera(), 0.5);
        assert_eq!(resized.dim(), (5, 10, 3));
        assert!(resized.iter().all(|&v| (v - 0.5).abs() < 1e-6));
        assert_relative_eq!(cam.intrinsics().fx, 500.0);
        assert_relative_eq!(cam.intrinsics().cy, 150.0);
    }

    #[test]
    fn bilinear_downsample_averages_neighbours() {
        let image = Array::from_shape_vec((2, 2, 1), vec![0.0f32, 1.0, 2.0, 3.0]).unwrap();
        let out = resize_bilinear(image.view(), 1, 1);
        assert_relative_eq!(out[[0, 0, 0]], 1.5);
    }

    #[test]
    fn nearest_resize_never_blends_depths() {
        let depth = array![[1.0f32, 0.0], [0.0, 4.0]];
        let out = resize_nearest(depth.view(), 4, 4);
        assert!(out.iter().all(|v| [0.0, 1.0, 4.0].contains(v)));
        assert_eq!(out[[0, 0]], 1.0);
        assert_eq!(out[[3, 3]], 4.0);
    }

    #[test]
    fn depth_range_mask_zeroes_out_of_range() {
        let depth = array![[400.0f32, 425.0], [500.0, 1000.0]];
        let masked = mask_depth_range(depth.view(), 425.0, 900.0);
        assert_eq!(masked, array![[0.0f32, 0.0], [500.0, 0.0]]);
    }
}
