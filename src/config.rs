use serde::{Deserialize, Serialize};

use crate::camera::ParseOptions;
use crate::error::{MvsError, Result};

/// Channel order of the images handed to the network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    Rgb,
    /// Order the published MVSNet weights were trained with.
    #[default]
    Bgr,
}

/// Settings shared by every stage of the pipeline.
///
/// Built once by the caller and passed by reference; no stage reads
/// configuration from anywhere else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Views per sample: one reference plus `view_num - 1` sources.
    pub view_num: usize,
    /// Depth bins used when a calibration does not carry a count.
    pub max_d: usize,
    pub max_h: usize,
    pub max_w: usize,
    /// Extra downsampling applied to images and cameras for the cost volume.
    pub sample_scale: f64,
    /// Multiplier on the depth interval read from calibration files.
    pub interval_scale: f64,
    /// Cropped sizes are multiples of this.
    pub base_image_size: usize,
    /// Applies to the network inputs only; persisted images stay RGB.
    pub channel_order: ChannelOrder,
    pub write_inverse_depth: bool,
    pub inverse_depth_exponent: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            view_num: 5,
            max_d: 200,
            max_h: 768,
            max_w: 1024,
            sample_scale: 0.25,
            interval_scale: 1.0,
            base_image_size: 8,
            channel_order: ChannelOrder::Bgr,
            write_inverse_depth: false,
            inverse_depth_exponent: 2.0,
        }
    }
}

impl PipelineConfig {
    pub fn parse_options(&self) -> ParseOptions {
        ParseOptions {
            interval_scale: self.interval_scale,
            default_depth_num: self.max_d,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |message: String| Err(MvsError::GeometryConfig(message));
        if self.view_num == 0 {
            return fail("view_num must be at least 1".to_string());
        }
        if self.max_d == 0 {
            return fail("max_d must be positive".to_string());
        }
        if self.base_image_size == 0 {
            return fail("base_image_size must be positive".to_string());
        }
        if self.max_h == 0
            || self.max_w == 0
            || self.max_h % self.base_image_size != 0
            || self.max_w % self.base_image_size != 0
        {
            return fail(format!(
                "max_h ({}) and max_w ({}) must be positive multiples of base_image_size ({})",
                self.max_h, self.max_w, self.base_image_size
            ));
        }
        if !(self.sample_scale > 0.0 && self.sample_scale <= 1.0) {
            return fail(format!(
                "sample_scale must be in (0, 1], got {}",
                self.sample_scale
            ));
        }
        if !(self.interval_scale > 0.0) {
            return fail(format!(
                "interval_scale must be positive, got {}",
                self.interval_scale
            ));
        }
        if self.inverse_depth_exponent <= 0.0 {
            return fail(format!(
                "inverse_depth_exponent must be positive, got {}",
                self.inverse_depth_exponent
            ));
        }
        Ok(())
    }
}
