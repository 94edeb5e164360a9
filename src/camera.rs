//! Per-view pinhole calibration with a depth sampling range.
//!
//! Calibration files use a fixed positional layout:
//!
//! ```text
//! extrinsic
//! r00 r01 r02 t0
//! r10 r11 r12 t1
//! r20 r21 r22 t2
//! 0   0   0   1
//!
//! intrinsic
//! fx  0   cx
//! 0   fy  cy
//! 0   0   1
//!
//! depth_start depth_interval [depth_num] [depth_end]
//! ```
//!
//! The number of trailing depth tokens is recovered from the total token
//! count (29, 30 or 31). Any other count yields an all-zero
//! [`DepthSampling`].

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use nalgebra::{Matrix3, Matrix4, Vector3};
use tracing::{debug, warn};

use crate::error::{MvsError, Result};

const EXTRINSIC_OFFSET: usize = 1;
const INTRINSIC_OFFSET: usize = 18;
const DEPTH_OFFSET: usize = 27;

/// Focal lengths and principal point in pixels. Skew is always zero.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Intrinsics {
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, 0.0, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }
}

/// Depth hypotheses swept by the cost volume.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct DepthSampling {
    pub start: f64,
    pub interval: f64,
    pub count: usize,
    pub end: f64,
}

impl DepthSampling {
    /// Builds a range whose last hypothesis is `start + interval * (count - 1)`.
    pub fn derived(start: f64, interval: f64, count: usize) -> Self {
        Self {
            start,
            interval,
            count,
            end: start + interval * count.saturating_sub(1) as f64,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// Options that complete a calibration whose depth tail is partial.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParseOptions {
    /// Multiplier applied to the depth interval read from the file.
    pub interval_scale: f64,
    /// Bin count used when the file only carries start and interval.
    pub default_depth_num: usize,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            interval_scale: 1.0,
            default_depth_num: 200,
        }
    }
}

/// Immutable camera calibration for one view.
///
/// Geometric adjustments return new instances; the value a sample was loaded
/// with is never modified by later stages.
#[derive(Clone, Debug, PartialEq)]
pub struct CameraModel {
    rotation: Matrix3<f64>,
    translation: Vector3<f64>,
    intrinsics: Intrinsics,
    depth: DepthSampling,
}

impl CameraModel {
    pub fn new(
        rotation: Matrix3<f64>,
        translation: Vector3<f64>,
        intrinsics: Intrinsics,
        depth: DepthSampling,
    ) -> Self {
        Self {
            rotation,
            translation,
            intrinsics,
            depth,
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        Self::parse_with(text, &ParseOptions::default())
    }

    pub fn parse_with(text: &str, options: &ParseOptions) -> Result<Self> {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        if tokens.len() < DEPTH_OFFSET {
            return Err(MvsError::Parse(format!(
                "expected at least {DEPTH_OFFSET} tokens for the extrinsic and intrinsic blocks, found {}",
                tokens.len()
            )));
        }

        let number = |index: usize| -> Result<f64> {
            tokens[index].parse::<f64>().map_err(|_| {
                MvsError::Parse(format!(
                    "token {index} ({:?}) is not a number",
                    tokens[index]
                ))
            })
        };

        let mut extrinsic = Matrix4::<f64>::zeros();
        for row in 0..4 {
            for col in 0..4 {
                extrinsic[(row, col)] = number(EXTRINSIC_OFFSET + 4 * row + col)?;
            }
        }
        let mut intrinsic = Matrix3::<f64>::zeros();
        for row in 0..3 {
            for col in 0..3 {
                intrinsic[(row, col)] = number(INTRINSIC_OFFSET + 3 * row + col)?;
            }
        }

        let rotation = extrinsic.fixed_view::<3, 3>(0, 0).into_owned();
        let translation = extrinsic.fixed_view::<3, 1>(0, 3).into_owned();
        let intrinsics = Intrinsics {
            fx: intrinsic[(0, 0)],
            fy: intrinsic[(1, 1)],
            cx: intrinsic[(0, 2)],
            cy: intrinsic[(1, 2)],
        };
        let depth = parse_depth_tail(&tokens[DEPTH_OFFSET..], options);

        Ok(Self {
            rotation,
            translation,
            intrinsics,
            depth,
        })
    }

    pub fn load(path: &Path, options: &ParseOptions) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|source| MvsError::io(path, source))?;
        Self::parse_with(&text, options).map_err(|err| match err {
            MvsError::Parse(message) => MvsError::Parse(format!("{}: {message}", path.display())),
            other => other,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_text()).map_err(|source| MvsError::io(path, source))
    }

    pub fn rotation(&self) -> &Matrix3<f64> {
        &self.rotation
    }

    pub fn translation(&self) -> &Vector3<f64> {
        &self.translation
    }

    pub fn intrinsics(&self) -> &Intrinsics {
        &self.intrinsics
    }

    pub fn depth_sampling(&self) -> &DepthSampling {
        &self.depth
    }

    /// World-to-camera transform with the fixed `[0, 0, 0, 1]` last row.
    pub fn extrinsic(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0).copy_from(&self.rotation);
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    /// Copy with focal lengths and principal point multiplied by `factor`.
    pub fn scale(&self, factor: f64) -> Self {
        let k = &self.intrinsics;
        Self {
            intrinsics: Intrinsics {
                fx: k.fx * factor,
                fy: k.fy * factor,
                cx: k.cx * factor,
                cy: k.cy * factor,
            },
            ..self.clone()
        }
    }

    /// Copy with the principal point shifted into a window starting at
    /// (`origin_x`, `origin_y`).
    pub fn crop(&self, origin_x: usize, origin_y: usize) -> Self {
        let k = &self.intrinsics;
        Self {
            intrinsics: Intrinsics {
                cx: k.cx - origin_x as f64,
                cy: k.cy - origin_y as f64,
                ..*k
            },
            ..self.clone()
        }
    }

    /// Copy with a replaced bin count; start, interval and end are kept.
    pub fn with_depth_count(&self, count: usize) -> Self {
        Self {
            depth: DepthSampling { count, ..self.depth },
            ..self.clone()
        }
    }

    /// Serializes in the explicit 31-token layout.
    pub fn to_text(&self) -> String {
        let mut out = String::from("extrinsic\n");
        let extrinsic = self.extrinsic();
        for row in 0..4 {
            for col in 0..4 {
                let _ = write!(out, "{} ", extrinsic[(row, col)]);
            }
            out.push('\n');
        }
        out.push_str("\nintrinsic\n");
        let intrinsic = self.intrinsics.matrix();
        for row in 0..3 {
            for col in 0..3 {
                let _ = write!(out, "{} ", intrinsic[(row, col)]);
            }
            out.push('\n');
        }
        let d = &self.depth;
        let _ = writeln!(out, "\n{} {} {} {}", d.start, d.interval, d.count, d.end);
        out
    }

    /// Network layout: slot 0 is the extrinsic, slot 1 holds the intrinsic in
    /// its upper-left 3x3 block and `[start, interval, count, end]` in row 3.
    pub fn to_packed(&self) -> [[[f32; 4]; 4]; 2] {
        let mut packed = [[[0f32; 4]; 4]; 2];
        let extrinsic = self.extrinsic();
        let intrinsic = self.intrinsics.matrix();
        for row in 0..4 {
            for col in 0..4 {
                packed[0][row][col] = extrinsic[(row, col)] as f32;
            }
        }
        for row in 0..3 {
            for col in 0..3 {
                packed[1][row][col] = intrinsic[(row, col)] as f32;
            }
        }
        let d = &self.depth;
        packed[1][3] = [
            d.start as f32,
            d.interval as f32,
            d.count as f32,
            d.end as f32,
        ];
        packed
    }
}

// The 27-token prefix is fixed, so a tail of 2, 3 or 4 tokens is exactly a
// total of 29, 30 or 31.
fn parse_depth_tail(tail: &[&str], options: &ParseOptions) -> DepthSampling {
    let Some(values) = tail
        .iter()
        .map(|token| token.parse::<f64>().ok())
        .collect::<Option<Vec<f64>>>()
    else {
        warn!("non-numeric depth range {tail:?}, falling back to an empty range");
        return DepthSampling::default();
    };

    let scale = options.interval_scale;
    let sampling = match values.as_slice() {
        [start, interval] => {
            DepthSampling::derived(*start, interval * scale, options.default_depth_num)
        }
        [start, interval, count] => match as_count(*count) {
            Some(count) => DepthSampling::derived(*start, interval * scale, count),
            None => {
                warn!("depth count {count} is not a non-negative integer");
                return DepthSampling::default();
            }
        },
        [start, interval, count, end] => match as_count(*count) {
            Some(count) => DepthSampling {
                start: *start,
                interval: interval * scale,
                count,
                end: *end,
            },
            None => {
                warn!("depth count {count} is not a non-negative integer");
                return DepthSampling::default();
            }
        },
        _ => {
            debug!(
                "{} trailing depth tokens, using an empty depth range",
                values.len()
            );
            return DepthSampling::default();
        }
    };

    if sampling.interval > 0.0 && sampling.end < sampling.start {
        warn!(
            "depth range ends before it starts ({} < {}), using an empty depth range",
            sampling.end, sampling.start
        );
        return DepthSampling::default();
    }
    sampling
}

fn as_count(value: f64) -> Option<usize> {
    (value.is_finite() && value >= 0.0 && value.fract() == 0.0).then_some(value as usize)
}
