use std::path::PathBuf;

/// Errors raised while preparing multi-view samples or persisting results.
///
/// Every variant is fatal for the sample being processed. Degenerate inputs
/// that have a defined fallback (for example an unrecognized depth tail in a
/// calibration file) never reach this type.
#[derive(Debug, thiserror::Error)]
pub enum MvsError {
    #[error("malformed calibration: {0}")]
    Parse(String),

    #[error("invalid PFM data: {0}")]
    Format(String),

    #[error("invalid geometry configuration: {0}")]
    GeometryConfig(String),

    #[error("I/O failure on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("image codec failure on {}: {source}", path.display())]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("array export failure on {}: {message}", path.display())]
    Npz { path: PathBuf, message: String },

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

pub type Result<T> = std::result::Result<T, MvsError>;

impl MvsError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn image(path: impl Into<PathBuf>, source: image::ImageError) -> Self {
        Self::Image {
            path: path.into(),
            source,
        }
    }
}
