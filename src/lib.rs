//! Input preparation, loss computation and result persistence for
//! multi-view stereo depth estimation.

pub mod artifacts;
pub mod camera;
pub mod config;
pub mod error;
pub mod geometry;
pub mod loss;
pub mod observer;
pub mod pairs;
pub mod pfm;
pub mod pipeline;
pub mod stream;

pub use artifacts::{ArtifactPaths, ArtifactWriter};
pub use camera::{CameraModel, DepthSampling, Intrinsics, ParseOptions};
pub use config::{ChannelOrder, PipelineConfig};
pub use error::{MvsError, Result};
pub use observer::{NoopObserver, PipelineObserver, TracingObserver};
pub use pipeline::{run_inference, DepthNetwork, NetworkOutput};
pub use stream::{MvsBatch, MvsSample, MvsStream, Prefetch, ViewPaths};
