use clap::{Args, Parser, Subcommand, ValueEnum};
use mvs_prep::{ChannelOrder, PipelineConfig};
use serde::Serialize;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "mvs-prep",
    about = "Prepare multi-view stereo inputs and score depth predictions"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Load every sample of a dense folder and export the network inputs.
    Prepare(PrepareArgs),
    /// Compare persisted depth maps against ground truth.
    Evaluate(EvaluateArgs),
}

#[derive(Debug, Clone, Copy, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ChannelArg {
    Rgb,
    Bgr,
}

impl From<ChannelArg> for ChannelOrder {
    fn from(arg: ChannelArg) -> Self {
        match arg {
            ChannelArg::Rgb => ChannelOrder::Rgb,
            ChannelArg::Bgr => ChannelOrder::Bgr,
        }
    }
}

#[derive(Debug, Clone, Serialize, Args)]
pub struct PipelineArgs {
    #[arg(long, default_value_t = 5, help = "Views per sample, reference included")]
    pub view_num: usize,

    #[arg(long, default_value_t = 200)]
    pub max_d: usize,

    #[arg(long, default_value_t = 1024)]
    pub max_w: usize,

    #[arg(long, default_value_t = 768)]
    pub max_h: usize,

    #[arg(long, default_value_t = 0.25)]
    pub sample_scale: f64,

    #[arg(long, default_value_t = 1.0)]
    pub interval_scale: f64,

    #[arg(long, default_value_t = 8)]
    pub base_image_size: usize,

    #[arg(long, value_enum, default_value_t = ChannelArg::Bgr, help = "Channel order of the network inputs")]
    pub channel_order: ChannelArg,

    #[arg(long, default_value_t = false)]
    pub write_inverse_depth: bool,

    #[arg(long, default_value_t = 2.0)]
    pub inverse_depth_exponent: f64,
}

impl PipelineArgs {
    pub fn to_config(&self) -> PipelineConfig {
        PipelineConfig {
            view_num: self.view_num,
            max_d: self.max_d,
            max_h: self.max_h,
            max_w: self.max_w,
            sample_scale: self.sample_scale,
            interval_scale: self.interval_scale,
            base_image_size: self.base_image_size,
            channel_order: self.channel_order.into(),
            write_inverse_depth: self.write_inverse_depth,
            inverse_depth_exponent: self.inverse_depth_exponent,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.view_num == 0 {
            anyhow::bail!("--view-num must be > 0");
        }
        if self.max_d == 0 {
            anyhow::bail!("--max-d must be > 0");
        }
        if self.base_image_size == 0 {
            anyhow::bail!("--base-image-size must be > 0");
        }
        if self.max_h % self.base_image_size != 0 || self.max_w % self.base_image_size != 0 {
            anyhow::bail!(
                "--max-h and --max-w must be multiples of --base-image-size ({}), got {}x{}",
                self.base_image_size,
                self.max_h,
                self.max_w
            );
        }
        if !(self.sample_scale > 0.0 && self.sample_scale <= 1.0) {
            anyhow::bail!("--sample-scale must be in (0, 1], got {}", self.sample_scale);
        }
        // Remaining checks live with the config itself.
        self.to_config().validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Args)]
pub struct PrepareArgs {
    #[arg(long, help = "Folder holding images/, cams/ and pair.txt")]
    pub dense_folder: String,

    #[arg(long, help = "Defaults to <dense-folder>/prepared")]
    pub output_dir: Option<String>,

    #[arg(long, help = "Run subfolder name; defaults to a timestamp")]
    pub run_name: Option<String>,

    #[arg(long, help = "Folder of <id>.pfm ground-truth depth maps")]
    pub depth_folder: Option<String>,

    #[arg(long, default_value_t = 0)]
    pub max_samples: usize,

    #[arg(long, default_value_t = false)]
    pub prefetch: bool,

    #[command(flatten)]
    pub pipeline: PipelineArgs,
}

impl PrepareArgs {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.pipeline.validate()
    }
}

#[derive(Debug, Clone, Serialize, Args)]
pub struct EvaluateArgs {
    #[arg(long, help = "Folder with <id>_init.pfm and <id>.txt files")]
    pub pred_dir: String,

    #[arg(long, help = "Folder with <id>.pfm ground-truth depth maps")]
    pub gt_dir: String,

    #[arg(long, help = "Defaults to <pred-dir>/metrics.json")]
    pub output: Option<String>,

    #[arg(long, default_value_t = 1.0)]
    pub alpha: f64,

    #[arg(long, default_value_t = 1.0)]
    pub beta: f64,
}

impl EvaluateArgs {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.alpha <= 0.0 || self.beta <= 0.0 {
            anyhow::bail!("--alpha and --beta must be > 0");
        }
        Ok(())
    }
}
