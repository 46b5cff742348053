use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the mathsnap binary.
#[derive(Debug, Parser)]
#[command(
    name = "mathsnap",
    version,
    about = "Render LaTeX formulas through a shared typesetting surface"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "MATHSNAP_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Render formulas and write one file per formula.
    Render(RenderArgs),
}

#[derive(Debug, Args, Clone)]
pub struct RenderArgs {
    #[command(flatten)]
    pub overrides: RenderOverrides,

    /// Directory receiving `formula-<index>.<ext>` files.
    #[arg(
        long = "out-dir",
        value_name = "DIR",
        default_value = ".",
        value_hint = ValueHint::DirPath
    )]
    pub out_dir: PathBuf,

    /// Formulas to render, in order.
    #[arg(value_name = "FORMULA", required = true)]
    pub formulas: Vec<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RenderOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the scale factor passed to the typesetting script.
    #[arg(long = "render-scale", value_name = "FACTOR")]
    pub scale: Option<u64>,

    /// Override the per-request timeout.
    #[arg(long = "render-request-timeout-seconds", value_name = "SECONDS")]
    pub request_timeout_seconds: Option<u64>,

    /// Override how long the script environment may take to become ready.
    #[arg(long = "render-ready-timeout-seconds", value_name = "SECONDS")]
    pub ready_timeout_seconds: Option<u64>,

    /// Override the number of rendered formulas kept in memory (0 disables).
    #[arg(long = "render-cache-capacity", value_name = "COUNT")]
    pub cache_capacity: Option<usize>,

    /// Toggle display (block) mode.
    #[arg(
        long = "render-display-mode",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub display_mode: Option<bool>,
}
