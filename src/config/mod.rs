//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{num::NonZeroU32, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

pub use cli::{CliArgs, Command, RenderArgs, RenderOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "mathsnap";
pub(crate) const DEFAULT_RENDER_SCALE: u32 = 2;
pub(crate) const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;
pub(crate) const DEFAULT_READY_TIMEOUT_SECS: u64 = 10;
pub(crate) const DEFAULT_CACHE_CAPACITY: usize = 256;
pub(crate) const DEFAULT_DISPLAY_MODE: bool = true;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub render: RenderSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub scale: NonZeroU32,
    pub request_timeout: Duration,
    pub ready_timeout: Duration,
    pub cache_capacity: usize,
    pub display_mode: bool,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("MATHSNAP").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match &cli.command {
        Command::Render(args) => raw.apply_render_overrides(&args.overrides),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    render: RawRenderSettings,
}

impl RawSettings {
    fn apply_render_overrides(&mut self, overrides: &RenderOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(scale) = overrides.scale {
            self.render.scale = Some(scale);
        }
        if let Some(seconds) = overrides.request_timeout_seconds {
            self.render.request_timeout_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.ready_timeout_seconds {
            self.render.ready_timeout_seconds = Some(seconds);
        }
        if let Some(capacity) = overrides.cache_capacity {
            self.render.cache_capacity = Some(capacity);
        }
        if let Some(display_mode) = overrides.display_mode {
            self.render.display_mode = Some(display_mode);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings { logging, render } = raw;

        let logging = build_logging_settings(logging)?;
        let render = build_render_settings(render)?;

        Ok(Self { logging, render })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_render_settings(render: RawRenderSettings) -> Result<RenderSettings, LoadError> {
    let scale = non_zero_u32(
        render.scale.unwrap_or(u64::from(DEFAULT_RENDER_SCALE)),
        "render.scale",
    )?;
    let request_timeout = non_zero_duration(
        render
            .request_timeout_seconds
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
        "render.request_timeout_seconds",
    )?;
    let ready_timeout = non_zero_duration(
        render
            .ready_timeout_seconds
            .unwrap_or(DEFAULT_READY_TIMEOUT_SECS),
        "render.ready_timeout_seconds",
    )?;

    Ok(RenderSettings {
        scale,
        request_timeout,
        ready_timeout,
        cache_capacity: render.cache_capacity.unwrap_or(DEFAULT_CACHE_CAPACITY),
        display_mode: render.display_mode.unwrap_or(DEFAULT_DISPLAY_MODE),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    scale: Option<u64>,
    request_timeout_seconds: Option<u64>,
    ready_timeout_seconds: Option<u64>,
    cache_capacity: Option<usize>,
    display_mode: Option<bool>,
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_duration(seconds: u64, key: &'static str) -> Result<Duration, LoadError> {
    if seconds == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_secs(seconds))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

        assert_eq!(settings.logging.level, LevelFilter::INFO);
        assert!(matches!(settings.logging.format, LogFormat::Compact));
        assert_eq!(settings.render.scale.get(), 2);
        assert_eq!(settings.render.request_timeout, Duration::from_secs(15));
        assert_eq!(settings.render.ready_timeout, Duration::from_secs(10));
        assert_eq!(settings.render.cache_capacity, 256);
        assert!(settings.render.display_mode);
    }

    #[test]
    fn cli_overrides_take_highest_precedence() {
        let mut raw = RawSettings::default();
        raw.render.scale = Some(4);
        raw.logging.level = Some("info".to_string());

        let overrides = RenderOverrides {
            scale: Some(3),
            log_level: Some("debug".to_string()),
            cache_capacity: Some(0),
            display_mode: Some(false),
            ..Default::default()
        };

        raw.apply_render_overrides(&overrides);
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert_eq!(settings.render.scale.get(), 3);
        assert_eq!(settings.logging.level, LevelFilter::DEBUG);
        assert_eq!(settings.render.cache_capacity, 0);
        assert!(!settings.render.display_mode);
    }

    #[test]
    fn rejects_zero_scale_and_timeouts() {
        let mut raw = RawSettings::default();
        raw.render.scale = Some(0);
        let err = Settings::from_raw(raw).expect_err("zero scale");
        assert!(matches!(err, LoadError::Invalid { key: "render.scale", .. }));

        let mut raw = RawSettings::default();
        raw.render.request_timeout_seconds = Some(0);
        let err = Settings::from_raw(raw).expect_err("zero timeout");
        assert!(matches!(
            err,
            LoadError::Invalid {
                key: "render.request_timeout_seconds",
                ..
            }
        ));
    }

    #[test]
    fn rejects_unknown_log_level() {
        let mut raw = RawSettings::default();
        raw.logging.level = Some("chatty".to_string());
        let err = Settings::from_raw(raw).expect_err("bad level");
        assert!(matches!(err, LoadError::Invalid { key: "logging.level", .. }));
    }

    #[test]
    fn cli_json_logging_enforces_format() {
        let mut raw = RawSettings::default();
        let overrides = RenderOverrides {
            log_json: Some(true),
            ..Default::default()
        };

        raw.apply_render_overrides(&overrides);
        let settings = Settings::from_raw(raw).expect("valid settings");

        assert!(matches!(settings.logging.format, LogFormat::Json));
    }

    #[test]
    fn config_file_is_layered_under_cli() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("temp file");
        writeln!(
            file,
            "[render]\nscale = 3\nrequest_timeout_seconds = 7\n\n[logging]\nlevel = \"warn\""
        )
        .expect("write config");

        let path = file.path().to_string_lossy().into_owned();
        let args = CliArgs::parse_from([
            "mathsnap",
            "--config-file",
            path.as_str(),
            "render",
            "--render-scale",
            "5",
            "x^2",
        ]);
        let settings = load(&args).expect("settings");

        assert_eq!(settings.render.scale.get(), 5);
        assert_eq!(settings.render.request_timeout, Duration::from_secs(7));
        assert_eq!(settings.logging.level, LevelFilter::WARN);
    }

    #[test]
    fn parse_render_arguments() {
        let args = CliArgs::parse_from([
            "mathsnap",
            "render",
            "--out-dir",
            "/tmp/formulas",
            "--render-display-mode",
            "false",
            "x^2",
            r"\frac{1}{2}",
        ]);

        match args.command {
            Command::Render(render) => {
                assert_eq!(render.out_dir, std::path::Path::new("/tmp/formulas"));
                assert_eq!(render.formulas, vec!["x^2", r"\frac{1}{2}"]);
                assert_eq!(render.overrides.display_mode, Some(false));
            }
        }
    }

    #[test]
    fn render_requires_formulas() {
        assert!(CliArgs::try_parse_from(["mathsnap", "render"]).is_err());
    }
}
