use colorgrad::Color;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::Args;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub schedule: ScheduleConfig,
    pub probe: ProbeConfig,
    pub audio: AudioConfig,
    pub chart: ChartConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_file: PathBuf,
    pub error_log: PathBuf,
    pub chart_file: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Delay between the end of one auto-measurement and the start of the next.
    pub interval_minutes: u32,
    pub auto_start: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub base_url: String,
    pub download_bytes: u64,
    pub upload_bytes: u64,
    pub latency_samples: u32,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub music_folder: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChartConfig {
    pub width: u32,
    pub height: u32,
    pub title: String,
    /// Color stops of the speed scale, lowest speed first.
    pub palette: Vec<String>,
    pub background: String,
    pub text_color: String,
    pub axis_color: String,
    pub font_family: String,
    pub font_size: f64,
    pub grid: GridStyle,
    #[serde(deserialize_with = "scatter_marker")]
    pub scatter: MarkerStyle,
    #[serde(deserialize_with = "latest_marker")]
    pub latest: MarkerStyle,
    #[serde(deserialize_with = "download_avg_line")]
    pub download_avg: AverageLineStyle,
    #[serde(deserialize_with = "upload_avg_line")]
    pub upload_avg: AverageLineStyle,
    pub colorbar: ColorbarStyle,
    pub legend: LegendStyle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridStyle {
    pub enabled: bool,
    pub color: String,
    pub linestyle: LineStyle,
    pub linewidth: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarkerStyle {
    pub marker: MarkerShape,
    /// Marker area in points squared.
    pub size: f64,
    pub edgecolor: String,
    pub linewidth: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AverageLineStyle {
    pub color: String,
    pub linestyle: LineStyle,
    pub linewidth: f64,
    /// Legend text; `{avg}` is replaced with the mean in Mbps.
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorbarStyle {
    pub enabled: bool,
    pub label: String,
    pub text_color: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LegendStyle {
    pub enabled: bool,
    pub text_color: String,
    pub columns: u32,
    pub frame: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LineStyle {
    Solid,
    Dashed,
    Dotted,
    DashDot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MarkerShape {
    Circle,
    Square,
    Triangle,
    Cross,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            data_file: PathBuf::from("internet_data.txt"),
            error_log: PathBuf::from("error_log.txt"),
            chart_file: PathBuf::from("scatter_plot.png"),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        ScheduleConfig {
            interval_minutes: 5,
            auto_start: false,
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            base_url: "https://speed.cloudflare.com".to_string(),
            download_bytes: 25_000_000,
            upload_bytes: 10_000_000,
            latency_samples: 5,
            timeout_secs: 60,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        AudioConfig {
            music_folder: PathBuf::from("sounds/music"),
        }
    }
}

impl Default for ChartConfig {
    fn default() -> Self {
        ChartConfig {
            width: 1000,
            height: 600,
            title: "Download and Upload Speeds".to_string(),
            palette: ["red", "orange", "yellow", "green", "blue", "violet"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            background: "white".to_string(),
            text_color: "black".to_string(),
            axis_color: "black".to_string(),
            font_family: "sans-serif".to_string(),
            font_size: 15.0,
            grid: GridStyle::default(),
            scatter: MarkerStyle::scatter(),
            latest: MarkerStyle::latest(),
            download_avg: AverageLineStyle::download(),
            upload_avg: AverageLineStyle::upload(),
            colorbar: ColorbarStyle::default(),
            legend: LegendStyle::default(),
        }
    }
}

impl Default for GridStyle {
    fn default() -> Self {
        GridStyle {
            enabled: false,
            color: "#b0b0b0".to_string(),
            linestyle: LineStyle::Dashed,
            linewidth: 0.5,
        }
    }
}

impl MarkerStyle {
    pub fn scatter() -> Self {
        MarkerStyle {
            marker: MarkerShape::Circle,
            size: 30.0,
            edgecolor: "black".to_string(),
            linewidth: 0.3,
        }
    }

    pub fn latest() -> Self {
        MarkerStyle {
            marker: MarkerShape::Circle,
            size: 40.0,
            edgecolor: "black".to_string(),
            linewidth: 1.5,
        }
    }
}

impl AverageLineStyle {
    pub fn download() -> Self {
        AverageLineStyle {
            color: "blue".to_string(),
            linestyle: LineStyle::Dashed,
            linewidth: 1.2,
            label: "Avg Download ({avg} Mbps)".to_string(),
        }
    }

    pub fn upload() -> Self {
        AverageLineStyle {
            color: "red".to_string(),
            linestyle: LineStyle::Dashed,
            linewidth: 1.2,
            label: "Avg Upload ({avg} Mbps)".to_string(),
        }
    }
}

// Scatter/latest and download/upload share a type but not their defaults, so a
// partial table is laid over the matching defaults instead of `Default`.
#[derive(Deserialize)]
struct MarkerOverride {
    marker: Option<MarkerShape>,
    size: Option<f64>,
    edgecolor: Option<String>,
    linewidth: Option<f64>,
}

#[derive(Deserialize)]
struct AverageLineOverride {
    color: Option<String>,
    linestyle: Option<LineStyle>,
    linewidth: Option<f64>,
    label: Option<String>,
}

impl MarkerOverride {
    fn apply(self, base: MarkerStyle) -> MarkerStyle {
        MarkerStyle {
            marker: self.marker.unwrap_or(base.marker),
            size: self.size.unwrap_or(base.size),
            edgecolor: self.edgecolor.unwrap_or(base.edgecolor),
            linewidth: self.linewidth.unwrap_or(base.linewidth),
        }
    }
}

impl AverageLineOverride {
    fn apply(self, base: AverageLineStyle) -> AverageLineStyle {
        AverageLineStyle {
            color: self.color.unwrap_or(base.color),
            linestyle: self.linestyle.unwrap_or(base.linestyle),
            linewidth: self.linewidth.unwrap_or(base.linewidth),
            label: self.label.unwrap_or(base.label),
        }
    }
}

fn scatter_marker<'de, D: Deserializer<'de>>(d: D) -> Result<MarkerStyle, D::Error> {
    MarkerOverride::deserialize(d).map(|o| o.apply(MarkerStyle::scatter()))
}

fn latest_marker<'de, D: Deserializer<'de>>(d: D) -> Result<MarkerStyle, D::Error> {
    MarkerOverride::deserialize(d).map(|o| o.apply(MarkerStyle::latest()))
}

fn download_avg_line<'de, D: Deserializer<'de>>(d: D) -> Result<AverageLineStyle, D::Error> {
    AverageLineOverride::deserialize(d).map(|o| o.apply(AverageLineStyle::download()))
}

fn upload_avg_line<'de, D: Deserializer<'de>>(d: D) -> Result<AverageLineStyle, D::Error> {
    AverageLineOverride::deserialize(d).map(|o| o.apply(AverageLineStyle::upload()))
}

impl Default for ColorbarStyle {
    fn default() -> Self {
        ColorbarStyle {
            enabled: true,
            label: "Speed (Mbps)".to_string(),
            text_color: "black".to_string(),
        }
    }
}

impl Default for LegendStyle {
    fn default() -> Self {
        LegendStyle {
            enabled: true,
            text_color: "black".to_string(),
            columns: 2,
            frame: false,
        }
    }
}

impl TryFrom<String> for LineStyle {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.trim().to_lowercase().as_str() {
            "-" | "solid" => Ok(LineStyle::Solid),
            "--" | "dashed" => Ok(LineStyle::Dashed),
            ":" | "dotted" => Ok(LineStyle::Dotted),
            "-." | "dashdot" => Ok(LineStyle::DashDot),
            other => Err(format!("unknown line style '{}'", other)),
        }
    }
}

impl From<LineStyle> for String {
    fn from(style: LineStyle) -> Self {
        match style {
            LineStyle::Solid => "-",
            LineStyle::Dashed => "--",
            LineStyle::Dotted => ":",
            LineStyle::DashDot => "-.",
        }
        .to_string()
    }
}

impl TryFrom<String> for MarkerShape {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.trim() {
            "o" | "circle" => Ok(MarkerShape::Circle),
            "s" | "square" => Ok(MarkerShape::Square),
            "^" | "triangle" => Ok(MarkerShape::Triangle),
            "x" | "cross" => Ok(MarkerShape::Cross),
            other => Err(format!("unknown marker '{}'", other)),
        }
    }
}

impl From<MarkerShape> for String {
    fn from(shape: MarkerShape) -> Self {
        match shape {
            MarkerShape::Circle => "o",
            MarkerShape::Square => "s",
            MarkerShape::Triangle => "^",
            MarkerShape::Cross => "x",
        }
        .to_string()
    }
}

impl fmt::Display for LineStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from(*self))
    }
}

/// Parse a CSS color name, hex string or single-letter shorthand (`"k"`, `"b"`, ...).
pub fn parse_color(value: &str) -> Result<Color, String> {
    let value = value.trim();
    let expanded = match value {
        "b" => "blue",
        "g" => "green",
        "r" => "red",
        "c" => "cyan",
        "m" => "magenta",
        "y" => "yellow",
        "k" => "black",
        "w" => "white",
        other => other,
    };
    Color::from_html(expanded).map_err(|e| format!("'{}': {}", value, e))
}

impl AppConfig {
    /// Default config location, honouring `$XDG_CONFIG_HOME`.
    pub fn config_path() -> PathBuf {
        let base = std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
                PathBuf::from(home).join(".config")
            });
        base.join("speedlog").join("config.toml")
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: AppConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// A broken config never stops the program; it just means defaults.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            tracing::debug!("No config at '{}'; using defaults", path.display());
            return Self::default();
        }
        match Self::load(path) {
            Ok(config) => {
                tracing::info!("Loaded config from '{}'", path.display());
                config
            }
            Err(e) => {
                tracing::warn!("Ignoring config '{}': {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=120).contains(&self.schedule.interval_minutes) {
            return Err(ConfigError::invalid(
                "schedule.interval_minutes",
                format!("{} is outside 1-120", self.schedule.interval_minutes),
            ));
        }

        let probe = &self.probe;
        if probe.download_bytes == 0 || probe.upload_bytes == 0 {
            return Err(ConfigError::invalid("probe", "transfer sizes must be non-zero"));
        }
        if probe.latency_samples == 0 {
            return Err(ConfigError::invalid("probe.latency_samples", "must be at least 1"));
        }
        if probe.timeout_secs == 0 {
            return Err(ConfigError::invalid("probe.timeout_secs", "must be at least 1"));
        }
        if !probe.base_url.starts_with("http://") && !probe.base_url.starts_with("https://") {
            return Err(ConfigError::invalid(
                "probe.base_url",
                format!("'{}' is not an http(s) URL", probe.base_url),
            ));
        }

        self.chart.validate()
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |reason: String| ConfigError::Write {
            path: path.to_path_buf(),
            reason,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| write_err(e.to_string()))?;
        }

        let body = toml::to_string_pretty(self).map_err(|e| write_err(e.to_string()))?;
        let contents = format!(
            "# speedlog configuration\n\
             # Every key is optional; missing keys use the values shown here.\n\
             # Chart and schedule changes apply while the TUI is running.\n\
             # Storage paths require a restart.\n\
             # Line styles: \"-\", \"--\", \":\", \"-.\"   Markers: \"o\", \"s\", \"^\", \"x\"\n\
             # Chart labels: use {{avg}} for the mean speed.\n\n{}",
            body
        );

        std::fs::write(path, contents).map_err(|e| write_err(e.to_string()))
    }

    pub fn merge_with_args(&mut self, args: &Args) -> bool {
        let mut args_provided = false;

        if let Some(ref data) = args.data {
            self.storage.data_file = data.clone();
            args_provided = true;
        }

        if let Some(ref chart) = args.chart {
            self.storage.chart_file = chart.clone();
            args_provided = true;
        }

        if let Some(ref error_log) = args.error_log {
            self.storage.error_log = error_log.clone();
            args_provided = true;
        }

        if let Some(interval) = args.interval {
            self.schedule.interval_minutes = crate::schedule::clamp_interval(interval);
            args_provided = true;
        }

        args_provided
    }
}

impl ChartConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.width < 200 || self.height < 200 {
            return Err(ConfigError::invalid(
                "chart.width/height",
                format!("{}x{} is too small", self.width, self.height),
            ));
        }
        if !self.font_size.is_finite() || self.font_size <= 0.0 {
            return Err(ConfigError::invalid("chart.font_size", "must be positive"));
        }
        if self.palette.len() < 2 {
            return Err(ConfigError::invalid("chart.palette", "needs at least two colors"));
        }
        for color in &self.palette {
            parse_color(color).map_err(|e| ConfigError::invalid("chart.palette", e))?;
        }

        let colors = [
            ("chart.background", &self.background),
            ("chart.text_color", &self.text_color),
            ("chart.axis_color", &self.axis_color),
            ("chart.grid.color", &self.grid.color),
            ("chart.scatter.edgecolor", &self.scatter.edgecolor),
            ("chart.latest.edgecolor", &self.latest.edgecolor),
            ("chart.download_avg.color", &self.download_avg.color),
            ("chart.upload_avg.color", &self.upload_avg.color),
            ("chart.colorbar.text_color", &self.colorbar.text_color),
            ("chart.legend.text_color", &self.legend.text_color),
        ];
        for (field, value) in colors {
            parse_color(value).map_err(|e| ConfigError::invalid(field, e))?;
        }

        for (field, marker) in [("chart.scatter", &self.scatter), ("chart.latest", &self.latest)] {
            if !marker.size.is_finite() || marker.size <= 0.0 || marker.linewidth < 0.0 {
                return Err(ConfigError::invalid(
                    field,
                    "size must be positive and linewidth non-negative",
                ));
            }
        }

        for (field, line) in [
            ("chart.download_avg.linewidth", self.download_avg.linewidth),
            ("chart.upload_avg.linewidth", self.upload_avg.linewidth),
            ("chart.grid.linewidth", self.grid.linewidth),
        ] {
            if line < 0.0 {
                return Err(ConfigError::invalid(field, "must be non-negative"));
            }
        }

        if self.legend.columns == 0 {
            return Err(ConfigError::invalid("chart.legend.columns", "must be at least 1"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_document_keeps_other_defaults() {
        let config: AppConfig = toml::from_str(
            r##"
            unknown_key = 3

            [chart]
            palette = ["#000000", "white"]

            [chart.legend]
            columns = 3
            "##,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.chart.palette, vec!["#000000", "white"]);
        assert_eq!(config.chart.legend.columns, 3);
        assert!(config.chart.legend.enabled);
        assert_eq!(config.schedule.interval_minutes, 5);
        assert_eq!(config.storage.data_file, PathBuf::from("internet_data.txt"));
    }

    #[test]
    fn matplotlib_line_styles_and_markers_parse() {
        let config: AppConfig = toml::from_str(
            r#"
            [chart.grid]
            enabled = true
            linestyle = ":"

            [chart.latest]
            marker = "s"
            "#,
        )
        .unwrap();
        assert_eq!(config.chart.grid.linestyle, LineStyle::Dotted);
        assert_eq!(config.chart.latest.marker, MarkerShape::Square);
    }

    #[test]
    fn partial_series_tables_keep_their_own_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [chart.upload_avg]
            linewidth = 2.0

            [chart.scatter]
            size = 12.0
            "#,
        )
        .unwrap();
        assert_eq!(config.chart.upload_avg.color, "red");
        assert_eq!(config.chart.upload_avg.linewidth, 2.0);
        assert_eq!(config.chart.download_avg.color, "blue");
        assert_eq!(config.chart.scatter.size, 12.0);
        assert_eq!(config.chart.scatter.linewidth, 0.3);
        assert_eq!(config.chart.latest.linewidth, 1.5);
    }

    #[test]
    fn unknown_line_style_is_a_parse_error() {
        let res: Result<AppConfig, _> = toml::from_str("[chart.grid]\nlinestyle = \"wavy\"\n");
        assert!(res.is_err());
    }

    #[test]
    fn bad_color_is_rejected_with_field_name() {
        let mut config = AppConfig::default();
        config.chart.download_avg.color = "not-a-color".to_string();
        match config.validate() {
            Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, "chart.download_avg.color"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn interval_out_of_range_is_rejected() {
        let mut config = AppConfig::default();
        config.schedule.interval_minutes = 0;
        assert!(config.validate().is_err());
        config.schedule.interval_minutes = 121;
        assert!(config.validate().is_err());
    }

    #[test]
    fn shorthand_colors() {
        assert_eq!(parse_color("k").unwrap().to_rgba8(), [0, 0, 0, 255]);
        assert_eq!(parse_color("#ff0000").unwrap().to_rgba8(), [255, 0, 0, 255]);
        assert!(parse_color("nope").is_err());
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[chart\nwidth = ").unwrap();

        assert!(matches!(AppConfig::load(&path), Err(ConfigError::Parse(_))));
        assert_eq!(AppConfig::load_or_default(&path), AppConfig::default());
    }

    #[test]
    fn missing_file_is_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(matches!(AppConfig::load(&path), Err(ConfigError::Read { .. })));
        assert_eq!(AppConfig::load_or_default(&path), AppConfig::default());
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = AppConfig::default();
        config.chart.grid.enabled = true;
        config.chart.legend.columns = 3;
        config.schedule.interval_minutes = 15;

        config.save(&path).unwrap();
        assert_eq!(AppConfig::load(&path).unwrap(), config);
    }
}
