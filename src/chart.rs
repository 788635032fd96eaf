//! Hour-of-day scatter chart of download and upload speeds.
//!
//! Every sample is placed at its fractional hour (0..24) twice, once for the
//! download speed and once for the upload speed. Marker fill comes from a
//! single color scale spanning all speeds in the log, so both series share
//! one colorbar. The most recent sample is drawn last with its own marker
//! style, and dashed horizontal lines mark the mean of each series.
//!
//! The image is drawn into a sibling staging file and renamed over the
//! destination, so a failed render leaves the previous chart in place.

use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use plotters::coord::cartesian::Cartesian2d;
use plotters::coord::types::RangedCoordf64;
use plotters::coord::Shift;
use plotters::prelude::*;
use plotters::style::text_anchor::{HPos, Pos, VPos};
use plotters::style::{FontDesc, FontFamily, FontStyle};

use crate::config::{parse_color, ChartConfig, LineStyle, MarkerShape, MarkerStyle};
use crate::error::RenderError;
use crate::sample::SpeedRow;
use crate::store::SampleStore;

/// Pixels per typographic point. Marker sizes and line widths are in points.
const DPI: f64 = 100.0;
const COLORBAR_WIDTH: u32 = 130;
const COLORBAR_STEPS: usize = 128;
/// One dash-pattern unit as a fraction of a full-width chart line.
const CHART_DASH_UNIT: f64 = 1.0 / 240.0;
const LEGEND_DASH_UNIT: f64 = 1.0 / 12.0;

type Plot<'a, DB> = ChartContext<'a, DB, Cartesian2d<RangedCoordf64, RangedCoordf64>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChartKind {
    Png,
    Svg,
}

impl ChartKind {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("svg") => ChartKind::Svg,
            _ => ChartKind::Png,
        }
    }

    fn extension(self) -> &'static str {
        match self {
            ChartKind::Png => "png",
            ChartKind::Svg => "svg",
        }
    }
}

/// Maps a speed onto the configured palette.
pub struct ColorScale {
    gradient: colorgrad::Gradient,
    min: f64,
    max: f64,
}

impl ColorScale {
    pub fn new(palette: &[String], min: f64, max: f64) -> Result<Self, RenderError> {
        let colors = palette
            .iter()
            .map(|c| parse_color(c))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| RenderError::Style(format!("palette: {}", e)))?;

        let gradient = colorgrad::CustomGradient::new()
            .colors(&colors)
            .build()
            .map_err(|e| RenderError::Style(format!("palette: {}", e)))?;

        Ok(ColorScale { gradient, min, max })
    }

    pub fn bounds(&self) -> (f64, f64) {
        (self.min, self.max)
    }

    /// Position of `value` on the scale, clamped to [0, 1]. A flat scale maps
    /// everything to the first stop.
    pub fn position(&self, value: f64) -> f64 {
        if self.max > self.min {
            ((value - self.min) / (self.max - self.min)).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    pub fn color(&self, value: f64) -> RGBColor {
        let [r, g, b, _] = self.gradient.at(self.position(value)).to_rgba8();
        RGBColor(r, g, b)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChartPoint {
    pub hour: f64,
    pub download: f64,
    pub upload: f64,
}

/// Everything the chart shows, derived from the sample log alone.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartData {
    pub points: Vec<ChartPoint>,
    pub min_speed: f64,
    pub max_speed: f64,
    pub mean_download: f64,
    pub mean_upload: f64,
}

impl ChartData {
    pub fn from_rows(rows: &[SpeedRow]) -> Result<Self, RenderError> {
        if rows.is_empty() {
            return Err(RenderError::InsufficientData(
                "no samples recorded yet".to_string(),
            ));
        }

        let points: Vec<ChartPoint> = rows
            .iter()
            .map(|r| ChartPoint {
                hour: r.hour_of_day(),
                download: r.download_mbps,
                upload: r.upload_mbps,
            })
            .collect();

        let speeds = points.iter().flat_map(|p| [p.download, p.upload]);
        let min_speed = speeds.clone().fold(f64::INFINITY, f64::min);
        let max_speed = speeds.fold(f64::NEG_INFINITY, f64::max);

        let n = points.len() as f64;
        let mean_download = points.iter().map(|p| p.download).sum::<f64>() / n;
        let mean_upload = points.iter().map(|p| p.upload).sum::<f64>() / n;

        Ok(ChartData {
            points,
            min_speed,
            max_speed,
            mean_download,
            mean_upload,
        })
    }

    /// All points except the most recent.
    pub fn history(&self) -> &[ChartPoint] {
        &self.points[..self.points.len().saturating_sub(1)]
    }

    pub fn latest(&self) -> Option<&ChartPoint> {
        self.points.last()
    }

    /// Speed axis range with a 5% margin on each side.
    pub fn y_range(&self) -> Range<f64> {
        let span = self.max_speed - self.min_speed;
        let pad = if span > 0.0 {
            span * 0.05
        } else {
            self.max_speed.abs().max(1.0) * 0.1
        };
        let lo = self.min_speed - pad;
        let lo = if self.min_speed >= 0.0 { lo.max(0.0) } else { lo };
        lo..self.max_speed + pad
    }
}

#[derive(Debug, Clone)]
pub struct RenderedChart {
    pub path: PathBuf,
    pub points: usize,
    pub mean_download: f64,
    pub mean_upload: f64,
}

/// Render the whole sample log to `output`, replacing any previous chart.
pub fn render(
    store: &SampleStore,
    config: &ChartConfig,
    output: &Path,
) -> Result<RenderedChart, RenderError> {
    let rows = store.load_rows()?;
    let data = ChartData::from_rows(&rows)?;
    let scale = ColorScale::new(&config.palette, data.min_speed, data.max_speed)?;
    let ink = Ink::from_config(config)?;

    let kind = ChartKind::from_path(output);
    let staging = staging_path(output, kind);
    let size = (config.width, config.height);

    let drawn = match kind {
        ChartKind::Png => draw_chart(
            BitMapBackend::new(&staging, size).into_drawing_area(),
            &data,
            &scale,
            &ink,
            config,
        ),
        ChartKind::Svg => draw_chart(
            SVGBackend::new(&staging, size).into_drawing_area(),
            &data,
            &scale,
            &ink,
            config,
        ),
    };

    if let Err(e) = drawn {
        let _ = fs::remove_file(&staging);
        return Err(RenderError::Backend(format!("{:#}", e)));
    }

    if let Err(source) = fs::rename(&staging, output) {
        let _ = fs::remove_file(&staging);
        return Err(RenderError::Io {
            path: output.to_path_buf(),
            source,
        });
    }

    tracing::info!(
        points = data.points.len(),
        "Chart written to {}",
        output.display()
    );

    Ok(RenderedChart {
        path: output.to_path_buf(),
        points: data.points.len(),
        mean_download: data.mean_download,
        mean_upload: data.mean_upload,
    })
}

fn staging_path(output: &Path, kind: ChartKind) -> PathBuf {
    let stem = output
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("chart");
    output.with_file_name(format!(".{}.partial.{}", stem, kind.extension()))
}

/// Resolved colors for everything that is not on the speed scale.
struct Ink {
    background: RGBColor,
    text: RGBColor,
    axis: RGBColor,
    grid: RGBColor,
    scatter_edge: RGBColor,
    latest_edge: RGBColor,
    download_avg: RGBColor,
    upload_avg: RGBColor,
    colorbar_text: RGBColor,
    legend_text: RGBColor,
}

impl Ink {
    fn from_config(config: &ChartConfig) -> Result<Self, RenderError> {
        Ok(Ink {
            background: rgb("background", &config.background)?,
            text: rgb("text_color", &config.text_color)?,
            axis: rgb("axis_color", &config.axis_color)?,
            grid: rgb("grid.color", &config.grid.color)?,
            scatter_edge: rgb("scatter.edgecolor", &config.scatter.edgecolor)?,
            latest_edge: rgb("latest.edgecolor", &config.latest.edgecolor)?,
            download_avg: rgb("download_avg.color", &config.download_avg.color)?,
            upload_avg: rgb("upload_avg.color", &config.upload_avg.color)?,
            colorbar_text: rgb("colorbar.text_color", &config.colorbar.text_color)?,
            legend_text: rgb("legend.text_color", &config.legend.text_color)?,
        })
    }
}

fn rgb(field: &str, value: &str) -> Result<RGBColor, RenderError> {
    let [r, g, b, _] = parse_color(value)
        .map_err(|e| RenderError::Style(format!("{}: {}", field, e)))?
        .to_rgba8();
    Ok(RGBColor(r, g, b))
}

fn pt_to_px(pt: f64) -> f64 {
    pt * DPI / 72.0
}

/// Marker radius in pixels for a marker whose area is `size` square points.
fn marker_radius(size: f64) -> i32 {
    (pt_to_px(size.max(0.0).sqrt()) / 2.0).round().max(1.0) as i32
}

fn stroke_px(width_pt: f64) -> u32 {
    if width_pt <= 0.0 {
        0
    } else {
        pt_to_px(width_pt).round().max(1.0) as u32
    }
}

/// Split the segment `from`..`to` into the visible pieces of `style`.
/// `unit` is the length of one pattern unit as a fraction of the segment.
pub fn dash_segments(
    from: (f64, f64),
    to: (f64, f64),
    style: LineStyle,
    unit: f64,
) -> Vec<[(f64, f64); 2]> {
    let pattern: &[f64] = match style {
        LineStyle::Solid => return vec![[from, to]],
        LineStyle::Dashed => &[3.7, 1.6],
        LineStyle::Dotted => &[1.0, 1.65],
        LineStyle::DashDot => &[6.4, 1.6, 1.0, 1.6],
    };
    if unit <= 0.0 {
        return vec![[from, to]];
    }

    let lerp = |t: f64| {
        (
            from.0 + (to.0 - from.0) * t,
            from.1 + (to.1 - from.1) * t,
        )
    };

    let mut out = Vec::new();
    let mut t = 0.0;
    for (i, len) in pattern.iter().cycle().enumerate() {
        if t >= 1.0 {
            break;
        }
        let end = (t + len * unit).min(1.0);
        if i % 2 == 0 {
            out.push([lerp(t), lerp(end)]);
        }
        t = end;
    }
    out
}

/// Round tick positions covering `lo..=hi`, about `target` of them.
fn nice_ticks(lo: f64, hi: f64, target: usize) -> Vec<f64> {
    let span = hi - lo;
    if !span.is_finite() || span <= 0.0 || target == 0 {
        return Vec::new();
    }

    let raw = span / target as f64;
    let magnitude = 10f64.powf(raw.log10().floor());
    let step = [1.0, 2.0, 5.0, 10.0]
        .into_iter()
        .map(|m| m * magnitude)
        .find(|s| *s >= raw)
        .unwrap_or(10.0 * magnitude);

    let first = (lo / step).ceil();
    (0..)
        .map(|i| (first + i as f64) * step)
        .take_while(|t| *t <= hi + step * 1e-9)
        .collect()
}

fn text_style<'a>(config: &'a ChartConfig, px: f64, color: &RGBColor) -> TextStyle<'a> {
    FontDesc::new(
        FontFamily::from(config.font_family.as_str()),
        px,
        FontStyle::Normal,
    )
    .color(color)
}

enum Swatch {
    Marker {
        shape: MarkerShape,
        radius: i32,
        fill: RGBColor,
        edge: Option<ShapeStyle>,
    },
    Line {
        stroke: ShapeStyle,
        style: LineStyle,
    },
}

struct LegendEntry {
    label: String,
    swatch: Swatch,
}

fn marker_swatch(style: &MarkerStyle, fill: RGBColor, edge: RGBColor) -> Swatch {
    let width = stroke_px(style.linewidth);
    Swatch::Marker {
        shape: style.marker,
        radius: marker_radius(style.size),
        fill,
        edge: (width > 0).then(|| edge.stroke_width(width)),
    }
}

fn legend_entries(
    data: &ChartData,
    scale: &ColorScale,
    ink: &Ink,
    config: &ChartConfig,
) -> Vec<LegendEntry> {
    let mut entries = Vec::new();

    if let Some(first) = data.history().first() {
        for (label, value) in [("Download", first.download), ("Upload", first.upload)] {
            entries.push(LegendEntry {
                label: label.to_string(),
                swatch: marker_swatch(&config.scatter, scale.color(value), ink.scatter_edge),
            });
        }
    }

    if let Some(latest) = data.latest() {
        for (label, value) in [
            ("Latest Download", latest.download),
            ("Latest Upload", latest.upload),
        ] {
            entries.push(LegendEntry {
                label: label.to_string(),
                swatch: marker_swatch(&config.latest, scale.color(value), ink.latest_edge),
            });
        }
    }

    for (line, mean, color) in [
        (&config.download_avg, data.mean_download, ink.download_avg),
        (&config.upload_avg, data.mean_upload, ink.upload_avg),
    ] {
        entries.push(LegendEntry {
            label: line.label.replace("{avg}", &format!("{:.2}", mean)),
            swatch: Swatch::Line {
                stroke: color.stroke_width(stroke_px(line.linewidth)),
                style: line.linestyle,
            },
        });
    }

    entries
}

fn draw_chart<DB>(
    root: DrawingArea<DB, Shift>,
    data: &ChartData,
    scale: &ColorScale,
    ink: &Ink,
    config: &ChartConfig,
) -> anyhow::Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    root.fill(&ink.background)?;
    let font_px = pt_to_px(config.font_size);
    let root = root.titled(&config.title, text_style(config, font_px * 1.2, &ink.text))?;

    let entries = legend_entries(data, scale, ink, config);
    let (width, height) = root.dim_in_pixel();
    let legend_height = if config.legend.enabled {
        let rows = entries.len().div_ceil(config.legend.columns.max(1) as usize) as u32;
        rows * (font_px * 1.8) as u32 + 12
    } else {
        0
    };
    let (upper, legend_area) = root.split_vertically(height.saturating_sub(legend_height));

    let colorbar_width = if config.colorbar.enabled {
        COLORBAR_WIDTH.min(width / 4)
    } else {
        0
    };
    let (plot_area, colorbar_area) = upper.split_horizontally(width.saturating_sub(colorbar_width));

    let y = data.y_range();
    let mut chart = ChartBuilder::on(&plot_area)
        .margin(15)
        .x_label_area_size((font_px * 2.8) as u32)
        .y_label_area_size((font_px * 4.0) as u32)
        .build_cartesian_2d(0f64..24f64, y.clone())?;

    chart
        .configure_mesh()
        .disable_mesh()
        .x_labels(25)
        .y_labels(8)
        .x_label_formatter(&|v| format!("{:.0}", v))
        .y_label_formatter(&|v| format!("{:.1}", v))
        .x_desc("Hour of Day")
        .y_desc("Speed (Mbps)")
        .axis_style(ink.axis.stroke_width(1))
        .label_style(text_style(config, font_px * 0.8, &ink.text))
        .axis_desc_style(text_style(config, font_px, &ink.text))
        .draw()?;

    if config.grid.enabled {
        let stroke = ink.grid.stroke_width(stroke_px(config.grid.linewidth).max(1));
        let style = config.grid.linestyle;
        let mut lines = Vec::new();
        for hour in 0..=24 {
            let x = hour as f64;
            lines.extend(dash_segments((x, y.start), (x, y.end), style, CHART_DASH_UNIT));
        }
        for tick in nice_ticks(y.start, y.end, 8) {
            lines.extend(dash_segments((0.0, tick), (24.0, tick), style, CHART_DASH_UNIT));
        }
        chart.draw_series(lines.into_iter().map(|seg| PathElement::new(seg.to_vec(), stroke)))?;
    }

    for (line, mean, color) in [
        (&config.download_avg, data.mean_download, ink.download_avg),
        (&config.upload_avg, data.mean_upload, ink.upload_avg),
    ] {
        let stroke = color.stroke_width(stroke_px(line.linewidth));
        let dashes = dash_segments((0.0, mean), (24.0, mean), line.linestyle, CHART_DASH_UNIT);
        chart.draw_series(dashes.into_iter().map(|seg| PathElement::new(seg.to_vec(), stroke)))?;
    }

    for point in data.history() {
        for value in [point.download, point.upload] {
            let swatch = marker_swatch(&config.scatter, scale.color(value), ink.scatter_edge);
            draw_swatch(&mut chart, (point.hour, value), &swatch)?;
        }
    }

    // The latest sample goes on top of everything else.
    if let Some(latest) = data.latest() {
        for value in [latest.download, latest.upload] {
            let swatch = marker_swatch(&config.latest, scale.color(value), ink.latest_edge);
            draw_swatch(&mut chart, (latest.hour, value), &swatch)?;
        }
    }

    if config.colorbar.enabled {
        draw_colorbar(&colorbar_area, scale, ink, config, font_px)?;
    }
    if config.legend.enabled && !entries.is_empty() {
        draw_legend(&legend_area, &entries, ink, config, font_px)?;
    }

    root.present()?;
    Ok(())
}

fn draw_swatch<DB>(chart: &mut Plot<'_, DB>, at: (f64, f64), swatch: &Swatch) -> anyhow::Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    let Swatch::Marker {
        shape,
        radius,
        fill,
        edge,
    } = swatch
    else {
        return Ok(());
    };
    let r = *radius;

    match shape {
        MarkerShape::Circle => {
            chart.draw_series(std::iter::once(Circle::new(at, r, fill.filled())))?;
            if let Some(edge) = edge {
                chart.draw_series(std::iter::once(Circle::new(at, r, *edge)))?;
            }
        }
        MarkerShape::Square => {
            chart.draw_series(std::iter::once(
                EmptyElement::at(at) + Rectangle::new([(-r, -r), (r, r)], fill.filled()),
            ))?;
            if let Some(edge) = edge {
                chart.draw_series(std::iter::once(
                    EmptyElement::at(at) + Rectangle::new([(-r, -r), (r, r)], *edge),
                ))?;
            }
        }
        MarkerShape::Triangle => {
            chart.draw_series(std::iter::once(TriangleMarker::new(at, r, fill.filled())))?;
            if let Some(edge) = edge {
                chart.draw_series(std::iter::once(TriangleMarker::new(at, r, *edge)))?;
            }
        }
        // A cross has no interior; draw it in the fill color.
        MarkerShape::Cross => {
            chart.draw_series(std::iter::once(Cross::new(at, r, fill.stroke_width(2))))?;
        }
    }
    Ok(())
}

fn draw_colorbar<DB>(
    area: &DrawingArea<DB, Shift>,
    scale: &ColorScale,
    ink: &Ink,
    config: &ChartConfig,
    font_px: f64,
) -> anyhow::Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    let (lo, hi) = scale.bounds();
    let hi = if hi > lo { hi } else { lo + 1.0 };

    let mut bar = ChartBuilder::on(area)
        .margin_top(15)
        .margin_bottom(15 + (font_px * 2.8) as u32)
        .margin_left(10)
        .margin_right(5)
        .set_label_area_size(LabelAreaPosition::Right, (font_px * 4.0) as u32)
        .build_cartesian_2d(0f64..1f64, lo..hi)?;

    bar.configure_mesh()
        .disable_mesh()
        .disable_x_axis()
        .y_labels(6)
        .y_label_formatter(&|v| format!("{:.0}", v))
        .y_desc(config.colorbar.label.as_str())
        .axis_style(ink.axis.stroke_width(1))
        .label_style(text_style(config, font_px * 0.8, &ink.colorbar_text))
        .axis_desc_style(text_style(config, font_px * 0.9, &ink.colorbar_text))
        .draw()?;

    let step = (hi - lo) / COLORBAR_STEPS as f64;
    bar.draw_series((0..COLORBAR_STEPS).map(|i| {
        let v0 = lo + step * i as f64;
        Rectangle::new(
            [(0.0, v0), (1.0, v0 + step)],
            scale.color(v0 + step / 2.0).filled(),
        )
    }))?;
    Ok(())
}

fn draw_legend<DB>(
    area: &DrawingArea<DB, Shift>,
    entries: &[LegendEntry],
    ink: &Ink,
    config: &ChartConfig,
    font_px: f64,
) -> anyhow::Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    let columns = config.legend.columns.max(1) as usize;
    let rows = entries.len().div_ceil(columns);
    let (cols_f, rows_f) = (columns as f64, rows as f64);

    let mut legend = ChartBuilder::on(area)
        .margin(4)
        .build_cartesian_2d(0f64..cols_f, 0f64..rows_f)?;

    if config.legend.frame {
        legend.draw_series(std::iter::once(Rectangle::new(
            [(0.0, 0.0), (cols_f, rows_f)],
            ink.axis.stroke_width(1),
        )))?;
    }

    let label_style = text_style(config, font_px * 0.8, &ink.legend_text)
        .pos(Pos::new(HPos::Left, VPos::Center));

    for (i, entry) in entries.iter().enumerate() {
        let x = (i % columns) as f64;
        let y = rows_f - (i / columns) as f64 - 0.5;

        match &entry.swatch {
            Swatch::Marker { .. } => draw_swatch(&mut legend, (x + 0.06, y), &entry.swatch)?,
            Swatch::Line { stroke, style } => {
                let dashes = dash_segments((x + 0.02, y), (x + 0.10, y), *style, LEGEND_DASH_UNIT);
                legend.draw_series(
                    dashes
                        .into_iter()
                        .map(|seg| PathElement::new(seg.to_vec(), *stroke)),
                )?;
            }
        }

        legend.draw_series(std::iter::once(Text::new(
            entry.label.clone(),
            (x + 0.14, y),
            label_style.clone(),
        )))?;
    }
    Ok(())
}
