//! Rolling statistics over the whole sample log.

use serde::Serialize;
use std::fmt;

use crate::sample::{round_to, Sample, SpeedRow, DATE_FORMAT, TIME_FORMAT};
use crate::store::SampleStore;

/// Projection horizons for transferred data, in minutes.
pub const PROJECTION_MINUTES: [u32; 4] = [1, 15, 30, 60];

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SeriesStats {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub delta: Delta,
}

/// How the latest sample compares with the mean of its series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", content = "percent", rename_all = "snake_case")]
pub enum Delta {
    Faster(f64),
    Slower(f64),
    NotApplicable,
}

/// Why a snapshot could not be computed from history.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum Degraded {
    FirstSample,
    ZeroMean,
    Unreadable(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateSnapshot {
    pub latest: Sample,
    pub download: SeriesStats,
    pub upload: SeriesStats,
    pub count: usize,
    pub degraded: Option<Degraded>,
}

impl Delta {
    /// Percentage change of `latest` against `mean`. Exactly zero counts as slower.
    pub fn between(latest: f64, mean: f64) -> Self {
        let pct = (latest - mean) / mean * 100.0;
        if pct > 0.0 {
            Delta::Faster(round_to(pct.abs(), 2))
        } else {
            Delta::Slower(round_to(pct.abs(), 2))
        }
    }
}

impl SeriesStats {
    fn single(value: f64) -> Self {
        SeriesStats {
            mean: value,
            min: value,
            max: value,
            delta: Delta::NotApplicable,
        }
    }

    /// `None` only for an empty series. A zero mean keeps its min and max but
    /// has no meaningful percentage, so its delta is not applicable.
    fn over(values: impl Iterator<Item = f64> + Clone, latest: f64) -> Option<Self> {
        let count = values.clone().count();
        if count == 0 {
            return None;
        }
        let mean = values.clone().sum::<f64>() / count as f64;
        let delta = if mean == 0.0 {
            Delta::NotApplicable
        } else {
            Delta::between(latest, mean)
        };
        Some(SeriesStats {
            mean,
            min: values.clone().fold(f64::INFINITY, f64::min),
            max: values.fold(f64::NEG_INFINITY, f64::max),
            delta,
        })
    }
}

/// Statistics over everything in `store`, which is expected to already contain
/// `latest`. Read failures degrade the snapshot instead of failing.
pub fn aggregate(store: &SampleStore, latest: &Sample) -> AggregateSnapshot {
    match store.load_rows() {
        Ok(rows) => aggregate_rows(&rows, latest),
        Err(e) => {
            tracing::warn!("Falling back to single-sample statistics: {}", e);
            AggregateSnapshot::degenerate(latest, Degraded::Unreadable(e.to_string()))
        }
    }
}

pub fn aggregate_rows(rows: &[SpeedRow], latest: &Sample) -> AggregateSnapshot {
    if rows.len() <= 1 {
        return AggregateSnapshot::degenerate(latest, Degraded::FirstSample);
    }

    let download = SeriesStats::over(rows.iter().map(|r| r.download_mbps), latest.download_mbps);
    let upload = SeriesStats::over(rows.iter().map(|r| r.upload_mbps), latest.upload_mbps);

    let (Some(download), Some(upload)) = (download, upload) else {
        return AggregateSnapshot::degenerate(latest, Degraded::FirstSample);
    };
    let zero_mean = download.mean == 0.0 || upload.mean == 0.0;

    AggregateSnapshot {
        latest: latest.clone(),
        download,
        upload,
        count: rows.len(),
        degraded: zero_mean.then_some(Degraded::ZeroMean),
    }
}

impl AggregateSnapshot {
    pub fn degenerate(latest: &Sample, reason: Degraded) -> Self {
        AggregateSnapshot {
            latest: latest.clone(),
            download: SeriesStats::single(latest.download_mbps),
            upload: SeriesStats::single(latest.upload_mbps),
            count: 1,
            degraded: Some(reason),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }

    /// The presentation report, one line per entry.
    pub fn report_lines(&self) -> Vec<String> {
        let s = &self.latest;
        let mut lines = vec![
            format!("Date: {}", s.date.format(DATE_FORMAT)),
            format!("Time: {}", s.time.format(TIME_FORMAT)),
            format!("Download: {} Mbps ({} MB/s)", s.download_mbps, megabytes_per_sec(s.download_mbps)),
            format!("  GB 1/15/30/60 min: {}", projection_text(s.download_mbps)),
            format!("Upload: {} Mbps ({} MB/s)", s.upload_mbps, megabytes_per_sec(s.upload_mbps)),
            format!("  GB 1/15/30/60 min: {}", projection_text(s.upload_mbps)),
            format!("Ping: {} ms", s.ping_ms),
            format!("ISP: {}", s.isp),
            format!("Country: {}", s.country),
            format!("Latitude: {}", s.latitude),
            format!("Longitude: {}", s.longitude),
            String::new(),
        ];

        let na = self.not_applicable_text();
        lines.extend([
            format!(
                "Average Download: {} Mbps ({} MB/s)",
                round_to(self.download.mean, 2),
                megabytes_per_sec(self.download.mean)
            ),
            format!(
                "Average Upload: {} Mbps ({} MB/s)",
                round_to(self.upload.mean, 2),
                megabytes_per_sec(self.upload.mean)
            ),
            format!("Total Tests Run: {}", self.count),
            format!("Download Comparison: {}", comparison_text(self.download.delta, "download", na)),
            format!("Upload Comparison: {}", comparison_text(self.upload.delta, "upload", na)),
            String::new(),
        ]);

        for (label, value) in [
            ("Fastest Download", self.download.max),
            ("Slowest Download", self.download.min),
            ("Fastest Upload", self.upload.max),
            ("Slowest Upload", self.upload.min),
        ] {
            lines.push(format!(
                "{}: {} Mbps ({} MB/s)",
                label,
                round_to(value, 2),
                megabytes_per_sec(value)
            ));
        }

        lines
    }

    fn not_applicable_text(&self) -> &'static str {
        match self.degraded {
            Some(Degraded::Unreadable(_)) => "N/A (error)",
            Some(Degraded::ZeroMean) => "N/A (zero average)",
            _ => "N/A (first test)",
        }
    }
}

impl fmt::Display for AggregateSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in self.report_lines() {
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}

fn comparison_text(delta: Delta, series: &str, na: &str) -> String {
    match delta {
        Delta::Faster(pct) => format!("{}% faster than average {}", pct, series),
        Delta::Slower(pct) => format!("{}% slower than average {}", pct, series),
        Delta::NotApplicable => na.to_string(),
    }
}

/// Mbps to MB/s, rounded to 3 decimals.
pub fn megabytes_per_sec(mbps: f64) -> f64 {
    round_to(mbps / 8.0, 3)
}

/// Gigabytes transferred at `mbps` over each of [`PROJECTION_MINUTES`].
pub fn projected_gigabytes(mbps: f64) -> [f64; 4] {
    let mb_per_sec = megabytes_per_sec(mbps);
    PROJECTION_MINUTES.map(|minutes| round_to(mb_per_sec * (minutes * 60) as f64 / 1000.0, 3))
}

fn projection_text(mbps: f64) -> String {
    projected_gigabytes(mbps)
        .iter()
        .map(|gb| gb.to_string())
        .collect::<Vec<_>>()
        .join("/")
}
