use chrono::{Local, NaiveDateTime, Timelike};
use std::sync::Arc;

use crate::error::MeasurementError;
use crate::probe::{ProbeReport, SpeedProbe};
use crate::sample::{round_to, Sample, UNKNOWN};
use crate::store::SampleStore;

/// Runs one speed test and records it.
pub struct Collector<P> {
    probe: P,
    store: Arc<SampleStore>,
}

impl<P: SpeedProbe> Collector<P> {
    pub fn new(probe: P, store: Arc<SampleStore>) -> Self {
        Collector { probe, store }
    }

    pub fn store(&self) -> &Arc<SampleStore> {
        &self.store
    }

    /// Measure, then append exactly one record. Nothing is appended on failure.
    pub async fn collect(&self) -> Result<Sample, MeasurementError> {
        let started = Local::now().naive_local();
        tracing::info!("Starting speed test");

        let report = self.probe.run().await?;
        let sample = normalize(started, report)?;
        self.store.append(&sample)?;

        tracing::info!(
            download_mbps = sample.download_mbps,
            upload_mbps = sample.upload_mbps,
            ping_ms = sample.ping_ms,
            "Speed test recorded"
        );
        Ok(sample)
    }
}

/// Convert raw probe figures into a loggable sample taken at `at`.
pub fn normalize(at: NaiveDateTime, report: ProbeReport) -> Result<Sample, MeasurementError> {
    for (name, value) in [
        ("download", report.download_bps),
        ("upload", report.upload_bps),
        ("latency", report.latency_ms),
    ] {
        if !value.is_finite() || value < 0.0 {
            return Err(MeasurementError::Service(format!(
                "{} measurement out of range: {}",
                name, value
            )));
        }
    }

    let client = report.client;
    Ok(Sample {
        date: at.date(),
        time: at.time().with_nanosecond(0).unwrap_or(at.time()),
        download_mbps: round_to(report.download_bps / 1_000_000.0, 3),
        upload_mbps: round_to(report.upload_bps / 1_000_000.0, 3),
        ping_ms: report.latency_ms.trunc() as u32,
        isp: client.isp.unwrap_or_else(|| UNKNOWN.to_string()),
        country: client.country.unwrap_or_else(|| UNKNOWN.to_string()),
        latitude: client.latitude.unwrap_or(0.0),
        longitude: client.longitude.unwrap_or(0.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ClientInfo;
    use crate::sample::FIELD_COUNT;
    use chrono::NaiveDate;

    struct FixedProbe(ProbeReport);

    impl SpeedProbe for FixedProbe {
        async fn run(&self) -> Result<ProbeReport, MeasurementError> {
            Ok(self.0.clone())
        }
    }

    struct FailingProbe;

    impl SpeedProbe for FailingProbe {
        async fn run(&self) -> Result<ProbeReport, MeasurementError> {
            Err(MeasurementError::Service("no servers available".to_string()))
        }
    }

    fn report() -> ProbeReport {
        ProbeReport {
            download_bps: 93_512_345.6,
            upload_bps: 20_000_499.0,
            latency_ms: 14.87,
            client: ClientInfo {
                isp: Some("Example Net".to_string()),
                country: Some("NL".to_string()),
                latitude: Some(52.37),
                longitude: Some(4.89),
            },
        }
    }

    fn at() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 1)
            .unwrap()
            .and_hms_nano_opt(13, 30, 5, 987_000_000)
            .unwrap()
    }

    #[test]
    fn normalizes_units_and_rounding() {
        let s = normalize(at(), report()).unwrap();
        assert_eq!(s.download_mbps, 93.512);
        assert_eq!(s.upload_mbps, 20.0);
        assert_eq!(s.ping_ms, 14);
        assert_eq!(s.time.format("%H:%M:%S").to_string(), "13:30:05");
        assert_eq!(s.time.nanosecond(), 0);
    }

    #[test]
    fn missing_metadata_defaults() {
        let mut r = report();
        r.client = ClientInfo::default();
        let s = normalize(at(), r).unwrap();
        assert_eq!(s.isp, "Unknown");
        assert_eq!(s.country, "Unknown");
        assert_eq!(s.latitude, 0.0);
        assert_eq!(s.longitude, 0.0);
    }

    #[test]
    fn negative_or_nan_rates_are_service_errors() {
        let mut r = report();
        r.upload_bps = f64::NAN;
        assert!(matches!(normalize(at(), r), Err(MeasurementError::Service(_))));
        let mut r = report();
        r.download_bps = -1.0;
        assert!(matches!(normalize(at(), r), Err(MeasurementError::Service(_))));
    }

    #[tokio::test]
    async fn successful_collect_appends_one_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("internet_data.txt");
        let collector = Collector::new(FixedProbe(report()), Arc::new(SampleStore::new(&path)));

        let sample = collector.collect().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].split(',').count(), FIELD_COUNT);
        assert_eq!(collector.store().load().unwrap(), vec![sample.clone()]);

        let download = lines[0].split(',').nth(2).unwrap();
        assert_eq!(download, "93.512");
        assert!(sample.download_mbps >= 0.0 && sample.upload_mbps >= 0.0);
    }

    #[tokio::test]
    async fn failed_probe_appends_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("internet_data.txt");
        let store = Arc::new(SampleStore::new(&path));
        store.append(&normalize(at(), report()).unwrap()).unwrap();
        let before = std::fs::read_to_string(&path).unwrap();

        let collector = Collector::new(FailingProbe, Arc::clone(&store));
        assert!(matches!(
            collector.collect().await,
            Err(MeasurementError::Service(_))
        ));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
    }

    #[tokio::test]
    async fn unwritable_log_is_a_measurement_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("internet_data.txt");
        let collector = Collector::new(FixedProbe(report()), Arc::new(SampleStore::new(&path)));

        assert!(matches!(
            collector.collect().await,
            Err(MeasurementError::Store(_))
        ));
        assert!(!path.exists());
    }
}
