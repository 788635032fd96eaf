//! Bandwidth probe against a Cloudflare-style speed test endpoint.
//!
//! Latency is the best of a few empty downloads, download throughput is a
//! timed streamed `GET /__down`, upload is a timed `POST /__up`, and client
//! metadata comes from `GET /meta`.

use serde::Deserialize;
use std::future::Future;
use std::time::{Duration, Instant};

use crate::config::ProbeConfig;
use crate::error::MeasurementError;

/// Raw figures from one speed test, before any rounding.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub download_bps: f64,
    pub upload_bps: f64,
    pub latency_ms: f64,
    pub client: ClientInfo,
}

/// What the measurement service knows about us. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientInfo {
    pub isp: Option<String>,
    pub country: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

pub trait SpeedProbe: Send + Sync {
    fn run(&self) -> impl Future<Output = Result<ProbeReport, MeasurementError>> + Send;
}

pub struct CloudflareProbe {
    client: reqwest::Client,
    config: ProbeConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Meta {
    as_organization: Option<String>,
    country: Option<String>,
    // Served as strings by Cloudflare, as numbers by some mirrors.
    latitude: Option<serde_json::Value>,
    longitude: Option<serde_json::Value>,
}

impl ClientInfo {
    #[cfg(test)]
    pub fn from_meta_json(body: &str) -> Result<Self, serde_json::Error> {
        let meta: Meta = serde_json::from_str(body)?;
        Ok(meta.into())
    }
}

impl From<Meta> for ClientInfo {
    fn from(meta: Meta) -> Self {
        ClientInfo {
            isp: meta.as_organization.filter(|s| !s.trim().is_empty()),
            country: meta.country.filter(|s| !s.trim().is_empty()),
            latitude: meta.latitude.as_ref().and_then(coordinate),
            longitude: meta.longitude.as_ref().and_then(coordinate),
        }
    }
}

fn coordinate(value: &serde_json::Value) -> Option<f64> {
    let parsed = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

fn bits_per_second(bytes: u64, elapsed: Duration) -> Result<f64, MeasurementError> {
    let secs = elapsed.as_secs_f64();
    if bytes == 0 || secs <= 0.0 {
        return Err(MeasurementError::Service(format!(
            "transferred {} bytes in {:.3}s",
            bytes, secs
        )));
    }
    Ok(bytes as f64 * 8.0 / secs)
}

impl CloudflareProbe {
    pub fn new(config: &ProbeConfig) -> Result<Self, MeasurementError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("speedlog/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(CloudflareProbe {
            client,
            config: config.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn latency_ms(&self) -> Result<f64, MeasurementError> {
        let url = self.url("/__down?bytes=0");
        let mut best = f64::INFINITY;

        for _ in 0..self.config.latency_samples {
            let start = Instant::now();
            let resp = self.client.get(&url).send().await?.error_for_status()?;
            let _ = resp.bytes().await?;
            best = best.min(start.elapsed().as_secs_f64() * 1000.0);
        }

        Ok(best)
    }

    async fn download_bps(&self) -> Result<f64, MeasurementError> {
        let url = self.url(&format!("/__down?bytes={}", self.config.download_bytes));
        let start = Instant::now();
        let mut resp = self.client.get(&url).send().await?.error_for_status()?;

        let mut total: u64 = 0;
        while let Some(chunk) = resp.chunk().await? {
            total += chunk.len() as u64;
        }

        bits_per_second(total, start.elapsed())
    }

    async fn upload_bps(&self) -> Result<f64, MeasurementError> {
        let url = self.url("/__up");
        let body = vec![0u8; self.config.upload_bytes as usize];
        let len = body.len() as u64;

        let start = Instant::now();
        self.client
            .post(&url)
            .body(body)
            .send()
            .await?
            .error_for_status()?;

        bits_per_second(len, start.elapsed())
    }

    // Metadata is a nice-to-have; a failure here must not sink the measurement.
    async fn client_info(&self) -> ClientInfo {
        let fetch = async {
            let resp = self.client.get(self.url("/meta")).send().await?.error_for_status()?;
            resp.json::<Meta>().await
        };

        match fetch.await {
            Ok(meta) => meta.into(),
            Err(e) => {
                tracing::warn!("Could not fetch client metadata: {}", e);
                ClientInfo::default()
            }
        }
    }
}

impl SpeedProbe for CloudflareProbe {
    async fn run(&self) -> Result<ProbeReport, MeasurementError> {
        let latency_ms = self.latency_ms().await?;
        tracing::debug!("Latency {:.1} ms", latency_ms);

        let download_bps = self.download_bps().await?;
        tracing::debug!("Download {:.0} bit/s", download_bps);

        let upload_bps = self.upload_bps().await?;
        tracing::debug!("Upload {:.0} bit/s", upload_bps);

        let client = self.client_info().await;

        Ok(ProbeReport {
            download_bps,
            upload_bps,
            latency_ms,
            client,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_with_string_coordinates() {
        let info = ClientInfo::from_meta_json(
            r#"{"clientIp":"203.0.113.7","asOrganization":"Example Net","country":"NL",
                "latitude":"52.37403","longitude":"4.88969","colo":"AMS"}"#,
        )
        .unwrap();
        assert_eq!(info.isp.as_deref(), Some("Example Net"));
        assert_eq!(info.country.as_deref(), Some("NL"));
        assert_eq!(info.latitude, Some(52.37403));
        assert_eq!(info.longitude, Some(4.88969));
    }

    #[test]
    fn meta_with_missing_and_odd_fields() {
        let info = ClientInfo::from_meta_json(
            r#"{"asOrganization":"  ","latitude":12.5,"longitude":"n/a"}"#,
        )
        .unwrap();
        assert_eq!(info.isp, None);
        assert_eq!(info.country, None);
        assert_eq!(info.latitude, Some(12.5));
        assert_eq!(info.longitude, None);
    }

    #[test]
    fn throughput_needs_elapsed_time_and_bytes() {
        let bps = bits_per_second(1_000_000, Duration::from_secs(2)).unwrap();
        assert_eq!(bps, 4_000_000.0);
        assert!(bits_per_second(0, Duration::from_secs(1)).is_err());
        assert!(bits_per_second(10, Duration::ZERO).is_err());
    }

    #[test]
    fn urls_join_cleanly() {
        let config = ProbeConfig {
            base_url: "https://speed.example.net/".to_string(),
            ..ProbeConfig::default()
        };
        let probe = CloudflareProbe::new(&config).unwrap();
        assert_eq!(probe.url("/meta"), "https://speed.example.net/meta");
    }
}
