//! One recorded speed test and its line format in the sample log.
//!
//! A record is nine comma-separated fields with no header and no quoting:
//! `date,time,download_mbps,upload_mbps,ping_ms,isp,country,lat,lon`.

use chrono::{NaiveDate, NaiveTime, Timelike};
use serde::Serialize;
use std::fmt;

use crate::error::StoreError;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M:%S";
pub const FIELD_COUNT: usize = 9;

/// Values the probe could not report fall back to these.
pub const UNKNOWN: &str = "Unknown";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub ping_ms: u32,
    pub isp: String,
    pub country: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// The leading date/time/download/upload columns of a record. This is all the
/// aggregator and the chart need, so they accept records whose trailing
/// metadata is damaged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpeedRow {
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub download_mbps: f64,
    pub upload_mbps: f64,
}

impl Sample {
    /// Encode as one log line, without the trailing newline.
    pub fn to_record(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{}",
            self.date.format(DATE_FORMAT),
            self.time.format(TIME_FORMAT),
            self.download_mbps,
            self.upload_mbps,
            self.ping_ms,
            sanitize_field(&self.isp),
            sanitize_field(&self.country),
            self.latitude,
            self.longitude,
        )
    }

    /// Decode a full nine-field record. `line_no` is 1-based and only used for errors.
    ///
    /// Older logs were written without sanitising, so an ISP name such as
    /// `Comcast, LLC` spills into extra fields. The trailing country and
    /// coordinates are anchored from the end and the surplus is folded back
    /// into the ISP, joined the way [`to_record`](Self::to_record) would write it.
    pub fn parse_record(line: &str, line_no: usize) -> Result<Self, StoreError> {
        let fields: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
        if fields.len() < FIELD_COUNT {
            return Err(StoreError::Malformed {
                line: line_no,
                reason: format!("expected {} fields, found {}", FIELD_COUNT, fields.len()),
            });
        }
        let extra = fields.len() - FIELD_COUNT;
        let isp = fields[5..=5 + extra].join("; ");
        let (country, lat, lon) = (fields[6 + extra], fields[7 + extra], fields[8 + extra]);

        let row = SpeedRow::from_fields(&fields, line_no)?;
        let ping_ms = fields[4]
            .parse::<u32>()
            .map_err(|e| malformed(line_no, "ping", fields[4], e))?;
        let latitude = lat
            .parse::<f64>()
            .map_err(|e| malformed(line_no, "latitude", lat, e))?;
        let longitude = lon
            .parse::<f64>()
            .map_err(|e| malformed(line_no, "longitude", lon, e))?;

        Ok(Sample {
            date: row.date,
            time: row.time,
            download_mbps: row.download_mbps,
            upload_mbps: row.upload_mbps,
            ping_ms,
            isp,
            country: country.to_string(),
            latitude,
            longitude,
        })
    }

    #[cfg(test)]
    pub fn speed_row(&self) -> SpeedRow {
        SpeedRow {
            date: self.date,
            time: self.time,
            download_mbps: self.download_mbps,
            upload_mbps: self.upload_mbps,
        }
    }
}

impl SpeedRow {
    pub fn parse(line: &str, line_no: usize) -> Result<Self, StoreError> {
        let fields: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
        if fields.len() < 4 {
            return Err(StoreError::InsufficientColumns {
                line: line_no,
                found: fields.len(),
            });
        }
        Self::from_fields(&fields, line_no)
    }

    fn from_fields(fields: &[&str], line_no: usize) -> Result<Self, StoreError> {
        let date = NaiveDate::parse_from_str(fields[0], DATE_FORMAT)
            .map_err(|e| malformed(line_no, "date", fields[0], e))?;
        let time = NaiveTime::parse_from_str(fields[1], TIME_FORMAT)
            .map_err(|e| malformed(line_no, "time", fields[1], e))?;
        let download_mbps = fields[2]
            .parse::<f64>()
            .map_err(|e| malformed(line_no, "download", fields[2], e))?;
        let upload_mbps = fields[3]
            .parse::<f64>()
            .map_err(|e| malformed(line_no, "upload", fields[3], e))?;

        Ok(SpeedRow {
            date,
            time,
            download_mbps,
            upload_mbps,
        })
    }

    pub fn hour_of_day(&self) -> f64 {
        fractional_hour(self.time)
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Date: {}", self.date.format(DATE_FORMAT))?;
        writeln!(f, "Time: {}", self.time.format(TIME_FORMAT))?;
        writeln!(f, "Download: {} Mbps", self.download_mbps)?;
        writeln!(f, "Upload: {} Mbps", self.upload_mbps)?;
        writeln!(f, "Ping: {} ms", self.ping_ms)?;
        writeln!(f, "ISP: {}", self.isp)?;
        writeln!(f, "Country: {}", self.country)?;
        writeln!(f, "Latitude: {}", self.latitude)?;
        write!(f, "Longitude: {}", self.longitude)
    }
}

/// Hours since midnight, e.g. 13:30:00 -> 13.5.
pub fn fractional_hour(time: NaiveTime) -> f64 {
    time.hour() as f64 + time.minute() as f64 / 60.0 + time.second() as f64 / 3600.0
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

// The log has no quoting, so a comma in free text would shift every later field.
fn sanitize_field(value: &str) -> String {
    value.replace([',', '\n', '\r'], ";")
}

fn malformed(line: usize, field: &str, raw: &str, err: impl fmt::Display) -> StoreError {
    StoreError::Malformed {
        line,
        reason: format!("invalid {} '{}': {}", field, raw, err),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample(time: &str, download: f64, upload: f64) -> Sample {
        Sample {
            date: NaiveDate::from_ymd_opt(2025, 3, 14).unwrap(),
            time: NaiveTime::parse_from_str(time, TIME_FORMAT).unwrap(),
            download_mbps: download,
            upload_mbps: upload,
            ping_ms: 12,
            isp: "Example ISP".to_string(),
            country: "Germany".to_string(),
            latitude: 52.52,
            longitude: 13.405,
        }
    }

    #[test]
    fn record_has_nine_fields_in_order() {
        let s = sample("08:05:09", 93.512, 20.25);
        assert_eq!(
            s.to_record(),
            "2025-03-14,08:05:09,93.512,20.25,12,Example ISP,Germany,52.52,13.405"
        );
    }

    #[test]
    fn record_parses_back() {
        let s = sample("23:59:59", 1.001, 0.5);
        let parsed = Sample::parse_record(&s.to_record(), 1).unwrap();
        assert_eq!(parsed, s);
    }

    #[test]
    fn commas_in_text_fields_do_not_break_the_record() {
        let mut s = sample("10:00:00", 50.0, 10.0);
        s.isp = "Telekom, AG".to_string();
        let line = s.to_record();
        assert_eq!(line.split(',').count(), FIELD_COUNT);
        let parsed = Sample::parse_record(&line, 1).unwrap();
        assert_eq!(parsed.isp, "Telekom; AG");
    }

    #[test]
    fn wrong_field_count_is_malformed() {
        let err = Sample::parse_record("2025-03-14,10:00:00,1.0,2.0", 7).unwrap_err();
        assert!(matches!(err, StoreError::Malformed { line: 7, .. }));
    }

    #[test]
    fn unsanitised_isp_from_older_logs_is_recovered() {
        let line = "2025-03-14,10:00:00,50.0,10.0,9,Comcast, Cable, LLC,United States,39.0,-77.5";
        let parsed = Sample::parse_record(line, 4).unwrap();
        assert_eq!(parsed.isp, "Comcast; Cable; LLC");
        assert_eq!(parsed.country, "United States");
        assert_eq!(parsed.ping_ms, 9);
        assert_eq!(parsed.latitude, 39.0);
        assert_eq!(parsed.longitude, -77.5);
        assert_eq!(parsed.to_record().split(',').count(), FIELD_COUNT);
    }

    #[test]
    fn speed_row_needs_four_columns() {
        let err = SpeedRow::parse("2025-03-14,10:00:00,1.0", 3).unwrap_err();
        assert!(matches!(
            err,
            StoreError::InsufficientColumns { line: 3, found: 3 }
        ));
        let row = SpeedRow::parse("2025-03-14,10:00:00,1.0,2.0", 1).unwrap();
        assert_eq!(row.download_mbps, 1.0);
        assert_eq!(row.upload_mbps, 2.0);
    }

    #[test]
    fn half_past_one_is_thirteen_and_a_half() {
        let t = NaiveTime::parse_from_str("13:30:00", TIME_FORMAT).unwrap();
        assert_eq!(fractional_hour(t), 13.5);
        let t = NaiveTime::parse_from_str("00:00:36", TIME_FORMAT).unwrap();
        assert_eq!(fractional_hour(t), 0.01);
    }

    #[test]
    fn rounding() {
        assert_eq!(round_to(93.51249, 3), 93.512);
        assert_eq!(round_to(33.3333, 2), 33.33);
    }
}
