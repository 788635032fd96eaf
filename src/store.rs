use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::StoreError;
use crate::sample::{Sample, SpeedRow};

/// Append-only sample log on disk.
///
/// Appends and whole-file reads go through one lock, so concurrent measurements
/// never interleave their lines and a reader never sees a half-written record.
#[derive(Debug)]
pub struct SampleStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl SampleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SampleStore {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one newline-terminated record, creating the file on first write.
    pub fn append(&self, sample: &Sample) -> Result<(), StoreError> {
        let mut line = sample.to_record();
        line.push('\n');

        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_error(e))?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| self.io_error(e))?;

        tracing::debug!("Appended sample to {}", self.path.display());
        Ok(())
    }

    /// Every full record, in log order.
    pub fn load(&self) -> Result<Vec<Sample>, StoreError> {
        self.read_lines(Sample::parse_record)
    }

    /// Every record that parses, plus the errors for the lines that don't.
    /// Only a failure to read the file at all is an `Err`.
    pub fn load_lossy(&self) -> Result<(Vec<Sample>, Vec<StoreError>), StoreError> {
        let mut samples = Vec::new();
        let mut skipped = Vec::new();
        for parsed in self.read_lines(|line, no| Ok(Sample::parse_record(line, no)))? {
            match parsed {
                Ok(sample) => samples.push(sample),
                Err(e) => {
                    tracing::warn!("Skipping record in {}: {}", self.path.display(), e);
                    skipped.push(e);
                }
            }
        }
        Ok((samples, skipped))
    }

    /// The date/time/speed columns of every record, in log order.
    pub fn load_rows(&self) -> Result<Vec<SpeedRow>, StoreError> {
        self.read_lines(SpeedRow::parse)
    }

    fn read_lines<T>(
        &self,
        parse: impl Fn(&str, usize) -> Result<T, StoreError>,
    ) -> Result<Vec<T>, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound(self.path.clone()))
            }
            Err(e) => return Err(self.io_error(e)),
        };

        let mut out = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| self.io_error(e))?;
            if line.trim().is_empty() {
                continue;
            }
            out.push(parse(&line, idx + 1)?);
        }
        Ok(out)
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::tests::sample;
    use std::sync::Arc;

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = SampleStore::new(dir.path().join("internet_data.txt"));
        assert!(matches!(store.load(), Err(StoreError::NotFound(_))));
        assert!(matches!(store.load_rows(), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn records_round_trip_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = SampleStore::new(dir.path().join("internet_data.txt"));
        let written: Vec<Sample> = (0..5)
            .map(|i| sample(&format!("0{}:15:00", i), 10.0 + i as f64, 2.5 * i as f64))
            .collect();
        for s in &written {
            store.append(s).unwrap();
        }

        assert_eq!(store.load().unwrap(), written);
        let rows = store.load_rows().unwrap();
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[4].download_mbps, 14.0);
    }

    #[test]
    fn each_append_is_one_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("internet_data.txt");
        let store = SampleStore::new(&path);
        store.append(&sample("12:00:00", 1.0, 1.0)).unwrap();
        store.append(&sample("12:05:00", 2.0, 2.0)).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.ends_with('\n'));
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn concurrent_appends_do_not_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SampleStore::new(dir.path().join("internet_data.txt")));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let mut s = sample("18:00:00", t as f64, i as f64);
                        s.isp = format!("isp-{}-{}", t, i);
                        store.append(&s).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 200);
    }

    #[test]
    fn short_row_is_reported_with_line_number() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("internet_data.txt");
        std::fs::write(&path, "2025-01-01,10:00:00,5.0,1.0\n2025-01-01,11:00:00,5.0\n").unwrap();

        let store = SampleStore::new(&path);
        assert!(matches!(
            store.load_rows(),
            Err(StoreError::InsufficientColumns { line: 2, found: 3 })
        ));
        assert!(matches!(store.load(), Err(StoreError::Malformed { line: 1, .. })));
    }

    #[test]
    fn lossy_load_skips_bad_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("internet_data.txt");
        let good = sample("09:00:00", 20.0, 4.0);
        std::fs::write(
            &path,
            format!(
                "2025-03-14,08:00:00,10.0,2.0,11,Comcast, LLC,United States,39.0,-77.5\n\
                 2025-03-14,08:30:00,oops,2.0,11,ISP,DE,1.0,2.0\n\
                 {}\n",
                good.to_record()
            ),
        )
        .unwrap();

        let store = SampleStore::new(&path);
        assert!(store.load().is_err());
        let (samples, skipped) = store.load_lossy().unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].isp, "Comcast; LLC");
        assert_eq!(samples[1], good);
        assert_eq!(skipped.len(), 1);
        assert!(matches!(skipped[0], StoreError::Malformed { line: 2, .. }));

        let missing = SampleStore::new(dir.path().join("absent.txt"));
        assert!(matches!(missing.load_lossy(), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn append_into_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = SampleStore::new(dir.path().join("nope").join("internet_data.txt"));
        let err = store.append(&sample("01:00:00", 1.0, 1.0)).unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
    }
}
