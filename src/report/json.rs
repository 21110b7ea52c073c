//! Durable JSON report storage.
//!
//! Each run writes one file named `{prefix}-{YYYYMMDD-HHMMSS}-{run8}.json`,
//! where the timestamp is the run's UTC start time and `run8` the first
//! eight characters of the run id. Existing files are never overwritten.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use super::ReportError;
use crate::aggregate::Report;

/// Builds the report filename for a run.
pub fn report_filename(prefix: &str, started_at: DateTime<Utc>, run_id: &str) -> String {
    let short: String = run_id.chars().filter(|c| *c != '-').take(8).collect();
    format!("{}-{}-{}.json", prefix, started_at.format("%Y%m%d-%H%M%S"), short)
}

/// Writes `report` as pretty JSON under `dir` and returns the file path.
pub fn write_report(report: &Report, dir: &Path, prefix: &str) -> Result<PathBuf, ReportError> {
    std::fs::create_dir_all(dir).map_err(|source| ReportError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let body = serde_json::to_vec_pretty(report)?;
    let filename = report_filename(prefix, report.summary.started_at, &report.run_id);
    let stem = filename.trim_end_matches(".json");

    let mut attempt = 0;
    loop {
        let path = if attempt == 0 {
            dir.join(&filename)
        } else {
            dir.join(format!("{stem}-{attempt}.json"))
        };

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                file.write_all(&body)
                    .map_err(|source| ReportError::Write {
                        path: path.clone(),
                        source,
                    })?;
                return Ok(path);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => attempt += 1,
            Err(source) => return Err(ReportError::Write { path, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_report_filename() {
        let started = Utc.with_ymd_and_hms(2024, 5, 1, 9, 3, 7).unwrap();
        assert_eq!(
            report_filename("e2e-report", started, "5f0c2a1e-9b7d-4c1a-8e3f-000000000000"),
            "e2e-report-20240501-090307-5f0c2a1e.json"
        );
    }

    #[test]
    fn test_existing_report_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let report = Report::new("run", Vec::new(), Utc::now(), Duration::ZERO);

        let first = write_report(&report, dir.path(), "r").unwrap();
        let second = write_report(&report, dir.path(), "r").unwrap();

        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with("-1.json"));
        assert!(first.exists() && second.exists());
    }
}
