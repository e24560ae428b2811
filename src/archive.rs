//! Hourly CSV copies of samples for devices configured with `log_locally`.

use crate::sample::{FieldValue, Sample};
use anyhow::{Context, Result};
use chrono::{SecondsFormat, Timelike};
use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;

pub struct CsvArchive {
    dir: PathBuf,
    box_id: String,
    current: Option<(String, csv::Writer<File>)>,
}

impl CsvArchive {
    pub fn new(archive_dir: &std::path::Path, box_id: &str, device_id: &str) -> Self {
        Self {
            dir: archive_dir.join(device_id),
            box_id: box_id.to_string(),
            current: None,
        }
    }

    /// Appends `box,id,timestamp,values...` to `<dir>/<YYYY-MM-DDTHH:00:00>.csv`.
    pub fn append(&mut self, sample: &Sample) -> Result<()> {
        let hour = sample
            .timestamp()
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or_else(|| sample.timestamp());
        let name = format!("{}.csv", hour.format("%Y-%m-%dT%H:%M:%S"));

        let stale = self.current.as_ref().map_or(true, |(current, _)| *current != name);
        if stale {
            fs::create_dir_all(&self.dir)
                .with_context(|| format!("failed to create {}", self.dir.display()))?;
            let path = self.dir.join(&name);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("open {}", path.display()))?;
            let writer = csv::WriterBuilder::new()
                .has_headers(false)
                .flexible(true)
                .terminator(csv::Terminator::Any(b'\n'))
                .from_writer(file);
            self.current = Some((name, writer));
        }
        let Some((_, writer)) = self.current.as_mut() else {
            return Ok(());
        };

        let mut row = vec![
            self.box_id.clone(),
            sample.device_id().to_string(),
            sample.timestamp().to_rfc3339_opts(SecondsFormat::Micros, true),
        ];
        for (_, value) in sample.fields() {
            row.push(match value {
                FieldValue::Float(v) => v.to_string(),
                FieldValue::Text(text) => text.clone(),
            });
        }
        writer.write_record(&row).context("append archive row")?;
        writer.flush().context("flush archive row")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    #[test]
    fn writes_hourly_csv_rows() {
        let dir = TempDir::new().unwrap();
        let mut archive = CsvArchive::new(dir.path(), "box7", "wind");
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 34, 56).single().unwrap();

        archive
            .append(&Sample::new("wind", at).with_float("speed", 3.5).with_text("note", "a,b"))
            .unwrap();
        archive
            .append(&Sample::new("wind", at).with_float("speed", 4.0).with_text("note", "ok"))
            .unwrap();

        let path = dir.path().join("wind").join("2024-03-01T12:00:00.csv");
        let contents = std::fs::read_to_string(path).unwrap();
        assert_eq!(
            contents,
            "box7,wind,2024-03-01T12:34:56.000000Z,3.5,\"a,b\"\nbox7,wind,2024-03-01T12:34:56.000000Z,4,ok\n"
        );
    }

    #[test]
    fn text_with_quotes_and_line_breaks_reads_back_intact() {
        let dir = TempDir::new().unwrap();
        let mut archive = CsvArchive::new(dir.path(), "box7", "baro");
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 1).single().unwrap();
        archive
            .append(&Sample::new("baro", at).with_text("note", "say \"hi\"\nbye"))
            .unwrap();

        let path = dir.path().join("baro").join("2024-03-01T12:00:00.csv");
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(path)
            .unwrap();
        let rows: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(&rows[0][3], "say \"hi\"\nbye");
    }
}
