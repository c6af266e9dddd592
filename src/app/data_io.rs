use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::types::{CheckResult, CheckingState};

const CSV_HEADERS: [&str; 3] = ["title", "url", "status"];

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DataFormat {
    Csv,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportRecord {
    pub title: String,
    pub url: String,
    pub status: String,
}

impl From<&CheckResult> for ExportRecord {
    fn from(result: &CheckResult) -> Self {
        Self {
            title: result.title.clone(),
            url: result.url.clone(),
            status: result.status_label().to_string(),
        }
    }
}

/// Rows of a results report: only the unavailable links unless `all`.
pub fn report_records(state: &CheckingState, all: bool) -> Vec<ExportRecord> {
    state
        .results
        .iter()
        .filter(|result| all || result.is_invalid())
        .map(ExportRecord::from)
        .collect()
}

struct CsvSink<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> CsvSink<W> {
    fn new(out: W) -> io::Result<Self> {
        let mut writer = csv::Writer::from_writer(out);
        writer.write_record(CSV_HEADERS)?;
        Ok(Self { writer })
    }

    fn write_record(&mut self, rec: &ExportRecord) -> io::Result<()> {
        self.writer
            .write_record([rec.title.as_str(), rec.url.as_str(), rec.status.as_str()])?;
        Ok(())
    }

    fn finalize(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

struct JsonSink<W: Write> {
    out: W,
    first: bool,
    closed: bool,
}

impl<W: Write> JsonSink<W> {
    fn new(mut out: W) -> io::Result<Self> {
        out.write_all(b"[\n")?;
        Ok(Self {
            out,
            first: true,
            closed: false,
        })
    }

    fn write_record(&mut self, rec: &ExportRecord) -> io::Result<()> {
        if !self.first {
            self.out.write_all(b",\n")?;
        }
        self.first = false;
        serde_json::to_writer(&mut self.out, rec).map_err(io::Error::other)?;
        Ok(())
    }

    fn finalize(&mut self) -> io::Result<()> {
        if !self.closed {
            if self.first {
                self.out.write_all(b"]\n")?;
            } else {
                self.out.write_all(b"\n]\n")?;
            }
            self.closed = true;
        }
        self.out.flush()
    }
}

enum OutputSink<W: Write> {
    Csv(CsvSink<W>),
    Json(JsonSink<W>),
}

impl<W: Write> OutputSink<W> {
    fn new(out: W, format: DataFormat) -> io::Result<Self> {
        match format {
            DataFormat::Csv => Ok(OutputSink::Csv(CsvSink::new(out)?)),
            DataFormat::Json => Ok(OutputSink::Json(JsonSink::new(out)?)),
        }
    }

    fn write_record(&mut self, rec: &ExportRecord) -> io::Result<()> {
        match self {
            OutputSink::Csv(sink) => sink.write_record(rec),
            OutputSink::Json(sink) => sink.write_record(rec),
        }
    }

    fn finalize(&mut self) -> io::Result<()> {
        match self {
            OutputSink::Csv(sink) => sink.finalize(),
            OutputSink::Json(sink) => sink.finalize(),
        }
    }
}

pub fn write_report<W: Write>(out: W, format: DataFormat, records: &[ExportRecord]) -> io::Result<()> {
    let mut sink = OutputSink::new(out, format)?;
    for rec in records {
        sink.write_record(rec)?;
    }
    sink.finalize()
}

pub fn write_report_file(path: &Path, format: DataFormat, records: &[ExportRecord]) -> io::Result<()> {
    write_report(File::create(path)?, format, records)
}

pub fn detect_data_format(path: &str, fallback: DataFormat) -> DataFormat {
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".json") {
        DataFormat::Json
    } else if lower.ends_with(".csv") {
        DataFormat::Csv
    } else {
        fallback
    }
}

pub fn default_output_path(format: DataFormat) -> String {
    let ts = Utc::now().format("%Y%m%d_%H%M%S");
    match format {
        DataFormat::Csv => format!("deadmark_{ts}.csv"),
        DataFormat::Json => format!("deadmark_{ts}.json"),
    }
}
