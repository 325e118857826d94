//! Report Output
//!
//! The coordinator renders the report through a [`ReportSink`]: one summary,
//! then one line per thread in rank order and thread order, then `finish`.
//!
//! | Sink | Output |
//! |------|--------|
//! | [`HumanSink`] | Summary, legend and fixed-width lines, written as they arrive |
//! | [`JsonSink`] | One JSON document with metadata, written on `finish` |
//! | [`CollectSink`] | Kept in memory |

use chrono::{DateTime, Utc};
use rankmap_core::{CoreId, HostName, Rank};
use serde::Serialize;
use std::io::Write;
use thiserror::Error;

/// Errors raised while writing the report
#[derive(Debug, Error)]
pub enum ReportError {
    /// Writing to the output failed
    #[error("Failed to write report")]
    Io(#[from] std::io::Error),

    /// Serializing the JSON document failed
    #[error("Failed to serialize report")]
    Json(#[from] serde_json::Error),
}

/// Job-wide totals printed before any thread line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Summary {
    /// Threads over all ranks
    pub total_threads: usize,
    /// Number of ranks
    pub process_count: usize,
    /// Largest team on any rank
    pub max_threads: usize,
}

/// Placement of one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportLine {
    /// Rank the thread belongs to
    pub rank: Rank,
    /// Index of the thread in its team
    pub thread: usize,
    /// Number of ranks
    pub process_count: usize,
    /// Size of the thread's team
    pub thread_count: usize,
    /// Core the thread ran on
    pub core: CoreId,
    /// Host the rank ran on
    pub host: HostName,
}

/// Destination for a rendered report.
pub trait ReportSink {
    /// Called once, before any line.
    fn summary(&mut self, summary: &Summary) -> Result<(), ReportError>;

    /// Called once per thread, in report order.
    fn line(&mut self, line: &ReportLine) -> Result<(), ReportError>;

    /// Called once after the last line.
    fn finish(&mut self) -> Result<(), ReportError>;
}

impl<S: ReportSink + ?Sized> ReportSink for Box<S> {
    fn summary(&mut self, summary: &Summary) -> Result<(), ReportError> {
        (**self).summary(summary)
    }

    fn line(&mut self, line: &ReportLine) -> Result<(), ReportError> {
        (**self).line(line)
    }

    fn finish(&mut self) -> Result<(), ReportError> {
        (**self).finish()
    }
}

/// Output format selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable terminal output
    #[default]
    Human,
    /// JSON document with metadata
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "human" | "text" => Ok(OutputFormat::Human),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!("Unknown output format: {}", other)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            OutputFormat::Human => "human",
            OutputFormat::Json => "json",
        })
    }
}

/// Format the summary sentence.
pub fn format_summary(summary: &Summary) -> String {
    format!(
        "Running a total of {} threads in {} ranks (maximum {} threads per rank).",
        summary.total_threads, summary.process_count, summary.max_threads
    )
}

/// Legend printed between the summary and the first line.
pub const LEGEND: &str =
    "++ Output format:   (rank,thread) of (#ranks,#threads in rank) on cpu <cpu> of <host>";

/// Format one thread line.
pub fn format_line(line: &ReportLine) -> String {
    format!(
        "++ rank/thread num ({:>7}, {:>5}) of ({:>9}, {:>15}) on cpu {:>5} of {}",
        line.rank, line.thread, line.process_count, line.thread_count, line.core, line.host
    )
}

/// Plain-text report, streamed line by line.
pub struct HumanSink<W: Write> {
    out: W,
}

impl<W: Write> HumanSink<W> {
    /// Write to `out`.
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// Recover the writer.
    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> ReportSink for HumanSink<W> {
    fn summary(&mut self, summary: &Summary) -> Result<(), ReportError> {
        writeln!(self.out, "{}", format_summary(summary))?;
        writeln!(self.out, "{}", LEGEND)?;
        Ok(())
    }

    fn line(&mut self, line: &ReportLine) -> Result<(), ReportError> {
        writeln!(self.out, "{}", format_line(line))?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), ReportError> {
        self.out.flush()?;
        Ok(())
    }
}

/// Report metadata
#[derive(Debug, Clone, Serialize)]
pub struct ReportMeta {
    /// rankmap version
    pub version: String,
    /// UTC time the report was written
    pub generated_at: DateTime<Utc>,
    /// How ranks were isolated ("process" or "thread")
    pub isolation: String,
}

impl ReportMeta {
    /// Metadata stamped now.
    pub fn new(isolation: impl Into<String>) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            generated_at: Utc::now(),
            isolation: isolation.into(),
        }
    }
}

#[derive(Serialize)]
struct JsonLine {
    rank: Rank,
    thread: usize,
    process_count: usize,
    thread_count: usize,
    /// `None` when the core could not be determined
    core: Option<i32>,
    host: String,
}

impl From<&ReportLine> for JsonLine {
    fn from(line: &ReportLine) -> Self {
        Self {
            rank: line.rank,
            thread: line.thread,
            process_count: line.process_count,
            thread_count: line.thread_count,
            core: line.core.is_known().then_some(line.core.0),
            host: line.host.as_str().to_string(),
        }
    }
}

#[derive(Serialize)]
struct JsonReport<'a> {
    meta: &'a ReportMeta,
    summary: Option<&'a Summary>,
    lines: &'a [JsonLine],
}

/// JSON report, buffered and written as one document on `finish`.
pub struct JsonSink<W: Write> {
    out: W,
    meta: ReportMeta,
    summary: Option<Summary>,
    lines: Vec<JsonLine>,
}

impl<W: Write> JsonSink<W> {
    /// Write to `out`, stamping the document with `meta`.
    pub fn new(out: W, meta: ReportMeta) -> Self {
        Self {
            out,
            meta,
            summary: None,
            lines: Vec::new(),
        }
    }

    /// Recover the writer.
    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> ReportSink for JsonSink<W> {
    fn summary(&mut self, summary: &Summary) -> Result<(), ReportError> {
        self.summary = Some(*summary);
        Ok(())
    }

    fn line(&mut self, line: &ReportLine) -> Result<(), ReportError> {
        self.lines.push(line.into());
        Ok(())
    }

    fn finish(&mut self) -> Result<(), ReportError> {
        let report = JsonReport {
            meta: &self.meta,
            summary: self.summary.as_ref(),
            lines: &self.lines,
        };
        serde_json::to_writer_pretty(&mut self.out, &report)?;
        writeln!(self.out)?;
        self.out.flush()?;
        Ok(())
    }
}

/// Keeps the report in memory.
#[derive(Debug, Default)]
pub struct CollectSink {
    /// Summary, once received
    pub summary: Option<Summary>,
    /// Lines in the order received
    pub lines: Vec<ReportLine>,
    /// Whether `finish` was called
    pub finished: bool,
}

impl CollectSink {
    /// Empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// `(rank, thread)` of every line, in order.
    pub fn order(&self) -> Vec<(Rank, usize)> {
        self.lines.iter().map(|l| (l.rank, l.thread)).collect()
    }
}

impl ReportSink for CollectSink {
    fn summary(&mut self, summary: &Summary) -> Result<(), ReportError> {
        self.summary = Some(*summary);
        Ok(())
    }

    fn line(&mut self, line: &ReportLine) -> Result<(), ReportError> {
        self.lines.push(*line);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), ReportError> {
        self.finished = true;
        Ok(())
    }
}

/// Discards everything. Non-coordinator ranks render nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ReportSink for NullSink {
    fn summary(&mut self, _summary: &Summary) -> Result<(), ReportError> {
        Ok(())
    }

    fn line(&mut self, _line: &ReportLine) -> Result<(), ReportError> {
        Ok(())
    }

    fn finish(&mut self) -> Result<(), ReportError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(rank: Rank, thread: usize, core: CoreId) -> ReportLine {
        ReportLine {
            rank,
            thread,
            process_count: 3,
            thread_count: 2,
            core,
            host: HostName::new("node01"),
        }
    }

    const SUMMARY: Summary = Summary {
        total_threads: 6,
        process_count: 3,
        max_threads: 3,
    };

    #[test]
    fn test_format_summary() {
        assert_eq!(
            format_summary(&SUMMARY),
            "Running a total of 6 threads in 3 ranks (maximum 3 threads per rank)."
        );
    }

    #[test]
    fn test_format_line() {
        assert_eq!(
            format_line(&line(1, 0, CoreId(12))),
            "++ rank/thread num (      1,     0) of (        3,               2) on cpu    12 of node01"
        );
    }

    #[test]
    fn test_format_line_unknown_core() {
        assert!(format_line(&line(0, 1, CoreId::UNKNOWN)).contains("on cpu     ? of node01"));
    }

    #[test]
    fn test_human_sink() {
        let mut sink = HumanSink::new(Vec::new());
        sink.summary(&SUMMARY).unwrap();
        sink.line(&line(0, 0, CoreId(0))).unwrap();
        sink.line(&line(0, 1, CoreId(1))).unwrap();
        sink.finish().unwrap();

        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], format_summary(&SUMMARY));
        assert_eq!(lines[1], LEGEND);
        assert!(lines[3].ends_with("on cpu     1 of node01"));
    }

    #[test]
    fn test_json_sink() {
        let mut sink = JsonSink::new(Vec::new(), ReportMeta::new("thread"));
        sink.summary(&SUMMARY).unwrap();
        sink.line(&line(0, 0, CoreId(4))).unwrap();
        sink.line(&line(0, 1, CoreId::UNKNOWN)).unwrap();
        sink.finish().unwrap();

        let doc: serde_json::Value = serde_json::from_slice(&sink.into_inner()).unwrap();
        assert_eq!(doc["meta"]["isolation"], "thread");
        assert_eq!(doc["summary"]["total_threads"], 6);
        assert_eq!(doc["lines"][0]["core"], 4);
        assert!(doc["lines"][1]["core"].is_null());
        assert_eq!(doc["lines"][1]["host"], "node01");
    }

    #[test]
    fn test_output_format_parse() {
        assert_eq!("JSON".parse::<OutputFormat>(), Ok(OutputFormat::Json));
        assert_eq!("text".parse::<OutputFormat>(), Ok(OutputFormat::Human));
        assert!("csv".parse::<OutputFormat>().is_err());
    }
}
