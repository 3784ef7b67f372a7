//! Results persistence
//!
//! The table grows one run at a time. Rows are channels in first-seen order;
//! each run contributes the column group `L`, `L_thumb`, `L_info`,
//! `L_info_retry`, `L_debug`. Time cells hold whole milliseconds, the
//! timeout/error markers, or nothing when the channel was not part of the run.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::constants::*;
use crate::types::{TuneOutcome, TuneResult};

const CHANNEL_HEADER: &str = "channel";
const COLUMNS_PER_RUN: usize = 5;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Results file {path} is corrupt: {reason}. Delete it or rerun with --reset to start a new results file.")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Run '{0}' already exists in the results table")]
    DuplicateRun(String),

    #[error("Run label must not be empty")]
    EmptyLabel,

    #[error("Results file I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write results file {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellOutcome {
    Tuned { elapsed_ms: u64 },
    TimedOut,
    Errored,
}

impl CellOutcome {
    pub fn elapsed_ms(&self) -> Option<u64> {
        match self {
            CellOutcome::Tuned { elapsed_ms } => Some(*elapsed_ms),
            _ => None,
        }
    }

    fn encode(&self) -> String {
        match self {
            CellOutcome::Tuned { elapsed_ms } => elapsed_ms.to_string(),
            CellOutcome::TimedOut => TIMEOUT_MARKER.to_string(),
            CellOutcome::Errored => ERROR_MARKER.to_string(),
        }
    }

    fn decode(value: &str) -> Option<Self> {
        match value {
            TIMEOUT_MARKER => Some(CellOutcome::TimedOut),
            ERROR_MARKER => Some(CellOutcome::Errored),
            ms => ms.parse().ok().map(|elapsed_ms| CellOutcome::Tuned { elapsed_ms }),
        }
    }
}

impl From<&TuneOutcome> for CellOutcome {
    fn from(outcome: &TuneOutcome) -> Self {
        match outcome {
            TuneOutcome::Tuned(elapsed) => CellOutcome::Tuned {
                elapsed_ms: elapsed.as_millis() as u64,
            },
            TuneOutcome::TimedOut => CellOutcome::TimedOut,
            TuneOutcome::StreamError(_) => CellOutcome::Errored,
        }
    }
}

/// One channel's values in one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub outcome: CellOutcome,
    pub thumbnail: Option<PathBuf>,
    pub info: Option<String>,
    pub info_retry: bool,
    pub debug: Option<String>,
}

impl Cell {
    pub fn new(outcome: CellOutcome) -> Self {
        Self {
            outcome,
            thumbnail: None,
            info: None,
            info_retry: false,
            debug: None,
        }
    }
}

impl From<&TuneResult> for Cell {
    fn from(result: &TuneResult) -> Self {
        let debug = (!result.notes.is_empty()).then(|| result.notes.join("\n"));
        Self {
            outcome: CellOutcome::from(&result.outcome),
            thumbnail: result.thumbnail.clone(),
            info: result.codec_info.as_ref().map(|i| i.to_string()),
            info_retry: result.codec_info.as_ref().is_some_and(|i| i.retried()),
            debug,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunColumn {
    pub label: String,
    cells: HashMap<String, Cell>,
}

impl RunColumn {
    pub fn cell(&self, channel: &str) -> Option<&Cell> {
        self.cells.get(channel)
    }

    pub fn cells(&self) -> impl Iterator<Item = (&String, &Cell)> {
        self.cells.iter()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultsTable {
    channels: Vec<String>,
    runs: Vec<RunColumn>,
}

impl ResultsTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub fn runs(&self) -> &[RunColumn] {
        &self.runs
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn run(&self, label: &str) -> Option<&RunColumn> {
        self.runs.iter().find(|r| r.label == label)
    }

    pub fn cell(&self, channel: &str, label: &str) -> Option<&Cell> {
        self.run(label)?.cell(channel)
    }

    /// `base`, or `base #2`, `base #3`, … when taken
    pub fn unique_label(&self, base: &str) -> String {
        if self.run(base).is_none() {
            return base.to_string();
        }
        (2..)
            .map(|n| format!("{base} #{n}"))
            .find(|candidate| self.run(candidate).is_none())
            .unwrap_or_else(|| base.to_string())
    }

    /// Adds one run column. Existing columns are untouched; new channels go to the end.
    pub fn append_run(&mut self, label: &str, results: &[TuneResult]) -> Result<(), StoreError> {
        if label.trim().is_empty() {
            return Err(StoreError::EmptyLabel);
        }
        if self.run(label).is_some() {
            return Err(StoreError::DuplicateRun(label.to_string()));
        }

        let mut cells = HashMap::new();
        for result in results {
            // Rows are keyed by name; the reader rejects nameless rows
            if result.channel_name.trim().is_empty() {
                warn!("Skipping a channel without a name in run '{}'", label.replace('\n', " "));
                continue;
            }
            if cells.contains_key(&result.channel_name) {
                debug!("Ignoring repeated channel '{}' in run '{label}'", result.channel_name);
                continue;
            }
            if !self.channels.contains(&result.channel_name) {
                self.channels.push(result.channel_name.clone());
            }
            cells.insert(result.channel_name.clone(), Cell::from(result));
        }
        self.runs.push(RunColumn {
            label: label.to_string(),
            cells,
        });
        Ok(())
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> csv::Result<()> {
        let mut csv = csv::Writer::from_writer(writer);

        let mut header = vec![CHANNEL_HEADER.to_string()];
        for run in &self.runs {
            header.extend(column_group(&run.label));
        }
        csv.write_record(&header)?;

        for channel in &self.channels {
            let mut record = vec![channel.clone()];
            for run in &self.runs {
                match run.cell(channel) {
                    Some(cell) => record.extend([
                        cell.outcome.encode(),
                        cell.thumbnail.as_ref().map(|p| p.display().to_string()).unwrap_or_default(),
                        cell.info.clone().unwrap_or_default(),
                        if cell.info_retry { "true".into() } else { String::new() },
                        cell.debug.clone().unwrap_or_default(),
                    ]),
                    None => record.extend(std::iter::repeat_n(String::new(), COLUMNS_PER_RUN)),
                }
            }
            csv.write_record(&record)?;
        }
        csv.flush()?;
        Ok(())
    }

    /// Parses a results file; the error string explains what is malformed.
    pub fn read_csv<R: Read>(reader: R) -> Result<Self, String> {
        let mut csv = csv::ReaderBuilder::new().has_headers(true).from_reader(reader);
        let header = csv.headers().map_err(|e| e.to_string())?.clone();

        if header.get(0) != Some(CHANNEL_HEADER) {
            return Err(format!("first column must be '{CHANNEL_HEADER}'"));
        }
        if (header.len() - 1) % COLUMNS_PER_RUN != 0 {
            return Err(format!("expected {COLUMNS_PER_RUN} columns per run, found {} data columns", header.len() - 1));
        }

        let mut runs = Vec::new();
        for group in 0..(header.len() - 1) / COLUMNS_PER_RUN {
            let first = 1 + group * COLUMNS_PER_RUN;
            let label = header.get(first).unwrap_or_default().to_string();
            if label.is_empty() {
                return Err(format!("column {first} has an empty run label"));
            }
            for (offset, expected) in column_group(&label).iter().enumerate() {
                if header.get(first + offset) != Some(expected.as_str()) {
                    return Err(format!("expected column '{expected}' for run '{label}'"));
                }
            }
            if runs.iter().any(|r: &RunColumn| r.label == label) {
                return Err(format!("run '{label}' appears twice"));
            }
            runs.push(RunColumn {
                label,
                cells: HashMap::new(),
            });
        }

        let mut channels = Vec::new();
        let mut seen = HashSet::new();
        for (line, record) in csv.records().enumerate() {
            let record = record.map_err(|e| e.to_string())?;
            let channel = record.get(0).unwrap_or_default().to_string();
            if channel.is_empty() {
                return Err(format!("row {} has no channel name", line + 1));
            }
            if !seen.insert(channel.clone()) {
                return Err(format!("channel '{channel}' appears twice"));
            }

            for (group, run) in runs.iter_mut().enumerate() {
                let field = |offset: usize| record.get(1 + group * COLUMNS_PER_RUN + offset).unwrap_or_default();
                let time = field(0);
                if time.is_empty() {
                    continue;
                }
                let outcome = CellOutcome::decode(time).ok_or_else(|| {
                    format!("invalid time '{time}' for channel '{channel}' in run '{}'", run.label)
                })?;
                let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
                run.cells.insert(
                    channel.clone(),
                    Cell {
                        outcome,
                        thumbnail: non_empty(field(1)).map(PathBuf::from),
                        info: non_empty(field(2)),
                        info_retry: field(3) == "true",
                        debug: non_empty(field(4)),
                    },
                );
            }
            channels.push(channel);
        }

        Ok(Self { channels, runs })
    }
}

fn column_group(label: &str) -> [String; COLUMNS_PER_RUN] {
    [
        label.to_string(),
        format!("{label}{THUMB_SUFFIX}"),
        format!("{label}{INFO_SUFFIX}"),
        format!("{label}{INFO_RETRY_SUFFIX}"),
        format!("{label}{DEBUG_SUFFIX}"),
    ]
}

/// The results file on disk
#[derive(Debug, Clone)]
pub struct ResultsStore {
    path: PathBuf,
}

impl ResultsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// The persisted table, or an empty one when there is no file yet
    pub fn load_existing(&self) -> Result<ResultsTable, StoreError> {
        let file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ResultsTable::new()),
            Err(e) => return Err(self.io_error(e)),
        };
        ResultsTable::read_csv(file).map_err(|reason| StoreError::Corrupt {
            path: self.path.clone(),
            reason,
        })
    }

    /// Loads, appends one run and persists. Returns the updated table.
    pub fn append_run(&self, results: &[TuneResult], run_label: &str) -> Result<ResultsTable, StoreError> {
        let mut table = self.load_existing()?;
        table.append_run(run_label, results)?;
        self.save(&table)?;
        info!(
            "Results for '{}' saved to: {}",
            run_label.replace('\n', " "),
            self.path.display()
        );
        Ok(table)
    }

    /// Writes the table through a temporary file so a crash never leaves half a file.
    pub fn save(&self, table: &ResultsTable) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let tmp = self.path.with_extension("csv.tmp");
        let file = std::fs::File::create(&tmp).map_err(|e| self.io_error(e))?;
        table.write_csv(file).map_err(|source| StoreError::Csv {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))
    }

    /// Deletes the persisted table. Returns whether a file was removed.
    pub fn reset(&self) -> Result<bool, StoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!("Deleted previous results file: {}", self.path.display());
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}
