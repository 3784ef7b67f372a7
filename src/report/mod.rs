//! Report generation for tuning results

use std::fmt::{self, Write as _};
use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use tracing::info;

use crate::stats::{StatsManager, TuneClass, classify, classify_ms, split_label};
use crate::store::{Cell, CellOutcome, ResultsTable, RunColumn};

const EMPTY: &str = "—";
const CONSOLE_WIDTH: usize = 25;

const STYLE: &str = r#"body { font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", Roboto, "Helvetica Neue", Arial, sans-serif; margin: 2em; background-color: #f8f9fa; }
table { border-collapse: collapse; width: 100%; margin-bottom: 1.5rem; background-color: #fff; }
table.averages { width: 60%; margin-left: auto; margin-right: auto; }
th, td { border: 1px solid #dee2e6; padding: 0.75rem; text-align: center; vertical-align: middle; }
th { background-color: #f1f1f1; color: #333; font-weight: 600; }
th.avg-header { background-color: #343a40; color: #fff; }
h1, h2 { border-bottom: 2px solid #007bff; padding-bottom: 10px; margin-top: 25px; margin-bottom: 15px; color: #333; }
.fast { background-color: #d4edda; } .medium { background-color: #fff3cd; } .slow { background-color: #f8d7da; }
.fail { background-color: #e9ecef; color: #6c757d; }
.info-cell, .debug-cell { font-size: 0.8em; text-align: left; vertical-align: top; }
.debug-cell { color: #721c24; background-color: #f8d7da; white-space: pre-wrap; word-wrap: break-word; }
.retry-note { font-size: 0.9em; color: #856404; font-style: italic; }
img { max-width: 150px; height: auto; display: block; margin: 0 auto; }
b { font-weight: 600; }"#;

/// Which optional sub-columns the detailed table carries
struct Layout {
    info: bool,
    debug: bool,
}

impl Layout {
    fn of(table: &ResultsTable) -> Self {
        let cells = || table.runs().iter().flat_map(|r| r.cells().map(|(_, c)| c));
        Self {
            info: cells().any(|c: &Cell| c.info.is_some()),
            debug: cells().any(|c: &Cell| c.debug.is_some()),
        }
    }

    fn colspan(&self) -> usize {
        2 + self.info as usize + self.debug as usize
    }
}

/// Renders the results table for people
pub struct Reporter;

impl Reporter {
    /// Self-contained HTML document. The same table and thumbnails always give the same output.
    pub fn render_html(table: &ResultsTable) -> String {
        let mut html = String::new();
        // Writing into a String cannot fail
        let _ = write_document(&mut html, table);
        html
    }

    pub fn write_html(table: &ResultsTable, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, Self::render_html(table))?;
        info!("HTML report generated: {}", path.display());
        Ok(())
    }

    /// Fixed-width text table; averages under the run names.
    pub fn render_console(table: &ResultsTable) -> String {
        if table.is_empty() {
            return "No results to display.\n".to_string();
        }
        let stats = StatsManager::from_table(table);
        let runs = table.runs();
        let mut out = String::new();

        out.push_str("\n--- Channel Tuning Performance ---\n");
        out.push_str(&format!("{:<CONSOLE_WIDTH$}", "Channel"));
        for run in runs {
            out.push_str(&format!("{:>CONSOLE_WIDTH$}", split_label(&run.label).0));
        }
        out.push('\n');
        out.push_str(&format!("{:<CONSOLE_WIDTH$}", ""));
        for run in runs {
            let avg = match stats.get(&run.label).and_then(|s| s.average_ms) {
                Some(ms) => format!("({} avg)", seconds(ms)),
                None => "(N/A)".to_string(),
            };
            out.push_str(&format!("{avg:>CONSOLE_WIDTH$}"));
        }
        out.push('\n');
        out.push_str(&"-".repeat(CONSOLE_WIDTH * (runs.len() + 1)));
        out.push('\n');

        for channel in table.channels() {
            out.push_str(&format!("{channel:<CONSOLE_WIDTH$}"));
            for run in runs {
                let content = match run.cell(channel).map(|c| c.outcome) {
                    Some(CellOutcome::Tuned { elapsed_ms }) => seconds(elapsed_ms as f64),
                    Some(_) => "Failed".to_string(),
                    None => String::new(),
                };
                out.push_str(&format!("{content:>CONSOLE_WIDTH$}"));
            }
            out.push('\n');
        }
        out
    }
}

fn write_document(out: &mut String, table: &ResultsTable) -> fmt::Result {
    writeln!(out, "<!DOCTYPE html>")?;
    writeln!(out, "<html><head><meta charset=\"UTF-8\"><title>IPTV Tuning Report</title>")?;
    writeln!(out, "<style>\n{STYLE}\n</style></head><body>")?;
    writeln!(out, "<h1>IPTV Channel Tuning Performance</h1>")?;

    if table.is_empty() {
        writeln!(out, "<p>No results to include in report.</p>")?;
    } else {
        let stats = StatsManager::from_table(table);
        write_averages(out, &stats)?;
        write_details(out, table, &stats)?;
    }
    writeln!(out, "</body></html>")
}

fn write_averages(out: &mut String, stats: &StatsManager) -> fmt::Result {
    writeln!(out, "<h2>Profile Averages</h2>")?;
    writeln!(
        out,
        "<table class=\"averages\"><thead><tr><th class=\"avg-header\">Profile</th><th class=\"avg-header\">Average Time (s)</th></tr></thead><tbody>"
    )?;
    for summary in stats.ranked() {
        let (name, date) = split_label(&summary.label);
        let content = summary.average_ms.map(seconds).unwrap_or_else(|| "N/A".into());
        write!(out, "<tr><td>{}", escape(name))?;
        if !date.is_empty() {
            write!(out, "<br><small>{}</small>", escape(date))?;
        }
        writeln!(out, "</td><td class=\"{}\">{content}</td></tr>", summary.class().css_class())?;
    }
    writeln!(out, "</tbody></table>")
}

fn write_details(out: &mut String, table: &ResultsTable, stats: &StatsManager) -> fmt::Result {
    let layout = Layout::of(table);
    writeln!(out, "<h2>Detailed Results</h2>")?;
    write!(out, "<table><thead><tr><th rowspan=\"2\">Channel</th>")?;
    for run in table.runs() {
        let (name, date) = split_label(&run.label);
        write!(
            out,
            "<th colspan=\"{}\">{}<br>{}</th>",
            layout.colspan(),
            escape(name),
            escape(date)
        )?;
    }
    write!(out, "</tr><tr>")?;
    for _ in table.runs() {
        if layout.info {
            write!(out, "<th>Stream Info</th>")?;
        }
        write!(out, "<th>Time</th><th>Thumbnail</th>")?;
        if layout.debug {
            write!(out, "<th>Debug</th>")?;
        }
    }
    writeln!(out, "</tr></thead><tbody>")?;

    for channel in table.channels() {
        write!(out, "<tr><td><b>{}</b></td>", escape(channel))?;
        for run in table.runs() {
            write_cell(out, run, channel, &layout)?;
        }
        writeln!(out, "</tr>")?;
    }

    write!(out, "<tr><td><b>Average</b></td>")?;
    for run in table.runs() {
        if layout.info {
            write!(out, "<td>{EMPTY}</td>")?;
        }
        match stats.get(&run.label).and_then(|s| s.average_ms) {
            Some(ms) => write!(out, "<td class=\"{}\"><b>{}</b></td>", classify_ms(ms).css_class(), seconds(ms))?,
            None => write!(out, "<td class=\"{}\">N/A</td>", TuneClass::Failed.css_class())?,
        }
        write!(out, "<td>{EMPTY}</td>")?;
        if layout.debug {
            write!(out, "<td>{EMPTY}</td>")?;
        }
    }
    writeln!(out, "</tr></tbody></table>")
}

fn write_cell(out: &mut String, run: &RunColumn, channel: &str, layout: &Layout) -> fmt::Result {
    let Some(cell) = run.cell(channel) else {
        for _ in 0..layout.colspan() {
            write!(out, "<td>{EMPTY}</td>")?;
        }
        return Ok(());
    };

    if layout.info {
        let info = cell.info.as_deref().map(escape).unwrap_or_else(|| "N/A".into());
        write!(out, "<td class=\"info-cell\">{info}")?;
        if cell.info_retry {
            write!(out, "<br><small class=\"retry-note\">(retry was needed)</small>")?;
        }
        write!(out, "</td>")?;
    }

    let content = match cell.outcome {
        CellOutcome::Tuned { elapsed_ms } => seconds(elapsed_ms as f64),
        CellOutcome::TimedOut => "Timed out".into(),
        CellOutcome::Errored => "Failed".into(),
    };
    write!(out, "<td class=\"{}\">{content}</td>", classify(&cell.outcome).css_class())?;

    match cell.thumbnail.as_deref().filter(|p| p.exists()) {
        Some(path) => match std::fs::read(path) {
            Ok(bytes) => write!(
                out,
                "<td><img src=\"data:image/png;base64,{}\" alt=\"Thumb\"></td>",
                STANDARD.encode(bytes)
            )?,
            Err(_) => write!(out, "<td>Error</td>")?,
        },
        None => write!(out, "<td>{EMPTY}</td>")?,
    }

    if layout.debug {
        let debug = cell.debug.as_deref().map(escape).unwrap_or_default();
        write!(out, "<td class=\"debug-cell\">{debug}</td>")?;
    }
    Ok(())
}

fn seconds(ms: f64) -> String {
    format!("{:.3}s", ms / 1000.0)
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CodecSummary, StreamInfo, TuneOutcome, TuneResult};
    use std::time::Duration;

    fn result(channel: &str, outcome: TuneOutcome) -> TuneResult {
        TuneResult {
            channel_name: channel.into(),
            run_label: String::new(),
            outcome,
            thumbnail: None,
            codec_info: None,
            notes: Vec::new(),
        }
    }

    fn ms(v: u64) -> TuneOutcome {
        TuneOutcome::Tuned(Duration::from_millis(v))
    }

    #[test]
    fn escapes_and_colours_cells() {
        let mut table = ResultsTable::new();
        table
            .append_run(
                "Proxy <test>\n2024-05-01 20:15",
                &[result("A&B", ms(800)), result("C", TuneOutcome::TimedOut), result("D", ms(3_200))],
            )
            .unwrap();
        let html = Reporter::render_html(&table);

        assert!(html.contains("<b>A&amp;B</b>"));
        assert!(html.contains("Proxy &lt;test&gt;<br>2024-05-01 20:15"));
        assert!(html.contains("<td class=\"fast\">0.800s</td>"));
        assert!(html.contains("<td class=\"fail\">Timed out</td>"));
        assert!(html.contains("<td class=\"slow\">3.200s</td>"));
        assert!(html.contains("<td class=\"medium\"><b>2.000s</b></td>"));
        assert!(!html.contains("Stream Info"));
        assert!(!html.contains("<th>Debug</th>"));
    }

    #[test]
    fn averages_sorted_with_na_last() {
        let mut table = ResultsTable::new();
        table.append_run("Dead", &[result("A", TuneOutcome::TimedOut)]).unwrap();
        table.append_run("Slow", &[result("A", ms(2_000))]).unwrap();
        table.append_run("Fast", &[result("A", ms(400))]).unwrap();
        let html = Reporter::render_html(&table);

        let averages = &html[..html.find("Detailed Results").unwrap()];
        let fast = averages.find("<td>Fast").unwrap();
        let slow = averages.find("<td>Slow").unwrap();
        let dead = averages.find("<td>Dead").unwrap();
        assert!(fast < slow && slow < dead);
        assert!(averages.contains("<td class=\"fail\">N/A</td>"));
    }

    #[test]
    fn optional_columns_follow_content() {
        let mut probed = result("A", ms(900));
        probed.codec_info = Some(StreamInfo::Probed(CodecSummary {
            container: "MPEGTS".into(),
            video: "AVC".into(),
            audio: "AAC".into(),
            retried: true,
        }));
        let mut failed = result("B", TuneOutcome::StreamError("boom".into()));
        failed.notes = vec!["Docker: <error>".into()];

        let mut table = ResultsTable::new();
        table.append_run("Run", &[probed, failed]).unwrap();
        table.append_run("Later", &[result("C", ms(100))]).unwrap();
        let html = Reporter::render_html(&table);

        assert!(html.contains("<th colspan=\"4\">Run<br></th>"));
        assert!(html.contains("Input: MPEGTS, Video: AVC, Audio: AAC<br><small class=\"retry-note\">"));
        assert!(html.contains("<td class=\"debug-cell\">Docker: &lt;error&gt;</td>"));
        // C was not part of "Run"
        let row_c = &html[html.find("<b>C</b>").unwrap()..];
        assert!(row_c.starts_with(&format!("<b>C</b></td>{}", "<td>—</td>".repeat(4))));
    }

    #[test]
    fn render_is_deterministic() {
        let mut table = ResultsTable::new();
        table.append_run("Run", &[result("A", ms(100)), result("B", ms(200))]).unwrap();
        assert_eq!(Reporter::render_html(&table), Reporter::render_html(&table));
    }

    #[test]
    fn console_marks_failures() {
        let mut table = ResultsTable::new();
        table
            .append_run("Baseline (direct)\n2024-05-01 20:15", &[result("B", ms(800)), result("C", TuneOutcome::TimedOut)])
            .unwrap();
        let text = Reporter::render_console(&table);
        assert!(text.contains("Baseline (direct)"));
        assert!(text.contains("(0.800s avg)"));
        assert!(text.lines().any(|l| l.starts_with('C') && l.trim_end().ends_with("Failed")));
        assert!(!text.contains("2024-05-01"));
    }
}
