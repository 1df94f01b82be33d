//! Terminal reporting.
//!
//! Renders aggregator snapshots on a tick, either as an aligned table
//! block or as one JSON object per line. In table mode on a terminal the
//! previous block is erased with cursor movement before the next one is
//! written, so the report appears to update in place; the final block is
//! always printed clean.

use std::io::{self, IsTerminal, Write};
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use crate::report::SnapshotReport;
use crate::utils::format_duration;

const MAX_BAR_LEN: usize = 40;
const BAR_START: &str = "|";
const BAR_BODY: &str = "■";
const BAR_END: &str = "|";

const FG_RED: u8 = 31;
const FG_MAGENTA: u8 = 35;

#[derive(Clone, Copy, PartialEq)]
enum Align {
    Left,
    Right,
    Center,
}

/// Periodic renderer of snapshot reports.
pub struct Printer {
    max_num: i64,
    max_duration: Option<Duration>,
    pb_num_str: String,
    pb_dur_str: String,
    no_clean: bool,
    summary: bool,
    use_seconds: bool,
    json: bool,
    is_terminal: bool,
    back_lines: usize,
}

impl Printer {
    pub fn new(
        max_num: i64,
        max_duration: Option<Duration>,
        no_clean: bool,
        summary: bool,
        use_seconds: bool,
        json: bool,
    ) -> Self {
        Self {
            max_num,
            max_duration,
            pb_num_str: String::new(),
            pb_dur_str: String::new(),
            no_clean,
            summary,
            use_seconds,
            json,
            is_terminal: io::stdout().is_terminal(),
            back_lines: 0,
        }
    }

    /// Print a snapshot every `interval` until `done` fires, then print the
    /// final block. An interval of zero prints only the final block.
    pub async fn print_loop<F>(&mut self, snapshot: F, interval: Duration, done: CancellationToken)
    where
        F: Fn() -> SnapshotReport,
    {
        // In-place redraw only makes sense for live table output on a tty.
        let interactive = self.is_terminal && !self.summary && !interval.is_zero() && !self.json;

        if !interval.is_zero() {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !self.summary {
                            self.echo(&snapshot, false, interactive);
                        }
                    }
                    _ = done.cancelled() => break,
                }
            }
        } else {
            done.cancelled().await;
        }
        self.echo(&snapshot, true, interactive);
    }

    fn echo<F>(&mut self, snapshot: &F, is_final: bool, interactive: bool)
    where
        F: Fn() -> SnapshotReport,
    {
        let report = snapshot();
        self.update_progress(&report);
        let out = if self.json {
            self.format_json(&report)
        } else {
            self.format_table(&report, is_final)
        };

        let mut stdout = io::stdout().lock();
        if interactive && self.back_lines > 0 {
            let _ = write!(stdout, "\x1b[{}A", self.back_lines);
        }
        let mut lines = 0;
        for line in out.lines() {
            if interactive {
                let _ = write!(stdout, "\r\x1b[K");
            }
            let _ = writeln!(stdout, "{}", line);
            lines += 1;
        }
        let _ = stdout.flush();
        self.back_lines = lines;
    }

    fn update_progress(&mut self, report: &SnapshotReport) {
        if let Some(max) = self.max_duration {
            let cur = report.elapsed.min(max);
            let fill = bar_fill(cur.as_secs_f64(), max.as_secs_f64(), MAX_BAR_LEN - 2);
            self.pb_dur_str = render_bar(fill);
        }
        if self.max_num > 0 {
            let cur = (report.count as i64).min(self.max_num);
            let fill = bar_fill(cur as f64, self.max_num as f64, MAX_BAR_LEN - 2);
            self.pb_num_str = render_bar(fill);
        }
    }

    fn duration_string(&self, d: Duration) -> String {
        // Everything below microseconds is noise in a latency report.
        let d = Duration::from_micros(d.as_micros() as u64);
        if self.use_seconds {
            format_float(d.as_secs_f64())
        } else {
            format_duration(d)
        }
    }

    fn colorize(&self, s: String, color: u8) -> String {
        if !self.is_terminal {
            return s;
        }
        format!("\x1b[{}m{}\x1b[0m", color, s)
    }

    fn format_table(&self, s: &SnapshotReport, is_final: bool) -> String {
        let mut out = String::new();

        out.push_str("Summary:\n");
        let mut summary: Vec<Vec<String>> = Vec::with_capacity(8);
        let mut elapsed_line = vec![
            "Elapsed".to_string(),
            format_duration(truncate_duration(s.elapsed, Duration::from_millis(100))),
        ];
        if self.max_duration.is_some() && !is_final {
            elapsed_line.push(self.pb_dur_str.clone());
        }
        let mut count_line = vec!["Count".to_string(), s.count.to_string()];
        if self.max_num > 0 && !is_final {
            count_line.push(self.pb_num_str.clone());
        }
        summary.push(elapsed_line);
        summary.push(count_line);
        for (code, count) in sorted_map(&s.codes) {
            let value = if code != "2xx" {
                self.colorize(count.to_string(), FG_MAGENTA)
            } else {
                count.to_string()
            };
            summary.push(vec![format!("  {}", code), value]);
        }
        summary.push(vec!["RPS".to_string(), format!("{:.3}", s.rps)]);
        summary.push(vec![
            "Reads".to_string(),
            format!("{:.3}MB/s", s.read_throughput),
        ]);
        summary.push(vec![
            "Writes".to_string(),
            format!("{:.3}MB/s", s.write_throughput),
        ]);
        align_bulk(&mut summary, &[Align::Left, Align::Right]);
        write_bulk(&mut out, &summary, "  ", "  ");
        out.push('\n');

        if !s.errors.is_empty() {
            out.push_str("Error:\n");
            let mut errors: Vec<Vec<String>> = sorted_map(&s.errors)
                .into_iter()
                .map(|(message, count)| {
                    vec![
                        self.colorize(count.to_string(), FG_RED),
                        format!("\"{}\"", message),
                    ]
                })
                .collect();
            align_bulk(&mut errors, &[Align::Left, Align::Left]);
            write_bulk(&mut out, &errors, "  ", "  ");
            out.push('\n');
        }

        let mut stats: Vec<Vec<String>> = vec![
            ["Statistics", "Min", "Mean", "StdDev", "Max"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            vec![
                "  Latency".to_string(),
                self.duration_string(s.latency.min),
                self.duration_string(s.latency.mean),
                self.duration_string(s.latency.stddev),
                self.duration_string(s.latency.max),
            ],
        ];
        if let Some(rps) = &s.rps_stats {
            stats.push(vec![
                "  RPS".to_string(),
                format_float(truncate2(rps.min)),
                format_float(truncate2(rps.mean)),
                format_float(truncate2(rps.stddev)),
                format_float(truncate2(rps.max)),
            ]);
        }
        align_bulk(
            &mut stats,
            &[
                Align::Left,
                Align::Center,
                Align::Center,
                Align::Center,
                Align::Center,
            ],
        );
        write_bulk(&mut out, &stats, "", "  ");
        out.push('\n');

        out.push_str("Latency Percentile:\n");
        let mut perc: Vec<Vec<String>> = vec![Vec::new(), Vec::new()];
        let mut perc_aligns = Vec::with_capacity(s.percentiles.len());
        for (quantile, latency) in &s.percentiles {
            perc[0].push(percentile_label(*quantile));
            perc[1].push(self.duration_string(*latency));
            perc_aligns.push(Align::Center);
        }
        if !perc_aligns.is_empty() {
            perc_aligns[0] = Align::Left;
        }
        align_bulk(&mut perc, &perc_aligns);
        write_bulk(&mut out, &perc, "  ", "  ");
        out.push('\n');

        out.push_str("Latency Histogram:\n");
        let max_count = s.histogram.iter().map(|(_, c)| *c).max().unwrap_or(0);
        let total: u64 = s.histogram.iter().map(|(_, c)| *c).sum();
        let mut hist: Vec<Vec<String>> = Vec::with_capacity(s.histogram.len());
        for (mean, count) in &s.histogram {
            let mut row = vec![self.duration_string(*mean), count.to_string()];
            if is_final {
                let pct = if total > 0 {
                    (*count as f64 * 1e4 / total as f64 + 0.5).floor() / 100.0
                } else {
                    0.0
                };
                row.push(format!("{:.2}%", pct));
            }
            if !is_final || self.no_clean {
                let fill = if max_count > 0 {
                    bar_fill(*count as f64, max_count as f64, MAX_BAR_LEN)
                } else {
                    0
                };
                row.push(BAR_BODY.repeat(fill));
            }
            hist.push(row);
        }
        let hist_aligns = if is_final {
            vec![Align::Left, Align::Right, Align::Right]
        } else {
            vec![Align::Left, Align::Right, Align::Left]
        };
        align_bulk(&mut hist, &hist_aligns);
        write_bulk(&mut out, &hist, "  ", "  ");

        out
    }

    fn format_json(&self, s: &SnapshotReport) -> String {
        let mut root = Map::new();

        let mut summary = Map::new();
        summary.insert(
            "Elapsed".to_string(),
            json!(format_duration(truncate_duration(
                s.elapsed,
                Duration::from_millis(100)
            ))),
        );
        summary.insert("Count".to_string(), json!(s.count));
        let mut counts = Map::new();
        for (code, count) in sorted_map(&s.codes) {
            counts.insert(code, json!(count));
        }
        summary.insert("Counts".to_string(), Value::Object(counts));
        summary.insert("RPS".to_string(), json!(round3(s.rps)));
        summary.insert(
            "Reads".to_string(),
            json!(format!("{:.3}MB/s", s.read_throughput)),
        );
        summary.insert(
            "Writes".to_string(),
            json!(format!("{:.3}MB/s", s.write_throughput)),
        );
        root.insert("Summary".to_string(), Value::Object(summary));

        if !s.errors.is_empty() {
            let mut errors = Map::new();
            for (message, count) in sorted_map(&s.errors) {
                errors.insert(message, json!(count));
            }
            root.insert("Error".to_string(), Value::Object(errors));
        }

        let mut statistics = Map::new();
        statistics.insert(
            "Latency".to_string(),
            json!({
                "Min": self.duration_string(s.latency.min),
                "Mean": self.duration_string(s.latency.mean),
                "StdDev": self.duration_string(s.latency.stddev),
                "Max": self.duration_string(s.latency.max),
            }),
        );
        if let Some(rps) = &s.rps_stats {
            statistics.insert(
                "RPS".to_string(),
                json!({
                    "Min": truncate2(rps.min),
                    "Mean": truncate2(rps.mean),
                    "StdDev": truncate2(rps.stddev),
                    "Max": truncate2(rps.max),
                }),
            );
        }
        root.insert("Statistics".to_string(), Value::Object(statistics));

        let mut percentiles = Map::new();
        for (quantile, latency) in &s.percentiles {
            percentiles.insert(
                percentile_label(*quantile),
                json!(self.duration_string(*latency)),
            );
        }
        root.insert("Percentiles".to_string(), Value::Object(percentiles));

        let histograms: Vec<Value> = s
            .histogram
            .iter()
            .map(|(mean, count)| json!([self.duration_string(*mean), count]))
            .collect();
        root.insert("Histograms".to_string(), Value::Array(histograms));

        Value::Object(root).to_string()
    }
}

fn render_bar(fill: usize) -> String {
    format!(
        "{}{}{}{}",
        BAR_START,
        BAR_BODY.repeat(fill),
        " ".repeat(MAX_BAR_LEN - 2 - fill),
        BAR_END
    )
}

fn bar_fill(cur: f64, max: f64, width: usize) -> usize {
    if max <= 0.0 {
        return 0;
    }
    ((cur / max) * width as f64 + 0.5).floor().min(width as f64) as usize
}

fn truncate_duration(d: Duration, unit: Duration) -> Duration {
    let units = d.as_nanos() / unit.as_nanos().max(1);
    Duration::from_nanos((units * unit.as_nanos()) as u64)
}

fn truncate2(v: f64) -> f64 {
    (v * 100.0).trunc() / 100.0
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

// Shortest decimal rendering, Go's strconv.FormatFloat(f, 'f', -1, 64)
// equivalent for the magnitudes printed here.
fn format_float(v: f64) -> String {
    format!("{}", v)
}

fn percentile_label(quantile: f64) -> String {
    format!("P{}", format_float((quantile * 10_000.0).round() / 100.0))
}

fn sorted_map(map: &std::collections::HashMap<String, u64>) -> Vec<(String, u64)> {
    let mut entries: Vec<(String, u64)> = map.iter().map(|(k, v)| (k.clone(), *v)).collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    entries
}

/// Width as displayed, ignoring ANSI escape sequences.
fn display_width(s: &str) -> usize {
    let mut width = 0;
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            for c in chars.by_ref() {
                if c.is_ascii_alphabetic() {
                    break;
                }
            }
        } else {
            width += 1;
        }
    }
    width
}

fn pad(s: &str, width: usize, align: Align) -> String {
    let gap = width.saturating_sub(display_width(s));
    if gap == 0 {
        return s.to_string();
    }
    match align {
        Align::Left => format!("{}{}", s, " ".repeat(gap)),
        Align::Right => format!("{}{}", " ".repeat(gap), s),
        Align::Center => {
            let left = gap / 2;
            format!("{}{}{}", " ".repeat(left), s, " ".repeat(gap - left))
        }
    }
}

fn align_bulk(bulk: &mut [Vec<String>], aligns: &[Align]) {
    let mut max_len: Vec<usize> = Vec::new();
    for row in bulk.iter() {
        for (i, cell) in row.iter().enumerate() {
            let w = display_width(cell);
            if i >= max_len.len() {
                max_len.push(w);
            } else if max_len[i] < w {
                max_len[i] = w;
            }
        }
    }
    for row in bulk.iter_mut() {
        for (i, align) in aligns.iter().enumerate() {
            if i < row.len() {
                // The last left-aligned column needs no trailing padding.
                if i == aligns.len() - 1 && *align == Align::Left {
                    continue;
                }
                row[i] = pad(&row[i], max_len[i], *align);
            }
        }
    }
}

fn write_bulk(out: &mut String, bulk: &[Vec<String>], line_start: &str, sep: &str) {
    for row in bulk {
        out.push_str(line_start);
        for (i, cell) in row.iter().enumerate() {
            if i > 0 {
                out.push_str(sep);
            }
            out.push_str(cell);
        }
        out.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{LatencySummary, RpsSummary};
    use std::collections::HashMap;

    fn sample_snapshot() -> SnapshotReport {
        let mut codes = HashMap::new();
        codes.insert("2xx".to_string(), 8);
        codes.insert("4xx".to_string(), 2);
        let mut errors = HashMap::new();
        errors.insert("connection refused".to_string(), 1);
        SnapshotReport {
            elapsed: Duration::from_millis(1234),
            count: 11,
            codes,
            errors,
            rps: 8.914,
            read_throughput: 0.015,
            write_throughput: 0.002,
            latency: LatencySummary {
                min: Duration::from_micros(900),
                mean: Duration::from_micros(1500),
                stddev: Duration::from_micros(300),
                max: Duration::from_micros(4200),
            },
            rps_stats: Some(RpsSummary {
                min: 7.0,
                mean: 8.5,
                stddev: 0.75,
                max: 9.75,
            }),
            percentiles: vec![
                (0.50, Duration::from_micros(1400)),
                (0.75, Duration::from_micros(1600)),
                (0.90, Duration::from_micros(2000)),
                (0.95, Duration::from_micros(2500)),
                (0.99, Duration::from_micros(4000)),
                (0.999, Duration::from_micros(4100)),
                (0.9999, Duration::from_micros(4200)),
            ],
            histogram: vec![
                (Duration::from_micros(1000), 6),
                (Duration::from_micros(2000), 4),
                (Duration::from_micros(4000), 1),
            ],
        }
    }

    fn test_printer(json: bool) -> Printer {
        let mut p = Printer::new(-1, None, false, false, false, json);
        p.is_terminal = false;
        p
    }

    #[test]
    fn test_table_contains_sections() {
        let table = test_printer(false).format_table(&sample_snapshot(), false);
        assert!(table.contains("Summary:"));
        assert!(table.contains("Error:"));
        assert!(table.contains("Latency Percentile:"));
        assert!(table.contains("Latency Histogram:"));
        assert!(table.contains("2xx"));
        assert!(table.contains("\"connection refused\""));
        assert!(table.contains("P99.99"));
        assert!(table.contains("8.914"));
    }

    #[test]
    fn test_final_table_has_percentages_and_no_bars() {
        let p = test_printer(false);
        let interim = p.format_table(&sample_snapshot(), false);
        assert!(interim.contains(BAR_BODY));
        assert!(!interim.contains('%'));

        let fin = p.format_table(&sample_snapshot(), true);
        assert!(!fin.contains(BAR_BODY));
        assert!(fin.contains("54.55%"));
    }

    #[test]
    fn test_no_clean_keeps_final_bars() {
        let mut p = test_printer(false);
        p.no_clean = true;
        let fin = p.format_table(&sample_snapshot(), true);
        assert!(fin.contains(BAR_BODY));
    }

    #[test]
    fn test_json_is_single_line() {
        let out = test_printer(true).format_json(&sample_snapshot());
        assert_eq!(out.lines().count(), 1);
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["Summary"]["Count"], 11);
        assert_eq!(parsed["Summary"]["Counts"]["2xx"], 8);
        assert_eq!(parsed["Error"]["connection refused"], 1);
        assert_eq!(parsed["Percentiles"]["P50"], "1.4ms");
        assert_eq!(parsed["Statistics"]["RPS"]["Max"], 9.75);
        assert_eq!(parsed["Histograms"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_json_omits_empty_errors() {
        let mut snapshot = sample_snapshot();
        snapshot.errors.clear();
        let out = test_printer(true).format_json(&snapshot);
        let parsed: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert!(parsed.get("Error").is_none());
    }

    #[test]
    fn test_percentile_labels() {
        assert_eq!(percentile_label(0.50), "P50");
        assert_eq!(percentile_label(0.999), "P99.9");
        assert_eq!(percentile_label(0.9999), "P99.99");
    }

    #[test]
    fn test_display_width_ignores_ansi() {
        assert_eq!(display_width("plain"), 5);
        assert_eq!(display_width("\x1b[35m42\x1b[0m"), 2);
    }

    #[test]
    fn test_progress_bar_fill() {
        assert_eq!(bar_fill(0.0, 10.0, 38), 0);
        assert_eq!(bar_fill(5.0, 10.0, 38), 19);
        assert_eq!(bar_fill(10.0, 10.0, 38), 38);
        assert_eq!(render_bar(0).chars().count(), MAX_BAR_LEN);
        assert_eq!(render_bar(38).chars().count(), MAX_BAR_LEN);
    }

    #[test]
    fn test_truncate_helpers() {
        assert_eq!(truncate2(9.789), 9.78);
        assert_eq!(round3(8.9144), 8.914);
        assert_eq!(
            truncate_duration(Duration::from_millis(1234), Duration::from_millis(100)),
            Duration::from_millis(1200)
        );
    }
}
