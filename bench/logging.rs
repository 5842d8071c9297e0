//! Logging setup and the `TUNE` progress channel.
//!
//! Tuning progress is reported on the log target [`TUNE_TARGET`], which ranks above
//! INFO: while the INFO gate is closed (see [`InfoSuppression`]) ordinary INFO and DEBUG
//! records are dropped, but `TUNE` records still reach the terminal.

use itertools::Itertools;
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

/// Log target carrying hyperparameter tuning progress.
pub const TUNE_TARGET: &str = "tune";

/// Width of a full separator line.
const LINE_WIDTH: usize = 80;

static INFO_SUPPRESSED: AtomicBool = AtomicBool::new(false);

/// Logs a formatted message on the `TUNE` channel.
#[macro_export]
macro_rules! tune_log {
    ($($arg:tt)+) => {
        log::info!(target: $crate::logging::TUNE_TARGET, $($arg)+)
    };
}

struct GatedLogger {
    inner: env_logger::Logger,
}

impl Log for GatedLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        passes_gate(metadata, info_suppressed()) && self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if passes_gate(record.metadata(), info_suppressed()) {
            self.inner.log(record);
        }
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

fn passes_gate(metadata: &Metadata, suppressed: bool) -> bool {
    metadata.target() == TUNE_TARGET || !suppressed || metadata.level() < Level::Info
}

/// Installs the global logger. `RUST_LOG` is honoured; the default level is INFO, or
/// DEBUG when `debug` is set. The `TUNE` channel is always shown.
pub fn init(debug: bool) -> Result<(), SetLoggerError> {
    let default_level = if debug { "debug" } else { "info" };
    let inner = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_level),
    )
    .filter_module(TUNE_TARGET, LevelFilter::Info)
    .format(|buf, record| {
        if record.target() == TUNE_TARGET {
            writeln!(buf, "[TUNE] {}", record.args())
        } else {
            writeln!(buf, "[{} {}] {}", record.level(), record.target(), record.args())
        }
    })
    .build();
    let max_level = inner.filter().max(LevelFilter::Info);
    log::set_boxed_logger(Box::new(GatedLogger { inner }))?;
    log::set_max_level(max_level);
    Ok(())
}

pub fn info_suppressed() -> bool {
    INFO_SUPPRESSED.load(Ordering::SeqCst)
}

/// Closes (or opens) the INFO gate for as long as the guard lives; the previous state is
/// restored on drop.
pub struct InfoSuppression {
    previous: bool,
}

impl InfoSuppression {
    pub fn engage(suppress: bool) -> Self {
        let previous = INFO_SUPPRESSED.swap(suppress, Ordering::SeqCst);
        Self { previous }
    }
}

impl Drop for InfoSuppression {
    fn drop(&mut self) {
        INFO_SUPPRESSED.store(self.previous, Ordering::SeqCst);
    }
}

/// Formats one row of the tuning table.
///
/// With a header, each cell is truncated to its header's width and right-aligned
/// beneath it. Highlighted rows are wrapped in a green ANSI escape.
pub fn format_table_row(cells: &[String], header: Option<&[String]>, highlight: bool) -> String {
    let row = match header {
        Some(header) => cells
            .iter()
            .zip(header)
            .map(|(cell, head)| {
                let width = head.chars().count();
                let cell: String = cell.chars().take(width).collect();
                format!("{cell:>width$}")
            })
            .join(" | "),
        None => cells.join(" | "),
    };
    if highlight {
        format!("\x1b[31;32m{row}\x1b[0m")
    } else {
        row
    }
}

pub fn log_table_row(cells: &[String], header: Option<&[String]>, highlight: bool) {
    tune_log!("{}", format_table_row(cells, header, highlight));
}

/// Centres `msg` in a line of `fill` characters, followed by `num_newlines` blank lines.
pub fn format_full_line(msg: &str, fill: char, num_newlines: usize) -> String {
    let width = LINE_WIDTH.saturating_sub(TUNE_TARGET.len() + 3);
    let len = msg.chars().count();
    let pad = width.saturating_sub(len);
    let left = pad / 2;
    let right = pad - left;
    let fill = fill.to_string();
    format!(
        "{}{msg}{}{}",
        fill.repeat(left),
        fill.repeat(right),
        "\n".repeat(num_newlines)
    )
}

pub fn log_full_line(msg: &str, fill: char, num_newlines: usize) {
    tune_log!("{}", format_full_line(msg, fill, num_newlines));
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::MetadataBuilder;

    fn cells(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn table_cells_align_under_header() {
        let header = cells(&["ITERATION", "Model.lr", "LOSS AT ITERATION"]);
        let row = format_table_row(&cells(&["3", "0.0123456789", "0.5"]), Some(&header), false);
        let expected = format!("{:>9} | {} | {:>17}", "3", "0.012345", "0.5");
        assert_eq!(row, expected);
    }

    #[test]
    fn highlighted_rows_are_wrapped_in_ansi_green() {
        let row = format_table_row(&cells(&["a", "b"]), None, true);
        assert_eq!(row, "\x1b[31;32ma | b\x1b[0m");
    }

    #[test]
    fn full_line_centres_message() {
        let line = format_full_line("GO", '=', 1);
        assert!(line.ends_with("\n"));
        let body = line.trim_end_matches('\n');
        assert_eq!(body.chars().count(), LINE_WIDTH - TUNE_TARGET.len() - 3);
        let (left, right) = body.split_once("GO").unwrap();
        assert!(left.chars().all(|c| c == '='));
        assert!((left.len() as isize - right.len() as isize).abs() <= 1);
    }

    #[test]
    fn tune_records_pass_closed_gate() {
        let tune = MetadataBuilder::new()
            .level(Level::Info)
            .target(TUNE_TARGET)
            .build();
        let info = MetadataBuilder::new()
            .level(Level::Info)
            .target("icu_bench::train")
            .build();
        let warn = MetadataBuilder::new()
            .level(Level::Warn)
            .target("icu_bench::train")
            .build();

        assert!(passes_gate(&tune, true));
        assert!(!passes_gate(&info, true));
        assert!(passes_gate(&warn, true));
        assert!(passes_gate(&info, false));
    }
}
