//! Process-global logging.
//!
//! A thin `log::Log` sink writing level-prefixed, colored lines to stderr,
//! plus a thread-local push/pop filter stack so a single save/restore/agent
//! tick can capture the last error or warning it emitted without installing
//! a second logger.

use std::cell::RefCell;
use std::sync::Once;

use colored::Colorize;
use log::{Level, LevelFilter, Log, Metadata, Record};

struct Logger;

static LOGGER: Logger = Logger;
static INIT: Once = Once::new();

thread_local! {
    static FILTER_STACK: RefCell<Vec<String>> = RefCell::new(Vec::new());
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let line = format!("{}", record.args());

        FILTER_STACK.with(|stack| {
            if let Some(top) = stack.borrow_mut().last_mut() {
                top.push_str(&line);
                top.push('\n');
            }
        });

        let prefix = match record.level() {
            Level::Error => "error".red().bold(),
            Level::Warn => "warn".yellow().bold(),
            Level::Info => "info".green(),
            Level::Debug => "debug".blue(),
            Level::Trace => "trace".dimmed(),
        };

        eprintln!("{prefix}: {line}");
    }

    fn flush(&self) {}
}

/// Installs the process-wide logger. Safe to call more than once; only the
/// first call takes effect.
pub fn init(level: LevelFilter) {
    INIT.call_once(|| {
        log::set_logger(&LOGGER).expect("logger already installed");
        log::set_max_level(level);
    });
}

/// Starts capturing every line logged on the current thread until the
/// matching [`pop_log_filter`]. Filters nest: only the innermost capture
/// receives each line.
pub fn push_log_filter() {
    FILTER_STACK.with(|stack| stack.borrow_mut().push(String::new()));
}

/// Pops the innermost capture and returns everything logged while it was
/// active, or `None` if the stack was empty.
pub fn pop_log_filter() -> Option<String> {
    FILTER_STACK.with(|stack| stack.borrow_mut().pop())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_stack_nests_and_unwinds() {
        push_log_filter();
        push_log_filter();
        log::logger().log(
            &Record::builder()
                .args(format_args!("inner"))
                .level(Level::Info)
                .build(),
        );
        let inner = pop_log_filter().unwrap();
        assert!(inner.contains("inner"));

        log::logger().log(
            &Record::builder()
                .args(format_args!("outer"))
                .level(Level::Info)
                .build(),
        );
        let outer = pop_log_filter().unwrap();
        assert!(outer.contains("outer"));
        assert!(!outer.contains("inner"));

        assert!(pop_log_filter().is_none());
    }
}
