//! Tracing subscriber setup for the binary.

use tracing::field::Field;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::{self, Writer};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use std::fmt;
use std::path::Path;

const MAX_MESSAGE_CHARS: usize = 280;

fn truncate_for_log(message: &str, max_chars: usize) -> (&str, bool) {
    match message.char_indices().nth(max_chars) {
        Some((byte_index, _character)) => (&message[..byte_index], true),
        None => (message, false),
    }
}

fn format_field(writer: &mut Writer<'_>, field: &Field, value: &dyn fmt::Debug) -> fmt::Result {
    let field_name = field.name();

    if field_name == "message" {
        let formatted = format!("{value:?}");
        let (truncated, was_truncated) = truncate_for_log(&formatted, MAX_MESSAGE_CHARS);
        if was_truncated {
            write!(writer, "{field_name}={truncated}...")
        } else {
            write!(writer, "{field_name}={formatted}")
        }
    } else {
        write!(writer, "{field_name}={value:?}")
    }
}

/// Initialize the global subscriber.
///
/// Logs go to stdout, or to a daily rolling `relaybot.log` under `log_dir`
/// when one is given. The returned guard must be held for the process
/// lifetime so buffered file output is flushed on exit.
pub fn init_tracing(debug: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = build_env_filter(debug);

    match log_dir {
        Some(log_dir) => {
            let file_appender = tracing_appender::rolling::daily(log_dir, "relaybot.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .fmt_fields(format::debug_fn(format_field))
                .compact();

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .init();
            Some(guard)
        }
        None => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .fmt_fields(format::debug_fn(format_field))
                .compact();

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .init();
            None
        }
    }
}

/// `RUST_LOG` wins over the `--debug` switch when set.
fn build_env_filter(debug: bool) -> tracing_subscriber::EnvFilter {
    if let Ok(filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        return filter;
    }

    if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::new("info")
    }
}

#[cfg(test)]
mod tests {
    use super::truncate_for_log;

    #[test]
    fn cuts_long_messages_on_char_boundaries() {
        let (truncated, was_truncated) = truncate_for_log("user→reply", 5);
        assert!(was_truncated);
        assert_eq!(truncated, "user→");

        let (untouched, was_truncated) = truncate_for_log("short", 280);
        assert!(!was_truncated);
        assert_eq!(untouched, "short");
    }
}
