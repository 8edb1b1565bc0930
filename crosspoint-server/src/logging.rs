//! Logging setup.
//!
//! One subscriber serves both sinks: a tee writer copies every
//! formatted line to stdout and to a daily-rotated file. Rolled files
//! carry a date suffix, which is also what the retention pruning keys
//! on; files whose suffix does not parse as a date are left alone.

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::OnceLock;

use chrono::{Days, Local, NaiveDate};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::EnvFilter;

/// Rolled files are named `<prefix>.<YYYY-MM-DD>`.
const FILE_PREFIX: &str = "crosspoint-server.log";

// keeps the non-blocking writer flushing for the program lifetime
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize logging: `log` macros flow through the subscriber to
/// stdout and a daily-rotated file under `log_dir`.
///
/// Filter precedence: `RUST_LOG` > `verbose` > `level` > `info`.
pub fn init_logging(
    log_dir: &Path,
    retention_days: u64,
    verbose: bool,
    level: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    fs::create_dir_all(log_dir)?;
    prune_dated_logs(log_dir, retention_days)?;

    let (file, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(
        log_dir,
        FILE_PREFIX,
    ));
    let _ = FILE_GUARD.set(guard);

    let directive = if verbose {
        "debug"
    } else {
        level.unwrap_or("info")
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    // try_init also installs the log-macro bridge
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(TeeMakeWriter { file })
        .with_target(true)
        .with_ansi(false)
        .with_timer(LocalTimer)
        .try_init()
        .map_err(|e| format!("failed to initialize logging: {e}"))?;

    Ok(())
}

/// Delete rolled log files whose date suffix falls outside the
/// retention window.
fn prune_dated_logs(log_dir: &Path, retention_days: u64) -> io::Result<()> {
    let cutoff = Local::now().date_naive() - Days::new(retention_days);

    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(date) = name
            .strip_prefix(FILE_PREFIX)
            .and_then(|rest| rest.strip_prefix('.'))
            .and_then(|suffix| NaiveDate::parse_from_str(suffix, "%Y-%m-%d").ok())
        else {
            continue;
        };
        if date < cutoff {
            if let Err(e) = fs::remove_file(entry.path()) {
                eprintln!("failed to remove old log file {name}: {e}");
            }
        }
    }

    Ok(())
}

/// Hands out writers that copy each line to stdout and the file sink.
struct TeeMakeWriter {
    file: NonBlocking,
}

impl<'a> MakeWriter<'a> for TeeMakeWriter {
    type Writer = TeeWriter;

    fn make_writer(&'a self) -> Self::Writer {
        TeeWriter {
            file: self.file.clone(),
            stdout: io::stdout(),
        }
    }
}

struct TeeWriter {
    file: NonBlocking,
    stdout: io::Stdout,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stdout.write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stdout.flush()?;
        self.file.flush()
    }
}

/// Local-time timestamps in log lines.
struct LocalTimer;

impl fmt::time::FormatTime for LocalTimer {
    fn format_time(&self, w: &mut fmt::format::Writer) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.6f"))
    }
}
