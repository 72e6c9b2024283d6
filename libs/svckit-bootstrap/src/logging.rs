use crate::config::{LoggingConfig, Section};
use crate::paths::home_dir::resolve_under;
use file_rotate::{
    compression::Compression,
    suffix::{AppendTimestamp, FileLimit},
    ContentLimit, FileRotate,
};
use parking_lot::Mutex;
use std::io::{IsTerminal, Write};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

// The non-blocking console writer flushes on drop; keep its guard for the process lifetime.
static CONSOLE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

const DEFAULT_MAX_SIZE_MB: u64 = 100;
const DEFAULT_MAX_BACKUPS: usize = 3;

fn parse_level(s: &str) -> Option<LevelFilter> {
    match s.trim().to_ascii_lowercase().as_str() {
        "trace" => Some(LevelFilter::TRACE),
        "debug" => Some(LevelFilter::DEBUG),
        "info" | "" => Some(LevelFilter::INFO),
        "warn" => Some(LevelFilter::WARN),
        "error" => Some(LevelFilter::ERROR),
        "off" | "none" => Some(LevelFilter::OFF),
        _ => None,
    }
}

// ================= rotating file writer =================

#[derive(Clone)]
struct RotWriter(Arc<Mutex<FileRotate<AppendTimestamp>>>);

impl RotWriter {
    fn open(path: &Path, section: &Section) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let max_bytes = section.max_size_mb.unwrap_or(DEFAULT_MAX_SIZE_MB) as usize * 1024 * 1024;
        // count-based retention wins; age-based only when no count is given
        let limit = match (section.max_backups, section.max_age_days) {
            (None, Some(days)) => FileLimit::Age(chrono::Duration::days(i64::from(days))),
            (backups, _) => FileLimit::MaxFiles(backups.unwrap_or(DEFAULT_MAX_BACKUPS)),
        };
        let rot = FileRotate::new(
            path,
            AppendTimestamp::default(limit),
            ContentLimit::BytesSurpassed(max_bytes),
            Compression::None,
            None,
        );
        Ok(Self(Arc::new(Mutex::new(rot))))
    }
}

impl Write for RotWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.lock().flush()
    }
}

impl<'a> fmt::MakeWriter<'a> for RotWriter {
    type Writer = RotWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

// ================= targets =================

#[derive(Clone, Copy)]
enum Sink {
    Console,
    File,
}

/// Level filter per sink: the "default" section sets the fallback, every other key is a
/// target prefix (`svckit`, `native_remoting::channel`, ...).
fn build_targets(cfg: &LoggingConfig, sink: Sink) -> Targets {
    let level_of = |section: &Section| match sink {
        Sink::Console => parse_level(&section.console_level),
        Sink::File => parse_level(&section.file_level),
    };

    let default = cfg
        .get("default")
        .and_then(level_of)
        .unwrap_or(LevelFilter::INFO);

    cfg.iter()
        .filter(|(target, _)| target.as_str() != "default")
        .filter_map(|(target, section)| level_of(section).map(|level| (target.clone(), level)))
        .fold(Targets::new().with_default(default), |targets, (target, level)| {
            targets.with_target(target, level)
        })
}

/// Install the global subscriber: human-readable console output on stderr plus an optional
/// JSON file (the "default" section's `file`, relative to `base_dir`).
///
/// `RUST_LOG`, when set, caps both sinks. Calling this twice is harmless; the second call
/// keeps the first subscriber.
pub fn init_logging(cfg: &LoggingConfig, base_dir: &Path) {
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("LogTracer init skipped: {e}");
    }

    let env = EnvFilter::try_from_default_env().ok();

    let (nb_stderr, guard) = tracing_appender::non_blocking(std::io::stderr());
    let _ = CONSOLE_GUARD.set(guard);

    let console_layer = fmt::layer()
        .with_writer(nb_stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_filter(build_targets(cfg, Sink::Console));

    let file_layer = cfg
        .get("default")
        .filter(|section| !section.file.trim().is_empty())
        .and_then(|section| {
            let path = resolve_under(base_dir, &section.file);
            match RotWriter::open(&path, section) {
                Ok(writer) => Some(writer),
                Err(e) => {
                    eprintln!("Failed to open log file '{}': {e}", path.display());
                    None
                }
            }
        })
        .map(|writer| {
            fmt::layer()
                .json()
                .with_ansi(false)
                .with_target(true)
                .with_timer(fmt::time::UtcTime::rfc_3339())
                .with_writer(writer)
                .with_filter(build_targets(cfg, Sink::File))
        });

    let _ = tracing_subscriber::registry()
        .with(env)
        .with(console_layer)
        .with(file_layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_logging_config;
    use tracing::Level;

    fn section(console: &str, file: &str) -> Section {
        Section {
            console_level: console.into(),
            file: String::new(),
            file_level: file.into(),
            max_backups: None,
            max_age_days: None,
            max_size_mb: None,
        }
    }

    #[test]
    fn parse_level_accepts_known_names() {
        assert_eq!(parse_level("DEBUG"), Some(LevelFilter::DEBUG));
        assert_eq!(parse_level("off"), Some(LevelFilter::OFF));
        assert_eq!(parse_level(""), Some(LevelFilter::INFO));
        assert_eq!(parse_level("verbose"), None);
    }

    #[test]
    fn targets_follow_sections_per_sink() {
        let mut cfg = default_logging_config();
        cfg.insert("native_remoting".into(), section("trace", "off"));

        let console = build_targets(&cfg, Sink::Console);
        assert!(console.would_enable("native_remoting::channel", &Level::TRACE));
        assert!(console.would_enable("svckit::container", &Level::INFO));
        assert!(!console.would_enable("svckit::container", &Level::DEBUG));

        let file = build_targets(&cfg, Sink::File);
        assert!(!file.would_enable("native_remoting", &Level::ERROR));
        assert!(file.would_enable("svckit", &Level::DEBUG));
    }

    #[test]
    fn rotating_writer_creates_parent_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("logs/nested/server.log");
        let mut writer = RotWriter::open(&path, &section("info", "info")).unwrap();
        writer.write_all(b"{\"msg\":\"hello\"}\n").unwrap();
        writer.flush().unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("hello"));
    }
}
