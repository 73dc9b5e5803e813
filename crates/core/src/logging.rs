//! Structured JSON logging.
//!
//! One JSON object per line, enriched with service identity and the
//! correlation scope of the emitting task. Records go to stderr, to a
//! size-rotated file when the log directory is writable, and into the
//! in-memory ring buffer consumed by diagnostics. A failing file
//! destination degrades the logger to stderr only; it never crashes.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LogConfig;
use crate::correlation;
use crate::log_buffer::LogRingBuffer;
use crate::{APP_VERSION, SERVICE_NAME};

/// Third-party targets pinned to warn regardless of the configured level.
const NOISY_TARGETS: &[&str] = &["hyper", "reqwest", "sqlx", "tower_http", "h2", "rustls"];

static LOG_BUFFER: OnceLock<Arc<LogRingBuffer>> = OnceLock::new();
static STDERR_ENABLED: AtomicBool = AtomicBool::new(true);

/// The process-wide ring buffer mirroring every emitted record.
pub fn log_buffer() -> Arc<LogRingBuffer> {
    LOG_BUFFER.get_or_init(|| Arc::new(LogRingBuffer::default())).clone()
}

/// Ensure the stderr destination is active. The file destination may drop
/// out at runtime; stderr must never be absent.
pub fn ensure_stderr_destination() {
    if !STDERR_ENABLED.swap(true, Ordering::Relaxed) {
        eprintln!("{{\"level\":\"warn\",\"message\":\"stderr log destination re-enabled\"}}");
    }
}

/// Initialize the global subscriber. Must run before anything else logs;
/// later calls are no-ops.
pub fn init_logging(config: &LogConfig) {
    let directives = NOISY_TARGETS
        .iter()
        .map(|t| format!("{t}=warn"))
        .collect::<Vec<_>>()
        .join(",");
    let filter = EnvFilter::try_new(format!("{},{}", config.level, directives))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let file = RotatingFileWriter::open(config).map(Mutex::new);
    if file.is_none() {
        eprintln!(
            "{{\"level\":\"warn\",\"message\":\"log file unavailable, stderr only\",\"log_dir\":{:?}}}",
            config.dir.display().to_string()
        );
    }

    let layer = JsonLineLayer {
        buffer: log_buffer(),
        file,
    };

    let _ = tracing_subscriber::registry().with(filter).with(layer).try_init();
}

// ── JSON layer ────────────────────────────────────────────────────

pub struct JsonLineLayer {
    buffer: Arc<LogRingBuffer>,
    file: Option<Mutex<RotatingFileWriter>>,
}

impl JsonLineLayer {
    pub fn new(buffer: Arc<LogRingBuffer>, file: Option<RotatingFileWriter>) -> Self {
        Self {
            buffer,
            file: file.map(Mutex::new),
        }
    }

    fn deliver(&self, record: Map<String, Value>) {
        let line = Value::Object(record.clone()).to_string();

        if STDERR_ENABLED.load(Ordering::Relaxed) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{line}");
        }

        if let Some(file) = &self.file {
            let mut writer = file.lock().unwrap();
            writer.write_line(&line);
        }

        self.buffer.push(Value::Object(record));
    }
}

impl<S: Subscriber> Layer<S> for JsonLineLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();

        let mut record = Map::new();
        record.insert(
            "ts".into(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
        record.insert(
            "level".into(),
            Value::String(meta.level().to_string().to_lowercase()),
        );
        record.insert("service".into(), Value::String(SERVICE_NAME.into()));
        record.insert("version".into(), Value::String(APP_VERSION.into()));
        record.insert("logger".into(), Value::String(meta.target().into()));

        if let Some(scope) = correlation::current() {
            record.insert("request_id".into(), Value::String(scope.request_id));
            record.insert("correlation_id".into(), Value::String(scope.correlation_id));
            if let Some(sid) = scope.session_id {
                record.insert("session_id".into(), Value::String(sid));
            }
        }

        let mut visitor = JsonVisitor(&mut record);
        event.record(&mut visitor);

        self.deliver(record);
    }
}

struct JsonVisitor<'a>(&'a mut Map<String, Value>);

impl Visit for JsonVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().into(), Value::String(value.into()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name().into(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name().into(), Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.0.insert(field.name().into(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.0.insert(field.name().into(), Value::from(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.0
            .insert(field.name().into(), Value::String(value.to_string()));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.0
            .insert(field.name().into(), Value::String(format!("{value:?}")));
    }
}

// ── Size-rotated file destination ─────────────────────────────────

pub struct RotatingFileWriter {
    path: PathBuf,
    file: Option<File>,
    size: u64,
    max_bytes: u64,
    backup_count: u32,
    warned: bool,
}

impl RotatingFileWriter {
    pub fn open(config: &LogConfig) -> Option<Self> {
        std::fs::create_dir_all(&config.dir).ok()?;
        let path = config.dir.join(&config.file);
        let file = OpenOptions::new().create(true).append(true).open(&path).ok()?;
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);
        Some(Self {
            path,
            file: Some(file),
            size,
            max_bytes: config.max_bytes,
            backup_count: config.backup_count,
            warned: false,
        })
    }

    fn write_line(&mut self, line: &str) {
        if self.file.is_none() {
            return;
        }
        let len = line.len() as u64 + 1;
        if self.size + len > self.max_bytes {
            if let Err(e) = self.rotate() {
                self.degrade(&e);
                return;
            }
        }
        let file = self.file.as_mut().unwrap();
        match writeln!(file, "{line}") {
            Ok(()) => self.size += len,
            Err(e) => self.degrade(&e),
        }
    }

    /// Shift `file.N` → `file.N+1`, current → `file.1`, open a fresh file.
    fn rotate(&mut self) -> std::io::Result<()> {
        self.file = None;
        for n in (1..self.backup_count).rev() {
            let from = self.backup_path(n);
            if from.exists() {
                std::fs::rename(&from, self.backup_path(n + 1))?;
            }
        }
        if self.backup_count > 0 {
            std::fs::rename(&self.path, self.backup_path(1))?;
        } else {
            std::fs::remove_file(&self.path)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.file = Some(file);
        self.size = 0;
        Ok(())
    }

    fn backup_path(&self, n: u32) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    fn degrade(&mut self, err: &std::io::Error) {
        self.file = None;
        if !self.warned {
            self.warned = true;
            eprintln!(
                "{{\"level\":\"warn\",\"message\":\"log file destination failed, stderr only\",\"error\":{:?}}}",
                err.to_string()
            );
        }
    }
}
