use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use file_rotate::{
    compression::Compression,
    suffix::{AppendTimestamp, FileLimit},
    ContentLimit, FileRotate,
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

fn level_filter(level: &str) -> Option<EnvFilter> {
    match level.to_ascii_lowercase().as_str() {
        "off" | "none" => None,
        other => Some(EnvFilter::new(other.to_string())),
    }
}

/// Writer handing out handles to one shared rotating log file.
#[derive(Clone)]
struct RotWriter(Arc<Mutex<FileRotate<AppendTimestamp>>>);

impl Write for RotWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.0.lock() {
            Ok(mut f) => f.write(buf),
            Err(_) => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.0.lock() {
            Ok(mut f) => f.flush(),
            Err(_) => Ok(()),
        }
    }
}

impl<'a> fmt::MakeWriter<'a> for RotWriter {
    type Writer = RotWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Initialize tracing with a console layer and an optional rotating file
/// layer. Safe to call more than once; later calls are no-ops.
///
/// `RUST_LOG` takes precedence over the configured console level.
pub fn init_logging(cfg: &LoggingConfig, base_dir: &Path) {
    let console_filter = EnvFilter::try_from_default_env()
        .ok()
        .or_else(|| level_filter(&cfg.console_level));

    let console_layer = console_filter.map(|filter| {
        fmt::layer()
            .with_target(true)
            .with_writer(std::io::stdout)
            .with_filter(filter)
    });

    let file_layer = cfg.file.as_deref().and_then(|file| {
        let path = base_dir.join(file);
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                eprintln!("cannot create log directory {}: {e}", parent.display());
                return None;
            }
        }
        let rotate = FileRotate::new(
            &path,
            AppendTimestamp::default(FileLimit::MaxFiles(cfg.max_backups.unwrap_or(3))),
            ContentLimit::BytesSurpassed(cfg.max_size_mb.unwrap_or(100) as usize * 1024 * 1024),
            Compression::None,
            #[cfg(unix)]
            None,
        );
        let filter = level_filter(cfg.file_level.as_deref().unwrap_or(&cfg.console_level))?;
        Some(
            fmt::layer()
                .with_ansi(false)
                .with_writer(RotWriter(Arc::new(Mutex::new(rotate))))
                .with_filter(filter),
        )
    });

    // Bridge records emitted through the `log` facade.
    let _ = tracing_log::LogTracer::init();

    let _ = tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init();
}
