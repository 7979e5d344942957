//! Utilities for logging.
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    HumanReadable,
    Compact,
    Json,
}

/// Configure the global logger.
///
/// `RUST_LOG` takes precedence over the provided level when set. Calling this
/// more than once is a no-op; the first subscriber wins.
pub fn configure_global_logger<W>(default_level: Level, format: LogFormat, writer: W)
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(default_level).into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_thread_ids(true);

    let result = match format {
        LogFormat::HumanReadable => builder.try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    if let Err(e) = result {
        // Another subscriber was already installed, keep it.
        eprintln!("Failed to set global subscriber: {e}");
    }
}

/// Configure logging for tests.
///
/// Output goes through the test writer so it's only shown for failing tests.
pub fn init_test() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::DEBUG.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, Default)]
struct CapturedWriter(Arc<Mutex<Vec<u8>>>);

impl io::Write for CapturedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run `f` with a thread local subscriber, returning everything it logged
/// at `level` or above.
pub fn capture<F: FnOnce()>(level: Level, f: F) -> String {
    let writer = CapturedWriter::default();
    let make_writer = writer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_ansi(false)
        .with_writer(move || make_writer.clone())
        .finish();

    tracing::subscriber::with_default(subscriber, f);

    let buf = writer.0.lock();
    String::from_utf8_lossy(&buf).into_owned()
}
