use minfac::ServiceProvider;
use rigi::{LogConfig, LogTopic};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

use self::logfile_writer::SizeRotatingWriter;

mod logfile_writer;

/// Initialises the subscriber from the resolved [`LogConfig`] and the
/// [`LogTopic`] defaults the registered crates contributed. Returns the
/// file worker guard which must stay alive for the process lifetime.
///
/// A second initialisation (integration tests build several runtimes in
/// one process) is reported but not fatal.
pub(super) fn init(provider: &ServiceProvider) -> Option<WorkerGuard> {
    let config = provider
        .get::<LogConfig>()
        .expect("LogConfig is registered by the runtime");
    let topics: Vec<LogTopic> = provider.get_all::<LogTopic>().collect();
    let filter = config.filter_string(topics.iter());

    let console_layer = (!config.structured()).then(|| {
        tracing_subscriber::fmt::layer()
            .with_line_number(true)
            .compact()
            .with_filter(EnvFilter::new(&filter))
    });
    let structured_layer = config.structured().then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_line_number(true)
            .with_filter(EnvFilter::new(&filter))
    });

    let (file_layer, guard) = match config.file() {
        Some(file) => {
            let (writer, guard) = tracing_appender::non_blocking(SizeRotatingWriter::new(
                &file.path,
                file.max_bytes,
                file.backups,
            ));
            let layer = if config.structured() {
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_line_number(true)
                    .with_filter(EnvFilter::new(&filter))
                    .boxed()
            } else {
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .compact()
                    .with_ansi(false)
                    .with_line_number(true)
                    .with_filter(EnvFilter::new(&filter))
                    .boxed()
            };
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let result = tracing_subscriber::registry()
        .with(console_layer)
        .with(structured_layer)
        .with(file_layer)
        .try_init();

    match result {
        Ok(()) => {
            if let Some(file) = config.file() {
                info!(
                    "Recording logs into {:?} ({} bytes per file, {} backups)",
                    file.path, file.max_bytes, file.backups
                );
            }
            guard
        }
        Err(_) => {
            // Another subscriber already owns this process
            None
        }
    }
}
