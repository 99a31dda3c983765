use std::path::Path;
use std::sync::Arc;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::reload;
use tracing_subscriber::Registry;

/// Runtime handle to the subscriber's level filter, flipped by SIGUSR2.
#[derive(Clone)]
pub struct LogControl {
    handle: reload::Handle<LevelFilter, Registry>,
    // The handle only holds a weak reference; a detached control owns
    // its layer here so modify() keeps working.
    _standalone: Option<Arc<reload::Layer<LevelFilter, Registry>>>,
}

impl LogControl {
    /// Handle not wired to any subscriber; toggling only flips the
    /// stored level. Lets a control interface be built without the
    /// global logger.
    pub fn detached() -> LogControl {
        let (layer, handle) = reload::Layer::new(LevelFilter::INFO);
        LogControl {
            handle,
            _standalone: Some(Arc::new(layer)),
        }
    }

    /// Toggles INFO <-> DEBUG and returns the name of the level now in
    /// effect.
    pub fn toggle(&self) -> &'static str {
        let mut level = "INFO";
        let result = self.handle.modify(|filter| {
            if *filter == LevelFilter::DEBUG {
                *filter = LevelFilter::INFO;
            } else {
                *filter = LevelFilter::DEBUG;
                level = "DEBUG";
            }
        });
        match result {
            Ok(()) => level,
            Err(_) => "unchanged",
        }
    }
}

/*
    @@@
    @logs_tracing();
    . Creates a daily-rotating log file (<log_dir>/taskmaster.log) and wraps it in a non-blocking writer.
    . Configures a tracing subscriber to log INFO-level events (with timestamps, thread IDs, and targets) through a reloadable level filter.
    . Keeps the appender alive by returning the guard, plus the LogControl handle for the runtime verbosity toggle.
*/
pub fn logs_tracing(log_dir: &Path) -> (WorkerGuard, LogControl) {
    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, "taskmaster.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let (filter, handle) = reload::Layer::new(LevelFilter::INFO);
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(non_blocking);

    let subscriber = tracing_subscriber::registry().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set global subscriber");

    (guard, LogControl { handle, _standalone: None })
}
