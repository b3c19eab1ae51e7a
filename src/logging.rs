use crate::types::{EventKind, NegotiationEvent};
use std::panic;
use std::path::Path;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;

pub const LOG_FILE_NAME: &str = "parley.log";

/// Installs the global subscriber: rolling file log, optional stderr output, span traces.
///
/// The returned guard flushes the file writer when dropped; keep it alive for the whole run.
pub fn init_tracing(log_dir: &Path, verbose: bool) -> std::io::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => "parley=info".into(),
    };

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = if verbose {
        Some(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .with(stderr_layer)
        .with(tracing_error::ErrorLayer::default())
        .init();

    Ok(guard)
}

/// Sets up a global panic hook that logs panics using tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Per-stream counters, summarized once the stream ends.
#[derive(Default, Debug)]
pub struct StreamMetric {
    pub frames: usize,
    pub offers: usize,
    pub declines: usize,
    pub unknown: usize,
    pub parse_errors: usize,
    pub parties: Vec<String>,
}

impl StreamMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event(&mut self, event: &NegotiationEvent) {
        self.frames += 1;
        match &event.kind {
            EventKind::OfferReceived { offer, .. } => {
                self.offers += 1;
                if !self.parties.contains(&offer.party.0) {
                    self.parties.push(offer.party.0.clone());
                }
            }
            EventKind::OfferDeclined { .. } => self.declines += 1,
            EventKind::Unknown { .. } => self.unknown += 1,
            EventKind::ParseError { .. } => self.parse_errors += 1,
            _ => {}
        }
    }

    /// Logged inside the stream's span, which carries the stream id.
    pub fn log_summary(&self, status: &str) {
        let offers_str = if self.parties.is_empty() {
            format!("{}", self.offers)
        } else {
            format!("{} ({})", self.offers, self.parties.join(", "))
        };

        info!(
            target: "flight_recorder",
            "[STREAM END] Status: {} | Frames: {} | Offers: {} | Declines: {} | Unknown: {} | ParseErrors: {}",
            status, self.frames, offers_str, self.declines, self.unknown, self.parse_errors
        );
    }
}
