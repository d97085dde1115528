//! Notification collaborator
//!
//! Async-mode batches report completion out of band through this
//! interface; the default implementation forwards to the log facade.

use log::{log, Level};

pub trait Notifier: Send + Sync {
    fn notify(&self, level: Level, message: &str);
}

/// Log-backed notifier used when no external notification transport is
/// configured.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, level: Level, message: &str) {
        log!(target: "modserve::notify", level, "{message}");
    }
}
