use std::fmt::Display;
use std::sync::atomic::{AtomicUsize, Ordering};

const PREFIX: &str = "[tproxy]";

/// Log sink for one setup or cleanup operation.
///
/// Wraps `tracing` and carries the current retry attempt so that messages
/// emitted from the restore loop read `[tproxy] [try 2/5] ...`.
#[derive(Debug)]
pub struct Logger {
    current_try: AtomicUsize,
    max_try: AtomicUsize,
}

impl Logger {
    pub fn new(max_try: usize) -> Self {
        Self {
            current_try: AtomicUsize::new(0),
            max_try: AtomicUsize::new(max_try),
        }
    }

    pub fn set_try(&self, attempt: usize) {
        self.current_try.store(attempt, Ordering::Relaxed);
    }

    pub fn reset_try(&self) {
        self.current_try.store(0, Ordering::Relaxed);
    }

    pub fn try_prefix(&self) -> Option<String> {
        let current = self.current_try.load(Ordering::Relaxed);
        if current == 0 {
            return None;
        }
        let max = self.max_try.load(Ordering::Relaxed);
        Some(format!("[try {}/{}]", current, max))
    }

    pub fn info(&self, msg: impl Display) {
        tracing::info!("{} {}", PREFIX, msg);
    }

    pub fn warn(&self, msg: impl Display) {
        tracing::warn!("{} {}", PREFIX, msg);
    }

    /// Multi-line payloads such as rendered rules, without the prefix.
    pub fn info_raw(&self, msg: impl Display) {
        tracing::info!("{}", msg);
    }

    pub fn error_try(&self, msg: impl Display, err: &anyhow::Error) {
        match self.try_prefix() {
            Some(attempt) => tracing::error!("{} {} {}: {:#}", PREFIX, attempt, msg, err),
            None => tracing::error!("{} {}: {:#}", PREFIX, msg, err),
        }
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_prefix_tracks_attempts() {
        let logger = Logger::new(5);
        assert_eq!(logger.try_prefix(), None);

        logger.set_try(2);
        assert_eq!(logger.try_prefix().as_deref(), Some("[try 2/5]"));

        logger.reset_try();
        assert_eq!(logger.try_prefix(), None);
    }
}
