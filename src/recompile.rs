//! Debounced recompilation
//!
//! Bursts of edits collapse into one compile once the quiet period has
//! passed. The caller supplies the clock, so this never sleeps or spawns.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct Recompiler {
    quiet: Duration,
    pending_since: Option<Instant>,
    last_edit: Option<Instant>,
    compiles: u64,
}

impl Recompiler {
    pub fn new(quiet: Duration) -> Self {
        Self { quiet, pending_since: None, last_edit: None, compiles: 0 }
    }

    pub fn from_millis(ms: u64) -> Self {
        Self::new(Duration::from_millis(ms))
    }

    pub fn note_edit(&mut self, now: Instant) {
        self.pending_since.get_or_insert(now);
        self.last_edit = Some(now);
    }

    pub fn is_pending(&self) -> bool {
        self.pending_since.is_some()
    }

    /// Number of compiles run so far.
    pub fn compiles(&self) -> u64 {
        self.compiles
    }

    /// Run `compile` if edits are pending and none arrived within the quiet period.
    pub fn poll<T>(&mut self, now: Instant, compile: impl FnOnce() -> T) -> Option<T> {
        let last = self.last_edit?;
        if now.saturating_duration_since(last) < self.quiet {
            return None;
        }
        Some(self.run(compile))
    }

    /// Compile now if anything is pending.
    pub fn flush<T>(&mut self, compile: impl FnOnce() -> T) -> Option<T> {
        self.last_edit?;
        Some(self.run(compile))
    }

    fn run<T>(&mut self, compile: impl FnOnce() -> T) -> T {
        if let Some(since) = self.pending_since.take() {
            let burst = self.last_edit.map(|l| l.saturating_duration_since(since));
            tracing::debug!(
                burst_ms = burst.map_or(0, |d| d.as_millis() as u64),
                "recompiling after edits"
            );
        }
        self.last_edit = None;
        self.compiles += 1;
        compile()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_compiles_once() {
        let start = Instant::now();
        let mut r = Recompiler::from_millis(300);

        r.note_edit(start);
        r.note_edit(start + Duration::from_millis(100));
        r.note_edit(start + Duration::from_millis(200));

        assert_eq!(r.poll(start + Duration::from_millis(400), || "x"), None);
        assert_eq!(r.poll(start + Duration::from_millis(500), || "x"), Some("x"));
        assert_eq!(r.poll(start + Duration::from_millis(900), || "x"), None);
        assert_eq!(r.compiles(), 1);
        assert!(!r.is_pending());
    }

    #[test]
    fn test_flush_only_when_pending() {
        let mut r = Recompiler::from_millis(300);
        assert_eq!(r.flush(|| 1), None);
        r.note_edit(Instant::now());
        assert_eq!(r.flush(|| 1), Some(1));
        assert_eq!(r.compiles(), 1);
    }
}
