use tracing::debug;

use crate::events::CanonicalUpdate;

pub const DEFAULT_DEBOUNCE_WINDOW_MILLIS: u64 = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Forwarded,
    Suppressed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Window {
    Closed,
    /// Open until `last_submit_millis + window`.
    Open { last_submit_millis: u64 },
}

/// Leading-edge debounce in front of a publish sink.
///
/// The first submission after a quiet period goes straight to the sink and
/// opens a window. Submissions while the window is open are dropped and keep
/// it open; updates are full snapshots, so nothing needs to be queued.
pub struct DebouncedEmitter<F> {
    window_millis: u64,
    window: Window,
    sink: F,
}

impl<F> DebouncedEmitter<F>
where
    F: FnMut(CanonicalUpdate),
{
    pub fn new(window_millis: u64, sink: F) -> Self {
        Self {
            window_millis,
            window: Window::Closed,
            sink,
        }
    }

    pub fn submit(&mut self, update: CanonicalUpdate, now_millis: u64) -> Submission {
        if self.is_open(now_millis) {
            debug!(track = update.track_identifier(), "update suppressed by debounce window");
            self.window = Window::Open {
                last_submit_millis: now_millis,
            };
            return Submission::Suppressed;
        }

        self.window = Window::Open {
            last_submit_millis: now_millis,
        };
        (self.sink)(update);
        Submission::Forwarded
    }

    pub fn is_open(&self, now_millis: u64) -> bool {
        match self.window {
            Window::Closed => false,
            Window::Open { last_submit_millis } => {
                now_millis.saturating_sub(last_submit_millis) < self.window_millis
            }
        }
    }

    /// Close the window without emitting anything.
    pub fn cancel(&mut self) {
        self.window = Window::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn collecting(window: u64) -> (DebouncedEmitter<impl FnMut(CanonicalUpdate)>, Arc<Mutex<Vec<CanonicalUpdate>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sink = sent.clone();
        let emitter = DebouncedEmitter::new(window, move |u| sink.lock().unwrap().push(u));
        (emitter, sent)
    }

    #[test]
    fn burst_forwards_only_the_first() {
        let (mut emitter, sent) = collecting(400);
        assert_eq!(emitter.submit(CanonicalUpdate::new("A", 0, true), 1_000), Submission::Forwarded);
        assert_eq!(emitter.submit(CanonicalUpdate::new("A", 100, false), 1_150), Submission::Suppressed);
        assert_eq!(emitter.submit(CanonicalUpdate::new("B", 0, true), 1_500), Submission::Suppressed);
        assert_eq!(emitter.submit(CanonicalUpdate::new("C", 0, true), 1_850), Submission::Suppressed);

        let sent = sent.lock().unwrap();
        assert_eq!(sent.as_slice(), &[CanonicalUpdate::new("A", 0, true)]);
    }

    #[test]
    fn quiet_window_reopens_leading_edge() {
        let (mut emitter, sent) = collecting(400);
        emitter.submit(CanonicalUpdate::new("A", 0, true), 0);
        assert!(emitter.is_open(399));
        assert!(!emitter.is_open(400));
        assert_eq!(emitter.submit(CanonicalUpdate::new("A", 400, false), 400), Submission::Forwarded);
        assert_eq!(sent.lock().unwrap().len(), 2);
    }

    #[test]
    fn cancel_closes_without_emitting() {
        let (mut emitter, sent) = collecting(400);
        emitter.submit(CanonicalUpdate::new("A", 0, true), 0);
        emitter.submit(CanonicalUpdate::new("B", 0, true), 100);
        emitter.cancel();
        assert_eq!(sent.lock().unwrap().len(), 1);
        assert_eq!(emitter.submit(CanonicalUpdate::new("C", 0, true), 150), Submission::Forwarded);
        assert_eq!(sent.lock().unwrap().last().unwrap().track_identifier(), "C");
    }
}
