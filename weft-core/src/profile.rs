//! Profiling hooks
//!
//! Process-wide, strictly observational bracketing: hosts call [`start`] and
//! [`stop`] around a pass and drop [`mark`]s inside it. Marks record the
//! elapsed time since `start` and are also emitted as trace events. Nothing
//! in the engine consults this state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

static ACTIVE: AtomicBool = AtomicBool::new(false);
static SESSION: Mutex<Session> = Mutex::new(Session {
    started: None,
    marks: Vec::new(),
});

struct Session {
    started: Option<Instant>,
    marks: Vec<(&'static str, Duration)>,
}

/// Begin a profiling session. A second `start` restarts the clock.
pub fn start() {
    let mut session = SESSION.lock();
    session.started = Some(Instant::now());
    session.marks.clear();
    ACTIVE.store(true, Ordering::Release);
    trace!("profiling started");
}

/// End the session, returning the marks recorded since [`start`].
pub fn stop() -> Vec<(&'static str, Duration)> {
    ACTIVE.store(false, Ordering::Release);
    let mut session = SESSION.lock();
    session.started = None;
    trace!(marks = session.marks.len(), "profiling stopped");
    std::mem::take(&mut session.marks)
}

/// Record a named mark at the current elapsed time. No-op outside a session.
pub fn mark(label: &'static str) {
    if !ACTIVE.load(Ordering::Acquire) {
        return;
    }
    let mut session = SESSION.lock();
    if let Some(started) = session.started {
        let elapsed = started.elapsed();
        trace!(label, ?elapsed, "profile mark");
        session.marks.push((label, elapsed));
    }
}

/// Discard all recorded state and deactivate.
pub fn reset() {
    ACTIVE.store(false, Ordering::Release);
    let mut session = SESSION.lock();
    session.started = None;
    session.marks.clear();
}
