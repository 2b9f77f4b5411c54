//! In-step control signals.
//!
//! A step may request at most one post-step transition: finish the
//! instance, pause it, or jump to another step. The signals form a small
//! sum type with a fixed precedence (done beats stop beats goto) that the
//! driver applies once per step. Script bindings and native callables
//! both write through a shared [`Controls`] cell; the driver drains it
//! after every step body, so a stale signal can never leak into the next
//! step.

use flowline_types::ContextMap;
use parking_lot::Mutex;
use serde_json::Value;

/// The transition a step requested, after precedence resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// No signal: fall through to branch evaluation / advance.
    None,
    /// Finish the instance now.
    Done,
    /// Pause the instance after this step.
    Stop,
    /// Jump to the given step index and keep driving.
    Goto(usize),
}

#[derive(Default)]
struct ControlState {
    done: bool,
    stop: bool,
    go_to: Option<usize>,
    pins: Vec<(String, Value)>,
}

/// Shared signal cell between the driver, native callables and the
/// script runtime's host bindings.
#[derive(Default)]
pub struct Controls {
    state: Mutex<ControlState>,
}

impl Controls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request that the instance finish after the current step.
    pub fn signal_done(&self) {
        self.state.lock().done = true;
    }

    /// Request that the instance pause after the current step.
    pub fn signal_stop(&self) {
        self.state.lock().stop = true;
    }

    /// Request a jump to `step` after the current step.
    pub fn signal_goto(&self, step: usize) {
        self.state.lock().go_to = Some(step);
    }

    /// Record a pinned-data entry written by a script.
    pub fn pin(&self, key: String, value: Value) {
        self.state.lock().pins.push((key, value));
    }

    /// Consume the pending signal, applying the precedence rule:
    /// done beats stop beats goto. Clears all signals.
    pub fn take(&self) -> Signal {
        let mut state = self.state.lock();
        let signal = if state.done {
            Signal::Done
        } else if state.stop {
            Signal::Stop
        } else if let Some(step) = state.go_to {
            Signal::Goto(step)
        } else {
            Signal::None
        };
        state.done = false;
        state.stop = false;
        state.go_to = None;
        signal
    }

    /// Drain pinned-data entries recorded since the last drain.
    pub fn drain_pins(&self, into: &mut ContextMap) {
        for (key, value) in self.state.lock().pins.drain(..) {
            into.insert(key, value);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn take_returns_none_when_nothing_signalled() {
        let controls = Controls::new();
        assert_eq!(controls.take(), Signal::None);
    }

    #[test]
    fn done_beats_stop_beats_goto() {
        let controls = Controls::new();
        controls.signal_goto(3);
        controls.signal_stop();
        controls.signal_done();
        assert_eq!(controls.take(), Signal::Done);

        controls.signal_goto(3);
        controls.signal_stop();
        assert_eq!(controls.take(), Signal::Stop);

        controls.signal_goto(3);
        assert_eq!(controls.take(), Signal::Goto(3));
    }

    #[test]
    fn take_clears_every_signal() {
        let controls = Controls::new();
        controls.signal_done();
        controls.signal_stop();
        controls.signal_goto(1);
        assert_eq!(controls.take(), Signal::Done);
        // A consumed signal must not reappear on the next step.
        assert_eq!(controls.take(), Signal::None);
    }

    #[test]
    fn pins_drain_into_map() {
        let controls = Controls::new();
        controls.pin("token".into(), json!("abc"));
        controls.pin("count".into(), json!(2));

        let mut pinned = ContextMap::new();
        controls.drain_pins(&mut pinned);
        assert_eq!(pinned["token"], json!("abc"));
        assert_eq!(pinned["count"], json!(2));

        let mut again = ContextMap::new();
        controls.drain_pins(&mut again);
        assert!(again.is_empty());
    }
}
