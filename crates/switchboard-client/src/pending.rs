//! Pending command table.
//!
//! Tracks commands that are awaiting a response from the target. Each entry
//! carries its own deadline; the waiting caller sleeps until that deadline
//! and then asks the table what happened via [`PendingTable::on_deadline`].
//! Progress frames move the deadline forward with [`PendingTable::touch`].

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::DispatchError;

pub type Outcome = Result<Value, DispatchError>;

/// Cap for deadlines that would not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Where an entry sits in its timeout state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutState {
    Waiting,
    /// Deadline extended `n` times without a response.
    Extended(u32),
}

/// A command awaiting its response.
#[derive(Debug)]
pub struct PendingEntry {
    /// Correlation id.
    pub id: String,
    /// Command name.
    pub command: String,
    /// When the command was registered.
    pub created_at: Instant,
    /// Last registration, extension or progress frame.
    pub last_activity: Instant,
    /// When the waiter next checks in.
    pub deadline: Instant,
    /// Current wait; grows on each extension.
    pub wait: Duration,
    pub remaining_extensions: u32,
    pub state: TimeoutState,
    responder: oneshot::Sender<Outcome>,
}

/// Result of checking an entry whose deadline has been reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadlineCheck {
    /// The deadline moved (progress) and has not been reached yet.
    NotYet(Instant),
    /// An extension was granted; wait until the new deadline.
    Extended { deadline: Instant, remaining: u32 },
    /// No extensions left; the caller has been rejected with a timeout.
    Expired { elapsed: Duration },
    /// The entry was already resolved or rejected.
    Gone,
}

/// Pending commands keyed by correlation id.
#[derive(Debug)]
pub struct PendingTable {
    entries: HashMap<String, PendingEntry>,
    extension_factor: f64,
}

impl PendingTable {
    /// Factors that are not finite or below 1.0 fall back to 1.0.
    pub fn new(extension_factor: f64) -> Self {
        let extension_factor = if extension_factor.is_finite() && extension_factor >= 1.0 {
            extension_factor
        } else {
            warn!(extension_factor, "Invalid extension factor, using 1.0");
            1.0
        };
        Self {
            entries: HashMap::new(),
            extension_factor,
        }
    }

    /// Register a command and return the receiver its caller awaits.
    pub fn register(
        &mut self,
        id: &str,
        command: &str,
        timeout: Duration,
        max_extensions: u32,
        now: Instant,
    ) -> oneshot::Receiver<Outcome> {
        let (responder, rx) = oneshot::channel();
        let entry = PendingEntry {
            id: id.to_string(),
            command: command.to_string(),
            created_at: now,
            last_activity: now,
            deadline: deadline_after(now, timeout),
            wait: timeout,
            remaining_extensions: max_extensions,
            state: TimeoutState::Waiting,
            responder,
        };
        if self.entries.insert(id.to_string(), entry).is_some() {
            warn!(request_id = id, "Replaced pending request with duplicate id");
        }
        debug!(request_id = id, command, timeout_ms = as_ms(timeout), "Registered pending request");
        rx
    }

    /// Decide what happens to `id` at `now`, once its deadline has passed.
    pub fn on_deadline(&mut self, id: &str, now: Instant) -> DeadlineCheck {
        let Some(entry) = self.entries.get_mut(id) else {
            return DeadlineCheck::Gone;
        };

        if now < entry.deadline {
            return DeadlineCheck::NotYet(entry.deadline);
        }

        if entry.remaining_extensions > 0 {
            entry.remaining_extensions -= 1;
            entry.wait = grow(entry.wait, self.extension_factor);
            entry.deadline = deadline_after(now, entry.wait);
            entry.last_activity = now;
            entry.state = match entry.state {
                TimeoutState::Waiting => TimeoutState::Extended(1),
                TimeoutState::Extended(n) => TimeoutState::Extended(n.saturating_add(1)),
            };
            info!(
                request_id = id,
                command = %entry.command,
                remaining = entry.remaining_extensions,
                wait_ms = as_ms(entry.wait),
                "Extending command deadline"
            );
            return DeadlineCheck::Extended {
                deadline: entry.deadline,
                remaining: entry.remaining_extensions,
            };
        }

        let Some(entry) = self.entries.remove(id) else {
            return DeadlineCheck::Gone;
        };
        let elapsed = now.saturating_duration_since(entry.created_at);
        warn!(
            request_id = id,
            command = %entry.command,
            elapsed_ms = as_ms(elapsed),
            "Command timed out"
        );
        let _ = entry.responder.send(Err(DispatchError::Timeout {
            id: entry.id,
            command: entry.command,
            elapsed,
        }));
        DeadlineCheck::Expired { elapsed }
    }

    /// Progress keep-alive: push the deadline to `now + window`.
    ///
    /// Returns `false` when `id` is not pending.
    pub fn touch(&mut self, id: &str, window: Duration, now: Instant) -> bool {
        let Some(entry) = self.entries.get_mut(id) else {
            return false;
        };
        entry.last_activity = now;
        entry.deadline = deadline_after(now, window);
        debug!(request_id = id, window_ms = as_ms(window), "Deadline moved by progress");
        true
    }

    /// Remove `id` and hand `outcome` to its caller.
    pub fn complete(&mut self, id: &str, outcome: Outcome) -> bool {
        let Some(entry) = self.entries.remove(id) else {
            return false;
        };
        debug!(request_id = id, command = %entry.command, ok = outcome.is_ok(), "Completed pending request");
        entry.responder.send(outcome).is_ok()
    }

    /// Remove `id` without notifying its caller.
    pub fn remove(&mut self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Reject every pending caller with an error built by `make_error`.
    pub fn reject_all(&mut self, make_error: impl Fn() -> DispatchError) -> usize {
        let count = self.entries.len();
        for (_, entry) in self.entries.drain() {
            let _ = entry.responder.send(Err(make_error()));
        }
        if count > 0 {
            info!(count, "Rejected all pending requests");
        }
        count
    }

    pub fn get(&self, id: &str) -> Option<&PendingEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn deadline(&self, id: &str) -> Option<Instant> {
        self.entries.get(id).map(|e| e.deadline)
    }

    pub fn entries(&self) -> impl Iterator<Item = &PendingEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn deadline_after(now: Instant, wait: Duration) -> Instant {
    now.checked_add(wait)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

fn grow(wait: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(wait.as_secs_f64() * factor)
        .map_or(FAR_FUTURE, |grown| grown.min(FAR_FUTURE))
}

fn as_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    const SECOND: Duration = Duration::from_secs(1);

    #[test]
    fn extensions_run_out_before_expiry() {
        let mut table = PendingTable::new(1.5);
        let start = Instant::now();
        let mut rx = table.register("get_node-1", "get_node", SECOND, 3, start);

        let mut now = start + SECOND;
        for remaining in [2, 1, 0] {
            let DeadlineCheck::Extended { deadline, remaining: left } =
                table.on_deadline("get_node-1", now)
            else {
                panic!("expected extension");
            };
            assert_eq!(left, remaining);
            now = deadline;
        }
        assert_eq!(table.get("get_node-1").unwrap().state, TimeoutState::Extended(3));

        let DeadlineCheck::Expired { elapsed } = table.on_deadline("get_node-1", now) else {
            panic!("expected expiry");
        };
        // 1 + 1.5 + 2.25 + 3.375
        assert_eq!(elapsed, Duration::from_millis(8125));
        assert!(table.is_empty());
        match rx.try_recv().unwrap() {
            Err(DispatchError::Timeout { id, command, .. }) => {
                assert_eq!(id, "get_node-1");
                assert_eq!(command, "get_node");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn wait_grows_geometrically() {
        let mut table = PendingTable::new(1.5);
        let start = Instant::now();
        let _rx = table.register("a", "a", Duration::from_secs(2), 2, start);

        table.on_deadline("a", start + Duration::from_secs(2));
        assert_eq!(table.get("a").unwrap().wait, Duration::from_secs(3));
    }

    #[test]
    fn touch_defers_deadline() {
        let mut table = PendingTable::new(1.5);
        let start = Instant::now();
        let _rx = table.register("a", "export", SECOND, 0, start);

        let progress_at = start + Duration::from_millis(900);
        assert!(table.touch("a", Duration::from_secs(60), progress_at));

        let check = table.on_deadline("a", start + SECOND);
        assert_eq!(check, DeadlineCheck::NotYet(progress_at + Duration::from_secs(60)));
        assert_eq!(table.get("a").unwrap().last_activity, progress_at);
    }

    #[test]
    fn touch_unknown_id_creates_nothing() {
        let mut table = PendingTable::new(1.5);
        assert!(!table.touch("ghost", SECOND, Instant::now()));
        assert!(table.is_empty());
    }

    #[test]
    fn complete_resolves_once() {
        let mut table = PendingTable::new(1.5);
        let mut rx = table.register("a", "a", SECOND, 0, Instant::now());

        assert!(table.complete("a", Ok(json!(42))));
        assert!(!table.complete("a", Ok(json!(43))));
        assert_eq!(rx.try_recv().unwrap().unwrap(), json!(42));
        assert_eq!(table.on_deadline("a", Instant::now()), DeadlineCheck::Gone);
    }

    #[test]
    fn reject_all_drains_table() {
        let mut table = PendingTable::new(1.5);
        let now = Instant::now();
        let mut rx1 = table.register("a", "a", SECOND, 0, now);
        let mut rx2 = table.register("b", "b", SECOND, 0, now);

        assert_eq!(table.reject_all(|| DispatchError::ConnectionLost), 2);

        assert!(table.is_empty());
        assert!(matches!(rx1.try_recv().unwrap(), Err(DispatchError::ConnectionLost)));
        assert!(matches!(rx2.try_recv().unwrap(), Err(DispatchError::ConnectionLost)));
    }

    #[test]
    fn huge_timeout_is_capped() {
        let mut table = PendingTable::new(1.5);
        let start = Instant::now();
        let _rx = table.register("a", "a", Duration::MAX, 2, start);

        let deadline = table.deadline("a").unwrap();
        assert!(deadline > start + Duration::from_secs(86_400));
        assert!(matches!(
            table.on_deadline("a", start + SECOND),
            DeadlineCheck::NotYet(_)
        ));

        let DeadlineCheck::Extended { .. } = table.on_deadline("a", deadline) else {
            panic!("expected extension");
        };
        assert!(table.get("a").unwrap().wait <= FAR_FUTURE);
        assert!(table.touch("a", Duration::MAX, start));
    }

    #[test]
    fn invalid_factor_keeps_wait_unchanged() {
        for factor in [-1.0, f64::NAN, f64::INFINITY, 0.5] {
            let mut table = PendingTable::new(factor);
            let start = Instant::now();
            let _rx = table.register("a", "a", SECOND, 1, start);

            let DeadlineCheck::Extended { deadline, .. } = table.on_deadline("a", start + SECOND)
            else {
                panic!("expected extension for factor {factor}");
            };
            assert_eq!(deadline, start + SECOND + SECOND);
            assert_eq!(table.get("a").unwrap().wait, SECOND);
        }
    }

    #[test]
    fn remove_drops_caller_silently() {
        let mut table = PendingTable::new(1.5);
        let mut rx = table.register("a", "a", SECOND, 0, Instant::now());
        assert!(table.remove("a"));
        assert!(rx.try_recv().is_err());
    }
}
