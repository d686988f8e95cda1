//! Command filters
//!
//! Staleness and dedup decide whether a received command is applied at
//! all; the play guard throttles plays synthesized from snapshots; the
//! remote-execution guard keeps applied commands from echoing back.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::protocol::{CommandKind, PlaybackCommand, ReceivedCommand};

/// Outcome of running a command through the inbound filters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Apply,
    Stale { age_ms: u64 },
    Duplicate,
}

/// Last executed command of one kind
#[derive(Debug, Clone)]
struct ExecutedRecord {
    command: PlaybackCommand,
    executed_at_ms: u64,
}

/// Staleness + dedup filter over locally executed commands
#[derive(Debug)]
pub struct CommandFilter {
    stale_after_ms: u64,
    dedup_window_ms: u64,
    last_executed: HashMap<CommandKind, ExecutedRecord>,
}

impl CommandFilter {
    pub fn new(stale_after_ms: u64, dedup_window_ms: u64) -> Self {
        Self {
            stale_after_ms,
            dedup_window_ms,
            last_executed: HashMap::new(),
        }
    }

    /// Decide whether `received` should be applied now.
    ///
    /// `tolerance_ms` is the current drift tolerance; positional commands
    /// closer than that to the last executed one are equivalent.
    pub fn admit(&self, received: &ReceivedCommand, now_ms: u64, tolerance_ms: u64) -> Admission {
        let age_ms = received.age_ms(now_ms);
        if age_ms > self.stale_after_ms {
            return Admission::Stale { age_ms };
        }

        let command = &received.command;
        let Some(last) = self.last_executed.get(&command.kind()) else {
            return Admission::Apply;
        };

        if now_ms.saturating_sub(last.executed_at_ms) >= self.dedup_window_ms {
            return Admission::Apply;
        }

        if is_equivalent(&last.command, command, tolerance_ms) {
            Admission::Duplicate
        } else {
            Admission::Apply
        }
    }

    /// Remember `command` as the last executed of its kind
    pub fn mark_executed(&mut self, command: &PlaybackCommand, now_ms: u64) {
        self.last_executed.insert(
            command.kind(),
            ExecutedRecord {
                command: command.clone(),
                executed_at_ms: now_ms,
            },
        );
    }

    /// Forget everything (group left or a new session started)
    pub fn reset(&mut self) {
        self.last_executed.clear();
    }
}

/// Equivalence is positional, not byte equality: authorities re-broadcast
/// state with slightly different positions.
fn is_equivalent(last: &PlaybackCommand, new: &PlaybackCommand, tolerance_ms: u64) -> bool {
    match (last, new) {
        (PlaybackCommand::Pause { position_ms: a }, PlaybackCommand::Pause { position_ms: b })
        | (PlaybackCommand::Unpause { position_ms: a }, PlaybackCommand::Unpause { position_ms: b })
        | (PlaybackCommand::Seek { position_ms: a }, PlaybackCommand::Seek { position_ms: b }) => {
            a.abs_diff(*b) < tolerance_ms
        }
        (PlaybackCommand::Play { .. }, PlaybackCommand::Play { .. })
        | (PlaybackCommand::Buffering { .. }, PlaybackCommand::Buffering { .. }) => {
            last.leading_item() == new.leading_item()
        }
        (PlaybackCommand::SetRate { rate: a }, PlaybackCommand::SetRate { rate: b }) => {
            (a - b).abs() < f64::EPSILON
        }
        (PlaybackCommand::Stop, PlaybackCommand::Stop) => true,
        _ => false,
    }
}

/// Last emitted synthesized Play
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayRecord {
    pub item_id: String,
    pub position_ms: u64,
    pub timestamp_ms: u64,
    hash: u64,
}

/// Suppresses repeated synthesized plays while the explicit command
/// channel is also active.
#[derive(Debug)]
pub struct PlayGuard {
    window_ms: u64,
    last: Option<PlayRecord>,
}

impl PlayGuard {
    pub fn new(window_ms: u64) -> Self {
        Self { window_ms, last: None }
    }

    fn hash_of(item_id: &str, start_index: usize) -> u64 {
        let mut hasher = DefaultHasher::new();
        item_id.hash(&mut hasher);
        start_index.hash(&mut hasher);
        hasher.finish()
    }

    /// Returns true (and records the emission) when the candidate may be emitted
    pub fn try_emit(&mut self, item_id: &str, start_index: usize, position_ms: u64, now_ms: u64) -> bool {
        let hash = Self::hash_of(item_id, start_index);

        if let Some(last) = &self.last {
            let elapsed = now_ms.saturating_sub(last.timestamp_ms);
            if last.hash == hash && elapsed < self.window_ms {
                debug!("Suppressing synthesized play of {} ({}ms since last)", item_id, elapsed);
                return false;
            }
        }

        self.last = Some(PlayRecord {
            item_id: item_id.to_string(),
            position_ms,
            timestamp_ms: now_ms,
            hash,
        });
        true
    }

    pub fn last(&self) -> Option<&PlayRecord> {
        self.last.as_ref()
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[derive(Debug, Default)]
struct GuardSlot {
    engaged_at: Option<Instant>,
    generation: u64,
}

/// Flag raised while a remote command is being applied to the player.
///
/// The local-change observer ignores player events while it is raised.
/// A watchdog clears it after `timeout` even if the apply path never
/// finished.
#[derive(Debug)]
pub struct RemoteExecutionGuard {
    timeout: Duration,
    slot: Mutex<GuardSlot>,
}

impl RemoteExecutionGuard {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            slot: Mutex::new(GuardSlot::default()),
        }
    }

    /// Raise the flag until the returned token is dropped
    pub fn engage(&self) -> RemoteExecution<'_> {
        let mut slot = self.slot.lock();
        slot.generation = slot.generation.wrapping_add(1);
        slot.engaged_at = Some(Instant::now());
        RemoteExecution {
            guard: self,
            generation: slot.generation,
        }
    }

    /// Whether local player events should currently be ignored
    pub fn is_active(&self) -> bool {
        let mut slot = self.slot.lock();
        match slot.engaged_at {
            Some(at) if at.elapsed() >= self.timeout => {
                warn!(
                    "Remote execution flag held for {:?}, clearing it (apply path did not finish)",
                    at.elapsed()
                );
                slot.engaged_at = None;
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    fn release(&self, generation: u64) {
        let mut slot = self.slot.lock();
        // A newer engagement owns the flag now
        if slot.generation == generation {
            slot.engaged_at = None;
        }
    }
}

/// Token returned by [`RemoteExecutionGuard::engage`]
#[must_use = "the flag is lowered when this token is dropped"]
pub struct RemoteExecution<'a> {
    guard: &'a RemoteExecutionGuard,
    generation: u64,
}

impl Drop for RemoteExecution<'_> {
    fn drop(&mut self) {
        self.guard.release(self.generation);
    }
}

/// Staleness check used outside the filter (e.g. for synthesized commands)
pub fn is_stale(received_at_ms: u64, now_ms: u64, stale_after_ms: u64) -> bool {
    now_ms.saturating_sub(received_at_ms) > stale_after_ms
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOLERANCE: u64 = 500;

    fn filter() -> CommandFilter {
        CommandFilter::new(5000, 5000)
    }

    fn received(command: PlaybackCommand, at: u64) -> ReceivedCommand {
        ReceivedCommand::new(command, at)
    }

    #[test]
    fn test_stale_commands_are_never_applied() {
        let f = filter();
        let cmd = received(PlaybackCommand::Seek { position_ms: 1000 }, 10_000);
        assert_eq!(f.admit(&cmd, 15_000, TOLERANCE), Admission::Apply);
        assert_eq!(f.admit(&cmd, 15_001, TOLERANCE), Admission::Stale { age_ms: 5001 });
        assert!(is_stale(0, 5001, 5000));
        assert!(!is_stale(0, 5000, 5000));
    }

    #[test]
    fn test_repeated_unpause_is_dropped() {
        let mut f = filter();
        let first = received(PlaybackCommand::Unpause { position_ms: 5000 }, 1000);
        assert_eq!(f.admit(&first, 1000, TOLERANCE), Admission::Apply);
        f.mark_executed(&first.command, 1000);

        let second = received(PlaybackCommand::Unpause { position_ms: 5000 }, 3000);
        assert_eq!(f.admit(&second, 3000, TOLERANCE), Admission::Duplicate);
    }

    #[test]
    fn test_near_seeks_collapse_but_far_seeks_apply() {
        let mut f = filter();
        let first = received(PlaybackCommand::Seek { position_ms: 60_000 }, 0);
        f.mark_executed(&first.command, 0);

        let near = received(PlaybackCommand::Seek { position_ms: 60_300 }, 1000);
        assert_eq!(f.admit(&near, 1000, TOLERANCE), Admission::Duplicate);

        let far = received(PlaybackCommand::Seek { position_ms: 90_000 }, 1000);
        assert_eq!(f.admit(&far, 1000, TOLERANCE), Admission::Apply);
    }

    #[test]
    fn test_dedup_window_expires() {
        let mut f = filter();
        f.mark_executed(&PlaybackCommand::Pause { position_ms: 100 }, 0);
        let again = received(PlaybackCommand::Pause { position_ms: 100 }, 5000);
        assert_eq!(f.admit(&again, 5000, TOLERANCE), Admission::Apply);
    }

    #[test]
    fn test_dedup_is_per_kind() {
        let mut f = filter();
        f.mark_executed(&PlaybackCommand::Pause { position_ms: 100 }, 0);
        let unpause = received(PlaybackCommand::Unpause { position_ms: 100 }, 10);
        assert_eq!(f.admit(&unpause, 10, TOLERANCE), Admission::Apply);
    }

    #[test]
    fn test_play_equivalence_uses_leading_item() {
        let mut f = filter();
        let play = |ids: &[&str], index: usize| PlaybackCommand::Play {
            item_ids: ids.iter().map(|s| s.to_string()).collect(),
            start_index: index,
            start_position_ms: 0,
        };
        f.mark_executed(&play(&["A", "B"], 0), 0);

        assert_eq!(f.admit(&received(play(&["A", "C"], 0), 100), 100, TOLERANCE), Admission::Duplicate);
        assert_eq!(f.admit(&received(play(&["A", "B"], 1), 100), 100, TOLERANCE), Admission::Apply);

        f.reset();
        assert_eq!(f.admit(&received(play(&["A", "B"], 0), 100), 100, TOLERANCE), Admission::Apply);
    }

    #[test]
    fn test_play_guard_hash_and_window() {
        let mut guard = PlayGuard::new(10_000);
        assert!(guard.try_emit("A", 0, 0, 1000));
        assert!(!guard.try_emit("A", 0, 0, 5000));
        // Different index is a different play
        assert!(guard.try_emit("A", 1, 0, 5000));
        assert!(guard.try_emit("A", 0, 0, 6000));
        assert!(!guard.try_emit("A", 0, 0, 15_999));
        assert!(guard.try_emit("A", 0, 0, 16_000));
        assert_eq!(guard.last().map(|r| r.timestamp_ms), Some(16_000));
    }

    #[test]
    fn test_remote_guard_token_lowers_flag() {
        let guard = RemoteExecutionGuard::new(Duration::from_secs(5));
        assert!(!guard.is_active());
        {
            let _token = guard.engage();
            assert!(guard.is_active());
        }
        assert!(!guard.is_active());
    }

    #[test]
    fn test_remote_guard_watchdog_clears_flag() {
        let guard = RemoteExecutionGuard::new(Duration::from_millis(20));
        let token = guard.engage();
        assert!(guard.is_active());
        std::thread::sleep(Duration::from_millis(40));
        assert!(!guard.is_active());
        drop(token);
        assert!(!guard.is_active());
    }

    #[test]
    fn test_stale_token_does_not_clear_newer_engagement() {
        let guard = RemoteExecutionGuard::new(Duration::from_secs(5));
        let old = guard.engage();
        let _new = guard.engage();
        drop(old);
        assert!(guard.is_active());
    }
}
