//! Player capability and its execution context
//!
//! Embedded playback engines usually insist on being driven from one
//! thread. [`PlayerContext`] owns the host's [`Player`] on a dedicated
//! thread and marshals every call onto it, in submission order.

use std::sync::mpsc;
use std::thread;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

/// Playback engine implemented by the host
#[uniffi::export(callback_interface)]
pub trait Player: Send + Sync {
    fn play(&self);
    fn pause(&self);
    fn seek_to(&self, position_ms: u64);
    fn current_position(&self) -> u64;
    fn is_playing(&self) -> bool;
    fn set_rate(&self, rate: f64);
    /// Item that is loaded and ready to start, if any
    fn prepared_item(&self) -> Option<String>;
}

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("Failed to start player thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Player context is gone")]
    Gone,
}

type Job = Box<dyn FnOnce(&dyn Player) + Send>;

/// Single execution context for all player access
#[derive(Clone)]
pub struct PlayerContext {
    jobs: mpsc::Sender<Job>,
}

impl PlayerContext {
    /// Move the player onto its own thread. The thread ends when the last context clone drops.
    pub fn spawn(player: Box<dyn Player>) -> Result<Self, PlayerError> {
        let (jobs, rx) = mpsc::channel::<Job>();
        thread::Builder::new()
            .name("syncplay-player".into())
            .spawn(move || {
                for job in rx {
                    job(player.as_ref());
                }
                debug!("Player thread stopped");
            })?;
        Ok(Self { jobs })
    }

    /// Run `f` against the player and await its result
    pub async fn run<R, F>(&self, f: F) -> Result<R, PlayerError>
    where
        F: FnOnce(&dyn Player) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.jobs
            .send(Box::new(move |player| {
                let _ = tx.send(f(player));
            }))
            .map_err(|_| PlayerError::Gone)?;
        rx.await.map_err(|_| PlayerError::Gone)
    }

    pub async fn position(&self) -> Result<u64, PlayerError> {
        self.run(|p| p.current_position()).await
    }

    pub async fn is_playing(&self) -> Result<bool, PlayerError> {
        self.run(|p| p.is_playing()).await
    }

    pub async fn prepared_item(&self) -> Result<Option<String>, PlayerError> {
        self.run(|p| p.prepared_item()).await
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::Player;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct MockState {
        position_ms: u64,
        playing: bool,
        prepared: Option<String>,
        calls: Vec<String>,
        stall: Option<Duration>,
    }

    /// Records every call; position and state are settable from tests
    #[derive(Debug, Clone, Default)]
    pub(crate) struct MockPlayer {
        state: Arc<Mutex<MockState>>,
    }

    impl MockPlayer {
        pub(crate) fn set_position(&self, position_ms: u64) {
            self.state.lock().position_ms = position_ms;
        }

        pub(crate) fn set_playing(&self, playing: bool) {
            self.state.lock().playing = playing;
        }

        pub(crate) fn set_prepared(&self, item: Option<&str>) {
            self.state.lock().prepared = item.map(str::to_string);
        }

        /// The next seek blocks the player thread for `d`
        pub(crate) fn stall_next_seek(&self, d: Duration) {
            self.state.lock().stall = Some(d);
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.state.lock().calls.clone()
        }

        pub(crate) fn count(&self, call: &str) -> usize {
            self.state.lock().calls.iter().filter(|c| *c == call).count()
        }
    }

    impl Player for MockPlayer {
        fn play(&self) {
            let mut s = self.state.lock();
            s.playing = true;
            s.calls.push("play".into());
        }

        fn pause(&self) {
            let mut s = self.state.lock();
            s.playing = false;
            s.calls.push("pause".into());
        }

        fn seek_to(&self, position_ms: u64) {
            let stall = self.state.lock().stall.take();
            if let Some(d) = stall {
                std::thread::sleep(d);
            }
            let mut s = self.state.lock();
            s.position_ms = position_ms;
            s.calls.push(format!("seek:{}", position_ms));
        }

        fn current_position(&self) -> u64 {
            self.state.lock().position_ms
        }

        fn is_playing(&self) -> bool {
            self.state.lock().playing
        }

        fn set_rate(&self, rate: f64) {
            self.state.lock().calls.push(format!("rate:{}", rate));
        }

        fn prepared_item(&self) -> Option<String> {
            self.state.lock().prepared.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockPlayer;
    use super::*;

    #[tokio::test]
    async fn test_calls_run_in_order_on_player_thread() {
        let player = MockPlayer::default();
        let ctx = PlayerContext::spawn(Box::new(player.clone())).unwrap();

        let thread_name = ctx
            .run(|_| thread::current().name().map(str::to_string))
            .await
            .unwrap();
        assert_eq!(thread_name.as_deref(), Some("syncplay-player"));

        ctx.run(|p| p.seek_to(1000)).await.unwrap();
        ctx.run(|p| p.play()).await.unwrap();
        ctx.run(|p| p.pause()).await.unwrap();

        assert_eq!(ctx.position().await.unwrap(), 1000);
        assert!(!ctx.is_playing().await.unwrap());
        assert_eq!(player.calls(), vec!["seek:1000", "play", "pause"]);
    }

    #[tokio::test]
    async fn test_prepared_item_passthrough() {
        let player = MockPlayer::default();
        player.set_prepared(Some("A"));
        let ctx = PlayerContext::spawn(Box::new(player)).unwrap();
        assert_eq!(ctx.prepared_item().await.unwrap().as_deref(), Some("A"));
    }
}
