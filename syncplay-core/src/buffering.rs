//! Ready/buffering handshake
//!
//! A Play from the authority opens a buffering cycle for its leading
//! item. The host loads the item and calls back when it can start; only
//! then is a ready report sent, and only after the authority accepted it
//! may the player start.
//! A start requested while still loading is held until the ready report.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::sync::{OutboundIntent, Playlist};

/// One item being loaded for a group start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferingCycle {
    pub item_id: String,
    pub start_index: usize,
    pub start_position_ms: u64,
    ready_sent: bool,
    started: bool,
}

#[derive(Debug)]
pub struct BufferingCoordinator {
    is_buffering: Arc<watch::Sender<bool>>,
    /// media item id -> playlist item id, for the cached playlist
    playlist_ids: HashMap<String, String>,
    cycle: Option<BufferingCycle>,
    deferred_start_ms: Option<u64>,
}

impl BufferingCoordinator {
    pub fn new(is_buffering: Arc<watch::Sender<bool>>) -> Self {
        is_buffering.send_replace(false);
        Self {
            is_buffering,
            playlist_ids: HashMap::new(),
            cycle: None,
            deferred_start_ms: None,
        }
    }

    pub fn is_buffering(&self) -> bool {
        *self.is_buffering.borrow()
    }

    pub fn cycle(&self) -> Option<&BufferingCycle> {
        self.cycle.as_ref()
    }

    /// Refresh the id mapping from a new playlist
    pub fn update_playlist(&mut self, playlist: &Playlist) {
        self.playlist_ids = playlist
            .entries
            .iter()
            .map(|e| (e.item_id.clone(), e.playlist_item_id.clone()))
            .collect();
    }

    pub fn playlist_item_id(&self, item_id: &str) -> Option<String> {
        self.playlist_ids.get(item_id).cloned()
    }

    /// Open a cycle for a Play
    pub fn begin(&mut self, item_id: &str, start_index: usize, start_position_ms: u64) {
        debug!("Buffering {} (index {}) from {}ms", item_id, start_index, start_position_ms);
        self.cycle = Some(BufferingCycle {
            item_id: item_id.to_string(),
            start_index,
            start_position_ms,
            ready_sent: false,
            started: false,
        });
        self.deferred_start_ms = None;
        self.is_buffering.send_replace(true);
    }

    /// Hold a start until the ready report goes out
    pub fn defer_start(&mut self, position_ms: u64) {
        debug!("Holding start at {}ms until buffering completes", position_ms);
        self.deferred_start_ms = Some(position_ms);
    }

    /// The host finished loading `item_id`.
    ///
    /// Returns the ready report to send, or None when the report belongs to
    /// an item other than the one the current cycle is loading. Nothing
    /// changes until [`ready_confirmed`](Self::ready_confirmed).
    pub fn report_buffering_complete(
        &self,
        item_id: &str,
        position_ms: u64,
        is_playing: bool,
    ) -> Option<OutboundIntent> {
        if let Some(cycle) = &self.cycle {
            if cycle.item_id != item_id {
                debug!("Ignoring buffering complete for {} (loading {})", item_id, cycle.item_id);
                return None;
            }
        }
        Some(OutboundIntent::Ready {
            position_ms,
            is_playing,
            playlist_item_id: self.playlist_item_id(item_id),
        })
    }

    /// The authority accepted our ready report for `item_id`.
    /// Returns the start that was held back while loading.
    pub fn ready_confirmed(&mut self, item_id: &str) -> Option<u64> {
        if let Some(cycle) = &mut self.cycle {
            if cycle.item_id != item_id {
                return None;
            }
            cycle.ready_sent = true;
        }
        self.is_buffering.send_replace(false);
        self.deferred_start_ms.take()
    }

    /// Whether the player may start now. Outside a cycle nothing blocks.
    pub fn may_start(&self) -> bool {
        match &self.cycle {
            Some(cycle) => cycle.ready_sent && !cycle.started,
            None => true,
        }
    }

    /// The player was started for the current cycle
    pub fn mark_started(&mut self) {
        if let Some(cycle) = &mut self.cycle {
            cycle.started = true;
        }
    }

    /// Close the cycle if its start already went out
    pub fn settle(&mut self) {
        if self.cycle.as_ref().is_some_and(|c| c.started) {
            self.finish();
        }
    }

    /// Drop the cycle; later starts are ordinary unpauses
    pub fn finish(&mut self) {
        self.cycle = None;
        self.deferred_start_ms = None;
        self.is_buffering.send_replace(false);
    }

    pub fn reset(&mut self) {
        self.finish();
        self.playlist_ids.clear();
    }
}
