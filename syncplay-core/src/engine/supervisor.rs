//! Group session supervisor
//!
//! One task per group session. A single select loop serves push frames,
//! link state, host requests and the report/drift/poll timers, so every
//! inbound command is applied in arrival order by one writer.

use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{Shared, SyncError, SyncEvent};
use crate::authority::AuthorityError;
use crate::buffering::BufferingCoordinator;
use crate::group::{PollOutcome, StateTransition};
use crate::latency::LatencyTracker;
use crate::position::PositionSync;
use crate::sync::clock::current_time_ms;
use crate::sync::filters::{Admission, CommandFilter, PlayGuard};
use crate::sync::{
    self, GroupErrorKind, GroupState, InboundMessage, OutboundIntent, PlayQueueUpdate, PlaybackCommand,
    ReceivedCommand,
};
use crate::transport::{ConnectionState, LinkEvent};

/// Requests from the engine handle that need session state
pub(crate) enum HostRequest {
    BufferingComplete {
        item_id: String,
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
}

/// Outcome of a fire-and-forget position report
struct ReportResult {
    position_ms: u64,
    sent_at_ms: u64,
    outcome: Result<(), AuthorityError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

pub(crate) struct Supervisor {
    shared: Arc<Shared>,
    filter: CommandFilter,
    play_guard: PlayGuard,
    position: PositionSync,
    buffering: BufferingCoordinator,
    latency: LatencyTracker,
    reports_tx: mpsc::UnboundedSender<ReportResult>,
    reports_rx: Option<mpsc::UnboundedReceiver<ReportResult>>,
}

impl Supervisor {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        let config = &shared.config;
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        Self {
            filter: CommandFilter::new(config.stale_after_ms, config.dedup_window_ms),
            play_guard: PlayGuard::new(config.play_guard_window_ms),
            position: PositionSync::new(config),
            buffering: BufferingCoordinator::new(shared.is_buffering.clone()),
            latency: LatencyTracker::new(config.default_latency_ms),
            reports_tx,
            reports_rx: Some(reports_rx),
            shared,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<HostRequest>,
        mut cancel: oneshot::Receiver<()>,
    ) {
        let Some(mut reports_rx) = self.reports_rx.take() else {
            return;
        };
        let mut frames = self.shared.link.subscribe();
        let mut link_state = self.shared.link.watch_state();

        let config = &self.shared.config;
        let mut report = interval(config.report_interval);
        let mut drift = interval(config.drift_interval);
        let mut poll = interval(config.poll_interval);
        for timer in [&mut report, &mut drift, &mut poll] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        if let Err(e) = self.shared.link.connect() {
            warn!("Push channel unavailable: {}", e);
        }
        // Ask the authority to forward the current group and play queue
        self.send_resync();

        info!("Group session started");

        loop {
            tokio::select! {
                _ = &mut cancel => break,
                event = frames.recv() => match event {
                    Ok(LinkEvent::Frame { text, received_at_ms }) => {
                        if self.handle_frame(&text, received_at_ms, current_time_ms()).await == Flow::Stop {
                            break;
                        }
                    }
                    Ok(LinkEvent::RoundTrip(rtt)) => {
                        let latency_ms = self.latency.record_round_trip(rtt);
                        self.spawn_send(OutboundIntent::Ping { latency_ms });
                    }
                    Err(RecvError::Lagged(n)) => warn!("Push channel lagged, {} frames lost", n),
                    Err(RecvError::Closed) => break,
                },
                changed = link_state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *link_state.borrow_and_update();
                    if state == ConnectionState::Connected {
                        self.send_resync();
                    }
                }
                request = requests.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => break,
                },
                _ = report.tick() => self.report_position().await,
                _ = drift.tick() => self.check_drift(current_time_ms()).await,
                _ = poll.tick() => {
                    if self.poll(current_time_ms()).await == Flow::Stop {
                        break;
                    }
                }
                Some(result) = reports_rx.recv() => self.report_delivered(result),
            }
        }

        self.buffering.reset();
        self.shared.link.disconnect();
        info!("Group session stopped");
    }

    // === Inbound ===

    async fn handle_frame(&mut self, text: &str, received_at_ms: u64, now_ms: u64) -> Flow {
        let message = match sync::decode(text) {
            Ok(message) => message,
            Err(e) if e.is_forward_compatible() => {
                debug!("Ignoring message: {}", e);
                return Flow::Continue;
            }
            Err(e) => {
                warn!("Dropping malformed message: {}", e);
                return Flow::Continue;
            }
        };

        self.shared.group.touch();

        match message {
            InboundMessage::KeepAlive => {}
            InboundMessage::GroupJoined(snapshot) => {
                let confirming = self.shared.group.group_id().is_none();
                self.latency.record_members(&snapshot.participants);
                if let Some(transition) = self.shared.group.apply_snapshot(&snapshot) {
                    if confirming {
                        self.shared.emit(SyncEvent::GroupJoined {
                            group_id: snapshot.group_id.clone(),
                        });
                    }
                    self.on_transition(transition, now_ms).await;
                }
            }
            InboundMessage::Snapshot(snapshot) => {
                self.latency.record_members(&snapshot.participants);
                if let Some(transition) = self.shared.group.apply_snapshot(&snapshot) {
                    self.on_transition(transition, now_ms).await;
                }
            }
            InboundMessage::GroupLeft => {
                info!("Authority removed us from the group");
                self.shared.group.clear();
                self.shared.emit(SyncEvent::GroupLeft);
                return Flow::Stop;
            }
            InboundMessage::StateUpdate {
                state,
                reason,
                position_ms,
            } => {
                debug!("State update {} ({:?})", state, reason);
                if let Some(position_ms) = position_ms {
                    self.position.record_authoritative(position_ms, now_ms);
                }
                if let Some(transition) = self.shared.group.apply_state(state) {
                    self.on_transition(transition, now_ms).await;
                }
            }
            InboundMessage::MemberJoined(name) => {
                if self.shared.group.member_joined(&name) {
                    self.shared.emit(SyncEvent::MemberJoined(name));
                }
            }
            InboundMessage::MemberLeft(name) => {
                if self.shared.group.member_left(&name) {
                    self.shared.emit(SyncEvent::MemberLeft(name));
                }
            }
            InboundMessage::Command(command) => {
                self.execute(ReceivedCommand::new(command, received_at_ms), now_ms)
                    .await;
            }
            InboundMessage::PlayQueue(update) => {
                self.handle_play_queue(update, received_at_ms, now_ms).await;
            }
            InboundMessage::GroupError(kind) => {
                return self.end_with_group_error(kind);
            }
        }

        Flow::Continue
    }

    /// Group errors are terminal for the session
    fn end_with_group_error(&mut self, kind: GroupErrorKind) -> Flow {
        let err = SyncError::Group(kind);
        warn!("Leaving group: {}", err);
        self.shared.group.clear();
        self.shared.emit(SyncEvent::error(&err));
        self.shared.emit(SyncEvent::GroupLeft);
        Flow::Stop
    }

    async fn handle_play_queue(&mut self, update: PlayQueueUpdate, received_at_ms: u64, now_ms: u64) {
        self.buffering.update_playlist(&update.playlist);
        let previous = self.shared.group.set_playlist(update.playlist.clone());

        match sync::play_for_queue_update(&update, previous.as_ref()) {
            Some(play) => {
                self.execute(ReceivedCommand::new(play, received_at_ms), now_ms)
                    .await
            }
            None => debug!("Play queue updated ({:?}), playing item unchanged", update.reason),
        }
    }

    async fn on_transition(&mut self, transition: StateTransition, now_ms: u64) {
        if transition.previous == GroupState::Playing && transition.current != GroupState::Playing {
            self.position.reset();
        }
        if !transition.entered(GroupState::Playing) {
            return;
        }

        // Snapshots and explicit commands race; synthesize the Play once
        let Some(playlist) = self.shared.group.playlist() else {
            return;
        };
        let Some(current) = playlist.current() else {
            debug!("Group playing but cached play queue is empty");
            return;
        };
        match self.shared.player.is_playing().await {
            Ok(false) => {}
            Ok(true) => return,
            Err(e) => {
                warn!("Player unavailable: {}", e);
                return;
            }
        }
        if !self.play_guard.try_emit(
            &current.item_id,
            playlist.playing_index,
            playlist.start_position_ms,
            now_ms,
        ) {
            return;
        }

        info!("Group entered Playing, starting {}", current.item_id);
        let play = PlaybackCommand::Play {
            item_ids: playlist.item_ids(),
            start_index: playlist.playing_index,
            start_position_ms: playlist.start_position_ms,
        };
        self.execute(ReceivedCommand::new(play, now_ms), now_ms).await;
    }

    // === Command execution ===

    /// Filter and apply one command. Applies are bounded by the guard timeout.
    async fn execute(&mut self, received: ReceivedCommand, now_ms: u64) {
        let tolerance_ms = self.tolerance_ms();
        match self.filter.admit(&received, now_ms, tolerance_ms) {
            Admission::Apply => {}
            Admission::Stale { age_ms } => {
                debug!("Dropping stale {:?} ({}ms old)", received.command.kind(), age_ms);
                return;
            }
            Admission::Duplicate => {
                debug!("Dropping duplicate {:?}", received.command.kind());
                return;
            }
        }

        let command = received.command;
        let kind = command.kind();
        self.filter.mark_executed(&command, now_ms);
        self.shared.emit(SyncEvent::Command(command.clone()));

        let shared = self.shared.clone();
        let limit = shared.config.remote_guard_timeout;
        let _applying = shared.guard.engage();

        let result = match tokio::time::timeout(limit, self.apply(command, now_ms, tolerance_ms)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::ExecutionTimeout { command: kind, limit }),
        };
        if let Err(e) = result {
            warn!("Applying {:?} failed: {}", kind, e);
            shared.emit(SyncEvent::error(&e));
        }
    }

    async fn apply(&mut self, command: PlaybackCommand, now_ms: u64, tolerance_ms: u64) -> Result<(), SyncError> {
        let player = &self.shared.player;
        match command {
            PlaybackCommand::Pause { position_ms } => {
                self.buffering.settle();
                self.position.record_authoritative(position_ms, now_ms);
                player
                    .run(move |p| {
                        if p.current_position().abs_diff(position_ms) > tolerance_ms {
                            p.seek_to(position_ms);
                        }
                        p.pause();
                    })
                    .await?;
            }
            PlaybackCommand::Unpause { position_ms } => {
                if self.buffering.is_buffering() {
                    self.buffering.defer_start(position_ms);
                } else if self.buffering.may_start() {
                    self.start_playback(position_ms, now_ms, tolerance_ms).await?;
                } else {
                    debug!("Start already issued for this buffering cycle");
                }
            }
            PlaybackCommand::Seek { position_ms } => {
                self.position.record_authoritative(position_ms, now_ms);
                player.run(move |p| p.seek_to(position_ms)).await?;
            }
            PlaybackCommand::SetRate { rate } => {
                player.run(move |p| p.set_rate(rate)).await?;
            }
            PlaybackCommand::Play {
                item_ids,
                start_index,
                start_position_ms,
            } => {
                let Some(item_id) = item_ids.get(start_index).cloned() else {
                    return Ok(());
                };
                let prepared = player.prepared_item().await?;
                self.buffering.begin(&item_id, start_index, start_position_ms);

                if prepared.as_deref() == Some(item_id.as_str()) {
                    debug!("{} already loaded, reporting ready", item_id);
                    let is_playing = self.shared.player.is_playing().await?;
                    if let Some(intent) =
                        self.buffering
                            .report_buffering_complete(&item_id, start_position_ms, is_playing)
                    {
                        // On failure the cycle stays loading and the host may report again
                        self.send_ready(intent).await?;
                        self.buffering.ready_confirmed(&item_id);
                        self.start_playback(start_position_ms, now_ms, tolerance_ms).await?;
                    }
                }
            }
            PlaybackCommand::Buffering { item_id } => {
                debug!("Group waiting for {} to buffer", item_id);
                player
                    .run(|p| {
                        if p.is_playing() {
                            p.pause();
                        }
                    })
                    .await?;
            }
            PlaybackCommand::Stop => {
                self.buffering.finish();
                self.position.reset();
                player.run(|p| p.pause()).await?;
            }
        }
        Ok(())
    }

    /// Seek if off by more than the tolerance, then play
    async fn start_playback(&mut self, position_ms: u64, now_ms: u64, tolerance_ms: u64) -> Result<(), SyncError> {
        self.position.record_authoritative(position_ms, now_ms);
        self.shared
            .player
            .run(move |p| {
                if p.current_position().abs_diff(position_ms) > tolerance_ms {
                    p.seek_to(position_ms);
                }
                p.play();
            })
            .await?;
        self.buffering.mark_started();
        Ok(())
    }

    async fn send_ready(&self, intent: OutboundIntent) -> Result<(), SyncError> {
        self.shared.authority.send_intent(&intent).await?;
        self.shared.emit(SyncEvent::CommandSent(intent.name().to_string()));
        Ok(())
    }

    // === Host requests ===

    async fn handle_request(&mut self, request: HostRequest) {
        match request {
            HostRequest::BufferingComplete { item_id, reply } => {
                let result = self.buffering_complete(&item_id, current_time_ms()).await;
                let _ = reply.send(result);
            }
        }
    }

    async fn buffering_complete(&mut self, item_id: &str, now_ms: u64) -> Result<(), SyncError> {
        let (position_ms, is_playing) = self
            .shared
            .player
            .run(|p| (p.current_position(), p.is_playing()))
            .await?;

        let Some(intent) = self
            .buffering
            .report_buffering_complete(item_id, position_ms, is_playing)
        else {
            return Ok(());
        };

        // Until the authority has the report we are still loading
        if let Err(e) = self.send_ready(intent).await {
            warn!("Ready report for {} failed: {}", item_id, e);
            return Err(e);
        }
        let deferred_start_ms = self.buffering.ready_confirmed(item_id);

        // The authority already asked to start while we were loading
        if let Some(start_ms) = deferred_start_ms {
            if self.buffering.may_start() {
                let shared = self.shared.clone();
                let _applying = shared.guard.engage();
                let tolerance_ms = self.tolerance_ms();
                let limit = shared.config.remote_guard_timeout;
                match tokio::time::timeout(limit, self.start_playback(start_ms, now_ms, tolerance_ms)).await {
                    Ok(result) => result?,
                    Err(_) => warn!("Deferred start took longer than {:?}", limit),
                }
            }
        }
        Ok(())
    }

    // === Timers ===

    fn tolerance_ms(&self) -> u64 {
        self.position.tolerance_ms(self.latency.estimated_latency_ms())
    }

    /// Synthetic "ready at 0, not playing" so the authority forwards state
    fn send_resync(&self) {
        self.spawn_send(OutboundIntent::Ready {
            position_ms: 0,
            is_playing: false,
            playlist_item_id: None,
        });
    }

    fn spawn_send(&self, intent: OutboundIntent) {
        let authority = self.shared.authority.clone();
        tokio::spawn(async move {
            if let Err(e) = authority.send_intent(&intent).await {
                debug!("{} failed: {}", intent.name(), e);
            }
        });
    }

    async fn report_position(&mut self) {
        if !self.shared.group.is_active() {
            return;
        }
        let (position_ms, is_playing) = match self
            .shared
            .player
            .run(|p| (p.current_position(), p.is_playing()))
            .await
        {
            Ok(state) => state,
            Err(e) => {
                debug!("Skipping report: {}", e);
                return;
            }
        };
        if !self.position.should_report(position_ms) {
            return;
        }

        let playlist_item_id = self
            .shared
            .group
            .playlist()
            .and_then(|p| p.current().map(|e| e.playlist_item_id.clone()));
        let intent = if self.buffering.is_buffering() {
            OutboundIntent::Buffering {
                position_ms,
                is_playing,
                playlist_item_id,
            }
        } else {
            OutboundIntent::Ready {
                position_ms,
                is_playing,
                playlist_item_id,
            }
        };

        let authority = self.shared.authority.clone();
        let reports_tx = self.reports_tx.clone();
        let sent_at_ms = current_time_ms();
        tokio::spawn(async move {
            let outcome = authority.send_intent(&intent).await;
            let _ = reports_tx.send(ReportResult {
                position_ms,
                sent_at_ms,
                outcome,
            });
        });
    }

    fn report_delivered(&mut self, result: ReportResult) {
        match result.outcome {
            Ok(()) => self.position.record_report(result.position_ms, result.sent_at_ms),
            Err(e) if e.is_authorization() => warn!("Position report not authorized: {}", e),
            Err(e) => debug!("Position report failed: {}", e),
        }
    }

    async fn check_drift(&mut self, now_ms: u64) {
        if self.shared.group.state() != GroupState::Playing || self.buffering.is_buffering() {
            return;
        }
        let (actual_ms, playing) = match self
            .shared
            .player
            .run(|p| (p.current_position(), p.is_playing()))
            .await
        {
            Ok(state) => state,
            Err(_) => return,
        };
        if !playing {
            return;
        }

        let tolerance_ms = self.tolerance_ms();
        if let Some(expected_ms) = self.position.check_drift(actual_ms, now_ms, tolerance_ms) {
            info!(
                "Drift {}ms exceeds {}ms, requesting seek to {}ms",
                actual_ms.abs_diff(expected_ms),
                tolerance_ms,
                expected_ms
            );
            self.spawn_send(OutboundIntent::Seek {
                position_ms: expected_ms,
            });
        }
    }

    async fn poll(&mut self, now_ms: u64) -> Flow {
        match self.shared.group.poll(self.shared.config.poll_quiet_window).await {
            Ok(PollOutcome::Skipped) => Flow::Continue,
            Ok(PollOutcome::Updated(transition)) => {
                self.latency.record_members(&self.shared.group.membership());
                self.on_transition(transition, now_ms).await;
                Flow::Continue
            }
            Ok(PollOutcome::Missing) => self.end_with_group_error(GroupErrorKind::GroupDoesNotExist),
            Err(e) => {
                debug!("Snapshot poll failed: {}", e);
                Flow::Continue
            }
        }
    }
}
