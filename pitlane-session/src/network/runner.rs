//! Session Runner
//!
//! Async driver for one or more match controllers. Every pass pumps each
//! controller, forwards its session events to the owner's hooks and then
//! gives the hooks a tick. The loop ends when every controller has left its
//! room or a shutdown signal arrives.

use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::game::events::SessionEvent;
use crate::network::matchmaking::MatchController;
use crate::network::transport::Transport;

/// Presentation and gameplay collaborator for one controller.
pub trait SessionHooks<T: Transport> {
    /// A session event was published.
    fn on_event(&mut self, event: &SessionEvent, controller: &mut MatchController<T>);

    /// Called once per pass after the events.
    fn on_tick(&mut self, _controller: &mut MatchController<T>) {}
}

struct Driven<T: Transport, H> {
    controller: MatchController<T>,
    hooks: H,
    events: Option<broadcast::Receiver<SessionEvent>>,
}

/// Fixed-rate driver.
pub struct SessionRunner<T: Transport, H: SessionHooks<T>> {
    peers: Vec<Driven<T, H>>,
    tick_interval: Duration,
    shutdown_tx: broadcast::Sender<()>,
    passes: u64,
}

impl<T: Transport, H: SessionHooks<T>> SessionRunner<T, H> {
    /// Create a runner ticking at the configured rate.
    pub fn new(config: &SessionConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            peers: Vec::new(),
            tick_interval: config.tick_interval(),
            shutdown_tx,
            passes: 0,
        }
    }

    /// Drive `controller`, feeding its events to `hooks`.
    pub fn add(&mut self, controller: MatchController<T>, hooks: H) {
        let events = controller.subscribe_events();
        self.peers.push(Driven { controller, hooks, events });
    }

    /// Sender that stops [`SessionRunner::run`] when signalled.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Passes run so far.
    pub fn passes(&self) -> u64 {
        self.passes
    }

    /// Any controller still in a room.
    pub fn any_in_room(&self) -> bool {
        self.peers.iter().any(|p| p.controller.in_room())
    }

    /// Run until every controller has left or shutdown is signalled.
    /// Hands the controllers and hooks back to the caller.
    pub async fn run(mut self) -> Vec<(MatchController<T>, H)> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Session runner started with {} controllers", self.peers.len());

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.step();
                    if !self.any_in_room() {
                        info!("All controllers left their rooms after {} passes", self.passes);
                        break;
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.peers.into_iter().map(|p| (p.controller, p.hooks)).collect()
    }

    /// One pass over every controller.
    pub fn step(&mut self) {
        self.passes += 1;

        for peer in self.peers.iter_mut() {
            let Driven { controller, hooks, events } = peer;

            if let Err(e) = controller.pump() {
                error!("Controller pump failed: {}", e);
            }

            if let Some(rx) = events.as_mut() {
                loop {
                    match rx.try_recv() {
                        Ok(event) => hooks.on_event(&event, controller),
                        Err(TryRecvError::Lagged(n)) => warn!("Hooks lagged, {} events skipped", n),
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Closed) => {
                            debug!("Session closed, detaching hooks");
                            *events = None;
                            break;
                        }
                    }
                }
            }

            hooks.on_tick(controller);

            // Joined a new room from inside the hooks.
            if events.is_none() {
                *events = controller.subscribe_events();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::ActorId;
    use crate::game::phase::SessionPhase;
    use crate::network::loopback::{LoopbackEndpoint, LoopbackService};

    #[derive(Default)]
    struct Scripted {
        seen: Vec<SessionEvent>,
        finish_reported: bool,
    }

    impl SessionHooks<LoopbackEndpoint> for Scripted {
        fn on_event(&mut self, event: &SessionEvent, controller: &mut MatchController<LoopbackEndpoint>) {
            self.seen.push(event.clone());
            match event {
                SessionEvent::ReadyUpRequested => {
                    controller.set_local_ready(true);
                }
                SessionEvent::RaceEnded => {
                    controller.leave().unwrap();
                }
                _ => {}
            }
        }

        fn on_tick(&mut self, controller: &mut MatchController<LoopbackEndpoint>) {
            let Some(session) = controller.session() else {
                return;
            };
            match session.phase() {
                SessionPhase::Lobby if !session.local_ready() && !session.countdown_active() => {
                    controller.set_local_ready(true);
                }
                SessionPhase::Racing if session.is_authority_holder() && !self.finish_reported => {
                    let racers: Vec<ActorId> = session.roster().actors().collect();
                    for (i, racer) in racers.into_iter().enumerate() {
                        controller.report_finish(racer, Duration::from_millis(30_000 + i as u64 * 250));
                    }
                    self.finish_reported = true;
                }
                _ => {}
            }
        }
    }

    fn fast_config() -> SessionConfig {
        SessionConfig {
            max_players: 2,
            countdown_ms: 50,
            ready_up_timeout_ms: 2_000,
            last_player_departure_ms: 50,
            tick_rate: 100,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_runner_drives_full_race() {
        let config = fast_config();
        let service = LoopbackService::new();
        let mut runner = SessionRunner::new(&config);
        for i in 0..2 {
            let mut controller = MatchController::new(config.clone(), service.endpoint());
            controller.join(&format!("racer{}", i + 1)).unwrap();
            runner.add(controller, Scripted::default());
        }

        let finished = tokio::time::timeout(Duration::from_secs(10), runner.run())
            .await
            .expect("runner did not finish");

        assert!(service.room().is_none());
        for (controller, hooks) in &finished {
            assert!(!controller.in_room());
            assert!(hooks.seen.contains(&SessionEvent::RaceStarted));
            assert!(hooks.seen.contains(&SessionEvent::RaceEnded));
        }
    }

    #[tokio::test]
    async fn test_runner_stops_on_shutdown() {
        let config = fast_config();
        let service = LoopbackService::new();
        let mut runner: SessionRunner<LoopbackEndpoint, Scripted> = SessionRunner::new(&config);
        let mut controller = MatchController::new(config.clone(), service.endpoint());
        controller.join("solo").unwrap();
        runner.add(controller, Scripted::default());

        let shutdown = runner.shutdown_handle();
        let handle = tokio::spawn(runner.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.send(()).unwrap();

        let finished = handle.await.unwrap();
        assert_eq!(finished.len(), 1);
        // Still in the lobby waiting for a second racer.
        assert!(finished[0].0.in_room());
    }
}
