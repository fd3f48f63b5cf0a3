//! Pitlane Session Demo
//!
//! Runs a complete race session in-process: one loopback room, one
//! participant per player slot, scripted readiness and finishes.

use std::time::Duration;
use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pitlane::{
    ActorId, SessionConfig, SessionEvent, SessionPhase, VERSION,
    network::{LoopbackEndpoint, LoopbackService, MatchController, SessionHooks, SessionRunner},
};

/// Passes spent racing before the first finish is reported.
const RACE_PASSES: u32 = 20;

/// Scripted participant.
struct DemoRacer {
    nickname: String,
    racing_passes: u32,
    finishers: Vec<ActorId>,
}

impl DemoRacer {
    fn new(nickname: String) -> Self {
        Self {
            nickname,
            racing_passes: 0,
            finishers: Vec::new(),
        }
    }
}

impl SessionHooks<LoopbackEndpoint> for DemoRacer {
    fn on_event(&mut self, event: &SessionEvent, controller: &mut MatchController<LoopbackEndpoint>) {
        match event {
            SessionEvent::PhaseChanged { from, to } => {
                info!("[{}] {} -> {}", self.nickname, from, to);
            }
            SessionEvent::CountdownTick { seconds_remaining } => {
                info!("[{}] {}...", self.nickname, seconds_remaining);
            }
            SessionEvent::ReadyUpRequested => {
                controller.set_local_ready(true);
            }
            SessionEvent::RacerFinished { nickname, elapsed, is_winner, .. } => {
                info!(
                    "[{}] {} finished in {:.2}s{}",
                    self.nickname,
                    nickname,
                    elapsed.as_secs_f64(),
                    if *is_winner { " and wins" } else { "" }
                );
            }
            SessionEvent::AuthorityChanged { holder, is_local: true } => {
                info!("[{}] now holds authority as {}", self.nickname, holder);
            }
            SessionEvent::RaceEnded => {
                info!("[{}] race over, leaving", self.nickname);
                if let Err(e) = controller.leave() {
                    warn!("[{}] leave failed: {}", self.nickname, e);
                }
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
            SessionPhase::Racing if session.is_authority_holder() => {
                self.racing_passes += 1;
                // One finisher every five passes, highest actor number first.
                if self.racing_passes >= RACE_PASSES && self.racing_passes % 5 == 0 {
                    let next = session
                        .roster()
                        .actors()
                        .filter(|a| !self.finishers.contains(a))
                        .max();
                    if let Some(racer) = next {
                        let elapsed = Duration::from_millis(u64::from(self.racing_passes) * 100 + 41_000);
                        if controller.report_finish(racer, elapsed) {
                            self.finishers.push(racer);
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

fn load_config() -> anyhow::Result<SessionConfig> {
    match std::env::args().nth(1) {
        Some(path) => SessionConfig::load(&path).with_context(|| format!("loading config from {}", path)),
        None => SessionConfig::from_env().context("reading PITLANE_* environment"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config()?;

    info!("Pitlane Session v{}", VERSION);
    info!("Tick Rate: {} Hz", config.tick_rate);
    info!("Players: {}", config.max_players);

    demo_session(config).await
}

/// Fill a loopback room and race once.
async fn demo_session(config: SessionConfig) -> anyhow::Result<()> {
    info!("=== Starting Demo Session ===");

    let service = LoopbackService::new();
    let mut runner = SessionRunner::new(&config);

    for _ in 0..config.max_players {
        let mut controller = MatchController::new(config.clone(), service.endpoint());
        let nickname = controller.generate_nickname();
        let join = controller.join(&nickname).context("joining demo room")?;
        info!("{} joined as {}", nickname, join.local);
        runner.add(controller, DemoRacer::new(nickname));
    }

    let shutdown = runner.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown.send(());
        }
    });

    let finished = runner.run().await;

    info!("=== Session Results ===");
    for (controller, racer) in &finished {
        let state = if controller.in_room() { "still in room" } else { "left" };
        info!("{}: {}", racer.nickname, state);
    }
    if let Some((_, holder)) = finished.iter().find(|(_, r)| !r.finishers.is_empty()) {
        for (place, actor) in holder.finishers.iter().enumerate() {
            info!("#{}: {}", place + 1, actor);
        }
    }

    Ok(())
}
