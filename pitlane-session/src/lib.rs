//! # Pitlane Session
//!
//! Session coordination for small peer-hosted multiplayer races: one
//! participant holds authority over the shared counters, everyone else
//! routes through it, and the authority moves to a successor when the
//! holder leaves.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      PITLANE SESSION                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/             - Identity and waits                      │
//! │  ├── ids.rs        - Actor numbers, roster, successor rule   │
//! │  └── wait.rs       - Tick-driven waits and countdown         │
//! │                                                              │
//! │  game/             - Session model                           │
//! │  ├── authority.rs  - Ready / in-scene / finish counters      │
//! │  ├── phase.rs      - Lobby → Setup → Racing → Finished       │
//! │  └── events.rs     - Events for presentation                 │
//! │                                                              │
//! │  network/          - Messaging                               │
//! │  ├── protocol.rs   - Message catalogue and routing           │
//! │  ├── codec.rs      - Authority snapshot wire format          │
//! │  ├── transport.rs  - Transport contract                      │
//! │  ├── loopback.rs   - In-process transport                    │
//! │  ├── session.rs    - Session coordinator                     │
//! │  ├── matchmaking.rs- Join, leave and authority handoff       │
//! │  └── runner.rs     - Fixed-rate async driver                 │
//! │                                                              │
//! │  config.rs         - Session configuration                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Authority Guarantee
//!
//! At most one participant mutates the [`AuthorityState`] at any time:
//! - Mutations are applied only by the current holder
//! - The holder hands a snapshot to its successor before leaving
//! - A successor without a snapshot rebuilds what it can observe

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod core;
pub mod game;
pub mod network;

// Re-export commonly used types
pub use config::{ConfigError, SessionConfig};
pub use crate::core::ids::{ActorId, Roster};
pub use game::authority::AuthorityState;
pub use game::events::{LeaveKind, SessionEvent};
pub use game::phase::SessionPhase;
pub use network::{MatchController, SessionCoordinator, SessionHooks, SessionRunner, Transport};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
