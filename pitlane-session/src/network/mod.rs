//! Network Layer
//!
//! Message catalogue, authority snapshot codec, the transport contract and
//! everything that runs on top of it. Delivery order and membership come
//! from the transport; nothing here assumes a particular service.

pub mod protocol;
pub mod codec;
pub mod transport;
pub mod loopback;
pub mod session;
pub mod matchmaking;
pub mod runner;

pub use protocol::{CustomPayload, MessageKind, ProtocolError, Route, SessionMessage, Target};
pub use codec::{CodecError, CustomTypeRegistry, WireCodec, AUTHORITY_STATE_TYPE_TAG};
pub use transport::{NetworkEvent, RoomInfo, RoomJoin, Transport, TransportError};
pub use loopback::{LoopbackEndpoint, LoopbackService};
pub use session::SessionCoordinator;
pub use matchmaking::{MatchController, MatchError};
pub use runner::{SessionHooks, SessionRunner};
