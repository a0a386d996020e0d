pub mod connection;
pub mod controller;
pub mod data_channel;
pub mod events;
pub mod ice;
pub mod state;
pub mod types;

pub use connection::PeerFactory;
pub use controller::{ControllerOptions, HandledCode, PeerController};
pub use events::{NoopObserver, SessionEvent, SessionObserver};
pub use state::{SessionEntry, SessionPhase, SessionRegistry};
pub use types::{PeerId, ServerConfig, SessionStatus, WireMessage};
