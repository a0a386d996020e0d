pub mod chat;
pub mod config;
pub mod error;
pub mod identity;
pub mod logger;
pub mod peer;
pub mod signaling;
pub mod store;
pub mod utils;

pub use chat::{ChatBook, ChatClient, ChatMessage, Contact, SendReport};
pub use config::AppConfig;
pub use error::{ChatError, ConfigError, SessionError, SignalingError, StoreError};
pub use identity::IdentityStore;
pub use peer::{
    HandledCode, NoopObserver, PeerController, PeerFactory, PeerId, SessionEvent, SessionObserver,
    SessionStatus, WireMessage,
};
pub use signaling::{decode, encode, CodeType, SignalingMessage};
pub use store::{FileStore, KeyValueStore, MemoryStore};
