use crate::peer::types::PeerId;
use crate::signaling::CodeType;
use thiserror::Error;

/// Ошибки разбора ручных signaling-кодов
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("malformed signaling code: {0}")]
    Format(String),
    #[error("unknown signaling code type `{0}`")]
    UnknownCodeType(String),
    #[error("expected a {expected} code, got {found}")]
    WrongCodeType { expected: CodeType, found: CodeType },
    #[error("invalid signaling payload: {0}")]
    Payload(#[from] serde_json::Error),
}

impl SignalingError {
    /// Всё, кроме неизвестного типа, считается ошибкой формата
    pub fn is_format(&self) -> bool {
        !matches!(self, SignalingError::UnknownCodeType(_))
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error("webrtc negotiation failed: {0}")]
    Negotiation(#[from] webrtc::Error),
    #[error("refusing to open a session with the local endpoint {0}")]
    SelfSession(PeerId),
    #[error("no session for partner {0}")]
    NoSession(PeerId),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("unknown chat {0}")]
    UnknownChat(String),
    #[error("message text is empty")]
    EmptyMessage,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
