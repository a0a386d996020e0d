use crate::peer::state::SessionEntry;
use crate::peer::types::{PeerId, WireMessage};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

/// Наблюдатель за сессией. Все методы вызываются из обработчиков webrtc,
/// поэтому они синхронные и не должны блокировать
pub trait SessionObserver: Send + Sync {
    fn on_open(&self, _partner: &PeerId) {}
    fn on_message(&self, _partner: &PeerId, _message: WireMessage) {}
    fn on_close(&self, _partner: &PeerId) {}
    fn on_error(&self, _partner: &PeerId, _detail: &str) {}
    /// Новый локальный кандидат в виде готового `KANDIDAT:` кода
    fn on_local_candidate(&self, _partner: &PeerId, _code: &str) {}
}

/// Наблюдатель, который ничего не делает
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Open { partner: PeerId },
    Message { partner: PeerId, message: WireMessage },
    Closed { partner: PeerId },
    Error { partner: PeerId, detail: String },
    LocalCandidate { partner: PeerId, code: String },
}

impl SessionEvent {
    pub fn partner(&self) -> &PeerId {
        match self {
            SessionEvent::Open { partner }
            | SessionEvent::Message { partner, .. }
            | SessionEvent::Closed { partner }
            | SessionEvent::Error { partner, .. }
            | SessionEvent::LocalCandidate { partner, .. } => partner,
        }
    }
}

// Подписка через канал: получатель сам решает, когда читать события
impl SessionObserver for mpsc::UnboundedSender<SessionEvent> {
    fn on_open(&self, partner: &PeerId) {
        let _ = self.send(SessionEvent::Open {
            partner: partner.clone(),
        });
    }

    fn on_message(&self, partner: &PeerId, message: WireMessage) {
        let _ = self.send(SessionEvent::Message {
            partner: partner.clone(),
            message,
        });
    }

    fn on_close(&self, partner: &PeerId) {
        let _ = self.send(SessionEvent::Closed {
            partner: partner.clone(),
        });
    }

    fn on_error(&self, partner: &PeerId, detail: &str) {
        let _ = self.send(SessionEvent::Error {
            partner: partner.clone(),
            detail: detail.to_string(),
        });
    }

    fn on_local_candidate(&self, partner: &PeerId, code: &str) {
        let _ = self.send(SessionEvent::LocalCandidate {
            partner: partner.clone(),
            code: code.to_string(),
        });
    }
}

/// Наблюдатель сессии, если он задан, иначе общий
pub(crate) fn resolve_observer(
    entry: &Weak<SessionEntry>,
    fallback: &Arc<dyn SessionObserver>,
) -> Arc<dyn SessionObserver> {
    entry
        .upgrade()
        .and_then(|entry| entry.observer())
        .unwrap_or_else(|| fallback.clone())
}
