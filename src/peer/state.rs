use crate::peer::connection::PeerFactory;
use crate::peer::events::SessionObserver;
use crate::peer::types::PeerId;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::RTCPeerConnection;

/// Фаза жизненного цикла сессии
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Offer/answer ещё не завершены
    Negotiating,
    Open,
    Closed,
}

/// Всё, что относится к одному собеседнику
pub struct SessionEntry {
    partner: PeerId,
    connection: Arc<RTCPeerConnection>,
    channel: RwLock<Option<Arc<RTCDataChannel>>>,
    phase: RwLock<SessionPhase>,
    observer: RwLock<Option<Arc<dyn SessionObserver>>>,
    /// Кандидаты, полученные до установки remote description
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
}

impl SessionEntry {
    fn new(partner: PeerId, connection: Arc<RTCPeerConnection>) -> Self {
        Self {
            partner,
            connection,
            channel: RwLock::new(None),
            phase: RwLock::new(SessionPhase::Negotiating),
            observer: RwLock::new(None),
            pending_candidates: Mutex::new(Vec::new()),
        }
    }

    pub fn partner(&self) -> &PeerId {
        &self.partner
    }

    pub fn connection(&self) -> &Arc<RTCPeerConnection> {
        &self.connection
    }

    pub fn channel(&self) -> Option<Arc<RTCDataChannel>> {
        self.channel.read().clone()
    }

    /// Возвращает предыдущий канал, если он был
    pub(crate) fn set_channel(&self, dc: Arc<RTCDataChannel>) -> Option<Arc<RTCDataChannel>> {
        self.channel.write().replace(dc)
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.read()
    }

    pub(crate) fn set_phase(&self, phase: SessionPhase) {
        let mut current = self.phase.write();
        let previous = *current;
        if previous != phase {
            debug!(partner = %self.partner, from = ?previous, to = ?phase, "session phase changed");
            *current = phase;
        }
    }

    pub fn observer(&self) -> Option<Arc<dyn SessionObserver>> {
        self.observer.read().clone()
    }

    pub(crate) fn set_observer(&self, observer: Option<Arc<dyn SessionObserver>>) {
        *self.observer.write() = observer;
    }

    pub(crate) fn queue_candidate(&self, candidate: RTCIceCandidateInit) {
        self.pending_candidates.lock().push(candidate);
    }

    pub(crate) fn take_pending_candidates(&self) -> Vec<RTCIceCandidateInit> {
        std::mem::take(&mut *self.pending_candidates.lock())
    }

    pub fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.lock().len()
    }
}

/// Реестр сессий: собеседник → соединение и канал.
///
/// Пишет в реестр только контроллер; блокировки не удерживаются через `.await`.
pub struct SessionRegistry {
    factory: PeerFactory,
    entries: RwLock<HashMap<PeerId, Arc<SessionEntry>>>,
}

impl SessionRegistry {
    pub fn new(factory: PeerFactory) -> Self {
        Self {
            factory,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, partner: &PeerId) -> Option<Arc<SessionEntry>> {
        self.entries.read().get(partner).cloned()
    }

    /// Создаёт запись вместе с новым peer connection, если её ещё нет.
    /// Второй элемент: `true`, если запись создана этим вызовом
    pub async fn get_or_create(
        &self,
        partner: &PeerId,
    ) -> Result<(Arc<SessionEntry>, bool), webrtc::Error> {
        if let Some(entry) = self.get(partner) {
            return Ok((entry, false));
        }

        let pc = self.factory.new_peer().await?;
        let (entry, created) = {
            let mut entries = self.entries.write();
            match entries.get(partner) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let entry = Arc::new(SessionEntry::new(partner.clone(), pc.clone()));
                    entries.insert(partner.clone(), entry.clone());
                    (entry, true)
                }
            }
        };

        if !created {
            // кто-то успел создать запись, пока мы ждали peer connection
            debug!(%partner, "session created concurrently, dropping spare connection");
            let _ = pc.close().await;
        }
        Ok((entry, created))
    }

    pub fn remove(&self, partner: &PeerId) -> Option<Arc<SessionEntry>> {
        self.entries.write().remove(partner)
    }

    pub fn partners(&self) -> Vec<PeerId> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
