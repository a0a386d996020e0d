//! Жизненный цикл P2P сессий: offer → answer → кандидаты → канал → close.
//!
//! Все операции асинхронные и не блокируют друг друга: переговоры с разными
//! собеседниками свободно перемежаются. Порядок кодов для одного собеседника
//! обеспечивает человек, который их пересылает; контроллер переживает
//! перепутанные и потерянные коды, ничего не роняя.

use crate::config::{AppConfig, CHANNEL_LABEL};
use crate::error::SessionError;
use crate::peer::connection::{wire_session, PeerFactory};
use crate::peer::data_channel::{attach_dc, channel_status, close_replaced, send_wire};
use crate::peer::events::SessionObserver;
use crate::peer::ice::{apply_pending_candidates, apply_remote_candidate};
use crate::peer::state::{SessionEntry, SessionPhase, SessionRegistry};
use crate::peer::types::{PeerId, SessionStatus, WireMessage};
use crate::signaling::{decode, encode, CodeType, SignalingMessage};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Ответ или кандидат для неизвестного собеседника → `SessionError::NoSession`
    pub strict: bool,
    pub channel_label: String,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            strict: false,
            channel_label: CHANNEL_LABEL.to_string(),
        }
    }
}

impl From<&AppConfig> for ControllerOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            strict: config.strict,
            channel_label: config.channel_label.clone(),
        }
    }
}

/// Результат обработки введённого вручную кода
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandledCode {
    /// Код ответа, который нужно переслать инициатору
    Offer { partner: PeerId, answer_code: String },
    Answer { partner: PeerId, applied: bool },
    Candidate { partner: PeerId, applied: bool },
}

struct ControllerInner {
    local_id: PeerId,
    registry: SessionRegistry,
    default_observer: Arc<dyn SessionObserver>,
    observers: RwLock<HashMap<PeerId, Arc<dyn SessionObserver>>>,
    options: ControllerOptions,
}

/// Единственный, кто пишет в реестр сессий. Клонируется дёшево.
#[derive(Clone)]
pub struct PeerController {
    inner: Arc<ControllerInner>,
}

impl PeerController {
    pub fn new(
        local_id: PeerId,
        factory: PeerFactory,
        default_observer: Arc<dyn SessionObserver>,
        options: ControllerOptions,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                local_id,
                registry: SessionRegistry::new(factory),
                default_observer,
                observers: RwLock::new(HashMap::new()),
                options,
            }),
        }
    }

    pub fn from_config(
        local_id: PeerId,
        config: &AppConfig,
        default_observer: Arc<dyn SessionObserver>,
    ) -> Self {
        Self::new(
            local_id,
            PeerFactory::new(&config.ice_servers),
            default_observer,
            ControllerOptions::from(config),
        )
    }

    pub fn local_id(&self) -> &PeerId {
        &self.inner.local_id
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    pub fn options(&self) -> &ControllerOptions {
        &self.inner.options
    }

    /// Наблюдатель для одного собеседника; действует и на уже открытую сессию,
    /// живёт до `close`
    pub fn set_observer(&self, partner: &PeerId, observer: Arc<dyn SessionObserver>) {
        self.inner
            .observers
            .write()
            .insert(partner.clone(), observer.clone());
        if let Some(entry) = self.inner.registry.get(partner) {
            entry.set_observer(Some(observer));
        }
    }

    pub fn clear_observer(&self, partner: &PeerId) {
        self.inner.observers.write().remove(partner);
        if let Some(entry) = self.inner.registry.get(partner) {
            entry.set_observer(None);
        }
    }

    async fn session(&self, partner: &PeerId) -> Result<Arc<SessionEntry>, SessionError> {
        if *partner == self.inner.local_id {
            return Err(SessionError::SelfSession(partner.clone()));
        }
        let (entry, created) = self.inner.registry.get_or_create(partner).await?;
        if created {
            debug!(%partner, "created session");
            let observer = self.inner.observers.read().get(partner).cloned();
            entry.set_observer(observer);
            wire_session(
                &entry,
                self.inner.local_id.clone(),
                self.inner.default_observer.clone(),
            );
        }
        Ok(entry)
    }

    /// Запись для ответа/кандидата; её отсутствие не ошибка, если не strict
    fn existing(&self, partner: &PeerId, op: &str) -> Result<Option<Arc<SessionEntry>>, SessionError> {
        match self.inner.registry.get(partner) {
            Some(entry) => Ok(Some(entry)),
            None if self.inner.options.strict => Err(SessionError::NoSession(partner.clone())),
            None => {
                debug!(%partner, op, "no session, nothing to do");
                Ok(None)
            }
        }
    }

    /// A-сторона: создаём канал и OFFER, возвращаем код для ручной пересылки
    pub async fn create_offer(&self, partner: &PeerId) -> Result<String, SessionError> {
        let entry = self.session(partner).await?;
        let pc = entry.connection().clone();

        let dc = pc
            .create_data_channel(
                &self.inner.options.channel_label,
                Some(RTCDataChannelInit::default()),
            )
            .await?;
        let previous = entry.set_channel(dc.clone());
        attach_dc(&entry, &dc, self.inner.default_observer.clone());
        if let Some(old) = previous {
            close_replaced(partner, old).await;
        }
        entry.set_phase(SessionPhase::Negotiating);

        let offer = pc.create_offer(None).await?;
        pc.set_local_description(offer.clone()).await?;
        // НЕ ждем ICE gathering - кандидаты уходят отдельными кодами
        let desc = pc.local_description().await.unwrap_or(offer);

        let code = encode(CodeType::Offer, &self.inner.local_id, &desc)?;
        info!(%partner, len = code.len(), "P2P offer generated, send this code manually to {partner}");
        debug!(%partner, "offer code: {code}");
        Ok(code)
    }

    /// B-сторона: приняли OFFER, создаём ANSWER
    pub async fn accept_offer(&self, partner: &PeerId, offer_code: &str) -> Result<String, SessionError> {
        let msg = decode(offer_code)?;
        self.accept_offer_msg(partner, msg).await
    }

    async fn accept_offer_msg(
        &self,
        partner: &PeerId,
        msg: SignalingMessage,
    ) -> Result<String, SessionError> {
        let msg = msg.expect_kind(CodeType::Offer)?;
        if msg.sender != *partner {
            warn!(%partner, sender = %msg.sender, "offer code was produced by another peer");
        }
        // разбираем до того, как трогать реестр
        let offer: RTCSessionDescription = msg.payload_as()?;

        let entry = self.session(partner).await?;
        entry.set_phase(SessionPhase::Negotiating);
        let pc = entry.connection().clone();

        pc.set_remote_description(offer).await?;
        apply_pending_candidates(&entry).await;

        let answer = pc.create_answer(None).await?;
        pc.set_local_description(answer.clone()).await?;
        let desc = pc.local_description().await.unwrap_or(answer);

        let code = encode(CodeType::Answer, &self.inner.local_id, &desc)?;
        info!(%partner, len = code.len(), "P2P answer generated, send this code manually to {partner}");
        debug!(%partner, "answer code: {code}");
        Ok(code)
    }

    /// A-сторона: получаем ANSWER и завершаем handshake
    pub async fn accept_answer(&self, partner: &PeerId, answer_code: &str) -> Result<bool, SessionError> {
        let msg = decode(answer_code)?;
        self.accept_answer_msg(partner, msg).await
    }

    async fn accept_answer_msg(
        &self,
        partner: &PeerId,
        msg: SignalingMessage,
    ) -> Result<bool, SessionError> {
        let msg = msg.expect_kind(CodeType::Answer)?;
        let answer: RTCSessionDescription = msg.payload_as()?;
        let Some(entry) = self.existing(partner, "accept_answer")? else {
            return Ok(false);
        };

        match entry.connection().set_remote_description(answer).await {
            Ok(()) => {
                info!(%partner, "remote answer set, connection should come up soon");
                apply_pending_candidates(&entry).await;
                Ok(true)
            }
            Err(e) => {
                warn!(%partner, error = %e, "failed to set remote description");
                Ok(false)
            }
        }
    }

    /// Кандидат от собеседника. Битые и запоздавшие кандидаты только логируются
    pub async fn add_remote_candidate(
        &self,
        partner: &PeerId,
        candidate_code: &str,
    ) -> Result<bool, SessionError> {
        let msg = decode(candidate_code)?;
        self.add_remote_candidate_msg(partner, msg).await
    }

    async fn add_remote_candidate_msg(
        &self,
        partner: &PeerId,
        msg: SignalingMessage,
    ) -> Result<bool, SessionError> {
        let msg = msg.expect_kind(CodeType::Candidate)?;
        let Some(entry) = self.existing(partner, "add_remote_candidate")? else {
            return Ok(false);
        };

        let candidate: RTCIceCandidateInit = match msg.payload_as() {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!(%partner, error = %e, "malformed candidate payload ignored");
                return Ok(false);
            }
        };
        Ok(apply_remote_candidate(&entry, candidate).await)
    }

    /// Любой код `TYP:ID:{JSON}`; собеседник берётся из кода
    pub async fn handle_code(&self, code: &str) -> Result<HandledCode, SessionError> {
        let msg = decode(code)?;
        let partner = msg.sender.clone();
        match msg.kind {
            CodeType::Offer => {
                let answer_code = self.accept_offer_msg(&partner, msg).await?;
                Ok(HandledCode::Offer {
                    partner,
                    answer_code,
                })
            }
            CodeType::Answer => {
                let applied = self.accept_answer_msg(&partner, msg).await?;
                Ok(HandledCode::Answer { partner, applied })
            }
            CodeType::Candidate => {
                let applied = self.add_remote_candidate_msg(&partner, msg).await?;
                Ok(HandledCode::Candidate { partner, applied })
            }
        }
    }

    /// `false`, если канал не открыт; локальное сохранение остаётся вызывающему
    pub async fn send(&self, partner: &PeerId, text: &str) -> bool {
        let Some(dc) = self
            .inner
            .registry
            .get(partner)
            .and_then(|entry| entry.channel())
        else {
            debug!(%partner, "no data channel, message not sent");
            return false;
        };
        let message = WireMessage {
            sender_id: self.inner.local_id.clone(),
            text: text.to_string(),
        };
        send_wire(&dc, partner, &message).await
    }

    pub fn status(&self, partner: &PeerId) -> SessionStatus {
        self.inner
            .registry
            .get(partner)
            .map(|entry| channel_status(&entry))
            .unwrap_or(SessionStatus::None)
    }

    /// ручное разъединение; для неизвестного собеседника ничего не делает.
    /// Наблюдатель собеседника тоже снимается, новую сессию подписывают заново
    pub async fn close(&self, partner: &PeerId) {
        self.inner.observers.write().remove(partner);
        let Some(entry) = self.inner.registry.remove(partner) else {
            debug!(%partner, "close: no session");
            return;
        };
        entry.set_phase(SessionPhase::Closed);

        if let Some(dc) = entry.channel() {
            if let Err(e) = dc.close().await {
                debug!(%partner, error = %e, "data channel close failed");
            }
        }
        if let Err(e) = entry.connection().close().await {
            debug!(%partner, error = %e, "peer connection close failed");
        }
        info!(%partner, "P2P connection closed");
    }

    pub async fn close_all(&self) {
        for partner in self.inner.registry.partners() {
            self.close(&partner).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SignalingError;
    use crate::peer::events::{NoopObserver, SessionEvent};
    use tokio::sync::mpsc;
    use webrtc::data_channel::data_channel_state::RTCDataChannelState;

    const LOCAL: &str = "P2P-LOCAL01";
    const REMOTE: &str = "P2P-REMOTE1";
    const CANDIDATE_JSON: &str =
        r#"{"candidate":"candidate:1 1 udp 2130706431 10.0.0.2 5000 typ host","sdpMid":"0","sdpMLineIndex":0}"#;

    fn controller(options: ControllerOptions) -> PeerController {
        PeerController::new(
            PeerId::from(LOCAL),
            PeerFactory::new(&[]),
            Arc::new(NoopObserver),
            options,
        )
    }

    #[tokio::test]
    async fn close_without_session_is_noop() {
        let ctl = controller(ControllerOptions::default());
        ctl.close(&PeerId::from(REMOTE)).await;
        ctl.close(&PeerId::from(REMOTE)).await;
        assert!(ctl.registry().is_empty());
        assert_eq!(ctl.status(&PeerId::from(REMOTE)), SessionStatus::None);
    }

    #[tokio::test]
    async fn offer_leaves_session_connecting() {
        let ctl = controller(ControllerOptions::default());
        let remote = PeerId::from(REMOTE);

        let code = ctl.create_offer(&remote).await.unwrap();
        assert!(code.starts_with("OFFER:P2P-LOCAL01:{"));
        let msg = decode(&code).unwrap();
        let desc: RTCSessionDescription = msg.payload_as().unwrap();
        assert!(desc.sdp.starts_with("v=0"));

        assert_eq!(ctl.status(&remote), SessionStatus::Connecting);
        assert!(!ctl.send(&remote, "too early").await);

        ctl.close(&remote).await;
        assert_eq!(ctl.status(&remote), SessionStatus::None);
        assert!(ctl.registry().is_empty());
    }

    #[tokio::test]
    async fn send_without_session_returns_false() {
        let ctl = controller(ControllerOptions::default());
        assert!(!ctl.send(&PeerId::from(REMOTE), "hallo").await);
    }

    #[tokio::test]
    async fn answer_and_candidate_without_session_are_tolerated() {
        let ctl = controller(ControllerOptions::default());
        let remote = PeerId::from(REMOTE);

        let answer = format!(r#"ANSWER:{REMOTE}:{{"type":"answer","sdp":"v=0\r\n"}}"#);
        assert!(!ctl.accept_answer(&remote, &answer).await.unwrap());

        let candidate = format!("KANDIDAT:{REMOTE}:{CANDIDATE_JSON}");
        assert!(!ctl.add_remote_candidate(&remote, &candidate).await.unwrap());
        assert!(ctl.registry().is_empty());
    }

    #[tokio::test]
    async fn strict_mode_reports_missing_session() {
        let ctl = controller(ControllerOptions {
            strict: true,
            ..Default::default()
        });
        let remote = PeerId::from(REMOTE);
        let candidate = format!("KANDIDAT:{REMOTE}:{CANDIDATE_JSON}");
        assert!(matches!(
            ctl.add_remote_candidate(&remote, &candidate).await,
            Err(SessionError::NoSession(_))
        ));
        let answer = format!(r#"ANSWER:{REMOTE}:{{"type":"answer","sdp":"v=0\r\n"}}"#);
        assert!(matches!(
            ctl.accept_answer(&remote, &answer).await,
            Err(SessionError::NoSession(_))
        ));
        assert!(ctl.registry().is_empty());
    }

    #[tokio::test]
    async fn repeated_offer_closes_replaced_channel() {
        let ctl = controller(ControllerOptions::default());
        let remote = PeerId::from(REMOTE);

        ctl.create_offer(&remote).await.unwrap();
        let entry = ctl.registry().get(&remote).unwrap();
        let first = entry.channel().unwrap();

        ctl.create_offer(&remote).await.unwrap();
        let second = entry.channel().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(matches!(
            first.ready_state(),
            RTCDataChannelState::Closing | RTCDataChannelState::Closed
        ));
        // закрытие старого канала не трогает сессию
        assert_eq!(entry.phase(), SessionPhase::Negotiating);
        assert_eq!(ctl.status(&remote), SessionStatus::Connecting);

        ctl.close(&remote).await;
    }

    #[tokio::test]
    async fn queued_candidates_are_applied_with_remote_description() {
        let a = controller(ControllerOptions::default());
        let b = PeerController::new(
            PeerId::from(REMOTE),
            PeerFactory::new(&[]),
            Arc::new(NoopObserver),
            ControllerOptions::default(),
        );
        let a_id = PeerId::from(LOCAL);
        let b_id = PeerId::from(REMOTE);

        let offer = a.create_offer(&b_id).await.unwrap();
        let from_b = format!("KANDIDAT:{REMOTE}:{CANDIDATE_JSON}");
        assert!(a.add_remote_candidate(&b_id, &from_b).await.unwrap());
        let a_entry = a.registry().get(&b_id).unwrap();
        assert_eq!(a_entry.pending_candidate_count(), 1);

        // у B запись уже есть, а offer ещё не применён
        let (b_entry, _) = b.registry().get_or_create(&a_id).await.unwrap();
        let from_a = format!("KANDIDAT:{LOCAL}:{CANDIDATE_JSON}");
        assert!(b.add_remote_candidate(&a_id, &from_a).await.unwrap());
        assert_eq!(b_entry.pending_candidate_count(), 1);

        let answer = b.accept_offer(&a_id, &offer).await.unwrap();
        assert_eq!(b_entry.pending_candidate_count(), 0);

        assert!(a.accept_answer(&b_id, &answer).await.unwrap());
        assert_eq!(a_entry.pending_candidate_count(), 0);
        assert_eq!(a.status(&b_id), SessionStatus::Connecting);

        a.close(&b_id).await;
        b.close(&a_id).await;
    }

    #[tokio::test]
    async fn close_drops_partner_observer() {
        let ctl = controller(ControllerOptions::default());
        let remote = PeerId::from(REMOTE);
        ctl.set_observer(&remote, Arc::new(NoopObserver));
        ctl.create_offer(&remote).await.unwrap();
        assert!(ctl.registry().get(&remote).unwrap().observer().is_some());

        ctl.close(&remote).await;
        assert!(ctl.inner.observers.read().is_empty());

        // наблюдатель без сессии тоже снимается
        ctl.set_observer(&remote, Arc::new(NoopObserver));
        ctl.close(&remote).await;
        assert!(ctl.inner.observers.read().is_empty());
    }

    #[tokio::test]
    async fn malformed_codes_do_not_touch_registry() {
        let ctl = controller(ControllerOptions::default());
        let remote = PeerId::from(REMOTE);

        assert!(matches!(
            ctl.accept_offer(&remote, "OFFER-only").await,
            Err(SessionError::Signaling(SignalingError::Format(_)))
        ));
        assert!(matches!(
            ctl.handle_code("PING:P2P-REMOTE1:{}").await,
            Err(SessionError::Signaling(SignalingError::UnknownCodeType(_)))
        ));
        assert!(matches!(
            ctl.accept_offer(&remote, "OFFER:P2P-REMOTE1:{not json").await,
            Err(SessionError::Signaling(SignalingError::Payload(_)))
        ));
        assert!(matches!(
            ctl.accept_offer(&remote, &format!("KANDIDAT:{REMOTE}:{CANDIDATE_JSON}")).await,
            Err(SessionError::Signaling(SignalingError::WrongCodeType { .. }))
        ));
        assert!(ctl.registry().is_empty());
    }

    #[tokio::test]
    async fn self_session_is_rejected() {
        let ctl = controller(ControllerOptions::default());
        assert!(matches!(
            ctl.create_offer(&PeerId::from(LOCAL)).await,
            Err(SessionError::SelfSession(_))
        ));
        assert!(ctl.registry().is_empty());
    }

    #[tokio::test]
    async fn early_candidate_is_queued_until_remote_description() {
        let ctl = controller(ControllerOptions::default());
        let remote = PeerId::from(REMOTE);
        ctl.create_offer(&remote).await.unwrap();

        let candidate = format!("KANDIDAT:{REMOTE}:{CANDIDATE_JSON}");
        assert!(ctl.add_remote_candidate(&remote, &candidate).await.unwrap());
        let entry = ctl.registry().get(&remote).unwrap();
        assert_eq!(entry.pending_candidate_count(), 1);

        // битая нагрузка кандидата только логируется
        let broken = format!("KANDIDAT:{REMOTE}:{{\"candidate\":42}}");
        assert!(!ctl.add_remote_candidate(&remote, &broken).await.unwrap());
        assert_eq!(entry.pending_candidate_count(), 1);

        ctl.close(&remote).await;
    }

    #[tokio::test]
    async fn local_candidates_are_reported_as_codes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctl = PeerController::new(
            PeerId::from(LOCAL),
            PeerFactory::new(&[]),
            Arc::new(NoopObserver),
            ControllerOptions::default(),
        );
        let remote = PeerId::from(REMOTE);
        ctl.set_observer(&remote, Arc::new(tx));
        ctl.create_offer(&remote).await.unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(10), rx.recv())
            .await
            .ok()
            .flatten();
        // без сетевых интерфейсов кандидатов может не быть вовсе
        if let Some(SessionEvent::LocalCandidate { partner, code }) = event {
            assert_eq!(partner, remote);
            let msg = decode(&code).unwrap();
            assert_eq!(msg.kind, CodeType::Candidate);
            assert_eq!(msg.sender, PeerId::from(LOCAL));
            let init: RTCIceCandidateInit = msg.payload_as().unwrap();
            assert!(init.candidate.starts_with("candidate:"));
        }
        ctl.close(&remote).await;
    }
}
