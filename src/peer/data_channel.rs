use crate::peer::events::{resolve_observer, SessionObserver};
use crate::peer::state::{SessionEntry, SessionPhase};
use crate::peer::types::{PeerId, SessionStatus, WireMessage};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

/// Канал всё ещё тот, что хранится в записи (а не заменённый новым)
fn is_current(entry: &SessionEntry, dc: &Weak<RTCDataChannel>) -> bool {
    entry
        .channel()
        .is_some_and(|current| std::ptr::eq(Arc::as_ptr(&current), dc.as_ptr()))
}

/// Закрывает канал, который запись больше не хранит
pub(crate) async fn close_replaced(partner: &PeerId, old: Arc<RTCDataChannel>) {
    debug!(%partner, label = old.label(), "closing replaced data channel");
    if let Err(e) = old.close().await {
        debug!(%partner, error = %e, "replaced data channel close failed");
    }
}

/// общий обработчик data-channel: и для своего, и для пришедшего от собеседника.
/// Канал уже должен быть сохранён в записи
pub(crate) fn attach_dc(
    entry: &Arc<SessionEntry>,
    dc: &Arc<RTCDataChannel>,
    default_observer: Arc<dyn SessionObserver>,
) {
    let partner = entry.partner().clone();
    debug!(%partner, label = dc.label(), "attaching data channel handlers");

    dc.on_open(Box::new({
        let weak = Arc::downgrade(entry);
        let this = Arc::downgrade(dc);
        let partner = partner.clone();
        let default_observer = default_observer.clone();
        move || {
            match weak.upgrade() {
                Some(entry) if !is_current(&entry, &this) => {
                    debug!(%partner, "replaced data channel opened, ignored");
                }
                entry => {
                    info!(%partner, "P2P data channel is open");
                    if let Some(entry) = entry {
                        entry.set_phase(SessionPhase::Open);
                    }
                    resolve_observer(&weak, &default_observer).on_open(&partner);
                }
            }
            Box::pin(async {})
        }
    }));

    dc.on_message(Box::new({
        let weak = Arc::downgrade(entry);
        let partner = partner.clone();
        let default_observer = default_observer.clone();
        move |msg: DataChannelMessage| {
            let observer = resolve_observer(&weak, &default_observer);
            match serde_json::from_slice::<WireMessage>(&msg.data) {
                Ok(message) => {
                    debug!(%partner, sender = %message.sender_id, len = message.text.len(), "received message");
                    observer.on_message(&partner, message);
                }
                Err(e) => {
                    warn!(%partner, error = %e, len = msg.data.len(), "undecodable message on data channel");
                    observer.on_error(&partner, &format!("undecodable message: {e}"));
                }
            }
            Box::pin(async {})
        }
    }));

    dc.on_close(Box::new({
        let weak = Arc::downgrade(entry);
        let this = Arc::downgrade(dc);
        let partner = partner.clone();
        let default_observer = default_observer.clone();
        move || {
            match weak.upgrade() {
                // сессия живёт на новом канале
                Some(entry) if !is_current(&entry, &this) => {
                    debug!(%partner, "replaced data channel closed");
                }
                entry => {
                    info!(%partner, "P2P data channel closed");
                    if let Some(entry) = entry {
                        entry.set_phase(SessionPhase::Closed);
                    }
                    resolve_observer(&weak, &default_observer).on_close(&partner);
                }
            }
            Box::pin(async {})
        }
    }));

    dc.on_error(Box::new({
        let weak = Arc::downgrade(entry);
        move |err: webrtc::Error| {
            warn!(%partner, error = %err, "P2P data channel error");
            resolve_observer(&weak, &default_observer).on_error(&partner, &err.to_string());
            Box::pin(async {})
        }
    }));
}

/// текст по каналу; `false`, если канал ещё (или уже) не открыт
pub async fn send_wire(dc: &RTCDataChannel, partner: &PeerId, message: &WireMessage) -> bool {
    let state = dc.ready_state();
    if state != RTCDataChannelState::Open {
        debug!(%partner, %state, "data channel not open, message not sent");
        return false;
    }

    let payload = match serde_json::to_string(message) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(%partner, error = %e, "cannot serialize message");
            return false;
        }
    };

    match dc.send_text(payload).await {
        Ok(_) => true,
        Err(e) => {
            warn!(%partner, error = %e, "send failed");
            false
        }
    }
}

/// Сначала готовность канала, затем фаза переговоров
pub fn channel_status(entry: &SessionEntry) -> SessionStatus {
    if let Some(dc) = entry.channel() {
        match dc.ready_state() {
            RTCDataChannelState::Connecting => return SessionStatus::Connecting,
            RTCDataChannelState::Open => return SessionStatus::Open,
            RTCDataChannelState::Closing | RTCDataChannelState::Closed => {
                return SessionStatus::Closed
            }
            _ => {}
        }
    }
    match entry.phase() {
        SessionPhase::Negotiating => SessionStatus::Connecting,
        SessionPhase::Open => SessionStatus::Open,
        SessionPhase::Closed => SessionStatus::Closed,
    }
}
