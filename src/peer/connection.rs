use crate::logger::{dump_candidate, dump_selected_pair};
use crate::peer::data_channel::{attach_dc, close_replaced};
use crate::peer::events::{resolve_observer, SessionObserver};
use crate::peer::ice::{candidate_type, rtc_config};
use crate::peer::state::{SessionEntry, SessionPhase};
use crate::peer::types::{PeerId, ServerConfig};
use crate::signaling::{encode, CodeType};
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;

/// Создаёт peer connection с общей для процесса ICE конфигурацией
pub struct PeerFactory {
    api: API,
    config: RTCConfiguration,
}

impl PeerFactory {
    pub fn new(servers: &[ServerConfig]) -> Self {
        Self::with_setting_engine(SettingEngine::default(), servers)
    }

    /// Для тестов с виртуальной сетью и укороченными ICE таймаутами
    pub fn with_setting_engine(setting: SettingEngine, servers: &[ServerConfig]) -> Self {
        Self {
            api: APIBuilder::new().with_setting_engine(setting).build(),
            config: rtc_config(servers),
        }
    }

    pub fn config(&self) -> &RTCConfiguration {
        &self.config
    }

    pub async fn new_peer(&self) -> Result<Arc<RTCPeerConnection>, webrtc::Error> {
        let pc = self.api.new_peer_connection(self.config.clone()).await?;
        Ok(Arc::new(pc))
    }
}

/// Вешает обработчики на только что созданную сессию.
///
/// Обработчики держат `Weak` на запись: peer connection хранит их у себя,
/// сильная ссылка дала бы цикл.
pub(crate) fn wire_session(
    entry: &Arc<SessionEntry>,
    local_id: PeerId,
    default_observer: Arc<dyn SessionObserver>,
) {
    let pc = entry.connection();
    let partner = entry.partner().clone();

    // Локальные кандидаты отдаём наблюдателю готовыми кодами для ручной пересылки
    pc.on_ice_candidate(Box::new({
        let weak = Arc::downgrade(entry);
        let partner = partner.clone();
        let default_observer = default_observer.clone();
        move |cand: Option<RTCIceCandidate>| {
            if let Some(c) = cand {
                dump_candidate(&partner, "LOCAL", &c);
                let code = c
                    .to_json()
                    .map_err(|e| e.to_string())
                    .and_then(|init| {
                        let kind = candidate_type(&init.candidate)
                            .unwrap_or("unknown")
                            .to_string();
                        encode(CodeType::Candidate, &local_id, &init)
                            .map(|code| (kind, code))
                            .map_err(|e| e.to_string())
                    });
                match code {
                    Ok((kind, code)) => {
                        info!(%partner, typ = %kind, "candidate for {partner}: {code}");
                        resolve_observer(&weak, &default_observer)
                            .on_local_candidate(&partner, &code);
                    }
                    Err(e) => warn!(%partner, error = %e, "cannot encode local candidate"),
                }
            } else {
                // cand == None означает конец сбора
                debug!(%partner, "ICE candidate gathering completed");
            }
            Box::pin(async {})
        }
    }));

    // Канал, созданный собеседником (он был инициатором)
    pc.on_data_channel(Box::new({
        let weak = Arc::downgrade(entry);
        let partner = partner.clone();
        let default_observer = default_observer.clone();
        move |dc: Arc<RTCDataChannel>| {
            let previous = match weak.upgrade() {
                Some(entry) => {
                    info!(%partner, label = dc.label(), "data channel received from partner");
                    let previous = entry.set_channel(dc.clone());
                    attach_dc(&entry, &dc, default_observer.clone());
                    previous
                }
                None => {
                    debug!(%partner, "data channel for a closed session ignored");
                    None
                }
            };
            let partner = partner.clone();
            Box::pin(async move {
                if let Some(old) = previous {
                    close_replaced(&partner, old).await;
                }
            })
        }
    }));

    pc.on_peer_connection_state_change(Box::new({
        let weak = Arc::downgrade(entry);
        move |st: RTCPeerConnectionState| {
            info!(%partner, state = %st, "peer connection state changed");
            let entry = weak.upgrade();
            match st {
                RTCPeerConnectionState::Failed => {
                    if let Some(entry) = entry {
                        // сессия остаётся в реестре, закрывает её только пользователь
                        entry.set_phase(SessionPhase::Closed);
                        let partner = partner.clone();
                        tokio::spawn(async move {
                            dump_selected_pair(&partner, entry.connection(), "FAILED").await;
                        });
                    }
                }
                RTCPeerConnectionState::Closed => {
                    if let Some(entry) = entry {
                        entry.set_phase(SessionPhase::Closed);
                    }
                }
                RTCPeerConnectionState::Disconnected => {
                    warn!(%partner, "peer connection disconnected, waiting for ICE to recover");
                }
                _ => {}
            }
            Box::pin(async {})
        }
    }));
}
