use crate::peer::state::SessionEntry;
use crate::peer::types::ServerConfig;
use crate::utils::add_ice_url_scheme;
use tracing::{debug, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;

/// Создает конфигурацию для peer connection
pub fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: get_user_ice_servers(servers),
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

/// ServerConfig → RTCIceServer, со схемой протокола в URL
pub fn get_user_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

/// Применяет ICE кандидат от удаленной стороны.
///
/// Пока remote description не установлен, кандидат откладывается и будет
/// применён в [`apply_pending_candidates`]. Ошибки хоста только логируются.
pub async fn apply_remote_candidate(entry: &SessionEntry, candidate: RTCIceCandidateInit) -> bool {
    let pc = entry.connection();
    if pc.remote_description().await.is_none() {
        debug!(partner = %entry.partner(), "remote description not set yet, queuing candidate");
        entry.queue_candidate(candidate);
        // описание могло появиться, пока мы ставили кандидат в очередь
        if pc.remote_description().await.is_some() {
            apply_pending_candidates(entry).await;
        }
        return true;
    }

    match pc.add_ice_candidate(candidate).await {
        Ok(()) => {
            debug!(partner = %entry.partner(), "added remote ICE candidate");
            true
        }
        Err(e) => {
            warn!(partner = %entry.partner(), error = %e, "failed to add ICE candidate");
            false
        }
    }
}

/// Применяет все отложенные кандидаты после установки remote description
pub async fn apply_pending_candidates(entry: &SessionEntry) {
    let candidates = entry.take_pending_candidates();
    if candidates.is_empty() {
        return;
    }
    debug!(partner = %entry.partner(), count = candidates.len(), "applying pending candidates");
    for candidate in candidates {
        if let Err(e) = entry.connection().add_ice_candidate(candidate).await {
            warn!(partner = %entry.partner(), error = %e, "failed to apply pending candidate");
        }
    }
}

/// Тип кандидата по строке SDP (`host`, `srflx`, `relay`, ...)
pub fn candidate_type(candidate: &str) -> Option<&str> {
    let mut parts = candidate.split_whitespace();
    while let Some(part) = parts.next() {
        if part == "typ" {
            return parts.next();
        }
    }
    None
}
