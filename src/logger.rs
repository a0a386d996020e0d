use std::fmt;
use tracing::{debug, info, warn};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::EnvFilter;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::RTCPeerConnection;

use crate::peer::types::PeerId;

const DEFAULT_FILTER: &str = "info,webrtc=warn,webrtc_ice=warn";

/// Метки времени в локальной зоне, с миллисекундами
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        write!(
            w,
            "{}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f")
        )
    }
}

pub fn logging_enabled() -> bool {
    // В режиме разработки дополнительно проверяем dev::ENABLE_LOGGING
    crate::config::LOGGING_ENABLED && crate::config::dev::ENABLE_LOGGING
}

/// Ставит глобальный subscriber; повторный вызов ничего не делает
pub fn init() {
    if !logging_enabled() {
        return;
    }
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(LocalTimer)
        .with_target(false)
        .try_init();
}

/// Печать ICE-candidate при появлении (Trickle-ICE)
pub fn dump_candidate(partner: &PeerId, label: &str, cand: &RTCIceCandidate) {
    match cand.to_json() {
        Ok(init) => debug!(
            %partner,
            candidate = %init.candidate,
            sdp_mid = ?init.sdp_mid,
            sdp_mline_index = ?init.sdp_mline_index,
            "trickle {label}"
        ),
        Err(e) => warn!(%partner, error = %e, "cannot serialize {label} candidate"),
    }
}

/// Быстрый снимок getStats → выбранная пара
pub async fn dump_selected_pair(partner: &PeerId, pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, v) in stats.reports {
        if let webrtc::stats::StatsReportType::CandidatePair(pair) = v {
            if pair.nominated {
                info!(
                    %partner,
                    "STATS {moment}: {}:{} bytes={}/{} state={:?}",
                    pair.local_candidate_id,
                    pair.remote_candidate_id,
                    pair.bytes_sent,
                    pair.bytes_received,
                    pair.state
                );
            }
        }
    }
}
