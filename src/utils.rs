use crate::peer::types::{PeerId, ServerConfig};
use rand::Rng;

/// Префикс локальных идентификаторов
pub const LOCAL_ID_PREFIX: &str = "P2P-";

const ID_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const ID_SUFFIX_LEN: usize = 7;

/// Случайный идентификатор вида `P2P-7KQ2ZXA`; не криптостойкий,
/// но коллизии в маленькой группе маловероятны
pub fn random_id() -> PeerId {
    let mut rng = rand::rng();
    let suffix: String = (0..ID_SUFFIX_LEN)
        .map(|_| ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())] as char)
        .collect();
    PeerId::new(format!("{LOCAL_ID_PREFIX}{suffix}"))
}

/// Текущее время в миллисекундах
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// Функция для добавления схемы протокола к URL ICE сервера, если она отсутствует
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    // Если url уже начинается с "turn:" или "stun:", возвращаем как есть
    if config.url.starts_with("turn:")
        || config.url.starts_with("turns:")
        || config.url.starts_with("stun:")
    {
        config.url.clone()
    } else {
        // В зависимости от типа сервера добавляем нужную схему
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_id_has_prefix_and_base36_suffix() {
        let id = random_id();
        let suffix = id.as_str().strip_prefix(LOCAL_ID_PREFIX).unwrap();
        assert_eq!(suffix.len(), ID_SUFFIX_LEN);
        assert!(suffix
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }

    #[test]
    fn scheme_is_added_by_server_type() {
        let mut server = ServerConfig::stun("a", "stun.example.org:3478");
        assert_eq!(add_ice_url_scheme(&server), "stun:stun.example.org:3478");

        server.r#type = "turn".into();
        assert_eq!(add_ice_url_scheme(&server), "turn:stun.example.org:3478");

        server.url = "stun:already.example.org".into();
        assert_eq!(add_ice_url_scheme(&server), "stun:already.example.org");
    }
}
