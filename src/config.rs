// Конфигурация приложения
// Логирование можно отключить только в режиме разработки

use crate::error::ConfigError;
use crate::peer::types::ServerConfig;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true; // В режиме отладки логирование включено

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // В продакшене логирование отключено

// Дополнительные настройки для режима разработки
#[cfg(debug_assertions)]
pub mod dev {
    // Для полного отключения логирования в режиме разработки
    // измените эту константу на false
    // ВАЖНО: Эта настройка работает только в debug режиме!
    pub const ENABLE_LOGGING: bool = true;
}

#[cfg(not(debug_assertions))]
pub mod dev {
    // В продакшене все дополнительные настройки отключены
    pub const ENABLE_LOGGING: bool = false;
}

/// Метка data channel для чата
pub const CHANNEL_LABEL: &str = "chat";

/// Публичные STUN серверы по умолчанию
pub static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![
        ServerConfig::stun("default-stun", "stun:stun.l.google.com:19302"),
        ServerConfig::stun("default-stun-1", "stun:stun1.l.google.com:19302"),
        ServerConfig::stun("mozilla-stun", "stun:stun.services.mozilla.com"),
    ]
});

const DATA_DIR_ENV: &str = "P2PCHAT_DATA_DIR";
const STRICT_ENV: &str = "P2PCHAT_STRICT";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub ice_servers: Vec<ServerConfig>,
    /// Каталог для `storage.json`
    pub data_dir: PathBuf,
    pub channel_label: String,
    /// Ответ/кандидат без сессии становится ошибкой, а не no-op
    pub strict: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            data_dir: PathBuf::from(".p2pchat"),
            channel_label: CHANNEL_LABEL.to_string(),
            strict: false,
        }
    }
}

impl AppConfig {
    /// Читает JSON конфиг, затем применяет переменные окружения
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: AppConfig = serde_json::from_str(&raw)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Конфиг по умолчанию + переменные окружения
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = AppConfig::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            if !dir.trim().is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }
        if let Ok(flag) = std::env::var(STRICT_ENV) {
            self.strict = matches!(flag.trim(), "1" | "true" | "yes");
        }
    }

    /// Те же правила, что и при установке пользовательских ICE серверов
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_label.is_empty() {
            return Err(ConfigError::Invalid("channel label cannot be empty".into()));
        }
        for server in &self.ice_servers {
            if server.url.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "server {} has an empty URL",
                    server.id
                )));
            }
            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(ConfigError::Invalid(format!(
                    "TURN server {} requires username and credential",
                    server.id
                )));
            }
        }
        Ok(())
    }

    pub fn storage_path(&self) -> PathBuf {
        self.data_dir.join("storage.json")
    }
}
