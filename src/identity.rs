use crate::peer::types::PeerId;
use crate::store::KeyValueStore;
use crate::utils::random_id;
use std::sync::Arc;
use tracing::{info, warn};

/// Ключ, под которым хранится локальный идентификатор
pub const LOCAL_ID_KEY: &str = "localP2PID";

/// Генерирует и хранит собственный идентификатор узла
pub struct IdentityStore {
    store: Arc<dyn KeyValueStore>,
}

impl IdentityStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// При первом вызове создаёт `P2P-XXXXXXX` и сохраняет его,
    /// дальше всегда возвращает сохранённое значение
    pub fn get_or_create_local_identifier(&self) -> PeerId {
        match self.store.get(LOCAL_ID_KEY) {
            Ok(Some(stored)) if !stored.trim().is_empty() => return PeerId::new(stored),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "cannot read stored local id, generating a new one"),
        }

        let id = random_id();
        if let Err(e) = self.store.set(LOCAL_ID_KEY, id.as_str()) {
            warn!(error = %e, %id, "cannot persist local id");
        }
        info!(%id, "generated local id");
        id
    }
}
