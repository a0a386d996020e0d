//! Контакты, группы и история сообщений поверх P2P сессий.
//!
//! Всё хранится в key-value хранилище под ключами `contacts`, `messages`,
//! `myUserName`, значения в JSON.

use crate::config::AppConfig;
use crate::error::{ChatError, StoreError};
use crate::identity::IdentityStore;
use crate::peer::controller::PeerController;
use crate::peer::events::SessionObserver;
use crate::peer::types::{PeerId, SessionStatus, WireMessage};
use crate::store::{FileStore, KeyValueStore};
use crate::utils::now_millis;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

const CONTACTS_KEY: &str = "contacts";
const MESSAGES_KEY: &str = "messages";
const USER_NAME_KEY: &str = "myUserName";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub name: String,
    #[serde(rename = "isGroup")]
    pub is_group: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members: Option<Vec<PeerId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p2p_id: Option<PeerId>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    #[serde(rename = "senderID")]
    pub sender_id: PeerId,
    pub text: String,
    /// Unix время в миллисекундах
    pub timestamp: i64,
}

/// Итог отправки: сколько собеседников получили сообщение
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReport {
    pub delivered: usize,
    pub targets: usize,
}

impl SendReport {
    /// Сообщение осталось только в локальной истории
    pub fn is_local_only(&self) -> bool {
        self.delivered == 0
    }
}

#[derive(Default)]
struct BookState {
    contacts: BTreeMap<String, Contact>,
    messages: HashMap<String, Vec<ChatMessage>>,
    /// Номер последнего снимка истории
    messages_gen: u64,
    user_name: Option<String>,
}

/// Адресная книга и история чатов
pub struct ChatBook {
    store: Arc<dyn KeyValueStore>,
    local_id: PeerId,
    state: Mutex<BookState>,
    /// Номер снимка истории, который уже лежит в хранилище
    written_gen: Arc<Mutex<u64>>,
    listener: RwLock<Option<Arc<dyn SessionObserver>>>,
}

/// Пишет снимок истории, если в хранилище ещё нет более нового
fn write_messages(
    store: &dyn KeyValueStore,
    written_gen: &Mutex<u64>,
    snapshot_gen: u64,
    raw: &str,
) -> Result<(), StoreError> {
    let mut written = written_gen.lock();
    if snapshot_gen <= *written {
        return Ok(());
    }
    store.set(MESSAGES_KEY, raw)?;
    *written = snapshot_gen;
    Ok(())
}

fn load_json<T: serde::de::DeserializeOwned + Default>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<T, StoreError> {
    match store.get(key)? {
        Some(raw) => Ok(serde_json::from_str(&raw)?),
        None => Ok(T::default()),
    }
}

impl ChatBook {
    pub fn load(store: Arc<dyn KeyValueStore>, local_id: PeerId) -> Result<Self, StoreError> {
        let mut contacts: BTreeMap<String, Contact> = load_json(store.as_ref(), CONTACTS_KEY)?;
        let messages = load_json(store.as_ref(), MESSAGES_KEY)?;
        let user_name = store.get(USER_NAME_KEY)?;

        // собственная запись есть всегда
        contacts
            .entry(local_id.as_str().to_string())
            .or_insert_with(|| Contact {
                name: user_name.clone().unwrap_or_else(|| local_id.to_string()),
                is_group: false,
                members: None,
                p2p_id: Some(local_id.clone()),
            });

        debug!(contacts = contacts.len(), "chat book loaded");
        Ok(Self {
            store,
            local_id,
            state: Mutex::new(BookState {
                contacts,
                messages,
                messages_gen: 0,
                user_name,
            }),
            written_gen: Arc::new(Mutex::new(0)),
            listener: RwLock::new(None),
        })
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Дополнительный наблюдатель (UI), получает все события после записи в историю
    pub fn set_listener(&self, listener: Option<Arc<dyn SessionObserver>>) {
        *self.listener.write() = listener;
    }

    fn save_contacts(&self, contacts: &BTreeMap<String, Contact>) -> Result<(), StoreError> {
        let raw = serde_json::to_string(contacts)?;
        self.store.set(CONTACTS_KEY, &raw)
    }

    pub fn add_contact(&self, id: &PeerId, name: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        state.contacts.insert(
            id.as_str().to_string(),
            Contact {
                name: name.to_string(),
                is_group: false,
                members: None,
                p2p_id: Some(id.clone()),
            },
        );
        self.save_contacts(&state.contacts)?;
        info!(%id, name, "contact added");
        Ok(())
    }

    /// Группа всегда включает локального пользователя
    pub fn create_group(
        &self,
        id: &str,
        name: &str,
        members: &[PeerId],
    ) -> Result<(), StoreError> {
        let mut all = vec![self.local_id.clone()];
        for member in members {
            if !all.contains(member) {
                all.push(member.clone());
            }
        }

        let mut state = self.state.lock();
        state.contacts.insert(
            id.to_string(),
            Contact {
                name: name.to_string(),
                is_group: true,
                members: Some(all),
                p2p_id: None,
            },
        );
        self.save_contacts(&state.contacts)?;
        info!(group = id, name, "group created");
        Ok(())
    }

    pub fn contact(&self, chat_id: &str) -> Option<Contact> {
        self.state.lock().contacts.get(chat_id).cloned()
    }

    pub fn set_user_name(&self, name: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        self.store.set(USER_NAME_KEY, name)?;
        state.user_name = Some(name.to_string());
        if let Some(own) = state.contacts.get_mut(self.local_id.as_str()) {
            own.name = name.to_string();
        }
        self.save_contacts(&state.contacts)
    }

    pub fn user_name(&self) -> Option<String> {
        self.state.lock().user_name.clone()
    }

    /// Добавляет сообщение в память и возвращает снимок всей истории
    fn append(&self, chat_id: &str, message: ChatMessage) -> Result<(u64, String), StoreError> {
        let mut state = self.state.lock();
        state
            .messages
            .entry(chat_id.to_string())
            .or_default()
            .push(message);
        state.messages_gen += 1;
        Ok((state.messages_gen, serde_json::to_string(&state.messages)?))
    }

    pub fn record(&self, chat_id: &str, message: ChatMessage) -> Result<(), StoreError> {
        let (snapshot_gen, raw) = self.append(chat_id, message)?;
        write_messages(self.store.as_ref(), &self.written_gen, snapshot_gen, &raw)
    }

    /// Как `record`, но запись на диск уходит в blocking-пул tokio,
    /// если он есть: вызывается из обработчиков webrtc
    fn record_in_background(&self, chat_id: &str, message: ChatMessage) {
        let (snapshot_gen, raw) = match self.append(chat_id, message) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(chat = chat_id, error = %e, "cannot serialize chat history");
                return;
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = self.store.clone();
                let written_gen = self.written_gen.clone();
                handle.spawn_blocking(move || {
                    if let Err(e) = write_messages(store.as_ref(), &written_gen, snapshot_gen, &raw) {
                        warn!(error = %e, "cannot store incoming message");
                    }
                });
            }
            Err(_) => {
                if let Err(e) = write_messages(self.store.as_ref(), &self.written_gen, snapshot_gen, &raw) {
                    warn!(chat = chat_id, error = %e, "cannot store incoming message");
                }
            }
        }
    }

    pub fn messages(&self, chat_id: &str) -> Vec<ChatMessage> {
        self.state
            .lock()
            .messages
            .get(chat_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn last_message(&self, chat_id: &str) -> Option<ChatMessage> {
        self.state
            .lock()
            .messages
            .get(chat_id)
            .and_then(|messages| messages.last().cloned())
    }

    /// Чаты по времени последнего сообщения, новые сверху; пустые в конце
    pub fn chat_list(&self) -> Vec<(String, Contact)> {
        let state = self.state.lock();
        let mut list: Vec<(Option<i64>, String, Contact)> = state
            .contacts
            .iter()
            .map(|(id, contact)| {
                let last = state
                    .messages
                    .get(id)
                    .and_then(|messages| messages.last())
                    .map(|m| m.timestamp);
                (last, id.clone(), contact.clone())
            })
            .collect();
        // None < Some, поэтому сортировка по убыванию ставит пустые чаты в конец
        list.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        list.into_iter().map(|(_, id, contact)| (id, contact)).collect()
    }

    fn listener(&self) -> Option<Arc<dyn SessionObserver>> {
        self.listener.read().clone()
    }
}

impl SessionObserver for ChatBook {
    fn on_open(&self, partner: &PeerId) {
        if let Some(listener) = self.listener() {
            listener.on_open(partner);
        }
    }

    fn on_message(&self, partner: &PeerId, message: WireMessage) {
        let entry = ChatMessage {
            sender_id: message.sender_id.clone(),
            text: message.text.clone(),
            timestamp: now_millis(),
        };
        self.record_in_background(message.sender_id.as_str(), entry);
        if let Some(listener) = self.listener() {
            listener.on_message(partner, message);
        }
    }

    fn on_close(&self, partner: &PeerId) {
        if let Some(listener) = self.listener() {
            listener.on_close(partner);
        }
    }

    fn on_error(&self, partner: &PeerId, detail: &str) {
        if let Some(listener) = self.listener() {
            listener.on_error(partner, detail);
        }
    }

    fn on_local_candidate(&self, partner: &PeerId, code: &str) {
        if let Some(listener) = self.listener() {
            listener.on_local_candidate(partner, code);
        }
    }
}

/// Чат-клиент: контроллер сессий плюс адресная книга
pub struct ChatClient {
    controller: PeerController,
    book: Arc<ChatBook>,
}

impl ChatClient {
    /// Открывает `storage.json` в каталоге данных
    pub fn new(config: &AppConfig) -> Result<Self, ChatError> {
        config.validate()?;
        let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(config.storage_path())?);
        Self::with_store(config, store)
    }

    pub fn with_store(config: &AppConfig, store: Arc<dyn KeyValueStore>) -> Result<Self, ChatError> {
        let local_id = IdentityStore::new(store.clone()).get_or_create_local_identifier();
        let book = Arc::new(ChatBook::load(store, local_id.clone())?);
        let controller = PeerController::from_config(local_id, config, book.clone());
        Ok(Self { controller, book })
    }

    pub fn controller(&self) -> &PeerController {
        &self.controller
    }

    pub fn book(&self) -> &Arc<ChatBook> {
        &self.book
    }

    pub fn local_id(&self) -> &PeerId {
        self.controller.local_id()
    }

    fn targets(&self, chat_id: &str) -> Result<Vec<PeerId>, ChatError> {
        let contact = self
            .book
            .contact(chat_id)
            .ok_or_else(|| ChatError::UnknownChat(chat_id.to_string()))?;
        let local = self.local_id();
        let targets = if contact.is_group {
            contact
                .members
                .unwrap_or_default()
                .into_iter()
                .filter(|member| member != local)
                .collect()
        } else {
            let peer = contact
                .p2p_id
                .unwrap_or_else(|| PeerId::from(chat_id));
            if peer == *local {
                Vec::new()
            } else {
                vec![peer]
            }
        };
        Ok(targets)
    }

    /// Сохраняет сообщение локально и рассылает по открытым каналам
    pub async fn send_message(&self, chat_id: &str, text: &str) -> Result<SendReport, ChatError> {
        if text.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let targets = self.targets(chat_id)?;

        self.book.record(
            chat_id,
            ChatMessage {
                sender_id: self.local_id().clone(),
                text: text.to_string(),
                timestamp: now_millis(),
            },
        )?;

        let mut delivered = 0;
        for target in &targets {
            if self.controller.send(target, text).await {
                delivered += 1;
            }
        }

        let report = SendReport {
            delivered,
            targets: targets.len(),
        };
        if report.is_local_only() && report.targets > 0 {
            info!(chat = chat_id, "no open channel, message stored locally only");
        } else {
            debug!(chat = chat_id, delivered, targets = report.targets, "message sent");
        }
        Ok(report)
    }

    /// Статусы соединений участников группы, кроме себя
    pub fn member_statuses(&self, group_id: &str) -> Result<Vec<(PeerId, SessionStatus)>, ChatError> {
        let contact = self
            .book
            .contact(group_id)
            .filter(|c| c.is_group)
            .ok_or_else(|| ChatError::UnknownChat(group_id.to_string()))?;
        let local = self.local_id();
        Ok(contact
            .members
            .unwrap_or_default()
            .into_iter()
            .filter(|member| member != local)
            .map(|member| {
                let status = self.controller.status(&member);
                (member, status)
            })
            .collect())
    }

    pub async fn shutdown(&self) {
        self.controller.close_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn offline_config() -> AppConfig {
        AppConfig {
            ice_servers: Vec::new(),
            ..AppConfig::default()
        }
    }

    fn client(store: Arc<dyn KeyValueStore>) -> ChatClient {
        ChatClient::with_store(&offline_config(), store).unwrap()
    }

    #[test]
    fn book_contains_own_contact() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let me = PeerId::from("P2P-LOCAL01");
        let book = ChatBook::load(store, me.clone()).unwrap();
        let own = book.contact(me.as_str()).unwrap();
        assert!(!own.is_group);
        assert_eq!(own.p2p_id, Some(me));
    }

    #[test]
    fn group_always_includes_local_user() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let me = PeerId::from("P2P-LOCAL01");
        let book = ChatBook::load(store, me.clone()).unwrap();
        book.create_group("grp-1", "team", &[PeerId::from("P2P-BBBBBBB"), PeerId::from("P2P-BBBBBBB")])
            .unwrap();
        let group = book.contact("grp-1").unwrap();
        assert!(group.is_group);
        assert_eq!(group.members.unwrap(), vec![me, PeerId::from("P2P-BBBBBBB")]);
    }

    #[test]
    fn chat_list_is_ordered_by_last_message() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let book = ChatBook::load(store, PeerId::from("P2P-LOCAL01")).unwrap();
        let alice = PeerId::from("P2P-ALICE00");
        let bob = PeerId::from("P2P-BOB0000");
        book.add_contact(&alice, "alice").unwrap();
        book.add_contact(&bob, "bob").unwrap();

        let msg = |sender: &PeerId, ts| ChatMessage {
            sender_id: sender.clone(),
            text: "hi".into(),
            timestamp: ts,
        };
        book.record(alice.as_str(), msg(&alice, 100)).unwrap();
        book.record(bob.as_str(), msg(&bob, 200)).unwrap();

        let ids: Vec<String> = book.chat_list().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["P2P-BOB0000", "P2P-ALICE00", "P2P-LOCAL01"]);
        assert_eq!(book.last_message(alice.as_str()).unwrap().timestamp, 100);
    }

    #[test]
    fn incoming_message_is_recorded_under_sender() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let book = ChatBook::load(store.clone(), PeerId::from("P2P-LOCAL01")).unwrap();
        let alice = PeerId::from("P2P-ALICE00");
        book.on_message(
            &alice,
            WireMessage {
                sender_id: alice.clone(),
                text: "Hallo".into(),
            },
        );
        let history = book.messages(alice.as_str());
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].text, "Hallo");
        assert!(history[0].timestamp > 0);
        // без рантайма tokio запись синхронная
        let stored = store.get(MESSAGES_KEY).unwrap().unwrap();
        assert!(stored.contains("Hallo"));
    }

    #[tokio::test]
    async fn incoming_message_is_persisted_off_the_callback() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let book = ChatBook::load(store.clone(), PeerId::from("P2P-LOCAL01")).unwrap();
        let alice = PeerId::from("P2P-ALICE00");
        for text in ["eins", "zwei"] {
            book.on_message(
                &alice,
                WireMessage {
                    sender_id: alice.clone(),
                    text: text.into(),
                },
            );
        }
        assert_eq!(book.messages(alice.as_str()).len(), 2);

        let mut stored = None;
        for _ in 0..100 {
            stored = store
                .get(MESSAGES_KEY)
                .unwrap()
                .filter(|raw| raw.contains("zwei"));
            if stored.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let stored = stored.expect("history was not written");
        assert!(stored.contains("eins"));
    }

    #[test]
    fn older_history_snapshot_never_overwrites_newer() {
        let store = MemoryStore::new();
        let written = Mutex::new(0);
        write_messages(&store, &written, 2, "new").unwrap();
        write_messages(&store, &written, 1, "old").unwrap();
        assert_eq!(store.get(MESSAGES_KEY).unwrap().as_deref(), Some("new"));
        assert_eq!(*written.lock(), 2);
    }

    #[test]
    fn history_and_name_survive_reload() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let me = PeerId::from("P2P-LOCAL01");
        {
            let book = ChatBook::load(store.clone(), me.clone()).unwrap();
            book.set_user_name("Vova").unwrap();
            book.add_contact(&PeerId::from("P2P-ALICE00"), "alice").unwrap();
            book.record(
                "P2P-ALICE00",
                ChatMessage {
                    sender_id: me.clone(),
                    text: "saved".into(),
                    timestamp: 1,
                },
            )
            .unwrap();
        }
        let book = ChatBook::load(store, me.clone()).unwrap();
        assert_eq!(book.user_name().as_deref(), Some("Vova"));
        assert_eq!(book.contact(me.as_str()).unwrap().name, "Vova");
        assert_eq!(book.messages("P2P-ALICE00").len(), 1);
    }

    #[test]
    fn corrupt_history_is_reported() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        store.set(MESSAGES_KEY, "{broken").unwrap();
        assert!(matches!(
            ChatBook::load(store, PeerId::from("P2P-LOCAL01")),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[tokio::test]
    async fn group_message_without_channels_is_stored_locally() {
        let client = client(Arc::new(MemoryStore::new()));
        let members = [PeerId::from("P2P-BBBBBBB"), PeerId::from("P2P-CCCCCCC")];
        client.book().create_group("grp-1", "team", &members).unwrap();

        let report = client.send_message("grp-1", "hello all").await.unwrap();
        assert_eq!(report, SendReport { delivered: 0, targets: 2 });
        assert!(report.is_local_only());

        let history = client.book().messages("grp-1");
        assert_eq!(history.len(), 1);
        assert_eq!(&history[0].sender_id, client.local_id());

        let statuses = client.member_statuses("grp-1").unwrap();
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|(_, s)| *s == SessionStatus::None));
    }

    #[tokio::test]
    async fn unknown_chat_and_empty_text_are_rejected() {
        let client = client(Arc::new(MemoryStore::new()));
        assert!(matches!(
            client.send_message("nobody", "hi").await,
            Err(ChatError::UnknownChat(_))
        ));
        assert!(matches!(
            client.send_message(client.local_id().as_str(), "   ").await,
            Err(ChatError::EmptyMessage)
        ));
        assert!(matches!(
            client.member_statuses(client.local_id().as_str()),
            Err(ChatError::UnknownChat(_))
        ));
    }

    #[tokio::test]
    async fn client_keeps_identity_in_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            data_dir: dir.path().to_path_buf(),
            ..offline_config()
        };
        let first = ChatClient::new(&config).unwrap().local_id().clone();
        let second = ChatClient::new(&config).unwrap().local_id().clone();
        assert_eq!(first, second);
        assert!(config.storage_path().exists());
    }
}
