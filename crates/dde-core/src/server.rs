//! Server side: service registration, verb dispatch to application hooks,
//! advise pushing and per-conversation pause counters.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dde_proto::{
    Bytes, CallbackResult, CallbackState, ConvId, DataFormat, InstanceId, ServiceId, Transaction, TransactionKind,
    MAX_STRING_SIZE,
};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tracing::{debug, warn};

use crate::client::validate_name;
use crate::context::{ContextInner, DdeContext, TextEncoding};
use crate::error::DdeError;
use crate::events::{EventHandlers, Subscription};

/// Hook result for an incoming execute transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteResult {
    Processed,
    NotProcessed,
    TooBusy,
    /// Block the conversation; it receives no further callbacks until
    /// [`DdeServer::resume_conversation`] brings its pause counter to zero.
    PauseConversation,
}

/// Hook result for an incoming poke transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PokeResult {
    Processed,
    NotProcessed,
    TooBusy,
    PauseConversation,
}

/// Hook result for an incoming request transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestResult {
    /// Item was served; `None` answers with an empty payload.
    Processed(Option<Bytes>),
    NotProcessed,
    PauseConversation,
}

/// Application-defined tag attachable to a server conversation.
pub type ConversationTag = Arc<dyn Any + Send + Sync>;

/// One connected partner of a [`DdeServer`].
pub struct ServerConversation {
    conv: ConvId,
    service: SmolStr,
    topic: SmolStr,
    /// Nested pause counter; the conversation is blocked while non-zero.
    waiting: AtomicU32,
    tag: Mutex<Option<ConversationTag>>,
}

impl ServerConversation {
    fn new(conv: ConvId, service: SmolStr, topic: SmolStr) -> Self {
        Self {
            conv,
            service,
            topic,
            waiting: AtomicU32::new(0),
            tag: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> ConvId {
        self.conv
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_paused(&self) -> bool {
        self.waiting.load(Ordering::SeqCst) > 0
    }

    pub fn tag(&self) -> Option<ConversationTag> {
        self.tag.lock().clone()
    }

    pub fn set_tag(&self, tag: Option<ConversationTag>) {
        *self.tag.lock() = tag;
    }

    /// Returns the new counter value.
    fn increment_waiting(&self) -> u32 {
        self.waiting.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns the new counter value, or `None` when it was already zero.
    fn decrement_waiting(&self) -> Option<u32> {
        self.waiting
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| count.checked_sub(1))
            .ok()
            .map(|previous| previous - 1)
    }
}

/// Business hooks of a server; every hook has a conservative default so an
/// implementation only overrides the verbs it serves.
///
/// Hooks run on whichever thread delivers the facility callback; they must
/// not block on operations marshaled to the owning thread of the same
/// context.
pub trait ServerHandler: Send + Sync + 'static {
    /// Whether to accept a conversation on the given topic.
    fn on_before_connect(&self, topic: &str) -> bool {
        let _ = topic;
        true
    }

    fn on_after_connect(&self, conversation: &ServerConversation) {
        let _ = conversation;
    }

    fn on_disconnect(&self, conversation: &ServerConversation) {
        let _ = conversation;
    }

    /// Whether to accept an advise loop on the given item.
    fn on_start_advise(&self, conversation: &ServerConversation, item: &str, format: DataFormat) -> bool {
        let _ = (conversation, item, format);
        true
    }

    fn on_stop_advise(&self, conversation: &ServerConversation, item: &str) {
        let _ = (conversation, item);
    }

    fn on_execute(&self, conversation: &ServerConversation, command: &str) -> ExecuteResult {
        let _ = (conversation, command);
        ExecuteResult::NotProcessed
    }

    fn on_poke(&self, conversation: &ServerConversation, item: &str, data: Bytes, format: DataFormat) -> PokeResult {
        let _ = (conversation, item, data, format);
        PokeResult::NotProcessed
    }

    fn on_request(&self, conversation: &ServerConversation, item: &str, format: DataFormat) -> RequestResult {
        let _ = (conversation, item, format);
        RequestResult::NotProcessed
    }

    /// Current value of an item for an advise burst; `None` refuses the
    /// advise request.
    fn on_advise(&self, topic: &str, item: &str, format: DataFormat) -> Option<Bytes> {
        let _ = (topic, item, format);
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AdviseCacheKey {
    topic: SmolStr,
    item: SmolStr,
    format: u16,
}

impl AdviseCacheKey {
    fn new(topic: &str, item: &str, format: DataFormat) -> Self {
        Self {
            topic: SmolStr::new(topic.to_ascii_lowercase()),
            item: SmolStr::new(item.to_ascii_lowercase()),
            format: format.into(),
        }
    }
}

/// Cache sharing one advise hook result between every conversation served in
/// the same notification burst.
///
/// The facility reports how many consumers of a (topic, item, format) tuple
/// are still unserved; the entry is evicted when that count reaches zero.
#[derive(Default)]
struct AdviseCache {
    entries: HashMap<AdviseCacheKey, Option<Bytes>>,
}

impl AdviseCache {
    fn lookup(&self, key: &AdviseCacheKey) -> Option<Option<Bytes>> {
        self.entries.get(key).cloned()
    }

    /// First store wins; a racing burst never overwrites a live entry.
    fn store(&mut self, key: AdviseCacheKey, data: Option<Bytes>) -> Option<Bytes> {
        self.entries.entry(key).or_insert(data).clone()
    }

    fn evict(&mut self, key: &AdviseCacheKey) {
        self.entries.remove(key);
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

struct ServerState {
    disposed: bool,
    paused: bool,
    instance: Option<InstanceId>,
    service_id: Option<ServiceId>,
    conversations: HashMap<ConvId, Arc<ServerConversation>>,
    advise_cache: AdviseCache,
}

pub(crate) struct ServerCore {
    context: Arc<ContextInner>,
    service: SmolStr,
    service_key: SmolStr,
    handler: Arc<dyn ServerHandler>,
    state: Mutex<ServerState>,
    state_changed: EventHandlers<()>,
}

/// A registered DDE service answering client verbs through a
/// [`ServerHandler`].
pub struct DdeServer {
    core: Arc<ServerCore>,
}

impl DdeServer {
    pub fn new(context: &DdeContext, service: &str, handler: Arc<dyn ServerHandler>) -> Result<Self, DdeError> {
        validate_name(service, "service")?;

        let core = Arc::new(ServerCore {
            context: Arc::clone(context.inner()),
            service: SmolStr::new(service),
            service_key: SmolStr::new(service.to_ascii_lowercase()),
            handler,
            state: Mutex::new(ServerState {
                disposed: false,
                paused: false,
                instance: None,
                service_id: None,
                conversations: HashMap::new(),
                advise_cache: AdviseCache::default(),
            }),
            state_changed: EventHandlers::new(),
        });

        Ok(Self { core })
    }

    pub fn service(&self) -> &str {
        &self.core.service
    }

    pub fn is_registered(&self) -> bool {
        self.core.state.lock().service_id.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.core.state.lock().paused
    }

    pub fn is_disposed(&self) -> bool {
        self.core.state.lock().disposed
    }

    /// Live conversations, in no particular order.
    pub fn conversations(&self) -> Vec<Arc<ServerConversation>> {
        self.core.state.lock().conversations.values().cloned().collect()
    }

    pub fn on_state_changed(&self, subscriber: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.core.state_changed.subscribe(Arc::new(move |(): &()| subscriber()))
    }

    /// Detaches a subscription made on this server. Returns `false` when it
    /// was not found (already removed, or made on another object).
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        self.core.state_changed.unsubscribe(subscription)
    }

    /// Advertises the service name, lazily initializing the context.
    pub fn register(&self) -> Result<(), DdeError> {
        {
            let state = self.core.state.lock();
            if state.disposed {
                return Err(DdeError::Disposed);
            }
            if state.service_id.is_some() {
                return Err(DdeError::AlreadyRegistered);
            }
        }

        let core = Arc::clone(&self.core);
        self.core.context.thread.invoke(move || ServerCore::register_on_owning_thread(&core))?
    }

    /// Withdraws the service name. Live conversations stay connected; only
    /// disposal tears them down.
    pub fn unregister(&self) -> Result<(), DdeError> {
        {
            let state = self.core.state.lock();
            if state.disposed {
                return Err(DdeError::Disposed);
            }
            if state.service_id.is_none() {
                return Err(DdeError::NotRegistered);
            }
        }

        let core = Arc::clone(&self.core);
        self.core.context.thread.invoke(move || ServerCore::unregister_on_owning_thread(&core))?
    }

    /// Announces that an item changed, triggering one advise-request per
    /// conversation holding a matching loop. `"*"` is the wildcard for
    /// either coordinate.
    pub fn advise(&self, topic: &str, item: &str) -> Result<(), DdeError> {
        {
            let state = self.core.state.lock();
            if state.disposed {
                return Err(DdeError::Disposed);
            }
            if state.service_id.is_none() {
                return Err(DdeError::NotRegistered);
            }
        }
        if topic.is_empty() || topic.len() > MAX_STRING_SIZE {
            return Err(DdeError::InvalidArgument("topic"));
        }
        if item.is_empty() || item.len() > MAX_STRING_SIZE {
            return Err(DdeError::InvalidArgument("item"));
        }

        let topic = SmolStr::new(topic);
        let item = SmolStr::new(item);
        let core = Arc::clone(&self.core);
        self.core.context.thread.invoke(move || {
            let instance = core.registered_instance()?;
            let topic = (topic != "*").then_some(topic.as_str());
            let item = (item != "*").then_some(item.as_str());
            core.context
                .api
                .post_advise(instance, topic, item)
                .map_err(|code| DdeError::protocol("advise", code))
        })?
    }

    /// Pauses the whole server: callback delivery for the instance is
    /// disabled and every live conversation's pause counter is incremented.
    pub fn pause(&self) -> Result<(), DdeError> {
        let core = Arc::clone(&self.core);
        self.core.context.thread.invoke(move || core.set_paused(true))?
    }

    pub fn resume(&self) -> Result<(), DdeError> {
        let core = Arc::clone(&self.core);
        self.core.context.thread.invoke(move || core.set_paused(false))?
    }

    /// Pauses one conversation. Pause requests nest; the conversation only
    /// resumes once every pause has been matched by a resume.
    pub fn pause_conversation(&self, conv: ConvId) -> Result<(), DdeError> {
        let core = Arc::clone(&self.core);
        self.core.context.thread.invoke(move || core.pause_one(conv))?
    }

    pub fn resume_conversation(&self, conv: ConvId) -> Result<(), DdeError> {
        let core = Arc::clone(&self.core);
        self.core.context.thread.invoke(move || core.resume_one(conv))?
    }

    /// Force-terminates one conversation without invoking the disconnect
    /// hook.
    pub fn disconnect(&self, conv: ConvId) -> Result<(), DdeError> {
        let core = Arc::clone(&self.core);
        self.core.context.thread.invoke(move || core.force_disconnect(conv))?
    }

    /// Force-terminates every live conversation.
    pub fn disconnect_all(&self) -> Result<(), DdeError> {
        let core = Arc::clone(&self.core);
        self.core.context.thread.invoke(move || {
            if core.state.lock().disposed {
                return Err(DdeError::Disposed);
            }
            let handles: Vec<ConvId> = core.state.lock().conversations.keys().copied().collect();
            for conv in handles {
                core.force_disconnect(conv)?;
            }
            Ok(())
        })?
    }

    /// Disconnects every conversation, withdraws the service and permanently
    /// retires the object. Idempotent; safe from any thread.
    pub fn dispose(&self) {
        if self.core.state.lock().disposed {
            return;
        }
        let core = Arc::clone(&self.core);
        if self
            .core
            .context
            .thread
            .invoke(move || ServerCore::dispose_on_owning_thread(&core))
            .is_err()
        {
            self.core.state.lock().disposed = true;
        }
    }
}

impl Drop for DdeServer {
    fn drop(&mut self) {
        if self.core.state.lock().disposed {
            return;
        }

        if self.core.context.thread.is_owning_thread() {
            ServerCore::dispose_on_owning_thread(&self.core);
        } else {
            let core = Arc::clone(&self.core);
            if !self.core.context.thread.post(move || ServerCore::dispose_on_owning_thread(&core)) {
                self.core.state.lock().disposed = true;
            }
        }
    }
}

impl ServerCore {
    fn registered_instance(&self) -> Result<InstanceId, DdeError> {
        let state = self.state.lock();
        if state.disposed {
            return Err(DdeError::Disposed);
        }
        match (state.instance, state.service_id) {
            (Some(instance), Some(_)) => Ok(instance),
            _ => Err(DdeError::NotRegistered),
        }
    }

    /// Must run on the owning thread.
    fn register_on_owning_thread(core: &Arc<Self>) -> Result<(), DdeError> {
        let instance = ContextInner::ensure_initialized(&core.context)?;

        {
            let state = core.state.lock();
            if state.disposed {
                return Err(DdeError::Disposed);
            }
            if state.service_id.is_some() {
                return Err(DdeError::AlreadyRegistered);
            }
        }

        let service_id = core
            .context
            .api
            .register_service(instance, &core.service)
            .map_err(|code| DdeError::protocol("register", code))?;

        {
            let mut state = core.state.lock();
            state.instance = Some(instance);
            state.service_id = Some(service_id);
            state.conversations.clear();
            state.advise_cache.clear();
        }
        core.context.register_server(core.service_key.clone(), Arc::clone(core));

        debug!(service = %core.service, %service_id, "service registered");
        core.state_changed.emit(&());

        Ok(())
    }

    /// Must run on the owning thread.
    fn unregister_on_owning_thread(core: &Arc<Self>) -> Result<(), DdeError> {
        let (instance, service_id) = {
            let mut state = core.state.lock();
            if state.disposed {
                return Err(DdeError::Disposed);
            }
            let (Some(instance), Some(service_id)) = (state.instance, state.service_id.take()) else {
                return Err(DdeError::NotRegistered);
            };
            (instance, service_id)
        };

        if !core.context.api.unregister_service(instance, service_id) {
            warn!(service = %core.service, "facility did not know the registered service");
        }
        core.context.unregister_server(&core.service_key);

        debug!(service = %core.service, "service unregistered");
        core.state_changed.emit(&());

        Ok(())
    }

    /// Must run on the owning thread.
    fn set_paused(&self, paused: bool) -> Result<(), DdeError> {
        let (instance, conversations) = {
            let state = self.state.lock();
            if state.disposed {
                return Err(DdeError::Disposed);
            }
            let Some(instance) = state.instance else {
                return Err(DdeError::NotRegistered);
            };
            if paused && state.paused {
                return Err(DdeError::AlreadyPaused);
            }
            if !paused && !state.paused {
                return Err(DdeError::NotPaused);
            }
            let conversations: Vec<_> = state.conversations.values().cloned().collect();
            (instance, conversations)
        };

        if paused {
            self.context
                .api
                .enable_callback(instance, None, CallbackState::Disable)
                .map_err(|code| DdeError::protocol("pause", code))?;
            for conversation in &conversations {
                conversation.increment_waiting();
            }
        } else {
            self.context
                .api
                .enable_callback(instance, None, CallbackState::EnableAll)
                .map_err(|code| DdeError::protocol("resume", code))?;
            for conversation in &conversations {
                let still_paused = !matches!(conversation.decrement_waiting(), Some(0) | None);
                if still_paused {
                    // Individually paused before the whole-server pause;
                    // keep it blocked.
                    self.context
                        .api
                        .enable_callback(instance, Some(conversation.handle()), CallbackState::Disable)
                        .map_err(|code| DdeError::protocol("resume", code))?;
                }
            }
        }

        self.state.lock().paused = paused;
        self.state_changed.emit(&());
        Ok(())
    }

    /// Must run on the owning thread.
    fn pause_one(&self, conv: ConvId) -> Result<(), DdeError> {
        let (instance, conversation) = self.conversation_for(conv)?;
        if conversation.increment_waiting() == 1 {
            self.context
                .api
                .enable_callback(instance, Some(conv), CallbackState::Disable)
                .map_err(|code| DdeError::protocol("pause", code))?;
        }
        Ok(())
    }

    /// Must run on the owning thread.
    fn resume_one(&self, conv: ConvId) -> Result<(), DdeError> {
        let (instance, conversation) = self.conversation_for(conv)?;
        match conversation.decrement_waiting() {
            Some(0) => self
                .context
                .api
                .enable_callback(instance, Some(conv), CallbackState::EnableAll)
                .map_err(|code| DdeError::protocol("resume", code)),
            Some(_) => Ok(()),
            None => Err(DdeError::NotPaused),
        }
    }

    /// Must run on the owning thread.
    fn force_disconnect(&self, conv: ConvId) -> Result<(), DdeError> {
        let (instance, removed) = {
            let mut state = self.state.lock();
            if state.disposed {
                return Err(DdeError::Disposed);
            }
            let Some(instance) = state.instance else {
                return Err(DdeError::NotConnected);
            };
            (instance, state.conversations.remove(&conv))
        };
        if removed.is_none() {
            return Err(DdeError::NotConnected);
        }

        self.context.unregister_server_conversation(conv);
        if !self.context.api.disconnect(instance, conv) {
            debug!(%conv, "conversation was already gone");
        }
        Ok(())
    }

    fn conversation_for(&self, conv: ConvId) -> Result<(InstanceId, Arc<ServerConversation>), DdeError> {
        let state = self.state.lock();
        if state.disposed {
            return Err(DdeError::Disposed);
        }
        let Some(instance) = state.instance else {
            return Err(DdeError::NotConnected);
        };
        let conversation = state.conversations.get(&conv).cloned().ok_or(DdeError::NotConnected)?;
        Ok((instance, conversation))
    }

    /// Handles one raw callback addressed to this server. Returns `false`
    /// when the transaction is not ours. Hooks run without any lock held.
    pub(crate) fn process_callback(this: &Arc<Self>, t: &mut Transaction) -> bool {
        match t.kind {
            TransactionKind::Connect => {
                let Some(topic) = t.str1.clone() else {
                    return false;
                };
                let accepted = this.handler.on_before_connect(&topic);
                t.ret = CallbackResult::Accept(accepted);
                true
            }
            TransactionKind::ConnectConfirm => {
                let (Some(conv), Some(topic)) = (t.conv, t.str1.clone()) else {
                    return false;
                };
                let conversation = Arc::new(ServerConversation::new(conv, this.service.clone(), topic));
                this.state.lock().conversations.insert(conv, Arc::clone(&conversation));
                this.handler.on_after_connect(&conversation);
                t.ret = CallbackResult::Ignored;
                true
            }
            TransactionKind::Execute => this.on_execute(t),
            TransactionKind::Poke => this.on_poke(t),
            TransactionKind::Request => this.on_request(t),
            TransactionKind::AdviseStart => {
                let (Some(conversation), Some(item)) = (this.lookup(t.conv), t.str2.clone()) else {
                    return false;
                };
                let accepted = this.handler.on_start_advise(&conversation, &item, t.format);
                t.ret = CallbackResult::Accept(accepted);
                true
            }
            TransactionKind::AdviseStop => {
                let (Some(conversation), Some(item)) = (this.lookup(t.conv), t.str2.clone()) else {
                    return false;
                };
                this.handler.on_stop_advise(&conversation, &item);
                t.ret = CallbackResult::Ignored;
                true
            }
            TransactionKind::AdviseRequest => this.on_advise_request(t),
            TransactionKind::Disconnect => {
                let Some(conv) = t.conv else {
                    return false;
                };
                let removed = this.state.lock().conversations.remove(&conv);
                let Some(conversation) = removed else {
                    return false;
                };
                this.handler.on_disconnect(&conversation);
                t.ret = CallbackResult::Ignored;
                true
            }
            _ => false,
        }
    }

    fn lookup(&self, conv: Option<ConvId>) -> Option<Arc<ServerConversation>> {
        conv.and_then(|conv| self.state.lock().conversations.get(&conv).cloned())
    }

    fn on_execute(&self, t: &mut Transaction) -> bool {
        let Some(conversation) = self.lookup(t.conv) else {
            return false;
        };
        let command = decode_command(t.data.as_deref().unwrap_or_default(), self.context.text_encoding());

        t.ret = match self.handler.on_execute(&conversation, &command) {
            ExecuteResult::Processed => CallbackResult::Ack,
            ExecuteResult::NotProcessed => CallbackResult::NotProcessed,
            ExecuteResult::TooBusy => CallbackResult::Busy,
            ExecuteResult::PauseConversation => {
                conversation.increment_waiting();
                CallbackResult::Block
            }
        };
        true
    }

    fn on_poke(&self, t: &mut Transaction) -> bool {
        let (Some(conversation), Some(item)) = (self.lookup(t.conv), t.str2.clone()) else {
            return false;
        };
        let data = t.data.clone().unwrap_or_default();

        t.ret = match self.handler.on_poke(&conversation, &item, data, t.format) {
            PokeResult::Processed => CallbackResult::Ack,
            PokeResult::NotProcessed => CallbackResult::NotProcessed,
            PokeResult::TooBusy => CallbackResult::Busy,
            PokeResult::PauseConversation => {
                conversation.increment_waiting();
                CallbackResult::Block
            }
        };
        true
    }

    fn on_request(&self, t: &mut Transaction) -> bool {
        let (Some(conversation), Some(item)) = (self.lookup(t.conv), t.str2.clone()) else {
            return false;
        };

        t.ret = match self.handler.on_request(&conversation, &item, t.format) {
            RequestResult::Processed(data) => CallbackResult::Data(data.unwrap_or_default()),
            RequestResult::NotProcessed => CallbackResult::NotProcessed,
            RequestResult::PauseConversation => {
                conversation.increment_waiting();
                CallbackResult::Block
            }
        };
        true
    }

    /// One advise burst invokes the advise hook once per (topic, item,
    /// format) tuple; every other conversation in the burst is served from
    /// the cache, which is evicted when the facility reports the last
    /// consumer.
    fn on_advise_request(&self, t: &mut Transaction) -> bool {
        let (Some(conversation), Some(item)) = (self.lookup(t.conv), t.str2.clone()) else {
            return false;
        };
        let key = AdviseCacheKey::new(conversation.topic(), &item, t.format);

        let cached = self.state.lock().advise_cache.lookup(&key);
        let data = match cached {
            Some(data) => data,
            None => {
                let fresh = self.handler.on_advise(conversation.topic(), &item, t.format);
                self.state.lock().advise_cache.store(key.clone(), fresh)
            }
        };

        if t.remaining() == 0 {
            self.state.lock().advise_cache.evict(&key);
        }

        t.ret = match data {
            Some(data) => CallbackResult::Data(data),
            None => CallbackResult::NotProcessed,
        };
        true
    }

    /// Must run on the owning thread. Idempotent. Forcibly disconnects every
    /// conversation and withdraws the service.
    pub(crate) fn dispose_on_owning_thread(core: &Arc<Self>) {
        let (instance, service_id, conversations) = {
            let mut state = core.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.paused = false;
            state.advise_cache.clear();
            let conversations: Vec<_> = state.conversations.drain().map(|(_, conversation)| conversation).collect();
            (state.instance.take(), state.service_id.take(), conversations)
        };

        let Some(instance) = instance else {
            return;
        };

        for conversation in conversations {
            let conv = conversation.handle();
            core.context.unregister_server_conversation(conv);
            if !core.context.api.disconnect(instance, conv) {
                debug!(%conv, "conversation was already gone");
            }
        }

        if let Some(service_id) = service_id {
            if !core.context.api.unregister_service(instance, service_id) {
                warn!(service = %core.service, "facility did not know the registered service");
            }
            core.context.unregister_server(&core.service_key);
        }

        core.state_changed.emit_isolated(&());
    }
}

/// Commands arrive NUL-terminated in the context's codec.
fn decode_command(raw: &[u8], encoding: TextEncoding) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    encoding.decode(&raw[..end])
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn command_decoding_strips_nul() {
        assert_eq!(decode_command(b"beep\0", TextEncoding::Utf8), "beep");
        assert_eq!(decode_command(b"beep", TextEncoding::Utf8), "beep");
        assert_eq!(decode_command(b"", TextEncoding::Utf8), "");
        assert_eq!(decode_command(b"caf\xe9\0", TextEncoding::Latin1), "caf\u{e9}");
    }

    #[test]
    fn cache_keys_are_case_insensitive() {
        assert_eq!(
            AdviseCacheKey::new("MyTopic", "MyItem", DataFormat::TEXT),
            AdviseCacheKey::new("mytopic", "MYITEM", DataFormat::TEXT),
        );
        assert_ne!(
            AdviseCacheKey::new("mytopic", "myitem", DataFormat::TEXT),
            AdviseCacheKey::new("mytopic", "myitem", DataFormat::from(2)),
        );
    }

    #[test]
    fn cache_first_store_wins() {
        let mut cache = AdviseCache::default();
        let key = AdviseCacheKey::new("t", "i", DataFormat::TEXT);

        let first = cache.store(key.clone(), Some(Bytes::from_static(b"one")));
        assert_eq!(first, Some(Bytes::from_static(b"one")));
        let second = cache.store(key.clone(), Some(Bytes::from_static(b"two")));
        assert_eq!(second, Some(Bytes::from_static(b"one")));

        cache.evict(&key);
        assert_eq!(cache.lookup(&key), None);
    }

    #[test]
    fn waiting_counter_nests() {
        let conversation = ServerConversation::new(ConvId::from(1), SmolStr::new("s"), SmolStr::new("t"));

        assert!(!conversation.is_paused());
        assert_eq!(conversation.increment_waiting(), 1);
        assert_eq!(conversation.increment_waiting(), 2);
        assert_eq!(conversation.decrement_waiting(), Some(1));
        assert!(conversation.is_paused());
        assert_eq!(conversation.decrement_waiting(), Some(0));
        assert!(!conversation.is_paused());
        assert_eq!(conversation.decrement_waiting(), None);
    }

    proptest! {
        // One hook call serves a whole burst; once the facility reports the
        // last consumer the entry is gone, so a following burst for the same
        // tuple triggers a fresh hook call rather than reading stale data.
        #[test]
        fn advise_cache_serves_each_burst_once(burst_sizes in prop::collection::vec(1..8usize, 1..5)) {
            let mut cache = AdviseCache::default();
            let key = AdviseCacheKey::new("mytopic", "myitem", DataFormat::TEXT);

            for (burst, size) in burst_sizes.iter().enumerate() {
                let mut hook_calls = 0;
                for consumer in 0..*size {
                    let remaining = size - consumer - 1;
                    if cache.lookup(&key).is_none() {
                        hook_calls += 1;
                        let _ = cache.store(key.clone(), Some(Bytes::from(format!("burst-{burst}"))));
                    }
                    let served = cache.lookup(&key).flatten();
                    prop_assert_eq!(served, Some(Bytes::from(format!("burst-{burst}"))));
                    if remaining == 0 {
                        cache.evict(&key);
                    }
                }
                prop_assert_eq!(hook_calls, 1);
                prop_assert!(cache.lookup(&key).is_none());
            }
        }
    }
}
