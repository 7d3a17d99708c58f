//! Execution context: facility instance lifecycle and callback dispatch.
//!
//! One `DdeContext` owns one facility instance and the dedicated thread it
//! lives on. Every raw callback of the shared facility callback function is
//! routed here and dispatched to exactly one destination: a transaction
//! filter, the client registered under the conversation handle, or the server
//! registered under the conversation or service name.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use dde_proto::{CallbackResult, ConvId, DdeApi, DdeCallback, InstanceId, SysError, Transaction, TransactionKind};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tracing::{debug, warn};

use crate::client::ClientCore;
use crate::error::DdeError;
use crate::events::{EventHandlers, RegistrationEvent, Subscription};
use crate::server::ServerCore;
use crate::thread::DdeThread;

/// Codec applied to command strings crossing a conversation.
///
/// Both ends must agree on the codec; partners written against the Windows
/// DDEML commonly exchange single-byte text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextEncoding {
    #[default]
    Utf8,
    /// ISO-8859-1, one byte per code point below U+0100.
    Latin1,
}

impl TextEncoding {
    /// Unrepresentable characters are replaced with `?`.
    pub(crate) fn encode(self, text: &str) -> Vec<u8> {
        match self {
            TextEncoding::Utf8 => text.as_bytes().to_vec(),
            TextEncoding::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                .collect(),
        }
    }

    /// Decoding never fails; invalid input is replaced.
    pub(crate) fn decode(self, raw: &[u8]) -> String {
        match self {
            TextEncoding::Utf8 => String::from_utf8_lossy(raw).into_owned(),
            TextEncoding::Latin1 => raw.iter().map(|&b| char::from(b)).collect(),
        }
    }
}

/// Pre-processing hook given first refusal on every raw callback.
///
/// Returning `true` claims the transaction: dispatch stops and
/// [`Transaction::ret`] is handed back to the facility verbatim.
pub trait TransactionFilter: Send + Sync {
    fn pre_filter_transaction(&self, transaction: &mut Transaction) -> bool;
}

/// The single point of contact with the underlying IPC facility for a group
/// of conversations.
pub struct DdeContext {
    inner: Arc<ContextInner>,
}

pub(crate) struct ContextInner {
    pub(crate) api: Arc<dyn DdeApi>,
    pub(crate) thread: DdeThread,
    state: Mutex<ContextState>,
    state_changed: EventHandlers<()>,
    registered: EventHandlers<RegistrationEvent>,
    unregistered: EventHandlers<RegistrationEvent>,
}

struct ContextState {
    disposed: bool,
    instance: Option<InstanceId>,
    encoding: TextEncoding,
    filters: Vec<Arc<dyn TransactionFilter>>,
    clients: HashMap<ConvId, Arc<ClientCore>>,
    servers_by_conv: HashMap<ConvId, Arc<ServerCore>>,
    servers_by_service: HashMap<SmolStr, Arc<ServerCore>>,
}

impl DdeContext {
    /// Creates a context over the given facility; the instance itself is
    /// only acquired on [`DdeContext::initialize`] or lazily on first use.
    pub fn new(api: Arc<dyn DdeApi>) -> Self {
        let inner = Arc::new(ContextInner {
            api,
            thread: DdeThread::spawn(),
            state: Mutex::new(ContextState {
                disposed: false,
                instance: None,
                encoding: TextEncoding::default(),
                filters: Vec::new(),
                clients: HashMap::new(),
                servers_by_conv: HashMap::new(),
                servers_by_service: HashMap::new(),
            }),
            state_changed: EventHandlers::new(),
            registered: EventHandlers::new(),
            unregistered: EventHandlers::new(),
        });

        Self { inner }
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.state.lock().instance.is_some()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.state.lock().disposed
    }

    pub fn instance_id(&self) -> Option<InstanceId> {
        self.inner.state.lock().instance
    }

    /// Codec applied to command strings sent and received on this context.
    pub fn encoding(&self) -> TextEncoding {
        self.inner.state.lock().encoding
    }

    /// Changes the command codec; conversations already in flight pick the
    /// new codec up on their next transaction.
    pub fn set_encoding(&self, encoding: TextEncoding) -> Result<(), DdeError> {
        let mut state = self.inner.state.lock();
        if state.disposed {
            return Err(DdeError::Disposed);
        }
        state.encoding = encoding;
        Ok(())
    }

    /// Acquires the facility instance.
    ///
    /// Fails with a state error when already initialized; conversations and
    /// servers initialize the context lazily, so calling this is only needed
    /// when the application wants register/unregister announcements before
    /// any conversation exists.
    pub fn initialize(&self) -> Result<(), DdeError> {
        let inner = Arc::clone(&self.inner);
        self.inner.thread.invoke(move || {
            {
                let state = inner.state.lock();
                if state.disposed {
                    return Err(DdeError::Disposed);
                }
                if state.instance.is_some() {
                    return Err(DdeError::AlreadyInitialized);
                }
            }
            ContextInner::do_initialize(&inner)?;
            Ok(())
        })?
    }

    pub fn add_transaction_filter(&self, filter: Arc<dyn TransactionFilter>) -> Result<(), DdeError> {
        let mut state = self.inner.state.lock();
        if state.disposed {
            return Err(DdeError::Disposed);
        }
        if state.filters.iter().any(|present| Arc::ptr_eq(present, &filter)) {
            return Err(DdeError::FilterAlreadyAdded);
        }
        state.filters.push(filter);
        Ok(())
    }

    pub fn remove_transaction_filter(&self, filter: &Arc<dyn TransactionFilter>) -> Result<(), DdeError> {
        let mut state = self.inner.state.lock();
        if state.disposed {
            return Err(DdeError::Disposed);
        }
        let position = state
            .filters
            .iter()
            .position(|present| Arc::ptr_eq(present, filter))
            .ok_or(DdeError::FilterNotAdded)?;
        state.filters.remove(position);
        Ok(())
    }

    pub fn on_state_changed(&self, subscriber: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.inner.state_changed.subscribe(Arc::new(move |(): &()| subscriber()))
    }

    /// Subscribes to service-name announcements observed in the session.
    pub fn on_registered(&self, subscriber: impl Fn(&RegistrationEvent) + Send + Sync + 'static) -> Subscription {
        self.inner.registered.subscribe(Arc::new(subscriber))
    }

    pub fn on_unregistered(&self, subscriber: impl Fn(&RegistrationEvent) + Send + Sync + 'static) -> Subscription {
        self.inner.unregistered.subscribe(Arc::new(subscriber))
    }

    /// Detaches a subscription made on this context. Returns `false` when it
    /// was not found (already removed, or made on another object).
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        self.inner.state_changed.unsubscribe(subscription)
            || self.inner.registered.unsubscribe(subscription)
            || self.inner.unregistered.unsubscribe(subscription)
    }

    /// Tears down every live conversation and server, then uninitializes the
    /// facility instance. Idempotent; repeated calls are no-ops.
    pub fn dispose(&self) {
        let inner = Arc::clone(&self.inner);
        if self.inner.thread.invoke(move || inner.dispose()).is_err() {
            // Owning thread already gone; nothing left to release.
            self.inner.state.lock().disposed = true;
        }
    }

    pub(crate) fn inner(&self) -> &Arc<ContextInner> {
        &self.inner
    }
}

impl Drop for DdeContext {
    fn drop(&mut self) {
        if self.inner.state.lock().disposed {
            return;
        }

        // The facility instance is thread-affine: teardown must run on the
        // owning thread even when the last handle is dropped elsewhere.
        if self.inner.thread.is_owning_thread() {
            self.inner.dispose();
        } else {
            let inner = Arc::clone(&self.inner);
            if !self.inner.thread.post(move || inner.dispose()) {
                self.inner.state.lock().disposed = true;
            }
        }
    }
}

impl ContextInner {
    /// Initializes the facility instance. Must run on the owning thread.
    fn do_initialize(this: &Arc<Self>) -> Result<InstanceId, DdeError> {
        let callback = make_callback(Arc::downgrade(this));
        let instance = this
            .api
            .initialize(callback)
            .map_err(|code| DdeError::protocol("initialize", code))?;

        this.state.lock().instance = Some(instance);
        debug!(%instance, "context initialized");
        this.state_changed.emit(&());

        Ok(instance)
    }

    /// Returns the instance id, initializing the context first when needed.
    /// Must run on the owning thread.
    pub(crate) fn ensure_initialized(this: &Arc<Self>) -> Result<InstanceId, DdeError> {
        {
            let state = this.state.lock();
            if state.disposed {
                return Err(DdeError::Disposed);
            }
            if let Some(instance) = state.instance {
                return Ok(instance);
            }
        }
        ContextInner::do_initialize(this)
    }

    pub(crate) fn text_encoding(&self) -> TextEncoding {
        self.state.lock().encoding
    }

    pub(crate) fn register_client(&self, conv: ConvId, client: Arc<ClientCore>) {
        self.state.lock().clients.insert(conv, client);
    }

    pub(crate) fn unregister_client(&self, conv: ConvId) {
        self.state.lock().clients.remove(&conv);
    }

    pub(crate) fn register_server(&self, service: SmolStr, server: Arc<ServerCore>) {
        self.state.lock().servers_by_service.insert(service, server);
    }

    pub(crate) fn unregister_server(&self, service: &str) {
        let mut state = self.state.lock();
        state.servers_by_service.remove(service);
    }

    pub(crate) fn unregister_server_conversation(&self, conv: ConvId) {
        self.state.lock().servers_by_conv.remove(&conv);
    }

    fn dispose(&self) {
        let (clients, servers, instance) = {
            let mut state = self.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;

            let clients: Vec<_> = state.clients.drain().map(|(_, client)| client).collect();
            let servers: Vec<_> = state.servers_by_service.drain().map(|(_, server)| server).collect();
            state.servers_by_conv.clear();
            state.filters.clear();

            (clients, servers, state.instance.take())
        };

        for client in clients {
            ClientCore::dispose_on_owning_thread(&client);
        }
        for server in servers {
            ServerCore::dispose_on_owning_thread(&server);
        }

        self.state_changed.emit_isolated(&());

        if let Some(instance) = instance {
            if !self.api.uninitialize(instance) {
                warn!(%instance, "facility refused to uninitialize the instance");
            }
        }
    }

    /// Service names are matched the way the facility matches string
    /// handles.
    fn server_by_service(&self, service: &str) -> Option<Arc<ServerCore>> {
        self.state
            .lock()
            .servers_by_service
            .get(service.to_ascii_lowercase().as_str())
            .cloned()
    }

    /// Routes one raw callback invocation to exactly one destination.
    fn dispatch(&self, t: &mut Transaction) {
        let filters = self.state.lock().filters.clone();
        for filter in &filters {
            if filter.pre_filter_transaction(t) {
                return;
            }
        }

        match t.kind {
            TransactionKind::AdviseData | TransactionKind::TransactionComplete => {
                let client = t.conv.and_then(|conv| self.state.lock().clients.get(&conv).cloned());
                if let Some(client) = client {
                    ClientCore::process_callback(&client, t);
                }
            }
            TransactionKind::AdviseRequest
            | TransactionKind::AdviseStart
            | TransactionKind::AdviseStop
            | TransactionKind::Execute
            | TransactionKind::Poke
            | TransactionKind::Request => {
                let server = t.conv.and_then(|conv| self.state.lock().servers_by_conv.get(&conv).cloned());
                if let Some(server) = server {
                    ServerCore::process_callback(&server, t);
                }
            }
            TransactionKind::Connect => {
                // No conversation exists yet; the requested service name
                // rides in the second string argument.
                let server = t.str2.as_ref().and_then(|service| self.server_by_service(service));
                if let Some(server) = server {
                    ServerCore::process_callback(&server, t);
                }
            }
            TransactionKind::ConnectConfirm => {
                let server = t.str2.as_ref().and_then(|service| self.server_by_service(service));
                if let (Some(server), Some(conv)) = (server, t.conv) {
                    self.state.lock().servers_by_conv.insert(conv, Arc::clone(&server));
                    ServerCore::process_callback(&server, t);
                }
            }
            TransactionKind::Disconnect => {
                // A handle is never both a live client and a live server
                // conversation, but both tables are checked for safety.
                let (client, server) = match t.conv {
                    Some(conv) => {
                        let mut state = self.state.lock();
                        (state.clients.remove(&conv), state.servers_by_conv.remove(&conv))
                    }
                    None => (None, None),
                };
                if let Some(client) = client {
                    ClientCore::process_callback(&client, t);
                }
                if let Some(server) = server {
                    ServerCore::process_callback(&server, t);
                }
            }
            TransactionKind::Register => {
                if self.registered.has_subscribers() {
                    if let Some(service) = t.str1.clone() {
                        self.registered.emit(&RegistrationEvent { service });
                    }
                }
            }
            TransactionKind::Unregister => {
                if self.unregistered.has_subscribers() {
                    if let Some(service) = t.str1.clone() {
                        self.unregistered.emit(&RegistrationEvent { service });
                    }
                }
            }
            TransactionKind::WildConnect | TransactionKind::Monitor => {
                // Wild-card connects and monitors are unsupported; answer
                // with a failure result without dispatching.
                t.ret = CallbackResult::Ignored;
            }
            TransactionKind::Error => {
                debug!(code = %SysError::from(u16::try_from(t.aux).unwrap_or(u16::MAX)), "facility reported an error");
            }
        }
    }
}

fn make_callback(weak: Weak<ContextInner>) -> DdeCallback {
    Arc::new(move |transaction: &mut Transaction| {
        if let Some(inner) = weak.upgrade() {
            inner.dispatch(transaction);
        }
    })
}
