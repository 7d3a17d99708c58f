//! Client side of a conversation: synchronous and asynchronous transactions,
//! advise loops and pause control.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dde_proto::{
    Bytes, CallbackResult, CallbackState, ConvId, DataFormat, InstanceId, SysError, Transaction, TransactionId,
    TransactionKind, TransactionMode, TransactionOutcome, TransactionRequest, MAX_STRING_SIZE,
};
use parking_lot::{Condvar, Mutex};
use smol_str::SmolStr;
use tracing::debug;

use crate::context::{ContextInner, DdeContext, TextEncoding};
use crate::error::{status_of, DdeError, Status};
use crate::events::{AdviseEvent, AdviseState, DisconnectedEvent, EventHandlers, Subscription};

pub(crate) fn validate_name(name: &str, what: &'static str) -> Result<(), DdeError> {
    if name.is_empty() || name.len() > MAX_STRING_SIZE {
        return Err(DdeError::InvalidArgument(what));
    }
    Ok(())
}

fn validate_item(item: &str) -> Result<(), DdeError> {
    if item.len() > MAX_STRING_SIZE {
        return Err(DdeError::InvalidArgument("item"));
    }
    Ok(())
}

fn validate_timeout(timeout: Duration) -> Result<(), DdeError> {
    if timeout.is_zero() {
        return Err(DdeError::InvalidArgument("timeout"));
    }
    Ok(())
}

/// Names are matched the way the facility matches string handles.
fn name_key(name: &str) -> SmolStr {
    SmolStr::new(name.to_ascii_lowercase())
}

/// Commands travel as a NUL-terminated byte string in the context's codec.
fn encode_command(command: &str, encoding: TextEncoding) -> Bytes {
    let mut buffer = encoding.encode(command);
    buffer.push(0);
    Bytes::from(buffer)
}

/// Kind of an asynchronous client transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncKind {
    Execute,
    Poke,
    Request,
    StartAdvise,
    StopAdvise,
}

impl AsyncKind {
    fn operation(self) -> &'static str {
        match self {
            AsyncKind::Execute => "execute",
            AsyncKind::Poke => "poke",
            AsyncKind::Request => "request",
            AsyncKind::StartAdvise => "start advise",
            AsyncKind::StopAdvise => "stop advise",
        }
    }
}

/// Completion handler attached to a `begin_*` call; runs on the thread that
/// observed the completion.
pub type CompletionHandler = Box<dyn FnOnce(Result<Option<Bytes>, DdeError>) + Send>;

struct OpShared {
    id: TransactionId,
    kind: AsyncKind,
    item: SmolStr,
    format: DataFormat,
    /// Advise-loop state to attach once a deferred start-advise completes.
    advise_state: Mutex<Option<AdviseState>>,
    result: Mutex<Option<Result<Option<Bytes>, DdeError>>>,
    completed: Condvar,
    on_complete: Mutex<Option<CompletionHandler>>,
}

impl OpShared {
    /// First completion wins; later calls are no-ops.
    fn complete(&self, result: Result<Option<Bytes>, DdeError>) {
        let handler = {
            let mut slot = self.result.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(result.clone());
            self.completed.notify_all();
            self.on_complete.lock().take()
        };

        if let Some(handler) = handler {
            handler(result);
        }
    }
}

/// Handle to one outstanding asynchronous transaction.
///
/// Obtained from the `begin_*` operations; redeemed with the matching `end_*`
/// operation (or [`AsyncTransaction::wait`]).
#[derive(Clone)]
pub struct AsyncTransaction {
    shared: Arc<OpShared>,
}

impl AsyncTransaction {
    pub fn id(&self) -> TransactionId {
        self.shared.id
    }

    pub fn kind(&self) -> AsyncKind {
        self.shared.kind
    }

    pub fn is_completed(&self) -> bool {
        self.shared.result.lock().is_some()
    }

    /// Completed result, or `None` while still pending.
    pub fn result(&self) -> Option<Result<Option<Bytes>, DdeError>> {
        self.shared.result.lock().clone()
    }

    /// Blocks until the transaction completes, is abandoned, or the
    /// conversation ends.
    pub fn wait(&self) -> Result<Option<Bytes>, DdeError> {
        let mut slot = self.shared.result.lock();
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            self.shared.completed.wait(&mut slot);
        }
    }
}

#[derive(Clone)]
struct AdviseLoop {
    item: SmolStr,
    format: DataFormat,
    state: Option<AdviseState>,
}

struct ClientState {
    disposed: bool,
    paused: bool,
    instance: Option<InstanceId>,
    conv: Option<ConvId>,
    pending: HashMap<TransactionId, Arc<OpShared>>,
    advise_loops: HashMap<SmolStr, AdviseLoop>,
}

pub(crate) struct ClientCore {
    context: Arc<ContextInner>,
    service: SmolStr,
    topic: SmolStr,
    state: Mutex<ClientState>,
    state_changed: EventHandlers<()>,
    disconnected: EventHandlers<DisconnectedEvent>,
    advise: EventHandlers<AdviseEvent>,
}

/// Client end of one conversation with a (service, topic) pair.
///
/// All facility access is marshaled to the owning thread of the context;
/// the object itself may be used from any thread.
pub struct DdeClient {
    core: Arc<ClientCore>,
}

impl DdeClient {
    /// Creates a disconnected client for the given service and topic.
    pub fn new(context: &DdeContext, service: &str, topic: &str) -> Result<Self, DdeError> {
        validate_name(service, "service")?;
        validate_name(topic, "topic")?;

        let core = Arc::new(ClientCore {
            context: Arc::clone(context.inner()),
            service: SmolStr::new(service),
            topic: SmolStr::new(topic),
            state: Mutex::new(ClientState {
                disposed: false,
                paused: false,
                instance: None,
                conv: None,
                pending: HashMap::new(),
                advise_loops: HashMap::new(),
            }),
            state_changed: EventHandlers::new(),
            disconnected: EventHandlers::new(),
            advise: EventHandlers::new(),
        });

        Ok(Self { core })
    }

    pub fn service(&self) -> &str {
        &self.core.service
    }

    pub fn topic(&self) -> &str {
        &self.core.topic
    }

    /// Conversation handle while connected.
    pub fn handle(&self) -> Option<ConvId> {
        self.core.state.lock().conv
    }

    pub fn is_connected(&self) -> bool {
        self.core.state.lock().conv.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.core.state.lock().paused
    }

    pub fn is_disposed(&self) -> bool {
        self.core.state.lock().disposed
    }

    pub fn on_state_changed(&self, subscriber: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.core.state_changed.subscribe(Arc::new(move |(): &()| subscriber()))
    }

    pub fn on_disconnected(&self, subscriber: impl Fn(&DisconnectedEvent) + Send + Sync + 'static) -> Subscription {
        self.core.disconnected.subscribe(Arc::new(subscriber))
    }

    /// Subscribes to advise notifications for every loop of this client.
    pub fn on_advise(&self, subscriber: impl Fn(&AdviseEvent) + Send + Sync + 'static) -> Subscription {
        self.core.advise.subscribe(Arc::new(subscriber))
    }

    /// Detaches a subscription made on this client. Returns `false` when it
    /// was not found (already removed, or made on another object).
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        self.core.state_changed.unsubscribe(subscription)
            || self.core.disconnected.unsubscribe(subscription)
            || self.core.advise.unsubscribe(subscription)
    }

    /// Establishes the conversation, lazily initializing the context.
    pub fn connect(&self) -> Result<(), DdeError> {
        {
            let state = self.core.state.lock();
            if state.disposed {
                return Err(DdeError::Disposed);
            }
            if state.conv.is_some() {
                return Err(DdeError::AlreadyConnected);
            }
        }

        let core = Arc::clone(&self.core);
        self.core.context.thread.invoke(move || ClientCore::connect_on_owning_thread(&core))?
    }

    pub fn try_connect(&self) -> Status {
        status_of(&self.connect())
    }

    /// Terminates the conversation; every pending asynchronous transaction
    /// fails with [`DdeError::NotConnected`].
    pub fn disconnect(&self) -> Result<(), DdeError> {
        {
            let state = self.core.state.lock();
            if state.disposed {
                return Err(DdeError::Disposed);
            }
            if state.conv.is_none() {
                return Err(DdeError::NotConnected);
            }
        }

        let core = Arc::clone(&self.core);
        self.core.context.thread.invoke(move || {
            ClientCore::cleanup(&core, Teardown::LOCAL);
            Ok(())
        })?
    }

    /// Suspends callback delivery for this conversation. While paused,
    /// synchronous transactions issued against the conversation run into
    /// their timeout and asynchronous completions queue up.
    pub fn pause(&self) -> Result<(), DdeError> {
        let core = Arc::clone(&self.core);
        self.core.context.thread.invoke(move || core.set_paused(true))?
    }

    /// Re-enables callback delivery; queued callbacks are delivered in order.
    pub fn resume(&self) -> Result<(), DdeError> {
        let core = Arc::clone(&self.core);
        self.core.context.thread.invoke(move || core.set_paused(false))?
    }

    /// Sends a command string and blocks until the partner acknowledges.
    pub fn execute(&self, command: &str, timeout: Duration) -> Result<(), DdeError> {
        self.core.guard_connected()?;
        if command.len() > MAX_STRING_SIZE {
            return Err(DdeError::InvalidArgument("command"));
        }
        validate_timeout(timeout)?;

        let request = TransactionRequest::Execute {
            command: encode_command(command, self.core.context.text_encoding()),
        };
        let core = Arc::clone(&self.core);
        self.core
            .context
            .thread
            .invoke(move || core.transact_blocking(request, timeout, "execute").map(|_| ()))?
    }

    pub fn try_execute(&self, command: &str, timeout: Duration) -> Status {
        status_of(&self.execute(command, timeout))
    }

    /// Pushes data to an item and blocks until the partner acknowledges.
    pub fn poke(&self, item: &str, data: &[u8], format: DataFormat, timeout: Duration) -> Result<(), DdeError> {
        self.core.guard_connected()?;
        validate_item(item)?;
        validate_timeout(timeout)?;

        let request = TransactionRequest::Poke {
            item: SmolStr::new(item),
            format,
            data: Bytes::copy_from_slice(data),
        };
        let core = Arc::clone(&self.core);
        self.core
            .context
            .thread
            .invoke(move || core.transact_blocking(request, timeout, "poke").map(|_| ()))?
    }

    pub fn try_poke(&self, item: &str, data: &[u8], format: DataFormat, timeout: Duration) -> Status {
        status_of(&self.poke(item, data, format, timeout))
    }

    /// Requests the current value of an item.
    pub fn request(&self, item: &str, format: DataFormat, timeout: Duration) -> Result<Bytes, DdeError> {
        self.core.guard_connected()?;
        validate_item(item)?;
        validate_timeout(timeout)?;

        let request = TransactionRequest::Request {
            item: SmolStr::new(item),
            format,
        };
        let core = Arc::clone(&self.core);
        self.core.context.thread.invoke(move || {
            core.transact_blocking(request, timeout, "request")
                .map(|data| data.unwrap_or_else(Bytes::new))
        })?
    }

    pub fn try_request(&self, item: &str, format: DataFormat, timeout: Duration) -> (Status, Option<Bytes>) {
        match self.request(item, format, timeout) {
            Ok(data) => (Status::OK, Some(data)),
            Err(error) => (Status::from(&error), None),
        }
    }

    /// Opens an advise loop on an item and blocks until the partner accepts.
    ///
    /// A hot loop carries the new value with each notification; a warm loop
    /// only signals that the value changed. With `acknowledge` set, the
    /// partner waits for our acknowledgement before posting the next
    /// notification. `state` is echoed back with every notification.
    pub fn start_advise(
        &self,
        item: &str,
        format: DataFormat,
        hot: bool,
        acknowledge: bool,
        timeout: Duration,
        state: Option<AdviseState>,
    ) -> Result<(), DdeError> {
        self.core.guard_connected()?;
        validate_item(item)?;
        validate_timeout(timeout)?;

        let item = SmolStr::new(item);
        let core = Arc::clone(&self.core);
        self.core.context.thread.invoke(move || {
            // Register the loop first so notifications racing the
            // acknowledgement are not dropped, then roll back on failure.
            let key = name_key(&item);
            {
                let mut guard = core.state.lock();
                if guard.advise_loops.contains_key(&key) {
                    return Err(DdeError::AlreadyAdvised { item });
                }
                guard.advise_loops.insert(
                    key.clone(),
                    AdviseLoop {
                        item: item.clone(),
                        format,
                        state,
                    },
                );
            }

            let request = TransactionRequest::AdviseStart {
                item: item.clone(),
                format,
                warm: !hot,
                ack_required: acknowledge,
            };
            match core.transact_blocking(request, timeout, "start advise") {
                Ok(_) => Ok(()),
                Err(error) => {
                    core.state.lock().advise_loops.remove(&key);
                    Err(error)
                }
            }
        })?
    }

    /// Closes the advise loop on an item.
    pub fn stop_advise(&self, item: &str, timeout: Duration) -> Result<(), DdeError> {
        self.core.guard_connected()?;
        validate_item(item)?;
        validate_timeout(timeout)?;

        let item = SmolStr::new(item);
        let core = Arc::clone(&self.core);
        self.core.context.thread.invoke(move || {
            let key = name_key(&item);
            let advise_loop = core
                .state
                .lock()
                .advise_loops
                .get(&key)
                .cloned()
                .ok_or(DdeError::NotAdvised { item: item.clone() })?;

            let request = TransactionRequest::AdviseStop {
                item: advise_loop.item,
                format: advise_loop.format,
            };
            core.transact_blocking(request, timeout, "stop advise")?;
            core.state.lock().advise_loops.remove(&key);
            Ok(())
        })?
    }

    /// Starts an asynchronous execute; completion arrives through the
    /// returned handle and the optional `on_complete` callback.
    pub fn begin_execute(
        &self,
        command: &str,
        on_complete: Option<CompletionHandler>,
    ) -> Result<AsyncTransaction, DdeError> {
        self.core.guard_connected()?;
        if command.len() > MAX_STRING_SIZE {
            return Err(DdeError::InvalidArgument("command"));
        }

        let request = TransactionRequest::Execute {
            command: encode_command(command, self.core.context.text_encoding()),
        };
        self.begin_transact(request, AsyncKind::Execute, SmolStr::default(), DataFormat::TEXT, None, on_complete)
    }

    /// Blocks until an asynchronous execute completes.
    pub fn end_execute(&self, transaction: &AsyncTransaction) -> Result<(), DdeError> {
        transaction.wait().map(|_| ())
    }

    pub fn begin_poke(
        &self,
        item: &str,
        data: &[u8],
        format: DataFormat,
        on_complete: Option<CompletionHandler>,
    ) -> Result<AsyncTransaction, DdeError> {
        self.core.guard_connected()?;
        validate_item(item)?;

        let item = SmolStr::new(item);
        let request = TransactionRequest::Poke {
            item: item.clone(),
            format,
            data: Bytes::copy_from_slice(data),
        };
        self.begin_transact(request, AsyncKind::Poke, item, format, None, on_complete)
    }

    pub fn end_poke(&self, transaction: &AsyncTransaction) -> Result<(), DdeError> {
        transaction.wait().map(|_| ())
    }

    pub fn begin_request(
        &self,
        item: &str,
        format: DataFormat,
        on_complete: Option<CompletionHandler>,
    ) -> Result<AsyncTransaction, DdeError> {
        self.core.guard_connected()?;
        validate_item(item)?;

        let item = SmolStr::new(item);
        let request = TransactionRequest::Request {
            item: item.clone(),
            format,
        };
        self.begin_transact(request, AsyncKind::Request, item, format, None, on_complete)
    }

    pub fn end_request(&self, transaction: &AsyncTransaction) -> Result<Bytes, DdeError> {
        transaction.wait().map(|data| data.unwrap_or_else(Bytes::new))
    }

    /// Asynchronous form of [`DdeClient::start_advise`]. The loop is only
    /// registered once the completion reports success, so notifications can
    /// never outrun a failed start.
    pub fn begin_start_advise(
        &self,
        item: &str,
        format: DataFormat,
        hot: bool,
        acknowledge: bool,
        state: Option<AdviseState>,
        on_complete: Option<CompletionHandler>,
    ) -> Result<AsyncTransaction, DdeError> {
        self.core.guard_connected()?;
        validate_item(item)?;

        let item = SmolStr::new(item);
        let request = TransactionRequest::AdviseStart {
            item: item.clone(),
            format,
            warm: !hot,
            ack_required: acknowledge,
        };
        self.begin_transact(request, AsyncKind::StartAdvise, item, format, state, on_complete)
    }

    pub fn end_start_advise(&self, transaction: &AsyncTransaction) -> Result<(), DdeError> {
        transaction.wait().map(|_| ())
    }

    pub fn begin_stop_advise(
        &self,
        item: &str,
        on_complete: Option<CompletionHandler>,
    ) -> Result<AsyncTransaction, DdeError> {
        self.core.guard_connected()?;
        validate_item(item)?;

        let item = SmolStr::new(item);
        let key = name_key(&item);
        let advise_loop = self
            .core
            .state
            .lock()
            .advise_loops
            .get(&key)
            .cloned()
            .ok_or(DdeError::NotAdvised { item: item.clone() })?;

        let request = TransactionRequest::AdviseStop {
            item: advise_loop.item,
            format: advise_loop.format,
        };
        self.begin_transact(request, AsyncKind::StopAdvise, item, advise_loop.format, None, on_complete)
    }

    pub fn end_stop_advise(&self, transaction: &AsyncTransaction) -> Result<(), DdeError> {
        transaction.wait().map(|_| ())
    }

    /// Abandons a pending asynchronous transaction. A transaction that
    /// already completed is left alone.
    pub fn abandon(&self, transaction: &AsyncTransaction) -> Result<(), DdeError> {
        if transaction.is_completed() {
            return Ok(());
        }
        self.core.guard_connected()?;

        let core = Arc::clone(&self.core);
        let shared = Arc::clone(&transaction.shared);
        self.core.context.thread.invoke(move || {
            let removed = {
                let mut state = core.state.lock();
                let removed = state.pending.remove(&shared.id);
                if removed.is_some() {
                    if let (Some(instance), Some(conv)) = (state.instance, state.conv) {
                        let _ = core.context.api.abandon_transaction(instance, conv, shared.id);
                    }
                }
                removed
            };
            if let Some(op) = removed {
                op.complete(Err(DdeError::protocol(op.kind.operation(), SysError::UNFOUND_QUEUE_ID)));
            }
            Ok(())
        })?
    }

    /// Disconnects (when connected) and permanently retires the object.
    /// Idempotent; safe from any thread.
    pub fn dispose(&self) {
        if self.core.state.lock().disposed {
            return;
        }
        let core = Arc::clone(&self.core);
        if self
            .core
            .context
            .thread
            .invoke(move || ClientCore::dispose_on_owning_thread(&core))
            .is_err()
        {
            self.core.state.lock().disposed = true;
        }
    }

    fn begin_transact(
        &self,
        request: TransactionRequest,
        kind: AsyncKind,
        item: SmolStr,
        format: DataFormat,
        advise_state: Option<AdviseState>,
        on_complete: Option<CompletionHandler>,
    ) -> Result<AsyncTransaction, DdeError> {
        let core = Arc::clone(&self.core);
        self.core.context.thread.invoke(move || {
            // The pending-table insert must win the race against the
            // completion callback, so the state lock spans the facility call.
            let mut state = core.state.lock();
            if state.disposed {
                return Err(DdeError::Disposed);
            }
            let (instance, conv) = match (state.instance, state.conv) {
                (Some(instance), Some(conv)) => (instance, conv),
                _ => return Err(DdeError::NotConnected),
            };
            if kind == AsyncKind::StartAdvise && state.advise_loops.contains_key(&name_key(&item)) {
                return Err(DdeError::AlreadyAdvised { item });
            }

            match core.context.api.client_transaction(instance, conv, request, TransactionMode::Async) {
                Ok(TransactionOutcome::Pending(id)) => {
                    let shared = Arc::new(OpShared {
                        id,
                        kind,
                        item,
                        format,
                        advise_state: Mutex::new(advise_state),
                        result: Mutex::new(None),
                        completed: Condvar::new(),
                        on_complete: Mutex::new(on_complete),
                    });
                    state.pending.insert(id, Arc::clone(&shared));
                    Ok(AsyncTransaction { shared })
                }
                Ok(TransactionOutcome::Complete(_)) => Err(DdeError::protocol(kind.operation(), SysError::SYS_ERROR)),
                Err(code) => Err(DdeError::protocol(kind.operation(), code)),
            }
        })?
    }
}

impl Drop for DdeClient {
    fn drop(&mut self) {
        if self.core.state.lock().disposed {
            return;
        }

        if self.core.context.thread.is_owning_thread() {
            ClientCore::dispose_on_owning_thread(&self.core);
        } else {
            let core = Arc::clone(&self.core);
            if !self.core.context.thread.post(move || ClientCore::dispose_on_owning_thread(&core)) {
                self.core.state.lock().disposed = true;
            }
        }
    }
}

/// How a conversation is being torn down.
#[derive(Clone, Copy)]
struct Teardown {
    /// Call the facility to terminate the conversation.
    terminate: bool,
    server_initiated: bool,
    disposing: bool,
}

impl Teardown {
    const LOCAL: Self = Self {
        terminate: true,
        server_initiated: false,
        disposing: false,
    };
    const PARTNER: Self = Self {
        terminate: false,
        server_initiated: true,
        disposing: false,
    };
    const DISPOSAL: Self = Self {
        terminate: true,
        server_initiated: false,
        disposing: true,
    };
}

impl ClientCore {
    fn guard_connected(&self) -> Result<(), DdeError> {
        let state = self.state.lock();
        if state.disposed {
            return Err(DdeError::Disposed);
        }
        if state.conv.is_none() {
            return Err(DdeError::NotConnected);
        }
        Ok(())
    }

    fn connection(&self) -> Result<(InstanceId, ConvId), DdeError> {
        let state = self.state.lock();
        if state.disposed {
            return Err(DdeError::Disposed);
        }
        match (state.instance, state.conv) {
            (Some(instance), Some(conv)) => Ok((instance, conv)),
            _ => Err(DdeError::NotConnected),
        }
    }

    /// Must run on the owning thread.
    fn connect_on_owning_thread(core: &Arc<Self>) -> Result<(), DdeError> {
        let instance = ContextInner::ensure_initialized(&core.context)?;

        {
            let state = core.state.lock();
            if state.disposed {
                return Err(DdeError::Disposed);
            }
            if state.conv.is_some() {
                return Err(DdeError::AlreadyConnected);
            }
        }

        let conv = core
            .context
            .api
            .connect(instance, &core.service, &core.topic)
            .map_err(|code| DdeError::protocol("connect", code))?;

        {
            let mut state = core.state.lock();
            state.instance = Some(instance);
            state.conv = Some(conv);
        }
        core.context.register_client(conv, Arc::clone(core));

        debug!(service = %core.service, topic = %core.topic, %conv, "conversation established");
        core.state_changed.emit(&());

        Ok(())
    }

    /// Must run on the owning thread.
    fn set_paused(&self, paused: bool) -> Result<(), DdeError> {
        let (instance, conv) = {
            let state = self.state.lock();
            if state.disposed {
                return Err(DdeError::Disposed);
            }
            let (instance, conv) = match (state.instance, state.conv) {
                (Some(instance), Some(conv)) => (instance, conv),
                _ => return Err(DdeError::NotConnected),
            };
            if paused && state.paused {
                return Err(DdeError::AlreadyPaused);
            }
            if !paused && !state.paused {
                return Err(DdeError::NotPaused);
            }
            (instance, conv)
        };

        let (request, operation) = if paused {
            (CallbackState::Disable, "pause")
        } else {
            (CallbackState::EnableAll, "resume")
        };
        self.context
            .api
            .enable_callback(instance, Some(conv), request)
            .map_err(|code| DdeError::protocol(operation, code))?;

        self.state.lock().paused = paused;
        self.state_changed.emit(&());
        Ok(())
    }

    /// Must run on the owning thread.
    fn transact_blocking(
        &self,
        request: TransactionRequest,
        timeout: Duration,
        operation: &'static str,
    ) -> Result<Option<Bytes>, DdeError> {
        let (instance, conv) = self.connection()?;

        match self
            .context
            .api
            .client_transaction(instance, conv, request, TransactionMode::Blocking(timeout))
        {
            Ok(TransactionOutcome::Complete(data)) => Ok(data),
            // A blocking transaction never reports pending.
            Ok(TransactionOutcome::Pending(_)) => Err(DdeError::protocol(operation, SysError::SYS_ERROR)),
            Err(code) => Err(DdeError::protocol(operation, code)),
        }
    }

    /// Handles one raw callback addressed to this conversation. Returns
    /// `false` when the transaction is not ours.
    pub(crate) fn process_callback(this: &Arc<Self>, t: &mut Transaction) -> bool {
        match t.kind {
            TransactionKind::AdviseData => this.on_advise_data(t),
            TransactionKind::TransactionComplete => this.on_transaction_complete(t),
            TransactionKind::Disconnect => {
                t.ret = CallbackResult::Ignored;
                ClientCore::cleanup(this, Teardown::PARTNER);
                true
            }
            _ => false,
        }
    }

    fn on_advise_data(&self, t: &mut Transaction) -> bool {
        let Some(item) = t.str2.as_ref() else {
            return false;
        };
        let Some(advise_loop) = self.state.lock().advise_loops.get(&name_key(item)).cloned() else {
            return false;
        };

        self.advise.emit(&AdviseEvent {
            item: advise_loop.item,
            format: t.format,
            state: advise_loop.state,
            data: t.data.clone(),
        });

        // Acknowledge regardless of subscribers so an ack-required loop
        // keeps flowing.
        t.ret = CallbackResult::Ack;
        true
    }

    fn on_transaction_complete(&self, t: &mut Transaction) -> bool {
        let id = t.transaction_id();
        let Some(op) = self.state.lock().pending.remove(&id) else {
            return false;
        };

        // A completion with no data handle is the facility's failure signal.
        let result = match (op.kind, t.data.clone()) {
            (_, None) => Err(DdeError::protocol(op.kind.operation(), SysError::NOTPROCESSED)),
            (AsyncKind::Request, Some(data)) => Ok(Some(data)),
            (AsyncKind::StartAdvise, Some(_)) => {
                let key = name_key(&op.item);
                let mut state = self.state.lock();
                state.advise_loops.entry(key).or_insert_with(|| AdviseLoop {
                    item: op.item.clone(),
                    format: op.format,
                    state: op.advise_state.lock().take(),
                });
                Ok(None)
            }
            (AsyncKind::StopAdvise, Some(_)) => {
                self.state.lock().advise_loops.remove(&name_key(&op.item));
                Ok(None)
            }
            (AsyncKind::Execute | AsyncKind::Poke, Some(_)) => Ok(None),
        };

        op.complete(result);
        t.ret = CallbackResult::Ignored;
        true
    }

    /// Tears down the connected state and reports the outcome through the
    /// state-changed and disconnected events.
    fn cleanup(core: &Arc<Self>, teardown: Teardown) {
        let (conv, instance, pending) = {
            let mut state = core.state.lock();
            let conv = state.conv.take();
            let instance = state.instance.take();
            state.paused = false;
            if teardown.disposing {
                state.disposed = true;
            }
            let pending: Vec<_> = state.pending.drain().map(|(_, op)| op).collect();
            state.advise_loops.clear();
            (conv, instance, pending)
        };

        let Some(conv) = conv else {
            return;
        };

        if teardown.terminate {
            if let Some(instance) = instance {
                if !core.context.api.disconnect(instance, conv) {
                    debug!(%conv, "conversation was already gone");
                }
            }
        }

        for op in pending {
            op.complete(Err(DdeError::NotConnected));
        }

        core.context.unregister_client(conv);

        let event = DisconnectedEvent {
            server_initiated: teardown.server_initiated,
            disposed: teardown.disposing,
        };
        if teardown.disposing {
            core.state_changed.emit_isolated(&());
            core.disconnected.emit_isolated(&event);
        } else {
            core.state_changed.emit(&());
            core.disconnected.emit(&event);
        }
    }

    /// Must run on the owning thread. Idempotent.
    pub(crate) fn dispose_on_owning_thread(core: &Arc<Self>) {
        {
            let mut state = core.state.lock();
            if state.disposed {
                return;
            }
            if state.conv.is_none() {
                state.disposed = true;
                return;
            }
        }
        ClientCore::cleanup(core, Teardown::DISPOSAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_encoding_appends_nul() {
        let encoded = encode_command("beep", TextEncoding::Utf8);
        assert_eq!(encoded.as_ref(), b"beep\0");
    }

    #[test]
    fn command_encoding_follows_the_codec() {
        assert_eq!(encode_command("caf\u{e9}", TextEncoding::Utf8).as_ref(), b"caf\xc3\xa9\0");
        assert_eq!(encode_command("caf\u{e9}", TextEncoding::Latin1).as_ref(), b"caf\xe9\0");
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("myservice", "service").is_ok());
        assert_eq!(validate_name("", "service"), Err(DdeError::InvalidArgument("service")));
        let oversized = "x".repeat(MAX_STRING_SIZE + 1);
        assert_eq!(validate_name(&oversized, "topic"), Err(DdeError::InvalidArgument("topic")));
        assert!(validate_item("").is_ok());
        assert_eq!(validate_timeout(Duration::ZERO), Err(DdeError::InvalidArgument("timeout")));
    }

    #[test]
    fn completion_is_one_way() {
        let shared = Arc::new(OpShared {
            id: TransactionId::from(1),
            kind: AsyncKind::Execute,
            item: SmolStr::default(),
            format: DataFormat::TEXT,
            advise_state: Mutex::new(None),
            result: Mutex::new(None),
            completed: Condvar::new(),
            on_complete: Mutex::new(None),
        });

        shared.complete(Ok(None));
        shared.complete(Err(DdeError::NotConnected));

        let transaction = AsyncTransaction { shared };
        assert!(transaction.is_completed());
        assert_eq!(transaction.wait(), Ok(None));
    }

    #[test]
    fn completion_handler_fires_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let shared = Arc::new(OpShared {
            id: TransactionId::from(2),
            kind: AsyncKind::Request,
            item: SmolStr::new("item"),
            format: DataFormat::TEXT,
            advise_state: Mutex::new(None),
            result: Mutex::new(None),
            completed: Condvar::new(),
            on_complete: Mutex::new(Some(Box::new(move |_| {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }))),
        });

        shared.complete(Ok(Some(Bytes::from_static(b"value"))));
        shared.complete(Ok(None));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
