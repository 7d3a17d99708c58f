//! End-to-end scenarios over the in-process facility double: a real server
//! and client talking through `MockDde`, exercising verbs, advise loops,
//! pause gating and teardown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dde_core::proto::{DataFormat, SysError, Transaction, TransactionKind};
use dde_core::{
    AdviseEvent, DdeClient, DdeContext, DdeError, DdeServer, DisconnectedEvent, ExecuteResult, PokeResult,
    RequestResult, ServerConversation, ServerHandler, TextEncoding, TransactionFilter,
};
use mock_dde::MockDde;
use parking_lot::Mutex;

const TIMEOUT: Duration = Duration::from_millis(1000);

/// Test server: stores pokes, serves requests and advises from a value map,
/// and honors the `#NotProcessed` / `#PauseConversation` command protocol.
#[derive(Default)]
struct EchoHandler {
    values: Mutex<HashMap<(String, String, u16), Bytes>>,
    commands: Mutex<Vec<String>>,
    advise_calls: AtomicUsize,
    pause_served: AtomicBool,
}

impl EchoHandler {
    fn value(&self, topic: &str, item: &str, format: u16) -> Option<Bytes> {
        self.values
            .lock()
            .get(&(topic.to_owned(), item.to_owned(), format))
            .cloned()
    }

    fn set_value(&self, topic: &str, item: &str, format: u16, data: &[u8]) {
        self.values
            .lock()
            .insert((topic.to_owned(), item.to_owned(), format), Bytes::copy_from_slice(data));
    }
}

impl ServerHandler for EchoHandler {
    fn on_execute(&self, _conversation: &ServerConversation, command: &str) -> ExecuteResult {
        self.commands.lock().push(command.to_owned());
        match command {
            "#NotProcessed" => ExecuteResult::NotProcessed,
            "#PauseConversation" if !self.pause_served.swap(true, Ordering::SeqCst) => {
                ExecuteResult::PauseConversation
            }
            _ => ExecuteResult::Processed,
        }
    }

    fn on_poke(&self, conversation: &ServerConversation, item: &str, data: Bytes, format: DataFormat) -> PokeResult {
        self.set_value(conversation.topic(), item, format.into(), &data);
        PokeResult::Processed
    }

    fn on_request(&self, conversation: &ServerConversation, item: &str, format: DataFormat) -> RequestResult {
        match self.value(conversation.topic(), item, format.into()) {
            Some(data) => RequestResult::Processed(Some(data)),
            None => RequestResult::NotProcessed,
        }
    }

    fn on_advise(&self, topic: &str, item: &str, format: DataFormat) -> Option<Bytes> {
        self.advise_calls.fetch_add(1, Ordering::SeqCst);
        self.value(topic, item, format.into())
    }
}

struct Fixture {
    server_context: DdeContext,
    client_context: DdeContext,
    server: DdeServer,
    handler: Arc<EchoHandler>,
    client: DdeClient,
}

fn fixture() -> Fixture {
    let mock = MockDde::new();
    let server_context = DdeContext::new(Arc::new(mock.clone()));
    let client_context = DdeContext::new(Arc::new(mock));

    let handler = Arc::new(EchoHandler::default());
    let server = DdeServer::new(&server_context, "myservice", Arc::clone(&handler) as Arc<dyn ServerHandler>)
        .expect("valid service name");
    server.register().expect("service registers");

    let client = DdeClient::new(&client_context, "myservice", "mytopic").expect("valid names");
    client.connect().expect("conversation establishes");

    Fixture {
        server_context,
        client_context,
        server,
        handler,
        client,
    }
}

/// The connect-confirm callback races the connect call; wait for the server
/// to materialize its conversation object.
fn server_conversation(server: &DdeServer) -> Arc<ServerConversation> {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        if let Some(conversation) = server.conversations().into_iter().next() {
            return conversation;
        }
        assert!(Instant::now() < deadline, "server never observed the conversation");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn poke_round_trip_updates_server_value() {
    let f = fixture();

    f.client
        .poke("myitem", b"Hello World", DataFormat::TEXT, TIMEOUT)
        .expect("poke acknowledges");
    f.client.disconnect().expect("disconnects");

    assert_eq!(
        f.handler.value("mytopic", "myitem", 1),
        Some(Bytes::from_static(b"Hello World"))
    );
}

#[test]
fn request_returns_served_bytes() {
    let f = fixture();
    f.handler.set_value("mytopic", "myitem", 1, b"payload");

    let data = f
        .client
        .request("myitem", DataFormat::TEXT, TIMEOUT)
        .expect("request succeeds");
    assert_eq!(data, Bytes::from_static(b"payload"));

    let error = f
        .client
        .request("unknown", DataFormat::TEXT, TIMEOUT)
        .expect_err("unserved item fails");
    assert_eq!(error.sys_code(), Some(SysError::NOTPROCESSED));
}

#[test]
fn execute_not_processed_carries_the_facility_code() {
    let f = fixture();

    let error = f.client.execute("#NotProcessed", TIMEOUT).expect_err("hook refuses");
    assert_eq!(error.sys_code(), Some(SysError::NOTPROCESSED));

    let status = f.client.try_execute("#NotProcessed", TIMEOUT);
    assert_eq!(status.sys_code(), Some(SysError::NOTPROCESSED));

    f.client.execute("anything else", TIMEOUT).expect("hook accepts");
}

#[test]
fn execute_commands_cross_in_the_configured_encoding() {
    let f = fixture();
    assert_eq!(f.client_context.encoding(), TextEncoding::Utf8);

    f.client.execute("caf\u{e9}", TIMEOUT).expect("utf-8 executes");
    assert_eq!(f.handler.commands.lock().pop(), Some("caf\u{e9}".to_owned()));

    f.client_context.set_encoding(TextEncoding::Latin1).expect("codec changes");
    f.server_context.set_encoding(TextEncoding::Latin1).expect("codec changes");
    assert_eq!(f.client_context.encoding(), TextEncoding::Latin1);

    f.client.execute("caf\u{e9}", TIMEOUT).expect("latin-1 executes");
    assert_eq!(f.handler.commands.lock().pop(), Some("caf\u{e9}".to_owned()));
}

#[test]
fn hot_advise_delivers_item_format_state_and_data() {
    let f = fixture();
    f.handler.set_value("mytopic", "myitem", 1, b"fresh");

    let (tx, rx) = mpsc::channel::<AdviseEvent>();
    f.client.on_advise(move |event| {
        let _ = tx.send(event.clone());
    });

    f.client
        .start_advise("myitem", DataFormat::TEXT, true, true, TIMEOUT, Some(Arc::new(42u32)))
        .expect("advise loop starts");
    f.server.advise("mytopic", "myitem").expect("advise posts");

    let event = rx.recv_timeout(TIMEOUT).expect("advise event fires");
    assert_eq!(event.item, "myitem");
    assert_eq!(event.format, DataFormat::TEXT);
    assert_eq!(event.data, Some(Bytes::from_static(b"fresh")));
    let state = event.state.expect("loop state is echoed back");
    assert_eq!(state.downcast_ref::<u32>(), Some(&42));
}

#[test]
fn warm_advise_signals_without_payload() {
    let f = fixture();
    f.handler.set_value("mytopic", "myitem", 1, b"current");

    let (tx, rx) = mpsc::channel::<AdviseEvent>();
    f.client.on_advise(move |event| {
        let _ = tx.send(event.clone());
    });

    f.client
        .start_advise("myitem", DataFormat::TEXT, false, false, TIMEOUT, None)
        .expect("warm loop starts");
    f.server.advise("mytopic", "myitem").expect("advise posts");

    // The notification signals the change but carries no value.
    let event = rx.recv_timeout(TIMEOUT).expect("warm notification fires");
    assert_eq!(event.item, "myitem");
    assert_eq!(event.data, None);
}

#[test]
fn async_advise_start_registers_the_loop_on_completion() {
    let f = fixture();
    f.handler.set_value("mytopic", "myitem", 1, b"fresh");

    let (tx, rx) = mpsc::channel::<AdviseEvent>();
    f.client.on_advise(move |event| {
        let _ = tx.send(event.clone());
    });

    let pending = f
        .client
        .begin_start_advise("myitem", DataFormat::TEXT, true, false, Some(Arc::new(7u32)), None)
        .expect("async start begins");
    f.client.end_start_advise(&pending).expect("start completes");

    // Only the completed start holds the loop; a second start is refused and
    // notifications flow with the state attached at completion.
    let error = f
        .client
        .start_advise("myitem", DataFormat::TEXT, true, false, TIMEOUT, None)
        .expect_err("loop already exists");
    assert!(matches!(error, DdeError::AlreadyAdvised { .. }));

    f.server.advise("mytopic", "myitem").expect("advise posts");
    let event = rx.recv_timeout(TIMEOUT).expect("advise event fires");
    assert_eq!(event.data, Some(Bytes::from_static(b"fresh")));
    let state = event.state.expect("loop state is echoed back");
    assert_eq!(state.downcast_ref::<u32>(), Some(&7));

    let stop = f.client.begin_stop_advise("myitem", None).expect("async stop begins");
    f.client.end_stop_advise(&stop).expect("stop completes");
    let error = f.client.stop_advise("myitem", TIMEOUT).expect_err("loop is gone");
    assert!(matches!(error, DdeError::NotAdvised { .. }));
}

#[test]
fn advise_burst_invokes_the_hook_once_per_tuple() {
    let f = fixture();
    f.handler.set_value("mytopic", "myitem", 1, b"v1");

    let second = DdeClient::new(&f.client_context, "myservice", "mytopic").expect("valid names");
    second.connect().expect("second conversation establishes");

    let (tx, rx) = mpsc::channel::<AdviseEvent>();
    let tx2 = tx.clone();
    f.client.on_advise(move |event| {
        let _ = tx.send(event.clone());
    });
    second.on_advise(move |event| {
        let _ = tx2.send(event.clone());
    });

    f.client
        .start_advise("myitem", DataFormat::TEXT, true, false, TIMEOUT, None)
        .expect("first loop starts");
    second
        .start_advise("myitem", DataFormat::TEXT, true, false, TIMEOUT, None)
        .expect("second loop starts");

    f.server.advise("mytopic", "myitem").expect("advise posts");
    for _ in 0..2 {
        let event = rx.recv_timeout(TIMEOUT).expect("both subscribers are served");
        assert_eq!(event.data, Some(Bytes::from_static(b"v1")));
    }
    assert_eq!(f.handler.advise_calls.load(Ordering::SeqCst), 1);

    // A second burst for the same tuple starts from a clean cache.
    f.handler.set_value("mytopic", "myitem", 1, b"v2");
    f.server.advise("mytopic", "myitem").expect("advise posts again");
    for _ in 0..2 {
        let event = rx.recv_timeout(TIMEOUT).expect("burst two is served");
        assert_eq!(event.data, Some(Bytes::from_static(b"v2")));
    }
    assert_eq!(f.handler.advise_calls.load(Ordering::SeqCst), 2);
}

#[test]
fn duplicate_advise_loop_is_a_state_error() {
    let f = fixture();
    f.handler.set_value("mytopic", "myitem", 1, b"x");

    f.client
        .start_advise("myitem", DataFormat::TEXT, true, false, TIMEOUT, None)
        .expect("loop starts");
    let error = f
        .client
        .start_advise("MyItem", DataFormat::TEXT, true, false, TIMEOUT, None)
        .expect_err("item names are matched case-insensitively");
    assert!(matches!(error, DdeError::AlreadyAdvised { .. }));

    f.client.stop_advise("myitem", TIMEOUT).expect("loop stops");
    let error = f.client.stop_advise("myitem", TIMEOUT).expect_err("loop is gone");
    assert!(matches!(error, DdeError::NotAdvised { .. }));
}

#[test]
fn pause_conversation_blocks_execute_until_resumed() {
    let f = fixture();
    let conversation = server_conversation(&f.server);

    let pending = f
        .client
        .begin_execute("#PauseConversation", None)
        .expect("async execute starts");

    // The hook answered pause-conversation; the transaction is parked.
    let deadline = Instant::now() + TIMEOUT;
    while !conversation.is_paused() {
        assert!(Instant::now() < deadline, "conversation never paused");
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(!pending.is_completed());

    f.server
        .resume_conversation(conversation.handle())
        .expect("conversation resumes");
    f.client.end_execute(&pending).expect("parked execute completes");
}

#[test]
fn client_pause_defers_async_completion() {
    let f = fixture();

    f.client.pause().expect("pauses");
    let pending = f.client.begin_execute("anything", None).expect("async execute starts");

    std::thread::sleep(Duration::from_millis(100));
    assert!(!pending.is_completed());

    f.client.resume().expect("resumes");
    f.client.end_execute(&pending).expect("completion is delivered");
}

#[test]
fn pause_resume_are_strict_toggles() {
    let f = fixture();

    f.client.pause().expect("first pause");
    assert_eq!(f.client.pause(), Err(DdeError::AlreadyPaused));
    f.client.resume().expect("resume");
    assert_eq!(f.client.resume(), Err(DdeError::NotPaused));

    assert_eq!(f.client.connect(), Err(DdeError::AlreadyConnected));
    assert_eq!(f.server.register(), Err(DdeError::AlreadyRegistered));
    f.server.unregister().expect("unregisters");
    assert_eq!(f.server.unregister(), Err(DdeError::NotRegistered));
}

#[test]
fn disconnect_fails_every_pending_transaction() {
    let f = fixture();

    f.client.pause().expect("pauses");
    let pending = f.client.begin_execute("anything", None).expect("async execute starts");
    let pending_request = f
        .client
        .begin_request("myitem", DataFormat::TEXT, None)
        .expect("async request starts");

    f.client.disconnect().expect("disconnects");

    assert_eq!(f.client.end_execute(&pending), Err(DdeError::NotConnected));
    assert_eq!(f.client.end_request(&pending_request), Err(DdeError::NotConnected));
    assert!(!f.client.is_connected());
    assert!(!f.client.is_paused());
}

#[test]
fn abandon_is_a_noop_after_completion() {
    let f = fixture();

    let done = f.client.begin_execute("anything", None).expect("async execute starts");
    f.client.end_execute(&done).expect("completes");
    f.client.abandon(&done).expect("abandoning a completed transaction");
    f.client.end_execute(&done).expect("result is unchanged");

    f.client.pause().expect("pauses");
    let parked = f.client.begin_execute("anything", None).expect("async execute starts");
    f.client.abandon(&parked).expect("abandons a pending transaction");
    let error = f.client.end_execute(&parked).expect_err("abandoned");
    assert_eq!(error.sys_code(), Some(SysError::UNFOUND_QUEUE_ID));
    f.client.resume().expect("resumes");
}

#[test]
fn forced_disconnect_notifies_the_client_as_server_initiated() {
    let f = fixture();
    let conversation = server_conversation(&f.server);

    let (tx, rx) = mpsc::channel::<DisconnectedEvent>();
    f.client.on_disconnected(move |event| {
        let _ = tx.send(event.clone());
    });

    f.server.disconnect(conversation.handle()).expect("forced disconnect");

    let event = rx.recv_timeout(TIMEOUT).expect("disconnect event fires");
    assert!(event.server_initiated);
    assert!(!event.disposed);

    let deadline = Instant::now() + TIMEOUT;
    while f.client.is_connected() {
        assert!(Instant::now() < deadline, "client never observed the disconnect");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn dispose_is_idempotent_and_poisons_operations() {
    let f = fixture();

    f.client.dispose();
    f.client.dispose();
    assert!(f.client.is_disposed());
    assert!(!f.client.is_connected());
    assert_eq!(f.client.execute("x", TIMEOUT), Err(DdeError::Disposed));
    assert_eq!(f.client.connect(), Err(DdeError::Disposed));

    f.server.dispose();
    f.server.dispose();
    assert!(f.server.is_disposed());
    assert_eq!(f.server.register(), Err(DdeError::Disposed));

    f.client_context.dispose();
    f.client_context.dispose();
    assert!(f.client_context.is_disposed());
    assert_eq!(f.client_context.initialize(), Err(DdeError::Disposed));
    f.server_context.dispose();
}

#[test]
fn context_dispose_tears_down_its_clients() {
    let f = fixture();

    f.client_context.dispose();

    assert!(!f.client.is_connected());
    assert!(f.client.is_disposed());
}

#[test]
fn registration_is_announced_to_other_contexts() {
    let mock = MockDde::new();
    let server_context = DdeContext::new(Arc::new(mock.clone()));
    let observer_context = DdeContext::new(Arc::new(mock));

    observer_context.initialize().expect("initializes");
    assert_eq!(observer_context.initialize(), Err(DdeError::AlreadyInitialized));

    let (tx, rx) = mpsc::channel::<String>();
    observer_context.on_registered(move |event| {
        let _ = tx.send(event.service.to_string());
    });

    let server = DdeServer::new(&server_context, "announced", Arc::new(EchoHandler::default())).expect("valid name");
    server.register().expect("registers");

    let service = rx.recv_timeout(TIMEOUT).expect("announcement arrives");
    assert_eq!(service, "announced");
}

#[test]
fn advise_subscription_can_be_detached() {
    let f = fixture();
    f.handler.set_value("mytopic", "myitem", 1, b"x");

    let (tx, rx) = mpsc::channel::<AdviseEvent>();
    let subscription = f.client.on_advise(move |event| {
        let _ = tx.send(event.clone());
    });

    f.client
        .start_advise("myitem", DataFormat::TEXT, true, false, TIMEOUT, None)
        .expect("loop starts");
    f.server.advise("mytopic", "myitem").expect("advise posts");
    rx.recv_timeout(TIMEOUT).expect("subscribed notifications flow");

    assert!(f.client.unsubscribe(subscription));
    assert!(!f.client.unsubscribe(subscription));

    f.server.advise("mytopic", "myitem").expect("advise posts again");
    assert!(rx.recv_timeout(Duration::from_millis(250)).is_err());
}

struct ClaimAdviseData;

impl TransactionFilter for ClaimAdviseData {
    fn pre_filter_transaction(&self, transaction: &mut Transaction) -> bool {
        transaction.kind == TransactionKind::AdviseData
    }
}

#[test]
fn transaction_filters_get_first_refusal() {
    let f = fixture();
    f.handler.set_value("mytopic", "myitem", 1, b"unseen");

    let filter: Arc<dyn TransactionFilter> = Arc::new(ClaimAdviseData);
    f.client_context
        .add_transaction_filter(Arc::clone(&filter))
        .expect("filter installs");
    assert_eq!(
        f.client_context.add_transaction_filter(Arc::clone(&filter)),
        Err(DdeError::FilterAlreadyAdded)
    );

    let (tx, rx) = mpsc::channel::<AdviseEvent>();
    f.client.on_advise(move |event| {
        let _ = tx.send(event.clone());
    });
    f.client
        .start_advise("myitem", DataFormat::TEXT, true, false, TIMEOUT, None)
        .expect("loop starts");
    f.server.advise("mytopic", "myitem").expect("advise posts");

    // The filter claimed the notification before client dispatch.
    assert!(rx.recv_timeout(Duration::from_millis(250)).is_err());

    f.client_context.remove_transaction_filter(&filter).expect("filter removes");
    assert_eq!(
        f.client_context.remove_transaction_filter(&filter),
        Err(DdeError::FilterNotAdded)
    );

    f.server.advise("mytopic", "myitem").expect("advise posts again");
    rx.recv_timeout(TIMEOUT).expect("advise event flows once unfiltered");
}
