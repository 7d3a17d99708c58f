//! Mimics the DDE facility API in-process, without touching the OS.
//!
//! Instances registered with one [`MockDde`] can converse with each other:
//! connects, verbs, advise bursts and disconnect notifications are routed
//! between them the way the real facility routes them, including the parts
//! the core depends on for correctness:
//!
//! - callbacks of one instance are delivered serially by a dedicated worker
//!   thread, in queue order;
//! - `enable_callback` gates delivery per conversation or per instance, and
//!   queued deliveries survive until re-enabled;
//! - a callback answering `Block` parks the delivery (reply included) and
//!   disables the conversation until it is enabled again, at which point the
//!   transaction is re-delivered;
//! - synchronous transactions release through the client's own delivery
//!   queue, so a paused client conversation makes them time out;
//! - asynchronous transactions complete through a transaction-complete
//!   callback carrying a payload on success and none on failure.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dde_proto::smol_str::SmolStr;
use dde_proto::{
    Bytes, CallbackResult, CallbackState, ConvId, DdeApi, DdeCallback, InstanceId, ServiceId, SysError, Transaction,
    TransactionId, TransactionKind, TransactionMode, TransactionOutcome, TransactionRequest,
};
use parking_lot::{Condvar, Mutex};

fn key(name: &str) -> SmolStr {
    SmolStr::new(name.to_ascii_lowercase())
}

enum Delivery {
    Callback {
        transaction: Transaction,
        reply: Option<SyncSender<CallbackResult>>,
    },
    /// Pseudo-delivery releasing a synchronous transaction on the client
    /// side; gated like any other callback for that conversation.
    Release { conv: u32, signal: SyncSender<()> },
}

impl Delivery {
    fn conv(&self) -> Option<u32> {
        match self {
            Delivery::Callback { transaction, .. } => transaction.conv.map(u32::from),
            Delivery::Release { conv, .. } => Some(*conv),
        }
    }
}

#[derive(Default)]
struct DeliveryQueue {
    items: VecDeque<Delivery>,
    /// Instance-wide gate (`EC_DISABLE` with no conversation).
    enabled: bool,
    disabled_convs: HashSet<u32>,
    shutdown: bool,
}

struct Instance {
    callback: DdeCallback,
    queue: Mutex<DeliveryQueue>,
    deliverable: Condvar,
}

impl Instance {
    fn enqueue(&self, delivery: Delivery) {
        self.queue.lock().items.push_back(delivery);
        self.deliverable.notify_all();
    }

    fn run_worker(&self) {
        loop {
            let delivery = {
                let mut queue = self.queue.lock();
                loop {
                    if queue.shutdown {
                        return;
                    }
                    let DeliveryQueue {
                        items,
                        enabled,
                        disabled_convs,
                        ..
                    } = &mut *queue;
                    let next = items
                        .iter()
                        .position(|d| *enabled && d.conv().map_or(true, |conv| !disabled_convs.contains(&conv)));
                    if let Some(delivery) = next.and_then(|index| items.remove(index)) {
                        break delivery;
                    }
                    self.deliverable.wait(&mut queue);
                }
            };

            match delivery {
                Delivery::Release { signal, .. } => {
                    let _ = signal.send(());
                }
                Delivery::Callback { mut transaction, reply } => {
                    (self.callback)(&mut transaction);

                    if transaction.ret == CallbackResult::Block {
                        if let Some(conv) = transaction.conv {
                            // Park the transaction and stop delivering for
                            // this conversation until it is enabled again.
                            transaction.ret = CallbackResult::Ignored;
                            let mut queue = self.queue.lock();
                            queue.disabled_convs.insert(u32::from(conv));
                            queue.items.push_front(Delivery::Callback { transaction, reply });
                            continue;
                        }
                    }

                    if let Some(reply) = reply {
                        let _ = reply.send(transaction.ret.clone());
                    }
                }
            }
        }
    }
}

struct ConvEnd {
    instance: u32,
    peer: u32,
    topic: SmolStr,
}

struct ServiceEntry {
    instance: u32,
    service_id: u32,
    name: SmolStr,
}

struct AdviseLoopEntry {
    server_instance: u32,
    server_conv: u32,
    client_instance: u32,
    client_conv: u32,
    topic_key: SmolStr,
    topic: SmolStr,
    item_key: SmolStr,
    item: SmolStr,
    format: u16,
    warm: bool,
}

#[derive(Default)]
struct Universe {
    next_id: u32,
    instances: HashMap<u32, Arc<Instance>>,
    services: HashMap<SmolStr, ServiceEntry>,
    convs: HashMap<u32, ConvEnd>,
    advise_loops: Vec<AdviseLoopEntry>,
    /// Outstanding asynchronous transaction ids; removed on completion or
    /// abandon.
    pending: HashSet<u32>,
}

impl Universe {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-process [`DdeApi`] double. Instances created from clones of one
/// `MockDde` share a universe and can talk to each other.
#[derive(Clone, Default)]
pub struct MockDde {
    universe: Arc<Mutex<Universe>>,
}

impl MockDde {
    pub fn new() -> Self {
        Self::default()
    }

    fn announce(&self, kind: TransactionKind, service: &SmolStr) {
        let instances: Vec<Arc<Instance>> = self.universe.lock().instances.values().cloned().collect();
        for instance in instances {
            let mut transaction = Transaction::new(kind);
            transaction.str1 = Some(service.clone());
            instance.enqueue(Delivery::Callback {
                transaction,
                reply: None,
            });
        }
    }

    /// Resolves the server-side addressing of a client conversation.
    fn peer_of(&self, conv: ConvId) -> Result<(Arc<Instance>, u32, u32, SmolStr), SysError> {
        let universe = self.universe.lock();
        let end = universe.convs.get(&u32::from(conv)).ok_or(SysError::NO_CONV_ESTABLISHED)?;
        let peer_end = universe.convs.get(&end.peer).ok_or(SysError::NO_CONV_ESTABLISHED)?;
        let peer_instance = universe
            .instances
            .get(&peer_end.instance)
            .cloned()
            .ok_or(SysError::NO_CONV_ESTABLISHED)?;
        Ok((peer_instance, end.peer, peer_end.instance, end.topic.clone()))
    }

    fn own_instance(&self, instance: InstanceId) -> Result<Arc<Instance>, SysError> {
        self.universe
            .lock()
            .instances
            .get(&u32::from(instance))
            .cloned()
            .ok_or(SysError::DLL_NOT_INITIALIZED)
    }

    /// Sends the verb to the partner and waits for its answer, then releases
    /// through the client's own queue so client-side pause is honored.
    fn transact_sync(
        &self,
        instance: InstanceId,
        conv: ConvId,
        request: &TransactionRequest,
        timeout: Duration,
    ) -> Result<Option<Bytes>, SysError> {
        let deadline = Instant::now() + timeout;
        let own = self.own_instance(instance)?;
        let (peer_instance, peer_conv, _, topic) = self.peer_of(conv)?;

        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        peer_instance.enqueue(Delivery::Callback {
            transaction: verb_transaction(request, peer_conv, &topic),
            reply: Some(reply_tx),
        });

        let ret = match reply_rx.recv_timeout(timeout) {
            Ok(ret) => ret,
            Err(_) => return Err(timeout_code(request)),
        };

        // Completion is observable only once the client's own delivery
        // queue lets it through.
        let (release_tx, release_rx) = mpsc::sync_channel(1);
        own.enqueue(Delivery::Release {
            conv: u32::from(conv),
            signal: release_tx,
        });
        let remaining = deadline.saturating_duration_since(Instant::now());
        match release_rx.recv_timeout(remaining) {
            Ok(()) => {}
            Err(RecvTimeoutError::Timeout) => return Err(timeout_code(request)),
            Err(RecvTimeoutError::Disconnected) => return Err(SysError::SERVER_DIED),
        }

        self.conclude(conv, request, ret)
    }

    /// Applies the partner's answer: advise bookkeeping plus result mapping.
    fn conclude(
        &self,
        conv: ConvId,
        request: &TransactionRequest,
        ret: CallbackResult,
    ) -> Result<Option<Bytes>, SysError> {
        match request {
            TransactionRequest::Execute { .. } | TransactionRequest::Poke { .. } => match ret {
                CallbackResult::Ack => Ok(None),
                CallbackResult::Busy => Err(SysError::BUSY),
                _ => Err(SysError::NOTPROCESSED),
            },
            TransactionRequest::Request { .. } => match ret {
                CallbackResult::Data(data) => Ok(Some(data)),
                _ => Err(SysError::NOTPROCESSED),
            },
            TransactionRequest::AdviseStart {
                item, format, warm, ..
            } => match ret {
                CallbackResult::Accept(true) => {
                    self.record_advise_loop(conv, item, *format, *warm);
                    Ok(None)
                }
                _ => Err(SysError::NOTPROCESSED),
            },
            TransactionRequest::AdviseStop { item, .. } => {
                let conv = u32::from(conv);
                self.universe
                    .lock()
                    .advise_loops
                    .retain(|entry| !(entry.client_conv == conv && entry.item_key == key(item)));
                Ok(None)
            }
        }
    }

    fn record_advise_loop(&self, client_conv: ConvId, item: &str, format: dde_proto::DataFormat, warm: bool) {
        let mut universe = self.universe.lock();
        let client_conv = u32::from(client_conv);
        let Some(end) = universe.convs.get(&client_conv) else {
            return;
        };
        let (client_instance, server_conv, topic) = (end.instance, end.peer, end.topic.clone());
        let Some(server_end) = universe.convs.get(&server_conv) else {
            return;
        };
        let entry = AdviseLoopEntry {
            server_instance: server_end.instance,
            server_conv,
            client_instance,
            client_conv,
            topic_key: key(&topic),
            topic,
            item_key: key(item),
            item: SmolStr::new(item),
            format: format.into(),
            warm,
        };
        universe.advise_loops.push(entry);
    }

}

fn verb_transaction(request: &TransactionRequest, peer_conv: u32, topic: &SmolStr) -> Transaction {
    let (kind, str2, data, format) = match request {
        TransactionRequest::Execute { command } => {
            (TransactionKind::Execute, None, Some(command.clone()), dde_proto::DataFormat::TEXT)
        }
        TransactionRequest::Poke { item, format, data } => {
            (TransactionKind::Poke, Some(item.clone()), Some(data.clone()), *format)
        }
        TransactionRequest::Request { item, format } => (TransactionKind::Request, Some(item.clone()), None, *format),
        TransactionRequest::AdviseStart { item, format, .. } => {
            (TransactionKind::AdviseStart, Some(item.clone()), None, *format)
        }
        TransactionRequest::AdviseStop { item, format } => {
            (TransactionKind::AdviseStop, Some(item.clone()), None, *format)
        }
    };

    let mut transaction = Transaction::new(kind);
    transaction.conv = Some(ConvId::from(peer_conv));
    transaction.str1 = Some(topic.clone());
    transaction.str2 = str2;
    transaction.data = data;
    transaction.format = format;
    transaction
}

fn timeout_code(request: &TransactionRequest) -> SysError {
    match request {
        TransactionRequest::Execute { .. } => SysError::EXECACKTIMEOUT,
        TransactionRequest::Poke { .. } => SysError::POKEACKTIMEOUT,
        TransactionRequest::Request { .. } => SysError::DATAACKTIMEOUT,
        TransactionRequest::AdviseStart { .. } => SysError::ADVACKTIMEOUT,
        TransactionRequest::AdviseStop { .. } => SysError::UNADVACKTIMEOUT,
    }
}

impl DdeApi for MockDde {
    fn initialize(&self, callback: DdeCallback) -> Result<InstanceId, SysError> {
        let mut universe = self.universe.lock();
        let id = universe.next_id();
        let instance = Arc::new(Instance {
            callback,
            queue: Mutex::new(DeliveryQueue {
                enabled: true,
                ..DeliveryQueue::default()
            }),
            deliverable: Condvar::new(),
        });
        universe.instances.insert(id, Arc::clone(&instance));
        drop(universe);

        let worker_instance = Arc::clone(&instance);
        thread::Builder::new()
            .name(format!("mock-dde-{id}"))
            .spawn(move || worker_instance.run_worker())
            .map_err(|_| SysError::SYS_ERROR)?;

        Ok(InstanceId::from(id))
    }

    fn uninitialize(&self, instance: InstanceId) -> bool {
        let id = u32::from(instance);
        let (removed, partners, services) = {
            let mut universe = self.universe.lock();
            let Some(removed) = universe.instances.remove(&id) else {
                return false;
            };

            // Tear down every conversation this instance participates in
            // and collect the partners to notify.
            let local_convs: Vec<u32> = universe
                .convs
                .iter()
                .filter(|(_, end)| end.instance == id)
                .map(|(conv, _)| *conv)
                .collect();
            let mut partners = Vec::new();
            for conv in local_convs {
                let Some(end) = universe.convs.remove(&conv) else {
                    continue;
                };
                if let Some(peer_end) = universe.convs.remove(&end.peer) {
                    if let Some(peer_instance) = universe.instances.get(&peer_end.instance) {
                        partners.push((Arc::clone(peer_instance), end.peer));
                    }
                }
            }
            universe
                .advise_loops
                .retain(|entry| entry.server_instance != id && entry.client_instance != id);

            let withdrawn: Vec<SmolStr> = universe
                .services
                .iter()
                .filter(|(_, entry)| entry.instance == id)
                .map(|(service_key, _)| service_key.clone())
                .collect();
            let mut services = Vec::new();
            for service_key in withdrawn {
                if let Some(entry) = universe.services.remove(&service_key) {
                    services.push(entry.name);
                }
            }

            (removed, partners, services)
        };

        for (partner, partner_conv) in partners {
            let mut transaction = Transaction::new(TransactionKind::Disconnect);
            transaction.conv = Some(ConvId::from(partner_conv));
            partner.enqueue(Delivery::Callback {
                transaction,
                reply: None,
            });
        }
        for service in services {
            self.announce(TransactionKind::Unregister, &service);
        }

        removed.queue.lock().shutdown = true;
        removed.deliverable.notify_all();
        true
    }

    fn connect(&self, instance: InstanceId, service: &str, topic: &str) -> Result<ConvId, SysError> {
        let (server_instance, server_instance_id) = {
            let universe = self.universe.lock();
            let entry = universe.services.get(&key(service)).ok_or(SysError::NO_CONV_ESTABLISHED)?;
            let server = universe
                .instances
                .get(&entry.instance)
                .cloned()
                .ok_or(SysError::NO_CONV_ESTABLISHED)?;
            (server, entry.instance)
        };

        // Ask the server whether it accepts the topic.
        let mut transaction = Transaction::new(TransactionKind::Connect);
        transaction.str1 = Some(SmolStr::new(topic));
        transaction.str2 = Some(SmolStr::new(service));
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        server_instance.enqueue(Delivery::Callback {
            transaction,
            reply: Some(reply_tx),
        });
        match reply_rx.recv() {
            Ok(CallbackResult::Accept(true)) => {}
            Ok(_) | Err(_) => return Err(SysError::NO_CONV_ESTABLISHED),
        }

        let (client_conv, server_conv) = {
            let mut universe = self.universe.lock();
            let client_conv = universe.next_id();
            let server_conv = universe.next_id();
            universe.convs.insert(
                client_conv,
                ConvEnd {
                    instance: u32::from(instance),
                    peer: server_conv,
                    topic: SmolStr::new(topic),
                },
            );
            universe.convs.insert(
                server_conv,
                ConvEnd {
                    instance: server_instance_id,
                    peer: client_conv,
                    topic: SmolStr::new(topic),
                },
            );
            (client_conv, server_conv)
        };

        let mut transaction = Transaction::new(TransactionKind::ConnectConfirm);
        transaction.conv = Some(ConvId::from(server_conv));
        transaction.str1 = Some(SmolStr::new(topic));
        transaction.str2 = Some(SmolStr::new(service));
        server_instance.enqueue(Delivery::Callback {
            transaction,
            reply: None,
        });

        Ok(ConvId::from(client_conv))
    }

    fn disconnect(&self, _instance: InstanceId, conv: ConvId) -> bool {
        let conv = u32::from(conv);
        let partner = {
            let mut universe = self.universe.lock();
            let Some(end) = universe.convs.remove(&conv) else {
                return false;
            };
            let peer = end.peer;
            let partner = universe
                .convs
                .remove(&peer)
                .and_then(|peer_end| universe.instances.get(&peer_end.instance).cloned())
                .map(|peer_instance| (peer_instance, peer));
            universe
                .advise_loops
                .retain(|entry| entry.client_conv != conv && entry.server_conv != conv);
            partner
        };

        if let Some((partner, partner_conv)) = partner {
            let mut transaction = Transaction::new(TransactionKind::Disconnect);
            transaction.conv = Some(ConvId::from(partner_conv));
            partner.enqueue(Delivery::Callback {
                transaction,
                reply: None,
            });
        }
        true
    }

    fn client_transaction(
        &self,
        instance: InstanceId,
        conv: ConvId,
        request: TransactionRequest,
        mode: TransactionMode,
    ) -> Result<TransactionOutcome, SysError> {
        match mode {
            TransactionMode::Blocking(timeout) => self
                .transact_sync(instance, conv, &request, timeout)
                .map(TransactionOutcome::Complete),
            TransactionMode::Async => {
                let own = self.own_instance(instance)?;
                let (peer_instance, peer_conv, _, topic) = self.peer_of(conv)?;
                let id = {
                    let mut universe = self.universe.lock();
                    let id = universe.next_id();
                    universe.pending.insert(id);
                    id
                };

                let mock = self.clone();
                let builder = thread::Builder::new().name(format!("mock-dde-xact-{id}"));
                builder
                    .spawn(move || {
                        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
                        peer_instance.enqueue(Delivery::Callback {
                            transaction: verb_transaction(&request, peer_conv, &topic),
                            reply: Some(reply_tx),
                        });
                        let outcome = match reply_rx.recv() {
                            Ok(ret) => mock.conclude(conv, &request, ret),
                            Err(_) => Err(SysError::SERVER_DIED),
                        };

                        // Skip completion when the transaction was abandoned.
                        if !mock.universe.lock().pending.remove(&id) {
                            return;
                        }

                        let mut transaction = Transaction::new(TransactionKind::TransactionComplete);
                        transaction.conv = Some(conv);
                        transaction.aux = id;
                        // A present data handle signals success, even for
                        // verbs with no payload.
                        transaction.data = match outcome {
                            Ok(data) => Some(data.unwrap_or_else(Bytes::new)),
                            Err(_) => None,
                        };
                        own.enqueue(Delivery::Callback {
                            transaction,
                            reply: None,
                        });
                    })
                    .map_err(|_| SysError::SYS_ERROR)?;

                Ok(TransactionOutcome::Pending(TransactionId::from(id)))
            }
        }
    }

    fn abandon_transaction(&self, _instance: InstanceId, _conv: ConvId, transaction: TransactionId) -> bool {
        self.universe.lock().pending.remove(&u32::from(transaction))
    }

    fn enable_callback(
        &self,
        instance: InstanceId,
        conv: Option<ConvId>,
        state: CallbackState,
    ) -> Result<(), SysError> {
        let own = self.own_instance(instance)?;
        let mut queue = own.queue.lock();
        match (conv, state) {
            (Some(conv), CallbackState::Disable) => {
                queue.disabled_convs.insert(u32::from(conv));
            }
            (Some(conv), CallbackState::EnableAll) => {
                queue.disabled_convs.remove(&u32::from(conv));
            }
            (None, CallbackState::Disable) => queue.enabled = false,
            (None, CallbackState::EnableAll) => queue.enabled = true,
        }
        drop(queue);
        own.deliverable.notify_all();
        Ok(())
    }

    fn register_service(&self, instance: InstanceId, service: &str) -> Result<ServiceId, SysError> {
        let (service_id, name) = {
            let mut universe = self.universe.lock();
            if !universe.instances.contains_key(&u32::from(instance)) {
                return Err(SysError::DLL_NOT_INITIALIZED);
            }
            if universe.services.contains_key(&key(service)) {
                return Err(SysError::DLL_USAGE);
            }
            let service_id = universe.next_id();
            let name = SmolStr::new(service);
            universe.services.insert(
                key(service),
                ServiceEntry {
                    instance: u32::from(instance),
                    service_id,
                    name: name.clone(),
                },
            );
            (service_id, name)
        };

        self.announce(TransactionKind::Register, &name);
        Ok(ServiceId::from(service_id))
    }

    fn unregister_service(&self, instance: InstanceId, service: ServiceId) -> bool {
        let name = {
            let mut universe = self.universe.lock();
            let service_key = universe
                .services
                .iter()
                .find(|(_, entry)| entry.instance == u32::from(instance) && entry.service_id == u32::from(service))
                .map(|(service_key, _)| service_key.clone());
            let Some(service_key) = service_key else {
                return false;
            };
            universe.services.remove(&service_key).map(|entry| entry.name)
        };

        if let Some(name) = name {
            self.announce(TransactionKind::Unregister, &name);
        }
        true
    }

    fn post_advise(&self, instance: InstanceId, topic: Option<&str>, item: Option<&str>) -> Result<(), SysError> {
        struct Target {
            server: Arc<Instance>,
            server_conv: u32,
            client: Arc<Instance>,
            client_conv: u32,
            topic: SmolStr,
            item: SmolStr,
            format: u16,
            warm: bool,
            remaining: u32,
        }

        let targets: Vec<Target> = {
            let universe = self.universe.lock();
            if !universe.instances.contains_key(&u32::from(instance)) {
                return Err(SysError::DLL_NOT_INITIALIZED);
            }
            let topic_key = topic.map(key);
            let item_key = item.map(key);

            let matching: Vec<&AdviseLoopEntry> = universe
                .advise_loops
                .iter()
                .filter(|entry| {
                    entry.server_instance == u32::from(instance)
                        && topic_key.as_ref().map_or(true, |topic| *topic == entry.topic_key)
                        && item_key.as_ref().map_or(true, |item| *item == entry.item_key)
                })
                .collect();

            // Remaining counts run down per (topic, item, format) tuple so
            // the server can evict its advise cache after the last consumer.
            let mut tuple_counts: HashMap<(SmolStr, SmolStr, u16), u32> = HashMap::new();
            for entry in &matching {
                *tuple_counts
                    .entry((entry.topic_key.clone(), entry.item_key.clone(), entry.format))
                    .or_insert(0) += 1;
            }

            matching
                .into_iter()
                .filter_map(|entry| {
                    let count = tuple_counts.get_mut(&(entry.topic_key.clone(), entry.item_key.clone(), entry.format))?;
                    *count -= 1;
                    let server = universe.instances.get(&entry.server_instance)?.clone();
                    let client = universe.instances.get(&entry.client_instance)?.clone();
                    Some(Target {
                        server,
                        server_conv: entry.server_conv,
                        client,
                        client_conv: entry.client_conv,
                        topic: entry.topic.clone(),
                        item: entry.item.clone(),
                        format: entry.format,
                        warm: entry.warm,
                        remaining: *count,
                    })
                })
                .collect()
        };

        // Serve the burst off-thread; post_advise itself never blocks.
        let builder = thread::Builder::new().name("mock-dde-advise".to_owned());
        builder
            .spawn(move || {
                for target in targets {
                    let mut transaction = Transaction::new(TransactionKind::AdviseRequest);
                    transaction.conv = Some(ConvId::from(target.server_conv));
                    transaction.str1 = Some(target.topic.clone());
                    transaction.str2 = Some(target.item.clone());
                    transaction.format = dde_proto::DataFormat::from(target.format);
                    transaction.aux = target.remaining;

                    let (reply_tx, reply_rx) = mpsc::sync_channel(1);
                    target.server.enqueue(Delivery::Callback {
                        transaction,
                        reply: Some(reply_tx),
                    });
                    let Ok(CallbackResult::Data(data)) = reply_rx.recv() else {
                        continue;
                    };

                    let mut notification = Transaction::new(TransactionKind::AdviseData);
                    notification.conv = Some(ConvId::from(target.client_conv));
                    notification.str1 = Some(target.topic);
                    notification.str2 = Some(target.item);
                    notification.format = dde_proto::DataFormat::from(target.format);
                    notification.data = (!target.warm).then_some(data);
                    target.client.enqueue(Delivery::Callback {
                        transaction: notification,
                        reply: None,
                    });
                }
            })
            .map_err(|_| SysError::SYS_ERROR)?;

        Ok(())
    }
}
