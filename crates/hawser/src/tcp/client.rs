use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicU32, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, error};

use crate::{
    Endpoint, Error,
    assemble::AssembleCreator,
    reactor::{IoCtx, IoThread, TransferPool, lock},
    tcp::connection::{ConnectedNotify, ErrorNotify, SendCallback, TcpConnection},
};

/// Lifecycle observer for a [`TcpClient`]. All notifications are delivered
/// on the client's control thread, except the synchronous
/// `connection_disconnected(CallDisconnect)` emitted by
/// [`TcpClient::disconnect`].
pub trait TcpClientNotify: Send + Sync {
    /// A target came up (first connect or any successful reconnect).
    fn connection_connected(&self, _remote_addr: &str, _remote_port: u16) {}

    /// The connection failed and a reconnect is scheduled, or the user asked
    /// for the disconnect.
    fn connection_disconnected(&self, _remote_addr: &str, _remote_port: u16, _error: &Error) {}

    /// The target was given up: no retry policy, retries disabled, or the
    /// retry budget is exhausted.
    fn connection_dropped(&self, _remote_addr: &str, _remote_port: u16) {}
}

/// Per-target reconnection policy.
#[derive(Clone)]
pub struct ConnectionMeta {
    pub retry_when_connection_error: bool,
    pub retry_forever: bool,
    /// Retry budget; effective only when `retry_forever` is false.
    pub max_retry_cnt: u32,
    /// Seconds between attempts; 0 retries immediately.
    pub retry_interval_s: u32,
    /// Overrides the client-global parser factory for this target.
    pub assemble_creator: Option<AssembleCreator>,
}

impl Default for ConnectionMeta {
    fn default() -> Self {
        Self {
            retry_when_connection_error: true,
            retry_forever: false,
            max_retry_cnt: 3,
            retry_interval_s: 5,
            assemble_creator: None,
        }
    }
}

struct ConnectionMetaRuntime {
    meta: ConnectionMeta,
    current_retry: u32,
}

enum RetryDecision {
    Drop,
    Retry(u32),
}

struct ClientShared {
    control: IoThread,
    transfer: OnceLock<Arc<TransferPool>>,
    transfer_thread_count: AtomicU32,
    assemble_creator: Mutex<Option<AssembleCreator>>,
    notify: Mutex<Option<Arc<dyn TcpClientNotify>>>,
    /// Targets currently readable/writable. Subset of `all`.
    connected: Mutex<BTreeMap<Endpoint, Arc<TcpConnection>>>,
    /// Every connection issued for a target, connected or not.
    all: Mutex<BTreeMap<Endpoint, Arc<TcpConnection>>>,
    /// Reconnection policies; survive `disconnect`, removed by `forget`.
    metas: Mutex<BTreeMap<Endpoint, ConnectionMetaRuntime>>,
}

/// Outbound TCP facade maintaining a fleet of named server connections with
/// automatic reconnection.
///
/// Configure with the `set_*` builders, then drive it with
/// [`connect`](Self::connect) / [`send`](Self::send) /
/// [`broadcast`](Self::broadcast). All registry mutations happen on the
/// client's own control thread; socket I/O runs on the transfer pool.
pub struct TcpClient {
    shared: Arc<ClientShared>,
}

impl TcpClient {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ClientShared {
                control: IoThread::spawn("hawser-client-control"),
                transfer: OnceLock::new(),
                transfer_thread_count: AtomicU32::new(1),
                assemble_creator: Mutex::new(None),
                notify: Mutex::new(None),
                connected: Mutex::new(BTreeMap::new()),
                all: Mutex::new(BTreeMap::new()),
                metas: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Number of transfer threads; effective before the first connect.
    pub fn set_transfer_thread_count(self, count: u32) -> Self {
        self.shared.transfer_thread_count.store(count.max(1), Ordering::Relaxed);
        self
    }

    /// Client-global parser factory, invoked once per connect attempt.
    pub fn set_assemble_creator(self, creator: AssembleCreator) -> Self {
        *lock(&self.shared.assemble_creator) = Some(creator);
        self
    }

    pub fn set_notify(self, notify: Arc<dyn TcpClientNotify>) -> Self {
        *lock(&self.shared.notify) = Some(notify);
        self
    }

    /// Connects to `host:port` without a reconnection policy: the first
    /// failure drops the target.
    pub fn connect(&self, host: &str, port: u16) {
        let shared = self.shared.clone();
        let endpoint = Endpoint::new(host, port);
        self.shared.control.handle().post(move |_ctx| {
            ClientShared::connect_endpoint(&shared, endpoint);
        });
    }

    /// Connects to `host:port` and installs `meta` as its reconnection
    /// policy.
    pub fn connect_with_meta(&self, host: &str, port: u16, meta: ConnectionMeta) {
        let shared = self.shared.clone();
        let endpoint = Endpoint::new(host, port);
        self.shared.control.handle().post(move |_ctx| {
            let retry_possible =
                meta.retry_when_connection_error && (meta.retry_forever || meta.max_retry_cnt > 0);
            if retry_possible {
                lock(&shared.metas)
                    .insert(endpoint.clone(), ConnectionMetaRuntime { meta, current_retry: 0 });
            }
            ClientShared::connect_endpoint(&shared, endpoint);
        });
    }

    /// Closes the connection to `host:port`. The meta entry is left in
    /// place: `disconnect` is distinct from [`forget`](Self::forget).
    pub fn disconnect(&self, host: &str, port: u16) {
        if let Some(notify) = lock(&self.shared.notify).clone() {
            notify.connection_disconnected(host, port, &Error::CallDisconnect);
        }
        let shared = self.shared.clone();
        let endpoint = Endpoint::new(host, port);
        self.shared.control.handle().post(move |_ctx| {
            ClientShared::disconnect_endpoint(&shared, &endpoint);
        });
    }

    /// Removes the reconnection policy for `host:port`, so no future
    /// failure can schedule a reconnect.
    pub fn forget(&self, host: &str, port: u16) {
        let shared = self.shared.clone();
        let endpoint = Endpoint::new(host, port);
        self.shared.control.handle().post(move |_ctx| {
            lock(&shared.metas).remove(&endpoint);
        });
    }

    /// Sends `data` to a connected target. The completion fires exactly
    /// once: `NotConnected` when the target is not currently up,
    /// `SendQueueFull` on back-pressure, otherwise the write outcome.
    pub fn send(
        &self,
        host: &str,
        port: u16,
        data: Vec<u8>,
        callback: impl FnOnce(Result<(), Error>) + Send + 'static,
    ) {
        let shared = self.shared.clone();
        let endpoint = Endpoint::new(host, port);
        self.shared.control.handle().post(move |_ctx| {
            let conn = lock(&shared.connected).get(&endpoint).cloned();
            match conn {
                Some(conn) => conn.send(data, Box::new(callback)),
                None => callback(Err(Error::NotConnected)),
            }
        });
    }

    /// Sends `data` to every currently connected target. The completion is
    /// invoked once per target.
    pub fn broadcast(
        &self,
        data: Vec<u8>,
        callback: impl Fn(Result<(), Error>) + Send + Sync + 'static,
    ) {
        let shared = self.shared.clone();
        let callback = Arc::new(callback);
        self.shared.control.handle().post(move |_ctx| {
            let connected: Vec<Arc<TcpConnection>> =
                lock(&shared.connected).values().cloned().collect();
            for conn in connected {
                let callback = callback.clone();
                let boxed: SendCallback = Box::new(move |result| (*callback)(result));
                conn.send(data.clone(), boxed);
            }
        });
    }

    /// Stops both executors and drops every connection. Joins the threads;
    /// pending completions are not invoked past this point.
    pub fn stop(&self) {
        self.shared.control.stop();
        if let Some(pool) = self.shared.transfer.get() {
            pool.stop();
        }
        lock(&self.shared.connected).clear();
        lock(&self.shared.all).clear();
        lock(&self.shared.metas).clear();
    }
}

impl Default for TcpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.stop();
    }
}

impl ClientShared {
    fn transfer_pool(&self) -> &Arc<TransferPool> {
        self.transfer.get_or_init(|| {
            Arc::new(TransferPool::spawn(self.transfer_thread_count.load(Ordering::Relaxed)))
        })
    }

    fn notify(&self) -> Option<Arc<dyn TcpClientNotify>> {
        lock(&self.notify).clone()
    }

    /// Creates a fresh connection for `endpoint` and dispatches name
    /// resolution. Runs on the control thread, for both user connects and
    /// scheduled reconnects.
    fn connect_endpoint(shared: &Arc<Self>, endpoint: Endpoint) {
        let creator = lock(&shared.metas)
            .get(&endpoint)
            .and_then(|rt| rt.meta.assemble_creator.clone())
            .or_else(|| lock(&shared.assemble_creator).clone());
        let Some(creator) = creator else {
            error!(remote = %endpoint, "packet assemble creator not set, dropping connect");
            return;
        };

        let error_endpoint = endpoint.clone();
        let error_shared = Arc::downgrade(shared);
        let error_notify: ErrorNotify = Box::new(move |err: Error| {
            let Some(shared) = error_shared.upgrade() else { return };
            let endpoint = error_endpoint.clone();
            let task_shared = shared.clone();
            shared.control.handle().post(move |ctx| {
                Self::handle_connection_error(&task_shared, ctx, endpoint, err);
            });
        });

        let up_endpoint = endpoint.clone();
        let up_shared = Arc::downgrade(shared);
        let connected_notify: ConnectedNotify = Box::new(move |conn: &Arc<TcpConnection>| {
            let Some(shared) = up_shared.upgrade() else { return };
            let endpoint = up_endpoint.clone();
            let conn = conn.clone();
            let task_shared = shared.clone();
            shared.control.handle().post(move |_ctx| {
                Self::mark_connected(&task_shared, endpoint, conn);
            });
        });

        let conn = TcpConnection::new(
            shared.transfer_pool().assign(),
            endpoint.clone(),
            creator(),
            Some(error_notify),
            Some(connected_notify),
        );
        lock(&shared.all).insert(endpoint.clone(), conn.clone());

        // Name resolution blocks, so it must not run on an executor thread.
        // It gets a short-lived thread of its own; the outcome re-enters
        // through the regular connect and failure paths, which post back
        // onto the executors.
        let resolve_conn = conn.clone();
        let resolver = thread::Builder::new().name("hawser-resolve".to_string()).spawn(
            move || match endpoint.resolve() {
                Ok(addrs) => resolve_conn.start_connect(addrs),
                Err(err) => resolve_conn.handle_fail_connection(err.into()),
            },
        );
        if let Err(err) = resolver {
            error!(?err, "couldn't spawn resolver thread");
            conn.handle_fail_connection(err.into());
        }
    }

    fn mark_connected(shared: &Arc<Self>, endpoint: Endpoint, conn: Arc<TcpConnection>) {
        if let Some(rt) = lock(&shared.metas).get_mut(&endpoint) {
            rt.current_retry = 0;
        }
        lock(&shared.connected).insert(endpoint.clone(), conn);
        if let Some(notify) = shared.notify() {
            notify.connection_connected(&endpoint.host, endpoint.port);
        }
    }

    /// Reconnection policy, evaluated once per lifecycle failure: retry
    /// while the meta permits it (notifying `connection_disconnected` for
    /// each attempt that will follow), give the target up otherwise with a
    /// single `connection_dropped`.
    fn handle_connection_error(
        shared: &Arc<Self>,
        ctx: &mut IoCtx<'_>,
        endpoint: Endpoint,
        err: Error,
    ) {
        Self::disconnect_endpoint(shared, &endpoint);

        let decision = {
            let mut metas = lock(&shared.metas);
            match metas.get_mut(&endpoint) {
                None => RetryDecision::Drop,
                Some(rt) if !rt.meta.retry_when_connection_error => RetryDecision::Drop,
                Some(rt) if rt.meta.retry_forever => RetryDecision::Retry(rt.meta.retry_interval_s),
                Some(rt) if rt.current_retry < rt.meta.max_retry_cnt => {
                    rt.current_retry += 1;
                    RetryDecision::Retry(rt.meta.retry_interval_s)
                }
                Some(_) => RetryDecision::Drop,
            }
        };

        match decision {
            RetryDecision::Drop => {
                debug!(remote = %endpoint, %err, "drop connection");
                if let Some(notify) = shared.notify() {
                    notify.connection_dropped(&endpoint.host, endpoint.port);
                }
            }
            RetryDecision::Retry(interval_s) => {
                debug!(remote = %endpoint, %err, interval_s, "scheduling reconnect");
                if let Some(notify) = shared.notify() {
                    notify.connection_disconnected(&endpoint.host, endpoint.port, &err);
                }
                let task_shared = shared.clone();
                let at = Instant::now() + Duration::from_secs(interval_s as u64);
                ctx.schedule(
                    at,
                    Box::new(move |_ctx| Self::connect_endpoint(&task_shared, endpoint)),
                );
            }
        }
    }

    fn disconnect_endpoint(shared: &Arc<Self>, endpoint: &Endpoint) {
        if let Some(conn) = lock(&shared.connected).remove(endpoint) {
            conn.disconnect();
        }
        if let Some(conn) = lock(&shared.all).remove(endpoint) {
            conn.disconnect();
        }
    }
}
