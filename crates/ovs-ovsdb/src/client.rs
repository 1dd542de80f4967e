//! OVSDB JSON-RPC client
//!
//! One long-lived connection per client. A background receive loop owns the
//! read half of the transport: it completes pending calls, answers `echo`,
//! and fans `update` notifications out to registered handlers. Callers share
//! the write half and wait on a oneshot per request.

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::TableCache;
use crate::config::{ClientConfig, DatabaseModel};
use crate::error::{OvsdbError, Result};
use crate::handler::{HandlerId, HandlerRegistry, NotificationHandler};
use crate::mapper::Mapper;
use crate::operation::{decode_table_updates, MonitorRequest, Operation, OperationResult, TableUpdates};
use crate::protocol::{self, Message, MessageFramer, Request, Response};
use crate::schema::DatabaseSchema;
use crate::transport::{connect_any, BoxedReader, BoxedWriter, Endpoint};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Lifecycle of the client's connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What the receive loop does with a successful reply before handing it back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnReply {
    Return,
    /// Load a `monitor` snapshot into the cache before later updates are read
    LoadCache,
}

struct Pending {
    method: String,
    on_reply: OnReply,
    tx: oneshot::Sender<Result<Value>>,
}

/// One transport session. Replaced wholesale on reconnect.
struct Connection {
    epoch: u64,
    endpoint: Endpoint,
    writer: tokio::sync::Mutex<BoxedWriter>,
    pending: Mutex<HashMap<u64, Pending>>,
    /// Set once the handshake finished; only established sessions notify handlers
    established: AtomicBool,
    closed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    fn new(epoch: u64, endpoint: Endpoint, writer: BoxedWriter) -> Self {
        Self {
            epoch,
            endpoint,
            writer: tokio::sync::Mutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            established: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            reader: Mutex::new(None),
        }
    }

    async fn send<T: Serialize>(&self, message: &T) -> Result<()> {
        let bytes = protocol::encode(message)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    fn take_pending(&self, id: u64) -> Option<Pending> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    /// Wake every caller still waiting on this connection
    fn fail_pending(&self) {
        let drained: Vec<Pending> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, p)| p)
            .collect();
        for pending in drained {
            debug!("Failing pending '{}' call: connection closed", pending.method);
            let _ = pending.tx.send(Err(OvsdbError::Disconnected));
        }
    }

    fn abort_reader(&self) {
        if let Some(task) = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

struct ClientInner {
    config: ClientConfig,
    model: DatabaseModel,
    next_id: AtomicU64,
    epoch: AtomicU64,
    state: RwLock<ConnectionState>,
    connection: RwLock<Option<Arc<Connection>>>,
    schema: RwLock<Option<Arc<DatabaseSchema>>>,
    handlers: HandlerRegistry,
    cache: Arc<TableCache>,
    cache_handler: Mutex<Option<HandlerId>>,
    monitors: Mutex<BTreeSet<String>>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl ClientInner {
    fn set_state(&self, state: ConnectionState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn current(&self) -> Result<Arc<Connection>> {
        self.connection
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(OvsdbError::NotConnected)
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.call_with(method, params, OnReply::Return).await
    }

    async fn call_with(&self, method: &str, params: Value, on_reply: OnReply) -> Result<Value> {
        let conn = self.current()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        conn.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                Pending {
                    method: method.to_string(),
                    on_reply,
                    tx,
                },
            );
        // The receive loop may have drained the map between current() and insert
        if conn.closed.load(Ordering::SeqCst) {
            conn.take_pending(id);
            return Err(OvsdbError::Disconnected);
        }

        debug!("OVSDB request {} {}: {}", id, method, params);
        if let Err(e) = conn.send(&Request::new(method, params, id)).await {
            conn.take_pending(id);
            return Err(e);
        }

        match tokio::time::timeout(self.config.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(OvsdbError::Disconnected),
            Err(_) => {
                conn.take_pending(id);
                Err(OvsdbError::Timeout(method.to_string()))
            }
        }
    }

    async fn dispatch(&self, conn: &Connection, value: Value) {
        match Message::parse(value) {
            Ok(Message::Response(response)) => self.complete(conn, response),
            Ok(Message::Request(request)) => self.handle_request(conn, request).await,
            Err(e) => warn!("Dropping undecodable OVSDB message: {}", e),
        }
    }

    fn complete(&self, conn: &Connection, response: Response) {
        let Some(id) = response.id.as_u64() else {
            warn!("OVSDB reply with unexpected id {}", response.id);
            return;
        };
        let Some(pending) = conn.take_pending(id) else {
            warn!("OVSDB reply {} matches no pending call", id);
            return;
        };
        debug!("OVSDB reply {} {}", id, pending.method);
        let result = if response.is_error() {
            Err(OvsdbError::Rpc {
                method: pending.method,
                error: response.error,
            })
        } else {
            match pending.on_reply {
                OnReply::Return => Ok(response.result),
                OnReply::LoadCache => self.load_snapshot(response.result),
            }
        };
        let _ = pending.tx.send(result);
    }

    /// Runs on the receive loop, so no update read after the reply can be
    /// overwritten by the snapshot
    fn load_snapshot(&self, result: Value) -> Result<Value> {
        let schema = self
            .schema
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(OvsdbError::NotConnected)?;
        let initial = decode_table_updates(&schema, &result)?;
        self.cache.apply(&initial);
        Ok(result)
    }

    async fn handle_request(&self, conn: &Connection, request: Request) {
        match request.method.as_str() {
            "echo" => {
                if !request.is_notification() {
                    let reply = Response::success(request.id.clone(), request.params.clone());
                    if let Err(e) = conn.send(&reply).await {
                        warn!("Failed to answer OVSDB echo: {}", e);
                    }
                }
                for handler in self.handlers.snapshot() {
                    handler.echo();
                }
            }
            "update" => self.handle_update(&request.params),
            "locked" | "stolen" => debug!("Ignoring OVSDB {} notification", request.method),
            other => {
                warn!("Unsupported inbound OVSDB method '{}'", other);
                if !request.is_notification() {
                    let reply = Response::error(request.id, format!("unknown method: {}", other));
                    if let Err(e) = conn.send(&reply).await {
                        warn!("Failed to reject OVSDB request: {}", e);
                    }
                }
            }
        }
    }

    fn handle_update(&self, params: &Value) {
        let (context, payload) = match params.as_array().map(Vec::as_slice) {
            Some([context, payload]) => (context, payload),
            _ => {
                warn!("Malformed OVSDB update params: {}", params);
                return;
            }
        };
        let Some(schema) = self.schema.read().unwrap_or_else(PoisonError::into_inner).clone() else {
            warn!("Dropping OVSDB update received before schema");
            return;
        };
        let updates = match decode_table_updates(&schema, payload) {
            Ok(updates) => updates,
            Err(e) => {
                warn!("Dropping undecodable OVSDB update for {}: {}", context, e);
                return;
            }
        };
        for handler in self.handlers.snapshot() {
            handler.update(context, &updates);
        }
    }

    /// Runs at most once per connection
    fn handle_disconnect(&self, conn: &Arc<Connection>) {
        if conn.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        conn.fail_pending();
        {
            let mut current = self.connection.write().unwrap_or_else(PoisonError::into_inner);
            if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, conn)) {
                *current = None;
                self.set_state(ConnectionState::Disconnected);
                self.monitors
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clear();
            }
        }
        if conn.established.load(Ordering::SeqCst) {
            info!("Disconnected from OVSDB at {} (session {})", conn.endpoint, conn.epoch);
            for handler in self.handlers.snapshot() {
                handler.disconnected();
            }
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(conn) = self
            .connection
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            conn.abort_reader();
        }
    }
}

async fn receive_loop(client: Weak<ClientInner>, conn: Arc<Connection>, mut reader: BoxedReader) {
    let mut framer = MessageFramer::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    'read: loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("OVSDB connection closed by peer");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                warn!("OVSDB read failed: {}", e);
                break;
            }
        };
        framer.push(&buf[..n]);
        loop {
            match framer.next_message() {
                Ok(Some(value)) => {
                    let Some(inner) = client.upgrade() else {
                        return;
                    };
                    inner.dispatch(&conn, value).await;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Malformed JSON from OVSDB, closing connection: {}", e);
                    break 'read;
                }
            }
        }
    }
    if let Some(inner) = client.upgrade() {
        inner.handle_disconnect(&conn);
    }
}

/// Check a `transact` reply against the submitted operations.
///
/// A failing operation is reported by index; an error past the last
/// operation means the commit itself was refused.
fn check_results(
    operations: &[Operation],
    results: Vec<Option<OperationResult>>,
) -> Result<Vec<OperationResult>> {
    for (index, result) in results.iter().enumerate() {
        let Some(OperationResult {
            error: Some(error),
            details,
            ..
        }) = result
        else {
            continue;
        };
        return Err(match operations.get(index) {
            Some(op) => OvsdbError::OperationFailed {
                index,
                op: op.op,
                table: op.table.clone(),
                error: error.clone(),
                details: details.clone(),
            },
            None => OvsdbError::CommitFailed {
                error: error.clone(),
                details: details.clone(),
            },
        });
    }
    if results.len() < operations.len() {
        return Err(OvsdbError::ResultCountMismatch {
            expected: operations.len(),
            actual: results.len(),
        });
    }
    Ok(results
        .into_iter()
        .take(operations.len())
        .map(Option::unwrap_or_default)
        .collect())
}

/// Handle to an OVSDB server connection. Cheap to clone.
#[derive(Clone)]
pub struct OvsdbClient {
    inner: Arc<ClientInner>,
}

impl OvsdbClient {
    /// Create a disconnected client
    pub fn new(config: ClientConfig, model: DatabaseModel) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                model,
                next_id: AtomicU64::new(1),
                epoch: AtomicU64::new(0),
                state: RwLock::new(ConnectionState::Disconnected),
                connection: RwLock::new(None),
                schema: RwLock::new(None),
                handlers: HandlerRegistry::default(),
                cache: Arc::new(TableCache::new()),
                cache_handler: Mutex::new(None),
                monitors: Mutex::new(BTreeSet::new()),
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Create and connect in one step
    pub async fn connect_with(config: ClientConfig, model: DatabaseModel) -> Result<Self> {
        let client = Self::new(config, model);
        client.connect().await?;
        Ok(client)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Endpoint of the live connection
    pub fn endpoint(&self) -> Option<String> {
        self.inner.current().ok().map(|c| c.endpoint.to_string())
    }

    /// Connect, or reconnect after a disconnect. Handler registrations survive;
    /// the cache is cleared.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.inner.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        self.inner.set_state(ConnectionState::Connecting);
        match self.establish().await {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Ok(conn) = self.inner.current() {
                    self.inner.handle_disconnect(&conn);
                    conn.abort_reader();
                }
                self.inner.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<()> {
        let config = &self.inner.config;
        let endpoints = Endpoint::parse_list(&config.endpoints)?;
        let (endpoint, reader, writer) =
            connect_any(&endpoints, config.tls.as_ref(), config.timeout).await?;

        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let conn = Arc::new(Connection::new(epoch, endpoint, writer));
        *self
            .inner
            .connection
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(conn.clone());
        let task = tokio::spawn(receive_loop(
            Arc::downgrade(&self.inner),
            conn.clone(),
            reader,
        ));
        *conn.reader.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);

        let dbs = self.list_dbs().await?;
        if !dbs.iter().any(|db| db == &config.database) {
            return Err(OvsdbError::DatabaseNotFound(config.database.clone()));
        }
        let schema = self.get_schema(&config.database).await?;
        self.inner.model.validate(&schema)?;
        info!(
            "OVSDB schema {} version {} loaded ({} tables)",
            schema.name,
            schema.version,
            schema.tables.len()
        );
        *self.inner.schema.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(schema));

        self.inner.cache.clear();
        {
            let mut cache_handler = self
                .inner
                .cache_handler
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if cache_handler.is_none() {
                let cache: Arc<dyn NotificationHandler> = self.inner.cache.clone();
                *cache_handler = Some(self.inner.handlers.register(cache));
            }
        }

        conn.established.store(true, Ordering::SeqCst);
        if conn.closed.load(Ordering::SeqCst) {
            return Err(OvsdbError::Disconnected);
        }
        self.inner.set_state(ConnectionState::Connected);
        info!("Connected to OVSDB at {} (database {})", conn.endpoint, config.database);
        Ok(())
    }

    /// Shut the connection down. Registered handlers see a disconnect.
    pub async fn close(&self) {
        let Ok(conn) = self.inner.current() else {
            return;
        };
        self.inner.handle_disconnect(&conn);
        conn.abort_reader();
        let _ = conn.writer.lock().await.shutdown().await;
    }

    /// Schema fetched by the last successful connect
    pub fn schema(&self) -> Result<Arc<DatabaseSchema>> {
        self.inner
            .schema
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(OvsdbError::NotConnected)
    }

    /// Mapper bound to the current schema
    pub fn mapper(&self) -> Result<Mapper> {
        Ok(Mapper::new(self.schema()?))
    }

    /// Local replica fed by monitors
    pub fn cache(&self) -> Arc<TableCache> {
        self.inner.cache.clone()
    }

    pub fn register(&self, handler: Arc<dyn NotificationHandler>) -> HandlerId {
        self.inner.handlers.register(handler)
    }

    pub fn unregister(&self, id: HandlerId) -> Result<()> {
        self.inner.handlers.unregister(id)
    }

    pub async fn list_dbs(&self) -> Result<Vec<String>> {
        let result = self.inner.call("list_dbs", json!([])).await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn get_schema(&self, database: &str) -> Result<DatabaseSchema> {
        let result = self.inner.call("get_schema", json!([database])).await?;
        DatabaseSchema::from_json(result)
    }

    /// Outbound keep-alive; the server returns `args` unchanged
    pub async fn echo(&self, args: Value) -> Result<Value> {
        self.inner.call("echo", args).await
    }

    /// Run `operations` as one atomic transaction.
    ///
    /// Operations are checked against the schema first; nothing is sent if
    /// any references an unknown table or column.
    pub async fn transact(&self, operations: Vec<Operation>) -> Result<Vec<OperationResult>> {
        let schema = self.schema()?;
        schema.validate_operations(&operations)?;

        let mut params = Vec::with_capacity(operations.len() + 1);
        params.push(Value::String(self.inner.config.database.clone()));
        for op in &operations {
            params.push(serde_json::to_value(op)?);
        }
        let result = self.inner.call("transact", Value::Array(params)).await?;
        let results: Vec<Option<OperationResult>> = serde_json::from_value(result)?;
        check_results(&operations, results)
    }

    /// Start a monitor and load its initial snapshot into the cache
    pub async fn monitor(
        &self,
        id: &str,
        requests: BTreeMap<String, MonitorRequest>,
    ) -> Result<TableUpdates> {
        let schema = self.schema()?;
        for (table, request) in &requests {
            let table_schema = schema.require_table(table)?;
            if let Some(column) = request.columns.iter().find(|c| !table_schema.has_column(c)) {
                return Err(OvsdbError::UnknownColumn {
                    table: table.clone(),
                    column: column.clone(),
                });
            }
        }
        let params = json!([self.inner.config.database, id, requests]);
        let result = self
            .inner
            .call_with("monitor", params, OnReply::LoadCache)
            .await?;
        let initial = decode_table_updates(&schema, &result)?;
        self.inner
            .monitors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_string());
        debug!("Monitor '{}' established on {} tables", id, requests.len());
        Ok(initial)
    }

    /// Monitor every table of the model with the model's columns
    pub async fn monitor_all(&self, id: &str) -> Result<TableUpdates> {
        let requests = self
            .inner
            .model
            .tables()
            .map(|table| {
                let columns = self
                    .inner
                    .model
                    .columns(table)
                    .unwrap_or_default()
                    .iter()
                    .filter(|c| c.as_str() != "_uuid")
                    .cloned()
                    .collect();
                (table.to_string(), MonitorRequest::new(columns))
            })
            .collect();
        self.monitor(id, requests).await
    }

    pub async fn monitor_cancel(&self, id: &str) -> Result<()> {
        if !self
            .inner
            .monitors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
        {
            return Err(OvsdbError::UnknownMonitor(id.to_string()));
        }
        self.inner.call("monitor_cancel", json!([id])).await?;
        self.inner
            .monitors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationKind;

    fn ops() -> Vec<Operation> {
        vec![
            Operation::insert("Interface", Default::default()),
            Operation::insert("Port", Default::default()),
        ]
    }

    fn ok() -> Option<OperationResult> {
        Some(OperationResult::default())
    }

    fn failed(error: &str) -> Option<OperationResult> {
        Some(OperationResult {
            error: Some(error.to_string()),
            ..Default::default()
        })
    }

    #[test]
    fn test_results_ok() {
        let results = check_results(&ops(), vec![ok(), ok()]).unwrap();
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn test_operation_error_names_table() {
        let err = check_results(&ops(), vec![ok(), failed("constraint violation"), None]).unwrap_err();
        match err {
            OvsdbError::OperationFailed { index, op, table, .. } => {
                assert_eq!(index, 1);
                assert_eq!(op, OperationKind::Insert);
                assert_eq!(table, "Port");
            }
            other => panic!("unexpected {}", other),
        }
    }

    #[test]
    fn test_trailing_error_is_commit_failure() {
        let err = check_results(&ops(), vec![ok(), ok(), failed("referential integrity violation")])
            .unwrap_err();
        assert!(matches!(err, OvsdbError::CommitFailed { .. }));
    }

    #[test]
    fn test_short_reply() {
        let err = check_results(&ops(), vec![ok()]).unwrap_err();
        assert!(matches!(
            err,
            OvsdbError::ResultCountMismatch { expected: 2, actual: 1 }
        ));
    }

    #[tokio::test]
    async fn test_calls_before_connect() {
        let client = OvsdbClient::new(ClientConfig::default(), DatabaseModel::new());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(matches!(client.list_dbs().await, Err(OvsdbError::NotConnected)));
        assert!(matches!(client.transact(ops()).await, Err(OvsdbError::NotConnected)));
        assert!(matches!(
            client.monitor_cancel("m").await,
            Err(OvsdbError::UnknownMonitor(_))
        ));
    }
}
