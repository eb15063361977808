use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::{Sink, SinkExt};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::auth::BlockoutAuthSource;
use crate::engine::{BridgeError, Engine, EngineError, SlotOptions};
use crate::model::*;
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

/// Query handler for one connection. `process_connection` builds a fresh
/// one per socket, so LISTEN state is session-scoped.
pub struct BlockoutHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<BlockoutQueryParser>,
    /// Channels this session LISTENs on, keyed by channel name. Payloads
    /// queue in the broadcast receivers and go out as NotificationResponse
    /// frames at the start of the next query, the only point where the
    /// handler holds the socket.
    subscriptions: Mutex<HashMap<String, broadcast::Receiver<String>>>,
}

impl BlockoutHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(BlockoutQueryParser),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Flush queued notifications to the client before answering a query.
    async fn drain_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let mut subs = self.subscriptions.lock().await;
        let mut sent = false;
        for (channel, rx) in subs.iter_mut() {
            loop {
                match rx.try_recv() {
                    Ok(payload) => {
                        // pid 0: sessions have no backend process id.
                        client
                            .feed(PgWireBackendMessage::NotificationResponse(
                                NotificationResponse::new(0, channel.clone(), payload),
                            ))
                            .await?;
                        sent = true;
                    }
                    Err(TryRecvError::Lagged(missed)) => {
                        tracing::warn!(%channel, missed, "notification receiver lagged");
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                }
            }
        }
        if sent {
            client.flush().await?;
        }
        Ok(())
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// Mutations are attributed to the session user.
    fn caller_for<C: ClientInfo>(client: &C) -> CallerId {
        CallerId::new(
            client
                .metadata()
                .get("user")
                .cloned()
                .unwrap_or_else(|| "anonymous".to_string()),
        )
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        cmd: Command,
        caller: &CallerId,
        format: &Format,
    ) -> PgWireResult<Vec<Response>> {
        let label = crate::observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.dispatch_command(engine, cmd, caller, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(
            crate::observability::QUERIES_TOTAL,
            "command" => label,
            "status" => status
        )
        .increment(1);
        metrics::histogram!(
            crate::observability::QUERY_DURATION_SECONDS,
            "command" => label
        )
        .record(started.elapsed().as_secs_f64());
        result
    }

    /// Mutations on `blocks` return the written row, as if `RETURNING *`
    /// were always present; ids are server-generated so the client has no
    /// other way to learn them.
    async fn dispatch_command(
        &self,
        engine: &Engine,
        cmd: Command,
        caller: &CallerId,
        format: &Format,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertBlock {
                resource_id,
                span,
                reason,
                notes,
            } => {
                let block = engine
                    .create_block(resource_id, span, reason, notes, caller)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![block_row_response(&block, format)?])
            }
            Command::UpdateBlock { id, patch } => {
                let block = engine
                    .update_block(id, patch, caller)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![block_row_response(&block, format)?])
            }
            Command::DeleteBlock { id } => {
                let removed = engine.delete_block(id, caller).await.map_err(engine_err)?;
                let rows = if removed { 1 } else { 0 };
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(rows))])
            }
            Command::InsertBooking {
                booking_ref,
                resource_id,
                span,
            } => {
                let block = engine
                    .on_booking_confirmed(booking_ref, resource_id, span)
                    .await
                    .map_err(bridge_err)?;
                Ok(vec![block_row_response(&block, format)?])
            }
            Command::DeleteBooking { booking_ref } => {
                let removed = engine
                    .on_booking_cancelled(booking_ref)
                    .await
                    .map_err(bridge_err)?;
                Ok(vec![Response::Execution(
                    Tag::new("DELETE").with_rows(removed),
                )])
            }
            Command::SelectBlocks {
                resource_id,
                range_start,
                range_end,
            } => {
                let blocks = engine
                    .list_blocks(resource_id, range_start, range_end)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![blocks_response(&blocks, format)?])
            }
            Command::SelectBookingBlocks { booking_ref } => {
                let blocks = engine.blocks_for_booking(booking_ref).await;
                Ok(vec![blocks_response(&blocks, format)?])
            }
            Command::SelectAvailability {
                resource_id,
                window,
            } => {
                let days = engine
                    .day_availability(resource_id, window)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(availability_schema(format));
                let rid_str = resource_id.to_string();
                let rows: Vec<PgWireResult<DataRow>> = days
                    .map(|day| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&rid_str)?;
                        encoder.encode_field(&day.date.to_string())?;
                        encoder.encode_field(&day.available)?;
                        Ok(encoder.take_row())
                    })
                    .collect();

                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectFree { resource_id, span } => {
                let free = engine
                    .is_range_free(resource_id, span)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(free_schema(format));
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&free)?;
                let rows = vec![Ok(encoder.take_row())];

                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectFreeRanges {
                resource_id,
                window,
                min_duration,
            } => {
                let ranges = engine
                    .free_ranges(resource_id, window, min_duration)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(free_ranges_schema(format));
                let rid_str = resource_id.to_string();
                let rows: Vec<PgWireResult<DataRow>> = ranges
                    .into_iter()
                    .map(|span| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&rid_str)?;
                        encoder.encode_field(&span.start)?;
                        encoder.encode_field(&span.end)?;
                        Ok(encoder.take_row())
                    })
                    .collect();

                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectSlots {
                resource_id,
                date,
                slot_minutes,
                open_hour,
                close_hour,
            } => {
                let mut opts = SlotOptions::default();
                if let Some(m) = slot_minutes {
                    opts.slot_minutes = m;
                }
                if let Some(h) = open_hour {
                    opts.open_hour = h;
                }
                if let Some(h) = close_hour {
                    opts.close_hour = h;
                }
                let slots = engine
                    .slots_for_day(resource_id, date, opts)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(slots_schema(format));
                let rid_str = resource_id.to_string();
                let rows: Vec<PgWireResult<DataRow>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&rid_str)?;
                        encoder.encode_field(&slot.span.start)?;
                        encoder.encode_field(&slot.span.end)?;
                        encoder.encode_field(&slot.available)?;
                        Ok(encoder.take_row())
                    })
                    .collect();

                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::Listen { channel } => {
                let resource_id_str = channel.strip_prefix("resource_").ok_or_else(|| {
                    PgWireError::UserError(Box::new(ErrorInfo::new(
                        "ERROR".into(),
                        "42000".into(),
                        format!("invalid channel: {channel} (expected resource_{{id}})"),
                    )))
                })?;
                let resource_id = Ulid::from_string(resource_id_str).map_err(|e| {
                    PgWireError::UserError(Box::new(ErrorInfo::new(
                        "ERROR".into(),
                        "42000".into(),
                        format!("bad ULID in channel: {e}"),
                    )))
                })?;
                let mut subs = self.subscriptions.lock().await;
                // Repeated LISTEN keeps the existing receiver so each event
                // is delivered once per session.
                subs.entry(channel)
                    .or_insert_with(|| engine.notify.subscribe(resource_id));
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                let mut subs = self.subscriptions.lock().await;
                match channel {
                    Some(name) => {
                        subs.remove(&name);
                    }
                    None => subs.clear(),
                }
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
        }
    }
}

// ── Row schemas ──────────────────────────────────────────────────

/// Field formats follow what the client asked for in Bind; the simple
/// protocol always reads as text.
fn fields(format: &Format, cols: &[(&str, Type)]) -> Vec<FieldInfo> {
    cols.iter()
        .enumerate()
        .map(|(idx, (name, ty))| {
            FieldInfo::new(
                (*name).to_string(),
                None,
                None,
                ty.clone(),
                format.format_for(idx),
            )
        })
        .collect()
}

fn block_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        format,
        &[
            ("id", Type::VARCHAR),
            ("resource_id", Type::VARCHAR),
            ("start", Type::INT8),
            ("end", Type::INT8),
            ("reason", Type::VARCHAR),
            ("booking_ref", Type::VARCHAR),
            ("notes", Type::VARCHAR),
            ("created_at", Type::INT8),
            ("updated_at", Type::INT8),
        ],
    )
}

fn availability_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        format,
        &[
            ("resource_id", Type::VARCHAR),
            ("day", Type::VARCHAR),
            ("available", Type::BOOL),
        ],
    )
}

fn free_schema(format: &Format) -> Vec<FieldInfo> {
    fields(format, &[("free", Type::BOOL)])
}

fn free_ranges_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        format,
        &[
            ("resource_id", Type::VARCHAR),
            ("start", Type::INT8),
            ("end", Type::INT8),
        ],
    )
}

fn slots_schema(format: &Format) -> Vec<FieldInfo> {
    fields(
        format,
        &[
            ("resource_id", Type::VARCHAR),
            ("start", Type::INT8),
            ("end", Type::INT8),
            ("available", Type::BOOL),
        ],
    )
}

fn encode_block_row(schema: &Arc<Vec<FieldInfo>>, b: &Block) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&b.resource_id.to_string())?;
    encoder.encode_field(&b.span.start)?;
    encoder.encode_field(&b.span.end)?;
    encoder.encode_field(&b.reason.as_str())?;
    encoder.encode_field(&b.booking_ref.map(|u| u.to_string()))?;
    encoder.encode_field(&b.notes)?;
    encoder.encode_field(&b.created_at)?;
    encoder.encode_field(&b.updated_at)?;
    Ok(encoder.take_row())
}

fn block_row_response(block: &Block, format: &Format) -> PgWireResult<Response> {
    let schema = Arc::new(block_schema(format));
    let rows = vec![encode_block_row(&schema, block)];
    Ok(Response::Query(QueryResponse::new(
        schema,
        stream::iter(rows),
    )))
}

fn blocks_response(blocks: &[Block], format: &Format) -> PgWireResult<Response> {
    let schema = Arc::new(block_schema(format));
    let rows: Vec<PgWireResult<DataRow>> = blocks
        .iter()
        .map(|b| encode_block_row(&schema, b))
        .collect();
    Ok(Response::Query(QueryResponse::new(
        schema,
        stream::iter(rows),
    )))
}

#[async_trait]
impl SimpleQueryHandler for BlockoutHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.drain_notifications(client).await?;
        let engine = self.resolve_engine(client)?;
        let caller = Self::caller_for(client);
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.execute_command(&engine, cmd, &caller, &Format::UnifiedText)
            .await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct BlockoutQueryParser;

#[async_trait]
impl QueryParser for BlockoutQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema_for(
            stmt,
            column_format.unwrap_or(&Format::UnifiedText),
        ))
    }
}

/// Describe responses are driven off the statement text; the pseudo-table
/// name decides the row shape.
fn result_schema_for(sql: &str, format: &Format) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    let is_delete = upper.trim_start().starts_with("DELETE");
    if upper.contains("FREE_RANGES") {
        free_ranges_schema(format)
    } else if upper.contains("AVAILABILITY") {
        availability_schema(format)
    } else if upper.contains("SLOTS") {
        slots_schema(format)
    } else if upper.contains("FREE") {
        free_schema(format)
    } else if (upper.contains("BLOCKS") || upper.contains("BOOKINGS")) && !is_delete {
        block_schema(format)
    } else {
        vec![]
    }
}

#[async_trait]
impl ExtendedQueryHandler for BlockoutHandler {
    type Statement = String;
    type QueryParser = BlockoutQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.drain_notifications(client).await?;
        let engine = self.resolve_engine(client)?;
        let caller = Self::caller_for(client);
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self
            .execute_command(&engine, cmd, &caller, &portal.result_column_format)
            .await?;
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema_for(&target.statement, &Format::UnifiedText),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema_for(
            &target.statement.statement,
            &target.result_column_format,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start {
                if let Ok(n) = sql[start..i].parse::<usize>() {
                    if n > max {
                        max = n;
                    }
                }
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let sql = portal.statement.statement.to_string();
    let params = &portal.parameters;
    let mut result = sql;

    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }

    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct BlockoutFactory {
    handler: Arc<BlockoutHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<BlockoutAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl BlockoutFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = BlockoutAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(BlockoutHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for BlockoutFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection through the pgwire protocol state machine.
pub async fn process_connection(
    socket: tokio::net::TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls_acceptor: Option<pgwire::tokio::TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(BlockoutFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls_acceptor, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

/// Engine failures carry their own SQLSTATE class; conflicts surface as
/// exclusion violations so client retry logic can key off 23P01.
fn engine_err(e: EngineError) -> PgWireError {
    let code = match &e {
        EngineError::Validation(_) => "22023",
        EngineError::Conflict(_) => "23P01",
        EngineError::NotFound(_) => "P0002",
        EngineError::BookingOwned(_) => "55000",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}

fn bridge_err(e: BridgeError) -> PgWireError {
    match e {
        BridgeError::Rejected(inner) => engine_err(inner),
        BridgeError::Storage(msg) => PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "58030".into(),
            msg,
        ))),
    }
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
