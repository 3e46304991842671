use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use chrono_tz::Tz;
use futures::{Sink, SinkExt, stream};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::response::NotificationResponse;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::warn;

use crate::auth::SlotdAuthSource;
use crate::engine::{EngineError, NewBooking, parse_tz};
use crate::model::*;
use crate::notify::{Notice, parse_channel};
use crate::observability::{self as obs, command_label};
use crate::ratelimit::{CallerClass, Decision, fingerprint};
use crate::sql::{self, Command};
use crate::tenant::{Tenant, TenantManager};

/// Who is asking, resolved once per statement from the startup metadata.
struct Caller {
    tenant: Arc<Tenant>,
    class: CallerClass,
    fingerprint: String,
}

/// Per-connection handler. Holds this connection's LISTEN subscriptions.
pub struct SlotdHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SlotdQueryParser>,
    peer: String,
    listeners: Mutex<HashMap<String, broadcast::Receiver<Notice>>>,
}

impl SlotdHandler {
    pub fn new(tenant_manager: Arc<TenantManager>, peer: String) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SlotdQueryParser),
            peer,
            listeners: Mutex::new(HashMap::new()),
        }
    }

    fn resolve_caller<C: ClientInfo>(&self, client: &C) -> PgWireResult<Caller> {
        let metadata = client.metadata();
        let db = metadata
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        let user = metadata.get("user").map(String::as_str).unwrap_or("");
        let tenant = self
            .tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))?;
        Ok(Caller {
            tenant,
            class: CallerClass::from_user(user),
            fingerprint: fingerprint(&db, user, &self.peer),
        })
    }

    /// Rate gate, dispatch, metrics.
    async fn run(&self, caller: &Caller, cmd: Command) -> PgWireResult<Response> {
        let label = command_label(&cmd);
        let started = Instant::now();
        let (result, status) = match self.admit(caller, &cmd, label) {
            Ok(()) => {
                let result = self.execute_command(caller, cmd).await;
                let status = if result.is_ok() { "ok" } else { "error" };
                (result, status)
            }
            Err(e) => (Err(e), "rate_limited"),
        };
        metrics::counter!(obs::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(obs::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    /// Every statement counts against the caller's window except the
    /// rate-limit peek itself and keepalives.
    fn admit(&self, caller: &Caller, cmd: &Command, label: &str) -> PgWireResult<()> {
        if matches!(cmd, Command::SelectRateLimit { .. } | Command::Ping) {
            return Ok(());
        }
        let decision = self
            .tenant_manager
            .limiter()
            .check(caller.class, &caller.fingerprint, label);
        if decision.allowed {
            return Ok(());
        }
        metrics::counter!(obs::RATE_LIMITED_TOTAL, "class" => caller.class.as_str()).increment(1);
        Err(engine_err(EngineError::RateLimited {
            retry_after_ms: decision.reset_in_ms,
        }))
    }

    async fn execute_command(&self, caller: &Caller, cmd: Command) -> PgWireResult<Response> {
        if !permitted(caller.class, &cmd) {
            return Err(user_error(
                "42501",
                format!(
                    "{} is not allowed for {} callers",
                    command_label(&cmd),
                    caller.class.as_str()
                ),
            ));
        }
        let engine = &caller.tenant.engine;
        match cmd {
            Command::UpsertProfile(profile) => {
                engine.upsert_profile(profile).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertEventType(event_type) => {
                engine.create_event_type(event_type).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateEventType(event_type) => {
                engine.update_event_type(event_type).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertBooking {
                host_id,
                event_type,
                span,
                guest,
                timezone,
                source,
            } => {
                let receipt = engine
                    .create_booking(NewBooking {
                        host_id,
                        event_type,
                        span,
                        guest,
                        timezone,
                        source: source.unwrap_or_else(|| default_source(caller.class)),
                    })
                    .await
                    .map_err(engine_err)?;
                receipt_response(&receipt)
            }
            Command::Reschedule {
                booking_id,
                token,
                span,
            } => {
                let receipt = engine
                    .reschedule_booking(booking_id, &token, span)
                    .await
                    .map_err(engine_err)?;
                receipt_response(&receipt)
            }
            Command::CancelBooking { booking_id, token } => {
                engine
                    .cancel_booking(booking_id, &token)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::ConfirmBooking { booking_id } => {
                engine.confirm_booking(booking_id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SelectAvailability(req) => {
                let host_id = req.host_id.to_string();
                let avail = engine.compute_availability(&req).await.map_err(engine_err)?;
                let tz = parse_tz(&avail.timezone).map_err(engine_err)?;
                let unknown = (!avail.unknown_sources.is_empty())
                    .then(|| avail.unknown_sources.join(","));

                let schema = Arc::new(availability_schema());
                let rows: Vec<PgWireResult<_>> = avail
                    .slots
                    .iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&host_id)?;
                        encoder.encode_field(&slot.start)?;
                        encoder.encode_field(&slot.end)?;
                        encoder.encode_field(&local_time(slot.start, tz))?;
                        encoder.encode_field(&local_time(slot.end, tz))?;
                        encoder.encode_field(&unknown)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectBookings {
                host_id,
                active_only,
            } => {
                let bookings = engine.list_bookings(&host_id, active_only).await;
                booking_rows(&bookings)
            }
            Command::SelectBooking { id } => {
                let booking = engine.get_booking(&id).await.map_err(engine_err)?;
                booking_rows(std::slice::from_ref(&booking))
            }
            Command::SelectEventTypes { host_id } => {
                let schema = Arc::new(event_type_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .list_event_types(&host_id)
                    .iter()
                    .map(|et| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&et.id.to_string())?;
                        encoder.encode_field(&et.host_id.to_string())?;
                        encoder.encode_field(&et.slug)?;
                        encoder.encode_field(&et.title)?;
                        encoder.encode_field(&et.duration_minutes.map(i64::from))?;
                        encoder.encode_field(&et.buffer_minutes.map(i64::from))?;
                        encoder.encode_field(&et.min_notice_minutes.map(i64::from))?;
                        encoder.encode_field(&et.working_hours.as_ref().map(WorkingHours::to_json))?;
                        encoder.encode_field(&et.requires_confirmation)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectProfile { host_id } => {
                let p = engine.get_profile(&host_id).map_err(engine_err)?;
                let schema = Arc::new(profile_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&p.host_id.to_string())?;
                encoder.encode_field(&p.timezone)?;
                encoder.encode_field(&p.working_hours.to_json())?;
                encoder.encode_field(&i64::from(p.slot_minutes))?;
                encoder.encode_field(&i64::from(p.buffer_minutes))?;
                encoder.encode_field(&i64::from(p.min_notice_minutes))?;
                encoder.encode_field(&p.calendars.join(","))?;
                let reminders: Vec<String> = p.reminders.iter().map(u32::to_string).collect();
                encoder.encode_field(&reminders.join(","))?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectRateLimit { endpoint } => {
                let decision = self
                    .tenant_manager
                    .limiter()
                    .peek(caller.class, &caller.fingerprint, &endpoint);
                rate_limit_response(&endpoint, caller.class, &decision)
            }
            Command::Listen { channel } => {
                let host_id = parse_channel(&channel).ok_or_else(|| {
                    user_error(
                        "42000",
                        format!("invalid channel: {channel} (expected host_{{id}})"),
                    )
                })?;
                if let Ok(mut listeners) = self.listeners.lock() {
                    listeners
                        .entry(channel)
                        .or_insert_with(|| caller.tenant.notify.subscribe(host_id));
                }
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
            Command::Unlisten { channel } => {
                if let Ok(mut listeners) = self.listeners.lock() {
                    listeners.remove(&channel);
                }
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
            Command::UnlistenAll => {
                if let Ok(mut listeners) = self.listeners.lock() {
                    listeners.clear();
                }
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
            Command::Ping => {
                let schema = Arc::new(vec![int8_field("ok")]);
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&1i64)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }

    /// Everything queued on this connection's channels since the last statement.
    fn drain_notices(&self) -> Vec<(String, String)> {
        let Ok(mut listeners) = self.listeners.lock() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        listeners.retain(|channel, rx| loop {
            match rx.try_recv() {
                Ok(notice) => out.push((channel.clone(), notice.payload)),
                Err(TryRecvError::Empty) => break true,
                Err(TryRecvError::Lagged(missed)) => {
                    warn!(channel = %channel, missed, "listener fell behind, notices dropped");
                }
                Err(TryRecvError::Closed) => break false,
            }
        });
        out
    }

    /// Notices go out ahead of the statement's own response.
    async fn flush_notices<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        let pid = std::process::id() as i32;
        for (channel, payload) in self.drain_notices() {
            client
                .send(PgWireBackendMessage::NotificationResponse(
                    NotificationResponse::new(pid, channel, payload),
                ))
                .await?;
        }
        Ok(())
    }
}

/// Host configuration and guest records belong to the host's console.
/// Booking notices also go to automation acting for the host.
fn permitted(class: CallerClass, cmd: &Command) -> bool {
    match cmd {
        Command::UpsertProfile(_)
        | Command::InsertEventType(_)
        | Command::UpdateEventType(_)
        | Command::ConfirmBooking { .. }
        | Command::SelectBookings { .. }
        | Command::SelectBooking { .. } => class == CallerClass::Console,
        Command::Listen { .. } => matches!(class, CallerClass::Console | CallerClass::Automation),
        _ => true,
    }
}

fn default_source(class: CallerClass) -> BookingSource {
    match class {
        CallerClass::Automation => BookingSource::AutomatedAgent,
        CallerClass::Console => BookingSource::Direct,
        CallerClass::Anonymous => BookingSource::PublicLink,
    }
}

fn local_time(ms: Ms, tz: Tz) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.with_timezone(&tz).to_rfc3339())
        .unwrap_or_default()
}

// ── Result schemas ───────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn bool_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::BOOL, FieldFormat::Text)
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("host_id"),
        int8_field("start"),
        int8_field("end"),
        text_field("start_local"),
        text_field("end_local"),
        text_field("unknown_sources"),
    ]
}

fn receipt_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("host_id"),
        text_field("status"),
        int8_field("start"),
        int8_field("end"),
        text_field("timezone"),
        int8_field("reschedule_count"),
        text_field("mirror_status"),
        text_field("cancel_token"),
        text_field("reschedule_token"),
    ]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("host_id"),
        text_field("event_type_id"),
        text_field("status"),
        int8_field("start"),
        int8_field("end"),
        text_field("timezone"),
        text_field("guest_name"),
        text_field("guest_email"),
        text_field("guest_phone"),
        text_field("source"),
        int8_field("reschedule_count"),
        text_field("mirror_status"),
        text_field("external_event_id"),
        int8_field("created_at"),
        int8_field("canceled_at"),
    ]
}

fn event_type_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("host_id"),
        text_field("slug"),
        text_field("title"),
        int8_field("duration_minutes"),
        int8_field("buffer_minutes"),
        int8_field("min_notice_minutes"),
        text_field("working_hours"),
        bool_field("requires_confirmation"),
    ]
}

fn profile_schema() -> Vec<FieldInfo> {
    vec![
        text_field("host_id"),
        text_field("timezone"),
        text_field("working_hours"),
        int8_field("slot_minutes"),
        int8_field("buffer_minutes"),
        int8_field("min_notice_minutes"),
        text_field("calendars"),
        text_field("reminders"),
    ]
}

fn rate_limit_schema() -> Vec<FieldInfo> {
    vec![
        text_field("endpoint"),
        text_field("class"),
        int8_field("limit"),
        int8_field("remaining"),
        int8_field("reset_in_ms"),
        bool_field("allowed"),
    ]
}

/// Result columns a statement will produce, judged from its text alone so it
/// works on unbound statements during Describe.
fn schema_for(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_ascii_uppercase();
    if upper.starts_with("INSERT") {
        if upper.contains("INTO BOOKINGS") || upper.contains("INTO RESCHEDULES") {
            return receipt_schema();
        }
        return Vec::new();
    }
    if !upper.starts_with("SELECT") {
        return Vec::new();
    }
    if upper.contains("AVAILABILITY") {
        availability_schema()
    } else if upper.contains("EVENT_TYPES") {
        event_type_schema()
    } else if upper.contains("PROFILES") {
        profile_schema()
    } else if upper.contains("RATE_LIMIT") {
        rate_limit_schema()
    } else if upper.contains("BOOKINGS") {
        booking_schema()
    } else if !upper.contains(" FROM ") {
        vec![int8_field("ok")]
    } else {
        Vec::new()
    }
}

fn receipt_response(receipt: &BookingReceipt) -> PgWireResult<Response> {
    let b = &receipt.booking;
    let schema = Arc::new(receipt_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&b.host_id.to_string())?;
    encoder.encode_field(&b.status.as_str())?;
    encoder.encode_field(&b.span.start)?;
    encoder.encode_field(&b.span.end)?;
    encoder.encode_field(&b.timezone)?;
    encoder.encode_field(&i64::from(b.reschedule_count))?;
    encoder.encode_field(&b.mirror_status.as_str())?;
    encoder.encode_field(&receipt.cancel_token)?;
    encoder.encode_field(&receipt.reschedule_token)?;
    let rows = vec![Ok(encoder.take_row())];
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn booking_rows(bookings: &[Booking]) -> PgWireResult<Response> {
    let schema = Arc::new(booking_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.host_id.to_string())?;
            encoder.encode_field(&b.event_type_id.map(|id| id.to_string()))?;
            encoder.encode_field(&b.status.as_str())?;
            encoder.encode_field(&b.span.start)?;
            encoder.encode_field(&b.span.end)?;
            encoder.encode_field(&b.timezone)?;
            encoder.encode_field(&b.guest.name)?;
            encoder.encode_field(&b.guest.email)?;
            encoder.encode_field(&b.guest.phone)?;
            encoder.encode_field(&b.source.as_str())?;
            encoder.encode_field(&i64::from(b.reschedule_count))?;
            encoder.encode_field(&b.mirror_status.as_str())?;
            encoder.encode_field(&b.external_event_id)?;
            encoder.encode_field(&b.created_at)?;
            encoder.encode_field(&b.canceled_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn rate_limit_response(endpoint: &str, class: CallerClass, d: &Decision) -> PgWireResult<Response> {
    let schema = Arc::new(rate_limit_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&endpoint)?;
    encoder.encode_field(&class.as_str())?;
    encoder.encode_field(&(d.limit as i64))?;
    encoder.encode_field(&(d.remaining as i64))?;
    encoder.encode_field(&d.reset_in_ms)?;
    encoder.encode_field(&d.allowed)?;
    let rows = vec![Ok(encoder.take_row())];
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

#[async_trait]
impl SimpleQueryHandler for SlotdHandler {
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
        let caller = self.resolve_caller(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let result = self.run(&caller, cmd).await;
        self.flush_notices(client).await?;
        Ok(vec![result?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotdQueryParser;

#[async_trait]
impl QueryParser for SlotdQueryParser {
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
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotdHandler {
    type Statement = String;
    type QueryParser = SlotdQueryParser;

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
        let caller = self.resolve_caller(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let result = self.run(&caller, cmd).await;
        self.flush_notices(client).await?;
        result
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
            schema_for(&target.statement),
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
        Ok(DescribePortalResponse::new(schema_for(
            &target.statement.statement,
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
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
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

pub struct SlotdFactory {
    handler: Arc<SlotdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SlotdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotdFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String, peer: String) -> Self {
        let auth_source = SlotdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotdHandler::new(tenant_manager, peer)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotdFactory {
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

/// Serve one client connection until it closes. Each connection gets its own
/// handler so LISTEN subscriptions die with it.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let peer = socket
        .peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_default();
    let factory = SlotdFactory::new(tenant_manager, password, peer);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(e.sqlstate(), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_follows_statement() {
        assert_eq!(schema_for("SELECT * FROM availability WHERE host_id = $1").len(), 6);
        assert_eq!(schema_for("select * from bookings where id = $1").len(), 16);
        assert_eq!(schema_for("SELECT * FROM event_types WHERE host_id = $1").len(), 9);
        assert_eq!(
            schema_for(r#"INSERT INTO reschedules (booking_id, token, start, "end") VALUES ($1, $2, $3, $4)"#).len(),
            10
        );
        assert!(schema_for("INSERT INTO confirmations (booking_id) VALUES ($1)").is_empty());
        assert!(schema_for("DELETE FROM bookings WHERE id = $1 AND token = $2").is_empty());
        assert_eq!(schema_for("SELECT 1").len(), 1);
    }

    #[test]
    fn params_counted() {
        assert_eq!(count_params("SELECT * FROM bookings WHERE id = $1"), 1);
        assert_eq!(count_params("VALUES ($1, $12, $3)"), 12);
        assert_eq!(count_params("no params"), 0);
    }

    #[test]
    fn local_time_in_zone() {
        let tz: Tz = "America/New_York".parse().unwrap();
        assert_eq!(local_time(1_748_869_200_000, tz), "2025-06-02T09:00:00-04:00");
    }

    #[test]
    fn source_defaults_by_class() {
        assert_eq!(default_source(CallerClass::from_user("agent-7")), BookingSource::AutomatedAgent);
        assert_eq!(default_source(CallerClass::from_user("host_ada")), BookingSource::Direct);
        assert_eq!(default_source(CallerClass::from_user("guest")), BookingSource::PublicLink);
    }

    #[test]
    fn host_commands_need_console() {
        let confirm = Command::ConfirmBooking {
            booking_id: ulid::Ulid::new(),
        };
        let listen = Command::Listen {
            channel: format!("host_{}", ulid::Ulid::new()),
        };
        assert!(permitted(CallerClass::Console, &confirm));
        assert!(!permitted(CallerClass::Automation, &confirm));
        assert!(!permitted(CallerClass::Anonymous, &confirm));

        assert!(permitted(CallerClass::Console, &listen));
        assert!(permitted(CallerClass::Automation, &listen));
        assert!(!permitted(CallerClass::Anonymous, &listen));

        assert!(permitted(CallerClass::Anonymous, &Command::Ping));
    }
}
