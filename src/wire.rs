use std::fmt::Debug;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{stream, Sink, SinkExt};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::process_socket;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{broadcast, Mutex};
use tracing::{error, warn};

use crate::auth::{Credentials, FutbolflexAuthSource};
use crate::engine::{Engine, EngineError, ErrorClass};
use crate::limits::MAX_LISTEN_CHANNELS;
use crate::model::*;
use crate::notify::FIELDS_CHANNEL;
use crate::observability::{self, command_label};
use crate::sql::{self, Command};

/// Backend pid reported in notifications. Unique per connection.
static NEXT_PID: AtomicI32 = AtomicI32::new(1);

type Subscription = (String, broadcast::Receiver<CatalogEvent>);

pub struct FutbolflexHandler {
    engine: Arc<Engine>,
    credentials: Arc<Credentials>,
    query_parser: Arc<FutbolflexQueryParser>,
    pid: i32,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl FutbolflexHandler {
    pub fn new(engine: Arc<Engine>, credentials: Arc<Credentials>) -> Self {
        Self {
            engine,
            credentials,
            query_parser: Arc::new(FutbolflexQueryParser),
            pid: NEXT_PID.fetch_add(1, Ordering::Relaxed),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    fn is_admin<C: ClientInfo>(&self, client: &C) -> bool {
        let user = client.metadata().get("user").map(String::as_str);
        self.credentials.is_admin(user)
    }

    /// Push pending catalog events to the client ahead of the statement's own response.
    async fn deliver_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let mut pending = Vec::new();
        {
            let mut subs = self.subscriptions.lock().await;
            let before = subs.len();
            subs.retain_mut(|(channel, rx)| loop {
                match rx.try_recv() {
                    Ok(event) => pending.push((channel.clone(), event)),
                    Err(TryRecvError::Empty) => return true,
                    Err(TryRecvError::Lagged(skipped)) => {
                        warn!(channel = %channel, skipped, "listener fell behind, events dropped");
                    }
                    Err(TryRecvError::Closed) => return false,
                }
            });
            let closed = before - subs.len();
            if closed > 0 {
                metrics::gauge!(observability::CATALOG_LISTENERS).decrement(closed as f64);
            }
        }

        for (channel, event) in pending {
            let notification = NotificationResponse::new(self.pid, channel, event.to_json());
            client
                .send(PgWireBackendMessage::NotificationResponse(notification))
                .await?;
        }
        Ok(())
    }

    async fn run<C>(&self, client: &mut C, query: &str) -> PgWireResult<Response>
    where
        C: ClientInfo + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.deliver_notifications(client).await?;

        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        if cmd.requires_admin() && !self.is_admin(client) {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => "denied").increment(1);
            return Err(user_error("42501", format!("permission denied: {label} requires the admin login")));
        }

        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::RegisterUser(req) => {
                engine.register_user(req).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::Authenticate { email, password } => {
                let user = engine.authenticate(&email, &password).await.map_err(|e| {
                    if matches!(e, EngineError::InvalidCredentials) {
                        metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
                    }
                    engine_err(e)
                })?;
                Ok(rows(users_schema(), [user], encode_user))
            }
            Command::InsertField(req) => {
                engine.create_field(req).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateField { id, patch } => {
                engine.update_field(id, patch).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteField { id } => {
                engine.delete_field(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectFields { id } => {
                let fields = match id {
                    Some(id) => vec![engine.get_field(id).await.map_err(engine_err)?],
                    None => engine.list_fields().await,
                };
                Ok(rows(fields_schema(), fields, encode_field))
            }
            Command::SelectAvailability { field_id, date } => {
                let grids = self.availability(field_id, date).await?;
                let slots = grids.iter().flat_map(|grid| {
                    grid.days
                        .iter()
                        .flat_map(move |day| day.slots.iter().map(move |slot| (grid, day.date, slot)))
                });
                Ok(rows(availability_schema(), slots, |encoder, (grid, date, slot)| {
                    encoder.encode_field(&grid.field_id.to_string())?;
                    encoder.encode_field(&grid.field_name)?;
                    encoder.encode_field(&format_date(date))?;
                    encoder.encode_field(&format_clock(slot.start_time))?;
                    encoder.encode_field(&slot.available)
                }))
            }
            Command::SelectAvailabilitySummary { field_id, date } => {
                let grids = self.availability(field_id, date).await?;
                let days = grids
                    .iter()
                    .flat_map(|grid| grid.days.iter().map(move |day| (grid, day)));
                Ok(rows(availability_summary_schema(), days, |encoder, (grid, day)| {
                    encoder.encode_field(&grid.field_id.to_string())?;
                    encoder.encode_field(&grid.field_name)?;
                    encoder.encode_field(&format_date(day.date))?;
                    encoder.encode_field(&(day.available_count as i64))
                }))
            }
            Command::InsertReservation(req) => {
                engine.create_reservation(req).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::CancelReservation { id, user_id } => {
                engine.cancel_reservation(id, user_id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::SelectReservations { user_id } => {
                let listing = match user_id {
                    Some(user_id) => engine.user_reservations(user_id).await,
                    None => engine.all_reservations().await,
                };
                Ok(rows(reservations_schema(), listing, encode_reservation))
            }
            Command::InsertMessage(req) => {
                engine.post_message(req).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SelectMessages => Ok(rows(messages_schema(), engine.list_messages(), encode_message)),
            Command::DeleteMessage { id } => {
                engine.delete_message(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::Listen { channel } => {
                if channel != FIELDS_CHANNEL {
                    return Err(user_error(
                        "22023",
                        format!("unknown channel: {channel} (expected {FIELDS_CHANNEL})"),
                    ));
                }
                let mut subs = self.subscriptions.lock().await;
                if !subs.iter().any(|(c, _)| *c == channel) {
                    if subs.len() >= MAX_LISTEN_CHANNELS {
                        return Err(user_error("54000", "too many LISTEN channels on this connection"));
                    }
                    let rx = engine.notify.subscribe(&channel);
                    subs.push((channel, rx));
                    metrics::gauge!(observability::CATALOG_LISTENERS).increment(1.0);
                }
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
            Command::Unlisten { channel } => {
                let mut subs = self.subscriptions.lock().await;
                let before = subs.len();
                subs.retain(|(c, _)| *c != channel);
                let removed = before - subs.len();
                if removed > 0 {
                    metrics::gauge!(observability::CATALOG_LISTENERS).decrement(removed as f64);
                }
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
            Command::UnlistenAll => {
                let mut subs = self.subscriptions.lock().await;
                if !subs.is_empty() {
                    metrics::gauge!(observability::CATALOG_LISTENERS).decrement(subs.len() as f64);
                    subs.clear();
                }
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
            Command::Ping => Ok(rows(ping_schema(), [1i32], |encoder, one| encoder.encode_field(&one))),
        }
    }

    async fn availability(
        &self,
        field_id: Option<ulid::Ulid>,
        date: Option<chrono::NaiveDate>,
    ) -> PgWireResult<Vec<FieldAvailability>> {
        match field_id {
            Some(id) => Ok(vec![
                self.engine.field_availability(id, date).await.map_err(engine_err)?,
            ]),
            None => Ok(self.engine.catalog_availability(date).await),
        }
    }
}

impl Drop for FutbolflexHandler {
    fn drop(&mut self) {
        let open = self.subscriptions.get_mut().len();
        if open > 0 {
            metrics::gauge!(observability::CATALOG_LISTENERS).decrement(open as f64);
        }
    }
}

// ── Result encoding ──────────────────────────────────────────────

fn rows<T>(
    schema: Vec<FieldInfo>,
    items: impl IntoIterator<Item = T>,
    encode: impl Fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_user(encoder: &mut DataRowEncoder, user: UserInfo) -> PgWireResult<()> {
    encoder.encode_field(&user.id.to_string())?;
    encoder.encode_field(&user.name)?;
    encoder.encode_field(&user.email)?;
    encoder.encode_field(&user.phone)?;
    encoder.encode_field(&user.role.as_str().to_string())
}

fn encode_field(encoder: &mut DataRowEncoder, field: Field) -> PgWireResult<()> {
    encoder.encode_field(&field.id.to_string())?;
    encoder.encode_field(&field.name)?;
    encoder.encode_field(&field.surface_type)?;
    encoder.encode_field(&field.price)?;
    encoder.encode_field(&HourWindow::format_list(&field.available_hours))?;
    encoder.encode_field(&field.image)?;
    encoder.encode_field(&field.location)
}

fn encode_reservation(encoder: &mut DataRowEncoder, info: ReservationInfo) -> PgWireResult<()> {
    let r = info.reservation;
    encoder.encode_field(&r.id.to_string())?;
    encoder.encode_field(&r.user_id.to_string())?;
    encoder.encode_field(&r.field_id.to_string())?;
    encoder.encode_field(&info.field_name)?;
    encoder.encode_field(&format_date(r.date))?;
    encoder.encode_field(&format_clock(r.start_time))?;
    encoder.encode_field(&format_clock(r.end_time))?;
    encoder.encode_field(&r.contact.name)?;
    encoder.encode_field(&r.contact.email)?;
    encoder.encode_field(&r.contact.phone)?;
    encoder.encode_field(&r.status.as_str().to_string())?;
    encoder.encode_field(&r.payment_method.as_str().to_string())?;
    encoder.encode_field(&r.qr_code)?;
    encoder.encode_field(&r.created_at)
}

fn encode_message(encoder: &mut DataRowEncoder, m: Message) -> PgWireResult<()> {
    encoder.encode_field(&m.id.to_string())?;
    encoder.encode_field(&m.name)?;
    encoder.encode_field(&m.email)?;
    encoder.encode_field(&m.phone)?;
    encoder.encode_field(&m.subject)?;
    encoder.encode_field(&m.body)?;
    encoder.encode_field(&m.user_id.map(|id| id.to_string()))?;
    encoder.encode_field(&m.created_at)
}

// ── Schemas ──────────────────────────────────────────────────────

fn column(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn users_schema() -> Vec<FieldInfo> {
    ["id", "name", "email", "phone", "role"]
        .into_iter()
        .map(|name| column(name, Type::VARCHAR))
        .collect()
}

fn fields_schema() -> Vec<FieldInfo> {
    vec![
        column("id", Type::VARCHAR),
        column("name", Type::VARCHAR),
        column("surface_type", Type::VARCHAR),
        column("price", Type::INT8),
        column("available_hours", Type::VARCHAR),
        column("image", Type::VARCHAR),
        column("location", Type::VARCHAR),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        column("field_id", Type::VARCHAR),
        column("field_name", Type::VARCHAR),
        column("date", Type::VARCHAR),
        column("start_time", Type::VARCHAR),
        column("available", Type::BOOL),
    ]
}

fn availability_summary_schema() -> Vec<FieldInfo> {
    vec![
        column("field_id", Type::VARCHAR),
        column("field_name", Type::VARCHAR),
        column("date", Type::VARCHAR),
        column("available_count", Type::INT8),
    ]
}

fn reservations_schema() -> Vec<FieldInfo> {
    let mut schema: Vec<FieldInfo> = [
        "id",
        "user_id",
        "field_id",
        "field_name",
        "date",
        "start_time",
        "end_time",
        "user_name",
        "user_email",
        "user_phone",
        "status",
        "payment_method",
        "qr_code",
    ]
    .into_iter()
    .map(|name| column(name, Type::VARCHAR))
    .collect();
    schema.push(column("created_at", Type::INT8));
    schema
}

fn messages_schema() -> Vec<FieldInfo> {
    let mut schema: Vec<FieldInfo> = ["id", "name", "email", "phone", "subject", "body", "user_id"]
        .into_iter()
        .map(|name| column(name, Type::VARCHAR))
        .collect();
    schema.push(column("created_at", Type::INT8));
    schema
}

fn ping_schema() -> Vec<FieldInfo> {
    vec![column("?column?", Type::INT4)]
}

/// Result columns of a statement, known before its parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    match sql::result_table(sql).as_deref() {
        Some("users") => users_schema(),
        Some("fields") => fields_schema(),
        Some("availability") => availability_schema(),
        Some("availability_summary") => availability_summary_schema(),
        Some("reservations") => reservations_schema(),
        Some("messages") => messages_schema(),
        Some("?column?") => ping_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for FutbolflexHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct FutbolflexQueryParser;

#[async_trait]
impl QueryParser for FutbolflexQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for FutbolflexHandler {
    type Statement = String;
    type QueryParser = FutbolflexQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(&self, client: &mut C, portal: &Portal<Self::Statement>, _max_rows: usize) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        self.run(client, &sql).await
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
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
                    max = max.max(n);
                }
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    substitute(&portal.statement.statement, &portal.parameters)
}

fn substitute(sql: &str, params: &[Option<impl AsRef<[u8]>>]) -> String {
    let mut result = sql.to_string();
    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

/// Handlers for one client connection. Built per connection so LISTEN
/// subscriptions live and die with it.
pub struct FutbolflexFactory {
    handler: Arc<FutbolflexHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<FutbolflexAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl FutbolflexFactory {
    pub fn new(engine: Arc<Engine>, credentials: Arc<Credentials>) -> Self {
        let auth_source = FutbolflexAuthSource::new(credentials.as_ref().clone());
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(FutbolflexHandler::new(engine, credentials)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(auth_source, param_provider)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for FutbolflexFactory {
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

/// Serve one client socket until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    credentials: Arc<Credentials>,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(FutbolflexFactory::new(engine, credentials));
    process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: impl Into<String>) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message.into())))
}

fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e.class() {
        ErrorClass::Validation => "22023",
        ErrorClass::NotFound => "P0002",
        ErrorClass::Conflict => "23505",
        ErrorClass::Authorization if matches!(e, EngineError::InvalidCredentials) => "28P01",
        ErrorClass::Authorization => "42501",
        ErrorClass::Policy => "P0001",
        ErrorClass::Internal => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    let code = engine_sqlstate(&e);
    if e.class() == ErrorClass::Internal {
        error!("internal error: {e}");
        return user_error(code, "internal error, please try again later");
    }
    user_error(code, e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    use sql::SqlError;
    let code = match &e {
        SqlError::Parse(_) | SqlError::Empty | SqlError::Unsupported(_) => "42601",
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn(_) => "42703",
        SqlError::WrongArity(..)
        | SqlError::MissingColumn(_)
        | SqlError::MissingFilter(_)
        | SqlError::InvalidValue { .. } => "22023",
    };
    user_error(code, e.to_string())
}
