use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
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
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::{self, SharedPasswordAuthSource};
use crate::engine::{EngineError, ErrorKind, now_ms};
use crate::model::*;
use crate::observability::{AUTH_FAILURES_TOTAL, QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::service::Service;
use crate::sql::{self, Command, SqlError};

pub struct ShareitHandler {
    service: Arc<Service>,
    request_timeout: Duration,
    query_parser: Arc<ShareitQueryParser>,
}

impl ShareitHandler {
    pub fn new(service: Arc<Service>, request_timeout: Duration) -> Self {
        Self {
            service,
            request_timeout,
            query_parser: Arc::new(ShareitQueryParser),
        }
    }

    /// Run one parsed command under the request timeout, recording RED metrics.
    async fn run(&self, login: Option<String>, cmd: Command) -> PgWireResult<Response> {
        let label = command_label(&cmd);
        let started = Instant::now();

        let result = match tokio::time::timeout(self.request_timeout, self.execute_command(login, cmd)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("{label} timed out after {:?}", self.request_timeout);
                Err(user_error("XX000", "request timed out".into()))
            }
        };

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, login: Option<String>, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.service.engine;
        let directory = &self.service.directory;
        let session_user = || requester(login.as_deref());

        match cmd {
            Command::InsertUser { id, name, email } => {
                directory
                    .register_user(id, name, email)
                    .await
                    .map_err(|e| engine_err(e.into()))?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertItem {
                id,
                name,
                description,
                available,
            } => {
                let owner = session_user()?;
                directory
                    .list_item(id, owner, name, description, available)
                    .await
                    .map_err(|e| engine_err(e.into()))?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertReservation {
                item_id,
                start,
                end,
            } => {
                let booker = session_user()?;
                let reservation = engine
                    .create_reservation(booker, item_id, start, end, now_ms())
                    .await
                    .map_err(engine_err)?;
                let views = engine.enrich(vec![reservation]).await;
                reservation_rows(views)
            }
            Command::InsertDecision {
                reservation_id,
                approved,
            } => {
                let approver = session_user()?;
                let reservation = engine
                    .decide_reservation(reservation_id, approver, approved)
                    .await
                    .map_err(engine_err)?;
                let views = engine.enrich(vec![reservation]).await;
                reservation_rows(views)
            }
            Command::InsertComment { item_id, text } => {
                let author = session_user()?;
                engine
                    .add_comment(author, item_id, text, now_ms())
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SelectReservation { id } => {
                let reservation = engine
                    .get_reservation(id, session_user()?)
                    .await
                    .map_err(engine_err)?;
                let views = engine.enrich(vec![reservation]).await;
                reservation_rows(views)
            }
            Command::SelectReservations {
                role,
                state,
                page,
                size,
            } => {
                let reservations = engine
                    .list_reservations(session_user()?, role, &state, now_ms(), page, size)
                    .await
                    .map_err(engine_err)?;
                let views = engine.enrich(reservations).await;
                reservation_rows(views)
            }
            Command::SelectItemBookings { item_id } => {
                let bookings = engine
                    .item_bookings(item_id, session_user()?, now_ms())
                    .await
                    .map_err(engine_err)?;
                booking_rows(bookings)
            }
            Command::SelectCommentEligibility { item_id } => {
                let eligibility = engine
                    .comment_eligibility(session_user()?, item_id, now_ms())
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(eligibility_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&eligibility.is_eligible())?;
                encoder.encode_field(&eligibility.reason().map(str::to_string))?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectComments { item_id } => {
                session_user()?;
                let schema = Arc::new(comment_schema());
                let rows: Vec<PgWireResult<_>> = directory
                    .comments_for(item_id)
                    .into_iter()
                    .map(|c| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&c.id.to_string())?;
                        encoder.encode_field(&c.item_id.to_string())?;
                        encoder.encode_field(&c.author_id.to_string())?;
                        encoder.encode_field(&c.text)?;
                        encoder.encode_field(&c.created)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

fn session_login<C: ClientInfo>(client: &C) -> Option<String> {
    client.metadata().get("user").cloned()
}

fn requester(login: Option<&str>) -> PgWireResult<UserId> {
    auth::requester_from_login(login).map_err(|e| {
        metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
        user_error("28000", e.to_string())
    })
}

// ── Result rows ──────────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("item_id", Type::VARCHAR),
        text_field("booker_id", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
        text_field("status", Type::VARCHAR),
        text_field("booker_name", Type::VARCHAR),
        text_field("item_name", Type::VARCHAR),
    ]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        text_field("kind", Type::VARCHAR),
        text_field("id", Type::VARCHAR),
        text_field("booker_id", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
    ]
}

fn eligibility_schema() -> Vec<FieldInfo> {
    vec![
        text_field("eligible", Type::BOOL),
        text_field("reason", Type::VARCHAR),
    ]
}

fn comment_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("item_id", Type::VARCHAR),
        text_field("author_id", Type::VARCHAR),
        text_field("text", Type::VARCHAR),
        text_field("created", Type::INT8),
    ]
}

/// Ids plus the resolved booker and item names; a name is NULL when its
/// lookup failed.
fn reservation_rows(views: Vec<ReservationView>) -> PgWireResult<Response> {
    let schema = Arc::new(reservation_schema());
    let rows: Vec<PgWireResult<_>> = views
        .into_iter()
        .map(|view| {
            let r = &view.reservation;
            let booker = view.booker.map(|u| u.name);
            let item = view.item.map(|i| i.name);
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.item_id.to_string())?;
            encoder.encode_field(&r.booker_id.to_string())?;
            encoder.encode_field(&r.span.start)?;
            encoder.encode_field(&r.span.end)?;
            encoder.encode_field(&r.status.as_str().to_string())?;
            encoder.encode_field(&booker)?;
            encoder.encode_field(&item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn booking_rows(bookings: ItemBookings) -> PgWireResult<Response> {
    let schema = Arc::new(booking_schema());
    let rows: Vec<PgWireResult<_>> = [("last", bookings.last), ("next", bookings.next)]
        .into_iter()
        .filter_map(|(kind, r)| r.map(|r| (kind, r)))
        .map(|(kind, r)| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&kind.to_string())?;
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.booker_id.to_string())?;
            encoder.encode_field(&r.span.start)?;
            encoder.encode_field(&r.span.end)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// Row shape of a statement, guessed from its text before parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let is_select = lower.trim_start().starts_with("select");
    if lower.contains("item_bookings") {
        booking_schema()
    } else if lower.contains("comment_eligibility") {
        eligibility_schema()
    } else if is_select && lower.contains("comments") {
        comment_schema()
    } else if lower.contains("reservations") || lower.contains("decisions") {
        reservation_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for ShareitHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        Ok(vec![self.run(session_login(client), cmd).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ShareitQueryParser;

#[async_trait]
impl QueryParser for ShareitQueryParser {
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

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ShareitHandler {
    type Statement = String;
    type QueryParser = ShareitQueryParser;

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
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.run(session_login(client), cmd).await
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
            result_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline bound text parameters as quoted literals, highest index first so
/// `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ShareitFactory {
    handler: Arc<ShareitHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SharedPasswordAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl ShareitFactory {
    pub fn new(service: Arc<Service>, password: String, request_timeout: Duration) -> Self {
        Self {
            handler: Arc::new(ShareitHandler::new(service, request_timeout)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SharedPasswordAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ShareitFactory {
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

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    factory: Arc<ShareitFactory>,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE per error category; the message is the engine's, unprefixed.
fn sqlstate(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::BadRequest => "22023",
        ErrorKind::NotFound => "P0002",
        ErrorKind::Conflict => "40001",
        ErrorKind::Internal => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if e.kind() == ErrorKind::Internal {
        tracing::error!("{e}");
    }
    user_error(sqlstate(e.kind()), e.message().to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
