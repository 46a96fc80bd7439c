use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Sink;
use futures::stream;
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

use crate::auth::StaffAuthSource;
use crate::engine::{Engine, EngineError, ReservationRequest};
use crate::limits::MAX_PARAMS;
use crate::model::*;
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command, SqlError};

pub struct StaffHandler {
    engine: Arc<Engine>,
    query_parser: Arc<StaffQueryParser>,
}

impl StaffHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(StaffQueryParser),
        }
    }

    async fn execute(&self, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertTable { number, capacity } => {
                engine
                    .create_table(number, capacity)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteTable { id } => {
                engine.delete_table(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertBooking {
                date,
                time,
                guests,
                contact,
                tables,
            } => {
                let booking = engine
                    .allocate(ReservationRequest {
                        date,
                        time,
                        guests,
                        contact,
                        customer_user: None,
                        tables,
                    })
                    .await
                    .map_err(engine_err)?;
                tracing::info!(booking = %booking.id, "console booking placed");
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteBooking { id } => {
                engine.cancel_booking(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertCoverImage { title, image } => {
                engine
                    .add_cover_image(title, image)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteCoverImage { id } => {
                engine.remove_cover_image(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectTables => table_rows(engine.list_tables().await),
            Command::SelectAvailability { date, time, guests } => {
                let availability = engine
                    .resolve(date, time, guests, None)
                    .await
                    .map_err(engine_err)?;
                table_rows(availability.tables)
            }
            Command::SelectBookings { date } => {
                let bookings = match date {
                    Some(date) => engine.bookings_on(date).await,
                    None => engine.all_bookings().await,
                };
                booking_rows(bookings, &engine.list_tables().await)
            }
            Command::SelectCoverImages => cover_image_rows(engine.list_cover_images().await),
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT4, FieldFormat::Text)
}

fn tables_schema() -> Vec<FieldInfo> {
    vec![text_field("id"), int_field("number"), int_field("capacity")]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("date"),
        text_field("time"),
        int_field("guests"),
        text_field("name"),
        text_field("email"),
        text_field("phone_number"),
        text_field("comments"),
        text_field("customer_user"),
        text_field("tables"),
    ]
}

fn cover_images_schema() -> Vec<FieldInfo> {
    vec![text_field("id"), text_field("title"), text_field("image")]
}

/// Result columns for a statement, from its text alone. Used to describe prepared
/// statements before their parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    if !upper.starts_with("SELECT") {
        return vec![];
    }
    if upper.contains("AVAILABILITY") {
        tables_schema()
    } else if upper.contains("COVER_IMAGES") {
        cover_images_schema()
    } else if upper.contains("BOOKINGS") {
        bookings_schema()
    } else if upper.contains("TABLES") {
        tables_schema()
    } else {
        vec![]
    }
}

fn as_i32(v: u32) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}

fn table_rows(tables: Vec<Table>) -> PgWireResult<Response> {
    let schema = Arc::new(tables_schema());
    let rows: Vec<PgWireResult<_>> = tables
        .into_iter()
        .map(|t| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&t.id.to_string())?;
            encoder.encode_field(&as_i32(t.number))?;
            encoder.encode_field(&as_i32(t.capacity))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn booking_rows(bookings: Vec<Booking>, tables: &[Table]) -> PgWireResult<Response> {
    let schema = Arc::new(bookings_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .into_iter()
        .map(|b| {
            let numbers: Vec<String> = tables
                .iter()
                .filter(|t| b.table_ids.contains(&t.id))
                .map(|t| t.number.to_string())
                .collect();
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.date.format("%Y-%m-%d").to_string())?;
            encoder.encode_field(&b.time.format("%H:%M").to_string())?;
            encoder.encode_field(&as_i32(b.guests))?;
            encoder.encode_field(&b.contact.name)?;
            encoder.encode_field(&b.contact.email)?;
            encoder.encode_field(&b.contact.phone_number)?;
            encoder.encode_field(&b.contact.comments)?;
            encoder.encode_field(&b.customer_user)?;
            encoder.encode_field(&numbers.join(","))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn cover_image_rows(images: Vec<CoverImage>) -> PgWireResult<Response> {
    let schema = Arc::new(cover_images_schema());
    let rows: Vec<PgWireResult<_>> = images
        .into_iter()
        .map(|c| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&c.id.to_string())?;
            encoder.encode_field(&c.title)?;
            encoder.encode_field(&c.image)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

// ── Simple Query Protocol ────────────────────────────────────────

#[async_trait]
impl SimpleQueryHandler for StaffHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.execute(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct StaffQueryParser;

#[async_trait]
impl QueryParser for StaffQueryParser {
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
        count_params(sql).map_err(engine_err)?;
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        let count = count_params(stmt).map_err(engine_err)?;
        Ok(vec![Type::VARCHAR; count])
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
impl ExtendedQueryHandler for StaffHandler {
    type Statement = String;
    type QueryParser = StaffQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        self.execute(&sql).await
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
        let count = count_params(&target.statement).map_err(engine_err)?;
        let param_types = vec![Type::VARCHAR; count];
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

/// Statement text split around `$N` placeholders. Quoted literals stay text.
enum Piece<'a> {
    Text(&'a str),
    /// The digits after `$`.
    Param(&'a str),
}

fn split_params(sql: &str) -> Vec<Piece<'_>> {
    let bytes = sql.as_bytes();
    let mut pieces = Vec::new();
    let mut in_literal = false;
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            // A doubled quote inside a literal toggles twice and stays inside.
            b'\'' => in_literal = !in_literal,
            b'$' if !in_literal => {
                let digits = i + 1;
                let mut end = digits;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if end > digits {
                    pieces.push(Piece::Text(&sql[start..i]));
                    pieces.push(Piece::Param(&sql[digits..end]));
                    start = end;
                    i = end;
                    continue;
                }
            }
            _ => {}
        }
        i += 1;
    }
    pieces.push(Piece::Text(&sql[start..]));
    pieces
}

/// Highest `$N` placeholder in the statement, capped at [`MAX_PARAMS`].
fn count_params(sql: &str) -> Result<usize, EngineError> {
    let mut max = 0;
    for piece in split_params(sql) {
        let Piece::Param(digits) = piece else { continue };
        match digits.parse::<usize>() {
            Ok(n) if n <= MAX_PARAMS => max = max.max(n),
            _ => return Err(EngineError::LimitExceeded("too many statement parameters")),
        }
    }
    Ok(max)
}

/// Inline bound text parameters as quoted literals in one left-to-right pass, so text
/// inside a bound value is never read as another placeholder.
fn substitute_params(sql: &str, params: &[Option<Bytes>]) -> String {
    let mut result = String::with_capacity(sql.len());
    for piece in split_params(sql) {
        match piece {
            Piece::Text(text) => result.push_str(text),
            Piece::Param(digits) => {
                let bound = digits
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|i| params.get(i));
                match bound {
                    Some(Some(bytes)) => {
                        let text = String::from_utf8_lossy(bytes);
                        result.push('\'');
                        result.push_str(&text.replace('\'', "''"));
                        result.push('\'');
                    }
                    Some(None) => result.push_str("NULL"),
                    None => {
                        result.push('$');
                        result.push_str(digits);
                    }
                }
            }
        }
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct StaffFactory {
    handler: Arc<StaffHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<StaffAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl StaffFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = StaffAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(StaffHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for StaffFactory {
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

/// Serve one console connection until the client disconnects.
pub async fn process_connection(
    socket: TcpStream,
    factory: Arc<StaffFactory>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE for an engine error.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidInput { .. }
        | EngineError::PastDateTime
        | EngineError::InvalidPartySize(_)
        | EngineError::InvalidCapacity(_) => "22023",
        EngineError::InsufficientCapacity { .. } | EngineError::TableUnavailable(_) => "23P01",
        EngineError::DuplicateTableNumber(_) => "23505",
        EngineError::TableInUse(_) => "23503",
        EngineError::NotFound(_) => "02000",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
