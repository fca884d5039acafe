use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

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
use ulid::Ulid;

use crate::auth::WigwamAuthSource;
use crate::engine::{now_ms, Engine, EngineError};
use crate::limits::{DEFAULT_PROPERTY_PAGE, RECENT_EVENTS};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, RentalFilter, SqlError, WigwamFilter};
use crate::tenant::TenantManager;

pub struct WigwamHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<WigwamQueryParser>,
}

impl WigwamHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(WigwamQueryParser),
        }
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

    /// Run one command and record its count and latency.
    async fn run(&self, engine: &Engine, sql: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertUser { id, email } => {
                engine.create_user(id, email).await.map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::InsertConnection {
                user_id,
                connection,
            } => {
                engine.connect(user_id, connection).await.map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::DeleteConnection { user_id, provider } => {
                engine
                    .disconnect(user_id, provider)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![deleted(1)])
            }
            Command::InsertWigwam {
                id,
                owner_id,
                details,
                initial_listing,
            } => {
                let initial_listing = match initial_listing {
                    Some((start, end)) => {
                        let span = Span::new(start, end)
                            .map_err(|e| engine_err(EngineError::from(e)))?;
                        Some((Ulid::new(), span))
                    }
                    None => None,
                };
                engine
                    .create_property(id, owner_id, details, initial_listing)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::DeleteWigwam { id } => {
                engine.delete_property(id).await.map_err(engine_err)?;
                Ok(vec![deleted(1)])
            }
            Command::InsertListing {
                id,
                wigwam_id,
                start,
                end,
            } => {
                let span = Span::new(start, end).map_err(|e| engine_err(e.into()))?;
                engine
                    .add_listing(id, wigwam_id, span)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::DeleteListing { id } => {
                engine.remove_listing(id).await.map_err(engine_err)?;
                Ok(vec![deleted(1)])
            }
            Command::InsertRental {
                id,
                wigwam_id,
                user_id,
                start,
                end,
            } => {
                let span = Span::new(start, end).map_err(|e| engine_err(e.into()))?;
                engine
                    .book_rental(id, wigwam_id, user_id, span)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted(1)])
            }
            Command::DeleteRental { id } => {
                engine.cancel_rental(id).await.map_err(engine_err)?;
                Ok(vec![deleted(1)])
            }
            Command::InsertParty { wigwam_id, user_id } => {
                let url = engine
                    .throw_party(wigwam_id, user_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(party_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&url)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::InsertShare {
                wigwam_id,
                user_id,
                friends,
            } => {
                let sent = engine
                    .share_property(wigwam_id, user_id, friends)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![inserted(sent)])
            }
            Command::SelectWigwams(filter) => {
                let wigwams = match filter {
                    WigwamFilter::All => engine.list_properties(DEFAULT_PROPERTY_PAGE).await,
                    WigwamFilter::Id(id) => engine.property_info(&id).await.into_iter().collect(),
                    WigwamFilter::Owner(owner) => engine.properties_of_owner(owner).await,
                    WigwamFilter::OwnedBy { id, owner } => {
                        if engine.owns(owner, id).await {
                            engine.property_info(&id).await.into_iter().collect()
                        } else {
                            Vec::new()
                        }
                    }
                    WigwamFilter::Range { start, end } => engine.properties_in_range(start, end).await,
                };
                let schema = Arc::new(wigwam_schema());
                let rows: Vec<PgWireResult<_>> = wigwams
                    .into_iter()
                    .map(|w| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&w.id.to_string())?;
                        encoder.encode_field(&w.owner_id.to_string())?;
                        encoder.encode_field(&w.details.name)?;
                        encoder.encode_field(&w.details.description)?;
                        encoder.encode_field(&w.details.location)?;
                        encoder.encode_field(&w.details.price)?;
                        encoder.encode_field(&w.details.picture_url)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectListings { wigwam_id } => {
                let listings = match wigwam_id {
                    Some(id) => engine.get_listings(id).await.map_err(engine_err)?,
                    None => engine.recent_listings(RECENT_EVENTS).await,
                };
                let schema = Arc::new(listing_schema());
                let rows: Vec<PgWireResult<_>> = listings
                    .into_iter()
                    .map(|l| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&l.id.to_string())?;
                        encoder.encode_field(&l.property_id.to_string())?;
                        encoder.encode_field(&l.start)?;
                        encoder.encode_field(&l.end)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectRentals(filter) => {
                let rentals = match filter {
                    RentalFilter::Recent => engine.recent_rentals(RECENT_EVENTS).await,
                    RentalFilter::Wigwam(id) => engine.get_rentals(id).await.map_err(engine_err)?,
                    RentalFilter::User(id) => engine.rentals_for_user(id).await,
                    RentalFilter::Current { wigwam, user } => engine
                        .rental_for(user, wigwam, now_ms())
                        .await
                        .into_iter()
                        .collect(),
                };
                let schema = Arc::new(rental_schema());
                let rows: Vec<PgWireResult<_>> = rentals
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.property_id.to_string())?;
                        encoder.encode_field(&r.renter_id.to_string())?;
                        encoder.encode_field(&r.start)?;
                        encoder.encode_field(&r.end)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectAvailability { wigwam_id } => {
                let windows = engine
                    .get_availability(wigwam_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let wid = wigwam_id.to_string();
                let rows: Vec<PgWireResult<_>> = windows
                    .into_iter()
                    .map(|span| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&wid)?;
                        encoder.encode_field(&span.start)?;
                        encoder.encode_field(&span.end)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectUser { id } => {
                let user = engine
                    .get_user(&id)
                    .ok_or_else(|| engine_err(EngineError::NotFound(id)))?;
                let schema = Arc::new(user_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&user.id.to_string())?;
                encoder.encode_field(&user.email)?;
                encoder.encode_field(&user.name)?;
                encoder.encode_field(&user.provider.map(|p| p.tag().to_string()))?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectConnections { user_id } => {
                let schema = Arc::new(connection_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .get_connections(&user_id)
                    .into_iter()
                    .map(|c| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&c.user_id.to_string())?;
                        encoder.encode_field(&c.provider.tag().to_string())?;
                        encoder.encode_field(&c.uid)?;
                        encoder.encode_field(&c.name)?;
                        encoder.encode_field(&c.expires_at)?;
                        encoder.encode_field(&c.linked_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
        }
    }
}

fn inserted(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(rows))
}

fn deleted(rows: usize) -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(rows))
}

// ── Result schemas ───────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn wigwam_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("owner_id"),
        text("name"),
        text("description"),
        text("location"),
        int8("price"),
        text("picture_url"),
    ]
}

fn listing_schema() -> Vec<FieldInfo> {
    vec![text("id"), text("wigwam_id"), int8("start"), int8("end")]
}

fn rental_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("wigwam_id"),
        text("user_id"),
        int8("start"),
        int8("end"),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![text("wigwam_id"), int8("start"), int8("end")]
}

fn user_schema() -> Vec<FieldInfo> {
    vec![text("id"), text("email"), text("name"), text("provider")]
}

fn connection_schema() -> Vec<FieldInfo> {
    vec![
        text("user_id"),
        text("provider"),
        text("uid"),
        text("name"),
        int8("expires_at"),
        int8("linked_at"),
    ]
}

fn party_schema() -> Vec<FieldInfo> {
    vec![text("event_url")]
}

/// Columns a statement will return, judged from its text so that statements
/// with unbound `$n` placeholders can be described.
fn result_schema(stmt: &str) -> Vec<FieldInfo> {
    let upper = stmt.to_uppercase();
    let words: Vec<&str> = upper
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .filter(|w| !w.is_empty())
        .collect();
    let after = |keyword: &str| {
        words
            .iter()
            .position(|w| *w == keyword)
            .and_then(|i| words.get(i + 1))
            .map(|w| w.trim_matches('"'))
    };

    match words.first().copied() {
        Some("SELECT") => match after("FROM") {
            Some("WIGWAMS") => wigwam_schema(),
            Some("LISTINGS") => listing_schema(),
            Some("RENTALS") => rental_schema(),
            Some("AVAILABILITY") => availability_schema(),
            Some("USERS") => user_schema(),
            Some("CONNECTIONS") => connection_schema(),
            _ => vec![],
        },
        Some("INSERT") if after("INTO") == Some("PARTIES") => party_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for WigwamHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        self.run(&engine, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct WigwamQueryParser;

#[async_trait]
impl QueryParser for WigwamQueryParser {
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
impl ExtendedQueryHandler for WigwamHandler {
    type Statement = String;
    type QueryParser = WigwamQueryParser;

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
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        let mut responses = self.run(&engine, &sql).await?;
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
    let mut max = 0usize;
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

/// Replace `$1`, `$2`, ... with the bound text-format values as quoted literals.
/// Highest index first so `$1` never clobbers the prefix of `$10`.
fn substitute_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
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

pub struct WigwamFactory {
    handler: Arc<WigwamHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<WigwamAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl WigwamFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = WigwamAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(WigwamHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for WigwamFactory {
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
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(WigwamFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Unavailable { .. } => "23P01",
        EngineError::NotFound(_) => "P0002",
        _ => "P0001",
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
