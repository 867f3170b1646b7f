use std::fmt::Debug;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
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
use ulid::Ulid;

use crate::auth::{Identity, Role, ValetAuthSource};
use crate::config::Config;
use crate::engine::Engine;
use crate::facility::FacilityManager;
use crate::model::format_at_offset;
use crate::sql::{self, Command};

pub struct ValetHandler {
    facilities: Arc<FacilityManager>,
    config: Arc<Config>,
    query_parser: Arc<ValetQueryParser>,
}

impl ValetHandler {
    pub fn new(facilities: Arc<FacilityManager>, config: Arc<Config>) -> Self {
        Self {
            facilities,
            config,
            query_parser: Arc::new(ValetQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.facilities.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("facility error: {e}"),
            )))
        })
    }

    /// The identity record every command trusts: startup username plus the
    /// role assigned in config. Never re-verified past this point.
    fn resolve_identity<C: ClientInfo>(&self, client: &C) -> Identity {
        let user_id = client
            .metadata()
            .get("user")
            .cloned()
            .unwrap_or_else(|| "anonymous".to_string());
        let role = if self.config.is_admin(&user_id) {
            Role::Admin
        } else {
            Role::User
        };
        Identity { user_id, role }
    }

    fn fmt_time(&self, t: i64) -> String {
        format_at_offset(t, self.config.display_offset_min)
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        identity: &Identity,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::CreateLot { id, name } => {
                require_admin(identity)?;
                engine.create_lot(id, name).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::CreateSpot {
                id,
                lot_id,
                level,
                number,
            } => {
                require_admin(identity)?;
                engine
                    .create_spot(id, lot_id, level, number)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteSpot { id } => {
                require_admin(identity)?;
                engine.delete_spot(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::RegisterVehicle { id, plate, vtype } => {
                engine
                    .register_vehicle(id, &identity.user_id, plate, vtype)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::Book {
                id,
                spot_id,
                vehicle_id,
            } => {
                let started_at = engine
                    .book(id, &identity.user_id, vehicle_id, spot_id)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(book_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&id.to_string())?;
                encoder.encode_field(&identity.user_id)?;
                encoder.encode_field(&vehicle_id.to_string())?;
                encoder.encode_field(&spot_id.to_string())?;
                encoder.encode_field(&"ACTIVE")?;
                encoder.encode_field(&self.fmt_time(started_at))?;
                let row = encoder.take_row();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(vec![Ok(row)]),
                ))])
            }
            Command::Release { spot_id } => {
                let ended_at = engine
                    .release(&identity.user_id, spot_id)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(release_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&spot_id.to_string())?;
                encoder.encode_field(&identity.user_id)?;
                encoder.encode_field(&self.fmt_time(ended_at))?;
                encoder.encode_field(&true)?;
                let row = encoder.take_row();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(vec![Ok(row)]),
                ))])
            }
            Command::SelectHistory => {
                let schema = Arc::new(history_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .history(&identity.user_id)
                    .into_iter()
                    .map(|b| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.id.to_string())?;
                        encoder.encode_field(&b.spot_id.to_string())?;
                        encoder.encode_field(&b.vehicle_id.to_string())?;
                        encoder.encode_field(&self.fmt_time(b.started_at))?;
                        encoder.encode_field(&b.ended_at.map(|t| self.fmt_time(t)))?;
                        encoder.encode_field(&b.status_label())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectOccupancy => {
                require_admin(identity)?;
                let summary = engine.occupancy();
                let schema = Arc::new(occupancy_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&(summary.total_spots as i64))?;
                encoder.encode_field(&(summary.available as i64))?;
                encoder.encode_field(&(summary.occupied as i64))?;
                encoder.encode_field(&summary.occupancy_rate)?;
                let summary_row = encoder.take_row();

                let active_schema = Arc::new(active_schema());
                let active_rows: Vec<PgWireResult<_>> = engine
                    .active_bookings()
                    .into_iter()
                    .map(|b| {
                        let mut encoder = DataRowEncoder::new(active_schema.clone());
                        encoder.encode_field(&b.id.to_string())?;
                        encoder.encode_field(&b.user_id)?;
                        encoder.encode_field(&b.vehicle_id.to_string())?;
                        encoder.encode_field(&b.spot_id.to_string())?;
                        encoder.encode_field(&self.fmt_time(b.started_at))?;
                        Ok(encoder.take_row())
                    })
                    .collect();

                Ok(vec![
                    Response::Query(QueryResponse::new(
                        schema,
                        stream::iter(vec![Ok(summary_row)]),
                    )),
                    Response::Query(QueryResponse::new(active_schema, stream::iter(active_rows))),
                ])
            }
            Command::SelectSpots { lot_id } => {
                require_admin(identity)?;
                let schema = Arc::new(spots_schema());
                let rows: Vec<PgWireResult<_>> = engine
                    .list_spots(lot_id)
                    .await
                    .into_iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.id.to_string())?;
                        encoder.encode_field(&s.lot_id.to_string())?;
                        encoder.encode_field(&s.level)?;
                        encoder.encode_field(&s.number)?;
                        encoder.encode_field(&s.status.as_str())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectMe => {
                let schema = Arc::new(me_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&identity.user_id)?;
                encoder.encode_field(&identity.role.as_str())?;
                let row = encoder.take_row();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(vec![Ok(row)]),
                ))])
            }
            Command::Listen { channel } => {
                let spot_id_str = channel.strip_prefix("spot_").ok_or_else(|| {
                    PgWireError::UserError(Box::new(ErrorInfo::new(
                        "ERROR".into(),
                        "42000".into(),
                        format!("invalid channel: {channel} (expected spot_{{id}})"),
                    )))
                })?;
                let _spot_id = Ulid::from_string(spot_id_str).map_err(|e| {
                    PgWireError::UserError(Box::new(ErrorInfo::new(
                        "ERROR".into(),
                        "42000".into(),
                        format!("bad ULID in channel: {e}"),
                    )))
                })?;
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
        }
    }
}

// ── Result schemas ───────────────────────────────────────────────

fn varchar(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn book_schema() -> Vec<FieldInfo> {
    vec![
        varchar("booking_id"),
        varchar("user_id"),
        varchar("vehicle_id"),
        varchar("spot_id"),
        varchar("status"),
        varchar("start_time"),
    ]
}

fn release_schema() -> Vec<FieldInfo> {
    vec![
        varchar("spot_id"),
        varchar("user_id"),
        varchar("end_time"),
        FieldInfo::new("released".into(), None, None, Type::BOOL, FieldFormat::Text),
    ]
}

fn history_schema() -> Vec<FieldInfo> {
    vec![
        varchar("booking_id"),
        varchar("spot_id"),
        varchar("vehicle_id"),
        varchar("start_time"),
        varchar("end_time"),
        varchar("status"),
    ]
}

fn occupancy_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("total_spots".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("available".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("occupied".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new(
            "occupancy_rate".into(),
            None,
            None,
            Type::FLOAT8,
            FieldFormat::Text,
        ),
    ]
}

fn active_schema() -> Vec<FieldInfo> {
    vec![
        varchar("booking_id"),
        varchar("user_id"),
        varchar("vehicle_id"),
        varchar("spot_id"),
        varchar("start_time"),
    ]
}

fn spots_schema() -> Vec<FieldInfo> {
    vec![
        varchar("id"),
        varchar("lot_id"),
        varchar("level"),
        varchar("number"),
        varchar("status"),
    ]
}

fn me_schema() -> Vec<FieldInfo> {
    vec![varchar("user_id"), varchar("role")]
}

/// Result schema by statement shape, for Describe before Execute.
fn schema_for_statement(stmt: &str) -> Vec<FieldInfo> {
    let upper = stmt.to_uppercase();
    if upper.contains("SELECT") {
        if upper.contains("HISTORY") {
            return history_schema();
        }
        if upper.contains("OCCUPANCY") {
            return occupancy_schema();
        }
        if upper.contains("SPOTS") {
            return spots_schema();
        }
        if upper.contains("FROM ME") {
            return me_schema();
        }
    }
    if upper.contains("INSERT") && upper.contains("BOOKINGS") {
        return book_schema();
    }
    if upper.contains("UPDATE") && upper.contains("BOOKINGS") {
        return release_schema();
    }
    vec![]
}

// ── Simple Query Protocol ────────────────────────────────────────

#[async_trait]
impl SimpleQueryHandler for ValetHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let identity = self.resolve_identity(client);
        let cmd = sql::parse_sql(query).map_err(sql_err)?;

        let label = crate::observability::command_label(&cmd);
        let start = std::time::Instant::now();
        let result = self.execute_command(&engine, &identity, cmd).await;
        metrics::histogram!(crate::observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(crate::observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ValetQueryParser;

#[async_trait]
impl QueryParser for ValetQueryParser {
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
        Ok(schema_for_statement(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ValetHandler {
    type Statement = String;
    type QueryParser = ValetQueryParser;

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
        let identity = self.resolve_identity(client);
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.execute_command(&engine, &identity, cmd).await?;
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
            schema_for_statement(&target.statement),
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
        Ok(DescribePortalResponse::new(schema_for_statement(
            &target.statement.statement,
        )))
    }
}

/// Highest $N parameter placeholder in the SQL string.
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
                && n > max
            {
                max = n;
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text
/// format), quoting as SQL string literals.
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

pub struct ValetFactory {
    handler: Arc<ValetHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<ValetAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl ValetFactory {
    pub fn new(facilities: Arc<FacilityManager>, config: Arc<Config>) -> Self {
        let auth_source = ValetAuthSource::new(config.password.clone());
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ValetHandler::new(facilities, config)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ValetFactory {
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

/// Serve one client connection to completion.
pub async fn process_connection(
    socket: TcpStream,
    facilities: Arc<FacilityManager>,
    config: Arc<Config>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(ValetFactory::new(facilities, config));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

fn require_admin(identity: &Identity) -> PgWireResult<()> {
    if identity.is_admin() {
        Ok(())
    } else {
        Err(PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "42501".into(),
            "FORBIDDEN: admin role required".into(),
        ))))
    }
}

fn engine_err(e: crate::engine::EngineError) -> PgWireError {
    use crate::engine::EngineError::*;
    // Uniqueness-constraint conflicts mirror a database unique violation;
    // everything else is a raised domain error.
    let sqlstate = match &e {
        BookingConflict(_) | AlreadyExists(_) => "23505",
        _ => "P0001",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate.into(),
        format!("{}: {e}", e.code()),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
