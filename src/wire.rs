use std::fmt::Debug;
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

use crate::auth::ParkadeAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

pub struct ParkadeHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<ParkadeQueryParser>,
}

impl ParkadeHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(ParkadeQueryParser),
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

    async fn execute_command(
        &self,
        engine: &Engine,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        let label = observability::command_label(&cmd);
        let start = std::time::Instant::now();
        let result = self.dispatch(engine, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn dispatch(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertLot {
                id,
                name,
                address,
                open_minute,
                close_minute,
            } => {
                engine
                    .create_lot(id, name, address, open_minute, close_minute)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteLot { id } => {
                engine.delete_lot(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertSpot {
                id,
                lot_id,
                spot_number,
                kind,
                is_active,
            } => {
                engine
                    .create_spot(id, lot_id, spot_number, kind, is_active)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteSpot { id } => {
                engine.delete_spot(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertUser {
                id,
                email,
                first_name,
                last_name,
                phone,
            } => {
                engine
                    .create_user(id, email, first_name, last_name, phone)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertReservation {
                id,
                user_id,
                spot_id,
                start,
                end,
            } => {
                if let Err(e) = engine
                    .create_reservation(id, user_id, spot_id, start, end)
                    .await
                {
                    if matches!(e, EngineError::SlotConflict(_)) {
                        metrics::counter!(observability::SLOT_CONFLICTS_TOTAL).increment(1);
                    }
                    return Err(engine_err(e));
                }
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteReservation { id } => {
                engine.cancel_reservation(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectLots => {
                let lots = engine.list_lots();
                let schema = Arc::new(lots_schema());
                let rows: Vec<PgWireResult<_>> = lots
                    .into_iter()
                    .map(|lot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&lot.id.to_string())?;
                        encoder.encode_field(&lot.name)?;
                        encoder.encode_field(&lot.address)?;
                        encoder.encode_field(&format_hhmm(lot.open_minute))?;
                        encoder.encode_field(&format_hhmm(lot.close_minute))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectSpots { lot_id } => {
                let spots = engine.lot_spot_infos(lot_id).await;
                Ok(vec![spot_rows(spots)])
            }
            Command::SelectReservation { id } => {
                let detail = engine.get_reservation(id).await.map_err(engine_err)?;
                Ok(vec![reservation_rows(detail.into_iter().collect())])
            }
            Command::SelectUpcoming { user_id } => {
                let upcoming = engine
                    .upcoming_reservations(user_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![reservation_rows(upcoming)])
            }
            Command::SelectAvailability {
                start,
                end,
                lot_id,
                page,
                limit,
            } => {
                let free = engine
                    .availability(start, end, lot_id, page, limit)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![spot_rows(free)])
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

fn lots_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("name".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("address".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("open_time".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("close_time".into(), None, None, Type::VARCHAR, FieldFormat::Text),
    ]
}

fn spots_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("lot_id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("spot_number".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("type".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("is_active".into(), None, None, Type::BOOL, FieldFormat::Text),
        FieldInfo::new("lot_name".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("lot_address".into(), None, None, Type::VARCHAR, FieldFormat::Text),
    ]
}

fn reservations_schema() -> Vec<FieldInfo> {
    vec![
        FieldInfo::new("id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("user_id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("spot_id".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("start".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("end".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("status".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("user_email".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("spot_number".into(), None, None, Type::VARCHAR, FieldFormat::Text),
        FieldInfo::new("lot_name".into(), None, None, Type::VARCHAR, FieldFormat::Text),
    ]
}

fn spot_rows(spots: Vec<SpotInfo>) -> Response {
    let schema = Arc::new(spots_schema());
    let rows: Vec<PgWireResult<_>> = spots
        .into_iter()
        .map(|spot| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&spot.id.to_string())?;
            encoder.encode_field(&spot.lot_id.to_string())?;
            encoder.encode_field(&spot.spot_number)?;
            encoder.encode_field(&spot.kind.as_str())?;
            encoder.encode_field(&spot.is_active)?;
            encoder.encode_field(&spot.lot.name)?;
            encoder.encode_field(&spot.lot.address)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn reservation_rows(details: Vec<ReservationDetail>) -> Response {
    let schema = Arc::new(reservations_schema());
    let rows: Vec<PgWireResult<_>> = details
        .into_iter()
        .map(|d| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&d.id.to_string())?;
            encoder.encode_field(&d.user.id.to_string())?;
            encoder.encode_field(&d.spot.id.to_string())?;
            encoder.encode_field(&d.start)?;
            encoder.encode_field(&d.end)?;
            encoder.encode_field(&d.status.as_str())?;
            encoder.encode_field(&d.user.email)?;
            encoder.encode_field(&d.spot.spot_number)?;
            encoder.encode_field(&d.spot.lot.name)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Schema for a SELECT statement's result set, by virtual table name.
fn select_schema(stmt: &str) -> Vec<FieldInfo> {
    let upper = stmt.to_uppercase();
    if !upper.contains("SELECT") {
        return vec![];
    }
    if upper.contains("AVAILABILITY") || upper.contains("SPOTS") {
        spots_schema()
    } else if upper.contains("UPCOMING") || upper.contains("RESERVATIONS") {
        reservations_schema()
    } else if upper.contains("LOTS") {
        lots_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for ParkadeHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.execute_command(&engine, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ParkadeQueryParser;

#[async_trait]
impl QueryParser for ParkadeQueryParser {
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
        Ok(select_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ParkadeHandler {
    type Statement = String;
    type QueryParser = ParkadeQueryParser;

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
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.execute_command(&engine, cmd).await?;
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
            select_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(select_schema(
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

pub struct ParkadeFactory {
    handler: Arc<ParkadeHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<ParkadeAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl ParkadeFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = ParkadeAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ParkadeHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ParkadeFactory {
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
) -> Result<(), std::io::Error> {
    let factory = Arc::new(ParkadeFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

/// Business errors keep distinct SQLSTATEs so clients can tell a slot
/// conflict from validation failures and from infrastructure trouble.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::SlotConflict(_) => "23P01",
        EngineError::AlreadyFinalized { .. } => "55000",
        EngineError::NotFound(_)
        | EngineError::UserNotFound(_)
        | EngineError::SpotNotFound(_) => "42704",
        EngineError::SpotInactive(_)
        | EngineError::InvalidInterval { .. }
        | EngineError::PastStartTime { .. } => "22000",
        EngineError::AlreadyExists(_)
        | EngineError::DuplicateEmail(_)
        | EngineError::DuplicateSpotNumber { .. } => "23505",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM lots"), 0);
        assert_eq!(count_params("WHERE id = $1"), 1);
        assert_eq!(count_params("($2, $1, $3)"), 3);
    }

    #[test]
    fn conflict_sqlstate_is_distinct() {
        let conflict = sqlstate(&EngineError::SlotConflict(Ulid::new()));
        let invalid = sqlstate(&EngineError::InvalidInterval { start: 2, end: 1 });
        let unavailable = sqlstate(&EngineError::WalError("down".into()));
        assert_ne!(conflict, invalid);
        assert_ne!(conflict, unavailable);
        assert_eq!(conflict, "23P01");
    }

    #[test]
    fn select_schema_by_table() {
        assert_eq!(select_schema("SELECT * FROM lots").len(), lots_schema().len());
        assert_eq!(
            select_schema("SELECT * FROM availability WHERE start >= 1").len(),
            spots_schema().len()
        );
        assert_eq!(
            select_schema("SELECT * FROM upcoming WHERE user_id = 'x'").len(),
            reservations_schema().len()
        );
        assert!(select_schema("INSERT INTO lots (id) VALUES ('x')").is_empty());
    }
}
