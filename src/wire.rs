use std::fmt::Debug;
use std::io;
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
use pgwire::messages::data::DataRow;
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat,
    FieldInfo, QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::{process_socket, TlsAcceptor};
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::FleetAuthSource;
use crate::engine::{Engine, EngineError, Entity};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

pub struct FleetHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<FleetQueryParser>,
}

impl FleetHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(FleetQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    /// Run one command with request metrics around it.
    async fn run(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        let label = command_label(&cmd);
        let start = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertRoom { id, name } => {
                engine.create_room(id, name).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertUser { id, username } => {
                engine.create_user(id, username).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertApplication { id, name } => {
                engine.create_application(id, name).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertWorkstation {
                id,
                room_id,
                identifier,
                name,
                colour,
                offset_x,
                offset_y,
            } => {
                engine
                    .create_workstation(id, room_id, identifier, name, colour, offset_x, offset_y)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertHeartbeat {
                workstation_id,
                seen_at,
            } => {
                engine
                    .record_heartbeat(workstation_id, seen_at)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertWorkgroup(req) => {
                let id = engine.create_workgroup(req).await.map_err(engine_err)?;
                let schema = Arc::new(created_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&id.to_string())?;
                Ok(rows(schema, vec![Ok(encoder.take_row())]))
            }
            Command::InsertMember {
                workgroup_id,
                workstation_id,
            } => {
                engine
                    .add_workstation(workgroup_id, workstation_id)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::DeleteMember {
                workgroup_id,
                workstation_id,
            } => {
                engine
                    .remove_workstation(workgroup_id, workstation_id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SetSharing {
                workgroup_id,
                workstation_id: Some(workstation_id),
                enabled,
            } => {
                engine
                    .set_member_sharing(workgroup_id, workstation_id, enabled)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::SetSharing {
                workgroup_id,
                workstation_id: None,
                enabled,
            } => {
                let updated = engine
                    .set_group_sharing(workgroup_id, enabled)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(updated))
            }
            Command::SelectAvailability { room_id } => {
                let statuses = engine.room_availability(&room_id).await.map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let data = statuses
                    .into_iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.id.to_string())?;
                        encoder.encode_field(&s.identifier)?;
                        encoder.encode_field(&s.name)?;
                        encoder.encode_field(&s.colour)?;
                        encoder.encode_field(&s.offset_x)?;
                        encoder.encode_field(&s.offset_y)?;
                        encoder.encode_field(&s.last_seen)?;
                        encoder.encode_field(&s.available)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(rows(schema, data))
            }
            Command::SelectMembers { workgroup_id } => {
                let members = engine.get_members(&workgroup_id).await.map_err(engine_err)?;
                let schema = Arc::new(members_schema());
                let data = members
                    .iter()
                    .map(|m| encode_member(&schema, m))
                    .collect();
                Ok(rows(schema, data))
            }
            Command::SelectHistory { owner_id, count } => {
                let past = engine
                    .list_past_workgroups(&owner_id, count)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(workgroups_schema());
                let data = past
                    .into_iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.id.to_string())?;
                        encoder.encode_field(&Some(owner_id.to_string()))?;
                        encoder.encode_field(&s.room.as_ref().map(|r| r.id.to_string()))?;
                        encoder.encode_field(&s.room.map(|r| r.name))?;
                        encoder.encode_field(&s.started)?;
                        encoder.encode_field(&None::<i64>)?;
                        encoder.encode_field(&None::<i64>)?;
                        encoder.encode_field(&None::<String>)?;
                        encoder.encode_field(&None::<String>)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(rows(schema, data))
            }
            Command::SelectWorkgroup { owner_id, id } => {
                let d = engine
                    .get_workgroup(&owner_id, &id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(workgroups_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&d.id.to_string())?;
                encoder.encode_field(&Some(d.owner_id.to_string()))?;
                encoder.encode_field(&d.room.as_ref().map(|r| r.id.to_string()))?;
                encoder.encode_field(&d.room.as_ref().map(|r| r.name.clone()))?;
                encoder.encode_field(&d.started)?;
                encoder.encode_field(&Some(d.expires))?;
                encoder.encode_field(&Some(d.duration_minutes))?;
                encoder.encode_field(&Some(join(d.applications.iter().map(|a| a.name.as_str()))))?;
                encoder.encode_field(&Some(join(
                    d.members.iter().map(|m| m.workstation_id.to_string()),
                )))?;
                Ok(rows(schema, vec![Ok(encoder.take_row())]))
            }
            // Validation only: change events stay on the engine's in-process
            // NotifyHub and are not pushed to the client.
            Command::Listen { channel } => {
                let workgroup_id = parse_channel(&channel)?;
                if engine.get_workgroup_state(&workgroup_id).is_none() {
                    return Err(engine_err(EngineError::NotFound(
                        Entity::Workgroup,
                        workgroup_id,
                    )));
                }
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
        }
    }
}

fn parse_channel(channel: &str) -> PgWireResult<Ulid> {
    let id = channel.strip_prefix("workgroup_").ok_or_else(|| {
        user_error(
            "42000",
            format!("invalid channel: {channel} (expected workgroup_{{id}})"),
        )
    })?;
    Ulid::from_string(id).map_err(|e| user_error("42000", format!("bad ULID in channel: {e}")))
}

fn join<S: AsRef<str>>(parts: impl Iterator<Item = S>) -> String {
    parts
        .map(|p| p.as_ref().to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn inserted(n: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(n))
}

fn rows(schema: Arc<Vec<FieldInfo>>, data: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(data)))
}

fn encode_member(schema: &Arc<Vec<FieldInfo>>, m: &MemberInfo) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&m.membership_id.to_string())?;
    encoder.encode_field(&m.workstation_id.to_string())?;
    encoder.encode_field(&m.name)?;
    encoder.encode_field(&m.colour)?;
    encoder.encode_field(&m.offset_x)?;
    encoder.encode_field(&m.offset_y)?;
    encoder.encode_field(&m.last_seen)?;
    encoder.encode_field(&m.time_added)?;
    encoder.encode_field(&m.sharing_enabled)?;
    Ok(encoder.take_row())
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn created_schema() -> Vec<FieldInfo> {
    vec![field("id", Type::VARCHAR)]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("identifier", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("colour", Type::VARCHAR),
        field("x", Type::FLOAT4),
        field("y", Type::FLOAT4),
        field("last_seen", Type::INT8),
        field("available", Type::BOOL),
    ]
}

fn members_schema() -> Vec<FieldInfo> {
    vec![
        field("membership_id", Type::VARCHAR),
        field("workstation_id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("colour", Type::VARCHAR),
        field("x", Type::FLOAT4),
        field("y", Type::FLOAT4),
        field("last_seen", Type::INT8),
        field("time_added", Type::INT8),
        field("sharing_enabled", Type::BOOL),
    ]
}

/// Shared by history and detail; history rows leave the detail-only
/// columns NULL.
fn workgroups_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("owner_id", Type::VARCHAR),
        field("room_id", Type::VARCHAR),
        field("room_name", Type::VARCHAR),
        field("started", Type::INT8),
        field("expires", Type::INT8),
        field("duration_minutes", Type::INT8),
        field("applications", Type::VARCHAR),
        field("workstations", Type::VARCHAR),
    ]
}

/// Result columns for a statement that may still carry `$n` placeholders,
/// so it is classified by keywords rather than parsed.
fn statement_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if upper.contains("INSERT") && upper.contains("WORKGROUPS") {
        created_schema()
    } else if !upper.contains("SELECT") {
        vec![]
    } else if upper.contains("AVAILABILITY") {
        availability_schema()
    } else if upper.contains("MEMBERS") {
        members_schema()
    } else if upper.contains("WORKGROUPS") {
        workgroups_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for FleetHandler {
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
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        Ok(vec![self.run(&engine, cmd).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct FleetQueryParser;

#[async_trait]
impl QueryParser for FleetQueryParser {
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
        Ok(statement_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for FleetHandler {
    type Statement = String;
    type QueryParser = FleetQueryParser;

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
        self.run(&engine, cmd).await
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
            statement_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(statement_schema(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        rest = &rest[pos + 1..];
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if let Ok(n) = rest[..digits].parse::<usize>() {
            max = max.max(n);
        }
        rest = &rest[digits..];
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    substitute(&portal.statement.statement, portal.parameters.as_slice())
}

/// One left-to-right pass over the statement text: only `$N` tokens of the
/// original SQL are replaced, never text inside an already bound value.
/// Placeholders without a bound value are left as written.
fn substitute<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        let bound = after[..digits]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| params.get(i));
        match bound {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => out.push_str(&rest[pos..pos + 1 + digits]),
        }
        rest = &after[digits..];
    }
    out.push_str(rest);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct FleetFactory {
    handler: Arc<FleetHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<FleetAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl FleetFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = FleetAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(FleetHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for FleetFactory {
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
) -> io::Result<()> {
    process_socket(socket, tls, FleetFactory::new(tenant_manager, password)).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for each engine outcome, so clients can branch on the code.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(..) => "P0002",
        EngineError::Conflict(_) | EngineError::WorkstationUnavailable(_) => "23P01",
        EngineError::InvalidState(_) => "55000",
        EngineError::Unauthorized(_) => "42501",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::Invalid(_) | EngineError::LimitExceeded(_) => "22023",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
