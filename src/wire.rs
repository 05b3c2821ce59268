use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::StartupHandler;
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

use crate::engine::{Engine, EngineError, parse_span};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, Query, SqlError};

pub struct QuorumHandler {
    engine: Arc<Engine>,
    query_parser: Arc<QuorumQueryParser>,
}

impl QuorumHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(QuorumQueryParser),
        }
    }

    /// Parse and run one statement, recording per-command metrics.
    async fn run(&self, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertOrganization { id, name } => {
                engine.create_organization(id, name).await.map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertUser {
                id,
                organization_id,
                name,
            } => {
                engine
                    .create_user(id, organization_id, name)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertEvent {
                id,
                organization_id,
                name,
            } => {
                engine
                    .create_event(id, organization_id, name)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertParticipant { event_id, user_id } => {
                engine
                    .add_event_participant(event_id, user_id)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertMeeting {
                id,
                event_id,
                start_time,
                end_time,
                invitee_ids,
            } => {
                let span = parse_span(&start_time, &end_time).map_err(engine_err)?;
                engine
                    .create_meeting(id, event_id, span, invitee_ids)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertResponse {
                invitation_id,
                response,
            } => {
                engine
                    .respond_to_invitation(invitation_id, response)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::Select(query) => self.select(query).await,
        }
    }

    async fn select(&self, query: Query) -> PgWireResult<Response> {
        let engine = &self.engine;
        match query {
            Query::Organizations => organization_rows(engine.list_organizations()),
            Query::Users => user_rows(engine.list_users().await),
            Query::OrganizationUsers(id) => {
                user_rows(engine.list_organization_users(id).await.map_err(engine_err)?)
            }
            Query::EventParticipants(id) => {
                user_rows(engine.list_event_participants(id).await.map_err(engine_err)?)
            }
            Query::Events => event_rows(engine.list_events()),
            Query::OrganizationEvents(id) => {
                event_rows(engine.list_organization_events(id).map_err(engine_err)?)
            }
            Query::UserEvents(id) => event_rows(engine.list_user_events(id).await.map_err(engine_err)?),
            Query::Meetings => meeting_rows(engine.list_meetings().await),
            Query::Meeting(id) => meeting_rows(vec![engine.get_meeting(id).await.map_err(engine_err)?]),
            Query::EventMeetings(id) => {
                meeting_rows(engine.list_event_meetings(id).await.map_err(engine_err)?)
            }
            Query::UserMeetings(id) => {
                meeting_rows(engine.list_user_meetings(id).await.map_err(engine_err)?)
            }
            Query::MeetingInvitations(id) => {
                invitation_rows(engine.list_meeting_invitations(id).await.map_err(engine_err)?)
            }
            Query::UserInvitations(id) => {
                invitation_rows(engine.list_user_invitations(id).await.map_err(engine_err)?)
            }
        }
    }
}

fn inserted(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(rows))
}

// ── Result sets ──────────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

/// Columns returned by `SELECT * FROM <table>`.
fn table_schema(table: &str) -> Vec<FieldInfo> {
    match table {
        "organizations" => vec![
            text_field("id", Type::VARCHAR),
            text_field("name", Type::VARCHAR),
        ],
        "users" | "events" => vec![
            text_field("id", Type::VARCHAR),
            text_field("organization_id", Type::VARCHAR),
            text_field("name", Type::VARCHAR),
        ],
        "meetings" => vec![
            text_field("id", Type::VARCHAR),
            text_field("event_id", Type::VARCHAR),
            text_field("start_time", Type::VARCHAR),
            text_field("end_time", Type::VARCHAR),
            text_field("scheduled", Type::BOOL),
            text_field("participant_ids", Type::VARCHAR),
        ],
        "invitations" => vec![
            text_field("id", Type::VARCHAR),
            text_field("user_id", Type::VARCHAR),
            text_field("meeting_id", Type::VARCHAR),
            text_field("status", Type::VARCHAR),
        ],
        _ => vec![],
    }
}

/// Build a query response, encoding each item with `encode`.
fn rows<T>(
    table: &str,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(table_schema(table));
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn organization_rows(orgs: Vec<OrganizationInfo>) -> PgWireResult<Response> {
    rows("organizations", orgs, |enc, o| {
        enc.encode_field(&o.id.to_string())?;
        enc.encode_field(&o.name)
    })
}

fn user_rows(users: Vec<UserInfo>) -> PgWireResult<Response> {
    rows("users", users, |enc, u| {
        enc.encode_field(&u.id.to_string())?;
        enc.encode_field(&u.organization_id.to_string())?;
        enc.encode_field(&u.name)
    })
}

fn event_rows(events: Vec<EventInfo>) -> PgWireResult<Response> {
    rows("events", events, |enc, e| {
        enc.encode_field(&e.id.to_string())?;
        enc.encode_field(&e.organization_id.to_string())?;
        enc.encode_field(&e.name)
    })
}

fn meeting_rows(meetings: Vec<MeetingInfo>) -> PgWireResult<Response> {
    rows("meetings", meetings, |enc, m| {
        let participants: Vec<String> = m.participants.iter().map(|id| id.to_string()).collect();
        let participants = serde_json::to_string(&participants)
            .map_err(|e| PgWireError::ApiError(Box::new(e)))?;
        enc.encode_field(&m.id.to_string())?;
        enc.encode_field(&m.event_id.to_string())?;
        enc.encode_field(&format_timestamp(m.start))?;
        enc.encode_field(&format_timestamp(m.end))?;
        enc.encode_field(&m.scheduled)?;
        enc.encode_field(&participants)
    })
}

fn invitation_rows(invitations: Vec<InvitationInfo>) -> PgWireResult<Response> {
    rows("invitations", invitations, |enc, i| {
        enc.encode_field(&i.id.to_string())?;
        enc.encode_field(&i.user_id.to_string())?;
        enc.encode_field(&i.meeting_id.to_string())?;
        enc.encode_field(&i.status.as_str().to_string())
    })
}

/// Table named after the first FROM in a SELECT, for describing result
/// columns before parameters are bound.
fn select_table(sql: &str) -> Option<String> {
    let lower = sql.to_lowercase();
    let mut words = lower
        .split(|c: char| c.is_whitespace() || c == ';' || c == '(' || c == ')')
        .filter(|w| !w.is_empty());
    if words.next()? != "select" {
        return None;
    }
    words
        .skip_while(|w| *w != "from")
        .nth(1)
        .map(|t| t.trim_matches('"').to_string())
}

fn result_schema(sql: &str) -> Vec<FieldInfo> {
    select_table(sql).map(|t| table_schema(&t)).unwrap_or_default()
}

#[async_trait]
impl SimpleQueryHandler for QuorumHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct QuorumQueryParser;

#[async_trait]
impl QueryParser for QuorumQueryParser {
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
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for QuorumHandler {
    type Statement = String;
    type QueryParser = QuorumQueryParser;

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
        let sql = substitute_params(portal);
        self.run(&sql).await
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
/// Highest index first, so `$1` never clobbers the prefix of `$10`.
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

pub struct QuorumFactory {
    handler: Arc<QuorumHandler>,
    noop: Arc<NoopHandler>,
}

impl QuorumFactory {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            handler: Arc::new(QuorumHandler::new(engine)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for QuorumFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.noop.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, QuorumFactory::new(engine)).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for an engine failure.
fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) => "02000",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::Conflict { .. } => "23P01",
        EngineError::Invalid(_) => "22023",
        EngineError::LimitExceeded(_) | EngineError::WalError(_) => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::InvalidValue { .. } => "22023",
        _ => "42601",
    };
    user_error(code, e.to_string())
}
