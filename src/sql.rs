use sqlparser::ast::{self, Expr, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::InvitationResponse;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertOrganization {
        id: Ulid,
        name: String,
    },
    InsertUser {
        id: Ulid,
        organization_id: Ulid,
        name: String,
    },
    InsertEvent {
        id: Ulid,
        organization_id: Ulid,
        name: String,
    },
    InsertParticipant {
        event_id: Ulid,
        user_id: Ulid,
    },
    /// Times stay as wire strings; the engine owns their validation.
    InsertMeeting {
        id: Ulid,
        event_id: Ulid,
        start_time: String,
        end_time: String,
        invitee_ids: Vec<Ulid>,
    },
    InsertResponse {
        invitation_id: Ulid,
        response: InvitationResponse,
    },
    Select(Query),
}

/// A read, resolved from `SELECT * FROM <table> [WHERE <col> = <id>]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    Organizations,
    Users,
    OrganizationUsers(Ulid),
    EventParticipants(Ulid),
    Events,
    OrganizationEvents(Ulid),
    UserEvents(Ulid),
    Meetings,
    Meeting(Ulid),
    EventMeetings(Ulid),
    UserMeetings(Ulid),
    MeetingInvitations(Ulid),
    UserInvitations(Ulid),
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [stmt] => stmt,
        _ => {
            return Err(SqlError::Unsupported(format!(
                "{} statements in one query; send them one at a time",
                stmts.len()
            )));
        }
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let row = match table.as_str() {
        "organizations" => InsertRow::new(insert, "organizations", &["id", "name"])?,
        "users" => InsertRow::new(insert, "users", &["id", "organization_id", "name"])?,
        "events" => InsertRow::new(insert, "events", &["id", "organization_id", "name"])?,
        "event_participants" => InsertRow::new(insert, "event_participants", &["event_id", "user_id"])?,
        "meetings" => InsertRow::new(
            insert,
            "meetings",
            &["id", "event_id", "start_time", "end_time", "invitee_ids"],
        )?,
        "responses" => InsertRow::new(insert, "responses", &["invitation_id", "response"])?,
        _ => return Err(SqlError::UnknownTable(table)),
    };

    match row.table {
        "organizations" => Ok(Command::InsertOrganization {
            id: parse_ulid(row.get("id")?)?,
            name: parse_string(row.get("name")?)?,
        }),
        "users" => Ok(Command::InsertUser {
            id: parse_ulid(row.get("id")?)?,
            organization_id: parse_ulid(row.get("organization_id")?)?,
            name: parse_string(row.get("name")?)?,
        }),
        "events" => Ok(Command::InsertEvent {
            id: parse_ulid(row.get("id")?)?,
            organization_id: parse_ulid(row.get("organization_id")?)?,
            name: parse_string(row.get("name")?)?,
        }),
        "event_participants" => Ok(Command::InsertParticipant {
            event_id: parse_ulid(row.get("event_id")?)?,
            user_id: parse_ulid(row.get("user_id")?)?,
        }),
        "meetings" => Ok(Command::InsertMeeting {
            id: parse_ulid(row.get("id")?)?,
            event_id: parse_ulid(row.get("event_id")?)?,
            start_time: parse_string(row.get("start_time")?)?,
            end_time: parse_string(row.get("end_time")?)?,
            invitee_ids: parse_ulid_list(row.get("invitee_ids")?)?,
        }),
        _ => {
            let response = parse_string(row.get("response")?)?;
            Ok(Command::InsertResponse {
                invitation_id: parse_ulid(row.get("invitation_id")?)?,
                response: InvitationResponse::from_wire(&response).ok_or(SqlError::InvalidValue {
                    column: "response",
                    value: response,
                })?,
            })
        }
    }
}

/// One VALUES row keyed by column name. Without an explicit column list the
/// table's declared column order applies.
struct InsertRow {
    table: &'static str,
    columns: Vec<String>,
    values: Vec<Expr>,
}

impl InsertRow {
    fn new(insert: &ast::Insert, table: &'static str, declared: &[&str]) -> Result<Self, SqlError> {
        let rows = extract_insert_rows(insert)?;
        if rows.len() > 1 {
            return Err(SqlError::Unsupported(format!("multi-row INSERT into {table}")));
        }
        let values = rows.into_iter().next().unwrap_or_default();

        let columns: Vec<String> = if insert.columns.is_empty() {
            declared.iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if let Some(unknown) = columns.iter().find(|c| !declared.contains(&c.as_str())) {
            return Err(SqlError::UnknownColumn(table, unknown.clone()));
        }
        if columns.len() != values.len() {
            return Err(SqlError::WrongArity(table, columns.len(), values.len()));
        }
        Ok(Self {
            table,
            columns,
            values,
        })
    }

    fn get(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
            .ok_or(SqlError::MissingColumn(self.table, column))
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let filter = match &select.selection {
        Some(expr) => Some(extract_eq_filter(expr)?),
        None => None,
    };
    let by = |col: &str| match &filter {
        Some((c, id)) if c == col => Some(*id),
        _ => None,
    };
    let unsupported = || match &filter {
        Some((col, _)) => SqlError::UnsupportedFilter(table.clone(), col.clone()),
        None => SqlError::MissingFilter("meeting_id or user_id"),
    };

    let q = match table.as_str() {
        "organizations" => match filter {
            None => Query::Organizations,
            Some(_) => return Err(unsupported()),
        },
        "users" => match (&filter, by("organization_id"), by("event_id")) {
            (None, ..) => Query::Users,
            (_, Some(id), _) => Query::OrganizationUsers(id),
            (_, _, Some(id)) => Query::EventParticipants(id),
            _ => return Err(unsupported()),
        },
        "events" => match (&filter, by("organization_id"), by("user_id")) {
            (None, ..) => Query::Events,
            (_, Some(id), _) => Query::OrganizationEvents(id),
            (_, _, Some(id)) => Query::UserEvents(id),
            _ => return Err(unsupported()),
        },
        "meetings" => match (&filter, by("id"), by("event_id"), by("user_id")) {
            (None, ..) => Query::Meetings,
            (_, Some(id), ..) => Query::Meeting(id),
            (_, _, Some(id), _) => Query::EventMeetings(id),
            (.., Some(id)) => Query::UserMeetings(id),
            _ => return Err(unsupported()),
        },
        "invitations" => match (by("meeting_id"), by("user_id")) {
            (Some(id), _) => Query::MeetingInvitations(id),
            (_, Some(id)) => Query::UserInvitations(id),
            _ => return Err(unsupported()),
        },
        _ => return Err(SqlError::UnknownTable(table)),
    };
    Ok(Command::Select(q))
}

/// `<col> = <ulid>`; the only filter shape reads accept.
fn extract_eq_filter(expr: &Expr) -> Result<(String, Ulid), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_eq_filter(inner),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
            Ok((col, parse_ulid(right)?))
        }
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::DoubleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_str(s: &str) -> Result<Ulid, SqlError> {
    Ulid::from_string(s.trim()).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    parse_ulid_str(&parse_string(expr)?)
}

/// `ARRAY['a', 'b']`, a Postgres array literal `'{a,b}'`, or `'a,b'`.
fn parse_ulid_list(expr: &Expr) -> Result<Vec<Ulid>, SqlError> {
    if let Expr::Array(array) = expr {
        return array.elem.iter().map(parse_ulid).collect();
    }
    let s = parse_string(expr)?;
    let inner = s.trim();
    let inner = inner
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
        .unwrap_or(inner);
    inner
        .split(',')
        .map(|part| part.trim().trim_matches('"'))
        .filter(|part| !part.is_empty())
        .map(parse_ulid_str)
        .collect()
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    MissingColumn(&'static str, &'static str),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    UnsupportedFilter(String, String),
    InvalidValue { column: &'static str, value: String },
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::UnsupportedFilter(t, c) => write!(f, "{t}: cannot filter by {c}"),
            SqlError::InvalidValue { column, value } => {
                write!(f, "invalid value for {column}: {value:?}")
            }
        }
    }
}

impl std::error::Error for SqlError {}
