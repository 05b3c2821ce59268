use std::net::SocketAddr;

use crate::sql::{Command, Query};

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "quorum_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "quorum_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "quorum_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "quorum_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "quorum_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "quorum_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (changes per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "quorum_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "quorum_wal_compactions_total";

// ── Scheduling ──────────────────────────────────────────────────

/// Counter: meetings proposed successfully.
pub const MEETINGS_CREATED_TOTAL: &str = "quorum_meetings_created_total";

/// Counter: proposals rejected because an invitee had a confirmed overlap.
pub const MEETING_CONFLICTS_TOTAL: &str = "quorum_meeting_conflicts_total";

/// Counter: meetings that reached unanimous acceptance.
pub const MEETINGS_SCHEDULED_TOTAL: &str = "quorum_meetings_scheduled_total";

/// Counter: recorded invitation answers. Labels: status.
pub const INVITATION_RESPONSES_TOTAL: &str = "quorum_invitation_responses_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertOrganization { .. } => "insert_organization",
        Command::InsertUser { .. } => "insert_user",
        Command::InsertEvent { .. } => "insert_event",
        Command::InsertParticipant { .. } => "insert_participant",
        Command::InsertMeeting { .. } => "insert_meeting",
        Command::InsertResponse { .. } => "insert_response",
        Command::Select(q) => match q {
            Query::Organizations => "select_organizations",
            Query::Users | Query::OrganizationUsers(_) | Query::EventParticipants(_) => "select_users",
            Query::Events | Query::OrganizationEvents(_) | Query::UserEvents(_) => "select_events",
            Query::Meetings | Query::Meeting(_) | Query::EventMeetings(_) | Query::UserMeetings(_) => {
                "select_meetings"
            }
            Query::MeetingInvitations(_) | Query::UserInvitations(_) => "select_invitations",
        },
    }
}
