use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use quorum::engine::Engine;
use quorum::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server_at(wal_path: PathBuf) -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let engine = Arc::new(Engine::new(wal_path).unwrap());

    let server_engine = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = server_engine.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, None).await;
            });
        }
    });

    (addr, engine)
}

fn temp_wal() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("quorum_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join("quorum.wal")
}

async fn start_test_server() -> SocketAddr {
    start_test_server_at(temp_wal()).await.0
}

async fn connect(addr: SocketAddr) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("quorum")
        .user("quorum");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn col<'a>(row: &'a SimpleQueryRow, name: &str) -> &'a str {
    row.get(name).unwrap()
}

async fn sqlstate(client: &Client, sql: &str) -> SqlState {
    let err = client.batch_execute(sql).await.unwrap_err();
    err.code().cloned().unwrap_or_else(|| panic!("no SQLSTATE for {err}"))
}

struct Directory {
    org: Ulid,
    event: Ulid,
    users: Vec<Ulid>,
}

async fn seed(client: &Client, n_users: usize) -> Directory {
    let org = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO organizations (id, name) VALUES ('{org}', 'Organization 1')"
        ))
        .await
        .unwrap();
    let event = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO events (id, organization_id, name) VALUES ('{event}', '{org}', 'Event 1')"
        ))
        .await
        .unwrap();
    let mut users = Vec::new();
    for i in 0..n_users {
        let uid = Ulid::new();
        client
            .batch_execute(&format!(
                "INSERT INTO users (id, organization_id, name) VALUES ('{uid}', '{org}', 'User {}')",
                i + 1
            ))
            .await
            .unwrap();
        client
            .batch_execute(&format!(
                "INSERT INTO event_participants (event_id, user_id) VALUES ('{event}', '{uid}')"
            ))
            .await
            .unwrap();
        users.push(uid);
    }
    Directory { org, event, users }
}

async fn propose(client: &Client, dir: &Directory, start: &str, end: &str, invitees: &[Ulid]) -> Result<Ulid, tokio_postgres::Error> {
    let id = Ulid::new();
    let list: Vec<String> = invitees.iter().map(|u| format!("'{u}'")).collect();
    client
        .batch_execute(&format!(
            "INSERT INTO meetings (id, event_id, start_time, end_time, invitee_ids) \
             VALUES ('{id}', '{}', '{start}', '{end}', ARRAY[{}])",
            dir.event,
            list.join(", ")
        ))
        .await?;
    Ok(id)
}

async fn respond(client: &Client, invitation: &str, response: &str) {
    client
        .batch_execute(&format!(
            "INSERT INTO responses (invitation_id, response) VALUES ('{invitation}', '{response}')"
        ))
        .await
        .unwrap();
}

async fn invitation_ids(client: &Client, meeting: Ulid) -> Vec<String> {
    rows(client, &format!("SELECT * FROM invitations WHERE meeting_id = '{meeting}'"))
        .await
        .iter()
        .map(|r| col(r, "id").to_string())
        .collect()
}

async fn scheduled(client: &Client, meeting: Ulid) -> bool {
    let found = rows(client, &format!("SELECT * FROM meetings WHERE id = '{meeting}'")).await;
    assert_eq!(found.len(), 1);
    col(&found[0], "scheduled") == "t"
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn full_scheduling_flow() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let dir = seed(&client, 2).await;

    let mid = propose(&client, &dir, "2023-03-22T14:30:00", "2023-03-22T16:30:00", &dir.users)
        .await
        .unwrap();

    let meeting = rows(&client, &format!("SELECT * FROM meetings WHERE id = '{mid}'")).await;
    assert_eq!(col(&meeting[0], "event_id"), dir.event.to_string());
    assert_eq!(col(&meeting[0], "start_time"), "2023-03-22T14:30:00");
    assert_eq!(col(&meeting[0], "end_time"), "2023-03-22T16:30:00");
    assert_eq!(col(&meeting[0], "scheduled"), "f");
    let participants: Vec<String> = serde_json::from_str(col(&meeting[0], "participant_ids")).unwrap();
    assert_eq!(
        participants,
        dir.users.iter().map(|u| u.to_string()).collect::<Vec<_>>()
    );

    let invitations = rows(&client, &format!("SELECT * FROM invitations WHERE meeting_id = '{mid}'")).await;
    assert_eq!(invitations.len(), 2);
    assert!(invitations.iter().all(|r| col(r, "status") == "pending"));

    let invs = invitation_ids(&client, mid).await;
    respond(&client, &invs[0], "accept").await;
    assert!(!scheduled(&client, mid).await);
    respond(&client, &invs[1], "accept").await;
    assert!(scheduled(&client, mid).await);

    let statuses: Vec<String> = rows(&client, &format!("SELECT * FROM invitations WHERE meeting_id = '{mid}'"))
        .await
        .iter()
        .map(|r| col(r, "status").to_string())
        .collect();
    assert_eq!(statuses, vec!["accepted", "accepted"]);
}

#[tokio::test]
async fn conflicting_proposal_is_rejected() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let dir = seed(&client, 2).await;

    let first = propose(&client, &dir, "2023-03-22T10:00:00", "2023-03-22T11:00:00", &dir.users)
        .await
        .unwrap();
    for inv in invitation_ids(&client, first).await {
        respond(&client, &inv, "accept").await;
    }

    let overlap = format!(
        "INSERT INTO meetings (id, event_id, start_time, end_time, invitee_ids) \
         VALUES ('{}', '{}', '2023-03-22T10:30:00', '2023-03-22T11:30:00', ARRAY['{}'])",
        Ulid::new(),
        dir.event,
        dir.users[1]
    );
    assert_eq!(sqlstate(&client, &overlap).await, SqlState::EXCLUSION_VIOLATION);

    // Touching the end is fine
    propose(&client, &dir, "2023-03-22T11:00:00", "2023-03-22T12:00:00", &dir.users)
        .await
        .unwrap();

    let user_invitations = rows(
        &client,
        &format!("SELECT * FROM invitations WHERE user_id = '{}'", dir.users[1]),
    )
    .await;
    assert_eq!(user_invitations.len(), 2);
}

#[tokio::test]
async fn rejection_keeps_meeting_tentative() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let dir = seed(&client, 3).await;

    let mid = propose(&client, &dir, "2023-03-22T09:00:00", "2023-03-22T10:00:00", &dir.users)
        .await
        .unwrap();
    let invs = invitation_ids(&client, mid).await;
    respond(&client, &invs[0], "accept").await;
    respond(&client, &invs[1], "reject").await;
    respond(&client, &invs[2], "accept").await;
    assert!(!scheduled(&client, mid).await);

    // Tentative meetings never block
    propose(&client, &dir, "2023-03-22T09:30:00", "2023-03-22T10:30:00", &dir.users)
        .await
        .unwrap();
}

#[tokio::test]
async fn validation_errors() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let dir = seed(&client, 1).await;
    let user = dir.users[0];

    let bad_time = format!(
        "INSERT INTO meetings (id, event_id, start_time, end_time, invitee_ids) \
         VALUES ('{}', '{}', 'tomorrow', '2023-03-22T11:00:00', ARRAY['{user}'])",
        Ulid::new(),
        dir.event
    );
    assert_eq!(sqlstate(&client, &bad_time).await, SqlState::INVALID_PARAMETER_VALUE);

    let inverted = format!(
        "INSERT INTO meetings (id, event_id, start_time, end_time, invitee_ids) \
         VALUES ('{}', '{}', '2023-03-22T11:00:00', '2023-03-22T10:00:00', ARRAY['{user}'])",
        Ulid::new(),
        dir.event
    );
    assert_eq!(sqlstate(&client, &inverted).await, SqlState::INVALID_PARAMETER_VALUE);

    let mid = propose(&client, &dir, "2023-03-22T10:00:00", "2023-03-22T11:00:00", &[user])
        .await
        .unwrap();
    let inv = &invitation_ids(&client, mid).await[0];
    let maybe = format!("INSERT INTO responses (invitation_id, response) VALUES ('{inv}', 'maybe')");
    assert_eq!(sqlstate(&client, &maybe).await, SqlState::INVALID_PARAMETER_VALUE);

    let unknown_event = format!(
        "INSERT INTO meetings (id, event_id, start_time, end_time, invitee_ids) \
         VALUES ('{}', '{}', '2023-03-22T12:00:00', '2023-03-22T13:00:00', ARRAY['{user}'])",
        Ulid::new(),
        Ulid::new()
    );
    assert_eq!(sqlstate(&client, &unknown_event).await, SqlState::NO_DATA);

    let duplicate = format!("INSERT INTO organizations (id, name) VALUES ('{}', 'again')", dir.org);
    assert_eq!(sqlstate(&client, &duplicate).await, SqlState::UNIQUE_VIOLATION);

    assert_eq!(sqlstate(&client, "SELEKT * FROM meetings").await, SqlState::SYNTAX_ERROR);
}

#[tokio::test]
async fn directory_queries() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let dir = seed(&client, 3).await;

    let orgs = rows(&client, "SELECT * FROM organizations").await;
    assert_eq!(orgs.len(), 1);
    assert_eq!(col(&orgs[0], "name"), "Organization 1");

    let users = rows(
        &client,
        &format!("SELECT * FROM users WHERE organization_id = '{}'", dir.org),
    )
    .await;
    let names: Vec<&str> = users.iter().map(|r| col(r, "name")).collect();
    assert_eq!(names, vec!["User 1", "User 2", "User 3"]);

    let participants = rows(&client, &format!("SELECT * FROM users WHERE event_id = '{}'", dir.event)).await;
    assert_eq!(participants.len(), 3);

    let events = rows(
        &client,
        &format!("SELECT * FROM events WHERE user_id = '{}'", dir.users[0]),
    )
    .await;
    assert_eq!(events.len(), 1);
    assert_eq!(col(&events[0], "id"), dir.event.to_string());

    propose(&client, &dir, "2023-03-22T10:00:00", "2023-03-22T11:00:00", &dir.users[..2])
        .await
        .unwrap();
    let event_meetings = rows(
        &client,
        &format!("SELECT * FROM meetings WHERE event_id = '{}'", dir.event),
    )
    .await;
    assert_eq!(event_meetings.len(), 1);
    let third_user_meetings = rows(
        &client,
        &format!("SELECT * FROM meetings WHERE user_id = '{}'", dir.users[2]),
    )
    .await;
    assert!(third_user_meetings.is_empty());
}

#[tokio::test]
async fn extended_protocol_parameters() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let dir = seed(&client, 2).await;

    let mid = Ulid::new();
    let invitees = format!("{},{}", dir.users[0], dir.users[1]);
    client
        .execute(
            "INSERT INTO meetings (id, event_id, start_time, end_time, invitee_ids) VALUES ($1, $2, $3, $4, $5)",
            &[
                &mid.to_string(),
                &dir.event.to_string(),
                &"2023-03-22T14:30:00",
                &"2023-03-22T16:30:00",
                &invitees,
            ],
        )
        .await
        .unwrap();

    let found = client
        .query("SELECT * FROM meetings WHERE id = $1", &[&mid.to_string()])
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    let start: String = found[0].get("start_time");
    let participants: String = found[0].get("participant_ids");
    assert_eq!(start, "2023-03-22T14:30:00");
    assert!(participants.contains(&dir.users[1].to_string()));
    assert!(!scheduled(&client, mid).await);

    let invs = client
        .query("SELECT * FROM invitations WHERE meeting_id = $1", &[&mid.to_string()])
        .await
        .unwrap();
    assert_eq!(invs.len(), 2);
    for inv in &invs {
        let id: String = inv.get("id");
        client
            .execute(
                "INSERT INTO responses (invitation_id, response) VALUES ($1, $2)",
                &[&id, &"accept"],
            )
            .await
            .unwrap();
    }
    assert!(scheduled(&client, mid).await);
}

#[tokio::test]
async fn state_survives_restart() {
    let wal = temp_wal();
    let (addr, engine) = start_test_server_at(wal.clone()).await;
    let client = connect(addr).await;
    let dir = seed(&client, 2).await;
    let mid = propose(&client, &dir, "2023-03-22T10:00:00", "2023-03-22T11:00:00", &dir.users)
        .await
        .unwrap();
    for inv in invitation_ids(&client, mid).await {
        respond(&client, &inv, "accept").await;
    }
    engine.compact_wal().await.unwrap();
    let later = propose(&client, &dir, "2023-03-22T12:00:00", "2023-03-22T13:00:00", &dir.users)
        .await
        .unwrap();
    drop(client);

    let (addr2, _engine2) = start_test_server_at(wal).await;
    let client2 = connect(addr2).await;
    assert!(scheduled(&client2, mid).await);
    assert!(!scheduled(&client2, later).await);

    let overlap = format!(
        "INSERT INTO meetings (id, event_id, start_time, end_time, invitee_ids) \
         VALUES ('{}', '{}', '2023-03-22T10:30:00', '2023-03-22T11:30:00', ARRAY['{}'])",
        Ulid::new(),
        dir.event,
        dir.users[0]
    );
    assert_eq!(sqlstate(&client2, &overlap).await, SqlState::EXCLUSION_VIOLATION);
}
