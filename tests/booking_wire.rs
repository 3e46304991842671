use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, stream};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, Client, Config as PgConfig, NoTls, Notification, SimpleQueryMessage};
use ulid::Ulid;

use slotd::clock::SystemClock;
use slotd::config::Config;
use slotd::ratelimit::WindowPolicy;
use slotd::tenant::TenantManager;
use slotd::wire;

/// 2030-06-03 (Monday) 09:00 UTC. Far enough out that min notice never bites.
const MON_9AM: i64 = 1_906_707_600_000;
const MIN: i64 = 60_000;
const DATE: &str = "2030-06-03";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server(tweak: impl FnOnce(&mut Config)) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("slotd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let mut cfg = Config {
        data_dir: dir,
        token_secret: b"integration-test-secret".to_vec(),
        ..Config::default()
    };
    tweak(&mut cfg);
    let tm = Arc::new(TenantManager::new(&cfg, Arc::new(SystemClock)));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "slotd".to_string(), None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr, user: &str) -> (Client, mpsc::UnboundedReceiver<Notification>) {
    let mut config = PgConfig::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("test")
        .user(user)
        .password("slotd");

    let (client, mut connection) = config.connect(NoTls).await.unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let stream = stream::poll_fn(move |cx| connection.poll_message(cx));
        futures::pin_mut!(stream);
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(AsyncMessage::Notification(n)) => {
                    let _ = tx.send(n);
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    (client, rx)
}

async fn recv_notification(
    rx: &mut mpsc::UnboundedReceiver<Notification>,
    timeout: Duration,
) -> Option<Notification> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

/// Data rows of a simple query as column-name → text lookups.
async fn rows(client: &Client, sql: &str) -> Vec<tokio_postgres::SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn sqlstate(client: &Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.code().map(|c| c.code().to_string()).unwrap_or_default()
}

async fn create_host(client: &Client) -> Ulid {
    let host = Ulid::new();
    client
        .batch_execute(&format!(
            r#"INSERT INTO profiles (host_id, timezone, working_hours, slot_minutes, calendars, reminders)
               VALUES ('{host}', 'UTC', '{{"mon": ["09:00-17:00"]}}', 30, 'work', '60')"#
        ))
        .await
        .unwrap();
    host
}

fn book_sql(host: Ulid, start: i64, email: &str) -> String {
    format!(
        r#"INSERT INTO bookings (host_id, start, "end", guest_name, guest_email)
           VALUES ('{host}', {start}, {end}, 'Ada', '{email}')"#,
        end = start + 30 * MIN
    )
}

fn reschedule_sql(id: &str, token: &str, start: i64) -> String {
    format!(
        r#"INSERT INTO reschedules (booking_id, token, start, "end")
           VALUES ('{id}', '{token}', {start}, {end})"#,
        end = start + 30 * MIN
    )
}

fn availability_sql(host: Ulid) -> String {
    format!("SELECT * FROM availability WHERE host_id = '{host}' AND date = '{DATE}'")
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn booking_lifecycle_over_wire() {
    let addr = start_test_server(|_| {}).await;
    let (client, _rx) = connect(addr, "host_console").await;
    let host = create_host(&client).await;

    let slots = rows(&client, &availability_sql(host)).await;
    assert_eq!(slots.len(), 16);
    assert_eq!(slots[0].get("start"), Some(MON_9AM.to_string().as_str()));
    assert_eq!(slots[0].get("start_local"), Some("2030-06-03T09:00:00+00:00"));
    assert_eq!(slots[0].get("unknown_sources"), None);

    let receipt = rows(&client, &book_sql(host, MON_9AM, "ada@example.com")).await;
    assert_eq!(receipt.len(), 1);
    let id = receipt[0].get("id").unwrap().to_string();
    let cancel_token = receipt[0].get("cancel_token").unwrap().to_string();
    let reschedule_token = receipt[0].get("reschedule_token").unwrap().to_string();
    assert_eq!(receipt[0].get("status"), Some("confirmed"));
    assert_eq!(receipt[0].get("mirror_status"), Some("mirrored"));

    assert_eq!(rows(&client, &availability_sql(host)).await.len(), 15);

    let moved = rows(&client, &reschedule_sql(&id, &reschedule_token, MON_9AM + 120 * MIN)).await;
    assert_eq!(moved[0].get("reschedule_count"), Some("1"));
    assert_ne!(moved[0].get("reschedule_token"), Some(reschedule_token.as_str()));

    // The rotated-out token is spent
    assert_eq!(
        sqlstate(&client, &reschedule_sql(&id, &reschedule_token, MON_9AM + 180 * MIN)).await,
        "55000"
    );

    let booking = rows(&client, &format!("SELECT * FROM bookings WHERE id = '{id}'")).await;
    assert_eq!(booking[0].get("start"), Some((MON_9AM + 120 * MIN).to_string().as_str()));
    assert_eq!(booking[0].get("source"), Some("direct"));

    client
        .batch_execute(&format!(
            "DELETE FROM bookings WHERE id = '{id}' AND token = '{cancel_token}'"
        ))
        .await
        .unwrap();

    let active = rows(
        &client,
        &format!("SELECT * FROM bookings WHERE host_id = '{host}' AND active = true"),
    )
    .await;
    assert!(active.is_empty());
    assert_eq!(rows(&client, &availability_sql(host)).await.len(), 16);
}

#[tokio::test]
async fn errors_carry_sqlstate() {
    let addr = start_test_server(|_| {}).await;
    let (client, _rx) = connect(addr, "host_console").await;
    let host = create_host(&client).await;

    let receipt = rows(&client, &book_sql(host, MON_9AM, "ada@example.com")).await;
    let id = receipt[0].get("id").unwrap().to_string();

    // Taken slot
    assert_eq!(sqlstate(&client, &book_sql(host, MON_9AM, "bob@example.com")).await, "40001");
    // Forged token
    assert_eq!(
        sqlstate(&client, &format!("DELETE FROM bookings WHERE id = '{id}' AND token = 'nope'")).await,
        "42501"
    );
    // Unknown booking
    assert_eq!(
        sqlstate(&client, &format!("SELECT * FROM bookings WHERE id = '{}'", Ulid::new())).await,
        "P0002"
    );
    // Unparseable
    assert_eq!(sqlstate(&client, "SELEC nonsense").await, "42601");
    assert_eq!(sqlstate(&client, "SELECT * FROM resources").await, "42601");
}

#[tokio::test]
async fn event_types_shape_availability() {
    let addr = start_test_server(|_| {}).await;
    let (client, _rx) = connect(addr, "host_console").await;
    let host = create_host(&client).await;

    client
        .batch_execute(&format!(
            "INSERT INTO event_types (id, host_id, slug, title, duration_minutes, buffer_minutes)
             VALUES ('{}', '{host}', 'deep-dive', 'Deep dive', 60, 15)",
            Ulid::new()
        ))
        .await
        .unwrap();

    let listed = rows(&client, &format!("SELECT * FROM event_types WHERE host_id = '{host}'")).await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("slug"), Some("deep-dive"));
    assert_eq!(listed[0].get("duration_minutes"), Some("60"));

    let slots = rows(
        &client,
        &format!("{} AND event_type = 'deep-dive'", availability_sql(host)),
    )
    .await;
    assert_eq!(slots.len(), 6);
}

#[tokio::test]
async fn anonymous_callers_are_rate_limited() {
    let addr = start_test_server(|cfg| {
        cfg.rate_policies.anonymous = WindowPolicy {
            window_ms: 86_400_000,
            quota: 3,
        };
    })
    .await;
    let (console, _rx) = connect(addr, "host_console").await;
    let host = create_host(&console).await;

    let (guest, _rx) = connect(addr, "guest").await;
    for _ in 0..3 {
        rows(&guest, &availability_sql(host)).await;
    }
    assert_eq!(sqlstate(&guest, &availability_sql(host)).await, "53400");

    // The peek is free and reports the exhausted window
    let status = rows(&guest, "SELECT * FROM rate_limit WHERE endpoint = 'select_availability'").await;
    assert_eq!(status[0].get("class"), Some("anonymous"));
    assert_eq!(status[0].get("remaining"), Some("0"));
    assert_eq!(status[0].get("allowed"), Some("f"));

    // Other classes keep their own windows
    assert_eq!(rows(&console, &availability_sql(host)).await.len(), 16);
}

#[tokio::test]
async fn listener_receives_booking_notices() {
    let addr = start_test_server(|_| {}).await;
    let (listener, mut rx) = connect(addr, "host_console").await;
    let host = create_host(&listener).await;
    listener.batch_execute(&format!("LISTEN host_{host}")).await.unwrap();

    let (booker, _rx) = connect(addr, "agent-scheduler").await;
    let receipt = rows(&booker, &book_sql(host, MON_9AM, "ada@example.com")).await;
    let id = receipt[0].get("id").unwrap().to_string();

    // Notices go out at the listener's next statement
    listener.simple_query("SELECT 1").await.unwrap();
    let n = recv_notification(&mut rx, Duration::from_secs(2)).await.unwrap();
    assert_eq!(n.channel(), format!("host_{host}"));
    let payload: serde_json::Value = serde_json::from_str(n.payload()).unwrap();
    assert_eq!(payload["event"], "created");
    assert_eq!(payload["booking_id"], id.as_str());
    assert_eq!(payload["reminders"][0], 60);
    // Guest tokens only travel in the booker's receipt
    assert!(payload.get("cancel_token").is_none());
    assert!(payload.get("reschedule_token").is_none());
    let cancel_token = receipt[0].get("cancel_token").unwrap();
    assert!(!n.payload().contains(cancel_token));

    let booking = rows(&listener, &format!("SELECT * FROM bookings WHERE id = '{id}'")).await;
    assert_eq!(booking[0].get("source"), Some("automated-agent"));

    listener.batch_execute(&format!("UNLISTEN host_{host}")).await.unwrap();
    rows(&booker, &book_sql(host, MON_9AM + 60 * MIN, "bob@example.com")).await;
    listener.simple_query("SELECT 1").await.unwrap();
    assert!(recv_notification(&mut rx, Duration::from_millis(200)).await.is_none());
}

#[tokio::test]
async fn anonymous_callers_cannot_act_for_the_host() {
    let addr = start_test_server(|_| {}).await;
    let (console, _rx) = connect(addr, "host_console").await;
    let host = create_host(&console).await;
    let receipt = rows(&console, &book_sql(host, MON_9AM, "ada@example.com")).await;
    let id = receipt[0].get("id").unwrap().to_string();

    let (eve, _rx) = connect(addr, "eve").await;
    assert_eq!(sqlstate(&eve, &format!("LISTEN host_{host}")).await, "42501");
    assert_eq!(
        sqlstate(
            &eve,
            &format!(
                "INSERT INTO profiles (host_id, timezone, working_hours, slot_minutes)
                 VALUES ('{host}', 'UTC', '{{}}', 30)"
            )
        )
        .await,
        "42501"
    );
    assert_eq!(
        sqlstate(&eve, &format!("SELECT * FROM bookings WHERE host_id = '{host}'")).await,
        "42501"
    );
    assert_eq!(
        sqlstate(&eve, &format!("SELECT * FROM bookings WHERE id = '{id}'")).await,
        "42501"
    );

    let (agent, _rx) = connect(addr, "agent-scheduler").await;
    assert_eq!(
        sqlstate(&agent, &format!("INSERT INTO confirmations (booking_id) VALUES ('{id}')")).await,
        "42501"
    );
    agent.batch_execute(&format!("LISTEN host_{host}")).await.unwrap();

    // The host's working hours are untouched
    assert_eq!(rows(&eve, &availability_sql(host)).await.len(), 15);
}

#[tokio::test]
async fn listen_rejects_bad_channel() {
    let addr = start_test_server(|_| {}).await;
    let (client, _rx) = connect(addr, "host_console").await;
    assert_eq!(sqlstate(&client, "LISTEN resource_42").await, "42000");
}

#[tokio::test]
async fn tenants_are_isolated_by_database() {
    let addr = start_test_server(|_| {}).await;
    let (a, _rx) = connect(addr, "host_console").await;
    let host = create_host(&a).await;
    rows(&a, &book_sql(host, MON_9AM, "ada@example.com")).await;

    let mut config = PgConfig::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("other")
        .user("host_console")
        .password("slotd");
    let (b, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(connection);

    // Host profile lives in tenant "test" only
    assert_eq!(sqlstate(&b, &availability_sql(host)).await, "P0002");
}
