//! End-to-end connector tests against a scripted mock backend

mod common;

use common::{MockServer, PROCESS_ID, SECRET_KEY};
use fraiseql_connector::auth::compute_proof;
use fraiseql_connector::protocol::{BackendMessage, FrontendMessage, TransactionStatus};
use fraiseql_connector::{
    ActionOptions, ClusterState, ConnectorContext, ConnectorId, ConnectorSource, ConnectorState,
    Connector, Error, Settings, SimpleQueryMessage, SslMode,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

const RANDOM_CODE: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

fn rows(results: &[SimpleQueryMessage]) -> Vec<Vec<Option<String>>> {
    results
        .iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(fields) => Some(
                fields
                    .iter()
                    .map(|f| f.as_ref().map(|b| String::from_utf8_lossy(b).to_string()))
                    .collect(),
            ),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_open_with_password_challenge() {
    let server = MockServer::bind().await;
    let settings = server.settings().build().unwrap();

    let script = server.serve(|mut be, _| async move {
        let params = be.read_startup().await;
        assert_eq!(params["user"], "app");
        assert_eq!(params["database"], "appdb");
        assert_eq!(params["client_encoding"], "UTF8");

        be.auth_sha256(RANDOM_CODE, "deadbeef", 4096).await;
        let proof = be.expect_password().await;
        assert_eq!(
            proof,
            compute_proof("secret", RANDOM_CODE, "deadbeef", 4096).unwrap()
        );
        be.auth_ok().await;
        be.finish_startup().await;
        be.expect_terminate().await;
    });

    let connector = Connector::open(settings).await.unwrap();
    assert_eq!(connector.state(), ConnectorState::Ready);
    assert_eq!(connector.transaction_status(), TransactionStatus::Idle);
    assert!(!connector.is_secure());

    let key = connector.backend_key().unwrap();
    assert_eq!((key.process_id, key.secret_key), (PROCESS_ID, SECRET_KEY));
    assert_eq!(connector.parameter("server_version").as_deref(), Some("16.2"));
    assert_eq!(connector.database_info().unwrap().major_version(), Some(16));

    connector.close().await.unwrap();
    assert_eq!(connector.state(), ConnectorState::Closed);
    script.await.unwrap();
}

#[tokio::test]
async fn test_password_provider_and_cleartext() {
    let server = MockServer::bind().await;
    let settings = Settings::builder()
        .host("127.0.0.1")
        .port(server.port)
        .user("app")
        .ssl_mode(SslMode::Disable)
        .password_provider(|req| {
            assert_eq!(req.user, "app");
            Ok("from-provider".to_string())
        })
        .build()
        .unwrap();

    let script = server.serve(|mut be, _| async move {
        be.read_startup().await;
        be.auth_cleartext().await;
        assert_eq!(be.expect_password().await, "from-provider");
        be.auth_ok().await;
        be.finish_startup().await;
        be.expect_terminate().await;
    });

    let connector = Connector::open(settings).await.unwrap();
    connector.close().await.unwrap();
    script.await.unwrap();
}

#[tokio::test]
async fn test_prefer_continues_in_plaintext_when_tls_declined() {
    let server = MockServer::bind().await;
    let settings = server.settings().ssl_mode(SslMode::Prefer).build().unwrap();

    let script = server.serve(|mut be, _| async move {
        let mut request = [0u8; 8];
        be.stream.read_exact(&mut request).await.unwrap();
        assert_eq!(&request[4..], &80877103i32.to_be_bytes());
        be.stream.write_all(b"N").await.unwrap();
        be.handshake().await;
        be.expect_terminate().await;
    });

    let connector = Connector::open(settings).await.unwrap();
    assert!(!connector.is_secure());
    connector.close().await.unwrap();
    script.await.unwrap();
}

#[tokio::test]
async fn test_allow_retries_with_tls_after_authorization_failure() {
    let server = MockServer::bind().await;
    let settings = server.settings().ssl_mode(SslMode::Allow).build().unwrap();

    let script = server.serve(|mut be, server| async move {
        // Plaintext first
        be.read_startup().await;
        be.auth_cleartext().await;
        be.expect_password().await;
        be.error("FATAL", "28P01", "no pg_hba.conf entry for host, SSL off")
            .await;

        let mut retry = server.accept().await;
        let mut request = [0u8; 8];
        retry.stream.read_exact(&mut request).await.unwrap();
        assert_eq!(&request[..4], &8i32.to_be_bytes());
        assert_eq!(&request[4..], &80877103i32.to_be_bytes());
        retry.stream.write_all(b"N").await.unwrap();
        retry.wait_closed().await;
    });

    let err = Connector::open(settings).await.unwrap_err();
    assert!(
        matches!(err, Error::Config(ref m) if m.contains("does not support TLS")),
        "got {err:?}"
    );
    script.await.unwrap();
}

#[tokio::test]
async fn test_allow_does_not_retry_other_failures() {
    let server = MockServer::bind().await;
    let settings = server.settings().ssl_mode(SslMode::Allow).build().unwrap();

    let script = server.serve(|mut be, _| async move {
        be.read_startup().await;
        be.auth_ok().await;
        be.error("FATAL", "3D000", "database \"appdb\" does not exist")
            .await;
        be.wait_closed().await;
    });

    let err = Connector::open(settings).await.unwrap_err();
    assert_eq!(err.sql_state(), Some("3D000"));
    script.await.unwrap();
}

#[tokio::test]
async fn test_authentication_failure_does_not_mark_server_offline() {
    let server = MockServer::bind().await;
    let port = server.port;
    let settings = server.settings().build().unwrap();
    let context = ConnectorContext::new();

    let script = server.serve(|mut be, _| async move {
        be.read_startup().await;
        be.auth_cleartext().await;
        be.expect_password().await;
        be.error("FATAL", "28P01", "password authentication failed for user \"app\"")
            .await;
    });

    let err = Connector::open_with(settings, context.clone())
        .await
        .unwrap_err();
    assert_eq!(err.sql_state(), Some("28P01"));
    assert_eq!(context.cluster.get("127.0.0.1", port), ClusterState::Unknown);
    script.await.unwrap();
}

#[tokio::test]
async fn test_unsupported_auth_request() {
    let server = MockServer::bind().await;
    let settings = server.settings().build().unwrap();

    let script = server.serve(|mut be, _| async move {
        be.read_startup().await;
        let mut body = 5i32.to_be_bytes().to_vec();
        body.extend_from_slice(&[1, 2, 3, 4]);
        be.send(b'R', &body).await;
        be.wait_closed().await;
    });

    let err = Connector::open(settings).await.unwrap_err();
    assert!(matches!(err, Error::NotSupported(ref m) if m.contains("type 5")));
    script.await.unwrap();
}

#[tokio::test]
async fn test_connection_refused_marks_server_offline() {
    let server = MockServer::bind().await;
    let port = server.port;
    let settings = server.settings().build().unwrap();
    drop(server);

    let context = ConnectorContext::new();
    let err = Connector::open_with(settings, context.clone())
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert_eq!(context.cluster.get("127.0.0.1", port), ClusterState::Offline);
}

#[tokio::test]
async fn test_error_mid_resultset_leaves_connector_ready() {
    let server = MockServer::bind().await;
    let settings = server.settings().build().unwrap();

    let script = server.serve(|mut be, _| async move {
        be.handshake().await;

        assert_eq!(be.expect_query().await, "SELECT 1/(2-n) FROM t");
        be.row_description(&["?column?"]).await;
        be.data_row(&[Some(&b"1"[..])]).await;
        be.error("ERROR", "22012", "division by zero").await;
        be.ready(b'I').await;

        assert_eq!(be.expect_query().await, "SELECT 1");
        be.single_value("1").await;
        be.expect_terminate().await;
    });

    let connector = Connector::open(settings).await.unwrap();

    let err = connector
        .simple_query("SELECT 1/(2-n) FROM t")
        .await
        .unwrap_err();
    assert_eq!(err.sql_state(), Some("22012"));
    assert_eq!(connector.state(), ConnectorState::Ready);

    let results = connector.simple_query("SELECT 1").await.unwrap();
    assert_eq!(rows(&results), vec![vec![Some("1".to_string())]]);
    assert!(matches!(
        results.last(),
        Some(SimpleQueryMessage::CommandComplete(tag)) if tag == "SELECT 1"
    ));

    connector.close().await.unwrap();
    script.await.unwrap();
}

#[tokio::test]
async fn test_notices_and_parameters_are_dispatched_out_of_band() {
    let server = MockServer::bind().await;
    let notices = Arc::new(AtomicUsize::new(0));
    let seen = notices.clone();
    let settings = server
        .settings()
        .notice_handler(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();

    let script = server.serve(|mut be, _| async move {
        be.handshake().await;
        be.expect_query().await;
        be.notice("table \"t\" does not exist, skipping").await;
        be.row_description(&["a"]).await;
        be.parameter_status("TimeZone", "UTC").await;
        be.data_row(&[None]).await;
        be.command_complete("SELECT 1").await;
        be.ready(b'I').await;
        be.expect_terminate().await;
    });

    let connector = Connector::open(settings).await.unwrap();
    let results = connector.simple_query("SELECT NULL").await.unwrap();
    assert_eq!(rows(&results), vec![vec![None]]);
    assert_eq!(notices.load(Ordering::SeqCst), 1);
    assert_eq!(connector.parameter("TimeZone").as_deref(), Some("UTC"));

    connector.close().await.unwrap();
    script.await.unwrap();
}

#[tokio::test]
async fn test_cooperative_cancel() {
    let server = MockServer::bind().await;
    let settings = server.settings().build().unwrap();

    let script = server.serve(|mut be, server| async move {
        be.handshake().await;
        assert_eq!(be.expect_query().await, "SELECT pg_sleep(10)");

        let mut cancel = server.accept().await;
        assert_eq!(cancel.read_cancel_request().await, (PROCESS_ID, SECRET_KEY));
        drop(cancel);

        be.error("ERROR", "57014", "canceling statement due to user request")
            .await;
        be.ready(b'I').await;

        assert_eq!(be.expect_query().await, "SELECT 1");
        be.single_value("1").await;
        be.expect_terminate().await;
    });

    let connector = Connector::open(settings).await.unwrap();
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = connector
        .simple_query_with("SELECT pg_sleep(10)", ActionOptions::with_cancel(token))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled), "got {err:?}");
    assert_eq!(connector.state(), ConnectorState::Ready);

    let results = connector.simple_query("SELECT 1").await.unwrap();
    assert_eq!(rows(&results).len(), 1);

    connector.close().await.unwrap();
    script.await.unwrap();
}

#[tokio::test]
async fn test_unsolicited_query_canceled_is_a_server_error() {
    let server = MockServer::bind().await;
    let settings = server.settings().build().unwrap();

    let script = server.serve(|mut be, _| async move {
        be.handshake().await;
        be.expect_query().await;
        be.error("ERROR", "57014", "canceling statement due to statement timeout")
            .await;
        be.ready(b'I').await;
        be.expect_terminate().await;
    });

    let connector = Connector::open(settings).await.unwrap();
    let err = connector.simple_query("SELECT 1").await.unwrap_err();
    assert!(matches!(err, Error::Server(_)));
    assert_eq!(err.sql_state(), Some("57014"));

    connector.close().await.unwrap();
    script.await.unwrap();
}

#[tokio::test]
async fn test_cancel_escalates_when_server_ignores_it() {
    let server = MockServer::bind().await;
    let settings = server.settings().build().unwrap();

    let script = server.serve(|mut be, server| async move {
        be.handshake().await;
        be.expect_query().await;
        let mut cancel = server.accept().await;
        cancel.read_cancel_request().await;
        drop(cancel);
        // Never answer; the client must give up and drop the connection
        be.wait_closed().await;
    });

    let connector = Connector::open(settings).await.unwrap();
    let token = CancellationToken::new();
    token.cancel();

    let err = connector
        .simple_query_with("SELECT pg_sleep(600)", ActionOptions::with_cancel(token))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled), "got {err:?}");
    assert_eq!(connector.state(), ConnectorState::Broken);
    assert!(matches!(connector.break_reason(), Some(Error::Cancelled)));

    let err = connector.simple_query("SELECT 1").await.unwrap_err();
    assert!(matches!(err, Error::Broken(ref inner) if matches!(**inner, Error::Cancelled)));
    script.await.unwrap();
}

#[tokio::test]
async fn test_timeout_without_server_side_cancel_breaks() {
    let server = MockServer::bind().await;
    let settings = server
        .settings()
        .command_timeout(Some(Duration::from_millis(100)))
        .server_side_cancel(false)
        .build()
        .unwrap();

    let script = server.serve(|mut be, _| async move {
        be.handshake().await;
        be.expect_query().await;
        be.wait_closed().await;
    });

    let connector = Connector::open(settings).await.unwrap();
    let err = connector.simple_query("SELECT pg_sleep(600)").await.unwrap_err();
    assert!(matches!(err, Error::Timeout));
    assert!(connector.is_broken());
    script.await.unwrap();
}

#[tokio::test]
async fn test_fatal_error_breaks_connector() {
    let server = MockServer::bind().await;
    let port = server.port;
    let settings = server.settings().build().unwrap();
    let context = ConnectorContext::new();

    let script = server.serve(|mut be, _| async move {
        be.handshake().await;
        be.expect_query().await;
        be.error(
            "FATAL",
            "57P01",
            "terminating connection due to administrator command",
        )
        .await;
        be.wait_closed().await;
    });

    let connector = Connector::open_with(settings, context.clone()).await.unwrap();
    assert_eq!(context.cluster.get("127.0.0.1", port), ClusterState::Online);

    let err = connector.simple_query("SELECT 1").await.unwrap_err();
    assert_eq!(err.sql_state(), Some("57P01"));
    assert!(connector.is_broken());
    assert_eq!(context.cluster.get("127.0.0.1", port), ClusterState::Offline);
    script.await.unwrap();
}

#[tokio::test]
async fn test_prepended_responses_are_isolated() {
    let server = MockServer::bind().await;
    let settings = server.settings().build().unwrap();

    let script = server.serve(|mut be, _| async move {
        be.handshake().await;

        assert_eq!(be.expect_query().await, "BEGIN");
        assert_eq!(be.expect_query().await, "SELECT 1");
        be.command_complete("BEGIN").await;
        be.ready(b'T').await;
        be.row_description(&["?column?"]).await;
        be.data_row(&[Some(&b"1"[..])]).await;
        be.command_complete("SELECT 1").await;
        be.ready(b'T').await;

        assert_eq!(be.expect_query().await, "ROLLBACK");
        assert_eq!(be.expect_query().await, "DISCARD ALL");
        assert_eq!(be.expect_query().await, "SELECT 2");
        // Rows inside prepended responses must never reach the caller
        be.row_description(&["stray"]).await;
        be.data_row(&[Some(&b"stray"[..])]).await;
        be.command_complete("ROLLBACK").await;
        be.ready(b'I').await;
        be.command_complete("DISCARD ALL").await;
        be.ready(b'I').await;
        be.single_value("2").await;
        be.expect_terminate().await;
    });

    let connector = Connector::open(settings).await.unwrap();

    connector.begin_transaction().await.unwrap();
    assert_eq!(connector.transaction_status(), TransactionStatus::Pending);
    let results = connector.simple_query("SELECT 1").await.unwrap();
    assert_eq!(rows(&results), vec![vec![Some("1".to_string())]]);
    assert_eq!(
        connector.transaction_status(),
        TransactionStatus::InTransactionBlock
    );

    connector.reset().await.unwrap();
    assert_eq!(connector.transaction_status(), TransactionStatus::Idle);
    let results = connector.simple_query("SELECT 2").await.unwrap();
    assert_eq!(rows(&results), vec![vec![Some("2".to_string())]]);
    assert_eq!(results.len(), 3);

    connector.close().await.unwrap();
    script.await.unwrap();
}

#[tokio::test]
async fn test_failed_prepended_command_breaks() {
    let server = MockServer::bind().await;
    let settings = server.settings().build().unwrap();

    let script = server.serve(|mut be, _| async move {
        be.handshake().await;
        assert_eq!(be.expect_query().await, "BEGIN");
        assert_eq!(be.expect_query().await, "SELECT 1");
        be.error("ERROR", "25001", "there is already a transaction in progress")
            .await;
        be.ready(b'E').await;
        be.wait_closed().await;
    });

    let connector = Connector::open(settings).await.unwrap();
    connector.begin_transaction().await.unwrap();
    let err = connector.simple_query("SELECT 1").await.unwrap_err();
    assert_eq!(err.sql_state(), Some("25001"));
    assert!(connector.is_broken());
    script.await.unwrap();
}

#[tokio::test]
async fn test_oversize_row_restores_arena() {
    let server = MockServer::bind().await;
    let settings = server.settings().read_buffer_size(64).build().unwrap();
    let big = vec![b'x'; 1000];
    let expected = big.clone();

    let script = server.serve(move |mut be, _| async move {
        be.handshake().await;
        be.expect_query().await;
        be.row_description(&["payload"]).await;
        be.data_row(&[Some(big.as_slice())]).await;
        be.command_complete("SELECT 1").await;
        be.ready(b'I').await;
        be.expect_terminate().await;
    });

    let connector = Connector::open(settings).await.unwrap();
    {
        let mut action = connector
            .start_user_action(ConnectorState::Executing, ActionOptions::default())
            .await
            .unwrap();
        let arena = action.read_buffer_id();
        action
            .send(&FrontendMessage::Query("SELECT payload".into()))
            .await
            .unwrap();

        assert!(matches!(
            action.read_message().await.unwrap(),
            BackendMessage::RowDescription(_)
        ));
        let header = match action.read_message().await.unwrap() {
            BackendMessage::DataRow(header) => header,
            other => panic!("expected DataRow, got {other:?}"),
        };
        assert_eq!(header.field_count, 1);
        {
            let row = action.data_row().await.unwrap();
            assert_eq!(row.get(0).unwrap(), Some(&expected[..]));
        }
        assert!(action.read_buffer_oversized());
        assert!(action.read_buffer_capacity() > 1000);

        assert!(matches!(
            action.read_message().await.unwrap(),
            BackendMessage::CommandComplete(_)
        ));
        assert!(!action.read_buffer_oversized());
        assert_eq!(action.read_buffer_id(), arena);
        assert!(matches!(
            action.read_message().await.unwrap(),
            BackendMessage::ReadyForQuery(TransactionStatus::Idle)
        ));
    }
    assert_eq!(connector.state(), ConnectorState::Ready);
    connector.close().await.unwrap();
    script.await.unwrap();
}

#[tokio::test]
async fn test_concurrent_user_actions_are_exclusive() {
    let server = MockServer::bind().await;
    let settings = server.settings().build().unwrap();

    let script = server.serve(|mut be, _| async move {
        be.handshake().await;
        be.expect_terminate().await;
    });

    let connector = Connector::open(settings).await.unwrap();
    let options = ActionOptions {
        command: Some("SELECT slow()".into()),
        ..ActionOptions::default()
    };
    let first = connector
        .start_user_action(ConnectorState::Executing, options)
        .await
        .unwrap();
    assert_eq!(connector.state(), ConnectorState::Executing);

    let err = connector
        .start_user_action(ConnectorState::Executing, ActionOptions::default())
        .await
        .unwrap_err();
    match err {
        Error::OperationInProgress { command } => {
            assert_eq!(command.as_deref(), Some("SELECT slow()"));
        }
        other => panic!("expected OperationInProgress, got {other:?}"),
    }

    drop(first);
    assert_eq!(connector.state(), ConnectorState::Ready);
    let second = connector
        .start_user_action(ConnectorState::Fetching, ActionOptions::default())
        .await
        .unwrap();
    drop(second);

    connector.close().await.unwrap();
    script.await.unwrap();
}

#[tokio::test]
async fn test_abandoned_response_is_drained_before_next_action() {
    let server = MockServer::bind().await;
    let settings = server.settings().build().unwrap();

    let script = server.serve(|mut be, _| async move {
        be.handshake().await;
        assert_eq!(be.expect_query().await, "SELECT 1");
        be.single_value("1").await;
        assert_eq!(be.expect_query().await, "SELECT 2");
        be.single_value("2").await;
        be.expect_terminate().await;
    });

    let connector = Connector::open(settings).await.unwrap();
    {
        let mut action = connector
            .start_user_action(ConnectorState::Executing, ActionOptions::default())
            .await
            .unwrap();
        action
            .send(&FrontendMessage::Query("SELECT 1".into()))
            .await
            .unwrap();
        // Dropped without reading the response
    }

    let results = connector.simple_query("SELECT 2").await.unwrap();
    assert_eq!(rows(&results), vec![vec![Some("2".to_string())]]);
    connector.close().await.unwrap();
    script.await.unwrap();
}

#[tokio::test]
async fn test_break_is_idempotent() {
    let server = MockServer::bind().await;
    let settings = server.settings().build().unwrap();

    let script = server.serve(|mut be, _| async move {
        be.handshake().await;
        be.wait_closed().await;
    });

    let connector = Connector::open(settings).await.unwrap();
    connector.break_connector(Error::Timeout);
    connector.break_connector(Error::ConnectionClosed);

    assert_eq!(connector.state(), ConnectorState::Broken);
    assert!(matches!(connector.break_reason(), Some(Error::Timeout)));
    assert!(connector.parameters().is_empty());

    let err = connector.simple_query("SELECT 1").await.unwrap_err();
    assert!(matches!(err, Error::Broken(ref inner) if matches!(**inner, Error::Timeout)));
    connector.close().await.unwrap();
    script.await.unwrap();
}

#[tokio::test]
async fn test_keepalive_probes_idle_connector() {
    let server = MockServer::bind().await;
    let settings = server
        .settings()
        .keepalive(Duration::from_millis(100))
        .build()
        .unwrap();

    let script = server.serve(|mut be, _| async move {
        be.handshake().await;
        let mut probes = 0;
        loop {
            match be.read_message().await {
                (b'S', _) => {
                    probes += 1;
                    be.ready(b'I').await;
                }
                (b'X', _) => return probes,
                (tag, _) => panic!("unexpected message {:?}", tag as char),
            }
        }
    });

    let connector = Connector::open(settings).await.unwrap();
    tokio::time::sleep(Duration::from_millis(450)).await;
    assert_eq!(connector.state(), ConnectorState::Ready);
    connector.close().await.unwrap();

    let probes = script.await.unwrap();
    assert!(probes >= 2, "only {probes} keepalive probes");
}

#[tokio::test]
async fn test_failed_keepalive_breaks_connector() {
    let server = MockServer::bind().await;
    let settings = server
        .settings()
        .keepalive(Duration::from_millis(50))
        .build()
        .unwrap();

    let script = server.serve(|mut be, _| async move {
        be.handshake().await;
        be.expect_sync().await;
        drop(be);
    });

    let connector = Connector::open(settings).await.unwrap();
    script.await.unwrap();
    for _ in 0..50 {
        if connector.is_broken() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(connector.is_broken());
    assert!(matches!(
        connector.break_reason(),
        Some(Error::ConnectionClosed | Error::Io(_))
    ));
}

#[tokio::test]
async fn test_wait_for_notification() {
    let server = MockServer::bind().await;
    let settings = server.settings().build().unwrap();

    let script = server.serve(|mut be, _| async move {
        be.handshake().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        be.notification("jobs", "42").await;
        be.expect_terminate().await;
    });

    let connector = Connector::open(settings).await.unwrap();
    let notification = connector
        .wait_for_notification(Some(Duration::from_secs(5)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notification.channel, "jobs");
    assert_eq!(notification.payload, "42");
    assert_eq!(notification.process_id, PROCESS_ID);

    let none = connector
        .wait_for_notification(Some(Duration::from_millis(50)))
        .await
        .unwrap();
    assert!(none.is_none());
    assert_eq!(connector.state(), ConnectorState::Ready);

    connector.close().await.unwrap();
    script.await.unwrap();
}

#[tokio::test]
async fn test_blocking_adapter() {
    let server = MockServer::bind().await;
    let settings = server.settings().build().unwrap();

    let script = server.serve(|mut be, _| async move {
        be.handshake().await;
        assert_eq!(be.expect_query().await, "SELECT 7");
        be.single_value("7").await;
        be.expect_terminate().await;
    });

    let client = std::thread::spawn(move || {
        let connector = fraiseql_connector::blocking::Connector::open(settings).unwrap();
        let results = connector.simple_query("SELECT 7").unwrap();
        connector.close().unwrap();
        rows(&results)
    });
    let rows = tokio::task::spawn_blocking(move || client.join().unwrap())
        .await
        .unwrap();
    assert_eq!(rows, vec![vec![Some("7".to_string())]]);
    script.await.unwrap();
}

async fn multiplexed_value(connector: &Connector, sql: &str) -> String {
    let mut response = connector.multiplexed_query(sql).await.unwrap();
    let mut value = None;
    loop {
        match response.read_message().await.unwrap() {
            BackendMessage::DataRow(_) => {
                let row = response.data_row().await.unwrap();
                value = row.get(0).unwrap().map(|v| String::from_utf8_lossy(v).to_string());
            }
            BackendMessage::ReadyForQuery(_) => break,
            _ => {}
        }
    }
    value.unwrap()
}

#[tokio::test]
async fn test_multiplexed_commands_get_their_own_responses() {
    let server = MockServer::bind().await;
    let settings = server.settings().multiplexing(true).build().unwrap();

    let script = server.serve(|mut be, _| async move {
        be.handshake().await;
        let first = be.expect_query().await;
        let second = be.expect_query().await;
        for sql in [first, second] {
            let value = sql.trim_start_matches("SELECT ").to_string();
            be.single_value(&value).await;
        }
        be.expect_terminate().await;
    });

    let connector = Arc::new(Connector::open(settings).await.unwrap());

    let err = connector
        .start_user_action(ConnectorState::Executing, ActionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));

    let (a, b) = tokio::join!(
        multiplexed_value(&connector, "SELECT 11"),
        multiplexed_value(&connector, "SELECT 22"),
    );
    assert_eq!(a, "11");
    assert_eq!(b, "22");

    for _ in 0..50 {
        if connector.in_flight() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(connector.in_flight(), 0);

    connector.close().await.unwrap();
    script.await.unwrap();
}

#[derive(Default)]
struct CountingSource {
    returned: AtomicUsize,
    cleared: AtomicUsize,
}

impl ConnectorSource for CountingSource {
    fn return_connector(&self, _id: ConnectorId) {
        self.returned.fetch_add(1, Ordering::SeqCst);
    }

    fn clear(&self) {
        self.cleared.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_idle_multiplexed_connector_returns_to_source() {
    let server = MockServer::bind().await;
    let settings = server.settings().multiplexing(true).build().unwrap();

    let script = server.serve(|mut be, _| async move {
        be.handshake().await;
        be.expect_query().await;
        be.single_value("5").await;
        be.expect_terminate().await;
    });

    let source = Arc::new(CountingSource::default());
    let context = ConnectorContext::new().with_source(source.clone());
    let connector = Connector::open_with(settings, context).await.unwrap();
    assert_eq!(source.returned.load(Ordering::SeqCst), 0);

    assert_eq!(multiplexed_value(&connector, "SELECT 5").await, "5");
    for _ in 0..50 {
        if source.returned.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(connector.in_flight(), 0);
    assert_eq!(source.returned.load(Ordering::SeqCst), 1);
    assert!(!connector.is_broken());

    connector.close().await.unwrap();
    script.await.unwrap();
}

#[tokio::test]
async fn test_server_loss_fails_every_queued_command() {
    let server = MockServer::bind().await;
    let settings = server.settings().multiplexing(true).build().unwrap();

    let script = server.serve(|mut be, _| async move {
        be.handshake().await;
        be.expect_query().await;
        be.expect_query().await;
        // Both commands are on the wire; the backend goes away
        drop(be);
    });

    let source = Arc::new(CountingSource::default());
    let context = ConnectorContext::new().with_source(source.clone());
    let connector = Arc::new(Connector::open_with(settings, context).await.unwrap());

    let (first, second) = tokio::join!(
        connector.multiplexed_query("SELECT 1"),
        connector.multiplexed_query("SELECT 2"),
    );
    for result in [first, second] {
        match result {
            Err(Error::Broken(inner)) => assert!(
                matches!(*inner, Error::ConnectionClosed | Error::Io(_)),
                "break reason {inner:?}"
            ),
            Err(other) => panic!("expected Broken, got {other:?}"),
            Ok(_) => panic!("expected Broken, got a response"),
        }
    }
    assert!(connector.is_broken());
    assert_eq!(connector.in_flight(), 0);
    assert_eq!(source.cleared.load(Ordering::SeqCst), 1);

    for _ in 0..50 {
        if source.returned.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(source.returned.load(Ordering::SeqCst) >= 1);
    script.await.unwrap();
}

#[tokio::test]
async fn test_multiplexed_write_abandoned_mid_flush_breaks() {
    let server = MockServer::bind().await;
    let settings = server.settings().multiplexing(true).build().unwrap();

    let script = server.serve(|mut be, _| async move {
        be.handshake().await;
        // Not reading lets the client's socket buffer fill up
        tokio::time::sleep(Duration::from_millis(500)).await;
        be.wait_closed().await;
    });

    let connector = Connector::open(settings).await.unwrap();

    let sql = format!("SELECT '{}'", "x".repeat(32 * 1024 * 1024));
    let abandoned =
        tokio::time::timeout(Duration::from_millis(200), connector.multiplexed_query(&sql)).await;
    assert!(abandoned.is_err(), "write should still be blocked");

    // Part of the query is on the wire; nothing may follow it
    assert!(connector.is_broken());
    assert!(matches!(connector.break_reason(), Some(Error::Cancelled)));
    let err = connector.multiplexed_query("SELECT 1").await.unwrap_err();
    assert!(matches!(err, Error::Broken(ref inner) if matches!(**inner, Error::Cancelled)));

    drop(connector);
    script.await.unwrap();
}
