//! Startup, authentication, cancellation, and connection lifecycle.
mod common;

use common::*;
use pglink::{Connection, ErrorKind, SessionState, TransactionStatus};
use tokio::io::AsyncReadExt;

#[test]
fn startup_reaches_idle() {
    run(async {
        let (conn, _server) = pair().await;

        assert_eq!(conn.state(), SessionState::Idle);
        assert_eq!(conn.transaction_status(), TransactionStatus::Idle);
        assert_eq!(conn.parameter("server_version"), Some("17.4"));

        let key = conn.backend_key().unwrap();
        assert_eq!(key.process_id, 42);
        assert_eq!(key.secret_key, 1234);
    });
}

#[test]
fn cleartext_password_authentication() {
    run(async {
        let (client_io, server_io) = tokio::io::duplex(1 << 16);

        let script = tokio::spawn(async move {
            let mut server = Server::new(server_io);
            server.read_startup().await;
            server.send(&auth_cleartext()).await;

            let body = server.expect(b'p').await;
            assert_eq!(body, b"sesame\0");

            server.send(&auth_ok()).await;
            server.send(&ready_for_query(b'I')).await;
        });

        let conn = Connection::startup(client_io, test_config()).await.unwrap();
        assert_eq!(conn.state(), SessionState::Idle);

        script.await.unwrap();
    });
}

#[test]
fn md5_password_authentication() {
    run(async {
        let (client_io, server_io) = tokio::io::duplex(1 << 16);

        let script = tokio::spawn(async move {
            let mut server = Server::new(server_io);
            server.read_startup().await;
            server.send(&auth_md5([0xde, 0xad, 0xbe, 0xef])).await;

            let body = server.expect(b'p').await;
            assert!(body.starts_with(b"md5"));
            // "md5" + 32 hex digits + nul
            assert_eq!(body.len(), 3 + 32 + 1);
            assert!(body[3..body.len() - 1].iter().all(u8::is_ascii_hexdigit));

            server.send(&auth_ok()).await;
            server.send(&ready_for_query(b'I')).await;
        });

        let conn = Connection::startup(client_io, test_config()).await.unwrap();
        assert_eq!(conn.state(), SessionState::Idle);

        script.await.unwrap();
    });
}

#[test]
fn unsupported_auth_method_is_rejected() {
    run(async {
        let (client_io, server_io) = tokio::io::duplex(1 << 16);

        let script = tokio::spawn(async move {
            let mut server = Server::new(server_io);
            server.read_startup().await;
            // Kerberos V5 (method code 2)
            let mut body = Vec::new();
            body.extend_from_slice(&[b'R', 0, 0, 0, 8]);
            body.extend_from_slice(&2u32.to_be_bytes());
            server.send(&body).await;
        });

        let err = Connection::startup(client_io, test_config()).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Auth(_)));

        script.await.unwrap();
    });
}

#[test]
fn cancel_token_writes_cancel_request() {
    run(async {
        let (conn, _server) = pair().await;
        let token = conn.cancel_token().unwrap();

        let (side_io, mut server_side) = tokio::io::duplex(1 << 10);
        token.cancel_with(side_io).await.unwrap();

        let mut frame = [0u8; 16];
        server_side.read_exact(&mut frame).await.unwrap();
        assert_eq!(&frame[..4], &16u32.to_be_bytes());
        assert_eq!(&frame[4..8], &((1234u32 << 16) | 5678).to_be_bytes());
        assert_eq!(&frame[8..12], &42u32.to_be_bytes());
        assert_eq!(&frame[12..16], &1234u32.to_be_bytes());
    });
}

#[test]
fn close_sends_terminate() {
    run(async {
        let (conn, mut server) = pair().await;

        let script = tokio::spawn(async move {
            let (msgtype, _) = server.read_frame().await;
            assert_eq!(msgtype, b'X');
        });

        conn.close().await.unwrap();

        script.await.unwrap();
    });
}

#[test]
fn protocol_violation_fails_the_connection() {
    run(async {
        let (mut conn, mut server) = pair().await;

        let script = tokio::spawn(async move {
            server.expect(b'Q').await;
            // an out-of-thin-air message type
            server.send(&[b'@', 0, 0, 0, 4]).await;
        });

        let err = conn.simple_query("SELECT 1").await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Protocol(_)));
        assert_eq!(conn.state(), SessionState::Failed);

        // a failed connection accepts nothing further
        let err = conn.simple_query("SELECT 1").await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Sequence(_)));

        script.await.unwrap();
    });
}

#[test]
fn truncated_length_fails_the_connection() {
    run(async {
        let (mut conn, mut server) = pair().await;

        let script = tokio::spawn(async move {
            server.expect(b'Q').await;
            // declared length below the 4 byte minimum
            server.send(&[b'C', 0, 0, 0, 2]).await;
        });

        let err = conn.simple_query("SELECT 1").await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Protocol(_)));
        assert_eq!(conn.state(), SessionState::Failed);

        script.await.unwrap();
    });
}

#[test]
fn notices_are_consumed_silently() {
    run(async {
        let (mut conn, mut server) = pair().await;

        let script = tokio::spawn(async move {
            server.expect(b'Q').await;
            server.send(&notice_response("there is no transaction in progress")).await;
            server.send(&command_complete("ROLLBACK")).await;
            server.send(&ready_for_query(b'I')).await;
        });

        conn.simple_query("ROLLBACK").await.unwrap();
        assert_eq!(conn.state(), SessionState::Idle);

        script.await.unwrap();
    });
}

#[test]
fn transaction_commit_and_rollback_on_drop() {
    run(async {
        let (mut conn, mut server) = pair().await;

        let script = tokio::spawn(async move {
            let body = server.expect(b'Q').await;
            assert_eq!(body, b"BEGIN\0");
            server.send(&command_complete("BEGIN")).await;
            server.send(&ready_for_query(b'T')).await;

            let body = server.expect(b'Q').await;
            assert_eq!(body, b"COMMIT\0");
            server.send(&command_complete("COMMIT")).await;
            server.send(&ready_for_query(b'I')).await;

            // second transaction dropped without commit
            let body = server.expect(b'Q').await;
            assert_eq!(body, b"BEGIN\0");
            server.send(&command_complete("BEGIN")).await;
            server.send(&ready_for_query(b'T')).await;

            let body = server.expect(b'Q').await;
            assert_eq!(body, b"ROLLBACK\0");
            server.send(&command_complete("ROLLBACK")).await;
            server.send(&ready_for_query(b'I')).await;

            server.expect(b'Q').await;
            server.send(&command_complete("SELECT 0")).await;
            server.send(&ready_for_query(b'I')).await;
        });

        let tx = conn.begin().await.unwrap();
        assert_eq!(tx.transaction_status(), TransactionStatus::InTransaction);
        tx.commit().await.unwrap();
        assert_eq!(conn.transaction_status(), TransactionStatus::Idle);

        let tx = conn.begin().await.unwrap();
        drop(tx);
        // the rollback drains on the next operation
        conn.simple_query("SELECT 1 WHERE false").await.unwrap();
        assert_eq!(conn.transaction_status(), TransactionStatus::Idle);

        script.await.unwrap();
    });
}
