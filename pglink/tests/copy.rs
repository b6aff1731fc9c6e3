//! COPY sub-protocol: bulk load, bulk unload, aborts, and local rejection.
mod common;

use common::*;
use pglink::{ErrorKind, SessionState};

#[test]
fn copy_in_streams_and_commits() {
    run(async {
        let (mut conn, mut server) = pair().await;

        let script = tokio::spawn(async move {
            let body = server.expect(b'Q').await;
            assert_eq!(body, b"COPY foo FROM STDIN\0");
            server.send(&copy_in_response(2)).await;

            for expected in [b"1\tbar\n".as_slice(), b"2\tbaz\n", b"3\tqux\n"] {
                let (msgtype, chunk) = server.read_frame().await;
                assert_eq!(msgtype, b'd');
                assert_eq!(chunk, expected);
            }
            let (msgtype, _) = server.read_frame().await;
            assert_eq!(msgtype, b'c');

            server.send(&command_complete("COPY 3")).await;
            server.send(&ready_for_query(b'I')).await;
        });

        let mut copy = conn.copy_in("COPY foo FROM STDIN").await.unwrap();
        copy.send(b"1\tbar\n").await.unwrap();
        copy.send(b"2\tbaz\n").await.unwrap();
        copy.send(b"3\tqux\n").await.unwrap();
        let rows = copy.finish().await.unwrap();

        assert_eq!(rows, 3);
        assert_eq!(conn.state(), SessionState::Idle);

        script.await.unwrap();
    });
}

#[test]
fn copy_in_source_failure_surfaces_server_error() {
    run(async {
        let (mut conn, mut server) = pair().await;

        let script = tokio::spawn(async move {
            server.expect(b'Q').await;
            server.send(&copy_in_response(2)).await;

            for _ in 0..3 {
                let (msgtype, _) = server.read_frame().await;
                assert_eq!(msgtype, b'd');
            }
            // CopyFail instead of CopyDone: nothing is committed
            let (msgtype, reason) = server.read_frame().await;
            assert_eq!(msgtype, b'f');
            assert_eq!(reason, b"source failed\0");

            server.send(&error_response("57014", "COPY from stdin failed: source failed")).await;
            server.send(&ready_for_query(b'I')).await;

            // zero rows are visible afterwards
            server.expect(b'Q').await;
            server.send(&row_description(&[("count", 23)])).await;
            server.send(&data_row(&[Some(b"0".as_slice())])).await;
            server.send(&command_complete("SELECT 1")).await;
            server.send(&ready_for_query(b'I')).await;
        });

        let mut copy = conn.copy_in("COPY foo FROM STDIN").await.unwrap();
        copy.send(b"1\tbar\n").await.unwrap();
        copy.send(b"2\tbaz\n").await.unwrap();
        copy.send(b"3\tqux\n").await.unwrap();

        let err = copy.fail("source failed").await.unwrap_err();
        assert!(err.as_db().is_some());
        assert_eq!(conn.state(), SessionState::Idle);

        let rows = conn.simple_query("SELECT count(*) FROM foo").await.unwrap();
        assert_eq!(rows[0].get(0).unwrap().as_i32(), Some(0));

        script.await.unwrap();
    });
}

#[test]
fn dropped_copy_in_aborts_the_transfer() {
    run(async {
        let (mut conn, mut server) = pair().await;

        let script = tokio::spawn(async move {
            server.expect(b'Q').await;
            server.send(&copy_in_response(1)).await;

            let (msgtype, _) = server.read_frame().await;
            assert_eq!(msgtype, b'd');
            // the drop guard aborts rather than committing
            let (msgtype, _) = server.read_frame().await;
            assert_eq!(msgtype, b'f');

            server.send(&error_response("57014", "COPY from stdin failed")).await;
            server.send(&ready_for_query(b'I')).await;

            server.expect(b'Q').await;
            server.send(&command_complete("SELECT 0")).await;
            server.send(&ready_for_query(b'I')).await;
        });

        let mut copy = conn.copy_in("COPY foo FROM STDIN").await.unwrap();
        copy.send(b"1\n").await.unwrap();
        drop(copy);

        // the next statement drains the aborted cycle first
        conn.simple_query("SELECT 1 WHERE false").await.unwrap();
        assert_eq!(conn.state(), SessionState::Idle);

        script.await.unwrap();
    });
}

#[test]
fn copy_out_streams_chunks() {
    run(async {
        let (mut conn, mut server) = pair().await;

        let script = tokio::spawn(async move {
            let body = server.expect(b'Q').await;
            assert_eq!(body, b"COPY foo TO STDOUT\0");
            server.send(&copy_out_response(2)).await;
            server.send(&copy_data(b"1\tbar\n")).await;
            server.send(&copy_data(b"2\tbaz\n")).await;
            server.send(&copy_data(b"3\tqux\n")).await;
            server.send(&copy_done()).await;
            server.send(&command_complete("COPY 3")).await;
            server.send(&ready_for_query(b'I')).await;
        });

        let copy = conn.copy_out("COPY foo TO STDOUT").await.unwrap();
        let chunks = copy.collect().await.unwrap();

        assert_eq!(chunks.len(), 3);
        assert_eq!(&chunks[0][..], b"1\tbar\n");
        assert_eq!(conn.state(), SessionState::Idle);

        script.await.unwrap();
    });
}

#[test]
fn copy_out_server_error_mid_stream() {
    run(async {
        let (mut conn, mut server) = pair().await;

        let script = tokio::spawn(async move {
            server.expect(b'Q').await;
            server.send(&copy_out_response(1)).await;
            server.send(&copy_data(b"1\n")).await;
            server.send(&error_response("08P01", "copy source vanished")).await;
            server.send(&ready_for_query(b'I')).await;
        });

        let mut copy = conn.copy_out("COPY foo TO STDOUT").await.unwrap();
        assert_eq!(copy.try_next().await.unwrap().as_deref(), Some(b"1\n".as_slice()));
        let err = copy.try_next().await.unwrap_err();
        assert!(err.as_db().is_some());
        drop(copy);
        assert_eq!(conn.state(), SessionState::Idle);

        script.await.unwrap();
    });
}

#[test]
fn non_copy_statement_rejected_locally() {
    run(async {
        let (mut conn, server) = pair().await;

        // the server sees nothing at all
        let err = conn.copy_in("SELECT 1").await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::CopyNotSupported(_)));
        let err = conn.copy_out("UPDATE foo SET x = 1").await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::CopyNotSupported(_)));
        assert_eq!(conn.state(), SessionState::Idle);

        drop(server);
    });
}

#[test]
fn copy_direction_mismatch_is_rejected() {
    run(async {
        let (mut conn, mut server) = pair().await;

        let script = tokio::spawn(async move {
            server.expect(b'Q').await;
            // the statement turned out to be COPY TO
            server.send(&copy_out_response(1)).await;
            server.send(&copy_data(b"1\n")).await;
            server.send(&copy_done()).await;
            server.send(&command_complete("COPY 1")).await;
            server.send(&ready_for_query(b'I')).await;
        });

        let err = conn.copy_in("COPY foo TO STDOUT").await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidParameter(_)));
        assert_eq!(conn.state(), SessionState::Idle);

        script.await.unwrap();
    });
}
