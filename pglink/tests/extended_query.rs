//! Extended query protocol: prepare/bind/execute cycles, row limits,
//! suspended portals, and error recovery.
mod common;

use common::*;
use pglink::{ErrorKind, SessionState, Value};

const INT4: u32 = 23;
const TEXT: u32 = 25;

#[test]
fn unbounded_execute_returns_all_rows() {
    run(async {
        let (mut conn, mut server) = pair().await;

        let script = tokio::spawn(async move {
            server.respond_prepare(&[], &[("x", INT4)]).await;
            server.respond_bind().await;
            assert_eq!(server.read_execute().await, 0);
            for i in 1..=100 {
                server.send(&int4_row(i)).await;
            }
            server.send(&command_complete("SELECT 100")).await;
            server.send(&ready_for_query(b'I')).await;
        });

        let stmt = conn.prepare("SELECT x FROM generate_series(1,100) x").await.unwrap();
        let portal = conn.bind(&stmt, &[]).await.unwrap();
        let rows = conn.execute(&portal, 0).await.unwrap().rows().unwrap();
        let rows = rows.collect().await.unwrap();

        assert_eq!(rows.len(), 100);
        assert_eq!(rows[0].get(0).unwrap().as_i32(), Some(1));
        assert_eq!(rows[99].get(0).unwrap().as_i32(), Some(100));
        assert_eq!(conn.state(), SessionState::Idle);

        script.await.unwrap();
    });
}

#[test]
fn row_limit_suspends_and_closes_portal() {
    run(async {
        let (mut conn, mut server) = pair().await;

        let script = tokio::spawn(async move {
            server.respond_prepare(&[], &[("x", INT4)]).await;
            server.respond_bind().await;
            // the statement-level limit travels on the Execute message
            assert_eq!(server.read_execute().await, 25);
            for i in 1..=25 {
                server.send(&int4_row(i)).await;
            }
            server.send(&portal_suspended()).await;
            server.send(&ready_for_query(b'I')).await;
            // partial result: the client must close the portal explicitly
            server.respond_close_portal().await;
        });

        let mut stmt = conn.prepare("SELECT x FROM generate_series(1,100) x").await.unwrap();
        stmt.limit_mut().set_max_rows(25).unwrap();
        let portal = conn.bind(&stmt, &[]).await.unwrap();
        let rows = conn.execute(&portal, 0).await.unwrap().rows().unwrap();
        let rows = rows.collect().await.unwrap();

        assert_eq!(rows.len(), 25);
        assert_eq!(conn.state(), SessionState::Idle);

        script.await.unwrap();
    });
}

#[test]
fn limit_exceeding_availability_returns_everything() {
    run(async {
        let (mut conn, mut server) = pair().await;

        let script = tokio::spawn(async move {
            server.respond_prepare(&[], &[("x", INT4)]).await;
            server.respond_bind().await;
            assert_eq!(server.read_execute().await, 200);
            for i in 1..=100 {
                server.send(&int4_row(i)).await;
            }
            server.send(&command_complete("SELECT 100")).await;
            server.send(&ready_for_query(b'I')).await;
        });

        let stmt = conn.prepare("SELECT x FROM generate_series(1,100) x").await.unwrap();
        let portal = conn.bind(&stmt, &[]).await.unwrap();
        let rows = conn.execute(&portal, 200).await.unwrap().rows().unwrap();
        let rows = rows.collect().await.unwrap();

        assert_eq!(rows.len(), 100);

        script.await.unwrap();
    });
}

#[test]
fn effective_limit_is_the_smaller_knob() {
    run(async {
        let (mut conn, mut server) = pair().await;

        let script = tokio::spawn(async move {
            server.respond_prepare(&[], &[("x", INT4)]).await;
            server.respond_bind().await;
            // statement limit 25 beats the requested 80
            assert_eq!(server.read_execute().await, 25);
            server.send(&command_complete("SELECT 0")).await;
            server.send(&ready_for_query(b'I')).await;
        });

        let mut stmt = conn.prepare("SELECT x").await.unwrap();
        stmt.limit_mut().set_max_rows(25).unwrap();
        let portal = conn.bind(&stmt, &[]).await.unwrap();
        let rows = conn.execute(&portal, 80).await.unwrap().rows().unwrap();
        assert_eq!(rows.collect().await.unwrap().len(), 0);

        script.await.unwrap();
    });
}

#[test]
fn oversized_limit_rejected_before_wire() {
    run(async {
        let (mut conn, mut server) = pair().await;

        let script = tokio::spawn(async move {
            server.respond_prepare(&[], &[("x", INT4)]).await;
            server.respond_bind().await;
            // the rejected execute never reaches the server
            assert_eq!(server.read_execute().await, 0);
            server.send(&command_complete("SELECT 0")).await;
            server.send(&ready_for_query(b'I')).await;
        });

        let stmt = conn.prepare("SELECT x").await.unwrap();
        let portal = conn.bind(&stmt, &[]).await.unwrap();

        let err = conn.execute(&portal, i32::MAX as u64 + 1).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidParameter(_)));

        // the cycle is still open and usable
        let rows = conn.execute(&portal, 0).await.unwrap().rows().unwrap();
        assert_eq!(rows.collect().await.unwrap().len(), 0);

        script.await.unwrap();
    });
}

#[test]
fn parameter_count_validated_locally() {
    run(async {
        let (mut conn, mut server) = pair().await;

        let script = tokio::spawn(async move {
            server.respond_prepare(&[INT4, TEXT], &[("x", INT4)]).await;
        });

        let stmt = conn.prepare("SELECT $1 + $2").await.unwrap();
        let err = conn.bind(&stmt, &[Value::Int4(1)]).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidParameter(_)));
        assert_eq!(conn.state(), SessionState::Idle);

        script.await.unwrap();
    });
}

#[test]
fn bound_parameters_reach_the_wire() {
    run(async {
        let (mut conn, mut server) = pair().await;

        let script = tokio::spawn(async move {
            server.respond_prepare(&[INT4, TEXT], &[("x", INT4)]).await;
            let bind = server.respond_bind().await;
            // the binary int4 parameter value is framed in the Bind body
            let needle = [0, 0, 0, 4, 0, 0, 1, 164];
            assert!(
                bind.windows(needle.len()).any(|w| w == needle),
                "bind body missing the encoded parameter",
            );
            assert_eq!(server.read_execute().await, 0);
            server.send(&command_complete("SELECT 0")).await;
            server.send(&ready_for_query(b'I')).await;
        });

        let stmt = conn.prepare("SELECT $1 + $2").await.unwrap();
        let portal = conn
            .bind(&stmt, &[Value::Int4(420), Value::Text("foo".into())])
            .await
            .unwrap();
        let rows = conn.execute(&portal, 0).await.unwrap().rows().unwrap();
        rows.finish().await.unwrap();

        script.await.unwrap();
    });
}

#[test]
fn server_error_recovers_to_idle() {
    run(async {
        let (mut conn, mut server) = pair().await;

        let script = tokio::spawn(async move {
            server.respond_prepare(&[], &[("x", INT4)]).await;
            server.respond_bind().await;
            server.read_execute().await;
            // a couple of rows make it out before the failure
            server.send(&int4_row(1)).await;
            server.send(&int4_row(2)).await;
            server.send(&error_response("42P01", "relation \"foo\" does not exist")).await;
            server.send(&ready_for_query(b'I')).await;

            // the connection accepts the next statement afterwards
            server.respond_prepare(&[], &[("y", INT4)]).await;
        });

        let stmt = conn.prepare("SELECT x FROM foo").await.unwrap();
        let portal = conn.bind(&stmt, &[]).await.unwrap();
        let rows = conn.execute(&portal, 0).await.unwrap().rows().unwrap();
        let err = rows.collect().await.unwrap_err();

        let db = err.as_db().expect("server error");
        assert_eq!(db.code(), "42P01");
        assert_eq!(db.message(), "relation \"foo\" does not exist");
        assert!(!err.is_query_canceled());
        assert_eq!(conn.state(), SessionState::Idle);

        conn.prepare("SELECT y").await.unwrap();

        script.await.unwrap();
    });
}

#[test]
fn canceled_statement_reports_sqlstate_57014() {
    run(async {
        let (mut conn, mut server) = pair().await;

        let script = tokio::spawn(async move {
            server.respond_prepare(&[], &[("x", INT4)]).await;
            server.respond_bind().await;
            server.read_execute().await;
            server
                .send(&error_response("57014", "canceling statement due to user request"))
                .await;
            server.send(&ready_for_query(b'I')).await;
        });

        let stmt = conn.prepare("SELECT pg_sleep(3600)").await.unwrap();
        let portal = conn.bind(&stmt, &[]).await.unwrap();
        // the cancellation hits before the first row, so execute itself fails
        let err = conn.execute(&portal, 0).await.unwrap_err();

        assert!(err.is_query_canceled());
        assert_eq!(conn.state(), SessionState::Idle);

        script.await.unwrap();
    });
}

#[test]
fn lazy_decode_defers_until_access() {
    run(async {
        let (mut conn, mut server) = pair().await;

        let script = tokio::spawn(async move {
            server.respond_prepare(&[], &[("x", INT4), ("huge", TEXT)]).await;
            server.respond_bind().await;
            server.read_execute().await;
            server
                .send(&data_row(&[Some(7i32.to_be_bytes().as_slice()), Some(b"payload")]))
                .await;
            server.send(&command_complete("SELECT 1")).await;
            server.send(&ready_for_query(b'I')).await;
        });

        let stmt = conn.prepare("SELECT x, huge FROM t").await.unwrap();
        let portal = conn.bind(&stmt, &[]).await.unwrap();
        let rows = conn.execute(&portal, 0).await.unwrap().rows().unwrap();
        let rows = rows.collect().await.unwrap();

        // only the dereferenced column is decoded
        assert_eq!(rows[0].get(0).unwrap().as_i32(), Some(7));
        assert_eq!(rows[0].get(1).unwrap().as_str(), Some("payload"));

        script.await.unwrap();
    });
}

#[test]
fn statement_cache_reuses_server_statement() {
    run(async {
        let (mut conn, mut server) = pair().await;

        let script = tokio::spawn(async move {
            // a single Parse for two prepare_cached calls
            server.respond_prepare(&[], &[("x", INT4)]).await;
        });

        let first = conn.prepare_cached("SELECT x").await.unwrap();
        let second = conn.prepare_cached("SELECT x").await.unwrap();
        assert_eq!(first.name(), second.name());

        script.await.unwrap();
    });
}

#[test]
fn simple_query_collects_rows() {
    run(async {
        let (mut conn, mut server) = pair().await;

        let script = tokio::spawn(async move {
            let body = server.expect(b'Q').await;
            assert_eq!(body, b"SELECT 1\0");
            server.send(&row_description(&[("one", INT4)])).await;
            // simple query transmits columns in text format
            server.send(&data_row(&[Some(b"1".as_slice())])).await;
            server.send(&command_complete("SELECT 1")).await;
            server.send(&ready_for_query(b'I')).await;
        });

        let rows = conn.simple_query("SELECT 1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get(0).unwrap().as_i32(), Some(1));

        script.await.unwrap();
    });
}

#[test]
fn parameter_status_updates_session() {
    run(async {
        let (mut conn, mut server) = pair().await;

        assert_eq!(conn.parameter("server_version"), Some("17.4"));

        let script = tokio::spawn(async move {
            server.expect(b'Q').await;
            server.send(&parameter_status("application_name", "pglink")).await;
            server.send(&command_complete("SET")).await;
            server.send(&ready_for_query(b'I')).await;
        });

        conn.simple_query("SET application_name TO 'pglink'").await.unwrap();
        assert_eq!(conn.parameter("application_name"), Some("pglink"));

        script.await.unwrap();
    });
}
