//! Integration tests driving the real client against the scripted server
//!
//! Every test starts its own [TestServer] on a loopback port with a
//! per-scenario statement handler, so the suite runs without an external
//! database. Set MYSQL_HOST (and optionally MYSQL_PORT, MYSQL_USER,
//! MYSQL_PASSWORD) to also run the live round trip against a real server.
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sable_mysql::constants::{server_status, type_};
use sable_mysql::{
    connect, create_pool, ConnectionOptions, Error as DriverError, PoolOptions, ScrollMode, Value,
};
use tokio::time::sleep;

use crate::server::{AuthBehavior, Reply, ServerOptions, TestColumn, TestServer};

struct Error(Box<dyn std::error::Error + Send>);

impl Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

impl<E: std::error::Error + 'static + Send> From<E> for Error {
    fn from(value: E) -> Self {
        Error(Box::new(value))
    }
}

type TestResult = Result<(), Error>;

fn srow(vals: &[&str]) -> Vec<Option<String>> {
    vals.iter().map(|v| Some(v.to_string())).collect()
}

fn int_rows(name: &str, n: i64) -> Reply {
    Reply::rows(
        vec![TestColumn::new(name, type_::LONG_LONG)],
        (0..n).map(|i| vec![Some(i.to_string())]).collect(),
    )
}

fn opts_from_env() -> Option<ConnectionOptions> {
    let host = std::env::var("MYSQL_HOST").ok()?;
    let mut opts = ConnectionOptions::new().host(host);
    if let Ok(port) = std::env::var("MYSQL_PORT") {
        opts = opts.port(port.parse().ok()?);
    }
    if let Ok(user) = std::env::var("MYSQL_USER") {
        opts = opts.user(user);
    }
    if let Ok(password) = std::env::var("MYSQL_PASSWORD") {
        opts = opts.password(password);
    }
    Some(opts)
}

#[tokio::test]
async fn simple_select() -> TestResult {
    let server = TestServer::start(|sql| {
        if sql == "SELECT 42" {
            Reply::rows(
                vec![TestColumn::new("42", type_::LONG_LONG)],
                vec![srow(&["42"])],
            )
        } else {
            Reply::ok()
        }
    })
    .await;

    let mut conn = connect(server.options()).await?;
    assert_eq!(conn.server_version(), "8.0.0-scripted");
    assert_eq!(conn.thread_id(), 1);
    assert!(conn.get_autocommit());

    let mut cur = conn.cursor();
    cur.execute("SELECT 42", ()).await?;
    assert_eq!(cur.rowcount(), 1);
    assert_eq!(cur.description().unwrap()[0].name, "42");
    assert_eq!(cur.fetchone().await?, Some(vec![Value::Int(42)]));
    assert_eq!(cur.fetchone().await?, None);
    cur.close().await?;
    cur.close().await?;

    conn.ensure_closed().await?;
    conn.ensure_closed().await?;
    assert!(conn.closed());
    Ok(())
}

#[tokio::test]
async fn insert_reports_lastrowid() -> TestResult {
    let server = TestServer::start(|sql| {
        if sql.starts_with("INSERT") {
            Reply::affected(1, 1)
        } else {
            Reply::ok()
        }
    })
    .await;

    let mut conn = connect(server.options()).await?;
    let mut cur = conn.cursor();
    let count = cur
        .execute("INSERT INTO t(v) VALUES(%s)", ("a",))
        .await?;
    assert_eq!(count, 1);
    assert_eq!(cur.rowcount(), 1);
    assert_eq!(cur.lastrowid(), 1);
    assert!(cur.description().is_none());
    cur.close().await?;
    assert_eq!(conn.affected_rows(), 1);
    assert_eq!(conn.insert_id(), 1);
    Ok(())
}

#[tokio::test]
async fn parameters_are_escaped_on_the_wire() -> TestResult {
    let server = TestServer::start(|_| Reply::affected(1, 0)).await;
    let mut conn = connect(server.options()).await?;
    let mut cur = conn.cursor();
    cur.execute("INSERT INTO t(v) VALUES(%s)", ("a'b\n",)).await?;
    cur.execute(
        "UPDATE t SET v=%(v)s",
        HashMap::from([("v".to_string(), Value::from(7i64))]),
    )
    .await?;
    let queries = server.queries();
    assert_eq!(queries[0], "INSERT INTO t(v) VALUES('a\\'b\\n')");
    assert_eq!(queries[1], "UPDATE t SET v=7");
    Ok(())
}

#[tokio::test]
async fn executemany_packs_inserts() -> TestResult {
    let server = TestServer::start(|sql| {
        if sql.starts_with("INSERT") {
            Reply::affected(sql.matches("('").count() as u64, 0)
        } else if sql.starts_with("UPDATE") {
            Reply::affected(1, 0)
        } else {
            Reply::ok()
        }
    })
    .await;

    let mut conn = connect(server.options()).await?;
    let mut cur = conn.cursor();
    let count = cur
        .executemany("INSERT INTO t(v) VALUES(%s)", vec![("a",), ("b",), ("c",)])
        .await?;
    assert_eq!(count, 3);
    assert_eq!(
        server.queries(),
        vec!["INSERT INTO t(v) VALUES('a'),('b'),('c')".to_string()]
    );

    // statements that are not INSERT ... VALUES run one by one
    let count = cur
        .executemany(
            "UPDATE t SET v=%s WHERE id=%s",
            vec![(1i64, 1i64), (2, 2), (3, 3)],
        )
        .await?;
    assert_eq!(count, 3);
    assert_eq!(server.queries().len(), 4);

    // an empty sequence does not touch the connection
    let count = cur
        .executemany("INSERT INTO t(v) VALUES(%s)", Vec::<(&str,)>::new())
        .await?;
    assert_eq!(count, 0);
    assert_eq!(server.queries().len(), 4);
    Ok(())
}

#[tokio::test]
async fn streaming_cursor_iterates_and_recovers() -> TestResult {
    let server = TestServer::start(|sql| {
        if sql.starts_with("SELECT") {
            int_rows("v", 5)
        } else {
            Reply::ok()
        }
    })
    .await;

    let mut conn = connect(server.options()).await?;
    {
        let mut cur = conn.stream_cursor();
        cur.execute("SELECT v FROM big", ()).await?;
        assert_eq!(cur.rowcount(), -1);
        assert_eq!(cur.fetchone().await?, Some(vec![Value::Int(0)]));
        assert_eq!(cur.fetchone().await?, Some(vec![Value::Int(1)]));
        // closing mid-iteration drains the rest
        cur.close().await?;
    }
    {
        // the connection is clean again for the next command
        let mut cur = conn.cursor();
        cur.execute("SELECT v FROM big", ()).await?;
        assert_eq!(cur.rowcount(), 5);
    }
    {
        let mut cur = conn.stream_cursor();
        cur.execute("SELECT v FROM big", ()).await?;
        let all = cur.fetchall().await?;
        assert_eq!(all.len(), 5);
        assert_eq!(cur.rowcount(), 5);
        cur.close().await?;
    }
    Ok(())
}

#[tokio::test]
async fn second_command_with_unread_rows_is_rejected() -> TestResult {
    let server = TestServer::start(|sql| {
        if sql.starts_with("SELECT") {
            int_rows("v", 3)
        } else {
            Reply::ok()
        }
    })
    .await;

    let mut conn = connect(server.options()).await?;
    let mut cur = conn.stream_cursor();
    cur.execute("SELECT v FROM big", ()).await?;
    let _ = cur.fetchone().await?;
    drop(cur);
    let err = conn.ping(false).await.unwrap_err();
    assert!(matches!(err, DriverError::Programming(_)));
    Ok(())
}

#[tokio::test]
async fn multiple_result_sets() -> TestResult {
    let server = TestServer::start(|sql| {
        if sql == "SELECT MULTI" {
            Reply::Rows {
                columns: vec![TestColumn::new("a", type_::LONG_LONG)],
                rows: vec![srow(&["1"])],
                status: 0,
                more: Some(Box::new(Reply::rows(
                    vec![TestColumn::new("b", type_::LONG_LONG)],
                    vec![srow(&["2"])],
                ))),
            }
        } else {
            Reply::ok()
        }
    })
    .await;

    let mut conn = connect(server.options()).await?;
    let mut cur = conn.cursor();
    cur.execute("SELECT MULTI", ()).await?;
    assert_eq!(cur.fetchall().await?, vec![vec![Value::Int(1)]]);
    assert!(cur.nextset().await?);
    assert_eq!(cur.description().unwrap()[0].name, "b");
    assert_eq!(cur.fetchall().await?, vec![vec![Value::Int(2)]]);
    assert!(!cur.nextset().await?);
    cur.close().await?;
    Ok(())
}

#[tokio::test]
async fn callproc_reaches_the_trailing_status_set() -> TestResult {
    let server = TestServer::start(|sql| {
        if sql.starts_with("SET @_myinc_0") {
            Reply::ok()
        } else if sql.starts_with("CALL myinc") {
            Reply::Rows {
                columns: vec![TestColumn::new("v", type_::LONG_LONG)],
                rows: vec![srow(&["2"])],
                status: 0,
                more: Some(Box::new(Reply::ok())),
            }
        } else if sql == "SELECT 1" {
            Reply::rows(
                vec![TestColumn::new("1", type_::LONG_LONG)],
                vec![srow(&["1"])],
            )
        } else {
            Reply::ok()
        }
    })
    .await;

    let mut conn = connect(server.options()).await?;
    let mut cur = conn.cursor();
    let args = cur.callproc("myinc", vec![Value::Int(1)]).await?;
    // the original arguments come back unchanged
    assert_eq!(args, vec![Value::Int(1)]);
    assert_eq!(cur.fetchone().await?, Some(vec![Value::Int(2)]));
    assert!(cur.nextset().await?);
    assert_eq!(cur.fetchone().await?, None);
    assert!(!cur.nextset().await?);
    cur.execute("SELECT 1", ()).await?;
    assert_eq!(cur.fetchone().await?, Some(vec![Value::Int(1)]));

    let queries = server.queries();
    assert_eq!(queries[0], "SET @_myinc_0=1");
    assert_eq!(queries[1], "CALL myinc(@_myinc_0)");
    Ok(())
}

#[tokio::test]
async fn server_errors_are_classified() -> TestResult {
    let server = TestServer::start(|sql| {
        if sql.contains("DUP") {
            Reply::error(1062, "23000", "Duplicate entry 'a' for key 't.v'")
        } else if sql.contains("SYNTAX") {
            Reply::error(1064, "42000", "You have an error in your SQL syntax")
        } else if sql == "SELECT 1" {
            Reply::rows(
                vec![TestColumn::new("1", type_::LONG_LONG)],
                vec![srow(&["1"])],
            )
        } else {
            Reply::ok()
        }
    })
    .await;

    let mut conn = connect(server.options()).await?;
    let mut cur = conn.cursor();

    let err = cur.execute("INSERT DUP", ()).await.unwrap_err();
    match &err {
        DriverError::Integrity(e) => {
            assert_eq!(e.code, 1062);
            assert_eq!(e.sqlstate, "23000");
        }
        other => panic!("expected integrity error, got {other:?}"),
    }

    let err = cur.execute("SYNTAX ERROR HERE", ()).await.unwrap_err();
    assert!(matches!(err, DriverError::Programming(_)));

    // a server-level error leaves the connection usable
    cur.execute("SELECT 1", ()).await?;
    assert_eq!(cur.fetchone().await?, Some(vec![Value::Int(1)]));
    Ok(())
}

#[tokio::test]
async fn broken_sequence_ids_break_the_connection() -> TestResult {
    let server = TestServer::start_with(ServerOptions {
        corrupt_seq: true,
        ..Default::default()
    })
    .await;

    let mut conn = connect(server.options()).await?;
    let mut cur = conn.cursor();
    let err = cur.execute("SELECT 1", ()).await.unwrap_err();
    assert!(matches!(err, DriverError::Interface(_)));
    drop(cur);
    assert!(conn.closed());
    Ok(())
}

#[tokio::test]
async fn ping_and_reconnect() -> TestResult {
    let server = TestServer::start(|_| Reply::ok()).await;
    let mut conn = connect(server.options()).await?;
    conn.ping(false).await?;
    assert_eq!(server.connections(), 1);

    conn.close();
    let err = conn.ping(false).await.unwrap_err();
    assert!(matches!(err, DriverError::Interface(_)));

    conn.ping(true).await?;
    assert!(!conn.closed());
    assert_eq!(server.connections(), 2);
    Ok(())
}

#[tokio::test]
async fn auth_switch_and_sha2_fast_path() -> TestResult {
    let server = TestServer::start_with(ServerOptions {
        auth: AuthBehavior::SwitchSeed,
        ..Default::default()
    })
    .await;
    let mut conn = connect(server.options()).await?;
    conn.ping(false).await?;
    conn.ensure_closed().await?;

    let server = TestServer::start_with(ServerOptions {
        auth: AuthBehavior::CachingSha2Fast,
        ..Default::default()
    })
    .await;
    let mut conn = connect(server.options()).await?;
    conn.ping(false).await?;
    conn.ensure_closed().await?;
    Ok(())
}

#[tokio::test]
async fn wrong_password_is_rejected() -> TestResult {
    let server = TestServer::start_with(ServerOptions {
        password: "other".to_string(),
        ..Default::default()
    })
    .await;
    let err = connect(server.options()).await.unwrap_err();
    match err {
        DriverError::Operational(e) => assert_eq!(e.code, 1045),
        other => panic!("expected operational error, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn dict_cursor_keys_rows_by_name() -> TestResult {
    let server = TestServer::start(|_| Reply::Rows {
        columns: vec![
            TestColumn::new("id", type_::LONG_LONG),
            TestColumn::new("id", type_::LONG_LONG),
            TestColumn::new("name", type_::VAR_STRING),
        ],
        rows: vec![vec![
            Some("1".to_string()),
            Some("2".to_string()),
            Some("bob".to_string()),
        ]],
        status: 0,
        more: None,
    })
    .await;

    let mut conn = connect(server.options()).await?;
    let mut cur = conn.dict_cursor();
    cur.execute("SELECT a.id, b.id, name FROM t", ()).await?;
    let row = cur.fetchone().await?.unwrap();
    // the later occurrence of a duplicate name wins
    assert_eq!(row.get("id"), Some(&Value::Int(2)));
    assert_eq!(row.get("name"), Some(&Value::Str("bob".to_string())));
    Ok(())
}

#[tokio::test]
async fn binary_columns_decode_as_bytes() -> TestResult {
    let server = TestServer::start(|_| Reply::Rows {
        columns: vec![
            TestColumn::new("b", type_::VAR_STRING).charset(63),
            TestColumn::new("s", type_::VAR_STRING),
        ],
        rows: vec![srow(&["raw", "text"])],
        status: 0,
        more: None,
    })
    .await;

    let mut conn = connect(server.options()).await?;
    let mut cur = conn.cursor();
    cur.execute("SELECT b, s FROM t", ()).await?;
    assert_eq!(
        cur.fetchone().await?,
        Some(vec![
            Value::Bytes(b"raw".to_vec()),
            Value::Str("text".to_string()),
        ])
    );
    Ok(())
}

#[tokio::test]
async fn scroll_buffered_and_streaming() -> TestResult {
    let server = TestServer::start(|sql| {
        if sql.starts_with("SELECT") {
            int_rows("v", 5)
        } else {
            Reply::ok()
        }
    })
    .await;

    let mut conn = connect(server.options()).await?;
    {
        let mut cur = conn.cursor();
        cur.execute("SELECT v FROM t", ()).await?;
        cur.scroll(3, ScrollMode::Absolute).await?;
        assert_eq!(cur.fetchone().await?, Some(vec![Value::Int(3)]));
        cur.scroll(-2, ScrollMode::Relative).await?;
        assert_eq!(cur.fetchone().await?, Some(vec![Value::Int(2)]));
        let err = cur.scroll(10, ScrollMode::Relative).await.unwrap_err();
        assert!(matches!(err, DriverError::Programming(_)));
    }
    {
        let mut cur = conn.stream_cursor();
        cur.execute("SELECT v FROM t", ()).await?;
        cur.scroll(2, ScrollMode::Relative).await?;
        assert_eq!(cur.fetchone().await?, Some(vec![Value::Int(2)]));
        let err = cur.scroll(-1, ScrollMode::Relative).await.unwrap_err();
        assert!(matches!(err, DriverError::NotSupported(_)));
        cur.close().await?;
    }
    Ok(())
}

#[tokio::test]
async fn fetchmany_respects_arraysize() -> TestResult {
    let server = TestServer::start(|_| int_rows("v", 5)).await;
    let mut conn = connect(server.options()).await?;
    let mut cur = conn.cursor();
    cur.execute("SELECT v FROM t", ()).await?;
    assert_eq!(cur.arraysize(), 1);
    assert_eq!(cur.fetchmany(None).await?.len(), 1);
    cur.set_arraysize(3);
    assert_eq!(cur.fetchmany(None).await?.len(), 3);
    assert_eq!(cur.fetchmany(Some(10)).await?.len(), 1);
    assert_eq!(cur.fetchmany(None).await?.len(), 0);
    Ok(())
}

#[tokio::test]
async fn fetch_before_execute_is_a_programming_error() -> TestResult {
    let server = TestServer::start(|_| Reply::ok()).await;
    let mut conn = connect(server.options()).await?;
    let mut cur = conn.cursor();
    let err = cur.fetchone().await.unwrap_err();
    assert!(matches!(err, DriverError::Programming(_)));
    cur.close().await?;
    let err = cur.execute("SELECT 1", ()).await.unwrap_err();
    assert!(matches!(err, DriverError::Programming(_)));
    Ok(())
}

#[tokio::test]
async fn show_warnings() -> TestResult {
    let server = TestServer::start(|sql| {
        if sql == "SHOW WARNINGS" {
            Reply::Rows {
                columns: vec![
                    TestColumn::new("Level", type_::VAR_STRING),
                    TestColumn::new("Code", type_::LONG_LONG),
                    TestColumn::new("Message", type_::VAR_STRING),
                ],
                rows: vec![srow(&["Warning", "1265", "Data truncated for column 'v'"])],
                status: 0,
                more: None,
            }
        } else {
            Reply::ok()
        }
    })
    .await;

    let mut conn = connect(server.options()).await?;
    let warnings = conn.show_warnings().await?;
    assert_eq!(
        warnings,
        vec![(
            "Warning".to_string(),
            1265,
            "Data truncated for column 'v'".to_string()
        )]
    );
    Ok(())
}

#[tokio::test]
async fn transaction_family() -> TestResult {
    let server = TestServer::start(|sql| match sql {
        "BEGIN" | "SAVEPOINT sp_1" => Reply::Ok {
            affected: 0,
            insert_id: 0,
            status: server_status::IN_TRANS,
        },
        _ => Reply::ok(),
    })
    .await;

    let mut conn = connect(server.options()).await?;
    {
        let mut tx = conn.begin_transaction().await?;
        {
            let sp = tx.savepoint().await?;
            sp.commit().await?;
        }
        tx.rollback().await?;
    }
    assert!(!conn.in_transaction());

    let tx = conn.begin_two_phase("xid-1").await?;
    tx.commit().await?;

    let queries = server.queries();
    assert_eq!(
        queries,
        vec![
            "BEGIN".to_string(),
            "SAVEPOINT sp_1".to_string(),
            "RELEASE SAVEPOINT sp_1".to_string(),
            "ROLLBACK".to_string(),
            "XA START 'xid-1'".to_string(),
            "XA END 'xid-1'".to_string(),
            "XA PREPARE 'xid-1'".to_string(),
            "XA COMMIT 'xid-1'".to_string(),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn rollback_clears_transaction_status() -> TestResult {
    let server = TestServer::start(|sql| match sql {
        "BEGIN" => Reply::Ok {
            affected: 0,
            insert_id: 0,
            status: server_status::IN_TRANS,
        },
        s if s.starts_with("INSERT") => Reply::Ok {
            affected: 1,
            insert_id: 1,
            status: server_status::IN_TRANS,
        },
        _ => Reply::ok(),
    })
    .await;

    let mut conn = connect(server.options()).await?;
    conn.begin().await?;
    assert!(conn.in_transaction());
    let mut cur = conn.cursor();
    cur.execute("INSERT INTO t(v) VALUES(%s)", ("a",)).await?;
    cur.close().await?;
    conn.rollback().await?;
    assert_eq!(conn.server_status() & server_status::IN_TRANS, 0);
    Ok(())
}

#[tokio::test]
async fn local_infile_streams_the_file() -> TestResult {
    let dir = std::env::temp_dir().join(format!("sable-infile-{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("data.csv");
    std::fs::write(&path, b"1,a\n2,b\n")?;
    let path_str = path.to_string_lossy().into_owned();

    let sink = Arc::new(Mutex::new(Vec::new()));
    let handler_sink = sink.clone();
    let handler_path = path_str.clone();
    let server = TestServer::start(move |sql| {
        if sql.starts_with("LOAD DATA") {
            Reply::Infile {
                filename: handler_path.clone(),
                sink: handler_sink.clone(),
            }
        } else {
            Reply::ok()
        }
    })
    .await;

    let mut conn = connect(server.options().local_infile(true)).await?;
    let mut cur = conn.cursor();
    let count = cur
        .execute(
            &format!("LOAD DATA LOCAL INFILE '{path_str}' INTO TABLE t"),
            (),
        )
        .await?;
    assert_eq!(count, 1);
    assert_eq!(sink.lock().unwrap().as_slice(), b"1,a\n2,b\n");

    // the connection stays usable afterwards
    conn.ping(false).await?;
    std::fs::remove_file(&path).ok();
    Ok(())
}

#[tokio::test]
async fn local_infile_missing_file_fails_cleanly() -> TestResult {
    let sink = Arc::new(Mutex::new(Vec::new()));
    let handler_sink = sink.clone();
    let server = TestServer::start(move |sql| {
        if sql.starts_with("LOAD DATA") {
            Reply::Infile {
                filename: "/nonexistent/sable-mysql-test.csv".to_string(),
                sink: handler_sink.clone(),
            }
        } else {
            Reply::ok()
        }
    })
    .await;

    let mut conn = connect(server.options().local_infile(true)).await?;
    let mut cur = conn.cursor();
    let err = cur
        .execute("LOAD DATA LOCAL INFILE 'x' INTO TABLE t", ())
        .await
        .unwrap_err();
    match err {
        DriverError::Operational(e) => assert_eq!(e.code, 1017),
        other => panic!("expected operational error, got {other:?}"),
    }
    assert!(sink.lock().unwrap().is_empty());
    // the protocol exchange still completed
    conn.ping(false).await?;
    Ok(())
}

#[tokio::test]
async fn pool_saturation_serves_waiters_in_fifo_order() -> TestResult {
    let server = TestServer::start(|_| Reply::ok()).await;
    let pool = create_pool(
        server.options(),
        PoolOptions {
            minsize: 1,
            maxsize: 2,
            ..Default::default()
        },
    )
    .await?;

    let c1 = pool.acquire().await?;
    let c2 = pool.acquire().await?;
    assert_eq!(pool.size(), 2);
    assert_eq!(pool.freesize(), 0);

    let order = Arc::new(Mutex::new(Vec::new()));
    let mk = |tag: &'static str| {
        let pool = pool.clone();
        let order = order.clone();
        tokio::spawn(async move {
            let conn = pool.acquire().await.unwrap();
            order.lock().unwrap().push(tag);
            drop(conn);
        })
    };
    let a = mk("a");
    sleep(Duration::from_millis(50)).await;
    let b = mk("b");
    sleep(Duration::from_millis(50)).await;
    assert!(!a.is_finished());
    assert!(!b.is_finished());
    assert_eq!(pool.size(), 2);

    drop(c1);
    a.await?;
    b.await?;
    assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
    assert_eq!(pool.size(), 2);

    drop(c2);
    assert_eq!(pool.freesize(), 2);
    Ok(())
}

#[tokio::test]
async fn pool_recycle_zero_always_opens_fresh_connections() -> TestResult {
    let server = TestServer::start(|_| Reply::ok()).await;
    let pool = create_pool(
        server.options(),
        PoolOptions {
            minsize: 1,
            maxsize: 2,
            recycle: Some(Duration::ZERO),
            ..Default::default()
        },
    )
    .await?;
    assert_eq!(server.connections(), 1);

    sleep(Duration::from_millis(20)).await;
    let c = pool.acquire().await?;
    assert_eq!(server.connections(), 2);
    drop(c);

    sleep(Duration::from_millis(20)).await;
    let c = pool.acquire().await?;
    assert_eq!(server.connections(), 3);
    assert!(pool.size() <= 2);
    drop(c);
    Ok(())
}

#[tokio::test]
async fn pool_discards_connections_with_unread_results() -> TestResult {
    let server = TestServer::start(|sql| {
        if sql.starts_with("SELECT") {
            int_rows("v", 5)
        } else {
            Reply::ok()
        }
    })
    .await;
    let pool = create_pool(
        server.options(),
        PoolOptions {
            minsize: 1,
            maxsize: 1,
            ..Default::default()
        },
    )
    .await?;

    {
        let mut conn = pool.acquire().await?;
        let mut cur = conn.stream_cursor();
        cur.execute("SELECT v FROM big", ()).await?;
        let _ = cur.fetchone().await?;
        // cursor and guard dropped with rows still unread
    }
    assert_eq!(pool.size(), 0);
    assert_eq!(pool.freesize(), 0);

    let conn = pool.acquire().await?;
    assert_eq!(server.connections(), 2);
    drop(conn);
    assert_eq!(pool.freesize(), 1);
    Ok(())
}

#[tokio::test]
async fn pool_discards_connections_mid_transaction() -> TestResult {
    let server = TestServer::start(|sql| match sql {
        "BEGIN" => Reply::Ok {
            affected: 0,
            insert_id: 0,
            status: server_status::IN_TRANS,
        },
        _ => Reply::ok(),
    })
    .await;
    let pool = create_pool(
        server.options(),
        PoolOptions {
            minsize: 1,
            maxsize: 1,
            ..Default::default()
        },
    )
    .await?;

    {
        let mut conn = pool.acquire().await?;
        conn.begin().await?;
        assert!(conn.in_transaction());
    }
    assert_eq!(pool.freesize(), 0);
    assert_eq!(pool.size(), 0);
    Ok(())
}

#[tokio::test]
async fn pool_close_and_wait_closed() -> TestResult {
    let server = TestServer::start(|_| Reply::ok()).await;
    let pool = create_pool(
        server.options(),
        PoolOptions {
            minsize: 1,
            maxsize: 2,
            ..Default::default()
        },
    )
    .await?;

    let conn = pool.acquire().await?;
    pool.close();

    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, DriverError::Interface(_)));

    let wait = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.wait_closed().await })
    };
    sleep(Duration::from_millis(50)).await;
    assert!(!wait.is_finished());

    drop(conn);
    wait.await??;
    assert!(pool.closed());
    assert_eq!(pool.size(), 0);
    Ok(())
}

#[tokio::test]
async fn terminate_fails_inflight_operations() -> TestResult {
    let server = TestServer::start(|sql| {
        if sql == "SLOW" {
            Reply::Hang(Duration::from_secs(5))
        } else {
            Reply::ok()
        }
    })
    .await;
    let pool = create_pool(
        server.options(),
        PoolOptions {
            minsize: 1,
            maxsize: 1,
            ..Default::default()
        },
    )
    .await?;

    let mut conn = pool.acquire().await?;
    let task = tokio::spawn(async move {
        let r = {
            let mut cur = conn.cursor();
            cur.execute("SLOW", ()).await
        };
        drop(conn);
        r
    });
    sleep(Duration::from_millis(50)).await;
    assert!(!task.is_finished());

    pool.terminate();
    let result = task.await?;
    assert!(matches!(result, Err(DriverError::Interface(_))));

    pool.wait_closed().await?;
    assert_eq!(pool.size(), 0);
    Ok(())
}

#[tokio::test]
async fn pool_clear_closes_idle_connections() -> TestResult {
    let server = TestServer::start(|_| Reply::ok()).await;
    let pool = create_pool(
        server.options(),
        PoolOptions {
            minsize: 2,
            maxsize: 3,
            ..Default::default()
        },
    )
    .await?;
    assert_eq!(pool.freesize(), 2);

    let conn = pool.acquire().await?;
    pool.clear().await;
    assert_eq!(pool.freesize(), 0);
    assert_eq!(pool.size(), 1);
    drop(conn);
    assert_eq!(pool.freesize(), 1);
    Ok(())
}

#[tokio::test]
async fn live_server_round_trip() -> TestResult {
    let Some(opts) = opts_from_env() else {
        return Ok(());
    };
    let mut conn = connect(opts).await?;
    let mut cur = conn.cursor();
    cur.execute("SELECT 42", ()).await?;
    assert_eq!(cur.fetchone().await?, Some(vec![Value::Int(42)]));
    assert_eq!(cur.description().unwrap()[0].name, "42");
    cur.close().await?;
    conn.ensure_closed().await?;
    Ok(())
}
