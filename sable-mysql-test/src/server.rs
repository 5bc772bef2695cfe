//! A scripted in-process server used by the driver tests
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sable_mysql::auth::{scramble_native, scramble_sha256};
use sable_mysql::constants::{capability, server_status};
use sable_mysql::ConnectionOptions;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Seed sent in the greeting, 20 bytes like a real server
pub const SEED: &[u8; 20] = b"abcdefghijklmnopqrst";
/// Seed sent with an auth switch request
pub const SWITCH_SEED: &[u8; 20] = b"ABCDEFGHIJKLMNOPQRST";

/// How the scripted server authenticates clients
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum AuthBehavior {
    /// Advertise and verify mysql_native_password
    Native,
    /// Advertise caching_sha2_password and accept through the fast path
    CachingSha2Fast,
    /// Advertise native, then switch the client to a fresh seed
    SwitchSeed,
}

/// One column of a scripted result set
#[derive(Clone)]
pub struct TestColumn {
    pub name: String,
    pub table: String,
    pub type_code: u8,
    pub flags: u16,
    pub charset: u16,
}

impl TestColumn {
    pub fn new(name: &str, type_code: u8) -> Self {
        TestColumn {
            name: name.to_string(),
            table: "t".to_string(),
            type_code,
            flags: 0,
            charset: 45,
        }
    }

    pub fn flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    pub fn charset(mut self, charset: u16) -> Self {
        self.charset = charset;
        self
    }
}

/// What the scripted server replies to one statement
#[derive(Clone)]
pub enum Reply {
    /// An OK packet
    Ok {
        affected: u64,
        insert_id: u64,
        status: u16,
    },
    /// An ERR packet
    Err {
        code: u16,
        sqlstate: &'static str,
        message: String,
    },
    /// A result set; `more` chains further replies behind it
    Rows {
        columns: Vec<TestColumn>,
        rows: Vec<Vec<Option<String>>>,
        status: u16,
        more: Option<Box<Reply>>,
    },
    /// Request the named local file, collect its bytes into `sink`, then
    /// reply OK
    Infile {
        filename: String,
        sink: Arc<Mutex<Vec<u8>>>,
    },
    /// Wait before replying OK; used to exercise terminate
    Hang(Duration),
}

impl Reply {
    pub fn ok() -> Reply {
        Reply::Ok {
            affected: 0,
            insert_id: 0,
            status: 0,
        }
    }

    pub fn affected(affected: u64, insert_id: u64) -> Reply {
        Reply::Ok {
            affected,
            insert_id,
            status: 0,
        }
    }

    pub fn rows(columns: Vec<TestColumn>, rows: Vec<Vec<Option<String>>>) -> Reply {
        Reply::Rows {
            columns,
            rows,
            status: 0,
            more: None,
        }
    }

    pub fn error(code: u16, sqlstate: &'static str, message: &str) -> Reply {
        Reply::Err {
            code,
            sqlstate,
            message: message.to_string(),
        }
    }
}

type Handler = Arc<dyn Fn(&str) -> Reply + Send + Sync>;

/// Scripted server configuration
pub struct ServerOptions {
    pub password: String,
    pub auth: AuthBehavior,
    /// Reply to queries with a broken sequence id
    pub corrupt_seq: bool,
    pub handler: Handler,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            password: "test".to_string(),
            auth: AuthBehavior::Native,
            corrupt_seq: false,
            handler: Arc::new(|_| Reply::ok()),
        }
    }
}

/// A running scripted server
pub struct TestServer {
    addr: SocketAddr,
    opened: Arc<AtomicUsize>,
    queries: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl TestServer {
    /// Start a server with the given statement handler and default auth
    pub async fn start(handler: impl Fn(&str) -> Reply + Send + Sync + 'static) -> TestServer {
        Self::start_with(ServerOptions {
            handler: Arc::new(handler),
            ..Default::default()
        })
        .await
    }

    pub async fn start_with(opts: ServerOptions) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let opened = Arc::new(AtomicUsize::new(0));
        let queries = Arc::new(Mutex::new(Vec::new()));
        let opts = Arc::new(opts);
        let task = tokio::spawn({
            let opened = opened.clone();
            let queries = queries.clone();
            async move {
                loop {
                    let Ok((socket, _)) = listener.accept().await else {
                        break;
                    };
                    opened.fetch_add(1, Ordering::SeqCst);
                    let opts = opts.clone();
                    let queries = queries.clone();
                    tokio::spawn(async move {
                        let _ = serve(socket, opts, queries).await;
                    });
                }
            }
        });
        TestServer {
            addr,
            opened,
            queries,
            task,
        }
    }

    /// Connection options pointed at this server
    pub fn options(&self) -> ConnectionOptions {
        ConnectionOptions::new()
            .host("127.0.0.1")
            .port(self.addr.port())
            .user("root")
            .password("test")
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Number of connections the server has accepted so far
    pub fn connections(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Every statement received, in arrival order
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn read_packet(socket: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 4];
    socket.read_exact(&mut header).await?;
    let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
    let seq = header[3];
    let mut payload = vec![0u8; len];
    socket.read_exact(&mut payload).await?;
    Ok((seq, payload))
}

async fn write_packet(socket: &mut TcpStream, seq: u8, payload: &[u8]) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(payload.len() + 4);
    let header = (payload.len() as u32) | ((seq as u32) << 24);
    buf.extend_from_slice(&header.to_le_bytes());
    buf.extend_from_slice(payload);
    socket.write_all(&buf).await
}

fn put_lenenc(out: &mut Vec<u8>, v: u64) {
    if v < 251 {
        out.push(v as u8);
    } else if v < 0x1_0000 {
        out.push(0xFC);
        out.extend_from_slice(&(v as u16).to_le_bytes());
    } else if v < 0x100_0000 {
        out.push(0xFD);
        out.extend_from_slice(&(v as u32).to_le_bytes()[..3]);
    } else {
        out.push(0xFE);
        out.extend_from_slice(&v.to_le_bytes());
    }
}

fn put_lenenc_str(out: &mut Vec<u8>, v: &[u8]) {
    put_lenenc(out, v.len() as u64);
    out.extend_from_slice(v);
}

fn greeting(auth: AuthBehavior, thread_id: u32) -> Vec<u8> {
    let mut out = vec![10];
    out.extend_from_slice(b"8.0.0-scripted\0");
    out.extend_from_slice(&thread_id.to_le_bytes());
    out.extend_from_slice(&SEED[..8]);
    out.push(0);
    let caps: u32 = capability::LONG_PASSWORD
        | capability::LONG_FLAG
        | capability::CONNECT_WITH_DB
        | capability::LOCAL_FILES
        | capability::PROTOCOL_41
        | capability::TRANSACTIONS
        | capability::SECURE_CONNECTION
        | capability::MULTI_RESULTS
        | capability::PLUGIN_AUTH
        | capability::CONNECT_ATTRS;
    out.extend_from_slice(&(caps as u16).to_le_bytes());
    out.push(45);
    out.extend_from_slice(&server_status::AUTOCOMMIT.to_le_bytes());
    out.extend_from_slice(&((caps >> 16) as u16).to_le_bytes());
    out.push(21);
    out.extend_from_slice(&[0; 10]);
    out.extend_from_slice(&SEED[8..]);
    out.push(0);
    let plugin = match auth {
        AuthBehavior::CachingSha2Fast => "caching_sha2_password",
        _ => "mysql_native_password",
    };
    out.extend_from_slice(plugin.as_bytes());
    out.push(0);
    out
}

fn ok_packet(affected: u64, insert_id: u64, status: u16) -> Vec<u8> {
    let mut out = vec![0x00];
    put_lenenc(&mut out, affected);
    put_lenenc(&mut out, insert_id);
    out.extend_from_slice(&(server_status::AUTOCOMMIT | status).to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out
}

fn eof_packet(status: u16) -> Vec<u8> {
    let mut out = vec![0xFE];
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&(server_status::AUTOCOMMIT | status).to_le_bytes());
    out
}

fn err_packet(code: u16, sqlstate: &str, message: &str) -> Vec<u8> {
    let mut out = vec![0xFF];
    out.extend_from_slice(&code.to_le_bytes());
    out.push(b'#');
    out.extend_from_slice(sqlstate.as_bytes());
    out.extend_from_slice(message.as_bytes());
    out
}

fn column_packet(c: &TestColumn) -> Vec<u8> {
    let mut out = Vec::new();
    put_lenenc_str(&mut out, b"def");
    put_lenenc_str(&mut out, b"test");
    put_lenenc_str(&mut out, c.table.as_bytes());
    put_lenenc_str(&mut out, c.table.as_bytes());
    put_lenenc_str(&mut out, c.name.as_bytes());
    put_lenenc_str(&mut out, c.name.as_bytes());
    put_lenenc(&mut out, 0x0c);
    out.extend_from_slice(&c.charset.to_le_bytes());
    out.extend_from_slice(&255u32.to_le_bytes());
    out.push(c.type_code);
    out.extend_from_slice(&c.flags.to_le_bytes());
    out.push(0);
    out.extend_from_slice(&0u16.to_le_bytes());
    out
}

fn row_packet(fields: &[Option<String>]) -> Vec<u8> {
    let mut out = Vec::new();
    for f in fields {
        match f {
            Some(s) => put_lenenc_str(&mut out, s.as_bytes()),
            None => out.push(0xFB),
        }
    }
    out
}

/// Pull the auth response out of a handshake response packet
fn parse_handshake_auth(payload: &[u8]) -> Vec<u8> {
    let mut i = 4 + 4 + 1 + 23;
    while payload.get(i).is_some_and(|b| *b != 0) {
        i += 1;
    }
    i += 1;
    let len = payload[i] as usize;
    i += 1;
    payload[i..i + len].to_vec()
}

async fn serve(
    mut socket: TcpStream,
    opts: Arc<ServerOptions>,
    queries: Arc<Mutex<Vec<String>>>,
) -> std::io::Result<()> {
    write_packet(&mut socket, 0, &greeting(opts.auth, 1)).await?;
    let (_, response) = read_packet(&mut socket).await?;
    let auth_data = parse_handshake_auth(&response);

    match opts.auth {
        AuthBehavior::Native => {
            if auth_data != scramble_native(&opts.password, SEED) {
                write_packet(
                    &mut socket,
                    2,
                    &err_packet(1045, "28000", "Access denied for user"),
                )
                .await?;
                return Ok(());
            }
            write_packet(&mut socket, 2, &ok_packet(0, 0, 0)).await?;
        }
        AuthBehavior::CachingSha2Fast => {
            if auth_data != scramble_sha256(&opts.password, SEED) {
                write_packet(
                    &mut socket,
                    2,
                    &err_packet(1045, "28000", "Access denied for user"),
                )
                .await?;
                return Ok(());
            }
            write_packet(&mut socket, 2, &[0x01, 0x03]).await?;
            write_packet(&mut socket, 3, &ok_packet(0, 0, 0)).await?;
        }
        AuthBehavior::SwitchSeed => {
            let mut switch = vec![0xFE];
            switch.extend_from_slice(b"mysql_native_password\0");
            switch.extend_from_slice(SWITCH_SEED);
            switch.push(0);
            write_packet(&mut socket, 2, &switch).await?;
            let (_, data) = read_packet(&mut socket).await?;
            if data != scramble_native(&opts.password, SWITCH_SEED) {
                write_packet(
                    &mut socket,
                    4,
                    &err_packet(1045, "28000", "Access denied for user"),
                )
                .await?;
                return Ok(());
            }
            write_packet(&mut socket, 4, &ok_packet(0, 0, 0)).await?;
        }
    }

    loop {
        let (_, payload) = match read_packet(&mut socket).await {
            Ok(v) => v,
            Err(_) => return Ok(()),
        };
        let Some((&cmd, rest)) = payload.split_first() else {
            return Ok(());
        };
        match cmd {
            // COM_QUIT
            0x01 => return Ok(()),
            // COM_INIT_DB
            0x02 => write_packet(&mut socket, 1, &ok_packet(0, 0, 0)).await?,
            // COM_PING
            0x0E => write_packet(&mut socket, 1, &ok_packet(0, 0, 0)).await?,
            // COM_QUERY
            0x03 => {
                let sql = String::from_utf8_lossy(rest).into_owned();
                queries.lock().unwrap().push(sql.clone());
                let reply = (opts.handler)(&sql);
                let first_seq = if opts.corrupt_seq { 9 } else { 1 };
                send_reply(&mut socket, first_seq, reply).await?;
            }
            _ => {
                write_packet(&mut socket, 1, &err_packet(1047, "08S01", "unknown command")).await?
            }
        }
    }
}

fn send_reply<'a>(
    socket: &'a mut TcpStream,
    seq: u8,
    reply: Reply,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = std::io::Result<()>> + Send + 'a>> {
    Box::pin(send_reply_inner(socket, seq, reply))
}

async fn send_reply_inner(
    socket: &mut TcpStream,
    mut seq: u8,
    reply: Reply,
) -> std::io::Result<()> {
    match reply {
        Reply::Ok {
            affected,
            insert_id,
            status,
        } => write_packet(socket, seq, &ok_packet(affected, insert_id, status)).await,
        Reply::Err {
            code,
            sqlstate,
            message,
        } => write_packet(socket, seq, &err_packet(code, sqlstate, &message)).await,
        Reply::Hang(delay) => {
            tokio::time::sleep(delay).await;
            write_packet(socket, seq, &ok_packet(0, 0, 0)).await
        }
        Reply::Infile { filename, sink } => {
            let mut request = vec![0xFB];
            request.extend_from_slice(filename.as_bytes());
            write_packet(socket, seq, &request).await?;
            let mut collected = Vec::new();
            loop {
                let (client_seq, data) = read_packet(socket).await?;
                seq = client_seq.wrapping_add(1);
                if data.is_empty() {
                    break;
                }
                collected.extend_from_slice(&data);
            }
            sink.lock().unwrap().extend_from_slice(&collected);
            write_packet(socket, seq, &ok_packet(1, 0, 0)).await
        }
        Reply::Rows {
            columns,
            rows,
            status,
            more,
        } => {
            let mut head = Vec::new();
            put_lenenc(&mut head, columns.len() as u64);
            write_packet(socket, seq, &head).await?;
            seq = seq.wrapping_add(1);
            for c in &columns {
                write_packet(socket, seq, &column_packet(c)).await?;
                seq = seq.wrapping_add(1);
            }
            write_packet(socket, seq, &eof_packet(0)).await?;
            seq = seq.wrapping_add(1);
            for r in &rows {
                write_packet(socket, seq, &row_packet(r)).await?;
                seq = seq.wrapping_add(1);
            }
            let more_flag = if more.is_some() {
                server_status::MORE_RESULTS_EXISTS
            } else {
                0
            };
            write_packet(socket, seq, &eof_packet(status | more_flag)).await?;
            seq = seq.wrapping_add(1);
            if let Some(next) = more {
                send_reply(socket, seq, *next).await?;
            }
            Ok(())
        }
    }
}
