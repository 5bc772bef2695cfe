//! Handle a single connection to MySQL/MariaDB
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::auth::{self, AuthPlugin};
use crate::charset::{self, Charset};
use crate::constants::{capability, com, server_status};
use crate::cursor::{Cursor, CursorKind, Dicts, StreamDicts, StreamTuples, Tuples};
use crate::error::{Error, Result, ServerError};
use crate::opts::{ConnectionOptions, TlsOptions};
use crate::packet::{self, PacketParser, WithLoc};
use crate::stream::{NetStream, PacketStream};
use crate::value::{self, decode_field, default_converters, Column, Converters, Value};

/// Largest packet we announce to the server
const MAX_PACKET: u32 = 0xFF_FFFF;

/// Chunk size used when streaming a local file to the server
const INFILE_CHUNK: usize = 16 * 1024;

/// Shared handle that lets the pool fail a connection's in-flight I/O
pub(crate) struct KillSwitch {
    /// Set once the connection has been terminated
    killed: AtomicBool,
    /// Wakes tasks blocked in packet I/O
    notify: Notify,
}

impl KillSwitch {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            killed: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    /// Terminate: anything blocked in packet I/O fails promptly
    pub(crate) fn kill(&self) {
        self.killed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub(crate) fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// Resolve once the connection has been terminated
    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_killed() {
                return;
            }
            notified.await;
        }
    }
}

/// Values carried by an OK packet, or by a classic EOF packet
struct OkPacket {
    affected_rows: u64,
    insert_id: u64,
    server_status: u16,
    warning_count: u16,
    message: Option<String>,
}

/// Parse an OK packet; short `0xFE` packets are classic EOF terminators
fn parse_ok(payload: &[u8]) -> Result<OkPacket> {
    let mut p = PacketParser::new(payload);
    let header = p.get_u8().loc("ok header")?;
    if header == 0xFE && payload.len() < 9 {
        let warning_count = p.get_u16().loc("eof warnings")?;
        let server_status = p.get_u16().loc("eof status")?;
        return Ok(OkPacket {
            affected_rows: 0,
            insert_id: 0,
            server_status,
            warning_count,
            message: None,
        });
    }
    let affected_rows = p.get_lenenc().loc("affected rows")?;
    let insert_id = p.get_lenenc().loc("insert id")?;
    let server_status = p.get_u16().loc("status flags")?;
    let warning_count = p.get_u16().loc("warning count")?;
    let rest = p.get_rest();
    let message = if rest.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(rest).into_owned())
    };
    Ok(OkPacket {
        affected_rows,
        insert_id,
        server_status,
        warning_count,
        message,
    })
}

/// Parse an ERR packet into a classified error
fn parse_err(payload: &[u8]) -> Error {
    let mut p = PacketParser::new(payload);
    let inner = (|| -> Result<Error> {
        p.get_u8().loc("err header")?;
        let code = p.get_u16().loc("error code")?;
        let sqlstate = if matches!(p.peek_u8(), Ok(b'#')) {
            p.get_u8().loc("sqlstate marker")?;
            let state = p.get_bytes(5).loc("sqlstate")?;
            String::from_utf8_lossy(state).into_owned()
        } else {
            "HY000".to_string()
        };
        let message = String::from_utf8_lossy(p.get_rest()).into_owned();
        Ok(Error::from_err_packet(code, sqlstate, message))
    })();
    match inner {
        Ok(e) => e,
        Err(e) => e,
    }
}

fn lossy(v: &[u8]) -> String {
    String::from_utf8_lossy(v).into_owned()
}

/// Parse a column definition packet
fn parse_column_definition(payload: &[u8]) -> Result<Column> {
    let mut p = PacketParser::new(payload);
    let catalog = lossy(p.get_lenenc_blob().loc("catalog")?);
    let db = lossy(p.get_lenenc_blob().loc("schema")?);
    let table = lossy(p.get_lenenc_blob().loc("table")?);
    let org_table = lossy(p.get_lenenc_blob().loc("org_table")?);
    let name = lossy(p.get_lenenc_blob().loc("name")?);
    let org_name = lossy(p.get_lenenc_blob().loc("org_name")?);
    p.get_lenenc().loc("length of fixed length fields")?;
    let charset_id = p.get_u16().loc("character set")?;
    let length = p.get_u32().loc("column length")?;
    let type_code = p.get_u8().loc("type")?;
    let flags = p.get_u16().loc("flags")?;
    let decimals = p.get_u8().loc("decimals")?;
    Ok(Column {
        catalog,
        db,
        table,
        org_table,
        name,
        org_name,
        charset_id,
        length,
        type_code,
        flags,
        decimals,
    })
}

/// The server greeting that opens the handshake
struct Greeting {
    server_version: String,
    thread_id: u32,
    seed: Vec<u8>,
    capabilities: u32,
    server_status: u16,
    auth_plugin: String,
}

fn parse_greeting(payload: &[u8]) -> Result<Greeting> {
    let mut p = PacketParser::new(payload);
    let protocol_version = p.get_u8().loc("protocol version")?;
    if protocol_version != 10 {
        return Err(Error::protocol(format!(
            "unsupported protocol version {protocol_version}"
        )));
    }
    let server_version = p.get_null_str().loc("server version")?.to_string();
    let thread_id = p.get_u32().loc("thread id")?;
    let mut seed = p.get_bytes(8).loc("auth data")?.to_vec();
    p.skip(1).loc("filler")?;
    let cap_low = p.get_u16().loc("capability flags")?;
    p.get_u8().loc("character set")?;
    let status = p.get_u16().loc("status flags")?;
    let cap_high = p.get_u16().loc("capability flags")?;
    let capabilities = cap_low as u32 | ((cap_high as u32) << 16);
    let auth_data_len = p.get_u8().loc("auth data length")?;
    p.skip(10).loc("reserved")?;
    if capabilities & capability::SECURE_CONNECTION != 0 {
        let extra = std::cmp::max(13, auth_data_len.saturating_sub(8) as usize);
        let extra = std::cmp::min(extra, p.remaining());
        seed.extend_from_slice(p.get_bytes(extra).loc("auth data")?);
        while seed.last() == Some(&0) {
            seed.pop();
        }
    }
    let auth_plugin = if capabilities & capability::PLUGIN_AUTH != 0 {
        match p.get_null_str() {
            Ok(v) => v.to_string(),
            // some servers do not terminate the plugin name
            Err(_) => p.get_eof_str().loc("auth plugin")?.to_string(),
        }
    } else {
        String::new()
    };
    Ok(Greeting {
        server_version,
        thread_id,
        seed,
        capabilities,
        server_status: status,
        auth_plugin,
    })
}

/// One result set read from the server
pub(crate) struct ResultSet {
    /// Rows affected, or for a buffered result set the number of rows read
    pub affected_rows: u64,
    /// Auto increment id assigned by the statement
    pub insert_id: u64,
    /// Status flags of the terminating OK/EOF packet
    pub server_status: u16,
    /// Warning count of the terminating packet
    pub warning_count: u16,
    /// Human readable info from the OK packet
    pub message: Option<String>,
    /// Column definitions, empty for statements without rows
    pub columns: Arc<[Column]>,
    /// Buffered rows; None for execute-style results and streaming sets
    pub rows: Option<Vec<Vec<Value>>>,
    /// The set is being streamed row by row
    pub unbuffered: bool,
    /// All rows of a streaming set have been consumed
    pub finished: bool,
}

impl ResultSet {
    /// Another result set follows this one
    pub fn has_next(&self) -> bool {
        self.server_status & server_status::MORE_RESULTS_EXISTS != 0
    }

    fn from_ok(ok: OkPacket) -> Self {
        ResultSet {
            affected_rows: ok.affected_rows,
            insert_id: ok.insert_id,
            server_status: ok.server_status,
            warning_count: ok.warning_count,
            message: ok.message,
            columns: Vec::new().into(),
            rows: None,
            unbuffered: false,
            finished: true,
        }
    }
}

/// A row packet, or the terminator ending the row stream
enum RowPacket {
    Row(Vec<Value>),
    End(OkPacket),
}

/// Build a TLS connector from the options
fn tls_connector(opts: &TlsOptions) -> Result<TlsConnector> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if let Some(path) = &opts.ca_file {
        let pem = std::fs::read(path).map_err(Error::Io)?;
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            let cert = cert.map_err(Error::Io)?;
            roots
                .add(cert)
                .map_err(|e| Error::programming(format!("invalid CA certificate: {e}")))?;
        }
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// The decoder table derived from the connect options
fn build_converters(opts: &ConnectionOptions) -> Converters {
    use crate::constants::type_;
    let mut conv = opts.conv.clone().unwrap_or_else(default_converters);
    if !opts.use_unicode {
        for t in [
            type_::VAR_CHAR,
            type_::VAR_STRING,
            type_::STRING,
            type_::ENUM,
            type_::SET,
            type_::TINY_BLOB,
            type_::MEDIUM_BLOB,
            type_::LONG_BLOB,
            type_::BLOB,
            type_::JSON,
        ] {
            conv.insert(t, value::decode_bytes);
        }
    }
    conv
}

/// A connection to MySQL/MariaDB
///
/// At most one command is in flight per connection; a new command before the
/// previous result was fully consumed is a programming error. Between
/// commands the read buffer is empty.
impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

pub struct Connection {
    /// Packet framing over the transport; None once the connection is closed
    stream: Option<PacketStream<NetStream>>,
    /// Options the connection was established with, kept for reconnects
    opts: ConnectionOptions,
    /// Lets the pool fail in-flight I/O on terminate
    kill: Arc<KillSwitch>,
    /// Capabilities both sides agreed on
    capabilities: u32,
    /// Capabilities announced by the server
    server_capabilities: u32,
    /// Version string from the greeting
    server_version: String,
    /// Connection id assigned by the server
    thread_id: u32,
    /// Status flags of the most recent OK/EOF packet
    server_status: u16,
    /// Character set negotiated at handshake
    charset: &'static Charset,
    /// Database currently selected
    db: String,
    /// Decoder table used for row values
    converters: Arc<Converters>,
    /// The most recent result set
    result: Option<ResultSet>,
    /// Affected rows of the most recent OK packet
    affected_rows: u64,
    /// Insert id of the most recent OK packet
    insert_id: u64,
    /// Warning count of the most recent OK packet
    warning_count: u16,
    /// Info message of the most recent OK packet
    info: Option<String>,
    /// True when the connection went through the TLS upgrade
    tls: bool,
}

impl Connection {
    /// Connect and authenticate
    ///
    /// `connect_timeout` bounds the whole sequence including the handshake.
    pub async fn connect(options: ConnectionOptions) -> Result<Connection> {
        match options.connect_timeout {
            Some(t) => tokio::time::timeout(t, Self::connect_inner(options))
                .await
                .map_err(|_| Error::Interface("connect timed out".to_string()))?,
            None => Self::connect_inner(options).await,
        }
    }

    async fn connect_inner(mut opts: ConnectionOptions) -> Result<Connection> {
        opts.apply_defaults_file()?;
        let charset = charset::by_name(&opts.charset)
            .ok_or_else(|| Error::programming(format!("unknown charset {:?}", opts.charset)))?;

        let net = match &opts.unix_socket {
            #[cfg(unix)]
            Some(path) => NetStream::Unix(tokio::net::UnixStream::connect(path).await?),
            #[cfg(not(unix))]
            Some(_) => {
                return Err(Error::not_supported(
                    "unix sockets on this platform".to_string(),
                ))
            }
            None => {
                let tcp = TcpStream::connect((opts.host.as_str(), opts.port)).await?;
                tcp.set_nodelay(true)?;
                NetStream::Tcp(tcp)
            }
        };
        let mut stream = PacketStream::new(net);

        let payload = stream.read_packet().await?;
        let greeting = parse_greeting(&payload)?;
        debug!(
            server_version = %greeting.server_version,
            thread_id = greeting.thread_id,
            "greeting received"
        );

        let mut capabilities = capability::LONG_PASSWORD
            | capability::LONG_FLAG
            | capability::PROTOCOL_41
            | capability::TRANSACTIONS
            | capability::SECURE_CONNECTION
            | capability::MULTI_RESULTS
            | capability::PLUGIN_AUTH
            | opts.client_flag;
        if !opts.db.is_empty() {
            capabilities |= capability::CONNECT_WITH_DB;
        }
        if opts.local_infile {
            capabilities |= capability::LOCAL_FILES;
        }
        if opts.program_name.is_some() {
            capabilities |= capability::CONNECT_ATTRS;
        }
        if opts.ssl.is_some() {
            capabilities |= capability::SSL;
        }
        // acknowledged but never negotiated
        capabilities &= !capability::COMPRESS;

        let mut tls = false;
        if let Some(tls_opts) = &opts.ssl {
            if greeting.capabilities & capability::SSL == 0 {
                return Err(Error::not_supported(
                    "server does not announce TLS support".to_string(),
                ));
            }
            if opts.unix_socket.is_some() {
                return Err(Error::not_supported("TLS over a unix socket".to_string()));
            }
            // short handshake response that only switches the transport
            let mut ssl_request = Vec::with_capacity(32);
            ssl_request.extend_from_slice(&capabilities.to_le_bytes());
            ssl_request.extend_from_slice(&MAX_PACKET.to_le_bytes());
            ssl_request.push(charset.id as u8);
            ssl_request.extend_from_slice(&[0; 23]);
            stream.write_packet(&ssl_request).await?;

            let (net, seq) = stream.into_parts();
            let NetStream::Tcp(tcp) = net else {
                return Err(Error::protocol("TLS upgrade on a non-TCP stream"));
            };
            let connector = tls_connector(tls_opts)?;
            let name = ServerName::try_from(opts.host.clone()).map_err(|_| {
                Error::programming(format!("invalid TLS server name {:?}", opts.host))
            })?;
            let upgraded = connector.connect(name, tcp).await?;
            stream = PacketStream::from_parts(NetStream::Tls(Box::new(upgraded)), seq);
            tls = true;
        }

        let secure = tls || opts.unix_socket.is_some();
        let mut plugin = if opts.auth_plugin.is_empty() {
            AuthPlugin::from_name(&greeting.auth_plugin)?
        } else {
            AuthPlugin::from_name(&opts.auth_plugin)?
        };
        let mut seed = greeting.seed.clone();
        let auth_data = plugin.initial_response(&opts.password, &seed, secure);

        let mut response = Vec::with_capacity(128);
        response.extend_from_slice(&capabilities.to_le_bytes());
        response.extend_from_slice(&MAX_PACKET.to_le_bytes());
        response.push(charset.id as u8);
        response.extend_from_slice(&[0; 23]);
        packet::put_str_null(&mut response, &opts.user);
        response.push(auth_data.len() as u8);
        response.extend_from_slice(&auth_data);
        if capabilities & capability::CONNECT_WITH_DB != 0 {
            packet::put_str_null(&mut response, &opts.db);
        }
        packet::put_str_null(&mut response, plugin.name());
        if let Some(program_name) = &opts.program_name {
            let mut attrs = Vec::new();
            packet::put_lenenc_bytes(&mut attrs, b"_client_name");
            packet::put_lenenc_bytes(&mut attrs, b"sable-mysql");
            packet::put_lenenc_bytes(&mut attrs, b"program_name");
            packet::put_lenenc_bytes(&mut attrs, program_name.as_bytes());
            packet::put_lenenc(&mut response, attrs.len() as u64);
            response.extend_from_slice(&attrs);
        }
        stream.write_packet(&response).await?;

        // drive the plugin state machine until the server accepts or rejects
        let ok = loop {
            let payload = stream.read_packet().await?;
            match payload.first().copied() {
                Some(0x00) => break parse_ok(&payload)?,
                Some(0xFF) => return Err(parse_err(&payload)),
                Some(0xFE) => {
                    // auth switch request
                    let mut p = PacketParser::new(&payload[1..]);
                    let name = p.get_null_str().loc("auth switch plugin")?.to_string();
                    let mut new_seed = p.get_rest().to_vec();
                    while new_seed.last() == Some(&0) {
                        new_seed.pop();
                    }
                    plugin = AuthPlugin::from_name(&name)?;
                    seed = new_seed;
                    let data = plugin.initial_response(&opts.password, &seed, secure);
                    stream.write_packet(&data).await?;
                }
                Some(0x01) => {
                    let extra = &payload[1..];
                    match plugin {
                        AuthPlugin::CachingSha2Password => match extra.first().copied() {
                            // fast path accepted, the OK follows
                            Some(3) => continue,
                            Some(4) => {
                                if secure {
                                    let mut pw = opts.password.as_bytes().to_vec();
                                    pw.push(0);
                                    stream.write_packet(&pw).await?;
                                } else {
                                    let pem = match &opts.server_public_key {
                                        Some(pem) => pem.clone(),
                                        None => {
                                            stream.write_packet(&[2]).await?;
                                            let pk = stream.read_packet().await?;
                                            if pk.first() != Some(&0x01) {
                                                return Err(Error::protocol(
                                                    "expected public key packet",
                                                ));
                                            }
                                            String::from_utf8_lossy(&pk[1..]).into_owned()
                                        }
                                    };
                                    let encrypted =
                                        auth::encrypt_password(&pem, &opts.password, &seed)?;
                                    stream.write_packet(&encrypted).await?;
                                }
                            }
                            v => {
                                return Err(Error::protocol(format!(
                                    "unexpected sha2 auth state {v:?}"
                                )))
                            }
                        },
                        AuthPlugin::Sha256Password => {
                            // the payload is the server public key
                            let pem = String::from_utf8_lossy(extra).into_owned();
                            let encrypted = auth::encrypt_password(&pem, &opts.password, &seed)?;
                            stream.write_packet(&encrypted).await?;
                        }
                        _ => return Err(Error::protocol("unexpected extra auth data")),
                    }
                }
                v => return Err(Error::protocol(format!("unexpected auth response {v:?}"))),
            }
        };

        let converters = Arc::new(build_converters(&opts));
        let db = opts.db.clone();
        let mut conn = Connection {
            stream: Some(stream),
            kill: KillSwitch::new(),
            capabilities,
            server_capabilities: greeting.capabilities,
            server_version: greeting.server_version,
            thread_id: greeting.thread_id,
            server_status: ok.server_status,
            charset,
            db,
            converters,
            result: None,
            affected_rows: 0,
            insert_id: 0,
            warning_count: 0,
            info: None,
            tls,
            opts,
        };

        if let Some(mode) = conn.opts.sql_mode.clone() {
            let mut q = b"SET sql_mode=".to_vec();
            value::escape_str(&mode, false, &mut q);
            conn.query_drop(&q).await?;
        }
        if let Some(init) = conn.opts.init_command.clone() {
            conn.query_drop(init.as_bytes()).await?;
        }
        match conn.opts.autocommit {
            Some(true) if conn.server_status & server_status::AUTOCOMMIT == 0 => {
                conn.query_drop(b"SET AUTOCOMMIT = 1").await?;
            }
            Some(false) if conn.server_status & server_status::AUTOCOMMIT != 0 => {
                conn.query_drop(b"SET AUTOCOMMIT = 0").await?;
            }
            _ => {}
        }
        debug!(host = %conn.opts.host, user = %conn.opts.user, "connected");
        Ok(conn)
    }

    fn closed_err() -> Error {
        Error::Interface("connection is closed".to_string())
    }

    /// Read one packet, failing fast when the connection is terminated
    ///
    /// Transport failures close the connection so it is never reused in a
    /// half-read state.
    async fn read_packet(&mut self) -> Result<Bytes> {
        let kill = self.kill.clone();
        let stream = self.stream.as_mut().ok_or_else(Self::closed_err)?;
        let r = tokio::select! {
            biased;
            _ = kill.wait() => Err(Error::Interface("connection terminated".to_string())),
            r = stream.read_packet() => r,
        };
        if let Err(e) = &r {
            if e.is_fatal() {
                self.stream = None;
            }
        }
        r
    }

    /// Write one packet without resetting the sequence counter
    async fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        let kill = self.kill.clone();
        let stream = self.stream.as_mut().ok_or_else(Self::closed_err)?;
        let r = tokio::select! {
            biased;
            _ = kill.wait() => Err(Error::Interface("connection terminated".to_string())),
            r = stream.write_packet(payload) => r,
        };
        if let Err(e) = &r {
            if e.is_fatal() {
                self.stream = None;
            }
        }
        r
    }

    /// Start a new command
    async fn write_command(&mut self, cmd: u8, payload: &[u8]) -> Result<()> {
        if let Some(r) = &self.result {
            if r.unbuffered && !r.finished {
                return Err(Error::programming(
                    "previous result set is not fully consumed".to_string(),
                ));
            }
            if r.has_next() {
                return Err(Error::programming(
                    "previous command has unread result sets".to_string(),
                ));
            }
        }
        let stream = self.stream.as_mut().ok_or_else(Self::closed_err)?;
        debug_assert!(stream.buffer_is_empty());
        stream.reset_seq();
        let mut buf = Vec::with_capacity(payload.len() + 1);
        buf.push(cmd);
        buf.extend_from_slice(payload);
        self.write_packet(&buf).await
    }

    /// Send a text protocol query and read its result
    pub(crate) async fn query(&mut self, sql: &[u8], unbuffered: bool) -> Result<u64> {
        if self.opts.echo {
            info!(sql = %String::from_utf8_lossy(sql), "query");
        }
        self.write_command(com::QUERY, sql).await?;
        self.read_query_result(unbuffered).await?;
        Ok(self.affected_rows)
    }

    /// Execute a statement, discarding any rows
    pub(crate) async fn query_drop(&mut self, sql: &[u8]) -> Result<()> {
        self.query(sql, false).await?;
        Ok(())
    }

    fn apply_result(&mut self, result: ResultSet) {
        self.affected_rows = result.affected_rows;
        self.insert_id = result.insert_id;
        self.warning_count = result.warning_count;
        self.server_status = result.server_status;
        self.info = result.message.clone();
        self.result = Some(result);
    }

    /// Read the response of a command: OK, ERR, a result set, or a request
    /// for a local file
    async fn read_query_result(&mut self, unbuffered: bool) -> Result<()> {
        self.result = None;
        let payload = self.read_packet().await?;
        let result = match payload.first().copied() {
            Some(0x00) => ResultSet::from_ok(parse_ok(&payload)?),
            Some(0xFF) => return Err(parse_err(&payload)),
            Some(0xFB) => {
                let filename = payload[1..].to_vec();
                self.send_local_file(&filename).await?
            }
            Some(_) => self.read_result_set(&payload, unbuffered).await?,
            None => return Err(Error::protocol("empty response packet")),
        };
        self.apply_result(result);
        Ok(())
    }

    /// Read column definitions and, for buffered sets, all rows
    async fn read_result_set(&mut self, first: &[u8], unbuffered: bool) -> Result<ResultSet> {
        let column_count = PacketParser::new(first).get_lenenc().loc("column count")? as usize;
        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let payload = self.read_packet().await?;
            columns.push(parse_column_definition(&payload)?);
        }
        if self.capabilities & capability::DEPRECATE_EOF == 0 {
            let payload = self.read_packet().await?;
            if payload.first() != Some(&0xFE) {
                return Err(Error::protocol("expected EOF after column definitions"));
            }
        }
        let columns: Arc<[Column]> = columns.into();
        if unbuffered {
            return Ok(ResultSet {
                affected_rows: 0,
                insert_id: 0,
                server_status: self.server_status,
                warning_count: 0,
                message: None,
                columns,
                rows: None,
                unbuffered: true,
                finished: false,
            });
        }
        let mut rows = Vec::new();
        loop {
            match self.read_row(&columns).await? {
                RowPacket::Row(row) => rows.push(row),
                RowPacket::End(ok) => {
                    return Ok(ResultSet {
                        affected_rows: rows.len() as u64,
                        insert_id: ok.insert_id,
                        server_status: ok.server_status,
                        warning_count: ok.warning_count,
                        message: ok.message,
                        columns,
                        rows: Some(rows),
                        unbuffered: false,
                        finished: true,
                    });
                }
            }
        }
    }

    /// Read one row packet or the terminator of the row stream
    async fn read_row(&mut self, columns: &[Column]) -> Result<RowPacket> {
        let payload = self.read_packet().await?;
        match payload.first().copied() {
            Some(0xFF) => Err(parse_err(&payload)),
            Some(0xFE) if payload.len() < 9 => Ok(RowPacket::End(parse_ok(&payload)?)),
            Some(_) => {
                let mut p = PacketParser::new(&payload);
                let mut row = Vec::with_capacity(columns.len());
                for c in columns {
                    let raw = p.get_lenenc_blob_or_null().loc("row field")?;
                    row.push(decode_field(&self.converters, c, raw)?);
                }
                Ok(RowPacket::Row(row))
            }
            None => Err(Error::protocol("empty row packet")),
        }
    }

    /// Pull one row of a streaming result set
    pub(crate) async fn next_row(&mut self) -> Result<Option<Vec<Value>>> {
        let columns = match &self.result {
            Some(r) if r.unbuffered && !r.finished => r.columns.clone(),
            _ => return Ok(None),
        };
        match self.read_row(&columns).await? {
            RowPacket::Row(row) => Ok(Some(row)),
            RowPacket::End(ok) => {
                self.server_status = ok.server_status;
                self.warning_count = ok.warning_count;
                let r = self.result.as_mut().expect("streaming result");
                r.finished = true;
                r.server_status = ok.server_status;
                r.warning_count = ok.warning_count;
                Ok(None)
            }
        }
    }

    /// Drain the rest of a streaming result set
    pub(crate) async fn finish_current_result(&mut self) -> Result<()> {
        while self.next_row().await?.is_some() {}
        Ok(())
    }

    /// True when another result set can be read with [Self::next_result]
    pub(crate) fn has_more_results(&self) -> bool {
        self.result.as_ref().is_some_and(|r| r.has_next())
    }

    /// Advance to the next result set of a multi-result response
    pub(crate) async fn next_result(&mut self, unbuffered: bool) -> Result<bool> {
        if !self.has_more_results() {
            return Ok(false);
        }
        if let Some(r) = &self.result {
            if r.unbuffered && !r.finished {
                return Err(Error::programming(
                    "previous result set is not fully consumed".to_string(),
                ));
            }
        }
        self.read_query_result(unbuffered).await?;
        Ok(true)
    }

    /// Stream a local file to the server after a LOAD DATA LOCAL INFILE
    /// request
    ///
    /// The path comes from the server and is opened as-is; enabling
    /// `local_infile` means trusting the server.
    async fn send_local_file(&mut self, filename: &[u8]) -> Result<ResultSet> {
        let filename = String::from_utf8_lossy(filename).into_owned();
        let mut file_error = None;
        if self.opts.local_infile {
            match tokio::fs::File::open(&filename).await {
                Ok(mut file) => {
                    let mut chunk = vec![0u8; INFILE_CHUNK];
                    loop {
                        match file.read(&mut chunk).await {
                            Ok(0) => break,
                            Ok(n) => self.write_packet(&chunk[..n]).await?,
                            Err(e) => {
                                file_error = Some(Error::Operational(ServerError {
                                    code: 1017,
                                    sqlstate: "HY000".to_string(),
                                    message: format!("error reading {filename:?}: {e}"),
                                }));
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    file_error = Some(Error::Operational(ServerError {
                        code: 1017,
                        sqlstate: "HY000".to_string(),
                        message: format!("cannot open {filename:?}: {e}"),
                    }));
                }
            }
        } else {
            warn!(file = %filename, "server requested a local file but local_infile is disabled");
        }
        // the empty packet ends the transfer and doubles as the refusal
        self.write_packet(&[]).await?;
        let payload = self.read_packet().await?;
        let result = match payload.first().copied() {
            Some(0x00) => ResultSet::from_ok(parse_ok(&payload)?),
            Some(0xFF) => return Err(parse_err(&payload)),
            v => {
                return Err(Error::protocol(format!(
                    "unexpected response {v:?} after file transfer"
                )))
            }
        };
        match file_error {
            Some(e) => Err(e),
            None => Ok(result),
        }
    }

    /// Create a buffered cursor returning tuple rows
    pub fn cursor(&mut self) -> Cursor<'_, Tuples> {
        Cursor::new(self)
    }

    /// Create a buffered cursor returning name-keyed rows
    pub fn dict_cursor(&mut self) -> Cursor<'_, Dicts> {
        Cursor::new(self)
    }

    /// Create a streaming cursor returning tuple rows
    pub fn stream_cursor(&mut self) -> Cursor<'_, StreamTuples> {
        Cursor::new(self)
    }

    /// Create a streaming cursor returning name-keyed rows
    pub fn stream_dict_cursor(&mut self) -> Cursor<'_, StreamDicts> {
        Cursor::new(self)
    }

    /// Create a cursor of any kind
    pub fn cursor_of<K: CursorKind>(&mut self) -> Cursor<'_, K> {
        Cursor::new(self)
    }

    /// Check that the connection is alive
    ///
    /// With `reconnect` a dead connection is re-established instead of
    /// failing.
    pub async fn ping(&mut self, reconnect: bool) -> Result<()> {
        if self.stream.is_none() {
            if !reconnect {
                return Err(Self::closed_err());
            }
            self.reconnect().await?;
        }
        match self.ping_once().await {
            Ok(()) => Ok(()),
            Err(e) if reconnect && e.is_fatal() => {
                self.reconnect().await?;
                self.ping_once().await
            }
            Err(e) => Err(e),
        }
    }

    async fn ping_once(&mut self) -> Result<()> {
        self.write_command(com::PING, &[]).await?;
        let payload = self.read_packet().await?;
        match payload.first().copied() {
            Some(0x00) => {
                let ok = parse_ok(&payload)?;
                self.server_status = ok.server_status;
                Ok(())
            }
            Some(0xFF) => Err(parse_err(&payload)),
            v => Err(Error::protocol(format!("unexpected response {v:?} to ping"))),
        }
    }

    async fn reconnect(&mut self) -> Result<()> {
        let kill = self.kill.clone();
        *self = Connection::connect(self.opts.clone()).await?;
        // keep the pool's terminate handle working across the reconnect
        self.kill = kill;
        Ok(())
    }

    /// Change the default database
    pub async fn select_db(&mut self, db: &str) -> Result<()> {
        self.write_command(com::INIT_DB, db.as_bytes()).await?;
        let payload = self.read_packet().await?;
        match payload.first().copied() {
            Some(0x00) => {
                let ok = parse_ok(&payload)?;
                self.server_status = ok.server_status;
                self.db = db.to_string();
                Ok(())
            }
            Some(0xFF) => Err(parse_err(&payload)),
            v => Err(Error::protocol(format!(
                "unexpected response {v:?} to init db"
            ))),
        }
    }

    /// Enable or disable autocommit on the server
    pub async fn autocommit(&mut self, value: bool) -> Result<()> {
        let sql: &[u8] = if value {
            b"SET AUTOCOMMIT = 1"
        } else {
            b"SET AUTOCOMMIT = 0"
        };
        self.query_drop(sql).await
    }

    /// Autocommit state as last reported by the server
    pub fn get_autocommit(&self) -> bool {
        self.server_status & server_status::AUTOCOMMIT != 0
    }

    /// Begin a transaction
    pub async fn begin(&mut self) -> Result<()> {
        self.query_drop(b"BEGIN").await
    }

    /// Commit the open transaction
    pub async fn commit(&mut self) -> Result<()> {
        self.query_drop(b"COMMIT").await
    }

    /// Roll the open transaction back
    pub async fn rollback(&mut self) -> Result<()> {
        self.query_drop(b"ROLLBACK").await
    }

    /// Fetch the warnings of the previous statement as (level, code, message)
    pub async fn show_warnings(&mut self) -> Result<Vec<(String, u16, String)>> {
        self.query(b"SHOW WARNINGS", false).await?;
        let rows = self
            .result
            .as_mut()
            .and_then(|r| r.rows.take())
            .unwrap_or_default();
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut it = row.into_iter();
            let level = match it.next() {
                Some(Value::Str(s)) => s,
                _ => String::new(),
            };
            let code = match it.next() {
                Some(Value::Int(v)) => v as u16,
                Some(Value::UInt(v)) => v as u16,
                _ => 0,
            };
            let message = match it.next() {
                Some(Value::Str(s)) => s,
                _ => String::new(),
            };
            out.push((level, code, message));
        }
        Ok(out)
    }

    /// Send COM_QUIT and close the transport
    ///
    /// Idempotent; the server closes its side without replying.
    pub async fn ensure_closed(&mut self) -> Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        stream.reset_seq();
        stream.write_packet(&[com::QUIT]).await.ok();
        stream.shutdown().await.ok();
        self.stream = None;
        Ok(())
    }

    /// Drop the transport immediately
    pub fn close(&mut self) {
        self.stream = None;
    }

    /// True once the connection has been closed
    pub fn closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Host the connection was opened against
    pub fn host(&self) -> &str {
        &self.opts.host
    }

    /// Port the connection was opened against
    pub fn port(&self) -> u16 {
        self.opts.port
    }

    /// Unix socket path the connection was opened against
    pub fn unix_socket(&self) -> Option<&str> {
        self.opts.unix_socket.as_deref()
    }

    /// Database currently selected
    pub fn db(&self) -> &str {
        &self.db
    }

    /// The user the connection authenticated as
    pub fn user(&self) -> &str {
        &self.opts.user
    }

    /// Character set negotiated at handshake
    pub fn charset(&self) -> &'static Charset {
        self.charset
    }

    /// Encoding label of the negotiated character set
    pub fn encoding(&self) -> &'static str {
        self.charset.encoding
    }

    /// Status flags of the most recent OK/EOF packet
    pub fn server_status(&self) -> u16 {
        self.server_status
    }

    /// Rows affected by the most recent statement
    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    /// Auto increment id assigned by the most recent statement
    pub fn insert_id(&self) -> u64 {
        self.insert_id
    }

    /// Warning count of the most recent statement
    pub fn warning_count(&self) -> u16 {
        self.warning_count
    }

    /// Info message of the most recent OK packet
    pub fn info(&self) -> Option<&str> {
        self.info.as_deref()
    }

    /// Version string announced by the server
    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Connection id assigned by the server
    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    /// Capabilities announced by the server
    pub fn server_capabilities(&self) -> u32 {
        self.server_capabilities
    }

    /// True when the connection went through the TLS upgrade
    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// True when an open transaction is on the connection
    pub fn in_transaction(&self) -> bool {
        self.server_status & server_status::IN_TRANS != 0
    }

    /// Kill handle used by the pool's terminate
    pub(crate) fn kill_handle(&self) -> Arc<KillSwitch> {
        self.kill.clone()
    }

    /// True when the connection can safely go back to a pool
    ///
    /// A connection with unread data or an open transaction must be closed
    /// instead, so the next acquirer never observes a half-read state.
    pub(crate) fn is_reusable(&self) -> bool {
        !self.closed()
            && !self.kill.is_killed()
            && !self.in_transaction()
            && self
                .result
                .as_ref()
                .is_none_or(|r| (!r.unbuffered || r.finished) && !r.has_next())
            && self.stream.as_ref().is_some_and(|s| s.buffer_is_empty())
    }

    /// Take the parts of the current result a cursor needs
    pub(crate) fn result_parts(&mut self) -> (Arc<[Column]>, Option<Vec<Vec<Value>>>, u64, bool) {
        match &mut self.result {
            Some(r) => (r.columns.clone(), r.rows.take(), r.affected_rows, r.unbuffered),
            None => (Vec::new().into(), None, 0, false),
        }
    }

    /// True when backslash escapes are disabled by the current sql mode
    pub(crate) fn backslash_escapes_disabled(&self) -> bool {
        self.server_status & server_status::NO_BACKSLASH_ESCAPES != 0
    }
}
