//! Options used to establish connections
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::value::Converters;

/// TLS settings for the in-handshake upgrade
///
/// Certificates are verified against the bundled web roots plus any extra
/// authority supplied here. TLS is only attempted over TCP.
#[derive(Clone, Default)]
pub struct TlsOptions {
    /// Extra root certificate file in PEM format
    pub ca_file: Option<PathBuf>,
}

/// Options used to establish a connection to MySQL/MariaDB
#[derive(Clone)]
pub struct ConnectionOptions {
    /// Host to connect to
    pub host: String,
    /// TCP port, ignored when a unix socket is given
    pub port: u16,
    /// The user to connect as
    pub user: String,
    /// The password for the user
    pub password: String,
    /// The database to select on connect, empty for none
    pub db: String,
    /// Connect over this unix socket instead of TCP
    pub unix_socket: Option<String>,
    /// Character set to negotiate
    pub charset: String,
    /// `sql_mode` applied right after the handshake
    pub sql_mode: Option<String>,
    /// Statement executed right after the handshake
    pub init_command: Option<String>,
    /// Bound on the whole connect-and-handshake sequence
    pub connect_timeout: Option<Duration>,
    /// Autocommit state to establish, server default is left alone when None
    pub autocommit: Option<bool>,
    /// Allow the server to request local files for `LOAD DATA LOCAL INFILE`
    pub local_infile: bool,
    /// Extra client capability flags to request
    pub client_flag: u32,
    /// Request a TLS upgrade during the handshake
    pub ssl: Option<TlsOptions>,
    /// Force a specific authentication plugin, empty uses the server default
    pub auth_plugin: String,
    /// Program name reported through connection attributes
    pub program_name: Option<String>,
    /// PEM public key of the server, skips the in-band key request of the
    /// sha2 authentication slow path
    pub server_public_key: Option<String>,
    /// Replacement decoder table, see [crate::value::Converters]
    pub conv: Option<Converters>,
    /// When false, string columns are decoded as raw bytes
    pub use_unicode: bool,
    /// Read connection defaults from this my.cnf style file
    pub read_default_file: Option<PathBuf>,
    /// Option group to read from the defaults file
    pub read_default_group: Option<String>,
    /// Log every statement sent on this connection
    pub echo: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: String::new(),
            password: String::new(),
            db: String::new(),
            unix_socket: None,
            charset: "utf8mb4".to_string(),
            sql_mode: None,
            init_command: None,
            connect_timeout: None,
            autocommit: None,
            local_infile: false,
            client_flag: 0,
            ssl: None,
            auth_plugin: String::new(),
            program_name: None,
            server_public_key: None,
            conv: None,
            use_unicode: true,
            read_default_file: None,
            read_default_group: None,
            echo: false,
        }
    }
}

impl ConnectionOptions {
    /// Construct options with all defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the host to connect to
    pub fn host(mut self, v: impl Into<String>) -> Self {
        self.host = v.into();
        self
    }

    /// Set the TCP port
    pub fn port(mut self, v: u16) -> Self {
        self.port = v;
        self
    }

    /// Set the user to connect as
    pub fn user(mut self, v: impl Into<String>) -> Self {
        self.user = v.into();
        self
    }

    /// Set the password
    pub fn password(mut self, v: impl Into<String>) -> Self {
        self.password = v.into();
        self
    }

    /// Set the database selected on connect
    pub fn db(mut self, v: impl Into<String>) -> Self {
        self.db = v.into();
        self
    }

    /// Connect over a unix socket instead of TCP
    pub fn unix_socket(mut self, v: impl Into<String>) -> Self {
        self.unix_socket = Some(v.into());
        self
    }

    /// Set the character set to negotiate
    pub fn charset(mut self, v: impl Into<String>) -> Self {
        self.charset = v.into();
        self
    }

    /// Set the `sql_mode` applied after connecting
    pub fn sql_mode(mut self, v: impl Into<String>) -> Self {
        self.sql_mode = Some(v.into());
        self
    }

    /// Set a statement to run right after connecting
    pub fn init_command(mut self, v: impl Into<String>) -> Self {
        self.init_command = Some(v.into());
        self
    }

    /// Bound the connect-and-handshake sequence
    pub fn connect_timeout(mut self, v: Duration) -> Self {
        self.connect_timeout = Some(v);
        self
    }

    /// Set the autocommit state established on connect
    pub fn autocommit(mut self, v: bool) -> Self {
        self.autocommit = Some(v);
        self
    }

    /// Allow `LOAD DATA LOCAL INFILE` to read local files
    pub fn local_infile(mut self, v: bool) -> Self {
        self.local_infile = v;
        self
    }

    /// Request a TLS upgrade during the handshake
    pub fn ssl(mut self, v: TlsOptions) -> Self {
        self.ssl = Some(v);
        self
    }

    /// Force a specific authentication plugin
    pub fn auth_plugin(mut self, v: impl Into<String>) -> Self {
        self.auth_plugin = v.into();
        self
    }

    /// Report a program name through connection attributes
    pub fn program_name(mut self, v: impl Into<String>) -> Self {
        self.program_name = Some(v.into());
        self
    }

    /// Provide the server public key for the sha2 authentication slow path
    pub fn server_public_key(mut self, pem: impl Into<String>) -> Self {
        self.server_public_key = Some(pem.into());
        self
    }

    /// Replace the decoder table
    pub fn conv(mut self, v: Converters) -> Self {
        self.conv = Some(v);
        self
    }

    /// Read connection defaults from a my.cnf style file
    pub fn read_default_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.read_default_file = Some(path.into());
        self
    }

    /// Pick the option group read from the defaults file
    pub fn read_default_group(mut self, group: impl Into<String>) -> Self {
        self.read_default_group = Some(group.into());
        self
    }

    /// Log every statement sent on this connection
    pub fn echo(mut self, v: bool) -> Self {
        self.echo = v;
        self
    }

    /// Merge values from the defaults file under explicitly set options
    ///
    /// Only fields still holding their built-in default are filled, so an
    /// explicit argument always wins over the file.
    pub(crate) fn apply_defaults_file(&mut self) -> Result<()> {
        let Some(path) = self.read_default_file.clone() else {
            return Ok(());
        };
        let text = std::fs::read_to_string(&path).map_err(Error::Io)?;
        let group = self.read_default_group.as_deref().unwrap_or("client");
        let defaults = parse_option_group(&text, group);
        let base = ConnectionOptions::default();
        if let Some(v) = defaults.get("host") {
            if self.host == base.host {
                self.host = v.clone();
            }
        }
        if let Some(v) = defaults.get("user") {
            if self.user == base.user {
                self.user = v.clone();
            }
        }
        if let Some(v) = defaults.get("password") {
            if self.password == base.password {
                self.password = v.clone();
            }
        }
        if let Some(v) = defaults.get("port") {
            if self.port == base.port {
                self.port = v
                    .parse()
                    .map_err(|_| Error::programming(format!("invalid port in {path:?}: {v}")))?;
            }
        }
        if let Some(v) = defaults.get("socket") {
            if self.unix_socket.is_none() {
                self.unix_socket = Some(v.clone());
            }
        }
        if let Some(v) = defaults.get("default-character-set") {
            if self.charset == base.charset {
                self.charset = v.clone();
            }
        }
        Ok(())
    }
}

/// Extract the key/value pairs of one `[group]` from my.cnf style text
fn parse_option_group(text: &str, group: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let mut in_group = false;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            in_group = name.trim() == group;
            continue;
        }
        if !in_group {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim().to_string();
        let mut value = value.trim();
        // strip an inline comment and surrounding quotes
        if let Some(idx) = value.find(" #") {
            value = value[..idx].trim_end();
        }
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);
        out.insert(key, value.to_string());
    }
    out
}
