//! Error taxonomy of the driver
use thiserror::Error;

/// An error as reported by the server in an ERR packet
///
/// A `code` of zero marks an error raised on the client side that was
/// classified into the same taxonomy; those carry the generic `HY000`
/// SQLSTATE.
#[derive(Debug, Clone)]
pub struct ServerError {
    /// 2-byte vendor error number
    pub code: u16,
    /// Five character SQLSTATE
    pub sqlstate: String,
    /// Human readable error message
    pub message: String,
}

impl ServerError {
    /// Construct a client-side error that carries no vendor number
    pub(crate) fn client(message: impl Into<String>) -> Self {
        ServerError {
            code: 0,
            sqlstate: "HY000".to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.code == 0 {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{} ({}): {}", self.code, self.sqlstate, self.message)
        }
    }
}

/// Error returned by every fallible operation of the driver
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The connection was lost, the packet framing was broken, or the pool
    /// was closed
    #[error("interface error: {0}")]
    Interface(String),
    /// Network error from tokio; interface-class
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Server error that fits no narrower kind: a vendor code outside the
    /// curated lists and the classic 1000-range operational class
    #[error("database error {0}")]
    Database(ServerError),
    /// Numeric overflow, invalid date, or a value that could not be decoded
    #[error("data error {0}")]
    Data(ServerError),
    /// Server-side operational failure such as a lock timeout or deadlock
    #[error("operational error {0}")]
    Operational(ServerError),
    /// Constraint violation
    #[error("integrity error {0}")]
    Integrity(ServerError),
    /// The server reported an internal error
    #[error("internal error {0}")]
    Internal(ServerError),
    /// Misuse of the API: placeholder mismatch, closed cursor or connection,
    /// command ordering violation; carries the vendor error number when the
    /// server reported it, and code zero when raised on the client side
    #[error("programming error: {0}")]
    Programming(ServerError),
    /// Feature not implemented by the driver or the server; carries the
    /// vendor error number when the server reported it
    #[error("not supported: {0}")]
    NotSupported(ServerError),
}

/// Result alias used throughout the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Vendor error numbers that classify as integrity errors
const INTEGRITY_CODES: &[u16] = &[
    1022, 1048, 1062, 1169, 1215, 1216, 1217, 1451, 1452, 1557, 1586, 1761, 1762, 4025,
];

/// Vendor error numbers that classify as data errors
const DATA_CODES: &[u16] = &[1230, 1263, 1264, 1265, 1366, 1367, 1406, 1441, 1690];

/// Vendor error numbers that classify as programming errors
const PROGRAMMING_CODES: &[u16] = &[
    1007, 1064, 1102, 1103, 1110, 1111, 1112, 1113, 1146, 1149, 1166, 1179,
];

/// Vendor error numbers that classify as not-supported errors
const NOT_SUPPORTED_CODES: &[u16] = &[1196, 1235, 1286, 1289];

impl Error {
    /// Shortcut for an [Error::Interface] protocol violation
    pub(crate) fn protocol(message: impl std::fmt::Display) -> Self {
        Error::Interface(format!("protocol error: {message}"))
    }

    /// Shortcut for a client-side [Error::Data]
    pub(crate) fn data(message: impl Into<String>) -> Self {
        Error::Data(ServerError::client(message))
    }

    /// Shortcut for a client-side [Error::Programming]
    pub(crate) fn programming(message: impl Into<String>) -> Self {
        Error::Programming(ServerError::client(message))
    }

    /// Shortcut for a client-side [Error::NotSupported]
    pub(crate) fn not_supported(message: impl Into<String>) -> Self {
        Error::NotSupported(ServerError::client(message))
    }

    /// Classify an ERR packet into the taxonomy by its vendor error number
    pub fn from_err_packet(code: u16, sqlstate: String, message: String) -> Self {
        let err = ServerError {
            code,
            sqlstate,
            message,
        };
        if INTEGRITY_CODES.contains(&code) {
            Error::Integrity(err)
        } else if DATA_CODES.contains(&code) {
            Error::Data(err)
        } else if PROGRAMMING_CODES.contains(&code) {
            Error::Programming(err)
        } else if NOT_SUPPORTED_CODES.contains(&code) {
            Error::NotSupported(err)
        } else if code < 1000 {
            Error::Internal(err)
        } else if code < 2000 {
            Error::Operational(err)
        } else {
            Error::Database(err)
        }
    }

    /// Return the server error details if this error was sourced from an ERR
    /// packet
    ///
    /// Errors raised on the client side carry no vendor number and return
    /// None.
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            Error::Database(e)
            | Error::Data(e)
            | Error::Operational(e)
            | Error::Integrity(e)
            | Error::Internal(e)
            | Error::Programming(e)
            | Error::NotSupported(e)
                if e.code != 0 =>
            {
                Some(e)
            }
            _ => None,
        }
    }

    /// True for errors after which the connection must not be reused
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Interface(_) | Error::Io(_))
    }
}
