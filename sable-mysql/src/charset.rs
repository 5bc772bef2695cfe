//! Mapping between character set names and collation ids
//!
//! Only the character sets a client realistically connects with are listed.
//! Everything that is not `binary` is decoded as utf-8; the single-byte sets
//! in the table are ascii compatible so this is lossy only for data that was
//! stored in a legacy encoding.

/// A character set / default collation pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Charset {
    /// Collation id sent in the handshake and column definitions
    pub id: u16,
    /// Character set name as used in `SET NAMES`
    pub name: &'static str,
    /// Collation name
    pub collation: &'static str,
    /// Encoding label exposed to callers
    pub encoding: &'static str,
    /// True when values in this set carry raw bytes
    pub binary: bool,
}

/// Character sets known to the driver, default collation first per name
const CHARSETS: &[Charset] = &[
    Charset {
        id: 45,
        name: "utf8mb4",
        collation: "utf8mb4_general_ci",
        encoding: "utf8",
        binary: false,
    },
    Charset {
        id: 255,
        name: "utf8mb4",
        collation: "utf8mb4_0900_ai_ci",
        encoding: "utf8",
        binary: false,
    },
    Charset {
        id: 224,
        name: "utf8mb4",
        collation: "utf8mb4_unicode_ci",
        encoding: "utf8",
        binary: false,
    },
    Charset {
        id: 33,
        name: "utf8",
        collation: "utf8_general_ci",
        encoding: "utf8",
        binary: false,
    },
    Charset {
        id: 8,
        name: "latin1",
        collation: "latin1_swedish_ci",
        encoding: "latin1",
        binary: false,
    },
    Charset {
        id: 11,
        name: "ascii",
        collation: "ascii_general_ci",
        encoding: "ascii",
        binary: false,
    },
    Charset {
        id: 63,
        name: "binary",
        collation: "binary",
        encoding: "binary",
        binary: true,
    },
];

/// The character set used when the caller does not pick one
pub const DEFAULT: &Charset = &CHARSETS[0];

/// Collation id of the `binary` pseudo character set
pub const BINARY_ID: u16 = 63;

/// Look a character set up by name
pub fn by_name(name: &str) -> Option<&'static Charset> {
    CHARSETS.iter().find(|c| c.name == name)
}

/// Look a character set up by collation id
pub fn by_id(id: u16) -> Option<&'static Charset> {
    CHARSETS.iter().find(|c| c.id == id)
}
