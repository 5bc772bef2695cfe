//! Explicit transaction handles: flat, savepoint-nested and two-phase
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::value::escape_str;

/// How a transaction is driven on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionKind {
    /// Plain `BEGIN` / `COMMIT` / `ROLLBACK`
    Flat,
    /// A savepoint at the given nesting depth; commit releases only this
    /// savepoint, the outermost transaction controls the real commit
    Savepoint(usize),
    /// Two-phase transaction driven with `XA` statements under the given xid
    TwoPhase(String),
}

/// An open transaction on a connection
///
/// There is no async drop in Rust, so letting a handle go out of scope does
/// not roll anything back; the transaction stays open on the connection.
/// Either resolve it with [Transaction::commit], [Transaction::rollback] or
/// [Transaction::close], or rely on the pool, which refuses to reuse a
/// connection with an open transaction.
pub struct Transaction<'a> {
    /// The connection the transaction was started on
    conn: &'a mut Connection,
    /// Wire flavor of this transaction
    kind: TransactionKind,
}

impl Connection {
    /// Begin a flat transaction
    pub async fn begin_transaction(&mut self) -> Result<Transaction<'_>> {
        self.query_drop(b"BEGIN").await?;
        Ok(Transaction {
            conn: self,
            kind: TransactionKind::Flat,
        })
    }

    /// Begin a two-phase transaction under a caller-supplied xid
    pub async fn begin_two_phase(&mut self, xid: &str) -> Result<Transaction<'_>> {
        let mut q = b"XA START ".to_vec();
        escape_str(xid, self.backslash_escapes_disabled(), &mut q);
        self.query_drop(&q).await?;
        Ok(Transaction {
            conn: self,
            kind: TransactionKind::TwoPhase(xid.to_string()),
        })
    }
}

impl<'a> Transaction<'a> {
    /// Wire flavor of this transaction
    pub fn kind(&self) -> &TransactionKind {
        &self.kind
    }

    /// The connection the transaction runs on
    pub fn connection(&mut self) -> &mut Connection {
        self.conn
    }

    /// Open a nested transaction backed by a savepoint
    pub async fn savepoint(&mut self) -> Result<Transaction<'_>> {
        let depth = match &self.kind {
            TransactionKind::Flat => 1,
            TransactionKind::Savepoint(d) => d + 1,
            TransactionKind::TwoPhase(_) => {
                return Err(Error::not_supported(
                    "savepoints inside a two-phase transaction".to_string(),
                ))
            }
        };
        self.conn
            .query_drop(format!("SAVEPOINT sp_{depth}").as_bytes())
            .await?;
        Ok(Transaction {
            conn: &mut *self.conn,
            kind: TransactionKind::Savepoint(depth),
        })
    }

    /// Make this transaction's changes permanent
    ///
    /// For a savepoint this only releases the innermost savepoint; for a
    /// two-phase transaction it runs `XA END`, `XA PREPARE` and `XA COMMIT`.
    pub async fn commit(self) -> Result<()> {
        match &self.kind {
            TransactionKind::Flat => self.conn.query_drop(b"COMMIT").await,
            TransactionKind::Savepoint(d) => {
                self.conn
                    .query_drop(format!("RELEASE SAVEPOINT sp_{d}").as_bytes())
                    .await
            }
            TransactionKind::TwoPhase(xid) => {
                let no_backslash = self.conn.backslash_escapes_disabled();
                for stmt in ["XA END ", "XA PREPARE ", "XA COMMIT "] {
                    let mut q = stmt.as_bytes().to_vec();
                    escape_str(xid, no_backslash, &mut q);
                    self.conn.query_drop(&q).await?;
                }
                Ok(())
            }
        }
    }

    /// Throw this transaction's changes away
    pub async fn rollback(self) -> Result<()> {
        match &self.kind {
            TransactionKind::Flat => self.conn.query_drop(b"ROLLBACK").await,
            TransactionKind::Savepoint(d) => {
                self.conn
                    .query_drop(format!("ROLLBACK TO SAVEPOINT sp_{d}").as_bytes())
                    .await
            }
            TransactionKind::TwoPhase(xid) => {
                let no_backslash = self.conn.backslash_escapes_disabled();
                for stmt in ["XA END ", "XA ROLLBACK "] {
                    let mut q = stmt.as_bytes().to_vec();
                    escape_str(xid, no_backslash, &mut q);
                    self.conn.query_drop(&q).await?;
                }
                Ok(())
            }
        }
    }

    /// Resolve the transaction by rolling it back
    pub async fn close(self) -> Result<()> {
        self.rollback().await
    }
}
