//! The cursor family: buffered and streaming, tuple and name-keyed rows
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::value::{escape_value, Column, Value};

/// Largest statement [Cursor::executemany] assembles, leaving header room
/// under the default max_allowed_packet
const MAX_STMT_LENGTH: usize = 1_024_000;

/// Matches `INSERT ... VALUES (...)` statements whose row tuple can be
/// repeated for multi-row inserts
static INSERT_VALUES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)\A\s*((?:INSERT|REPLACE)\b.+\bVALUES?\s*)(\(\s*(?:%s|%\([^)]+\)s)\s*(?:,\s*(?:%s|%\([^)]+\)s)\s*)*\))(\s*(?:ON\s+DUPLICATE\b.*)?);?\s*\z",
    )
    .expect("insert values pattern")
});

/// Arguments substituted for the placeholders of a query
///
/// `%s` placeholders take positional arguments, `%(name)s` placeholders take
/// named ones, and `%%` renders a literal percent sign. A query executed with
/// [Params::None] is passed through untouched.
pub enum Params {
    /// No substitution at all
    None,
    /// Values for `%s` placeholders, in order
    Positional(Vec<Value>),
    /// Values for `%(name)s` placeholders
    Named(HashMap<String, Value>),
}

impl From<()> for Params {
    fn from(_: ()) -> Self {
        Params::None
    }
}

impl From<Vec<Value>> for Params {
    fn from(v: Vec<Value>) -> Self {
        Params::Positional(v)
    }
}

impl From<HashMap<String, Value>> for Params {
    fn from(v: HashMap<String, Value>) -> Self {
        Params::Named(v)
    }
}

/// Implement [From] for a tuple of bindable values
macro_rules! impl_params_for_tuple {
    ($($idx:tt $T:ident),+) => {
        impl<$($T: Into<Value>,)+> From<($($T,)+)> for Params {
            #[inline]
            fn from(v: ($($T,)+)) -> Self {
                Params::Positional(vec![$(v.$idx.into(),)+])
            }
        }
    };
}

impl_params_for_tuple!(0 T1);
impl_params_for_tuple!(0 T1, 1 T2);
impl_params_for_tuple!(0 T1, 1 T2, 2 T3);
impl_params_for_tuple!(0 T1, 1 T2, 2 T3, 3 T4);
impl_params_for_tuple!(0 T1, 1 T2, 2 T3, 3 T4, 4 T5);
impl_params_for_tuple!(0 T1, 1 T2, 2 T3, 3 T4, 4 T5, 5 T6);
impl_params_for_tuple!(0 T1, 1 T2, 2 T3, 3 T4, 4 T5, 5 T6, 6 T7);
impl_params_for_tuple!(0 T1, 1 T2, 2 T3, 3 T4, 4 T5, 5 T6, 6 T7, 7 T8);
impl_params_for_tuple!(0 T1, 1 T2, 2 T3, 3 T4, 4 T5, 5 T6, 6 T7, 7 T8, 8 T9);
impl_params_for_tuple!(0 T1, 1 T2, 2 T3, 3 T4, 4 T5, 5 T6, 6 T7, 7 T8, 8 T9, 9 T10);
impl_params_for_tuple!(0 T1, 1 T2, 2 T3, 3 T4, 4 T5, 5 T6, 6 T7, 7 T8, 8 T9, 9 T10, 10 T11);
impl_params_for_tuple!(0 T1, 1 T2, 2 T3, 3 T4, 4 T5, 5 T6, 6 T7, 7 T8, 8 T9, 9 T10, 10 T11, 11 T12);

/// Render a query by substituting its placeholders with escaped values
///
/// The placeholder count must match the parameter count exactly.
pub(crate) fn format_query(query: &str, params: &Params, no_backslash: bool) -> Result<Vec<u8>> {
    let bytes = query.as_bytes();
    match params {
        Params::None => Ok(bytes.to_vec()),
        Params::Positional(values) => {
            let mut out = Vec::with_capacity(query.len() + values.len() * 8);
            let mut used = 0;
            let mut i = 0;
            while i < bytes.len() {
                if bytes[i] != b'%' {
                    out.push(bytes[i]);
                    i += 1;
                    continue;
                }
                match bytes.get(i + 1) {
                    Some(b'%') => {
                        out.push(b'%');
                        i += 2;
                    }
                    Some(b's') => {
                        let v = values.get(used).ok_or_else(|| {
                            Error::programming(
                                "not enough parameters for the placeholders in the query"
                                    .to_string(),
                            )
                        })?;
                        escape_value(v, no_backslash, &mut out)?;
                        used += 1;
                        i += 2;
                    }
                    other => {
                        return Err(Error::programming(format!(
                            "unsupported format character {:?}",
                            other.map(|b| *b as char)
                        )))
                    }
                }
            }
            if used != values.len() {
                return Err(Error::programming(format!(
                    "{} parameters given for {used} placeholders",
                    values.len()
                )));
            }
            Ok(out)
        }
        Params::Named(map) => {
            let mut out = Vec::with_capacity(query.len() + map.len() * 8);
            let mut i = 0;
            while i < bytes.len() {
                if bytes[i] != b'%' {
                    out.push(bytes[i]);
                    i += 1;
                    continue;
                }
                match bytes.get(i + 1) {
                    Some(b'%') => {
                        out.push(b'%');
                        i += 2;
                    }
                    Some(b'(') => {
                        let rest = &query[i + 2..];
                        let close = rest.find(')').ok_or_else(|| {
                            Error::programming("unterminated named placeholder".to_string())
                        })?;
                        if rest.as_bytes().get(close + 1) != Some(&b's') {
                            return Err(Error::programming(
                                "named placeholder must end in )s".to_string(),
                            ));
                        }
                        let key = &rest[..close];
                        let v = map.get(key).ok_or_else(|| {
                            Error::programming(format!("parameter {key:?} not found"))
                        })?;
                        escape_value(v, no_backslash, &mut out)?;
                        i += 2 + close + 2;
                    }
                    other => {
                        return Err(Error::programming(format!(
                            "unsupported format character {:?} with named parameters",
                            other.map(|b| *b as char)
                        )))
                    }
                }
            }
            Ok(out)
        }
    }
}

/// How a cursor kind shapes rows and whether it streams them
///
/// The four stock kinds cover the buffered/streaming and tuple/name-keyed
/// axes; external implementations can add their own row shape.
pub trait CursorKind {
    /// Row representation produced by this kind of cursor
    type Row: Clone + Send;
    /// Streaming cursors read rows one at a time instead of buffering on
    /// execute
    const STREAMING: bool;
    /// Shape one decoded row
    fn shape_row(columns: &[Column], row: Vec<Value>) -> Self::Row;
}

/// Buffered cursor kind returning rows as value tuples
pub struct Tuples;

impl CursorKind for Tuples {
    type Row = Vec<Value>;
    const STREAMING: bool = false;

    fn shape_row(_columns: &[Column], row: Vec<Value>) -> Self::Row {
        row
    }
}

/// Buffered cursor kind returning rows keyed by column name
///
/// A duplicate column name resolves to its last occurrence in the row.
pub struct Dicts;

impl CursorKind for Dicts {
    type Row = HashMap<String, Value>;
    const STREAMING: bool = false;

    fn shape_row(columns: &[Column], row: Vec<Value>) -> Self::Row {
        columns.iter().map(|c| c.name.clone()).zip(row).collect()
    }
}

/// Streaming variant of [Tuples]
pub struct StreamTuples;

impl CursorKind for StreamTuples {
    type Row = Vec<Value>;
    const STREAMING: bool = true;

    fn shape_row(_columns: &[Column], row: Vec<Value>) -> Self::Row {
        row
    }
}

/// Streaming variant of [Dicts]
pub struct StreamDicts;

impl CursorKind for StreamDicts {
    type Row = HashMap<String, Value>;
    const STREAMING: bool = true;

    fn shape_row(columns: &[Column], row: Vec<Value>) -> Self::Row {
        columns.iter().map(|c| c.name.clone()).zip(row).collect()
    }
}

/// Buffered cursor over value tuples
pub type TupleCursor<'a> = Cursor<'a, Tuples>;
/// Buffered cursor over name-keyed rows
pub type DictCursor<'a> = Cursor<'a, Dicts>;
/// Streaming cursor over value tuples
pub type StreamingTupleCursor<'a> = Cursor<'a, StreamTuples>;
/// Streaming cursor over name-keyed rows
pub type StreamingDictCursor<'a> = Cursor<'a, StreamDicts>;

/// How [Cursor::scroll] interprets its offset
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ScrollMode {
    /// Move relative to the current position
    Relative,
    /// Move to an absolute row index
    Absolute,
}

/// A cursor bound to a connection
///
/// Created by [Connection::cursor] and friends. The cursor holds the
/// connection exclusively; it becomes unusable once closed or once its
/// connection goes away.
pub struct Cursor<'a, K: CursorKind = Tuples> {
    /// Back reference to the connection; dropped on close
    conn: Option<&'a mut Connection>,
    /// Columns of the current result set
    description: Option<Arc<[Column]>>,
    /// Buffered rows of the current result set
    rows: Vec<K::Row>,
    /// Index of the next row to fetch
    rownumber: usize,
    /// Row count of the last operation, -1 before the first execute and for
    /// streaming results that are not exhausted yet
    rowcount: i64,
    /// Auto increment id assigned by the last insert, zero when none
    lastrowid: u64,
    /// Default batch size of [Cursor::fetchmany]
    arraysize: usize,
    /// An execute has completed on this cursor
    executed: bool,
}

impl<'a, K: CursorKind> Cursor<'a, K> {
    pub(crate) fn new(conn: &'a mut Connection) -> Self {
        Cursor {
            conn: Some(conn),
            description: None,
            rows: Vec::new(),
            rownumber: 0,
            rowcount: -1,
            lastrowid: 0,
            arraysize: 1,
            executed: false,
        }
    }

    fn conn_mut(&mut self) -> Result<&mut Connection> {
        self.conn
            .as_deref_mut()
            .ok_or_else(|| Error::programming("cursor is closed".to_string()))
    }

    fn conn_ref(&self) -> Result<&Connection> {
        self.conn
            .as_deref()
            .ok_or_else(|| Error::programming("cursor is closed".to_string()))
    }

    fn check_executed(&self) -> Result<()> {
        self.conn_ref()?;
        if !self.executed {
            return Err(Error::programming("execute() first".to_string()));
        }
        Ok(())
    }

    /// Pull cursor state from the connection after a command completed
    fn sync_from_connection(&mut self) {
        self.rownumber = 0;
        self.rows.clear();
        let Ok(conn) = self.conn_mut() else { return };
        let lastrowid = conn.insert_id();
        let (columns, raw_rows, affected, unbuffered) = conn.result_parts();
        self.lastrowid = lastrowid;
        self.description = if columns.is_empty() {
            None
        } else {
            Some(columns.clone())
        };
        match raw_rows {
            Some(rows) => {
                self.rows = rows
                    .into_iter()
                    .map(|r| K::shape_row(&columns, r))
                    .collect();
                self.rowcount = self.rows.len() as i64;
            }
            None if unbuffered => self.rowcount = -1,
            None => self.rowcount = affected as i64,
        }
    }

    /// Exhaust everything left from the previous command
    async fn drain_results(&mut self) -> Result<()> {
        let conn = self.conn_mut()?;
        loop {
            if K::STREAMING {
                conn.finish_current_result().await?;
            }
            if !conn.next_result(K::STREAMING).await? {
                return Ok(());
            }
        }
    }

    async fn execute_rendered(&mut self, sql: &[u8]) -> Result<i64> {
        self.conn_mut()?.query(sql, K::STREAMING).await?;
        self.sync_from_connection();
        self.executed = true;
        Ok(self.rowcount)
    }

    /// Substitute parameters, run the query, and return the row count
    ///
    /// The row count is -1 for streaming result sets until they are
    /// exhausted.
    pub async fn execute(&mut self, query: &str, params: impl Into<Params>) -> Result<i64> {
        let params = params.into();
        self.conn_ref()?;
        self.drain_results().await?;
        let no_backslash = self.conn_ref()?.backslash_escapes_disabled();
        let sql = format_query(query, &params, no_backslash)?;
        self.execute_rendered(&sql).await
    }

    /// Run one statement against a sequence of parameter sets
    ///
    /// `INSERT ... VALUES (...)` statements are rewritten into multi-row
    /// inserts packed under the statement size cap; everything else falls
    /// back to sequential executes. Returns the total affected row count.
    pub async fn executemany<P: Into<Params>>(
        &mut self,
        query: &str,
        args: Vec<P>,
    ) -> Result<i64> {
        if args.is_empty() {
            return Ok(0);
        }
        let args: Vec<Params> = args.into_iter().map(Into::into).collect();
        if let Some(c) = INSERT_VALUES.captures(query) {
            let values = c.get(2).expect("values group");
            let suffix = c.get(3).map(|m| m.as_str().trim_end()).unwrap_or("");
            // a parametrized ON DUPLICATE tail cannot be repeated per row
            if !suffix.contains('%') {
                let prefix = &query[..values.start()];
                return self
                    .execute_many_insert(prefix, values.as_str(), suffix, &args)
                    .await;
            }
        }
        let mut rows = 0;
        for params in args {
            let count = self.execute(query, params).await?;
            rows += count.max(0);
        }
        self.rowcount = rows;
        Ok(rows)
    }

    async fn execute_many_insert(
        &mut self,
        prefix: &str,
        values: &str,
        suffix: &str,
        args: &[Params],
    ) -> Result<i64> {
        self.conn_ref()?;
        self.drain_results().await?;
        let no_backslash = self.conn_ref()?.backslash_escapes_disabled();
        let mut sql = prefix.as_bytes().to_vec();
        sql.extend_from_slice(&format_query(values, &args[0], no_backslash)?);
        let mut rows = 0;
        for params in &args[1..] {
            let rendered = format_query(values, params, no_backslash)?;
            if sql.len() + rendered.len() + suffix.len() + 1 > MAX_STMT_LENGTH {
                sql.extend_from_slice(suffix.as_bytes());
                rows += self.execute_rendered(&sql).await?.max(0);
                sql = prefix.as_bytes().to_vec();
            } else {
                sql.push(b',');
            }
            sql.extend_from_slice(&rendered);
        }
        sql.extend_from_slice(suffix.as_bytes());
        rows += self.execute_rendered(&sql).await?.max(0);
        self.rowcount = rows;
        Ok(rows)
    }

    /// Call a stored procedure
    ///
    /// Each argument is bound to a server variable `@_<procname>_<i>` first,
    /// so OUT and INOUT values can be read back with a later `SELECT`. The
    /// original arguments are returned unchanged. The call itself appends a
    /// trailing empty result set; advance through every set with
    /// [Cursor::nextset] before issuing another statement.
    pub async fn callproc(&mut self, procname: &str, args: Vec<Value>) -> Result<Vec<Value>> {
        self.conn_ref()?;
        self.drain_results().await?;
        let no_backslash = self.conn_ref()?.backslash_escapes_disabled();
        for (i, arg) in args.iter().enumerate() {
            let mut q = format!("SET @_{procname}_{i}=").into_bytes();
            escape_value(arg, no_backslash, &mut q)?;
            self.execute_rendered(&q).await?;
        }
        let list = (0..args.len())
            .map(|i| format!("@_{procname}_{i}"))
            .collect::<Vec<_>>()
            .join(",");
        let q = format!("CALL {procname}({list})").into_bytes();
        self.execute_rendered(&q).await?;
        Ok(args)
    }

    /// Fetch the next row, or None when the result set is exhausted
    pub async fn fetchone(&mut self) -> Result<Option<K::Row>> {
        self.check_executed()?;
        if K::STREAMING {
            let conn = self.conn_mut()?;
            match conn.next_row().await? {
                Some(raw) => {
                    let columns = self
                        .description
                        .clone()
                        .unwrap_or_else(|| Vec::new().into());
                    self.rownumber += 1;
                    Ok(Some(K::shape_row(&columns, raw)))
                }
                None => {
                    self.rowcount = self.rownumber as i64;
                    Ok(None)
                }
            }
        } else {
            match self.rows.get(self.rownumber) {
                Some(row) => {
                    let row = row.clone();
                    self.rownumber += 1;
                    Ok(Some(row))
                }
                None => Ok(None),
            }
        }
    }

    /// Fetch up to `size` rows, defaulting to [Cursor::arraysize]
    pub async fn fetchmany(&mut self, size: Option<usize>) -> Result<Vec<K::Row>> {
        self.check_executed()?;
        let n = size.unwrap_or(self.arraysize);
        if K::STREAMING {
            let mut out = Vec::with_capacity(n);
            for _ in 0..n {
                match self.fetchone().await? {
                    Some(r) => out.push(r),
                    None => break,
                }
            }
            Ok(out)
        } else {
            let end = std::cmp::min(self.rownumber + n, self.rows.len());
            let out = self.rows[self.rownumber..end].to_vec();
            self.rownumber = end;
            Ok(out)
        }
    }

    /// Fetch every remaining row
    ///
    /// On a streaming cursor this iterates row by row instead of reading the
    /// set into memory up front.
    pub async fn fetchall(&mut self) -> Result<Vec<K::Row>> {
        self.check_executed()?;
        if K::STREAMING {
            let mut out = Vec::new();
            while let Some(r) = self.fetchone().await? {
                out.push(r);
            }
            Ok(out)
        } else {
            let out = self.rows[self.rownumber..].to_vec();
            self.rownumber = self.rows.len();
            Ok(out)
        }
    }

    /// Move the cursor position within the result set
    ///
    /// Streaming cursors only support forward motion, implemented by reading
    /// and discarding rows.
    pub async fn scroll(&mut self, value: i64, mode: ScrollMode) -> Result<()> {
        self.check_executed()?;
        if K::STREAMING {
            let forward = match mode {
                ScrollMode::Relative => value,
                ScrollMode::Absolute => value - self.rownumber as i64,
            };
            if forward < 0 {
                return Err(Error::not_supported(
                    "backwards scrolling on a streaming cursor".to_string(),
                ));
            }
            for _ in 0..forward {
                if self.fetchone().await?.is_none() {
                    break;
                }
            }
            Ok(())
        } else {
            let target = match mode {
                ScrollMode::Relative => self.rownumber as i64 + value,
                ScrollMode::Absolute => value,
            };
            if target < 0 || target >= self.rows.len() as i64 {
                return Err(Error::programming("scroll target out of range".to_string()));
            }
            self.rownumber = target as usize;
            Ok(())
        }
    }

    /// Advance to the next result set, returning false when there is none
    pub async fn nextset(&mut self) -> Result<bool> {
        let conn = self.conn_mut()?;
        if K::STREAMING {
            conn.finish_current_result().await?;
        }
        if !conn.next_result(K::STREAMING).await? {
            return Ok(false);
        }
        self.sync_from_connection();
        self.executed = true;
        Ok(true)
    }

    /// Exhaust all remaining data and detach from the connection
    ///
    /// Idempotent; after close every other method fails with a programming
    /// error.
    pub async fn close(&mut self) -> Result<()> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        loop {
            if K::STREAMING {
                conn.finish_current_result().await?;
            }
            if !conn.next_result(K::STREAMING).await? {
                return Ok(());
            }
        }
    }

    /// True once the cursor has been closed
    pub fn closed(&self) -> bool {
        self.conn.is_none()
    }

    /// Column definitions of the current result set
    pub fn description(&self) -> Option<&[Column]> {
        self.description.as_deref()
    }

    /// Row count of the last operation, -1 when unknown
    pub fn rowcount(&self) -> i64 {
        self.rowcount
    }

    /// Zero-based index of the next row to fetch
    pub fn rownumber(&self) -> usize {
        self.rownumber
    }

    /// Auto increment id assigned by the last insert, zero when none
    pub fn lastrowid(&self) -> u64 {
        self.lastrowid
    }

    /// Default batch size of [Cursor::fetchmany]
    pub fn arraysize(&self) -> usize {
        self.arraysize
    }

    /// Change the default batch size of [Cursor::fetchmany]
    pub fn set_arraysize(&mut self, v: usize) {
        self.arraysize = v;
    }
}
