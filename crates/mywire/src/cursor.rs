//! Cursors: statement execution and row fetching on top of a connection.
//!
//! A [`Cursor`] borrows its connection mutably for as long as it lives.
//! Buffered cursors read the whole result set during `execute`; unbuffered
//! cursors leave the rows on the wire and read them on each fetch, which
//! keeps the connection busy until the result is exhausted or the cursor
//! is closed.

use std::collections::{BTreeMap, VecDeque};
use std::sync::OnceLock;

use asupersync::{Cx, Outcome};
use mywire_core::{Error, ProgrammingErrorKind, Result, Row, Value};
use regex::Regex;

use crate::connection::{CommandResult, MySqlConnection, Warning, into_outcome};
use crate::protocol::prepared::PreparedStatement;
use crate::types::{ColumnDef, format_value_for_sql, interpolate_params};

/// When rows are read from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Buffering {
    /// Read every row during `execute`
    #[default]
    Buffered,
    /// Read rows as they are fetched
    Unbuffered,
}

/// How fetched rows are presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowShape {
    /// Values in column order
    #[default]
    Tuple,
    /// Values as undecoded bytes (text protocol only)
    Raw,
    /// Column name to value
    Dict,
    /// A [`Row`] with positional and by-name access
    Named,
}

/// A fetched row in the cursor's [`RowShape`].
#[derive(Debug, Clone, PartialEq)]
pub enum CursorRow {
    Tuple(Vec<Value>),
    Dict(BTreeMap<String, Value>),
    Named(Row),
}

impl CursorRow {
    fn shape(row: Row, shape: RowShape) -> Self {
        match shape {
            RowShape::Tuple | RowShape::Raw => CursorRow::Tuple(row.into_values()),
            RowShape::Dict => CursorRow::Dict(
                row.iter()
                    .map(|(name, value)| (name.to_string(), value.clone()))
                    .collect(),
            ),
            RowShape::Named => CursorRow::Named(row),
        }
    }

    /// Value by column position.
    pub fn get(&self, index: usize) -> Option<&Value> {
        match self {
            CursorRow::Tuple(values) => values.get(index),
            CursorRow::Named(row) => row.get(index),
            CursorRow::Dict(_) => None,
        }
    }

    /// Value by column name.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        match self {
            CursorRow::Dict(map) => map.get(name),
            CursorRow::Named(row) => row.get_by_name(name),
            CursorRow::Tuple(_) => None,
        }
    }
}

fn insert_values_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)^\s*INSERT\s+(?:LOW_PRIORITY\s+|DELAYED\s+|HIGH_PRIORITY\s+)?(?:IGNORE\s+)?INTO\s+.+?\s+VALUES\s*\(").ok()
    })
    .as_ref()
}

/// Split an `INSERT ... VALUES (...) [tail]` statement into the text before
/// the row tuple, the tuple itself and whatever follows it.
fn split_insert_values(sql: &str) -> Option<(&str, &str, &str)> {
    let found = insert_values_regex()?.find(sql)?;
    let open = found.end() - 1;
    let close = matching_paren(sql, open)?;
    Some((&sql[..open], &sql[open..=close], &sql[close + 1..]))
}

/// Index of the parenthesis closing the one at `open`, skipping quoted text.
fn matching_paren(sql: &str, open: usize) -> Option<usize> {
    let bytes = sql.as_bytes();
    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut i = open;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' && q != b'`' {
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            }
            None => match b {
                b'\'' | b'"' | b'`' => quote = Some(b),
                b'(' => depth += 1,
                b')' => {
                    depth = depth.checked_sub(1)?;
                    if depth == 0 {
                        return Some(i);
                    }
                }
                _ => {}
            },
        }
        i += 1;
    }
    None
}

/// Executes statements and fetches their rows.
pub struct Cursor<'c> {
    conn: &'c mut MySqlConnection,
    buffering: Buffering,
    shape: RowShape,
    prepared: bool,
    statement: Option<PreparedStatement>,
    statement_generation: u64,
    columns: Vec<ColumnDef>,
    rows: VecDeque<Row>,
    rowcount: i64,
    lastrowid: Option<u64>,
    warnings: Vec<Warning>,
    executed: Option<String>,
    stored_results: Vec<Vec<Row>>,
    closed: bool,
}

impl std::fmt::Debug for Cursor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("buffering", &self.buffering)
            .field("shape", &self.shape)
            .field("prepared", &self.prepared)
            .field("executed", &self.executed)
            .field("rowcount", &self.rowcount)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl MySqlConnection {
    /// A buffered tuple cursor over this connection.
    pub fn cursor(&mut self) -> Cursor<'_> {
        Cursor::new(self)
    }
}

impl<'c> Cursor<'c> {
    pub fn new(conn: &'c mut MySqlConnection) -> Self {
        Self {
            conn,
            buffering: Buffering::default(),
            shape: RowShape::default(),
            prepared: false,
            statement: None,
            statement_generation: 0,
            columns: Vec::new(),
            rows: VecDeque::new(),
            rowcount: -1,
            lastrowid: None,
            warnings: Vec::new(),
            executed: None,
            stored_results: Vec::new(),
            closed: false,
        }
    }

    pub fn buffering(mut self, buffering: Buffering) -> Self {
        self.buffering = buffering;
        self
    }

    pub fn row_shape(mut self, shape: RowShape) -> Self {
        self.shape = shape;
        self
    }

    /// Execute through server-side prepared statements and the binary
    /// protocol.
    pub fn prepared(mut self, prepared: bool) -> Self {
        self.prepared = prepared;
        self
    }

    // === Result metadata ===

    /// Affected rows for DML, rows read so far for queries, -1 if unknown.
    pub fn rowcount(&self) -> i64 {
        self.rowcount
    }

    /// AUTO_INCREMENT id generated by the last statement.
    pub fn lastrowid(&self) -> Option<u64> {
        self.lastrowid
    }

    pub fn description(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Warnings of the last statement, when `get_warnings` is configured.
    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    /// SQL text last sent to the server.
    pub fn statement(&self) -> Option<&str> {
        self.executed.as_deref()
    }

    /// Result sets produced by the last [`Self::callproc`].
    pub fn stored_results(&self) -> &[Vec<Row>] {
        &self.stored_results
    }

    pub fn with_rows(&self) -> bool {
        !self.columns.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn connection(&mut self) -> &mut MySqlConnection {
        self.conn
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::programming(
                ProgrammingErrorKind::NotConnected,
                "Cursor is not connected",
            ))
        } else {
            Ok(())
        }
    }

    fn reset(&mut self) {
        self.columns.clear();
        self.rows.clear();
        self.rowcount = -1;
        self.lastrowid = None;
        self.warnings.clear();
    }

    // === Execution ===

    /// Execute one statement, binding `params` to its `?` placeholders.
    #[tracing::instrument(level = "debug", skip(self, cx, params), fields(params = params.len()))]
    pub async fn execute(&mut self, cx: &Cx, sql: &str, params: &[Value]) -> Outcome<(), Error> {
        cancel_point!(cx);
        into_outcome(self.execute_inner(sql, params).await)
    }

    async fn execute_inner(&mut self, sql: &str, params: &[Value]) -> Result<()> {
        self.check_open()?;
        self.discard_unread().await?;
        self.reset();

        if self.prepared {
            return self.execute_prepared(sql, params).await;
        }
        let query = if params.is_empty() {
            sql.to_string()
        } else {
            interpolate_params(sql, params)?
        };
        let result = self.conn.query_single(&query).await;
        self.executed = Some(query);
        let result = result?;
        self.handle_result(result).await
    }

    async fn execute_prepared(&mut self, sql: &str, params: &[Value]) -> Result<()> {
        let reusable = self.statement.as_ref().is_some_and(|s| s.sql == sql)
            && self.statement_generation == self.conn.generation();

        if reusable {
            if let Some(stmt) = &self.statement {
                self.conn.stmt_reset_inner(stmt.statement_id).await?;
            }
        } else {
            if let Some(old) = self.statement.take() {
                if self.statement_generation == self.conn.generation() {
                    self.conn.stmt_close_inner(old.statement_id).await?;
                }
            }
            let stmt = self.conn.prepare_inner(sql).await?;
            self.statement_generation = self.conn.generation();
            self.statement = Some(stmt);
        }

        let Some(stmt) = self.statement.take() else {
            return Err(Error::programming(
                ProgrammingErrorKind::NoResultSet,
                "No prepared statement available",
            ));
        };
        let result = self.conn.execute_inner(&stmt, params, &[]).await;
        self.statement = Some(stmt);
        self.executed = Some(sql.to_string());
        let result = result?;
        self.handle_result(result).await
    }

    /// Execute statements separated by `;`. Results after the first are
    /// reached with [`Self::next_result`].
    pub async fn execute_multi(&mut self, cx: &Cx, sql: &str) -> Outcome<(), Error> {
        cancel_point!(cx);
        into_outcome(self.execute_multi_inner(sql).await)
    }

    async fn execute_multi_inner(&mut self, sql: &str) -> Result<()> {
        self.check_open()?;
        if self.prepared {
            return Err(Error::NotSupported(
                "Multiple statements are not supported by prepared cursors".to_string(),
            ));
        }
        self.discard_unread().await?;
        self.reset();
        let result = self.conn.query_inner(sql).await;
        self.executed = Some(sql.to_string());
        let result = result?;
        self.handle_result(result).await
    }

    /// Move to the next result of a multi-statement execution.
    ///
    /// Unread rows of the current result are discarded. Returns `false`
    /// when there are no more results.
    pub async fn next_result(&mut self, cx: &Cx) -> Outcome<bool, Error> {
        cancel_point!(cx);
        into_outcome(self.next_result_inner().await)
    }

    async fn next_result_inner(&mut self) -> Result<bool> {
        self.check_open()?;
        if self.conn.has_unread_result() {
            self.conn.read_rows(None).await?;
        }
        self.reset();
        match self.conn.next_result_inner().await? {
            Some(result) => {
                self.handle_result(result).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Execute `sql` once per parameter set; returns the total row count.
    ///
    /// `INSERT ... VALUES (...)` statements are sent as a single multi-row
    /// INSERT. Anything else runs once per parameter set.
    pub async fn executemany(
        &mut self,
        cx: &Cx,
        sql: &str,
        param_sets: &[Vec<Value>],
    ) -> Outcome<i64, Error> {
        cancel_point!(cx);
        into_outcome(self.executemany_inner(sql, param_sets).await)
    }

    async fn executemany_inner(&mut self, sql: &str, param_sets: &[Vec<Value>]) -> Result<i64> {
        self.check_open()?;
        if param_sets.is_empty() {
            self.reset();
            return Ok(0);
        }

        if !self.prepared {
            if let Some(batch) = batch_insert(sql, param_sets)? {
                tracing::debug!(rows = param_sets.len(), "executemany as multi-row INSERT");
                self.execute_inner(&batch, &[]).await?;
                return Ok(self.rowcount);
            }
        }

        let mut total = 0i64;
        for params in param_sets {
            self.execute_inner(sql, params).await?;
            if self.conn.has_unread_result() {
                self.conn.read_rows(None).await?;
            }
            total += self.rowcount.max(0);
        }
        self.rowcount = total;
        Ok(total)
    }

    /// Call a stored procedure and return the final values of its
    /// arguments (so OUT and INOUT parameters can be read).
    ///
    /// Result sets the procedure produces are kept in
    /// [`Self::stored_results`].
    #[tracing::instrument(level = "debug", skip(self, cx, args))]
    pub async fn callproc(&mut self, cx: &Cx, name: &str, args: &[Value]) -> Outcome<Vec<Value>, Error> {
        cancel_point!(cx);
        into_outcome(self.callproc_inner(name, args).await)
    }

    async fn callproc_inner(&mut self, name: &str, args: &[Value]) -> Result<Vec<Value>> {
        self.check_open()?;
        if self.prepared {
            return Err(Error::NotSupported(
                "Calling stored procedures is not supported by prepared cursors".to_string(),
            ));
        }
        if name.is_empty() {
            return Err(Error::programming(
                ProgrammingErrorKind::InvalidArgument,
                "Procedure name must not be empty",
            ));
        }
        self.discard_unread().await?;
        self.reset();
        self.stored_results.clear();

        let prefix = name.replace('.', "_");
        let vars: Vec<String> = (1..=args.len())
            .map(|i| format!("@_{}_arg{}", prefix, i))
            .collect();

        if !args.is_empty() {
            let assignments: Vec<String> = vars
                .iter()
                .zip(args)
                .map(|(var, value)| format!("{}={}", var, format_value_for_sql(value)))
                .collect();
            self.conn
                .execute_simple(&format!("SET {}", assignments.join(",")))
                .await?;
        }

        let call = format!("CALL {}({})", name, vars.join(","));
        self.executed = Some(call.clone());
        let mut result = Some(self.conn.query_inner(&call).await?);
        while let Some(current) = result {
            if current.has_rows() {
                let (rows, _) = self.conn.read_rows(None).await?;
                self.stored_results.push(rows);
            } else if let Some(ok) = current.ok_packet() {
                self.rowcount = i64::try_from(ok.affected_rows).unwrap_or(i64::MAX);
            }
            result = self.conn.next_result_inner().await?;
        }

        if args.is_empty() {
            return Ok(Vec::new());
        }
        self.conn
            .query_inner(&format!("SELECT {}", vars.join(",")))
            .await?;
        let (rows, _) = self.conn.read_rows(None).await?;
        self.conn.drain_results().await?;
        Ok(rows
            .into_iter()
            .next()
            .map(Row::into_values)
            .unwrap_or_default())
    }

    async fn handle_result(&mut self, result: CommandResult) -> Result<()> {
        match result {
            CommandResult::Ok(ok) => {
                self.rowcount = i64::try_from(ok.affected_rows).unwrap_or(i64::MAX);
                self.lastrowid = (ok.last_insert_id != 0).then_some(ok.last_insert_id);
                self.finish_statement().await
            }
            CommandResult::ResultSet(columns) => {
                self.columns = columns;
                match self.buffering {
                    Buffering::Buffered => {
                        let rows = self.read_rows(None).await?;
                        self.rowcount = i64::try_from(rows.len()).unwrap_or(i64::MAX);
                        self.rows = rows.into();
                        self.finish_statement().await
                    }
                    Buffering::Unbuffered => Ok(()),
                }
            }
        }
    }

    /// Collect warnings once the statement's rows are all read.
    async fn finish_statement(&mut self) -> Result<()> {
        let config = self.conn.config();
        let wanted = config.get_warnings || config.raise_on_warnings;
        let raise = config.raise_on_warnings;
        if !wanted || self.conn.warning_count() == 0 || self.conn.has_more_results() {
            return Ok(());
        }
        self.warnings = self.conn.fetch_warnings().await?;
        tracing::debug!(count = self.warnings.len(), "statement produced warnings");
        if raise {
            if let Some(first) = self.warnings.first() {
                return Err(first.clone().into_error());
            }
        }
        Ok(())
    }

    async fn read_rows(&mut self, count: Option<usize>) -> Result<Vec<Row>> {
        let raw = self.shape == RowShape::Raw;
        self.conn.set_raw(raw);
        let result = self.conn.read_rows(count).await;
        if raw {
            self.conn.set_raw(false);
        }
        result.map(|(rows, _)| rows)
    }

    async fn discard_unread(&mut self) -> Result<()> {
        if self.buffering == Buffering::Unbuffered && self.conn.has_unread_result() {
            self.conn.drain_results().await?;
        }
        Ok(())
    }

    // === Fetching ===

    /// Next row, or `None` when the result is exhausted.
    pub async fn fetchone(&mut self, cx: &Cx) -> Outcome<Option<CursorRow>, Error> {
        cancel_point!(cx);
        into_outcome(
            self.fetch(Some(1))
                .await
                .map(|rows| rows.into_iter().next()),
        )
    }

    /// Up to `size` rows.
    pub async fn fetchmany(&mut self, cx: &Cx, size: usize) -> Outcome<Vec<CursorRow>, Error> {
        cancel_point!(cx);
        into_outcome(self.fetch(Some(size)).await)
    }

    /// All remaining rows.
    pub async fn fetchall(&mut self, cx: &Cx) -> Outcome<Vec<CursorRow>, Error> {
        cancel_point!(cx);
        into_outcome(self.fetch(None).await)
    }

    async fn fetch(&mut self, count: Option<usize>) -> Result<Vec<CursorRow>> {
        self.check_open()?;
        if self.columns.is_empty() {
            return Err(Error::programming(
                ProgrammingErrorKind::NoResultSet,
                "No result set to fetch from",
            ));
        }

        let rows: Vec<Row> = match self.buffering {
            Buffering::Buffered => {
                let take = count.unwrap_or(self.rows.len()).min(self.rows.len());
                self.rows.drain(..take).collect()
            }
            Buffering::Unbuffered => {
                if !self.conn.has_unread_result() {
                    return Ok(Vec::new());
                }
                let rows = self.read_rows(count).await?;
                let fetched = i64::try_from(rows.len()).unwrap_or(i64::MAX);
                self.rowcount = self.rowcount.max(0) + fetched;
                if !self.conn.has_unread_result() {
                    self.finish_statement().await?;
                }
                rows
            }
        };
        Ok(rows
            .into_iter()
            .map(|row| CursorRow::shape(row, self.shape))
            .collect())
    }

    /// Close the cursor: unread rows are discarded and a prepared
    /// statement is deallocated on the server.
    pub async fn close(&mut self, cx: &Cx) -> Outcome<(), Error> {
        cancel_point!(cx);
        into_outcome(self.close_inner().await)
    }

    async fn close_inner(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.rows.clear();
        if self.conn.has_unread_result() {
            self.conn.drain_results().await?;
        }
        if let Some(stmt) = self.statement.take() {
            if self.statement_generation == self.conn.generation() && self.conn.is_open() {
                self.conn.stmt_close_inner(stmt.statement_id).await?;
            }
        }
        Ok(())
    }
}

impl Drop for Cursor<'_> {
    /// A cursor dropped without [`Cursor::close`] still frees its server
    /// statement: the close is queued on the connection and sent before
    /// its next command.
    fn drop(&mut self) {
        if let Some(stmt) = self.statement.take() {
            if self.statement_generation == self.conn.generation() {
                self.conn.defer_stmt_close(stmt.statement_id);
            }
        }
    }
}

/// Rewrite an INSERT into one statement carrying every parameter set, or
/// `None` if `sql` is not an `INSERT ... VALUES (...)`.
fn batch_insert(sql: &str, param_sets: &[Vec<Value>]) -> Result<Option<String>> {
    let Some((head, values, tail)) = split_insert_values(sql) else {
        return Ok(None);
    };
    let tuples = param_sets
        .iter()
        .map(|params| interpolate_params(values, params))
        .collect::<Result<Vec<_>>>()?;
    Ok(Some(format!("{}{}{}", head, tuples.join(","), tail)))
}
