//! Streaming query result support.
//!
//! Two families of stream live here:
//!
//! - [`QueryStream`]/[`MultiResultStream`]: eagerly-buffered result sets
//!   (populated once the whole batch response has been read), yielded one
//!   row at a time for a `Stream`-shaped API over data already in memory.
//! - [`CursorStream`]: backed by [`crate::exchange::Exchange`], pulling rows
//!   off the wire a fetch window at a time via a server-side cursor. This is
//!   the memory-efficient path for large result sets.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use tds_protocol::Token;

use crate::client::{ConnectionHandle, convert_nbc_row_token, convert_row_token};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::exchange::{Exchange, ExchangeBatch, ExchangeItem};
#[cfg(feature = "otel")]
use crate::instrumentation::InstrumentationContext;
use crate::row::{Column, Row};
use crate::statement_cache::{PreparedStatementCache, StatementCache};

/// A streaming result set from a query.
///
/// This stream yields rows one at a time, allowing processing of
/// large result sets without loading everything into memory.
///
/// # Example
///
/// ```rust,ignore
/// use futures::StreamExt;
///
/// let mut stream = client.query("SELECT * FROM large_table", &[]).await?;
///
/// while let Some(row) = stream.next().await {
///     let row = row?;
///     process_row(&row);
/// }
/// ```
pub struct QueryStream<'a> {
    /// Column metadata for the result set.
    columns: Vec<Column>,
    /// Rows already read off the wire, awaiting delivery.
    rows: VecDeque<Row>,
    /// Lifetime tied to the connection.
    _marker: std::marker::PhantomData<&'a ()>,
}

impl<'a> QueryStream<'a> {
    /// Create a new query stream over an already-read result set.
    pub(crate) fn new(columns: Vec<Column>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows: rows.into(),
            _marker: std::marker::PhantomData,
        }
    }

    /// Get the column metadata for this result set.
    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Check if the stream has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.rows.is_empty()
    }

    /// Collect all remaining rows into a vector.
    pub async fn collect_all(mut self) -> Result<Vec<Row>> {
        Ok(self.rows.drain(..).collect())
    }
}

impl Stream for QueryStream<'_> {
    type Item = Result<Row>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Poll::Ready(this.rows.pop_front().map(Ok))
    }
}

/// Result of a non-query execution.
///
/// Contains the number of affected rows and any output parameters.
#[derive(Debug, Clone)]
pub struct ExecuteResult {
    /// Number of rows affected by the statement.
    pub rows_affected: u64,
    /// Output parameters from stored procedures.
    pub output_params: Vec<OutputParam>,
}

/// An output parameter from a stored procedure call.
#[derive(Debug, Clone)]
pub struct OutputParam {
    /// Parameter name.
    pub name: String,
    /// Parameter value.
    pub value: mssql_types::SqlValue,
}

impl ExecuteResult {
    /// Create a new execute result.
    pub fn new(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            output_params: Vec::new(),
        }
    }

    /// Create a result with output parameters.
    pub fn with_outputs(rows_affected: u64, output_params: Vec<OutputParam>) -> Self {
        Self {
            rows_affected,
            output_params,
        }
    }

    /// Get an output parameter by name.
    #[must_use]
    pub fn get_output(&self, name: &str) -> Option<&OutputParam> {
        self.output_params
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }
}

/// One result set out of a multi-statement batch: its columns plus the rows
/// already read off the wire.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    columns: Vec<Column>,
    rows: Vec<Row>,
}

impl ResultSet {
    /// Build a result set from already-decoded columns and rows.
    #[must_use]
    pub fn new(columns: Vec<Column>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    /// Column metadata for this result set.
    #[must_use]
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Rows belonging to this result set.
    #[must_use]
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }
}

/// Multiple result sets from a batch or stored procedure.
///
/// Some queries return multiple result sets (e.g., stored procedures
/// with multiple SELECT statements).
pub struct MultiResultStream<'a> {
    /// Result sets in order, not yet visited.
    result_sets: VecDeque<ResultSet>,
    /// Rows of the currently-active result set.
    current_rows: VecDeque<Row>,
    /// Current result set index.
    current_result: usize,
    /// Lifetime tied to the connection.
    _marker: std::marker::PhantomData<&'a ()>,
}

impl<'a> MultiResultStream<'a> {
    /// Create a new multi-result stream over already-read result sets.
    pub(crate) fn new(mut result_sets: Vec<ResultSet>) -> Self {
        let current_rows = if result_sets.is_empty() {
            VecDeque::new()
        } else {
            result_sets.remove(0).rows.into()
        };

        Self {
            result_sets: result_sets.into(),
            current_rows,
            current_result: 0,
            _marker: std::marker::PhantomData,
        }
    }

    /// Get the current result set index (0-based).
    #[must_use]
    pub fn current_result_index(&self) -> usize {
        self.current_result
    }

    /// Move to the next result set.
    ///
    /// Returns `true` if there is another result set, `false` if no more.
    pub async fn next_result(&mut self) -> Result<bool, Error> {
        match self.result_sets.pop_front() {
            Some(next) => {
                self.current_rows = next.rows.into();
                self.current_result += 1;
                Ok(true)
            }
            None => {
                self.current_rows.clear();
                Ok(false)
            }
        }
    }

    /// Get the next row from the current result set.
    pub async fn next_row(&mut self) -> Result<Option<Row>, Error> {
        Ok(self.current_rows.pop_front())
    }
}

/// Everything a [`CursorStream`] needs to hand back besides the connection
/// itself, so [`Client`](crate::client::Client) can be fully reconstructed
/// once the exchange finishes instead of leaving the caller with a bare
/// `(ConnectionHandle, u64)` and no way to keep using the high-level API.
pub(crate) struct ResumeState {
    pub(crate) config: Config,
    pub(crate) server_version: Option<u32>,
    pub(crate) current_database: Option<String>,
    pub(crate) statement_cache: StatementCache,
    #[cfg(feature = "otel")]
    pub(crate) instrumentation: InstrumentationContext,
}

/// What to rebuild the opening RPC from if the cursor engine asks for a
/// silent reprepare. Shared between [`Exchange`] and this module's callers
/// indirectly, through [`Exchange::into_connection`].
enum EngineState {
    /// Waiting for the next `advance()` call; nothing in flight.
    Idle {
        exchange: Exchange,
        cache: PreparedStatementCache,
    },
    /// A boxed `advance()` future is in flight. Used only by [`CursorStream`]'s
    /// `Stream::poll_next`, which cannot `.await` directly.
    Polling(AdvanceFuture),
    /// The exchange reached its terminal phase; connection reclaimed.
    Closed {
        connection: ConnectionHandle,
        transaction_descriptor: u64,
        cache: PreparedStatementCache,
    },
}

type AdvanceOutput = (Exchange, PreparedStatementCache, Result<ExchangeBatch>);
type AdvanceFuture = Pin<Box<dyn Future<Output = AdvanceOutput> + Send>>;

async fn advance_once(mut exchange: Exchange, mut cache: PreparedStatementCache) -> AdvanceOutput {
    let result = exchange.advance(&mut cache).await;
    (exchange, cache, result)
}

/// Drives a single cursored or direct exchange, buffering the rows of the
/// current fetch window and tracking the column metadata of the current
/// result set.
///
/// Shared engine behind [`CursorStream`] (a `futures_core::Stream`) and any
/// future multi-result cursor consumer; kept as a plain struct with async
/// methods so [`CursorStream::poll_next`] is the only place that needs the
/// boxed-future indirection.
pub(crate) struct StreamEngine {
    state: Option<EngineState>,
    columns: Vec<Column>,
    metadata: Option<tds_protocol::ColMetaData>,
    buffered: VecDeque<Row>,
    rows_affected: u64,
    timeout_task: Option<tokio::task::JoinHandle<()>>,
}

impl StreamEngine {
    /// `statement_timeout`, when set, arms a background clock that sends an
    /// out-of-band attention via `cancel_handle` if the exchange is still
    /// open once the duration elapses. The clock is disarmed when this
    /// engine is dropped (exchange finished, connection reclaimed, or the
    /// stream abandoned), so it never fires against a connection already
    /// back in use for something else.
    pub(crate) fn new(
        exchange: Exchange,
        cache: PreparedStatementCache,
        statement_timeout: Option<(std::time::Duration, crate::cancel::CancelHandle)>,
    ) -> Self {
        let timeout_task = statement_timeout.map(|(duration, cancel_handle)| {
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                if let Err(e) = cancel_handle.cancel().await {
                    tracing::debug!(error = %e, "statement timeout: attention send failed");
                }
            })
        });
        Self {
            state: Some(EngineState::Idle { exchange, cache }),
            columns: Vec::new(),
            metadata: None,
            buffered: VecDeque::new(),
            rows_affected: 0,
            timeout_task,
        }
    }

    fn columns(&self) -> &[Column] {
        &self.columns
    }

    fn is_closed(&self) -> bool {
        matches!(self.state, Some(EngineState::Closed { .. }))
    }

    /// Ask the cursor to close instead of fetching another window, once the
    /// in-flight request completes.
    fn request_cancel(&mut self) {
        if let Some(EngineState::Idle { exchange, .. }) = &mut self.state {
            exchange.request_cancel();
        }
    }

    /// Hand the connection back once the exchange has reached its terminal
    /// phase, draining any still-outstanding fetch rounds first.
    async fn into_parts(mut self) -> Result<(ConnectionHandle, u64, PreparedStatementCache)> {
        self.request_cancel();
        while !self.is_closed() {
            self.advance().await?;
        }
        match self.state.take() {
            Some(EngineState::Closed {
                connection,
                transaction_descriptor,
                cache,
            }) => Ok((connection, transaction_descriptor, cache)),
            _ => Err(Error::ConnectionClosed),
        }
    }

    fn apply_batch(&mut self, batch: ExchangeBatch) -> Result<()> {
        for item in batch.items {
            match item {
                ExchangeItem::Token(Token::ColMetaData(meta)) => {
                    self.buffered.clear();
                    self.columns = crate::client::columns_from_metadata(&meta);
                    self.metadata = Some(meta);
                }
                ExchangeItem::Token(Token::Row(raw_row)) => {
                    if let Some(ref meta) = self.metadata {
                        let row = convert_row_token(&raw_row, meta, &self.columns)?;
                        self.buffered.push_back(row);
                    }
                }
                ExchangeItem::Token(Token::NbcRow(nbc_row)) => {
                    if let Some(ref meta) = self.metadata {
                        let row = convert_nbc_row_token(&nbc_row, meta, &self.columns)?;
                        self.buffered.push_back(row);
                    }
                }
                ExchangeItem::Token(Token::Error(err)) => {
                    return Err(Error::Server {
                        number: err.number,
                        state: err.state,
                        class: err.class,
                        message: err.message.clone(),
                        server: if err.server.is_empty() {
                            None
                        } else {
                            Some(err.server.clone())
                        },
                        procedure: if err.procedure.is_empty() {
                            None
                        } else {
                            Some(err.procedure.clone())
                        },
                        line: err.line as u32,
                    });
                }
                ExchangeItem::Token(Token::Done(done)) => {
                    if done.status.error {
                        return Err(Error::Query("query failed".to_string()));
                    }
                    self.rows_affected = done.row_count;
                }
                ExchangeItem::Token(Token::DoneProc(done)) => {
                    if done.status.error {
                        return Err(Error::Query("query failed".to_string()));
                    }
                }
                ExchangeItem::Token(Token::DoneInProc(done)) => {
                    if done.status.error {
                        return Err(Error::Query("query failed".to_string()));
                    }
                }
                ExchangeItem::Token(Token::Info(info)) => {
                    tracing::debug!(
                        number = info.number,
                        message = %info.message,
                        "server info message"
                    );
                }
                ExchangeItem::Token(_) => {}
                ExchangeItem::RowCount(n) => {
                    self.rows_affected = n;
                }
            }
        }
        Ok(())
    }

    /// Drive one `advance()` call to completion. Only safe to call from an
    /// `async` context, never from inside `poll_next`.
    async fn advance(&mut self) -> Result<()> {
        let (exchange, cache) = match self.state.take() {
            Some(EngineState::Idle { exchange, cache }) => (exchange, cache),
            Some(other) => {
                self.state = Some(other);
                return Ok(());
            }
            None => return Ok(()),
        };

        let (exchange, cache, result) = advance_once(exchange, cache).await;
        match result {
            Ok(batch) => {
                let done = batch.done;
                if let Err(e) = self.apply_batch(batch) {
                    let (connection, transaction_descriptor) = exchange.into_connection();
                    self.state = Some(EngineState::Closed {
                        connection,
                        transaction_descriptor,
                        cache,
                    });
                    return Err(e);
                }
                self.state = Some(if done {
                    tracing::trace!(rows_affected = self.rows_affected, "cursor exchange done");
                    let (connection, transaction_descriptor) = exchange.into_connection();
                    EngineState::Closed {
                        connection,
                        transaction_descriptor,
                        cache,
                    }
                } else {
                    EngineState::Idle { exchange, cache }
                });
                Ok(())
            }
            Err(e) => {
                tracing::debug!(error = %e, "cursor exchange failed, reclaiming connection");
                let (connection, transaction_descriptor) = exchange.into_connection();
                self.state = Some(EngineState::Closed {
                    connection,
                    transaction_descriptor,
                    cache,
                });
                Err(e)
            }
        }
    }

    /// Poll-compatible row fetch: pumps an in-flight boxed future rather than
    /// `.await`-ing directly, for use from [`CursorStream::poll_next`].
    fn poll_next_row(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Row>>> {
        loop {
            if let Some(row) = self.buffered.pop_front() {
                return Poll::Ready(Some(Ok(row)));
            }

            match self.state.take() {
                Some(EngineState::Closed {
                    connection,
                    transaction_descriptor,
                    cache,
                }) => {
                    self.state = Some(EngineState::Closed {
                        connection,
                        transaction_descriptor,
                        cache,
                    });
                    return Poll::Ready(None);
                }
                Some(EngineState::Idle { exchange, cache }) => {
                    self.state = Some(EngineState::Polling(Box::pin(advance_once(exchange, cache))));
                }
                Some(EngineState::Polling(mut fut)) => match fut.as_mut().poll(cx) {
                    Poll::Pending => {
                        self.state = Some(EngineState::Polling(fut));
                        return Poll::Pending;
                    }
                    Poll::Ready((exchange, cache, result)) => {
                        let batch = match result {
                            Ok(batch) => batch,
                            Err(e) => {
                                let (connection, transaction_descriptor) = exchange.into_connection();
                                self.state = Some(EngineState::Closed {
                                    connection,
                                    transaction_descriptor,
                                    cache,
                                });
                                return Poll::Ready(Some(Err(e)));
                            }
                        };
                        let done = batch.done;
                        if let Err(e) = self.apply_batch(batch) {
                            let (connection, transaction_descriptor) = exchange.into_connection();
                            self.state = Some(EngineState::Closed {
                                connection,
                                transaction_descriptor,
                                cache,
                            });
                            return Poll::Ready(Some(Err(e)));
                        }
                        self.state = Some(if done {
                            let (connection, transaction_descriptor) = exchange.into_connection();
                            EngineState::Closed {
                                connection,
                                transaction_descriptor,
                                cache,
                            }
                        } else {
                            EngineState::Idle { exchange, cache }
                        });
                    }
                },
                None => return Poll::Ready(None),
            }
        }
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        if let Some(handle) = self.timeout_task.take() {
            handle.abort();
        }
    }
}

/// A streaming result set backed by a server-side cursor (or direct
/// execution, when fetch windows are disabled).
///
/// Unlike [`QueryStream`], rows are pulled off the wire a fetch window at a
/// time as the caller consumes them, rather than read eagerly up front. Call
/// [`Client::resume_stream`](crate::client::Client::resume_stream) once done
/// to get a usable `Client` back.
pub struct CursorStream {
    engine: StreamEngine,
    resume: ResumeState,
}

impl CursorStream {
    pub(crate) fn new(engine: StreamEngine, resume: ResumeState) -> Self {
        Self { engine, resume }
    }

    /// Column metadata for the current result set, if any has been seen yet.
    #[must_use]
    pub fn columns(&self) -> &[Column] {
        self.engine.columns()
    }

    /// Whether the exchange has reached its terminal phase.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.engine.is_closed()
    }

    /// Rows affected, as reported by the most recent `DONE` token or
    /// synthesized fetch-round count.
    #[must_use]
    pub fn rows_affected(&self) -> u64 {
        self.engine.rows_affected
    }

    /// Drain any outstanding fetch rounds, close the cursor, and hand back
    /// everything needed to rebuild a `Client`: the connection, transaction
    /// descriptor, prepared-statement cache, and the bundle of state that
    /// doesn't round-trip through the exchange itself.
    pub(crate) async fn drain(
        self,
    ) -> Result<(ConnectionHandle, u64, PreparedStatementCache, ResumeState)> {
        let (connection, transaction_descriptor, cache) = self.engine.into_parts().await?;
        Ok((connection, transaction_descriptor, cache, self.resume))
    }

    /// Collect all remaining rows into a vector, closing the cursor.
    pub async fn collect_all(mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    async fn next_row(&mut self) -> Result<Option<Row>> {
        loop {
            if let Some(row) = self.engine.buffered.pop_front() {
                return Ok(Some(row));
            }
            if self.engine.is_closed() {
                return Ok(None);
            }
            self.engine.advance().await?;
        }
    }
}

impl Stream for CursorStream {
    type Item = Result<Row>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().engine.poll_next_row(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_result() {
        let result = ExecuteResult::new(42);
        assert_eq!(result.rows_affected, 42);
        assert!(result.output_params.is_empty());
    }

    #[test]
    fn test_execute_result_with_outputs() {
        let outputs = vec![OutputParam {
            name: "ReturnValue".to_string(),
            value: mssql_types::SqlValue::Int(100),
        }];

        let result = ExecuteResult::with_outputs(10, outputs);
        assert_eq!(result.rows_affected, 10);
        assert!(result.get_output("ReturnValue").is_some());
        assert!(result.get_output("returnvalue").is_some()); // case-insensitive
        assert!(result.get_output("NotFound").is_none());
    }

    fn sample_column() -> Column {
        Column {
            name: "id".to_string(),
            index: 0,
            type_name: "INT".to_string(),
            nullable: false,
            max_length: Some(4),
            precision: Some(0),
            scale: Some(0),
        }
    }

    #[test]
    fn test_query_stream_columns() {
        let columns = vec![sample_column()];
        let stream = QueryStream::new(columns, Vec::new());
        assert_eq!(stream.columns().len(), 1);
        assert_eq!(stream.columns()[0].name, "id");
        assert!(stream.is_finished());
    }

    #[test]
    fn test_query_stream_buffers_rows() {
        let columns = vec![sample_column()];
        let row = Row::from_values(columns.clone(), vec![mssql_types::SqlValue::Int(1)]);
        let stream = QueryStream::new(columns, vec![row]);
        assert!(!stream.is_finished());
    }

    #[tokio::test]
    async fn test_multi_result_stream_empty() {
        let mut stream = MultiResultStream::new(Vec::new());
        assert!(stream.next_row().await.unwrap().is_none());
        assert!(!stream.next_result().await.unwrap());
    }

    #[tokio::test]
    async fn test_multi_result_stream_advances_between_sets() {
        let columns = vec![sample_column()];
        let row0 = Row::from_values(columns.clone(), vec![mssql_types::SqlValue::Int(1)]);
        let row1 = Row::from_values(columns.clone(), vec![mssql_types::SqlValue::Int(2)]);
        let sets = vec![
            ResultSet::new(columns.clone(), vec![row0]),
            ResultSet::new(columns, vec![row1]),
        ];

        let mut stream = MultiResultStream::new(sets);
        assert_eq!(stream.current_result_index(), 0);
        assert!(stream.next_row().await.unwrap().is_some());
        assert!(stream.next_row().await.unwrap().is_none());

        assert!(stream.next_result().await.unwrap());
        assert_eq!(stream.current_result_index(), 1);
        assert!(stream.next_row().await.unwrap().is_some());

        assert!(!stream.next_result().await.unwrap());
    }
}
