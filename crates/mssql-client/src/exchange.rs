//! Exchange channel: owns a single cursored or direct query's wire traffic
//! end to end, driving [`crate::cursor::reduce`] against inbound tokens and
//! re-emitting follow-up RPCs on the same connection.
//!
//! There is no dispatcher task and no `Arc<Mutex<_>>` sharing of the socket.
//! [`Exchange::open`] takes a [`ConnectionHandle`] by value for the
//! exchange's lifetime; [`Exchange::into_connection`] hands it back once the
//! exchange reaches its terminal phase. Ownership, not a channel, is what
//! enforces single-writer-per-connection here.

use tds_protocol::packet::PacketType;
use tds_protocol::rpc::{RpcParam, RpcRequest};
use tds_protocol::{ColMetaData, Token, TokenParser};

use crate::client::ConnectionHandle;
use crate::cursor::{self, CursorEvent, CursorProcedure, CursorState, FollowUpAction, IntermediateCount};
use crate::error::{Error, Result};
use crate::statement_cache::{ParamTypeDescriptor, PreparedStatementCache, StatementFingerprint};

/// Inputs needed to open a new cursored or direct exchange.
#[derive(Debug, Clone)]
pub struct ExchangeRequest {
    sql: String,
    params: Vec<RpcParam>,
    param_types: Vec<ParamTypeDescriptor>,
    fetch_size: u32,
}

impl ExchangeRequest {
    /// Start a request for `sql` with the given `FETCH NEXT` row count.
    /// `fetch_size == 0` always routes through `sp_executesql`.
    #[must_use]
    pub fn new(sql: impl Into<String>, fetch_size: u32) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            param_types: Vec::new(),
            fetch_size,
        }
    }

    /// Attach bound parameters and their formal type declarations, in order.
    #[must_use]
    pub fn with_params(mut self, params: Vec<RpcParam>, param_types: Vec<ParamTypeDescriptor>) -> Self {
        self.params = params;
        self.param_types = param_types;
        self
    }

    fn fingerprint(&self) -> StatementFingerprint {
        StatementFingerprint::new(self.sql.clone(), self.param_types.clone())
    }
}

/// One item surfaced to the stream consumer by [`Exchange::advance`].
#[derive(Debug, Clone)]
pub enum ExchangeItem {
    /// A token to deliver downstream unchanged: column metadata, rows,
    /// surfaced output parameters, env-change/info tokens, and the final
    /// completion `DONE`.
    Token(Token),
    /// A synthesized rows-affected update for a fetch round that produced no
    /// `DONE`/`COLMETADATA` of its own.
    RowCount(u64),
}

/// The tokens produced by feeding one inbound TDS message through the cursor
/// flow engine.
#[derive(Debug, Clone, Default)]
pub struct ExchangeBatch {
    /// Items to deliver, in wire order.
    pub items: Vec<ExchangeItem>,
    /// Whether the exchange has reached its terminal phase. No more calls to
    /// [`Exchange::advance`] should be made after this is `true`.
    pub done: bool,
}

/// What to rebuild the opening RPC from if the cursor engine asks for a
/// silent reprepare.
#[derive(Debug, Clone)]
struct ReopenContext {
    sql: String,
    params: Vec<RpcParam>,
}

/// A single in-flight cursored or direct query exchange.
///
/// Owns the connection outright for its lifetime; there is at most one
/// `Exchange` per connection at a time, enforced by `Client<Ready>::query_stream`
/// consuming `self` to produce one.
pub struct Exchange {
    connection: ConnectionHandle,
    transaction_descriptor: u64,
    max_packet_size: usize,
    cursor: CursorState,
    pending_metadata: Option<ColMetaData>,
    fingerprint: StatementFingerprint,
    reopen: ReopenContext,
    done: bool,
}

impl Exchange {
    /// Open a new exchange: pick the opening procedure (direct, prepared
    /// handle reuse, prepexec, or unparameterized cursor open), send it, and
    /// return the exchange ready for [`Self::advance`].
    pub async fn open(
        mut connection: ConnectionHandle,
        transaction_descriptor: u64,
        max_packet_size: usize,
        cache: &mut PreparedStatementCache,
        request: ExchangeRequest,
    ) -> Result<Self> {
        let fingerprint = request.fingerprint();
        let cached_handle = if request.fetch_size > 0 {
            cache.get_handle(&fingerprint)
        } else {
            None
        };

        let (procedure, rpc) = if request.fetch_size == 0 {
            (
                CursorProcedure::ExecuteSql,
                RpcRequest::execute_sql(&request.sql, request.params.clone()),
            )
        } else if let Some(handle) = cached_handle {
            (
                CursorProcedure::CursorExecute,
                RpcRequest::cursor_execute(handle, request.params.clone()),
            )
        } else if !request.params.is_empty() {
            (
                CursorProcedure::CursorPrepExec,
                RpcRequest::cursor_prepexec(&request.sql, request.params.clone()),
            )
        } else {
            (
                CursorProcedure::CursorOpen,
                RpcRequest::cursor_open(&request.sql),
            )
        };

        let payload = rpc.encode_with_transaction(transaction_descriptor);
        connection
            .send_message(PacketType::Rpc, payload, max_packet_size)
            .await
            .map_err(|e| Error::Protocol(e.to_string()))?;

        Ok(Self {
            connection,
            transaction_descriptor,
            max_packet_size,
            cursor: CursorState::new(procedure, request.fetch_size),
            pending_metadata: None,
            fingerprint,
            reopen: ReopenContext {
                sql: request.sql,
                params: request.params,
            },
            done: false,
        })
    }

    /// Current cursor flow state, for diagnostics and tests.
    #[must_use]
    pub fn cursor_state(&self) -> &CursorState {
        &self.cursor
    }

    /// Whether the exchange has reached its terminal phase.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Ask that the next completion close the cursor instead of fetching
    /// another window. Takes effect on the in-flight request's own
    /// completion; this does not interrupt a request already in transit.
    pub fn request_cancel(&mut self) {
        self.cursor.request_cancel();
    }

    /// Read and process the next inbound TDS message, driving the cursor
    /// flow engine and sending any follow-up RPC it asks for.
    ///
    /// Must not be called again once a previous call returned `done: true`.
    pub async fn advance(&mut self, cache: &mut PreparedStatementCache) -> Result<ExchangeBatch> {
        if self.done {
            return Ok(ExchangeBatch {
                items: Vec::new(),
                done: true,
            });
        }

        let message = self
            .connection
            .read_message()
            .await
            .map_err(|e| Error::Protocol(e.to_string()))?
            .ok_or(Error::ConnectionClosed)?;

        let mut parser = TokenParser::new(message.payload);
        let mut items = Vec::new();

        while let Some(token) = parser
            .next_token_with_metadata(self.pending_metadata.as_ref())
            .map_err(Error::from)?
        {
            if let Token::ColMetaData(ref meta) = token {
                self.pending_metadata = Some(meta.clone());
            }

            if let Token::EnvChange(ref env) = token {
                crate::client::process_transaction_env_change(env, &mut self.transaction_descriptor);
            }

            let outcome = cursor::reduce(&mut self.cursor, token);

            for event in outcome.events {
                match event {
                    CursorEvent::Forward(tok) => items.push(ExchangeItem::Token(tok)),
                    CursorEvent::Count(IntermediateCount(n)) => {
                        items.push(ExchangeItem::RowCount(n));
                    }
                    CursorEvent::PreparedHandle(handle) => {
                        cache.put_handle(self.fingerprint.clone(), handle);
                    }
                }
            }

            if let Some(follow_up) = outcome.follow_up {
                self.dispatch_follow_up(follow_up, cache).await?;
            }

            if outcome.is_last_frame {
                self.done = true;
                break;
            }
        }

        Ok(ExchangeBatch {
            items,
            done: self.done,
        })
    }

    async fn dispatch_follow_up(
        &mut self,
        action: FollowUpAction,
        cache: &mut PreparedStatementCache,
    ) -> Result<()> {
        let rpc = match action {
            FollowUpAction::Reprepare => {
                cache.invalidate(&self.fingerprint);
                let fetch_size = self.cursor.fetch_size();
                self.cursor = CursorState::new(CursorProcedure::CursorPrepExec, fetch_size);
                RpcRequest::cursor_prepexec(&self.reopen.sql, self.reopen.params.clone())
            }
            other => follow_up_rpc(other),
        };

        let payload = rpc.encode_with_transaction(self.transaction_descriptor);
        self.connection
            .send_message(PacketType::Rpc, payload, self.max_packet_size)
            .await
            .map_err(|e| Error::Protocol(e.to_string()))
    }

    /// Hand the connection back to its owner once the exchange is done.
    ///
    /// The returned descriptor reflects any `BeginTransaction`/
    /// `CommitTransaction`/`RollbackTransaction` EnvChange tokens observed
    /// during the exchange (e.g. raw `BEGIN TRANSACTION`/`COMMIT` text sent
    /// as part of the cursored SQL), not just the value passed to
    /// [`Self::open`].
    #[must_use]
    pub fn into_connection(self) -> (ConnectionHandle, u64) {
        (self.connection, self.transaction_descriptor)
    }
}

/// Build the RPC for a non-reprepare follow-up action. Split out from
/// [`Exchange::dispatch_follow_up`] so it can be unit-tested without a real
/// connection.
fn follow_up_rpc(action: FollowUpAction) -> RpcRequest {
    match action {
        FollowUpAction::Fetch {
            cursor_id,
            fetch_size,
        } => RpcRequest::cursor_fetch(cursor_id, fetch_size),
        FollowUpAction::Close { cursor_id } => RpcRequest::cursor_close(cursor_id),
        FollowUpAction::Reprepare => {
            unreachable!("Reprepare is handled in dispatch_follow_up, not here")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroUsize;

    #[test]
    fn exchange_request_fingerprint_reflects_params() {
        let req = ExchangeRequest::new("SELECT @p1", 10).with_params(
            vec![RpcParam::int("@p1", 1)],
            vec![ParamTypeDescriptor::from("int")],
        );
        let fp1 = req.fingerprint();

        let req2 = ExchangeRequest::new("SELECT @p1", 10).with_params(
            vec![RpcParam::bigint("@p1", 1)],
            vec![ParamTypeDescriptor::from("bigint")],
        );
        let fp2 = req2.fingerprint();

        assert_ne!(fp1, fp2, "different param types must not share a fingerprint");
    }

    #[test]
    fn follow_up_rpc_fetch_encodes_cursor_and_size() {
        let rpc = follow_up_rpc(FollowUpAction::Fetch {
            cursor_id: 42,
            fetch_size: 10,
        });
        let encoded = rpc.encode();
        assert!(!encoded.is_empty());
    }

    #[test]
    fn follow_up_rpc_close_encodes() {
        let rpc = follow_up_rpc(FollowUpAction::Close { cursor_id: 7 });
        let encoded = rpc.encode();
        assert!(!encoded.is_empty());
    }

    #[test]
    #[should_panic(expected = "Reprepare is handled")]
    fn follow_up_rpc_rejects_reprepare() {
        let _ = follow_up_rpc(FollowUpAction::Reprepare);
    }

    #[test]
    fn fresh_cache_misses_before_open() {
        let mut cache = PreparedStatementCache::new(
            crate::statement_cache::StatementCacheMode::Lru(NonZeroUsize::new(8).unwrap()),
        );
        let fp = StatementFingerprint::new("SELECT 1", Vec::new());
        assert_eq!(cache.get_handle(&fp), None);
    }
}
