//! Cursor flow engine: the reducer that drives a single cursored or direct
//! query exchange to completion.
//!
//! An exchange starts with one of three RPCs (`sp_executesql`,
//! `sp_cursoropen`, or `sp_cursorprepexec`/`sp_cursorexecute`) and then feeds
//! every inbound token through [`reduce`]. The reducer decides, per token,
//! whether to forward it downstream, suppress it, or emit a follow-up
//! request (`sp_cursorfetch`/`sp_cursorclose`/a retried prepexec) on the same
//! exchange. The exchange channel (`crate::exchange`) owns the wire; this
//! module only owns the decision.

use tds_protocol::{
    ColMetaData, Done, DoneInProc, DoneProc, ReturnValue, ServerError, Token,
};

/// INFO token number the server sends when a statement did not produce a
/// server-side cursor ("non-cursor" result).
const DIRECT_MODE_INFO_NUMBER: i32 = 16954;

/// Error numbers that indicate a prepared-statement handle was invalidated
/// server-side (schema change, plan eviction, …) and can be silently
/// recovered by re-preparing.
const TRANSIENT_REPREPARE_CODES: [i32; 4] = [586, 8144, 8178, 8179];

/// Which stored procedure opened this exchange. Determines the OUT-parameter
/// ordinals for the cursor id and prepared handle, and the surfaced-value
/// threshold below which `ReturnValue`s are internal bookkeeping rather than
/// caller-visible output parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorProcedure {
    /// `sp_executesql`: no cursor, streams rows directly.
    ExecuteSql,
    /// `sp_cursoropen`: unparameterized cursored text.
    CursorOpen,
    /// `sp_cursorprepexec`: first parameterized execution, prepares a handle.
    CursorPrepExec,
    /// `sp_cursorexecute`: subsequent execution of an already-prepared handle.
    CursorExecute,
}

impl CursorProcedure {
    /// OUT-parameter ordinal carrying the cursor id, if this procedure produces one.
    fn cursor_id_ordinal(self) -> Option<u16> {
        match self {
            Self::ExecuteSql => None,
            Self::CursorOpen => Some(0),
            Self::CursorPrepExec | Self::CursorExecute => Some(1),
        }
    }

    /// OUT-parameter ordinal carrying the prepared statement handle, if any.
    fn handle_ordinal(self) -> Option<u16> {
        match self {
            Self::CursorPrepExec => Some(0),
            _ => None,
        }
    }

    /// `ReturnValue`s at or above this ordinal are caller output parameters
    /// and are forwarded downstream; below it they're internal bookkeeping.
    fn surfaced_threshold(self) -> u16 {
        match self {
            Self::CursorPrepExec => 7,
            Self::ExecuteSql | Self::CursorOpen | Self::CursorExecute => 5,
        }
    }
}

/// Phase of a single in-flight cursored or direct exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CursorPhase {
    /// No fetch window is open yet; the opening RPC hasn't completed.
    #[default]
    None,
    /// A `sp_cursorfetch` round-trip is in flight.
    Fetching,
    /// Waiting out a `sp_cursorprepexec` silent retry.
    PrepareRetry,
    /// `sp_cursorclose` has been sent; waiting for its completion.
    Closing,
    /// The exchange has reached its terminal, completed state.
    Closed,
    /// The exchange completed with a surfaced server error.
    Error,
}

/// State carried across the lifetime of one cursored or direct exchange.
///
/// Mutated only from the reducer's call site (the connection's single
/// inbound-token path); never shared across threads.
#[derive(Debug, Clone)]
pub struct CursorState {
    procedure: CursorProcedure,
    fetch_size: u32,
    cursor_id: i32,
    phase: CursorPhase,
    has_more: bool,
    has_seen_rows: bool,
    has_seen_error: bool,
    error_token: Option<ServerError>,
    direct_mode: bool,
    cancel_requested: bool,
    retried: bool,
}

impl CursorState {
    /// Start tracking a new exchange opened via `procedure`. `sp_executesql`
    /// exchanges start in direct mode; cursored ones discover it later via
    /// the 16954 INFO token.
    #[must_use]
    pub fn new(procedure: CursorProcedure, fetch_size: u32) -> Self {
        Self {
            procedure,
            fetch_size,
            cursor_id: 0,
            phase: CursorPhase::None,
            has_more: false,
            has_seen_rows: false,
            has_seen_error: false,
            error_token: None,
            direct_mode: matches!(procedure, CursorProcedure::ExecuteSql),
            cancel_requested: false,
            retried: false,
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> CursorPhase {
        self.phase
    }

    /// The procedure this exchange was opened with.
    #[must_use]
    pub fn procedure(&self) -> CursorProcedure {
        self.procedure
    }

    /// The `FETCH_NEXT` row count this exchange was configured with.
    #[must_use]
    pub fn fetch_size(&self) -> u32 {
        self.fetch_size
    }

    /// Whether this exchange is in direct (non-cursored) mode.
    #[must_use]
    pub fn is_direct_mode(&self) -> bool {
        self.direct_mode
    }

    /// Cursor id decoded from the opening RPC's `ReturnValue`s, or 0 if none
    /// has arrived yet (or this is a direct exchange).
    #[must_use]
    pub fn cursor_id(&self) -> i32 {
        self.cursor_id
    }

    /// The last surfaced server error, if the exchange ended in `ERROR`.
    #[must_use]
    pub fn error_token(&self) -> Option<&ServerError> {
        self.error_token.as_ref()
    }

    /// Request that the next `onDone` close the cursor instead of fetching
    /// another window.
    pub fn request_cancel(&mut self) {
        self.cancel_requested = true;
    }
}

/// Classification of a server error number relevant to the cursor engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Prepared handle invalidated server-side; silently re-preparable.
    TransientReprepare,
    /// Everything else: surfaced to the caller.
    Surfaced,
}

/// Classify a server `ErrorToken` number.
#[must_use]
pub fn classify_error(error_number: i32) -> ErrorClass {
    if TRANSIENT_REPREPARE_CODES.contains(&error_number) {
        ErrorClass::TransientReprepare
    } else {
        ErrorClass::Surfaced
    }
}

/// Pseudo-token the reducer synthesizes from a suppressed `DoneInProcToken`
/// during a `FETCHING` window, so the consumer can publish a rows-updated
/// count per fetch round without seeing the raw DONEINPROC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntermediateCount(pub u64);

/// What the reducer wants done as a result of one inbound token.
#[derive(Debug, Clone)]
pub enum CursorEvent {
    /// Deliver this token downstream unchanged.
    Forward(Token),
    /// Deliver a synthesized row-count update downstream.
    Count(IntermediateCount),
    /// A prepared-statement handle was decoded; the caller should cache it
    /// against the query's fingerprint.
    PreparedHandle(i32),
}

/// A follow-up RPC the engine wants emitted on the same exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUpAction {
    /// Emit `sp_cursorfetch(cursor_id, FETCH_NEXT, 0, fetch_size)`.
    Fetch { cursor_id: i32, fetch_size: u32 },
    /// Emit `sp_cursorclose(cursor_id)`.
    Close { cursor_id: i32 },
    /// Invalidate the cached handle and emit a fresh
    /// `sp_cursorprepexec(UNPREPARED, …)` for the same query and bindings.
    Reprepare,
}

/// Result of feeding one inbound token through [`reduce`].
#[derive(Debug, Clone, Default)]
pub struct ReduceOutcome {
    /// Events to deliver, in order, before considering `follow_up`.
    pub events: Vec<CursorEvent>,
    /// A follow-up request to emit on the same exchange, if any.
    pub follow_up: Option<FollowUpAction>,
    /// Whether this token is the exchange's last frame: the downstream
    /// channel completes after delivering `events` for this call.
    pub is_last_frame: bool,
}

/// Feed one inbound token through the cursor flow engine.
///
/// Must be called with every token in wire order; the caller is responsible
/// for matching `ColMetaData`/`Row`/`NbcRow` decode against each other (that
/// pairing lives in `TokenParser::next_token_with_metadata`, not here).
pub fn reduce(state: &mut CursorState, token: Token) -> ReduceOutcome {
    let mut events = Vec::new();

    // Prepare-retry: suppress everything until the in-flight call's own
    // completion, then reset and ask for a fresh prepexec.
    if state.phase == CursorPhase::PrepareRetry {
        if let Token::DoneProc(done) = &token {
            if !done.status.more {
                state.phase = CursorPhase::None;
                state.has_seen_rows = false;
                state.has_seen_error = false;
                state.error_token = None;
                return ReduceOutcome {
                    events,
                    follow_up: Some(FollowUpAction::Reprepare),
                    is_last_frame: false,
                };
            }
        }
        return ReduceOutcome::default();
    }

    // Prepare-retry trigger takes priority over the ordinary error bookkeeping
    // below: at most one per subscription, and only while not already retried.
    if let Token::Error(err) = &token {
        if !state.retried && classify_error(err.number) == ErrorClass::TransientReprepare {
            state.phase = CursorPhase::PrepareRetry;
            state.retried = true;
            state.has_seen_error = false;
            state.error_token = None;
            return ReduceOutcome::default();
        }
    }

    // Step 1: track row/error sightings for every message.
    match &token {
        Token::Row(_) | Token::NbcRow(_) => state.has_seen_rows = true,
        Token::Error(err) => {
            state.has_seen_error = true;
            state.error_token = Some(err.clone());
        }
        _ => {}
    }

    // Step 2: ReturnValue ordinal routing.
    if let Token::ReturnValue(rv) = &token {
        route_return_value(state, rv, &mut events);
        return ReduceOutcome {
            events,
            follow_up: None,
            is_last_frame: false,
        };
    }

    // Step 3: direct-mode signal.
    if let Token::Info(info) = &token {
        if info.number == DIRECT_MODE_INFO_NUMBER {
            state.direct_mode = true;
        }
        events.push(CursorEvent::Forward(token));
        return ReduceOutcome {
            events,
            follow_up: None,
            is_last_frame: false,
        };
    }

    // Step 4: suppress zero-column metadata.
    if let Token::ColMetaData(ref meta) = token {
        if !columns_empty(meta) {
            events.push(CursorEvent::Forward(token));
        }
        return ReduceOutcome {
            events,
            follow_up: None,
            is_last_frame: false,
        };
    }

    // Step 6: attention-ack DONE ends the exchange immediately.
    if let Token::Done(ref done) = token {
        let is_attn = is_attention_ack(done);
        if is_attn {
            state.phase = CursorPhase::Closed;
        }
        events.push(CursorEvent::Forward(token));
        return ReduceOutcome {
            events,
            follow_up: None,
            is_last_frame: is_attn,
        };
    }

    // Step 5: DoneInProc.
    if let Token::DoneInProc(ref done) = token {
        route_done_in_proc(state, done, &mut events);
        return ReduceOutcome {
            events,
            follow_up: None,
            is_last_frame: false,
        };
    }

    // Steps 8 & 9: DoneProc drives phase-to-ERROR and onDone.
    if let Token::DoneProc(ref done) = token {
        if state.has_seen_error {
            state.phase = CursorPhase::Error;
        }
        let is_last = wants_completion(state);
        let follow_up = if !done.status.more {
            on_done(state)
        } else {
            None
        };
        return ReduceOutcome {
            events,
            follow_up,
            is_last_frame: is_last && !done.status.more,
        };
    }

    // Step 7: everything else forwards as-is (EnvChange, LoginAck, Order,
    // FeatureExtAck, Sspi, SessionState, FedAuthInfo, ReturnStatus).
    events.push(CursorEvent::Forward(token));
    ReduceOutcome {
        events,
        follow_up: None,
        is_last_frame: false,
    }
}

fn columns_empty(meta: &ColMetaData) -> bool {
    meta.columns.is_empty()
}

fn is_attention_ack(done: &Done) -> bool {
    done.status.attn
}

fn route_return_value(state: &mut CursorState, rv: &ReturnValue, events: &mut Vec<CursorEvent>) {
    if Some(rv.param_ordinal) == state.procedure.cursor_id_ordinal() {
        state.cursor_id = rv.as_i32();
    }
    if Some(rv.param_ordinal) == state.procedure.handle_ordinal() {
        events.push(CursorEvent::PreparedHandle(rv.as_i32()));
    }
    if rv.param_ordinal >= state.procedure.surfaced_threshold() {
        events.push(CursorEvent::Forward(Token::ReturnValue(rv.clone())));
    }
    // Below-threshold values are neither stored elsewhere nor forwarded;
    // dropping `rv` here releases the backing buffer.
}

fn route_done_in_proc(state: &mut CursorState, done: &DoneInProc, events: &mut Vec<CursorEvent>) {
    state.has_more = done.status.more;
    if state.direct_mode {
        events.push(CursorEvent::Forward(Token::DoneInProc(*done)));
    } else if state.phase == CursorPhase::Fetching && done.status.count {
        events.push(CursorEvent::Count(IntermediateCount(done.row_count)));
    }
}

/// Whether the exchange is at (or about to reach) a state where `onDone`
/// would declare completion rather than emit a follow-up request. Shared
/// between `is_last_frame` (evaluated before `onDone` runs) and `onDone`
/// itself (which re-checks it after the `ERROR` transition in step 8).
fn wants_completion(state: &CursorState) -> bool {
    matches!(
        state.phase,
        CursorPhase::Closing | CursorPhase::Closed | CursorPhase::Error
    ) || (matches!(state.phase, CursorPhase::None | CursorPhase::Fetching) && state.cursor_id == 0)
}

/// Decide the next action when a `DoneProcToken.isDone` arrives.
fn on_done(state: &mut CursorState) -> Option<FollowUpAction> {
    if wants_completion(state) {
        state.phase = CursorPhase::Closed;
        return None;
    }

    let should_continue =
        (state.phase == CursorPhase::None && state.has_more) || state.has_seen_rows;

    if should_continue && !state.cancel_requested {
        state.phase = CursorPhase::Fetching;
        state.has_seen_rows = false;
        Some(FollowUpAction::Fetch {
            cursor_id: state.cursor_id,
            fetch_size: state.fetch_size,
        })
    } else {
        state.phase = CursorPhase::Closing;
        Some(FollowUpAction::Close {
            cursor_id: state.cursor_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tds_protocol::{ColumnData, DoneStatus, ServerInfo, TypeId, TypeInfo};

    fn done(more: bool, count: bool, row_count: u64) -> DoneProc {
        DoneProc {
            status: DoneStatus {
                more,
                error: false,
                in_xact: false,
                count,
                attn: false,
                srverror: false,
            },
            cur_cmd: 0,
            row_count,
        }
    }

    fn done_in_proc(more: bool, count: bool, row_count: u64) -> DoneInProc {
        DoneInProc {
            status: DoneStatus {
                more,
                error: false,
                in_xact: false,
                count,
                attn: false,
                srverror: false,
            },
            cur_cmd: 0,
            row_count,
        }
    }

    fn col_metadata(n: usize) -> ColMetaData {
        ColMetaData {
            columns: (0..n)
                .map(|i| ColumnData {
                    name: format!("c{i}"),
                    type_id: TypeId::Int4,
                    col_type: TypeId::Int4 as u8,
                    user_type: 0,
                    flags: 0,
                    type_info: TypeInfo {
                        max_length: None,
                        precision: None,
                        scale: None,
                        collation: None,
                    },
                })
                .collect(),
        }
    }

    fn return_value(ordinal: u16, value: i32) -> ReturnValue {
        ReturnValue {
            param_ordinal: ordinal,
            param_name: String::new(),
            status: 1,
            user_type: 0,
            flags: 0,
            type_info: TypeInfo {
                max_length: None,
                precision: None,
                scale: None,
                collation: None,
            },
            value: {
                let mut b = bytes::BytesMut::new();
                bytes::BufMut::put_i32_le(&mut b, value);
                b.freeze()
            },
        }
    }

    #[test]
    fn direct_empty_result_completes_after_done_proc() {
        let mut state = CursorState::new(CursorProcedure::ExecuteSql, 0);
        assert!(state.direct_mode);

        let meta = reduce(&mut state, Token::ColMetaData(col_metadata(1)));
        assert_eq!(meta.events.len(), 1);

        let row = reduce(&mut state, Token::Row(tds_protocol::RawRow { data: bytes::Bytes::new() }));
        assert_eq!(row.events.len(), 1);

        let dip = reduce(&mut state, Token::DoneInProc(done_in_proc(false, true, 1)));
        assert_eq!(dip.events.len(), 1, "direct mode forwards DoneInProc");

        let outcome = reduce(&mut state, Token::DoneProc(done(false, false, 0)));
        assert!(outcome.is_last_frame);
        assert!(outcome.follow_up.is_none());
        assert_eq!(state.phase(), CursorPhase::Closed);
    }

    #[test]
    fn cursored_two_windows_then_empty_close() {
        let mut state = CursorState::new(CursorProcedure::CursorOpen, 10);

        // Open's own ReturnValue carries the cursor id at ordinal 0.
        let rv = reduce(&mut state, Token::ReturnValue(return_value(0, 42)));
        assert!(rv.events.is_empty(), "below-threshold ordinal is suppressed");
        assert_eq!(state.cursor_id(), 42);

        for _ in 0..10 {
            reduce(&mut state, Token::Row(tds_protocol::RawRow { data: bytes::Bytes::new() }));
        }
        reduce(&mut state, Token::DoneInProc(done_in_proc(true, true, 10)));
        let open_done = reduce(&mut state, Token::DoneProc(done(false, false, 0)));
        assert!(!open_done.is_last_frame);
        assert_eq!(
            open_done.follow_up,
            Some(FollowUpAction::Fetch { cursor_id: 42, fetch_size: 10 })
        );
        assert_eq!(state.phase(), CursorPhase::Fetching);

        for _ in 0..3 {
            reduce(&mut state, Token::Row(tds_protocol::RawRow { data: bytes::Bytes::new() }));
        }
        reduce(&mut state, Token::DoneInProc(done_in_proc(false, true, 3)));
        let second_done = reduce(&mut state, Token::DoneProc(done(false, false, 0)));
        assert_eq!(
            second_done.follow_up,
            Some(FollowUpAction::Fetch { cursor_id: 42, fetch_size: 10 })
        );

        // Third fetch comes back empty.
        reduce(&mut state, Token::DoneInProc(done_in_proc(false, true, 0)));
        let third_done = reduce(&mut state, Token::DoneProc(done(false, false, 0)));
        assert!(!third_done.is_last_frame, "close hasn't happened yet");
        assert_eq!(third_done.follow_up, Some(FollowUpAction::Close { cursor_id: 42 }));
        assert_eq!(state.phase(), CursorPhase::Closing);

        let close_done = reduce(&mut state, Token::DoneProc(done(false, false, 0)));
        assert!(close_done.is_last_frame);
        assert_eq!(state.phase(), CursorPhase::Closed);
    }

    #[test]
    fn prepare_retry_invalidates_handle_once() {
        let mut state = CursorState::new(CursorProcedure::CursorExecute, 10);
        state.cursor_id = 99; // as if already open from a prior prepexec

        let err = ServerError {
            number: 8179,
            state: 1,
            class: 16,
            message: "handle invalid".into(),
            server: String::new(),
            procedure: String::new(),
            line: 0,
        };
        let outcome = reduce(&mut state, Token::Error(err));
        assert!(outcome.events.is_empty(), "retry-eligible error is hidden");
        assert_eq!(state.phase(), CursorPhase::PrepareRetry);

        let done_outcome = reduce(&mut state, Token::DoneProc(done(false, false, 0)));
        assert_eq!(done_outcome.follow_up, Some(FollowUpAction::Reprepare));
        assert_eq!(state.phase(), CursorPhase::None);
        assert!(state.retried);

        // A second transient error on the same subscription surfaces normally.
        let err2 = ServerError {
            number: 8179,
            state: 1,
            class: 16,
            message: "handle invalid again".into(),
            server: String::new(),
            procedure: String::new(),
            line: 0,
        };
        let outcome2 = reduce(&mut state, Token::Error(err2));
        assert_eq!(outcome2.events.len(), 0, "still bookkeeping-only, not yet forwarded");
        assert!(state.has_seen_error);
    }

    #[test]
    fn empty_open_result_completes_without_fetch_or_close() {
        let mut state = CursorState::new(CursorProcedure::CursorOpen, 10);
        // cursor id stays 0: no rows, server never opened a cursor.
        let outcome = reduce(&mut state, Token::DoneProc(done(false, false, 0)));
        assert!(outcome.is_last_frame);
        assert!(outcome.follow_up.is_none());
        assert_eq!(state.phase(), CursorPhase::Closed);
    }

    #[test]
    fn downstream_cancel_routes_to_close_on_next_done() {
        let mut state = CursorState::new(CursorProcedure::CursorOpen, 10);
        state.cursor_id = 7;
        state.phase = CursorPhase::Fetching;
        state.has_seen_rows = true;
        state.request_cancel();

        let outcome = reduce(&mut state, Token::DoneProc(done(false, false, 0)));
        assert_eq!(outcome.follow_up, Some(FollowUpAction::Close { cursor_id: 7 }));
        assert_eq!(state.phase(), CursorPhase::Closing);
    }

    #[test]
    fn direct_mode_info_token_flips_flag() {
        let mut state = CursorState::new(CursorProcedure::CursorOpen, 10);
        assert!(!state.direct_mode);
        let info = ServerInfo {
            number: DIRECT_MODE_INFO_NUMBER,
            state: 0,
            class: 0,
            message: "not a cursor".into(),
            server: String::new(),
            procedure: String::new(),
            line: 0,
        };
        let outcome = reduce(&mut state, Token::Info(info));
        assert!(state.direct_mode);
        assert_eq!(outcome.events.len(), 1);
    }

    #[test]
    fn zero_column_metadata_is_suppressed() {
        let mut state = CursorState::new(CursorProcedure::ExecuteSql, 0);
        let outcome = reduce(&mut state, Token::ColMetaData(col_metadata(0)));
        assert!(outcome.events.is_empty());
    }

    #[test]
    fn attention_ack_done_closes_immediately() {
        let mut state = CursorState::new(CursorProcedure::CursorOpen, 10);
        state.cursor_id = 5;
        state.phase = CursorPhase::Fetching;
        let mut attn_status = DoneStatus::default();
        attn_status.attn = true;
        let outcome = reduce(
            &mut state,
            Token::Done(Done {
                status: attn_status,
                cur_cmd: 0,
                row_count: 0,
            }),
        );
        assert!(outcome.is_last_frame);
        assert_eq!(state.phase(), CursorPhase::Closed);
    }

    #[test]
    fn prepexec_handle_and_cursor_ordinals_are_distinct() {
        let mut state = CursorState::new(CursorProcedure::CursorPrepExec, 10);
        let handle_rv = reduce(&mut state, Token::ReturnValue(return_value(0, 77)));
        assert_eq!(handle_rv.events.len(), 1);
        assert!(matches!(handle_rv.events[0], CursorEvent::PreparedHandle(77)));

        let cursor_rv = reduce(&mut state, Token::ReturnValue(return_value(1, 42)));
        assert!(cursor_rv.events.is_empty());
        assert_eq!(state.cursor_id(), 42);

        // ordinal 6 is below prepexec's threshold of 7: still suppressed.
        let suppressed = reduce(&mut state, Token::ReturnValue(return_value(6, 0)));
        assert!(suppressed.events.is_empty());

        // an application OUT parameter at ordinal 7 is forwarded.
        let surfaced = reduce(&mut state, Token::ReturnValue(return_value(7, 123)));
        assert_eq!(surfaced.events.len(), 1);
    }

    #[test]
    fn classify_error_matches_transient_codes() {
        for code in [586, 8144, 8178, 8179] {
            assert_eq!(classify_error(code), ErrorClass::TransientReprepare);
        }
        assert_eq!(classify_error(2627), ErrorClass::Surfaced);
    }
}
