//! Request event store: inbound dedup and handler state tracking.

use super::{Db, DbError, DbResult};
use rusqlite::{params, OptionalExtension, Row};
use std::fmt;

/// Handler lifecycle of an inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    HandlerExecuting,
    HandlerExecuted,
    Error,
}

impl RequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Received => "received",
            RequestState::HandlerExecuting => "handler-executing",
            RequestState::HandlerExecuted => "handler-executed",
            RequestState::Error => "error",
        }
    }

    fn parse(s: &str) -> Option<RequestState> {
        match s {
            "received" => Some(RequestState::Received),
            "handler-executing" => Some(RequestState::HandlerExecuting),
            "handler-executed" => Some(RequestState::HandlerExecuted),
            "error" => Some(RequestState::Error),
            _ => None,
        }
    }

    /// received -> handler-executing -> {handler-executed | error}
    fn can_transition_to(&self, next: RequestState) -> bool {
        matches!(
            (self, next),
            (RequestState::Received, RequestState::HandlerExecuting)
                | (RequestState::HandlerExecuting, RequestState::HandlerExecuted)
                | (RequestState::HandlerExecuting, RequestState::Error)
        )
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publication outcome of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseState {
    Published,
    Failed,
}

impl ResponseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseState::Published => "published",
            ResponseState::Failed => "failed",
        }
    }
}

/// A persisted inbound request event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEvent {
    pub id: i64,
    pub nostr_id: String,
    pub app_id: i64,
    pub content: String,
    pub method: String,
    pub state: RequestState,
    pub created_at: u64,
}

/// Outcome of [`Db::record_or_reject`].
#[derive(Debug)]
pub enum RecordOutcome {
    Fresh(RequestEvent),
    Duplicate,
}

fn request_from_row(row: &Row<'_>) -> rusqlite::Result<RequestEvent> {
    let state_raw: String = row.get(5)?;
    Ok(RequestEvent {
        id: row.get(0)?,
        nostr_id: row.get(1)?,
        app_id: row.get(2)?,
        content: row.get(3)?,
        method: row.get(4)?,
        state: RequestState::parse(&state_raw).unwrap_or(RequestState::Error),
        created_at: row.get::<_, i64>(6)? as u64,
    })
}

const REQUEST_COLUMNS: &str = "id, nostr_id, app_id, content, method, state, created_at";

impl Db {
    /// Persist an inbound request or reject it as a redelivery.
    ///
    /// The UNIQUE constraint on `nostr_id` is the only idempotency barrier:
    /// concurrent record attempts for the same id resolve to exactly one
    /// `Fresh` outcome.
    pub fn record_or_reject(
        &self,
        nostr_id: &str,
        app_id: i64,
        content: &str,
        method: &str,
        received_at: u64,
    ) -> DbResult<RecordOutcome> {
        let conn = self.conn();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO request_events (nostr_id, app_id, content, method, created_at)
             VALUES (?, ?, ?, ?, ?)",
            params![nostr_id, app_id, content, method, received_at as i64],
        )?;

        if inserted == 0 {
            return Ok(RecordOutcome::Duplicate);
        }

        Ok(RecordOutcome::Fresh(RequestEvent {
            id: conn.last_insert_rowid(),
            nostr_id: nostr_id.to_string(),
            app_id,
            content: content.to_string(),
            method: method.to_string(),
            state: RequestState::Received,
            created_at: received_at,
        }))
    }

    /// Record the method once the envelope has been decrypted and parsed.
    pub fn set_request_method(&self, request_event_id: i64, method: &str) -> DbResult<()> {
        self.conn().execute(
            "UPDATE request_events SET method = ? WHERE id = ?",
            params![method, request_event_id],
        )?;
        Ok(())
    }

    /// Advance a request's handler state, enforcing the transition graph.
    pub fn mark_request_state(&self, request_event_id: i64, state: RequestState) -> DbResult<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let current_raw: Option<String> = tx
            .query_row(
                "SELECT state FROM request_events WHERE id = ?",
                [request_event_id],
                |row| row.get(0),
            )
            .optional()?;
        let current_raw = current_raw
            .ok_or_else(|| DbError::NotFound(format!("request event {}", request_event_id)))?;
        let current = RequestState::parse(&current_raw).unwrap_or(RequestState::Error);

        if !current.can_transition_to(state) {
            return Err(DbError::InvalidStateTransition {
                from: current,
                to: state,
            });
        }

        tx.execute(
            "UPDATE request_events SET state = ? WHERE id = ?",
            params![state.as_str(), request_event_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_request_event(&self, request_event_id: i64) -> DbResult<RequestEvent> {
        let conn = self.conn();
        conn.query_row(
            &format!(
                "SELECT {} FROM request_events WHERE id = ?",
                REQUEST_COLUMNS
            ),
            [request_event_id],
            request_from_row,
        )
        .optional()?
        .ok_or_else(|| DbError::NotFound(format!("request event {}", request_event_id)))
    }

    pub fn list_request_events(&self, limit: u32) -> DbResult<Vec<RequestEvent>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM request_events ORDER BY created_at DESC LIMIT ?",
            REQUEST_COLUMNS
        ))?;
        let events = stmt
            .query_map([limit], request_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }

    /// Record a reply (one row per response event; multi-pay requests get one
    /// row per element).
    pub fn record_response(
        &self,
        request_event_id: i64,
        nostr_id: Option<&str>,
        d_tag: Option<&str>,
        content: &str,
        state: ResponseState,
        replied_at: u64,
    ) -> DbResult<()> {
        self.conn().execute(
            "INSERT INTO response_events
                 (request_event_id, nostr_id, d_tag, content, state, replied_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                request_event_id,
                nostr_id,
                d_tag,
                content,
                state.as_str(),
                replied_at as i64,
            ],
        )?;
        Ok(())
    }

    pub fn count_responses(&self, request_event_id: i64) -> DbResult<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM response_events WHERE request_event_id = ?",
            [request_event_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_with_app() -> (Db, i64) {
        let db = Db::open_in_memory().unwrap();
        let app = db.create_app("app", &"ab".repeat(32), &[]).unwrap();
        (db, app.id)
    }

    #[test]
    fn test_record_then_duplicate() {
        let (db, app_id) = db_with_app();

        let first = db
            .record_or_reject("event-1", app_id, "cipher", "", 1_000)
            .unwrap();
        let request = match first {
            RecordOutcome::Fresh(request) => request,
            RecordOutcome::Duplicate => panic!("first delivery must be fresh"),
        };
        assert_eq!(request.state, RequestState::Received);

        let second = db
            .record_or_reject("event-1", app_id, "cipher", "", 2_000)
            .unwrap();
        assert!(matches!(second, RecordOutcome::Duplicate));

        // Exactly one row survives
        let stored = db.get_request_event(request.id).unwrap();
        assert_eq!(stored.created_at, 1_000);
    }

    #[test]
    fn test_state_transitions() {
        let (db, app_id) = db_with_app();
        let request = match db
            .record_or_reject("event-1", app_id, "cipher", "", 1_000)
            .unwrap()
        {
            RecordOutcome::Fresh(request) => request,
            RecordOutcome::Duplicate => unreachable!(),
        };

        db.mark_request_state(request.id, RequestState::HandlerExecuting)
            .unwrap();
        db.mark_request_state(request.id, RequestState::HandlerExecuted)
            .unwrap();

        assert_eq!(
            db.get_request_event(request.id).unwrap().state,
            RequestState::HandlerExecuted
        );
    }

    #[test]
    fn test_out_of_order_transition_rejected() {
        let (db, app_id) = db_with_app();
        let request = match db
            .record_or_reject("event-1", app_id, "cipher", "", 1_000)
            .unwrap()
        {
            RecordOutcome::Fresh(request) => request,
            RecordOutcome::Duplicate => unreachable!(),
        };

        // received -> handler-executed skips handler-executing
        let result = db.mark_request_state(request.id, RequestState::HandlerExecuted);
        assert!(matches!(
            result,
            Err(DbError::InvalidStateTransition {
                from: RequestState::Received,
                to: RequestState::HandlerExecuted,
            })
        ));

        // Terminal states accept no further transitions
        db.mark_request_state(request.id, RequestState::HandlerExecuting)
            .unwrap();
        db.mark_request_state(request.id, RequestState::Error)
            .unwrap();
        assert!(db
            .mark_request_state(request.id, RequestState::HandlerExecuting)
            .is_err());
    }

    #[test]
    fn test_record_response() {
        let (db, app_id) = db_with_app();
        let request = match db
            .record_or_reject("event-1", app_id, "cipher", "multi_pay_invoice", 1_000)
            .unwrap()
        {
            RecordOutcome::Fresh(request) => request,
            RecordOutcome::Duplicate => unreachable!(),
        };

        db.record_response(
            request.id,
            Some("resp-1"),
            Some("a"),
            "cipher",
            ResponseState::Published,
            2_000,
        )
        .unwrap();
        db.record_response(
            request.id,
            None,
            Some("b"),
            "cipher",
            ResponseState::Failed,
            2_001,
        )
        .unwrap();

        assert_eq!(db.count_responses(request.id).unwrap(), 2);
    }

    #[test]
    fn test_set_request_method() {
        let (db, app_id) = db_with_app();
        let request = match db
            .record_or_reject("event-1", app_id, "cipher", "", 1_000)
            .unwrap()
        {
            RecordOutcome::Fresh(request) => request,
            RecordOutcome::Duplicate => unreachable!(),
        };

        db.set_request_method(request.id, "pay_invoice").unwrap();
        assert_eq!(db.get_request_event(request.id).unwrap().method, "pay_invoice");
    }
}
