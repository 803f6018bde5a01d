//! Payment records: one row per attempted payment.
//!
//! Rows are created *before* the backend call so that a crash mid-payment is
//! attributable; the preimage is set only when the backend reports success.

use super::{Db, DbError, DbResult};
use rusqlite::{params, OptionalExtension, Row};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payment {
    pub id: i64,
    pub app_id: i64,
    pub request_event_id: i64,
    /// BOLT-11 string; empty for keysend payments.
    pub payment_request: String,
    pub amount_msats: u64,
    /// Set iff the backend reported success.
    pub preimage: Option<String>,
    pub created_at: u64,
}

fn payment_from_row(row: &Row<'_>) -> rusqlite::Result<Payment> {
    Ok(Payment {
        id: row.get(0)?,
        app_id: row.get(1)?,
        request_event_id: row.get(2)?,
        payment_request: row.get(3)?,
        amount_msats: row.get::<_, i64>(4)? as u64,
        preimage: row.get(5)?,
        created_at: row.get::<_, i64>(6)? as u64,
    })
}

const PAYMENT_COLUMNS: &str =
    "id, app_id, request_event_id, payment_request, amount_msats, preimage, created_at";

impl Db {
    pub fn create_payment(
        &self,
        app_id: i64,
        request_event_id: i64,
        payment_request: &str,
        amount_msats: u64,
        created_at: u64,
    ) -> DbResult<Payment> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO payments (app_id, request_event_id, payment_request, amount_msats, created_at)
             VALUES (?, ?, ?, ?, ?)",
            params![
                app_id,
                request_event_id,
                payment_request,
                amount_msats as i64,
                created_at as i64,
            ],
        )?;
        Ok(Payment {
            id: conn.last_insert_rowid(),
            app_id,
            request_event_id,
            payment_request: payment_request.to_string(),
            amount_msats,
            preimage: None,
            created_at,
        })
    }

    pub fn set_payment_preimage(&self, payment_id: i64, preimage: &str) -> DbResult<()> {
        let updated = self.conn().execute(
            "UPDATE payments SET preimage = ? WHERE id = ?",
            params![preimage, payment_id],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound(format!("payment {}", payment_id)));
        }
        Ok(())
    }

    /// Sum of successful payment amounts for an app created at or after the
    /// given time. Feeds the budget check.
    pub fn sum_settled_msats_since(&self, app_id: i64, since_millis: u64) -> DbResult<u64> {
        let sum: i64 = self.conn().query_row(
            "SELECT COALESCE(SUM(amount_msats), 0) FROM payments
             WHERE app_id = ? AND preimage IS NOT NULL AND created_at >= ?",
            params![app_id, since_millis as i64],
            |row| row.get(0),
        )?;
        Ok(sum as u64)
    }

    pub fn get_payment(&self, payment_id: i64) -> DbResult<Payment> {
        self.conn()
            .query_row(
                &format!("SELECT {} FROM payments WHERE id = ?", PAYMENT_COLUMNS),
                [payment_id],
                payment_from_row,
            )
            .optional()?
            .ok_or_else(|| DbError::NotFound(format!("payment {}", payment_id)))
    }

    pub fn list_payments(&self, limit: u32) -> DbResult<Vec<Payment>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM payments ORDER BY created_at DESC LIMIT ?",
            PAYMENT_COLUMNS
        ))?;
        let payments = stmt
            .query_map([limit], payment_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(payments)
    }

    pub fn payments_for_request(&self, request_event_id: i64) -> DbResult<Vec<Payment>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM payments WHERE request_event_id = ? ORDER BY id",
            PAYMENT_COLUMNS
        ))?;
        let payments = stmt
            .query_map([request_event_id], payment_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(payments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::RecordOutcome;

    fn db_with_request() -> (Db, i64, i64) {
        let db = Db::open_in_memory().unwrap();
        let app = db.create_app("app", &"ab".repeat(32), &[]).unwrap();
        let request = match db
            .record_or_reject("event-1", app.id, "cipher", "pay_invoice", 1_000)
            .unwrap()
        {
            RecordOutcome::Fresh(request) => request,
            RecordOutcome::Duplicate => unreachable!(),
        };
        (db, app.id, request.id)
    }

    #[test]
    fn test_create_and_settle() {
        let (db, app_id, request_id) = db_with_request();
        let payment = db
            .create_payment(app_id, request_id, "lnbc10n1...", 1_000, 5_000)
            .unwrap();
        assert!(payment.preimage.is_none());

        db.set_payment_preimage(payment.id, &"ab".repeat(32)).unwrap();
        let settled = db.get_payment(payment.id).unwrap();
        assert_eq!(settled.preimage.as_deref(), Some("ab".repeat(32).as_str()));
    }

    #[test]
    fn test_budget_sum_counts_only_settled_in_window() {
        let (db, app_id, request_id) = db_with_request();

        // Settled inside the window
        let p1 = db
            .create_payment(app_id, request_id, "lnbc1...", 1_000, 10_000)
            .unwrap();
        db.set_payment_preimage(p1.id, "aa").unwrap();

        // Settled before the window
        let p2 = db
            .create_payment(app_id, request_id, "lnbc2...", 2_000, 4_000)
            .unwrap();
        db.set_payment_preimage(p2.id, "bb").unwrap();

        // Unsettled inside the window
        db.create_payment(app_id, request_id, "lnbc3...", 4_000, 11_000)
            .unwrap();

        assert_eq!(db.sum_settled_msats_since(app_id, 5_000).unwrap(), 1_000);
        assert_eq!(db.sum_settled_msats_since(app_id, 0).unwrap(), 3_000);
    }

    #[test]
    fn test_set_preimage_missing_payment() {
        let (db, _, _) = db_with_request();
        assert!(matches!(
            db.set_payment_preimage(99, "aa"),
            Err(DbError::NotFound(_))
        ));
    }

    #[test]
    fn test_payments_for_request() {
        let (db, app_id, request_id) = db_with_request();
        db.create_payment(app_id, request_id, "lnbc1...", 1_000, 1_000)
            .unwrap();
        db.create_payment(app_id, request_id, "lnbc2...", 2_000, 1_001)
            .unwrap();
        assert_eq!(db.payments_for_request(request_id).unwrap().len(), 2);
    }
}
