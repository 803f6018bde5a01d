//! Authorization: method scope, expiry and rolling budget enforcement.

use crate::db::{App, AppPermission, BudgetRenewal, Db, DbResult};
use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, Utc};
use nostr::{ErrorCode, Method};

/// A denied request, carrying the NIP-47 error to reply with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    pub code: ErrorCode,
    pub message: String,
}

/// The scope string a method is authorized under.
///
/// The payment family shares the `pay_invoice` scope (and therefore its
/// budget); every other method is its own scope.
pub fn scope_for_method(method: Method) -> &'static str {
    match method {
        Method::PayInvoice
        | Method::MultiPayInvoice
        | Method::PayKeysend
        | Method::MultiPayKeysend => "pay_invoice",
        other => other.as_str(),
    }
}

/// Evaluate (method, amount, now) against an app's permissions and rolling
/// spend. Returns `None` when the request is allowed.
///
/// Overlapping permissions combine as: most permissive expiry wins; budgets
/// sum within the same window type; across mixed window types the shortest
/// window is enforced.
pub fn check_permission(
    db: &Db,
    app: &App,
    method: Method,
    amount_msats: Option<u64>,
    now_millis: u64,
) -> DbResult<Option<Denial>> {
    let permissions = db.app_permissions(app.id)?;
    let scope = scope_for_method(method);
    let matching: Vec<&AppPermission> =
        permissions.iter().filter(|p| p.scope == scope).collect();

    if matching.is_empty() {
        return Ok(Some(Denial {
            code: ErrorCode::Restricted,
            message: format!("This app does not have permission to request {}", method),
        }));
    }

    let active: Vec<&AppPermission> = matching
        .iter()
        .copied()
        .filter(|p| p.expires_at.map(|exp| exp > now_millis).unwrap_or(true))
        .collect();
    if active.is_empty() {
        return Ok(Some(Denial {
            code: ErrorCode::Expired,
            message: "This app has expired".to_string(),
        }));
    }

    if method.is_monetary() {
        if let Some(amount) = amount_msats {
            let budgeted: Vec<&AppPermission> = active
                .iter()
                .copied()
                .filter(|p| p.max_amount_msats > 0)
                .collect();

            if !budgeted.is_empty() {
                let window = budgeted
                    .iter()
                    .map(|p| p.budget_renewal)
                    .min()
                    .unwrap_or(BudgetRenewal::None);
                let budget: u64 = budgeted
                    .iter()
                    .filter(|p| p.budget_renewal == window)
                    .map(|p| p.max_amount_msats)
                    .sum();

                let spent =
                    db.sum_settled_msats_since(app.id, budget_window_start(window, now_millis))?;
                if spent.saturating_add(amount) > budget {
                    return Ok(Some(Denial {
                        code: ErrorCode::QuotaExceeded,
                        message: "Insufficient budget remaining to make payment".to_string(),
                    }));
                }
            }
        }
    }

    Ok(None)
}

/// Start of the current UTC calendar window, in milliseconds.
pub fn budget_window_start(renewal: BudgetRenewal, now_millis: u64) -> u64 {
    if renewal == BudgetRenewal::None {
        return 0;
    }
    let Some(now) = DateTime::<Utc>::from_timestamp_millis(now_millis as i64) else {
        return 0;
    };
    let date = now.date_naive();
    let start = match renewal {
        BudgetRenewal::Daily => date,
        BudgetRenewal::Weekly => {
            date - Days::new(u64::from(date.weekday().num_days_from_monday()))
        }
        BudgetRenewal::Monthly => date.with_day(1).unwrap_or(date),
        BudgetRenewal::Yearly => NaiveDate::from_ymd_opt(date.year(), 1, 1).unwrap_or(date),
        BudgetRenewal::None => date,
    };
    start
        .and_time(NaiveTime::MIN)
        .and_utc()
        .timestamp_millis()
        .max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{PermissionSpec, RecordOutcome};

    fn millis(y: i32, m: u32, d: u32, h: u32, min: u32) -> u64 {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
            .and_utc()
            .timestamp_millis() as u64
    }

    fn pay_spec(max_amount_msats: u64, renewal: BudgetRenewal, expires_at: Option<u64>) -> PermissionSpec {
        PermissionSpec {
            scope: "pay_invoice".to_string(),
            max_amount_msats,
            budget_renewal: renewal,
            expires_at,
        }
    }

    fn settle(db: &Db, app_id: i64, request_id: i64, amount: u64, at: u64) {
        let payment = db
            .create_payment(app_id, request_id, "lnbc...", amount, at)
            .unwrap();
        db.set_payment_preimage(payment.id, "aa").unwrap();
    }

    fn setup(specs: &[PermissionSpec]) -> (Db, App, i64) {
        let db = Db::open_in_memory().unwrap();
        let app = db.create_app("app", &"ab".repeat(32), specs).unwrap();
        let request_id = match db
            .record_or_reject("seed", app.id, "cipher", "pay_invoice", 0)
            .unwrap()
        {
            RecordOutcome::Fresh(request) => request.id,
            RecordOutcome::Duplicate => unreachable!(),
        };
        (db, app, request_id)
    }

    #[test]
    fn test_window_starts() {
        // Wednesday 2023-11-15, 12:30 UTC
        let now = millis(2023, 11, 15, 12, 30);
        assert_eq!(
            budget_window_start(BudgetRenewal::Daily, now),
            millis(2023, 11, 15, 0, 0)
        );
        assert_eq!(
            budget_window_start(BudgetRenewal::Weekly, now),
            millis(2023, 11, 13, 0, 0)
        );
        assert_eq!(
            budget_window_start(BudgetRenewal::Monthly, now),
            millis(2023, 11, 1, 0, 0)
        );
        assert_eq!(
            budget_window_start(BudgetRenewal::Yearly, now),
            millis(2023, 1, 1, 0, 0)
        );
        assert_eq!(budget_window_start(BudgetRenewal::None, now), 0);
    }

    #[test]
    fn test_no_scope_is_restricted() {
        let (db, app, _) = setup(&[PermissionSpec {
            scope: "get_balance".to_string(),
            max_amount_msats: 0,
            budget_renewal: BudgetRenewal::None,
            expires_at: None,
        }]);

        let denial = check_permission(&db, &app, Method::PayInvoice, Some(1_000), 1_000)
            .unwrap()
            .unwrap();
        assert_eq!(denial.code, ErrorCode::Restricted);

        // The granted scope itself passes
        assert!(check_permission(&db, &app, Method::GetBalance, None, 1_000)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_payment_family_shares_pay_invoice_scope() {
        let (db, app, _) = setup(&[pay_spec(0, BudgetRenewal::None, None)]);
        for method in [
            Method::PayInvoice,
            Method::MultiPayInvoice,
            Method::PayKeysend,
            Method::MultiPayKeysend,
        ] {
            assert!(check_permission(&db, &app, method, Some(1_000), 1_000)
                .unwrap()
                .is_none());
        }
    }

    #[test]
    fn test_expiry_boundary() {
        let now = millis(2023, 11, 15, 12, 30);
        let (db, app, _) = setup(&[pay_spec(0, BudgetRenewal::None, Some(now))]);

        // Expiry at exactly now denies
        let denial = check_permission(&db, &app, Method::PayInvoice, Some(1_000), now)
            .unwrap()
            .unwrap();
        assert_eq!(denial.code, ErrorCode::Expired);

        // One millisecond earlier it is still live
        assert!(
            check_permission(&db, &app, Method::PayInvoice, Some(1_000), now - 1)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_most_permissive_expiry_wins() {
        let now = millis(2023, 11, 15, 12, 30);
        let (db, app, _) = setup(&[
            pay_spec(0, BudgetRenewal::None, Some(now - 1)),
            pay_spec(0, BudgetRenewal::None, None),
        ]);
        assert!(check_permission(&db, &app, Method::PayInvoice, Some(1_000), now)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_budget_boundary() {
        let now = millis(2023, 11, 15, 12, 30);
        let (db, app, request_id) = setup(&[pay_spec(100_000, BudgetRenewal::Daily, None)]);
        settle(&db, app.id, request_id, 99_000, now - 1_000);

        // spent + amount == max is allowed
        assert!(check_permission(&db, &app, Method::PayInvoice, Some(1_000), now)
            .unwrap()
            .is_none());

        // one msat over denies
        let denial = check_permission(&db, &app, Method::PayInvoice, Some(1_001), now)
            .unwrap()
            .unwrap();
        assert_eq!(denial.code, ErrorCode::QuotaExceeded);
    }

    #[test]
    fn test_budget_window_resets() {
        let now = millis(2023, 11, 15, 12, 30);
        let yesterday = millis(2023, 11, 14, 23, 59);
        let (db, app, request_id) = setup(&[pay_spec(100_000, BudgetRenewal::Daily, None)]);

        // Yesterday's spend does not count against today's daily window
        settle(&db, app.id, request_id, 100_000, yesterday);
        assert!(
            check_permission(&db, &app, Method::PayInvoice, Some(50_000), now)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_budgets_sum_within_same_window() {
        let now = millis(2023, 11, 15, 12, 30);
        let (db, app, request_id) = setup(&[
            pay_spec(50_000, BudgetRenewal::Daily, None),
            pay_spec(50_000, BudgetRenewal::Daily, None),
        ]);
        settle(&db, app.id, request_id, 90_000, now - 1_000);

        assert!(check_permission(&db, &app, Method::PayInvoice, Some(10_000), now)
            .unwrap()
            .is_none());
        assert!(check_permission(&db, &app, Method::PayInvoice, Some(10_001), now)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_mixed_windows_shortest_wins() {
        let now = millis(2023, 11, 15, 12, 30);
        let (db, app, request_id) = setup(&[
            pay_spec(10_000, BudgetRenewal::Daily, None),
            pay_spec(1_000_000, BudgetRenewal::Monthly, None),
        ]);
        settle(&db, app.id, request_id, 9_000, now - 1_000);

        // The daily budget (10k) governs, not the monthly million
        let denial = check_permission(&db, &app, Method::PayInvoice, Some(2_000), now)
            .unwrap()
            .unwrap();
        assert_eq!(denial.code, ErrorCode::QuotaExceeded);
    }

    #[test]
    fn test_zero_max_amount_is_unlimited() {
        let now = millis(2023, 11, 15, 12, 30);
        let (db, app, request_id) = setup(&[pay_spec(0, BudgetRenewal::Daily, None)]);
        settle(&db, app.id, request_id, u64::MAX / 2, now - 1_000);

        assert!(
            check_permission(&db, &app, Method::PayInvoice, Some(1_000_000), now)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_non_monetary_methods_skip_budget() {
        let now = millis(2023, 11, 15, 12, 30);
        let (db, app, _) = setup(&[PermissionSpec {
            scope: "get_info".to_string(),
            max_amount_msats: 1,
            budget_renewal: BudgetRenewal::Daily,
            expires_at: None,
        }]);
        assert!(check_permission(&db, &app, Method::GetInfo, None, now)
            .unwrap()
            .is_none());
    }
}
