//! App registry: delegated-access records and their permissions.

use super::{now_millis, Db, DbError, DbResult};
use rusqlite::{params, OptionalExtension, Row};
use std::fmt;

/// Budget window against which spent amounts are summed.
///
/// Ordered shortest-first; `None` sums over all time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BudgetRenewal {
    Daily,
    Weekly,
    Monthly,
    Yearly,
    None,
}

impl BudgetRenewal {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetRenewal::Daily => "daily",
            BudgetRenewal::Weekly => "weekly",
            BudgetRenewal::Monthly => "monthly",
            BudgetRenewal::Yearly => "yearly",
            BudgetRenewal::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<BudgetRenewal> {
        match s {
            "daily" => Some(BudgetRenewal::Daily),
            "weekly" => Some(BudgetRenewal::Weekly),
            "monthly" => Some(BudgetRenewal::Monthly),
            "yearly" => Some(BudgetRenewal::Yearly),
            "none" => Some(BudgetRenewal::None),
            _ => None,
        }
    }
}

impl fmt::Display for BudgetRenewal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit of delegated access: one connected application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct App {
    pub id: i64,
    pub name: String,
    /// The per-app nostr pubkey that signs this app's requests.
    pub nostr_pubkey: String,
    pub retired: bool,
    pub created_at: u64,
    pub updated_at: u64,
    pub last_used_at: Option<u64>,
}

/// A granted method scope with its budget and expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPermission {
    pub id: i64,
    pub app_id: i64,
    pub scope: String,
    /// 0 means unlimited.
    pub max_amount_msats: u64,
    pub budget_renewal: BudgetRenewal,
    pub expires_at: Option<u64>,
    pub created_at: u64,
}

/// Permission attributes supplied when creating or updating an app.
#[derive(Debug, Clone)]
pub struct PermissionSpec {
    pub scope: String,
    pub max_amount_msats: u64,
    pub budget_renewal: BudgetRenewal,
    pub expires_at: Option<u64>,
}

fn app_from_row(row: &Row<'_>) -> rusqlite::Result<App> {
    Ok(App {
        id: row.get(0)?,
        name: row.get(1)?,
        nostr_pubkey: row.get(2)?,
        retired: row.get::<_, i64>(3)? != 0,
        created_at: row.get::<_, i64>(4)? as u64,
        updated_at: row.get::<_, i64>(5)? as u64,
        last_used_at: row.get::<_, Option<i64>>(6)?.map(|v| v as u64),
    })
}

const APP_COLUMNS: &str = "id, name, nostr_pubkey, retired, created_at, updated_at, last_used_at";

impl Db {
    /// Register a new app with its permissions in one transaction.
    pub fn create_app(
        &self,
        name: &str,
        nostr_pubkey: &str,
        permissions: &[PermissionSpec],
    ) -> DbResult<App> {
        let now = now_millis();
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO apps (name, nostr_pubkey, created_at, updated_at) VALUES (?, ?, ?, ?)",
            params![name, nostr_pubkey, now as i64, now as i64],
        )?;
        let app_id = tx.last_insert_rowid();

        for spec in permissions {
            tx.execute(
                "INSERT INTO app_permissions
                     (app_id, scope, max_amount_msats, budget_renewal, expires_at, created_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
                params![
                    app_id,
                    spec.scope,
                    spec.max_amount_msats as i64,
                    spec.budget_renewal.as_str(),
                    spec.expires_at.map(|v| v as i64),
                    now as i64,
                ],
            )?;
        }
        tx.commit()?;

        Ok(App {
            id: app_id,
            name: name.to_string(),
            nostr_pubkey: nostr_pubkey.to_string(),
            retired: false,
            created_at: now,
            updated_at: now,
            last_used_at: None,
        })
    }

    /// Look up an active app by its sub-pubkey. Retired apps are invisible.
    pub fn find_app_by_pubkey(&self, nostr_pubkey: &str) -> DbResult<Option<App>> {
        let conn = self.conn();
        let app = conn
            .query_row(
                &format!(
                    "SELECT {} FROM apps WHERE nostr_pubkey = ? AND retired = 0",
                    APP_COLUMNS
                ),
                [nostr_pubkey],
                app_from_row,
            )
            .optional()?;
        Ok(app)
    }

    pub fn list_apps(&self) -> DbResult<Vec<App>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM apps WHERE retired = 0 ORDER BY created_at DESC",
            APP_COLUMNS
        ))?;
        let apps = stmt
            .query_map([], app_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(apps)
    }

    /// Rename an app and replace its permission set.
    pub fn update_app(
        &self,
        app_id: i64,
        name: &str,
        permissions: &[PermissionSpec],
    ) -> DbResult<()> {
        let now = now_millis();
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let updated = tx.execute(
            "UPDATE apps SET name = ?, updated_at = ? WHERE id = ? AND retired = 0",
            params![name, now as i64, app_id],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound(format!("app {}", app_id)));
        }

        tx.execute("DELETE FROM app_permissions WHERE app_id = ?", [app_id])?;
        for spec in permissions {
            tx.execute(
                "INSERT INTO app_permissions
                     (app_id, scope, max_amount_msats, budget_renewal, expires_at, created_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
                params![
                    app_id,
                    spec.scope,
                    spec.max_amount_msats as i64,
                    spec.budget_renewal.as_str(),
                    spec.expires_at.map(|v| v as i64),
                    now as i64,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Delete an app: cascade its permissions and retire the sub-pubkey so
    /// the subscription stops accepting events for it. Request and payment
    /// history stays.
    pub fn delete_app(&self, app_id: i64) -> DbResult<()> {
        let now = now_millis();
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM app_permissions WHERE app_id = ?", [app_id])?;
        let updated = tx.execute(
            "UPDATE apps SET retired = 1, updated_at = ? WHERE id = ?",
            params![now as i64, app_id],
        )?;
        if updated == 0 {
            return Err(DbError::NotFound(format!("app {}", app_id)));
        }
        tx.commit()?;
        Ok(())
    }

    pub fn touch_app_last_used(&self, app_id: i64) -> DbResult<()> {
        let now = now_millis();
        self.conn().execute(
            "UPDATE apps SET last_used_at = ? WHERE id = ?",
            params![now as i64, app_id],
        )?;
        Ok(())
    }

    pub fn app_permissions(&self, app_id: i64) -> DbResult<Vec<AppPermission>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, app_id, scope, max_amount_msats, budget_renewal, expires_at, created_at
             FROM app_permissions WHERE app_id = ?",
        )?;
        let permissions = stmt
            .query_map([app_id], |row| {
                Ok(AppPermission {
                    id: row.get(0)?,
                    app_id: row.get(1)?,
                    scope: row.get(2)?,
                    max_amount_msats: row.get::<_, i64>(3)? as u64,
                    budget_renewal: BudgetRenewal::parse(&row.get::<_, String>(4)?)
                        .unwrap_or(BudgetRenewal::None),
                    expires_at: row.get::<_, Option<i64>>(5)?.map(|v| v as u64),
                    created_at: row.get::<_, i64>(6)? as u64,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(permissions)
    }
}
