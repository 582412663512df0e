//! Deterministic demo fixtures for smoke runs and end-to-end checks.
//!
//! Fixed ids so repeated seeding is idempotent and assertions can name
//! rows directly.

use chrono::{Duration, Utc};
use sqlx::Row;

use crate::repositories::RepositoryError;
use crate::DbPool;

pub const SEED_USER_ID: &str = "seed-user";

const SEED_CLIENTS: &[(&str, &str, &str, &str, &str)] = &[
    ("seed-client-acme", "Helena Martins", "11988001122", "helena@acme.example", "active"),
    ("seed-client-globex", "Rafael Costa", "21977003344", "rafael@globex.example", "active"),
    ("seed-client-initech", "Beatriz Nunes", "31966005566", "beatriz@initech.example", "inactive"),
];

const SEED_STAGES: &[(&str, &str, i64)] = &[
    ("seed-stage-prospect", "Prospecting", 1),
    ("seed-stage-proposal", "Proposal", 2),
    ("seed-stage-won", "Won", 3),
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeedResult {
    pub clients: usize,
    pub policies: usize,
    pub stages: usize,
    pub deals: usize,
    pub appointments: usize,
    pub financial_entries: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerificationResult {
    pub passed: bool,
    pub issues: Vec<String>,
}

pub struct SeedDataset;

impl SeedDataset {
    pub async fn apply(pool: &DbPool) -> Result<SeedResult, RepositoryError> {
        let now = Utc::now();
        let today = now.date_naive();

        for (id, name, phone, email, status) in SEED_CLIENTS {
            sqlx::query(
                "INSERT OR IGNORE INTO clients \
                 (id, user_id, name, phone, email, status, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            )
            .bind(id)
            .bind(SEED_USER_ID)
            .bind(name)
            .bind(phone)
            .bind(email)
            .bind(status)
            .bind(now)
            .execute(pool)
            .await?;
        }

        let policies = [
            ("seed-policy-auto", "seed-client-acme", "AP-2026-001", "auto", "Norte Seguros", "1450.00", 20i64),
            ("seed-policy-life", "seed-client-acme", "VD-2026-014", "life", "Sul Seguros", "620.00", 160i64),
            ("seed-policy-home", "seed-client-globex", "RE-2026-112", "home", "Norte Seguros", "380.50", 45i64),
        ];
        for (id, client_id, number, lob, insurer, premium, days_to_expiry) in policies {
            sqlx::query(
                "INSERT OR IGNORE INTO policies \
                 (id, user_id, client_id, policy_number, status, premium, line_of_business, \
                  insurer, start_date, expiration_date, created_at) \
                 VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?6, ?7, ?8, ?9, ?10)",
            )
            .bind(id)
            .bind(SEED_USER_ID)
            .bind(client_id)
            .bind(number)
            .bind(premium)
            .bind(lob)
            .bind(insurer)
            .bind(today - Duration::days(320))
            .bind(today + Duration::days(days_to_expiry))
            .bind(now)
            .execute(pool)
            .await?;
        }

        for (id, name, position) in SEED_STAGES {
            sqlx::query(
                "INSERT OR IGNORE INTO crm_stages (id, user_id, name, position) \
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(id)
            .bind(SEED_USER_ID)
            .bind(name)
            .bind(position)
            .execute(pool)
            .await?;
        }

        let deals = [
            ("seed-deal-fleet", "seed-client-globex", "seed-stage-prospect", "Globex fleet renewal", "25000.00", 1i64),
            ("seed-deal-group-life", "seed-client-acme", "seed-stage-proposal", "Acme group life", "8400.00", 1i64),
        ];
        for (id, client_id, stage_id, title, value, position) in deals {
            sqlx::query(
                "INSERT OR IGNORE INTO crm_deals \
                 (id, user_id, client_id, stage_id, title, value, position, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            )
            .bind(id)
            .bind(SEED_USER_ID)
            .bind(client_id)
            .bind(stage_id)
            .bind(title)
            .bind(value)
            .bind(position)
            .bind(now)
            .execute(pool)
            .await?;
        }

        sqlx::query(
            "INSERT OR IGNORE INTO appointments \
             (id, user_id, client_id, title, date, time, status, created_at) \
             VALUES ('seed-appointment-review', ?1, 'seed-client-acme', \
                     'Annual coverage review', ?2, '10:00', 'pending', ?3)",
        )
        .bind(SEED_USER_ID)
        .bind(today + Duration::days(2))
        .bind(now)
        .execute(pool)
        .await?;

        let entries = [
            ("seed-fin-commission", "Commission payout", "income", "5200.00"),
            ("seed-fin-rent", "Office rent", "expense", "1800.00"),
            ("seed-fin-licenses", "Broker licenses", "expense", "240.00"),
        ];
        for (id, description, kind, amount) in entries {
            sqlx::query(
                "INSERT OR IGNORE INTO financial_entries \
                 (id, user_id, description, entry_date, kind, amount, is_void, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
            )
            .bind(id)
            .bind(SEED_USER_ID)
            .bind(description)
            .bind(today)
            .bind(kind)
            .bind(amount)
            .bind(now)
            .execute(pool)
            .await?;
        }

        Ok(SeedResult {
            clients: SEED_CLIENTS.len(),
            policies: 3,
            stages: SEED_STAGES.len(),
            deals: 2,
            appointments: 1,
            financial_entries: 3,
        })
    }

    pub async fn verify(pool: &DbPool) -> Result<VerificationResult, RepositoryError> {
        let mut issues = Vec::new();

        let checks: &[(&str, &str, i64)] = &[
            ("clients", "SELECT COUNT(*) AS count FROM clients WHERE user_id = ?1", 3),
            ("policies", "SELECT COUNT(*) AS count FROM policies WHERE user_id = ?1", 3),
            ("stages", "SELECT COUNT(*) AS count FROM crm_stages WHERE user_id = ?1", 3),
            ("deals", "SELECT COUNT(*) AS count FROM crm_deals WHERE user_id = ?1", 2),
            ("appointments", "SELECT COUNT(*) AS count FROM appointments WHERE user_id = ?1", 1),
            (
                "financial_entries",
                "SELECT COUNT(*) AS count FROM financial_entries WHERE user_id = ?1",
                3,
            ),
        ];

        for (name, sql, expected) in checks {
            let count =
                sqlx::query(sql).bind(SEED_USER_ID).fetch_one(pool).await?.get::<i64, _>("count");
            if count != *expected {
                issues.push(format!("{name}: expected {expected} seeded rows, found {count}"));
            }
        }

        Ok(VerificationResult { passed: issues.is_empty(), issues })
    }
}
