use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use brokerdesk_core::domain::conversation::UserId;
use brokerdesk_core::domain::crm::{
    AppointmentRecord, ClientDetails, ClientRecord, ClientSearchResult, CreateAppointmentArgs,
    CreateClientArgs, CreateDealArgs, DealRecord, FinancialSummary, FinancialSummaryArgs,
    PolicyRecord, PolicySearchResult, SearchClientsArgs, SearchPoliciesArgs, UpdateDealArgs,
};

use super::{CrmStore, StoreError};
use crate::DbPool;

pub struct SqlCrmStore {
    pool: DbPool,
}

impl SqlCrmStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn load_deal(&self, user: &UserId, deal_id: &str) -> Result<DealRecord, StoreError> {
        self.find_deal(user, deal_id)
            .await?
            .ok_or_else(|| StoreError::NotFound { entity: "deal", id: deal_id.to_owned() })
    }

    async fn stage_name(&self, user: &UserId, stage_id: &str) -> Result<String, StoreError> {
        let row = sqlx::query("SELECT name FROM crm_stages WHERE id = ?1 AND user_id = ?2")
            .bind(stage_id)
            .bind(&user.0)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(row.get::<String, _>("name")),
            None => Err(StoreError::NotFound { entity: "stage", id: stage_id.to_owned() }),
        }
    }
}

fn decimal_column(row: &SqliteRow, column: &str) -> Result<Decimal, StoreError> {
    let raw = row.get::<String, _>(column);
    raw.parse::<Decimal>()
        .map_err(|error| StoreError::Decode(format!("column {column} = `{raw}`: {error}")))
}

fn client_from_row(row: &SqliteRow) -> Result<ClientRecord, StoreError> {
    Ok(ClientRecord {
        id: row.get::<String, _>("id"),
        name: row.get::<String, _>("name"),
        phone: row.get::<String, _>("phone"),
        email: row.get::<String, _>("email"),
        cpf_cnpj: row.get::<Option<String>, _>("cpf_cnpj"),
        status: row.get::<String, _>("status"),
        notes: row.get::<Option<String>, _>("notes"),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
    })
}

fn policy_from_row(row: &SqliteRow) -> Result<PolicyRecord, StoreError> {
    Ok(PolicyRecord {
        id: row.get::<String, _>("id"),
        client_id: row.get::<String, _>("client_id"),
        client_name: row.get::<Option<String>, _>("client_name"),
        policy_number: row.get::<String, _>("policy_number"),
        status: row.get::<String, _>("status"),
        premium: decimal_column(row, "premium")?,
        line_of_business: row.get::<String, _>("line_of_business"),
        insurer: row.get::<String, _>("insurer"),
        start_date: row.get::<NaiveDate, _>("start_date"),
        expiration_date: row.get::<NaiveDate, _>("expiration_date"),
    })
}

fn appointment_from_row(row: &SqliteRow) -> Result<AppointmentRecord, StoreError> {
    Ok(AppointmentRecord {
        id: row.get::<String, _>("id"),
        client_id: row.get::<Option<String>, _>("client_id"),
        title: row.get::<String, _>("title"),
        date: row.get::<NaiveDate, _>("date"),
        time: row.get::<String, _>("time"),
        status: row.get::<String, _>("status"),
        notes: row.get::<Option<String>, _>("notes"),
    })
}

fn deal_from_row(row: &SqliteRow) -> Result<DealRecord, StoreError> {
    Ok(DealRecord {
        id: row.get::<String, _>("id"),
        client_id: row.get::<Option<String>, _>("client_id"),
        stage_id: row.get::<String, _>("stage_id"),
        stage_name: row.get::<String, _>("stage_name"),
        title: row.get::<String, _>("title"),
        value: decimal_column(row, "value")?,
        position: row.get::<i64, _>("position"),
        expected_close_date: row.get::<Option<NaiveDate>, _>("expected_close_date"),
        notes: row.get::<Option<String>, _>("notes"),
    })
}

const DEAL_COLUMNS: &str = "d.id, d.client_id, d.stage_id, s.name AS stage_name, d.title, \
                            d.value, d.position, d.expected_close_date, d.notes";

#[async_trait]
impl CrmStore for SqlCrmStore {
    async fn search_clients(
        &self,
        user: &UserId,
        args: SearchClientsArgs,
    ) -> Result<ClientSearchResult, StoreError> {
        let pattern = args.query.as_ref().map(|query| format!("%{query}%"));

        const FILTER: &str = "WHERE user_id = ?1 \
             AND (?2 IS NULL OR name LIKE ?2 OR cpf_cnpj LIKE ?2 OR email LIKE ?2 OR phone LIKE ?2) \
             AND (?3 IS NULL OR status = ?3)";

        let total_count = sqlx::query(&format!("SELECT COUNT(*) AS count FROM clients {FILTER}"))
            .bind(&user.0)
            .bind(pattern.as_deref())
            .bind(args.status.as_deref())
            .fetch_one(&self.pool)
            .await?
            .get::<i64, _>("count");

        let rows = sqlx::query(&format!(
            "SELECT id, name, phone, email, cpf_cnpj, status, notes, created_at \
             FROM clients {FILTER} ORDER BY name LIMIT ?4",
        ))
        .bind(&user.0)
        .bind(pattern.as_deref())
        .bind(args.status.as_deref())
        .bind(i64::from(args.effective_limit()))
        .fetch_all(&self.pool)
        .await?;

        let clients = rows.iter().map(client_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(ClientSearchResult { total_count, clients })
    }

    async fn get_client_details(
        &self,
        user: &UserId,
        client_id: &str,
    ) -> Result<ClientDetails, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, phone, email, cpf_cnpj, status, notes, created_at \
             FROM clients WHERE id = ?1 AND user_id = ?2",
        )
        .bind(client_id)
        .bind(&user.0)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Err(StoreError::NotFound { entity: "client", id: client_id.to_owned() });
        };
        let client = client_from_row(&row)?;

        let rows = sqlx::query(
            "SELECT p.id, p.client_id, c.name AS client_name, p.policy_number, p.status, \
                    p.premium, p.line_of_business, p.insurer, p.start_date, p.expiration_date \
             FROM policies p JOIN clients c ON c.id = p.client_id \
             WHERE p.client_id = ?1 AND p.user_id = ?2 \
             ORDER BY p.expiration_date DESC",
        )
        .bind(client_id)
        .bind(&user.0)
        .fetch_all(&self.pool)
        .await?;

        let policies = rows.iter().map(policy_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(ClientDetails { client, policies })
    }

    async fn search_policies(
        &self,
        user: &UserId,
        args: SearchPoliciesArgs,
    ) -> Result<PolicySearchResult, StoreError> {
        let lob_pattern = args.line_of_business.as_ref().map(|lob| format!("%{lob}%"));

        const FILTER: &str = "WHERE p.user_id = ?1 \
             AND (?2 IS NULL OR p.client_id = ?2) \
             AND (?3 IS NULL OR p.status = ?3) \
             AND (?4 IS NULL OR p.line_of_business LIKE ?4)";

        let count_sql = format!("SELECT COUNT(*) AS count FROM policies p {FILTER}");
        let select_sql = format!(
            "SELECT p.id, p.client_id, c.name AS client_name, p.policy_number, p.status, \
                    p.premium, p.line_of_business, p.insurer, p.start_date, p.expiration_date \
             FROM policies p JOIN clients c ON c.id = p.client_id {FILTER} \
             ORDER BY p.expiration_date DESC LIMIT ?5",
        );

        let total_count = sqlx::query(&count_sql)
            .bind(&user.0)
            .bind(args.client_id.as_deref())
            .bind(args.status.as_deref())
            .bind(lob_pattern.as_deref())
            .fetch_one(&self.pool)
            .await?
            .get::<i64, _>("count");

        let rows = sqlx::query(&select_sql)
            .bind(&user.0)
            .bind(args.client_id.as_deref())
            .bind(args.status.as_deref())
            .bind(lob_pattern.as_deref())
            .bind(i64::from(args.effective_limit()))
            .fetch_all(&self.pool)
            .await?;

        let policies = rows.iter().map(policy_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(PolicySearchResult { total_count, policies })
    }

    async fn expiring_policies(
        &self,
        user: &UserId,
        days_ahead: u32,
    ) -> Result<PolicySearchResult, StoreError> {
        let today = Utc::now().date_naive();
        let horizon = today + Duration::days(i64::from(days_ahead));

        let rows = sqlx::query(
            "SELECT p.id, p.client_id, c.name AS client_name, p.policy_number, p.status, \
                    p.premium, p.line_of_business, p.insurer, p.start_date, p.expiration_date \
             FROM policies p JOIN clients c ON c.id = p.client_id \
             WHERE p.user_id = ?1 AND p.status = 'active' \
               AND p.expiration_date >= ?2 AND p.expiration_date <= ?3 \
             ORDER BY p.expiration_date",
        )
        .bind(&user.0)
        .bind(today)
        .bind(horizon)
        .fetch_all(&self.pool)
        .await?;

        let policies = rows.iter().map(policy_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(PolicySearchResult { total_count: policies.len() as i64, policies })
    }

    async fn financial_summary(
        &self,
        user: &UserId,
        args: FinancialSummaryArgs,
    ) -> Result<FinancialSummary, StoreError> {
        let today = Utc::now().date_naive();
        let period_start = args
            .start_date
            .unwrap_or_else(|| today.with_day(1).unwrap_or(today));
        let period_end = args.end_date.unwrap_or(today);

        let rows = sqlx::query(
            "SELECT kind, amount FROM financial_entries \
             WHERE user_id = ?1 AND is_void = 0 \
               AND entry_date >= ?2 AND entry_date <= ?3",
        )
        .bind(&user.0)
        .bind(period_start)
        .bind(period_end)
        .fetch_all(&self.pool)
        .await?;

        let mut total_income = Decimal::ZERO;
        let mut total_expenses = Decimal::ZERO;
        for row in &rows {
            let amount = decimal_column(row, "amount")?.abs();
            match row.get::<String, _>("kind").as_str() {
                "income" => total_income += amount,
                _ => total_expenses += amount,
            }
        }

        Ok(FinancialSummary {
            period_start,
            period_end,
            total_income,
            total_expenses,
            net_balance: total_income - total_expenses,
            entry_count: rows.len() as i64,
        })
    }

    async fn appointments_on(
        &self,
        user: &UserId,
        date: NaiveDate,
    ) -> Result<Vec<AppointmentRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, client_id, title, date, time, status, notes \
             FROM appointments WHERE user_id = ?1 AND date = ?2 ORDER BY time",
        )
        .bind(&user.0)
        .bind(date)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(appointment_from_row).collect()
    }

    async fn create_client(
        &self,
        user: &UserId,
        args: CreateClientArgs,
    ) -> Result<ClientRecord, StoreError> {
        args.validate().map_err(StoreError::Validation)?;
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            "INSERT INTO clients \
             (id, user_id, name, phone, email, cpf_cnpj, status, notes, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'active', ?7, ?8, ?8)",
        )
        .bind(&id)
        .bind(&user.0)
        .bind(args.name.trim())
        .bind(args.phone.trim())
        .bind(args.email.trim().to_ascii_lowercase())
        .bind(args.cpf_cnpj.as_deref().map(str::trim))
        .bind(args.notes.as_deref().map(str::trim))
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(ClientRecord {
            id,
            name: args.name.trim().to_owned(),
            phone: args.phone.trim().to_owned(),
            email: args.email.trim().to_ascii_lowercase(),
            cpf_cnpj: args.cpf_cnpj.map(|value| value.trim().to_owned()),
            status: "active".to_owned(),
            notes: args.notes.map(|value| value.trim().to_owned()),
            created_at: now,
        })
    }

    async fn create_appointment(
        &self,
        user: &UserId,
        args: CreateAppointmentArgs,
    ) -> Result<AppointmentRecord, StoreError> {
        args.validate().map_err(StoreError::Validation)?;

        if let Some(client_id) = &args.client_id {
            let exists = sqlx::query("SELECT id FROM clients WHERE id = ?1 AND user_id = ?2")
                .bind(client_id)
                .bind(&user.0)
                .fetch_optional(&self.pool)
                .await?;
            if exists.is_none() {
                return Err(StoreError::NotFound { entity: "client", id: client_id.clone() });
            }
        }

        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO appointments \
             (id, user_id, client_id, title, date, time, status, notes, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7, ?8)",
        )
        .bind(&id)
        .bind(&user.0)
        .bind(args.client_id.as_deref())
        .bind(args.title.trim())
        .bind(args.date)
        .bind(&args.time)
        .bind(args.notes.as_deref())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(AppointmentRecord {
            id,
            client_id: args.client_id,
            title: args.title.trim().to_owned(),
            date: args.date,
            time: args.time,
            status: "pending".to_owned(),
            notes: args.notes,
        })
    }

    async fn find_deal(
        &self,
        user: &UserId,
        deal_id: &str,
    ) -> Result<Option<DealRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {DEAL_COLUMNS} FROM crm_deals d JOIN crm_stages s ON s.id = d.stage_id \
             WHERE d.id = ?1 AND d.user_id = ?2",
        ))
        .bind(deal_id)
        .bind(&user.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(deal_from_row).transpose()
    }

    async fn create_deal(
        &self,
        user: &UserId,
        args: CreateDealArgs,
    ) -> Result<DealRecord, StoreError> {
        args.validate().map_err(StoreError::Validation)?;
        let stage_name = self.stage_name(user, &args.stage_id).await?;

        let next_position = sqlx::query(
            "SELECT COALESCE(MAX(position), 0) + 1 AS next FROM crm_deals WHERE stage_id = ?1",
        )
        .bind(&args.stage_id)
        .fetch_one(&self.pool)
        .await?
        .get::<i64, _>("next");

        let id = Uuid::new_v4().to_string();
        let value = args.value.unwrap_or(Decimal::ZERO);
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO crm_deals \
             (id, user_id, client_id, stage_id, title, value, position, expected_close_date, \
              notes, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
        )
        .bind(&id)
        .bind(&user.0)
        .bind(args.client_id.as_deref())
        .bind(&args.stage_id)
        .bind(args.title.trim())
        .bind(value.to_string())
        .bind(next_position)
        .bind(args.expected_close_date)
        .bind(args.notes.as_deref().map(str::trim))
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(DealRecord {
            id,
            client_id: args.client_id,
            stage_id: args.stage_id,
            stage_name,
            title: args.title.trim().to_owned(),
            value,
            position: next_position,
            expected_close_date: args.expected_close_date,
            notes: args.notes.map(|value| value.trim().to_owned()),
        })
    }

    async fn update_deal(
        &self,
        user: &UserId,
        args: UpdateDealArgs,
    ) -> Result<DealRecord, StoreError> {
        args.validate().map_err(StoreError::Validation)?;
        let mut deal = self.load_deal(user, &args.deal_id).await?;

        if let Some(title) = &args.title {
            deal.title = title.trim().to_owned();
        }
        if let Some(value) = args.value {
            deal.value = value;
        }
        if let Some(expected_close_date) = args.expected_close_date {
            deal.expected_close_date = Some(expected_close_date);
        }
        if let Some(notes) = &args.notes {
            deal.notes = Some(notes.trim().to_owned());
        }
        if let Some(client_id) = &args.client_id {
            deal.client_id = Some(client_id.clone());
        }

        sqlx::query(
            "UPDATE crm_deals SET title = ?1, value = ?2, expected_close_date = ?3, \
             notes = ?4, client_id = ?5, updated_at = ?6 WHERE id = ?7 AND user_id = ?8",
        )
        .bind(&deal.title)
        .bind(deal.value.to_string())
        .bind(deal.expected_close_date)
        .bind(deal.notes.as_deref())
        .bind(deal.client_id.as_deref())
        .bind(Utc::now())
        .bind(&deal.id)
        .bind(&user.0)
        .execute(&self.pool)
        .await?;

        Ok(deal)
    }

    async fn move_deal_to_stage(
        &self,
        user: &UserId,
        deal_id: &str,
        stage_id: &str,
    ) -> Result<DealRecord, StoreError> {
        let mut deal = self.load_deal(user, deal_id).await?;
        let stage_name = self.stage_name(user, stage_id).await?;

        sqlx::query(
            "UPDATE crm_deals SET stage_id = ?1, updated_at = ?2 WHERE id = ?3 AND user_id = ?4",
        )
        .bind(stage_id)
        .bind(Utc::now())
        .bind(deal_id)
        .bind(&user.0)
        .execute(&self.pool)
        .await?;

        deal.stage_id = stage_id.to_owned();
        deal.stage_name = stage_name;
        Ok(deal)
    }

    async fn delete_deal(&self, user: &UserId, deal_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM crm_deals WHERE id = ?1 AND user_id = ?2")
            .bind(deal_id)
            .bind(&user.0)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound { entity: "deal", id: deal_id.to_owned() });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;

    use brokerdesk_core::domain::conversation::UserId;
    use brokerdesk_core::domain::crm::{
        CreateClientArgs, CreateDealArgs, FinancialSummaryArgs, SearchClientsArgs,
    };

    use super::SqlCrmStore;
    use crate::repositories::{CrmStore, StoreError};
    use crate::{connect_with_settings, migrations, DbPool};

    const USER: &str = "user-1";

    async fn store() -> (SqlCrmStore, DbPool) {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrate");
        seed(&pool).await;
        (SqlCrmStore::new(pool.clone()), pool)
    }

    async fn seed(pool: &DbPool) {
        let now = Utc::now();
        let today = now.date_naive();

        sqlx::query(
            "INSERT INTO clients (id, user_id, name, phone, email, status, created_at, updated_at) \
             VALUES ('client-1', ?1, 'Marta Lima', '11988887777', 'marta@example.com', 'active', ?2, ?2), \
                    ('client-2', ?1, 'Pedro Souza', '11977776666', 'pedro@example.com', 'inactive', ?2, ?2)",
        )
        .bind(USER)
        .bind(now)
        .execute(pool)
        .await
        .expect("seed clients");

        sqlx::query(
            "INSERT INTO policies (id, user_id, client_id, policy_number, status, premium, \
             line_of_business, insurer, start_date, expiration_date, created_at) \
             VALUES ('policy-1', ?1, 'client-1', 'AP-001', 'active', '1200.50', 'auto', \
                     'Norte Seguros', ?2, ?3, ?4), \
                    ('policy-2', ?1, 'client-1', 'AP-002', 'active', '800.00', 'life', \
                     'Sul Seguros', ?2, ?5, ?4)",
        )
        .bind(USER)
        .bind(today - Duration::days(300))
        .bind(today + Duration::days(10))
        .bind(now)
        .bind(today + Duration::days(200))
        .execute(pool)
        .await
        .expect("seed policies");

        sqlx::query(
            "INSERT INTO crm_stages (id, user_id, name, position) \
             VALUES ('stage-new', ?1, 'New', 1), ('stage-won', ?1, 'Won', 2)",
        )
        .bind(USER)
        .execute(pool)
        .await
        .expect("seed stages");

        sqlx::query(
            "INSERT INTO financial_entries (id, user_id, description, entry_date, kind, amount, \
             is_void, created_at) \
             VALUES ('fin-1', ?1, 'commission', ?2, 'income', '500.00', 0, ?3), \
                    ('fin-2', ?1, 'office rent', ?2, 'expense', '150.25', 0, ?3), \
                    ('fin-3', ?1, 'voided entry', ?2, 'income', '999.99', 1, ?3)",
        )
        .bind(USER)
        .bind(Utc::now().date_naive())
        .bind(Utc::now())
        .execute(pool)
        .await
        .expect("seed financial entries");
    }

    fn user() -> UserId {
        UserId(USER.to_owned())
    }

    #[tokio::test]
    async fn client_search_filters_and_counts() {
        let (store, _pool) = store().await;

        let all = store.search_clients(&user(), SearchClientsArgs::default()).await.expect("all");
        assert_eq!(all.total_count, 2);

        let active = store
            .search_clients(
                &user(),
                SearchClientsArgs { status: Some("active".to_owned()), ..Default::default() },
            )
            .await
            .expect("active");
        assert_eq!(active.total_count, 1);
        assert_eq!(active.clients[0].name, "Marta Lima");

        let by_phone = store
            .search_clients(
                &user(),
                SearchClientsArgs { query: Some("7777".to_owned()), ..Default::default() },
            )
            .await
            .expect("by phone");
        assert_eq!(by_phone.total_count, 2);
    }

    #[tokio::test]
    async fn expiring_policies_respects_the_window() {
        let (store, _pool) = store().await;

        let soon = store.expiring_policies(&user(), 30).await.expect("window 30");
        assert_eq!(soon.policies.len(), 1);
        assert_eq!(soon.policies[0].policy_number, "AP-001");

        let wide = store.expiring_policies(&user(), 365).await.expect("window 365");
        assert_eq!(wide.policies.len(), 2);
    }

    #[tokio::test]
    async fn financial_summary_ignores_void_entries() {
        let (store, _pool) = store().await;

        let summary =
            store.financial_summary(&user(), FinancialSummaryArgs::default()).await.expect("sum");
        assert_eq!(summary.total_income, Decimal::new(50_000, 2));
        assert_eq!(summary.total_expenses, Decimal::new(15_025, 2));
        assert_eq!(summary.net_balance, Decimal::new(34_975, 2));
        assert_eq!(summary.entry_count, 2);
    }

    #[tokio::test]
    async fn deal_lifecycle_assigns_positions_and_moves_stages() {
        let (store, _pool) = store().await;

        let first = store
            .create_deal(
                &user(),
                CreateDealArgs {
                    stage_id: "stage-new".to_owned(),
                    title: "Acme renewal".to_owned(),
                    value: Some(Decimal::new(250_000, 2)),
                    ..Default::default()
                },
            )
            .await
            .expect("first deal");
        assert_eq!(first.position, 1);
        assert_eq!(first.stage_name, "New");

        let second = store
            .create_deal(
                &user(),
                CreateDealArgs {
                    stage_id: "stage-new".to_owned(),
                    title: "Globex fleet".to_owned(),
                    ..Default::default()
                },
            )
            .await
            .expect("second deal");
        assert_eq!(second.position, 2);

        let moved =
            store.move_deal_to_stage(&user(), &first.id, "stage-won").await.expect("move");
        assert_eq!(moved.stage_id, "stage-won");
        assert_eq!(moved.stage_name, "Won");

        store.delete_deal(&user(), &second.id).await.expect("delete");
        assert!(store.find_deal(&user(), &second.id).await.expect("find").is_none());
    }

    #[tokio::test]
    async fn unknown_stage_is_not_found() {
        let (store, _pool) = store().await;
        let result = store
            .create_deal(
                &user(),
                CreateDealArgs {
                    stage_id: "stage-missing".to_owned(),
                    title: "No stage".to_owned(),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(StoreError::NotFound { entity: "stage", .. })));
    }

    #[tokio::test]
    async fn invalid_client_payload_is_a_validation_error() {
        let (store, _pool) = store().await;
        let result = store
            .create_client(
                &user(),
                CreateClientArgs {
                    name: "X".to_owned(),
                    phone: "123".to_owned(),
                    email: "nope".to_owned(),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(StoreError::Validation(_))));
    }

    #[tokio::test]
    async fn tenant_isolation_hides_other_users_rows() {
        let (store, _pool) = store().await;
        let other = UserId("user-2".to_owned());

        let clients =
            store.search_clients(&other, SearchClientsArgs::default()).await.expect("search");
        assert_eq!(clients.total_count, 0);

        let deal = store.find_deal(&other, "deal-1").await.expect("find");
        assert!(deal.is_none());
    }
}
