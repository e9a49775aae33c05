//! Postgres-backed `MatchStore`.

use crate::models::{
    derive_group_name, Match, MatchRow, MatchStats, MatchStatus, MatchTarget, NewMatch,
    NewVendorAlias, Receipt, Transaction, TransactionGroup, VendorAlias, VendorOverrides,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::store::{
    group_not_found, match_not_found, receipt_not_found, transaction_not_found, GroupRelease,
    MatchStore,
};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const MATCH_COLUMNS: &str = "id, receipt_id, transaction_id, transaction_group_id, status, \
    amount_score, date_score, vendor_score, match_reason, is_manual, vendor_display_name, \
    default_gl_code, default_department, version, created_utc, resolved_utc";

const RECEIPT_COLUMNS: &str = "id, vendor, receipt_date, amount, currency, match_id, created_utc";

const TRANSACTION_COLUMNS: &str =
    "id, transaction_date, post_date, amount, description, group_id, created_utc";

const GROUP_SELECT: &str = r#"
    SELECT g.id, g.name, g.combined_amount, g.display_date, g.display_date_override,
           ARRAY(SELECT t.id FROM transactions t WHERE t.group_id = g.id ORDER BY t.id) AS member_transaction_ids,
           g.match_warning, g.created_utc
    FROM transaction_groups g
"#;

const ACTIVE: &str = "status IN ('proposed', 'confirmed')";

/// SQLSTATEs worth retrying: serialization_failure, deadlock_detected.
const RETRYABLE_SQLSTATES: &[&str] = &["40001", "40P01"];

/// Split sqlx failures into transient (retried) and permanent database errors.
fn storage_error(context: &str, e: sqlx::Error) -> AppError {
    let transient = match &e {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Tls(_) => true,
        sqlx::Error::Database(db_err) => db_err
            .code()
            .is_some_and(|code| RETRYABLE_SQLSTATES.iter().any(|state| code == *state)),
        _ => false,
    };

    let err = anyhow::anyhow!("{}: {}", context, e);
    if transient {
        AppError::StorageUnavailable(err)
    } else {
        AppError::DatabaseError(err)
    }
}

fn db_err(context: &'static str) -> impl FnOnce(sqlx::Error) -> AppError {
    move |e| storage_error(context, e)
}

/// Unique-index violations mean another writer claimed the receipt or target first.
fn conflict_or_db_err(context: &'static str) -> impl FnOnce(sqlx::Error) -> AppError {
    move |e| match e {
        sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
            AppError::Conflict(anyhow::anyhow!("{}: an active match already exists", context))
        }
        _ => storage_error(context, e),
    }
}

#[derive(FromRow)]
struct AliasUpsertRow {
    #[sqlx(flatten)]
    alias: VendorAlias,
    inserted: bool,
}

#[derive(FromRow)]
struct StatsRow {
    proposed: i64,
    confirmed: i64,
    rejected: i64,
    average_confidence: Option<f64>,
}

/// Postgres connection pool wrapper.
#[derive(Clone)]
pub struct PgMatchStore {
    pool: PgPool,
}

impl PgMatchStore {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "matching-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn begin(&self) -> Result<sqlx::Transaction<'static, sqlx::Postgres>, AppError> {
        self.pool.begin().await.map_err(db_err("Failed to begin transaction"))
    }
}

// ----------------------------------------------------------------------------
// Connection-level helpers shared by pool reads and transactional writes
// ----------------------------------------------------------------------------

async fn fetch_group(
    conn: &mut PgConnection,
    group_id: Uuid,
) -> Result<Option<TransactionGroup>, AppError> {
    sqlx::query_as::<_, TransactionGroup>(&format!("{} WHERE g.id = $1", GROUP_SELECT))
        .bind(group_id)
        .fetch_optional(conn)
        .await
        .map_err(db_err("Failed to get transaction group"))
}

async fn lock_group(conn: &mut PgConnection, group_id: Uuid) -> Result<(), AppError> {
    sqlx::query_scalar::<_, Uuid>("SELECT id FROM transaction_groups WHERE id = $1 FOR UPDATE")
        .bind(group_id)
        .fetch_optional(conn)
        .await
        .map_err(db_err("Failed to lock transaction group"))?
        .map(|_| ())
        .ok_or_else(|| group_not_found(group_id))
}

async fn fetch_members(
    conn: &mut PgConnection,
    group_id: Uuid,
) -> Result<Vec<Transaction>, AppError> {
    sqlx::query_as::<_, Transaction>(&format!(
        "SELECT {} FROM transactions WHERE group_id = $1 ORDER BY id",
        TRANSACTION_COLUMNS
    ))
    .bind(group_id)
    .fetch_all(conn)
    .await
    .map_err(db_err("Failed to get group members"))
}

async fn lock_match(conn: &mut PgConnection, match_id: Uuid) -> Result<Match, AppError> {
    let row = sqlx::query_as::<_, MatchRow>(&format!(
        "SELECT {} FROM matches WHERE id = $1 FOR UPDATE",
        MATCH_COLUMNS
    ))
    .bind(match_id)
    .fetch_optional(conn)
    .await
    .map_err(db_err("Failed to lock match"))?
    .ok_or_else(|| match_not_found(match_id))?;
    Match::try_from(row)
}

async fn active_match_for_target(
    conn: &mut PgConnection,
    target: MatchTarget,
) -> Result<Option<Match>, AppError> {
    let row = sqlx::query_as::<_, MatchRow>(&format!(
        "SELECT {} FROM matches WHERE {} AND ((transaction_id = $1) OR (transaction_group_id = $2))",
        MATCH_COLUMNS, ACTIVE
    ))
    .bind(target.transaction_id())
    .bind(target.group_id())
    .fetch_optional(conn)
    .await
    .map_err(db_err("Failed to find active match"))?;
    row.map(Match::try_from).transpose()
}

async fn write_match_state(conn: &mut PgConnection, m: &Match) -> Result<(), AppError> {
    sqlx::query(
        r#"
        UPDATE matches
        SET status = $2, vendor_display_name = $3, default_gl_code = $4,
            default_department = $5, version = $6, resolved_utc = $7
        WHERE id = $1
        "#,
    )
    .bind(m.id)
    .bind(m.status().as_str())
    .bind(&m.overrides.vendor_display_name)
    .bind(&m.overrides.default_gl_code)
    .bind(&m.overrides.default_department)
    .bind(m.version)
    .bind(m.resolved_utc)
    .execute(conn)
    .await
    .map_err(conflict_or_db_err("Failed to update match"))?;
    Ok(())
}

async fn release_receipt(
    conn: &mut PgConnection,
    receipt_id: Uuid,
    match_id: Uuid,
) -> Result<(), AppError> {
    sqlx::query("UPDATE receipts SET match_id = NULL WHERE id = $1 AND match_id = $2")
        .bind(receipt_id)
        .bind(match_id)
        .execute(conn)
        .await
        .map_err(db_err("Failed to release receipt"))?;
    Ok(())
}

async fn write_group_totals(
    conn: &mut PgConnection,
    group: &TransactionGroup,
) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE transaction_groups SET combined_amount = $2, display_date = $3 WHERE id = $1",
    )
    .bind(group.id)
    .bind(group.combined_amount)
    .bind(group.display_date)
    .execute(conn)
    .await
    .map_err(db_err("Failed to update transaction group"))?;
    Ok(())
}

/// Lock the transactions and fail unless every one exists, is ungrouped and unmatched.
async fn lock_groupable(
    conn: &mut PgConnection,
    transaction_ids: &[Uuid],
) -> Result<Vec<Transaction>, AppError> {
    let rows = sqlx::query_as::<_, Transaction>(&format!(
        "SELECT {} FROM transactions WHERE id = ANY($1) ORDER BY id FOR UPDATE",
        TRANSACTION_COLUMNS
    ))
    .bind(transaction_ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(db_err("Failed to lock transactions"))?;

    if let Some(missing) = transaction_ids
        .iter()
        .find(|id| !rows.iter().any(|t| t.id == **id))
    {
        return Err(transaction_not_found(*missing));
    }
    if let Some(t) = rows.iter().find(|t| t.group_id.is_some()) {
        return Err(AppError::Conflict(anyhow::anyhow!(
            "Transaction {} already belongs to a group",
            t.id
        )));
    }

    let matched = sqlx::query_scalar::<_, Uuid>(&format!(
        "SELECT transaction_id FROM matches WHERE {} AND transaction_id = ANY($1) LIMIT 1",
        ACTIVE
    ))
    .bind(transaction_ids)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err("Failed to check active matches"))?;
    if let Some(id) = matched {
        return Err(AppError::Conflict(anyhow::anyhow!(
            "Transaction {} has an active match",
            id
        )));
    }

    Ok(rows)
}

#[async_trait]
impl MatchStore for PgMatchStore {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| storage_error("Health check failed", e))?;

        timer.observe_duration();
        Ok(())
    }

    // =========================================================================
    // Candidate Source
    // =========================================================================

    #[instrument(skip(self, receipt), fields(receipt_id = %receipt.id))]
    async fn insert_receipt(&self, receipt: Receipt) -> Result<Receipt, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_receipt"])
            .start_timer();

        let inserted = sqlx::query_as::<_, Receipt>(&format!(
            r#"
            INSERT INTO receipts (id, vendor, receipt_date, amount, currency, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {}
            "#,
            RECEIPT_COLUMNS
        ))
        .bind(receipt.id)
        .bind(&receipt.vendor)
        .bind(receipt.receipt_date)
        .bind(receipt.amount)
        .bind(&receipt.currency)
        .bind(receipt.created_utc)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(anyhow::anyhow!("Receipt {} already exists", receipt.id))
            }
            _ => storage_error("Failed to insert receipt", e),
        })?;

        timer.observe_duration();
        Ok(inserted)
    }

    #[instrument(skip(self, transaction), fields(transaction_id = %transaction.id))]
    async fn insert_transaction(&self, transaction: Transaction) -> Result<Transaction, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_transaction"])
            .start_timer();

        let inserted = sqlx::query_as::<_, Transaction>(&format!(
            r#"
            INSERT INTO transactions (id, transaction_date, post_date, amount, description, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {}
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(transaction.id)
        .bind(transaction.transaction_date)
        .bind(transaction.post_date)
        .bind(transaction.amount)
        .bind(&transaction.description)
        .bind(transaction.created_utc)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(anyhow::anyhow!(
                    "Transaction {} already exists",
                    transaction.id
                ))
            }
            _ => storage_error("Failed to insert transaction", e),
        })?;

        timer.observe_duration();
        Ok(inserted)
    }

    #[instrument(skip(self))]
    async fn get_receipt(&self, receipt_id: Uuid) -> Result<Option<Receipt>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_receipt"])
            .start_timer();

        let receipt = sqlx::query_as::<_, Receipt>(&format!(
            "SELECT {} FROM receipts WHERE id = $1",
            RECEIPT_COLUMNS
        ))
        .bind(receipt_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("Failed to get receipt"))?;

        timer.observe_duration();
        Ok(receipt)
    }

    #[instrument(skip(self, receipt_ids), fields(count = receipt_ids.len()))]
    async fn get_receipts(&self, receipt_ids: &[Uuid]) -> Result<Vec<Receipt>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_receipts"])
            .start_timer();

        let rows = sqlx::query_as::<_, Receipt>(&format!(
            "SELECT {} FROM receipts WHERE id = ANY($1)",
            RECEIPT_COLUMNS
        ))
        .bind(receipt_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("Failed to get receipts"))?;

        timer.observe_duration();

        let mut by_id: HashMap<Uuid, Receipt> = rows.into_iter().map(|r| (r.id, r)).collect();
        Ok(receipt_ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    #[instrument(skip(self))]
    async fn list_unmatched_receipts(&self) -> Result<Vec<Receipt>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_unmatched_receipts"])
            .start_timer();

        let receipts = sqlx::query_as::<_, Receipt>(&format!(
            r#"
            SELECT {} FROM receipts r
            WHERE NOT EXISTS (
                SELECT 1 FROM matches m WHERE m.receipt_id = r.id AND m.{}
            )
            ORDER BY r.created_utc, r.id
            "#,
            RECEIPT_COLUMNS, ACTIVE
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("Failed to list unmatched receipts"))?;

        timer.observe_duration();
        Ok(receipts)
    }

    #[instrument(skip(self))]
    async fn get_transaction(&self, transaction_id: Uuid) -> Result<Option<Transaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_transaction"])
            .start_timer();

        let tx = sqlx::query_as::<_, Transaction>(&format!(
            "SELECT {} FROM transactions WHERE id = $1",
            TRANSACTION_COLUMNS
        ))
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("Failed to get transaction"))?;

        timer.observe_duration();
        Ok(tx)
    }

    #[instrument(skip(self))]
    async fn list_candidate_transactions(&self) -> Result<Vec<Transaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_candidate_transactions"])
            .start_timer();

        let txs = sqlx::query_as::<_, Transaction>(&format!(
            r#"
            SELECT {} FROM transactions t
            WHERE t.group_id IS NULL
              AND NOT EXISTS (
                SELECT 1 FROM matches m WHERE m.transaction_id = t.id AND m.{}
              )
            ORDER BY t.id
            "#,
            TRANSACTION_COLUMNS, ACTIVE
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("Failed to list candidate transactions"))?;

        timer.observe_duration();
        Ok(txs)
    }

    #[instrument(skip(self))]
    async fn get_group(&self, group_id: Uuid) -> Result<Option<TransactionGroup>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_group"])
            .start_timer();

        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(db_err("Failed to acquire connection"))?;
        let group = fetch_group(&mut conn, group_id).await?;

        timer.observe_duration();
        Ok(group)
    }

    #[instrument(skip(self))]
    async fn list_candidate_groups(&self) -> Result<Vec<TransactionGroup>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_candidate_groups"])
            .start_timer();

        let groups = sqlx::query_as::<_, TransactionGroup>(&format!(
            r#"
            {}
            WHERE NOT EXISTS (
                SELECT 1 FROM matches m WHERE m.transaction_group_id = g.id AND m.{}
            )
            ORDER BY g.id
            "#,
            GROUP_SELECT, ACTIVE
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("Failed to list candidate groups"))?;

        timer.observe_duration();
        Ok(groups)
    }

    // =========================================================================
    // Matches
    // =========================================================================

    #[instrument(skip(self))]
    async fn get_match(&self, match_id: Uuid) -> Result<Option<Match>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_match"])
            .start_timer();

        let row = sqlx::query_as::<_, MatchRow>(&format!(
            "SELECT {} FROM matches WHERE id = $1",
            MATCH_COLUMNS
        ))
        .bind(match_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("Failed to get match"))?;

        timer.observe_duration();
        row.map(Match::try_from).transpose()
    }

    #[instrument(skip(self), fields(target = %target))]
    async fn find_active_match_for_target(
        &self,
        target: MatchTarget,
    ) -> Result<Option<Match>, AppError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(db_err("Failed to acquire connection"))?;
        active_match_for_target(&mut conn, target).await
    }

    #[instrument(skip(self))]
    async fn list_matches(
        &self,
        status: MatchStatus,
        page: u32,
        page_size: u32,
    ) -> Result<(Vec<Match>, i64), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_matches"])
            .start_timer();

        let limit = page_size as i64;
        let offset = (page.saturating_sub(1) as i64) * limit;

        let rows = sqlx::query_as::<_, MatchRow>(&format!(
            r#"
            SELECT {} FROM matches
            WHERE status = $1
            ORDER BY created_utc DESC, id
            LIMIT $2 OFFSET $3
            "#,
            MATCH_COLUMNS
        ))
        .bind(status.as_str())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("Failed to list matches"))?;

        let total = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM matches WHERE status = $1")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("Failed to count matches"))?;

        timer.observe_duration();

        let matches = rows
            .into_iter()
            .map(Match::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((matches, total))
    }

    #[instrument(skip(self))]
    async fn list_proposed_ids(&self, min_confidence: i32) -> Result<Vec<Uuid>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_proposed_ids"])
            .start_timer();

        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT id FROM matches
            WHERE status = 'proposed' AND confidence_score >= $1
            ORDER BY confidence_score DESC, id
            "#,
        )
        .bind(min_confidence)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("Failed to list proposed matches"))?;

        timer.observe_duration();
        Ok(ids)
    }

    #[instrument(skip(self))]
    async fn match_stats(&self) -> Result<MatchStats, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["match_stats"])
            .start_timer();

        let row = sqlx::query_as::<_, StatsRow>(&format!(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'proposed') AS proposed,
                COUNT(*) FILTER (WHERE status = 'confirmed') AS confirmed,
                COUNT(*) FILTER (WHERE status = 'rejected') AS rejected,
                (AVG(confidence_score) FILTER (WHERE {}))::float8 AS average_confidence
            FROM matches
            "#,
            ACTIVE
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("Failed to compute match stats"))?;

        let unmatched_receipts = sqlx::query_scalar::<_, i64>(&format!(
            r#"
            SELECT COUNT(*) FROM receipts r
            WHERE NOT EXISTS (SELECT 1 FROM matches m WHERE m.receipt_id = r.id AND m.{})
            "#,
            ACTIVE
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("Failed to count unmatched receipts"))?;

        let unmatched_transactions = sqlx::query_scalar::<_, i64>(&format!(
            r#"
            SELECT COUNT(*) FROM transactions t
            WHERE t.group_id IS NULL
              AND NOT EXISTS (SELECT 1 FROM matches m WHERE m.transaction_id = t.id AND m.{})
            "#,
            ACTIVE
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("Failed to count unmatched transactions"))?;

        timer.observe_duration();

        Ok(MatchStats {
            proposed: row.proposed,
            confirmed: row.confirmed,
            rejected: row.rejected,
            unmatched_receipts,
            unmatched_transactions,
            average_confidence: row.average_confidence,
        })
    }

    #[instrument(skip(self, new), fields(receipt_id = %new.receipt_id, target = %new.target))]
    async fn insert_match(&self, new: NewMatch) -> Result<Match, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_match"])
            .start_timer();

        let mut tx = self.begin().await?;

        sqlx::query_scalar::<_, Uuid>("SELECT id FROM receipts WHERE id = $1 FOR UPDATE")
            .bind(new.receipt_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err("Failed to lock receipt"))?
            .ok_or_else(|| receipt_not_found(new.receipt_id))?;

        match new.target {
            MatchTarget::Transaction(id) => {
                let group_id = sqlx::query_scalar::<_, Option<Uuid>>(
                    "SELECT group_id FROM transactions WHERE id = $1 FOR UPDATE",
                )
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err("Failed to lock transaction"))?
                .ok_or_else(|| transaction_not_found(id))?;
                if let Some(group_id) = group_id {
                    return Err(AppError::Conflict(anyhow::anyhow!(
                        "Transaction {} belongs to group {}; match the group instead",
                        id,
                        group_id
                    )));
                }
            }
            MatchTarget::Group(id) => lock_group(&mut tx, id).await?,
        }

        let receipt_active = sqlx::query_scalar::<_, Uuid>(&format!(
            "SELECT id FROM matches WHERE receipt_id = $1 AND {}",
            ACTIVE
        ))
        .bind(new.receipt_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err("Failed to check receipt matches"))?;
        if let Some(existing) = receipt_active {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Receipt {} already has active match {}",
                new.receipt_id,
                existing
            )));
        }
        if let Some(existing) = active_match_for_target(&mut tx, new.target).await? {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "{} already has active match {}",
                new.target,
                existing.id
            )));
        }

        let m = Match::create(new, Utc::now());
        sqlx::query(
            r#"
            INSERT INTO matches (id, receipt_id, transaction_id, transaction_group_id, status,
                amount_score, date_score, vendor_score, confidence_score, match_reason, is_manual,
                vendor_display_name, default_gl_code, default_department, version, created_utc, resolved_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(m.id)
        .bind(m.receipt_id)
        .bind(m.target.transaction_id())
        .bind(m.target.group_id())
        .bind(m.status().as_str())
        .bind(m.scores.amount_score)
        .bind(m.scores.date_score)
        .bind(m.scores.vendor_score)
        .bind(m.confidence_score())
        .bind(&m.match_reason)
        .bind(m.is_manual)
        .bind(&m.overrides.vendor_display_name)
        .bind(&m.overrides.default_gl_code)
        .bind(&m.overrides.default_department)
        .bind(m.version)
        .bind(m.created_utc)
        .bind(m.resolved_utc)
        .execute(&mut *tx)
        .await
        .map_err(conflict_or_db_err("Failed to insert match"))?;

        sqlx::query("UPDATE receipts SET match_id = $2 WHERE id = $1")
            .bind(m.receipt_id)
            .bind(m.id)
            .execute(&mut *tx)
            .await
            .map_err(db_err("Failed to link receipt"))?;

        tx.commit().await.map_err(conflict_or_db_err("Failed to commit match"))?;

        timer.observe_duration();
        info!(match_id = %m.id, status = %m.status(), "Match created");

        Ok(m)
    }

    #[instrument(skip(self, overrides))]
    async fn resolve_match(
        &self,
        match_id: Uuid,
        next: MatchStatus,
        overrides: Option<VendorOverrides>,
        expected_version: Option<i32>,
    ) -> Result<Match, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["resolve_match"])
            .start_timer();

        let mut tx = self.begin().await?;
        let mut m = lock_match(&mut tx, match_id).await?;

        m.check_version(expected_version)?;
        m.transition(next, Utc::now())?;
        if let Some(o) = overrides {
            m.overrides = m.overrides.merged_with(&o);
        }

        write_match_state(&mut tx, &m).await?;
        if next == MatchStatus::Rejected {
            release_receipt(&mut tx, m.receipt_id, m.id).await?;
        }

        tx.commit().await.map_err(db_err("Failed to commit transaction"))?;

        timer.observe_duration();
        Ok(m)
    }

    #[instrument(skip(self, overrides))]
    async fn update_match_overrides(
        &self,
        match_id: Uuid,
        expected_version: i32,
        overrides: VendorOverrides,
    ) -> Result<Match, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_match_overrides"])
            .start_timer();

        let mut tx = self.begin().await?;
        let mut m = lock_match(&mut tx, match_id).await?;
        if !m.is_active() {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Match {} is {} and can no longer be edited",
                match_id,
                m.status()
            )));
        }
        m.check_version(Some(expected_version))?;
        m.apply_overrides(&overrides);

        write_match_state(&mut tx, &m).await?;
        tx.commit().await.map_err(db_err("Failed to commit transaction"))?;

        timer.observe_duration();
        Ok(m)
    }

    #[instrument(skip(self))]
    async fn delete_match(&self, match_id: Uuid) -> Result<Match, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_match"])
            .start_timer();

        let mut tx = self.begin().await?;
        let m = lock_match(&mut tx, match_id).await?;
        if m.status() != MatchStatus::Confirmed {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Only confirmed matches can be unmatched; match {} is {}",
                match_id,
                m.status()
            )));
        }

        sqlx::query("DELETE FROM matches WHERE id = $1")
            .bind(match_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err("Failed to delete match"))?;
        release_receipt(&mut tx, m.receipt_id, m.id).await?;

        tx.commit().await.map_err(db_err("Failed to commit transaction"))?;

        timer.observe_duration();
        info!(match_id = %match_id, "Match removed");
        Ok(m)
    }

    // =========================================================================
    // Vendor Aliases
    // =========================================================================

    #[instrument(skip(self))]
    async fn list_vendor_aliases(&self) -> Result<Vec<VendorAlias>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_vendor_aliases"])
            .start_timer();

        let aliases = sqlx::query_as::<_, VendorAlias>(
            r#"
            SELECT id, canonical_name, match_pattern, default_gl_code, default_department,
                   usage_count, created_utc, updated_utc
            FROM vendor_aliases
            ORDER BY match_pattern
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("Failed to list vendor aliases"))?;

        timer.observe_duration();
        Ok(aliases)
    }

    #[instrument(skip(self, alias), fields(pattern = %alias.match_pattern))]
    async fn upsert_vendor_alias(
        &self,
        alias: NewVendorAlias,
    ) -> Result<(VendorAlias, bool), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["upsert_vendor_alias"])
            .start_timer();

        let row = sqlx::query_as::<_, AliasUpsertRow>(
            r#"
            INSERT INTO vendor_aliases (id, canonical_name, match_pattern, default_gl_code, default_department, usage_count)
            VALUES ($1, $2, $3, $4, $5, 1)
            ON CONFLICT (match_pattern) DO UPDATE SET
                usage_count = vendor_aliases.usage_count + 1,
                canonical_name = EXCLUDED.canonical_name,
                default_gl_code = COALESCE(EXCLUDED.default_gl_code, vendor_aliases.default_gl_code),
                default_department = COALESCE(EXCLUDED.default_department, vendor_aliases.default_department),
                updated_utc = NOW()
            RETURNING id, canonical_name, match_pattern, default_gl_code, default_department,
                      usage_count, created_utc, updated_utc, (xmax = 0) AS inserted
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&alias.canonical_name)
        .bind(&alias.match_pattern)
        .bind(&alias.default_gl_code)
        .bind(&alias.default_department)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("Failed to upsert vendor alias"))?;

        timer.observe_duration();
        Ok((row.alias, row.inserted))
    }

    // =========================================================================
    // Transaction Groups
    // =========================================================================

    #[instrument(skip(self, transaction_ids), fields(members = transaction_ids.len()))]
    async fn create_group(
        &self,
        transaction_ids: &[Uuid],
        name: Option<String>,
        display_date_override: Option<NaiveDate>,
    ) -> Result<TransactionGroup, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_group"])
            .start_timer();

        let mut tx = self.begin().await?;
        let members = lock_groupable(&mut tx, transaction_ids).await?;

        let mut group = TransactionGroup {
            id: Uuid::new_v4(),
            name: name.unwrap_or_else(|| derive_group_name(&members)),
            combined_amount: Default::default(),
            display_date: Utc::now().date_naive(),
            display_date_override,
            member_transaction_ids: vec![],
            match_warning: None,
            created_utc: Utc::now(),
        };
        group.recompute(&members);

        sqlx::query(
            r#"
            INSERT INTO transaction_groups (id, name, combined_amount, display_date, display_date_override, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(group.id)
        .bind(&group.name)
        .bind(group.combined_amount)
        .bind(group.display_date)
        .bind(group.display_date_override)
        .bind(group.created_utc)
        .execute(&mut *tx)
        .await
        .map_err(db_err("Failed to create transaction group"))?;

        sqlx::query("UPDATE transactions SET group_id = $1 WHERE id = ANY($2)")
            .bind(group.id)
            .bind(transaction_ids)
            .execute(&mut *tx)
            .await
            .map_err(db_err("Failed to attach group members"))?;

        tx.commit().await.map_err(db_err("Failed to commit transaction"))?;

        timer.observe_duration();
        info!(group_id = %group.id, "Transaction group created");
        Ok(group)
    }

    #[instrument(skip(self))]
    async fn add_group_member(
        &self,
        group_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<TransactionGroup, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["add_group_member"])
            .start_timer();

        let mut tx = self.begin().await?;
        lock_group(&mut tx, group_id).await?;
        lock_groupable(&mut tx, &[transaction_id]).await?;

        sqlx::query("UPDATE transactions SET group_id = $1 WHERE id = $2")
            .bind(group_id)
            .bind(transaction_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err("Failed to attach group member"))?;

        let members = fetch_members(&mut tx, group_id).await?;
        let mut group = fetch_group(&mut tx, group_id)
            .await?
            .ok_or_else(|| group_not_found(group_id))?;
        group.recompute(&members);
        write_group_totals(&mut tx, &group).await?;

        tx.commit().await.map_err(db_err("Failed to commit transaction"))?;

        timer.observe_duration();
        Ok(group)
    }

    #[instrument(skip(self))]
    async fn remove_group_member(
        &self,
        group_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<TransactionGroup, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["remove_group_member"])
            .start_timer();

        let mut tx = self.begin().await?;
        lock_group(&mut tx, group_id).await?;

        let members = fetch_members(&mut tx, group_id).await?;
        if !members.iter().any(|t| t.id == transaction_id) {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Transaction {} is not a member of group {}",
                transaction_id,
                group_id
            )));
        }
        if members.len() <= 2 {
            return Err(AppError::invalid_field(
                "transactionId",
                "min_members",
                "A group needs at least two transactions; delete the group instead",
            ));
        }

        sqlx::query("UPDATE transactions SET group_id = NULL WHERE id = $1")
            .bind(transaction_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err("Failed to detach group member"))?;

        let remaining: Vec<Transaction> = members
            .into_iter()
            .filter(|t| t.id != transaction_id)
            .collect();
        let mut group = fetch_group(&mut tx, group_id)
            .await?
            .ok_or_else(|| group_not_found(group_id))?;
        group.recompute(&remaining);
        write_group_totals(&mut tx, &group).await?;

        tx.commit().await.map_err(db_err("Failed to commit transaction"))?;

        timer.observe_duration();
        Ok(group)
    }

    #[instrument(skip(self, warning))]
    async fn set_group_warning(
        &self,
        group_id: Uuid,
        warning: Option<String>,
    ) -> Result<(), AppError> {
        let result = sqlx::query("UPDATE transaction_groups SET match_warning = $2 WHERE id = $1")
            .bind(group_id)
            .bind(warning)
            .execute(&self.pool)
            .await
            .map_err(db_err("Failed to update group warning"))?;

        if result.rows_affected() == 0 {
            return Err(group_not_found(group_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_group(&self, group_id: Uuid) -> Result<GroupRelease, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_group"])
            .start_timer();

        let mut tx = self.begin().await?;
        lock_group(&mut tx, group_id).await?;
        let group = fetch_group(&mut tx, group_id)
            .await?
            .ok_or_else(|| group_not_found(group_id))?;

        let released_match = active_match_for_target(&mut tx, MatchTarget::Group(group_id)).await?;
        if let Some(m) = &released_match {
            release_receipt(&mut tx, m.receipt_id, m.id).await?;
        }

        // Matches cascade; members fall back to group_id NULL.
        sqlx::query("DELETE FROM transaction_groups WHERE id = $1")
            .bind(group_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err("Failed to delete transaction group"))?;

        tx.commit().await.map_err(db_err("Failed to commit transaction"))?;

        timer.observe_duration();
        info!(
            group_id = %group_id,
            released_match = ?released_match.as_ref().map(|m| m.id),
            "Transaction group deleted"
        );

        Ok(GroupRelease {
            group,
            released_match,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_failures_are_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        assert!(storage_error("get_match", sqlx::Error::Io(io)).is_transient());
        assert!(storage_error("get_match", sqlx::Error::PoolTimedOut).is_transient());
    }

    #[test]
    fn test_decode_and_protocol_failures_are_permanent() {
        let decode = storage_error("get_match", sqlx::Error::Decode("bad numeric".into()));
        assert!(matches!(decode, AppError::DatabaseError(_)));
        assert!(!decode.is_transient());

        let protocol = storage_error("get_match", sqlx::Error::Protocol("unexpected".into()));
        assert!(!protocol.is_transient());
        assert!(!storage_error("get_match", sqlx::Error::RowNotFound).is_transient());
    }
}
