//! Recap repository implementation
//!
//! PostgreSQL-backed storage for recap records. Reads are a single-row
//! lookup by user id; the three list attributes live in JSONB columns and
//! are decoded here, each one as a whole or not at all.

use crate::pool::ManagedPool;
use async_trait::async_trait;
use recap_core::{
    models::{
        FavoriteStore, ProductFavorite, RecapInput, RecapKey, RecapRecord, UpsertMode,
        UpsertReport,
    },
    traits::RecapRepository,
    AppError, AppResult,
};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sqlx::postgres::PgExecutor;
use sqlx::types::Json;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};
use validator::Validate;

const SELECT_RECAP: &str = r#"
    SELECT
        user_id, user_name, trx_count, variant_count,
        total_point, total_point_description, total_point_possible_redeem,
        total_point_image, delivery_count, pickup_count,
        cheaper_subs_desc, cheaper_subs_amount, top_ranking,
        list_circular_images, list_product_favorite, list_favorite_store
    FROM user_recap_data
    WHERE user_id = $1
"#;

const UPSERT_RECAP: &str = r#"
    INSERT INTO user_recap_data (
        user_id, user_name, trx_count, variant_count,
        total_point, total_point_description, total_point_possible_redeem,
        total_point_image, delivery_count, pickup_count,
        cheaper_subs_desc, cheaper_subs_amount, top_ranking,
        list_circular_images, list_product_favorite, list_favorite_store
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
    ON CONFLICT (user_id) DO UPDATE SET
        user_name = EXCLUDED.user_name,
        trx_count = EXCLUDED.trx_count,
        variant_count = EXCLUDED.variant_count,
        total_point = EXCLUDED.total_point,
        total_point_description = EXCLUDED.total_point_description,
        total_point_possible_redeem = EXCLUDED.total_point_possible_redeem,
        total_point_image = EXCLUDED.total_point_image,
        delivery_count = EXCLUDED.delivery_count,
        pickup_count = EXCLUDED.pickup_count,
        cheaper_subs_desc = EXCLUDED.cheaper_subs_desc,
        cheaper_subs_amount = EXCLUDED.cheaper_subs_amount,
        top_ranking = EXCLUDED.top_ranking,
        list_circular_images = EXCLUDED.list_circular_images,
        list_product_favorite = EXCLUDED.list_product_favorite,
        list_favorite_store = EXCLUDED.list_favorite_store,
        updated_at = NOW()
"#;

/// PostgreSQL implementation of RecapRepository
pub struct PgRecapRepository {
    db: ManagedPool,
    query_timeout: Duration,
}

impl PgRecapRepository {
    /// Create a new recap repository
    ///
    /// `query_timeout` bounds every statement issued by this repository.
    pub fn new(db: ManagedPool, query_timeout: Duration) -> Self {
        Self { db, query_timeout }
    }

    /// Run one database call under the query timeout
    async fn timed<T, F>(&self, op: &'static str, fut: F) -> AppResult<T>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        match timeout(self.query_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                error!("Database error during {}: {}", op, e);
                Err(map_sqlx_error(op, e))
            }
            Err(_) => {
                warn!(
                    op,
                    timeout_ms = self.query_timeout.as_millis() as u64,
                    "Database call timed out"
                );
                Err(AppError::Timeout(format!(
                    "{} exceeded {}ms",
                    op,
                    self.query_timeout.as_millis()
                )))
            }
        }
    }

    async fn upsert_transactional(&self, records: &[RecapInput]) -> AppResult<UpsertReport> {
        let mut tx = self.db.pool().begin().await.map_err(|e| {
            error!("Failed to start transaction: {}", e);
            AppError::Transaction(format!("Failed to start transaction: {}", e))
        })?;

        for input in records {
            let result = match input.validate() {
                Ok(()) => self.timed("upsert recap", upsert_one(&mut *tx, input)).await,
                Err(e) => Err(AppError::Validation(format!("user {}: {}", input.user_id, e))),
            };

            if let Err(e) = result {
                warn!(
                    "Rolling back batch of {} at user {}: {}",
                    records.len(),
                    input.user_id,
                    e
                );
                if let Err(rollback) = tx.rollback().await {
                    error!("Failed to roll back transaction: {}", rollback);
                }
                return Err(match e {
                    AppError::Timeout(_) | AppError::Validation(_) => e,
                    other => AppError::Transaction(format!(
                        "Batch rolled back at user {}: {}",
                        input.user_id, other
                    )),
                });
            }
        }

        tx.commit().await.map_err(|e| {
            error!("Failed to commit transaction: {}", e);
            AppError::Transaction(format!("Failed to commit transaction: {}", e))
        })?;

        Ok(UpsertReport {
            inserted: records.len(),
            failed: 0,
        })
    }

    async fn upsert_per_row(&self, records: &[RecapInput]) -> UpsertReport {
        let mut report = UpsertReport::default();

        for input in records {
            if let Err(e) = input.validate() {
                warn!("Skipping invalid recap for user {}: {}", input.user_id, e);
                report.failed += 1;
                continue;
            }

            match self
                .timed("upsert recap", upsert_one(self.db.pool(), input))
                .await
            {
                Ok(()) => report.inserted += 1,
                Err(e) => {
                    warn!("Failed to upsert recap for user {}: {}", input.user_id, e);
                    report.failed += 1;
                }
            }
        }

        report
    }
}

#[async_trait]
impl RecapRepository for PgRecapRepository {
    #[instrument(skip(self))]
    async fn fetch(&self, key: RecapKey) -> AppResult<Option<RecapRecord>> {
        debug!("Fetching recap for user {}", key);

        let _admission = self.db.admit().await?;

        let row = self
            .timed(
                "fetch recap",
                sqlx::query_as::<sqlx::Postgres, RecapRow>(SELECT_RECAP)
                    .bind(key.value())
                    .fetch_optional(self.db.pool()),
            )
            .await?;

        Ok(row.map(RecapRow::into_record))
    }

    #[instrument(skip(self, records), fields(count = records.len()))]
    async fn upsert(&self, records: &[RecapInput], mode: UpsertMode) -> AppResult<UpsertReport> {
        debug!("Upserting {} recaps ({:?})", records.len(), mode);

        if records.is_empty() {
            return Ok(UpsertReport::default());
        }

        let _admission = self.db.admit().await?;

        let report = match mode {
            UpsertMode::Transactional => self.upsert_transactional(records).await?,
            UpsertMode::PerRow => self.upsert_per_row(records).await,
        };

        info!(
            inserted = report.inserted,
            failed = report.failed,
            "Recap upsert finished"
        );
        Ok(report)
    }

    async fn ping(&self) -> AppResult<()> {
        let _admission = self.db.admit().await?;
        self.timed("ping", sqlx::query("SELECT 1").execute(self.db.pool()))
            .await
            .map(|_| ())
    }
}

/// Insert-or-update one recap keyed by user id
async fn upsert_one<'e, E>(executor: E, input: &RecapInput) -> Result<(), sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query(UPSERT_RECAP)
        .bind(input.user_id)
        .bind(input.user_name.clone())
        .bind(input.trx_count)
        .bind(input.variant_count)
        .bind(input.total_point)
        .bind(input.total_point_description.clone())
        .bind(input.total_point_possible_redeem)
        .bind(input.total_point_image.clone())
        .bind(input.delivery_count)
        .bind(input.pickup_count)
        .bind(input.cheaper_subs_desc.clone())
        .bind(input.cheaper_subs_amount)
        .bind(input.top_ranking)
        .bind(input.list_circular_images.clone().map(Json))
        .bind(input.list_product_favorite.clone().map(Json))
        .bind(input.list_favorite_store.clone().map(Json))
        .execute(executor)
        .await
        .map(|_| ())
}

fn map_sqlx_error(op: &'static str, err: sqlx::Error) -> AppError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            AppError::Pool(format!("Failed to {}: {}", op, err))
        }
        other => AppError::Database(format!("Failed to {}: {}", op, other)),
    }
}

/// Decode a JSON list column, dropping it entirely if any element is bad
///
/// Accepts a JSON array or a JSON string holding an encoded array.
fn decode_list<T: DeserializeOwned>(
    user_id: i64,
    column: &'static str,
    raw: Option<Value>,
) -> Option<Vec<T>> {
    let value = match raw? {
        Value::Null => return None,
        Value::String(text) => match serde_json::from_str::<Value>(&text) {
            Ok(value) => value,
            Err(e) => {
                warn!(user_id, column, error = %e, "List column holds invalid JSON text, dropping it");
                return None;
            }
        },
        value => value,
    };

    match serde_json::from_value(value) {
        Ok(list) => Some(list),
        Err(e) => {
            warn!(user_id, column, error = %e, "List column does not match its schema, dropping it");
            None
        }
    }
}

/// Helper struct for mapping database rows
#[derive(Debug, sqlx::FromRow)]
struct RecapRow {
    user_id: i64,
    user_name: String,
    trx_count: i64,
    variant_count: Option<i32>,
    total_point: Option<i64>,
    total_point_description: Option<String>,
    total_point_possible_redeem: Option<i32>,
    total_point_image: Option<String>,
    delivery_count: Option<i32>,
    pickup_count: Option<i32>,
    cheaper_subs_desc: Option<String>,
    cheaper_subs_amount: Option<Decimal>,
    top_ranking: Option<i32>,
    list_circular_images: Option<Value>,
    list_product_favorite: Option<Value>,
    list_favorite_store: Option<Value>,
}

impl RecapRow {
    fn into_record(self) -> RecapRecord {
        let user_id = self.user_id;
        RecapRecord {
            user_id: RecapKey(user_id),
            user_name: self.user_name,
            trx_count: self.trx_count,
            variant_count: self.variant_count,
            total_point: self.total_point,
            total_point_description: self.total_point_description,
            total_point_possible_redeem: self.total_point_possible_redeem,
            total_point_image: self.total_point_image,
            delivery_count: self.delivery_count,
            pickup_count: self.pickup_count,
            cheaper_subs_desc: self.cheaper_subs_desc,
            cheaper_subs_amount: self.cheaper_subs_amount,
            top_ranking: self.top_ranking,
            list_product_favorite: decode_list::<ProductFavorite>(
                user_id,
                "list_product_favorite",
                self.list_product_favorite,
            ),
            list_favorite_store: decode_list::<FavoriteStore>(
                user_id,
                "list_favorite_store",
                self.list_favorite_store,
            ),
            list_circular_images: decode_list::<String>(
                user_id,
                "list_circular_images",
                self.list_circular_images,
            ),
        }
    }
}
