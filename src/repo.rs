//! Repository contracts (spec.md §4.9, §4.11, §6): time-range and
//! idempotency queries over entities, events, and the two stats tables.
//! Kept as traits so the aggregator and persister depend on a seam, not a
//! concrete store, matching the teacher's preference for `sqlx`-direct code
//! behind a narrow interface rather than a generic ORM.

use crate::entity::Entity;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

#[derive(Clone, Debug, PartialEq)]
pub struct EventRow {
    pub timestamp: DateTime<Utc>,
    pub entity_id: String,
    pub value: Option<f64>,
    pub attributes: Option<JsonValue>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ShortTermStat {
    pub window_start: DateTime<Utc>,
    pub entity_id: String,
    pub mean: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub last: Option<f64>,
    pub sum: Option<f64>,
    pub count: i64,
    pub attributes: Option<JsonValue>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LongTermStat {
    pub window_start: DateTime<Utc>,
    pub entity_id: String,
    pub mean: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub last: Option<f64>,
    pub sum: Option<f64>,
    pub count: i64,
    pub state: Option<f64>,
    pub attributes: Option<JsonValue>,
}

#[async_trait]
pub trait EntityRepo: Send + Sync {
    async fn upsert(&self, entity: &Entity) -> anyhow::Result<()>;
    async fn get(&self, entity_id: &str) -> anyhow::Result<Option<Entity>>;
    async fn all(&self) -> anyhow::Result<Vec<Entity>>;
}

#[async_trait]
pub trait EventRepo: Send + Sync {
    async fn save(&self, row: EventRow) -> anyhow::Result<()>;
    async fn in_window_for_stats(
        &self,
        entity_id: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<EventRow>>;
}

#[async_trait]
pub trait ShortTermStatRepo: Send + Sync {
    async fn exists(&self, window_start: DateTime<Utc>, entity_id: &str) -> anyhow::Result<bool>;
    async fn save(&self, row: ShortTermStat) -> anyhow::Result<()>;
    async fn latest(&self, entity_id: &str) -> anyhow::Result<Option<ShortTermStat>>;
    async fn in_range(
        &self,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> anyhow::Result<Vec<ShortTermStat>>;
}

#[async_trait]
pub trait LongTermStatRepo: Send + Sync {
    async fn exists(&self, window_start: DateTime<Utc>, entity_id: &str) -> anyhow::Result<bool>;
    async fn save(&self, row: LongTermStat) -> anyhow::Result<()>;
}

pub mod postgres {
    use super::*;
    use sqlx::{PgPool, Row};

    pub struct PostgresEntityRepo {
        pool: PgPool,
    }

    impl PostgresEntityRepo {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }
    }

    #[async_trait]
    impl EntityRepo for PostgresEntityRepo {
        async fn upsert(&self, entity: &Entity) -> anyhow::Result<()> {
            sqlx::query(
                "INSERT INTO entities (entity_id, friendly_name, source, unit, device_class, state_class, aggregation_method, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, now()) \
                 ON CONFLICT (entity_id) DO UPDATE SET \
                 friendly_name = EXCLUDED.friendly_name, source = EXCLUDED.source, unit = EXCLUDED.unit, \
                 device_class = EXCLUDED.device_class, state_class = EXCLUDED.state_class, \
                 aggregation_method = EXCLUDED.aggregation_method",
            )
            .bind(&entity.entity_id)
            .bind(&entity.friendly_name)
            .bind(&entity.source)
            .bind(&entity.unit)
            .bind(&entity.device_class)
            .bind(&entity.state_class)
            .bind(entity.aggregation_method.as_str())
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn get(&self, entity_id: &str) -> anyhow::Result<Option<Entity>> {
            let row = sqlx::query(
                "SELECT entity_id, friendly_name, source, unit, device_class, state_class, aggregation_method \
                 FROM entities WHERE entity_id = $1",
            )
            .bind(entity_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row.map(row_to_entity))
        }

        async fn all(&self) -> anyhow::Result<Vec<Entity>> {
            let rows = sqlx::query(
                "SELECT entity_id, friendly_name, source, unit, device_class, state_class, aggregation_method \
                 FROM entities",
            )
            .fetch_all(&self.pool)
            .await?;
            Ok(rows.into_iter().map(row_to_entity).collect())
        }
    }

    fn row_to_entity(row: sqlx::postgres::PgRow) -> Entity {
        let aggregation_raw: String = row.try_get("aggregation_method").unwrap_or_default();
        Entity {
            entity_id: row.try_get("entity_id").unwrap_or_default(),
            friendly_name: row.try_get("friendly_name").unwrap_or_default(),
            source: row.try_get("source").unwrap_or_default(),
            unit: row.try_get("unit").unwrap_or_default(),
            device_class: row.try_get("device_class").ok(),
            state_class: row.try_get("state_class").ok(),
            aggregation_method: crate::entity::AggregationMethod::from_str(&aggregation_raw)
                .unwrap_or(crate::entity::AggregationMethod::None),
        }
    }

    pub struct PostgresEventRepo {
        pool: PgPool,
    }

    impl PostgresEventRepo {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }
    }

    #[async_trait]
    impl EventRepo for PostgresEventRepo {
        async fn save(&self, row: EventRow) -> anyhow::Result<()> {
            sqlx::query(
                "INSERT INTO events (timestamp, entity_id, value, attributes) VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (timestamp, entity_id) DO NOTHING",
            )
            .bind(row.timestamp)
            .bind(&row.entity_id)
            .bind(row.value)
            .bind(&row.attributes)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn in_window_for_stats(
            &self,
            entity_id: &str,
            window_start: DateTime<Utc>,
            window_end: DateTime<Utc>,
        ) -> anyhow::Result<Vec<EventRow>> {
            let rows = sqlx::query(
                "SELECT timestamp, entity_id, value, attributes FROM events \
                 WHERE entity_id = $1 AND timestamp > $2 AND timestamp <= $3 \
                 ORDER BY timestamp ASC",
            )
            .bind(entity_id)
            .bind(window_start)
            .bind(window_end)
            .fetch_all(&self.pool)
            .await?;

            Ok(rows
                .into_iter()
                .map(|row| EventRow {
                    timestamp: row.try_get("timestamp").unwrap(),
                    entity_id: row.try_get("entity_id").unwrap(),
                    value: row.try_get("value").ok(),
                    attributes: row.try_get("attributes").ok(),
                })
                .collect())
        }
    }

    pub struct PostgresShortTermStatRepo {
        pool: PgPool,
    }

    impl PostgresShortTermStatRepo {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }
    }

    #[async_trait]
    impl ShortTermStatRepo for PostgresShortTermStatRepo {
        async fn exists(&self, window_start: DateTime<Utc>, entity_id: &str) -> anyhow::Result<bool> {
            let row = sqlx::query(
                "SELECT 1 FROM statistics_short_term WHERE start_ts = $1 AND entity_id = $2",
            )
            .bind(window_start)
            .bind(entity_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row.is_some())
        }

        async fn save(&self, row: ShortTermStat) -> anyhow::Result<()> {
            sqlx::query(
                "INSERT INTO statistics_short_term (start_ts, entity_id, mean, min, max, last, sum, count, attributes) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
                 ON CONFLICT (start_ts, entity_id) DO NOTHING",
            )
            .bind(row.window_start)
            .bind(&row.entity_id)
            .bind(row.mean)
            .bind(row.min)
            .bind(row.max)
            .bind(row.last)
            .bind(row.sum)
            .bind(row.count)
            .bind(&row.attributes)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn latest(&self, entity_id: &str) -> anyhow::Result<Option<ShortTermStat>> {
            let row = sqlx::query(
                "SELECT start_ts, entity_id, mean, min, max, last, sum, count, attributes \
                 FROM statistics_short_term WHERE entity_id = $1 ORDER BY start_ts DESC LIMIT 1",
            )
            .bind(entity_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row.map(row_to_short_term))
        }

        async fn in_range(
            &self,
            range_start: DateTime<Utc>,
            range_end: DateTime<Utc>,
        ) -> anyhow::Result<Vec<ShortTermStat>> {
            let rows = sqlx::query(
                "SELECT start_ts, entity_id, mean, min, max, last, sum, count, attributes \
                 FROM statistics_short_term WHERE start_ts >= $1 AND start_ts < $2 \
                 ORDER BY entity_id, start_ts ASC",
            )
            .bind(range_start)
            .bind(range_end)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows.into_iter().map(row_to_short_term).collect())
        }
    }

    fn row_to_short_term(row: sqlx::postgres::PgRow) -> ShortTermStat {
        ShortTermStat {
            window_start: row.try_get("start_ts").unwrap(),
            entity_id: row.try_get("entity_id").unwrap(),
            mean: row.try_get("mean").ok(),
            min: row.try_get("min").ok(),
            max: row.try_get("max").ok(),
            last: row.try_get("last").ok(),
            sum: row.try_get("sum").ok(),
            count: row.try_get("count").unwrap_or(0),
            attributes: row.try_get("attributes").ok(),
        }
    }

    pub struct PostgresLongTermStatRepo {
        pool: PgPool,
    }

    impl PostgresLongTermStatRepo {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }
    }

    #[async_trait]
    impl LongTermStatRepo for PostgresLongTermStatRepo {
        async fn exists(&self, window_start: DateTime<Utc>, entity_id: &str) -> anyhow::Result<bool> {
            let row = sqlx::query("SELECT 1 FROM statistics WHERE start_ts = $1 AND entity_id = $2")
                .bind(window_start)
                .bind(entity_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row.is_some())
        }

        async fn save(&self, row: LongTermStat) -> anyhow::Result<()> {
            sqlx::query(
                "INSERT INTO statistics (start_ts, entity_id, mean, min, max, last, sum, count, state, attributes) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
                 ON CONFLICT (start_ts, entity_id) DO NOTHING",
            )
            .bind(row.window_start)
            .bind(&row.entity_id)
            .bind(row.mean)
            .bind(row.min)
            .bind(row.max)
            .bind(row.last)
            .bind(row.sum)
            .bind(row.count)
            .bind(row.state)
            .bind(&row.attributes)
            .execute(&self.pool)
            .await?;
            Ok(())
        }
    }
}
