//! PostgreSQL backend on `sqlx`.
//!
//! Identifiers reaching these statements are validated `Ident`s, so they are
//! spliced in quoted form; every value is bound.

use std::time::Duration;

use async_trait::async_trait;
use dedupe_core::{ConsolidationMapping, EntityRow, EntitySpec, Ident, Referrer};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Row, Transaction};
use tracing::{info, warn};

use crate::{ConsolidationStore, EntityScan, GuardOutcome, StoreError, StoreTransaction, TxOptions};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn index_state(
        &self,
        schema: Option<&str>,
        index: &str,
    ) -> Result<Option<bool>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT ix.indisvalid AS valid
              FROM pg_class i
              JOIN pg_index ix ON ix.indexrelid = i.oid
              JOIN pg_namespace n ON n.oid = i.relnamespace
             WHERE i.relname = $2
               AND n.nspname = COALESCE($1, current_schema())
            "#,
        )
        .bind(schema)
        .bind(index)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.try_get::<bool, _>("valid")).transpose()?)
    }

    async fn drop_index_concurrently(&self, qualified_index: &str) -> Result<(), StoreError> {
        sqlx::query(&format!("DROP INDEX CONCURRENTLY IF EXISTS {qualified_index}"))
            .persistent(false)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn column_list(columns: &[Ident]) -> String {
    columns
        .iter()
        .map(Ident::quoted)
        .collect::<Vec<_>>()
        .join(", ")
}

fn millis(duration: Duration) -> String {
    format!("{}ms", duration.as_millis())
}

pub struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn scan_entity(&mut self, entity: &EntitySpec) -> Result<EntityScan, StoreError> {
        let key_columns = column_list(&entity.natural_key);
        let id = entity.id_column.quoted();
        // Every member of an equality class reports the rendering of its
        // lowest id, so text grouping cannot split what the store's `=` joins.
        let key_exprs = entity
            .natural_key
            .iter()
            .enumerate()
            .map(|(i, column)| {
                format!(
                    "FIRST_VALUE({}::text) OVER (PARTITION BY {key_columns} ORDER BY {id}) AS k{i}",
                    column.quoted()
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        let key_aliases = (0..entity.natural_key.len())
            .map(|i| format!("k{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let all_present = entity
            .natural_key
            .iter()
            .map(|column| format!("{} IS NOT NULL", column.quoted()))
            .collect::<Vec<_>>()
            .join(" AND ");

        let counts = sqlx::query(&format!(
            r#"
            SELECT COUNT(*) AS total_rows,
                   COUNT(*) FILTER (WHERE NOT ({all_present})) AS null_key_rows
              FROM {table}
            "#,
            table = entity.table.quoted(),
        ))
        .persistent(false)
        .fetch_one(&mut *self.tx)
        .await?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT id, created_at, partition_no, {key_aliases}
              FROM (
                    SELECT {id}::bigint AS id,
                           {created_at}::timestamptz AS created_at,
                           {key_exprs},
                           DENSE_RANK() OVER (ORDER BY {key_columns}) AS partition_no,
                           COUNT(*) OVER (PARTITION BY {key_columns}) AS group_size
                      FROM {table}
                     WHERE {all_present}
                   ) candidates
             WHERE group_size > 1
             ORDER BY id
            "#,
            created_at = entity.created_at_column.quoted(),
            table = entity.table.quoted(),
        ))
        .persistent(false)
        .fetch_all(&mut *self.tx)
        .await?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            let mut key = Vec::with_capacity(entity.natural_key.len());
            for i in 0..entity.natural_key.len() {
                key.push(row.try_get::<Option<String>, _>(format!("k{i}").as_str())?);
            }
            candidates.push(
                EntityRow::new(row.try_get("id")?, row.try_get("created_at")?, key)
                    .with_partition(row.try_get("partition_no")?),
            );
        }

        Ok(EntityScan {
            candidates,
            total_rows: counts.try_get::<i64, _>("total_rows")?.max(0) as u64,
            null_key_rows: counts.try_get::<i64, _>("null_key_rows")?.max(0) as u64,
        })
    }

    async fn count_references(&mut self, referrer: &Referrer) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE {} IS NOT NULL",
            referrer.table.quoted(),
            referrer.column.quoted()
        ))
        .persistent(false)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn count_references_to(
        &mut self,
        referrer: &Referrer,
        ids: &[i64],
    ) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE {} = ANY($1::bigint[])",
            referrer.table.quoted(),
            referrer.column.quoted()
        ))
        .persistent(false)
        .bind(ids)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn repoint(
        &mut self,
        referrer: &Referrer,
        mapping: &ConsolidationMapping,
    ) -> Result<u64, StoreError> {
        if mapping.is_empty() {
            return Ok(0);
        }
        let (losers, survivors) = mapping.columns();
        let result = sqlx::query(&format!(
            r#"
            UPDATE {table} AS r
               SET {column} = m.survivor_id
              FROM UNNEST($1::bigint[], $2::bigint[]) AS m(loser_id, survivor_id)
             WHERE r.{column} = m.loser_id
            "#,
            table = referrer.table.quoted(),
            column = referrer.column.quoted(),
        ))
        .persistent(false)
        .bind(&losers)
        .bind(&survivors)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_rows(&mut self, entity: &EntitySpec, ids: &[i64]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE {} = ANY($1::bigint[])",
            entity.table.quoted(),
            entity.id_column.quoted()
        ))
        .persistent(false)
        .bind(ids)
        .execute(&mut *self.tx)
        .await?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl ConsolidationStore for PgStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn begin(&self, options: &TxOptions) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let access = if options.read_only { "READ ONLY" } else { "READ WRITE" };
        sqlx::query(&format!(
            "SET TRANSACTION ISOLATION LEVEL {} {access}",
            options.isolation.as_sql()
        ))
        .persistent(false)
        .execute(&mut *tx)
        .await?;
        if let Some(timeout) = options.lock_timeout {
            sqlx::query("SELECT set_config('lock_timeout', $1, true)")
                .bind(millis(timeout))
                .execute(&mut *tx)
                .await?;
        }
        if let Some(timeout) = options.statement_timeout {
            sqlx::query("SELECT set_config('statement_timeout', $1, true)")
                .bind(millis(timeout))
                .execute(&mut *tx)
                .await?;
        }
        Ok(Box::new(PgTransaction { tx }))
    }

    async fn table_exists(&self, table: &Ident) -> Result<bool, StoreError> {
        let exists: (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS(
                SELECT 1
                  FROM information_schema.tables
                 WHERE table_schema = COALESCE($1, current_schema())
                   AND table_name = $2
            )
            "#,
        )
        .bind(table.schema())
        .bind(table.name())
        .fetch_one(&self.pool)
        .await?;
        Ok(exists.0)
    }

    async fn column_exists(&self, table: &Ident, column: &Ident) -> Result<bool, StoreError> {
        let exists: (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS(
                SELECT 1
                  FROM information_schema.columns
                 WHERE table_schema = COALESCE($1, current_schema())
                   AND table_name = $2
                   AND column_name = $3
            )
            "#,
        )
        .bind(table.schema())
        .bind(table.name())
        .bind(column.name())
        .fetch_one(&self.pool)
        .await?;
        Ok(exists.0)
    }

    async fn declared_referrers(&self, entity: &EntitySpec) -> Result<Vec<Referrer>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT CASE WHEN src_ns.nspname = current_schema()
                        THEN src.relname::text
                        ELSE src_ns.nspname || '.' || src.relname
                   END AS referrer_table,
                   src_att.attname::text AS referrer_column
              FROM pg_constraint con
              JOIN pg_class src ON src.oid = con.conrelid
              JOIN pg_namespace src_ns ON src_ns.oid = src.relnamespace
              JOIN pg_class tgt ON tgt.oid = con.confrelid
              JOIN pg_namespace tgt_ns ON tgt_ns.oid = tgt.relnamespace
              JOIN pg_attribute src_att
                ON src_att.attrelid = con.conrelid AND src_att.attnum = con.conkey[1]
              JOIN pg_attribute tgt_att
                ON tgt_att.attrelid = con.confrelid AND tgt_att.attnum = con.confkey[1]
             WHERE con.contype = 'f'
               AND array_length(con.conkey, 1) = 1
               AND tgt.relname = $2
               AND tgt_ns.nspname = COALESCE($1, current_schema())
               AND tgt_att.attname = $3
             ORDER BY 1, 2
            "#,
        )
        .bind(entity.table.schema())
        .bind(entity.table.name())
        .bind(entity.id_column.name())
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let table: String = row.try_get("referrer_table")?;
            let column: String = row.try_get("referrer_column")?;
            match (Ident::parse(&table), Ident::parse(&column)) {
                (Ok(table), Ok(column)) => out.push(Referrer::new(table, column)),
                _ => warn!(%table, %column, "skipping foreign key with an unsupported identifier"),
            }
        }
        Ok(out)
    }

    async fn ensure_unique_index(
        &self,
        entity: &EntitySpec,
        index: &Ident,
    ) -> Result<GuardOutcome, StoreError> {
        if index.is_qualified() {
            return Err(StoreError::Other(format!(
                "index name {index} must not be schema-qualified"
            )));
        }
        let schema = entity.table.schema();
        let mut wanted = entity
            .natural_key
            .iter()
            .map(|c| c.name().to_string())
            .collect::<Vec<_>>();
        wanted.sort();

        let existing: Option<String> = sqlx::query_scalar(
            r#"
            SELECT i.relname::text
              FROM pg_index ix
              JOIN pg_class i ON i.oid = ix.indexrelid
              JOIN pg_class t ON t.oid = ix.indrelid
              JOIN pg_namespace n ON n.oid = t.relnamespace
             WHERE t.relname = $2
               AND n.nspname = COALESCE($1, current_schema())
               AND ix.indisunique
               AND ix.indisvalid
               AND ix.indpred IS NULL
               AND ix.indexprs IS NULL
               AND ARRAY(
                       SELECT a.attname::text
                         FROM pg_attribute a
                        WHERE a.attrelid = t.oid
                          AND a.attnum = ANY(ix.indkey)
                        ORDER BY a.attname
                   ) = $3::text[]
             ORDER BY 1
             LIMIT 1
            "#,
        )
        .bind(schema)
        .bind(entity.table.name())
        .bind(&wanted)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(name) = existing {
            return Ok(GuardOutcome::AlreadyPresent(name));
        }

        let qualified_index = match schema {
            Some(schema) => format!("\"{schema}\".{}", index.quoted()),
            None => index.quoted(),
        };

        let rebuilt = match self.index_state(schema, index.as_str()).await? {
            Some(true) => {
                return Err(StoreError::Other(format!(
                    "index {index} already exists on different columns"
                )))
            }
            Some(false) => {
                warn!(index = %index, "dropping invalid index left by an earlier concurrent build");
                self.drop_index_concurrently(&qualified_index).await?;
                true
            }
            None => false,
        };

        let create = format!(
            "CREATE UNIQUE INDEX CONCURRENTLY IF NOT EXISTS {} ON {} ({})",
            index.quoted(),
            entity.table.quoted(),
            column_list(&entity.natural_key)
        );
        if let Err(err) = sqlx::query(&create)
            .persistent(false)
            .execute(&self.pool)
            .await
        {
            // A failed concurrent build leaves an INVALID index behind.
            if let Err(drop_err) = self.drop_index_concurrently(&qualified_index).await {
                warn!(index = %index, error = %drop_err, "failed to drop invalid index");
            }
            return Err(err.into());
        }

        info!(index = %index, table = %entity.table, rebuilt, "unique index installed");
        Ok(if rebuilt {
            GuardOutcome::Rebuilt(index.to_string())
        } else {
            GuardOutcome::Created(index.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TxOptions;

    fn ident(s: &str) -> Ident {
        Ident::parse(s).expect("ident")
    }

    async fn connect_test_db() -> Option<PgStore> {
        let url = std::env::var("DEDUPE_TEST_DATABASE_URL").ok()?;
        Some(PgStore::connect(&url, 2).await.expect("connect test database"))
    }

    async fn exec(store: &PgStore, sql: &str) {
        sqlx::query(sql)
            .execute(store.pool())
            .await
            .unwrap_or_else(|err| panic!("{sql}: {err}"));
    }

    #[tokio::test]
    async fn postgres_round_trip_when_configured() {
        let Some(store) = connect_test_db().await else {
            return;
        };
        exec(&store, "DROP TABLE IF EXISTS dedupe_t_orders").await;
        exec(&store, "DROP TABLE IF EXISTS dedupe_t_codes").await;
        exec(
            &store,
            "CREATE TABLE dedupe_t_codes (id bigint PRIMARY KEY, code text, created_at timestamptz)",
        )
        .await;
        exec(
            &store,
            "CREATE TABLE dedupe_t_orders (id bigint PRIMARY KEY, code_id bigint REFERENCES dedupe_t_codes(id))",
        )
        .await;
        exec(
            &store,
            "INSERT INTO dedupe_t_codes VALUES \
             (1, 'A', to_timestamp(10)), (2, 'A', to_timestamp(5)), (3, 'A', to_timestamp(5)), (4, NULL, now())",
        )
        .await;
        exec(&store, "INSERT INTO dedupe_t_orders VALUES (10, 1), (11, 3)").await;

        let entity = EntitySpec::new(ident("dedupe_t_codes"), vec![ident("code")]);
        let orders = Referrer::new(ident("dedupe_t_orders"), ident("code_id"));
        assert_eq!(store.declared_referrers(&entity).await.expect("fks"), vec![orders.clone()]);

        let mut tx = store.begin(&TxOptions::default()).await.expect("begin");
        let scan = tx.scan_entity(&entity).await.expect("scan");
        assert_eq!(scan.total_rows, 4);
        assert_eq!(scan.null_key_rows, 1);
        assert_eq!(scan.candidates.len(), 3);

        let grouping = dedupe_core::group_duplicates(scan.candidates);
        let mapping = ConsolidationMapping::from_groups(&grouping.groups);
        assert_eq!(tx.repoint(&orders, &mapping).await.expect("repoint"), 2);
        assert_eq!(tx.delete_rows(&entity, &mapping.loser_ids()).await.expect("delete"), 2);
        assert_eq!(
            tx.count_references_to(&orders, &mapping.loser_ids()).await.expect("count"),
            0
        );
        tx.rollback().await.expect("rollback");

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dedupe_t_codes")
            .fetch_one(store.pool())
            .await
            .expect("count");
        assert_eq!(remaining, 4);
    }

    #[tokio::test]
    async fn keys_equal_in_the_store_group_despite_different_renderings() {
        let Some(store) = connect_test_db().await else {
            return;
        };
        exec(&store, "DROP TABLE IF EXISTS dedupe_t_prices").await;
        exec(
            &store,
            "CREATE TABLE dedupe_t_prices (id bigint PRIMARY KEY, amount numeric, created_at timestamptz)",
        )
        .await;
        exec(
            &store,
            "INSERT INTO dedupe_t_prices VALUES \
             (1, 1.0, to_timestamp(10)), (2, 1.00, to_timestamp(5)), (3, 2, to_timestamp(1))",
        )
        .await;

        let entity = EntitySpec::new(ident("dedupe_t_prices"), vec![ident("amount")]);
        let mut tx = store.begin(&TxOptions::default().read_only()).await.expect("begin");
        let scan = tx.scan_entity(&entity).await.expect("scan");
        tx.rollback().await.expect("rollback");

        assert_eq!(scan.candidates.len(), 2);
        assert!(scan.candidates.iter().all(|row| row.key == vec![Some("1.0".to_string())]));
        let grouping = dedupe_core::group_duplicates(scan.candidates);
        assert_eq!(grouping.groups.len(), 1);
        assert_eq!(grouping.groups[0].survivor().id, 2);
    }
}
