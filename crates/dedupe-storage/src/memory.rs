//! In-memory store with foreign-key and unique enforcement.
//!
//! A transaction takes an owned lock on the whole state and mutates a copy,
//! so transactions are fully serialized and a dropped transaction leaves the
//! shared state untouched. Faults can be injected to exercise retry and
//! rollback paths.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dedupe_core::{ConsolidationMapping, EntityRow, EntitySpec, Ident, Referrer};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::{ConsolidationStore, EntityScan, GuardOutcome, StoreError, StoreTransaction, TxOptions};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Int(i64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    fn key_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Int(v) => Some(v.to_string()),
            Value::Text(v) => Some(v.clone()),
            Value::Timestamp(v) => Some(v.to_rfc3339()),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Timestamp(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

pub type MemoryRow = BTreeMap<String, Value>;

static NULL: Value = Value::Null;

fn cell<'a>(row: &'a MemoryRow, column: &str) -> &'a Value {
    row.get(column).unwrap_or(&NULL)
}

#[derive(Debug, Clone, Default, Serialize)]
struct MemoryTable {
    columns: BTreeSet<String>,
    rows: Vec<MemoryRow>,
}

impl MemoryTable {
    fn require_column(&self, table: &str, column: &str) -> Result<(), StoreError> {
        if self.columns.contains(column) {
            Ok(())
        } else {
            Err(StoreError::UnknownColumn {
                table: table.to_string(),
                column: column.to_string(),
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct ForeignKey {
    table: String,
    column: String,
    target_table: String,
    target_column: String,
}

impl ForeignKey {
    fn name(&self) -> String {
        format!("{}_{}_fkey", self.table, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct UniqueIndex {
    name: String,
    table: String,
    columns: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
struct MemoryState {
    tables: BTreeMap<String, MemoryTable>,
    foreign_keys: Vec<ForeignKey>,
    unique_indexes: Vec<UniqueIndex>,
}

impl MemoryState {
    fn table(&self, name: &str) -> Result<&MemoryTable, StoreError> {
        self.tables
            .get(name)
            .ok_or_else(|| StoreError::UnknownTable(name.to_string()))
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut MemoryTable, StoreError> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| StoreError::UnknownTable(name.to_string()))
    }

    fn check_foreign_key(&self, fk: &ForeignKey) -> Result<(), StoreError> {
        let targets = self
            .table(&fk.target_table)?
            .rows
            .iter()
            .map(|row| cell(row, &fk.target_column).clone())
            .collect::<BTreeSet<_>>();
        for row in &self.table(&fk.table)?.rows {
            let value = cell(row, &fk.column);
            if !value.is_null() && !targets.contains(value) {
                return Err(StoreError::ForeignKeyViolation {
                    table: Some(fk.table.clone()),
                    constraint: Some(fk.name()),
                    message: format!(
                        "{}.{} = {:?} has no matching row in {}.{}",
                        fk.table, fk.column, value, fk.target_table, fk.target_column
                    ),
                });
            }
        }
        Ok(())
    }

    /// Checks foreign keys declared on `table` and those pointing at it.
    fn check_foreign_keys_touching(&self, table: &str) -> Result<(), StoreError> {
        for fk in &self.foreign_keys {
            if fk.table == table || fk.target_table == table {
                self.check_foreign_key(fk)?;
            }
        }
        Ok(())
    }

    fn has_duplicate_keys(&self, table: &str, columns: &[String]) -> Result<bool, StoreError> {
        let mut seen = BTreeSet::new();
        for row in &self.table(table)?.rows {
            let key = columns
                .iter()
                .map(|column| cell(row, column).key_text())
                .collect::<Option<Vec<_>>>();
            if let Some(key) = key {
                if !seen.insert(key) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn check_unique(&self, table: &str) -> Result<(), StoreError> {
        for index in self.unique_indexes.iter().filter(|i| i.table == table) {
            if self.has_duplicate_keys(table, &index.columns)? {
                return Err(StoreError::UniqueViolation {
                    constraint: Some(index.name.clone()),
                    message: format!(
                        "duplicate key value violates unique index on {}({})",
                        table,
                        index.columns.join(", ")
                    ),
                });
            }
        }
        Ok(())
    }

    fn scan(&self, entity: &EntitySpec) -> Result<EntityScan, StoreError> {
        let name = entity.table.as_str();
        let table = self.table(name)?;
        for column in [&entity.id_column, &entity.created_at_column]
            .into_iter()
            .chain(entity.natural_key.iter())
        {
            table.require_column(name, column.as_str())?;
        }

        let mut scan = EntityScan::default();
        for row in &table.rows {
            scan.total_rows += 1;
            let id = cell(row, entity.id_column.as_str())
                .as_int()
                .ok_or_else(|| StoreError::InvalidValue {
                    table: name.to_string(),
                    column: entity.id_column.to_string(),
                    message: "id must be an integer".to_string(),
                })?;
            let created_at = match cell(row, entity.created_at_column.as_str()) {
                Value::Null => None,
                Value::Timestamp(at) => Some(*at),
                other => {
                    return Err(StoreError::InvalidValue {
                        table: name.to_string(),
                        column: entity.created_at_column.to_string(),
                        message: format!("expected a timestamp, found {other:?}"),
                    })
                }
            };
            let key = entity
                .natural_key
                .iter()
                .map(|column| cell(row, column.as_str()).key_text())
                .collect::<Vec<_>>();
            let entity_row = EntityRow::new(id, created_at, key);
            if entity_row.complete_key().is_some() {
                scan.candidates.push(entity_row);
            } else {
                scan.null_key_rows += 1;
            }
        }
        Ok(scan)
    }

    fn count_references(
        &self,
        referrer: &Referrer,
        filter: impl Fn(i64) -> bool,
    ) -> Result<u64, StoreError> {
        let name = referrer.table.as_str();
        let column = referrer.column.as_str();
        let table = self.table(name)?;
        table.require_column(name, column)?;
        let count = table
            .rows
            .iter()
            .filter(|row| cell(row, column).as_int().is_some_and(&filter))
            .count();
        Ok(count as u64)
    }

    fn repoint(
        &mut self,
        referrer: &Referrer,
        mapping: &ConsolidationMapping,
    ) -> Result<u64, StoreError> {
        let name = referrer.table.as_str();
        let column = referrer.column.as_str();
        let table = self.table_mut(name)?;
        table.require_column(name, column)?;

        let mut updated = 0u64;
        for row in &mut table.rows {
            let survivor = cell(row, column)
                .as_int()
                .and_then(|id| mapping.survivor_for(id));
            if let Some(survivor) = survivor {
                row.insert(column.to_string(), Value::Int(survivor));
                updated += 1;
            }
        }

        self.check_foreign_keys_touching(name)?;
        self.check_unique(name)?;
        Ok(updated)
    }

    fn delete(&mut self, entity: &EntitySpec, ids: &[i64]) -> Result<u64, StoreError> {
        let doomed = ids.iter().copied().collect::<BTreeSet<_>>();
        let name = entity.table.as_str();
        let id_column = entity.id_column.as_str();
        let table = self.table_mut(name)?;
        table.require_column(name, id_column)?;

        let before = table.rows.len();
        table
            .rows
            .retain(|row| !cell(row, id_column).as_int().is_some_and(|id| doomed.contains(&id)));
        let deleted = (before - table.rows.len()) as u64;

        self.check_foreign_keys_touching(name)?;
        Ok(deleted)
    }
}

/// Knobs for simulating store failures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Faults {
    /// Number of upcoming `begin` calls that fail with a transient error.
    pub transient_begins: u32,
    /// Number of upcoming transactions whose `delete_rows` fails with a
    /// transient error after earlier writes have landed in the transaction.
    pub transient_deletes: u32,
    /// `delete_rows` fails with a foreign-key violation.
    pub fail_delete: bool,
    /// `delete_rows` reports success without removing anything.
    pub skip_delete: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    faults: Arc<Mutex<Faults>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_table(&self, name: &str, columns: &[&str]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.tables.contains_key(name) {
            return Err(StoreError::Other(format!("table {name} already exists")));
        }
        state.tables.insert(
            name.to_string(),
            MemoryTable {
                columns: columns.iter().map(ToString::to_string).collect(),
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    pub async fn add_foreign_key(
        &self,
        table: &str,
        column: &str,
        target_table: &str,
        target_column: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.table(table)?.require_column(table, column)?;
        state
            .table(target_table)?
            .require_column(target_table, target_column)?;
        let fk = ForeignKey {
            table: table.to_string(),
            column: column.to_string(),
            target_table: target_table.to_string(),
            target_column: target_column.to_string(),
        };
        state.check_foreign_key(&fk)?;
        state.foreign_keys.push(fk);
        Ok(())
    }

    pub async fn insert<'a>(
        &self,
        table: &str,
        values: impl IntoIterator<Item = (&'a str, Value)>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let target = state.table_mut(table)?;
        let mut row = MemoryRow::new();
        for (column, value) in values {
            target.require_column(table, column)?;
            row.insert(column.to_string(), value);
        }
        target.rows.push(row);

        let checked = state
            .check_foreign_keys_touching(table)
            .and_then(|()| state.check_unique(table));
        if let Err(err) = checked {
            state.table_mut(table)?.rows.pop();
            return Err(err);
        }
        Ok(())
    }

    pub async fn rows(&self, table: &str) -> Result<Vec<MemoryRow>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.table(table)?.rows.clone())
    }

    pub async fn unique_indexes(&self, table: &str) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .unique_indexes
            .iter()
            .filter(|index| index.table == table)
            .map(|index| index.name.clone())
            .collect()
    }

    /// sha256 over the canonical serialization of every table, key and index.
    pub async fn fingerprint(&self) -> Result<String, StoreError> {
        let state = self.state.lock().await;
        let bytes = serde_json::to_vec(&*state)
            .map_err(|err| StoreError::Other(format!("serializing memory state: {err}")))?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    pub async fn set_faults(&self, faults: Faults) {
        *self.faults.lock().await = faults;
    }
}

pub struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
    faults: Faults,
    read_only: bool,
}

impl MemoryTransaction {
    fn writable(&self) -> Result<(), StoreError> {
        if self.read_only {
            Err(StoreError::Other(
                "cannot write in a read-only transaction".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn scan_entity(&mut self, entity: &EntitySpec) -> Result<EntityScan, StoreError> {
        self.working.scan(entity)
    }

    async fn count_references(&mut self, referrer: &Referrer) -> Result<u64, StoreError> {
        self.working.count_references(referrer, |_| true)
    }

    async fn count_references_to(
        &mut self,
        referrer: &Referrer,
        ids: &[i64],
    ) -> Result<u64, StoreError> {
        let ids = ids.iter().copied().collect::<BTreeSet<_>>();
        self.working
            .count_references(referrer, |id| ids.contains(&id))
    }

    async fn repoint(
        &mut self,
        referrer: &Referrer,
        mapping: &ConsolidationMapping,
    ) -> Result<u64, StoreError> {
        self.writable()?;
        self.working.repoint(referrer, mapping)
    }

    async fn delete_rows(&mut self, entity: &EntitySpec, ids: &[i64]) -> Result<u64, StoreError> {
        self.writable()?;
        if self.faults.transient_deletes > 0 {
            return Err(StoreError::Transient {
                message: "injected serialization failure during delete".to_string(),
            });
        }
        if self.faults.fail_delete {
            return Err(StoreError::ForeignKeyViolation {
                table: None,
                constraint: None,
                message: "injected delete failure".to_string(),
            });
        }
        if self.faults.skip_delete {
            return Ok(ids.len() as u64);
        }
        self.working.delete(entity, ids)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction {
            mut guard, working, ..
        } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl ConsolidationStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn begin(&self, options: &TxOptions) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let faults = {
            let mut faults = self.faults.lock().await;
            if faults.transient_begins > 0 {
                faults.transient_begins -= 1;
                return Err(StoreError::Transient {
                    message: "injected serialization failure".to_string(),
                });
            }
            let mut armed = faults.clone();
            armed.transient_deletes = 0;
            if faults.transient_deletes > 0 {
                faults.transient_deletes -= 1;
                armed.transient_deletes = 1;
            }
            armed
        };
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        debug!(isolation = %options.isolation, read_only = options.read_only, "memory transaction opened");
        Ok(Box::new(MemoryTransaction {
            guard,
            working,
            faults,
            read_only: options.read_only,
        }))
    }

    async fn table_exists(&self, table: &Ident) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state.tables.contains_key(table.as_str()))
    }

    async fn column_exists(&self, table: &Ident, column: &Ident) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .tables
            .get(table.as_str())
            .is_some_and(|t| t.columns.contains(column.as_str())))
    }

    async fn declared_referrers(&self, entity: &EntitySpec) -> Result<Vec<Referrer>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .foreign_keys
            .iter()
            .filter(|fk| {
                fk.target_table == entity.table.as_str()
                    && fk.target_column == entity.id_column.as_str()
            })
            .filter_map(|fk| {
                Some(Referrer::new(
                    Ident::parse(&fk.table).ok()?,
                    Ident::parse(&fk.column).ok()?,
                ))
            })
            .collect())
    }

    async fn ensure_unique_index(
        &self,
        entity: &EntitySpec,
        index: &Ident,
    ) -> Result<GuardOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let name = entity.table.as_str();
        let table = state.table(name)?;
        for column in &entity.natural_key {
            table.require_column(name, column.as_str())?;
        }

        let wanted = entity
            .natural_key
            .iter()
            .map(|c| c.to_string())
            .collect::<BTreeSet<_>>();
        if let Some(existing) = state.unique_indexes.iter().find(|i| {
            i.table == name && i.columns.iter().cloned().collect::<BTreeSet<_>>() == wanted
        }) {
            return Ok(GuardOutcome::AlreadyPresent(existing.name.clone()));
        }
        if state.unique_indexes.iter().any(|i| i.name == index.as_str()) {
            return Err(StoreError::Other(format!(
                "index {index} already exists on different columns"
            )));
        }

        let columns = entity
            .natural_key
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>();
        if state.has_duplicate_keys(name, &columns)? {
            return Err(StoreError::UniqueViolation {
                constraint: Some(index.to_string()),
                message: format!("could not create unique index {index}: duplicate keys exist"),
            });
        }
        state.unique_indexes.push(UniqueIndex {
            name: index.to_string(),
            table: name.to_string(),
            columns,
        });
        Ok(GuardOutcome::Created(index.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ident(s: &str) -> Ident {
        Ident::parse(s).expect("ident")
    }

    fn at(secs: i64) -> Value {
        Value::Timestamp(Utc.timestamp_opt(secs, 0).single().expect("ts"))
    }

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .create_table("promo_codes", &["id", "code", "created_at"])
            .await
            .expect("table");
        store
            .create_table("orders", &["id", "promo_code_id"])
            .await
            .expect("table");
        store
            .add_foreign_key("orders", "promo_code_id", "promo_codes", "id")
            .await
            .expect("fk");
        for (id, code, t) in [(1, "A", 10), (2, "A", 5), (3, "B", 5)] {
            store
                .insert(
                    "promo_codes",
                    [("id", Value::Int(id)), ("code", code.into()), ("created_at", at(t))],
                )
                .await
                .expect("insert");
        }
        store
            .insert("orders", [("id", Value::Int(100)), ("promo_code_id", Value::Int(1))])
            .await
            .expect("order");
        store
    }

    fn promo_spec() -> EntitySpec {
        EntitySpec::new(ident("promo_codes"), vec![ident("code")])
    }

    #[tokio::test]
    async fn inserts_respect_foreign_keys() {
        let store = seeded().await;
        let err = store
            .insert("orders", [("id", Value::Int(101)), ("promo_code_id", Value::Int(99))])
            .await
            .expect_err("dangling reference");
        assert!(matches!(err, StoreError::ForeignKeyViolation { .. }));
        assert_eq!(store.rows("orders").await.expect("rows").len(), 1);
    }

    #[tokio::test]
    async fn dropped_transaction_leaves_state_untouched() {
        let store = seeded().await;
        let before = store.fingerprint().await.expect("fingerprint");
        {
            let mut tx = store.begin(&TxOptions::default()).await.expect("begin");
            let orders = Referrer::new(ident("orders"), ident("promo_code_id"));
            let mapping = ConsolidationMapping::from_groups(
                &dedupe_core::group_duplicates(tx.scan_entity(&promo_spec()).await.expect("scan").candidates)
                    .groups,
            );
            assert_eq!(tx.repoint(&orders, &mapping).await.expect("repoint"), 1);
        }
        assert_eq!(store.fingerprint().await.expect("fingerprint"), before);
    }

    #[tokio::test]
    async fn delete_of_referenced_row_is_rejected() {
        let store = seeded().await;
        let mut tx = store.begin(&TxOptions::default()).await.expect("begin");
        let err = tx
            .delete_rows(&promo_spec(), &[1])
            .await
            .expect_err("still referenced");
        match err {
            StoreError::ForeignKeyViolation { table, .. } => {
                assert_eq!(table.as_deref(), Some("orders"))
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_only_transactions_reject_writes() {
        let store = seeded().await;
        let mut tx = store
            .begin(&TxOptions::default().read_only())
            .await
            .expect("begin");
        assert!(tx.delete_rows(&promo_spec(), &[3]).await.is_err());
        assert_eq!(tx.scan_entity(&promo_spec()).await.expect("scan").total_rows, 3);
    }

    #[tokio::test]
    async fn unique_index_requires_clean_data_and_is_idempotent() {
        let store = seeded().await;
        let index = ident("promo_codes_code_uniq");
        let err = store
            .ensure_unique_index(&promo_spec(), &index)
            .await
            .expect_err("duplicates present");
        assert!(matches!(err, StoreError::UniqueViolation { .. }));

        let mut tx = store.begin(&TxOptions::default()).await.expect("begin");
        tx.delete_rows(&promo_spec(), &[2]).await.expect("delete");
        tx.commit().await.expect("commit");

        assert_eq!(
            store.ensure_unique_index(&promo_spec(), &index).await.expect("guard"),
            GuardOutcome::Created("promo_codes_code_uniq".into())
        );
        assert_eq!(
            store.ensure_unique_index(&promo_spec(), &index).await.expect("guard"),
            GuardOutcome::AlreadyPresent("promo_codes_code_uniq".into())
        );
        let dup = store
            .insert(
                "promo_codes",
                [("id", Value::Int(4)), ("code", "A".into()), ("created_at", at(1))],
            )
            .await;
        assert!(matches!(dup, Err(StoreError::UniqueViolation { .. })));
    }

    #[tokio::test]
    async fn transient_faults_fail_begin_a_bounded_number_of_times() {
        let store = seeded().await;
        store
            .set_faults(Faults {
                transient_begins: 1,
                ..Faults::default()
            })
            .await;
        assert!(matches!(
            store.begin(&TxOptions::default()).await.err(),
            Some(StoreError::Transient { .. })
        ));
        assert!(store.begin(&TxOptions::default()).await.is_ok());
    }

    #[tokio::test]
    async fn transient_delete_discards_the_whole_transaction() {
        let store = seeded().await;
        let before = store.fingerprint().await.expect("fingerprint");
        store
            .set_faults(Faults {
                transient_deletes: 1,
                ..Faults::default()
            })
            .await;
        let orders = Referrer::new(ident("orders"), ident("promo_code_id"));

        let mut tx = store.begin(&TxOptions::default()).await.expect("begin");
        let mapping = ConsolidationMapping::from_groups(
            &dedupe_core::group_duplicates(tx.scan_entity(&promo_spec()).await.expect("scan").candidates)
                .groups,
        );
        assert_eq!(tx.repoint(&orders, &mapping).await.expect("repoint"), 1);
        assert!(matches!(
            tx.delete_rows(&promo_spec(), &mapping.loser_ids()).await,
            Err(StoreError::Transient { .. })
        ));
        drop(tx);
        assert_eq!(store.fingerprint().await.expect("fingerprint"), before);

        let mut tx = store.begin(&TxOptions::default()).await.expect("begin");
        assert_eq!(tx.repoint(&orders, &mapping).await.expect("repoint"), 1);
        assert_eq!(
            tx.delete_rows(&promo_spec(), &mapping.loser_ids())
                .await
                .expect("delete"),
            1
        );
    }

    #[tokio::test]
    async fn declared_referrers_come_from_foreign_keys() {
        let store = seeded().await;
        let declared = store
            .declared_referrers(&promo_spec())
            .await
            .expect("declared");
        assert_eq!(
            declared,
            vec![Referrer::new(ident("orders"), ident("promo_code_id"))]
        );
    }
}
