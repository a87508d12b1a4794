//! Core domain model for natural-key duplicate consolidation.
//!
//! Everything in this crate is pure: identifier validation, consolidation
//! plans, the grouping of scanned rows into duplicate groups, survivor
//! election, the loser -> survivor mapping and the per-run report.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Postgres truncates identifiers past this many bytes.
pub const MAX_IDENT_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("invalid identifier {ident:?}: {reason}")]
    InvalidIdentifier { ident: String, reason: &'static str },
    #[error("column {0} must not be schema-qualified")]
    QualifiedColumn(String),
    #[error("natural key for {table} is empty")]
    EmptyNaturalKey { table: String },
    #[error("natural key for {table} lists column {column} more than once")]
    DuplicateKeyColumn { table: String, column: String },
    #[error("natural key for {table} includes the id column {column}")]
    KeyIncludesId { table: String, column: String },
    #[error("referrer {table}.{column} is registered more than once")]
    DuplicateReferrer { table: String, column: String },
    #[error("referrer {table}.{column} is the entity's own id column")]
    ReferrerIsEntityId { table: String, column: String },
}

/// A validated SQL identifier, optionally qualified as `schema.name`.
///
/// Only `[A-Za-z_][A-Za-z0-9_$]*` parts are accepted, so the quoted form can
/// be spliced into statements without escaping.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ident(String);

impl Ident {
    pub fn parse(raw: &str) -> Result<Self, PlanError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(invalid(raw, "empty"));
        }
        let parts = trimmed.split('.').collect::<Vec<_>>();
        if parts.len() > 2 {
            return Err(invalid(raw, "at most one schema qualifier is allowed"));
        }
        for part in parts {
            validate_part(raw, part)?;
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_qualified(&self) -> bool {
        self.0.contains('.')
    }

    pub fn schema(&self) -> Option<&str> {
        self.0.split_once('.').map(|(schema, _)| schema)
    }

    /// The last part of the identifier (the bare table or column name).
    pub fn name(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or(&self.0)
    }

    pub fn quoted(&self) -> String {
        self.0
            .split('.')
            .map(|part| format!("\"{part}\""))
            .collect::<Vec<_>>()
            .join(".")
    }

    fn unchecked(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

fn invalid(raw: &str, reason: &'static str) -> PlanError {
    PlanError::InvalidIdentifier {
        ident: raw.to_string(),
        reason,
    }
}

fn validate_part(raw: &str, part: &str) -> Result<(), PlanError> {
    let mut chars = part.chars();
    match chars.next() {
        None => return Err(invalid(raw, "empty identifier part")),
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        Some(_) => return Err(invalid(raw, "must start with a letter or underscore")),
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$') {
        return Err(invalid(raw, "only ASCII letters, digits, '_' and '$' are allowed"));
    }
    if part.len() > MAX_IDENT_LEN {
        return Err(invalid(raw, "longer than 63 bytes"));
    }
    Ok(())
}

impl TryFrom<String> for Ident {
    type Error = PlanError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Ident> for String {
    fn from(value: Ident) -> Self {
        value.0
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn default_id_column() -> Ident {
    Ident::unchecked("id")
}

fn default_created_at_column() -> Ident {
    Ident::unchecked("created_at")
}

/// The entity table under consolidation and its natural key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySpec {
    pub table: Ident,
    #[serde(default = "default_id_column")]
    pub id_column: Ident,
    #[serde(default = "default_created_at_column")]
    pub created_at_column: Ident,
    pub natural_key: Vec<Ident>,
    /// Name for the preventive unique index; derived from the key when absent.
    #[serde(default)]
    pub unique_index: Option<Ident>,
}

impl EntitySpec {
    pub fn new(table: Ident, natural_key: Vec<Ident>) -> Self {
        Self {
            table,
            id_column: default_id_column(),
            created_at_column: default_created_at_column(),
            natural_key,
            unique_index: None,
        }
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        let table = self.table.to_string();
        if self.natural_key.is_empty() {
            return Err(PlanError::EmptyNaturalKey { table });
        }
        for column in [&self.id_column, &self.created_at_column]
            .into_iter()
            .chain(self.natural_key.iter())
        {
            if column.is_qualified() {
                return Err(PlanError::QualifiedColumn(column.to_string()));
            }
        }
        let mut seen = BTreeSet::new();
        for column in &self.natural_key {
            if column == &self.id_column {
                return Err(PlanError::KeyIncludesId {
                    table,
                    column: column.to_string(),
                });
            }
            if !seen.insert(column) {
                return Err(PlanError::DuplicateKeyColumn {
                    table,
                    column: column.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// One (table, foreign-key column) pair pointing at the entity's id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Referrer {
    pub table: Ident,
    pub column: Ident,
}

impl Referrer {
    pub fn new(table: Ident, column: Ident) -> Self {
        Self { table, column }
    }
}

impl fmt::Display for Referrer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

/// Caller-supplied configuration for one entity type.
///
/// The referrer list must be complete: a table that references the entity
/// but is missing here is only caught by the store's foreign keys at purge
/// time, or not at all when the store does not enforce them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsolidationPlan {
    pub entity: EntitySpec,
    pub referrers: Vec<Referrer>,
}

impl ConsolidationPlan {
    pub fn new(entity: EntitySpec, referrers: Vec<Referrer>) -> Self {
        Self { entity, referrers }
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        self.entity.validate()?;
        let mut seen = BTreeSet::new();
        for referrer in &self.referrers {
            if referrer.column.is_qualified() {
                return Err(PlanError::QualifiedColumn(referrer.column.to_string()));
            }
            if referrer.table == self.entity.table && referrer.column == self.entity.id_column {
                return Err(PlanError::ReferrerIsEntityId {
                    table: referrer.table.to_string(),
                    column: referrer.column.to_string(),
                });
            }
            if !seen.insert(referrer) {
                return Err(PlanError::DuplicateReferrer {
                    table: referrer.table.to_string(),
                    column: referrer.column.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// One scanned entity row. Key components are the textual rendering of the
/// stored values; `None` is SQL NULL.
///
/// `partition` is the store's own equality class for the key, when the store
/// can compute one. Rows in different partitions never group together, even
/// when their keys render identically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRow {
    pub id: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub key: Vec<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<i64>,
}

impl EntityRow {
    pub fn new(id: i64, created_at: Option<DateTime<Utc>>, key: Vec<Option<String>>) -> Self {
        Self {
            id,
            created_at,
            key,
            partition: None,
        }
    }

    pub fn with_partition(mut self, partition: i64) -> Self {
        self.partition = Some(partition);
        self
    }

    /// The natural key when no component is NULL.
    pub fn complete_key(&self) -> Option<Vec<String>> {
        self.key.iter().cloned().collect()
    }
}

/// Oldest first, NULL timestamps last, then lowest id.
pub fn survivor_order(a: &EntityRow, b: &EntityRow) -> Ordering {
    let by_time = match (a.created_at, b.created_at) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_time.then_with(|| a.id.cmp(&b.id))
}

/// Elects the survivor among `rows`, regardless of their order.
pub fn select_survivor(rows: &[EntityRow]) -> Option<i64> {
    rows.iter().min_by(|a, b| survivor_order(a, b)).map(|row| row.id)
}

/// Rows sharing one complete natural-key value. Always holds at least two
/// members, sorted so the survivor comes first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateGroup {
    key: Vec<String>,
    members: Vec<EntityRow>,
}

impl DuplicateGroup {
    pub fn new(key: Vec<String>, mut members: Vec<EntityRow>) -> Option<Self> {
        if members.len() < 2 {
            return None;
        }
        members.sort_by(survivor_order);
        Some(Self { key, members })
    }

    pub fn key(&self) -> &[String] {
        &self.key
    }

    pub fn members(&self) -> &[EntityRow] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn survivor(&self) -> &EntityRow {
        &self.members[0]
    }

    pub fn losers(&self) -> &[EntityRow] {
        &self.members[1..]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Grouping {
    pub groups: Vec<DuplicateGroup>,
    pub rows_scanned: usize,
    pub null_key_rows: usize,
}

impl Grouping {
    pub fn is_clean(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn loser_count(&self) -> usize {
        self.groups.iter().map(|g| g.len() - 1).sum()
    }
}

/// Partitions rows by natural key, keeping only partitions of two or more.
///
/// Rows with any NULL key component never collide and are only counted.
/// A store-assigned `partition` takes part in the grouping key, so stores
/// whose equality differs from the text rendering (case-insensitive text,
/// numerics with trailing zeros) must hand every member of one class the
/// same rendering and the same partition.
pub fn group_duplicates(rows: impl IntoIterator<Item = EntityRow>) -> Grouping {
    let mut partitions: BTreeMap<(Option<i64>, Vec<String>), Vec<EntityRow>> = BTreeMap::new();
    let mut rows_scanned = 0usize;
    let mut null_key_rows = 0usize;

    for row in rows {
        rows_scanned += 1;
        match row.complete_key() {
            Some(key) => partitions.entry((row.partition, key)).or_default().push(row),
            None => null_key_rows += 1,
        }
    }

    let groups = partitions
        .into_iter()
        .filter_map(|((_, key), members)| DuplicateGroup::new(key, members))
        .collect();

    Grouping {
        groups,
        rows_scanned,
        null_key_rows,
    }
}

/// Transaction-scoped `loser_id -> survivor_id` redirection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsolidationMapping {
    redirects: BTreeMap<i64, i64>,
}

impl ConsolidationMapping {
    pub fn from_groups(groups: &[DuplicateGroup]) -> Self {
        let mut redirects = BTreeMap::new();
        for group in groups {
            let survivor = group.survivor().id;
            for loser in group.losers() {
                redirects.insert(loser.id, survivor);
            }
        }
        Self { redirects }
    }

    pub fn len(&self) -> usize {
        self.redirects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.redirects.is_empty()
    }

    pub fn survivor_for(&self, loser_id: i64) -> Option<i64> {
        self.redirects.get(&loser_id).copied()
    }

    pub fn loser_ids(&self) -> Vec<i64> {
        self.redirects.keys().copied().collect()
    }

    /// Columnar form, convenient for array binds.
    pub fn columns(&self) -> (Vec<i64>, Vec<i64>) {
        self.redirects.iter().map(|(l, s)| (*l, *s)).unzip()
    }

    pub fn iter(&self) -> impl Iterator<Item = (i64, i64)> + '_ {
        self.redirects.iter().map(|(l, s)| (*l, *s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Scanning,
    NoDuplicates,
    Migrating,
    Purging,
    Verifying,
    Committed,
    RolledBack,
    Done,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Scanning => "scanning",
            Phase::NoDuplicates => "no_duplicates",
            Phase::Migrating => "migrating",
            Phase::Purging => "purging",
            Phase::Verifying => "verifying",
            Phase::Committed => "committed",
            Phase::RolledBack => "rolled_back",
            Phase::Done => "done",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Committed | Phase::RolledBack | Phase::Done)
    }

    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Scanning, NoDuplicates)
                | (Scanning, Migrating)
                | (Scanning, RolledBack)
                | (NoDuplicates, Done)
                | (NoDuplicates, RolledBack)
                | (Migrating, Purging)
                | (Migrating, RolledBack)
                | (Purging, Verifying)
                | (Purging, RolledBack)
                | (Verifying, Committed)
                | (Verifying, RolledBack)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid phase transition {from} -> {to}")]
pub struct PhaseTransitionError {
    pub from: Phase,
    pub to: Phase,
}

/// Per-invocation state machine; starts in `Scanning`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunState {
    history: Vec<Phase>,
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

impl RunState {
    pub fn new() -> Self {
        Self {
            history: vec![Phase::Scanning],
        }
    }

    pub fn phase(&self) -> Phase {
        self.history.last().copied().unwrap_or(Phase::Scanning)
    }

    pub fn advance(&mut self, next: Phase) -> Result<Phase, PhaseTransitionError> {
        let from = self.phase();
        if !from.can_transition_to(next) {
            return Err(PhaseTransitionError { from, to: next });
        }
        self.history.push(next);
        Ok(from)
    }

    pub fn history(&self) -> &[Phase] {
        &self.history
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    NoDuplicates,
    Committed,
    DryRun,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferrerReport {
    pub table: String,
    pub column: String,
    pub scanned: u64,
    pub repointed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub key: Vec<String>,
    pub survivor: i64,
    pub losers: Vec<i64>,
}

impl From<&DuplicateGroup> for GroupSummary {
    fn from(group: &DuplicateGroup) -> Self {
        Self {
            key: group.key().to_vec(),
            survivor: group.survivor().id,
            losers: group.losers().iter().map(|row| row.id).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "index", rename_all = "snake_case")]
pub enum GuardOutcome {
    Created(String),
    AlreadyPresent(String),
    /// A left-over invalid index of the same name was dropped and rebuilt.
    Rebuilt(String),
}

impl GuardOutcome {
    pub fn index(&self) -> &str {
        match self {
            GuardOutcome::Created(name)
            | GuardOutcome::AlreadyPresent(name)
            | GuardOutcome::Rebuilt(name) => name,
        }
    }
}

/// How the post-commit unique index install went. A failure here never
/// undoes the committed consolidation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardStatus {
    Installed(GuardOutcome),
    Failed(String),
}

/// Result summary of one consolidation invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationReport {
    pub run_id: Uuid,
    pub entity: String,
    pub outcome: Outcome,
    pub groups_found: usize,
    pub losers: usize,
    pub repointed: u64,
    pub deleted: u64,
    pub rows_scanned: usize,
    pub null_key_rows: usize,
    pub referrers: Vec<ReferrerReport>,
    pub groups: Vec<GroupSummary>,
    pub phases: Vec<Phase>,
    pub attempts: u32,
    /// `None` when no guard ran after the transaction.
    #[serde(default)]
    pub guard: Option<GuardStatus>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ConsolidationReport {
    pub fn is_noop(&self) -> bool {
        self.groups_found == 0 && self.repointed == 0 && self.deleted == 0
    }

    pub fn guard_failed(&self) -> bool {
        matches!(self.guard, Some(GuardStatus::Failed(_)))
    }

    pub fn summary_line(&self) -> String {
        let guard = match &self.guard {
            None => "none",
            Some(GuardStatus::Installed(_)) => "installed",
            Some(GuardStatus::Failed(_)) => "failed",
        };
        format!(
            "{}: outcome={} groups_found={} repointed={} deleted={} null_key_rows={} attempts={} guard={}",
            self.entity,
            serde_outcome(self.outcome),
            self.groups_found,
            self.repointed,
            self.deleted,
            self.null_key_rows,
            self.attempts,
            guard
        )
    }
}

fn serde_outcome(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::NoDuplicates => "no_duplicates",
        Outcome::Committed => "committed",
        Outcome::DryRun => "dry_run",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn ident(s: &str) -> Ident {
        Ident::parse(s).expect("ident")
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("ts")
    }

    fn row(id: i64, key: &str, t: i64) -> EntityRow {
        EntityRow::new(id, Some(ts(t)), vec![Some(key.to_string())])
    }

    fn promo_plan() -> ConsolidationPlan {
        ConsolidationPlan::new(
            EntitySpec::new(ident("promo_codes"), vec![ident("code")]),
            vec![Referrer::new(ident("orders"), ident("promo_code_id"))],
        )
    }

    #[test]
    fn identifiers_are_validated_and_quoted() {
        assert_eq!(ident("public.promo_codes").quoted(), "\"public\".\"promo_codes\"");
        assert_eq!(ident("public.promo_codes").name(), "promo_codes");
        assert_eq!(ident("public.promo_codes").schema(), Some("public"));
        assert_eq!(ident("  code ").as_str(), "code");
        assert!(Ident::parse("").is_err());
        assert!(Ident::parse("1abc").is_err());
        assert!(Ident::parse("a.b.c").is_err());
        assert!(Ident::parse("codes; DROP TABLE x").is_err());
        assert!(Ident::parse("co\"de").is_err());
        assert!(Ident::parse(&"x".repeat(64)).is_err());
    }

    #[test]
    fn plan_deserializes_with_defaults() {
        let plan: ConsolidationPlan = serde_json::from_str(
            r#"{"entity":{"table":"promo_codes","natural_key":["code"]},
                "referrers":[{"table":"orders","column":"promo_code_id"}]}"#,
        )
        .expect("plan");
        assert_eq!(plan.entity.id_column.as_str(), "id");
        assert_eq!(plan.entity.created_at_column.as_str(), "created_at");
        assert!(plan.validate().is_ok());

        let bad = serde_json::from_str::<ConsolidationPlan>(
            r#"{"entity":{"table":"promo codes","natural_key":["code"]},"referrers":[]}"#,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn plan_validation_rejects_bad_configuration() {
        let mut plan = promo_plan();
        plan.entity.natural_key.clear();
        assert!(matches!(plan.validate(), Err(PlanError::EmptyNaturalKey { .. })));

        let mut plan = promo_plan();
        plan.entity.natural_key = vec![ident("code"), ident("code")];
        assert!(matches!(plan.validate(), Err(PlanError::DuplicateKeyColumn { .. })));

        let mut plan = promo_plan();
        plan.entity.natural_key = vec![ident("id")];
        assert!(matches!(plan.validate(), Err(PlanError::KeyIncludesId { .. })));

        let mut plan = promo_plan();
        plan.referrers.push(plan.referrers[0].clone());
        assert!(matches!(plan.validate(), Err(PlanError::DuplicateReferrer { .. })));

        let mut plan = promo_plan();
        plan.referrers.push(Referrer::new(ident("promo_codes"), ident("id")));
        assert!(matches!(plan.validate(), Err(PlanError::ReferrerIsEntityId { .. })));

        let mut plan = promo_plan();
        plan.entity.natural_key = vec![ident("other.code")];
        assert!(matches!(plan.validate(), Err(PlanError::QualifiedColumn(_))));
    }

    #[test]
    fn store_partitions_decide_grouping_over_rendering() {
        // Two rows the store considers equal share one partition and one
        // canonical rendering; a third renders the same but sits apart.
        let rows = vec![
            row(1, "SAVE10", 3).with_partition(1),
            row(2, "SAVE10", 2).with_partition(1),
            row(3, "SAVE10", 1).with_partition(2),
        ];
        let grouping = group_duplicates(rows);
        assert_eq!(grouping.groups.len(), 1);
        let group = &grouping.groups[0];
        assert_eq!(group.survivor().id, 2);
        assert_eq!(group.losers().iter().map(|r| r.id).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn grouping_drops_singletons_and_null_keys() {
        let rows = vec![
            row(1, "A", 10),
            row(2, "A", 5),
            row(3, "B", 1),
            EntityRow::new(4, Some(ts(1)), vec![None]),
            EntityRow::new(5, Some(ts(1)), vec![None]),
        ];
        let grouping = group_duplicates(rows);
        assert_eq!(grouping.rows_scanned, 5);
        assert_eq!(grouping.null_key_rows, 2);
        assert_eq!(grouping.groups.len(), 1);
        assert_eq!(grouping.groups[0].key(), ["A".to_string()]);
        assert_eq!(grouping.loser_count(), 1);
    }

    #[test]
    fn composite_keys_group_on_every_column() {
        let mk = |id, a: &str, b: Option<&str>| {
            EntityRow::new(id, Some(ts(id)), vec![Some(a.to_string()), b.map(str::to_string)])
        };
        let grouping = group_duplicates(vec![
            mk(1, "shop", Some("SAVE10")),
            mk(2, "shop", Some("SAVE10")),
            mk(3, "shop", Some("SAVE20")),
            mk(4, "shop", None),
            mk(5, "shop", None),
        ]);
        assert_eq!(grouping.groups.len(), 1);
        assert_eq!(grouping.groups[0].survivor().id, 1);
        assert_eq!(grouping.null_key_rows, 2);
    }

    #[test]
    fn worked_example_elects_earliest_then_lowest_id() {
        let grouping = group_duplicates(vec![row(1, "A", 10), row(2, "A", 5), row(3, "A", 5)]);
        let group = &grouping.groups[0];
        assert_eq!(group.survivor().id, 2);
        assert_eq!(group.losers().iter().map(|r| r.id).collect::<Vec<_>>(), vec![3, 1]);

        let mapping = ConsolidationMapping::from_groups(&grouping.groups);
        assert_eq!(mapping.len(), 2);
        assert_eq!(mapping.survivor_for(1), Some(2));
        assert_eq!(mapping.survivor_for(3), Some(2));
        assert_eq!(mapping.survivor_for(2), None);
        assert_eq!(mapping.columns(), (vec![1, 3], vec![2, 2]));
    }

    #[test]
    fn null_timestamps_lose_to_dated_rows() {
        let rows = vec![
            EntityRow::new(1, None, vec![Some("A".into())]),
            EntityRow::new(9, Some(ts(100)), vec![Some("A".into())]),
        ];
        assert_eq!(select_survivor(&rows), Some(9));
        assert_eq!(select_survivor(&[]), None);
    }

    #[test]
    fn phase_machine_rejects_skipping_verification() {
        let mut state = RunState::new();
        state.advance(Phase::Migrating).expect("migrate");
        state.advance(Phase::Purging).expect("purge");
        let err = state.advance(Phase::Committed).expect_err("must verify first");
        assert_eq!(err.from, Phase::Purging);
        state.advance(Phase::Verifying).expect("verify");
        state.advance(Phase::Committed).expect("commit");
        assert!(state.phase().is_terminal());
        assert!(state.advance(Phase::RolledBack).is_err());

        let mut clean = RunState::new();
        clean.advance(Phase::NoDuplicates).expect("clean");
        clean.advance(Phase::Done).expect("done");
        assert_eq!(clean.history(), [Phase::Scanning, Phase::NoDuplicates, Phase::Done]);
    }

    proptest! {
        #[test]
        fn survivor_is_independent_of_input_order(
            seeds in proptest::collection::btree_map(1i64..10_000, 0i64..50, 2..20),
            rotate in 0usize..20,
        ) {
            let rows: Vec<EntityRow> = seeds.iter().map(|(id, t)| row(*id, "K", *t)).collect();
            let expected = rows
                .iter()
                .map(|r| (r.created_at, r.id))
                .min()
                .map(|(_, id)| id);

            let mut shuffled = rows.clone();
            shuffled.reverse();
            let len = shuffled.len();
            shuffled.rotate_left(rotate % len);

            prop_assert_eq!(select_survivor(&rows), expected);
            prop_assert_eq!(select_survivor(&shuffled), expected);
            let grouping = group_duplicates(shuffled);
            prop_assert_eq!(Some(grouping.groups[0].survivor().id), expected);
        }

        #[test]
        fn mapping_covers_every_loser_exactly_once(
            keys in proptest::collection::vec(0u8..6, 1..60),
        ) {
            let rows: Vec<EntityRow> = keys
                .iter()
                .enumerate()
                .map(|(i, k)| row(i as i64 + 1, &k.to_string(), 0))
                .collect();
            let grouping = group_duplicates(rows.clone());
            let mapping = ConsolidationMapping::from_groups(&grouping.groups);
            prop_assert_eq!(mapping.len(), grouping.loser_count());
            let survivors: BTreeSet<i64> = grouping.groups.iter().map(|g| g.survivor().id).collect();
            for (loser, survivor) in mapping.iter() {
                prop_assert!(!survivors.contains(&loser));
                prop_assert!(survivors.contains(&survivor));
            }
        }
    }
}
