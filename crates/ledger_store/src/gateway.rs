//! Backend-agnostic execution interface.
//!
//! Callers speak one dialect: portable SQL with `?` placeholders for ad-hoc
//! reads, plus table/column/row descriptions for the write primitives. The
//! gateway picks the rule for `(StatementClass, Dialect)` from [`RULES`] and
//! renders it with the matching sea-query builder. There is no fallback: a
//! missing rule or an under-specified statement is a translation error.

use std::collections::VecDeque;
use std::fmt;

use sea_orm::sea_query::{
    Alias, Index, OnConflict, PostgresQueryBuilder, Query, QueryStatementWriter,
    SchemaStatementBuilder, SqliteQueryBuilder, Value as SeaValue, Values,
};
use sea_orm::{ConnectionTrait, DatabaseBackend, QueryResult, Statement};

use permit_ledger_core::{EntityId, LedgerError, LedgerResult};

use crate::db::entity_value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    pub const ALL: [Dialect; 2] = [Dialect::Sqlite, Dialect::Postgres];

    pub fn from_backend(backend: DatabaseBackend) -> LedgerResult<Self> {
        match backend {
            DatabaseBackend::Sqlite => Ok(Self::Sqlite),
            DatabaseBackend::Postgres => Ok(Self::Postgres),
            other => Err(LedgerError::translation(format!(
                "no dialect for backend {other:?}"
            ))),
        }
    }

    pub fn backend(self) -> DatabaseBackend {
        match self {
            Self::Sqlite => DatabaseBackend::Sqlite,
            Self::Postgres => DatabaseBackend::Postgres,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatementClass {
    Query,
    Upsert,
    InsertIfAbsent,
    BatchInsert,
    CreateUniqueIndex,
}

impl StatementClass {
    pub const ALL: [StatementClass; 5] = [
        StatementClass::Query,
        StatementClass::Upsert,
        StatementClass::InsertIfAbsent,
        StatementClass::BatchInsert,
        StatementClass::CreateUniqueIndex,
    ];
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placeholders {
    /// `?` passed through unchanged.
    Positional,
    /// `?` rewritten to `$1`, `$2`, ...
    Numbered,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictAction {
    None,
    /// `ON CONFLICT (keys) DO UPDATE SET <non-key> = excluded.<non-key>`
    UpdateNonKey,
    /// `ON CONFLICT (keys) DO NOTHING`
    DoNothing,
    /// Chosen per call by [`DuplicatePolicy`].
    ByPolicy,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TranslationRule {
    pub class: StatementClass,
    pub dialect: Dialect,
    pub placeholders: Placeholders,
    pub conflict: ConflictAction,
    pub requires_keys: bool,
    pub if_not_exists: bool,
}

const fn rule(
    class: StatementClass,
    dialect: Dialect,
    conflict: ConflictAction,
    requires_keys: bool,
) -> TranslationRule {
    TranslationRule {
        class,
        dialect,
        placeholders: match dialect {
            Dialect::Sqlite => Placeholders::Positional,
            Dialect::Postgres => Placeholders::Numbered,
        },
        conflict,
        requires_keys,
        if_not_exists: matches!(class, StatementClass::CreateUniqueIndex),
    }
}

pub static RULES: &[TranslationRule] = &[
    rule(StatementClass::Query, Dialect::Sqlite, ConflictAction::None, false),
    rule(StatementClass::Query, Dialect::Postgres, ConflictAction::None, false),
    rule(StatementClass::Upsert, Dialect::Sqlite, ConflictAction::UpdateNonKey, true),
    rule(StatementClass::Upsert, Dialect::Postgres, ConflictAction::UpdateNonKey, true),
    rule(StatementClass::InsertIfAbsent, Dialect::Sqlite, ConflictAction::DoNothing, true),
    rule(StatementClass::InsertIfAbsent, Dialect::Postgres, ConflictAction::DoNothing, true),
    rule(StatementClass::BatchInsert, Dialect::Sqlite, ConflictAction::ByPolicy, false),
    rule(StatementClass::BatchInsert, Dialect::Postgres, ConflictAction::ByPolicy, false),
    rule(StatementClass::CreateUniqueIndex, Dialect::Sqlite, ConflictAction::None, true),
    rule(StatementClass::CreateUniqueIndex, Dialect::Postgres, ConflictAction::None, true),
];

pub fn rule_for(class: StatementClass, dialect: Dialect) -> LedgerResult<&'static TranslationRule> {
    rule_in(RULES, class, dialect)
}

fn rule_in(
    rules: &'static [TranslationRule],
    class: StatementClass,
    dialect: Dialect,
) -> LedgerResult<&'static TranslationRule> {
    rules
        .iter()
        .find(|rule| rule.class == class && rule.dialect == dialect)
        .ok_or_else(|| {
            LedgerError::translation(format!("no translation rule for {class:?} on {dialect}"))
        })
}

/// What a batch insert does when a row collides with an existing key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Surface the constraint violation.
    Reject,
    /// Keep the stored row.
    Skip,
    /// Overwrite non-key columns.
    Update,
}

/// Column/value pairs for one row, in insertion order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, SeaValue)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, column: impl Into<String>, value: impl Into<SeaValue>) -> Self {
        let column = column.into();
        let value = value.into();
        match self.columns.iter_mut().find(|(name, _)| *name == column) {
            Some(slot) => slot.1 = value,
            None => self.columns.push((column, value)),
        }
        self
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &SeaValue> {
        self.columns.iter().map(|(_, value)| value)
    }

    pub fn get(&self, column: &str) -> Option<&SeaValue> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Rows of one executed query. Owns its results, so it stays positioned after
/// the connection that produced it has been returned to the pool.
#[derive(Default)]
pub struct Cursor {
    rows: VecDeque<QueryResult>,
    fetched: usize,
}

impl Cursor {
    fn new(rows: Vec<QueryResult>) -> Self {
        Self {
            rows: rows.into(),
            fetched: 0,
        }
    }

    pub fn fetch_one(&mut self) -> Option<QueryResult> {
        let row = self.rows.pop_front();
        if row.is_some() {
            self.fetched += 1;
        }
        row
    }

    pub fn fetch_many(&mut self, count: usize) -> Vec<QueryResult> {
        let take = count.min(self.rows.len());
        self.fetched += take;
        self.rows.drain(..take).collect()
    }

    pub fn fetch_all(&mut self) -> Vec<QueryResult> {
        self.fetched += self.rows.len();
        self.rows.drain(..).collect()
    }

    pub fn remaining(&self) -> usize {
        self.rows.len()
    }

    pub fn position(&self) -> usize {
        self.fetched
    }

    pub fn is_exhausted(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Rewrites `?` placeholders for the target dialect, leaving quoted text alone.
pub fn translate_placeholders(sql: &str, placeholders: Placeholders) -> String {
    if placeholders == Placeholders::Positional {
        return sql.to_string();
    }
    let mut out = String::with_capacity(sql.len() + 8);
    let mut quote: Option<char> = None;
    let mut index = 0usize;
    for ch in sql.chars() {
        match quote {
            Some(open) => {
                if ch == open {
                    quote = None;
                }
                out.push(ch);
            }
            None => match ch {
                '\'' | '"' => {
                    quote = Some(ch);
                    out.push(ch);
                }
                '?' => {
                    index += 1;
                    out.push('$');
                    out.push_str(&index.to_string());
                }
                _ => out.push(ch),
            },
        }
    }
    out
}

/// Renders a typed sea-query statement for the dialect.
pub fn build_stmt<S: QueryStatementWriter>(dialect: Dialect, stmt: &S) -> (String, Values) {
    match dialect {
        Dialect::Sqlite => stmt.build(SqliteQueryBuilder),
        Dialect::Postgres => stmt.build(PostgresQueryBuilder),
    }
}

fn build_schema<S: SchemaStatementBuilder>(dialect: Dialect, stmt: &S) -> String {
    match dialect {
        Dialect::Sqlite => stmt.build(SqliteQueryBuilder),
        Dialect::Postgres => stmt.build(PostgresQueryBuilder),
    }
}

pub async fn exec<C, S>(conn: &C, stmt: &S) -> LedgerResult<u64>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let dialect = Dialect::from_backend(conn.get_database_backend())?;
    let (sql, values) = build_stmt(dialect, stmt);
    let result = conn
        .execute_raw(Statement::from_sql_and_values(dialect.backend(), sql, values))
        .await?;
    Ok(result.rows_affected())
}

pub async fn query_all<C, S>(conn: &C, stmt: &S) -> LedgerResult<Vec<QueryResult>>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let dialect = Dialect::from_backend(conn.get_database_backend())?;
    let (sql, values) = build_stmt(dialect, stmt);
    let rows = conn
        .query_all_raw(Statement::from_sql_and_values(dialect.backend(), sql, values))
        .await?;
    Ok(rows)
}

pub async fn query_one<C, S>(conn: &C, stmt: &S) -> LedgerResult<Option<QueryResult>>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let dialect = Dialect::from_backend(conn.get_database_backend())?;
    let (sql, values) = build_stmt(dialect, stmt);
    let row = conn
        .query_one_raw(Statement::from_sql_and_values(dialect.backend(), sql, values))
        .await?;
    Ok(row)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Gateway {
    dialect: Dialect,
}

impl Gateway {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    pub fn for_backend(backend: DatabaseBackend) -> LedgerResult<Self> {
        Dialect::from_backend(backend).map(Self::new)
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn backend(&self) -> DatabaseBackend {
        self.dialect.backend()
    }

    pub fn entity_value(&self, entity_id: EntityId) -> SeaValue {
        entity_value(self.backend(), entity_id)
    }

    fn rule(&self, class: StatementClass) -> LedgerResult<&'static TranslationRule> {
        rule_for(class, self.dialect)
    }

    fn statement(&self, sql: String, values: Values) -> Statement {
        Statement::from_sql_and_values(self.backend(), sql, values)
    }

    /// Renders portable SQL for this dialect.
    pub fn translate(&self, sql: &str) -> LedgerResult<String> {
        let rule = self.rule(StatementClass::Query)?;
        Ok(translate_placeholders(sql, rule.placeholders))
    }

    /// Runs a portable query and returns a cursor over its rows.
    pub async fn execute<C: ConnectionTrait>(
        &self,
        conn: &C,
        sql: &str,
        params: Vec<SeaValue>,
    ) -> LedgerResult<Cursor> {
        let sql = self.translate(sql)?;
        let rows = conn
            .query_all_raw(self.statement(sql, Values(params)))
            .await?;
        Ok(Cursor::new(rows))
    }

    /// Runs a portable write statement and returns the affected row count.
    pub async fn execute_write<C: ConnectionTrait>(
        &self,
        conn: &C,
        sql: &str,
        params: Vec<SeaValue>,
    ) -> LedgerResult<u64> {
        let sql = self.translate(sql)?;
        let result = conn.execute_raw(self.statement(sql, Values(params))).await?;
        Ok(result.rows_affected())
    }

    pub fn upsert_sql(
        &self,
        table: &str,
        key_columns: &[&str],
        row: &Row,
    ) -> LedgerResult<(String, Values)> {
        let rule = self.rule(StatementClass::Upsert)?;
        self.render_insert(rule, table, key_columns, std::slice::from_ref(row), rule.conflict)
    }

    pub fn insert_if_absent_sql(
        &self,
        table: &str,
        key_columns: &[&str],
        row: &Row,
    ) -> LedgerResult<(String, Values)> {
        let rule = self.rule(StatementClass::InsertIfAbsent)?;
        self.render_insert(rule, table, key_columns, std::slice::from_ref(row), rule.conflict)
    }

    pub fn batch_insert_sql(
        &self,
        table: &str,
        key_columns: &[&str],
        rows: &[Row],
        policy: DuplicatePolicy,
    ) -> LedgerResult<(String, Values)> {
        let rule = self.rule(StatementClass::BatchInsert)?;
        let conflict = match (rule.conflict, policy) {
            (ConflictAction::ByPolicy, DuplicatePolicy::Reject) => ConflictAction::None,
            (ConflictAction::ByPolicy, DuplicatePolicy::Skip) => ConflictAction::DoNothing,
            (ConflictAction::ByPolicy, DuplicatePolicy::Update) => ConflictAction::UpdateNonKey,
            (fixed, _) => fixed,
        };
        self.render_insert(rule, table, key_columns, rows, conflict)
    }

    pub fn create_unique_index_sql(
        &self,
        name: &str,
        table: &str,
        columns: &[&str],
    ) -> LedgerResult<String> {
        let rule = self.rule(StatementClass::CreateUniqueIndex)?;
        if rule.requires_keys && columns.is_empty() {
            return Err(LedgerError::translation(format!(
                "unique index {name} on {table} names no columns"
            )));
        }
        let mut index = Index::create();
        index.name(name).table(Alias::new(table)).unique();
        if rule.if_not_exists {
            index.if_not_exists();
        }
        for column in columns {
            index.col(Alias::new(*column));
        }
        Ok(build_schema(self.dialect, &index))
    }

    /// Insert-or-update on the key columns. Re-running with the same row is a no-op.
    pub async fn upsert<C: ConnectionTrait>(
        &self,
        conn: &C,
        table: &str,
        key_columns: &[&str],
        row: &Row,
    ) -> LedgerResult<()> {
        let (sql, values) = self.upsert_sql(table, key_columns, row)?;
        conn.execute_raw(self.statement(sql, values)).await?;
        Ok(())
    }

    /// Inserts unless a row with the same key exists. Returns whether a row was written.
    pub async fn insert_if_absent<C: ConnectionTrait>(
        &self,
        conn: &C,
        table: &str,
        key_columns: &[&str],
        row: &Row,
    ) -> LedgerResult<bool> {
        let (sql, values) = self.insert_if_absent_sql(table, key_columns, row)?;
        let result = conn.execute_raw(self.statement(sql, values)).await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn batch_insert<C: ConnectionTrait>(
        &self,
        conn: &C,
        table: &str,
        key_columns: &[&str],
        rows: &[Row],
        policy: DuplicatePolicy,
    ) -> LedgerResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let (sql, values) = self.batch_insert_sql(table, key_columns, rows, policy)?;
        let result = conn.execute_raw(self.statement(sql, values)).await?;
        Ok(result.rows_affected())
    }

    pub async fn create_unique_index<C: ConnectionTrait>(
        &self,
        conn: &C,
        name: &str,
        table: &str,
        columns: &[&str],
    ) -> LedgerResult<()> {
        let sql = self.create_unique_index_sql(name, table, columns)?;
        conn.execute_raw(Statement::from_string(self.backend(), sql))
            .await?;
        Ok(())
    }

    fn render_insert(
        &self,
        rule: &TranslationRule,
        table: &str,
        key_columns: &[&str],
        rows: &[Row],
        conflict: ConflictAction,
    ) -> LedgerResult<(String, Values)> {
        let Some(first) = rows.first() else {
            return Err(LedgerError::translation(format!(
                "{:?} into {table} has no rows",
                rule.class
            )));
        };
        if first.is_empty() {
            return Err(LedgerError::translation(format!(
                "{:?} into {table} has no columns",
                rule.class
            )));
        }
        let needs_keys = rule.requires_keys || conflict != ConflictAction::None;
        if needs_keys && key_columns.is_empty() {
            return Err(LedgerError::translation(format!(
                "{:?} into {table} requires key columns",
                rule.class
            )));
        }
        let columns: Vec<&str> = first.columns().collect();
        if let Some(missing) = key_columns.iter().find(|key| !columns.contains(key)) {
            return Err(LedgerError::translation(format!(
                "key column {missing} is not part of the row for {table}"
            )));
        }

        let mut insert = Query::insert();
        insert
            .into_table(Alias::new(table))
            .columns(columns.iter().map(|column| Alias::new(*column)));
        for row in rows {
            let row_columns: Vec<&str> = row.columns().collect();
            if row_columns != columns {
                return Err(LedgerError::translation(format!(
                    "rows for {table} disagree on their columns"
                )));
            }
            insert
                .values(row.values().cloned().map(Into::into))
                .map_err(|err| LedgerError::translation(err.to_string()))?;
        }

        let update_columns: Vec<&str> = columns
            .iter()
            .copied()
            .filter(|column| !key_columns.contains(column))
            .collect();
        let keys = key_columns.iter().map(|key| Alias::new(*key));
        match conflict {
            ConflictAction::None => {}
            ConflictAction::DoNothing => {
                insert.on_conflict(OnConflict::columns(keys).do_nothing().to_owned());
            }
            ConflictAction::UpdateNonKey if update_columns.is_empty() => {
                insert.on_conflict(OnConflict::columns(keys).do_nothing().to_owned());
            }
            ConflictAction::UpdateNonKey => {
                insert.on_conflict(
                    OnConflict::columns(keys)
                        .update_columns(update_columns.iter().map(|column| Alias::new(*column)))
                        .to_owned(),
                );
            }
            ConflictAction::ByPolicy => {
                return Err(LedgerError::translation(format!(
                    "{:?} conflict policy was not resolved",
                    rule.class
                )));
            }
        }
        Ok(build_stmt(self.dialect, &insert))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact_row() -> Row {
        Row::new()
            .set("source_table", "electrical")
            .set("source_record_id", "E-100")
            .set("role", "contractor")
            .set("raw_name", "Acme Electric")
    }

    const KEYS: [&str; 3] = ["source_table", "source_record_id", "role"];

    #[test]
    fn every_class_has_exactly_one_rule_per_dialect() {
        for class in StatementClass::ALL {
            for dialect in Dialect::ALL {
                let matching = RULES
                    .iter()
                    .filter(|rule| rule.class == class && rule.dialect == dialect)
                    .count();
                assert_eq!(matching, 1, "{class:?} on {dialect}");
            }
        }
        assert_eq!(RULES.len(), StatementClass::ALL.len() * Dialect::ALL.len());
    }

    #[test]
    fn missing_rule_is_a_translation_error() {
        static PARTIAL: &[TranslationRule] = &[rule(
            StatementClass::Query,
            Dialect::Sqlite,
            ConflictAction::None,
            false,
        )];
        let err = rule_in(PARTIAL, StatementClass::Upsert, Dialect::Postgres)
            .expect_err("missing rule");
        assert!(matches!(err, LedgerError::Translation { .. }));
    }

    #[test]
    fn unknown_backend_has_no_dialect() {
        let err = Dialect::from_backend(DatabaseBackend::MySql).expect_err("mysql");
        assert!(matches!(err, LedgerError::Translation { .. }));
    }

    #[test]
    fn placeholders_are_numbered_for_postgres_only() {
        let sql = "SELECT * FROM raw_contacts WHERE source_table = ? AND raw_name <> '?' AND role = ?";
        assert_eq!(translate_placeholders(sql, Placeholders::Positional), sql);
        assert_eq!(
            translate_placeholders(sql, Placeholders::Numbered),
            "SELECT * FROM raw_contacts WHERE source_table = $1 AND raw_name <> '?' AND role = $2"
        );
        assert_eq!(
            translate_placeholders(r#"SELECT "a?b" FROM t WHERE x = ?"#, Placeholders::Numbered),
            r#"SELECT "a?b" FROM t WHERE x = $1"#
        );
    }

    #[test]
    fn upsert_uses_explicit_conflict_target_on_both_backends() {
        for dialect in Dialect::ALL {
            let (sql, values) = Gateway::new(dialect)
                .upsert_sql("raw_contacts", &KEYS, &contact_row())
                .expect("upsert sql");
            assert!(
                sql.contains(r#"ON CONFLICT ("source_table", "source_record_id", "role")"#),
                "{dialect}: {sql}"
            );
            assert!(sql.contains("DO UPDATE SET"), "{dialect}: {sql}");
            assert!(sql.to_lowercase().contains("excluded"), "{dialect}: {sql}");
            assert!(!sql.contains("REPLACE"), "{dialect}: {sql}");
            assert_eq!(values.0.len(), 4);
        }
        let (pg, _) = Gateway::new(Dialect::Postgres)
            .upsert_sql("raw_contacts", &KEYS, &contact_row())
            .expect("pg");
        assert!(pg.contains("$4"));
        let (lite, _) = Gateway::new(Dialect::Sqlite)
            .upsert_sql("raw_contacts", &KEYS, &contact_row())
            .expect("sqlite");
        assert!(lite.contains('?') && !lite.contains('$'));
    }

    #[test]
    fn upsert_without_keys_never_degrades_to_plain_insert() {
        for dialect in Dialect::ALL {
            let err = Gateway::new(dialect)
                .upsert_sql("raw_contacts", &[], &contact_row())
                .expect_err("keys required");
            assert!(matches!(err, LedgerError::Translation { .. }));
        }
    }

    #[test]
    fn key_columns_must_be_part_of_the_row() {
        let err = Gateway::new(Dialect::Sqlite)
            .upsert_sql("raw_contacts", &["entity_id"], &contact_row())
            .expect_err("unknown key");
        assert!(matches!(err, LedgerError::Translation { .. }));
    }

    #[test]
    fn insert_if_absent_does_nothing_on_conflict() {
        for dialect in Dialect::ALL {
            let (sql, _) = Gateway::new(dialect)
                .insert_if_absent_sql("raw_contacts", &KEYS, &contact_row())
                .expect("sql");
            assert!(sql.contains("DO NOTHING"), "{dialect}: {sql}");
        }
    }

    #[test]
    fn batch_insert_follows_duplicate_policy() {
        let gateway = Gateway::new(Dialect::Postgres);
        let rows = vec![contact_row(), contact_row().set("source_record_id", "E-101")];
        let (reject, values) = gateway
            .batch_insert_sql("raw_contacts", &[], &rows, DuplicatePolicy::Reject)
            .expect("reject");
        assert!(!reject.contains("ON CONFLICT"));
        assert_eq!(values.0.len(), 8);
        let (skip, _) = gateway
            .batch_insert_sql("raw_contacts", &KEYS, &rows, DuplicatePolicy::Skip)
            .expect("skip");
        assert!(skip.contains("DO NOTHING"));
        let (update, _) = gateway
            .batch_insert_sql("raw_contacts", &KEYS, &rows, DuplicatePolicy::Update)
            .expect("update");
        assert!(update.contains("DO UPDATE"));
        let err = gateway
            .batch_insert_sql("raw_contacts", &[], &rows, DuplicatePolicy::Skip)
            .expect_err("skip needs keys");
        assert!(matches!(err, LedgerError::Translation { .. }));
    }

    #[test]
    fn batch_rows_must_share_columns() {
        let rows = vec![contact_row(), Row::new().set("source_table", "building")];
        let err = Gateway::new(Dialect::Sqlite)
            .batch_insert_sql("raw_contacts", &[], &rows, DuplicatePolicy::Reject)
            .expect_err("mismatch");
        assert!(matches!(err, LedgerError::Translation { .. }));
    }

    #[test]
    fn unique_index_is_guarded_by_existence_check() {
        for dialect in Dialect::ALL {
            let sql = Gateway::new(dialect)
                .create_unique_index_sql(
                    "entities_normalized_license_uq",
                    "entities",
                    &["normalized_license"],
                )
                .expect("index sql");
            assert!(sql.contains("CREATE UNIQUE INDEX IF NOT EXISTS"), "{dialect}: {sql}");
        }
        let err = Gateway::new(Dialect::Sqlite)
            .create_unique_index_sql("empty_uq", "entities", &[])
            .expect_err("columns required");
        assert!(matches!(err, LedgerError::Translation { .. }));
    }

    #[test]
    fn row_set_replaces_existing_column() {
        let row = Row::new().set("raw_name", "a").set("raw_name", "b");
        assert_eq!(row.columns().count(), 1);
        assert_eq!(row.get("raw_name"), Some(&SeaValue::from("b")));
    }
}
