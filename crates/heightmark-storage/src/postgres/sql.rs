//! SQL used by the `PostgreSQL` checkpoint store.

/// Table holding one checkpoint row per stream identifier.
pub const CHECKPOINT_TABLE: &str = "heightmark_checkpoints";

/// Creates the checkpoint table and its compound `(identifier, height)` index.
#[must_use]
pub fn build_checkpoint_schema_sql() -> &'static str {
    "CREATE TABLE IF NOT EXISTS heightmark_checkpoints (\
     \n    identifier TEXT PRIMARY KEY,\
     \n    height BIGINT NOT NULL,\
     \n    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),\
     \n    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()\
     \n);\
     \nCREATE UNIQUE INDEX IF NOT EXISTS heightmark_checkpoints_identifier_height \
     ON heightmark_checkpoints (identifier, height)"
}

/// Point lookup of a checkpoint row by identifier.
#[must_use]
pub fn build_select_checkpoint_sql() -> &'static str {
    "SELECT identifier, height, created_at, updated_at \
     FROM heightmark_checkpoints WHERE identifier = $1"
}

/// Inserts a checkpoint row unless the identifier already has one.
#[must_use]
pub fn build_insert_checkpoint_sql() -> &'static str {
    "INSERT INTO heightmark_checkpoints (identifier, height) \
     VALUES ($1, $2) \
     ON CONFLICT (identifier) DO NOTHING"
}

/// Advances a checkpoint only if the stored height is below `$2`.
#[must_use]
pub fn build_conditional_update_sql() -> &'static str {
    "UPDATE heightmark_checkpoints SET height = $3, updated_at = NOW() \
     WHERE identifier = $1 AND height < $2"
}

/// Opens a serializable transaction.
pub const BEGIN_SQL: &str = "BEGIN ISOLATION LEVEL SERIALIZABLE";

/// Commits the open transaction.
pub const COMMIT_SQL: &str = "COMMIT";

/// Rolls back the open transaction.
pub const ROLLBACK_SQL: &str = "ROLLBACK";

/// Builds a single-row upsert statement.
///
/// ```sql
/// INSERT INTO blocks (hash, height, parent)
/// VALUES ($1, $2, $3)
/// ON CONFLICT (hash) DO UPDATE SET height = EXCLUDED.height, parent = EXCLUDED.parent
/// ```
///
/// Tables whose columns are all key columns use `DO NOTHING`.
#[must_use]
pub fn build_upsert_sql(table: &str, columns: &[&str], key_columns: &[&str]) -> String {
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${i}")).collect();

    let update_clause: Vec<String> = columns
        .iter()
        .filter(|c| !key_columns.contains(c))
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect();

    let action = if update_clause.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", update_clause.join(", "))
    };

    format!(
        "INSERT INTO {table} ({}) VALUES ({}) ON CONFLICT ({}) {action}",
        columns.join(", "),
        placeholders.join(", "),
        key_columns.join(", "),
    )
}
