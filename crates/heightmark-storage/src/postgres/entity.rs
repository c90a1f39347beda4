//! Row types written through [`PostgresTransaction::upsert`](super::PostgresTransaction::upsert).

use tokio_postgres::types::ToSql;

/// A row the caller upserts inside an advance transaction.
///
/// `values` must yield one parameter per entry of `COLUMNS`, in order.
///
/// ```rust,ignore
/// struct Block { hash: String, height: i64 }
///
/// impl Entity for Block {
///     const TABLE: &'static str = "blocks";
///     const KEY_COLUMNS: &'static [&'static str] = &["hash"];
///     const COLUMNS: &'static [&'static str] = &["hash", "height"];
///
///     fn values(&self) -> Vec<&(dyn ToSql + Sync)> {
///         vec![&self.hash, &self.height]
///     }
/// }
/// ```
pub trait Entity: Sync {
    /// Target table.
    const TABLE: &'static str;
    /// Columns forming the conflict target.
    const KEY_COLUMNS: &'static [&'static str];
    /// All written columns, key columns included.
    const COLUMNS: &'static [&'static str];

    /// Parameter values, one per column.
    fn values(&self) -> Vec<&(dyn ToSql + Sync)>;
}
