//! Account storage: the record types, the `AccountSource` seam consumed by the
//! scheduler, the MySQL adapter and retrying read helpers.

pub mod account;
pub mod mysql;
pub mod paging;

use anyhow::Result;
use futures::future::BoxFuture;

pub use account::{Account, Credential};
pub use mysql::{DatabaseConfig, MySqlAccountSource};
pub use paging::{count_with_retry, read_page_with_retry, DataSourceError, RetryPolicy};

/// Paginated read access plus the single-field update the engine needs.
///
/// Implementations must return pages in a stable order so consecutive offsets
/// neither repeat nor skip records while the table is static.
pub trait AccountSource: Send + Sync + 'static {
    /// Number of accounts currently stored.
    fn count(&self) -> BoxFuture<'_, Result<u64>>;

    fn read_page(&self, offset: u64, limit: u64) -> BoxFuture<'_, Result<Vec<Account>>>;

    /// Writes `proof` for `address`; `true` iff a row changed.
    fn update_proof<'a>(&'a self, address: &'a str, proof: &'a str)
        -> BoxFuture<'a, Result<bool>>;

    /// Releases pooled connections.
    fn close(&self) -> BoxFuture<'_, ()>;
}
