use db_types::{DbError, Document};
use semantics::Semantics;

/// Structured data: schema catalogue plus rows matched by selectors.
///
/// A batch maps onto one backend transaction; its semantics descriptor
/// decides how the daemon sizes those transactions.
pub trait DbBackend: Send + Sync {
    fn batch_start(
        &self,
        namespace: &str,
        semantics: Semantics,
    ) -> Result<Box<dyn DbBatch + '_>, DbError>;
}

/// Operations inside one batch. After the first failure the batch is
/// poisoned: every call except `execute` fails with `BatchPoisoned`, and
/// `execute` consumes the stored error.
pub trait DbBatch {
    fn schema_create(&mut self, name: &str, schema: &Document) -> Result<(), DbError>;

    fn schema_get(&mut self, name: &str) -> Result<Document, DbError>;

    fn schema_delete(&mut self, name: &str) -> Result<(), DbError>;

    /// Insert one row, returning its synthetic id.
    fn insert(&mut self, name: &str, entry: &Document) -> Result<u64, DbError>;

    fn update(&mut self, name: &str, selector: &Document, entry: &Document)
        -> Result<(), DbError>;

    fn delete(&mut self, name: &str, selector: &Document) -> Result<(), DbError>;

    fn query<'a>(
        &'a mut self,
        name: &str,
        selector: &Document,
    ) -> Result<Box<dyn DbIterator + 'a>, DbError>;

    /// Commit and release.
    fn execute(self: Box<Self>) -> Result<(), DbError>;

    /// Roll back; the batch stays usable only for `execute` bookkeeping.
    fn abort(&mut self) -> Result<(), DbError>;
}

/// One pass over a query's rows. Exhaustion is `Ok(None)`, not an error.
pub trait DbIterator {
    fn next_row(&mut self) -> Result<Option<Document>, DbError>;
}
