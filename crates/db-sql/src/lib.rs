//! Generic SQL implementation of the structured-data backend.
//!
//! Everything above a thin DBMS driver lives here: the schema catalogue,
//! per-thread prepared-statement and schema caches, selector compilation to
//! parameterised SQL, and the transaction lifecycle binding a client batch
//! to a backend transaction. Two drivers specialise the engine; the engine
//! itself never names either.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use backend::{DbBackend, DbBatch, DbIterator};
use db_types::{DbError, Document};
use semantics::Semantics;

mod cache;
mod ddl;
mod dml;
mod dql;
mod driver;
mod mysql;
mod sqlite;

pub use driver::{Dialect, Driver, DriverConnection};
pub use mysql::{MysqlConnection, MysqlDriver};
pub use sqlite::{SqliteConnection, SqliteDriver};

use cache::ThreadVars;
use dql::SqlIterator;

static ENGINE_IDS: AtomicU64 = AtomicU64::new(1);

/// The generic engine, parameterised by its driver. One instance backs one
/// daemon; every thread that enters it gets its own driver connection and
/// caches.
pub struct SqlEngine<D: Driver> {
    driver: D,
    id: u64,
    // Present iff the driver declares itself single-threaded; serialises
    // batch_start through execute/abort end-to-end.
    lock: Option<Mutex<()>>,
    // Held for the engine's lifetime: an in-memory database lives only as
    // long as at least one connection to it does.
    _bootstrap: Mutex<D::Connection>,
}

impl<D: Driver> SqlEngine<D> {
    pub fn new(driver: D) -> Result<Self, DbError> {
        let create_catalogue = format!(
            "CREATE TABLE IF NOT EXISTS schema_structure (namespace {0}, name {0}, varname {0}, vartype INTEGER)",
            driver.dialect().string_type
        );

        // A bootstrap connection initialises the catalogue; per-thread
        // connections are opened lazily afterwards.
        let mut connection = driver.open()?;
        connection.exec(&create_catalogue)?;

        let lock = driver.single_threaded().then(|| Mutex::new(()));

        Ok(Self {
            driver,
            id: ENGINE_IDS.fetch_add(1, Ordering::Relaxed),
            lock,
            _bootstrap: Mutex::new(connection),
        })
    }

    pub(crate) fn vars(&self) -> Result<Rc<RefCell<ThreadVars<D::Connection>>>, DbError> {
        cache::thread_vars(self.id, &self.driver)
    }

    pub(crate) fn dialect(&self) -> &Dialect {
        self.driver.dialect()
    }

    /// The quoted table name of `(namespace, name)`.
    pub(crate) fn table(&self, namespace: &str, name: &str) -> String {
        let quote = self.dialect().quote;
        format!("{quote}{namespace}_{name}{quote}")
    }

    // Transaction control. `state` tracks whether this batch currently has
    // an open driver transaction.

    pub(crate) fn tx_start(&self, state: &mut BatchState) -> Result<(), DbError> {
        let vars = self.vars()?;
        vars.borrow_mut().connection.transaction_start()?;
        state.open = true;
        Ok(())
    }

    pub(crate) fn tx_commit(&self, state: &mut BatchState) -> Result<(), DbError> {
        let vars = self.vars()?;
        vars.borrow_mut().connection.transaction_commit()?;
        state.open = false;
        Ok(())
    }

    pub(crate) fn tx_abort(&self, state: &mut BatchState) -> Result<(), DbError> {
        let vars = self.vars()?;
        let mut vars = vars.borrow_mut();

        let result = vars.connection.transaction_abort();

        // No half-stepped handle may leak into the next batch.
        vars.reset_all_statements();

        state.open = false;
        result
    }
}

pub(crate) struct BatchState {
    pub namespace: String,
    pub open: bool,
}

impl<D: Driver> DbBackend for SqlEngine<D> {
    fn batch_start(
        &self,
        namespace: &str,
        semantics: Semantics,
    ) -> Result<Box<dyn DbBatch + '_>, DbError> {
        tracing::debug!(namespace, ?semantics, "starting db batch");

        let guard = self
            .lock
            .as_ref()
            .map(|lock| lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));

        let mut state = BatchState {
            namespace: namespace.to_string(),
            open: false,
        };

        self.tx_start(&mut state)?;

        Ok(Box::new(SqlBatch {
            engine: self,
            state,
            error: None,
            _guard: guard,
        }))
    }
}

/// One client batch bound to one driver transaction. The first failing
/// operation rolls the transaction back and poisons the batch: subsequent
/// operations fail with `BatchPoisoned` and `execute` returns the stored
/// error instead of committing.
struct SqlBatch<'e, D: Driver> {
    engine: &'e SqlEngine<D>,
    state: BatchState,
    error: Option<DbError>,
    _guard: Option<std::sync::MutexGuard<'e, ()>>,
}

impl<'e, D: Driver> SqlBatch<'e, D> {
    fn run<T>(
        &mut self,
        f: impl FnOnce(&SqlEngine<D>, &mut BatchState) -> Result<T, DbError>,
    ) -> Result<T, DbError> {
        if self.error.is_some() {
            return Err(DbError::BatchPoisoned);
        }

        match f(self.engine, &mut self.state) {
            Ok(value) => Ok(value),
            Err(err) => {
                if self.state.open {
                    let _ = self.engine.tx_abort(&mut self.state);
                }
                self.error = Some(err.clone());
                Err(err)
            }
        }
    }
}

impl<'e, D: Driver> DbBatch for SqlBatch<'e, D> {
    fn schema_create(&mut self, name: &str, schema: &Document) -> Result<(), DbError> {
        self.run(|engine, state| engine.schema_create_impl(state, name, schema))
    }

    fn schema_get(&mut self, name: &str) -> Result<Document, DbError> {
        self.run(|engine, state| engine.schema_get_impl(state, name))
    }

    fn schema_delete(&mut self, name: &str) -> Result<(), DbError> {
        self.run(|engine, state| engine.schema_delete_impl(state, name))
    }

    fn insert(&mut self, name: &str, entry: &Document) -> Result<u64, DbError> {
        self.run(|engine, state| engine.insert_impl(state, name, entry))
    }

    fn update(
        &mut self,
        name: &str,
        selector: &Document,
        entry: &Document,
    ) -> Result<(), DbError> {
        self.run(|engine, state| engine.update_impl(state, name, selector, entry))
    }

    fn delete(&mut self, name: &str, selector: &Document) -> Result<(), DbError> {
        self.run(|engine, state| engine.delete_impl(state, name, selector))
    }

    fn query<'a>(
        &'a mut self,
        name: &str,
        selector: &Document,
    ) -> Result<Box<dyn DbIterator + 'a>, DbError> {
        let iterator: SqlIterator<D> =
            self.run(|engine, state| engine.query_impl(state, name, selector))?;
        Ok(Box::new(iterator))
    }

    fn execute(mut self: Box<Self>) -> Result<(), DbError> {
        if let Some(err) = self.error.take() {
            // The transaction is already rolled back; consuming the batch
            // just surfaces what killed it.
            return Err(err);
        }

        self.engine.tx_commit(&mut self.state)
    }

    fn abort(&mut self) -> Result<(), DbError> {
        if self.error.is_some() {
            return Err(DbError::BatchPoisoned);
        }

        let result = if self.state.open {
            self.engine.tx_abort(&mut self.state)
        } else {
            Ok(())
        };

        self.error = Some(DbError::BatchPoisoned);
        result
    }
}

impl<'e, D: Driver> Drop for SqlBatch<'e, D> {
    fn drop(&mut self) {
        // A batch dropped without execute leaves no transaction behind.
        if self.state.open {
            let _ = self.engine.tx_abort(&mut self.state);
        }
    }
}
