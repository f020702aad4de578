//! Per-thread engine state: the driver connection plus the statement and
//! schema caches that depend on it.
//!
//! Each worker thread lazily constructs its cell on first use; the cell dies
//! with the thread. Cells are keyed by engine instance so independent
//! engines sharing a thread never share a connection.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use db_types::{DbError, DbType};

use crate::driver::{Driver, DriverConnection};

/// A cached field map, ordered as the catalogue returns it: the synthetic
/// `_id` first, then the schema's fields in declaration order.
pub(crate) struct Schema {
    fields: Vec<(String, DbType)>,
}

impl Schema {
    pub fn new(fields: Vec<(String, DbType)>) -> Self {
        Self { fields }
    }

    pub fn get(&self, name: &str) -> Option<DbType> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, ty)| *ty)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, DbType)> {
        self.fields.iter().map(|(name, ty)| (name.as_str(), *ty))
    }
}

/// A cached prepared statement with the maps the engine needs to bind and
/// read it.
///
/// `in_variables_index` maps variable names to 1-based bind positions (used
/// by insert and update; selector binds are positional counts). The index
/// map is `None` for hard-coded statements whose positions are fixed.
/// `out_variables_index` maps output column names to 0-based column indices
/// in a deterministic order so query results can be walked.
pub(crate) struct SqlStatement<S> {
    pub stmt: S,
    pub in_variables_index: Option<HashMap<String, usize>>,
    pub out_variables_index: Option<Vec<(String, usize)>>,
}

pub(crate) struct ThreadVars<C: DriverConnection> {
    pub connection: C,
    pub query_cache: HashMap<String, SqlStatement<C::Statement>>,
    pub schema_cache: HashMap<String, Rc<Schema>>,
}

impl<C: DriverConnection> ThreadVars<C> {
    /// Rewind every cached statement. Invoked when a batch aborts, so no
    /// half-stepped handle leaks into the next batch.
    pub fn reset_all_statements(&mut self) {
        for entry in self.query_cache.values_mut() {
            let _ = self.connection.reset(&mut entry.stmt);
        }
    }
}

thread_local! {
    static THREAD_VARS: RefCell<HashMap<u64, Rc<dyn Any>>> = RefCell::new(HashMap::new());
}

/// Fetch or lazily construct this thread's cell for the given engine.
pub(crate) fn thread_vars<D: Driver>(
    engine_id: u64,
    driver: &D,
) -> Result<Rc<RefCell<ThreadVars<D::Connection>>>, DbError> {
    THREAD_VARS.with(|cell| {
        if let Some(existing) = cell.borrow().get(&engine_id) {
            return existing
                .clone()
                .downcast::<RefCell<ThreadVars<D::Connection>>>()
                .map_err(|_| DbError::ThreadingError);
        }

        let connection = driver.open()?;
        let vars = Rc::new(RefCell::new(ThreadVars {
            connection,
            query_cache: HashMap::new(),
            schema_cache: HashMap::new(),
        }));

        cell.borrow_mut()
            .insert(engine_id, vars.clone() as Rc<dyn Any>);

        Ok(vars)
    })
}
