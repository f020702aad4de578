//! SQLite driver.
//!
//! Statements execute with store-result semantics: the first step binds the
//! accumulated parameters, runs the statement through rusqlite's prepared-
//! statement cache and buffers any rows. The engine-level cache guarantees
//! one `prepare` per SQL text per thread; beneath it, rusqlite's LRU keeps
//! the actual sqlite handle alive between executions.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use db_types::{DbError, DbType, DbValue};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OpenFlags};

use crate::driver::{Dialect, Driver, DriverConnection};

// The id column is a rowid alias; no explicit auto-increment clause needed.
static SQLITE_DIALECT: Dialect = Dialect {
    quote: "\"",
    id_type: "INTEGER",
    autoincrement: "",
    uint64_type: "BIGINT",
    string_type: "TEXT",
    select_last: "SELECT last_insert_rowid()",
};

static MEMORY_DB_IDS: AtomicU64 = AtomicU64::new(1);

pub struct SqliteDriver {
    path: String,
    cache_capacity: usize,
    in_memory: bool,
}

impl SqliteDriver {
    pub fn new(path: &str, cache_capacity: usize) -> Self {
        if path == ":memory:" {
            return Self::in_memory(cache_capacity);
        }

        Self {
            path: path.to_string(),
            cache_capacity,
            in_memory: false,
        }
    }

    /// A process-private in-memory database. All per-thread connections
    /// share one cache, so the driver declares itself single-threaded and
    /// the engine serialises access.
    pub fn in_memory(cache_capacity: usize) -> Self {
        let id = MEMORY_DB_IDS.fetch_add(1, Ordering::Relaxed);

        Self {
            path: format!("file:julea-mem-{id}?mode=memory&cache=shared"),
            cache_capacity,
            in_memory: true,
        }
    }
}

impl Driver for SqliteDriver {
    type Connection = SqliteConnection;

    fn open(&self) -> Result<SqliteConnection, DbError> {
        let conn = if self.in_memory {
            Connection::open_with_flags(
                &self.path,
                OpenFlags::default() | OpenFlags::SQLITE_OPEN_URI,
            )
        } else {
            Connection::open(&self.path)
        }
        .map_err(driver_error)?;

        conn.set_prepared_statement_cache_capacity(self.cache_capacity);
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(driver_error)?;

        if !self.in_memory {
            // Write-ahead log has less write amplification than the
            // rollback journal. The pragma returns a row, so query_row it.
            conn.query_row("PRAGMA journal_mode=WAL", [], |_row| Ok(()))
                .map_err(driver_error)?;
        }

        Ok(SqliteConnection { conn })
    }

    fn dialect(&self) -> &Dialect {
        &SQLITE_DIALECT
    }

    fn single_threaded(&self) -> bool {
        self.in_memory
    }
}

pub struct SqliteConnection {
    conn: Connection,
}

pub struct SqliteStatement {
    sql: String,
    params: Vec<SqlValue>,
    rows: VecDeque<Vec<SqlValue>>,
    current: Option<Vec<SqlValue>>,
    executed: bool,
}

fn driver_error(err: rusqlite::Error) -> DbError {
    let code = match &err {
        rusqlite::Error::SqliteFailure(e, _) => e.extended_code,
        _ => -1,
    };

    DbError::DriverError {
        code,
        text: err.to_string(),
    }
}

fn to_sql_value(value: &DbValue) -> SqlValue {
    match value {
        DbValue::Sint32(v) => SqlValue::Integer(i64::from(*v)),
        DbValue::Uint32(v) => SqlValue::Integer(i64::from(*v)),
        DbValue::Sint64(v) => SqlValue::Integer(*v),
        // Bit-cast; values above i64::MAX come back out the same way.
        DbValue::Uint64(v) => SqlValue::Integer(*v as i64),
        DbValue::Float32(v) => SqlValue::Real(f64::from(*v)),
        DbValue::Float64(v) => SqlValue::Real(*v),
        DbValue::String(v) => SqlValue::Text(v.clone()),
        DbValue::Blob(v) => SqlValue::Blob(v.clone()),
        DbValue::Null => SqlValue::Null,
    }
}

fn from_sql_value(value: &SqlValue, ty: DbType) -> Result<DbValue, DbError> {
    let converted = match (ty, value) {
        (_, SqlValue::Null) => DbValue::Null,
        (DbType::Sint32, SqlValue::Integer(v)) => DbValue::Sint32(*v as i32),
        (DbType::Uint32, SqlValue::Integer(v)) => DbValue::Uint32(*v as u32),
        (DbType::Sint64, SqlValue::Integer(v)) => DbValue::Sint64(*v),
        (DbType::Uint64 | DbType::Id, SqlValue::Integer(v)) => DbValue::Uint64(*v as u64),
        (DbType::Float32, SqlValue::Real(v)) => DbValue::Float32(*v as f32),
        (DbType::Float32, SqlValue::Integer(v)) => DbValue::Float32(*v as f32),
        (DbType::Float64, SqlValue::Real(v)) => DbValue::Float64(*v),
        (DbType::Float64, SqlValue::Integer(v)) => DbValue::Float64(*v as f64),
        (DbType::String, SqlValue::Text(v)) => DbValue::String(v.clone()),
        (DbType::Blob, SqlValue::Blob(v)) => DbValue::Blob(v.clone()),
        _ => return Err(DbError::DbTypeInvalid),
    };

    Ok(converted)
}

impl DriverConnection for SqliteConnection {
    type Statement = SqliteStatement;

    fn prepare(
        &mut self,
        sql: &str,
        _types_in: &[DbType],
        _types_out: &[DbType],
    ) -> Result<SqliteStatement, DbError> {
        // Validates the SQL and warms rusqlite's cache.
        let param_count = {
            let stmt = self.conn.prepare_cached(sql).map_err(driver_error)?;
            stmt.parameter_count()
        };

        Ok(SqliteStatement {
            sql: sql.to_string(),
            params: vec![SqlValue::Null; param_count],
            rows: VecDeque::new(),
            current: None,
            executed: false,
        })
    }

    fn bind_value(
        &mut self,
        stmt: &mut SqliteStatement,
        index: usize,
        value: &DbValue,
    ) -> Result<(), DbError> {
        let slot = stmt
            .params
            .get_mut(index.wrapping_sub(1))
            .ok_or(DbError::VariableNotFound)?;
        *slot = to_sql_value(value);
        Ok(())
    }

    fn bind_null(&mut self, stmt: &mut SqliteStatement, index: usize) -> Result<(), DbError> {
        let slot = stmt
            .params
            .get_mut(index.wrapping_sub(1))
            .ok_or(DbError::VariableNotFound)?;
        *slot = SqlValue::Null;
        Ok(())
    }

    fn step(&mut self, stmt: &mut SqliteStatement) -> Result<bool, DbError> {
        if !stmt.executed {
            let mut prepared = self.conn.prepare_cached(&stmt.sql).map_err(driver_error)?;

            for (i, value) in stmt.params.iter().enumerate() {
                prepared
                    .raw_bind_parameter(i + 1, value)
                    .map_err(driver_error)?;
            }

            let column_count = prepared.column_count();

            if column_count > 0 {
                let mut rows = prepared.raw_query();

                while let Some(row) = rows.next().map_err(driver_error)? {
                    let mut out = Vec::with_capacity(column_count);
                    for index in 0..column_count {
                        out.push(row.get::<usize, SqlValue>(index).map_err(driver_error)?);
                    }
                    stmt.rows.push_back(out);
                }
            } else {
                prepared.raw_execute().map_err(driver_error)?;
            }

            stmt.executed = true;
        }

        match stmt.rows.pop_front() {
            Some(row) => {
                stmt.current = Some(row);
                Ok(true)
            }
            None => {
                stmt.current = None;
                Ok(false)
            }
        }
    }

    fn reset(&mut self, stmt: &mut SqliteStatement) -> Result<(), DbError> {
        for slot in &mut stmt.params {
            *slot = SqlValue::Null;
        }
        stmt.rows.clear();
        stmt.current = None;
        stmt.executed = false;
        Ok(())
    }

    fn column(
        &mut self,
        stmt: &mut SqliteStatement,
        index: usize,
        ty: DbType,
    ) -> Result<DbValue, DbError> {
        let row = stmt
            .current
            .as_ref()
            .ok_or(DbError::IteratorNoMoreElements)?;
        let value = row.get(index).ok_or(DbError::DbTypeInvalid)?;
        from_sql_value(value, ty)
    }

    fn exec(&mut self, sql: &str) -> Result<(), DbError> {
        self.conn.execute_batch(sql).map_err(driver_error)
    }

    fn transaction_start(&mut self) -> Result<(), DbError> {
        self.exec("BEGIN")
    }

    fn transaction_commit(&mut self) -> Result<(), DbError> {
        self.exec("COMMIT")
    }

    fn transaction_abort(&mut self) -> Result<(), DbError> {
        self.exec("ROLLBACK")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bind_step_column_cycle() {
        let driver = SqliteDriver::in_memory(16);
        let mut conn = driver.open().unwrap();

        conn.exec("CREATE TABLE t (a INTEGER, b TEXT)").unwrap();

        let mut insert = conn
            .prepare("INSERT INTO t (a, b) VALUES (?, ?)", &[], &[])
            .unwrap();
        conn.bind_value(&mut insert, 1, &DbValue::Sint32(7)).unwrap();
        conn.bind_value(&mut insert, 2, &DbValue::String("seven".into()))
            .unwrap();
        assert!(!conn.step(&mut insert).unwrap());
        conn.reset(&mut insert).unwrap();

        let mut select = conn
            .prepare("SELECT a, b FROM t WHERE a = ?", &[], &[])
            .unwrap();
        conn.bind_value(&mut select, 1, &DbValue::Sint32(7)).unwrap();
        assert!(conn.step(&mut select).unwrap());
        assert_eq!(
            conn.column(&mut select, 0, DbType::Sint32).unwrap(),
            DbValue::Sint32(7)
        );
        assert_eq!(
            conn.column(&mut select, 1, DbType::String).unwrap(),
            DbValue::String("seven".into())
        );
        assert!(!conn.step(&mut select).unwrap());
    }

    #[test]
    fn uint64_bit_cast_round_trips() {
        let driver = SqliteDriver::in_memory(16);
        let mut conn = driver.open().unwrap();

        conn.exec("CREATE TABLE t (v BIGINT)").unwrap();

        let big = u64::MAX - 1;
        let mut insert = conn.prepare("INSERT INTO t (v) VALUES (?)", &[], &[]).unwrap();
        conn.bind_value(&mut insert, 1, &DbValue::Uint64(big)).unwrap();
        conn.step(&mut insert).unwrap();
        conn.reset(&mut insert).unwrap();

        let mut select = conn.prepare("SELECT v FROM t", &[], &[]).unwrap();
        assert!(conn.step(&mut select).unwrap());
        assert_eq!(
            conn.column(&mut select, 0, DbType::Uint64).unwrap(),
            DbValue::Uint64(big)
        );
    }

    #[test]
    fn out_of_range_bind_position_is_reported() {
        let driver = SqliteDriver::in_memory(16);
        let mut conn = driver.open().unwrap();

        conn.exec("CREATE TABLE t (a INTEGER)").unwrap();
        let mut stmt = conn.prepare("SELECT a FROM t WHERE a = ?", &[], &[]).unwrap();

        assert_eq!(
            conn.bind_value(&mut stmt, 2, &DbValue::Sint32(0)),
            Err(DbError::VariableNotFound)
        );
        assert_eq!(
            conn.bind_null(&mut stmt, 0),
            Err(DbError::VariableNotFound)
        );
    }
}
