use db_types::{DbError, DbType, DbValue};

/// SQL-dialect fragments a DBMS driver supplies at init. The generic engine
/// splices them into every statement it generates and never names a DBMS.
#[derive(Clone, Debug)]
pub struct Dialect {
    /// Identifier quote character.
    pub quote: &'static str,
    /// Column type of the synthetic `_id`.
    pub id_type: &'static str,
    /// Auto-increment clause placed between the id type and `PRIMARY KEY`.
    /// May be empty.
    pub autoincrement: &'static str,
    /// Column type capable of holding an unsigned 64-bit value.
    pub uint64_type: &'static str,
    /// Column type for string fields.
    pub string_type: &'static str,
    /// Query returning the id generated by the last insert.
    pub select_last: &'static str,
}

/// A DBMS-specific driver. `open` is called once per engine thread; the
/// resulting connection, and every statement prepared on it, stays confined
/// to that thread.
pub trait Driver: Send + Sync + 'static {
    type Connection: DriverConnection;

    fn open(&self) -> Result<Self::Connection, DbError>;

    fn dialect(&self) -> &Dialect;

    /// Drivers that cannot cope with concurrent connections force a coarse
    /// engine-wide lock around all entry points.
    fn single_threaded(&self) -> bool {
        false
    }
}

/// One thread's connection. Statements execute with "store result"
/// semantics: the first `step` runs the statement with the bound parameters
/// and buffers its rows; subsequent steps walk the buffer.
pub trait DriverConnection: Send + 'static {
    type Statement;

    fn prepare(
        &mut self,
        sql: &str,
        types_in: &[DbType],
        types_out: &[DbType],
    ) -> Result<Self::Statement, DbError>;

    /// Bind positions are 1-based, matching SQL parameter numbering.
    fn bind_value(
        &mut self,
        stmt: &mut Self::Statement,
        index: usize,
        value: &DbValue,
    ) -> Result<(), DbError>;

    fn bind_null(&mut self, stmt: &mut Self::Statement, index: usize) -> Result<(), DbError>;

    /// Advance to the next result row. `Ok(true)` means columns are
    /// readable; `Ok(false)` means the statement is done.
    fn step(&mut self, stmt: &mut Self::Statement) -> Result<bool, DbError>;

    /// Rewind the statement and clear its bindings so the cached handle can
    /// be executed again.
    fn reset(&mut self, stmt: &mut Self::Statement) -> Result<(), DbError>;

    /// Read column `index` (0-based) of the current row as `ty`.
    fn column(
        &mut self,
        stmt: &mut Self::Statement,
        index: usize,
        ty: DbType,
    ) -> Result<DbValue, DbError>;

    /// Execute statements that are never stepped (DDL).
    fn exec(&mut self, sql: &str) -> Result<(), DbError>;

    fn transaction_start(&mut self) -> Result<(), DbError>;
    fn transaction_commit(&mut self) -> Result<(), DbError>;
    fn transaction_abort(&mut self) -> Result<(), DbError>;
}

/// Run a statement expected to produce no rows, then rewind it.
pub(crate) fn step_and_reset_check_done<C: DriverConnection>(
    connection: &mut C,
    stmt: &mut C::Statement,
) -> Result<(), DbError> {
    let stepped = connection.step(stmt);
    let reset = connection.reset(stmt);
    stepped?;
    reset
}
