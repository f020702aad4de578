//! Schema creation and deletion. DDL cannot nest inside the batch
//! transaction on most databases, so both operations commit the open
//! transaction, run their statements bare, and re-open the transaction
//! before returning.

use db_types::{DbError, DbType, DbValue, Document, INDEX_KEY};

use crate::cache::{SqlStatement, ThreadVars};
use crate::driver::{step_and_reset_check_done, Driver, DriverConnection};
use crate::{BatchState, SqlEngine};

const CATALOGUE_INSERT_SQL: &str =
    "INSERT INTO schema_structure(namespace, name, varname, vartype) VALUES (?, ?, ?, ?)";
const CATALOGUE_DELETE_SQL: &str = "DELETE FROM schema_structure WHERE namespace=? AND name=?";

/// Catalogue type tag of a field: the synthetic id is recorded as uint64.
fn catalogue_tag(ty: DbType) -> u32 {
    match ty {
        DbType::Id => DbType::Uint64 as u32,
        other => other as u32,
    }
}

impl<D: Driver> SqlEngine<D> {
    pub(crate) fn schema_create_impl(
        &self,
        state: &mut BatchState,
        name: &str,
        schema: &Document,
    ) -> Result<(), DbError> {
        let result = self.schema_create_bare(state, name, schema);

        if result.is_err() && !state.open {
            // Keep the batch usable for execute/abort bookkeeping even when
            // the DDL failed outside the transaction.
            let _ = self.tx_start(state);
        }

        result
    }

    fn schema_create_bare(
        &self,
        state: &mut BatchState,
        name: &str,
        schema: &Document,
    ) -> Result<(), DbError> {
        let dialect = self.dialect().clone();
        let quote = dialect.quote;
        let table = self.table(&state.namespace, name);

        // Column list and type mapping, with the index meta-key set aside.
        let mut create_sql = format!(
            "CREATE TABLE {table} ( _id {} {} PRIMARY KEY",
            dialect.id_type, dialect.autoincrement
        );
        let mut fields = Vec::new();

        for (key, value) in schema {
            if key == INDEX_KEY {
                continue;
            }

            let tag = match value {
                bson::Bson::Int32(tag) => *tag as u32,
                bson::Bson::Int64(tag) => *tag as u32,
                _ => return Err(DbError::BsonInvalidType),
            };
            let ty = DbType::try_from(tag)?;

            let column_type = match ty {
                DbType::Sint32 | DbType::Uint32 | DbType::Sint64 | DbType::Id => "INTEGER",
                DbType::Uint64 => dialect.uint64_type,
                DbType::Float32 | DbType::Float64 => "REAL",
                DbType::String => dialect.string_type,
                DbType::Blob => "BLOB",
            };

            create_sql.push_str(&format!(", {quote}{key}{quote} {column_type}"));
            fields.push((key.clone(), ty));
        }

        create_sql.push_str(" )");

        if fields.is_empty() {
            return Err(DbError::SchemaEmpty);
        }

        let indices = db_types::schema_indices_from_document(schema)?;

        tracing::debug!(table = %table, "creating schema");

        // Break out of the batch transaction for the DDL.
        self.tx_commit(state)?;

        {
            let vars = self.vars()?;
            let mut vars = vars.borrow_mut();
            let ThreadVars {
                connection,
                query_cache,
                ..
            } = &mut *vars;

            connection.exec(&create_sql)?;

            for (i, columns) in indices.iter().enumerate() {
                let columns = columns
                    .iter()
                    .map(|column| format!("{quote}{column}{quote}"))
                    .collect::<Vec<_>>()
                    .join(", ");

                connection.exec(&format!(
                    "CREATE INDEX {quote}{}_{name}_{i}{quote} ON {table} ( {columns} )",
                    state.namespace
                ))?;
            }

            if !query_cache.contains_key(CATALOGUE_INSERT_SQL) {
                let stmt = connection.prepare(
                    CATALOGUE_INSERT_SQL,
                    &[
                        DbType::String,
                        DbType::String,
                        DbType::String,
                        DbType::Uint32,
                    ],
                    &[],
                )?;
                query_cache.insert(
                    CATALOGUE_INSERT_SQL.to_string(),
                    SqlStatement {
                        stmt,
                        in_variables_index: None,
                        out_variables_index: None,
                    },
                );
            }

            let entry = query_cache.get_mut(CATALOGUE_INSERT_SQL).unwrap();

            // One catalogue row for the synthetic id, then one per field.
            let mut rows = vec![("_id".to_string(), DbType::Uint64 as u32)];
            rows.extend(
                fields
                    .iter()
                    .map(|(field, ty)| (field.clone(), catalogue_tag(*ty))),
            );

            for (varname, vartype) in rows {
                connection.bind_value(
                    &mut entry.stmt,
                    1,
                    &DbValue::String(state.namespace.clone()),
                )?;
                connection.bind_value(&mut entry.stmt, 2, &DbValue::String(name.to_string()))?;
                connection.bind_value(&mut entry.stmt, 3, &DbValue::String(varname))?;
                connection.bind_value(&mut entry.stmt, 4, &DbValue::Uint32(vartype))?;
                step_and_reset_check_done(connection, &mut entry.stmt)?;
            }
        }

        self.tx_start(state)
    }

    pub(crate) fn schema_delete_impl(
        &self,
        state: &mut BatchState,
        name: &str,
    ) -> Result<(), DbError> {
        let result = self.schema_delete_bare(state, name);

        if result.is_err() && !state.open {
            let _ = self.tx_start(state);
        }

        result
    }

    fn schema_delete_bare(&self, state: &mut BatchState, name: &str) -> Result<(), DbError> {
        let table = self.table(&state.namespace, name);
        let drop_sql = format!("DROP TABLE IF EXISTS {table}");

        tracing::debug!(table = %table, "deleting schema");

        self.tx_commit(state)?;

        {
            let vars = self.vars()?;
            let mut vars = vars.borrow_mut();
            let ThreadVars {
                connection,
                query_cache,
                ..
            } = &mut *vars;

            if !query_cache.contains_key(CATALOGUE_DELETE_SQL) {
                let stmt = connection.prepare(
                    CATALOGUE_DELETE_SQL,
                    &[DbType::String, DbType::String],
                    &[],
                )?;
                query_cache.insert(
                    CATALOGUE_DELETE_SQL.to_string(),
                    SqlStatement {
                        stmt,
                        in_variables_index: None,
                        out_variables_index: None,
                    },
                );
            }

            let entry = query_cache.get_mut(CATALOGUE_DELETE_SQL).unwrap();

            connection.bind_value(
                &mut entry.stmt,
                1,
                &DbValue::String(state.namespace.clone()),
            )?;
            connection.bind_value(&mut entry.stmt, 2, &DbValue::String(name.to_string()))?;
            step_and_reset_check_done(connection, &mut entry.stmt)?;

            connection.exec(&drop_sql)?;
        }

        // The thread's cached field map no longer describes anything.
        self.evict_schema(state, name)?;

        self.tx_start(state)
    }
}
