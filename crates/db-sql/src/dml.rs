//! Row manipulation: insert, update, delete.

use std::collections::HashMap;

use db_types::{value_from_bson, DbError, DbType, DbValue, Document, ID_FIELD, INDEX_KEY};

use crate::cache::{SqlStatement, ThreadVars};
use crate::driver::{step_and_reset_check_done, Driver, DriverConnection};
use crate::{BatchState, SqlEngine};

fn entry_field_count(entry: &Document) -> usize {
    entry.iter().filter(|(key, _)| *key != INDEX_KEY).count()
}

impl<D: Driver> SqlEngine<D> {
    pub(crate) fn insert_impl(
        &self,
        state: &mut BatchState,
        name: &str,
        entry: &Document,
    ) -> Result<u64, DbError> {
        if entry_field_count(entry) == 0 {
            return Err(DbError::NoVariableSet);
        }

        let schema = self.get_schema(state, name)?;
        let quote = self.dialect().quote;
        let select_last = self.dialect().select_last;

        // The insert statement names every schema column; absent fields are
        // bound NULL. Cached under a keyword key so the SQL text need not be
        // rebuilt on a cache hit.
        let cache_key = format!("_insert_{}_{}", state.namespace, name);

        let vars = self.vars()?;
        let mut vars = vars.borrow_mut();
        let ThreadVars {
            connection,
            query_cache,
            ..
        } = &mut *vars;

        if !query_cache.contains_key(select_last) {
            let stmt = connection.prepare(select_last, &[], &[DbType::Uint64])?;
            query_cache.insert(
                select_last.to_string(),
                SqlStatement {
                    stmt,
                    in_variables_index: None,
                    out_variables_index: None,
                },
            );
        }

        if !query_cache.contains_key(&cache_key) {
            let mut columns = String::new();
            let mut placeholders = String::new();
            let mut types_in = Vec::new();
            let mut in_variables = HashMap::new();

            for (field, ty) in schema.iter() {
                if !in_variables.is_empty() {
                    columns.push_str(", ");
                    placeholders.push_str(", ");
                }

                columns.push_str(&format!("{quote}{field}{quote}"));
                placeholders.push('?');
                types_in.push(ty);
                in_variables.insert(field.to_string(), in_variables.len() + 1);
            }

            let sql = format!(
                "INSERT INTO {} ({columns}) VALUES ({placeholders})",
                self.table(&state.namespace, name)
            );

            let stmt = connection.prepare(&sql, &types_in, &[])?;
            query_cache.insert(
                cache_key.clone(),
                SqlStatement {
                    stmt,
                    in_variables_index: Some(in_variables),
                    out_variables_index: None,
                },
            );
        }

        let entry_stmt = query_cache.get_mut(&cache_key).unwrap();
        let in_variables = entry_stmt
            .in_variables_index
            .as_ref()
            .ok_or(DbError::ThreadingError)?;

        for position in 1..=in_variables.len() {
            connection.bind_null(&mut entry_stmt.stmt, position)?;
        }

        let mut bound = 0;

        for (field, raw) in entry {
            if field == INDEX_KEY {
                continue;
            }

            let position = *in_variables
                .get(field.as_str())
                .ok_or(DbError::VariableNotFound)?;
            let ty = schema.get(field).ok_or(DbError::VariableNotFound)?;
            let value = value_from_bson(ty, raw)?;

            connection.bind_value(&mut entry_stmt.stmt, position, &value)?;
            bound += 1;
        }

        if bound == 0 {
            return Err(DbError::NoVariableSet);
        }

        step_and_reset_check_done(connection, &mut entry_stmt.stmt)?;

        // The id the row was assigned.
        let id_stmt = query_cache.get_mut(select_last).unwrap();

        if !connection.step(&mut id_stmt.stmt)? {
            return Err(DbError::IteratorNoMoreElements);
        }

        let id = connection.column(&mut id_stmt.stmt, 0, DbType::Uint64)?;
        connection.reset(&mut id_stmt.stmt)?;

        match id {
            DbValue::Uint64(id) => Ok(id),
            _ => Err(DbError::DbTypeInvalid),
        }
    }

    pub(crate) fn update_impl(
        &self,
        state: &mut BatchState,
        name: &str,
        selector: &Document,
        entry: &Document,
    ) -> Result<(), DbError> {
        // An update that sets nothing touches no rows.
        if entry_field_count(entry) == 0 {
            return Err(DbError::IteratorNoMoreElements);
        }

        // Updates must name their rows; a match-all update is refused.
        if !crate::dql::selector_has_conditions(selector) {
            return Err(DbError::SelectorEmpty);
        }

        let schema = self.get_schema(state, name)?;
        let quote = self.dialect().quote;

        let mut sql = format!("UPDATE {} SET ", self.table(&state.namespace, name));
        let mut types_in = Vec::new();
        let mut in_variables = HashMap::new();

        for (field, _) in entry {
            if field == INDEX_KEY {
                continue;
            }

            if !in_variables.is_empty() {
                sql.push_str(", ");
            }

            let ty = schema.get(field).ok_or(DbError::VariableNotFound)?;
            sql.push_str(&format!("{quote}{field}{quote} = ?"));
            types_in.push(ty);
            in_variables.insert(field.clone(), in_variables.len() + 1);
        }

        sql.push_str(" WHERE _id = ?");
        types_in.push(DbType::Uint64);
        in_variables.insert(ID_FIELD.to_string(), in_variables.len() + 1);

        let ids = self.query_ids(state, name, selector)?;

        let vars = self.vars()?;
        let mut vars = vars.borrow_mut();
        let ThreadVars {
            connection,
            query_cache,
            ..
        } = &mut *vars;

        if !query_cache.contains_key(&sql) {
            let stmt = connection.prepare(&sql, &types_in, &[])?;
            query_cache.insert(
                sql.clone(),
                SqlStatement {
                    stmt,
                    in_variables_index: Some(in_variables),
                    out_variables_index: None,
                },
            );
        }

        let entry_stmt = query_cache.get_mut(&sql).unwrap();
        let in_variables = entry_stmt
            .in_variables_index
            .as_ref()
            .ok_or(DbError::ThreadingError)?;

        let id_position = *in_variables
            .get(ID_FIELD)
            .ok_or(DbError::VariableNotFound)?;

        for id in ids {
            connection.bind_value(&mut entry_stmt.stmt, id_position, &DbValue::Uint64(id))?;

            for (field, raw) in entry {
                if field == INDEX_KEY {
                    continue;
                }

                let position = *in_variables
                    .get(field.as_str())
                    .ok_or(DbError::VariableNotFound)?;
                let ty = schema.get(field).ok_or(DbError::VariableNotFound)?;
                let value = value_from_bson(ty, raw)?;

                connection.bind_value(&mut entry_stmt.stmt, position, &value)?;
            }

            step_and_reset_check_done(connection, &mut entry_stmt.stmt)?;
        }

        Ok(())
    }

    pub(crate) fn delete_impl(
        &self,
        state: &mut BatchState,
        name: &str,
        selector: &Document,
    ) -> Result<(), DbError> {
        let ids = self.query_ids(state, name, selector)?;

        let sql = format!(
            "DELETE FROM {} WHERE _id = ?",
            self.table(&state.namespace, name)
        );

        let vars = self.vars()?;
        let mut vars = vars.borrow_mut();
        let ThreadVars {
            connection,
            query_cache,
            ..
        } = &mut *vars;

        if !query_cache.contains_key(&sql) {
            let stmt = connection.prepare(&sql, &[DbType::Uint64], &[])?;
            query_cache.insert(
                sql.clone(),
                SqlStatement {
                    stmt,
                    in_variables_index: None,
                    out_variables_index: None,
                },
            );
        }

        let entry = query_cache.get_mut(&sql).unwrap();

        for id in ids {
            connection.bind_value(&mut entry.stmt, 1, &DbValue::Uint64(id))?;
            step_and_reset_check_done(connection, &mut entry.stmt)?;
        }

        Ok(())
    }
}
