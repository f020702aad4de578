//! Query side of the engine: the schema catalogue reads, selector
//! compilation, and the query pipeline.

use std::cell::RefCell;
use std::rc::Rc;

use backend::DbIterator;
use bson::{Bson, Document};
use db_types::{
    value_from_bson, value_to_bson, Comparator, DbError, DbType, DbValue, SelectorMode, ID_FIELD,
    MODE_KEY, NAME_KEY, OPERATOR_KEY, VALUE_KEY,
};

use crate::cache::{Schema, SqlStatement, ThreadVars};
use crate::driver::{Driver, DriverConnection};
use crate::{BatchState, SqlEngine};

const CATALOGUE_QUERY_SQL: &str =
    "SELECT varname, vartype FROM schema_structure WHERE namespace=? AND name=?";

fn comparator_symbol(comparator: Comparator) -> &'static str {
    match comparator {
        Comparator::Lt => "<",
        Comparator::Le => "<=",
        Comparator::Gt => ">",
        Comparator::Ge => ">=",
        Comparator::Eq => "=",
        Comparator::Ne => "!=",
    }
}

pub(crate) fn doc_get_u32(doc: &Document, key: &str) -> Result<u32, DbError> {
    match doc.get(key) {
        Some(Bson::Int32(v)) => Ok(*v as u32),
        Some(Bson::Int64(v)) => Ok(*v as u32),
        _ => Err(DbError::BsonInvalidType),
    }
}

/// A selector document carries conditions iff it holds more than the bare
/// `_mode` tag; anything smaller means match-all.
pub(crate) fn selector_has_conditions(selector: &Document) -> bool {
    selector.len() >= 2
}

pub(crate) fn selector_mode(selector: &Document) -> Result<SelectorMode, DbError> {
    SelectorMode::try_from(doc_get_u32(selector, MODE_KEY)?)
}

/// First walk: emit the parenthesised WHERE fragment and record the bind
/// parameter types in left-to-right tree order.
pub(crate) fn build_selector_query(
    quote: &str,
    schema: &Schema,
    selector: &Document,
    mode: SelectorMode,
    sql: &mut String,
    types_in: &mut Vec<DbType>,
) -> Result<(), DbError> {
    let mut first = true;

    sql.push_str("( ");

    for (key, value) in selector {
        if key == MODE_KEY {
            continue;
        }

        let Bson::Document(child) = value else {
            return Err(DbError::BsonInvalidType);
        };

        if !first {
            sql.push_str(match mode {
                SelectorMode::And => " AND ",
                SelectorMode::Or => " OR ",
            });
        }

        first = false;

        if child.contains_key(MODE_KEY) {
            let child_mode = selector_mode(child)?;
            build_selector_query(quote, schema, child, child_mode, sql, types_in)?;
        } else {
            let Some(Bson::String(field)) = child.get(NAME_KEY) else {
                return Err(DbError::BsonInvalidType);
            };

            let ty = schema.get(field).ok_or(DbError::VariableNotFound)?;
            let comparator = Comparator::try_from(doc_get_u32(child, OPERATOR_KEY)?)?;

            sql.push_str(&format!(
                "{quote}{field}{quote} {} ?",
                comparator_symbol(comparator)
            ));
            types_in.push(ty);
        }
    }

    sql.push_str(" )");

    if first {
        return Err(DbError::SelectorEmpty);
    }

    Ok(())
}

/// Second walk: feed leaf values into the prepared statement in the same
/// left-to-right order the first walk declared them.
pub(crate) fn bind_selector_query<C: DriverConnection>(
    connection: &mut C,
    stmt: &mut C::Statement,
    schema: &Schema,
    selector: &Document,
    position: &mut usize,
) -> Result<(), DbError> {
    for (key, value) in selector {
        if key == MODE_KEY {
            continue;
        }

        let Bson::Document(child) = value else {
            return Err(DbError::BsonInvalidType);
        };

        if child.contains_key(MODE_KEY) {
            bind_selector_query(connection, stmt, schema, child, position)?;
        } else {
            let Some(Bson::String(field)) = child.get(NAME_KEY) else {
                return Err(DbError::BsonInvalidType);
            };

            let ty = schema.get(field).ok_or(DbError::VariableNotFound)?;
            let raw = child.get(VALUE_KEY).ok_or(DbError::BsonInvalidType)?;
            let value = value_from_bson(ty, raw)?;

            *position += 1;
            connection.bind_value(stmt, *position, &value)?;
        }
    }

    Ok(())
}

impl<D: Driver> SqlEngine<D> {
    /// Read a schema out of the catalogue as a document (the client-facing
    /// shape): field name mapped to type tag, `_id` included.
    pub(crate) fn schema_get_impl(
        &self,
        state: &BatchState,
        name: &str,
    ) -> Result<Document, DbError> {
        let vars = self.vars()?;
        let mut vars = vars.borrow_mut();
        let ThreadVars {
            connection,
            query_cache,
            ..
        } = &mut *vars;

        if !query_cache.contains_key(CATALOGUE_QUERY_SQL) {
            let stmt = connection.prepare(
                CATALOGUE_QUERY_SQL,
                &[DbType::String, DbType::String],
                &[DbType::String, DbType::Uint32],
            )?;
            query_cache.insert(
                CATALOGUE_QUERY_SQL.to_string(),
                SqlStatement {
                    stmt,
                    in_variables_index: None,
                    out_variables_index: None,
                },
            );
        }

        let entry = query_cache.get_mut(CATALOGUE_QUERY_SQL).unwrap();

        connection.bind_value(
            &mut entry.stmt,
            1,
            &DbValue::String(state.namespace.clone()),
        )?;
        connection.bind_value(&mut entry.stmt, 2, &DbValue::String(name.to_string()))?;

        let mut doc = Document::new();
        let mut found = false;

        loop {
            match connection.step(&mut entry.stmt) {
                Ok(true) => (),
                Ok(false) => break,
                Err(err) => {
                    let _ = connection.reset(&mut entry.stmt);
                    return Err(err);
                }
            }

            found = true;

            let varname = connection.column(&mut entry.stmt, 0, DbType::String)?;
            let vartype = connection.column(&mut entry.stmt, 1, DbType::Uint32)?;

            let (DbValue::String(varname), DbValue::Uint32(vartype)) = (varname, vartype) else {
                let _ = connection.reset(&mut entry.stmt);
                return Err(DbError::DbTypeInvalid);
            };

            doc.insert(varname, Bson::Int32(vartype as i32));
        }

        connection.reset(&mut entry.stmt)?;

        if !found {
            return Err(DbError::SchemaNotFound);
        }

        Ok(doc)
    }

    /// Transparent per-thread schema cache over the catalogue.
    pub(crate) fn get_schema(
        &self,
        state: &BatchState,
        name: &str,
    ) -> Result<Rc<Schema>, DbError> {
        let vars = self.vars()?;
        let cache_key = format!("{}_{}", state.namespace, name);

        if let Some(schema) = vars.borrow().schema_cache.get(&cache_key) {
            return Ok(schema.clone());
        }

        let doc = self.schema_get_impl(state, name)?;

        let mut fields = Vec::new();
        for (key, value) in &doc {
            let tag = match value {
                Bson::Int32(tag) => *tag as u32,
                _ => return Err(DbError::BsonInvalidType),
            };
            fields.push((key.clone(), DbType::try_from(tag)?));
        }

        let schema = Rc::new(Schema::new(fields));
        vars.borrow_mut()
            .schema_cache
            .insert(cache_key, schema.clone());

        Ok(schema)
    }

    pub(crate) fn evict_schema(&self, state: &BatchState, name: &str) -> Result<(), DbError> {
        let vars = self.vars()?;
        let cache_key = format!("{}_{}", state.namespace, name);
        vars.borrow_mut().schema_cache.remove(&cache_key);
        Ok(())
    }

    /// Ids of the rows matching `selector`, in encounter order. Used by
    /// update and delete. Matching nothing is `IteratorNoMoreElements`.
    pub(crate) fn query_ids(
        &self,
        state: &BatchState,
        name: &str,
        selector: &Document,
    ) -> Result<Vec<u64>, DbError> {
        let schema = self.get_schema(state, name)?;
        let quote = self.dialect().quote;

        let mut sql = format!(
            "SELECT DISTINCT _id FROM {}",
            self.table(&state.namespace, name)
        );
        let mut types_in = Vec::new();

        let with_conditions = selector_has_conditions(selector);

        if with_conditions {
            let mode = selector_mode(selector)?;
            sql.push_str(" WHERE ");
            build_selector_query(quote, &schema, selector, mode, &mut sql, &mut types_in)?;
        }

        let vars = self.vars()?;
        let mut vars = vars.borrow_mut();
        let ThreadVars {
            connection,
            query_cache,
            ..
        } = &mut *vars;

        if !query_cache.contains_key(&sql) {
            let stmt = connection.prepare(&sql, &types_in, &[DbType::Uint64])?;
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

        if with_conditions {
            let mut position = 0;
            bind_selector_query(connection, &mut entry.stmt, &schema, selector, &mut position)?;
        }

        let mut ids = Vec::new();

        loop {
            match connection.step(&mut entry.stmt) {
                Ok(true) => (),
                Ok(false) => break,
                Err(err) => {
                    let _ = connection.reset(&mut entry.stmt);
                    return Err(err);
                }
            }

            match connection.column(&mut entry.stmt, 0, DbType::Uint64)? {
                DbValue::Uint64(id) => ids.push(id),
                _ => {
                    let _ = connection.reset(&mut entry.stmt);
                    return Err(DbError::DbTypeInvalid);
                }
            }
        }

        connection.reset(&mut entry.stmt)?;

        if ids.is_empty() {
            return Err(DbError::IteratorNoMoreElements);
        }

        Ok(ids)
    }

    /// Build, bind and cache the row query, returning an iterator over its
    /// results. The iterator resets the statement on exhaustion so the
    /// cached entry serves the next execution.
    pub(crate) fn query_impl(
        &self,
        state: &BatchState,
        name: &str,
        selector: &Document,
    ) -> Result<SqlIterator<D>, DbError> {
        let schema = self.get_schema(state, name)?;
        let quote = self.dialect().quote;

        let mut sql = String::from("SELECT _id");
        let mut out_variables = vec![(ID_FIELD.to_string(), 0usize)];
        let mut types_out = vec![DbType::Uint64];

        for (field, ty) in schema.iter() {
            if field == ID_FIELD {
                continue;
            }

            sql.push_str(&format!(", {quote}{field}{quote}"));
            out_variables.push((field.to_string(), out_variables.len()));
            types_out.push(ty);
        }

        sql.push_str(&format!(" FROM {}", self.table(&state.namespace, name)));

        let mut types_in = Vec::new();
        let with_conditions = selector_has_conditions(selector);

        if with_conditions {
            let mode = selector_mode(selector)?;
            sql.push_str(" WHERE ");
            build_selector_query(quote, &schema, selector, mode, &mut sql, &mut types_in)?;
        }

        let vars = self.vars()?;

        {
            let mut borrowed = vars.borrow_mut();
            let ThreadVars {
                connection,
                query_cache,
                ..
            } = &mut *borrowed;

            if !query_cache.contains_key(&sql) {
                let stmt = connection.prepare(&sql, &types_in, &types_out)?;
                query_cache.insert(
                    sql.clone(),
                    SqlStatement {
                        stmt,
                        in_variables_index: None,
                        out_variables_index: Some(out_variables.clone()),
                    },
                );
            }

            let entry = query_cache.get_mut(&sql).unwrap();

            if with_conditions {
                let mut position = 0;
                bind_selector_query(
                    connection,
                    &mut entry.stmt,
                    &schema,
                    selector,
                    &mut position,
                )?;
            }
        }

        Ok(SqlIterator {
            vars,
            sql,
            schema,
            out_variables,
            finished: false,
        })
    }
}

/// An in-flight query: the cached statement it steps, the column map to
/// read rows with, and the schema to type them by.
pub(crate) struct SqlIterator<D: Driver> {
    vars: Rc<RefCell<ThreadVars<D::Connection>>>,
    sql: String,
    schema: Rc<Schema>,
    out_variables: Vec<(String, usize)>,
    finished: bool,
}

impl<D: Driver> DbIterator for SqlIterator<D> {
    fn next_row(&mut self) -> Result<Option<Document>, DbError> {
        if self.finished {
            return Ok(None);
        }

        let mut vars = self.vars.borrow_mut();
        let ThreadVars {
            connection,
            query_cache,
            ..
        } = &mut *vars;

        let entry = query_cache
            .get_mut(&self.sql)
            .ok_or(DbError::ThreadingError)?;

        match connection.step(&mut entry.stmt) {
            Ok(true) => (),
            Ok(false) => {
                self.finished = true;
                connection.reset(&mut entry.stmt)?;
                return Ok(None);
            }
            Err(err) => {
                self.finished = true;
                let _ = connection.reset(&mut entry.stmt);
                return Err(err);
            }
        }

        let mut row = Document::new();

        for (field, index) in &self.out_variables {
            let ty = self.schema.get(field).ok_or(DbError::VariableNotFound)?;
            let value = connection.column(&mut entry.stmt, *index, ty)?;
            row.insert(field.clone(), value_to_bson(&value));
        }

        Ok(Some(row))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use db_types::{DbValue as V, Selector};

    fn people_schema() -> Schema {
        Schema::new(vec![
            ("_id".to_string(), DbType::Uint64),
            ("name".to_string(), DbType::String),
            ("age".to_string(), DbType::Sint32),
        ])
    }

    fn compile(selector: &Document) -> Result<(String, Vec<DbType>), DbError> {
        let schema = people_schema();
        let mode = selector_mode(selector)?;
        let mut sql = String::new();
        let mut types_in = Vec::new();
        build_selector_query("\"", &schema, selector, mode, &mut sql, &mut types_in)?;
        Ok((sql, types_in))
    }

    #[test]
    fn leaf_compilation_binds_in_tree_order() {
        let selector = Selector::new(SelectorMode::And)
            .field("age", Comparator::Ge, V::Sint32(26))
            .field("name", Comparator::Ne, V::String("bob".into()))
            .to_document();

        let (sql, types_in) = compile(&selector).unwrap();
        insta::assert_snapshot!(sql, @r###"( "age" >= ? AND "name" != ? )"###);
        assert_eq!(types_in, vec![DbType::Sint32, DbType::String]);
    }

    #[test]
    fn nested_selectors_parenthesise() {
        let selector = Selector::new(SelectorMode::Or)
            .field("age", Comparator::Lt, V::Sint32(18))
            .sub(
                Selector::new(SelectorMode::And)
                    .field("age", Comparator::Gt, V::Sint32(64))
                    .field("name", Comparator::Eq, V::String("carol".into())),
            )
            .to_document();

        let (sql, types_in) = compile(&selector).unwrap();
        insta::assert_snapshot!(sql, @r###"( "age" < ? OR ( "age" > ? AND "name" = ? ) )"###);
        assert_eq!(
            types_in,
            vec![DbType::Sint32, DbType::Sint32, DbType::String]
        );
    }

    #[test]
    fn empty_selector_bodies_are_rejected() {
        // A nested child with a mode but no conditions compiles to `( )`,
        // which is refused uniformly.
        let selector = Selector::new(SelectorMode::And)
            .field("age", Comparator::Ge, V::Sint32(0))
            .sub(Selector::new(SelectorMode::Or))
            .to_document();

        assert_eq!(compile(&selector), Err(DbError::SelectorEmpty));
    }

    #[test]
    fn unknown_fields_are_refused() {
        let selector = Selector::new(SelectorMode::And)
            .field("shoe_size", Comparator::Eq, V::Sint32(42))
            .to_document();

        assert_eq!(compile(&selector), Err(DbError::VariableNotFound));
    }

    #[test]
    fn invalid_mode_and_comparator_tags() {
        let mut selector = Selector::new(SelectorMode::And)
            .field("age", Comparator::Eq, V::Sint32(1))
            .to_document();
        selector.insert(MODE_KEY, Bson::Int32(9));
        assert_eq!(compile(&selector), Err(DbError::OperatorInvalid));

        let mut leaf = Document::new();
        leaf.insert(NAME_KEY, Bson::String("age".into()));
        leaf.insert(OPERATOR_KEY, Bson::Int32(99));
        leaf.insert(VALUE_KEY, Bson::Int32(1));
        let mut selector = Document::new();
        selector.insert(MODE_KEY, Bson::Int32(0));
        selector.insert("0", Bson::Document(leaf));
        assert_eq!(compile(&selector), Err(DbError::ComparatorInvalid));
    }
}
