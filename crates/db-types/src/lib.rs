//! Shared vocabulary of the structured-data subsystem: typed column values,
//! their BSON projections, and the schema / entry / selector documents that
//! travel between clients and the SQL engine.

mod selector;
mod value;
mod wire;

pub use selector::{
    Comparator, Selector, SelectorMode, MODE_KEY, NAME_KEY, OPERATOR_KEY, VALUE_KEY,
};
pub use value::{value_from_bson, value_to_bson, DbType, DbValue};
pub use wire::{append_document, get_document, DocumentError};

pub use bson::{Bson, Document};

/// Errors of the structured-data subsystem. Stable `code()` projections let
/// per-operation reply records carry them across the wire.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum DbError {
    #[error("schema not found")]
    SchemaNotFound,
    #[error("schema empty")]
    SchemaEmpty,
    #[error("db type invalid")]
    DbTypeInvalid,
    #[error("operator invalid")]
    OperatorInvalid,
    #[error("comparator invalid")]
    ComparatorInvalid,
    #[error("variable not found")]
    VariableNotFound,
    #[error("no variable set")]
    NoVariableSet,
    #[error("selector empty")]
    SelectorEmpty,
    #[error("no more elements")]
    IteratorNoMoreElements,
    #[error("could not initialize thread-local backend state")]
    ThreadingError,
    #[error("unsupported bson element type")]
    BsonInvalidType,
    #[error("batch poisoned by an earlier failure")]
    BatchPoisoned,
    #[error("driver error {code}: {text}")]
    DriverError { code: i32, text: String },
}

impl DbError {
    pub fn code(&self) -> u32 {
        match self {
            DbError::SchemaNotFound => 1,
            DbError::SchemaEmpty => 2,
            DbError::DbTypeInvalid => 3,
            DbError::OperatorInvalid => 4,
            DbError::ComparatorInvalid => 5,
            DbError::VariableNotFound => 6,
            DbError::NoVariableSet => 7,
            DbError::SelectorEmpty => 8,
            DbError::IteratorNoMoreElements => 9,
            DbError::ThreadingError => 10,
            DbError::BsonInvalidType => 11,
            DbError::BatchPoisoned => 12,
            DbError::DriverError { .. } => 13,
        }
    }

    /// Reconstruct from a reply record's status code and error string.
    pub fn from_wire(code: u32, text: &str) -> DbError {
        match code {
            1 => DbError::SchemaNotFound,
            2 => DbError::SchemaEmpty,
            3 => DbError::DbTypeInvalid,
            4 => DbError::OperatorInvalid,
            5 => DbError::ComparatorInvalid,
            6 => DbError::VariableNotFound,
            7 => DbError::NoVariableSet,
            8 => DbError::SelectorEmpty,
            9 => DbError::IteratorNoMoreElements,
            10 => DbError::ThreadingError,
            11 => DbError::BsonInvalidType,
            12 => DbError::BatchPoisoned,
            _ => DbError::DriverError {
                code: code as i32,
                text: text.to_string(),
            },
        }
    }
}

/// Key of the synthetic primary id column every row carries.
pub const ID_FIELD: &str = "_id";

/// Meta key in schema documents holding the index definitions.
pub const INDEX_KEY: &str = "_index";

/// Build the schema document for `fields` and optional `indices` as the wire
/// and the engine expect it: field name mapped to its type tag, plus an
/// `_index` array of field-name arrays.
pub fn schema_to_document(fields: &[(&str, DbType)], indices: &[&[&str]]) -> Document {
    let mut doc = Document::new();

    for (name, ty) in fields {
        doc.insert(name.to_string(), Bson::Int32(*ty as i32));
    }

    if !indices.is_empty() {
        let index: Vec<Bson> = indices
            .iter()
            .map(|cols| {
                Bson::Array(
                    cols.iter()
                        .map(|c| Bson::String(c.to_string()))
                        .collect(),
                )
            })
            .collect();
        doc.insert(INDEX_KEY, Bson::Array(index));
    }

    doc
}

/// Read the field map out of a schema document, skipping the `_index` meta
/// key. Fails with `DbTypeInvalid` on an unknown type tag.
pub fn schema_fields_from_document(doc: &Document) -> Result<Vec<(String, DbType)>, DbError> {
    let mut fields = Vec::new();

    for (key, value) in doc {
        if key == INDEX_KEY {
            continue;
        }

        let tag = match value {
            Bson::Int32(tag) => *tag as u32,
            Bson::Int64(tag) => *tag as u32,
            _ => return Err(DbError::BsonInvalidType),
        };

        fields.push((key.clone(), DbType::try_from(tag)?));
    }

    Ok(fields)
}

/// Read the `_index` meta array of a schema document, if present.
pub fn schema_indices_from_document(doc: &Document) -> Result<Vec<Vec<String>>, DbError> {
    let Some(value) = doc.get(INDEX_KEY) else {
        return Ok(Vec::new());
    };

    let Bson::Array(entries) = value else {
        return Err(DbError::BsonInvalidType);
    };

    let mut indices = Vec::new();

    for entry in entries {
        let Bson::Array(columns) = entry else {
            return Err(DbError::BsonInvalidType);
        };

        let mut names = Vec::new();
        for column in columns {
            let Bson::String(name) = column else {
                return Err(DbError::BsonInvalidType);
            };
            names.push(name.clone());
        }

        indices.push(names);
    }

    Ok(indices)
}

/// Build an entry document from typed field values.
pub fn entry_to_document(fields: &[(&str, DbValue)]) -> Document {
    let mut doc = Document::new();
    for (name, value) in fields {
        doc.insert(name.to_string(), value_to_bson(value));
    }
    doc
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn schema_documents_round_trip() {
        let doc = schema_to_document(
            &[("name", DbType::String), ("age", DbType::Sint32)],
            &[&["name"], &["name", "age"]],
        );

        let fields = schema_fields_from_document(&doc).unwrap();
        assert_eq!(
            fields,
            vec![
                ("name".to_string(), DbType::String),
                ("age".to_string(), DbType::Sint32)
            ]
        );

        let indices = schema_indices_from_document(&doc).unwrap();
        assert_eq!(indices, vec![vec!["name"], vec!["name", "age"]]);
    }

    #[test]
    fn error_codes_round_trip() {
        for err in [
            DbError::SchemaNotFound,
            DbError::DbTypeInvalid,
            DbError::SelectorEmpty,
            DbError::BatchPoisoned,
        ] {
            let text = err.to_string();
            assert_eq!(DbError::from_wire(err.code(), &text), err);
        }
    }
}
