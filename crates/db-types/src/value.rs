use bson::Bson;

use crate::DbError;

/// The closed set of column types a schema may use. Wire tags are stable.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u32)]
pub enum DbType {
    Sint32 = 0,
    Uint32 = 1,
    Sint64 = 2,
    Uint64 = 3,
    Float32 = 4,
    Float64 = 5,
    String = 6,
    Blob = 7,
    /// The synthetic primary key. Stored and transported as uint64.
    Id = 8,
}

impl TryFrom<u32> for DbType {
    type Error = DbError;

    fn try_from(value: u32) -> Result<Self, DbError> {
        Ok(match value {
            0 => DbType::Sint32,
            1 => DbType::Uint32,
            2 => DbType::Sint64,
            3 => DbType::Uint64,
            4 => DbType::Float32,
            5 => DbType::Float64,
            6 => DbType::String,
            7 => DbType::Blob,
            8 => DbType::Id,
            _ => return Err(DbError::DbTypeInvalid),
        })
    }
}

/// A typed column value.
#[derive(Clone, Debug, PartialEq)]
pub enum DbValue {
    Sint32(i32),
    Uint32(u32),
    Sint64(i64),
    Uint64(u64),
    Float32(f32),
    Float64(f64),
    String(String),
    Blob(Vec<u8>),
    Null,
}

impl DbValue {
    pub fn db_type(&self) -> Option<DbType> {
        match self {
            DbValue::Sint32(_) => Some(DbType::Sint32),
            DbValue::Uint32(_) => Some(DbType::Uint32),
            DbValue::Sint64(_) => Some(DbType::Sint64),
            DbValue::Uint64(_) => Some(DbType::Uint64),
            DbValue::Float32(_) => Some(DbType::Float32),
            DbValue::Float64(_) => Some(DbType::Float64),
            DbValue::String(_) => Some(DbType::String),
            DbValue::Blob(_) => Some(DbType::Blob),
            DbValue::Null => None,
        }
    }
}

/// Project a typed value into its BSON carrier. Unsigned 64-bit values are
/// bit-cast through int64 and recovered on the way out.
pub fn value_to_bson(value: &DbValue) -> Bson {
    match value {
        DbValue::Sint32(v) => Bson::Int32(*v),
        DbValue::Uint32(v) => Bson::Int64(i64::from(*v)),
        DbValue::Sint64(v) => Bson::Int64(*v),
        DbValue::Uint64(v) => Bson::Int64(*v as i64),
        DbValue::Float32(v) => Bson::Double(f64::from(*v)),
        DbValue::Float64(v) => Bson::Double(*v),
        DbValue::String(v) => Bson::String(v.clone()),
        DbValue::Blob(v) => Bson::Binary(bson::Binary {
            subtype: bson::spec::BinarySubtype::Generic,
            bytes: v.clone(),
        }),
        DbValue::Null => Bson::Null,
    }
}

/// Interpret a BSON element as a value of the schema-declared type.
///
/// Only the element types of the wire contract are accepted (double, utf8,
/// document, array, binary, bool, int32, int64); anything else is
/// `BsonInvalidType`. A supported element that does not fit the declared
/// column type is `DbTypeInvalid`.
pub fn value_from_bson(ty: DbType, bson: &Bson) -> Result<DbValue, DbError> {
    // Reject element types outside the recognised set up front.
    match bson {
        Bson::Double(_)
        | Bson::String(_)
        | Bson::Document(_)
        | Bson::Array(_)
        | Bson::Binary(_)
        | Bson::Boolean(_)
        | Bson::Int32(_)
        | Bson::Int64(_)
        | Bson::Null => (),
        _ => return Err(DbError::BsonInvalidType),
    }

    if matches!(bson, Bson::Null) {
        return Ok(DbValue::Null);
    }

    let value = match ty {
        DbType::Sint32 => match bson {
            Bson::Int32(v) => DbValue::Sint32(*v),
            Bson::Int64(v) => {
                DbValue::Sint32(i32::try_from(*v).map_err(|_| DbError::DbTypeInvalid)?)
            }
            _ => return Err(DbError::DbTypeInvalid),
        },
        DbType::Uint32 => match bson {
            Bson::Int32(v) => {
                DbValue::Uint32(u32::try_from(*v).map_err(|_| DbError::DbTypeInvalid)?)
            }
            Bson::Int64(v) => {
                DbValue::Uint32(u32::try_from(*v).map_err(|_| DbError::DbTypeInvalid)?)
            }
            _ => return Err(DbError::DbTypeInvalid),
        },
        DbType::Sint64 => match bson {
            Bson::Int32(v) => DbValue::Sint64(i64::from(*v)),
            Bson::Int64(v) => DbValue::Sint64(*v),
            _ => return Err(DbError::DbTypeInvalid),
        },
        DbType::Uint64 | DbType::Id => match bson {
            Bson::Int32(v) => {
                DbValue::Uint64(u64::try_from(*v).map_err(|_| DbError::DbTypeInvalid)?)
            }
            // Bit-cast: values above i64::MAX were stored as negative int64.
            Bson::Int64(v) => DbValue::Uint64(*v as u64),
            _ => return Err(DbError::DbTypeInvalid),
        },
        DbType::Float32 => match bson {
            Bson::Double(v) => DbValue::Float32(*v as f32),
            _ => return Err(DbError::DbTypeInvalid),
        },
        DbType::Float64 => match bson {
            Bson::Double(v) => DbValue::Float64(*v),
            Bson::Int32(v) => DbValue::Float64(f64::from(*v)),
            _ => return Err(DbError::DbTypeInvalid),
        },
        DbType::String => match bson {
            Bson::String(v) => DbValue::String(v.clone()),
            _ => return Err(DbError::DbTypeInvalid),
        },
        DbType::Blob => match bson {
            Bson::Binary(v) => DbValue::Blob(v.bytes.clone()),
            _ => return Err(DbError::DbTypeInvalid),
        },
    };

    Ok(value)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn typed_round_trips() {
        let cases = [
            (DbType::Sint32, DbValue::Sint32(-7)),
            (DbType::Uint32, DbValue::Uint32(u32::MAX)),
            (DbType::Sint64, DbValue::Sint64(i64::MIN)),
            (DbType::Uint64, DbValue::Uint64(u64::MAX)),
            (DbType::Float64, DbValue::Float64(2.5)),
            (DbType::String, DbValue::String("hello".into())),
            (DbType::Blob, DbValue::Blob(vec![0, 1, 2])),
        ];

        for (ty, value) in cases {
            let bson = value_to_bson(&value);
            assert_eq!(value_from_bson(ty, &bson).unwrap(), value);
        }
    }

    #[test]
    fn mismatched_column_type_is_invalid() {
        assert_eq!(
            value_from_bson(DbType::Sint32, &Bson::String("not-an-int".into())),
            Err(DbError::DbTypeInvalid)
        );
        assert_eq!(
            value_from_bson(DbType::Uint32, &Bson::Int64(-1)),
            Err(DbError::DbTypeInvalid)
        );
        assert_eq!(
            value_from_bson(DbType::Blob, &Bson::Int32(1)),
            Err(DbError::DbTypeInvalid)
        );
    }

    #[test]
    fn unrecognised_element_types_are_rejected() {
        assert_eq!(
            value_from_bson(DbType::String, &Bson::ObjectId(bson::oid::ObjectId::new())),
            Err(DbError::BsonInvalidType)
        );
        assert_eq!(
            value_from_bson(
                DbType::Sint64,
                &Bson::DateTime(bson::DateTime::from_millis(0))
            ),
            Err(DbError::BsonInvalidType)
        );
    }

    #[test]
    fn unknown_type_tag() {
        assert_eq!(DbType::try_from(42), Err(DbError::DbTypeInvalid));
    }
}
