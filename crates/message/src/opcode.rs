use crate::Error;

/// Backend family an opcode is routed to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Family {
    Meta,
    Object,
    Kv,
    Db,
}

impl Family {
    pub fn as_str(&self) -> &'static str {
        match self {
            Family::Meta => "meta",
            Family::Object => "object",
            Family::Kv => "kv",
            Family::Db => "db",
        }
    }
}

/// Stable wire opcodes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
#[repr(u32)]
pub enum Opcode {
    None = 0,
    Ping = 1,
    Statistics = 2,

    ObjectCreate = 10,
    ObjectDelete = 11,
    ObjectRead = 12,
    ObjectWrite = 13,
    ObjectStatus = 14,

    KvPut = 20,
    KvDelete = 21,
    KvGet = 22,
    KvGetAll = 23,
    KvGetByPrefix = 24,

    DbSchemaCreate = 30,
    DbSchemaGet = 31,
    DbSchemaDelete = 32,
    DbInsert = 33,
    DbUpdate = 34,
    DbDelete = 35,
    DbQuery = 36,
}

impl Opcode {
    pub fn family(&self) -> Family {
        match *self as u32 {
            0..=9 => Family::Meta,
            10..=19 => Family::Object,
            20..=29 => Family::Kv,
            _ => Family::Db,
        }
    }
}

impl TryFrom<u32> for Opcode {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Error> {
        use Opcode::*;

        Ok(match value {
            0 => None,
            1 => Ping,
            2 => Statistics,
            10 => ObjectCreate,
            11 => ObjectDelete,
            12 => ObjectRead,
            13 => ObjectWrite,
            14 => ObjectStatus,
            20 => KvPut,
            21 => KvDelete,
            22 => KvGet,
            23 => KvGetAll,
            24 => KvGetByPrefix,
            30 => DbSchemaCreate,
            31 => DbSchemaGet,
            32 => DbSchemaDelete,
            33 => DbInsert,
            34 => DbUpdate,
            35 => DbDelete,
            36 => DbQuery,
            other => return Err(Error::UnknownOpcode(other)),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip_and_family() {
        for op in [
            Opcode::Ping,
            Opcode::ObjectWrite,
            Opcode::KvGetByPrefix,
            Opcode::DbQuery,
        ] {
            assert_eq!(Opcode::try_from(op as u32).unwrap(), op);
        }

        assert_eq!(Opcode::Statistics.family(), Family::Meta);
        assert_eq!(Opcode::ObjectStatus.family(), Family::Object);
        assert_eq!(Opcode::KvPut.family(), Family::Kv);
        assert_eq!(Opcode::DbSchemaDelete.family(), Family::Db);

        assert!(matches!(
            Opcode::try_from(7),
            Err(Error::UnknownOpcode(7))
        ));
    }
}
