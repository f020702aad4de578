use bson::{Bson, Document};

use crate::{value_to_bson, DbError, DbValue};

/// Key of the mode tag inside selector documents.
pub const MODE_KEY: &str = "_mode";
/// Keys of a selector leaf.
pub const NAME_KEY: &str = "_name";
pub const OPERATOR_KEY: &str = "_operator";
pub const VALUE_KEY: &str = "_value";

/// Boolean connective of a selector node.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum SelectorMode {
    And = 0,
    Or = 1,
}

impl TryFrom<u32> for SelectorMode {
    type Error = DbError;

    fn try_from(value: u32) -> Result<Self, DbError> {
        match value {
            0 => Ok(SelectorMode::And),
            1 => Ok(SelectorMode::Or),
            _ => Err(DbError::OperatorInvalid),
        }
    }
}

/// Comparison applied at a selector leaf.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Comparator {
    Lt = 0,
    Le = 1,
    Gt = 2,
    Ge = 3,
    Eq = 4,
    Ne = 5,
}

impl TryFrom<u32> for Comparator {
    type Error = DbError;

    fn try_from(value: u32) -> Result<Self, DbError> {
        Ok(match value {
            0 => Comparator::Lt,
            1 => Comparator::Le,
            2 => Comparator::Gt,
            3 => Comparator::Ge,
            4 => Comparator::Eq,
            5 => Comparator::Ne,
            _ => return Err(DbError::ComparatorInvalid),
        })
    }
}

enum Node {
    Condition {
        field: String,
        comparator: Comparator,
        value: DbValue,
    },
    Sub(Selector),
}

/// Client-side selector tree. Serialises into the document shape the engine
/// compiles: a `_mode` tag plus one sub-document per child, where a child
/// carrying its own `_mode` is a nested selector and anything else is a
/// `{_name, _operator, _value}` leaf.
///
/// A selector with no children serialises to a bare `{_mode}` document,
/// which the engine treats as match-all.
pub struct Selector {
    mode: SelectorMode,
    children: Vec<Node>,
}

impl Selector {
    pub fn new(mode: SelectorMode) -> Self {
        Self {
            mode,
            children: Vec::new(),
        }
    }

    /// Match-all selector.
    pub fn all() -> Self {
        Self::new(SelectorMode::And)
    }

    pub fn field(mut self, name: &str, comparator: Comparator, value: DbValue) -> Self {
        self.children.push(Node::Condition {
            field: name.to_string(),
            comparator,
            value,
        });
        self
    }

    pub fn sub(mut self, selector: Selector) -> Self {
        self.children.push(Node::Sub(selector));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert(MODE_KEY, Bson::Int32(self.mode as i32));

        for (index, child) in self.children.iter().enumerate() {
            let sub = match child {
                Node::Condition {
                    field,
                    comparator,
                    value,
                } => {
                    let mut leaf = Document::new();
                    leaf.insert(NAME_KEY, Bson::String(field.clone()));
                    leaf.insert(OPERATOR_KEY, Bson::Int32(*comparator as i32));
                    leaf.insert(VALUE_KEY, value_to_bson(value));
                    leaf
                }
                Node::Sub(selector) => selector.to_document(),
            };

            doc.insert(index.to_string(), Bson::Document(sub));
        }

        doc
    }
}
