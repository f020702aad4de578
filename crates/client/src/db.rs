//! Typed structured-data operations. All db operations target the primary
//! db server and always read a per-operation reply record, since even
//! mutations report their outcome (atomicity poisoning included).

use bson::Document;
use db_types::{append_document, DbError, Selector};
use message::{MessageBuilder, Opcode};

use crate::batch::{Batch, OpResult, Operation, ReplyCursor};
use crate::Error;

struct DbOp {
    opcode: Opcode,
    server: usize,
    namespace: String,
    name: String,
    // Encoded in order after namespace and name.
    documents: Vec<Document>,
    done: OpResult<()>,
    schema: OpResult<Document>,
    id: OpResult<u64>,
    rows: OpResult<Vec<Document>>,
}

impl DbOp {
    fn new(batch: &Batch<'_>, opcode: Opcode, namespace: &str, name: &str) -> Self {
        Self {
            opcode,
            server: batch.client().db_server(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            documents: Vec::new(),
            done: OpResult::new(),
            schema: OpResult::new(),
            id: OpResult::new(),
            rows: OpResult::new(),
        }
    }

    fn with_documents(mut self, documents: Vec<Document>) -> Self {
        self.documents = documents;
        self
    }
}

/// Read the status word; a non-zero status is followed by the error text.
fn check_status(reply: &mut ReplyCursor<'_>) -> Result<(), Error> {
    let status = reply.get_u32()?;

    if status == 0 {
        return Ok(());
    }

    let text = reply.get_string()?;
    Err(Error::Db(DbError::from_wire(status, &text)))
}

impl Operation for DbOp {
    fn opcode(&self) -> Opcode {
        self.opcode
    }

    fn server_index(&self) -> usize {
        self.server
    }

    fn encode(&self, builder: &mut MessageBuilder) {
        builder.append_string(&self.namespace);
        builder.append_string(&self.name);

        for doc in &self.documents {
            append_document(builder, doc);
        }
    }

    fn decode_reply(&mut self, reply: &mut ReplyCursor<'_>) -> Result<(), Error> {
        reply.next_operation()?;
        check_status(reply)?;

        match self.opcode {
            Opcode::DbSchemaCreate | Opcode::DbSchemaDelete | Opcode::DbUpdate
            | Opcode::DbDelete => {
                self.done.set(());
                Ok(())
            }
            Opcode::DbSchemaGet => {
                self.schema.set(reply.get_document()?);
                Ok(())
            }
            Opcode::DbInsert => {
                self.id.set(reply.get_u64()?);
                Ok(())
            }
            Opcode::DbQuery => {
                let count = reply.get_u32()?;
                let mut rows = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    rows.push(reply.get_document()?);
                }
                self.rows.set(rows);
                Ok(())
            }
            _ => Err(Error::Internal),
        }
    }
}

pub fn schema_create(
    batch: &mut Batch<'_>,
    namespace: &str,
    name: &str,
    schema: &Document,
) -> OpResult<()> {
    let op = DbOp::new(batch, Opcode::DbSchemaCreate, namespace, name)
        .with_documents(vec![schema.clone()]);
    let done = op.done.clone();
    batch.add(op);
    done
}

pub fn schema_get(batch: &mut Batch<'_>, namespace: &str, name: &str) -> OpResult<Document> {
    let op = DbOp::new(batch, Opcode::DbSchemaGet, namespace, name);
    let schema = op.schema.clone();
    batch.add(op);
    schema
}

pub fn schema_delete(batch: &mut Batch<'_>, namespace: &str, name: &str) -> OpResult<()> {
    let op = DbOp::new(batch, Opcode::DbSchemaDelete, namespace, name);
    let done = op.done.clone();
    batch.add(op);
    done
}

pub fn insert(
    batch: &mut Batch<'_>,
    namespace: &str,
    name: &str,
    entry: &Document,
) -> OpResult<u64> {
    let op =
        DbOp::new(batch, Opcode::DbInsert, namespace, name).with_documents(vec![entry.clone()]);
    let id = op.id.clone();
    batch.add(op);
    id
}

pub fn update(
    batch: &mut Batch<'_>,
    namespace: &str,
    name: &str,
    selector: &Selector,
    entry: &Document,
) -> OpResult<()> {
    let op = DbOp::new(batch, Opcode::DbUpdate, namespace, name)
        .with_documents(vec![selector.to_document(), entry.clone()]);
    let done = op.done.clone();
    batch.add(op);
    done
}

pub fn delete(
    batch: &mut Batch<'_>,
    namespace: &str,
    name: &str,
    selector: &Selector,
) -> OpResult<()> {
    let op = DbOp::new(batch, Opcode::DbDelete, namespace, name)
        .with_documents(vec![selector.to_document()]);
    let done = op.done.clone();
    batch.add(op);
    done
}

pub fn query(
    batch: &mut Batch<'_>,
    namespace: &str,
    name: &str,
    selector: &Selector,
) -> OpResult<Vec<Document>> {
    let op = DbOp::new(batch, Opcode::DbQuery, namespace, name)
        .with_documents(vec![selector.to_document()]);
    let rows = op.rows.clone();
    batch.add(op);
    rows
}
