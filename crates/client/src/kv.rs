//! Typed key-value operations. Keys place by hash across the kv servers.

use message::{MessageBuilder, Opcode};
use semantics::Semantics;

use crate::batch::{Batch, OpResult, Operation, ReplyCursor};
use crate::Error;

struct KvOp {
    opcode: Opcode,
    server: usize,
    namespace: String,
    // Key for point ops, prefix for GetByPrefix, unused for GetAll.
    key: Option<String>,
    value: Option<Vec<u8>>,
    done: OpResult<()>,
    found: OpResult<Option<Vec<u8>>>,
    pairs: OpResult<Vec<(String, Vec<u8>)>>,
}

impl KvOp {
    fn new(opcode: Opcode, server: usize, namespace: &str) -> Self {
        Self {
            opcode,
            server,
            namespace: namespace.to_string(),
            key: None,
            value: None,
            done: OpResult::new(),
            found: OpResult::new(),
            pairs: OpResult::new(),
        }
    }
}

impl Operation for KvOp {
    fn opcode(&self) -> Opcode {
        self.opcode
    }

    fn server_index(&self) -> usize {
        self.server
    }

    fn wants_reply(&self, semantics: &Semantics) -> bool {
        match self.opcode {
            Opcode::KvPut | Opcode::KvDelete => semantics.wants_reply(),
            _ => true,
        }
    }

    fn encode(&self, builder: &mut MessageBuilder) {
        builder.append_string(&self.namespace);

        if let Some(key) = &self.key {
            builder.append_string(key);
        }

        if let Some(value) = &self.value {
            builder.append_u32(value.len() as u32);
            builder.append_bytes(value);
        }
    }

    fn decode_reply(&mut self, reply: &mut ReplyCursor<'_>) -> Result<(), Error> {
        match self.opcode {
            Opcode::KvPut | Opcode::KvDelete => {
                reply.next_operation()?;
                match Error::from_status(reply.get_u32()?) {
                    Some(err) => Err(err),
                    None => {
                        self.done.set(());
                        Ok(())
                    }
                }
            }
            Opcode::KvGet => {
                reply.next_operation()?;
                let len = reply.get_u32()?;
                let value = if len > 0 {
                    Some(reply.get_bytes(len as usize)?.to_vec())
                } else {
                    None
                };
                self.found.set(value);
                Ok(())
            }
            Opcode::KvGetAll | Opcode::KvGetByPrefix => {
                // One record per pair, terminated by a zero-length record.
                let mut pairs = Vec::new();

                loop {
                    reply.next_operation()?;
                    let len = reply.get_u32()?;
                    if len == 0 {
                        break;
                    }
                    let value = reply.get_bytes(len as usize)?.to_vec();
                    let key = reply.get_string()?;
                    pairs.push((key, value));
                }

                self.pairs.set(pairs);
                Ok(())
            }
            _ => Err(Error::Internal),
        }
    }
}

pub fn put(batch: &mut Batch<'_>, namespace: &str, key: &str, value: &[u8]) -> OpResult<()> {
    let server = batch.client().kv_server(key);
    let mut op = KvOp::new(Opcode::KvPut, server, namespace);
    op.key = Some(key.to_string());
    op.value = Some(value.to_vec());
    let done = op.done.clone();
    batch.add(op);
    done
}

pub fn delete(batch: &mut Batch<'_>, namespace: &str, key: &str) -> OpResult<()> {
    let server = batch.client().kv_server(key);
    let mut op = KvOp::new(Opcode::KvDelete, server, namespace);
    op.key = Some(key.to_string());
    let done = op.done.clone();
    batch.add(op);
    done
}

pub fn get(batch: &mut Batch<'_>, namespace: &str, key: &str) -> OpResult<Option<Vec<u8>>> {
    let server = batch.client().kv_server(key);
    let mut op = KvOp::new(Opcode::KvGet, server, namespace);
    op.key = Some(key.to_string());
    let found = op.found.clone();
    batch.add(op);
    found
}

/// All pairs of a namespace on one kv server.
pub fn get_all(
    batch: &mut Batch<'_>,
    server: usize,
    namespace: &str,
) -> OpResult<Vec<(String, Vec<u8>)>> {
    let op = KvOp::new(Opcode::KvGetAll, server, namespace);
    let pairs = op.pairs.clone();
    batch.add(op);
    pairs
}

/// All pairs of a namespace whose keys start with `prefix`.
pub fn get_by_prefix(
    batch: &mut Batch<'_>,
    server: usize,
    namespace: &str,
    prefix: &str,
) -> OpResult<Vec<(String, Vec<u8>)>> {
    let mut op = KvOp::new(Opcode::KvGetByPrefix, server, namespace);
    op.key = Some(prefix.to_string());
    let pairs = op.pairs.clone();
    batch.add(op);
    pairs
}
