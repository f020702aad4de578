//! Typed object operations. Whole-object operations place by name hash;
//! striped I/O places by the distribution policy.

use bytes::Bytes;
use message::{MessageBuilder, Opcode};
use semantics::Semantics;

use crate::batch::{Batch, OpResult, Operation, ReplyCursor};
use crate::{Distribution, Error};

struct ObjectOp {
    opcode: Opcode,
    server: usize,
    namespace: String,
    name: String,
    // Read: (length, offset); write: (data.len(), offset).
    extent: Option<(u64, u64)>,
    data: Option<Bytes>,
    written: OpResult<u64>,
    read: OpResult<Bytes>,
    status: OpResult<(i64, u64)>,
}

impl ObjectOp {
    fn new(opcode: Opcode, server: usize, namespace: &str, name: &str) -> Self {
        Self {
            opcode,
            server,
            namespace: namespace.to_string(),
            name: name.to_string(),
            extent: None,
            data: None,
            written: OpResult::new(),
            read: OpResult::new(),
            status: OpResult::new(),
        }
    }
}

impl Operation for ObjectOp {
    fn opcode(&self) -> Opcode {
        self.opcode
    }

    fn server_index(&self) -> usize {
        self.server
    }

    fn wants_reply(&self, semantics: &Semantics) -> bool {
        match self.opcode {
            // Reads and stats always reply; mutations only when the
            // semantics ask for an acknowledgement.
            Opcode::ObjectRead | Opcode::ObjectStatus => true,
            _ => semantics.wants_reply(),
        }
    }

    fn encode(&self, builder: &mut MessageBuilder) {
        builder.append_string(&self.namespace);
        builder.append_string(&self.name);

        if let Some((length, offset)) = self.extent {
            builder.append_u64(length);
            builder.append_u64(offset);
        }

        if let Some(data) = &self.data {
            builder.attach_send(data.clone());
        }
    }

    fn decode_reply(&mut self, reply: &mut ReplyCursor<'_>) -> Result<(), Error> {
        reply.next_operation()?;

        match self.opcode {
            Opcode::ObjectCreate | Opcode::ObjectDelete => {
                match Error::from_status(reply.get_u32()?) {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            }
            Opcode::ObjectWrite => {
                self.written.set(reply.get_u64()?);
                Ok(())
            }
            Opcode::ObjectRead => {
                let bytes_read = reply.get_u64()?;
                let data = if bytes_read > 0 {
                    Bytes::from(reply.read_side_payload(bytes_read as usize)?)
                } else {
                    Bytes::new()
                };
                self.read.set(data);
                Ok(())
            }
            Opcode::ObjectStatus => {
                let mtime = reply.get_i64()?;
                let size = reply.get_u64()?;
                self.status.set((mtime, size));
                Ok(())
            }
            _ => Err(Error::Internal),
        }
    }
}

pub fn create(batch: &mut Batch<'_>, namespace: &str, name: &str) {
    let server = batch.client().object_server(name);
    batch.add(ObjectOp::new(Opcode::ObjectCreate, server, namespace, name));
}

pub fn delete(batch: &mut Batch<'_>, namespace: &str, name: &str) {
    let server = batch.client().object_server(name);
    batch.add(ObjectOp::new(Opcode::ObjectDelete, server, namespace, name));
}

pub fn write(
    batch: &mut Batch<'_>,
    namespace: &str,
    name: &str,
    data: Bytes,
    offset: u64,
) -> OpResult<u64> {
    let server = batch.client().object_server(name);
    let mut op = ObjectOp::new(Opcode::ObjectWrite, server, namespace, name);
    op.extent = Some((data.len() as u64, offset));
    op.data = Some(data);
    let written = op.written.clone();
    batch.add(op);
    written
}

pub fn read(
    batch: &mut Batch<'_>,
    namespace: &str,
    name: &str,
    length: u64,
    offset: u64,
) -> OpResult<Bytes> {
    let server = batch.client().object_server(name);
    let mut op = ObjectOp::new(Opcode::ObjectRead, server, namespace, name);
    op.extent = Some((length, offset));
    let read = op.read.clone();
    batch.add(op);
    read
}

pub fn status(batch: &mut Batch<'_>, namespace: &str, name: &str) -> OpResult<(i64, u64)> {
    let server = batch.client().object_server(name);
    let mut op = ObjectOp::new(Opcode::ObjectStatus, server, namespace, name);
    let status = op.status.clone();
    batch.add(op);
    status
}

/// Split one logical write into per-server stripes. Results come back in
/// stripe order.
pub fn write_striped(
    batch: &mut Batch<'_>,
    distribution: &mut Distribution,
    namespace: &str,
    name: &str,
    data: Bytes,
    offset: u64,
) -> Vec<OpResult<u64>> {
    distribution.reset(data.len() as u64, offset);

    let mut results = Vec::new();
    let mut consumed = 0usize;

    while let Some((stripe_server, local_offset, local_length)) = distribution.next() {
        let server = batch.client().object_server_at(stripe_server);
        let stripe = data.slice(consumed..consumed + local_length as usize);
        consumed += local_length as usize;

        let mut op = ObjectOp::new(Opcode::ObjectWrite, server, namespace, name);
        op.extent = Some((local_length, local_offset));
        op.data = Some(stripe);
        results.push(op.written.clone());
        batch.add(op);
    }

    results
}

/// Split one logical read into per-server stripes; concatenating the
/// returned buffers in order reconstructs the logical range.
pub fn read_striped(
    batch: &mut Batch<'_>,
    distribution: &mut Distribution,
    namespace: &str,
    name: &str,
    length: u64,
    offset: u64,
) -> Vec<OpResult<Bytes>> {
    distribution.reset(length, offset);

    let mut results = Vec::new();

    while let Some((stripe_server, local_offset, local_length)) = distribution.next() {
        let server = batch.client().object_server_at(stripe_server);

        let mut op = ObjectOp::new(Opcode::ObjectRead, server, namespace, name);
        op.extent = Some((local_length, local_offset));
        results.push(op.read.clone());
        batch.add(op);
    }

    results
}
