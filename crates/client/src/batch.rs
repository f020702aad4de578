//! The batch engine: operations are coalesced by (server, opcode), encoded
//! into one message per pair, dispatched in parallel across servers, and
//! their replies decoded in order.

use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::{Arc, Mutex};

use message::{Message, MessageBuilder, Opcode};
use semantics::Semantics;

use crate::{Client, Error};

/// Shared output slot filled in by an operation's reply decoder. Cheap to
/// clone; read it after `Batch::execute` returns.
pub struct OpResult<T>(Arc<Mutex<Option<T>>>);

impl<T> OpResult<T> {
    pub(crate) fn new() -> Self {
        Self(Arc::new(Mutex::new(None)))
    }

    pub(crate) fn set(&self, value: T) {
        *self.0.lock().unwrap() = Some(value);
    }

    pub fn take(&self) -> Option<T> {
        self.0.lock().unwrap().take()
    }
}

impl<T> Clone for OpResult<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

/// A reply stream for one outbound message. The daemon may split a logical
/// reply across several messages when its reply arena fills; the cursor
/// fetches follow-up messages transparently, and hands out the side
/// payloads that ride behind each frame.
pub struct ReplyCursor<'s> {
    stream: &'s mut TcpStream,
    current: Message,
    expected_id: u64,
}

impl<'s> ReplyCursor<'s> {
    fn new(stream: &'s mut TcpStream, expected_id: u64) -> Result<Self, Error> {
        let current = Self::receive(stream, expected_id)?;
        Ok(Self {
            stream,
            current,
            expected_id,
        })
    }

    fn receive(stream: &mut TcpStream, expected_id: u64) -> Result<Message, Error> {
        let reply = Message::receive(stream, u64::from(u32::MAX))?
            .ok_or_else(|| Error::Transport("daemon closed the connection".to_string()))?;

        if reply.id() != expected_id || !reply.flags().is_reply() {
            return Err(Error::ReplyMismatch);
        }

        Ok(reply)
    }

    /// Advance to the next reply record, crossing message boundaries.
    pub fn next_operation(&mut self) -> Result<(), Error> {
        if self.current.records_remaining() == 0 {
            self.current = Self::receive(self.stream, self.expected_id)?;
        }

        self.current.next_operation()?;
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8, Error> {
        Ok(self.current.get_u8()?)
    }

    pub fn get_u32(&mut self) -> Result<u32, Error> {
        Ok(self.current.get_u32()?)
    }

    pub fn get_u64(&mut self) -> Result<u64, Error> {
        Ok(self.current.get_u64()?)
    }

    pub fn get_i64(&mut self) -> Result<i64, Error> {
        Ok(self.current.get_i64()?)
    }

    pub fn get_string(&mut self) -> Result<String, Error> {
        Ok(self.current.get_string()?.to_string())
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<bytes::Bytes, Error> {
        Ok(self.current.get_bytes(len)?)
    }

    pub fn get_document(&mut self) -> Result<bson::Document, Error> {
        db_types::get_document(&mut self.current).map_err(|err| match err {
            db_types::DocumentError::Message(err) => err.into(),
            db_types::DocumentError::MalformedBson(_) => {
                Error::Transport("malformed bson in reply".to_string())
            }
        })
    }

    /// Read this operation's side payload into a fresh buffer.
    pub fn read_side_payload(&mut self, len: usize) -> Result<Vec<u8>, Error> {
        let mut buf = vec![0u8; len];
        message::read_side_payload(self.stream, &mut buf)?;
        Ok(buf)
    }
}

/// One client-side operation: it knows its target, encodes its own record,
/// and decodes its own reply record(s).
pub trait Operation: Send {
    fn opcode(&self) -> Opcode;

    fn server_index(&self) -> usize;

    /// Whether a reply is requested for this opcode under `semantics`.
    /// Mutating object/kv opcodes skip replies at `Safety::None`.
    fn wants_reply(&self, _semantics: &Semantics) -> bool {
        true
    }

    /// Append this operation's record (and any side payload) to the
    /// message. The builder has already opened the record.
    fn encode(&self, builder: &mut MessageBuilder);

    /// Consume this operation's reply, starting with
    /// `reply.next_operation()`.
    fn decode_reply(&mut self, reply: &mut ReplyCursor<'_>) -> Result<(), Error>;
}

/// An ordered list of operations sharing one semantics descriptor.
pub struct Batch<'c> {
    client: &'c Client,
    semantics: Semantics,
    ops: Vec<Box<dyn Operation>>,
    errors: Vec<(usize, Error)>,
}

impl<'c> Batch<'c> {
    pub(crate) fn new(client: &'c Client, semantics: Semantics) -> Self {
        Self {
            client,
            semantics,
            ops: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn semantics(&self) -> &Semantics {
        &self.semantics
    }

    pub(crate) fn client(&self) -> &'c Client {
        self.client
    }

    pub fn add(&mut self, op: impl Operation + 'static) {
        self.ops.push(Box::new(op));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Per-operation errors of the last execute, ordered by add index.
    pub fn errors(&self) -> &[(usize, Error)] {
        &self.errors
    }

    /// Execute all queued operations. Operations are grouped into at most
    /// one message per (server, opcode) pair; messages to distinct servers
    /// dispatch in parallel, messages to one server go serially in opcode
    /// first-appearance order. Returns the first error in add order; the
    /// full set stays available via [`Batch::errors`].
    pub fn execute(&mut self) -> Result<(), Error> {
        let semantics = self.semantics;
        let ops = std::mem::take(&mut self.ops);
        self.errors.clear();

        if ops.is_empty() {
            return Ok(());
        }

        // Group by (server, opcode), preserving add order inside a group
        // and opcode first-appearance order per server.
        type Group = (Opcode, Vec<(usize, Box<dyn Operation>)>);
        let mut per_server: Vec<(usize, Vec<Group>)> = Vec::new();
        let mut server_slots: HashMap<usize, usize> = HashMap::new();

        for (index, op) in ops.into_iter().enumerate() {
            let server = op.server_index();
            let slot = *server_slots.entry(server).or_insert_with(|| {
                per_server.push((server, Vec::new()));
                per_server.len() - 1
            });

            let groups = &mut per_server[slot].1;
            match groups.iter_mut().find(|(opcode, _)| *opcode == op.opcode()) {
                Some((_, list)) => list.push((index, op)),
                None => groups.push((op.opcode(), vec![(index, op)])),
            }
        }

        // One worker per target server; results are awaited before execute
        // returns.
        let client = self.client;
        let mut errors: Vec<(usize, Error)> = std::thread::scope(|scope| {
            let handles: Vec<_> = per_server
                .into_iter()
                .map(|(server, groups)| {
                    scope.spawn(move || run_server(client, server, semantics, groups))
                })
                .collect();

            handles
                .into_iter()
                .flat_map(|handle| handle.join().expect("batch worker panicked"))
                .collect()
        });

        errors.sort_by_key(|(index, _)| *index);
        self.errors = errors;

        match self.errors.first() {
            Some((_, err)) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

fn run_server(
    client: &Client,
    server: usize,
    semantics: Semantics,
    groups: Vec<(Opcode, Vec<(usize, Box<dyn Operation>)>)>,
) -> Vec<(usize, Error)> {
    let mut errors = Vec::new();

    let mut guard = match client.connection(server) {
        Ok(guard) => guard,
        Err(err) => {
            for (_, group) in &groups {
                for (index, _) in group {
                    errors.push((*index, err.clone()));
                }
            }
            return errors;
        }
    };

    let mut dead: Option<Error> = None;

    for (opcode, mut group) in groups {
        if let Some(err) = &dead {
            for (index, _) in &group {
                errors.push((*index, err.clone()));
            }
            continue;
        }

        let stream = guard.as_mut().expect("connection established above");

        let mut builder = MessageBuilder::new(opcode, 1024);
        builder.set_semantics(&semantics);

        for (_, op) in &group {
            builder.add_operation(0);
            op.encode(&mut builder);
        }

        let wants_reply = group[0].1.wants_reply(&semantics);
        let request = builder.finish();

        if let Err(err) = request.send(stream) {
            let err = Error::from(err);
            for (index, _) in &group {
                errors.push((*index, err.clone()));
            }
            dead = Some(err);
            continue;
        }

        if !wants_reply {
            continue;
        }

        let mut cursor = match ReplyCursor::new(stream, request.id()) {
            Ok(cursor) => cursor,
            Err(err) => {
                for (index, _) in &group {
                    errors.push((*index, err.clone()));
                }
                dead = Some(err);
                continue;
            }
        };

        for (index, op) in &mut group {
            if let Some(err) = &dead {
                errors.push((*index, err.clone()));
                continue;
            }

            match op.decode_reply(&mut cursor) {
                Ok(()) => (),
                Err(err @ (Error::Transport(_) | Error::ReplyMismatch)) => {
                    // The reply stream is unusable; everything still
                    // outstanding on this connection fails.
                    errors.push((*index, err.clone()));
                    dead = Some(err);
                }
                Err(err) => errors.push((*index, err)),
            }
        }
    }

    if dead.is_some() {
        // Drop the broken connection; the next batch reconnects.
        *guard = None;
    }

    errors
}
