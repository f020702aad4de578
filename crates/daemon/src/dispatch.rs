//! Per-connection message dispatch: decode each operation record, invoke
//! the matching backend, assemble the reply. Transport-level failures
//! propagate and kill the connection; backend and protocol failures are
//! serialised into per-operation reply records and the connection stays up.

use std::collections::HashMap;

use backend::{DbBatch, KvBatch, ObjectBackend, ObjectHandle};
use bson::Document;
use db_types::{get_document, DbError, DocumentError};
use message::{status, Message, MessageBuilder, Opcode};
use semantics::{Atomicity, Safety};

use crate::{DaemonContext, MemoryChunk, Statistics};

type Stream = std::net::TcpStream;

pub fn handle_message(
    context: &DaemonContext,
    stream: &mut Stream,
    mut message: Message,
    arena: &mut MemoryChunk,
    statistics: &mut Statistics,
) -> message::Result<()> {
    match message.opcode() {
        Opcode::None => {
            if message.raw_opcode() != 0 {
                return error_reply(stream, &message, status::UNKNOWN_OPCODE, "unknown opcode");
            }
            Ok(())
        }
        Opcode::Ping => handle_ping(context, stream, &message),
        Opcode::Statistics => handle_statistics(context, stream, &mut message, statistics),
        Opcode::ObjectCreate
        | Opcode::ObjectDelete
        | Opcode::ObjectRead
        | Opcode::ObjectWrite
        | Opcode::ObjectStatus => match &context.object {
            Some(backend) => {
                handle_object(backend.as_ref(), stream, &mut message, arena, statistics)
            }
            None => error_reply(
                stream,
                &message,
                status::WRONG_BACKEND,
                "object backend not hosted here",
            ),
        },
        Opcode::KvPut
        | Opcode::KvDelete
        | Opcode::KvGet
        | Opcode::KvGetAll
        | Opcode::KvGetByPrefix => match &context.kv {
            Some(backend) => handle_kv(backend.as_ref(), stream, &mut message),
            None => error_reply(
                stream,
                &message,
                status::WRONG_BACKEND,
                "kv backend not hosted here",
            ),
        },
        Opcode::DbSchemaCreate
        | Opcode::DbSchemaGet
        | Opcode::DbSchemaDelete
        | Opcode::DbInsert
        | Opcode::DbUpdate
        | Opcode::DbDelete
        | Opcode::DbQuery => match &context.db {
            Some(backend) => handle_db(backend.as_ref(), stream, &mut message),
            None => error_reply(
                stream,
                &message,
                status::WRONG_BACKEND,
                "db backend not hosted here",
            ),
        },
    }
}

/// A single-record error reply; used for protocol-level rejections that
/// leave the connection up.
fn error_reply(
    stream: &mut Stream,
    message: &Message,
    code: u32,
    text: &str,
) -> message::Result<()> {
    let mut reply = MessageBuilder::reply_to(message);
    reply.add_operation(8 + text.len());
    reply.append_u32(code);
    reply.append_string(text);
    reply.finish().send(stream)
}

/// Ping replies one record per hosted backend family.
fn handle_ping(
    context: &DaemonContext,
    stream: &mut Stream,
    message: &Message,
) -> message::Result<()> {
    let mut reply = MessageBuilder::reply_to(message);

    if context.object.is_some() {
        reply.add_operation(8);
        reply.append_string("object");
    }
    if context.kv.is_some() {
        reply.add_operation(4);
        reply.append_string("kv");
    }
    if context.db.is_some() {
        reply.add_operation(4);
        reply.append_string("db");
    }

    reply.finish().send(stream)
}

fn handle_statistics(
    context: &DaemonContext,
    stream: &mut Stream,
    message: &mut Message,
    statistics: &Statistics,
) -> message::Result<()> {
    message.next_operation()?;
    let get_all = message.get_u8()?;

    let snapshot = if get_all != 0 {
        *context.statistics.lock().unwrap()
    } else {
        *statistics
    };

    let mut reply = MessageBuilder::reply_to(message);
    reply.add_operation(8 * 8);
    reply.append_u64(snapshot.files_created);
    reply.append_u64(snapshot.files_deleted);
    reply.append_u64(snapshot.files_stated);
    reply.append_u64(snapshot.sync_count);
    reply.append_u64(snapshot.bytes_read);
    reply.append_u64(snapshot.bytes_written);
    reply.append_u64(snapshot.bytes_received);
    reply.append_u64(snapshot.bytes_sent);

    reply.finish().send(stream)
}

type HandleMap = HashMap<(String, String), Box<dyn ObjectHandle>>;

fn open_or_create(
    backend: &dyn ObjectBackend,
    namespace: &str,
    name: &str,
) -> Result<Box<dyn ObjectHandle>, backend::BackendError> {
    match backend.open(namespace, name) {
        Ok(handle) => Ok(handle),
        Err(backend::BackendError::NotFound) => backend.create(namespace, name),
        Err(err) => Err(err),
    }
}

/// Drain an incoming side payload that is too large to accept, keeping the
/// stream in sync.
fn drain_side_payload(stream: &mut Stream, length: u64) -> message::Result<()> {
    use std::io::Read;

    let mut prefix = [0u8; 8];
    stream
        .read_exact(&mut prefix)
        .map_err(message::Error::ShortRead)?;

    let mut remaining = u64::from_le_bytes(prefix);
    if remaining != length {
        return Err(message::Error::LengthMismatch);
    }

    let mut sink = [0u8; 8192];
    while remaining > 0 {
        let chunk = sink.len().min(remaining as usize);
        stream
            .read_exact(&mut sink[..chunk])
            .map_err(message::Error::ShortRead)?;
        remaining -= chunk as u64;
    }

    Ok(())
}

fn handle_object(
    backend: &dyn ObjectBackend,
    stream: &mut Stream,
    message: &mut Message,
    arena: &mut MemoryChunk,
    statistics: &mut Statistics,
) -> message::Result<()> {
    let semantics = message.semantics();
    let safety = semantics.safety();
    let count = message.count();

    match message.opcode() {
        Opcode::ObjectCreate => {
            let mut reply = semantics
                .wants_reply()
                .then(|| MessageBuilder::reply_to(message));

            for _ in 0..count {
                message.next_operation()?;
                let namespace = message.get_string()?.to_string();
                let name = message.get_string()?.to_string();

                let code = match backend.create(&namespace, &name) {
                    Ok(mut handle) => {
                        statistics.files_created += 1;

                        if safety == Safety::Storage && handle.sync().is_ok() {
                            statistics.sync_count += 1;
                        }

                        status::OK
                    }
                    Err(err) => err.code(),
                };

                if let Some(reply) = reply.as_mut() {
                    reply.add_operation(4);
                    reply.append_u32(code);
                }
            }

            match reply {
                Some(reply) => reply.finish().send(stream),
                None => Ok(()),
            }
        }

        Opcode::ObjectDelete => {
            let mut reply = semantics
                .wants_reply()
                .then(|| MessageBuilder::reply_to(message));

            for _ in 0..count {
                message.next_operation()?;
                let namespace = message.get_string()?.to_string();
                let name = message.get_string()?.to_string();

                let code = match backend
                    .open(&namespace, &name)
                    .and_then(|handle| handle.delete())
                {
                    Ok(()) => {
                        statistics.files_deleted += 1;
                        status::OK
                    }
                    Err(err) => err.code(),
                };

                if let Some(reply) = reply.as_mut() {
                    reply.add_operation(4);
                    reply.append_u32(code);
                }
            }

            match reply {
                Some(reply) => reply.finish().send(stream),
                None => Ok(()),
            }
        }

        Opcode::ObjectRead => {
            let mut reply = MessageBuilder::reply_to(message);
            let mut handles: HandleMap = HashMap::new();

            for _ in 0..count {
                message.next_operation()?;
                let namespace = message.get_string()?.to_string();
                let name = message.get_string()?.to_string();
                let length = message.get_u64()?;
                let offset = message.get_u64()?;

                if length as usize > arena.capacity() {
                    reply.add_operation(8);
                    reply.append_u64(0);
                    continue;
                }

                let mut buf = match arena.get(length as usize) {
                    Some(buf) => buf,
                    None => {
                        // The arena is exhausted: flush what we have, then
                        // continue building a fresh reply.
                        let flushed = std::mem::replace(&mut reply, MessageBuilder::reply_to(message));
                        flushed.finish().send(stream)?;
                        arena.reset();
                        arena.get(length as usize).expect("fits after reset")
                    }
                };

                let handle = match handles.entry((namespace.clone(), name.clone())) {
                    std::collections::hash_map::Entry::Occupied(entry) => Some(entry.into_mut()),
                    std::collections::hash_map::Entry::Vacant(slot) => {
                        backend.open(&namespace, &name).ok().map(|h| slot.insert(h))
                    }
                };

                let bytes_read = handle
                    .and_then(|handle| handle.read(&mut buf, offset).ok())
                    .unwrap_or(0);
                statistics.bytes_read += bytes_read;

                reply.add_operation(8);
                reply.append_u64(bytes_read);

                if bytes_read > 0 {
                    buf.truncate(bytes_read as usize);
                    reply.attach_send(buf.freeze());
                    statistics.bytes_sent += bytes_read;
                }
            }

            reply.finish().send(stream)?;
            arena.reset();
            Ok(())
        }

        Opcode::ObjectWrite => {
            let mut reply = semantics
                .wants_reply()
                .then(|| MessageBuilder::reply_to(message));
            let mut handles: HandleMap = HashMap::new();

            for _ in 0..count {
                message.next_operation()?;
                let namespace = message.get_string()?.to_string();
                let name = message.get_string()?.to_string();
                let length = message.get_u64()?;
                let offset = message.get_u64()?;

                if length as usize > arena.capacity() {
                    drain_side_payload(stream, length)?;

                    if let Some(reply) = reply.as_mut() {
                        reply.add_operation(8);
                        reply.append_u64(0);
                    }
                    continue;
                }

                // Guaranteed to fit: the arena is reset after every write.
                let mut buf = arena
                    .get(length as usize)
                    .expect("write data fits the arena");
                message::read_side_payload(stream, &mut buf)?;
                statistics.bytes_received += length;

                let handle = match handles.entry((namespace.clone(), name.clone())) {
                    std::collections::hash_map::Entry::Occupied(entry) => Some(entry.into_mut()),
                    std::collections::hash_map::Entry::Vacant(slot) => {
                        open_or_create(backend, &namespace, &name)
                            .ok()
                            .map(|h| slot.insert(h))
                    }
                };

                let bytes_written = handle
                    .and_then(|handle| handle.write(&buf, offset).ok())
                    .unwrap_or(0);
                statistics.bytes_written += bytes_written;

                if let Some(reply) = reply.as_mut() {
                    reply.add_operation(8);
                    reply.append_u64(bytes_written);
                }

                arena.reset();
            }

            if safety == Safety::Storage {
                for handle in handles.values_mut() {
                    if handle.sync().is_ok() {
                        statistics.sync_count += 1;
                    }
                }
            }

            match reply {
                Some(reply) => reply.finish().send(stream),
                None => Ok(()),
            }
        }

        Opcode::ObjectStatus => {
            let mut reply = MessageBuilder::reply_to(message);

            for _ in 0..count {
                message.next_operation()?;
                let namespace = message.get_string()?.to_string();
                let name = message.get_string()?.to_string();

                let (mtime, size) = match backend
                    .open(&namespace, &name)
                    .and_then(|mut handle| handle.status())
                {
                    Ok(result) => {
                        statistics.files_stated += 1;
                        result
                    }
                    Err(_) => (0, 0),
                };

                reply.add_operation(16);
                reply.append_i64(mtime);
                reply.append_u64(size);
            }

            reply.finish().send(stream)
        }

        _ => unreachable!("routed by opcode family"),
    }
}

fn handle_kv(
    backend: &dyn backend::KvBackend,
    stream: &mut Stream,
    message: &mut Message,
) -> message::Result<()> {
    let semantics = message.semantics();
    let count = message.count();

    // One kv batch per namespace seen in this message.
    let mut batches: HashMap<String, Box<dyn KvBatch + '_>> = HashMap::new();

    macro_rules! batch_for {
        ($namespace:expr) => {
            match batches.entry($namespace.clone()) {
                std::collections::hash_map::Entry::Occupied(entry) => Some(entry.into_mut()),
                std::collections::hash_map::Entry::Vacant(slot) => backend
                    .batch_start(&$namespace, semantics)
                    .ok()
                    .map(|batch| slot.insert(batch)),
            }
        };
    }

    match message.opcode() {
        Opcode::KvPut => {
            let mut reply = semantics
                .wants_reply()
                .then(|| MessageBuilder::reply_to(message));

            for _ in 0..count {
                message.next_operation()?;
                let namespace = message.get_string()?.to_string();
                let key = message.get_string()?.to_string();
                let len = message.get_u32()?;
                let value = message.get_bytes(len as usize)?;

                let code = match batch_for!(namespace) {
                    Some(batch) => match batch.put(&key, &value) {
                        Ok(()) => status::OK,
                        Err(err) => err.code(),
                    },
                    None => status::INTERNAL,
                };

                if let Some(reply) = reply.as_mut() {
                    reply.add_operation(4);
                    reply.append_u32(code);
                }
            }

            for (_, batch) in batches.drain() {
                let _ = batch.execute();
            }

            match reply {
                Some(reply) => reply.finish().send(stream),
                None => Ok(()),
            }
        }

        Opcode::KvDelete => {
            let mut reply = semantics
                .wants_reply()
                .then(|| MessageBuilder::reply_to(message));

            for _ in 0..count {
                message.next_operation()?;
                let namespace = message.get_string()?.to_string();
                let key = message.get_string()?.to_string();

                let code = match batch_for!(namespace) {
                    Some(batch) => match batch.delete(&key) {
                        Ok(()) => status::OK,
                        Err(err) => err.code(),
                    },
                    None => status::INTERNAL,
                };

                if let Some(reply) = reply.as_mut() {
                    reply.add_operation(4);
                    reply.append_u32(code);
                }
            }

            for (_, batch) in batches.drain() {
                let _ = batch.execute();
            }

            match reply {
                Some(reply) => reply.finish().send(stream),
                None => Ok(()),
            }
        }

        Opcode::KvGet => {
            let mut reply = MessageBuilder::reply_to(message);

            for _ in 0..count {
                message.next_operation()?;
                let namespace = message.get_string()?.to_string();
                let key = message.get_string()?.to_string();

                let value = batch_for!(namespace).and_then(|batch| batch.get(&key).ok());

                match value {
                    Some(value) => {
                        reply.add_operation(4 + value.len());
                        reply.append_u32(value.len() as u32);
                        reply.append_bytes(&value);
                    }
                    None => {
                        reply.add_operation(4);
                        reply.append_u32(0);
                    }
                }
            }

            for (_, batch) in batches.drain() {
                let _ = batch.execute();
            }

            reply.finish().send(stream)
        }

        Opcode::KvGetAll | Opcode::KvGetByPrefix => {
            let by_prefix = message.opcode() == Opcode::KvGetByPrefix;
            let mut reply = MessageBuilder::reply_to(message);

            for _ in 0..count {
                message.next_operation()?;
                let namespace = message.get_string()?.to_string();

                let iterator = if by_prefix {
                    let prefix = message.get_string()?.to_string();
                    backend.get_by_prefix(&namespace, &prefix)
                } else {
                    backend.get_all(&namespace)
                };

                if let Ok(mut iterator) = iterator {
                    while let Some((key, value)) = iterator.next_pair() {
                        reply.add_operation(4 + value.len() + key.len() + 1);
                        reply.append_u32(value.len() as u32);
                        reply.append_bytes(&value);
                        reply.append_string(&key);
                    }
                }

                // Zero-length terminator per request operation.
                reply.add_operation(4);
                reply.append_u32(0);
            }

            reply.finish().send(stream)
        }

        _ => unreachable!("routed by opcode family"),
    }
}

struct DbRequest {
    namespace: String,
    name: String,
    docs: Vec<Document>,
}

enum DbOutput {
    Empty,
    Schema(Document),
    Id(u64),
    Rows(Vec<Document>),
}

enum DbDecodeError {
    // Kills the connection.
    Fatal(message::Error),
    // Serialised into the operation's reply record.
    Op(DbError),
}

fn decode_db_request(opcode: Opcode, message: &mut Message) -> Result<DbRequest, DbDecodeError> {
    let namespace = message
        .get_string()
        .map_err(DbDecodeError::Fatal)?
        .to_string();
    let name = message
        .get_string()
        .map_err(DbDecodeError::Fatal)?
        .to_string();

    let doc_count = match opcode {
        Opcode::DbSchemaCreate | Opcode::DbInsert | Opcode::DbDelete | Opcode::DbQuery => 1,
        Opcode::DbUpdate => 2,
        _ => 0,
    };

    let mut docs = Vec::with_capacity(doc_count);
    for _ in 0..doc_count {
        match get_document(message) {
            Ok(doc) => docs.push(doc),
            Err(DocumentError::Message(err)) => return Err(DbDecodeError::Fatal(err)),
            Err(DocumentError::MalformedBson(_)) => {
                return Err(DbDecodeError::Op(DbError::BsonInvalidType))
            }
        }
    }

    Ok(DbRequest {
        namespace,
        name,
        docs,
    })
}

fn execute_db_request(
    batch: &mut dyn DbBatch,
    opcode: Opcode,
    request: &DbRequest,
) -> Result<DbOutput, DbError> {
    match opcode {
        Opcode::DbSchemaCreate => batch
            .schema_create(&request.name, &request.docs[0])
            .map(|_| DbOutput::Empty),
        Opcode::DbSchemaGet => batch.schema_get(&request.name).map(DbOutput::Schema),
        Opcode::DbSchemaDelete => batch
            .schema_delete(&request.name)
            .map(|_| DbOutput::Empty),
        Opcode::DbInsert => batch
            .insert(&request.name, &request.docs[0])
            .map(DbOutput::Id),
        Opcode::DbUpdate => batch
            .update(&request.name, &request.docs[0], &request.docs[1])
            .map(|_| DbOutput::Empty),
        Opcode::DbDelete => batch
            .delete(&request.name, &request.docs[0])
            .map(|_| DbOutput::Empty),
        Opcode::DbQuery => {
            let mut iterator = batch.query(&request.name, &request.docs[0])?;
            let mut rows = Vec::new();
            while let Some(row) = iterator.next_row()? {
                rows.push(row);
            }
            Ok(DbOutput::Rows(rows))
        }
        _ => unreachable!("routed by opcode family"),
    }
}

fn handle_db(
    backend: &dyn backend::DbBackend,
    stream: &mut Stream,
    message: &mut Message,
) -> message::Result<()> {
    let semantics = message.semantics();
    let opcode = message.opcode();
    let count = message.count();

    let batch_wide = semantics.atomicity() == Atomicity::Batch;
    let mut wide_batch: Option<Box<dyn DbBatch + '_>> = None;
    let mut wide_start_error: Option<DbError> = None;

    let mut results: Vec<Result<DbOutput, DbError>> = Vec::with_capacity(count as usize);

    for _ in 0..count {
        message.next_operation()?;

        let request = match decode_db_request(opcode, message) {
            Ok(request) => request,
            Err(DbDecodeError::Fatal(err)) => return Err(err),
            Err(DbDecodeError::Op(err)) => {
                results.push(Err(err));
                continue;
            }
        };

        let result = if batch_wide {
            // One transaction spans the whole message; the engine poisons
            // it on the first failure so later operations still produce
            // reply records without executing.
            if wide_batch.is_none() && wide_start_error.is_none() {
                match backend.batch_start(&request.namespace, semantics) {
                    Ok(batch) => wide_batch = Some(batch),
                    Err(err) => wide_start_error = Some(err),
                }
            }

            match (&mut wide_batch, &wide_start_error) {
                (Some(batch), _) => execute_db_request(batch.as_mut(), opcode, &request),
                (None, Some(err)) => Err(err.clone()),
                (None, None) => Err(DbError::ThreadingError),
            }
        } else {
            // One transaction per operation; a failure aborts only that
            // transaction.
            match backend.batch_start(&request.namespace, semantics) {
                Ok(mut batch) => match execute_db_request(batch.as_mut(), opcode, &request) {
                    Ok(output) => batch.execute().map(|_| output),
                    Err(err) => {
                        // The engine already aborted; consuming the batch
                        // just drops the stored error.
                        let _ = batch.execute();
                        Err(err)
                    }
                },
                Err(err) => Err(err),
            }
        };

        results.push(result);
    }

    if batch_wide {
        let commit = match wide_batch {
            Some(batch) => batch.execute(),
            None => match wide_start_error {
                Some(err) => Err(err),
                None => Ok(()),
            },
        };

        if commit.is_err() {
            // The transaction rolled back: results that looked successful
            // never became visible.
            for result in &mut results {
                if result.is_ok() {
                    *result = Err(DbError::BatchPoisoned);
                }
            }
        }
    }

    let mut reply = MessageBuilder::reply_to(message);

    for result in results {
        reply.add_operation(16);

        match result {
            Ok(output) => {
                reply.append_u32(0);

                match output {
                    DbOutput::Empty => (),
                    DbOutput::Schema(doc) => db_types::append_document(&mut reply, &doc),
                    DbOutput::Id(id) => reply.append_u64(id),
                    DbOutput::Rows(rows) => {
                        reply.append_u32(rows.len() as u32);
                        for row in &rows {
                            db_types::append_document(&mut reply, row);
                        }
                    }
                }
            }
            Err(err) => {
                reply.append_u32(err.code());
                reply.append_string(&err.to_string());
            }
        }
    }

    reply.finish().send(stream)
}
