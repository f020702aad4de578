use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use semantics::{Atomicity, Safety, Semantics};

use crate::{Error, Opcode, Result};

pub const MAGIC: u32 = 0x4A55_4C41; // "JULA"
pub const VERSION: u8 = 1;

/// Size of the encoded header: magic, version, opcode, flags, op_count,
/// payload_len, id.
pub const HEADER_LEN: usize = 4 + 1 + 4 + 4 + 4 + 4 + 8;

// Monotonic ids correlate replies with outstanding requests.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Header flag bits.
///
/// Safety and atomicity travel with the message so that the receiving daemon
/// can honour the semantics axes relevant to it; the remaining axes are
/// client-side concerns and stay off the wire.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Flags(u32);

impl Flags {
    pub const REPLY: u32 = 0x01;
    pub const SAFETY_NETWORK: u32 = 0x02;
    pub const SAFETY_STORAGE: u32 = 0x04;
    pub const COMPRESSED: u32 = 0x08;
    pub const ATOMICITY_OPERATION: u32 = 0x10;
    pub const ATOMICITY_BATCH: u32 = 0x20;

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    pub fn is_reply(&self) -> bool {
        self.contains(Self::REPLY)
    }

    pub fn from_semantics(semantics: &Semantics) -> Self {
        let mut flags = Flags::default();

        match semantics.safety() {
            Safety::None => (),
            Safety::Network => flags.0 |= Self::SAFETY_NETWORK,
            Safety::Storage => flags.0 |= Self::SAFETY_STORAGE,
        }

        match semantics.atomicity() {
            Atomicity::None => (),
            Atomicity::Operation => flags.0 |= Self::ATOMICITY_OPERATION,
            Atomicity::Batch => flags.0 |= Self::ATOMICITY_BATCH,
        }

        flags
    }

    /// Reconstruct the wire-relevant semantics axes.
    pub fn semantics(&self) -> Semantics {
        let safety = if self.contains(Self::SAFETY_STORAGE) {
            Safety::Storage
        } else if self.contains(Self::SAFETY_NETWORK) {
            Safety::Network
        } else {
            Safety::None
        };

        let atomicity = if self.contains(Self::ATOMICITY_BATCH) {
            Atomicity::Batch
        } else if self.contains(Self::ATOMICITY_OPERATION) {
            Atomicity::Operation
        } else {
            Atomicity::None
        };

        Semantics::default()
            .with_safety(safety)
            .with_atomicity(atomicity)
    }
}

/// Append-only builder for one outgoing message.
pub struct MessageBuilder {
    opcode: Opcode,
    flags: Flags,
    id: u64,
    payload: BytesMut,
    // Offset of the current record's length prefix, while one is open.
    record_start: Option<usize>,
    op_count: u32,
    send_data: Vec<Bytes>,
}

impl MessageBuilder {
    pub fn new(opcode: Opcode, initial_capacity: usize) -> Self {
        Self {
            opcode,
            flags: Flags::default(),
            id: next_id(),
            payload: BytesMut::with_capacity(initial_capacity),
            record_start: None,
            op_count: 0,
            send_data: Vec::new(),
        }
    }

    /// A reply shares the request's opcode and id and carries the reply flag.
    pub fn reply_to(request: &Message) -> Self {
        let mut builder = Self::new(request.opcode(), 256);
        builder.id = request.id();
        builder.flags.0 |= Flags::REPLY;
        builder
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn set_semantics(&mut self, semantics: &Semantics) {
        self.flags.0 |= Flags::from_semantics(semantics).bits();
    }

    /// Declare the next operation record. `size_hint` pre-reserves payload
    /// space; appends are still unbounded.
    pub fn add_operation(&mut self, size_hint: usize) {
        self.close_record();
        self.payload.reserve(4 + size_hint);
        let start = self.payload.len();
        self.payload.put_u32_le(0); // patched by close_record
        self.record_start = Some(start);
        self.op_count += 1;
    }

    fn close_record(&mut self) {
        if let Some(start) = self.record_start.take() {
            let len = (self.payload.len() - start - 4) as u32;
            self.payload[start..start + 4].copy_from_slice(&len.to_le_bytes());
        }
    }

    pub fn append_u8(&mut self, value: u8) {
        self.payload.put_u8(value);
    }

    pub fn append_u32(&mut self, value: u32) {
        self.payload.put_u32_le(value);
    }

    pub fn append_u64(&mut self, value: u64) {
        self.payload.put_u64_le(value);
    }

    pub fn append_i64(&mut self, value: i64) {
        self.payload.put_i64_le(value);
    }

    /// UTF-8 bytes plus a single terminating NUL.
    pub fn append_string(&mut self, value: &str) {
        self.payload.put_slice(value.as_bytes());
        self.payload.put_u8(0);
    }

    pub fn append_bytes(&mut self, value: &[u8]) {
        self.payload.put_slice(value);
    }

    /// Queue a side payload, sent after the framed payload to spare a copy
    /// through the record buffer.
    pub fn attach_send(&mut self, data: Bytes) {
        self.send_data.push(data);
    }

    /// Freeze into a read-only message.
    pub fn finish(mut self) -> Message {
        self.close_record();

        Message {
            opcode: self.opcode,
            raw_opcode: self.opcode as u32,
            flags: self.flags,
            op_count: self.op_count,
            id: self.id,
            payload: self.payload.freeze(),
            send_data: self.send_data,
            cursor: 0,
            record_end: 0,
            records_entered: 0,
        }
    }
}

/// A frozen message: either built locally and ready to send, or received
/// from a peer and ready to read. Reading walks operation records forward
/// only.
pub struct Message {
    opcode: Opcode,
    raw_opcode: u32,
    flags: Flags,
    op_count: u32,
    id: u64,
    payload: Bytes,
    send_data: Vec<Bytes>,
    cursor: usize,
    record_end: usize,
    records_entered: u32,
}

impl Message {
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// The opcode exactly as received. Differs from [`Message::opcode`]
    /// only when the peer sent a value outside the known table.
    pub fn raw_opcode(&self) -> u32 {
        self.raw_opcode
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn count(&self) -> u32 {
        self.op_count
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn semantics(&self) -> Semantics {
        self.flags.semantics()
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Write the frame: header, payload, side payloads in attach order.
    pub fn send<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut header = BytesMut::with_capacity(HEADER_LEN);
        header.put_u32_le(MAGIC);
        header.put_u8(VERSION);
        header.put_u32_le(self.opcode as u32);
        header.put_u32_le(self.flags.bits());
        header.put_u32_le(self.op_count);
        header.put_u32_le(self.payload.len() as u32);
        header.put_u64_le(self.id);

        writer.write_all(&header).map_err(Error::ConnectionLost)?;
        writer
            .write_all(&self.payload)
            .map_err(Error::ConnectionLost)?;

        for data in &self.send_data {
            write_side_payload(writer, data)?;
        }

        writer.flush().map_err(Error::ConnectionLost)?;

        Ok(())
    }

    /// Read one message. Returns `None` on a clean end of stream (the peer
    /// closed between messages). Side payloads are left in the stream for
    /// the consumer of the affected operations.
    pub fn receive<R: Read>(reader: &mut R, max_payload: u64) -> Result<Option<Message>> {
        let mut header = [0u8; HEADER_LEN];

        // A clean close yields zero bytes before the header starts.
        let mut filled = 0;
        while filled < HEADER_LEN {
            match reader.read(&mut header[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(Error::ShortRead(std::io::Error::from(
                        std::io::ErrorKind::UnexpectedEof,
                    )))
                }
                Ok(n) => filled += n,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::ShortRead(e)),
            }
        }

        let mut buf = &header[..];
        let magic = buf.get_u32_le();
        let version = buf.get_u8();
        let opcode = buf.get_u32_le();
        let flags = Flags(buf.get_u32_le());
        let op_count = buf.get_u32_le();
        let payload_len = buf.get_u32_le();
        let id = buf.get_u64_le();

        if magic != MAGIC {
            return Err(Error::BadMagic { found: magic });
        }

        if version != VERSION {
            return Err(Error::BadVersion { found: version });
        }

        // Unknown opcodes are preserved so the receiver can answer with an
        // error reply instead of dropping the connection.
        let raw_opcode = opcode;
        let opcode = Opcode::try_from(opcode).unwrap_or(Opcode::None);

        // The cap bounds a single operation's payload; a message carries
        // up to one such payload per operation record.
        let cap = max_payload.saturating_mul(u64::from(op_count.max(1)));
        if u64::from(payload_len) > cap {
            return Err(Error::Oversize {
                declared: u64::from(payload_len),
                cap,
            });
        }

        let mut payload = vec![0u8; payload_len as usize];
        reader.read_exact(&mut payload).map_err(Error::ShortRead)?;
        let payload = Bytes::from(payload);

        // Records must tile the payload exactly.
        let mut offset = 0usize;
        let mut records = 0u32;
        while offset < payload.len() {
            if payload.len() - offset < 4 {
                return Err(Error::LengthMismatch);
            }
            let len =
                u32::from_le_bytes(payload[offset..offset + 4].try_into().unwrap()) as usize;
            offset = offset
                .checked_add(4 + len)
                .filter(|end| *end <= payload.len())
                .ok_or(Error::LengthMismatch)?;
            records += 1;
        }

        if records != op_count {
            return Err(Error::LengthMismatch);
        }

        Ok(Some(Message {
            opcode,
            raw_opcode,
            flags,
            op_count,
            id,
            payload,
            send_data: Vec::new(),
            cursor: 0,
            record_end: 0,
            records_entered: 0,
        }))
    }

    /// Advance to the next operation record. Any unread remainder of the
    /// previous record is skipped.
    pub fn next_operation(&mut self) -> Result<()> {
        if self.records_entered >= self.op_count {
            return Err(Error::MalformedMessage);
        }

        self.cursor = self.record_end;
        let len = u32::from_le_bytes(
            self.payload[self.cursor..self.cursor + 4]
                .try_into()
                .unwrap(),
        ) as usize;
        self.cursor += 4;
        self.record_end = self.cursor + len;
        self.records_entered += 1;

        Ok(())
    }

    pub fn remaining_in_record(&self) -> usize {
        self.record_end - self.cursor
    }

    /// Operation records not yet entered via [`Message::next_operation`].
    pub fn records_remaining(&self) -> u32 {
        self.op_count - self.records_entered
    }

    fn take(&mut self, len: usize) -> Result<&[u8]> {
        if self.remaining_in_record() < len {
            return Err(Error::MalformedMessage);
        }

        let slice = &self.payload[self.cursor..self.cursor + len];
        self.cursor += len;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    /// NUL-terminated UTF-8 string.
    pub fn get_string(&mut self) -> Result<&str> {
        let rest = &self.payload[self.cursor..self.record_end];
        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(Error::MalformedMessage)?;

        let s = std::str::from_utf8(&rest[..nul]).map_err(|_| Error::TypeMismatch)?;
        self.cursor += nul + 1;
        Ok(s)
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<Bytes> {
        if self.remaining_in_record() < len {
            return Err(Error::MalformedMessage);
        }

        let slice = self.payload.slice(self.cursor..self.cursor + len);
        self.cursor += len;
        Ok(slice)
    }
}

/// Write one side payload: 64-bit length, then the bytes.
pub fn write_side_payload<W: Write>(writer: &mut W, data: &[u8]) -> Result<()> {
    writer
        .write_all(&(data.len() as u64).to_le_bytes())
        .map_err(Error::ConnectionLost)?;
    writer.write_all(data).map_err(Error::ConnectionLost)?;
    Ok(())
}

/// Read one side payload into `buf`, whose length the consumer already knows
/// from the owning operation record.
pub fn read_side_payload<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    let mut prefix = [0u8; 8];
    reader.read_exact(&mut prefix).map_err(Error::ShortRead)?;

    if u64::from_le_bytes(prefix) != buf.len() as u64 {
        return Err(Error::LengthMismatch);
    }

    reader.read_exact(buf).map_err(Error::ShortRead)?;
    Ok(())
}
