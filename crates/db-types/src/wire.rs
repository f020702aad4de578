use bson::Document;
use message::{Message, MessageBuilder};

/// Failure while moving a document through an operation record.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error(transparent)]
    Message(#[from] message::Error),
    #[error("malformed bson document")]
    MalformedBson(#[source] bson::de::Error),
}

/// Append a document to the current operation record: `len: u32` followed by
/// the standard BSON encoding.
pub fn append_document(builder: &mut MessageBuilder, doc: &Document) {
    // Serialising into a Vec only fails on depth/key constraints that our
    // builders cannot produce.
    let bytes = bson::to_vec(doc).expect("document serialisation cannot fail");
    builder.append_u32(bytes.len() as u32);
    builder.append_bytes(&bytes);
}

/// Read a document from the current operation record.
pub fn get_document(msg: &mut Message) -> Result<Document, DocumentError> {
    let len = msg.get_u32()? as usize;
    let bytes = msg.get_bytes(len)?;
    bson::from_slice(&bytes).map_err(DocumentError::MalformedBson)
}

#[cfg(test)]
mod test {
    use super::*;
    use bson::Bson;
    use message::Opcode;

    #[test]
    fn document_round_trip_through_a_record() {
        let mut doc = Document::new();
        doc.insert("name", Bson::String("alice".into()));
        doc.insert("age", Bson::Int32(30));

        let mut builder = MessageBuilder::new(Opcode::DbInsert, 64);
        builder.add_operation(0);
        builder.append_string("ns");
        builder.append_string("people");
        append_document(&mut builder, &doc);

        let mut wire = Vec::new();
        builder.finish().send(&mut wire).unwrap();
        let mut parsed = Message::receive(&mut wire.as_slice(), 1 << 20)
            .unwrap()
            .unwrap();

        parsed.next_operation().unwrap();
        assert_eq!(parsed.get_string().unwrap(), "ns");
        assert_eq!(parsed.get_string().unwrap(), "people");
        assert_eq!(get_document(&mut parsed).unwrap(), doc);
    }

    #[test]
    fn truncated_document_is_malformed() {
        let mut builder = MessageBuilder::new(Opcode::DbInsert, 16);
        builder.add_operation(0);
        builder.append_u32(400); // declares more bytes than the record holds
        builder.append_bytes(&[1, 2, 3]);

        let mut wire = Vec::new();
        builder.finish().send(&mut wire).unwrap();
        let mut parsed = Message::receive(&mut wire.as_slice(), 1 << 20)
            .unwrap()
            .unwrap();

        parsed.next_operation().unwrap();
        assert!(get_document(&mut parsed).is_err());
    }
}
