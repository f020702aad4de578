//! Full-stack scenarios: a real daemon (or two) on loopback, driven by the
//! client batch engine over the wire protocol.

use std::io::Write as _;

use bytes::Bytes;
use client::{db, kv, object, Client, Distribution, DistributionPolicy, Error};
use daemon::{build_context, Daemon, ShutdownHandle};
use db_types::{
    entry_to_document, schema_to_document, Comparator, DbError, DbType, DbValue, Selector,
};
use semantics::{Atomicity, Safety, Semantics};

struct Cluster {
    client: Option<Client>,
    config: config::Configuration,
    handles: Vec<ShutdownHandle>,
    threads: Vec<std::thread::JoinHandle<()>>,
    ports: Vec<u16>,
    _config_file: tempfile::NamedTempFile,
    _dir: tempfile::TempDir,
}

impl Cluster {
    /// `object_servers` daemons host the object backend; the first one also
    /// hosts kv and db (sqlite on a temp file).
    fn start(object_servers: usize, max_operation_size: u64) -> Cluster {
        let dir = tempfile::tempdir().unwrap();

        let ports: Vec<u16> = (0..object_servers)
            .map(|_| portpicker::pick_unused_port().expect("free port"))
            .collect();

        let object_list = ports
            .iter()
            .map(|port| format!("127.0.0.1:{port}"))
            .collect::<Vec<_>>()
            .join(",");
        let first = format!("127.0.0.1:{}", ports[0]);
        let db_path = dir.path().join("db.sqlite");

        let mut config_file = tempfile::NamedTempFile::new().unwrap();
        write!(
            config_file,
            r#"
[servers]
object = {object_list}
kv = {first}
db = {first}
port = {port}

[backend]
object = memory
kv = memory
db = sqlite
db-path = {db_path}

[limits]
max_operation_size = {max_operation_size}
"#,
            port = ports[0],
            db_path = db_path.display(),
        )
        .unwrap();
        config_file.flush().unwrap();

        let config = config::Configuration::load(config_file.path()).unwrap();

        let mut handles = Vec::new();
        let mut threads = Vec::new();

        for port in &ports {
            let context = build_context(&config, "127.0.0.1", *port).unwrap();
            let daemon = Daemon::bind(context, *port).unwrap();
            handles.push(daemon.handle());
            threads.push(std::thread::spawn(move || daemon.serve().unwrap()));
        }

        let client = Client::new(&config);

        Cluster {
            client: Some(client),
            config,
            handles,
            threads,
            ports,
            _config_file: config_file,
            _dir: dir,
        }
    }

    fn client(&self) -> &Client {
        self.client.as_ref().unwrap()
    }

    /// An independent client with its own connections.
    fn new_client(&self) -> Client {
        Client::new(&self.config)
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        // Close the client connections first so the per-connection handler
        // threads drain, then stop the accept loops.
        self.client.take();

        for handle in &self.handles {
            handle.stop();
        }

        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

fn op_semantics() -> Semantics {
    Semantics::default()
        .with_atomicity(Atomicity::Operation)
        .with_safety(Safety::Network)
}

#[test]
fn ping_reports_hosted_backends() {
    let cluster = Cluster::start(1, 1 << 20);

    let families = cluster.client().ping(0).unwrap();
    assert_eq!(families, vec!["object", "kv", "db"]);
}

#[test]
fn object_write_read_round_trip() {
    let cluster = Cluster::start(1, 1 << 20);
    let client = cluster.client();

    let mut batch = client.batch(Semantics::default().with_safety(Safety::Storage));
    object::create(&mut batch, "ns", "a");
    let written = object::write(&mut batch, "ns", "a", Bytes::from_static(b"ABCD"), 0);
    batch.execute().unwrap();
    assert_eq!(written.take(), Some(4));

    let mut batch = client.batch(Semantics::default());
    let read = object::read(&mut batch, "ns", "a", 2, 1);
    batch.execute().unwrap();
    assert_eq!(read.take().unwrap().as_ref(), b"BC");

    let server = client.object_server("a");
    let statistics = client.statistics(server, false).unwrap();
    assert_eq!(statistics.files_created, 1);
    assert_eq!(statistics.bytes_written, 4);
    assert_eq!(statistics.bytes_read, 2);
    assert!(statistics.sync_count >= 1);

    let mut batch = client.batch(Semantics::default());
    let status = object::status(&mut batch, "ns", "a");
    batch.execute().unwrap();
    let (mtime, size) = status.take().unwrap();
    assert!(mtime > 0);
    assert_eq!(size, 4);
}

#[test]
fn schema_lifecycle_over_the_wire() {
    let cluster = Cluster::start(1, 1 << 20);
    let client = cluster.client();

    let schema = schema_to_document(&[("name", DbType::String), ("age", DbType::Sint32)], &[]);

    let mut batch = client.batch(op_semantics());
    db::schema_create(&mut batch, "ns", "t", &schema);
    batch.execute().unwrap();

    let mut batch = client.batch(op_semantics());
    let id1 = db::insert(
        &mut batch,
        "ns",
        "t",
        &entry_to_document(&[
            ("name", DbValue::String("alice".into())),
            ("age", DbValue::Sint32(30)),
        ]),
    );
    let id2 = db::insert(
        &mut batch,
        "ns",
        "t",
        &entry_to_document(&[
            ("name", DbValue::String("bob".into())),
            ("age", DbValue::Sint32(25)),
        ]),
    );
    batch.execute().unwrap();
    assert_eq!(id1.take(), Some(1));
    assert_eq!(id2.take(), Some(2));

    let selector = Selector::new(db_types::SelectorMode::And).field(
        "age",
        Comparator::Ge,
        DbValue::Sint32(26),
    );

    let mut batch = client.batch(op_semantics());
    let rows = db::query(&mut batch, "ns", "t", &selector);
    batch.execute().unwrap();

    let rows = rows.take().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get_i64("_id").unwrap(), 1);
    assert_eq!(rows[0].get_str("name").unwrap(), "alice");
    assert_eq!(rows[0].get_i32("age").unwrap(), 30);

    let mut batch = client.batch(op_semantics());
    db::delete(&mut batch, "ns", "t", &selector);
    batch.execute().unwrap();

    let mut batch = client.batch(op_semantics());
    let rows = db::query(&mut batch, "ns", "t", &Selector::all());
    batch.execute().unwrap();

    let rows = rows.take().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get_i64("_id").unwrap(), 2);
    assert_eq!(rows[0].get_str("name").unwrap(), "bob");
    assert_eq!(rows[0].get_i32("age").unwrap(), 25);
}

#[test]
fn batch_atomicity_over_the_wire() {
    let cluster = Cluster::start(1, 1 << 20);
    let client = cluster.client();

    let schema = schema_to_document(&[("name", DbType::String), ("age", DbType::Sint32)], &[]);
    let mut batch = client.batch(op_semantics());
    db::schema_create(&mut batch, "ns", "t", &schema);
    batch.execute().unwrap();

    let mut batch = client.batch(Semantics::default().with_atomicity(Atomicity::Batch));
    db::insert(
        &mut batch,
        "ns",
        "t",
        &entry_to_document(&[
            ("name", DbValue::String("x".into())),
            ("age", DbValue::Sint32(1)),
        ]),
    );
    db::insert(
        &mut batch,
        "ns",
        "t",
        &entry_to_document(&[
            ("name", DbValue::String("y".into())),
            ("age", DbValue::String("not-an-int".into())),
        ]),
    );

    // The first insert succeeded inside the transaction but was rolled
    // back, so its record reports the poisoning; the second keeps its own
    // error.
    let first = batch.execute().unwrap_err();
    assert_eq!(first, Error::Db(DbError::BatchPoisoned));
    assert_eq!(
        batch.errors(),
        &[
            (0, Error::Db(DbError::BatchPoisoned)),
            (1, Error::Db(DbError::DbTypeInvalid)),
        ]
    );

    let mut batch = client.batch(op_semantics());
    let rows = db::query(&mut batch, "ns", "t", &Selector::all());
    let result = batch.execute();

    // An empty table queries clean; both inserts are invisible.
    result.unwrap();
    assert_eq!(rows.take().unwrap().len(), 0);
}

#[test]
fn kv_round_trip() {
    let cluster = Cluster::start(1, 1 << 20);
    let client = cluster.client();

    let mut batch = client.batch(op_semantics());
    kv::put(&mut batch, "ns", "user-1", b"alice");
    kv::put(&mut batch, "ns", "user-2", b"bob");
    kv::put(&mut batch, "ns", "group-1", b"admins");
    batch.execute().unwrap();

    let mut batch = client.batch(op_semantics());
    let found = kv::get(&mut batch, "ns", "user-1");
    let missing = kv::get(&mut batch, "ns", "user-9");
    batch.execute().unwrap();
    assert_eq!(found.take().unwrap().as_deref(), Some(b"alice".as_ref()));
    assert_eq!(missing.take().unwrap(), None);

    let mut batch = client.batch(op_semantics());
    let pairs = kv::get_by_prefix(&mut batch, 0, "ns", "user-");
    batch.execute().unwrap();
    let pairs = pairs.take().unwrap();
    assert_eq!(
        pairs.iter().map(|(key, _)| key.as_str()).collect::<Vec<_>>(),
        vec!["user-1", "user-2"]
    );

    let mut batch = client.batch(op_semantics());
    kv::delete(&mut batch, "ns", "user-1");
    batch.execute().unwrap();

    let mut batch = client.batch(op_semantics());
    let all = kv::get_all(&mut batch, 0, "ns");
    batch.execute().unwrap();
    assert_eq!(all.take().unwrap().len(), 2);
}

#[test]
fn safety_none_elides_replies() {
    let cluster = Cluster::start(1, 1 << 20);
    let client = cluster.client();

    // No reply is requested or read for the put.
    let mut batch = client.batch(Semantics::default());
    kv::put(&mut batch, "ns", "quiet", b"value");
    batch.execute().unwrap();

    let mut batch = client.batch(op_semantics());
    let found = kv::get(&mut batch, "ns", "quiet");
    batch.execute().unwrap();
    assert_eq!(found.take().unwrap().as_deref(), Some(b"value".as_ref()));
}

#[test]
fn striped_object_io_across_two_servers() {
    let cluster = Cluster::start(2, 1 << 20);
    let client = cluster.client();

    let data: Vec<u8> = (0..24u8).collect();
    let mut distribution = Distribution::new(
        DistributionPolicy::RoundRobin { stripe_size: 8 },
        client.object_server_count(),
    );

    let mut batch = client.batch(op_semantics());
    let written = object::write_striped(
        &mut batch,
        &mut distribution,
        "ns",
        "striped",
        Bytes::from(data.clone()),
        0,
    );
    batch.execute().unwrap();

    assert_eq!(written.len(), 3);
    for stripe in &written {
        assert_eq!(stripe.take(), Some(8));
    }

    let mut batch = client.batch(op_semantics());
    let stripes = object::read_striped(&mut batch, &mut distribution, "ns", "striped", 24, 0);
    batch.execute().unwrap();

    let mut reassembled = Vec::new();
    for stripe in &stripes {
        reassembled.extend_from_slice(&stripe.take().unwrap());
    }
    assert_eq!(reassembled, data);
}

#[test]
fn arena_exhaustion_splits_replies() {
    // A 64-byte arena forces the daemon to flush partial read replies.
    let cluster = Cluster::start(1, 64);
    let client = cluster.client();

    for name in ["a", "b", "c"] {
        let mut batch = client.batch(op_semantics());
        let payload: Vec<u8> = std::iter::repeat(name.as_bytes()[0]).take(48).collect();
        object::write(&mut batch, "ns", name, Bytes::from(payload), 0);
        batch.execute().unwrap();
    }

    // Three 48-byte reads cannot share one 64-byte arena: the daemon
    // flushes between them and the client stitches the replies together.
    let mut batch = client.batch(op_semantics());
    let reads: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|name| object::read(&mut batch, "ns", name, 48, 0))
        .collect();
    batch.execute().unwrap();

    for (name, read) in ["a", "b", "c"].iter().zip(reads) {
        let data = read.take().unwrap();
        assert_eq!(data.len(), 48);
        assert!(data.iter().all(|b| *b == name.as_bytes()[0]));
    }
}

#[test]
fn object_delete_removes_the_object() {
    let cluster = Cluster::start(1, 1 << 20);
    let client = cluster.client();

    let mut batch = client.batch(op_semantics());
    object::create(&mut batch, "ns", "doomed");
    object::write(&mut batch, "ns", "doomed", Bytes::from_static(b"x"), 0);
    batch.execute().unwrap();

    let mut batch = client.batch(op_semantics());
    object::delete(&mut batch, "ns", "doomed");
    batch.execute().unwrap();

    // A read of a deleted object comes back empty.
    let mut batch = client.batch(op_semantics());
    let read = object::read(&mut batch, "ns", "doomed", 1, 0);
    batch.execute().unwrap();
    assert_eq!(read.take().unwrap().len(), 0);

    // Deleting it again reports not-found.
    let mut batch = client.batch(op_semantics());
    object::delete(&mut batch, "ns", "doomed");
    assert_eq!(batch.execute().unwrap_err(), Error::NotFound);
    assert_eq!(batch.errors().len(), 1);
}

#[test]
fn schema_get_and_delete_over_the_wire() {
    let cluster = Cluster::start(1, 1 << 20);
    let client = cluster.client();

    let schema = schema_to_document(
        &[("name", DbType::String), ("age", DbType::Sint32)],
        &[&["age"]],
    );

    let mut batch = client.batch(op_semantics());
    db::schema_create(&mut batch, "ns", "t", &schema);
    batch.execute().unwrap();

    let mut batch = client.batch(op_semantics());
    let fetched = db::schema_get(&mut batch, "ns", "t");
    batch.execute().unwrap();

    // The synthetic id is part of the catalogued field map.
    let fields = db_types::schema_fields_from_document(&fetched.take().unwrap()).unwrap();
    assert_eq!(
        fields,
        vec![
            ("_id".to_string(), DbType::Uint64),
            ("name".to_string(), DbType::String),
            ("age".to_string(), DbType::Sint32),
        ]
    );

    let mut batch = client.batch(op_semantics());
    db::schema_delete(&mut batch, "ns", "t");
    batch.execute().unwrap();

    let mut batch = client.batch(op_semantics());
    let gone = db::schema_get(&mut batch, "ns", "t");
    assert_eq!(
        batch.execute().unwrap_err(),
        Error::Db(DbError::SchemaNotFound)
    );
    assert!(gone.take().is_none());
}

#[test]
fn daemon_statistics_aggregate_closed_connections() {
    let cluster = Cluster::start(1, 1 << 20);

    {
        // A short-lived client whose counters fold into the daemon-wide
        // statistics when its connection closes.
        let short_lived = cluster.new_client();
        let mut batch = short_lived.batch(op_semantics());
        object::create(&mut batch, "ns", "counted");
        object::write(&mut batch, "ns", "counted", Bytes::from_static(b"1234"), 0);
        batch.execute().unwrap();
    }

    // Poll: the fold happens when the daemon notices the closed socket.
    let client = cluster.client();
    let server = client.object_server("counted");

    for _ in 0..50 {
        let aggregate = client.statistics(server, true).unwrap();
        if aggregate.files_created >= 1 && aggregate.bytes_written >= 4 {
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
    }

    panic!("daemon-wide statistics never absorbed the closed connection");
}

#[test]
fn wrong_backend_is_rejected_per_reply() {
    // A daemon that hosts only the object family, and a client whose
    // configuration wrongly claims it also hosts kv.
    let daemon_port = portpicker::pick_unused_port().unwrap();
    let elsewhere = portpicker::pick_unused_port().unwrap();

    let write_config = |kv_port: u16| {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[servers]
object = 127.0.0.1:{daemon_port}
kv = 127.0.0.1:{kv_port}
db = 127.0.0.1:{kv_port}
port = {daemon_port}

[backend]
object = memory
kv = memory
db = sqlite
db-path = unused

[limits]
"#
        )
        .unwrap();
        file.flush().unwrap();
        file
    };

    let daemon_config_file = write_config(elsewhere);
    let daemon_config = config::Configuration::load(daemon_config_file.path()).unwrap();
    let context = build_context(&daemon_config, "127.0.0.1", daemon_port).unwrap();
    assert!(context.object.is_some());
    assert!(context.kv.is_none());

    let daemon = Daemon::bind(context, daemon_port).unwrap();
    let handle = daemon.handle();
    let thread = std::thread::spawn(move || daemon.serve().unwrap());

    let client_config_file = write_config(daemon_port);
    let client_config = config::Configuration::load(client_config_file.path()).unwrap();
    let client = Client::new(&client_config);

    let mut batch = client.batch(op_semantics());
    kv::put(&mut batch, "ns", "key", b"value");
    assert_eq!(batch.execute().unwrap_err(), Error::WrongBackendHere);

    drop(client);
    handle.stop();
    let _ = thread.join();
}

#[test]
fn unknown_opcode_keeps_the_connection_up() {
    use message::{Message, MessageBuilder, Opcode};

    let cluster = Cluster::start(1, 1 << 20);
    let port = cluster.ports[0];

    let mut stream = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();

    // A header with an opcode outside the table.
    let mut raw = Vec::new();
    raw.extend_from_slice(&0x4A55_4C41u32.to_le_bytes()); // magic
    raw.push(1); // version
    raw.extend_from_slice(&99u32.to_le_bytes()); // opcode
    raw.extend_from_slice(&0u32.to_le_bytes()); // flags
    raw.extend_from_slice(&0u32.to_le_bytes()); // op_count
    raw.extend_from_slice(&0u32.to_le_bytes()); // payload_len
    raw.extend_from_slice(&7u64.to_le_bytes()); // id
    stream.write_all(&raw).unwrap();

    let mut reply = Message::receive(&mut stream, u64::from(u32::MAX))
        .unwrap()
        .unwrap();
    assert_eq!(reply.id(), 7);
    assert_eq!(reply.count(), 1);
    reply.next_operation().unwrap();
    assert_eq!(reply.get_u32().unwrap(), message::status::UNKNOWN_OPCODE);

    // The connection survives: a ping still works.
    let ping = MessageBuilder::new(Opcode::Ping, 0).finish();
    ping.send(&mut stream).unwrap();
    let reply = Message::receive(&mut stream, u64::from(u32::MAX))
        .unwrap()
        .unwrap();
    assert_eq!(reply.id(), ping.id());
    assert_eq!(reply.count(), 3);
}
