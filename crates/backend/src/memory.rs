//! In-memory object and kv backends. They are the reference collaborators
//! the daemon hosts when no durable backend is configured, and the fixture
//! the dispatch tests run against.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use semantics::Semantics;

use crate::{
    BackendError, KvBackend, KvBatch, KvIterator, ObjectBackend, ObjectHandle,
};

fn now_usec() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

#[derive(Default)]
struct MemoryObject {
    data: Vec<u8>,
    mtime_usec: i64,
}

type ObjectMap = HashMap<(String, String), Arc<Mutex<MemoryObject>>>;

#[derive(Default)]
pub struct MemoryObjectBackend {
    objects: Arc<Mutex<ObjectMap>>,
}

impl MemoryObjectBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObjectBackend for MemoryObjectBackend {
    fn create(&self, namespace: &str, name: &str) -> Result<Box<dyn ObjectHandle>, BackendError> {
        let key = (namespace.to_string(), name.to_string());
        let object = Arc::new(Mutex::new(MemoryObject {
            data: Vec::new(),
            mtime_usec: now_usec(),
        }));

        self.objects
            .lock()
            .unwrap()
            .insert(key.clone(), object.clone());

        Ok(Box::new(MemoryObjectHandle {
            key,
            object,
            objects: self.objects.clone(),
        }))
    }

    fn open(&self, namespace: &str, name: &str) -> Result<Box<dyn ObjectHandle>, BackendError> {
        let key = (namespace.to_string(), name.to_string());
        let object = self
            .objects
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or(BackendError::NotFound)?;

        Ok(Box::new(MemoryObjectHandle {
            key,
            object,
            objects: self.objects.clone(),
        }))
    }
}

struct MemoryObjectHandle {
    key: (String, String),
    object: Arc<Mutex<MemoryObject>>,
    objects: Arc<Mutex<ObjectMap>>,
}

impl ObjectHandle for MemoryObjectHandle {
    fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<u64, BackendError> {
        let object = self.object.lock().unwrap();
        let offset = offset as usize;

        if offset >= object.data.len() {
            return Ok(0);
        }

        let available = object.data.len() - offset;
        let n = buf.len().min(available);
        buf[..n].copy_from_slice(&object.data[offset..offset + n]);
        Ok(n as u64)
    }

    fn write(&mut self, data: &[u8], offset: u64) -> Result<u64, BackendError> {
        let mut object = self.object.lock().unwrap();
        let end = offset as usize + data.len();

        if object.data.len() < end {
            object.data.resize(end, 0);
        }

        object.data[offset as usize..end].copy_from_slice(data);
        object.mtime_usec = now_usec();
        Ok(data.len() as u64)
    }

    fn status(&mut self) -> Result<(i64, u64), BackendError> {
        let object = self.object.lock().unwrap();
        Ok((object.mtime_usec, object.data.len() as u64))
    }

    fn sync(&mut self) -> Result<(), BackendError> {
        // Nothing more durable than memory to flush to.
        Ok(())
    }

    fn delete(self: Box<Self>) -> Result<(), BackendError> {
        self.objects
            .lock()
            .unwrap()
            .remove(&self.key)
            .map(|_| ())
            .ok_or(BackendError::NotFound)
    }
}

type KvMap = HashMap<String, BTreeMap<String, Vec<u8>>>;

#[derive(Default)]
pub struct MemoryKvBackend {
    namespaces: Arc<Mutex<KvMap>>,
}

impl MemoryKvBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvBackend for MemoryKvBackend {
    fn batch_start(
        &self,
        namespace: &str,
        _semantics: Semantics,
    ) -> Result<Box<dyn KvBatch + '_>, BackendError> {
        Ok(Box::new(MemoryKvBatch {
            namespace: namespace.to_string(),
            namespaces: self.namespaces.clone(),
        }))
    }

    fn get_all(&self, namespace: &str) -> Result<Box<dyn KvIterator>, BackendError> {
        self.snapshot(namespace, "")
    }

    fn get_by_prefix(
        &self,
        namespace: &str,
        prefix: &str,
    ) -> Result<Box<dyn KvIterator>, BackendError> {
        self.snapshot(namespace, prefix)
    }
}

impl MemoryKvBackend {
    fn snapshot(&self, namespace: &str, prefix: &str) -> Result<Box<dyn KvIterator>, BackendError> {
        let namespaces = self.namespaces.lock().unwrap();
        let pairs = namespaces
            .get(namespace)
            .map(|space| {
                space
                    .range(prefix.to_string()..)
                    .take_while(|(key, _)| key.starts_with(prefix))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Box::new(MemoryKvIterator { pairs, next: 0 }))
    }
}

struct MemoryKvBatch {
    namespace: String,
    namespaces: Arc<Mutex<KvMap>>,
}

impl KvBatch for MemoryKvBatch {
    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), BackendError> {
        self.namespaces
            .lock()
            .unwrap()
            .entry(self.namespace.clone())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: &str) -> Result<(), BackendError> {
        self.namespaces
            .lock()
            .unwrap()
            .get_mut(&self.namespace)
            .and_then(|space| space.remove(key))
            .map(|_| ())
            .ok_or(BackendError::NotFound)
    }

    fn get(&mut self, key: &str) -> Result<Vec<u8>, BackendError> {
        self.namespaces
            .lock()
            .unwrap()
            .get(&self.namespace)
            .and_then(|space| space.get(key))
            .cloned()
            .ok_or(BackendError::NotFound)
    }

    fn execute(self: Box<Self>) -> Result<(), BackendError> {
        // Mutations apply eagerly; there is nothing to flush.
        Ok(())
    }
}

struct MemoryKvIterator {
    pairs: Vec<(String, Vec<u8>)>,
    next: usize,
}

impl KvIterator for MemoryKvIterator {
    fn next_pair(&mut self) -> Option<(String, Vec<u8>)> {
        let pair = self.pairs.get(self.next).cloned();
        self.next += 1;
        pair
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn object_write_read_status() {
        let backend = MemoryObjectBackend::new();

        let mut handle = backend.create("ns", "a").unwrap();
        assert_eq!(handle.write(b"ABCD", 0).unwrap(), 4);

        let mut buf = [0u8; 2];
        assert_eq!(handle.read(&mut buf, 1).unwrap(), 2);
        assert_eq!(&buf, b"BC");

        let (mtime, size) = handle.status().unwrap();
        assert!(mtime > 0);
        assert_eq!(size, 4);

        // Reads past the end are empty, sparse writes zero-fill.
        let mut buf = [0u8; 4];
        assert_eq!(handle.read(&mut buf, 100).unwrap(), 0);
        handle.write(b"Z", 6).unwrap();
        let (_, size) = handle.status().unwrap();
        assert_eq!(size, 7);

        drop(handle);
        let handle = backend.open("ns", "a").unwrap();
        handle.delete().unwrap();
        assert!(matches!(
            backend.open("ns", "a"),
            Err(BackendError::NotFound)
        ));
    }

    #[test]
    fn create_truncates() {
        let backend = MemoryObjectBackend::new();
        backend.create("ns", "a").unwrap().write(b"old", 0).unwrap();

        let mut handle = backend.create("ns", "a").unwrap();
        let (_, size) = handle.status().unwrap();
        assert_eq!(size, 0);
    }

    #[test]
    fn kv_round_trip_and_prefix() {
        let backend = MemoryKvBackend::new();
        let semantics = Semantics::default();

        let mut batch = backend.batch_start("ns", semantics).unwrap();
        batch.put("user-1", b"alice").unwrap();
        batch.put("user-2", b"bob").unwrap();
        batch.put("group-1", b"admins").unwrap();
        batch.execute().unwrap();

        let mut batch = backend.batch_start("ns", semantics).unwrap();
        assert_eq!(batch.get("user-1").unwrap(), b"alice");
        assert!(matches!(batch.get("user-9"), Err(BackendError::NotFound)));

        let mut iter = backend.get_by_prefix("ns", "user-").unwrap();
        let mut keys = Vec::new();
        while let Some((key, _)) = iter.next_pair() {
            keys.push(key);
        }
        assert_eq!(keys, vec!["user-1", "user-2"]);

        let mut iter = backend.get_all("ns").unwrap();
        let mut count = 0;
        while iter.next_pair().is_some() {
            count += 1;
        }
        assert_eq!(count, 3);

        // Namespaces are independent.
        let mut iter = backend.get_all("other").unwrap();
        assert!(iter.next_pair().is_none());
    }
}
