use semantics::Semantics;

use crate::BackendError;

/// Key-value storage namespaced into independent key spaces.
pub trait KvBackend: Send + Sync {
    fn batch_start(
        &self,
        namespace: &str,
        semantics: Semantics,
    ) -> Result<Box<dyn KvBatch + '_>, BackendError>;

    fn get_all(&self, namespace: &str) -> Result<Box<dyn KvIterator>, BackendError>;

    fn get_by_prefix(
        &self,
        namespace: &str,
        prefix: &str,
    ) -> Result<Box<dyn KvIterator>, BackendError>;
}

/// Mutations and point lookups grouped under one semantics descriptor.
pub trait KvBatch {
    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), BackendError>;

    fn delete(&mut self, key: &str) -> Result<(), BackendError>;

    fn get(&mut self, key: &str) -> Result<Vec<u8>, BackendError>;

    fn execute(self: Box<Self>) -> Result<(), BackendError>;
}

pub trait KvIterator {
    fn next_pair(&mut self) -> Option<(String, Vec<u8>)>;
}
