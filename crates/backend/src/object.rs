use crate::BackendError;

/// Object storage: arbitrary byte ranges addressed by `(namespace, name)`.
pub trait ObjectBackend: Send + Sync {
    /// Create the object, or truncate it if it already exists.
    fn create(&self, namespace: &str, name: &str) -> Result<Box<dyn ObjectHandle>, BackendError>;

    fn open(&self, namespace: &str, name: &str) -> Result<Box<dyn ObjectHandle>, BackendError>;
}

/// An open object. Closing is dropping.
pub trait ObjectHandle {
    fn read(&mut self, buf: &mut [u8], offset: u64) -> Result<u64, BackendError>;

    fn write(&mut self, data: &[u8], offset: u64) -> Result<u64, BackendError>;

    /// Modification time in microseconds since the epoch, and current size.
    fn status(&mut self) -> Result<(i64, u64), BackendError>;

    /// Durably persist previous writes.
    fn sync(&mut self) -> Result<(), BackendError>;

    fn delete(self: Box<Self>) -> Result<(), BackendError>;
}
