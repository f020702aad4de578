/// Operation counters. Each connection accumulates its own and folds them
/// into the shared daemon statistics when it closes.
#[derive(Clone, Copy, Debug, Default)]
pub struct Statistics {
    pub files_created: u64,
    pub files_deleted: u64,
    pub files_stated: u64,
    pub sync_count: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

impl Statistics {
    pub fn fold(&mut self, other: &Statistics) {
        self.files_created += other.files_created;
        self.files_deleted += other.files_deleted;
        self.files_stated += other.files_stated;
        self.sync_count += other.sync_count;
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
        self.bytes_received += other.bytes_received;
        self.bytes_sent += other.bytes_sent;
    }
}
