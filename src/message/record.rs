use bytes::Bytes;

/// A key/value entry as read from one partition of the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
}

impl RawRecord {
    pub fn new(partition: i32, offset: i64, key: Option<Bytes>, value: Bytes) -> Self {
        RawRecord {
            partition,
            offset,
            key,
            value,
        }
    }
}
