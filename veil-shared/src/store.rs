use crate::exception::VeilResult;
use crate::messages::StorageKey;
use async_trait::async_trait;

/// A single keyed write; `value: None` deletes the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub key: StorageKey,
    pub value: Option<Vec<u8>>,
}

impl WriteRecord {
    pub fn put(key: StorageKey, value: Vec<u8>) -> Self {
        Self {
            key,
            value: Some(value),
        }
    }

    pub fn delete(key: StorageKey) -> Self {
        Self { key, value: None }
    }

    pub fn is_delete(&self) -> bool {
        self.value.is_none()
    }
}

/// Boundary to the (possibly oblivious) backing store.
///
/// The transaction manager is the only consumer; the session layer never
/// touches storage directly. Batch variants exist so a padding/batching
/// store implementation can serve a whole stride in one round.
#[async_trait]
pub trait BackingStore: Send + Sync {
    async fn read(&self, key: StorageKey) -> VeilResult<Option<Vec<u8>>>;

    async fn read_batch(&self, keys: &[StorageKey]) -> VeilResult<Vec<Option<Vec<u8>>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.read(*key).await?);
        }
        Ok(values)
    }

    async fn write(&self, write: WriteRecord) -> VeilResult<()>;

    async fn write_batch(&self, writes: Vec<WriteRecord>) -> VeilResult<()> {
        for write in writes {
            self.write(write).await?;
        }
        Ok(())
    }
}
