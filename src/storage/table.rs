use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;

use super::error::StorageError;

/// Derives the ordered index prefix of a record.
pub type IndexKeyFn<T> = fn(&T) -> Vec<u8>;

struct Index<T> {
    tree: sled::Tree,
    key_fn: IndexKeyFn<T>,
}

/// A typed table stored in a dedicated Sled tree, with an optional ordered
/// secondary index kept in a second tree.
///
/// Index entries are keyed by `index prefix ++ primary key` and point back at
/// the primary key, so a prefix scan yields records in index order. A put or
/// remove updates the record and its index entry in one transaction.
pub struct Table<T> {
    name: String,
    records: sled::Tree,
    index: Option<Index<T>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Table<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn open(db: &sled::Db, name: &str) -> Result<Self, StorageError> {
        Ok(Self {
            name: name.to_string(),
            records: db.open_tree(name)?,
            index: None,
            _marker: PhantomData,
        })
    }

    pub fn open_indexed(
        db: &sled::Db,
        name: &str,
        index_name: &str,
        key_fn: IndexKeyFn<T>,
    ) -> Result<Self, StorageError> {
        let tree = db.open_tree(format!("{}_by_{}", name, index_name))?;
        Ok(Self {
            name: name.to_string(),
            records: db.open_tree(name)?,
            index: Some(Index { tree, key_fn }),
            _marker: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<T>, StorageError> {
        match self.records.get(key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put(&self, key: &[u8], value: &T) -> Result<(), StorageError> {
        let bytes = encode(value)?;

        let index = match &self.index {
            Some(index) => index,
            None => {
                self.records.insert(key, bytes)?;
                return Ok(());
            }
        };

        let key_fn = index.key_fn;
        let new_index_key = index_key(&key_fn(value), key);

        let result: Result<(), TransactionError<StorageError>> = (&self.records, &index.tree)
            .transaction(|(records, index_tree)| {
                if let Some(old) = records.insert(key, bytes.as_slice())? {
                    let old: T = decode(&old).map_err(ConflictableTransactionError::Abort)?;
                    let old_index_key = index_key(&key_fn(&old), key);
                    if old_index_key != new_index_key {
                        index_tree.remove(old_index_key.as_slice())?;
                    }
                }
                index_tree.insert(new_index_key.as_slice(), key)?;
                Ok(())
            });

        result.map_err(map_transaction_error)
    }

    /// Removes a record and its index entry, returning the removed record.
    pub fn remove(&self, key: &[u8]) -> Result<Option<T>, StorageError> {
        let index = match &self.index {
            Some(index) => index,
            None => {
                return match self.records.remove(key)? {
                    Some(bytes) => Ok(Some(decode(&bytes)?)),
                    None => Ok(None),
                };
            }
        };

        let key_fn = index.key_fn;
        let result: Result<Option<T>, TransactionError<StorageError>> =
            (&self.records, &index.tree).transaction(|(records, index_tree)| {
                match records.remove(key)? {
                    Some(old) => {
                        let old: T = decode(&old).map_err(ConflictableTransactionError::Abort)?;
                        index_tree.remove(index_key(&key_fn(&old), key).as_slice())?;
                        Ok(Some(old))
                    }
                    None => Ok(None),
                }
            });

        result.map_err(map_transaction_error)
    }

    /// Records whose index key starts with `prefix`, in index order. Without
    /// an index this returns every record in primary-key order.
    pub fn scan_index(&self, prefix: &[u8]) -> Result<Vec<T>, StorageError> {
        let index = match &self.index {
            Some(index) => index,
            None => return self.values(),
        };

        let mut results = Vec::new();
        for item in index.tree.scan_prefix(prefix) {
            let (_index_key, primary_key) = item?;
            if let Some(bytes) = self.records.get(&primary_key)? {
                results.push(decode(&bytes)?);
            }
        }
        Ok(results)
    }

    /// First record in index order under `prefix`.
    pub fn first_in_index(&self, prefix: &[u8]) -> Result<Option<T>, StorageError> {
        let index = match &self.index {
            Some(index) => index,
            None => {
                return match self.records.first()? {
                    Some((_key, bytes)) => Ok(Some(decode(&bytes)?)),
                    None => Ok(None),
                }
            }
        };

        for item in index.tree.scan_prefix(prefix) {
            let (_index_key, primary_key) = item?;
            if let Some(bytes) = self.records.get(&primary_key)? {
                return Ok(Some(decode(&bytes)?));
            }
        }
        Ok(None)
    }

    pub fn count_index(&self, prefix: &[u8]) -> Result<usize, StorageError> {
        match &self.index {
            Some(index) => {
                let mut count = 0;
                for item in index.tree.scan_prefix(prefix) {
                    item?;
                    count += 1;
                }
                Ok(count)
            }
            None => Ok(self.records.len()),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn values(&self) -> Result<Vec<T>, StorageError> {
        let mut results = Vec::new();
        for item in self.records.iter() {
            let (_key, bytes) = item?;
            results.push(decode(&bytes)?);
        }
        Ok(results)
    }

    pub async fn flush(&self) -> Result<(), StorageError> {
        self.records.flush_async().await?;
        if let Some(index) = &self.index {
            index.tree.flush_async().await?;
        }
        Ok(())
    }
}

fn index_key(prefix: &[u8], primary_key: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + primary_key.len());
    key.extend_from_slice(prefix);
    key.extend_from_slice(primary_key);
    key
}

fn map_transaction_error(err: TransactionError<StorageError>) -> StorageError {
    match err {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => StorageError::SledError(e.to_string()),
    }
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StorageError::EncodeError(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| StorageError::DecodeError(e.to_string()))
}
