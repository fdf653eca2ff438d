//! LMDB implementation of BanStore.

use heed::types::Bytes;
use heed::{Database, Env};

use cfnode_store::{BanRecord, BanStore, StoreError};

use crate::LmdbError;

pub struct LmdbBanStore {
    env: Env,
    bans_db: Database<Bytes, Bytes>,
}

impl LmdbBanStore {
    pub(crate) fn new(env: Env, bans_db: Database<Bytes, Bytes>) -> Self {
        Self { env, bans_db }
    }
}

impl BanStore for LmdbBanStore {
    fn put_ban(&self, host: &str, record: &BanRecord) -> Result<(), StoreError> {
        let bytes = bincode::serialize(record).map_err(LmdbError::from)?;
        let mut wtxn = self.env.write_txn().map_err(LmdbError::from)?;
        self.bans_db
            .put(&mut wtxn, host.as_bytes(), &bytes)
            .map_err(LmdbError::from)?;
        wtxn.commit().map_err(LmdbError::from)?;
        Ok(())
    }

    fn get_ban(&self, host: &str) -> Result<Option<BanRecord>, StoreError> {
        let rtxn = self.env.read_txn().map_err(LmdbError::from)?;
        let val = self
            .bans_db
            .get(&rtxn, host.as_bytes())
            .map_err(LmdbError::from)?;
        match val {
            Some(bytes) => Ok(Some(bincode::deserialize(bytes).map_err(LmdbError::from)?)),
            None => Ok(None),
        }
    }

    fn delete_ban(&self, host: &str) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn().map_err(LmdbError::from)?;
        self.bans_db
            .delete(&mut wtxn, host.as_bytes())
            .map_err(LmdbError::from)?;
        wtxn.commit().map_err(LmdbError::from)?;
        Ok(())
    }

    fn iter_bans(&self) -> Result<Vec<(String, BanRecord)>, StoreError> {
        let rtxn = self.env.read_txn().map_err(LmdbError::from)?;
        let iter = self.bans_db.iter(&rtxn).map_err(LmdbError::from)?;
        let mut result = Vec::new();
        for entry in iter {
            let (key, val) = entry.map_err(LmdbError::from)?;
            let Ok(host) = std::str::from_utf8(key) else {
                tracing::warn!("skipping ban record with non-utf8 key");
                continue;
            };
            let record: BanRecord = bincode::deserialize(val).map_err(LmdbError::from)?;
            result.push((host.to_string(), record));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::DEFAULT_MAP_SIZE;
    use crate::LmdbEnvironment;
    use cfnode_types::Timestamp;

    fn record(persistent: u32) -> BanRecord {
        BanRecord {
            persistent,
            transient: 5,
            banned_until: Some(Timestamp::new(1_000)),
            reason: "bad feefilter".into(),
        }
    }

    #[test]
    fn put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let env = LmdbEnvironment::open(dir.path(), 4, DEFAULT_MAP_SIZE).unwrap();
        let store = env.ban_store().unwrap();

        store.put_ban("1.2.3.4", &record(40)).unwrap();
        assert_eq!(store.get_ban("1.2.3.4").unwrap(), Some(record(40)));
        assert_eq!(store.get_ban("5.6.7.8").unwrap(), None);

        store.delete_ban("1.2.3.4").unwrap();
        assert_eq!(store.get_ban("1.2.3.4").unwrap(), None);
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let env = LmdbEnvironment::open(dir.path(), 4, DEFAULT_MAP_SIZE).unwrap();
            let store = env.ban_store().unwrap();
            store.put_ban("1.2.3.4", &record(1)).unwrap();
            store.put_ban("9.9.9.9", &record(2)).unwrap();
        }
        let env = LmdbEnvironment::open(dir.path(), 4, DEFAULT_MAP_SIZE).unwrap();
        let mut all = env.ban_store().unwrap().iter_bans().unwrap();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].0, "1.2.3.4");
        assert_eq!(all[1].1.persistent, 2);
    }
}
