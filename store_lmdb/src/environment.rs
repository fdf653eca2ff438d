//! LMDB environment setup.

use std::path::Path;

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};

use crate::{LmdbBanStore, LmdbError};

/// Default map size: 64 MiB is plenty for ban records.
pub const DEFAULT_MAP_SIZE: usize = 64 * 1024 * 1024;

const BANS_DB: &str = "bans";

/// Wraps the LMDB environment shared by every store in this crate.
pub struct LmdbEnvironment {
    env: Env,
}

impl LmdbEnvironment {
    /// Open or create an LMDB environment at the given path.
    pub fn open(path: &Path, max_dbs: u32, map_size: usize) -> Result<Self, LmdbError> {
        std::fs::create_dir_all(path)?;
        // SAFETY: the environment is opened once per path within this process.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(max_dbs)
                .open(path)?
        };
        tracing::debug!(path = %path.display(), "opened LMDB environment");
        Ok(Self { env })
    }

    /// Open (creating if needed) the ban database.
    pub fn ban_store(&self) -> Result<LmdbBanStore, LmdbError> {
        let mut wtxn = self.env.write_txn()?;
        let db: Database<Bytes, Bytes> = self.env.create_database(&mut wtxn, Some(BANS_DB))?;
        wtxn.commit()?;
        Ok(LmdbBanStore::new(self.env.clone(), db))
    }
}
