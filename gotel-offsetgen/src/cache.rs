// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of gotel

//! Persistent build cache. One entry per (toolchain, app-version, struct,
//! field): a build that already answered a question is never repeated,
//! including builds that answered "this field does not exist here".

use std::path::Path;

use log::warn;
use semver::Version;
use serde::{Deserialize, Serialize};
use sled::Db;

use crate::{errors::GenError, manifest::WantedField};

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct CachedOffset {
    offset: Option<u64>,
}

pub struct OffsetCache {
    db: Db,
}

impl OffsetCache {
    pub fn open(storage_dir: &Path) -> Result<Self, GenError> {
        let db = sled::open(storage_dir.join("offset-cache"))
            .map_err(|e| GenError::Error(format!("unable to open cache: {e}")))?;
        Ok(OffsetCache { db })
    }

    fn key(toolchain: &Version, app_version: &Version, field: &WantedField) -> String {
        format!(
            "{toolchain}|{app_version}|{}|{}",
            field.struct_key(),
            field.field
        )
    }

    /// A hit is `Some(sampled offset)` where the sample itself may be
    /// `None` ("known absent at this version"). A corrupt cache is
    /// discarded wholesale and reported as a miss, so the run regenerates
    /// it.
    pub fn get(
        &self,
        toolchain: &Version,
        app_version: &Version,
        field: &WantedField,
    ) -> Result<Option<Option<u64>>, GenError> {
        let key = Self::key(toolchain, app_version, field);
        let Some(raw) = self
            .db
            .get(&key)
            .map_err(|e| GenError::Error(format!("cache read of {key}: {e}")))?
        else {
            return Ok(None);
        };
        match serde_json::from_slice::<CachedOffset>(&raw) {
            Ok(cached) => Ok(Some(cached.offset)),
            Err(e) => {
                warn!("{}", GenError::CacheCorrupt(e.to_string()));
                self.db
                    .clear()
                    .map_err(|e| GenError::Error(format!("cache discard: {e}")))?;
                Ok(None)
            }
        }
    }

    pub fn put(
        &self,
        toolchain: &Version,
        app_version: &Version,
        field: &WantedField,
        offset: Option<u64>,
    ) -> Result<(), GenError> {
        let key = Self::key(toolchain, app_version, field);
        let value = serde_json::to_vec(&CachedOffset { offset })
            .map_err(|e| GenError::Error(format!("cache encode: {e}")))?;
        self.db
            .insert(key.as_bytes(), value)
            .map_err(|e| GenError::Error(format!("cache write of {key}: {e}")))?;
        Ok(())
    }

    pub fn flush(&self) -> Result<(), GenError> {
        self.db
            .flush()
            .map(|_| ())
            .map_err(|e| GenError::Error(format!("cache flush: {e}")))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn cache() -> (tempfile::TempDir, OffsetCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = OffsetCache::open(dir.path()).unwrap();
        (dir, cache)
    }

    #[test]
    fn test_round_trip() {
        let (_dir, cache) = cache();
        let toolchain = Version::new(1, 21, 0);
        let field = WantedField::new("runtime", "g", "goid");

        assert_eq!(cache.get(&toolchain, &toolchain, &field).unwrap(), None);
        cache.put(&toolchain, &toolchain, &field, Some(152)).unwrap();
        assert_eq!(
            cache.get(&toolchain, &toolchain, &field).unwrap(),
            Some(Some(152))
        );
    }

    #[test]
    fn test_absent_sample_is_a_hit() {
        let (_dir, cache) = cache();
        let toolchain = Version::new(1, 12, 0);
        let field = WantedField::new("net/http", "Request", "Pattern");

        cache.put(&toolchain, &toolchain, &field, None).unwrap();
        assert_eq!(
            cache.get(&toolchain, &toolchain, &field).unwrap(),
            Some(None)
        );
    }

    #[test]
    fn test_corrupt_entry_discards_cache() {
        let (_dir, cache) = cache();
        let toolchain = Version::new(1, 21, 0);
        let field = WantedField::new("runtime", "g", "goid");
        let other = WantedField::new("runtime", "g", "stackguard0");

        cache.put(&toolchain, &toolchain, &other, Some(16)).unwrap();
        let key = OffsetCache::key(&toolchain, &toolchain, &field);
        cache.db.insert(key.as_bytes(), &b"not json"[..]).unwrap();

        // The corrupt read reports a miss and drops everything.
        assert_eq!(cache.get(&toolchain, &toolchain, &field).unwrap(), None);
        assert_eq!(cache.get(&toolchain, &toolchain, &other).unwrap(), None);
    }
}
