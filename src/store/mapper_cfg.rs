//! Mapper config persistence
//!
//! The full versioned config is stored as a single JSON document in a
//! one-row sibling table. Save-to-disk is gated by the engine's writer lock;
//! this layer only does the (de)serialisation.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::mapper::MapperConfig;

use super::{Store, StoreError};

impl Store {
    /// Load the persisted config, if one has ever been saved.
    pub fn load_mapper_config(&self) -> Result<Option<MapperConfig>, StoreError> {
        let conn = self.lock();
        let doc: Option<String> = conn
            .query_row("SELECT doc FROM mapper_config WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?;

        match doc {
            Some(doc) => Ok(Some(serde_json::from_str(&doc)?)),
            None => Ok(None),
        }
    }

    /// Persist the config document, replacing the previous one.
    pub fn save_mapper_config(&self, config: &MapperConfig) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO mapper_config (id, doc, updated_at) VALUES (1, ?1, ?2) \
             ON CONFLICT(id) DO UPDATE SET doc = excluded.doc, updated_at = excluded.updated_at",
            params![serde_json::to_string(config)?, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::MapperConfig;

    #[test]
    fn save_load_save_is_byte_stable() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.load_mapper_config().unwrap().is_none());

        let config = MapperConfig::default();
        store.save_mapper_config(&config).unwrap();

        let loaded = store.load_mapper_config().unwrap().unwrap();
        let first = serde_json::to_vec(&loaded).unwrap();

        store.save_mapper_config(&loaded).unwrap();
        let second = serde_json::to_vec(&store.load_mapper_config().unwrap().unwrap()).unwrap();

        assert_eq!(first, second);
    }
}
