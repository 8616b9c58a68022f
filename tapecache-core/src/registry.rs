//! Topic registration and schema migration across cache generations.
//!
//! Every topic directory holds up to [`GENERATION_SLOTS`] generations, `cache-0` through
//! `cache-99`, each a `.tape` data file plus the key and value schema it was written
//! with. Registering a topic picks the generation whose stored schemas match the
//! current ones as the active cache; every other generation stays readable as a
//! deprecated cache until it is drained and deleted.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::cache::{TopicCache, generation_file};
use crate::config::CacheConfiguration;
use crate::constants::{
    GENERATION_PREFIX, GENERATION_SLOTS, KEY_SCHEMA_EXTENSION, TAPE_EXTENSION,
    VALUE_SCHEMA_EXTENSION,
};
use crate::error::{Result, TapeError};
use crate::lock::lock_unpoisoned;
use crate::schema::Schema;
use crate::worker::CacheWorker;

/// A topic and the schemas of its keys and values.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicSchema {
    pub topic: String,
    pub key: Schema,
    pub value: Schema,
}

impl TopicSchema {
    #[must_use]
    pub fn new(topic: impl Into<String>, key: Schema, value: Schema) -> Self {
        Self {
            topic: topic.into(),
            key,
            value,
        }
    }

    /// Builds a topic schema from key and value schema JSON text.
    pub fn parse(topic: impl Into<String>, key: &str, value: &str) -> Result<Self> {
        Ok(Self::new(topic, Schema::parse(key)?, Schema::parse(value)?))
    }
}

/// Active and deprecated caches of one topic.
#[derive(Debug)]
pub struct CacheGroup {
    topic: String,
    active: TopicCache,
    deprecated: Mutex<Vec<TopicCache>>,
}

impl CacheGroup {
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Cache that new measurements go to.
    #[must_use]
    pub fn active_cache(&self) -> &TopicCache {
        &self.active
    }

    /// Older generations still holding data written under other schemas.
    #[must_use]
    pub fn deprecated_caches(&self) -> Vec<TopicCache> {
        lock_unpoisoned(&self.deprecated).clone()
    }

    /// Active cache first, then deprecated ones in slot order.
    #[must_use]
    pub fn caches(&self) -> Vec<TopicCache> {
        let mut caches = vec![self.active.clone()];
        caches.extend(self.deprecated_caches());
        caches
    }

    /// Committed records over every generation.
    pub fn total_records(&self) -> Result<usize> {
        self.caches()
            .iter()
            .try_fold(0, |total, cache| -> Result<usize> {
                Ok(total + cache.number_of_records()?)
            })
    }

    /// Closes and deletes deprecated generations that hold no records. Returns how many
    /// were removed.
    pub fn delete_empty_caches(&self) -> Result<usize> {
        let mut deprecated = lock_unpoisoned(&self.deprecated);
        let mut kept = Vec::with_capacity(deprecated.len());
        let mut deleted = 0;
        for cache in deprecated.drain(..) {
            if cache.number_of_records()? == 0 && cache.pending_records() == 0 {
                cache.delete()?;
                deleted += 1;
            } else {
                kept.push(cache);
            }
        }
        *deprecated = kept;
        Ok(deleted)
    }

    pub fn flush(&self) -> Result<()> {
        self.caches().iter().try_for_each(TopicCache::flush)
    }

    pub fn set_configuration(&self, config: CacheConfiguration) -> Result<()> {
        self.caches()
            .iter()
            .try_for_each(|cache| cache.set_configuration(config))
    }

    /// Flushes and closes every generation. The first error is returned after all
    /// caches had a chance to close.
    pub fn close(&self) -> Result<()> {
        let mut first_error = None;
        for cache in self.caches() {
            if let Err(err) = cache.close() {
                tracing::warn!(
                    topic = %self.topic,
                    path = %cache.path().display(),
                    error = %err,
                    "failed to close cache"
                );
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// One existing generation found on disk.
struct StoredGeneration {
    slot: u32,
    base: PathBuf,
    key: Option<String>,
    value: Option<String>,
}

/// How a stored schema file relates to the current schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SchemaMatch {
    Missing,
    Same,
    Different,
}

fn compare(stored: Option<&str>, current: &Schema) -> SchemaMatch {
    match stored.map(Schema::parse) {
        None => SchemaMatch::Missing,
        Some(Ok(schema)) if schema.canonical_text() == current.canonical_text() => {
            SchemaMatch::Same
        }
        Some(_) => SchemaMatch::Different,
    }
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs_err::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn write_schema(base: &Path, extension: &str, schema: &Schema) -> Result<()> {
    fs_err::write(generation_file(base, extension), schema.canonical_text())?;
    Ok(())
}

/// Path of generation `slot` of a topic directory, without extension.
#[must_use]
pub fn generation_base(topic_dir: &Path, slot: u32) -> PathBuf {
    topic_dir.join(format!("{GENERATION_PREFIX}{slot}"))
}

/// Holds one [`CacheGroup`] per registered topic.
#[derive(Debug)]
pub struct CacheRegistry {
    base_dir: PathBuf,
    config: Mutex<CacheConfiguration>,
    worker: Arc<CacheWorker>,
    groups: Mutex<HashMap<String, Arc<CacheGroup>>>,
}

impl CacheRegistry {
    /// Registry over `base_dir`, using the process-wide cache worker.
    pub fn new(base_dir: impl Into<PathBuf>, config: CacheConfiguration) -> Result<Self> {
        Ok(Self::with_worker(base_dir, config, CacheWorker::shared()?))
    }

    pub fn with_worker(
        base_dir: impl Into<PathBuf>,
        config: CacheConfiguration,
        worker: Arc<CacheWorker>,
    ) -> Self {
        Self {
            base_dir: base_dir.into(),
            config: Mutex::new(config),
            worker,
            groups: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    #[must_use]
    pub fn configuration(&self) -> CacheConfiguration {
        *lock_unpoisoned(&self.config)
    }

    /// Opens the caches of a topic, or returns the group registered earlier.
    pub fn register(&self, schema: TopicSchema) -> Result<Arc<CacheGroup>> {
        let mut groups = lock_unpoisoned(&self.groups);
        if let Some(group) = groups.get(&schema.topic) {
            return Ok(Arc::clone(group));
        }
        let group = Arc::new(self.open_group(&schema)?);
        groups.insert(schema.topic.clone(), Arc::clone(&group));
        Ok(group)
    }

    #[must_use]
    pub fn group(&self, topic: &str) -> Option<Arc<CacheGroup>> {
        lock_unpoisoned(&self.groups).get(topic).cloned()
    }

    /// Every registered group, ordered by topic.
    #[must_use]
    pub fn groups(&self) -> Vec<Arc<CacheGroup>> {
        let mut groups: Vec<_> = lock_unpoisoned(&self.groups).values().cloned().collect();
        groups.sort_by(|a, b| a.topic.cmp(&b.topic));
        groups
    }

    /// Closes a topic's caches and forgets the group.
    pub fn release(&self, topic: &str) -> Result<()> {
        let group = lock_unpoisoned(&self.groups).remove(topic);
        match group {
            Some(group) => group.close(),
            None => Ok(()),
        }
    }

    /// Closes every group.
    pub fn close(&self) -> Result<()> {
        let groups: Vec<_> = lock_unpoisoned(&self.groups).drain().map(|(_, g)| g).collect();
        let mut first_error = None;
        for group in groups {
            if let Err(err) = group.close() {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn flush(&self) -> Result<()> {
        self.groups().iter().try_for_each(|group| group.flush())
    }

    /// Committed records over every registered topic.
    pub fn total_records(&self) -> Result<usize> {
        self.groups()
            .iter()
            .try_fold(0, |total, group| -> Result<usize> {
                Ok(total + group.total_records()?)
            })
    }

    /// Applies a new configuration to the registry and every open cache.
    pub fn set_configuration(&self, config: CacheConfiguration) -> Result<()> {
        *lock_unpoisoned(&self.config) = config;
        self.groups()
            .iter()
            .try_for_each(|group| group.set_configuration(config))
    }

    fn scan(&self, topic_dir: &Path) -> Result<Vec<StoredGeneration>> {
        let mut found = Vec::new();
        for slot in 0..GENERATION_SLOTS {
            let base = generation_base(topic_dir, slot);
            if !generation_file(&base, TAPE_EXTENSION).is_file() {
                continue;
            }
            found.push(StoredGeneration {
                slot,
                key: read_optional(&generation_file(&base, KEY_SCHEMA_EXTENSION))?,
                value: read_optional(&generation_file(&base, VALUE_SCHEMA_EXTENSION))?,
                base,
            });
        }
        Ok(found)
    }

    fn open_cache(
        &self,
        topic: &str,
        base: &Path,
        key: Schema,
        value: Schema,
    ) -> Result<TopicCache> {
        TopicCache::open(
            topic,
            base,
            key,
            value,
            self.configuration(),
            Arc::clone(&self.worker),
        )
    }

    fn open_group(&self, schema: &TopicSchema) -> Result<CacheGroup> {
        let topic = schema.topic.as_str();
        let topic_dir = self.base_dir.join(topic);
        fs_err::create_dir_all(&topic_dir)?;

        let mut active = None;
        let mut deprecated = Vec::new();
        for stored in self.scan(&topic_dir)? {
            let key_match = compare(stored.key.as_deref(), &schema.key);
            let value_match = compare(stored.value.as_deref(), &schema.value);
            let matches = matches!(
                (key_match, value_match),
                (SchemaMatch::Same, SchemaMatch::Same)
                    | (SchemaMatch::Same, SchemaMatch::Missing)
                    | (SchemaMatch::Missing, SchemaMatch::Same)
            );

            if matches && active.is_none() {
                if key_match == SchemaMatch::Missing {
                    write_schema(&stored.base, KEY_SCHEMA_EXTENSION, &schema.key)?;
                }
                if value_match == SchemaMatch::Missing {
                    write_schema(&stored.base, VALUE_SCHEMA_EXTENSION, &schema.value)?;
                }
                tracing::debug!(topic, slot = stored.slot, "using existing cache generation");
                active = Some(self.open_cache(
                    topic,
                    &stored.base,
                    schema.key.clone(),
                    schema.value.clone(),
                )?);
                continue;
            }

            let key = stored_or_current(
                topic,
                stored.slot,
                "key",
                stored.key.as_deref(),
                &schema.key,
            );
            let value = stored_or_current(
                topic,
                stored.slot,
                "value",
                stored.value.as_deref(),
                &schema.value,
            );
            tracing::info!(topic, slot = stored.slot, "found deprecated cache generation");
            let cache = self.open_cache(topic, &stored.base, key, value)?;
            cache.mark_read_only();
            deprecated.push(cache);
        }

        let active = match active {
            Some(cache) => cache,
            None => self.create_generation(schema, &topic_dir)?,
        };
        Ok(CacheGroup {
            topic: topic.to_string(),
            active,
            deprecated: Mutex::new(deprecated),
        })
    }

    fn create_generation(&self, schema: &TopicSchema, topic_dir: &Path) -> Result<TopicCache> {
        let slot = (0..GENERATION_SLOTS)
            .find(|slot| {
                !generation_file(&generation_base(topic_dir, *slot), TAPE_EXTENSION).exists()
            })
            .ok_or_else(|| TapeError::NoFreeSlot {
                topic: schema.topic.clone(),
            })?;
        let base = generation_base(topic_dir, slot);
        write_schema(&base, KEY_SCHEMA_EXTENSION, &schema.key)?;
        write_schema(&base, VALUE_SCHEMA_EXTENSION, &schema.value)?;
        tracing::info!(topic = %schema.topic, slot, "created cache generation");
        self.open_cache(&schema.topic, &base, schema.key.clone(), schema.value.clone())
    }
}

/// Schema a deprecated generation was written with, falling back to the current one
/// when its file is missing or cannot be parsed.
fn stored_or_current(
    topic: &str,
    slot: u32,
    side: &str,
    stored: Option<&str>,
    current: &Schema,
) -> Schema {
    match stored.map(Schema::parse) {
        Some(Ok(schema)) => schema,
        Some(Err(err)) => {
            tracing::error!(
                topic,
                slot,
                side,
                error = %err,
                "stored schema is unreadable, assuming the current one"
            );
            current.clone()
        }
        None => {
            tracing::error!(
                topic,
                slot,
                side,
                "stored schema is missing, assuming the current one"
            );
            current.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Datum;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config() -> CacheConfiguration {
        CacheConfiguration {
            commit_rate: Duration::from_secs(3600),
            maximum_size: 64 * 1024,
        }
    }

    fn topic(value: Schema) -> TopicSchema {
        TopicSchema::new("heart_rate", Schema::String, value)
    }

    #[test]
    fn register_creates_first_generation() -> Result<()> {
        let dir = TempDir::new()?;
        let registry = CacheRegistry::new(dir.path(), config())?;
        let group = registry.register(topic(Schema::Double))?;
        let base = generation_base(&dir.path().join("heart_rate"), 0);
        assert_eq!(group.active_cache().base_path(), base);
        assert!(generation_file(&base, KEY_SCHEMA_EXTENSION).is_file());
        assert!(generation_file(&base, VALUE_SCHEMA_EXTENSION).is_file());
        assert!(group.deprecated_caches().is_empty());

        let again = registry.register(topic(Schema::Double))?;
        assert!(Arc::ptr_eq(&group, &again));
        Ok(())
    }

    #[test]
    fn missing_schema_side_still_matches() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let registry = CacheRegistry::new(dir.path(), config())?;
            registry.register(topic(Schema::Double))?;
            registry.close()?;
        }
        let base = generation_base(&dir.path().join("heart_rate"), 0);
        fs_err::remove_file(generation_file(&base, VALUE_SCHEMA_EXTENSION))?;

        let registry = CacheRegistry::new(dir.path(), config())?;
        let group = registry.register(topic(Schema::Double))?;
        assert_eq!(group.active_cache().base_path(), base);
        assert!(generation_file(&base, VALUE_SCHEMA_EXTENSION).is_file());
        Ok(())
    }

    #[test]
    fn changed_schema_moves_to_next_slot() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let registry = CacheRegistry::new(dir.path(), config())?;
            let group = registry.register(topic(Schema::Double))?;
            group
                .active_cache()
                .add_measurement(Datum::String("watch".into()), Datum::Double(72.0))?;
            registry.close()?;
        }

        let registry = CacheRegistry::new(dir.path(), config())?;
        let group = registry.register(topic(Schema::Float))?;
        let topic_dir = dir.path().join("heart_rate");
        assert_eq!(group.active_cache().base_path(), generation_base(&topic_dir, 1));
        let deprecated = group.deprecated_caches();
        assert_eq!(deprecated.len(), 1);
        assert_eq!(deprecated[0].value_schema(), &Schema::Double);
        assert_eq!(group.total_records()?, 1);
        Ok(())
    }

    #[test]
    fn no_free_slot_is_an_error() -> Result<()> {
        let dir = TempDir::new()?;
        let topic_dir = dir.path().join("heart_rate");
        fs_err::create_dir_all(&topic_dir)?;
        for slot in 0..GENERATION_SLOTS {
            let base = generation_base(&topic_dir, slot);
            fs_err::write(generation_file(&base, TAPE_EXTENSION), [])?;
            fs_err::write(generation_file(&base, KEY_SCHEMA_EXTENSION), r#""bytes""#)?;
        }
        let registry = CacheRegistry::new(dir.path(), config())?;
        let err = registry
            .register(topic(Schema::Double))
            .expect_err("every slot is taken");
        assert!(matches!(err, TapeError::NoFreeSlot { .. }));
        Ok(())
    }

    #[test]
    fn unreadable_stored_schema_falls_back_to_current() {
        let current = Schema::Long;
        assert_eq!(
            stored_or_current("t", 0, "value", Some("{broken"), &current),
            current
        );
        assert_eq!(stored_or_current("t", 0, "value", None, &current), current);
        assert_eq!(
            stored_or_current("t", 0, "value", Some(r#""int""#), &current),
            Schema::Int
        );
    }
}
