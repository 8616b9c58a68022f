use std::error::Error;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local};
use serde::Serialize;
use tapecache_core::cache::generation_file;
use tapecache_core::constants::{
    DEFAULT_MAXIMUM_SIZE, GENERATION_SLOTS, KEY_SCHEMA_EXTENSION, MINIMUM_QUEUE_LEN,
    TAPE_EXTENSION, VALUE_SCHEMA_EXTENSION,
};
use tapecache_core::registry::generation_base;
use tapecache_core::{Entry, Record, RecordCodec, RecordQueue, RingQueue, Schema};
use walkdir::WalkDir;

use crate::config_file::StoreConfig;

type CommandResult = Result<(), Box<dyn Error>>;

fn print_json(value: &impl Serialize) -> CommandResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Opens an existing queue file for changes, without limiting how far it may have grown.
fn open_existing(path: &Path) -> Result<RingQueue, Box<dyn Error>> {
    let metadata = std::fs::metadata(path)
        .map_err(|err| format!("cannot open {}: {err}", path.display()))?;
    let maximum = metadata.len().max(DEFAULT_MAXIMUM_SIZE);
    Ok(RingQueue::open(path, MINIMUM_QUEUE_LEN, maximum)?)
}

/// Private snapshot of a queue file. Reading it never changes, locks or deletes the file.
fn open_snapshot(path: &Path) -> Result<RingQueue, Box<dyn Error>> {
    Ok(RingQueue::open_read_only(path, MINIMUM_QUEUE_LEN)?)
}

fn modified(path: &Path) -> Option<String> {
    let time = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(DateTime::<Local>::from(time).to_rfc3339())
}

#[derive(Serialize)]
struct InspectReport {
    path: PathBuf,
    version: String,
    length: u64,
    count: u32,
    first_position: u64,
    last_position: u64,
    used_bytes: u64,
    file_size: u64,
    modified: Option<String>,
}

pub(crate) fn inspect(file: &Path, json: bool) -> CommandResult {
    let queue = open_snapshot(file)?;
    let header = queue.header();
    let report = InspectReport {
        path: file.to_path_buf(),
        version: format!("{:#010x}", header.version),
        length: header.length,
        count: header.count,
        first_position: header.first_position,
        last_position: header.last_position,
        used_bytes: queue.used_bytes(),
        file_size: queue.file_size(),
        modified: modified(file),
    };
    if json {
        return print_json(&report);
    }
    println!("{}", report.path.display());
    println!("  version        {}", report.version);
    println!("  records        {}", report.count);
    println!("  used / size    {} / {} bytes", report.used_bytes, report.file_size);
    println!(
        "  first / last   {} / {}",
        report.first_position, report.last_position
    );
    if let Some(modified) = &report.modified {
        println!("  modified       {modified}");
    }
    Ok(())
}

#[derive(Serialize)]
struct GenerationStats {
    topic: String,
    generation: String,
    records: Option<u32>,
    used_bytes: Option<u64>,
    file_size: Option<u64>,
    modified: Option<String>,
    error: Option<String>,
}

pub(crate) fn stats(base: &Path, json: bool) -> CommandResult {
    let mut rows = Vec::new();
    for entry in WalkDir::new(base).sort_by_file_name() {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        let Some(generation) = name.strip_suffix(&format!(".{TAPE_EXTENSION}")) else {
            continue;
        };
        let topic = path
            .parent()
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut row = GenerationStats {
            topic,
            generation: generation.to_string(),
            records: None,
            used_bytes: None,
            file_size: None,
            modified: modified(path),
            error: None,
        };
        match open_snapshot(path) {
            Ok(queue) => {
                row.records = Some(queue.header().count);
                row.used_bytes = Some(queue.used_bytes());
                row.file_size = Some(queue.file_size());
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "cannot read cache file");
                row.error = Some(err.to_string());
            }
        }
        rows.push(row);
    }

    if json {
        return print_json(&rows);
    }
    if rows.is_empty() {
        println!("No cache files under {}", base.display());
        return Ok(());
    }
    println!(
        "{:<32} {:<10} {:>10} {:>12} {:>12}",
        "TOPIC", "GENERATION", "RECORDS", "USED", "SIZE"
    );
    for row in &rows {
        match &row.error {
            Some(error) => println!("{:<32} {:<10} error: {error}", row.topic, row.generation),
            None => println!(
                "{:<32} {:<10} {:>10} {:>12} {:>12}",
                row.topic,
                row.generation,
                row.records.unwrap_or_default(),
                row.used_bytes.unwrap_or_default(),
                row.file_size.unwrap_or_default()
            ),
        }
    }
    Ok(())
}

fn read_schema(base: &Path, extension: &str) -> Result<Schema, Box<dyn Error>> {
    let path = generation_file(base, extension);
    let text = std::fs::read_to_string(&path)
        .map_err(|err| format!("cannot read {}: {err}", path.display()))?;
    Ok(Schema::parse(&text)?)
}

/// When a generation was created. Schema files are written once, when the
/// generation is set up, while the tape changes on every commit.
fn created(base: &Path) -> Option<SystemTime> {
    [VALUE_SCHEMA_EXTENSION, KEY_SCHEMA_EXTENSION, TAPE_EXTENSION]
        .into_iter()
        .find_map(|extension| {
            std::fs::metadata(generation_file(base, extension))
                .and_then(|metadata| metadata.modified())
                .ok()
        })
}

/// Existing generations of a topic, oldest first. Slots are reused once a
/// generation is deleted, so the slot number only breaks ties.
fn generations(base: &Path, topic: &str) -> Vec<(u32, PathBuf)> {
    let topic_dir = base.join(topic);
    let mut found: Vec<_> = (0..GENERATION_SLOTS)
        .map(|slot| (slot, generation_base(&topic_dir, slot)))
        .filter(|(_, path)| generation_file(path, TAPE_EXTENSION).is_file())
        .map(|(slot, path)| (created(&path), slot, path))
        .collect();
    found.sort_by_key(|(created, slot, _)| (*created, *slot));
    found
        .into_iter()
        .map(|(_, slot, path)| (slot, path))
        .collect()
}

#[derive(Serialize)]
struct DumpedRecord {
    generation: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    invalid: Option<String>,
}

pub(crate) fn dump(base: &Path, topic: &str, limit: usize, json: bool) -> CommandResult {
    let mut dumped = Vec::new();
    for (slot, generation) in generations(base, topic) {
        if dumped.len() >= limit {
            break;
        }
        let schemas = read_schema(&generation, KEY_SCHEMA_EXTENSION).and_then(|key| {
            read_schema(&generation, VALUE_SCHEMA_EXTENSION).map(|value| (key, value))
        });
        let (key_schema, value_schema) = match schemas {
            Ok(schemas) => schemas,
            Err(err) => {
                tracing::warn!(
                    topic,
                    slot,
                    error = %err,
                    "skipping generation without readable schemas"
                );
                continue;
            }
        };
        let entries = open_snapshot(&generation_file(&generation, TAPE_EXTENSION))
            .and_then(|queue| {
                let codec = RecordCodec::new(key_schema, value_schema);
                let mut records = RecordQueue::<Record, _>::new(queue, codec);
                Ok(records.peek(limit - dumped.len(), u64::MAX)?)
            });
        let entries = match entries {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(topic, slot, error = %err, "skipping unreadable generation");
                continue;
            }
        };
        for entry in entries {
            dumped.push(match entry {
                Entry::Valid(record) => DumpedRecord {
                    generation: slot,
                    key: Some(record.key.to_json()),
                    value: Some(record.value.to_json()),
                    invalid: None,
                },
                Entry::Invalid { reason } => DumpedRecord {
                    generation: slot,
                    key: None,
                    value: None,
                    invalid: Some(reason),
                },
            });
        }
    }

    if json {
        return print_json(&dumped);
    }
    for record in &dumped {
        match (&record.key, &record.value, &record.invalid) {
            (Some(key), Some(value), _) => {
                println!("cache-{}  {key}  {value}", record.generation);
            }
            (_, _, Some(reason)) => println!("cache-{}  <invalid: {reason}>", record.generation),
            _ => {}
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct Removed {
    generation: u32,
    removed: usize,
    remaining: usize,
}

pub(crate) fn drain(base: &Path, topic: &str, count: Option<usize>, json: bool) -> CommandResult {
    let mut left = count.unwrap_or(usize::MAX);
    let mut report = Vec::new();
    for (slot, generation) in generations(base, topic) {
        if left == 0 {
            break;
        }
        let mut queue = open_existing(&generation_file(&generation, TAPE_EXTENSION))?;
        let removed = left.min(queue.len());
        queue.remove(removed)?;
        let remaining = queue.len();
        queue.close()?;
        left -= removed;
        tracing::info!(topic, slot, removed, "drained cache generation");
        report.push(Removed {
            generation: slot,
            removed,
            remaining,
        });
    }

    if json {
        return print_json(&report);
    }
    let total: usize = report.iter().map(|r| r.removed).sum();
    for row in &report {
        println!(
            "cache-{}: removed {}, {} left",
            row.generation, row.removed, row.remaining
        );
    }
    println!("Removed {total} records from {topic}");
    Ok(())
}

pub(crate) fn clear(file: &Path, json: bool) -> CommandResult {
    let mut queue = open_existing(file)?;
    let removed = queue.len();
    queue.clear()?;
    let file_size = queue.file_size();
    queue.close()?;
    if json {
        return print_json(&serde_json::json!({
            "path": file,
            "removed": removed,
            "file_size": file_size,
        }));
    }
    println!(
        "Cleared {} ({removed} records removed, now {file_size} bytes)",
        file.display()
    );
    Ok(())
}

pub(crate) fn show_config(config: &StoreConfig) -> CommandResult {
    print_json(config)
}
