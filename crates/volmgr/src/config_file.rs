//! Upserts into the storage engine's line-oriented configuration file.
//!
//! Only three directive families are owned here: `ReplicationFactor`,
//! `ConsistencyFactor` and `Replica <id> <guid>`. A line belongs to a key when
//! its trimmed text starts with the key followed by whitespace or end of line.
//! Everything else in the file is left untouched.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use volmgr_core::{ReplicaUpdate, VolumeReplicationRecord};

/// Directive key and the full line rendered for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigLine {
    pub key: String,
    pub line: String,
}

impl ConfigLine {
    fn replication_factor(rf: u32) -> Self {
        Self {
            key: "ReplicationFactor".to_string(),
            line: format!("ReplicationFactor {rf}"),
        }
    }

    fn consistency_factor(cf: u32) -> Self {
        Self {
            key: "ConsistencyFactor".to_string(),
            line: format!("ConsistencyFactor {cf}"),
        }
    }

    fn replica(replica_id: &str, guid: &str) -> Self {
        Self {
            key: format!("Replica {replica_id}"),
            line: format!("Replica {replica_id} {guid}"),
        }
    }
}

/// Lines produced by one accepted replication request.
pub fn update_lines(update: &ReplicaUpdate) -> Vec<ConfigLine> {
    vec![
        ConfigLine::replication_factor(update.replication_factor),
        ConfigLine::consistency_factor(update.consistency_factor),
        ConfigLine::replica(&update.replica_id, &update.replica_guid),
    ]
}

/// Lines describing the whole persisted record, used to heal a stale file.
pub fn record_lines(record: &VolumeReplicationRecord) -> Vec<ConfigLine> {
    let mut lines = vec![
        ConfigLine::replication_factor(record.spec.replication_factor),
        ConfigLine::consistency_factor(record.spec.consistency_factor),
    ];
    lines.extend(
        record
            .known_replicas()
            .iter()
            .map(|(id, guid)| ConfigLine::replica(id, guid)),
    );
    lines
}

fn line_has_key(line: &str, key: &str) -> bool {
    line.trim_start()
        .strip_prefix(key)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace))
}

/// Replace every line owned by an entry's key (keeping its indentation), and
/// append entries whose key is not present.
pub fn upsert_lines(original: &str, entries: &[ConfigLine]) -> String {
    let mut lines: Vec<String> = original.lines().map(str::to_string).collect();
    for entry in entries {
        let mut found = false;
        for line in lines.iter_mut() {
            if line_has_key(line, &entry.key) {
                let indent_len = line.len() - line.trim_start().len();
                *line = format!("{}{}", &line[..indent_len], entry.line);
                found = true;
            }
        }
        if !found {
            lines.push(entry.line.clone());
        }
    }
    let mut text = lines.join("\n");
    if !text.is_empty() {
        text.push('\n');
    }
    text
}

/// Serializes all read-modify-write cycles on one configuration file.
#[derive(Clone, Debug)]
pub struct ConfigFileWriter {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl ConfigFileWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Upsert `entries` into the file. The file must already exist; it is
    /// owned by the storage engine.
    pub fn apply(&self, entries: &[ConfigLine]) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let original = fs::read_to_string(&self.path)
            .with_context(|| format!("read config file {}", self.path.display()))?;
        let updated = upsert_lines(&original, entries);
        if updated == original {
            return Ok(());
        }
        replace_file(&self.path, updated.as_bytes())
    }

    /// `apply` on the blocking pool.
    pub async fn apply_blocking(&self, entries: Vec<ConfigLine>) -> anyhow::Result<()> {
        let writer = self.clone();
        tokio::task::spawn_blocking(move || writer.apply(&entries))
            .await
            .context("config file writer task failed")?
    }
}

/// Write `data` next to `path` and rename it over, keeping the permissions.
fn replace_file(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let permissions = fs::metadata(path)
        .with_context(|| format!("stat config file {}", path.display()))?
        .permissions();
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .context("config file path has no file name")?;
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp"));

    let mut tmp = File::create(&tmp_path)
        .with_context(|| format!("create {}", tmp_path.display()))?;
    tmp.write_all(data).context("write config file")?;
    tmp.sync_all().context("sync config file")?;
    drop(tmp);
    fs::set_permissions(&tmp_path, permissions).context("copy config file permissions")?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replace config file {}", path.display()))?;
    Ok(())
}
