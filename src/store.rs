//! Store — durable instance snapshots plus append-only swap/tx history.
//!
//! One JSON document per instance, written via the teacher's temp-file-then-rename pattern (see
//! the old `data_collector/shared_state.rs::write_to_file`), plus a JSONL append log per instance
//! in the style of `tax/json_logger.rs`. A sidecar index lists known instance ids but is always
//! reconstructable from the directory listing, so it is never the source of truth.

use crate::types::{InstanceId, InstanceState, InstanceStatus, SwapRecord, TxRecord};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// Snapshots older than this are excluded from startup recovery; they're assumed to be stale dev
/// leftovers rather than an instance this process actually owns.
const MAX_RECOVERABLE_AGE: chrono::Duration = chrono::Duration::hours(24);

pub struct Store {
    base_dir: PathBuf,
    /// Serializes writes to one instance's record; different instances may write concurrently,
    /// the per-instance mutex only prevents two writers racing on the same file.
    write_locks: Mutex<std::collections::HashMap<InstanceId, ()>>,
}

impl Store {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir)
            .with_context(|| format!("failed to create store directory: {base_dir:?}"))?;
        Ok(Self { base_dir, write_locks: Mutex::new(std::collections::HashMap::new()) })
    }

    fn snapshot_path(&self, id: InstanceId) -> PathBuf {
        self.base_dir.join(format!("{id}.json"))
    }

    fn tx_log_path(&self, id: InstanceId) -> PathBuf {
        self.base_dir.join(format!("{id}.tx.jsonl"))
    }

    fn swap_log_path(&self, id: InstanceId) -> PathBuf {
        self.base_dir.join(format!("{id}.swap.jsonl"))
    }

    /// Writes the full state atomically: temp file + rename, so a crash mid-write never leaves a
    /// partially-updated record on disk.
    pub fn save(&self, state: &InstanceState) -> Result<()> {
        let _guard = self.write_locks.lock().unwrap();
        let path = self.snapshot_path(state.id);
        let json = serde_json::to_string_pretty(state).context("failed to serialize instance state")?;
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, &json)
            .with_context(|| format!("failed to write temp snapshot: {temp_path:?}"))?;
        fs::rename(&temp_path, &path)
            .with_context(|| format!("failed to rename temp snapshot into place: {path:?}"))?;
        Ok(())
    }

    pub fn load(&self, id: InstanceId) -> Result<Option<InstanceState>> {
        let path = self.snapshot_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path).with_context(|| format!("failed to read snapshot: {path:?}"))?;
        let state = serde_json::from_str(&json).context("failed to parse instance snapshot")?;
        Ok(Some(state))
    }

    pub fn append_tx_record(&self, id: InstanceId, record: &TxRecord) -> Result<()> {
        append_jsonl(&self.tx_log_path(id), record)
    }

    pub fn append_swap_record(&self, id: InstanceId, record: &SwapRecord) -> Result<()> {
        append_jsonl(&self.swap_log_path(id), record)
    }

    pub fn read_tx_history(&self, id: InstanceId) -> Result<Vec<TxRecord>> {
        read_jsonl(&self.tx_log_path(id))
    }

    pub fn read_swap_history(&self, id: InstanceId) -> Result<Vec<SwapRecord>> {
        read_jsonl(&self.swap_log_path(id))
    }

    /// Enumerates every persisted instance from the directory listing (the authoritative source;
    /// the sidecar index is only a cache of this) and classifies each as recoverable.
    pub fn list_ids(&self) -> Result<Vec<InstanceId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".json") {
                if let Ok(id) = stem.parse() {
                    ids.push(id);
                }
            }
        }
        self.write_index(&ids)?;
        Ok(ids)
    }

    fn write_index(&self, ids: &[InstanceId]) -> Result<()> {
        let path = self.base_dir.join("index.json");
        let json = serde_json::to_string_pretty(ids)?;
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, &json)?;
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    /// `recoverable` per §4.6: last known status is one of {Preparing, Running, Monitoring} and
    /// the snapshot isn't old enough to be a stale dev leftover.
    pub fn recoverable_instances(&self, now: DateTime<Utc>) -> Result<Vec<InstanceState>> {
        let mut recoverable = Vec::new();
        for id in self.list_ids()? {
            match self.load(id) {
                Ok(Some(state)) => {
                    let age = now.signed_duration_since(state.last_persist);
                    if state.status.is_live() && age < MAX_RECOVERABLE_AGE {
                        recoverable.push(state);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(%id, error = %e, "failed to load snapshot during recovery scan"),
            }
        }
        Ok(recoverable)
    }
}

fn append_jsonl<T: serde::Serialize>(path: &Path, record: &T) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open append log: {path:?}"))?;
    let json = serde_json::to_string(record)?;
    writeln!(file, "{json}")?;
    Ok(())
}

fn read_jsonl<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = fs::File::open(path)?;
    let reader = BufReader::new(file);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StrategyConfig;
    use alloy::primitives::{Address, U256};

    fn sample_state() -> InstanceState {
        let pool = crate::types::PoolConfig {
            pool: Address::ZERO,
            token0: Address::from([1; 20]),
            token1: Address::from([2; 20]),
            fee: 3000,
        };
        let config = StrategyConfig {
            pool: pool.clone(),
            input_token: pool.token0,
            input_amount: U256::from(100u64),
            lower_percent: -5.0,
            upper_percent: 5.0,
            swap_slippage_percent: 0.5,
            mint_slippage_percent: 1.0,
            swap_buffer_percent: 0.5,
            monitor_timeout: chrono::Duration::minutes(10),
            exit_token: crate::types::ExitTokenSelector::NoPreference,
            base_currency_override: None,
        };
        InstanceState::new(uuid::Uuid::new_v4(), config, Utc::now())
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempdir();
        let store = Store::new(&dir).unwrap();
        let state = sample_state();
        store.save(&state).unwrap();
        let loaded = store.load(state.id).unwrap().unwrap();
        assert_eq!(loaded.id, state.id);
        assert_eq!(loaded.status, InstanceStatus::Initialized);
    }

    #[test]
    fn recoverable_instances_excludes_terminal_status() {
        let dir = tempdir();
        let store = Store::new(&dir).unwrap();
        let mut live = sample_state();
        live.status = InstanceStatus::Monitoring;
        store.save(&live).unwrap();
        let mut done = sample_state();
        done.status = InstanceStatus::Exited;
        store.save(&done).unwrap();

        let recoverable = store.recoverable_instances(Utc::now()).unwrap();
        assert_eq!(recoverable.len(), 1);
        assert_eq!(recoverable[0].id, live.id);
    }

    #[test]
    fn tx_log_is_append_only_jsonl() {
        let dir = tempdir();
        let store = Store::new(&dir).unwrap();
        let id = uuid::Uuid::new_v4();
        let record = TxRecord {
            kind: crate::types::TxKind::Approve,
            params: serde_json::json!({}),
            hash: "0xabc".into(),
            block: 1,
            gas_used: 21000,
            effective_gas_price: U256::from(1u64),
            parsed: serde_json::json!({}),
            timestamp: Utc::now(),
        };
        store.append_tx_record(id, &record).unwrap();
        store.append_tx_record(id, &record).unwrap();
        let history = store.read_tx_history(id).unwrap();
        assert_eq!(history.len(), 2);
    }

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("clp-engine-store-test-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }
}
