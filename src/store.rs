// ===============================
// src/store.rs
// ===============================
//
// Persistence untuk trade history + posisi terbuka.
// commit_close() = simpan trade + hapus posisi terbuka dalam SATU transaksi:
// tidak pernah ada state "trade tersimpan tapi posisi masih open" (atau sebaliknya).
//
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;
use tracing::info;

use crate::domain::{AccountScope, PositionState, ScopeKey, TradeId, TradeRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io: {0}")]
    Io(#[from] io::Error),
    #[error("store document: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable side of the engine. Implementations must make `commit_close` all-or-nothing.
pub trait TradeStore: Send + Sync + 'static {
    fn save_trade(&self, record: &TradeRecord) -> Result<TradeId, StoreError>;
    fn load_open_position(&self, key: &ScopeKey) -> Result<Option<PositionState>, StoreError>;
    fn save_open_position(&self, position: &PositionState) -> Result<(), StoreError>;
    fn clear_open_position(&self, key: &ScopeKey) -> Result<(), StoreError>;
    /// Save the record and clear its open position as one transaction.
    fn commit_close(&self, record: &TradeRecord) -> Result<TradeId, StoreError>;
    fn open_positions(&self) -> Result<Vec<PositionState>, StoreError>;
    fn load_trades(&self, scope: &AccountScope) -> Result<Vec<TradeRecord>, StoreError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreDoc {
    open_positions: Vec<PositionState>,
    trades: Vec<TradeRecord>,
}

impl StoreDoc {
    // idempotent: a retried commit finds its id already present
    fn insert_trade(&mut self, record: &TradeRecord) -> TradeId {
        if !self.trades.iter().any(|t| t.id == record.id) {
            self.trades.push(record.clone());
        }
        record.id.clone()
    }

    fn upsert_open(&mut self, position: &PositionState) {
        let key = position.key();
        match self.open_positions.iter_mut().find(|p| p.key() == key) {
            Some(slot) => *slot = position.clone(),
            None => self.open_positions.push(position.clone()),
        }
    }

    fn remove_open(&mut self, key: &ScopeKey) {
        self.open_positions.retain(|p| &p.key() != key);
    }

    fn open(&self, key: &ScopeKey) -> Option<PositionState> {
        self.open_positions.iter().find(|p| &p.key() == key).cloned()
    }

    fn trades_for(&self, scope: &AccountScope) -> Vec<TradeRecord> {
        self.trades.iter().filter(|t| t.mode == scope.mode && t.account == scope.account).cloned().collect()
    }
}

/// Single JSON document, rewritten through temp file + rename on every transaction.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    doc: Mutex<StoreDoc>,
}

impl JsonFileStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let doc = match fs::read(&path) {
            Ok(bytes) if !bytes.is_empty() => serde_json::from_slice(&bytes)?,
            Ok(_) => StoreDoc::default(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => StoreDoc::default(),
            Err(e) => return Err(e.into()),
        };
        info!(path = %path.display(), trades = doc.trades.len(), open = doc.open_positions.len(), "store: opened");
        Ok(Self { path, doc: Mutex::new(doc) })
    }

    pub fn path(&self) -> &Path { &self.path }

    // mutate a copy, write it, swap in only after the rename landed
    fn transact<R>(&self, f: impl FnOnce(&mut StoreDoc) -> R) -> Result<R, StoreError> {
        let mut guard = self.doc.lock();
        let mut next = guard.clone();
        let out = f(&mut next);
        self.write(&next)?;
        *guard = next;
        Ok(out)
    }

    fn write(&self, doc: &StoreDoc) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("tmp");
        let bytes = serde_json::to_vec_pretty(doc)?;
        {
            let mut f = File::create(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl TradeStore for JsonFileStore {
    fn save_trade(&self, record: &TradeRecord) -> Result<TradeId, StoreError> {
        self.transact(|d| d.insert_trade(record))
    }

    fn load_open_position(&self, key: &ScopeKey) -> Result<Option<PositionState>, StoreError> {
        Ok(self.doc.lock().open(key))
    }

    fn save_open_position(&self, position: &PositionState) -> Result<(), StoreError> {
        self.transact(|d| d.upsert_open(position))
    }

    fn clear_open_position(&self, key: &ScopeKey) -> Result<(), StoreError> {
        self.transact(|d| d.remove_open(key))
    }

    fn commit_close(&self, record: &TradeRecord) -> Result<TradeId, StoreError> {
        self.transact(|d| {
            d.remove_open(&record.key());
            d.insert_trade(record)
        })
    }

    fn open_positions(&self) -> Result<Vec<PositionState>, StoreError> {
        Ok(self.doc.lock().open_positions.clone())
    }

    fn load_trades(&self, scope: &AccountScope) -> Result<Vec<TradeRecord>, StoreError> {
        Ok(self.doc.lock().trades_for(scope))
    }
}

/// In-process store. `fail_next(n)` makes the next n writes fail, for exercising retry paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    doc: Mutex<StoreDoc>,
    fail_next: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub fn fail_next(&self, n: u32) { self.fail_next.store(n, Ordering::SeqCst); }

    pub fn trades(&self) -> Vec<TradeRecord> { self.doc.lock().trades.clone() }

    fn transact<R>(&self, f: impl FnOnce(&mut StoreDoc) -> R) -> Result<R, StoreError> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(f(&mut self.doc.lock()))
    }
}

impl TradeStore for MemoryStore {
    fn save_trade(&self, record: &TradeRecord) -> Result<TradeId, StoreError> {
        self.transact(|d| d.insert_trade(record))
    }

    fn load_open_position(&self, key: &ScopeKey) -> Result<Option<PositionState>, StoreError> {
        Ok(self.doc.lock().open(key))
    }

    fn save_open_position(&self, position: &PositionState) -> Result<(), StoreError> {
        self.transact(|d| d.upsert_open(position))
    }

    fn clear_open_position(&self, key: &ScopeKey) -> Result<(), StoreError> {
        self.transact(|d| d.remove_open(key))
    }

    fn commit_close(&self, record: &TradeRecord) -> Result<TradeId, StoreError> {
        self.transact(|d| {
            d.remove_open(&record.key());
            d.insert_trade(record)
        })
    }

    fn open_positions(&self) -> Result<Vec<PositionState>, StoreError> {
        Ok(self.doc.lock().open_positions.clone())
    }

    fn load_trades(&self, scope: &AccountScope) -> Result<Vec<TradeRecord>, StoreError> {
        Ok(self.doc.lock().trades_for(scope))
    }
}
