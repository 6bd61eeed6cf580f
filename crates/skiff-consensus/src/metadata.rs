//! Durable consensus metadata.
//!
//! One record per tablet: `{current_term, voted_for, committed_config,
//! pending_config, self_uuid}`. Mutations happen in memory under the
//! replica lock; [`ConsensusMetadata::flush`] makes the current state
//! durable with a write-temp, fsync, rename sequence so a crash leaves
//! either the old record or the new one, never a torn one.
//!
//! Flushes are serialised by their own async lock; the snapshot is taken
//! after that lock is acquired, so a later flush can never overwrite the
//! file with older state.

use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::types::{PeerId, TabletId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DurableState {
    current_term: u64,
    /// Meaningful only for `current_term`; cleared whenever the term moves.
    voted_for: Option<PeerId>,
    committed_config: RaftConfig,
    pending_config: Option<RaftConfig>,
    self_uuid: PeerId,
}

/// Persistent consensus state for one tablet replica.
pub struct ConsensusMetadata {
    tablet_id: TabletId,
    path: PathBuf,
    state: Mutex<DurableState>,
    flush_lock: tokio::sync::Mutex<()>,
}

impl ConsensusMetadata {
    fn file_path(dir: &Path, tablet_id: &TabletId) -> PathBuf {
        dir.join(format!("{}.cmeta", tablet_id))
    }

    /// Create metadata for a new replica and flush the initial record.
    pub async fn create(
        dir: &Path,
        tablet_id: TabletId,
        self_uuid: PeerId,
        initial_config: RaftConfig,
    ) -> Result<Arc<Self>> {
        initial_config.validate()?;
        let path = Self::file_path(dir, &tablet_id);
        if tokio::fs::try_exists(&path).await? {
            return Err(RaftError::IllegalState(format!(
                "consensus metadata already exists at {}",
                path.display()
            )));
        }
        let cmeta = Arc::new(ConsensusMetadata {
            tablet_id,
            path,
            state: Mutex::new(DurableState {
                current_term: 0,
                voted_for: None,
                committed_config: initial_config,
                pending_config: None,
                self_uuid,
            }),
            flush_lock: tokio::sync::Mutex::new(()),
        });
        cmeta.flush().await?;
        Ok(cmeta)
    }

    /// Load the metadata record written by a previous incarnation.
    pub async fn load(dir: &Path, tablet_id: TabletId) -> Result<Arc<Self>> {
        let path = Self::file_path(dir, &tablet_id);
        let bytes = tokio::fs::read(&path).await?;
        let state: DurableState = bincode::deserialize(&bytes)?;
        Ok(Arc::new(ConsensusMetadata {
            tablet_id,
            path,
            state: Mutex::new(state),
            flush_lock: tokio::sync::Mutex::new(()),
        }))
    }

    pub fn tablet_id(&self) -> &TabletId {
        &self.tablet_id
    }

    pub fn self_uuid(&self) -> PeerId {
        self.state.lock().self_uuid.clone()
    }

    pub fn current_term(&self) -> u64 {
        self.state.lock().current_term
    }

    pub fn voted_for(&self) -> Option<PeerId> {
        self.state.lock().voted_for.clone()
    }

    pub fn has_voted_current_term(&self) -> bool {
        self.state.lock().voted_for.is_some()
    }

    pub fn committed_config(&self) -> RaftConfig {
        self.state.lock().committed_config.clone()
    }

    pub fn pending_config(&self) -> Option<RaftConfig> {
        self.state.lock().pending_config.clone()
    }

    pub fn has_pending_config(&self) -> bool {
        self.state.lock().pending_config.is_some()
    }

    /// The config replication currently runs against: the pending config if
    /// one is in flight, otherwise the committed config.
    pub fn active_config(&self) -> RaftConfig {
        let state = self.state.lock();
        state
            .pending_config
            .clone()
            .unwrap_or_else(|| state.committed_config.clone())
    }

    /// Advance the term, clearing the vote. Terms never move backwards.
    pub fn set_current_term(&self, term: u64) {
        let mut state = self.state.lock();
        debug_assert!(term > state.current_term);
        state.current_term = term;
        state.voted_for = None;
    }

    /// Record our vote for `uuid` in the current term.
    pub fn set_voted_for(&self, uuid: PeerId) {
        let mut state = self.state.lock();
        debug_assert!(state.voted_for.is_none() || state.voted_for.as_ref() == Some(&uuid));
        state.voted_for = Some(uuid);
    }

    /// Stage `config` as the single in-flight change. Not flushed here; it
    /// becomes durable with the next flush, and authoritative on commit.
    pub fn set_pending_config(&self, config: RaftConfig) -> Result<()> {
        let mut state = self.state.lock();
        if state.pending_config.is_some() {
            return Err(RaftError::ConfigChangePending);
        }
        state.pending_config = Some(config);
        Ok(())
    }

    pub fn clear_pending_config(&self) {
        self.state.lock().pending_config = None;
    }

    /// Promote `config` to committed and drop the pending slot. The caller
    /// flushes afterwards.
    pub fn set_committed_config(&self, config: RaftConfig) {
        let mut state = self.state.lock();
        state.committed_config = config;
        state.pending_config = None;
    }

    /// Make the current in-memory record durable.
    pub async fn flush(&self) -> Result<()> {
        let _flush_guard = self.flush_lock.lock().await;
        let snapshot = self.state.lock().clone();
        let bytes = bincode::serialize(&snapshot)?;

        let tmp_path = self.path.with_extension("cmeta.tmp");
        {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            tokio::io::AsyncWriteExt::write_all(&mut file, &bytes).await?;
            file.sync_all().await?;
        }
        tokio::fs::rename(&tmp_path, &self.path).await?;

        // Make the rename itself durable.
        if let Some(dir) = self.path.parent() {
            let dir_file = tokio::fs::File::open(dir).await?;
            dir_file.sync_all().await?;
        }
        Ok(())
    }
}
