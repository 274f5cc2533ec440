//! skiff: a multi-protocol file transfer engine.
//!
//! One dispatcher fronts SFTP, FTP/FTPS and S3 backends with uniform
//! semantics; a persistent FIFO queue drives concurrent transfers with
//! resume, retry and cancellation; auxiliary services cover directory
//! comparison, local-to-remote mirroring, external editing and encrypted
//! profile storage. Embedders subscribe to the event bus for queue
//! snapshots and edit outcomes.

pub mod config_paths;
pub mod crypto;
pub mod edit;
pub mod error;
pub mod events;
pub mod logging;
pub mod paths;
pub mod queue;
pub mod remote;
pub mod store;
pub mod sync;
pub mod types;
pub mod watcher;

use std::sync::{Arc, Mutex};

use tracing::info;

pub use crate::error::{RemoteError, RemoteResult};
pub use crate::events::{EditOutcome, EngineEvent, EngineEvents};
pub use crate::queue::{TaskSpec, TransferQueue, MAX_CONCURRENT, RETRY_CAP};
pub use crate::remote::{CancelFlag, ProgressFn, RemoteDispatcher, ShellChannel};
pub use crate::store::{ProfileStore, StoreError};
pub use crate::types::{
    AuthType, DirectoryEntry, Profile, Protocol, RemoteStat, Settings, SyncDiff, SyncStatus,
    TaskStatus, Theme, TransferDirection, TransferTask,
};

/// Process-wide engine: every singleton, initialised in dependency order
/// (settings → crypto → profiles → queue → watcher) and torn down in
/// reverse.
pub struct Engine {
    pub settings: Mutex<Settings>,
    pub crypto: Arc<crypto::CryptoStore>,
    pub profiles: Arc<store::ProfileStore>,
    pub dispatcher: Arc<RemoteDispatcher>,
    pub queue: Arc<TransferQueue>,
    pub watcher: Arc<watcher::DirectoryWatcher>,
    pub edit: Arc<edit::EditBridge>,
    pub events: EngineEvents,
}

impl Engine {
    /// Bring the engine up: sweep stale temp directories, load settings
    /// and the persisted queue (recovering interrupted tasks), and start
    /// the scheduler.
    pub fn init() -> Result<Arc<Self>, StoreError> {
        edit::sweep_temp_dirs();

        let events = EngineEvents::new();
        let settings = store::load_settings()?;
        let crypto = Arc::new(crypto::CryptoStore::new());
        let profiles = Arc::new(store::ProfileStore::new(crypto.clone()));
        let dispatcher = Arc::new(RemoteDispatcher::new());
        let queue = TransferQueue::load(dispatcher.clone(), events.clone())?;
        let watcher = Arc::new(watcher::DirectoryWatcher::new(queue.clone(), events.clone()));
        let edit = Arc::new(edit::EditBridge::new(dispatcher.clone(), events.clone()));

        queue.kick();
        info!("engine initialised");

        Ok(Arc::new(Self {
            settings: Mutex::new(settings),
            crypto,
            profiles,
            dispatcher,
            queue,
            watcher,
            edit,
            events,
        }))
    }

    /// Reverse-order teardown: watchers first, then the queue state, the
    /// connection, and finally the key material.
    pub async fn shutdown(&self) {
        self.watcher.stop_all();
        self.edit.close_all();
        self.queue.flush();
        self.dispatcher.disconnect().await;
        self.crypto.clear();
        info!("engine shut down");
    }

    pub fn save_settings(&self) -> Result<(), StoreError> {
        let settings = self
            .settings
            .lock()
            .map_err(|_| StoreError::Config("settings lock poisoned".to_string()))?
            .clone();
        store::save_settings(&settings)
    }
}
