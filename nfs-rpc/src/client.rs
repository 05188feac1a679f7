//! The RPC engine: owns the timer task, the statistics, and the list of
//! mounts the timer walks.

use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::config::MountConfig;
use crate::congestion::TICK;
use crate::error::RpcError;
use crate::mount::Mount;
use crate::stats::{RpcStats, StatsSnapshot};
use crate::timer::{self, MountList};
use crate::transport::Transport;

/// Must be created inside a tokio runtime; the timer task is spawned
/// immediately and stopped when the client is dropped.
pub struct RpcClient {
    mounts: MountList,
    stats: Arc<RpcStats>,
    timer: JoinHandle<()>,
}

impl RpcClient {
    pub fn new() -> Self {
        Self::with_tick(TICK)
    }

    /// Run the timer at a different rate. All tick-based timeouts scale
    /// with it.
    pub fn with_tick(tick: Duration) -> Self {
        let mounts: MountList = Arc::default();
        let timer = timer::spawn(mounts.clone(), tick);
        Self {
            mounts,
            stats: Arc::default(),
            timer,
        }
    }

    /// Connect to a server and start timing its calls.
    pub async fn mount(&self, config: MountConfig) -> Result<Mount, RpcError> {
        let mount = Mount::connect(config, self.stats.clone()).await?;
        self.track(&mount);
        Ok(mount)
    }

    /// Mount over a transport the caller opened.
    pub fn attach(&self, config: MountConfig, transport: Arc<dyn Transport>) -> Mount {
        let mount = Mount::with_transport(config, transport, self.stats.clone());
        self.track(&mount);
        mount
    }

    fn track(&self, mount: &Mount) {
        self.mounts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&mount.inner));
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

impl Default for RpcClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.timer.abort();
    }
}
