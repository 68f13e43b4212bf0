//! Run configuration, built once from validated options and read-only during a run.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kcopy_core::{CopyError, CopyOutcome, Direction};
use kcopy_kubehub::ApiSurface;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_POOL_SIZE: usize = 160;
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_READINESS_POLL: Duration = Duration::from_secs(1);
pub const DEFAULT_SCHEDULER_CONFIG: &str = "/tmp/kube-scheduler-config.yaml";

#[derive(Clone)]
pub struct CopierConfig {
    /// Cluster objects are downloaded from.
    pub source: Option<Arc<dyn ApiSurface>>,
    /// Cluster objects are uploaded to.
    pub target: Option<Arc<dyn ApiSurface>>,
    pub obj_dir: PathBuf,
    pub pool_size: usize,
    /// Upload in dependency waves and wait for readiness between them.
    pub order_kinds: bool,
    pub scheduler_config: Option<PathBuf>,
    pub readiness_timeout: Duration,
    pub readiness_poll: Duration,
    /// Applies to every list/get/apply call when set.
    pub call_timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

impl CopierConfig {
    pub fn new(obj_dir: impl Into<PathBuf>) -> Self {
        Self {
            source: None,
            target: None,
            obj_dir: obj_dir.into(),
            pool_size: DEFAULT_POOL_SIZE,
            order_kinds: true,
            scheduler_config: None,
            readiness_timeout: DEFAULT_READINESS_TIMEOUT,
            readiness_poll: DEFAULT_READINESS_POLL,
            call_timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_source(mut self, source: Arc<dyn ApiSurface>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_target(mut self, target: Arc<dyn ApiSurface>) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_order_kinds(mut self, order_kinds: bool) -> Self {
        self.order_kinds = order_kinds;
        self
    }

    pub fn with_scheduler_config(mut self, path: Option<PathBuf>) -> Self {
        self.scheduler_config = path;
        self
    }

    pub fn with_readiness(mut self, timeout: Duration, poll: Duration) -> Self {
        self.readiness_timeout = timeout;
        self.readiness_poll = poll;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Checks that need no disk or network access.
    pub fn validate_for(&self, direction: Direction) -> CopyOutcome<()> {
        if self.pool_size == 0 {
            return Err(CopyError::Configuration("pool size must be at least 1".into()));
        }
        if self.obj_dir.as_os_str().is_empty() {
            return Err(CopyError::Configuration("object directory is required".into()));
        }
        if self.readiness_poll.is_zero() {
            return Err(CopyError::Configuration("readiness poll interval must be positive".into()));
        }
        match direction {
            Direction::Download if self.source.is_none() => Err(CopyError::Configuration("download needs a source cluster".into())),
            Direction::Upload if self.target.is_none() => Err(CopyError::Configuration("upload needs a target cluster".into())),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for CopierConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CopierConfig")
            .field("source", &self.source.is_some())
            .field("target", &self.target.is_some())
            .field("obj_dir", &self.obj_dir)
            .field("pool_size", &self.pool_size)
            .field("order_kinds", &self.order_kinds)
            .field("scheduler_config", &self.scheduler_config)
            .field("readiness_timeout", &self.readiness_timeout)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}
