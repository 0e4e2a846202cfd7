//! Bounded resource pool shared by the store adapters
//!
//! Each adapter owns one pool. Acquiring a slot and running an operation both
//! have deadlines, and either deadline expiring surfaces as
//! [`StrataError::Unavailable`] instead of blocking the caller.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::warn;

use crate::error::{Result, StrataError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum concurrent operations
    pub max_size: usize,
    /// How long to wait for a free slot (connection establishment)
    pub acquire_timeout: Duration,
    /// Deadline for a single operation once a slot is held
    pub operation_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 16,
            acquire_timeout: Duration::from_millis(2_000),
            operation_timeout: Duration::from_millis(10_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourcePool {
    name: Arc<str>,
    semaphore: Arc<Semaphore>,
    config: PoolConfig,
}

impl ResourcePool {
    pub fn new(name: &str, config: PoolConfig) -> Self {
        Self {
            name: Arc::from(name),
            semaphore: Arc::new(Semaphore::new(config.max_size.max(1))),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Free slots right now
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Take a slot, waiting at most `acquire_timeout`.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        let acquire = Arc::clone(&self.semaphore).acquire_owned();
        match tokio::time::timeout(self.config.acquire_timeout, acquire).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(StrataError::Unavailable(format!(
                "{} pool is closed",
                self.name
            ))),
            Err(_) => {
                warn!(
                    pool = %self.name,
                    max_size = self.config.max_size,
                    "Pool exhausted, no slot within {:?}",
                    self.config.acquire_timeout
                );
                Err(StrataError::Unavailable(format!(
                    "{} pool exhausted after waiting {:?}",
                    self.name, self.config.acquire_timeout
                )))
            }
        }
    }

    /// Run `op` while holding a slot, bounded by `operation_timeout`.
    pub async fn run<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _permit = self.acquire().await?;
        match tokio::time::timeout(self.config.operation_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(pool = %self.name, op, "Store operation timed out");
                Err(StrataError::Unavailable(format!(
                    "{} {op} timed out after {:?}",
                    self.name, self.config.operation_timeout
                )))
            }
        }
    }

    /// Stop handing out slots; waiters fail with `Unavailable`.
    pub fn close(&self) {
        self.semaphore.close();
    }
}
