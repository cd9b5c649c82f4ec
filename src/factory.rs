use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::config::RpcMuxConfig;
use crate::errors::RpcMuxError;
use crate::manager::RpcManager;
use crate::RpcExecutor;

/// Builds a fully wired stack from a validated configuration.
///
/// The factory owns nothing after `build`; the returned [`RpcStack`] holds
/// the manager and every background task it spawned.
pub struct ComponentFactory {
    config: RpcMuxConfig,
}

impl ComponentFactory {
    pub fn new(config: RpcMuxConfig) -> Result<Self, RpcMuxError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn from_toml_file(path: &str) -> Result<Self, RpcMuxError> {
        Self::new(RpcMuxConfig::from_toml_file(path)?)
    }

    pub fn from_env() -> Result<Self, RpcMuxError> {
        Self::new(RpcMuxConfig::from_env()?)
    }

    pub fn config(&self) -> &RpcMuxConfig {
        &self.config
    }

    /// Wire every component together and spawn the background tasks:
    /// cache expiry sweep, endpoint recovery pass, and the health log.
    pub fn build(&self, executor: Arc<dyn RpcExecutor>) -> RpcStack {
        let manager = RpcManager::new(&self.config, executor);

        let tasks = vec![
            manager.cache().clone().start_cleanup(),
            manager.selector().clone().start_recovery_task(),
            manager.selector().clone().start_health_log(),
        ];

        info!(
            endpoints = self.config.selector.endpoints.len(),
            tasks = tasks.len(),
            "rpc stack assembled"
        );

        RpcStack { manager, tasks }
    }
}

/// A running stack: the manager plus its background tasks. Dropping the
/// stack aborts the tasks.
pub struct RpcStack {
    manager: Arc<RpcManager>,
    tasks: Vec<JoinHandle<()>>,
}

impl RpcStack {
    pub fn manager(&self) -> &Arc<RpcManager> {
        &self.manager
    }

    /// Drain open batches so no waiter is left pending, then stop the
    /// background tasks
    pub async fn shutdown_graceful(mut self) {
        self.manager.batcher().flush_all().await;
        self.shutdown();
    }

    /// Abort every background task. Idempotent; also runs on drop.
    pub fn shutdown(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("rpc stack shut down");
    }
}

impl Drop for RpcStack {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct EchoExecutor;

    #[async_trait]
    impl RpcExecutor for EchoExecutor {
        async fn execute(
            &self,
            _endpoint: &Endpoint,
            method: &str,
            _params: Value,
        ) -> Result<Value, RpcMuxError> {
            Ok(json!({ "method": method }))
        }

        async fn execute_batch(
            &self,
            _endpoint: &Endpoint,
            _method: &str,
            batch: Vec<Value>,
        ) -> Result<Vec<Value>, RpcMuxError> {
            Ok(batch)
        }
    }

    #[test]
    fn test_factory_rejects_invalid_config() {
        let config = RpcMuxConfig::from_urls(&[]);
        assert!(matches!(
            ComponentFactory::new(config),
            Err(RpcMuxError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_built_stack_serves_calls() {
        let factory =
            ComponentFactory::new(RpcMuxConfig::from_urls(&["https://a.example".into()])).unwrap();
        let stack = factory.build(Arc::new(EchoExecutor));

        let result = stack.manager().call("getSlot", json!([])).await.unwrap();
        assert_eq!(result["method"], "getSlot");
    }

    #[tokio::test]
    async fn test_shutdown_aborts_background_tasks() {
        let factory =
            ComponentFactory::new(RpcMuxConfig::from_urls(&["https://a.example".into()])).unwrap();
        let mut stack = factory.build(Arc::new(EchoExecutor));
        assert_eq!(stack.tasks.len(), 3);

        let probes: Vec<_> = stack.tasks.iter().map(|t| t.abort_handle()).collect();
        stack.shutdown();
        assert!(stack.tasks.is_empty());

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        for probe in probes {
            assert!(probe.is_finished());
        }
    }
}
