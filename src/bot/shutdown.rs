// src/bot/shutdown.rs - Graceful shutdown management

use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{broadcast, RwLock, Semaphore, SemaphorePermit};
use tokio::time::{sleep, timeout};

use crate::bot::session::SessionFacade;
use crate::bot::ChatBot;

const MAX_OPERATIONS: u32 = 1000;

/// Shutdown phases for orderly termination
#[derive(Debug, Clone, PartialEq)]
pub enum ShutdownPhase {
    /// Normal operation
    Running,
    /// Stop accepting new events but finish the ones in flight
    Draining,
    /// Components are being stopped
    Terminating,
    /// Shutdown complete
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// How long in-flight events may take before components are stopped anyway
    pub graceful_timeout_seconds: u64,
    /// Time allowed for each component
    pub component_timeout_seconds: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            graceful_timeout_seconds: 30,
            component_timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownStats {
    pub phase: ShutdownPhase,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub duration_seconds: Option<f64>,
    pub components_shutdown: Vec<String>,
    pub failed_components: Vec<(String, String)>, // (component, error)
    pub forced_termination: bool,
}

impl Default for ShutdownStats {
    fn default() -> Self {
        Self {
            phase: ShutdownPhase::Running,
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            components_shutdown: Vec::new(),
            failed_components: Vec::new(),
            forced_termination: false,
        }
    }
}

/// Component that can be gracefully shut down
#[async_trait::async_trait]
pub trait ShutdownComponent: Send + Sync {
    /// Component name for logging
    fn name(&self) -> &str;

    async fn shutdown(&self) -> Result<()>;

    /// A critical component that fails to stop makes the whole shutdown fail
    fn is_critical(&self) -> bool {
        false
    }

    /// Called if graceful shutdown fails
    async fn force_shutdown(&self) -> Result<()> {
        self.shutdown().await
    }
}

/// Main graceful shutdown manager
pub struct GracefulShutdown {
    config: ShutdownConfig,
    phase: Arc<RwLock<ShutdownPhase>>,
    stats: Arc<RwLock<ShutdownStats>>,
    shutdown_notifier: broadcast::Sender<ShutdownPhase>,
    components: Arc<RwLock<Vec<Box<dyn ShutdownComponent>>>>,
    active_operations: Arc<Semaphore>,
    is_shutdown_requested: Arc<RwLock<bool>>,
}

impl GracefulShutdown {
    pub fn new(config: ShutdownConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(10);

        Self {
            config,
            phase: Arc::new(RwLock::new(ShutdownPhase::Running)),
            stats: Arc::new(RwLock::new(ShutdownStats::default())),
            shutdown_notifier: shutdown_tx,
            components: Arc::new(RwLock::new(Vec::new())),
            active_operations: Arc::new(Semaphore::new(MAX_OPERATIONS as usize)),
            is_shutdown_requested: Arc::new(RwLock::new(false)),
        }
    }

    pub fn with_default_config() -> Self {
        Self::new(ShutdownConfig::default())
    }

    /// Components are stopped in registration order
    pub async fn register_component(&self, component: Box<dyn ShutdownComponent>) {
        let name = component.name().to_string();
        self.components.write().await.push(component);
        debug!("Registered shutdown component: {}", name);
    }

    /// Start listening for shutdown signals
    pub async fn start_signal_handlers(&self) {
        let phase_sigint = Arc::clone(&self.phase);
        let notifier_sigint = self.shutdown_notifier.clone();
        let shutdown_requested_sigint = Arc::clone(&self.is_shutdown_requested);

        tokio::spawn(async move {
            match signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C signal, initiating graceful shutdown...");
                    *shutdown_requested_sigint.write().await = true;
                    *phase_sigint.write().await = ShutdownPhase::Draining;
                    let _ = notifier_sigint.send(ShutdownPhase::Draining);
                }
                Err(err) => {
                    error!("Failed to listen for Ctrl+C signal: {}", err);
                }
            }
        });

        // systemd, docker stop
        #[cfg(unix)]
        {
            let phase_sigterm = Arc::clone(&self.phase);
            let notifier_sigterm = self.shutdown_notifier.clone();
            let shutdown_requested_sigterm = Arc::clone(&self.is_shutdown_requested);

            tokio::spawn(async move {
                let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(sigterm) => sigterm,
                    Err(err) => {
                        error!("Failed to register SIGTERM handler: {}", err);
                        return;
                    }
                };

                sigterm.recv().await;
                info!("Received SIGTERM signal, initiating graceful shutdown...");
                *shutdown_requested_sigterm.write().await = true;
                *phase_sigterm.write().await = ShutdownPhase::Draining;
                let _ = notifier_sigterm.send(ShutdownPhase::Draining);
            });
        }

        info!("Shutdown signal handlers started");
    }

    /// Wait for shutdown signal and perform graceful shutdown
    pub async fn wait_for_shutdown(&self) -> Result<()> {
        info!("Waiting for shutdown signal...");

        loop {
            if *self.is_shutdown_requested.read().await {
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }

        info!("Shutdown requested, beginning graceful shutdown process...");
        self.perform_shutdown().await
    }

    /// Drain, stop every component, and report whether a critical one failed
    pub async fn perform_shutdown(&self) -> Result<()> {
        let start_time = chrono::Utc::now();

        {
            let mut stats = self.stats.write().await;
            stats.started_at = Some(start_time);
            stats.phase = ShutdownPhase::Draining;
        }

        info!("Phase 1: Draining - finishing in-flight events...");
        *self.phase.write().await = ShutdownPhase::Draining;
        let _ = self.shutdown_notifier.send(ShutdownPhase::Draining);

        let drain_timeout = Duration::from_secs(self.config.graceful_timeout_seconds);
        match timeout(drain_timeout, self.wait_for_operations_completion()).await {
            Ok(()) => info!("All operations completed gracefully"),
            Err(_) => {
                warn!("Timeout waiting for operations to complete, proceeding with shutdown");
                self.stats.write().await.forced_termination = true;
            }
        }

        info!("Phase 2: Terminating - shutting down components...");
        *self.phase.write().await = ShutdownPhase::Terminating;
        let _ = self.shutdown_notifier.send(ShutdownPhase::Terminating);

        let critical_failures = self.shutdown_all_components().await;

        let end_time = chrono::Utc::now();
        let duration = (end_time - start_time).num_milliseconds() as f64 / 1000.0;

        {
            let mut stats = self.stats.write().await;
            stats.completed_at = Some(end_time);
            stats.duration_seconds = Some(duration);
            stats.phase = ShutdownPhase::Stopped;
        }

        *self.phase.write().await = ShutdownPhase::Stopped;
        let _ = self.shutdown_notifier.send(ShutdownPhase::Stopped);

        if !critical_failures.is_empty() {
            error!(
                "Shutdown finished in {:.2} seconds with critical failures: {}",
                duration,
                critical_failures.join(", ")
            );
            return Err(anyhow!("Critical components failed to shut down: {}", critical_failures.join(", ")));
        }

        info!("Graceful shutdown completed in {:.2} seconds", duration);
        Ok(())
    }

    async fn wait_for_operations_completion(&self) {
        // Holding every permit means nothing is running
        match self.active_operations.acquire_many(MAX_OPERATIONS).await {
            Ok(_permits) => debug!("All active operations have completed"),
            Err(e) => warn!("Operation semaphore closed while draining: {}", e),
        }
    }

    /// Returns the names of critical components that could not be stopped
    async fn shutdown_all_components(&self) -> Vec<String> {
        let components = self.components.read().await;
        let component_timeout = Duration::from_secs(self.config.component_timeout_seconds);
        let mut critical_failures = Vec::new();

        info!("Shutting down {} components...", components.len());

        for component in components.iter() {
            let component_name = component.name().to_string();
            info!("Shutting down component: {}", component_name);

            let failure = match timeout(component_timeout, component.shutdown()).await {
                Ok(Ok(())) => {
                    info!("Component '{}' shut down gracefully", component_name);
                    None
                }
                Ok(Err(e)) => {
                    error!("Component '{}' failed to shutdown gracefully: {:#}", component_name, e);
                    self.force_component(component.as_ref(), component_timeout).await
                }
                Err(_) => {
                    error!("Component '{}' shutdown timed out", component_name);
                    self.force_component(component.as_ref(), component_timeout).await
                }
            };

            let mut stats = self.stats.write().await;
            match failure {
                None => stats.components_shutdown.push(component_name),
                Some(reason) => {
                    if component.is_critical() {
                        critical_failures.push(component_name.clone());
                    }
                    stats.failed_components.push((component_name, reason));
                }
            }
        }

        critical_failures
    }

    async fn force_component(&self, component: &dyn ShutdownComponent, limit: Duration) -> Option<String> {
        let name = component.name();
        warn!("Attempting force shutdown of component '{}'", name);
        match timeout(limit, component.force_shutdown()).await {
            Ok(Ok(())) => {
                warn!("Component '{}' force shutdown successful", name);
                None
            }
            Ok(Err(force_err)) => {
                error!("Component '{}' force shutdown failed: {:#}", name, force_err);
                Some(format!("{:#}", force_err))
            }
            Err(_) => {
                error!("Component '{}' force shutdown timed out", name);
                Some("Force shutdown timeout".to_string())
            }
        }
    }

    pub async fn get_phase(&self) -> ShutdownPhase {
        self.phase.read().await.clone()
    }

    pub async fn get_stats(&self) -> ShutdownStats {
        self.stats.read().await.clone()
    }

    pub async fn is_shutdown_requested(&self) -> bool {
        *self.is_shutdown_requested.read().await
    }

    pub fn subscribe_to_shutdown(&self) -> broadcast::Receiver<ShutdownPhase> {
        self.shutdown_notifier.subscribe()
    }

    /// Manually trigger shutdown (for testing or programmatic shutdown)
    pub async fn trigger_shutdown(&self) {
        info!("Shutdown manually triggered");
        *self.is_shutdown_requested.write().await = true;
        *self.phase.write().await = ShutdownPhase::Draining;
        let _ = self.shutdown_notifier.send(ShutdownPhase::Draining);
    }

    /// Permit for one unit of work; `None` once shutdown has begun
    pub async fn acquire_operation_permit(&self) -> Option<SemaphorePermit<'_>> {
        if *self.phase.read().await == ShutdownPhase::Running {
            self.active_operations.acquire().await.ok()
        } else {
            None
        }
    }
}

/// Stops polling and disconnects the platform
pub struct ChatBotShutdownComponent {
    bot: Arc<ChatBot>,
}

impl ChatBotShutdownComponent {
    pub fn new(bot: Arc<ChatBot>) -> Self {
        Self { bot }
    }
}

#[async_trait::async_trait]
impl ShutdownComponent for ChatBotShutdownComponent {
    fn name(&self) -> &str {
        "ChatBot"
    }

    async fn shutdown(&self) -> Result<()> {
        info!("Shutting down ChatBot...");
        self.bot.shutdown().await?;
        info!("ChatBot shutdown complete");
        Ok(())
    }
}

/// Writes the final session state; a failure here fails the process
pub struct SessionShutdownComponent {
    facade: SessionFacade,
}

impl SessionShutdownComponent {
    pub fn new(facade: SessionFacade) -> Self {
        Self { facade }
    }
}

#[async_trait::async_trait]
impl ShutdownComponent for SessionShutdownComponent {
    fn name(&self) -> &str {
        "SessionStore"
    }

    fn is_critical(&self) -> bool {
        true
    }

    async fn shutdown(&self) -> Result<()> {
        info!("Flushing session state...");
        self.facade.shutdown().await?;
        info!("Session state saved");
        Ok(())
    }

    async fn force_shutdown(&self) -> Result<()> {
        self.facade.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::persistence::{MemoryStore, StateStore};
    use crate::config::BotConfiguration;
    use crate::types::{Gender, UserId};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct TestComponent {
        name: String,
        shutdown_called: Arc<AtomicBool>,
        should_fail: bool,
        critical: bool,
    }

    impl TestComponent {
        fn new(name: &str, should_fail: bool, critical: bool) -> Self {
            Self {
                name: name.to_string(),
                shutdown_called: Arc::new(AtomicBool::new(false)),
                should_fail,
                critical,
            }
        }
    }

    #[async_trait::async_trait]
    impl ShutdownComponent for TestComponent {
        fn name(&self) -> &str {
            &self.name
        }

        fn is_critical(&self) -> bool {
            self.critical
        }

        async fn shutdown(&self) -> Result<()> {
            self.shutdown_called.store(true, Ordering::Relaxed);
            if self.should_fail {
                Err(anyhow!("Test component shutdown failure"))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_graceful_shutdown_phases() {
        let shutdown_manager = GracefulShutdown::with_default_config();

        assert_eq!(shutdown_manager.get_phase().await, ShutdownPhase::Running);

        shutdown_manager.trigger_shutdown().await;
        sleep(Duration::from_millis(10)).await;

        assert_eq!(shutdown_manager.get_phase().await, ShutdownPhase::Draining);
        assert!(shutdown_manager.is_shutdown_requested().await);
    }

    #[tokio::test]
    async fn test_component_registration_and_shutdown() {
        let shutdown_manager = GracefulShutdown::with_default_config();

        let test_component = TestComponent::new("test", false, false);
        let was_called = test_component.shutdown_called.clone();

        shutdown_manager.register_component(Box::new(test_component)).await;

        shutdown_manager.trigger_shutdown().await;
        shutdown_manager.perform_shutdown().await.unwrap();

        assert!(was_called.load(Ordering::Relaxed));
        let stats = shutdown_manager.get_stats().await;
        assert_eq!(stats.phase, ShutdownPhase::Stopped);
        assert_eq!(stats.components_shutdown, vec!["test".to_string()]);
    }

    #[tokio::test]
    async fn test_only_critical_failures_fail_shutdown() {
        let lenient = GracefulShutdown::with_default_config();
        lenient
            .register_component(Box::new(TestComponent::new("flaky", true, false)))
            .await;
        assert!(lenient.perform_shutdown().await.is_ok());
        assert_eq!(lenient.get_stats().await.failed_components.len(), 1);

        let strict = GracefulShutdown::with_default_config();
        let later = TestComponent::new("after", false, false);
        let later_called = later.shutdown_called.clone();
        strict
            .register_component(Box::new(TestComponent::new("store", true, true)))
            .await;
        strict.register_component(Box::new(later)).await;

        assert!(strict.perform_shutdown().await.is_err());
        // Remaining components still get stopped
        assert!(later_called.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_operation_permits_during_shutdown() {
        let shutdown_manager = GracefulShutdown::with_default_config();

        let permit1 = shutdown_manager.acquire_operation_permit().await;
        assert!(permit1.is_some());
        drop(permit1);

        shutdown_manager.trigger_shutdown().await;

        let permit2 = shutdown_manager.acquire_operation_permit().await;
        assert!(permit2.is_none());
    }

    #[tokio::test]
    async fn test_session_component_writes_final_state() {
        let store = Arc::new(MemoryStore::new());
        let mut config = BotConfiguration::default();
        config.super_admin_id = 1;

        let facade = SessionFacade::open(store.clone() as Arc<dyn StateStore>, &config)
            .await
            .unwrap();
        facade.set_gender(UserId(5), Gender::Female).await.unwrap();

        let component = SessionShutdownComponent::new(facade);
        assert!(component.is_critical());
        component.shutdown().await.unwrap();

        let saved = store.current().await;
        assert_eq!(saved.users[&UserId(5)].gender, Some(Gender::Female));
    }

    #[tokio::test]
    async fn test_session_component_failure_is_reported() {
        let store = Arc::new(MemoryStore::new());
        let config = BotConfiguration::default();
        let facade = SessionFacade::open(store.clone() as Arc<dyn StateStore>, &config)
            .await
            .unwrap();

        // Both the graceful and the forced write fail
        store.fail_next(2);
        let shutdown_manager = GracefulShutdown::with_default_config();
        shutdown_manager
            .register_component(Box::new(SessionShutdownComponent::new(facade)))
            .await;

        let result = shutdown_manager.perform_shutdown().await;
        assert!(result.is_err());
        let stats = shutdown_manager.get_stats().await;
        assert_eq!(stats.failed_components[0].0, "SessionStore");
    }
}
