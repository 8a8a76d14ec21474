// src/bot/mod.rs - Bot core: event dispatch workers and the delivery task

use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::platforms::PlatformConnection;
use crate::types::{Delivery, InboundEvent};

pub mod analytics;
pub mod commands;
pub mod moderation;
pub mod pairing;
pub mod persistence;
pub mod queue;
pub mod replies;
pub mod session;
pub mod shutdown;
pub mod spam;
pub mod users;

use commands::CommandRouter;
use session::SessionFacade;
use shutdown::GracefulShutdown;

const CHANNEL_CAPACITY: usize = 100;
const DELIVERY_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Core bot engine: owns the platform connection, the dispatch workers and the delivery task
pub struct ChatBot {
    connection: Arc<RwLock<Box<dyn PlatformConnection>>>,
    facade: SessionFacade,
    router: CommandRouter,
    dispatch_workers: usize,
    delivery_tx: mpsc::Sender<Delivery>,
    delivery_rx: Mutex<Option<mpsc::Receiver<Delivery>>>,
    shutdown: Option<Arc<GracefulShutdown>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ChatBot {
    pub fn new(connection: Box<dyn PlatformConnection>, facade: SessionFacade, dispatch_workers: usize) -> Self {
        let (delivery_tx, delivery_rx) = mpsc::channel::<Delivery>(CHANNEL_CAPACITY);
        // Search timeouts fire outside any event, so they feed the same delivery queue
        let facade = facade.with_delivery_sink(delivery_tx.clone());
        let router = CommandRouter::new(facade.clone());

        Self {
            connection: Arc::new(RwLock::new(connection)),
            facade,
            router,
            dispatch_workers: dispatch_workers.max(1),
            delivery_tx,
            delivery_rx: Mutex::new(Some(delivery_rx)),
            shutdown: None,
            tasks: Mutex::new(Vec::new()),
            dispatcher: Mutex::new(None),
        }
    }

    /// Events are only taken while `shutdown` hands out operation permits
    pub fn with_shutdown(mut self, shutdown: Arc<GracefulShutdown>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn facade(&self) -> &SessionFacade {
        &self.facade
    }

    pub async fn start(&self) -> Result<()> {
        info!("Starting chat bot...");

        let delivery_rx = self
            .delivery_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("Chat bot already started"))?;

        let receiver = {
            let mut connection = self.connection.write().await;
            let platform_name = connection.platform_name().to_string();
            connection.connect().await?;

            let receiver = connection
                .event_receiver()
                .ok_or_else(|| anyhow!("{} connection has no event receiver", platform_name))?;
            info!("Set up event receiver for {}", platform_name);
            receiver
        };

        let mut tasks = self.tasks.lock().await;
        tasks.push(self.start_delivery_task(delivery_rx));

        let mut workers = Vec::with_capacity(self.dispatch_workers);
        for index in 0..self.dispatch_workers {
            let (tx, rx) = mpsc::channel::<InboundEvent>(CHANNEL_CAPACITY);
            workers.push(tx);
            tasks.push(self.start_worker(index, rx));
        }

        *self.dispatcher.lock().await = Some(tokio::spawn(Self::run_dispatcher(receiver, workers)));

        info!("Chat bot started with {} dispatch workers", self.dispatch_workers);
        Ok(())
    }

    /// Sends deliveries to the platform in queue order
    fn start_delivery_task(&self, mut delivery_rx: mpsc::Receiver<Delivery>) -> JoinHandle<()> {
        let connection = Arc::clone(&self.connection);

        tokio::spawn(async move {
            while let Some(delivery) = delivery_rx.recv().await {
                let connection = connection.read().await;
                if let Err(e) = connection.deliver(&delivery).await {
                    error!(
                        "Failed to deliver to {} via {}: {:#}",
                        delivery.recipient(),
                        connection.platform_name(),
                        e
                    );
                }
            }
            debug!("Delivery task stopped");
        })
    }

    fn start_worker(&self, index: usize, mut events: mpsc::Receiver<InboundEvent>) -> JoinHandle<()> {
        let router = self.router.clone();
        let delivery_tx = self.delivery_tx.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let user = event.user();
                let _permit = match &shutdown {
                    Some(shutdown) => match shutdown.acquire_operation_permit().await {
                        Some(permit) => Some(permit),
                        None => {
                            debug!("Shutting down, dropping event from {}", user);
                            continue;
                        }
                    },
                    None => None,
                };

                for delivery in router.handle(event).await {
                    if let Err(e) = delivery_tx.send(delivery).await {
                        error!("Failed to queue delivery for {}: {}", e.0.recipient(), e);
                    }
                }
            }
            debug!("Dispatch worker {} stopped", index);
        })
    }

    /// Route each event to a worker by user, keeping one user's events in order
    async fn run_dispatcher(mut receiver: broadcast::Receiver<InboundEvent>, workers: Vec<mpsc::Sender<InboundEvent>>) {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let index = worker_index(&event, workers.len());
                    if let Err(e) = workers[index].send(event).await {
                        error!("Dispatch worker {} is gone, event from {} dropped", index, e.0.user());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event receiver lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Event receiver closed");
                    break;
                }
            }
        }
    }

    /// Health check for the platform connection
    pub async fn health_check(&self) -> HashMap<String, bool> {
        let mut status = HashMap::new();
        let connection = self.connection.read().await;

        let is_healthy = connection.is_connected().await;
        status.insert(connection.platform_name().to_string(), is_healthy);
        if !is_healthy {
            warn!("{} connection is unhealthy", connection.platform_name());
        }

        status
    }

    /// Stop taking events, let queued deliveries go out, then disconnect
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down chat bot...");

        if let Some(dispatcher) = self.dispatcher.lock().await.take() {
            dispatcher.abort();
        }

        let drained = tokio::time::timeout(DELIVERY_DRAIN_TIMEOUT, async {
            while self.delivery_tx.capacity() < self.delivery_tx.max_capacity() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!("Deliveries still queued after {:?}, dropping them", DELIVERY_DRAIN_TIMEOUT);
        }

        {
            let mut connection = self.connection.write().await;
            if let Err(e) = connection.disconnect().await {
                error!("Error disconnecting from {}: {}", connection.platform_name(), e);
            }
        }

        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }

        info!("Chat bot shutdown complete");
        Ok(())
    }
}

fn worker_index(event: &InboundEvent, workers: usize) -> usize {
    event.user().0.rem_euclid(workers as i64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::types::{ButtonAction, Gender, Notice, Payload, Target, UserId};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// In-process platform: tests inject events and read back deliveries
    struct MockConnection {
        events: broadcast::Sender<InboundEvent>,
        delivered: Arc<StdMutex<Vec<Delivery>>>,
        connected: bool,
    }

    #[async_trait]
    impl PlatformConnection for MockConnection {
        async fn connect(&mut self) -> Result<()> {
            self.connected = true;
            Ok(())
        }

        async fn deliver(&self, delivery: &Delivery) -> Result<()> {
            self.delivered.lock().unwrap().push(delivery.clone());
            Ok(())
        }

        fn platform_name(&self) -> &str {
            "mock"
        }

        async fn is_connected(&self) -> bool {
            self.connected
        }

        fn event_receiver(&self) -> Option<broadcast::Receiver<InboundEvent>> {
            Some(self.events.subscribe())
        }

        async fn disconnect(&mut self) -> Result<()> {
            self.connected = false;
            Ok(())
        }
    }

    fn mock_bot() -> (ChatBot, broadcast::Sender<InboundEvent>, Arc<StdMutex<Vec<Delivery>>>) {
        let (events, _) = broadcast::channel(100);
        let delivered = Arc::new(StdMutex::new(Vec::new()));
        let connection = MockConnection {
            events: events.clone(),
            delivered: Arc::clone(&delivered),
            connected: false,
        };
        let facade = SessionFacade::in_memory(UserId(1), &SessionConfig::default());
        (ChatBot::new(Box::new(connection), facade, 4), events, delivered)
    }

    async fn wait_for(delivered: &Arc<StdMutex<Vec<Delivery>>>, expected: &Delivery) -> bool {
        for _ in 0..200 {
            if delivered.lock().unwrap().contains(expected) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[test]
    fn test_worker_index_is_stable_per_user() {
        let event = |id| InboundEvent::Command {
            user: UserId(id),
            name: "help".to_string(),
            args: vec![],
        };
        assert_eq!(worker_index(&event(10), 4), worker_index(&event(10), 4));
        assert_eq!(worker_index(&event(-3), 4), 1);
        assert!(worker_index(&event(i64::MIN), 4) < 4);
    }

    #[tokio::test]
    async fn test_events_flow_to_deliveries() {
        let (bot, events, delivered) = mock_bot();
        bot.start().await.unwrap();
        assert_eq!(bot.health_check().await.get("mock"), Some(&true));

        let a = UserId(10);
        let b = UserId(11);
        events
            .send(InboundEvent::Button { user: a, action: ButtonAction::SetGender(Gender::Male) })
            .unwrap();
        events
            .send(InboundEvent::Button { user: b, action: ButtonAction::SetGender(Gender::Female) })
            .unwrap();
        assert!(wait_for(&delivered, &Delivery::notice(a, Notice::GenderSaved(Gender::Male))).await);
        assert!(wait_for(&delivered, &Delivery::notice(b, Notice::GenderSaved(Gender::Female))).await);

        let female = Target::Gender(Gender::Female);
        events
            .send(InboundEvent::Button { user: a, action: ButtonAction::FindPartner(female) })
            .unwrap();
        assert!(wait_for(&delivered, &Delivery::notice(a, Notice::Waiting { target: female })).await);

        events
            .send(InboundEvent::Button {
                user: b,
                action: ButtonAction::FindPartner(Target::Gender(Gender::Male)),
            })
            .unwrap();
        let a_matched = Delivery::notice(a, Notice::Matched { partner_gender: Some(Gender::Female) });
        let b_matched = Delivery::notice(b, Notice::Matched { partner_gender: Some(Gender::Male) });
        assert!(wait_for(&delivered, &a_matched).await);
        assert!(wait_for(&delivered, &b_matched).await);

        events
            .send(InboundEvent::Content { user: a, payload: Payload::text("hi") })
            .unwrap();
        assert!(wait_for(&delivered, &Delivery::Relay { to: b, payload: Payload::text("hi") }).await);

        bot.shutdown().await.unwrap();
        assert_eq!(bot.health_check().await.get("mock"), Some(&false));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (bot, _events, _delivered) = mock_bot();
        bot.start().await.unwrap();
        assert!(bot.start().await.is_err());
        bot.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_events_dropped_while_draining() {
        let (bot, events, delivered) = mock_bot();
        let shutdown = Arc::new(GracefulShutdown::with_default_config());
        let bot = bot.with_shutdown(Arc::clone(&shutdown));
        bot.start().await.unwrap();

        shutdown.trigger_shutdown().await;
        events
            .send(InboundEvent::Command { user: UserId(5), name: "start".to_string(), args: vec![] })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(delivered.lock().unwrap().is_empty());
        bot.shutdown().await.unwrap();
    }
}
