use anyhow::{Context, Result};
use log::{debug, error, info};
use std::path::Path;
use std::sync::Arc;
use tokio::time::Duration;

use anonmatch::bot::persistence::{JsonFileStore, StateStore};
use anonmatch::bot::shutdown::{ChatBotShutdownComponent, GracefulShutdown, SessionShutdownComponent};
use anonmatch::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables and initialize logging
    dotenv::dotenv().ok();
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("Starting anonymous chat bot v{}", anonmatch::VERSION);

    // =================================================================
    // CONFIGURATION
    // =================================================================

    let config_manager = ConfigurationManager::new(Path::new("config"));
    if let Err(e) = config_manager.initialize().await {
        error!("Failed to initialize configuration: {:#}", e);
        return Err(e);
    }

    let bot_config = config_manager.get_bot_config().await;
    bot_config.validate().context("Invalid bot configuration")?;
    info!(
        "Super admin {}, {} dispatch workers, search timeout {:?}",
        bot_config.super_admin_id, bot_config.dispatch_workers, bot_config.session.search_timeout_seconds
    );

    // =================================================================
    // SESSION STATE
    // =================================================================

    let store: Arc<dyn StateStore> = Arc::new(JsonFileStore::new(&bot_config.persistence.data_dir));
    let facade = SessionFacade::open(store, &bot_config).await?;

    if let Err(problem) = facade.verify().await {
        error!("Restored state is inconsistent: {}", problem);
    }

    // =================================================================
    // PLATFORM AND BOT CORE
    // =================================================================

    let telegram_config = TelegramConfig::from_env(&bot_config.telegram)?;
    let telegram = TelegramConnection::new(telegram_config);

    let shutdown_manager = Arc::new(GracefulShutdown::with_default_config());
    let bot = Arc::new(
        ChatBot::new(Box::new(telegram), facade, bot_config.dispatch_workers)
            .with_shutdown(Arc::clone(&shutdown_manager)),
    );

    // The bot stops before the final write so no event lands after it
    shutdown_manager
        .register_component(Box::new(ChatBotShutdownComponent::new(Arc::clone(&bot))))
        .await;
    shutdown_manager
        .register_component(Box::new(SessionShutdownComponent::new(bot.facade().clone())))
        .await;
    shutdown_manager.start_signal_handlers().await;

    if let Err(e) = bot.start().await {
        error!("Failed to start bot core: {:#}", e);
        if let Err(flush_err) = bot.facade().shutdown().await {
            error!("Final state flush failed: {:#}", flush_err);
        }
        return Err(e);
    }

    info!("Anonymous chat bot started successfully!");

    // =================================================================
    // MONITORING UNTIL SHUTDOWN
    // =================================================================

    let monitor_bot = Arc::clone(&bot);
    let monitor_shutdown = Arc::clone(&shutdown_manager);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        let mut shutdown_receiver = monitor_shutdown.subscribe_to_shutdown();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let stats = monitor_bot.facade().get_stats().await;
                    info!(
                        "Stats: {} users, {} active chats, {} waiting, {} messages relayed",
                        stats.total_users, stats.active_chats, stats.waiting_users, stats.messages_sent
                    );
                    for (platform, healthy) in monitor_bot.health_check().await {
                        debug!("{} healthy: {}", platform, healthy);
                    }
                    if let Err(problem) = monitor_bot.facade().verify().await {
                        error!("Session invariant violated: {}", problem);
                    }
                }
                _ = shutdown_receiver.recv() => {
                    info!("Monitor received shutdown signal");
                    break;
                }
            }
        }
    });

    // Blocks until Ctrl+C or SIGTERM; a failed final flush makes the process exit non-zero
    if let Err(e) = shutdown_manager.wait_for_shutdown().await {
        error!("Shutdown failed: {:#}", e);
        return Err(e);
    }

    info!("Goodbye!");
    Ok(())
}
