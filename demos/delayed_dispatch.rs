use rabbitmq_queue::{
    ConnectionConfig, Delay, ExchangeParams, ExchangeType, QueueConfig, QueueError, QueueParams,
    RabbitMQConnector, Settings,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// 1. Define your job data
#[derive(Serialize, Deserialize, Debug, Clone)]
struct SendReminder {
    user_id: u32,
    text: String,
}

// 2. Load settings, falling back to a local broker when nothing is configured
fn settings() -> Settings {
    Settings::load().unwrap_or_else(|e| {
        log::warn!("No usable RABBITMQ_* configuration ({}). Using local defaults.", e);
        Settings {
            connection: ConnectionConfig::default(),
            queue: QueueConfig::new(
                "reminders",
                QueueParams { passive: false, durable: true, exclusive: false, auto_delete: false },
                ExchangeParams {
                    kind: ExchangeType::Direct,
                    passive: false,
                    durable: true,
                    auto_delete: false,
                },
            ),
        }
    })
}

// 3. Publish some jobs and drain the queue until Ctrl+C
async fn run(settings: &Settings) -> Result<(), QueueError> {
    let queue = RabbitMQConnector::connect(settings).await?;

    for user_id in 1..=3 {
        let reminder = SendReminder { user_id, text: format!("Reminder #{}", user_id) };
        queue
            .later(Delay::from_secs(i64::from(user_id) * 5), "SendReminder", &reminder, None)
            .await?;
        log::info!("Scheduled reminder for user {} in {}s", user_id, user_id * 5);
    }
    queue.push("SendReminder", &SendReminder { user_id: 0, text: "Right away".into() }, None).await?;

    loop {
        match queue.pop(None).await? {
            Some(job) => {
                let payload = job.decode::<SendReminder>()?;
                log::info!(
                    "Received '{}' for user {}: {}",
                    payload.job,
                    payload.data.user_id,
                    payload.data.text
                );
                job.ack().await?;
            }
            None => tokio::time::sleep(Duration::from_secs(1)).await,
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = settings();
    let reconnect_delay = Duration::from_secs(5);

    loop {
        tokio::select! {
            // Listen for Ctrl+C for graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                log::info!("Ctrl+C received. Shutting down.");
                break;
            },

            result = run(&settings) => {
                match result {
                    Ok(()) => break,
                    Err(e) if e.is_transport() => {
                        log::error!("Lost the broker: {}. Reconnecting in {:?}...", e, reconnect_delay);
                        tokio::time::sleep(reconnect_delay).await;
                    }
                    Err(e) => {
                        log::error!("Stopping: {}", e);
                        break;
                    }
                }
            }
        }
    }

    log::info!("Application has shut down.");
}
