use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use carewatch::clock::SystemClock;
use carewatch::config::{EngineConfig, Seed};
use carewatch::database::{self, repositories::*};
use carewatch::domain::signals::SensorReading;
use carewatch::domain::{AckResponse, DeliveryReceipt, RiskEvent};
use carewatch::logging;
use carewatch::notification::{
    ChannelRouter, ChannelSender, EscalationSignal, EscalationSweeper, LogSender,
    NotificationOrchestrator, OrchestratorDeps, OrchestratorSettings, StaticContactDirectory,
    WebhookSender,
};

/// One line of stdin.
#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum Command {
    RiskEvent {
        event: RiskEvent,
    },
    Reading {
        reading: SensorReading,
    },
    Acknowledge {
        notification_id: String,
        response: AckResponse,
    },
    Receipt {
        attempt_id: String,
        receipt: DeliveryReceipt,
    },
    Cancel {
        batch_id: String,
    },
    Status {
        notification_id: String,
    },
    Batch {
        batch_id: String,
    },
    History {
        subject_id: String,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::load()?;
    let (logging_config, _log_guard) =
        logging::init_logging(&config.logging.dir, config.logging.retention_days)?;

    let pool =
        database::init_pool_with_size(&config.database.url, config.database.max_connections)
            .await?;
    database::run_migrations(&pool).await?;

    let seed = Seed::load()?;
    let templates = Arc::new(SqlxTemplateRepository::new(pool.clone()));
    for template in &seed.templates {
        templates.upsert(template).await?;
    }
    let directory = Arc::new(StaticContactDirectory::from_entries(seed.contacts));

    let transport: Arc<dyn ChannelSender> = match &config.delivery.gateway {
        Some(gateway) => {
            info!(url = %gateway.url, "Delivering through webhook gateway");
            Arc::new(WebhookSender::new(gateway.clone())?)
        }
        None => {
            warn!("No gateway configured, notifications are only logged");
            Arc::new(LogSender)
        }
    };
    let sender = Arc::new(ChannelRouter::new().route_all(transport));

    let notifications: Arc<dyn NotificationRepository> =
        Arc::new(SqlxNotificationRepository::new(pool.clone()));
    let clock = Arc::new(SystemClock);
    let orchestrator = NotificationOrchestrator::new(
        OrchestratorDeps::new(notifications.clone(), templates, directory, sender)
            .with_clock(clock.clone()),
        OrchestratorSettings::from_config(&config),
    );

    logging_config.start_retention_cleanup(orchestrator.shutdown_token());
    if config.sweep.enabled {
        EscalationSweeper::new(
            orchestrator.clone(),
            notifications,
            clock,
            config.sweep.interval(),
        )
        .with_stalled_grace(config.sweep.stalled_grace())
        .spawn();
    }
    forward_signals(orchestrator.subscribe());

    info!("carewatch ready, reading commands from stdin");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let response = match serde_json::from_str::<Command>(&line) {
                    Ok(command) => execute(&orchestrator, command).await,
                    Err(e) => json!({ "ok": false, "error": format!("invalid command: {}", e) }),
                };
                stdout.write_all(format!("{}\n", response).as_bytes()).await?;
                stdout.flush().await?;
            }
        }
    }

    orchestrator.shutdown();
    pool.close().await;
    info!("carewatch stopped");
    Ok(())
}

async fn execute(orchestrator: &NotificationOrchestrator, command: Command) -> Value {
    let result = async {
        Ok::<Value, carewatch::Error>(match command {
            Command::RiskEvent { event } => json!({ "batch_id": orchestrator.handle(event).await? }),
            Command::Reading { reading } => {
                let event = reading.to_risk_event()?;
                let risk_event_id = event.id.clone();
                let severity = event.severity;
                let batch_id = orchestrator.handle(event).await?;
                json!({ "risk_event_id": risk_event_id, "severity": severity, "batch_id": batch_id })
            }
            Command::Acknowledge {
                notification_id,
                response,
            } => {
                orchestrator.on_acknowledge(&notification_id, response).await?;
                json!({ "acknowledged": notification_id })
            }
            Command::Receipt {
                attempt_id,
                receipt,
            } => {
                orchestrator.on_delivery_receipt(&attempt_id, receipt).await?;
                json!({ "recorded": attempt_id })
            }
            Command::Cancel { batch_id } => {
                json!({ "cancelled": orchestrator.cancel_batch(&batch_id).await? })
            }
            Command::Status { notification_id } => {
                serde_json::to_value(orchestrator.get_notification_status(&notification_id).await?)?
            }
            Command::Batch { batch_id } => {
                serde_json::to_value(orchestrator.get_batch(&batch_id).await?)?
            }
            Command::History {
                subject_id,
                from,
                to,
            } => serde_json::to_value(orchestrator.get_history(&subject_id, from, to).await?)?,
        })
    }
    .await;

    match result {
        Ok(value) => json!({ "ok": true, "result": value }),
        Err(e) => {
            if !e.is_caller_facing() {
                error!(error = %e, "Command failed");
            }
            json!({ "ok": false, "error": e.to_string() })
        }
    }
}

/// Log every escalation signal; exhaustion alerts at error level.
fn forward_signals(mut rx: broadcast::Receiver<EscalationSignal>) {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(EscalationSignal::ExhaustionAlert(fault)) => {
                    error!(
                        batch_id = %fault.batch_id,
                        subject_id = %fault.subject_id,
                        severity = %fault.severity,
                        "EXHAUSTION ALERT: nobody acknowledged the risk event"
                    );
                }
                Ok(signal) => {
                    info!(
                        signal = signal.signal_type(),
                        batch_id = signal.batch_id(),
                        "Escalation signal"
                    );
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Escalation signal listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
