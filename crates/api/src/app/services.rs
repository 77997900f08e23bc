use std::{convert::Infallible, sync::Arc, sync::mpsc::RecvTimeoutError, time::Duration};

use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use tokio::sync::mpsc::unbounded_channel;
use tokio_stream::wrappers::UnboundedReceiverStream;

use orchestrator_core::Clock;
use orchestrator_events::Event;
use orchestrator_infra::{OrchestratorConfig, jobs::InMemoryJobStore, orchestrator::Orchestrator};

pub type ApiOrchestrator = Orchestrator<Arc<InMemoryJobStore>>;

/// Backlog replayed to a new SSE client that passed `after`.
const STREAM_REPLAY_LIMIT: usize = 1_000;

pub struct AppServices {
    pub orchestrator: Arc<ApiOrchestrator>,
    pub config: OrchestratorConfig,
}

pub fn build_services(config: OrchestratorConfig, clock: Arc<dyn Clock>) -> AppServices {
    let orchestrator = Arc::new(Orchestrator::in_memory(&config, clock));
    tracing::info!(
        heartbeat_timeout_ms = config.heartbeat_timeout.as_millis() as u64,
        event_log_capacity = config.event_log_capacity,
        tenants_configured = config.tenant_limits.len(),
        "orchestrator services initialized"
    );
    AppServices {
        orchestrator,
        config,
    }
}

/// Live event feed as Server-Sent Events.
///
/// With `after`, retained events newer than that sequence number are sent
/// first; live events are de-duplicated against them by `seq`.
pub fn event_sse_stream(
    services: Arc<AppServices>,
    after: Option<u64>,
) -> Sse<UnboundedReceiverStream<Result<SseEvent, Infallible>>> {
    let (tx, rx) = unbounded_channel::<Result<SseEvent, Infallible>>();

    tokio::task::spawn_blocking(move || {
        // Subscribe before reading the backlog so nothing falls in between.
        let subscription = services.orchestrator.subscribe();
        let mut last_sent = 0u64;

        if let Some(after) = after {
            match services.orchestrator.events_since(after, STREAM_REPLAY_LIMIT) {
                Ok(backlog) => {
                    for event in backlog {
                        last_sent = event.seq;
                        if tx.send(Ok(to_sse(&event))).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to replay event backlog"),
            }
        }

        let mut last_heartbeat = std::time::Instant::now();
        loop {
            match subscription.recv_timeout(Duration::from_millis(1000)) {
                Ok(event) => {
                    if event.seq <= last_sent {
                        continue;
                    }
                    last_sent = event.seq;
                    if tx.send(Ok(to_sse(&event))).is_err() {
                        break; // Receiver dropped
                    }
                    last_heartbeat = std::time::Instant::now();
                }
                Err(RecvTimeoutError::Timeout) => {
                    if tx.is_closed() {
                        break;
                    }
                    if last_heartbeat.elapsed() > Duration::from_secs(15) {
                        let heartbeat = SseEvent::default().event("heartbeat").data("{}");
                        if tx.send(Ok(heartbeat)).is_err() {
                            break;
                        }
                        last_heartbeat = std::time::Instant::now();
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    });

    Sse::new(UnboundedReceiverStream::new(rx)).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

fn to_sse(event: &Event) -> SseEvent {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    SseEvent::default()
        .id(event.seq.to_string())
        .event(event.event_type.as_str())
        .data(data)
}
