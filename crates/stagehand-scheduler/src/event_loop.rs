//! Single-consumer event loop driving a [`ServiceScheduler`].
//!
//! Every callback from the resource manager, and every operator request, is
//! funnelled through one bounded channel so the scheduler is only ever
//! touched by one task. A kill-retry timer ticks alongside.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use stagehand_core::{Offer, ServiceSpec, TaskStatus};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::scheduler::ServiceScheduler;

const STATUS_RETRY_ATTEMPTS: u32 = 5;
const STATUS_RETRY_BASE: Duration = Duration::from_millis(100);

/// Everything the event loop reacts to.
///
/// Serialized externally tagged, e.g. `{"rescinded": "offer-1"}` or
/// `"disconnected"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerEvent {
    Registered {
        framework_id: String,
        reregistered: bool,
    },
    Disconnected,
    Offers(Vec<Offer>),
    Rescinded(String),
    Status(TaskStatus),
    UpdateConfig(ServiceSpec),
    /// Replace a pod instance, e.g. `POD-A-0`, on fresh reservations.
    ReplacePod(String),
}

impl SchedulerEvent {
    fn name(&self) -> &'static str {
        match self {
            SchedulerEvent::Registered { .. } => "registered",
            SchedulerEvent::Disconnected => "disconnected",
            SchedulerEvent::Offers(_) => "offers",
            SchedulerEvent::Rescinded(_) => "rescinded",
            SchedulerEvent::Status(_) => "status",
            SchedulerEvent::UpdateConfig(_) => "update_config",
            SchedulerEvent::ReplacePod(_) => "replace_pod",
        }
    }
}

pub struct EventLoop {
    scheduler: ServiceScheduler,
    events: mpsc::Receiver<SchedulerEvent>,
    kill_interval: Duration,
}

impl EventLoop {
    /// Create the loop and the sender half callbacks are delivered through.
    pub fn new(scheduler: ServiceScheduler, capacity: usize) -> (Self, mpsc::Sender<SchedulerEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let kill_interval = scheduler.config().kill_retry_interval();
        let event_loop = Self {
            scheduler,
            events: rx,
            kill_interval,
        };
        (event_loop, tx)
    }

    pub fn with_kill_interval(mut self, interval: Duration) -> Self {
        self.kill_interval = interval;
        self
    }

    /// Process events until every sender is dropped or `shutdown` flips.
    ///
    /// Returns the scheduler so callers can inspect its final state. Only
    /// internal invariant violations end the loop with an error.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> SchedulerResult<ServiceScheduler> {
        let mut ticker = tokio::time::interval(self.kill_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(kill_interval = ?self.kill_interval, "scheduler event loop started");

        loop {
            tokio::select! {
                event = self.events.recv() => {
                    let Some(event) = event else {
                        debug!("event channel closed");
                        break;
                    };
                    self.dispatch(event).await?;
                }
                _ = ticker.tick() => {
                    self.scheduler.kill_timer_tick();
                }
                _ = shutdown.changed() => {
                    info!("shutdown requested");
                    break;
                }
            }
        }

        info!("scheduler event loop stopped");
        Ok(self.scheduler)
    }

    async fn dispatch(&mut self, event: SchedulerEvent) -> SchedulerResult<()> {
        let name = event.name();
        let result = match event {
            SchedulerEvent::Registered {
                framework_id,
                reregistered,
            } => self.scheduler.registered(&framework_id, reregistered),
            SchedulerEvent::Disconnected => {
                self.scheduler.disconnected();
                Ok(())
            }
            SchedulerEvent::Offers(offers) => self.scheduler.offers(offers),
            SchedulerEvent::Rescinded(offer_id) => {
                self.scheduler.rescinded(&offer_id);
                Ok(())
            }
            SchedulerEvent::Status(status) => self.status_with_retry(status).await,
            SchedulerEvent::UpdateConfig(spec) => self.scheduler.update_config(&spec),
            SchedulerEvent::ReplacePod(instance) => self.scheduler.replace_pod(&instance),
        };

        match result {
            Ok(()) => Ok(()),
            Err(e @ SchedulerError::Internal(_)) => {
                error!(event = name, error = %e, "fatal scheduler error");
                Err(e)
            }
            Err(e) => {
                error!(event = name, error = %e, "event handling failed");
                Ok(())
            }
        }
    }

    /// Status updates must not be lost, so transient failures are retried
    /// with exponential backoff.
    async fn status_with_retry(&mut self, status: TaskStatus) -> SchedulerResult<()> {
        let mut delay = STATUS_RETRY_BASE;
        let mut attempt = 1;
        loop {
            match self.scheduler.status(status.clone()) {
                Err(e) if e.is_transient() && attempt < STATUS_RETRY_ATTEMPTS => {
                    warn!(
                        task_id = %status.task_id,
                        attempt,
                        error = %e,
                        "status processing failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use stagehand_core::{CPUS, DISK, MEM, PodSpec, Resource, TaskSpec, TaskState};
    use stagehand_state::MemPersister;

    use crate::driver::{DriverCall, RecordingDriver};
    use crate::scheduler::SchedulerBuilder;

    fn scheduler(driver: &RecordingDriver) -> ServiceScheduler {
        let spec = ServiceSpec::new("svc").with_pod(
            PodSpec::new("POD-A", 1).with_task(TaskSpec::new("A", "echo A", 1.0, 1000.0)),
        );
        SchedulerBuilder::new(spec, Arc::new(MemPersister::new()))
            .build(Arc::new(driver.clone()))
            .unwrap()
    }

    fn offer(id: &str) -> Offer {
        Offer::new(
            id,
            "agent-1",
            vec![
                Resource::scalar(CPUS, 4.0),
                Resource::scalar(MEM, 8192.0),
                Resource::scalar(DISK, 8192.0),
            ],
        )
    }

    #[test]
    fn test_events_parse_from_json_lines() {
        let registered: SchedulerEvent =
            serde_json::from_str(r#"{"registered":{"framework_id":"fw","reregistered":true}}"#)
                .unwrap();
        assert!(matches!(
            registered,
            SchedulerEvent::Registered { reregistered: true, .. }
        ));

        let disconnected: SchedulerEvent = serde_json::from_str(r#""disconnected""#).unwrap();
        assert_eq!(disconnected.name(), "disconnected");

        let status: SchedulerEvent = serde_json::from_str(
            r#"{"status":{"task_id":"A__1","state":"RUNNING"}}"#,
        )
        .unwrap();
        match status {
            SchedulerEvent::Status(s) => assert_eq!(s.state, TaskState::Running),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_events_drain_when_sender_dropped() {
        let driver = RecordingDriver::new();
        let (event_loop, tx) = EventLoop::new(scheduler(&driver), 16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        tx.send(SchedulerEvent::Registered {
            framework_id: "fw-1".into(),
            reregistered: false,
        })
        .await
        .unwrap();
        tx.send(SchedulerEvent::Offers(vec![offer("o1")])).await.unwrap();
        drop(tx);

        let scheduler = event_loop.run(shutdown_rx).await.unwrap();
        assert_eq!(driver.accepts().len(), 1);
        assert!(scheduler.state().fetch_task("POD-A-0-A").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_handler_errors_do_not_stop_the_loop() {
        let driver = RecordingDriver::new();
        let (event_loop, tx) = EventLoop::new(scheduler(&driver), 16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        tx.send(SchedulerEvent::ReplacePod("POD-Z-0".into())).await.unwrap();
        tx.send(SchedulerEvent::Status(TaskStatus::new("bogus", TaskState::Running)))
            .await
            .unwrap();
        drop(tx);

        event_loop.run(shutdown_rx).await.unwrap();
        assert!(
            driver
                .calls()
                .iter()
                .any(|c| matches!(c, DriverCall::Acknowledge { .. }))
        );
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_loop() {
        let driver = RecordingDriver::new();
        let (event_loop, _tx) = EventLoop::new(scheduler(&driver), 16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(event_loop.run(shutdown_rx));
        shutdown_tx.send(true).unwrap();
        let scheduler = handle.await.unwrap().unwrap();
        assert!(!scheduler.is_connected());
    }

    #[tokio::test]
    async fn test_kill_timer_ticks() {
        let driver = RecordingDriver::new();
        let (event_loop, tx) = EventLoop::new(scheduler(&driver), 16);
        let event_loop = event_loop.with_kill_interval(Duration::from_millis(10));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(event_loop.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(tx);
        handle.await.unwrap().unwrap();
        // No kills were pending, so the ticks had nothing to re-issue.
        assert!(driver.kills().is_empty());
    }
}
