//! Wiring and lifecycle.
//!
//! The controller builds the shared collector state from configuration and
//! runs the three long-lived tasks (ingest processor, retention reaper,
//! query API) until the cancellation token fires. Router event sources are
//! external collaborators: they feed the pipeline through the channel
//! handle exposed by [`Controller::event_sender`].

use std::sync::Arc;

use log::info;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthGate;
use crate::configuration::Config;
use crate::error_handling::types::ControllerError;
use crate::ingest::{Collector, IngestProcessor, RecordEvent};
use crate::metrics::PipelineMetrics;
use crate::reaper::TtlReaper;
use crate::web_interface::WebServer;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub struct Controller {
    config: Config,
    collector: Arc<RwLock<Collector>>,
    gate: Arc<AuthGate>,
    events_tx: mpsc::Sender<RecordEvent>,
    events_rx: Option<mpsc::Receiver<RecordEvent>>,
    cancel: CancellationToken,
}

impl Controller {
    pub fn new(config: Config) -> Result<Self, ControllerError> {
        let metrics = PipelineMetrics::new()
            .map_err(|e| ControllerError::InitializationFailed(e.to_string()))?;
        let collector = Arc::new(RwLock::new(Collector::new(config.origin.clone(), metrics)));
        let gate = Arc::new(AuthGate::new(config.auth_mode, config.users_dir.clone()));
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            config,
            collector,
            gate,
            events_tx,
            events_rx: Some(events_rx),
            cancel: CancellationToken::new(),
        })
    }

    /// Handle for router event sources to feed the pipeline.
    pub fn event_sender(&self) -> mpsc::Sender<RecordEvent> {
        self.events_tx.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn collector(&self) -> Arc<RwLock<Collector>> {
        self.collector.clone()
    }

    /// Runs the pipeline to completion (that is, until shutdown is
    /// requested).
    pub async fn run(&mut self) -> Result<(), ControllerError> {
        let events_rx = self
            .events_rx
            .take()
            .ok_or_else(|| ControllerError::InitializationFailed("already running".to_string()))?;

        info!(
            "collector starting at site {} (auth mode {})",
            self.config.origin, self.config.auth_mode
        );

        let ingest = IngestProcessor::new(
            self.collector.clone(),
            events_rx,
            self.cancel.child_token(),
        );
        let reaper = TtlReaper::new(
            self.collector.clone(),
            self.config.retention(),
            self.config.reaper_period(),
            self.cancel.child_token(),
        );
        let web = WebServer::new(
            self.collector.clone(),
            self.gate.clone(),
            self.config.clone(),
        );

        let ingest_task = tokio::spawn(ingest.run());
        let reaper_task = tokio::spawn(reaper.run());
        let web_task = tokio::spawn(web.serve(self.cancel.child_token()));

        // nothing to flush on the way out: the store is memory-only and is
        // rebuilt from the event stream on restart
        let _ = tokio::join!(ingest_task, reaper_task, web_task);
        info!("collector stopped");
        Ok(())
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_drains_cleanly_on_cancellation() {
        let mut controller = Controller::new(Config {
            listen_port: 18010,
            ..Default::default()
        })
        .unwrap();
        let cancel = controller.cancellation_token();
        let sender = controller.event_sender();

        let run = tokio::spawn(async move { controller.run().await });
        drop(sender);
        cancel.cancel();
        let result = run.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn run_twice_is_an_initialization_error() {
        let mut controller = Controller::new(Config::default()).unwrap();
        controller.cancellation_token().cancel();
        controller.run().await.unwrap();
        assert!(matches!(
            controller.run().await,
            Err(ControllerError::InitializationFailed(_))
        ));
    }
}
