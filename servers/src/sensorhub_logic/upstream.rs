use crate::sensorhub_logic::config::Config;
use crate::sensorhub_logic::state::AppState;
use anyhow::{Context, Result};
use lib_sensorhub::ingestors::spawn_bus;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Background tasks on the ingestion side.
pub struct Upstream {
    pub bus: JoinHandle<()>,
    pub pipeline: JoinHandle<()>,
}

impl Upstream {
    /// Waits for both tasks after `cancel` has fired.
    pub async fn join(self) -> Result<()> {
        let (bus, pipeline) = tokio::join!(self.bus, self.pipeline);
        bus.context("MQTT client task panicked")?;
        pipeline.context("ingestion pipeline task panicked")?;
        Ok(())
    }
}

/// Starts the MQTT client and the ingestion pipeline it feeds. Nothing is
/// spawned when the bus settings are invalid.
pub fn spawn(config: &Config, state: &AppState, cancel: CancellationToken) -> Result<Upstream> {
    let (bus_tx, bus_rx) = mpsc::channel(config.bus_channel);

    let bus = spawn_bus(config.bus_settings(), bus_tx, state.bus_status.clone(), cancel.clone())
        .with_context(|| format!("invalid MQTT settings for broker '{}'", config.mqtt_broker))?;
    let pipeline = tokio::spawn(state.pipeline().run(bus_rx, cancel));

    Ok(Upstream { bus, pipeline })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use lib_sensorhub::connections::MemoryStore;
    use std::sync::Arc;

    fn state_for(config: &Config) -> AppState {
        AppState::new(config, Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn invalid_broker_starts_no_tasks() {
        let config = Config::try_parse_from(["server_sensorhub", "--mqtt-broker", "http://localhost:1883"]).unwrap();
        let state = state_for(&config);
        let before = Arc::strong_count(&state.broadcaster);

        let err = spawn(&config, &state, CancellationToken::new()).err().unwrap();
        assert!(err.to_string().contains("invalid MQTT settings"), "{err:#}");
        assert_eq!(Arc::strong_count(&state.broadcaster), before);
    }

    #[tokio::test]
    async fn both_tasks_stop_on_cancel() {
        let config = Config::try_parse_from(["server_sensorhub", "--mqtt-broker", "mqtt://127.0.0.1:1"]).unwrap();
        let state = state_for(&config);
        let cancel = CancellationToken::new();

        let upstream = spawn(&config, &state, cancel.clone()).unwrap();
        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), upstream.join())
            .await
            .unwrap()
            .unwrap();
    }
}
