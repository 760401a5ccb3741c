mod channels;
mod config;
mod engine;
mod error;
mod graph;
mod protocol;
mod session;

use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info, warn};

use crate::config::MixerdConfig;
use crate::engine::MockEngine;
use crate::protocol::{
    CommandDispatcher, CommandMessage, CommandPayload, EventPayload, HeartbeatMessage, Message,
    SetChannelProperties,
};
use crate::session::{SessionHandle, SessionOptions};

fn main() -> Result<()> {
    colog::default_builder()
        .filter_level(log::LevelFilter::Debug)
        .init();

    let config = MixerdConfig::load().unwrap_or_else(|err| {
        info!("using default config ({err:#})");
        let config = MixerdConfig::default();
        if let Err(err) = config.save() {
            warn!("failed to write default config: {err:#}");
        }
        config
    });
    info!("starting mixerd as '{}'", config.client_name);

    let engine = MockEngine::new(
        config.sample_rate,
        config.buffer_size,
        Duration::from_millis(config.meter_interval_ms),
    );
    let session = SessionHandle::start(
        Box::new(engine),
        SessionOptions {
            event_queue_depth: config.event_queue_depth,
        },
    )?;
    let events = session
        .subscribe()
        .context("session controller exited before subscription")?;
    let mut dispatcher = CommandDispatcher::new(session.client());

    // Until a transport is wired in front of the dispatcher, drive one
    // scripted session so the whole command path is exercised end to end.
    let mut run = |message: Message| {
        if let Some(response) = dispatcher.dispatch(&message) {
            match serde_json::to_string(&Message::Response(response)) {
                Ok(wire) => debug!("-> {wire}"),
                Err(err) => warn!("failed to serialize response: {err}"),
            }
        }
    };

    let commands = [
        CommandPayload::Initialize {
            client_name: config.client_name.clone(),
        },
        CommandPayload::CreatePorts {
            num_inputs: config.num_inputs,
            num_outputs: config.num_outputs,
        },
        CommandPayload::Activate,
        CommandPayload::ConnectPorts {
            source_port: "input_1".to_string(),
            destination_port: "output_1".to_string(),
        },
        CommandPayload::SetChannelProperties(SetChannelProperties {
            channel: 0,
            volume: Some(0.8),
            pan: Some(-0.2),
            ..Default::default()
        }),
        CommandPayload::GetServerStatus,
    ];
    for payload in commands {
        run(Message::Command(CommandMessage::from_payload(&payload)));
    }
    run(Message::Heartbeat(HeartbeatMessage::new("demo", 1)));

    // Let some telemetry arrive before shutting down.
    match events.recv_timeout(Duration::from_millis(config.meter_interval_ms * 3)) {
        Some(event) => {
            let payload = EventPayload::decode(&event.event_name, event.event_data);
            debug!("event: {payload:?}");
        }
        None => warn!("no events observed before shutdown"),
    }
    std::thread::sleep(Duration::from_millis(config.meter_interval_ms * 2));
    run(Message::Command(CommandMessage::from_payload(
        &CommandPayload::Deactivate,
    )));

    if let Ok(Some(data)) = session.command(CommandPayload::GetChannels) {
        debug!("final mixer state: {data}");
    }
    for event in events.drain() {
        let payload = EventPayload::decode(&event.event_name, event.event_data);
        debug!("event: {payload:?}");
    }
    info!("demo session complete");
    Ok(())
}
