//! The event-loop task wiring everything together.
//!
//! One task owns all protocol state: connection events, writer completions,
//! ping timers and the scheduler's quanta are multiplexed here, so sessions
//! are only ever touched from this loop. Capture threads talk to it
//! exclusively through the chunk rings.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::audio::device::{CaptureDevice, CpalDevice, DeviceError, DeviceOpener};
use crate::audio::source::PcmSource;
use crate::config::Config;
use crate::conn::connection::ConnId;
use crate::conn::{ConnectionEvent, ConnectionHandle, DiscoveryServer, EventSink, TcpServer};
use crate::encoder::EncoderBuilder;
use crate::pipeline::{Demultiplexor, FileConsumer, Multiplexor, PipelineError, Scheduler};
use crate::proto::streamer::{NotifyFactory, Streamer, StreamerSettings};
use crate::util::writer::WriteError;
use crate::{PRODUCT, VERSION};

const PING_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Everything the event loop reacts to.
enum EngineEvent {
    Command(ConnectionEvent),
    Stream(ConnectionEvent),
    WriteDone {
        conn: ConnId,
        result: Result<usize, WriteError>,
    },
}

pub async fn run(config: Config) -> Result<(), EngineError> {
    info!("{PRODUCT} {VERSION} starting");
    match config.file_output.clone() {
        Some(dir) => run_file_output(config, dir).await,
        None => run_server(config).await,
    }
}

fn build_sources(config: &Config) -> Result<Vec<PcmSource>, DeviceError> {
    let opener: DeviceOpener = Arc::new(|params, control| {
        CpalDevice::open(params, control).map(|device| Box::new(device) as Box<dyn CaptureDevice>)
    });

    config
        .sources
        .iter()
        .map(|params| PcmSource::new(params.clone(), Arc::clone(&opener)))
        .collect()
}

fn overflow_handler() -> crate::pipeline::OverflowHandler {
    Arc::new(|| {
        warn!("Buffer overflow error: a chunk was skipped");
    })
}

async fn run_server(config: Config) -> Result<(), EngineError> {
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<EngineEvent>();

    let command_sink: EventSink = {
        let tx = events_tx.clone();
        Arc::new(move |event| {
            let _ = tx.send(EngineEvent::Command(event));
        })
    };
    let stream_sink: EventSink = {
        let tx = events_tx.clone();
        Arc::new(move |event| {
            let _ = tx.send(EngineEvent::Stream(event));
        })
    };
    let notify_factory: NotifyFactory = {
        let tx = events_tx.clone();
        Arc::new(move |conn| {
            let tx = tx.clone();
            Arc::new(move |result| {
                let _ = tx.send(EngineEvent::WriteDone { conn, result });
            })
        })
    };

    let channels = config.sources[0].logical_channels;
    let bits_per_sample = config.sources[0].format.bits_per_sample();
    let streamer = Streamer::<ConnectionHandle>::new(
        StreamerSettings {
            http_port: config.http_port,
            format: config.format,
            channels,
            bits_per_sample,
            bits_per_value: config.bits_per_value,
            gain: config.gain,
        },
        notify_factory,
    );

    let multiplexor = Multiplexor::new(build_sources(&config)?);
    let mut scheduler = Scheduler::new(multiplexor, streamer);
    scheduler.start(overflow_handler())?;

    let slim_server = TcpServer::new(
        "slimproto",
        config.slimproto_port,
        config.max_connections,
        true,
        command_sink,
    )
    .start();
    let http_server = TcpServer::new(
        "http",
        config.http_port,
        config.max_connections,
        true,
        stream_sink,
    )
    .start();
    let discovery = DiscoveryServer::new(config.discovery_port).start();

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut delay = Duration::ZERO;
    let mut failure = None;

    loop {
        let quantum = tokio::time::sleep(delay);
        tokio::pin!(quantum);

        tokio::select! {
            Some(event) = events_rx.recv() => {
                dispatch(scheduler.consumer_mut(), event);
            }
            _ = ping.tick() => {
                scheduler.consumer_mut().on_ping_tick();
            }
            _ = &mut quantum => {
                match scheduler.process_quantum() {
                    Ok(Some(pause)) => delay = pause,
                    Ok(None) => delay = Duration::ZERO,
                    Err(e) => {
                        error!("Pipeline failure: {e}");
                        failure = Some(e);
                        break;
                    }
                }

                // The capture side died and its rings are drained: nothing
                // more will ever flow.
                let producer = scheduler.producer_mut();
                if !producer.is_running() && !producer.is_available() {
                    error!("All audio sources have stopped");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received termination signal");
                break;
            }
        }
    }

    scheduler.stop(true, Box::new(|| info!("Pipeline stopped")));
    slim_server.stop().await;
    http_server.stop().await;
    discovery.stop().await;

    match failure {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

fn dispatch(streamer: &mut Streamer<ConnectionHandle>, event: EngineEvent) {
    match event {
        EngineEvent::Command(event) => match event {
            ConnectionEvent::Open { handle, peer, .. } => {
                info!("SlimProto client connected ({peer})");
                streamer.on_command_open(handle);
            }
            ConnectionEvent::Data {
                conn,
                bytes,
                received_at,
            } => streamer.on_command_data(conn, &bytes, received_at),
            ConnectionEvent::Close { conn, .. } => streamer.on_command_close(conn),
        },
        EngineEvent::Stream(event) => match event {
            ConnectionEvent::Open { handle, peer, .. } => {
                info!("HTTP client connected ({peer})");
                streamer.on_stream_open(handle);
            }
            ConnectionEvent::Data { conn, bytes, .. } => streamer.on_stream_data(conn, &bytes),
            ConnectionEvent::Close { conn, .. } => streamer.on_stream_close(conn),
        },
        EngineEvent::WriteDone { conn, result } => streamer.on_write_done(conn, result),
    }
}

/// Offline mode: every source's stream lands in a file, dispatched by rate
/// through the demultiplexor.
async fn run_file_output(config: Config, dir: std::path::PathBuf) -> Result<(), EngineError> {
    std::fs::create_dir_all(&dir).map_err(|e| PipelineError::Io(e.to_string()))?;

    let builder = EncoderBuilder::for_format(config.format);
    let consumers = config
        .sources
        .iter()
        .map(|params| {
            FileConsumer::create(
                &builder,
                &dir,
                params.logical_channels,
                params.sampling_rate,
                params.format.bits_per_sample(),
                config.bits_per_value,
            )
        })
        .collect::<Result<Vec<_>, _>>()?;

    let multiplexor = Multiplexor::new(build_sources(&config)?);
    let mut scheduler = Scheduler::new(multiplexor, Demultiplexor::new(consumers));
    scheduler.start(overflow_handler())?;
    info!("Writing streams to {}", dir.display());

    let mut delay = Duration::ZERO;
    let mut failure = None;
    loop {
        let quantum = tokio::time::sleep(delay);
        tokio::pin!(quantum);

        tokio::select! {
            _ = &mut quantum => {
                match scheduler.process_quantum() {
                    Ok(Some(pause)) => delay = pause,
                    Ok(None) => delay = Duration::ZERO,
                    Err(e) => {
                        error!("Pipeline failure: {e}");
                        failure = Some(e);
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received termination signal");
                break;
            }
        }
    }

    scheduler.stop(true, Box::new(|| info!("Pipeline stopped")));
    match failure {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
