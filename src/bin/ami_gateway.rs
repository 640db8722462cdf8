//! ami-gateway: AMI protocol gateway and event relay
//!
//! Serves AMI actions over REST by running AJAM sessions against Asterisk,
//! and republishes AMI events on the message bus.
//!
//! ## Architecture
//! ```text
//! [REST client] -> [ami-gateway] -> AJAM /rawman -> [Asterisk]
//!                                                       |
//!                  [ami-gateway] <- AMI TCP events -----+
//!                        |
//!                        v
//!                 [AMQP exchange] -> [subscribed services]
//! ```
//!
//! ## Configuration
//! - `config.yaml`, `--config <path>` or `AMI_GATEWAY_CONFIG`
//! - `AMI_GATEWAY__<SECTION>__<KEY>` environment overrides
//! - `AMI_GATEWAY_LOG`: tracing filter (default: info)

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

use ami_gateway::ajam::AjamClient;
use ami_gateway::ami::AmiRelay;
use ami_gateway::api::{self, AppState};
use ami_gateway::bus::{
    handler_fn, BusConsumer, BusError, BusPublisher, BusType, ChannelBus, EventMarshaler,
    PublisherTemplate,
};
use ami_gateway::config::Config;
use ami_gateway::dispatch::ActionDispatcher;
use ami_gateway::events::catalog::{SERVICE_DEREGISTERED, SERVICE_REGISTERED};
use ami_gateway::health::StatusAggregator;
use ami_gateway::utils::bootstrap::init_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!("Starting ami-gateway service");

    let config_path = config_path_arg();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    info!(uuid = %config.uuid, "Configuration loaded");
    config.bus.log_summary();

    // Bus consumer: peers announce themselves on the bus.
    let consumer = Arc::new(BusConsumer::new(config.consumer.handler_timeout()));
    for name in [SERVICE_REGISTERED.name, SERVICE_DEREGISTERED.name] {
        consumer
            .register(
                name,
                handler_fn(|event| async move {
                    info!(
                        event = %event.name,
                        service = ?event.data.get("service_name"),
                        "Service announcement"
                    );
                    Ok::<(), BusError>(())
                }),
            )
            .await;
    }

    let publisher = start_bus(&config, consumer.clone()).await?;
    let template = PublisherTemplate::capture(publisher, EventMarshaler::new(config.uuid.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let relay_handle = if config.relay_enabled() {
        let relay = AmiRelay::new(config.ami.clone(), template);
        Some(relay.start(shutdown_rx))
    } else {
        info!("AMI event relay disabled");
        None
    };

    let transport = Arc::new(AjamClient::new(config.ajam.clone()));
    let mut status = StatusAggregator::new();
    status.add_provider(consumer);
    let state = AppState::new(ActionDispatcher::new(transport), Arc::new(status));

    // Dropping the sender also stops the relay if the server fails to start.
    let result = api::serve(state, &config.rest_api, async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    })
    .await;

    if let Some(handle) = relay_handle {
        if let Err(e) = handle.await {
            error!(error = %e, "AMI relay task failed");
        }
    }
    if let Err(e) = result {
        error!(error = %e, "REST server failed");
        return Err(e.to_string().into());
    }
    info!("ami-gateway stopped");
    Ok(())
}

/// `--config <path>` from the command line.
fn config_path_arg() -> Option<String> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
        if let Some(path) = arg.strip_prefix("--config=") {
            return Some(path.to_string());
        }
    }
    None
}

/// Connect the configured transport and start feeding `consumer`.
async fn start_bus(
    config: &Config,
    consumer: Arc<BusConsumer>,
) -> Result<Arc<dyn BusPublisher>, Box<dyn std::error::Error>> {
    match config.bus.bus_type {
        BusType::Channel => {
            info!("Using in-process channel bus");
            let bus = ChannelBus::new();
            bus.attach(consumer);
            Ok(Arc::new(bus))
        }
        #[cfg(feature = "amqp")]
        BusType::Amqp => {
            use ami_gateway::bus::{AmqpConsumer, AmqpPublisher};
            use ami_gateway::utils::bootstrap::connect_with_retry;

            let address = format!("{}:{}", config.bus.host, config.bus.port);
            let publisher = connect_with_retry("broker", &address, || {
                AmqpPublisher::new(&config.bus)
            })
            .await?;
            AmqpConsumer::new(&config.bus, config.consumer.queue_name.clone())?.start(consumer);
            Ok(Arc::new(publisher))
        }
        #[cfg(not(feature = "amqp"))]
        BusType::Amqp => Err("bus.type is amqp but the amqp feature is disabled".into()),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
