use std::sync::Arc;

use clap::Parser;
use pingora_core::server::Server;
use pingora_proxy::http_proxy_service_with_name;

use rampart::config::{CliOptions, GatewayConfig};
use rampart::engine::manager::{self, EngineManager};
use rampart::engine::passthrough::PassthroughEngine;
use rampart::logging::{init_logger, FileSink};
use rampart::service::http::{GatewayService, OriginConfig};
use rampart::waf::{Dispatcher, EventPlugin};

fn main() {
    // Read command-line arguments
    let opts = CliOptions::parse();
    let config = GatewayConfig::from_cli(opts).expect("Failed to load configuration");

    // Initialize logging
    let log_sink = init_logger(config.log_enabled, config.log_level, config.log_file.clone());

    // Load the first engine generation
    log::info!("Loading engine from {}...", config.engine_config.display());
    let engine_manager = Arc::new(EngineManager::new(
        Box::new(PassthroughEngine::load),
        config.max_engines,
    ));
    manager::install(engine_manager.clone());
    if let Err(e) = engine_manager.create(&config.engine_config) {
        if config.mediation.early_traffic {
            log::warn!("Engine initialization failed ({e}); traffic flows through unchecked");
        } else {
            log::warn!("Engine initialization failed ({e}); rejecting traffic until ready");
        }
    }
    let _control = engine_manager.spawn_control_poller(config.engine_config.clone(), config.control_poll);

    // Build the mediation layer
    log::info!("Starting {} dispatcher worker(s)...", config.workers);
    let dispatcher = Dispatcher::new(config.workers);
    let txlog = FileSink::transaction_log(config.txlog.clone());
    let event = Arc::new(EventPlugin::new(
        engine_manager,
        dispatcher,
        config.mediation.clone(),
        Some(txlog.sender()),
    ));
    let gateway = GatewayService::new(
        event,
        OriginConfig {
            address: config.origin.clone(),
            tls: config.origin_tls,
            sni: config.origin_sni.clone(),
        },
    );

    // Bootstrapping and server startup
    log::info!("Bootstrapping...");
    let mut server = Server::new(None).expect("Failed to create server");
    server.bootstrap();

    let mut http_service = http_proxy_service_with_name(&server.configuration, gateway, "rampart");
    log::info!("Listening on {}, proxying to {}", config.listen, config.origin);
    http_service.add_tcp(&config.listen);

    server.add_service(http_service);
    server.add_service(txlog);
    if let Some(sink) = log_sink {
        server.add_service(sink);
    }

    log::info!("Starting Server...");
    server.run_forever();
}
