// Balance Processor - confirmation-tiered balance reconciliation
// Consumes transaction/block events from the broker, resolves transactions
// against the node and republishes consolidated balance updates

use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use balance_processor::balance_index::BalanceIndexClient;
use balance_processor::config::Config;
use balance_processor::consumer::ReconciliationConsumer;
use balance_processor::node_client::NodeClient;
use balance_processor::publisher::BalancePublisher;
use balance_processor::store::AccountStore;
use balance_processor::tx_resolver::TxResolver;
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Balance Processor starting...");

    let config = Config::from_env();

    let store = Arc::new(AccountStore::new(&config.database_url, 10).await?);

    let nats_client = async_nats::connect(&config.nats_url).await?;
    info!("Connected to NATS at {}", config.nats_url);

    let network = NodeClient::network_from_profile(&config.node.network)?;
    let node_client = Arc::new(NodeClient::new(
        &config.node.socket_path,
        network,
        Duration::from_secs(config.node.request_timeout_secs),
    ));

    let resolver = Arc::new(TxResolver::new(node_client));
    let balance_source = Arc::new(BalanceIndexClient::new(config.balance_index_url.clone()));
    let publisher = Arc::new(BalancePublisher::new(
        nats_client.clone(),
        &config.service_name,
    ));

    let consumer = Arc::new(ReconciliationConsumer::new(
        nats_client,
        &config.service_name,
        store,
        resolver,
        balance_source,
        publisher,
    ));

    tokio::spawn(consumer.run_forever());

    info!("Starting HTTP server on port {}", config.server_port);

    HttpServer::new(|| {
        App::new()
            .route("/health", web::get().to(health_check))
            .route("/metrics", web::get().to(metrics))
    })
    .bind(("0.0.0.0", config.server_port))?
    .run()
    .await?;

    Ok(())
}

async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "balance-processor",
        "version": "0.1.0"
    }))
}

async fn metrics() -> impl Responder {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    match encoder.encode(&prometheus::gather(), &mut buffer) {
        Ok(()) => HttpResponse::Ok().body(buffer),
        Err(e) => HttpResponse::InternalServerError().body(format!("metrics encode failed: {}", e)),
    }
}
