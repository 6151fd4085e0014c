// Configuration for the balance processor service

use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub server_port: u16,
    pub database_url: String,
    pub nats_url: String,
    /// Chain service name, prefixes every subject and durable name
    pub service_name: String,
    pub balance_index_url: String,
    pub node: NodeConfig,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub socket_path: String,
    pub network: String, // "main" or "test"
    pub request_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let server_port = env::var("BALANCE_PROCESSOR_PORT")
            .unwrap_or_else(|_| "8092".to_string())
            .parse()
            .expect("BALANCE_PROCESSOR_PORT must be a valid port number");

        let database_url = env::var("DATABASE_URL")
            .expect("DATABASE_URL must be set");

        let nats_url = env::var("NATS_URL")
            .unwrap_or_else(|_| "nats://localhost:4222".to_string());

        let service_name = env::var("SERVICE_NAME")
            .unwrap_or_else(|_| "bitcoin".to_string());

        let balance_index_url = env::var("BALANCE_INDEX_URL")
            .unwrap_or_else(|_| "http://localhost:8091".to_string());

        let node = NodeConfig {
            socket_path: env::var("NODE_IPC_PATH")
                .unwrap_or_else(|_| "/tmp/bitcoin.ipc".to_string()),
            network: env::var("NODE_NETWORK")
                .unwrap_or_else(|_| "main".to_string()),
            request_timeout_secs: env::var("NODE_REQUEST_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .expect("NODE_REQUEST_TIMEOUT_SECS must be a number"),
        };

        Self {
            server_port,
            database_url,
            nats_url,
            service_name,
            balance_index_url,
            node,
        }
    }
}
