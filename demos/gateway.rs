//! Demo gateway.
//!
//! Accepts terminals, answers the mandatory replies and, as soon as a terminal
//! joins, queries its parameters with `0x8104`.
//!
//! ```text
//! RUST_LOG=debug cargo run --example gateway -- [config.json]
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use jt808_gateway::protocol::command;
use jt808_gateway::{
    Gateway, Message, Result, SessionConfig, TerminalDirectory, TerminalEvents,
};

struct Logger {
    directory: Arc<TerminalDirectory>,
}

impl TerminalEvents for Logger {
    fn on_not_supported(&self, msg: &Message) {
        tracing::info!(phone = %msg.phone(), "Unsupported command {:#06x}", msg.command());
    }

    fn on_join(&self, msg: &Message, outcome: &Result<String>) {
        let key = match outcome {
            Ok(key) => key.clone(),
            Err(e) => {
                tracing::warn!(phone = %msg.phone(), "Join failed: {}", e);
                return;
            }
        };
        tracing::info!(key = %key, "Terminal joined");

        let directory = self.directory.clone();
        tokio::spawn(async move {
            let query = directory
                .send(
                    &key,
                    command::P8104_QUERY_PARAMETER,
                    Bytes::new(),
                    Some(Duration::from_secs(10)),
                )
                .await;
            match query {
                Ok(response) => tracing::info!(
                    key = %key,
                    data = %hex::encode(response.body()),
                    "Parameters received"
                ),
                Err(e) => tracing::warn!(key = %key, "Parameter query failed: {}", e),
            }
        });
    }

    fn on_leave(&self, key: Option<&str>) {
        tracing::info!(key = ?key, "Terminal left");
    }
}

fn load_config() -> Result<SessionConfig> {
    match std::env::args().nth(1) {
        Some(path) => SessionConfig::from_json(&std::fs::read_to_string(path)?),
        None => Ok(SessionConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let addr = std::env::var("JT808_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let directory = Arc::new(TerminalDirectory::new());

    let gateway = Gateway::builder()
        .config(load_config()?)
        .directory(directory.clone())
        .events(Logger { directory })
        .bind(&addr)
        .await?;

    println!("jt808 gateway ready on {}", gateway.local_addr()?);

    gateway
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
}
