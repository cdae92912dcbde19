use anyhow::Result;
use log::info;

mod data;
mod protocol;
mod server;
mod store;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let addr = std::env::var("PONGSRV_ADDR").unwrap_or_else(|_| "0.0.0.0:8081".to_string());
    let db_path = std::env::var("PONGSRV_DB").unwrap_or_else(|_| "pongsrv.db".to_string());

    let store = store::run(&db_path)?;

    info!("starting server on {addr}");
    server::run(store, addr).await
}
