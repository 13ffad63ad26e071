use std::sync::Arc;

use m2_jsonrpc::{
    config::Config,
    demo::HelloService,
    logging,
    router::Router,
    rpc::JsonRpcHandler,
    run,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();

    let config = Config::from_env()?;
    let handler = JsonRpcHandler::new(HelloService, config.handler_options())?;
    info!(methods = ?handler.methods().names(), "json-rpc handler ready");

    let router = Router::new()
        .with_status(handler.status_codes())
        .route("^/api$", Arc::new(handler))?;

    info!(
        recv_addr = %config.recv_addr,
        send_addr = %config.send_addr,
        "server starting"
    );

    run(&config, router).await?;
    Ok(())
}
