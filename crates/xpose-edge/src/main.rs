use std::net::SocketAddr;

use xpose_edge::args::EdgeArgs;
use xpose_edge::gateway;
use xpose_edge::state::GatewayState;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = EdgeArgs::from_env();
    let state = GatewayState::new(args.public_domain.clone());
    let app = gateway::router(state);

    let addr: SocketAddr = ([0, 0, 0, 0], args.port).into();
    tracing::info!(%addr, domain = %args.public_domain, "xpose-edge listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
