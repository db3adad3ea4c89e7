use dotenvy::dotenv;
use log::info;

use bothive::api;
use bothive::config::AppConfig;
use bothive::shared::state::AppState;
use bothive::shared::utils::create_pool;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = AppConfig::from_env();
    let pool = create_pool(&config.database_url)?;

    // Fail fast if the database is unreachable at startup.
    drop(pool.get()?);
    info!("database connection established");

    let addr = config.bind_addr();
    let state = AppState::new(pool, config);
    let app = api::router(state.manager.clone());

    info!("bothive listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
