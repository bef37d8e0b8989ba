use mimalloc::MiMalloc;
use panowalk::{config::CONFIG, session::monitor, web};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt::init();

    let state = web::AppState::new(CONFIG.clone())?;

    tokio::spawn(monitor::run(state.sessions.clone()));
    web::serve(state).await?;

    Ok(())
}
