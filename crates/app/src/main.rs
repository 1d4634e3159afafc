#[tokio::main]
async fn main() {
    if let Err(error) = clipflow_app::run_from_env().await {
        tracing::error!("{error:#}");
        eprintln!("Error: {error:#}");
        std::process::exit(1);
    }
}
