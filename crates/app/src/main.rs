#[tokio::main]
async fn main() {
    if let Err(error) = upscaler_app::run_from_env().await {
        let code = upscaler_app::exit_code(&error);
        if code == upscaler_app::EXIT_CANCELLED {
            tracing::warn!("Cancelled: {error:#}");
        } else {
            tracing::error!("{error:#}");
        }
        std::process::exit(code);
    }
}
