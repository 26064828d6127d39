pub mod admin;
pub mod app;
pub mod auth;
pub mod buffer;
pub mod config;
pub mod engine;
pub mod files;
pub mod listener;
pub mod logging;
pub mod net;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod session;
pub mod tls;
pub mod users;

pub async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path).await
}
