use anyhow::Result;
use log::warn;
use std::sync::Arc;

use moviewriter::core::config::Config;
use moviewriter::services::agent::AgentService;
use moviewriter::services::image::create_image_fetcher;
use moviewriter::services::llm::create_llm;
use moviewriter::services::panel;
use moviewriter::services::workflow::cancel_pair;

#[tokio::main]
async fn main() -> Result<()> {
    // .env may set RUST_LOG.
    let dotenv = dotenvy::dotenv();
    env_logger::init();
    if let Err(e) = dotenv {
        if !e.not_found() {
            warn!("Ignoring unreadable .env file: {}", e);
        }
    }

    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {:#}", e);
            eprintln!("Please ensure 'config.yml' exists with valid LLM and image settings.");
            return Err(e);
        }
    };
    config.validate()?;
    config.ensure_directories()?;

    let llm = create_llm(&config)?;
    let service = Arc::new(AgentService::new(llm, config.llm.max_tool_rounds));
    let fetcher = create_image_fetcher(&config)?;

    let (cancel_handle, cancel) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Stopping after Ctrl-C...");
            cancel_handle.cancel();
        }
    });

    panel::run(&config, service, fetcher, &cancel).await
}
