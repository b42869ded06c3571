use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use env_logger::Env;

use interview_server::auth::{HttpTokenVerifier, TokenVerifier};
use interview_server::directory::{HttpSessionDirectory, OpenDirectory, SessionDirectory};
use interview_server::document::{DocumentBridge, DocumentStore, SqliteDocumentStore};
use interview_server::executor::{ExecutionDispatcher, HttpExecutor};
use interview_server::handlers::root;
use interview_server::server::spawn_server;
use interview_server::settings::Settings;

async fn open_store(settings: &Settings) -> Option<Arc<dyn DocumentStore>> {
    let url = settings.database_url.as_deref()?;
    match SqliteDocumentStore::connect(url).await {
        Ok(store) => {
            log::info!("Persisting documents to {}", url);
            Some(Arc::new(store))
        }
        Err(e) => {
            log::warn!("Document store unreachable ({}), documents live in memory only", e);
            None
        }
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let settings = Settings::load().context("loading configuration")?;

    let bridge = DocumentBridge::new(open_store(&settings).await, settings.compaction_threshold);
    let dispatcher = ExecutionDispatcher::new(
        Arc::new(HttpExecutor::new(&settings.executor_url)),
        settings.executor_timeout(),
    );
    let directory: Arc<dyn SessionDirectory> = match &settings.session_directory_url {
        Some(url) => Arc::new(HttpSessionDirectory::new(url)),
        None => Arc::new(OpenDirectory),
    };
    let verifier: Arc<dyn TokenVerifier> =
        Arc::new(HttpTokenVerifier::new(settings.auth_verify_url.clone()));

    let srv_tx = spawn_server(directory, dispatcher);

    let app_bridge = bridge.clone();
    log::info!("Listening on {}", settings.bind_addr);
    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(srv_tx.clone()))
            .app_data(web::Data::new(app_bridge.clone()))
            .app_data(web::Data::from(verifier.clone()))
            .configure(root)
    })
    .bind(&settings.bind_addr)
    .with_context(|| format!("binding {}", settings.bind_addr))?
    .run()
    .await
    .context("running http server")?;

    log::info!("Flushing open documents");
    bridge.flush_all().await;
    Ok(())
}
