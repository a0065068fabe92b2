pub mod appresult;
pub mod config;
pub mod connection;
pub mod db;
pub mod error;
pub mod export;
pub mod identity;
pub mod logging;
pub mod polls;
pub mod presence;
pub mod rooms;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{Router, debug_handler, extract::FromRef, routing::get};
use serde_json::Value;
use tokio::task::JoinHandle;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use appresult::{AppError, AppResult};

use config::Config;
use connection::ConnectionManager;
use db::{Journal, Restored};
use error::{CoreError, CoreResult};
use export::ExportService;
use polls::PollEngine;
use presence::PresenceRegistry;
use rooms::MessageBroker;

#[derive(Clone, FromRef)]
pub struct AppState {
    pub manager: Arc<ConnectionManager>,
    pub presence: Arc<PresenceRegistry>,
    pub broker: Arc<MessageBroker>,
    pub polls: Arc<PollEngine>,
    pub exports: Arc<ExportService>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config, journal: Journal) -> Self {
        let config = Arc::new(config);
        let presence = Arc::new(PresenceRegistry::new());
        let broker = Arc::new(MessageBroker::new(config.max_message_len));
        let polls = Arc::new(PollEngine::new());
        let exports = Arc::new(ExportService::new(
            Arc::clone(&presence),
            Arc::clone(&broker),
            Arc::clone(&polls),
        ));
        let manager = Arc::new(ConnectionManager::new(
            Arc::clone(&config),
            Arc::clone(&presence),
            Arc::clone(&broker),
            Arc::clone(&polls),
            journal,
        ));
        Self {
            manager,
            presence,
            broker,
            polls,
            exports,
            config,
        }
    }

    /// Seed the stores from a journal snapshot. Call before serving.
    pub fn restore(&self, restored: Restored) {
        self.presence.restore(restored.identities);
        self.broker.restore(restored.messages);
        self.polls.restore(restored.polls);
    }
}

pub trait GetField {
    fn get_str_field(&self, field: &str) -> CoreResult<String>;
}

impl GetField for Value {
    fn get_str_field(&self, field: &str) -> CoreResult<String> {
        Ok(self
            .get(field)
            .ok_or_else(|| CoreError::invalid(format!("expected {field} in {self}")))?
            .as_str()
            .ok_or_else(|| CoreError::invalid(format!("expected {field} in {self} to be string")))?
            .to_owned())
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(export::stats))
        .merge(rooms::ws_router())
        .nest("/rooms", rooms::router())
        .nest("/polls", polls::router())
        .nest("/export", export::router())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

#[debug_handler]
async fn health() -> &'static str {
    "ok"
}

/// A running server: the HTTP task plus the liveness reaper.
pub struct Server {
    pub addr: SocketAddr,
    pub state: AppState,
    serve: JoinHandle<std::io::Result<()>>,
    reaper: JoinHandle<()>,
}

impl Server {
    /// Resolves only if the HTTP task stops on its own.
    pub async fn wait(mut self) -> anyhow::Result<()> {
        let result = (&mut self.serve).await;
        self.reaper.abort();
        result.context("server task panicked")??;
        Ok(())
    }

    pub fn shutdown(&self) {
        self.serve.abort();
        self.reaper.abort();
    }
}

pub async fn start(config: Config, journal: Journal) -> anyhow::Result<Server> {
    let restored = journal.load().await.context("failed to load journal")?;
    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(config, journal);
    state.restore(restored);

    let reaper = Arc::clone(&state.manager).start_reaper(state.config.heartbeat_interval);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    let addr = listener.local_addr()?;
    let app = router(state.clone());
    let serve = tokio::spawn(async move { axum::serve(listener, app).await });
    tracing::info!(%addr, "listening");

    Ok(Server {
        addr,
        state,
        serve,
        reaper,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn get_str_field() {
        let value = json!({"event": "poll:list", "n": 1});
        assert_eq!(value.get_str_field("event").unwrap(), "poll:list");
        assert!(value.get_str_field("n").is_err());
        assert!(value.get_str_field("missing").is_err());
    }

    #[test]
    fn restore_seeds_every_store() {
        let source = AppState::new(Config::default(), Journal::disabled());
        let who = identity::Identity::new("ann", "Ann");
        let message = source.broker.send(rooms::GLOBAL_ROOM, &who, "hello").unwrap();

        let state = AppState::new(Config::default(), Journal::disabled());
        state.restore(Restored {
            identities: vec![(who, time::OffsetDateTime::now_utc())],
            messages: vec![(*message).clone()],
            polls: Vec::new(),
        });
        assert_eq!(state.presence.len(), 1);
        assert_eq!(state.broker.message_count(), 1);
        let next = state
            .broker
            .send(rooms::GLOBAL_ROOM, &identity::Identity::new("bob", "Bob"), "hi")
            .unwrap();
        assert_eq!(next.seq, 2);
    }
}
