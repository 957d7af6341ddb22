use std::{fmt, sync::Arc, time::Duration};

use shared::config::server::Config;

use crate::{
    broker::BrokerHandles,
    http::error::{ApiError, AppResult},
    services::{ChatService, EventPublisher, FanoutHub, QueryService, SharedFanoutHub},
    store::SharedStore,
};

/// Application state shared across all routes. Which services exist depends
/// on the process role: writers hold the command side, readers the query side
/// and the fan-out hub.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: SharedStore,
    pub commands: Option<ChatService>,
    pub queries: Option<QueryService>,
    pub hub: Option<SharedFanoutHub>,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("role", &self.config.server.role)
            .field("store", &self.store.backend_name())
            .field("commands", &self.commands.is_some())
            .field("queries", &self.queries.is_some())
            .field("hub", &self.hub.is_some())
            .finish()
    }
}

impl AppState {
    /// Wires services for the configured role from the store and whichever
    /// broker handles were opened.
    pub fn new(config: Arc<Config>, store: SharedStore, broker: BrokerHandles) -> Self {
        let role = config.server.role;

        let commands = broker
            .publisher
            .filter(|_| role.serves_commands())
            .map(|publisher| {
                let publisher = EventPublisher::new(publisher, config.server.instance_id.clone());
                ChatService::new(Arc::clone(&store), publisher)
                    .with_limits(config.limits.clone())
            });
        let queries = role
            .serves_queries()
            .then(|| QueryService::new(Arc::clone(&store)));
        let hub = broker
            .subscriber
            .filter(|_| role.serves_queries())
            .map(|subscriber| {
                FanoutHub::new(
                    subscriber,
                    config.stream.clone(),
                    Duration::from_millis(config.broker.resubscribe_backoff_ms),
                )
            });

        Self {
            config,
            store,
            commands,
            queries,
            hub,
        }
    }

    pub fn commands(&self) -> AppResult<&ChatService> {
        self.commands
            .as_ref()
            .ok_or_else(|| role_unavailable("commands"))
    }

    pub fn queries(&self) -> AppResult<&QueryService> {
        self.queries
            .as_ref()
            .ok_or_else(|| role_unavailable("queries"))
    }

    pub fn hub(&self) -> AppResult<&SharedFanoutHub> {
        self.hub.as_ref().ok_or_else(|| role_unavailable("streaming"))
    }
}

fn role_unavailable(what: &str) -> ApiError {
    ApiError::unavailable(
        "role_unavailable",
        format!("this instance does not serve {what}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{broker, store::memory::MemoryChatStore};
    use axum::http::StatusCode;
    use shared::config::server::{Profile, ServiceRole};

    async fn state_for(role: ServiceRole) -> AppState {
        let mut config = Config::default_for_profile(Profile::Test);
        config.server.role = role;
        let handles = broker::connect(&config).await.unwrap();
        AppState::new(Arc::new(config), Arc::new(MemoryChatStore::new()), handles)
    }

    #[tokio::test]
    async fn writer_serves_commands_only() {
        let state = state_for(ServiceRole::Writer).await;
        assert!(state.commands().is_ok());
        let err = state.queries().unwrap_err();
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code(), "role_unavailable");
        assert!(state.hub().is_err());
    }

    #[tokio::test]
    async fn reader_serves_queries_and_streaming() {
        let state = state_for(ServiceRole::Reader).await;
        assert!(state.commands().is_err());
        assert!(state.queries().is_ok());
        assert!(state.hub().is_ok());
    }
}
