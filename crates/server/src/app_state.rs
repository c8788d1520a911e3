use std::sync::Arc;

use server_api::ApiContext;

use crate::{registry::ConnectionRegistry, router::MessageRouter};

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) router: MessageRouter,
    pub(crate) jwt_secret: Arc<str>,
    pub(crate) max_upload_bytes: usize,
    pub(crate) outbound_queue: usize,
}

impl AppState {
    pub(crate) fn new(
        api: ApiContext,
        jwt_secret: impl Into<Arc<str>>,
        max_upload_bytes: usize,
        outbound_queue: usize,
    ) -> Self {
        let registry = ConnectionRegistry::new();
        let router = MessageRouter::new(api.clone(), registry.clone());
        Self {
            api,
            registry,
            router,
            jwt_secret: jwt_secret.into(),
            max_upload_bytes,
            outbound_queue,
        }
    }
}
