use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::client::{DedupClient, UpstreamError, UpstreamRequest, UpstreamResponse};
use crate::guard::SignatureGuard;

/// Forwards a write upstream; wrapped by the submission guard
pub type SubmitFn = Box<
    dyn Fn(UpstreamRequest) -> BoxFuture<'static, Result<UpstreamResponse, UpstreamError>>
        + Send
        + Sync,
>;

/// Shared application state
pub struct AppState {
    pub client: Arc<DedupClient>,
    /// Drops repeated identical writes while one is running or cooling down
    pub submit_guard: SignatureGuard<SubmitFn>,
    pub submit_cooldown: Duration,
}

impl AppState {
    pub fn new(client: DedupClient, submit_cooldown: Duration) -> Self {
        let client = Arc::new(client);

        let forward = Arc::clone(&client);
        let submit: SubmitFn = Box::new(move |request| {
            let client = Arc::clone(&forward);
            async move { client.send(request).await }.boxed()
        });

        Self {
            client,
            submit_guard: SignatureGuard::new(submit, submit_cooldown),
            submit_cooldown,
        }
    }
}
