use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::protocol::http::HttpClient;
use crate::session::SessionHandle;

pub mod context;
pub mod retry;
pub mod state;

pub use context::{InitLatch, SendingContext};
pub use state::SendState;

/// Owner of the background sender task.
///
/// `start` spawns the state machine, `shutdown` cancels it and waits for
/// the final session flush to finish.
pub struct BeaconSender<H: HttpClient> {
    context: Arc<SendingContext<H>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<H: HttpClient> BeaconSender<H> {
    pub fn new(context: Arc<SendingContext<H>>) -> Self {
        Self {
            context,
            handle: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &Arc<SendingContext<H>> {
        &self.context
    }

    /// Creates a session managed by this sender.
    pub fn create_session(&self) -> Arc<SessionHandle> {
        self.context.create_session()
    }

    /// Spawns the sender task. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut guard = self.handle.lock();
        if guard.is_some() {
            warn!("beacon sender already started");
            return;
        }

        let ctx = Arc::clone(&self.context);
        *guard = Some(tokio::spawn(async move {
            state::run(&ctx).await;
        }));
        info!("beacon sender started");
    }

    /// Waits until the initial server handshake finished; the result tells
    /// whether it succeeded.
    pub async fn wait_for_init(&self) -> bool {
        self.context.init_latch().wait().await
    }

    /// Bounded variant of [`Self::wait_for_init`]; `None` on timeout.
    pub async fn wait_for_init_timeout(&self, timeout: Duration) -> Option<bool> {
        self.context.init_latch().wait_timeout(timeout).await
    }

    /// Requests shutdown and waits for the sender task to flush and stop.
    pub async fn shutdown(&self) {
        self.context.request_shutdown();

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "sender task join failed");
            }
        }
        info!("beacon sender stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::protocol::testutil::{FakeHttpClient, FakePrng, FakeThreadIdProvider, FakeTiming};
    use crate::providers::TimingProvider;

    fn test_sender(http: FakeHttpClient) -> BeaconSender<FakeHttpClient> {
        let mut cfg = Config::default();
        cfg.http.endpoint = "https://collector.example.com/mbeacon".to_string();
        cfg.http.application_id = "app".to_string();
        cfg.device.device_id = 42;

        let ctx = SendingContext::with_providers(
            cfg,
            http,
            Arc::new(FakeTiming::new(1_000_000)) as Arc<dyn TimingProvider>,
            Arc::new(FakeThreadIdProvider::new(9)),
            Box::new(FakePrng::new(5)),
        );
        BeaconSender::new(Arc::new(ctx))
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_init_shutdown_cycle() {
        let sender = test_sender(FakeHttpClient::always_ok());
        sender.start();

        assert_eq!(sender.wait_for_init().await, true);

        let session = sender.create_session();
        session.end();

        sender.shutdown().await;
        assert!(sender.context().all_sessions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_before_init_completes_latch_negatively() {
        let sender = test_sender(FakeHttpClient::new(None));
        sender.start();
        sender.shutdown().await;

        assert_eq!(
            sender.wait_for_init_timeout(Duration::from_secs(1)).await,
            Some(false)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_is_noop() {
        let sender = test_sender(FakeHttpClient::always_ok());
        sender.start();
        sender.start();
        sender.shutdown().await;
    }
}
