use std::fmt;

use tracing::debug;

use crate::protocol::http::HttpClient;
use crate::protocol::status::{self, StatusResponse};
use crate::providers::SleepOutcome;
use crate::send::context::SendingContext;
use crate::send::retry::send_with_retry;

/// Re-initialization delay ladder after a failed handshake.
pub const REINIT_DELAYS_MS: [i64; 5] = [
    60 * 1000,
    5 * 60 * 1000,
    15 * 60 * 1000,
    60 * 60 * 1000,
    2 * 60 * 60 * 1000,
];

/// Cadence of status checks while capture is off.
pub const STATUS_CHECK_INTERVAL_MS: i64 = 2 * 60 * 60 * 1000;

/// Retry ceiling for a single status request.
pub const STATUS_REQUEST_RETRIES: u32 = 5;

/// Base backoff for status request retries.
pub const INITIAL_RETRY_SLEEP_MS: i64 = 1000;

/// Pause between capture-on work cycles.
pub const CAPTURE_ON_CYCLE_MS: i64 = 1000;

/// States of the sending lifecycle.
///
/// Each tick executes one state and yields the successor; a pending
/// shutdown overrides the successor with the state's shutdown target, so
/// the machine always funnels through `FlushSessions` once capturing has
/// begun and directly to `Terminal` when it never did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Init { reinit_index: usize },
    CaptureOn,
    CaptureOff { sleep_ms: Option<i64> },
    FlushSessions,
    Terminal,
}

impl fmt::Display for SendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendState::Init { .. } => write!(f, "init"),
            SendState::CaptureOn => write!(f, "capture_on"),
            SendState::CaptureOff { .. } => write!(f, "capture_off"),
            SendState::FlushSessions => write!(f, "flush_sessions"),
            SendState::Terminal => write!(f, "terminal"),
        }
    }
}

impl SendState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SendState::Terminal)
    }

    /// Where a pending shutdown sends this state.
    fn shutdown_target(&self) -> SendState {
        match self {
            // Never initialized, nothing to flush.
            SendState::Init { .. } => SendState::Terminal,
            SendState::CaptureOn | SendState::CaptureOff { .. } => SendState::FlushSessions,
            SendState::FlushSessions | SendState::Terminal => SendState::Terminal,
        }
    }

    /// Executes one tick and returns the next state.
    pub async fn execute<H: HttpClient>(self, ctx: &SendingContext<H>) -> SendState {
        let shutdown_target = self.shutdown_target();

        let next = match self {
            SendState::Init { reinit_index } => execute_init(ctx, reinit_index).await,
            SendState::CaptureOn => execute_capture_on(ctx).await,
            SendState::CaptureOff { sleep_ms } => execute_capture_off(ctx, sleep_ms).await,
            SendState::FlushSessions => execute_flush_sessions(ctx).await,
            SendState::Terminal => SendState::Terminal,
        };

        if ctx.is_shutdown_requested() {
            shutdown_target
        } else {
            next
        }
    }
}

async fn send_status_with_retry<H: HttpClient>(
    ctx: &SendingContext<H>,
) -> Option<StatusResponse> {
    let server_id = ctx.policy().attributes().server_id;
    send_with_retry(
        ctx.suspender(),
        || ctx.http().send_status_request(server_id),
        STATUS_REQUEST_RETRIES,
        INITIAL_RETRY_SLEEP_MS,
    )
    .await
}

/// Initial handshake: keeps requesting status until one succeeds, sleeping
/// the re-init ladder between rounds. The ladder index only climbs.
async fn execute_init<H: HttpClient>(
    ctx: &SendingContext<H>,
    mut reinit_index: usize,
) -> SendState {
    let mut response;

    loop {
        let now = ctx.timing().now_millis();
        ctx.set_last_open_session_send_time(now);
        ctx.set_last_status_check_time(now);

        response = send_status_with_retry(ctx).await;
        if ctx.is_shutdown_requested() || status::is_successful(&response) {
            break;
        }

        let sleep_ms = if status::is_too_many_requests(&response) {
            ctx.disable_capture_and_clear();
            response
                .as_ref()
                .map(|r| r.retry_after_millis())
                .unwrap_or(REINIT_DELAYS_MS[reinit_index])
        } else {
            REINIT_DELAYS_MS[reinit_index]
        };

        debug!(sleep_ms, "initial handshake failed, backing off");
        if ctx.suspender().sleep_millis(sleep_ms).await == SleepOutcome::Interrupted {
            break;
        }
        reinit_index = (reinit_index + 1).min(REINIT_DELAYS_MS.len() - 1);
    }

    if ctx.is_shutdown_requested() {
        ctx.init_latch().complete(false);
        return SendState::Terminal;
    }

    if let Some(r) = &response {
        ctx.handle_status_response(r);
    }
    ctx.init_latch().complete(true);

    if ctx.policy().is_capture_on() {
        SendState::CaptureOn
    } else {
        SendState::CaptureOff { sleep_ms: None }
    }
}

/// Capture disabled: discard data, wait out the status-check cadence (or an
/// explicit retry-after), then probe the server again.
async fn execute_capture_off<H: HttpClient>(
    ctx: &SendingContext<H>,
    sleep_ms: Option<i64>,
) -> SendState {
    ctx.disable_capture_and_clear();

    let current_time = ctx.timing().now_millis();
    let delta_ms = match sleep_ms {
        Some(ms) if ms > 0 => ms,
        _ => STATUS_CHECK_INTERVAL_MS - (current_time - ctx.last_status_check_time()),
    };

    if delta_ms > 0
        && ctx.suspender().sleep_millis(delta_ms).await == SleepOutcome::Interrupted
    {
        // Shutdown pending; the caller routes to the session flush.
        return SendState::CaptureOff { sleep_ms: None };
    }

    let response = send_status_with_retry(ctx).await;
    if let Some(r) = &response {
        ctx.handle_status_response(r);
    }

    let next = if status::is_too_many_requests(&response) {
        SendState::CaptureOff {
            sleep_ms: response.as_ref().map(|r| r.retry_after_millis()),
        }
    } else if status::is_successful(&response) && ctx.policy().is_capture_on() {
        SendState::CaptureOn
    } else {
        SendState::CaptureOff { sleep_ms: None }
    };

    // The cadence is measured from when this check started, not from when
    // the sleep ended.
    ctx.set_last_status_check_time(current_time);

    next
}

/// Capture enabled: one work cycle of configuring new sessions, draining
/// finished ones, and sending open ones on the server interval.
async fn execute_capture_on<H: HttpClient>(ctx: &SendingContext<H>) -> SendState {
    if ctx.suspender().sleep_millis(CAPTURE_ON_CYCLE_MS).await == SleepOutcome::Interrupted {
        return SendState::CaptureOn;
    }

    configure_new_sessions(ctx);

    let finished_response = send_finished_sessions(ctx).await;
    if status::is_too_many_requests(&finished_response) {
        return capture_off_for_retry_after(&finished_response);
    }

    let open_response = send_open_sessions_if_due(ctx).await;
    if status::is_too_many_requests(&open_response) {
        return capture_off_for_retry_after(&open_response);
    }

    let last_response = open_response.or(finished_response);
    if let Some(r) = &last_response {
        ctx.handle_status_response(r);
        if !ctx.policy().is_capture_on() {
            debug!("server turned capture off");
            return SendState::CaptureOff { sleep_ms: None };
        }
    }

    SendState::CaptureOn
}

fn capture_off_for_retry_after(response: &Option<StatusResponse>) -> SendState {
    SendState::CaptureOff {
        sleep_ms: response.as_ref().map(|r| r.retry_after_millis()),
    }
}

fn configure_new_sessions<H: HttpClient>(ctx: &SendingContext<H>) {
    let new_sessions = ctx.new_sessions();
    if new_sessions.is_empty() {
        return;
    }

    let attrs = ctx.policy().attributes();
    let capture = ctx.policy().is_capture_on();
    for session in new_sessions {
        session.configure(&attrs, capture);
    }
}

async fn send_finished_sessions<H: HttpClient>(
    ctx: &SendingContext<H>,
) -> Option<StatusResponse> {
    let mut last_response = None;

    for session in ctx.finished_configured_sessions() {
        let response = session.beacon().send(ctx.http()).await;
        if status::is_too_many_requests(&response) {
            // Leave the session in place; the data was restored by the
            // failed send and a later cycle picks it up again.
            return response;
        }

        if session.is_data_empty() {
            session.clear_captured_data();
            ctx.remove_session(&session);
        }
        if response.is_some() {
            last_response = response;
        }
    }

    last_response
}

async fn send_open_sessions_if_due<H: HttpClient>(
    ctx: &SendingContext<H>,
) -> Option<StatusResponse> {
    let now = ctx.timing().now_millis();
    let send_interval = ctx.policy().attributes().send_interval_ms;
    if now <= ctx.last_open_session_send_time() + send_interval {
        return None;
    }

    let mut last_response = None;
    for session in ctx.open_configured_sessions() {
        let response = session.beacon().send(ctx.http()).await;
        if status::is_too_many_requests(&response) {
            return response;
        }
        if response.is_some() {
            last_response = response;
        }
    }

    ctx.set_last_open_session_send_time(now);
    last_response
}

/// Final drain on shutdown: end every remaining session and force-send all
/// configured data, ignoring the send interval. New sessions are dropped
/// without being configured.
async fn execute_flush_sessions<H: HttpClient>(ctx: &SendingContext<H>) -> SendState {
    for session in ctx.all_sessions() {
        if !session.is_finished() {
            session.end();
        }
    }

    let mut backpressured = false;
    for session in ctx.finished_configured_sessions() {
        if !backpressured {
            let response = session.beacon().send(ctx.http()).await;
            if status::is_too_many_requests(&response) {
                debug!("flush hit server backpressure, discarding remaining data");
                backpressured = true;
            }
        }
        session.clear_captured_data();
        ctx.remove_session(&session);
    }

    for session in ctx.all_sessions() {
        session.clear_captured_data();
        ctx.remove_session(&session);
    }

    SendState::Terminal
}

/// Drives the state machine until it reaches the terminal state.
pub async fn run<H: HttpClient>(ctx: &SendingContext<H>) {
    let mut state = SendState::Init { reinit_index: 0 };

    while !state.is_terminal() {
        let next = state.execute(ctx).await;
        if next != state {
            debug!(from = %state, to = %next, "sender state transition");
        }
        state = next;
    }

    // In case the machine never got past initialization.
    ctx.init_latch().complete(false);
    debug!("sender finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::Config;
    use crate::protocol::testutil::{FakeHttpClient, FakePrng, FakeThreadIdProvider, FakeTiming};
    use crate::providers::TimingProvider;

    fn test_context(http: FakeHttpClient) -> (SendingContext<FakeHttpClient>, Arc<FakeTiming>) {
        let mut cfg = Config::default();
        cfg.http.endpoint = "https://collector.example.com/mbeacon".to_string();
        cfg.http.application_id = "app".to_string();
        cfg.device.device_id = 42;

        let timing = Arc::new(FakeTiming::new(1_000_000));
        let ctx = SendingContext::with_providers(
            cfg,
            http,
            Arc::clone(&timing) as Arc<dyn TimingProvider>,
            Arc::new(FakeThreadIdProvider::new(9)),
            Box::new(FakePrng::new(5)),
        );
        (ctx, timing)
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_success_routes_to_capture_on() {
        let (ctx, _) = test_context(FakeHttpClient::always_ok());

        let next = SendState::Init { reinit_index: 0 }.execute(&ctx).await;

        assert_eq!(next, SendState::CaptureOn);
        assert!(ctx.init_latch().was_successful());
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_success_with_capture_off_routes_to_capture_off() {
        let (ctx, _) = test_context(FakeHttpClient::new(Some(StatusResponse::parse(
            200, "cp=0",
        ))));

        let next = SendState::Init { reinit_index: 0 }.execute(&ctx).await;

        assert_eq!(next, SendState::CaptureOff { sleep_ms: None });
        assert!(ctx.init_latch().was_successful());
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_shutdown_goes_terminal_without_flush() {
        let (ctx, _) = test_context(FakeHttpClient::new(None));
        ctx.request_shutdown();

        let next = SendState::Init { reinit_index: 0 }.execute(&ctx).await;

        assert_eq!(next, SendState::Terminal);
        assert!(ctx.init_latch().is_completed());
        assert!(!ctx.init_latch().was_successful());
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_ladder_gaps_between_rounds() {
        let http = FakeHttpClient::new(Some(StatusResponse::parse(503, "")));
        let (ctx, _) = test_context(http);
        let ctx = Arc::new(ctx);

        let driver = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move { SendState::Init { reinit_index: 0 }.execute(&ctx).await })
        };

        // Each round makes 6 attempts separated by 1s+2s+4s+8s+16s of
        // backoff, then sleeps the ladder delay. Let seven rounds pass so
        // the clamp at 2h shows, then shut down.
        let per_round_backoff = Duration::from_secs(31);
        let ladder = [60u64, 300, 900, 3600, 7200, 7200, 7200];
        let mut total = Duration::ZERO;
        for delay in ladder {
            total += per_round_backoff + Duration::from_secs(delay);
        }
        tokio::time::sleep(total + Duration::from_secs(1)).await;

        ctx.request_shutdown();
        let next = driver.await.expect("task join");
        assert_eq!(next, SendState::Terminal);

        let times = ctx.http().status_request_times();
        // At least seven full rounds of six attempts each have run.
        assert!(times.len() >= 7 * 6);

        // Gap between the end of one round and the start of the next is
        // the ladder delay, clamped at 2h from the fifth round on.
        let expected_gaps = [60u64, 300, 900, 3600, 7200, 7200];
        for (i, expected) in expected_gaps.iter().enumerate() {
            let round_end = times[i * 6 + 5];
            let next_round_start = times[(i + 1) * 6];
            let gap = next_round_start - round_end;
            assert_eq!(gap, Duration::from_secs(*expected), "round {i}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_429_disables_capture_and_clears() {
        let http = FakeHttpClient::with_status_responses(vec![Some(StatusResponse {
            retry_after_ms: Some(30_000),
            ..StatusResponse::parse(429, "")
        })]);
        let (ctx, _) = test_context(http);
        let ctx = Arc::new(ctx);

        let session = ctx.create_session();
        assert!(!session.is_data_empty());

        let driver = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move { SendState::Init { reinit_index: 0 }.execute(&ctx).await })
        };

        // The 429 round sleeps exactly the retry-after, then the default
        // response succeeds.
        let next = driver.await.expect("task join");
        assert_eq!(next, SendState::CaptureOn);
        assert!(session.is_data_empty());
        assert_eq!(ctx.http().status_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_off_default_cadence() {
        let (ctx, timing) = test_context(FakeHttpClient::new(Some(StatusResponse::parse(
            200, "cp=0",
        ))));
        let ctx = Arc::new(ctx);

        let check_start = timing.now_millis();
        ctx.set_last_status_check_time(check_start - 1_000);

        let driver = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move {
                SendState::CaptureOff { sleep_ms: None }.execute(&ctx).await
            })
        };

        let next = driver.await.expect("task join");
        assert_eq!(next, SendState::CaptureOff { sleep_ms: None });
        // Cadence timestamp reflects the pre-sleep time of this check.
        assert_eq!(ctx.last_status_check_time(), check_start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_off_429_backpressure() {
        let http = FakeHttpClient::with_status_responses(vec![Some(StatusResponse {
            retry_after_ms: Some(30_000),
            ..StatusResponse::parse(429, "")
        })]);
        let (ctx, _) = test_context(http);
        let ctx = Arc::new(ctx);

        // Cache data not owned by any session survives the clears.
        ctx.cache().add_event_data(999, 1, "unmanaged".to_string());

        ctx.set_last_status_check_time(ctx.timing().now_millis());
        let driver = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move {
                SendState::CaptureOff { sleep_ms: None }.execute(&ctx).await
            })
        };

        let next = driver.await.expect("task join");
        assert_eq!(
            next,
            SendState::CaptureOff {
                sleep_ms: Some(30_000)
            }
        );
        assert!(!ctx.cache().is_empty(999));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_off_recovers_when_capture_turned_on() {
        let (ctx, _) = test_context(FakeHttpClient::always_ok());
        let ctx = Arc::new(ctx);
        ctx.set_last_status_check_time(ctx.timing().now_millis());

        let driver = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move {
                SendState::CaptureOff { sleep_ms: Some(5_000) }.execute(&ctx).await
            })
        };

        let next = driver.await.expect("task join");
        assert_eq!(next, SendState::CaptureOn);
        assert!(ctx.policy().is_capture_on());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_on_configures_new_sessions_and_drains_finished() {
        let (ctx, _) = test_context(FakeHttpClient::always_ok());
        let ctx = Arc::new(ctx);

        let open = ctx.create_session();
        let finished = ctx.create_session();
        finished.configure(&ctx.policy().attributes(), true);
        finished.end();

        let next = SendState::CaptureOn.execute(&ctx).await;

        assert_eq!(next, SendState::CaptureOn);
        assert!(open.is_configured());
        // Drained finished session left the registry.
        assert_eq!(ctx.all_sessions().len(), 1);
        assert!(!ctx.http().beacon_payloads().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_on_sends_open_sessions_only_when_due() {
        let (ctx, timing) = test_context(FakeHttpClient::always_ok());
        let ctx = Arc::new(ctx);

        let session = ctx.create_session();
        session.configure(&ctx.policy().attributes(), true);
        ctx.set_last_open_session_send_time(timing.now_millis());

        SendState::CaptureOn.execute(&ctx).await;
        assert!(ctx.http().beacon_payloads().is_empty());

        // Past the send interval the open session goes out.
        timing.advance(ctx.policy().attributes().send_interval_ms + 1);
        SendState::CaptureOn.execute(&ctx).await;
        assert!(!ctx.http().beacon_payloads().is_empty());
        assert!(!session.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_on_server_revokes_capture() {
        let http = FakeHttpClient::new(Some(StatusResponse::parse(200, "cp=0")));
        let (ctx, _) = test_context(http);
        let ctx = Arc::new(ctx);

        let finished = ctx.create_session();
        finished.configure(&ctx.policy().attributes(), true);
        finished.end();

        let next = SendState::CaptureOn.execute(&ctx).await;
        assert_eq!(next, SendState::CaptureOff { sleep_ms: None });
        assert!(!ctx.policy().is_capture_on());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_on_429_routes_to_capture_off() {
        let http = FakeHttpClient::with_beacon_responses(vec![Some(StatusResponse {
            retry_after_ms: Some(12_000),
            ..StatusResponse::parse(429, "")
        })]);
        let (ctx, _) = test_context(http);
        let ctx = Arc::new(ctx);

        let finished = ctx.create_session();
        finished.configure(&ctx.policy().attributes(), true);
        finished.end();

        let next = SendState::CaptureOn.execute(&ctx).await;
        assert_eq!(
            next,
            SendState::CaptureOff {
                sleep_ms: Some(12_000)
            }
        );
        // The backpressured session keeps its data for a later cycle.
        assert_eq!(ctx.all_sessions().len(), 1);
        assert!(!finished.is_data_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_ends_and_drains_everything() {
        let (ctx, _) = test_context(FakeHttpClient::always_ok());
        let ctx = Arc::new(ctx);

        let open = ctx.create_session();
        open.configure(&ctx.policy().attributes(), true);
        let unconfigured = ctx.create_session();

        let next = SendState::FlushSessions.execute(&ctx).await;

        assert_eq!(next, SendState::Terminal);
        assert!(ctx.all_sessions().is_empty());
        assert!(open.is_finished());
        assert!(open.is_data_empty());
        assert!(unconfigured.is_data_empty());
        // The configured session was sent; the unconfigured one never was.
        assert!(!ctx.http().beacon_payloads().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cold_shutdown_runs_init_to_terminal() {
        let (ctx, _) = test_context(FakeHttpClient::new(None));
        let ctx = Arc::new(ctx);
        ctx.request_shutdown();

        run(&ctx).await;

        assert!(ctx.init_latch().is_completed());
        assert!(!ctx.init_latch().was_successful());
        assert!(ctx.all_sessions().is_empty());
    }
}
