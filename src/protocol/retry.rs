//! Timer-driven connect retry.
//!
//! Dialing happens on a short-lived worker thread so the owner's loop
//! never blocks on a slow peer. The terminal outcome, success,
//! exhaustion or cancellation, is reported through the single
//! `on_connected` callback exactly once; the callback is consumed by
//! the first report by construction.

use crate::config::ConnectRetryConfig;
use crate::protocol::integrated::{IntegratedProtocol, ProtoShared};
use crate::protocol::ConnectedFn;
use crate::transport::Transport;
use crate::utils::uri::Uri;
use crate::utils::CancelToken;
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

pub(crate) fn spawn_connect(
    transport: Arc<dyn Transport>,
    uri: Uri,
    retry: ConnectRetryConfig,
    cancel: CancelToken,
    shared: Arc<ProtoShared>,
    reader_cancel: CancelToken,
    on_connected: ConnectedFn,
) {
    let name = format!("connect-{}", uri.authority());
    let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
        let attempts = retry.max_attempts();
        let interval = retry.interval();

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                debug!("[Connect] cancelled while dialing {uri}");
                on_connected(false);
                return;
            }

            match transport.connect(&uri) {
                Ok(pair) => {
                    debug!("[Connect] established to {uri} on attempt {attempt}");
                    IntegratedProtocol::install_stream(&shared, pair, reader_cancel);
                    on_connected(true);
                    return;
                }
                Err(e) => {
                    debug!("[Connect] attempt {attempt}/{attempts} to {uri} failed: {e}");
                }
            }

            if attempt < attempts && !cancel.sleep_cancellable(interval) {
                debug!("[Connect] cancelled while waiting to redial {uri}");
                on_connected(false);
                return;
            }
        }

        warn!("[Connect] giving up on {uri} after {attempts} attempts");
        on_connected(false);
    });
    if spawned.is_err() {
        warn!("[Connect] failed to spawn worker thread {name}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectRetryConfig;
    use crate::protocol::{MsgSink, Protocol, ProtocolRole};
    use crate::runloop::RunLoop;
    use crate::transport::memory::{MemoryHub, MemoryTransport};
    use crossbeam::channel as cbchan;
    use std::time::{Duration, Instant};

    // The sink needs a live app loop type; tests that exercise retry
    // against real sinks live in the scenario suite. Here the loop is
    // a throwaway app-shaped state.
    #[test]
    fn exhaustion_reports_false_exactly_once() {
        let hub = MemoryHub::new();
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new(hub));
        let uri = Uri::parse("mem://nobody:1/").unwrap();

        let cancel = CancelToken::new_root();
        let rl = RunLoop::spawn("retry-test-app", None, |handle| {
            crate::app::App::for_tests(handle)
        })
        .unwrap();
        let sink = MsgSink::App(rl.clone_handle());
        let mut protocol = IntegratedProtocol::connecting(ProtocolRole::OutInternal, sink, &cancel);

        let retry = ConnectRetryConfig {
            max_retries: Some(3),
            interval_ms: Some(30),
        };
        let (tx, rx) = cbchan::unbounded::<bool>();
        let started = Instant::now();
        protocol
            .connect_to(
                transport,
                &uri,
                &retry,
                &cancel,
                Box::new(move |ok| {
                    let _ = tx.send(ok);
                }),
            )
            .unwrap();

        let outcome = rx.recv_timeout(Duration::from_secs(2)).expect("callback");
        assert!(!outcome);
        // Two waits between three attempts.
        assert!(started.elapsed() >= Duration::from_millis(60));
        // Exactly once: nothing else may arrive.
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        rl.stop_and_join();
    }
}
