use std::{sync::Arc, time::Duration};

use futures_util::future::join_all;
use tokio::{
    net::TcpStream,
    sync::{Mutex, Semaphore},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    config::Config,
    domain::{PingResult, ProbeError, ProbeErrorKind, Server},
};

pub const DEFAULT_PROBE_CONCURRENCY: usize = 10;
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeProgress {
    pub done: usize,
    pub total: usize,
}

pub type ProgressFn = dyn Fn(ProbeProgress) + Send + Sync;

/// TCP-connect reachability tester. A probe only opens and closes a connection; no bytes are
/// exchanged with the upstream.
#[derive(Debug, Clone)]
pub struct ReachabilityTester {
    timeout: Duration,
    concurrency: usize,
}

impl ReachabilityTester {
    pub fn new(timeout: Duration, concurrency: usize) -> Self {
        Self {
            timeout,
            concurrency: concurrency.max(1),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.ping_timeout(),
            usize::try_from(config.probe_concurrency).unwrap_or(DEFAULT_PROBE_CONCURRENCY),
        )
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Probes every server, at most `concurrency` dials in flight. The output has one entry per input,
    /// in input order. `progress` fires once per finished probe with a monotonically increasing
    /// `done`, never concurrently with itself. A dial that hangs holds only its own slot until the
    /// timeout; the other slots keep draining the queue.
    ///
    /// Cancelling `cancel` stops pending probes; their entries come back unavailable with
    /// [`ProbeErrorKind::Cancelled`].
    pub async fn test(
        &self,
        servers: &[Server],
        progress: Option<Arc<ProgressFn>>,
        cancel: &CancellationToken,
    ) -> Vec<PingResult> {
        let total = servers.len();
        if total == 0 {
            return Vec::new();
        }

        let sem = Arc::new(Semaphore::new(self.concurrency));
        let done = Arc::new(Mutex::new(0_usize));
        let timeout = self.timeout;

        let mut tasks = Vec::with_capacity(total);
        for server in servers.iter().cloned() {
            let sem = Arc::clone(&sem);
            let done = Arc::clone(&done);
            let progress = progress.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = sem.acquire_owned() => permit.ok(),
                };
                let result = match permit {
                    Some(_permit) => probe_one(server, timeout, &cancel).await,
                    None => cancelled(server),
                };

                // The counter lock also serializes the callback.
                let mut done = done.lock().await;
                *done += 1;
                if let Some(progress) = progress.as_deref() {
                    progress(ProbeProgress { done: *done, total });
                }
                result
            }));
        }

        let results: Vec<PingResult> = join_all(tasks)
            .await
            .into_iter()
            .zip(servers)
            .map(|(joined, server)| {
                joined.unwrap_or_else(|err| {
                    warn!(server_id = %server.id, error = %err, "probe task failed");
                    PingResult::failed(
                        server.clone(),
                        ProbeError::new(ProbeErrorKind::Other, format!("probe task failed: {err}")),
                    )
                })
            })
            .collect();

        let available = results.iter().filter(|r| r.available).count();
        debug!(total, available, "probe run finished");
        results
    }
}

impl Default for ReachabilityTester {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT, DEFAULT_PROBE_CONCURRENCY)
    }
}

fn cancelled(server: Server) -> PingResult {
    PingResult::failed(
        server,
        ProbeError::new(ProbeErrorKind::Cancelled, "probe cancelled"),
    )
}

async fn probe_one(server: Server, timeout: Duration, cancel: &CancellationToken) -> PingResult {
    if cancel.is_cancelled() {
        return cancelled(server);
    }
    let address = server.address.clone();
    let started = Instant::now();
    let connect = tokio::time::timeout(
        timeout,
        TcpStream::connect((address.as_str(), server.port)),
    );

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => return cancelled(server),
        outcome = connect => outcome,
    };

    match outcome {
        Ok(Ok(stream)) => {
            drop(stream);
            let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            debug!(server_id = %server.id, latency_ms, "probe ok");
            PingResult::ok(server, latency_ms)
        }
        Ok(Err(err)) => {
            debug!(server_id = %server.id, %err, "probe failed");
            let error = ProbeError::from_io(&err);
            PingResult::failed(server, error)
        }
        Err(_) => {
            debug!(server_id = %server.id, "probe timed out");
            PingResult::failed(
                server,
                ProbeError::new(
                    ProbeErrorKind::Timeout,
                    format!("connection timed out after {}ms", timeout.as_millis()),
                ),
            )
        }
    }
}

/// Available results first, fastest first with ties broken by case-insensitive name; the
/// unavailable ones follow in their original order.
pub fn sort_by_latency(results: &[PingResult]) -> Vec<PingResult> {
    let mut available: Vec<PingResult> = results.iter().filter(|r| r.available).cloned().collect();
    available.sort_by(|a, b| {
        a.latency_ms
            .cmp(&b.latency_ms)
            .then_with(|| a.server.name.to_lowercase().cmp(&b.server.name.to_lowercase()))
    });
    available.extend(results.iter().filter(|r| !r.available).cloned());
    available
}

/// The `limit` fastest available results; `limit == 0` keeps every available one.
pub fn quickselect(results: &[PingResult], limit: usize) -> Vec<PingResult> {
    let mut fastest: Vec<PingResult> = sort_by_latency(results)
        .into_iter()
        .filter(|r| r.available)
        .collect();
    if limit > 0 {
        fastest.truncate(limit);
    }
    fastest
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;
    use tokio::net::{TcpListener, TcpSocket};

    use super::*;
    use crate::domain::{DEFAULT_SERVER_TAG, PROTOCOL_VLESS, server_id};

    fn server(name: &str, address: &str, port: u16) -> Server {
        Server {
            id: server_id(address, port),
            name: name.to_string(),
            address: address.to_string(),
            port,
            protocol: PROTOCOL_VLESS.to_string(),
            tag: DEFAULT_SERVER_TAG.to_string(),
            vless_url: String::new(),
            settings: None,
            stream_settings: None,
        }
    }

    fn result(name: &str, available: bool, latency_ms: u64) -> PingResult {
        let s = server(name, "10.0.0.1", 443);
        if available {
            PingResult::ok(s, latency_ms)
        } else {
            PingResult::failed(s, ProbeError::new(ProbeErrorKind::Timeout, "timeout"))
        }
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    /// A listener whose accept queue is full: further dials get no SYN-ACK and hang until the
    /// caller gives up. Keep the returned handles alive for as long as the port must stay stuck.
    async fn stuck_listener() -> (TcpListener, Vec<TcpStream>, u16) {
        let socket = TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = socket.listen(1).unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut fillers = Vec::new();
        for _ in 0..16 {
            let dial = TcpStream::connect(("127.0.0.1", port));
            match tokio::time::timeout(Duration::from_millis(200), dial).await {
                Ok(Ok(stream)) => fillers.push(stream),
                Ok(Err(err)) => panic!("filler dial failed: {err}"),
                Err(_) => return (listener, fillers, port),
            }
        }
        panic!("accept queue never filled up");
    }

    #[test]
    fn sort_orders_by_latency_then_name_and_keeps_failures_last() {
        let results = vec![
            result("slow", true, 300),
            result("down-a", false, 0),
            result("beta", true, 50),
            result("Alpha", true, 50),
            result("down-b", false, 0),
        ];
        let names: Vec<String> = sort_by_latency(&results)
            .into_iter()
            .map(|r| r.server.name)
            .collect();
        assert_eq!(names, vec!["Alpha", "beta", "slow", "down-a", "down-b"]);
    }

    #[test]
    fn sort_puts_fast_before_slow_before_down() {
        let results = vec![
            result("Slow", true, 200),
            result("Z", false, 0),
            result("Fast", true, 50),
            result("Medium", true, 100),
        ];
        let names: Vec<String> = sort_by_latency(&results)
            .into_iter()
            .map(|r| r.server.name)
            .collect();
        assert_eq!(names, vec!["Fast", "Medium", "Slow", "Z"]);
        // Input is untouched.
        assert_eq!(results[0].server.name, "Slow");
    }

    #[test]
    fn quickselect_drops_unavailable_and_truncates() {
        let results = vec![
            result("a", true, 300),
            result("b", false, 0),
            result("c", true, 10),
            result("d", true, 200),
        ];
        let top: Vec<String> = quickselect(&results, 2)
            .into_iter()
            .map(|r| r.server.name)
            .collect();
        assert_eq!(top, vec!["c", "d"]);
        assert_eq!(quickselect(&results, 0).len(), 3);
        assert_eq!(quickselect(&results, 10).len(), 3);
    }

    #[tokio::test]
    async fn empty_input_returns_empty_output() {
        let tester = ReachabilityTester::default();
        let out = tester.test(&[], None, &CancellationToken::new()).await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn open_and_closed_ports_are_classified() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let closed = closed_port().await;

        let servers = vec![
            server("closed", "127.0.0.1", closed),
            server("open", "127.0.0.1", open),
        ];
        let tester = ReachabilityTester::new(Duration::from_secs(2), 4);
        let out = tester.test(&servers, None, &CancellationToken::new()).await;

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].server.name, "closed");
        assert!(!out[0].available);
        assert_eq!(out[0].latency_ms, 0);
        assert_eq!(
            out[0].error.as_ref().map(|e| e.kind),
            Some(ProbeErrorKind::Refused)
        );
        assert_eq!(out[1].server.name, "open");
        assert!(out[1].available);
        assert!(out[1].error.is_none());
    }

    #[tokio::test]
    async fn progress_reports_every_probe_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let servers: Vec<Server> = (0..20)
            .map(|i| server(&format!("s{i}"), "127.0.0.1", port))
            .collect();

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let progress: Arc<ProgressFn> = {
            let seen = Arc::clone(&seen);
            Arc::new(move |p: ProbeProgress| seen.lock().unwrap().push(p))
        };

        let tester = ReachabilityTester::new(Duration::from_secs(2), 3);
        let out = tester
            .test(&servers, Some(progress), &CancellationToken::new())
            .await;
        assert_eq!(out.len(), 20);

        let seen = seen.lock().unwrap();
        let done: Vec<usize> = seen.iter().map(|p| p.done).collect();
        assert_eq!(done, (1..=20).collect::<Vec<_>>());
        assert!(seen.iter().all(|p| p.total == 20));
    }

    #[tokio::test]
    async fn single_slot_still_probes_everything() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let servers: Vec<Server> = (0..8)
            .map(|i| server(&format!("s{i}"), "127.0.0.1", port))
            .collect();

        let calls = Arc::new(AtomicUsize::new(0));
        let progress: Arc<ProgressFn> = {
            let calls = Arc::clone(&calls);
            Arc::new(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };

        let tester = ReachabilityTester::new(Duration::from_secs(2), 1);
        assert_eq!(tester.concurrency(), 1);
        let out = tester
            .test(&servers, Some(progress), &CancellationToken::new())
            .await;
        assert!(out.iter().all(|r| r.available));
        assert_eq!(calls.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn cancelled_probes_come_back_unavailable() {
        let servers = vec![
            server("a", "127.0.0.1", closed_port().await),
            server("b", "127.0.0.1", closed_port().await),
        ];
        let cancel = CancellationToken::new();
        cancel.cancel();

        let tester = ReachabilityTester::default();
        let out = tester.test(&servers, None, &cancel).await;
        assert_eq!(out.len(), 2);
        for r in &out {
            assert!(!r.available);
            assert_eq!(r.latency_ms, 0);
            assert_eq!(
                r.error.as_ref().map(|e| e.kind),
                Some(ProbeErrorKind::Cancelled)
            );
        }
    }

    #[test]
    fn zero_concurrency_is_clamped() {
        assert_eq!(
            ReachabilityTester::new(Duration::from_secs(1), 0).concurrency(),
            1
        );
    }

    #[tokio::test]
    async fn hanging_dial_does_not_block_later_servers() {
        let (_stuck, _fillers, stuck_port) = stuck_listener().await;
        let open = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open_port = open.local_addr().unwrap().port();
        let servers = vec![
            server("hang-1", "127.0.0.1", stuck_port),
            server("open-1", "127.0.0.1", open_port),
            server("hang-2", "127.0.0.1", stuck_port),
            server("open-2", "127.0.0.1", open_port),
        ];

        let tester = ReachabilityTester::new(Duration::from_secs(2), 2);
        let started = std::time::Instant::now();
        let out = tester
            .test(&servers, None, &CancellationToken::new())
            .await;
        let elapsed = started.elapsed();

        // Both hanging dials overlap, so the run takes about one timeout, not two.
        assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");
        let names: Vec<&str> = out.iter().map(|r| r.server.name.as_str()).collect();
        assert_eq!(names, vec!["hang-1", "open-1", "hang-2", "open-2"]);
        let available: Vec<bool> = out.iter().map(|r| r.available).collect();
        assert_eq!(available, vec![false, true, false, true]);
        assert_eq!(
            out[0].error.as_ref().map(|e| e.kind),
            Some(ProbeErrorKind::Timeout)
        );
    }

    #[tokio::test]
    async fn in_flight_dials_never_exceed_concurrency() {
        let (_stuck, _fillers, stuck_port) = stuck_listener().await;
        let servers: Vec<Server> = (0..6)
            .map(|i| server(&format!("s{i}"), "127.0.0.1", stuck_port))
            .collect();

        // Every dial hangs for the full timeout, so six dials two at a time need three rounds.
        let timeout = Duration::from_millis(300);
        let tester = ReachabilityTester::new(timeout, 2);
        let started = std::time::Instant::now();
        let out = tester
            .test(&servers, None, &CancellationToken::new())
            .await;
        let elapsed = started.elapsed();

        assert_eq!(out.len(), 6);
        assert!(out.iter().all(|r| !r.available));
        assert!(elapsed >= timeout * 3, "took {elapsed:?}");
        assert!(elapsed < timeout * 5, "took {elapsed:?}");
    }
}
