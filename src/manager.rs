use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::Config,
    domain::{PingResult, Server},
    endpoint_probe::{ProgressFn, ReachabilityTester, quickselect, sort_by_latency},
    subscription::{LoaderError, SubscriptionLoader},
    switcher::{SwitchError, XrayConfigSwitcher},
    xray::{
        config_file::{ConfigFileError, OutboundEntry},
        restart::{RestartError, restarter_from_config},
    },
};

#[derive(Debug)]
pub enum ManagerError {
    EmptyList,
    NotFound { id: String },
    Load(LoaderError),
    Switch(SwitchError),
    Restart(RestartError),
    NoProxyOutbound,
    NoMatchingServer { tag: String, protocol: String },
}

impl std::fmt::Display for ManagerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyList => write!(f, "server list is empty; load the subscription first"),
            Self::NotFound { id } => write!(f, "server not found: {id}"),
            Self::Load(e) => write!(f, "load servers: {e}"),
            Self::Switch(e) => write!(f, "switch server: {e}"),
            Self::Restart(e) => write!(f, "restart xray: {e}"),
            Self::NoProxyOutbound => write!(f, "xray config has no proxy outbound"),
            Self::NoMatchingServer { tag, protocol } => write!(
                f,
                "current outbound (tag={tag}, protocol={protocol}) matches no known server"
            ),
        }
    }
}

impl std::error::Error for ManagerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Load(e) => Some(e),
            Self::Switch(e) => Some(e),
            Self::Restart(e) => Some(e),
            _ => None,
        }
    }
}

impl From<LoaderError> for ManagerError {
    fn from(value: LoaderError) -> Self {
        Self::Load(value)
    }
}

impl From<SwitchError> for ManagerError {
    fn from(value: SwitchError) -> Self {
        Self::Switch(value)
    }
}

impl From<ConfigFileError> for ManagerError {
    fn from(value: ConfigFileError) -> Self {
        Self::Switch(SwitchError::Config(value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerStatus {
    pub total: usize,
    pub current: Option<Server>,
    pub last_loaded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct ManagerState {
    servers: Vec<Server>,
    current: Option<Server>,
    last_loaded_at: Option<DateTime<Utc>>,
}

/// The one object a front-end talks to. Reads hand out copies; the candidate list and the
/// current pointer live behind a single lock.
///
/// Operations that both touch the daemon config and move the current pointer also hold
/// `switch_lock`, so the pointer always names what the last finished switch wrote.
pub struct ServerManager {
    loader: SubscriptionLoader,
    tester: ReachabilityTester,
    switcher: Arc<XrayConfigSwitcher>,
    state: RwLock<ManagerState>,
    switch_lock: Mutex<()>,
}

impl ServerManager {
    pub fn new(
        loader: SubscriptionLoader,
        tester: ReachabilityTester,
        switcher: Arc<XrayConfigSwitcher>,
    ) -> Self {
        Self {
            loader,
            tester,
            switcher,
            state: RwLock::new(ManagerState::default()),
            switch_lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, ManagerError> {
        let loader = SubscriptionLoader::from_config(config)?;
        let tester = ReachabilityTester::from_config(config);
        let restarter = restarter_from_config(config).map_err(ManagerError::Restart)?;
        let switcher = Arc::new(XrayConfigSwitcher::new(
            config.config_path.clone(),
            restarter,
        ));
        Ok(Self::new(loader, tester, switcher))
    }

    pub fn switcher(&self) -> &Arc<XrayConfigSwitcher> {
        &self.switcher
    }

    pub async fn load(&self, cancel: &CancellationToken) -> Result<Vec<Server>, ManagerError> {
        let servers = self.loader.load(cancel).await?;
        if servers.is_empty() {
            return Err(ManagerError::EmptyList);
        }

        let mut state = self.state.write().await;
        let stale = state
            .current
            .as_ref()
            .is_some_and(|current| !servers.iter().any(|s| s.id == current.id));
        if stale && let Some(current) = state.current.take() {
            info!(server_id = %current.id, "current server left the subscription");
        }
        state.servers = servers.clone();
        state.last_loaded_at = Some(Utc::now());
        Ok(servers)
    }

    pub async fn refresh(&self, cancel: &CancellationToken) -> Result<Vec<Server>, ManagerError> {
        self.loader.invalidate_cache().await;
        self.load(cancel).await
    }

    pub async fn list(&self) -> Vec<Server> {
        self.state.read().await.servers.clone()
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Server, ManagerError> {
        self.state
            .read()
            .await
            .servers
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| ManagerError::NotFound { id: id.to_string() })
    }

    /// Rewrites the daemon config for `id` and restarts it. The current pointer moves only
    /// after the restart succeeded.
    pub async fn switch(&self, id: &str) -> Result<Server, ManagerError> {
        let server = self.get_by_id(id).await?;
        let _switching = self.switch_lock.lock().await;
        info!(server_id = %server.id, name = %server.name, "switching server");
        self.switcher.update_and_restart(&server).await?;

        self.state.write().await.current = Some(server.clone());
        Ok(server)
    }

    /// Probes the loaded list and returns it sorted, fastest first.
    pub async fn test_ping(
        &self,
        progress: Option<Arc<ProgressFn>>,
        cancel: &CancellationToken,
    ) -> Result<Vec<PingResult>, ManagerError> {
        let servers = self.list().await;
        if servers.is_empty() {
            return Err(ManagerError::EmptyList);
        }
        let results = self.tester.test(&servers, progress, cancel).await;
        Ok(sort_by_latency(&results))
    }

    /// The `limit` fastest reachable servers; `0` returns every reachable one.
    pub async fn fastest(
        &self,
        limit: usize,
        progress: Option<Arc<ProgressFn>>,
        cancel: &CancellationToken,
    ) -> Result<Vec<PingResult>, ManagerError> {
        let results = self.test_ping(progress, cancel).await?;
        Ok(quickselect(&results, limit))
    }

    /// Matches the daemon's live proxy outbound against the loaded list by tag and protocol,
    /// preferring the candidate whose vnext endpoint also matches.
    pub async fn detect_current(&self) -> Result<Server, ManagerError> {
        let _switching = self.switch_lock.lock().await;
        let config = self.switcher.get_current_config().await?;
        let live = config.first_proxy_outbound()?;

        let mut state = self.state.write().await;
        let Some(live) = live else {
            state.current = None;
            return Err(ManagerError::NoProxyOutbound);
        };

        match find_match(&state.servers, &live) {
            Some(server) => {
                let server = server.clone();
                state.current = Some(server.clone());
                Ok(server)
            }
            None => {
                warn!(tag = %live.tag, protocol = %live.protocol, "live outbound matches no known server");
                state.current = None;
                Err(ManagerError::NoMatchingServer {
                    tag: live.tag,
                    protocol: live.protocol,
                })
            }
        }
    }

    pub async fn current(&self) -> Option<Server> {
        self.state.read().await.current.clone()
    }

    pub async fn status(&self) -> ManagerStatus {
        let state = self.state.read().await;
        ManagerStatus {
            total: state.servers.len(),
            current: state.current.clone(),
            last_loaded_at: state.last_loaded_at,
        }
    }

    /// Restores the newest config backup and restarts the daemon.
    pub async fn restore_latest(&self) -> Result<std::path::PathBuf, ManagerError> {
        let _switching = self.switch_lock.lock().await;
        let backup = self.switcher.restore().await?;
        self.switcher
            .restart()
            .await
            .map_err(ManagerError::Restart)?;
        self.state.write().await.current = None;
        Ok(backup)
    }
}

fn find_match<'a>(servers: &'a [Server], live: &OutboundEntry) -> Option<&'a Server> {
    let mut candidates = servers
        .iter()
        .filter(|s| s.tag == live.tag && s.protocol == live.protocol)
        .peekable();
    let first = *candidates.peek()?;
    let Some(endpoint) = live.vnext_endpoint() else {
        return Some(first);
    };
    candidates
        .find(|s| s.vnext_endpoint() == Some(endpoint))
        .or(Some(first))
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        path::PathBuf,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    use super::*;
    use crate::{
        state::JsonSnapshotStore,
        subscription::LoaderOptions,
        xray::restart::{RestartFuture, Restarter},
    };

    const URI_NL: &str = "vless://ec82bca8-1072-4682-822f-30306af408ea@1.2.3.4:443?type=tcp&security=reality&sni=outlook.office.com&pbk=K&sid=S&fp=chrome&flow=xtls-rprx-vision#NL";
    const URI_DE: &str = "vless://ec82bca8-1072-4682-822f-30306af408ea@5.6.7.8:443?type=tcp&security=reality&sni=outlook.office.com&pbk=K&sid=S&fp=chrome#DE";

    struct RecordingRestarter {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Restarter for RecordingRestarter {
        fn restart(&self) -> RestartFuture {
            let calls = self.calls.clone();
            let fail = self.fail;
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if fail {
                    return Err(RestartError::Failed {
                        program: "test".to_string(),
                        status: "exit status: 1".to_string(),
                        stderr: String::new(),
                    });
                }
                Ok(())
            })
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        _http: MockServer,
        config_path: PathBuf,
        calls: Arc<AtomicUsize>,
        manager: ServerManager,
    }

    async fn fixture(uris: &[&str], restart_fails: bool) -> Fixture {
        let http = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sub"))
            .respond_with(ResponseTemplate::new(200).set_body_string(STANDARD.encode(uris.join("\n"))))
            .mount(&http)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let config_path = tmp.path().join("config.json");
        let config = json!({
            "outbounds": [
                {"tag": "vless-reality", "protocol": "vless",
                 "settings": {"vnext": [{"address": "5.6.7.8", "port": 443, "users": []}]}},
                {"tag": "direct", "protocol": "freedom"}
            ]
        });
        fs::write(&config_path, serde_json::to_vec_pretty(&config).unwrap()).unwrap();

        let opts = LoaderOptions {
            url: format!("{}/sub", http.uri()),
            cache_ttl: Duration::from_secs(300),
            request_timeout: Duration::from_secs(5),
            attempts: 1,
            retry_step: Duration::from_millis(10),
        };
        let loader =
            SubscriptionLoader::new(opts, JsonSnapshotStore::in_dir(&tmp.path().join("cache")))
                .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let switcher = Arc::new(XrayConfigSwitcher::new(
            config_path.clone(),
            Arc::new(RecordingRestarter {
                calls: calls.clone(),
                fail: restart_fails,
            }),
        ));
        let manager = ServerManager::new(
            loader,
            ReachabilityTester::new(Duration::from_secs(1), 4),
            switcher,
        );
        Fixture {
            _tmp: tmp,
            _http: http,
            config_path,
            calls,
            manager,
        }
    }

    #[tokio::test]
    async fn load_list_and_lookup() {
        let f = fixture(&[URI_NL, URI_DE], false).await;
        let cancel = CancellationToken::new();
        assert!(f.manager.list().await.is_empty());
        assert_eq!(f.manager.status().await.last_loaded_at, None);

        let loaded = f.manager.load(&cancel).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(f.manager.list().await, loaded);
        assert_eq!(f.manager.get_by_id("5_6_7_8_443").await.unwrap().name, "DE");
        assert!(matches!(
            f.manager.get_by_id("nope").await,
            Err(ManagerError::NotFound { .. })
        ));

        let status = f.manager.status().await;
        assert_eq!(status.total, 2);
        assert_eq!(status.current, None);
        assert!(status.last_loaded_at.is_some());
    }

    #[tokio::test]
    async fn ping_before_load_fails_with_empty_list() {
        let f = fixture(&[URI_NL], false).await;
        let err = f
            .manager
            .test_ping(None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::EmptyList));
    }

    #[tokio::test]
    async fn switch_updates_current_only_after_restart() {
        let f = fixture(&[URI_NL, URI_DE], false).await;
        f.manager.load(&CancellationToken::new()).await.unwrap();

        let server = f.manager.switch("1_2_3_4_443").await.unwrap();
        assert_eq!(server.name, "NL");
        assert_eq!(f.manager.current().await, Some(server));
        assert_eq!(f.calls.load(Ordering::SeqCst), 1);

        let value: serde_json::Value =
            serde_json::from_slice(&fs::read(&f.config_path).unwrap()).unwrap();
        assert_eq!(
            value["outbounds"][0]["settings"]["vnext"][0]["address"],
            json!("1.2.3.4")
        );
        assert_eq!(value["outbounds"][1]["protocol"], json!("freedom"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_switches_leave_current_matching_the_config() {
        let f = fixture(&[URI_NL, URI_DE], false).await;
        f.manager.load(&CancellationToken::new()).await.unwrap();

        for _ in 0..10 {
            let (nl, de) = tokio::join!(
                f.manager.switch("1_2_3_4_443"),
                f.manager.switch("5_6_7_8_443")
            );
            nl.unwrap();
            de.unwrap();

            let value: serde_json::Value =
                serde_json::from_slice(&fs::read(&f.config_path).unwrap()).unwrap();
            let on_disk = value["outbounds"][0]["settings"]["vnext"][0]["address"]
                .as_str()
                .unwrap()
                .to_string();
            let current = f.manager.current().await.unwrap();
            assert_eq!(current.address, on_disk);
        }
        assert_eq!(f.calls.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn failed_switch_keeps_previous_current() {
        let f = fixture(&[URI_NL, URI_DE], true).await;
        f.manager.load(&CancellationToken::new()).await.unwrap();
        let before = fs::read(&f.config_path).unwrap();

        let err = f.manager.switch("1_2_3_4_443").await.unwrap_err();
        assert!(matches!(
            err,
            ManagerError::Switch(SwitchError::RestartRetryFailed { .. })
        ));
        assert_eq!(f.manager.current().await, None);
        assert_eq!(fs::read(&f.config_path).unwrap(), before);
    }

    #[tokio::test]
    async fn switch_unknown_id_is_not_found() {
        let f = fixture(&[URI_NL], false).await;
        f.manager.load(&CancellationToken::new()).await.unwrap();
        assert!(matches!(
            f.manager.switch("9_9_9_9_443").await,
            Err(ManagerError::NotFound { .. })
        ));
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn detect_current_prefers_endpoint_match() {
        let f = fixture(&[URI_NL, URI_DE], false).await;
        f.manager.load(&CancellationToken::new()).await.unwrap();

        // Both candidates share tag and protocol; the vnext address picks DE.
        let current = f.manager.detect_current().await.unwrap();
        assert_eq!(current.name, "DE");
        assert_eq!(f.manager.current().await, Some(current));
    }

    #[tokio::test]
    async fn detect_current_clears_pointer_on_mismatch() {
        let f = fixture(&[URI_NL], false).await;
        f.manager.load(&CancellationToken::new()).await.unwrap();
        f.manager.switch("1_2_3_4_443").await.unwrap();

        let config = json!({
            "outbounds": [
                {"tag": "manual", "protocol": "trojan"},
                {"tag": "direct", "protocol": "freedom"}
            ]
        });
        fs::write(&f.config_path, serde_json::to_vec(&config).unwrap()).unwrap();

        let err = f.manager.detect_current().await.unwrap_err();
        match err {
            ManagerError::NoMatchingServer { tag, protocol } => {
                assert_eq!(tag, "manual");
                assert_eq!(protocol, "trojan");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(f.manager.current().await, None);
    }

    #[tokio::test]
    async fn fastest_returns_only_reachable_servers() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let closed = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let up = format!("vless://ec82bca8-1072-4682-822f-30306af408ea@127.0.0.1:{port}#up");
        let down = format!("vless://ec82bca8-1072-4682-822f-30306af408ea@127.0.0.1:{closed}#down");

        let f = fixture(&[down.as_str(), up.as_str()], false).await;
        f.manager.load(&CancellationToken::new()).await.unwrap();

        let all = f
            .manager
            .test_ping(None, &CancellationToken::new())
            .await
            .unwrap();
        let names: Vec<&str> = all.iter().map(|r| r.server.name.as_str()).collect();
        assert_eq!(names, vec!["up", "down"]);

        let fastest = f
            .manager
            .fastest(5, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(fastest.len(), 1);
        assert_eq!(fastest[0].server.name, "up");
    }

    #[tokio::test]
    async fn restore_latest_restores_and_restarts() {
        let f = fixture(&[URI_NL], false).await;
        f.manager.load(&CancellationToken::new()).await.unwrap();
        let before = fs::read(&f.config_path).unwrap();
        f.manager.switch("1_2_3_4_443").await.unwrap();
        assert_ne!(fs::read(&f.config_path).unwrap(), before);

        f.manager.restore_latest().await.unwrap();
        assert_eq!(fs::read(&f.config_path).unwrap(), before);
        assert_eq!(f.calls.load(Ordering::SeqCst), 2);
        assert_eq!(f.manager.current().await, None);
    }
}
