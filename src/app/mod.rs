//! Application core module
//!
//! Wires the proxy, the intercept queues, the rule store, the certificate
//! authority and the intruder together and exposes them as one control
//! surface for whatever front end drives the engine.

pub mod config;
pub mod events;

pub use config::{Config, ProxyConfig};
pub use events::{EventSink, ProxyEvent};

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::error::{CertificateError, IntegrityError, ProxyError, RuleError, ValidationError};
use crate::http::HttpClient;
use crate::intruder::{AttackConfig, AttackHandle, AttackSnapshot, Intruder};
use crate::proxy::{
    CaInfo, CertFormat, CertificateAuthority, Exchange, ExchangeId, HeldItem, HistoryFilter, InterceptManager,
    InterceptedFrame, ProxyHistory, ProxyServer, ProxyShared, ProxyStatus, RecordStore, RequestOverrides,
    ResponseOverrides, WebSocketHistory, WebSocketMessage, WebSocketSession,
};
use crate::rules::{Rule, RuleStore};
use crate::scope::{ExclusionSet, Exclusions};

/// Main application
pub struct App {
    /// Configuration
    config: Config,

    /// Collaborators shared with the proxy
    shared: ProxyShared,

    /// Default record store
    history: Arc<ProxyHistory>,

    /// Proxy server
    proxy: ProxyServer,

    /// Attack engine
    intruder: Intruder,

    /// Where rule edits are persisted
    rules_path: PathBuf,
}

impl App {
    /// Create a new application instance
    pub fn new(config: Config, events: EventSink) -> Result<Self> {
        config.validate()?;

        let data_dir = config.resolved_data_dir()?;
        let ca = CertificateAuthority::new(config.ca_dir()?, config.certificates.key_algorithm);

        let rules_path = data_dir.join("rules.json");
        let rules = if rules_path.exists() {
            RuleStore::load(&rules_path)?
        } else {
            RuleStore::default()
        };

        let exclusions = ExclusionSet::new(&config.proxy.excluded_hosts, &config.proxy.excluded_url_prefixes);
        let history = Arc::new(ProxyHistory::new(config.general.max_history_items));

        let shared = ProxyShared {
            ca: Arc::new(ca),
            intercept: Arc::new(InterceptManager::new(
                config.proxy.intercept_enabled,
                config.proxy.intercept_timeout(),
            )),
            rules: Arc::new(rules),
            exclusions: Arc::new(Exclusions::new(exclusions)),
            store: history.clone(),
            ws_history: Arc::new(WebSocketHistory::new(
                config.general.max_websocket_sessions,
                config.general.max_websocket_messages,
            )),
            events: events.clone(),
            next_id: Arc::new(AtomicU64::new(0)),
        };

        let client = HttpClient::new(config.intruder.request_timeout(), config.intruder.max_response_size)
            .context("Failed to create attack client")?;
        let intruder = Intruder::new(client, config.intruder.clone(), history.clone(), events);
        let proxy = ProxyServer::new(config.proxy.clone(), shared.clone());

        Ok(Self {
            config,
            shared,
            history,
            proxy,
            intruder,
            rules_path,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // Proxy control

    pub async fn start_proxy(&mut self) -> Result<SocketAddr, ProxyError> {
        self.proxy.start().await
    }

    pub async fn stop_proxy(&mut self) -> Result<(), ProxyError> {
        self.proxy.stop().await
    }

    /// Swap the proxy configuration, restarting the listener if it is up
    pub async fn update_proxy_config(&mut self, proxy: ProxyConfig) -> Result<Option<SocketAddr>, ProxyError> {
        self.config.proxy = proxy.clone();
        self.proxy.update_config(proxy).await
    }

    pub fn proxy_status(&self) -> ProxyStatus {
        self.proxy.status()
    }

    // Interception

    pub fn set_intercept(&mut self, enabled: bool) {
        tracing::info!("Interception {}", if enabled { "enabled" } else { "disabled" });
        self.config.proxy.intercept_enabled = enabled;
        self.shared.intercept.set_enabled(enabled);
    }

    pub fn pending_requests(&self) -> Vec<HeldItem<Exchange>> {
        self.shared.intercept.requests().list()
    }

    pub fn pending_responses(&self) -> Vec<HeldItem<Exchange>> {
        self.shared.intercept.responses().list()
    }

    pub fn pending_frames(&self) -> Vec<HeldItem<InterceptedFrame>> {
        self.shared.intercept.frames().list()
    }

    pub fn forward_request(&self, id: ExchangeId) -> Result<(), IntegrityError> {
        self.shared.intercept.forward_request(id)
    }

    pub fn drop_request(&self, id: ExchangeId) -> Result<(), IntegrityError> {
        self.shared.intercept.drop_request(id)
    }

    pub fn modify_request(&self, id: ExchangeId, overrides: RequestOverrides) -> Result<(), IntegrityError> {
        self.shared.intercept.modify_request(id, overrides)
    }

    /// Hold the response of a request that is still held
    pub fn mark_response(&self, id: ExchangeId) -> Result<(), IntegrityError> {
        self.shared.intercept.mark_response(id)
    }

    pub fn forward_response(&self, id: ExchangeId) -> Result<(), IntegrityError> {
        self.shared.intercept.forward_response(id)
    }

    pub fn drop_response(&self, id: ExchangeId) -> Result<(), IntegrityError> {
        self.shared.intercept.drop_response(id)
    }

    pub fn modify_response(&self, id: ExchangeId, overrides: ResponseOverrides) -> Result<(), IntegrityError> {
        self.shared.intercept.modify_response(id, overrides)
    }

    pub fn forward_frame(&self, id: u64) -> Result<(), IntegrityError> {
        self.shared.intercept.forward_frame(id)
    }

    pub fn drop_frame(&self, id: u64) -> Result<(), IntegrityError> {
        self.shared.intercept.drop_frame(id)
    }

    pub fn modify_frame(&self, id: u64, text: String) -> Result<(), IntegrityError> {
        self.shared.intercept.modify_frame(id, text)
    }

    // Exclusions

    pub fn exclusions(&self) -> Arc<ExclusionSet> {
        self.shared.exclusions.snapshot()
    }

    pub fn add_excluded_host(&self, host: &str) -> bool {
        self.shared.exclusions.add_host(host)
    }

    pub fn remove_excluded_host(&self, host: &str) -> bool {
        self.shared.exclusions.remove_host(host)
    }

    pub fn add_excluded_url(&self, prefix: &str) -> bool {
        self.shared.exclusions.add_url_prefix(prefix)
    }

    pub fn remove_excluded_url(&self, prefix: &str) -> bool {
        self.shared.exclusions.remove_url_prefix(prefix)
    }

    // Certificate authority

    /// Root certificate, creating the CA first if needed
    pub fn export_ca(&self, format: CertFormat) -> Result<Vec<u8>, CertificateError> {
        self.shared.ca.ensure_root()?;
        self.shared.ca.export_root(format)
    }

    /// Replace the root; previously minted leaves are discarded
    pub fn regenerate_ca(&self) -> Result<CaInfo, CertificateError> {
        self.shared.ca.regenerate()?;
        Ok(self.shared.ca.info())
    }

    pub fn ca_info(&self) -> CaInfo {
        self.shared.ca.info()
    }

    // Match & replace

    pub fn rules(&self) -> Vec<Rule> {
        self.shared.rules.list()
    }

    /// Insert or replace a rule and persist the list
    pub fn save_rule(&self, rule: Rule) -> Result<(), RuleError> {
        self.shared.rules.save(rule)?;
        self.persist_rules();
        Ok(())
    }

    pub fn delete_rule(&self, id: &str) -> Result<(), RuleError> {
        self.shared.rules.delete(id)?;
        self.persist_rules();
        Ok(())
    }

    fn persist_rules(&self) {
        if let Err(e) = self.shared.rules.save_to(&self.rules_path) {
            tracing::warn!("Failed to persist rules to {:?}: {:#}", self.rules_path, e);
        }
    }

    // Intruder

    pub fn start_attack(&self, config: AttackConfig) -> Result<AttackHandle, ValidationError> {
        self.intruder.start(config)
    }

    pub fn stop_attack(&self, attack_id: &str) -> Result<(), ValidationError> {
        self.intruder.stop(attack_id)
    }

    pub fn attack(&self, attack_id: &str) -> Option<AttackSnapshot> {
        self.intruder.attack(attack_id)
    }

    pub fn attacks(&self) -> Vec<AttackSnapshot> {
        self.intruder.list()
    }

    // History

    pub fn history(&self, filter: &HistoryFilter) -> Vec<Exchange> {
        self.history.query(filter)
    }

    pub fn exchange(&self, id: ExchangeId) -> Option<Exchange> {
        self.history.exchange(id)
    }

    pub fn clear_history(&self) {
        self.history.clear();
    }

    pub fn websocket_sessions(&self) -> Vec<WebSocketSession> {
        self.shared.ws_history.sessions()
    }

    pub fn websocket_messages(&self, session_id: u64) -> Vec<WebSocketMessage> {
        self.shared.ws_history.session_messages(session_id)
    }

    /// Stop running attacks and the proxy; held items are forwarded
    pub async fn shutdown(&mut self) {
        for attack in self.intruder.list() {
            if !attack.status.is_finished() {
                let _ = self.intruder.stop(&attack.id);
            }
        }
        if self.proxy.is_running() {
            if let Err(e) = self.proxy.stop().await {
                tracing::warn!("Error stopping proxy: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::KeyAlgorithm;
    use crate::rules::RuleTarget;

    fn test_config(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.general.data_dir = Some(dir.to_path_buf());
        config.proxy.port = 0;
        config.proxy.excluded_hosts = vec!["telemetry.test".into()];
        config.certificates.key_algorithm = KeyAlgorithm::EcdsaP256;
        config
    }

    #[tokio::test]
    async fn test_proxy_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = App::new(test_config(dir.path()), EventSink::disabled()).unwrap();

        assert!(!app.proxy_status().running);
        let addr = app.start_proxy().await.unwrap();
        assert!(matches!(app.start_proxy().await, Err(ProxyError::AlreadyRunning)));

        let status = app.proxy_status();
        assert!(status.running);
        assert_eq!(status.address, Some(addr));
        assert!(app.ca_info().exists);

        app.set_intercept(true);
        assert!(app.proxy_status().intercept_enabled);

        app.shutdown().await;
        assert!(!app.proxy_status().running);
    }

    #[test]
    fn test_exclusions_seeded_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::new(test_config(dir.path()), EventSink::disabled()).unwrap();
        assert!(app.exclusions().excludes_host("telemetry.test"));

        assert!(app.add_excluded_url("http://cdn.test/static/"));
        assert!(app.exclusions().excludes_url("http://cdn.test/static/app.js"));
        assert!(app.remove_excluded_host("telemetry.test"));
        assert!(!app.exclusions().excludes_host("telemetry.test"));
    }

    #[test]
    fn test_rules_persist_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let rule = Rule::literal(RuleTarget::Body, "alpha", "beta");
        {
            let app = App::new(test_config(dir.path()), EventSink::disabled()).unwrap();
            app.save_rule(rule.clone()).unwrap();
            app.save_rule(Rule::set_header("X-Test", "1")).unwrap();
        }

        let app = App::new(test_config(dir.path()), EventSink::disabled()).unwrap();
        assert_eq!(app.rules().len(), 2);
        app.delete_rule(&rule.id).unwrap();
        assert!(matches!(app.delete_rule(&rule.id), Err(RuleError::NotFound(_))));
        assert_eq!(app.rules().len(), 1);
    }

    #[test]
    fn test_ca_export_and_regenerate() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::new(test_config(dir.path()), EventSink::disabled()).unwrap();

        let pem = app.export_ca(CertFormat::Pem).unwrap();
        assert!(String::from_utf8(pem.clone()).unwrap().starts_with("-----BEGIN CERTIFICATE-----"));

        let info = app.regenerate_ca().unwrap();
        assert!(info.exists);
        assert_ne!(app.export_ca(CertFormat::Pem).unwrap(), pem);
    }

    #[test]
    fn test_operator_actions_on_unknown_ids() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::new(test_config(dir.path()), EventSink::disabled()).unwrap();
        assert_eq!(app.forward_request(9), Err(IntegrityError::NotPending(9)));
        assert_eq!(app.mark_response(9), Err(IntegrityError::NotPending(9)));
        assert_eq!(app.modify_frame(9, "x".into()), Err(IntegrityError::NotPending(9)));
        assert!(app.stop_attack("missing").is_err());
        assert!(app.history(&HistoryFilter::default()).is_empty());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.intruder.concurrency = 0;
        assert!(App::new(config, EventSink::disabled()).is_err());
    }
}
