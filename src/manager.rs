//! Connection manager: the gateway core's public surface.
//!
//! Holds one client, one circuit breaker, and one FIFO queue per branch.
//! The queue serializes operations strictly: a SIP2 socket carries one
//! request-response at a time, and concurrent callers would otherwise
//! collide on sequence numbers and receive each other's responses.
//! Failures never break the chain; the next queued operation always runs.
//!
//! On success every operation emits a masked transaction event through
//! the event bus; delivery is asynchronous and can never delay a call.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::breaker::{CircuitBreaker, CircuitState, DEFAULT_BACKOFF, DEFAULT_FAILURE_THRESHOLD};
use crate::config::{BranchConfig, GatewayConfig};
use crate::error::{Result, Sip2Error};
use crate::events::EventBus;
use crate::mask::Masker;
use crate::sip2::client::SipClient;
use crate::sip2::format::{HoldMode, InfoSummary, SecurityMarker};
use crate::sip2::types::*;

/// Login attempts before giving up (one initial try plus retries).
const LOGIN_ATTEMPTS: u32 = 3;

/// Delays between login attempts.
const LOGIN_RETRY_DELAYS: [Duration; 2] =
    [Duration::from_millis(500), Duration::from_millis(1000)];

/// Tunables the tests shrink to milliseconds.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub failure_threshold: u32,
    pub backoff_schedule: Vec<Duration>,
    pub login_retry_delays: Vec<Duration>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            backoff_schedule: DEFAULT_BACKOFF.to_vec(),
            login_retry_delays: LOGIN_RETRY_DELAYS.to_vec(),
        }
    }
}

struct BranchState {
    config: BranchConfig,
    /// FIFO serialization handle; tokio's mutex queues waiters fairly.
    queue: Mutex<()>,
    client: Mutex<Option<Arc<SipClient>>>,
    breaker: StdMutex<CircuitBreaker>,
}

impl BranchState {
    fn new(config: BranchConfig, options: &ManagerOptions) -> Self {
        Self {
            config,
            queue: Mutex::new(()),
            client: Mutex::new(None),
            breaker: StdMutex::new(CircuitBreaker::with_profile(
                options.failure_threshold,
                options.backoff_schedule.clone(),
            )),
        }
    }
}

pub struct ConnectionManager {
    branches: RwLock<HashMap<String, Arc<BranchState>>>,
    location_code: RwLock<String>,
    options: ManagerOptions,
    masker: Arc<Masker>,
    bus: Arc<EventBus>,
}

impl ConnectionManager {
    pub fn new(config: GatewayConfig) -> Self {
        Self::with_options(config, ManagerOptions::default())
    }

    pub fn with_options(config: GatewayConfig, options: ManagerOptions) -> Self {
        let masker = Arc::new(match &config.master_key {
            Some(key) => Masker::new(key),
            None => Masker::unkeyed(),
        });
        let bus = Arc::new(EventBus::new(masker.clone()));
        let branches = config
            .branches
            .into_iter()
            .map(|branch| (branch.id.clone(), Arc::new(BranchState::new(branch, &options))))
            .collect();
        Self {
            branches: RwLock::new(branches),
            location_code: RwLock::new(config.location_code),
            options,
            masker,
            bus,
        }
    }

    /// The event bus carrying masked transactions and dashboard lines.
    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn branch_ids(&self) -> Vec<String> {
        self.branches.read().unwrap().keys().cloned().collect()
    }

    /// Current breaker state for a branch, for monitoring.
    pub fn circuit_state(&self, branch_id: &str) -> Result<CircuitState> {
        let branch = self.branch(branch_id)?;
        let state = branch.breaker.lock().unwrap().state();
        Ok(state)
    }

    /// Consecutive protocol failures recorded for a branch.
    pub fn failure_count(&self, branch_id: &str) -> Result<u32> {
        let branch = self.branch(branch_id)?;
        let count = branch.breaker.lock().unwrap().failure_count();
        Ok(count)
    }

    fn branch(&self, branch_id: &str) -> Result<Arc<BranchState>> {
        self.branches
            .read()
            .unwrap()
            .get(branch_id)
            .cloned()
            .ok_or_else(|| Sip2Error::UnknownBranch(branch_id.to_string()))
    }

    /// Run one SIP2 operation against a branch: enqueue behind anything
    /// already running there, gate through the circuit breaker, acquire
    /// (or build and log into) the client, execute, record the outcome,
    /// and emit the masked transaction event.
    async fn execute<T, F, Fut>(
        &self,
        branch_id: &str,
        action: &'static str,
        request: Value,
        op: F,
    ) -> Result<T>
    where
        T: Serialize,
        F: FnOnce(Arc<SipClient>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let branch = self.branch(branch_id)?;
        let _turn = branch.queue.lock().await;

        let client = match self.get_client(&branch).await {
            Ok(client) => client,
            Err(e) => {
                self.record_failure(&branch, &e).await;
                return Err(e);
            }
        };

        match op(client).await {
            Ok(response) => {
                self.record_success(&branch);
                self.emit_transaction(action, branch_id, &request, &response);
                Ok(response)
            }
            Err(e) => {
                self.record_failure(&branch, &e).await;
                Err(e)
            }
        }
    }

    /// Breaker gate plus client acquisition. Runs under the branch queue.
    async fn get_client(&self, branch: &BranchState) -> Result<Arc<SipClient>> {
        {
            let mut breaker = branch.breaker.lock().unwrap();
            breaker.refresh();
            match breaker.state() {
                CircuitState::Open => {
                    let retry_at = breaker.retry_at().unwrap_or_else(Instant::now);
                    return Err(Sip2Error::CircuitOpen { retry_at });
                }
                CircuitState::HalfOpen => {
                    if breaker.probe_in_flight() {
                        return Err(Sip2Error::ProbeInFlight);
                    }
                    breaker.begin_probe();
                    debug!(branch = %branch.config.id, "half-open probe admitted");
                }
                CircuitState::Closed => {}
            }
        }

        let mut slot = branch.client.lock().await;
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }

        let client = Arc::new(SipClient::new(branch.config.clone(), self.bus.clone()));
        if let Some(credentials) = branch.config.credentials.clone() {
            self.perform_login(branch, &client, &credentials.user, &credentials.password).await?;
        }
        *slot = Some(client.clone());
        Ok(client)
    }

    /// Login handshake: up to three attempts with increasing delays.
    /// Success is a `941` response; anything else, or any transport
    /// failure, triggers a retry. A vendor profile may demand a post-login
    /// SC Status round-trip, which must also succeed.
    async fn perform_login(
        &self,
        branch: &BranchState,
        client: &Arc<SipClient>,
        user: &str,
        password: &str,
    ) -> Result<()> {
        let location = self.location_code.read().unwrap().clone();
        let delays = &self.options.login_retry_delays;
        let attempts = (delays.len() + 1) as u32;

        for attempt in 1..=attempts {
            if attempt > 1 {
                let delay = delays[(attempt - 2) as usize];
                debug!(branch = %branch.config.id, attempt, "retrying login in {:?}", delay);
                sleep(delay).await;
            }
            match client.login(user, password, &location).await {
                Ok(true) => {
                    if branch.config.post_login_sc_status() {
                        match client.sc_status().await {
                            Ok(status) => {
                                debug!(
                                    branch = %branch.config.id,
                                    protocol = %status.protocol_version,
                                    "post-login SC status ok"
                                );
                            }
                            Err(e) => {
                                warn!(branch = %branch.config.id, attempt, error = %e, "post-login SC status failed");
                                continue;
                            }
                        }
                    }
                    info!(branch = %branch.config.id, "LMS login successful");
                    return Ok(());
                }
                Ok(false) => {
                    warn!(branch = %branch.config.id, attempt, "LMS rejected login");
                }
                Err(e) => {
                    warn!(branch = %branch.config.id, attempt, error = %e, "login attempt failed");
                }
            }
        }
        Err(Sip2Error::LoginRejected { attempts })
    }

    fn record_success(&self, branch: &BranchState) {
        branch.breaker.lock().unwrap().record_success();
    }

    /// Update the breaker after a failed operation. Breaker-gated
    /// rejections are not protocol failures and leave the record alone.
    async fn record_failure(&self, branch: &BranchState, error: &Sip2Error) {
        if !error.counts_as_failure() {
            return;
        }
        let opened = branch.breaker.lock().unwrap().record_failure();
        if opened {
            // A freshly opened circuit invalidates the cached client: the
            // next probe starts from a clean connect and login.
            if let Some(client) = branch.client.lock().await.take() {
                client.disconnect().await;
            }
        }
    }

    fn emit_transaction<T: Serialize>(
        &self,
        action: &'static str,
        branch_id: &str,
        request: &Value,
        response: &T,
    ) {
        let payload = json!({
            "action": action,
            "branchId": branch_id,
            "request": request,
            "response": serde_json::to_value(response).unwrap_or(Value::Null),
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        });
        self.bus.emit_log(self.masker.mask_payload(&payload));
    }

    // Public operations, one per supported SIP2 command.

    pub async fn patron_status(
        &self,
        branch_id: &str,
        patron_barcode: &str,
        language: Option<&str>,
    ) -> Result<PatronStatusResponse> {
        let barcode = patron_barcode.to_string();
        let language = language.map(str::to_string);
        let request = json!({ "patronBarcode": patron_barcode, "language": language });
        self.execute(branch_id, "patronStatus", request, move |client| async move {
            client.patron_status(&barcode, language.as_deref()).await
        })
        .await
    }

    pub async fn checkout(
        &self,
        branch_id: &str,
        patron_barcode: &str,
        item_barcode: &str,
        patron_pin: Option<&str>,
    ) -> Result<CheckoutResponse> {
        let patron = patron_barcode.to_string();
        let item = item_barcode.to_string();
        let pin = patron_pin.map(str::to_string);
        let request = json!({
            "patronBarcode": patron_barcode,
            "itemBarcode": item_barcode,
            "patronPin": patron_pin,
        });
        self.execute(branch_id, "checkout", request, move |client| async move {
            client.checkout(&patron, &item, pin.as_deref()).await
        })
        .await
    }

    pub async fn checkin(&self, branch_id: &str, item_barcode: &str) -> Result<CheckinResponse> {
        let item = item_barcode.to_string();
        let request = json!({ "itemBarcode": item_barcode });
        self.execute(branch_id, "checkin", request, move |client| async move {
            client.checkin(&item).await
        })
        .await
    }

    pub async fn item_information(
        &self,
        branch_id: &str,
        item_barcode: &str,
    ) -> Result<ItemInformationResponse> {
        let item = item_barcode.to_string();
        let request = json!({ "itemBarcode": item_barcode });
        self.execute(branch_id, "itemInformation", request, move |client| async move {
            client.item_information(&item).await
        })
        .await
    }

    pub async fn renew(
        &self,
        branch_id: &str,
        patron_barcode: &str,
        item_barcode: &str,
        patron_pin: Option<&str>,
    ) -> Result<CheckoutResponse> {
        let patron = patron_barcode.to_string();
        let item = item_barcode.to_string();
        let pin = patron_pin.map(str::to_string);
        let request = json!({
            "patronBarcode": patron_barcode,
            "itemBarcode": item_barcode,
            "patronPin": patron_pin,
        });
        self.execute(branch_id, "renew", request, move |client| async move {
            client.renew(&patron, &item, pin.as_deref()).await
        })
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn fee_paid(
        &self,
        branch_id: &str,
        patron_barcode: &str,
        fee_id: &str,
        amount: &str,
        fee_type: Option<&str>,
        payment_type: Option<&str>,
        currency: Option<&str>,
    ) -> Result<FeePaidResponse> {
        let patron = patron_barcode.to_string();
        let fee = fee_id.to_string();
        let amount_owned = amount.to_string();
        let fee_type = fee_type.map(str::to_string);
        let payment_type = payment_type.map(str::to_string);
        let currency = currency.map(str::to_string);
        let request = json!({
            "patronBarcode": patron_barcode,
            "feeId": fee_id,
            "amount": amount,
            "feeType": fee_type,
            "paymentType": payment_type,
            "currency": currency,
        });
        self.execute(branch_id, "feePaid", request, move |client| async move {
            client
                .fee_paid(
                    &patron,
                    &fee,
                    &amount_owned,
                    fee_type.as_deref(),
                    payment_type.as_deref(),
                    currency.as_deref(),
                )
                .await
        })
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn patron_information(
        &self,
        branch_id: &str,
        patron_barcode: &str,
        summary: Option<InfoSummary>,
        start_item: Option<u16>,
        end_item: Option<u16>,
        language: Option<&str>,
    ) -> Result<PatronInformationResponse> {
        let patron = patron_barcode.to_string();
        let language = language.map(str::to_string);
        let summary = summary.unwrap_or_default();
        let start = start_item.unwrap_or(1);
        let end = end_item.unwrap_or(9999);
        let request = json!({
            "patronBarcode": patron_barcode,
            "startItem": start,
            "endItem": end,
            "language": language,
        });
        self.execute(branch_id, "patronInformation", request, move |client| async move {
            client.patron_information(&patron, summary, start, end, language.as_deref()).await
        })
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn hold(
        &self,
        branch_id: &str,
        patron_barcode: &str,
        mode: HoldMode,
        item_barcode: Option<&str>,
        expiry_date: Option<&str>,
        pickup_location: Option<&str>,
        title_id: Option<&str>,
    ) -> Result<HoldResponse> {
        let patron = patron_barcode.to_string();
        let item = item_barcode.map(str::to_string);
        let expiry = expiry_date.map(str::to_string);
        let pickup = pickup_location.map(str::to_string);
        let title = title_id.map(str::to_string);
        let request = json!({
            "patronBarcode": patron_barcode,
            "holdMode": mode.as_char().to_string(),
            "itemBarcode": item_barcode,
            "expiryDate": expiry_date,
            "pickupLocation": pickup_location,
            "titleId": title_id,
        });
        self.execute(branch_id, "hold", request, move |client| async move {
            client
                .hold(
                    &patron,
                    mode,
                    item.as_deref(),
                    expiry.as_deref(),
                    pickup.as_deref(),
                    title.as_deref(),
                )
                .await
        })
        .await
    }

    pub async fn renew_all(
        &self,
        branch_id: &str,
        patron_barcode: &str,
    ) -> Result<RenewAllResponse> {
        let patron = patron_barcode.to_string();
        let request = json!({ "patronBarcode": patron_barcode });
        self.execute(branch_id, "renewAll", request, move |client| async move {
            client.renew_all(&patron).await
        })
        .await
    }

    pub async fn end_session(
        &self,
        branch_id: &str,
        patron_barcode: &str,
    ) -> Result<EndSessionResponse> {
        let patron = patron_barcode.to_string();
        let request = json!({ "patronBarcode": patron_barcode });
        self.execute(branch_id, "endSession", request, move |client| async move {
            client.end_session(&patron).await
        })
        .await
    }

    pub async fn sc_status(&self, branch_id: &str) -> Result<AcsStatusResponse> {
        self.execute(branch_id, "scStatus", json!({}), move |client| async move {
            client.sc_status().await
        })
        .await
    }

    /// Block Patron is fire-and-forget: the LMS defines no response, so
    /// the operation resolves once the frame is written.
    pub async fn block_patron(
        &self,
        branch_id: &str,
        patron_barcode: &str,
        card_retained: Option<bool>,
        message: Option<&str>,
    ) -> Result<()> {
        let patron = patron_barcode.to_string();
        let retained = card_retained.unwrap_or(false);
        let text = message.unwrap_or_default().to_string();
        let request = json!({
            "patronBarcode": patron_barcode,
            "cardRetained": retained,
            "message": message,
        });
        self.execute(branch_id, "blockPatron", request, move |client| async move {
            client.block_patron(&patron, retained, &text).await
        })
        .await
    }

    pub async fn item_status_update(
        &self,
        branch_id: &str,
        item_barcode: &str,
        security_marker: Option<SecurityMarker>,
    ) -> Result<ItemStatusUpdateResponse> {
        let item = item_barcode.to_string();
        let marker = security_marker.unwrap_or_default();
        let request = json!({
            "itemBarcode": item_barcode,
            "securityMarker": marker.as_char().to_string(),
        });
        self.execute(branch_id, "itemStatusUpdate", request, move |client| async move {
            client.item_status_update(&item, marker).await
        })
        .await
    }

    pub async fn patron_enable(
        &self,
        branch_id: &str,
        patron_barcode: &str,
        patron_pin: Option<&str>,
    ) -> Result<PatronStatusResponse> {
        let patron = patron_barcode.to_string();
        let pin = patron_pin.map(str::to_string);
        let request = json!({ "patronBarcode": patron_barcode, "patronPin": patron_pin });
        self.execute(branch_id, "patronEnable", request, move |client| async move {
            client.patron_enable(&patron, pin.as_deref()).await
        })
        .await
    }

    /// Replace the branch set: wait for every in-flight chain to settle,
    /// disconnect every client, then rebuild from the new configuration.
    pub async fn reinitialize(
        &self,
        branches: Vec<BranchConfig>,
        location_code: Option<String>,
    ) {
        let old: Vec<Arc<BranchState>> = {
            let mut map = self.branches.write().unwrap();
            map.drain().map(|(_, state)| state).collect()
        };
        self.drain_and_disconnect(old).await;

        if let Some(location) = location_code {
            *self.location_code.write().unwrap() = location;
        }

        let mut map = self.branches.write().unwrap();
        for branch in branches {
            map.insert(branch.id.clone(), Arc::new(BranchState::new(branch, &self.options)));
        }
        info!(branches = map.len(), "connection manager reinitialized");
    }

    /// Disconnect every client and forget every branch.
    pub async fn shutdown(&self) {
        let old: Vec<Arc<BranchState>> = {
            let mut map = self.branches.write().unwrap();
            map.drain().map(|(_, state)| state).collect()
        };
        self.drain_and_disconnect(old).await;
        info!("connection manager shut down");
    }

    async fn drain_and_disconnect(&self, branches: Vec<Arc<BranchState>>) {
        for branch in branches {
            // Waiting on the queue lets any in-flight operation finish.
            let _turn = branch.queue.lock().await;
            if let Some(client) = branch.client.lock().await.take() {
                client.disconnect().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with(branches: Vec<BranchConfig>) -> ConnectionManager {
        ConnectionManager::new(GatewayConfig {
            branches,
            location_code: "GATEWAY".to_string(),
            master_key: Some(b"0123456789abcdef0123456789abcdef".to_vec()),
        })
    }

    fn branch(id: &str) -> BranchConfig {
        BranchConfig {
            id: id.to_string(),
            host: "127.0.0.1".to_string(),
            port: 6001,
            timeout_ms: 1000,
            institution_id: "MAIN".to_string(),
            tls: false,
            tls_verify: true,
            credentials: None,
            profile: None,
        }
    }

    #[tokio::test]
    async fn test_unknown_branch() {
        let manager = manager_with(vec![branch("main")]);
        match manager.patron_status("nowhere", "P1", None).await {
            Err(Sip2Error::UnknownBranch(id)) => assert_eq!(id, "nowhere"),
            other => panic!("expected UnknownBranch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_branch_ids() {
        let manager = manager_with(vec![branch("main"), branch("east")]);
        let mut ids = manager.branch_ids();
        ids.sort();
        assert_eq!(ids, vec!["east", "main"]);
    }

    #[tokio::test]
    async fn test_circuit_state_starts_closed() {
        let manager = manager_with(vec![branch("main")]);
        assert_eq!(manager.circuit_state("main").unwrap(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_unknown_branch_does_not_trip_breaker() {
        let manager = manager_with(vec![branch("main")]);
        for _ in 0..5 {
            let _ = manager.checkin("missing", "I1").await;
        }
        assert_eq!(manager.circuit_state("main").unwrap(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_reinitialize_replaces_branches() {
        let manager = manager_with(vec![branch("main")]);
        manager.reinitialize(vec![branch("west")], Some("NEW-LOC".to_string())).await;
        let ids = manager.branch_ids();
        assert_eq!(ids, vec!["west"]);
        assert_eq!(*manager.location_code.read().unwrap(), "NEW-LOC");
    }

    #[tokio::test]
    async fn test_shutdown_clears_branches() {
        let manager = manager_with(vec![branch("main"), branch("east")]);
        manager.shutdown().await;
        assert!(manager.branch_ids().is_empty());
    }
}
