//! Per-request authorization
//!
//! Every inbound call is first classified by [`evaluate`]:
//!
//! - `Expired` when its timestamp is more than 15 minutes from local time
//! - `Trusted` when the signature verifies against the caller's identity
//!   certificate. Callers sign the lowercase hex SHA-256 of the compact JSON
//!   `{call, params, timestamp}`, with absent keys left out.
//! - `Unsigned` otherwise
//!
//! Calls that need consent then go through [`RequestAuthorizer::authorize`]:
//! block list, allow list (verified callers only), and finally a human prompt.
//! Only one prompt is on screen at a time; waiters queue FIFO on a single
//! permit and give up after the configured timeout.
//!
//! Expired and unsigned requests are not rejected outright. They reach the
//! prompt like any unverified caller, and a warning is logged so the policy
//! can be reviewed.

use openssl::sha::sha256;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::consent_prompt::{ConsentPrompt, PromptAnswer, PromptRequest};
use crate::decision_store::{DecisionList, DecisionStore};
use crate::identity::{IdentityCertificate, SignatureAlgorithm};

/// Allowed clock skew between caller and gateway
pub const VALID_SIGNING_PERIOD_MS: i64 = 15 * 60 * 1000;

pub const DEFAULT_PROMPT_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestVerdict {
    Trusted,
    Expired,
    Unsigned,
}

impl RequestVerdict {
    pub fn description(self) -> &'static str {
        match self {
            RequestVerdict::Trusted => "Valid",
            RequestVerdict::Expired => "Expired Signature",
            RequestVerdict::Unsigned => "Invalid Signature",
        }
    }
}

/// The signed portion of an inbound message, as the caller sent it
#[derive(Debug, Clone, Copy, Default)]
pub struct SignedRequest<'a> {
    pub call: Option<&'a str>,
    pub params: Option<&'a Value>,
    pub timestamp: Option<&'a Value>,
    pub signature: Option<&'a str>,
    pub sign_algorithm: Option<&'a str>,
}

impl SignedRequest<'_> {
    pub fn timestamp_ms(&self) -> i64 {
        timestamp_millis(self.timestamp)
    }
}

/// Epoch milliseconds; numbers and numeric strings are accepted, anything else is 0
pub fn timestamp_millis(timestamp: Option<&Value>) -> i64 {
    match timestamp {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// Compact JSON of the signed fields; absent keys are left out
pub fn canonical_payload(call: Option<&str>, params: Option<&Value>, timestamp: Option<&Value>) -> String {
    let mut fields = Map::new();
    if let Some(call) = call {
        fields.insert("call".to_string(), Value::String(call.to_string()));
    }
    if let Some(params) = params {
        fields.insert("params".to_string(), params.clone());
    }
    if let Some(timestamp) = timestamp {
        fields.insert("timestamp".to_string(), timestamp.clone());
    }
    Value::Object(fields).to_string()
}

/// Exact bytes the caller signed: lowercase hex SHA-256 of the payload
pub fn signing_message(payload: &str) -> String {
    hex::encode(sha256(payload.as_bytes()))
}

pub fn evaluate(identity: &IdentityCertificate, request: &SignedRequest<'_>, now_ms: i64) -> RequestVerdict {
    if identity.is_unknown() {
        return RequestVerdict::Unsigned;
    }
    if (request.timestamp_ms() - now_ms).abs() > VALID_SIGNING_PERIOD_MS {
        warn!("Expired signature on {} from {}", call_label(request), identity);
        return RequestVerdict::Expired;
    }
    let Some(signature) = request.signature.filter(|s| !s.trim().is_empty()) else {
        warn!("Missing signature on {} from {}", call_label(request), identity);
        return RequestVerdict::Unsigned;
    };
    let algorithm = match request.sign_algorithm {
        None => SignatureAlgorithm::default(),
        Some(name) => match name.parse() {
            Ok(algorithm) => algorithm,
            Err(e) => {
                warn!("{:#}", e);
                return RequestVerdict::Unsigned;
            }
        },
    };
    let payload = canonical_payload(request.call, request.params, request.timestamp);
    if identity.verify_signature(signature, &signing_message(&payload), algorithm) {
        debug!("Valid signature from {}", identity.common_name());
        RequestVerdict::Trusted
    } else {
        warn!("Bad signature on {} from {}", call_label(request), identity);
        RequestVerdict::Unsigned
    }
}

fn call_label<'a>(request: &SignedRequest<'a>) -> &'a str {
    request.call.unwrap_or("NONE")
}

#[derive(Debug, Error)]
pub enum AuthorizationError {
    #[error("no consent decision within {0:?}")]
    PromptTimedOut(Duration),
    #[error("consent prompt failed: {0}")]
    PromptFailed(String),
    #[error("consent prompt queue is closed")]
    PermitClosed,
    #[error("connection closed before the consent prompt was shown")]
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationOutcome {
    /// Denied by the block list or the anonymous toggle, no prompt shown
    Blocked,
    /// Approved by the allow list, no prompt shown
    AllowListed,
    Approved,
    Denied,
}

impl AuthorizationOutcome {
    pub fn is_allowed(self) -> bool {
        matches!(self, AuthorizationOutcome::AllowListed | AuthorizationOutcome::Approved)
    }
}

pub struct RequestAuthorizer {
    decisions: Arc<DecisionStore>,
    prompt: Arc<dyn ConsentPrompt>,
    permit: Arc<Semaphore>,
    timeout: Duration,
    block_anonymous: Arc<AtomicBool>,
}

impl RequestAuthorizer {
    pub fn new(decisions: Arc<DecisionStore>, prompt: Arc<dyn ConsentPrompt>, timeout: Duration) -> Self {
        let blocked = decisions.is_blocked(&IdentityCertificate::unknown());
        Self {
            decisions,
            prompt,
            permit: Arc::new(Semaphore::new(1)),
            timeout,
            block_anonymous: Arc::new(AtomicBool::new(blocked)),
        }
    }

    /// Force the anonymous toggle on for this run without persisting it
    pub fn with_block_anonymous(self, block: bool) -> Self {
        if block {
            self.block_anonymous.store(true, Ordering::SeqCst);
        }
        self
    }

    pub fn block_anonymous(&self) -> bool {
        self.block_anonymous.load(Ordering::SeqCst)
    }

    /// Flip the anonymous toggle and record it in the block list
    pub fn set_block_anonymous(&self, block: bool) {
        set_block_anonymous(&self.decisions, &self.block_anonymous, block);
    }

    pub fn decisions(&self) -> &DecisionStore {
        &self.decisions
    }

    /// Decide whether `identity` may perform `action`
    pub async fn authorize(
        &self,
        identity: &IdentityCertificate,
        verdict: RequestVerdict,
        action: &str,
    ) -> Result<AuthorizationOutcome, AuthorizationError> {
        self.authorize_while(identity, verdict, action, || true).await
    }

    /// Like [`authorize`](Self::authorize), for a request whose connection can go away.
    /// `connected` is checked once the prompt permit is held; a dead connection
    /// releases the permit without prompting.
    pub async fn authorize_while<F>(
        &self,
        identity: &IdentityCertificate,
        verdict: RequestVerdict,
        action: &str,
        connected: F,
    ) -> Result<AuthorizationOutcome, AuthorizationError>
    where
        F: Fn() -> bool,
    {
        if identity.is_unknown() && self.block_anonymous() {
            info!("Blocked anonymous request to {}", action);
            return Ok(AuthorizationOutcome::Blocked);
        }
        if self.decisions.is_blocked(identity) {
            info!("Blocked {} to {} (block list)", identity, action);
            return Ok(AuthorizationOutcome::Blocked);
        }
        let verified = identity.is_trusted() && verdict == RequestVerdict::Trusted;
        if verified && self.decisions.is_allowed(identity) {
            debug!("Allowed {} to {} (allow list)", identity, action);
            return Ok(AuthorizationOutcome::AllowListed);
        }
        if verdict != RequestVerdict::Trusted && !identity.is_unknown() {
            warn!(
                "{} request from {} routed to consent prompt instead of being rejected",
                verdict.description(),
                identity
            );
        }

        let deadline = Instant::now() + self.timeout;
        let permit = match timeout_at(deadline, self.permit.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(AuthorizationError::PermitClosed),
            Err(_) => return Err(AuthorizationError::PromptTimedOut(self.timeout)),
        };
        if !connected() {
            debug!("Dropping prompt to {} for {}: connection closed", action, identity);
            return Err(AuthorizationError::Abandoned);
        }

        let request = PromptRequest {
            identity: identity.clone(),
            verdict,
            action: action.to_string(),
        };
        let prompt = self.prompt.clone();
        let decisions = self.decisions.clone();
        let block_anonymous = self.block_anonymous.clone();

        // The permit moves into the task: an abandoned prompt keeps it until answered.
        let task = tokio::task::spawn_blocking(move || {
            let answer = prompt.ask(&request);
            if let Ok(answer) = &answer {
                log_answer(&request, *answer);
                remember(&decisions, &block_anonymous, &request.identity, verified, *answer);
            }
            drop(permit);
            answer
        });

        match timeout_at(deadline, task).await {
            Ok(Ok(Ok(answer))) if answer.approved => Ok(AuthorizationOutcome::Approved),
            Ok(Ok(Ok(_))) => Ok(AuthorizationOutcome::Denied),
            Ok(Ok(Err(e))) => Err(AuthorizationError::PromptFailed(format!("{:#}", e))),
            Ok(Err(e)) => Err(AuthorizationError::PromptFailed(e.to_string())),
            Err(_) => {
                warn!("Consent prompt for {} timed out after {:?}", identity, self.timeout);
                Err(AuthorizationError::PromptTimedOut(self.timeout))
            }
        }
    }
}

fn log_answer(request: &PromptRequest, answer: PromptAnswer) {
    if answer.approved {
        info!("Allowed {} to {}", request.identity.common_name(), request.action);
    } else {
        info!("Denied {} to {}", request.identity.common_name(), request.action);
    }
}

/// Persist a remembered answer; write failures only cost the persistence
fn remember(
    decisions: &DecisionStore,
    block_anonymous: &AtomicBool,
    identity: &IdentityCertificate,
    verified: bool,
    answer: PromptAnswer,
) {
    if !answer.remember {
        return;
    }
    if answer.approved {
        if !verified {
            info!("Not remembering approval for unverified {}; allowed once", identity);
            return;
        }
        if let Err(e) = decisions.remember(DecisionList::Allow, identity) {
            warn!("Approval for {} will not survive a restart: {:#}", identity, e);
        }
    } else if identity.is_unknown() {
        set_block_anonymous(decisions, block_anonymous, true);
    } else if let Err(e) = decisions.remember(DecisionList::Block, identity) {
        warn!("Block of {} will not survive a restart: {:#}", identity, e);
    }
}

fn set_block_anonymous(decisions: &DecisionStore, flag: &AtomicBool, block: bool) {
    flag.store(block, Ordering::SeqCst);
    let unknown = IdentityCertificate::unknown();
    let result = if block {
        decisions.remember(DecisionList::Block, &unknown)
    } else {
        decisions.forget(DecisionList::Block, unknown.fingerprint()).map(|_| ())
    };
    match result {
        Ok(()) => info!("Anonymous requests are now {}", if block { "blocked" } else { "allowed to prompt" }),
        Err(e) => warn!("Anonymous toggle will not survive a restart: {:#}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::test_support::Vendor;
    use anyhow::Result;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Instant as StdInstant;
    use tempfile::TempDir;

    const NOW: i64 = 1_700_000_000_000;

    /// Answers with a fixed decision, recording when each prompt was open
    struct ScriptedPrompt {
        answer: PromptAnswer,
        hold: Duration,
        opened: Mutex<Vec<(StdInstant, StdInstant)>>,
    }

    impl ScriptedPrompt {
        fn new(answer: PromptAnswer) -> Arc<Self> {
            Self::slow(answer, Duration::ZERO)
        }

        fn slow(answer: PromptAnswer, hold: Duration) -> Arc<Self> {
            Arc::new(Self {
                answer,
                hold,
                opened: Mutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.opened.lock().unwrap().len()
        }
    }

    impl ConsentPrompt for ScriptedPrompt {
        fn ask(&self, _request: &PromptRequest) -> Result<PromptAnswer> {
            let start = StdInstant::now();
            std::thread::sleep(self.hold);
            self.opened.lock().unwrap().push((start, StdInstant::now()));
            Ok(self.answer)
        }
    }

    const ALWAYS: PromptAnswer = PromptAnswer { approved: true, remember: true };
    const BLOCK: PromptAnswer = PromptAnswer { approved: false, remember: true };
    const ONCE: PromptAnswer = PromptAnswer { approved: true, remember: false };

    fn authorizer(dir: &TempDir, prompt: Arc<ScriptedPrompt>) -> RequestAuthorizer {
        RequestAuthorizer::new(
            Arc::new(DecisionStore::new(dir.path())),
            prompt,
            Duration::from_secs(5),
        )
    }

    /// Sign like a browser client: hash the stringified payload, then sign the hex digest
    fn client_sign(vendor: &Vendor, payload: &str, algorithm: SignatureAlgorithm) -> String {
        vendor.sign(&signing_message(payload), algorithm)
    }

    fn signed(vendor: &Vendor, params: &Value, timestamp: i64) -> (String, Value) {
        let timestamp = json!(timestamp);
        let payload = canonical_payload(Some("print"), Some(params), Some(&timestamp));
        (client_sign(vendor, &payload, SignatureAlgorithm::Sha1), timestamp)
    }

    #[test]
    fn test_evaluate_signature_and_window() {
        let vendor = Vendor::new("shop.example.com");
        let identity = vendor.identity();
        let params = json!({ "printer": { "name": "Zebra" } });

        let (signature, ts) = signed(&vendor, &params, NOW);
        let request = SignedRequest {
            call: Some("print"),
            params: Some(&params),
            timestamp: Some(&ts),
            signature: Some(&signature),
            sign_algorithm: None,
        };
        assert_eq!(evaluate(&identity, &request, NOW), RequestVerdict::Trusted);
        assert_eq!(evaluate(&identity, &request, NOW + VALID_SIGNING_PERIOD_MS), RequestVerdict::Trusted);

        for skew in [VALID_SIGNING_PERIOD_MS + 1, -(VALID_SIGNING_PERIOD_MS + 1)] {
            let (stale_sig, stale_ts) = signed(&vendor, &params, NOW + skew);
            let stale = SignedRequest {
                timestamp: Some(&stale_ts),
                signature: Some(&stale_sig),
                ..request
            };
            assert_eq!(evaluate(&identity, &stale, NOW), RequestVerdict::Expired);
        }

        let tampered_params = json!({ "printer": { "name": "Other" } });
        let tampered = SignedRequest {
            params: Some(&tampered_params),
            ..request
        };
        assert_eq!(evaluate(&identity, &tampered, NOW), RequestVerdict::Unsigned);

        let unsigned = SignedRequest { signature: None, ..request };
        assert_eq!(evaluate(&identity, &unsigned, NOW), RequestVerdict::Unsigned);

        let bad_algorithm = SignedRequest {
            sign_algorithm: Some("MD5"),
            ..request
        };
        assert_eq!(evaluate(&identity, &bad_algorithm, NOW), RequestVerdict::Unsigned);
        assert_eq!(evaluate(&IdentityCertificate::unknown(), &request, NOW), RequestVerdict::Unsigned);
    }

    #[test]
    fn test_canonical_payload_field_order() {
        let timestamp = json!(5);
        assert_eq!(
            canonical_payload(Some("printers.find"), Some(&json!({ "query": "zebra" })), Some(&timestamp)),
            r#"{"call":"printers.find","params":{"query":"zebra"},"timestamp":5}"#
        );
        assert_eq!(
            canonical_payload(Some("getVersion"), None, Some(&timestamp)),
            r#"{"call":"getVersion","timestamp":5}"#
        );
    }

    #[test]
    fn test_signing_message_is_hex_sha256() {
        assert_eq!(
            signing_message(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_client_signed_request_verifies() {
        let vendor = Vendor::new("shop.example.com");
        let identity = vendor.identity();
        let timestamp = json!(NOW);
        let payload = r#"{"call":"printers.find","params":{"query":"zebra"},"timestamp":1700000000000}"#;
        let params = json!({ "query": "zebra" });

        for algorithm in [SignatureAlgorithm::Sha1, SignatureAlgorithm::Sha256, SignatureAlgorithm::Sha512] {
            let signature = client_sign(&vendor, payload, algorithm);
            let name = format!("{:?}", algorithm).to_uppercase();
            let request = SignedRequest {
                call: Some("printers.find"),
                params: Some(&params),
                timestamp: Some(&timestamp),
                signature: Some(&signature),
                sign_algorithm: Some(&name),
            };
            assert_eq!(evaluate(&identity, &request, NOW), RequestVerdict::Trusted, "{}", name);
        }

        // signing the raw payload instead of its digest does not verify
        let raw = vendor.sign(payload, SignatureAlgorithm::Sha1);
        let request = SignedRequest {
            call: Some("printers.find"),
            params: Some(&params),
            timestamp: Some(&timestamp),
            signature: Some(&raw),
            sign_algorithm: None,
        };
        assert_eq!(evaluate(&identity, &request, NOW), RequestVerdict::Unsigned);
    }

    #[test]
    fn test_signed_call_without_params_verifies() {
        let vendor = Vendor::new("shop.example.com");
        let identity = vendor.identity();
        let timestamp = json!(NOW);
        let signature = client_sign(
            &vendor,
            r#"{"call":"getVersion","timestamp":1700000000000}"#,
            SignatureAlgorithm::Sha1,
        );
        let request = SignedRequest {
            call: Some("getVersion"),
            params: None,
            timestamp: Some(&timestamp),
            signature: Some(&signature),
            sign_algorithm: None,
        };
        assert_eq!(evaluate(&identity, &request, NOW), RequestVerdict::Trusted);

        let empty = json!({});
        let padded = SignedRequest {
            params: Some(&empty),
            ..request
        };
        assert_eq!(evaluate(&identity, &padded, NOW), RequestVerdict::Unsigned);
    }

    #[tokio::test]
    async fn test_allow_list_skips_prompt_for_verified_caller() {
        let dir = TempDir::new().unwrap();
        let prompt = ScriptedPrompt::new(PromptAnswer::DENY);
        let auth = authorizer(&dir, prompt.clone());
        let identity = Vendor::new("shop.example.com").identity();
        auth.decisions().remember(DecisionList::Allow, &identity).unwrap();

        let outcome = auth.authorize(&identity, RequestVerdict::Trusted, "print to Zebra").await.unwrap();
        assert_eq!(outcome, AuthorizationOutcome::AllowListed);
        assert_eq!(prompt.count(), 0);

        // an expired signature is not verified, so the allow list does not apply
        let outcome = auth.authorize(&identity, RequestVerdict::Expired, "print to Zebra").await.unwrap();
        assert_eq!(outcome, AuthorizationOutcome::Denied);
        assert_eq!(prompt.count(), 1);
    }

    #[tokio::test]
    async fn test_block_list_denies_without_prompt() {
        let dir = TempDir::new().unwrap();
        let prompt = ScriptedPrompt::new(ONCE);
        let auth = authorizer(&dir, prompt.clone());
        let identity = Vendor::new("shop.example.com").identity();
        auth.decisions().remember(DecisionList::Block, &identity).unwrap();

        for verdict in [RequestVerdict::Trusted, RequestVerdict::Unsigned] {
            let outcome = auth.authorize(&identity, verdict, "open a serial port").await.unwrap();
            assert_eq!(outcome, AuthorizationOutcome::Blocked);
        }
        assert_eq!(prompt.count(), 0);
    }

    #[tokio::test]
    async fn test_remembered_approval_is_used_next_time() {
        let dir = TempDir::new().unwrap();
        let prompt = ScriptedPrompt::new(ALWAYS);
        let auth = authorizer(&dir, prompt.clone());
        let identity = Vendor::new("shop.example.com").identity();

        let first = auth.authorize(&identity, RequestVerdict::Trusted, "access USB devices").await.unwrap();
        let second = auth.authorize(&identity, RequestVerdict::Trusted, "access USB devices").await.unwrap();
        assert_eq!(first, AuthorizationOutcome::Approved);
        assert_eq!(second, AuthorizationOutcome::AllowListed);
        assert_eq!(prompt.count(), 1);
    }

    #[tokio::test]
    async fn test_unverified_approval_is_not_remembered() {
        let dir = TempDir::new().unwrap();
        let prompt = ScriptedPrompt::new(ALWAYS);
        let auth = authorizer(&dir, prompt.clone());
        let identity = Vendor::new("shop.example.com").identity();

        auth.authorize(&identity, RequestVerdict::Unsigned, "view the filesystem").await.unwrap();
        assert!(!auth.decisions().is_allowed(&identity));
    }

    #[tokio::test]
    async fn test_blocking_anonymous_flips_toggle() {
        let dir = TempDir::new().unwrap();
        let prompt = ScriptedPrompt::new(BLOCK);
        let auth = authorizer(&dir, prompt.clone());
        let anonymous = IdentityCertificate::unknown();

        let first = auth.authorize(&anonymous, RequestVerdict::Unsigned, "access connected printers").await.unwrap();
        assert_eq!(first, AuthorizationOutcome::Denied);
        assert!(auth.block_anonymous());

        let second = auth.authorize(&anonymous, RequestVerdict::Unsigned, "access connected printers").await.unwrap();
        assert_eq!(second, AuthorizationOutcome::Blocked);
        assert_eq!(prompt.count(), 1);

        // the toggle is persisted through the block list
        let reloaded = authorizer(&dir, ScriptedPrompt::new(ONCE));
        assert!(reloaded.block_anonymous());
        reloaded.set_block_anonymous(false);
        assert!(!authorizer(&dir, ScriptedPrompt::new(ONCE)).block_anonymous());
    }

    #[tokio::test]
    async fn test_configured_anonymous_block() {
        let dir = TempDir::new().unwrap();
        let prompt = ScriptedPrompt::new(ONCE);
        let auth = authorizer(&dir, prompt.clone()).with_block_anonymous(true);
        let outcome = auth
            .authorize(&IdentityCertificate::unknown(), RequestVerdict::Unsigned, "print to Zebra")
            .await
            .unwrap();
        assert_eq!(outcome, AuthorizationOutcome::Blocked);
        assert_eq!(prompt.count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_prompts_never_overlap() {
        let dir = TempDir::new().unwrap();
        let prompt = ScriptedPrompt::slow(ONCE, Duration::from_millis(150));
        let auth = Arc::new(authorizer(&dir, prompt.clone()));

        let tasks: Vec<_> = ["first.example.com", "second.example.com"]
            .into_iter()
            .map(|site| {
                let auth = auth.clone();
                let identity = Vendor::new(site).identity();
                tokio::spawn(async move {
                    auth.authorize(&identity, RequestVerdict::Trusted, "access connected printers").await
                })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), AuthorizationOutcome::Approved);
        }

        let mut opened = prompt.opened.lock().unwrap().clone();
        opened.sort();
        assert_eq!(opened.len(), 2);
        assert!(opened[1].0 >= opened[0].1, "second prompt opened before the first closed");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_queued_request_for_closed_connection_is_not_prompted() {
        let dir = TempDir::new().unwrap();
        let prompt = ScriptedPrompt::slow(ONCE, Duration::from_millis(400));
        let auth = Arc::new(authorizer(&dir, prompt.clone()));
        let live = Arc::new(AtomicBool::new(true));
        let first_site = Vendor::new("first.example.com").identity();
        let second_site = Vendor::new("second.example.com").identity();

        let first = {
            let auth = auth.clone();
            let identity = first_site;
            tokio::spawn(async move {
                auth.authorize(&identity, RequestVerdict::Trusted, "access connected printers").await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let queued = {
            let auth = auth.clone();
            let live = live.clone();
            let identity = second_site;
            tokio::spawn(async move {
                auth.authorize_while(&identity, RequestVerdict::Trusted, "open a serial port", || {
                    live.load(Ordering::SeqCst)
                })
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        live.store(false, Ordering::SeqCst);

        assert_eq!(first.await.unwrap().unwrap(), AuthorizationOutcome::Approved);
        assert!(matches!(queued.await.unwrap(), Err(AuthorizationError::Abandoned)));
        assert_eq!(prompt.count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unanswered_prompt_times_out() {
        let dir = TempDir::new().unwrap();
        let prompt = ScriptedPrompt::slow(ONCE, Duration::from_millis(500));
        let auth = RequestAuthorizer::new(
            Arc::new(DecisionStore::new(dir.path())),
            prompt,
            Duration::from_millis(50),
        );
        let identity = Vendor::new("shop.example.com").identity();
        let err = auth
            .authorize(&identity, RequestVerdict::Trusted, "print to Zebra")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthorizationError::PromptTimedOut(_)));
    }
}
