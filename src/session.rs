//! Remote Session Manager
//!
//! Owns the process-wide cache of Colab runtime sessions, one slot per
//! accelerator kind. Acquisition reuses a cached session when its kernel
//! still answers a liveness probe, and otherwise provisions a fresh runtime:
//! assign on the control plane, then poll the Jupyter proxy until the kernel
//! comes up, bounded by a creation ceiling and paced by exponential backoff.
//!
//! Lifecycle of a session:
//! `Requested -> Provisioning -> Ready -> (InUse <-> Idle) -> Terminated`.
//! Termination (explicit discard, remote failure, or a failed probe) drops
//! the cached entry so the next acquisition starts fresh.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::auth::AuthFlow;
use crate::backoff::Backoff;
use crate::colab::{Accelerator, ProxyInfo, RuntimeApi};
use crate::config::{BusyPolicy, Config};
use crate::error::BridgeError;

/// Lifecycle state of a runtime session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Requested,
    Provisioning,
    Ready,
    InUse,
    Idle,
    Terminated,
}

/// A provisioned Colab runtime with a live kernel.
#[derive(Debug)]
pub struct ColabSession {
    /// Opaque runtime id; doubles as the session id
    pub endpoint: String,
    pub accelerator: Accelerator,
    pub proxy: ProxyInfo,
    pub kernel_id: String,
    pub state: SessionState,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_used_at: chrono::DateTime<chrono::Utc>,
    /// Set when an interrupt could not be delivered; forces a re-probe on
    /// the next acquisition.
    pub suspect: bool,
    keepalive: Option<JoinHandle<()>>,
}

impl ColabSession {
    pub fn id(&self) -> &str {
        &self.endpoint
    }

    pub fn touch(&mut self) {
        self.last_used_at = chrono::Utc::now();
    }

    fn stop_keepalive(&mut self) {
        if let Some(handle) = self.keepalive.take() {
            handle.abort();
        }
    }
}

#[derive(Default)]
struct Slot {
    session: Option<ColabSession>,
}

/// Exclusive access to one accelerator's session for the duration of an
/// operation. Dropping the handle returns the session to the registry as
/// `Idle`; `discard` terminates it instead.
pub struct SessionHandle {
    slot: OwnedMutexGuard<Slot>,
    session: Option<ColabSession>,
    registry: SessionRegistry,
}

impl SessionHandle {
    pub fn session(&self) -> &ColabSession {
        self.session.as_ref().expect("session present until drop")
    }

    pub fn session_mut(&mut self) -> &mut ColabSession {
        self.session.as_mut().expect("session present until drop")
    }

    /// Terminate the session: the slot is left empty and the runtime is
    /// released in the background.
    pub fn discard(mut self) {
        if let Some(session) = self.session.take() {
            self.registry.terminate(session);
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.state = SessionState::Idle;
            session.touch();
            debug!("Session {} returned to idle", session.endpoint);
            self.slot.session = Some(session);
        }
    }
}

/// Process-wide session cache, keyed by accelerator kind.
///
/// Operations against the same kind serialize through the slot mutex;
/// different kinds proceed independently.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    api: Arc<dyn RuntimeApi>,
    auth: Arc<AuthFlow>,
    config: Config,
    slots: std::sync::Mutex<HashMap<Accelerator, Arc<Mutex<Slot>>>>,
}

impl SessionRegistry {
    pub fn new(api: Arc<dyn RuntimeApi>, auth: Arc<AuthFlow>, config: Config) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                api,
                auth,
                config,
                slots: std::sync::Mutex::new(HashMap::new()),
            }),
        }
    }

    fn slot(&self, kind: Accelerator) -> Arc<Mutex<Slot>> {
        let mut slots = self.inner.slots.lock().expect("slot map poisoned");
        slots.entry(kind).or_default().clone()
    }

    /// Acquire the session for an accelerator kind, provisioning one if
    /// needed. With the `reject` busy policy a held slot fails fast with
    /// `SessionBusy`; the default policy queues behind the current holder.
    pub async fn acquire(&self, kind: Accelerator) -> Result<SessionHandle, BridgeError> {
        let slot = self.slot(kind);
        let mut guard = match self.inner.config.busy_policy {
            BusyPolicy::Queue => slot.lock_owned().await,
            BusyPolicy::Reject => slot
                .try_lock_owned()
                .map_err(|_| BridgeError::SessionBusy)?,
        };

        if let Some(mut session) = guard.session.take() {
            let alive = self
                .inner
                .api
                .probe_kernel(&session.proxy, &session.kernel_id)
                .await
                .unwrap_or(false);
            if alive {
                if session.suspect {
                    debug!("Suspect {} session {} answered probe, clearing flag", kind, session.endpoint);
                }
                debug!("Reusing {} session {}", kind, session.endpoint);
                session.state = SessionState::InUse;
                session.suspect = false;
                session.touch();
                return Ok(SessionHandle {
                    slot: guard,
                    session: Some(session),
                    registry: self.clone(),
                });
            }
            info!("Cached {} session {} no longer alive, discarding", kind, session.endpoint);
            self.terminate(session);
        }

        let session = self.provision(kind).await?;
        Ok(SessionHandle {
            slot: guard,
            session: Some(session),
            registry: self.clone(),
        })
    }

    /// Allocate a runtime and wait for its kernel, bounded by the creation
    /// ceiling.
    async fn provision(&self, kind: Accelerator) -> Result<ColabSession, BridgeError> {
        debug!("Session requested for {}", kind);
        let cred = self.inner.auth.obtain_credential().await?;
        let token = cred.access_token;

        let assignment = self.inner.api.assign_runtime(&token, kind).await?;
        debug!(
            "Runtime {} assigned (reused={}), provisioning kernel",
            assignment.endpoint, assignment.reused
        );

        let deadline = Instant::now() + self.inner.config.session_create_timeout;
        let mut backoff = Backoff::provisioning();
        let mut attempt = 0u32;
        let kernel_id = loop {
            attempt += 1;
            match self.inner.api.create_kernel(&assignment.proxy).await {
                Ok(id) => break id,
                Err(e) => {
                    let delay = backoff.next_delay();
                    if Instant::now() + delay >= deadline {
                        warn!(
                            "Gave up waiting for {} runtime after {} attempts: {}",
                            kind, attempt, e
                        );
                        return Err(BridgeError::SessionTimeout);
                    }
                    debug!("Runtime not ready (attempt {}): {}", attempt, e);
                    tokio::time::sleep(delay).await;
                }
            }
        };
        info!("Kernel ready on {}: {}", assignment.endpoint, kernel_id);

        let keepalive = self.spawn_keepalive(token, assignment.endpoint.clone());
        let now = chrono::Utc::now();
        Ok(ColabSession {
            endpoint: assignment.endpoint,
            accelerator: kind,
            proxy: assignment.proxy,
            kernel_id,
            state: SessionState::InUse,
            created_at: now,
            last_used_at: now,
            suspect: false,
            keepalive: Some(keepalive),
        })
    }

    fn spawn_keepalive(&self, token: String, endpoint: String) -> JoinHandle<()> {
        let api = self.inner.api.clone();
        let interval = self.inner.config.keepalive_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                if let Err(e) = api.keep_alive(&token, &endpoint).await {
                    debug!("Keep-alive for {} failed: {}", endpoint, e);
                }
            }
        })
    }

    /// Terminate a session: stop its keep-alive and release the runtime in
    /// the background with whatever cached token is still valid.
    fn terminate(&self, mut session: ColabSession) {
        session.stop_keepalive();
        session.state = SessionState::Terminated;
        let endpoint = session.endpoint.clone();
        let api = self.inner.api.clone();
        let token = self.inner.auth.cached_access_token();
        tokio::spawn(async move {
            if let Some(token) = token {
                if let Err(e) = api.unassign_runtime(&token, &endpoint).await {
                    warn!("Failed to unassign runtime {}: {}", endpoint, e);
                }
            } else {
                debug!("No valid token cached; leaving runtime {} to expire", endpoint);
            }
        });
    }

    /// Release every cached runtime. Called on server shutdown.
    pub async fn shutdown(&self) {
        let slots: Vec<_> = {
            let map = self.inner.slots.lock().expect("slot map poisoned");
            map.values().cloned().collect()
        };
        for slot in slots {
            let mut guard = slot.lock().await;
            if let Some(mut session) = guard.session.take() {
                session.stop_keepalive();
                session.state = SessionState::Terminated;
                if let Some(token) = self.inner.auth.cached_access_token() {
                    if let Err(e) = self
                        .inner
                        .api
                        .unassign_runtime(&token, &session.endpoint)
                        .await
                    {
                        warn!("Failed to unassign runtime {}: {}", session.endpoint, e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::colab::RuntimeAssignment;
    use crate::credentials::{Credential, CredentialStore};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    /// Scripted remote: counts assignments, serves a configurable number of
    /// not-ready polls before the kernel appears, and lets tests kill the
    /// kernel between acquisitions.
    struct ScriptedApi {
        assigns: AtomicUsize,
        kernel_polls_until_ready: AtomicUsize,
        alive: AtomicBool,
        never_ready: bool,
    }

    impl ScriptedApi {
        fn ready() -> Self {
            Self {
                assigns: AtomicUsize::new(0),
                kernel_polls_until_ready: AtomicUsize::new(0),
                alive: AtomicBool::new(true),
                never_ready: false,
            }
        }

        fn slow(polls: usize) -> Self {
            Self {
                kernel_polls_until_ready: AtomicUsize::new(polls),
                ..Self::ready()
            }
        }

        fn never_ready() -> Self {
            Self {
                never_ready: true,
                ..Self::ready()
            }
        }
    }

    #[async_trait]
    impl RuntimeApi for ScriptedApi {
        async fn assign_runtime(
            &self,
            _token: &str,
            accelerator: Accelerator,
        ) -> Result<RuntimeAssignment, BridgeError> {
            let n = self.assigns.fetch_add(1, Ordering::SeqCst);
            Ok(RuntimeAssignment {
                endpoint: format!("m-s-{}-{}", accelerator.as_str().to_lowercase(), n),
                proxy: ProxyInfo {
                    url: "https://proxy.test".into(),
                    token: "pt".into(),
                },
                reused: false,
            })
        }

        async fn unassign_runtime(&self, _token: &str, _endpoint: &str) -> Result<(), BridgeError> {
            Ok(())
        }

        async fn keep_alive(&self, _token: &str, _endpoint: &str) -> Result<(), BridgeError> {
            Ok(())
        }

        async fn create_kernel(&self, _proxy: &ProxyInfo) -> Result<String, BridgeError> {
            if self.never_ready {
                return Err(BridgeError::remote("proxy not up yet"));
            }
            let remaining = self.kernel_polls_until_ready.load(Ordering::SeqCst);
            if remaining > 0 {
                self.kernel_polls_until_ready
                    .store(remaining - 1, Ordering::SeqCst);
                return Err(BridgeError::remote("proxy not up yet"));
            }
            Ok("kernel-1".into())
        }

        async fn probe_kernel(
            &self,
            _proxy: &ProxyInfo,
            _kernel_id: &str,
        ) -> Result<bool, BridgeError> {
            Ok(self.alive.load(Ordering::SeqCst))
        }

        async fn interrupt_kernel(
            &self,
            _proxy: &ProxyInfo,
            _kernel_id: &str,
        ) -> Result<(), BridgeError> {
            Ok(())
        }

        async fn download_file(
            &self,
            _proxy: &ProxyInfo,
            _path: &str,
        ) -> Result<Vec<u8>, BridgeError> {
            Ok(vec![])
        }

        async fn propagate_credentials(
            &self,
            _token: &str,
            _endpoint: &str,
            _auth_type: &str,
            _dry_run: bool,
        ) -> Result<Value, BridgeError> {
            Ok(serde_json::json!({"success": true}))
        }
    }

    fn expect_err(result: Result<SessionHandle, BridgeError>) -> BridgeError {
        match result {
            Err(e) => e,
            Ok(handle) => panic!("expected an error, got session {}", handle.session().id()),
        }
    }

    fn test_registry(api: Arc<ScriptedApi>, busy_policy: BusyPolicy) -> SessionRegistry {
        let dir = std::env::temp_dir().join(format!("colab-exec-test-{}", uuid::Uuid::new_v4()));
        let store = CredentialStore::new(dir.join("token.json"));
        store
            .save(&Credential::new("tok".into(), "ref".into(), 3600, vec![]))
            .unwrap();
        let auth = AuthFlow::new(store, Duration::from_secs(1));
        let config = Config {
            token_path: dir.join("token.json"),
            consent_timeout: Duration::from_secs(1),
            session_create_timeout: Duration::from_secs(30),
            default_exec_timeout: Duration::from_secs(300),
            keepalive_interval: Duration::from_secs(60),
            busy_policy,
        };
        SessionRegistry::new(api, auth, config)
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_acquires_reuse_the_session() {
        let api = Arc::new(ScriptedApi::ready());
        let registry = test_registry(api.clone(), BusyPolicy::Queue);

        let first = registry.acquire(Accelerator::T4).await.unwrap();
        let id = first.session().id().to_string();
        drop(first);

        let second = registry.acquire(Accelerator::T4).await.unwrap();
        assert_eq!(second.session().id(), id);
        assert_eq!(api.assigns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn kind_switch_provisions_a_distinct_session() {
        let api = Arc::new(ScriptedApi::ready());
        let registry = test_registry(api.clone(), BusyPolicy::Queue);

        let t4 = registry.acquire(Accelerator::T4).await.unwrap();
        let t4_id = t4.session().id().to_string();
        drop(t4);

        let l4 = registry.acquire(Accelerator::L4).await.unwrap();
        assert_ne!(l4.session().id(), t4_id);
        assert_eq!(l4.session().accelerator, Accelerator::L4);
        assert_eq!(api.assigns.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_session_is_replaced() {
        let api = Arc::new(ScriptedApi::ready());
        let registry = test_registry(api.clone(), BusyPolicy::Queue);

        let first = registry.acquire(Accelerator::T4).await.unwrap();
        let id = first.session().id().to_string();
        drop(first);

        api.alive.store(false, Ordering::SeqCst);
        let second = registry.acquire(Accelerator::T4).await.unwrap();
        assert_ne!(second.session().id(), id);
        assert_eq!(api.assigns.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_provisioning_is_polled_until_ready() {
        let api = Arc::new(ScriptedApi::slow(3));
        let registry = test_registry(api.clone(), BusyPolicy::Queue);

        let handle = registry.acquire(Accelerator::T4).await.unwrap();
        assert_eq!(handle.session().kernel_id, "kernel-1");
        assert_eq!(handle.session().state, SessionState::InUse);
    }

    #[tokio::test(start_paused = true)]
    async fn provisioning_ceiling_yields_session_timeout() {
        let api = Arc::new(ScriptedApi::never_ready());
        let registry = test_registry(api, BusyPolicy::Queue);

        let err = expect_err(registry.acquire(Accelerator::T4).await);
        assert!(matches!(err, BridgeError::SessionTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn reject_policy_fails_fast_when_slot_is_held() {
        let api = Arc::new(ScriptedApi::ready());
        let registry = test_registry(api, BusyPolicy::Reject);

        let held = registry.acquire(Accelerator::T4).await.unwrap();
        let err = expect_err(registry.acquire(Accelerator::T4).await);
        assert!(matches!(err, BridgeError::SessionBusy));
        drop(held);

        assert!(registry.acquire(Accelerator::T4).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn queue_policy_waits_for_the_holder() {
        let api = Arc::new(ScriptedApi::ready());
        let registry = test_registry(api, BusyPolicy::Queue);

        let held = registry.acquire(Accelerator::T4).await.unwrap();
        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.acquire(Accelerator::T4).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let second = waiter.await.unwrap().unwrap();
        assert_eq!(second.session().state, SessionState::InUse);
    }
}
