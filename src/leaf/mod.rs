//! The leaf-certificate cache entry.
//!
//! A fetch against this entry either mints a brand-new certificate or
//! camps on the current one, waking when the caller's poll times out,
//! when the jittered renewal target arrives, or when the cluster's
//! active signing root changes. Root-change renewals are staggered and
//! the chosen deadline is persisted in [`FetchState`] so it survives
//! into the caller's next poll.

pub mod crypto;
pub mod policy;

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::cache::{
    BoxError, CacheEntry, CacheRequest, CacheValue, EntryState, FetchOptions, FetchResult,
    RequestInfo,
};
use crate::identity::SpiffeId;
use crate::roots::{RootsCache, RootsEvent};
use crate::signer::{CertSigner, SignError, SignRequest};
use crypto::CryptoError;

/// Registration name of the leaf cache type.
pub const LEAF_TYPE_NAME: &str = "mesh-leaf";

/// Jitter applied after noticing a root rotation, before requesting a
/// new cert. The cluster size is unknown at this layer, so the value is
/// a tradeoff between rotation latency on small clusters and signing
/// load on large ones; server-side CSR rate limiting absorbs the rest.
const CA_CHANGE_INITIAL_JITTER: Duration = Duration::from_secs(20);

/// A certificate issued to one service identity. Immutable once minted.
///
/// Validity bounds are projected onto the monotonic clock when the cert
/// is parsed, so renewal math never re-reads the wall clock.
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedCert {
    pub cert_pem: String,
    pub private_key_pem: String,
    pub spiffe_id: SpiffeId,
    pub valid_after: Instant,
    pub valid_before: Instant,
    /// Monotone index assigned by the signing service.
    pub modify_index: u64,
}

/// Per-entry metadata round-tripped through the cache framework.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchState {
    /// Hex key ID of the root that signed the current cert. Saved at
    /// generation time so root-change checks avoid re-parsing the cert.
    pub authority_key_id: String,
    /// Renewal deadline committed after a root rotation. Only a
    /// successful generation clears it.
    pub force_expire_after: Option<Instant>,
}

/// Cache key for leaf lookups. Distinct (token, datacenter, service)
/// triples are distinct entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeafRequest {
    pub service: String,
    pub datacenter: String,
    pub token: String,
    pub min_index: u64,
}

impl CacheRequest for LeafRequest {
    fn cache_info(&self) -> RequestInfo {
        RequestInfo {
            key: self.service.clone(),
            token: self.token.clone(),
            datacenter: self.datacenter.clone(),
            min_index: self.min_index,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Error)]
pub enum LeafError {
    #[error("internal cache failure: {context}")]
    Internal { context: &'static str },
    #[error("cluster has no signing authority bootstrapped yet")]
    NotBootstrapped,
    #[error(transparent)]
    Roots(#[from] crate::roots::RootsError),
    #[error("certificate signing failed: {details}")]
    Signing { details: String },
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl From<SignError> for LeafError {
    fn from(err: SignError) -> Self {
        LeafError::Signing {
            details: err.details,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LeafCacheConfig {
    pub datacenter: String,
    pub ca_change_initial_jitter: Duration,
}

impl LeafCacheConfig {
    pub fn new(datacenter: impl Into<String>) -> Self {
        Self {
            datacenter: datacenter.into(),
            ca_change_initial_jitter: CA_CHANGE_INITIAL_JITTER,
        }
    }

    pub fn ca_change_initial_jitter(mut self, jitter: Duration) -> Self {
        self.ca_change_initial_jitter = jitter;
        self
    }
}

struct RootWatch {
    subscribers: HashMap<u64, mpsc::Sender<()>>,
    next_id: u64,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

/// The leaf cache entry. One instance serves every (token, datacenter,
/// service) entry the framework routes here; the per-entry pieces live
/// in the value/state round-tripped through [`FetchOptions`].
pub struct LeafCache {
    roots: Arc<dyn RootsCache>,
    signer: Arc<dyn CertSigner>,
    config: LeafCacheConfig,
    root_watch: Arc<Mutex<RootWatch>>,
}

impl LeafCache {
    pub fn new(
        roots: Arc<dyn RootsCache>,
        signer: Arc<dyn CertSigner>,
        config: LeafCacheConfig,
    ) -> Self {
        Self {
            roots,
            signer,
            config,
            root_watch: Arc::new(Mutex::new(RootWatch {
                subscribers: HashMap::new(),
                next_id: 0,
                shutdown: None,
                task: None,
            })),
        }
    }

    /// Long-poll fetch of the leaf for `req`.
    ///
    /// Returns promptly when the certificate changes materially and
    /// otherwise blocks up to `opts.timeout` before handing back the
    /// current value unchanged. See [`CacheEntry::fetch`] for the error
    /// contract.
    pub async fn fetch(
        &self,
        opts: FetchOptions,
        req: &LeafRequest,
    ) -> Result<FetchResult, LeafError> {
        let (existing, mut state) = take_last_result(opts.last_result, req)?;

        // Brand-new entry: nothing to wait on.
        let Some(existing) = existing else {
            return self.generate_new_leaf(req, state).await;
        };

        let now = Instant::now();
        let mut expires_at = policy::pick_renewal_target(now, &existing);

        // A root rotation observed by an earlier poll may have committed
        // an earlier deadline.
        if let Some(force) = state.force_expire_after {
            if force < expires_at {
                expires_at = force;
            }
        }
        if expires_at <= now {
            return self.generate_new_leaf(req, state).await;
        }

        let (tx, mut root_update_rx) = mpsc::channel(1);
        let _subscription = self.register_subscriber(tx);

        // The caller timeout runs from the start of the call and is
        // never reset across loop iterations.
        let timeout_at = tokio::time::Instant::now() + opts.timeout;
        let mut watch_alive = true;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(timeout_at) => {
                    // Timed out with the same cert. State still carries
                    // any deadline committed below, so the next poll
                    // picks it up.
                    return Ok(cached_result(&existing, &state));
                }
                // Recomputed against the original target on purpose:
                // this arm can be re-entered minutes into the call and
                // re-deriving the delay from a fresh baseline would
                // push the renewal out.
                _ = tokio::time::sleep(expires_at.saturating_duration_since(Instant::now())) => {
                    return self.generate_new_leaf(req, state).await;
                }
                update = root_update_rx.recv(), if watch_alive => {
                    if update.is_none() {
                        watch_alive = false;
                        continue;
                    }
                    let roots = match self.roots.current(&self.config.datacenter) {
                        Ok(roots) => roots,
                        Err(err) => return Err(LeafError::Roots(err)),
                    };
                    // The wake may be spurious: the watcher's first
                    // observation fans out unconditionally because it
                    // cannot know which root signed our cert.
                    if roots.active_root_has_key(&state.authority_key_id) {
                        continue;
                    }
                    let delay = policy::random_stagger(self.config.ca_change_initial_jitter);
                    let force = Instant::now() + delay;
                    // Persist the deadline: the delay may exceed the
                    // caller's remaining timeout, and the next poll must
                    // honour the same instant without re-rolling it.
                    state.force_expire_after = Some(force);
                    info!(
                        "event=leaf_renewal_scheduled service={} datacenter={} delay_ms={}",
                        req.service,
                        req.datacenter,
                        delay.as_millis()
                    );
                    if force < expires_at {
                        expires_at = force;
                    }
                }
            }
        }
    }

    /// Mints a fresh key, binds it to the service identity in a CSR, and
    /// has the signing servers issue the cert. One shot; the caller's
    /// next poll is the retry.
    async fn generate_new_leaf(
        &self,
        req: &LeafRequest,
        mut state: FetchState,
    ) -> Result<FetchResult, LeafError> {
        // Trust-domain discovery; non-blocking and a cache hit most of
        // the time.
        let roots = self.roots.current(&self.config.datacenter)?;
        if roots.trust_domain.is_empty() {
            return Err(LeafError::NotBootstrapped);
        }

        let id = SpiffeId::for_service(
            &roots.trust_domain,
            &req.datacenter,
            "default",
            &req.service,
        );

        let (key, key_pem) = crypto::generate_private_key()?;
        let csr_pem = crypto::build_csr(&id, &key)?;

        let signed = self
            .signer
            .sign(&SignRequest {
                token: req.token.clone(),
                datacenter: req.datacenter.clone(),
                csr_pem,
            })
            .await?;

        let meta = crypto::parse_leaf_metadata(&signed.cert_pem, Instant::now())?;

        state.force_expire_after = None;
        state.authority_key_id = meta.authority_key_id;

        info!(
            "event=leaf_issued service={} datacenter={} authority_key_id={} modify_index={} lifetime_ms={}",
            req.service,
            req.datacenter,
            state.authority_key_id,
            signed.modify_index,
            meta.valid_before
                .saturating_duration_since(meta.valid_after)
                .as_millis()
        );

        let cert = IssuedCert {
            cert_pem: signed.cert_pem,
            private_key_pem: key_pem,
            spiffe_id: id,
            valid_after: meta.valid_after,
            valid_before: meta.valid_before,
            modify_index: signed.modify_index,
        };
        let value: CacheValue = Arc::new(cert);
        let entry_state: EntryState = Arc::new(state);
        Ok(FetchResult {
            value: Some(value),
            state: Some(entry_state),
            index: signed.modify_index,
        })
    }

    fn register_subscriber(&self, tx: mpsc::Sender<()>) -> Subscription<'_> {
        let mut watch = self.root_watch.lock();
        self.ensure_root_watcher(&mut watch);
        let id = watch.next_id;
        watch.next_id += 1;
        watch.subscribers.insert(id, tx);
        Subscription { cache: self, id }
    }

    /// Starts the background watcher when none is running. Called on
    /// every registration rather than only the first, so a watcher that
    /// died (for instance because its subscribe failed) is replaced on
    /// the next fetch instead of staying broken while subscribers camp.
    fn ensure_root_watcher(&self, watch: &mut RootWatch) {
        let running = watch
            .task
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false);
        if running {
            return;
        }
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(root_watcher(
            self.roots.clone(),
            self.config.datacenter.clone(),
            self.root_watch.clone(),
            shutdown_rx,
        ));
        watch.shutdown = Some(shutdown_tx);
        watch.task = Some(task);
    }
}

#[async_trait]
impl CacheEntry for LeafCache {
    async fn fetch(
        &self,
        opts: FetchOptions,
        req: &dyn CacheRequest,
    ) -> Result<FetchResult, BoxError> {
        let req = req.as_any().downcast_ref::<LeafRequest>().ok_or_else(|| {
            Box::new(LeafError::Internal {
                context: "request has wrong type",
            }) as BoxError
        })?;
        LeafCache::fetch(self, opts, req)
            .await
            .map_err(|err| Box::new(err) as BoxError)
    }

    fn supports_blocking(&self) -> bool {
        true
    }
}

/// In-flight fetch registration. Dropping unregisters, and the last one
/// out stops the watcher.
struct Subscription<'a> {
    cache: &'a LeafCache,
    id: u64,
}

impl Drop for Subscription<'_> {
    fn drop(&mut self) {
        let mut watch = self.cache.root_watch.lock();
        watch.subscribers.remove(&self.id);
        if watch.subscribers.is_empty() {
            if let Some(shutdown) = watch.shutdown.take() {
                let _ = shutdown.send(());
            }
            watch.task = None;
        }
    }
}

/// Background task bound to the cache entry: subscribes to the roots
/// feed and fans material active-root changes out to in-flight fetches.
async fn root_watcher(
    roots: Arc<dyn RootsCache>,
    datacenter: String,
    watch: Arc<Mutex<RootWatch>>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let (tx, mut updates) = mpsc::channel::<RootsEvent>(1);
    if let Err(err) = roots.subscribe(&datacenter, tx) {
        warn!("event=root_watch_subscribe_error datacenter={datacenter} error={err}");
        return;
    }

    let mut old_active: Option<String> = None;
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => return,
            update = updates.recv() => {
                let Some(update) = update else {
                    warn!("event=root_watch_feed_closed datacenter={datacenter}");
                    return;
                };
                let snapshot = match update {
                    Ok(snapshot) => snapshot,
                    // Clients watching leaves watch roots too and see
                    // the same error on that entry.
                    Err(_) => continue,
                };
                // Roots-entry traffic is far more frequent than actual
                // rotations; only a changed active root is worth waking
                // anyone for.
                if old_active.as_deref() == Some(snapshot.active_root_id.as_str()) {
                    continue;
                }
                debug!(
                    "event=root_watch_active_changed datacenter={} active_root_id={}",
                    datacenter, snapshot.active_root_id
                );
                {
                    let watch = watch.lock();
                    for subscriber in watch.subscribers.values() {
                        // 1-buffered edge trigger: full means the fetch
                        // already has a wake pending and will re-read
                        // roots when it runs.
                        let _ = subscriber.try_send(());
                    }
                }
                old_active = Some(snapshot.active_root_id.clone());
            }
        }
    }
}

fn take_last_result(
    last: Option<FetchResult>,
    req: &LeafRequest,
) -> Result<(Option<Arc<IssuedCert>>, FetchState), LeafError> {
    let Some(last) = last else {
        return Ok((None, FetchState::default()));
    };

    let existing = match &last.value {
        None => None,
        Some(value) => Some(value.clone().downcast::<IssuedCert>().map_err(|_| {
            LeafError::Internal {
                context: "last value has wrong type",
            }
        })?),
    };
    let state = match &last.state {
        None => None,
        Some(state) => Some(
            state
                .clone()
                .downcast::<FetchState>()
                .map_err(|_| LeafError::Internal {
                    context: "last state has wrong type",
                })?
                .as_ref()
                .clone(),
        ),
    };

    match (existing, state) {
        (Some(cert), Some(state)) => Ok((Some(cert), state)),
        (existing, state) => {
            // A value without state or state without value is an entry
            // inconsistency; regenerate from whatever survived.
            debug!(
                "event=leaf_fetch_inconsistent_last_result service={} has_value={} has_state={}",
                req.service,
                existing.is_some(),
                state.is_some()
            );
            Ok((None, state.unwrap_or_default()))
        }
    }
}

fn cached_result(existing: &Arc<IssuedCert>, state: &FetchState) -> FetchResult {
    let value: CacheValue = existing.clone();
    let entry_state: EntryState = Arc::new(state.clone());
    FetchResult {
        value: Some(value),
        state: Some(entry_state),
        index: existing.modify_index,
    }
}
