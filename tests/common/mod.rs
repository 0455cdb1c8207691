#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};
use tokio::sync::mpsc;
use x509_parser::extensions::ParsedExtension;
use x509_parser::pem::parse_x509_pem;

use meshcert::{
    CertSigner, FetchOptions, FetchResult, FetchState, IndexedRoots, IssuedCert, LeafCache,
    LeafCacheConfig, LeafRequest, RootCert, RootsCache, RootsError, RootsEvent, SignError,
    SignRequest, SignedCert, SpiffeId,
};

/// A signing authority for tests: a self-signed CA plus the key ID its
/// issued leaves carry in their authority key identifier.
pub struct TestAuthority {
    pub id: String,
    pub signing_key_id: String,
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl TestAuthority {
    pub fn new(id: &str) -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = params.self_signed(&key).unwrap();

        // Issue a probe leaf to learn the key ID this authority stamps
        // into certificates it signs.
        let probe_key = KeyPair::generate().unwrap();
        let mut probe_params = CertificateParams::default();
        probe_params.use_authority_key_identifier_extension = true;
        let probe = probe_params.signed_by(&probe_key, &cert, &key).unwrap();
        let signing_key_id = authority_key_id_of(&probe.pem());

        Self {
            id: id.to_string(),
            signing_key_id,
            cert,
            key,
        }
    }

    pub fn issue_leaf(&self, lifetime: Duration) -> String {
        let leaf_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params.use_authority_key_identifier_extension = true;
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::seconds(1);
        params.not_after = now + time::Duration::seconds(lifetime.as_secs() as i64);
        params
            .signed_by(&leaf_key, &self.cert, &self.key)
            .unwrap()
            .pem()
    }
}

pub fn authority_key_id_of(cert_pem: &str) -> String {
    let (_, pem) = parse_x509_pem(cert_pem.as_bytes()).unwrap();
    let cert = pem.parse_x509().unwrap();
    for ext in cert.extensions() {
        if let ParsedExtension::AuthorityKeyIdentifier(aki) = ext.parsed_extension() {
            if let Some(key_id) = &aki.key_identifier {
                return hex::encode(key_id.0);
            }
        }
    }
    panic!("certificate carries no authority key identifier");
}

/// Signing RPC stub. Issues leaves under a swappable authority with
/// consecutive modify indexes, or fails with a canned error.
pub struct StubSigner {
    inner: Mutex<StubSignerState>,
}

struct StubSignerState {
    authority: TestAuthority,
    next_index: u64,
    sign_calls: u64,
    fail_with: Option<String>,
}

impl StubSigner {
    pub fn new(authority: TestAuthority) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(StubSignerState {
                authority,
                next_index: 1,
                sign_calls: 0,
                fail_with: None,
            }),
        })
    }

    pub fn set_authority(&self, authority: TestAuthority) {
        self.inner.lock().authority = authority;
    }

    pub fn set_next_index(&self, index: u64) {
        self.inner.lock().next_index = index;
    }

    pub fn fail_with(&self, details: &str) {
        self.inner.lock().fail_with = Some(details.to_string());
    }

    pub fn sign_calls(&self) -> u64 {
        self.inner.lock().sign_calls
    }
}

#[async_trait::async_trait]
impl CertSigner for StubSigner {
    async fn sign(&self, _request: &SignRequest) -> Result<SignedCert, SignError> {
        let mut inner = self.inner.lock();
        if let Some(details) = &inner.fail_with {
            return Err(SignError {
                details: details.clone(),
            });
        }
        inner.sign_calls += 1;
        let cert_pem = inner.authority.issue_leaf(Duration::from_secs(3600));
        let modify_index = inner.next_index;
        inner.next_index += 1;
        Ok(SignedCert {
            cert_pem,
            modify_index,
        })
    }
}

/// Roots cache stub. `subscribe` delivers the current snapshot as its
/// first event, the way the real roots entry primes a new watch.
pub struct StubRoots {
    inner: Mutex<StubRootsState>,
}

struct StubRootsState {
    snapshot: Arc<IndexedRoots>,
    subscribers: Vec<mpsc::Sender<RootsEvent>>,
    subscribe_calls: u64,
    fail_current: Option<String>,
    fail_subscribe: bool,
}

impl StubRoots {
    pub fn new(snapshot: IndexedRoots) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(StubRootsState {
                snapshot: Arc::new(snapshot),
                subscribers: Vec::new(),
                subscribe_calls: 0,
                fail_current: None,
                fail_subscribe: false,
            }),
        })
    }

    pub fn snapshot_for(authority: &TestAuthority, trust_domain: &str, index: u64) -> IndexedRoots {
        IndexedRoots {
            trust_domain: trust_domain.to_string(),
            active_root_id: authority.id.clone(),
            roots: vec![RootCert {
                id: authority.id.clone(),
                signing_key_id: authority.signing_key_id.clone(),
                active: true,
                root_cert_pem: String::new(),
            }],
            index,
        }
    }

    /// Replace the snapshot and fan it out to every live subscription.
    pub fn publish(&self, snapshot: IndexedRoots) {
        let mut inner = self.inner.lock();
        inner.snapshot = Arc::new(snapshot);
        let event: RootsEvent = Ok(inner.snapshot.clone());
        inner.subscribers.retain(|tx| !tx.is_closed());
        for tx in &inner.subscribers {
            let _ = tx.try_send(event.clone());
        }
    }

    pub fn publish_error(&self, details: &str) {
        let inner = self.inner.lock();
        for tx in &inner.subscribers {
            let _ = tx.try_send(Err(RootsError::Unavailable {
                details: details.to_string(),
            }));
        }
    }

    pub fn fail_current(&self, details: &str) {
        self.inner.lock().fail_current = Some(details.to_string());
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.inner.lock().fail_subscribe = fail;
    }

    pub fn subscribe_calls(&self) -> u64 {
        self.inner.lock().subscribe_calls
    }

    pub fn live_subscriptions(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|tx| !tx.is_closed());
        inner.subscribers.len()
    }
}

impl RootsCache for StubRoots {
    fn current(&self, _datacenter: &str) -> Result<Arc<IndexedRoots>, RootsError> {
        let inner = self.inner.lock();
        if let Some(details) = &inner.fail_current {
            return Err(RootsError::Unavailable {
                details: details.clone(),
            });
        }
        Ok(inner.snapshot.clone())
    }

    fn subscribe(
        &self,
        _datacenter: &str,
        tx: mpsc::Sender<RootsEvent>,
    ) -> Result<(), RootsError> {
        let mut inner = self.inner.lock();
        if inner.fail_subscribe {
            return Err(RootsError::Unavailable {
                details: "subscribe refused".to_string(),
            });
        }
        inner.subscribe_calls += 1;
        let _ = tx.try_send(Ok(inner.snapshot.clone()));
        inner.subscribers.push(tx);
        Ok(())
    }
}

pub fn leaf_cache(
    roots: &Arc<StubRoots>,
    signer: &Arc<StubSigner>,
    jitter: Duration,
) -> Arc<LeafCache> {
    Arc::new(LeafCache::new(
        roots.clone(),
        signer.clone(),
        LeafCacheConfig::new("dc1").ca_change_initial_jitter(jitter),
    ))
}

pub fn request(service: &str) -> LeafRequest {
    LeafRequest {
        service: service.to_string(),
        datacenter: "dc1".to_string(),
        token: "test-token".to_string(),
        min_index: 0,
    }
}

/// A cached leaf as the framework would hand it back: live for
/// `remaining` with `lifetime` total, signed by `authority`.
pub fn cached_leaf(
    authority: &TestAuthority,
    lifetime: Duration,
    elapsed: Duration,
    modify_index: u64,
) -> (IssuedCert, FetchState) {
    let now = Instant::now();
    let cert = IssuedCert {
        cert_pem: String::new(),
        private_key_pem: String::new(),
        spiffe_id: SpiffeId::for_service("example.mesh", "dc1", "default", "web"),
        valid_after: now - elapsed,
        valid_before: now - elapsed + lifetime,
        modify_index,
    };
    let state = FetchState {
        authority_key_id: authority.signing_key_id.clone(),
        force_expire_after: None,
    };
    (cert, state)
}

pub fn last_result(cert: IssuedCert, state: FetchState) -> FetchResult {
    let index = cert.modify_index;
    let value: meshcert::CacheValue = Arc::new(cert);
    let entry_state: meshcert::EntryState = Arc::new(state);
    FetchResult {
        value: Some(value),
        state: Some(entry_state),
        index,
    }
}

pub fn opts(timeout: Duration, last: Option<FetchResult>) -> FetchOptions {
    FetchOptions {
        timeout,
        last_result: last,
    }
}

pub fn issued_cert(result: &FetchResult) -> Arc<IssuedCert> {
    result
        .value
        .as_ref()
        .expect("result carries a value")
        .clone()
        .downcast()
        .expect("value is an issued cert")
}

pub fn fetch_state(result: &FetchResult) -> FetchState {
    result
        .state
        .as_ref()
        .expect("result carries state")
        .clone()
        .downcast::<FetchState>()
        .expect("state is leaf fetch state")
        .as_ref()
        .clone()
}
