//! In-memory certificate authority.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use super::{CertificateAuthority, RequestState, SigningRequest};
use crate::error::{OperatorError, OperatorResult};

#[derive(Debug, Clone)]
struct StoredRequest {
    request: SigningRequest,
    state: RequestState,
}

/// Certificate authority that keeps requests in memory.
///
/// Approval is manual unless auto-approval is switched on. Issued
/// certificates are placeholders derived from the request digest.
#[derive(Debug, Clone, Default)]
pub struct MemoryCertificateAuthority {
    requests: Arc<RwLock<HashMap<String, StoredRequest>>>,
    auto_approve: Arc<AtomicBool>,
    creates: Arc<AtomicU64>,
}

fn request_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

fn issue(request: &SigningRequest) -> String {
    let digest = hex::encode(Sha256::digest(request.csr_pem.as_bytes()));
    format!("-----BEGIN CERTIFICATE-----\n{digest}\n-----END CERTIFICATE-----\n")
}

impl MemoryCertificateAuthority {
    /// An authority that leaves requests pending.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An authority that approves every request on submission.
    #[must_use]
    pub fn auto_approving() -> Self {
        let ca = Self::default();
        ca.set_auto_approve(true);
        ca
    }

    /// Switch auto-approval on or off.
    pub fn set_auto_approve(&self, enabled: bool) {
        self.auto_approve.store(enabled, Ordering::SeqCst);
    }

    /// Approve a pending request; returns whether it existed.
    pub async fn approve(&self, namespace: &str, name: &str) -> bool {
        let mut requests = self.requests.write().await;
        match requests.get_mut(&request_key(namespace, name)) {
            Some(stored) => {
                stored.state = RequestState::Approved {
                    certificate: issue(&stored.request),
                };
                true
            }
            None => false,
        }
    }

    /// Approve every pending request.
    pub async fn approve_all(&self) {
        let mut requests = self.requests.write().await;
        for stored in requests.values_mut() {
            if stored.state == RequestState::PendingApproval {
                stored.state = RequestState::Approved {
                    certificate: issue(&stored.request),
                };
            }
        }
    }

    /// Deny a request; returns whether it existed.
    pub async fn deny(&self, namespace: &str, name: &str, reason: &str) -> bool {
        let mut requests = self.requests.write().await;
        match requests.get_mut(&request_key(namespace, name)) {
            Some(stored) => {
                stored.state = RequestState::Denied {
                    reason: reason.to_owned(),
                };
                true
            }
            None => false,
        }
    }

    /// Submitted request with this name.
    pub async fn request(&self, namespace: &str, name: &str) -> Option<SigningRequest> {
        let requests = self.requests.read().await;
        requests
            .get(&request_key(namespace, name))
            .map(|s| s.request.clone())
    }

    /// Number of successful submissions.
    #[must_use]
    pub fn create_count(&self) -> u64 {
        self.creates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CertificateAuthority for MemoryCertificateAuthority {
    async fn create_signing_request(&self, request: SigningRequest) -> OperatorResult<()> {
        let key = request_key(&request.namespace, &request.name);
        let mut requests = self.requests.write().await;
        if requests.contains_key(&key) {
            return Err(OperatorError::AlreadyExists(format!(
                "certificate signing request {}",
                request.name
            )));
        }
        let state = if self.auto_approve.load(Ordering::SeqCst) {
            RequestState::Approved {
                certificate: issue(&request),
            }
        } else {
            RequestState::PendingApproval
        };
        requests.insert(key, StoredRequest { request, state });
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_signing_request(
        &self,
        namespace: &str,
        name: &str,
    ) -> OperatorResult<RequestState> {
        let requests = self.requests.read().await;
        Ok(requests
            .get(&request_key(namespace, name))
            .map_or(RequestState::Unrequested, |s| s.state.clone()))
    }
}
