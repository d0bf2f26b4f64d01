//! Per-member certificate issuance.

use std::sync::Arc;

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose,
};
use tracing::{debug, info, warn};

use super::{CertificateAuthority, PemCollection, RequestState, SigningRequest};
use crate::config::CertificateConfig;
use crate::deployment::Process;
use crate::error::{OperatorError, OperatorResult};
use crate::secrets::SecretStore;
use crate::topology::ResolvedTopology;
use crate::types::DeclaredSpec;
use crate::workflow::WorkflowStatus;

/// What a certificate is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificatePurpose {
    /// TLS between clients and members.
    Server,
    /// x509 authentication between members.
    InternalCluster,
}

impl CertificatePurpose {
    /// Secret holding the set's keys and certificates.
    #[must_use]
    pub fn secret_name(self, set_name: &str) -> String {
        match self {
            Self::Server => format!("{set_name}-cert"),
            Self::InternalCluster => format!("{set_name}-clusterfile"),
        }
    }

    /// Signing request name for `member`.
    #[must_use]
    pub fn request_name(self, member: &str, namespace: &str) -> String {
        match self {
            Self::Server => format!("{member}.{namespace}"),
            Self::InternalCluster => format!("{member}-clusterfile.{namespace}"),
        }
    }

    fn usages(self) -> Vec<String> {
        let mut usages = vec!["digital signature".to_owned(), "key encipherment".to_owned()];
        if self == Self::Server {
            usages.push("server auth".to_owned());
        }
        usages.push("client auth".to_owned());
        usages
    }

    fn extended_key_usages(self) -> Vec<ExtendedKeyUsagePurpose> {
        match self {
            Self::Server => vec![
                ExtendedKeyUsagePurpose::ServerAuth,
                ExtendedKeyUsagePurpose::ClientAuth,
            ],
            Self::InternalCluster => vec![ExtendedKeyUsagePurpose::ClientAuth],
        }
    }

    fn pending_message(self, set_name: &str) -> String {
        match self {
            Self::Server => {
                format!("Not all certificates have been approved by Kubernetes CA for {set_name}")
            }
            Self::InternalCluster => {
                "Not all internal cluster authentication certs have been approved by Kubernetes CA"
                    .to_owned()
            }
        }
    }
}

/// Drives signing requests until every member of a set has a certificate.
pub struct CertificateSequencer {
    authority: Arc<dyn CertificateAuthority>,
    secrets: Arc<dyn SecretStore>,
    config: CertificateConfig,
}

impl CertificateSequencer {
    /// Create a new sequencer.
    #[must_use]
    pub fn new(
        authority: Arc<dyn CertificateAuthority>,
        secrets: Arc<dyn SecretStore>,
        config: CertificateConfig,
    ) -> Self {
        Self {
            authority,
            secrets,
            config,
        }
    }

    /// Ensure certificates for every set of `topology` that needs them.
    ///
    /// Server certificates are issued when TLS is enabled, member
    /// certificates when internal cluster authentication is x509.
    pub async fn ensure_for_topology(
        &self,
        spec: &DeclaredSpec,
        topology: &ResolvedTopology,
    ) -> WorkflowStatus {
        let mut purposes = Vec::new();
        if spec.security.tls.enabled {
            purposes.push(CertificatePurpose::Server);
        }
        if spec.security.authentication.internal_cluster_x509() {
            purposes.push(CertificatePurpose::InternalCluster);
        }

        let mut status = WorkflowStatus::ok();
        for purpose in purposes {
            for (set_name, members) in certificate_groups(spec, topology) {
                let result = self
                    .ensure_certificates(spec, &set_name, members, purpose)
                    .await;
                status = status.merge(result);
            }
        }
        status
    }

    /// Ensure every process in `members` has a key and an approved certificate.
    ///
    /// Returns `Ok` when all certificates are present and `Pending` while
    /// some still await approval. Failures to reach the authority or the
    /// secret store are `Failed`.
    pub async fn ensure_certificates(
        &self,
        spec: &DeclaredSpec,
        set_name: &str,
        members: &[Process],
        purpose: CertificatePurpose,
    ) -> WorkflowStatus {
        let result = if spec.security.tls.ca.is_some() {
            self.verify_provided(spec, set_name, members, purpose).await
        } else {
            self.issue(spec, set_name, members, purpose).await
        };
        result.unwrap_or_else(|e| WorkflowStatus::failed(e.to_string()))
    }

    /// Certificates signed by a custom CA are provided by the user; only check them.
    async fn verify_provided(
        &self,
        spec: &DeclaredSpec,
        set_name: &str,
        members: &[Process],
        purpose: CertificatePurpose,
    ) -> OperatorResult<WorkflowStatus> {
        let secret_name = purpose.secret_name(set_name);
        let stored = self.read_collection(&spec.namespace, &secret_name).await?;
        let ready = members
            .iter()
            .filter(|p| stored.is_complete_for(&p.name))
            .count();
        if ready == members.len() {
            return Ok(WorkflowStatus::ok());
        }
        Ok(WorkflowStatus::failed(format!(
            "secret {secret_name} does not contain all the certificates needed: required {}, contains {ready}",
            members.len()
        )))
    }

    async fn issue(
        &self,
        spec: &DeclaredSpec,
        set_name: &str,
        members: &[Process],
        purpose: CertificatePurpose,
    ) -> OperatorResult<WorkflowStatus> {
        let namespace = spec.namespace.as_str();
        let secret_name = purpose.secret_name(set_name);
        let names: Vec<String> = members.iter().map(|p| p.name.clone()).collect();

        let stored = self.read_collection(namespace, &secret_name).await?;
        if stored.is_complete(&names) {
            debug!(secret = %secret_name, "all certificates present");
            return Ok(WorkflowStatus::ok());
        }

        let mut pem = stored.clone();
        let mut warnings = Vec::new();
        let mut waiting: Vec<(&Process, String)> = Vec::new();
        let mut submissions = Vec::new();

        for process in members.iter().filter(|p| !stored.is_complete_for(&p.name)) {
            let request_name = purpose.request_name(&process.name, namespace);
            let state = self
                .authority
                .read_signing_request(namespace, &request_name)
                .await
                .map_err(|e| e.context("read certificate signing request"))?;
            match state {
                RequestState::Unrequested => {
                    let existing_key = pem
                        .get(&process.name)
                        .map(|f| f.private_key.clone())
                        .filter(|k| !k.is_empty());
                    let (key, csr) =
                        self.signing_request(spec, process, purpose, existing_key.as_deref())?;
                    pem.add_private_key(&process.name, key);
                    submissions.push(SigningRequest {
                        name: request_name.clone(),
                        namespace: namespace.to_owned(),
                        csr_pem: csr,
                        usages: purpose.usages(),
                    });
                    waiting.push((process, request_name));
                }
                RequestState::PendingApproval => {
                    info!(host = %process.hostname, "certificate waiting for approval");
                    waiting.push((process, request_name));
                }
                RequestState::Approved { certificate } => {
                    adopt_certificate(&mut pem, process, &request_name, certificate, &mut warnings);
                }
                RequestState::Denied { reason } => {
                    warn!(host = %process.hostname, reason = %reason, "certificate request denied");
                    warnings.push(format!(
                        "certificate request {request_name} was denied: {reason}"
                    ));
                }
            }
        }

        // Keys are stored before any request that references them is submitted.
        let persisted = self
            .persist_if_changed(namespace, &secret_name, &stored.hash()?, &pem)
            .await?;

        for request in submissions {
            let name = request.name.clone();
            match self.authority.create_signing_request(request).await {
                Ok(()) => info!(request = %name, "submitted certificate signing request"),
                Err(OperatorError::AlreadyExists(_)) => {
                    debug!(request = %name, "certificate signing request already exists");
                }
                Err(e) => return Err(e.context("create certificate signing request")),
            }
        }

        let mut attempts = self.config.approval_poll_attempts;
        while !waiting.is_empty() && attempts > 0 {
            attempts -= 1;
            tokio::time::sleep(self.config.approval_poll_interval()).await;
            let mut still_waiting = Vec::new();
            for (process, request_name) in waiting {
                let state = self
                    .authority
                    .read_signing_request(namespace, &request_name)
                    .await
                    .map_err(|e| e.context("read certificate signing request"))?;
                match state {
                    RequestState::Approved { certificate } => {
                        adopt_certificate(&mut pem, process, &request_name, certificate, &mut warnings);
                    }
                    RequestState::Denied { reason } => {
                        warnings.push(format!(
                            "certificate request {request_name} was denied: {reason}"
                        ));
                    }
                    RequestState::Unrequested | RequestState::PendingApproval => {
                        still_waiting.push((process, request_name));
                    }
                }
            }
            waiting = still_waiting;
        }

        self.persist_if_changed(namespace, &secret_name, &persisted, &pem)
            .await?;

        if pem.is_complete(&names) {
            Ok(WorkflowStatus::ok().with_warnings(warnings))
        } else {
            Ok(WorkflowStatus::pending(purpose.pending_message(set_name)).with_warnings(warnings))
        }
    }

    async fn read_collection(&self, namespace: &str, name: &str) -> OperatorResult<PemCollection> {
        let data = self
            .secrets
            .get(namespace, name)
            .await
            .map_err(|e| e.context("read certificate secret"))?;
        Ok(data.map_or_else(PemCollection::new, |d| PemCollection::from_secret_data(&d)))
    }

    /// Write `pem` unless its hash equals `previous_hash`; returns the current hash.
    async fn persist_if_changed(
        &self,
        namespace: &str,
        name: &str,
        previous_hash: &str,
        pem: &PemCollection,
    ) -> OperatorResult<String> {
        let hash = pem.hash()?;
        if hash != previous_hash {
            self.secrets
                .put(namespace, name, pem.to_secret_data())
                .await
                .map_err(|e| e.context("write certificate secret"))?;
            debug!(secret = %name, members = pem.len(), "stored certificates");
        }
        Ok(hash)
    }

    /// Build a signing request for `process`, reusing `existing_key` when present.
    fn signing_request(
        &self,
        spec: &DeclaredSpec,
        process: &Process,
        purpose: CertificatePurpose,
        existing_key: Option<&str>,
    ) -> OperatorResult<(String, String)> {
        let rcgen_error = |e: rcgen::Error| {
            OperatorError::certificate_authority(format!(
                "generate signing request for {}: {e}",
                process.name
            ))
        };

        let key = match existing_key {
            Some(pem) => KeyPair::from_pem(pem),
            None => KeyPair::generate(),
        }
        .map_err(rcgen_error)?;

        let cluster_domain = spec
            .cluster_domain
            .as_deref()
            .filter(|d| !d.is_empty())
            .unwrap_or(&self.config.default_cluster_domain);

        let mut params =
            CertificateParams::new(vec![process.hostname.clone(), process.name.clone()])
                .map_err(rcgen_error)?;
        let mut subject = DistinguishedName::new();
        subject.push(DnType::CountryName, "US");
        subject.push(DnType::StateOrProvinceName, "NY");
        subject.push(DnType::LocalityName, "NY");
        subject.push(DnType::OrganizationName, format!("{cluster_domain}-server"));
        subject.push(DnType::OrganizationalUnitName, spec.namespace.as_str());
        subject.push(DnType::CommonName, process.name.as_str());
        params.distinguished_name = subject;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = purpose.extended_key_usages();

        let csr = params
            .serialize_request(&key)
            .and_then(|request| request.pem())
            .map_err(rcgen_error)?;
        Ok((key.serialize_pem(), csr))
    }
}

/// Store an approved certificate next to its key. A certificate whose key
/// was lost can never be used, so it is reported instead.
fn adopt_certificate(
    pem: &mut PemCollection,
    process: &Process,
    request_name: &str,
    certificate: String,
    warnings: &mut Vec<String>,
) {
    if pem.get(&process.name).is_some_and(|f| !f.private_key.is_empty()) {
        info!(host = %process.hostname, "certificate approved");
        pem.add_certificate(&process.name, certificate);
        return;
    }
    warn!(host = %process.hostname, request = %request_name, "approved certificate has no private key");
    warnings.push(format!(
        "certificate for {} was approved but its private key is missing, delete signing request {request_name} to issue a new one",
        process.hostname
    ));
}

/// Sets of `topology` that get their own certificate secret.
fn certificate_groups<'a>(
    spec: &DeclaredSpec,
    topology: &'a ResolvedTopology,
) -> Vec<(String, &'a [Process])> {
    match topology {
        ResolvedTopology::Standalone(process) => {
            vec![(spec.name.clone(), std::slice::from_ref(process))]
        }
        ResolvedTopology::ReplicaSet(rs) => vec![(rs.name().to_owned(), rs.processes.as_slice())],
        ResolvedTopology::ShardedCluster(sc) => {
            let mut groups = vec![
                (format!("{}-mongos", spec.name), sc.mongos.as_slice()),
                (sc.config.name().to_owned(), sc.config.processes.as_slice()),
            ];
            groups.extend(
                sc.shards
                    .iter()
                    .map(|s| (s.name().to_owned(), s.processes.as_slice())),
            );
            groups
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::certs::MemoryCertificateAuthority;
    use crate::config::OperatorConfig;
    use crate::deployment::{ReplicaSetWithProcesses, PROTOCOL_VERSION};
    use crate::secrets::MemorySecrets;
    use crate::types::{ProjectReference, ResourceKind, SecuritySpec, ShardedSize, TlsSpec};
    use crate::workflow::StatusKind;

    fn spec() -> DeclaredSpec {
        DeclaredSpec {
            name: "rs".to_owned(),
            namespace: "ns".to_owned(),
            kind: ResourceKind::ReplicaSet,
            version: "4.2.1".to_owned(),
            feature_compatibility_version: None,
            members: 2,
            sharded: ShardedSize::default(),
            memory_limit: None,
            cluster_domain: None,
            security: SecuritySpec {
                tls: TlsSpec {
                    enabled: true,
                    ca: None,
                },
                ..SecuritySpec::default()
            },
            replica_set_horizons: Vec::new(),
            project: ProjectReference {
                project_name: "project".to_owned(),
                org_id: String::new(),
                base_url: "http://om".to_owned(),
                credentials: "creds".to_owned(),
            },
        }
    }

    fn members() -> Vec<Process> {
        let processes = (0..2)
            .map(|i| {
                Process::mongod(
                    format!("rs-{i}"),
                    format!("rs-{i}.rs-svc.ns.svc.cluster.local"),
                    "4.2.1",
                )
            })
            .collect();
        ReplicaSetWithProcesses::new("rs", PROTOCOL_VERSION, processes, &[]).processes
    }

    fn sequencer(
        ca: &MemoryCertificateAuthority,
        secrets: &MemorySecrets,
    ) -> CertificateSequencer {
        CertificateSequencer::new(
            Arc::new(ca.clone()),
            Arc::new(secrets.clone()),
            OperatorConfig::without_delays().certificates,
        )
    }

    #[tokio::test]
    async fn pending_until_approved_and_keys_survive() {
        let ca = MemoryCertificateAuthority::new();
        let secrets = MemorySecrets::new();
        let sequencer = sequencer(&ca, &secrets);
        let members = members();

        let status = sequencer
            .ensure_certificates(&spec(), "rs", &members, CertificatePurpose::Server)
            .await;
        assert_eq!(
            status.message().unwrap(),
            "Not all certificates have been approved by Kubernetes CA for rs"
        );
        assert_eq!(ca.create_count(), 2);

        let stored = secrets.get("ns", "rs-cert").await.unwrap().unwrap();
        let keys = PemCollection::from_secret_data(&stored);
        let key = keys.get("rs-0").unwrap().private_key.clone();
        assert!(key.contains("PRIVATE KEY"));

        ca.approve_all().await;
        let status = sequencer
            .ensure_certificates(&spec(), "rs", &members, CertificatePurpose::Server)
            .await;
        assert!(status.is_ok());
        assert_eq!(ca.create_count(), 2);

        let stored = secrets.get("ns", "rs-cert").await.unwrap().unwrap();
        let pem = PemCollection::from_secret_data(&stored);
        assert!(pem.is_complete(&["rs-0".to_owned(), "rs-1".to_owned()]));
        assert_eq!(pem.get("rs-0").unwrap().private_key, key);
    }

    #[tokio::test]
    async fn complete_secret_is_not_rewritten() {
        let ca = MemoryCertificateAuthority::auto_approving();
        let secrets = MemorySecrets::new();
        let sequencer = sequencer(&ca, &secrets);
        let members = members();

        let first = sequencer
            .ensure_certificates(&spec(), "rs", &members, CertificatePurpose::Server)
            .await;
        assert!(first.is_ok());
        let writes = secrets.write_count();

        let second = sequencer
            .ensure_certificates(&spec(), "rs", &members, CertificatePurpose::Server)
            .await;
        assert!(second.is_ok());
        assert_eq!(secrets.write_count(), writes);
    }

    #[tokio::test]
    async fn cluster_certificates_use_their_own_secret_and_message() {
        let ca = MemoryCertificateAuthority::new();
        let secrets = MemorySecrets::new();
        let sequencer = sequencer(&ca, &secrets);

        let status = sequencer
            .ensure_certificates(&spec(), "rs", &members(), CertificatePurpose::InternalCluster)
            .await;
        assert_eq!(
            status.message().unwrap(),
            "Not all internal cluster authentication certs have been approved by Kubernetes CA"
        );
        assert!(secrets.get("ns", "rs-clusterfile").await.unwrap().is_some());
        let request = ca.request("ns", "rs-0-clusterfile.ns").await.unwrap();
        assert!(!request.usages.contains(&"server auth".to_owned()));
    }

    #[tokio::test]
    async fn denied_request_is_a_warning() {
        let ca = MemoryCertificateAuthority::new();
        let secrets = MemorySecrets::new();
        let sequencer = sequencer(&ca, &secrets);
        let members = members();

        sequencer
            .ensure_certificates(&spec(), "rs", &members, CertificatePurpose::Server)
            .await;
        ca.approve("ns", "rs-0.ns").await;
        ca.deny("ns", "rs-1.ns", "not trusted").await;

        let status = sequencer
            .ensure_certificates(&spec(), "rs", &members, CertificatePurpose::Server)
            .await;
        assert!(matches!(status.kind(), StatusKind::Pending { .. }));
        assert_eq!(
            status.warnings(),
            ["certificate request rs-1.ns was denied: not trusted".to_owned()]
        );
    }

    #[tokio::test]
    async fn approved_certificate_without_key_is_reported() {
        let ca = MemoryCertificateAuthority::new();
        let secrets = MemorySecrets::new();
        let sequencer = sequencer(&ca, &secrets);
        let members = members();

        sequencer
            .ensure_certificates(&spec(), "rs", &members, CertificatePurpose::Server)
            .await;
        ca.approve_all().await;
        // The stored keys are lost after the requests were submitted.
        secrets.delete("ns", "rs-cert").await.unwrap();

        let status = sequencer
            .ensure_certificates(&spec(), "rs", &members, CertificatePurpose::Server)
            .await;
        assert!(matches!(status.kind(), StatusKind::Pending { .. }));
        assert_eq!(status.warnings().len(), 2);
        assert!(status.warnings()[0].contains("rs-0.rs-svc.ns.svc.cluster.local"));
        assert!(status.warnings()[0].contains("rs-0.ns"));

        // No certificate is stored without its key.
        let stored = secrets.get("ns", "rs-cert").await.unwrap();
        let pem = stored.map(|d| PemCollection::from_secret_data(&d)).unwrap_or_default();
        assert!(!pem.get("rs-0").is_some_and(|f| !f.certificate.is_empty()));
        assert_eq!(ca.create_count(), 2);
    }

    #[tokio::test]
    async fn custom_ca_requires_provided_certificates() {
        let ca = MemoryCertificateAuthority::auto_approving();
        let secrets = MemorySecrets::new();
        let sequencer = sequencer(&ca, &secrets);
        let mut spec = spec();
        spec.security.tls.ca = Some("custom-ca".to_owned());

        let status = sequencer
            .ensure_certificates(&spec, "rs", &members(), CertificatePurpose::Server)
            .await;
        assert!(matches!(status.kind(), StatusKind::Failed { .. }));
        assert_eq!(ca.create_count(), 0);
    }
}
