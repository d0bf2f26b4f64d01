//! Certificates issued through the cluster certificate authority.
//!
//! Keys and certificates for the members of a set are kept in a
//! [`PemCollection`], persisted as one secret per set. The
//! [`CertificateSequencer`] drives signing requests for the members that
//! lack a usable certificate.

mod memory;
mod sequencer;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use memory::MemoryCertificateAuthority;
pub use sequencer::{CertificatePurpose, CertificateSequencer};

use crate::error::OperatorResult;
use crate::secrets::SecretData;

const PEM_BEGIN: &str = "-----BEGIN ";
const PEM_END: &str = "-----END ";

/// Key and certificate of one member.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PemFile {
    /// PEM encoded private key.
    #[serde(default)]
    pub private_key: String,
    /// PEM encoded certificate.
    #[serde(default)]
    pub certificate: String,
}

impl PemFile {
    /// Whether both the key and the certificate are present.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.private_key.is_empty() && !self.certificate.is_empty()
    }

    /// Fill empty parts from `other`; parts already set are never replaced.
    fn merge_from(&mut self, other: &Self) {
        if self.private_key.is_empty() {
            self.private_key.clone_from(&other.private_key);
        }
        if self.certificate.is_empty() {
            self.certificate.clone_from(&other.certificate);
        }
    }

    fn from_pem(contents: &str) -> Self {
        let mut file = Self::default();
        for block in pem_blocks(contents) {
            let target = if block.contains("PRIVATE KEY") {
                &mut file.private_key
            } else {
                &mut file.certificate
            };
            target.push_str(&block);
        }
        file
    }

    fn to_pem(&self) -> String {
        format!("{}{}", self.certificate, self.private_key)
    }
}

/// Keys and certificates of a set, keyed by member name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PemCollection {
    files: BTreeMap<String, PemFile>,
}

impl PemCollection {
    /// An empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a collection back from secret contents.
    ///
    /// Entries are stored under `<member>-pem` as the certificate followed
    /// by the private key. Keys without the suffix are ignored.
    #[must_use]
    pub fn from_secret_data(data: &SecretData) -> Self {
        let files = data
            .iter()
            .filter_map(|(key, value)| {
                key.strip_suffix("-pem")
                    .map(|member| (member.to_owned(), PemFile::from_pem(value)))
            })
            .collect();
        Self { files }
    }

    /// Secret contents for this collection.
    #[must_use]
    pub fn to_secret_data(&self) -> SecretData {
        self.files
            .iter()
            .map(|(member, file)| (format!("{member}-pem"), file.to_pem()))
            .collect()
    }

    /// Entry for `member`.
    #[must_use]
    pub fn get(&self, member: &str) -> Option<&PemFile> {
        self.files.get(member)
    }

    /// Whether `member` has both a key and a certificate.
    #[must_use]
    pub fn is_complete_for(&self, member: &str) -> bool {
        self.get(member).is_some_and(PemFile::is_complete)
    }

    /// Whether every one of `members` has both a key and a certificate.
    #[must_use]
    pub fn is_complete(&self, members: &[String]) -> bool {
        members.iter().all(|m| self.is_complete_for(m))
    }

    /// Record the private key of `member`, keeping an existing one.
    pub fn add_private_key(&mut self, member: &str, key: impl Into<String>) {
        self.merge_entry(
            member,
            &PemFile {
                private_key: key.into(),
                certificate: String::new(),
            },
        );
    }

    /// Record the certificate of `member`.
    ///
    /// A newly issued certificate replaces the previous one; the key stays.
    pub fn add_certificate(&mut self, member: &str, certificate: impl Into<String>) {
        self.files.entry(member.to_owned()).or_default().certificate = certificate.into();
    }

    /// Merge `file` into the entry for `member` without overwriting set parts.
    pub fn merge_entry(&mut self, member: &str, file: &PemFile) {
        self.files
            .entry(member.to_owned())
            .or_default()
            .merge_from(file);
    }

    /// Merge every entry of `other` without overwriting set parts.
    pub fn merge(&mut self, other: &Self) {
        for (member, file) in &other.files {
            self.merge_entry(member, file);
        }
    }

    /// Hex SHA-256 over the canonical JSON form.
    pub fn hash(&self) -> OperatorResult<String> {
        let canonical = serde_json::to_vec(&self.files)?;
        Ok(hex::encode(Sha256::digest(&canonical)))
    }

    /// Number of members with an entry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the collection has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

fn pem_blocks(contents: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current = String::new();
    for line in contents.lines() {
        if line.starts_with(PEM_BEGIN) {
            current.clear();
        }
        current.push_str(line);
        current.push('\n');
        if line.starts_with(PEM_END) {
            blocks.push(std::mem::take(&mut current));
        }
    }
    blocks
}

/// State of a signing request as reported by the authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestState {
    /// No request with this name exists.
    Unrequested,
    /// Submitted, awaiting a decision.
    PendingApproval,
    /// Approved; carries the issued certificate.
    Approved {
        /// PEM encoded certificate.
        certificate: String,
    },
    /// Denied by an administrator.
    Denied {
        /// Reason given for the denial.
        reason: String,
    },
}

/// A certificate signing request submitted to the authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningRequest {
    /// Request name, `<member>.<namespace>` or `<member>-clusterfile.<namespace>`.
    pub name: String,
    /// Namespace of the resource.
    pub namespace: String,
    /// PEM encoded request.
    pub csr_pem: String,
    /// Requested key usages.
    pub usages: Vec<String>,
}

/// Cluster certificate authority.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Submit a signing request.
    ///
    /// Returns [`crate::error::OperatorError::AlreadyExists`] when a request
    /// with the same name was submitted concurrently.
    async fn create_signing_request(&self, request: SigningRequest) -> OperatorResult<()>;

    /// Current state of the request `name`.
    async fn read_signing_request(&self, namespace: &str, name: &str)
        -> OperatorResult<RequestState>;
}
