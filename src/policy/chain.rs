//! Chain-of-trust verification and the revocation-list store.
//!
//! The TLS layer guarantees the peer presented a chain anchored at the
//! configured CA; this module re-walks that chain with the engine's
//! *current* revocation snapshot and projects it into policy. It runs once
//! per session and is never cached — revocation state may have changed
//! between two handshakes from the same client.

use std::collections::{HashMap, HashSet};

use x509_parser::certificate::X509Certificate;
use x509_parser::der_parser::{oid, oid::Oid};
use x509_parser::prelude::FromDer;
use x509_parser::revocation_list::CertificateRevocationList;
use x509_parser::time::ASN1Time;

use super::{
    contains_crl, contains_vm_image, crl_of, delegation_of, permissions_of, version_of,
    vm_config_of, Delegation, PermissionSet, VmConfig, POLICY_VERSION,
};
use crate::id::VmId;
use crate::{Error, Result};

/// CRL Number extension (RFC 5280 §5.2.3), the monotonic install guard.
const OID_CRL_NUMBER: Oid<'static> = oid!(2.5.29.20);

/// One certificate's revocation coordinates: who issued it and under which
/// serial. Retained per live VM so a CRL install can find the VMs it kills
/// without re-parsing chains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevocationLink {
    pub issuer: String,
    pub serial: Vec<u8>,
}

/// Everything the engine needs to know about an authenticated peer.
#[derive(Debug, Clone)]
pub struct ChainPolicy {
    /// Path of intermediate common names, root-side first.
    pub prefix: VmId,
    /// Leaf common name.
    pub name: String,
    pub permissions: PermissionSet,
    /// Resource grants along the chain, outermost prefix first.
    pub delegations: Vec<(VmId, Delegation)>,
    /// Present iff the leaf is a VM certificate.
    pub vm: Option<VmConfig>,
    /// Present iff the leaf announces a revocation list (DER).
    pub crl: Option<Vec<u8>>,
    /// Revocation coordinates of every link in the chain.
    pub links: Vec<RevocationLink>,
}

impl ChainPolicy {
    /// The full id a VM certificate defines: prefix + leaf name.
    pub fn full_id(&self) -> VmId {
        self.prefix.child(self.name.clone())
    }
}

// ---------------------------------------------------------------------------
// CRL store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredCrl {
    number: u64,
    der: Vec<u8>,
    revoked: HashSet<Vec<u8>>,
}

/// Latest revocation list per issuer common name, with a monotonic
/// CRL-number guard against replays of stale lists.
#[derive(Debug, Clone, Default)]
pub struct CrlStore {
    by_issuer: HashMap<String, StoredCrl>,
}

impl CrlStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and install a revocation list, keyed by its issuer CN.
    ///
    /// Returns the issuer CN. Fails with a conflict if the list's CRL
    /// number is not strictly greater than the stored one.
    pub fn install(&mut self, der: &[u8]) -> Result<String> {
        let (_, crl) = CertificateRevocationList::from_der(der)
            .map_err(|e| Error::Certificate(format!("revocation list does not parse: {}", e)))?;

        let issuer = common_name_of(crl.issuer())?;
        let number = crl
            .extensions()
            .iter()
            .find(|ext| ext.oid == OID_CRL_NUMBER)
            .map(|ext| super::der::decode_integer(ext.value))
            .transpose()
            .map_err(|e| Error::Certificate(format!("revocation list number: {}", e)))?
            .unwrap_or(0);

        if let Some(stored) = self.by_issuer.get(&issuer) {
            if number <= stored.number {
                return Err(Error::Conflict("stale revocation list".to_string()));
            }
        }

        let revoked = crl
            .iter_revoked_certificates()
            .map(|rc| rc.raw_serial().to_vec())
            .collect();
        self.by_issuer.insert(
            issuer.clone(),
            StoredCrl {
                number,
                der: der.to_vec(),
                revoked,
            },
        );
        Ok(issuer)
    }

    /// Whether `issuer` has revoked `serial`.
    pub fn is_revoked(&self, issuer: &str, serial: &[u8]) -> bool {
        self.by_issuer
            .get(issuer)
            .map(|crl| crl.revoked.contains(serial))
            .unwrap_or(false)
    }

    /// Whether any link of a chain is revoked.
    pub fn revokes(&self, links: &[RevocationLink]) -> bool {
        links.iter().any(|l| self.is_revoked(&l.issuer, &l.serial))
    }

    /// The stored DER list for an issuer, for the download command.
    pub fn stored(&self, issuer: &str) -> Option<&[u8]> {
        self.by_issuer.get(issuer).map(|crl| crl.der.as_slice())
    }
}

// ---------------------------------------------------------------------------
// Chain verification
// ---------------------------------------------------------------------------

fn common_name_of(name: &x509_parser::x509::X509Name<'_>) -> Result<String> {
    name.iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string)
        .ok_or_else(|| Error::Certificate("certificate subject has no common name".to_string()))
}

/// Verify a leaf-first certificate chain against the trust root and the
/// current revocation snapshot at time `now_secs`, and project it into
/// [`ChainPolicy`].
pub fn verify_chain(
    chain_der: &[Vec<u8>],
    ca_der: &[u8],
    crls: &CrlStore,
    now_secs: i64,
) -> Result<ChainPolicy> {
    let (_, ca) = X509Certificate::from_der(ca_der)
        .map_err(|e| Error::Certificate(format!("trust root does not parse: {}", e)))?;

    // Some clients include the root; drop it, the configured CA is the
    // only anchor.
    let chain_der: Vec<&[u8]> = chain_der
        .iter()
        .map(Vec::as_slice)
        .filter(|der| *der != ca_der)
        .collect();
    if chain_der.is_empty() {
        return Err(Error::Certificate("empty certificate chain".to_string()));
    }

    let mut certs = Vec::with_capacity(chain_der.len());
    for der in &chain_der {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::Certificate(format!("peer certificate does not parse: {}", e)))?;
        certs.push(cert);
    }

    let now = ASN1Time::from_timestamp(now_secs)
        .map_err(|e| Error::Certificate(format!("clock out of ASN.1 range: {}", e)))?;

    let mut links = Vec::with_capacity(certs.len());
    for (i, cert) in certs.iter().enumerate() {
        let issuer = certs.get(i + 1).unwrap_or(&ca);
        let subject_cn = common_name_of(cert.subject())?;

        if cert.issuer().as_raw() != issuer.subject().as_raw() {
            return Err(Error::Certificate(format!(
                "issuer mismatch for certificate {}",
                subject_cn
            )));
        }
        cert.verify_signature(Some(issuer.public_key()))
            .map_err(|_| {
                Error::Certificate(format!("signature verification failed for {}", subject_cn))
            })?;
        if !cert.validity().is_valid_at(now) {
            return Err(Error::Certificate(format!(
                "certificate {} is outside its validity window",
                subject_cn
            )));
        }
        let version = version_of(cert)?;
        if version != POLICY_VERSION {
            return Err(Error::Policy(format!(
                "version mismatch: certificate {} carries {}, engine speaks {}",
                subject_cn, version, POLICY_VERSION
            )));
        }

        let issuer_cn = common_name_of(issuer.subject())?;
        if crls.is_revoked(&issuer_cn, cert.raw_serial()) {
            return Err(Error::Certificate(format!(
                "certificate {} has been revoked",
                subject_cn
            )));
        }
        links.push(RevocationLink {
            issuer: issuer_cn,
            serial: cert.raw_serial().to_vec(),
        });
    }

    let leaf = &certs[0];
    let name = common_name_of(leaf.subject())?;
    let permissions = permissions_of(leaf)?;

    // Intermediates sit between leaf and root; walk them root-side first
    // to build the prefix and the delegation ladder.
    let mut prefix = VmId::root();
    let mut delegations = Vec::new();
    for cert in certs[1..].iter().rev() {
        let cn = common_name_of(cert.subject())?;
        prefix = prefix.child(cn);
        delegations.push((prefix.clone(), delegation_of(cert)?));
    }

    let is_vm = contains_vm_image(leaf);
    let is_crl = contains_crl(leaf);
    if is_vm && is_crl {
        return Err(Error::Policy(
            "certificate is both a VM and a revocation announcement".to_string(),
        ));
    }
    let vm = if is_vm { Some(vm_config_of(leaf)?) } else { None };
    let crl = if is_crl { Some(crl_of(leaf)?) } else { None };

    Ok(ChainPolicy {
        prefix,
        name,
        permissions,
        delegations,
        vm,
        crl,
        links,
    })
}
