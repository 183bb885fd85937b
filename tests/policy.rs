//! Policy projection and revocation against real certificate material.
//!
//! Chains are minted with rcgen the way an issuing tool would: custom
//! extensions under the private arc carry the delegation, permissions,
//! VM configuration, and revocation announcements.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use rcgen::{
    BasicConstraints, CertificateParams, CertificateRevocationListParams, CustomExtension, DnType,
    IsCa, KeyIdMethod, KeyPair, RevokedCertParams, SerialNumber,
};

use skua::engine::{Effect, Engine, InitialAction};
use skua::id::VmId;
use skua::policy::chain::verify_chain;
use skua::policy::{
    arcs, der, Bridge, CrlStore, Delegation, Permission, PermissionSet, VmConfig, VmImage,
    POLICY_VERSION,
};

// =============================================================================
// ISSUING HELPERS
// =============================================================================

struct Issued {
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl Issued {
    fn der(&self) -> Vec<u8> {
        self.cert.der().as_ref().to_vec()
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn version_ext() -> CustomExtension {
    CustomExtension::from_oid_content(arcs::VERSION, der::integer(POLICY_VERSION))
}

fn root_ca() -> Issued {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, "skua-root");
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let cert = params.self_signed(&key).unwrap();
    Issued { cert, key }
}

fn delegation_cert(cn: &str, serial: u64, grant: &Delegation, issuer: &Issued) -> Issued {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, cn);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.serial_number = Some(SerialNumber::from(serial));
    params.custom_extensions.push(version_ext());
    for (oid, content) in grant.to_extensions() {
        params
            .custom_extensions
            .push(CustomExtension::from_oid_content(oid, content));
    }
    let cert = params.signed_by(&key, &issuer.cert, &issuer.key).unwrap();
    Issued { cert, key }
}

fn leaf_cert(cn: &str, extensions: Vec<CustomExtension>, issuer: &Issued) -> Issued {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, cn);
    params.custom_extensions.push(version_ext());
    params.custom_extensions.extend(extensions);
    let cert = params.signed_by(&key, &issuer.cert, &issuer.key).unwrap();
    Issued { cert, key }
}

fn vm_extensions(config: &VmConfig) -> Vec<CustomExtension> {
    config
        .to_extensions()
        .into_iter()
        .map(|(oid, content)| CustomExtension::from_oid_content(oid, content))
        .collect()
}

fn permissions_ext(list: &[Permission]) -> CustomExtension {
    let set: PermissionSet = list.iter().copied().collect();
    CustomExtension::from_oid_content(arcs::PERMISSIONS, set.encode())
}

fn crl_announcement_ext(crl_der: &[u8]) -> CustomExtension {
    CustomExtension::from_oid_content(arcs::CRL, der::octets(crl_der))
}

/// A revocation list from `issuer` revoking the given serials.
fn make_crl(issuer: &Issued, crl_number: u64, serials: &[u64]) -> Vec<u8> {
    let now = time::OffsetDateTime::now_utc();
    let params = CertificateRevocationListParams {
        this_update: now,
        next_update: now + time::Duration::days(30),
        crl_number: SerialNumber::from(crl_number),
        issuing_distribution_point: None,
        revoked_certs: serials
            .iter()
            .map(|serial| RevokedCertParams {
                serial_number: SerialNumber::from(*serial),
                revocation_time: now,
                reason_code: None,
                invalidity_date: None,
            })
            .collect(),
        key_identifier_method: KeyIdMethod::Sha256,
    };
    params
        .signed_by(&issuer.cert, &issuer.key)
        .unwrap()
        .der()
        .as_ref()
        .to_vec()
}

fn sample_delegation() -> Delegation {
    let mut bridges = BTreeMap::new();
    bridges.insert("service".to_string(), Bridge::Internal);
    Delegation {
        vms: 2,
        cpuids: BTreeSet::from([0, 1]),
        memory_mb: 256,
        block_mb: Some(1024),
        bridges,
    }
}

fn sample_vm_config() -> VmConfig {
    VmConfig {
        cpuid: 0,
        requested_memory_mb: 128,
        block_device: None,
        networks: vec!["service".to_string()],
        image: VmImage::Amd64(vec![0x7F, b'E', b'L', b'F', 1, 2, 3]),
        argv: Some(vec!["--hello".to_string()]),
    }
}

fn vm_id(parts: &[&str]) -> VmId {
    VmId::new(parts.iter().map(|s| s.to_string()).collect())
}

// =============================================================================
// PROJECTION
// =============================================================================

#[test]
fn vm_chain_projects_prefix_delegation_and_config() {
    let ca = root_ca();
    let grant = sample_delegation();
    let tenant = delegation_cert("tenant", 10, &grant, &ca);
    let config = sample_vm_config();
    let mut exts = vm_extensions(&config);
    exts.push(permissions_ext(&[Permission::Create]));
    let leaf = leaf_cert("vm1", exts, &tenant);

    let policy = verify_chain(
        &[leaf.der(), tenant.der()],
        ca.cert.der().as_ref(),
        &CrlStore::new(),
        now_secs(),
    )
    .unwrap();

    assert_eq!(policy.prefix, vm_id(&["tenant"]));
    assert_eq!(policy.name, "vm1");
    assert_eq!(policy.full_id(), vm_id(&["tenant", "vm1"]));
    assert!(policy.permissions.allows(Permission::Create));
    assert!(!policy.permissions.allows(Permission::Crl));
    assert_eq!(policy.delegations, vec![(vm_id(&["tenant"]), grant)]);
    assert_eq!(policy.vm.as_ref(), Some(&config));
    assert!(policy.crl.is_none());
    // Two links: the leaf issued by tenant, tenant issued by the root.
    assert_eq!(policy.links.len(), 2);
    assert_eq!(policy.links[0].issuer, "tenant");
    assert_eq!(policy.links[1].issuer, "skua-root");
}

#[test]
fn admin_leaf_under_the_root_has_an_empty_prefix() {
    let ca = root_ca();
    let leaf = leaf_cert(
        "operator",
        vec![permissions_ext(&[Permission::All])],
        &ca,
    );
    let policy = verify_chain(
        &[leaf.der()],
        ca.cert.der().as_ref(),
        &CrlStore::new(),
        now_secs(),
    )
    .unwrap();
    assert!(policy.prefix.is_root());
    assert!(policy.vm.is_none());
    assert!(policy.crl.is_none());
    assert!(policy.permissions.allows(Permission::Statistics));
}

#[test]
fn version_mismatch_is_fatal_for_the_chain() {
    let ca = root_ca();
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, "future");
    params
        .custom_extensions
        .push(CustomExtension::from_oid_content(
            arcs::VERSION,
            der::integer(POLICY_VERSION + 1),
        ));
    let cert = params.signed_by(&key, &ca.cert, &ca.key).unwrap();

    let err = verify_chain(
        &[cert.der().as_ref().to_vec()],
        ca.cert.der().as_ref(),
        &CrlStore::new(),
        now_secs(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("version mismatch"), "{}", err);
}

#[test]
fn missing_version_extension_is_rejected() {
    let ca = root_ca();
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, "bare");
    let cert = params.signed_by(&key, &ca.cert, &ca.key).unwrap();

    let err = verify_chain(
        &[cert.der().as_ref().to_vec()],
        ca.cert.der().as_ref(),
        &CrlStore::new(),
        now_secs(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("version extension missing"));
}

#[test]
fn a_leaf_cannot_be_both_vm_and_revocation_announcement() {
    let ca = root_ca();
    let crl = make_crl(&ca, 1, &[]);
    let mut exts = vm_extensions(&sample_vm_config());
    exts.push(crl_announcement_ext(&crl));
    let leaf = leaf_cert("confused", exts, &ca);

    let err = verify_chain(
        &[leaf.der()],
        ca.cert.der().as_ref(),
        &CrlStore::new(),
        now_secs(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("both a VM and a revocation"));
}

#[test]
fn chains_not_anchored_at_the_root_are_rejected() {
    let ca = root_ca();
    let other = root_ca();
    let leaf = leaf_cert("stranger", vec![], &other);

    let err = verify_chain(
        &[leaf.der()],
        ca.cert.der().as_ref(),
        &CrlStore::new(),
        now_secs(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("signature verification failed"));
}

// =============================================================================
// REVOCATION
// =============================================================================

#[test]
fn revoked_intermediate_blocks_the_chain() {
    let ca = root_ca();
    let tenant = delegation_cert("tenant", 10, &sample_delegation(), &ca);
    let leaf = leaf_cert("vm1", vm_extensions(&sample_vm_config()), &tenant);

    let mut crls = CrlStore::new();
    crls.install(&make_crl(&ca, 1, &[10])).unwrap();

    let err = verify_chain(
        &[leaf.der(), tenant.der()],
        ca.cert.der().as_ref(),
        &crls,
        now_secs(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("revoked"), "{}", err);
}

#[test]
fn stale_revocation_lists_are_rejected() {
    let ca = root_ca();
    let mut crls = CrlStore::new();
    let issuer = crls.install(&make_crl(&ca, 2, &[10])).unwrap();
    assert_eq!(issuer, "skua-root");
    assert!(crls.is_revoked("skua-root", &[10]));

    let err = crls.install(&make_crl(&ca, 2, &[10, 11])).unwrap_err();
    assert_eq!(err.to_string(), "Conflict: stale revocation list");
    let err = crls.install(&make_crl(&ca, 1, &[10, 11])).unwrap_err();
    assert!(err.to_string().contains("stale revocation list"));
    // The stored list is unchanged.
    assert!(!crls.is_revoked("skua-root", &[11]));

    crls.install(&make_crl(&ca, 3, &[10, 11])).unwrap();
    assert!(crls.is_revoked("skua-root", &[11]));
}

// =============================================================================
// ENGINE INTEGRATION: revocation sweeps live VMs
// =============================================================================

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{}", port).parse().unwrap()
}

/// Boot a VM through the engine from a real certificate chain.
fn boot_from_chain(
    engine: &mut Engine,
    port: u16,
    chain: &[Vec<u8>],
    ca_der: &[u8],
    pid: u32,
) -> VmId {
    let policy = verify_chain(chain, ca_der, engine.crls(), now_secs()).unwrap();
    let creator = addr(port);
    let (action, _) = engine.handle_initial(creator, policy);
    assert_eq!(action, InitialAction::Create);
    let effects = engine.handle_command(creator, skua_wire::Frame::bare(skua_wire::Tag::Create));
    let req = effects
        .into_iter()
        .find_map(|e| match e {
            Effect::Spawn(req) => Some(req),
            _ => None,
        })
        .expect("create admitted");
    let id = req.id.clone();
    engine.vm_started(*req, pid, 1_000);
    id
}

/// An admin posts a CRL revoking the `tenant` intermediate: both VMs
/// under tenant/* die, the admin session closes, and a VM under other/*
/// survives.
#[test]
fn crl_install_destroys_vms_under_the_revoked_issuer() {
    let ca = root_ca();
    let ca_der = ca.cert.der().as_ref().to_vec();
    let tenant = delegation_cert("tenant", 10, &sample_delegation(), &ca);
    let other = delegation_cert("other", 20, &sample_delegation(), &ca);

    let mut engine = Engine::new("/tmp/skua-test");
    let mut config = sample_vm_config();
    config.networks.clear();

    let mut creates = vm_extensions(&config);
    creates.push(permissions_ext(&[Permission::Create]));
    let vm1 = leaf_cert("vm1", creates.clone(), &tenant);
    let vm2 = leaf_cert("vm2", creates.clone(), &tenant);
    let vm3 = leaf_cert("vm3", creates, &other);

    let id1 = boot_from_chain(&mut engine, 1, &[vm1.der(), tenant.der()], &ca_der, 101);
    let id2 = boot_from_chain(&mut engine, 2, &[vm2.der(), tenant.der()], &ca_der, 102);
    let id3 = boot_from_chain(&mut engine, 3, &[vm3.der(), other.der()], &ca_der, 103);
    assert_eq!(engine.vm_count(), 3);

    // Admin announces a CRL revoking the tenant intermediate.
    let crl = make_crl(&ca, 1, &[10]);
    let admin = leaf_cert(
        "revoker",
        vec![permissions_ext(&[Permission::Crl]), crl_announcement_ext(&crl)],
        &ca,
    );
    let policy = verify_chain(&[admin.der()], &ca_der, engine.crls(), now_secs()).unwrap();
    assert!(policy.crl.is_some());

    let admin_addr = addr(4);
    let (action, effects) = engine.handle_initial(admin_addr, policy);
    assert_eq!(action, InitialAction::Close);

    let killed: Vec<u32> = effects
        .iter()
        .filter_map(|e| match e {
            Effect::Kill { pid } => Some(*pid),
            _ => None,
        })
        .collect();
    assert_eq!(killed.len(), 2);
    assert!(killed.contains(&101) && killed.contains(&102));

    // The destroys precede the acknowledgement.
    let ack_position = effects
        .iter()
        .position(|e| matches!(e, Effect::Send { frame, .. } if frame.tag == skua_wire::Tag::Success))
        .expect("install acknowledged");
    let last_kill = effects
        .iter()
        .rposition(|e| matches!(e, Effect::Kill { .. }))
        .unwrap();
    assert!(last_kill < ack_position);

    assert!(engine.vm(&id1).is_none());
    assert!(engine.vm(&id2).is_none());
    assert!(engine.vm(&id3).is_some(), "unrelated vm must survive");

    // A fresh session from the revoked subtree is now refused outright.
    let vm4 = leaf_cert(
        "vm4",
        vm_extensions(&config)
            .into_iter()
            .chain([permissions_ext(&[Permission::Create])])
            .collect(),
        &tenant,
    );
    let err = verify_chain(
        &[vm4.der(), tenant.der()],
        &ca_der,
        engine.crls(),
        now_secs(),
    )
    .unwrap_err();
    assert!(err.to_string().contains("revoked"));
    assert_eq!(id3, vm_id(&["other", "vm3"]));
}
