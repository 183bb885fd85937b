//! Certificate policy: the data a client certificate chain carries and the
//! projections that extract it.
//!
//! Certificates are skua's policy datastore. Intermediate certificates
//! delegate resources to a tenant subtree; leaf certificates either carry a
//! VM definition (image + run parameters), announce a revocation list, or
//! authorize an administrative command session. Everything rides in private
//! extensions under the `1.3.6.1.4.1.49836.42` arc.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use x509_parser::certificate::X509Certificate;
use x509_parser::der_parser::{oid, oid::Oid};

use crate::{Error, Result};

pub mod chain;
pub mod der;

pub use chain::{ChainPolicy, CrlStore, RevocationLink};

/// The one policy revision this engine speaks. Required on every issued
/// certificate.
pub const POLICY_VERSION: u64 = 0;

// ---------------------------------------------------------------------------
// Object identifiers
// ---------------------------------------------------------------------------

pub const OID_VERSION: Oid<'static> = oid!(1.3.6.1.4.1.49836.42.0);
pub const OID_VMS: Oid<'static> = oid!(1.3.6.1.4.1.49836.42.1);
pub const OID_BRIDGES: Oid<'static> = oid!(1.3.6.1.4.1.49836.42.2);
pub const OID_BLOCK: Oid<'static> = oid!(1.3.6.1.4.1.49836.42.3);
pub const OID_CPUIDS: Oid<'static> = oid!(1.3.6.1.4.1.49836.42.4);
pub const OID_MEMORY: Oid<'static> = oid!(1.3.6.1.4.1.49836.42.5);
pub const OID_CPUID: Oid<'static> = oid!(1.3.6.1.4.1.49836.42.6);
pub const OID_NETWORK: Oid<'static> = oid!(1.3.6.1.4.1.49836.42.7);
pub const OID_BLOCK_DEVICE: Oid<'static> = oid!(1.3.6.1.4.1.49836.42.8);
pub const OID_VMIMAGE: Oid<'static> = oid!(1.3.6.1.4.1.49836.42.9);
pub const OID_ARGV: Oid<'static> = oid!(1.3.6.1.4.1.49836.42.10);
pub const OID_PERMISSIONS: Oid<'static> = oid!(1.3.6.1.4.1.49836.42.42);
pub const OID_CRL: Oid<'static> = oid!(1.3.6.1.4.1.49836.42.43);

/// The same arcs as component slices, for issuing tools (rcgen takes raw
/// components when attaching custom extensions).
pub mod arcs {
    pub const VERSION: &[u64] = &[1, 3, 6, 1, 4, 1, 49836, 42, 0];
    pub const VMS: &[u64] = &[1, 3, 6, 1, 4, 1, 49836, 42, 1];
    pub const BRIDGES: &[u64] = &[1, 3, 6, 1, 4, 1, 49836, 42, 2];
    pub const BLOCK: &[u64] = &[1, 3, 6, 1, 4, 1, 49836, 42, 3];
    pub const CPUIDS: &[u64] = &[1, 3, 6, 1, 4, 1, 49836, 42, 4];
    pub const MEMORY: &[u64] = &[1, 3, 6, 1, 4, 1, 49836, 42, 5];
    pub const CPUID: &[u64] = &[1, 3, 6, 1, 4, 1, 49836, 42, 6];
    pub const NETWORK: &[u64] = &[1, 3, 6, 1, 4, 1, 49836, 42, 7];
    pub const BLOCK_DEVICE: &[u64] = &[1, 3, 6, 1, 4, 1, 49836, 42, 8];
    pub const VMIMAGE: &[u64] = &[1, 3, 6, 1, 4, 1, 49836, 42, 9];
    pub const ARGV: &[u64] = &[1, 3, 6, 1, 4, 1, 49836, 42, 10];
    pub const PERMISSIONS: &[u64] = &[1, 3, 6, 1, 4, 1, 49836, 42, 42];
    pub const CRL: &[u64] = &[1, 3, 6, 1, 4, 1, 49836, 42, 43];
}

// ---------------------------------------------------------------------------
// Permissions
// ---------------------------------------------------------------------------

/// An operation a leaf certificate may authorize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Permission {
    /// Implies every other permission
    All,
    Info,
    Create,
    ForceCreate,
    Block,
    Statistics,
    Console,
    Log,
    Crl,
}

impl Permission {
    pub fn code(self) -> u64 {
        match self {
            Permission::All => 0,
            Permission::Info => 1,
            Permission::Create => 2,
            Permission::ForceCreate => 3,
            Permission::Block => 4,
            Permission::Statistics => 5,
            Permission::Console => 6,
            Permission::Log => 7,
            Permission::Crl => 8,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(Permission::All),
            1 => Some(Permission::Info),
            2 => Some(Permission::Create),
            3 => Some(Permission::ForceCreate),
            4 => Some(Permission::Block),
            5 => Some(Permission::Statistics),
            6 => Some(Permission::Console),
            7 => Some(Permission::Log),
            8 => Some(Permission::Crl),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Permission::All => "all",
            Permission::Info => "info",
            Permission::Create => "create",
            Permission::ForceCreate => "force-create",
            Permission::Block => "block",
            Permission::Statistics => "statistics",
            Permission::Console => "console",
            Permission::Log => "log",
            Permission::Crl => "crl",
        }
    }
}

/// The effective permission set of a session. `All` implies everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet(BTreeSet<Permission>);

impl PermissionSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn allows(&self, p: Permission) -> bool {
        self.0.contains(&Permission::All) || self.0.contains(&p)
    }

    pub fn insert(&mut self, p: Permission) {
        self.0.insert(p);
    }

    pub fn iter(&self) -> impl Iterator<Item = Permission> + '_ {
        self.0.iter().copied()
    }

    /// DER payload for the permissions extension: SET OF INTEGER.
    pub fn encode(&self) -> Vec<u8> {
        let mut items = Vec::new();
        for p in &self.0 {
            items.extend_from_slice(&der::integer(p.code()));
        }
        der::set(&items)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut out = BTreeSet::new();
        for code in der::decode_integer_set(data)? {
            let p = Permission::from_code(code)
                .ok_or_else(|| Error::Policy(format!("unknown permission code {}", code)))?;
            out.insert(p);
        }
        Ok(Self(out))
    }
}

impl FromIterator<Permission> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = Permission>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ---------------------------------------------------------------------------
// Delegation
// ---------------------------------------------------------------------------

/// A named bridge a tenant may attach VMs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bridge {
    /// Host-internal bridge; no address management.
    Internal,
    /// Externally routed bridge with an address range to hand out.
    External {
        start_ip: Ipv4Addr,
        end_ip: Ipv4Addr,
        router_ip: Ipv4Addr,
        netmask: u8,
    },
}

/// Resources an intermediate certificate grants to its subtree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    /// Maximum live VMs below this prefix.
    pub vms: u32,
    /// CPUs the subtree may pin VMs to.
    pub cpuids: BTreeSet<u16>,
    /// Memory budget in MB.
    pub memory_mb: u32,
    /// Block storage budget in MB, if any storage is delegated.
    pub block_mb: Option<u32>,
    /// Bridges visible to the subtree, by name.
    pub bridges: BTreeMap<String, Bridge>,
}

fn ipv4(content: &[u8]) -> Result<Ipv4Addr> {
    let octets: [u8; 4] = content
        .try_into()
        .map_err(|_| Error::Policy("der: address must be 4 octets".to_string()))?;
    Ok(Ipv4Addr::from(octets))
}

impl Bridge {
    fn encode(&self, name: &str) -> Vec<u8> {
        match self {
            Bridge::Internal => der::tlv(der::context(0, false), name.as_bytes()),
            Bridge::External {
                start_ip,
                end_ip,
                router_ip,
                netmask,
            } => {
                let mut body = der::utf8(name);
                body.extend_from_slice(&der::octets(&start_ip.octets()));
                body.extend_from_slice(&der::octets(&end_ip.octets()));
                body.extend_from_slice(&der::octets(&router_ip.octets()));
                body.extend_from_slice(&der::integer(*netmask as u64));
                der::tlv(der::context(1, true), &body)
            }
        }
    }

    fn decode(tag: u8, content: &[u8]) -> Result<(String, Bridge)> {
        if tag == der::context(0, false) {
            return Ok((der::utf8_value(content)?, Bridge::Internal));
        }
        if tag == der::context(1, true) {
            let mut r = der::Reader::new(content);
            let name = der::utf8_value(r.expect(der::TAG_UTF8_STRING)?)?;
            let start_ip = ipv4(r.expect(der::TAG_OCTET_STRING)?)?;
            let end_ip = ipv4(r.expect(der::TAG_OCTET_STRING)?)?;
            let router_ip = ipv4(r.expect(der::TAG_OCTET_STRING)?)?;
            let netmask = der::integer_value(r.expect(der::TAG_INTEGER)?)?;
            r.finish()?;
            if netmask > 32 {
                return Err(Error::Policy(format!("netmask /{} out of range", netmask)));
            }
            return Ok((
                name,
                Bridge::External {
                    start_ip,
                    end_ip,
                    router_ip,
                    netmask: netmask as u8,
                },
            ));
        }
        Err(Error::Policy(format!(
            "unknown bridge choice tag {:#04x}",
            tag
        )))
    }
}

impl Delegation {
    /// DER payload for the bridges extension: SEQUENCE OF CHOICE.
    pub fn encode_bridges(&self) -> Vec<u8> {
        let mut items = Vec::new();
        for (name, bridge) in &self.bridges {
            items.extend_from_slice(&bridge.encode(name));
        }
        der::sequence(&items)
    }

    pub fn decode_bridges(data: &[u8]) -> Result<BTreeMap<String, Bridge>> {
        let mut r = der::Reader::new(data);
        let content = r.expect(der::TAG_SEQUENCE)?;
        r.finish()?;
        let mut inner = der::Reader::new(content);
        let mut out = BTreeMap::new();
        while !inner.is_empty() {
            let (tag, item) = inner.tlv()?;
            let (name, bridge) = Bridge::decode(tag, item)?;
            out.insert(name, bridge);
        }
        Ok(out)
    }

    /// The extension payloads an issuing tool attaches to a delegation
    /// certificate, paired with their OID arcs.
    pub fn to_extensions(&self) -> Vec<(&'static [u64], Vec<u8>)> {
        let mut cpuid_items = Vec::new();
        for c in &self.cpuids {
            cpuid_items.extend_from_slice(&der::integer(*c as u64));
        }
        let mut out = vec![
            (arcs::VMS, der::integer(self.vms as u64)),
            (arcs::CPUIDS, der::set(&cpuid_items)),
            (arcs::MEMORY, der::integer(self.memory_mb as u64)),
        ];
        if let Some(block) = self.block_mb {
            out.push((arcs::BLOCK, der::integer(block as u64)));
        }
        if !self.bridges.is_empty() {
            out.push((arcs::BRIDGES, self.encode_bridges()));
        }
        out
    }
}

// ---------------------------------------------------------------------------
// VM configuration
// ---------------------------------------------------------------------------

/// A unikernel image, tagged by target.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmImage {
    Amd64(Vec<u8>),
    Arm64(Vec<u8>),
    /// Deflate-compressed amd64 payload.
    Amd64Compressed(Vec<u8>),
}

impl std::fmt::Debug for VmImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (kind, len) = match self {
            VmImage::Amd64(b) => ("amd64", b.len()),
            VmImage::Arm64(b) => ("arm64", b.len()),
            VmImage::Amd64Compressed(b) => ("amd64-compressed", b.len()),
        };
        write!(f, "VmImage::{}({} bytes)", kind, len)
    }
}

impl VmImage {
    pub fn encode(&self) -> Vec<u8> {
        let (n, payload) = match self {
            VmImage::Amd64(b) => (0, b),
            VmImage::Arm64(b) => (1, b),
            VmImage::Amd64Compressed(b) => (2, b),
        };
        der::tlv(der::context(n, false), payload)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = der::Reader::new(data);
        let (tag, payload) = r.tlv()?;
        r.finish()?;
        match tag {
            t if t == der::context(0, false) => Ok(VmImage::Amd64(payload.to_vec())),
            t if t == der::context(1, false) => Ok(VmImage::Arm64(payload.to_vec())),
            t if t == der::context(2, false) => Ok(VmImage::Amd64Compressed(payload.to_vec())),
            t => Err(Error::Policy(format!(
                "unknown image choice tag {:#04x}",
                t
            ))),
        }
    }
}

/// Run parameters a VM certificate carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    /// CPU to pin the VM to; must be delegated at every ancestor.
    pub cpuid: u16,
    /// Memory reservation in MB.
    pub requested_memory_mb: u32,
    /// Block device name and its size in MB, if storage is requested.
    pub block_device: Option<(String, u32)>,
    /// Bridge names to attach, each of which must be delegated.
    pub networks: Vec<String>,
    pub image: VmImage,
    /// Boot arguments handed to the unikernel.
    pub argv: Option<Vec<String>>,
}

impl VmConfig {
    /// The extension payloads an issuing tool attaches to a VM
    /// certificate, paired with their OID arcs.
    pub fn to_extensions(&self) -> Vec<(&'static [u64], Vec<u8>)> {
        let mut out = vec![
            (arcs::CPUID, der::integer(self.cpuid as u64)),
            (arcs::MEMORY, der::integer(self.requested_memory_mb as u64)),
            (arcs::VMIMAGE, self.image.encode()),
        ];
        if let Some((name, size)) = &self.block_device {
            out.push((arcs::BLOCK_DEVICE, der::utf8(name)));
            out.push((arcs::BLOCK, der::integer(*size as u64)));
        }
        if !self.networks.is_empty() {
            let mut items = Vec::new();
            for n in &self.networks {
                items.extend_from_slice(&der::utf8(n));
            }
            out.push((arcs::NETWORK, der::sequence(&items)));
        }
        if let Some(argv) = &self.argv {
            let mut items = Vec::new();
            for a in argv {
                items.extend_from_slice(&der::utf8(a));
            }
            out.push((arcs::ARGV, der::sequence(&items)));
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Projections
// ---------------------------------------------------------------------------

fn extension<'a>(cert: &'a X509Certificate<'_>, oid: &Oid<'_>) -> Option<&'a [u8]> {
    cert.extensions()
        .iter()
        .find(|ext| ext.oid == *oid)
        .map(|ext| ext.value)
}

fn int_extension(cert: &X509Certificate<'_>, oid: &Oid<'_>, what: &str) -> Result<Option<u64>> {
    match extension(cert, oid) {
        None => Ok(None),
        Some(data) => der::decode_integer(data)
            .map(Some)
            .map_err(|e| Error::Policy(format!("{}: {}", what, e))),
    }
}

/// The policy revision of a certificate. Required on every issued
/// certificate; its absence makes the chain unusable.
pub fn version_of(cert: &X509Certificate<'_>) -> Result<u64> {
    int_extension(cert, &OID_VERSION, "version")?
        .ok_or_else(|| Error::Policy("version extension missing".to_string()))
}

/// The permission set of a leaf certificate; empty when absent.
pub fn permissions_of(cert: &X509Certificate<'_>) -> Result<PermissionSet> {
    match extension(cert, &OID_PERMISSIONS) {
        None => Ok(PermissionSet::empty()),
        Some(data) => PermissionSet::decode(data),
    }
}

/// Whether the certificate defines a VM.
pub fn contains_vm_image(cert: &X509Certificate<'_>) -> bool {
    extension(cert, &OID_VMIMAGE).is_some()
}

/// Whether the certificate announces a revocation list.
pub fn contains_crl(cert: &X509Certificate<'_>) -> bool {
    extension(cert, &OID_CRL).is_some()
}

/// The resource grant of an intermediate certificate.
pub fn delegation_of(cert: &X509Certificate<'_>) -> Result<Delegation> {
    let vms = int_extension(cert, &OID_VMS, "vms")?
        .ok_or_else(|| Error::Policy("delegation: vms extension missing".to_string()))?;
    let memory_mb = int_extension(cert, &OID_MEMORY, "memory")?
        .ok_or_else(|| Error::Policy("delegation: memory extension missing".to_string()))?;
    let cpuids_raw = extension(cert, &OID_CPUIDS)
        .ok_or_else(|| Error::Policy("delegation: cpuids extension missing".to_string()))?;
    let mut cpuids = BTreeSet::new();
    for c in der::decode_integer_set(cpuids_raw)? {
        if c > u16::MAX as u64 {
            return Err(Error::Policy(format!("cpuid {} out of range", c)));
        }
        cpuids.insert(c as u16);
    }
    let block_mb = int_extension(cert, &OID_BLOCK, "block")?.map(|b| b as u32);
    let bridges = match extension(cert, &OID_BRIDGES) {
        None => BTreeMap::new(),
        Some(data) => Delegation::decode_bridges(data)?,
    };
    Ok(Delegation {
        vms: vms as u32,
        cpuids,
        memory_mb: memory_mb as u32,
        block_mb,
        bridges,
    })
}

/// The run parameters of a VM certificate.
pub fn vm_config_of(cert: &X509Certificate<'_>) -> Result<VmConfig> {
    let image_raw = extension(cert, &OID_VMIMAGE)
        .ok_or_else(|| Error::Policy("vm: image extension missing".to_string()))?;
    let image = VmImage::decode(image_raw)?;
    let cpuid = int_extension(cert, &OID_CPUID, "cpuid")?
        .ok_or_else(|| Error::Policy("vm: cpuid extension missing".to_string()))?;
    if cpuid > u16::MAX as u64 {
        return Err(Error::Policy(format!("cpuid {} out of range", cpuid)));
    }
    let requested_memory_mb = int_extension(cert, &OID_MEMORY, "memory")?
        .ok_or_else(|| Error::Policy("vm: memory extension missing".to_string()))?;

    let block_name = match extension(cert, &OID_BLOCK_DEVICE) {
        None => None,
        Some(data) => Some(der::decode_utf8(data)?),
    };
    let block_size = int_extension(cert, &OID_BLOCK, "block")?;
    let block_device = match (block_name, block_size) {
        (None, None) => None,
        (Some(name), Some(size)) => Some((name, size as u32)),
        (Some(_), None) => {
            return Err(Error::Policy("vm: block device without a size".to_string()))
        }
        (None, Some(_)) => {
            return Err(Error::Policy("vm: block size without a device".to_string()))
        }
    };

    let networks = match extension(cert, &OID_NETWORK) {
        None => Vec::new(),
        Some(data) => der::decode_utf8_seq(data)?,
    };
    let argv = match extension(cert, &OID_ARGV) {
        None => None,
        Some(data) => Some(der::decode_utf8_seq(data)?),
    };

    Ok(VmConfig {
        cpuid: cpuid as u16,
        requested_memory_mb: requested_memory_mb as u32,
        block_device,
        networks,
        image,
        argv,
    })
}

/// The DER revocation list a CRL announcement carries.
pub fn crl_of(cert: &X509Certificate<'_>) -> Result<Vec<u8>> {
    let data = extension(cert, &OID_CRL)
        .ok_or_else(|| Error::Policy("crl extension missing".to_string()))?;
    der::decode_octets(data)
}
