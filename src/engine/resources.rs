//! The delegation resource algebra.
//!
//! Every ancestor prefix of a VM's id carries a grant; a create is
//! admitted only if, at every level, the live draw under that prefix plus
//! the new request stays inside the grant. The first violated constraint
//! is reported by name so the requesting client sees exactly what ran out.

use std::collections::HashMap;

use crate::id::VmId;
use crate::policy::{Delegation, VmConfig};

use super::RunningVm;

/// Check a create request against the delegation ladder of its chain,
/// given the currently live VMs. `exclude` names a VM about to be
/// pre-empted, which must not count against any budget.
pub fn check_create(
    delegations: &[(VmId, Delegation)],
    live: &HashMap<VmId, RunningVm>,
    exclude: Option<&VmId>,
    cfg: &VmConfig,
) -> Result<(), String> {
    for (prefix, grant) in delegations {
        let under: Vec<&RunningVm> = live
            .values()
            .filter(|vm| Some(&vm.id) != exclude && vm.id.starts_with(prefix))
            .collect();

        let slots_remaining = grant.vms.saturating_sub(under.len() as u32);
        if slots_remaining < 1 {
            return Err(format!("vms: 1 > {} remaining", slots_remaining));
        }

        let memory_used: u32 = under.iter().map(|vm| vm.requested_memory_mb).sum();
        let memory_remaining = grant.memory_mb.saturating_sub(memory_used);
        if cfg.requested_memory_mb > memory_remaining {
            return Err(format!(
                "memory: {} > {} remaining",
                cfg.requested_memory_mb, memory_remaining
            ));
        }

        if !grant.cpuids.contains(&cfg.cpuid) {
            return Err(format!("cpuid: {} not delegated", cfg.cpuid));
        }

        for net in &cfg.networks {
            if !grant.bridges.contains_key(net) {
                return Err(format!("network: unknown bridge {}", net));
            }
        }

        if let Some((_, size)) = &cfg.block_device {
            let Some(cap) = grant.block_mb else {
                return Err("block: not delegated".to_string());
            };
            let block_used: u32 = under
                .iter()
                .filter_map(|vm| vm.block.as_ref().map(|(_, s)| *s))
                .sum();
            let block_remaining = cap.saturating_sub(block_used);
            if *size > block_remaining {
                return Err(format!("block: {} > {} remaining", size, block_remaining));
            }
        }
    }
    Ok(())
}
