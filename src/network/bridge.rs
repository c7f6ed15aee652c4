// Linux bridge inspection: physical interface lookup and broadcast URI derivation

use std::path::Path;
use tracing::debug;

/// Interface name prefixes that identify a physical (or bonded/vlan) link, in match order.
const IF_PREFIXES: &[&str] = &[
    "eth", "bond", "vlan", "vx", "em", "ens", "eno", "enp", "team", "enx", "dummy", "lo",
];

/// `pXpY` style names (p1p1, p2p3).
fn is_pci_slot_name(name: &str) -> bool {
    let Some(rest) = name.strip_prefix('p') else {
        return false;
    };
    let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return false;
    }
    let Some(rest) = rest[digits..].strip_prefix('p') else {
        return false;
    };
    rest.chars().next().is_some_and(|c| c.is_ascii_digit())
}

pub fn is_interface(name: &str) -> bool {
    IF_PREFIXES.iter().any(|p| name.starts_with(p))
        || is_pci_slot_name(name)
        || name.starts_with("vni")
}

/// First physical interface enslaved to `bridge`, or the name itself when it is
/// already a physical interface.
pub async fn match_pif(sysfs_net_dir: &Path, bridge: &str) -> Option<String> {
    let brif = sysfs_net_dir.join(bridge).join("brif");
    let Ok(mut entries) = tokio::fs::read_dir(&brif).await else {
        if is_interface(bridge) {
            return Some(bridge.to_string());
        }
        debug!(bridge, path = %brif.display(), "no brif directory for bridge");
        return None;
    };
    let mut names = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    names.into_iter().find(|n| is_interface(n))
}

/// Whether any port other than a physical interface is attached to the bridge.
pub async fn has_guest_ports(sysfs_net_dir: &Path, bridge: &str) -> bool {
    let brif = sysfs_net_dir.join(bridge).join("brif");
    let Ok(mut entries) = tokio::fs::read_dir(&brif).await else {
        return false;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if !is_interface(&entry.file_name().to_string_lossy()) {
            return true;
        }
    }
    false
}

pub async fn bridge_exists(sysfs_net_dir: &Path, bridge: &str) -> bool {
    tokio::fs::metadata(sysfs_net_dir.join(bridge).join("bridge"))
        .await
        .is_ok()
        || tokio::fs::metadata(sysfs_net_dir.join(bridge).join("brif"))
            .await
            .is_ok()
}

/// Alternating non-digit/digit runs of `s`, starting at the first non-digit run.
/// Mirrors the groups of `(\D+)(\d+)(\D*)(\d*)(\D*)(\d*)`.
fn name_groups(s: &str) -> Option<[&str; 6]> {
    let start = s.find(|c: char| !c.is_ascii_digit())?;
    let mut groups = [""; 6];
    let mut rest = &s[start..];
    for (i, group) in groups.iter_mut().enumerate() {
        let want_digit = i % 2 == 1;
        let end = rest
            .find(|c: char| c.is_ascii_digit() != want_digit)
            .unwrap_or(rest.len());
        *group = &rest[..end];
        rest = &rest[end..];
    }
    if groups[1].is_empty() {
        return None;
    }
    Some(groups)
}

/// Broadcast URI implied by a bridge and its physical interface:
/// `vxlan://N` for `brvx*` bridges, `vlan://N` for a tagged pif, `None` when untagged.
pub fn broadcast_uri_from_pif(bridge: &str, pif: &str) -> Option<String> {
    let g = name_groups(pif)?;
    if bridge.starts_with("brvx") {
        return Some(format!("vxlan://{}", g[1]));
    }
    if !g[5].is_empty() {
        Some(format!("vlan://{}", g[5]))
    } else if !g[3].is_empty() {
        Some(format!("vlan://{}", g[3]))
    } else {
        None
    }
}

/// The `N` of a `br<pif>-N` bridge name.
pub fn vlan_id_from_bridge(bridge: &str) -> Option<&str> {
    let mut parts = bridge.split('-');
    parts.next()?;
    parts.next().filter(|s| !s.is_empty())
}

pub fn vlan_bridge_name(pif: &str, vlan: u32) -> String {
    format!("br{}-{}", pif, vlan)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_prefixes() {
        for name in ["eth0", "bond1", "ens3", "enp0s31f6", "p2p1", "vni100", "team0", "lo"] {
            assert!(is_interface(name), "{name}");
        }
        for name in ["vnet0", "virbr0", "cloudbr0", "pp1", "p1x"] {
            assert!(!is_interface(name), "{name}");
        }
    }

    #[test]
    fn broadcast_uri_derivation() {
        assert_eq!(
            broadcast_uri_from_pif("breth0-100", "eth0.100").as_deref(),
            Some("vlan://100")
        );
        assert_eq!(
            broadcast_uri_from_pif("brbond0-300", "bond0.200.300").as_deref(),
            Some("vlan://300")
        );
        assert_eq!(broadcast_uri_from_pif("cloudbr0", "eth0"), None);
        assert_eq!(
            broadcast_uri_from_pif("brvx-5001", "vxlan5001").as_deref(),
            Some("vxlan://5001")
        );
        assert_eq!(broadcast_uri_from_pif("br0", "eth"), None);
    }

    #[test]
    fn vlan_from_bridge_name() {
        assert_eq!(vlan_id_from_bridge("breth0-100"), Some("100"));
        assert_eq!(vlan_id_from_bridge("cloudbr0"), None);
        assert_eq!(vlan_bridge_name("eth1", 42), "breth1-42");
    }

    #[tokio::test]
    async fn pif_lookup_prefers_physical_ports() {
        let dir = tempfile::tempdir().unwrap();
        let brif = dir.path().join("cloudbr0").join("brif");
        std::fs::create_dir_all(&brif).unwrap();
        std::fs::write(brif.join("vnet3"), b"").unwrap();
        std::fs::write(brif.join("eth1"), b"").unwrap();
        assert_eq!(match_pif(dir.path(), "cloudbr0").await.as_deref(), Some("eth1"));
        assert!(has_guest_ports(dir.path(), "cloudbr0").await);
        assert_eq!(match_pif(dir.path(), "eth2").await.as_deref(), Some("eth2"));
        assert_eq!(match_pif(dir.path(), "nothere").await, None);
    }
}
