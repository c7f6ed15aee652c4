// Hypervisor backend driving the virsh CLI

use super::{
    BlockCounters, DomainInfo, HvResult, Hypervisor, HypervisorVersion, InterfaceCounters,
    MemoryCounters, SecretOutcome, SecretSpec, encode_version,
};
use crate::error::{AgentError, HypervisorError};
use crate::models::DomainState;
use crate::script::ScriptRunner;
use async_trait::async_trait;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::instrument;

const NOT_FOUND_MARKERS: &[&str] = &[
    "failed to get domain",
    "domain not found",
    "no domain with matching",
    "secret not found",
    "no secret with matching",
    "snapshot not found",
    "no domain snapshot with matching",
];

const CONNECT_MARKERS: &[&str] = &[
    "failed to connect to the hypervisor",
    "failed to connect socket",
    "no connection driver available",
];

pub struct VirshHypervisor {
    uri: String,
    runner: Arc<dyn ScriptRunner>,
    timeout: Duration,
}

impl VirshHypervisor {
    pub fn new(uri: &str, runner: Arc<dyn ScriptRunner>, timeout: Duration) -> Self {
        Self {
            uri: uri.to_string(),
            runner,
            timeout,
        }
    }

    async fn virsh(&self, operation: &str, args: &[&str]) -> HvResult<String> {
        let mut full = vec!["-c".to_string(), self.uri.clone()];
        full.extend(args.iter().map(|s| s.to_string()));
        let out = self
            .runner
            .run("virsh", &full, self.timeout)
            .await
            .map_err(|e| match e {
                AgentError::Timeout(m) => HypervisorError::Timeout(m),
                other => HypervisorError::ConnectionFailed(other.to_string()),
            })?;
        if out.success() {
            return Ok(out.stdout);
        }
        Err(classify(operation, &out.stderr))
    }

    /// Runs a virsh subcommand that takes an XML file argument.
    async fn virsh_with_xml(&self, operation: &str, args: &[&str], xml: &str) -> HvResult<String> {
        let file = write_temp(xml)?;
        let path = file.path().to_string_lossy().into_owned();
        let mut full: Vec<&str> = args.to_vec();
        match full.iter().position(|a| *a == "{xml}") {
            Some(i) => full[i] = &path,
            None => full.push(&path),
        }
        self.virsh(operation, &full).await
    }

    async fn set_secret_value(&self, secret: &SecretSpec) -> HvResult<()> {
        let value = write_temp(&secret.value)?;
        let path = value.path().to_string_lossy().into_owned();
        self.virsh(
            "secret-set-value",
            &[
                "secret-set-value",
                "--secret",
                &secret.uuid,
                "--file",
                &path,
                "--plain",
            ],
        )
        .await
        .map(|_| ())
    }
}

fn write_temp(contents: &str) -> HvResult<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("hostagent-")
        .suffix(".xml")
        .tempfile()
        .map_err(|e| HypervisorError::Internal(format!("temp file: {}", e)))?;
    file.write_all(contents.as_bytes())
        .map_err(|e| HypervisorError::Internal(format!("temp file write: {}", e)))?;
    Ok(file)
}

fn classify(operation: &str, stderr: &str) -> HypervisorError {
    let lower = stderr.to_lowercase();
    if NOT_FOUND_MARKERS.iter().any(|m| lower.contains(m)) {
        HypervisorError::NotFound(stderr.trim().to_string())
    } else if CONNECT_MARKERS.iter().any(|m| lower.contains(m)) {
        HypervisorError::ConnectionFailed(stderr.trim().to_string())
    } else {
        HypervisorError::failed(operation, stderr.trim())
    }
}

/// `Key:   value` lines of `virsh dominfo`.
pub(crate) fn parse_dominfo(out: &str) -> HvResult<DomainInfo> {
    let mut info = DomainInfo {
        name: String::new(),
        uuid: String::new(),
        state: DomainState::Unknown,
        persistent: false,
        cpu_time_ns: 0,
        vcpus: 0,
        max_memory_kib: 0,
        memory_kib: 0,
    };
    for line in out.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Name" => info.name = value.to_string(),
            "UUID" => info.uuid = value.to_string(),
            "State" => info.state = DomainState::from_virsh(value),
            "Persistent" => info.persistent = value == "yes",
            "CPU(s)" => info.vcpus = value.parse().unwrap_or(0),
            "CPU time" => {
                let secs: f64 = value.trim_end_matches('s').parse().unwrap_or(0.0);
                info.cpu_time_ns = (secs * 1e9) as u64;
            }
            "Max memory" => info.max_memory_kib = first_number(value),
            "Used memory" => info.memory_kib = first_number(value),
            _ => {}
        }
    }
    if info.name.is_empty() {
        return Err(HypervisorError::Internal(format!(
            "unexpected dominfo output: {}",
            out.trim()
        )));
    }
    Ok(info)
}

fn first_number(s: &str) -> u64 {
    s.split_whitespace()
        .next()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// "Using library: libvirt 9.0.0" and "Running hypervisor: QEMU 7.2.0".
pub(crate) fn parse_version(out: &str) -> HypervisorVersion {
    let mut v = HypervisorVersion::default();
    for line in out.lines() {
        let last = line.split_whitespace().last().unwrap_or("");
        if line.starts_with("Using library:") {
            v.library = encode_version(last).unwrap_or(0);
        } else if line.starts_with("Running hypervisor:") {
            v.hypervisor = encode_version(last).unwrap_or(0);
        }
    }
    v
}

/// Table rows below the dashed separator of `domiflist` / `domblklist --details`.
fn table_rows(out: &str) -> Vec<Vec<&str>> {
    out.lines()
        .skip_while(|l| !l.trim_start().starts_with("---"))
        .skip(1)
        .map(|l| l.split_whitespace().collect::<Vec<_>>())
        .filter(|cols| !cols.is_empty())
        .collect()
}

/// `<dev> <counter> <value>` lines of `domifstat` / `domblkstat`.
fn counter(out: &str, name: &str) -> u64 {
    out.lines()
        .filter_map(|l| {
            let cols: Vec<&str> = l.split_whitespace().collect();
            match cols.as_slice() {
                [_, key, value] if *key == name => value.parse().ok(),
                [key, value] if *key == name => value.parse().ok(),
                _ => None,
            }
        })
        .next()
        .unwrap_or(0)
}

/// `key value` lines of `dommemstat`.
pub(crate) fn parse_memstat(out: &str) -> MemoryCounters {
    let get = |name: &str| {
        out.lines().find_map(|l| {
            let mut it = l.split_whitespace();
            (it.next() == Some(name))
                .then(|| it.next().and_then(|v| v.parse::<u64>().ok()))
                .flatten()
        })
    };
    MemoryCounters {
        actual_kib: get("actual").unwrap_or(0),
        unused_kib: get("unused"),
        usable_kib: get("usable"),
    }
}

fn lines(out: &str) -> Vec<String> {
    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    #[instrument(skip(self), fields(backend = "virsh", operation = "version"))]
    async fn version(&self) -> HvResult<HypervisorVersion> {
        let out = self.virsh("version", &["version"]).await?;
        Ok(parse_version(&out))
    }

    async fn list_domains(&self) -> HvResult<Vec<String>> {
        let out = self.virsh("list", &["list", "--all", "--name"]).await?;
        Ok(lines(&out))
    }

    async fn domain_info(&self, name: &str) -> HvResult<DomainInfo> {
        let out = self.virsh("dominfo", &["dominfo", name]).await?;
        parse_dominfo(&out)
    }

    async fn domain_xml(&self, name: &str) -> HvResult<String> {
        self.virsh("dumpxml", &["dumpxml", name]).await
    }

    #[instrument(skip(self, xml), fields(backend = "virsh", operation = "create"))]
    async fn create_transient(&self, xml: &str) -> HvResult<()> {
        self.virsh_with_xml("create", &["create"], xml).await?;
        Ok(())
    }

    async fn undefine(&self, name: &str) -> HvResult<()> {
        self.virsh("undefine", &["undefine", name, "--nvram"])
            .await
            .map(|_| ())
    }

    async fn shutdown(&self, name: &str) -> HvResult<()> {
        self.virsh("shutdown", &["shutdown", name]).await.map(|_| ())
    }

    async fn destroy(&self, name: &str) -> HvResult<()> {
        self.virsh("destroy", &["destroy", name]).await.map(|_| ())
    }

    async fn reboot(&self, name: &str) -> HvResult<()> {
        self.virsh("reboot", &["reboot", name, "--mode", "acpi"])
            .await
            .map(|_| ())
    }

    #[instrument(skip(self), fields(backend = "virsh", operation = "migrate"))]
    async fn migrate(&self, name: &str, destination_uri: &str) -> HvResult<()> {
        self.virsh(
            "migrate",
            &["migrate", "--live", "--undefinesource", name, destination_uri],
        )
        .await
        .map(|_| ())
    }

    async fn attach_device(&self, name: &str, xml: &str) -> HvResult<()> {
        self.virsh_with_xml("attach-device", &["attach-device", name, "{xml}", "--live"], xml)
            .await
            .map(|_| ())
    }

    async fn detach_device(&self, name: &str, xml: &str) -> HvResult<()> {
        self.virsh_with_xml("detach-device", &["detach-device", name, "{xml}", "--live"], xml)
            .await
            .map(|_| ())
    }

    async fn update_device(&self, name: &str, xml: &str) -> HvResult<()> {
        self.virsh_with_xml("update-device", &["update-device", name, "{xml}", "--live"], xml)
            .await
            .map(|_| ())
    }

    async fn interface_counters(&self, name: &str) -> HvResult<Vec<InterfaceCounters>> {
        let list = self.virsh("domiflist", &["domiflist", name]).await?;
        let mut result = Vec::new();
        for row in table_rows(&list) {
            // Interface Type Source Model MAC
            let (Some(&target), Some(&mac)) = (row.first(), row.last()) else {
                continue;
            };
            if target == "-" {
                continue;
            }
            let stats = self.virsh("domifstat", &["domifstat", name, target]).await?;
            result.push(InterfaceCounters {
                target: target.to_string(),
                mac: mac.to_string(),
                rx_bytes: counter(&stats, "rx_bytes"),
                tx_bytes: counter(&stats, "tx_bytes"),
            });
        }
        Ok(result)
    }

    async fn block_counters(&self, name: &str) -> HvResult<Vec<BlockCounters>> {
        let list = self
            .virsh("domblklist", &["domblklist", name, "--details"])
            .await?;
        let mut result = Vec::new();
        for row in table_rows(&list) {
            // Type Device Target Source
            let &[_, device, target, source, ..] = row.as_slice() else {
                continue;
            };
            let mut c = BlockCounters {
                target: target.to_string(),
                path: source.to_string(),
                device: device.to_string(),
                ..Default::default()
            };
            if device == "disk" && source != "-" {
                let stats = self.virsh("domblkstat", &["domblkstat", name, target]).await?;
                c.rd_req = counter(&stats, "rd_req");
                c.wr_req = counter(&stats, "wr_req");
                c.rd_bytes = counter(&stats, "rd_bytes");
                c.wr_bytes = counter(&stats, "wr_bytes");
            }
            result.push(c);
        }
        Ok(result)
    }

    async fn memory_counters(&self, name: &str) -> HvResult<MemoryCounters> {
        let out = self.virsh("dommemstat", &["dommemstat", name]).await?;
        Ok(parse_memstat(&out))
    }

    async fn snapshot_names(&self, name: &str) -> HvResult<Vec<String>> {
        let out = self
            .virsh("snapshot-list", &["snapshot-list", name, "--name"])
            .await?;
        Ok(lines(&out))
    }

    async fn current_snapshot(&self, name: &str) -> HvResult<Option<String>> {
        match self
            .virsh("snapshot-current", &["snapshot-current", name, "--name"])
            .await
        {
            Ok(out) => Ok(lines(&out).into_iter().next()),
            Err(HypervisorError::OperationFailed { message, .. })
                if message.contains("does not have a current snapshot") =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn snapshot_xml(&self, name: &str, snapshot: &str) -> HvResult<String> {
        self.virsh("snapshot-dumpxml", &["snapshot-dumpxml", name, snapshot])
            .await
    }

    async fn delete_snapshot_metadata(&self, name: &str, snapshot: &str) -> HvResult<()> {
        self.virsh(
            "snapshot-delete",
            &["snapshot-delete", name, snapshot, "--metadata"],
        )
        .await
        .map(|_| ())
    }

    async fn redefine_snapshot(&self, name: &str, xml: &str, current: bool) -> HvResult<()> {
        let mut args = vec!["snapshot-create", name, "{xml}", "--redefine"];
        if current {
            args.push("--current");
        }
        self.virsh_with_xml("snapshot-create", &args, xml)
            .await
            .map(|_| ())
    }

    #[instrument(skip(self, secret), fields(backend = "virsh", operation = "create_or_get_secret", uuid = %secret.uuid))]
    async fn create_or_get_secret(&self, secret: &SecretSpec) -> HvResult<SecretOutcome> {
        match self
            .virsh("secret-dumpxml", &["secret-dumpxml", &secret.uuid])
            .await
        {
            Ok(_) => return Ok(SecretOutcome::Reused),
            Err(HypervisorError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        match self
            .virsh_with_xml("secret-define", &["secret-define"], &secret.to_xml())
            .await
        {
            Ok(_) => {}
            // Lost a race with another definer of the same volume.
            Err(HypervisorError::OperationFailed { message, .. })
                if message.contains("already defined") =>
            {
                return Ok(SecretOutcome::Reused);
            }
            Err(e) => return Err(e),
        }
        // A defined secret without a value would be reused as-is on the next
        // attempt, so it must not outlive a failed set-value.
        if let Err(e) = self.set_secret_value(secret).await {
            if let Err(undefine) = self.remove_secret(&secret.uuid).await {
                tracing::warn!(
                    error = %undefine,
                    operation = "secret_undefine",
                    uuid = %secret.uuid,
                    "failed to undefine secret without value"
                );
            }
            return Err(e);
        }
        Ok(SecretOutcome::Created)
    }

    async fn remove_secret(&self, uuid: &str) -> HvResult<()> {
        self.virsh("secret-undefine", &["secret-undefine", uuid])
            .await
            .map(|_| ())
    }
}
