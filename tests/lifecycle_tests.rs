// Lifecycle controller against the in-memory hypervisor

mod common;

use common::*;
use hostagent::error::AgentError;
use hostagent::hypervisor::{Hypervisor, domxml};
use hostagent::lifecycle::LifecycleState;
use hostagent::models::{DiskRole, DomainState};
use std::collections::BTreeMap;

#[tokio::test]
async fn start_creates_running_transient_domain() {
    let host = TestHost::new();
    host.volume("root.img");
    let agent = host.agent().await;
    let spec = vm_spec(VM_NAME, "root.img");

    agent.lifecycle.start(&spec).await.unwrap();

    let info = host.hv.domain_info(VM_NAME).await.unwrap();
    assert_eq!(info.state, DomainState::Running);
    assert!(!info.persistent);
    assert_eq!(agent.lifecycle.state(VM_NAME), Some(LifecycleState::Running));

    let xml = host.hv.domain_xml(VM_NAME).await.unwrap();
    let disks = domxml::parse_disks(&xml);
    assert!(disks.iter().any(|d| d.device == "disk"
        && d.source.as_deref().is_some_and(|s| s.ends_with("root.img"))));
    assert!(disks.iter().any(|d| d.device == "cdrom"));
    let nics = domxml::parse_interfaces(&xml);
    assert_eq!(nics.len(), 1);
    assert_eq!(nics[0].bridge.as_deref(), Some("cloudbr1"));
}

#[tokio::test]
async fn start_replaces_persistent_definition() {
    let host = TestHost::new();
    host.volume("root.img");
    host.hv
        .define_persistent(&format!(
            "<domain><name>{}</name><uuid>old</uuid><memory>1024</memory><devices></devices></domain>",
            VM_NAME
        ))
        .unwrap();
    let agent = host.agent().await;

    agent
        .lifecycle
        .start(&vm_spec(VM_NAME, "root.img"))
        .await
        .unwrap();

    let info = host.hv.domain_info(VM_NAME).await.unwrap();
    assert!(!info.persistent);
    assert_eq!(info.state, DomainState::Running);
    assert!(host.hv.calls().iter().any(|c| c == &format!("undefine {}", VM_NAME)));
}

#[tokio::test]
async fn start_with_missing_volume_fails_and_leaves_no_state() {
    let host = TestHost::new();
    let agent = host.agent().await;
    let err = agent
        .lifecycle
        .start(&vm_spec(VM_NAME, "absent.img"))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::NotFound(_)));
    assert_eq!(agent.lifecycle.state(VM_NAME), None);
    assert!(!host.hv.has_domain(VM_NAME));
}

#[tokio::test]
async fn graceful_stop_removes_domain() {
    let host = TestHost::new();
    host.volume("root.img");
    let agent = host.agent().await;
    agent
        .lifecycle
        .start(&vm_spec(VM_NAME, "root.img"))
        .await
        .unwrap();

    let outcome = agent.lifecycle.stop(VM_NAME, false).await.unwrap();
    assert!(!outcome.forced);
    assert!(!outcome.already_stopped);
    assert!(!host.hv.has_domain(VM_NAME));
    assert_eq!(agent.lifecycle.state(VM_NAME), Some(LifecycleState::ShutOff));
}

#[tokio::test]
async fn stop_escalates_to_force_when_guest_ignores_shutdown() {
    let host = TestHost::new();
    host.volume("root.img");
    let agent = host.agent().await;
    agent
        .lifecycle
        .start(&vm_spec(VM_NAME, "root.img"))
        .await
        .unwrap();
    host.hv.set_ignores_shutdown(VM_NAME, true).unwrap();

    let outcome = agent.lifecycle.stop(VM_NAME, false).await.unwrap();
    assert!(outcome.forced);
    let calls = host.hv.calls();
    assert!(calls.iter().any(|c| c == &format!("shutdown {}", VM_NAME)));
    assert!(calls.iter().any(|c| c == &format!("destroy {}", VM_NAME)));
    assert!(!host.hv.has_domain(VM_NAME));
}

#[tokio::test]
async fn stopping_unknown_vm_is_already_stopped() {
    let host = TestHost::new();
    let agent = host.agent().await;
    let outcome = agent.lifecycle.stop("i-9-99-VM", false).await.unwrap();
    assert!(outcome.already_stopped);
}

#[tokio::test]
async fn stopping_shut_off_persistent_vm_changes_nothing() {
    let host = TestHost::new();
    host.hv
        .define_persistent(&format!(
            "<domain><name>{}</name><uuid>old</uuid><memory>1024</memory><devices></devices></domain>",
            VM_NAME
        ))
        .unwrap();
    host.hv
        .add_snapshot(
            VM_NAME,
            "s1",
            "<domainsnapshot><name>s1</name></domainsnapshot>",
            true,
        )
        .unwrap();
    let agent = host.agent().await;

    let outcome = agent.lifecycle.stop(VM_NAME, false).await.unwrap();
    assert!(outcome.already_stopped);
    assert_eq!(host.hv.snapshot_names(VM_NAME).await.unwrap(), vec!["s1"]);
    assert!(agent.lifecycle.saved_snapshots(VM_NAME).is_empty());
    let calls = host.hv.calls();
    assert!(!calls.iter().any(|c| c.starts_with("delete_snapshot_metadata")));
    assert!(!calls.iter().any(|c| c.starts_with("shutdown")));
}

#[tokio::test]
async fn lost_connection_during_shutdown_fails_the_stop() {
    let host = TestHost::new();
    host.volume("root.img");
    let agent = host.agent().await;
    agent
        .lifecycle
        .start(&vm_spec(VM_NAME, "root.img"))
        .await
        .unwrap();
    host.hv.drop_connection_on("shutdown");

    let err = agent.lifecycle.stop(VM_NAME, false).await.unwrap_err();
    assert!(err.is_connectivity());
    assert_eq!(agent.lifecycle.state(VM_NAME), Some(LifecycleState::Running));

    host.hv.set_unreachable(false);
    let info = host.hv.domain_info(VM_NAME).await.unwrap();
    assert_eq!(info.state, DomainState::Running);
}

#[tokio::test]
async fn failed_snapshot_deletion_loses_no_metadata() {
    let host = TestHost::new();
    host.volume("root.img");
    let agent = host.agent().await;
    let spec = vm_spec(VM_NAME, "root.img");
    agent.lifecycle.start(&spec).await.unwrap();
    for name in ["s1", "s2", "s3"] {
        let xml = format!("<domainsnapshot><name>{}</name></domainsnapshot>", name);
        host.hv.add_snapshot(VM_NAME, name, &xml, name == "s3").unwrap();
    }
    host.hv.fail_call("delete_snapshot_metadata", 1);

    agent.lifecycle.stop(VM_NAME, false).await.unwrap();
    assert!(!host.hv.has_domain(VM_NAME));
    assert_eq!(agent.lifecycle.saved_snapshots(VM_NAME).len(), 3);

    agent.lifecycle.start(&spec).await.unwrap();
    assert_eq!(
        host.hv.snapshot_names(VM_NAME).await.unwrap(),
        vec!["s1", "s2", "s3"]
    );
    assert_eq!(
        host.hv.current_snapshot(VM_NAME).await.unwrap().as_deref(),
        Some("s3")
    );
}

#[tokio::test]
async fn domain_locks_are_released_after_stop() {
    let host = TestHost::new();
    host.volume("root.img");
    let agent = host.agent().await;
    agent
        .lifecycle
        .start(&vm_spec(VM_NAME, "root.img"))
        .await
        .unwrap();
    assert_eq!(agent.lifecycle.tracked_locks(), 1);

    agent.lifecycle.stop(VM_NAME, false).await.unwrap();
    assert_eq!(agent.lifecycle.tracked_locks(), 0);
    agent.lifecycle.forget_stopped(VM_NAME);
    assert_eq!(agent.lifecycle.state(VM_NAME), None);
}

#[tokio::test]
async fn snapshot_metadata_survives_stop_and_start() {
    let host = TestHost::new();
    host.volume("root.img");
    let agent = host.agent().await;
    let spec = vm_spec(VM_NAME, "root.img");
    agent.lifecycle.start(&spec).await.unwrap();
    host.hv
        .add_snapshot(
            VM_NAME,
            "before-upgrade",
            "<domainsnapshot><name>before-upgrade</name></domainsnapshot>",
            true,
        )
        .unwrap();

    agent.lifecycle.stop(VM_NAME, false).await.unwrap();
    assert_eq!(agent.lifecycle.saved_snapshots(VM_NAME).len(), 1);

    agent.lifecycle.start(&spec).await.unwrap();
    assert_eq!(
        host.hv.snapshot_names(VM_NAME).await.unwrap(),
        vec!["before-upgrade"]
    );
    assert_eq!(
        host.hv.current_snapshot(VM_NAME).await.unwrap().as_deref(),
        Some("before-upgrade")
    );
    assert!(agent.lifecycle.saved_snapshots(VM_NAME).is_empty());
}

#[tokio::test]
async fn detach_of_unattached_volume_is_an_operation_error() {
    let host = TestHost::new();
    host.volume("root.img");
    let data = host.volume("data.img");
    let agent = host.agent().await;
    agent
        .lifecycle
        .start(&vm_spec(VM_NAME, "root.img"))
        .await
        .unwrap();

    let err = agent
        .lifecycle
        .detach_volume(VM_NAME, &disk("vol-data", DiskRole::Data, 1, "data.img"))
        .await
        .unwrap_err();
    match err {
        AgentError::Operation(msg) => {
            assert_eq!(
                msg,
                format!("disk: {} is not attached before", data.display())
            );
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn volume_attach_then_detach() {
    let host = TestHost::new();
    host.volume("root.img");
    host.volume("data.img");
    let agent = host.agent().await;
    agent
        .lifecycle
        .start(&vm_spec(VM_NAME, "root.img"))
        .await
        .unwrap();
    let data = disk("vol-data", DiskRole::Data, 1, "data.img");

    agent.lifecycle.attach_volume(VM_NAME, &data).await.unwrap();
    let xml = host.hv.domain_xml(VM_NAME).await.unwrap();
    let attached = domxml::parse_disks(&xml)
        .into_iter()
        .find(|d| d.source.as_deref().is_some_and(|s| s.ends_with("data.img")))
        .expect("data disk attached");
    assert_eq!(attached.bus.as_deref(), Some("virtio"));

    agent.lifecycle.detach_volume(VM_NAME, &data).await.unwrap();
    let xml = host.hv.domain_xml(VM_NAME).await.unwrap();
    assert!(
        !domxml::parse_disks(&xml)
            .iter()
            .any(|d| d.source.as_deref().is_some_and(|s| s.ends_with("data.img")))
    );
}

#[tokio::test]
async fn iso_insert_and_eject() {
    let host = TestHost::new();
    host.volume("root.img");
    let agent = host.agent().await;
    agent
        .lifecycle
        .start(&vm_spec(VM_NAME, "root.img"))
        .await
        .unwrap();

    agent
        .lifecycle
        .attach_iso(VM_NAME, "/isos/tools.iso", true)
        .await
        .unwrap();
    let cdrom = |xml: &str| {
        domxml::parse_disks(xml)
            .into_iter()
            .find(|d| d.device == "cdrom")
            .unwrap()
    };
    let xml = host.hv.domain_xml(VM_NAME).await.unwrap();
    assert_eq!(cdrom(&xml).source.as_deref(), Some("/isos/tools.iso"));

    agent
        .lifecycle
        .attach_iso(VM_NAME, "/isos/tools.iso", false)
        .await
        .unwrap();
    let xml = host.hv.domain_xml(VM_NAME).await.unwrap();
    assert_eq!(cdrom(&xml).source, None);
}

#[tokio::test]
async fn nic_plug_and_unplug_are_idempotent() {
    let host = TestHost::new();
    host.volume("root.img");
    let agent = host.agent().await;
    agent
        .lifecycle
        .start(&vm_spec(VM_NAME, "root.img"))
        .await
        .unwrap();
    let nic = guest_nic("02:00:4c:5a:00:02", 1);
    let details = BTreeMap::new();

    assert!(agent.lifecycle.plug_nic(VM_NAME, &nic, 2, &details).await.unwrap());
    assert!(!agent.lifecycle.plug_nic(VM_NAME, &nic, 2, &details).await.unwrap());
    let xml = host.hv.domain_xml(VM_NAME).await.unwrap();
    assert_eq!(domxml::parse_interfaces(&xml).len(), 2);

    assert!(agent.lifecycle.unplug_nic(VM_NAME, "02:00:4C:5A:00:02").await.unwrap());
    assert!(!agent.lifecycle.unplug_nic(VM_NAME, "02:00:4c:5a:00:02").await.unwrap());
    let xml = host.hv.domain_xml(VM_NAME).await.unwrap();
    assert_eq!(domxml::parse_interfaces(&xml).len(), 1);
}

#[tokio::test]
async fn migrate_hands_domain_off() {
    let host = TestHost::new();
    host.volume("root.img");
    let agent = host.agent().await;
    agent
        .lifecycle
        .start(&vm_spec(VM_NAME, "root.img"))
        .await
        .unwrap();

    agent
        .lifecycle
        .migrate(VM_NAME, "qemu+tcp://10.0.0.8/system")
        .await
        .unwrap();
    assert!(!host.hv.has_domain(VM_NAME));
    assert_eq!(agent.lifecycle.state(VM_NAME), None);
    assert_eq!(agent.lifecycle.tracked_locks(), 0);
}

#[tokio::test]
async fn prepare_migration_renders_definition() {
    let host = TestHost::new();
    host.volume("root.img");
    let agent = host.agent().await;
    let xml = agent
        .lifecycle
        .prepare_migration(&vm_spec(VM_NAME, "root.img"))
        .await
        .unwrap();
    assert_eq!(domxml::domain_name(&xml).as_deref(), Some(VM_NAME));
    assert!(!host.hv.has_domain(VM_NAME));
}

#[tokio::test]
async fn reboot_of_missing_vm_is_not_found() {
    let host = TestHost::new();
    let agent = host.agent().await;
    let err = agent.lifecycle.reboot("i-9-99-VM").await.unwrap_err();
    assert!(matches!(err, AgentError::NotFound(_)));
}
