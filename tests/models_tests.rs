// Wire format of commands, answers and reports

use hostagent::error::AgentError;
use hostagent::models::{
    Answer, AnswerPayload, Command, CommandKind, DiskRole, FailureKind, HostStatusReport,
    PowerState, TrafficType, VmSpec, VmType,
};
use std::collections::BTreeMap;

const START_JSON: &str = r#"{
    "type": "start",
    "vm": {
        "uuid": "5e2f1d4a-0000-4000-8000-000000000001",
        "name": "r-4-VM",
        "vmType": "System",
        "guest": {"os": "Debian GNU/Linux 12 (64-bit)", "platformEmulator": "Debian"},
        "vcpus": 1,
        "minRamBytes": 268435456,
        "maxRamBytes": 268435456,
        "speedMhz": 500,
        "disks": [
            {"uuid": "v-1", "role": "ROOT", "seq": 0, "path": "v-1",
             "pool": {"poolType": "NetworkFilesystem", "uuid": "p-1", "host": "10.0.0.5", "path": "/export/primary"}}
        ],
        "nics": [
            {"mac": "0e:00:a9:fe:00:01", "trafficType": "Control", "deviceId": 0},
            {"mac": "1e:00:5c:00:00:02", "trafficType": "Public", "deviceId": 1,
             "broadcastUri": "vlan://50", "networkRateMbps": 200}
        ],
        "details": {"nicMultiqueueNumber": "-1"}
    }
}"#;

#[test]
fn start_command_parses_nested_vm() {
    let cmd: Command = serde_json::from_str(START_JSON).unwrap();
    assert_eq!(cmd.kind(), CommandKind::Start);
    let Command::Start { vm } = cmd else {
        panic!("not a start command");
    };
    assert_eq!(vm.vm_type, VmType::System);
    assert_eq!(vm.disks[0].role, DiskRole::Root);
    assert_eq!(vm.nics[1].traffic_type, TrafficType::Public);
    assert_eq!(vm.nics[1].broadcast_uri.as_deref(), Some("vlan://50"));
    assert_eq!(vm.detail("nicMultiqueueNumber"), Some("-1"));
    assert!(vm.extra_config.is_empty());
}

#[test]
fn vm_spec_survives_json() {
    let Command::Start { vm } = serde_json::from_str::<Command>(START_JSON).unwrap() else {
        panic!("not a start command");
    };
    let text = serde_json::to_string(&vm).unwrap();
    let back: VmSpec = serde_json::from_str(&text).unwrap();
    assert_eq!(back, vm);
}

#[test]
fn unit_commands_use_type_tag_only() {
    let ping: Command = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
    assert_eq!(ping, Command::Ping);
    assert_eq!(
        serde_json::to_value(&Command::HostStartup).unwrap(),
        serde_json::json!({"type": "hostStartup"})
    );
}

#[test]
fn unknown_command_keeps_dispatch_alive() {
    let cmd: Command =
        serde_json::from_str(r#"{"type":"copyVolume","srcPool":"a","destPool":"b"}"#).unwrap();
    assert_eq!(cmd, Command::Unknown);
}

#[test]
fn failed_answer_carries_kind_and_message() {
    let answer = Answer::failed(&AgentError::NotFound("Domain not found: i-2-10-VM".into()));
    let json = serde_json::to_value(&answer).unwrap();
    assert_eq!(json["status"], "failure");
    assert_eq!(json["kind"], "notFound");
    assert_eq!(json["message"], "not found: Domain not found: i-2-10-VM");
    assert!(!answer.is_success());
}

#[test]
fn connectivity_failure_is_an_operation_failure() {
    let err = AgentError::Connectivity("qemu:///system".into());
    assert_eq!(FailureKind::from(&err), FailureKind::Operation);
}

#[test]
fn stopped_payload_is_camel_case() {
    let answer = Answer::ok(AnswerPayload::Stopped {
        vm_name: "i-2-10-VM".into(),
        already_stopped: false,
        forced: true,
    });
    let json = serde_json::to_value(&answer).unwrap();
    assert_eq!(json["status"], "success");
    assert_eq!(json["payload"]["kind"], "stopped");
    assert_eq!(json["payload"]["vmName"], "i-2-10-VM");
    assert_eq!(json["payload"]["alreadyStopped"], false);
    assert_eq!(json["payload"]["forced"], true);
}

#[test]
fn status_report_lists_power_states() {
    let report = HostStatusReport {
        timestamp: 1_700_000_000_000,
        host_id: "7".into(),
        vm_states: BTreeMap::from([("i-2-10-VM".to_string(), PowerState::PowerOn)]),
        health: None,
    };
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["hostId"], "7");
    assert_eq!(json["vmStates"]["i-2-10-VM"], "PowerOn");
    assert!(json["health"].is_null());
}
