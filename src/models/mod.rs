// Domain models shared across the agent

mod command;
mod domain;
mod host;
mod stats;
mod vm;

pub use command::{Answer, AnswerPayload, Command, CommandKind, FailureKind};
pub use domain::{
    BootDevice, BootMode, ClockDef, ClockOffset, ClockTimer, CpuDef, CpuTopology, CpuTune,
    Device, DiskAuth, DiskBus, DiskDevice, DiskEncryption, DiskSource, DomainDefinition, Feature,
    HypervFeatures, NetworkProtocol, ResolvedDisk, ResolvedNic, TermAction, TermPolicy,
    VifDriverKind,
};
pub use host::{
    CgroupVersion, DiskActivitySettings, HostCapabilities, StartupInfo, StartupStoragePool,
    UefiTables,
};
pub use stats::{DomainState, HealthCheckResult, HostStatusReport, PowerState, VmDiskStats, VmStats};
pub use vm::{
    BootOptions, CacheMode, DiskFormat, DiskRole, DiskSpec, GuestOs, NicSpec, PoolRef, PoolType,
    RateLimits, TpmVersion, TrafficType, VmSpec, VmType, detail,
};
