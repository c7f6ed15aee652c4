// Agent identity reported to the orchestrator

/// Package version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Package name (from Cargo.toml).
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// `name/version`, as sent with the /version payload and logged at startup.
pub fn agent_version() -> String {
    format!("{}/{}", NAME, VERSION)
}
