// Library for tests to access modules

pub mod agent;
pub mod capability;
pub mod compiler;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod hypervisor;
pub mod lifecycle;
pub mod models;
pub mod network;
pub mod reporter;
pub mod routes;
pub mod script;
pub mod storage;
pub mod version;
pub mod worker;
