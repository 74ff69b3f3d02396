pub mod acl;
pub mod address_set;
pub mod default_deny;
pub mod hash;
pub mod nbdb;
pub mod policy;
pub mod port_group;
pub mod report;
pub mod watch;

/// Long-lived service tasks spawned at startup and joined by `main`.
pub type Tasks = tokio::task::JoinSet<(String, eyre::Result<()>)>;
