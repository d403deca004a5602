pub mod balancer;
pub mod balancer_worker;
pub mod config_loader;
pub mod juju;
pub mod provisioner;
pub mod queue;
pub mod reconciler;
pub mod runner;
pub mod status_parser;
pub mod unit_status;
pub mod unit_store;
