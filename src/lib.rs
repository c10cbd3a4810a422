pub mod approval;
pub mod bus;
pub mod conductors;
pub mod config;
pub mod domain;
pub mod invoker;
pub mod learning;
pub mod queue;
pub mod runtime;
pub mod shared;
pub mod skills;
pub mod store;
