//! Background services

pub mod supervisor;

pub use supervisor::{
    ClientSet, ConnectionPhase, StartOptions, Supervisor, SupervisorConfig, SupervisorHandle,
};
