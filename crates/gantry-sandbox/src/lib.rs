//! Sandbox session layer: the framed stdio protocol, the session registry,
//! the per-connection process multiplexer, and the container isolation
//! backends.

pub mod frame;
pub mod proc;
pub mod runner;
pub mod sandbox;
pub mod session;

pub use runner::RegistrySandboxRunner;
pub use sandbox::{Sandbox, SandboxMode};
pub use session::{SessionOptions, SessionRegistry};
