//! hostrun-exec: one command, run locally or on remote hosts
//!
//! A [`Connection`] runs shell commands on this machine (`local`), over SSH
//! (`run`) or over SSH through sudo (`sudo`) and returns a [`CommandResult`].
//! A [`Group`] fans one command out over many connections and collects a
//! [`GroupResult`] keyed by [`TargetId`].
//!
//! Transports sit behind the [`traits::ChannelProvider`] and
//! [`traits::ProcessProvider`] traits, so tests can swap in fakes.

pub mod backend;
pub mod config;
pub mod connection;
pub mod error;
pub mod group;
pub mod keys;
pub mod local;
pub mod options;
pub mod pty;
pub mod result;
pub mod sink;
pub mod ssh;
pub mod sudo;
pub mod target;
pub mod traits;

pub use backend::{ExecState, ExecutionBackend};
pub use config::{ConnectOptions, SudoConfig};
pub use connection::{Connection, Operation};
pub use error::{ErrorKind, ExecError};
pub use group::{Group, GroupResult, Member};
pub use options::{Hide, RunOptions};
pub use pty::{PtyDescriptor, PtyRequest};
pub use result::{CommandResult, Stream};
pub use sink::{ConsoleSink, OutputSink};
pub use target::{Endpoint, Target, TargetId};
pub use traits::Providers;
