//! edgegrid-controller — drives cluster and app instances through their
//! lifecycle with a remote agent in the loop.
//!
//! The [`Controller`] is the single service handle: it owns the object
//! caches (registered with the sync engine in a fixed order) and exposes
//! create/update/delete for every resource type. Provisioning calls commit
//! a `*Requested` state, wait for the agent's report to arrive through the
//! [`notify`] channel and [`Controller::cluster_inst_update_from_info`],
//! and undo their reservations when the agent fails or times out.

pub mod agent;
pub mod alloc;
pub mod appinst;
pub mod call_context;
pub mod catalog;
pub mod cloudlet;
pub mod clusterinst;
pub mod controller;
pub mod error;
pub mod lifecycle;
pub mod notify;
pub mod stream;

pub use agent::{AgentBehavior, DummyAgent};
pub use call_context::CallContext;
pub use clusterinst::ClusterInstUpdate;
pub use controller::{Caches, Controller, Settings};
pub use error::{ApiError, ApiResult};
pub use lifecycle::{InfoOutcome, Op};
pub use notify::{AgentEndpoint, FromAgent, MessageChannel, NotifyServer, ToAgent};
pub use stream::StreamSend;
