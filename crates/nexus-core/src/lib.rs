//! nexus-core: Reconciliation engine for SSH trust material
//!
//! Holds the machine/user/group graph, computes the principal set each machine should
//! carry, and converges machines to it either by pushing over a live agent stream
//! ([`registry`], [`protocol`]) or by running commands over SSH ([`converge`]).

pub mod converge;
pub mod error;
pub mod events;
pub mod model;
pub mod principals;
pub mod protocol;
pub mod reconcile;
pub mod registry;
pub mod settings;
pub mod store;
pub mod sweep;

pub use converge::{RemoteConverger, SshConverger, set_principals};
pub use error::CoreError;
pub use events::{ChangeEvent, Records};
pub use model::{Group, Machine, User};
pub use principals::{PrincipalSet, ROOT_LOGIN, compute_principals};
pub use protocol::{AgentIdentity, AgentMetadata, ProtocolError, ProtocolServer};
pub use reconcile::{
    Reconcile, Reconciler, ReconcilerArgs, Reconciliation, Resync, spawn_reconciler,
};
pub use registry::{ConnectionRegistry, RegistryHandle};
pub use settings::Settings;
pub use store::{MemoryStore, Store};
pub use sweep::Sweeper;
