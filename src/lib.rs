//! Core library for the stage_fleet supervisor.
//!
//! A fleet of heterogeneous motion-stage controllers (PI, Standa and simulated
//! virtual stages) behind one abstraction. Clients submit declarative configurations,
//! the fleet drives the hardware towards them, answers with one
//! [`events::UpdateResponse`] per item and republishes live status on a typed
//! [`events::EventBus`].
//!
//! The layers, leaves first:
//!
//! - [`events`]: publish/subscribe with hierarchical forwarding
//! - [`model`]: devices, stages, configurations and compound identifiers
//! - [`hardware`]: blocking driver traits and simulated drivers
//! - [`session`] and [`families`]: one session per physical controller
//! - [`interface`]: per-family session map, reconciliation and bulk batching
//! - [`fleet`]: routing across families
//! - [`convergence`]: polling until changes have taken effect

pub mod config;
pub mod convergence;
pub mod error;
pub mod events;
pub mod families;
pub mod fleet;
pub mod hardware;
pub mod interface;
pub mod model;
pub mod session;
pub mod settings;

pub use error::{FleetError, FleetResult};
pub use fleet::Fleet;
pub use interface::{ControllerInterface, SessionInterface};
