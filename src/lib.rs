//! Topic-based FHIR subscriptions.
//!
//! Applications declare the topics they care about in a [`DefinitionSet`].
//! A [`Reconciler`] keeps the remote server's subscription records in line
//! with those declarations, the [`WebhookDispatcher`] turns pushed
//! notification bundles into ordered handler calls, and the
//! [`HealthMonitor`] notices subscriptions that went quiet. [`TbsBuilder`]
//! wires the three together behind a warp filter.

mod config;
mod definition;
mod dispatcher;
mod envelope;
mod errors;
mod gateway;
mod health;
pub mod metrics;
mod node;
mod reconciler;
mod reference;
pub mod server;

pub use config::*;
pub use definition::*;
pub use dispatcher::*;
pub use envelope::*;
pub use errors::*;
pub use gateway::*;
pub use health::*;
pub use node::*;
pub use reconciler::*;
pub use reference::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub mod test_utils;
