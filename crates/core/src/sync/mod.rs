//! Push-event normalization, list reconciliation and pagination.

mod event;
mod pagination;
mod reconciler;
mod scheduler;

pub use event::*;
pub use pagination::*;
pub use reconciler::*;
pub use scheduler::*;
