pub mod budget;
pub mod observer;
pub mod queue;
pub mod server;

pub use budget::{BudgetPolicy, SendBudget};
pub use observer::{Candidate, ObserverId, ObserverScheduler, Outgoing, SceneElement, TickStats};
pub use queue::{EntityId, EntityPriorityQueue, PrioritizedEntity, DO_NOT_SEND, FORCE_REMOVE, WHEN_IN_DOUBT_PRIORITY};
pub use server::{StreamServer, TickReport};
