// tallystream-engine - Stateful worker logic
//
// Everything between the wire and the store lives here: the pending
// delta state with its double-buffered commit protocol, record
// dispatch into jobs, the lock-guarded flush into the store and the
// job registry kept in sync via notifications. One Worker owns one
// copy of each; the server shards connections across workers.

pub mod dispatch;
pub mod flush;
pub mod pending;
pub mod registry;
pub mod worker;

pub use pending::{PendingState, PendingStore};
pub use registry::{TaskNotification, TaskRegistry};
pub use worker::Worker;
