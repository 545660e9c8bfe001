pub mod cancel;
pub mod executor;
pub mod orchestrator;
pub mod results;
pub mod retry;
pub mod schema;
pub mod stage;
pub mod state;

pub use cancel::CancelSignal;
pub use orchestrator::{Orchestrator, RunReport};
pub use state::{RequestInput, RunOutcome, WorkflowState};
