//! Node-Deletion Cleanup
//!
//! Cluster-wide controller that removes claims bound to local volumes whose
//! node was deleted.
//!
//! ```text
//!   node deleted ──► scan volumes ──► event on claim
//!                         │
//!                         ▼
//!                 DelayingQueue (delay)
//!                         │
//!                    dispatcher
//!                         │ bounded channel
//!            ┌────────────┼────────────┐
//!            ▼            ▼            ▼
//!        worker 1     worker 2  ...  worker N
//!            │
//!            ▼
//!   re-verify node / claim ──► delete claim (UID precondition)
//!            │
//!            └── error ──► requeue after max(item backoff, retry bucket)
//! ```

pub mod controller;
pub mod entry;
pub mod queue;

pub use controller::*;
pub use entry::*;
pub use queue::*;
