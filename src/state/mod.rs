//! State module for tracking task progress
//!
//! # Components
//!
//! - `Stage` / `StageState`: the two stages of a task and their lifecycle
//! - `Task`: one harvest job with both stage states, counters and its discovery checkpoint
//! - `determine_resume_strategy`: decides where a restarted process picks a task back up

mod stage_state;
mod task;

// Re-export main types
pub use stage_state::{Stage, StageState};
pub use task::{determine_resume_strategy, ResumeStrategy, Task};
