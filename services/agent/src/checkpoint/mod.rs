//! Checkpointing: the durable representation of agent state.
//!
//! - `paths`: the on-disk layout (a compatibility contract)
//! - `store`: atomic record replacement and the framed append-only log
//! - `state`: one-shot recovery of the whole tree at startup

pub mod paths;
pub mod state;
pub mod store;

pub use state::{AgentState, ExecutorState, FrameworkState, TaskStreamState};
pub use store::{
    append_update_record, checkpoint, read_record, read_update_records, CheckpointError,
    UpdateLogRecord,
};
