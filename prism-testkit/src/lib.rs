//! Test doubles for prism pipelines: an in-memory work queue, in-memory
//! checkpoint and result stores, scripted stage clients and fixtures.

pub mod fixtures;
pub mod mock;
pub mod queue;
pub mod store;

pub use fixtures::{
    fast_config, sample_layout, sample_metadata, work_item, Harness, BLOB_PREFIX,
};
pub use mock::{HintRecord, ScriptedClient, ScriptedStage1, ScriptedStage2, StaticImageSource, Step};
pub use queue::{DeadLetterRecord, InMemoryWorkQueue, RequeueRecord};
pub use store::{InMemoryCheckpointStore, InMemoryResultStore};
