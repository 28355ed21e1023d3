pub mod controller;
pub mod job;
pub mod registry;
pub mod status;

pub use controller::{JobConfig, JobController, SubmittedJob};
pub use job::{
    gen_model_info, JobDefinition, JobFilter, JobRecord, JobSubmission, ModelInfo, PartyRef,
    StatusInfo, StatusKey, StatusRecord, TaskRef,
};
pub use registry::{Registration, StatusRegistry};
pub use status::Status;
