pub mod artifact;
pub mod channel;
pub mod job;
pub mod program;
pub mod results;
pub mod retry;
pub mod shuffle;
pub mod split;
pub mod storage;
pub mod task;
pub mod wordcount;
pub mod worker;

pub use artifact::ArtifactInfo;
pub use job::{Credentials, JobId, JobInfo, JobPhase, JobRequest, ProgramRef};
pub use results::JobResults;
pub use shuffle::{GroupedPair, KvPair, KvPairArray};
pub use split::{Split, SplitPlanner};
pub use task::{
    AssignResponse, PartitionSource, ReportAck, StorageBinding, TaskDescriptor, TaskId, TaskInfo,
    TaskKind, TaskOutcome, TaskReport, TaskState,
};
pub use worker::{
    WorkerHeartbeatRequest, WorkerHeartbeatResponse, WorkerId, WorkerLiveness, WorkerMetrics,
    WorkerRegisterRequest, WorkerRegisterResponse,
};
