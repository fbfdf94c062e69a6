// Pipeline module: receive dispatch, follow-up jobs, send fan-out

pub mod jobs;
pub mod receive;
pub mod send;

pub use jobs::{Job, JobError};
pub use receive::{ProcessOutcome, ReceiveError};
pub use send::{SendMessageResult, SendOutcome, SendTarget};
