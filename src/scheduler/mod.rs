//! Recalculation jobs: the queue that admits and orders them and the
//! processor whose workers execute them.

pub mod job;
pub mod processor;
pub mod queue;

pub use job::{AttemptError, CalculationTrigger, Job, JobId, JobStatus, Priority};
pub use processor::JobProcessor;
pub use queue::{EnqueueOutcome, JobQueue, PriorityCounts, QueueStatus, RetryOutcome};
