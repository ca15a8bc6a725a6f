//! Render stage: submission of pending jobs and polling of outstanding renders.

pub mod poller;
pub mod submitter;

pub use poller::{PollOutcome, PollReport, RenderPoller};
pub use submitter::{RenderSubmitter, SubmissionWorker, SubmitError, SubmitOutcome};
