pub mod backoff;
pub mod channel;
pub mod submission;

pub use backoff::Backoff;
pub use channel::TransportChannel;
pub use submission::{SubmissionClient, SubmitMessages};
