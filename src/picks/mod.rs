pub mod openai;
pub mod policy;
pub mod worker;

pub use openai::{OpenAiPicks, PickGenerator};
pub use worker::{PickWorker, WorkerSettings};
