pub mod client;
pub mod digest;
pub mod gerrit;

pub use client::{ListFilters, ReviewClient, SubmitStatus, UpstreamChange};
pub use gerrit::GerritClient;
