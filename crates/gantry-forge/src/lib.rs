//! GitHub implementation of the core `Forge` trait.

pub mod github;

pub use github::GithubClient;
