//! App-side half of the tool broker.
//!
//! An app registers its tools with a [`ToolExecutor`], then hands the executor
//! to an [`AppClient`], which connects to the broker, announces the namespaced
//! catalog and answers invocations until shut down.

#![warn(missing_docs, clippy::pedantic)]

pub mod client;
pub mod executor;

pub use client::{AppClient, AppSession, ClientError, ClientResult, ReconnectConfig};
pub use executor::{ExecutorResult, Parameters, Tool, ToolError, ToolExecutor, ToolHandle};
