//! kuberes deploy: reconcile one desired application into a target cluster.
//!
//! [`DeployWorker::start`] checks name uniqueness within the cluster, then either
//! reconfigures the existing application or creates a new one, cleaning up stray
//! copies left in other clusters along the way.
//!
//! Concurrency: nothing in the worker itself serializes two `start` calls for the same
//! (cluster, namespace, name). Share a [`DeployLocks`] between workers to serialize them
//! in-process. Across processes the registry's unique identity index rejects the second
//! create, which then runs the normal compensation.

#![forbid(unsafe_code)]

mod appres;
mod locks;
mod policy;
mod worker;

pub use appres::{AppRes, AppResHandle};
pub use locks::DeployLocks;
pub use policy::{ExtensionPolicy, PatchFn};
pub use worker::{Collaborators, DeployOutcome, DeployWorker};
