//! Kubernetes side of podtail
//!
//! Connects to the cluster, watches pods and their owners, and maintains the
//! filtered pod view the log controller reconciles against.

mod cache;
mod client;
mod datastore;
mod error;
mod filter;
mod owner;
mod selector;
mod source;

pub use cache::{CacheEvent, CacheSignals, ObjectCache, Refilter, RefilterRequests, Subscription};
pub use client::KubeClient;
pub use datastore::{Datastore, DatastoreBuilder};
pub use error::{Error, Result};
pub use filter::{Filter, OwnerMembership, OwnerSelector, Selectable, Stage, resource_id};
pub use owner::{Owner, owner_selectors};
pub use selector::{LabelSelector, Operator, Requirement};
pub use source::{WatchSource, WatchStream, WatchedResource};
