pub mod adapters;
pub mod cache;
pub mod composer;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod hooks;
pub mod management;
pub mod matcher;
pub mod models;
pub mod processors;
pub mod queue;
pub mod state_machine;
pub mod storage;
pub mod template;
pub mod validators;
pub mod webhook;

use std::sync::Arc;

use crate::adapters::AdapterFactory;
use crate::cache::KeyValueCache;
use crate::composer::TransitionPolicy;
use crate::config::Config;
use crate::executor::HttpClient;
use crate::queue::JobQueue;
use crate::storage::Storage;
use crate::template::Renderer;

/// Shared handles for the webhook server and the worker tasks.
pub struct AppState {
    pub config: Config,
    pub storage: Arc<dyn Storage>,
    pub cache: Arc<dyn KeyValueCache>,
    pub queue: Arc<dyn JobQueue>,
    pub http: Arc<dyn HttpClient>,
    pub adapters: Arc<dyn AdapterFactory>,
    pub policy: Arc<dyn TransitionPolicy>,
    pub renderer: Renderer,
}
