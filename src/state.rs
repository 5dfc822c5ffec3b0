use std::sync::Arc;

use crate::config::AppConfig;
use crate::engine::Engine;
use crate::error::EngineResult;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub engine: Arc<Engine>,
}

impl AppState {
    pub fn new(config: AppConfig) -> EngineResult<Self> {
        let engine = Engine::open(config.clone())?;
        Ok(Self { config, engine })
    }
}
