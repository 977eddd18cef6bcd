use crate::config::AppConfig;
use crate::core::DuplicityRunner;

#[derive(Clone)]
pub struct AppContext {
    pub config: std::sync::Arc<AppConfig>,
    pub runner: DuplicityRunner,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        let runner = DuplicityRunner::new(config.runner_config());
        Self {
            config: std::sync::Arc::new(config),
            runner,
        }
    }
}
