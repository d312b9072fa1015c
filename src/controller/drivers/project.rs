use async_trait::async_trait;

use crate::error::{Error, Result};

/// Resolves the OpenStack project owning a namespace's resources
#[async_trait]
pub trait ProjectDriver: Send + Sync {
    async fn get_project(&self, namespace: &str) -> Result<String>;
}

/// Every namespace maps to `[neutron_defaults] project`
pub struct DefaultProjectDriver {
    project_id: Option<String>,
}

impl DefaultProjectDriver {
    pub fn new(project_id: Option<String>) -> Self {
        Self { project_id }
    }
}

#[async_trait]
impl ProjectDriver for DefaultProjectDriver {
    async fn get_project(&self, _namespace: &str) -> Result<String> {
        self.project_id
            .clone()
            .ok_or_else(|| Error::ConfigError("neutron_defaults.project is not set".to_string()))
    }
}
