//! Handles shared by the validator, fallback executor and batch executor
//! while one workflow runs.

use std::path::Path;

use crate::io::cancel::CancelToken;
use crate::io::config::EngineConfig;
use crate::io::driver::{
    Driver, DriverError, DriverMessage, DriverPurpose, DriverRequest, RetryPolicy, call_with_retry,
};
use crate::io::prompt::PromptEngine;

pub struct ExecContext<'a> {
    pub workdir: &'a Path,
    pub goal: &'a str,
    pub config: &'a EngineConfig,
    pub driver: &'a dyn Driver,
    pub prompts: &'a PromptEngine,
    pub cancel: &'a CancelToken,
}

impl ExecContext<'_> {
    /// Call the driver with the configured transient retry policy.
    pub fn call_driver(
        &self,
        purpose: DriverPurpose,
        prompt: String,
    ) -> Result<Vec<DriverMessage>, DriverError> {
        if self.cancel.is_cancelled() {
            return Err(DriverError::Cancelled);
        }
        let request = DriverRequest {
            workdir: self.workdir.to_path_buf(),
            purpose,
            prompt,
            cancel: Some(self.cancel.clone()),
        };
        let policy = RetryPolicy::from_config(&self.config.driver);
        call_with_retry(self.driver, &request, &policy)
    }
}
