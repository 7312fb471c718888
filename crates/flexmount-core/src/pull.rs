use crate::config::ManagerConfig;
use crate::CoreError;
use flexmount_runtime::{HostExec, RuntimeError};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Pulls images with the host's runtime CLI, the last resort of image resolution.
pub struct ImagePuller<'a> {
    exec: &'a dyn HostExec,
    config: &'a ManagerConfig,
}

impl<'a> ImagePuller<'a> {
    pub fn new(exec: &'a dyn HostExec, config: &'a ManagerConfig) -> Self {
        Self { exec, config }
    }

    /// The pull tool from the search path, else the first fallback location that exists.
    pub fn locate_tool(&self) -> Result<PathBuf, CoreError> {
        let pull = &self.config.pull;
        if let Some(path) = self.exec.lookup(&pull.tool) {
            return Ok(path);
        }
        pull.tool_fallbacks
            .iter()
            .find(|candidate| self.exec.exists(candidate))
            .cloned()
            .ok_or_else(|| CoreError::PullToolNotFound(pull.tool.clone()))
    }

    /// Registry secret from the credential helper, when one is installed.
    pub fn registry_secret(&self) -> Result<Option<String>, CoreError> {
        let pull = &self.config.pull;
        let Some(helper) = self.exec.lookup(&pull.credential_helper) else {
            return Ok(None);
        };
        let helper = helper.to_string_lossy().into_owned();
        let args = [
            "ecr".to_owned(),
            "get-login-password".to_owned(),
            "--region".to_owned(),
            pull.credential_region.clone(),
        ];
        let output = self
            .exec
            .run(&helper, &args)
            .map_err(|source| CoreError::Credentials {
                helper: helper.clone(),
                source,
            })?;
        let secret = output.stdout.trim().to_owned();
        if secret.is_empty() {
            return Err(CoreError::Credentials {
                helper,
                source: RuntimeError::Failed("helper printed an empty secret".to_owned()),
            });
        }
        Ok(Some(secret))
    }

    pub fn pull_args(&self, image: &str, secret: Option<&str>) -> Vec<String> {
        let pull = &self.config.pull;
        let mut args = vec![
            "-n".to_owned(),
            self.config.namespace.clone(),
            "images".to_owned(),
            "pull".to_owned(),
        ];
        match secret {
            Some(secret) => {
                args.push("--user".to_owned());
                args.push(format!("{}:{secret}", pull.registry_user));
            }
            None => {
                args.push("--hosts-dir".to_owned());
                args.push(pull.hosts_dir.to_string_lossy().into_owned());
            }
        }
        args.push(image.to_owned());
        args
    }

    pub fn pull(&self, image: &str) -> Result<(), CoreError> {
        let tool = self.locate_tool()?;
        let secret = self.registry_secret()?;
        let args = self.pull_args(image, secret.as_deref());
        let tool = tool.to_string_lossy();
        info!(image, tool = %tool, args = ?redact(&args), "pulling image");

        match self.exec.run(&tool, &args) {
            Ok(output) => {
                debug!(image, output = %output.combined().trim(), "pull finished");
                Ok(())
            }
            Err(source) => {
                warn!(image, "pull failed: {source}");
                Err(CoreError::PullFailed {
                    image: image.to_owned(),
                    source,
                })
            }
        }
    }
}

/// Copy of `args` safe to log: the credential following `--user` is masked.
pub fn redact(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut mask_next = false;
    for arg in args {
        if mask_next {
            let user = arg.split_once(':').map_or("", |(user, _)| user);
            out.push(format!("{user}:***"));
            mask_next = false;
        } else {
            mask_next = arg == "--user";
            out.push(arg.clone());
        }
    }
    out
}
