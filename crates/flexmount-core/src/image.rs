use crate::config::ManagerConfig;
use crate::pull::ImagePuller;
use crate::retry::Attempt;
use crate::CoreError;
use flexmount_runtime::{ContainerRuntime, HostExec, ImageRecord, RuntimeError};
use tracing::{debug, info};

/// Makes an image usable in the working namespace.
///
/// Resolution order: the working namespace itself, then a copy from the
/// source namespace (export, import, unpack) under the import retry policy,
/// then a pull through the host CLI.
pub struct ImageResolver<'a> {
    runtime: &'a dyn ContainerRuntime,
    exec: &'a dyn HostExec,
    config: &'a ManagerConfig,
}

impl<'a> ImageResolver<'a> {
    pub fn new(
        runtime: &'a dyn ContainerRuntime,
        exec: &'a dyn HostExec,
        config: &'a ManagerConfig,
    ) -> Self {
        Self {
            runtime,
            exec,
            config,
        }
    }

    pub fn resolve(&self, name: &str) -> Result<ImageRecord, CoreError> {
        if let Some(image) = self.local(name)? {
            debug!(image = name, "image present in working namespace");
            return Ok(image);
        }

        let reference = match self.import_from_source(name) {
            Ok(imported) => {
                info!(
                    image = name,
                    imported = imported.len(),
                    "imported image from source namespace"
                );
                imported
                    .first()
                    .map_or_else(|| name.to_owned(), |first| first.name.clone())
            }
            // Pulling needs the same service, so an unreachable one ends resolution.
            Err(CoreError::ImportExhausted { source, .. }) if source.is_unavailable() => {
                return Err(source.into())
            }
            Err(e) => {
                debug!(image = name, "import from source namespace failed: {e}");
                name.to_owned()
            }
        };

        if let Some(image) = self.local(&reference)? {
            return Ok(image);
        }

        info!(image = %reference, "image not available locally, pulling");
        ImagePuller::new(self.exec, self.config).pull(&reference)?;
        self.runtime
            .get_image(&self.config.namespace, &reference)
            .map_err(|source| CoreError::PullFailed {
                image: reference.clone(),
                source,
            })
    }

    /// Copy `name` from the source namespace, retrying the whole sequence
    /// per the import policy.
    pub fn import_from_source(&self, name: &str) -> Result<Vec<ImageRecord>, CoreError> {
        let policy = self.config.import_retry();
        policy
            .run(|attempt| match self.import_once(name) {
                Ok(imported) => Attempt::Done(imported),
                Err(e) if e.is_unavailable() => Attempt::Fatal(e),
                Err(e) => {
                    debug!(image = name, attempt, "import attempt failed: {e}");
                    Attempt::Retry(e)
                }
            })
            .map_err(|failure| CoreError::ImportExhausted {
                image: name.to_owned(),
                attempts: failure.attempts,
                source: failure.last,
            })
    }

    fn import_once(&self, name: &str) -> Result<Vec<ImageRecord>, RuntimeError> {
        let source_ns = &self.config.source_namespace;
        let working_ns = &self.config.namespace;

        let source = self.runtime.get_image(source_ns, name)?;

        let mut archive = Vec::new();
        self.runtime.export_image(source_ns, &source, &mut archive)?;

        let imported = self
            .runtime
            .import_images(working_ns, &mut archive.as_slice())?;

        let local = self.runtime.get_image(working_ns, name)?;
        self.runtime
            .unpack_image(working_ns, &local, &self.config.snapshotter)?;
        Ok(imported)
    }

    fn local(&self, name: &str) -> Result<Option<ImageRecord>, CoreError> {
        match self.runtime.get_image(&self.config.namespace, name) {
            Ok(image) => Ok(Some(image)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flexmount_runtime::{MockExec, MockRuntime, Op};
    use std::time::{Duration, Instant};

    const IMAGE: &str = "registry.local/fuse:v1";

    fn config() -> ManagerConfig {
        ManagerConfig {
            import_delay_ms: 5,
            ..ManagerConfig::default()
        }
    }

    #[test]
    fn local_image_skips_import_and_pull() {
        let rt = MockRuntime::new();
        let exec = MockExec::new();
        let config = config();
        rt.add_image("flexmount", ImageRecord::new(IMAGE, "sha256:1"));

        let image = ImageResolver::new(&rt, &exec, &config).resolve(IMAGE).unwrap();
        assert_eq!(image.name, IMAGE);
        assert_eq!(rt.ops(), vec![Op::GetImage]);
        assert!(exec.invocations().is_empty());
    }

    #[test]
    fn imports_from_source_on_first_attempt() {
        let rt = MockRuntime::new();
        let exec = MockExec::new();
        let config = config();
        rt.add_image("k8s.io", ImageRecord::new(IMAGE, "sha256:1"));

        let image = ImageResolver::new(&rt, &exec, &config).resolve(IMAGE).unwrap();
        assert_eq!(image.name, IMAGE);
        assert!(rt.is_unpacked("flexmount", IMAGE, "overlayfs"));
        assert_eq!(
            rt.ops(),
            vec![
                Op::GetImage,
                Op::GetImage,
                Op::ExportImage,
                Op::ImportImages,
                Op::GetImage,
                Op::UnpackImage,
                Op::GetImage,
            ]
        );
        assert!(exec.invocations().is_empty());
    }

    #[test]
    fn retries_whole_sequence_until_success() {
        let rt = MockRuntime::new();
        let exec = MockExec::new();
        let config = config();
        rt.add_image("k8s.io", ImageRecord::new(IMAGE, "sha256:1"));
        rt.fail_next(Op::UnpackImage, 3);

        let start = Instant::now();
        let imported = ImageResolver::new(&rt, &exec, &config)
            .import_from_source(IMAGE)
            .unwrap();
        assert_eq!(imported.len(), 1);
        assert_eq!(rt.count(Op::ExportImage), 4);
        assert_eq!(rt.count(Op::ImportImages), 4);
        assert_eq!(rt.count(Op::UnpackImage), 4);
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn gives_up_after_budget() {
        let rt = MockRuntime::new();
        let exec = MockExec::new();
        let config = config();

        let err = ImageResolver::new(&rt, &exec, &config)
            .import_from_source(IMAGE)
            .unwrap_err();
        match err {
            CoreError::ImportExhausted {
                attempts, source, ..
            } => {
                assert_eq!(attempts, 10);
                assert!(source.is_not_found());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(rt.count(Op::GetImage), 10);
        assert_eq!(rt.count(Op::ExportImage), 0);
    }

    #[test]
    fn unreachable_service_ends_import_without_retrying() {
        let rt = MockRuntime::new();
        let exec = MockExec::new();
        let config = config();
        rt.add_image("k8s.io", ImageRecord::new(IMAGE, "sha256:1"));
        rt.set_unavailable(true);

        let err = ImageResolver::new(&rt, &exec, &config)
            .import_from_source(IMAGE)
            .unwrap_err();
        match err {
            CoreError::ImportExhausted {
                attempts, source, ..
            } => {
                assert_eq!(attempts, 1);
                assert!(source.is_unavailable());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(rt.count(Op::GetImage), 1);
        assert!(exec.invocations().is_empty());
    }

    #[test]
    fn falls_back_to_pull_when_absent_everywhere() {
        let rt = MockRuntime::new();
        let exec = MockExec::new();
        exec.install("ctr", "/usr/bin/ctr");
        exec.respond("/usr/bin/ctr", "");
        let config = ManagerConfig {
            import_attempts: 2,
            import_delay_ms: 1,
            ..ManagerConfig::default()
        };

        // The mock cannot be populated by a host pull, so re-resolution fails.
        let err = ImageResolver::new(&rt, &exec, &config)
            .resolve(IMAGE)
            .unwrap_err();
        assert!(matches!(err, CoreError::PullFailed { .. }));
        assert_eq!(exec.invocations().len(), 1);
        assert_eq!(exec.invocations()[0].1.last().unwrap(), IMAGE);
    }

    #[test]
    fn pull_failure_is_fatal() {
        let rt = MockRuntime::new();
        let exec = MockExec::new();
        let config = ManagerConfig {
            import_attempts: 1,
            ..ManagerConfig::default()
        };
        let err = ImageResolver::new(&rt, &exec, &config)
            .resolve(IMAGE)
            .unwrap_err();
        assert!(matches!(err, CoreError::PullToolNotFound(_)));
    }

    #[test]
    fn runtime_errors_other_than_not_found_propagate() {
        let rt = MockRuntime::new();
        let exec = MockExec::new();
        let config = config();
        rt.fail_next(Op::GetImage, 1);
        let err = ImageResolver::new(&rt, &exec, &config)
            .resolve(IMAGE)
            .unwrap_err();
        assert!(matches!(err, CoreError::Runtime(RuntimeError::Failed(_))));
    }
}
