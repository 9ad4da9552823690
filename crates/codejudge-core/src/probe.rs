//! Startup capability detection.
//!
//! Every check is bounded by the probe timeout and degrades to `false` on any error,
//! so probing always yields a matrix, possibly an all-false one.

use bollard::Docker;
use futures_util::future::join_all;
use std::path::PathBuf;
use std::time::Duration;

use crate::capabilities::CapabilityMatrix;
use crate::executors::native::run_step;
use crate::languages::{LanguageProfile, LanguageRegistry};

// Version banners are short; anything beyond this is noise
const PROBE_OUTPUT_BYTES: usize = 4096;

pub struct CapabilityProber {
    docker: Option<Docker>,
    timeout: Duration,
    scratch_dir: PathBuf,
}

impl CapabilityProber {
    /// `docker` is `None` when isolation is disabled or no client could be built;
    /// the runtime then counts as unavailable without being contacted.
    pub fn new(docker: Option<Docker>, timeout: Duration) -> Self {
        Self {
            docker,
            timeout,
            scratch_dir: std::env::temp_dir(),
        }
    }

    pub async fn probe(&self, registry: &LanguageRegistry) -> CapabilityMatrix {
        let isolation_available = self.isolation_available().await;

        let profiles: Vec<&LanguageProfile> = registry.profiles().collect();
        let images = join_all(profiles.iter().map(|profile| async move {
            isolation_available && self.image_ready(&profile.image).await
        }));
        let natives = join_all(profiles.iter().map(|profile| self.native_available(profile)));
        let (images, natives) = futures_util::join!(images, natives);

        let matrix = profiles
            .iter()
            .zip(images.into_iter().zip(natives))
            .fold(
                CapabilityMatrix::new(isolation_available),
                |matrix, (profile, (image_ready, native_available))| {
                    matrix.with_language(profile.language, image_ready, native_available)
                },
            );

        log::info!("Execution capabilities:\n{}", matrix.report());
        matrix
    }

    async fn isolation_available(&self) -> bool {
        let Some(docker) = &self.docker else {
            log::info!("Container isolation disabled, all languages will run natively");
            return false;
        };
        match tokio::time::timeout(self.timeout, docker.version()).await {
            Ok(Ok(version)) => {
                log::info!(
                    "Docker daemon reachable (version {})",
                    version.version.as_deref().unwrap_or("unknown")
                );
                true
            }
            Ok(Err(e)) => {
                log::warn!("Docker daemon not reachable: {}", e);
                false
            }
            Err(_) => {
                log::warn!("Docker daemon did not answer within {} ms", self.timeout.as_millis());
                false
            }
        }
    }

    async fn image_ready(&self, image: &str) -> bool {
        let Some(docker) = &self.docker else {
            return false;
        };
        match tokio::time::timeout(self.timeout, docker.inspect_image(image)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                log::debug!("Image {} not ready: {}", image, e);
                false
            }
            Err(_) => {
                log::debug!("Inspecting image {} timed out", image);
                false
            }
        }
    }

    async fn native_available(&self, profile: &LanguageProfile) -> bool {
        for argv in profile.native_probes {
            let Some(tool) = argv.first() else {
                continue;
            };
            if which::which(tool).is_err() {
                log::debug!("{} not found on PATH", tool);
                return false;
            }
            match run_step(argv, &self.scratch_dir, None, self.timeout, PROBE_OUTPUT_BYTES).await {
                Ok(outcome) if outcome.exited_cleanly() => {}
                Ok(outcome) => {
                    log::debug!("{} probe ended with {:?}", tool, outcome.termination);
                    return false;
                }
                Err(e) => {
                    log::debug!("{} probe failed to start: {}", tool, e);
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::languages::Language;
    use std::time::Instant;

    fn profile_with_probes(probes: &'static [&'static [&'static str]]) -> LanguageProfile {
        LanguageProfile {
            native_probes: probes,
            ..LanguageProfile::builtin(Language::Python)
        }
    }

    #[tokio::test]
    async fn test_native_probe_success_and_failures() {
        let prober = CapabilityProber::new(None, Duration::from_secs(2));

        assert!(prober.native_available(&profile_with_probes(&[&["sh", "-c", "true"]])).await);
        assert!(!prober.native_available(&profile_with_probes(&[&["sh", "-c", "exit 3"]])).await);
        assert!(
            !prober
                .native_available(&profile_with_probes(&[&["codejudge-no-such-tool", "--version"]]))
                .await
        );
        // every probe must pass
        let one_failing = profile_with_probes(&[&["sh", "-c", "true"], &["sh", "-c", "false"]]);
        assert!(!prober.native_available(&one_failing).await);
    }

    #[tokio::test]
    async fn test_hanging_probe_counts_as_unavailable() {
        let prober = CapabilityProber::new(None, Duration::from_millis(200));
        let started = Instant::now();
        assert!(!prober.native_available(&profile_with_probes(&[&["sh", "-c", "sleep 30"]])).await);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_probe_without_docker_never_isolates() {
        let prober = CapabilityProber::new(None, Duration::from_secs(2));
        let registry = LanguageRegistry::default();
        let matrix = prober.probe(&registry).await;

        assert!(!matrix.isolation_available());
        for language in Language::ALL {
            assert!(!matrix.capability(language).image_ready);
            assert!(!matrix.can_isolate(language));
        }
    }

    #[tokio::test]
    async fn test_unreachable_daemon_is_unavailable() {
        // nothing listens on this port; the probe must resolve to false, not error
        let version = bollard::API_DEFAULT_VERSION;
        let docker = match Docker::connect_with_http("http://127.0.0.1:9", 2, version) {
            Ok(docker) => docker,
            Err(_) => return,
        };
        let prober = CapabilityProber::new(Some(docker), Duration::from_secs(2));
        assert!(!prober.isolation_available().await);
        assert!(!prober.image_ready("python:3.11-slim").await);
    }
}
