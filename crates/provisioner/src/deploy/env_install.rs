//! Driver and tooling installation pipeline.
//!
//! Built per host on demand: one step per configured package, sharing the
//! progress range evenly, plus a terminal `complete` step.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{DeployError, StepContext};
use crate::agent::AgentApi;
use crate::model::DriverPackage;
use crate::pipeline::{Pipeline, PipelineStep, StepConfig, StepExecutor, StepFn};
use crate::ssh::quote;

/// Stage name carried by driver install progress events.
pub const ENV_STAGE: &str = "env_install";

/// Progress reached once every package is installed.
const PACKAGES_DONE: usize = 95;

/// Steps of a driver install pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum EnvStep {
    /// Install the named package.
    Package(String),
    /// Clean up the scratch directory.
    Complete,
}

impl PipelineStep for EnvStep {
    fn name(&self) -> &str {
        match self {
            Self::Package(name) => name,
            Self::Complete => "complete",
        }
    }
}

impl std::fmt::Display for EnvStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// How a package file is installed, by file type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallerKind {
    /// `.deb`
    Deb,
    /// `.rpm`
    Rpm,
    /// `.run` self-extracting installer.
    Run,
    /// `.sh` script.
    Shell,
    /// `.tar.gz` / `.tgz` containing an `install.sh`.
    Tarball,
}

impl InstallerKind {
    /// Detect from the file name.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_lowercase();
        if name.ends_with(".deb") {
            Some(Self::Deb)
        } else if name.ends_with(".rpm") {
            Some(Self::Rpm)
        } else if name.ends_with(".run") {
            Some(Self::Run)
        } else if name.ends_with(".sh") {
            Some(Self::Shell)
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(Self::Tarball)
        } else {
            None
        }
    }

    /// Script installing `remote_path`; tarballs are unpacked under `work_dir`.
    #[must_use]
    pub fn script(self, remote_path: &str, work_dir: &str, name: &str) -> String {
        let path = quote(remote_path);
        match self {
            Self::Deb => format!(
                "set -e\nDEBIAN_FRONTEND=noninteractive apt-get install -y {path}"
            ),
            Self::Rpm => format!(
                "set -e\nif command -v dnf >/dev/null 2>&1; then dnf install -y {path}; \
                 elif command -v yum >/dev/null 2>&1; then yum install -y {path}; \
                 else rpm -Uvh --replacepkgs {path}; fi"
            ),
            Self::Run => format!("set -e\nsh {path} --silent"),
            Self::Shell => format!("set -e\nsh {path}"),
            Self::Tarball => {
                let dir = quote(&format!("{}/{name}", work_dir.trim_end_matches('/')));
                format!(
                    r#"set -e
rm -rf {dir}
mkdir -p {dir}
tar -xzf {path} -C {dir}
I=$(find {dir} -maxdepth 2 -name install.sh | head -n 1)
[ -n "$I" ] || {{ echo "install.sh not found in {name}" >&2; exit 1; }}
cd "$(dirname "$I")"
sh ./install.sh"#
                )
            }
        }
    }
}

/// A package published on the controller, shared by every host of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedPackage {
    /// Package name, also its step name.
    pub name: String,
    /// File name on the host.
    pub file_name: String,
    /// Installer to use.
    pub kind: InstallerKind,
    /// Published controller path.
    pub published_path: String,
}

/// Check and publish every package once.
///
/// # Errors
///
/// Returns [`DeployError::PackageMissing`] or [`DeployError::UnsupportedPackage`]
/// before publishing anything, or the controller error.
pub async fn publish_packages(
    agent: &dyn AgentApi,
    packages: &[DriverPackage],
) -> Result<Vec<PublishedPackage>, DeployError> {
    let mut checked = Vec::with_capacity(packages.len());
    for package in packages {
        if !package.source.is_file() {
            return Err(DeployError::PackageMissing(package.source.clone()));
        }
        let kind = InstallerKind::from_path(&package.source).ok_or_else(|| {
            DeployError::UnsupportedPackage {
                name: package.name.clone(),
                path: package.source.clone(),
            }
        })?;
        let file_name = package
            .source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| package.name.clone());
        checked.push((package, kind, file_name));
    }

    let mut published = Vec::with_capacity(checked.len());
    for (package, kind, file_name) in checked {
        let file = agent.publish_file(&package.source, &file_name).await?;
        info!(package = %package.name, path = %file.path, "Published package");
        published.push(PublishedPackage {
            name: package.name.clone(),
            file_name,
            kind,
            published_path: file.path,
        });
    }
    Ok(published)
}

/// Progress after package `index` of `count`.
fn package_target(index: usize, count: usize) -> u8 {
    u8::try_from((index + 1) * PACKAGES_DONE / count).unwrap_or(u8::MAX)
}

/// Build the driver pipeline for one host, resolving package URLs for it.
///
/// # Errors
///
/// Returns [`DeployError::NoUrl`] if a package is unreachable from the host.
pub async fn env_pipeline(
    agent: &dyn AgentApi,
    host_id: &str,
    packages: &[PublishedPackage],
) -> Result<Pipeline<EnvStep, StepContext>, DeployError> {
    let mut steps = Vec::with_capacity(packages.len() + 1);

    for (i, package) in packages.iter().enumerate() {
        let url = agent
            .resolve_url_for_host(&package.published_path, host_id)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DeployError::NoUrl {
                host: host_id.to_string(),
                path: package.published_path.clone(),
            })?;
        steps.push(StepConfig {
            step: EnvStep::Package(package.name.clone()),
            target_progress: package_target(i, packages.len()),
            executor: Arc::new(PackageExecutor {
                package: package.clone(),
                url,
            }) as Arc<dyn StepExecutor<StepContext>>,
        });
    }

    steps.push(StepConfig {
        step: EnvStep::Complete,
        target_progress: 100,
        executor: Arc::new(StepFn(cleanup)),
    });

    Ok(Pipeline::new(ENV_STAGE, steps)?)
}

struct PackageExecutor {
    package: PublishedPackage,
    url: String,
}

#[async_trait]
impl StepExecutor<StepContext> for PackageExecutor {
    async fn execute(&self, ctx: &StepContext) -> anyhow::Result<()> {
        let work_dir = ctx.settings.work_dir.trim_end_matches('/');
        let remote_path = format!("{work_dir}/{}", self.package.file_name);
        info!(host = %ctx.host.host_id(), package = %self.package.name, "Installing package");

        ctx.run_script(&format!("mkdir -p {}", quote(work_dir))).await?;
        ctx.download(&self.url, &remote_path)
            .await
            .with_context(|| format!("Failed to download package {}", self.package.name))?;
        ctx.run_script(&self.package.kind.script(&remote_path, work_dir, &self.package.name))
            .await
            .with_context(|| format!("Failed to install package {}", self.package.name))?;
        Ok(())
    }
}

fn cleanup(ctx: &StepContext) -> BoxFuture<'_, anyhow::Result<()>> {
    Box::pin(async move {
        ctx.run_script(&format!("rm -rf {}", quote(&ctx.settings.work_dir)))
            .await
            .context("Failed to clean up work directory")?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::testing::FakeAgent;
    use std::path::PathBuf;

    #[test]
    fn test_installer_kind_by_extension() {
        let kind = |p: &str| InstallerKind::from_path(Path::new(p));
        assert_eq!(kind("/x/nvidia-driver_550_amd64.DEB"), Some(InstallerKind::Deb));
        assert_eq!(kind("/x/tool.rpm"), Some(InstallerKind::Rpm));
        assert_eq!(kind("/x/NVIDIA-Linux-x86_64.run"), Some(InstallerKind::Run));
        assert_eq!(kind("/x/setup.sh"), Some(InstallerKind::Shell));
        assert_eq!(kind("/x/ofed.tar.gz"), Some(InstallerKind::Tarball));
        assert_eq!(kind("/x/ofed.tgz"), Some(InstallerKind::Tarball));
        assert_eq!(kind("/x/readme.txt"), None);
    }

    #[test]
    fn test_tarball_script_requires_install_sh() {
        let script = InstallerKind::Tarball.script("/w/ofed.tgz", "/w/", "ofed");
        assert!(script.contains("tar -xzf '/w/ofed.tgz' -C '/w/ofed'"));
        assert!(script.contains("-name install.sh"));
        assert!(script.contains("exit 1; }"));
    }

    #[test]
    fn test_package_targets_share_range() {
        let targets: Vec<u8> = (0..3).map(|i| package_target(i, 3)).collect();
        assert_eq!(targets, vec![31, 63, 95]);
        assert_eq!(package_target(0, 1), 95);
    }

    fn staged(dir: &Path, file: &str) -> DriverPackage {
        let source = dir.join(file);
        std::fs::write(&source, b"pkg").unwrap();
        DriverPackage {
            name: file.split('.').next().unwrap().to_string(),
            source,
        }
    }

    #[tokio::test]
    async fn test_publish_and_build_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let packages = vec![staged(dir.path(), "cuda.run"), staged(dir.path(), "ofed.tgz")];
        let agent = FakeAgent::default();

        let published = publish_packages(&agent, &packages).await.unwrap();
        assert_eq!(agent.published.lock().unwrap().len(), 2);
        assert_eq!(published[1].kind, InstallerKind::Tarball);

        let pipeline = env_pipeline(&agent, "h1", &published).await.unwrap();
        let rows: Vec<(String, u8)> = pipeline
            .steps()
            .iter()
            .map(|c| (c.step.to_string(), c.target_progress))
            .collect();
        assert_eq!(
            rows,
            vec![
                ("cuda".to_string(), 47),
                ("ofed".to_string(), 95),
                ("complete".to_string(), 100)
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_package_publishes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let packages = vec![
            staged(dir.path(), "cuda.run"),
            DriverPackage {
                name: "ghost".into(),
                source: PathBuf::from("/nonexistent/ghost.deb"),
            },
        ];
        let agent = FakeAgent::default();

        let err = publish_packages(&agent, &packages).await.unwrap_err();
        assert!(matches!(err, DeployError::PackageMissing(ref p) if p.ends_with("ghost.deb")));
        assert!(agent.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_host_has_no_url() {
        let dir = tempfile::tempdir().unwrap();
        let agent = FakeAgent {
            unreachable: vec!["h2".into()],
            ..FakeAgent::default()
        };
        let published = publish_packages(&agent, &[staged(dir.path(), "x.deb")])
            .await
            .unwrap();
        assert!(matches!(
            env_pipeline(&agent, "h2", &published).await,
            Err(DeployError::NoUrl { .. })
        ));
    }
}
