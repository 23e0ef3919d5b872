use tracing::info;

use super::{PackageManager, SshDeployError};
use crate::model::SshAccess;
use crate::ssh::{BootstrapSettings, RemoteShell, ShellOutput, Ssh2Shell, SshBootstrap};

/// Runs package-manager operations on one host through its bootstrap session.
pub struct SshDeployer<S: RemoteShell> {
    bootstrap: SshBootstrap<S>,
    manager: PackageManager,
}

impl SshDeployer<Ssh2Shell> {
    /// Connect, escalate and fingerprint a host, then wrap it.
    ///
    /// # Errors
    /// Returns an error if any bootstrap stage fails or the package manager is unsupported.
    pub async fn connect(access: &SshAccess) -> Result<Self, SshDeployError> {
        let mut bootstrap = SshBootstrap::connect(access, BootstrapSettings::default()).await?;
        bootstrap.force_sudo().await?;
        bootstrap.fingerprint_system().await?;
        Self::new(bootstrap)
    }
}

impl<S: RemoteShell> SshDeployer<S> {
    /// Wrap a fingerprinted bootstrap session.
    ///
    /// # Errors
    /// Returns [`SshDeployError::NotFingerprinted`] or
    /// [`SshDeployError::UnsupportedPackageManager`].
    pub fn new(bootstrap: SshBootstrap<S>) -> Result<Self, SshDeployError> {
        let fingerprint = bootstrap
            .fingerprint()
            .ok_or(SshDeployError::NotFingerprinted)?;
        let detected = fingerprint
            .package_manager
            .as_deref()
            .ok_or_else(|| SshDeployError::UnsupportedPackageManager("none detected".into()))?;
        let manager = PackageManager::parse(detected)?;
        info!(package_manager = %manager, "SSH deployer ready");
        Ok(Self { bootstrap, manager })
    }

    /// Package manager in use.
    #[must_use]
    pub fn package_manager(&self) -> PackageManager {
        self.manager
    }

    /// The wrapped bootstrap session.
    pub fn bootstrap(&self) -> &SshBootstrap<S> {
        &self.bootstrap
    }

    /// Give the session back, e.g. to launch the agent afterwards.
    pub fn into_bootstrap(self) -> SshBootstrap<S> {
        self.bootstrap
    }

    async fn run(&self, what: &str, command: &str) -> Result<ShellOutput, SshDeployError> {
        info!(operation = %what, package_manager = %self.manager, "Running deploy operation");
        Ok(self.bootstrap.sudo_exec(command).await?)
    }

    /// Install packages.
    ///
    /// # Errors
    /// Returns an error if the command fails.
    pub async fn install(&self, packages: &[&str]) -> Result<ShellOutput, SshDeployError> {
        self.run("install", &self.manager.install(packages)).await
    }

    /// Remove packages.
    ///
    /// # Errors
    /// Returns an error if the command fails.
    pub async fn uninstall(&self, packages: &[&str]) -> Result<ShellOutput, SshDeployError> {
        self.run("uninstall", &self.manager.uninstall(packages)).await
    }

    /// Rewrite sources to `mirror` (if given) and refresh indexes.
    ///
    /// # Errors
    /// Returns an error if the command fails.
    pub async fn update_sources(&self, mirror: Option<&str>) -> Result<ShellOutput, SshDeployError> {
        self.run("update-sources", &self.manager.update_sources(mirror)).await
    }

    /// Install Docker unless present.
    ///
    /// # Errors
    /// Returns an error if the command fails.
    pub async fn install_docker(&self) -> Result<ShellOutput, SshDeployError> {
        self.run("install-docker", &self.manager.install_docker()).await
    }

    /// Install the base tool set.
    ///
    /// # Errors
    /// Returns an error if the command fails.
    pub async fn install_base_dependencies(&self) -> Result<ShellOutput, SshDeployError> {
        self.run("base-dependencies", &self.manager.base_dependencies()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Classify, ErrorKind};
    use crate::ssh::{PortForward, PtyProcess, SshError};
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use std::path::Path;
    use std::sync::Mutex;

    struct ScriptedShell {
        package_manager: &'static str,
        fail_contains: Option<&'static str>,
        commands: Mutex<Vec<String>>,
    }

    impl ScriptedShell {
        fn new(package_manager: &'static str) -> Self {
            Self {
                package_manager,
                fail_contains: None,
                commands: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RemoteShell for ScriptedShell {
        async fn exec(&self, command: &str, _stdin: Option<&str>) -> Result<ShellOutput, SshError> {
            self.commands.lock().unwrap().push(command.to_string());
            let stdout = match command {
                "id -u" => "0\n",
                "uname -s" => "Linux\n",
                "uname -m" => "aarch64\n",
                c if c.starts_with("for pm in") => self.package_manager,
                _ => "",
            };
            let failed = self.fail_contains.is_some_and(|needle| command.contains(needle));
            Ok(ShellOutput {
                stdout: stdout.to_string(),
                stderr: if failed { "E: boom".into() } else { String::new() },
                exit_code: i32::from(failed),
            })
        }

        async fn upload(&self, _: &Path, _: &str, _: i32) -> Result<(), SshError> {
            Ok(())
        }

        async fn forward_remote_port(
            &self,
            port: u16,
            _: SocketAddr,
        ) -> Result<PortForward, SshError> {
            Ok(PortForward::new(port))
        }

        async fn spawn_pty(&self, _: &str, _: Option<&str>) -> Result<PtyProcess, SshError> {
            Err(SshError::PortForward("not scripted".into()))
        }
    }

    async fn deployer(shell: ScriptedShell) -> Result<SshDeployer<ScriptedShell>, SshDeployError> {
        let mut bootstrap = SshBootstrap::new(shell, BootstrapSettings::default(), None);
        bootstrap.force_sudo().await?;
        bootstrap.fingerprint_system().await?;
        SshDeployer::new(bootstrap)
    }

    #[tokio::test]
    async fn test_operations_run_privileged() {
        let deployer = deployer(ScriptedShell::new("dnf\n")).await.unwrap();
        assert_eq!(deployer.package_manager(), PackageManager::Dnf);

        deployer.install(&["htop"]).await.unwrap();
        deployer.install_docker().await.unwrap();

        let commands = deployer.bootstrap().shell().commands.lock().unwrap().clone();
        assert!(commands.contains(&"sh -c 'dnf install -y '\\''htop'\\'''".to_string()));
        assert!(commands.iter().any(|c| c.contains("command -v docker")));
    }

    #[tokio::test]
    async fn test_unknown_package_manager_rejected() {
        let err = deployer(ScriptedShell::new("")).await.err().unwrap();
        assert!(matches!(err, SshDeployError::UnsupportedPackageManager(_)));
        assert_eq!(err.kind(), ErrorKind::Resource);
    }

    #[tokio::test]
    async fn test_failure_surfaces_as_execution_error() {
        let mut shell = ScriptedShell::new("apt-get");
        shell.fail_contains = Some("apt-get update");
        let deployer = deployer(shell).await.unwrap();

        let err = deployer.update_sources(None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert!(err.to_string().contains("E: boom"));
    }

    #[test]
    fn test_requires_fingerprint() {
        let bootstrap = SshBootstrap::new(
            ScriptedShell::new("apt-get"),
            BootstrapSettings::default(),
            None,
        );
        assert!(matches!(
            SshDeployer::new(bootstrap),
            Err(SshDeployError::NotFingerprinted)
        ));
    }
}
