//! OS installation pipeline.
//!
//! Partition and format the disk, stream the rootfs image onto it, make it
//! bootable, then write network, hostname, account and mirror configuration
//! into the new root before rebooting into it.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::netplan::{render_netplan, NETPLAN_PATH};
use super::{DeployError, StepContext};
use crate::pipeline::{Pipeline, PipelineError, PipelineStep, StepConfig, StepExecutor};
use crate::ssh::{quote, Arch};
use crate::ssh_deploy::PackageManager;

/// Stage name carried by OS install progress events.
pub const OS_STAGE: &str = "os_install";

/// Steps of the OS install pipeline, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsStep {
    /// Partition and format the install disk, mount it.
    Preinstall,
    /// Download the rootfs archive to the host.
    DownloadRootfs,
    /// Extract the rootfs onto the new root.
    Install,
    /// Write fstab and install the bootloader.
    Postinstall,
    /// Write netplan configuration.
    ConfigureNetwork,
    /// Set the hostname.
    ConfigureHostname,
    /// Create the login account.
    ConfigureUser,
    /// Point package sources at the configured mirror.
    ConfigureMirrors,
    /// Capture the session id and reboot.
    Complete,
}

impl OsStep {
    /// Every step, in pipeline order.
    pub const ALL: [Self; 9] = [
        Self::Preinstall,
        Self::DownloadRootfs,
        Self::Install,
        Self::Postinstall,
        Self::ConfigureNetwork,
        Self::ConfigureHostname,
        Self::ConfigureUser,
        Self::ConfigureMirrors,
        Self::Complete,
    ];

    /// Stable step name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preinstall => "preinstall",
            Self::DownloadRootfs => "download_rootfs",
            Self::Install => "install",
            Self::Postinstall => "postinstall",
            Self::ConfigureNetwork => "configure_network",
            Self::ConfigureHostname => "configure_hostname",
            Self::ConfigureUser => "configure_user",
            Self::ConfigureMirrors => "configure_mirrors",
            Self::Complete => "complete",
        }
    }

    /// Cumulative progress once the step is done.
    #[must_use]
    pub fn target_progress(self) -> u8 {
        match self {
            Self::Preinstall => 10,
            Self::DownloadRootfs => 35,
            Self::Install => 55,
            Self::Postinstall => 70,
            Self::ConfigureNetwork => 78,
            Self::ConfigureHostname => 82,
            Self::ConfigureUser => 88,
            Self::ConfigureMirrors => 94,
            Self::Complete => 100,
        }
    }

    /// Human-readable description.
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::Preinstall => "Partitioning and formatting disk",
            Self::DownloadRootfs => "Downloading root filesystem",
            Self::Install => "Extracting root filesystem",
            Self::Postinstall => "Installing bootloader",
            Self::ConfigureNetwork => "Configuring network",
            Self::ConfigureHostname => "Configuring hostname",
            Self::ConfigureUser => "Creating user account",
            Self::ConfigureMirrors => "Configuring package mirrors",
            Self::Complete => "Rebooting into new system",
        }
    }
}

impl PipelineStep for OsStep {
    fn name(&self) -> &str {
        self.as_str()
    }
}

impl std::fmt::Display for OsStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the OS install pipeline.
///
/// # Errors
///
/// Returns an error if the step table is invalid.
pub fn os_pipeline() -> Result<Pipeline<OsStep, StepContext>, PipelineError> {
    Pipeline::new(
        OS_STAGE,
        OsStep::ALL
            .iter()
            .map(|&step| StepConfig {
                step,
                target_progress: step.target_progress(),
                executor: Arc::new(OsExecutor(step)) as Arc<dyn StepExecutor<StepContext>>,
            })
            .collect(),
    )
}

struct OsExecutor(OsStep);

#[async_trait]
impl StepExecutor<StepContext> for OsExecutor {
    async fn execute(&self, ctx: &StepContext) -> anyhow::Result<()> {
        match self.0 {
            OsStep::Preinstall => preinstall(ctx).await,
            OsStep::DownloadRootfs => download_rootfs(ctx).await,
            OsStep::Install => install(ctx).await,
            OsStep::Postinstall => postinstall(ctx).await,
            OsStep::ConfigureNetwork => configure_network(ctx).await,
            OsStep::ConfigureHostname => configure_hostname(ctx).await,
            OsStep::ConfigureUser => configure_user(ctx).await,
            OsStep::ConfigureMirrors => configure_mirrors(ctx).await,
            OsStep::Complete => complete(ctx).await,
        }
    }
}

/// Shell snippet setting `$P` to the partition prefix of `$DISK`
/// (`/dev/nvme0n1` → `/dev/nvme0n1p`, `/dev/sda` → `/dev/sda`).
const PARTITION_PREFIX: &str = r#"case "$DISK" in *[0-9]) P="${DISK}p" ;; *) P="$DISK" ;; esac"#;

fn rootfs_archive(ctx: &StepContext) -> String {
    format!("{}/rootfs.tar.gz", ctx.settings.work_dir)
}

pub(crate) fn preinstall_script(disk: &str, root: &str, work_dir: &str) -> String {
    format!(
        r#"set -e
DISK={disk}
ROOT={root}
umount -R "$ROOT" 2>/dev/null || true
wipefs -af "$DISK"
parted -s "$DISK" mklabel gpt mkpart ESP fat32 1MiB 513MiB set 1 esp on mkpart root ext4 513MiB 100%
partprobe "$DISK" || true
udevadm settle || true
{PARTITION_PREFIX}
mkfs.vfat -F 32 "${{P}}1"
mkfs.ext4 -F "${{P}}2"
mkdir -p "$ROOT"
mount "${{P}}2" "$ROOT"
mkdir -p "$ROOT/boot/efi"
mount "${{P}}1" "$ROOT/boot/efi"
mkdir -p {work_dir}"#,
        disk = quote(disk),
        root = quote(root),
        work_dir = quote(work_dir),
    )
}

async fn preinstall(ctx: &StepContext) -> anyhow::Result<()> {
    let target = ctx.host.target();
    info!(host = %target.host_id, disk = %target.disk, "Partitioning install disk");
    ctx.run_script(&preinstall_script(
        &target.disk,
        &ctx.settings.target_root,
        &ctx.settings.work_dir,
    ))
    .await
    .with_context(|| format!("Failed to prepare disk {}", target.disk))?;
    Ok(())
}

async fn download_rootfs(ctx: &StepContext) -> anyhow::Result<()> {
    let url = ctx.host.image_url().to_string();
    info!(host = %ctx.host.host_id(), url = %url, "Downloading root filesystem");
    ctx.download(&url, &rootfs_archive(ctx))
        .await
        .context("Failed to download root filesystem")?;
    Ok(())
}

async fn install(ctx: &StepContext) -> anyhow::Result<()> {
    let script = format!(
        "set -e\ntar -xpzf {} -C {} --numeric-owner",
        quote(&rootfs_archive(ctx)),
        quote(&ctx.settings.target_root)
    );
    ctx.run_script(&script)
        .await
        .context("Failed to extract root filesystem")?;
    Ok(())
}

pub(crate) fn postinstall_script(disk: &str, root: &str, grub_target: &str, bootloader_id: &str) -> String {
    format!(
        r#"set -e
DISK={disk}
ROOT={root}
{PARTITION_PREFIX}
ROOT_UUID=$(blkid -s UUID -o value "${{P}}2")
EFI_UUID=$(blkid -s UUID -o value "${{P}}1")
cat > "$ROOT/etc/fstab" <<EOF
UUID=$ROOT_UUID / ext4 defaults 0 1
UUID=$EFI_UUID /boot/efi vfat umask=0077 0 1
EOF
for d in dev proc sys run; do
  mkdir -p "$ROOT/$d"
  mountpoint -q "$ROOT/$d" || mount --rbind "/$d" "$ROOT/$d"
done
chroot "$ROOT" grub-install --target={grub_target} --efi-directory=/boot/efi --bootloader-id={bootloader_id} --recheck
if chroot "$ROOT" sh -c 'command -v update-grub' >/dev/null 2>&1; then
  chroot "$ROOT" update-grub
else
  chroot "$ROOT" grub2-mkconfig -o /boot/grub2/grub.cfg
fi"#,
        disk = quote(disk),
        root = quote(root),
        bootloader_id = quote(bootloader_id),
    )
}

async fn postinstall(ctx: &StepContext) -> anyhow::Result<()> {
    let os_base = &ctx.system.os_base;
    let grub_target = match Arch::parse(&os_base.arch)? {
        Arch::Amd64 => "x86_64-efi",
        Arch::Arm64 => "arm64-efi",
    };
    let script = postinstall_script(
        &ctx.host.target().disk,
        &ctx.settings.target_root,
        grub_target,
        &os_base.distro,
    );
    ctx.run_script(&script)
        .await
        .context("Failed to install bootloader")?;
    Ok(())
}

async fn configure_network(ctx: &StepContext) -> anyhow::Result<()> {
    let info = ctx.host_info().await?;
    let target = ctx.host.target();
    let yaml = render_netplan(&info.system_info.nics, &target, &ctx.shared.network)
        .map_err(DeployError::from)?;

    let path = format!("{}/{NETPLAN_PATH}", ctx.settings.target_root);
    let script = format!(
        "set -e\nmkdir -p \"$(dirname {path})\"\ncat > {path} <<'NETPLAN'\n{yaml}NETPLAN\nchmod 600 {path}",
        path = quote(&path),
    );
    ctx.run_script(&script)
        .await
        .context("Failed to write netplan configuration")?;
    Ok(())
}

async fn configure_hostname(ctx: &StepContext) -> anyhow::Result<()> {
    let hostname = ctx.host.target().hostname;
    let root = quote(&ctx.settings.target_root);
    let script = format!(
        r#"set -e
H={name}
echo "$H" > {root}/etc/hostname
if grep -q '^127\.0\.1\.1' {root}/etc/hosts; then
  sed -i "s/^127\.0\.1\.1.*/127.0.1.1 $H/" {root}/etc/hosts
else
  echo "127.0.1.1 $H" >> {root}/etc/hosts
fi"#,
        name = quote(&hostname),
    );
    ctx.run_script(&script)
        .await
        .with_context(|| format!("Failed to set hostname {hostname}"))?;
    Ok(())
}

pub(crate) fn user_script(root: &str, username: &str, password: Option<&str>) -> String {
    let root = quote(root);
    let credentials = match password {
        Some(pw) => format!(
            "printf '%s\\n' {} | chroot {root} chpasswd",
            quote(&format!("{username}:{pw}"))
        ),
        None => format!("chroot {root} passwd -l \"$U\""),
    };
    format!(
        r#"set -e
U={user}
chroot {root} id -u "$U" >/dev/null 2>&1 || chroot {root} useradd -m -s /bin/bash "$U"
if chroot {root} getent group sudo >/dev/null 2>&1; then G=sudo; else G=wheel; fi
chroot {root} usermod -aG "$G" "$U"
{credentials}"#,
        user = quote(username),
    )
}

async fn configure_user(ctx: &StepContext) -> anyhow::Result<()> {
    let account = &ctx.shared.account;
    ctx.run_script(&user_script(
        &ctx.settings.target_root,
        &account.username,
        account.password.as_deref(),
    ))
    .await
    .with_context(|| format!("Failed to create account {}", account.username))?;
    Ok(())
}

async fn configure_mirrors(ctx: &StepContext) -> anyhow::Result<()> {
    let os_base = &ctx.system.os_base;
    let Some(mirror) = os_base.mirror.as_deref() else {
        info!(host = %ctx.host.host_id(), "No mirror configured, keeping distribution sources");
        return Ok(());
    };
    let Some(manager) = PackageManager::for_distro(&os_base.distro) else {
        warn!(distro = %os_base.distro, "No source layout known for distribution, skipping mirror");
        return Ok(());
    };
    ctx.run_script(&manager.rewrite_sources(mirror, &ctx.settings.target_root))
        .await
        .context("Failed to configure package mirrors")?;
    Ok(())
}

async fn complete(ctx: &StepContext) -> anyhow::Result<()> {
    let host = ctx.host.host_id();
    let info = ctx
        .agent
        .get_host_info(&host)
        .await?
        .ok_or_else(|| DeployError::MissingHostInfo(host.clone()))?;
    info!(host = %host, session_id = %info.session_id, "Captured pre-reboot session");
    ctx.host.set_pre_reboot_session(&info.session_id);
    ctx.host.set_info(info);

    // The agent goes away with the reboot, so only submit.
    let script = format!(
        "sync; umount -R {} 2>/dev/null; (sleep 3; reboot) >/dev/null 2>&1 &",
        quote(&ctx.settings.target_root)
    );
    if let Err(e) = ctx.agent.execute(&host, &format!("sh -c {}", quote(&script))).await {
        warn!(host = %host, error = %e, "Reboot request failed, host may already be going down");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_table() {
        let pipeline = os_pipeline().unwrap();
        let names: Vec<_> = pipeline.steps().iter().map(|c| c.step.as_str()).collect();
        assert_eq!(
            names,
            [
                "preinstall",
                "download_rootfs",
                "install",
                "postinstall",
                "configure_network",
                "configure_hostname",
                "configure_user",
                "configure_mirrors",
                "complete"
            ]
        );
        assert_eq!(pipeline.steps().last().unwrap().target_progress, 100);
    }

    #[test]
    fn test_configure_user_advances_past_hostname() {
        assert!(OsStep::ConfigureUser.target_progress() > OsStep::ConfigureHostname.target_progress());
        assert!(OsStep::ConfigureHostname.target_progress() > OsStep::ConfigureNetwork.target_progress());
    }

    #[test]
    fn test_preinstall_script_quotes_disk() {
        let script = preinstall_script("/dev/nvme0n1", "/mnt/target", "/var/tmp/provision");
        assert!(script.starts_with("set -e\nDISK='/dev/nvme0n1'"));
        assert!(script.contains(r#"*[0-9]) P="${DISK}p""#));
        assert!(script.contains(r#"mkfs.ext4 -F "${P}2""#));
    }

    #[test]
    fn test_postinstall_script_selects_grub_target() {
        let script = postinstall_script("/dev/sda", "/mnt/target", "arm64-efi", "ubuntu");
        assert!(script.contains("--target=arm64-efi"));
        assert!(script.contains("--bootloader-id='ubuntu'"));
        assert!(script.contains("UUID=$ROOT_UUID / ext4"));
    }

    #[test]
    fn test_user_script_with_and_without_password() {
        let with = user_script("/mnt/target", "ops", Some("it's"));
        assert!(with.contains(r"printf '%s\n' 'ops:it'\''s' | chroot '/mnt/target' chpasswd"));

        let without = user_script("/mnt/target", "ops", None);
        assert!(without.contains("passwd -l \"$U\""));
        assert!(!without.contains("chpasswd"));
    }
}
