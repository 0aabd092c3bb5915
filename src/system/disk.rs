//! Disks and mounts of a provisioned system.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Local};
use tracing::{debug, warn};

use super::FsType;
use crate::cancel::CancelSignal;
use crate::process::{CommandRunner, Invocation};

const BTRFS_ACTIVE: &str = "__active";
const BTRFS_SNAPSHOTS: &str = "__snapshot";
const SNAPSHOT_TIME_FORMAT: &str = "%Y-%m-%d_%H-%M";
const VIRTUAL_FILESYSTEMS: [&str; 4] = ["dev", "dev/pts", "sys", "proc"];

fn luks_format(device: &str, key: &str) -> Invocation {
    Invocation::new("cryptsetup")
        .args(["luksFormat", "--cipher", "aes-xts-plain64"])
        .args(["--key-size", "512", "--hash", "sha512"])
        .args(["--iter-time", "5000", "--use-random"])
        .arg(device)
        .input(key)
}

fn luks_open(device: &str, name: &str, key: &str) -> Invocation {
    Invocation::new("cryptsetup")
        .args(["open", "--type", "luks", device, name])
        .input(key)
}

async fn create_dir(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| anyhow!("creating {}: {e}", dir.display()))
}

/// LUKS-encrypted root disk.
#[derive(Debug, Clone)]
pub struct EncryptedDisk {
    pub name: String,
    pub fs_type: Option<FsType>,
    pub device: String,
    pub mapper: String,
    pub dir: PathBuf,
    pub password: String,
}

impl EncryptedDisk {
    pub async fn luks_format(&self, cmd: &dyn CommandRunner, signal: &CancelSignal) -> Result<()> {
        cmd.run(&luks_format(&self.device, &self.password), signal).await?;
        Ok(())
    }

    pub async fn luks_open(&self, cmd: &dyn CommandRunner, signal: &CancelSignal) -> Result<()> {
        cmd.run(&luks_open(&self.device, &self.name, &self.password), signal)
            .await?;
        Ok(())
    }

    pub async fn luks_close(&self, cmd: &dyn CommandRunner, signal: &CancelSignal) -> Result<()> {
        cmd.run(&Invocation::new("cryptsetup").args(["close", self.name.as_str()]), signal)
            .await?;
        Ok(())
    }

    /// Create the filesystem. Btrfs also gets the active subvolume that
    /// gets mounted as root.
    pub async fn make_fs(&self, cmd: &dyn CommandRunner, signal: &CancelSignal) -> Result<()> {
        let bin = match self.fs_type {
            Some(FsType::Btrfs) => "mkfs.btrfs",
            Some(FsType::Ext4) => "mkfs.ext4",
            Some(other) => bail!("unsupported root filesystem type: {other}"),
            None => bail!("a filesystem type is required to create the root filesystem"),
        };
        cmd.run(
            &Invocation::new(bin).args(["-L", self.name.as_str(), self.mapper.as_str()]),
            signal,
        )
        .await?;

        if self.fs_type == Some(FsType::Btrfs) {
            let top = BtrfsTop::mount(cmd, &self.mapper, signal).await?;
            let active = top.path().join(BTRFS_ACTIVE);
            let created = cmd
                .run(
                    &Invocation::new("btrfs")
                        .args(["subvolume", "create"])
                        .arg(active.to_string_lossy()),
                    signal,
                )
                .await;
            top.unmount(cmd, signal).await;
            created?;
        }
        Ok(())
    }

    /// Mount at `dir`, detecting the filesystem type if it was not given.
    pub async fn mount(&self, cmd: &dyn CommandRunner, signal: &CancelSignal) -> Result<()> {
        create_dir(&self.dir).await?;

        let fs_type = match self.fs_type {
            Some(fs_type) => fs_type,
            None => self.identify_fs_type(cmd, signal).await?,
        };
        let mut options = "noatime".to_string();
        if fs_type == FsType::Btrfs {
            options.push_str(&format!(",compress=lzo,subvol={BTRFS_ACTIVE}"));
        }
        cmd.run(
            &Invocation::new("mount")
                .args(["-t", fs_type.as_str(), "-o", options.as_str(), self.mapper.as_str()])
                .arg(self.dir.to_string_lossy()),
            signal,
        )
        .await?;
        Ok(())
    }

    pub async fn identify_fs_type(
        &self,
        cmd: &dyn CommandRunner,
        signal: &CancelSignal,
    ) -> Result<FsType> {
        let out = cmd
            .run(
                &Invocation::new("lsblk").args(["--noheadings", "--output", "fstype", self.mapper.as_str()]),
                signal,
            )
            .await?;
        let detected = out.output.trim();
        debug!(mapper = %self.mapper, fs_type = %detected, "identified filesystem");
        detected.parse()
    }

    /// Unmount, then remove the mount point if it is empty.
    pub async fn umount(&self, cmd: &dyn CommandRunner, signal: &CancelSignal) -> Result<()> {
        cmd.run(
            &Invocation::new("umount").arg(self.dir.to_string_lossy()),
            signal,
        )
        .await?;
        if let Err(err) = tokio::fs::remove_dir(&self.dir).await {
            warn!(dir = %self.dir.display(), error = %err, "could not remove mount point");
        }
        Ok(())
    }

    /// Take a read-only snapshot of the active subvolume. A no-op on
    /// filesystems without snapshots.
    pub async fn snapshot(
        &self,
        label: &str,
        cmd: &dyn CommandRunner,
        signal: &CancelSignal,
    ) -> Result<()> {
        let fs_type = match self.fs_type {
            Some(fs_type) => fs_type,
            None => self.identify_fs_type(cmd, signal).await?,
        };
        if fs_type != FsType::Btrfs {
            debug!(fs_type = %fs_type, "no snapshot support, skipping");
            return Ok(());
        }

        let top = BtrfsTop::mount(cmd, &self.mapper, signal).await?;
        let result = async {
            let snapshots = top.path().join(BTRFS_SNAPSHOTS);
            create_dir(&snapshots).await?;
            let target = snapshots.join(snapshot_name(Local::now(), label));
            cmd.run(
                &Invocation::new("btrfs")
                    .args(["subvolume", "snapshot", "-r"])
                    .arg(top.path().join(BTRFS_ACTIVE).to_string_lossy())
                    .arg(target.to_string_lossy()),
                signal,
            )
            .await?;
            Ok::<(), anyhow::Error>(())
        }
        .await;
        top.unmount(cmd, signal).await;
        result
    }
}

pub(crate) fn snapshot_name(at: DateTime<Local>, label: &str) -> String {
    format!(
        "{}-{}-{label}",
        at.format(SNAPSHOT_TIME_FORMAT),
        at.timestamp_nanos_opt().unwrap_or_default()
    )
}

/// The top level of a btrfs filesystem, mounted on a temporary directory.
struct BtrfsTop {
    dir: PathBuf,
}

impl BtrfsTop {
    async fn mount(cmd: &dyn CommandRunner, device: &str, signal: &CancelSignal) -> Result<Self> {
        let base = Path::new(device)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "btrfs".to_string());
        let dir = std::env::temp_dir().join(format!("{base}-{}", uuid::Uuid::new_v4().simple()));
        create_dir(&dir).await?;

        let mounted = cmd
            .run(
                &Invocation::new("mount")
                    .args(["-t", FsType::Btrfs.as_str(), "-o", "noatime,compress=lzo", device])
                    .arg(dir.to_string_lossy()),
                signal,
            )
            .await;
        if let Err(err) = mounted {
            let _ = tokio::fs::remove_dir(&dir).await;
            return Err(err.into());
        }
        Ok(Self { dir })
    }

    fn path(&self) -> &Path {
        &self.dir
    }

    /// Best effort: a failure here leaves a stray mount but must not hide
    /// the result of the work done under it.
    async fn unmount(self, cmd: &dyn CommandRunner, signal: &CancelSignal) {
        let unmounted = cmd
            .run(&Invocation::new("umount").arg(self.dir.to_string_lossy()), signal)
            .await;
        match unmounted {
            Ok(_) => {
                if let Err(err) = tokio::fs::remove_dir(&self.dir).await {
                    warn!(dir = %self.dir.display(), error = %err, "could not remove temporary mount point");
                }
            }
            Err(err) => warn!(dir = %self.dir.display(), error = %err, "could not unmount btrfs top level"),
        }
    }
}

/// EFI system partition.
#[derive(Debug, Clone)]
pub struct EfiDisk {
    pub name: String,
    pub device: String,
    pub dir: PathBuf,
}

impl EfiDisk {
    pub async fn make_fs(&self, cmd: &dyn CommandRunner, signal: &CancelSignal) -> Result<()> {
        cmd.run(
            &Invocation::new("mkfs.vfat").args(["-F32", "-n", self.name.as_str(), self.device.as_str()]),
            signal,
        )
        .await?;
        Ok(())
    }

    pub async fn mount(&self, cmd: &dyn CommandRunner, signal: &CancelSignal) -> Result<()> {
        create_dir(&self.dir).await?;
        cmd.run(
            &Invocation::new("mount")
                .args(["-t", FsType::Vfat.as_str(), self.device.as_str()])
                .arg(self.dir.to_string_lossy()),
            signal,
        )
        .await?;
        Ok(())
    }

    /// Unmount. The mount point lives inside the root filesystem and is
    /// left in place.
    pub async fn umount(&self, cmd: &dyn CommandRunner, signal: &CancelSignal) -> Result<()> {
        cmd.run(
            &Invocation::new("umount").arg(self.dir.to_string_lossy()),
            signal,
        )
        .await?;
        Ok(())
    }
}

/// Encrypted swap, keyed with the root mapping's master key.
#[derive(Debug, Clone)]
pub struct SwapDisk {
    pub name: String,
    pub device: String,
    pub mapper: String,
    pub root_name: String,
}

impl SwapDisk {
    /// Read the key of the opened root mapping.
    pub async fn key(&self, cmd: &dyn CommandRunner, signal: &CancelSignal) -> Result<String> {
        let out = cmd
            .run(
                &Invocation::new("dmsetup").args(["--showkeys", "table", self.root_name.as_str()]),
                signal,
            )
            .await?;
        parse_dm_key(&out.output)
    }

    pub async fn luks_format(&self, cmd: &dyn CommandRunner, signal: &CancelSignal) -> Result<()> {
        let key = self.key(cmd, signal).await?;
        cmd.run(&luks_format(&self.device, &key), signal).await?;
        Ok(())
    }

    pub async fn luks_open(&self, cmd: &dyn CommandRunner, signal: &CancelSignal) -> Result<()> {
        let key = self.key(cmd, signal).await?;
        cmd.run(&luks_open(&self.device, &self.name, &key), signal)
            .await?;
        Ok(())
    }

    pub async fn luks_close(&self, cmd: &dyn CommandRunner, signal: &CancelSignal) -> Result<()> {
        cmd.run(&Invocation::new("cryptsetup").args(["close", self.name.as_str()]), signal)
            .await?;
        Ok(())
    }

    pub async fn make_fs(&self, cmd: &dyn CommandRunner, signal: &CancelSignal) -> Result<()> {
        cmd.run(
            &Invocation::new("mkswap").args(["--label", self.name.as_str(), self.mapper.as_str()]),
            signal,
        )
        .await?;
        Ok(())
    }
}

/// The key is the fifth field of a crypt target line.
pub(crate) fn parse_dm_key(table: &str) -> Result<String> {
    table
        .split(' ')
        .nth(4)
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
        .ok_or_else(|| anyhow!("did not find key using dmsetup: {}", table.trim()))
}

/// Bind mounts of the host's virtual filesystems, for chrooting.
#[derive(Debug, Clone)]
pub struct VirtualFs {
    pub dir: PathBuf,
}

impl VirtualFs {
    pub async fn mount(&self, cmd: &dyn CommandRunner, signal: &CancelSignal) -> Result<()> {
        for fs in VIRTUAL_FILESYSTEMS {
            cmd.run(
                &Invocation::new("mount")
                    .arg("--bind")
                    .arg(Path::new("/").join(fs).to_string_lossy())
                    .arg(self.dir.join(fs).to_string_lossy()),
                signal,
            )
            .await?;
        }
        Ok(())
    }

    /// Unmount in reverse mount order so nested mounts go first.
    pub async fn umount(&self, cmd: &dyn CommandRunner, signal: &CancelSignal) -> Result<()> {
        for fs in VIRTUAL_FILESYSTEMS.iter().rev() {
            cmd.run(
                &Invocation::new("umount").arg(self.dir.join(fs).to_string_lossy()),
                signal,
            )
            .await?;
        }
        Ok(())
    }
}
