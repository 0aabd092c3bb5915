//! System-wide actions: partitioning, package installation, chroot setup.

use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::System;
use crate::cancel::CancelSignal;
use crate::process::Invocation;

const GETTY_TTY1: &str = "etc/systemd/system/getty.target.wants/getty@tty1.service";
const CONNECTIVITY_HOST: &str = "archlinux.org";

/// Builds the `sgdisk` arguments for consecutive partitions.
struct PartitionTable {
    args: Vec<String>,
    count: u32,
}

impl PartitionTable {
    fn new() -> Self {
        Self {
            args: Vec::new(),
            count: 0,
        }
    }

    fn entry(&mut self, size: &str, typecode: &str, name: &str) -> &mut Self {
        self.count += 1;
        let n = self.count;
        self.args.extend([
            "--new".to_string(),
            format!("{n}:0:{size}"),
            "--typecode".to_string(),
            format!("{n}:{typecode}"),
            "--change-name".to_string(),
            format!("{n}:{name}"),
        ]);
        self
    }
}

impl System {
    pub(crate) fn partition_args(&self, disk: &str) -> Vec<String> {
        let mut table = PartitionTable::new();
        let efi_size = if self.enable_osx { "+256M" } else { "+64M" };
        table.entry(efi_size, "ef00", &self.efi.name);
        if self.enable_osx {
            table.entry("+30G", "af00", &self.label("osx"));
            table.entry("+620M", "ab00", &self.label("recovery"));
        }
        if let Some(swap) = &self.swap {
            table.entry("+4G", "8200", &swap.name);
        }
        table.entry("0", "8300", &self.root.name);

        let mut args = table.args;
        args.push(disk.to_string());
        args
    }

    /// Wipe the disk and create the GPT, then wait for the root partition
    /// device to appear.
    pub async fn gpt_setup(&self, signal: &CancelSignal) -> Result<()> {
        let Some(disk) = self.disk.as_deref() else {
            bail!("no disk specified");
        };

        let cmd = self.runner();
        cmd.run(&Invocation::new("sgdisk").args(["--zap-all", disk]), signal)
            .await?;
        cmd.run(
            &Invocation::new("sgdisk").args(self.partition_args(disk)),
            signal,
        )
        .await?;

        self.wait_for_root_device().await
    }

    async fn wait_for_root_device(&self) -> Result<()> {
        let max = Duration::from_millis(self.settings.device_wait_ms);
        let poll = Duration::from_millis(self.settings.device_poll_ms.max(1));
        let mut waited = Duration::ZERO;
        loop {
            match tokio::fs::metadata(&self.root.device).await {
                Ok(_) => return Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(anyhow!("checking {}: {err}", self.root.device)),
            }
            if waited >= max {
                bail!("failed to find {}", self.root.device);
            }
            tokio::time::sleep(poll).await;
            waited += poll;
        }
    }

    /// Install the base `filesystem` package into the new root.
    pub async fn install_filesystem(&self, signal: &CancelSignal) -> Result<()> {
        for dir in ["var/lib/pacman", "var/cache/pacman/pkg"] {
            let full = self.root_dir().join(dir);
            tokio::fs::create_dir_all(&full)
                .await
                .map_err(|e| anyhow!("creating {}: {e}", full.display()))?;
        }

        let root = self.root_dir().to_string_lossy().into_owned();
        self.runner()
            .run(
                &Invocation::new("pacman")
                    .args(["--refresh", "--root", root.as_str(), "--asdeps"])
                    .args(["--noconfirm", "--quiet", "--sync", "filesystem"]),
                signal,
            )
            .await?;
        Ok(())
    }

    /// Install the configured packages, then the `<name>-system` package.
    pub async fn install_system(&self, signal: &CancelSignal) -> Result<()> {
        let root = self.root_dir().to_string_lossy().into_owned();
        let cmd = self.runner();

        if !self.settings.packages.is_empty() {
            cmd.run(
                &Invocation::new("pacman")
                    .args(["--root", root.as_str(), "--asdeps"])
                    .args(["--noconfirm", "--quiet", "--sync"])
                    .args(self.settings.packages.iter().cloned()),
                signal,
            )
            .await?;
        }

        let getty = self.root_dir().join(GETTY_TTY1);
        match tokio::fs::remove_file(&getty).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %getty.display(), "no tty1 getty to disable");
            }
            Err(err) => return Err(anyhow!("removing {}: {err}", getty.display())),
        }

        cmd.run(
            &Invocation::new("pacman")
                .args(["--root", root.as_str(), "--noconfirm", "--quiet", "--sync"])
                .arg(self.label("system")),
            signal,
        )
        .await?;
        Ok(())
    }

    pub(crate) fn post_install_commands(&self) -> Vec<Invocation> {
        let root = self.root_dir().to_string_lossy().into_owned();
        let chroot = |args: &[&str]| {
            Invocation::new("chroot")
                .arg(root.as_str())
                .args(args.iter().copied())
        };
        vec![
            chroot(&["/usr/bin/pacman-key", "--init"]),
            chroot(&["/usr/bin/pacman-key", "--populate", "archlinux"]),
            chroot(&["/usr/bin/locale-gen"]),
            chroot(&["/usr/bin/mandb", "--quiet"]),
            chroot(&["/usr/bin/mkinitcpio", "-p", "linux"]),
            chroot(&[
                "/usr/bin/cp",
                "/boot/vmlinuz-linux",
                "/boot/efi/EFI/archlinux/vmlinuz.efi",
            ]),
            chroot(&[
                "/usr/bin/cp",
                "/boot/initramfs-linux.img",
                "/boot/efi/EFI/archlinux/initrd.img",
            ]),
        ]
    }

    /// Keyrings, locales, man db, initramfs, and copying the kernel onto
    /// the EFI partition.
    pub async fn post_install(&self, signal: &CancelSignal) -> Result<()> {
        for invocation in self.post_install_commands() {
            self.runner().run(&invocation, signal).await?;
        }
        Ok(())
    }

    /// Set `user`'s password inside the new root.
    pub async fn passwd(&self, user: &str, password: &str, signal: &CancelSignal) -> Result<()> {
        let root = self.root_dir().to_string_lossy().into_owned();
        self.runner()
            .run(
                &Invocation::new("chroot")
                    .args([root.as_str(), "/usr/bin/passwd", user])
                    .input(format!("{password}\n{password}\n")),
                signal,
            )
            .await?;
        Ok(())
    }

    /// Run a user command with the terminal attached.
    pub async fn exec(&self, args: &[String], signal: &CancelSignal) -> Result<()> {
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| anyhow!("exec needs a command to run"))?;
        self.runner()
            .run_attached(&Invocation::new(program.as_str()).args(rest.iter().cloned()), signal)
            .await?;
        Ok(())
    }

    /// rsync with archive, sparse and xattr preservation; `args` supplies
    /// sources and destination.
    pub async fn backup(&self, args: &[String], signal: &CancelSignal) -> Result<()> {
        if args.is_empty() {
            bail!("backup needs a source and destination");
        }
        self.runner()
            .run(
                &Invocation::new("rsync")
                    .args(["--archive", "--one-file-system", "--sparse"])
                    .args(["--delete-delay", "--partial", "--xattrs"])
                    .args(args.iter().cloned()),
                signal,
            )
            .await?;
        Ok(())
    }

    /// Write `<name>` into the new root's existing `etc/hostname`.
    pub async fn gen_etc_hostname(&self) -> Result<()> {
        let path = self.root_dir().join("etc").join("hostname");
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path)
            .await
            .map_err(|e| anyhow!("opening {}: {e}", path.display()))?;
        file.write_all(format!("{}\n", self.name).as_bytes()).await?;
        file.flush().await?;
        info!(path = %path.display(), "hostname written");
        Ok(())
    }

    pub async fn check_internet(&self, signal: &CancelSignal) -> Result<()> {
        self.runner()
            .run(
                &Invocation::new("ping").args(["-c", "1", "-W", "5", CONNECTIVITY_HOST]),
                signal,
            )
            .await
            .map_err(|e| anyhow!("no internet connectivity: {e}"))?;
        Ok(())
    }
}
