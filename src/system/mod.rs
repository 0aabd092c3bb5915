//! The system being provisioned: its disks, mounts and install actions.
//!
//! Every operation here is one opaque unit of work for the engine. They
//! all take the run's cancellation signal and talk to the OS through a
//! [`CommandRunner`].

pub mod disk;
pub mod install;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::bail;

use crate::config::SystemSettings;
use crate::process::CommandRunner;

pub use disk::{EfiDisk, EncryptedDisk, SwapDisk, VirtualFs};

const PARTLABEL_DIR: &str = "/dev/disk/by-partlabel";
const MAPPER_DIR: &str = "/dev/mapper";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsType {
    Ext4,
    Btrfs,
    Vfat,
}

impl FsType {
    pub fn as_str(self) -> &'static str {
        match self {
            FsType::Ext4 => "ext4",
            FsType::Btrfs => "btrfs",
            FsType::Vfat => "vfat",
        }
    }
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FsType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ext4" => Ok(FsType::Ext4),
            "btrfs" => Ok(FsType::Btrfs),
            "vfat" => Ok(FsType::Vfat),
            other => bail!("unknown filesystem type: {other:?}"),
        }
    }
}

/// A named system and everything needed to build or enter it.
pub struct System {
    pub name: String,
    pub disk: Option<String>,
    pub enable_osx: bool,
    pub root: EncryptedDisk,
    pub efi: EfiDisk,
    pub swap: Option<SwapDisk>,
    pub virtual_fs: VirtualFs,
    pub settings: SystemSettings,
    runner: Arc<dyn CommandRunner>,
}

impl fmt::Debug for System {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("System")
            .field("name", &self.name)
            .field("disk", &self.disk)
            .field("enable_osx", &self.enable_osx)
            .field("swap", &self.swap.is_some())
            .field("mount_root", &self.settings.mount_root)
            .finish()
    }
}

impl System {
    /// Lay out a system using the standard naming rules: partitions are
    /// labelled `<name>-root`, `<name>-efi` and `<name>-swap`, and the root
    /// is mounted at `<mount_root>/<name>`.
    pub fn new(name: &str, settings: SystemSettings, runner: Arc<dyn CommandRunner>) -> Self {
        let root_name = format!("{name}-root");
        let efi_name = format!("{name}-efi");
        let dir = Path::new(&settings.mount_root).join(name);

        Self {
            name: name.to_string(),
            disk: None,
            enable_osx: false,
            root: EncryptedDisk {
                device: partlabel(&root_name),
                mapper: mapper(&root_name),
                name: root_name,
                fs_type: None,
                dir: dir.clone(),
                password: String::new(),
            },
            efi: EfiDisk {
                device: partlabel(&efi_name),
                name: efi_name,
                dir: dir.join("boot/efi"),
            },
            swap: None,
            virtual_fs: VirtualFs { dir },
            settings,
            runner,
        }
    }

    pub fn with_fs_type(mut self, fs_type: Option<FsType>) -> Self {
        self.root.fs_type = fs_type;
        self
    }

    pub fn with_disk(mut self, disk: impl Into<String>) -> Self {
        self.disk = Some(disk.into());
        self
    }

    pub fn with_osx(mut self, enable: bool) -> Self {
        self.enable_osx = enable;
        self
    }

    pub fn with_disk_password(mut self, password: impl Into<String>) -> Self {
        self.root.password = password.into();
        self
    }

    /// Add an encrypted swap partition keyed from the root mapping.
    pub fn with_swap(mut self) -> Self {
        let name = format!("{}-swap", self.name);
        self.swap = Some(SwapDisk {
            device: partlabel(&name),
            mapper: mapper(&name),
            root_name: self.root.name.clone(),
            name,
        });
        self
    }

    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    pub fn root_dir(&self) -> &Path {
        &self.root.dir
    }

    pub fn label(&self, thing: &str) -> String {
        format!("{}-{thing}", self.name)
    }
}

fn partlabel(name: &str) -> String {
    PathBuf::from(PARTLABEL_DIR).join(name).to_string_lossy().into_owned()
}

fn mapper(name: &str) -> String {
    PathBuf::from(MAPPER_DIR).join(name).to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessRunner;

    fn system() -> System {
        System::new("box", SystemSettings::default(), Arc::new(ProcessRunner))
    }

    #[test]
    fn test_standard_naming() {
        let sys = system().with_swap();

        assert_eq!(sys.root.name, "box-root");
        assert_eq!(sys.root.device, "/dev/disk/by-partlabel/box-root");
        assert_eq!(sys.root.mapper, "/dev/mapper/box-root");
        assert_eq!(sys.root.dir, PathBuf::from("/mnt/box"));
        assert_eq!(sys.efi.dir, PathBuf::from("/mnt/box/boot/efi"));
        let swap = sys.swap.as_ref().unwrap();
        assert_eq!(swap.name, "box-swap");
        assert_eq!(swap.root_name, "box-root");
        assert_eq!(sys.label("osx"), "box-osx");
    }

    #[test]
    fn test_fs_type_parsing() {
        assert_eq!("btrfs".parse::<FsType>().unwrap(), FsType::Btrfs);
        assert_eq!("ext4".parse::<FsType>().unwrap(), FsType::Ext4);
        assert!("zfs".parse::<FsType>().is_err());
        assert!("".parse::<FsType>().is_err());
    }
}
