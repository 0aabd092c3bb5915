//! Step lists for each verb, fed to [`Runner::run_steps`].
//!
//! Steps that set something up carry the cleanup that tears it down, so
//! the unwind closes mounts before the mappings beneath them.
//!
//! [`Runner::run_steps`]: crate::engine::Runner::run_steps

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;

use crate::cancel::CancelSignal;
use crate::engine::{Step, Task};
use crate::system::System;

/// Binds a system-level operation into a step action.
fn bind<F, Fut>(
    sys: &Arc<System>,
    f: F,
) -> impl Fn(CancelSignal) -> Fut + Send + Sync + 'static
where
    F: Fn(Arc<System>, CancelSignal) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let sys = Arc::clone(sys);
    move |signal| f(Arc::clone(&sys), signal)
}

fn step<F, Fut>(sys: &Arc<System>, name: &str, f: F) -> Step
where
    F: Fn(Arc<System>, CancelSignal) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Step::new(name).action(bind(sys, f))
}

fn root_open(sys: &Arc<System>) -> Step {
    step(sys, "open root", |sys, signal| async move {
        sys.root.luks_open(sys.runner(), &signal).await
    })
    .cleanup(bind(sys, |sys, signal| async move {
        sys.root.luks_close(sys.runner(), &signal).await
    }))
}

fn root_mount(sys: &Arc<System>) -> Step {
    step(sys, "mount root", |sys, signal| async move {
        sys.root.mount(sys.runner(), &signal).await
    })
    .cleanup(bind(sys, |sys, signal| async move {
        sys.root.umount(sys.runner(), &signal).await
    }))
}

fn efi_mount(sys: &Arc<System>) -> Step {
    step(sys, "mount efi", |sys, signal| async move {
        sys.efi.mount(sys.runner(), &signal).await
    })
    .cleanup(bind(sys, |sys, signal| async move {
        sys.efi.umount(sys.runner(), &signal).await
    }))
}

fn make_filesystems(sys: &Arc<System>) -> Task {
    let mut group = vec![Task::from(step(sys, "make root fs", |sys, signal| async move {
        sys.root.make_fs(sys.runner(), &signal).await
    }))];

    if sys.swap.is_some() {
        group.push(Task::serial(
            "swap",
            [
                Task::from(step(sys, "format swap", |sys, signal| async move {
                    match &sys.swap {
                        Some(swap) => swap.luks_format(sys.runner(), &signal).await,
                        None => Ok(()),
                    }
                })),
                Task::from(
                    step(sys, "open swap", |sys, signal| async move {
                        match &sys.swap {
                            Some(swap) => swap.luks_open(sys.runner(), &signal).await,
                            None => Ok(()),
                        }
                    })
                    .cleanup(bind(sys, |sys, signal| async move {
                        match &sys.swap {
                            Some(swap) => swap.luks_close(sys.runner(), &signal).await,
                            None => Ok(()),
                        }
                    })),
                ),
                Task::from(step(sys, "make swap", |sys, signal| async move {
                    match &sys.swap {
                        Some(swap) => swap.make_fs(sys.runner(), &signal).await,
                        None => Ok(()),
                    }
                })),
            ],
        ));
    }

    group.push(Task::from(step(sys, "make efi fs", |sys, signal| async move {
        sys.efi.make_fs(sys.runner(), &signal).await
    })));

    Task::parallel("make filesystems", group)
}

fn passwd(sys: &Arc<System>, user: String, password: String) -> Step {
    let name = format!("passwd {user}");
    step(sys, &name, move |sys, signal| {
        let user = user.clone();
        let password = password.clone();
        async move { sys.passwd(&user, &password, &signal).await }
    })
}

/// Partition, encrypt, format and install a new system onto `sys.disk`.
///
/// `password` is set for root and, when given, for `user`.
pub fn create(sys: Arc<System>, user: Option<String>, password: String) -> Vec<Task> {
    let mut steps = vec![
        Task::from(step(&sys, "partition disk", |sys, signal| async move {
            sys.gpt_setup(&signal).await
        })),
        Task::from(step(&sys, "format root", |sys, signal| async move {
            sys.root.luks_format(sys.runner(), &signal).await
        })),
        Task::from(root_open(&sys)),
        make_filesystems(&sys),
        Task::from(root_mount(&sys)),
        Task::from(efi_mount(&sys)),
        Task::from(step(&sys, "install filesystem", |sys, signal| async move {
            sys.install_filesystem(&signal).await
        })),
        Task::from(
            step(&sys, "mount virtual filesystems", |sys, signal| async move {
                sys.virtual_fs.mount(sys.runner(), &signal).await
            })
            .cleanup(bind(&sys, |sys, signal| async move {
                sys.virtual_fs.umount(sys.runner(), &signal).await
            })),
        ),
        Task::from(step(&sys, "install system", |sys, signal| async move {
            sys.install_system(&signal).await
        })),
        Task::from(step(&sys, "write hostname", |sys, _signal| async move {
            sys.gen_etc_hostname().await
        })),
        Task::from(step(&sys, "post install", |sys, signal| async move {
            sys.post_install(&signal).await
        })),
        Task::from(passwd(&sys, "root".to_string(), password.clone())),
    ];

    if let Some(user) = user {
        steps.push(Task::from(passwd(&sys, user, password)));
    }

    steps.push(Task::from(step(&sys, "snapshot", |sys, signal| async move {
        sys.root.snapshot("as-installed", sys.runner(), &signal).await
    })));
    steps
}

/// Open and mount an existing system, then run `args` with the terminal
/// attached.
pub fn exec(sys: Arc<System>, args: Vec<String>) -> Vec<Task> {
    let args = Arc::new(args);
    vec![
        Task::from(root_open(&sys)),
        Task::from(root_mount(&sys)),
        Task::from(efi_mount(&sys)),
        Task::from(step(&sys, "exec", move |sys, signal| {
            let args = Arc::clone(&args);
            async move { sys.exec(&args, &signal).await }
        })),
    ]
}

pub fn backup(sys: Arc<System>, args: Vec<String>) -> Vec<Task> {
    let args = Arc::new(args);
    vec![Task::from(step(&sys, "backup", move |sys, signal| {
        let args = Arc::clone(&args);
        async move { sys.backup(&args, &signal).await }
    }))]
}

pub fn check_internet(sys: Arc<System>) -> Vec<Task> {
    vec![Task::from(step(&sys, "check internet", |sys, signal| async move {
        sys.check_internet(&signal).await
    }))]
}
