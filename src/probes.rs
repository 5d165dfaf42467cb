//! Declarative probe selection table.
//!
//! Maps each security event category to the combination of kernel probes
//! required to observe it, expressed as a boolean combinator tree:
//! [`AllOf`](ProbeSelector::AllOf) children must all be satisfiable,
//! [`OneOf`](ProbeSelector::OneOf) needs at least one alternative (used
//! where the attach point varies across kernel versions, such as the
//! 32-bit time syscall variants). The table is pure configuration data,
//! built once at process start; evaluation belongs to the probe loader.

use std::{collections::HashMap, sync::LazyLock};

const AGENT_UID: &str = "ctmon";

/// Identifies one kernel probe by owner and attach section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeId {
    pub uid: &'static str,
    pub section: String,
}

/// Boolean combinator tree over probe identifiers.
#[derive(Debug, Clone)]
pub enum ProbeSelector {
    /// One concrete probe that must attach.
    Probe(ProbeId),
    /// Every child must be satisfiable.
    AllOf(Vec<ProbeSelector>),
    /// At least one alternative must be satisfiable.
    OneOf(Vec<ProbeSelector>),
}

fn probe(section: impl Into<String>) -> ProbeSelector {
    ProbeSelector::Probe(ProbeId {
        uid: AGENT_UID,
        section: section.into(),
    })
}

/// Entry and exit probes for one syscall.
fn syscall_probes(name: &str) -> ProbeSelector {
    ProbeSelector::AllOf(vec![
        probe(format!("kprobe/sys_{name}")),
        probe(format!("kretprobe/sys_{name}")),
    ])
}

/// Syscalls whose modern spelling coexists with a legacy 32-bit time
/// variant, depending on kernel version.
fn time_variant_syscall_probes(name: &str) -> ProbeSelector {
    ProbeSelector::OneOf(vec![
        syscall_probes(name),
        syscall_probes(&format!("{name}_time32")),
    ])
}

/// Probes to activate per event category. The `"*"` entry is always
/// activated regardless of which rules are loaded.
pub static SELECTORS_PER_EVENT_TYPE: LazyLock<HashMap<&'static str, Vec<ProbeSelector>>> =
    LazyLock::new(|| {
        HashMap::from([
            (
                "*",
                vec![
                    ProbeSelector::AllOf(vec![
                        probe("tracepoint/sched/sched_process_fork"),
                        probe("kprobe/do_exit"),
                    ]),
                    ProbeSelector::OneOf(vec![
                        probe("kprobe/cgroup_procs_write"),
                        probe("kprobe/cgroup1_procs_write"),
                    ]),
                    ProbeSelector::OneOf(vec![
                        probe("kprobe/cgroup_tasks_write"),
                        probe("kprobe/cgroup1_tasks_write"),
                    ]),
                    ProbeSelector::OneOf(vec![
                        syscall_probes("execve"),
                        syscall_probes("execveat"),
                    ]),
                ],
            ),
            (
                "chmod",
                vec![
                    ProbeSelector::AllOf(vec![
                        probe("kprobe/security_inode_setattr"),
                        probe("kprobe/mnt_want_write"),
                    ]),
                    syscall_probes("chmod"),
                    syscall_probes("fchmod"),
                    syscall_probes("fchmodat"),
                ],
            ),
            (
                "chown",
                vec![
                    ProbeSelector::AllOf(vec![
                        probe("kprobe/security_inode_setattr"),
                        probe("kprobe/mnt_want_write"),
                    ]),
                    ProbeSelector::OneOf(vec![
                        probe("kprobe/mnt_want_write_file"),
                        probe("kprobe/mnt_want_write_file_path"),
                    ]),
                    syscall_probes("chown"),
                    syscall_probes("fchown"),
                    syscall_probes("fchownat"),
                    syscall_probes("lchown"),
                ],
            ),
            (
                "link",
                vec![
                    ProbeSelector::AllOf(vec![
                        probe("kprobe/vfs_link"),
                        probe("kprobe/filename_create"),
                    ]),
                    syscall_probes("link"),
                    syscall_probes("linkat"),
                ],
            ),
            (
                "mkdir",
                vec![
                    ProbeSelector::AllOf(vec![
                        probe("kprobe/vfs_mkdir"),
                        probe("kprobe/filename_create"),
                    ]),
                    syscall_probes("mkdir"),
                    syscall_probes("mkdirat"),
                ],
            ),
            (
                "open",
                vec![
                    probe("kprobe/vfs_truncate"),
                    syscall_probes("open"),
                    syscall_probes("openat"),
                    syscall_probes("truncate"),
                ],
            ),
            (
                "rename",
                vec![
                    probe("kprobe/vfs_rename"),
                    syscall_probes("rename"),
                    syscall_probes("renameat"),
                    syscall_probes("renameat2"),
                ],
            ),
            (
                "rmdir",
                vec![
                    ProbeSelector::OneOf(vec![
                        probe("kprobe/vfs_rmdir"),
                        probe("kprobe/security_inode_rmdir"),
                    ]),
                    syscall_probes("rmdir"),
                ],
            ),
            (
                "unlink",
                vec![
                    probe("kprobe/vfs_unlink"),
                    syscall_probes("unlink"),
                    syscall_probes("unlinkat"),
                ],
            ),
            (
                "utimes",
                vec![
                    probe("kprobe/security_inode_setattr"),
                    time_variant_syscall_probes("utime"),
                    time_variant_syscall_probes("utimensat"),
                    syscall_probes("utimes"),
                ],
            ),
        ])
    });
