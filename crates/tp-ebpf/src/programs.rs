use std::path::{Path, PathBuf};
use tp_core::InitializedEbpf;

/// Which hook a program attaches to, and so which base flags it takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attach {
    /// `--cgroup <path> --bpffs <path>`
    Cgroup,
    /// `--bpffs <path>`
    Socket,
    /// `--bpffs <path> --iface <name>`
    TrafficControl,
}

/// Extra flags a program needs beyond its base flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Needs {
    pub ports: bool,
    pub dns: bool,
    pub uid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pub name: &'static str,
    pub attach: Attach,
    pub needs: Needs,
    /// Pinned objects under the bpffs root owned by this program.
    pub pinned: &'static [&'static str],
}

/// Host facts the flags are generated from.
#[derive(Debug, Clone)]
pub struct FlagContext<'a> {
    pub ebpf: &'a InitializedEbpf,
    pub cgroup: &'a Path,
    pub bpffs: &'a Path,
    pub uid: &'a str,
    pub iface: Option<&'a str>,
}

impl Program {
    pub fn flags(&self, ctx: &FlagContext<'_>) -> Vec<String> {
        let mut flags = Vec::new();

        if self.attach == Attach::Cgroup {
            push(&mut flags, "--cgroup", ctx.cgroup.display());
        }
        push(&mut flags, "--bpffs", ctx.bpffs.display());
        if self.attach == Attach::TrafficControl {
            if let Some(iface) = ctx.iface {
                push(&mut flags, "--iface", iface);
            }
        }

        if self.needs.ports {
            push(&mut flags, "--in-port", ctx.ebpf.inbound_port);
            push(&mut flags, "--out-port", ctx.ebpf.outbound_port);
        }
        if self.needs.dns {
            push(&mut flags, "--dns-port", ctx.ebpf.dns_port);
        }
        if self.needs.uid {
            push(&mut flags, "--uid", ctx.uid);
        }

        flags
    }

    pub fn pinned_paths(&self, bpffs: &Path) -> Vec<PathBuf> {
        self.pinned.iter().map(|p| bpffs.join(p)).collect()
    }
}

fn push(flags: &mut Vec<String>, flag: &str, value: impl std::fmt::Display) {
    flags.push(flag.to_string());
    flags.push(value.to_string());
}

/// The set of programs loaded by setup and removed by cleanup.
#[derive(Debug, Clone)]
pub struct Programs {
    programs: Vec<Program>,
}

impl Programs {
    pub fn new(programs: Vec<Program>) -> Self {
        Self { programs }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Program> {
        self.programs.iter()
    }

    pub fn get(&self, name: &str) -> Option<&Program> {
        self.programs.iter().find(|p| p.name == name)
    }
}

impl Default for Programs {
    fn default() -> Self {
        let cgroup = |name: &'static str, needs: Needs, pinned: &'static [&'static str]| Program {
            name,
            attach: Attach::Cgroup,
            needs,
            pinned,
        };

        Self::new(vec![
            cgroup(
                "mb_connect",
                Needs {
                    ports: true,
                    dns: true,
                    uid: true,
                },
                &["connect"],
            ),
            cgroup("mb_sockops", Needs::default(), &["sockops"]),
            cgroup("mb_get_sockopts", Needs::default(), &["get_sockopts"]),
            cgroup(
                "mb_sendmsg",
                Needs {
                    dns: true,
                    uid: true,
                    ..Needs::default()
                },
                &["sendmsg"],
            ),
            cgroup(
                "mb_recvmsg",
                Needs {
                    dns: true,
                    uid: true,
                    ..Needs::default()
                },
                &["recvmsg"],
            ),
            Program {
                name: "mb_redir",
                attach: Attach::Socket,
                needs: Needs::default(),
                pinned: &["redir"],
            },
            Program {
                name: "mb_tc",
                attach: Attach::TrafficControl,
                needs: Needs {
                    ports: true,
                    ..Needs::default()
                },
                pinned: &["tc"],
            },
        ])
    }
}
