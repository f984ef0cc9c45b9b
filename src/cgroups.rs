use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command};
use thiserror::Error;
use tracing::{debug, warn};

/// Resource controllers this governor touches. All three hierarchies must be
/// prepared under the mount point before scheduling starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Controller {
    Memory,
    Cpu,
    Freezer,
}

impl Controller {
    pub const ALL: [Controller; 3] = [Controller::Memory, Controller::Cpu, Controller::Freezer];

    pub fn name(self) -> &'static str {
        match self {
            Controller::Memory => "memory",
            Controller::Cpu => "cpu",
            Controller::Freezer => "freezer",
        }
    }
}

/// Memory accounting counters for one group, read from the memory controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStat {
    /// Raw usage from memory.usage_in_bytes
    pub usage: u64,
    /// total_active_anon from memory.stat
    pub active_anon: u64,
    /// total_inactive_anon from memory.stat
    pub inactive_anon: u64,
}

/// Raised by the startup check when a controller hierarchy is missing. The
/// operator prepares the hierarchy once, with root; the daemon never
/// escalates privileges itself.
#[derive(Debug, Error)]
#[error("cgroup hierarchy {missing:?} is not prepared; execute `{command}` before starting the daemon")]
pub struct PreparedError {
    pub missing: PathBuf,
    pub command: String,
}

/// Stateless operations over the cgroup virtual filesystem, rooted at a
/// configurable mount point and a per-session base path.
#[derive(Debug, Clone)]
pub struct CgroupContext {
    mount: PathBuf,
    base: String,
}

impl CgroupContext {
    pub fn new(mount: impl Into<PathBuf>, base: impl Into<String>) -> Self {
        Self {
            mount: mount.into(),
            base: base.into(),
        }
    }

    /// Session base path, relative to each controller hierarchy.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Absolute directory of `path` under the given controller hierarchy.
    pub fn node(&self, ctrl: Controller, path: &str) -> PathBuf {
        self.mount.join(ctrl.name()).join(path)
    }

    /// Verify the prepared hierarchies exist for every controller.
    pub fn check_prepared(&self) -> std::result::Result<(), PreparedError> {
        for ctrl in Controller::ALL {
            let dir = self.node(ctrl, &self.base);
            if !dir.is_dir() {
                let user = current_username();
                return Err(PreparedError {
                    missing: dir,
                    command: format!(
                        "sudo cgcreate -t {user}:{user} -a {user}:{user} -g memory,cpu,freezer:{}",
                        self.base
                    ),
                });
            }
        }
        Ok(())
    }

    pub fn create(&self, ctrl: Controller, path: &str) -> Result<()> {
        let dir = self.node(ctrl, path);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create cgroup directory {dir:?}"))?;
        debug!("created cgroup {}:{}", ctrl.name(), path);
        Ok(())
    }

    /// Remove the group directory. Fails while processes remain attached; the
    /// caller confirms emptiness first.
    pub fn delete(&self, ctrl: Controller, path: &str) -> Result<()> {
        let dir = self.node(ctrl, path);
        fs::remove_dir(&dir).with_context(|| format!("failed to remove cgroup directory {dir:?}"))
    }

    /// Start `cmdline` with the child attached to `path` under every
    /// controller. The attach happens in the child between fork and exec, so
    /// the whole process tree is accounted from its first instruction. By the
    /// time this returns the child is already executing inside the group.
    pub fn spawn_member(&self, path: &str, cmdline: &str) -> Result<Child> {
        let procs: Vec<PathBuf> = Controller::ALL
            .iter()
            .map(|ctrl| self.node(*ctrl, path).join("cgroup.procs"))
            .collect();

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(cmdline);
        unsafe {
            cmd.pre_exec(move || {
                let pid = libc::getpid();
                for file in &procs {
                    let mut f = OpenOptions::new().write(true).open(file)?;
                    write!(f, "{pid}")?;
                }
                Ok(())
            });
        }
        cmd.spawn()
            .with_context(|| format!("failed to launch {cmdline:?} in cgroup {path}"))
    }

    /// Parse the group's process-membership file.
    pub fn read_members(&self, ctrl: Controller, path: &str) -> Result<Vec<i32>> {
        let file = self.node(ctrl, path).join("cgroup.procs");
        let content =
            fs::read_to_string(&file).with_context(|| format!("failed to read {file:?}"))?;
        Ok(content
            .lines()
            .filter_map(|line| line.trim().parse::<i32>().ok())
            .filter(|pid| *pid != 0)
            .collect())
    }

    /// Read the memory accounting counters for one group.
    pub fn read_stat(&self, path: &str) -> Result<MemoryStat> {
        let usage_file = self
            .node(Controller::Memory, path)
            .join("memory.usage_in_bytes");
        let usage = fs::read_to_string(&usage_file)
            .with_context(|| format!("failed to read {usage_file:?}"))?
            .trim()
            .parse::<u64>()
            .with_context(|| format!("unparsable value in {usage_file:?}"))?;

        let stat_file = self.node(Controller::Memory, path).join("memory.stat");
        let content = fs::read_to_string(&stat_file)
            .with_context(|| format!("failed to read {stat_file:?}"))?;

        let mut stat = MemoryStat {
            usage,
            ..MemoryStat::default()
        };
        for line in content.lines() {
            if let Some(v) = line.strip_prefix("total_active_anon ") {
                stat.active_anon = v.trim().parse().unwrap_or(0);
            } else if let Some(v) = line.strip_prefix("total_inactive_anon ") {
                stat.inactive_anon = v.trim().parse().unwrap_or(0);
            }
        }
        Ok(stat)
    }

    /// Write the hard memory ceiling for a group.
    pub fn write_hard_limit(&self, path: &str, bytes: u64) -> Result<()> {
        self.write_memory_file(path, "memory.limit_in_bytes", bytes)
    }

    /// Write the soft memory ceiling; the kernel reclaims above it first.
    pub fn write_soft_limit(&self, path: &str, bytes: u64) -> Result<()> {
        self.write_memory_file(path, "memory.soft_limit_in_bytes", bytes)
    }

    fn write_memory_file(&self, path: &str, file: &str, bytes: u64) -> Result<()> {
        let target = self.node(Controller::Memory, path).join(file);
        fs::write(&target, bytes.to_string())
            .with_context(|| format!("failed to write {bytes} to {target:?}"))
    }

    /// Suspend every process transitively in the group. Errors are discarded:
    /// a failed freeze must not abort a rebalance already in flight.
    pub fn freeze(&self, path: &str) {
        if let Err(err) = self.write_freezer_state(path, "FROZEN") {
            warn!("freeze of {path} failed: {err:#}");
        }
    }

    /// Resume every process transitively in the group. Same error policy as
    /// [`CgroupContext::freeze`].
    pub fn thaw(&self, path: &str) {
        if let Err(err) = self.write_freezer_state(path, "THAWED") {
            warn!("thaw of {path} failed: {err:#}");
        }
    }

    fn write_freezer_state(&self, path: &str, state: &str) -> Result<()> {
        let target = self.node(Controller::Freezer, path).join("freezer.state");
        fs::write(&target, state).with_context(|| format!("failed to write {state} to {target:?}"))
    }
}

/// System-wide available physical memory and used swap, in bytes. Any parse
/// failure yields `(0, 0)`: unknown, not "the system has zero memory" -
/// callers keep rebalancing with conservative numbers.
pub fn system_memory_snapshot() -> (u64, u64) {
    match fs::read_to_string("/proc/meminfo") {
        Ok(content) => parse_meminfo(&content),
        Err(_) => (0, 0),
    }
}

fn parse_meminfo(content: &str) -> (u64, u64) {
    let mut available = 0u64;
    let mut swap_total = 0u64;
    let mut swap_free = 0u64;
    for line in content.lines().filter(|l| !l.is_empty()) {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().trim_end_matches(" kB").trim();
        let Ok(kb) = value.parse::<u64>() else {
            return (0, 0);
        };
        match key.trim() {
            "MemAvailable" => available = kb * 1024,
            "SwapTotal" => swap_total = kb * 1024,
            "SwapFree" => swap_free = kb * 1024,
            _ => {}
        }
    }
    (available, swap_total.saturating_sub(swap_free))
}

fn current_username() -> String {
    nix::unistd::User::from_uid(nix::unistd::geteuid())
        .ok()
        .flatten()
        .map(|u| u.name)
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "user".to_string())
}
