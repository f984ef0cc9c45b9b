use anyhow::{anyhow, Context, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cgroups::{CgroupContext, Controller};

/// How often to re-check membership while waiting for lingering descendants
/// after the primary process exits.
const RECLAIM_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Lifecycle of a sandboxed application. `Running` begins with the exec call;
/// `Terminated` is detected lazily from an empty or unreadable membership
/// list, never signalled by the process itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AppState {
    Created,
    Running,
    Terminated,
}

/// One launched application confined to its own control group. The group
/// directories exist for the lifetime of this value; they are reclaimed only
/// after the kernel confirms the group is empty.
pub struct UIApp {
    cg: CgroupContext,
    cgroup: String,
    cmd: String,
    limit: AtomicU64,
    state: Mutex<AppState>,
}

impl UIApp {
    /// Create the application's group under every controller. On failure the
    /// app never becomes visible to the scheduler.
    pub fn launch(cg: &CgroupContext, id: u64, cmd: &str) -> Result<Arc<UIApp>> {
        let cgroup = format!("{}/{}", cg.base(), id);
        for ctrl in Controller::ALL {
            cg.create(ctrl, &cgroup)?;
        }
        Ok(Arc::new(UIApp {
            cg: cg.clone(),
            cgroup,
            cmd: cmd.to_string(),
            limit: AtomicU64::new(0),
            state: Mutex::new(AppState::Created),
        }))
    }

    pub fn cgroup(&self) -> &str {
        &self.cgroup
    }

    pub fn cmd(&self) -> &str {
        &self.cmd
    }

    /// Last limit applied through [`UIApp::set_limit_rss`].
    pub fn limit_rss(&self) -> u64 {
        self.limit.load(Ordering::Relaxed)
    }

    /// True while the wrapped process tree is running. Re-verified against
    /// kernel state on every call: an empty or unreadable membership list
    /// flips the app to terminated.
    pub fn is_live(&self) -> bool {
        if *self.state.lock().unwrap() != AppState::Running {
            return false;
        }
        match self.cg.read_members(Controller::Memory, &self.cgroup) {
            Ok(pids) if !pids.is_empty() => true,
            _ => {
                self.set_state(AppState::Terminated);
                false
            }
        }
    }

    /// True once the membership list has been observed empty or unreadable.
    pub fn is_terminated(&self) -> bool {
        *self.state.lock().unwrap() == AppState::Terminated
    }

    /// Does `pid` currently belong to this app's group? Answered from the
    /// membership file, not a cached map, so exited processes never match.
    pub fn has_child(&self, pid: i32) -> bool {
        match self.cg.read_members(Controller::Memory, &self.cgroup) {
            Ok(pids) => pids.contains(&pid),
            Err(_) => false,
        }
    }

    /// Resident and swapped memory estimates in bytes, `(0, 0)` when not
    /// live. The split is approximated from raw usage and the active-anon
    /// counter; when the counter exceeds raw usage the whole usage is
    /// reported as resident and swap as zero.
    pub fn memory_info(&self) -> (u64, u64) {
        if !self.is_live() {
            return (0, 0);
        }
        let stat = match self.cg.read_stat(&self.cgroup) {
            Ok(stat) => stat,
            Err(_) => return (0, 0),
        };
        debug!(
            "cgroup {}: usage={} active_anon={} inactive_anon={}",
            self.cgroup, stat.usage, stat.active_anon, stat.inactive_anon
        );
        if stat.active_anon > stat.usage {
            (stat.usage, 0)
        } else {
            (stat.usage - stat.active_anon, stat.active_anon)
        }
    }

    /// Apply a hard memory ceiling. A dead sandbox silently absorbs the
    /// write: callers iterate over the whole partition without special cases.
    pub fn set_limit_rss(&self, bytes: u64) -> Result<()> {
        if *self.state.lock().unwrap() != AppState::Running {
            return Ok(());
        }
        self.limit.store(bytes, Ordering::Relaxed);
        self.cg.write_hard_limit(&self.cgroup, bytes)
    }

    /// Apply a soft memory ceiling. Same dead-sandbox contract as
    /// [`UIApp::set_limit_rss`].
    pub fn set_soft_limit(&self, bytes: u64) -> Result<()> {
        if *self.state.lock().unwrap() != AppState::Running {
            return Ok(());
        }
        self.cg.write_soft_limit(&self.cgroup, bytes)
    }

    /// Execute the wrapped command and block for its entire lifetime. After
    /// the primary exits, polls until forked helpers have drained out of the
    /// group, then reclaims the group directories.
    pub fn run(&self) -> Result<()> {
        info!("launching {:?} in cgroup {}", self.cmd, self.cgroup);

        // spawn returns only after the child is attached and executing, so
        // the app cannot be observed Running with an empty group
        let status = match self.cg.spawn_member(&self.cgroup, &self.cmd) {
            Ok(mut child) => {
                self.set_state(AppState::Running);
                child
                    .wait()
                    .with_context(|| format!("failed to wait for {:?}", self.cmd))
            }
            Err(err) => Err(err),
        };

        loop {
            match self.cg.read_members(Controller::Memory, &self.cgroup) {
                Ok(pids) if !pids.is_empty() => {
                    debug!("cgroup {} still holds {} process(es)", self.cgroup, pids.len());
                    thread::sleep(RECLAIM_POLL_INTERVAL);
                }
                _ => break,
            }
        }
        self.set_state(AppState::Terminated);

        for ctrl in Controller::ALL {
            if let Err(err) = self.cg.delete(ctrl, &self.cgroup) {
                warn!("reclaim of cgroup {} failed: {err:#}", self.cgroup);
            }
        }

        let status = status?;
        if status.success() {
            Ok(())
        } else {
            Err(anyhow!("{:?} exited with {status}", self.cmd))
        }
    }

    fn set_state(&self, next: AppState) {
        *self.state.lock().unwrap() = next;
    }

    #[cfg(test)]
    pub(crate) fn force_running(&self) {
        self.set_state(AppState::Running);
    }
}

impl std::fmt::Debug for UIApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UIApp")
            .field("cgroup", &self.cgroup)
            .field("cmd", &self.cmd)
            .field("limit", &self.limit_rss())
            .finish()
    }
}
