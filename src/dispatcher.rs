use anyhow::Result;
use scopeguard::defer;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cgroups::{system_memory_snapshot, CgroupContext};
use crate::sandbox::UIApp;

pub const MB: u64 = 1000 * 1000;

/// Margin reserved for the focused application above its current usage, and
/// withheld from it below the pool ceiling.
const ACTIVE_HEADROOM: u64 = 100 * MB;

/// Period of the unconditional rebalance tick.
const BALANCE_INTERVAL: Duration = Duration::from_secs(1);

/// One rebalance's memory sample. Produced fresh per rebalance from
/// `/proc/meminfo` and the per-group counters; never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemInfo {
    /// Physical memory currently available system-wide
    pub total_rss_free: u64,
    /// Swap currently in use system-wide
    pub total_used_swap: u64,
    /// Resident memory attributed to the focused app
    pub active_rss: u64,
    /// Swapped memory attributed to the focused app
    pub active_swap: u64,
    /// Summed resident memory of all unfocused apps
    pub inactive_rss: u64,
    /// Summed swapped memory of all unfocused apps
    pub inactive_swap: u64,
    /// Number of unfocused apps in the sample
    pub n: usize,
}

impl MemInfo {
    /// Ceiling for the whole managed pool: whatever is free right now plus
    /// whatever the pool already holds. Never below current aggregate usage,
    /// so the first write cannot trigger an immediate self-induced OOM.
    pub fn ui_apps_limit(&self) -> u64 {
        self.total_rss_free + self.active_rss + self.inactive_rss
    }

    /// Ceiling for the focused app: nearly the whole pool, but always at
    /// least a fixed margin above its current usage. Zero when nothing is
    /// focused (or the focused app holds no resident memory yet).
    pub fn active_app_limit(&self) -> u64 {
        if self.active_rss == 0 {
            return 0;
        }
        (self.active_rss + ACTIVE_HEADROOM).max(self.ui_apps_limit().saturating_sub(ACTIVE_HEADROOM))
    }

    /// Uniform ceiling for every unfocused app, bounded by the pool ceiling
    /// and by true physical availability after reserving for the focused app.
    pub fn inactive_app_limit(&self) -> u64 {
        let active_memory = self.active_rss + self.active_swap;
        self.ui_apps_limit()
            .saturating_sub(active_memory)
            .min(self.total_rss_free.saturating_sub(active_memory))
    }
}

impl fmt::Display for MemInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "free {}MB, swap used {}MB | pool limit {}MB | active limit {}MB (holds {}MB) | inactive limit {}MB ({} apps hold {}MB)",
            self.total_rss_free / MB,
            self.total_used_swap / MB,
            self.ui_apps_limit() / MB,
            self.active_app_limit() / MB,
            (self.active_rss + self.active_swap) / MB,
            self.inactive_app_limit() / MB,
            self.n,
            (self.inactive_rss + self.inactive_swap) / MB,
        )
    }
}

struct State {
    counter: u64,
    active: Option<Arc<UIApp>>,
    inactive: Vec<Arc<UIApp>>,
    last_focus_id: u64,
}

/// Owns the focus-based partition of sandboxes and the rebalance machinery.
/// Every operation, including the whole freeze-bracketed rebalance, runs
/// under one exclusive lock: promotions and rebalances are totally ordered,
/// and the active slot cannot change while limits are being written.
pub struct Dispatcher {
    cg: CgroupContext,
    freeze_duration: Duration,
    state: Mutex<State>,
}

impl Dispatcher {
    pub fn new(cg: CgroupContext, freeze_duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            cg,
            freeze_duration,
            state: Mutex::new(State {
                counter: 0,
                active: None,
                inactive: Vec::new(),
                last_focus_id: 0,
            }),
        })
    }

    /// Launch `cmd` in a fresh sandbox and block until its process tree has
    /// exited and the group is reclaimed. Group-creation failure returns
    /// before the sandbox becomes visible to the scheduler.
    pub fn run(&self, cmd: &str) -> Result<()> {
        let id = {
            let mut st = self.lock_state();
            st.counter += 1;
            st.counter
        };
        let app = UIApp::launch(&self.cg, id, cmd)?;
        self.lock_state().inactive.push(app.clone());
        app.run()
    }

    /// Consume one focus-change event. Replays of the same change id are
    /// ignored; pid 0 means nothing is focused. A focused pid that belongs to
    /// no tracked sandbox also clears the active slot.
    pub fn on_focus_change(&self, pid: i32, change_id: u64) {
        let mut st = self.lock_state();
        if change_id == st.last_focus_id {
            return;
        }
        st.last_focus_id = change_id;

        let new_active = if pid == 0 {
            None
        } else {
            if let Some(active) = &st.active {
                if active.has_child(pid) {
                    return;
                }
            }
            st.inactive.iter().find(|app| app.has_child(pid)).cloned()
        };
        self.set_active_app(&mut st, new_active);
    }

    /// Unconditional 1 s rebalance tick; limits keep adapting to memory
    /// drift even without window switches. Never returns.
    pub fn balance_loop(&self) -> ! {
        loop {
            thread::sleep(BALANCE_INTERVAL);
            self.rebalance();
        }
    }

    pub fn rebalance(&self) {
        let mut st = self.lock_state();
        self.rebalance_locked(&mut st);
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Install `new_active`, demoting the previous active app. A no-op
    /// promotion skips the rebalance entirely.
    fn set_active_app(&self, st: &mut State, new_active: Option<Arc<UIApp>>) {
        let unchanged = match (&st.active, &new_active) {
            (None, None) => true,
            (Some(current), Some(next)) => Arc::ptr_eq(current, next),
            _ => false,
        };
        if unchanged {
            return;
        }

        if let Some(old) = st.active.take() {
            st.inactive.push(old);
        }
        if let Some(next) = &new_active {
            st.inactive.retain(|app| !Arc::ptr_eq(app, next));
            info!("focus moved to {:?} in cgroup {}", next.cmd(), next.cgroup());
        } else {
            info!("focus left the managed pool");
        }
        st.active = new_active;

        self.rebalance_locked(st);
    }

    fn sample(&self, st: &State) -> MemInfo {
        let mut sample = MemInfo::default();
        (sample.total_rss_free, sample.total_used_swap) = system_memory_snapshot();

        for app in &st.inactive {
            let (rss, swap) = app.memory_info();
            sample.inactive_rss += rss;
            sample.inactive_swap += swap;
        }
        if let Some(active) = &st.active {
            (sample.active_rss, sample.active_swap) = active.memory_info();
        }
        sample.n = st.inactive.len();
        sample
    }

    /// Apply fresh limits across the pool. The base group stays frozen for
    /// the whole write sequence so lowering a limit cannot race the kernel's
    /// OOM killer against a process that is mid-allocation; the thaw runs on
    /// every exit path.
    fn rebalance_locked(&self, st: &mut State) {
        let sample = self.sample(st);
        debug!("rebalance: {sample}");

        self.cg.freeze(self.cg.base());
        defer! {
            self.cg.thaw(self.cg.base());
        }

        if let Err(err) = self.cg.write_hard_limit(self.cg.base(), sample.ui_apps_limit()) {
            warn!("pool limit write failed: {err:#}");
        }
        if let Some(active) = &st.active {
            if let Err(err) = active.set_limit_rss(sample.active_app_limit()) {
                warn!("active limit write failed for {}: {err:#}", active.cgroup());
            }
        }

        // let kernel accounting settle while the pool is still frozen
        thread::sleep(self.freeze_duration);

        let inactive_limit = sample.inactive_app_limit();
        st.inactive.retain(|app| {
            if app.is_live() {
                if let Err(err) = app.set_limit_rss(inactive_limit) {
                    warn!("inactive limit write failed for {}: {err:#}", app.cgroup());
                }
                if let Err(err) = app.set_soft_limit(inactive_limit) {
                    debug!("soft limit write failed for {}: {err:#}", app.cgroup());
                }
                true
            } else if app.is_terminated() {
                info!("pruning exited app {:?} from cgroup {}", app.cmd(), app.cgroup());
                false
            } else {
                // created but not yet executing; keep it for the next tick
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroups::Controller;
    use std::fs;
    use tempfile::TempDir;

    fn scenario_a() -> MemInfo {
        MemInfo {
            total_rss_free: 2000 * MB,
            active_rss: 500 * MB,
            active_swap: 0,
            inactive_rss: 300 * MB,
            ..MemInfo::default()
        }
    }

    #[test]
    fn pool_limit_covers_current_usage() {
        let info = scenario_a();
        assert_eq!(info.ui_apps_limit(), 2800 * MB);
        assert!(info.ui_apps_limit() >= info.active_rss);
        assert!(info.ui_apps_limit() >= info.inactive_rss);
    }

    #[test]
    fn active_limit_takes_nearly_the_pool() {
        let info = scenario_a();
        // max(600, 2700)
        assert_eq!(info.active_app_limit(), 2700 * MB);
    }

    #[test]
    fn inactive_limit_bounded_by_physical_availability() {
        let info = scenario_a();
        // min(2800-500, 2000-500)
        assert_eq!(info.inactive_app_limit(), 1500 * MB);
    }

    #[test]
    fn no_active_app_means_zero_active_limit() {
        let info = MemInfo {
            total_rss_free: 2000 * MB,
            inactive_rss: 300 * MB,
            ..MemInfo::default()
        };
        assert_eq!(info.active_app_limit(), 0);
        assert_eq!(
            info.inactive_app_limit(),
            info.ui_apps_limit().min(info.total_rss_free)
        );
    }

    #[test]
    fn tiny_pool_saturates_instead_of_wrapping() {
        let info = MemInfo {
            total_rss_free: 10 * MB,
            active_rss: 20 * MB,
            active_swap: 50 * MB,
            ..MemInfo::default()
        };
        // pool - headroom saturates; active floor still applies
        assert_eq!(info.active_app_limit(), 120 * MB);
        // free - activeMemory would underflow; clamp to zero
        assert_eq!(info.inactive_app_limit(), 0);
    }

    struct Fixture {
        _dir: TempDir,
        cg: CgroupContext,
        dispatcher: Arc<Dispatcher>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let cg = CgroupContext::new(dir.path(), "base");
        for ctrl in Controller::ALL {
            fs::create_dir_all(cg.node(ctrl, "base")).unwrap();
        }
        let dispatcher = Dispatcher::new(cg.clone(), Duration::ZERO);
        Fixture {
            _dir: dir,
            cg,
            dispatcher,
        }
    }

    impl Fixture {
        /// Register an app the way `run` would, without blocking in exec.
        fn add_app(&self, pid: i32) -> Arc<UIApp> {
            let id = {
                let mut st = self.dispatcher.lock_state();
                st.counter += 1;
                st.counter
            };
            let app = UIApp::launch(&self.cg, id, "xterm").unwrap();
            let node = self.cg.node(Controller::Memory, app.cgroup());
            fs::write(node.join("cgroup.procs"), format!("{pid}\n")).unwrap();
            fs::write(node.join("memory.usage_in_bytes"), "1000").unwrap();
            fs::write(node.join("memory.stat"), "total_active_anon 200\n").unwrap();
            app.force_running();
            self.dispatcher.lock_state().inactive.push(app.clone());
            app
        }

        fn active_cgroup(&self) -> Option<String> {
            self.dispatcher
                .lock_state()
                .active
                .as_ref()
                .map(|a| a.cgroup().to_string())
        }

        fn inactive_cgroups(&self) -> Vec<String> {
            self.dispatcher
                .lock_state()
                .inactive
                .iter()
                .map(|a| a.cgroup().to_string())
                .collect()
        }

        fn freezer_state_file(&self) -> std::path::PathBuf {
            self.cg.node(Controller::Freezer, "base").join("freezer.state")
        }
    }

    #[test]
    fn promotion_moves_app_out_of_inactive_set() {
        let fx = fixture();
        let a = fx.add_app(100);
        let _b = fx.add_app(200);

        fx.dispatcher.on_focus_change(100, 1);
        assert_eq!(fx.active_cgroup().as_deref(), Some(a.cgroup()));
        assert!(!fx.inactive_cgroups().contains(&a.cgroup().to_string()));
        assert_eq!(fx.inactive_cgroups().len(), 1);
    }

    #[test]
    fn demotion_returns_previous_active_to_inactive() {
        let fx = fixture();
        let a = fx.add_app(100);
        let b = fx.add_app(200);

        fx.dispatcher.on_focus_change(100, 1);
        fx.dispatcher.on_focus_change(200, 2);
        assert_eq!(fx.active_cgroup().as_deref(), Some(b.cgroup()));
        let inactive = fx.inactive_cgroups();
        assert!(inactive.contains(&a.cgroup().to_string()));
        assert!(!inactive.contains(&b.cgroup().to_string()));
    }

    #[test]
    fn refocusing_the_active_app_skips_the_rebalance() {
        let fx = fixture();
        fx.add_app(100);
        fx.dispatcher.on_focus_change(100, 1);

        fs::remove_file(fx.freezer_state_file()).unwrap();
        fx.dispatcher.on_focus_change(100, 2);
        assert!(!fx.freezer_state_file().exists());
    }

    #[test]
    fn replayed_change_id_is_ignored() {
        let fx = fixture();
        fx.add_app(100);
        fx.add_app(200);

        fx.dispatcher.on_focus_change(100, 7);
        let before = fx.active_cgroup();
        // same change id, different pid: must not promote
        fx.dispatcher.on_focus_change(200, 7);
        assert_eq!(fx.active_cgroup(), before);
    }

    #[test]
    fn pid_zero_clears_the_active_slot() {
        let fx = fixture();
        let a = fx.add_app(100);
        fx.dispatcher.on_focus_change(100, 1);
        fx.dispatcher.on_focus_change(0, 2);
        assert_eq!(fx.active_cgroup(), None);
        assert!(fx.inactive_cgroups().contains(&a.cgroup().to_string()));
    }

    #[test]
    fn unmanaged_pid_clears_the_active_slot() {
        let fx = fixture();
        fx.add_app(100);
        fx.dispatcher.on_focus_change(100, 1);
        fx.dispatcher.on_focus_change(9999, 2);
        assert_eq!(fx.active_cgroup(), None);
    }

    #[test]
    fn rebalance_writes_limits_and_thaws() {
        let fx = fixture();
        let a = fx.add_app(100);
        let b = fx.add_app(200);
        fs::write(fx.freezer_state_file(), "THAWED").unwrap();

        fx.dispatcher.on_focus_change(100, 1);

        assert_eq!(
            fs::read_to_string(fx.freezer_state_file()).unwrap(),
            "THAWED"
        );
        let pool = fs::read_to_string(
            fx.cg
                .node(Controller::Memory, "base")
                .join("memory.limit_in_bytes"),
        )
        .unwrap();
        assert!(!pool.is_empty());
        // active gets at least its headroom margin
        assert!(a.limit_rss() >= 100 * MB);
        let written = fs::read_to_string(
            fx.cg
                .node(Controller::Memory, b.cgroup())
                .join("memory.limit_in_bytes"),
        )
        .unwrap();
        assert_eq!(written, b.limit_rss().to_string());
    }

    #[test]
    fn thaw_runs_even_when_limit_writes_fail() {
        let fx = fixture();
        fx.add_app(100);
        let b = fx.add_app(200);
        // a limit file that is a directory fails the write while the app
        // stays live, faulting the pass mid-loop
        let limit = fx
            .cg
            .node(Controller::Memory, b.cgroup())
            .join("memory.limit_in_bytes");
        fs::create_dir_all(&limit).unwrap();
        fs::write(fx.freezer_state_file(), "THAWED").unwrap();

        fx.dispatcher.on_focus_change(100, 1);

        assert_eq!(
            fs::read_to_string(fx.freezer_state_file()).unwrap(),
            "THAWED"
        );
        // the faulted app is live, so it stays tracked
        assert_eq!(fx.inactive_cgroups(), vec![b.cgroup().to_string()]);
    }

    #[test]
    fn dead_app_is_pruned_during_rebalance() {
        let fx = fixture();
        let a = fx.add_app(100);
        let b = fx.add_app(200);
        // b's process tree has exited: empty membership
        let node = fx.cg.node(Controller::Memory, b.cgroup());
        fs::write(node.join("cgroup.procs"), "").unwrap();

        fx.dispatcher.rebalance();

        let inactive = fx.inactive_cgroups();
        assert!(inactive.contains(&a.cgroup().to_string()));
        assert!(!inactive.contains(&b.cgroup().to_string()));
        assert!(b.is_terminated());
        // pruned apps absorb later limit writes silently
        assert!(b.set_limit_rss(1).is_ok());
    }

    #[test]
    fn created_but_not_running_app_survives_rebalance() {
        let fx = fixture();
        let app = UIApp::launch(&fx.cg, 99, "xterm").unwrap();
        fx.dispatcher.lock_state().inactive.push(app.clone());

        fx.dispatcher.rebalance();

        assert!(fx.inactive_cgroups().contains(&app.cgroup().to_string()));
    }
}
