use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use tokio::sync::Mutex;
use tokio::time::{Duration, interval, sleep};

/// Lifecycle of the backend process. Only [`Controller`] mutates this value; the legal
/// transition graph is `Offline -> Starting -> Online -> Offline`, plus the forced
/// `Starting -> Offline` path taken on process exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStatus {
    Offline,
    Starting,
    Online,
}

/// Capability interface for starting/stopping the backend process, injected into
/// [`Controller`] so the lifecycle state machine stays independent of *how* the backend
/// is actually supervised (shell commands, RCON, a service manager, ...).
pub trait BackendControl: Send + Sync + 'static {
    fn start(&self) -> impl Future<Output = ()> + Send;
    fn stop(&self) -> impl Future<Output = ()> + Send;
}

/// Owns `BackendStatus`, `TimeUntilUp` and `PendingShutdownTokens`. `PlayerCount` is owned
/// by the dispatcher and shared here only for the read the shutdown check needs.
pub struct Controller<B: BackendControl> {
    backend: B,
    status: Mutex<BackendStatus>,
    time_until_up: AtomicU32,
    pending_shutdown_tokens: AtomicU64,
    expected_startup_time: u32,
    idle_shutdown_delay: Duration,
    player_count: Arc<AtomicI64>,
}

impl<B: BackendControl> Controller<B> {
    pub fn new(
        backend: B,
        expected_startup_time: u32,
        idle_shutdown_delay: u64,
        player_count: Arc<AtomicI64>,
    ) -> Arc<Self> {
        Arc::new(Controller {
            backend,
            status: Mutex::new(BackendStatus::Offline),
            time_until_up: AtomicU32::new(expected_startup_time),
            pending_shutdown_tokens: AtomicU64::new(0),
            expected_startup_time,
            idle_shutdown_delay: Duration::from_secs(idle_shutdown_delay),
            player_count,
        })
    }

    pub async fn status(&self) -> BackendStatus {
        *self.status.lock().await
    }

    /// Seconds until `Online` if currently `Starting`, else zero.
    pub async fn time_until_up(&self) -> u32 {
        if *self.status.lock().await == BackendStatus::Starting {
            self.time_until_up.load(Ordering::SeqCst)
        } else {
            0
        }
    }

    /// Idempotent: a no-op unless the backend is currently `Offline`.
    pub async fn request_start(self: &Arc<Self>) {
        {
            let mut status = self.status.lock().await;
            if *status != BackendStatus::Offline {
                return;
            }
            *status = BackendStatus::Starting;
        }
        self.time_until_up
            .store(self.expected_startup_time, Ordering::SeqCst);
        log::info!("MINECRAFT SERVER IS STARTING!");
        self.backend.start().await;

        self.spawn_countdown_ticker();
        self.spawn_online_transition();
    }

    fn spawn_countdown_ticker(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                if this.status().await != BackendStatus::Starting {
                    break;
                }
                let prior = this.time_until_up.fetch_update(
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                    |v| if v > 0 { Some(v - 1) } else { None },
                );
                if prior.is_err() {
                    break;
                }
            }
        });
    }

    fn spawn_online_transition(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let delay = Duration::from_secs(self.expected_startup_time as u64);
        tokio::spawn(async move {
            sleep(delay).await;
            let became_online = {
                let mut status = this.status.lock().await;
                if *status == BackendStatus::Starting {
                    *status = BackendStatus::Online;
                    true
                } else {
                    false
                }
            };
            if became_online {
                log::info!("MINECRAFT SERVER IS UP!");
                this.schedule_shutdown_check();
            }
        });
    }

    /// Called by the dispatcher when a forwarding session begins. `now` is the
    /// post-increment player count, used only for the log line.
    pub fn notify_player_joined(&self, now: i64) {
        log::info!("A PLAYER JOINED THE SERVER! - {now} players online");
    }

    /// Called by the dispatcher when a forwarding session ends. `now` is the
    /// post-decrement player count. Arms a shutdown check after `idle_shutdown_delay`.
    pub fn notify_player_left(self: &Arc<Self>, now: i64) {
        log::info!("A PLAYER LEFT THE SERVER! - {now} players remaining");
        self.schedule_shutdown_check();
    }

    fn schedule_shutdown_check(self: &Arc<Self>) {
        self.pending_shutdown_tokens.fetch_add(1, Ordering::SeqCst);
        let this = Arc::clone(self);
        let delay = self.idle_shutdown_delay;
        tokio::spawn(async move {
            sleep(delay).await;
            this.run_shutdown_check().await;
        });
    }

    /// Atomically decrements the pending-token counter; only the last outstanding check
    /// may act, and only if the server is still empty and actually `Online`.
    async fn run_shutdown_check(&self) {
        let remaining = self.pending_shutdown_tokens.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining > 0 {
            return;
        }
        if self.player_count.load(Ordering::SeqCst) > 0 {
            return;
        }
        {
            let mut status = self.status.lock().await;
            if *status != BackendStatus::Online {
                return;
            }
            *status = BackendStatus::Offline;
        }
        log::info!("MINECRAFT SERVER IS SHUTTING DOWN!");
        self.backend.stop().await;
        self.time_until_up
            .store(self.expected_startup_time, Ordering::SeqCst);
    }

    /// Issues the stop command and forces `Offline` regardless of outstanding tokens or
    /// player count. Used at process exit.
    pub async fn force_stop(&self) {
        let mut status = self.status.lock().await;
        if *status == BackendStatus::Offline {
            return;
        }
        *status = BackendStatus::Offline;
        drop(status);
        log::info!("MINECRAFT SERVER IS FORCEFULLY SHUTTING DOWN!");
        self.backend.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FakeBackend {
        start_calls: Arc<AtomicUsize>,
        stop_calls: Arc<AtomicUsize>,
    }

    impl BackendControl for FakeBackend {
        async fn start(&self) {
            self.start_calls.fetch_add(1, Ordering::SeqCst);
        }
        async fn stop(&self) {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn make_controller(
        expected_startup_time: u32,
        idle_shutdown_delay: u64,
    ) -> (Arc<Controller<FakeBackend>>, Arc<AtomicUsize>, Arc<AtomicUsize>, Arc<AtomicI64>) {
        let start_calls = Arc::new(AtomicUsize::new(0));
        let stop_calls = Arc::new(AtomicUsize::new(0));
        let player_count = Arc::new(AtomicI64::new(0));
        let controller = Controller::new(
            FakeBackend {
                start_calls: start_calls.clone(),
                stop_calls: stop_calls.clone(),
            },
            expected_startup_time,
            idle_shutdown_delay,
            player_count.clone(),
        );
        (controller, start_calls, stop_calls, player_count)
    }

    #[tokio::test]
    async fn starts_offline() {
        let (controller, _, _, _) = make_controller(1, 1);
        assert_eq!(controller.status().await, BackendStatus::Offline);
        assert_eq!(controller.time_until_up().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn request_start_is_idempotent() {
        let (controller, start_calls, _, _) = make_controller(5, 5);
        controller.request_start().await;
        controller.request_start().await;
        controller.request_start().await;
        assert_eq!(start_calls.load(Ordering::SeqCst), 1);
        assert_eq!(controller.status().await, BackendStatus::Starting);
    }

    #[tokio::test(start_paused = true)]
    async fn transitions_to_online_after_startup_time() {
        let (controller, start_calls, _, _) = make_controller(5, 5);
        controller.request_start().await;
        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        assert_eq!(controller.status().await, BackendStatus::Online);
        assert_eq!(start_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_decreases_monotonically() {
        let (controller, _, _, _) = make_controller(5, 5);
        controller.request_start().await;
        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert_eq!(controller.time_until_up().await, 4);
        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert_eq!(controller.time_until_up().await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_never_issued_while_players_present() {
        let (controller, _, stop_calls, player_count) = make_controller(1, 1);
        controller.request_start().await;
        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert_eq!(controller.status().await, BackendStatus::Online);

        player_count.store(1, Ordering::SeqCst);
        controller.notify_player_left(0);
        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert_eq!(stop_calls.load(Ordering::SeqCst), 0);
        assert_eq!(controller.status().await, BackendStatus::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_shutdown_coalesces_overlapping_checks() {
        let (controller, _, stop_calls, player_count) = make_controller(1, 10);
        controller.request_start().await;
        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert_eq!(controller.status().await, BackendStatus::Online);

        // two players join then both leave within the same instant
        player_count.store(2, Ordering::SeqCst);
        player_count.store(1, Ordering::SeqCst);
        controller.notify_player_left(1);
        player_count.store(0, Ordering::SeqCst);
        controller.notify_player_left(0);

        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert_eq!(stop_calls.load(Ordering::SeqCst), 1);
        assert_eq!(controller.status().await, BackendStatus::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn rejoin_before_shutdown_check_blocks_stop() {
        let (controller, _, stop_calls, player_count) = make_controller(1, 10);
        controller.request_start().await;
        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        assert_eq!(controller.status().await, BackendStatus::Online);

        // a player leaves right as the server comes online; this arms a shutdown check
        // (alongside the one the online transition itself already armed)
        player_count.store(0, Ordering::SeqCst);
        controller.notify_player_left(0);

        // a player rejoins well before either check fires
        tokio::time::advance(Duration::from_secs(3)).await;
        player_count.store(1, Ordering::SeqCst);

        tokio::time::advance(Duration::from_secs(7)).await;
        tokio::task::yield_now().await;

        assert_eq!(stop_calls.load(Ordering::SeqCst), 0);
        assert_eq!(controller.status().await, BackendStatus::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_shutdown_delay_zero_still_requires_online() {
        let (controller, _, stop_calls, _) = make_controller(5, 0);
        controller.notify_player_left(0);
        tokio::task::yield_now().await;
        assert_eq!(stop_calls.load(Ordering::SeqCst), 0);
        assert_eq!(controller.status().await, BackendStatus::Offline);
    }

    #[tokio::test(start_paused = true)]
    async fn force_stop_from_starting_transitions_to_offline() {
        let (controller, start_calls, stop_calls, _) = make_controller(30, 30);
        controller.request_start().await;
        assert_eq!(start_calls.load(Ordering::SeqCst), 1);
        controller.force_stop().await;
        assert_eq!(stop_calls.load(Ordering::SeqCst), 1);
        assert_eq!(controller.status().await, BackendStatus::Offline);
    }

    #[tokio::test]
    async fn force_stop_while_offline_is_a_no_op() {
        let (controller, _, stop_calls, _) = make_controller(5, 5);
        controller.force_stop().await;
        assert_eq!(stop_calls.load(Ordering::SeqCst), 0);
    }
}
