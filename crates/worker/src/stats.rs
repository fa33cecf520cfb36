use serde::{Deserialize, Serialize};

/// Host statistics sampled while a task was running. These are reported back with the task
/// result so that clients can size future resource requests.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    /// The average one-minute load average while the task ran
    pub avg_load_average: f64,
    /// The maximum one-minute load average while the task ran
    pub max_load_average: f64,
    /// The maximum amount of RAM in use on the host, in bytes.
    pub max_ram_used: u64,
    /// Wall-clock run time of the task, in milliseconds
    pub wall_time_ms: u64,
}

#[cfg(feature = "stats")]
pub use tracker::*;

#[cfg(feature = "stats")]
mod tracker {
    use std::time::{Duration, Instant};

    use sysinfo::{MemoryRefreshKind, System};

    use super::Statistics;

    pub struct StatisticsTracker {
        close_tx: tokio::sync::oneshot::Sender<()>,
        task_handle: tokio::task::JoinHandle<Statistics>,
    }

    impl StatisticsTracker {
        pub async fn finish(self) -> Option<Statistics> {
            drop(self.close_tx);
            self.task_handle.await.ok()
        }
    }

    /// Start sampling host statistics every `interval`. Call [StatisticsTracker::finish] when
    /// the task exits to stop sampling and collect the result.
    pub fn track_system_stats(interval: Duration) -> StatisticsTracker {
        let (close_tx, mut close_rx) = tokio::sync::oneshot::channel();
        let task_handle = tokio::task::spawn(async move {
            let started = Instant::now();
            let mut system = System::new();
            let mut stats = Statistics::default();

            let mut total_load_average = 0.0;
            let mut num_load_averages = 0;

            let mut check_interval = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = check_interval.tick() => {
                        let load_avg = System::load_average();
                        total_load_average += load_avg.one;
                        num_load_averages += 1;
                        stats.max_load_average = stats.max_load_average.max(load_avg.one);

                        system.refresh_memory_specifics(MemoryRefreshKind::new().with_ram());
                        stats.max_ram_used = stats.max_ram_used.max(system.used_memory());
                    }
                    _ = &mut close_rx => {
                        break;
                    }
                }
            }

            if num_load_averages > 0 {
                stats.avg_load_average = total_load_average / (num_load_averages as f64);
            }
            stats.wall_time_ms = started.elapsed().as_millis() as u64;
            stats
        });

        StatisticsTracker {
            close_tx,
            task_handle,
        }
    }
}
