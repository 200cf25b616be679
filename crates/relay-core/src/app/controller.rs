//! ConcurrencyController - 負荷に応じて AdmissionGate の capacity を増減する
//!
//! ヒステリシス型（PID ではない）。1 tick で変えるのは最大 ±1。
//!
//! # 判定（上から順に評価）
//! 1. CPU < cpu_low かつ メモリ < memory_low かつ depth > depth_grow → +1
//! 2. CPU > cpu_high または メモリ > memory_high または depth < depth_shrink → -1
//! 3. それ以外 → 変更なし
//!
//! 負荷やキュー長が読めなかった tick は何もしません。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::app::gate::AdmissionGate;
use crate::domain::RelayError;
use crate::ports::{Broker, LoadSample, LoadSampler};

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSettings {
    pub cpu_low: f32,
    pub cpu_high: f32,
    pub memory_low: f32,
    pub memory_high: f32,
    /// Grow only while the backlog is deeper than this.
    pub depth_grow: usize,
    /// Shrink when the backlog is shallower than this.
    pub depth_shrink: usize,
    pub interval: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            cpu_low: 50.0,
            cpu_high: 85.0,
            memory_low: 50.0,
            memory_high: 85.0,
            depth_grow: 5,
            depth_shrink: 1,
            interval: Duration::from_secs(5),
        }
    }
}

impl ControllerSettings {
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.cpu_low >= self.cpu_high {
            return Err(RelayError::Config(format!(
                "cpu low threshold {} must be below high threshold {}",
                self.cpu_low, self.cpu_high
            )));
        }
        if self.memory_low >= self.memory_high {
            return Err(RelayError::Config(format!(
                "memory low threshold {} must be below high threshold {}",
                self.memory_low, self.memory_high
            )));
        }
        if self.interval.is_zero() {
            return Err(RelayError::Config("controller interval must be non-zero".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    Grow,
    Shrink,
    Hold,
}

pub fn decide(settings: &ControllerSettings, sample: LoadSample, depth: usize) -> Adjustment {
    let idle = sample.cpu_percent < settings.cpu_low && sample.memory_percent < settings.memory_low;
    if idle && depth > settings.depth_grow {
        return Adjustment::Grow;
    }

    let overloaded =
        sample.cpu_percent > settings.cpu_high || sample.memory_percent > settings.memory_high;
    if overloaded || depth < settings.depth_shrink {
        return Adjustment::Shrink;
    }

    Adjustment::Hold
}

pub struct ConcurrencyController {
    gate: Arc<AdmissionGate>,
    broker: Arc<dyn Broker>,
    sampler: Arc<dyn LoadSampler>,
    task_queue: String,
    settings: ControllerSettings,
}

impl ConcurrencyController {
    pub fn new(
        gate: Arc<AdmissionGate>,
        broker: Arc<dyn Broker>,
        sampler: Arc<dyn LoadSampler>,
        task_queue: impl Into<String>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            gate,
            broker,
            sampler,
            task_queue: task_queue.into(),
            settings,
        }
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// One sampling round. Returns the capacity in effect afterwards.
    pub async fn tick(&self) -> usize {
        let sample = match self.sampler.sample().await {
            Ok(sample) => sample,
            Err(e) => {
                warn!(error = %e, "load sample failed; keeping capacity");
                return self.gate.capacity();
            }
        };
        let depth = match self.broker.depth(&self.task_queue).await {
            Ok(depth) => depth,
            Err(e) => {
                warn!(queue = %self.task_queue, error = %e, "queue depth unavailable; keeping capacity");
                return self.gate.capacity();
            }
        };

        let current = self.gate.capacity();
        let target = match decide(&self.settings, sample, depth) {
            Adjustment::Grow => current.saturating_add(1),
            Adjustment::Shrink => current.saturating_sub(1),
            Adjustment::Hold => current,
        };
        let applied = if target == current {
            current
        } else {
            self.gate.resize(target)
        };

        if applied != current {
            info!(
                from = current,
                to = applied,
                cpu = sample.cpu_percent,
                memory = sample.memory_percent,
                depth,
                in_flight = self.gate.in_flight(),
                "concurrency adjusted"
            );
        } else {
            debug!(
                capacity = current,
                cpu = sample.cpu_percent,
                memory = sample.memory_percent,
                depth,
                "concurrency unchanged"
            );
        }
        applied
    }

    /// Tick every `interval` until shutdown is signalled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // first tick fires immediately; give the sampler one interval of history
        ticker.tick().await;

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
        debug!("concurrency controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rstest::rstest;

    use crate::impls::InMemoryBroker;

    struct FixedLoad(LoadSample);

    impl FixedLoad {
        fn new(cpu: f32, memory: f32) -> Self {
            Self(LoadSample::new(cpu, memory))
        }
    }

    #[async_trait]
    impl LoadSampler for FixedLoad {
        async fn sample(&self) -> Result<LoadSample, RelayError> {
            Ok(self.0)
        }
    }

    async fn broker_with_depth(queue: &str, depth: usize) -> Arc<InMemoryBroker> {
        let broker = Arc::new(InMemoryBroker::new());
        for _ in 0..depth {
            broker.publish(queue, b"{}".to_vec()).await.unwrap();
        }
        broker
    }

    #[rstest]
    #[case(10.0, 10.0, 6, Adjustment::Grow)]
    #[case(10.0, 10.0, 5, Adjustment::Hold)]
    #[case(60.0, 10.0, 20, Adjustment::Hold)]
    #[case(90.0, 10.0, 20, Adjustment::Shrink)]
    #[case(10.0, 90.0, 20, Adjustment::Shrink)]
    #[case(60.0, 60.0, 0, Adjustment::Shrink)]
    #[case(90.0, 90.0, 0, Adjustment::Shrink)]
    fn decision_table(
        #[case] cpu: f32,
        #[case] memory: f32,
        #[case] depth: usize,
        #[case] expected: Adjustment,
    ) {
        let settings = ControllerSettings::default();
        assert_eq!(decide(&settings, LoadSample::new(cpu, memory), depth), expected);
    }

    #[tokio::test]
    async fn overload_shrinks_by_one_and_respects_min() {
        let gate = Arc::new(AdmissionGate::new(2, 8, 5).unwrap());
        let controller = ConcurrencyController::new(
            Arc::clone(&gate),
            broker_with_depth("tasks", 0).await,
            Arc::new(FixedLoad::new(90.0, 90.0)),
            "tasks",
            ControllerSettings::default(),
        );

        assert_eq!(controller.tick().await, 4);
        assert_eq!(controller.tick().await, 3);
        assert_eq!(controller.tick().await, 2);
        assert_eq!(controller.tick().await, 2);
    }

    #[tokio::test]
    async fn idle_with_backlog_grows_by_one_up_to_max() {
        let gate = Arc::new(AdmissionGate::new(1, 3, 1).unwrap());
        let controller = ConcurrencyController::new(
            Arc::clone(&gate),
            broker_with_depth("tasks", 10).await,
            Arc::new(FixedLoad::new(5.0, 5.0)),
            "tasks",
            ControllerSettings::default(),
        );

        let mut previous = gate.capacity();
        for _ in 0..5 {
            let now = controller.tick().await;
            assert!(now.abs_diff(previous) <= 1);
            assert!((1..=3).contains(&now));
            previous = now;
        }
        assert_eq!(gate.capacity(), 3);
    }

    #[tokio::test]
    async fn broker_outage_holds_capacity() {
        let gate = Arc::new(AdmissionGate::new(1, 8, 4).unwrap());
        let broker = broker_with_depth("tasks", 0).await;
        broker.disconnect();
        let controller = ConcurrencyController::new(
            Arc::clone(&gate),
            broker,
            Arc::new(FixedLoad::new(99.0, 99.0)),
            "tasks",
            ControllerSettings::default(),
        );
        assert_eq!(controller.tick().await, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn run_ticks_until_shutdown() {
        let gate = Arc::new(AdmissionGate::new(1, 8, 8).unwrap());
        let controller = Arc::new(ConcurrencyController::new(
            Arc::clone(&gate),
            broker_with_depth("tasks", 0).await,
            Arc::new(FixedLoad::new(90.0, 90.0)),
            "tasks",
            ControllerSettings {
                interval: Duration::from_secs(1),
                ..ControllerSettings::default()
            },
        ));
        let (tx, rx) = watch::channel(false);

        let handle = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.run(rx).await })
        };

        tokio::time::sleep(Duration::from_millis(3500)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        // ticks at 1s, 2s, 3s
        assert_eq!(gate.capacity(), 5);
    }
}
