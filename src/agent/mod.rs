use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::analysis::{self, Report};
use crate::assembly::{DemuxPool, DemuxStatsSnapshot};
use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::protocol::conversation::EventSink;

/// Interval of the pipeline stats summary log.
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Agent wires the demultiplexer, the analysis pool and the health server,
/// and periodically reports the busiest keys.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    analysis: Option<Arc<analysis::Pool>>,
    demux: Option<Arc<DemuxPool>>,
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            analysis: None,
            demux: None,
            tasks: Vec::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Start all components. Must be called within a tokio runtime.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Health server first so probes respond while the pipeline starts.
        if !self.cfg.health.addr.is_empty() {
            self.health
                .start()
                .await
                .context("starting health metrics server")?;
        }

        // 2. Analysis shards. They outlive the agent token and are only
        // stopped by the pool's own shutdown, after the final report.
        let pool = Arc::new(analysis::Pool::spawn(
            self.cfg.analysis.shards,
            self.cfg.analysis.queue_size,
            CancellationToken::new(),
        ));
        if !self.cfg.analysis.filter.is_empty() {
            pool.set_filter_pattern(&self.cfg.analysis.filter)
                .context("installing key filter")?;
        }

        // 3. Demultiplexer feeding conversations into the shards.
        let sink: Arc<dyn EventSink> = Arc::clone(&pool) as Arc<dyn EventSink>;
        let demux = Arc::new(DemuxPool::spawn(
            self.cfg.demux_settings(),
            sink,
            self.cancel.child_token(),
        ));

        self.analysis = Some(Arc::clone(&pool));
        self.demux = Some(Arc::clone(&demux));

        // 4. Background loops.
        self.tasks.push(self.spawn_report_loop(Arc::clone(&pool), Arc::clone(&demux)));
        self.tasks.push(self.spawn_stats_reporter(pool, demux));

        info!(
            ports = ?self.cfg.ports,
            interval = ?self.cfg.report.interval,
            cumulative = self.cfg.report.cumulative,
            "agent fully started",
        );

        Ok(())
    }

    /// Entry point for reassembled traffic. `None` until started.
    pub fn deliveries(&self) -> Option<Arc<DemuxPool>> {
        self.demux.as_ref().map(Arc::clone)
    }

    /// The analysis pool. `None` until started.
    pub fn analysis(&self) -> Option<Arc<analysis::Pool>> {
        self.analysis.as_ref().map(Arc::clone)
    }

    pub fn health(&self) -> Arc<HealthMetrics> {
        Arc::clone(&self.health)
    }

    /// Gracefully stop all components. Returns the final report, or `None`
    /// if the agent was never started.
    pub async fn stop(&mut self) -> Result<Option<Report>> {
        // The demultiplexer drains queued deliveries and waits for its
        // conversations, so every event is queued on a shard afterwards.
        if let Some(demux) = self.demux.take() {
            demux.shutdown().await;
        }

        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                debug!(error = %e, "agent task failed");
            }
        }

        let mut final_report = None;
        if let Some(pool) = self.analysis.take() {
            let report = pool.report(false).await;
            self.health.observe_report(&report);
            log_report(&report, self.cfg.report.size);
            pool.shutdown().await;
            final_report = Some(report);
        }

        self.health.stop();

        Ok(final_report)
    }

    /// Spawn the periodic report loop.
    fn spawn_report_loop(
        &self,
        pool: Arc<analysis::Pool>,
        demux: Arc<DemuxPool>,
    ) -> JoinHandle<()> {
        let cancel = self.cancel.clone();
        let health = Arc::clone(&self.health);
        let interval = self.cfg.report.interval;
        let size = self.cfg.report.size;
        let reset = !self.cfg.report.cumulative;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let start = Instant::now();
                        let report = pool.report(reset).await;
                        health.report_duration.observe(start.elapsed().as_secs_f64());

                        health.observe(pool.stats(), demux.stats());
                        health.observe_report(&report);
                        log_report(&report, size);
                    }
                }
            }
        })
    }

    /// Spawn background pipeline stats reporter.
    fn spawn_stats_reporter(
        &self,
        pool: Arc<analysis::Pool>,
        demux: Arc<DemuxPool>,
    ) -> JoinHandle<()> {
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATS_LOG_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            let mut last_events = analysis::Stats::default();
            let mut last_deliveries = DemuxStatsSnapshot::default();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let events = pool.stats();
                        let deliveries = demux.stats();

                        let handled = events.events_handled - last_events.events_handled;
                        let dropped = events.events_dropped - last_events.events_dropped;
                        let conversations =
                            deliveries.conversations_started - last_deliveries.conversations_started;

                        last_events = events;
                        last_deliveries = deliveries;

                        if handled == 0 && dropped == 0 && conversations == 0 {
                            continue;
                        }

                        info!(
                            events_handled = handled,
                            events_dropped = dropped,
                            conversations,
                            "pipeline stats (60s)",
                        );
                        debug!(
                            deliveries_handled = deliveries.deliveries_handled,
                            deliveries_dropped = deliveries.deliveries_dropped,
                            "  deliveries (total)",
                        );
                    }
                }
            }
        })
    }
}

/// Logs the `size` busiest keys of a report.
fn log_report(report: &Report, size: usize) {
    if report.is_empty() {
        debug!("no key activity");
        return;
    }

    info!(
        keys = report.keys.len(),
        traffic = report.total_traffic(),
        "key report",
    );
    for (rank, key) in report.top(size).iter().enumerate() {
        info!(
            rank = rank + 1,
            key = %key.name,
            size = key.size,
            get_hits = key.get_hits,
            total_traffic = key.total_traffic,
            variable_size = key.variable_size,
            "  hot key",
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use std::net::{IpAddr, Ipv4Addr};
    use std::time::SystemTime;

    use bytes::Bytes;

    use crate::assembly::{ConnectionKey, Delivery};

    fn quiet_config() -> Config {
        let mut cfg = Config::default();
        cfg.health.addr = String::new();
        cfg.assembly.workers = 2;
        cfg.analysis.shards = 2;
        cfg
    }

    #[tokio::test]
    async fn test_accessors_empty_before_start() {
        let mut agent = Agent::new(quiet_config()).unwrap();
        assert!(agent.deliveries().is_none());
        assert!(agent.analysis().is_none());
        assert!(agent.stop().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stop_reports_outstanding_events() {
        let mut cfg = quiet_config();
        cfg.ports = vec![6379];
        cfg.report.interval = Duration::from_secs(3600);

        let mut agent = Agent::new(cfg).unwrap();
        agent.start().await.unwrap();

        let client = ConnectionKey::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            43000,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            6379,
        );
        let now = SystemTime::now();
        agent
            .deliveries()
            .unwrap()
            .handle_deliveries(vec![
                Delivery::data(client, now, Bytes::from_static(b"*2\r\n$3\r\nGET\r\n$2\r\nk1\r\n")),
                Delivery::data(client.reverse(), now, Bytes::from_static(b"$5\r\nhello\r\n")),
                Delivery::complete(client, now),
                Delivery::complete(client.reverse(), now),
            ])
            .unwrap();

        // No waiting: stop itself must carry the hit into the final report.
        let report = agent.stop().await.unwrap().unwrap();
        assert_eq!(report.keys.len(), 1);
        assert_eq!(report.keys[0].name, "k1");
        assert_eq!(report.keys[0].get_hits, 1);
        assert_eq!(report.keys[0].total_traffic, 5);
    }

    #[tokio::test]
    async fn test_start_installs_filter() {
        let mut cfg = quiet_config();
        cfg.analysis.filter = "^user:".to_string();

        let mut agent = Agent::new(cfg).unwrap();
        agent.start().await.unwrap();

        let pool = agent.analysis().unwrap();
        assert_eq!(pool.filter_pattern().as_deref(), Some("^user:"));
        assert_eq!(pool.shards(), 2);
        assert_eq!(agent.deliveries().unwrap().workers(), 2);

        agent.stop().await.unwrap();
        assert!(agent.deliveries().is_none());
    }

    // -- Error cases --

    #[tokio::test]
    async fn test_start_rejects_invalid_filter() {
        let mut cfg = quiet_config();
        cfg.analysis.filter = "(".to_string();

        let mut agent = Agent::new(cfg).unwrap();
        let err = agent.start().await.unwrap_err();
        assert!(err.to_string().contains("key filter"));
    }
}
