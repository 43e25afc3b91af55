//! Per-monitor check sequence.

use crate::monitor::MonitorDefinition;
use crate::probe::{run_http_check, run_mail_check, run_ping_check, ProbeContext};
use crate::report::StatusReport;
use crate::status::{Status, Tally};

/// Result of one monitor's run.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorOutcome {
    /// Key the monitor was loaded under (its definition file name).
    pub name: String,
    pub tally: Tally,
    pub status: Status,
    /// Last probe error seen, kept for logging.
    pub last_error: Option<String>,
}

/// Runs ping, HTTP and mail stages for one monitor, strictly in that order,
/// then sends the aggregate report to the monitor's default column.
pub struct MonitorTask {
    name: String,
    monitor: MonitorDefinition,
    ctx: ProbeContext,
}

impl MonitorTask {
    pub fn new(name: String, monitor: MonitorDefinition, ctx: ProbeContext) -> Self {
        Self { name, monitor, ctx }
    }

    pub async fn run(self) -> MonitorOutcome {
        let m = &self.monitor;
        let mut tally = Tally::default();
        let mut last_error = None;

        tracing::debug!("Start monitor");

        if m.ping.enabled {
            let result = run_ping_check(m, &self.ctx).await;
            tally.record(&result);
            if let Err(e) = result {
                last_error = Some(e.to_string());
            }
        }

        if !m.http.is_empty() {
            let outcome = run_http_check(m, &self.ctx).await;
            tally += outcome.tally;
            if outcome.last_error.is_some() {
                last_error = outcome.last_error;
            }
        }

        if m.smtp.enabled {
            let result = run_mail_check(m, &self.ctx).await;
            tally.record(&result);
            if let Err(e) = result {
                last_error = Some(e.to_string());
            }
        }

        let status = tally.status();
        tracing::info!(bad = tally.bad, good = tally.good, status = %status, "Monitor");

        self.ctx
            .publish(StatusReport::new(
                &m.machine,
                &m.column,
                status,
                format!("Bad: {}\nGood: {}\n", tally.bad, tally.good),
            ))
            .await;

        MonitorOutcome {
            name: self.name,
            tally,
            status,
            last_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{HttpTargetConfig, MailConfig, PingConfig};
    use crate::probe::testing::{ContextBuilder, FakeFetcher, FakeMailer, FakePinger};
    use crate::probe::{PingStats, ProbeError};
    use crate::report::testing::RecordingReporter;
    use std::sync::Arc;
    use std::time::Duration;

    fn full_monitor() -> MonitorDefinition {
        MonitorDefinition {
            name: "web1".to_string(),
            machine: "web1".to_string(),
            column: "remote".to_string(),
            ip: "192.0.2.10".to_string(),
            ping: PingConfig {
                enabled: true,
                count: 3,
                column: "conn".to_string(),
            },
            http: vec![HttpTargetConfig {
                hostname: "www.example.com".to_string(),
                paths: vec!["/".to_string(), "/broken".to_string()],
                column: "http".to_string(),
                ..Default::default()
            }],
            smtp: MailConfig {
                enabled: true,
                column: "smtp".to_string(),
                ..Default::default()
            },
        }
    }

    fn healthy_stats() -> PingStats {
        PingStats::from_samples(3, &[Duration::from_micros(400); 3])
    }

    fn half_broken_fetcher() -> Arc<FakeFetcher> {
        Arc::new(FakeFetcher::new(|req| match req.url.path() {
            "/broken" => Ok(500),
            _ => Ok(200),
        }))
    }

    #[tokio::test]
    async fn test_stages_run_in_order_and_aggregate() {
        let reporter = Arc::new(RecordingReporter::default());
        let ctx = ContextBuilder::new()
            .reporter(reporter.clone())
            .pinger(Arc::new(FakePinger::answering(healthy_stats())))
            .fetcher(half_broken_fetcher())
            .mailer(Arc::new(FakeMailer::new(false)))
            .build();

        let outcome = MonitorTask::new("web1.monitor.json".into(), full_monitor(), ctx)
            .run()
            .await;

        // ping good, http 1 good 1 bad, mail bad
        assert_eq!(outcome.tally, Tally::new(2, 2));
        assert_eq!(outcome.status, Status::Yellow);
        assert!(outcome.last_error.unwrap().contains("550"));

        assert_eq!(reporter.columns(), vec!["conn", "http", "smtp", "remote"]);
        let reports = reporter.reports();
        assert_eq!(reports[0].status, Status::Green);
        assert_eq!(reports[1].status, Status::Red);
        assert_eq!(reports[2].status, Status::Red);
        assert_eq!(reports[3].status, Status::Yellow);
        assert_eq!(reports[3].body, "Bad: 2\nGood: 2\n");
    }

    #[tokio::test]
    async fn test_ping_failure_counts_bad_without_report() {
        let reporter = Arc::new(RecordingReporter::default());
        let ctx = ContextBuilder::new()
            .reporter(reporter.clone())
            .pinger(Arc::new(FakePinger::failing()))
            .build();

        let monitor = MonitorDefinition {
            http: Vec::new(),
            smtp: MailConfig::default(),
            ..full_monitor()
        };
        let outcome = MonitorTask::new("web1".into(), monitor, ctx).run().await;

        assert_eq!(outcome.tally, Tally::new(0, 1));
        assert_eq!(outcome.status, Status::Red);
        assert_eq!(reporter.columns(), vec!["remote"]);
    }

    #[tokio::test]
    async fn test_packet_loss_is_red_but_counts_good() {
        let reporter = Arc::new(RecordingReporter::default());
        let lossy = PingStats::from_samples(4, &[Duration::from_micros(400); 3]);
        let ctx = ContextBuilder::new()
            .reporter(reporter.clone())
            .pinger(Arc::new(FakePinger::answering(lossy)))
            .build();

        let monitor = MonitorDefinition {
            http: Vec::new(),
            smtp: MailConfig::default(),
            ..full_monitor()
        };
        let outcome = MonitorTask::new("web1".into(), monitor, ctx).run().await;

        assert_eq!(outcome.tally, Tally::new(1, 0));
        let reports = reporter.reports();
        assert_eq!(reports[0].status, Status::Red);
        assert!(reports[0].body.ends_with("Loss: 0.250\n"));
    }

    #[tokio::test]
    async fn test_http_failure_sets_last_error() {
        let fetcher = Arc::new(FakeFetcher::new(|req| match req.url.path() {
            "/broken" => Err(ProbeError::Network("connection refused".to_string())),
            _ => Ok(200),
        }));
        let ctx = ContextBuilder::new().fetcher(fetcher).build();

        let monitor = MonitorDefinition {
            ping: PingConfig::default(),
            smtp: MailConfig::default(),
            ..full_monitor()
        };
        let outcome = MonitorTask::new("web1".into(), monitor, ctx).run().await;

        assert_eq!(outcome.tally, Tally::new(1, 1));
        assert_eq!(
            outcome.last_error.as_deref(),
            Some("network error: connection refused")
        );
    }

    #[tokio::test]
    async fn test_dry_run_matches_live_tallies() {
        let mut outcomes = Vec::new();
        for dry_run in [false, true] {
            let reporter = Arc::new(RecordingReporter::default());
            let ctx = ContextBuilder::new()
                .reporter(reporter.clone())
                .pinger(Arc::new(FakePinger::answering(healthy_stats())))
                .fetcher(half_broken_fetcher())
                .dry_run(dry_run)
                .build();

            let outcome = MonitorTask::new("web1".into(), full_monitor(), ctx).run().await;
            assert_eq!(reporter.reports().is_empty(), dry_run);
            outcomes.push(outcome);
        }
        assert_eq!(outcomes[0], outcomes[1]);
    }

    #[tokio::test]
    async fn test_disabled_stages_are_skipped() {
        let reporter = Arc::new(RecordingReporter::default());
        let pinger = Arc::new(FakePinger::failing());
        let mailer = Arc::new(FakeMailer::new(false));
        let ctx = ContextBuilder::new()
            .reporter(reporter.clone())
            .pinger(pinger.clone())
            .mailer(mailer.clone())
            .build();

        let monitor = MonitorDefinition {
            name: "idle".to_string(),
            machine: "idle".to_string(),
            column: "remote".to_string(),
            ..Default::default()
        };
        let outcome = MonitorTask::new("idle".into(), monitor, ctx).run().await;

        assert_eq!(pinger.calls(), 0);
        assert_eq!(mailer.calls(), 0);
        assert_eq!(outcome.tally, Tally::default());
        assert_eq!(outcome.status, Status::Green);
        assert_eq!(reporter.columns(), vec!["remote"]);
    }
}
