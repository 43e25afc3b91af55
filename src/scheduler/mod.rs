//! Scheduler module: one pass over all monitors.

mod task;

pub use task::*;

use crate::config::AgentConfig;
use crate::monitor::MonitorDefinition;
use crate::probe::{
    HttpFetcher, IcmpLock, IcmpPinger, MailProber, Pinger, ProbeContext, ProbeError,
    ReqwestFetcher, SmtpProber,
};
use crate::report::{StatusReporter, XymonClient};

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::Instrument;

/// Network-facing implementations used by every monitor task.
pub struct Collaborators {
    pub reporter: Arc<dyn StatusReporter>,
    pub pinger: Arc<dyn Pinger>,
    pub fetcher: Arc<dyn HttpFetcher>,
    pub mailer: Arc<dyn MailProber>,
}

impl Collaborators {
    /// Production collaborators for the given configuration.
    pub fn from_config(cfg: &AgentConfig) -> Result<Self, ProbeError> {
        Ok(Self {
            reporter: Arc::new(XymonClient::new(cfg.server.clone(), cfg.port, cfg.timeout)),
            pinger: Arc::new(IcmpPinger::new(cfg.icmp_timeout)),
            fetcher: Arc::new(ReqwestFetcher::new(cfg.http_timeout)?),
            mailer: Arc::new(SmtpProber::new(cfg.mail_timeout)),
        })
    }
}

/// Runs every loaded monitor concurrently and waits for all of them.
pub struct Controller {
    monitors: BTreeMap<String, MonitorDefinition>,
    icmp_lock: IcmpLock,
    ctx: ProbeContext,
}

impl Controller {
    pub fn new(
        monitors: BTreeMap<String, MonitorDefinition>,
        collaborators: Collaborators,
        dry_run: bool,
    ) -> Self {
        let icmp_lock = IcmpLock::new();
        let ctx = ProbeContext {
            reporter: collaborators.reporter,
            pinger: collaborators.pinger,
            fetcher: collaborators.fetcher,
            mailer: collaborators.mailer,
            icmp_lock: icmp_lock.clone(),
            dry_run,
        };

        Self {
            monitors,
            icmp_lock,
            ctx,
        }
    }

    pub fn monitor_count(&self) -> usize {
        self.monitors.len()
    }

    /// The lock all ping probes of this controller serialize on.
    pub fn icmp_lock(&self) -> &IcmpLock {
        &self.icmp_lock
    }

    /// Run one check pass over all monitors.
    ///
    /// Every monitor gets its own task; the call returns once all tasks have
    /// finished. A failing or panicking monitor never affects the others.
    pub async fn run(&self) -> Vec<MonitorOutcome> {
        if self.monitors.is_empty() {
            tracing::warn!("No monitors defined");
            return Vec::new();
        }

        tracing::debug!("Running {} monitors", self.monitors.len());

        let mut tasks = JoinSet::new();
        for (name, monitor) in &self.monitors {
            let span = tracing::info_span!(
                "monitor",
                monitor = %name,
                machine = %monitor.machine,
                column = %monitor.column,
                ip = %monitor.ip,
                dryrun = self.ctx.dry_run
            );
            let task = MonitorTask::new(name.clone(), monitor.clone(), self.ctx.clone());
            tasks.spawn(task.run().instrument(span));
        }

        let mut outcomes = Vec::with_capacity(self.monitors.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => {
                    if let Some(e) = &outcome.last_error {
                        tracing::warn!("Monitor {} finished with error: {}", outcome.name, e);
                    }
                    outcomes.push(outcome);
                }
                Err(e) => tracing::error!("Monitor task failed: {}", e),
            }
        }

        outcomes.sort_by(|a, b| a.name.cmp(&b.name));
        outcomes
    }
}
