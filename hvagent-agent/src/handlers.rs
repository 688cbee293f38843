//! Handlers for the built-in commands.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use hvagent_core::command::{
    tag, GetDomainXml, GetVmStats, MergeSnapshot, ScaleCpu, StartInstance, StopInstance,
};
use hvagent_core::{Answer, AnswerResult, Command};

use crate::accounting;
use crate::context::AgentContext;
use crate::dispatch::CommandHandler;
use crate::error::AgentError;
use crate::native::{SchedulerParams, XmlDescFlags};

/// One handler per built-in command tag.
#[must_use]
pub fn default_handlers() -> Vec<(&'static str, Arc<dyn CommandHandler>)> {
    fn shared<H: CommandHandler + 'static>(handler: H) -> Arc<dyn CommandHandler> {
        Arc::new(handler)
    }
    vec![
        (tag::START_INSTANCE, shared(StartInstanceHandler)),
        (tag::STOP_INSTANCE, shared(StopInstanceHandler)),
        (tag::GET_VM_STATS, shared(GetVmStatsHandler)),
        (tag::MERGE_SNAPSHOT, shared(MergeSnapshotHandler)),
        (tag::SCALE_CPU, shared(ScaleCpuHandler)),
        (tag::GET_DOMAIN_XML, shared(GetDomainXmlHandler)),
        (tag::REFRESH_CAPABILITIES, shared(RefreshCapabilitiesHandler)),
        (tag::CHECK_HEALTH, shared(CheckHealthHandler)),
    ]
}

fn mismatched(expected: &'static str, got: &Command) -> AgentError {
    AgentError::InvalidCommand(format!("{expected} handler received {}", got.tag()))
}

/// Builds the descriptor and boots the domain.
#[derive(Debug, Clone, Copy, Default)]
pub struct StartInstanceHandler;

#[async_trait]
impl CommandHandler for StartInstanceHandler {
    async fn handle(&self, ctx: &AgentContext, command: Command) -> Result<Answer, AgentError> {
        let spec = match command {
            Command::StartInstance(StartInstance { spec }) => spec,
            other => return Err(mismatched(tag::START_INSTANCE, &other)),
        };
        let caps = ctx.capabilities().await;
        let descriptor = ctx.builder().build(&spec, &caps)?;
        let xml = descriptor.to_xml();

        let domain = ctx.connection.create_domain(&xml).await?;
        tracing::info!(
            domain = %domain.name(),
            vcpus = descriptor.resources.current_vcpus,
            memory_kib = descriptor.resources.current_memory_kib,
            "domain started"
        );

        Ok(Answer::success(
            tag::START_INSTANCE,
            format!("started {}", domain.name()),
            AnswerResult::Started {
                name: domain.name().clone(),
                max_vcpus: descriptor.resources.max_vcpus,
                current_memory_kib: descriptor.resources.current_memory_kib,
                max_memory_kib: descriptor.resources.max_memory_kib,
            },
        ))
    }
}

/// Shuts down or destroys a domain.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopInstanceHandler;

#[async_trait]
impl CommandHandler for StopInstanceHandler {
    async fn handle(&self, ctx: &AgentContext, command: Command) -> Result<Answer, AgentError> {
        let (name, force) = match command {
            Command::StopInstance(StopInstance { name, force }) => (name, force),
            other => return Err(mismatched(tag::STOP_INSTANCE, &other)),
        };
        let domain = ctx.connection.lookup_domain(&name).await?;
        if force {
            domain.destroy().await?;
        } else {
            domain.shutdown().await?;
        }
        ctx.stats.forget(&name).await;
        tracing::info!(domain = %name, force, "domain stopped");

        let verb = if force { "destroyed" } else { "shutdown requested for" };
        Ok(Answer::success(
            tag::STOP_INSTANCE,
            format!("{verb} {name}"),
            AnswerResult::Stopped { name },
        ))
    }
}

/// Samples each named domain; domains that cannot be read are left out.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetVmStatsHandler;

#[async_trait]
impl CommandHandler for GetVmStatsHandler {
    async fn handle(&self, ctx: &AgentContext, command: Command) -> Result<Answer, AgentError> {
        let names = match command {
            Command::GetVmStats(GetVmStats { names }) => names,
            other => return Err(mismatched(tag::GET_VM_STATS, &other)),
        };
        let requested = names.len();
        let mut stats = BTreeMap::new();
        for name in names {
            let domain = match ctx.connection.lookup_domain(&name).await {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(domain = %name, error = %e, "skipping stats");
                    continue;
                }
            };
            match ctx.stats.collect(domain.as_ref()).await {
                Ok(entry) => {
                    stats.insert(name, entry);
                }
                Err(e) => tracing::warn!(domain = %name, error = %e, "skipping stats"),
            }
        }

        Ok(Answer::success(
            tag::GET_VM_STATS,
            format!("sampled {} of {requested} domains", stats.len()),
            AnswerResult::VmStats { stats },
        ))
    }
}

/// Runs a live block-commit merge.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeSnapshotHandler;

#[async_trait]
impl CommandHandler for MergeSnapshotHandler {
    async fn handle(&self, ctx: &AgentContext, command: Command) -> Result<Answer, AgentError> {
        let request = match command {
            Command::MergeSnapshot(request) => request,
            other => return Err(mismatched(tag::MERGE_SNAPSHOT, &other)),
        };
        let caps = ctx.capabilities().await;
        let report = ctx.merges.merge(ctx.connection.as_ref(), &caps, &request).await?;

        let MergeSnapshot { domain, disk_label, top_path, .. } = request;
        Ok(Answer::success(
            tag::MERGE_SNAPSHOT,
            format!("merged {} on {domain}/{disk_label}", top_path.display()),
            AnswerResult::Merged {
                domain,
                disk_label,
                deleted_by_library: report.deleted_by_library,
            },
        ))
    }
}

/// Re-applies CPU shares and the optional quota to a running domain.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScaleCpuHandler;

impl ScaleCpuHandler {
    fn limit(request: &ScaleCpu) -> Result<Option<f64>, AgentError> {
        if request.cpus == 0 || request.speed_mhz == 0 {
            return Err(AgentError::Configuration(
                "cpus and speed_mhz must be at least 1".to_owned(),
            ));
        }
        if !request.limit_cpu_use {
            return Ok(None);
        }
        match request.cpu_quota_percentage {
            Some(pct) if pct > 0.0 && pct <= 1.0 => Ok(Some(pct)),
            Some(pct) => Err(AgentError::Configuration(format!(
                "cpu_quota_percentage {pct} is outside (0, 1]"
            ))),
            None => Err(AgentError::Configuration(
                "cpu_quota_percentage is required when limiting CPU use".to_owned(),
            )),
        }
    }
}

#[async_trait]
impl CommandHandler for ScaleCpuHandler {
    async fn handle(&self, ctx: &AgentContext, command: Command) -> Result<Answer, AgentError> {
        let request = match command {
            Command::ScaleCpu(request) => request,
            other => return Err(mismatched(tag::SCALE_CPU, &other)),
        };
        let limit = Self::limit(&request)?;
        let caps = ctx.capabilities().await;
        let tune = accounting::cpu_tune_for(request.cpus, request.speed_mhz, limit, &caps);

        let params = if tune.is_limited() {
            SchedulerParams {
                cpu_shares: Some(tune.shares),
                vcpu_period: Some(tune.period),
                vcpu_quota: Some(tune.quota),
            }
        } else {
            SchedulerParams { cpu_shares: Some(tune.shares), vcpu_period: None, vcpu_quota: Some(-1) }
        };

        let domain = ctx.connection.lookup_domain(&request.name).await?;
        domain.set_scheduler_parameters(&params).await?;
        tracing::info!(
            domain = %request.name,
            shares = tune.shares,
            quota = tune.quota,
            period = tune.period,
            "cpu scaled"
        );

        Ok(Answer::success(
            tag::SCALE_CPU,
            format!("scaled {} to {} shares", request.name, tune.shares),
            AnswerResult::CpuScaled {
                name: request.name,
                shares: tune.shares,
                quota: tune.quota,
                period: tune.period,
            },
        ))
    }
}

/// Returns the live domain XML, including secrets when the host supports it.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetDomainXmlHandler;

#[async_trait]
impl CommandHandler for GetDomainXmlHandler {
    async fn handle(&self, ctx: &AgentContext, command: Command) -> Result<Answer, AgentError> {
        let name = match command {
            Command::GetDomainXml(GetDomainXml { name }) => name,
            other => return Err(mismatched(tag::GET_DOMAIN_XML, &other)),
        };
        let flags = if ctx.capabilities().await.features.secure_xml {
            XmlDescFlags::SECURE
        } else {
            XmlDescFlags::empty()
        };
        let domain = ctx.connection.lookup_domain(&name).await?;
        let xml = domain.xml_desc(flags).await?;

        Ok(Answer::success(
            tag::GET_DOMAIN_XML,
            format!("{} bytes", xml.len()),
            AnswerResult::DomainXml { name, xml },
        ))
    }
}

/// Re-probes the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct RefreshCapabilitiesHandler;

#[async_trait]
impl CommandHandler for RefreshCapabilitiesHandler {
    async fn handle(&self, ctx: &AgentContext, command: Command) -> Result<Answer, AgentError> {
        if !matches!(command, Command::RefreshCapabilities) {
            return Err(mismatched(tag::REFRESH_CAPABILITIES, &command));
        }
        let snapshot = ctx.refresh_capabilities().await;
        Ok(Answer::success(
            tag::REFRESH_CAPABILITIES,
            "capabilities refreshed",
            AnswerResult::Capabilities { snapshot: (*snapshot).clone() },
        ))
    }
}

/// Pings the hypervisor connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckHealthHandler;

#[async_trait]
impl CommandHandler for CheckHealthHandler {
    async fn handle(&self, ctx: &AgentContext, command: Command) -> Result<Answer, AgentError> {
        if !matches!(command, Command::CheckHealth) {
            return Err(mismatched(tag::CHECK_HEALTH, &command));
        }
        ctx.connection.is_alive().await?;
        Ok(Answer::success(tag::CHECK_HEALTH, "hypervisor reachable", AnswerResult::None))
    }
}
