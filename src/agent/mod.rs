use crate::common::{page_size, Clock, MonotonicClock};

use anyhow::Context;
use ringlog::{debug, info, Drain, Level, LogBuilder, MultiLogBuilder, Output, Stderr};

use std::sync::Arc;
use std::time::Duration;

mod api;
mod config;
mod control;
mod counters;
mod registry;
mod ring;
mod sampler;
mod stats;

pub use config::Config;

use config::Mode;
use control::{ControlPlane, Group};
use counters::time::Tracer;
use counters::BuildContext;
use registry::{Registry, RegistryError};

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("failed to discover topology: {0}")]
    Topology(#[from] systeminfo::Error),
    #[error("no numa node has any processors")]
    NoNodes,
    #[error("{scope}: {source}")]
    Registry {
        scope: String,
        source: RegistryError,
    },
}

/// Runs the agent until interrupted.
pub fn run(config: Config, verbose: u8) -> anyhow::Result<()> {
    let level = match verbose {
        0 => config.log().level(),
        1 => Level::Debug,
        _ => Level::Trace,
    };

    let debug_output: Box<dyn Output> = Box::new(Stderr::new());

    let debug_log = if level <= Level::Info {
        LogBuilder::new().format(ringlog::default_format)
    } else {
        LogBuilder::new()
    }
    .output(debug_output)
    .build()
    .map_err(|e| anyhow::anyhow!("failed to initialize debug log: {e}"))?;

    let mut log = MultiLogBuilder::new()
        .level_filter(level.to_level_filter())
        .default(debug_log)
        .build()
        .start();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2)
        .thread_name("nodestat-control")
        .build()
        .context("failed to initialize async runtime")?;

    runtime.spawn(async move {
        loop {
            let _ = log.flush();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    });

    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock);
    let control = Arc::new(build(&config, clock)?);

    info!(
        "sampling period {}, history of {} samples per node",
        humantime::format_duration(Duration::from_millis(control.period())),
        config.general().capacity()
    );

    if config.general().autostart() {
        control.set_on(true);
    }

    let shutdown = Arc::new(tokio::sync::Notify::new());
    let signal = shutdown.clone();
    ctrlc::set_handler(move || signal.notify_one())
        .context("failed to set signal handler")?;

    let served = runtime.block_on(api::serve(
        config.general().listen(),
        control.clone(),
        shutdown,
    ));

    control.shutdown();
    info!("stopped");

    served
}

/// The counter names of every registry: the timing counters around the
/// configured ones.
fn counter_names(config: &Config) -> Vec<String> {
    let mut names = vec!["ts".to_string(), "intv".to_string()];
    names.extend(config.counters().enabled().iter().cloned());
    names.push("oh".to_string());
    names
}

fn group(
    config: &Config,
    id: Option<usize>,
    cpus: &[usize],
    names: &[String],
    clock: &Arc<dyn Clock>,
) -> Result<Group, EngineError> {
    let scope = match id {
        Some(id) => format!("node {id}"),
        None => "global".to_string(),
    };
    let fail = |source| EngineError::Registry {
        scope: scope.clone(),
        source,
    };

    let tracer = Arc::new(Tracer::new(clock.clone()));
    let ctx = BuildContext {
        config,
        cpus,
        tracer: &tracer,
    };

    let mut registry = Registry::resolve(names, &ctx).map_err(fail)?;
    registry.activate().map_err(fail)?;

    debug!(
        "{scope}: {} counters on {} processors",
        registry.len(),
        cpus.len()
    );

    Ok(Group {
        id,
        pin: id.and_then(|_| cpus.first().copied()),
        registry,
    })
}

/// Discovers the topology and initializes one registry per engine. If any
/// registry fails, the ones already initialized are torn down.
pub fn build(config: &Config, clock: Arc<dyn Clock>) -> Result<ControlPlane, EngineError> {
    let names = counter_names(config);

    let groups = match config.general().mode() {
        Mode::Global => {
            let cpus = systeminfo::online_cpus()?;
            vec![group(config, None, &cpus, &names, &clock)?]
        }
        Mode::Numa => {
            let mut groups = Vec::new();

            for node in systeminfo::numa_nodes()? {
                if node.cpus.is_empty() {
                    debug!("skipping node {} without processors", node.id);
                    continue;
                }

                groups.push(group(config, Some(node.id), &node.cpus, &names, &clock)?);
            }

            if groups.is_empty() {
                return Err(EngineError::NoNodes);
            }

            groups
        }
    };

    Ok(ControlPlane::new(
        groups,
        config.general().capacity(),
        config.general().period(),
        page_size(),
        clock,
    ))
}
