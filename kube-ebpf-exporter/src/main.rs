use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::runtime::Handle;
use tracing_subscriber::EnvFilter;

use kube_ebpf_exporter::config::{Config, NodeIdentity};
use kube_ebpf_exporter::data::container::{ContainerRuntime, DockerRuntime, UnavailableRuntime};
use kube_ebpf_exporter::data::kube_context::IdentityCache;
use kube_ebpf_exporter::data::procfs::ProcFs;
use kube_ebpf_exporter::decoder::ksym::Ksyms;
use kube_ebpf_exporter::decoder::DecoderContext;
use kube_ebpf_exporter::ebpf::loader::EbpfLoader;
use kube_ebpf_exporter::exporter::Exporter;
use kube_ebpf_exporter::server::{self, AppState};
use kube_ebpf_exporter::sink::SinkExporter;

#[derive(Parser)]
#[command(
    name = "kube-ebpf-exporter",
    about = "Exports eBPF map contents as Prometheus metrics attributed to Kubernetes pods"
)]
struct Cli {
    /// Address to listen on for the metrics endpoint
    #[arg(long = "web.listen-address", default_value = ":9435")]
    listen_address: String,

    /// Node name stamped on every metric and sink record
    #[arg(long = "node-id", default_value = "localhost")]
    node_id: String,

    /// Config file path
    #[arg(long = "config.file", default_value = "config.yaml")]
    config_file: PathBuf,

    /// Log at debug level and serve raw tables on /tables
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // log records are forwarded to the subscriber; RUST_LOG wins unless --debug.
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::load(&cli.config_file)?;
    let node = NodeIdentity::from_env(&cli.node_id);
    let addr = server::listen_addr(&cli.listen_address)?;

    let timeout = Duration::from_millis(config.identity.runtime_timeout_ms);
    let runtime: Arc<dyn ContainerRuntime> =
        match DockerRuntime::connect(Handle::current(), timeout) {
            Ok(docker) => Arc::new(docker),
            Err(e) => {
                log::warn!("container runtime unavailable, pods will not be resolved: {e:#}");
                Arc::new(UnavailableRuntime)
            }
        };
    let identity = Arc::new(IdentityCache::new(
        ProcFs::new(&config.identity.proc_root),
        runtime,
        config.identity.container_id_policy,
        config.identity.comm_fallback,
    ));
    let ctx = DecoderContext {
        identity,
        ksyms: Arc::new(Ksyms::new(config.identity.proc_root.join("kallsyms"))),
    };

    let sinks = config
        .programs
        .iter()
        .flat_map(|p| &p.metrics.counters)
        .any(|c| c.sink_mode.sinks());
    let sink = sinks.then(|| SinkExporter::new(&config.sink, node.clone()));

    let loader = EbpfLoader::load(&config.programs).context("loading eBPF programs")?;
    let exporter = Exporter::new(&config, node, &ctx, Arc::new(loader), sink)?;
    log::info!("exporting {} programs", config.programs.len());

    let state = Arc::new(AppState::new(Arc::new(exporter))?);
    server::run_server(state, addr, cli.debug).await
}
