use std::io::Write;
use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use api_types::ResourceClaim;
use clap::Parser;
use cpu_driver::config::Cli;
use cpu_driver::config::Commands;
use cpu_driver::config::DriverArgs;
use cpu_driver::config::PrepareArgs;
use cpu_driver::cpuinfo::CpuInfo;
use cpu_driver::cpuinfo::CpuTopology;
use cpu_driver::driver::CpuDriver;
use serde::Serialize;
use utils::logging;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    let _guard = logging::init(cli.driver.log_path.as_ref());

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        driver = %cli.driver.driver_name,
        node = %cli.driver.node_name,
        "starting cpu-driver"
    );

    match cli.command {
        Commands::Topology => run_topology(&cli.driver),
        Commands::Slices => run_slices(&cli.driver),
        Commands::Prepare(prepare_args) => run_prepare(&cli.driver, &prepare_args),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TopologySummary<'a> {
    smt_enabled: bool,
    num_sockets: usize,
    num_numa_nodes: usize,
    num_cores: usize,
    num_cpus: usize,
    cpus: Vec<&'a CpuInfo>,
}

fn discover_topology(args: &DriverArgs) -> Result<CpuTopology> {
    args.cpu_info_provider()
        .topology()
        .map_err(|report| anyhow!("{report:?}"))
        .context("failed to discover CPU topology")
}

fn build_driver(args: &DriverArgs) -> Result<CpuDriver> {
    let topology = discover_topology(args)?;
    let cdi = args.cdi_registry().context("failed to open CDI spec")?;
    let unknown = args
        .reserved_cpus
        .difference(&topology.cpu_details.cpus());
    if !unknown.is_empty() {
        tracing::warn!(cpus = %unknown, "reserved CPUs not present on this node");
    }

    Ok(CpuDriver::new(
        args.driver_name.clone(),
        args.node_name.clone(),
        args.device_mode(),
        Arc::new(topology),
        args.reserved_cpus.clone(),
        cdi,
    ))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, value).context("failed to encode output")?;
    writeln!(stdout).context("failed to write output")?;
    Ok(())
}

fn run_topology(args: &DriverArgs) -> Result<()> {
    let topology = discover_topology(args)?;
    print_json(&TopologySummary {
        smt_enabled: topology.smt_enabled,
        num_sockets: topology.num_sockets(),
        num_numa_nodes: topology.num_numa_nodes(),
        num_cores: topology.num_cores(),
        num_cpus: topology.num_cpus(),
        cpus: topology.cpu_details.iter().collect(),
    })
}

fn run_slices(args: &DriverArgs) -> Result<()> {
    let driver = build_driver(args)?;
    print_json(&driver.publish_resources())
}

fn run_prepare(args: &DriverArgs, prepare_args: &PrepareArgs) -> Result<()> {
    let content = std::fs::read_to_string(&prepare_args.claims)
        .with_context(|| format!("failed to read claims from {:?}", prepare_args.claims))?;
    let claims: Vec<ResourceClaim> = serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse claims from {:?}", prepare_args.claims))?;

    let driver = build_driver(args)?;
    if driver.publish_resources().is_none() {
        tracing::warn!("no devices published, every claim for this driver will fail");
    }
    print_json(&driver.prepare_resource_claims(&claims))
}
