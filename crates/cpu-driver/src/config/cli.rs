use std::path::PathBuf;

use clap::Args;
use clap::Parser;
use clap::Subcommand;

use crate::config::driver::DriverArgs;

#[derive(Parser)]
#[command(name = "cpu-driver", about, long_about = None, version)]
pub struct Cli {
    #[command(flatten)]
    pub driver: DriverArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the discovered CPU topology as JSON
    Topology,
    /// Print the resource pool this node would publish as JSON
    Slices,
    /// Prepare allocated claims read from a file and print the results as JSON
    Prepare(PrepareArgs),
}

#[derive(Args, Clone, Debug)]
pub struct PrepareArgs {
    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        help = "JSON or YAML array of allocated resource claims, prepared in order"
    )]
    pub claims: PathBuf,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use similar_asserts::assert_eq;

    use super::*;
    use crate::cpuset::CpuSet;
    use crate::device::DeviceMode;
    use crate::device::GroupBy;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_prepare_with_grouped_mode() {
        let cli = Cli::try_parse_from([
            "cpu-driver",
            "--node-name",
            "node-a",
            "--reserved-cpus",
            "0-1,8",
            "--cpu-device-mode",
            "grouped",
            "--group-by",
            "socket",
            "prepare",
            "--claims",
            "/tmp/claims.json",
        ])
        .unwrap();

        assert_eq!(cli.driver.node_name, "node-a");
        assert_eq!(cli.driver.driver_name, "dra.cpu");
        assert_eq!(cli.driver.reserved_cpus, CpuSet::from([0, 1, 8]));
        assert_eq!(cli.driver.device_mode(), DeviceMode::Grouped(GroupBy::Socket));
        match cli.command {
            Commands::Prepare(args) => assert_eq!(args.claims, PathBuf::from("/tmp/claims.json")),
            _ => panic!("expected prepare"),
        }
    }

    #[test]
    fn defaults() {
        let cli = Cli::try_parse_from(["cpu-driver", "--node-name", "n", "slices"]).unwrap();
        assert!(cli.driver.reserved_cpus.is_empty());
        assert_eq!(cli.driver.device_mode(), DeviceMode::Individual);
        assert_eq!(cli.driver.sysfs_root, PathBuf::from("/sys"));
        assert!(matches!(cli.command, Commands::Slices));
    }

    #[test]
    fn rejects_bad_cpu_list() {
        let args = ["cpu-driver", "--node-name", "n", "--reserved-cpus", "3-x", "topology"];
        let parsed = Cli::try_parse_from(args);
        assert!(parsed.is_err());
    }
}
