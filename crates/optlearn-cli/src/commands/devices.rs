//! `optlearn devices` command - List compute devices.

use colored::Colorize;
use tracing::warn;

use optlearn::{cuda_device_count, CpuBackend};

use crate::error::CliResult;

/// Execute the `devices` command.
pub fn execute() -> CliResult<()> {
    println!("{}:", "Compute Devices".bright_white().underline());

    let cpu = CpuBackend::new();
    println!(
        "  {} cpu: {} emulated device(s)",
        "✓".bright_green(),
        cpu.device_count()
    );

    let cuda = cuda_device_count();
    if cuda > 0 {
        println!("  {} cuda: {} device(s)", "✓".bright_green(), cuda);
        for ordinal in 0..cuda {
            println!("      {} device {}", "•".dimmed(), ordinal);
        }
    } else if cfg!(feature = "cuda") {
        warn!("CUDA feature enabled but no device could be enumerated");
        println!("  {} cuda: no device found", "✗".red());
    } else {
        println!(
            "  {} cuda: {} (rebuild with --features cuda)",
            "✗".red(),
            "not enabled".dimmed()
        );
    }
    Ok(())
}
