//! Subscriber setup for hosts embedding the coordinator.

use tracing_subscriber::EnvFilter;

/// Environment variable holding an [`EnvFilter`] directive.
pub const LOG_ENV: &str = "KILN_LOG";

/// Installs a stderr fmt subscriber filtered by `KILN_LOG`.
///
/// Without the variable, `verbose` selects between debug and trace output for
/// kiln crates. Returns `false` if a global subscriber was already set.
pub fn init(verbose: bool) -> bool {
	let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| default_filter(verbose));
	let installed = tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(true)
		.try_init()
		.is_ok();
	if installed {
		tracing::debug!(verbose, "coordinator.tracing_initialized");
	}
	installed
}

fn default_filter(verbose: bool) -> EnvFilter {
	if verbose {
		EnvFilter::new("kiln=trace,debug")
	} else {
		EnvFilter::new("kiln=debug,info")
	}
}
