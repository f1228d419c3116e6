//! Standalone swap executor.
//!
//! Usage: `swap-executor <artifact> <installation> <host-pid>`
//!
//! Exit codes: 0 complete, 2 rolled back, 3 aborted before any change,
//! 4 rollback failed.

fn main() {
    let guard = fnb_updater::logging::init_swap_executor();
    let outcome = fnb_updater::executor::run_from_args(std::env::args_os().skip(1));
    tracing::info!(code = outcome.exit_code(), "swap executor finished");

    // process::exit skips destructors; flush the log writer first.
    drop(guard);
    std::process::exit(outcome.exit_code());
}
