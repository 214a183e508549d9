//! Process-wide log plumbing for embedders that don't bring their own
//! subscriber.

use std::env;
use std::panic::{self, PanicHookInfo};

use tracing::{error, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const DEBUG_ENV: &str = "KASTREAM_DEBUG";

/// Install the process-wide subscriber and panic hook.
///
/// Log levels come from `RUST_LOG` and default to `info`, or `debug` when
/// `KASTREAM_DEBUG=true`. Production output is flattened JSON; the debug
/// switch selects human-readable text instead.
///
/// Workers abort on invariant violations, and when that abort happens inside
/// a spawned task the default panic output goes to raw stderr where
/// structured log collection never sees it. The hook reports panics as error
/// events, so a worker's cause of death lands in the same stream as its last
/// log lines.
pub fn register() {
    let debug_mode = env::var(DEBUG_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("true"));
    let default_directive = if debug_mode { "debug" } else { "info" }
        .parse()
        .unwrap_or(Level::INFO.into());
    let filter = EnvFilter::builder()
        .with_default_directive(default_directive)
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(filter);
    if debug_mode {
        registry.with(fmt::layer()).init();
    } else {
        registry
            .with(fmt::layer().with_ansi(false).json().flatten_event(true))
            .init();
    }

    panic::set_hook(Box::new(report_panic));
}

fn report_panic(panic_info: &PanicHookInfo<'_>) {
    let payload = panic_info
        .payload()
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<String>()
                .map(String::as_str)
        })
        .unwrap_or("panic payload of unknown type");
    match panic_info.location() {
        Some(location) => error!(%location, "panic: {payload}"),
        None => error!("panic: {payload}"),
    }
}
