use std::sync::Arc;
use std::time::Duration;

use muxbridge_router::{
    system, ChannelRoutingRule, HandlerRegistry, HostRoutingRule, Router, SuperuserChannel,
    SuperuserControl, SuperuserRoutingRule, SUPERUSER_PAYLOAD,
};
use tracing::{debug, info, info_span, Instrument};

use crate::cmd::{load_settings, BridgeArgs};
use crate::exit::{config_error, io_error, router_error, CliResult, SUCCESS};

/// Grace period for peer tasks once the connection is gone. stdin reads
/// run on a blocking thread that cannot be interrupted.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

pub fn run(args: BridgeArgs) -> CliResult<i32> {
    let settings = Arc::new(load_settings(args.config.as_deref())?);
    let privileged = args.privileged || system::is_root();
    let host_rule = HostRoutingRule::new(Arc::clone(&settings)).map_err(config_error)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| io_error("failed to start runtime", err))?;

    let result = runtime.block_on(
        async move {
            let mut router = Router::new(Arc::clone(&settings));
            router.add_rule(Box::new(host_rule));
            let control = SuperuserControl::new(Arc::clone(&settings), router.handle(), privileged);
            router.add_rule(Box::new(SuperuserRoutingRule::new(control.clone())));

            let mut registry = HandlerRegistry::with_builtins();
            registry.register(SUPERUSER_PAYLOAD, move |_| {
                Box::new(SuperuserChannel::new(control.clone()))
            });
            router.add_rule(Box::new(ChannelRoutingRule::new(registry, settings.flow_control)));
            debug!(rules = ?router.rule_names(), "routing rules installed");

            tokio::select! {
                result = router.serve(tokio::io::stdin(), tokio::io::stdout()) => {
                    result.map_err(|err| router_error("bridge failed", err))
                }
                signal = shutdown_signal() => {
                    info!(signal, "terminating");
                    Ok(())
                }
            }
        }
        .instrument(info_span!("bridge", privileged)),
    );

    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    result.map(|()| SUCCESS)
}

#[cfg(unix)]
async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let Ok(mut terminate) = signal(SignalKind::terminate()) else {
        let _ = tokio::signal::ctrl_c().await;
        return "interrupt";
    };
    tokio::select! {
        _ = terminate.recv() => "terminate",
        _ = tokio::signal::ctrl_c() => "interrupt",
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "interrupt"
}
