use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use metricbus::{
    config::{Config, read_config_file},
    router::{Router, RouterOptions, table::RouteSpec},
    scheduler::SchedulerHandle,
    transport::SocketRef,
    transport::channel::{channel_pair, control_channel},
};
use tracing::{debug, info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: Option<String>,
}

fn init() {
    dotenv::dotenv().ok();

    let filter = filter::Targets::new().with_targets(vec![
        ("metricbus", LevelFilter::TRACE),
        ("hub", LevelFilter::TRACE),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let path = args
        .file
        .or_else(metricbus::util::get_config_path)
        .ok_or_else(|| anyhow::anyhow!("no config file given (use -f or HUB_CONFIG)"))?;

    let config = read_config_file(&path)?;

    run_hub(config).await
}

async fn run_hub(config: Config) -> anyhow::Result<()> {
    let mut near_ends: HashMap<String, SocketRef> = HashMap::new();
    let mut far_ends: HashMap<String, SocketRef> = HashMap::new();

    for socket in &config.sockets {
        let (near, far) = channel_pair(&socket.name, socket.capacity);
        near_ends.insert(socket.name.clone(), Arc::new(near));
        far_ends.insert(socket.name.clone(), Arc::new(far));
    }

    let resolve = |name: &str| -> anyhow::Result<SocketRef> {
        near_ends
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("config references unknown socket {name}"))
    };

    let error_socket = config
        .router
        .error_socket
        .as_deref()
        .map(&resolve)
        .transpose()?;

    let mut router = Router::new(
        "hub",
        RouterOptions {
            error_socket,
            poll_timeout: Duration::from_millis(config.router.poll_timeout_ms),
        },
    );

    for socket in near_ends.values() {
        router.register_socket(socket.clone());
    }

    for route in &config.routes {
        let spec = RouteSpec {
            to: route.to.clone(),
            from: route.from.clone(),
            src: resolve(&route.src)?,
            dest: resolve(&route.dest)?,
            static_route: route.static_route,
        };
        router.route(spec)?;
    }

    let (_control_client, control_server) = control_channel(config.router.control_capacity);
    router.control(Box::new(control_server));

    debug!(
        "hub wired: {} sockets, {} routes",
        near_ends.len(),
        config.routes.len()
    );

    // The scheduler talks to the router like any external feeder would:
    // through the peer end of its feed socket.
    let dispatch_target = far_ends
        .get(&config.scheduler.dispatch_socket)
        .cloned()
        .ok_or_else(|| {
            anyhow::anyhow!(
                "scheduler dispatch socket {} is not configured",
                config.scheduler.dispatch_socket
            )
        })?;

    let scheduler = SchedulerHandle::spawn(dispatch_target, config.scheduler.scheduler_config());

    let shutdown = router.shutdown_handle();
    let router_task = tokio::spawn(router.run());

    info!("hub running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    debug!("ctrl-c received, shutting down");
    scheduler.stop();
    shutdown.shutdown();

    let stats = router_task.await?;
    info!(
        "clean shutdown: {} received, {} forwarded, {} unroutable",
        stats.received, stats.forwarded, stats.unroutable
    );

    Ok(())
}
