//! Host process (§6.3): parses CLI flags, loads configuration, installs the
//! tracing subscriber, wires every substrate component together, enters the
//! receive loop on a background thread, and waits for `SIGINT`/`SIGTERM` to
//! shut down in an orderly way.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use das_ipc::config::HostConfig;
use das_ipc::connection::ConnectionManager;
use das_ipc::object_manager::ObjectManager;
use das_ipc::plugin::{Feature, PluginLoader, PluginRuntime};
use das_ipc::proxy::ProxyStubFactory;
use das_ipc::registry::{compute_interface_id, RemoteObjectRegistry};
use das_ipc::run_loop::RunLoop;
use das_ipc::session::SessionCoordinator;
use das_ipc::shm::{make_pool_name, SharedMemoryPool};
use das_ipc::transport::{make_queue_name, Direction, FramedTransport};
use das_ipc::error::{IpcError, Result};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "\
Usage: das-ipc-host [OPTIONS]

Options:
  --verbose              Enable informational logging of handshakes and frame traffic
  --config=<path>        Optional TOML config file (missing/unreadable is not fatal)
  --peer-pid=<pid>       Peer process id for transport naming (default: this process's own pid)
  --load-test-plugin     Load the in-workspace TASK test fixture plugin at startup
  --help                 Print this message and exit";

struct NotImplementedRuntime;

impl PluginRuntime for NotImplementedRuntime {
    fn load_plugin(&self, _path: &str) -> Result<Arc<dyn das_ipc::plugin::PluginPackage>> {
        Err(IpcError::NoImplementation)
    }
}

fn parse_peer_pid(args: &[String]) -> Option<u32> {
    args.iter()
        .find_map(|arg| arg.strip_prefix("--peer-pid="))
        .and_then(|v| v.parse().ok())
}

fn parse_config_path(args: &[String]) -> Option<PathBuf> {
    args.iter()
        .find_map(|arg| arg.strip_prefix("--config="))
        .map(PathBuf::from)
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.iter().any(|a| a == "--help") {
        println!("{USAGE}");
        std::process::exit(0);
    }

    let config_path = parse_config_path(&args);
    let config = match HostConfig::load(config_path.as_deref(), &args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("fatal: failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    install_tracing(config.verbose);

    if let Err(e) = run(config, &args) {
        tracing::error!(error = %e, "fatal initialization failure");
        std::process::exit(1);
    }
}

fn install_tracing(verbose: bool) {
    let default_directive = if verbose { "das_ipc=debug,das_ipc_host=debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run(config: HostConfig, args: &[String]) -> Result<()> {
    let host_pid = std::process::id();
    let peer_pid = parse_peer_pid(args).unwrap_or(host_pid);

    tracing::info!(host_pid, peer_pid, "das-ipc-host starting");

    let sessions = Arc::new(SessionCoordinator::new());
    sessions.set_local(das_ipc::session::SESSION_HOST)?;
    let object_manager = Arc::new(ObjectManager::new(das_ipc::session::SESSION_HOST));
    let registry = Arc::new(RemoteObjectRegistry::new());

    let shm_pool = Arc::new(SharedMemoryPool::initialize(
        &make_pool_name(&config.shm_prefix, host_pid, "0"),
        config.shm_pool_size,
    )?);

    let transport = build_transport(&config, host_pid, peer_pid, Arc::clone(&shm_pool))?;
    let run_loop = RunLoop::new(Arc::new(transport));

    let connection_manager = ConnectionManager::new(Arc::clone(&sessions), Arc::clone(&registry));

    let proxy_factory = Arc::new(ProxyStubFactory::new());
    proxy_factory.initialize(Arc::clone(&object_manager), Arc::clone(&registry), Arc::clone(&run_loop));
    run_loop.set_request_handler(proxy_factory.clone());

    let runtime: Arc<dyn PluginRuntime> = if args.iter().any(|a| a == "--load-test-plugin") {
        Arc::new(das_ipc_testplugin::DirectRuntime)
    } else {
        Arc::new(NotImplementedRuntime)
    };
    let plugin_loader = PluginLoader::new(
        das_ipc::session::SESSION_HOST,
        Arc::clone(&object_manager),
        Arc::clone(&registry),
        runtime,
    );

    if args.iter().any(|a| a == "--load-test-plugin") {
        load_test_plugin(&plugin_loader, &proxy_factory)?;
    }

    run_loop.run();
    connection_manager.start_heartbeat_thread();

    let test_session_id = sessions.allocate()?;
    tracing::info!(session_id = test_session_id, "published test session id");

    wait_for_shutdown_signal();
    tracing::info!("shutdown requested, stopping");

    connection_manager.stop_heartbeat_thread();
    run_loop.stop();
    sessions.release(test_session_id);

    tracing::info!("shutdown complete");
    Ok(())
}

/// Register the test fixture's `IDasTask` dispatcher and publish its
/// feature object, so `--load-test-plugin` is immediately callable by a
/// peer without any further setup.
fn load_test_plugin(plugin_loader: &PluginLoader, proxy_factory: &ProxyStubFactory<AnyTransport>) -> Result<()> {
    proxy_factory.register_dispatcher(
        compute_interface_id(Feature::Task.interface_iid()),
        Arc::new(das_ipc_testplugin::EchoTaskDispatch),
    )?;
    plugin_loader.load_plugin("testplugin")?;
    let registered = plugin_loader.register_plugin_objects("testplugin")?;
    tracing::info!(registered, "test fixture plugin loaded");
    Ok(())
}

#[cfg(unix)]
type AnyTransport = FramedTransport<das_ipc::transport::mq::PosixMqQueue>;
#[cfg(not(unix))]
type AnyTransport = FramedTransport<das_ipc::transport::loopback::LoopbackQueue>;

#[cfg(unix)]
fn build_transport(
    config: &HostConfig,
    host_pid: u32,
    peer_pid: u32,
    shm_pool: Arc<SharedMemoryPool>,
) -> Result<AnyTransport> {
    let send_name = make_queue_name(&config.queue_prefix, host_pid, peer_pid, Direction::HostToPeer);
    let recv_name = make_queue_name(&config.queue_prefix, host_pid, peer_pid, Direction::PeerToHost);
    let queue = das_ipc::transport::mq::PosixMqQueue::open(
        &send_name,
        &recv_name,
        config.max_messages as i64,
        config.max_message_size,
    )?;
    Ok(FramedTransport::new(queue, Some(shm_pool), config.max_message_size))
}

#[cfg(not(unix))]
fn build_transport(
    config: &HostConfig,
    _host_pid: u32,
    _peer_pid: u32,
    shm_pool: Arc<SharedMemoryPool>,
) -> Result<AnyTransport> {
    // POSIX message queues are Unix-only (§4.D); elsewhere this process can
    // still stand up its half of the substrate against an in-process queue,
    // though nothing outside this binary can attach to it.
    let (host_side, _peer_side) = das_ipc::transport::loopback::pair(config.max_message_size, Some(shm_pool));
    Ok(host_side)
}

#[cfg(unix)]
fn wait_for_shutdown_signal() {
    use std::sync::atomic::{AtomicBool, Ordering};
    use nix::sys::signal::{self, SigHandler, Signal};

    static SHUTDOWN: AtomicBool = AtomicBool::new(false);

    extern "C" fn handle(_signum: i32) {
        SHUTDOWN.store(true, Ordering::SeqCst);
    }

    // SAFETY: `handle` only stores to an atomic, which is async-signal-safe.
    unsafe {
        let _ = signal::signal(Signal::SIGINT, SigHandler::Handler(handle));
        let _ = signal::signal(Signal::SIGTERM, SigHandler::Handler(handle));
    }

    while !SHUTDOWN.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }
}

#[cfg(not(unix))]
fn wait_for_shutdown_signal() {
    // No portable signal story outside Unix for this workspace; block
    // indefinitely so the process is only stopped by an external kill.
    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}
