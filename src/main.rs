use crate::controller::{Controller, Settings};
use crate::crd::{Image, ImageScan};
use crate::dispatcher::Dispatcher;
use crate::leader::LeaderElector;
use crate::reconciler::{ImageScanService, image_event_handler};
use crate::registry_auth::KubeAuthResolver;
use crate::scanner::Trivy;
use crate::store::KubeScanStore;
use crate::webserver::Readiness;
use crate::workqueue::ItemExponentialBackoff;
use kube::runtime::{WatchStreamExt, reflector, watcher};
use kube::{Api, CustomResourceExt};
use tokio::signal::unix::{SignalKind, signal};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod config;
mod controller;
mod crd;
mod dispatcher;
mod image_reference;
mod leader;
mod reconciler;
mod registry_auth;
mod scanner;
mod secret_string;
mod store;
mod webserver;
mod workqueue;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    if std::env::args().nth(1).as_deref() == Some("print-crds") {
        return print_crds();
    }
    info!("Starting imgscanner {}", env!("CARGO_PKG_VERSION"));

    let config = config::load_from_env()?;
    let client = controller::create_client().await?;

    let shutdown = CancellationToken::new();
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
                _ = terminate.recv() => info!("Received SIGTERM, shutting down"),
            }
            shutdown.cancel();
        }
    });

    let readiness = Readiness::default();
    let app = webserver::create_app(readiness.clone());
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.webserver.port));
    info!("Starting webserver on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let server = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = server.await {
                error!("Webserver failed: {}", e);
            }
        }
    });

    let (images, image_writer) = reflector::store::<Image>();
    let (scans, scan_writer) = reflector::store::<ImageScan>();
    let image_events =
        watcher::watcher(Api::<Image>::all(client.clone()), watcher::Config::default())
            .default_backoff()
            .reflect(image_writer);
    let scan_events =
        watcher::watcher(Api::<ImageScan>::all(client.clone()), watcher::Config::default())
            .default_backoff()
            .reflect(scan_writer);

    let settings = Settings {
        workers: config.workers,
        sync_timeout: config.sync_timeout(),
        backoff: ItemExponentialBackoff::default(),
    };
    let dispatcher = Dispatcher::new(
        KubeScanStore::new(client.clone()),
        scans.clone(),
        Trivy::new(&config.scanner),
        KubeAuthResolver::new(client.clone(), &config.registries)?,
        config.max_scan_attempts,
    );
    let image_controller = Controller::new("image", images.clone(), dispatcher, settings);
    let scan_controller = Controller::new(
        "imagescan",
        scans.clone(),
        ImageScanService::new(KubeScanStore::new(client.clone()), images.clone()),
        settings,
    );
    let image_handle = image_controller.handle();
    let scan_handle = scan_controller.handle();

    let on_image_event = image_event_handler(image_handle.clone(), scan_handle.clone());
    let on_scan_event = {
        let scan_handle = scan_handle.clone();
        move |event: &watcher::Event<ImageScan>| scan_handle.enqueue_event(event)
    };
    tokio::spawn(controller::pump_events(
        "image",
        image_events,
        shutdown.clone(),
        on_image_event,
    ));
    tokio::spawn(controller::pump_events(
        "imagescan",
        scan_events,
        shutdown.clone(),
        on_scan_event,
    ));

    info!("Waiting for caches to sync");
    tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        synced = async { tokio::try_join!(images.wait_until_ready(), scans.wait_until_ready()) } => {
            synced?;
        }
    }
    info!("Caches synced");
    readiness.set(true);

    info!("Resyncing at cron schedule {}", config.resync_schedule);
    let mut scheduler = JobScheduler::new().await?;
    let resync_images = image_handle.clone();
    let resync_scans = scan_handle.clone();
    let job = Job::new_async(config.resync_schedule.clone(), move |_uuid, _l| {
        let image_handle = resync_images.clone();
        let scan_handle = resync_scans.clone();
        Box::pin(async move {
            image_handle.resync();
            scan_handle.resync();
        })
    })?;
    scheduler.add(job).await?;
    scheduler.start().await?;

    let elector = LeaderElector::new(client.clone(), &config.leader_election);
    let acquired = match elector.acquire(&shutdown).await {
        Ok(acquired) => acquired,
        Err(e) => {
            error!("Leader election failed: {:#}", e);
            return Err(e);
        }
    };
    if !acquired {
        info!("Shut down before acquiring leadership");
        return Ok(());
    }
    info!("Leading as {}", elector.identity());

    let leading = shutdown.child_token();
    let (held, (), ()) = tokio::join!(
        elector.hold(leading.clone()),
        image_controller.run(leading.clone()),
        scan_controller.run(leading.clone()),
    );

    if let Err(e) = scheduler.shutdown().await {
        error!("Error stopping job scheduler: {}", e);
    }
    if held.is_ok() {
        if let Err(e) = elector.release().await {
            error!("Error releasing leadership: {:#}", e);
        }
    }
    held?;

    info!("Shutdown complete");
    Ok(())
}

fn print_crds() -> anyhow::Result<()> {
    for crd in [Image::crd(), ImageScan::crd()] {
        print!("---\n{}", serde_yaml_ng::to_string(&crd)?);
    }
    Ok(())
}
