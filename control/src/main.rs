use anyhow::Result;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::networking::v1::Ingress;
use kube::Api;
use nodeingress::apis::ingress::{handle_ingress_update, IngressClient, KubeIngressClient};
use nodeingress::apis::metrics::metrics_response;
use nodeingress::apis::pods::handle_pod_update;
use nodeingress::apis::watch::WatchStream;
use nodeingress::config::ControllerConfig;
use nodeingress::discovery::{self, Discovery};
use nodeingress::routes::registry::{PrefixIndex, TargetRegistry};
use nodeingress::telemetry::{self, LogFormat};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

/// nodeingress controller
///
/// Watches Pods and Ingresses cluster-wide, keeps one path per node in every
/// managed Ingress, and serves the node lists on the discovery port.
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize rustls crypto provider (needed for Kubernetes TLS client)
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok(); // Ignore error if already installed

    telemetry::init(LogFormat::from_env())
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    // Nothing starts unless the whole configuration is valid
    let config = ControllerConfig::from_env()?;
    config.validate()?;

    let registry = Arc::new(TargetRegistry::from_config(&config));
    let index = Arc::new(PrefixIndex::build(&registry)?);
    info!(
        targets = registry.len(),
        base_paths = index.len(),
        "Configuration loaded"
    );
    if registry.is_empty() {
        warn!("No targets configured, nothing will be routed");
    } else if index.is_empty() {
        warn!("No route sets configured, discovery will list no base paths");
    }

    let client = kube::Client::try_default().await?;
    let ingress_client: Arc<dyn IngressClient> = Arc::new(KubeIngressClient::new(client.clone()));

    let mut handles = vec![];

    for target in registry.iter() {
        handles.push(tokio::spawn(
            target.clone().run_sync_loop(ingress_client.clone()),
        ));
    }

    let ingress_registry = registry.clone();
    let ingresses = WatchStream::new(Api::<Ingress>::all(client.clone()), "Ingress");
    handles.push(tokio::spawn(ingresses.run(move |update| {
        handle_ingress_update(&ingress_registry, update)
    })));

    let pod_registry = registry.clone();
    let pods = WatchStream::new(Api::<Pod>::all(client), "Pod");
    handles.push(tokio::spawn(pods.run(move |update| {
        handle_pod_update(&pod_registry, update)
    })));

    if let Some(port) = config.metrics_port {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await?;
        handles.push(tokio::spawn(discovery::serve(listener, "metrics", |req| {
            metrics_response(req.method(), req.uri().path())
        })));
    }

    let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.http_port));
    let listener = TcpListener::bind(bind_addr).await?;
    info!(
        port = config.http_port,
        self_service = config.self_service_name.as_deref().unwrap_or("-"),
        "Serving discovery"
    );
    let discovery = Discovery::new(registry.clone(), index.clone());
    let server = discovery::serve(listener, "discovery", move |req| discovery.handle(req));

    tokio::select! {
        _ = server => {
            error!("Discovery listener stopped");
        }
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    for handle in handles {
        handle.abort();
    }

    Ok(())
}
