//! VPN startup orchestration.
//!
//! Ties the pieces together: write the proxy configuration, make sure the
//! Xray binary exists, launch it, wait for the SOCKS inbound to answer and
//! publish the proxy address. Expected failures turn into
//! [`VpnStatus::Unavailable`]; only configuration persistence errors escape.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::descriptor::ConnectionDescriptor;
use crate::error::{Result, ServiceError};
use crate::layout::Layout;
use crate::provision::BinaryProvisioner;
use crate::proxy_env::{ProxyEndpoint, ProxyEnvironment, ProxyScheme};
use crate::readiness::ReadinessProbe;
use crate::supervisor::{ProcessSupervisor, SupervisorConfig};
use crate::xray_config::{ConfigGenerator, LOCAL_LISTEN_HOST, LOCAL_LISTEN_PORT};

/// Outcome of a VPN startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VpnStatus {
    /// Proxy is accepting connections and published.
    Ready { pid: Option<u32>, proxy_url: String },
    /// Startup failed; the application runs without the proxy.
    Unavailable { reason: String },
    /// Startup had not finished when the caller stopped waiting.
    Pending,
    /// VPN was turned off by the user.
    Disabled,
}

impl VpnStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, VpnStatus::Ready { .. })
    }
}

/// Owner of the VPN lifecycle.
pub struct VpnService {
    generator: ConfigGenerator,
    provisioner: BinaryProvisioner,
    supervisor: Arc<ProcessSupervisor>,
    probe: ReadinessProbe,
    environment: ProxyEnvironment,
}

impl VpnService {
    pub fn new(
        generator: ConfigGenerator,
        provisioner: BinaryProvisioner,
        supervisor: Arc<ProcessSupervisor>,
        probe: ReadinessProbe,
        environment: ProxyEnvironment,
    ) -> Self {
        Self {
            generator,
            provisioner,
            supervisor,
            probe,
            environment,
        }
    }

    /// Service wired to the paths of `layout` and the standard proxy variables.
    pub fn for_layout(layout: &Layout, config: SupervisorConfig) -> Self {
        let local = SocketAddr::from((Ipv4Addr::LOCALHOST, LOCAL_LISTEN_PORT));
        Self::new(
            ConfigGenerator::new(layout.proxy_config_path()),
            BinaryProvisioner::new(layout.binary_dirs()),
            Arc::new(ProcessSupervisor::new(config)),
            ReadinessProbe::new(local),
            ProxyEnvironment::default(),
        )
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    /// Brings the VPN up for `descriptor` and publishes the proxy address.
    pub async fn start(&self, descriptor: &ConnectionDescriptor) -> Result<VpnStatus> {
        let status = self.launch(descriptor).await?;
        self.publish(&status);
        Ok(status)
    }

    /// Everything [`start`](Self::start) does except publishing.
    async fn launch(&self, descriptor: &ConnectionDescriptor) -> Result<VpnStatus> {
        tracing::info!(
            "Starting VPN to {}:{} (sni {}, pbk {})",
            descriptor.address,
            descriptor.port,
            descriptor.server_name,
            descriptor.redacted_public_key()
        );

        let proxy_config = self.generator.generate(descriptor)?;

        let binary = match self.provisioner.ensure().await {
            Ok(path) => path,
            Err(e) => {
                return Ok(self.unavailable(format!("Xray binary not available: {}", e)));
            }
        };

        let info = match self.supervisor.start(self.generator.path(), &binary).await {
            Ok(info) => info,
            Err(e) => return Ok(self.unavailable(e.to_string())),
        };

        if !self.probe.wait_ready().await {
            self.supervisor.stop().await;
            return Ok(self.unavailable(format!(
                "SOCKS inbound {} did not become ready",
                self.probe.addr()
            )));
        }

        let endpoint = ProxyEndpoint::new(
            ProxyScheme::Socks5,
            LOCAL_LISTEN_HOST,
            proxy_config.local_port(),
        );
        tracing::info!("VPN ready via {}", endpoint.url());
        Ok(VpnStatus::Ready {
            pid: info.pid,
            proxy_url: endpoint.url(),
        })
    }

    /// Sets the proxy variables for a ready status.
    ///
    /// Environment writes are not synchronized with reads on other threads,
    /// so this runs once, on the task driving startup, before anything that
    /// reads the proxy variables is started.
    fn publish(&self, status: &VpnStatus) {
        if let VpnStatus::Ready { proxy_url, .. } = status {
            self.environment.publish_url(proxy_url);
        }
    }

    fn unavailable(&self, reason: String) -> VpnStatus {
        tracing::error!("VPN unavailable, continuing without proxy: {}", reason);
        VpnStatus::Unavailable { reason }
    }

    /// Runs the startup sequence on a background task and reports its
    /// outcome through the returned channel.
    ///
    /// Nothing is published from the background task; pass the receiver to
    /// [`await_startup`](Self::await_startup) for that.
    pub fn spawn(self: Arc<Self>, descriptor: ConnectionDescriptor) -> oneshot::Receiver<Result<VpnStatus>> {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let outcome = self.launch(&descriptor).await;
            if let Err(Ok(VpnStatus::Ready { proxy_url, .. })) = tx.send(outcome) {
                tracing::warn!("VPN became ready at {} after startup stopped waiting, not published", proxy_url);
            }
        });
        rx
    }

    /// Waits up to `timeout` for a result from [`spawn`](Self::spawn) and
    /// publishes the proxy address when it is ready.
    ///
    /// Gives [`VpnStatus::Pending`] when the wait elapses first.
    pub async fn await_startup(
        &self,
        rx: oneshot::Receiver<Result<VpnStatus>>,
        timeout: Duration,
    ) -> Result<VpnStatus> {
        let status = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome?,
            Ok(Err(_)) => return Err(ServiceError::TaskLost),
            Err(_) => {
                tracing::warn!("VPN not ready after {:?}, continuing", timeout);
                return Ok(VpnStatus::Pending);
            }
        };
        self.publish(&status);
        Ok(status)
    }

    /// Stops the proxy and withdraws the published address. Safe to repeat.
    pub async fn shutdown(&self) {
        self.supervisor.stop().await;
        self.environment.clear();
    }

    pub async fn is_running(&self) -> bool {
        self.supervisor.is_alive().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn test_supervisor() -> Arc<ProcessSupervisor> {
        Arc::new(ProcessSupervisor::new(SupervisorConfig {
            max_attempts: 2,
            backoff_step: Duration::from_millis(10),
            startup_grace: Duration::from_millis(200),
            stop_timeout: Duration::from_millis(500),
        }))
    }

    fn closed_addr() -> SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    fn service(root: &Path, probe_addr: SocketAddr, env: ProxyEnvironment) -> VpnService {
        VpnService::new(
            ConfigGenerator::new(root.join("config.json")),
            BinaryProvisioner::new(vec![root.join("bin")])
                .with_binary_name("xray")
                .with_download_url(Some(format!("http://{}/Xray.zip", closed_addr())))
                .with_timeouts(Duration::from_secs(1), Duration::from_secs(2)),
            test_supervisor(),
            ReadinessProbe::new(probe_addr).with_retries(3, Duration::from_millis(50)),
            env,
        )
    }

    #[cfg(unix)]
    fn install_fake_xray(root: &Path) {
        use std::os::unix::fs::PermissionsExt;

        let bin = root.join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let path = bin.join("xray");
        std::fs::write(&path, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    async fn fake_socks() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut greeting = [0u8; 3];
                let _ = socket.read_exact(&mut greeting).await;
                let _ = socket.write_all(&[0x05, 0x00]).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn missing_binary_degrades_to_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let env = ProxyEnvironment::with_vars("CORRIDOR_SVC_HTTP_A", "CORRIDOR_SVC_HTTPS_A");
        let svc = service(dir.path(), closed_addr(), env.clone());

        let status = svc.start(&ConnectionDescriptor::default()).await.unwrap();
        assert!(matches!(status, VpnStatus::Unavailable { .. }));
        assert!(dir.path().join("config.json").exists());
        assert_eq!(env.current(), (None, None));
        assert!(!svc.is_running().await);
    }

    #[tokio::test]
    async fn config_write_failure_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"file, not a directory").unwrap();
        let env = ProxyEnvironment::with_vars("CORRIDOR_SVC_HTTP_B", "CORRIDOR_SVC_HTTPS_B");
        let svc = service(&blocker, closed_addr(), env);

        let err = svc.start(&ConnectionDescriptor::default()).await.unwrap_err();
        assert!(matches!(err, ServiceError::Config(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn ready_publishes_and_shutdown_clears() {
        let dir = tempfile::tempdir().unwrap();
        install_fake_xray(dir.path());
        let env = ProxyEnvironment::with_vars("CORRIDOR_SVC_HTTP_C", "CORRIDOR_SVC_HTTPS_C");
        let svc = service(dir.path(), fake_socks().await, env.clone());

        let status = svc.start(&ConnectionDescriptor::default()).await.unwrap();
        match &status {
            VpnStatus::Ready { pid, proxy_url } => {
                assert!(pid.is_some());
                assert_eq!(proxy_url, "socks5://127.0.0.1:1080");
            }
            other => panic!("expected ready, got {other:?}"),
        }
        let url = Some("socks5://127.0.0.1:1080".to_string());
        assert_eq!(env.current(), (url.clone(), url));
        assert!(svc.is_running().await);

        svc.shutdown().await;
        assert!(!svc.is_running().await);
        assert_eq!(env.current(), (None, None));
        svc.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_readiness_stops_process() {
        let dir = tempfile::tempdir().unwrap();
        install_fake_xray(dir.path());
        let env = ProxyEnvironment::with_vars("CORRIDOR_SVC_HTTP_D", "CORRIDOR_SVC_HTTPS_D");
        let svc = service(dir.path(), closed_addr(), env.clone());

        let status = svc.start(&ConnectionDescriptor::default()).await.unwrap();
        assert!(matches!(status, VpnStatus::Unavailable { .. }));
        assert!(!svc.is_running().await);
        assert_eq!(env.current(), (None, None));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_publishes_only_on_awaiting_task() {
        let dir = tempfile::tempdir().unwrap();
        install_fake_xray(dir.path());
        let env = ProxyEnvironment::with_vars("CORRIDOR_SVC_HTTP_E", "CORRIDOR_SVC_HTTPS_E");
        let svc = Arc::new(service(dir.path(), fake_socks().await, env.clone()));

        let mut rx = Arc::clone(&svc).spawn(ConnectionDescriptor::default());
        let outcome = loop {
            match rx.try_recv() {
                Ok(outcome) => break outcome,
                Err(oneshot::error::TryRecvError::Empty) => {
                    tokio::time::sleep(Duration::from_millis(20)).await
                }
                Err(e) => panic!("startup task lost: {e}"),
            }
        };
        assert!(outcome.unwrap().is_ready());
        assert_eq!(env.current(), (None, None));

        let (tx, rx) = oneshot::channel();
        tx.send(Ok(VpnStatus::Ready {
            pid: None,
            proxy_url: "socks5://127.0.0.1:1080".to_string(),
        }))
        .unwrap();
        let status = svc.await_startup(rx, Duration::from_secs(1)).await.unwrap();
        assert!(status.is_ready());
        let url = Some("socks5://127.0.0.1:1080".to_string());
        assert_eq!(env.current(), (url.clone(), url));

        svc.shutdown().await;
        assert_eq!(env.current(), (None, None));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_reports_readiness() {
        let dir = tempfile::tempdir().unwrap();
        install_fake_xray(dir.path());
        let env = ProxyEnvironment::with_vars("CORRIDOR_SVC_HTTP_F", "CORRIDOR_SVC_HTTPS_F");
        let svc = Arc::new(service(dir.path(), fake_socks().await, env.clone()));

        let rx = Arc::clone(&svc).spawn(ConnectionDescriptor::default());
        let status = svc.await_startup(rx, Duration::from_secs(10)).await.unwrap();
        assert!(status.is_ready());
        assert!(env.current().0.is_some());

        svc.shutdown().await;
    }

    #[tokio::test]
    async fn await_startup_times_out_as_pending() {
        let dir = tempfile::tempdir().unwrap();
        let env = ProxyEnvironment::with_vars("CORRIDOR_SVC_HTTP_G", "CORRIDOR_SVC_HTTPS_G");
        let svc = service(dir.path(), closed_addr(), env.clone());

        let (_tx, rx) = oneshot::channel::<Result<VpnStatus>>();
        let status = svc.await_startup(rx, Duration::from_millis(20)).await.unwrap();
        assert_eq!(status, VpnStatus::Pending);
        assert_eq!(env.current(), (None, None));
    }

    #[tokio::test]
    async fn await_startup_reports_lost_task() {
        let dir = tempfile::tempdir().unwrap();
        let env = ProxyEnvironment::with_vars("CORRIDOR_SVC_HTTP_H", "CORRIDOR_SVC_HTTPS_H");
        let svc = service(dir.path(), closed_addr(), env);

        let (tx, rx) = oneshot::channel::<Result<VpnStatus>>();
        drop(tx);
        let err = svc.await_startup(rx, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ServiceError::TaskLost));
    }
}
