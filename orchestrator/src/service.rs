//! Supervised services

use crate::OrchestratorError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Service status
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed(String),
}

/// Anything the supervisor starts and stops
#[async_trait]
pub trait Service: Send + Sync {
    /// Service name
    fn name(&self) -> &str;

    /// Start the service
    async fn start(&mut self) -> Result<(), OrchestratorError>;

    /// Stop the service gracefully
    async fn stop(&mut self) -> Result<(), OrchestratorError>;

    /// Get current status
    fn status(&self) -> ServiceStatus;

    /// Health check
    async fn health_check(&self) -> bool;
}

type Spawner = Box<dyn Fn(watch::Receiver<bool>) -> Vec<JoinHandle<()>> + Send + Sync>;

struct Running {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// A group of periodic loops sharing one shutdown signal
pub struct LoopService {
    name: String,
    spawner: Spawner,
    running: Option<Running>,
    status: ServiceStatus,
    stop_timeout: Duration,
}

impl LoopService {
    /// `spawner` is called on every start with a fresh shutdown receiver
    pub fn new<F>(name: &str, spawner: F) -> Self
    where
        F: Fn(watch::Receiver<bool>) -> Vec<JoinHandle<()>> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            spawner: Box::new(spawner),
            running: None,
            status: ServiceStatus::Stopped,
            stop_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Number of loops currently spawned
    pub fn loop_count(&self) -> usize {
        self.running.as_ref().map_or(0, |r| r.handles.len())
    }
}

#[async_trait]
impl Service for LoopService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self) -> Result<(), OrchestratorError> {
        if self.running.is_some() {
            return Ok(());
        }
        self.status = ServiceStatus::Starting;
        let (tx, rx) = watch::channel(false);
        let handles = (self.spawner)(rx);
        info!(service = %self.name, loops = handles.len(), "SUPERVISOR: Service started");
        self.running = Some(Running {
            shutdown: tx,
            handles,
        });
        self.status = ServiceStatus::Running;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), OrchestratorError> {
        let Some(running) = self.running.take() else {
            self.status = ServiceStatus::Stopped;
            return Ok(());
        };
        self.status = ServiceStatus::Stopping;
        let _ = running.shutdown.send(true);

        let mut stuck = 0;
        for mut handle in running.handles {
            if tokio::time::timeout(self.stop_timeout, &mut handle)
                .await
                .is_err()
            {
                handle.abort();
                stuck += 1;
            }
        }

        if stuck > 0 {
            let message = format!("{} loop(s) aborted after {:?}", stuck, self.stop_timeout);
            warn!(service = %self.name, "SUPERVISOR: {}", message);
            self.status = ServiceStatus::Failed(message.clone());
            return Err(OrchestratorError::Service {
                name: self.name.clone(),
                message,
            });
        }
        self.status = ServiceStatus::Stopped;
        Ok(())
    }

    fn status(&self) -> ServiceStatus {
        self.status.clone()
    }

    async fn health_check(&self) -> bool {
        match &self.running {
            Some(running) => running.handles.iter().all(|h| !h.is_finished()),
            None => false,
        }
    }
}

/// Point-in-time view of one service
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceHealth {
    pub name: String,
    pub status: ServiceStatus,
    pub healthy: bool,
}

/// Starts services in registration order and stops them in reverse
pub struct Supervisor {
    services: Vec<Box<dyn Service>>,
    status: ServiceStatus,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            status: ServiceStatus::Stopped,
        }
    }

    /// Register a service
    pub fn register(&mut self, service: Box<dyn Service>) {
        info!("SUPERVISOR: Registering service '{}'", service.name());
        self.services.push(service);
    }

    pub fn names(&self) -> Vec<String> {
        self.services.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn status(&self) -> ServiceStatus {
        self.status.clone()
    }

    /// Start every service. If one fails, the ones already started are
    /// stopped again.
    pub async fn start_all(&mut self) -> Result<(), OrchestratorError> {
        info!("SUPERVISOR: Starting {} service(s)", self.services.len());
        self.status = ServiceStatus::Starting;

        for index in 0..self.services.len() {
            if let Err(e) = self.services[index].start().await {
                error!(
                    service = %self.services[index].name(),
                    "SUPERVISOR: Start failed: {}", e
                );
                for started in self.services[..index].iter_mut().rev() {
                    let _ = started.stop().await;
                }
                self.status = ServiceStatus::Failed(e.to_string());
                return Err(e);
            }
        }

        self.status = ServiceStatus::Running;
        Ok(())
    }

    /// Stop every service, continuing past failures. Returns the errors.
    pub async fn stop_all(&mut self) -> Vec<OrchestratorError> {
        info!("SUPERVISOR: Stopping all services...");
        self.status = ServiceStatus::Stopping;

        let mut errors = Vec::new();
        for service in self.services.iter_mut().rev() {
            if let Err(e) = service.stop().await {
                errors.push(e);
            }
        }

        self.status = if errors.is_empty() {
            ServiceStatus::Stopped
        } else {
            ServiceStatus::Failed(format!("{} service(s) did not stop cleanly", errors.len()))
        };
        errors
    }

    pub async fn stop(&mut self, name: &str) -> Result<(), OrchestratorError> {
        let service = self
            .services
            .iter_mut()
            .find(|s| s.name() == name)
            .ok_or_else(|| OrchestratorError::ServiceNotFound(name.to_string()))?;
        service.stop().await
    }

    pub async fn health(&self) -> Vec<ServiceHealth> {
        let mut report = Vec::with_capacity(self.services.len());
        for service in &self.services {
            report.push(ServiceHealth {
                name: service.name().to_string(),
                status: service.status(),
                healthy: service.health_check().await,
            });
        }
        report
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn ticking(counter: Arc<AtomicUsize>) -> LoopService {
        LoopService::new("ticker", move |mut shutdown| {
            let counter = counter.clone();
            vec![tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(5)) => {
                            counter.fetch_add(1, Ordering::SeqCst);
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            })]
        })
    }

    struct Broken;

    #[async_trait]
    impl Service for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn start(&mut self) -> Result<(), OrchestratorError> {
            Err(OrchestratorError::Service {
                name: "broken".into(),
                message: "refused".into(),
            })
        }

        async fn stop(&mut self) -> Result<(), OrchestratorError> {
            Ok(())
        }

        fn status(&self) -> ServiceStatus {
            ServiceStatus::Failed("refused".into())
        }

        async fn health_check(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_loop_service_lifecycle() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut service = ticking(counter.clone());
        assert!(!service.health_check().await);

        service.start().await.unwrap();
        assert_eq!(service.status(), ServiceStatus::Running);
        assert_eq!(service.loop_count(), 1);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(service.health_check().await);

        service.stop().await.unwrap();
        assert_eq!(service.status(), ServiceStatus::Stopped);
        let ticks = counter.load(Ordering::SeqCst);
        assert!(ticks > 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), ticks);
    }

    #[tokio::test]
    async fn test_loop_ignoring_shutdown_is_aborted() {
        let mut service = LoopService::new("stubborn", |_shutdown| {
            vec![tokio::spawn(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            })]
        })
        .with_stop_timeout(Duration::from_millis(20));

        service.start().await.unwrap();
        let err = service.stop().await.unwrap_err();
        assert!(err.to_string().contains("aborted"));
        assert!(matches!(service.status(), ServiceStatus::Failed(_)));
    }

    #[tokio::test]
    async fn test_failed_start_rolls_back_started_services() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut supervisor = Supervisor::new();
        supervisor.register(Box::new(ticking(counter)));
        supervisor.register(Box::new(Broken));

        assert!(supervisor.start_all().await.is_err());
        assert!(matches!(supervisor.status(), ServiceStatus::Failed(_)));

        let health = supervisor.health().await;
        assert_eq!(health[0].status, ServiceStatus::Stopped);
        assert!(!health[0].healthy);
    }

    #[tokio::test]
    async fn test_stop_unknown_service() {
        let mut supervisor = Supervisor::new();
        assert!(matches!(
            supervisor.stop("missing").await,
            Err(OrchestratorError::ServiceNotFound(_))
        ));
    }
}
