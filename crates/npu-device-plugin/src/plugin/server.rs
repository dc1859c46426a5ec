use core::error::Error;
use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use error_stack::Report;
use error_stack::ResultExt;
use futures::Stream;
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tower::service_fn;
use tracing::debug;
use tracing::error;
use tracing::info;

use super::allocate::allocate;
use super::watch::DeviceWatcher;
use super::DeviceTypeHandle;
use super::PluginContext;
use crate::domain::device::RESOURCE_NAME_PREFIX;
use crate::domain::errors::AllocateError;
use crate::infrastructure::kubelet::api::device_plugin_server::DevicePlugin;
use crate::infrastructure::kubelet::api::device_plugin_server::DevicePluginServer;
use crate::infrastructure::kubelet::api::registration_client::RegistrationClient;
use crate::infrastructure::kubelet::api::AllocateRequest;
use crate::infrastructure::kubelet::api::AllocateResponse;
use crate::infrastructure::kubelet::api::DevicePluginOptions;
use crate::infrastructure::kubelet::api::Empty;
use crate::infrastructure::kubelet::api::ListAndWatchResponse;
use crate::infrastructure::kubelet::api::PreStartContainerRequest;
use crate::infrastructure::kubelet::api::PreStartContainerResponse;
use crate::infrastructure::kubelet::api::PreferredAllocationRequest;
use crate::infrastructure::kubelet::api::PreferredAllocationResponse;
use crate::infrastructure::kubelet::api::RegisterRequest;

pub const API_VERSION: &str = "v1beta1";

#[derive(Debug, derive_more::Display)]
pub enum PluginError {
    #[display("Failed to listen on plugin socket {path}")]
    Socket { path: String },
    #[display("Failed to connect to kubelet at {path}")]
    KubeletUnreachable { path: String },
    #[display("Kubelet rejected registration of {resource_name}")]
    RegistrationRejected { resource_name: String },
    #[display("Failed to watch {target} for restart triggers")]
    Watcher { target: String },
}

impl Error for PluginError {}

/// Map a rejected allocation onto the gRPC status kubelet sees.
pub fn allocate_status(report: &Report<AllocateError>) -> Status {
    let message = format!("{report:?}");
    match report.current_context() {
        AllocateError::InvalidRequest { .. } | AllocateError::UnknownDevice { .. } => {
            Status::invalid_argument(message)
        }
        AllocateError::ResolutionFailed { .. }
        | AllocateError::NoPendingPod { .. }
        | AllocateError::PublishFailed { .. } => Status::internal(message),
    }
}

/// Device plugin for one NPU device type.
pub struct NpuDevicePlugin {
    ctx: Arc<PluginContext>,
    handle: Arc<DeviceTypeHandle>,
    plugin_dir: PathBuf,
    options: DevicePluginOptions,
}

impl NpuDevicePlugin {
    pub fn new(
        ctx: Arc<PluginContext>,
        handle: Arc<DeviceTypeHandle>,
        plugin_dir: impl Into<PathBuf>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            handle,
            plugin_dir: plugin_dir.into(),
            options: DevicePluginOptions {
                pre_start_required: false,
                get_preferred_allocation_available: false,
            },
        })
    }

    pub fn dev_type(&self) -> &str {
        self.handle.dev_type()
    }

    /// Socket file name relative to the plugin directory.
    pub fn endpoint(&self) -> String {
        format!("{}.sock", self.dev_type())
    }

    pub fn resource_name(&self) -> String {
        format!("{RESOURCE_NAME_PREFIX}{}", self.dev_type())
    }

    pub fn socket_path(&self) -> PathBuf {
        self.plugin_dir.join(self.endpoint())
    }

    /// Bind the plugin socket and serve until `token` is cancelled.
    pub async fn start(
        self: &Arc<Self>,
        token: CancellationToken,
    ) -> Result<JoinHandle<()>, Report<PluginError>> {
        let socket_path = self.socket_path();
        let socket_error = || PluginError::Socket {
            path: socket_path.display().to_string(),
        };
        info!(socket = %socket_path.display(), "starting device plugin server");

        if socket_path.exists() {
            std::fs::remove_file(&socket_path).change_context_lazy(socket_error)?;
        }
        let listener = UnixListener::bind(&socket_path).change_context_lazy(socket_error)?;

        let service = DevicePluginService::new(self.clone(), token.clone());
        let dev_type = self.dev_type().to_string();
        Ok(tokio::spawn(async move {
            let result = tonic::transport::Server::builder()
                .add_service(DevicePluginServer::new(service))
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::UnixListenerStream::new(listener),
                    async move {
                        token.cancelled().await;
                        info!(dev_type = %dev_type, "shutting down device plugin server");
                    },
                )
                .await;
            if let Err(e) = result {
                error!("device plugin server failed: {e}");
            }
        }))
    }

    pub async fn register_with_kubelet(
        &self,
        kubelet_socket: &Path,
    ) -> Result<(), Report<PluginError>> {
        info!(
            resource = %self.resource_name(),
            kubelet = %kubelet_socket.display(),
            "registering device plugin with kubelet"
        );
        let channel = uds_channel(kubelet_socket).await?;
        let mut client = RegistrationClient::new(channel);

        let request = RegisterRequest {
            version: API_VERSION.to_string(),
            endpoint: self.endpoint(),
            resource_name: self.resource_name(),
            options: Some(self.options.clone()),
        };
        client
            .register(Request::new(request))
            .await
            .change_context_lazy(|| PluginError::RegistrationRejected {
                resource_name: self.resource_name(),
            })?;
        info!(resource = %self.resource_name(), "registered device plugin with kubelet");
        Ok(())
    }
}

/// gRPC channel over a Unix domain socket. The URL is a placeholder.
pub async fn uds_channel(socket_path: &Path) -> Result<Channel, Report<PluginError>> {
    let path = socket_path.to_path_buf();
    Endpoint::from_static("http://tonic")
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = path.clone();
            async move {
                match UnixStream::connect(path).await {
                    Ok(stream) => Ok(TokioIo::new(stream)),
                    Err(e) => Err(Box::new(e) as Box<dyn Error + Send + Sync>),
                }
            }
        }))
        .await
        .change_context_lazy(|| PluginError::KubeletUnreachable {
            path: socket_path.display().to_string(),
        })
}

pub struct DevicePluginService {
    plugin: Arc<NpuDevicePlugin>,
    token: CancellationToken,
}

impl DevicePluginService {
    pub fn new(plugin: Arc<NpuDevicePlugin>, token: CancellationToken) -> Self {
        Self { plugin, token }
    }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        Ok(Response::new(self.plugin.options.clone()))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!(dev_type = %self.plugin.dev_type(), "kubelet started watching devices");

        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = DeviceWatcher::new(self.plugin.ctx.clone(), self.plugin.handle.clone());
        tokio::spawn(watcher.run(tx, self.token.clone()));

        let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_preferred_allocation(
        &self,
        _request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        Err(Status::unimplemented("preferred allocation is not supported"))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let request = request.into_inner();
        match allocate(&self.plugin.ctx, &self.plugin.handle, &request).await {
            Ok(response) => Ok(Response::new(response)),
            Err(e) => {
                error!(dev_type = %self.plugin.dev_type(), "allocation rejected: {e:?}");
                Err(allocate_status(&e))
            }
        }
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        debug!(dev_type = %self.plugin.dev_type(), "pre-start container");
        Ok(Response::new(PreStartContainerResponse {}))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use futures::StreamExt;
    use similar_asserts::assert_eq;
    use tonic::Code;

    use super::*;
    use crate::domain::chip::ChipManager;
    use crate::infrastructure::driver::InventoryDriver;
    use crate::infrastructure::kubelet::api::device_plugin_client::DevicePluginClient;
    use crate::infrastructure::kubelet::api::registration_server::Registration;
    use crate::infrastructure::kubelet::api::registration_server::RegistrationServer;
    use crate::infrastructure::kubelet::api::ContainerAllocateRequest;
    use crate::plugin::DeviceRegistry;

    pub(crate) const ONE_CARD_310: &str = r#"
chips:
  - logic_id: 0
    phy_id: 0
    chip_name: "310"
    total_cores: 8
"#;

    /// Kubelet registration endpoint that records every request.
    #[derive(Clone, Default)]
    pub(crate) struct FakeKubelet {
        pub requests: Arc<Mutex<Vec<RegisterRequest>>>,
    }

    #[tonic::async_trait]
    impl Registration for FakeKubelet {
        async fn register(
            &self,
            request: Request<RegisterRequest>,
        ) -> TonicResult<Response<Empty>> {
            self.requests
                .lock()
                .expect("poisoned")
                .push(request.into_inner());
            Ok(Response::new(Empty {}))
        }
    }

    impl FakeKubelet {
        /// Serve on `socket` until `token` is cancelled.
        pub(crate) fn serve(&self, socket: &Path, token: CancellationToken) -> JoinHandle<()> {
            let listener = UnixListener::bind(socket).expect("should bind kubelet socket");
            let service = RegistrationServer::new(self.clone());
            tokio::spawn(async move {
                tonic::transport::Server::builder()
                    .add_service(service)
                    .serve_with_incoming_shutdown(
                        tokio_stream::wrappers::UnixListenerStream::new(listener),
                        token.cancelled_owned(),
                    )
                    .await
                    .expect("fake kubelet should serve");
            })
        }

        pub(crate) fn resources(&self) -> Vec<String> {
            self.requests
                .lock()
                .expect("poisoned")
                .iter()
                .map(|r| r.resource_name.clone())
                .collect()
        }
    }

    fn plugin(dir: &Path) -> Arc<NpuDevicePlugin> {
        let driver = Arc::new(InventoryDriver::from_yaml(ONE_CARD_310).expect("should load"));
        let manager = Arc::new(ChipManager::detect(driver).expect("should detect"));
        let (registry, _rx) = DeviceRegistry::discover(manager).expect("should discover");
        let handle = registry.handle("Ascend310").expect("type should exist");
        let ctx = Arc::new(PluginContext {
            registry: Arc::new(registry),
            list_watch_period: Duration::from_secs(5),
            use_ascend_docker: true,
            scheduler: None,
        });
        NpuDevicePlugin::new(ctx, handle, dir)
    }

    #[test]
    fn allocation_errors_map_to_grpc_codes() {
        let rejected = Report::new(AllocateError::InvalidRequest {
            message: "too many".to_string(),
        });
        assert_eq!(allocate_status(&rejected).code(), Code::InvalidArgument);
        let failed = Report::new(AllocateError::ResolutionFailed {
            device_id: "Ascend910-0".to_string(),
        });
        assert_eq!(allocate_status(&failed).code(), Code::Internal);
    }

    #[test_log::test(tokio::test)]
    async fn serves_kubelet_calls_over_unix_socket() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let token = CancellationToken::new();
        let plugin = plugin(dir.path());
        assert_eq!(plugin.endpoint(), "Ascend310.sock");
        let server = plugin.start(token.clone()).await.expect("should start");

        let channel = uds_channel(&plugin.socket_path())
            .await
            .expect("should connect");
        let mut client = DevicePluginClient::new(channel);

        let mut stream = client
            .list_and_watch(Empty {})
            .await
            .expect("should watch")
            .into_inner();
        let first = stream
            .next()
            .await
            .expect("should receive a list")
            .expect("should be ok");
        assert_eq!(first.devices.len(), 1);
        assert_eq!(first.devices[0].id, "Ascend310-0");
        assert_eq!(first.devices[0].health, "Healthy");

        let response = client
            .allocate(AllocateRequest {
                container_requests: vec![ContainerAllocateRequest {
                    devices_ids: vec!["Ascend310-0".to_string()],
                }],
            })
            .await
            .expect("should allocate")
            .into_inner();
        assert!(response.container_responses[0].annotations.is_empty());

        let status = client
            .allocate(AllocateRequest {
                container_requests: vec![ContainerAllocateRequest {
                    devices_ids: vec!["Ascend310-7".to_string()],
                }],
            })
            .await
            .expect_err("should reject unknown device");
        assert_eq!(status.code(), Code::InvalidArgument);

        let status = client
            .get_preferred_allocation(PreferredAllocationRequest::default())
            .await
            .expect_err("should be unimplemented");
        assert_eq!(status.code(), Code::Unimplemented);

        drop(stream);
        drop(client);
        token.cancel();
        server.await.expect("server task should finish");
    }

    #[tokio::test]
    async fn registers_resource_with_kubelet() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let token = CancellationToken::new();
        let kubelet = FakeKubelet::default();
        let kubelet_socket = dir.path().join("kubelet.sock");
        let kubelet_task = kubelet.serve(&kubelet_socket, token.clone());

        let plugin = plugin(dir.path());
        plugin
            .register_with_kubelet(&kubelet_socket)
            .await
            .expect("should register");

        let requests = kubelet.requests.lock().expect("poisoned").clone();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].version, "v1beta1");
        assert_eq!(requests[0].endpoint, "Ascend310.sock");
        assert_eq!(requests[0].resource_name, "huawei.com/Ascend310");

        token.cancel();
        kubelet_task.await.expect("kubelet task should finish");
    }

    #[tokio::test]
    async fn registration_fails_without_kubelet() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let plugin = plugin(dir.path());
        let result = plugin
            .register_with_kubelet(&dir.path().join("kubelet.sock"))
            .await;
        assert!(result.is_err(), "should fail when kubelet is not listening");
    }
}
