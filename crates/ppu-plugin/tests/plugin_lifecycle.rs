//! End-to-end plugin tests.
//!
//! Each test runs a fake kubelet `Registration` server on a Unix socket in
//! a temporary directory, starts the plugin controller against it and then
//! talks to the plugin through the generated DevicePlugin client, the same
//! way kubelet does.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ppu_plugin::config::{KUBELET_SOCKET, PluginConfig};
use ppu_plugin::proto;
use ppu_plugin::proto::device_plugin_client::DevicePluginClient;
use ppu_plugin::proto::registration_server::{Registration, RegistrationServer};
use ppu_plugin::{Health, HealthProbe, Instance, PluginController, StartupPhase, transport};
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Channel;
use tonic::{Request, Response, Status, Streaming};

const WAIT: Duration = Duration::from_secs(5);

// ── Fake kubelet ──────────────────────────────────────────────────

struct FakeKubelet {
    requests: mpsc::UnboundedSender<proto::RegisterRequest>,
    reject: bool,
}

#[tonic::async_trait]
impl Registration for FakeKubelet {
    async fn register(
        &self,
        request: Request<proto::RegisterRequest>,
    ) -> Result<Response<proto::Empty>, Status> {
        let _ = self.requests.send(request.into_inner());
        if self.reject {
            return Err(Status::invalid_argument("resource already registered"));
        }
        Ok(Response::new(proto::Empty {}))
    }
}

fn start_kubelet(
    dir: &Path,
    reject: bool,
) -> (mpsc::UnboundedReceiver<proto::RegisterRequest>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let listener = UnixListener::bind(dir.join(KUBELET_SOCKET)).unwrap();
    let kubelet = FakeKubelet {
        requests: tx,
        reject,
    };

    let handle = tokio::spawn(async move {
        let _ = tonic::transport::Server::builder()
            .add_service(RegistrationServer::new(kubelet))
            .serve_with_incoming(UnixListenerStream::new(listener))
            .await;
    });
    (rx, handle)
}

// ── Plugin helpers ────────────────────────────────────────────────

/// Reports ids in `failed` as unhealthy, everything else as healthy.
#[derive(Default)]
struct ScriptedProbe {
    failed: Mutex<HashSet<String>>,
}

impl ScriptedProbe {
    fn fail(&self, id: &str) {
        self.failed.lock().unwrap().insert(id.to_string());
    }

    fn recover(&self, id: &str) {
        self.failed.lock().unwrap().remove(id);
    }
}

impl HealthProbe for ScriptedProbe {
    fn probe(&self, instance: &Instance) -> Health {
        if self.failed.lock().unwrap().contains(&instance.id) {
            Health::Unhealthy
        } else {
            Health::Healthy
        }
    }
}

fn test_config(dir: &Path, count: i64) -> PluginConfig {
    PluginConfig {
        socket_path: dir.to_path_buf(),
        device_count: count,
        health_interval: Duration::from_millis(100),
        register_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

async fn client(controller: &PluginController) -> DevicePluginClient<Channel> {
    let channel = transport::dial(&controller.socket_path(), WAIT).await.unwrap();
    DevicePluginClient::new(channel)
}

fn health_of(resp: &proto::ListAndWatchResponse) -> Vec<(String, String)> {
    resp.devices
        .iter()
        .map(|d| (d.id.clone(), d.health.clone()))
        .collect()
}

/// Read snapshots until one satisfies `pred`.
async fn next_matching(
    stream: &mut Streaming<proto::ListAndWatchResponse>,
    pred: impl Fn(&proto::ListAndWatchResponse) -> bool,
) -> proto::ListAndWatchResponse {
    tokio::time::timeout(WAIT, async {
        loop {
            let resp = stream
                .message()
                .await
                .unwrap()
                .expect("stream ended early");
            if pred(&resp) {
                return resp;
            }
        }
    })
    .await
    .expect("no matching snapshot")
}

fn device_health(resp: &proto::ListAndWatchResponse, id: &str) -> Option<String> {
    resp.devices
        .iter()
        .find(|d| d.id == id)
        .map(|d| d.health.clone())
}

// ── Tests ─────────────────────────────────────────────────────────

#[tokio::test]
async fn registers_with_kubelet() {
    let dir = tempfile::tempdir().unwrap();
    let (mut requests, kubelet) = start_kubelet(dir.path(), false);

    let mut controller = PluginController::new(test_config(dir.path(), 4)).unwrap();
    controller.start().await.unwrap();
    assert!(controller.is_running());

    let req = requests.recv().await.unwrap();
    assert_eq!(req.version, "v1beta1");
    assert_eq!(req.endpoint, "ppu.sock");
    assert_eq!(req.resource_name, "alibabacloud.com/ppu");
    let opts = req.options.unwrap();
    assert!(!opts.pre_start_required);
    assert!(opts.get_preferred_allocation_available);

    controller.stop().await;
    kubelet.abort();
}

#[tokio::test]
async fn rejected_registration_fails_startup() {
    let dir = tempfile::tempdir().unwrap();
    let (_requests, kubelet) = start_kubelet(dir.path(), true);

    let mut controller = PluginController::new(test_config(dir.path(), 2)).unwrap();
    let err = controller.start().await.unwrap_err();
    assert_eq!(err.phase, StartupPhase::Register);
    assert!(!controller.is_running());

    controller.stop().await;
    assert!(!controller.socket_path().exists());
    kubelet.abort();
}

#[tokio::test]
async fn list_and_watch_reports_inventory_and_health_changes() {
    let dir = tempfile::tempdir().unwrap();
    let (_requests, kubelet) = start_kubelet(dir.path(), false);

    let probe = Arc::new(ScriptedProbe::default());
    let mut controller = PluginController::new(test_config(dir.path(), 3))
        .unwrap()
        .with_probe(probe.clone());
    controller.start().await.unwrap();

    let mut client = client(&controller).await;
    let mut stream = client
        .list_and_watch(proto::Empty {})
        .await
        .unwrap()
        .into_inner();

    let first = tokio::time::timeout(WAIT, stream.message())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(
        health_of(&first),
        vec![
            ("ppu-0".to_string(), "Healthy".to_string()),
            ("ppu-1".to_string(), "Healthy".to_string()),
            ("ppu-2".to_string(), "Healthy".to_string()),
        ]
    );

    probe.fail("ppu-1");
    let degraded = next_matching(&mut stream, |r| {
        device_health(r, "ppu-1").as_deref() == Some("Unhealthy")
    })
    .await;
    assert_eq!(degraded.devices.len(), 3);
    assert_eq!(device_health(&degraded, "ppu-0").as_deref(), Some("Healthy"));

    probe.recover("ppu-1");
    next_matching(&mut stream, |r| {
        r.devices.iter().all(|d| d.health == "Healthy")
    })
    .await;

    controller.stop().await;
    kubelet.abort();
}

#[tokio::test]
async fn externally_marked_device_heals_and_every_session_sees_it() {
    let dir = tempfile::tempdir().unwrap();
    let (_requests, kubelet) = start_kubelet(dir.path(), false);

    let mut controller = PluginController::new(test_config(dir.path(), 2)).unwrap();
    controller.start().await.unwrap();

    let mut first_client = client(&controller).await;
    let mut second_client = client(&controller).await;
    let mut first = first_client
        .list_and_watch(proto::Empty {})
        .await
        .unwrap()
        .into_inner();
    let mut second = second_client
        .list_and_watch(proto::Empty {})
        .await
        .unwrap()
        .into_inner();

    // Drain initial snapshots.
    next_matching(&mut first, |_| true).await;
    next_matching(&mut second, |_| true).await;

    let registry = controller.registry().unwrap();
    assert!(registry.set_health("ppu-0", Health::Unhealthy));

    // Marking a device does not notify anyone; the monitor's heal does, so
    // the very next snapshot on each session is already the healed one.
    for stream in [&mut first, &mut second] {
        let update = tokio::time::timeout(WAIT, stream.message())
            .await
            .expect("no snapshot after heal")
            .unwrap()
            .expect("stream ended early");
        assert_eq!(
            health_of(&update),
            vec![
                ("ppu-0".to_string(), "Healthy".to_string()),
                ("ppu-1".to_string(), "Healthy".to_string()),
            ]
        );
    }
    assert_eq!(registry.get("ppu-0").unwrap().health, Health::Healthy);

    controller.stop().await;
    kubelet.abort();
}

#[tokio::test]
async fn allocate_and_preferred_allocation() {
    let dir = tempfile::tempdir().unwrap();
    let (_requests, kubelet) = start_kubelet(dir.path(), false);

    let mut controller = PluginController::new(test_config(dir.path(), 4)).unwrap();
    controller.start().await.unwrap();
    let mut client = client(&controller).await;

    let opts = client
        .get_device_plugin_options(proto::Empty {})
        .await
        .unwrap()
        .into_inner();
    assert!(!opts.pre_start_required);
    assert!(opts.get_preferred_allocation_available);

    let preferred = client
        .get_preferred_allocation(proto::PreferredAllocationRequest {
            container_requests: vec![proto::ContainerPreferredAllocationRequest {
                available_device_i_ds: vec![
                    "ppu-0".into(),
                    "ppu-1".into(),
                    "ppu-2".into(),
                    "ppu-3".into(),
                ],
                must_include_device_i_ds: vec!["ppu-0".into()],
                allocation_size: 2,
            }],
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(
        preferred.container_responses[0].device_i_ds,
        vec!["ppu-0", "ppu-1"]
    );

    let allocated = client
        .allocate(proto::AllocateRequest {
            container_requests: vec![proto::ContainerAllocateRequest {
                devices_ids: vec!["ppu-0".into(), "ppu-1".into()],
            }],
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(allocated.container_responses.len(), 1);
    let container = &allocated.container_responses[0];
    assert_eq!(container.envs["PPU_DEVICE_COUNT"], "2");
    assert_eq!(container.envs["PPU_ALLOCATED_DEVICES"], "ppu-0,ppu-1");
    assert_eq!(
        container.annotations["ppu.alibabacloud.com/allocated-devices"],
        "ppu-0,ppu-1"
    );
    let paths: Vec<_> = container
        .devices
        .iter()
        .map(|d| (d.container_path.as_str(), d.host_path.as_str(), d.permissions.as_str()))
        .collect();
    assert_eq!(
        paths,
        vec![
            ("/dev/ppu-0", "/dev/null", "rw"),
            ("/dev/ppu-1", "/dev/null", "rw"),
        ]
    );

    let pre_start = client
        .pre_start_container(proto::PreStartContainerRequest {
            devices_ids: vec!["ppu-0".into()],
        })
        .await;
    assert!(pre_start.is_ok());

    controller.stop().await;
    kubelet.abort();
}

#[tokio::test]
async fn stop_ends_streams_and_removes_socket() {
    let dir = tempfile::tempdir().unwrap();
    let (_requests, kubelet) = start_kubelet(dir.path(), false);

    let mut controller = PluginController::new(test_config(dir.path(), 1)).unwrap();
    controller.start().await.unwrap();
    let socket = controller.socket_path();
    assert!(socket.exists());

    let mut client = client(&controller).await;
    let mut stream = client
        .list_and_watch(proto::Empty {})
        .await
        .unwrap()
        .into_inner();
    next_matching(&mut stream, |_| true).await;

    tokio::time::timeout(Duration::from_secs(10), controller.stop())
        .await
        .expect("stop blocked");
    assert!(!socket.exists());

    // The stream ends cleanly or with a transport error, never hangs.
    let end = tokio::time::timeout(WAIT, stream.message())
        .await
        .expect("stream still open after stop");
    assert!(!matches!(end, Ok(Some(_))));

    // A second stop is a no-op.
    controller.stop().await;
    kubelet.abort();
}

#[tokio::test]
async fn stale_socket_is_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let (_requests, kubelet) = start_kubelet(dir.path(), false);
    std::fs::write(dir.path().join("ppu.sock"), b"stale").unwrap();

    let mut controller = PluginController::new(test_config(dir.path(), 1)).unwrap();
    controller.start().await.unwrap();
    let mut client = client(&controller).await;
    assert!(client.get_device_plugin_options(proto::Empty {}).await.is_ok());

    controller.stop().await;
    kubelet.abort();
}

#[tokio::test]
async fn zero_devices_is_valid() {
    let dir = tempfile::tempdir().unwrap();
    let (_requests, kubelet) = start_kubelet(dir.path(), false);

    let mut controller = PluginController::new(test_config(dir.path(), 0)).unwrap();
    controller.start().await.unwrap();
    let mut client = client(&controller).await;
    let mut stream = client
        .list_and_watch(proto::Empty {})
        .await
        .unwrap()
        .into_inner();
    let first = next_matching(&mut stream, |_| true).await;
    assert!(first.devices.is_empty());

    controller.stop().await;
    kubelet.abort();
}
