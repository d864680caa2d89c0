use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use stratus_core::error::{Error, Result};
use stratus_core::payloads::{
    CnciEndpoint, Command, Event, Failure, Frame, StartPayload, TraceContext, recv_frame,
    send_frame,
};

use crate::coordinator::Coordinator;

/// The bus connection, as seen by the controller: frames go out, the read
/// side feeds the dispatch loop. TCP in production, a channel pair in tests.
#[async_trait]
pub trait FrameBus: Send + Sync {
    async fn send(&self, frame: Frame) -> Result<()>;
}

/// Framed-JSON bus connection over TCP.
pub struct TcpBus {
    writer: Mutex<tokio::net::tcp::OwnedWriteHalf>,
}

impl TcpBus {
    /// Connect to the bus. Returns the outbound half and the inbound frame
    /// stream; the read task ends (closing the stream) when the peer goes
    /// away.
    pub async fn connect(addr: &str) -> Result<(Arc<Self>, mpsc::Receiver<Frame>)> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::Transport(format!("connect {}: {}", addr, e)))?;
        info!(bus = %addr, "Connected to message bus");
        let (mut read_half, write_half) = stream.into_split();

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            loop {
                match recv_frame(&mut read_half).await {
                    Ok(frame) => {
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Bus read ended");
                        break;
                    }
                }
            }
        });

        Ok((
            Arc::new(Self {
                writer: Mutex::new(write_half),
            }),
            rx,
        ))
    }
}

#[async_trait]
impl FrameBus for TcpBus {
    async fn send(&self, frame: Frame) -> Result<()> {
        let mut writer = self.writer.lock().await;
        send_frame(&mut *writer, &frame).await
    }
}

/// In-memory bus half for tests: outbound frames land on a channel the
/// test harness drains.
pub struct ChannelBus {
    tx: mpsc::Sender<Frame>,
}

impl ChannelBus {
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl FrameBus for ChannelBus {
    async fn send(&self, frame: Frame) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| Error::Transport("bus receiver dropped".to_string()))
    }
}

/// Outgoing command surface. Each call returns once the bus accepted the
/// frame; completion arrives later as an event.
pub struct Transport {
    bus: Arc<dyn FrameBus>,
}

impl Transport {
    pub fn new(bus: Arc<dyn FrameBus>) -> Self {
        Self { bus }
    }

    async fn emit(&self, command: Command) -> Result<()> {
        self.bus.send(Frame::Command(command)).await
    }

    pub async fn start(&self, payload: StartPayload) -> Result<()> {
        self.emit(Command::Start {
            payload,
            trace: None,
        })
        .await
    }

    pub async fn start_traced(&self, payload: StartPayload, label: &str) -> Result<()> {
        self.emit(Command::Start {
            payload,
            trace: Some(TraceContext {
                label: label.to_string(),
                started_at: stratus_core::time::utc_now(),
            }),
        })
        .await
    }

    pub async fn delete(&self, instance_id: Uuid, node_id: &str) -> Result<()> {
        self.emit(Command::Delete {
            instance_id,
            node_id: node_id.to_string(),
            stop: false,
        })
        .await
    }

    pub async fn stop(&self, instance_id: Uuid, node_id: &str) -> Result<()> {
        self.emit(Command::Delete {
            instance_id,
            node_id: node_id.to_string(),
            stop: true,
        })
        .await
    }

    /// A restart is a start with the instance's prior wiring and the
    /// restart flag set.
    pub async fn restart(&self, mut payload: StartPayload) -> Result<()> {
        payload.restart = true;
        self.emit(Command::Start {
            payload,
            trace: None,
        })
        .await
    }

    pub async fn attach_volume(
        &self,
        volume_id: Uuid,
        instance_id: Uuid,
        node_id: &str,
    ) -> Result<()> {
        self.emit(Command::AttachVolume {
            volume_id,
            instance_id,
            node_id: node_id.to_string(),
        })
        .await
    }

    pub async fn detach_volume(
        &self,
        volume_id: Uuid,
        instance_id: Uuid,
        node_id: &str,
    ) -> Result<()> {
        self.emit(Command::DetachVolume {
            volume_id,
            instance_id,
            node_id: node_id.to_string(),
        })
        .await
    }

    pub async fn assign_public_ip(
        &self,
        cnci_id: Uuid,
        tenant_id: &str,
        instance_id: Uuid,
        public_ip: &str,
        private_ip: &str,
    ) -> Result<()> {
        self.emit(Command::AssignPublicIp {
            cnci_id,
            tenant_id: tenant_id.to_string(),
            instance_id,
            public_ip: public_ip.to_string(),
            private_ip: private_ip.to_string(),
        })
        .await
    }

    pub async fn release_public_ip(
        &self,
        cnci_id: Uuid,
        tenant_id: &str,
        instance_id: Uuid,
        public_ip: &str,
        private_ip: &str,
    ) -> Result<()> {
        self.emit(Command::ReleasePublicIp {
            cnci_id,
            tenant_id: tenant_id.to_string(),
            instance_id,
            public_ip: public_ip.to_string(),
            private_ip: private_ip.to_string(),
        })
        .await
    }

    pub async fn evacuate(&self, node_id: &str) -> Result<()> {
        self.emit(Command::Evacuate {
            node_id: node_id.to_string(),
        })
        .await
    }

    pub async fn restore(&self, node_id: &str) -> Result<()> {
        self.emit(Command::Restore {
            node_id: node_id.to_string(),
        })
        .await
    }

    pub async fn refresh_cnci(&self, cnci_id: Uuid, endpoints: Vec<CnciEndpoint>) -> Result<()> {
        self.emit(Command::RefreshCnci { cnci_id, endpoints }).await
    }
}

/// Inbound event pump: route each frame by kind into the coordinator.
///
/// Frames from one bus connection are applied in arrival order. Handlers
/// are idempotent and tolerate events for instances that no longer exist,
/// and they never propagate errors — failures are logged and recorded in
/// the tenant event log.
pub async fn dispatch_loop(coordinator: Arc<Coordinator>, mut rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        dispatch(&coordinator, frame).await;
    }
    debug!("Dispatch loop ended");
}

/// Route a single inbound frame.
pub async fn dispatch(coordinator: &Coordinator, frame: Frame) {
    match frame {
        Frame::Event(event) => match event {
            Event::Stats(report) => coordinator.handle_stats(report).await,
            Event::TraceReport { label, frames } => {
                coordinator.handle_trace_report(&label, frames).await
            }
            Event::InstanceDeleted { instance_id, .. } => {
                coordinator.instance_deleted(instance_id).await
            }
            Event::InstanceStopped { instance_id, .. } => {
                coordinator.instance_stopped(instance_id).await
            }
            Event::ConcentratorAdded {
                instance_id,
                tenant_id,
                subnet,
                ip,
                mac,
            } => {
                coordinator
                    .concentrator_added(instance_id, &tenant_id, &subnet, &ip, &mac)
                    .await
            }
            Event::NodeConnected { node_id, hostname } => {
                info!(node = %node_id, hostname = %hostname, "Worker node connected");
                coordinator.node_connected(&node_id, &hostname).await
            }
            Event::NodeDisconnected { node_id } => {
                info!(node = %node_id, "Worker node disconnected");
                coordinator.node_disconnected(&node_id).await
            }
            Event::PublicIpAssigned {
                instance_id,
                public_ip,
                ..
            } => coordinator.public_ip_assigned(instance_id, &public_ip).await,
            Event::PublicIpUnassigned {
                instance_id,
                public_ip,
                ..
            } => {
                coordinator
                    .public_ip_unassigned(instance_id, &public_ip)
                    .await
            }
        },
        Frame::Failure(failure) => match failure {
            Failure::StartFailure {
                instance_id,
                reason,
                restart,
            } => coordinator.start_failure(instance_id, reason, restart).await,
            Failure::AttachVolumeFailure {
                instance_id,
                volume_id,
                message,
            } => {
                coordinator
                    .attach_volume_failure(instance_id, volume_id, &message)
                    .await
            }
            Failure::DeleteFailure {
                instance_id,
                message,
            } => {
                error!(instance = %instance_id, error = %message, "Worker failed to delete instance");
            }
            Failure::AssignPublicIpFailure {
                instance_id,
                public_ip,
                message,
            } => {
                coordinator
                    .assign_public_ip_failure(instance_id, &public_ip, &message)
                    .await
            }
            Failure::UnassignPublicIpFailure {
                instance_id,
                public_ip,
                message,
            } => {
                error!(
                    instance = %instance_id,
                    public_ip = %public_ip,
                    error = %message,
                    "Worker failed to unassign public IP"
                );
            }
        },
        Frame::Command(_) => {
            warn!("Unexpected command frame on controller inbound path, dropping");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_core::payloads::{InstanceMetadata, Networking};
    use stratus_core::workload::{Firmware, VmType};

    fn payload() -> StartPayload {
        StartPayload {
            tenant_id: "acme".to_string(),
            instance_id: Uuid::new_v4(),
            firmware: Firmware::Efi,
            vm_type: VmType::Container,
            persistence: "host".to_string(),
            vcpus: 1,
            mem_mb: 256,
            disk_gb: 4,
            networking: Networking::Concentrator {
                vnic_mac: "02:ab:cd:ef:01:02".to_string(),
            },
            storage: vec![],
            docker_image: Some("nginx".to_string()),
            restart: false,
            metadata: InstanceMetadata {
                uuid: Uuid::new_v4(),
                hostname: "h".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_stop_is_delete_with_stop_flag() {
        let (bus, mut rx) = ChannelBus::new(8);
        let transport = Transport::new(bus);
        let id = Uuid::new_v4();
        transport.stop(id, "node-1").await.unwrap();

        match rx.recv().await.unwrap() {
            Frame::Command(Command::Delete {
                instance_id,
                node_id,
                stop,
            }) => {
                assert_eq!(instance_id, id);
                assert_eq!(node_id, "node-1");
                assert!(stop);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_restart_sets_flag() {
        let (bus, mut rx) = ChannelBus::new(8);
        let transport = Transport::new(bus);
        transport.restart(payload()).await.unwrap();

        match rx.recv().await.unwrap() {
            Frame::Command(Command::Start { payload, .. }) => assert!(payload.restart),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_start_traced_carries_label() {
        let (bus, mut rx) = ChannelBus::new(8);
        let transport = Transport::new(bus);
        transport.start_traced(payload(), "batch-7").await.unwrap();

        match rx.recv().await.unwrap() {
            Frame::Command(Command::Start { trace, .. }) => {
                assert_eq!(trace.unwrap().label, "batch-7");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_fails_when_receiver_dropped() {
        let (bus, rx) = ChannelBus::new(1);
        drop(rx);
        let transport = Transport::new(bus);
        let err = transport.evacuate("node-1").await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn test_tcp_bus_roundtrip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            // Echo the controller's frame back as-is.
            let frame = recv_frame(&mut stream).await.unwrap();
            send_frame(&mut stream, &frame).await.unwrap();
        });

        let (bus, mut rx) = TcpBus::connect(&addr.to_string()).await.unwrap();
        bus.send(Frame::Event(Event::NodeDisconnected {
            node_id: "node-1".to_string(),
        }))
        .await
        .unwrap();

        let echoed = rx.recv().await.unwrap();
        assert!(matches!(
            echoed,
            Frame::Event(Event::NodeDisconnected { .. })
        ));
        server.await.unwrap();
    }
}
