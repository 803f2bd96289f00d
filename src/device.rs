//! The tunnel device layer: raw datagram I/O behind bounded queues.
//!
//! [`NetDevice`] owns the byte channel to the kernel's tun interface and
//! runs one ingress and one egress worker. Everything above it speaks
//! [`Packet`]s through the two queues; nothing above it touches the device
//! directly.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

use crate::error::StackError;
use crate::packet::{Packet, PACKET_SIZE};

/// Capacity of the ingress and egress queues. Producers block when a queue
/// is full, pushing backpressure toward the kernel read loop or the TCP
/// engine.
pub const QUEUE_SIZE: usize = 10;

type TunReader = Box<dyn AsyncRead + Send + Unpin>;
type TunWriter = Box<dyn AsyncWrite + Send + Unpin>;

// ---------------------------------------------------------------------------
// NetDevice
// ---------------------------------------------------------------------------

/// The tunnel device: a full-duplex datagram channel plus one bounded queue
/// per direction.
///
/// Lifecycle: [`open`](Self::open) (or [`from_io`](Self::from_io)), then
/// [`bind`](Self::bind) to start the workers, then
/// [`read_packet`](Self::read_packet) / [`write_packet`](Self::write_packet).
/// [`close`](Self::close) flips the cancellation signal that every worker in
/// the stack observes.
pub struct NetDevice {
    reader: Option<TunReader>,
    writer: Option<TunWriter>,
    incoming_tx: Option<mpsc::Sender<Packet>>,
    incoming_rx: mpsc::Receiver<Packet>,
    outgoing_tx: mpsc::Sender<Packet>,
    outgoing_rx: Option<mpsc::Receiver<Packet>>,
    cancel_tx: Arc<watch::Sender<bool>>,
}

impl NetDevice {
    /// Open and configure the tun interface (layer-3 framing, no
    /// packet-information prefix) and wrap it in a device.
    ///
    /// Must run inside a tokio runtime; requires root on Linux.
    pub fn open(address: Ipv4Addr, netmask: Ipv4Addr) -> Result<Self, StackError> {
        let mut config = tun::Configuration::default();

        config.address(address).netmask(netmask).up();

        #[cfg(target_os = "linux")]
        config.platform_config(|config| {
            config.ensure_root_privileges(true);
        });

        let dev = tun::create_as_async(&config)?;
        let (reader, writer) = tokio::io::split(dev);
        Ok(Self::from_io(reader, writer))
    }

    /// Build a device over an arbitrary full-duplex datagram channel. Every
    /// read must yield exactly one IP datagram and every write submits one.
    ///
    /// [`open`](Self::open) delegates here; tests substitute an in-memory
    /// channel.
    pub fn from_io<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (incoming_tx, incoming_rx) = mpsc::channel(QUEUE_SIZE);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(QUEUE_SIZE);
        let (cancel_tx, _) = watch::channel(false);
        Self {
            reader: Some(Box::new(reader)),
            writer: Some(Box::new(writer)),
            incoming_tx: Some(incoming_tx),
            incoming_rx,
            outgoing_tx,
            outgoing_rx: Some(outgoing_rx),
            cancel_tx: Arc::new(cancel_tx),
        }
    }

    /// Start the ingress and egress workers. Returns immediately.
    pub fn bind(&mut self) {
        let (Some(mut reader), Some(mut writer), Some(incoming_tx), Some(mut outgoing_rx)) = (
            self.reader.take(),
            self.writer.take(),
            self.incoming_tx.take(),
            self.outgoing_rx.take(),
        ) else {
            log::warn!("device is already bound");
            return;
        };

        let mut ingress_cancel = self.cancel_tx.subscribe();
        tokio::spawn(async move {
            loop {
                let mut buf = vec![0u8; PACKET_SIZE];
                tokio::select! {
                    _ = ingress_cancel.changed() => {
                        log::debug!("tun ingress: shutting down");
                        return;
                    }
                    read = reader.read(&mut buf) => match read {
                        Ok(0) => {
                            log::info!("tun ingress: channel closed");
                            return;
                        }
                        Ok(n) => {
                            if incoming_tx.send(Packet::new(buf, n)).await.is_err() {
                                return;
                            }
                        }
                        // Transient failure: never enqueue the buffer, read
                        // again with a fresh one.
                        Err(e) => log::warn!("tun read error: {e}"),
                    }
                }
            }
        });

        let mut egress_cancel = self.cancel_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = egress_cancel.changed() => {
                        log::debug!("tun egress: shutting down");
                        return;
                    }
                    pkt = outgoing_rx.recv() => {
                        let Some(pkt) = pkt else { return };
                        if let Err(e) = writer.write(pkt.bytes()).await {
                            log::warn!("tun write error: {e}");
                        }
                    }
                }
            }
        });
    }

    /// Next raw datagram read from the kernel.
    pub async fn read_packet(&mut self) -> Result<Packet, StackError> {
        self.incoming_rx.recv().await.ok_or(StackError::DeviceClosed)
    }

    /// Enqueue a raw datagram for the kernel.
    pub async fn write_packet(&self, pkt: Packet) -> Result<(), StackError> {
        self.outgoing_tx
            .send(pkt)
            .await
            .map_err(|_| StackError::DeviceClosed)
    }

    /// Signal every worker in the stack to terminate.
    pub fn close(&self) {
        self.cancel_tx.send_replace(true);
    }

    /// Clonable handle for writing and closing after the device itself has
    /// been moved into the pipeline.
    pub fn handle(&self) -> DeviceHandle {
        DeviceHandle {
            outgoing_tx: self.outgoing_tx.clone(),
            cancel_tx: Arc::clone(&self.cancel_tx),
        }
    }

    /// The cancellation signal shared by all stack workers.
    pub(crate) fn cancellation(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }
}

// ---------------------------------------------------------------------------
// DeviceHandle
// ---------------------------------------------------------------------------

/// Clonable handle to a running [`NetDevice`].
#[derive(Clone)]
pub struct DeviceHandle {
    outgoing_tx: mpsc::Sender<Packet>,
    cancel_tx: Arc<watch::Sender<bool>>,
}

impl DeviceHandle {
    /// Enqueue a raw datagram for the kernel.
    pub async fn write_packet(&self, pkt: Packet) -> Result<(), StackError> {
        self.outgoing_tx
            .send(pkt)
            .await
            .map_err(|_| StackError::DeviceClosed)
    }

    /// Signal every worker in the stack to terminate.
    pub fn close(&self) {
        self.cancel_tx.send_replace(true);
    }
}
