//! L2CAP transport for the AAP control channel.
//!
//! The accessory listens on a fixed PSM. A sequential-packet socket keeps
//! packet boundaries and is tried first; some stacks only accept a stream
//! socket, which is used as the fallback.

use std::{net::Shutdown, sync::Arc, time::Duration};

use async_trait::async_trait;
use bluer::{
   Address, AddressType,
   l2cap::{SeqPacket, Socket, SocketAddr, Stream},
};
use log::{debug, warn};
use tokio::time;

use crate::{
   bluetooth::transport::{Link, StreamLink, TransportKind, TransportStrategy},
   error::{PodError, Result},
};

/// PSM (Protocol Service Multiplexer) for the AAP control channel
pub const PSM_CONTROL: u16 = 0x1001;

/// Link over a sequential-packet socket.
struct SeqPacketLink {
   socket: SeqPacket,
}

#[async_trait]
impl Link for SeqPacketLink {
   async fn send(&self, data: &[u8]) -> Result<()> {
      self.socket.send(data).await?;
      Ok(())
   }

   async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
      Ok(self.socket.recv(buf).await?)
   }

   async fn close(&self) {
      if let Err(e) = self.socket.shutdown(Shutdown::Both) {
         debug!("L2CAP shutdown failed: {e}");
      }
   }
}

/// Connects to the control PSM, message mode first.
pub struct L2capStrategy {
   psm: u16,
   connect_timeout: Duration,
}

impl L2capStrategy {
   pub const fn new(connect_timeout: Duration) -> Self {
      Self {
         psm: PSM_CONTROL,
         connect_timeout,
      }
   }

   async fn connect_seq_packet(&self, addr: SocketAddr) -> Result<Arc<dyn Link>> {
      let socket = Socket::new_seq_packet()?;
      let socket = time::timeout(self.connect_timeout, socket.connect(addr))
         .await
         .map_err(|_| PodError::RequestTimeout)??;
      Ok(Arc::new(SeqPacketLink { socket }))
   }

   async fn connect_stream(&self, addr: SocketAddr) -> Result<Arc<dyn Link>> {
      let stream = time::timeout(self.connect_timeout, Stream::connect(addr))
         .await
         .map_err(|_| PodError::RequestTimeout)??;
      Ok(Arc::new(StreamLink::new("l2cap-stream", stream)))
   }
}

#[async_trait]
impl TransportStrategy for L2capStrategy {
   fn name(&self) -> &'static str {
      "l2cap"
   }

   fn kind(&self) -> TransportKind {
      TransportKind::StandardChannel
   }

   async fn attempt(&self, address: Address) -> Result<Arc<dyn Link>> {
      let addr = SocketAddr::new(address, AddressType::BrEdr, self.psm);
      debug!("Connecting to {address}:{:#06x} (seqpacket)", self.psm);
      match self.connect_seq_packet(addr).await {
         Ok(link) => Ok(link),
         Err(e) => {
            warn!("L2CAP seqpacket to {address} failed: {e}, trying stream mode");
            self.connect_stream(addr).await
         },
      }
   }
}
