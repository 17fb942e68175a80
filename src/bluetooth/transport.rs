//! Transport capability interfaces.
//!
//! A [`TransportStrategy`] knows one way of reaching the accessory and
//! yields a [`Link`] on success. The AAP session tries its strategies in
//! order and only ever talks to the resulting link.

use std::sync::Arc;

use async_trait::async_trait;
use bluer::Address;
use log::debug;
use serde::Serialize;
use tokio::{
   io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
   sync::Mutex,
};

use crate::error::Result;

/// Which family of transport carries the active session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, strum::Display)]
pub enum TransportKind {
   #[default]
   None,
   StandardChannel,
   VendorFallback,
}

/// An open byte pipe carrying AAP framing.
#[async_trait]
pub trait Link: Send + Sync {
   /// Writes one packet.
   async fn send(&self, data: &[u8]) -> Result<()>;

   /// Reads the next packet into `buf`. `Ok(0)` means the peer closed.
   async fn recv(&self, buf: &mut [u8]) -> Result<usize>;

   /// Releases the underlying handle. Further calls fail.
   async fn close(&self);
}

/// One way of establishing a [`Link`].
#[async_trait]
pub trait TransportStrategy: Send + Sync {
   fn name(&self) -> &'static str;

   fn kind(&self) -> TransportKind;

   async fn attempt(&self, address: Address) -> Result<Arc<dyn Link>>;
}

/// A [`Link`] over any split async byte stream.
///
/// Each read is handed up as one packet.
pub struct StreamLink<T> {
   label: &'static str,
   reader: Mutex<ReadHalf<T>>,
   writer: Mutex<WriteHalf<T>>,
}

impl<T: AsyncRead + AsyncWrite + Send + 'static> StreamLink<T> {
   pub fn new(label: &'static str, io: T) -> Self {
      let (reader, writer) = tokio::io::split(io);
      Self {
         label,
         reader: Mutex::new(reader),
         writer: Mutex::new(writer),
      }
   }
}

#[async_trait]
impl<T: AsyncRead + AsyncWrite + Send + 'static> Link for StreamLink<T> {
   async fn send(&self, data: &[u8]) -> Result<()> {
      let mut writer = self.writer.lock().await;
      writer.write_all(data).await?;
      writer.flush().await?;
      Ok(())
   }

   async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
      Ok(self.reader.lock().await.read(buf).await?)
   }

   async fn close(&self) {
      if let Err(e) = self.writer.lock().await.shutdown().await {
         debug!("{}: shutdown failed: {e}", self.label);
      }
   }
}
