//! Vendor-driver fallback transport.
//!
//! When the standard channel cannot be negotiated, a kernel driver may
//! expose the AAP pipe as device nodes (`/dev/magicaap*`). Bytes written
//! to a node go to the accessory unchanged, and reads return whole
//! packets. Without the driver, a platform RFCOMM channel can still be
//! used if the device publishes the AAP service.

use std::{
   fs::File,
   io::{self, Read, Write},
   path::{Path, PathBuf},
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
   time::Duration,
};

use async_trait::async_trait;
use bluer::{Address, Session, rfcomm};
use log::{debug, info, warn};
use tokio::{
   fs::{self, OpenOptions},
   io::unix::AsyncFd,
   time,
};

use crate::{
   bluetooth::{
      directory::default_adapter,
      rfcomm::AAP_SERVICE_UUID,
      transport::{Link, StreamLink, TransportKind, TransportStrategy},
   },
   config::TransportConfig,
   error::{PodError, Result},
};

/// Writes to the driver are abandoned after this long.
const DRIVER_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Direct access to the driver's device nodes.
#[derive(Debug, Clone)]
pub struct DriverClient {
   device_dir: PathBuf,
   prefix: String,
}

impl DriverClient {
   pub fn new(device_dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
      Self {
         device_dir: device_dir.into(),
         prefix: prefix.into(),
      }
   }

   pub fn from_config(config: &TransportConfig) -> Self {
      Self::new(&config.driver_device_dir, &config.driver_device_prefix)
   }

   /// Lists the driver's device nodes in name order.
   pub async fn enumerate_devices(&self) -> Vec<PathBuf> {
      let mut entries = match fs::read_dir(&self.device_dir).await {
         Ok(entries) => entries,
         Err(e) => {
            debug!("Cannot list {}: {e}", self.device_dir.display());
            return Vec::new();
         },
      };
      let mut nodes = Vec::new();
      loop {
         match entries.next_entry().await {
            Ok(Some(entry)) => {
               if entry.file_name().to_string_lossy().starts_with(&self.prefix) {
                  nodes.push(entry.path());
               }
            },
            Ok(None) => break,
            Err(e) => {
               debug!("Stopped listing {}: {e}", self.device_dir.display());
               break;
            },
         }
      }
      nodes.sort();
      nodes
   }

   pub async fn is_driver_installed(&self) -> bool {
      !self.enumerate_devices().await.is_empty()
   }

   /// Picks the node whose name embeds `address`, else the first node.
   pub async fn select_node(&self, address: Address) -> Option<PathBuf> {
      let wanted = hex::encode(address.0);
      let nodes = self.enumerate_devices().await;
      let matching = nodes.iter().find(|path| {
         let Some(name) = path.file_name() else {
            return false;
         };
         let name = name.to_string_lossy().to_ascii_lowercase();
         let suffix = name.strip_prefix(&self.prefix).unwrap_or(&name);
         let digits: String = suffix.chars().filter(char::is_ascii_hexdigit).collect();
         digits.contains(&wanted)
      });
      matching.or_else(|| nodes.first()).cloned()
   }

   /// Opens `path` non-blocking so reads and writes can wait independently.
   pub async fn connect(&self, path: &Path) -> Result<DriverLink> {
      let file = OpenOptions::new()
         .read(true)
         .write(true)
         .custom_flags(libc::O_NONBLOCK)
         .open(path)
         .await?
         .into_std()
         .await;
      let fd = AsyncFd::new(file)?;
      info!("Opened vendor driver node {}", path.display());
      Ok(DriverLink {
         path: path.to_path_buf(),
         fd,
         closed: AtomicBool::new(false),
      })
   }

   pub async fn connect_first(&self) -> Result<DriverLink> {
      let path = self
         .enumerate_devices()
         .await
         .into_iter()
         .next()
         .ok_or(PodError::DriverNotFound)?;
      self.connect(&path).await
   }

   pub async fn connect_for(&self, address: Address) -> Result<DriverLink> {
      let path = self
         .select_node(address)
         .await
         .ok_or(PodError::DriverNotFound)?;
      self.connect(&path).await
   }
}

/// An open driver node.
///
/// A pending `recv` never holds up a `send`: each direction waits on its
/// own readiness.
pub struct DriverLink {
   path: PathBuf,
   fd: AsyncFd<File>,
   closed: AtomicBool,
}

impl DriverLink {
   pub fn path(&self) -> &Path {
      &self.path
   }

   fn check_open(&self) -> Result<()> {
      if self.closed.load(Ordering::Acquire) {
         return Err(PodError::ConnectionClosed);
      }
      Ok(())
   }

   async fn write_all(&self, mut data: &[u8]) -> Result<()> {
      while !data.is_empty() {
         self.check_open()?;
         let mut guard = self.fd.writable().await?;
         match guard.try_io(|inner| {
            let mut file = inner.get_ref();
            file.write(data)
         }) {
            Ok(Ok(0)) => return Err(PodError::ConnectionClosed),
            Ok(Ok(n)) => data = &data[n..],
            Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {},
            Ok(Err(e)) => return Err(PodError::SendFailure(e.to_string())),
            Err(_would_block) => {},
         }
      }
      Ok(())
   }
}

#[async_trait]
impl Link for DriverLink {
   async fn send(&self, data: &[u8]) -> Result<()> {
      time::timeout(DRIVER_WRITE_TIMEOUT, self.write_all(data))
         .await
         .map_err(|_| PodError::RequestTimeout)?
   }

   async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
      loop {
         self.check_open()?;
         let mut guard = self.fd.readable().await?;
         match guard.try_io(|inner| {
            let mut file = inner.get_ref();
            file.read(buf)
         }) {
            Ok(Ok(n)) => return Ok(n),
            Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {},
            Ok(Err(e)) => return Err(e.into()),
            Err(_would_block) => {},
         }
      }
   }

   async fn close(&self) {
      if !self.closed.swap(true, Ordering::AcqRel) {
         debug!("Closing {}", self.path.display());
      }
   }
}

/// Last-resort strategy: driver node, then platform RFCOMM channel.
pub struct DriverStrategy {
   client: DriverClient,
   session: Option<Session>,
   rfcomm_channel: Option<u8>,
   connect_timeout: Duration,
}

impl DriverStrategy {
   pub fn new(config: &TransportConfig, session: Option<Session>) -> Self {
      Self {
         client: DriverClient::from_config(config),
         session,
         rfcomm_channel: config.driver_rfcomm_channel,
         connect_timeout: config.connect_timeout(),
      }
   }

   async fn connect_platform_service(
      &self,
      session: &Session,
      address: Address,
      channel: u8,
   ) -> Result<Arc<dyn Link>> {
      let device = default_adapter(session).await?.device(address)?;
      let publishes_aap = device
         .uuids()
         .await?
         .is_some_and(|uuids| uuids.contains(&AAP_SERVICE_UUID));
      if !publishes_aap {
         return Err(PodError::DriverNotFound);
      }

      info!("Connecting to {address} on RFCOMM channel {channel}");
      let addr = rfcomm::SocketAddr::new(address, channel);
      let stream = time::timeout(self.connect_timeout, rfcomm::Stream::connect(addr))
         .await
         .map_err(|_| PodError::RequestTimeout)??;
      Ok(Arc::new(StreamLink::new("rfcomm-channel", stream)))
   }
}

#[async_trait]
impl TransportStrategy for DriverStrategy {
   fn name(&self) -> &'static str {
      "vendor-driver"
   }

   fn kind(&self) -> TransportKind {
      TransportKind::VendorFallback
   }

   async fn attempt(&self, address: Address) -> Result<Arc<dyn Link>> {
      if self.client.is_driver_installed().await {
         match self.client.connect_for(address).await {
            Ok(link) => return Ok(Arc::new(link)),
            Err(e) => warn!("Vendor driver node unusable: {e}"),
         }
      }
      if let (Some(session), Some(channel)) = (&self.session, self.rfcomm_channel) {
         return self
            .connect_platform_service(session, address, channel)
            .await;
      }
      Err(PodError::DriverNotFound)
   }
}
