//! BLE advertisement scanner.
//!
//! Runs BlueZ LE discovery and turns every device update carrying Apple
//! manufacturer data into an [`AdvertisementRecord`]. Adapter power changes
//! are reported too, so the UI can tell "no broadcasts" from "no radio".

use std::time::Duration;

use bluer::{
   Adapter, AdapterEvent, AdapterProperty, Address, DiscoveryFilter, DiscoveryTransport, Session,
};
use futures::StreamExt;
use log::{debug, info, trace, warn};
use tokio::{sync::mpsc, task::JoinHandle, time};

use crate::{
   airpods::advertisement::{APPLE_CID, AdvertisementRecord},
   bluetooth::directory::default_adapter,
   error::Result,
};

/// Delay before retrying after the adapter disappeared or failed.
const ADAPTER_RECOVERY_DELAY: Duration = Duration::from_secs(5);

/// Output of the scanner.
#[derive(Debug, Clone)]
pub enum ScanEvent {
   Advertisement(AdvertisementRecord),
   Availability(bool),
}

pub struct Scanner {
   session: Session,
   tx: mpsc::Sender<ScanEvent>,
}

impl Scanner {
   pub const fn new(session: Session, tx: mpsc::Sender<ScanEvent>) -> Self {
      Self { session, tx }
   }

   /// Runs until the receiving side goes away.
   pub fn spawn(self) -> JoinHandle<()> {
      tokio::spawn(self.run())
   }

   async fn run(self) {
      info!("Advertisement scanner starting up");
      let mut available = None;
      while !self.tx.is_closed() {
         let result = self.scan_once(&mut available).await;
         if let Err(e) = result {
            warn!("Scanner stopped: {e}");
         }
         self.set_available(&mut available, false).await;
         time::sleep(ADAPTER_RECOVERY_DELAY).await;
      }
      info!("Advertisement scanner shutting down");
   }

   async fn set_available(&self, current: &mut Option<bool>, available: bool) {
      if *current == Some(available) {
         return;
      }
      *current = Some(available);
      let _ = self.tx.send(ScanEvent::Availability(available)).await;
   }

   async fn scan_once(&self, available: &mut Option<bool>) -> Result<()> {
      let adapter = default_adapter(&self.session).await?;
      if !adapter.is_powered().await? {
         debug!("Adapter {} is powered off", adapter.name());
         return Ok(());
      }

      adapter
         .set_discovery_filter(DiscoveryFilter {
            transport: DiscoveryTransport::Le,
            duplicate_data: true,
            ..Default::default()
         })
         .await?;
      let mut events = adapter.discover_devices_with_changes().await?;
      info!("Scanning for advertisements on {}", adapter.name());
      self.set_available(available, true).await;

      while let Some(event) = events.next().await {
         match event {
            AdapterEvent::DeviceAdded(address) => {
               if let Some(record) = Self::read_record(&adapter, address).await
                  && self.tx.send(ScanEvent::Advertisement(record)).await.is_err()
               {
                  break;
               }
            },
            AdapterEvent::PropertyChanged(AdapterProperty::Powered(false)) => {
               info!("Adapter {} powered off", adapter.name());
               break;
            },
            _ => {},
         }
      }
      Ok(())
   }

   async fn read_record(adapter: &Adapter, address: Address) -> Option<AdvertisementRecord> {
      let device = adapter.device(address).ok()?;
      let manufacturer_data = device.manufacturer_data().await.ok().flatten()?;
      if !manufacturer_data.contains_key(&APPLE_CID) {
         return None;
      }
      let rssi = device.rssi().await.ok().flatten()?;
      trace!("Apple advertisement from {address} at {rssi} dBm");
      Some(AdvertisementRecord {
         address,
         rssi,
         timestamp: time::Instant::now(),
         manufacturer_data,
      })
   }
}
