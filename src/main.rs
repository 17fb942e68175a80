//! podlink daemon.
//!
//! Follows one paired accessory: decodes its broadcasts, keeps an AAP
//! session open when the model supports it, and exposes the result on the
//! session bus.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{
   signal,
   sync::{Notify, mpsc},
   time,
};
use zbus::{Connection, connection, object_server::InterfaceRef};

use podlink::{
   airpods::session::SessionOptions,
   bluetooth::{
      directory::{BluezDirectory, DeviceDirectory, parse_address},
      driver::DriverStrategy,
      l2cap::L2capStrategy,
      rfcomm::RfcommStrategy,
      scanner::Scanner,
      transport::TransportStrategy,
   },
   config::Config,
   dbus::{OBJECT_PATH, PodlinkService, PodlinkServiceSignals, SERVICE_NAME},
   error::Result,
   event::{Event, EventBus},
   media::MprisController,
   orchestrator::{Collaborators, Orchestrator},
};

/// Advertisements buffered between the scanner and the orchestrator.
const SCAN_BUFFER_SIZE: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting podlink daemon...");

   let config = Config::load()?;
   info!(
      "Loaded configuration, bound device: {}",
      config.bound_device.as_deref().unwrap_or("none")
   );

   let bt = bluer::Session::new().await?;
   let connect_timeout = config.transport.connect_timeout();
   let transports: Vec<Arc<dyn TransportStrategy>> = vec![
      Arc::new(L2capStrategy::new(connect_timeout)),
      Arc::new(RfcommStrategy::new(bt.clone(), connect_timeout)),
      Arc::new(DriverStrategy::new(&config.transport, Some(bt.clone()))),
   ];
   let directory: Arc<dyn DeviceDirectory> = Arc::new(BluezDirectory::new(bt.clone()));
   let media = Arc::new(MprisController::new().await?);

   let (scan_tx, scan_rx) = mpsc::channel(SCAN_BUFFER_SIZE);
   let scanner = Scanner::new(bt.clone(), scan_tx).spawn();

   let bound = config.bound_device.as_deref().and_then(parse_address);
   let event_bus = EventProcessor::new();
   let orchestrator = Orchestrator::spawn(
      config.clone(),
      event_bus.clone(),
      Collaborators {
         directory: directory.clone(),
         media,
         transports,
         session_options: SessionOptions::from_config(&config.transport),
      },
      scan_rx,
   );

   let service = PodlinkService::new(orchestrator.clone(), directory.clone());
   let connection = connection::Builder::session()?
      .name(SERVICE_NAME)?
      .serve_at(OBJECT_PATH, service)?
      .build()
      .await?;

   info!("podlink D-Bus service started at {SERVICE_NAME}");

   event_bus.spawn_dispatcher(connection).await?;

   let bound = match bound {
      Some(address) => Some(address),
      None => {
         let mut paired = directory.paired_accessories().await;
         if paired.len() == 1 {
            info!("No bound device, following the only paired accessory");
            paired.pop().map(|d| d.address)
         } else {
            info!("No bound device ({} paired accessories found)", paired.len());
            None
         }
      },
   };
   if let Some(address) = bound
      && let Err(e) = orchestrator.bind(Some(address)).await
   {
      warn!("Failed to bind {address}: {e}");
   }

   signal::ctrl_c().await?;
   info!("Shutting down podlink daemon...");
   orchestrator.shutdown().await?;
   scanner.abort();

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<Event>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }

   async fn recv(self: &Arc<Self>) -> Option<Event> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(&self, iface: &InterfaceRef<PodlinkService>, event: Event) -> Result<()> {
      match event {
         Event::AapConnected(kind) => {
            iface.aap_connected(&kind.to_string()).await?;
         },
         Event::AapDisconnected => {
            iface.aap_disconnected().await?;
         },
         Event::SettingChanged(value) => {
            let json = serde_json::to_value(value).unwrap_or_default();
            iface
               .setting_changed(&value.kind().to_string(), &json.to_string())
               .await?;
         },
         Event::SpeakingLevel(level) => {
            iface.speaking_level_changed(&format!("{level:?}")).await?;
         },
         Event::EarDetection { primary, secondary } => {
            iface
               .ear_detection_changed(&primary.to_string(), &secondary.to_string())
               .await?;
         },
         Event::AapBattery(battery) => {
            iface.battery_updated(&battery.to_json().to_string()).await?;
         },
         Event::HeadTracking(sample) => {
            let json = serde_json::to_value(sample).unwrap_or_default();
            iface.head_tracking(&json.to_string()).await?;
         },
         Event::StateChanged { new, .. } => {
            iface.state_changed(&new.to_json().to_string()).await?;
         },
         Event::DeviceLost => {
            iface.device_lost().await?;
         },
         Event::LidChanged(opened) => {
            iface.lid_changed(opened).await?;
         },
         Event::ScannerAvailability(available) => {
            iface.scanner_availability_changed(available).await?;
         },
         Event::PreferencesChanged(config) => {
            if let Err(e) = config.save() {
               warn!("Failed to save configuration: {e}");
            }
            let json = serde_json::to_value(&*config).unwrap_or_default();
            iface.preferences_changed(&json.to_string()).await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, PodlinkService>(OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: Event) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}
