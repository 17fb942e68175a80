//! Device orchestration.
//!
//! The orchestrator is an actor owning everything that has to agree about
//! the bound device: the advertisement reconciler, the AAP session, the
//! user's preferences and the edge-triggered behaviours (lid, ear
//! detection, conversational awareness ducking) built on top of them.
//! All inputs arrive as commands on one inbox, so none of that state needs
//! a lock.

use std::sync::Arc;

use bluer::Address;
use futures::StreamExt;
use log::{debug, error, info, trace, warn};
use serde_json::json;
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time::{self, Instant},
};

use crate::{
   airpods::{
      advertisement::Advertisement,
      model::Model,
      protocol::{EarStatus, NoiseControlMode, SpeakingLevel},
      reconciler::{StateReconciler, UpdateEvent},
      session::{AapSession, ConnectionSnapshot, SessionOptions},
      state::DeviceState,
   },
   bluetooth::{directory::DeviceDirectory, scanner::ScanEvent, transport::TransportStrategy},
   config::{CA_VOLUME_MAX, CA_VOLUME_MIN, Config},
   error::{PodError, Result},
   event::{ChannelBus, Event, EventSender},
   media::MediaControl,
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 64;

/// Suffix some platforms append to accessory names.
const FIND_MY_SUFFIX: &str = " - Find My";

/// A user request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
   SetNoiseControl(NoiseControlMode),
   SetConversationalAwareness(bool),
   SetConversationalAwarenessVolume(u8),
   SetPersonalizedVolume(bool),
   SetLoudSoundReduction(bool),
   SetAdaptiveTransparencyLevel(u8),
   SetAdaptiveNoiseLevel(u8),
   SetOffEarPause(bool),
   SetAutomaticEarDetection(bool),
   SetRssiMin(i16),
   StartHeadTracking,
   StopHeadTracking,
   RequestSettings,
}

/// Everything the UI may want to show at once.
#[derive(Debug, Clone)]
pub struct Status {
   pub bound_device: Option<Address>,
   pub device_connected: bool,
   pub scanner_available: bool,
   pub state: Option<DeviceState>,
   pub aap: ConnectionSnapshot,
   pub preferences: Config,
}

impl Status {
   pub fn to_json(&self) -> serde_json::Value {
      json!({
         "bound_device": self.bound_device.map(|a| a.to_string()),
         "device_connected": self.device_connected,
         "scanner_available": self.scanner_available,
         "state": self.state.as_ref().map(DeviceState::to_json),
         "aap": self.aap.to_json(),
         "preferences": serde_json::to_value(&self.preferences).unwrap_or_default(),
      })
   }
}

/// Platform services the orchestrator drives.
pub struct Collaborators {
   pub directory: Arc<dyn DeviceDirectory>,
   pub media: Arc<dyn MediaControl>,
   /// Tried in order when opening an AAP session.
   pub transports: Vec<Arc<dyn TransportStrategy>>,
   pub session_options: SessionOptions,
}

#[derive(Debug)]
enum Command {
   // User commands
   Bind(Option<Address>, oneshot::Sender<Result<()>>),
   Intent(Intent, oneshot::Sender<Result<()>>),
   GetStatus(oneshot::Sender<Status>),
   Shutdown(oneshot::Sender<()>),

   // Loopback
   DeviceConnectionChanged { generation: u64, connected: bool },
   AapConnectFinished { generation: u64, connected: bool },
   Session(Event),
}

/// Handle to the orchestrator actor.
#[derive(Clone)]
pub struct Orchestrator {
   inbox: mpsc::Sender<Command>,
}

impl Orchestrator {
   pub fn spawn(
      config: Config,
      events: EventSender,
      collaborators: Collaborators,
      scan_rx: mpsc::Receiver<ScanEvent>,
   ) -> Self {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      tokio::spawn(OrchestratorActor::new(config, events, collaborators, command_rx, scan_rx).run());
      Self { inbox: command_tx }
   }

   async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(make(tx))
         .await
         .map_err(|_| PodError::ManagerShutdown)?;
      rx.await.map_err(|_| PodError::ManagerShutdown)
   }

   /// Follows `address`, or nothing with `None`.
   pub async fn bind(&self, address: Option<Address>) -> Result<()> {
      self.request(|tx| Command::Bind(address, tx)).await?
   }

   pub async fn apply(&self, intent: Intent) -> Result<()> {
      self.request(|tx| Command::Intent(intent, tx)).await?
   }

   pub async fn status(&self) -> Result<Status> {
      self.request(Command::GetStatus).await
   }

   /// Disconnects everything and stops the actor.
   pub async fn shutdown(&self) -> Result<()> {
      self.request(Command::Shutdown).await
   }
}

struct BoundDevice {
   address: Address,
   model_override: Option<Model>,
   name: Option<SmolStr>,
   watch: Option<JoinHandle<()>>,
}

struct OrchestratorActor {
   config: Config,
   events: EventSender,
   directory: Arc<dyn DeviceDirectory>,
   media: Arc<dyn MediaControl>,
   session: AapSession,
   reconciler: StateReconciler,
   command_rx: mpsc::Receiver<Command>,
   loopback_rx: mpsc::UnboundedReceiver<Command>,
   loopback_tx: mpsc::UnboundedSender<Command>,
   scan_rx: mpsc::Receiver<ScanEvent>,

   // State
   bound: Option<BoundDevice>,
   bind_generation: u64,
   device_connected: bool,
   scanner_available: bool,
   aap_pending: bool,
   published: Option<DeviceState>,
}

impl OrchestratorActor {
   fn new(
      config: Config,
      events: EventSender,
      collaborators: Collaborators,
      command_rx: mpsc::Receiver<Command>,
      scan_rx: mpsc::Receiver<ScanEvent>,
   ) -> Self {
      let (loopback_tx, loopback_rx) = mpsc::unbounded_channel();
      let session = AapSession::new(
         collaborators.transports,
         ChannelBus::new(loopback_tx.clone(), Command::Session),
         collaborators.session_options,
      );
      Self {
         reconciler: StateReconciler::new(config.rssi_min, config.reconciler),
         config,
         events,
         directory: collaborators.directory,
         media: collaborators.media,
         session,
         command_rx,
         loopback_rx,
         loopback_tx,
         scan_rx,
         bound: None,
         bind_generation: 0,
         device_connected: false,
         scanner_available: false,
         aap_pending: false,
         published: None,
      }
   }

   async fn run(mut self) {
      info!("Orchestrator starting up");
      loop {
         let deadline = self.reconciler.next_deadline();
         select! {
            cmd = self.command_rx.recv() => {
               let Some(cmd) = cmd else {
                  info!("Orchestrator shutting down");
                  self.cleanup().await;
                  break;
               };
               if !self.handle_command(cmd).await {
                  break;
               }
            }
            Some(cmd) = self.loopback_rx.recv() => {
               self.handle_command(cmd).await;
            }
            Some(event) = self.scan_rx.recv() => {
               self.handle_scan_event(event).await;
            }
            () = sleep_until(deadline) => {
               self.poll_timers();
            }
         }
      }
   }

   async fn handle_command(&mut self, cmd: Command) -> bool {
      match cmd {
         Command::Bind(address, reply) => {
            let result = self.bind(address).await;
            let _ = reply.send(result);
         },
         Command::Intent(intent, reply) => {
            let result = self.apply_intent(intent).await;
            if let Err(e) = &result {
               warn!("{intent:?} failed: {e}");
            }
            let _ = reply.send(result);
         },
         Command::GetStatus(reply) => {
            let _ = reply.send(self.status());
         },
         Command::Shutdown(reply) => {
            self.cleanup().await;
            let _ = reply.send(());
            return false;
         },
         Command::DeviceConnectionChanged { generation, connected } => {
            if generation == self.bind_generation {
               self.on_connection_changed(connected).await;
            }
         },
         Command::AapConnectFinished { generation, connected } => {
            self.aap_pending = false;
            let stale = generation != self.bind_generation;
            if connected && stale {
               info!("Dropping AAP session opened for a previous binding");
               self.session.disconnect().await;
            } else if connected && !self.device_connected {
               info!("Dropping AAP session, device disconnected while it was opening");
               self.session.disconnect().await;
            }
            if stale && self.device_connected {
               self.connect_aap();
            }
         },
         Command::Session(event) => {
            self.handle_session_event(event).await;
         },
      }
      true
   }

   fn status(&self) -> Status {
      Status {
         bound_device: self.bound.as_ref().map(|b| b.address),
         device_connected: self.device_connected,
         scanner_available: self.scanner_available,
         state: self.published.clone(),
         aap: self.session.snapshot(),
         preferences: self.config.clone(),
      }
   }

   // === Binding ===

   async fn bind(&mut self, address: Option<Address>) -> Result<()> {
      if let Some(watch) = self.bound.take().and_then(|b| b.watch) {
         watch.abort();
      }
      self.bind_generation += 1;
      self.device_connected = false;
      self.reset_state();
      self.session.disconnect().await;

      let bound_device = address.map(|a| a.to_string());
      if self.config.bound_device != bound_device {
         self.config.bound_device = bound_device;
         self.preferences_changed();
      }

      let Some(address) = address else {
         info!("Unbind device.");
         return Ok(());
      };
      info!("Bind a new device: {address}");

      let Some(info) = self.directory.lookup(address).await else {
         error!("Find device by address failed: {address}");
         return Err(PodError::DeviceNotFound(address));
      };
      let model_override = info.model_hint();
      if let Some(model) = model_override {
         info!("{address}: Platform metadata says {model}, using it as model override");
      }

      let watch = match self.directory.watch_connection(address).await {
         Ok(mut changes) => {
            let loopback = self.loopback_tx.clone();
            let generation = self.bind_generation;
            Some(tokio::spawn(async move {
               while let Some(connected) = changes.next().await {
                  if loopback
                     .send(Command::DeviceConnectionChanged { generation, connected })
                     .is_err()
                  {
                     break;
                  }
               }
            }))
         },
         Err(e) => {
            warn!("{address}: Cannot watch connection state: {e}");
            None
         },
      };

      self.bound = Some(BoundDevice {
         address,
         model_override,
         name: info.name.as_deref().and_then(display_name_from_device),
         watch,
      });
      self.on_connection_changed(info.connected).await;
      Ok(())
   }

   async fn on_connection_changed(&mut self, connected: bool) {
      let was_connected = self.device_connected;
      self.device_connected = connected;
      info!("Bound device connection: {was_connected} -> {connected}");

      if was_connected && !connected {
         self.reset_state();
         self.session.disconnect().await;
      }
      if !was_connected && connected {
         self.connect_aap();
      }
   }

   /// Starts an AAP connect in the background if the model supports it.
   fn connect_aap(&mut self) {
      let Some(bound) = &self.bound else {
         warn!("ConnectAAP: No bound device");
         return;
      };
      if self.session.is_connected() || self.aap_pending {
         debug!("ConnectAAP: Already connected or connecting");
         return;
      }

      let mut model = self
         .reconciler
         .current_state()
         .map_or(Model::Unknown, |s| s.model);
      if !model.is_known()
         && let Some(model_override) = bound.model_override
      {
         model = model_override;
      }
      if !model.supports_noise_control() {
         info!("ConnectAAP: {model} does not support noise control");
         return;
      }

      let address = bound.address;
      let generation = self.bind_generation;
      let session = self.session.clone();
      let loopback = self.loopback_tx.clone();
      self.aap_pending = true;
      info!("{address}: Attempting AAP connection for {model}");
      tokio::spawn(async move {
         let connected = match session.connect(address).await {
            Ok(kind) => {
               info!("{address}: AAP connection established over {kind}");
               true
            },
            Err(e) => {
               warn!("{address}: AAP connection failed - noise control will not be available: {e}");
               false
            },
         };
         let _ = loopback.send(Command::AapConnectFinished { generation, connected });
      });
   }

   // === Advertisements ===

   async fn handle_scan_event(&mut self, event: ScanEvent) {
      match event {
         ScanEvent::Advertisement(record) => {
            if !Advertisement::is_desired(&record) {
               return;
            }
            let Some(adv) = Advertisement::decode(&record) else {
               return;
            };
            trace!(
               "Advertisement received. Data: {}, RSSI: {}",
               hex::encode(adv.desensitized()),
               adv.rssi()
            );
            if !self.device_connected {
               trace!("Advertisement received, but device disconnected.");
               return;
            }
            let observed_at = adv.timestamp();
            if let Some(update) = self.reconciler.on_advertisement(adv, observed_at) {
               self.on_state_changed(update).await;
            }
         },
         ScanEvent::Availability(available) => {
            if self.scanner_available != available {
               if available {
                  info!("Advertisement scanner started");
               } else {
                  warn!("Advertisement scanner stopped");
               }
               self.scanner_available = available;
               self.events.emit(Event::ScannerAvailability(available));
            }
         },
      }
   }

   fn poll_timers(&mut self) {
      if self.reconciler.poll_timers(Instant::now()) {
         info!("Device is lost");
         self.published = None;
         self.events.emit(Event::DeviceLost);
      }
   }

   /// Drops reconciler state, telling the UI if anything was shown.
   fn reset_state(&mut self) {
      let had_state = self.reconciler.disconnect();
      let was_published = self.published.take().is_some();
      if had_state || was_published {
         self.events.emit(Event::DeviceLost);
      }
   }

   fn decorate(&self, mut state: DeviceState) -> DeviceState {
      if !state.model.is_known()
         && let Some(model) = self.bound.as_ref().and_then(|b| b.model_override)
      {
         state.model = model;
      }
      state.display_name = self
         .bound
         .as_ref()
         .and_then(|b| b.name.clone())
         .unwrap_or_else(|| SmolStr::new_static(state.model.display_name()));
      state.settings = self.session.settings();
      state
   }

   fn publish(&mut self, new: DeviceState) -> Option<DeviceState> {
      let old = self.published.replace(new.clone());
      self.events.emit(Event::StateChanged { old: old.clone(), new });
      old
   }

   async fn on_state_changed(&mut self, update: UpdateEvent) {
      let new = self.decorate(update.new);
      let old = self.publish(new.clone());

      if self.device_connected
         && !self.session.is_connected()
         && new.model.supports_noise_control()
      {
         self.connect_aap();
      }

      let lid_opened = new.is_lid_open_with_pods();
      let lid_switched = match &old {
         None => lid_opened,
         Some(old) => old.is_lid_open_with_pods() != lid_opened,
      };
      if lid_switched {
         info!("Case lid {}", if lid_opened { "opened" } else { "closed" });
         self.events.emit(Event::LidChanged(lid_opened));
      }

      if let Some(old) = &old {
         let both_in_ear = new.pods.both_in_ear();
         if old.pods.both_in_ear() != both_in_ear {
            self.on_both_in_ear(both_in_ear).await;
         }
      }
   }

   async fn on_both_in_ear(&self, both_in_ear: bool) {
      if !self.config.automatic_ear_detection {
         info!("automatic_ear_detection: Do nothing because it is disabled. ({both_in_ear})");
         return;
      }
      if both_in_ear {
         self.media.play().await;
      } else {
         self.media.pause().await;
      }
   }

   // === AAP ===

   async fn handle_session_event(&mut self, event: Event) {
      match &event {
         Event::AapConnected(_) => {
            info!("AAP connection established - noise control available");
            if self.config.conversational_awareness
               && let Err(e) = self.session.set_conversational_awareness(true).await
            {
               warn!("Failed to apply conversational awareness preference: {e}");
            }
         },
         Event::AapDisconnected => {
            info!("AAP connection lost - noise control unavailable");
            self.refresh_overlay();
         },
         Event::SettingChanged(value) => {
            info!("{} changed to {value:?}", value.kind());
            self.refresh_overlay();
         },
         Event::SpeakingLevel(level) => self.on_speaking_level(*level).await,
         Event::EarDetection { primary, secondary } => {
            self.on_ear_detection(*primary, *secondary).await;
         },
         Event::HeadTracking(sample) => trace!("Head tracking: {sample:?}"),
         _ => {},
      }
      self.events.emit(event);
   }

   /// Re-publishes the state when the AAP settings overlay changed.
   fn refresh_overlay(&mut self) {
      let Some(published) = &self.published else {
         return;
      };
      let settings = self.session.settings();
      if published.settings == settings {
         return;
      }
      let mut new = published.clone();
      new.settings = settings;
      self.publish(new);
   }

   async fn on_speaking_level(&self, level: SpeakingLevel) {
      if !self.config.conversational_awareness {
         return;
      }
      match level {
         SpeakingLevel::StartedSpeaking => {
            let percent = self
               .config
               .conversational_awareness_volume_percent
               .clamp(CA_VOLUME_MIN, CA_VOLUME_MAX);
            info!("User started speaking - reducing media volume to {percent}%");
            self.media.duck(percent).await;
         },
         SpeakingLevel::StoppedSpeaking | SpeakingLevel::NormalVolume => {
            info!("User stopped speaking - restoring media volume");
            self.media.restore().await;
         },
         SpeakingLevel::Intermediate(raw) => {
            info!("Intermediate speaking level {raw:#04x} detected - restoring media volume");
            self.media.restore().await;
         },
      }
   }

   async fn on_ear_detection(&self, primary: EarStatus, secondary: EarStatus) {
      info!("Ear detection changed - Primary: {primary}, Secondary: {secondary}");
      if !self.config.automatic_ear_detection {
         return;
      }
      if primary != EarStatus::InEar && secondary != EarStatus::InEar {
         info!("Both pods out of ear - pausing media");
         self.media.pause().await;
      }
   }

   // === Intents ===

   fn preferences_changed(&mut self) {
      self.config.normalize();
      self
         .events
         .emit(Event::PreferencesChanged(Box::new(self.config.clone())));
   }

   async fn apply_intent(&mut self, intent: Intent) -> Result<()> {
      let connected = self.session.is_connected();
      match intent {
         Intent::SetNoiseControl(mode) => self.session.set_noise_control(mode).await,
         Intent::SetAdaptiveNoiseLevel(level) => self.session.set_adaptive_noise_level(level).await,
         Intent::SetOffEarPause(enable) => self.session.set_off_ear_pause(enable).await,
         Intent::StartHeadTracking => self.session.start_head_tracking().await,
         Intent::StopHeadTracking => self.session.stop_head_tracking().await,
         Intent::RequestSettings => self.session.request_settings().await,
         Intent::SetConversationalAwareness(enable) => {
            self.config.conversational_awareness = enable;
            self.preferences_changed();
            if connected {
               self.session.set_conversational_awareness(enable).await?;
            }
            Ok(())
         },
         Intent::SetConversationalAwarenessVolume(percent) => {
            self.config.conversational_awareness_volume_percent = percent;
            self.preferences_changed();
            info!(
               "Conversational awareness volume percent changed to {}%",
               self.config.conversational_awareness_volume_percent
            );
            Ok(())
         },
         Intent::SetPersonalizedVolume(enable) => {
            self.config.personalized_volume = enable;
            self.preferences_changed();
            if connected {
               self.session.set_personalized_volume(enable).await?;
            }
            Ok(())
         },
         Intent::SetLoudSoundReduction(enable) => {
            self.config.loud_sound_reduction = enable;
            self.preferences_changed();
            if connected {
               self.session.set_loud_sound_reduction(enable).await?;
            }
            Ok(())
         },
         Intent::SetAdaptiveTransparencyLevel(level) => {
            self.config.adaptive_transparency_level = level;
            self.preferences_changed();
            if connected {
               self.session.set_adaptive_transparency_level(level).await?;
            }
            Ok(())
         },
         Intent::SetAutomaticEarDetection(enable) => {
            self.config.automatic_ear_detection = enable;
            self.preferences_changed();
            Ok(())
         },
         Intent::SetRssiMin(rssi_min) => {
            self.config.rssi_min = rssi_min;
            self.reconciler.set_rssi_min(rssi_min);
            self.preferences_changed();
            Ok(())
         },
      }
   }

   async fn cleanup(&mut self) {
      info!("Cleaning up orchestrator");
      if let Some(watch) = self.bound.take().and_then(|b| b.watch) {
         watch.abort();
      }
      self.session.disconnect().await;
   }
}

async fn sleep_until(deadline: Option<Instant>) {
   match deadline {
      Some(deadline) => time::sleep_until(deadline).await,
      None => std::future::pending().await,
   }
}

/// Name to show for a paired device, if its own name is usable.
fn display_name_from_device(name: &str) -> Option<SmolStr> {
   if name.contains("Bluetooth") {
      return None;
   }
   let name = name.strip_suffix(FIND_MY_SUFFIX).unwrap_or(name).trim();
   (!name.is_empty()).then(|| SmolStr::new(name))
}

#[cfg(test)]
mod tests {
   use std::{
      sync::atomic::{AtomicUsize, Ordering},
      time::Duration,
   };

   use async_trait::async_trait;
   use futures::stream::BoxStream;
   use parking_lot::Mutex;
   use tokio::sync::Semaphore;

   use super::*;
   use crate::{
      airpods::{
         advertisement::tests::{payload, record},
         protocol::PKT_HANDSHAKE,
         session::{
            Phase,
            tests::{MockLink, MockStrategy, options},
         },
         state::Side,
      },
      bluetooth::{
         directory::DeviceInfo,
         transport::{Link, TransportKind},
      },
   };

   const ADDR: Address = Address([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x01]);
   const BROADCAST: Address = Address([0x4a, 0x11, 0x22, 0x33, 0x44, 0x55]);
   const AIRPODS_2: u16 = 0x200F;
   const AIRPODS_PRO_2: u16 = 0x2014;
   const IN_EAR_BOTH: u8 = 0x02 | 0x08;
   const BOTH_IN_CASE: u8 = 0x04;

   struct FakeDirectory {
      info: DeviceInfo,
      changes: Mutex<Option<futures::channel::mpsc::UnboundedSender<bool>>>,
   }

   impl FakeDirectory {
      fn new(name: &str, product_id: u16, connected: bool) -> Arc<Self> {
         Arc::new(Self {
            info: DeviceInfo {
               address: ADDR,
               name: Some(name.into()),
               model_number: None,
               vendor_id: Some(crate::bluetooth::directory::APPLE_VENDOR_ID),
               product_id: Some(product_id),
               connected,
            },
            changes: Mutex::new(None),
         })
      }

      fn set_connected(&self, connected: bool) {
         if let Some(tx) = self.changes.lock().as_ref() {
            tx.unbounded_send(connected).unwrap();
         }
      }
   }

   #[async_trait]
   impl DeviceDirectory for FakeDirectory {
      async fn lookup(&self, address: Address) -> Option<DeviceInfo> {
         (address == self.info.address).then(|| self.info.clone())
      }

      async fn watch_connection(&self, _address: Address) -> Result<BoxStream<'static, bool>> {
         let (tx, rx) = futures::channel::mpsc::unbounded();
         *self.changes.lock() = Some(tx);
         Ok(rx.boxed())
      }

      async fn paired_accessories(&self) -> Vec<DeviceInfo> {
         vec![self.info.clone()]
      }
   }

   #[derive(Debug, Clone, Copy, PartialEq, Eq)]
   enum MediaCall {
      Play,
      Pause,
      Duck(u8),
      Restore,
   }

   #[derive(Default)]
   struct RecordingMedia {
      calls: Mutex<Vec<MediaCall>>,
   }

   impl RecordingMedia {
      fn calls(&self) -> Vec<MediaCall> {
         self.calls.lock().clone()
      }
   }

   #[async_trait]
   impl MediaControl for RecordingMedia {
      async fn play(&self) {
         self.calls.lock().push(MediaCall::Play);
      }

      async fn pause(&self) {
         self.calls.lock().push(MediaCall::Pause);
      }

      async fn duck(&self, percent: u8) {
         self.calls.lock().push(MediaCall::Duck(percent));
      }

      async fn restore(&self) {
         self.calls.lock().push(MediaCall::Restore);
      }
   }

   /// Hands out its link only as permits are added.
   struct GatedStrategy {
      gate: Semaphore,
      link: Arc<MockLink>,
      attempts: AtomicUsize,
   }

   impl GatedStrategy {
      fn new(link: Arc<MockLink>) -> Arc<Self> {
         Arc::new(Self {
            gate: Semaphore::new(0),
            link,
            attempts: AtomicUsize::new(0),
         })
      }

      fn open(&self) {
         self.gate.add_permits(1);
      }

      fn attempts(&self) -> usize {
         self.attempts.load(Ordering::Acquire)
      }
   }

   #[async_trait]
   impl TransportStrategy for GatedStrategy {
      fn name(&self) -> &'static str {
         "gated"
      }

      fn kind(&self) -> TransportKind {
         TransportKind::StandardChannel
      }

      async fn attempt(&self, _address: Address) -> Result<Arc<dyn Link>> {
         self.attempts.fetch_add(1, Ordering::AcqRel);
         self.gate.acquire().await.unwrap().forget();
         Ok(self.link.clone())
      }
   }

   struct Harness {
      orchestrator: Orchestrator,
      events: mpsc::UnboundedReceiver<Event>,
      scan: mpsc::Sender<ScanEvent>,
      directory: Arc<FakeDirectory>,
      media: Arc<RecordingMedia>,
   }

   impl Harness {
      fn new(
         config: Config,
         directory: Arc<FakeDirectory>,
         transports: Vec<Arc<dyn TransportStrategy>>,
      ) -> Self {
         let (event_tx, events) = mpsc::unbounded_channel();
         let (scan, scan_rx) = mpsc::channel(16);
         let media = Arc::new(RecordingMedia::default());
         let orchestrator = Orchestrator::spawn(
            config,
            ChannelBus::new(event_tx, std::convert::identity),
            Collaborators {
               directory: directory.clone(),
               media: media.clone(),
               transports,
               session_options: options(),
            },
            scan_rx,
         );
         Self {
            orchestrator,
            events,
            scan,
            directory,
            media,
         }
      }

      async fn advertise(&self, side: Side, model_id: u16, left: u8, right: u8, status: u8) {
         let data = payload(side, model_id, left, right, 5, status);
         self
            .scan
            .send(ScanEvent::Advertisement(record(BROADCAST, -50, data)))
            .await
            .unwrap();
      }

      async fn advertise_raw(&self, data: Vec<u8>) {
         self
            .scan
            .send(ScanEvent::Advertisement(record(BROADCAST, -50, data)))
            .await
            .unwrap();
      }

      /// Waits for the next event matching `pick`, skipping others.
      async fn expect<T>(&mut self, mut pick: impl FnMut(Event) -> Option<T>) -> T {
         time::timeout(Duration::from_secs(2), async {
            loop {
               let event = self.events.recv().await.expect("bus closed");
               if let Some(found) = pick(event) {
                  return found;
               }
            }
         })
         .await
         .expect("expected event never arrived")
      }

      /// Drains events for a short while.
      async fn drain(&mut self) -> Vec<Event> {
         time::sleep(Duration::from_millis(100)).await;
         let mut events = Vec::new();
         while let Ok(event) = self.events.try_recv() {
            events.push(event);
         }
         events
      }

      async fn wait_for_media(&self, count: usize) -> Vec<MediaCall> {
         for _ in 0..100 {
            let calls = self.media.calls();
            if calls.len() >= count {
               return calls;
            }
            time::sleep(Duration::from_millis(10)).await;
         }
         self.media.calls()
      }

      async fn wait_for_phase(&self, phase: Phase) {
         for _ in 0..100 {
            if self.orchestrator.status().await.unwrap().aap.phase == phase {
               return;
            }
            time::sleep(Duration::from_millis(10)).await;
         }
         panic!("session never reached {phase:?}");
      }
   }

   fn state_changes(events: &[Event]) -> usize {
      events
         .iter()
         .filter(|e| matches!(e, Event::StateChanged { .. }))
         .count()
   }

   #[tokio::test]
   async fn merged_state_is_published_once() {
      let directory = FakeDirectory::new("Kim's AirPods - Find My", AIRPODS_2, true);
      let mut h = Harness::new(Config::default(), directory, Vec::new());
      h.orchestrator.bind(Some(ADDR)).await.unwrap();

      h.advertise(Side::Left, AIRPODS_2, 5, 7, 0).await;
      let (old, new) = h
         .expect(|e| match e {
            Event::StateChanged { old, new } => Some((old, new)),
            _ => None,
         })
         .await;
      assert!(old.is_none());
      assert_eq!(new.pods.left.battery.value(), Some(50));
      assert_eq!(new.pods.right.battery.value(), Some(70));
      assert_eq!(new.display_name, "Kim's AirPods");
      assert_eq!(new.model, Model::AirPods2);

      h.advertise(Side::Right, AIRPODS_2, 5, 7, 0).await;
      assert_eq!(state_changes(&h.drain().await), 0);

      let status = h.orchestrator.status().await.unwrap();
      assert_eq!(status.bound_device, Some(ADDR));
      assert!(status.device_connected);
      assert_eq!(status.state.map(|s| s.pods.right.battery.value()), Some(Some(70)));
   }

   #[tokio::test]
   async fn ignores_broadcasts_until_device_connects() {
      let directory = FakeDirectory::new("AirPods", AIRPODS_2, false);
      let mut h = Harness::new(Config::default(), directory, Vec::new());
      h.orchestrator.bind(Some(ADDR)).await.unwrap();

      h.advertise(Side::Left, AIRPODS_2, 5, 7, 0).await;
      assert_eq!(state_changes(&h.drain().await), 0);

      h.directory.set_connected(true);
      time::sleep(Duration::from_millis(50)).await;
      h.advertise(Side::Left, AIRPODS_2, 5, 7, 0).await;
      h.expect(|e| matches!(e, Event::StateChanged { .. }).then_some(()))
         .await;

      h.directory.set_connected(false);
      h.expect(|e| matches!(e, Event::DeviceLost).then_some(())).await;
      assert!(h.orchestrator.status().await.unwrap().state.is_none());
   }

   #[tokio::test]
   async fn lid_opening_is_edge_triggered() {
      let directory = FakeDirectory::new("Bluetooth Headset", AIRPODS_2, true);
      let mut h = Harness::new(Config::default(), directory, Vec::new());
      h.orchestrator.bind(Some(ADDR)).await.unwrap();

      let mut open = payload(Side::Left, AIRPODS_2, 5, 7, 5, BOTH_IN_CASE);
      open[8] = 0;
      h.advertise_raw(open.clone()).await;
      let name = h
         .expect(|e| match e {
            Event::StateChanged { new, .. } => Some(new.display_name),
            _ => None,
         })
         .await;
      assert_eq!(name, Model::AirPods2.display_name());
      assert!(h.expect(|e| match e {
         Event::LidChanged(opened) => Some(opened),
         _ => None,
      })
      .await);

      // Same lid state with a different battery: no new lid event.
      let mut open_again = payload(Side::Left, AIRPODS_2, 6, 7, 5, BOTH_IN_CASE);
      open_again[8] = 0;
      h.advertise_raw(open_again).await;
      let events = h.drain().await;
      assert_eq!(state_changes(&events), 1);
      assert!(!events.iter().any(|e| matches!(e, Event::LidChanged(_))));

      h.advertise(Side::Left, AIRPODS_2, 6, 7, BOTH_IN_CASE).await;
      assert!(!h.expect(|e| match e {
         Event::LidChanged(opened) => Some(opened),
         _ => None,
      })
      .await);
   }

   #[tokio::test]
   async fn both_in_ear_drives_playback_when_enabled() {
      let config = Config {
         automatic_ear_detection: true,
         ..Default::default()
      };
      let directory = FakeDirectory::new("AirPods", AIRPODS_2, true);
      let h = Harness::new(config, directory, Vec::new());
      h.orchestrator.bind(Some(ADDR)).await.unwrap();

      h.advertise(Side::Left, AIRPODS_2, 5, 7, 0).await;
      h.advertise(Side::Left, AIRPODS_2, 5, 7, IN_EAR_BOTH).await;
      h.advertise(Side::Left, AIRPODS_2, 5, 7, 0).await;
      assert_eq!(h.wait_for_media(2).await, [MediaCall::Play, MediaCall::Pause]);

      h.orchestrator
         .apply(Intent::SetAutomaticEarDetection(false))
         .await
         .unwrap();
      h.advertise(Side::Left, AIRPODS_2, 5, 7, IN_EAR_BOTH).await;
      time::sleep(Duration::from_millis(100)).await;
      assert_eq!(h.media.calls().len(), 2);
   }

   #[tokio::test]
   async fn speaking_level_ducks_media() {
      let config = Config {
         conversational_awareness: true,
         conversational_awareness_volume_percent: 40,
         ..Default::default()
      };
      let (link, feed) = MockLink::new(None);
      let strategy = MockStrategy::with_link(TransportKind::StandardChannel, link.clone());
      let directory = FakeDirectory::new("AirPods Pro", AIRPODS_PRO_2, true);
      let mut h = Harness::new(config, directory, vec![strategy.clone()]);
      h.orchestrator.bind(Some(ADDR)).await.unwrap();

      h.expect(|e| matches!(e, Event::AapConnected(_)).then_some(()))
         .await;
      assert_eq!(strategy.attempts(), 1);
      assert_eq!(link.sent()[0], PKT_HANDSHAKE);

      let speaking = |level: u8| vec![0x04, 0x00, 0x04, 0x00, 0x4b, 0x00, 0x02, 0x00, 0x01, level];
      feed.send(speaking(0x01)).unwrap();
      feed.send(speaking(0x05)).unwrap();
      feed.send(speaking(0x03)).unwrap();
      assert_eq!(
         h.wait_for_media(3).await,
         [MediaCall::Duck(40), MediaCall::Restore, MediaCall::Restore]
      );

      // Ear detection with both pods out pauses.
      h.orchestrator
         .apply(Intent::SetAutomaticEarDetection(true))
         .await
         .unwrap();
      feed.send(vec![0x04, 0x00, 0x04, 0x00, 0x06, 0x00, 0x01, 0x02]).unwrap();
      assert_eq!(h.wait_for_media(4).await[3], MediaCall::Pause);
      h.orchestrator.shutdown().await.unwrap();
   }

   #[tokio::test]
   async fn preferences_are_remembered_and_announced() {
      let directory = FakeDirectory::new("AirPods", AIRPODS_2, true);
      let mut h = Harness::new(Config::default(), directory, Vec::new());

      h.orchestrator
         .apply(Intent::SetConversationalAwarenessVolume(5))
         .await
         .unwrap();
      let config = h
         .expect(|e| match e {
            Event::PreferencesChanged(config) => Some(config),
            _ => None,
         })
         .await;
      assert_eq!(config.conversational_awareness_volume_percent, CA_VOLUME_MIN);

      // Preference toggles succeed without a session; device commands do not.
      h.orchestrator
         .apply(Intent::SetPersonalizedVolume(true))
         .await
         .unwrap();
      assert!(matches!(
         h.orchestrator
            .apply(Intent::SetNoiseControl(NoiseControlMode::Adaptive))
            .await,
         Err(PodError::NotConnected)
      ));
      let status = h.orchestrator.status().await.unwrap();
      assert!(status.preferences.personalized_volume);
      assert!(status.aap.address.is_none());
   }

   #[tokio::test]
   async fn unknown_device_cannot_be_bound() {
      let directory = FakeDirectory::new("AirPods", AIRPODS_2, true);
      let h = Harness::new(Config::default(), directory, Vec::new());
      let stranger = Address([9, 9, 9, 9, 9, 9]);
      assert!(matches!(
         h.orchestrator.bind(Some(stranger)).await,
         Err(PodError::DeviceNotFound(addr)) if addr == stranger
      ));
      assert_eq!(h.orchestrator.status().await.unwrap().bound_device, None);
   }

   #[tokio::test]
   async fn each_accepted_broadcast_publishes_one_state() {
      let directory = FakeDirectory::new("AirPods", AIRPODS_2, true);
      let mut h = Harness::new(Config::default(), directory, Vec::new());
      h.orchestrator.bind(Some(ADDR)).await.unwrap();

      h.advertise(Side::Left, AIRPODS_2, 5, 7, 0).await;
      assert_eq!(state_changes(&h.drain().await), 1);
      h.advertise(Side::Left, AIRPODS_2, 4, 7, 0).await;
      assert_eq!(state_changes(&h.drain().await), 1);
      h.advertise(Side::Right, AIRPODS_2, 4, 6, 0).await;
      assert_eq!(state_changes(&h.drain().await), 1);
   }

   #[tokio::test]
   async fn session_opened_after_device_left_is_dropped() {
      let (link, _feed) = MockLink::new(None);
      let strategy = GatedStrategy::new(link.clone());
      let directory = FakeDirectory::new("AirPods Pro", AIRPODS_PRO_2, true);
      let mut h = Harness::new(Config::default(), directory, vec![strategy.clone()]);
      h.orchestrator.bind(Some(ADDR)).await.unwrap();
      h.wait_for_phase(Phase::Connecting).await;

      h.directory.set_connected(false);
      time::sleep(Duration::from_millis(50)).await;
      assert!(!h.orchestrator.status().await.unwrap().device_connected);

      strategy.open();
      h.expect(|e| matches!(e, Event::AapDisconnected).then_some(()))
         .await;
      h.wait_for_phase(Phase::Disconnected).await;
      assert!(link.is_closed());
      assert_eq!(strategy.attempts(), 1);
   }

   #[tokio::test]
   async fn rebind_during_connect_retries_for_new_binding() {
      let (link, _feed) = MockLink::new(None);
      let strategy = GatedStrategy::new(link.clone());
      let directory = FakeDirectory::new("AirPods Pro", AIRPODS_PRO_2, true);
      let mut h = Harness::new(Config::default(), directory, vec![strategy.clone()]);
      h.orchestrator.bind(Some(ADDR)).await.unwrap();
      h.wait_for_phase(Phase::Connecting).await;

      h.orchestrator.bind(Some(ADDR)).await.unwrap();
      assert_eq!(strategy.attempts(), 1);

      // The first session belongs to the old binding and is torn down.
      strategy.open();
      h.expect(|e| matches!(e, Event::AapDisconnected).then_some(()))
         .await;
      for _ in 0..100 {
         if strategy.attempts() == 2 {
            break;
         }
         time::sleep(Duration::from_millis(10)).await;
      }
      assert_eq!(strategy.attempts(), 2);

      strategy.open();
      h.wait_for_phase(Phase::Connected).await;
      h.orchestrator.shutdown().await.unwrap();
   }

   #[test]
   fn device_names_are_cleaned_up() {
      assert_eq!(
         display_name_from_device("Sam's AirPods Pro - Find My").as_deref(),
         Some("Sam's AirPods Pro")
      );
      assert_eq!(display_name_from_device("Bluetooth Audio"), None);
      assert_eq!(display_name_from_device("   "), None);
   }
}
