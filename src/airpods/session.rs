//! AAP session management.
//!
//! An [`AapSession`] owns at most one live link to an accessory. It walks
//! the configured transports in order, runs the init sequence the firmware
//! expects, and keeps a receive loop running that turns notifications into
//! [`Event`]s. Teardown always happens in two phases: resources are moved
//! out of the state lock first, then closed and joined with no lock held.

use std::{
   sync::{
      Arc, Weak,
      atomic::{AtomicBool, Ordering},
   },
   time::Duration,
};

use bluer::Address;
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use serde_json::json;
use tokio::{task::JoinHandle, time};

use crate::{
   airpods::{
      parser::Notification,
      protocol::{
         ConversationalAwarenessState, LoudSoundReductionState, NoiseControlMode,
         PKT_HANDSHAKE, PKT_HEAD_TRACKING_START, PKT_HEAD_TRACKING_STOP, PKT_REQUEST_NOTIFY,
         PKT_REQUEST_SETTINGS, PKT_SET_FEATURES, PersonalizedVolumeState, Settings,
         build_adaptive_noise_level_packet, build_adaptive_transparency_level_packet,
         build_conversational_awareness_packet, build_loud_sound_reduction_packet,
         build_noise_control_packet, build_off_ear_pause_packet, build_personalized_volume_packet,
      },
   },
   bluetooth::transport::{Link, TransportKind, TransportStrategy},
   config::TransportConfig,
   error::{PodError, Result},
   event::{Event, EventSender},
};

const RECV_BUFFER_SIZE: usize = 1024;

/// Timing knobs for a session.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
   /// Pause between init packets.
   pub settle_delay: Duration,
   /// How long the receive loop waits for data before re-checking its stop flag.
   pub poll_interval: Duration,
   /// Upper bound on waiting for the receive loop during disconnect.
   pub join_timeout: Duration,
   pub write_timeout: Duration,
}

impl Default for SessionOptions {
   fn default() -> Self {
      Self {
         settle_delay: Duration::from_millis(100),
         poll_interval: Duration::from_secs(1),
         join_timeout: Duration::from_secs(3),
         write_timeout: Duration::from_secs(5),
      }
   }
}

impl SessionOptions {
   pub fn from_config(config: &TransportConfig) -> Self {
      Self {
         settle_delay: config.settle_delay(),
         ..Default::default()
      }
   }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
pub enum Phase {
   #[default]
   Disconnected,
   Connecting,
   Initializing,
   Connected,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSnapshot {
   pub phase: Phase,
   pub address: Option<Address>,
   pub transport: TransportKind,
   pub head_tracking: bool,
   pub settings: Settings,
}

impl ConnectionSnapshot {
   pub fn to_json(&self) -> serde_json::Value {
      json!({
         "phase": self.phase.to_string(),
         "address": self.address.map(|a| a.to_string()),
         "transport": self.transport,
         "head_tracking": self.head_tracking,
         "settings": self.settings.to_json(),
      })
   }
}

struct ReaderHandle {
   stop: Arc<AtomicBool>,
   task: JoinHandle<()>,
}

#[derive(Default)]
struct SessionState {
   phase: Phase,
   address: Option<Address>,
   transport: TransportKind,
   head_tracking: bool,
   settings: Settings,
   link: Option<Arc<dyn Link>>,
   reader: Option<ReaderHandle>,
   generation: u64,
}

/// Everything that must be released outside the lock.
struct Teardown {
   link: Option<Arc<dyn Link>>,
   reader: Option<ReaderHandle>,
}

struct Inner {
   strategies: Vec<Arc<dyn TransportStrategy>>,
   events: EventSender,
   options: SessionOptions,
   connecting: AtomicBool,
   state: Mutex<SessionState>,
}

impl Drop for Inner {
   fn drop(&mut self) {
      if let Some(reader) = self.state.get_mut().reader.take() {
         reader.stop.store(true, Ordering::Release);
         reader.task.abort();
      }
   }
}

/// Clears the in-progress flag however `connect` exits.
struct ConnectingGuard<'a>(&'a AtomicBool);

impl Drop for ConnectingGuard<'_> {
   fn drop(&mut self) {
      self.0.store(false, Ordering::Release);
   }
}

/// Handle to the AAP session. Cheap to clone.
#[derive(Clone)]
pub struct AapSession(Arc<Inner>);

impl AapSession {
   pub fn new(
      strategies: Vec<Arc<dyn TransportStrategy>>,
      events: EventSender,
      options: SessionOptions,
   ) -> Self {
      Self(Arc::new(Inner {
         strategies,
         events,
         options,
         connecting: AtomicBool::new(false),
         state: Mutex::new(SessionState::default()),
      }))
   }

   /// Opens a session to `address`, replacing any existing one.
   pub async fn connect(&self, address: Address) -> Result<TransportKind> {
      if self.0.connecting.swap(true, Ordering::AcqRel) {
         return Err(PodError::AlreadyConnecting);
      }
      let _guard = ConnectingGuard(&self.0.connecting);

      if self.is_connected() {
         info!("{address}: Replacing existing session");
         self.disconnect().await;
      }

      self.0.set_phase(Phase::Connecting, Some(address));
      let (link, kind) = match self.0.open_link(address).await {
         Ok(opened) => opened,
         Err(e) => {
            self.0.set_phase(Phase::Disconnected, None);
            return Err(e);
         },
      };

      self.0.set_phase(Phase::Initializing, Some(address));
      if let Err(e) = self.0.initialize(link.as_ref(), address).await {
         link.close().await;
         self.0.set_phase(Phase::Disconnected, None);
         return Err(e);
      }

      let generation = {
         let mut state = self.0.state.lock();
         state.generation += 1;
         state.phase = Phase::Connected;
         state.address = Some(address);
         state.transport = kind;
         state.head_tracking = false;
         state.settings = Settings::default();
         state.link = Some(link.clone());
         state.generation
      };
      info!("{address}: AAP session established over {kind}");
      self.0.events.emit(Event::AapConnected(kind));

      let mut state = self.0.state.lock();
      if state.phase == Phase::Connected && state.generation == generation {
         let stop = Arc::new(AtomicBool::new(false));
         let task = tokio::spawn(receive_loop(
            Arc::downgrade(&self.0),
            link,
            stop.clone(),
            generation,
            address,
            self.0.options.poll_interval,
         ));
         state.reader = Some(ReaderHandle { stop, task });
      }
      Ok(kind)
   }

   /// Tears the session down. Returns whether there was one.
   pub async fn disconnect(&self) -> bool {
      let Some((address, teardown)) = self.0.take_session(None) else {
         return false;
      };
      self.0.release(teardown).await;
      info!("{address}: Disconnected");
      self.0.events.emit(Event::AapDisconnected);
      true
   }

   /// Writes one packet on the active link.
   pub async fn send_packet(&self, data: &[u8]) -> Result<()> {
      let (link, address) = {
         let state = self.0.state.lock();
         match (&state.link, state.address) {
            (Some(link), Some(address)) if state.phase == Phase::Connected => {
               (link.clone(), address)
            },
            _ => return Err(PodError::NotConnected),
         }
      };
      debug!("→ {address}: {}", hex::encode(data));
      match time::timeout(self.0.options.write_timeout, link.send(data)).await {
         Ok(Ok(())) => Ok(()),
         Ok(Err(e)) => Err(PodError::SendFailure(e.to_string())),
         Err(_) => Err(PodError::RequestTimeout),
      }
   }

   pub async fn set_noise_control(&self, mode: NoiseControlMode) -> Result<()> {
      if mode == NoiseControlMode::Unknown {
         return Err(PodError::InvalidArgument(format!("noise control mode {mode}")));
      }
      self.send_packet(&build_noise_control_packet(mode)).await
   }

   pub async fn set_conversational_awareness(&self, enable: bool) -> Result<()> {
      self
         .send_packet(&build_conversational_awareness_packet(enable))
         .await
   }

   pub async fn set_personalized_volume(&self, enable: bool) -> Result<()> {
      self.send_packet(&build_personalized_volume_packet(enable)).await
   }

   pub async fn set_loud_sound_reduction(&self, enable: bool) -> Result<()> {
      self.send_packet(&build_loud_sound_reduction_packet(enable)).await
   }

   pub async fn set_off_ear_pause(&self, enable: bool) -> Result<()> {
      self.send_packet(&build_off_ear_pause_packet(enable)).await
   }

   /// Level is clamped to the protocol maximum of 50.
   pub async fn set_adaptive_transparency_level(&self, level: u8) -> Result<()> {
      self
         .send_packet(&build_adaptive_transparency_level_packet(level))
         .await
   }

   /// Level is clamped to 100.
   pub async fn set_adaptive_noise_level(&self, level: u8) -> Result<()> {
      self.send_packet(&build_adaptive_noise_level_packet(level)).await
   }

   /// Asks the accessory to report every setting again.
   pub async fn request_settings(&self) -> Result<()> {
      self.send_packet(PKT_REQUEST_SETTINGS).await
   }

   pub async fn start_head_tracking(&self) -> Result<()> {
      if !self.is_connected() {
         return Err(PodError::NotConnected);
      }
      if self.is_head_tracking_active() {
         return Ok(());
      }
      self.send_packet(PKT_HEAD_TRACKING_START).await?;
      self.0.state.lock().head_tracking = true;
      Ok(())
   }

   pub async fn stop_head_tracking(&self) -> Result<()> {
      if !self.is_connected() {
         return Err(PodError::NotConnected);
      }
      if !self.is_head_tracking_active() {
         return Ok(());
      }
      self.send_packet(PKT_HEAD_TRACKING_STOP).await?;
      self.0.state.lock().head_tracking = false;
      Ok(())
   }

   pub fn is_head_tracking_active(&self) -> bool {
      self.0.state.lock().head_tracking
   }

   pub fn is_connected(&self) -> bool {
      self.0.state.lock().phase == Phase::Connected
   }

   pub fn is_connecting(&self) -> bool {
      self.0.connecting.load(Ordering::Acquire)
   }

   pub fn phase(&self) -> Phase {
      self.0.state.lock().phase
   }

   pub fn address(&self) -> Option<Address> {
      self.0.state.lock().address
   }

   pub fn transport(&self) -> TransportKind {
      self.0.state.lock().transport
   }

   pub fn settings(&self) -> Settings {
      self.0.state.lock().settings
   }

   pub fn noise_control(&self) -> Option<NoiseControlMode> {
      self.settings().noise_control
   }

   pub fn conversational_awareness(&self) -> Option<ConversationalAwarenessState> {
      self.settings().conversational_awareness
   }

   pub fn personalized_volume(&self) -> Option<PersonalizedVolumeState> {
      self.settings().personalized_volume
   }

   pub fn loud_sound_reduction(&self) -> Option<LoudSoundReductionState> {
      self.settings().loud_sound_reduction
   }

   pub fn adaptive_transparency_level(&self) -> Option<u8> {
      self.settings().adaptive_transparency_level
   }

   pub fn off_ear_pause(&self) -> Option<bool> {
      self.settings().off_ear_pause
   }

   pub fn snapshot(&self) -> ConnectionSnapshot {
      let state = self.0.state.lock();
      ConnectionSnapshot {
         phase: state.phase,
         address: state.address,
         transport: state.transport,
         head_tracking: state.head_tracking,
         settings: state.settings,
      }
   }
}

impl Inner {
   fn set_phase(&self, phase: Phase, address: Option<Address>) {
      let mut state = self.state.lock();
      state.phase = phase;
      state.address = address;
   }

   async fn open_link(&self, address: Address) -> Result<(Arc<dyn Link>, TransportKind)> {
      for strategy in &self.strategies {
         debug!("{address}: Trying {} transport", strategy.name());
         match strategy.attempt(address).await {
            Ok(link) => {
               info!("{address}: Connected via {}", strategy.name());
               return Ok((link, strategy.kind()));
            },
            Err(e) => warn!("{address}: {} transport failed: {e}", strategy.name()),
         }
      }
      error!("{address}: No transport could reach the device");
      Err(PodError::TransportFailure(address))
   }

   async fn write(&self, link: &dyn Link, address: Address, data: &[u8]) -> Result<()> {
      debug!("→ {address}: {}", hex::encode(data));
      time::timeout(self.options.write_timeout, link.send(data))
         .await
         .map_err(|_| PodError::RequestTimeout)?
   }

   async fn initialize(&self, link: &dyn Link, address: Address) -> Result<()> {
      info!("{address}: Starting handshake sequence...");
      if let Err(e) = self.write(link, address, PKT_HANDSHAKE).await {
         error!("{address}: Failed to send handshake: {e}");
         return Err(PodError::InitializationFailure("handshake"));
      }
      time::sleep(self.options.settle_delay).await;

      if let Err(e) = self.write(link, address, PKT_SET_FEATURES).await {
         warn!("{address}: Failed to send features ({e}), continuing anyway...");
      }
      time::sleep(self.options.settle_delay).await;

      if let Err(e) = self.write(link, address, PKT_REQUEST_NOTIFY).await {
         error!("{address}: Failed to send notification request: {e}");
         return Err(PodError::InitializationFailure("notification subscription"));
      }
      info!("{address}: Handshake sequence completed");
      Ok(())
   }

   /// Marks the session disconnected and moves its resources out.
   ///
   /// With `generation` set, only the session of that generation is taken.
   fn take_session(&self, generation: Option<u64>) -> Option<(Address, Teardown)> {
      let mut state = self.state.lock();
      if state.phase != Phase::Connected {
         return None;
      }
      if generation.is_some_and(|g| g != state.generation) {
         return None;
      }
      let address = state.address.take()?;
      state.phase = Phase::Disconnected;
      state.transport = TransportKind::None;
      state.head_tracking = false;
      state.settings = Settings::default();
      Some((
         address,
         Teardown {
            link: state.link.take(),
            reader: state.reader.take(),
         },
      ))
   }

   async fn release(&self, teardown: Teardown) {
      let Teardown { link, reader } = teardown;
      if let Some(reader) = &reader {
         reader.stop.store(true, Ordering::Release);
      }
      if let Some(link) = link {
         link.close().await;
      }
      if let Some(ReaderHandle { mut task, .. }) = reader
         && time::timeout(self.options.join_timeout, &mut task).await.is_err()
      {
         warn!("Receive loop did not stop in time, abandoning it");
         task.abort();
      }
   }

   /// Called by the receive loop when its link dies on its own.
   async fn handle_loss(&self, generation: u64) {
      let Some((address, teardown)) = self.take_session(Some(generation)) else {
         return;
      };
      // The reader handle is the caller itself; dropping it detaches.
      if let Some(link) = teardown.link {
         link.close().await;
      }
      warn!("{address}: AAP connection lost");
      self.events.emit(Event::AapDisconnected);
   }

   fn process_packet(&self, address: Address, data: &[u8]) {
      debug!("← {address}: {}", hex::encode(data));
      let head_tracking = self.state.lock().head_tracking;
      let notification = match Notification::decode(data, head_tracking) {
         Ok(notification) => notification,
         Err(e) => {
            trace!("{address}: Ignoring packet: {e}");
            return;
         },
      };
      match notification {
         Notification::Setting(value) => {
            if self.state.lock().settings.apply(value) {
               debug!("{address}: {} is now {value:?}", value.kind());
            }
            self.events.emit(Event::SettingChanged(value));
         },
         Notification::SpeakingLevel(level) => self.events.emit(Event::SpeakingLevel(level)),
         Notification::EarDetection { primary, secondary } => {
            self.events.emit(Event::EarDetection { primary, secondary });
         },
         Notification::Battery(info) => self.events.emit(Event::AapBattery(info)),
         Notification::HeadTracking(sample) => self.events.emit(Event::HeadTracking(sample)),
         Notification::HandshakeAck => info!("{address}: Handshake acknowledged"),
         Notification::FeaturesAck => info!("{address}: Features acknowledged"),
      }
   }
}

async fn receive_loop(
   weak: Weak<Inner>,
   link: Arc<dyn Link>,
   stop: Arc<AtomicBool>,
   generation: u64,
   address: Address,
   poll_interval: Duration,
) {
   let mut buf = vec![0u8; RECV_BUFFER_SIZE];
   let reason = loop {
      if stop.load(Ordering::Acquire) {
         return;
      }
      match time::timeout(poll_interval, link.recv(&mut buf)).await {
         Err(_) => {
            if weak.strong_count() == 0 {
               return;
            }
         },
         Ok(Ok(0)) => break PodError::ConnectionClosed,
         Ok(Ok(n)) => {
            let Some(inner) = weak.upgrade() else {
               warn!("{address}: Session was dropped");
               return;
            };
            inner.process_packet(address, &buf[..n]);
         },
         Ok(Err(e)) => break e,
      }
   };

   if stop.load(Ordering::Acquire) {
      return;
   }
   debug!("{address}: Receive loop ending: {reason}");
   if let Some(inner) = weak.upgrade() {
      inner.handle_loss(generation).await;
   }
}
