//! D-Bus surface for the UI.
//!
//! Methods map onto [`Intent`]s; every [`Event`](crate::event::Event) is
//! re-emitted as one of the signals below by the binary's dispatcher.

use std::{str::FromStr, sync::Arc};

use bluer::Address;
use log::info;
use zbus::{interface, object_server::SignalEmitter};

use crate::{
   airpods::protocol::NoiseControlMode,
   bluetooth::directory::{DeviceDirectory, DeviceInfo},
   error::PodError,
   orchestrator::{Intent, Orchestrator},
};

pub const SERVICE_NAME: &str = "org.podlink";
pub const OBJECT_PATH: &str = "/org/podlink/manager";

impl From<PodError> for zbus::fdo::Error {
   fn from(e: PodError) -> Self {
      match e {
         PodError::InvalidArgument(msg) => Self::InvalidArgs(msg),
         PodError::DeviceNotFound(_) => Self::UnknownObject(e.to_string()),
         e => Self::Failed(e.to_string()),
      }
   }
}

pub struct PodlinkService {
   orchestrator: Orchestrator,
   directory: Arc<dyn DeviceDirectory>,
}

impl PodlinkService {
   pub fn new(orchestrator: Orchestrator, directory: Arc<dyn DeviceDirectory>) -> Self {
      Self {
         orchestrator,
         directory,
      }
   }

   async fn apply(&self, intent: Intent) -> zbus::fdo::Result<bool> {
      self.orchestrator.apply(intent).await?;
      Ok(true)
   }
}

fn device_json(info: &DeviceInfo) -> serde_json::Value {
   serde_json::json!({
      "address": info.address.to_string(),
      "name": info.name,
      "model": info.model_hint().map(|m| m.display_name()),
      "connected": info.connected,
   })
}

#[interface(name = "org.podlink.Manager")]
impl PodlinkService {
   async fn get_status(&self) -> zbus::fdo::Result<String> {
      Ok(self.orchestrator.status().await?.to_json().to_string())
   }

   async fn get_paired_devices(&self) -> String {
      let devices: Vec<serde_json::Value> = self
         .directory
         .paired_accessories()
         .await
         .iter()
         .map(device_json)
         .collect();
      serde_json::Value::from(devices).to_string()
   }

   /// Follows `address`; an empty string unbinds.
   async fn bind_device(&self, address: String) -> zbus::fdo::Result<bool> {
      let address = if address.trim().is_empty() {
         None
      } else {
         Some(
            Address::from_str(address.trim())
               .map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?,
         )
      };
      self.orchestrator.bind(address).await?;
      Ok(true)
   }

   async fn set_noise_control(&self, mode: String) -> zbus::fdo::Result<bool> {
      let mode = NoiseControlMode::from_str(&mode)
         .map_err(|_| zbus::fdo::Error::InvalidArgs(format!("Invalid noise mode: {mode}")))?;
      self.apply(Intent::SetNoiseControl(mode)).await?;
      info!("Set noise mode to {mode}");
      Ok(true)
   }

   async fn set_feature(&self, feature: String, enabled: bool) -> zbus::fdo::Result<bool> {
      let intent = match feature.as_str() {
         "conversational_awareness" => Intent::SetConversationalAwareness(enabled),
         "personalized_volume" => Intent::SetPersonalizedVolume(enabled),
         "loud_sound_reduction" => Intent::SetLoudSoundReduction(enabled),
         "off_ear_pause" => Intent::SetOffEarPause(enabled),
         "automatic_ear_detection" => Intent::SetAutomaticEarDetection(enabled),
         _ => {
            return Err(zbus::fdo::Error::InvalidArgs(format!(
               "Unknown feature: {feature}"
            )));
         },
      };
      self.apply(intent).await?;
      info!("Set feature {feature} to {enabled}");
      Ok(true)
   }

   async fn set_level(&self, name: String, value: u8) -> zbus::fdo::Result<bool> {
      let intent = match name.as_str() {
         "conversational_awareness_volume" => Intent::SetConversationalAwarenessVolume(value),
         "adaptive_transparency" => Intent::SetAdaptiveTransparencyLevel(value),
         "adaptive_noise" => Intent::SetAdaptiveNoiseLevel(value),
         _ => {
            return Err(zbus::fdo::Error::InvalidArgs(format!("Unknown level: {name}")));
         },
      };
      self.apply(intent).await
   }

   async fn set_rssi_min(&self, rssi_min: i16) -> zbus::fdo::Result<bool> {
      self.apply(Intent::SetRssiMin(rssi_min)).await
   }

   async fn start_head_tracking(&self) -> zbus::fdo::Result<bool> {
      self.apply(Intent::StartHeadTracking).await
   }

   async fn stop_head_tracking(&self) -> zbus::fdo::Result<bool> {
      self.apply(Intent::StopHeadTracking).await
   }

   async fn request_settings(&self) -> zbus::fdo::Result<bool> {
      self.apply(Intent::RequestSettings).await
   }

   // Signals
   #[zbus(signal)]
   pub async fn aap_connected(emitter: &SignalEmitter<'_>, transport: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn aap_disconnected(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn setting_changed(
      emitter: &SignalEmitter<'_>,
      setting: &str,
      value: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn speaking_level_changed(emitter: &SignalEmitter<'_>, level: &str)
   -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn ear_detection_changed(
      emitter: &SignalEmitter<'_>,
      primary: &str,
      secondary: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn battery_updated(emitter: &SignalEmitter<'_>, battery: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn head_tracking(emitter: &SignalEmitter<'_>, sample: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn state_changed(emitter: &SignalEmitter<'_>, state: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_lost(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn lid_changed(emitter: &SignalEmitter<'_>, opened: bool) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn scanner_availability_changed(
      emitter: &SignalEmitter<'_>,
      available: bool,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn preferences_changed(
      emitter: &SignalEmitter<'_>,
      preferences: &str,
   ) -> zbus::Result<()>;

   // Properties for polling-free updates
   #[zbus(property)]
   async fn status(&self) -> String {
      self.get_status().await.unwrap_or_default()
   }
}
