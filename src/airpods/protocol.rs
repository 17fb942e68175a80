//! AAP protocol definitions and packet builders.
//!
//! This module contains the protocol constants, the fixed packets sent
//! during session setup, the per-setting enumerations and the builders
//! for every control packet the host sends to the accessory.

use serde::{Deserialize, Serialize};
use serde_json::json;
use smallvec::SmallVec;

/// A single AAP packet. Most packets fit inline.
pub type Packet = SmallVec<[u8; 32]>;

pub const PKT_HANDSHAKE: &[u8] = &[
   0x00, 0x00, 0x04, 0x00, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];
pub const PKT_SET_FEATURES: &[u8] = &[
   0x04, 0x00, 0x04, 0x00, 0x4d, 0x00, 0xff, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];
pub const PKT_REQUEST_NOTIFY: &[u8] = &[0x04, 0x00, 0x04, 0x00, 0x0f, 0x00, 0xff, 0xff, 0xff, 0xff];
pub const PKT_REQUEST_SETTINGS: &[u8] = &[0x04, 0x00, 0x04, 0x00, 0x0d, 0x00, 0xff, 0xff, 0xff, 0xff];

pub const PKT_HEAD_TRACKING_START: &[u8] = &[
   0x04, 0x00, 0x04, 0x00, 0x17, 0x00, 0x00, 0x00, 0x10, 0x00, 0x10, 0x00, 0x08, 0xa1, 0x02, 0x42,
   0x0b, 0x08, 0x0e, 0x10, 0x02, 0x1a, 0x05, 0x01, 0x40, 0x9c, 0x00, 0x00,
];
pub const PKT_HEAD_TRACKING_STOP: &[u8] = &[
   0x04, 0x00, 0x04, 0x00, 0x17, 0x00, 0x00, 0x00, 0x10, 0x00, 0x11, 0x00, 0x08, 0x7e, 0x10, 0x02,
   0x42, 0x0b, 0x08, 0x4e, 0x10, 0x02, 0x1a, 0x05, 0x01, 0x00, 0x00, 0x00, 0x00,
];

// Parsing headers
pub const HDR_BATTERY_STATE: &[u8] = b"\x04\x00\x04\x00\x04\x00";
pub const HDR_CMD_CTL: &[u8] = b"\x04\x00\x04\x00\x09\x00";
pub const HDR_EAR_DETECTION: &[u8] = b"\x04\x00\x04\x00\x06\x00";
pub const HDR_SPEAKING_LEVEL: &[u8] = b"\x04\x00\x04\x00\x4b\x00\x02\x00\x01";

// ACK packet headers
pub const HDR_ACK_HANDSHAKE: &[u8] = b"\x01\x00\x04\x00";
pub const HDR_ACK_FEATURES: &[u8] = b"\x04\x00\x04\x00\x2b";

/// Sensor frames shorter than this are never interpreted.
pub const SENSOR_FRAME_MIN_LEN: usize = 56;

pub const ADAPTIVE_TRANSPARENCY_MAX: u8 = 50;
pub const ADAPTIVE_NOISE_MAX: u8 = 100;

/// Control settings carried by `04 00 04 00 09 00 <opcode> <value> 00 00 00`.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumIter,
)]
pub enum SettingKind {
   NoiseControl = 0x0D,
   OffEarPause = 0x1B,
   LoudSoundReduction = 0x25,
   PersonalizedVolume = 0x26,
   ConversationalAwareness = 0x28,
   AdaptiveNoiseLevel = 0x2E,
   AdaptiveTransparencyLevel = 0x38,
}

impl SettingKind {
   pub const fn opcode(self) -> u8 {
      self as u8
   }

   /// Encodes an on/off toggle for this setting.
   ///
   /// Loud-sound reduction uses `00` for off; every other toggle uses `02`.
   pub const fn toggle_byte(self, enable: bool) -> u8 {
      match (self, enable) {
         (_, true) => 0x01,
         (Self::LoudSoundReduction, false) => 0x00,
         (_, false) => 0x02,
      }
   }
}

/// Noise control modes supported by the accessory.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[repr(u8)]
pub enum NoiseControlMode {
   #[strum(serialize = "off")]
   Off = 0x01,
   #[strum(serialize = "nc", serialize = "noise_cancellation")]
   NoiseCancellation = 0x02,
   #[strum(serialize = "transparency", serialize = "trans")]
   Transparency = 0x03,
   #[strum(serialize = "adaptive", serialize = "adapt")]
   Adaptive = 0x04,
   #[strum(serialize = "unknown")]
   Unknown = 0xFF,
}

impl NoiseControlMode {
   pub fn from_byte(b: u8) -> Self {
      Self::from_repr(b).unwrap_or(Self::Unknown)
   }

   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// Wear state of a single pod as reported over AAP.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::FromRepr, strum::Display,
)]
#[repr(u8)]
pub enum EarStatus {
   InEar = 0x00,
   OutOfEar = 0x01,
   InCase = 0x02,
   Unknown = 0xFF,
}

impl EarStatus {
   pub fn from_byte(b: u8) -> Self {
      Self::from_repr(b).unwrap_or(Self::Unknown)
   }
}

#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::FromRepr, strum::Display,
)]
#[repr(u8)]
pub enum ConversationalAwarenessState {
   Enabled = 0x01,
   Disabled = 0x02,
   Unknown = 0xFF,
}

#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::FromRepr, strum::Display,
)]
#[repr(u8)]
pub enum PersonalizedVolumeState {
   Enabled = 0x01,
   Disabled = 0x02,
   Unknown = 0xFF,
}

#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::FromRepr, strum::Display,
)]
#[repr(u8)]
pub enum LoudSoundReductionState {
   Disabled = 0x00,
   Enabled = 0x01,
   Unknown = 0xFF,
}

impl ConversationalAwarenessState {
   pub fn from_byte(b: u8) -> Self {
      Self::from_repr(b).unwrap_or(Self::Unknown)
   }

   pub const fn is_enabled(self) -> bool {
      matches!(self, Self::Enabled)
   }
}

impl PersonalizedVolumeState {
   pub fn from_byte(b: u8) -> Self {
      Self::from_repr(b).unwrap_or(Self::Unknown)
   }

   pub const fn is_enabled(self) -> bool {
      matches!(self, Self::Enabled)
   }
}

impl LoudSoundReductionState {
   pub fn from_byte(b: u8) -> Self {
      Self::from_repr(b).unwrap_or(Self::Unknown)
   }

   pub const fn is_enabled(self) -> bool {
      matches!(self, Self::Enabled)
   }
}

/// Speaking level reported while conversational awareness is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpeakingLevel {
   StartedSpeaking,
   StoppedSpeaking,
   NormalVolume,
   /// Reserved range `04..=07`. Carries the raw byte.
   Intermediate(u8),
}

impl SpeakingLevel {
   pub const fn from_byte(b: u8) -> Self {
      match b {
         0x00..=0x02 => Self::StartedSpeaking,
         0x03 => Self::StoppedSpeaking,
         0x08..=0xFF => Self::NormalVolume,
         _ => Self::Intermediate(b),
      }
   }

   /// Whether media volume should be reduced at this level.
   pub const fn is_ducking(self) -> bool {
      matches!(self, Self::StartedSpeaking)
   }
}

/// One decoded setting value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettingValue {
   NoiseControl(NoiseControlMode),
   ConversationalAwareness(ConversationalAwarenessState),
   PersonalizedVolume(PersonalizedVolumeState),
   LoudSoundReduction(LoudSoundReductionState),
   OffEarPause(bool),
   AdaptiveTransparencyLevel(u8),
   AdaptiveNoiseLevel(u8),
}

impl SettingValue {
   pub const fn kind(self) -> SettingKind {
      match self {
         Self::NoiseControl(_) => SettingKind::NoiseControl,
         Self::ConversationalAwareness(_) => SettingKind::ConversationalAwareness,
         Self::PersonalizedVolume(_) => SettingKind::PersonalizedVolume,
         Self::LoudSoundReduction(_) => SettingKind::LoudSoundReduction,
         Self::OffEarPause(_) => SettingKind::OffEarPause,
         Self::AdaptiveTransparencyLevel(_) => SettingKind::AdaptiveTransparencyLevel,
         Self::AdaptiveNoiseLevel(_) => SettingKind::AdaptiveNoiseLevel,
      }
   }

   /// Decodes the value byte of a setting packet.
   pub fn decode(kind: SettingKind, b: u8) -> Self {
      match kind {
         SettingKind::NoiseControl => Self::NoiseControl(NoiseControlMode::from_byte(b)),
         SettingKind::ConversationalAwareness => {
            Self::ConversationalAwareness(ConversationalAwarenessState::from_byte(b))
         },
         SettingKind::PersonalizedVolume => {
            Self::PersonalizedVolume(PersonalizedVolumeState::from_byte(b))
         },
         SettingKind::LoudSoundReduction => {
            Self::LoudSoundReduction(LoudSoundReductionState::from_byte(b))
         },
         SettingKind::OffEarPause => Self::OffEarPause(b == 0x01),
         SettingKind::AdaptiveTransparencyLevel => Self::AdaptiveTransparencyLevel(b),
         SettingKind::AdaptiveNoiseLevel => Self::AdaptiveNoiseLevel(b),
      }
   }
}

/// Last known value of every setting, `None` until first reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
   pub noise_control: Option<NoiseControlMode>,
   pub conversational_awareness: Option<ConversationalAwarenessState>,
   pub personalized_volume: Option<PersonalizedVolumeState>,
   pub loud_sound_reduction: Option<LoudSoundReductionState>,
   pub off_ear_pause: Option<bool>,
   pub adaptive_transparency_level: Option<u8>,
   pub adaptive_noise_level: Option<u8>,
}

impl Settings {
   /// Stores `value`, returning whether the cache changed.
   pub fn apply(&mut self, value: SettingValue) -> bool {
      fn set<T: PartialEq>(slot: &mut Option<T>, v: T) -> bool {
         if slot.as_ref() == Some(&v) {
            return false;
         }
         *slot = Some(v);
         true
      }
      match value {
         SettingValue::NoiseControl(v) => set(&mut self.noise_control, v),
         SettingValue::ConversationalAwareness(v) => set(&mut self.conversational_awareness, v),
         SettingValue::PersonalizedVolume(v) => set(&mut self.personalized_volume, v),
         SettingValue::LoudSoundReduction(v) => set(&mut self.loud_sound_reduction, v),
         SettingValue::OffEarPause(v) => set(&mut self.off_ear_pause, v),
         SettingValue::AdaptiveTransparencyLevel(v) => {
            set(&mut self.adaptive_transparency_level, v)
         },
         SettingValue::AdaptiveNoiseLevel(v) => set(&mut self.adaptive_noise_level, v),
      }
   }

   pub fn to_json(self) -> serde_json::Value {
      json!({
         "noise_control": self.noise_control.map(NoiseControlMode::to_str),
         "conversational_awareness": self.conversational_awareness.map(|s| s.is_enabled()),
         "personalized_volume": self.personalized_volume.map(|s| s.is_enabled()),
         "loud_sound_reduction": self.loud_sound_reduction.map(|s| s.is_enabled()),
         "off_ear_pause": self.off_ear_pause,
         "adaptive_transparency_level": self.adaptive_transparency_level,
         "adaptive_noise_level": self.adaptive_noise_level,
      })
   }
}

/// Represents the battery-bearing components of the accessory.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
)]
pub enum Component {
   Right = 0x02,
   Left = 0x04,
   Case = 0x08,
}

/// Battery status for a component as reported over AAP.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
)]
#[repr(u8)]
pub enum BatteryStatus {
   Normal = 0x00,
   Charging = 0x01,
   Discharging = 0x02,
   Disconnected = 0x04,
}

/// Battery state for a single component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryState {
   pub level: u8,
   pub status: BatteryStatus,
}

impl BatteryState {
   pub const fn new() -> Self {
      Self {
         level: 0,
         status: BatteryStatus::Disconnected,
      }
   }

   pub fn is_charging(&self) -> bool {
      self.status == BatteryStatus::Charging
   }

   pub fn is_available(&self) -> bool {
      self.status != BatteryStatus::Disconnected
   }
}

impl Default for BatteryState {
   fn default() -> Self {
      Self::new()
   }
}

/// Battery report from an AAP battery notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryInfo {
   pub left: BatteryState,
   pub right: BatteryState,
   pub case: BatteryState,
}

impl BatteryInfo {
   pub fn to_json(self) -> serde_json::Value {
      json!({
          "left_level": u32::from(self.left.level),
          "right_level": u32::from(self.right.level),
          "case_level": u32::from(self.case.level),
          "left_charging": self.left.is_charging(),
          "right_charging": self.right.is_charging(),
          "case_charging": self.case.is_charging(),
          "left_available": self.left.is_available(),
          "right_available": self.right.is_available(),
          "case_available": self.case.is_available(),
      })
   }
}

/// Orientation and acceleration sample from a head-tracking frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadTrackingData {
   pub orientation: [i16; 3],
   pub horizontal_acceleration: i16,
   pub vertical_acceleration: i16,
}

/// Builds a control packet for a single setting.
pub fn build_control_packet(cmd: u8, value: u8) -> Packet {
   HDR_CMD_CTL
      .iter()
      .copied()
      .chain([cmd, value, 0x00, 0x00, 0x00])
      .collect()
}

pub fn build_noise_control_packet(mode: NoiseControlMode) -> Packet {
   build_control_packet(SettingKind::NoiseControl.opcode(), mode as u8)
}

/// Builds an on/off packet for a toggle setting.
pub fn build_toggle_packet(kind: SettingKind, enable: bool) -> Packet {
   build_control_packet(kind.opcode(), kind.toggle_byte(enable))
}

pub fn build_conversational_awareness_packet(enable: bool) -> Packet {
   build_toggle_packet(SettingKind::ConversationalAwareness, enable)
}

pub fn build_personalized_volume_packet(enable: bool) -> Packet {
   build_toggle_packet(SettingKind::PersonalizedVolume, enable)
}

pub fn build_loud_sound_reduction_packet(enable: bool) -> Packet {
   build_toggle_packet(SettingKind::LoudSoundReduction, enable)
}

pub fn build_off_ear_pause_packet(enable: bool) -> Packet {
   build_toggle_packet(SettingKind::OffEarPause, enable)
}

/// Levels above 50 are clamped.
pub fn build_adaptive_transparency_level_packet(level: u8) -> Packet {
   build_control_packet(
      SettingKind::AdaptiveTransparencyLevel.opcode(),
      level.min(ADAPTIVE_TRANSPARENCY_MAX),
   )
}

/// Levels above 100 are clamped.
pub fn build_adaptive_noise_level_packet(level: u8) -> Packet {
   build_control_packet(SettingKind::AdaptiveNoiseLevel.opcode(), level.min(ADAPTIVE_NOISE_MAX))
}
