//! Packet parsing utilities for the AAP protocol.
//!
//! Every `is_*` predicate compares header bytes only. Every `parse_*`
//! function is total: short buffers and header mismatches yield `None`,
//! and unexpected payload bytes map to the `Unknown` variant of the
//! corresponding enumeration.

use log::{debug, warn};
use thiserror::Error;

use crate::airpods::protocol::{
   BatteryInfo, BatteryState, BatteryStatus, Component, ConversationalAwarenessState, EarStatus,
   HDR_ACK_FEATURES, HDR_ACK_HANDSHAKE, HDR_BATTERY_STATE, HDR_CMD_CTL, HDR_EAR_DETECTION,
   HDR_SPEAKING_LEVEL, HeadTrackingData, LoudSoundReductionState, NoiseControlMode,
   PersonalizedVolumeState, SENSOR_FRAME_MIN_LEN, SettingKind, SettingValue, SpeakingLevel,
};

/// Reasons a received packet was not classified.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtoError {
   /// Packet is too short for the expected format
   #[error("Packet too short: expected at least {expected} bytes, got {actual}")]
   PacketTooShort { expected: usize, actual: usize },

   /// Invalid battery count in battery status packet
   #[error("Invalid battery count: {count} (must be 0-3)")]
   InvalidBatteryCount { count: u8 },

   /// Packet size doesn't match expected size based on content
   #[error("Packet size mismatch: expected {expected} bytes, got {actual} bytes")]
   PacketSizeMismatch { expected: usize, actual: usize },

   #[error("Unknown setting opcode: 0x{opcode:02x}")]
   UnknownSetting { opcode: u8 },

   #[error("Unrecognized packet ({len} bytes)")]
   Unrecognized { len: usize },
}

const SETTING_PACKET_MIN_LEN: usize = 8;
const EAR_DETECTION_MIN_LEN: usize = 8;
const SPEAKING_LEVEL_MIN_LEN: usize = 10;

fn is_setting_notification(data: &[u8], kind: SettingKind) -> bool {
   data.starts_with(HDR_CMD_CTL) && data.get(HDR_CMD_CTL.len()) == Some(&kind.opcode())
}

/// Returns the value byte of a setting notification of `kind`.
fn setting_payload(data: &[u8], kind: SettingKind) -> Option<u8> {
   if data.len() < SETTING_PACKET_MIN_LEN || !is_setting_notification(data, kind) {
      return None;
   }
   Some(data[7])
}

pub fn is_settings_notification(data: &[u8]) -> bool {
   data.starts_with(HDR_CMD_CTL)
}

pub fn is_noise_control_notification(data: &[u8]) -> bool {
   is_setting_notification(data, SettingKind::NoiseControl)
}

pub fn is_conversational_awareness_notification(data: &[u8]) -> bool {
   is_setting_notification(data, SettingKind::ConversationalAwareness)
}

pub fn is_personalized_volume_notification(data: &[u8]) -> bool {
   is_setting_notification(data, SettingKind::PersonalizedVolume)
}

pub fn is_loud_sound_reduction_notification(data: &[u8]) -> bool {
   is_setting_notification(data, SettingKind::LoudSoundReduction)
}

pub fn is_off_ear_pause_notification(data: &[u8]) -> bool {
   is_setting_notification(data, SettingKind::OffEarPause)
}

pub fn is_adaptive_transparency_level_notification(data: &[u8]) -> bool {
   is_setting_notification(data, SettingKind::AdaptiveTransparencyLevel)
}

pub fn is_speaking_level_notification(data: &[u8]) -> bool {
   data.starts_with(HDR_SPEAKING_LEVEL)
}

pub fn is_ear_detection_notification(data: &[u8]) -> bool {
   data.starts_with(HDR_EAR_DETECTION)
}

pub fn is_battery_notification(data: &[u8]) -> bool {
   data.starts_with(HDR_BATTERY_STATE)
}

pub fn parse_noise_control_notification(data: &[u8]) -> Option<NoiseControlMode> {
   setting_payload(data, SettingKind::NoiseControl).map(NoiseControlMode::from_byte)
}

pub fn parse_conversational_awareness_state(data: &[u8]) -> Option<ConversationalAwarenessState> {
   setting_payload(data, SettingKind::ConversationalAwareness)
      .map(ConversationalAwarenessState::from_byte)
}

pub fn parse_personalized_volume_state(data: &[u8]) -> Option<PersonalizedVolumeState> {
   setting_payload(data, SettingKind::PersonalizedVolume).map(PersonalizedVolumeState::from_byte)
}

pub fn parse_loud_sound_reduction_state(data: &[u8]) -> Option<LoudSoundReductionState> {
   setting_payload(data, SettingKind::LoudSoundReduction).map(LoudSoundReductionState::from_byte)
}

pub fn parse_off_ear_pause_state(data: &[u8]) -> Option<bool> {
   setting_payload(data, SettingKind::OffEarPause).map(|b| b == 0x01)
}

pub fn parse_adaptive_transparency_level(data: &[u8]) -> Option<u8> {
   setting_payload(data, SettingKind::AdaptiveTransparencyLevel)
}

pub fn parse_adaptive_noise_level(data: &[u8]) -> Option<u8> {
   setting_payload(data, SettingKind::AdaptiveNoiseLevel)
}

/// Decodes any setting notification whose opcode is known.
pub fn parse_setting(data: &[u8]) -> Option<SettingValue> {
   if data.len() < SETTING_PACKET_MIN_LEN || !is_settings_notification(data) {
      return None;
   }
   let kind = SettingKind::from_repr(data[6])?;
   Some(SettingValue::decode(kind, data[7]))
}

pub fn parse_speaking_level(data: &[u8]) -> Option<SpeakingLevel> {
   if data.len() < SPEAKING_LEVEL_MIN_LEN || !is_speaking_level_notification(data) {
      return None;
   }
   Some(SpeakingLevel::from_byte(data[9]))
}

/// Returns `(primary, secondary)` pod wear state.
pub fn parse_ear_detection(data: &[u8]) -> Option<(EarStatus, EarStatus)> {
   if data.len() < EAR_DETECTION_MIN_LEN || !is_ear_detection_notification(data) {
      return None;
   }
   Some((EarStatus::from_byte(data[6]), EarStatus::from_byte(data[7])))
}

/// Reads the sensor fields of a head-tracking frame.
pub fn parse_head_tracking_data(data: &[u8]) -> Option<HeadTrackingData> {
   if data.len() < SENSOR_FRAME_MIN_LEN {
      return None;
   }
   let read = |off: usize| i16::from_le_bytes([data[off], data[off + 1]]);
   Some(HeadTrackingData {
      orientation: [read(43), read(45), read(47)],
      horizontal_acceleration: read(51),
      vertical_acceleration: read(53),
   })
}

/// Parses a battery status packet.
///
/// The packet carries a component count followed by five bytes per
/// component: id, padding, level, status, padding.
pub fn parse_battery_status(data: &[u8]) -> Option<BatteryInfo> {
   if !is_battery_notification(data) || data.len() < 7 {
      return None;
   }

   let battery_count = data[6];
   let expected_length = 7 + 5 * battery_count as usize;
   if battery_count > 3 {
      debug!(
         "{}",
         ProtoError::InvalidBatteryCount {
            count: battery_count
         }
      );
      return None;
   }
   if data.len() < expected_length {
      debug!(
         "{}",
         ProtoError::PacketSizeMismatch {
            expected: expected_length,
            actual: data.len(),
         }
      );
      return None;
   }

   let mut battery_info = BatteryInfo::default();
   for chunk in data[7..expected_length].chunks_exact(5) {
      let (id, level, status) = (chunk[0], chunk[2], chunk[3]);

      let Some(component) = Component::from_repr(id) else {
         warn!("Unknown component type 0x{id:02x}");
         continue;
      };
      let status = BatteryStatus::from_repr(status).unwrap_or_else(|| {
         warn!("Unknown battery status 0x{status:02x} for component {component}, treating as Normal");
         BatteryStatus::Normal
      });
      if status == BatteryStatus::Disconnected {
         continue;
      }

      let state = BatteryState { level, status };
      match component {
         Component::Left => battery_info.left = state,
         Component::Right => battery_info.right = state,
         Component::Case => battery_info.case = state,
      }
   }
   Some(battery_info)
}

/// A classified incoming packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
   Setting(SettingValue),
   SpeakingLevel(SpeakingLevel),
   EarDetection {
      primary: EarStatus,
      secondary: EarStatus,
   },
   Battery(BatteryInfo),
   HeadTracking(HeadTrackingData),
   HandshakeAck,
   FeaturesAck,
}

impl Notification {
   /// Classifies `data`. Sensor frames are only considered while
   /// head tracking is active.
   pub fn decode(data: &[u8], head_tracking_active: bool) -> Result<Self, ProtoError> {
      if is_settings_notification(data) {
         if data.len() < SETTING_PACKET_MIN_LEN {
            return Err(ProtoError::PacketTooShort {
               expected: SETTING_PACKET_MIN_LEN,
               actual: data.len(),
            });
         }
         return parse_setting(data)
            .map(Self::Setting)
            .ok_or(ProtoError::UnknownSetting { opcode: data[6] });
      }
      if is_speaking_level_notification(data) {
         return parse_speaking_level(data).map(Self::SpeakingLevel).ok_or(
            ProtoError::PacketTooShort {
               expected: SPEAKING_LEVEL_MIN_LEN,
               actual: data.len(),
            },
         );
      }
      if is_ear_detection_notification(data) {
         return parse_ear_detection(data)
            .map(|(primary, secondary)| Self::EarDetection { primary, secondary })
            .ok_or(ProtoError::PacketTooShort {
               expected: EAR_DETECTION_MIN_LEN,
               actual: data.len(),
            });
      }
      if is_battery_notification(data) {
         return parse_battery_status(data)
            .map(Self::Battery)
            .ok_or(ProtoError::Unrecognized { len: data.len() });
      }
      if data.starts_with(HDR_ACK_HANDSHAKE) {
         return Ok(Self::HandshakeAck);
      }
      if data.starts_with(HDR_ACK_FEATURES) {
         return Ok(Self::FeaturesAck);
      }
      if head_tracking_active && let Some(sample) = parse_head_tracking_data(data) {
         return Ok(Self::HeadTracking(sample));
      }
      Err(ProtoError::Unrecognized { len: data.len() })
   }
}

#[cfg(test)]
mod tests {
   use strum::IntoEnumIterator;

   use super::*;
   use crate::airpods::protocol::{build_noise_control_packet, build_toggle_packet};

   #[test]
   fn short_buffers_never_parse() {
      let full = [0x04, 0x00, 0x04, 0x00, 0x4b, 0x00, 0x02, 0x00, 0x01, 0x03, 0x00];
      for len in 0..full.len() {
         let data = &full[..len];
         assert_eq!(parse_noise_control_notification(data), None);
         assert_eq!(parse_ear_detection(data), None);
         assert_eq!(parse_setting(data), None);
         if len < 10 {
            assert_eq!(parse_speaking_level(data), None);
         }
      }
      assert_eq!(parse_head_tracking_data(&[0u8; 55]), None);
      assert_eq!(parse_battery_status(&[0x04, 0x00, 0x04, 0x00, 0x04]), None);
   }

   #[test]
   fn header_mismatch_is_none() {
      let data = [0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0x28, 0x01, 0x00, 0x00, 0x00];
      assert_eq!(parse_noise_control_notification(&data), None);
      assert_eq!(
         parse_conversational_awareness_state(&data),
         Some(ConversationalAwarenessState::Enabled)
      );
      assert!(!is_noise_control_notification(&data));
      assert!(is_conversational_awareness_notification(&data));
   }

   #[test]
   fn toggles_decode_what_they_encode() {
      for kind in SettingKind::iter() {
         let (on, off) = match kind {
            SettingKind::ConversationalAwareness => (
               SettingValue::ConversationalAwareness(ConversationalAwarenessState::Enabled),
               SettingValue::ConversationalAwareness(ConversationalAwarenessState::Disabled),
            ),
            SettingKind::PersonalizedVolume => (
               SettingValue::PersonalizedVolume(PersonalizedVolumeState::Enabled),
               SettingValue::PersonalizedVolume(PersonalizedVolumeState::Disabled),
            ),
            SettingKind::LoudSoundReduction => (
               SettingValue::LoudSoundReduction(LoudSoundReductionState::Enabled),
               SettingValue::LoudSoundReduction(LoudSoundReductionState::Disabled),
            ),
            SettingKind::OffEarPause => {
               (SettingValue::OffEarPause(true), SettingValue::OffEarPause(false))
            },
            _ => continue,
         };
         assert_eq!(parse_setting(&build_toggle_packet(kind, true)), Some(on));
         assert_eq!(parse_setting(&build_toggle_packet(kind, false)), Some(off));
      }
   }

   #[test]
   fn noise_mode_notification() {
      let pkt = build_noise_control_packet(NoiseControlMode::NoiseCancellation);
      assert_eq!(
         parse_noise_control_notification(&pkt),
         Some(NoiseControlMode::NoiseCancellation)
      );
      let odd = [0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0x0d, 0x07];
      assert_eq!(parse_noise_control_notification(&odd), Some(NoiseControlMode::Unknown));
   }

   #[test]
   fn ear_detection_notification() {
      let data = [0x04, 0x00, 0x04, 0x00, 0x06, 0x00, 0x00, 0x02];
      assert_eq!(
         Notification::decode(&data, false),
         Ok(Notification::EarDetection {
            primary: EarStatus::InEar,
            secondary: EarStatus::InCase,
         })
      );
   }

   #[test]
   fn battery_notification() {
      let data = [
         0x04, 0x00, 0x04, 0x00, 0x04, 0x00, 0x03, 0x02, 0x01, 0x5a, 0x02, 0x01, 0x04, 0x01, 0x50,
         0x01, 0x01, 0x08, 0x01, 0x00, 0x04, 0x01,
      ];
      let info = parse_battery_status(&data).unwrap();
      assert_eq!(info.right.level, 90);
      assert_eq!(info.left.level, 80);
      assert!(info.left.is_charging());
      assert!(!info.case.is_available());
   }

   #[test]
   fn sensor_frames_only_while_tracking() {
      let mut frame = vec![0u8; 60];
      frame[43..45].copy_from_slice(&(-120i16).to_le_bytes());
      frame[53..55].copy_from_slice(&7i16.to_le_bytes());

      assert_eq!(
         Notification::decode(&frame, false),
         Err(ProtoError::Unrecognized { len: 60 })
      );
      let Ok(Notification::HeadTracking(sample)) = Notification::decode(&frame, true) else {
         panic!("expected head tracking sample");
      };
      assert_eq!(sample.orientation[0], -120);
      assert_eq!(sample.vertical_acceleration, 7);
   }

   #[test]
   fn unknown_setting_opcode() {
      let data = [0x04, 0x00, 0x04, 0x00, 0x09, 0x00, 0x33, 0x01, 0x00, 0x00, 0x00];
      assert_eq!(
         Notification::decode(&data, false),
         Err(ProtoError::UnknownSetting { opcode: 0x33 })
      );
   }
}
