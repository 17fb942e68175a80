//! Proximity-pairing advertisement decoding.
//!
//! Each earbud broadcasts its own view of the pair in the Apple
//! manufacturer-data block. The layout after the company id is:
//!
//! ```text
//! [0]  0x07 proximity-pairing type
//! [1]  0x19 remaining length
//! [2]  prefix
//! [3]  model id (u16 LE)
//! [5]  status: bit5 broadcaster is left, bit1/bit3 in-ear, bit2 both in case
//! [6]  pod batteries, broadcaster in the high nibble
//! [7]  low nibble case battery, high nibble charging flags
//! [8]  lid: bit3 clear when open
//! [9]  color
//! [11] encrypted payload
//! ```

use std::collections::HashMap;

use bluer::Address;
use tokio::time::Instant;

use crate::airpods::{
   model::Model,
   state::{Battery, CaseState, DeviceState, PodState, PodsState, Side},
};

/// Apple company identifier for manufacturer data.
pub const APPLE_CID: u16 = 0x004C;

/// Proximity-pairing message type in manufacturer data.
const PP_TYPE: u8 = 0x07;
const PP_LENGTH: u8 = 0x19;
const PP_TOTAL_LEN: usize = 2 + PP_LENGTH as usize;
const ENCRYPTED_OFFSET: usize = 11;

const STATUS_IN_EAR_BROADCASTER: u8 = 1 << 1;
const STATUS_BOTH_IN_CASE: u8 = 1 << 2;
const STATUS_IN_EAR_OTHER: u8 = 1 << 3;
const STATUS_LEFT_BROADCASTS: u8 = 1 << 5;

const CHARGING_BROADCASTER: u8 = 0x01;
const CHARGING_OTHER: u8 = 0x02;
const CHARGING_CASE: u8 = 0x04;

const LID_CLOSED: u8 = 1 << 3;

/// Raw broadcast as delivered by the scanner.
#[derive(Debug, Clone)]
pub struct AdvertisementRecord {
   pub address: Address,
   pub rssi: i16,
   pub timestamp: Instant,
   pub manufacturer_data: HashMap<u16, Vec<u8>>,
}

/// A decoded per-side snapshot.
#[derive(Debug, Clone)]
pub struct Advertisement {
   address: Address,
   rssi: i16,
   timestamp: Instant,
   side: Side,
   state: DeviceState,
   payload: [u8; PP_TOTAL_LEN],
}

fn proximity_payload(record: &AdvertisementRecord) -> Option<&[u8; PP_TOTAL_LEN]> {
   let data = record.manufacturer_data.get(&APPLE_CID)?;
   let payload: &[u8; PP_TOTAL_LEN] = data.as_slice().try_into().ok()?;
   (payload[0] == PP_TYPE && payload[1] == PP_LENGTH).then_some(payload)
}

impl Advertisement {
   /// Whether `record` carries a structurally valid proximity-pairing block.
   pub fn is_desired(record: &AdvertisementRecord) -> bool {
      proximity_payload(record).is_some()
   }

   pub fn decode(record: &AdvertisementRecord) -> Option<Self> {
      let payload = *proximity_payload(record)?;

      let model = Model::from_product_id(u16::from_le_bytes([payload[3], payload[4]]));
      let status = payload[5];
      let left_broadcasts = status & STATUS_LEFT_BROADCASTS != 0;
      let side = if left_broadcasts { Side::Left } else { Side::Right };

      let (hi, lo) = (payload[6] >> 4, payload[6] & 0x0f);
      let charging = payload[7] >> 4;

      let broadcaster = PodState {
         battery: Battery::from_raw(hi),
         is_charging: charging & CHARGING_BROADCASTER != 0,
         is_in_ear: status & STATUS_IN_EAR_BROADCASTER != 0,
      };
      let other = PodState {
         battery: Battery::from_raw(lo),
         is_charging: charging & CHARGING_OTHER != 0,
         is_in_ear: status & STATUS_IN_EAR_OTHER != 0,
      };
      let pods = match side {
         Side::Left => PodsState {
            left: broadcaster,
            right: other,
         },
         Side::Right => PodsState {
            left: other,
            right: broadcaster,
         },
      };

      let case_box = CaseState {
         battery: Battery::from_raw(payload[7] & 0x0f),
         is_charging: charging & CHARGING_CASE != 0,
         is_both_pods_in_case: status & STATUS_BOTH_IN_CASE != 0,
         is_lid_opened: payload[8] & LID_CLOSED == 0,
      };

      Some(Self {
         address: record.address,
         rssi: record.rssi,
         timestamp: record.timestamp,
         side,
         state: DeviceState {
            model,
            pods,
            case_box,
            ..Default::default()
         },
         payload,
      })
   }

   pub const fn address(&self) -> Address {
      self.address
   }

   pub const fn rssi(&self) -> i16 {
      self.rssi
   }

   pub const fn timestamp(&self) -> Instant {
      self.timestamp
   }

   pub const fn side(&self) -> Side {
      self.side
   }

   pub const fn state(&self) -> &DeviceState {
      &self.state
   }

   pub const fn model(&self) -> Model {
      self.state.model
   }

   /// Copy of the payload with the device-linkable part zeroed.
   pub fn desensitized(&self) -> Vec<u8> {
      let mut data = self.payload.to_vec();
      data[ENCRYPTED_OFFSET..].fill(0);
      data
   }
}
