//! Reconciled device state.
//!
//! Battery levels held here are percentages (0-100). Advertisements carry
//! them in tenths and are rescaled when decoded.

use serde_json::json;
use smol_str::SmolStr;

use crate::airpods::{model::Model, protocol::Settings};

/// One earbud.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum Side {
   Left,
   Right,
}

impl Side {
   pub const fn other(self) -> Self {
      match self {
         Self::Left => Self::Right,
         Self::Right => Self::Left,
      }
   }
}

/// A value kept per side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sides<T> {
   pub left: T,
   pub right: T,
}

impl<T> Sides<T> {
   pub const fn get(&self, side: Side) -> &T {
      match side {
         Side::Left => &self.left,
         Side::Right => &self.right,
      }
   }

   pub fn get_mut(&mut self, side: Side) -> &mut T {
      match side {
         Side::Left => &mut self.left,
         Side::Right => &mut self.right,
      }
   }
}

/// Battery percentage, absent when the accessory does not report one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Battery(Option<u8>);

impl Battery {
   pub const UNAVAILABLE: Self = Self(None);

   /// Highest level carried by an advertisement, in tenths.
   pub const RAW_MAX: u8 = 10;

   pub fn percent(level: u8) -> Self {
      Self(Some(level.min(100)))
   }

   /// Decodes a broadcast nibble. Values above ten mean "not reported".
   pub const fn from_raw(raw: u8) -> Self {
      if raw <= Self::RAW_MAX {
         Self(Some(raw * 10))
      } else {
         Self(None)
      }
   }

   pub const fn is_available(self) -> bool {
      self.0.is_some()
   }

   pub const fn value(self) -> Option<u8> {
      self.0
   }

   /// Level in the broadcast's own units.
   pub const fn raw(self) -> Option<u8> {
      match self.0 {
         Some(v) => Some(v / 10),
         None => None,
      }
   }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PodState {
   pub battery: Battery,
   pub is_charging: bool,
   pub is_in_ear: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaseState {
   pub battery: Battery,
   pub is_charging: bool,
   pub is_both_pods_in_case: bool,
   pub is_lid_opened: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PodsState {
   pub left: PodState,
   pub right: PodState,
}

impl PodsState {
   pub const fn both_in_ear(&self) -> bool {
      self.left.is_in_ear && self.right.is_in_ear
   }
}

/// Side-independent view of the device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceState {
   pub model: Model,
   pub pods: PodsState,
   pub case_box: CaseState,
   pub display_name: SmolStr,
   /// Settings reported over AAP, empty without a session.
   pub settings: Settings,
}

impl DeviceState {
   /// Lid counts as open only while both pods sit in the case.
   pub const fn is_lid_open_with_pods(&self) -> bool {
      self.case_box.is_lid_opened && self.case_box.is_both_pods_in_case
   }

   pub fn to_json(&self) -> serde_json::Value {
      let pod = |p: &PodState| {
         json!({
            "battery": p.battery.value(),
            "charging": p.is_charging,
            "in_ear": p.is_in_ear,
         })
      };
      json!({
         "model": self.model.display_name(),
         "display_name": self.display_name.as_str(),
         "left": pod(&self.pods.left),
         "right": pod(&self.pods.right),
         "case": {
            "battery": self.case_box.battery.value(),
            "charging": self.case_box.is_charging,
            "both_in_case": self.case_box.is_both_pods_in_case,
            "lid_open": self.case_box.is_lid_opened,
         },
         "settings": self.settings.to_json(),
      })
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn battery_scaling() {
      assert_eq!(Battery::from_raw(7).value(), Some(70));
      assert_eq!(Battery::from_raw(10).value(), Some(100));
      assert_eq!(Battery::from_raw(15), Battery::UNAVAILABLE);
      assert_eq!(Battery::from_raw(7).raw(), Some(7));
      assert_eq!(Battery::percent(130).value(), Some(100));
   }

   #[test]
   fn lid_requires_pods_in_case() {
      let mut state = DeviceState::default();
      state.case_box.is_lid_opened = true;
      assert!(!state.is_lid_open_with_pods());
      state.case_box.is_both_pods_in_case = true;
      assert!(state.is_lid_open_with_pods());
   }
}
