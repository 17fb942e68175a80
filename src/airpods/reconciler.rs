//! Advertisement state reconciliation.
//!
//! Earbuds broadcast from random non-resolvable addresses that rotate, so
//! a broadcast cannot be tied to our device by address alone. The
//! reconciler accepts snapshots that are plausibly from the same physical
//! pair, keeps the latest one per side, and merges both sides into one
//! [`DeviceState`].
//!
//! Time is passed in by the caller. The owner drives the timers by calling
//! [`StateReconciler::poll_timers`] at [`StateReconciler::next_deadline`].

use log::{info, warn};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::{
   airpods::{
      advertisement::Advertisement,
      state::{Battery, DeviceState, Side, Sides},
   },
   config::ReconcilerConfig,
};

/// Emitted whenever the merged state differs from the previous one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateEvent {
   pub old: Option<DeviceState>,
   pub new: DeviceState,
}

#[derive(Debug, Clone)]
struct Slot {
   adv: Advertisement,
   observed_at: Instant,
}

struct Tracker {
   tunables: ReconcilerConfig,
   rssi_min: i16,
   slots: Sides<Option<Slot>>,
   cached: Option<DeviceState>,
   lost_deadline: Option<Instant>,
   reset_deadlines: Sides<Option<Instant>>,
}

pub struct StateReconciler {
   inner: Mutex<Tracker>,
}

impl StateReconciler {
   pub fn new(rssi_min: i16, tunables: ReconcilerConfig) -> Self {
      Self {
         inner: Mutex::new(Tracker {
            tunables,
            rssi_min,
            slots: Sides::default(),
            cached: None,
            lost_deadline: None,
            reset_deadlines: Sides::default(),
         }),
      }
   }

   pub fn current_state(&self) -> Option<DeviceState> {
      self.inner.lock().cached.clone()
   }

   pub fn set_rssi_min(&self, rssi_min: i16) {
      self.inner.lock().rssi_min = rssi_min;
   }

   /// Feeds one snapshot observed at `now`.
   pub fn on_advertisement(&self, adv: Advertisement, now: Instant) -> Option<UpdateEvent> {
      let mut tracker = self.inner.lock();
      if let Err(reason) = tracker.is_possible_desired(&adv) {
         warn!(
            "Ignoring advertisement that may not come from our device ({reason}): {}",
            hex::encode(adv.desensitized())
         );
         return None;
      }
      tracker.store(adv, now);
      tracker.merge()
   }

   /// Clears all tracked state. Returns whether a state had been published.
   pub fn disconnect(&self) -> bool {
      info!("Reconciler: disconnect");
      self.inner.lock().reset_all()
   }

   /// Earliest instant at which [`poll_timers`](Self::poll_timers) has work.
   pub fn next_deadline(&self) -> Option<Instant> {
      let tracker = self.inner.lock();
      [
         tracker.lost_deadline,
         tracker.reset_deadlines.left,
         tracker.reset_deadlines.right,
      ]
      .into_iter()
      .flatten()
      .min()
   }

   /// Fires every timer due at `now`. Returns true when the device was lost,
   /// at most once per loss.
   pub fn poll_timers(&self, now: Instant) -> bool {
      let mut tracker = self.inner.lock();
      for side in [Side::Left, Side::Right] {
         if tracker.reset_deadlines.get(side).is_some_and(|d| d <= now) {
            *tracker.reset_deadlines.get_mut(side) = None;
            if tracker.slots.get_mut(side).take().is_some() {
               info!("Reconciler: {side} side went stale");
            }
         }
      }
      if tracker.lost_deadline.is_some_and(|d| d <= now) {
         tracker.lost_deadline = None;
         if tracker.reset_all() {
            info!("Reconciler: device lost");
            return true;
         }
      }
      false
   }
}

/// Absolute difference of two batteries in broadcast units, when both report.
fn battery_step(a: Battery, b: Battery) -> u8 {
   match (a.raw(), b.raw()) {
      (Some(a), Some(b)) => a.abs_diff(b),
      _ => 0,
   }
}

impl Tracker {
   fn is_possible_desired(&self, adv: &Advertisement) -> Result<(), String> {
      let rssi = adv.rssi();
      if rssi < self.rssi_min {
         return Err(format!("RSSI {rssi} below {}", self.rssi_min));
      }

      let side = adv.side();
      let state = adv.state();

      if let Some(last) = self.slots.get(side)
         && last.adv.address() != adv.address()
      {
         let last_state = last.adv.state();
         if state.model != last_state.model {
            return Err(format!("model {} != {}", state.model, last_state.model));
         }

         let diffs = [
            battery_step(state.pods.left.battery, last_state.pods.left.battery),
            battery_step(state.pods.right.battery, last_state.pods.right.battery),
            battery_step(state.case_box.battery, last_state.case_box.battery),
         ];
         if diffs.iter().any(|d| *d > self.tunables.battery_step_max) {
            return Err(format!(
               "battery diff l={} r={} c={}",
               diffs[0], diffs[1], diffs[2]
            ));
         }

         let rssi_diff = rssi.abs_diff(last.adv.rssi());
         if rssi_diff > self.tunables.rssi_delta_max.unsigned_abs() {
            return Err(format!("same side RSSI diff {rssi_diff}"));
         }

         warn!("Address changed, but it might still be the same device");
      }

      if let Some(other) = self.slots.get(side.other()) {
         let rssi_diff = rssi.abs_diff(other.adv.rssi());
         if rssi_diff > self.tunables.rssi_delta_max.unsigned_abs() {
            return Err(format!("other side RSSI diff {rssi_diff}"));
         }
      }

      Ok(())
   }

   fn store(&mut self, adv: Advertisement, now: Instant) {
      let side = adv.side();
      self.lost_deadline = Some(now + self.tunables.lost_timeout());
      *self.reset_deadlines.get_mut(side) = Some(now + self.tunables.stale_timeout());
      *self.slots.get_mut(side) = Some(Slot {
         adv,
         observed_at: now,
      });
   }

   /// Chooses the source side for one field group.
   fn pick(&self, available: impl Fn(&DeviceState) -> bool) -> Option<&DeviceState> {
      let left = self.slots.left.as_ref();
      let right = self.slots.right.as_ref();
      let has = |slot: Option<&Slot>| slot.is_some_and(|s| available(s.adv.state()));

      let chosen = match (has(left), has(right)) {
         (true, true) => {
            let (l, r) = (left?, right?);
            if l.observed_at > r.observed_at { l } else { r }
         },
         (true, false) => left?,
         _ => right?,
      };
      Some(chosen.adv.state())
   }

   fn merge(&mut self) -> Option<UpdateEvent> {
      let mut new = DeviceState::default();
      if let Some(s) = self.pick(|s| s.model.is_known()) {
         new.model = s.model;
      }
      if let Some(s) = self.pick(|s| s.pods.left.battery.is_available()) {
         new.pods.left = s.pods.left;
      }
      if let Some(s) = self.pick(|s| s.pods.right.battery.is_available()) {
         new.pods.right = s.pods.right;
      }
      if let Some(s) = self.pick(|s| s.case_box.battery.is_available()) {
         new.case_box = s.case_box;
      }

      if self.cached.as_ref() == Some(&new) {
         return None;
      }
      let old = self.cached.replace(new.clone());
      Some(UpdateEvent { old, new })
   }

   fn reset_all(&mut self) -> bool {
      self.slots = Sides::default();
      self.reset_deadlines = Sides::default();
      self.lost_deadline = None;
      self.cached.take().is_some()
   }
}

#[cfg(test)]
mod tests {
   use std::time::Duration;

   use bluer::Address;

   use super::*;
   use crate::airpods::{
      advertisement::tests::{payload, record},
      model::Model,
   };

   const ADDR_A: Address = Address([0x10, 0, 0, 0, 0, 0x01]);
   const ADDR_B: Address = Address([0x10, 0, 0, 0, 0, 0x02]);
   const PRO2: u16 = 0x2014;

   fn adv(side: Side, addr: Address, rssi: i16, left: u8, right: u8, case: u8) -> Advertisement {
      Advertisement::decode(&record(addr, rssi, payload(side, PRO2, left, right, case, 0))).unwrap()
   }

   fn reconciler() -> StateReconciler {
      StateReconciler::new(-80, ReconcilerConfig::default())
   }

   #[test]
   fn first_snapshot_emits_once() {
      let r = reconciler();
      let now = Instant::now();
      let ev = r.on_advertisement(adv(Side::Left, ADDR_A, -50, 5, 7, 3), now).unwrap();
      assert_eq!(ev.old, None);
      assert_eq!(ev.new.model, Model::AirPodsPro2);
      assert_eq!(ev.new.pods.left.battery.value(), Some(50));

      let again = r.on_advertisement(adv(Side::Left, ADDR_A, -52, 5, 7, 3), now);
      assert_eq!(again, None);
   }

   #[test]
   fn weak_signal_is_rejected() {
      let r = reconciler();
      assert!(
         r.on_advertisement(adv(Side::Left, ADDR_A, -90, 5, 7, 3), Instant::now())
            .is_none()
      );
      assert_eq!(r.current_state(), None);
   }

   #[test]
   fn rotated_address_with_battery_jump_is_rejected() {
      let r = reconciler();
      let now = Instant::now();
      r.on_advertisement(adv(Side::Left, ADDR_A, -50, 5, 7, 3), now).unwrap();
      let before = r.current_state();

      let jumped = adv(Side::Left, ADDR_B, -50, 7, 7, 3);
      assert_eq!(r.on_advertisement(jumped, now + Duration::from_secs(1)), None);
      assert_eq!(r.current_state(), before);

      let stepped = adv(Side::Left, ADDR_B, -50, 6, 7, 3);
      let ev = r.on_advertisement(stepped, now + Duration::from_secs(2)).unwrap();
      assert_eq!(ev.new.pods.left.battery.value(), Some(60));
   }

   #[test]
   fn rotated_address_with_other_model_is_rejected() {
      let r = reconciler();
      let now = Instant::now();
      r.on_advertisement(adv(Side::Left, ADDR_A, -50, 5, 7, 3), now).unwrap();
      let data = payload(Side::Left, 0x200e, 5, 7, 3, 0);
      let other = Advertisement::decode(&record(ADDR_B, -50, data)).unwrap();
      assert_eq!(r.on_advertisement(other, now), None);
   }

   #[test]
   fn other_side_rssi_gap_is_rejected() {
      let r = reconciler();
      let now = Instant::now();
      r.on_advertisement(adv(Side::Left, ADDR_A, -20, 5, 7, 3), now).unwrap();
      assert_eq!(r.on_advertisement(adv(Side::Right, ADDR_B, -75, 5, 7, 3), now), None);
   }

   #[test]
   fn merge_falls_back_to_only_available_source() {
      let r = reconciler();
      let now = Instant::now();
      r.on_advertisement(adv(Side::Left, ADDR_A, -50, 5, 7, 3), now).unwrap();

      // Right broadcast without a left reading.
      let ev = r
         .on_advertisement(adv(Side::Right, ADDR_B, -50, 15, 8, 3), now + Duration::from_secs(1))
         .unwrap();
      assert_eq!(ev.new.pods.left.battery.value(), Some(50));
      assert_eq!(ev.new.pods.right.battery.value(), Some(80));
   }

   #[test]
   fn left_and_right_merge_into_one_event() {
      let r = reconciler();
      let now = Instant::now();
      let first = r
         .on_advertisement(adv(Side::Left, ADDR_A, -50, 5, 15, 15), now)
         .unwrap();
      assert_eq!(first.new.pods.right.battery, Battery::UNAVAILABLE);

      let second = r
         .on_advertisement(adv(Side::Right, ADDR_B, -50, 15, 7, 15), now + Duration::from_secs(1))
         .unwrap();
      assert_eq!(second.new.pods.left.battery.value(), Some(50));
      assert_eq!(second.new.pods.right.battery.value(), Some(70));
      assert_eq!(second.old, Some(first.new));
   }

   #[test]
   fn stale_side_is_cleared_without_loss() {
      let r = reconciler();
      let now = Instant::now();
      r.on_advertisement(adv(Side::Left, ADDR_A, -50, 5, 15, 15), now).unwrap();
      let later = now + Duration::from_secs(6);
      r.on_advertisement(adv(Side::Right, ADDR_B, -50, 15, 7, 15), later).unwrap();

      // Left goes stale; right is still fresh.
      assert!(!r.poll_timers(now + Duration::from_secs(11)));

      // The next merge only sees the right side.
      let ev = r
         .on_advertisement(adv(Side::Right, ADDR_B, -50, 15, 6, 15), now + Duration::from_secs(12))
         .unwrap();
      assert_eq!(ev.new.pods.left.battery, Battery::UNAVAILABLE);
      assert_eq!(ev.new.pods.right.battery.value(), Some(60));
   }

   #[test]
   fn both_sides_stale_before_loss() {
      let r = StateReconciler::new(-80, ReconcilerConfig {
         stale_timeout_secs: 5,
         lost_timeout_secs: 30,
         ..Default::default()
      });
      let now = Instant::now();
      r.on_advertisement(adv(Side::Left, ADDR_A, -50, 5, 15, 15), now).unwrap();
      r.on_advertisement(adv(Side::Right, ADDR_B, -50, 15, 7, 15), now + Duration::from_secs(2))
         .unwrap();

      assert!(!r.poll_timers(now + Duration::from_secs(5)));
      assert!(!r.poll_timers(now + Duration::from_secs(7)));
      // Nothing left to merge, but the device is not lost yet.
      assert!(r.current_state().is_some());
      assert_eq!(r.next_deadline(), Some(now + Duration::from_secs(32)));

      // A new address is accepted since no slot remains to compare against.
      let ev = r
         .on_advertisement(adv(Side::Left, ADDR_B, -70, 4, 15, 15), now + Duration::from_secs(8))
         .unwrap();
      assert_eq!(ev.new.pods.left.battery.value(), Some(40));
      assert_eq!(ev.new.pods.right.battery, Battery::UNAVAILABLE);

      assert!(!r.poll_timers(now + Duration::from_secs(13)));
      assert!(r.poll_timers(now + Duration::from_secs(38)));
      assert_eq!(r.current_state(), None);
   }

   #[test]
   fn lost_timer_signals_once() {
      let r = reconciler();
      let now = Instant::now();
      r.on_advertisement(adv(Side::Left, ADDR_A, -50, 5, 7, 3), now).unwrap();
      assert_eq!(r.next_deadline(), Some(now + Duration::from_secs(10)));

      assert!(!r.poll_timers(now + Duration::from_secs(5)));
      assert!(r.poll_timers(now + Duration::from_secs(10)));
      assert_eq!(r.current_state(), None);
      assert_eq!(r.next_deadline(), None);
      assert!(!r.poll_timers(now + Duration::from_secs(30)));
   }

   #[test]
   fn disconnect_clears_everything() {
      let r = reconciler();
      assert!(!r.disconnect());
      r.on_advertisement(adv(Side::Left, ADDR_A, -50, 5, 7, 3), Instant::now()).unwrap();
      assert!(r.disconnect());
      assert_eq!(r.current_state(), None);
      assert_eq!(r.next_deadline(), None);
   }
}
