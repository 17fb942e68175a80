//! Event handling system for device status updates.
//!
//! Every observable change in the service is one [`Event`] variant,
//! delivered through an [`EventBus`]. The AAP session, the orchestrator and
//! the D-Bus layer each only see this one enum.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::{
   airpods::{
      protocol::{BatteryInfo, EarStatus, HeadTrackingData, SettingValue, SpeakingLevel},
      state::DeviceState,
   },
   bluetooth::transport::TransportKind,
   config::Config,
};

/// Events that can be emitted by the service.
#[derive(Debug, Clone)]
pub enum Event {
   AapConnected(TransportKind),
   AapDisconnected,
   SettingChanged(SettingValue),
   SpeakingLevel(SpeakingLevel),
   EarDetection {
      primary: EarStatus,
      secondary: EarStatus,
   },
   AapBattery(BatteryInfo),
   HeadTracking(HeadTrackingData),
   StateChanged {
      old: Option<DeviceState>,
      new: DeviceState,
   },
   /// Broadcasts stopped; the UI should drop the device safely.
   DeviceLost,
   /// Case lid opened (`true`) or closed with both pods inside.
   LidChanged(bool),
   ScannerAvailability(bool),
   PreferencesChanged(Box<Config>),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, event: Event);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

/// Forwards events into an unbounded channel.
pub struct ChannelBus<T> {
   tx: mpsc::UnboundedSender<T>,
   wrap: fn(Event) -> T,
}

impl<T: Send + 'static> ChannelBus<T> {
   pub fn new(tx: mpsc::UnboundedSender<T>, wrap: fn(Event) -> T) -> EventSender {
      Arc::new(Self { tx, wrap })
   }
}

impl<T: Send + 'static> EventBus for ChannelBus<T> {
   fn emit(&self, event: Event) {
      // Receiver gone means shutdown is in progress.
      let _ = self.tx.send((self.wrap)(event));
   }
}
