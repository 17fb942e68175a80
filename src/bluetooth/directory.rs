//! Paired-device metadata lookup.
//!
//! The orchestrator only needs a handful of facts about the bound device:
//! its name, whatever model hints the platform exposes, and a stream of
//! connection-state changes. [`BluezDirectory`] answers these from BlueZ.

use std::str::FromStr;

use async_trait::async_trait;
use bluer::{Adapter, Address, Device, DeviceEvent, DeviceProperty, ErrorKind, Session};
use futures::{StreamExt, stream::BoxStream};
use log::{debug, trace};

use crate::{
   airpods::model::Model,
   error::{PodError, Result},
};

/// Apple's Bluetooth SIG vendor id, as seen in modalias.
pub const APPLE_VENDOR_ID: u32 = 0x004C;

/// What the platform knows about one paired device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
   pub address: Address,
   pub name: Option<String>,
   /// Apple model number such as `A2084`, when the platform exposes one.
   pub model_number: Option<String>,
   pub vendor_id: Option<u32>,
   pub product_id: Option<u16>,
   pub connected: bool,
}

impl DeviceInfo {
   /// Model implied by the platform metadata, if any.
   pub fn model_hint(&self) -> Option<Model> {
      let from_number = self
         .model_number
         .as_deref()
         .map(Model::from_model_number)
         .filter(|m| m.is_known());
      let from_product = self
         .product_id
         .filter(|_| self.vendor_id == Some(APPLE_VENDOR_ID))
         .map(Model::from_product_id)
         .filter(|m| m.is_known());
      from_number.or(from_product)
   }

   /// Apple audio accessories are the only devices worth binding.
   pub fn is_supported_accessory(&self) -> bool {
      self.vendor_id == Some(APPLE_VENDOR_ID) && self.model_hint().is_some()
   }
}

/// The adapter BlueZ would pick by default.
pub async fn default_adapter(session: &Session) -> Result<Adapter> {
   session.default_adapter().await.map_err(adapter_error)
}

fn adapter_error(e: bluer::Error) -> PodError {
   match e.kind {
      ErrorKind::NotFound => PodError::AdapterNotAvailable,
      _ => e.into(),
   }
}

/// Source of paired-device metadata.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
   async fn lookup(&self, address: Address) -> Option<DeviceInfo>;

   /// Yields the device's connection state every time it changes.
   async fn watch_connection(&self, address: Address) -> Result<BoxStream<'static, bool>>;

   /// Paired devices that look like supported accessories.
   async fn paired_accessories(&self) -> Vec<DeviceInfo>;
}

/// [`DeviceDirectory`] backed by BlueZ.
pub struct BluezDirectory {
   session: Session,
}

impl BluezDirectory {
   pub const fn new(session: Session) -> Self {
      Self { session }
   }

   async fn device(&self, address: Address) -> Result<Device> {
      Ok(default_adapter(&self.session).await?.device(address)?)
   }

   async fn describe(device: &Device) -> DeviceInfo {
      let name = match device.name().await {
         Ok(Some(name)) => Some(name),
         _ => device.alias().await.ok(),
      };
      let modalias = device.modalias().await.ok().flatten();
      DeviceInfo {
         address: device.address(),
         name,
         model_number: None,
         vendor_id: modalias.as_ref().map(|m| m.vendor),
         product_id: modalias.and_then(|m| u16::try_from(m.product).ok()),
         connected: device.is_connected().await.unwrap_or(false),
      }
   }
}

#[async_trait]
impl DeviceDirectory for BluezDirectory {
   async fn lookup(&self, address: Address) -> Option<DeviceInfo> {
      match self.device(address).await {
         Ok(device) => Some(Self::describe(&device).await),
         Err(e) => {
            debug!("Lookup of {address} failed: {e}");
            None
         },
      }
   }

   async fn watch_connection(&self, address: Address) -> Result<BoxStream<'static, bool>> {
      let device = self.device(address).await?;
      let events = device.events().await?;
      Ok(events
         .filter_map(|event| async move {
            match event {
               DeviceEvent::PropertyChanged(DeviceProperty::Connected(connected)) => {
                  Some(connected)
               },
               _ => None,
            }
         })
         .boxed())
   }

   async fn paired_accessories(&self) -> Vec<DeviceInfo> {
      let Ok(adapter) = default_adapter(&self.session).await else {
         return Vec::new();
      };
      let Ok(addresses) = adapter.device_addresses().await else {
         return Vec::new();
      };

      let mut found = Vec::new();
      for address in addresses {
         let Ok(device) = adapter.device(address) else {
            continue;
         };
         if !device.is_paired().await.unwrap_or(false) {
            continue;
         }
         let info = Self::describe(&device).await;
         trace!(
            "Paired device {address}: vendor={:?} product={:?} name={:?}",
            info.vendor_id, info.product_id, info.name
         );
         if info.is_supported_accessory() {
            found.push(info);
         }
      }
      found
   }
}

/// Parses a bound-device string from the config.
pub fn parse_address(s: &str) -> Option<Address> {
   Address::from_str(s.trim()).ok()
}

#[cfg(test)]
mod tests {
   use super::*;

   fn info(vendor_id: Option<u32>, product_id: Option<u16>, model_number: Option<&str>) -> DeviceInfo {
      DeviceInfo {
         address: Address([1, 2, 3, 4, 5, 6]),
         name: Some("Living Room".into()),
         model_number: model_number.map(Into::into),
         vendor_id,
         product_id,
         connected: false,
      }
   }


   #[test]
   fn missing_adapter_is_reported_as_such() {
      let none = bluer::Error {
         kind: ErrorKind::NotFound,
         message: String::new(),
      };
      assert!(matches!(adapter_error(none), PodError::AdapterNotAvailable));

      let busy = bluer::Error {
         kind: ErrorKind::NotReady,
         message: "busy".into(),
      };
      assert!(matches!(adapter_error(busy), PodError::Bluetooth(_)));
   }
   #[test]
   fn model_number_wins_over_product_id() {
      let pro2 = Model::AirPodsPro2.product_id();
      let device = info(Some(APPLE_VENDOR_ID), pro2, Some("A2084"));
      assert_eq!(device.model_hint(), Some(Model::AirPodsPro));
   }

   #[test]
   fn product_id_needs_apple_vendor() {
      let pro = Model::AirPodsPro.product_id();
      assert_eq!(info(Some(APPLE_VENDOR_ID), pro, None).model_hint(), Some(Model::AirPodsPro));
      assert_eq!(info(Some(0x1234), pro, None).model_hint(), None);
      assert!(!info(Some(APPLE_VENDOR_ID), Some(0x0001), None).is_supported_accessory());
   }

   #[test]
   fn parses_bound_address() {
      assert_eq!(
         parse_address(" AA:BB:CC:DD:EE:FF "),
         Some(Address([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]))
      );
      assert_eq!(parse_address("nope"), None);
   }
}
