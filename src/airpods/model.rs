//! Device model identification.

use serde::{Deserialize, Serialize};

/// Known accessory models.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Default,
   Serialize,
   Deserialize,
   strum::Display,
   strum::IntoStaticStr,
)]
pub enum Model {
   #[default]
   #[strum(serialize = "Unknown")]
   Unknown,
   #[strum(serialize = "AirPods")]
   AirPods1,
   #[strum(serialize = "AirPods (2nd generation)")]
   AirPods2,
   #[strum(serialize = "AirPods (3rd generation)")]
   AirPods3,
   #[strum(serialize = "AirPods 4")]
   AirPods4,
   #[strum(serialize = "AirPods 4 (ANC)")]
   AirPods4Anc,
   #[strum(serialize = "AirPods Pro")]
   AirPodsPro,
   #[strum(serialize = "AirPods Pro (2nd generation)")]
   AirPodsPro2,
   #[strum(serialize = "AirPods Pro (2nd generation, USB-C)")]
   AirPodsPro2UsbC,
   #[strum(serialize = "AirPods Pro 3")]
   AirPodsPro3,
   #[strum(serialize = "AirPods Max")]
   AirPodsMax,
   #[strum(serialize = "AirPods Max (USB-C)")]
   AirPodsMaxUsbC,
   #[strum(serialize = "Powerbeats Pro")]
   PowerbeatsPro,
   #[strum(serialize = "Beats Solo Pro")]
   BeatsSoloPro,
   #[strum(serialize = "Beats Studio Buds")]
   BeatsStudioBuds,
   #[strum(serialize = "Beats Fit Pro")]
   BeatsFitPro,
   #[strum(serialize = "Beats Flex")]
   BeatsFlex,
}

/// Product ids as broadcast in proximity-pairing advertisements.
const PRODUCT_IDS: &[(u16, Model)] = &[
   (0x2002, Model::AirPods1),
   (0x200A, Model::AirPodsMax),
   (0x200B, Model::PowerbeatsPro),
   (0x200C, Model::BeatsSoloPro),
   (0x200E, Model::AirPodsPro),
   (0x200F, Model::AirPods2),
   (0x2010, Model::BeatsFlex),
   (0x2011, Model::BeatsStudioBuds),
   (0x2012, Model::BeatsFitPro),
   (0x2013, Model::AirPods3),
   (0x2014, Model::AirPodsPro2),
   (0x2019, Model::AirPods4),
   (0x201B, Model::AirPods4Anc),
   (0x201F, Model::AirPodsMaxUsbC),
   (0x2024, Model::AirPodsPro2UsbC),
   (0x2027, Model::AirPodsPro3),
];

/// Regulatory model numbers printed on the device.
const MODEL_NUMBERS: &[(&str, Model)] = &[
   ("A1523", Model::AirPods1),
   ("A1722", Model::AirPods1),
   ("A2031", Model::AirPods2),
   ("A2032", Model::AirPods2),
   ("A2564", Model::AirPods3),
   ("A2565", Model::AirPods3),
   ("A3050", Model::AirPods4),
   ("A3053", Model::AirPods4),
   ("A3054", Model::AirPods4),
   ("A3055", Model::AirPods4Anc),
   ("A3056", Model::AirPods4Anc),
   ("A3057", Model::AirPods4Anc),
   ("A2083", Model::AirPodsPro),
   ("A2084", Model::AirPodsPro),
   ("A2698", Model::AirPodsPro2),
   ("A2699", Model::AirPodsPro2),
   ("A2931", Model::AirPodsPro2),
   ("A3047", Model::AirPodsPro2UsbC),
   ("A3048", Model::AirPodsPro2UsbC),
   ("A3049", Model::AirPodsPro2UsbC),
   ("A3063", Model::AirPodsPro3),
   ("A3064", Model::AirPodsPro3),
   ("A3065", Model::AirPodsPro3),
   ("A2096", Model::AirPodsMax),
   ("A3184", Model::AirPodsMaxUsbC),
];

impl Model {
   pub fn from_product_id(id: u16) -> Self {
      PRODUCT_IDS
         .iter()
         .find(|(pid, _)| *pid == id)
         .map_or(Self::Unknown, |(_, m)| *m)
   }

   pub fn product_id(self) -> Option<u16> {
      PRODUCT_IDS
         .iter()
         .find(|(_, m)| *m == self)
         .map(|(pid, _)| *pid)
   }

   /// Resolves a model number such as `" a2699 "`, ignoring whitespace and case.
   pub fn from_model_number(number: &str) -> Self {
      let normalized: String = number
         .chars()
         .filter(|c| !c.is_whitespace())
         .map(|c| c.to_ascii_uppercase())
         .collect();
      MODEL_NUMBERS
         .iter()
         .find(|(n, _)| *n == normalized)
         .map_or(Self::Unknown, |(_, m)| *m)
   }

   pub const fn is_known(self) -> bool {
      !matches!(self, Self::Unknown)
   }

   /// Models that accept noise control over AAP.
   pub const fn supports_noise_control(self) -> bool {
      matches!(
         self,
         Self::AirPodsPro
            | Self::AirPodsPro2
            | Self::AirPodsPro2UsbC
            | Self::AirPodsPro3
            | Self::AirPods4Anc
            | Self::AirPodsMax
            | Self::AirPodsMaxUsbC
      )
   }

   pub fn display_name(self) -> &'static str {
      self.into()
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn model_numbers_normalize() {
      assert_eq!(Model::from_model_number(" a2699\n"), Model::AirPodsPro2);
      assert_eq!(Model::from_model_number("A3 184"), Model::AirPodsMaxUsbC);
      assert_eq!(Model::from_model_number("A9999"), Model::Unknown);
   }

   #[test]
   fn noise_control_support() {
      assert!(Model::AirPods4Anc.supports_noise_control());
      assert!(!Model::AirPods4.supports_noise_control());
      assert!(!Model::Unknown.supports_noise_control());
      assert_eq!(Model::from_product_id(0x2014), Model::AirPodsPro2);
      assert_eq!(Model::AirPodsPro2.product_id(), Some(0x2014));
   }
}
